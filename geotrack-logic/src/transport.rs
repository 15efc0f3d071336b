use crate::prelude::*;

#[derive(Clone, PartialEq, Eq)]
/// Credentials attached to every link opened by a [FeedTransport]
pub struct Credentials {
    pub bearer_token: String,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: token.into(),
        }
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.bearer_token)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A message delivered on a subscribed topic
pub struct FeedMessage {
    pub topic: String,
    pub body: String,
}

impl FeedMessage {
    pub fn new(topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
        }
    }
}

/// Something that can open links to the backend's message broker
pub trait FeedTransport: Send + Sync + 'static {
    type Link: FeedLink;

    /// Open a new link and complete the connection handshake using `credentials`.
    fn open(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Self::Link>> + Send;
}

/// A single established connection to the message broker, it's dropped and a new one
/// opened whenever the connection is lost.
pub trait FeedLink: Send + 'static {
    /// Subscribe to messages broadcast on `topic`
    fn subscribe(&mut self, topic: &str) -> impl Future<Output = Result> + Send;
    /// Send `body` (JSON) to `destination`
    fn send(&mut self, destination: &str, body: String) -> impl Future<Output = Result> + Send;
    /// Wait for the next message on any subscribed topic. `Ok(None)` means the remote closed
    /// the link. Must be cancel safe.
    fn receive(&mut self) -> impl Future<Output = Result<Option<FeedMessage>>> + Send;
    /// Gracefully close the link
    fn close(self) -> impl Future<Output = ()> + Send;
}
