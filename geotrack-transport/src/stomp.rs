use std::collections::{HashMap, VecDeque};

use anyhow::{anyhow, bail};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, http::Uri},
};

use geotrack_logic::{Credentials, FeedLink, FeedMessage, FeedTransport, prelude::*};

use crate::frames::{FrameDecoder, StompFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens STOMP 1.2 sessions over a WebSocket
pub struct StompTransport {
    url: String,
}

impl StompTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn host(&self) -> Result<String> {
        let uri = self.url.parse::<Uri>().context("Invalid feed URL")?;
        uri.host()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Feed URL {} has no host", self.url))
    }
}

impl FeedTransport for StompTransport {
    type Link = StompLink;

    async fn open(&self, credentials: &Credentials) -> Result<StompLink> {
        let host = self.host()?;

        debug!("Opening feed socket to {}", self.url);
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .context("Failed to open feed socket")?;

        let mut link = StompLink {
            socket,
            decoder: FrameDecoder::default(),
            pending: VecDeque::new(),
            subscriptions: HashMap::new(),
            next_subscription: 0,
        };

        let connect = StompFrame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", "0,0")
            .header("Authorization", credentials.authorization_header());

        link.write(connect).await?;

        match link.next_frame().await? {
            Some(frame) if frame.command == "CONNECTED" => {
                info!(
                    "STOMP session established (version {})",
                    frame.get("version").unwrap_or("unknown")
                );
                Ok(link)
            }
            Some(frame) if frame.command == "ERROR" => {
                bail!("Broker refused connection: {}", describe_error(&frame))
            }
            Some(frame) => bail!("Expected CONNECTED, got {}", frame.command),
            None => bail!("Feed socket closed during handshake"),
        }
    }
}

fn describe_error(frame: &StompFrame) -> String {
    match (frame.get("message"), frame.body.trim()) {
        (Some(message), "") => message.to_string(),
        (Some(message), body) => format!("{message} ({body})"),
        (None, "") => "no details".to_string(),
        (None, body) => body.to_string(),
    }
}

/// An established STOMP session
pub struct StompLink {
    socket: Socket,
    decoder: FrameDecoder,
    pending: VecDeque<StompFrame>,
    /// Subscription id to the destination it was made for
    subscriptions: HashMap<String, String>,
    next_subscription: u64,
}

impl StompLink {
    async fn write(&mut self, frame: StompFrame) -> Result {
        self.socket
            .send(Message::text(frame.encode()))
            .await
            .with_context(|| format!("Failed to send {} frame", frame.command))
    }

    /// Next complete frame, [None] once the socket is closed.
    /// Only awaits the socket itself, so dropping this mid-way loses nothing.
    async fn next_frame(&mut self) -> Result<Option<StompFrame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }

            let Some(msg) = self.socket.next().await else {
                return Ok(None);
            };

            match msg.context("Feed socket error")? {
                Message::Text(text) => {
                    self.pending.extend(self.decoder.push(text.as_str())?);
                }
                Message::Binary(bytes) => {
                    let text = std::str::from_utf8(&bytes).context("Binary frame isn't UTF-8")?;
                    self.pending.extend(self.decoder.push(text)?);
                }
                Message::Close(close) => {
                    debug!("Feed socket closed by server: {close:?}");
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

impl FeedLink for StompLink {
    async fn subscribe(&mut self, topic: &str) -> Result {
        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;

        let frame = StompFrame::new("SUBSCRIBE")
            .header("id", id.as_str())
            .header("destination", topic)
            .header("ack", "auto");

        self.write(frame).await?;
        debug!("Subscribed to {topic} as {id}");
        self.subscriptions.insert(id, topic.to_string());
        Ok(())
    }

    async fn send(&mut self, destination: &str, body: String) -> Result {
        let frame = StompFrame::new("SEND")
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", body.len().to_string())
            .body(body);

        self.write(frame).await
    }

    async fn receive(&mut self) -> Result<Option<FeedMessage>> {
        loop {
            let Some(frame) = self.next_frame().await? else {
                return Ok(None);
            };

            match frame.command.as_str() {
                "MESSAGE" => {
                    let topic = frame
                        .get("subscription")
                        .and_then(|id| self.subscriptions.get(id))
                        .map(String::as_str)
                        .or_else(|| frame.get("destination"));

                    let Some(topic) = topic else {
                        warn!("Dropping MESSAGE frame with no destination");
                        continue;
                    };

                    return Ok(Some(FeedMessage::new(topic, frame.body.clone())));
                }
                "ERROR" => bail!("Broker sent error: {}", describe_error(&frame)),
                other => debug!("Ignoring {other} frame"),
            }
        }
    }

    async fn close(mut self) {
        if let Err(why) = self.write(StompFrame::new("DISCONNECT")).await {
            debug!("Couldn't send DISCONNECT: {why:?}");
        }
        if let Err(why) = self.socket.close(None).await {
            debug!("Couldn't close feed socket cleanly: {why:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tokio::{net::TcpListener, sync::mpsc, test, time::timeout};
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(5);

    /// A one-connection broker, frames the client sends come out of `received` and
    /// anything pushed with [Broker::reply] goes back to the client
    struct Broker {
        url: String,
        received: mpsc::UnboundedReceiver<StompFrame>,
        outgoing: mpsc::UnboundedSender<String>,
    }

    async fn start_broker() -> Broker {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("No local addr");
        let (rtx, received) = mpsc::unbounded_channel();
        let (outgoing, mut orx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("Failed to accept");
            let mut ws = accept_async(stream).await.expect("Handshake failed");
            let mut decoder = FrameDecoder::default();

            loop {
                tokio::select! {
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            for frame in decoder.push(text.as_str()).expect("Bad frame from client") {
                                if rtx.send(frame).is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                        Some(Ok(_)) => {}
                    },

                    out = orx.recv() => match out {
                        Some(raw) => {
                            if ws.send(Message::text(raw)).await.is_err() {
                                return;
                            }
                        }
                        None => {
                            let _ = ws.close(None).await;
                            return;
                        }
                    },
                }
            }
        });

        Broker {
            url: format!("ws://{addr}/ws/websocket"),
            received,
            outgoing,
        }
    }

    impl Broker {
        async fn next_frame(&mut self) -> StompFrame {
            timeout(WAIT, self.received.recv())
                .await
                .expect("Timed out waiting for a frame")
                .expect("Broker went away")
        }

        fn reply(&self, frame: StompFrame) {
            self.outgoing
                .send(frame.encode())
                .expect("Broker went away");
        }
    }

    fn connected() -> StompFrame {
        StompFrame::new("CONNECTED").header("version", "1.2")
    }

    async fn handshake(broker: &mut Broker, answer: StompFrame) -> (Result<StompLink>, StompFrame) {
        let transport = StompTransport::new(broker.url.clone());
        let credentials = Credentials::bearer("tok");
        tokio::join!(transport.open(&credentials), async {
            let connect = broker.next_frame().await;
            broker.reply(answer);
            connect
        })
    }

    async fn receive(link: &mut StompLink) -> Result<Option<FeedMessage>> {
        timeout(WAIT, link.receive())
            .await
            .expect("Timed out waiting for a message")
    }

    #[test]
    async fn test_handshake_sends_bearer() {
        let mut broker = start_broker().await;
        let (link, connect) = handshake(&mut broker, connected()).await;

        assert!(link.is_ok(), "Handshake failed: {:?}", link.err());
        assert_eq!(connect.command, "CONNECT");
        assert_eq!(connect.get("accept-version"), Some("1.2"));
        assert_eq!(connect.get("host"), Some("127.0.0.1"));
        assert_eq!(connect.get("heart-beat"), Some("0,0"));
        assert_eq!(connect.get("Authorization"), Some("Bearer tok"));
    }

    #[test]
    async fn test_broker_refuses_connect() {
        let mut broker = start_broker().await;
        let refusal = StompFrame::new("ERROR").header("message", "Invalid token");
        let (link, _) = handshake(&mut broker, refusal).await;

        let err = link.err().expect("Connected despite ERROR");
        assert!(err.to_string().contains("Invalid token"), "{err}");
    }

    #[test]
    async fn test_unexpected_handshake_frame() {
        let mut broker = start_broker().await;
        let receipt = StompFrame::new("RECEIPT").header("receipt-id", "1");
        let (link, _) = handshake(&mut broker, receipt).await;

        let err = link.err().expect("Connected without CONNECTED");
        assert!(err.to_string().contains("Expected CONNECTED"), "{err}");
    }

    #[test]
    async fn test_subscriptions_resolve_topics() {
        let mut broker = start_broker().await;
        let (link, _) = handshake(&mut broker, connected()).await;
        let mut link = link.expect("Handshake failed");

        link.subscribe("/topic/location").await.expect("Failed to subscribe");
        link.subscribe("/topic/alerts").await.expect("Failed to subscribe");

        let first = broker.next_frame().await;
        assert_eq!(first.command, "SUBSCRIBE");
        assert_eq!(first.get("id"), Some("sub-0"));
        assert_eq!(first.get("destination"), Some("/topic/location"));
        let second = broker.next_frame().await;
        assert_eq!(second.get("id"), Some("sub-1"));
        assert_eq!(second.get("destination"), Some("/topic/alerts"));

        // Subscription id wins over whatever destination the broker reports
        broker.reply(
            StompFrame::new("MESSAGE")
                .header("subscription", "sub-0")
                .header("destination", "/topic/location-user123")
                .body(r#"{"latitude":1}"#),
        );
        // Not a message, skipped
        broker.reply(StompFrame::new("RECEIPT").header("receipt-id", "9"));
        // Unknown subscription, falls back to the destination
        broker.reply(
            StompFrame::new("MESSAGE")
                .header("destination", "/topic/raw")
                .body("hi"),
        );

        let msg = receive(&mut link).await.expect("Receive failed").expect("Link closed");
        assert_eq!(msg, FeedMessage::new("/topic/location", r#"{"latitude":1}"#));

        let msg = receive(&mut link).await.expect("Receive failed").expect("Link closed");
        assert_eq!(msg, FeedMessage::new("/topic/raw", "hi"));
    }

    #[test]
    async fn test_send_is_json() {
        let mut broker = start_broker().await;
        let (link, _) = handshake(&mut broker, connected()).await;
        let mut link = link.expect("Handshake failed");

        let body = r#"{"latitude":1.0,"longitude":2.0,"device":{"deviceId":"dev-1"}}"#;
        link.send("/app/update-location", body.to_string())
            .await
            .expect("Failed to send");

        let frame = broker.next_frame().await;
        assert_eq!(frame.command, "SEND");
        assert_eq!(frame.get("destination"), Some("/app/update-location"));
        assert_eq!(frame.get("content-type"), Some("application/json"));
        assert_eq!(frame.get("content-length"), Some(body.len().to_string().as_str()));
        assert_eq!(frame.body, body);
    }

    #[test]
    async fn test_error_frame_loses_link() {
        let mut broker = start_broker().await;
        let (link, _) = handshake(&mut broker, connected()).await;
        let mut link = link.expect("Handshake failed");

        broker.reply(StompFrame::new("ERROR").header("message", "Session expired"));

        let err = receive(&mut link).await.expect_err("ERROR frame wasn't an error");
        assert!(err.to_string().contains("Session expired"), "{err}");
    }

    #[test]
    async fn test_server_close_ends_link() {
        let mut broker = start_broker().await;
        let (link, _) = handshake(&mut broker, connected()).await;
        let mut link = link.expect("Handshake failed");

        drop(broker.outgoing);

        let res = receive(&mut link).await;
        assert!(!matches!(res, Ok(Some(_))), "Got a message after close: {res:?}");
    }

    #[test]
    async fn test_close_sends_disconnect() {
        let mut broker = start_broker().await;
        let (link, _) = handshake(&mut broker, connected()).await;
        let link = link.expect("Handshake failed");

        link.close().await;

        let frame = broker.next_frame().await;
        assert_eq!(frame.command, "DISCONNECT");
    }
}
