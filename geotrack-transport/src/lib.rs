mod frames;
mod rest;
mod server;
mod stomp;

pub use rest::{BackendClient, GoogleGeocoder, LoginSession};
pub use server::{BACKEND_HTTP_URL, FEED_WEBSOCKET_URL, feed_url_for};
pub use stomp::{StompLink, StompTransport};
