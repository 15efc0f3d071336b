const BACKEND_HOST: &str = match option_env!("GEOTRACK_BACKEND_HOST") {
    Some(host) => host,
    None => "localhost",
};

const BACKEND_PORT: u16 = match option_env!("GEOTRACK_BACKEND_PORT") {
    Some(port) => const_str::parse!(port, u16),
    None => 8080,
};

/// `true` or `1` switches to https and wss
const BACKEND_SECURE: bool = match option_env!("GEOTRACK_BACKEND_SECURE") {
    Some(flag) => const_str::eq_ignore_ascii_case!(flag, "true") || const_str::equal!(flag, "1"),
    None => false,
};

const HTTP_SCHEME: &str = if BACKEND_SECURE { "https" } else { "http" };
const WS_SCHEME: &str = if BACKEND_SECURE { "wss" } else { "ws" };

const BACKEND_AUTHORITY: &str = const_str::concat!(BACKEND_HOST, ":", BACKEND_PORT);

/// Path of the raw WebSocket variant of the backend's SockJS endpoint
const FEED_PATH: &str = "/ws/websocket";

/// Default REST base of the backend, set at build time
pub const BACKEND_HTTP_URL: &str = const_str::concat!(HTTP_SCHEME, "://", BACKEND_AUTHORITY);

/// Default location feed endpoint, set at build time
pub const FEED_WEBSOCKET_URL: &str =
    const_str::concat!(WS_SCHEME, "://", BACKEND_AUTHORITY, FEED_PATH);

/// Derive the feed endpoint for a backend given by its HTTP base URL.
pub fn feed_url_for(backend_http_url: &str) -> String {
    let base = backend_http_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}{FEED_PATH}")
}
