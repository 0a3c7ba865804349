//! WebSocket connection establishment and URL assembly.

use crate::{
    compression::CompressionAlgorithm,
    error::{ConnectError, ConnectErrorType},
};
use std::fmt::Write;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::protocol::WebSocketConfig, MaybeTlsStream, WebSocketStream,
};

/// Stream of a live gateway connection.
pub type Connection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration used for Websocket connections.
///
/// `max_frame_size` and `max_message_size` limits are disabled because the
/// gateway is not a malicious actor, and the largest payloads arrive right at
/// session start.
const WEBSOCKET_CONFIG: WebSocketConfig = WebSocketConfig {
    accept_unmasked_frames: false,
    max_frame_size: None,
    max_message_size: None,
    max_send_queue: None,
};

/// Assemble a connection URL with version, encoding, and compression
/// parameters.
pub(crate) fn configure_url(
    base: &str,
    version: u8,
    compression: Option<CompressionAlgorithm>,
) -> String {
    let mut url = String::with_capacity(base.len() + 64);
    url.push_str(base.trim_end_matches('/'));

    write!(url, "/?v={version}&encoding=json").expect("writing to a string is infallible");

    if let Some(algorithm) = compression {
        url.push_str("&compress=");
        url.push_str(algorithm.query_value());
    }

    url
}

/// Open a WebSocket connection to a fully configured gateway URL.
///
/// # Errors
///
/// Returns a [`ConnectErrorType::Establishing`] error type if the TCP, TLS,
/// or WebSocket handshake failed.
pub(crate) async fn connect(url: &str) -> Result<Connection, ConnectError> {
    tracing::debug!(%url, "shaking hands with remote");

    let (stream, _) = tokio_tungstenite::connect_async_with_config(url, Some(WEBSOCKET_CONFIG))
        .await
        .map_err(|source| ConnectError {
            kind: ConnectErrorType::Establishing,
            source: Some(Box::new(source)),
        })?;

    tracing::debug!(%url, "shook hands with remote");

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::configure_url;

    #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
    use crate::compression::CompressionAlgorithm;

    #[test]
    fn plain_url() {
        assert_eq!(
            "wss://gateway.discord.gg/?v=10&encoding=json",
            configure_url("wss://gateway.discord.gg", 10, None),
        );
    }

    #[test]
    fn trailing_slash_is_not_doubled() {
        assert_eq!(
            "wss://gateway.discord.gg/?v=9&encoding=json",
            configure_url("wss://gateway.discord.gg/", 9, None),
        );
    }

    #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
    #[test]
    fn compressed_url() {
        assert_eq!(
            "wss://gateway.discord.gg/?v=10&encoding=json&compress=zlib-stream",
            configure_url(
                "wss://gateway.discord.gg",
                10,
                Some(CompressionAlgorithm::Zlib),
            ),
        );
    }
}
