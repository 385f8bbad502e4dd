//! Token transports: the chunked-response reader (primary) and the persistent socket (fallback).
//!
//! Both implement [`TokenTransport`]: tokens are handed to `on_token` in arrival order,
//! and the returned [`StreamEnd`] or [`StreamError`] reports how the stream finished.

mod chunked;
mod retry;
mod socket;

pub use chunked::{parse_frame, ChunkedReader, Frame, FrameDecoder};
pub use retry::ReconnectPolicy;
pub use socket::{SocketStream, DONE_SENTINEL};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// How a stream finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Explicit done signal, or the body ended cleanly.
    Done,
    /// The caller cancelled; no error is reported.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("stream failed: HTTP {0}")]
    Status(u16),
    #[error("stream failed: empty body")]
    EmptyBody,
    #[error("stream read failed: {0}")]
    Read(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("socket reconnect limit reached after {0} attempts")]
    ReconnectLimit(u32),
    #[error("stream aborted")]
    Cancelled,
}

/// Token callback. Declared outside `#[async_trait]` so the `&str` stays higher-ranked.
pub type OnToken<'a> = dyn for<'t> FnMut(&'t str) + Send + 'a;

/// Incremental token delivery for one thread.
#[async_trait]
pub trait TokenTransport: Send + Sync {
    /// Short name for logs ("chunked", "socket").
    fn name(&self) -> &'static str;

    /// Stream tokens for the thread at `path`, calling `on_token` for each one in order.
    async fn stream(
        &self,
        path: &str,
        on_token: &mut OnToken<'_>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, StreamError>;
}

/// Path of the chunked stream endpoint for a thread (relative to the API base).
pub fn chunked_path(thread_id: &str) -> String {
    format!("/chat/threads/{}/stream", encode_segment(thread_id))
}

/// Path of the socket endpoint for a thread (relative to the WebSocket base).
pub fn socket_path(thread_id: &str) -> String {
    format!("/ws/chat/{}", encode_segment(thread_id))
}

/// Percent-encode one path segment (RFC 3986 unreserved characters pass through).
pub(crate) fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_paths_encode_the_id() {
        assert_eq!(chunked_path("t-1"), "/chat/threads/t-1/stream");
        assert_eq!(socket_path("a b/c"), "/ws/chat/a%20b%2Fc");
    }
}
