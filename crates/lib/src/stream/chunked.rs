//! Chunked-response reader: one GET, body read incrementally and split into
//! `event:`/`data:` frames separated by a blank line. `event: done` ends the stream.

use super::{OnToken, StreamEnd, StreamError, TokenTransport};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

const DONE_EVENT: &str = "done";

/// One decoded frame. Multiple `data:` lines are joined with `\n`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: Option<String>,
}

impl Frame {
    pub fn is_done(&self) -> bool {
        self.event.as_deref() == Some(DONE_EVENT)
    }
}

/// Parse one frame (text between blank-line separators). Returns None for frames with neither event nor data.
pub fn parse_frame(block: &str) -> Option<Frame> {
    let mut event = None;
    let mut data: Option<String> = None;
    for line in block.split('\n') {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            let value = rest.strip_prefix(' ').unwrap_or(rest);
            match data {
                Some(ref mut d) => {
                    d.push('\n');
                    d.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
    }
    if event.is_none() && data.is_none() {
        return None;
    }
    Some(Frame { event, data })
}

/// Byte buffer that yields complete frames as chunks arrive. Frame boundaries are ASCII,
/// so multi-byte characters split across chunks are reassembled before decoding.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Append a chunk and return every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos).collect();
            self.buffer.drain(..2);
            let block = String::from_utf8_lossy(&block);
            if let Some(frame) = parse_frame(&block) {
                frames.push(frame);
            }
        }
        frames
    }
}

/// Primary transport: GET `{base_url}{path}` and read the body as frames.
#[derive(Clone)]
pub struct ChunkedReader {
    client: reqwest::Client,
    base_url: String,
}

impl ChunkedReader {
    /// `client` should carry the default headers (workspace, auth) and no request timeout.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TokenTransport for ChunkedReader {
    fn name(&self) -> &'static str {
        "chunked"
    }

    async fn stream(
        &self,
        path: &str,
        on_token: &mut OnToken<'_>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, StreamError> {
        let url = format!("{}{}", self.base_url, path);
        let request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send();
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            res = request => res?,
        };
        if !res.status().is_success() {
            return Err(StreamError::Status(res.status().as_u16()));
        }

        let mut body = res.bytes_stream();
        let mut decoder = FrameDecoder::default();
        let mut received = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| StreamError::Read(e.to_string()))?;
            received += chunk.len();
            for frame in decoder.push(&chunk) {
                if frame.is_done() {
                    return Ok(StreamEnd::Done);
                }
                if let Some(data) = frame.data.as_deref().filter(|d| !d.is_empty()) {
                    on_token(data);
                }
            }
        }
        if received == 0 {
            return Err(StreamError::EmptyBody);
        }
        log::debug!("chunked stream ended without done frame: {}", url);
        Ok(StreamEnd::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_event_and_multiline_data() {
        let f = parse_frame("event: token\ndata: line one\ndata: line two").unwrap();
        assert_eq!(f.event.as_deref(), Some("token"));
        assert_eq!(f.data.as_deref(), Some("line one\nline two"));
        assert!(!f.is_done());
    }

    #[test]
    fn parse_keeps_token_whitespace_after_single_space() {
        let f = parse_frame("data:  world").unwrap();
        assert_eq!(f.data.as_deref(), Some(" world"));
        let f = parse_frame("data:Hi\r").unwrap();
        assert_eq!(f.data.as_deref(), Some("Hi"));
    }

    #[test]
    fn parse_done_and_empty_frames() {
        assert!(parse_frame("event: done").unwrap().is_done());
        assert_eq!(parse_frame(": comment"), None);
        assert_eq!(parse_frame(""), None);
    }

    #[test]
    fn decoder_waits_for_frame_boundary() {
        let mut d = FrameDecoder::default();
        assert!(d.push(b"data: He").is_empty());
        assert!(d.push(b"llo\n").is_empty());
        let frames = d.push(b"\ndata: next\n\nevent: done\n\n");
        let data: Vec<_> = frames.iter().map(|f| f.data.clone()).collect();
        assert_eq!(
            data,
            vec![Some("Hello".to_string()), Some("next".to_string()), None]
        );
        assert!(frames[2].is_done());
    }

    #[test]
    fn decoder_reassembles_split_utf8() {
        let mut d = FrameDecoder::default();
        let bytes = "data: привет\n\n".as_bytes();
        let (a, b) = bytes.split_at(9);
        assert!(d.push(a).is_empty());
        let frames = d.push(b);
        assert_eq!(frames[0].data.as_deref(), Some("привет"));
    }
}
