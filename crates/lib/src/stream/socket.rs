//! Persistent socket transport: text frames are tokens, `__DONE__` completes.
//! Unexpected closes reconnect according to a [`ReconnectPolicy`]; socket errors are terminal.

use super::{OnToken, ReconnectPolicy, StreamEnd, StreamError, TokenTransport};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// Text frame that marks the end of a reply.
pub const DONE_SENTINEL: &str = "__DONE__";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How one connection ended.
enum Pump {
    Done,
    Cancelled,
    Closed,
}

/// Fallback transport over a WebSocket at `{ws_base}{path}`.
#[derive(Clone)]
pub struct SocketStream {
    ws_base: String,
    policy: ReconnectPolicy,
    workspace_id: Option<String>,
    auth_token: Option<String>,
}

impl SocketStream {
    pub fn new(ws_base: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            ws_base: ws_base.into().trim_end_matches('/').to_string(),
            policy,
            workspace_id: None,
            auth_token: None,
        }
    }

    pub fn with_workspace(mut self, workspace_id: Option<String>) -> Self {
        self.workspace_id = workspace_id;
        self
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    async fn connect(&self, url: &str) -> Result<Ws, StreamError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| StreamError::Socket(e.to_string()))?;
        let headers = request.headers_mut();
        if let Some(ref ws) = self.workspace_id {
            if let Ok(v) = HeaderValue::from_str(ws) {
                headers.insert("X-Workspace-ID", v);
            }
        }
        if let Some(ref token) = self.auth_token {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert("Authorization", v);
            }
        }
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| StreamError::Socket(e.to_string()))?;
        Ok(ws)
    }

    /// Read frames until done, cancel or close. Socket errors are returned as errors.
    async fn pump(
        ws: &mut Ws,
        on_token: &mut OnToken<'_>,
        cancel: &CancellationToken,
    ) -> Result<Pump, StreamError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Pump::Cancelled),
                next = ws.next() => next,
            };
            match next {
                None => return Ok(Pump::Closed),
                Some(Ok(Message::Text(text))) => {
                    if text == DONE_SENTINEL {
                        return Ok(Pump::Done);
                    }
                    on_token(text.as_str());
                }
                Some(Ok(Message::Close(_))) => return Ok(Pump::Closed),
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed))
                | Some(Err(WsError::AlreadyClosed))
                | Some(Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake))) => {
                    return Ok(Pump::Closed)
                }
                Some(Err(e)) => return Err(StreamError::Socket(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl TokenTransport for SocketStream {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn stream(
        &self,
        path: &str,
        on_token: &mut OnToken<'_>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, StreamError> {
        let url = format!("{}{}", self.ws_base, path);
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }
            attempts += 1;
            let mut ws = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                ws = self.connect(&url) => ws?,
            };
            log::debug!("socket: connected to {} (attempt {})", url, attempts);

            match Self::pump(&mut ws, on_token, cancel).await? {
                Pump::Done => {
                    let _ = ws.close(None).await;
                    return Ok(StreamEnd::Done);
                }
                Pump::Cancelled => {
                    let _ = ws.close(None).await;
                    return Ok(StreamEnd::Cancelled);
                }
                Pump::Closed => {
                    let Some(delay) = self.policy.delay_after(attempts) else {
                        log::warn!("socket: reconnect limit reached for {}", url);
                        return Err(StreamError::ReconnectLimit(attempts));
                    };
                    log::warn!(
                        "socket: closed unexpectedly, reconnecting in {} ms",
                        delay.as_millis()
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
