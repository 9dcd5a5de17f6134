//! WebSocket transport for the engine protocol.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::EngineError;
use super::client::EngineTransport;
use super::wire::{EngineReply, EngineRequest};

/// Opens a connection per request, sends the frame and waits for the reply
/// carrying the same id. No timeout is applied here.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EngineTransport for WebSocketTransport {
    async fn round_trip(&self, request: EngineRequest) -> Result<EngineReply, EngineError> {
        let (mut ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| EngineError::Transport(format!("connect to {} failed: {}", self.url, e)))?;

        let id = request.id;
        let text = serde_json::to_string(&request).map_err(|e| EngineError::Transport(e.to_string()))?;
        ws_stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        debug!(id, url = %self.url, "engine request sent");

        let reply = loop {
            match ws_stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let reply: EngineReply = serde_json::from_str(text.as_str())
                        .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;
                    if reply.id == id {
                        break reply;
                    }
                    warn!(expected = id, got = reply.id, "ignoring reply for another request");
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(EngineError::Transport("connection closed before reply".to_string()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(EngineError::Transport(e.to_string())),
            }
        };

        // The reply is already in hand; a failed close changes nothing
        let _ = ws_stream.close(None).await;
        Ok(reply)
    }
}
