//! Relay client for channels served by another sync server.
//!
//! Each relayed channel gets its own upstream WebSocket. Messages arriving
//! for the channel are republished into the local channel; upstream errors
//! become channel errors.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use qs_wire::frame::{encode_auth, encode_channel_subscribe};
use qs_wire::{fingerprint, ChannelMode, OutgoingFrame, Payload};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::channel::ChannelEmitter;
use crate::ports::{CloseHandle, FunctionError, UpstreamClient};

/// What one upstream frame means for the local channel.
#[derive(Debug, PartialEq)]
enum Relayed {
    Message(Payload),
    Error(FunctionError),
    /// Upstream is going away
    Closed(String),
    Ignore,
}

fn relay_frame(frame: OutgoingFrame, channel_id: u64) -> Relayed {
    match frame {
        OutgoingFrame::ChannelMessage { id, payload } if id == channel_id => Relayed::Message(payload),
        OutgoingFrame::Error { error } => {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("upstream error")
                .to_string();
            Relayed::Error(FunctionError::new(message).with_details(error))
        }
        OutgoingFrame::Drain { reconnect_after_ms } => {
            Relayed::Closed(format!("upstream draining, retry in {reconnect_after_ms}ms"))
        }
        _ => Relayed::Ignore,
    }
}

/// [`UpstreamClient`] speaking the binary protocol over WebSocket.
pub struct WsUpstream {
    url: String,
    auth: Payload,
    connect_timeout: Duration,
}

impl WsUpstream {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: Payload::Undefined,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Auth payload sent before subscribing.
    pub fn with_auth(mut self, auth: impl Into<Payload>) -> Self {
        self.auth = auth.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl UpstreamClient for WsUpstream {
    async fn subscribe_channel(
        &self,
        name: &str,
        payload: Payload,
        emitter: ChannelEmitter,
    ) -> Result<CloseHandle, FunctionError> {
        let connect = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()));
        let (socket, _) = match connect.await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return Err(FunctionError::new(format!("upstream connect failed: {e}"))),
            Err(_) => return Err(FunctionError::new("upstream connect timed out")),
        };
        let (mut write, mut read) = socket.split();

        let channel_id = fingerprint(name, &payload);
        let mut hello = Vec::new();
        if !self.auth.is_undefined() {
            hello.push(encode_auth(&self.auth));
        }
        hello.push(encode_channel_subscribe(channel_id, ChannelMode::Subscribe, name, &payload));
        for frame in hello {
            let frame = frame.map_err(|e| FunctionError::new(e.to_string()))?;
            write
                .send(Message::Binary(frame))
                .await
                .map_err(|e| FunctionError::new(format!("upstream send failed: {e}")))?;
        }
        info!(upstream = %self.url, route = name, channel_id, "relay subscribed");

        let route = name.to_string();
        let task = tokio::spawn(async move {
            // keeps the upstream socket open
            let _write = write;
            let reason = loop {
                let data = match read.next().await {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break "upstream closed".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break format!("upstream failed: {e}"),
                };
                let frames = match OutgoingFrame::decode_all(&data) {
                    Ok(frames) => frames,
                    Err(e) => break format!("upstream sent a malformed frame: {e}"),
                };
                for frame in frames {
                    match relay_frame(frame, channel_id) {
                        Relayed::Message(message) => {
                            emitter.publish(message);
                        }
                        Relayed::Error(error) => {
                            emitter.error(error);
                        }
                        Relayed::Closed(reason) => {
                            emitter.error(FunctionError::new(reason));
                            return;
                        }
                        Relayed::Ignore => {}
                    }
                }
                if emitter.is_closed() {
                    debug!(route = %route, "relay stopped, channel closed");
                    return;
                }
            };
            warn!(route = %route, %reason, "relay ended");
            emitter.error(FunctionError::new(reason));
        });
        Ok(CloseHandle::new(move || task.abort()))
    }
}
