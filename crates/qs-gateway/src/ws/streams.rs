//! Uploads streamed over WebSocket.
//!
//! A stream-register frame opens an upload with a declared size. Chunks are
//! acknowledged one by one; the body ends once the declared size arrived.

use std::sync::Arc;

use bytes::Bytes;
use qs_wire::frame::{encode_function_response, encode_stream_chunk_ack};
use qs_wire::Payload;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::error::{ErrorTarget, SyncError};
use crate::domain::route::{RouteKind, RouteSpec};
use crate::ports::{StreamBody, StreamRequest};
use crate::ws::connection::{Flow, WsConnection};
use crate::ws::router::Admission;

/// Chunks buffered between the socket and a slow stream handler
const UPLOAD_BUFFER: usize = 16;

/// An upload in progress.
pub(crate) struct Upload {
    name: String,
    tx: mpsc::Sender<Result<Bytes, SyncError>>,
    remaining: u64,
}

/// Stream body fed by an upload's channel.
pub(crate) fn channel_body(rx: mpsc::Receiver<Result<Bytes, SyncError>>) -> StreamBody {
    StreamBody::new(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

impl WsConnection {
    pub(crate) async fn on_stream_register(
        self: &Arc<Self>,
        req_id: u32,
        content_size: u32,
        name: &str,
        metadata: Payload,
        size: usize,
    ) -> Flow {
        let target = ErrorTarget::Request(req_id);
        let route = match self.admit(name, size, target, &metadata).await {
            Admission::Route(route) => route,
            Admission::Skip => return Flow::Continue,
            Admission::Close => return Flow::Close,
        };
        if route.kind() != RouteKind::Stream {
            let error = SyncError::FunctionIsWrongType {
                name: route.name.clone(),
                expected: RouteKind::Stream,
                actual: route.kind(),
            };
            self.send_error(&error, Some(target), &metadata);
            return Flow::Continue;
        }
        let limit = route.payload_limit(self.ctx.config.limits.max_payload_size);
        if content_size as usize > limit {
            let error = SyncError::PayloadTooLarge {
                name: route.name.clone(),
                size: content_size as usize,
                limit,
            };
            self.send_error(&error, Some(target), &metadata);
            return Flow::Continue;
        }
        if self.uploads.lock().contains_key(&req_id) {
            let error = SyncError::invalid_payload(name, format!("stream {req_id} already open"));
            self.send_error(&error, Some(target), &metadata);
            return Flow::Continue;
        }

        let (tx, rx) = mpsc::channel(UPLOAD_BUFFER);
        if content_size > 0 {
            self.uploads.lock().insert(
                req_id,
                Upload {
                    name: route.name.clone(),
                    tx,
                    remaining: u64::from(content_size),
                },
            );
        } else {
            drop(tx);
        }
        debug!(client_id = %self.client_id(), route = %route.name, req_id, content_size, "stream registered");

        let request = StreamRequest {
            metadata: metadata.clone(),
            content_size: Some(u64::from(content_size)),
            body: channel_body(rx),
        };
        self.spawn_stream(req_id, route, request, metadata);
        Flow::Continue
    }

    fn spawn_stream(self: &Arc<Self>, req_id: u32, route: Arc<RouteSpec>, request: StreamRequest, metadata: Payload) {
        let conn = Arc::downgrade(self);
        let ctx = Arc::clone(&self.ctx);
        let session = self.session();
        tokio::spawn(async move {
            let target = ErrorTarget::Request(req_id);
            let result = match ctx.gate.check(&route, &session, &metadata).await {
                Ok(()) => ctx.runner.call_stream(&route, request, &session).await,
                Err(e) => Err(e),
            };
            let Some(conn) = conn.upgrade() else {
                return;
            };
            conn.uploads.lock().remove(&req_id);
            match result.and_then(|out| {
                encode_function_response(req_id, &out)
                    .map_err(|e| SyncError::internal(e.to_string()))
            }) {
                Ok(frame) => conn.send(frame),
                Err(e) => conn.send_error(&e, Some(target), &metadata),
            }
        });
    }

    pub(crate) async fn on_stream_chunk(self: &Arc<Self>, req_id: u32, seq: u8, data: Bytes) -> Flow {
        let target = ErrorTarget::Request(req_id);
        let max_chunk = self.ctx.config.limits.max_chunk_size;

        let (tx, name, finished) = {
            let mut uploads = self.uploads.lock();
            let Some(upload) = uploads.get_mut(&req_id) else {
                drop(uploads);
                let error = SyncError::invalid_payload("", format!("stream {req_id} is not open"));
                self.send_error(&error, Some(target), &Payload::Undefined);
                return Flow::Continue;
            };
            let len = data.len() as u64;
            if data.len() > max_chunk || len > upload.remaining {
                let error = if data.len() > max_chunk {
                    SyncError::ChunkTooLarge {
                        name: upload.name.clone(),
                        size: data.len(),
                        limit: max_chunk,
                    }
                } else {
                    SyncError::invalid_payload(&upload.name, "chunk exceeds the declared stream size")
                };
                if let Some(upload) = uploads.remove(&req_id) {
                    // the handler sees the failure as the last body item
                    let _ = upload.tx.try_send(Err(error.clone()));
                }
                drop(uploads);
                warn!(client_id = %self.client_id(), req_id, error = %error, "stream chunk rejected");
                self.send_error(&error, Some(target), &Payload::Undefined);
                return Flow::Continue;
            }
            upload.remaining -= len;
            let finished = upload.remaining == 0;
            let tx = upload.tx.clone();
            let name = upload.name.clone();
            if finished {
                uploads.remove(&req_id);
            }
            (tx, name, finished)
        };

        if tx.send(Ok(data)).await.is_err() {
            // handler finished without reading everything
            self.uploads.lock().remove(&req_id);
            debug!(req_id, route = %name, "stream handler stopped reading");
            return Flow::Continue;
        }
        drop(tx);
        match encode_stream_chunk_ack(req_id, seq) {
            Ok(frame) => self.send(frame),
            Err(e) => warn!(error = %e, "failed to encode chunk ack"),
        }
        if finished {
            debug!(req_id, route = %name, "stream upload complete");
        }
        Flow::Continue
    }
}
