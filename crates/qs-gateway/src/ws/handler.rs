//! WebSocket upgrade and socket loops.
//!
//! The reader decodes and dispatches inbound messages in order. A separate
//! writer task drains the connection's outbound queue, so a slow socket never
//! blocks table fan-out.

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::domain::session::auth_from_headers;
use crate::middleware::ip_protection::ClientIp;
use crate::middleware::rate_limit::rate_limit_response;
use crate::ws::connection::{Flow, WsConnection};
use crate::ws::outbound::{CloseReason, Next, Outbound};

/// Room for frame headers and prefixes on top of the payload ceiling
const MESSAGE_OVERHEAD: usize = 64 * 1024;

/// Upgrade handler. Each upgrade costs a token from the reconnect limiter.
pub async fn ws_upgrade(
    State(ctx): State<Arc<ServerContext>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let reconnect = &ctx.limiters.reconnect;
    if !reconnect.charge(ip, 1).is_allowed() {
        return rate_limit_response(reconnect);
    }
    let auth = auth_from_headers(&headers);
    let max_message = ctx
        .config
        .limits
        .max_payload_size
        .saturating_add(MESSAGE_OVERHEAD);

    ws.max_message_size(max_message)
        .on_upgrade(move |socket| async move {
            let conn = WsConnection::new(ctx, ip, auth);
            serve(conn, socket).await;
        })
}

/// Drive one connection until either side closes.
pub async fn serve(conn: Arc<WsConnection>, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(Arc::clone(conn.outbound()), sink));

    loop {
        tokio::select! {
            message = stream.next() => {
                let flow = match message {
                    Some(Ok(Message::Binary(data))) => conn.handle_binary(&data).await,
                    Some(Ok(Message::Text(_))) => conn.handle_text(),
                    // axum answers pings itself
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => Flow::Continue,
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(client_id = %conn.client_id(), "client closed the socket");
                        Flow::Close
                    }
                    Some(Err(e)) => {
                        warn!(client_id = %conn.client_id(), error = %e, "websocket error");
                        Flow::Close
                    }
                };
                if flow == Flow::Close {
                    break;
                }
            }
            _ = &mut writer => {
                // writer gave up (backpressure or a dead socket)
                break;
            }
        }
    }

    conn.disconnect();
    conn.outbound().close(CloseReason::Normal);
    if !writer.is_finished() {
        let _ = writer.await;
    }
    info!(client_id = %conn.client_id(), ip = %conn.ip(), "websocket closed");
}

async fn write_loop(outbound: Arc<Outbound>, mut sink: SplitSink<WebSocket, Message>) {
    loop {
        match outbound.next().await {
            Next::Send(frame) => {
                if sink.send(Message::Binary(frame.to_vec())).await.is_err() {
                    outbound.close(CloseReason::Abort);
                    return;
                }
            }
            Next::Close(reason) => {
                let (code, text) = match reason {
                    CloseReason::Normal => (1000, "closing"),
                    CloseReason::Backpressure => (1013, "slow consumer"),
                    CloseReason::Abort => (1008, "protocol violation"),
                };
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: Cow::Borrowed(text),
                    })))
                    .await;
                return;
            }
        }
    }
}
