//! WebSocket surface: connection state, frame routing, outbound queues,
//! and streamed uploads.

pub mod connection;
pub mod handler;
pub mod outbound;
pub mod router;
pub mod streams;

pub use connection::{Flow, PendingKey, WsConnection};
pub use handler::{serve, ws_upgrade};
pub use outbound::{CloseReason, Next, Outbound};
