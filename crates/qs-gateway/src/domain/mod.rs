//! Domain types for the sync gateway: configuration, errors, routes, sessions.

pub mod config;
pub mod error;
pub mod route;
pub mod session;

pub use config::GatewayConfig;
pub use error::{ErrorTarget, GatewayError, SyncError, SyncResult};
pub use route::{RouteHandler, RouteKind, RouteSpec};
pub use session::{auth_from_headers, ClientId, HttpSession, Session, WsSession};
