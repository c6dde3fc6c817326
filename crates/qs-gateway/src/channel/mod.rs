//! Live pub/sub channels, optionally throttled or relayed from an upstream
//! server.

pub mod emitter;
pub mod table;

pub use emitter::ChannelEmitter;
pub use table::{ChannelTable, PublishTarget};
