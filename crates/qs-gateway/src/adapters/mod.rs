//! Adapters for the sync gateway.
//!
//! Implementations of the outbound ports that ship with the crate.

pub mod installer;
pub mod upstream;

pub use installer::StaticInstaller;
pub use upstream::WsUpstream;
