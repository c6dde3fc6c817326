//! Live query subscriptions: the shared, checksummed, diffed values that
//! every subscriber of one (route, payload) fingerprint receives.

pub mod emitter;
pub mod table;

pub use emitter::{ObservableEmitter, Update};
pub use table::{CachedValue, DiffFrame, GetOutcome, ObservableTable};
