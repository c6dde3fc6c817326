//! Cross-crate flows.

pub mod e2e;
pub mod http_flows;
pub mod ws_flows;
