//! # Quantum-Sync Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── harness.rs        # Connection driver shared by the flows
//! └── integration/
//!     ├── ws_flows.rs   # Router, tables and auth through WsConnection
//!     ├── http_flows.rs # HTTP adapter behind the middleware stack
//!     └── e2e.rs        # Real sockets: server, client and relay
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p qs-tests
//! cargo test -p qs-tests integration::e2e::
//! cargo bench -p qs-tests
//! ```

pub mod harness;
pub mod integration;
