//! Ready message builder.
//!
//! Once the backend is listening it prints one JSON line on stdout so a
//! supervising process knows where to connect:
//!
//! ```text
//! {"event":"listening","address":"unix:/tmp/fcgi.sock","pid":1234,"version":"0.1.0"}
//! ```
//!
//! # Example
//!
//! ```
//! use fcgi_backend::control::build_ready_message;
//! use fcgi_backend::transport::ListenAddr;
//!
//! let addr: ListenAddr = "127.0.0.1:9000".parse().unwrap();
//! let json = build_ready_message(&addr).unwrap();
//! assert!(json.contains("\"listening\""));
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transport::ListenAddr;

/// Event name of the ready message.
pub const READY_EVENT: &str = "listening";

/// The ready message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMessage {
    /// Always [`READY_EVENT`].
    pub event: String,
    /// Bound address, in the same syntax accepted by `--listen`.
    pub address: String,
    /// Process id of the backend.
    pub pid: u32,
    /// Crate version.
    pub version: String,
}

impl ReadyMessage {
    /// Ready message for this process.
    pub fn new(addr: &ListenAddr) -> Self {
        Self {
            event: READY_EVENT.to_string(),
            address: addr.to_string(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Build the ready message as a single JSON line (without the newline).
pub fn build_ready_message(addr: &ListenAddr) -> Result<String> {
    Ok(serde_json::to_string(&ReadyMessage::new(addr))?)
}
