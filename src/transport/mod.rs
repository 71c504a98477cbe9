//! Transport module - listening sockets.
//!
//! Provides abstraction over:
//! - TCP sockets
//! - Unix Domain Sockets (Linux/macOS)

mod listener;

pub use listener::{ListenAddr, Listener, Stream};
