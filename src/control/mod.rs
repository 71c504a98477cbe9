//! Control plane module - ready message and stdio I/O.
//!
//! The control plane is a single JSON line on stdout, written once the
//! backend is listening. Everything else (records) happens on the sockets.
//!
//! # Workflow
//!
//! 1. Backend binds its listener
//! 2. Backend prints the ready line on stdout
//! 3. Supervisor reads the line and points the web server at `address`
//!
//! # Example
//!
//! ```ignore
//! use fcgi_backend::control::announce_ready;
//!
//! let listener = Listener::bind(&addr).await?;
//! announce_ready(&listener.local_addr()?)?;
//! ```

mod ready;
mod stdio;

pub use ready::{build_ready_message, ReadyMessage, READY_EVENT};
pub use stdio::{announce_ready, write_line, write_stdout_line};
