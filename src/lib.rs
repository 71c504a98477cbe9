//! # fcgi-backend
//!
//! Application-side (backend) FastCGI for tokio.
//!
//! This crate lets a worker process accept connections from a web server
//! and serve many concurrent requests over each of them.
//!
//! ## Architecture
//!
//! - **Wire codec** ([`protocol`]): record headers, name/value pairs, typed messages
//! - **Connection** ([`connection`]): records over any duplex byte stream
//! - **Multiplexer** ([`Multiplexer`]): routes records by request id
//! - **Requests** ([`request`]): one task per request driving a [`Handler`]
//! - **Control Plane** ([`control`]): JSON ready line on stdout
//!
//! ## Example
//!
//! ```ignore
//! use fcgi_backend::{Handler, Multiplexer, ProtocolStatus, Request};
//! use fcgi_backend::protocol::BeginRequest;
//! use fcgi_backend::transport::{ListenAddr, Listener};
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl Handler for Hello {
//!     async fn received_params(&mut self, req: &Request) -> fcgi_backend::Result<()> {
//!         req.write_stdout(b"Content-Type: text/plain\r\n\r\nhello").await?;
//!         req.finish(0, ProtocolStatus::RequestComplete).await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> fcgi_backend::Result<()> {
//!     let listener = Listener::bind(&"127.0.0.1:9000".parse()?).await?;
//!     loop {
//!         let stream = listener.accept().await?;
//!         tokio::spawn(Multiplexer::new(stream, |_: &BeginRequest| Hello).run());
//!     }
//! }
//! ```

#[cfg(unix)]
pub mod cgi;
pub mod connection;
pub mod control;
pub mod error;
pub mod multiplexer;
pub mod protocol;
pub mod request;
pub mod transport;

mod writer;

pub use connection::Connection;
pub use error::{FcgiError, Result};
pub use multiplexer::{Multiplexer, MultiplexerBuilder, MultiplexerConfig};
pub use protocol::{ProtocolStatus, Role};
pub use request::{Handler, HandlerFactory, Request, RequestContext};
pub use writer::RecordWriter;
