//! Connection-level request multiplexer.
//!
//! The [`MultiplexerBuilder`] configures the GET_VALUES answers, the
//! accepted roles, request limits and queue sizes. The [`Multiplexer`]
//! owns one connection and drives it:
//! 1. Read records from the connection
//! 2. Answer management records (GET_VALUES, unknown types) directly
//! 3. Spawn one task per BEGIN_REQUEST
//! 4. Route ABORT_REQUEST / PARAMS / STDIN / DATA to the request's queue
//! 5. On end of stream or protocol error, close and cancel everything
//!
//! Only the dispatch loop touches the request map. Requests report
//! completion over a channel that is drained before every inbound record.
//!
//! # Example
//!
//! ```ignore
//! use fcgi_backend::{Multiplexer, protocol::BeginRequest};
//!
//! let mux = Multiplexer::builder()
//!     .value("FCGI_MAX_REQS", "16")
//!     .max_requests(16)
//!     .build(stream, |_: &BeginRequest| MyHandler::default());
//! mux.run().await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::{FcgiError, Result};
use crate::protocol::{
    values, BeginRequest, EndRequest, GetValues, GetValuesResult, ProtocolStatus, Record, Role,
    ServerMessage, UnknownType,
};
use crate::request::{
    run_request, HandlerFactory, InboundMessage, RequestContext, DEFAULT_QUEUE_CAPACITY,
};
use crate::writer::RecordWriter;

/// State shared with request tasks through a `Weak` link.
///
/// The multiplexer holds the only strong reference, so dropping it cuts
/// every request off from the connection.
pub(crate) struct MuxShared {
    pub(crate) writer: RecordWriter,
    pub(crate) done_tx: mpsc::UnboundedSender<u16>,
}

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Capacity of each request's inbound queue.
    ///
    /// Default: 16
    pub queue_capacity: usize,
    /// Answers for GET_VALUES; names not listed are omitted from replies.
    ///
    /// Default: `FCGI_MPXS_CONNS=1`
    pub values: HashMap<Bytes, Bytes>,
    /// Open requests above which BEGIN_REQUEST is answered with OVERLOADED.
    ///
    /// Default: unlimited
    pub max_requests: Option<usize>,
    /// Roles accepted; others are answered with UNKNOWN_ROLE.
    ///
    /// Default: all roles
    pub roles: Vec<Role>,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        let mut known = HashMap::new();
        known.insert(
            Bytes::from_static(values::FCGI_MPXS_CONNS.as_bytes()),
            Bytes::from_static(b"1"),
        );
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            values: known,
            max_requests: None,
            roles: vec![Role::Responder, Role::Authorizer, Role::Filter],
        }
    }
}

/// Builder for a [`Multiplexer`].
#[derive(Debug, Clone, Default)]
pub struct MultiplexerBuilder {
    config: MultiplexerConfig,
}

impl MultiplexerBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn with_config(config: MultiplexerConfig) -> Self {
        Self { config }
    }

    /// Set the capacity of each request's inbound queue.
    ///
    /// A full queue suspends reading from the connection. Values below 1
    /// are treated as 1.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity.max(1);
        self
    }

    /// Add or replace a GET_VALUES answer.
    pub fn value(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.config.values.insert(name.into(), value.into());
        self
    }

    /// Limit the number of concurrently open requests.
    pub fn max_requests(mut self, limit: usize) -> Self {
        self.config.max_requests = Some(limit);
        self
    }

    /// Restrict the accepted roles.
    pub fn roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.config.roles = roles.into_iter().collect();
        self
    }

    /// Current configuration.
    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Build a multiplexer over an accepted stream.
    pub fn build<S, F>(self, stream: S, factory: F) -> Multiplexer<F>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
        F: HandlerFactory,
    {
        Multiplexer::with_config(Connection::new(stream), factory, self.config)
    }
}

struct RequestSlot {
    tx: mpsc::Sender<InboundMessage>,
    ctx: RequestContext,
}

/// Serves all requests of one connection.
pub struct Multiplexer<F> {
    conn: Connection,
    factory: F,
    config: MultiplexerConfig,
    /// `None` once closed.
    shared: Option<Arc<MuxShared>>,
    done_rx: mpsc::UnboundedReceiver<u16>,
    requests: HashMap<u16, RequestSlot>,
}

impl Multiplexer<()> {
    /// Create a new multiplexer builder.
    pub fn builder() -> MultiplexerBuilder {
        MultiplexerBuilder::new()
    }
}

impl<F: HandlerFactory> Multiplexer<F> {
    /// Multiplexer with the default configuration.
    pub fn new<S>(stream: S, factory: F) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        MultiplexerBuilder::new().build(stream, factory)
    }

    /// Multiplexer over an existing connection.
    pub fn with_config(conn: Connection, factory: F, config: MultiplexerConfig) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MuxShared {
            writer: conn.writer(),
            done_tx,
        });
        Self {
            conn,
            factory,
            config,
            shared: Some(shared),
            done_rx,
            requests: HashMap::new(),
        }
    }

    /// Number of open requests.
    pub fn open_requests(&self) -> usize {
        self.requests.len()
    }

    /// Serve the connection until the peer closes it.
    ///
    /// Returns `Ok(())` on a clean end of stream and the error on a
    /// protocol violation or transport failure. The connection is closed
    /// and every open request cancelled in both cases.
    pub async fn run(mut self) -> Result<()> {
        let result = self.dispatch_loop().await;
        match &result {
            Ok(()) => tracing::debug!("Connection closed by peer"),
            Err(e) => tracing::warn!("Closing connection: {}", e),
        }
        self.close().await;
        result
    }

    async fn dispatch_loop(&mut self) -> Result<()> {
        loop {
            let record = tokio::select! {
                biased;
                Some(request_id) = self.done_rx.recv() => {
                    self.complete(request_id);
                    continue;
                }
                record = self.conn.read() => record?,
            };
            let Some(record) = record else {
                return Ok(());
            };

            self.drain_completions();
            self.dispatch(record).await?;
        }
    }

    async fn dispatch(&mut self, record: Record) -> Result<()> {
        if record.kind().is_none() {
            tracing::debug!("Unknown record type {}", record.record_type);
            let reply = UnknownType {
                record_type: record.record_type,
            };
            return self.conn.write(&reply.pack()?).await;
        }

        match ServerMessage::unpack(&record)? {
            ServerMessage::BeginRequest(begin) => self.begin_request(begin).await?,
            ServerMessage::AbortRequest { request_id } => {
                self.enqueue(request_id, InboundMessage::Abort).await
            }
            ServerMessage::Params {
                request_id,
                payload,
            } => self.enqueue(request_id, InboundMessage::Params(payload)).await,
            ServerMessage::Stdin {
                request_id,
                payload,
            } => self.enqueue(request_id, InboundMessage::Stdin(payload)).await,
            ServerMessage::Data {
                request_id,
                payload,
            } => self.enqueue(request_id, InboundMessage::Data(payload)).await,
            ServerMessage::GetValues(query) => self.get_values(query).await?,
        }
        Ok(())
    }

    async fn begin_request(&mut self, begin: BeginRequest) -> Result<()> {
        let request_id = begin.request_id;
        if self.requests.contains_key(&request_id) {
            return Err(FcgiError::protocol(format!(
                "Request id {} still in use",
                request_id
            )));
        }

        if !self.config.roles.contains(&begin.role) {
            tracing::debug!("Rejecting request {} with role {:?}", request_id, begin.role);
            return self.reject(request_id, ProtocolStatus::UnknownRole).await;
        }
        if let Some(limit) = self.config.max_requests {
            if self.requests.len() >= limit {
                tracing::debug!("Rejecting request {}: {} requests open", request_id, limit);
                return self.reject(request_id, ProtocolStatus::Overloaded).await;
            }
        }

        let link = self.shared.as_ref().map(Arc::downgrade).unwrap_or_else(Weak::new);
        let ctx = RequestContext::new(&begin, link);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let handler = self.factory.create(&begin);

        tracing::debug!("Begin request {} ({:?})", request_id, begin.role);
        tokio::spawn(run_request(handler, ctx.clone(), rx));
        self.requests.insert(request_id, RequestSlot { tx, ctx });
        Ok(())
    }

    async fn reject(&self, request_id: u16, protocol_status: ProtocolStatus) -> Result<()> {
        let end = EndRequest {
            request_id,
            app_status: 0,
            protocol_status,
        };
        self.conn.write(&end.pack()?).await
    }

    async fn enqueue(&self, request_id: u16, message: InboundMessage) {
        let Some(slot) = self.requests.get(&request_id) else {
            tracing::trace!("Dropping {:?} for unknown request {}", message, request_id);
            return;
        };
        if slot.tx.send(message).await.is_err() {
            tracing::trace!("Request {} no longer accepts input", request_id);
        }
    }

    async fn get_values(&self, query: GetValues) -> Result<()> {
        let values = query
            .names
            .into_iter()
            .filter_map(|name| {
                let value = self.config.values.get(&name)?.clone();
                Some((name, value))
            })
            .collect();
        self.conn.write(&GetValuesResult { values }.pack()?).await
    }

    fn drain_completions(&mut self) {
        while let Ok(request_id) = self.done_rx.try_recv() {
            self.complete(request_id);
        }
    }

    fn complete(&mut self, request_id: u16) {
        let finished = self
            .requests
            .get(&request_id)
            .is_some_and(|slot| slot.ctx.is_detached());
        if finished {
            self.requests.remove(&request_id);
            tracing::debug!("Request {} completed", request_id);
        }
    }

    async fn close(&mut self) {
        self.conn.close().await;

        let slots: Vec<RequestSlot> = self.requests.drain().map(|(_, slot)| slot).collect();
        if !slots.is_empty() {
            tracing::debug!("Cancelling {} open requests", slots.len());
        }
        for slot in &slots {
            slot.ctx.detach();
        }
        for slot in &slots {
            slot.ctx.cancel();
        }
        self.shared = None;
    }
}
