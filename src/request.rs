//! Per-request state machine.
//!
//! Every BEGIN_REQUEST spawns one task that owns a [`Request`] and the
//! caller's [`Handler`]. The multiplexer feeds the task through a bounded
//! queue; the task processes messages strictly in arrival order.
//!
//! ```text
//! AWAITING_PARAMS ──empty PARAMS──► PARAMS_COMPLETE ──finish()──► COMPLETED
//! ```
//!
//! Output goes through a cloneable [`RequestContext`], so a handler may
//! keep writing from tasks of its own after a callback returns.
//!
//! # Example
//!
//! ```ignore
//! use fcgi_backend::request::{Handler, Request};
//! use fcgi_backend::protocol::ProtocolStatus;
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
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};

use crate::error::{FcgiError, Result};
use crate::multiplexer::MuxShared;
use crate::protocol::{
    unpack_pairs, BeginRequest, EndRequest, ProtocolStatus, Record, RecordType, Role,
    MAX_CONTENT_LENGTH,
};

/// Default capacity of a request's inbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Message routed from the multiplexer to a request task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InboundMessage {
    Abort,
    Params(Bytes),
    Stdin(Bytes),
    Data(Bytes),
}

/// Callbacks for one request.
///
/// All callbacks run on the request's own task, one at a time. An error
/// returned from a callback ends the request; the abort path then still
/// runs.
#[async_trait]
pub trait Handler: Send + 'static {
    /// Called once when the PARAMS stream is complete.
    async fn received_params(&mut self, _req: &Request) -> Result<()> {
        Ok(())
    }

    /// Called for every STDIN chunk, including the final empty one.
    async fn recv_stdin(&mut self, _req: &Request, _data: Bytes) -> Result<()> {
        Ok(())
    }

    /// Called for every DATA chunk, including the final empty one.
    async fn recv_data(&mut self, _req: &Request, _data: Bytes) -> Result<()> {
        Ok(())
    }

    /// Called at most once when the request is aborted, either by the web
    /// server or because processing ended before the request completed.
    async fn handle_abort(&mut self, req: &Request) -> Result<()> {
        req.exit(-1, ProtocolStatus::RequestComplete).await
    }
}

/// Creates a [`Handler`] for every accepted BEGIN_REQUEST.
pub trait HandlerFactory: Send + Sync + 'static {
    /// Handler type produced by this factory.
    type Handler: Handler;

    /// Create the handler for a new request.
    fn create(&self, begin: &BeginRequest) -> Self::Handler;
}

impl<F, H> HandlerFactory for F
where
    F: Fn(&BeginRequest) -> H + Send + Sync + 'static,
    H: Handler,
{
    type Handler = H;

    fn create(&self, begin: &BeginRequest) -> H {
        self(begin)
    }
}

#[derive(Debug, Default)]
struct OutputState {
    stdout_closed: bool,
    stderr_closed: bool,
    completed: bool,
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn name(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }

    fn record_type(self) -> RecordType {
        match self {
            OutputStream::Stdout => RecordType::Stdout,
            OutputStream::Stderr => RecordType::Stderr,
        }
    }
}

struct ContextInner {
    request_id: u16,
    role: Role,
    keep_alive: bool,
    state: Mutex<OutputState>,
    /// Held while this request writes records, so nothing follows END_REQUEST.
    output: tokio::sync::Mutex<()>,
    /// Cleared on exit and when the connection closes.
    link: Mutex<Option<Weak<MuxShared>>>,
    cancel: watch::Sender<bool>,
}

/// Output side of a request.
///
/// Cheap to clone; every clone refers to the same request. Once the request
/// has exited or its connection is gone, writes become no-ops.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

impl RequestContext {
    pub(crate) fn new(begin: &BeginRequest, link: Weak<MuxShared>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(ContextInner {
                request_id: begin.request_id,
                role: begin.role,
                keep_alive: begin.keep_alive,
                state: Mutex::new(OutputState::default()),
                output: tokio::sync::Mutex::new(()),
                link: Mutex::new(Some(link)),
                cancel,
            }),
        }
    }

    /// Request id on the connection.
    #[inline]
    pub fn request_id(&self) -> u16 {
        self.inner.request_id
    }

    /// Role requested in BEGIN_REQUEST.
    #[inline]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Whether the web server asked to keep the connection open.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.inner.keep_alive
    }

    /// Write to STDOUT. Empty data sends the end-of-stream marker.
    pub async fn write_stdout(&self, data: &[u8]) -> Result<()> {
        self.write_stream(OutputStream::Stdout, data, true).await
    }

    /// Write to STDOUT; empty data is not treated as end of stream.
    pub async fn write_stdout_no_close(&self, data: &[u8]) -> Result<()> {
        self.write_stream(OutputStream::Stdout, data, false).await
    }

    /// Write to STDERR. Empty data sends the end-of-stream marker.
    pub async fn write_stderr(&self, data: &[u8]) -> Result<()> {
        self.write_stream(OutputStream::Stderr, data, true).await
    }

    /// Write to STDERR; empty data is not treated as end of stream.
    pub async fn write_stderr_no_close(&self, data: &[u8]) -> Result<()> {
        self.write_stream(OutputStream::Stderr, data, false).await
    }

    /// Terminate both output streams, mark the request completed and exit.
    pub async fn finish(&self, status: i32, protocol_status: ProtocolStatus) -> Result<()> {
        self.write_stdout(b"").await?;
        self.write_stderr(b"").await?;
        self.state().completed = true;
        self.exit(status, protocol_status).await
    }

    /// Send END_REQUEST and stop the request task.
    ///
    /// Idempotent: only the first call on an attached request writes
    /// anything. `status` goes on the wire as its two's-complement `u32`.
    pub async fn exit(&self, status: i32, protocol_status: ProtocolStatus) -> Result<()> {
        let _output = self.inner.output.lock().await;
        {
            let mut state = self.state();
            state.stdout_closed = true;
            state.stderr_closed = true;
        }

        let shared = self.take_link().and_then(|link| link.upgrade());
        let result = match shared {
            Some(shared) => {
                let _ = shared.done_tx.send(self.request_id());
                let end = EndRequest {
                    request_id: self.request_id(),
                    app_status: status as u32,
                    protocol_status,
                };
                match end.pack() {
                    Ok(record) => shared.writer.write(&record).await,
                    Err(e) => Err(e),
                }
            }
            None => Ok(()),
        };

        self.cancel();
        result
    }

    /// True once `finish()` marked the request completed.
    pub fn is_completed(&self) -> bool {
        self.state().completed
    }

    /// True once the request can no longer write to its connection.
    pub fn is_detached(&self) -> bool {
        self.link()
            .as_ref()
            .map_or(true, |link| link.strong_count() == 0)
    }

    /// True once the request task was told to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    /// Drop the link to the multiplexer without writing anything.
    pub(crate) fn detach(&self) {
        self.take_link();
    }

    /// Stop the request task; its abort path still runs.
    pub(crate) fn cancel(&self) {
        self.inner.cancel.send_replace(true);
    }

    fn subscribe_cancel(&self) -> watch::Receiver<bool> {
        self.inner.cancel.subscribe()
    }

    async fn write_stream(&self, stream: OutputStream, data: &[u8], close: bool) -> Result<()> {
        let _output = self.inner.output.lock().await;
        let shared = self.link().as_ref().and_then(Weak::upgrade);
        let Some(shared) = shared else {
            return Ok(());
        };

        {
            let mut state = self.state();
            let closed = match stream {
                OutputStream::Stdout => &mut state.stdout_closed,
                OutputStream::Stderr => &mut state.stderr_closed,
            };
            if *closed {
                if data.is_empty() {
                    return Ok(());
                }
                return Err(FcgiError::StreamClosed(stream.name()));
            }
            if data.is_empty() {
                if !close {
                    return Ok(());
                }
                *closed = true;
            }
        }

        let kind = stream.record_type();
        let id = self.request_id();
        if data.is_empty() {
            return shared.writer.write(&Record::new(kind, id, Bytes::new())).await;
        }
        for chunk in data.chunks(MAX_CONTENT_LENGTH) {
            let record = Record::new(kind, id, Bytes::copy_from_slice(chunk));
            shared.writer.write(&record).await?;
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, OutputState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link(&self) -> MutexGuard<'_, Option<Weak<MuxShared>>> {
        self.inner.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_link(&self) -> Option<Weak<MuxShared>> {
        self.link().take()
    }
}

/// Inbound side of a request, owned by the request task.
///
/// Handlers see it by shared reference; output methods forward to the
/// [`RequestContext`].
pub struct Request {
    ctx: RequestContext,
    params: HashMap<Bytes, Bytes>,
    params_buf: BytesMut,
    params_complete: bool,
    stdin_closed: bool,
    data_closed: bool,
    aborted: bool,
}

impl Request {
    pub(crate) fn new(ctx: RequestContext) -> Self {
        Self {
            ctx,
            params: HashMap::new(),
            params_buf: BytesMut::new(),
            params_complete: false,
            stdin_closed: false,
            data_closed: false,
            aborted: false,
        }
    }

    /// The output handle; clone it to write from other tasks.
    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// Request id on the connection.
    pub fn request_id(&self) -> u16 {
        self.ctx.request_id()
    }

    /// Role requested in BEGIN_REQUEST.
    pub fn role(&self) -> Role {
        self.ctx.role()
    }

    /// Whether the web server asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        self.ctx.keep_alive()
    }

    /// All parameters; empty until the PARAMS stream is complete.
    pub fn params(&self) -> &HashMap<Bytes, Bytes> {
        &self.params
    }

    /// Look up one parameter.
    pub fn param(&self, name: &[u8]) -> Option<&Bytes> {
        self.params.get(name)
    }

    /// Whether the PARAMS stream has ended.
    pub fn params_complete(&self) -> bool {
        self.params_complete
    }

    /// Whether the empty STDIN record was received.
    pub fn stdin_closed(&self) -> bool {
        self.stdin_closed
    }

    /// Whether the empty DATA record was received.
    pub fn data_closed(&self) -> bool {
        self.data_closed
    }

    /// Whether `handle_abort` has been invoked.
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// See [`RequestContext::write_stdout`].
    pub async fn write_stdout(&self, data: &[u8]) -> Result<()> {
        self.ctx.write_stdout(data).await
    }

    /// See [`RequestContext::write_stdout_no_close`].
    pub async fn write_stdout_no_close(&self, data: &[u8]) -> Result<()> {
        self.ctx.write_stdout_no_close(data).await
    }

    /// See [`RequestContext::write_stderr`].
    pub async fn write_stderr(&self, data: &[u8]) -> Result<()> {
        self.ctx.write_stderr(data).await
    }

    /// See [`RequestContext::write_stderr_no_close`].
    pub async fn write_stderr_no_close(&self, data: &[u8]) -> Result<()> {
        self.ctx.write_stderr_no_close(data).await
    }

    /// See [`RequestContext::finish`].
    pub async fn finish(&self, status: i32, protocol_status: ProtocolStatus) -> Result<()> {
        self.ctx.finish(status, protocol_status).await
    }

    /// See [`RequestContext::exit`].
    pub async fn exit(&self, status: i32, protocol_status: ProtocolStatus) -> Result<()> {
        self.ctx.exit(status, protocol_status).await
    }
}

/// Body of a request task.
///
/// The handler runs on a task of its own; if it panics, the request still
/// ends with END_REQUEST(-1) and its id is released.
pub(crate) async fn run_request<H: Handler>(
    handler: H,
    ctx: RequestContext,
    rx: mpsc::Receiver<InboundMessage>,
) {
    let request_id = ctx.request_id();
    let task = tokio::spawn(drive_request(handler, ctx.clone(), rx));
    if let Err(e) = task.await {
        if e.is_panic() {
            tracing::error!("Request {} handler panicked", request_id);
        }
        if let Err(e) = ctx.exit(-1, ProtocolStatus::RequestComplete).await {
            tracing::debug!("Ending request {} failed: {}", request_id, e);
        }
    }
}

async fn drive_request<H: Handler>(
    mut handler: H,
    ctx: RequestContext,
    mut rx: mpsc::Receiver<InboundMessage>,
) {
    let mut req = Request::new(ctx);
    let request_id = req.request_id();
    let mut cancel_rx = req.ctx.subscribe_cancel();

    let result = tokio::select! {
        biased;
        _ = wait_cancelled(&mut cancel_rx) => Ok(()),
        res = process(&mut handler, &mut req, &mut rx) => res,
    };
    if let Err(e) = result {
        tracing::warn!("Request {} failed: {}", request_id, e);
    }

    rx.close();
    while rx.try_recv().is_ok() {}

    if !req.ctx.is_completed() {
        if let Err(e) = abort(&mut handler, &mut req).await {
            tracing::debug!("Abort of request {} failed: {}", request_id, e);
        }
    }
    // The abort path may return without exiting.
    if !req.ctx.is_detached() {
        if let Err(e) = req.ctx.exit(-1, ProtocolStatus::RequestComplete).await {
            tracing::debug!("Ending request {} failed: {}", request_id, e);
        }
    }
    tracing::debug!("Request {} finished", request_id);
}

async fn process<H: Handler>(
    handler: &mut H,
    req: &mut Request,
    rx: &mut mpsc::Receiver<InboundMessage>,
) -> Result<()> {
    while !req.ctx.is_cancelled() {
        let Some(message) = rx.recv().await else {
            break;
        };

        match message {
            InboundMessage::Abort => abort(handler, req).await?,
            InboundMessage::Params(data) => {
                if req.params_complete {
                    return Err(FcgiError::protocol("Params already closed"));
                }
                if data.is_empty() {
                    req.params_complete = true;
                    let buf = std::mem::take(&mut req.params_buf);
                    req.params.extend(unpack_pairs(&buf)?);
                    handler.received_params(req).await?;
                } else {
                    req.params_buf.extend_from_slice(&data);
                }
            }
            InboundMessage::Stdin(data) => {
                if !req.params_complete {
                    return Err(FcgiError::protocol(
                        "Received stdin data before params finished",
                    ));
                }
                if data.is_empty() {
                    req.stdin_closed = true;
                }
                handler.recv_stdin(req, data).await?;
            }
            InboundMessage::Data(data) => {
                if data.is_empty() {
                    req.data_closed = true;
                }
                handler.recv_data(req, data).await?;
            }
        }
    }
    Ok(())
}

async fn abort<H: Handler>(handler: &mut H, req: &mut Request) -> Result<()> {
    if req.ctx.is_completed() || req.aborted {
        return Ok(());
    }
    req.aborted = true;
    handler.handle_abort(req).await
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        let cancelled = *rx.borrow_and_update();
        if cancelled || rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::protocol::{pack_pairs, ClientMessage};
    use crate::writer::RecordWriter;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    struct Harness {
        ctx: RequestContext,
        shared: Arc<MuxShared>,
        done_rx: UnboundedReceiver<u16>,
        peer: Connection,
    }

    impl Harness {
        fn new(request_id: u16) -> Self {
            let (local, peer) = duplex(1 << 20);
            let (done_tx, done_rx) = mpsc::unbounded_channel();
            let shared = Arc::new(MuxShared {
                writer: RecordWriter::new(local),
                done_tx,
            });
            let begin = BeginRequest {
                request_id,
                role: Role::Responder,
                keep_alive: false,
            };
            let ctx = RequestContext::new(&begin, Arc::downgrade(&shared));
            Self {
                ctx,
                shared,
                done_rx,
                peer: Connection::new(peer),
            }
        }

        /// Close the write side and collect everything the peer received.
        async fn received(&mut self) -> Vec<ClientMessage> {
            self.shared.writer.close().await;
            let mut messages = Vec::new();
            while let Some(record) = self.peer.read().await.unwrap() {
                messages.push(ClientMessage::unpack(&record).unwrap());
            }
            messages
        }
    }

    fn stdout(request_id: u16, payload: &'static [u8]) -> ClientMessage {
        ClientMessage::Stdout {
            request_id,
            payload: Bytes::from_static(payload),
        }
    }

    fn end_request(request_id: u16, app_status: u32) -> ClientMessage {
        ClientMessage::EndRequest(EndRequest {
            request_id,
            app_status,
            protocol_status: ProtocolStatus::RequestComplete,
        })
    }

    #[tokio::test]
    async fn test_stdout_eof_semantics() {
        let mut h = Harness::new(1);

        h.ctx.write_stdout(b"abc").await.unwrap();
        h.ctx.write_stdout_no_close(b"").await.unwrap();
        h.ctx.write_stdout(b"").await.unwrap();
        h.ctx.write_stdout(b"").await.unwrap();
        let err = h.ctx.write_stdout(b"late").await.unwrap_err();
        assert!(matches!(err, FcgiError::StreamClosed("stdout")));

        h.ctx.write_stderr(b"still open").await.unwrap();

        let received = h.received().await;
        assert_eq!(
            received,
            vec![
                stdout(1, b"abc"),
                stdout(1, b""),
                ClientMessage::Stderr {
                    request_id: 1,
                    payload: Bytes::from_static(b"still open"),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_large_write_is_split() {
        let mut h = Harness::new(2);
        let data = vec![b'x'; MAX_CONTENT_LENGTH + 10];

        h.ctx.write_stdout(&data).await.unwrap();

        let sizes: Vec<usize> = h
            .received()
            .await
            .into_iter()
            .map(|msg| match msg {
                ClientMessage::Stdout { payload, .. } => payload.len(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![MAX_CONTENT_LENGTH, 10]);
    }

    #[tokio::test]
    async fn test_exit_twice_sends_one_end_request() {
        let mut h = Harness::new(3);

        h.ctx.exit(-1, ProtocolStatus::RequestComplete).await.unwrap();
        h.ctx.exit(0, ProtocolStatus::RequestComplete).await.unwrap();

        assert!(h.ctx.is_detached());
        assert!(h.ctx.is_cancelled());
        assert!(!h.ctx.is_completed());
        assert_eq!(h.done_rx.try_recv().unwrap(), 3);
        assert!(h.done_rx.try_recv().is_err());

        h.ctx.write_stdout(b"after exit").await.unwrap();

        assert_eq!(h.received().await, vec![end_request(3, u32::MAX)]);
    }

    #[tokio::test]
    async fn test_finish_closes_streams_then_ends() {
        let mut h = Harness::new(4);

        h.ctx.write_stdout(b"body").await.unwrap();
        h.ctx.finish(7, ProtocolStatus::RequestComplete).await.unwrap();
        h.ctx.finish(0, ProtocolStatus::RequestComplete).await.unwrap();
        assert!(h.ctx.is_completed());

        assert_eq!(
            h.received().await,
            vec![
                stdout(4, b"body"),
                stdout(4, b""),
                ClientMessage::Stderr {
                    request_id: 4,
                    payload: Bytes::new(),
                },
                end_request(4, 7),
            ]
        );
    }

    #[tokio::test]
    async fn test_detached_context_writes_nothing() {
        let mut h = Harness::new(5);
        h.ctx.detach();

        h.ctx.write_stdout(b"dropped").await.unwrap();
        h.ctx.exit(0, ProtocolStatus::RequestComplete).await.unwrap();

        assert!(h.done_rx.try_recv().is_err());
        assert!(h.received().await.is_empty());
    }

    /// Reports callbacks over a channel; finishes on STDIN EOF.
    struct Recorder {
        events: UnboundedSender<String>,
        exit_on_abort: bool,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn received_params(&mut self, req: &Request) -> Result<()> {
            let name = req
                .param(b"SCRIPT_NAME")
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            let _ = self.events.send(format!("params {}", name));
            Ok(())
        }

        async fn recv_stdin(&mut self, req: &Request, data: Bytes) -> Result<()> {
            let _ = self.events.send(format!("stdin {}", data.len()));
            if data.is_empty() {
                req.write_stdout(b"done").await?;
                req.finish(0, ProtocolStatus::RequestComplete).await?;
            }
            Ok(())
        }

        async fn handle_abort(&mut self, req: &Request) -> Result<()> {
            let _ = self.events.send("abort".to_string());
            if self.exit_on_abort {
                req.exit(-1, ProtocolStatus::RequestComplete).await?;
            }
            Ok(())
        }
    }

    fn spawn_recorder(
        h: &Harness,
        exit_on_abort: bool,
    ) -> (
        mpsc::Sender<InboundMessage>,
        UnboundedReceiver<String>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let (events, events_rx) = mpsc::unbounded_channel();
        let handler = Recorder {
            events,
            exit_on_abort,
        };
        let task = tokio::spawn(run_request(handler, h.ctx.clone(), rx));
        (tx, events_rx, task)
    }

    async fn collect_events(mut rx: UnboundedReceiver<String>) -> Vec<String> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn params(pairs: &[(&str, &str)]) -> InboundMessage {
        InboundMessage::Params(pack_pairs(pairs.iter().copied()).unwrap())
    }

    #[tokio::test]
    async fn test_request_runs_to_completion() {
        let mut h = Harness::new(6);
        let (tx, events, task) = spawn_recorder(&h, true);

        let packed = pack_pairs([("SCRIPT_NAME", "/index"), ("QUERY_STRING", "")]).unwrap();
        let (first, second) = packed.split_at(5);
        tx.send(InboundMessage::Params(Bytes::copy_from_slice(first)))
            .await
            .unwrap();
        tx.send(InboundMessage::Params(Bytes::copy_from_slice(second)))
            .await
            .unwrap();
        tx.send(InboundMessage::Params(Bytes::new())).await.unwrap();
        tx.send(InboundMessage::Stdin(Bytes::from_static(b"hi")))
            .await
            .unwrap();
        tx.send(InboundMessage::Stdin(Bytes::new())).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            collect_events(events).await,
            vec!["params /index", "stdin 2", "stdin 0"]
        );
        let received = h.received().await;
        assert_eq!(received.first(), Some(&stdout(6, b"done")));
        assert_eq!(received.last(), Some(&end_request(6, 0)));
        assert_eq!(received.len(), 4);
    }

    #[tokio::test]
    async fn test_stdin_before_params_runs_abort_path() {
        let mut h = Harness::new(7);
        let (tx, events, task) = spawn_recorder(&h, true);

        tx.send(InboundMessage::Stdin(Bytes::from_static(b"early")))
            .await
            .unwrap();
        task.await.unwrap();

        assert_eq!(collect_events(events).await, vec!["abort"]);
        assert_eq!(h.received().await, vec![end_request(7, u32::MAX)]);
    }

    #[tokio::test]
    async fn test_second_params_stream_is_rejected() {
        let mut h = Harness::new(8);
        let (tx, events, task) = spawn_recorder(&h, true);

        tx.send(params(&[("SCRIPT_NAME", "/a")])).await.unwrap();
        tx.send(InboundMessage::Params(Bytes::new())).await.unwrap();
        tx.send(params(&[("X", "y")])).await.unwrap();
        task.await.unwrap();

        assert_eq!(collect_events(events).await, vec!["params /a", "abort"]);
        assert_eq!(h.received().await, vec![end_request(8, u32::MAX)]);
    }

    #[tokio::test]
    async fn test_repeated_abort_handled_once() {
        let mut h = Harness::new(9);
        let (tx, events, task) = spawn_recorder(&h, false);

        tx.send(InboundMessage::Abort).await.unwrap();
        tx.send(InboundMessage::Abort).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(collect_events(events).await, vec!["abort"]);
        assert_eq!(h.done_rx.try_recv().unwrap(), 9);
        assert_eq!(h.received().await, vec![end_request(9, u32::MAX)]);
    }

    #[tokio::test]
    async fn test_failed_request_ends_when_abort_does_not_exit() {
        let mut h = Harness::new(12);
        let (tx, events, task) = spawn_recorder(&h, false);

        tx.send(InboundMessage::Stdin(Bytes::from_static(b"early")))
            .await
            .unwrap();
        task.await.unwrap();

        assert_eq!(collect_events(events).await, vec!["abort"]);
        assert!(h.ctx.is_detached());
        assert_eq!(h.done_rx.try_recv().unwrap(), 12);
        assert_eq!(h.received().await, vec![end_request(12, u32::MAX)]);
        drop(tx);
    }

    #[tokio::test]
    async fn test_panicking_handler_still_ends_request() {
        struct Panics;

        #[async_trait]
        impl Handler for Panics {
            async fn received_params(&mut self, req: &Request) -> Result<()> {
                let empty: Vec<u8> = Vec::new();
                req.write_stdout(&[empty[req.params().len()]]).await
            }
        }

        let mut h = Harness::new(13);
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let task = tokio::spawn(run_request(Panics, h.ctx.clone(), rx));

        tx.send(InboundMessage::Params(Bytes::new())).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(tx.is_closed());
        assert_eq!(h.done_rx.try_recv().unwrap(), 13);
        assert_eq!(h.received().await, vec![end_request(13, u32::MAX)]);
    }

    #[tokio::test]
    async fn test_external_cancel_runs_abort_without_writing() {
        let mut h = Harness::new(10);
        let (tx, events, task) = spawn_recorder(&h, true);

        tx.send(InboundMessage::Data(Bytes::from_static(b"d")))
            .await
            .unwrap();
        h.ctx.detach();
        h.ctx.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(collect_events(events).await, vec!["abort"]);
        assert!(h.received().await.is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn test_default_handler_exits_on_abort() {
        struct Silent;
        impl Handler for Silent {}

        let mut h = Harness::new(11);
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let task = tokio::spawn(run_request(Silent, h.ctx.clone(), rx));

        tx.send(InboundMessage::Abort).await.unwrap();
        task.await.unwrap();

        assert_eq!(h.received().await, vec![end_request(11, u32::MAX)]);
    }
}
