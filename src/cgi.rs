//! CGI program runner.
//!
//! [`CgiHandler`] executes one CGI program per request:
//! - the program is `INTERPRETER`, or `SCRIPT_FILENAME` when unset
//! - the environment is the request parameters plus this process' `PATH`
//! - STDIN records are piped to the program, the empty record closes its stdin
//! - program stdout/stderr are streamed back as STDOUT/STDERR records
//! - the request finishes with the program's exit code once it exited and
//!   both pipes are drained; a program killed by a signal reports minus the
//!   signal number

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;

use crate::error::Result;
use crate::protocol::ProtocolStatus;
use crate::request::{Handler, Request, RequestContext};

/// Size of a single read from the program's stdout/stderr.
const READ_CHUNK: usize = 8192;

/// Response sent when neither `INTERPRETER` nor `SCRIPT_FILENAME` is set.
const MISSING_TARGET_RESPONSE: &[u8] = b"Status: 500\r\nContent-Type: text/plain\r\n\r\n";

/// Runs a CGI program for a request.
#[derive(Default)]
pub struct CgiHandler {
    stdin: Option<ChildStdin>,
    kill: Option<oneshot::Sender<()>>,
}

impl CgiHandler {
    /// Handler with no program started yet.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Handler for CgiHandler {
    async fn received_params(&mut self, req: &Request) -> Result<()> {
        let target = [b"INTERPRETER".as_slice(), b"SCRIPT_FILENAME".as_slice()]
            .into_iter()
            .filter_map(|name| req.param(name))
            .find(|value| !value.is_empty());
        let Some(target) = target else {
            tracing::debug!("Request {}: no CGI program given", req.request_id());
            req.write_stdout(MISSING_TARGET_RESPONSE).await?;
            return req.finish(0, ProtocolStatus::RequestComplete).await;
        };

        let mut command = Command::new(OsStr::from_bytes(target));
        command.env_clear();
        for (name, value) in req.params() {
            command.env(OsStr::from_bytes(name), OsStr::from_bytes(value));
        }
        command.env("PATH", std::env::var_os("PATH").unwrap_or_default());
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        tracing::debug!(
            "Request {}: started {} (pid {:?})",
            req.request_id(),
            String::from_utf8_lossy(target),
            child.id()
        );

        self.stdin = child.stdin.take();
        let (kill_tx, kill_rx) = oneshot::channel();
        self.kill = Some(kill_tx);
        tokio::spawn(supervise(child, kill_rx, req.context().clone()));
        Ok(())
    }

    async fn recv_stdin(&mut self, _req: &Request, data: Bytes) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        if data.is_empty() {
            self.stdin = None;
            return Ok(());
        }
        if let Err(e) = stdin.write_all(&data).await {
            tracing::debug!("Dropping CGI stdin after write error: {}", e);
            self.stdin = None;
        }
        Ok(())
    }

    async fn handle_abort(&mut self, req: &Request) -> Result<()> {
        self.stdin = None;
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        req.exit(-1, ProtocolStatus::RequestComplete).await
    }
}

#[derive(Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

/// Stream the program's output, wait for it and finish the request.
///
/// The program is killed when `kill` fires or its sender is dropped.
async fn supervise(mut child: Child, kill: oneshot::Receiver<()>, ctx: RequestContext) {
    let stdout = tokio::spawn(pump(child.stdout.take(), Pipe::Stdout, ctx.clone()));
    let stderr = tokio::spawn(pump(child.stderr.take(), Pipe::Stderr, ctx.clone()));

    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            tracing::debug!("Request {}: killing CGI program", ctx.request_id());
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let _ = stdout.await;
    let _ = stderr.await;

    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::warn!("Request {}: waiting for CGI program failed: {}", ctx.request_id(), e);
            -1
        }
    };
    if let Err(e) = ctx.finish(code, ProtocolStatus::RequestComplete).await {
        tracing::debug!("Request {}: finish failed: {}", ctx.request_id(), e);
    }
}

async fn pump<R>(source: Option<R>, pipe: Pipe, ctx: RequestContext)
where
    R: AsyncRead + Unpin,
{
    if let Some(mut source) = source {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("Reading CGI output failed: {}", e);
                    break;
                }
            };
            if let Err(e) = write_pipe(&ctx, pipe, &buf[..n]).await {
                tracing::debug!("Forwarding CGI output failed: {}", e);
                break;
            }
        }
    }
    let _ = write_pipe(&ctx, pipe, b"").await;
}

async fn write_pipe(ctx: &RequestContext, pipe: Pipe, data: &[u8]) -> Result<()> {
    match pipe {
        Pipe::Stdout => ctx.write_stdout(data).await,
        Pipe::Stderr => ctx.write_stderr(data).await,
    }
}

/// Exit code, or minus the signal number for a killed program.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}
