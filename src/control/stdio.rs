//! Line output on stdout.
//!
//! stdout carries control lines only; logs go to stderr. Lines always end
//! in a bare `\n` and are flushed right away, since the supervisor blocks
//! until it sees a complete line.

use std::io::Write;

use crate::control::build_ready_message;
use crate::error::Result;
use crate::transport::ListenAddr;

/// Write `line` and a `\n` to `out`, then flush.
pub fn write_line<W: Write>(out: &mut W, line: &str) -> std::io::Result<()> {
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()
}

/// Write one line to stdout.
pub fn write_stdout_line(line: &str) -> std::io::Result<()> {
    write_line(&mut std::io::stdout().lock(), line)
}

/// Print the ready line for a bound listener.
pub fn announce_ready(addr: &ListenAddr) -> Result<()> {
    write_stdout_line(&build_ready_message(addr)?)?;
    Ok(())
}
