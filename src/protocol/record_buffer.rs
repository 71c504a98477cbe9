//! Record buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented records:
//! - `WaitingForHeader`: Need at least 8 bytes
//! - `WaitingForBody`: Header parsed and validated, need payload + padding
//!
//! # Example
//!
//! ```
//! use fcgi_backend::protocol::{build_record, Record, RecordBuffer, RecordType};
//! use bytes::Bytes;
//!
//! let bytes = build_record(&Record::new(RecordType::Stdin, 1, Bytes::from_static(b"hi"))).unwrap();
//!
//! let mut buffer = RecordBuffer::new();
//! assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
//! let records = buffer.push(&bytes[5..]).unwrap();
//! assert_eq!(records[0].payload(), b"hi");
//! ```

use bytes::BytesMut;

use super::record::Record;
use super::wire_format::{Header, HEADER_SIZE, MAX_CONTENT_LENGTH};
use crate::error::Result;

/// State machine for record parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 8 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload and padding bytes.
    WaitingForBody { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete records.
pub struct RecordBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
}

impl RecordBuffer {
    /// Create a new record buffer sized for one maximal record.
    pub fn new() -> Self {
        Self::with_capacity(HEADER_SIZE + MAX_CONTENT_LENGTH + 8)
    }

    /// Create a new record buffer with custom initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
        }
    }

    /// Push data into the buffer and extract all complete records.
    ///
    /// # Errors
    ///
    /// Returns error on an invalid header (version, padding). The buffer is
    /// unusable afterwards, the format offers no way to resynchronize.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Record>> {
        self.buffer.extend_from_slice(data);

        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Try to extract a single record from the buffered bytes.
    ///
    /// Returns:
    /// - `Ok(Some(record))` if a complete record was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a protocol violation
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let Some(header) = Header::decode(&self.buffer) else {
                        return Ok(None);
                    };
                    header.validate()?;

                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForBody { header };
                }

                State::WaitingForBody { header } => {
                    let header = *header;
                    if self.buffer.len() < header.body_length() {
                        return Ok(None);
                    }

                    let payload = self
                        .buffer
                        .split_to(header.content_length as usize)
                        .freeze();
                    let _ = self.buffer.split_to(header.padding_length as usize);
                    self.state = State::WaitingForHeader;

                    return Ok(Some(Record::from_raw(
                        header.record_type,
                        header.request_id,
                        payload,
                    )));
                }
            }
        }
    }

    /// Mutable access to the raw buffer, for reading directly from a socket.
    pub(crate) fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Get the number of buffered bytes (not yet part of a returned record).
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True if no partial record is pending.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::WaitingForHeader)
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::new()
    }
}
