//! Wire format encoding and decoding.
//!
//! Implements the 8-byte FastCGI record header:
//! ```text
//! ┌─────────┬────────┬───────────┬───────────────┬─────────┬──────────┐
//! │ Version │ Type   │ Req ID    │ ContentLength │ Padding │ Reserved │
//! │ 1 byte  │ 1 byte │ uint16 BE │ uint16 BE     │ 1 byte  │ 1 byte   │
//! └─────────┴────────┴───────────┴───────────────┴─────────┴──────────┘
//! ```
//!
//! The header is followed by `content_length` payload bytes and then
//! `padding_length` ignorable bytes. All multi-byte integers are Big Endian.

use crate::error::{FcgiError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// The only protocol version this crate speaks.
pub const FCGI_VERSION: u8 = 1;

/// Largest payload a single record can carry.
pub const MAX_CONTENT_LENGTH: usize = u16::MAX as usize;

/// Request id used by management records.
pub const NULL_REQUEST_ID: u16 = 0;

/// Records are padded so that content plus padding is a multiple of this.
pub const RECORD_ALIGNMENT: usize = 8;

/// Flag bit in BEGIN_REQUEST: keep the connection open after the request.
pub const FCGI_KEEP_CONN: u8 = 0x01;

/// Names understood in GET_VALUES / GET_VALUES_RESULT records.
pub mod values {
    /// Maximum number of concurrent transport connections.
    pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
    /// Maximum number of concurrent requests.
    pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
    /// "0" if the application does not multiplex connections, else "1".
    pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";
}

/// Number of padding bytes needed after `content_length` payload bytes.
#[inline]
pub fn padding_for(content_length: usize) -> u8 {
    ((RECORD_ALIGNMENT - content_length % RECORD_ALIGNMENT) % RECORD_ALIGNMENT) as u8
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (must be 1).
    pub version: u8,
    /// Raw record type byte (see [`RecordType`](super::RecordType)).
    pub record_type: u8,
    /// Request identifier (0 = management record).
    pub request_id: u16,
    /// Payload length in bytes.
    pub content_length: u16,
    /// Trailing padding length in bytes.
    pub padding_length: u8,
}

impl Header {
    /// Create a header for a payload of `content_length` bytes, with the
    /// padding computed so the record stays 8-byte aligned.
    pub fn new(record_type: u8, request_id: u16, content_length: u16) -> Self {
        Self {
            version: FCGI_VERSION,
            record_type,
            request_id,
            content_length,
            padding_length: padding_for(content_length as usize),
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use fcgi_backend::protocol::Header;
    ///
    /// let header = Header::new(6, 1, 5);
    /// let bytes = header.encode();
    /// assert_eq!(bytes, [1, 6, 0, 1, 0, 5, 3, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (8 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.version;
        buf[1] = self.record_type;
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf[7] = 0;
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short. No validation is done here,
    /// see [`Header::validate`].
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Version is 1
    /// - Padding is shorter than 8 bytes
    /// - Content plus padding is a multiple of 8
    pub fn validate(&self) -> Result<()> {
        if self.version != FCGI_VERSION {
            return Err(FcgiError::protocol(format!(
                "Invalid packet version {}",
                self.version
            )));
        }

        let total = self.content_length as usize + self.padding_length as usize;
        if self.padding_length as usize >= RECORD_ALIGNMENT || total % RECORD_ALIGNMENT != 0 {
            return Err(FcgiError::protocol(format!(
                "Invalid packet pad_len (data_len = {}, pad_len = {})",
                self.content_length, self.padding_length
            )));
        }

        Ok(())
    }

    /// Bytes following the header: payload plus padding.
    #[inline]
    pub fn body_length(&self) -> usize {
        self.content_length as usize + self.padding_length as usize
    }
}
