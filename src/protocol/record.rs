//! Record struct and record types.
//!
//! A record is the protocol's atomic framing unit: header, payload and
//! padding. [`Record`] keeps the raw type byte so records of a type this
//! crate does not know can still be answered with `UNKNOWN_TYPE`.
//!
//! # Example
//!
//! ```
//! use fcgi_backend::protocol::{Record, RecordType};
//! use bytes::Bytes;
//!
//! let record = Record::new(RecordType::Stdout, 42, Bytes::from_static(b"hello"));
//!
//! assert_eq!(record.kind(), Some(RecordType::Stdout));
//! assert_eq!(record.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{padding_for, Header, HEADER_SIZE, MAX_CONTENT_LENGTH};
use crate::error::{FcgiError, Result};

/// The eleven record types defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// web server -> backend
    BeginRequest = 1,
    /// web server -> backend
    AbortRequest = 2,
    /// backend -> web server (status)
    EndRequest = 3,
    /// web server -> backend (stream of name-value pairs)
    Params = 4,
    /// web server -> backend (request body)
    Stdin = 5,
    /// backend -> web server (response body)
    Stdout = 6,
    /// backend -> web server (error messages)
    Stderr = 7,
    /// web server -> backend (additional data)
    Data = 8,
    /// web server -> backend (names with empty values)
    GetValues = 9,
    /// backend -> web server (name-value pairs)
    GetValuesResult = 10,
    /// backend -> web server
    UnknownType = 11,
}

impl RecordType {
    /// Map a raw type byte to a known record type.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            _ => return None,
        })
    }

    /// Whether the web server may send this type to a backend.
    pub fn is_from_server(self) -> bool {
        matches!(
            self,
            RecordType::BeginRequest
                | RecordType::AbortRequest
                | RecordType::Params
                | RecordType::Stdin
                | RecordType::Data
                | RecordType::GetValues
        )
    }

    /// Whether a backend may send this type to the web server.
    #[inline]
    pub fn is_from_backend(self) -> bool {
        !self.is_from_server()
    }

    /// Whether records of this type must carry request id 0.
    pub fn is_management(self) -> bool {
        matches!(
            self,
            RecordType::GetValues | RecordType::GetValuesResult | RecordType::UnknownType
        )
    }
}

impl From<RecordType> for u8 {
    fn from(value: RecordType) -> Self {
        value as u8
    }
}

/// A complete protocol record, padding stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Raw record type byte.
    pub record_type: u8,
    /// Request identifier.
    pub request_id: u16,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Record {
    /// Create a new record of a known type.
    pub fn new(record_type: RecordType, request_id: u16, payload: Bytes) -> Self {
        Self {
            record_type: record_type.into(),
            request_id,
            payload,
        }
    }

    /// Create a record from a raw type byte.
    pub fn from_raw(record_type: u8, request_id: u16, payload: Bytes) -> Self {
        Self {
            record_type,
            request_id,
            payload,
        }
    }

    /// The record type, if known.
    #[inline]
    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.record_type)
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Build the wire header for this record.
    ///
    /// Fails if the payload does not fit into a single record.
    pub fn header(&self) -> Result<Header> {
        if self.payload.len() > MAX_CONTENT_LENGTH {
            return Err(FcgiError::protocol(format!(
                "Record payload of {} bytes exceeds maximum {}",
                self.payload.len(),
                MAX_CONTENT_LENGTH
            )));
        }
        Ok(Header::new(
            self.record_type,
            self.request_id,
            self.payload.len() as u16,
        ))
    }

    /// Total number of bytes this record occupies on the wire.
    #[inline]
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + padding_for(self.payload.len()) as usize
    }
}

/// Build a complete record (header, payload, zero padding) as a single
/// byte vector.
///
/// # Example
///
/// ```
/// use fcgi_backend::protocol::{build_record, Record, RecordType};
/// use bytes::Bytes;
///
/// let record = Record::new(RecordType::Stdin, 1, Bytes::from_static(b"hello"));
/// let bytes = build_record(&record).unwrap();
/// assert_eq!(bytes.len(), 8 + 5 + 3); // header + payload + padding
/// ```
pub fn build_record(record: &Record) -> Result<Vec<u8>> {
    let header = record.header()?;
    let mut buf = Vec::with_capacity(record.wire_len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&record.payload);
    buf.resize(buf.len() + header.padding_length as usize, 0);
    Ok(buf)
}
