//! Protocol module - wire format, record framing, pair encoding and typed
//! messages.
//!
//! This module is pure data transformation:
//! - 8-byte header encoding/decoding and validation
//! - Record buffer for accumulating partial reads
//! - Name/value pair streams
//! - Typed messages for both directions

mod message;
mod pairs;
mod record;
mod record_buffer;
mod wire_format;

pub use message::{
    BeginRequest, ClientMessage, EndRequest, GetValues, GetValuesResult, ProtocolStatus, Role,
    ServerMessage, UnknownType,
};
pub use pairs::{decode_length, encode_length, pack_pairs, unpack_pairs};
pub use record::{build_record, Record, RecordType};
pub use record_buffer::RecordBuffer;
pub use wire_format::{
    padding_for, values, Header, FCGI_KEEP_CONN, FCGI_VERSION, HEADER_SIZE, MAX_CONTENT_LENGTH,
    NULL_REQUEST_ID, RECORD_ALIGNMENT,
};
