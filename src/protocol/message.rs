//! Typed protocol messages.
//!
//! [`ServerMessage`] covers everything a web server may send to a backend,
//! [`ClientMessage`] everything a backend may send back. Both can be packed
//! into and unpacked from a [`Record`]; unpacking enforces the fixed body
//! sizes, enum ranges, request id rules and direction of each type.

use bytes::{BufMut, Bytes, BytesMut};

use super::pairs::{pack_pairs, unpack_pairs};
use super::record::{Record, RecordType};
use super::wire_format::{FCGI_KEEP_CONN, NULL_REQUEST_ID};
use crate::error::{FcgiError, Result};

/// Size of the BEGIN_REQUEST, END_REQUEST and UNKNOWN_TYPE bodies.
const FIXED_BODY_SIZE: usize = 8;

/// Role requested by the web server in BEGIN_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Role {
    /// Produce a full response.
    Responder = 1,
    /// Decide whether a request is authorized.
    Authorizer = 2,
    /// Filter an additional data stream.
    Filter = 3,
}

impl TryFrom<u16> for Role {
    type Error = FcgiError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Role::Responder),
            2 => Ok(Role::Authorizer),
            3 => Ok(Role::Filter),
            other => Err(FcgiError::protocol(format!(
                "invalid BEGIN_REQUEST invalid role {}",
                other
            ))),
        }
    }
}

/// Protocol-level outcome reported in END_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ProtocolStatus {
    /// Normal end of request.
    #[default]
    RequestComplete = 0,
    /// Rejected: the application does not multiplex connections.
    CantMpxConn = 1,
    /// Rejected: the application ran out of some resource.
    Overloaded = 2,
    /// Rejected: the requested role is not supported.
    UnknownRole = 3,
}

impl TryFrom<u8> for ProtocolStatus {
    type Error = FcgiError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ProtocolStatus::RequestComplete),
            1 => Ok(ProtocolStatus::CantMpxConn),
            2 => Ok(ProtocolStatus::Overloaded),
            3 => Ok(ProtocolStatus::UnknownRole),
            other => Err(FcgiError::protocol(format!(
                "invalid END_REQUEST invalid protocol status {}",
                other
            ))),
        }
    }
}

/// BEGIN_REQUEST body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    /// Request id, never 0.
    pub request_id: u16,
    /// Requested role.
    pub role: Role,
    /// Keep the connection open once the request is done.
    pub keep_alive: bool,
}

impl BeginRequest {
    /// Pack into a record.
    pub fn pack(&self) -> Result<Record> {
        check_request_id(RecordType::BeginRequest, self.request_id)?;
        let mut body = BytesMut::with_capacity(FIXED_BODY_SIZE);
        body.put_u16(self.role as u16);
        body.put_u8(if self.keep_alive { FCGI_KEEP_CONN } else { 0 });
        body.put_bytes(0, 5);
        Ok(Record::new(RecordType::BeginRequest, self.request_id, body.freeze()))
    }

    /// Unpack from a BEGIN_REQUEST record body.
    pub fn unpack(request_id: u16, payload: &[u8]) -> Result<Self> {
        if payload.len() != FIXED_BODY_SIZE {
            return Err(FcgiError::protocol(format!(
                "invalid BEGIN_REQUEST payload {:?}",
                payload
            )));
        }
        check_request_id(RecordType::BeginRequest, request_id)?;
        let role = Role::try_from(u16::from_be_bytes([payload[0], payload[1]]))?;
        Ok(Self {
            request_id,
            role,
            keep_alive: payload[2] & FCGI_KEEP_CONN != 0,
        })
    }
}

/// END_REQUEST body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    /// Request id, never 0.
    pub request_id: u16,
    /// Application exit status.
    pub app_status: u32,
    /// Protocol-level outcome.
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    /// Pack into a record.
    pub fn pack(&self) -> Result<Record> {
        check_request_id(RecordType::EndRequest, self.request_id)?;
        let mut body = BytesMut::with_capacity(FIXED_BODY_SIZE);
        body.put_u32(self.app_status);
        body.put_u8(self.protocol_status as u8);
        body.put_bytes(0, 3);
        Ok(Record::new(RecordType::EndRequest, self.request_id, body.freeze()))
    }

    /// Unpack from an END_REQUEST record body.
    pub fn unpack(request_id: u16, payload: &[u8]) -> Result<Self> {
        if payload.len() != FIXED_BODY_SIZE {
            return Err(FcgiError::protocol(format!(
                "invalid END_REQUEST payload {:?}",
                payload
            )));
        }
        check_request_id(RecordType::EndRequest, request_id)?;
        Ok(Self {
            request_id,
            app_status: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            protocol_status: ProtocolStatus::try_from(payload[4])?,
        })
    }
}

/// UNKNOWN_TYPE body: the rejected record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownType {
    /// The type byte that was not understood.
    pub record_type: u8,
}

impl UnknownType {
    /// Pack into a record.
    pub fn pack(&self) -> Result<Record> {
        let mut body = BytesMut::with_capacity(FIXED_BODY_SIZE);
        body.put_u8(self.record_type);
        body.put_bytes(0, 7);
        Ok(Record::new(RecordType::UnknownType, NULL_REQUEST_ID, body.freeze()))
    }

    /// Unpack from an UNKNOWN_TYPE record body.
    pub fn unpack(request_id: u16, payload: &[u8]) -> Result<Self> {
        if payload.len() != FIXED_BODY_SIZE {
            return Err(FcgiError::protocol(format!(
                "invalid UNKNOWN_TYPE payload {:?}",
                payload
            )));
        }
        check_request_id(RecordType::UnknownType, request_id)?;
        Ok(Self {
            record_type: payload[0],
        })
    }
}

/// GET_VALUES body: the names the web server asks about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetValues {
    /// Requested names, in request order.
    pub names: Vec<Bytes>,
}

impl GetValues {
    /// Pack into a record; values are always empty.
    pub fn pack(&self) -> Result<Record> {
        let payload = pack_pairs(self.names.iter().map(|name| (name, b"")))?;
        Ok(Record::new(RecordType::GetValues, NULL_REQUEST_ID, payload))
    }

    /// Unpack from a GET_VALUES record body.
    pub fn unpack(request_id: u16, payload: &[u8]) -> Result<Self> {
        check_request_id(RecordType::GetValues, request_id)?;
        let mut names = Vec::new();
        for (name, value) in unpack_pairs(payload)? {
            if !value.is_empty() {
                return Err(FcgiError::protocol(format!(
                    "non-empty value {:?} in GET_VALUES pair for name {:?}",
                    value, name
                )));
            }
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(Self { names })
    }
}

/// GET_VALUES_RESULT body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetValuesResult {
    /// Known names and their values.
    pub values: Vec<(Bytes, Bytes)>,
}

impl GetValuesResult {
    /// Look up a value by name.
    pub fn get(&self, name: &[u8]) -> Option<&Bytes> {
        self.values
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, v)| v)
    }

    /// Pack into a record.
    pub fn pack(&self) -> Result<Record> {
        let payload = pack_pairs(self.values.iter().map(|(n, v)| (n, v)))?;
        Ok(Record::new(RecordType::GetValuesResult, NULL_REQUEST_ID, payload))
    }

    /// Unpack from a GET_VALUES_RESULT record body.
    pub fn unpack(request_id: u16, payload: &[u8]) -> Result<Self> {
        check_request_id(RecordType::GetValuesResult, request_id)?;
        Ok(Self {
            values: unpack_pairs(payload)?,
        })
    }
}

/// A message sent by the web server to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Start a new request.
    BeginRequest(BeginRequest),
    /// Abort an open request.
    AbortRequest {
        /// Target request.
        request_id: u16,
    },
    /// Chunk of the PARAMS stream (empty = end of stream).
    Params {
        /// Target request.
        request_id: u16,
        /// Raw pair-stream chunk.
        payload: Bytes,
    },
    /// Chunk of the request body (empty = end of stream).
    Stdin {
        /// Target request.
        request_id: u16,
        /// Body chunk.
        payload: Bytes,
    },
    /// Chunk of the FILTER data stream (empty = end of stream).
    Data {
        /// Target request.
        request_id: u16,
        /// Data chunk.
        payload: Bytes,
    },
    /// Capability query.
    GetValues(GetValues),
}

impl ServerMessage {
    /// Decode a record received from a web server.
    ///
    /// Types a web server may not send are protocol violations.
    pub fn unpack(record: &Record) -> Result<Self> {
        let id = record.request_id;
        let payload = &record.payload;
        let Some(kind) = record.kind().filter(|k| k.is_from_server()) else {
            return Err(FcgiError::protocol(format!(
                "Message type not allowed from server {}",
                record.record_type
            )));
        };

        Ok(match kind {
            RecordType::BeginRequest => ServerMessage::BeginRequest(BeginRequest::unpack(id, payload)?),
            RecordType::AbortRequest => {
                if !payload.is_empty() {
                    return Err(FcgiError::protocol("non-empty ABORT_REQUEST"));
                }
                check_request_id(kind, id)?;
                ServerMessage::AbortRequest { request_id: id }
            }
            RecordType::Params => {
                check_request_id(kind, id)?;
                ServerMessage::Params {
                    request_id: id,
                    payload: payload.clone(),
                }
            }
            RecordType::Stdin => {
                check_request_id(kind, id)?;
                ServerMessage::Stdin {
                    request_id: id,
                    payload: payload.clone(),
                }
            }
            RecordType::Data => {
                check_request_id(kind, id)?;
                ServerMessage::Data {
                    request_id: id,
                    payload: payload.clone(),
                }
            }
            RecordType::GetValues => ServerMessage::GetValues(GetValues::unpack(id, payload)?),
            _ => unreachable!("filtered by is_from_server"),
        })
    }

    /// Encode into a record.
    pub fn pack(&self) -> Result<Record> {
        match self {
            ServerMessage::BeginRequest(msg) => msg.pack(),
            ServerMessage::AbortRequest { request_id } => {
                stream_record(RecordType::AbortRequest, *request_id, Bytes::new())
            }
            ServerMessage::Params {
                request_id,
                payload,
            } => stream_record(RecordType::Params, *request_id, payload.clone()),
            ServerMessage::Stdin {
                request_id,
                payload,
            } => stream_record(RecordType::Stdin, *request_id, payload.clone()),
            ServerMessage::Data {
                request_id,
                payload,
            } => stream_record(RecordType::Data, *request_id, payload.clone()),
            ServerMessage::GetValues(msg) => msg.pack(),
        }
    }
}

/// A message sent by the backend to the web server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Request finished.
    EndRequest(EndRequest),
    /// Chunk of the response body (empty = end of stream).
    Stdout {
        /// Source request.
        request_id: u16,
        /// Body chunk.
        payload: Bytes,
    },
    /// Chunk of the error stream (empty = end of stream).
    Stderr {
        /// Source request.
        request_id: u16,
        /// Error chunk.
        payload: Bytes,
    },
    /// Answer to GET_VALUES.
    GetValuesResult(GetValuesResult),
    /// Answer to a record of unknown type.
    UnknownType(UnknownType),
}

impl ClientMessage {
    /// Decode a record received from a backend.
    ///
    /// Types a backend may not send are protocol violations.
    pub fn unpack(record: &Record) -> Result<Self> {
        let id = record.request_id;
        let payload = &record.payload;
        let Some(kind) = record.kind().filter(|k| k.is_from_backend()) else {
            return Err(FcgiError::protocol(format!(
                "Message type not allowed from client {}",
                record.record_type
            )));
        };

        Ok(match kind {
            RecordType::EndRequest => ClientMessage::EndRequest(EndRequest::unpack(id, payload)?),
            RecordType::Stdout => {
                check_request_id(kind, id)?;
                ClientMessage::Stdout {
                    request_id: id,
                    payload: payload.clone(),
                }
            }
            RecordType::Stderr => {
                check_request_id(kind, id)?;
                ClientMessage::Stderr {
                    request_id: id,
                    payload: payload.clone(),
                }
            }
            RecordType::GetValuesResult => {
                ClientMessage::GetValuesResult(GetValuesResult::unpack(id, payload)?)
            }
            RecordType::UnknownType => ClientMessage::UnknownType(UnknownType::unpack(id, payload)?),
            _ => unreachable!("filtered by is_from_backend"),
        })
    }

    /// Encode into a record.
    pub fn pack(&self) -> Result<Record> {
        match self {
            ClientMessage::EndRequest(msg) => msg.pack(),
            ClientMessage::Stdout {
                request_id,
                payload,
            } => stream_record(RecordType::Stdout, *request_id, payload.clone()),
            ClientMessage::Stderr {
                request_id,
                payload,
            } => stream_record(RecordType::Stderr, *request_id, payload.clone()),
            ClientMessage::GetValuesResult(msg) => msg.pack(),
            ClientMessage::UnknownType(msg) => msg.pack(),
        }
    }

    /// Request id the message belongs to (0 for management messages).
    pub fn request_id(&self) -> u16 {
        match self {
            ClientMessage::EndRequest(msg) => msg.request_id,
            ClientMessage::Stdout { request_id, .. } | ClientMessage::Stderr { request_id, .. } => {
                *request_id
            }
            ClientMessage::GetValuesResult(_) | ClientMessage::UnknownType(_) => NULL_REQUEST_ID,
        }
    }
}

fn stream_record(kind: RecordType, request_id: u16, payload: Bytes) -> Result<Record> {
    check_request_id(kind, request_id)?;
    let record = Record::new(kind, request_id, payload);
    record.header()?;
    Ok(record)
}

/// Management types must use request id 0, all others a nonzero id.
fn check_request_id(kind: RecordType, request_id: u16) -> Result<()> {
    if kind.is_management() != (request_id == NULL_REQUEST_ID) {
        return Err(FcgiError::protocol(format!(
            "invalid {:?} request id {}",
            kind, request_id
        )));
    }
    Ok(())
}
