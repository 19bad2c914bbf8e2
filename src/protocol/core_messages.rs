use bytes::Bytes;

use crate::error::DecodeError;
use crate::protocol::codec::{MessageReader, MessageWriter};
use crate::protocol::header::Header;
use crate::protocol::{ByteOrder, MinorOpcode, Version, CORE_MAJOR_OPCODE, MAX_AUTH_DATA_LEN, MAX_LIST_LEN};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorMessage {
    pub error_class: u16,
    pub offending_minor_opcode: u8,
    /// raw value, validated by the receiver
    pub severity: u8,
    pub offending_sequence: u32,
    pub values: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionSetup {
    /// raw value, validated by the receiver
    pub must_authenticate: u8,
    pub vendor: String,
    pub release: String,
    pub auth_names: Vec<String>,
    pub versions: Vec<Version>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AuthRequired {
    /// index into the list of auth names the originator offered
    pub auth_index: u8,
    pub data: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionReply {
    /// index into the list of versions the originator offered
    pub version_index: u8,
    pub vendor: String,
    pub release: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProtocolSetup {
    /// the major opcode the originator uses for this protocol
    pub protocol_opcode: u8,
    pub must_authenticate: u8,
    pub protocol_name: String,
    pub vendor: String,
    pub release: String,
    pub auth_names: Vec<String>,
    pub versions: Vec<Version>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProtocolReply {
    pub version_index: u8,
    /// the major opcode the acceptor uses for this protocol
    pub protocol_opcode: u8,
    pub vendor: String,
    pub release: String,
}

/// The messages of the core protocol, i.e. all messages with major opcode 0
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CoreMessage {
    Error(ErrorMessage),
    ByteOrder(ByteOrder),
    ConnectionSetup(ConnectionSetup),
    AuthRequired(AuthRequired),
    AuthReply(Bytes),
    AuthNextPhase(Bytes),
    ConnectionReply(ConnectionReply),
    ProtocolSetup(ProtocolSetup),
    ProtocolReply(ProtocolReply),
    Ping,
    PingReply,
    WantToClose,
    NoClose,
}

impl CoreMessage {
    pub fn minor_opcode(&self) -> MinorOpcode {
        match self {
            CoreMessage::Error(_) => MinorOpcode::Error,
            CoreMessage::ByteOrder(_) => MinorOpcode::ByteOrder,
            CoreMessage::ConnectionSetup(_) => MinorOpcode::ConnectionSetup,
            CoreMessage::AuthRequired(_) => MinorOpcode::AuthRequired,
            CoreMessage::AuthReply(_) => MinorOpcode::AuthReply,
            CoreMessage::AuthNextPhase(_) => MinorOpcode::AuthNextPhase,
            CoreMessage::ConnectionReply(_) => MinorOpcode::ConnectionReply,
            CoreMessage::ProtocolSetup(_) => MinorOpcode::ProtocolSetup,
            CoreMessage::ProtocolReply(_) => MinorOpcode::ProtocolReply,
            CoreMessage::Ping => MinorOpcode::Ping,
            CoreMessage::PingReply => MinorOpcode::PingReply,
            CoreMessage::WantToClose => MinorOpcode::WantToClose,
            CoreMessage::NoClose => MinorOpcode::NoClose,
        }
    }

    pub fn encode(&self, byte_order: ByteOrder) -> Bytes {
        let mut w = MessageWriter::new(CORE_MAJOR_OPCODE, self.minor_opcode().into(), byte_order);

        match self {
            CoreMessage::Error(msg) => {
                w.set_data_u16(msg.error_class);
                w.put_u8(msg.offending_minor_opcode);
                w.put_u8(msg.severity);
                w.put_u16(0);
                w.put_u32(msg.offending_sequence);
                w.put_slice(&msg.values);
            }
            CoreMessage::ByteOrder(order) => {
                w.set_data([(*order).into(), 0]);
            }
            CoreMessage::ConnectionSetup(msg) => {
                let versions = capped(&msg.versions);
                let auth_names = capped(&msg.auth_names);
                w.set_data([versions.len() as u8, auth_names.len() as u8]);
                w.put_u8(msg.must_authenticate);
                w.put_zeros(7);
                w.put_string(&msg.vendor);
                w.put_string(&msg.release);
                w.put_string_list(auth_names);
                for v in versions {
                    w.put_version(*v);
                }
            }
            CoreMessage::AuthRequired(msg) => {
                w.set_data([msg.auth_index, 0]);
                put_auth_data(&mut w, &msg.data);
            }
            CoreMessage::AuthReply(data) | CoreMessage::AuthNextPhase(data) => {
                put_auth_data(&mut w, data);
            }
            CoreMessage::ConnectionReply(msg) => {
                w.set_data([msg.version_index, 0]);
                w.put_string(&msg.vendor);
                w.put_string(&msg.release);
            }
            CoreMessage::ProtocolSetup(msg) => {
                let versions = capped(&msg.versions);
                let auth_names = capped(&msg.auth_names);
                w.set_data([msg.protocol_opcode, msg.must_authenticate]);
                w.put_u8(versions.len() as u8);
                w.put_u8(auth_names.len() as u8);
                w.put_zeros(6);
                w.put_string(&msg.protocol_name);
                w.put_string(&msg.vendor);
                w.put_string(&msg.release);
                w.put_string_list(auth_names);
                for v in versions {
                    w.put_version(*v);
                }
            }
            CoreMessage::ProtocolReply(msg) => {
                w.set_data([msg.version_index, msg.protocol_opcode]);
                w.put_string(&msg.vendor);
                w.put_string(&msg.release);
            }
            CoreMessage::Ping |
            CoreMessage::PingReply |
            CoreMessage::WantToClose |
            CoreMessage::NoClose => {}
        }

        w.finish()
    }

    /// Decodes a core message from its header and its complete body. The body must be exactly
    ///  the length declared in the header, and the content must fill it exactly.
    pub fn decode(minor_opcode: MinorOpcode, header: &Header, body: &[u8], byte_order: ByteOrder) -> Result<CoreMessage, DecodeError> {
        let mut r = MessageReader::new(body, byte_order);

        let result = match minor_opcode {
            MinorOpcode::Error => {
                let offending_minor_opcode = r.get_u8()?;
                let severity = r.get_u8()?;
                r.skip(2)?;
                let offending_sequence = r.get_u32()?;
                // the values' layout depends on the error class, they are interpreted lazily
                let values = Bytes::copy_from_slice(r.remaining());
                r.skip(values.len())?;
                CoreMessage::Error(ErrorMessage {
                    error_class: header.data_u16(byte_order),
                    offending_minor_opcode,
                    severity,
                    offending_sequence,
                    values,
                })
            }
            MinorOpcode::ByteOrder => {
                // the announced byte order is validated by the dispatcher before any decoding
                CoreMessage::ByteOrder(ByteOrder::try_from(header.data[0]).unwrap_or(byte_order))
            }
            MinorOpcode::ConnectionSetup => {
                let must_authenticate = r.get_u8()?;
                r.skip(7)?;
                let vendor = r.get_string()?;
                let release = r.get_string()?;
                let auth_names = r.get_string_list(header.data[1] as usize)?;
                let versions = r.get_version_list(header.data[0] as usize)?;
                CoreMessage::ConnectionSetup(ConnectionSetup {
                    must_authenticate,
                    vendor,
                    release,
                    auth_names,
                    versions,
                })
            }
            MinorOpcode::AuthRequired => {
                let data = get_auth_data(&mut r)?;
                CoreMessage::AuthRequired(AuthRequired {
                    auth_index: header.data[0],
                    data,
                })
            }
            MinorOpcode::AuthReply => CoreMessage::AuthReply(get_auth_data(&mut r)?),
            MinorOpcode::AuthNextPhase => CoreMessage::AuthNextPhase(get_auth_data(&mut r)?),
            MinorOpcode::ConnectionReply => {
                let vendor = r.get_string()?;
                let release = r.get_string()?;
                CoreMessage::ConnectionReply(ConnectionReply {
                    version_index: header.data[0],
                    vendor,
                    release,
                })
            }
            MinorOpcode::ProtocolSetup => {
                let version_count = r.get_u8()? as usize;
                let auth_count = r.get_u8()? as usize;
                r.skip(6)?;
                let protocol_name = r.get_string()?;
                let vendor = r.get_string()?;
                let release = r.get_string()?;
                let auth_names = r.get_string_list(auth_count)?;
                let versions = r.get_version_list(version_count)?;
                CoreMessage::ProtocolSetup(ProtocolSetup {
                    protocol_opcode: header.data[0],
                    must_authenticate: header.data[1],
                    protocol_name,
                    vendor,
                    release,
                    auth_names,
                    versions,
                })
            }
            MinorOpcode::ProtocolReply => {
                let vendor = r.get_string()?;
                let release = r.get_string()?;
                CoreMessage::ProtocolReply(ProtocolReply {
                    version_index: header.data[0],
                    protocol_opcode: header.data[1],
                    vendor,
                    release,
                })
            }
            MinorOpcode::Ping => CoreMessage::Ping,
            MinorOpcode::PingReply => CoreMessage::PingReply,
            MinorOpcode::WantToClose => CoreMessage::WantToClose,
            MinorOpcode::NoClose => CoreMessage::NoClose,
        };

        r.finish()?;
        Ok(result)
    }
}

/// the leading entries that fit a u8 count
fn capped<T>(list: &[T]) -> &[T] {
    &list[..list.len().min(MAX_LIST_LEN)]
}

/// Auth sessions refuse to produce more than fits the u16 length, so truncating here only
///  keeps the message well-formed.
fn put_auth_data(w: &mut MessageWriter, data: &[u8]) {
    let data = &data[..data.len().min(MAX_AUTH_DATA_LEN)];
    w.put_u16(data.len() as u16);
    w.put_zeros(6);
    w.put_slice(data);
}

fn get_auth_data(r: &mut MessageReader) -> Result<Bytes, DecodeError> {
    let len = r.get_u16()? as usize;
    r.skip(6)?;
    Ok(Bytes::copy_from_slice(r.get_bytes(len)?))
}
