//! The ICE wire format: message header, encoding primitives, and the messages of the core
//!  protocol (major opcode 0).
//!
//! Everything in here is a pure function of bytes and a byte order. The connection decides
//!  which byte order applies, and nothing in here mutates received data in place.

pub mod buf_ext;
pub mod codec;
pub mod core_messages;
pub mod header;

use std::fmt::{Debug, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The major opcode of the core protocol. Sub-protocols get opcodes 1..=255.
pub const CORE_MAJOR_OPCODE: u8 = 0;

/// Protocol name used for core connection setup when consulting the auth policy
pub const ICE_PROTOCOL_NAME: &str = "ICE";

/// Auth data travels with a u16 length
pub const MAX_AUTH_DATA_LEN: usize = u16::MAX as usize;

/// Version and auth name lists are announced with a u8 count
pub const MAX_LIST_LEN: usize = u8::MAX as usize;

/// Versions of the core protocol this implementation speaks, in order of preference
pub const ICE_VERSIONS: [Version; 1] = [Version::new(1, 0)];

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MinorOpcode {
    Error = 0,
    ByteOrder = 1,
    ConnectionSetup = 2,
    AuthRequired = 3,
    AuthReply = 4,
    AuthNextPhase = 5,
    ConnectionReply = 6,
    ProtocolSetup = 7,
    ProtocolReply = 8,
    Ping = 9,
    PingReply = 10,
    WantToClose = 11,
    NoClose = 12,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ByteOrder {
    LsbFirst = 0,
    MsbFirst = 1,
}
impl ByteOrder {
    pub fn native() -> ByteOrder {
        if cfg!(target_endian = "little") {
            ByteOrder::LsbFirst
        }
        else {
            ByteOrder::MsbFirst
        }
    }

    pub fn opposite(self) -> ByteOrder {
        match self {
            ByteOrder::LsbFirst => ByteOrder::MsbFirst,
            ByteOrder::MsbFirst => ByteOrder::LsbFirst,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}
impl Debug for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "V{}.{}", self.major, self.minor)
    }
}
impl Version {
    pub const fn new(major: u16, minor: u16) -> Version {
        Version { major, minor }
    }
}

/// number of 8-byte words needed to hold `len` bytes
pub fn word_count(len: usize) -> usize {
    (len + 7) / 8
}

/// number of padding bytes that bring `len` up to the next multiple of `align`
pub fn padding(len: usize, align: usize) -> usize {
    (align - len % align) % align
}
