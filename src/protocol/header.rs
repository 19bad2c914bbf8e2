use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut};

use crate::error::DecodeError;
use crate::protocol::buf_ext::{BufExt, BufMutExt};
use crate::protocol::ByteOrder;

/// The fixed eight byte header every ICE message starts with. `length` counts the 8-byte words
///  *following* the header, and it is encoded in the sender's byte order.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Header {
    pub major_opcode: u8,
    pub minor_opcode: u8,
    pub data: [u8; 2],
    pub length: u32,
}
impl Debug for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HDR{{{}:{} [{},{}] +{}w}}", self.major_opcode, self.minor_opcode, self.data[0], self.data[1], self.length)
    }
}

impl Header {
    pub const SIZE: usize = 8;

    pub fn new(major_opcode: u8, minor_opcode: u8, data: [u8; 2], length: u32) -> Header {
        Header {
            major_opcode,
            minor_opcode,
            data,
            length,
        }
    }

    pub fn body_len(&self) -> usize {
        self.length as usize * 8
    }

    /// interprets the two data bytes as a single u16 (used e.g. for an `Error`'s error class)
    pub fn data_u16(&self, byte_order: ByteOrder) -> u16 {
        match (&self.data[..]).try_get_u16_in(byte_order) {
            Ok(value) => value,
            Err(_) => unreachable!("the data field is two bytes"),
        }
    }

    pub fn data_from_u16(value: u16, byte_order: ByteOrder) -> [u8; 2] {
        let mut data = [0u8; 2];
        (&mut data[..]).put_u16_in(value, byte_order);
        data
    }

    pub fn ser(&self, buf: &mut impl BufMut, byte_order: ByteOrder) {
        buf.put_u8(self.major_opcode);
        buf.put_u8(self.minor_opcode);
        buf.put_slice(&self.data);
        buf.put_u32_in(self.length, byte_order);
    }

    /// reads a header from its eight raw bytes, which always hold a complete header
    pub fn deser(raw: &[u8; Header::SIZE], byte_order: ByteOrder) -> Header {
        match Self::try_deser(&mut &raw[..], byte_order) {
            Ok(header) => header,
            Err(_) => unreachable!("a header is exactly {} bytes", Header::SIZE),
        }
    }

    pub fn try_deser(buf: &mut impl Buf, byte_order: ByteOrder) -> Result<Header, DecodeError> {
        let major_opcode = buf.try_get_u8()?;
        let minor_opcode = buf.try_get_u8()?;
        let data = [buf.try_get_u8()?, buf.try_get_u8()?];
        let length = buf.try_get_u32_in(byte_order)?;

        Ok(Header {
            major_opcode,
            minor_opcode,
            data,
            length,
        })
    }
}
