use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::protocol::buf_ext::{BufExt, BufMutExt};
use crate::protocol::header::Header;
use crate::protocol::{padding, word_count, ByteOrder, Version};

/// Builds a single message in a given byte order. The header's length field is filled in by
///  [MessageWriter::finish], which also pads the message to a multiple of 8 bytes.
pub struct MessageWriter {
    buf: BytesMut,
    byte_order: ByteOrder,
}

impl MessageWriter {
    pub fn new(major_opcode: u8, minor_opcode: u8, byte_order: ByteOrder) -> MessageWriter {
        let mut buf = BytesMut::with_capacity(64);
        Header::new(major_opcode, minor_opcode, [0, 0], 0)
            .ser(&mut buf, byte_order);

        MessageWriter {
            buf,
            byte_order,
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn set_data(&mut self, data: [u8; 2]) {
        self.buf[2..4].copy_from_slice(&data);
    }

    pub fn set_data_u16(&mut self, value: u16) {
        self.set_data(Header::data_from_u16(value, self.byte_order));
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16_in(value, self.byte_order);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32_in(value, self.byte_order);
    }

    pub fn put_zeros(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// A STRING is a u16 length followed by the string's bytes, padded to a multiple of four
    pub fn put_string(&mut self, s: &str) {
        let len = s.len().min(u16::MAX as usize);
        self.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
        self.put_zeros(padding(2 + len, 4));
    }

    pub fn put_string_list<S: AsRef<str>>(&mut self, strings: &[S]) {
        for s in strings {
            self.put_string(s.as_ref());
        }
    }

    pub fn put_version(&mut self, version: Version) {
        self.put_u16(version.major);
        self.put_u16(version.minor);
    }

    pub fn pad_to_word(&mut self) {
        self.put_zeros(padding(self.buf.len(), 8));
    }

    pub fn finish(mut self) -> Bytes {
        self.pad_to_word();
        let words = ((self.buf.len() - Header::SIZE) / 8) as u32;
        let mut length_field = &mut self.buf[4..8];
        length_field.put_u32_in(words, self.byte_order);
        self.buf.freeze()
    }
}

/// Reads the body of a message (i.e. everything after the header) in the sender's byte order.
///  The body passed in is the full declared length of the message, so reading past its end
///  means the message's content does not fit its declared length.
pub struct MessageReader<'a> {
    buf: &'a [u8],
    body_len: usize,
    byte_order: ByteOrder,
}

impl <'a> MessageReader<'a> {
    pub fn new(body: &'a [u8], byte_order: ByteOrder) -> MessageReader<'a> {
        MessageReader {
            buf: body,
            body_len: body.len(),
            byte_order,
        }
    }

    pub fn consumed(&self) -> usize {
        self.body_len - self.buf.remaining()
    }

    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let raw: &'a [u8] = self.buf;
        self.buf.try_skip(n)?;
        Ok(&raw[..n])
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        self.buf.try_get_u8()
    }

    pub fn get_u16(&mut self) -> Result<u16, DecodeError> {
        self.buf.try_get_u16_in(self.byte_order)
    }

    pub fn get_u32(&mut self) -> Result<u32, DecodeError> {
        self.buf.try_get_u32_in(self.byte_order)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.buf.try_skip(n)
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.take(n)
    }

    /// Unlike a fixed field, a string running past the end of the message is always an
    ///  overrun: its length prefix is part of the data the peer got wrong.
    pub fn get_string(&mut self) -> Result<String, DecodeError> {
        let len = self.get_u16()
            .map_err(|_| DecodeError::StringOverrun)? as usize;
        let raw = self.take(len)
            .map_err(|_| DecodeError::StringOverrun)?;
        self.take(padding(2 + len, 4))
            .map_err(|_| DecodeError::StringOverrun)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    pub fn get_string_list(&mut self, count: usize) -> Result<Vec<String>, DecodeError> {
        let mut result = Vec::with_capacity(count);
        for _ in 0..count {
            result.push(self.get_string()?);
        }
        Ok(result)
    }

    pub fn get_version(&mut self) -> Result<Version, DecodeError> {
        let major = self.get_u16()?;
        let minor = self.get_u16()?;
        Ok(Version::new(major, minor))
    }

    pub fn get_version_list(&mut self, count: usize) -> Result<Vec<Version>, DecodeError> {
        let mut result = Vec::with_capacity(count);
        for _ in 0..count {
            result.push(self.get_version()?);
        }
        Ok(result)
    }

    /// Checks that the content read so far, padded to whole words, is exactly the message's
    ///  declared length.
    pub fn finish(self) -> Result<(), DecodeError> {
        let declared = self.body_len / 8;
        let actual = word_count(self.consumed());
        if declared != actual {
            return Err(DecodeError::LengthMismatch { declared, actual });
        }
        Ok(())
    }
}
