use bytes::{Buf, BufMut};

use crate::error::DecodeError;
use crate::protocol::ByteOrder;


macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> Result<$ty, DecodeError> {
            if self.remaining() < size_of::<$ty>() {
                return Err(DecodeError::Truncated { needed: size_of::<$ty>() - self.remaining() });
            }
            Ok(self.$getter())
        }
    }
}

/// Checked reads for ICE's fixed width fields, in whichever byte order the sender announced
pub trait BufExt: Buf {
    get_try_impl!(try_get_u8, u8, get_u8);
    get_try_impl!(try_get_u16_le, u16, get_u16_le);
    get_try_impl!(try_get_u16_be, u16, get_u16);
    get_try_impl!(try_get_u32_le, u32, get_u32_le);
    get_try_impl!(try_get_u32_be, u32, get_u32);

    fn try_get_u16_in(&mut self, byte_order: ByteOrder) -> Result<u16, DecodeError> {
        match byte_order {
            ByteOrder::LsbFirst => self.try_get_u16_le(),
            ByteOrder::MsbFirst => self.try_get_u16_be(),
        }
    }

    fn try_get_u32_in(&mut self, byte_order: ByteOrder) -> Result<u32, DecodeError> {
        match byte_order {
            ByteOrder::LsbFirst => self.try_get_u32_le(),
            ByteOrder::MsbFirst => self.try_get_u32_be(),
        }
    }

    fn try_skip(&mut self, n: usize) -> Result<(), DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated { needed: n - self.remaining() });
        }
        self.advance(n);
        Ok(())
    }
}

pub trait BufMutExt: BufMut {
    fn put_u16_in(&mut self, value: u16, byte_order: ByteOrder) {
        match byte_order {
            ByteOrder::LsbFirst => self.put_u16_le(value),
            ByteOrder::MsbFirst => self.put_u16(value),
        }
    }

    fn put_u32_in(&mut self, value: u32, byte_order: ByteOrder) {
        match byte_order {
            ByteOrder::LsbFirst => self.put_u32_le(value),
            ByteOrder::MsbFirst => self.put_u32(value),
        }
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
