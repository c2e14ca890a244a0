use anyhow::bail;
use bytes::{Buf, BufMut};

macro_rules! try_read_impl {
    ($try_reader: ident, $ty:ty, $getter: ident) => {
        fn $try_reader(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                bail!("buffer underflow: expected {} bytes, {} remaining", std::mem::size_of::<$ty>(), self.remaining());
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reads in network byte order. A failed read leaves the buffer untouched.
pub trait BufExt: Buf {
    try_read_impl!(try_read_u8, u8, get_u8);
    try_read_impl!(try_read_u16, u16, get_u16);
    try_read_impl!(try_read_u32, u32, get_u32);
    try_read_impl!(try_read_u64, u64, get_u64);
    try_read_impl!(try_read_u128, u128, get_u128);

    fn try_read_bool(&mut self) -> anyhow::Result<bool> {
        match self.try_read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            n => bail!("invalid boolean value {}", n),
        }
    }

    /// reads a UTF-8 string with a u16 length prefix
    fn try_read_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_read_u16()? as usize;
        if self.remaining() < len {
            bail!("string of length {} exceeds remaining buffer of {} bytes", len, self.remaining());
        }
        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        Ok(String::from_utf8(raw)?)
    }
}

impl <T: Buf> BufExt for T {
}

pub trait BufMutExt: BufMut {
    fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    /// writes a UTF-8 string with a u16 length prefix, truncating it at a char boundary if
    ///  it does not fit
    fn put_string(&mut self, s: &str) {
        let mut len = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        self.put_u16(len as u16);
        self.put_slice(&s.as_bytes()[..len]);
    }
}

impl <T: BufMut> BufMutExt for T {
}
