use anyhow::bail;
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Length marker that encodes an absent (`None`) string. It is not a valid string length, so
///  strings are limited to `0xFFFE` bytes.
pub const ABSENT_STRING_MARKER: u16 = 0xFFFF;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum BufReadError {
    /// The buffer ended before the item was complete - more data may arrive later
    #[error("buffer underflow")]
    Underflow,
    #[error("{0}")]
    Malformed(String),
}

macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        pub fn $try_getter(buf: &mut impl Buf) -> Result<$ty, BufReadError> {
            if buf.remaining() < std::mem::size_of::<$ty>() {
                return Err(BufReadError::Underflow);
            }
            Ok(buf.$getter())
        }
    }
}

get_try_impl!(try_get_u16, u16, get_u16);
get_try_impl!(try_get_u32, u32, get_u32);
get_try_impl!(try_get_i32, i32, get_i32);
get_try_impl!(try_get_u64, u64, get_u64);

pub fn put_nullable_string(buf: &mut impl BufMut, s: Option<&str>) -> anyhow::Result<()> {
    match s {
        None => buf.put_u16(ABSENT_STRING_MARKER),
        Some(s) => {
            let len = match u16::try_from(s.len()) {
                Ok(len) if len != ABSENT_STRING_MARKER => len,
                _ => bail!("string of {} bytes is too long to be encoded", s.len()),
            };
            buf.put_u16(len);
            buf.put_slice(s.as_bytes());
        }
    }
    Ok(())
}

pub fn try_get_nullable_string(buf: &mut impl Buf) -> Result<Option<String>, BufReadError> {
    let len = try_get_u16(buf)?;
    if len == ABSENT_STRING_MARKER {
        return Ok(None);
    }

    let len = len as usize;
    if buf.remaining() < len {
        return Err(BufReadError::Underflow);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);

    String::from_utf8(raw)
        .map(Some)
        .map_err(|e| BufReadError::Malformed(format!("string is not valid UTF-8: {}", e)))
}
