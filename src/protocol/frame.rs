use bytes::{Buf, BufMut, BytesMut};

use crate::error::CluckError;
use crate::protocol::checksum::Checksum;
use crate::protocol::keepalive::{keepalive_payload, KEEPALIVE_TARGET};
use crate::util::buf::{put_nullable_string, try_get_i32, try_get_nullable_string, try_get_u64, BufReadError};

/// A single message on the wire.
///
/// ```ascii
/// +-----------------+-----------------+-------------+---------------+---------+----------+
/// | target          | source          | payload len | checksum base | payload | checksum |
/// | nullable string | nullable string | i32         | u64           | N bytes | u64      |
/// +-----------------+-----------------+-------------+---------------+---------+----------+
/// ```
///
/// All numbers are big endian. The checksum is a CRC-64 over the checksum base and the payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub target: Option<String>,
    pub source: Option<String>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(target: Option<&str>, source: Option<&str>, payload: &[u8]) -> Frame {
        Frame {
            target: target.map(|s| s.to_string()),
            source: source.map(|s| s.to_string()),
            payload: payload.to_vec(),
        }
    }

    pub fn keepalive() -> Frame {
        Frame::new(Some(KEEPALIVE_TARGET), None, &keepalive_payload())
    }

    /// Keepalives are recognized by their first two payload bytes. Peers may append data.
    pub fn is_keepalive(&self) -> bool {
        self.target.as_deref() == Some(KEEPALIVE_TARGET)
            && self.source.is_none()
            && self.payload.starts_with(&keepalive_payload())
    }

    /// Appends the encoded frame to `buf`. If the frame can not be encoded, `buf` is left as it was.
    pub fn encode(&self, checksum_base: u64, buf: &mut BytesMut) -> anyhow::Result<()> {
        let start = buf.len();
        let result = self.do_encode(checksum_base, buf);
        if result.is_err() {
            buf.truncate(start);
        }
        result
    }

    fn do_encode(&self, checksum_base: u64, buf: &mut BytesMut) -> anyhow::Result<()> {
        let payload_len = i32::try_from(self.payload.len())?;

        put_nullable_string(buf, self.target.as_deref())?;
        put_nullable_string(buf, self.source.as_deref())?;
        buf.put_i32(payload_len);
        buf.put_u64(checksum_base);
        buf.put_slice(&self.payload);
        buf.put_u64(Checksum::new(checksum_base, &self.payload).0);
        Ok(())
    }

    /// Decodes the first frame in a receive buffer, consuming it. Returns `Ok(None)` without
    ///  consuming anything if the buffer does not hold a complete frame yet.
    pub fn try_decode(buf: &mut BytesMut, max_payload_len: usize) -> Result<Option<Frame>, CluckError> {
        let mut cursor = &buf[..];
        match Self::parse(&mut cursor, max_payload_len) {
            Ok(frame) => {
                let consumed = buf.len() - cursor.remaining();
                buf.advance(consumed);
                Ok(Some(frame))
            }
            Err(BufReadError::Underflow) => Ok(None),
            Err(BufReadError::Malformed(msg)) => Err(CluckError::Protocol(msg)),
        }
    }

    fn parse(buf: &mut &[u8], max_payload_len: usize) -> Result<Frame, BufReadError> {
        let target = try_get_nullable_string(buf)?;
        let source = try_get_nullable_string(buf)?;

        let payload_len = try_get_i32(buf)?;
        let payload_len = match usize::try_from(payload_len) {
            Ok(len) if len <= max_payload_len => len,
            _ => return Err(BufReadError::Malformed(format!("invalid payload length {}", payload_len))),
        };

        let checksum_base = try_get_u64(buf)?;
        if buf.remaining() < payload_len {
            return Err(BufReadError::Underflow);
        }
        let payload = buf[..payload_len].to_vec();
        buf.advance(payload_len);

        let checksum = Checksum(try_get_u64(buf)?);
        let expected = Checksum::new(checksum_base, &payload);
        if checksum != expected {
            return Err(BufReadError::Malformed(format!("checksum mismatch: expected {:?}, was {:?}", expected, checksum)));
        }

        Ok(Frame {
            target,
            source,
            payload,
        })
    }
}
