use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::CluckError;
use crate::util::buf::{put_nullable_string, try_get_nullable_string, try_get_u16, try_get_u32, BufReadError};

pub const PROTOCOL_MAGIC: u32 = 0x154000CA;
pub const PROTOCOL_VERSION: u16 = 1;

/// The header both sides of a connection send before any frames. The client passes the name it
///  would like to be known by on the server as a hint; the server sends no hint.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeHeader {
    pub link_name_hint: Option<String>,
}

impl HandshakeHeader {
    pub fn new(link_name_hint: Option<&str>) -> HandshakeHeader {
        HandshakeHeader {
            link_name_hint: link_name_hint.map(|s| s.to_string()),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u32(PROTOCOL_MAGIC);
        buf.put_u16(PROTOCOL_VERSION);
        put_nullable_string(buf, self.link_name_hint.as_deref())
    }

    /// Same contract as [crate::protocol::Frame::try_decode]. Magic and version are checked as
    ///  soon as they arrive.
    pub fn try_decode(buf: &mut BytesMut) -> Result<Option<HandshakeHeader>, CluckError> {
        let mut cursor = &buf[..];
        match Self::parse(&mut cursor) {
            Ok(header) => {
                let consumed = buf.len() - cursor.remaining();
                buf.advance(consumed);
                Ok(Some(header))
            }
            Err(BufReadError::Underflow) => Ok(None),
            Err(BufReadError::Malformed(msg)) => Err(CluckError::Protocol(msg)),
        }
    }

    fn parse(buf: &mut &[u8]) -> Result<HandshakeHeader, BufReadError> {
        let magic = try_get_u32(buf)?;
        if magic != PROTOCOL_MAGIC {
            return Err(BufReadError::Malformed(format!("invalid magic number {:08x}", magic)));
        }
        let version = try_get_u16(buf)?;
        if version != PROTOCOL_VERSION {
            return Err(BufReadError::Malformed(format!("unsupported protocol version {}", version)));
        }
        Ok(HandshakeHeader {
            link_name_hint: try_get_nullable_string(buf)?,
        })
    }
}

/// Sends this side's header and reads the peer's. Returns the peer's link name hint and whatever
///  the peer sent after its header, which is the start of the frame stream.
pub async fn exchange_headers<S>(stream: &mut S, own_hint: Option<&str>) -> Result<(Option<String>, BytesMut), CluckError>
where S: AsyncRead + AsyncWrite + Unpin
{
    let mut buf = BytesMut::new();
    HandshakeHeader::new(own_hint).encode(&mut buf)
        .map_err(|e| CluckError::Protocol(e.to_string()))?;
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let mut received = BytesMut::with_capacity(256);
    loop {
        if let Some(header) = HandshakeHeader::try_decode(&mut received)? {
            trace!("received handshake header {:?}", header);
            return Ok((header.link_name_hint, received));
        }
        if stream.read_buf(&mut received).await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
    }
}
