use std::io;

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Handshake line both sides must send before any proposal.
pub(crate) const HEADER: &str = "/multistream/1.0.0";

/// Rejection token sent by a listener for an unsupported proposal.
pub(crate) const NA: &str = "na";

/// Upper bound on a single negotiation line, newline included.
pub(crate) const MAX_PROTOCOL_LEN: usize = 140;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("remote does not speak multistream-select")]
    InvalidHeader,
    #[error("negotiation line exceeds {MAX_PROTOCOL_LEN} bytes")]
    TooLarge,
    #[error("malformed negotiation line")]
    InvalidMessage,
}

/// Write a varint-length-prefixed, newline-terminated line in a single flush.
pub(crate) async fn write_line<S>(io: &mut S, line: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    io.write_all(&encode_line(line)).await?;
    io.flush().await
}

pub(crate) fn encode_line(line: &str) -> Vec<u8> {
    let mut prefix = unsigned_varint::encode::usize_buffer();
    let prefix = unsigned_varint::encode::usize(line.len() + 1, &mut prefix);
    let mut buf = Vec::with_capacity(prefix.len() + line.len() + 1);
    buf.extend_from_slice(prefix);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    buf
}

/// Read one negotiation line. Never consumes bytes past the terminating
/// newline, so application data following the negotiation is left intact.
pub(crate) async fn read_line<S>(io: &mut S) -> Result<String, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let len = read_varint(io).await?;
    if len == 0 || len > MAX_PROTOCOL_LEN {
        return Err(ProtocolError::TooLarge);
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    if buf.pop() != Some(b'\n') {
        return Err(ProtocolError::InvalidMessage);
    }
    String::from_utf8(buf).map_err(|_| ProtocolError::InvalidMessage)
}

async fn read_varint<S>(io: &mut S) -> Result<usize, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    let mut value = 0usize;
    let mut shift = 0u32;
    loop {
        io.read_exact(&mut byte).await?;
        value |= ((byte[0] & 0x7f) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        // lines are tiny; a prefix this wide cannot be honest
        if shift > 14 {
            return Err(ProtocolError::TooLarge);
        }
    }
}
