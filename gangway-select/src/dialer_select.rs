use futures::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    Negotiated, NegotiationError,
    protocol::{HEADER, NA, ProtocolError, encode_line, read_line, write_line},
};

/// Negotiate one of `protocols` with the remote, as the initiator.
///
/// The multistream header and the first proposal leave in a single flush.
/// With `yield_bytes` the call returns as soon as the proposal is on the
/// wire: the returned [`Negotiated`] accepts writes immediately and settles
/// the remote's confirmation on first read. Without it, the confirmation
/// (or an `na` fallback round for every further protocol in the list) is
/// awaited before returning.
pub async fn dialer_select<S, I, P>(
    mut io: S,
    protocols: I,
    yield_bytes: bool,
) -> Result<(Negotiated<S>, String), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: IntoIterator<Item = P>,
    P: AsRef<str>,
{
    let mut protocols = protocols.into_iter();
    let first = protocols
        .next()
        .ok_or(NegotiationError::Failed)?
        .as_ref()
        .to_owned();

    let mut buf = encode_line(HEADER);
    buf.extend_from_slice(&encode_line(&first));
    io.write_all(&buf).await?;
    io.flush().await?;

    if yield_bytes {
        tracing::trace!(protocol = %first, "optimistically selected protocol");
        let negotiated = Negotiated::expecting(io, vec![HEADER.to_owned(), first.clone()]);
        return Ok((negotiated, first));
    }

    let header = read_line(&mut io).await?;
    if header != HEADER {
        return Err(ProtocolError::InvalidHeader.into());
    }

    let mut current = first;
    loop {
        let reply = read_line(&mut io).await?;
        if reply == current {
            tracing::trace!(protocol = %current, "protocol negotiated");
            return Ok((Negotiated::complete(io), current));
        }
        if reply != NA {
            return Err(ProtocolError::InvalidMessage.into());
        }
        tracing::trace!(protocol = %current, "protocol refused");
        match protocols.next() {
            Some(next) => {
                current = next.as_ref().to_owned();
                write_line(&mut io, &current).await?;
            }
            None => return Err(NegotiationError::Failed),
        }
    }
}
