use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{AsyncRead, AsyncWrite, ready};
use pin_project::pin_project;

use crate::protocol::{MAX_PROTOCOL_LEN, NA, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("remote refused all proposed protocols")]
    Failed,
}

impl From<io::Error> for NegotiationError {
    fn from(err: io::Error) -> Self {
        NegotiationError::Protocol(ProtocolError::Io(err))
    }
}

/// A stream that went through protocol negotiation.
///
/// After an optimistic [`dialer_select`](crate::dialer_select) the remote's
/// confirmation lines are still in flight. Writes pass straight through so
/// the dialer can send application data early; the confirmation is consumed
/// transparently by the first read, and a mismatch surfaces as an error
/// there.
#[pin_project]
pub struct Negotiated<S> {
    #[pin]
    io: S,
    state: State,
}

enum State {
    /// Confirmation lines not read yet, stored in reverse expectation order.
    Expecting { lines: Vec<String>, parser: LineParser },
    Complete,
}

impl<S> Negotiated<S> {
    pub(crate) fn complete(io: S) -> Self {
        Negotiated {
            io,
            state: State::Complete,
        }
    }

    pub(crate) fn expecting(io: S, mut lines: Vec<String>) -> Self {
        lines.reverse();
        Negotiated {
            io,
            state: State::Expecting {
                lines,
                parser: LineParser::new(),
            },
        }
    }
}

impl<S> AsyncRead for Negotiated<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        loop {
            match this.state {
                State::Complete => return this.io.as_mut().poll_read(cx, buf),
                State::Expecting { lines, parser } => {
                    let mut byte = [0u8; 1];
                    let n = ready!(this.io.as_mut().poll_read(cx, &mut byte))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    let Some(line) = parser.push(byte[0]).map_err(io::Error::other)? else {
                        continue;
                    };
                    let expected = lines.pop().expect("expecting state holds a line");
                    if line != expected {
                        let err = if line == NA {
                            NegotiationError::Failed
                        } else {
                            ProtocolError::InvalidMessage.into()
                        };
                        return Poll::Ready(Err(io::Error::other(err)));
                    }
                    tracing::trace!(line = %expected, "negotiation confirmed");
                    *parser = LineParser::new();
                    if lines.is_empty() {
                        *this.state = State::Complete;
                    }
                }
            }
        }
    }
}

impl<S> AsyncWrite for Negotiated<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_close(cx)
    }
}

/// Incremental parser for one varint-prefixed, newline-terminated line.
struct LineParser {
    len: Option<usize>,
    varint: usize,
    shift: u32,
    buf: Vec<u8>,
}

impl LineParser {
    fn new() -> Self {
        LineParser {
            len: None,
            varint: 0,
            shift: 0,
            buf: Vec::new(),
        }
    }

    fn push(&mut self, byte: u8) -> Result<Option<String>, ProtocolError> {
        match self.len {
            None => {
                self.varint |= ((byte & 0x7f) as usize) << self.shift;
                if byte & 0x80 == 0 {
                    if self.varint == 0 || self.varint > MAX_PROTOCOL_LEN {
                        return Err(ProtocolError::TooLarge);
                    }
                    self.len = Some(self.varint);
                } else {
                    self.shift += 7;
                    if self.shift > 14 {
                        return Err(ProtocolError::TooLarge);
                    }
                }
                Ok(None)
            }
            Some(len) => {
                self.buf.push(byte);
                if self.buf.len() < len {
                    return Ok(None);
                }
                let mut line = std::mem::take(&mut self.buf);
                if line.pop() != Some(b'\n') {
                    return Err(ProtocolError::InvalidMessage);
                }
                String::from_utf8(line)
                    .map(Some)
                    .map_err(|_| ProtocolError::InvalidMessage)
            }
        }
    }
}
