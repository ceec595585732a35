use futures::{AsyncRead, AsyncWrite};

use crate::{
    Negotiated, NegotiationError,
    protocol::{HEADER, NA, ProtocolError, read_line, write_line},
};

/// Answer the remote's protocol proposals, as the responder.
///
/// Proposals outside `protocols` are answered with `na`; the first
/// supported one is echoed back and becomes the negotiated protocol.
pub async fn listener_select<S, I, P>(
    mut io: S,
    protocols: I,
) -> Result<(Negotiated<S>, String), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: IntoIterator<Item = P>,
    P: AsRef<str>,
{
    let supported: Vec<String> = protocols
        .into_iter()
        .map(|p| p.as_ref().to_owned())
        .collect();

    let header = read_line(&mut io).await?;
    if header != HEADER {
        return Err(ProtocolError::InvalidHeader.into());
    }
    write_line(&mut io, HEADER).await?;

    loop {
        let proposal = read_line(&mut io).await?;
        if supported.iter().any(|p| *p == proposal) {
            write_line(&mut io, &proposal).await?;
            tracing::trace!(protocol = %proposal, "accepted proposed protocol");
            return Ok((Negotiated::complete(io), proposal));
        }
        tracing::trace!(%proposal, "unsupported protocol proposed");
        write_line(&mut io, NA).await?;
    }
}

#[cfg(test)]
mod tests {
    use futures::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use crate::{NegotiationError, dialer_select, listener_select};

    fn duplex_pair() -> (
        impl futures::AsyncRead + futures::AsyncWrite + Unpin,
        impl futures::AsyncRead + futures::AsyncWrite + Unpin,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        (a.compat(), b.compat())
    }

    #[tokio::test]
    async fn selects_first_mutual_protocol() {
        let (a, b) = duplex_pair();
        let dialer = dialer_select(a, ["/noise"], false);
        let listener = listener_select(b, ["/noise", "/tls/1.0.0"]);
        let (dialed, listened) = tokio::join!(dialer, listener);
        assert_eq!(dialed.unwrap().1, "/noise");
        assert_eq!(listened.unwrap().1, "/noise");
    }

    #[tokio::test]
    async fn falls_back_after_refusal() {
        let (a, b) = duplex_pair();
        let dialer = dialer_select(a, ["/mplex/6.7.0", "/yamux/1.0.0"], false);
        let listener = listener_select(b, ["/yamux/1.0.0"]);
        let (dialed, listened) = tokio::join!(dialer, listener);
        assert_eq!(dialed.unwrap().1, "/yamux/1.0.0");
        assert_eq!(listened.unwrap().1, "/yamux/1.0.0");
    }

    #[tokio::test]
    async fn fails_without_mutual_protocol() {
        let (a, b) = duplex_pair();
        let dialer = dialer_select(a, ["/mplex/6.7.0"], false);
        let listener = listener_select(b, ["/yamux/1.0.0"]);
        let (dialed, listened) = tokio::join!(dialer, listener);
        assert!(matches!(dialed, Err(NegotiationError::Failed)));
        // the dialer hangs up after exhausting its list
        assert!(listened.is_err());
    }

    #[tokio::test]
    async fn optimistic_select_carries_early_data() {
        let (a, b) = duplex_pair();
        let dialer = async {
            let (mut io, protocol) = dialer_select(a, ["/echo/1.0.0"], true).await.unwrap();
            assert_eq!(protocol, "/echo/1.0.0");
            // written before the remote has confirmed anything
            io.write_all(b"ping").await.unwrap();
            io.flush().await.unwrap();
            let mut buf = [0u8; 4];
            io.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        };
        let listener = async {
            let (mut io, protocol) = listener_select(b, ["/echo/1.0.0"]).await.unwrap();
            assert_eq!(protocol, "/echo/1.0.0");
            let mut buf = [0u8; 4];
            io.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            io.write_all(b"pong").await.unwrap();
            io.flush().await.unwrap();
        };
        tokio::join!(dialer, listener);
    }

    #[tokio::test]
    async fn optimistic_refusal_surfaces_on_read() {
        let (a, b) = duplex_pair();
        let dialer = async {
            let (mut io, _) = dialer_select(a, ["/mplex/6.7.0"], true).await.unwrap();
            let mut buf = [0u8; 1];
            io.read_exact(&mut buf).await
        };
        let listener = async {
            // refuse, then hang up
            let _ = listener_select(b, ["/yamux/1.0.0"]).await;
        };
        let (read, ()) = tokio::join!(dialer, listener);
        assert!(read.is_err());
    }
}
