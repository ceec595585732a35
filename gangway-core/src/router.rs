use std::sync::Arc;

use futures::AsyncWriteExt;
use gangway_select::listener_select;

use crate::{
    conn::BoxedIo,
    connection::{Connection, Direction, StreamError},
    muxing::{MuxedStream, StreamMeta},
    protocol::ProtocolName,
    registrar::{DEFAULT_MAX_INBOUND_STREAMS, Registrar, RegistrarEntry, RegistrarError},
};

type RouteError = (StreamError, Option<BoxedIo>);

/// Negotiate and dispatch one inbound stream. A failure here is fatal only
/// to this stream, never to the connection or its siblings.
pub(crate) async fn route_incoming_stream(connection: Arc<Connection>, stream: MuxedStream) {
    let (meta, io) = stream.into_parts();
    match negotiate(&connection, &meta, io).await {
        Ok((stream, entry)) => entry.handler.handle(connection, stream),
        Err((err, io)) => {
            tracing::debug!(stream_id = meta.id(), %err, "failed to route inbound stream");
            if let Some(mut io) = io {
                let _ = io.close().await;
            }
            meta.record_close();
        }
    }
}

async fn negotiate(
    connection: &Arc<Connection>,
    meta: &Arc<StreamMeta>,
    io: BoxedIo,
) -> Result<(MuxedStream, RegistrarEntry), RouteError> {
    let registrar = connection.components().registrar.clone();

    // the handler table as of this moment, not connection creation time
    let protocols = registrar.protocols();
    let (negotiated, chosen) = listener_select(io, protocols)
        .await
        .map_err(|err| (StreamError::from(err), None))?;
    let protocol = ProtocolName::from(chosen);
    let io: BoxedIo = Box::new(negotiated);

    let entry = match registrar.entry(&protocol) {
        Ok(entry) => entry,
        Err(err) => return Err((err.into(), Some(io))),
    };
    let limit = incoming_stream_limit(registrar.as_ref(), &protocol);

    {
        let _gate = connection.stream_gate().lock().await;
        let count = connection.count_streams(Direction::Inbound, &protocol);
        if count >= limit {
            // abort rather than close: the remote should see the reset
            return Err((
                StreamError::TooManyInboundStreams { protocol, limit },
                None,
            ));
        }
        meta.set_protocol(protocol.clone());
    }

    connection
        .components()
        .peer_store
        .merge(&connection.remote_peer(), std::slice::from_ref(&protocol))
        .await;

    if connection.limits().is_some() && !entry.options.run_on_limited_connection {
        return Err((StreamError::LimitedConnection(protocol), Some(io)));
    }

    if let Some(metrics) = &connection.components().metrics {
        metrics.track_protocol_stream(&protocol, connection);
    }
    tracing::trace!(stream_id = meta.id(), %protocol, "inbound stream negotiated");
    Ok((MuxedStream::new(meta.clone(), io), entry))
}

/// The registrar's cap for the protocol; an unregistered protocol gets the
/// default, any other registrar failure would propagate.
fn incoming_stream_limit(registrar: &dyn Registrar, protocol: &ProtocolName) -> usize {
    match registrar.entry(protocol) {
        Ok(entry) => entry
            .options
            .max_inbound_streams
            .unwrap_or(DEFAULT_MAX_INBOUND_STREAMS),
        Err(RegistrarError::UnhandledProtocol(_)) => DEFAULT_MAX_INBOUND_STREAMS,
    }
}
