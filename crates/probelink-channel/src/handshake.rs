//! Connection handshake.
//!
//! Right after the socket connects, the service sends exactly one CONTROL
//! message: `service_ready` or `service_refused`. The client sends nothing
//! until it has seen `service_ready`.

use std::io::{ErrorKind, Read, Write};

use probelink_wire::{ControlMessage, FrameReader, FrameWriter, WireError, CONTROL};
use tracing::debug;

use crate::error::ConnectError;

/// Wait for the service's answer (client side).
///
/// The read timeout of the underlying stream bounds the wait.
pub fn await_service_ready<R: Read>(reader: &mut FrameReader<R>) -> Result<(), ConnectError> {
    let frame = match reader.read_frame() {
        Ok(frame) => frame,
        Err(WireError::Io(err))
            if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
        {
            return Err(ConnectError::unavailable("timed out waiting for service handshake"));
        }
        Err(WireError::ConnectionClosed) => {
            return Err(ConnectError::unavailable("service closed the connection during handshake"));
        }
        Err(err) => return Err(ConnectError::unavailable(format!("handshake failed: {err}"))),
    };

    if frame.channel != CONTROL {
        return Err(ConnectError::unavailable(format!(
            "expected CONTROL channel {}, got {}",
            CONTROL, frame.channel
        )));
    }

    match ControlMessage::decode(&frame.payload) {
        Ok(ControlMessage::ServiceReady) => {
            debug!("service ready");
            Ok(())
        }
        Ok(ControlMessage::ServiceRefused { reason }) => {
            Err(ConnectError::RefusedConnection { reason })
        }
        Ok(other) => Err(ConnectError::unavailable(format!(
            "unexpected handshake message: {other:?}"
        ))),
        Err(err) => Err(ConnectError::unavailable(format!("handshake failed: {err}"))),
    }
}

/// Accept the client (service side).
pub fn send_ready<W: Write>(writer: &mut FrameWriter<W>) -> probelink_wire::Result<()> {
    writer.write_frame(&ControlMessage::ServiceReady.to_frame()?)
}

/// Decline the client (service side).
pub fn send_refused<W: Write>(
    writer: &mut FrameWriter<W>,
    reason: &str,
) -> probelink_wire::Result<()> {
    let msg = ControlMessage::ServiceRefused {
        reason: reason.to_string(),
    };
    writer.write_frame(&msg.to_frame()?)
}
