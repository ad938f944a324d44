//! Device-service side of the channel protocol.
//!
//! Stands in for the external imaging service: the CLI `serve` simulator and
//! the integration tests drive sessions against it.

use std::path::Path;
use std::time::Duration;

use probelink_wire::{
    ControlMessage, Frame, FrameReader, FrameWriter, RawFrameMessage, Tag, WireError, CONTROL,
};
use tracing::{debug, info};

use crate::error::ServiceError;
use crate::handshake::{send_ready, send_refused};
use crate::stream::IpcStream;
use crate::uds::UnixDomainSocket;

/// Listens for session clients.
pub struct ServiceListener {
    socket: UnixDomainSocket,
}

impl ServiceListener {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        Ok(Self {
            socket: UnixDomainSocket::bind(path)?,
        })
    }

    /// Accept the next client and complete the handshake with `service_ready`.
    pub fn accept(&self) -> Result<ServiceEndpoint, ServiceError> {
        let stream = self.socket.accept()?;
        let mut writer = FrameWriter::new(stream.try_clone()?);
        send_ready(&mut writer)?;
        debug!("client accepted");
        Ok(ServiceEndpoint {
            reader: FrameReader::new(stream),
            writer,
        })
    }

    /// Accept the next client and decline it with `reason`.
    pub fn refuse(&self, reason: &str) -> Result<(), ServiceError> {
        let stream = self.socket.accept()?;
        let mut writer = FrameWriter::new(stream);
        send_refused(&mut writer, reason)?;
        info!(reason, "client refused");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.socket.path()
    }
}

/// One accepted client connection, seen from the service.
pub struct ServiceEndpoint {
    reader: FrameReader<IpcStream>,
    writer: FrameWriter<IpcStream>,
}

impl ServiceEndpoint {
    /// Read the next CONTROL request from the client.
    ///
    /// Returns `ServiceError::Disconnected` when the client hung up.
    pub fn recv_request(&mut self) -> Result<ControlMessage, ServiceError> {
        loop {
            let frame = match self.reader.read_frame() {
                Ok(frame) => frame,
                Err(WireError::ConnectionClosed) => return Err(ServiceError::Disconnected),
                Err(err) => return Err(err.into()),
            };
            if frame.channel != CONTROL {
                debug!(channel = frame.channel, "ignoring non-control frame from client");
                continue;
            }
            return Ok(ControlMessage::decode(&frame.payload)?);
        }
    }

    /// Bound how long `recv_request` may block.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), ServiceError> {
        Ok(self.reader.get_ref().set_read_timeout(timeout)?)
    }

    /// Answer a tagged request.
    pub fn reply(&mut self, tag: Tag, status: i32) -> Result<(), ServiceError> {
        let msg = ControlMessage::StatusReply { tag, status };
        Ok(self.writer.write_frame(&msg.to_frame()?)?)
    }

    pub fn send_frame(&mut self, frame: &RawFrameMessage) -> Result<(), ServiceError> {
        Ok(self.writer.write_frame(&frame.to_frame())?)
    }

    /// Write an arbitrary frame, well-formed or not.
    pub fn send_raw(&mut self, frame: &Frame) -> Result<(), ServiceError> {
        Ok(self.writer.write_frame(frame)?)
    }

    /// A second writer onto the same connection, for pushing frames from
    /// another thread while this endpoint keeps reading requests.
    pub fn frame_sender(&self) -> Result<FrameSender, ServiceError> {
        Ok(FrameSender {
            writer: FrameWriter::new(self.writer.get_ref().try_clone()?),
        })
    }

    /// Hang up on the client.
    pub fn close(self) -> Result<(), ServiceError> {
        Ok(self.writer.get_ref().shutdown()?)
    }
}

/// Pushes frames onto an accepted connection.
pub struct FrameSender {
    writer: FrameWriter<IpcStream>,
}

impl FrameSender {
    pub fn send_frame(&mut self, frame: &RawFrameMessage) -> Result<(), ServiceError> {
        Ok(self.writer.write_frame(&frame.to_frame())?)
    }

    pub fn send_raw(&mut self, frame: &Frame) -> Result<(), ServiceError> {
        Ok(self.writer.write_frame(frame)?)
    }
}
