//! Typed announce/wait primitives over a [`MessageTransport`].
//!
//! [`MessageChannel`] binds a transport to one endpoint and port and turns
//! raw [`ControlMsg`]s into the four handshake primitives plus the setup-only
//! base address message. It never retries: every transport error is returned
//! to the caller as is.

use tracing::debug;

use crate::error::{ChannelError, ChannelResult};
use crate::message::{ChannelId, ControlMsg, WaitTimeout};
use crate::transport::{Connector, MessageTransport};

/// Control channel to one remote endpoint on one logical port.
pub struct MessageChannel {
    id: ChannelId,
    timeout: WaitTimeout,
    transport: Option<Box<dyn MessageTransport>>,
}

impl MessageChannel {
    /// Opens the channel for `id` through `connector`.
    pub fn open(
        connector: &dyn Connector,
        id: ChannelId,
        timeout: WaitTimeout,
    ) -> ChannelResult<Self> {
        let transport = connector.open(id)?;
        debug!(endpoint = id.endpoint, port = id.port, "opened message channel");
        Ok(Self::from_transport(id, timeout, transport))
    }

    /// Wraps an already connected transport.
    pub fn from_transport(
        id: ChannelId,
        timeout: WaitTimeout,
        transport: Box<dyn MessageTransport>,
    ) -> Self {
        Self {
            id,
            timeout,
            transport: Some(transport),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Default timeout for waits issued on this channel.
    pub fn timeout(&self) -> WaitTimeout {
        self.timeout
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Tells the remote that `len` bytes at `physical_address` are ready.
    ///
    /// `len == 0` is the end-of-stream announcement.
    pub fn announce_ready(&mut self, physical_address: u64, len: usize) -> ChannelResult<()> {
        self.transport()?.send(ControlMsg::DataReady {
            address: physical_address,
            len: len as u64,
        })
    }

    /// Blocks until the remote reports how many bytes of the announced chunk it read.
    pub fn wait_read_done(&mut self, timeout: WaitTimeout) -> ChannelResult<usize> {
        match self.transport()?.recv(timeout)? {
            ControlMsg::ReadDone { len } => Ok(len as usize),
            other => Err(ChannelError::Unexpected {
                expected: "read-done",
                received: other.name(),
            }),
        }
    }

    /// Blocks until the remote reports a chunk written into shared memory.
    ///
    /// Returns the address it wrote at and the chunk length; zero ends the stream.
    pub fn wait_write_done(&mut self, timeout: WaitTimeout) -> ChannelResult<(u64, u64)> {
        match self.transport()?.recv(timeout)? {
            ControlMsg::WriteDone { address, len } => Ok((address, len)),
            other => Err(ChannelError::Unexpected {
                expected: "write-done",
                received: other.name(),
            }),
        }
    }

    /// Tells the remote that `len` bytes it wrote have been consumed.
    pub fn announce_read_done(&mut self, len: usize) -> ChannelResult<()> {
        self.transport()?.send(ControlMsg::ReadDone { len: len as u64 })
    }

    /// Session setup: tells a remote sender where to address its writes.
    pub fn send_base_address(&mut self, physical_address: u64) -> ChannelResult<()> {
        self.transport()?.send(ControlMsg::BaseAddress {
            address: physical_address,
        })
    }

    /// Closes the underlying transport.
    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            debug!(
                endpoint = self.id.endpoint,
                port = self.id.port,
                "closed message channel"
            );
        }
    }

    fn transport(&mut self) -> ChannelResult<&mut Box<dyn MessageTransport>> {
        self.transport.as_mut().ok_or(ChannelError::Closed)
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.close_inner();
    }
}
