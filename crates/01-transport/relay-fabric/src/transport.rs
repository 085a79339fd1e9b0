use crate::error::ChannelResult;
use crate::message::{ChannelId, ControlMsg, WaitTimeout};

/// Ordered, reliable, bidirectional message link to one endpoint and port.
pub trait MessageTransport: Send {
    fn send(&mut self, msg: ControlMsg) -> ChannelResult<()>;

    /// Blocks until the next message arrives or `timeout` elapses.
    fn recv(&mut self, timeout: WaitTimeout) -> ChannelResult<ControlMsg>;

    /// Tears the link down. Calling it again is a no-op.
    fn close(&mut self);
}

/// Opens transports by channel id.
pub trait Connector: Send + Sync {
    fn open(&self, id: ChannelId) -> ChannelResult<Box<dyn MessageTransport>>;
}
