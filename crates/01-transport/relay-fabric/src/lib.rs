//! Chunked relay protocol over a message-only control channel.
//!
//! Layers, leaves first:
//! * [`ControlMsg`] and the frame codec – the vocabulary carried by transports.
//! * [`MessageTransport`] / [`Connector`] – transport contract, with [`loopback`] and [`unix`] backends.
//! * [`MessageChannel`] – typed announce/wait primitives bound to one endpoint and port.
//! * [`SenderEngine`] / [`ReceiverEngine`] – the per-role handshake state machines.
//! * [`session::run`] – scoped orchestration that always releases buffer and channel.
//! * [`RemotePeer`] – the far side of the handshake, for tests and local demos.

mod channel;
mod engine;
mod error;
pub mod loopback;
mod message;
mod peer;
pub mod session;
mod transport;
#[cfg(unix)]
pub mod unix;

pub use channel::MessageChannel;
pub use engine::{ReceiverEngine, Role, SenderEngine, TransferEngine, TransferState};
pub use error::{
    ChannelError, ChannelResult, ErrorKind, LocalIoError, ProtocolViolation, RelayError,
    RelayResult,
};
pub use message::{
    decode_frame, encode_frame, ChannelId, ControlMsg, Envelope, WaitTimeout, FRAME_LEN,
    FRAME_VERSION, TAG_BASE_ADDRESS, TAG_DATA_READY, TAG_READ_DONE, TAG_WRITE_DONE,
};
pub use peer::{PeerReport, PeerRole, RemotePeer};
pub use session::{run, Session, SessionConfig, SessionFailure, TransferReport, TransferResult};
pub use transport::{Connector, MessageTransport};
