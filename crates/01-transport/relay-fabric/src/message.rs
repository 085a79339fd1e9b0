//! Control messages exchanged over the relay's message channel.
//!
//! Every message travels as one fixed 24-byte little-endian frame:
//!
//! | bytes  | field                     |
//! |--------|---------------------------|
//! | 0      | tag                       |
//! | 1      | version ([`FRAME_VERSION`]) |
//! | 2..4   | flags (reserved, zero)    |
//! | 4..8   | port                      |
//! | 8..16  | first operand             |
//! | 16..24 | second operand            |
//!
//! Only chunk lengths and physical addresses are ever interpreted; the file
//! bytes themselves never cross the channel.

use std::time::Duration;

use crate::error::{ChannelError, ChannelResult};

/// Size of an encoded control frame.
pub const FRAME_LEN: usize = 24;
/// Frame layout revision written into every frame.
pub const FRAME_VERSION: u8 = 1;

/// Tag for [`ControlMsg::DataReady`].
pub const TAG_DATA_READY: u8 = 0x01;
/// Tag for [`ControlMsg::ReadDone`].
pub const TAG_READ_DONE: u8 = 0x02;
/// Tag for [`ControlMsg::WriteDone`].
pub const TAG_WRITE_DONE: u8 = 0x03;
/// Tag for [`ControlMsg::BaseAddress`].
pub const TAG_BASE_ADDRESS: u8 = 0x04;

/// Identifies one remote endpoint and one logical port on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub endpoint: u32,
    pub port: u32,
}

impl ChannelId {
    pub const fn new(endpoint: u32, port: u32) -> Self {
        Self { endpoint, port }
    }
}

/// How long a wait primitive may block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Block until the remote responds or the channel closes.
    #[default]
    Infinite,
    /// Give up with [`ChannelError::Timeout`] after the duration elapses.
    Bounded(Duration),
}

impl WaitTimeout {
    /// Maps an optional millisecond count onto a timeout; `None` waits forever.
    pub fn from_millis(ms: Option<u64>) -> Self {
        match ms {
            Some(ms) => WaitTimeout::Bounded(Duration::from_millis(ms)),
            None => WaitTimeout::Infinite,
        }
    }

    pub fn as_duration(self) -> Option<Duration> {
        match self {
            WaitTimeout::Infinite => None,
            WaitTimeout::Bounded(duration) => Some(duration),
        }
    }
}

/// Header preceding the operands of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub tag: u8,
    pub ver: u8,
    pub flags: u16,
}

impl Envelope {
    pub const fn new(tag: u8) -> Self {
        Self {
            tag,
            ver: FRAME_VERSION,
            flags: 0,
        }
    }
}

/// Handshake vocabulary shared by both endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMsg {
    /// `len` bytes at `address` are ready to be consumed; `len == 0` ends the stream.
    DataReady { address: u64, len: u64 },
    /// The previously announced chunk was consumed; `len` bytes were read.
    ReadDone { len: u64 },
    /// `len` bytes were written at `address`; `len == 0` ends the stream.
    WriteDone { address: u64, len: u64 },
    /// Setup-only: where the receiver's relay buffer lives.
    BaseAddress { address: u64 },
}

impl ControlMsg {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMsg::DataReady { .. } => "data-ready",
            ControlMsg::ReadDone { .. } => "read-done",
            ControlMsg::WriteDone { .. } => "write-done",
            ControlMsg::BaseAddress { .. } => "base-address",
        }
    }

    fn envelope(&self) -> Envelope {
        Envelope::new(match self {
            ControlMsg::DataReady { .. } => TAG_DATA_READY,
            ControlMsg::ReadDone { .. } => TAG_READ_DONE,
            ControlMsg::WriteDone { .. } => TAG_WRITE_DONE,
            ControlMsg::BaseAddress { .. } => TAG_BASE_ADDRESS,
        })
    }

    fn operands(&self) -> (u64, u64) {
        match *self {
            ControlMsg::DataReady { address, len } => (address, len),
            ControlMsg::ReadDone { len } => (len, 0),
            ControlMsg::WriteDone { address, len } => (address, len),
            ControlMsg::BaseAddress { address } => (address, 0),
        }
    }
}

/// Encodes `msg` for `port` into a wire frame.
pub fn encode_frame(port: u32, msg: &ControlMsg) -> [u8; FRAME_LEN] {
    let envelope = msg.envelope();
    let (a, b) = msg.operands();
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = envelope.tag;
    frame[1] = envelope.ver;
    frame[2..4].copy_from_slice(&envelope.flags.to_le_bytes());
    frame[4..8].copy_from_slice(&port.to_le_bytes());
    frame[8..16].copy_from_slice(&a.to_le_bytes());
    frame[16..24].copy_from_slice(&b.to_le_bytes());
    frame
}

/// Decodes a wire frame into its port and message.
pub fn decode_frame(frame: &[u8]) -> ChannelResult<(u32, ControlMsg)> {
    if frame.len() != FRAME_LEN {
        return Err(ChannelError::codec(format!(
            "frame is {} bytes, expected {FRAME_LEN}",
            frame.len()
        )));
    }
    let envelope = Envelope {
        tag: frame[0],
        ver: frame[1],
        flags: u16::from_le_bytes([frame[2], frame[3]]),
    };
    if envelope.ver != FRAME_VERSION {
        return Err(ChannelError::codec(format!(
            "unsupported frame version {}",
            envelope.ver
        )));
    }
    let port = u32::from_le_bytes(read_array(&frame[4..8]));
    let a = u64::from_le_bytes(read_array(&frame[8..16]));
    let b = u64::from_le_bytes(read_array(&frame[16..24]));

    let msg = match envelope.tag {
        TAG_DATA_READY => ControlMsg::DataReady { address: a, len: b },
        TAG_READ_DONE => ControlMsg::ReadDone { len: a },
        TAG_WRITE_DONE => ControlMsg::WriteDone { address: a, len: b },
        TAG_BASE_ADDRESS => ControlMsg::BaseAddress { address: a },
        tag => return Err(ChannelError::codec(format!("unknown tag {tag:#04x}"))),
    };
    Ok((port, msg))
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
