//! Per-role transfer state machines.
//!
//! Each engine moves one chunk per [`TransferEngine::step`]. Exactly one chunk
//! is in flight at a time: the relay buffer belongs to the remote from the
//! moment a chunk is announced until the matching completion arrives.

use std::fmt;
use std::io::{self, Read, Write};

use relay_buffer::RelayBuffer;
use tracing::{debug, info};

use crate::channel::MessageChannel;
use crate::error::{LocalIoError, ProtocolViolation, RelayResult};

/// Which side of the relay a session plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Streams a local file to the remote endpoint.
    Sender,
    /// Streams remote data into a local file.
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        })
    }
}

/// Lifecycle of one transfer. `Completed` and `Failed` are never left.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransferState {
    #[default]
    Idle,
    Transferring,
    Completed,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed)
    }
}

/// One role's transition function over a relay buffer and a message channel.
pub trait TransferEngine {
    fn role(&self) -> Role;

    fn state(&self) -> TransferState;

    /// Payload bytes the remote has confirmed so far.
    fn bytes_transferred(&self) -> u64;

    /// Non-empty chunks the remote has confirmed so far.
    fn chunks(&self) -> u64;

    /// Moves `Idle` to `Transferring`, performing the role's setup.
    fn start(&mut self, buffer: &mut RelayBuffer, channel: &mut MessageChannel)
        -> RelayResult<()>;

    /// Runs one chunk exchange and returns the resulting state.
    ///
    /// An `Idle` engine is started first. A terminal engine returns its state
    /// without touching the buffer or the channel. Any error moves the engine
    /// to `Failed` and is returned as is.
    fn step(
        &mut self,
        buffer: &mut RelayBuffer,
        channel: &mut MessageChannel,
    ) -> RelayResult<TransferState>;
}

#[derive(Debug, Default)]
struct Progress {
    state: TransferState,
    bytes: u64,
    chunks: u64,
}

impl Progress {
    fn confirm(&mut self, len: usize) {
        self.bytes += len as u64;
        self.chunks += 1;
    }

    fn settle<T>(&mut self, role: Role, outcome: RelayResult<T>) -> RelayResult<T> {
        if let Err(err) = &outcome {
            self.state = TransferState::Failed;
            debug!(%role, kind = %err.kind(), bytes = self.bytes, error = %err, "transfer failed");
        }
        outcome
    }

    fn complete(&mut self, role: Role) -> TransferState {
        self.state = TransferState::Completed;
        info!(%role, bytes = self.bytes, chunks = self.chunks, "transfer completed");
        self.state
    }
}

/// Reads a local stream chunk by chunk into the relay buffer and announces it.
pub struct SenderEngine<R> {
    source: R,
    progress: Progress,
}

impl<R: Read> SenderEngine<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            progress: Progress::default(),
        }
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    fn advance(
        &mut self,
        buffer: &mut RelayBuffer,
        channel: &mut MessageChannel,
    ) -> RelayResult<TransferState> {
        buffer.zero_fill();
        let n = fill_chunk(&mut self.source, buffer.as_mut_slice()).map_err(LocalIoError::Read)?;
        let address = buffer.physical_address();
        channel.announce_ready(address, n)?;
        if n == 0 {
            return Ok(self.progress.complete(Role::Sender));
        }

        let reported = channel.wait_read_done(channel.timeout())?;
        if reported == 0 {
            return Err(ProtocolViolation::RemoteReadNothing { announced: n }.into());
        }
        if reported != n {
            return Err(ProtocolViolation::ReadCountMismatch {
                announced: n,
                reported,
            }
            .into());
        }
        self.progress.confirm(n);
        debug!(
            chunk = self.progress.chunks,
            len = n,
            total = self.progress.bytes,
            "chunk sent"
        );
        Ok(TransferState::Transferring)
    }
}

impl<R: Read> TransferEngine for SenderEngine<R> {
    fn role(&self) -> Role {
        Role::Sender
    }

    fn state(&self) -> TransferState {
        self.progress.state
    }

    fn bytes_transferred(&self) -> u64 {
        self.progress.bytes
    }

    fn chunks(&self) -> u64 {
        self.progress.chunks
    }

    fn start(&mut self, _: &mut RelayBuffer, _: &mut MessageChannel) -> RelayResult<()> {
        if self.progress.state == TransferState::Idle {
            self.progress.state = TransferState::Transferring;
        }
        Ok(())
    }

    fn step(
        &mut self,
        buffer: &mut RelayBuffer,
        channel: &mut MessageChannel,
    ) -> RelayResult<TransferState> {
        match self.progress.state {
            state if state.is_terminal() => return Ok(state),
            TransferState::Idle => self.start(buffer, channel)?,
            _ => {}
        }
        let outcome = self.advance(buffer, channel);
        self.progress.settle(Role::Sender, outcome)
    }
}

/// Writes chunks the remote placed in the relay buffer to a local stream.
pub struct ReceiverEngine<W> {
    sink: W,
    progress: Progress,
}

impl<W: Write> ReceiverEngine<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            progress: Progress::default(),
        }
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    fn begin(
        &mut self,
        buffer: &mut RelayBuffer,
        channel: &mut MessageChannel,
    ) -> RelayResult<()> {
        buffer.zero_fill();
        channel.send_base_address(buffer.physical_address())?;
        self.progress.state = TransferState::Transferring;
        debug!(
            address = format_args!("{:#x}", buffer.physical_address()),
            "announced relay buffer"
        );
        Ok(())
    }

    fn advance(
        &mut self,
        buffer: &mut RelayBuffer,
        channel: &mut MessageChannel,
    ) -> RelayResult<TransferState> {
        // The buffer was cleared before it was handed over, so the remote
        // only ever writes into a zeroed region.
        let (remote, len) = channel.wait_write_done(channel.timeout())?;
        if len == 0 {
            self.sink.flush().map_err(LocalIoError::Write)?;
            return Ok(self.progress.complete(Role::Receiver));
        }

        let local = buffer.physical_address();
        if remote != local {
            return Err(ProtocolViolation::AddressMismatch { local, remote }.into());
        }
        let capacity = buffer.capacity();
        if len > capacity as u64 {
            return Err(ProtocolViolation::OversizedChunk { len, capacity }.into());
        }
        let len = len as usize;

        let chunk = buffer.chunk(len)?;
        write_chunk(&mut self.sink, chunk)?;
        buffer.zero_fill();
        channel.announce_read_done(len)?;

        self.progress.confirm(len);
        debug!(
            chunk = self.progress.chunks,
            len,
            total = self.progress.bytes,
            "chunk received"
        );
        Ok(TransferState::Transferring)
    }
}

impl<W: Write> TransferEngine for ReceiverEngine<W> {
    fn role(&self) -> Role {
        Role::Receiver
    }

    fn state(&self) -> TransferState {
        self.progress.state
    }

    fn bytes_transferred(&self) -> u64 {
        self.progress.bytes
    }

    fn chunks(&self) -> u64 {
        self.progress.chunks
    }

    fn start(
        &mut self,
        buffer: &mut RelayBuffer,
        channel: &mut MessageChannel,
    ) -> RelayResult<()> {
        if self.progress.state != TransferState::Idle {
            return Ok(());
        }
        let outcome = self.begin(buffer, channel);
        self.progress.settle(Role::Receiver, outcome)
    }

    fn step(
        &mut self,
        buffer: &mut RelayBuffer,
        channel: &mut MessageChannel,
    ) -> RelayResult<TransferState> {
        match self.progress.state {
            state if state.is_terminal() => return Ok(state),
            TransferState::Idle => self.start(buffer, channel)?,
            _ => {}
        }
        let outcome = self.advance(buffer, channel);
        self.progress.settle(Role::Receiver, outcome)
    }
}

/// Reads until `buf` is full or the reader reports end-of-file.
///
/// A return of zero therefore always means the stream is exhausted.
pub(crate) fn fill_chunk<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn write_chunk<W: Write + ?Sized>(writer: &mut W, chunk: &[u8]) -> Result<(), LocalIoError> {
    let mut written = 0;
    while written < chunk.len() {
        match writer.write(&chunk[written..]) {
            Ok(0) => {
                return Err(LocalIoError::ShortWrite {
                    expected: chunk.len(),
                    written,
                })
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(LocalIoError::Write(err)),
        }
    }
    Ok(())
}
