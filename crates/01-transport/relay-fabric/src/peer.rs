//! The far side of the relay handshake.
//!
//! [`RemotePeer`] plays the remote endpoint over any [`MessageTransport`],
//! reaching the local relay buffer through [`PhysicalMemory`] the way a
//! device on the bus would. Paired with a local sender it acts as a sink;
//! paired with a local receiver it acts as a source.

use std::io::{Read, Write};

use relay_buffer::PhysicalMemory;
use tracing::{debug, info};

use crate::engine::fill_chunk;
use crate::error::{ChannelError, LocalIoError, ProtocolViolation, RelayResult};
use crate::message::{ControlMsg, WaitTimeout};
use crate::transport::MessageTransport;

/// Which half of the handshake the peer ended up serving.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    /// Consumed chunks announced by a local sender.
    Sink,
    /// Produced chunks for a local receiver.
    Source,
}

/// What the peer moved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerReport {
    pub bytes: u64,
    pub chunks: u64,
}

impl PeerReport {
    fn record(&mut self, len: usize) {
        self.bytes += len as u64;
        self.chunks += 1;
    }
}

pub struct RemotePeer<M> {
    transport: Box<dyn MessageTransport>,
    memory: M,
    capacity: usize,
    timeout: WaitTimeout,
}

impl<M: PhysicalMemory> RemotePeer<M> {
    /// `capacity` bounds every chunk the peer accepts or produces.
    pub fn new(transport: Box<dyn MessageTransport>, memory: M, capacity: usize) -> Self {
        Self {
            transport,
            memory,
            capacity,
            timeout: WaitTimeout::Infinite,
        }
    }

    pub fn with_timeout(mut self, timeout: WaitTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Serves a local sender, writing every announced chunk to `writer`.
    pub fn sink<W: Write>(&mut self, writer: W) -> RelayResult<PeerReport> {
        let first = self.transport.recv(self.timeout)?;
        self.sink_from(first, writer)
    }

    /// Serves a local receiver with the contents of `reader`.
    pub fn source<R: Read>(&mut self, reader: R) -> RelayResult<PeerReport> {
        let first = self.transport.recv(self.timeout)?;
        self.source_from(first, reader)
    }

    /// Waits for the local side's first message and serves whichever role it implies.
    ///
    /// A local sender opens with a chunk announcement and needs `writer`; a
    /// local receiver opens with its base address and needs `reader`.
    pub fn serve<R: Read, W: Write>(
        &mut self,
        reader: Option<R>,
        writer: Option<W>,
    ) -> RelayResult<(PeerRole, PeerReport)> {
        let first = self.transport.recv(self.timeout)?;
        match (first, reader, writer) {
            (ControlMsg::DataReady { .. }, _, Some(writer)) => {
                Ok((PeerRole::Sink, self.sink_from(first, writer)?))
            }
            (ControlMsg::BaseAddress { .. }, Some(reader), _) => {
                Ok((PeerRole::Source, self.source_from(first, reader)?))
            }
            (other, _, _) => Err(ChannelError::Unexpected {
                expected: "a handshake this peer can serve",
                received: other.name(),
            }
            .into()),
        }
    }

    pub fn into_transport(self) -> Box<dyn MessageTransport> {
        self.transport
    }

    fn sink_from<W: Write>(&mut self, first: ControlMsg, mut writer: W) -> RelayResult<PeerReport> {
        let mut report = PeerReport::default();
        let mut scratch = vec![0u8; self.capacity];
        let mut msg = first;
        loop {
            let (address, len) = match msg {
                ControlMsg::DataReady { address, len } => (address, len),
                other => {
                    return Err(ChannelError::Unexpected {
                        expected: "data-ready",
                        received: other.name(),
                    }
                    .into())
                }
            };
            if len == 0 {
                break;
            }
            if len > self.capacity as u64 {
                return Err(ProtocolViolation::OversizedChunk {
                    len,
                    capacity: self.capacity,
                }
                .into());
            }
            let len = len as usize;

            let chunk = &mut scratch[..len];
            self.memory.read(address, chunk)?;
            writer.write_all(chunk).map_err(LocalIoError::Write)?;
            self.transport.send(ControlMsg::ReadDone { len: len as u64 })?;
            report.record(len);
            debug!(chunk = report.chunks, len, "peer consumed chunk");

            msg = self.transport.recv(self.timeout)?;
        }
        writer.flush().map_err(LocalIoError::Write)?;
        info!(bytes = report.bytes, chunks = report.chunks, "peer sink finished");
        Ok(report)
    }

    fn source_from<R: Read>(&mut self, first: ControlMsg, mut reader: R) -> RelayResult<PeerReport> {
        let address = match first {
            ControlMsg::BaseAddress { address } => address,
            other => {
                return Err(ChannelError::Unexpected {
                    expected: "base-address",
                    received: other.name(),
                }
                .into())
            }
        };

        let mut report = PeerReport::default();
        let mut scratch = vec![0u8; self.capacity];
        loop {
            let n = fill_chunk(&mut reader, &mut scratch).map_err(LocalIoError::Read)?;
            if n == 0 {
                self.transport
                    .send(ControlMsg::WriteDone { address, len: 0 })?;
                break;
            }
            self.memory.write(address, &scratch[..n])?;
            self.transport.send(ControlMsg::WriteDone {
                address,
                len: n as u64,
            })?;

            let consumed = match self.transport.recv(self.timeout)? {
                ControlMsg::ReadDone { len } => len as usize,
                other => {
                    return Err(ChannelError::Unexpected {
                        expected: "read-done",
                        received: other.name(),
                    }
                    .into())
                }
            };
            if consumed == 0 {
                return Err(ProtocolViolation::RemoteReadNothing { announced: n }.into());
            }
            if consumed != n {
                return Err(ProtocolViolation::ReadCountMismatch {
                    announced: n,
                    reported: consumed,
                }
                .into());
            }
            report.record(n);
            debug!(chunk = report.chunks, len = n, "peer produced chunk");
        }
        info!(bytes = report.bytes, chunks = report.chunks, "peer source finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::loopback::link;
    use crate::message::ChannelId;
    use relay_buffer::{Allocator, PhysBus};
    use std::io::Cursor;

    #[test]
    fn sink_copies_announced_chunks_out_of_memory() {
        let bus = PhysBus::new();
        let mut handle = bus.allocator().open().expect("open");
        handle.alloc(8).expect("alloc");
        let address = handle.physical_address().expect("address");
        bus.write(address, b"abcdefgh").expect("write");

        let (mut local, remote) = link(ChannelId::new(0, 0));
        local
            .send(ControlMsg::DataReady { address, len: 8 })
            .expect("send");
        local
            .send(ControlMsg::DataReady { address, len: 0 })
            .expect("send");

        let mut peer = RemotePeer::new(Box::new(remote), bus.clone(), 8);
        let mut out = Vec::new();
        let report = peer.sink(&mut out).expect("sink");
        assert_eq!(out, b"abcdefgh");
        assert_eq!(report, PeerReport { bytes: 8, chunks: 1 });
        assert_eq!(
            local.recv(WaitTimeout::Infinite).expect("recv"),
            ControlMsg::ReadDone { len: 8 }
        );
    }

    #[test]
    fn source_waits_for_base_address() {
        let bus = PhysBus::new();
        let (mut local, remote) = link(ChannelId::new(0, 0));
        local
            .send(ControlMsg::ReadDone { len: 1 })
            .expect("send");
        let mut peer = RemotePeer::new(Box::new(remote), bus, 8);
        assert!(matches!(
            peer.source(Cursor::new(vec![1u8])),
            Err(RelayError::Channel(ChannelError::Unexpected {
                expected: "base-address",
                ..
            }))
        ));
    }

    #[test]
    fn serve_needs_the_matching_stream() {
        let bus = PhysBus::new();
        let (mut local, remote) = link(ChannelId::new(0, 0));
        local
            .send(ControlMsg::BaseAddress { address: 0x8000_0000 })
            .expect("send");
        let mut peer = RemotePeer::new(Box::new(remote), bus, 8);
        let result = peer.serve(None::<Cursor<Vec<u8>>>, Some(Vec::new()));
        assert!(matches!(
            result,
            Err(RelayError::Channel(ChannelError::Unexpected {
                received: "base-address",
                ..
            }))
        ));
    }

    #[test]
    fn sink_rejects_oversized_announcement() {
        let bus = PhysBus::new();
        let (mut local, remote) = link(ChannelId::new(0, 0));
        local
            .send(ControlMsg::DataReady {
                address: 0x8000_0000,
                len: 9,
            })
            .expect("send");
        let mut peer = RemotePeer::new(Box::new(remote), bus, 8);
        assert!(matches!(
            peer.sink(Vec::new()),
            Err(RelayError::Protocol(ProtocolViolation::OversizedChunk {
                len: 9,
                capacity: 8
            }))
        ));
    }
}
