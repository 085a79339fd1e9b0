//! Relay session integration tests.
//! Each test runs a real session against an emulated remote endpoint on its
//! own thread, sharing a simulated physical bus and a loopback hub, then
//! checks the transferred bytes, the handshake trace and resource release.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use relay_buffer::{PhysBus, PhysicalMemory};
use relay_fabric::loopback::{LoopbackEnd, LoopbackHub};
use relay_fabric::{
    run, ControlMsg, ErrorKind, MessageTransport, PeerReport, ProtocolViolation, RelayError,
    RelayResult, RemotePeer, Role, SessionConfig, TransferResult, TransferState, WaitTimeout,
};
use tempfile::TempDir;

const CAPACITY: usize = 4096;
const PEER_WAIT: Duration = Duration::from_secs(5);

struct Harness {
    bus: Arc<PhysBus>,
    hub: LoopbackHub,
    dir: TempDir,
    config: SessionConfig,
}

/// What a recording peer saw while sinking a sender's chunks.
#[derive(Debug, Default)]
struct Trace {
    announced: Vec<u64>,
    data: Vec<u8>,
    dirty_tail: bool,
}

impl Harness {
    fn new(capacity: usize) -> Self {
        Self {
            bus: PhysBus::new(),
            hub: LoopbackHub::new(),
            dir: tempfile::tempdir().expect("tempdir"),
            config: SessionConfig {
                endpoint: 1,
                port: 0,
                capacity,
                wait_timeout: WaitTimeout::Bounded(PEER_WAIT),
            },
        }
    }

    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = WaitTimeout::Bounded(timeout);
        self
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn accept(acceptor: &Receiver<LoopbackEnd>) -> Option<LoopbackEnd> {
        acceptor.recv_timeout(PEER_WAIT).ok()
    }

    fn spawn_peer<T, F>(&self, serve: F) -> JoinHandle<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(LoopbackEnd, Arc<PhysBus>, usize) -> T + Send + 'static,
    {
        let acceptor = self.hub.acceptor();
        let bus = Arc::clone(&self.bus);
        let capacity = self.config.capacity;
        thread::spawn(move || Self::accept(&acceptor).map(|end| serve(end, bus, capacity)))
    }

    fn run(&self, role: Role, name: &str) -> TransferResult {
        run(
            &self.config,
            role,
            &self.path(name),
            &self.bus.allocator(),
            &self.hub,
        )
    }

    /// Sends `data` from a local file to a [`RemotePeer`] sink.
    fn send_to_peer(&self, data: &[u8]) -> (TransferResult, RelayResult<PeerReport>, Vec<u8>) {
        fs::write(self.path("source.bin"), data).expect("write source");
        let peer = self.spawn_peer(|end, bus, capacity| {
            let mut peer = RemotePeer::new(Box::new(end), bus, capacity)
                .with_timeout(WaitTimeout::Bounded(PEER_WAIT));
            let mut out = Vec::new();
            let report = peer.sink(&mut out);
            (report, out)
        });
        let result = self.run(Role::Sender, "source.bin");
        let (report, out) = peer.join().expect("peer thread").expect("peer accepted");
        (result, report, out)
    }

    /// Receives `data` from a [`RemotePeer`] source into a local file.
    fn receive_from_peer(&self, data: Vec<u8>) -> (TransferResult, RelayResult<PeerReport>, Vec<u8>) {
        let peer = self.spawn_peer(move |end, bus, capacity| {
            let mut peer = RemotePeer::new(Box::new(end), bus, capacity)
                .with_timeout(WaitTimeout::Bounded(PEER_WAIT));
            peer.source(data.as_slice())
        });
        let result = self.run(Role::Receiver, "sink.bin");
        let report = peer.join().expect("peer thread").expect("peer accepted");
        let written = fs::read(self.path("sink.bin")).expect("read sink");
        (result, report, written)
    }

    /// Sends `data` to a peer that records every announcement and inspects
    /// the whole relay buffer each time.
    fn send_recorded(&self, data: &[u8]) -> (TransferResult, Trace) {
        fs::write(self.path("source.bin"), data).expect("write source");
        let peer = self.spawn_peer(|mut end, bus, capacity| {
            let mut trace = Trace::default();
            let mut view = vec![0u8; capacity];
            while let Ok(ControlMsg::DataReady { address, len }) = end.recv(WaitTimeout::Bounded(PEER_WAIT)) {
                trace.announced.push(len);
                if len == 0 {
                    break;
                }
                bus.read(address, &mut view).expect("bus read");
                let len = len as usize;
                trace.data.extend_from_slice(&view[..len]);
                trace.dirty_tail |= view[len..].iter().any(|&b| b != 0);
                end.send(ControlMsg::ReadDone { len: len as u64 })
                    .expect("read-done");
            }
            trace
        });
        let result = self.run(Role::Sender, "source.bin");
        let trace = peer.join().expect("peer thread").expect("peer accepted");
        (result, trace)
    }

    fn assert_released(&self) {
        assert_eq!(self.bus.open_handles(), 0, "allocator handles left open");
        assert_eq!(self.bus.live_frames(), 0, "relay buffers left allocated");
        assert_eq!(self.hub.active(), 0, "channels left open");
        assert_eq!(self.hub.opened(), self.hub.closed());
    }
}

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Sends `data` out through a sender session and back in through a receiver
/// session, returning what the receiver wrote.
fn round_trip(capacity: usize, data: &[u8]) -> Vec<u8> {
    let h = Harness::new(capacity);
    let (sent, sink_report, relayed) = h.send_to_peer(data);
    let sent = sent.expect("sender session");
    assert_eq!(sent.state, TransferState::Completed);
    assert_eq!(sent.bytes_transferred, data.len() as u64);
    assert_eq!(sink_report.expect("peer sink").bytes, data.len() as u64);

    let (received, source_report, written) = h.receive_from_peer(relayed);
    let received = received.expect("receiver session");
    assert_eq!(received.state, TransferState::Completed);
    assert_eq!(received.bytes_transferred, data.len() as u64);
    assert_eq!(source_report.expect("peer source").chunks, received.chunks);
    h.assert_released();
    written
}

/// Empty, exactly-one-buffer and one-byte-over files survive a full relay unchanged.
#[test]
fn round_trip_preserves_boundary_sizes() {
    for len in [0, CAPACITY, CAPACITY + 1] {
        let data = payload(len, len as u64);
        assert_eq!(round_trip(CAPACITY, &data), data, "length {len}");
    }
}

/// A 10-byte file with the default buffer moves as one chunk followed by the
/// end-of-stream announcement.
#[test]
fn ten_byte_file_is_one_chunk_then_end() {
    let h = Harness::new(0x30_0000);
    let (result, trace) = h.send_recorded(b"0123456789");
    let report = result.expect("session");
    assert_eq!(trace.announced, vec![10, 0]);
    assert_eq!(trace.data, b"0123456789");
    assert!(!trace.dirty_tail);
    assert_eq!(report.bytes_transferred, 10);
    assert_eq!(report.chunks, 1);
    h.assert_released();
}

/// A file of twice the capacity needs two full chunks and the terminating announcement.
#[test]
fn double_capacity_file_takes_three_announcements() {
    let h = Harness::new(CAPACITY);
    let data = payload(2 * CAPACITY, 7);
    let (result, trace) = h.send_recorded(&data);
    result.expect("session");
    assert_eq!(
        trace.announced,
        vec![CAPACITY as u64, CAPACITY as u64, 0]
    );
    assert_eq!(trace.data, data);
}

/// No announcement exceeds the buffer and the bytes past each chunk are always zero.
#[test]
fn chunks_are_bounded_and_buffer_tail_is_clean() {
    let h = Harness::new(CAPACITY);
    let data = vec![0xFFu8; 3 * CAPACITY + 123];
    let (result, trace) = h.send_recorded(&data);
    assert_eq!(result.expect("session").chunks, 4);
    assert!(trace.announced.iter().all(|&len| len <= CAPACITY as u64));
    assert_eq!(trace.announced.last(), Some(&0));
    assert!(!trace.dirty_tail, "stale bytes leaked past a short chunk");
    h.assert_released();
}

/// A remote that never confirms the first chunk fails the session after the
/// timeout with nothing transferred and everything released.
#[test]
fn missing_read_done_times_out() {
    let h = Harness::new(CAPACITY).with_timeout(Duration::from_millis(50));
    fs::write(h.path("source.bin"), b"payload").expect("write source");
    // The peer keeps its end alive until joined so the wait sees silence, not a hang-up.
    let peer = h.spawn_peer(|mut end, _, _| {
        let first = end.recv(WaitTimeout::Bounded(PEER_WAIT));
        (end, first)
    });

    let failure = h.run(Role::Sender, "source.bin").expect_err("timeout");
    assert_eq!(failure.kind(), ErrorKind::Channel);
    assert!(failure.error.is_timeout());
    assert_eq!(failure.report.state, TransferState::Failed);
    assert_eq!(failure.report.bytes_transferred, 0);

    let (_end, first) = peer.join().expect("peer thread").expect("peer accepted");
    assert!(matches!(first, Ok(ControlMsg::DataReady { len: 7, .. })));
    h.assert_released();
}

/// A write completion pointing outside the relay buffer fails the receiver
/// before any byte reaches the local file.
#[test]
fn foreign_write_address_writes_nothing() {
    let h = Harness::new(CAPACITY);
    let peer = h.spawn_peer(|mut end, bus, _| {
        let Ok(ControlMsg::BaseAddress { address }) = end.recv(WaitTimeout::Bounded(PEER_WAIT))
        else {
            return None;
        };
        bus.write(address, b"rogue").expect("bus write");
        end.send(ControlMsg::WriteDone {
            address: address + CAPACITY as u64,
            len: 5,
        })
        .expect("write-done");
        Some(end)
    });

    let failure = h.run(Role::Receiver, "sink.bin").expect_err("mismatch");
    assert!(matches!(
        failure.error,
        RelayError::Protocol(ProtocolViolation::AddressMismatch { .. })
    ));
    assert_eq!(failure.report.bytes_transferred, 0);
    assert!(fs::read(h.path("sink.bin")).expect("sink exists").is_empty());
    drop(peer.join().expect("peer thread"));
    h.assert_released();
}

/// Repeated sessions on one bus and hub leave no handle, frame or channel behind.
#[test]
fn repeated_sessions_release_everything() {
    let h = Harness::new(CAPACITY);
    for round in 0..3u64 {
        let data = payload(CAPACITY / 2 + round as usize * CAPACITY, round);
        let (sent, _, relayed) = h.send_to_peer(&data);
        sent.expect("sender");
        let (received, _, written) = h.receive_from_peer(relayed);
        received.expect("receiver");
        assert_eq!(written, data);
    }
    assert_eq!(h.hub.opened(), 6);
    h.assert_released();
}

#[cfg(feature = "proptest")]
mod prop {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Any file size relays unchanged and in `ceil(len / capacity)` chunks.
        #[test]
        fn relay_round_trip_prop(len in 0usize..(5 * 512), seed in any::<u64>()) {
            let capacity = 512;
            let data = payload(len, seed);
            let h = Harness::new(capacity);
            let (result, trace) = h.send_recorded(&data);
            let report = result.expect("session");
            prop_assert_eq!(report.chunks as usize, len.div_ceil(capacity));
            prop_assert_eq!(trace.data.as_slice(), data.as_slice());
            prop_assert!(!trace.dirty_tail);
            prop_assert_eq!(round_trip(capacity, &data), data);
        }
    }
}
