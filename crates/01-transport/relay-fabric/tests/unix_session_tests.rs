//! Relay sessions over the host backends.
//! The local side runs against a Unix socket listener and file-backed shared
//! memory; the remote endpoint is a `RemotePeer` on its own thread that
//! reaches the same segments by physical address.
#![cfg(unix)]

use std::fs::{self, File};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use relay_buffer::{ShmAllocator, ShmMemory};
use relay_fabric::unix::{listen, UnixConnector, UnixTransport};
use relay_fabric::{
    run, Connector, ErrorKind, PeerReport, RelayResult, RemotePeer, Role, SessionConfig,
    TransferResult, TransferState, WaitTimeout,
};
use tempfile::TempDir;

const CAPACITY: usize = 4096;
const ENDPOINT: u32 = 7;
const PEER_WAIT: Duration = Duration::from_secs(5);

struct Harness {
    sockets: TempDir,
    shm: TempDir,
    files: TempDir,
    listener: UnixListener,
    config: SessionConfig,
}

impl Harness {
    fn new() -> Self {
        let sockets = tempfile::tempdir().expect("socket dir");
        let listener = listen(sockets.path(), ENDPOINT).expect("listen");
        Self {
            sockets,
            shm: tempfile::tempdir().expect("shm dir"),
            files: tempfile::tempdir().expect("file dir"),
            listener,
            config: SessionConfig {
                endpoint: ENDPOINT,
                port: 0,
                capacity: CAPACITY,
                wait_timeout: WaitTimeout::Bounded(PEER_WAIT),
            },
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.files.path().join(name)
    }

    fn connector(&self) -> UnixConnector {
        UnixConnector::new(self.sockets.path())
    }

    /// Accepts one connection and hands the peer to `serve` on a new thread.
    fn spawn_peer<F>(&self, serve: F) -> JoinHandle<RelayResult<PeerReport>>
    where
        F: FnOnce(&mut RemotePeer<ShmMemory>) -> RelayResult<PeerReport> + Send + 'static,
    {
        let listener = self.listener.try_clone().expect("clone listener");
        let memory = ShmMemory::new(self.shm.path());
        let port = self.config.port;
        let capacity = self.config.capacity;
        thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let transport = UnixTransport::new(stream, port);
            let mut peer = RemotePeer::new(Box::new(transport), memory, capacity)
                .with_timeout(WaitTimeout::Bounded(PEER_WAIT));
            serve(&mut peer)
        })
    }

    fn run(&self, role: Role, name: &str) -> TransferResult {
        let allocator = ShmAllocator::new(self.shm.path());
        run(&self.config, role, &self.path(name), &allocator, &self.connector())
    }

    fn segments(&self) -> Vec<PathBuf> {
        fs::read_dir(self.shm.path())
            .expect("read shm dir")
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_segment(path))
            .collect()
    }
}

fn is_segment(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("relay-"))
}

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// A sender streams a file through a shm segment to a socket peer.
#[test]
fn sender_relays_file_through_shared_memory() {
    let h = Harness::new();
    let data = payload(10_000, 11);
    fs::write(h.path("in.bin"), &data).expect("write input");
    let sunk = h.path("sunk.bin");
    let sink_path = sunk.clone();
    let peer = h.spawn_peer(move |peer| peer.sink(File::create(sink_path).expect("create sink")));

    let report = h.run(Role::Sender, "in.bin").expect("send");
    let peer_report = peer.join().expect("peer thread").expect("peer sink");

    assert_eq!(report.state, TransferState::Completed);
    assert_eq!(report.bytes_transferred, 10_000);
    assert_eq!(report.chunks, 3);
    assert_eq!(peer_report, PeerReport { bytes: 10_000, chunks: 3 });
    assert_eq!(fs::read(&sunk).expect("read sink"), data);
    assert!(h.segments().is_empty(), "segment left behind");
}

/// A receiver fills a file from a socket peer writing into its shm segment.
#[test]
fn receiver_collects_file_through_shared_memory() {
    let h = Harness::new();
    let data = payload(10_000, 12);
    let source = data.clone();
    let peer = h.spawn_peer(move |peer| peer.source(source.as_slice()));

    let report = h.run(Role::Receiver, "out.bin").expect("receive");
    let peer_report = peer.join().expect("peer thread").expect("peer source");

    assert_eq!(report.state, TransferState::Completed);
    assert_eq!(report.bytes_transferred, 10_000);
    assert_eq!(report.chunks, 3);
    assert_eq!(peer_report.bytes, 10_000);
    assert_eq!(fs::read(h.path("out.bin")).expect("read output"), data);
    assert!(h.segments().is_empty(), "segment left behind");
}

/// A port already claimed by another session is refused before any segment exists.
#[test]
fn claimed_port_is_refused_without_allocating() {
    let h = Harness::new();
    fs::write(h.path("in.bin"), b"payload").expect("write input");
    let _held = h
        .connector()
        .open(h.config.channel_id())
        .expect("first session");

    let failure = h.run(Role::Sender, "in.bin").expect_err("busy");
    assert_eq!(failure.kind(), ErrorKind::Channel);
    assert_eq!(failure.report.bytes_transferred, 0);
    assert!(h.segments().is_empty());
}
