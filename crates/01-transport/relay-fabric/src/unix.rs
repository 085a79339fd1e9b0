//! Unix-domain-socket message transport.
//!
//! Endpoint `N` listens on `<socket_dir>/relay-epN.sock`. Messages travel as
//! fixed-size frames (see [`encode_frame`]); each frame carries its port and a
//! frame for another port is a [`ChannelError::PortMismatch`].
//!
//! A connecting session first takes an exclusive `flock` on
//! `<socket_dir>/relay-epN-pP.lock`, so at most one session per endpoint and
//! port exists across processes. The lock dies with its file descriptor; the
//! lock file itself is left in place.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{ChannelError, ChannelResult};
use crate::message::{decode_frame, encode_frame, ChannelId, ControlMsg, WaitTimeout, FRAME_LEN};
use crate::transport::{Connector, MessageTransport};

/// Socket path for `endpoint` inside `socket_dir`.
pub fn socket_path(socket_dir: &Path, endpoint: u32) -> PathBuf {
    socket_dir.join(format!("relay-ep{endpoint}.sock"))
}

/// Lock file guarding one `(endpoint, port)` pair inside `socket_dir`.
pub fn lock_path(socket_dir: &Path, id: ChannelId) -> PathBuf {
    socket_dir.join(format!("relay-ep{}-p{}.lock", id.endpoint, id.port))
}

/// Exclusive claim on one `(endpoint, port)` pair, released on drop.
struct PortClaim {
    file: File,
    path: PathBuf,
}

impl PortClaim {
    fn acquire(socket_dir: &Path, id: ChannelId) -> ChannelResult<Self> {
        let path = lock_path(socket_dir, id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        // SAFETY: `file` owns the descriptor and keeps it open for the call.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(ChannelError::Busy {
                    endpoint: id.endpoint,
                    port: id.port,
                });
            }
            return Err(err.into());
        }
        trace!(path = %path.display(), "claimed port");
        Ok(Self { file, path })
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        trace!(path = %self.path.display(), "released port");
    }
}

/// Binds the listening socket for `endpoint`, replacing a stale socket file.
pub fn listen(socket_dir: &Path, endpoint: u32) -> io::Result<UnixListener> {
    let path = socket_path(socket_dir, endpoint);
    match fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    UnixListener::bind(&path)
}

/// Connector dialing endpoints through their socket files.
#[derive(Clone, Debug)]
pub struct UnixConnector {
    socket_dir: PathBuf,
}

impl UnixConnector {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }
}

impl Connector for UnixConnector {
    fn open(&self, id: ChannelId) -> ChannelResult<Box<dyn MessageTransport>> {
        let claim = PortClaim::acquire(&self.socket_dir, id)?;
        let path = socket_path(&self.socket_dir, id.endpoint);
        let stream = UnixStream::connect(&path)?;
        debug!(path = %path.display(), port = id.port, "connected to endpoint");
        let mut transport = UnixTransport::new(stream, id.port);
        transport.claim = Some(claim);
        Ok(Box::new(transport))
    }
}

/// Frame transport over one connected stream, bound to one port.
///
/// Transports opened through [`UnixConnector`] hold the port claim until closed.
pub struct UnixTransport {
    stream: Option<UnixStream>,
    port: u32,
    claim: Option<PortClaim>,
}

impl UnixTransport {
    pub fn new(stream: UnixStream, port: u32) -> Self {
        Self {
            stream: Some(stream),
            port,
            claim: None,
        }
    }

    fn stream(&mut self) -> ChannelResult<&mut UnixStream> {
        self.stream.as_mut().ok_or(ChannelError::Closed)
    }
}

impl MessageTransport for UnixTransport {
    fn send(&mut self, msg: ControlMsg) -> ChannelResult<()> {
        let frame = encode_frame(self.port, &msg);
        trace!(port = self.port, msg = msg.name(), "send");
        self.stream()?.write_all(&frame).map_err(map_io)
    }

    fn recv(&mut self, timeout: WaitTimeout) -> ChannelResult<ControlMsg> {
        let port = self.port;
        let stream = self.stream()?;
        // A zero read timeout means "block forever" to the socket layer.
        let read_timeout = timeout
            .as_duration()
            .map(|d| d.max(Duration::from_millis(1)));
        stream.set_read_timeout(read_timeout)?;

        let mut frame = [0u8; FRAME_LEN];
        stream.read_exact(&mut frame).map_err(|err| match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ChannelError::Timeout {
                waited: read_timeout.unwrap_or_default(),
            },
            _ => map_io(err),
        })?;

        let (received, msg) = decode_frame(&frame)?;
        if received != port {
            return Err(ChannelError::PortMismatch {
                expected: port,
                received,
            });
        }
        trace!(port, msg = msg.name(), "recv");
        Ok(msg)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.claim = None;
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn map_io(err: io::Error) -> ChannelError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset => ChannelError::Closed,
        _ => ChannelError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(port: u32) -> (UnixTransport, UnixTransport) {
        let (a, b) = UnixStream::pair().expect("socketpair");
        (UnixTransport::new(a, port), UnixTransport::new(b, port))
    }

    #[test]
    fn frames_cross_the_socket() {
        let (mut a, mut b) = pair(4);
        a.send(ControlMsg::WriteDone {
            address: 0x9000,
            len: 77,
        })
        .expect("send");
        assert_eq!(
            b.recv(WaitTimeout::Bounded(Duration::from_secs(1)))
                .expect("recv"),
            ControlMsg::WriteDone {
                address: 0x9000,
                len: 77
            }
        );
    }

    #[test]
    fn port_mismatch_is_reported() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let mut a = UnixTransport::new(a, 1);
        let mut b = UnixTransport::new(b, 2);
        a.send(ControlMsg::ReadDone { len: 1 }).expect("send");
        assert!(matches!(
            b.recv(WaitTimeout::Infinite),
            Err(ChannelError::PortMismatch {
                expected: 2,
                received: 1
            })
        ));
    }

    #[test]
    fn silent_peer_times_out_and_closed_peer_is_closed() {
        let (mut a, mut b) = pair(0);
        assert!(matches!(
            a.recv(WaitTimeout::Bounded(Duration::from_millis(20))),
            Err(ChannelError::Timeout { .. })
        ));
        b.close();
        assert!(matches!(
            a.recv(WaitTimeout::Infinite),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn connector_dials_listener() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listener = listen(dir.path(), 9).expect("listen");
        let connector = UnixConnector::new(dir.path());
        let mut local = connector.open(ChannelId::new(9, 3)).expect("connect");
        let (stream, _) = listener.accept().expect("accept");
        let mut remote = UnixTransport::new(stream, 3);

        local
            .send(ControlMsg::BaseAddress { address: 0x4000 })
            .expect("send");
        assert_eq!(
            remote.recv(WaitTimeout::Infinite).expect("recv"),
            ControlMsg::BaseAddress { address: 0x4000 }
        );
    }

    #[test]
    fn second_session_on_a_port_is_busy_until_the_first_closes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _listener = listen(dir.path(), 1).expect("listen");
        let connector = UnixConnector::new(dir.path());
        let id = ChannelId::new(1, 0);

        let mut first = connector.open(id).expect("first session");
        assert!(matches!(
            connector.open(id),
            Err(ChannelError::Busy {
                endpoint: 1,
                port: 0
            })
        ));
        let _other_port = connector
            .open(ChannelId::new(1, 1))
            .expect("other port is free");

        first.close();
        let _again = connector.open(id).expect("claim released on close");
    }

    #[test]
    fn failed_connect_releases_the_claim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let connector = UnixConnector::new(dir.path());
        let id = ChannelId::new(2, 0);
        assert!(matches!(connector.open(id), Err(ChannelError::Io(_))));

        let _listener = listen(dir.path(), 2).expect("listen");
        let _session = connector.open(id).expect("claim was not leaked");
        assert!(lock_path(dir.path(), id).exists());
    }

    #[test]
    fn missing_endpoint_fails_to_connect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let connector = UnixConnector::new(dir.path());
        assert!(matches!(
            connector.open(ChannelId::new(1, 0)),
            Err(ChannelError::Io(_))
        ));
    }
}
