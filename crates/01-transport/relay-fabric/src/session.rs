//! Scoped relay sessions.
//!
//! [`run`] owns every resource of one transfer: it opens the channel, acquires
//! the relay buffer, opens the local file, drives the role's engine to a
//! terminal state and releases all of it on every path. [`Session`] is the
//! engine-driving core for callers that already hold a buffer and a channel.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use relay_buffer::{Allocator, RelayBuffer, DEFAULT_CAPACITY};
use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::channel::MessageChannel;
use crate::engine::{ReceiverEngine, Role, SenderEngine, TransferEngine, TransferState};
use crate::error::{ErrorKind, LocalIoError, RelayError, RelayResult};
use crate::message::{ChannelId, WaitTimeout};
use crate::transport::Connector;

/// Parameters of one relay session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub endpoint: u32,
    pub port: u32,
    /// Relay buffer size, and therefore the largest chunk.
    pub capacity: usize,
    /// Applied to every wait on the channel.
    pub wait_timeout: WaitTimeout,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: 0,
            port: 0,
            capacity: DEFAULT_CAPACITY,
            wait_timeout: WaitTimeout::Infinite,
        }
    }
}

impl SessionConfig {
    pub fn channel_id(&self) -> ChannelId {
        ChannelId::new(self.endpoint, self.port)
    }
}

/// Outcome of a session: final state and what the remote confirmed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferReport {
    pub role: Role,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub chunks: u64,
}

impl TransferReport {
    fn of(engine: &dyn TransferEngine) -> Self {
        Self {
            role: engine.role(),
            state: engine.state(),
            bytes_transferred: engine.bytes_transferred(),
            chunks: engine.chunks(),
        }
    }

    fn failed_setup(role: Role) -> Self {
        Self {
            role,
            state: TransferState::Failed,
            bytes_transferred: 0,
            chunks: 0,
        }
    }
}

/// First error of a failed session together with its progress at that point.
#[derive(Debug, Error)]
#[error("{} transfer failed after {} bytes", .report.role, .report.bytes_transferred)]
pub struct SessionFailure {
    #[source]
    pub error: RelayError,
    pub report: TransferReport,
}

impl SessionFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

pub type TransferResult = Result<TransferReport, SessionFailure>;

/// Drives engines over a borrowed relay buffer and channel.
pub struct Session<'a> {
    buffer: &'a mut RelayBuffer,
    channel: &'a mut MessageChannel,
}

impl<'a> Session<'a> {
    pub fn new(buffer: &'a mut RelayBuffer, channel: &'a mut MessageChannel) -> Self {
        Self { buffer, channel }
    }

    /// Steps `engine` until it reaches `Completed` or `Failed`.
    pub fn run(&mut self, engine: &mut dyn TransferEngine) -> RelayResult<TransferState> {
        loop {
            let state = engine.step(self.buffer, self.channel)?;
            if state.is_terminal() {
                return Ok(state);
            }
        }
    }

    /// Streams `source` to the remote endpoint.
    pub fn send<R: Read>(&mut self, source: R) -> TransferResult {
        let mut engine = SenderEngine::new(source);
        self.drive(&mut engine)
    }

    /// Streams remote data into `sink`.
    pub fn receive<W: Write>(&mut self, sink: W) -> TransferResult {
        let mut engine = ReceiverEngine::new(sink);
        self.drive(&mut engine)
    }

    fn drive(&mut self, engine: &mut dyn TransferEngine) -> TransferResult {
        match self.run(engine) {
            Ok(_) => Ok(TransferReport::of(engine)),
            Err(error) => Err(SessionFailure {
                error,
                report: TransferReport::of(engine),
            }),
        }
    }
}

/// Runs one complete transfer of `local_path` in `role`.
///
/// Resources are acquired in order (channel, relay buffer, local file) and
/// released in reverse on every path. The receiver creates or truncates
/// `local_path`.
pub fn run(
    config: &SessionConfig,
    role: Role,
    local_path: &Path,
    allocator: &dyn Allocator,
    connector: &dyn Connector,
) -> TransferResult {
    let span = info_span!(
        "relay_session",
        %role,
        endpoint = config.endpoint,
        port = config.port
    );
    let _enter = span.enter();
    let setup_failure = |error: RelayError| SessionFailure {
        error,
        report: TransferReport::failed_setup(role),
    };

    let mut channel = MessageChannel::open(connector, config.channel_id(), config.wait_timeout)
        .map_err(|err| setup_failure(err.into()))?;
    let mut buffer = match RelayBuffer::acquire(allocator, config.capacity) {
        Ok(buffer) => buffer,
        Err(err) => {
            channel.close();
            return Err(setup_failure(err.into()));
        }
    };
    let file = match open_local(role, local_path) {
        Ok(file) => file,
        Err(err) => {
            buffer.release();
            channel.close();
            return Err(setup_failure(err.into()));
        }
    };

    info!(
        path = %local_path.display(),
        capacity = config.capacity,
        "session started"
    );
    let result = {
        let mut session = Session::new(&mut buffer, &mut channel);
        match role {
            Role::Sender => session.send(file),
            Role::Receiver => session.receive(file),
        }
    };

    buffer.release();
    channel.close();

    match &result {
        Ok(report) => info!(
            bytes = report.bytes_transferred,
            chunks = report.chunks,
            "session finished"
        ),
        Err(failure) => warn!(
            kind = %failure.kind(),
            bytes = failure.report.bytes_transferred,
            error = %failure.error,
            "session failed"
        ),
    }
    result
}

fn open_local(role: Role, path: &Path) -> Result<File, LocalIoError> {
    let opened = match role {
        Role::Sender => File::open(path),
        Role::Receiver => File::create(path),
    };
    opened.map_err(|source| LocalIoError::Open {
        path: path.to_path_buf(),
        source,
    })
}
