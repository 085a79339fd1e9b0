//! Command-line front end for relay sessions.
//!
//! `relay send` and `relay recv` run one session against the endpoint
//! listening in the socket directory. `relay peer` plays that endpoint for
//! local testing, reaching relay buffers through the shared-memory allocator.

use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use relay_buffer::{
    Allocator, ShmAllocator, ShmMemory, DEFAULT_CAPACITY, DEFAULT_DEVICE_PATH, DEFAULT_SHM_DIR,
};
use relay_fabric::unix::{listen, UnixConnector, UnixTransport};
use relay_fabric::{
    run, PeerRole, RemotePeer, Role, SessionConfig, SessionFailure, TransferReport, WaitTimeout,
};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay files through a shared physical buffer", long_about = None)]
struct Cli {
    #[command(flatten)]
    backend: Backend,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Backend {
    /// Where relay buffers come from.
    #[arg(long, value_enum, default_value_t = AllocatorKind::Shm, global = true)]
    allocator: AllocatorKind,

    /// Allocator device node used by `--allocator device`.
    #[arg(long, default_value = DEFAULT_DEVICE_PATH, global = true)]
    device: PathBuf,

    /// Directory holding shared-memory segments for `--allocator shm`.
    #[arg(long, default_value = DEFAULT_SHM_DIR, global = true)]
    shm_dir: PathBuf,

    /// Directory holding endpoint sockets (defaults to $XDG_RUNTIME_DIR, then /tmp).
    #[arg(long, global = true)]
    socket_dir: Option<PathBuf>,

    /// Relay buffer size in bytes, decimal or 0x-prefixed hex.
    #[arg(long, value_parser = parse_capacity, default_value_t = DEFAULT_CAPACITY, global = true)]
    capacity: usize,

    /// Give up on a silent remote after this many milliseconds (waits forever if absent).
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct Target {
    /// Remote endpoint id.
    #[arg(long)]
    endpoint: u32,

    /// Logical port on the endpoint.
    #[arg(long, default_value_t = 0)]
    port: u32,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a local file to the remote endpoint.
    Send {
        #[command(flatten)]
        target: Target,
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Stream remote data into a local file, replacing its contents.
    Recv {
        #[command(flatten)]
        target: Target,
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Act as the remote endpoint for one session.
    Peer {
        #[command(flatten)]
        target: Target,
        /// File served to a connecting receiver.
        #[arg(long, value_name = "FILE")]
        source: Option<PathBuf>,
        /// File filled by a connecting sender.
        #[arg(long, value_name = "FILE")]
        sink: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum AllocatorKind {
    /// Kernel allocator device (`--device`).
    Device,
    /// File-backed shared memory (`--shm-dir`).
    Shm,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<SessionFailure>() {
                Some(failure) => eprintln!("{}: {err:#}", failure.kind()),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> Result<()> {
    let Cli { backend, command } = cli;
    let socket_dir = backend
        .socket_dir
        .clone()
        .unwrap_or_else(default_socket_dir);

    match command {
        Command::Send { target, file } => {
            let report = transfer(&backend, &socket_dir, &target, Role::Sender, &file)?;
            println!(
                "sent {} bytes in {} chunks",
                report.bytes_transferred, report.chunks
            );
        }
        Command::Recv { target, file } => {
            let report = transfer(&backend, &socket_dir, &target, Role::Receiver, &file)?;
            println!(
                "received {} bytes in {} chunks",
                report.bytes_transferred, report.chunks
            );
        }
        Command::Peer {
            target,
            source,
            sink,
        } => serve_peer(&backend, &socket_dir, &target, source, sink)?,
    }
    Ok(())
}

fn transfer(
    backend: &Backend,
    socket_dir: &Path,
    target: &Target,
    role: Role,
    file: &Path,
) -> Result<TransferReport> {
    let config = SessionConfig {
        endpoint: target.endpoint,
        port: target.port,
        capacity: backend.capacity,
        wait_timeout: WaitTimeout::from_millis(backend.timeout_ms),
    };
    let allocator = build_allocator(backend)?;
    let connector = UnixConnector::new(socket_dir);
    info!(allocator = %allocator.describe(), socket_dir = %socket_dir.display(), "starting {role}");

    let report = run(&config, role, file, allocator.as_ref(), &connector)
        .with_context(|| format!("{role} session for {file:?} failed"))?;
    Ok(report)
}

fn serve_peer(
    backend: &Backend,
    socket_dir: &Path,
    target: &Target,
    source: Option<PathBuf>,
    sink: Option<PathBuf>,
) -> Result<()> {
    if backend.allocator != AllocatorKind::Shm {
        bail!("peer emulation reaches relay buffers through --allocator shm only");
    }
    if source.is_none() && sink.is_none() {
        bail!("peer needs --source, --sink or both");
    }

    let reader = source
        .as_deref()
        .map(|path| File::open(path).with_context(|| format!("failed to open {path:?}")))
        .transpose()?;
    let writer = sink
        .as_deref()
        .map(|path| File::create(path).with_context(|| format!("failed to create {path:?}")))
        .transpose()?;

    let listener = listen(socket_dir, target.endpoint)
        .with_context(|| format!("failed to listen in {socket_dir:?}"))?;
    info!(
        endpoint = target.endpoint,
        port = target.port,
        socket_dir = %socket_dir.display(),
        "peer waiting for a session"
    );
    let (stream, _) = listener.accept().context("failed to accept session")?;

    let transport = UnixTransport::new(stream, target.port);
    let mut peer = RemotePeer::new(
        Box::new(transport),
        ShmMemory::new(&backend.shm_dir),
        backend.capacity,
    )
    .with_timeout(WaitTimeout::from_millis(backend.timeout_ms));
    let (role, report) = peer
        .serve(reader, writer)
        .context("peer session failed")?;

    let verb = match role {
        PeerRole::Sink => "sank",
        PeerRole::Source => "sourced",
    };
    println!("peer {verb} {} bytes in {} chunks", report.bytes, report.chunks);
    Ok(())
}

fn build_allocator(backend: &Backend) -> Result<Box<dyn Allocator>> {
    match backend.allocator {
        AllocatorKind::Shm => Ok(Box::new(ShmAllocator::new(&backend.shm_dir))),
        #[cfg(target_os = "linux")]
        AllocatorKind::Device => Ok(Box::new(relay_buffer::DeviceAllocator::new(
            &backend.device,
        ))),
        #[cfg(not(target_os = "linux"))]
        AllocatorKind::Device => bail!("the allocator device is only available on Linux"),
    }
}

fn default_socket_dir() -> PathBuf {
    env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn parse_capacity(input: &str) -> Result<usize, String> {
    let parsed = if let Some(stripped) = input.strip_prefix("0x") {
        usize::from_str_radix(stripped, 16).map_err(|_| format!("invalid hex value '{input}'"))
    } else {
        input
            .parse::<usize>()
            .map_err(|_| format!("invalid number '{input}'"))
    }?;
    if parsed == 0 {
        return Err("capacity must be at least one byte".to_string());
    }
    Ok(parsed)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Ignore error if already set (e.g., during tests).
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
