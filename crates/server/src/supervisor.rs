//! Supervisor process
//!
//! The supervisor never serves traffic. It spawns the worker as a child of
//! the same binary (`--worker`), answers the worker's certificate cache
//! commands from the on-disk store, and re-emits the worker's log lines.
//! Its exit status is the worker's: the exit code, or 128 + signal number
//! when the worker was killed. A worker command stream that cannot be decoded
//! stops the worker and exits with [`EXIT_PROTOCOL_DESYNC`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::process::Command as ProcessCommand;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use warden_config::Config;
use warden_protocol::{Command, CommandChannel, CommandKind, ProtocolError, DEFAULT_IDLE_TIMEOUT};

use crate::certs::{CacheError, CertCache, DirCache};
use crate::logging::WORKER_TARGET;
use crate::worker::EXIT_PROTOCOL_DESYNC;

/// Flag that makes the binary run as the worker
pub const WORKER_FLAG: &str = "--worker";

/// Time allowed for trailing worker log lines after it exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Answers cache commands against a store.
#[derive(Clone)]
pub struct Supervisor {
    store: Arc<dyn CertCache>,
}

impl Supervisor {
    pub fn new(store: Arc<dyn CertCache>) -> Self {
        Self { store }
    }

    /// Answer commands until the inbound side closes.
    pub async fn serve(&self, mut inbound: mpsc::Receiver<Command>, outbound: mpsc::Sender<Command>) {
        while let Some(command) = inbound.recv().await {
            match command.kind() {
                CommandKind::Get => {
                    let reply = self.get(command.name()).await;
                    if outbound.send(reply).await.is_err() {
                        debug!("Worker channel closed while replying");
                        break;
                    }
                }
                CommandKind::Put => {
                    let name = command.name().to_string();
                    if let Err(e) = self.store.put(&name, command.into_payload()).await {
                        warn!(name = %name, error = %e, "Failed to store cache entry");
                    }
                }
                CommandKind::Delete => {
                    if let Err(e) = self.store.delete(command.name()).await {
                        warn!(name = command.name(), error = %e, "Failed to delete cache entry");
                    }
                }
                CommandKind::LogLine => {
                    info!(target: WORKER_TARGET, "{}", command.name());
                }
                CommandKind::Terminate => {
                    warn!("Ignoring terminate command from worker");
                }
            }
        }
        debug!("Worker command stream ended");
    }

    /// Reply to a Get; an empty payload means not found.
    async fn get(&self, name: &str) -> Command {
        match self.store.get(name).await {
            Ok(payload) => Command::get_reply(name, payload),
            Err(CacheError::CacheMiss) => {
                debug!(name, "Cache miss");
                Command::get_reply(name, bytes::Bytes::new())
            }
            Err(e) => {
                warn!(name, error = %e, "Failed to read cache entry");
                Command::get_reply(name, bytes::Bytes::new())
            }
        }
    }
}

/// Spawn the worker and supervise it until it exits.
///
/// Returns the process exit code to use.
pub async fn run(config: &Config, config_path: Option<&Path>) -> Result<i32> {
    let store = DirCache::new(&config.certificates.cache_directory).with_context(|| {
        format!(
            "Failed to open certificate store {}",
            config.certificates.cache_directory.display()
        )
    })?;
    let supervisor = Supervisor::new(Arc::new(store));

    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    let mut command = worker_command(&exe, config_path);
    let mut child = command.spawn().context("Failed to spawn worker")?;
    info!(pid = child.id().unwrap_or(0), "Worker started");

    let stdin = child.stdin.take().context("Worker stdin not captured")?;
    let stdout = child.stdout.take().context("Worker stdout not captured")?;
    let (channel, mut pumps) =
        CommandChannel::spawn(BufReader::new(stdout), stdin, DEFAULT_IDLE_TIMEOUT, "worker");
    let CommandChannel { outbound, inbound } = channel;

    let serve = {
        let outbound = outbound.clone();
        tokio::spawn(async move { supervisor.serve(inbound, outbound).await })
    };

    let outcome = supervise(child.wait(), &mut pumps.inbound, &outbound).await?;
    let status = match outcome {
        Supervision::Exited(status) => status,
        Supervision::Desync(e) => {
            error!(error = %e, "Worker command stream desynchronized, stopping worker");
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to kill worker");
            }
            if let Err(e) = child.wait().await {
                warn!(error = %e, "Failed to reap worker");
            }
            serve.abort();
            pumps.outbound.abort();
            return Ok(EXIT_PROTOCOL_DESYNC);
        }
    };

    // Worker stdout is closed now; let the last log lines through
    if timeout(DRAIN_TIMEOUT, serve).await.is_err() {
        debug!("Command stream still open after worker exit");
    }
    pumps.outbound.abort();

    let code = exit_code(status);
    if code == 0 {
        info!("Worker exited");
    } else {
        error!(code, "Worker exited with failure");
    }
    Ok(code)
}

/// Why supervision stopped
#[derive(Debug)]
pub enum Supervision {
    /// The worker process exited
    Exited(ExitStatus),
    /// The worker's command stream could not be decoded
    Desync(ProtocolError),
}

/// Wait for the worker to exit while forwarding SIGTERM/SIGINT as
/// `Terminate`. Returns early when the inbound pump hits a fatal framing
/// error; a cleanly closed stream keeps waiting for the exit.
pub async fn supervise<F>(
    child_exit: F,
    inbound: &mut JoinHandle<Result<(), ProtocolError>>,
    outbound: &mpsc::Sender<Command>,
) -> Result<Supervision>
where
    F: Future<Output = std::io::Result<ExitStatus>>,
{
    tokio::pin!(child_exit);
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut inbound_open = true;

    loop {
        tokio::select! {
            status = &mut child_exit => {
                return Ok(Supervision::Exited(status.context("Failed to wait for worker")?));
            }
            result = &mut *inbound, if inbound_open => {
                inbound_open = false;
                match result {
                    Ok(Err(e)) if e.is_fatal() => return Ok(Supervision::Desync(e)),
                    Ok(Err(e)) => warn!(error = %e, "Worker command stream failed"),
                    Ok(Ok(())) => debug!("Worker command stream closed"),
                    Err(e) => warn!(error = %e, "Inbound pump task failed"),
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, stopping worker");
                send_terminate(outbound).await;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, stopping worker");
                send_terminate(outbound).await;
            }
        }
    }
}

fn worker_command(exe: &Path, config_path: Option<&Path>) -> ProcessCommand {
    let mut command = ProcessCommand::new(exe);
    command.arg(WORKER_FLAG);
    if let Some(path) = config_path {
        let path: PathBuf = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        command.arg("--config").arg(path);
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    command
}

async fn send_terminate(outbound: &mpsc::Sender<Command>) {
    if outbound.send(Command::terminate()).await.is_err() {
        warn!("Worker channel closed, cannot send terminate");
    }
}

/// Exit code for a finished worker: its code, or 128 + signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}
