//! Worker process
//!
//! Startup order:
//!
//! 1. Load the static file cache while the whole filesystem is visible
//! 2. Bind both listeners
//! 3. Drop privileges
//! 4. Point file lookups at the web root as seen from inside the jail
//! 5. Build the async runtime, release the listeners and start serving
//! 6. Resolve certificates for all whitelisted domains in the background
//!
//! Steps 1 to 4 run on the main thread before the runtime exists. The
//! capability bounding set and `no_new_privs` are per-thread attributes, so
//! every runtime thread inherits them only if they were set first.
//!
//! The worker's stdin and stdout carry the command channel to the supervisor.
//! Log lines are queued on it from the start and written once the pumps run.
//! A `Terminate` command, SIGTERM or SIGINT start a graceful shutdown. A
//! desynchronized channel ends the process with [`EXIT_PROTOCOL_DESYNC`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_config::{Config, ServerConfig};
use warden_protocol::pump::CHANNEL_CAPACITY;
use warden_protocol::{Command, CommandChannel, CommandKind, ProtocolError, DEFAULT_IDLE_TIMEOUT};

use crate::acme::{AcmeDelegate, ChallengeManager, InstantAcmeDelegate};
use crate::certs::{CertCache, CertificateResolver, RemoteCache, SelfSignedIssuer};
use crate::domain::DomainWhitelist;
use crate::http::StaticFiles;
use crate::jail::{Jail, PrivilegeDrop};
use crate::logging;
use crate::server::{BoundSockets, Handlers, Listeners, ServeHandle};
use crate::tls::TlsAcceptor;

/// Exit code after the command stream became unreadable
pub const EXIT_PROTOCOL_DESYNC: i32 = 2;

/// Everything the worker serves with
pub struct Worker {
    resolver: Arc<CertificateResolver>,
    files: Arc<StaticFiles>,
    handlers: Arc<Handlers>,
}

impl Worker {
    /// Build the worker's state on top of a certificate cache.
    pub fn new(config: &Config, cache: Arc<dyn CertCache>) -> Result<Self> {
        let whitelist = Arc::new(DomainWhitelist::from_config(&config.certificates));
        let challenges = ChallengeManager::new();

        let acme: Option<Arc<dyn AcmeDelegate>> = if config.certificates.acme_domains.is_empty() {
            None
        } else {
            Some(Arc::new(InstantAcmeDelegate::new(
                cache,
                challenges.clone(),
                Arc::clone(&whitelist),
                &config.certificates,
            )))
        };

        let issuer = SelfSignedIssuer::from_config(Arc::clone(&whitelist), &config.certificates);
        let resolver = Arc::new(CertificateResolver::new(
            Arc::clone(&whitelist),
            issuer,
            acme,
            config.certificates.refresh_threshold(),
        )
        .with_acme_timeout(config.certificates.acme_timeout()));
        let files = Arc::new(
            StaticFiles::from_config(config, whitelist).context("Failed to set up static files")?,
        );

        let handlers = Arc::new(Handlers {
            files: Arc::clone(&files),
            challenges,
            tls: TlsAcceptor::new(Arc::clone(&resolver)),
            request_timeout: config.server.request_timeout(),
            graceful_shutdown_timeout: config.server.graceful_shutdown_timeout(),
            log_requests: config.server.log_requests,
        });

        Ok(Self {
            resolver,
            files,
            handlers,
        })
    }

    pub fn resolver(&self) -> &Arc<CertificateResolver> {
        &self.resolver
    }

    pub fn files(&self) -> &Arc<StaticFiles> {
        &self.files
    }

    /// Fill the file cache, bind both listeners and drop privileges.
    ///
    /// Needs no runtime. The worker calls this before building one so the
    /// privilege drop covers every thread the process will ever have.
    pub fn prepare(&self, config: &ServerConfig, jail: &dyn PrivilegeDrop) -> Result<BoundSockets> {
        let root = self.files.root();
        let web_root: PathBuf = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

        if let Err(e) = self.files.fill_cache() {
            warn!(root = %web_root.display(), error = %e, "Failed to fill static file cache");
        }

        let sockets = BoundSockets::bind(config)?;

        let outcome = jail.drop_privileges().context("Failed to drop privileges")?;
        self.files.rebase(outcome.rebase(&web_root));

        Ok(sockets)
    }

    /// Start serving on prepared sockets and warm the certificate cache.
    /// Must be called from inside the runtime.
    pub fn serve(&self, sockets: BoundSockets) -> Result<ServeHandle> {
        let handle = Listeners::new(sockets, Arc::clone(&self.handlers))?.release();

        let resolver = Arc::clone(&self.resolver);
        tokio::spawn(async move { resolver.warm().await });

        Ok(handle)
    }
}

/// Route commands from the supervisor: Get replies go to the cache proxy,
/// `Terminate` cancels `shutdown`.
pub async fn route_commands(
    mut inbound: mpsc::Receiver<Command>,
    replies: mpsc::Sender<Command>,
    shutdown: CancellationToken,
) {
    while let Some(command) = inbound.recv().await {
        match command.kind() {
            CommandKind::Get => {
                if replies.send(command).await.is_err() {
                    debug!("Cache proxy dropped, discarding reply");
                }
            }
            CommandKind::Terminate => {
                info!("Terminate requested by supervisor");
                shutdown.cancel();
            }
            CommandKind::LogLine => debug!(line = command.name(), "Supervisor sent text"),
            kind => warn!(kind = %kind, name = command.name(), "Ignoring unexpected command"),
        }
    }
}

/// Exit code once the command channel from the supervisor stopped.
fn channel_exit_code(result: Result<Result<(), ProtocolError>, JoinError>) -> i32 {
    match result {
        Ok(Err(e)) if e.is_fatal() => {
            error!(error = %e, "Command channel desynchronized, exiting");
            EXIT_PROTOCOL_DESYNC
        }
        Ok(Err(_)) | Err(_) => {
            warn!("Command channel failed, shutting down");
            1
        }
        Ok(Ok(())) => {
            warn!("Supervisor closed the command channel, shutting down");
            0
        }
    }
}

/// Worker entry point. Returns the process exit code.
pub fn run(config: Config) -> Result<i32> {
    let (outbound, queued) = mpsc::channel(CHANNEL_CAPACITY);
    logging::init_worker(&config.logging, outbound.clone());
    logging::report_notices(&config);

    let (reply_tx, reply_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cache = Arc::new(RemoteCache::new(
        outbound.clone(),
        reply_rx,
        config.certificates.channel_timeout(),
    ));
    let jail = Jail::new(config.jail.clone(), config.files.web_root.clone());
    let prepared = Worker::new(&config, cache)
        .and_then(|worker| Ok((worker.prepare(&config.server, &jail)?, worker)));
    let (sockets, worker) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            flush_to_stderr(queued);
            return Err(e);
        }
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let result = runtime.block_on(serve(worker, sockets, (outbound, queued), reply_tx));
    // The stdin reader may still be blocked on a read
    runtime.shutdown_background();
    result
}

/// Startup failed before the pumps ran. Queued log lines go to stderr so
/// the reason is not lost with them.
fn flush_to_stderr(mut queued: mpsc::Receiver<Command>) {
    while let Ok(command) = queued.try_recv() {
        if command.kind() == CommandKind::LogLine {
            eprintln!("{}", command.name());
        }
    }
}

async fn serve(
    worker: Worker,
    sockets: BoundSockets,
    outbound: (mpsc::Sender<Command>, mpsc::Receiver<Command>),
    replies: mpsc::Sender<Command>,
) -> Result<i32> {
    let (channel, pumps) = CommandChannel::spawn_with_outbound(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        outbound,
        DEFAULT_IDLE_TIMEOUT,
        "supervisor",
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(route_commands(channel.inbound, replies, shutdown.clone()));
    let mut channel_watch = tokio::spawn(pumps.join_inbound());

    let handle = worker.serve(sockets)?;

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let code = tokio::select! {
        _ = shutdown.cancelled() => 0,
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            0
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
            0
        }
        result = &mut channel_watch => {
            let code = channel_exit_code(result);
            if code == EXIT_PROTOCOL_DESYNC {
                return Ok(code);
            }
            code
        }
    };

    info!("Shutting down");
    handle.shutdown().await;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{duplex, split, AsyncWriteExt};

    #[tokio::test]
    async fn test_route_commands() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (reply_tx, mut reply_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let router = tokio::spawn(route_commands(in_rx, reply_tx, shutdown.clone()));

        in_tx
            .send(Command::get_reply("example.com", Bytes::from_static(b"pem")))
            .await
            .unwrap();
        in_tx.send(Command::put("ignored", Bytes::from_static(b"x"))).await.unwrap();
        in_tx.send(Command::terminate()).await.unwrap();

        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply.name(), "example.com");
        shutdown.cancelled().await;

        drop(in_tx);
        router.await.unwrap();
        assert!(reply_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_exits_with_desync_code() {
        let (mut supervisor_end, worker_end) = duplex(4096);
        let (read, write) = split(worker_end);
        let (_channel, pumps) =
            CommandChannel::spawn(BufReader::new(read), write, DEFAULT_IDLE_TIMEOUT, "supervisor");

        supervisor_end.write_all(b"[get]\nexample.com\nabc\n").await.unwrap();

        let watch = tokio::spawn(pumps.join_inbound());
        assert_eq!(channel_exit_code(watch.await), EXIT_PROTOCOL_DESYNC);
    }

    #[tokio::test]
    async fn test_closed_channel_exits_cleanly() {
        let (supervisor_end, worker_end) = duplex(64);
        let (read, write) = split(worker_end);
        let (_channel, pumps) =
            CommandChannel::spawn(BufReader::new(read), write, DEFAULT_IDLE_TIMEOUT, "supervisor");
        drop(supervisor_end);

        let watch = tokio::spawn(pumps.join_inbound());
        assert_eq!(channel_exit_code(watch.await), 0);
    }
}
