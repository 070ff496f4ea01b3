//! HTTP and HTTPS listeners
//!
//! Binding and serving are split so privileges can be dropped in between:
//!
//! 1. [`BoundSockets::bind`] binds both addresses with plain std sockets, so
//!    it works before any runtime exists. A failed bind surfaces before
//!    anything else happens.
//! 2. The caller drops privileges.
//! 3. [`Listeners::new`] registers the sockets with the runtime and parks
//!    one task per listener. [`Listeners::release`] starts the accept loops
//!    and hands back a [`ServeHandle`] for shutdown.
//!
//! Shutdown stops accepting, asks open connections to finish their current
//! request, and aborts whatever is left once the grace period runs out.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_config::ServerConfig;

use crate::acme::ChallengeManager;
use crate::http::{redirect, request_host, Body, StaticFiles};
use crate::tls::TlsAcceptor;

/// Which listener a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Request handlers and connection settings shared by both listeners
pub struct Handlers {
    pub files: Arc<StaticFiles>,
    pub challenges: ChallengeManager,
    pub tls: TlsAcceptor,
    pub request_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub log_requests: bool,
}

impl Handlers {
    async fn handle(&self, scheme: Scheme, peer: SocketAddr, req: Request<Incoming>) -> Response<Body> {
        let response = match scheme {
            Scheme::Http => redirect::handle(&req, &self.challenges),
            Scheme::Https => self.files.serve(&req).await,
        };

        if self.log_requests {
            info!(
                scheme = scheme.as_str(),
                peer = %peer,
                method = %req.method(),
                host = request_host(&req).unwrap_or("-"),
                path = %req.uri().path(),
                status = response.status().as_u16(),
                "Request"
            );
        }
        response
    }
}

/// Both listening sockets, bound without a runtime.
///
/// The worker binds these before it builds its runtime so privileges can be
/// dropped while the process still has a single thread.
#[derive(Debug)]
pub struct BoundSockets {
    http: std::net::TcpListener,
    https: std::net::TcpListener,
    http_addr: SocketAddr,
    https_addr: SocketAddr,
}

impl BoundSockets {
    /// Bind both addresses. Nothing is accepted until [`Listeners::release`].
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let (http, http_addr) = bind_socket(Scheme::Http, &config.http_address)?;
        let (https, https_addr) = bind_socket(Scheme::Https, &config.https_address)?;
        Ok(Self {
            http,
            https,
            http_addr,
            https_addr,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn https_addr(&self) -> SocketAddr {
        self.https_addr
    }
}

fn bind_socket(scheme: Scheme, address: &str) -> Result<(std::net::TcpListener, SocketAddr)> {
    let bind_err = || format!("Failed to bind {}", address);
    let listener = std::net::TcpListener::bind(address).with_context(bind_err)?;
    listener.set_nonblocking(true).with_context(bind_err)?;
    let local_addr = listener.local_addr().with_context(bind_err)?;
    info!(scheme = scheme.as_str(), address = %local_addr, "Listener bound");
    Ok((listener, local_addr))
}

/// Bound sockets whose accept loops wait for [`Listeners::release`].
pub struct Listeners {
    http_addr: SocketAddr,
    https_addr: SocketAddr,
    release: watch::Sender<bool>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl Listeners {
    /// Hand the sockets to the runtime. Must be called from inside one.
    pub fn new(sockets: BoundSockets, handlers: Arc<Handlers>) -> Result<Self> {
        let BoundSockets {
            http,
            https,
            http_addr,
            https_addr,
        } = sockets;
        let http = TcpListener::from_std(http)
            .with_context(|| format!("Failed to register listener {}", http_addr))?;
        let https = TcpListener::from_std(https)
            .with_context(|| format!("Failed to register listener {}", https_addr))?;

        let shutdown = CancellationToken::new();
        let (release, released) = watch::channel(false);
        let mut tasks = JoinSet::new();

        tasks.spawn(run_listener(
            Scheme::Http,
            http,
            released.clone(),
            Arc::clone(&handlers),
            shutdown.clone(),
        ));
        tasks.spawn(run_listener(
            Scheme::Https,
            https,
            released,
            handlers,
            shutdown.clone(),
        ));

        Ok(Self {
            http_addr,
            https_addr,
            release,
            shutdown,
            tasks,
        })
    }

    /// Bind both listeners from inside a runtime.
    pub fn bind(config: &ServerConfig, handlers: Arc<Handlers>) -> Result<Self> {
        Self::new(BoundSockets::bind(config)?, handlers)
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn https_addr(&self) -> SocketAddr {
        self.https_addr
    }

    /// Start accepting connections.
    pub fn release(self) -> ServeHandle {
        // Receivers only go away when their task already exited
        let _ = self.release.send(true);
        info!(http = %self.http_addr, https = %self.https_addr, "Serving");
        ServeHandle {
            http_addr: self.http_addr,
            https_addr: self.https_addr,
            _release: self.release,
            shutdown: self.shutdown,
            tasks: self.tasks,
        }
    }
}

/// Running listeners
pub struct ServeHandle {
    http_addr: SocketAddr,
    https_addr: SocketAddr,
    /// Kept so parked listeners never observe a closed release channel
    _release: watch::Sender<bool>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl ServeHandle {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn https_addr(&self) -> SocketAddr {
        self.https_addr
    }

    /// Token that stops the listeners when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for both listeners to stop.
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Listener task failed");
            }
        }
    }

    /// Stop accepting and drain connections within the grace period.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.wait().await;
    }
}

async fn run_listener(
    scheme: Scheme,
    listener: TcpListener,
    mut released: watch::Receiver<bool>,
    handlers: Arc<Handlers>,
    shutdown: CancellationToken,
) {
    tokio::select! {
        result = released.wait_for(|released| *released) => {
            if result.is_err() {
                debug!(scheme = scheme.as_str(), "Listener dropped before release");
                return;
            }
        }
        _ = shutdown.cancelled() => return,
    }

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handlers = Arc::clone(&handlers);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        match scheme {
                            Scheme::Http => serve_connection(scheme, stream, peer, handlers, shutdown).await,
                            Scheme::Https => {
                                let local_ip = stream.local_addr().ok().map(|addr| addr.ip());
                                let handshake = timeout(
                                    handlers.request_timeout,
                                    handlers.tls.accept(stream, local_ip),
                                );
                                match handshake.await {
                                    Ok(Ok(tls)) => serve_connection(scheme, tls, peer, handlers, shutdown).await,
                                    Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                                    Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!(scheme = scheme.as_str(), error = %e, "Accept failed"),
            },
        }
    }

    drop(listener);
    let open = connections.len();
    if open > 0 {
        info!(scheme = scheme.as_str(), connections = open, "Draining connections");
    }
    let drained = timeout(handlers.graceful_shutdown_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            scheme = scheme.as_str(),
            remaining = connections.len(),
            "Grace period elapsed, closing remaining connections"
        );
        connections.abort_all();
    }
    info!(scheme = scheme.as_str(), "Listener stopped");
}

async fn serve_connection<IO>(
    scheme: Scheme,
    io: IO,
    peer: SocketAddr,
    handlers: Arc<Handlers>,
    shutdown: CancellationToken,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request_timeout = handlers.request_timeout;
    let service = service_fn(move |req| {
        let handlers = Arc::clone(&handlers);
        async move { Ok::<_, Infallible>(handlers.handle(scheme, peer, req).await) }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(request_timeout)
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "Connection error");
    }
}
