//! Worker-side certificate cache
//!
//! The jailed worker cannot reach the certificate directory, so every cache
//! operation is sent to the supervisor as a [`Command`]. Lookups wait for the
//! reply carrying the same name; writes are fire-and-forget.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use warden_protocol::Command;

use super::{CacheError, CertCache};

/// [`CertCache`] that forwards to the supervisor over the command channel.
#[derive(Debug)]
pub struct RemoteCache {
    outbound: mpsc::Sender<Command>,
    /// Get replies routed here by the worker's inbound dispatcher. Held for
    /// the whole round trip, so at most one lookup is in flight.
    replies: Mutex<mpsc::Receiver<Command>>,
    timeout: Duration,
}

impl RemoteCache {
    pub fn new(
        outbound: mpsc::Sender<Command>,
        replies: mpsc::Receiver<Command>,
        timeout: Duration,
    ) -> Self {
        Self {
            outbound,
            replies: Mutex::new(replies),
            timeout,
        }
    }

    async fn enqueue(&self, command: Command) -> Result<(), CacheError> {
        self.outbound
            .send(command)
            .await
            .map_err(|_| CacheError::ChannelClosed)
    }
}

#[async_trait]
impl CertCache for RemoteCache {
    async fn get(&self, name: &str) -> Result<Bytes, CacheError> {
        let mut replies = self.replies.lock().await;

        // Replies to lookups that already timed out
        while let Ok(stale) = replies.try_recv() {
            debug!(name = %stale.name(), "Discarding stale cache reply");
        }

        let deadline = Instant::now() + self.timeout;
        let send = self.outbound.send(Command::get(name));
        match tokio::time::timeout_at(deadline, send).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(CacheError::ChannelClosed),
            Err(_) => {
                warn!(name = %name, "Timed out queueing cache lookup");
                return Err(CacheError::Timeout(self.timeout));
            }
        }

        loop {
            match tokio::time::timeout_at(deadline, replies.recv()).await {
                Err(_) => {
                    warn!(
                        name = %name,
                        timeout_secs = self.timeout.as_secs(),
                        "Timed out waiting for certificate store"
                    );
                    return Err(CacheError::Timeout(self.timeout));
                }
                Ok(None) => return Err(CacheError::ChannelClosed),
                Ok(Some(reply)) if reply.name() != name => {
                    debug!(expected = %name, got = %reply.name(), "Discarding mismatched cache reply");
                }
                Ok(Some(reply)) => {
                    let payload = reply.into_payload();
                    if payload.is_empty() {
                        trace!(name = %name, "Remote cache miss");
                        return Err(CacheError::CacheMiss);
                    }
                    trace!(name = %name, bytes = payload.len(), "Remote cache hit");
                    return Ok(payload);
                }
            }
        }
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<(), CacheError> {
        if data.is_empty() {
            return Err(CacheError::EmptyPayload(name.to_string()));
        }
        self.enqueue(Command::put(name, data)).await
    }

    async fn delete(&self, name: &str) -> Result<(), CacheError> {
        self.enqueue(Command::delete(name)).await
    }
}
