//! Channel pumps.
//!
//! Each end of the duplex pipe runs two tasks: an outbound encoder that
//! drains an mpsc queue onto the writer, and an inbound decoder that turns
//! frames from the reader into [`Command`]s on another mpsc queue.

use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{read_command, write_command};
use crate::{Command, ProtocolError};

/// Default idle interval after which the outbound pump reports a quiet peer.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue depth of both directions.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Drain `rx` onto `writer` until the queue is closed.
///
/// When nothing has been queued for `idle_timeout` the pump logs and keeps
/// waiting; a quiet channel is not an error.
pub async fn run_outbound<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Command>,
    idle_timeout: Duration,
    peer: &'static str,
) -> Result<(), ProtocolError> {
    loop {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(command)) => {
                trace!(peer, kind = %command.kind(), name = command.name(), "Writing command");
                if let Err(e) = write_command(&mut writer, &command).await {
                    error!(peer, error = %e, "Failed to write command");
                    return Err(e);
                }
            }
            Ok(None) => {
                debug!(peer, "Outbound queue closed");
                return Ok(());
            }
            Err(_) => {
                info!(
                    peer,
                    idle_secs = idle_timeout.as_secs(),
                    "Timeout waiting for command"
                );
            }
        }
    }
}

/// Decode frames from `reader` into `tx` until the stream ends.
///
/// Returns an error on the first framing failure; nothing after a bad frame
/// is delivered.
pub async fn run_inbound<R: AsyncBufRead + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<Command>,
    peer: &'static str,
) -> Result<(), ProtocolError> {
    loop {
        match read_command(&mut reader).await {
            Ok(Some(command)) => {
                if tx.send(command).await.is_err() {
                    debug!(peer, "Inbound consumer dropped");
                    return Ok(());
                }
            }
            Ok(None) => {
                debug!(peer, "Peer closed the command stream");
                return Ok(());
            }
            Err(e) => {
                error!(peer, error = %e, "Command stream desynchronized");
                return Err(e);
            }
        }
    }
}

/// Handles for the two pump tasks of one channel end.
pub struct PumpHandles {
    pub outbound: JoinHandle<Result<(), ProtocolError>>,
    pub inbound: JoinHandle<Result<(), ProtocolError>>,
}

/// One end of a command channel: a sender for outgoing commands and a
/// receiver for decoded incoming ones.
pub struct CommandChannel {
    pub outbound: mpsc::Sender<Command>,
    pub inbound: mpsc::Receiver<Command>,
}

impl CommandChannel {
    /// Spawn both pumps over the given halves of a duplex byte stream.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        idle_timeout: Duration,
        peer: &'static str,
    ) -> (Self, PumpHandles)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn_with_outbound(
            reader,
            writer,
            mpsc::channel(CHANNEL_CAPACITY),
            idle_timeout,
            peer,
        )
    }

    /// Like [`CommandChannel::spawn`], but drains an outbound queue created
    /// earlier. Commands queued before the pumps existed are written first,
    /// which lets a process log into the queue before it has a runtime.
    pub fn spawn_with_outbound<R, W>(
        reader: R,
        writer: W,
        (out_tx, out_rx): (mpsc::Sender<Command>, mpsc::Receiver<Command>),
        idle_timeout: Duration,
        peer: &'static str,
    ) -> (Self, PumpHandles)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let outbound = tokio::spawn(run_outbound(writer, out_rx, idle_timeout, peer));
        let inbound = tokio::spawn(run_inbound(reader, in_tx, peer));

        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            PumpHandles { outbound, inbound },
        )
    }
}

impl PumpHandles {
    /// Wait for the inbound pump, which ends when the peer goes away or the
    /// stream desynchronizes. The outbound pump is aborted afterwards.
    pub async fn join_inbound(self) -> Result<(), ProtocolError> {
        let result = match self.inbound.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Inbound pump task failed");
                Err(ProtocolError::ChannelClosed)
            }
        };
        self.outbound.abort();
        result
    }
}
