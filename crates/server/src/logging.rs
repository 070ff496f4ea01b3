//! Tracing subscriber setup for both process roles
//!
//! The supervisor logs to stdout. The worker's stdout carries the command
//! channel, so its formatted lines are sent as `LogLine` commands instead and
//! re-emitted by the supervisor under the `worker` target.

use std::io;

use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;
use warden_config::{Config, LogFormat, LoggingConfig};
use warden_protocol::Command;

/// Target used by the supervisor when re-emitting worker lines
pub const WORKER_TARGET: &str = "worker";

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the supervisor's subscriber.
pub fn init(config: &LoggingConfig) {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config));
    let result = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Install the worker's subscriber, writing lines into `outbound`.
pub fn init_worker(config: &LoggingConfig, outbound: mpsc::Sender<Command>) {
    let writer = ChannelWriter::new(outbound);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(writer)
        .with_ansi(false)
        .without_time();
    let result = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Log what loading the configuration adjusted. Call once a subscriber is
/// installed; loading happens before either role can set one up.
pub fn report_notices(config: &Config) {
    for notice in config.notices() {
        warn!("{}", notice);
    }
}

/// [`MakeWriter`] that turns formatted output into `LogLine` commands.
///
/// Lines are dropped when the channel is full or closed; logging never
/// blocks the worker.
#[derive(Clone)]
pub struct ChannelWriter {
    outbound: mpsc::Sender<Command>,
}

impl ChannelWriter {
    pub fn new(outbound: mpsc::Sender<Command>) -> Self {
        Self { outbound }
    }
}

impl<'a> MakeWriter<'a> for ChannelWriter {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter {
            outbound: self.outbound.clone(),
            buffer: Vec::new(),
        }
    }
}

/// Buffers one event and sends it line by line when dropped.
pub struct LineWriter {
    outbound: mpsc::Sender<Command>,
    buffer: Vec<u8>,
}

impl LineWriter {
    fn send_lines(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.buffer);
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let _ = self.outbound.try_send(Command::log_line(line));
        }
        self.buffer.clear();
    }
}

impl io::Write for LineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_lines();
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        self.send_lines();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use warden_protocol::CommandKind;

    #[test]
    fn test_lines_become_log_commands() {
        let (tx, mut rx) = mpsc::channel(8);
        let writer = ChannelWriter::new(tx);

        {
            let mut w = writer.make_writer();
            w.write_all(b" INFO worker: bound\n").unwrap();
            w.write_all(b"second line\n\n").unwrap();
        }

        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind(), CommandKind::LogLine);
        assert_eq!(first.name(), " INFO worker: bound");
        assert_eq!(rx.try_recv().unwrap().name(), "second line");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_channel_drops_lines() {
        let (tx, mut rx) = mpsc::channel(1);
        let writer = ChannelWriter::new(tx);

        writer.make_writer().write_all(b"one\ntwo\n").unwrap();

        assert_eq!(rx.try_recv().unwrap().name(), "one");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_config_notices_reach_the_channel() {
        let config = Config::from_kdl("certificates { refresh-threshold-secs 10 }").unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let subscriber = tracing_subscriber::fmt()
            .with_writer(ChannelWriter::new(tx))
            .with_ansi(false)
            .without_time()
            .finish();

        tracing::subscriber::with_default(subscriber, || report_notices(&config));

        let line = rx.try_recv().unwrap();
        assert!(line.name().contains("WARN"), "{}", line.name());
        assert!(line.name().contains("refresh-threshold-secs 10"), "{}", line.name());
        assert!(rx.try_recv().is_err());
    }
}
