//! Serial link to the seat module
//!
//! Protocol (line-oriented ASCII, `\n` terminated, `\r` tolerated):
//! - Inbound: seat tokens, `SEATED` / `EMPTY` by default; anything else is ignored
//! - Outbound: vibration commands, `SLOUCH_ALERT` / `VIB_OFF` by default
//!
//! The port is split into a reader task and a writer task. The control loop
//! talks to them through bounded channels, so `poll` and `send` never block.

use crate::domain::error::LinkError;
use crate::domain::types::{PeerCommand, SeatToken};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use anyhow::Context;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

/// Longest line accepted before the buffer is treated as garbage
const MAX_LINE_LEN: usize = 128;
const TOKEN_QUEUE_SIZE: usize = 32;
const COMMAND_QUEUE_SIZE: usize = 16;
/// Back-off after a read error before touching the port again
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Non-blocking seat-module link as seen by the control loop
pub trait PeerLink: Send {
    /// Next valid seat token, if one is buffered
    fn poll(&mut self) -> Option<SeatToken>;
    /// Queue a command for the seat module (best-effort)
    fn send(&mut self, command: PeerCommand) -> Result<(), LinkError>;
    /// Release the link; commands already queued are still delivered
    fn close(&mut self) {}
}

/// Token literals agreed with the seat module firmware
#[derive(Debug, Clone)]
pub struct PeerProtocol {
    seated: String,
    empty: String,
    vibrate: String,
    stop: String,
}

impl PeerProtocol {
    pub fn from_config(config: &Config) -> Self {
        Self {
            seated: config.seated_token().to_string(),
            empty: config.empty_token().to_string(),
            vibrate: config.vibrate_token().to_string(),
            stop: config.stop_token().to_string(),
        }
    }

    /// Map one received line to a seat token
    pub fn parse(&self, line: &str) -> Option<SeatToken> {
        let line = line.trim();
        if line == self.seated {
            Some(SeatToken::Seated)
        } else if line == self.empty {
            Some(SeatToken::Empty)
        } else {
            None
        }
    }

    /// Wire form of a command, newline terminated
    pub fn encode(&self, command: PeerCommand) -> String {
        let token = match command {
            PeerCommand::Vibrate => &self.vibrate,
            PeerCommand::StopVibrate => &self.stop,
        };
        format!("{}\n", token)
    }
}

impl Default for PeerProtocol {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Accumulates serial bytes across reads and yields complete lines.
/// Lines can arrive split over several reads, so partial data is kept.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_len: usize,
}

impl LineBuffer {
    pub fn new(max_len: usize) -> Self {
        Self { buf: Vec::with_capacity(max_len), max_len }
    }

    /// Append bytes and drain every complete line
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }

        if self.buf.len() > self.max_len {
            debug!(discarded = self.buf.len(), "peer_line_overflow");
            self.buf.clear();
        }

        lines
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Control-loop side of the serial link
pub struct SerialPeerLink {
    token_rx: mpsc::Receiver<SeatToken>,
    cmd_tx: Option<mpsc::Sender<PeerCommand>>,
}

impl PeerLink for SerialPeerLink {
    fn poll(&mut self) -> Option<SeatToken> {
        match self.token_rx.try_recv() {
            Ok(token) => Some(token),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn send(&mut self, command: PeerCommand) -> Result<(), LinkError> {
        let Some(ref tx) = self.cmd_tx else {
            return Err(LinkError::Closed);
        };
        tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::Unavailable("command queue full".to_string()),
            TrySendError::Closed(_) => LinkError::Closed,
        })
    }

    fn close(&mut self) {
        if self.cmd_tx.take().is_some() {
            info!("peer_link_closed");
        }
        self.token_rx.close();
    }
}

/// Background tasks owning the two halves of the port
pub struct PeerLinkTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerLinkTasks {
    /// Wait for the writer to drain and the reader to stop.
    /// The writer finishes once the link is closed; the reader on shutdown.
    pub async fn join(self) {
        if let Err(e) = self.writer.await {
            warn!(error = %e, "peer_writer_join_failed");
        }
        if let Err(e) = self.reader.await {
            warn!(error = %e, "peer_reader_join_failed");
        }
    }
}

/// Open the configured serial device and start the link tasks
pub fn open_serial_link(
    config: &Config,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(SerialPeerLink, PeerLinkTasks)> {
    let port = tokio_serial::new(config.serial_device(), config.serial_baud())
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .with_context(|| format!("Failed to open serial device {}", config.serial_device()))?;

    info!(device = %config.serial_device(), baud = %config.serial_baud(), "peer_port_opened");

    let (reader, writer) = tokio::io::split(port);
    Ok(spawn_link(reader, writer, PeerProtocol::from_config(config), metrics, shutdown))
}

/// Start reader/writer tasks over any byte stream halves
pub fn spawn_link<R, W>(
    reader: R,
    writer: W,
    protocol: PeerProtocol,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> (SerialPeerLink, PeerLinkTasks)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let protocol = Arc::new(protocol);
    let (token_tx, token_rx) = mpsc::channel(TOKEN_QUEUE_SIZE);
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);

    let reader =
        tokio::spawn(read_loop(reader, protocol.clone(), token_tx, metrics.clone(), shutdown));
    let writer = tokio::spawn(write_loop(writer, protocol, cmd_rx, metrics));

    (SerialPeerLink { token_rx, cmd_tx: Some(cmd_tx) }, PeerLinkTasks { reader, writer })
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    protocol: Arc<PeerProtocol>,
    token_tx: mpsc::Sender<SeatToken>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = LineBuffer::new(MAX_LINE_LEN);
    let mut chunk = [0u8; 64];

    info!("peer_reader_started");

    loop {
        let n = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("peer_reader_shutdown");
                    return;
                }
                continue;
            }
            result = reader.read(&mut chunk) => {
                match result {
                    Ok(0) => {
                        info!("peer_reader_eof");
                        return;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                    Err(e) => {
                        warn!(error = %e, "peer_link_read_error");
                        tokio::time::sleep(READ_ERROR_BACKOFF).await;
                        continue;
                    }
                }
            }
        };

        for line in lines.push(&chunk[..n]) {
            let Some(token) = protocol.parse(&line) else {
                debug!(line = %line, "peer_token_ignored");
                metrics.record_ignored_token();
                continue;
            };

            match token_tx.try_send(token) {
                Ok(()) => tracing::trace!(token = token.as_str(), "peer_token"),
                Err(TrySendError::Full(_)) => {
                    warn!(token = token.as_str(), "peer_token_dropped_queue_full");
                    metrics.record_token_dropped();
                }
                Err(TrySendError::Closed(_)) => {
                    info!("peer_reader_link_closed");
                    return;
                }
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    protocol: Arc<PeerProtocol>,
    mut cmd_rx: mpsc::Receiver<PeerCommand>,
    metrics: Arc<Metrics>,
) {
    while let Some(command) = cmd_rx.recv().await {
        let line = protocol.encode(command);
        let result = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => debug!(command = command.as_str(), "peer_command_written"),
            Err(e) => {
                warn!(command = command.as_str(), error = %e, "peer_link_write_error");
                metrics.record_peer_error();
            }
        }
    }

    info!("peer_writer_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens() {
        let protocol = PeerProtocol::default();
        assert_eq!(protocol.parse("SEATED"), Some(SeatToken::Seated));
        assert_eq!(protocol.parse("EMPTY\r"), Some(SeatToken::Empty));
        assert_eq!(protocol.parse("  SEATED  "), Some(SeatToken::Seated));
        assert_eq!(protocol.parse("SEAT:1"), None);
        assert_eq!(protocol.parse("seated"), None);
        assert_eq!(protocol.parse(""), None);
    }

    #[test]
    fn test_encode_commands() {
        let protocol = PeerProtocol::default();
        assert_eq!(protocol.encode(PeerCommand::Vibrate), "SLOUCH_ALERT\n");
        assert_eq!(protocol.encode(PeerCommand::StopVibrate), "VIB_OFF\n");
    }

    #[test]
    fn test_line_buffer_handles_split_lines() {
        let mut buffer = LineBuffer::new(MAX_LINE_LEN);

        assert!(buffer.push(b"SEA").is_empty());
        assert_eq!(buffer.pending(), 3);
        assert_eq!(buffer.push(b"TED\r\nEMPTY\nSEAT"), vec!["SEATED", "EMPTY"]);
        assert_eq!(buffer.pending(), 4);
        assert_eq!(buffer.push(b"ED\n"), vec!["SEATED"]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_line_buffer_skips_blank_lines() {
        let mut buffer = LineBuffer::new(MAX_LINE_LEN);
        assert_eq!(buffer.push(b"\n\r\n  \nEMPTY\n"), vec!["EMPTY"]);
    }

    #[test]
    fn test_line_buffer_discards_overflow() {
        let mut buffer = LineBuffer::new(8);
        assert!(buffer.push(b"0123456789").is_empty());
        assert_eq!(buffer.pending(), 0);
        assert_eq!(buffer.push(b"EMPTY\n"), vec!["EMPTY"]);
    }

    async fn poll_tokens(link: &mut SerialPeerLink, count: usize) -> Vec<SeatToken> {
        let mut tokens = Vec::new();
        for _ in 0..100 {
            while let Some(token) = link.poll() {
                tokens.push(token);
            }
            if tokens.len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokens
    }

    #[tokio::test]
    async fn test_reader_delivers_valid_tokens_only() {
        let (ours, mut theirs) = tokio::io::duplex(256);
        let (reader, writer) = tokio::io::split(ours);
        let metrics = Arc::new(Metrics::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let (mut link, _tasks) =
            spawn_link(reader, writer, PeerProtocol::default(), metrics.clone(), shutdown_rx);

        assert_eq!(link.poll(), None);

        theirs.write_all(b"SEATED\r\nNOISE\nEMP").await.unwrap();
        theirs.write_all(b"TY\n").await.unwrap();

        let tokens = poll_tokens(&mut link, 2).await;
        assert_eq!(tokens, vec![SeatToken::Seated, SeatToken::Empty]);
        assert_eq!(metrics.report().ignored_tokens_total, 1);
    }

    #[tokio::test]
    async fn test_close_drains_pending_commands() {
        let (ours, mut theirs) = tokio::io::duplex(256);
        let (reader, writer) = tokio::io::split(ours);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (mut link, tasks) = spawn_link(
            reader,
            writer,
            PeerProtocol::default(),
            Arc::new(Metrics::new()),
            shutdown_rx,
        );

        link.send(PeerCommand::Vibrate).unwrap();
        link.send(PeerCommand::StopVibrate).unwrap();
        link.close();
        assert!(matches!(link.send(PeerCommand::Vibrate), Err(LinkError::Closed)));

        shutdown_tx.send(true).unwrap();
        tasks.join().await;

        let mut received = String::new();
        let mut buf = [0u8; 64];
        while !received.ends_with("VIB_OFF\n") {
            let n = theirs.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        assert_eq!(received, "SLOUCH_ALERT\nVIB_OFF\n");
    }
}
