//! Buffered line I/O for the control channel.
//!
//! Works over any async byte stream: child pipes on the manager side, stdio in
//! the worker, and in-memory duplex streams in tests.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::sync::mpsc;

use super::protocol::ControlMessage;
use crate::error::Result;

/// Default buffer size for the control channel (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Reads control messages, one JSON document per line.
pub struct LineReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, reader).lines(),
        }
    }

    /// Read a raw line without its terminator. Returns `None` on EOF.
    ///
    /// Cancel safe: a partially read line is kept for the next call.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let line = self.lines.next_line().await?;
        Ok(line.map(|mut l| {
            if l.ends_with('\r') {
                l.pop();
            }
            l
        }))
    }

    /// Read the next message, skipping blank lines. Returns `None` on EOF.
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>> {
        loop {
            match self.read_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(ControlMessage::from_line(&line)?)),
            }
        }
    }
}

/// Writes control messages, flushing after each one.
pub struct LineWriter<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, writer),
        }
    }

    /// Write a line (newline appended if missing) and flush.
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await
    }

    /// Serialize and send a message.
    pub async fn send(&mut self, message: &ControlMessage) -> Result<()> {
        self.write_line(&message.to_line()?).await?;
        Ok(())
    }
}

/// Drain `outbox` into `writer` until every sender is gone or the pipe breaks.
pub(crate) async fn forward_outbox<W: AsyncWrite + Unpin>(
    mut writer: LineWriter<W>,
    mut outbox: mpsc::UnboundedReceiver<ControlMessage>,
) {
    while let Some(message) = outbox.recv().await {
        if let Err(e) = writer.send(&message).await {
            tracing::debug!(error = %e, kind = message.kind(), "Control channel closed");
            break;
        }
    }
}
