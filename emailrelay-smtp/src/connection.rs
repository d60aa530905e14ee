//! Socket plumbing shared by the server and client sessions.

use std::{io, sync::Arc};

use tokio::net::TcpStream;

use crate::sender::Sender;

/// [`Sender`] over a tokio socket, using non-blocking writes.
#[derive(Debug, Clone)]
pub struct SocketSender {
    stream: Arc<TcpStream>,
}

impl SocketSender {
    pub const fn new(stream: Arc<TcpStream>) -> Self {
        Self { stream }
    }
}

impl Sender for SocketSender {
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        match self.stream.try_write(bytes) {
            Ok(written) => Ok(written),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }
}

/// Longest command line accepted, without its terminator (RFC 5321 4.5.3.1.6).
pub const COMMAND_LINE_LIMIT: usize = 1000;

/// A line taken from a [`LineBuffer`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Line {
    pub bytes: Vec<u8>,
    /// The line went past the limit and the excess was dropped.
    pub truncated: bool,
}

impl Line {
    #[cfg(test)]
    fn whole(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            truncated: false,
        }
    }
}

/// Splits received bytes into lines.
///
/// Lines end at LF; a CR before it is dropped. An unterminated line is held
/// back, but never more than the limit given to [`LineBuffer::next_line`]:
/// anything past it is discarded and the line is marked truncated.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    /// Bytes already searched for LF.
    scanned: usize,
    truncated: bool,
}

impl LineBuffer {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the next complete line, capped at `limit` bytes (0 for no cap).
    pub fn next_line(&mut self, limit: usize) -> Option<Line> {
        let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n')
        else {
            if limit > 0 && self.buffer.len() > limit {
                self.buffer.truncate(limit);
                self.truncated = true;
            }
            self.scanned = self.buffer.len();
            return None;
        };

        let end = self.scanned + offset;
        let mut bytes: Vec<u8> = self.buffer.drain(..=end).collect();
        self.scanned = 0;

        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }

        let mut truncated = std::mem::take(&mut self.truncated);
        if limit > 0 && bytes.len() > limit {
            bytes.truncate(limit);
            truncated = true;
        }

        Some(Line { bytes, truncated })
    }

    /// Bytes received but not yet part of a complete line.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Wait for input and move it into `lines`; returns zero at end of stream.
pub(crate) async fn read_some(stream: &TcpStream, lines: &mut LineBuffer) -> io::Result<usize> {
    let mut chunk = [0u8; 4096];

    loop {
        stream.readable().await?;
        match stream.try_read(&mut chunk) {
            Ok(read) => {
                lines.extend(&chunk[..read]);
                return Ok(read);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }
    }
}
