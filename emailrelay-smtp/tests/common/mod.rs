#![allow(dead_code, clippy::unwrap_used)]

use std::{
    io,
    path::Path,
    sync::{Arc, Mutex},
};

use emailrelay_smtp::Sender;
use emailrelay_spool::{Envelope, MessageId, MessageStore};

/// Records everything sent; can be told to accept only so much per call.
#[derive(Debug, Clone, Default)]
pub struct MockSender {
    written: Arc<Mutex<Vec<u8>>>,
    window: Arc<Mutex<Option<usize>>>,
}

impl MockSender {
    /// Accept at most `window` bytes per call; zero blocks completely.
    pub fn throttle(&self, window: Option<usize>) {
        *self.window.lock().unwrap() = window;
    }

    /// Complete lines sent since the last call, without their CRLF.
    pub fn take_lines(&self) -> Vec<String> {
        let mut written = self.written.lock().unwrap();
        let Some(end) = written.windows(2).rposition(|pair| pair == b"\r\n") else {
            return Vec::new();
        };

        let complete: Vec<u8> = written.drain(..end + 2).collect();
        String::from_utf8_lossy(&complete)
            .split_terminator("\r\n")
            .map(str::to_string)
            .collect()
    }

    /// Reply codes of the lines sent since the last call, skipping
    /// continuation lines.
    pub fn take_codes(&self) -> Vec<u16> {
        self.take_lines()
            .iter()
            .filter(|line| line.as_bytes().get(3) != Some(&b'-'))
            .map(|line| line[..3].parse().unwrap())
            .collect()
    }
}

impl Sender for MockSender {
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let accepted = self
            .window
            .lock()
            .unwrap()
            .map_or(bytes.len(), |window| window.min(bytes.len()));
        self.written
            .lock()
            .unwrap()
            .extend_from_slice(&bytes[..accepted]);
        Ok(accepted)
    }
}

pub fn store() -> (tempfile::TempDir, MessageStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = MessageStore::open(dir.path()).unwrap();
    (dir, store)
}

/// Read a committed envelope straight from disk, without claiming it.
pub fn envelope(dir: &Path, id: MessageId) -> Envelope {
    let file = std::fs::File::open(dir.join(format!("{id}.envelope"))).unwrap();
    Envelope::read_from(io::BufReader::new(file)).unwrap()
}

pub fn content(dir: &Path, id: MessageId) -> Vec<u8> {
    std::fs::read(dir.join(format!("{id}.content"))).unwrap()
}
