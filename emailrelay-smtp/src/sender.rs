//! The write side of a connection, as seen by the protocol state machines.

use std::io;

use emailrelay_common::outgoing;

/// Something that can take bytes destined for the peer.
///
/// `send` never blocks: it returns how many bytes were taken, and zero means
/// the peer cannot accept more right now.
pub trait Sender {
    /// # Errors
    /// The connection is broken.
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize>;
}

impl<T: Sender + ?Sized> Sender for Box<T> {
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).send(bytes)
    }
}

/// A [`Sender`] plus whatever it has not yet accepted.
///
/// Once anything is held back, later lines queue behind it so the byte order on
/// the wire is preserved. [`Outbox::flush`] retries when the reactor says the
/// connection is writable again.
#[derive(Debug)]
pub struct Outbox<S> {
    sender: S,
    pending: Vec<u8>,
}

impl<S: Sender> Outbox<S> {
    pub const fn new(sender: S) -> Self {
        Self {
            sender,
            pending: Vec::new(),
        }
    }

    /// Send one line, appending CRLF.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn send_line(&mut self, line: &[u8]) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.pending.extend_from_slice(line);
            self.pending.extend_from_slice(b"\r\n");
            return Ok(());
        }

        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line);
        bytes.extend_from_slice(b"\r\n");

        let accepted = self.sender.send(&bytes)?;
        if accepted < bytes.len() {
            self.pending.extend_from_slice(&bytes[accepted..]);
        }

        Ok(())
    }

    /// Send a protocol line and log it.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        outgoing!("{text}");
        self.send_line(text.as_bytes())
    }

    /// Offer held-back bytes again; returns `true` once nothing is pending.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.pending.is_empty() {
            let accepted = self.sender.send(&self.pending)?;
            if accepted == 0 {
                return Ok(false);
            }
            self.pending.drain(..accepted);
        }

        Ok(true)
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        !self.pending.is_empty()
    }

    pub const fn sender(&self) -> &S {
        &self.sender
    }

    pub const fn sender_mut(&mut self) -> &mut S {
        &mut self.sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `window` bytes per call.
    #[derive(Default)]
    struct Trickle {
        window: usize,
        wire: Vec<u8>,
    }

    impl Sender for Trickle {
        fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
            let accepted = bytes.len().min(self.window);
            self.wire.extend_from_slice(&bytes[..accepted]);
            Ok(accepted)
        }
    }

    #[test]
    fn test_unblocked_lines_go_straight_out() {
        let mut outbox = Outbox::new(Trickle {
            window: usize::MAX,
            ..Trickle::default()
        });

        outbox.send_line(b"250 OK").unwrap();
        assert!(!outbox.is_blocked());
        assert_eq!(outbox.sender().wire, b"250 OK\r\n");
    }

    #[test]
    fn test_blocked_lines_keep_their_order() {
        let mut outbox = Outbox::new(Trickle {
            window: 3,
            ..Trickle::default()
        });

        outbox.send_line(b"250-first").unwrap();
        outbox.send_line(b"250 second").unwrap();
        assert!(outbox.is_blocked());
        assert_eq!(outbox.sender().wire, b"250");

        outbox.sender_mut().window = 0;
        assert!(!outbox.flush().unwrap());

        outbox.sender_mut().window = 4;
        assert!(outbox.flush().unwrap());
        assert_eq!(outbox.sender().wire, b"250-first\r\n250 second\r\n");
    }
}
