use std::{
    fs::File,
    io::{self, BufRead, BufReader, Seek, SeekFrom},
};

use emailrelay_common::internal;

use crate::{Envelope, MessageId, MessageStore, Result};

/// A claimed message
///
/// Exactly one of [`StoredMessage::destroy`], [`StoredMessage::fail`] or
/// [`StoredMessage::unlock`] ends the claim. Dropping the message without
/// either returns it to the queue.
#[derive(Debug)]
pub struct StoredMessage {
    store: MessageStore,
    id: MessageId,
    envelope: Envelope,
    content: Option<Content>,
    locked: bool,
}

impl StoredMessage {
    pub(crate) fn new(
        store: MessageStore,
        id: MessageId,
        envelope: Envelope,
        content: Content,
    ) -> Self {
        Self {
            store,
            id,
            envelope,
            content: Some(content),
            locked: true,
        }
    }

    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The content stream; `None` once taken.
    pub fn take_content(&mut self) -> Option<Content> {
        self.content.take()
    }

    /// The message was delivered: remove both files.
    ///
    /// # Errors
    /// If either file cannot be removed.
    pub fn destroy(mut self) -> Result<()> {
        self.locked = false;
        self.content.take();
        self.store.delete_locked(self.id)
    }

    /// The message cannot be delivered: move the envelope aside with `reason`.
    ///
    /// # Errors
    /// If the envelope cannot be renamed or annotated.
    pub fn fail(mut self, reason: &str) -> Result<()> {
        self.locked = false;
        self.content.take();
        Ok(self.store.fail_locked(self.id, reason)?)
    }

    /// Give the message back to the queue untouched.
    ///
    /// # Errors
    /// If the envelope cannot be renamed back.
    pub fn unlock(mut self) -> Result<()> {
        self.locked = false;
        Ok(self.store.unlock(self.id)?)
    }
}

impl Drop for StoredMessage {
    fn drop(&mut self) {
        if self.locked
            && let Err(err) = self.store.unlock(self.id)
        {
            internal!(level = ERROR, "Unable to release {}: {err}", self.id);
        }
    }
}

/// The stored message lines, read back without their terminators.
#[derive(Debug)]
pub struct Content {
    reader: BufReader<File>,
}

impl Content {
    pub(crate) fn new(file: File) -> Self {
        Self {
            reader: BufReader::new(file),
        }
    }

    /// The next line, or `None` at the end of the content.
    ///
    /// # Errors
    /// Any read error from the underlying file.
    pub fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }

        Ok(Some(line))
    }

    /// Start again from the first line.
    ///
    /// # Errors
    /// If the file cannot be repositioned.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(0)).map(|_| ())
    }
}
