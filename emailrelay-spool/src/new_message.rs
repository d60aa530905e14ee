use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
};

use emailrelay_common::internal;

use crate::{Envelope, MessageId, MessageStore, Recipient, Result, StoreError};

/// A message being written into the store
///
/// Content is streamed to `<id>.content` line by line as it arrives. Nothing is
/// visible to readers until [`NewMessage::commit`] renames the envelope into
/// place; dropping an uncommitted message removes whatever it wrote.
#[derive(Debug)]
pub struct NewMessage {
    store: MessageStore,
    id: MessageId,
    content: Option<BufWriter<File>>,
    envelope: Envelope,
    size: u64,
    write_error: Option<io::Error>,
    committed: bool,
}

impl NewMessage {
    pub(crate) fn new(store: MessageStore, id: MessageId, from: &str, file: File) -> Self {
        Self {
            store,
            id,
            content: Some(BufWriter::new(file)),
            envelope: Envelope {
                from: from.to_string(),
                ..Envelope::default()
            },
            size: 0,
            write_error: None,
            committed: false,
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

    pub fn add_to(&mut self, address: &str, is_local: bool) {
        self.envelope.recipients.push(Recipient {
            address: address.to_string(),
            is_local,
        });
    }

    /// Append one content line, without its terminator; CRLF is added here.
    ///
    /// A write failure is remembered and reported by [`NewMessage::commit`], so
    /// the caller can keep consuming the client's data until the terminator.
    pub fn add_text(&mut self, line: &[u8]) {
        if line.iter().any(|byte| *byte >= 0x80) {
            self.envelope.eight_bit = true;
        }
        self.size += line.len() as u64 + 2;

        if self.write_error.is_some() {
            return;
        }

        let Some(content) = self.content.as_mut() else {
            return;
        };

        if let Err(err) = content.write_all(line) {
            self.write_error = Some(err);
        } else if let Err(err) = content.write_all(b"\r\n") {
            self.write_error = Some(err);
        }
    }

    pub fn set_authentication(&mut self, id: &str) {
        self.envelope.authentication = id.to_string();
    }

    pub fn set_client(&mut self, address: &str) {
        self.envelope.client = address.to_string();
    }

    #[must_use]
    pub const fn eight_bit(&self) -> bool {
        self.envelope.eight_bit
    }

    /// Content bytes written so far, terminators included.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Make the message visible to readers.
    ///
    /// The content is flushed to disk first; the envelope is then written to
    /// its working name and renamed into place. If any step fails both files
    /// are removed and the caller gets [`StoreError::Write`].
    ///
    /// # Errors
    /// Any I/O failure while flushing the content or writing the envelope.
    pub fn commit(mut self) -> Result<MessageId> {
        let id = self.id;

        self.finish_content()
            .and_then(|()| self.write_envelope())
            .map_err(|source| StoreError::Write { id, source })?;

        if self.envelope.has_local_recipients() {
            self.store.copy_for_local_delivery(id);
        }

        if let Err(source) = fs::rename(self.store.working_path(id), self.store.envelope_path(id)) {
            let _ = self.store.remove_local_copies(id);
            return Err(StoreError::Write { id, source });
        }
        self.committed = true;

        internal!(
            level = INFO,
            "Committed {id} from <{}> with {} recipient(s), {} bytes",
            self.envelope.from,
            self.envelope.recipients.len(),
            self.size
        );

        Ok(id)
    }

    fn finish_content(&mut self) -> io::Result<()> {
        if let Some(err) = self.write_error.take() {
            return Err(err);
        }

        match self.content.take() {
            Some(content) => content
                .into_inner()
                .map_err(io::IntoInnerError::into_error)?
                .sync_all(),
            None => Ok(()),
        }
    }

    fn write_envelope(&self) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(self.store.working_path(self.id))?);
        self.envelope.write_to(&mut out)?;
        out.into_inner()
            .map_err(io::IntoInnerError::into_error)?
            .sync_all()
    }
}

impl Drop for NewMessage {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        self.content.take();
        for path in [self.store.content_path(self.id), self.store.working_path(self.id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => internal!(
                    level = WARN,
                    "Unable to remove abandoned {}: {err}",
                    path.display()
                ),
            }
        }

        internal!("Abandoned {}", self.id);
    }
}
