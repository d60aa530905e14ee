use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use emailrelay_common::internal;

use crate::{
    Envelope, EnvelopeError, MessageId, NewMessage, Result, StoreError,
    envelope::reason_line,
    stored::{Content, StoredMessage},
};

const CONTENT: &str = "content";
const ENVELOPE: &str = "envelope";
const WORKING: &str = "envelope.new";
const BUSY: &str = "envelope.busy";
const BAD: &str = "envelope.bad";
const LOCAL_CONTENT: &str = "content.local";
const LOCAL_ENVELOPE: &str = "envelope.local";

/// The spool directory
///
/// Every queued message is a pair of files sharing a [`MessageId`] stem. The
/// envelope's suffix encodes the lifecycle state:
///
/// | file | state |
/// |---|---|
/// | `<id>.content` only | being received |
/// | `<id>.envelope.new` | envelope being written |
/// | `<id>.envelope` | committed, claimable |
/// | `<id>.envelope.busy` | claimed by exactly one reader |
/// | `<id>.envelope.bad` | failed, kept for diagnosis |
///
/// Claiming is a rename from `.envelope` to `.envelope.busy`; the rename either
/// wins or finds the file gone, so two readers never hold the same message. The
/// store is cheap to clone and every clone issues ids from the same sequence.
#[derive(Debug, Clone)]
pub struct MessageStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    dir: PathBuf,
    pid: u32,
    epoch: u64,
    seq: AtomicU64,
}

/// What [`MessageStore::recover`] cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Working envelopes and orphaned content files deleted.
    pub removed: usize,
    /// Stale locks returned to the queue.
    pub unlocked: usize,
}

impl MessageStore {
    /// Open an existing spool directory.
    ///
    /// The directory is probed for writability so a misconfigured spool is
    /// reported at startup rather than on the first message.
    ///
    /// # Errors
    /// [`StoreError::InvalidDirectory`] if the path is missing, is not a
    /// directory, or cannot be written.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let invalid = |reason: String| StoreError::InvalidDirectory {
            path: dir.display().to_string(),
            reason,
        };

        let metadata = fs::metadata(dir).map_err(|err| invalid(err.to_string()))?;
        if !metadata.is_dir() {
            return Err(invalid("not a directory".to_string()));
        }

        let pid = std::process::id();
        let probe = dir.join(format!(".probe.{pid}"));
        fs::write(&probe, b"").map_err(|err| invalid(format!("not writable: {err}")))?;
        fs::remove_file(&probe).map_err(|err| invalid(format!("not writable: {err}")))?;

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());

        internal!(level = INFO, "Opened spool directory {}", dir.display());

        Ok(Self {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                pid,
                epoch,
                seq: AtomicU64::new(1),
            }),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Start a new message, creating its content file exclusively.
    ///
    /// # Errors
    /// [`StoreError::Write`] if the content file cannot be created.
    pub fn new_message(&self, from: &str) -> Result<NewMessage> {
        loop {
            let id = self.next_id();
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.content_path(id))
            {
                Ok(file) => {
                    internal!("New message {id} from <{from}>");
                    return Ok(NewMessage::new(self.clone(), id, from, file));
                }
                // Another store on the same directory issued this id
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => return Err(StoreError::Write { id, source }),
            }
        }
    }

    /// Committed message ids, oldest first.
    ///
    /// # Errors
    /// If the directory cannot be read.
    pub fn ids(&self) -> Result<Vec<MessageId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.dir())? {
            let name = entry?.file_name();
            if let Some(id) = name.to_str().and_then(committed_id) {
                ids.push(id);
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    /// `true` if nothing is waiting to be claimed.
    ///
    /// An unreadable directory counts as empty, after logging, since the only
    /// use is deciding whether a forwarding pass is worth starting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match fs::read_dir(self.dir()) {
            Ok(entries) => !entries
                .filter_map(std::result::Result::ok)
                .any(|entry| entry.file_name().to_str().and_then(committed_id).is_some()),
            Err(err) => {
                internal!(level = ERROR, "Unable to scan {}: {err}", self.dir().display());
                true
            }
        }
    }

    /// Claim every committed message in turn.
    ///
    /// The directory is listed once up front. Messages another reader claims
    /// first are skipped, and messages that cannot be read are failed and
    /// skipped, so one damaged envelope never stops the scan.
    ///
    /// # Errors
    /// If the directory cannot be read.
    pub fn iter(&self) -> Result<StoreIter> {
        Ok(StoreIter {
            store: self.clone(),
            ids: self.ids()?.into_iter(),
        })
    }

    /// Claim one message by id.
    ///
    /// # Errors
    /// - [`StoreError::NotFound`] if there is no such message
    /// - [`StoreError::Locked`] if another reader holds it
    /// - [`StoreError::Envelope`] if it was unreadable; it has been failed
    pub fn get(&self, id: MessageId) -> Result<StoredMessage> {
        self.lock(id)?;
        self.read_locked(id)
            .map_err(|source| StoreError::Envelope { id, source })
    }

    /// Delete a committed message without reading it.
    ///
    /// # Errors
    /// As for [`MessageStore::get`], plus any failure deleting the files.
    pub fn remove(&self, id: MessageId) -> Result<()> {
        self.lock(id)?;
        self.delete_locked(id)
    }

    /// Put the directory back into a consistent state after a crash.
    ///
    /// Working envelopes and content files with no envelope are deleted, and
    /// claims left behind by a previous process are released. Only call this
    /// before any other user of the directory starts.
    ///
    /// # Errors
    /// If the directory cannot be read or a file cannot be removed or renamed.
    pub fn recover(&self) -> Result<Recovery> {
        let mut recovery = Recovery::default();
        let mut contents = Vec::new();

        for entry in fs::read_dir(self.dir())? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(id) = MessageId::from_filename(name) else {
                continue;
            };

            match suffix(name) {
                Some(WORKING) => {
                    // Never acknowledged, so any local delivery copy goes too
                    fs::remove_file(self.working_path(id))?;
                    recovery.removed += 1 + self.remove_local_copies(id);
                }
                Some(BUSY) => {
                    fs::rename(self.busy_path(id), self.envelope_path(id))?;
                    recovery.unlocked += 1;
                }
                Some(CONTENT) => contents.push(id),
                _ => {}
            }
        }

        for id in contents {
            if !self.envelope_path(id).exists() && !self.bad_path(id).exists() {
                fs::remove_file(self.content_path(id))?;
                recovery.removed += 1;
            }
        }

        if recovery != Recovery::default() {
            internal!(
                level = WARN,
                "Recovered spool: removed {} file(s), released {} lock(s)",
                recovery.removed,
                recovery.unlocked
            );
        }

        Ok(recovery)
    }

    fn next_id(&self) -> MessageId {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        MessageId::new(self.inner.pid, self.inner.epoch, seq)
    }

    fn lock(&self, id: MessageId) -> Result<()> {
        match fs::rename(self.envelope_path(id), self.busy_path(id)) {
            Ok(()) => {
                internal!("Locked {id}");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if self.busy_path(id).exists() {
                    Err(StoreError::Locked(id))
                } else {
                    Err(StoreError::NotFound(id))
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    fn read_locked(&self, id: MessageId) -> std::result::Result<StoredMessage, EnvelopeError> {
        match self.open_locked(id) {
            Ok((envelope, content)) => Ok(StoredMessage::new(self.clone(), id, envelope, content)),
            Err(err) => {
                if let Err(fail) = self.fail_locked(id, &err.to_string()) {
                    internal!(level = ERROR, "Unable to fail {id}: {fail}");
                }
                Err(err)
            }
        }
    }

    fn open_locked(&self, id: MessageId) -> std::result::Result<(Envelope, Content), EnvelopeError> {
        let envelope = Envelope::read_from(BufReader::new(File::open(self.busy_path(id))?))?;
        if !envelope.has_remote_recipients() {
            return Err(EnvelopeError::NoRemoteRecipients);
        }

        let content = Content::new(File::open(self.content_path(id))?);
        Ok((envelope, content))
    }

    pub(crate) fn fail_locked(&self, id: MessageId, reason: &str) -> io::Result<()> {
        let bad = self.bad_path(id);
        fs::rename(self.busy_path(id), &bad)?;

        let mut file = OpenOptions::new().append(true).open(&bad)?;
        file.write_all(reason_line(reason).as_bytes())?;

        internal!(level = WARN, "Failed {id}: {reason}");
        Ok(())
    }

    pub(crate) fn delete_locked(&self, id: MessageId) -> Result<()> {
        fs::remove_file(self.busy_path(id))?;
        match fs::remove_file(self.content_path(id)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }

        internal!(level = INFO, "Destroyed {id}");
        Ok(())
    }

    pub(crate) fn unlock(&self, id: MessageId) -> io::Result<()> {
        fs::rename(self.busy_path(id), self.envelope_path(id))?;
        internal!("Unlocked {id}");
        Ok(())
    }

    /// Hand a copy of the message to the local delivery agent.
    ///
    /// Runs before the envelope is renamed into place so a forwarder cannot
    /// claim it in between. Failure is logged and otherwise ignored.
    pub(crate) fn copy_for_local_delivery(&self, id: MessageId) {
        let copied = fs::copy(self.content_path(id), self.path(id, LOCAL_CONTENT))
            .and_then(|_| fs::copy(self.working_path(id), self.path(id, LOCAL_ENVELOPE)));

        if let Err(err) = copied {
            internal!(level = WARN, "Unable to copy {id} for local delivery: {err}");
            let _ = self.remove_local_copies(id);
        }
    }

    /// Returns how many of the two copies were there to remove.
    pub(crate) fn remove_local_copies(&self, id: MessageId) -> usize {
        [self.path(id, LOCAL_CONTENT), self.path(id, LOCAL_ENVELOPE)]
            .into_iter()
            .filter(|path| fs::remove_file(path).is_ok())
            .count()
    }

    fn path(&self, id: MessageId, suffix: &str) -> PathBuf {
        self.dir().join(format!("{id}.{suffix}"))
    }

    pub(crate) fn content_path(&self, id: MessageId) -> PathBuf {
        self.path(id, CONTENT)
    }

    pub(crate) fn envelope_path(&self, id: MessageId) -> PathBuf {
        self.path(id, ENVELOPE)
    }

    pub(crate) fn working_path(&self, id: MessageId) -> PathBuf {
        self.path(id, WORKING)
    }

    pub(crate) fn busy_path(&self, id: MessageId) -> PathBuf {
        self.path(id, BUSY)
    }

    pub(crate) fn bad_path(&self, id: MessageId) -> PathBuf {
        self.path(id, BAD)
    }
}

/// Iterator returned by [`MessageStore::iter`].
///
/// Each item is already claimed; dropping it without a terminal action
/// releases the claim.
#[derive(Debug)]
pub struct StoreIter {
    store: MessageStore,
    ids: std::vec::IntoIter<MessageId>,
}

impl Iterator for StoreIter {
    type Item = StoredMessage;

    fn next(&mut self) -> Option<Self::Item> {
        for id in self.ids.by_ref() {
            match self.store.get(id) {
                Ok(message) => return Some(message),
                Err(StoreError::NotFound(_) | StoreError::Locked(_)) => {
                    internal!("Skipping {id}, claimed elsewhere");
                }
                Err(err) => internal!(level = WARN, "Skipping {id}: {err}"),
            }
        }

        None
    }
}

/// The state suffix of a spool file name, `None` for a bare stem.
fn suffix(name: &str) -> Option<&str> {
    name.splitn(5, '.').nth(4)
}

fn committed_id(name: &str) -> Option<MessageId> {
    (suffix(name) == Some(ENVELOPE))
        .then(|| MessageId::from_filename(name))
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix() {
        assert_eq!(suffix("emailrelay.1.2.3.envelope.busy"), Some(BUSY));
        assert_eq!(suffix("emailrelay.1.2.3.content"), Some(CONTENT));
        assert_eq!(suffix("emailrelay.1.2.3"), None);

        assert!(committed_id("emailrelay.1.2.3.envelope").is_some());
        assert!(committed_id("emailrelay.1.2.3.envelope.local").is_none());
        assert!(committed_id("emailrelay.1.2.3.envelope.bad").is_none());
        assert!(committed_id("notes.1.2.3.envelope").is_none());
    }

    #[test]
    fn test_open_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        assert!(matches!(
            MessageStore::open(&missing),
            Err(StoreError::InvalidDirectory { .. })
        ));
        assert!(!missing.exists());
    }

    #[test]
    fn test_open_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"").unwrap();

        assert!(matches!(
            MessageStore::open(&file),
            Err(StoreError::InvalidDirectory { .. })
        ));
    }

    #[test]
    fn test_sequence_is_shared_by_clones() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(dir.path()).unwrap();
        let clone = store.clone();

        let first = store.next_id();
        let second = clone.next_id();
        assert!(first < second);
        assert_eq!(second.seq(), first.seq() + 1);
        assert_eq!(first.pid(), std::process::id());
    }
}
