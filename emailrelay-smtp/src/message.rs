//! The message a server session is building.
//!
//! [`ProtocolMessageStore`] only queues; [`ProtocolMessageForward`] queues and
//! then hands the claimed message back so the session can relay it at once.

use emailrelay_common::internal;
use emailrelay_spool::{MessageId, MessageStore, NewMessage, StoreError, StoredMessage};

use crate::error::Failure;

/// What became of a finished message.
#[derive(Debug)]
pub enum Processing {
    /// The outcome is known and the client can be answered.
    Done(Result<MessageId, Failure>),
    /// Queued and claimed; relay it, then report back with
    /// [`crate::ServerProtocol::processed`].
    Forward(StoredMessage),
}

pub trait ProtocolMessage: Send {
    /// Forget the message in progress, removing anything written for it.
    fn clear(&mut self);

    /// Begin a message.
    ///
    /// # Errors
    /// The store could not create the message.
    fn set_from(&mut self, from: &str) -> Result<(), StoreError>;

    fn add_to(&mut self, address: &str, is_local: bool);

    fn add_text(&mut self, line: &[u8]);

    /// Record the peer address and any authenticated identity.
    fn set_client(&mut self, client: &str, authentication: &str);

    /// Finish the message.
    fn process(&mut self) -> Processing;
}

/// Queues messages for the next forwarding pass.
#[derive(Debug)]
pub struct ProtocolMessageStore {
    store: MessageStore,
    message: Option<NewMessage>,
    client: String,
    authentication: String,
}

impl ProtocolMessageStore {
    pub const fn new(store: MessageStore) -> Self {
        Self {
            store,
            message: None,
            client: String::new(),
            authentication: String::new(),
        }
    }

    pub const fn store(&self) -> &MessageStore {
        &self.store
    }

    fn has_remote_recipients(&self) -> bool {
        self.message
            .as_ref()
            .is_some_and(|message| message.envelope().has_remote_recipients())
    }

    fn commit(&mut self) -> Result<MessageId, Failure> {
        let message = self
            .message
            .take()
            .ok_or_else(|| Failure::local("no message in progress"))?;

        message.commit().map_err(|err| {
            internal!(level = ERROR, "{err}");
            Failure::local(err.to_string())
        })
    }
}

impl ProtocolMessage for ProtocolMessageStore {
    fn clear(&mut self) {
        self.message = None;
    }

    fn set_from(&mut self, from: &str) -> Result<(), StoreError> {
        self.message = None;

        let mut message = self.store.new_message(from)?;
        message.set_client(&self.client);
        message.set_authentication(&self.authentication);
        self.message = Some(message);

        Ok(())
    }

    fn add_to(&mut self, address: &str, is_local: bool) {
        if let Some(message) = self.message.as_mut() {
            message.add_to(address, is_local);
        }
    }

    fn add_text(&mut self, line: &[u8]) {
        if let Some(message) = self.message.as_mut() {
            message.add_text(line);
        }
    }

    fn set_client(&mut self, client: &str, authentication: &str) {
        self.client = client.to_string();
        self.authentication = authentication.to_string();
    }

    fn process(&mut self) -> Processing {
        Processing::Done(self.commit())
    }
}

/// Queues messages and relays each one straight away.
///
/// A message with only local recipients has nothing to relay: it is removed
/// from the queue right after commit, leaving the local delivery copy.
#[derive(Debug)]
pub struct ProtocolMessageForward {
    inner: ProtocolMessageStore,
}

impl ProtocolMessageForward {
    pub const fn new(store: MessageStore) -> Self {
        Self {
            inner: ProtocolMessageStore::new(store),
        }
    }
}

impl ProtocolMessage for ProtocolMessageForward {
    fn clear(&mut self) {
        self.inner.clear();
    }

    fn set_from(&mut self, from: &str) -> Result<(), StoreError> {
        self.inner.set_from(from)
    }

    fn add_to(&mut self, address: &str, is_local: bool) {
        self.inner.add_to(address, is_local);
    }

    fn add_text(&mut self, line: &[u8]) {
        self.inner.add_text(line);
    }

    fn set_client(&mut self, client: &str, authentication: &str) {
        self.inner.set_client(client, authentication);
    }

    fn process(&mut self) -> Processing {
        let forwardable = self.inner.has_remote_recipients();

        let id = match self.inner.commit() {
            Ok(id) => id,
            Err(failure) => return Processing::Done(Err(failure)),
        };

        if !forwardable {
            internal!("{id} has no remote recipients, nothing to forward");
            // The local copy is already made, so the client must not retry
            if let Err(err) = self.inner.store().remove(id) {
                internal!(level = ERROR, "Unable to remove {id}: {err}");
            }
            return Processing::Done(Ok(id));
        }

        match self.inner.store().get(id) {
            Ok(message) => Processing::Forward(message),
            // Somebody else claimed it first and will forward it
            Err(StoreError::Locked(_) | StoreError::NotFound(_)) => Processing::Done(Ok(id)),
            Err(err) => {
                internal!(level = ERROR, "Unable to claim {id}: {err}");
                Processing::Done(Err(Failure::local(err.to_string())))
            }
        }
    }
}
