//! Forwarding queued messages to the next hop.

pub mod protocol;
pub mod response;
pub mod session;

use std::io;

use emailrelay_common::{config::ClientTimeouts, internal};
use emailrelay_spool::{MessageId, StoredMessage};

pub use self::{
    protocol::{ClientEvent, ClientProtocol, ClientState, Outgoing, dot_stuff},
    response::{Reply, ReplyAssembler},
};
use crate::{
    error::{Failure, ForwardError, Scope},
    sender::Sender,
};

/// The server messages are forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    /// `host:port`
    pub address: String,
    /// Name to give in EHLO.
    pub hostname: String,
    pub timeouts: ClientTimeouts,
}

impl Outgoing {
    /// Everything needed to send a claimed message; `None` if its content has
    /// already been taken.
    pub fn from_stored(message: &mut StoredMessage) -> Option<Self> {
        let content = message.take_content()?;
        let envelope = message.envelope();

        Some(Self {
            from: envelope.from.clone(),
            to: envelope.remote_recipients().map(str::to_string).collect(),
            eight_bit: envelope.eight_bit,
            content,
        })
    }
}

/// The result of a forwarding batch.
#[derive(Debug, Default)]
pub struct Summary {
    pub forwarded: Vec<MessageId>,
    pub failed: Vec<(MessageId, Failure)>,
    /// Why the batch stopped before the queue ran out.
    pub aborted: Option<ForwardError>,
}

impl Summary {
    /// What happened to `id`, in the terms a server session reports.
    ///
    /// # Errors
    /// The failure recorded for `id`, or the reason the batch stopped.
    pub fn outcome(&self, id: MessageId) -> Result<MessageId, Failure> {
        if self.forwarded.contains(&id) {
            return Ok(id);
        }

        if let Some((_, failure)) = self.failed.iter().find(|(failed, _)| *failed == id) {
            return Err(failure.clone());
        }

        Err(Failure::connection(self.aborted.as_ref().map_or_else(
            || "message was not forwarded".to_string(),
            ToString::to_string,
        )))
    }

    fn record_failure(&mut self, id: MessageId, failure: Failure) {
        self.failed.push((id, failure));
    }
}

/// Whether a batch needs more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    Pending,
    /// The batch is over; flush and close the connection.
    Finished,
}

/// Sends a sequence of claimed messages over one connection
///
/// Each message ends with exactly one of destroy (delivered) or fail. A
/// failure that affects only the message moves on to the next; a failure of
/// the connection ends the batch, leaving unclaimed messages queued.
pub struct Client<S> {
    protocol: ClientProtocol<S>,
    current: Option<StoredMessage>,
    queue: Box<dyn Iterator<Item = StoredMessage> + Send>,
    summary: Summary,
}

impl<S: Sender> Client<S> {
    pub fn new(
        protocol: ClientProtocol<S>,
        first: StoredMessage,
        queue: Box<dyn Iterator<Item = StoredMessage> + Send>,
    ) -> Self {
        Self {
            protocol,
            current: Some(first),
            queue,
            summary: Summary::default(),
        }
    }

    /// Apply one received line.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn apply(&mut self, line: &str) -> io::Result<BatchEvent> {
        let event = self.protocol.apply(line)?;
        self.handle(event)
    }

    /// Continue after the connection became writable.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn resume(&mut self) -> io::Result<BatchEvent> {
        let event = self.protocol.resume()?;
        self.handle(event)
    }

    /// The connection is gone: fail the message in flight and stop.
    pub fn abort(&mut self, error: ForwardError) {
        internal!(level = WARN, "Forwarding aborted: {error}");

        if let Some(message) = self.current.take() {
            let failure = Failure::connection(error.to_string());
            self.settle(message, Err(failure));
        }
        self.summary.aborted = Some(error);
    }

    /// End the batch and report.
    pub fn finish(mut self) -> Summary {
        if let Some(message) = self.current.take() {
            self.settle(message, Err(Failure::connection("forwarding interrupted")));
        }

        internal!(
            level = INFO,
            "Forwarded {} message(s), {} failed",
            self.summary.forwarded.len(),
            self.summary.failed.len()
        );
        self.summary
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.protocol.is_blocked()
    }

    pub const fn protocol(&self) -> &ClientProtocol<S> {
        &self.protocol
    }

    fn handle(&mut self, mut event: ClientEvent) -> io::Result<BatchEvent> {
        loop {
            match event {
                ClientEvent::Pending => return Ok(BatchEvent::Pending),
                ClientEvent::Ready => {}
                ClientEvent::Done(result) => {
                    if !self.complete(result) {
                        self.protocol.quit()?;
                        return Ok(BatchEvent::Finished);
                    }
                }
            }

            let Some(message) = self.current.as_mut() else {
                self.protocol.quit()?;
                return Ok(BatchEvent::Finished);
            };

            internal!("Forwarding {}", message.id());
            event = match Outgoing::from_stored(message) {
                Some(outgoing) => self.protocol.start(outgoing)?,
                None => ClientEvent::Done(Err(Failure::message("message content unavailable"))),
            };
        }
    }

    /// Settle the current message; `false` if the batch cannot go on.
    fn complete(&mut self, result: Result<(), Failure>) -> bool {
        let carry_on = result
            .as_ref()
            .err()
            .is_none_or(|failure| failure.scope != Scope::Connection);

        match self.current.take() {
            Some(message) => self.settle(message, result),
            None => {
                if let Err(failure) = result {
                    self.summary.aborted = Some(ForwardError::Protocol(failure));
                }
                return false;
            }
        }

        if carry_on {
            self.current = self.queue.next();
        }
        carry_on
    }

    fn settle(&mut self, message: StoredMessage, result: Result<(), Failure>) {
        let id = message.id();

        match result {
            Ok(()) => {
                internal!(level = INFO, "Forwarded {id}");
                if let Err(err) = message.destroy() {
                    internal!(level = ERROR, "Unable to remove forwarded {id}: {err}");
                }
                self.summary.forwarded.push(id);
            }
            Err(failure) => {
                if let Err(err) = message.fail(&failure.reason) {
                    internal!(level = ERROR, "Unable to fail {id}: {err}");
                }
                if failure.scope == Scope::Connection && self.summary.aborted.is_none() {
                    self.summary.aborted = Some(ForwardError::Protocol(failure.clone()));
                }
                self.summary.record_failure(id, failure);
            }
        }
    }
}
