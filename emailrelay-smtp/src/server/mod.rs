//! The inbound SMTP conversation.

pub mod session;

use std::{io, sync::Arc};

use emailrelay_common::{incoming, internal, status::Status};
use emailrelay_spool::{MessageId, MessageStore, StoredMessage};

use crate::{
    client::NextHop,
    command::{Command, HeloVariant, MailParameters},
    config::{ForwardMode, ServerConfig},
    connection::COMMAND_LINE_LIMIT,
    error::{Failure, Scope},
    message::{Processing, ProtocolMessage, ProtocolMessageForward, ProtocolMessageStore},
    sender::{Outbox, Sender},
    state::{self, Action, Event, State},
    verifier::{ExternalVerifier, InternalVerifier, Verifier},
};

/// Longest content line held when no message size limit is set.
pub const CONTENT_LINE_LIMIT: usize = 1 << 20;

/// Everything a server session needs, shared by all sessions of a listener.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub store: MessageStore,
    pub verifier: Arc<dyn Verifier>,
    /// Where messages go in [`ForwardMode::Immediate`].
    pub next_hop: Option<Arc<NextHop>>,
}

impl ServerContext {
    /// Build a context, choosing the verifier the configuration asks for.
    pub fn new(config: ServerConfig, store: MessageStore, next_hop: Option<NextHop>) -> Self {
        let verifier: Arc<dyn Verifier> = match &config.verifier {
            Some(program) => Arc::new(
                ExternalVerifier::new(program, &config.hostname)
                    .with_limit(config.timeouts.verifier()),
            ),
            None => Arc::new(InternalVerifier::new(&config.hostname, &config.local_domains)),
        };

        Self {
            config: Arc::new(config),
            store,
            verifier,
            next_hop: next_hop.map(Arc::new),
        }
    }

    /// A fresh message builder for one session.
    pub fn protocol_message(&self) -> Box<dyn ProtocolMessage> {
        match (self.config.forward, &self.next_hop) {
            (ForwardMode::Immediate, Some(_)) => {
                Box::new(ProtocolMessageForward::new(self.store.clone()))
            }
            _ => Box::new(ProtocolMessageStore::new(self.store.clone())),
        }
    }

    pub fn protocol<S: Sender>(&self, sender: S, peer: &str) -> ServerProtocol<S> {
        ServerProtocol::new(
            sender,
            self.protocol_message(),
            Arc::clone(&self.verifier),
            Arc::clone(&self.config),
            peer,
        )
    }
}

/// What the session should do after a line has been applied.
#[derive(Debug)]
pub enum ServerEvent {
    Continue,
    /// The conversation is over; flush and close.
    Close,
    /// Relay this message, then call [`ServerProtocol::processed`].
    Forward(StoredMessage),
}

enum Outcome {
    Success,
    Failure,
    Close,
    Processed(Result<MessageId, Failure>),
    Forward(StoredMessage),
}

/// One inbound connection's protocol state
///
/// Lines go in through [`ServerProtocol::apply`]; replies come out through the
/// [`Sender`]. If the sender cannot take everything, the rest is held until
/// [`ServerProtocol::resume`].
pub struct ServerProtocol<S> {
    outbox: Outbox<S>,
    message: Box<dyn ProtocolMessage>,
    verifier: Arc<dyn Verifier>,
    config: Arc<ServerConfig>,
    state: State,
    peer: String,
    helo: Option<String>,
    from: String,
    received: u64,
    oversized: bool,
}

impl<S: Sender> ServerProtocol<S> {
    pub fn new(
        sender: S,
        mut message: Box<dyn ProtocolMessage>,
        verifier: Arc<dyn Verifier>,
        config: Arc<ServerConfig>,
        peer: &str,
    ) -> Self {
        message.set_client(peer, "");

        Self {
            outbox: Outbox::new(sender),
            message,
            verifier,
            config,
            state: State::Start,
            peer: peer.to_string(),
            helo: None,
            from: String::new(),
            received: 0,
            oversized: false,
        }
    }

    /// Send the greeting.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn start(&mut self) -> io::Result<()> {
        internal!(level = INFO, "Connection from {}", self.peer);
        let greeting = format!("{} ESMTP ready", self.config.hostname);
        self.reply(Status::ServiceReady, &greeting)
    }

    /// Apply one received line, without its terminator.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn apply(&mut self, line: &[u8]) -> io::Result<ServerEvent> {
        match self.state {
            State::End => Ok(ServerEvent::Close),
            State::Data => {
                let event = if line == b"." { Event::Eot } else { Event::Content };
                self.dispatch(event, None, line)
            }
            _ => {
                let command = Command::from(line);
                incoming!("{command}");
                self.dispatch(Event::from(&command), Some(command), line)
            }
        }
    }

    /// Apply a line that was cut short at [`ServerProtocol::line_limit`].
    ///
    /// Content marks the message oversized so it is refused at the final dot;
    /// a command is answered with 500.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn too_long(&mut self, line: &[u8]) -> io::Result<ServerEvent> {
        match self.state {
            State::End => Ok(ServerEvent::Close),
            State::Data => {
                if !self.oversized {
                    internal!(level = INFO, "Message from <{}> has an overlong line", self.from);
                }
                self.oversized = true;
                self.apply(line)
            }
            _ => {
                internal!("Command line longer than {COMMAND_LINE_LIMIT} bytes");
                self.reply(Status::SyntaxError, "Line too long")?;
                Ok(ServerEvent::Continue)
            }
        }
    }

    /// The most bytes of one line worth keeping in the current state.
    #[must_use]
    pub fn line_limit(&self) -> usize {
        match self.state {
            State::Data => match usize::try_from(self.config.max_size) {
                Ok(0) => CONTENT_LINE_LIMIT,
                Ok(limit) => limit,
                Err(_) => usize::MAX,
            },
            _ => COMMAND_LINE_LIMIT,
        }
    }

    /// Report the outcome of a message handed out by [`ServerEvent::Forward`].
    ///
    /// # Errors
    /// The connection is broken.
    pub fn processed(&mut self, result: Result<MessageId, Failure>) -> io::Result<()> {
        let Some(transition) = state::lookup(Event::Done, self.state) else {
            internal!(level = WARN, "Ignoring a result with no message outstanding");
            return Ok(());
        };

        match result {
            Ok(id) => self.reply(Status::Ok, &format!("OK queued as {id}"))?,
            Err(Failure { reason, scope }) => {
                let (status, text) = match scope {
                    Scope::Local => (Status::InsufficientStorage, "Unable to queue message"),
                    Scope::Connection => (Status::LocalError, "Unable to forward message"),
                    Scope::Message => (Status::TransactionFailed, "Message rejected"),
                };
                self.reply(status, &format!("{text}: {reason}"))?;
            }
        }

        self.reset_transaction();
        self.move_to(transition.next);
        Ok(())
    }

    /// Say goodbye early, for a timeout or a shutdown.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn abort(&mut self, reason: &str) -> io::Result<()> {
        self.reset_transaction();
        self.move_to(State::End);
        let text = format!("{} {reason}, closing connection", self.config.hostname);
        self.reply(Status::Unavailable, &text)
    }

    /// Retry held-back output; `true` once everything has been sent.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn resume(&mut self) -> io::Result<bool> {
        self.outbox.flush()
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.outbox.is_blocked()
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Name the client gave in EHLO/HELO.
    #[must_use]
    pub fn helo(&self) -> Option<&str> {
        self.helo.as_deref()
    }

    pub const fn sender(&self) -> &S {
        self.outbox.sender()
    }

    fn dispatch(
        &mut self,
        event: Event,
        command: Option<Command>,
        line: &[u8],
    ) -> io::Result<ServerEvent> {
        let Some(transition) = state::lookup(event, self.state) else {
            internal!("{event:?} is out of sequence in {}", self.state);
            self.reply(Status::InvalidCommandSequence, "Bad sequence of commands")?;
            return Ok(ServerEvent::Continue);
        };

        Ok(match self.perform(transition.action, command, line)? {
            Outcome::Success => {
                self.move_to(transition.next);
                ServerEvent::Continue
            }
            Outcome::Failure => {
                self.move_to(transition.fallback);
                ServerEvent::Continue
            }
            Outcome::Close => {
                self.move_to(State::End);
                ServerEvent::Close
            }
            Outcome::Processed(result) => {
                self.move_to(transition.next);
                self.processed(result)?;
                ServerEvent::Continue
            }
            Outcome::Forward(message) => {
                self.move_to(transition.next);
                ServerEvent::Forward(message)
            }
        })
    }

    fn perform(
        &mut self,
        action: Action,
        command: Option<Command>,
        line: &[u8],
    ) -> io::Result<Outcome> {
        match (action, command) {
            (Action::Ehlo, Some(Command::Helo(HeloVariant::Ehlo(name)))) => self.ehlo(name),
            (Action::Helo, Some(Command::Helo(HeloVariant::Helo(name)))) => self.helo_reply(name),
            (Action::Mail, Some(Command::MailFrom(from, parameters))) => {
                self.mail(from, &parameters)
            }
            (Action::Rcpt, Some(Command::RcptTo(to))) => self.rcpt(&to),
            (Action::NoRecipients, _) => {
                self.reset_transaction();
                self.reply(Status::TransactionFailed, "No valid recipients")?;
                Ok(Outcome::Success)
            }
            (Action::Data, _) => {
                self.received = 0;
                self.oversized = false;
                self.reply(
                    Status::StartMailInput,
                    "Start mail input; end with <CRLF>.<CRLF>",
                )?;
                Ok(Outcome::Success)
            }
            (Action::Content, _) => {
                self.content(line);
                Ok(Outcome::Success)
            }
            (Action::Eot, _) => self.end_of_data(),
            (Action::Rset, _) => {
                self.reset_transaction();
                self.reply(Status::Ok, "OK")?;
                Ok(Outcome::Success)
            }
            (Action::Noop, _) => {
                self.reply(Status::Ok, "OK")?;
                Ok(Outcome::Success)
            }
            (Action::Help, _) => {
                self.reply(
                    Status::HelpMessage,
                    "Commands: EHLO HELO MAIL RCPT DATA RSET NOOP VRFY HELP QUIT",
                )?;
                Ok(Outcome::Success)
            }
            (Action::Vrfy, Some(Command::Vrfy(address))) => self.vrfy(&address),
            (Action::Quit, _) => {
                self.reset_transaction();
                let text = format!("{} closing connection", self.config.hostname);
                self.reply(Status::GoodBye, &text)?;
                Ok(Outcome::Close)
            }
            (Action::Malformed, Some(Command::Malformed(reason))) => {
                self.reply(Status::ParameterError, &reason)?;
                Ok(Outcome::Failure)
            }
            _ => {
                self.reply(Status::SyntaxError, "Command unrecognized")?;
                Ok(Outcome::Failure)
            }
        }
    }

    fn ehlo(&mut self, name: String) -> io::Result<Outcome> {
        self.reset_transaction();

        let mut lines = vec![format!("{} Hello {name}", self.config.hostname)];
        if self.config.max_size > 0 {
            lines.push(format!("SIZE {}", self.config.max_size));
        }
        lines.push("8BITMIME".to_string());
        lines.push("HELP".to_string());

        self.helo = Some(name);
        self.reply_lines(Status::Ok, &lines)?;
        Ok(Outcome::Success)
    }

    fn helo_reply(&mut self, name: String) -> io::Result<Outcome> {
        self.reset_transaction();
        let text = format!("{} Hello {name}", self.config.hostname);
        self.helo = Some(name);
        self.reply(Status::Ok, &text)?;
        Ok(Outcome::Success)
    }

    fn mail(&mut self, from: String, parameters: &MailParameters) -> io::Result<Outcome> {
        let limit = self.config.max_size;
        if limit > 0 && parameters.size.is_some_and(|size| size > limit) {
            self.reply(
                Status::ExceededStorage,
                "Message size exceeds fixed maximum message size",
            )?;
            return Ok(Outcome::Failure);
        }

        self.reset_transaction();
        if let Err(err) = self.message.set_from(&from) {
            internal!(level = ERROR, "Unable to start a message from <{from}>: {err}");
            self.reply(
                Status::InsufficientStorage,
                "Unable to accept message at this time",
            )?;
            return Ok(Outcome::Failure);
        }

        self.from = from;
        self.reply(Status::Ok, "OK")?;
        Ok(Outcome::Success)
    }

    fn rcpt(&mut self, to: &str) -> io::Result<Outcome> {
        let verdict = self.verifier.classify(to, &self.from);

        if !verdict.valid {
            let status = if verdict.temporary {
                Status::LocalError
            } else {
                Status::Error
            };
            self.reply(status, &format!("<{to}> {}", verdict.reason))?;
            return Ok(Outcome::Failure);
        }

        internal!(
            "Accepted <{}> as {}",
            verdict.address,
            if verdict.is_local { "local" } else { "remote" }
        );
        self.message.add_to(&verdict.address, verdict.is_local);
        self.reply(Status::Ok, "OK")?;
        Ok(Outcome::Success)
    }

    fn content(&mut self, line: &[u8]) {
        let line = line.strip_prefix(b".").unwrap_or(line);

        self.received += line.len() as u64 + 2;
        let limit = self.config.max_size;
        if limit > 0 && self.received > limit {
            if !self.oversized {
                internal!(level = INFO, "Message from <{}> exceeds {limit} bytes", self.from);
            }
            self.oversized = true;
        }

        if !self.oversized {
            self.message.add_text(line);
        }
    }

    fn end_of_data(&mut self) -> io::Result<Outcome> {
        if self.oversized {
            let text = if self.config.max_size > 0 {
                "Message size exceeds fixed maximum message size"
            } else {
                "Message contains an overlong line"
            };
            self.reset_transaction();
            self.reply(Status::ExceededStorage, text)?;
            return Ok(Outcome::Failure);
        }

        Ok(match self.message.process() {
            Processing::Done(result) => Outcome::Processed(result),
            Processing::Forward(message) => Outcome::Forward(message),
        })
    }

    fn vrfy(&mut self, address: &str) -> io::Result<Outcome> {
        let verdict = self.verifier.classify(address, "");

        match (verdict.valid, verdict.is_local) {
            (true, true) => self.reply(Status::Ok, &verdict.address)?,
            (true, false) => self.reply(
                Status::CannotVerify,
                "Cannot VRFY user, but will accept message and attempt delivery",
            )?,
            (false, _) => {
                let status = if verdict.temporary {
                    Status::LocalError
                } else {
                    Status::Error
                };
                self.reply(status, &format!("<{address}> {}", verdict.reason))?;
            }
        }

        Ok(Outcome::Success)
    }

    fn reset_transaction(&mut self) {
        self.message.clear();
        self.from.clear();
        self.received = 0;
        self.oversized = false;
    }

    fn move_to(&mut self, next: State) {
        if next != self.state {
            internal!("{} -> {next}", self.state);
            self.state = next;
        }
    }

    fn reply(&mut self, status: Status, text: &str) -> io::Result<()> {
        let text = text.replace(['\r', '\n'], " ");
        self.outbox.send_text(&format!("{status} {text}"))
    }

    fn reply_lines(&mut self, status: Status, lines: &[String]) -> io::Result<()> {
        let last = lines.len().saturating_sub(1);
        for (index, line) in lines.iter().enumerate() {
            let separator = if index == last { ' ' } else { '-' };
            self.outbox.send_text(&format!("{status}{separator}{line}"))?;
        }
        Ok(())
    }
}
