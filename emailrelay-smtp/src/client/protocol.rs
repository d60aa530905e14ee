//! The outbound SMTP conversation for a sequence of messages.

use std::{borrow::Cow, io};

use emailrelay_common::{incoming, internal, status::Status};
use emailrelay_spool::Content;

use super::response::{Reply, ReplyAssembler};
use crate::{
    error::Failure,
    sender::{Outbox, Sender},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Waiting for the greeting.
    Init,
    SentEhlo,
    SentHelo,
    /// Ready for a message.
    Idle,
    SentMail,
    /// Waiting for the reply to the RCPT of the recipient at this index.
    SentRcpt(usize),
    SentData,
    /// Sending content.
    Data,
    SentDot,
    /// A message failed and RSET is outstanding.
    Reset,
    Quit,
}

/// One message to send.
#[derive(Debug)]
pub struct Outgoing {
    pub from: String,
    pub to: Vec<String>,
    pub eight_bit: bool,
    pub content: Content,
}

/// What happened as a result of a reply or a resumed write.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// Nothing for the caller to do yet.
    Pending,
    /// The handshake is done; a message can be started.
    Ready,
    /// The current message is finished, or the connection failed.
    Done(Result<(), Failure>),
}

/// Escape a content line for the wire.
#[must_use]
pub fn dot_stuff(line: &[u8]) -> Cow<'_, [u8]> {
    if line.first() == Some(&b'.') {
        let mut stuffed = Vec::with_capacity(line.len() + 1);
        stuffed.push(b'.');
        stuffed.extend_from_slice(line);
        Cow::Owned(stuffed)
    } else {
        Cow::Borrowed(line)
    }
}

/// Client side of one outbound connection
///
/// Feed it reply lines with [`ClientProtocol::apply`]; it answers through the
/// [`Sender`]. Messages are started one at a time with
/// [`ClientProtocol::start`] once [`ClientEvent::Ready`] has been seen.
#[derive(Debug)]
pub struct ClientProtocol<S> {
    outbox: Outbox<S>,
    hostname: String,
    state: ClientState,
    replies: ReplyAssembler,
    eight_bit_mime: bool,
    message: Option<Outgoing>,
    failure: Option<Failure>,
}

impl<S: Sender> ClientProtocol<S> {
    pub fn new(sender: S, hostname: &str) -> Self {
        Self {
            outbox: Outbox::new(sender),
            hostname: hostname.to_string(),
            state: ClientState::Init,
            replies: ReplyAssembler::default(),
            eight_bit_mime: false,
            message: None,
            failure: None,
        }
    }

    /// Apply one received line.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn apply(&mut self, line: &str) -> io::Result<ClientEvent> {
        incoming!("{line}");

        match self.replies.push(line) {
            Some(reply) => self.on_reply(&reply),
            None => Ok(ClientEvent::Pending),
        }
    }

    /// Begin sending `message`.
    ///
    /// An eight-bit message is refused without sending anything if the peer
    /// did not advertise 8BITMIME.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn start(&mut self, message: Outgoing) -> io::Result<ClientEvent> {
        if self.state != ClientState::Idle {
            return Ok(ClientEvent::Done(Err(Failure::connection(format!(
                "Cannot start a message in state {:?}",
                self.state
            )))));
        }

        if message.to.is_empty() {
            return Ok(ClientEvent::Done(Err(Failure::message("no remote recipients"))));
        }

        if message.eight_bit && !self.eight_bit_mime {
            internal!(level = WARN, "Refusing to send 8-bit content to a 7-bit peer");
            return Ok(ClientEvent::Done(Err(Failure::connection(
                "narrow pipe: the next hop does not support 8BITMIME",
            ))));
        }

        let body = if message.eight_bit { " BODY=8BITMIME" } else { "" };
        self.outbox
            .send_text(&format!("MAIL FROM:<{}>{body}", message.from))?;
        self.message = Some(message);
        self.state = ClientState::SentMail;

        Ok(ClientEvent::Pending)
    }

    /// Retry held-back output and carry on sending content.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn resume(&mut self) -> io::Result<ClientEvent> {
        if !self.outbox.flush()? {
            return Ok(ClientEvent::Pending);
        }

        if self.state == ClientState::Data {
            self.send_content()
        } else {
            Ok(ClientEvent::Pending)
        }
    }

    /// End the conversation.
    ///
    /// # Errors
    /// The connection is broken.
    pub fn quit(&mut self) -> io::Result<()> {
        self.message = None;
        self.state = ClientState::Quit;
        self.outbox.send_text("QUIT")
    }

    #[must_use]
    pub const fn state(&self) -> ClientState {
        self.state
    }

    /// The peer accepts eight-bit content.
    #[must_use]
    pub const fn eight_bit_mime(&self) -> bool {
        self.eight_bit_mime
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.outbox.is_blocked()
    }

    pub const fn sender(&self) -> &S {
        self.outbox.sender()
    }

    fn on_reply(&mut self, reply: &Reply) -> io::Result<ClientEvent> {
        if Status::from(u32::from(reply.code)) == Status::Unavailable && self.in_transaction() {
            self.state = ClientState::Quit;
            self.message = None;
            self.failure = None;
            return Ok(ClientEvent::Done(Err(Failure::connection(format!(
                "Service closing: {reply}"
            )))));
        }

        match self.state {
            ClientState::Init if reply.is_success() => {
                self.outbox.send_text(&format!("EHLO {}", self.hostname))?;
                self.state = ClientState::SentEhlo;
                Ok(ClientEvent::Pending)
            }
            ClientState::SentEhlo if reply.is_success() => {
                self.eight_bit_mime = reply.has_extension("8BITMIME");
                self.state = ClientState::Idle;
                Ok(ClientEvent::Ready)
            }
            ClientState::SentEhlo if reply.is_permanent_error() => {
                self.outbox.send_text(&format!("HELO {}", self.hostname))?;
                self.state = ClientState::SentHelo;
                Ok(ClientEvent::Pending)
            }
            ClientState::SentHelo if reply.is_success() => {
                self.eight_bit_mime = false;
                self.state = ClientState::Idle;
                Ok(ClientEvent::Ready)
            }
            ClientState::Init | ClientState::SentEhlo | ClientState::SentHelo => {
                self.state = ClientState::Quit;
                Ok(ClientEvent::Done(Err(Failure::connection(format!(
                    "Session rejected: {reply}"
                )))))
            }
            ClientState::SentMail if reply.is_success() => self.send_rcpt(0),
            ClientState::SentMail => self.reset(Failure::message(format!(
                "MAIL FROM rejected: {reply}"
            ))),
            ClientState::SentRcpt(index) if reply.is_success() => self.send_rcpt(index + 1),
            ClientState::SentRcpt(index) => {
                let to = self
                    .message
                    .as_ref()
                    .and_then(|message| message.to.get(index))
                    .map_or("", String::as_str);
                let failure = Failure::message(format!("RCPT TO:<{to}> rejected: {reply}"));
                self.reset(failure)
            }
            ClientState::SentData if reply.is_intermediate() => {
                self.state = ClientState::Data;
                self.send_content()
            }
            ClientState::SentData => {
                self.reset(Failure::message(format!("DATA rejected: {reply}")))
            }
            ClientState::SentDot => {
                self.state = ClientState::Idle;
                self.message = None;
                if reply.is_success() {
                    Ok(ClientEvent::Done(Ok(())))
                } else {
                    Ok(ClientEvent::Done(Err(Failure::message(reply.to_string()))))
                }
            }
            ClientState::Reset => {
                self.state = ClientState::Idle;
                self.message = None;
                let failure = self
                    .failure
                    .take()
                    .unwrap_or_else(|| Failure::message("message rejected"));
                Ok(ClientEvent::Done(Err(failure)))
            }
            ClientState::Quit => Ok(ClientEvent::Pending),
            ClientState::Data => {
                self.state = ClientState::Quit;
                self.message = None;
                Ok(ClientEvent::Done(Err(Failure::connection(format!(
                    "unexpected response during content: {reply}"
                )))))
            }
            ClientState::Idle => {
                self.state = ClientState::Quit;
                Ok(ClientEvent::Done(Err(Failure::connection(format!(
                    "unexpected response: {reply}"
                )))))
            }
        }
    }

    /// Waiting on a reply that belongs to the current message.
    const fn in_transaction(&self) -> bool {
        matches!(
            self.state,
            ClientState::SentMail
                | ClientState::SentRcpt(_)
                | ClientState::SentData
                | ClientState::SentDot
                | ClientState::Reset
        )
    }

    fn send_rcpt(&mut self, index: usize) -> io::Result<ClientEvent> {
        let next = self
            .message
            .as_ref()
            .and_then(|message| message.to.get(index))
            .cloned();

        match next {
            Some(to) => {
                self.outbox.send_text(&format!("RCPT TO:<{to}>"))?;
                self.state = ClientState::SentRcpt(index);
            }
            None => {
                self.outbox.send_text("DATA")?;
                self.state = ClientState::SentData;
            }
        }

        Ok(ClientEvent::Pending)
    }

    fn reset(&mut self, failure: Failure) -> io::Result<ClientEvent> {
        internal!(level = WARN, "{failure}");
        self.failure = Some(failure);
        self.state = ClientState::Reset;
        self.outbox.send_text("RSET")?;
        Ok(ClientEvent::Pending)
    }

    /// Send content until the sender pushes back or the content ends.
    fn send_content(&mut self) -> io::Result<ClientEvent> {
        let Some(message) = self.message.as_mut() else {
            self.state = ClientState::Quit;
            return Ok(ClientEvent::Done(Err(Failure::connection(
                "no message content to send",
            ))));
        };

        while !self.outbox.is_blocked() {
            match message.content.next_line() {
                Ok(Some(line)) => self.outbox.send_line(&dot_stuff(&line))?,
                Ok(None) => {
                    self.outbox.send_text(".")?;
                    self.state = ClientState::SentDot;
                    break;
                }
                Err(err) => {
                    // The peer is mid-DATA; the connection cannot be reused
                    self.state = ClientState::Quit;
                    self.message = None;
                    return Ok(ClientEvent::Done(Err(Failure::connection(format!(
                        "Unable to read message content: {err}"
                    )))));
                }
            }
        }

        Ok(ClientEvent::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(dot_stuff(b".foo").as_ref(), b"..foo");
        assert_eq!(dot_stuff(b".").as_ref(), b"..");
        assert_eq!(dot_stuff(b"foo.").as_ref(), b"foo.");
        assert!(matches!(dot_stuff(b"plain"), Cow::Borrowed(_)));
    }
}
