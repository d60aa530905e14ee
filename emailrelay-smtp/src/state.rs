//! The server-side transition table.
//!
//! Every `(event, state)` pair the server accepts maps to the action to run,
//! the state to move to when the action succeeds, and the state to fall back
//! to when it does not. Pairs missing from the table are out of sequence.

use core::fmt::{self, Display, Formatter};

use crate::command::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Connected, greeting sent, no EHLO/HELO yet.
    Start,
    /// Between messages.
    Idle,
    GotMail,
    GotRcpt,
    /// Receiving message content.
    Data,
    /// The message is being stored or forwarded; its reply is outstanding.
    Processing,
    End,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Ehlo,
    Helo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Help,
    Vrfy,
    Quit,
    Malformed,
    Unknown,
    /// A content line.
    Content,
    /// The lone `.` ending the content.
    Eot,
    /// Processing of the message finished.
    Done,
}

impl From<&Command> for Event {
    fn from(command: &Command) -> Self {
        match command {
            Command::Helo(crate::command::HeloVariant::Ehlo(_)) => Self::Ehlo,
            Command::Helo(crate::command::HeloVariant::Helo(_)) => Self::Helo,
            Command::MailFrom(..) => Self::Mail,
            Command::RcptTo(_) => Self::Rcpt,
            Command::Data => Self::Data,
            Command::Rset => Self::Rset,
            Command::Noop => Self::Noop,
            Command::Help => Self::Help,
            Command::Vrfy(_) => Self::Vrfy,
            Command::Quit => Self::Quit,
            Command::Malformed(_) => Self::Malformed,
            Command::Invalid(_) => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ehlo,
    Helo,
    Mail,
    Rcpt,
    NoRecipients,
    Data,
    Content,
    Eot,
    Complete,
    Rset,
    Noop,
    Help,
    Vrfy,
    Quit,
    Malformed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: Action,
    pub next: State,
    /// Where to go if the action fails.
    pub fallback: State,
}

const fn to(action: Action, next: State, fallback: State) -> Option<Transition> {
    Some(Transition {
        action,
        next,
        fallback,
    })
}

/// States in which commands are read, as opposed to content.
const fn in_command_phase(state: State) -> bool {
    matches!(state, State::Start | State::Idle | State::GotMail | State::GotRcpt)
}

/// Look up the transition for `event` in `state`.
pub const fn lookup(event: Event, state: State) -> Option<Transition> {
    use State::{Data, GotMail, GotRcpt, Idle, Processing};

    match (event, state) {
        (Event::Content, Data) => to(Action::Content, Data, Data),
        (Event::Eot, Data) => to(Action::Eot, Processing, Idle),
        (Event::Done, Processing) => to(Action::Complete, Idle, Idle),

        (_, state) if !in_command_phase(state) => None,

        (Event::Ehlo, state) => to(Action::Ehlo, Idle, state),
        (Event::Helo, state) => to(Action::Helo, Idle, state),
        (Event::Mail, Idle) => to(Action::Mail, GotMail, Idle),
        (Event::Rcpt, GotMail | GotRcpt) => to(Action::Rcpt, GotRcpt, state),
        (Event::Data, GotMail) => to(Action::NoRecipients, Idle, Idle),
        (Event::Data, GotRcpt) => to(Action::Data, Data, GotRcpt),
        (Event::Rset, _) => to(Action::Rset, Idle, Idle),
        (Event::Noop, state) => to(Action::Noop, state, state),
        (Event::Help, state) => to(Action::Help, state, state),
        (Event::Vrfy, state) => to(Action::Vrfy, state, state),
        (Event::Quit, _) => to(Action::Quit, State::End, State::End),
        (Event::Malformed, state) => to(Action::Malformed, state, state),
        (Event::Unknown, state) => to(Action::Unknown, state, state),

        _ => None,
    }
}
