//! The envelope file codec.
//!
//! An envelope is a short line-oriented text file. Every line is
//! `X-MailRelay-<Key>: <value>` terminated by CRLF, in this order:
//!
//! ```text
//! X-MailRelay-Format: #2821.3
//! X-MailRelay-Content: 8bit
//! X-MailRelay-From: sender@example.com
//! X-MailRelay-ToCount: 2
//! X-MailRelay-To-Remote: someone@example.net
//! X-MailRelay-To-Local: postmaster
//! X-MailRelay-Authentication:
//! X-MailRelay-Client: 192.0.2.1
//! X-MailRelay-End: 1
//! ```
//!
//! External tooling inspects the spool, so field names and positions are fixed.
//! Changing the field set means changing [`FORMAT`]. A `Reason` line may follow the
//! end marker once a message has failed.

use std::io::{self, BufRead, Write};

use crate::error::EnvelopeError;

/// Format version tag; files carrying anything else are unreadable.
pub const FORMAT: &str = "#2821.3";

const PREFIX: &str = "X-MailRelay-";
const CRLF: &str = "\r\n";

/// One accepted recipient, tagged with the locality decided at RCPT time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub is_local: bool,
}

impl Recipient {
    pub fn local(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            is_local: true,
        }
    }

    pub fn remote(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            is_local: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Set once any content byte had the top bit set.
    pub eight_bit: bool,
    pub from: String,
    /// Recipients in the order they were accepted.
    pub recipients: Vec<Recipient>,
    /// Authenticated client identity, empty when the client did not authenticate.
    pub authentication: String,
    /// Peer address of the submitting client.
    pub client: String,
}

impl Envelope {
    pub fn remote_recipients(&self) -> impl Iterator<Item = &str> {
        self.recipients
            .iter()
            .filter(|rcpt| !rcpt.is_local)
            .map(|rcpt| rcpt.address.as_str())
    }

    pub fn local_recipients(&self) -> impl Iterator<Item = &str> {
        self.recipients
            .iter()
            .filter(|rcpt| rcpt.is_local)
            .map(|rcpt| rcpt.address.as_str())
    }

    #[must_use]
    pub fn has_remote_recipients(&self) -> bool {
        self.recipients.iter().any(|rcpt| !rcpt.is_local)
    }

    #[must_use]
    pub fn has_local_recipients(&self) -> bool {
        self.recipients.iter().any(|rcpt| rcpt.is_local)
    }

    /// Serialise the envelope, end marker included.
    ///
    /// # Errors
    /// Propagates any error from the writer.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_field(out, "Format", FORMAT)?;
        write_field(out, "Content", if self.eight_bit { "8bit" } else { "7bit" })?;
        write_field(out, "From", &self.from)?;
        write_field(out, "ToCount", &self.recipients.len().to_string())?;
        for rcpt in &self.recipients {
            let key = if rcpt.is_local { "To-Local" } else { "To-Remote" };
            write_field(out, key, &rcpt.address)?;
        }
        write_field(out, "Authentication", &self.authentication)?;
        write_field(out, "Client", &self.client)?;
        write_field(out, "End", "1")?;
        out.flush()
    }

    /// Parse an envelope, requiring every field in order and the end marker.
    ///
    /// # Errors
    /// Returns [`EnvelopeError::NoEnd`] for a truncated file and the more specific
    /// variants for anything malformed.
    pub fn read_from<R: BufRead>(input: R) -> Result<Self, EnvelopeError> {
        let mut lines = Lines { inner: input.lines() };

        let format = lines.field("Format")?;
        if format != FORMAT {
            return Err(EnvelopeError::InvalidFormat(format!(
                "unsupported version {format}"
            )));
        }

        let eight_bit = match lines.field("Content")?.as_str() {
            "8bit" => true,
            "7bit" => false,
            other => {
                return Err(EnvelopeError::InvalidFormat(format!(
                    "unknown content type {other}"
                )));
            }
        };

        let from = lines.field("From")?;

        let count = lines.field("ToCount")?;
        let count: usize = count
            .parse()
            .map_err(|_| EnvelopeError::InvalidCount(count))?;

        let mut recipients = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let line = lines.next_line()?;
            let rcpt = if let Some(address) = value_of(&line, "To-Local") {
                Recipient::local(address)
            } else if let Some(address) = value_of(&line, "To-Remote") {
                Recipient::remote(address)
            } else {
                return Err(EnvelopeError::InvalidRecipientLine(line));
            };
            recipients.push(rcpt);
        }

        let authentication = lines.field("Authentication")?;
        let client = lines.field("Client")?;
        lines.field("End")?;

        Ok(Self {
            eight_bit,
            from,
            recipients,
            authentication,
            client,
        })
    }
}

/// The line appended to a failed envelope.
#[must_use]
pub fn reason_line(reason: &str) -> String {
    // Keep the file line-oriented whatever the reason text contains
    let reason = reason.replace(['\r', '\n'], " ");
    format!("{PREFIX}Reason: {reason}{CRLF}")
}

fn write_field<W: Write>(out: &mut W, key: &str, value: &str) -> io::Result<()> {
    write!(out, "{PREFIX}{key}: {value}{CRLF}")
}

fn value_of<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(PREFIX)?.strip_prefix(key)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

struct Lines<R> {
    inner: io::Lines<R>,
}

impl<R: BufRead> Lines<R> {
    fn next_line(&mut self) -> Result<String, EnvelopeError> {
        match self.inner.next() {
            None => Err(EnvelopeError::NoEnd),
            Some(line) => {
                let mut line = line?;
                if line.ends_with('\r') {
                    line.pop();
                }
                Ok(line)
            }
        }
    }

    fn field(&mut self, key: &'static str) -> Result<String, EnvelopeError> {
        let line = self.next_line()?;
        value_of(&line, key)
            .map(str::to_string)
            .ok_or(EnvelopeError::MissingField(key))
    }
}
