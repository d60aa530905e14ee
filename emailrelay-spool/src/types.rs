use std::fmt::{self, Display, Formatter};

const PREFIX: &str = "emailrelay";

/// Identifier for a queued message
///
/// The id is the common stem of the envelope and content file names:
/// `emailrelay.<pid>.<epoch>.<seq>`, where `epoch` is the time the store was
/// opened and `seq` is issued monotonically by that store. Ids order by
/// `(epoch, seq, pid)`, which approximates arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    epoch: u64,
    seq: u64,
    pid: u32,
}

impl MessageId {
    #[must_use]
    pub const fn new(pid: u32, epoch: u64, seq: u64) -> Self {
        Self { epoch, seq, pid }
    }

    /// Parse an id from a spool file name such as
    /// `emailrelay.123.1700000000.4.envelope.busy`.
    ///
    /// Anything that is not exactly the expected stem followed by an optional
    /// suffix is rejected, which also rules out path separators and `..`.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let mut parts = filename.splitn(5, '.');

        if parts.next()? != PREFIX {
            return None;
        }

        let pid = parts.next()?.parse().ok()?;
        let epoch = parts.next()?.parse().ok()?;
        let seq = parts.next()?.parse().ok()?;

        match parts.next() {
            None => Some(Self::new(pid, epoch, seq)),
            Some(suffix) if !suffix.is_empty() && !suffix.contains(['/', '\\']) => {
                Some(Self::new(pid, epoch, seq))
            }
            Some(_) => None,
        }
    }

    /// The process that created the message.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}.{}.{}.{}", self.pid, self.epoch, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_from_filename() {
        let id = MessageId::new(42, 1_700_000_000, 7);

        assert_eq!(id.to_string(), "emailrelay.42.1700000000.7");
        assert_eq!(
            MessageId::from_filename("emailrelay.42.1700000000.7.envelope"),
            Some(id)
        );
        assert_eq!(
            MessageId::from_filename("emailrelay.42.1700000000.7.envelope.busy"),
            Some(id)
        );
        assert_eq!(MessageId::from_filename("emailrelay.42.1700000000.7"), Some(id));

        assert!(MessageId::from_filename("other.42.1700000000.7.envelope").is_none());
        assert!(MessageId::from_filename("emailrelay.42.x.7.envelope").is_none());
        assert!(MessageId::from_filename("emailrelay.42.1700000000.7.").is_none());
        assert!(MessageId::from_filename("emailrelay.42.1700000000.7.a/b").is_none());
        assert!(MessageId::from_filename("../emailrelay.1.2.3.envelope").is_none());
    }

    #[test]
    fn test_message_id_ordering() {
        let first = MessageId::new(9, 100, 1);
        let second = MessageId::new(1, 100, 2);
        let later = MessageId::new(1, 200, 1);

        assert!(first < second);
        assert!(second < later);
    }
}
