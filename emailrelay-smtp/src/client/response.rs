//! SMTP reply assembly.

use core::fmt::{self, Display, Formatter};

/// A complete reply, possibly assembled from several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Text of each line, without the code and separator.
    pub lines: Vec<String>,
}

impl Reply {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The reply produced locally for a line that is not a reply at all.
    fn syntax_error(reason: String) -> Self {
        Self::new(500, vec![reason])
    }

    /// 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx.
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// All lines joined with a space.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    /// Whether an EHLO reply lists `keyword`. The first line is the greeting,
    /// so it is skipped.
    #[must_use]
    pub fn has_extension(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(keyword))
        })
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text())
    }
}

/// One parsed reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReplyLine {
    code: u16,
    is_last: bool,
    message: String,
}

/// Parse `[2-5]dd[ -]text`; exactly three digits is a final line.
fn parse_line(line: &str) -> Result<ReplyLine, String> {
    let bytes = line.as_bytes();
    let well_formed = bytes.len() >= 3
        && (b'2'..=b'5').contains(&bytes[0])
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_digit()
        && matches!(bytes.get(3), None | Some(b' ' | b'-'));

    if !well_formed {
        return Err(format!("Invalid reply line: '{line}'"));
    }

    let code = u16::from(bytes[0] - b'0') * 100
        + u16::from(bytes[1] - b'0') * 10
        + u16::from(bytes[2] - b'0');

    Ok(ReplyLine {
        code,
        is_last: bytes.get(3) != Some(&b'-'),
        message: line.get(4..).unwrap_or_default().to_string(),
    })
}

/// Collects reply lines until a reply is complete.
///
/// A malformed line, or a continuation whose code does not match, yields a
/// synthetic `500` reply instead of an error, so the state machine treats it
/// like any other unexpected reply.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    code: Option<u16>,
    lines: Vec<String>,
}

impl ReplyAssembler {
    pub fn push(&mut self, line: &str) -> Option<Reply> {
        let parsed = match parse_line(line) {
            Ok(parsed) => parsed,
            Err(reason) => return Some(self.reject(reason)),
        };

        match self.code {
            Some(code) if code != parsed.code => {
                return Some(self.reject(format!(
                    "Reply code mismatch in multi-line reply: expected {code}, got {}",
                    parsed.code
                )));
            }
            _ => self.code = Some(parsed.code),
        }

        self.lines.push(parsed.message);

        if parsed.is_last {
            self.code = None;
            Some(Reply::new(parsed.code, std::mem::take(&mut self.lines)))
        } else {
            None
        }
    }

    fn reject(&mut self, reason: String) -> Reply {
        self.code = None;
        self.lines.clear();
        Reply::syntax_error(reason)
    }
}
