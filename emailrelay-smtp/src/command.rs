use core::fmt::{self, Display, Formatter};

use emailrelay_common::address;

/// ESMTP parameters of `MAIL FROM` that the relay understands.
///
/// `SIZE` (RFC 1870) and `BODY` (RFC 6152) are checked; anything else is
/// accepted and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailParameters {
    /// Declared message size in bytes.
    pub size: Option<u64>,
    /// `BODY=8BITMIME` was given.
    pub eight_bit: bool,
}

impl MailParameters {
    /// Parse whitespace separated `KEY=VALUE` or `FLAG` tokens.
    ///
    /// # Errors
    /// A duplicate `SIZE` or `BODY`, a non-numeric or zero `SIZE`, or an unknown
    /// `BODY` value.
    pub fn from_params_str(params: &str) -> Result<Self, String> {
        let mut parsed = Self::default();
        let mut seen_body = false;

        for token in params.split_whitespace() {
            let (key, value) = token.split_once('=').unwrap_or((token, ""));

            if key.eq_ignore_ascii_case("SIZE") {
                if parsed.size.is_some() {
                    return Err("Duplicate parameter 'SIZE' not allowed".to_string());
                }
                match value.parse::<u64>() {
                    Ok(0) => return Err(String::from("SIZE=0 is not allowed")),
                    Ok(size) => parsed.size = Some(size),
                    Err(_) => return Err(format!("Invalid SIZE value: {value}")),
                }
            } else if key.eq_ignore_ascii_case("BODY") {
                if seen_body {
                    return Err("Duplicate parameter 'BODY' not allowed".to_string());
                }
                seen_body = true;
                if value.eq_ignore_ascii_case("8BITMIME") {
                    parsed.eight_bit = true;
                } else if !value.eq_ignore_ascii_case("7BIT") {
                    return Err(format!("Invalid BODY value: {value}"));
                }
            }
        }

        Ok(parsed)
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ehlo(id) => write!(f, "EHLO {id}"),
            Self::Helo(id) => write!(f, "HELO {id}"),
        }
    }
}

/// A command line received by the server.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    /// An empty mailbox is the null reverse-path `<>`.
    MailFrom(String, MailParameters),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Help,
    Vrfy(String),
    Quit,
    /// A known command whose arguments did not parse.
    Malformed(String),
    /// Not a command we know.
    Invalid(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(variant) => variant.fmt(fmt),
            Self::MailFrom(from, _) => write!(fmt, "MAIL FROM:<{from}>"),
            Self::RcptTo(to) => write!(fmt, "RCPT TO:<{to}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Help => fmt.write_str("HELP"),
            Self::Vrfy(address) => write!(fmt, "VRFY {address}"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Malformed(reason) | Self::Invalid(reason) => fmt.write_str(reason),
        }
    }
}

/// Case-insensitive prefix strip.
fn strip_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let head = line.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| &line[keyword.len()..])
}

/// The keyword alone, or the keyword followed by a space and arguments.
fn verb<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = strip_keyword(line, keyword)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix(' ').map(str::trim)
    }
}

impl From<&str> for Command {
    fn from(command: &str) -> Self {
        let trimmed = command.trim();

        if let Some(rest) = strip_keyword(trimmed, "MAIL FROM:") {
            let path = match address::parse_path(rest) {
                Ok(path) => path,
                Err(err) => return Self::Malformed(format!("MAIL FROM: {err}")),
            };
            return match MailParameters::from_params_str(path.parameters) {
                Ok(parameters) => Self::MailFrom(path.mailbox, parameters),
                Err(err) => Self::Malformed(err),
            };
        }

        if let Some(rest) = strip_keyword(trimmed, "RCPT TO:") {
            return match address::parse_path(rest) {
                Ok(path) if path.mailbox.is_empty() => {
                    Self::Malformed("RCPT TO: empty address".to_string())
                }
                Ok(path) => Self::RcptTo(path.mailbox),
                Err(err) => Self::Malformed(format!("RCPT TO: {err}")),
            };
        }

        for (keyword, extended) in [("EHLO", true), ("HELO", false)] {
            if let Some(host) = verb(trimmed, keyword) {
                if host.is_empty() {
                    return Self::Malformed(format!("Expected hostname in {trimmed}"));
                }
                let host = host.to_string();
                return Self::Helo(if extended {
                    HeloVariant::Ehlo(host)
                } else {
                    HeloVariant::Helo(host)
                });
            }
        }

        if let Some(address) = verb(trimmed, "VRFY") {
            if address.is_empty() {
                return Self::Malformed("Expected an address in VRFY".to_string());
            }
            let address = address::parse_path(address)
                .map_or_else(|_| address.to_string(), |path| path.mailbox);
            return Self::Vrfy(address);
        }

        // NOOP and HELP may carry an argument, which is ignored
        if verb(trimmed, "NOOP").is_some() {
            Self::Noop
        } else if verb(trimmed, "HELP").is_some() {
            Self::Help
        } else if trimmed.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if trimmed.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if trimmed.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else {
            Self::Invalid(command.to_owned())
        }
    }
}

impl From<&[u8]> for Command {
    fn from(command: &[u8]) -> Self {
        std::str::from_utf8(command).map_or_else(
            |_| Self::Invalid("Unable to interpret command".to_string()),
            Self::from,
        )
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    // Idea copied from https://gitlab.com/erichdongubler-experiments/rust_case_permutations/blob/master/src/lib.rs#L97
    fn string_casing(string: &str) -> impl Iterator<Item = String> {
        let len = string.len();
        let num_cases = usize::pow(2, u32::try_from(len).unwrap_or(0));

        let (upper, lower) = string.chars().fold(
            (Vec::with_capacity(len), Vec::with_capacity(len)),
            |(mut upper, mut lower), c| {
                upper.push(c.to_ascii_uppercase());
                lower.push(c.to_ascii_lowercase());
                (upper, lower)
            },
        );

        (0..num_cases).map(move |i| {
            (0..len)
                .map(|idx| if (i >> idx) & 1 == 0 { lower[idx] } else { upper[idx] })
                .collect()
        })
    }

    #[test]
    fn commands_are_case_insensitive() {
        for quit in string_casing("quit") {
            assert_eq!(Command::from(quit.as_str()), Command::Quit);
        }
        for data in string_casing("data") {
            assert_eq!(Command::from(data.as_str()), Command::Data);
        }
        for mail in string_casing("mail from:") {
            assert_eq!(
                Command::from(format!("{mail}<a@b>").as_str()),
                Command::MailFrom("a@b".to_string(), MailParameters::default())
            );
        }
    }

    #[test]
    fn helo() {
        assert_eq!(
            Command::from("EHLO client.example"),
            Command::Helo(HeloVariant::Ehlo("client.example".to_string()))
        );
        assert_eq!(
            Command::from("helo client.example"),
            Command::Helo(HeloVariant::Helo("client.example".to_string()))
        );
        assert!(matches!(Command::from("EHLO"), Command::Malformed(_)));
        assert!(matches!(Command::from("EHLOX a"), Command::Invalid(_)));
    }

    #[test]
    fn mail_from() {
        assert_eq!(
            Command::from("MAIL FROM:<me@x>"),
            Command::MailFrom("me@x".to_string(), MailParameters::default())
        );
        assert_eq!(
            Command::from("MAIL FROM: <me@x> SIZE=100 BODY=8BITMIME"),
            Command::MailFrom(
                "me@x".to_string(),
                MailParameters {
                    size: Some(100),
                    eight_bit: true,
                }
            )
        );
        assert_eq!(
            Command::from("MAIL FROM:<>"),
            Command::MailFrom(String::new(), MailParameters::default())
        );
        assert!(matches!(Command::from("MAIL FROM:me@x"), Command::Malformed(_)));
        assert!(matches!(
            Command::from("MAIL FROM:<me@x> SIZE=0"),
            Command::Malformed(_)
        ));
        assert!(matches!(
            Command::from("MAIL FROM:<me@x> BODY=BINARYMIME"),
            Command::Malformed(_)
        ));
    }

    #[test]
    fn rcpt_to() {
        assert_eq!(
            Command::from("RCPT TO:<postmaster>"),
            Command::RcptTo("postmaster".to_string())
        );
        assert_eq!(
            Command::from("RCPT TO:<@relay.example:you@y>"),
            Command::RcptTo("you@y".to_string())
        );
        assert!(matches!(Command::from("RCPT TO:<>"), Command::Malformed(_)));
    }

    #[test]
    fn others() {
        assert_eq!(Command::from("RSET"), Command::Rset);
        assert_eq!(Command::from("NOOP"), Command::Noop);
        assert_eq!(Command::from("HELP DATA"), Command::Help);
        assert_eq!(
            Command::from("VRFY <postmaster>"),
            Command::Vrfy("postmaster".to_string())
        );
        assert_eq!(Command::from("VRFY someone"), Command::Vrfy("someone".to_string()));
        assert_eq!(
            Command::from("BDAT 100"),
            Command::Invalid("BDAT 100".to_string())
        );
        assert!(matches!(Command::from(&b"\xff\xfe"[..]), Command::Invalid(_)));
    }

    #[test]
    fn mail_parameters() {
        assert_eq!(
            MailParameters::from_params_str("size=42 ret=HDRS"),
            Ok(MailParameters {
                size: Some(42),
                eight_bit: false,
            })
        );
        assert!(MailParameters::from_params_str("SIZE=1 SIZE=2").is_err());
        assert!(MailParameters::from_params_str("SIZE=big").is_err());
        assert!(MailParameters::from_params_str("BODY=7BIT BODY=7BIT").is_err());
    }
}
