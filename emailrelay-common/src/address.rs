//! Path parsing for the `MAIL FROM` and `RCPT TO` arguments.
//!
//! Only the envelope syntax matters here: the mailbox sits between the first `<`
//! and its matching `>`, optionally preceded by an obsolete `@a,@b:` source route.
//! Anything after the `>` is returned untouched as ESMTP parameters.

use thiserror::Error;

/// The local alias every relay must accept.
pub const POSTMASTER: &str = "postmaster";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Missing opening angle bracket '<'")]
    MissingOpenBracket,

    #[error("Missing closing angle bracket '>'")]
    MissingCloseBracket,

    #[error("Malformed source route")]
    InvalidSourceRoute,
}

/// A parsed `<...>` path plus whatever followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path<'a> {
    /// The mailbox with any source route removed. Empty for the null path `<>`.
    pub mailbox: String,
    /// ESMTP parameters following the closing bracket, trimmed.
    pub parameters: &'a str,
}

/// Parse the argument of `MAIL FROM:` or `RCPT TO:`.
///
/// # Errors
///
/// Returns an [`AddressError`] when the angle brackets are missing or the source
/// route has no terminating `:`.
pub fn parse_path(input: &str) -> Result<Path<'_>, AddressError> {
    let start = input.find('<').ok_or(AddressError::MissingOpenBracket)?;
    let rest = &input[start + 1..];

    // Quoted local parts may legitimately contain '>'
    let mut quoted = false;
    let mut escaped = false;
    let mut end = None;
    for (index, c) in rest.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            '>' if !quoted => {
                end = Some(index);
                break;
            }
            _ => {}
        }
    }

    let end = end.ok_or(AddressError::MissingCloseBracket)?;
    let mailbox = strip_source_route(&rest[..end])?;

    Ok(Path {
        mailbox: mailbox.trim().to_string(),
        parameters: rest[end + 1..].trim(),
    })
}

fn strip_source_route(path: &str) -> Result<&str, AddressError> {
    if path.starts_with('@') {
        path.split_once(':')
            .map(|(_, mailbox)| mailbox)
            .ok_or(AddressError::InvalidSourceRoute)
    } else {
        Ok(path)
    }
}

/// Split a mailbox into its user and (optional) domain.
///
/// The split happens at the last `@`, so quoted local parts containing `@`
/// keep their domain intact.
#[must_use]
pub fn split(mailbox: &str) -> (&str, Option<&str>) {
    match mailbox.rsplit_once('@') {
        Some((user, domain)) => (user, Some(domain)),
        None => (mailbox, None),
    }
}

/// True for the `postmaster` alias, ignoring case and surrounding whitespace.
#[must_use]
pub fn is_postmaster(user: &str) -> bool {
    user.trim().eq_ignore_ascii_case(POSTMASTER)
}
