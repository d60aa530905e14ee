//! Recipient classification.
//!
//! A [`Verifier`] decides whether a recipient is local, remote or refused. The
//! built-in rules only know about `postmaster`; anything more involved is
//! delegated to an external program.

use std::{
    io::Read,
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};

use emailrelay_common::{
    address::{self, POSTMASTER},
    internal,
};
use wait_timeout::ChildExt;

/// The verdict on one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub is_local: bool,
    /// The address to record, which may differ from the one given.
    pub address: String,
    /// Why the address was refused; empty when valid.
    pub reason: String,
    /// The refusal may not hold if the client tries again later.
    pub temporary: bool,
}

impl Verification {
    pub fn local(address: impl Into<String>) -> Self {
        Self {
            valid: true,
            is_local: true,
            address: address.into(),
            reason: String::new(),
            temporary: false,
        }
    }

    pub fn remote(address: impl Into<String>) -> Self {
        Self {
            valid: true,
            is_local: false,
            address: address.into(),
            reason: String::new(),
            temporary: false,
        }
    }

    pub fn invalid(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            is_local: false,
            address: address.into(),
            reason: reason.into(),
            temporary: false,
        }
    }

    #[must_use]
    pub const fn temporarily(mut self) -> Self {
        self.temporary = true;
        self
    }
}

pub trait Verifier: Send + Sync {
    /// Classify `address`, a recipient of a message from `from`.
    fn classify(&self, address: &str, from: &str) -> Verification;
}

/// The built-in rules.
///
/// - `postmaster`, with or without a local domain, is local
/// - any other mailbox without a domain, or at a local domain, is refused
/// - everything else is remote
#[derive(Debug, Clone)]
pub struct InternalVerifier {
    local_domains: Vec<String>,
}

impl InternalVerifier {
    /// `localhost` and `hostname` are always local domains.
    pub fn new<I, D>(hostname: &str, domains: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: AsRef<str>,
    {
        let mut local_domains: Vec<String> = ["localhost", hostname]
            .into_iter()
            .map(str::to_string)
            .chain(domains.into_iter().map(|d| d.as_ref().to_string()))
            .map(|domain| domain.trim().to_ascii_lowercase())
            .filter(|domain| !domain.is_empty())
            .collect();
        local_domains.sort_unstable();
        local_domains.dedup();

        Self { local_domains }
    }

    #[must_use]
    pub fn is_local_domain(&self, domain: &str) -> bool {
        let domain = domain.trim().trim_end_matches('.');
        self.local_domains
            .iter()
            .any(|local| local.eq_ignore_ascii_case(domain))
    }
}

impl Verifier for InternalVerifier {
    fn classify(&self, address: &str, _from: &str) -> Verification {
        match address::split(address) {
            (user, None) if address::is_postmaster(user) => Verification::local(POSTMASTER),
            (_, None) => Verification::invalid(address, "no such mailbox"),
            (user, Some(domain)) if self.is_local_domain(domain) => {
                if address::is_postmaster(user) {
                    Verification::local(address.trim())
                } else {
                    Verification::invalid(address, "no such mailbox")
                }
            }
            (_, Some(_)) => Verification::remote(address),
        }
    }
}

/// Runs a program for each recipient.
///
/// The program gets the address, its user and domain parts, the local host
/// name and the sender as arguments. Exit status 0 means local (the first
/// line of output, if any, replaces the address), 1 means remote, and
/// anything else refuses the address with the program's output as the reason.
/// A program that outlives its time limit is killed and the address is
/// refused temporarily.
#[derive(Debug, Clone)]
pub struct ExternalVerifier {
    program: PathBuf,
    hostname: String,
    limit: Duration,
}

impl ExternalVerifier {
    pub const DEFAULT_LIMIT: Duration = Duration::from_secs(60);

    pub fn new(program: impl Into<PathBuf>, hostname: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            hostname: hostname.into(),
            limit: Self::DEFAULT_LIMIT,
        }
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: Duration) -> Self {
        self.limit = limit;
        self
    }

    fn unavailable(address: &str) -> Verification {
        Verification::invalid(address, "recipient verification unavailable").temporarily()
    }
}

impl Verifier for ExternalVerifier {
    fn classify(&self, address: &str, from: &str) -> Verification {
        let (user, domain) = address::split(address);

        let spawned = Command::new(&self.program)
            .args([address, user, domain.unwrap_or(""), &self.hostname, from])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                internal!(
                    level = ERROR,
                    "Unable to run verifier {}: {err}",
                    self.program.display()
                );
                return Self::unavailable(address);
            }
        };

        let status = match child.wait_timeout(self.limit) {
            Ok(Some(status)) => status,
            Ok(None) => {
                internal!(
                    level = WARN,
                    "Verifier {} took longer than {:?} for <{address}>",
                    self.program.display(),
                    self.limit
                );
                let _ = child.kill();
                let _ = child.wait();
                return Self::unavailable(address);
            }
            Err(err) => {
                internal!(level = ERROR, "Unable to wait for verifier: {err}");
                let _ = child.kill();
                let _ = child.wait();
                return Self::unavailable(address);
            }
        };

        let stdout = read_all(child.stdout.take());
        let stderr = read_all(child.stderr.take());

        let first_line = stdout.lines().next().map(str::trim).unwrap_or_default();

        match status.code() {
            Some(0) if first_line.is_empty() => Verification::local(address),
            Some(0) => Verification::local(first_line),
            Some(1) => Verification::remote(address),
            code => {
                let reason = [stderr.trim(), stdout.trim()]
                    .into_iter()
                    .find(|text| !text.is_empty())
                    .unwrap_or("rejected")
                    .replace(['\r', '\n'], " ");
                internal!(
                    level = INFO,
                    "Verifier refused <{address}> with status {code:?}: {reason}"
                );
                Verification::invalid(address, reason)
            }
        }
    }
}

/// Whatever an exited child left in one of its pipes.
fn read_all(pipe: Option<impl Read>) -> String {
    let mut bytes = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut bytes);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn verifier() -> InternalVerifier {
        InternalVerifier::new("relay.example", ["Example.COM"])
    }

    #[test]
    fn test_postmaster_is_local() {
        let verifier = verifier();

        assert_eq!(
            verifier.classify("postmaster", "me@x"),
            Verification::local("postmaster")
        );
        assert_eq!(
            verifier.classify(" PostMaster ", "me@x"),
            Verification::local("postmaster")
        );
        assert!(verifier.classify("postmaster@localhost", "me@x").is_local);
        assert!(verifier.classify("postmaster@example.com", "me@x").is_local);
        assert!(verifier.classify("postmaster@relay.example.", "me@x").is_local);
    }

    #[test]
    fn test_other_local_users_are_refused() {
        let verifier = verifier();

        let verdict = verifier.classify("nobody@localhost", "me@x");
        assert!(!verdict.valid);
        assert!(!verdict.temporary);
        assert!(!verifier.classify("nobody", "me@x").valid);
        assert!(!verifier.classify("root@EXAMPLE.com", "me@x").valid);
    }

    #[test]
    fn test_other_domains_are_remote() {
        let verdict = verifier().classify("someone@example.net", "me@x");
        assert_eq!(verdict, Verification::remote("someone@example.net"));
    }

    #[cfg(unix)]
    #[test]
    fn test_external_verifier_exit_codes() {
        let verdict = ExternalVerifier::new("/bin/true", "relay.example").classify("a@b", "me@x");
        assert_eq!(verdict, Verification::local("a@b"));

        let verdict = ExternalVerifier::new("/bin/false", "relay.example").classify("a@b", "me@x");
        assert_eq!(verdict, Verification::remote("a@b"));

        let verdict =
            ExternalVerifier::new("/nonexistent/verifier", "relay.example").classify("a@b", "me@x");
        assert!(!verdict.valid);
        assert!(verdict.temporary);
    }

    #[cfg(unix)]
    #[test]
    fn test_external_verifier_refusal_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(&dir, "refuse", "echo \"mailbox $2 is full\" >&2\nexit 2\n");

        let verdict = ExternalVerifier::new(program, "relay.example").classify("bob@b", "me@x");
        assert!(!verdict.valid);
        assert!(!verdict.temporary);
        assert_eq!(verdict.reason, "mailbox bob is full");
    }

    #[cfg(unix)]
    #[test]
    fn test_external_verifier_is_killed_after_its_limit() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(&dir, "stall", "sleep 30\n");

        let started = std::time::Instant::now();
        let verdict = ExternalVerifier::new(program, "relay.example")
            .with_limit(Duration::from_millis(200))
            .classify("a@b", "me@x");

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!verdict.valid);
        assert!(verdict.temporary);
        assert_eq!(verdict.reason, "recipient verification unavailable");
    }

    #[cfg(unix)]
    fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
