//! Implements server-side SASL negotiation

use std::collections::HashMap;

use bytes::Bytes;

/// The authenticated identity produced by a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Principal name, typically the authcid
    pub principal: String,
}

impl Subject {
    /// A subject for `principal`.
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
        }
    }
}

/// Outcome of one SASL round.
#[derive(Debug)]
pub enum SaslOutcome {
    /// Negotiation finished; the connection proceeds to tuning
    Success(Subject),

    /// More rounds needed; the challenge rides a `Connection.Secure`
    Challenge(Bytes),

    /// Negotiation failed; the connection is closed
    Failure,
}

/// One in-flight SASL negotiation.
///
/// Created on `Connection.Start-Ok`, fed every `Secure-Ok` response, and
/// disposed exactly once on the terminal outcome.
pub trait SaslServer: Send {
    /// The mechanism being negotiated.
    fn mechanism(&self) -> &str;

    /// Consumes one client response and advances the negotiation.
    fn respond(&mut self, response: &[u8]) -> SaslOutcome;
}

/// The authentication provider attached to a port.
pub trait AuthenticationProvider: Send + Sync {
    /// Mechanism names to advertise in `Connection.Start`, in order of
    /// preference.
    fn mechanisms(&self) -> Vec<String>;

    /// Creates a negotiation for `mechanism`, or `None` when the
    /// mechanism is not offered.
    fn create_sasl_server(&self, mechanism: &str) -> Option<Box<dyn SaslServer>>;
}

/// Mechanism name for PLAIN.
pub const PLAIN: &str = "PLAIN";

/// A PLAIN authentication provider over an in-memory credential map.
#[derive(Debug, Default)]
pub struct PlainAuthenticationProvider {
    users: HashMap<String, String>,
}

impl PlainAuthenticationProvider {
    /// An empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user; replaces any existing password for `username`.
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

impl AuthenticationProvider for PlainAuthenticationProvider {
    fn mechanisms(&self) -> Vec<String> {
        vec![PLAIN.to_string()]
    }

    fn create_sasl_server(&self, mechanism: &str) -> Option<Box<dyn SaslServer>> {
        if mechanism != PLAIN {
            return None;
        }
        Some(Box::new(PlainSaslServer {
            users: self.users.clone(),
        }))
    }
}

/// PLAIN negotiation: a single `authzid NUL authcid NUL passwd` response.
#[derive(Debug)]
struct PlainSaslServer {
    users: HashMap<String, String>,
}

impl PlainSaslServer {
    fn validate(&self, response: &[u8]) -> Option<Subject> {
        let mut split = response.split(|b| *b == 0u8);
        let _authzid = split.next()?;
        let authcid = std::str::from_utf8(split.next()?).ok()?;
        let passwd = split.next()?;
        if split.next().is_some() {
            return None;
        }
        match self.users.get(authcid) {
            Some(expected) if expected.as_bytes() == passwd => Some(Subject::new(authcid)),
            _ => None,
        }
    }
}

impl SaslServer for PlainSaslServer {
    fn mechanism(&self) -> &str {
        PLAIN
    }

    fn respond(&mut self, response: &[u8]) -> SaslOutcome {
        match self.validate(response) {
            Some(subject) => SaslOutcome::Success(subject),
            None => SaslOutcome::Failure,
        }
    }
}
