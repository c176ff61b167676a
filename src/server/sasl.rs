//! SASL negotiation surface.
//!
//! The server advertises the SCRAM family; channel-binding (`-PLUS`)
//! variants are offered only when the transport can expose `tls-unique`
//! (TLS < 1.3). Credential verification itself lives behind the
//! [`Authenticator`] seam — the wire negotiation here feeds it opaque
//! client responses and relays its challenges.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// SASL namespace of RFC 6120.
pub const SASL_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Supported SASL mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaslMechanism {
    ScramSha1,
    ScramSha1Plus,
    ScramSha256,
    ScramSha256Plus,
    ScramSha512,
    ScramSha512Plus,
    ScramSha3_512,
    ScramSha3_512Plus,
}

impl SaslMechanism {
    /// Wire name of the mechanism.
    pub fn name(&self) -> &'static str {
        match self {
            SaslMechanism::ScramSha1 => "SCRAM-SHA-1",
            SaslMechanism::ScramSha1Plus => "SCRAM-SHA-1-PLUS",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha256Plus => "SCRAM-SHA-256-PLUS",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
            SaslMechanism::ScramSha512Plus => "SCRAM-SHA-512-PLUS",
            SaslMechanism::ScramSha3_512 => "SCRAM-SHA3-512",
            SaslMechanism::ScramSha3_512Plus => "SCRAM-SHA3-512-PLUS",
        }
    }

    pub fn from_name(name: &str) -> Option<SaslMechanism> {
        match name {
            "SCRAM-SHA-1" => Some(SaslMechanism::ScramSha1),
            "SCRAM-SHA-1-PLUS" => Some(SaslMechanism::ScramSha1Plus),
            "SCRAM-SHA-256" => Some(SaslMechanism::ScramSha256),
            "SCRAM-SHA-256-PLUS" => Some(SaslMechanism::ScramSha256Plus),
            "SCRAM-SHA-512" => Some(SaslMechanism::ScramSha512),
            "SCRAM-SHA-512-PLUS" => Some(SaslMechanism::ScramSha512Plus),
            "SCRAM-SHA3-512" => Some(SaslMechanism::ScramSha3_512),
            "SCRAM-SHA3-512-PLUS" => Some(SaslMechanism::ScramSha3_512Plus),
            _ => None,
        }
    }

    /// Whether the mechanism requires TLS channel binding.
    pub fn channel_binding(&self) -> bool {
        matches!(
            self,
            SaslMechanism::ScramSha1Plus
                | SaslMechanism::ScramSha256Plus
                | SaslMechanism::ScramSha512Plus
                | SaslMechanism::ScramSha3_512Plus
        )
    }
}

/// Filter the advertised mechanism list by transport capability.
pub fn advertised(mechanisms: &[SaslMechanism], supports_cb: bool) -> Vec<SaslMechanism> {
    mechanisms
        .iter()
        .copied()
        .filter(|m| supports_cb || !m.channel_binding())
        .collect()
}

/// One step's outcome in a SASL exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslOutcome {
    /// Send a challenge and await the next response.
    Challenge(Vec<u8>),
    /// Authentication succeeded for this username.
    Success { username: String },
    /// Authentication failed; the wire reply is `not-authorized`.
    Failure,
}

/// An in-flight SASL exchange.
#[async_trait]
pub trait AuthSession: Send + Sync {
    async fn step(&mut self, response: &[u8]) -> Result<SaslOutcome>;
}

/// Credential backend seam.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Mechanisms this backend can verify.
    fn mechanisms(&self) -> Vec<SaslMechanism>;

    /// Begin an exchange for one mechanism.
    async fn start(&self, mechanism: SaslMechanism) -> Result<Box<dyn AuthSession>>;
}

/// Development and test authenticator with in-memory credentials.
///
/// Accepts a single-round `<NUL>username<NUL>password` proof for any
/// advertised mechanism. A production deployment supplies a real SCRAM
/// backend behind the [`Authenticator`] seam instead.
pub struct StaticAuthenticator {
    users: RwLock<HashMap<String, String>>,
    mechanisms: Vec<SaslMechanism>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            mechanisms: vec![
                SaslMechanism::ScramSha1,
                SaslMechanism::ScramSha256,
                SaslMechanism::ScramSha512,
                SaslMechanism::ScramSha3_512,
            ],
        }
    }

    pub async fn add_user(&self, username: impl Into<String>, password: impl Into<String>) {
        self.users
            .write()
            .await
            .insert(username.into(), password.into());
    }

    async fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .read()
            .await
            .get(username)
            .is_some_and(|p| p == password)
    }
}

impl Default for StaticAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

struct StaticSession {
    users: HashMap<String, String>,
}

#[async_trait]
impl AuthSession for StaticSession {
    async fn step(&mut self, response: &[u8]) -> Result<SaslOutcome> {
        let text = std::str::from_utf8(response)
            .map_err(|_| Error::Parse("sasl response is not utf-8".into()))?;
        let mut parts = text.split('\0');
        let _authzid = parts.next();
        let (Some(username), Some(password)) = (parts.next(), parts.next()) else {
            return Ok(SaslOutcome::Failure);
        };
        if self.users.get(username).is_some_and(|p| p == password) {
            Ok(SaslOutcome::Success {
                username: username.to_owned(),
            })
        } else {
            Ok(SaslOutcome::Failure)
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    fn mechanisms(&self) -> Vec<SaslMechanism> {
        self.mechanisms.clone()
    }

    async fn start(&self, mechanism: SaslMechanism) -> Result<Box<dyn AuthSession>> {
        if !self.mechanisms.contains(&mechanism) {
            return Err(Error::Config(format!(
                "unsupported mechanism: {}",
                mechanism.name()
            )));
        }
        Ok(Box::new(StaticSession {
            users: self.users.read().await.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mechanism_name_round_trip() {
        for m in [
            SaslMechanism::ScramSha1,
            SaslMechanism::ScramSha1Plus,
            SaslMechanism::ScramSha256,
            SaslMechanism::ScramSha256Plus,
            SaslMechanism::ScramSha512,
            SaslMechanism::ScramSha512Plus,
            SaslMechanism::ScramSha3_512,
            SaslMechanism::ScramSha3_512Plus,
        ] {
            assert_eq!(SaslMechanism::from_name(m.name()), Some(m));
        }
        assert_eq!(SaslMechanism::from_name("PLAIN"), None);
    }

    #[test]
    fn test_plus_variants_require_channel_binding() {
        let all = [
            SaslMechanism::ScramSha1,
            SaslMechanism::ScramSha1Plus,
            SaslMechanism::ScramSha256,
            SaslMechanism::ScramSha256Plus,
        ];
        let without_cb = advertised(&all, false);
        assert!(!without_cb.iter().any(|m| m.channel_binding()));
        assert_eq!(without_cb.len(), 2);

        let with_cb = advertised(&all, true);
        assert_eq!(with_cb.len(), 4);
    }

    #[tokio::test]
    async fn test_static_authenticator_accepts_good_credentials() {
        let auth = StaticAuthenticator::new();
        auth.add_user("alice", "xyzzy").await;

        let mut session = auth.start(SaslMechanism::ScramSha256).await.unwrap();
        let outcome = session.step(b"\0alice\0xyzzy").await.unwrap();
        assert_eq!(
            outcome,
            SaslOutcome::Success {
                username: "alice".into()
            }
        );
    }

    #[tokio::test]
    async fn test_static_authenticator_rejects_bad_credentials() {
        let auth = StaticAuthenticator::new();
        auth.add_user("alice", "xyzzy").await;

        let mut session = auth.start(SaslMechanism::ScramSha256).await.unwrap();
        assert_eq!(
            session.step(b"\0alice\0wrong").await.unwrap(),
            SaslOutcome::Failure
        );
        assert_eq!(
            session.step(b"garbage").await.unwrap(),
            SaslOutcome::Failure
        );
    }
}
