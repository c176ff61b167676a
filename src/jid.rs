//! XMPP addresses (JIDs).
//!
//! A JID is the three-part identity `node@domain/resource`. A *bare* JID
//! is `node@domain`; a *full* JID also carries a resource. Any part may
//! be absent except the domain.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum length of each JID part, in bytes (RFC 7622 §3.1).
pub const MAX_PART_LENGTH: usize = 1023;

/// Error produced when parsing or assembling a JID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JidError {
    #[error("jid: empty domain")]
    EmptyDomain,
    #[error("jid: empty {0} part")]
    EmptyPart(&'static str),
    #[error("jid: {0} part exceeds {MAX_PART_LENGTH} bytes")]
    PartTooLong(&'static str),
}

/// An XMPP address.
///
/// Serialized as its canonical string form so it can travel inside KV
/// records and cluster RPC frames unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Assemble a JID from its parts, validating each.
    pub fn new(
        node: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, JidError> {
        if domain.is_empty() {
            return Err(JidError::EmptyDomain);
        }
        check_part(Some(domain), "domain")?;
        check_part(node, "node")?;
        check_part(resource, "resource")?;
        Ok(Self {
            node: node.map(str::to_owned),
            domain: domain.to_owned(),
            resource: resource.map(str::to_owned),
        })
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Whether the JID carries a resource.
    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The `node@domain` projection of this JID.
    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Replace the resource part, yielding a full JID.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, JidError> {
        Jid::new(self.node(), self.domain(), Some(resource))
    }
}

fn check_part(part: Option<&str>, name: &'static str) -> Result<(), JidError> {
    match part {
        None => Ok(()),
        Some("") => Err(JidError::EmptyPart(name)),
        Some(p) if p.len() > MAX_PART_LENGTH => Err(JidError::PartTooLong(name)),
        Some(_) => Ok(()),
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}@")?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, resource) = match s.split_once('/') {
            Some((rest, resource)) => (rest, Some(resource)),
            None => (s, None),
        };
        let (node, domain) = match rest.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, rest),
        };
        Jid::new(node, domain, resource)
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> String {
        jid.to_string()
    }
}
