//! Local instance identity.
//!
//! Every process in the cluster carries an opaque instance id, unique
//! per process lifetime, plus the host:port peers use to reach its
//! cluster RPC listener. The identity is an explicit value handed to
//! component constructors; there is no process-global singleton.

use uuid::Uuid;

/// Identity of this process within the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInstance {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl LocalInstance {
    /// Build an identity with a freshly generated id.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: generate_id(),
            host: host.into(),
            port,
        }
    }

    /// Build an identity with an explicit id (container orchestrators
    /// often assign stable pod names).
    pub fn with_id(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// The advertised `host:port` peers dial.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Generate an opaque instance id.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn test_address_format() {
        let local = LocalInstance::with_id("node-1", "10.0.0.5", 5310);
        assert_eq!(local.address(), "10.0.0.5:5310");
    }
}
