//! Deterministic naming of the single out-of-process helper for a host.

use sha2::{Digest, Sha256};

use crate::errors::EngineError;

/// Prefix of every canonical helper name.
pub const WORKER_NAME_PREFIX: &str = "htp_worker_";

/// Identity of the helper process serving a given host node.
///
/// A pure function of the local node name; never invented or cached
/// inconsistently. The same node name always yields the same helper name
/// and the same derived port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    short_name: String,
    host_name: String,
}

impl WorkerIdentity {
    /// Parse a local node name of the form `shortname@hostname`. Anything
    /// else is a configuration error, raised before any connection attempt.
    pub fn from_node_name(node: &str) -> Result<Self, EngineError> {
        let mut parts = node.split('@');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(short), Some(host), None) if !short.is_empty() && !host.is_empty() => Ok(Self {
                short_name: short.to_string(),
                host_name: host.to_string(),
            }),
            _ => Err(EngineError::InvalidIdentity(node.to_string())),
        }
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Canonical helper name, `htp_worker_<short>@<host>`.
    pub fn canonical_name(&self) -> String {
        format!(
            "{WORKER_NAME_PREFIX}{}@{}",
            self.short_name, self.host_name
        )
    }

    /// Stable loopback port for the helper, hashed from the canonical name
    /// into the dynamic port range. Overridable via
    /// [`EngineConfig::worker_port`](crate::EngineConfig).
    pub fn derived_port(&self) -> u16 {
        let digest = Sha256::digest(self.canonical_name().as_bytes());
        49152 + u16::from_be_bytes([digest[0], digest[1]]) % 16384
    }
}
