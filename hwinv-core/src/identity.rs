/*!
Host identity attached to every client-table row.
*/

use crate::{InventoryError, Result};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

/// Files consulted, in order, when no identity is configured
pub const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Immutable identity of this host, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(Arc<str>);

impl ClientIdentity {
    /// Use an explicit identity
    pub fn new<S: AsRef<str>>(id: S) -> Result<Self> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return Err(InventoryError::validation("client identity cannot be empty"));
        }
        Ok(Self(Arc::from(id)))
    }

    /// Configured identity if present, otherwise one derived from the machine id
    pub fn resolve(configured: Option<&str>) -> Result<Self> {
        match configured {
            Some(id) if !id.trim().is_empty() => Self::new(id),
            _ => Self::from_machine_id_files(MACHINE_ID_PATHS),
        }
    }

    /// Derive the identity from the first readable machine id file
    pub fn from_machine_id_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        for path in paths {
            if let Ok(contents) = std::fs::read_to_string(path.as_ref()) {
                if let Ok(identity) = Self::from_machine_id(&contents) {
                    return Ok(identity);
                }
            }
        }
        Err(InventoryError::validation(
            "no client_id configured and no machine id available",
        ))
    }

    /// `host-` followed by the first 16 hex digits of the SHA-256 of the machine id.
    ///
    /// The raw machine id is never sent off the host.
    pub fn from_machine_id(machine_id: &str) -> Result<Self> {
        let machine_id = machine_id.trim();
        if machine_id.is_empty() {
            return Err(InventoryError::validation("machine id is empty"));
        }
        let digest = format!("{:x}", Sha256::digest(machine_id.as_bytes()));
        Ok(Self(Arc::from(format!("host-{}", &digest[..16]))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ClientIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}
