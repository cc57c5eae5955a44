//! Agent configuration
//!
//! The configuration is read once at startup, validated, and then shared
//! read-only (`Arc<AgentConfig>`) by the orchestrator and every facet task.
//! Every field has a default so a partial JSON file is enough.

use crate::{InventoryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Facet names the agent knows how to build
pub const KNOWN_FACETS: &[&str] = &["firmware", "processor"];

/// Collection service endpoint and credentials
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL of the REST API; tables are addressed as `{url}/{table}`
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Process-wide agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host identity; derived from the machine id when absent
    pub client_id: Option<String>,
    /// Poll interval used by facets without an override
    pub base_interval_secs: u64,
    /// Delay before the first cycle of every facet
    pub initial_delay_secs: u64,
    /// Per-facet poll interval overrides, keyed by facet name
    pub facet_intervals: HashMap<String, u64>,
    pub pull_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    /// How long in-flight cycles may run after shutdown is requested
    pub shutdown_grace_secs: u64,
    /// Facets to register, by name
    pub facets: Vec<String>,
    pub endpoint: EndpointConfig,
    /// Used by the file monitoring subsystem, not by the inventory loop
    pub directories_to_exclude: Vec<PathBuf>,
    /// Used by the file monitoring subsystem, not by the inventory loop
    pub file_types_to_monitor: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            base_interval_secs: 300,
            initial_delay_secs: 0,
            facet_intervals: HashMap::new(),
            pull_timeout_secs: 30,
            upload_timeout_secs: 30,
            shutdown_grace_secs: 10,
            facets: KNOWN_FACETS.iter().map(|s| s.to_string()).collect(),
            endpoint: EndpointConfig::default(),
            directories_to_exclude: Vec::new(),
            file_types_to_monitor: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            InventoryError::validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }

    /// Poll interval for a facet, honouring per-facet overrides
    pub fn interval_for(&self, facet: &str) -> Duration {
        self.facet_intervals
            .get(facet)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| self.base_interval())
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    /// Timeout of a single HTTP attempt
    ///
    /// A third of the upload bound, so a timed-out attempt still leaves room
    /// for the transport to retry before the orchestrator gives up.
    pub fn request_timeout(&self) -> Duration {
        self.upload_timeout() / 3
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Validate the configuration
    ///
    /// `require_endpoint` is false for dry runs, which never talk to the
    /// collection service.
    pub fn validate(&self, require_endpoint: bool) -> Result<()> {
        if self.base_interval_secs == 0 {
            return Err(InventoryError::validation(
                "base_interval_secs must be greater than zero",
            ));
        }
        if let Some((facet, _)) = self.facet_intervals.iter().find(|(_, secs)| **secs == 0) {
            return Err(InventoryError::validation(format!(
                "interval override for facet '{facet}' must be greater than zero"
            )));
        }
        if self.pull_timeout_secs == 0 || self.upload_timeout_secs == 0 {
            return Err(InventoryError::validation("timeouts must be greater than zero"));
        }
        if self.facets.is_empty() {
            return Err(InventoryError::validation("at least one facet must be enabled"));
        }
        if let Some(unknown) = self
            .facets
            .iter()
            .chain(self.facet_intervals.keys())
            .find(|name| !KNOWN_FACETS.contains(&name.as_str()))
        {
            return Err(InventoryError::validation(format!(
                "unknown facet '{unknown}' (known: {})",
                KNOWN_FACETS.join(", ")
            )));
        }
        let mut seen = HashSet::new();
        if let Some(repeated) = self.facets.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(InventoryError::validation(format!(
                "facet '{repeated}' is listed more than once"
            )));
        }
        if require_endpoint {
            match self.endpoint.url.as_deref() {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => {
                    return Err(InventoryError::validation(format!(
                        "endpoint url must be http(s): {url}"
                    )));
                }
                None => {
                    return Err(InventoryError::validation("endpoint url is required"));
                }
            }
        }
        Ok(())
    }
}
