/*!
Hardware facet providers.

A facet is one category of hardware (firmware, processors, ...). Each facet
implements [`FacetProvider`]: it knows how to pull its current records from
the environment and how to shape them into the two payloads the collection
service expects. Everything else (diffing, reporting, keeping the last
snapshot) is the orchestrator's job, so adding a facet never touches the
reporting protocol.
*/

pub mod firmware;
pub mod processor;

use crate::environment::{AttributeMap, EnvironmentQuery, FacetSelector};
use crate::identity::ClientIdentity;
use crate::orchestrator::Orchestrator;
use crate::payload::Payload;
use crate::record::{RecordId, Snapshot, SnapshotRecord};
use crate::{InventoryError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

pub use firmware::{FirmwareProvider, FirmwareRecord};
pub use processor::{ProcessorProvider, ProcessorRecord};

/// Parent and client table names for one facet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacetTables {
    /// Table holding the facet's descriptive rows
    pub parent: &'static str,
    /// Per-host cross-reference table keyed by the parent's id
    pub client: &'static str,
}

impl FacetTables {
    pub const fn new(parent: &'static str, client: &'static str) -> Self {
        Self { parent, client }
    }
}

/// One hardware facet: pull records and shape them for reporting
#[async_trait]
pub trait FacetProvider: Send + Sync + 'static {
    type Record: SnapshotRecord;

    /// Facet name used in logs, metrics and configuration
    fn name(&self) -> &'static str;

    fn tables(&self) -> FacetTables;

    /// Query the environment for the facet's current instances
    ///
    /// # Errors
    /// * `InventoryError::Acquisition` - the environment could not be queried
    ///   or returned data the facet cannot interpret
    async fn pull(&self) -> Result<Snapshot<Self::Record>>;

    /// Rows for the parent table
    fn build_parent_payload(&self, records: &[Self::Record]) -> Result<Payload>;

    /// Cross-reference rows for the client table: each record's natural key,
    /// the host identity and the id just assigned to the parent upload
    fn build_client_payload(
        &self,
        records: &[Self::Record],
        client: &ClientIdentity,
        parent_id: RecordId,
    ) -> Result<Payload>;
}

/// Run a blocking environment query on the blocking thread pool
pub(crate) async fn query_blocking<Q: EnvironmentQuery>(
    query: &Arc<Q>,
    selector: FacetSelector,
) -> Result<Vec<AttributeMap>> {
    let query = Arc::clone(query);
    tokio::task::spawn_blocking(move || query.query(selector))
        .await
        .map_err(|e| {
            InventoryError::acquisition(selector.name(), format!("query task failed: {e}"))
        })?
}

/// Parse an optional attribute; absent or malformed values become `None`
pub(crate) fn parse_attr<T: FromStr>(attrs: &AttributeMap, key: &str) -> Option<T> {
    attrs.get(key).and_then(|raw| raw.trim().parse().ok())
}

pub(crate) fn text_attr(attrs: &AttributeMap, key: &str) -> String {
    attrs.get(key).map(|s| s.trim().to_string()).unwrap_or_default()
}

/// Register the named facets, all reading from the same environment
///
/// A facet may be named once; a second task would keep its own baseline and
/// report every change twice.
pub fn register_enabled<Q: EnvironmentQuery>(
    orchestrator: &mut Orchestrator,
    query: Arc<Q>,
    enabled: &[String],
) -> Result<()> {
    let mut seen = HashSet::new();
    for name in enabled {
        if !seen.insert(name.as_str()) {
            return Err(InventoryError::validation(format!(
                "facet '{name}' is listed more than once"
            )));
        }
        match name.as_str() {
            "firmware" => orchestrator.register(FirmwareProvider::new(Arc::clone(&query))),
            "processor" => orchestrator.register(ProcessorProvider::new(Arc::clone(&query))),
            other => {
                return Err(InventoryError::validation(format!("unknown facet '{other}'")));
            }
        }
    }
    Ok(())
}
