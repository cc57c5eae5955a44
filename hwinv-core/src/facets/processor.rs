/*!
Processor facet, one record per physical package.

Clock speed is left out on purpose: it moves with frequency scaling and
would turn every poll into a change.
*/

use super::{parse_attr, query_blocking, text_attr, FacetProvider, FacetTables};
use crate::environment::{AttributeMap, EnvironmentQuery, FacetSelector};
use crate::identity::ClientIdentity;
use crate::payload::Payload;
use crate::record::{RecordId, Snapshot, SnapshotRecord};
use crate::{InventoryError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

pub const PROCESSOR_TABLES: FacetTables = FacetTables::new("processor", "x_client_processor");

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessorRecord {
    /// Socket designation, e.g. `CPU0`
    pub socket: String,
    pub manufacturer: String,
    pub name: String,
    pub family: Option<u32>,
    pub model: Option<u32>,
    pub stepping: Option<u32>,
    pub microcode: Option<String>,
    pub cores: Option<u32>,
    pub logical_processors: u32,
}

impl ProcessorRecord {
    pub fn from_attributes(attrs: &AttributeMap) -> Result<Self> {
        let socket = text_attr(attrs, "socket");
        if socket.is_empty() {
            return Err(InventoryError::acquisition(
                FacetSelector::Processor.name(),
                "processor entry without a socket designation",
            ));
        }

        Ok(Self {
            socket,
            manufacturer: text_attr(attrs, "manufacturer"),
            name: text_attr(attrs, "name"),
            family: parse_attr(attrs, "family"),
            model: parse_attr(attrs, "model"),
            stepping: parse_attr(attrs, "stepping"),
            microcode: attrs.get("microcode").map(|m| m.trim().to_string()),
            cores: parse_attr(attrs, "cores"),
            logical_processors: parse_attr(attrs, "logical_processors").unwrap_or(0),
        })
    }
}

impl SnapshotRecord for ProcessorRecord {
    fn natural_key(&self) -> &str {
        &self.socket
    }
}

#[derive(Serialize)]
struct ProcessorRow<'a> {
    socket_designation: &'a str,
    manufacturer: &'a str,
    name: &'a str,
    family: Option<u32>,
    model: Option<u32>,
    stepping: Option<u32>,
    microcode: Option<&'a str>,
    number_of_cores: Option<u32>,
    number_of_logical_processors: u32,
}

#[derive(Serialize)]
struct ClientProcessorRow<'a> {
    socket_designation: &'a str,
    client_id: &'a ClientIdentity,
    processor_id: RecordId,
}

pub struct ProcessorProvider<Q> {
    query: Arc<Q>,
}

impl<Q: EnvironmentQuery> ProcessorProvider<Q> {
    pub fn new(query: Arc<Q>) -> Self {
        Self { query }
    }
}

#[async_trait]
impl<Q: EnvironmentQuery> FacetProvider for ProcessorProvider<Q> {
    type Record = ProcessorRecord;

    fn name(&self) -> &'static str {
        FacetSelector::Processor.name()
    }

    fn tables(&self) -> FacetTables {
        PROCESSOR_TABLES
    }

    async fn pull(&self) -> Result<Snapshot<ProcessorRecord>> {
        let maps = query_blocking(&self.query, FacetSelector::Processor).await?;
        let records = maps
            .iter()
            .map(ProcessorRecord::from_attributes)
            .collect::<Result<Vec<_>>>()?;
        Ok(Snapshot::new(records))
    }

    fn build_parent_payload(&self, records: &[ProcessorRecord]) -> Result<Payload> {
        Payload::from_rows(records.iter().map(|r| ProcessorRow {
            socket_designation: &r.socket,
            manufacturer: &r.manufacturer,
            name: &r.name,
            family: r.family,
            model: r.model,
            stepping: r.stepping,
            microcode: r.microcode.as_deref(),
            number_of_cores: r.cores,
            number_of_logical_processors: r.logical_processors,
        }))
    }

    fn build_client_payload(
        &self,
        records: &[ProcessorRecord],
        client: &ClientIdentity,
        parent_id: RecordId,
    ) -> Result<Payload> {
        Payload::from_rows(records.iter().map(|r| ClientProcessorRow {
            socket_designation: &r.socket,
            client_id: client,
            processor_id: parent_id,
        }))
    }
}
