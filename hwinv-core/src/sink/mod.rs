/*!
Reporting sinks.

[`ReportingSink`] is the single point every facet reports through: it takes a
table name and a payload, performs one upload and hands back the id the
collection service assigned to the inserted row. It never retries; whether a
failed cycle is repeated is the orchestrator's decision.

Sinks that talk to a real service delegate the wire work to a [`Transport`].
*/

pub mod memory;
#[cfg(feature = "rest")]
pub mod rest;

use crate::payload::Payload;
use crate::record::RecordId;
use crate::Result;
use async_trait::async_trait;
use tracing::debug;

pub use memory::{MemorySink, RecordedUpload};
#[cfg(feature = "rest")]
pub use rest::RestTransport;

/// Delivers payloads to named tables of the collection service
#[async_trait]
pub trait ReportingSink: Send + Sync {
    /// Upload `payload` to `table`, single attempt
    ///
    /// # Returns
    /// The id assigned to the inserted row
    ///
    /// # Errors
    /// * `InventoryError::Upload` - delivery failed
    /// * `InventoryError::InvalidResponse` - the service did not return an id
    async fn upload(&self, table: &str, payload: &Payload) -> Result<RecordId>;
}

/// Wire-level delivery of serialized payloads
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, table: &str, body: String) -> Result<RecordId>;
}

/// Sink that serializes payloads and hands them to a transport
pub struct TransportSink<T> {
    transport: T,
}

impl<T: Transport> TransportSink<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: Transport> ReportingSink for TransportSink<T> {
    async fn upload(&self, table: &str, payload: &Payload) -> Result<RecordId> {
        let body = payload.to_json()?;
        debug!(table, rows = payload.len(), bytes = body.len(), "uploading payload");
        self.transport.send(table, body).await
    }
}
