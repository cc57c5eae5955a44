/*!
In-memory sink.

Keeps every upload instead of sending it anywhere and hands out increasing
ids. Backs dry runs of the agent and the orchestrator tests.
*/

use super::ReportingSink;
use crate::payload::Payload;
use crate::record::RecordId;
use crate::{InventoryError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// One upload accepted by a [`MemorySink`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpload {
    pub table: String,
    pub payload: Payload,
    pub assigned: RecordId,
}

pub struct MemorySink {
    uploads: Mutex<Vec<RecordedUpload>>,
    failing: Mutex<HashSet<String>>,
    next_id: AtomicI64,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    /// Sink whose first assigned id is 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_id: i64) -> Self {
        Self {
            uploads: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            next_id: AtomicI64::new(first_id),
        }
    }

    /// Make every upload to `table` fail until [`MemorySink::recover_table`]
    pub fn fail_table(&self, table: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table.to_string());
    }

    pub fn recover_table(&self, table: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(table);
    }

    /// Accepted uploads, in arrival order
    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn uploads_to(&self, table: &str) -> Vec<RecordedUpload> {
        self.uploads()
            .into_iter()
            .filter(|upload| upload.table == table)
            .collect()
    }
}

#[async_trait]
impl ReportingSink for MemorySink {
    async fn upload(&self, table: &str, payload: &Payload) -> Result<RecordId> {
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(table)
        {
            return Err(InventoryError::upload(table, "table is unavailable"));
        }

        let assigned = RecordId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedUpload {
                table: table.to_string(),
                payload: payload.clone(),
                assigned,
            });
        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_assigns_increasing_ids() {
        let sink = MemorySink::starting_at(7);
        let payload = Payload::from_rows([1, 2]).unwrap();

        assert_eq!(sink.upload("bios", &payload).await.unwrap(), RecordId(7));
        assert_eq!(sink.upload("x_client_bios", &payload).await.unwrap(), RecordId(8));
        assert_eq!(sink.uploads().len(), 2);
        assert_eq!(sink.uploads_to("bios")[0].assigned, RecordId(7));
    }

    #[tokio::test]
    async fn test_failing_table() {
        let sink = MemorySink::new();
        let payload = Payload::from_rows([1]).unwrap();

        sink.fail_table("bios");
        assert!(sink.upload("bios", &payload).await.is_err());
        assert!(sink.uploads().is_empty());

        sink.recover_table("bios");
        assert_eq!(sink.upload("bios", &payload).await.unwrap(), RecordId(1));
    }
}
