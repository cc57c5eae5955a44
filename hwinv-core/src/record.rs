/*!
Snapshot records and the snapshots that hold them.
*/

use crate::{InventoryError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;

/// One observed hardware instance at one point in time.
///
/// Records are flat and compared by value: two records are the same
/// observation only if every field is equal. `Hash` must agree with `Eq`,
/// which `#[derive]` gives for free.
pub trait SnapshotRecord: Clone + Eq + Hash + Serialize + Debug + Send + Sync + 'static {
    /// Key that identifies the physical instance on this host (serial number,
    /// socket designation, ...). Used for the client cross-reference row.
    fn natural_key(&self) -> &str;

    /// Check the record is well formed before it is diffed or reported
    fn validate(&self) -> Result<()> {
        if self.natural_key().trim().is_empty() {
            return Err(InventoryError::validation("record has an empty natural key"));
        }
        Ok(())
    }
}

/// Ordered collection of records captured by one facet at one instant
#[derive(Debug, Clone)]
pub struct Snapshot<R> {
    records: Vec<R>,
    captured_at: Option<DateTime<Utc>>,
}

impl<R: SnapshotRecord> Snapshot<R> {
    /// Snapshot captured now
    pub fn new(records: Vec<R>) -> Self {
        Self::captured_at(records, Utc::now())
    }

    /// Snapshot with an explicit capture time
    pub fn captured_at(records: Vec<R>, at: DateTime<Utc>) -> Self {
        Self {
            records,
            captured_at: Some(at),
        }
    }

    /// The snapshot a facet has before anything was captured
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            captured_at: None,
        }
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn into_records(self) -> Vec<R> {
        self.records
    }

    pub fn capture_time(&self) -> Option<DateTime<Utc>> {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<R: SnapshotRecord> Default for Snapshot<R> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Identifier the collection service assigned to an inserted parent row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl RecordId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
