/*!
# hwinv core

Host hardware inventory: poll, diff, report.

Each hardware facet (firmware, processors, ...) is polled on its own timer.
The records pulled are compared with the last snapshot that was
successfully reported, and only the records that are new or changed are
sent to the collection service: first to the facet's parent table, then as
cross-reference rows to its client table, tagged with this host's identity
and the id the parent upload returned.

## Architecture

- [`facets`]: one [`FacetProvider`] per facet; knows how to pull records and
  shape payloads
- [`environment`]: where raw attributes come from (sysfs/procfs on Linux)
- [`diff`]: set difference between two snapshots
- [`sink`]: where payloads go ([`ReportingSink`]); REST or in-memory
- [`orchestrator`]: owns the current snapshots and schedules cycles

## Usage

```rust,no_run
use hwinv_core::{
    facets, AgentConfig, ClientIdentity, MemorySink, Orchestrator, SysfsQuery,
};
use std::sync::Arc;

# async fn demo() -> hwinv_core::Result<()> {
let config = Arc::new(AgentConfig::default());
let client = ClientIdentity::new("host-42")?;
let mut orchestrator = Orchestrator::new(config.clone(), Arc::new(MemorySink::new()), client);
facets::register_enabled(&mut orchestrator, Arc::new(SysfsQuery::new()), &config.facets)?;

for report in orchestrator.run_once().await {
    println!("{}: {:?}", report.facet, report.outcome);
}
# Ok(())
# }
```
*/

pub mod config;
pub mod diff;
pub mod environment;
pub mod error;
pub mod facets;
pub mod identity;
pub mod observability;
pub mod orchestrator;
pub mod payload;
pub mod record;
pub mod sink;


pub use config::{AgentConfig, EndpointConfig};
pub use diff::difference;
pub use environment::{AttributeMap, EnvironmentQuery, FacetSelector, SysfsQuery};
pub use error::{InventoryError, Result};
pub use facets::{FacetProvider, FacetTables};
pub use identity::ClientIdentity;
pub use orchestrator::{CycleOutcome, CycleReport, FacetCycle, FacetTask, Orchestrator};
pub use payload::Payload;
pub use record::{RecordId, Snapshot, SnapshotRecord};
pub use sink::{MemorySink, RecordedUpload, ReportingSink, Transport, TransportSink};
#[cfg(feature = "rest")]
pub use sink::RestTransport;
