/*!
Poll, diff and report loop.

Every registered facet gets a [`FacetTask`] that owns the facet's current
snapshot. A cycle is strictly sequential:

1. pull the facet's records (bounded by the pull timeout)
2. diff them against the current snapshot
3. upload the delta to the parent table, then the cross-reference rows to
   the client table using the id the parent upload returned
4. replace the current snapshot

The snapshot is replaced only once the parent upload succeeded, so a failed
upload is detected and sent again on the next cycle (at-least-once). A
failing client upload is logged and does not block the replacement.

[`Orchestrator::run`] drives one tokio task per facet, each on its own timer.
Tasks never share mutable state; the configuration and the client identity
are read-only.
*/

use crate::config::AgentConfig;
use crate::diff::difference;
use crate::facets::FacetProvider;
use crate::identity::ClientIdentity;
use crate::record::{RecordId, Snapshot, SnapshotRecord};
use crate::sink::ReportingSink;
use crate::{InventoryError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::observability::with_metrics;

/// How a single cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The environment could not be queried; nothing was reported
    PullFailed { error: String },
    /// Nothing new since the current snapshot; the sink was not contacted
    Unchanged,
    /// The delta reached the parent table and the snapshot was replaced
    Reported {
        parent_id: RecordId,
        records: usize,
        /// Whether the client cross-reference upload succeeded too
        client_linked: bool,
    },
    /// The parent upload failed; the snapshot was kept for the next cycle
    ParentUploadFailed { error: String },
}

impl CycleOutcome {
    /// Short machine-readable label, used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::PullFailed { .. } => "pull_failed",
            CycleOutcome::Unchanged => "unchanged",
            CycleOutcome::Reported { .. } => "reported",
            CycleOutcome::ParentUploadFailed { .. } => "parent_upload_failed",
        }
    }
}

/// One facet's poll loop state
pub struct FacetTask<P: FacetProvider> {
    provider: P,
    current: Option<Snapshot<P::Record>>,
    sink: Arc<dyn ReportingSink>,
    client: ClientIdentity,
    pull_timeout: Duration,
    upload_timeout: Duration,
    interval: Duration,
    initial_delay: Duration,
}

impl<P: FacetProvider> FacetTask<P> {
    pub fn new(
        provider: P,
        sink: Arc<dyn ReportingSink>,
        client: ClientIdentity,
        config: &AgentConfig,
    ) -> Self {
        let interval = config.interval_for(provider.name());
        Self {
            provider,
            current: None,
            sink,
            client,
            pull_timeout: config.pull_timeout(),
            upload_timeout: config.upload_timeout(),
            interval,
            initial_delay: config.initial_delay(),
        }
    }

    /// Last successfully reported snapshot, `None` before the first report
    pub fn current_snapshot(&self) -> Option<&Snapshot<P::Record>> {
        self.current.as_ref()
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Run one pull, diff and report cycle
    ///
    /// # Errors
    /// * `InventoryError::Contract` - the provider produced a malformed
    ///   record. The task should stop; every other failure is reported
    ///   through [`CycleOutcome`].
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let span = info_span!("cycle", facet = self.provider.name(), cycle_id = %Uuid::new_v4());
        let outcome = self.cycle().instrument(span).await;

        #[cfg(feature = "metrics")]
        {
            if let Ok(outcome) = &outcome {
                let facet = self.provider.name();
                with_metrics(|m| m.record_cycle(facet, outcome.label()));
            }
        }

        outcome
    }

    async fn cycle(&mut self) -> Result<CycleOutcome> {
        let facet = self.provider.name();
        let tables = self.provider.tables();
        let started = Utc::now();

        let snapshot = match timeout(self.pull_timeout, self.provider.pull()).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => return Ok(self.pull_failed(started, e.to_string())),
            Err(_) => {
                let reason = format!("pull timed out after {:?}", self.pull_timeout);
                return Ok(self.pull_failed(started, reason));
            }
        };

        for record in snapshot.records() {
            record.validate().map_err(|e| {
                InventoryError::contract(facet, format!("{e} in {record:?}"))
            })?;
        }

        let delta = match &self.current {
            None => snapshot.records().to_vec(),
            Some(baseline) => difference(snapshot.records(), baseline.records()),
        };
        if delta.is_empty() {
            debug!(records = snapshot.len(), "no changes");
            return Ok(CycleOutcome::Unchanged);
        }
        debug!(delta = delta.len(), records = snapshot.len(), "changes detected");

        let parent_payload = self.provider.build_parent_payload(&delta)?;
        let parent_id = match self.upload(tables.parent, &parent_payload).await {
            Ok(id) => id,
            Err(e) => {
                warn!(table = tables.parent, cycle_started = %started, error = %e, "parent upload failed, keeping snapshot");
                #[cfg(feature = "metrics")]
                with_metrics(|m| m.record_upload_failure(facet, "parent"));
                return Ok(CycleOutcome::ParentUploadFailed {
                    error: e.to_string(),
                });
            }
        };

        let client_payload = self
            .provider
            .build_client_payload(&delta, &self.client, parent_id)?;
        let client_linked = match self.upload(tables.client, &client_payload).await {
            Ok(_) => true,
            Err(e) => {
                warn!(table = tables.client, %parent_id, cycle_started = %started, error = %e, "client upload failed");
                #[cfg(feature = "metrics")]
                with_metrics(|m| m.record_upload_failure(facet, "client"));
                false
            }
        };

        self.current = Some(snapshot);

        #[cfg(feature = "metrics")]
        with_metrics(|m| m.record_reported(facet, delta.len()));
        info!(%parent_id, records = delta.len(), client_linked, "reported changes");

        Ok(CycleOutcome::Reported {
            parent_id,
            records: delta.len(),
            client_linked,
        })
    }

    fn pull_failed(&self, started: chrono::DateTime<Utc>, error: String) -> CycleOutcome {
        warn!(cycle_started = %started, %error, "pull failed");
        #[cfg(feature = "metrics")]
        {
            let facet = self.provider.name();
            with_metrics(|m| m.record_pull_failure(facet));
        }
        CycleOutcome::PullFailed { error }
    }

    async fn upload(&self, table: &str, payload: &crate::payload::Payload) -> Result<RecordId> {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let result = match timeout(self.upload_timeout, self.sink.upload(table, payload)).await {
            Ok(result) => result,
            Err(_) => Err(InventoryError::upload(
                table,
                format!("timed out after {:?}", self.upload_timeout),
            )),
        };

        #[cfg(feature = "metrics")]
        with_metrics(|m| m.record_upload_latency(table, started.elapsed()));

        result
    }
}

/// Type-erased view of a [`FacetTask`] so facets with different record types
/// can share one registry
#[async_trait]
pub trait FacetCycle: Send {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    fn initial_delay(&self) -> Duration;

    async fn run_cycle(&mut self) -> Result<CycleOutcome>;
}

#[async_trait]
impl<P: FacetProvider> FacetCycle for FacetTask<P> {
    fn name(&self) -> &'static str {
        self.provider.name()
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        FacetTask::run_cycle(self).await
    }
}

/// Result of one facet's cycle in [`Orchestrator::run_once`]
#[derive(Debug)]
pub struct CycleReport {
    pub facet: &'static str,
    pub outcome: Result<CycleOutcome>,
}

/// Owns every facet task and schedules their cycles
pub struct Orchestrator {
    config: Arc<AgentConfig>,
    sink: Arc<dyn ReportingSink>,
    client: ClientIdentity,
    cycles: Vec<Box<dyn FacetCycle>>,
}

impl Orchestrator {
    pub fn new(config: Arc<AgentConfig>, sink: Arc<dyn ReportingSink>, client: ClientIdentity) -> Self {
        Self {
            config,
            sink,
            client,
            cycles: Vec::new(),
        }
    }

    /// Add a facet, reporting through the orchestrator's sink
    pub fn register<P: FacetProvider>(&mut self, provider: P) {
        let task = FacetTask::new(
            provider,
            Arc::clone(&self.sink),
            self.client.clone(),
            &self.config,
        );
        debug!(facet = task.provider.name(), interval = ?task.interval, "registered facet");
        self.cycles.push(Box::new(task));
    }

    pub fn facet_names(&self) -> Vec<&'static str> {
        self.cycles.iter().map(|c| c.name()).collect()
    }

    pub fn client(&self) -> &ClientIdentity {
        &self.client
    }

    /// Run one cycle of every facet concurrently
    pub async fn run_once(&mut self) -> Vec<CycleReport> {
        join_all(self.cycles.iter_mut().map(|cycle| async move {
            CycleReport {
                facet: cycle.name(),
                outcome: cycle.run_cycle().await,
            }
        }))
        .await
    }

    /// Run every facet on its own timer until `shutdown` turns true
    ///
    /// In-flight cycles get the configured grace period to finish once
    /// shutdown is requested; tasks still running after it are aborted. A
    /// facet that hits a contract violation stops alone.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.cycles.is_empty() {
            return Err(InventoryError::validation("no facets registered"));
        }
        if let Some(cycle) = self.cycles.iter().find(|c| c.interval().is_zero()) {
            return Err(InventoryError::validation(format!(
                "poll interval for facet '{}' must be greater than zero",
                cycle.name()
            )));
        }

        let grace = self.config.shutdown_grace();
        let mut tasks = JoinSet::new();
        for cycle in self.cycles {
            let rx = shutdown.clone();
            tasks.spawn(async move {
                let facet = cycle.name();
                (facet, drive(cycle, rx).await)
            });
        }
        info!(facets = tasks.len(), "inventory loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => log_task_exit(joined),
                    None => {
                        warn!("every facet task has stopped");
                        return Ok(());
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(grace = ?grace, "shutdown requested, waiting for in-flight cycles");
        let drained = timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_task_exit(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = tasks.len(), "grace period elapsed, aborting facet tasks");
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                log_task_exit(joined);
            }
        }

        info!("inventory loop stopped");
        Ok(())
    }
}

/// Timer loop of a single facet; cycles of one facet never overlap
async fn drive(mut cycle: Box<dyn FacetCycle>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let facet = cycle.name();
    let mut ticker = interval_at(Instant::now() + cycle.initial_delay(), cycle.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        match cycle.run_cycle().await {
            Ok(outcome) => debug!(facet, outcome = outcome.label(), "cycle finished"),
            Err(e) => {
                error!(facet, error = %e, "facet stopped");
                return Err(e);
            }
        }
    }

    debug!(facet, "facet task exiting");
    Ok(())
}

fn log_task_exit(joined: std::result::Result<(&'static str, Result<()>), JoinError>) {
    match joined {
        Ok((facet, Ok(()))) => debug!(facet, "facet task finished"),
        Ok((facet, Err(e))) => error!(facet, error = %e, "facet task failed"),
        Err(e) if e.is_panic() => error!(error = %e, "facet task panicked"),
        Err(e) => debug!(error = %e, "facet task cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::FacetSelector;
    use crate::facets::test_support::CannedQuery;
    use crate::facets::FirmwareProvider;
    use crate::sink::MemorySink;
    use serde_json::json;

    fn bios(serial: &'static str, version: &'static str) -> Vec<(&'static str, &'static str)> {
        vec![
            ("manufacturer", "Dell Inc."),
            ("version", version),
            ("smbios_bios_version", version),
            ("smbios_major_version", "3"),
            ("smbios_minor_version", "2"),
            ("release_date", "2023-05-11"),
            ("serial_number", serial),
        ]
    }

    fn config() -> AgentConfig {
        AgentConfig {
            client_id: Some("host-42".to_string()),
            ..AgentConfig::default()
        }
    }

    fn firmware_task(
        query: Arc<CannedQuery>,
        sink: Arc<MemorySink>,
    ) -> FacetTask<FirmwareProvider<CannedQuery>> {
        FacetTask::new(
            FirmwareProvider::new(query),
            sink,
            ClientIdentity::new("host-42").unwrap(),
            &config(),
        )
    }

    #[tokio::test]
    async fn test_first_cycle_reports_everything() {
        let query = Arc::new(CannedQuery::with(FacetSelector::Firmware, vec![bios("A1", "1.2.3")]));
        let sink = Arc::new(MemorySink::starting_at(7));
        let mut task = firmware_task(query, Arc::clone(&sink));

        let outcome = task.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Reported {
                parent_id: RecordId(7),
                records: 1,
                client_linked: true
            }
        );
        assert_eq!(task.current_snapshot().unwrap().len(), 1);

        let client = sink.uploads_to("x_client_bios");
        assert_eq!(
            serde_json::to_value(&client[0].payload).unwrap(),
            json!({"resource": [{"serial_number": "A1", "client_id": "host-42", "bios_id": 7}]})
        );
    }

    #[tokio::test]
    async fn test_unchanged_cycle_does_not_contact_sink() {
        let query = Arc::new(CannedQuery::with(FacetSelector::Firmware, vec![bios("A1", "1.2.3")]));
        let sink = Arc::new(MemorySink::new());
        let mut task = firmware_task(query, Arc::clone(&sink));

        task.run_cycle().await.unwrap();
        assert_eq!(task.run_cycle().await.unwrap(), CycleOutcome::Unchanged);
        assert_eq!(sink.uploads().len(), 2);
    }

    #[tokio::test]
    async fn test_pull_failure_keeps_snapshot() {
        let query = Arc::new(CannedQuery::with(FacetSelector::Firmware, vec![bios("A1", "1.2.3")]));
        let sink = Arc::new(MemorySink::new());
        let mut task = firmware_task(Arc::clone(&query), Arc::clone(&sink));
        task.run_cycle().await.unwrap();

        query.fail(FacetSelector::Firmware);
        let outcome = task.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::PullFailed { .. }));
        assert_eq!(task.current_snapshot().unwrap().records()[0].serial_number, "A1");
        assert_eq!(sink.uploads().len(), 2);
    }

    #[tokio::test]
    async fn test_parent_failure_resends_same_delta() {
        let query = Arc::new(CannedQuery::with(FacetSelector::Firmware, vec![bios("A1", "1.2.3")]));
        let sink = Arc::new(MemorySink::new());
        let mut task = firmware_task(query, Arc::clone(&sink));

        sink.fail_table("bios");
        let outcome = task.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::ParentUploadFailed { .. }));
        assert!(task.current_snapshot().is_none());
        assert!(sink.uploads_to("x_client_bios").is_empty());

        sink.recover_table("bios");
        let outcome = task.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Reported { records: 1, .. }));
        assert_eq!(sink.uploads_to("bios").len(), 1);
    }

    #[tokio::test]
    async fn test_client_failure_still_replaces_snapshot() {
        let query = Arc::new(CannedQuery::with(FacetSelector::Firmware, vec![bios("A1", "1.2.3")]));
        let sink = Arc::new(MemorySink::new());
        let mut task = firmware_task(query, Arc::clone(&sink));

        sink.fail_table("x_client_bios");
        let outcome = task.run_cycle().await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Reported {
                client_linked: false,
                ..
            }
        ));
        assert!(task.current_snapshot().is_some());
        assert_eq!(task.run_cycle().await.unwrap(), CycleOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_empty_first_snapshot_is_unchanged() {
        let query = Arc::new(CannedQuery::default());
        let sink = Arc::new(MemorySink::new());
        let mut task = firmware_task(query, Arc::clone(&sink));

        assert_eq!(task.run_cycle().await.unwrap(), CycleOutcome::Unchanged);
        assert!(sink.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_run_once_covers_every_facet() {
        let query = Arc::new(CannedQuery::with(FacetSelector::Firmware, vec![bios("A1", "1.2.3")]));
        let sink = Arc::new(MemorySink::new());
        let mut orchestrator = Orchestrator::new(
            Arc::new(config()),
            sink,
            ClientIdentity::new("host-42").unwrap(),
        );
        crate::facets::register_enabled(
            &mut orchestrator,
            query,
            &["firmware".to_string(), "processor".to_string()],
        )
        .unwrap();
        assert_eq!(orchestrator.facet_names(), vec!["firmware", "processor"]);

        let reports = orchestrator.run_once().await;
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0].outcome, Ok(CycleOutcome::Reported { .. })));
        assert!(matches!(reports[1].outcome, Ok(CycleOutcome::Unchanged)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_until_shutdown() {
        let query = Arc::new(CannedQuery::with(FacetSelector::Firmware, vec![bios("A1", "1.2.3")]));
        let sink = Arc::new(MemorySink::new());
        let mut config = config();
        config.base_interval_secs = 60;
        let mut orchestrator = Orchestrator::new(
            Arc::new(config),
            Arc::clone(&sink) as Arc<dyn ReportingSink>,
            ClientIdentity::new("host-42").unwrap(),
        );
        orchestrator.register(FirmwareProvider::new(Arc::clone(&query)));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(orchestrator.run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.uploads_to("bios").len(), 1);

        query.set(FacetSelector::Firmware, vec![bios("A1", "1.2.4")]);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sink.uploads_to("bios").len(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_failure_log_names_the_cycle() {
        #[derive(Clone, Default)]
        struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

        impl std::io::Write for Captured {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let query = Arc::new(CannedQuery::with(FacetSelector::Firmware, vec![bios("A1", "1.2.3")]));
        let sink = Arc::new(MemorySink::new());
        let mut task = firmware_task(query, Arc::clone(&sink));
        sink.fail_table("x_client_bios");
        task.run_cycle().await.unwrap();

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line = logs
            .lines()
            .find(|l| l.contains("client upload failed"))
            .unwrap();
        assert!(line.contains("cycle_started="), "{line}");
        assert!(line.contains("parent_id="), "{line}");
    }

    #[tokio::test]
    async fn test_run_rejects_zero_interval() {
        let mut config = config();
        config.base_interval_secs = 0;
        let mut orchestrator = Orchestrator::new(
            Arc::new(config),
            Arc::new(MemorySink::new()),
            ClientIdentity::new("host-42").unwrap(),
        );
        orchestrator.register(FirmwareProvider::new(Arc::new(CannedQuery::default())));

        let (_tx, rx) = watch::channel(false);
        let err = orchestrator.run(rx).await.unwrap_err();
        assert!(matches!(err, InventoryError::Validation(_)));
        assert!(err.to_string().contains("facet 'firmware'"));
    }

    #[tokio::test]
    async fn test_run_without_facets_is_rejected() {
        let orchestrator = Orchestrator::new(
            Arc::new(config()),
            Arc::new(MemorySink::new()),
            ClientIdentity::new("host-42").unwrap(),
        );
        let (_tx, rx) = watch::channel(false);
        assert!(orchestrator.run(rx).await.is_err());
    }
}
