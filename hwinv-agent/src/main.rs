/*!
hwinv - host hardware inventory agent.

Polls the hardware facets of this host and reports what changed to the
collection service.
*/

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use hwinv_core::config::KNOWN_FACETS;
use hwinv_core::facets::{self, FirmwareProvider, ProcessorProvider};
use hwinv_core::{
    observability, AgentConfig, ClientIdentity, CycleOutcome, CycleReport, FacetProvider,
    InventoryError, MemorySink, Orchestrator, ReportingSink, SysfsQuery,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{Table, Tabled};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "hwinv")]
#[command(about = "Host hardware inventory agent")]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true, env = "HWINV_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log one JSON object per line
    #[arg(long, global = true, env = "HWINV_JSON_LOGS")]
    json_logs: bool,

    /// Host identity, overrides the configuration file
    #[arg(long, global = true, env = "HWINV_CLIENT_ID")]
    client_id: Option<String>,

    /// Collection service base URL, overrides the configuration file
    #[arg(long, global = true, env = "HWINV_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, global = true, env = "HWINV_USERNAME")]
    username: Option<String>,

    #[arg(long, global = true, env = "HWINV_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Write Prometheus metrics to this file on exit
    #[arg(long, global = true)]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll and report until interrupted
    Run,
    /// Run a single cycle of every facet and print the outcomes
    Once {
        /// Keep payloads in memory and print them instead of uploading
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the current records of one or all facets without reporting
    Scan {
        /// Facet to scan
        #[arg(short, long)]
        facet: Option<String>,
    },
}

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Facet")]
    facet: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Parent ID")]
    parent_id: String,
    #[tabled(rename = "Records")]
    records: String,
    #[tabled(rename = "Client linked")]
    client_linked: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

impl From<&CycleReport> for OutcomeRow {
    fn from(report: &CycleReport) -> Self {
        let mut row = OutcomeRow {
            facet: report.facet.to_string(),
            outcome: String::new(),
            parent_id: "-".to_string(),
            records: "-".to_string(),
            client_linked: "-".to_string(),
            detail: String::new(),
        };
        match &report.outcome {
            Ok(outcome) => {
                row.outcome = outcome.label().to_string();
                match outcome {
                    CycleOutcome::Reported {
                        parent_id,
                        records,
                        client_linked,
                    } => {
                        row.parent_id = parent_id.to_string();
                        row.records = records.to_string();
                        row.client_linked = if *client_linked { "yes" } else { "no" }.to_string();
                    }
                    CycleOutcome::PullFailed { error }
                    | CycleOutcome::ParentUploadFailed { error } => row.detail = error.clone(),
                    CycleOutcome::Unchanged => {}
                }
            }
            Err(e) => {
                row.outcome = "error".to_string();
                row.detail = e.to_string();
            }
        }
        row
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    observability::init_tracing(cli.json_logs, cli.verbose)?;

    let require_endpoint = matches!(
        cli.command,
        Commands::Run | Commands::Once { dry_run: false }
    );
    let config = Arc::new(load_config(&cli, require_endpoint)?);

    let result = match &cli.command {
        Commands::Run => run(config).await,
        Commands::Once { dry_run } => once(config, *dry_run).await,
        Commands::Scan { facet } => scan(facet.as_deref()).await,
    };

    if let Some(path) = &cli.metrics_file {
        if let Err(e) = write_metrics(path) {
            warn!(path = %path.display(), error = %e, "failed to write metrics");
        }
    }

    result
}

fn load_config(cli: &Cli, require_endpoint: bool) -> Result<AgentConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::default(),
    };

    if let Some(client_id) = &cli.client_id {
        config.client_id = Some(client_id.clone());
    }
    if let Some(url) = &cli.endpoint {
        config.endpoint.url = Some(url.clone());
    }
    if let Some(username) = &cli.username {
        config.endpoint.username = Some(username.clone());
    }
    if let Some(password) = &cli.password {
        config.endpoint.password = Some(password.clone());
    }

    config.validate(require_endpoint)?;
    Ok(config)
}

fn build_orchestrator(
    config: &Arc<AgentConfig>,
    sink: Arc<dyn ReportingSink>,
) -> Result<Orchestrator, anyhow::Error> {
    let client = ClientIdentity::resolve(config.client_id.as_deref())?;
    info!(client = %client, facets = ?config.facets, "starting inventory");

    let mut orchestrator = Orchestrator::new(Arc::clone(config), sink, client);
    facets::register_enabled(&mut orchestrator, Arc::new(SysfsQuery::new()), &config.facets)?;
    Ok(orchestrator)
}

#[cfg(feature = "rest")]
fn rest_sink(config: &AgentConfig) -> Result<Arc<dyn ReportingSink>, anyhow::Error> {
    let transport = hwinv_core::RestTransport::new(&config.endpoint, config.request_timeout())?;
    Ok(Arc::new(hwinv_core::TransportSink::new(transport)))
}

#[cfg(not(feature = "rest"))]
fn rest_sink(_config: &AgentConfig) -> Result<Arc<dyn ReportingSink>, anyhow::Error> {
    bail!("this build has no REST transport; use `once --dry-run`")
}

async fn run(config: Arc<AgentConfig>) -> Result<(), anyhow::Error> {
    let orchestrator = build_orchestrator(&config, rest_sink(&config)?)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    orchestrator.run(shutdown_rx).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn once(config: Arc<AgentConfig>, dry_run: bool) -> Result<(), anyhow::Error> {
    let memory = dry_run.then(|| Arc::new(MemorySink::new()));
    let sink: Arc<dyn ReportingSink> = match &memory {
        Some(memory) => Arc::clone(memory) as Arc<dyn ReportingSink>,
        None => rest_sink(&config)?,
    };

    let mut orchestrator = build_orchestrator(&config, sink)?;
    let reports = orchestrator.run_once().await;

    let rows: Vec<OutcomeRow> = reports.iter().map(OutcomeRow::from).collect();
    println!("{}", Table::new(rows));

    if let Some(memory) = memory {
        for upload in memory.uploads() {
            println!("\n{} (id {}):", upload.table, upload.assigned);
            println!("{}", serde_json::to_string_pretty(&upload.payload)?);
        }
    }

    let failed: Vec<&CycleReport> = reports.iter().filter(|r| r.outcome.is_err()).collect();
    if let Some(report) = failed.first() {
        if let Err(InventoryError::Contract { .. }) = &report.outcome {
            bail!("{} facet(s) broke the record contract", failed.len());
        }
        bail!("{} facet(s) failed", failed.len());
    }
    Ok(())
}

async fn scan(facet: Option<&str>) -> Result<(), anyhow::Error> {
    if let Some(name) = facet {
        if !KNOWN_FACETS.contains(&name) {
            return Err(anyhow!(
                "unknown facet '{name}' (known: {})",
                KNOWN_FACETS.join(", ")
            ));
        }
    }

    let query = Arc::new(SysfsQuery::new());
    for name in KNOWN_FACETS.iter().filter(|n| facet.map_or(true, |f| f == **n)) {
        match *name {
            "firmware" => print_records(&FirmwareProvider::new(Arc::clone(&query))).await?,
            "processor" => print_records(&ProcessorProvider::new(Arc::clone(&query))).await?,
            other => warn!(facet = other, "no scanner for facet"),
        }
    }
    Ok(())
}

async fn print_records<P: FacetProvider>(provider: &P) -> Result<(), anyhow::Error> {
    let snapshot = provider
        .pull()
        .await
        .with_context(|| format!("scanning {}", provider.name()))?;
    println!("{} ({} records):", provider.name(), snapshot.len());
    println!("{}", serde_json::to_string_pretty(snapshot.records())?);
    Ok(())
}

#[cfg(feature = "metrics")]
fn write_metrics(path: &Path) -> Result<(), anyhow::Error> {
    let metrics = observability::InventoryMetrics::global()
        .ok_or_else(|| anyhow!("metrics are unavailable"))?;
    std::fs::write(path, metrics.gather_metrics()?)?;
    info!(path = %path.display(), "metrics written");
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn write_metrics(_path: &Path) -> Result<(), anyhow::Error> {
    bail!("this build has no metrics support")
}
