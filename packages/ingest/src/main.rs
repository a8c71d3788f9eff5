#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the VMHub tenant pipeline.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{FixedOffset, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use vmhub_pipeline_archive::ObjectStore;
use vmhub_pipeline_ingest::settings::{Settings, endpoint_filter};
use vmhub_pipeline_ingest::{Pipeline, RunOptions};
use vmhub_pipeline_models::{EndpointDescriptor, FetchWindow, RunReport};
use vmhub_pipeline_source::client::VmHubClient;
use vmhub_pipeline_source::registry::{all_endpoints, find_endpoint, select_endpoints};
use vmhub_pipeline_source::tenant::TenantDirectory;
use vmhub_pipeline_source::window::{default_range, plan};
use vmhub_pipeline_warehouse::DuckDbProvider;

/// Tenants live in Brasília time (UTC-03:00).
const TENANT_UTC_OFFSET_WEST_SECS: i32 = 3 * 3600;

#[derive(Parser)]
#[command(
    name = "vmhub_pipeline",
    about = "Fetch, archive, and load VMHub data for one tenant"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every selected endpoint for the tenant behind a run identifier
    Run {
        /// Run identifier, looked up in the tenant directory
        run_id: String,
        #[command(flatten)]
        range: RangeArgs,
        /// Comma-separated endpoint names (overrides `VMHUB_ENDPOINTS` env var)
        #[arg(long)]
        endpoints: Option<String>,
        /// Base URL of the VMHub API (overrides `VMHUB_BASE_URL` env var)
        #[arg(long)]
        base_url: Option<String>,
        /// Also write the run report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Reload archived pages into the warehouse without calling the API
    Replay {
        /// Run identifier, looked up in the tenant directory
        run_id: String,
        /// Endpoint to reload
        #[arg(long)]
        endpoint: String,
        #[command(flatten)]
        range: RangeArgs,
        /// Also write the run report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// List the endpoint catalog
    Endpoints,
}

#[derive(Args)]
struct RangeArgs {
    /// First day to fetch (YYYY-MM-DD)
    #[arg(long)]
    since: Option<NaiveDate>,
    /// Last day to fetch, inclusive (YYYY-MM-DD)
    #[arg(long)]
    until: Option<NaiveDate>,
    /// Days ending yesterday to fetch when `--since` is not given
    #[arg(long, default_value = "1")]
    days: u32,
}

impl RangeArgs {
    /// Explicit bounds win; missing ones come from the default range.
    fn resolve(&self) -> (NaiveDate, NaiveDate) {
        let now = Utc::now();
        let today = FixedOffset::west_opt(TENANT_UTC_OFFSET_WEST_SECS).map_or_else(
            || now.date_naive(),
            |offset| now.with_timezone(&offset).date_naive(),
        );
        let (default_since, default_until) = default_range(today, self.days);
        let until = self.until.unwrap_or(default_until);
        let since = self.since.unwrap_or_else(|| default_since.min(until));
        (since, until)
    }
}

/// Concrete backends built from [`Settings`].
struct Backends {
    directory: Box<dyn TenantDirectory>,
    source: VmHubClient,
    store: Box<dyn ObjectStore>,
    warehouses: DuckDbProvider,
}

impl Backends {
    fn from_settings(settings: &Settings) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            directory: settings.tenant_directory()?,
            source: VmHubClient::new(&settings.base_url, settings.auth_scheme)?,
            store: settings.object_store()?,
            warehouses: DuckDbProvider::new(settings.warehouse_dir.clone()),
        })
    }

    fn pipeline(&self, endpoints: Vec<EndpointDescriptor>, options: RunOptions) -> Pipeline<'_> {
        Pipeline::new(
            self.directory.as_ref(),
            &self.source,
            self.store.as_ref(),
            &self.warehouses,
            endpoints,
            options,
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let (report, report_path) = match cli.command {
        Commands::Endpoints => {
            println!("{:<12} {:<12} {:<10} PARTITIONED", "NAME", "IDENTIFIER", "PAGE SIZE");
            println!("{}", "-".repeat(50));
            for endpoint in all_endpoints() {
                println!(
                    "{:<12} {:<12} {:<10} {}",
                    endpoint.name,
                    endpoint.identifier_field,
                    endpoint.page_size,
                    if endpoint.time_partitioned { "yes" } else { "no" }
                );
            }
            return Ok(());
        }
        Commands::Run {
            run_id,
            range,
            endpoints,
            base_url,
            report,
        } => {
            let settings = Settings::from_env(base_url)?;
            let endpoints = select_endpoints(&endpoint_filter(endpoints))?;
            let (since, until) = range.resolve();
            log::info!(
                "Run {run_id}: {} endpoint(s) from {since} to {until}: {}",
                endpoints.len(),
                endpoints
                    .iter()
                    .map(|e| e.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            let backends = Backends::from_settings(&settings)?;
            let start = Instant::now();
            let outcome = backends
                .pipeline(endpoints, RunOptions::new(since, until))
                .run(&run_id)
                .await;
            log::info!("Run {run_id} finished in {:.1}s", start.elapsed().as_secs_f64());
            (outcome, report)
        }
        Commands::Replay {
            run_id,
            endpoint,
            range,
            report,
        } => {
            let settings = Settings::from_env(None)?;
            let descriptor = find_endpoint(&endpoint)
                .ok_or_else(|| format!("Unknown endpoint: {endpoint}"))?;
            let (since, until) = range.resolve();
            let windows: Vec<FetchWindow> = plan(&descriptor, since, until)?.collect();
            log::info!("Replaying {endpoint} for {} window(s)", windows.len());

            let backends = Backends::from_settings(&settings)?;
            let outcome = backends
                .pipeline(vec![descriptor], RunOptions::new(since, until))
                .replay(&run_id, &endpoint, &windows)
                .await;
            (outcome, report)
        }
    };

    emit(&report, report_path.as_deref())?;
    std::process::exit(report.overall_status.exit_code());
}

/// Prints the report and optionally saves it.
fn emit(report: &RunReport, path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(report)?;
    println!("{json}");

    if let Some(path) = path {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &json)?;
        log::info!("Report written to {}", path.display());
    }

    Ok(())
}
