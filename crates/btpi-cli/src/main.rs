use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use btpi_net::{build_client, HttpClientConfig, ProxyTranslator};
use btpi_sync::{build_scheduler, config, AppConfig, ConfigSources, ReportService};
use btpi_web::AppState;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "btpi")]
#[command(about = "Scheduled SQL reports published as JSON, plus an API proxy")]
struct Cli {
    /// Directory holding config.json and queries.json.
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,
    #[arg(long)]
    port: Option<u16>,
    /// Cron expression for the scheduled batch, evaluated in local time.
    #[arg(long)]
    interval: Option<String>,
    /// Override any key, e.g. `--set database:server=db.local`.
    #[arg(long = "set", value_name = "PATH=VALUE")]
    overrides: Vec<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve HTTP, run every query once and start the schedule.
    Serve,
    /// Run one batch (or a single named query) and exit.
    Run {
        #[arg(long)]
        name: Option<String>,
    },
}

impl Cli {
    fn config_sources(&self) -> ConfigSources {
        let mut overrides = Vec::new();
        if let Some(port) = self.port {
            overrides.push(format!("btpi:port={port}"));
        }
        if let Some(interval) = &self.interval {
            overrides.push(format!("btpi:interval={interval}"));
        }
        overrides.extend(self.overrides.iter().cloned());
        ConfigSources::new(&self.config_dir)
            .with_process_env()
            .with_overrides(overrides)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load(&cli.config_sources())
        .with_context(|| format!("loading configuration from {}", cli.config_dir.display()))?;
    init_logging(&config.btpi.log_dir)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Run { name } => run_once(config, name).await?,
    }

    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let service = Arc::new(ReportService::from_config(&config)?);
    info!(
        queries = service.registry().enabled_count().await,
        "loaded query definitions"
    );

    let startup = service.clone();
    tokio::spawn(async move {
        if !startup.run_all().await.succeeded {
            error!("initial run did not complete successfully");
        }
    });

    let scheduler = build_scheduler(service.clone(), &config.btpi.interval).await?;
    scheduler.start().await.context("starting scheduler")?;

    let client = build_client(&HttpClientConfig::default())?;
    let proxy = ProxyTranslator::new(client, config.wms_proxy.clone());
    let state = AppState::new(service, proxy, &config.btpi.public_root);
    btpi_web::serve(state, config.btpi.port).await
}

async fn run_once(config: AppConfig, name: Option<String>) -> Result<()> {
    let service = ReportService::from_config(&config)?;
    let outcome = match name {
        Some(name) => match service.run_one(&name).await {
            Some((outcome, _)) => outcome,
            None => bail!("no query named {name}"),
        },
        None => service.run_all().await,
    };

    println!(
        "run complete: succeeded={} started_at={} files={}",
        outcome.succeeded,
        outcome.started_at,
        outcome.manifest.len()
    );
    if !outcome.succeeded {
        bail!("query run failed; see {} for details", config.btpi.log_dir.display());
    }
    Ok(())
}

/// Days of rotated JSON logs kept per prefix.
const LOG_RETENTION_FILES: usize = 14;

fn daily_json_log(log_dir: &Path, prefix: &str) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("json")
        .max_log_files(LOG_RETENTION_FILES)
        .build(log_dir)
        .with_context(|| format!("opening {prefix} log in {}", log_dir.display()))
}

/// Console output follows `RUST_LOG`; `btpi.<date>.json` gets info and up,
/// `error.<date>.json` warnings and errors only.
fn init_logging(log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let all = daily_json_log(log_dir, "btpi")?;
    let errors = daily_json_log(log_dir, "error")?;

    tracing_subscriber::registry()
        .with(
            fmt::layer().with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .with(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(all)
                .with_filter(LevelFilter::INFO),
        )
        .with(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(errors)
                .with_filter(LevelFilter::WARN),
        )
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}
