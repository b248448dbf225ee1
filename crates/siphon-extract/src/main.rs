//! siphon - batched PostgreSQL extraction
//!
//! ```bash
//! siphon -c siphon.json                      # run with the sql-file sink
//! siphon -c siphon.json run --sink table --target-url postgres://...
//! siphon -c siphon.json validate
//! siphon -c siphon.json check
//! siphon schema
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use siphon_extract::{
    BatchSink, CheckpointStore, DispatchEngine, ExtractConfig, SourceKind, SqlFileSink, TableSink,
};
use siphon_rdbc::postgres::PgConnectionFactory;
use siphon_rdbc::prelude::*;

#[derive(Parser)]
#[command(name = "siphon")]
#[command(version, about = "Batched extraction of PostgreSQL tables and queries")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "siphon.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Also write logs to a timestamped file in this directory
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract every configured source (default)
    Run(RunArgs),
    /// Validate configuration file
    Validate,
    /// Check connectivity and that configured tables exist
    Check,
    /// Print the JSON schema of the configuration file
    Schema,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Destination for extracted batches
    #[arg(long, value_enum, default_value_t = SinkKind::SqlFile)]
    sink: SinkKind,

    /// Directory for .sql files (sql-file sink)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Destination database (table sink)
    #[arg(long, env = "SIPHON_TARGET_URL", hide_env_values = true)]
    target_url: Option<String>,

    /// Truncate destination tables before the first batch (table sink)
    #[arg(long)]
    truncate: bool,

    /// Override the configured concurrency
    #[arg(long)]
    concurrency: Option<usize>,

    /// Resume from and record progress in this file
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Write the job report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum SinkKind {
    /// One replayable .sql file per source
    #[default]
    SqlFile,
    /// INSERT into tables of a destination database
    Table,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    if let Some(Commands::Schema) = &cli.command {
        return show_schema();
    }

    let config = ExtractConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(config, args).await,
        Commands::Validate => validate_config(&config),
        Commands::Check => check_connectivity(&config).await,
        Commands::Schema => show_schema(),
    }
}

fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let name = format!(
                "sql_dump_{}.log",
                chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
            );
            let file = std::fs::File::create(dir.join(&name))
                .with_context(|| format!("Failed to create log file {}", name))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(file_layer)
        .init();
    Ok(())
}

async fn source_pool(config: &ExtractConfig) -> Result<Arc<dyn ConnectionPool>> {
    let connection = config.connection.to_connection_config()?;
    info!("Source database: {}", siphon_rdbc::connection::redact_url(&connection.url));
    let pool: Arc<dyn ConnectionPool> = SimpleConnectionPool::new(
        config.pool.to_pool_config(connection),
        Arc::new(PgConnectionFactory),
    )
    .await
    .context("Failed to create source connection pool")?;
    Ok(pool)
}

async fn build_sink(args: &RunArgs, config: &ExtractConfig) -> Result<Arc<dyn BatchSink>> {
    match args.sink {
        SinkKind::SqlFile => {
            let dir = args
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("backups"));
            let sink = SqlFileSink::new(&dir)
                .await
                .with_context(|| format!("Failed to prepare output directory {}", dir.display()))?;
            Ok(Arc::new(sink))
        }
        SinkKind::Table => {
            let Some(url) = args.target_url.as_deref() else {
                bail!("--target-url (or SIPHON_TARGET_URL) is required for the table sink");
            };
            let connection = config.connection.apply_timeouts(ConnectionConfig::new(url));
            let pool = SimpleConnectionPool::new(
                config.pool.to_pool_config(connection),
                Arc::new(PgConnectionFactory),
            )
            .await
            .context("Failed to create destination connection pool")?;
            Ok(Arc::new(TableSink::new(pool).with_truncate(args.truncate)))
        }
    }
}

async fn run(config: ExtractConfig, args: RunArgs) -> Result<()> {
    // Fail on bad configuration before opening any connection.
    let descriptors = config.descriptors()?;
    if descriptors.is_empty() {
        warn!("No tables or custom queries configured; nothing to do");
        return Ok(());
    }

    let checkpoints = match &args.checkpoint {
        Some(path) => CheckpointStore::load(path)
            .await
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?,
        None => CheckpointStore::new(),
    };

    let pool = source_pool(&config).await?;
    let sink = build_sink(&args, &config).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current batch");
                cancel.cancel();
            }
        });
    }

    let engine = DispatchEngine::new(pool.clone(), sink)
        .with_retry(config.retry.to_retry_config())
        .with_concurrency(args.concurrency.unwrap_or(config.concurrency))
        .with_cancellation(cancel)
        .with_checkpoints(checkpoints.clone());

    let report = engine.run(descriptors).await?;
    report.log_summary();

    if let Some(path) = &args.checkpoint {
        let mut store = checkpoints;
        store.update_from(&report);
        store
            .save(path)
            .await
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
        info!("Checkpoint written to {} ({} pending)", path.display(), store.len());
    }

    if let Some(path) = &args.report {
        let json = serde_json::to_vec_pretty(&report)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }

    if let Err(e) = pool.close().await {
        warn!("Closing source pool: {}", e);
    }

    if report.has_failures() {
        error!("{} source(s) failed", report.totals().failed);
        std::process::exit(1);
    }
    Ok(())
}

fn validate_config(config: &ExtractConfig) -> Result<()> {
    let descriptors = config.descriptors()?;
    for d in &descriptors {
        let kind = match d.kind {
            SourceKind::TableExport { .. } => "table",
            SourceKind::CustomQuery { .. } => "query",
        };
        let cap = d
            .max_batches
            .map(|m| m.to_string())
            .unwrap_or_else(|| "unbounded".into());
        println!(
            "  {:<5} {:<40} -> {:<30} batch_size={} max_batches={}",
            kind, d.id, d.output, d.batch_size, cap
        );
    }
    println!("Configuration is valid: {} source(s)", descriptors.len());
    Ok(())
}

async fn check_connectivity(config: &ExtractConfig) -> Result<()> {
    let descriptors = config.descriptors()?;
    let pool = source_pool(config).await?;
    let conn = pool.get().await.context("Failed to connect to source database")?;
    conn.query("SELECT 1", &[])
        .await
        .context("Source database did not answer")?;
    println!("✓ source database reachable");

    let dialect = PostgresDialect;
    let mut missing = 0;
    for d in &descriptors {
        if let SourceKind::TableExport {
            source_schema,
            source_table,
            ..
        } = &d.kind
        {
            if table_exists(&*conn, &dialect, source_schema, source_table).await? {
                println!("✓ {}.{}", source_schema, source_table);
            } else {
                println!("✗ {}.{} not found", source_schema, source_table);
                missing += 1;
            }
        }
    }
    drop(conn);
    pool.close().await?;

    if missing > 0 {
        bail!("{} configured table(s) not found", missing);
    }
    Ok(())
}

fn show_schema() -> Result<()> {
    let schema = ExtractConfig::json_schema();
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
