use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{CollectionConfig, CollectionKind, ProviderConfig};
use crate::index::UploadIndex;
use crate::pipeline::{self, CollectionStats, UploadOptions};
use crate::source::{ShapefileSource, TableSource};
use crate::transmit::{
    Credentials, ExecutorError, RetryPolicy, SqlApiExecutor, StatementExecutor,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Provider directory containing config.yaml and collection subdirectories
    #[arg(short, long)]
    pub source_dir: PathBuf,

    /// Remote table receiving the rows
    #[arg(short, long, default_value = "polygons")]
    pub table: String,

    /// SQL API credentials file (JSON)
    #[arg(short, long, default_value = "cartodb.json")]
    pub credentials: PathBuf,

    /// Statements per transaction
    #[arg(long, default_value_t = 3)]
    pub batch_size: usize,

    /// Encode and log statements without contacting the executor
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Delete prior rows for every collection before uploading
    #[arg(long)]
    pub force_replace: bool,

    /// Delete prior rows for the named collection only
    #[arg(long)]
    pub reset_collection: Option<String>,

    /// Fast-forward past the first N rows of every file
    #[arg(long, default_value_t = 0)]
    pub skip_rows: u32,

    /// Attempts per batch before leaving its rows pending
    #[arg(long, default_value_t = 50)]
    pub max_retries: u32,

    /// Delay between attempts, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub retry_delay_ms: u64,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Dry-run placeholder; the transmitter and reset path short-circuit before
/// ever calling it.
struct DisconnectedExecutor;

impl StatementExecutor for DisconnectedExecutor {
    fn execute(&self, _sql: &str) -> Result<(), ExecutorError> {
        Err(ExecutorError::Fatal(
            "no executor configured (dry run)".to_string(),
        ))
    }
}

pub fn build_executor(cli: &Cli) -> Result<Box<dyn StatementExecutor>> {
    if cli.dry_run {
        return Ok(Box::new(DisconnectedExecutor));
    }
    let credentials = Credentials::load(&cli.credentials)?;
    Ok(Box::new(SqlApiExecutor::new(credentials)?))
}

pub fn run(cli: &Cli) -> Result<()> {
    let config_path = cli.source_dir.join("config.yaml");
    let provider = ProviderConfig::load(&config_path)
        .with_context(|| format!("missing or unparseable provider config {:?}", config_path))?;
    tracing::info!(
        "Collections in {:?}: {:?}",
        cli.source_dir,
        provider.collection_names()
    );
    if cli.dry_run {
        tracing::info!("Performing a dry run...");
    }

    let mut index = UploadIndex::open(&cli.source_dir.join("uploads.db"))
        .context("failed to open upload index")?;
    let executor = build_executor(cli)?;
    let retry = RetryPolicy {
        max_attempts: cli.max_retries.max(1),
        backoff: Duration::from_millis(cli.retry_delay_ms),
    };

    let mut totals = CollectionStats::default();
    for collection in &provider.collections {
        if let Err(err) = collection.validate() {
            tracing::error!("Skipping collection: {:#}", err);
            continue;
        }

        let reset = cli.force_replace
            || cli.reset_collection.as_deref() == Some(collection.collection.as_str());
        let options = UploadOptions {
            table: cli.table.clone(),
            batch_size: cli.batch_size,
            rows_to_skip: cli.skip_rows,
            reset,
            dry_run: cli.dry_run,
            retry,
        };

        let stats = upload_one(
            cli,
            &provider,
            collection,
            &mut index,
            executor.as_ref(),
            &options,
        )?;
        totals.seen += stats.seen;
        totals.attempted += stats.attempted;
        totals.transmit.rows_sent += stats.transmit.rows_sent;
        totals.transmit.rows_dropped += stats.transmit.rows_dropped;
    }

    tracing::info!(
        "Provider '{}' done: {} row(s) seen, {} attempted, {} sent, {} left pending",
        provider.source.name,
        totals.seen,
        totals.attempted,
        totals.transmit.rows_sent,
        totals.transmit.rows_dropped,
    );
    Ok(())
}

fn upload_one(
    cli: &Cli,
    provider: &ProviderConfig,
    collection: &CollectionConfig,
    index: &mut UploadIndex,
    executor: &dyn StatementExecutor,
    options: &UploadOptions,
) -> Result<CollectionStats> {
    let collection_dir = cli.source_dir.join(&collection.collection);
    match collection.kind {
        CollectionKind::Shapefiles => {
            let source = ShapefileSource::new(
                &collection_dir,
                &provider.source.name,
                &collection.collection,
            )?;
            pipeline::upload_collection(source, collection, &provider.source.name, index, executor, options)
        }
        CollectionKind::Table => {
            let source = TableSource::open(
                &collection_dir.join(collection.table_file()?),
                &provider.source.name,
                &collection.collection,
                &collection.latitude,
                &collection.longitude,
            )?;
            pipeline::upload_collection(source, collection, &provider.source.name, index, executor, options)
        }
    }
}
