use anyhow::{Result, anyhow};

use crate::config::CollectionConfig;
use crate::encode;
use crate::hash::feature_hash;
use crate::index::{UploadIndex, UploadRecord};
use crate::source::SourceFeature;
use crate::transmit::{BatchTransmitter, RetryPolicy, StatementExecutor, TransmitStats};
use crate::utils::ProgressCounter;

#[derive(Clone, Debug)]
pub struct UploadOptions {
    pub table: String,
    pub batch_size: usize,
    /// Rows with a number at or below this are never checked against the
    /// index or transmitted; used to fast-forward past a known-bad region.
    pub rows_to_skip: u32,
    pub reset: bool,
    pub dry_run: bool,
    pub retry: RetryPolicy,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            table: "polygons".to_string(),
            batch_size: 3,
            rows_to_skip: 0,
            reset: false,
            dry_run: false,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CollectionStats {
    pub seen: u64,
    pub skipped_manual: u64,
    pub skipped_uploaded: u64,
    pub skipped_unencodable: u64,
    pub attempted: u64,
    pub transmit: TransmitStats,
}

/// Drives the pipeline for one collection: optional reset, then per feature
/// an index lookup, field mapping, hashing, encoding and batching, and a
/// final drain of anything below the auto-flush threshold.
pub fn upload_collection<I>(
    features: I,
    collection: &CollectionConfig,
    provider: &str,
    index: &mut UploadIndex,
    executor: &dyn StatementExecutor,
    options: &UploadOptions,
) -> Result<CollectionStats>
where
    I: IntoIterator<Item = SourceFeature>,
{
    let mut stats = CollectionStats::default();
    let mut transmitter =
        BatchTransmitter::new(executor, options.batch_size, options.retry, options.dry_run);
    let source_name = provider.to_lowercase();
    let collection_name = collection.collection.to_lowercase();
    let progress = ProgressCounter::new("Rows", 100);

    // Reset runs once, ahead of the loop, so it applies even when the
    // source yields no features at all.
    if options.reset {
        reset_collection(
            index,
            executor,
            &source_name,
            &collection_name,
            &options.table,
            options.dry_run,
        )?;
    }

    for feature in features {
        stats.seen += 1;
        progress.inc(1);

        if feature.row <= options.rows_to_skip {
            stats.skipped_manual += 1;
            continue;
        }
        if index.is_uploaded(
            &source_name,
            &collection_name,
            &feature.filename,
            &options.table,
            feature.row,
        )? {
            stats.skipped_uploaded += 1;
            continue;
        }

        let mut mapped = collection.map_fields(provider, &feature.properties)?;
        collection.verify_fields(&feature.filename, &mapped)?;
        mapped.insert("filename", feature.filename.clone());
        mapped.insert("feature_hash", feature_hash(&feature.geometry, &mapped));

        let Some(sql) = encode::encode_insert(&feature.geometry, &mapped, &options.table)? else {
            stats.skipped_unencodable += 1;
            continue;
        };

        stats.attempted += 1;
        let record_id = index.record_attempt(&UploadRecord {
            source: source_name.clone(),
            collection: collection_name.clone(),
            filename: feature.filename.clone(),
            table: options.table.clone(),
            row: feature.row,
            rows_so_far: stats.attempted as u32,
            rows_in_upload: stats.seen as u32,
            uploaded: false,
        })?;
        transmitter.add(sql, record_id, index)?;
    }

    transmitter.flush(index)?;
    progress.finish();
    stats.transmit = transmitter.stats();

    tracing::info!(
        "Collection '{}' done: {} seen, {} attempted, {} already uploaded, \
         {} skipped by request, {} unencodable, {} sent, {} left pending",
        collection_name,
        stats.seen,
        stats.attempted,
        stats.skipped_uploaded,
        stats.skipped_manual,
        stats.skipped_unencodable,
        stats.transmit.rows_sent,
        stats.transmit.rows_dropped,
    );

    Ok(stats)
}

/// Deletes the remote rows and then the upload records for the
/// (provider, collection) pair. Remote goes first: a failure there aborts
/// the collection with the local history intact, so a retried reset still
/// knows what was uploaded. A dry run touches neither side.
fn reset_collection(
    index: &UploadIndex,
    executor: &dyn StatementExecutor,
    source: &str,
    collection: &str,
    table: &str,
    dry_run: bool,
) -> Result<()> {
    let sql = encode::delete_statement(table, source, collection);
    if dry_run {
        let records = index.count_collection(source, collection)?;
        tracing::info!(
            "Dry run: would remove {} upload record(s) for {}/{} and execute: {}",
            records,
            source,
            collection,
            sql
        );
        return Ok(());
    }
    executor
        .execute(&sql)
        .map_err(|err| anyhow!("Reset failed for {}/{}: {}", source, collection, err))?;
    let removed = index.delete_collection(source, collection)?;
    tracing::info!(
        "Reset: removed {} upload record(s) for {}/{}",
        removed,
        source,
        collection
    );
    Ok(())
}
