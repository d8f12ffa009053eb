use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::index::UploadIndex;

/// Failure conditions at the statement executor boundary. Only transient
/// failures are retried.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("transient executor failure: {0}")]
    Transient(String),
    #[error("executor failure: {0}")]
    Fatal(String),
}

/// The remote service accepting SQL for execution against the geospatial
/// store. A single call may carry multiple `;`-separated statements.
pub trait StatementExecutor {
    fn execute(&self, sql: &str) -> Result<(), ExecutorError>;
}

fn default_protocol() -> String {
    "https".to_string()
}

/// Credentials for the SQL API, loaded from a JSON file.
#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub domain: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub api_key: String,
}

impl Credentials {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Executor: failed to read credentials file {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Executor: unparseable credentials file {:?}", path))
    }
}

/// HTTP executor POSTing statements to a CartoDB-style SQL API endpoint.
pub struct SqlApiExecutor {
    client: reqwest::blocking::Client,
    url: String,
    api_key: String,
}

impl SqlApiExecutor {
    pub fn new(credentials: Credentials) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("Executor: failed to build HTTP client")?;
        Ok(Self {
            client,
            url: format!(
                "{}://{}/api/v2/sql",
                credentials.protocol, credentials.domain
            ),
            api_key: credentials.api_key,
        })
    }
}

impl StatementExecutor for SqlApiExecutor {
    fn execute(&self, sql: &str) -> Result<(), ExecutorError> {
        let response = self
            .client
            .post(&self.url)
            .form(&[("q", sql), ("api_key", &self.api_key)])
            .send()
            .map_err(|err| ExecutorError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(ExecutorError::Transient(format!("{}: {}", status, body)))
        } else {
            Err(ExecutorError::Fatal(format!("{}: {}", status, body)))
        }
    }
}

/// Bounded retry with a configurable delay between attempts. The delay
/// defaults to zero; the bound keeps a flaky endpoint from spinning forever.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            backoff: Duration::ZERO,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TransmitStats {
    pub flushes: u64,
    pub rows_sent: u64,
    pub rows_dropped: u64,
}

/// Accumulates encoded statements and sends them as one transaction per
/// batch. Records are marked uploaded only after the executor confirms the
/// batch, so a crash can never mark a row that was not transmitted.
pub struct BatchTransmitter<'a> {
    executor: &'a dyn StatementExecutor,
    buffer: Vec<(String, i64)>,
    batch_size: usize,
    retry: RetryPolicy,
    dry_run: bool,
    stats: TransmitStats,
}

impl<'a> BatchTransmitter<'a> {
    pub fn new(
        executor: &'a dyn StatementExecutor,
        batch_size: usize,
        retry: RetryPolicy,
        dry_run: bool,
    ) -> Self {
        Self {
            executor,
            buffer: Vec::new(),
            batch_size: batch_size.max(1),
            retry,
            dry_run,
            stats: TransmitStats::default(),
        }
    }

    pub fn add(&mut self, sql: String, record_id: i64, index: &mut UploadIndex) -> Result<()> {
        self.buffer.push((sql, record_id));
        if self.buffer.len() >= self.batch_size {
            self.flush(index)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> TransmitStats {
        self.stats
    }

    /// Sends everything buffered as `BEGIN TRANSACTION; …; COMMIT
    /// TRANSACTION;`. On success every record in the batch is marked
    /// uploaded. Exhausted retries or a fatal executor error drop the batch
    /// from memory without marking; those rows stay pending and are picked
    /// up by the next full run.
    pub fn flush(&mut self, index: &mut UploadIndex) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let mut combined = String::from("BEGIN TRANSACTION;\n");
        for (sql, _) in &self.buffer {
            combined.push_str(sql);
            combined.push_str(";\n");
        }
        combined.push_str("COMMIT TRANSACTION;");

        self.stats.flushes += 1;

        if self.dry_run {
            tracing::info!(
                "Dry run: would send batch of {}:\n{}",
                self.buffer.len(),
                combined
            );
            self.buffer.clear();
            return Ok(());
        }

        for attempt in 1..=self.retry.max_attempts {
            match self.executor.execute(&combined) {
                Ok(()) => {
                    let ids: Vec<i64> = self.buffer.iter().map(|(_, id)| *id).collect();
                    index.mark_uploaded(&ids)?;
                    self.stats.rows_sent += ids.len() as u64;
                    self.buffer.clear();
                    return Ok(());
                }
                Err(ExecutorError::Transient(msg)) => {
                    tracing::warn!(
                        "Batch attempt {}/{} failed: {}",
                        attempt,
                        self.retry.max_attempts,
                        msg
                    );
                    if attempt < self.retry.max_attempts && !self.retry.backoff.is_zero() {
                        std::thread::sleep(self.retry.backoff);
                    }
                }
                Err(ExecutorError::Fatal(msg)) => {
                    tracing::error!("Batch failed permanently: {}", msg);
                    break;
                }
            }
        }

        tracing::error!(
            "Dropping batch of {} statement(s); its rows remain pending",
            self.buffer.len()
        );
        self.stats.rows_dropped += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::index::{UploadIndex, UploadRecord};

    fn pending_record(index: &UploadIndex, row: u32) -> i64 {
        index
            .record_attempt(&UploadRecord {
                source: "iucn".to_string(),
                collection: "reptiles".to_string(),
                filename: "anolis".to_string(),
                table: "polygons".to_string(),
                row,
                rows_so_far: row,
                rows_in_upload: row,
                uploaded: false,
            })
            .unwrap()
    }

    #[test]
    fn seven_rows_at_batch_size_three_flush_as_3_3_1() {
        let executor = RecordingExecutor::default();
        let mut index = UploadIndex::open_in_memory().unwrap();
        let mut transmitter =
            BatchTransmitter::new(&executor, 3, RetryPolicy::default(), false);

        for row in 1..=7 {
            let id = pending_record(&index, row);
            transmitter
                .add(format!("INSERT INTO polygons VALUES ({row})"), id, &mut index)
                .unwrap();
        }
        transmitter.flush(&mut index).unwrap();

        let statements = executor.statements.borrow();
        assert_eq!(statements.len(), 3);
        let counts: Vec<usize> = statements
            .iter()
            .map(|s| s.matches("INSERT").count())
            .collect();
        assert_eq!(counts, vec![3, 3, 1]);
        for statement in statements.iter() {
            assert!(statement.starts_with("BEGIN TRANSACTION;"));
            assert!(statement.ends_with("COMMIT TRANSACTION;"));
        }
        assert_eq!(transmitter.stats().rows_sent, 7);
    }

    #[test]
    fn success_marks_every_record_in_the_batch() {
        let executor = RecordingExecutor::default();
        let mut index = UploadIndex::open_in_memory().unwrap();
        let mut transmitter =
            BatchTransmitter::new(&executor, 3, RetryPolicy::default(), false);

        for row in 1..=3 {
            let id = pending_record(&index, row);
            transmitter.add(format!("stmt {row}"), id, &mut index).unwrap();
        }

        for row in 1..=3 {
            assert!(
                index
                    .is_uploaded("iucn", "reptiles", "anolis", "polygons", row)
                    .unwrap()
            );
        }
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let executor = FlakyExecutor::failing(2);
        let mut index = UploadIndex::open_in_memory().unwrap();
        let retry = RetryPolicy {
            max_attempts: 5,
            backoff: Duration::ZERO,
        };
        let mut transmitter = BatchTransmitter::new(&executor, 3, retry, false);

        let id = pending_record(&index, 1);
        transmitter.add("stmt".to_string(), id, &mut index).unwrap();
        transmitter.flush(&mut index).unwrap();

        assert_eq!(executor.inner.statements.borrow().len(), 1);
        assert!(
            index
                .is_uploaded("iucn", "reptiles", "anolis", "polygons", 1)
                .unwrap()
        );
    }

    #[test]
    fn exhausted_retries_leave_rows_pending() {
        let executor = FlakyExecutor::failing(u32::MAX);
        let mut index = UploadIndex::open_in_memory().unwrap();
        let retry = RetryPolicy {
            max_attempts: 4,
            backoff: Duration::ZERO,
        };
        let mut transmitter = BatchTransmitter::new(&executor, 3, retry, false);

        let id = pending_record(&index, 1);
        transmitter.add("stmt".to_string(), id, &mut index).unwrap();
        transmitter.flush(&mut index).unwrap();

        assert!(
            !index
                .is_uploaded("iucn", "reptiles", "anolis", "polygons", 1)
                .unwrap()
        );
        assert_eq!(transmitter.stats().rows_dropped, 1);
        assert_eq!(u32::MAX - executor.failures_left.get(), 4);
    }

    #[test]
    fn dry_run_never_executes_or_marks() {
        let executor = RecordingExecutor::default();
        let mut index = UploadIndex::open_in_memory().unwrap();
        let mut transmitter =
            BatchTransmitter::new(&executor, 1, RetryPolicy::default(), true);

        let id = pending_record(&index, 1);
        transmitter.add("stmt".to_string(), id, &mut index).unwrap();
        transmitter.flush(&mut index).unwrap();

        assert!(executor.statements.borrow().is_empty());
        assert!(
            !index
                .is_uploaded("iucn", "reptiles", "anolis", "polygons", 1)
                .unwrap()
        );
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let executor = RecordingExecutor::default();
        let mut index = UploadIndex::open_in_memory().unwrap();
        let mut transmitter =
            BatchTransmitter::new(&executor, 3, RetryPolicy::default(), false);

        transmitter.flush(&mut index).unwrap();
        assert!(executor.statements.borrow().is_empty());
        assert_eq!(transmitter.stats().flushes, 0);
    }
}
