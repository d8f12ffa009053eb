use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

/// One row of upload progress, unique per
/// (source, collection, filename, table, row).
#[derive(Clone, Debug)]
pub struct UploadRecord {
    pub source: String,
    pub collection: String,
    pub filename: String,
    pub table: String,
    pub row: u32,
    pub rows_so_far: u32,
    pub rows_in_upload: u32,
    pub uploaded: bool,
}

/// The locally persisted ledger of per-row upload status. One SQLite file
/// per provider directory, created if absent, never migrated. Single-writer,
/// single-process; a record marked uploaded means the containing batch's
/// transaction was confirmed by the remote executor at least once.
pub struct UploadIndex {
    conn: Connection,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS uploads (
    id INTEGER PRIMARY KEY,
    source TEXT NOT NULL,
    collection TEXT NOT NULL,
    filename TEXT NOT NULL,
    cartodb_tablename TEXT NOT NULL,
    row INTEGER NOT NULL,
    rows_so_far INTEGER NOT NULL,
    rows_in_upload INTEGER NOT NULL,
    uploaded INTEGER NOT NULL DEFAULT 0,
    UNIQUE (source, collection, filename, cartodb_tablename, row)
)";

impl UploadIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(SCHEMA, [])?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(SCHEMA, [])?;
        Ok(Self { conn })
    }

    /// An absent record means "never attempted" and reads as not uploaded.
    pub fn is_uploaded(
        &self,
        source: &str,
        collection: &str,
        filename: &str,
        table: &str,
        row: u32,
    ) -> Result<bool> {
        let uploaded: Option<bool> = self
            .conn
            .query_row(
                "SELECT uploaded FROM uploads
                 WHERE source = ?1 AND collection = ?2 AND filename = ?3
                   AND cartodb_tablename = ?4 AND row = ?5",
                params![source, collection, filename, table, row],
                |r| r.get(0),
            )
            .optional()?;
        Ok(uploaded.unwrap_or(false))
    }

    /// Inserts a pending record and returns its id. A row left pending by an
    /// earlier run is reused, so the uniqueness of the tuple holds across
    /// restarts.
    pub fn record_attempt(&self, record: &UploadRecord) -> Result<i64> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM uploads
                 WHERE source = ?1 AND collection = ?2 AND filename = ?3
                   AND cartodb_tablename = ?4 AND row = ?5",
                params![
                    record.source,
                    record.collection,
                    record.filename,
                    record.table,
                    record.row
                ],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            self.conn.execute(
                "UPDATE uploads SET rows_so_far = ?1, rows_in_upload = ?2 WHERE id = ?3",
                params![record.rows_so_far, record.rows_in_upload, id],
            )?;
            return Ok(id);
        }

        self.conn.execute(
            "INSERT INTO uploads
                 (source, collection, filename, cartodb_tablename, row,
                  rows_so_far, rows_in_upload, uploaded)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.source,
                record.collection,
                record.filename,
                record.table,
                record.row,
                record.rows_so_far,
                record.rows_in_upload,
                record.uploaded,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Flips `uploaded` for exactly the given ids, atomically.
    pub fn mark_uploaded(&mut self, ids: &[i64]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE uploads SET uploaded = 1 WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Number of records, pending or uploaded, held for the pair.
    pub fn count_collection(&self, source: &str, collection: &str) -> Result<u32> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM uploads WHERE source = ?1 AND collection = ?2",
            params![source, collection],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Reset path: removes all records for the pair, not just pending ones.
    pub fn delete_collection(&self, source: &str, collection: &str) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM uploads WHERE source = ?1 AND collection = ?2",
            params![source, collection],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(collection: &str, filename: &str, row: u32) -> UploadRecord {
        UploadRecord {
            source: "iucn".to_string(),
            collection: collection.to_string(),
            filename: filename.to_string(),
            table: "polygons".to_string(),
            row,
            rows_so_far: 0,
            rows_in_upload: 0,
            uploaded: false,
        }
    }

    #[test]
    fn absent_record_reads_as_not_uploaded() {
        let index = UploadIndex::open_in_memory().unwrap();
        assert!(
            !index
                .is_uploaded("iucn", "reptiles", "anolis", "polygons", 1)
                .unwrap()
        );
    }

    #[test]
    fn mark_uploaded_flips_exactly_the_given_ids() {
        let mut index = UploadIndex::open_in_memory().unwrap();
        let first = index.record_attempt(&record("reptiles", "anolis", 1)).unwrap();
        let _second = index.record_attempt(&record("reptiles", "anolis", 2)).unwrap();

        index.mark_uploaded(&[first]).unwrap();

        assert!(
            index
                .is_uploaded("iucn", "reptiles", "anolis", "polygons", 1)
                .unwrap()
        );
        assert!(
            !index
                .is_uploaded("iucn", "reptiles", "anolis", "polygons", 2)
                .unwrap()
        );
    }

    #[test]
    fn record_attempt_reuses_a_pending_row() {
        let index = UploadIndex::open_in_memory().unwrap();
        let first = index.record_attempt(&record("reptiles", "anolis", 1)).unwrap();
        let again = index.record_attempt(&record("reptiles", "anolis", 1)).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn delete_is_scoped_to_one_collection() {
        let mut index = UploadIndex::open_in_memory().unwrap();
        let kept = index.record_attempt(&record("birds", "turdus", 1)).unwrap();
        index.record_attempt(&record("reptiles", "anolis", 1)).unwrap();
        index.mark_uploaded(&[kept]).unwrap();

        assert_eq!(index.count_collection("iucn", "reptiles").unwrap(), 1);
        let removed = index.delete_collection("iucn", "reptiles").unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.count_collection("iucn", "reptiles").unwrap(), 0);

        assert!(
            index
                .is_uploaded("iucn", "birds", "turdus", "polygons", 1)
                .unwrap()
        );
        assert!(
            !index
                .is_uploaded("iucn", "reptiles", "anolis", "polygons", 1)
                .unwrap()
        );
    }

    #[test]
    fn status_survives_reopen() {
        let file = tempfile::NamedTempFile::with_suffix(".db").unwrap();
        {
            let mut index = UploadIndex::open(file.path()).unwrap();
            let id = index.record_attempt(&record("reptiles", "anolis", 7)).unwrap();
            index.mark_uploaded(&[id]).unwrap();
        }

        let index = UploadIndex::open(file.path()).unwrap();
        assert!(
            index
                .is_uploaded("iucn", "reptiles", "anolis", "polygons", 7)
                .unwrap()
        );
    }
}
