//! Store implementation: JSONL append log + SQLite index

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use eyre::{Context, Result, bail};
use fs2::FileExt;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Transaction, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Filter, IndexValue, Record};

const DB_FILE: &str = "taskstore.db";
const LOCK_FILE: &str = ".lock";
const LOG_EXT: &str = "jsonl";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS record_indexes (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    field TEXT NOT NULL,
    value_text TEXT,
    value_int INTEGER,
    PRIMARY KEY (collection, id, field)
);
CREATE INDEX IF NOT EXISTS idx_record_indexes_lookup
    ON record_indexes (collection, field, value_text, value_int);
";

/// One line of a collection log
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogEntry {
    Put {
        id: String,
        updated_at: i64,
        data: serde_json::Value,
    },
    Delete {
        id: String,
        at: i64,
    },
}

/// Per-collection counters reported by [`Store::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub records: usize,
    pub log_lines: usize,
}

/// Persistent record store
///
/// Every write goes to the SQLite index inside a transaction and is appended
/// to the collection log before the transaction commits, so a failed append
/// leaves both sides untouched.
pub struct Store {
    base_path: PathBuf,
    conn: Connection,
    durable: bool,
    _lock: File,
}

impl Store {
    /// Open (or create) a store rooted at `path`, then rebuild the index from the logs
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        debug!(base_path = %base_path.display(), "Store::open: called");
        fs::create_dir_all(&base_path).context("Failed to create store directory")?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(base_path.join(LOCK_FILE))
            .context("Failed to open store lock file")?;
        if lock.try_lock_exclusive().is_err() {
            bail!("Store at {} is locked by another process", base_path.display());
        }

        let conn = Connection::open(base_path.join(DB_FILE)).context("Failed to open SQLite index")?;
        conn.execute_batch(SCHEMA).context("Failed to create schema")?;

        let mut store = Self {
            base_path,
            conn,
            durable: true,
            _lock: lock,
        };
        store.sync()?;
        info!(path = %store.base_path.display(), "Opened store");
        Ok(store)
    }

    /// Root directory of the store
    pub fn path(&self) -> &Path {
        &self.base_path
    }

    /// When true (the default) every append is fsynced before the write returns.
    /// When false, appends reach the OS only and [`Store::flush`] makes them durable.
    pub fn set_durable(&mut self, durable: bool) {
        debug!(durable, "Store::set_durable: called");
        self.durable = durable;
    }

    /// Whether appends are fsynced immediately
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    fn log_path(&self, collection: &str) -> PathBuf {
        self.base_path.join(format!("{}.{}", collection, LOG_EXT))
    }

    /// Insert a new record; fails if the id already exists
    pub fn create<T: Record>(&mut self, record: T) -> Result<String> {
        debug!(id = record.id(), collection = T::collection_name(), "Store::create: called");
        if self.exists::<T>(record.id())? {
            bail!("Record {} already exists in {}", record.id(), T::collection_name());
        }
        self.put(&record)?;
        Ok(record.id().to_string())
    }

    /// Replace an existing record; fails if the id is unknown
    pub fn update<T: Record>(&mut self, record: T) -> Result<()> {
        debug!(id = record.id(), collection = T::collection_name(), "Store::update: called");
        if !self.exists::<T>(record.id())? {
            bail!("Record {} not found in {}", record.id(), T::collection_name());
        }
        self.put(&record)
    }

    /// Insert or replace a record
    pub fn put<T: Record>(&mut self, record: &T) -> Result<()> {
        let collection = T::collection_name();
        let data = serde_json::to_value(record).context("Failed to serialize record")?;
        let text = serde_json::to_string(&data)?;
        let entry = LogEntry::Put {
            id: record.id().to_string(),
            updated_at: record.updated_at(),
            data,
        };
        let line = serde_json::to_string(&entry)?;
        let log_path = self.log_path(collection);
        let durable = self.durable;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO records (collection, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![collection, record.id(), text, record.updated_at()],
        )?;
        write_indexes(&tx, collection, record.id(), &record.indexed_fields())?;
        let start = append_line(&log_path, &line, durable)?;
        if let Err(e) = tx.commit() {
            truncate_log(&log_path, start);
            return Err(e).context("Failed to commit record");
        }
        Ok(())
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        debug!(%id, collection = T::collection_name(), "Store::get: called");
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                params![T::collection_name(), id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).context("Failed to deserialize record"))
            .transpose()
    }

    /// Whether a record with this id exists
    pub fn exists<T: Record>(&self, id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete a record; returns false if it did not exist
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<bool> {
        debug!(%id, collection = T::collection_name(), "Store::delete: called");
        if !self.exists::<T>(id)? {
            debug!(%id, "Store::delete: record not found");
            return Ok(false);
        }
        let collection = T::collection_name();
        let line = serde_json::to_string(&LogEntry::Delete {
            id: id.to_string(),
            at: crate::now_ms(),
        })?;
        let log_path = self.log_path(collection);
        let durable = self.durable;

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        let start = append_line(&log_path, &line, durable)?;
        if let Err(e) = tx.commit() {
            truncate_log(&log_path, start);
            return Err(e).context("Failed to commit delete");
        }
        Ok(true)
    }

    /// List records matching every filter, ordered by id
    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        debug!(collection = T::collection_name(), filters = filters.len(), "Store::list: called");
        let mut sql = String::from("SELECT r.data FROM records r WHERE r.collection = ?");
        let mut values: Vec<SqlValue> = vec![SqlValue::Text(T::collection_name().to_string())];

        for filter in filters {
            let (column, value) = match (filter.value.as_text(), filter.value.as_int()) {
                (Some(text), _) => ("value_text", SqlValue::Text(text.to_string())),
                (None, Some(int)) => ("value_int", SqlValue::Integer(int)),
                (None, None) => continue,
            };
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM record_indexes i WHERE i.collection = r.collection \
                 AND i.id = r.id AND i.field = ? AND i.{} {} ?)",
                column,
                filter.op.sql()
            ));
            values.push(SqlValue::Text(filter.field.clone()));
            values.push(value);
        }
        sql.push_str(" ORDER BY r.id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            let data = row?;
            records.push(serde_json::from_str(&data).context("Failed to deserialize record")?);
        }
        Ok(records)
    }

    /// Rebuild the SQLite records table from the JSONL logs
    ///
    /// Field indexes are cleared; call [`Store::rebuild_indexes`] per record type afterwards.
    pub fn sync(&mut self) -> Result<()> {
        debug!(path = %self.base_path.display(), "Store::sync: called");
        let collections = self.collections()?;

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM record_indexes", [])?;

        for collection in &collections {
            let latest = replay_log(&self.base_path.join(format!("{}.{}", collection, LOG_EXT)))?;
            debug!(%collection, count = latest.len(), "Store::sync: replayed collection");
            for (id, (updated_at, data)) in latest {
                tx.execute(
                    "INSERT INTO records (collection, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
                    params![collection, id, serde_json::to_string(&data)?, updated_at],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Recompute field indexes for every record of type `T`
    pub fn rebuild_indexes<T: Record>(&mut self) -> Result<usize> {
        debug!(collection = T::collection_name(), "Store::rebuild_indexes: called");
        let records: Vec<T> = self.list(&[])?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1",
            params![T::collection_name()],
        )?;
        for record in &records {
            write_indexes(&tx, T::collection_name(), record.id(), &record.indexed_fields())?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Rewrite a collection log so it holds one line per live record
    pub fn compact<T: Record>(&mut self) -> Result<usize> {
        debug!(collection = T::collection_name(), "Store::compact: called");
        let log_path = self.log_path(T::collection_name());
        let tmp_path = log_path.with_extension("jsonl.tmp");
        let records: Vec<T> = self.list(&[])?;

        let mut file = File::create(&tmp_path).context("Failed to create compaction file")?;
        for record in &records {
            let entry = LogEntry::Put {
                id: record.id().to_string(),
                updated_at: record.updated_at(),
                data: serde_json::to_value(record)?,
            };
            writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        }
        file.sync_all()?;
        fs::rename(&tmp_path, &log_path).context("Failed to replace log after compaction")?;
        debug!(count = records.len(), "Store::compact: log rewritten");
        Ok(records.len())
    }

    /// fsync every collection log
    pub fn flush(&self) -> Result<()> {
        debug!("Store::flush: called");
        for collection in self.collections()? {
            let path = self.log_path(&collection);
            let file = OpenOptions::new().append(true).open(&path)?;
            file.sync_all()
                .with_context(|| format!("Failed to sync {}", path.display()))?;
        }
        Ok(())
    }

    /// Record and log-line counts for a collection
    pub fn stats<T: Record>(&self) -> Result<StoreStats> {
        let records: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![T::collection_name()],
            |row| row.get(0),
        )?;
        let log_path = self.log_path(T::collection_name());
        let log_lines = if log_path.exists() {
            BufReader::new(File::open(&log_path)?).lines().count()
        } else {
            0
        };
        Ok(StoreStats {
            records: records as usize,
            log_lines,
        })
    }

    fn collections(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(LOG_EXT)
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn write_indexes(
    tx: &Transaction<'_>,
    collection: &str,
    id: &str,
    fields: &HashMap<String, IndexValue>,
) -> Result<()> {
    tx.execute(
        "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
        params![collection, id],
    )?;
    for (field, value) in fields {
        tx.execute(
            "INSERT INTO record_indexes (collection, id, field, value_text, value_int) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![collection, id, field, value.as_text(), value.as_int()],
        )?;
    }
    Ok(())
}

/// Append one line to a log and return the log length before the append
///
/// A failed write or sync cuts the log back to that length, so neither a
/// torn fragment nor an unacknowledged line survives into the next replay.
fn append_line(path: &Path, line: &str, durable: bool) -> Result<u64> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log {}", path.display()))?;
    append_or_rewind(&mut file, |file| {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf)?;
        if durable {
            file.sync_data()?;
        }
        Ok(())
    })
    .with_context(|| format!("Failed to append to log {}", path.display()))
}

fn append_or_rewind(file: &mut File, write: impl FnOnce(&mut File) -> Result<()>) -> Result<u64> {
    let start = file.metadata()?.len();
    if let Err(e) = write(file) {
        if let Err(rewind) = file.set_len(start) {
            warn!(error = %rewind, "Failed to rewind log after a failed append");
        }
        return Err(e);
    }
    Ok(start)
}

/// Drop everything past `len`, used when the index rejects an appended line
fn truncate_log(path: &Path, len: u64) {
    let result = OpenOptions::new().write(true).open(path).and_then(|file| file.set_len(len));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to truncate log after a failed commit");
    }
}

/// Replay a log into the latest `(updated_at, data)` per live id
fn replay_log(path: &Path) -> Result<HashMap<String, (i64, serde_json::Value)>> {
    let mut latest: HashMap<String, (i64, serde_json::Value)> = HashMap::new();
    let file = File::open(path).with_context(|| format!("Failed to open log {}", path.display()))?;

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(LogEntry::Put { id, updated_at, data }) => {
                let newer = latest.get(&id).is_none_or(|(current, _)| updated_at >= *current);
                if newer {
                    latest.insert(id, (updated_at, data));
                }
            }
            Ok(LogEntry::Delete { id, .. }) => {
                latest.remove(&id);
            }
            Err(e) => {
                // A torn final line after a crash is expected; anything else is worth a look.
                warn!(path = %path.display(), line = lineno + 1, error = %e, "Skipping unreadable log line");
            }
        }
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FilterOp;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        kind: String,
        rank: i64,
        updated_at: i64,
    }

    impl Note {
        fn new(id: &str, kind: &str, rank: i64) -> Self {
            Self {
                id: id.to_string(),
                kind: kind.to_string(),
                rank,
                updated_at: crate::now_ms(),
            }
        }
    }

    impl Record for Note {
        fn id(&self) -> &str {
            &self.id
        }

        fn updated_at(&self) -> i64 {
            self.updated_at
        }

        fn collection_name() -> &'static str {
            "notes"
        }

        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut fields = HashMap::new();
            fields.insert("kind".to_string(), IndexValue::String(self.kind.clone()));
            fields.insert("rank".to_string(), IndexValue::Int(self.rank));
            fields
        }
    }

    #[test]
    fn test_crud() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();

        let id = store.create(Note::new("n1", "todo", 1)).unwrap();
        assert_eq!(id, "n1");

        let mut note: Note = store.get("n1").unwrap().unwrap();
        assert_eq!(note.kind, "todo");

        note.kind = "done".to_string();
        store.update(note).unwrap();
        let note: Note = store.get("n1").unwrap().unwrap();
        assert_eq!(note.kind, "done");

        assert!(store.delete::<Note>("n1").unwrap());
        assert!(store.get::<Note>("n1").unwrap().is_none());
        assert!(!store.delete::<Note>("n1").unwrap());
    }

    #[test]
    fn test_create_duplicate_fails() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();
        store.create(Note::new("n1", "todo", 1)).unwrap();
        assert!(store.create(Note::new("n1", "todo", 1)).is_err());
    }

    #[test]
    fn test_update_missing_fails() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();
        assert!(store.update(Note::new("ghost", "todo", 1)).is_err());
    }

    #[test]
    fn test_list_with_filters() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();
        store.create(Note::new("a", "todo", 1)).unwrap();
        store.create(Note::new("b", "done", 2)).unwrap();
        store.create(Note::new("c", "todo", 3)).unwrap();

        let todo: Vec<Note> = store
            .list(&[Filter::eq("kind", IndexValue::String("todo".to_string()))])
            .unwrap();
        assert_eq!(todo.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["a", "c"]);

        let ranked: Vec<Note> = store
            .list(&[Filter {
                field: "rank".to_string(),
                op: FilterOp::Gte,
                value: IndexValue::Int(2),
            }])
            .unwrap();
        assert_eq!(ranked.len(), 2);

        let all: Vec<Note> = store.list(&[]).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_reopen_replays_log() {
        let temp = tempdir().unwrap();
        {
            let mut store = Store::open(temp.path()).unwrap();
            store.create(Note::new("keep", "todo", 1)).unwrap();
            store.create(Note::new("drop", "todo", 1)).unwrap();
            store.delete::<Note>("drop").unwrap();
        }

        // Index is derived; losing it must not lose data
        fs::remove_file(temp.path().join(DB_FILE)).unwrap();

        let mut store = Store::open(temp.path()).unwrap();
        store.rebuild_indexes::<Note>().unwrap();
        let all: Vec<Note> = store.list(&[]).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "keep");

        let todo: Vec<Note> = store
            .list(&[Filter::eq("kind", IndexValue::String("todo".to_string()))])
            .unwrap();
        assert_eq!(todo.len(), 1);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let temp = tempdir().unwrap();
        {
            let mut store = Store::open(temp.path()).unwrap();
            store.create(Note::new("n1", "todo", 1)).unwrap();
        }
        let log = temp.path().join("notes.jsonl");
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(b"{\"op\":\"put\",\"id\":\"n2\",\"upd").unwrap();
        drop(file);

        let store = Store::open(temp.path()).unwrap();
        let all: Vec<Note> = store.list(&[]).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_failed_append_rewinds_log() {
        let temp = tempdir().unwrap();
        {
            let mut store = Store::open(temp.path()).unwrap();
            store.create(Note::new("n1", "todo", 1)).unwrap();
        }
        let log = temp.path().join("notes.jsonl");
        let before = fs::read(&log).unwrap();

        // A complete line whose sync fails must not come back on replay
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        let result = append_or_rewind(&mut file, |file| {
            file.write_all(b"{\"op\":\"delete\",\"id\":\"n1\",\"at\":1}\n")?;
            bail!("sync failed")
        });
        assert!(result.is_err());

        // Same for a torn fragment
        let result = append_or_rewind(&mut file, |file| {
            file.write_all(b"{\"op\":\"put\",\"id\":\"n2")?;
            bail!("disk full")
        });
        assert!(result.is_err());
        drop(file);
        assert_eq!(fs::read(&log).unwrap(), before);

        let mut store = Store::open(temp.path()).unwrap();
        store.create(Note::new("n3", "todo", 3)).unwrap();
        drop(store);

        let store = Store::open(temp.path()).unwrap();
        let ids: Vec<String> = store.list::<Note>(&[]).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["n1".to_string(), "n3".to_string()]);
    }

    #[test]
    fn test_compact_shrinks_log() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();
        let mut note = Note::new("n1", "todo", 1);
        store.create(note.clone()).unwrap();
        for rank in 2..6 {
            note.rank = rank;
            store.update(note.clone()).unwrap();
        }
        assert_eq!(store.stats::<Note>().unwrap().log_lines, 5);

        store.compact::<Note>().unwrap();
        let stats = store.stats::<Note>().unwrap();
        assert_eq!(stats.log_lines, 1);
        assert_eq!(stats.records, 1);
        let note: Note = store.get("n1").unwrap().unwrap();
        assert_eq!(note.rank, 5);
    }

    #[test]
    fn test_second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _store = Store::open(temp.path()).unwrap();
        assert!(Store::open(temp.path()).is_err());
    }

    #[test]
    fn test_non_durable_flush() {
        let temp = tempdir().unwrap();
        let mut store = Store::open(temp.path()).unwrap();
        store.set_durable(false);
        assert!(!store.is_durable());
        store.create(Note::new("n1", "todo", 1)).unwrap();
        store.flush().unwrap();
        drop(store);

        let store = Store::open(temp.path()).unwrap();
        assert!(store.get::<Note>("n1").unwrap().is_some());
    }
}
