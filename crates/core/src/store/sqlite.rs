use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{EventFilter, RunStore, StoreError};
use crate::batch::{Batch, BatchId};
use crate::events::{Event, EventKind, EventLevel};
use crate::task::{Task, TaskId};

const RUN_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS batches (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        state TEXT NOT NULL,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tasks (
        batch_id TEXT NOT NULL,
        account_id INTEGER NOT NULL,
        repetition INTEGER NOT NULL,
        task_id TEXT NOT NULL,
        status TEXT NOT NULL,
        error_kind TEXT,
        data TEXT NOT NULL,
        PRIMARY KEY (batch_id, account_id, repetition)
    );

    CREATE TABLE IF NOT EXISTS events (
        batch_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        task_id TEXT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        level_rank INTEGER NOT NULL,
        kind TEXT NOT NULL,
        step TEXT,
        message TEXT NOT NULL,
        metadata TEXT NOT NULL,
        PRIMARY KEY (batch_id, seq)
    );

    CREATE INDEX IF NOT EXISTS idx_batches_created_at ON batches(created_at);
    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(batch_id, status);
    CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
    CREATE INDEX IF NOT EXISTS idx_events_task_id ON events(task_id);
    CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
"#;

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn level_rank(level: EventLevel) -> i64 {
    match level {
        EventLevel::Debug => 0,
        EventLevel::Info => 1,
        EventLevel::Warn => 2,
        EventLevel::Error => 3,
    }
}

/// SQLite-backed run history store
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    /// Open (or create) the database file and its tables
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::from_connection(conn)
    }

    /// In-memory store (useful for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(RUN_SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Database(format!("connection lock poisoned: {}", e)))
    }

    fn build_where_clause(filter: &EventFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(batch_id) = filter.batch_id {
            conditions.push("batch_id = ?");
            params.push(Box::new(batch_id.to_string()));
        }

        if let Some(task_id) = filter.task_id {
            conditions.push("task_id = ?");
            params.push(Box::new(task_id.to_string()));
        }

        if let Some(kind) = filter.kind {
            conditions.push("kind = ?");
            params.push(Box::new(kind.as_str()));
        }

        if let Some(level) = filter.min_level {
            conditions.push("level_rank >= ?");
            params.push(Box::new(level_rank(level)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn upsert_task(conn: &Connection, task: &Task) -> Result<(), StoreError> {
        let data =
            serde_json::to_string(task).map_err(|e| StoreError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO tasks (batch_id, account_id, repetition, task_id, status, error_kind, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(batch_id, account_id, repetition) DO UPDATE SET
                task_id = excluded.task_id,
                status = excluded.status,
                error_kind = excluded.error_kind,
                data = excluded.data",
            params![
                task.batch_id.to_string(),
                task.account_id as i64,
                task.repetition as i64,
                task.id.to_string(),
                task.status.as_str(),
                task.error_kind.map(|k| k.as_str()),
                data,
            ],
        )
        .map_err(db_err)?;

        Ok(())
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(Into::into)
        .map_err(|e| StoreError::Database(format!("Invalid timestamp: {}", e)))
}

impl RunStore for SqliteRunStore {
    /// Upsert a batch row. A row already in a terminal state is left as is.
    fn save_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let data =
            serde_json::to_string(batch).map_err(|e| StoreError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO batches (id, created_at, state, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET state = excluded.state, data = excluded.data
             WHERE batches.state = 'running'",
            params![
                batch.id.to_string(),
                batch.created_at.to_rfc3339(),
                batch.state.as_str(),
                data,
            ],
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn load_batch(&self, id: &BatchId) -> Result<Option<Batch>, StoreError> {
        let conn = self.conn()?;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM batches WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        data.map(|json| {
            serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    fn list_batches(&self, limit: i64) -> Result<Vec<Batch>, StoreError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare("SELECT data FROM batches ORDER BY created_at DESC LIMIT ?1")
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![limit], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut batches = Vec::new();
        for row in rows {
            let json = row.map_err(db_err)?;
            batches.push(
                serde_json::from_str(&json)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            );
        }
        Ok(batches)
    }

    fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.conn()?;
        Self::upsert_task(&conn, task)
    }

    fn save_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        for task in tasks {
            Self::upsert_task(&tx, task)?;
        }
        tx.commit().map_err(db_err)
    }

    fn list_tasks(&self, batch_id: &BatchId) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT data FROM tasks WHERE batch_id = ?1 ORDER BY account_id ASC, repetition ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![batch_id.to_string()], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut tasks = Vec::new();
        for row in rows {
            let json = row.map_err(db_err)?;
            tasks.push(
                serde_json::from_str(&json)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            );
        }
        Ok(tasks)
    }

    fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let conn = self.conn()?;

        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let seq: i64 = match event.seq {
            Some(seq) => seq as i64,
            None => conn
                .query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE batch_id = ?1",
                    params![event.batch_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(db_err)?,
        };

        conn.execute(
            "INSERT INTO events (batch_id, seq, task_id, timestamp, level, level_rank, kind, step, message, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.batch_id.to_string(),
                seq,
                event.task_id.map(|id| id.to_string()),
                event.timestamp.to_rfc3339(),
                event.level.as_str(),
                level_rank(event.level),
                event.kind.as_str(),
                event.step,
                event.message,
                metadata,
            ],
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn query_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT batch_id, seq, task_id, timestamp, level, kind, step, message, metadata
             FROM events {} ORDER BY timestamp ASC, seq ASC LIMIT ? OFFSET ?",
            where_clause
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .map_err(db_err)?;

        let mut events = Vec::new();
        for row in rows {
            let (batch_id, seq, task_id, timestamp, level, kind, step, message, metadata) =
                row.map_err(db_err)?;

            let batch_id = batch_id
                .parse::<BatchId>()
                .map_err(|e| StoreError::Database(format!("Invalid batch id: {}", e)))?;
            let task_id = task_id
                .map(|id| id.parse::<TaskId>())
                .transpose()
                .map_err(|e| StoreError::Database(format!("Invalid task id: {}", e)))?;
            let level = EventLevel::parse(&level)
                .ok_or_else(|| StoreError::Database(format!("Invalid event level: {}", level)))?;
            let kind = EventKind::parse(&kind)
                .ok_or_else(|| StoreError::Database(format!("Invalid event kind: {}", kind)))?;
            let metadata = serde_json::from_str(&metadata)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            events.push(Event {
                batch_id,
                seq: Some(seq as u64),
                task_id,
                timestamp: parse_timestamp(&timestamp)?,
                level,
                kind,
                step,
                message,
                metadata,
            });
        }

        Ok(events)
    }

    fn count_events(&self, filter: &EventFilter) -> Result<i64, StoreError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM events {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::batch::{AccountRange, BatchCounters, BatchMode, BatchState};
    use crate::task::{ErrorKind, Outcome, TaskStatus};

    fn sample_batch() -> Batch {
        Batch {
            id: BatchId::new(),
            created_at: Utc::now(),
            range: AccountRange::new(1, 3),
            repetition_count: 1,
            concurrency_limit: 2,
            mode: BatchMode::Checkpoint,
            state: BatchState::Running,
            counters: BatchCounters::new(3),
            stop_requested: false,
            finished_at: None,
            total_points: None,
        }
    }

    fn event(batch_id: BatchId, kind: EventKind, level: EventLevel, msg: &str) -> Event {
        Event::new(batch_id, level, kind, msg)
    }

    #[test]
    fn test_save_and_load_batch() {
        let store = SqliteRunStore::in_memory().unwrap();
        let mut batch = sample_batch();
        store.save_batch(&batch).unwrap();

        batch.state = BatchState::Completed;
        store.save_batch(&batch).unwrap();

        let loaded = store.load_batch(&batch.id).unwrap().unwrap();
        assert_eq!(loaded.state, BatchState::Completed);
        assert_eq!(loaded.range, batch.range);
        assert!(store.load_batch(&BatchId::new()).unwrap().is_none());
        assert_eq!(store.list_batches(10).unwrap().len(), 1);
    }

    #[test]
    fn test_terminal_batch_is_not_overwritten() {
        let store = SqliteRunStore::in_memory().unwrap();
        let mut batch = sample_batch();
        let running = batch.clone();

        batch.state = BatchState::Stopped;
        batch.stop_requested = true;
        store.save_batch(&batch).unwrap();
        store.save_batch(&running).unwrap();

        let loaded = store.load_batch(&batch.id).unwrap().unwrap();
        assert_eq!(loaded.state, BatchState::Stopped);
        assert!(loaded.stop_requested);
    }

    #[test]
    fn test_task_keyed_by_account_and_repetition() {
        let store = SqliteRunStore::in_memory().unwrap();
        let batch_id = BatchId::new();

        let mut task = Task::pending(batch_id, 5, 0);
        store.save_task(&task).unwrap();
        store.save_task(&Task::pending(batch_id, 5, 1)).unwrap();
        store.save_task(&Task::pending(batch_id, 2, 0)).unwrap();

        task.status = TaskStatus::Running;
        task.finish(&Outcome::failed(ErrorKind::SessionExpired, "302"));
        store.save_task(&task).unwrap();

        let tasks = store.list_tasks(&batch_id).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!((tasks[0].account_id, tasks[0].repetition), (2, 0));
        assert_eq!((tasks[1].account_id, tasks[1].repetition), (5, 0));
        assert_eq!(tasks[1].status, TaskStatus::Failed);
        assert_eq!(tasks[1].error_kind, Some(ErrorKind::SessionExpired));
    }

    #[test]
    fn test_save_tasks_in_one_transaction() {
        let store = SqliteRunStore::in_memory().unwrap();
        let batch_id = BatchId::new();
        let tasks: Vec<Task> = (1..=4).map(|a| Task::pending(batch_id, a, 0)).collect();

        store.save_tasks(&tasks).unwrap();
        assert_eq!(store.list_tasks(&batch_id).unwrap().len(), 4);
    }

    #[test]
    fn test_append_assigns_missing_sequence() {
        let store = SqliteRunStore::in_memory().unwrap();
        let batch_id = BatchId::new();

        store
            .append_event(&event(batch_id, EventKind::Log, EventLevel::Info, "a"))
            .unwrap();
        store
            .append_event(&event(batch_id, EventKind::Log, EventLevel::Info, "b"))
            .unwrap();

        let events = store
            .query_events(&EventFilter::new().with_batch_id(batch_id))
            .unwrap();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let store = SqliteRunStore::in_memory().unwrap();
        let mut e = event(BatchId::new(), EventKind::Log, EventLevel::Info, "a");
        e.seq = Some(1);

        store.append_event(&e).unwrap();
        assert!(matches!(store.append_event(&e), Err(StoreError::Database(_))));
    }

    #[test]
    fn test_query_events_filters() {
        let store = SqliteRunStore::in_memory().unwrap();
        let batch_id = BatchId::new();
        let other = BatchId::new();

        store
            .append_event(&event(batch_id, EventKind::BatchStarted, EventLevel::Info, "s"))
            .unwrap();
        store
            .append_event(&event(batch_id, EventKind::StepFailed, EventLevel::Warn, "w"))
            .unwrap();
        store
            .append_event(&event(batch_id, EventKind::StepGaveUp, EventLevel::Error, "e"))
            .unwrap();
        store
            .append_event(&event(other, EventKind::BatchStarted, EventLevel::Info, "o"))
            .unwrap();

        let filter = EventFilter::new().with_batch_id(batch_id);
        assert_eq!(store.count_events(&filter).unwrap(), 3);

        let warn_up = filter.clone().with_min_level(EventLevel::Warn);
        let events = store.query_events(&warn_up).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::StepFailed);

        let started = EventFilter::new().with_kind(EventKind::BatchStarted);
        assert_eq!(store.count_events(&started).unwrap(), 2);

        let page = filter.with_limit(1).with_offset(1);
        let events = store.query_events(&page).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "w");
    }

    #[test]
    fn test_metadata_round_trips() {
        let store = SqliteRunStore::in_memory().unwrap();
        let batch_id = BatchId::new();
        let e = event(batch_id, EventKind::StepFailed, EventLevel::Warn, "w")
            .with_step("checkout")
            .with_metadata(serde_json::json!({"attempt": 1, "will_retry": true}));
        store.append_event(&e).unwrap();

        let stored = &store
            .query_events(&EventFilter::new().with_batch_id(batch_id))
            .unwrap()[0];
        assert_eq!(stored.step.as_deref(), Some("checkout"));
        assert_eq!(stored.metadata["will_retry"], true);
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let batch = sample_batch();

        {
            let store = SqliteRunStore::new(&path).unwrap();
            store.save_batch(&batch).unwrap();
        }

        let store = SqliteRunStore::new(&path).unwrap();
        assert!(store.load_batch(&batch.id).unwrap().is_some());
    }
}
