//! SQLite row store
//!
//! Backs memories, edges, and events. Separate reader/writer connections
//! behind mutexes so every method takes `&self` and the store is
//! `Send + Sync`. Transient driver errors (busy/locked) are retried twice
//! with a 100 ms backoff before surfacing as `StorageTransient`.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::memory::{
    DamageLevel, Edge, EdgeType, EventType, ExposureStatus, MemoryEvent, MemoryRecord,
    MemoryState, Outcome, ViolationRecord,
};

/// Hard ceiling on bind parameters per prepared statement
pub const MAX_BIND_PARAMS: usize = 95;

/// Retries on a transient driver error before giving up
const TRANSIENT_RETRIES: u32 = 2;

/// Backoff between transient retries
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Every column of the memories table, in persisted order
const MEMORY_COLUMNS: &str = "id, content, source, source_url, derived_from, assumes, \
     invalidates_if, confirms_if, tags, violations, outcome_condition, resolves_by, \
     starting_confidence, confirmations, times_tested, contradictions, centrality, \
     propagated_confidence, state, outcome, retracted, exposure_check_status, \
     exposure_check_completed_at, cascade_boosts, cascade_damages, last_cascade_at, \
     surprise, created_at, updated_at";

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed row store for memories, edges, and events
pub struct SqliteStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl SqliteStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open a store at `db_path`, or at the platform data directory
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("ai", "credence", "core").ok_or_else(|| {
                    CoreError::Init("could not determine project directories".to_string())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("credence.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    /// Open an isolated in-memory store (shared between both connections)
    pub fn in_memory() -> Result<Self> {
        let uri = format!(
            "file:credence-{}?mode=memory&cache=shared",
            Uuid::new_v4().simple()
        );
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let writer_conn = Connection::open_with_flags(&uri, flags)?;
        super::migrations::apply_migrations(&writer_conn)?;
        let reader_conn = Connection::open_with_flags(&uri, flags)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    /// True for driver errors worth retrying
    fn is_transient(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }

    /// Run `op` on the writer connection with the transient retry budget
    async fn with_writer<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        self.with_conn(&self.writer, op).await
    }

    /// Run `op` on the reader connection with the transient retry budget
    async fn with_reader<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        self.with_conn(&self.reader, op).await
    }

    async fn with_conn<T, F>(&self, slot: &Mutex<Connection>, op: F) -> Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = {
                let conn = slot
                    .lock()
                    .map_err(|_| CoreError::Init("connection lock poisoned".to_string()))?;
                op(&conn)
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if Self::is_transient(&err) => {
                    if attempt >= TRANSIENT_RETRIES {
                        return Err(CoreError::StorageTransient(err.to_string()));
                    }
                    attempt += 1;
                    tracing::debug!(attempt, "transient storage error, backing off: {}", err);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    // ========================================================================
    // MEMORIES
    // ========================================================================

    /// Fetch a memory by id
    pub async fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let id = id.to_string();
        self.with_reader(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM memories WHERE id = ?1", MEMORY_COLUMNS),
                params![id],
                row_to_memory,
            )
            .optional()
        })
        .await
    }

    /// Insert or fully replace a memory row
    pub async fn put_memory(&self, record: &MemoryRecord) -> Result<()> {
        let record = record.clone();
        self.with_writer(move |conn| execute_put_memory(conn, &record))
            .await
    }

    /// Compare-and-set write: replaces the row only when its stored
    /// `updated_at` still equals `expected_updated_at`.
    pub async fn put_memory_cas(
        &self,
        record: &MemoryRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let record = record.clone();
        self.with_writer(move |conn| {
            let current: Option<String> = conn
                .query_row(
                    "SELECT updated_at FROM memories WHERE id = ?1",
                    params![record.id],
                    |row| row.get(0),
                )
                .optional()?;
            match current {
                Some(stored) if stored == expected_updated_at.to_rfc3339() => {
                    execute_put_memory(conn, &record)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }

    /// Read-modify-write with optimistic per-id serialisation
    ///
    /// Fetches the row, applies `mutate`, bumps `updated_at`, and writes it
    /// back conditionally on the version it read. Retries the whole cycle on
    /// contention.
    pub async fn modify_memory<F>(&self, id: &str, mutate: F) -> Result<MemoryRecord>
    where
        F: Fn(&mut MemoryRecord),
    {
        for _ in 0..4 {
            let mut record = self
                .get_memory(id)
                .await?
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
            let expected = record.updated_at;
            mutate(&mut record);
            record.updated_at = Utc::now();
            if self.put_memory_cas(&record, expected).await? {
                return Ok(record);
            }
        }
        Err(CoreError::StorageTransient(format!(
            "write contention on memory {}",
            id
        )))
    }

    /// Transactionally create a memory row together with its derivation
    /// edges and the parents' centrality increments.
    pub async fn create_memory(&self, record: &MemoryRecord) -> Result<()> {
        let record = record.clone();
        self.with_writer(move |conn| {
            let tx = conn.unchecked_transaction()?;
            execute_put_memory(&tx, &record)?;
            let now = Utc::now().to_rfc3339();
            for parent in &record.derived_from {
                tx.execute(
                    "INSERT INTO edges (id, source_id, target_id, edge_type, strength, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'derived_from', 1.0, ?4, ?4)
                     ON CONFLICT(source_id, target_id, edge_type) DO NOTHING",
                    params![Uuid::new_v4().to_string(), parent, record.id, now],
                )?;
                tx.execute(
                    "UPDATE memories SET centrality = centrality + 1, updated_at = ?2
                     WHERE id = ?1",
                    params![parent, now],
                )?;
            }
            tx.commit()
        })
        .await
    }

    /// Fetch rows for `ids`, preserving input order and omitting misses
    pub async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut found: std::collections::HashMap<String, MemoryRecord> =
            std::collections::HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_BIND_PARAMS) {
            let chunk_vec: Vec<String> = chunk.to_vec();
            let rows = self
                .with_reader(move |conn| {
                    let sql = format!(
                        "SELECT {} FROM memories WHERE id IN ({})",
                        MEMORY_COLUMNS,
                        placeholders(chunk_vec.len(), 1)
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(
                        rusqlite::params_from_iter(chunk_vec.iter()),
                        row_to_memory,
                    )?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()
                })
                .await?;
            for row in rows {
                found.insert(row.id.clone(), row);
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    /// Ids of non-retracted memories in a given state
    pub async fn list_ids_by_state(&self, state: MemoryState) -> Result<Vec<String>> {
        let state = state.as_str().to_string();
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM memories WHERE state = ?1 AND retracted = 0 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![state], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()
        })
        .await
    }

    /// Active memories ranked by stored surprise, highest first
    pub async fn list_surprise_ranked(&self, limit: usize) -> Result<Vec<(String, f64)>> {
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, surprise FROM memories
                 WHERE retracted = 0 AND state = 'active' AND surprise IS NOT NULL
                 ORDER BY surprise DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    /// Largest `times_tested` across all memories
    pub async fn max_times_tested(&self) -> Result<u32> {
        self.with_reader(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(times_tested), 0) FROM memories",
                [],
                |row| row.get(0),
            )
        })
        .await
    }

    /// Dangling derivation references: (memory_id, missing_parent_id)
    ///
    /// The janitor listing for inconsistency repair; readers omit these
    /// references, this query surfaces them.
    pub async fn dangling_derived_refs(&self) -> Result<Vec<(String, String)>> {
        let rows = self
            .with_reader(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, derived_from FROM memories WHERE derived_from != '[]'")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        let mut dangling = vec![];
        for (id, raw) in rows {
            for parent in parse_string_array(&raw, &id, "derived_from") {
                if self.get_memory(&parent).await?.is_none() {
                    dangling.push((id.clone(), parent));
                }
            }
        }
        Ok(dangling)
    }

    // ========================================================================
    // EDGES
    // ========================================================================

    /// Merge-upsert an edge on its (source, target, type) triple
    ///
    /// New strength is `min(1, old + delta)`; creation timestamps are kept
    /// and `updated_at` is bumped on merge.
    pub async fn upsert_edge(
        &self,
        source_id: &str,
        target_id: &str,
        edge_type: EdgeType,
        delta: f32,
    ) -> Result<Edge> {
        let source_id = source_id.to_string();
        let target_id = target_id.to_string();
        let delta = delta.clamp(0.0, 1.0);
        self.with_writer(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO edges (id, source_id, target_id, edge_type, strength, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(source_id, target_id, edge_type)
                 DO UPDATE SET strength = MIN(1.0, strength + ?5), updated_at = ?6",
                params![
                    Uuid::new_v4().to_string(),
                    source_id,
                    target_id,
                    edge_type.as_str(),
                    delta,
                    now
                ],
            )?;
            conn.query_row(
                "SELECT id, source_id, target_id, edge_type, strength, created_at, updated_at
                 FROM edges WHERE source_id = ?1 AND target_id = ?2 AND edge_type = ?3",
                params![source_id, target_id, edge_type.as_str()],
                row_to_edge,
            )
        })
        .await
    }

    /// Edges of the given types with either endpoint in `ids`, at or above
    /// `min_strength`. IN-clauses are chunked under the bind-parameter cap;
    /// the id set is spread twice per statement.
    pub async fn list_edges_incident(
        &self,
        ids: &[String],
        types: &[EdgeType],
        min_strength: f32,
    ) -> Result<Vec<Edge>> {
        if ids.is_empty() || types.is_empty() {
            return Ok(vec![]);
        }
        // ids appear twice, types once, strength is one scalar
        let chunk_size = (MAX_BIND_PARAMS - 1 - types.len()) / 2;
        let type_names: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();

        let mut seen = std::collections::HashSet::new();
        let mut edges = vec![];
        for chunk in ids.chunks(chunk_size) {
            let chunk_vec: Vec<String> = chunk.to_vec();
            let type_names = type_names.clone();
            let rows = self
                .with_reader(move |conn| {
                    let n = chunk_vec.len();
                    let sql = format!(
                        "SELECT id, source_id, target_id, edge_type, strength, created_at, updated_at
                         FROM edges
                         WHERE (source_id IN ({}) OR target_id IN ({}))
                           AND edge_type IN ({})
                           AND strength >= {}",
                        placeholders(n, 1),
                        placeholders(n, n + 1),
                        placeholders(type_names.len(), 2 * n + 1),
                        format_args!("?{}", 2 * n + type_names.len() + 1),
                    );
                    let mut binds: Vec<&dyn rusqlite::ToSql> = vec![];
                    for id in &chunk_vec {
                        binds.push(id);
                    }
                    for id in &chunk_vec {
                        binds.push(id);
                    }
                    for name in &type_names {
                        binds.push(name);
                    }
                    binds.push(&min_strength);

                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(&binds[..], row_to_edge)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()
                })
                .await?;
            for edge in rows {
                if seen.insert(edge.id.clone()) {
                    edges.push(edge);
                }
            }
        }
        Ok(edges)
    }

    /// All edges of the given types at or above `min_strength`
    ///
    /// Full-scan variant used by the whole-graph propagator for component
    /// discovery.
    pub async fn list_edges_by_types(
        &self,
        types: &[EdgeType],
        min_strength: f32,
    ) -> Result<Vec<Edge>> {
        let type_names: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
        self.with_reader(move |conn| {
            let sql = format!(
                "SELECT id, source_id, target_id, edge_type, strength, created_at, updated_at
                 FROM edges WHERE edge_type IN ({}) AND strength >= ?{}",
                placeholders(type_names.len(), 1),
                type_names.len() + 1,
            );
            let mut binds: Vec<&dyn rusqlite::ToSql> = vec![];
            for name in &type_names {
                binds.push(name);
            }
            binds.push(&min_strength);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(&binds[..], row_to_edge)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    // ========================================================================
    // EVENTS
    // ========================================================================

    /// Append an event; duplicate ids are ignored (idempotent)
    pub async fn append_event(&self, event: &MemoryEvent) -> Result<()> {
        let event = event.clone();
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO events
                 (id, session_id, event_type, memory_id, violated_by, damage_level,
                  context, created_at, dispatched, dispatched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.id,
                    event.session_id,
                    event.event_type.as_str(),
                    event.memory_id,
                    event.violated_by,
                    event.damage_level.map(|d| d.as_str()),
                    event.context.to_string(),
                    event.created_at.to_rfc3339(),
                    event.dispatched as i32,
                    event.dispatched_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Claim the first `limit` undispatched events of a session, FIFO by
    /// `created_at`, marking them dispatched in the same transaction.
    pub async fn claim_due_events(&self, session_id: &str, limit: usize) -> Result<Vec<MemoryEvent>> {
        let session_id = session_id.to_string();
        self.with_writer(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let events = {
                let mut stmt = tx.prepare(
                    "SELECT id, session_id, event_type, memory_id, violated_by, damage_level,
                            context, created_at, dispatched, dispatched_at
                     FROM events
                     WHERE session_id = ?1 AND dispatched = 0
                     ORDER BY created_at, id
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![session_id, limit as i64], row_to_event)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let now = Utc::now();
            for event in &events {
                tx.execute(
                    "UPDATE events SET dispatched = 1, dispatched_at = ?2 WHERE id = ?1",
                    params![event.id, now.to_rfc3339()],
                )?;
            }
            tx.commit()?;
            Ok(events
                .into_iter()
                .map(|mut e| {
                    e.dispatched = true;
                    e.dispatched_at = Some(now);
                    e
                })
                .collect())
        })
        .await
    }

    /// Claim a single event by id; `None` when missing or already dispatched
    ///
    /// The dispatched bit is what makes replayed cascade applications no-ops.
    pub async fn claim_event(&self, event_id: &str) -> Result<Option<MemoryEvent>> {
        let event_id = event_id.to_string();
        self.with_writer(move |conn| {
            let now = Utc::now();
            let claimed = conn.execute(
                "UPDATE events SET dispatched = 1, dispatched_at = ?2
                 WHERE id = ?1 AND dispatched = 0",
                params![event_id, now.to_rfc3339()],
            )?;
            if claimed == 0 {
                return Ok(None);
            }
            conn.query_row(
                "SELECT id, session_id, event_type, memory_id, violated_by, damage_level,
                        context, created_at, dispatched, dispatched_at
                 FROM events WHERE id = ?1",
                params![event_id],
                row_to_event,
            )
            .optional()
        })
        .await
    }

    /// All events of a session, FIFO, dispatched or not
    pub async fn list_events(&self, session_id: &str) -> Result<Vec<MemoryEvent>> {
        let session_id = session_id.to_string();
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, event_type, memory_id, violated_by, damage_level,
                        context, created_at, dispatched, dispatched_at
                 FROM events WHERE session_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map(params![session_id], row_to_event)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    /// Administrative purge of dispatched events older than `before`
    pub async fn purge_dispatched_events(&self, before: DateTime<Utc>) -> Result<usize> {
        self.with_writer(move |conn| {
            conn.execute(
                "DELETE FROM events WHERE dispatched = 1 AND created_at < ?1",
                params![before.to_rfc3339()],
            )
        })
        .await
    }

    // ========================================================================
    // SOURCE STATS AND LOCKS
    // ========================================================================

    /// Empirical starting confidence for a source, if recorded
    pub async fn source_confidence(&self, source: &str) -> Result<Option<f64>> {
        let source = source.to_string();
        self.with_reader(move |conn| {
            conn.query_row(
                "SELECT starting_confidence FROM source_stats WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    /// Record empirical starting confidence for a source
    pub async fn put_source_confidence(
        &self,
        source: &str,
        confidence: f64,
        sample_count: u32,
    ) -> Result<()> {
        let source = source.to_string();
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT INTO source_stats (source, starting_confidence, sample_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source) DO UPDATE SET
                   starting_confidence = ?2, sample_count = ?3, updated_at = ?4",
                params![source, confidence, sample_count, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Fold one resolution outcome into a source's empirical confidence
    ///
    /// Running mean over `sample_count`: a correct outcome contributes 1.0,
    /// an incorrect one 0.0. The first sample seeds the row.
    pub async fn record_source_outcome(&self, source: &str, correct: bool) -> Result<()> {
        let source = source.to_string();
        let score = if correct { 1.0f64 } else { 0.0f64 };
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT INTO source_stats (source, starting_confidence, sample_count, updated_at)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(source) DO UPDATE SET
                   starting_confidence =
                     (starting_confidence * sample_count + ?2) / (sample_count + 1),
                   sample_count = sample_count + 1,
                   updated_at = ?3",
                params![source, score, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Best-effort advisory lock; true when acquired
    ///
    /// An expired lock row is taken over. Backs the full-graph propagation
    /// singleton.
    pub async fn try_acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let name = name.to_string();
        let holder = holder.to_string();
        self.with_writer(move |conn| {
            let now = Utc::now();
            let expires = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(5));
            conn.execute(
                "DELETE FROM advisory_locks WHERE name = ?1 AND expires_at < ?2",
                params![name, now.to_rfc3339()],
            )?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO advisory_locks (name, holder, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, holder, now.to_rfc3339(), expires.to_rfc3339()],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    /// Release an advisory lock held by `holder`
    pub async fn release_lock(&self, name: &str, holder: &str) -> Result<()> {
        let name = name.to_string();
        let holder = holder.to_string();
        self.with_writer(move |conn| {
            conn.execute(
                "DELETE FROM advisory_locks WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )?;
            Ok(())
        })
        .await
    }

    // ========================================================================
    // AGGREGATES
    // ========================================================================

    /// Memory counts grouped by state
    pub async fn count_by_state(&self) -> Result<Vec<(MemoryState, i64)>> {
        let rows = self
            .with_reader(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT state, COUNT(*) FROM memories WHERE retracted = 0 GROUP BY state",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(name, count)| MemoryState::parse_name(&name).map(|s| (s, count)))
            .collect())
    }

    /// (with_violations, without_violations) among non-retracted memories
    pub async fn violation_presence_counts(&self) -> Result<(i64, i64)> {
        self.with_reader(|conn| {
            let with: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE retracted = 0 AND violations != '[]'",
                [],
                |row| row.get(0),
            )?;
            let without: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE retracted = 0 AND violations = '[]'",
                [],
                |row| row.get(0),
            )?;
            Ok((with, without))
        })
        .await
    }

    /// Robustness tiers: (untested, fragile, contested, robust)
    ///
    /// Tested memories band by survival rate at 0.5 and 0.8.
    pub async fn robustness_tier_counts(&self) -> Result<(i64, i64, i64, i64)> {
        self.with_reader(|conn| {
            conn.query_row(
                "SELECT
                   SUM(CASE WHEN times_tested = 0 THEN 1 ELSE 0 END),
                   SUM(CASE WHEN times_tested > 0
                            AND CAST(confirmations AS REAL) / times_tested < 0.5
                            THEN 1 ELSE 0 END),
                   SUM(CASE WHEN times_tested > 0
                            AND CAST(confirmations AS REAL) / times_tested >= 0.5
                            AND CAST(confirmations AS REAL) / times_tested < 0.8
                            THEN 1 ELSE 0 END),
                   SUM(CASE WHEN times_tested > 0
                            AND CAST(confirmations AS REAL) / times_tested >= 0.8
                            THEN 1 ELSE 0 END)
                 FROM memories WHERE retracted = 0",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    ))
                },
            )
        })
        .await
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

/// `?i, ?i+1, …` placeholder list starting at position `start`
fn placeholders(count: usize, start: usize) -> String {
    (0..count)
        .map(|i| format!("?{}", start + i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn execute_put_memory(conn: &Connection, record: &MemoryRecord) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO memories ({}) VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
              ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)",
            MEMORY_COLUMNS
        ),
        params![
            record.id,
            record.content,
            record.source,
            record.source_url,
            to_json_text(&record.derived_from),
            to_json_text(&record.assumes),
            to_json_text(&record.invalidates_if),
            to_json_text(&record.confirms_if),
            to_json_text(&record.tags),
            to_json_text(&record.violations),
            record.outcome_condition,
            record.resolves_by.map(|t| t.to_rfc3339()),
            record.starting_confidence,
            record.confirmations,
            record.times_tested,
            record.contradictions,
            record.centrality,
            record.propagated_confidence,
            record.state.as_str(),
            record.outcome.map(|o| o.as_str()),
            record.retracted as i32,
            record.exposure_check_status.as_str(),
            record.exposure_check_completed_at.map(|t| t.to_rfc3339()),
            record.cascade_boosts,
            record.cascade_damages,
            record.last_cascade_at.map(|t| t.to_rfc3339()),
            record.surprise,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn to_json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a JSON string array column, warning and falling back on damage
fn parse_string_array(raw: &str, id: &str, column: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(memory_id = id, column, "malformed JSON column: {}", e);
        vec![]
    })
}

fn parse_violations(raw: &str, id: &str) -> Vec<ViolationRecord> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(memory_id = id, "malformed violations column: {}", e);
        vec![]
    })
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(&s)).transpose()
}

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let id: String = row.get("id")?;
    let derived_from: String = row.get("derived_from")?;
    let assumes: String = row.get("assumes")?;
    let invalidates_if: String = row.get("invalidates_if")?;
    let confirms_if: String = row.get("confirms_if")?;
    let tags: String = row.get("tags")?;
    let violations: String = row.get("violations")?;
    let state: String = row.get("state")?;
    let outcome: Option<String> = row.get("outcome")?;
    let exposure: String = row.get("exposure_check_status")?;

    Ok(MemoryRecord {
        content: row.get("content")?,
        source: row.get("source")?,
        source_url: row.get("source_url")?,
        derived_from: parse_string_array(&derived_from, &id, "derived_from"),
        assumes: parse_string_array(&assumes, &id, "assumes"),
        invalidates_if: parse_string_array(&invalidates_if, &id, "invalidates_if"),
        confirms_if: parse_string_array(&confirms_if, &id, "confirms_if"),
        tags: parse_string_array(&tags, &id, "tags"),
        violations: parse_violations(&violations, &id),
        outcome_condition: row.get("outcome_condition")?,
        resolves_by: parse_opt_ts(row.get("resolves_by")?)?,
        starting_confidence: row.get("starting_confidence")?,
        confirmations: row.get("confirmations")?,
        times_tested: row.get("times_tested")?,
        contradictions: row.get("contradictions")?,
        centrality: row.get("centrality")?,
        propagated_confidence: row.get("propagated_confidence")?,
        state: MemoryState::parse_name(&state).unwrap_or(MemoryState::Active),
        outcome: outcome.as_deref().and_then(Outcome::parse_name),
        retracted: row.get::<_, i32>("retracted")? != 0,
        exposure_check_status: ExposureStatus::parse_name(&exposure)
            .unwrap_or(ExposureStatus::Pending),
        exposure_check_completed_at: parse_opt_ts(row.get("exposure_check_completed_at")?)?,
        cascade_boosts: row.get("cascade_boosts")?,
        cascade_damages: row.get("cascade_damages")?,
        last_cascade_at: parse_opt_ts(row.get("last_cascade_at")?)?,
        surprise: row.get("surprise")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?)?,
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?)?,
        id,
    })
}

fn row_to_edge(row: &Row<'_>) -> rusqlite::Result<Edge> {
    let edge_type: String = row.get(3)?;
    Ok(Edge {
        id: row.get(0)?,
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        edge_type: EdgeType::parse_name(&edge_type).unwrap_or(EdgeType::DerivedFrom),
        strength: row.get(4)?,
        created_at: parse_ts(&row.get::<_, String>(5)?)?,
        updated_at: parse_ts(&row.get::<_, String>(6)?)?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<MemoryEvent> {
    let event_type: String = row.get(2)?;
    let damage: Option<String> = row.get(5)?;
    let context: String = row.get(6)?;
    Ok(MemoryEvent {
        id: row.get(0)?,
        session_id: row.get(1)?,
        event_type: EventType::parse_name(&event_type).unwrap_or(EventType::Violation),
        memory_id: row.get(3)?,
        violated_by: row.get(4)?,
        damage_level: damage.as_deref().and_then(|d| match d {
            "core" => Some(DamageLevel::Core),
            "peripheral" => Some(DamageLevel::Peripheral),
            _ => None,
        }),
        context: serde_json::from_str(&context).unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
        dispatched: row.get::<_, i32>(8)? != 0,
        dispatched_at: parse_opt_ts(row.get(9)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{EventType, MemoryEvent};

    fn sample_memory(id: &str) -> MemoryRecord {
        MemoryRecord {
            id: id.to_string(),
            content: format!("content of {}", id),
            source: Some("market".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let mut m = sample_memory("m1");
        m.invalidates_if = vec!["price below 100".to_string()];
        m.tags = vec!["equities".to_string()];
        store.put_memory(&m).await.unwrap();

        let fetched = store.get_memory("m1").await.unwrap().unwrap();
        assert_eq!(fetched.content, m.content);
        assert_eq!(fetched.invalidates_if, m.invalidates_if);
        assert_eq!(fetched.tags, m.tags);
        assert_eq!(fetched.state, MemoryState::Active);
        assert!(store.get_memory("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_ids_preserves_order_and_omits_missing() {
        let store = SqliteStore::in_memory().unwrap();
        for id in ["a", "b", "c"] {
            store.put_memory(&sample_memory(id)).await.unwrap();
        }
        let ids = vec![
            "c".to_string(),
            "missing".to_string(),
            "a".to_string(),
            "b".to_string(),
        ];
        let rows = store.list_by_ids(&ids).await.unwrap();
        let got: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(got, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_list_by_ids_chunks_past_param_limit() {
        let store = SqliteStore::in_memory().unwrap();
        let mut ids = vec![];
        for i in 0..250 {
            let id = format!("m{}", i);
            store.put_memory(&sample_memory(&id)).await.unwrap();
            ids.push(id);
        }
        let rows = store.list_by_ids(&ids).await.unwrap();
        assert_eq!(rows.len(), 250);
        assert_eq!(rows[0].id, "m0");
        assert_eq!(rows[249].id, "m249");
    }

    #[tokio::test]
    async fn test_create_memory_writes_edges_and_centrality() {
        let store = SqliteStore::in_memory().unwrap();
        store.put_memory(&sample_memory("parent")).await.unwrap();

        let mut child = sample_memory("child");
        child.source = None;
        child.derived_from = vec!["parent".to_string()];
        store.create_memory(&child).await.unwrap();

        let parent = store.get_memory("parent").await.unwrap().unwrap();
        assert_eq!(parent.centrality, 1);

        let edges = store
            .list_edges_incident(
                &["child".to_string()],
                &[EdgeType::DerivedFrom],
                0.0,
            )
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source_id, "parent");
        assert_eq!(edges[0].target_id, "child");
        assert_eq!(edges[0].strength, 1.0);
    }

    #[tokio::test]
    async fn test_upsert_edge_merges_and_caps() {
        let store = SqliteStore::in_memory().unwrap();
        let e1 = store
            .upsert_edge("a", "b", EdgeType::ViolatedBy, 0.7)
            .await
            .unwrap();
        assert_eq!(e1.strength, 0.7);

        let e2 = store
            .upsert_edge("a", "b", EdgeType::ViolatedBy, 0.7)
            .await
            .unwrap();
        assert_eq!(e2.strength, 1.0);
        assert_eq!(e1.id, e2.id);
    }

    #[tokio::test]
    async fn test_event_queue_fifo_claim() {
        let store = SqliteStore::in_memory().unwrap();
        for i in 0..3 {
            let mut event = MemoryEvent::new("s1", EventType::Violation, format!("m{}", i));
            event.created_at = Utc::now() + chrono::Duration::milliseconds(i);
            store.append_event(&event).await.unwrap();
        }
        // Another session's event must not be claimed
        store
            .append_event(&MemoryEvent::new("s2", EventType::Violation, "other"))
            .await
            .unwrap();

        let claimed = store.claim_due_events("s1", 2).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].memory_id, "m0");
        assert_eq!(claimed[1].memory_id, "m1");
        assert!(claimed.iter().all(|e| e.dispatched));

        let rest = store.claim_due_events("s1", 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].memory_id, "m2");

        assert!(store.claim_due_events("s1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_event_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let event = MemoryEvent::new("s1", EventType::CascadeBoost, "m1");
        store.append_event(&event).await.unwrap();
        store.append_event(&event).await.unwrap();
        assert_eq!(store.list_events("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_event_guards_second_application() {
        let store = SqliteStore::in_memory().unwrap();
        let event = MemoryEvent::new("s1", EventType::CascadeDamage, "m1");
        store.append_event(&event).await.unwrap();

        assert!(store.claim_event(&event.id).await.unwrap().is_some());
        assert!(store.claim_event(&event.id).await.unwrap().is_none());
        assert!(store.claim_event("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_memory_cas() {
        let store = SqliteStore::in_memory().unwrap();
        let m = sample_memory("m1");
        store.put_memory(&m).await.unwrap();

        let mut current = store.get_memory("m1").await.unwrap().unwrap();
        let stale = current.updated_at - chrono::Duration::seconds(10);

        current.confirmations = 5;
        assert!(!store.put_memory_cas(&current, stale).await.unwrap());

        let expected = current.updated_at;
        current.updated_at = Utc::now();
        assert!(store.put_memory_cas(&current, expected).await.unwrap());
        assert_eq!(
            store.get_memory("m1").await.unwrap().unwrap().confirmations,
            5
        );
    }

    #[tokio::test]
    async fn test_modify_memory_applies_and_bumps_version() {
        let store = SqliteStore::in_memory().unwrap();
        store.put_memory(&sample_memory("m1")).await.unwrap();

        let updated = store
            .modify_memory("m1", |m| m.times_tested += 1)
            .await
            .unwrap();
        assert_eq!(updated.times_tested, 1);

        let err = store.modify_memory("nope", |_| {}).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_advisory_lock_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store
            .try_acquire_lock("propagation", "worker-1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .try_acquire_lock("propagation", "worker-2", Duration::from_secs(60))
            .await
            .unwrap());
        store.release_lock("propagation", "worker-1").await.unwrap();
        assert!(store
            .try_acquire_lock("propagation", "worker-2", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_source_stats_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.source_confidence("market").await.unwrap().is_none());
        store
            .put_source_confidence("market", 0.92, 140)
            .await
            .unwrap();
        assert_eq!(
            store.source_confidence("market").await.unwrap(),
            Some(0.92)
        );
    }

    #[tokio::test]
    async fn test_record_source_outcome_running_mean() {
        let store = SqliteStore::in_memory().unwrap();

        store.record_source_outcome("market", true).await.unwrap();
        assert_eq!(store.source_confidence("market").await.unwrap(), Some(1.0));

        store.record_source_outcome("market", false).await.unwrap();
        assert_eq!(store.source_confidence("market").await.unwrap(), Some(0.5));

        store.record_source_outcome("market", true).await.unwrap();
        let mean = store.source_confidence("market").await.unwrap().unwrap();
        assert!((mean - 2.0 / 3.0).abs() < 1e-9);

        // Other sources are untouched
        assert!(store.source_confidence("news").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incident_edges_filter_types_and_strength() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_edge("a", "b", EdgeType::DerivedFrom, 1.0)
            .await
            .unwrap();
        store
            .upsert_edge("c", "a", EdgeType::ViolatedBy, 0.05)
            .await
            .unwrap();
        store
            .upsert_edge("d", "a", EdgeType::ViolatedBy, 0.9)
            .await
            .unwrap();

        let edges = store
            .list_edges_incident(&["a".to_string()], &[EdgeType::ViolatedBy], 0.1)
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source_id, "d");
    }

    #[tokio::test]
    async fn test_dangling_refs_listing() {
        let store = SqliteStore::in_memory().unwrap();
        let mut child = sample_memory("child");
        child.source = None;
        child.derived_from = vec!["ghost".to_string()];
        store.put_memory(&child).await.unwrap();

        let dangling = store.dangling_derived_refs().await.unwrap();
        assert_eq!(
            dangling,
            vec![("child".to_string(), "ghost".to_string())]
        );
    }
}
