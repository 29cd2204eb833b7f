//! Database migrations
//!
//! Schema migration definitions for the row store.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, edges, events",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Per-source confidence stats and advisory locks",
        up: MIGRATION_V2_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    source TEXT,
    source_url TEXT,

    -- JSON-array columns (stored as text)
    derived_from TEXT NOT NULL DEFAULT '[]',
    assumes TEXT NOT NULL DEFAULT '[]',
    invalidates_if TEXT NOT NULL DEFAULT '[]',
    confirms_if TEXT NOT NULL DEFAULT '[]',
    tags TEXT NOT NULL DEFAULT '[]',
    violations TEXT NOT NULL DEFAULT '[]',

    -- Time-bound beliefs
    outcome_condition TEXT,
    resolves_by TEXT,

    -- Confidence scalars and counters
    starting_confidence REAL NOT NULL DEFAULT 0.5,
    confirmations INTEGER NOT NULL DEFAULT 0,
    times_tested INTEGER NOT NULL DEFAULT 0,
    contradictions INTEGER NOT NULL DEFAULT 0,
    centrality INTEGER NOT NULL DEFAULT 0,
    propagated_confidence REAL,

    -- Lifecycle
    state TEXT NOT NULL DEFAULT 'active',
    outcome TEXT,
    retracted INTEGER NOT NULL DEFAULT 0,

    -- Exposure check bookkeeping
    exposure_check_status TEXT NOT NULL DEFAULT 'pending',
    exposure_check_completed_at TEXT,

    -- Cascade bookkeeping
    cascade_boosts INTEGER NOT NULL DEFAULT 0,
    cascade_damages INTEGER NOT NULL DEFAULT 0,
    last_cascade_at TEXT,

    surprise REAL,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_state ON memories(state);
CREATE INDEX IF NOT EXISTS idx_memories_retracted ON memories(retracted);
CREATE INDEX IF NOT EXISTS idx_memories_exposure ON memories(exposure_check_status);
CREATE INDEX IF NOT EXISTS idx_memories_resolves_by ON memories(resolves_by);

CREATE TABLE IF NOT EXISTS edges (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    edge_type TEXT NOT NULL,
    strength REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_edges_triple
    ON edges(source_id, target_id, edge_type);
CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    memory_id TEXT NOT NULL,
    violated_by TEXT,
    damage_level TEXT,
    context TEXT NOT NULL DEFAULT 'null',
    created_at TEXT NOT NULL,
    dispatched INTEGER NOT NULL DEFAULT 0,
    dispatched_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_session_queue
    ON events(session_id, dispatched, created_at);

INSERT INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: starting-confidence stats per source, and the advisory lock table
/// that backs the full-graph propagation singleton.
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS source_stats (
    source TEXT PRIMARY KEY,
    starting_confidence REAL NOT NULL,
    sample_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS advisory_locks (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
