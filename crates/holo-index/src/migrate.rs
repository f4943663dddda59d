//! Schema creation. Every statement is idempotent, so `holo init` can run
//! any number of times.

use anyhow::Result;
use sqlx::SqlitePool;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        source_path TEXT NOT NULL,
        content TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        embedding BLOB,
        model_version TEXT,
        dims INTEGER,
        indexed_at INTEGER NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queries (
        id TEXT PRIMARY KEY,
        text TEXT NOT NULL,
        intent TEXT NOT NULL,
        confidence REAL NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS routing_decisions (
        query_id TEXT PRIMARY KEY,
        intent TEXT NOT NULL,
        confidence REAL NOT NULL,
        components_json TEXT NOT NULL,
        affinity_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (query_id) REFERENCES queries(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS component_runs (
        query_id TEXT NOT NULL,
        component TEXT NOT NULL,
        status TEXT NOT NULL,
        elapsed_ms INTEGER NOT NULL,
        PRIMARY KEY (query_id, component)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS surfaced_entities (
        query_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        PRIMARY KEY (query_id, entity_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS affinity_weights (
        component TEXT NOT NULL,
        intent TEXT NOT NULL,
        weight REAL NOT NULL,
        update_count INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        version INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (component, intent)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feedback_events (
        id TEXT PRIMARY KEY,
        query_id TEXT NOT NULL,
        relevance REAL NOT NULL,
        noise_level REAL NOT NULL,
        completeness REAL NOT NULL,
        efficiency REAL NOT NULL,
        delta REAL NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (query_id) REFERENCES queries(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS health_scores (
        entity_id TEXT PRIMARY KEY,
        score_json TEXT NOT NULL,
        overall REAL NOT NULL,
        updated_at INTEGER NOT NULL,
        version INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS breadcrumbs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        query_id TEXT,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_entities_live ON entities(deleted, kind)",
    "CREATE INDEX IF NOT EXISTS idx_entities_path ON entities(source_path)",
    "CREATE INDEX IF NOT EXISTS idx_feedback_query ON feedback_events(query_id)",
    "CREATE INDEX IF NOT EXISTS idx_breadcrumbs_query ON breadcrumbs(query_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_breadcrumbs_created ON breadcrumbs(created_at)",
];

/// Create every table, the FTS index and secondary indexes.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='entities_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE entities_fts USING fts5(
                entity_id UNINDEXED,
                source_path,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    tracing::debug!("schema up to date");
    Ok(())
}
