//! Database layer: migrations and the SQLite-backed audit event store.

use async_trait::async_trait;
use escrow_protocol::events::AuditEvent;
use escrow_protocol::storage::EventStore;
use escrow_protocol::EscrowError;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::{debug, info};

use crate::errors::Result;
use crate::events::EventRecord;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let url = if url.contains(":memory:") || url.contains("mode=") {
        url
    } else if url.contains('?') {
        format!("{url}&mode=rwc")
    } else {
        format!("{url}?mode=rwc")
    };

    // Every connection to `:memory:` is a separate database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Event writes
// ─────────────────────────────────────────────────────────

/// Persist one event. The `(campaign_id, sequence)` primary key turns a lost
/// race into a unique violation.
pub async fn insert_event(pool: &SqlitePool, event: &AuditEvent) -> Result<()> {
    let record = EventRecord::from_event(event)?;
    sqlx::query(
        r#"
        INSERT INTO audit_events
            (campaign_id, sequence, kind, actor, recorded_at, prev_hash, hash, body)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(record.campaign_id)
    .bind(record.sequence)
    .bind(&record.kind)
    .bind(&record.actor)
    .bind(&record.recorded_at)
    .bind(&record.prev_hash)
    .bind(&record.hash)
    .bind(&record.body)
    .execute(pool)
    .await?;
    debug!(
        "stored {} for campaign {} at {}",
        record.kind, record.campaign_id, record.sequence
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Event reads
// ─────────────────────────────────────────────────────────

/// Fetch every event, ordered by campaign then sequence.
pub async fn get_all_events(pool: &SqlitePool) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT campaign_id, sequence, kind, actor, recorded_at, prev_hash, hash, body
        FROM   audit_events
        ORDER  BY campaign_id ASC, sequence ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Number of stored events per kind, for diagnostics.
pub async fn count_by_kind(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT kind, COUNT(*) FROM audit_events GROUP BY kind ORDER BY kind ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// EventStore
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: &AuditEvent) -> escrow_protocol::Result<()> {
        insert_event(&self.pool, event).await.map_err(EscrowError::from)
    }

    async fn load_all(&self) -> escrow_protocol::Result<Vec<AuditEvent>> {
        let rows = get_all_events(&self.pool).await.map_err(EscrowError::from)?;
        let events = rows
            .into_iter()
            .map(EventRecord::into_event)
            .collect::<Result<Vec<_>>>()
            .map_err(EscrowError::from)?;
        info!("Loaded {} audit events from SQLite", events.len());
        Ok(events)
    }
}
