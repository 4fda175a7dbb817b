use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use scope_kernel_core::{
    token_from_metadata, CancellationFlag, PrincipalType, ScopeDiagnostics, ScopePathProjection,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;
use uuid::Uuid;

pub const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS scoped_records (
  record_id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  content TEXT NOT NULL,
  content_hash TEXT,
  legacy_metadata_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_scoped_records_created_at ON scoped_records(created_at);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE scoped_records ADD COLUMN scope_path TEXT;
ALTER TABLE scoped_records ADD COLUMN scope_principal_type TEXT;
ALTER TABLE scoped_records ADD COLUMN scope_principal_id TEXT;
ALTER TABLE scoped_records ADD COLUMN scope_segments_json TEXT;

CREATE INDEX IF NOT EXISTS idx_scoped_records_scope_path ON scoped_records(scope_path);
";

/// Stable, lexicographically ascending record primary key. The backfill
/// relies on this ordering as its forward-progress cursor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scope field group persisted on a record once it is migrated or written
/// through the dual-write path.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordScope {
    pub path: String,
    pub principal_type: PrincipalType,
    pub principal_id: Option<Uuid>,
    pub segments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopedRecord {
    pub record_id: RecordId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub content: String,
    pub content_hash: Option<String>,
    pub legacy_metadata: serde_json::Map<String, Value>,
    pub scope: Option<RecordScope>,
}

/// Feature switches for the scope backfill job. Deserializable from the CLI's
/// YAML config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackfillConfig {
    pub dual_write_enabled: bool,
    pub batch_size: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self { dual_write_enabled: false, batch_size: 100 }
    }
}

/// Outcome of one or more backfill invocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackfillReport {
    pub updated: u64,
    pub skipped: u64,
    pub notes: Vec<String>,
}

struct BackfillCandidate {
    record_id: String,
    legacy_metadata_json: String,
}

pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    /// # Errors
    /// Returns an error when the database file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Ok(Self { conn })
    }

    /// # Errors
    /// Returns an error when the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        Ok(Self { conn })
    }

    /// Apply pending schema migrations up to the latest version.
    ///
    /// # Errors
    /// Returns an error when a migration fails or the database reports a
    /// version newer than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to ensure schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            apply_migration(&mut self.conn, 1, MIGRATION_001_SQL)?;
            version = 1;
        }
        if version < 2 {
            apply_migration(&mut self.conn, 2, MIGRATION_002_SQL)?;
            version = 2;
        }
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the migration bookkeeping cannot be read.
    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to ensure schema_migrations table")?;
        current_schema_version(&self.conn)
    }

    /// Persist a record in the pre-scope historical shape: content plus the
    /// untyped legacy metadata bag, no scope fields.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_legacy_record(
        &mut self,
        content: &str,
        content_hash: Option<&str>,
        legacy_metadata: &serde_json::Map<String, Value>,
    ) -> Result<RecordId> {
        let record_id = RecordId::new();
        self.conn
            .execute(
                "INSERT INTO scoped_records(record_id, created_at, content, content_hash, legacy_metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record_id.to_string(),
                    now_rfc3339()?,
                    content,
                    content_hash,
                    serde_json::to_string(legacy_metadata)
                        .context("failed to serialize legacy metadata")?,
                ],
            )
            .context("failed to insert legacy record")?;
        Ok(record_id)
    }

    /// Persist a record in the dual-write shape, with scope fields populated
    /// from a projection at write time.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_scoped_record(
        &mut self,
        content: &str,
        content_hash: Option<&str>,
        legacy_metadata: &serde_json::Map<String, Value>,
        projection: &ScopePathProjection,
    ) -> Result<RecordId> {
        let record_id = RecordId::new();
        let segments = projection.segment_map();
        self.conn
            .execute(
                "INSERT INTO scoped_records(
                    record_id, created_at, content, content_hash, legacy_metadata_json,
                    scope_path, scope_principal_type, scope_principal_id, scope_segments_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record_id.to_string(),
                    now_rfc3339()?,
                    content,
                    content_hash,
                    serde_json::to_string(legacy_metadata)
                        .context("failed to serialize legacy metadata")?,
                    projection.canonical,
                    projection.principal_type.as_str(),
                    projection.principal_id.map(|id| id.to_string()),
                    serde_json::to_string(&segments)
                        .context("failed to serialize scope segments")?,
                ],
            )
            .context("failed to insert scoped record")?;
        Ok(record_id)
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_record(&self, record_id: RecordId) -> Result<Option<ScopedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, created_at, content, content_hash, legacy_metadata_json,
                    scope_path, scope_principal_type, scope_principal_id, scope_segments_json
             FROM scoped_records WHERE record_id = ?1",
        )?;
        let row = stmt
            .query_row(params![record_id.to_string()], decode_record_row)
            .optional()
            .context("failed to load record")?;
        row.map(build_record).transpose()
    }

    /// All records in stable ascending primary-key order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_records(&self) -> Result<Vec<ScopedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, created_at, content, content_hash, legacy_metadata_json,
                    scope_path, scope_principal_type, scope_principal_id, scope_segments_json
             FROM scoped_records ORDER BY record_id ASC",
        )?;
        let rows = stmt.query_map([], decode_record_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(build_record(row.context("failed to read record row")?)?);
        }
        Ok(records)
    }

    /// Count of records whose scope path field is still unset.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_unscoped(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM scoped_records WHERE scope_path IS NULL", [], |row| {
                row.get(0)
            })
            .context("failed to count unscoped records")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// One backfill invocation: select up to `batch_size` records with unset
    /// scope fields in ascending primary-key order, reconstruct a scope token
    /// from each legacy metadata bag, project it, and commit all resulting
    /// updates in a single transaction.
    ///
    /// With dual-write disabled this reports zero work and touches nothing,
    /// so the job is safe to schedule unconditionally. Counts are reported to
    /// the diagnostics collector unless both are zero.
    ///
    /// # Errors
    /// Returns an error when selection or the batch transaction fails; in
    /// that case no row of the failing batch is committed.
    pub fn run_backfill(
        &mut self,
        config: &BackfillConfig,
        diagnostics: &ScopeDiagnostics,
    ) -> Result<BackfillReport> {
        if !config.dual_write_enabled {
            return Ok(BackfillReport {
                updated: 0,
                skipped: 0,
                notes: vec!["dual-write disabled; skipping scope backfill".to_string()],
            });
        }

        let candidates = self.select_unscoped(config.batch_size)?;
        let mut updated = 0_u64;
        let mut skipped = 0_u64;
        let mut notes = Vec::new();

        let tx = self.conn.transaction().context("failed to start backfill transaction")?;
        for candidate in candidates {
            let metadata: serde_json::Map<String, Value> =
                match serde_json::from_str(&candidate.legacy_metadata_json) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) | Err(_) => {
                        skipped += 1;
                        notes.push(format!(
                            "record {}: legacy metadata is not an object",
                            candidate.record_id
                        ));
                        continue;
                    }
                };

            if metadata.is_empty() {
                skipped += 1;
                notes.push(format!("record {}: legacy metadata is empty", candidate.record_id));
                continue;
            }

            let Some(token) = token_from_metadata(&metadata) else {
                skipped += 1;
                notes.push(format!(
                    "record {}: no scope identifiers in legacy metadata",
                    candidate.record_id
                ));
                continue;
            };

            let Ok(projection) = ScopePathProjection::try_create(&token) else {
                skipped += 1;
                notes.push(format!(
                    "record {}: identifiers do not resolve a principal",
                    candidate.record_id
                ));
                continue;
            };

            let segments = projection.segment_map();
            tx.execute(
                "UPDATE scoped_records
                 SET scope_path = ?2, scope_principal_type = ?3,
                     scope_principal_id = ?4, scope_segments_json = ?5
                 WHERE record_id = ?1",
                params![
                    candidate.record_id,
                    projection.canonical,
                    projection.principal_type.as_str(),
                    projection.principal_id.map(|id| id.to_string()),
                    serde_json::to_string(&segments)
                        .context("failed to serialize scope segments")?,
                ],
            )
            .with_context(|| format!("failed to backfill record {}", candidate.record_id))?;
            updated += 1;
        }
        tx.commit().context("failed to commit backfill batch")?;

        if updated > 0 || skipped > 0 {
            diagnostics.record_backfill(updated, skipped);
        }
        Ok(BackfillReport { updated, skipped, notes })
    }

    /// Drive [`SqliteRecordStore::run_backfill`] until a batch makes no
    /// update progress, `max_batches` is reached, or cancellation is observed
    /// between batches. A cancelled run keeps the progress already committed.
    ///
    /// # Errors
    /// Returns an error when an invocation fails; earlier batches stay
    /// committed.
    pub fn run_backfill_to_completion(
        &mut self,
        config: &BackfillConfig,
        diagnostics: &ScopeDiagnostics,
        cancel: &CancellationFlag,
        max_batches: usize,
    ) -> Result<BackfillReport> {
        let mut total = BackfillReport { updated: 0, skipped: 0, notes: Vec::new() };
        for _ in 0..max_batches {
            if cancel.is_cancelled() {
                total.notes.push("backfill cancelled between batches".to_string());
                break;
            }
            let report = self.run_backfill(config, diagnostics)?;
            let progressed = report.updated > 0;
            total.updated += report.updated;
            total.skipped += report.skipped;
            total.notes.extend(report.notes);
            if !progressed {
                break;
            }
        }
        Ok(total)
    }

    fn select_unscoped(&self, batch_size: usize) -> Result<Vec<BackfillCandidate>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, legacy_metadata_json
             FROM scoped_records
             WHERE scope_path IS NULL
             ORDER BY record_id ASC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok(BackfillCandidate { record_id: row.get(0)?, legacy_metadata_json: row.get(1)? })
        })?;
        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row.context("failed to read backfill candidate")?);
        }
        Ok(candidates)
    }
}

struct RecordRow {
    record_id: String,
    created_at: String,
    content: String,
    content_hash: Option<String>,
    legacy_metadata_json: String,
    scope_path: Option<String>,
    scope_principal_type: Option<String>,
    scope_principal_id: Option<String>,
    scope_segments_json: Option<String>,
}

fn decode_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        record_id: row.get(0)?,
        created_at: row.get(1)?,
        content: row.get(2)?,
        content_hash: row.get(3)?,
        legacy_metadata_json: row.get(4)?,
        scope_path: row.get(5)?,
        scope_principal_type: row.get(6)?,
        scope_principal_id: row.get(7)?,
        scope_segments_json: row.get(8)?,
    })
}

fn build_record(row: RecordRow) -> Result<ScopedRecord> {
    let record_id = RecordId(
        Ulid::from_string(&row.record_id)
            .with_context(|| format!("invalid record id {}", row.record_id))?,
    );
    let legacy_metadata = match serde_json::from_str(&row.legacy_metadata_json)
        .context("failed to deserialize legacy metadata")?
    {
        Value::Object(map) => map,
        other => return Err(anyhow!("legacy metadata is not an object: {other}")),
    };

    let scope = match row.scope_path {
        Some(path) => {
            let principal_type_raw = row
                .scope_principal_type
                .ok_or_else(|| anyhow!("record {record_id}: scope path without principal type"))?;
            let principal_type = PrincipalType::parse(&principal_type_raw)
                .ok_or_else(|| anyhow!("unknown principal type: {principal_type_raw}"))?;
            let principal_id = row
                .scope_principal_id
                .map(|raw| {
                    Uuid::parse_str(&raw)
                        .with_context(|| format!("invalid principal id {raw}"))
                })
                .transpose()?;
            let segments = match row.scope_segments_json {
                Some(json) => serde_json::from_str(&json)
                    .context("failed to deserialize scope segments")?,
                None => BTreeMap::new(),
            };
            Some(RecordScope { path, principal_type, principal_id, segments })
        }
        None => None,
    };

    Ok(ScopedRecord {
        record_id,
        created_at: parse_rfc3339(&row.created_at)?,
        content: row.content,
        content_hash: row.content_hash,
        legacy_metadata,
        scope,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read schema version")?;
    Ok(version.unwrap_or(0))
}

fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn
        .transaction()
        .with_context(|| format!("failed to start migration {version} transaction"))?;
    tx.execute_batch(sql).with_context(|| format!("failed to apply migration {version}"))?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration {version}"))?;
    tx.commit().with_context(|| format!("failed to commit migration {version}"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format timestamp")
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid timestamp: {raw}"))
}
