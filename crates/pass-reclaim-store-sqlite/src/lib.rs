use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pass_reclaim_core::{
    KeeperBasis, MemberId, PoolError, PooledCandidate, RecyclePool, RunId,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS pool_candidates (
  member_id TEXT PRIMARY KEY,
  group_key TEXT NOT NULL,
  keeper_basis TEXT NOT NULL CHECK (keeper_basis IN ('updated','created','server_order')),
  run_id TEXT NOT NULL,
  added_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS missing_names (
  name TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  added_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  started_at TEXT NOT NULL,
  summary_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pool_candidates_run ON pool_candidates(run_id);
CREATE INDEX IF NOT EXISTS idx_missing_names_run ON missing_names(run_id);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub summary: Value,
}

/// Durable recycle pool: reclaimed identifiers and missing names survive
/// across runs until assignments consume them. Insertion order is carried by
/// rowid, so partial consumption keeps the remaining entries in their
/// original relative order.
pub struct SqlitePool {
    conn: Connection,
}

impl SqlitePool {
    /// # Errors
    /// Returns an error when the database file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open pool database {}", path.display()))?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to ensure schema_migrations table")?;
        Ok(Self { conn })
    }

    fn current_version(&self) -> Result<i64> {
        let version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .context("failed to read schema version")?;
        Ok(version.unwrap_or(0))
    }

    /// # Errors
    /// Returns an error when the version table cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current_version = self.current_version()?;
        let pending_versions = ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect();
        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all pending migrations in order.
    ///
    /// # Errors
    /// Returns an error when a migration statement fails.
    pub fn migrate(&mut self) -> Result<()> {
        let current = self.current_version()?;
        for version in (current + 1)..=LATEST_SCHEMA_VERSION {
            let sql = match version {
                1 => MIGRATION_001_SQL,
                other => return Err(anyhow!("unknown schema migration version {other}")),
            };
            let tx = self.conn.transaction().context("failed to begin migration")?;
            tx.execute_batch(sql)
                .with_context(|| format!("failed to apply migration {version}"))?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, format_timestamp(OffsetDateTime::now_utc())?],
            )
            .with_context(|| format!("failed to record migration {version}"))?;
            tx.commit().with_context(|| format!("failed to commit migration {version}"))?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the run row cannot be written.
    pub fn save_run(&mut self, summary: &RunSummary) -> Result<()> {
        let body = serde_json::to_string(&summary.summary)
            .context("failed to serialize run summary")?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO runs (run_id, started_at, summary_json) VALUES (?1, ?2, ?3)",
                params![
                    summary.run_id.to_string(),
                    format_timestamp(summary.started_at)?,
                    body
                ],
            )
            .context("failed to save run summary")?;
        Ok(())
    }

    /// Most recent runs first.
    ///
    /// # Errors
    /// Returns an error when run rows cannot be read or parsed.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut statement = self
            .conn
            .prepare(
                "SELECT run_id, started_at, summary_json FROM runs ORDER BY started_at DESC LIMIT ?1",
            )
            .context("failed to prepare run listing")?;
        let rows = statement
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                let run_id: String = row.get(0)?;
                let started_at: String = row.get(1)?;
                let summary_json: String = row.get(2)?;
                Ok((run_id, started_at, summary_json))
            })
            .context("failed to query runs")?;

        let mut runs = Vec::new();
        for row in rows {
            let (run_id, started_at, summary_json) = row.context("failed to read run row")?;
            runs.push(RunSummary {
                run_id: parse_run_id(&run_id)?,
                started_at: parse_timestamp(&started_at)?,
                summary: serde_json::from_str(&summary_json)
                    .context("failed to parse run summary JSON")?,
            });
        }
        Ok(runs)
    }
}

fn format_timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format timestamp")
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid stored timestamp: {raw}"))
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid stored run id: {raw}"))?;
    Ok(RunId(parsed))
}

fn backend(err: impl std::fmt::Display) -> PoolError {
    PoolError::Backend(err.to_string())
}

impl RecyclePool for SqlitePool {
    fn add_candidate(&mut self, candidate: &PooledCandidate) -> Result<bool, PoolError> {
        let added_at = candidate
            .added_at
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(backend)?;
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO pool_candidates
                 (member_id, group_key, keeper_basis, run_id, added_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    candidate.id.as_str(),
                    candidate.group_key,
                    candidate.basis.as_str(),
                    candidate.run_id.to_string(),
                    added_at
                ],
            )
            .map_err(backend)?;
        Ok(changed > 0)
    }

    fn remove_candidate(&mut self, id: &MemberId) -> Result<bool, PoolError> {
        let changed = self
            .conn
            .execute("DELETE FROM pool_candidates WHERE member_id = ?1", params![id.as_str()])
            .map_err(backend)?;
        Ok(changed > 0)
    }

    fn list_candidates(&self) -> Result<Vec<PooledCandidate>, PoolError> {
        let mut statement = self
            .conn
            .prepare(
                "SELECT member_id, group_key, keeper_basis, run_id, added_at
                 FROM pool_candidates ORDER BY rowid",
            )
            .map_err(backend)?;
        let rows = statement
            .query_map([], |row| {
                let member_id: String = row.get(0)?;
                let group_key: String = row.get(1)?;
                let keeper_basis: String = row.get(2)?;
                let run_id: String = row.get(3)?;
                let added_at: String = row.get(4)?;
                Ok((member_id, group_key, keeper_basis, run_id, added_at))
            })
            .map_err(backend)?;

        let mut candidates = Vec::new();
        for row in rows {
            let (member_id, group_key, keeper_basis, run_id, added_at) =
                row.map_err(backend)?;
            let basis = KeeperBasis::parse(&keeper_basis)
                .ok_or_else(|| backend(format!("unknown keeper basis `{keeper_basis}`")))?;
            let run_id = Ulid::from_string(&run_id).map_err(backend)?;
            let added_at = OffsetDateTime::parse(
                &added_at,
                &time::format_description::well_known::Rfc3339,
            )
            .map_err(backend)?;
            candidates.push(PooledCandidate {
                id: MemberId::new(member_id),
                group_key,
                basis,
                run_id: RunId(run_id),
                added_at,
            });
        }
        Ok(candidates)
    }

    fn push_missing(&mut self, name: &str, run_id: RunId) -> Result<bool, PoolError> {
        let added_at = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(backend)?;
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO missing_names (name, run_id, added_at) VALUES (?1, ?2, ?3)",
                params![name, run_id.to_string(), added_at],
            )
            .map_err(backend)?;
        Ok(changed > 0)
    }

    fn remove_missing(&mut self, name: &str) -> Result<bool, PoolError> {
        let changed = self
            .conn
            .execute("DELETE FROM missing_names WHERE name = ?1", params![name])
            .map_err(backend)?;
        Ok(changed > 0)
    }

    fn list_missing(&self) -> Result<Vec<String>, PoolError> {
        let mut statement = self
            .conn
            .prepare("SELECT name FROM missing_names ORDER BY rowid")
            .map_err(backend)?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0)).map_err(backend)?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.map_err(backend)?);
        }
        Ok(names)
    }

    fn clear(&mut self) -> Result<(), PoolError> {
        self.conn.execute("DELETE FROM pool_candidates", []).map_err(backend)?;
        self.conn.execute("DELETE FROM missing_names", []).map_err(backend)?;
        Ok(())
    }
}
