#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use migration_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, BundleVersion, BundleVersionId, ContentHash,
    NewScriptRecord, RecordStatus, ScriptRecord, ScriptRecordFilter, ScriptRecordId,
    ScriptRecordRow, ScriptRecordStore,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS bundle_versions (
  version_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  bundle_version_id TEXT NOT NULL UNIQUE,
  bundle_name TEXT NOT NULL CHECK (length(bundle_name) > 0),
  version TEXT NOT NULL CHECK (length(version) > 0),
  created_at TEXT NOT NULL,
  retired_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_bundle_versions_active_identity
  ON bundle_versions(bundle_name, version)
  WHERE retired_at IS NULL;

CREATE TRIGGER IF NOT EXISTS trg_bundle_versions_no_delete
BEFORE DELETE ON bundle_versions
BEGIN
  SELECT RAISE(FAIL, 'bundle_versions are soft-deleted only');
END;

CREATE TRIGGER IF NOT EXISTS trg_bundle_versions_identity_immutable
BEFORE UPDATE OF bundle_version_id, bundle_name, version, created_at ON bundle_versions
BEGIN
  SELECT RAISE(FAIL, 'bundle_versions identity is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_bundle_versions_retire_once
BEFORE UPDATE OF retired_at ON bundle_versions
WHEN OLD.retired_at IS NOT NULL
BEGIN
  SELECT RAISE(FAIL, 'retired bundle versions are terminal');
END;

CREATE TABLE IF NOT EXISTS script_records (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id TEXT NOT NULL UNIQUE,
  bundle_version_id TEXT NOT NULL,
  script_file_name TEXT NOT NULL CHECK (length(script_file_name) > 0),
  content_hash TEXT NOT NULL CHECK (length(content_hash) = 64),
  dialect TEXT NOT NULL CHECK (length(dialect) > 0),
  status TEXT NOT NULL CHECK (status IN ('active', 'superseded')),
  recorded_at TEXT NOT NULL,
  superseded_at TEXT,
  CHECK (
    (status = 'active' AND superseded_at IS NULL)
    OR (status = 'superseded' AND superseded_at IS NOT NULL)
  ),
  FOREIGN KEY (bundle_version_id) REFERENCES bundle_versions(bundle_version_id)
);

CREATE TRIGGER IF NOT EXISTS trg_script_records_no_delete
BEFORE DELETE ON script_records
BEGIN
  SELECT RAISE(FAIL, 'script_records are superseded, never deleted');
END;

CREATE TRIGGER IF NOT EXISTS trg_script_records_content_immutable
BEFORE UPDATE OF record_id, bundle_version_id, script_file_name, content_hash, dialect, recorded_at
ON script_records
BEGIN
  SELECT RAISE(FAIL, 'script_records content is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_script_records_superseded_terminal
BEFORE UPDATE ON script_records
WHEN OLD.status = 'superseded'
BEGIN
  SELECT RAISE(FAIL, 'superseded script_records are terminal');
END;

CREATE INDEX IF NOT EXISTS idx_script_records_lookup
  ON script_records(script_file_name, dialect, status);
CREATE INDEX IF NOT EXISTS idx_script_records_bundle_version
  ON script_records(bundle_version_id);
";

const BUNDLE_VERSION_COLUMNS: &str =
    "bundle_version_id, bundle_name, version, created_at, retired_at";

const SCRIPT_ROW_SELECT: &str = "SELECT
    sr.record_id, sr.bundle_version_id, sr.script_file_name, sr.content_hash, sr.dialect,
    sr.status, sr.recorded_at, sr.superseded_at,
    bv.bundle_version_id, bv.bundle_name, bv.version, bv.created_at, bv.retired_at
 FROM script_records sr
 JOIN bundle_versions bv ON bv.bundle_version_id = sr.bundle_version_id";

pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    fn get_bundle_version(&self, bundle_version_id: BundleVersionId) -> Result<BundleVersion> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {BUNDLE_VERSION_COLUMNS} FROM bundle_versions WHERE bundle_version_id = ?1"
                ),
                params![bundle_version_id.to_string()],
                |row| parse_bundle_version(row, 0),
            )
            .optional()
            .context("failed to load bundle version")?
            .ok_or_else(|| anyhow!("bundle version {bundle_version_id} not found"))
    }

    fn get_script_record(&self, record_id: ScriptRecordId) -> Result<ScriptRecord> {
        self.conn
            .query_row(
                &format!("{SCRIPT_ROW_SELECT} WHERE sr.record_id = ?1"),
                params![record_id.to_string()],
                parse_script_record,
            )
            .optional()
            .context("failed to load script record")?
            .ok_or_else(|| anyhow!("script record {record_id} not found"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl ScriptRecordStore for SqliteLedgerStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        ensure_compatible_tables(&self.conn)?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, timestamp(now_utc())?],
            )
            .context("failed to register ledger schema migration")?;

        Ok(())
    }

    fn register_bundle_version(&self, bundle_name: &str, version: &str) -> Result<BundleVersion> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start bundle version transaction")?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {BUNDLE_VERSION_COLUMNS} FROM bundle_versions
                     WHERE bundle_name = ?1 AND version = ?2 AND retired_at IS NULL"
                ),
                params![bundle_name, version],
                |row| parse_bundle_version(row, 0),
            )
            .optional()
            .context("failed to query bundle versions")?;

        if let Some(found) = existing {
            tx.commit().context("failed to commit bundle version transaction")?;
            return Ok(found);
        }

        let registered = BundleVersion {
            bundle_version_id: BundleVersionId::new(),
            bundle_name: bundle_name.to_string(),
            version: version.to_string(),
            created_at: now_utc(),
            retired_at: None,
        };

        tx.execute(
            "INSERT INTO bundle_versions(bundle_version_id, bundle_name, version, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                registered.bundle_version_id.to_string(),
                registered.bundle_name,
                registered.version,
                timestamp(registered.created_at)?,
            ],
        )
        .with_context(|| format!("failed to register bundle version {bundle_name}@{version}"))?;
        tx.commit().context("failed to commit bundle version transaction")?;

        debug!(bundle = bundle_name, version, "inserted bundle version");
        Ok(registered)
    }

    fn retire_bundle_version(&self, bundle_version_id: BundleVersionId) -> Result<BundleVersion> {
        let changed = self
            .conn
            .execute(
                "UPDATE bundle_versions SET retired_at = ?2
                 WHERE bundle_version_id = ?1 AND retired_at IS NULL",
                params![bundle_version_id.to_string(), timestamp(now_utc())?],
            )
            .context("failed to retire bundle version")?;

        if changed == 0 {
            return Err(anyhow!("bundle version {bundle_version_id} is missing or already retired"));
        }

        self.get_bundle_version(bundle_version_id)
    }

    fn find_bundle_versions(
        &self,
        bundle_name: &str,
        version: Option<&str>,
        include_retired: bool,
    ) -> Result<Vec<BundleVersion>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BUNDLE_VERSION_COLUMNS}
             FROM bundle_versions
             WHERE bundle_name = ?1
               AND (?2 IS NULL OR version = ?2)
               AND (?3 = 1 OR retired_at IS NULL)
             ORDER BY version_seq ASC"
        ))?;

        let rows = stmt.query_map(
            params![bundle_name, version, bool_to_sql(include_retired)],
            |row| parse_bundle_version(row, 0),
        )?;

        collect_rows(rows)
    }

    fn query_script_records(&self, filter: &ScriptRecordFilter) -> Result<Vec<ScriptRecordRow>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        for (column, value) in [
            ("bv.bundle_name", filter.bundle_name.as_deref()),
            ("sr.script_file_name", filter.script_file_name.as_deref()),
            ("sr.dialect", filter.dialect.as_deref()),
            ("sr.status", filter.status.map(RecordStatus::as_str)),
        ] {
            if let Some(value) = value {
                values.push(value.to_string());
                clauses.push(format!("{column} = ?{}", values.len()));
            }
        }

        if !filter.include_retired_bundles {
            clauses.push("bv.retired_at IS NULL".to_string());
        }

        let mut query = SCRIPT_ROW_SELECT.to_string();
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY sr.record_seq ASC");

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok(ScriptRecordRow {
                record: parse_script_record(row)?,
                bundle: parse_bundle_version(row, 8)?,
            })
        })?;

        collect_rows(rows)
    }

    fn save_script_record(&self, record: &NewScriptRecord) -> Result<ScriptRecord> {
        record
            .validate()
            .map_err(|err| anyhow!("script record validation failed: {err}"))?;

        let record_id = ScriptRecordId::new();
        let recorded_at = now_utc();

        let changed = self
            .conn
            .execute(
                "INSERT INTO script_records(
                    record_id, bundle_version_id, script_file_name, content_hash,
                    dialect, status, recorded_at, superseded_at
                 )
                 SELECT ?1, bv.bundle_version_id, ?3, ?4, ?5, 'active', ?6, NULL
                 FROM bundle_versions bv
                 WHERE bv.bundle_version_id = ?2 AND bv.retired_at IS NULL",
                params![
                    record_id.to_string(),
                    record.bundle_version_id.to_string(),
                    record.script_file_name,
                    record.content_hash.as_str(),
                    record.dialect,
                    timestamp(recorded_at)?,
                ],
            )
            .context("failed to insert script record")?;

        if changed == 0 {
            return Err(anyhow!(
                "bundle version {} is missing or retired",
                record.bundle_version_id
            ));
        }

        Ok(ScriptRecord {
            record_id,
            bundle_version_id: record.bundle_version_id,
            script_file_name: record.script_file_name.clone(),
            content_hash: record.content_hash.clone(),
            dialect: record.dialect.clone(),
            status: RecordStatus::Active,
            recorded_at,
            superseded_at: None,
        })
    }

    fn supersede_script_record(&self, record_id: ScriptRecordId) -> Result<ScriptRecord> {
        let changed = self
            .conn
            .execute(
                "UPDATE script_records SET status = 'superseded', superseded_at = ?2
                 WHERE record_id = ?1 AND status = 'active'",
                params![record_id.to_string(), timestamp(now_utc())?],
            )
            .context("failed to supersede script record")?;

        if changed == 0 {
            return Err(anyhow!("script record {record_id} is missing or not active"));
        }

        self.get_script_record(record_id)
    }
}

fn parse_bundle_version(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<BundleVersion> {
    let id_raw: String = row.get(offset)?;
    let created_raw: String = row.get(offset + 3)?;
    let retired_raw: Option<String> = row.get(offset + 4)?;

    Ok(BundleVersion {
        bundle_version_id: BundleVersionId::parse(&id_raw).map_err(to_sql_error)?,
        bundle_name: row.get(offset + 1)?,
        version: row.get(offset + 2)?,
        created_at: parse_rfc3339_utc(&created_raw).map_err(to_sql_error)?,
        retired_at: retired_raw
            .as_deref()
            .map(parse_rfc3339_utc)
            .transpose()
            .map_err(to_sql_error)?,
    })
}

fn parse_script_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScriptRecord> {
    let record_id_raw: String = row.get(0)?;
    let bundle_version_id_raw: String = row.get(1)?;
    let content_hash_raw: String = row.get(3)?;
    let status_raw: String = row.get(5)?;
    let recorded_raw: String = row.get(6)?;
    let superseded_raw: Option<String> = row.get(7)?;

    let status = RecordStatus::parse(&status_raw).ok_or_else(|| {
        invalid_data(format!("invalid script record status: {status_raw}"))
    })?;

    Ok(ScriptRecord {
        record_id: ScriptRecordId::parse(&record_id_raw).map_err(to_sql_error)?,
        bundle_version_id: BundleVersionId::parse(&bundle_version_id_raw).map_err(to_sql_error)?,
        script_file_name: row.get(2)?,
        content_hash: ContentHash::from_hex(&content_hash_raw).map_err(to_sql_error)?,
        dialect: row.get(4)?,
        status,
        recorded_at: parse_rfc3339_utc(&recorded_raw).map_err(to_sql_error)?,
        superseded_at: superseded_raw
            .as_deref()
            .map(parse_rfc3339_utc)
            .transpose()
            .map_err(to_sql_error)?,
    })
}

fn ensure_compatible_tables(conn: &Connection) -> Result<()> {
    for (table_name, columns) in [
        (
            "bundle_versions",
            &[
                "version_seq",
                "bundle_version_id",
                "bundle_name",
                "version",
                "created_at",
                "retired_at",
            ][..],
        ),
        (
            "script_records",
            &[
                "record_seq",
                "record_id",
                "bundle_version_id",
                "script_file_name",
                "content_hash",
                "dialect",
                "status",
                "recorded_at",
                "superseded_at",
            ][..],
        ),
    ] {
        if table_exists(conn, table_name)? {
            ensure_table_has_columns(conn, table_name, columns)?;
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "ledger schema compatibility check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn invalid_data(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: migration_ledger_core::LedgerError) -> rusqlite::Error {
    invalid_data(err.to_string())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
