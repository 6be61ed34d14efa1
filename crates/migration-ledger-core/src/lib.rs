//! Idempotency ledger for versioned migration scripts.
//!
//! The ledger answers one question per `(bundle, file, dialect)` triple: has
//! this exact content already been applied under an active bundle version?
//! After the caller executes a script it records the run, superseding the
//! previously active record only once the replacement is durably stored.
//!
//! Entry points:
//! - [`RunDecision`] evaluates whether a script must run.
//! - [`RunRecorder`] records a completed run against a bundle version.
//! - [`ScriptLedger`] binds both to one [`ScriptRecordStore`] and [`ContentHasher`].

mod decision;
mod hash;
mod integrity;
mod ledger;
mod lookup;
mod recorder;
mod store;

#[cfg(test)]
mod testing;

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub use decision::{RunDecision, RunReason, RunVerdict};
#[cfg(test)]
pub(crate) use hash::sha256_hex;
pub use hash::{ContentHasher, Sha256Hasher};
pub use integrity::{
    check_integrity, IntegrityIssue, IntegrityIssueSeverity, IntegrityReport,
    INTEGRITY_REPORT_CONTRACT_VERSION,
};
pub use ledger::ScriptLedger;
pub use lookup::{Lookup, RecordLookup};
pub use recorder::{RecordedRun, RunRecorder, RunRequest};
pub use store::{ScriptRecordFilter, ScriptRecordRow, ScriptRecordStore};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("invalid input: {0} MUST be provided")]
    InvalidInput(&'static str),
    #[error("script file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("ambiguous lookup: expected exactly one {entity}, found {found}")]
    AmbiguousLookup { entity: &'static str, found: usize },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("no unique active bundle version for {bundle_name}@{version} (found {found})")]
    VersionNotFound {
        bundle_name: String,
        version: String,
        found: usize,
    },
    #[error("failed to read script {}: {detail}", .path.display())]
    Io { path: PathBuf, detail: String },
    #[error("concurrent run detected for {key}: {detail}")]
    ConcurrentRun { key: String, detail: String },
    #[error("validation error: {0}")]
    Validation(String),
}

impl LedgerError {
    /// Stable machine-readable code for envelopes and logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "ledger.invalid_input",
            Self::FileNotFound(_) => "ledger.file_not_found",
            Self::AmbiguousLookup { .. } => "ledger.ambiguous_lookup",
            Self::Persistence(_) => "ledger.persistence_failure",
            Self::VersionNotFound { .. } => "ledger.version_not_found",
            Self::Io { .. } => "ledger.io",
            Self::ConcurrentRun { .. } => "ledger.concurrent_run",
            Self::Validation(_) => "ledger.validation",
        }
    }

    pub(crate) fn persistence(err: &anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BundleVersionId(pub Ulid);

impl BundleVersionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a ULID string into a bundle version identifier.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `raw` is not a valid ULID.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| LedgerError::Validation(format!("invalid ULID {raw}: {err}")))
    }
}

impl Default for BundleVersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BundleVersionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScriptRecordId(pub Ulid);

impl ScriptRecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a ULID string into a script record identifier.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `raw` is not a valid ULID.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| LedgerError::Validation(format!("invalid ULID {raw}: {err}")))
    }
}

impl Default for ScriptRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ScriptRecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lowercase hex SHA-256 digest of a script file's bytes.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub const HEX_LEN: usize = 64;

    /// Validates and wraps a hex digest.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] unless `raw` is exactly 64
    /// lowercase hex characters.
    pub fn from_hex(raw: &str) -> Result<Self, LedgerError> {
        if raw.len() != Self::HEX_LEN {
            return Err(LedgerError::Validation(format!(
                "content hash MUST be {} hex characters, got {}",
                Self::HEX_LEN,
                raw.len()
            )));
        }

        if !raw
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
        {
            return Err(LedgerError::Validation(format!(
                "content hash MUST be lowercase hex: {raw}"
            )));
        }

        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    Superseded,
}

impl RecordStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BundleVersion {
    pub bundle_version_id: BundleVersionId,
    pub bundle_name: String,
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub retired_at: Option<OffsetDateTime>,
}

impl BundleVersion {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.retired_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScriptRecord {
    pub record_id: ScriptRecordId,
    pub bundle_version_id: BundleVersionId,
    pub script_file_name: String,
    pub content_hash: ContentHash,
    pub dialect: String,
    pub status: RecordStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub superseded_at: Option<OffsetDateTime>,
}

impl ScriptRecord {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewScriptRecord {
    pub bundle_version_id: BundleVersionId,
    pub script_file_name: String,
    pub content_hash: ContentHash,
    pub dialect: String,
}

impl NewScriptRecord {
    /// Validates a record before it is handed to a store.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidInput`] when the file name or dialect is
    /// blank, and [`LedgerError::Validation`] when the file name is a path.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.script_file_name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("script_file_name"));
        }

        if self.dialect.trim().is_empty() {
            return Err(LedgerError::InvalidInput("dialect"));
        }

        if self.script_file_name.contains(['/', '\\']) {
            return Err(LedgerError::Validation(format!(
                "script_file_name MUST be a basename, got {}",
                self.script_file_name
            )));
        }

        Ok(())
    }
}

/// Identity under which at most one record is active.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScriptKey {
    pub bundle_name: String,
    pub script_file_name: String,
    pub dialect: String,
}

impl ScriptKey {
    /// Builds a key, rejecting blank components.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidInput`] naming the first blank component.
    pub fn new(bundle_name: &str, script_file_name: &str, dialect: &str) -> Result<Self, LedgerError> {
        require("bundle_name", bundle_name)?;
        require("script_file_name", script_file_name)?;
        require("dialect", dialect)?;

        Ok(Self {
            bundle_name: bundle_name.to_string(),
            script_file_name: script_file_name.to_string(),
            dialect: dialect.to_string(),
        })
    }
}

impl Display for ScriptKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}[{}]",
            self.bundle_name, self.script_file_name, self.dialect
        )
    }
}

/// Returns the final path segment of `path` as the recorded script file name.
///
/// # Errors
/// Returns [`LedgerError::InvalidInput`] when the path has no final segment
/// or the segment is not valid UTF-8.
pub fn script_file_name(path: &Path) -> Result<String, LedgerError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .ok_or(LedgerError::InvalidInput("file_path with a UTF-8 file name"))
}

pub(crate) fn require(name: &'static str, value: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::InvalidInput(name));
    }
    Ok(())
}

/// Parses an RFC 3339 timestamp, requiring UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when parsing fails or the offset is not Z.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC 3339 in UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_rejects_wrong_length_and_case() {
        assert!(ContentHash::from_hex("abc").is_err());
        assert!(ContentHash::from_hex(&"A".repeat(64)).is_err());
        assert!(ContentHash::from_hex(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn content_hash_deserialization_is_validated() {
        let bad: Result<ContentHash, _> = serde_json::from_str("\"not-a-digest\"");
        assert!(bad.is_err());

        let good: Result<ContentHash, _> = serde_json::from_str(&format!("\"{}\"", "0".repeat(64)));
        assert!(good.is_ok());
    }

    #[test]
    fn script_file_name_takes_final_segment() {
        let name = script_file_name(Path::new("migrations/core/001_init.sql"));
        assert_eq!(name, Ok("001_init.sql".to_string()));

        assert_eq!(
            script_file_name(Path::new("/")),
            Err(LedgerError::InvalidInput("file_path with a UTF-8 file name"))
        );
    }

    #[test]
    fn script_key_rejects_blank_components() {
        assert_eq!(
            ScriptKey::new("core", " ", "mysql"),
            Err(LedgerError::InvalidInput("script_file_name"))
        );
        assert_eq!(
            ScriptKey::new("", "001_init.sql", "mysql"),
            Err(LedgerError::InvalidInput("bundle_name"))
        );
    }

    #[test]
    fn new_script_record_rejects_paths() {
        let record = NewScriptRecord {
            bundle_version_id: BundleVersionId::new(),
            script_file_name: "sql/001_init.sql".to_string(),
            content_hash: ContentHash("0".repeat(64)),
            dialect: "mysql".to_string(),
        };
        assert!(matches!(record.validate(), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn record_status_round_trips_through_text() {
        for status in [RecordStatus::Active, RecordStatus::Superseded] {
            assert_eq!(RecordStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RecordStatus::parse("deleted"), None);
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
    }
}
