use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    BundleVersion, BundleVersionId, NewScriptRecord, RecordStatus, ScriptKey, ScriptRecord,
    ScriptRecordId,
};

/// Row filter for [`ScriptRecordStore::query_script_records`].
///
/// `None` fields do not constrain the query. Rows whose bundle version is
/// retired are excluded unless `include_retired_bundles` is set.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ScriptRecordFilter {
    pub bundle_name: Option<String>,
    pub script_file_name: Option<String>,
    pub dialect: Option<String>,
    pub status: Option<RecordStatus>,
    pub include_retired_bundles: bool,
}

impl ScriptRecordFilter {
    /// Active records for `key` under active bundle versions.
    #[must_use]
    pub fn active_for(key: &ScriptKey) -> Self {
        Self {
            bundle_name: Some(key.bundle_name.clone()),
            script_file_name: Some(key.script_file_name.clone()),
            dialect: Some(key.dialect.clone()),
            status: Some(RecordStatus::Active),
            include_retired_bundles: false,
        }
    }

    /// Every record ever written for a file, across dialects and versions.
    #[must_use]
    pub fn history_for(bundle_name: &str, script_file_name: &str) -> Self {
        Self {
            bundle_name: Some(bundle_name.to_string()),
            script_file_name: Some(script_file_name.to_string()),
            dialect: None,
            status: None,
            include_retired_bundles: true,
        }
    }

    /// Every active record regardless of bundle version state.
    #[must_use]
    pub fn all_active() -> Self {
        Self {
            status: Some(RecordStatus::Active),
            include_retired_bundles: true,
            ..Self::default()
        }
    }
}

/// A script record joined to the bundle version it is attributed to.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScriptRecordRow {
    pub record: ScriptRecord,
    pub bundle: BundleVersion,
}

/// Persistence collaborator owning all ledger state.
///
/// Query methods return every matching row, ordered oldest first, and leave
/// cardinality checks to the caller.
pub trait ScriptRecordStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Returns the active version for `(bundle_name, version)`, inserting it
    /// when none exists.
    #[allow(clippy::missing_errors_doc)]
    fn register_bundle_version(&self, bundle_name: &str, version: &str) -> Result<BundleVersion>;

    /// Soft-deletes an active bundle version.
    #[allow(clippy::missing_errors_doc)]
    fn retire_bundle_version(&self, bundle_version_id: BundleVersionId) -> Result<BundleVersion>;

    #[allow(clippy::missing_errors_doc)]
    fn find_bundle_versions(
        &self,
        bundle_name: &str,
        version: Option<&str>,
        include_retired: bool,
    ) -> Result<Vec<BundleVersion>>;

    #[allow(clippy::missing_errors_doc)]
    fn query_script_records(&self, filter: &ScriptRecordFilter) -> Result<Vec<ScriptRecordRow>>;

    /// Persists a new active record. Fails when the referenced bundle version
    /// is missing or retired.
    #[allow(clippy::missing_errors_doc)]
    fn save_script_record(&self, record: &NewScriptRecord) -> Result<ScriptRecord>;

    /// Marks an active record superseded. Fails when the record is unknown or
    /// already superseded.
    #[allow(clippy::missing_errors_doc)]
    fn supersede_script_record(&self, record_id: ScriptRecordId) -> Result<ScriptRecord>;
}
