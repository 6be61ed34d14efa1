use std::cell::{Cell, RefCell};
use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use ulid::Ulid;

use crate::{
    now_utc, BundleVersion, BundleVersionId, NewScriptRecord, RecordStatus, ScriptRecord,
    ScriptRecordFilter, ScriptRecordId, ScriptRecordRow, ScriptRecordStore,
};

pub(crate) fn must<T, E: Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

/// In-memory store with switchable failures and an operation log.
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    versions: RefCell<Vec<BundleVersion>>,
    records: RefCell<Vec<ScriptRecord>>,
    operations: RefCell<Vec<String>>,
    fail_saves: Cell<bool>,
    fail_queries: Cell<bool>,
    fail_supersedes: Cell<bool>,
}

impl MemoryStore {
    pub(crate) fn fail_saves(&self, value: bool) {
        self.fail_saves.set(value);
    }

    pub(crate) fn fail_queries(&self, value: bool) {
        self.fail_queries.set(value);
    }

    pub(crate) fn fail_supersedes(&self, value: bool) {
        self.fail_supersedes.set(value);
    }

    /// Inserts a version without the idempotency check, to simulate a
    /// store that lost its uniqueness guarantee.
    pub(crate) fn push_bundle_version(&self, bundle_name: &str, version: &str) -> BundleVersion {
        let pushed = BundleVersion {
            bundle_version_id: BundleVersionId::new(),
            bundle_name: bundle_name.to_string(),
            version: version.to_string(),
            created_at: now_utc(),
            retired_at: None,
        };
        self.versions.borrow_mut().push(pushed.clone());
        pushed
    }

    pub(crate) fn operations(&self) -> Vec<String> {
        self.operations.borrow().clone()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.records
            .borrow()
            .iter()
            .filter(|record| record.is_active())
            .count()
    }

    fn bundle(&self, id: BundleVersionId) -> Option<BundleVersion> {
        self.versions
            .borrow()
            .iter()
            .find(|version| version.bundle_version_id == id)
            .cloned()
    }
}

impl ScriptRecordStore for MemoryStore {
    fn migrate(&self) -> Result<()> {
        Ok(())
    }

    fn register_bundle_version(&self, bundle_name: &str, version: &str) -> Result<BundleVersion> {
        if let Some(existing) = self.find_bundle_versions(bundle_name, Some(version), false)?.pop() {
            return Ok(existing);
        }

        let registered = BundleVersion {
            bundle_version_id: BundleVersionId::new(),
            bundle_name: bundle_name.to_string(),
            version: version.to_string(),
            created_at: now_utc(),
            retired_at: None,
        };
        self.versions.borrow_mut().push(registered.clone());
        Ok(registered)
    }

    fn retire_bundle_version(&self, bundle_version_id: BundleVersionId) -> Result<BundleVersion> {
        let mut versions = self.versions.borrow_mut();
        let version = versions
            .iter_mut()
            .find(|version| version.bundle_version_id == bundle_version_id && version.is_active())
            .ok_or_else(|| anyhow!("no active bundle version {bundle_version_id}"))?;
        version.retired_at = Some(now_utc());
        Ok(version.clone())
    }

    fn find_bundle_versions(
        &self,
        bundle_name: &str,
        version: Option<&str>,
        include_retired: bool,
    ) -> Result<Vec<BundleVersion>> {
        if self.fail_queries.get() {
            return Err(anyhow!("query rejected"));
        }

        Ok(self
            .versions
            .borrow()
            .iter()
            .filter(|candidate| candidate.bundle_name == bundle_name)
            .filter(|candidate| version.map_or(true, |value| candidate.version == value))
            .filter(|candidate| include_retired || candidate.is_active())
            .cloned()
            .collect())
    }

    fn query_script_records(&self, filter: &ScriptRecordFilter) -> Result<Vec<ScriptRecordRow>> {
        if self.fail_queries.get() {
            return Err(anyhow!("query rejected"));
        }

        let mut rows = Vec::new();
        for record in self.records.borrow().iter() {
            let Some(bundle) = self.bundle(record.bundle_version_id) else {
                continue;
            };
            let matches = filter
                .bundle_name
                .as_ref()
                .map_or(true, |name| &bundle.bundle_name == name)
                && filter
                    .script_file_name
                    .as_ref()
                    .map_or(true, |name| &record.script_file_name == name)
                && filter
                    .dialect
                    .as_ref()
                    .map_or(true, |dialect| &record.dialect == dialect)
                && filter.status.map_or(true, |status| record.status == status)
                && (filter.include_retired_bundles || bundle.is_active());

            if matches {
                rows.push(ScriptRecordRow {
                    record: record.clone(),
                    bundle,
                });
            }
        }
        Ok(rows)
    }

    fn save_script_record(&self, record: &NewScriptRecord) -> Result<ScriptRecord> {
        if self.fail_saves.get() {
            return Err(anyhow!("save rejected"));
        }

        match self.bundle(record.bundle_version_id) {
            Some(bundle) if bundle.is_active() => {}
            _ => return Err(anyhow!("bundle version {} is not active", record.bundle_version_id)),
        }

        let saved = ScriptRecord {
            record_id: ScriptRecordId(Ulid::new()),
            bundle_version_id: record.bundle_version_id,
            script_file_name: record.script_file_name.clone(),
            content_hash: record.content_hash.clone(),
            dialect: record.dialect.clone(),
            status: RecordStatus::Active,
            recorded_at: now_utc(),
            superseded_at: None,
        };
        self.records.borrow_mut().push(saved.clone());
        self.operations
            .borrow_mut()
            .push(format!("save:{}", saved.record_id));
        Ok(saved)
    }

    fn supersede_script_record(&self, record_id: ScriptRecordId) -> Result<ScriptRecord> {
        if self.fail_supersedes.get() {
            return Err(anyhow!("supersede rejected"));
        }

        let mut records = self.records.borrow_mut();
        let record = records
            .iter_mut()
            .find(|record| record.record_id == record_id && record.is_active())
            .ok_or_else(|| anyhow!("no active script record {record_id}"))?;
        record.status = RecordStatus::Superseded;
        record.superseded_at = Some(now_utc());
        self.operations
            .borrow_mut()
            .push(format!("supersede:{record_id}"));
        Ok(record.clone())
    }
}

/// Scratch directory for script files, removed on drop.
pub(crate) struct ScriptDir {
    root: PathBuf,
}

impl ScriptDir {
    pub(crate) fn new(label: &str) -> Self {
        let root = std::env::temp_dir().join(format!("migration-ledger-{label}-{}", Ulid::new()));
        if let Err(err) = std::fs::create_dir_all(&root) {
            panic!("failed to create {}: {err}", root.display());
        }
        Self { root }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub(crate) fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path(name);
        if let Err(err) = std::fs::write(&path, contents) {
            panic!("failed to write {}: {err}", path.display());
        }
        path
    }
}

impl Drop for ScriptDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}
