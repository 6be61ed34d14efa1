use std::path::Path;

use tracing::info;

use crate::{
    check_integrity, require, BundleVersion, ContentHasher, IntegrityReport, LedgerError,
    RecordLookup, RecordedRun, RunDecision, RunRecorder, RunRequest, RunVerdict,
    ScriptRecordFilter, ScriptRecordRow, ScriptRecordStore, Sha256Hasher,
};

/// Stateless facade over one store and one hasher. Every call loads what it
/// needs from the store.
pub struct ScriptLedger<S, H = Sha256Hasher> {
    store: S,
    hasher: H,
}

impl<S> ScriptLedger<S, Sha256Hasher>
where
    S: ScriptRecordStore,
{
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_hasher(store, Sha256Hasher)
    }
}

impl<S, H> ScriptLedger<S, H>
where
    S: ScriptRecordStore,
    H: ContentHasher,
{
    #[must_use]
    pub fn with_hasher(store: S, hasher: H) -> Self {
        Self { store, hasher }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn should_run(&self, bundle_name: &str, file_path: &Path, dialect: &str) -> bool {
        RunDecision::new(&self.store, &self.hasher).should_run(bundle_name, file_path, dialect)
    }

    #[must_use]
    pub fn evaluate(&self, bundle_name: &str, file_path: &Path, dialect: &str) -> RunVerdict {
        RunDecision::new(&self.store, &self.hasher).evaluate(bundle_name, file_path, dialect)
    }

    /// Records a completed run, superseding whatever is active for the
    /// script right now.
    ///
    /// # Errors
    /// See [`RunRecorder::record_run`].
    pub fn record_run(
        &self,
        bundle_name: &str,
        bundle_version: &str,
        file_path: &Path,
        dialect: &str,
    ) -> Result<RecordedRun, LedgerError> {
        let request = RunRequest {
            bundle_name,
            bundle_version,
            file_path,
            dialect,
        };

        let prior = match crate::script_file_name(file_path) {
            Ok(file_name) if !bundle_name.trim().is_empty() && !dialect.trim().is_empty() => {
                RecordLookup::new(&self.store).find(bundle_name, &file_name, dialect)?
            }
            _ => crate::Lookup::NotFound,
        };

        RunRecorder::new(&self.store, &self.hasher).record_run(&request, prior.active_records())
    }

    /// # Errors
    /// Returns [`LedgerError::InvalidInput`] for blank arguments and
    /// [`LedgerError::Persistence`] when the store fails.
    pub fn register_bundle_version(
        &self,
        bundle_name: &str,
        version: &str,
    ) -> Result<BundleVersion, LedgerError> {
        require("bundle_name", bundle_name)?;
        require("bundle_version", version)?;

        let registered = self
            .store
            .register_bundle_version(bundle_name, version)
            .map_err(|err| LedgerError::persistence(&err))?;
        info!(bundle = bundle_name, version, id = %registered.bundle_version_id, "registered bundle version");
        Ok(registered)
    }

    /// # Errors
    /// Returns [`LedgerError::VersionNotFound`] when no active version
    /// matches, [`LedgerError::AmbiguousLookup`] when several do, and
    /// [`LedgerError::Persistence`] when the store fails.
    pub fn retire_bundle_version(
        &self,
        bundle_name: &str,
        version: &str,
    ) -> Result<BundleVersion, LedgerError> {
        require("bundle_name", bundle_name)?;
        require("bundle_version", version)?;

        let matches = self
            .store
            .find_bundle_versions(bundle_name, Some(version), false)
            .map_err(|err| LedgerError::persistence(&err))?;
        if matches.len() > 1 {
            return Err(LedgerError::AmbiguousLookup {
                entity: "bundle_version",
                found: matches.len(),
            });
        }
        let [active] = matches.as_slice() else {
            return Err(LedgerError::VersionNotFound {
                bundle_name: bundle_name.to_string(),
                version: version.to_string(),
                found: matches.len(),
            });
        };

        let retired = self
            .store
            .retire_bundle_version(active.bundle_version_id)
            .map_err(|err| LedgerError::persistence(&err))?;
        info!(bundle = bundle_name, version, id = %retired.bundle_version_id, "retired bundle version");
        Ok(retired)
    }

    /// # Errors
    /// Returns [`LedgerError::InvalidInput`] for a blank name and
    /// [`LedgerError::Persistence`] when the store fails.
    pub fn list_bundle_versions(
        &self,
        bundle_name: &str,
        include_retired: bool,
    ) -> Result<Vec<BundleVersion>, LedgerError> {
        require("bundle_name", bundle_name)?;
        self.store
            .find_bundle_versions(bundle_name, None, include_retired)
            .map_err(|err| LedgerError::persistence(&err))
    }

    /// Every record written for a script file, oldest first.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidInput`] for blank arguments and
    /// [`LedgerError::Persistence`] when the store fails.
    pub fn history(
        &self,
        bundle_name: &str,
        script_file_name: &str,
    ) -> Result<Vec<ScriptRecordRow>, LedgerError> {
        require("bundle_name", bundle_name)?;
        require("script_file_name", script_file_name)?;
        self.store
            .query_script_records(&ScriptRecordFilter::history_for(
                bundle_name,
                script_file_name,
            ))
            .map_err(|err| LedgerError::persistence(&err))
    }

    /// # Errors
    /// Returns [`LedgerError::Persistence`] when the store fails.
    pub fn check_integrity(&self) -> Result<IntegrityReport, LedgerError> {
        check_integrity(&self.store)
    }
}
