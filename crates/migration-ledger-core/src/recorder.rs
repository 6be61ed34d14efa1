use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    require, script_file_name, BundleVersion, ContentHasher, LedgerError, NewScriptRecord,
    RecordLookup, ScriptKey, ScriptRecord, ScriptRecordId, ScriptRecordStore,
};

/// Inputs describing a run the caller has already executed successfully.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'r> {
    pub bundle_name: &'r str,
    pub bundle_version: &'r str,
    pub file_path: &'r Path,
    pub dialect: &'r str,
}

impl RunRequest<'_> {
    fn validate(&self) -> Result<(), LedgerError> {
        require("bundle_name", self.bundle_name)?;
        require("bundle_version", self.bundle_version)?;
        if self.file_path.as_os_str().is_empty() {
            return Err(LedgerError::InvalidInput("file_path"));
        }
        require("dialect", self.dialect)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordedRun {
    pub record: ScriptRecord,
    pub bundle: BundleVersion,
    pub superseded: Vec<ScriptRecord>,
}

/// Records completed runs and supersedes the records they replace.
pub struct RunRecorder<'a, S: ?Sized, H: ?Sized> {
    store: &'a S,
    hasher: &'a H,
}

impl<'a, S, H> RunRecorder<'a, S, H>
where
    S: ScriptRecordStore + ?Sized,
    H: ContentHasher + ?Sized,
{
    #[must_use]
    pub fn new(store: &'a S, hasher: &'a H) -> Self {
        Self { store, hasher }
    }

    /// Records a run of `request.file_path` under the named bundle version.
    ///
    /// `prior` holds the active records the caller looked up before
    /// executing the script. The replacement record is inserted first; the
    /// prior records are superseded only after the insert succeeds.
    ///
    /// # Errors
    /// - [`LedgerError::InvalidInput`] for blank request fields.
    /// - [`LedgerError::FileNotFound`] / [`LedgerError::Io`] when the script
    ///   cannot be hashed.
    /// - [`LedgerError::VersionNotFound`] unless exactly one active bundle
    ///   version matches.
    /// - [`LedgerError::Validation`] when a prior record is listed twice or is
    ///   not an active record of the request's key.
    /// - [`LedgerError::ConcurrentRun`] when an active record outside `prior`
    ///   appeared since the caller's lookup.
    /// - [`LedgerError::Persistence`] when the store rejects a write.
    ///
    /// Every error except a failed supersession leaves the store untouched.
    pub fn record_run(
        &self,
        request: &RunRequest<'_>,
        prior: &[ScriptRecord],
    ) -> Result<RecordedRun, LedgerError> {
        request.validate()?;

        let bundle = self.resolve_bundle_version(request.bundle_name, request.bundle_version)?;

        if !request.file_path.is_file() {
            return Err(LedgerError::FileNotFound(request.file_path.to_path_buf()));
        }
        let key = ScriptKey::new(
            request.bundle_name,
            &script_file_name(request.file_path)?,
            request.dialect,
        )?;
        let content_hash = self.hasher.hash_file(request.file_path)?;

        validate_prior(&key, prior)?;
        self.reconcile_prior(&key, prior)?;

        let new_record = NewScriptRecord {
            bundle_version_id: bundle.bundle_version_id,
            script_file_name: key.script_file_name.clone(),
            content_hash,
            dialect: key.dialect.clone(),
        };
        new_record.validate()?;

        let record = self
            .store
            .save_script_record(&new_record)
            .map_err(|err| LedgerError::persistence(&err))?;

        let mut superseded = Vec::with_capacity(prior.len());
        for previous in prior {
            match self.store.supersede_script_record(previous.record_id) {
                Ok(value) => superseded.push(value),
                Err(err) => {
                    warn!(
                        %key,
                        recorded = %record.record_id,
                        prior = %previous.record_id,
                        "recorded run but failed to supersede prior record"
                    );
                    return Err(LedgerError::Persistence(format!(
                        "recorded {} but failed to supersede {}: {err:#}",
                        record.record_id, previous.record_id
                    )));
                }
            }
        }

        info!(
            %key,
            version = %bundle.version,
            record = %record.record_id,
            hash = %record.content_hash,
            superseded = superseded.len(),
            "recorded script run"
        );

        Ok(RecordedRun {
            record,
            bundle,
            superseded,
        })
    }

    fn resolve_bundle_version(
        &self,
        bundle_name: &str,
        version: &str,
    ) -> Result<BundleVersion, LedgerError> {
        let mut matches = self
            .store
            .find_bundle_versions(bundle_name, Some(version), false)
            .map_err(|err| LedgerError::persistence(&err))?;

        if matches.len() != 1 {
            return Err(LedgerError::VersionNotFound {
                bundle_name: bundle_name.to_string(),
                version: version.to_string(),
                found: matches.len(),
            });
        }

        matches.pop().ok_or_else(|| LedgerError::VersionNotFound {
            bundle_name: bundle_name.to_string(),
            version: version.to_string(),
            found: 0,
        })
    }

    /// Compares `prior` with the active records the store holds for `key`
    /// right now. A prior record outside that set belongs to another bundle
    /// or to a retired version; an active record missing from `prior` was
    /// written by a concurrent run.
    fn reconcile_prior(&self, key: &ScriptKey, prior: &[ScriptRecord]) -> Result<(), LedgerError> {
        let lookup = RecordLookup::new(self.store).find_key(key)?;
        let current: BTreeSet<ScriptRecordId> = lookup
            .active_records()
            .iter()
            .map(|record| record.record_id)
            .collect();

        if let Some(foreign) = prior
            .iter()
            .find(|record| !current.contains(&record.record_id))
        {
            return Err(LedgerError::Validation(format!(
                "prior record {} is not an active record of {key}",
                foreign.record_id
            )));
        }

        let expected: BTreeSet<ScriptRecordId> =
            prior.iter().map(|record| record.record_id).collect();
        let unexpected: Vec<String> = current
            .difference(&expected)
            .map(ToString::to_string)
            .collect();

        if unexpected.is_empty() {
            return Ok(());
        }

        warn!(%key, unexpected = %unexpected.join(","), "concurrent script run detected");
        Err(LedgerError::ConcurrentRun {
            key: key.to_string(),
            detail: format!(
                "active record(s) {} were written after the caller's lookup",
                unexpected.join(",")
            ),
        })
    }
}

fn validate_prior(key: &ScriptKey, prior: &[ScriptRecord]) -> Result<(), LedgerError> {
    let mut seen = BTreeSet::new();
    for record in prior {
        if !seen.insert(record.record_id) {
            return Err(LedgerError::Validation(format!(
                "prior record {} is listed more than once",
                record.record_id
            )));
        }

        if record.script_file_name != key.script_file_name || record.dialect != key.dialect {
            return Err(LedgerError::Validation(format!(
                "prior record {} ({}[{}]) does not belong to {key}",
                record.record_id, record.script_file_name, record.dialect
            )));
        }

        if !record.is_active() {
            return Err(LedgerError::Validation(format!(
                "prior record {} is already {}",
                record.record_id,
                record.status.as_str()
            )));
        }
    }

    Ok(())
}
