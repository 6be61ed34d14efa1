use std::path::Path;

use tracing::{debug, info};

use crate::{
    script_file_name, ContentHash, ContentHasher, LedgerError, Lookup, RecordLookup, ScriptKey,
    ScriptRecord, ScriptRecordStore,
};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RunReason {
    /// No active record exists for the key.
    NeverRun,
    /// The file content no longer matches the active record.
    ContentChanged {
        previous: ScriptRecord,
        current_hash: ContentHash,
    },
    /// Several active records exist; the run must be repeated and all of
    /// them superseded.
    AmbiguousHistory { active: Vec<ScriptRecord> },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RunVerdict {
    MustRun(RunReason),
    UpToDate(ScriptRecord),
    Unevaluable(LedgerError),
}

impl RunVerdict {
    /// Boolean shortcut: `true` only for [`RunVerdict::MustRun`].
    #[must_use]
    pub fn should_run(&self) -> bool {
        matches!(self, Self::MustRun(_))
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MustRun(_) => "must_run",
            Self::UpToDate(_) => "up_to_date",
            Self::Unevaluable(_) => "unevaluable",
        }
    }

    /// Active records a subsequent run of this script will supersede.
    #[must_use]
    pub fn prior_records(&self) -> &[ScriptRecord] {
        match self {
            Self::MustRun(RunReason::ContentChanged { previous, .. }) => {
                std::slice::from_ref(previous)
            }
            Self::MustRun(RunReason::AmbiguousHistory { active }) => active,
            Self::UpToDate(record) => std::slice::from_ref(record),
            Self::MustRun(RunReason::NeverRun) | Self::Unevaluable(_) => &[],
        }
    }
}

/// Decides whether a script needs to be (re-)executed.
pub struct RunDecision<'a, S: ?Sized, H: ?Sized> {
    store: &'a S,
    hasher: &'a H,
}

impl<'a, S, H> RunDecision<'a, S, H>
where
    S: ScriptRecordStore + ?Sized,
    H: ContentHasher + ?Sized,
{
    #[must_use]
    pub fn new(store: &'a S, hasher: &'a H) -> Self {
        Self { store, hasher }
    }

    /// Returns `true` when the script must run. Every failure, including
    /// blank input and a missing file, yields `false`.
    #[must_use]
    pub fn should_run(&self, bundle_name: &str, file_path: &Path, dialect: &str) -> bool {
        self.evaluate(bundle_name, file_path, dialect).should_run()
    }

    #[must_use]
    pub fn evaluate(&self, bundle_name: &str, file_path: &Path, dialect: &str) -> RunVerdict {
        let verdict = match self.try_evaluate(bundle_name, file_path, dialect) {
            Ok(verdict) => verdict,
            Err(err) => RunVerdict::Unevaluable(err),
        };

        info!(
            bundle = bundle_name,
            file = %file_path.display(),
            dialect,
            verdict = verdict.as_str(),
            "evaluated script"
        );
        verdict
    }

    fn try_evaluate(
        &self,
        bundle_name: &str,
        file_path: &Path,
        dialect: &str,
    ) -> Result<RunVerdict, LedgerError> {
        if bundle_name.is_empty() {
            return Err(LedgerError::InvalidInput("bundle_name"));
        }
        if file_path.as_os_str().is_empty() {
            return Err(LedgerError::InvalidInput("file_path"));
        }
        if dialect.is_empty() {
            return Err(LedgerError::InvalidInput("dialect"));
        }

        if !file_path.is_file() {
            return Err(LedgerError::FileNotFound(file_path.to_path_buf()));
        }

        let key = ScriptKey::new(bundle_name, &script_file_name(file_path)?, dialect)?;

        match RecordLookup::new(self.store).find_key(&key)? {
            Lookup::NotFound => Ok(RunVerdict::MustRun(RunReason::NeverRun)),
            Lookup::Ambiguous(active) => {
                Ok(RunVerdict::MustRun(RunReason::AmbiguousHistory { active }))
            }
            Lookup::Found(previous) => {
                let current_hash = self.hasher.hash_file(file_path)?;
                debug!(
                    %key,
                    recorded = %previous.content_hash,
                    current = %current_hash,
                    "compared content hashes"
                );

                if current_hash == previous.content_hash {
                    Ok(RunVerdict::UpToDate(previous))
                } else {
                    Ok(RunVerdict::MustRun(RunReason::ContentChanged {
                        previous,
                        current_hash,
                    }))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{must, MemoryStore, ScriptDir};
    use crate::{NewScriptRecord, Sha256Hasher};

    fn record_hash(store: &MemoryStore, file: &str, dialect: &str, hash: ContentHash) -> ScriptRecord {
        let version = must(store.register_bundle_version("core", "1.0.0"));
        must(store.save_script_record(&NewScriptRecord {
            bundle_version_id: version.bundle_version_id,
            script_file_name: file.to_string(),
            content_hash: hash,
            dialect: dialect.to_string(),
        }))
    }

    #[test]
    fn blank_inputs_are_unevaluable_and_do_not_run() {
        let store = MemoryStore::default();
        let dir = ScriptDir::new("decision-blank");
        let path = dir.write("001_init.sql", "SELECT 1;");
        let decision = RunDecision::new(&store, &Sha256Hasher);

        assert_eq!(
            decision.evaluate("", &path, "mysql"),
            RunVerdict::Unevaluable(LedgerError::InvalidInput("bundle_name"))
        );
        assert_eq!(
            decision.evaluate("core", Path::new(""), "mysql"),
            RunVerdict::Unevaluable(LedgerError::InvalidInput("file_path"))
        );
        assert!(!decision.should_run("core", &path, ""));
    }

    #[test]
    fn missing_file_never_runs_even_without_records() {
        let store = MemoryStore::default();
        let dir = ScriptDir::new("decision-missing");
        let path = dir.path("absent.sql");
        let decision = RunDecision::new(&store, &Sha256Hasher);

        assert_eq!(
            decision.evaluate("core", &path, "mysql"),
            RunVerdict::Unevaluable(LedgerError::FileNotFound(path.clone()))
        );
        assert!(!decision.should_run("core", &path, "mysql"));
    }

    #[test]
    fn deleted_file_never_runs_even_with_active_record() {
        let store = MemoryStore::default();
        let dir = ScriptDir::new("decision-deleted");
        let path = dir.write("001_init.sql", "SELECT 1;");
        let recorded = record_hash(&store, "001_init.sql", "mysql", must(Sha256Hasher.hash_file(&path)));
        let decision = RunDecision::new(&store, &Sha256Hasher);
        assert_eq!(
            decision.evaluate("core", &path, "mysql"),
            RunVerdict::UpToDate(recorded)
        );

        must(std::fs::remove_file(&path));

        assert_eq!(
            decision.evaluate("core", &path, "mysql"),
            RunVerdict::Unevaluable(LedgerError::FileNotFound(path.clone()))
        );
        assert!(!decision.should_run("core", &path, "mysql"));
    }

    #[test]
    fn directory_path_is_not_a_script_file() {
        let store = MemoryStore::default();
        let dir = ScriptDir::new("decision-directory");
        let decision = RunDecision::new(&store, &Sha256Hasher);

        assert!(!decision.should_run("core", dir.root(), "mysql"));
    }

    #[test]
    fn unrecorded_script_must_run() {
        let store = MemoryStore::default();
        let dir = ScriptDir::new("decision-new");
        let path = dir.write("001_init.sql", "SELECT 1;");
        let decision = RunDecision::new(&store, &Sha256Hasher);

        assert_eq!(
            decision.evaluate("core", &path, "mysql"),
            RunVerdict::MustRun(RunReason::NeverRun)
        );
    }

    #[test]
    fn matching_hash_is_up_to_date() {
        let store = MemoryStore::default();
        let dir = ScriptDir::new("decision-same");
        let path = dir.write("001_init.sql", "SELECT 1;");
        let hash = must(Sha256Hasher.hash_file(&path));
        let record = record_hash(&store, "001_init.sql", "mysql", hash);
        let decision = RunDecision::new(&store, &Sha256Hasher);

        assert_eq!(
            decision.evaluate("core", &path, "mysql"),
            RunVerdict::UpToDate(record)
        );
        assert!(!decision.should_run("core", &path, "mysql"));
    }

    #[test]
    fn changed_hash_must_run_again() {
        let store = MemoryStore::default();
        let dir = ScriptDir::new("decision-changed");
        let path = dir.write("001_init.sql", "SELECT 1;");
        let previous = record_hash(
            &store,
            "001_init.sql",
            "mysql",
            must(Sha256Hasher.hash_file(&path)),
        );
        let _ = dir.write("001_init.sql", "SELECT 2;");
        let decision = RunDecision::new(&store, &Sha256Hasher);

        let verdict = decision.evaluate("core", &path, "mysql");
        assert_eq!(verdict.prior_records(), std::slice::from_ref(&previous));
        match verdict {
            RunVerdict::MustRun(RunReason::ContentChanged { current_hash, .. }) => {
                assert_eq!(current_hash.as_str(), crate::sha256_hex(b"SELECT 2;"));
            }
            other => panic!("expected content change, got {other:?}"),
        }
    }

    #[test]
    fn ambiguous_history_must_run_and_carries_all_active_records() {
        let store = MemoryStore::default();
        let dir = ScriptDir::new("decision-ambiguous");
        let path = dir.write("001_init.sql", "SELECT 1;");
        let hash = must(Sha256Hasher.hash_file(&path));
        let first = record_hash(&store, "001_init.sql", "mysql", hash.clone());
        let second = record_hash(&store, "001_init.sql", "mysql", hash);
        let decision = RunDecision::new(&store, &Sha256Hasher);

        let verdict = decision.evaluate("core", &path, "mysql");
        assert!(verdict.should_run());
        assert_eq!(verdict.prior_records(), &[first, second]);
    }

    #[test]
    fn store_failure_is_unevaluable() {
        let store = MemoryStore::default();
        store.fail_queries(true);
        let dir = ScriptDir::new("decision-store-failure");
        let path = dir.write("001_init.sql", "SELECT 1;");
        let decision = RunDecision::new(&store, &Sha256Hasher);

        let verdict = decision.evaluate("core", &path, "mysql");
        assert!(matches!(
            verdict,
            RunVerdict::Unevaluable(LedgerError::Persistence(_))
        ));
        assert!(!verdict.should_run());
    }
}
