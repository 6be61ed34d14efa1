use tracing::{debug, warn};

use crate::{LedgerError, ScriptKey, ScriptRecord, ScriptRecordFilter, ScriptRecordStore};

/// Result of resolving the active record for a [`ScriptKey`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Lookup {
    Found(ScriptRecord),
    NotFound,
    /// More than one active record exists for the key.
    Ambiguous(Vec<ScriptRecord>),
}

impl Lookup {
    /// The active record when exactly one exists.
    #[must_use]
    pub fn found(&self) -> Option<&ScriptRecord> {
        match self {
            Self::Found(record) => Some(record),
            Self::NotFound | Self::Ambiguous(_) => None,
        }
    }

    /// Every active record observed, for use as the prior set of a run.
    #[must_use]
    pub fn active_records(&self) -> &[ScriptRecord] {
        match self {
            Self::Found(record) => std::slice::from_ref(record),
            Self::NotFound => &[],
            Self::Ambiguous(records) => records,
        }
    }
}

pub struct RecordLookup<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> RecordLookup<'a, S>
where
    S: ScriptRecordStore + ?Sized,
{
    #[must_use]
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Resolves the active record for `(bundle_name, file_name, dialect)`.
    ///
    /// Only records that are active and attributed to an active bundle
    /// version are considered.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidInput`] for blank arguments and
    /// [`LedgerError::Persistence`] when the store query fails.
    pub fn find(
        &self,
        bundle_name: &str,
        file_name: &str,
        dialect: &str,
    ) -> Result<Lookup, LedgerError> {
        let key = ScriptKey::new(bundle_name, file_name, dialect)?;
        self.find_key(&key)
    }

    /// Resolves the active record for an already validated key.
    ///
    /// # Errors
    /// Returns [`LedgerError::Persistence`] when the store query fails.
    pub fn find_key(&self, key: &ScriptKey) -> Result<Lookup, LedgerError> {
        let rows = self
            .store
            .query_script_records(&ScriptRecordFilter::active_for(key))
            .map_err(|err| LedgerError::persistence(&err))?;

        let mut records: Vec<ScriptRecord> = rows.into_iter().map(|row| row.record).collect();
        debug!(%key, matches = records.len(), "resolved active script records");

        match records.len() {
            0 => Ok(Lookup::NotFound),
            1 => Ok(records.pop().map_or(Lookup::NotFound, Lookup::Found)),
            found => {
                warn!(%key, found, "multiple active script records for one key");
                Ok(Lookup::Ambiguous(records))
            }
        }
    }
}
