use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{LedgerError, ScriptKey, ScriptRecordFilter, ScriptRecordRow, ScriptRecordStore};

pub const INTEGRITY_REPORT_CONTRACT_VERSION: &str = "integrity_report.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: IntegrityIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub contract_version: String,
    pub healthy: bool,
    pub active_records: usize,
    pub issues: Vec<IntegrityIssue>,
}

/// Scans every active record for violations of the at-most-one-active rule
/// and for records left active under retired bundle versions.
///
/// # Errors
/// Returns [`LedgerError::Persistence`] when the store query fails.
pub fn check_integrity<S>(store: &S) -> Result<IntegrityReport, LedgerError>
where
    S: ScriptRecordStore + ?Sized,
{
    let rows = store
        .query_script_records(&ScriptRecordFilter::all_active())
        .map_err(|err| LedgerError::persistence(&err))?;

    let mut issues = Vec::new();
    let mut by_key: BTreeMap<ScriptKey, Vec<&ScriptRecordRow>> = BTreeMap::new();

    for row in &rows {
        if !row.bundle.is_active() {
            issues.push(IntegrityIssue {
                code: "active_under_retired_version".to_string(),
                severity: IntegrityIssueSeverity::Warning,
                message: format!(
                    "record {} for {} is active under retired version {}@{}",
                    row.record.record_id,
                    row.record.script_file_name,
                    row.bundle.bundle_name,
                    row.bundle.version
                ),
            });
            continue;
        }

        let key = ScriptKey {
            bundle_name: row.bundle.bundle_name.clone(),
            script_file_name: row.record.script_file_name.clone(),
            dialect: row.record.dialect.clone(),
        };
        by_key.entry(key).or_default().push(row);
    }

    for (key, duplicates) in by_key.iter().filter(|(_, rows)| rows.len() > 1) {
        let ids = duplicates
            .iter()
            .map(|row| row.record.record_id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        issues.push(IntegrityIssue {
            code: "duplicate_active".to_string(),
            severity: IntegrityIssueSeverity::Error,
            message: format!("{key} has {} active records: {ids}", duplicates.len()),
        });
    }

    let healthy = !issues
        .iter()
        .any(|issue| issue.severity == IntegrityIssueSeverity::Error);
    if !issues.is_empty() {
        warn!(issues = issues.len(), healthy, "ledger integrity issues found");
    }

    Ok(IntegrityReport {
        contract_version: INTEGRITY_REPORT_CONTRACT_VERSION.to_string(),
        healthy,
        active_records: rows.len(),
        issues,
    })
}
