// SnapGuard audit.rs
// Purpose: Append-only rollback audit log (JSON lines) mirrored to tracing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{SnapError, SnapResult};

pub const ROLLBACK_LOG_FILE: &str = "rollback.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackOutcome {
    Success,
    Failed,
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackOutcome::Success => f.write_str("success"),
            RollbackOutcome::Failed => f.write_str("failed"),
        }
    }
}

/// One line of `rollback.log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub target_snapshot_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_snapshot_id: Option<String>,
    pub outcome: RollbackOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RollbackRecord {
    pub fn new(target_snapshot_id: &str, outcome: RollbackOutcome) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            target_snapshot_id: target_snapshot_id.to_string(),
            safety_snapshot_id: None,
            outcome,
            detail: None,
        }
    }

    pub fn with_safety_snapshot(mut self, id: &str) -> Self {
        self.safety_snapshot_id = Some(id.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Emit the record as a structured tracing event.
    pub fn trace(&self) {
        let safety = self.safety_snapshot_id.as_deref().unwrap_or("-");
        let detail = self.detail.as_deref().unwrap_or("");
        match self.outcome {
            RollbackOutcome::Success => info!(
                target: "snapguard::audit",
                record = %self.id,
                target_snapshot = %self.target_snapshot_id,
                safety_snapshot = %safety,
                "rollback succeeded {detail}"
            ),
            RollbackOutcome::Failed => error!(
                target: "snapguard::audit",
                record = %self.id,
                target_snapshot = %self.target_snapshot_id,
                safety_snapshot = %safety,
                "rollback failed: {detail}"
            ),
        }
    }
}

/// Handle on the rollback log inside a snapshots root.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(snapshots_root: &Path) -> Self {
        Self {
            path: snapshots_root.join(ROLLBACK_LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and fsync. Existing lines are never rewritten.
    pub fn append(&self, record: &RollbackRecord) -> SnapResult<()> {
        record.trace();

        let mut line = serde_json::to_string(record)
            .map_err(|e| SnapError::serialization("encoding rollback record", e))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SnapError::io("opening rollback log", e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| SnapError::io("appending rollback record", e))?;
        file.sync_all()
            .map_err(|e| SnapError::io("syncing rollback log", e))
    }

    /// Every parseable record, oldest first. Corrupt lines are skipped.
    pub fn records(&self) -> SnapResult<Vec<RollbackRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|e| SnapError::io("opening rollback log", e))?;
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| SnapError::io("reading rollback log", e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RollbackRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("skipping malformed rollback log line {}: {e}", index + 1),
            }
        }
        Ok(records)
    }

    pub fn last_record(&self) -> SnapResult<Option<RollbackRecord>> {
        Ok(self.records()?.pop())
    }
}
