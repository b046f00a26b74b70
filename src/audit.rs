// =============================================================================
// Session Audit Log — append-only record of notable engine events
// =============================================================================
//
// Halts, flatten attempts, breaker transitions, license transitions, and
// snapshot discards all land here as JSON lines under
// `{data_dir}/audit_log.jsonl`. The log is for operators and post-mortems;
// write failures are logged and never block trading.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    /// Machine-readable event kind, e.g. "FLATTEN_FAILED", "SESSION_HALT".
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub struct AuditLog {
    path: PathBuf,
    write_errors: u64,
}

impl AuditLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("audit_log.jsonl"),
            write_errors: 0,
        }
    }

    pub fn record(&mut self, ts: DateTime<Utc>, kind: &str, message: impl Into<String>) {
        self.record_with(ts, kind, message, None);
    }

    pub fn record_with(
        &mut self,
        ts: DateTime<Utc>,
        kind: &str,
        message: impl Into<String>,
        details: Option<Value>,
    ) {
        let entry = AuditEntry {
            ts,
            kind: kind.to_string(),
            message: message.into(),
            details,
        };

        let line = match serde_json::to_string(&entry) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "audit entry serialisation failed");
                self.write_errors += 1;
                return;
            }
        };

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| {
                f.write_all(line.as_bytes())?;
                f.write_all(b"\n")?;
                f.flush()
            });

        if let Err(e) = result {
            self.write_errors += 1;
            warn!(error = %e, kind = %entry.kind, "audit write failed");
        }
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }
}
