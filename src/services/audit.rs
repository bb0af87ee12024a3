use crate::services::logger::Logger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Closed action vocabulary for audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditAction {
    #[serde(rename = "session.connect")]
    SessionConnect,
    #[serde(rename = "session.disconnect")]
    SessionDisconnect,
    #[serde(rename = "session.heartbeat_failed")]
    SessionHeartbeatFailed,
    #[serde(rename = "session.evicted")]
    SessionEvicted,
    #[serde(rename = "plan.submitted")]
    PlanSubmitted,
    #[serde(rename = "plan.generation_failed")]
    PlanGenerationFailed,
    #[serde(rename = "step.approved")]
    StepApproved,
    #[serde(rename = "step.rejected")]
    StepRejected,
    #[serde(rename = "step.executing")]
    StepExecuting,
    #[serde(rename = "step.result")]
    StepResult,
    #[serde(rename = "step.skipped")]
    StepSkipped,
    #[serde(rename = "plan.resolved")]
    PlanResolved,
    #[serde(rename = "chat.message")]
    ChatMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Ok,
    Failed,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub detail: Value,
}

impl AuditRecord {
    pub fn new(user_id: &str, action: AuditAction, outcome: AuditOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            session_id: None,
            plan_id: None,
            step_index: None,
            action,
            outcome,
            detail: Value::Null,
        }
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn plan(mut self, plan_id: &str) -> Self {
        self.plan_id = Some(plan_id.to_string());
        self
    }

    pub fn step(mut self, step_index: usize) -> Self {
        self.step_index = Some(step_index);
        self
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Append-only audit collaborator. The core only ever writes; retention and
/// querying live behind whatever implementation the host wires in. Must be
/// safe for concurrent emitters.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: AuditRecord);
}

/// JSONL file sink. Records are serialized one per line; write failures are
/// counted and logged, never surfaced to the emitting operation.
pub struct JsonlAuditSink {
    logger: Logger,
    path: PathBuf,
    write_lock: Mutex<()>,
    failures: Mutex<u64>,
}

impl JsonlAuditSink {
    pub fn new(logger: Logger, path: PathBuf) -> Self {
        Self {
            logger: logger.child("audit"),
            path,
            write_lock: Mutex::new(()),
            failures: Mutex::new(0),
        }
    }

    pub fn failures(&self) -> u64 {
        *self.failures.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, record: AuditRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                self.logger.error(
                    "Audit record serialization failed",
                    Some(&serde_json::json!({"error": err.to_string()})),
                );
                return;
            }
        };
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}", line));
        if let Err(err) = written {
            if let Ok(mut failures) = self.failures.lock() {
                *failures += 1;
            }
            self.logger.warn(
                "Audit write failed",
                Some(&serde_json::json!({"error": err.to_string()})),
            );
        }
    }
}

/// In-memory sink used by the test suite and embedders that forward records
/// elsewhere.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.records().into_iter().map(|r| r.action).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(record);
    }
}
