use crate::errors::CoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Risk classification shared by steps and whole plans. Ordering is by
/// severity, so `max()` over step risks yields the plan-level value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
    Critical,
}

impl Risk {
    /// Strict parse over the closed vocabulary. Anything else is the
    /// caller's to normalize (the generator coerces to `Medium` and audits).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "low" => Some(Risk::Low),
            "medium" => Some(Risk::Medium),
            "high" => Some(Risk::High),
            "critical" => Some(Risk::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
            Risk::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Approved,
    Rejected,
    Executing,
    Succeeded,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Rejected | StepState::Succeeded | StepState::Failed | StepState::Skipped
        )
    }
}

/// Reviewer verdict on a step.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Outcome of one remote execution.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub index: usize,
    pub command: String,
    pub explanation: String,
    /// Generator-supplied duration hint, verbatim (e.g. "2 minutes").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_hint: Option<String>,
    /// Parsed form of the hint, used to bound the per-step deadline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_hint_secs: Option<u64>,
    pub risk: Risk,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl Step {
    pub fn new(
        index: usize,
        command: String,
        explanation: String,
        risk: Risk,
        duration_hint: Option<String>,
        duration_hint_secs: Option<u64>,
    ) -> Self {
        Self {
            index,
            command,
            explanation,
            duration_hint,
            duration_hint_secs,
            risk,
            state: StepState::Pending,
            decision: None,
            result: None,
            skip_reason: None,
        }
    }

    fn ensure_state(&self, expected: StepState, transition: &str) -> Result<(), CoreError> {
        if self.state != expected {
            return Err(CoreError::invalid_transition(format!(
                "step {} cannot {} from state {:?}",
                self.index, transition, self.state
            )));
        }
        Ok(())
    }

    pub fn approve(&mut self, reason: Option<String>) -> Result<(), CoreError> {
        self.ensure_state(StepState::Pending, "approve")?;
        self.state = StepState::Approved;
        self.decision = Some(Decision {
            approved: true,
            reason,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn reject(&mut self, reason: Option<String>) -> Result<(), CoreError> {
        self.ensure_state(StepState::Pending, "reject")?;
        self.state = StepState::Rejected;
        self.decision = Some(Decision {
            approved: false,
            reason,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn begin_execution(&mut self) -> Result<(), CoreError> {
        self.ensure_state(StepState::Approved, "execute")?;
        self.state = StepState::Executing;
        Ok(())
    }

    pub fn finish(&mut self, result: StepResult) -> Result<(), CoreError> {
        self.ensure_state(StepState::Executing, "finish")?;
        self.state = if result.exit_code == 0 {
            StepState::Succeeded
        } else {
            StepState::Failed
        };
        self.result = Some(result);
        Ok(())
    }

    pub fn skip(&mut self, reason: &str) -> Result<(), CoreError> {
        self.ensure_state(StepState::Pending, "skip")?;
        self.state = StepState::Skipped;
        self.skip_reason = Some(reason.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// One user request resolved into an ordered command sequence against one
/// host. The shape (ids, classification, steps) is immutable once validated;
/// only step states, decisions and results move, and only through the
/// orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub plan_id: String,
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub request_text: String,
    pub intent: String,
    pub action: String,
    pub explanation: String,
    pub overall_risk: Risk,
    pub steps: Vec<Step>,
}

impl Plan {
    /// Smallest index still in `pending`, if any.
    pub fn first_pending(&self) -> Option<usize> {
        self.steps
            .iter()
            .find(|step| step.state == StepState::Pending)
            .map(|step| step.index)
    }

    pub fn is_resolved(&self) -> bool {
        self.steps.iter().all(|step| step.state.is_terminal())
    }

    pub fn status(&self) -> PlanStatus {
        if !self.is_resolved() {
            return PlanStatus::InProgress;
        }
        let all_clean = self
            .steps
            .iter()
            .all(|step| matches!(step.state, StepState::Succeeded | StepState::Skipped));
        if all_clean {
            PlanStatus::Succeeded
        } else {
            PlanStatus::Failed
        }
    }

    pub fn max_step_risk(&self) -> Risk {
        self.steps
            .iter()
            .map(|step| step.risk)
            .max()
            .unwrap_or(Risk::Low)
    }
}

/// Snapshot returned by `respond`: the step's state after the operation.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub plan_id: String,
    pub step_index: usize,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    pub plan_status: PlanStatus,
}

#[cfg(test)]
mod tests {
    use super::{Plan, Risk, Step, StepResult, StepState};
    use chrono::Utc;

    fn step(index: usize, risk: Risk) -> Step {
        Step::new(index, format!("cmd-{}", index), String::new(), risk, None, None)
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan {
            plan_id: "p".into(),
            session_id: "s".into(),
            user_id: "u".into(),
            created_at: Utc::now(),
            request_text: String::new(),
            intent: String::new(),
            action: String::new(),
            explanation: String::new(),
            overall_risk: Risk::Low,
            steps,
        }
    }

    fn ok_result() -> StepResult {
        StepResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn risk_orders_by_severity() {
        assert!(Risk::Critical > Risk::High);
        assert!(Risk::High > Risk::Medium);
        assert!(Risk::Medium > Risk::Low);
    }

    #[test]
    fn terminal_states_cannot_move() {
        let mut step = step(0, Risk::Low);
        step.reject(None).expect("reject");
        assert!(step.approve(None).is_err());
        assert!(step.skip("late").is_err());
        assert_eq!(step.state, StepState::Rejected);
    }

    #[test]
    fn finish_maps_exit_code_to_state() {
        let mut step = step(0, Risk::Low);
        step.approve(None).expect("approve");
        step.begin_execution().expect("execute");
        step.finish(ok_result()).expect("finish");
        assert_eq!(step.state, StepState::Succeeded);

        let mut failed = self::step(1, Risk::Low);
        failed.approve(None).expect("approve");
        failed.begin_execution().expect("execute");
        let mut result = ok_result();
        result.exit_code = 2;
        failed.finish(result).expect("finish");
        assert_eq!(failed.state, StepState::Failed);
    }

    #[test]
    fn status_requires_every_step_terminal() {
        let mut steps = vec![step(0, Risk::Low), step(1, Risk::Low)];
        steps[0].approve(None).expect("approve");
        steps[0].begin_execution().expect("execute");
        steps[0].finish(ok_result()).expect("finish");
        let plan = plan(steps);
        assert_eq!(plan.status(), super::PlanStatus::InProgress);
        assert_eq!(plan.first_pending(), Some(1));
    }

    #[test]
    fn skipped_steps_still_count_as_success() {
        let mut first = step(0, Risk::Low);
        first.approve(None).expect("approve");
        first.begin_execution().expect("execute");
        first.finish(ok_result()).expect("finish");
        let mut second = step(1, Risk::Low);
        second.skip("operator choice").expect("skip");
        let plan = plan(vec![first, second]);
        assert_eq!(plan.status(), super::PlanStatus::Succeeded);
    }

    #[test]
    fn max_step_risk_tracks_riskiest_step() {
        let plan = plan(vec![step(0, Risk::Low), step(1, Risk::High)]);
        assert_eq!(plan.max_step_risk(), Risk::High);
    }
}
