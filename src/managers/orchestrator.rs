use crate::config::Limits;
use crate::constants::execution::{SKIP_REASON_FAILED, SKIP_REASON_REJECTED};
use crate::constants::limits::LOG_COMMAND_PREFIX_BYTES;
use crate::errors::CoreError;
use crate::managers::generator::{
    build_chat_system_prompt, build_system_prompt, PlanGenerator, PlanValidator,
};
use crate::managers::sessions::{Session, SessionRegistry, SessionStatus};
use crate::managers::ssh::{CommandResult, EXIT_CLIENT_FAILURE};
use crate::plan::{
    ChatMessage, Plan, PlanStatus, StepOutcome, StepResult, StepState,
};
use crate::services::audit::{AuditAction, AuditOutcome, AuditRecord, AuditSink};
use crate::services::logger::Logger;
use crate::services::validation::Validation;
use crate::utils::text::clip_utf8;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Plan snapshot handed to the adapter: the immutable plan shape, its
/// computed status, and the bound chat transcript.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSnapshot {
    #[serde(flatten)]
    pub plan: Plan,
    pub status: PlanStatus,
    pub chat: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatExchange {
    pub user_message: ChatMessage,
    pub ai_message: ChatMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct RespondAllSummary {
    pub plan_id: String,
    pub responded: usize,
    pub outcomes: Vec<StepOutcome>,
    pub status: PlanStatus,
}

struct PlanState {
    plan: Plan,
    chat: Vec<ChatMessage>,
}

/// Each plan owns one async mutex: the exclusive execution token. Every
/// state transition and its audit emission happens under it, so records for
/// a plan reach the sink in causal order.
struct PlanEntry {
    state: tokio::sync::Mutex<PlanState>,
}

/// Owns the lifecycle of every plan: submission, sequential step-gated
/// approval, execution through the session's shell, terminal resolution,
/// and plan-bound chat.
pub struct Orchestrator {
    logger: Logger,
    audit: Arc<dyn AuditSink>,
    registry: Arc<SessionRegistry>,
    generator: Arc<dyn PlanGenerator>,
    validator: PlanValidator,
    validation: Validation,
    limits: Limits,
    plans: DashMap<String, Arc<PlanEntry>>,
    /// session_id -> plan_id of the one unresolved plan allowed in flight.
    active_by_session: DashMap<String, String>,
}

impl Orchestrator {
    pub fn new(
        logger: Logger,
        audit: Arc<dyn AuditSink>,
        registry: Arc<SessionRegistry>,
        generator: Arc<dyn PlanGenerator>,
        limits: Limits,
    ) -> Self {
        let validator = PlanValidator::new(logger.clone());
        Self {
            logger: logger.child("orchestrator"),
            audit,
            registry,
            generator,
            validator,
            validation: Validation::new(),
            limits,
            plans: DashMap::new(),
            active_by_session: DashMap::new(),
        }
    }

    pub async fn submit(
        &self,
        user_id: &str,
        session_id: &str,
        request_text: &str,
        priority: Option<&str>,
    ) -> Result<PlanSnapshot, CoreError> {
        let request_text = self
            .validation
            .ensure_identifier(request_text, "request_text")?;
        let session = self
            .registry
            .lookup(user_id, session_id)
            .map_err(|_| CoreError::session_unavailable("Session not found or closed"))?;
        if session.status() != SessionStatus::Connected {
            return Err(CoreError::session_unavailable(format!(
                "Session is {}",
                session.status().as_str()
            )));
        }

        // Reserve the session's single in-flight slot before the (slow)
        // model call so concurrent submits cannot both generate.
        match self.active_by_session.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                return Err(CoreError::session_busy(
                    "Session already has an unresolved plan",
                )
                .with_details(serde_json::json!({"plan_id": occupied.get().clone()})));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(String::new());
            }
        }

        let generated = self.generate(user_id, session_id, &request_text, &session).await;
        let plan = match generated {
            Ok(plan) => plan,
            Err(err) => {
                self.active_by_session
                    .remove_if(session_id, |_, reserved| reserved.is_empty());
                self.audit.append(
                    AuditRecord::new(user_id, AuditAction::PlanGenerationFailed, AuditOutcome::Failed)
                        .session(session_id)
                        .detail(serde_json::json!({"error": err.code})),
                );
                return Err(err);
            }
        };

        self.active_by_session
            .insert(session_id.to_string(), plan.plan_id.clone());
        let snapshot = PlanSnapshot {
            status: plan.status(),
            chat: Vec::new(),
            plan: plan.clone(),
        };
        self.plans.insert(
            plan.plan_id.clone(),
            Arc::new(PlanEntry {
                state: tokio::sync::Mutex::new(PlanState {
                    plan,
                    chat: Vec::new(),
                }),
            }),
        );
        self.audit.append(
            AuditRecord::new(user_id, AuditAction::PlanSubmitted, AuditOutcome::Ok)
                .session(session_id)
                .plan(&snapshot.plan.plan_id)
                .detail(serde_json::json!({
                    "steps": snapshot.plan.steps.len(),
                    "overall_risk": snapshot.plan.overall_risk.as_str(),
                    "priority": priority.unwrap_or("normal"),
                })),
        );
        Ok(snapshot)
    }

    async fn generate(
        &self,
        user_id: &str,
        session_id: &str,
        request_text: &str,
        session: &Arc<Session>,
    ) -> Result<Plan, CoreError> {
        let profile = self.registry.profile(session).await;
        let system_prompt = build_system_prompt(&profile);
        let reply = self
            .generator
            .generate(&system_prompt, request_text, self.limits.generator_deadline)
            .await?;
        self.validator
            .validate(user_id, session_id, request_text, &reply)
    }

    fn entry(&self, user_id: &str, plan_id: &str) -> Result<Arc<PlanEntry>, CoreError> {
        let entry = self
            .plans
            .get(plan_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::not_found("Plan not found"))?;
        // User scoping is part of identity: a foreign plan id is absent.
        let owner_matches = entry
            .state
            .try_lock()
            .map(|state| state.plan.user_id == user_id)
            .unwrap_or(true);
        if !owner_matches {
            return Err(CoreError::not_found("Plan not found"));
        }
        Ok(entry)
    }

    fn outcome(plan: &Plan, step_index: usize) -> StepOutcome {
        let step = &plan.steps[step_index];
        StepOutcome {
            plan_id: plan.plan_id.clone(),
            step_index,
            state: step.state,
            decision: step.decision.clone(),
            result: step.result.clone(),
            plan_status: plan.status(),
        }
    }

    fn skip_remaining(&self, plan: &mut Plan, reason: &str) {
        let pending: Vec<usize> = plan
            .steps
            .iter()
            .filter(|step| step.state == StepState::Pending)
            .map(|step| step.index)
            .collect();
        for index in pending {
            if plan.steps[index].skip(reason).is_ok() {
                self.audit.append(
                    AuditRecord::new(&plan.user_id, AuditAction::StepSkipped, AuditOutcome::Ok)
                        .session(&plan.session_id)
                        .plan(&plan.plan_id)
                        .step(index)
                        .detail(serde_json::json!({"reason": reason})),
                );
            }
        }
    }

    fn resolve_if_done(&self, plan: &Plan) {
        if !plan.is_resolved() {
            return;
        }
        let outcome = if plan.status() == PlanStatus::Succeeded {
            AuditOutcome::Ok
        } else {
            AuditOutcome::Failed
        };
        self.audit.append(
            AuditRecord::new(&plan.user_id, AuditAction::PlanResolved, outcome)
                .session(&plan.session_id)
                .plan(&plan.plan_id),
        );
        self.active_by_session
            .remove_if(&plan.session_id, |_, active| active == &plan.plan_id);
    }

    fn step_deadline(&self, hint_secs: Option<u64>) -> Duration {
        match hint_secs {
            Some(secs) => Duration::from_secs(secs)
                .max(self.limits.step_deadline_min)
                .min(self.limits.step_deadline_max),
            None => self.limits.step_deadline,
        }
    }

    pub async fn respond(
        &self,
        user_id: &str,
        plan_id: &str,
        step_index: usize,
        approved: bool,
        reason: Option<String>,
    ) -> Result<StepOutcome, CoreError> {
        let entry = self.entry(user_id, plan_id)?;
        let mut state = entry.state.lock().await;
        if state.plan.user_id != user_id {
            return Err(CoreError::not_found("Plan not found"));
        }
        if step_index >= state.plan.steps.len() {
            return Err(CoreError::not_found(format!(
                "Plan has no step {}",
                step_index
            )));
        }

        // Stale responses are idempotent: a terminal step (or a resolved
        // plan) reports its current state with no side effect.
        if state.plan.steps[step_index].state != StepState::Pending {
            return Ok(Self::outcome(&state.plan, step_index));
        }
        let head = state.plan.first_pending();
        if head != Some(step_index) {
            return Err(CoreError::out_of_order(format!(
                "Step {} cannot be decided before step {}",
                step_index,
                head.unwrap_or(0)
            )));
        }

        if !approved {
            state.plan.steps[step_index].reject(reason)?;
            self.audit.append(
                AuditRecord::new(user_id, AuditAction::StepRejected, AuditOutcome::Ok)
                    .session(&state.plan.session_id)
                    .plan(plan_id)
                    .step(step_index),
            );
            self.skip_remaining(&mut state.plan, SKIP_REASON_REJECTED);
            self.resolve_if_done(&state.plan);
            return Ok(Self::outcome(&state.plan, step_index));
        }

        state.plan.steps[step_index].approve(reason)?;
        self.audit.append(
            AuditRecord::new(user_id, AuditAction::StepApproved, AuditOutcome::Ok)
                .session(&state.plan.session_id)
                .plan(plan_id)
                .step(step_index),
        );
        state.plan.steps[step_index].begin_execution()?;
        self.audit.append(
            AuditRecord::new(user_id, AuditAction::StepExecuting, AuditOutcome::Ok)
                .session(&state.plan.session_id)
                .plan(plan_id)
                .step(step_index),
        );

        let session = match self.available_session(user_id, &state.plan.session_id) {
            Ok(session) => session,
            Err(err) => {
                self.fail_step(
                    &mut state.plan,
                    step_index,
                    "session unavailable",
                );
                self.resolve_if_done(&state.plan);
                return Err(err);
            }
        };

        let command = state.plan.steps[step_index].command.clone();
        let deadline = self.step_deadline(state.plan.steps[step_index].duration_hint_secs);
        self.logger.debug(
            "Executing step",
            Some(&serde_json::json!({
                "plan_id": plan_id,
                "step": step_index,
                "command": clip_utf8(&command, LOG_COMMAND_PREFIX_BYTES),
            })),
        );
        let shell = session.shell();
        let ran = tokio::task::spawn_blocking(move || shell.run(&command, deadline)).await;
        let result = match ran {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => client_failure_result("session closed"),
            Err(_) => client_failure_result("execution task failed"),
        };

        if result.exit_code == 0 {
            session.mark_activity();
        } else if result.exit_code == EXIT_CLIENT_FAILURE {
            // Timeout or channel loss degrades the session; the next failed
            // heartbeat closes it.
            session.set_status(SessionStatus::Degraded);
        }

        let failed = result.exit_code != 0;
        let step_result = StepResult {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            duration_ms: result.duration_ms,
            started_at: result.started_at,
            finished_at: result.finished_at,
        };
        state.plan.steps[step_index].finish(step_result)?;
        self.audit.append(
            AuditRecord::new(
                user_id,
                AuditAction::StepResult,
                if failed {
                    AuditOutcome::Failed
                } else {
                    AuditOutcome::Ok
                },
            )
            .session(&state.plan.session_id)
            .plan(plan_id)
            .step(step_index)
            .detail(serde_json::json!({
                "exit_code": state.plan.steps[step_index]
                    .result
                    .as_ref()
                    .map(|r| r.exit_code),
            })),
        );
        if failed {
            self.skip_remaining(&mut state.plan, SKIP_REASON_FAILED);
        }
        self.resolve_if_done(&state.plan);
        Ok(Self::outcome(&state.plan, step_index))
    }

    fn available_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Arc<Session>, CoreError> {
        let session = self
            .registry
            .lookup(user_id, session_id)
            .map_err(|_| CoreError::session_unavailable("Session not found or closed"))?;
        if session.status() != SessionStatus::Connected {
            return Err(CoreError::session_unavailable(format!(
                "Session is {}",
                session.status().as_str()
            )));
        }
        Ok(session)
    }

    fn fail_step(&self, plan: &mut Plan, step_index: usize, stderr: &str) {
        let result = client_failure_result(stderr);
        let step_result = StepResult {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            duration_ms: result.duration_ms,
            started_at: result.started_at,
            finished_at: result.finished_at,
        };
        if plan.steps[step_index].finish(step_result).is_ok() {
            self.audit.append(
                AuditRecord::new(&plan.user_id, AuditAction::StepResult, AuditOutcome::Failed)
                    .session(&plan.session_id)
                    .plan(&plan.plan_id)
                    .step(step_index)
                    .detail(serde_json::json!({"stderr": stderr})),
            );
        }
        self.skip_remaining(plan, SKIP_REASON_FAILED);
    }

    /// Drives `respond` over every remaining pending step in order. A step
    /// failure short-circuits via the single-step cascade; a transport-level
    /// error propagates.
    pub async fn respond_all(
        &self,
        user_id: &str,
        plan_id: &str,
        approved: bool,
    ) -> Result<RespondAllSummary, CoreError> {
        let mut outcomes = Vec::new();
        loop {
            let next = {
                let entry = self.entry(user_id, plan_id)?;
                let state = entry.state.lock().await;
                state.plan.first_pending()
            };
            let Some(step_index) = next else { break };
            let outcome = self
                .respond(user_id, plan_id, step_index, approved, None)
                .await?;
            outcomes.push(outcome);
        }
        let entry = self.entry(user_id, plan_id)?;
        let state = entry.state.lock().await;
        Ok(RespondAllSummary {
            plan_id: plan_id.to_string(),
            responded: outcomes.len(),
            outcomes,
            status: state.plan.status(),
        })
    }

    pub async fn get_plan(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<PlanSnapshot, CoreError> {
        let entry = self.entry(user_id, plan_id)?;
        let state = entry.state.lock().await;
        if state.plan.user_id != user_id {
            return Err(CoreError::not_found("Plan not found"));
        }
        Ok(PlanSnapshot {
            status: state.plan.status(),
            chat: state.chat.clone(),
            plan: state.plan.clone(),
        })
    }

    pub async fn list_plans(&self, user_id: &str) -> Vec<PlanSnapshot> {
        let entries: Vec<Arc<PlanEntry>> = self
            .plans
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut snapshots = Vec::new();
        for entry in entries {
            let state = entry.state.lock().await;
            if state.plan.user_id == user_id {
                snapshots.push(PlanSnapshot {
                    status: state.plan.status(),
                    chat: state.chat.clone(),
                    plan: state.plan.clone(),
                });
            }
        }
        snapshots.sort_by(|a, b| b.plan.created_at.cmp(&a.plan.created_at));
        snapshots
    }

    /// Appends a discussion exchange bound to the plan. Explanatory only:
    /// the plan's steps are inputs to the reply, never outputs. Model
    /// failures degrade to a canned summary; `chat` itself only fails when
    /// the plan does not exist.
    pub async fn chat(
        &self,
        user_id: &str,
        plan_id: &str,
        message: &str,
    ) -> Result<ChatExchange, CoreError> {
        let entry = self.entry(user_id, plan_id)?;
        let (plan_clone, user_message) = {
            let mut state = entry.state.lock().await;
            if state.plan.user_id != user_id {
                return Err(CoreError::not_found("Plan not found"));
            }
            let user_message = ChatMessage::user(message);
            state.chat.push(user_message.clone());
            (state.plan.clone(), user_message)
        };

        let system_prompt = build_chat_system_prompt(&plan_clone);
        let reply = self
            .generator
            .generate(&system_prompt, message, self.limits.generator_deadline)
            .await;
        let content = match reply {
            Ok(content) => content,
            Err(err) => {
                self.logger.warn(
                    "Chat model call failed; replying with plan summary",
                    Some(&serde_json::json!({"error": err.code})),
                );
                fallback_chat_reply(&plan_clone)
            }
        };

        let ai_message = ChatMessage::assistant(content);
        {
            let mut state = entry.state.lock().await;
            state.chat.push(ai_message.clone());
        }
        self.audit.append(
            AuditRecord::new(user_id, AuditAction::ChatMessage, AuditOutcome::Ok)
                .session(&plan_clone.session_id)
                .plan(plan_id),
        );
        Ok(ChatExchange {
            user_message,
            ai_message,
        })
    }
}

fn client_failure_result(stderr: &str) -> CommandResult {
    let now = Utc::now();
    CommandResult {
        exit_code: EXIT_CLIENT_FAILURE,
        stdout: String::new(),
        stderr: stderr.to_string(),
        duration_ms: 0,
        started_at: now,
        finished_at: now,
        stdout_truncated: false,
        stderr_truncated: false,
    }
}

fn fallback_chat_reply(plan: &Plan) -> String {
    format!(
        "This plan addresses \"{}\" with {} step(s) at {} overall risk: {}",
        plan.request_text,
        plan.steps.len(),
        plan.overall_risk.as_str(),
        plan.explanation,
    )
}
