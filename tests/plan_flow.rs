use opsgate::errors::{CoreError, CoreErrorKind};
use opsgate::plan::{PlanStatus, Risk, StepState};
use opsgate::services::audit::{AuditAction, AuditOutcome};

mod common;
use common::{connect_session, harness, plan_reply, FakeShell};

#[tokio::test]
async fn happy_path_runs_every_approved_step_in_order() {
    let h = harness();
    let shell = FakeShell::new();
    let session_id = connect_session(&h, shell.clone()).await;

    h.generator.enqueue(Ok(plan_reply(&[
        "apt-get update",
        "apt-get install -y nginx",
        "systemctl enable --now nginx",
        "systemctl status nginx --no-pager",
    ])));
    let plan = h
        .app
        .submit("user-1", &session_id, "install nginx and start it", None)
        .await
        .expect("plan");
    assert_eq!(plan.plan.steps.len(), 4);
    assert_eq!(plan.status, PlanStatus::InProgress);
    assert_eq!(plan.plan.overall_risk, Risk::Low);

    for index in 0..4 {
        let outcome = h
            .app
            .respond("user-1", &plan.plan.plan_id, index, true, None)
            .await
            .expect("respond");
        assert_eq!(outcome.state, StepState::Succeeded);
        assert_eq!(outcome.result.as_ref().expect("result").exit_code, 0);
    }

    let resolved = h
        .app
        .get_plan("user-1", &plan.plan.plan_id)
        .await
        .expect("snapshot");
    assert_eq!(resolved.status, PlanStatus::Succeeded);

    // The shell saw the plan's commands, in order, after the connect probe.
    let commands = shell.commands_seen();
    let plan_commands: Vec<&str> = commands
        .iter()
        .map(String::as_str)
        .filter(|cmd| cmd.starts_with("apt-get") || cmd.starts_with("systemctl"))
        .collect();
    assert_eq!(
        plan_commands,
        vec![
            "apt-get update",
            "apt-get install -y nginx",
            "systemctl enable --now nginx",
            "systemctl status nginx --no-pager",
        ]
    );

    let step_results: Vec<AuditOutcome> = h
        .audit
        .records()
        .into_iter()
        .filter(|record| record.action == AuditAction::StepResult)
        .map(|record| record.outcome)
        .collect();
    assert_eq!(step_results, vec![AuditOutcome::Ok; 4]);
    let resolved_record = h
        .audit
        .records()
        .into_iter()
        .find(|record| record.action == AuditAction::PlanResolved)
        .expect("plan.resolved");
    assert_eq!(resolved_record.outcome, AuditOutcome::Ok);
}

#[tokio::test]
async fn out_of_order_approval_is_rejected_without_side_effects() {
    let h = harness();
    let session_id = connect_session(&h, FakeShell::new()).await;
    h.generator
        .enqueue(Ok(plan_reply(&["step-a", "step-b", "step-c"])));
    let plan = h
        .app
        .submit("user-1", &session_id, "three steps", None)
        .await
        .expect("plan");

    let err = h
        .app
        .respond("user-1", &plan.plan.plan_id, 1, true, None)
        .await
        .expect_err("out of order");
    assert_eq!(err.kind, CoreErrorKind::OutOfOrder);

    let snapshot = h
        .app
        .get_plan("user-1", &plan.plan.plan_id)
        .await
        .expect("snapshot");
    assert!(snapshot
        .plan
        .steps
        .iter()
        .all(|step| step.state == StepState::Pending));
}

#[tokio::test]
async fn mid_plan_failure_cascades_and_audits_in_order() {
    let h = harness();
    let shell = FakeShell::new();
    shell.respond_with("step-b", 2, "", "boom");
    let session_id = connect_session(&h, shell).await;
    h.generator
        .enqueue(Ok(plan_reply(&["step-a", "step-b", "step-c"])));
    let plan = h
        .app
        .submit("user-1", &session_id, "three steps", None)
        .await
        .expect("plan");

    h.app
        .respond("user-1", &plan.plan.plan_id, 0, true, None)
        .await
        .expect("step 0");
    let outcome = h
        .app
        .respond("user-1", &plan.plan.plan_id, 1, true, None)
        .await
        .expect("step 1 responds");
    assert_eq!(outcome.state, StepState::Failed);

    let snapshot = h
        .app
        .get_plan("user-1", &plan.plan.plan_id)
        .await
        .expect("snapshot");
    assert_eq!(snapshot.status, PlanStatus::Failed);
    assert_eq!(snapshot.plan.steps[2].state, StepState::Skipped);
    assert_eq!(
        snapshot.plan.steps[2].skip_reason.as_deref(),
        Some("preceding-step-failed")
    );

    let plan_actions: Vec<AuditAction> = h
        .audit
        .records()
        .into_iter()
        .filter(|record| record.plan_id.as_deref() == Some(plan.plan.plan_id.as_str()))
        .map(|record| record.action)
        .collect();
    assert_eq!(
        plan_actions,
        vec![
            AuditAction::PlanSubmitted,
            AuditAction::StepApproved,
            AuditAction::StepExecuting,
            AuditAction::StepResult,
            AuditAction::StepApproved,
            AuditAction::StepExecuting,
            AuditAction::StepResult,
            AuditAction::StepSkipped,
            AuditAction::PlanResolved,
        ]
    );
}

#[tokio::test]
async fn rejection_skips_the_rest_and_resolves_failed() {
    let h = harness();
    let session_id = connect_session(&h, FakeShell::new()).await;
    h.generator
        .enqueue(Ok(plan_reply(&["step-a", "step-b", "step-c"])));
    let plan = h
        .app
        .submit("user-1", &session_id, "three steps", None)
        .await
        .expect("plan");

    let outcome = h
        .app
        .respond(
            "user-1",
            &plan.plan.plan_id,
            0,
            false,
            Some("too risky".to_string()),
        )
        .await
        .expect("reject");
    assert_eq!(outcome.state, StepState::Rejected);
    assert_eq!(outcome.plan_status, PlanStatus::Failed);

    let snapshot = h
        .app
        .get_plan("user-1", &plan.plan.plan_id)
        .await
        .expect("snapshot");
    assert!(snapshot.plan.steps[1..]
        .iter()
        .all(|step| step.state == StepState::Skipped));
}

#[tokio::test]
async fn stale_respond_is_an_idempotent_no_op() {
    let h = harness();
    let session_id = connect_session(&h, FakeShell::new()).await;
    h.generator.enqueue(Ok(plan_reply(&["step-a"])));
    let plan = h
        .app
        .submit("user-1", &session_id, "one step", None)
        .await
        .expect("plan");

    h.app
        .respond("user-1", &plan.plan.plan_id, 0, true, None)
        .await
        .expect("first respond");
    let audits_before = h.audit.records().len();

    // Respond again, now rejecting: the resolved plan reports current state.
    let outcome = h
        .app
        .respond("user-1", &plan.plan.plan_id, 0, false, None)
        .await
        .expect("stale respond");
    assert_eq!(outcome.state, StepState::Succeeded);
    assert_eq!(outcome.plan_status, PlanStatus::Succeeded);
    assert_eq!(h.audit.records().len(), audits_before);
}

#[tokio::test]
async fn respond_all_approves_in_order_and_summarizes() {
    let h = harness();
    let session_id = connect_session(&h, FakeShell::new()).await;
    h.generator
        .enqueue(Ok(plan_reply(&["step-a", "step-b", "step-c"])));
    let plan = h
        .app
        .submit("user-1", &session_id, "three steps", None)
        .await
        .expect("plan");

    let summary = h
        .app
        .respond_all("user-1", &plan.plan.plan_id, true)
        .await
        .expect("summary");
    assert_eq!(summary.responded, 3);
    assert_eq!(summary.status, PlanStatus::Succeeded);
    assert!(summary
        .outcomes
        .iter()
        .all(|outcome| outcome.state == StepState::Succeeded));
}

#[tokio::test]
async fn respond_all_short_circuits_on_failure() {
    let h = harness();
    let shell = FakeShell::new();
    shell.respond_with("step-b", 1, "", "nope");
    let session_id = connect_session(&h, shell).await;
    h.generator
        .enqueue(Ok(plan_reply(&["step-a", "step-b", "step-c"])));
    let plan = h
        .app
        .submit("user-1", &session_id, "three steps", None)
        .await
        .expect("plan");

    let summary = h
        .app
        .respond_all("user-1", &plan.plan.plan_id, true)
        .await
        .expect("summary");
    assert_eq!(summary.responded, 2);
    assert_eq!(summary.status, PlanStatus::Failed);
    assert_eq!(summary.outcomes[1].state, StepState::Failed);
}

#[tokio::test]
async fn second_unresolved_plan_per_session_is_busy() {
    let h = harness();
    let session_id = connect_session(&h, FakeShell::new()).await;
    h.generator.enqueue(Ok(plan_reply(&["step-a"])));
    let first = h
        .app
        .submit("user-1", &session_id, "first request", None)
        .await
        .expect("plan");

    let err = h
        .app
        .submit("user-1", &session_id, "second request", None)
        .await
        .expect_err("busy");
    assert_eq!(err.kind, CoreErrorKind::SessionBusy);

    // Resolving the first plan frees the slot.
    h.app
        .respond_all("user-1", &first.plan.plan_id, true)
        .await
        .expect("resolve");
    h.generator.enqueue(Ok(plan_reply(&["step-a"])));
    h.app
        .submit("user-1", &session_id, "third request", None)
        .await
        .expect("slot freed");
}

#[tokio::test]
async fn generation_failures_surface_and_audit() {
    let h = harness();
    let session_id = connect_session(&h, FakeShell::new()).await;

    h.generator
        .enqueue(Err(CoreError::model_timeout("deadline")));
    let err = h
        .app
        .submit("user-1", &session_id, "anything", None)
        .await
        .expect_err("timeout");
    assert_eq!(err.kind, CoreErrorKind::ModelTimeout);

    h.generator.enqueue(Ok("complete nonsense".to_string()));
    let err = h
        .app
        .submit("user-1", &session_id, "anything", None)
        .await
        .expect_err("parse failure");
    assert_eq!(err.kind, CoreErrorKind::ParseFailure);

    // A refusal: empty steps with an explicit explanation.
    h.generator.enqueue(Ok(serde_json::json!({
        "intent": "general_help",
        "action": "none",
        "risk_level": "low",
        "explanation": "Refusing to disable the firewall.",
        "steps": [],
    })
    .to_string()));
    let err = h
        .app
        .submit("user-1", &session_id, "disable the firewall", None)
        .await
        .expect_err("refusal");
    assert_eq!(err.kind, CoreErrorKind::ModelRefusal);

    // Zero steps with no explanation is a validation failure, never an
    // empty-success plan.
    h.generator.enqueue(Ok(serde_json::json!({
        "intent": "x",
        "action": "y",
        "risk_level": "low",
        "explanation": "",
        "steps": [],
    })
    .to_string()));
    let err = h
        .app
        .submit("user-1", &session_id, "anything", None)
        .await
        .expect_err("empty plan");
    assert_eq!(err.kind, CoreErrorKind::ValidationFailure);

    let failures = h
        .audit
        .actions()
        .into_iter()
        .filter(|action| *action == AuditAction::PlanGenerationFailed)
        .count();
    assert_eq!(failures, 4);

    // Failed generations never hold the session's in-flight slot.
    h.generator.enqueue(Ok(plan_reply(&["uptime"])));
    h.app
        .submit("user-1", &session_id, "works now", None)
        .await
        .expect("slot free after failures");
}

#[tokio::test]
async fn unknown_plan_is_not_found() {
    let h = harness();
    let err = h
        .app
        .get_plan("user-1", "missing")
        .await
        .expect_err("not found");
    assert_eq!(err.kind, CoreErrorKind::NotFound);
    let err = h
        .app
        .respond("user-1", "missing", 0, true, None)
        .await
        .expect_err("not found");
    assert_eq!(err.kind, CoreErrorKind::NotFound);
}
