use opsgate::errors::{CoreError, CoreErrorKind};
use opsgate::managers::sessions::{Credential, SessionStatus};
use opsgate::services::audit::AuditAction;
use opsgate::services::logger::Logger;
use opsgate::services::vault::CredentialVault;

mod common;
use common::{connect_session, harness, FakeShell};

#[tokio::test]
async fn connect_stores_session_and_audits() {
    let h = harness();
    let session_id = connect_session(&h, FakeShell::new()).await;

    let status = h.app.status("user-1");
    let snapshot = status.get(&session_id).expect("session listed");
    assert_eq!(snapshot.hostname, "host.example");
    assert_eq!(snapshot.port, 22);
    assert_eq!(snapshot.status, SessionStatus::Connected);
    assert!(snapshot.alive);

    assert_eq!(h.audit.actions(), vec![AuditAction::SessionConnect]);
}

#[tokio::test]
async fn sessions_are_scoped_by_user() {
    let h = harness();
    let session_id = connect_session(&h, FakeShell::new()).await;
    assert!(h.app.status("someone-else").is_empty());
    let err = h
        .app
        .submit("someone-else", &session_id, "install nginx", None)
        .await
        .expect_err("foreign session");
    assert_eq!(err.kind, CoreErrorKind::SessionUnavailable);
}

#[tokio::test]
async fn connect_failure_audits_and_creates_nothing() {
    let h = harness();
    h.connector.fail_next(CoreError::auth_failure("bad password"));
    let err = h
        .app
        .connect(
            "user-1",
            "host.example",
            None,
            "ops",
            Credential::Raw("wrong".to_string()),
        )
        .await
        .expect_err("auth should fail");
    assert_eq!(err.kind, CoreErrorKind::AuthFailure);
    assert!(h.app.status("user-1").is_empty());

    let records = h.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, AuditAction::SessionConnect);
    assert_eq!(
        serde_json::to_value(records[0].outcome).unwrap(),
        "failed"
    );
}

#[tokio::test]
async fn tampered_sealed_credential_fails_auth_without_a_session() {
    let h = harness();
    let logger = Logger::new("test");
    let vault = CredentialVault::new(Some(&"0".repeat(64)), &logger).expect("vault");
    let mut sealed = vault.seal(b"swordfish").expect("seal");
    sealed[8] ^= 0x01;

    let err = h
        .app
        .connect(
            "user-1",
            "host.example",
            None,
            "ops",
            Credential::Sealed(sealed),
        )
        .await
        .expect_err("tampered blob");
    assert_eq!(err.kind, CoreErrorKind::AuthFailure);
    assert!(h.app.status("user-1").is_empty());

    let records = h.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, AuditAction::SessionConnect);
    assert_eq!(serde_json::to_value(records[0].outcome).unwrap(), "failed");
}

#[tokio::test]
async fn sealed_credential_round_trips_through_connect() {
    let h = harness();
    // Same key material as the harness config, so the blob unseals.
    let logger = Logger::new("test");
    let vault = CredentialVault::new(Some(&"0".repeat(64)), &logger).expect("vault");
    let sealed = vault.seal(b"swordfish").expect("seal");

    h.connector.enqueue(FakeShell::new());
    let outcome = h
        .app
        .connect(
            "user-1",
            "host.example",
            Some(2222),
            "ops",
            Credential::Sealed(sealed),
        )
        .await
        .expect("connect");
    assert_eq!(outcome.status, SessionStatus::Connected);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let h = harness();
    let session_id = connect_session(&h, FakeShell::new()).await;

    h.app.disconnect("user-1", Some(&session_id)).await;
    h.app.disconnect("user-1", Some(&session_id)).await;

    assert!(h.app.status("user-1").is_empty());
    let disconnects = h
        .audit
        .actions()
        .into_iter()
        .filter(|action| *action == AuditAction::SessionDisconnect)
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn repeated_beacons_reap_each_session_once() {
    let h = harness();
    connect_session(&h, FakeShell::new()).await;
    h.connector.enqueue(FakeShell::new());
    h.app
        .connect(
            "user-1",
            "other.example",
            None,
            "ops",
            Credential::Raw("swordfish".to_string()),
        )
        .await
        .expect("second session");

    h.app.beacon_leave("user-1").await;
    h.app.beacon_leave("user-1").await;

    assert!(h.app.status("user-1").is_empty());
    let disconnects = h
        .audit
        .actions()
        .into_iter()
        .filter(|action| *action == AuditAction::SessionDisconnect)
        .count();
    assert_eq!(disconnects, 2);
}

#[tokio::test]
async fn per_user_session_cap_is_enforced() {
    let h = harness();
    for _ in 0..8 {
        h.connector.enqueue(FakeShell::new());
        h.app
            .connect(
                "user-1",
                "host.example",
                None,
                "ops",
                Credential::Raw("swordfish".to_string()),
            )
            .await
            .expect("session under cap");
    }
    let err = h
        .app
        .connect(
            "user-1",
            "host.example",
            None,
            "ops",
            Credential::Raw("swordfish".to_string()),
        )
        .await
        .expect_err("cap breach");
    assert_eq!(err.kind, CoreErrorKind::Connect);
}

#[tokio::test]
async fn idle_sessions_are_evicted() {
    let audit = std::sync::Arc::new(opsgate::services::audit::MemoryAuditSink::new());
    let connector = common::FakeConnector::new();
    let generator = common::ScriptedGenerator::new();
    let mut config = common::test_config();
    config.limits.idle_timeout = std::time::Duration::from_millis(1);
    let app = opsgate::App::with_collaborators(
        config,
        audit.clone(),
        connector.clone(),
        generator,
    )
    .expect("app wiring");

    connector.enqueue(FakeShell::new());
    app.connect(
        "user-1",
        "host.example",
        None,
        "ops",
        Credential::Raw("swordfish".to_string()),
    )
    .await
    .expect("connect");

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    app.registry().sweep().await;

    assert!(app.status("user-1").is_empty());
    assert!(audit.actions().contains(&AuditAction::SessionEvicted));
}

#[tokio::test]
async fn eviction_requires_two_consecutive_heartbeat_failures() {
    let h = harness();
    let shell = FakeShell::new();
    // fail, recover, fail, fail
    shell.script_heartbeats(&[false, true, false, false]);
    let session_id = connect_session(&h, shell).await;
    let registry = h.app.registry().clone();

    registry.sweep().await; // one failure
    assert!(h.app.status("user-1").contains_key(&session_id));
    registry.sweep().await; // success resets the counter
    assert!(h.app.status("user-1").contains_key(&session_id));
    registry.sweep().await; // first of two consecutive failures
    assert!(h.app.status("user-1").contains_key(&session_id));
    registry.sweep().await; // second consecutive failure evicts
    assert!(h.app.status("user-1").is_empty());

    let actions = h.audit.actions();
    let heartbeat_failures = actions
        .iter()
        .filter(|action| **action == AuditAction::SessionHeartbeatFailed)
        .count();
    assert_eq!(heartbeat_failures, 3);
    assert!(actions.contains(&AuditAction::SessionEvicted));
}
