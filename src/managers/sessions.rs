use crate::config::Limits;
use crate::errors::CoreError;
use crate::managers::profiler::{HostProfile, HostProfiler};
use crate::managers::ssh::{ConnectTarget, RemoteShell, ShellConnector};
use crate::services::audit::{AuditAction, AuditOutcome, AuditRecord, AuditSink};
use crate::services::logger::Logger;
use crate::services::validation::Validation;
use crate::services::vault::{self, CredentialVault};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Degraded,
    Closed,
}

impl SessionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionStatus::Connecting,
            1 => SessionStatus::Connected,
            2 => SessionStatus::Degraded,
            _ => SessionStatus::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Degraded => "degraded",
            SessionStatus::Closed => "closed",
        }
    }
}

/// Credential supplied to `connect`: either raw material from the adapter or
/// a blob previously sealed by the vault.
pub enum Credential {
    Raw(String),
    Sealed(Vec<u8>),
}

/// Live session owned by the registry. Hot fields are atomics so readers
/// never contend with the session map.
pub struct Session {
    pub user_id: String,
    pub session_id: String,
    pub hostname: String,
    pub username: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    shell: Arc<dyn RemoteShell>,
    sealed_credentials: Mutex<Vec<u8>>,
    status: AtomicU8,
    last_activity_ms: AtomicI64,
    last_heartbeat_ms: AtomicI64,
    heartbeat_failures: AtomicU32,
    cached_profile: Mutex<Option<Arc<HostProfile>>>,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// `Closed` is terminal; later transitions are ignored.
    pub fn set_status(&self, status: SessionStatus) {
        let _ = self
            .status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current == SessionStatus::Closed as u8 {
                    None
                } else {
                    Some(status as u8)
                }
            });
    }

    pub fn shell(&self) -> Arc<dyn RemoteShell> {
        self.shell.clone()
    }

    /// Strictly increases on every successful execution.
    pub fn mark_activity(&self) {
        let now = Utc::now().timestamp_millis();
        let _ = self
            .last_activity_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            });
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::SeqCst)
    }

    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::SeqCst)
    }

    pub fn idle_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_activity_ms()
    }

    fn record_heartbeat(&self, ok: bool) -> u32 {
        if ok {
            self.last_heartbeat_ms
                .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            self.heartbeat_failures.store(0, Ordering::SeqCst);
            if self.status() == SessionStatus::Degraded {
                self.set_status(SessionStatus::Connected);
            }
            0
        } else {
            self.heartbeat_failures.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    pub fn cached_profile(&self) -> Option<Arc<HostProfile>> {
        self.cached_profile
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn store_profile(&self, profile: Arc<HostProfile>) {
        *self
            .cached_profile
            .lock()
            .unwrap_or_else(|err| err.into_inner()) = Some(profile);
    }

    fn scrub_credentials(&self) {
        let mut sealed = self
            .sealed_credentials
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        vault::zero(&mut sealed);
        sealed.clear();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status();
        SessionSnapshot {
            session_id: self.session_id.clone(),
            hostname: self.hostname.clone(),
            username: self.username.clone(),
            port: self.port,
            status,
            alive: status == SessionStatus::Connected && !self.shell.is_closed(),
            connected_at: self.created_at,
            last_activity_at: DateTime::from_timestamp_millis(self.last_activity_ms())
                .unwrap_or(self.created_at),
            last_heartbeat_at: DateTime::from_timestamp_millis(self.last_heartbeat_ms())
                .unwrap_or(self.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub hostname: String,
    pub username: String,
    pub port: u16,
    pub status: SessionStatus,
    pub alive: bool,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Per-user map of live sessions: liveness probing, idle eviction, reaping
/// on disconnect or departure beacon. The registry is the single writer for
/// session lifecycle.
pub struct SessionRegistry {
    logger: Logger,
    audit: Arc<dyn AuditSink>,
    vault: Arc<CredentialVault>,
    connector: Arc<dyn ShellConnector>,
    profiler: Arc<HostProfiler>,
    validation: Validation,
    limits: Limits,
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new(
        logger: Logger,
        audit: Arc<dyn AuditSink>,
        vault: Arc<CredentialVault>,
        connector: Arc<dyn ShellConnector>,
        profiler: Arc<HostProfiler>,
        limits: Limits,
    ) -> Self {
        Self {
            logger: logger.child("sessions"),
            audit,
            vault,
            connector,
            profiler,
            validation: Validation::new(),
            limits,
            sessions: DashMap::new(),
        }
    }

    pub async fn connect(
        &self,
        user_id: &str,
        hostname: &str,
        port: Option<u16>,
        username: &str,
        credential: Credential,
    ) -> Result<Arc<Session>, CoreError> {
        let user_id = self.validation.ensure_identifier(user_id, "user_id")?;
        let hostname = self.validation.ensure_hostname(hostname)?;
        let username = self.validation.ensure_identifier(username, "username")?;
        let port = self.validation.ensure_port(port)?;

        let open = self.count_for_user(&user_id);
        if open >= self.limits.max_sessions_per_user {
            return Err(CoreError::connect("Per-user session limit reached")
                .with_details(serde_json::json!({
                    "open_sessions": open,
                    "max_sessions_per_user": self.limits.max_sessions_per_user,
                })));
        }

        let mut plaintext = match credential {
            Credential::Raw(raw) => raw.into_bytes(),
            Credential::Sealed(sealed) => match self.vault.unseal(&sealed) {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    self.audit.append(
                        AuditRecord::new(&user_id, AuditAction::SessionConnect, AuditOutcome::Failed)
                            .detail(serde_json::json!({
                                "hostname": hostname,
                                "error": err.code,
                            })),
                    );
                    return Err(CoreError::auth_failure("Credential failed integrity check")
                        .with_details(serde_json::json!({"cause": err.code})));
                }
            },
        };

        let target = ConnectTarget {
            hostname: hostname.clone(),
            port,
            username: username.clone(),
        };
        let connector = self.connector.clone();
        let deadline = self.limits.connect_deadline;
        let open_plaintext = plaintext.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let result = connector.open(&target, &open_plaintext, deadline);
            let mut scrub = open_plaintext;
            vault::zero(&mut scrub);
            result
        })
        .await
        .map_err(|_| CoreError::internal("SSH connect task failed"))?;

        let shell = match opened {
            Ok(shell) => shell,
            Err(err) => {
                vault::zero(&mut plaintext);
                self.audit.append(
                    AuditRecord::new(&user_id, AuditAction::SessionConnect, AuditOutcome::Failed)
                        .detail(serde_json::json!({
                            "hostname": hostname,
                            "error": err.code,
                        })),
                );
                return Err(err);
            }
        };

        let sealed = self.vault.seal(&plaintext);
        vault::zero(&mut plaintext);
        let sealed = sealed?;

        let now = Utc::now();
        let session = Arc::new(Session {
            user_id: user_id.clone(),
            session_id: uuid::Uuid::new_v4().to_string(),
            hostname,
            username,
            port,
            created_at: now,
            shell,
            sealed_credentials: Mutex::new(sealed),
            status: AtomicU8::new(SessionStatus::Connected as u8),
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            last_heartbeat_ms: AtomicI64::new(now.timestamp_millis()),
            heartbeat_failures: AtomicU32::new(0),
            cached_profile: Mutex::new(None),
        });
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        self.audit.append(
            AuditRecord::new(&user_id, AuditAction::SessionConnect, AuditOutcome::Ok)
                .session(&session.session_id)
                .detail(serde_json::json!({
                    "hostname": session.hostname,
                    "port": session.port,
                })),
        );
        self.logger.info(
            "Session connected",
            Some(&serde_json::json!({
                "session_id": session.session_id,
                "hostname": session.hostname,
            })),
        );
        Ok(session)
    }

    fn count_for_user(&self, user_id: &str) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .count()
    }

    pub fn lookup(&self, user_id: &str, session_id: &str) -> Result<Arc<Session>, CoreError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .filter(|session| session.user_id == user_id)
            .ok_or_else(|| CoreError::not_found("Session not found"))
    }

    pub fn list(&self, user_id: &str) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Idempotent: a second disconnect of the same id is a no-op.
    pub fn disconnect(&self, user_id: &str, session_id: &str) {
        let removed = self
            .sessions
            .remove_if(session_id, |_, session| session.user_id == user_id);
        if let Some((_, session)) = removed {
            self.teardown(&session, AuditAction::SessionDisconnect, None);
        }
    }

    /// Disconnects every session for the user; each is torn down exactly
    /// once even under repeated beacons.
    pub fn terminate_user(&self, user_id: &str) -> usize {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.key().clone())
            .collect();
        let mut reaped = 0;
        for session_id in ids {
            if let Some((_, session)) = self
                .sessions
                .remove_if(&session_id, |_, session| session.user_id == user_id)
            {
                self.teardown(&session, AuditAction::SessionDisconnect, Some("beacon_leave"));
                reaped += 1;
            }
        }
        reaped
    }

    fn teardown(&self, session: &Arc<Session>, action: AuditAction, reason: Option<&str>) {
        session.shell.close();
        session.set_status(SessionStatus::Closed);
        session.scrub_credentials();
        let detail = match reason {
            Some(reason) => serde_json::json!({"reason": reason}),
            None => serde_json::Value::Null,
        };
        self.audit.append(
            AuditRecord::new(&session.user_id, action, AuditOutcome::Ok)
                .session(&session.session_id)
                .detail(detail),
        );
    }

    /// Memoized host profile for a session; built once per session lifetime.
    pub async fn profile(&self, session: &Arc<Session>) -> Arc<HostProfile> {
        if let Some(profile) = session.cached_profile() {
            return profile;
        }
        let profiler = self.profiler.clone();
        let shell = session.shell();
        let profile = tokio::task::spawn_blocking(move || profiler.profile(shell.as_ref()))
            .await
            .map(Arc::new)
            .unwrap_or_else(|_| Arc::new(HostProfile::default()));
        session.store_profile(profile.clone());
        profile
    }

    /// One heartbeat-and-eviction pass over every session. Two consecutive
    /// failed probes close a session; a degraded session closes on its next
    /// failed probe; idle sessions are evicted.
    pub async fn sweep(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            if session.shell.is_closed() || session.status() == SessionStatus::Closed {
                self.evict(&session, "transport closed");
                continue;
            }
            if session.idle_ms() > self.limits.idle_timeout.as_millis() as i64 {
                self.evict(&session, "idle timeout");
                continue;
            }
            let shell = session.shell();
            let deadline = self.limits.heartbeat_deadline;
            let ok = tokio::task::spawn_blocking(move || shell.heartbeat(deadline))
                .await
                .unwrap_or(false);
            if ok {
                session.record_heartbeat(true);
                continue;
            }
            let was_degraded = session.status() == SessionStatus::Degraded;
            let failures = session.record_heartbeat(false);
            self.audit.append(
                AuditRecord::new(
                    &session.user_id,
                    AuditAction::SessionHeartbeatFailed,
                    AuditOutcome::Degraded,
                )
                .session(&session.session_id)
                .detail(serde_json::json!({"consecutive_failures": failures})),
            );
            if failures >= self.limits.heartbeat_failure_threshold || was_degraded {
                self.evict(&session, "heartbeat failures");
            }
        }
    }

    fn evict(&self, session: &Arc<Session>, reason: &str) {
        if self.sessions.remove(&session.session_id).is_none() {
            return;
        }
        session.shell.close();
        session.set_status(SessionStatus::Closed);
        session.scrub_credentials();
        self.audit.append(
            AuditRecord::new(
                &session.user_id,
                AuditAction::SessionEvicted,
                AuditOutcome::Ok,
            )
            .session(&session.session_id)
            .detail(serde_json::json!({"reason": reason})),
        );
        self.logger.info(
            "Session evicted",
            Some(&serde_json::json!({
                "session_id": session.session_id,
                "reason": reason,
            })),
        );
    }

    /// Background probe loop; runs until the handle is aborted.
    pub fn start_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let interval = registry.limits.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                registry.sweep().await;
            }
        })
    }
}
