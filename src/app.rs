use crate::config::Config;
use crate::errors::CoreError;
use crate::managers::generator::{HttpPlanGenerator, PlanGenerator};
use crate::managers::orchestrator::{
    ChatExchange, Orchestrator, PlanSnapshot, RespondAllSummary,
};
use crate::managers::profiler::HostProfiler;
use crate::managers::sessions::{Credential, SessionRegistry, SessionSnapshot, SessionStatus};
use crate::managers::ssh::{ShellConnector, SshConnector};
use crate::plan::StepOutcome;
use crate::services::audit::AuditSink;
use crate::services::logger::Logger;
use crate::services::vault::CredentialVault;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub session_id: String,
    pub status: SessionStatus,
}

/// The assembled control plane core. One instance per process; the HTTP
/// adapter translates its endpoints onto these operations one-to-one, every
/// call scoped by the opaque `user_id` it supplies.
pub struct App {
    logger: Logger,
    registry: Arc<SessionRegistry>,
    orchestrator: Arc<Orchestrator>,
    reaper: Option<tokio::task::JoinHandle<()>>,
}

impl App {
    /// Production wiring: real SSH connector, HTTP model client, background
    /// heartbeat reaper.
    pub fn initialize(config: Config, audit: Arc<dyn AuditSink>) -> Result<Self, CoreError> {
        let logger = Logger::new("opsgate");
        let connector = Arc::new(SshConnector::new(
            logger.clone(),
            config.limits.capture_limit_bytes,
        ));
        let generator = Arc::new(HttpPlanGenerator::new(logger.clone(), config.model.clone()));
        let mut app = Self::with_collaborators(config, audit, connector, generator)?;
        app.reaper = Some(app.registry.start_reaper());
        Ok(app)
    }

    /// Wiring with injected transport and model collaborators. No background
    /// reaper is started; drive `registry().sweep()` explicitly if needed.
    pub fn with_collaborators(
        config: Config,
        audit: Arc<dyn AuditSink>,
        connector: Arc<dyn ShellConnector>,
        generator: Arc<dyn PlanGenerator>,
    ) -> Result<Self, CoreError> {
        let logger = Logger::new("opsgate");
        let vault = Arc::new(CredentialVault::new(config.vault_key.as_deref(), &logger)?);
        let profiler = Arc::new(HostProfiler::new(logger.clone(), config.limits.probe_deadline));
        let registry = Arc::new(SessionRegistry::new(
            logger.clone(),
            audit.clone(),
            vault,
            connector,
            profiler,
            config.limits.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            logger.clone(),
            audit,
            registry.clone(),
            generator,
            config.limits.clone(),
        ));
        Ok(Self {
            logger,
            registry,
            orchestrator,
            reaper: None,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn connect(
        &self,
        user_id: &str,
        hostname: &str,
        port: Option<u16>,
        username: &str,
        credential: Credential,
    ) -> Result<ConnectOutcome, CoreError> {
        let session = self
            .registry
            .connect(user_id, hostname, port, username, credential)
            .await?;
        Ok(ConnectOutcome {
            session_id: session.session_id.clone(),
            status: session.status(),
        })
    }

    /// Disconnect one session, or every session of the user when no id is
    /// given. Idempotent either way.
    pub async fn disconnect(&self, user_id: &str, session_id: Option<&str>) {
        match session_id {
            Some(session_id) => self.registry.disconnect(user_id, session_id),
            None => {
                self.registry.terminate_user(user_id);
            }
        }
    }

    pub fn status(&self, user_id: &str) -> BTreeMap<String, SessionSnapshot> {
        self.registry
            .list(user_id)
            .into_iter()
            .map(|session| (session.session_id.clone(), session.snapshot()))
            .collect()
    }

    pub async fn submit(
        &self,
        user_id: &str,
        session_id: &str,
        request_text: &str,
        priority: Option<&str>,
    ) -> Result<PlanSnapshot, CoreError> {
        self.orchestrator
            .submit(user_id, session_id, request_text, priority)
            .await
    }

    pub async fn get_plan(&self, user_id: &str, plan_id: &str) -> Result<PlanSnapshot, CoreError> {
        self.orchestrator.get_plan(user_id, plan_id).await
    }

    pub async fn list_plans(&self, user_id: &str) -> Vec<PlanSnapshot> {
        self.orchestrator.list_plans(user_id).await
    }

    pub async fn respond(
        &self,
        user_id: &str,
        plan_id: &str,
        step_index: usize,
        approved: bool,
        reason: Option<String>,
    ) -> Result<StepOutcome, CoreError> {
        self.orchestrator
            .respond(user_id, plan_id, step_index, approved, reason)
            .await
    }

    pub async fn respond_all(
        &self,
        user_id: &str,
        plan_id: &str,
        approved: bool,
    ) -> Result<RespondAllSummary, CoreError> {
        self.orchestrator
            .respond_all(user_id, plan_id, approved)
            .await
    }

    pub async fn chat(
        &self,
        user_id: &str,
        plan_id: &str,
        message: &str,
    ) -> Result<ChatExchange, CoreError> {
        self.orchestrator.chat(user_id, plan_id, message).await
    }

    /// Client-departure beacon: synchronously reaps every session the user
    /// holds. A running step observes the transport teardown and fails.
    pub async fn beacon_leave(&self, user_id: &str) {
        let reaped = self.registry.terminate_user(user_id);
        self.logger.info(
            "Departure beacon handled",
            Some(&serde_json::json!({"user_id": user_id, "sessions": reaped})),
        );
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}
