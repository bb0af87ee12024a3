#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use opsgate::config::{Config, Limits, ModelConfig};
use opsgate::errors::CoreError;
use opsgate::managers::generator::PlanGenerator;
use opsgate::managers::ssh::{
    CommandResult, ConnectTarget, RemoteShell, ShellConnector, EXIT_CLIENT_FAILURE,
};
use opsgate::services::audit::MemoryAuditSink;
use opsgate::App;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_config() -> Config {
    Config {
        vault_key: Some("0".repeat(64)),
        model: ModelConfig {
            endpoint: "http://model.invalid".to_string(),
            api_key: String::new(),
            model: "scripted".to_string(),
        },
        limits: Limits::default(),
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Scripted stand-in for a live shell. Commands answer with programmed
/// results (default exit 0); designated commands block until the shell is
/// closed, mimicking a long-running remote process.
pub struct FakeShell {
    closed: AtomicBool,
    commands_seen: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, ScriptedRun>>,
    heartbeats: Mutex<VecDeque<bool>>,
    hanging: Mutex<HashSet<String>>,
}

impl FakeShell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            commands_seen: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(VecDeque::new()),
            hanging: Mutex::new(HashSet::new()),
        })
    }

    pub fn respond_with(&self, command: &str, exit_code: i64, stdout: &str, stderr: &str) {
        self.responses.lock().unwrap().insert(
            command.to_string(),
            ScriptedRun {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
    }

    /// The next heartbeats answer with this sequence, then default to true.
    pub fn script_heartbeats(&self, sequence: &[bool]) {
        let mut heartbeats = self.heartbeats.lock().unwrap();
        heartbeats.extend(sequence.iter().copied());
    }

    pub fn hang_on(&self, command: &str) {
        self.hanging.lock().unwrap().insert(command.to_string());
    }

    pub fn commands_seen(&self) -> Vec<String> {
        self.commands_seen.lock().unwrap().clone()
    }
}

impl RemoteShell for FakeShell {
    fn run(&self, command: &str, _deadline: Duration) -> Result<CommandResult, CoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::session_closed("SSH session is closed"));
        }
        self.commands_seen.lock().unwrap().push(command.to_string());
        if self.hanging.lock().unwrap().contains(command) {
            while !self.closed.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            let now = Utc::now();
            return Ok(CommandResult {
                exit_code: EXIT_CLIENT_FAILURE,
                stdout: String::new(),
                stderr: "session closed".to_string(),
                duration_ms: 1,
                started_at: now,
                finished_at: now,
                stdout_truncated: false,
                stderr_truncated: false,
            });
        }
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .unwrap_or(ScriptedRun {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        let now = Utc::now();
        Ok(CommandResult {
            exit_code: scripted.exit_code,
            stdout: scripted.stdout,
            stderr: scripted.stderr,
            duration_ms: 1,
            started_at: now,
            finished_at: now,
            stdout_truncated: false,
            stderr_truncated: false,
        })
    }

    fn heartbeat(&self, _deadline: Duration) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.heartbeats.lock().unwrap().pop_front().unwrap_or(true)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out pre-built fake shells in order; a programmed failure consumes
/// itself on the next open.
pub struct FakeConnector {
    shells: Mutex<VecDeque<Arc<FakeShell>>>,
    fail_next: Mutex<Option<CoreError>>,
    pub opened: Mutex<Vec<ConnectTarget>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shells: Mutex::new(VecDeque::new()),
            fail_next: Mutex::new(None),
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn enqueue(&self, shell: Arc<FakeShell>) {
        self.shells.lock().unwrap().push_back(shell);
    }

    pub fn fail_next(&self, err: CoreError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }
}

impl ShellConnector for FakeConnector {
    fn open(
        &self,
        target: &ConnectTarget,
        _credential: &[u8],
        _deadline: Duration,
    ) -> Result<Arc<dyn RemoteShell>, CoreError> {
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        self.opened.lock().unwrap().push(target.clone());
        let shell = self
            .shells
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(FakeShell::new);
        Ok(shell)
    }
}

/// Queue-driven model capability.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, CoreError>>>,
}

impl ScriptedGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
        })
    }

    pub fn enqueue(&self, reply: Result<String, CoreError>) {
        self.replies.lock().unwrap().push_back(reply);
    }
}

#[async_trait]
impl PlanGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _deadline: Duration,
    ) -> Result<String, CoreError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CoreError::model_timeout("no scripted reply queued")))
    }
}

/// A syntactically clean generator reply with the given commands, all low
/// risk.
pub fn plan_reply(commands: &[&str]) -> String {
    let steps: Vec<serde_json::Value> = commands
        .iter()
        .enumerate()
        .map(|(i, command)| {
            serde_json::json!({
                "step": i + 1,
                "command": command,
                "explanation": format!("run {}", command),
                "risk_level": "low",
                "estimated_time": "10 seconds",
            })
        })
        .collect();
    serde_json::json!({
        "intent": "service_management",
        "action": "scripted",
        "risk_level": "low",
        "explanation": "scripted plan",
        "steps": steps,
    })
    .to_string()
}

pub struct Harness {
    pub app: App,
    pub audit: Arc<MemoryAuditSink>,
    pub connector: Arc<FakeConnector>,
    pub generator: Arc<ScriptedGenerator>,
}

pub fn harness() -> Harness {
    let audit = Arc::new(MemoryAuditSink::new());
    let connector = FakeConnector::new();
    let generator = ScriptedGenerator::new();
    let app = App::with_collaborators(
        test_config(),
        audit.clone(),
        connector.clone(),
        generator.clone(),
    )
    .expect("app wiring");
    Harness {
        app,
        audit,
        connector,
        generator,
    }
}

/// Connects a session backed by the given fake shell and returns its id.
pub async fn connect_session(harness: &Harness, shell: Arc<FakeShell>) -> String {
    harness.connector.enqueue(shell);
    harness
        .app
        .connect(
            "user-1",
            "host.example",
            None,
            "ops",
            opsgate::managers::sessions::Credential::Raw("swordfish".to_string()),
        )
        .await
        .expect("connect")
        .session_id
}
