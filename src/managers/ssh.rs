use crate::constants::execution::{POLL_SLEEP_MS, TRUNCATION_MARKER};
use crate::constants::network::KEEPALIVE_INTERVAL_MS;
use crate::errors::CoreError;
use crate::services::logger::Logger;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Exit code reserved for client-side failures: deadline expiry, channel
/// loss, session teardown. Always paired with a filled stderr.
pub const EXIT_CLIENT_FAILURE: i64 = -1;

const HEARTBEAT_COMMAND: &str = "true";
const CONNECT_PROBE_COMMAND: &str = "echo connection-probe";

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl CommandResult {
    fn client_failure(stderr: &str, started_at: DateTime<Utc>, started: Instant) -> Self {
        Self {
            exit_code: EXIT_CLIENT_FAILURE,
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
            finished_at: Utc::now(),
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }
}

/// One live authenticated shell channel to one host. Implementations must
/// tolerate `close` racing a `run` in flight: the run fails with a
/// client-side result, never hangs.
pub trait RemoteShell: Send + Sync {
    fn run(&self, command: &str, deadline: Duration) -> Result<CommandResult, CoreError>;
    fn heartbeat(&self, deadline: Duration) -> bool;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub hostname: String,
    pub port: u16,
    pub username: String,
}

/// Factory seam: opens an authenticated shell for a target. The registry
/// depends on this trait so tests can inject scripted shells.
pub trait ShellConnector: Send + Sync {
    fn open(
        &self,
        target: &ConnectTarget,
        credential: &[u8],
        deadline: Duration,
    ) -> Result<Arc<dyn RemoteShell>, CoreError>;
}

/// Byte-capped output capture. Keeps exactly `limit` bytes; overflow is
/// recorded and rendered as the literal truncation marker.
struct Capture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.buf.len() >= self.limit {
            if !chunk.is_empty() {
                self.truncated = true;
            }
            return;
        }
        let remaining = self.limit - self.buf.len();
        if chunk.len() > remaining {
            self.buf.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
    }

    fn render(self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.buf).to_string();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        (text, self.truncated)
    }
}

/// Persistent libssh2 session. Commands run one channel at a time under the
/// session mutex; `close` shuts the cloned TCP stream down out-of-band so an
/// in-flight command unblocks promptly.
pub struct SshShell {
    session: Mutex<Session>,
    stream: TcpStream,
    closed: AtomicBool,
    capture_limit: usize,
}

impl SshShell {
    fn run_locked(&self, command: &str, deadline: Duration) -> CommandResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let session = match self.session.lock() {
            Ok(session) => session,
            Err(_) => return CommandResult::client_failure("session closed", started_at, started),
        };
        if self.closed.load(Ordering::SeqCst) {
            return CommandResult::client_failure("session closed", started_at, started);
        }

        let mut channel = match session.channel_session() {
            Ok(channel) => channel,
            Err(err) => {
                return CommandResult::client_failure(
                    &format!("channel lost: {}", err),
                    started_at,
                    started,
                )
            }
        };
        if let Err(err) = channel.exec(command) {
            return CommandResult::client_failure(
                &format!("channel lost: {}", err),
                started_at,
                started,
            );
        }

        session.set_blocking(false);
        let mut stdout = Capture::new(self.capture_limit);
        let mut stderr = Capture::new(self.capture_limit);
        let mut stderr_stream = channel.stderr();
        let mut timed_out = false;
        let mut torn_down = false;
        let mut buf = [0u8; 8192];
        loop {
            let mut progressed = false;
            match channel.read(&mut buf) {
                Ok(n) if n > 0 => {
                    stdout.push(&buf[..n]);
                    progressed = true;
                }
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => {
                    torn_down = true;
                    break;
                }
            }
            match stderr_stream.read(&mut buf) {
                Ok(n) if n > 0 => {
                    stderr.push(&buf[..n]);
                    progressed = true;
                }
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => {
                    torn_down = true;
                    break;
                }
            }
            if channel.eof() {
                break;
            }
            if self.closed.load(Ordering::SeqCst) {
                torn_down = true;
                break;
            }
            if started.elapsed() > deadline {
                timed_out = true;
                break;
            }
            if !progressed {
                std::thread::sleep(Duration::from_millis(POLL_SLEEP_MS));
            }
        }
        session.set_blocking(true);

        if torn_down || self.closed.load(Ordering::SeqCst) {
            return CommandResult::client_failure("session closed", started_at, started);
        }
        if timed_out {
            let _ = channel.close();
            return CommandResult::client_failure("deadline exceeded", started_at, started);
        }

        let _ = channel.close();
        let _ = channel.wait_close();
        let exit_code = i64::from(channel.exit_status().unwrap_or(-1));
        let (stdout, stdout_truncated) = stdout.render();
        let (stderr_text, stderr_truncated) = stderr.render();
        CommandResult {
            exit_code,
            stdout,
            stderr: stderr_text,
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
            finished_at: Utc::now(),
            stdout_truncated,
            stderr_truncated,
        }
    }
}

impl RemoteShell for SshShell {
    fn run(&self, command: &str, deadline: Duration) -> Result<CommandResult, CoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::session_closed("SSH session is closed"));
        }
        Ok(self.run_locked(command, deadline))
    }

    fn heartbeat(&self, deadline: Duration) -> bool {
        match self.run(HEARTBEAT_COMMAND, deadline) {
            Ok(result) => result.exit_code == 0,
            Err(_) => false,
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SshShell {
    fn drop(&mut self) {
        self.close();
    }
}

/// Real connector: TCP connect with deadline, protocol handshake, then
/// password or private-key authentication (disambiguated by credential
/// content), followed by a cheap post-auth probe.
pub struct SshConnector {
    logger: Logger,
    capture_limit: usize,
}

impl SshConnector {
    pub fn new(logger: Logger, capture_limit: usize) -> Self {
        Self {
            logger: logger.child("ssh"),
            capture_limit,
        }
    }
}

fn host_key_fingerprint(session: &Session) -> Option<String> {
    let (key, _) = session.host_key()?;
    let digest = Sha256::digest(key);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest);
    Some(format!("SHA256:{}", encoded))
}

impl ShellConnector for SshConnector {
    fn open(
        &self,
        target: &ConnectTarget,
        credential: &[u8],
        deadline: Duration,
    ) -> Result<Arc<dyn RemoteShell>, CoreError> {
        let credential = std::str::from_utf8(credential)
            .map_err(|_| CoreError::auth_failure("Credential is not valid UTF-8"))?;

        let addr = format!("{}:{}", target.hostname, target.port)
            .to_socket_addrs()
            .map_err(|err| CoreError::connect(format!("Failed to resolve host: {}", err)))?
            .next()
            .ok_or_else(|| CoreError::connect("Host resolved to no addresses"))?;
        let tcp = TcpStream::connect_timeout(&addr, deadline)
            .map_err(|err| CoreError::connect(format!("Failed to connect: {}", err)))?;
        tcp.set_read_timeout(Some(deadline)).ok();
        tcp.set_write_timeout(Some(deadline)).ok();
        let stream = tcp
            .try_clone()
            .map_err(|err| CoreError::connect(format!("Failed to clone stream: {}", err)))?;

        let mut session =
            Session::new().map_err(|_| CoreError::connect("Failed to create SSH session"))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|err| CoreError::connect(format!("SSH handshake failed: {}", err)))?;

        if let Some(fingerprint) = host_key_fingerprint(&session) {
            self.logger.info(
                "SSH host key observed",
                Some(&serde_json::json!({
                    "host": target.hostname,
                    "fingerprint": fingerprint,
                })),
            );
        }

        let auth = if credential.trim_start().starts_with("-----BEGIN") {
            session.userauth_pubkey_memory(&target.username, None, credential, None)
        } else {
            session.userauth_password(&target.username, credential)
        };
        auth.map_err(|err| CoreError::auth_failure(format!("SSH authentication failed: {}", err)))?;
        if !session.authenticated() {
            return Err(CoreError::auth_failure("SSH authentication failed"));
        }
        session.set_keepalive(true, (KEEPALIVE_INTERVAL_MS / 1000).max(1) as u32);

        let shell = Arc::new(SshShell {
            session: Mutex::new(session),
            stream,
            closed: AtomicBool::new(false),
            capture_limit: self.capture_limit,
        });

        let probe = shell.run(CONNECT_PROBE_COMMAND, deadline.min(Duration::from_secs(5)));
        match probe {
            Ok(result) if result.exit_code == 0 => Ok(shell),
            Ok(result) => Err(CoreError::connect("Connection probe failed")
                .with_details(serde_json::json!({"exit_code": result.exit_code}))),
            Err(err) => Err(CoreError::connect(format!(
                "Connection probe failed: {}",
                err
            ))),
        }
    }
}
