use crate::constants::network::{MAX_PORT, MIN_PORT, SSH_DEFAULT_PORT};
use crate::errors::CoreError;

/// Input hygiene shared by the public operations. Kept deliberately small:
/// the adapter owns request shape, the core owns semantic validity.
#[derive(Clone, Default)]
pub struct Validation;

impl Validation {
    pub fn new() -> Self {
        Self
    }

    pub fn ensure_identifier(&self, value: &str, label: &str) -> Result<String, CoreError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(CoreError::validation_failure(format!(
                "{} must be a non-empty string",
                label
            )));
        }
        if trimmed.contains('\0') {
            return Err(CoreError::validation_failure(format!(
                "{} must not contain null bytes",
                label
            )));
        }
        Ok(trimmed.to_string())
    }

    pub fn ensure_hostname(&self, value: &str) -> Result<String, CoreError> {
        let host = self.ensure_identifier(value, "hostname")?;
        if host.chars().any(char::is_whitespace) {
            return Err(CoreError::validation_failure(
                "hostname must not contain whitespace",
            ));
        }
        Ok(host)
    }

    pub fn ensure_port(&self, value: Option<u16>) -> Result<u16, CoreError> {
        let port = value.unwrap_or(SSH_DEFAULT_PORT);
        if !(MIN_PORT..=MAX_PORT).contains(&port) {
            return Err(CoreError::validation_failure(format!(
                "port must be between {} and {}",
                MIN_PORT, MAX_PORT
            )));
        }
        Ok(port)
    }

    /// Hygiene applied to every command before it reaches a shell: no empty
    /// commands, no null bytes.
    pub fn clean_command(&self, command: &str) -> Result<String, CoreError> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(CoreError::validation_failure("command must not be empty"));
        }
        if trimmed.contains('\0') {
            return Err(CoreError::validation_failure(
                "command must not contain null bytes",
            ));
        }
        Ok(trimmed.to_string())
    }
}
