use crate::config::ModelConfig;
use crate::constants::model::{MAX_COMPLETION_TOKENS, TEMPERATURE};
use crate::errors::CoreError;
use crate::managers::profiler::{HostProfile, OsFamily};
use crate::plan::{Plan, Risk, Step};
use crate::services::logger::Logger;
use crate::services::validation::Validation;
use crate::utils::json_repair::recover_json;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;

/// External language-model capability. The core depends on this single
/// operation; vendor SDKs live behind implementations of it.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        deadline: Duration,
    ) -> Result<String, CoreError>;
}

/// Chat-completions client for any OpenAI-compatible endpoint. The reply's
/// first choice is returned verbatim; cleanup is the validator's job.
pub struct HttpPlanGenerator {
    logger: Logger,
    client: reqwest::Client,
    config: ModelConfig,
}

impl HttpPlanGenerator {
    pub fn new(logger: Logger, config: ModelConfig) -> Self {
        Self {
            logger: logger.child("model"),
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl PlanGenerator for HttpPlanGenerator {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        deadline: Duration,
    ) -> Result<String, CoreError> {
        let url = format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": TEMPERATURE,
            "max_tokens": MAX_COMPLETION_TOKENS,
        });
        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .timeout(deadline);

        let response = tokio::time::timeout(deadline, request.send())
            .await
            .map_err(|_| CoreError::model_timeout("Model call exceeded deadline"))?
            .map_err(|err| {
                CoreError::model_timeout("Model endpoint did not answer")
                    .with_details(serde_json::json!({"cause": err.to_string()}))
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::model_timeout("Model endpoint refused the call")
                .with_details(serde_json::json!({"status": status.as_u16()})));
        }
        let envelope: serde_json::Value = response.json().await.map_err(|err| {
            CoreError::parse_failure("Model envelope was not JSON")
                .with_details(serde_json::json!({"cause": err.to_string()}))
        })?;
        let content = envelope["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| CoreError::parse_failure("Model envelope carried no content"))?;
        self.logger.debug(
            "Model reply received",
            Some(&serde_json::json!({"bytes": content.len()})),
        );
        Ok(content.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RawStep {
    step: Option<u64>,
    command: Option<String>,
    #[serde(alias = "description")]
    explanation: Option<String>,
    risk_level: Option<String>,
    estimated_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    intent: Option<String>,
    action: Option<String>,
    risk_level: Option<String>,
    explanation: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

static DURATION_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*([a-z]*)").expect("duration hint regex"));

/// Parse a free-form duration hint ("30 seconds", "2 min", "1h") into
/// seconds. Unrecognized units fall back to seconds.
pub fn parse_duration_hint(raw: &str) -> Option<u64> {
    let caps = DURATION_HINT.captures(raw)?;
    let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
    let secs = match unit.as_str() {
        "m" | "min" | "mins" | "minute" | "minutes" => amount * 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => amount * 3600,
        _ => amount,
    };
    Some(secs)
}

/// Render the host profile into the context block the model is prompted
/// with. Field order matches the profile definition so operators can diff
/// prompts against snapshots.
fn render_profile(profile: &HostProfile) -> String {
    let tools: Vec<&str> = profile.tools.iter().map(String::as_str).collect();
    format!(
        "- Operating system: {} {} (family: {})\n\
         - Kernel: {} ({})\n\
         - Memory: {} bytes total, {} bytes available\n\
         - Disk free on /: {} bytes\n\
         - Package manager: {}\n\
         - Service manager: {}\n\
         - Tools on PATH: {}",
        profile.distribution,
        profile.version,
        profile.os_family.as_str(),
        profile.kernel,
        profile.arch,
        profile.memory_total_bytes,
        profile.memory_available_bytes,
        profile.disk_free_bytes,
        profile.package_manager().unwrap_or("unknown"),
        profile.service_manager.as_str(),
        if tools.is_empty() {
            "unknown".to_string()
        } else {
            tools.join(", ")
        },
    )
}

pub fn build_system_prompt(profile: &HostProfile) -> String {
    let os_hint = match profile.os_family {
        OsFamily::Debian => "This is a Debian-family host: use apt-get with explicit -y flags.",
        OsFamily::Rhel => {
            "This is a RHEL-family host: use dnf (or yum if dnf is absent) with -y flags."
        }
        OsFamily::Arch => "This is an Arch host: use pacman with --noconfirm.",
        OsFamily::Alpine => "This is an Alpine host: use apk.",
        OsFamily::Suse => "This is a SUSE-family host: use zypper with -y flags.",
        OsFamily::Unknown => "The OS family is unknown: prefer portable POSIX commands.",
    };
    format!(
        "You are an expert Linux administrator generating shell commands for a production host.\n\
         \n\
         TARGET HOST:\n{profile}\n\
         \n\
         SAFETY CONSTRAINTS:\n\
         - Prefer idempotent operations.\n\
         - Never replace or modify the kernel.\n\
         - Never flush firewall rules without the ufw reload equivalent.\n\
         - Never run `rm -rf /` or equivalents.\n\
         - Never modify the SSH listener or its configuration.\n\
         - Use non-interactive flags (-y and equivalents) everywhere.\n\
         {os_hint}\n\
         \n\
         Respond with exactly one JSON object, no surrounding prose, no code\n\
         fences, no trailing commas, with this shape:\n\
         {{\n\
           \"intent\": \"package_management|service_management|configuration|troubleshooting|general_help\",\n\
           \"action\": \"short action identifier\",\n\
           \"risk_level\": \"low|medium|high|critical\",\n\
           \"explanation\": \"what the plan does\",\n\
           \"steps\": [\n\
             {{\"step\": 1, \"command\": \"...\", \"explanation\": \"...\", \"risk_level\": \"low\", \"estimated_time\": \"30 seconds\"}}\n\
           ]\n\
         }}",
        profile = render_profile(profile),
        os_hint = os_hint,
    )
}

/// System prompt for plan-bound discussion. Explanatory only: the reply must
/// never contain a revised plan.
pub fn build_chat_system_prompt(plan: &Plan) -> String {
    let steps: Vec<String> = plan
        .steps
        .iter()
        .map(|step| format!("{}. {}", step.index + 1, step.command))
        .collect();
    format!(
        "You are explaining an already-generated command plan to an operator.\n\
         Answer questions about what the commands do and why. Do NOT propose\n\
         new or changed commands; plans are regenerated through a separate\n\
         request.\n\
         \n\
         Request: {}\n\
         Plan ({}):\n{}",
        plan.request_text,
        plan.overall_risk.as_str(),
        steps.join("\n"),
    )
}

/// Normalizes, repairs, validates and risk-classifies raw model output into
/// an immutable `Plan`. No step is ever fabricated: anything unusable is a
/// typed failure.
pub struct PlanValidator {
    logger: Logger,
    validation: Validation,
}

impl PlanValidator {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("validator"),
            validation: Validation::new(),
        }
    }

    pub fn validate(
        &self,
        user_id: &str,
        session_id: &str,
        request_text: &str,
        reply: &str,
    ) -> Result<Plan, CoreError> {
        let value = recover_json(reply).map_err(|failure| {
            CoreError::parse_failure(format!("Model reply was not JSON: {}", failure.message))
                .with_details(serde_json::json!({"context": failure.context}))
        })?;
        let raw: RawPlan = serde_json::from_value(value).map_err(|err| {
            CoreError::validation_failure(format!("Model reply shape is invalid: {}", err))
        })?;

        let mut missing = Vec::new();
        for (field, present) in [
            ("intent", raw.intent.is_some()),
            ("action", raw.action.is_some()),
            ("risk_level", raw.risk_level.is_some()),
            ("explanation", raw.explanation.is_some()),
        ] {
            if !present {
                missing.push(field);
            }
        }
        if raw.steps.is_empty() {
            let explanation = raw.explanation.as_deref().unwrap_or("").trim().to_string();
            if !explanation.is_empty() {
                return Err(CoreError::model_refusal(explanation));
            }
            missing.push("steps");
        }
        if !missing.is_empty() {
            return Err(
                CoreError::validation_failure("Model reply is missing required fields")
                    .with_details(serde_json::json!({"missing": missing})),
            );
        }

        let mut steps = Vec::with_capacity(raw.steps.len());
        for (position, raw_step) in raw.steps.iter().enumerate() {
            let command = raw_step
                .command
                .as_deref()
                .map(|cmd| self.validation.clean_command(cmd))
                .transpose()?
                .ok_or_else(|| {
                    CoreError::validation_failure(format!(
                        "Step {} is missing its command",
                        position + 1
                    ))
                })?;
            let declared = raw_step.step.ok_or_else(|| {
                CoreError::validation_failure(format!(
                    "Step {} is missing its index",
                    position + 1
                ))
            })?;
            if declared != (position as u64) + 1 {
                return Err(CoreError::validation_failure(format!(
                    "Step index {} does not match its position {}",
                    declared,
                    position + 1
                )));
            }
            let risk = self.normalize_risk(raw_step.risk_level.as_deref(), position);
            let duration_hint = raw_step.estimated_time.clone();
            let duration_hint_secs = duration_hint.as_deref().and_then(parse_duration_hint);
            steps.push(Step::new(
                position,
                command,
                raw_step.explanation.clone().unwrap_or_default(),
                risk,
                duration_hint,
                duration_hint_secs,
            ));
        }

        let declared_risk = raw
            .risk_level
            .as_deref()
            .and_then(Risk::parse)
            .unwrap_or(Risk::Medium);
        // The computed value wins; a disagreeing model is only worth a log line.
        let overall_risk = steps.iter().map(|s| s.risk).max().unwrap_or(Risk::Low);
        if declared_risk != overall_risk {
            self.logger.warn(
                "Model risk level disagrees with computed step maximum",
                Some(&serde_json::json!({
                    "declared": declared_risk.as_str(),
                    "computed": overall_risk.as_str(),
                })),
            );
        }

        Ok(Plan {
            plan_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            created_at: chrono::Utc::now(),
            request_text: request_text.to_string(),
            intent: raw.intent.unwrap_or_default(),
            action: raw.action.unwrap_or_default(),
            explanation: raw.explanation.unwrap_or_default(),
            overall_risk,
            steps,
        })
    }

    fn normalize_risk(&self, raw: Option<&str>, position: usize) -> Risk {
        match raw.and_then(Risk::parse) {
            Some(risk) => risk,
            None => {
                self.logger.warn(
                    "Step risk outside the closed vocabulary; coerced to medium",
                    Some(&serde_json::json!({
                        "step": position + 1,
                        "declared": raw,
                    })),
                );
                Risk::Medium
            }
        }
    }
}
