//! Worker configuration.
//!
//! Two layers:
//! - [`Config`]: process-level settings loaded from an optional YAML file
//!   (backend location, platform API base, timings, dedup windows, retry).
//! - [`BotConfig`]: the per-bot payload delivered by the parent in the
//!   `start` / `restart` commands (credential, mode, assistant, replies).

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};

/// A reference to a secret value.
///
/// Supports two forms:
///   - Plain string: `token: "123:ABC"` or an env reference `token: $BOT_TOKEN`
///   - Pointer object: `token: { key: "BOT_TOKEN", source: "env" }`
#[derive(Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum SecretRef {
    Plain(String),
    Pointer { key: String, source: String },
}

impl SecretRef {
    /// Resolve to the concrete secret. Returns `None` when an env reference
    /// is unset or the resolved value is empty.
    pub fn resolve(&self) -> Option<String> {
        let value = match self {
            SecretRef::Plain(s) => match s.strip_prefix('$') {
                Some(var) if !var.is_empty() => std::env::var(var).ok()?,
                _ => s.clone(),
            },
            SecretRef::Pointer { key, source } => match source.as_str() {
                "env" => std::env::var(key).ok()?,
                other => {
                    tracing::warn!(source = %other, "unsupported secret source");
                    return None;
                }
            },
        };
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretRef::Plain(s) if s.starts_with('$') => write!(f, "SecretRef({s})"),
            SecretRef::Plain(_) => f.write_str("SecretRef(<redacted>)"),
            SecretRef::Pointer { key, source } => write!(f, "SecretRef({source}:{key})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Process-level configuration
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from the worker YAML file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub timings: Timings,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Location of the backend dialog/AI HTTP API.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Base URL, e.g. `http://backend:8000/api`.
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    /// Optional bearer key sent with every backend request.
    #[serde(default)]
    pub api_key: Option<SecretRef>,
    /// Request timeout. AI responses can be slow.
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8000/api".to_string()
}

fn default_backend_timeout() -> u64 {
    90
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            api_key: None,
            timeout_secs: default_backend_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TelegramConfig {
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
    /// Long-poll timeout passed to `getUpdates`.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: default_telegram_api(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

/// Upper bound for `timings.poll_start_attempts`; backoff doubles per attempt.
const MAX_POLL_START_ATTEMPTS: u32 = 10;

/// Delays used by the start and stop sequences.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Timings {
    /// Wait after clearing a previous webhook.
    pub clear_settle_ms: u64,
    /// Grace period between identity validation and creating the persistent client.
    pub session_grace_ms: u64,
    /// Drain delay at the end of the stop sequence.
    pub stop_settle_ms: u64,
    /// Upper bound on waiting for the poll loop, and separately for a running
    /// reply, to stop.
    pub stop_poll_timeout_ms: u64,
    /// Base delay between polling start attempts; doubles per attempt.
    pub poll_retry_base_ms: u64,
    /// Maximum polling start attempts.
    pub poll_start_attempts: u32,
    pub heartbeat_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            clear_settle_ms: 1_000,
            session_grace_ms: 2_000,
            stop_settle_ms: 3_000,
            stop_poll_timeout_ms: 10_000,
            poll_retry_base_ms: 1_000,
            poll_start_attempts: 3,
            heartbeat_secs: 30,
        }
    }
}

impl Timings {
    pub fn clear_settle(&self) -> Duration {
        Duration::from_millis(self.clear_settle_ms)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_millis(self.session_grace_ms)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    pub fn stop_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_poll_timeout_ms)
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn poll_retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.poll_retry_base_ms.saturating_mul(2u64.saturating_pow(attempt)))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Dedup cache windows and bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct DedupConfig {
    /// A repeat seen within this window is a duplicate.
    pub suppression_secs: u64,
    /// Entries older than this are dropped by the sweep.
    pub retention_secs: u64,
    pub sweep_secs: u64,
    /// Hard cap that triggers trimming on sweep.
    pub max_entries: usize,
    /// Number of most-recent entries kept after trimming.
    pub keep_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            suppression_secs: 30,
            retention_secs: 600,
            sweep_secs: 300,
            max_entries: 10_000,
            keep_entries: 5_000,
        }
    }
}

/// Retry policy for platform API calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl Config {
    /// Read and parse a YAML configuration file, then apply environment
    /// overrides. A missing file yields the defaults.
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let mut config = match path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(contents) => serde_yaml_ng::from_str::<Config>(&contents)
                    .with_context(|| format!("failed to parse config YAML: {}", path.display()))?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(path = %path.display(), "config file not found, using defaults");
                    Config::default()
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to read config file: {}", path.display())
                    });
                }
            },
            None => Config::default(),
        };

        config.apply_env_overrides();
        config.validate()?;

        tracing::debug!(
            backend = %config.backend.base_url,
            telegram = %config.telegram.api_base,
            "configuration loaded"
        );
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env("RELAY_BACKEND_URL") {
            self.backend.base_url = url;
        }
        if let Some(key) = non_empty_env("RELAY_BACKEND_API_KEY") {
            self.backend.api_key = Some(SecretRef::Plain(key));
        }
        if let Some(base) = non_empty_env("RELAY_TELEGRAM_API_BASE") {
            self.telegram.api_base = base;
        }
    }

    /// Validate semantic constraints that serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        reqwest::Url::parse(&self.backend.base_url)
            .with_context(|| format!("config: invalid backend.base_url '{}'", self.backend.base_url))?;
        reqwest::Url::parse(&self.telegram.api_base).with_context(|| {
            format!("config: invalid telegram.api_base '{}'", self.telegram.api_base)
        })?;

        if self.timings.heartbeat_secs == 0 {
            anyhow::bail!("config: timings.heartbeat_secs=0 (would create busy loop)");
        }
        if self.timings.poll_start_attempts == 0 {
            anyhow::bail!("config: timings.poll_start_attempts must be at least 1");
        }
        if self.timings.poll_start_attempts > MAX_POLL_START_ATTEMPTS {
            anyhow::bail!(
                "config: timings.poll_start_attempts ({}) exceeds {MAX_POLL_START_ATTEMPTS}",
                self.timings.poll_start_attempts
            );
        }
        if self.dedup.sweep_secs == 0 {
            anyhow::bail!("config: dedup.sweep_secs=0 (would create busy loop)");
        }
        if self.dedup.keep_entries > self.dedup.max_entries {
            anyhow::bail!(
                "config: dedup.keep_entries ({}) exceeds dedup.max_entries ({})",
                self.dedup.keep_entries,
                self.dedup.max_entries
            );
        }
        if self.dedup.retention_secs < self.dedup.suppression_secs {
            anyhow::bail!("config: dedup.retention_secs is shorter than dedup.suppression_secs");
        }
        Ok(())
    }

    /// Serialize the effective configuration as YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_yaml_ng::to_string(self).context("serialize config YAML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Per-bot configuration (start payload)
// ---------------------------------------------------------------------------

/// Messaging platform a bot is connected to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Telegram,
}

/// How updates reach the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    Polling,
    Webhook,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Polling => f.write_str("polling"),
            ConnectionMode::Webhook => f.write_str("webhook"),
        }
    }
}

/// Webhook registration parameters.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WebhookSettings {
    /// Public base URL of the orchestrator's shared listener.
    pub base_url: String,
    #[serde(default)]
    pub secret_token: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default = "default_allowed_updates")]
    pub allowed_updates: Vec<String>,
}

pub(crate) fn default_allowed_updates() -> Vec<String> {
    vec!["message".to_string(), "inline_query".to_string()]
}

/// Persona the bot answers as.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AssistantProfile {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl AssistantProfile {
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "model": self.model,
        })
    }
}

/// Reply texts and behaviour that can change without reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplySettings {
    /// Reply to `/start`. `None` uses a greeting with the assistant name.
    pub welcome_message: Option<String>,
    /// Shown to the user when the backend fails.
    pub error_message: String,
    pub typing_indicator: bool,
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self {
            welcome_message: None,
            error_message: "Sorry, something went wrong while processing your message. Please try again later.".to_string(),
            typing_indicator: true,
        }
    }
}

/// Payload of the `start` / `restart` commands.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    #[serde(deserialize_with = "id_string")]
    pub tenant_id: String,
    /// Identifier embedded in the webhook callback path. Defaults to the tenant id.
    #[serde(default, deserialize_with = "opt_id_string")]
    pub bot_id: Option<String>,
    pub token: SecretRef,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub mode: ConnectionMode,
    #[serde(default)]
    pub webhook: Option<WebhookSettings>,
    pub assistant: AssistantProfile,
    #[serde(default)]
    pub replies: ReplySettings,
}

impl BotConfig {
    pub fn bot_id(&self) -> &str {
        self.bot_id.as_deref().unwrap_or(&self.tenant_id)
    }

    /// Resolve the credential. Fails when the token reference is empty or unset.
    pub fn credential(&self) -> Result<BotCredential, crate::error::WorkerError> {
        let token = self.token.resolve().ok_or_else(|| {
            crate::error::WorkerError::Auth("bot token is empty or unresolved".to_string())
        })?;
        Ok(BotCredential {
            token,
            tenant_id: self.tenant_id.clone(),
            platform: self.platform,
        })
    }
}

/// Resolved platform credential.
#[derive(Clone, PartialEq, Eq)]
pub struct BotCredential {
    pub token: String,
    pub tenant_id: String,
    pub platform: Platform,
}

impl fmt::Debug for BotCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotCredential")
            .field("token", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("platform", &self.platform)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Identifier helpers
// ---------------------------------------------------------------------------

/// Identifier as it arrives on the wire: backends send both numbers and strings.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum WireId {
    Str(String),
    Int(i64),
}

impl WireId {
    pub(crate) fn into_string(self) -> String {
        match self {
            WireId::Str(s) => s,
            WireId::Int(n) => n.to_string(),
        }
    }
}

pub(crate) fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    WireId::deserialize(d).map(WireId::into_string)
}

pub(crate) fn opt_id_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Option::<WireId>::deserialize(d).map(|v| v.map(WireId::into_string))
}
