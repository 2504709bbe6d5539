//! Configuration parsing and validation for chatbridge.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:11434")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// How thinking-phase output is presented to callers.
    #[serde(default)]
    pub thinking: ThinkingStyle,
    /// Upper bound on concurrently handled requests.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

fn default_listen() -> String {
    "127.0.0.1:11434".to_string()
}

fn default_max_concurrent() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            thinking: ThinkingStyle::default(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

/// Presentation of thinking-phase text on the outward stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingStyle {
    /// Collect the whole thinking segment and flush it as one wrapped chunk.
    #[default]
    Buffered,
    /// Stream thinking text as it arrives, delimiters attached to the edges.
    Streamed,
    /// Drop thinking text entirely.
    Hidden,
}

/// Conversation/session lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Sessions untouched for longer than this are evicted.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Period of the background eviction sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Maximum silence between upstream frames before a turn is failed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Wall-clock bound on a single turn.
    #[serde(default = "default_max_turn_secs")]
    pub max_turn_secs: u64,
    #[serde(default)]
    pub new_chat: NewChatRule,
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    1800
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_max_turn_secs() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_turn_secs: default_max_turn_secs(),
            new_chat: NewChatRule::default(),
            on_conflict: ConflictPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_turn(&self) -> Duration {
        Duration::from_secs(self.max_turn_secs)
    }
}

/// When a request opens a new upstream conversation instead of continuing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NewChatRule {
    /// A history with exactly one user message always starts fresh.
    #[default]
    FirstMessage,
    /// Only a missing session starts a new conversation.
    MissingSession,
}

/// What happens to a second request while a turn is in flight for its key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Refuse with a retryable status.
    #[default]
    Reject,
    /// Wait for the in-flight turn to finish.
    Queue,
}

/// Upstream event schema spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible `chat/completions` SSE (Cerebras and friends).
    Openai,
    /// DeepSeek web chat patch-stream.
    Deepseek,
    /// Kimi web chat event stream.
    Kimi,
    /// Qwen web chat stream with explicit phases.
    Qwen,
    /// One finished JSON document per turn.
    Blob,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Deepseek => "deepseek",
            ProviderKind::Kimi => "kimi",
            ProviderKind::Qwen => "qwen",
            ProviderKind::Blob => "blob",
        }
    }

    /// Whether the provider keeps conversation context server-side.
    ///
    /// Linked providers only receive the newest user message on a
    /// continuing turn; the rest get the full history every time.
    pub fn is_linked(&self) -> bool {
        !matches!(self, ProviderKind::Openai)
    }
}

/// How turns reach a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Streaming HTTP request issued by chatbridge.
    #[default]
    Http,
    /// Page-rendered chat observed through a browser binding.
    Browser,
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a provider's API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique name for this provider
    pub name: String,
    /// Upstream event schema
    pub kind: ProviderKind,
    #[serde(default)]
    pub transport: Transport,
    /// Base URL for the provider's chat API
    #[serde(default)]
    pub url: String,
    /// Bearer token or session token sent upstream
    pub api_key: Option<ApiKey>,
    /// Models exposed for this provider
    #[serde(default)]
    pub models: Vec<String>,
    /// Extra headers sent with every upstream request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Path appended to `url` to create an upstream conversation
    pub create_session_path: Option<String>,
    /// JSON pointer locating the conversation id in the create response
    pub session_id_pointer: Option<String>,
    /// Regex matched against captured request URLs (browser transport)
    pub capture_url: Option<String>,
    /// Ask the upstream for reasoning output where it supports the switch
    #[serde(default)]
    pub thinking: bool,
}

impl ProviderConfig {
    /// Whether this provider serves the given model name.
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model) || self.name == model
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            tracing::warn!("No providers configured - bridge will reject all requests");
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate provider name '{}'",
                    provider.name
                )));
            }

            match provider.transport {
                Transport::Http if provider.url.is_empty() => {
                    return Err(ConfigError::Validation(format!(
                        "Provider '{}' has empty URL",
                        provider.name
                    )));
                }
                Transport::Browser if provider.capture_url.is_none() => {
                    return Err(ConfigError::Validation(format!(
                        "Browser provider '{}' needs a capture_url pattern",
                        provider.name
                    )));
                }
                _ => {}
            }

            if let Some(pattern) = &provider.capture_url {
                regex::Regex::new(pattern).map_err(|e| {
                    ConfigError::Validation(format!(
                        "Provider '{}' has invalid capture_url: {}",
                        provider.name, e
                    ))
                })?;
            }

            if provider.session_id_pointer.is_some() && provider.create_session_path.is_none() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' sets session_id_pointer without create_session_path",
                    provider.name
                )));
            }
        }

        let timers = [
            ("ttl_secs", self.session.ttl_secs),
            ("sweep_interval_secs", self.session.sweep_interval_secs),
            ("idle_timeout_secs", self.session.idle_timeout_secs),
            ("max_turn_secs", self.session.max_turn_secs),
        ];
        for (name, value) in timers {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "session.{} must be greater than zero",
                    name
                )));
            }
        }

        if self.server.max_concurrent_requests == 0 {
            return Err(ConfigError::Validation(
                "server.max_concurrent_requests must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for provider '{provider}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

/// Raw provider config deserialized directly from TOML.
/// api_key is `Option<String>` so it may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawProviderConfig {
    name: String,
    kind: ProviderKind,
    #[serde(default)]
    transport: Transport,
    #[serde(default)]
    url: String,
    api_key: Option<String>,
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    create_session_path: Option<String>,
    session_id_pointer: Option<String>,
    capture_url: Option<String>,
    #[serde(default)]
    thinking: bool,
}

/// Raw configuration deserialized directly from TOML.
/// Provider api_key values may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawConfig {
    server: ServerConfig,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    providers: Vec<RawProviderConfig>,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `Bearer ${TOKEN}`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(
    input: &str,
    provider_name: &str,
    lookup: F,
) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            provider: provider_name.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                provider: provider_name.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            provider: provider_name.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in provider '{}')",
                var_name, provider_name
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Expand all `${VAR}` references in a string using real environment variables.
fn expand_env_vars(input: &str, provider_name: &str) -> Result<String, ConfigError> {
    expand_env_vars_with(input, provider_name, |name| std::env::var(name).ok())
}

/// Derive the convention-based env var name for a provider.
///
/// - "deepseek" -> "CHATBRIDGE_DEEPSEEK_API_KEY"
/// - "qwen-web" -> "CHATBRIDGE_QWEN_WEB_API_KEY"
pub fn convention_env_var_name(provider_name: &str) -> String {
    let upper_snake = provider_name.to_uppercase().replace(['-', ' '], "_");
    format!("CHATBRIDGE_{}_API_KEY", upper_snake)
}

/// Try convention-based env var lookup for a provider's API key.
fn convention_key_lookup(provider_name: &str) -> Option<(String, String)> {
    let var_name = convention_env_var_name(provider_name);
    std::env::var(&var_name).ok().map(|value| (var_name, value))
}

impl Config {
    /// Convert raw (deserialized) config to final config with env var expansion.
    ///
    /// `api_key` and header values may reference `${VAR}`. A missing
    /// `api_key` falls back to `CHATBRIDGE_<NAME>_API_KEY`.
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let mut providers = Vec::with_capacity(raw.providers.len());
        let mut key_sources = Vec::with_capacity(raw.providers.len());

        for rp in raw.providers {
            let (api_key, source) = match rp.api_key {
                Some(ref raw_key) if raw_key.contains("${") => {
                    let expanded = expand_env_vars(raw_key, &rp.name)?;
                    (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
                }
                Some(ref raw_key) => (Some(ApiKey::from(raw_key.as_str())), KeySource::Literal),
                None => match convention_key_lookup(&rp.name) {
                    Some((var_name, value)) => {
                        (Some(ApiKey::from(value)), KeySource::Convention(var_name))
                    }
                    None => (None, KeySource::None),
                },
            };

            let mut headers = BTreeMap::new();
            for (name, value) in rp.headers {
                headers.insert(name, expand_env_vars(&value, &rp.name)?);
            }

            key_sources.push((rp.name.clone(), source));

            providers.push(ProviderConfig {
                name: rp.name,
                kind: rp.kind,
                transport: rp.transport,
                url: rp.url,
                api_key,
                models: rp.models,
                headers,
                create_session_path: rp.create_session_path,
                session_id_pointer: rp.session_id_pointer,
                capture_url: rp.capture_url,
                thinking: rp.thinking,
            });
        }

        let config = Config {
            server: raw.server,
            session: raw.session,
            providers,
            logging: raw.logging,
        };

        Ok((config, key_sources))
    }

    /// Load configuration from a TOML file with environment variable expansion.
    ///
    /// Returns the config and per-provider key source information.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let raw: RawConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;
        let (config, key_sources) = Self::from_raw(raw)?;
        config.validate()?;

        Ok((config, key_sources))
    }
}
