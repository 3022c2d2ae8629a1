use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [chat]
//                    stall_timeout_secs = 30
//
//   env var:         RELAY_CHAT__STALL_TIMEOUT_SECS=30   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub chat: ChatFileConfig,
    #[serde(default)]
    pub source: SourceFileConfig,
}

/// Auth-related tunables (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            session_ttl_secs: default_session_ttl(),
        }
    }
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Streaming tunables (lives under `[chat]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatFileConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_replay_max_entries")]
    pub replay_max_entries: usize,
    #[serde(default = "default_replay_max_age_secs")]
    pub replay_max_age_secs: u64,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// 0 = unlimited
    #[serde(default)]
    pub max_messages_per_day: u32,
}

impl Default for ChatFileConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            stall_timeout_secs: default_stall_timeout_secs(),
            replay_max_entries: default_replay_max_entries(),
            replay_max_age_secs: default_replay_max_age_secs(),
            broadcast_capacity: default_broadcast_capacity(),
            keep_alive_secs: default_keep_alive_secs(),
            max_messages_per_day: 0,
        }
    }
}

/// Which text-generation service to talk to (lives under `[source]`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// OpenAI-compatible `/chat/completions` streaming endpoint
    Openai,
    /// Offline source that echoes the last user message back
    Echo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceFileConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_echo_delay_ms")]
    pub echo_delay_ms: u64,
}

impl Default for SourceFileConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            echo_delay_ms: default_echo_delay_ms(),
        }
    }
}

fn default_session_ttl() -> u64 {
    604800
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_stall_timeout_secs() -> u64 {
    60
}
fn default_replay_max_entries() -> usize {
    2048
}
fn default_replay_max_age_secs() -> u64 {
    300
}
fn default_broadcast_capacity() -> usize {
    256
}
fn default_keep_alive_secs() -> u64 {
    15
}
fn default_source_kind() -> SourceKind {
    SourceKind::Echo
}
fn default_base_url() -> String {
    "https://api.openai.com/v1/".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_request_timeout_secs() -> u64 {
    600
}
fn default_echo_delay_ms() -> u64 {
    40
}

/// Build a figment that layers: defaults → config.toml → RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_AUTH__ENABLED=true`  →  `auth.enabled = true`
///   `RELAY_SOURCE__KIND=openai`  →  `source.kind = "openai"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("RELAY_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Authentication configuration (runtime view).
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Login token time-to-live in seconds (default: 7 days)
    pub session_ttl_secs: u64,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            enabled: fc.enabled,
            session_ttl_secs: fc.session_ttl_secs,
        }
    }
}

/// Streaming configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub default_model: String,
    /// Treat a generation as failed after this long without a fragment (None = disabled)
    pub stall_timeout: Option<Duration>,
    pub replay_max_entries: usize,
    pub replay_max_age: Duration,
    pub broadcast_capacity: usize,
    pub keep_alive: Duration,
    /// Per-user daily message limit (None = unlimited)
    pub max_messages_per_day: Option<u32>,
}

impl ChatConfig {
    pub fn from_file(fc: &ChatFileConfig) -> Self {
        Self {
            default_model: fc.default_model.clone(),
            stall_timeout: if fc.stall_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.stall_timeout_secs))
            },
            replay_max_entries: fc.replay_max_entries.max(1),
            replay_max_age: Duration::from_secs(fc.replay_max_age_secs),
            broadcast_capacity: fc.broadcast_capacity.max(1),
            keep_alive: Duration::from_secs(fc.keep_alive_secs.max(1)),
            max_messages_per_day: (fc.max_messages_per_day > 0).then_some(fc.max_messages_per_day),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::from_file(&ChatFileConfig::default())
    }
}

/// Text-generation service configuration (runtime view).
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub echo_delay: Duration,
}

impl SourceConfig {
    pub fn from_file(fc: &SourceFileConfig) -> Self {
        let base_url = if fc.base_url.ends_with('/') {
            fc.base_url.clone()
        } else {
            format!("{}/", fc.base_url)
        };
        Self {
            kind: fc.kind.clone(),
            base_url,
            api_key: std::env::var(&fc.api_key_env)
                .ok()
                .filter(|k| !k.is_empty()),
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
            echo_delay: Duration::from_millis(fc.echo_delay_ms),
        }
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl RelayConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".chat-relay"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        let db_path = data_dir.join("relay.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            db_path,
            logs_dir,
        })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
