use chat_session::{EchoPolicy, ReconnectPolicy, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [reconnect]
//                    delay_secs = 5
//
//   env var:         CHAT_RECONNECT__DELAY_SECS=5   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Where to connect and as whom (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_server_url")]
    pub url: String,
    /// Skip the username prompt when set.
    #[serde(default)]
    pub username: Option<String>,
    /// Also send the username as a `?username=` query parameter.
    #[serde(default)]
    pub username_in_url: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            username: None,
            username_in_url: false,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Backoff tunables (lives under `[reconnect]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// 0 = retry forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EchoMode {
    #[default]
    Optimistic,
    Server,
}

/// Message handling (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default)]
    pub echo: EchoMode,
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            echo: EchoMode::default(),
            max_content_chars: default_max_content_chars(),
        }
    }
}

fn default_server_url() -> String {
    "ws://localhost:8080/ws".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_delay_secs() -> u64 {
    30
}
fn default_max_delay_secs() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    10
}
fn default_max_content_chars() -> usize {
    chat_session::config::DEFAULT_MAX_CONTENT_CHARS
}

/// `--config` if given, else `<config dir>/chat/config.toml`.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| dirs::config_dir().map(|dir| dir.join("chat").join("config.toml")))
}

/// Build a figment that layers: defaults → config.toml → CHAT_* env vars.
///
/// A missing config file is not an error; its layer is simply empty.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHAT_SERVER__URL=ws://host/ws`  →  `server.url = "ws://host/ws"`
///   `CHAT_RECONNECT__MAX_ATTEMPTS=0`  →  `reconnect.max_attempts = 0`
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("CHAT_").split("__"))
}

// =============================================================================
// Runtime settings (derived from FileConfig, then overridden by CLI flags)
// =============================================================================

#[derive(Clone, Debug)]
pub struct Settings {
    pub server_url: String,
    pub username: Option<String>,
    pub session: SessionConfig,
}

impl Settings {
    pub fn from_file(fc: &FileConfig) -> Self {
        let reconnect = ReconnectPolicy {
            initial_delay: Duration::from_secs(fc.reconnect.delay_secs),
            max_delay: Duration::from_secs(fc.reconnect.max_delay_secs.max(fc.reconnect.delay_secs)),
            max_attempts: (fc.reconnect.max_attempts > 0).then_some(fc.reconnect.max_attempts),
        };
        let echo = match fc.session.echo {
            EchoMode::Optimistic => EchoPolicy::Optimistic,
            EchoMode::Server => EchoPolicy::ServerEcho,
        };
        Self {
            server_url: fc.server.url.clone(),
            username: fc
                .server
                .username
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            session: SessionConfig {
                reconnect,
                connect_timeout: Duration::from_secs(fc.server.connect_timeout_secs),
                echo,
                max_content_chars: fc.session.max_content_chars,
                username_in_url: fc.server.username_in_url,
            },
        }
    }
}
