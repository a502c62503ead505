//! Configuration system (layered: explicit path > `SWARMKIT_CONFIG` > `~/.swarmkit/config.toml`).
//!
//! ```toml
//! [[servers]]
//! name = "filesystem"
//! transport = "stdio"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-filesystem", "./data"]
//!
//! [[servers]]
//! name = "secrets"
//! transport = "sse"
//! url = "http://localhost:8080/sse"
//! bearer_token_env = "APP_TOKEN"
//! allowed_tools = ["get_secret_word"]
//!
//! [timeouts]
//! request_ms = 30000
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SwarmError;
use crate::util::retry::RetryPolicy;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SWARMKIT_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub servers: Vec<ToolServerConfig>,
    pub timeouts: TimeoutConfig,
    /// Reconnect policy for event-stream transports.
    pub reconnect: RetryPolicy,
}

impl SwarmConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, SwarmError> {
        let config: SwarmConfig = toml::from_str(raw)
            .map_err(|e| SwarmError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file.
    pub fn load(path: &Path) -> Result<Self, SwarmError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SwarmError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from `SWARMKIT_CONFIG` or the default location.
    ///
    /// A missing default file yields an empty config; a missing file named
    /// through the environment is an error.
    pub fn from_env() -> Result<Self, SwarmError> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let path = Self::default_path();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn default_path() -> PathBuf {
        default_swarmkit_dir().join("config.toml")
    }

    /// Reject empty or duplicate server names and unusable reconnect
    /// policies.
    pub fn validate(&self) -> Result<(), SwarmError> {
        self.reconnect.validate()?;
        let mut seen = HashSet::with_capacity(self.servers.len());
        for server in &self.servers {
            let name = server.name.trim();
            if name.is_empty() {
                return Err(SwarmError::Configuration(
                    "tool server name must not be empty".into(),
                ));
            }
            if !seen.insert(name) {
                return Err(SwarmError::Configuration(format!(
                    "duplicate tool server name '{name}'"
                )));
            }
            server.transport.validate(name)?;
        }
        Ok(())
    }
}

/// Descriptor for one tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// When set, only these tools are exposed to callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
}

impl ToolServerConfig {
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            allowed_tools: None,
        }
    }

    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    /// Whether `tool` passes the allow-list.
    pub fn allows(&self, tool: &str) -> bool {
        match &self.allowed_tools {
            Some(allowed) => allowed.iter().any(|name| name == tool),
            None => true,
        }
    }
}

/// Transport-specific connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Local subprocess speaking newline-delimited JSON over stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Server-pushed event stream plus a POST endpoint announced on it.
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token_env: Option<String>,
    },
    /// One streaming POST per request.
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token_env: Option<String>,
    },
}

impl TransportConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::Stdio {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn sse(url: impl Into<String>) -> Self {
        Self::Sse {
            url: url.into(),
            headers: HashMap::new(),
            bearer_token_env: None,
        }
    }

    pub fn streamable_http(url: impl Into<String>) -> Self {
        Self::StreamableHttp {
            url: url.into(),
            headers: HashMap::new(),
            bearer_token_env: None,
        }
    }

    /// Static headers merged with the bearer token from the environment.
    pub fn resolved_headers(&self) -> HashMap<String, String> {
        let (headers, token_env) = match self {
            Self::Stdio { .. } => return HashMap::new(),
            Self::Sse {
                headers,
                bearer_token_env,
                ..
            }
            | Self::StreamableHttp {
                headers,
                bearer_token_env,
                ..
            } => (headers, bearer_token_env),
        };

        let mut resolved = headers.clone();
        if let Some(env_var) = token_env {
            match std::env::var(env_var) {
                Ok(token) if !token.is_empty() => {
                    resolved.insert("Authorization".into(), format!("Bearer {token}"));
                }
                _ => tracing::warn!(env = %env_var, "bearer token env var is not set; sending no Authorization header"),
            }
        }
        resolved
    }

    pub(crate) fn validate(&self, server: &str) -> Result<(), SwarmError> {
        match self {
            Self::Stdio { command, .. } if command.trim().is_empty() => Err(
                SwarmError::Configuration(format!("server '{server}': stdio command is empty")),
            ),
            Self::Sse { url, .. } | Self::StreamableHttp { url, .. } => {
                reqwest::Url::parse(url).map(|_| ()).map_err(|e| {
                    SwarmError::Configuration(format!("server '{server}': invalid url '{url}': {e}"))
                })
            }
            _ => Ok(()),
        }
    }
}

/// Timeouts for every suspension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(rename = "connect_ms", with = "duration_ms")]
    pub connect: Duration,
    #[serde(rename = "request_ms", with = "duration_ms")]
    pub request: Duration,
    #[serde(rename = "model_ms", with = "duration_ms")]
    pub model: Duration,
    pub shutdown: ShutdownPolicy,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            request: Duration::from_secs(60),
            model: Duration::from_secs(120),
            shutdown: ShutdownPolicy::default(),
        }
    }
}

/// Three-tier process shutdown: interrupt, terminate, kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownPolicy {
    #[serde(rename = "graceful_ms", with = "duration_ms")]
    pub graceful: Duration,
    #[serde(rename = "terminate_ms", with = "duration_ms")]
    pub terminate: Duration,
    #[serde(rename = "kill_ms", with = "duration_ms")]
    pub kill: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            graceful: Duration::from_secs(10),
            terminate: Duration::from_secs(5),
            kill: Duration::from_secs(2),
        }
    }
}

impl ShutdownPolicy {
    pub fn uniform(each: Duration) -> Self {
        Self {
            graceful: each,
            terminate: each,
            kill: each,
        }
    }

    /// Upper bound on how long a close may take.
    pub fn total(&self) -> Duration {
        self.graceful + self.terminate + self.kill
    }
}

/// Serde helper: `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `~/.swarmkit`, falling back to a relative directory without a home.
pub fn default_swarmkit_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".swarmkit"))
        .unwrap_or_else(|| PathBuf::from(".swarmkit"))
}
