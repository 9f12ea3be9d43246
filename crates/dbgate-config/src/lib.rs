//! Configuration model and logging setup for `dbgate`.
//!
//! Configuration comes from an optional TOML file; every key has a default so an
//! empty (or missing) file yields a usable local-only gateway.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Environment variable consulted when no `--config` flag is given.
pub const CONFIG_ENV_VAR: &str = "DBGATE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub debugger: DebuggerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// A loaded config plus the keys that were present in the file but not understood.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfig {
    pub config: GatewayConfig,
    pub unknown_keys: Vec<String>,
}

impl GatewayConfig {
    pub fn load_from_path(path: &Path) -> Result<LoadedConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<LoadedConfig, ConfigError> {
        let (config, unknown_keys) = deserialize_toml_with_unknown_keys(text)?;
        Ok(LoadedConfig {
            config,
            unknown_keys,
        })
    }
}

fn deserialize_toml_with_unknown_keys<T: DeserializeOwned>(
    text: &str,
) -> Result<(T, Vec<String>), ConfigError> {
    let mut unknown = Vec::<String>::new();
    let deserializer = toml::de::Deserializer::new(text);
    let value = serde_ignored::deserialize(deserializer, |path| {
        // `serde_ignored` renders root paths with a leading `.`.
        unknown.push(path.to_string().trim_start_matches('.').to_owned());
    })
    .map_err(|err| ConfigError::Toml(err.message().to_owned()))?;
    unknown.sort();
    unknown.dedup();
    Ok((value, unknown))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind. Loopback hosts serve plain HTTP without access tokens;
    /// anything else requires TLS material and token-gated access.
    #[serde(default = "ServerConfig::default_host")]
    pub host: String,

    /// Port to bind; `0` picks an ephemeral port.
    #[serde(default)]
    pub port: u16,

    /// PEM certificate chain used in remote mode.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key used in remote mode.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    /// Inactivity interval after which the event stream sends a heartbeat.
    #[serde(default = "ServerConfig::default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl ServerConfig {
    fn default_host() -> String {
        "127.0.0.1".to_owned()
    }

    fn default_heartbeat_secs() -> u64 {
        30
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// Returns `true` when the configured host only accepts local connections.
    pub fn is_loopback(&self) -> bool {
        is_loopback_host(&self.host)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: 0,
            tls_cert: None,
            tls_key: None,
            heartbeat_secs: Self::default_heartbeat_secs(),
        }
    }
}

pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim();
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let host = host
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(host);
    host.parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerConfig {
    /// The gdb executable to launch.
    #[serde(default = "DebuggerConfig::default_gdb")]
    pub gdb: PathBuf,

    #[serde(default = "DebuggerConfig::default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,

    /// How long gdb gets to exit after `-gdb-exit` before it is killed.
    #[serde(default = "DebuggerConfig::default_exit_grace_ms")]
    pub exit_grace_ms: u64,

    /// Capacity of each event channel between the backend and the viewer.
    #[serde(default = "DebuggerConfig::default_event_buffer")]
    pub event_buffer: usize,
}

impl DebuggerConfig {
    fn default_gdb() -> PathBuf {
        PathBuf::from("gdb")
    }

    fn default_reply_timeout_secs() -> u64 {
        30
    }

    fn default_exit_grace_ms() -> u64 {
        2_000
    }

    fn default_event_buffer() -> usize {
        1_024
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            gdb: Self::default_gdb(),
            reply_timeout_secs: Self::default_reply_timeout_secs(),
            exit_grace_ms: Self::default_exit_grace_ms(),
            event_buffer: Self::default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Extra directories whose files may be read through `/handle/file/get`.
    #[serde(default)]
    pub source_roots: Vec<PathBuf>,

    /// Toolchain/runtime root (system headers, runtime sources).
    #[serde(default)]
    pub toolchain_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Either a simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Append logs to the given file path (in addition to stderr).
    ///
    /// If the file cannot be opened, file logging is disabled.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Create the effective `EnvFilter`.
    ///
    /// If `RUST_LOG` is set, it is merged into the configured directives.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            file: None,
        }
    }
}

static TRACING_INIT: Once = Once::new();

/// Initializes structured `tracing` logging.
///
/// This function is safe to call multiple times; only the first call installs a
/// global subscriber.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let file = config.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

        let mut make_writer = BoxMakeWriter::new(std::io::stderr);
        if let Some(file) = file {
            let file = Arc::new(file);
            make_writer = BoxMakeWriter::new(make_writer.and(file));
        }

        let layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();
    });
}
