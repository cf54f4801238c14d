use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::proxy::{ProxyConfig, ProxyUser};
use crate::transport::SocketType;

/// Log level enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Log format enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AppConfig {
    pub controller: ControllerSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub proxies: Vec<BootstrapProxy>,
}

/// `[controller]` section: control socket, web server and persistence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerSection {
    #[serde(default)]
    pub socket_type: SocketType,
    #[serde(default = "default_socket_host")]
    pub socket_host: String,
    pub preshared_key: String,
    #[serde(default = "default_web_host")]
    pub web_host: String,
    #[serde(default)]
    pub web_static_dir: Option<PathBuf>,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default)]
    pub base_uri: String,
    /// PEM host key shared by every proxy; generated in memory when unset.
    #[serde(default)]
    pub host_key_path: Option<PathBuf>,
    /// JSON export written on shutdown and restored on startup.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

/// `[[proxies]]` entry created when the controller boots without saved state.
#[derive(Debug, Deserialize, Serialize)]
pub struct BootstrapProxy {
    #[serde(flatten)]
    pub config: ProxyConfig,
    #[serde(default)]
    pub users: Vec<ProxyUser>,
    #[serde(default = "default_true")]
    pub start: bool,
    #[serde(default = "default_true")]
    pub activate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_socket_host() -> String {
    "127.0.0.1:9999".to_string()
}

fn default_web_host() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}
