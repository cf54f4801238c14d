pub mod types;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use types::AppConfig;

use crate::transport::SocketType;

/// Maximum config file size (1 MB)
const MAX_CONFIG_SIZE: u64 = 1_048_576;

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("reading config metadata: {}", path.display()))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        anyhow::bail!(
            "config file too large: {} bytes (max {} bytes)",
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    check_config_file_permissions(path);

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    parse_config(&content)
}

/// On Unix, warn if the config file is readable by group or others,
/// since it carries the preshared key and upstream passwords.
#[cfg(unix)]
fn check_config_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:04o}", mode & 0o7777),
                    "Config file is readable by group/others. \
                     Consider restricting permissions to 0600."
                );
            }
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not check config file permissions"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_config_file_permissions(_path: &Path) {}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content).context("parsing TOML configuration")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate an already-constructed AppConfig (e.g. built by quick-start).
pub fn parse_config_validate(config: &AppConfig) -> Result<()> {
    validate_config(config)
}

fn validate_config(config: &AppConfig) -> Result<()> {
    validate_controller(config)?;
    validate_proxies(config)?;
    Ok(())
}

fn validate_controller(config: &AppConfig) -> Result<()> {
    let ctl = &config.controller;
    if ctl.preshared_key.is_empty() {
        anyhow::bail!("controller.preshared_key must not be empty");
    }
    ctl.socket_host
        .parse::<SocketAddr>()
        .with_context(|| format!("controller.socket_host: {}", ctl.socket_host))?;
    ctl.web_host
        .parse::<SocketAddr>()
        .with_context(|| format!("controller.web_host: {}", ctl.web_host))?;

    if matches!(ctl.socket_type, SocketType::Tls | SocketType::TlsWebsocket)
        && (ctl.tls_cert.is_none() || ctl.tls_key.is_none())
    {
        anyhow::bail!(
            "controller.socket_type '{}' requires tls_cert and tls_key",
            ctl.socket_type
        );
    }
    if ctl.tls_cert.is_some() != ctl.tls_key.is_some() {
        anyhow::bail!("controller.tls_cert and controller.tls_key must be set together");
    }
    Ok(())
}

fn validate_proxies(config: &AppConfig) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for (index, proxy) in config.proxies.iter().enumerate() {
        let cfg = &proxy.config;
        if !cfg.server_version.starts_with("SSH-2.0-") {
            anyhow::bail!(
                "proxies[{index}].server_version must start with 'SSH-2.0-' (got '{}')",
                cfg.server_version
            );
        }
        if cfg.listen_port == 0 {
            anyhow::bail!("proxies[{index}].listen_port must be > 0");
        }
        if !seen.insert((cfg.listen_ip.clone(), cfg.listen_port)) {
            anyhow::bail!(
                "proxies[{index}] listens on {}:{} which is already used by another proxy",
                cfg.listen_ip,
                cfg.listen_port
            );
        }
        for user in &proxy.users {
            if user.username.is_empty() {
                anyhow::bail!("proxies[{index}] has a user entry with an empty username");
            }
        }
    }
    Ok(())
}
