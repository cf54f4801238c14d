//! Process-level wiring: build the controller from the config (or from a
//! saved export), bring its sockets and proxies up, and tear it all down on
//! a termination signal.

use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::types::AppConfig;
use crate::controller::{Controller, ControllerSettings};
use crate::proxy::Proxy;
use crate::ssh::keys;

/// What to do with one registered proxy once the controller is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPlan {
    pub id: u64,
    pub start: bool,
    pub activate: bool,
}

/// Build the controller. A saved export at `state_path` wins over the
/// `[[proxies]]` entries; restored proxies are all started and activated.
pub fn build_controller(config: AppConfig, host_key: PrivateKey) -> Result<(Controller, Vec<ProxyPlan>)> {
    if let Some(path) = config.controller.state_path.as_deref().filter(|p| p.exists()) {
        let data = std::fs::read(path).with_context(|| format!("reading state: {}", path.display()))?;
        let controller = Controller::import(&data, host_key)?;
        let plan = controller
            .proxy_ids()
            .into_iter()
            .map(|id| ProxyPlan {
                id,
                start: true,
                activate: true,
            })
            .collect();
        info!(path = %path.display(), proxies = controller.proxy_ids().len(), "Controller state restored");
        return Ok((controller, plan));
    }

    let controller = Controller::new(ControllerSettings::from(&config.controller), host_key);
    let mut plan = Vec::with_capacity(config.proxies.len());
    for entry in config.proxies {
        let proxy = Proxy::new(entry.config, controller.host_key().clone());
        for user in entry.users {
            proxy.add_user(user)?;
        }
        let id = controller.add_existing_proxy(Arc::new(proxy));
        plan.push(ProxyPlan {
            id,
            start: entry.start,
            activate: entry.activate,
        });
    }
    Ok((controller, plan))
}

/// Addresses bound by [`bring_up`].
#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    pub control: SocketAddr,
    pub web: SocketAddr,
}

/// Open the control socket and the web server, then start and activate
/// proxies per `plan`. A proxy that fails to start is logged and skipped.
pub async fn bring_up(controller: &Arc<Controller>, plan: &[ProxyPlan]) -> Result<Endpoints> {
    let control = controller.listen().await?;
    let web = controller.start_web_server().await?;
    for p in plan {
        if p.start {
            if let Err(e) = controller.start_proxy(p.id).await {
                error!(proxy_id = p.id, error = %e, "Proxy failed to start");
                continue;
            }
        }
        if p.activate {
            controller.activate_proxy(p.id)?;
        }
    }
    Ok(Endpoints { control, web })
}

/// Run until SIGINT/SIGTERM, then save state and stop everything.
pub async fn run(config: AppConfig) -> Result<()> {
    let host_key = keys::host_key_or_generate(config.controller.host_key_path.as_deref())?;
    info!(fingerprint = %keys::fingerprint(&host_key), "Host key ready");
    let state_path = config.controller.state_path.clone();

    let (controller, plan) = build_controller(config, host_key)?;
    let controller = Arc::new(controller);
    let endpoints = bring_up(&controller, &plan).await?;
    info!(
        control = %endpoints.control,
        web = %endpoints.web,
        proxies = plan.len(),
        "sshproxyplus running"
    );

    wait_for_shutdown().await;
    info!("Shutdown requested");

    if let Some(path) = state_path {
        match controller.export() {
            Ok(json) => {
                if let Err(e) = save_state(&path, &json) {
                    warn!(path = %path.display(), error = %e, "Failed to save controller state");
                } else {
                    info!(path = %path.display(), "Controller state saved");
                }
            }
            Err(e) => warn!(error = %e, "Failed to export controller state"),
        }
    }
    controller.stop();
    Ok(())
}

/// Write through a temporary file and rename, so a crash never leaves a
/// truncated export. The file is 0600 since it holds credentials.
pub fn save_state(path: &Path, json: &str) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp_path, path)
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
