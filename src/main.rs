use anyhow::{Context, Result};
use clap::Parser;
use std::io::Read;
use std::path::Path;
use tracing::{error, info};

use sshproxyplus::cli::{Cli, Command, QuickStart};
use sshproxyplus::config;
use sshproxyplus::config::types::{AppConfig, BootstrapProxy, ControllerSection, LogFormat, LoggingConfig};
use sshproxyplus::controller::protocol::{ControlMessage, SignedEnvelope};
use sshproxyplus::proxy::ProxyConfig;
use sshproxyplus::transport::{tcp, SocketType};

fn setup_logging(level: &str, format: LogFormat) {
    sshproxyplus::logging::setup_logging(level, format);
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::CheckConfig) => {
            let cfg = config::load_config(&cli.config)?;
            println!("Configuration is valid.");
            println!("  Control socket: {} ({})", cfg.controller.socket_host, cfg.controller.socket_type);
            println!("  Web server:     {}", cfg.controller.web_host);
            if let Some(ref state) = cfg.controller.state_path {
                println!("  State file:     {}", state.display());
            }
            println!("  Proxies:        {}", cfg.proxies.len());
            for (i, p) in cfg.proxies.iter().enumerate() {
                println!(
                    "    [{i}] {} -> {} ({} users)",
                    p.config.listen_addr(),
                    p.config.default_remote_host(),
                    p.users.len()
                );
            }
            return Ok(());
        }
        Some(Command::QuickStart(args)) => {
            let app_config = build_quick_config(args);
            config::parse_config_validate(&app_config)?;

            eprintln!();
            eprintln!("=== sshproxyplus quick-start ===");
            eprintln!("  Proxy listen:   {}:{}", args.lip, args.lport);
            eprintln!("  Destination:    {}:{}", args.dip, args.dport);
            eprintln!("  Sessions:       {}", args.sess_dir.display());
            eprintln!("  Web server:     {}", app_config.controller.web_host);
            eprintln!("  Control socket: {}", app_config.controller.socket_host);
            eprintln!("  Preshared key:  {}", app_config.controller.preshared_key);
            eprintln!();

            let level = cli.log_level.clone().unwrap_or_else(|| "info".to_string());
            setup_logging(&level, app_config.logging.format);
            info!(version = env!("CARGO_PKG_VERSION"), "Starting sshproxyplus (quick-start)");
            return run_server(app_config);
        }
        Some(Command::Sign { key, input }) => {
            let envelope = sign_input(key, input.as_deref())?;
            println!("{}", String::from_utf8_lossy(&envelope.to_json()?));
            return Ok(());
        }
        Some(Command::Send { host, key, tls, input }) => {
            let envelope = sign_input(key, input.as_deref())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let mut client = tcp::connect(host, *tls).await?;
                client.send_line(&envelope.to_json()?).await?;
                match client.read_line().await? {
                    Some(reply) => println!("{}", String::from_utf8_lossy(&reply)),
                    None => anyhow::bail!("controller closed the connection without replying"),
                }
                Ok::<_, anyhow::Error>(())
            })?;
            return Ok(());
        }
        Some(Command::Export) => {
            let cfg = config::load_config(&cli.config)?;
            let host_key = sshproxyplus::ssh::keys::host_key_or_generate(cfg.controller.host_key_path.as_deref())?;
            let (controller, _) = sshproxyplus::server::build_controller(cfg, host_key)?;
            println!("{}", controller.export()?);
            return Ok(());
        }
        None => {}
    }

    let app_config = config::load_config(&cli.config)?;
    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| app_config.logging.level.to_string());
    setup_logging(&log_level, app_config.logging.format);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "Starting sshproxyplus"
    );
    run_server(app_config)
}

fn run_server(app_config: AppConfig) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if let Err(e) = sshproxyplus::server::run(app_config).await {
            error!(error = %e, "Server error");
            std::process::exit(1);
        }
    });
    Ok(())
}

/// Read a command message from `input` (or stdin) and sign it with `key`.
fn sign_input(key: &str, input: Option<&Path>) -> Result<SignedEnvelope> {
    let raw = match input {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };
    let message: ControlMessage = serde_json::from_slice(&raw).context("parsing command message")?;
    Ok(message.sign(key.as_bytes())?)
}

fn build_quick_config(args: &QuickStart) -> AppConfig {
    let proxy = ProxyConfig {
        default_remote_port: args.dport,
        default_remote_ip: args.dip.clone(),
        listen_ip: args.lip.clone(),
        listen_port: args.lport,
        session_folder: args.sess_dir.clone(),
        override_user: args.override_user.clone(),
        override_password: args.override_pass.clone(),
        web_listen_port: args.web_port,
        server_version: args.server_version.clone(),
        require_valid_password: args.require_valid_password,
        public_access: args.public_access,
        ..ProxyConfig::default()
    };
    AppConfig {
        controller: ControllerSection {
            socket_type: SocketType::Plain,
            socket_host: "127.0.0.1:9999".to_string(),
            preshared_key: sshproxyplus::utils::generate_secret(32),
            web_host: format!("0.0.0.0:{}", args.web_port),
            web_static_dir: args.web_dir.clone(),
            tls_cert: None,
            tls_key: None,
            base_uri: String::new(),
            host_key_path: args.lkey.clone(),
            state_path: None,
        },
        logging: LoggingConfig::default(),
        proxies: vec![BootstrapProxy {
            config: proxy,
            users: Vec::new(),
            start: true,
            activate: true,
        }],
    }
}
