use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sshproxyplus",
    version,
    about = "Intercepting SSH proxy with session recording and live viewing"
)]
pub struct Cli {
    /// Path to configuration file (also settable via SSHPROXYPLUS_CONFIG env var)
    #[arg(short, long, default_value = "config.toml", env = "SSHPROXYPLUS_CONFIG")]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate configuration file
    CheckConfig,
    /// Run a single proxy with a default controller (no config file)
    QuickStart(QuickStart),
    /// Sign a command message and print the envelope
    Sign {
        /// Preshared key shared with the controller
        #[arg(long)]
        key: String,
        /// JSON command file (reads stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Sign a command message, send it to a controller and print the reply
    Send {
        /// Controller control socket (host:port)
        #[arg(long, default_value = "127.0.0.1:9999")]
        host: String,
        /// Preshared key shared with the controller
        #[arg(long)]
        key: String,
        /// Connect with TLS
        #[arg(long)]
        tls: bool,
        /// JSON command file (reads stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Print the controller export for the configuration
    Export,
}

#[derive(clap::Args, Debug, Clone)]
pub struct QuickStart {
    /// Destination SSH server port
    #[arg(long, default_value_t = 22)]
    pub dport: u16,
    /// Destination SSH server IP
    #[arg(long, default_value = "127.0.0.1")]
    pub dip: String,
    /// Proxy listen port
    #[arg(long, default_value_t = 2222)]
    pub lport: u16,
    /// IP for the proxy to bind to
    #[arg(long, default_value = "0.0.0.0")]
    pub lip: String,
    /// Host key file (generated when missing; in-memory when omitted)
    #[arg(long)]
    pub lkey: Option<PathBuf>,
    /// Directory to write sessions to
    #[arg(long, default_value = "html/sessions")]
    pub sess_dir: PathBuf,
    /// Override the client-supplied username towards the remote server
    #[arg(long, default_value = "")]
    pub override_user: String,
    /// Override the client-supplied password towards the remote server
    #[arg(long, default_value = "")]
    pub override_pass: String,
    /// Reject clients that do not match a configured user
    #[arg(long)]
    pub require_valid_password: bool,
    /// SSH server version string announced to clients
    #[arg(long, default_value = crate::proxy::DEFAULT_SERVER_VERSION)]
    pub server_version: String,
    /// Web server listen port
    #[arg(long, default_value_t = 8080)]
    pub web_port: u16,
    /// Allow listing and watching sessions without a viewer secret
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub public_access: bool,
    /// Serve static files for the web player from this directory
    #[arg(long)]
    pub web_dir: Option<PathBuf>,
}
