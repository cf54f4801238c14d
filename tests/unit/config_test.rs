use sshproxyplus::config;
use sshproxyplus::config::types::{LogFormat, LogLevel};
use sshproxyplus::transport::SocketType;
use std::io::Write;

const MINIMAL: &str = r##"
[controller]
preshared_key = "k3y"
"##;

#[test]
fn test_minimal_config_defaults() {
    let cfg = config::parse_config(MINIMAL).unwrap();
    assert_eq!(cfg.controller.socket_type, SocketType::Plain);
    assert_eq!(cfg.controller.socket_host, "127.0.0.1:9999");
    assert_eq!(cfg.controller.web_host, "0.0.0.0:8080");
    assert!(cfg.controller.state_path.is_none());
    assert_eq!(cfg.logging.level, LogLevel::Info);
    assert_eq!(cfg.logging.format, LogFormat::Pretty);
    assert!(cfg.proxies.is_empty());
}

#[test]
fn test_bootstrap_proxy_snake_case_fields() {
    let toml = r##"
[controller]
preshared_key = "k3y"
socket_type = "plain-websocket"

[logging]
level = "debug"
format = "json"

[[proxies]]
listen_ip = "127.0.0.1"
listen_port = 2022
default_remote_ip = "10.0.0.5"
default_remote_port = 2200
session_folder = "/tmp/sessions"
require_valid_password = true
public_access = false
activate = false

[[proxies.users]]
username = "alice"
password = "pw"
remote_host = "10.0.0.6:22"
remote_username = "root"
remote_password = "toor"
"##;
    let cfg = config::parse_config(toml).unwrap();
    assert_eq!(cfg.controller.socket_type, SocketType::PlainWebsocket);
    assert_eq!(cfg.logging.level, LogLevel::Debug);
    assert_eq!(cfg.logging.format, LogFormat::Json);

    let proxy = &cfg.proxies[0];
    assert_eq!(proxy.config.listen_addr(), "127.0.0.1:2022");
    assert_eq!(proxy.config.default_remote_host(), "10.0.0.5:2200");
    assert!(proxy.config.require_valid_password);
    assert!(!proxy.config.public_access);
    assert_eq!(proxy.config.server_version, "SSH-2.0-OpenSSH_7.9p1 Raspbian-10");
    assert!(proxy.start);
    assert!(!proxy.activate);
    assert_eq!(proxy.users.len(), 1);
    assert_eq!(proxy.users[0].key(), "alice:pw");
    assert_eq!(proxy.users[0].remote_username, "root");
}

#[test]
fn test_empty_preshared_key_rejected() {
    let toml = r##"
[controller]
preshared_key = ""
"##;
    let err = config::parse_config(toml).unwrap_err();
    assert!(err.to_string().contains("preshared_key"));
}

#[test]
fn test_tls_socket_requires_cert_and_key() {
    let toml = r##"
[controller]
preshared_key = "k"
socket_type = "tls"
"##;
    let err = config::parse_config(toml).unwrap_err();
    assert!(err.to_string().contains("requires tls_cert and tls_key"));

    let toml = r##"
[controller]
preshared_key = "k"
socket_type = "tls-websocket"
tls_cert = "/etc/cert.pem"
tls_key = "/etc/key.pem"
"##;
    let cfg = config::parse_config(toml).unwrap();
    assert_eq!(cfg.controller.socket_type, SocketType::TlsWebsocket);
}

#[test]
fn test_unparsable_hosts_rejected() {
    let toml = r##"
[controller]
preshared_key = "k"
socket_host = "not-a-host"
"##;
    assert!(config::parse_config(toml).is_err());

    let toml = r##"
[controller]
preshared_key = "k"
web_host = "localhost"
"##;
    assert!(config::parse_config(toml).is_err());
}

#[test]
fn test_server_version_must_be_ssh2() {
    let toml = r##"
[controller]
preshared_key = "k"

[[proxies]]
server_version = "OpenSSH_9.0"
"##;
    let err = config::parse_config(toml).unwrap_err();
    assert!(err.to_string().contains("SSH-2.0-"));
}

#[test]
fn test_duplicate_listeners_rejected() {
    let toml = r##"
[controller]
preshared_key = "k"

[[proxies]]
listen_port = 2222

[[proxies]]
listen_port = 2222
"##;
    let err = config::parse_config(toml).unwrap_err();
    assert!(err.to_string().contains("already used"));
}

#[test]
fn test_load_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(MINIMAL.as_bytes()).unwrap();
    let cfg = config::load_config(file.path()).unwrap();
    assert_eq!(cfg.controller.preshared_key, "k3y");
}

#[test]
fn test_load_config_missing_file() {
    let err = config::load_config(std::path::Path::new("/nonexistent/sshproxyplus.toml")).unwrap_err();
    assert!(err.to_string().contains("reading config metadata"));
}

#[test]
fn test_load_config_too_large() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(MINIMAL.as_bytes()).unwrap();
    file.write_all(&vec![b'#'; 1_100_000]).unwrap();
    let err = config::load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("too large"));
}
