#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{Auth, Msg, Session as SshSession};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use sshproxyplus::controller::{Controller, ControllerSettings};
use sshproxyplus::proxy::{Proxy, ProxyConfig, ProxyUser};
use sshproxyplus::session::Session;
use sshproxyplus::transport::SocketType;

pub const PSK: &str = "e2e-psk";
pub const UPSTREAM_USER: &str = "root";
pub const UPSTREAM_PASS: &str = "upstream-pass";
pub const WAIT: Duration = Duration::from_secs(5);
/// Port the echo upstream reports for a `tcpip-forward` on port 0.
pub const FORWARD_PORT: u32 = 4242;

/// Get an OS-assigned free port
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn host_key() -> PrivateKey {
    PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap()
}

/// Poll `check` until it holds or five seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    check()
}

// ---------------------------------------------------------------------------
// Upstream SSH server: echoes shell input, answers exec with "ran: <cmd>"
// ---------------------------------------------------------------------------

pub struct EchoHandler;

impl russh::server::Handler for EchoHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == UPSTREAM_USER && password == UPSTREAM_PASS {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut SshSession) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        let mut out = b"ran: ".to_vec();
        out.extend_from_slice(data);
        out.push(b'\n');
        let _ = session.data(channel, CryptoVec::from_slice(&out));
        let _ = session.exit_status_request(channel, 0);
        let _ = session.eof(channel);
        let _ = session.close(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    /// Only loopback forwards are allowed; port 0 binds to 4242.
    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, _session: &mut SshSession) -> Result<bool, Self::Error> {
        if address != "127.0.0.1" {
            return Ok(false);
        }
        if *port == 0 {
            *port = FORWARD_PORT;
        }
        Ok(true)
    }

    async fn cancel_tcpip_forward(&mut self, _address: &str, _port: u32, _session: &mut SshSession) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut SshSession) -> Result<(), Self::Error> {
        let _ = session.data(channel, CryptoVec::from_slice(data));
        Ok(())
    }
}

struct EchoServer;

impl russh::server::Server for EchoServer {
    type Handler = EchoHandler;

    fn new_client(&mut self, _peer_addr: Option<std::net::SocketAddr>) -> EchoHandler {
        EchoHandler
    }
}

/// Start the echo upstream and return its port.
pub async fn start_upstream() -> (u16, tokio::task::JoinHandle<()>) {
    let port = free_port().await;
    let mut config = russh::server::Config::default();
    config.keys.push(host_key());
    config.auth_rejection_time = Duration::from_millis(100);
    config.auth_rejection_time_initial = Some(Duration::from_millis(0));
    let config = Arc::new(config);

    let addr = format!("127.0.0.1:{port}");
    let task = tokio::spawn(async move {
        use russh::server::Server as _;
        let mut server = EchoServer;
        let _ = server.run_on_address(config, &addr as &str).await;
    });

    for _ in 0..50 {
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{port}")).await.is_ok() {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    (port, task)
}

// ---------------------------------------------------------------------------
// Proxy under test
// ---------------------------------------------------------------------------

/// A started, active proxy with user `alice`/`pw` mapped onto the upstream.
pub async fn start_proxy(upstream_port: u16, session_dir: &Path) -> Arc<Proxy> {
    let config = ProxyConfig {
        listen_ip: "127.0.0.1".into(),
        listen_port: 0,
        default_remote_ip: "127.0.0.1".into(),
        default_remote_port: upstream_port,
        session_folder: session_dir.to_path_buf(),
        ..ProxyConfig::default()
    };
    let proxy = Arc::new(Proxy::new(config, host_key()));
    proxy
        .add_user(ProxyUser::new(
            "alice",
            "pw",
            &format!("127.0.0.1:{upstream_port}"),
            UPSTREAM_USER,
            UPSTREAM_PASS,
        ))
        .unwrap();
    proxy.activate();
    proxy.start().await.unwrap();
    proxy
}

pub fn proxy_addr(proxy: &Proxy) -> String {
    proxy.local_addr().unwrap().to_string()
}

/// Minimal russh client handler for testing
pub struct TestClientHandler;

impl russh::client::Handler for TestClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &russh::keys::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub type ClientHandle = russh::client::Handle<TestClientHandler>;

/// Connect and log in; `None` when the proxy rejects the credentials.
pub async fn ssh_login(addr: &str, username: &str, password: &str) -> Option<ClientHandle> {
    let config = Arc::new(russh::client::Config::default());
    let mut handle = russh::client::connect(config, addr, TestClientHandler).await.unwrap();
    let auth = timeout(WAIT, handle.authenticate_password(username, password))
        .await
        .expect("auth timed out")
        .unwrap();
    auth.success().then_some(handle)
}

/// Run `command` through `handle`, returning stdout and the exit status.
pub async fn ssh_exec(handle: &ClientHandle, command: &str) -> (Vec<u8>, Option<u32>) {
    let mut channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, command).await.unwrap();
    let mut output = Vec::new();
    let mut status = None;
    loop {
        let msg = timeout(WAIT, channel.wait()).await.expect("exec timed out");
        match msg {
            Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status }) => status = Some(exit_status),
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    (output, status)
}

/// A session registered on `proxy` without a live connection behind it.
pub fn fake_session(proxy: &Proxy, key: &str, username: &str, password: &str, log_dir: &Path) -> Arc<Session> {
    let user = proxy
        .user(&sshproxyplus::proxy::user_key(username, password))
        .unwrap_or_else(|| Arc::new(ProxyUser::new(username, password, "", "", "")));
    let session = Session::new(sshproxyplus::session::SessionParams {
        key,
        client_host: "127.0.0.1:50000",
        server_host: "127.0.0.1:22",
        client_username: username,
        client_password: password,
        user,
        log_dir,
        close: tokio_util::sync::CancellationToken::new(),
    });
    session.begin();
    proxy.register_session(session.clone());
    session
}

// ---------------------------------------------------------------------------
// Controller and TLS material
// ---------------------------------------------------------------------------

pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Self-signed certificate for `localhost` and 127.0.0.1 written into `dir`.
pub fn self_signed(dir: &Path) -> TlsPaths {
    let certified =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    let cert = dir.join("cert.pem");
    let key = dir.join("key.pem");
    std::fs::write(&cert, certified.cert.pem()).unwrap();
    std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();
    TlsPaths { cert, key }
}

pub fn controller_settings(socket_type: SocketType, tls: Option<&TlsPaths>) -> ControllerSettings {
    ControllerSettings {
        socket_type,
        socket_host: "127.0.0.1:0".into(),
        preshared_key: PSK.into(),
        web_host: "127.0.0.1:0".into(),
        tls_cert: tls.map(|t| t.cert.display().to_string()).unwrap_or_default(),
        tls_key: tls.map(|t| t.key.display().to_string()).unwrap_or_default(),
        ..ControllerSettings::default()
    }
}

pub fn new_controller(settings: ControllerSettings) -> Arc<Controller> {
    Arc::new(Controller::new(settings, host_key()))
}

// ---------------------------------------------------------------------------
// WebSocket client
// ---------------------------------------------------------------------------

pub async fn ws_send<S>(ws: &mut WebSocketStream<S>, text: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next text frame within five seconds.
pub async fn ws_recv<S>(ws: &mut WebSocketStream<S>) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("websocket receive timed out")
            .expect("websocket closed")
            .unwrap();
        match msg {
            Message::Text(text) => return text,
            Message::Binary(data) => return String::from_utf8(data).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
