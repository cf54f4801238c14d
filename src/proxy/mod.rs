pub mod server;
pub mod user;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ControlError, ControlResult};
use crate::session::registry::SessionRegistry;
use crate::session::Session;
use crate::viewer::SessionViewer;

pub use user::{user_key, ChannelContext, ChannelFilter, EventCallback, ProxyUser};

/// Static settings of one proxy listener. Field names follow the control
/// protocol's JSON; snake_case aliases are accepted for the TOML config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    #[serde(rename = "DefaultRemotePort", alias = "default_remote_port")]
    pub default_remote_port: u16,
    #[serde(rename = "DefaultRemoteIP", alias = "default_remote_ip")]
    pub default_remote_ip: String,
    #[serde(rename = "ListenIP", alias = "listen_ip")]
    pub listen_ip: String,
    #[serde(rename = "ListenPort", alias = "listen_port")]
    pub listen_port: u16,
    #[serde(rename = "SessionFolder", alias = "session_folder")]
    pub session_folder: PathBuf,
    #[serde(rename = "TLSCert", alias = "tls_cert")]
    pub tls_cert: String,
    #[serde(rename = "TLSKey", alias = "tls_key")]
    pub tls_key: String,
    #[serde(rename = "OverridePassword", alias = "override_password")]
    pub override_password: String,
    #[serde(rename = "OverrideUser", alias = "override_user")]
    pub override_user: String,
    #[serde(rename = "WebListenPort", alias = "web_listen_port")]
    pub web_listen_port: u16,
    #[serde(rename = "ServerVersion", alias = "server_version")]
    pub server_version: String,
    #[serde(rename = "RequireValidPassword", alias = "require_valid_password")]
    pub require_valid_password: bool,
    #[serde(rename = "PublicAccess", alias = "public_access")]
    pub public_access: bool,
    #[serde(rename = "BaseURI", alias = "base_uri")]
    pub base_uri: String,
}

pub const DEFAULT_SERVER_VERSION: &str = "SSH-2.0-OpenSSH_7.9p1 Raspbian-10";

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_remote_port: 22,
            default_remote_ip: "127.0.0.1".to_string(),
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 2222,
            session_folder: PathBuf::from("html/sessions"),
            tls_cert: String::new(),
            tls_key: String::new(),
            override_password: String::new(),
            override_user: String::new(),
            web_listen_port: 8080,
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            require_valid_password: false,
            public_access: true,
            base_uri: String::new(),
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_ip, self.listen_port)
    }

    pub fn default_remote_host(&self) -> String {
        format!("{}:{}", self.default_remote_ip, self.default_remote_port)
    }
}

/// One listening SSH proxy: its users, live sessions and viewers.
///
/// `running` tracks the listener; `active` gates relaying. An authenticated
/// connection on an inactive proxy waits until the proxy is activated.
pub struct Proxy {
    config: ProxyConfig,
    host_key: PrivateKey,
    users: Mutex<BTreeMap<String, Arc<ProxyUser>>>,
    viewers: Mutex<BTreeMap<String, Arc<SessionViewer>>>,
    sessions: Mutex<SessionRegistry>,
    active: AtomicBool,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("listen", &self.config.listen_addr())
            .field("active", &self.is_active())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Proxy {
    pub fn new(config: ProxyConfig, host_key: PrivateKey) -> Self {
        Self {
            config,
            host_key,
            users: Mutex::new(BTreeMap::new()),
            viewers: Mutex::new(BTreeMap::new()),
            sessions: Mutex::new(SessionRegistry::default()),
            active: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Rebuild a proxy from its JSON form. Users are re-keyed and each
    /// viewer is re-linked to the registered user it names, if any.
    pub fn from_json(data: &[u8], host_key: PrivateKey) -> Result<Self, serde_json::Error> {
        let snapshot: ProxySnapshot = serde_json::from_slice(data)?;
        let proxy = Self::new(snapshot.config, host_key);
        {
            let mut users = proxy.users.lock();
            for user in snapshot.users.unwrap_or_default().into_values() {
                users.insert(user.key(), Arc::new(user));
            }
        }
        {
            let users = proxy.users.lock();
            let mut viewers = proxy.viewers.lock();
            for (secret, mut viewer) in snapshot.viewers.unwrap_or_default() {
                if let Some(user) = users.get(&viewer.user.key()) {
                    viewer.user = user.clone();
                }
                viewers.insert(secret, Arc::new(viewer));
            }
        }
        Ok(proxy)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn host_key(&self) -> &PrivateKey {
        &self.host_key
    }

    pub fn session_folder(&self) -> &Path {
        &self.config.session_folder
    }

    pub fn public_access(&self) -> bool {
        self.config.public_access
    }

    pub fn base_uri(&self) -> &str {
        &self.config.base_uri
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    // --- users ---

    /// Resolve client credentials to a user.
    ///
    /// Order: the exact `username:password` entry, then the `username:`
    /// wildcard entry. With no users configured, or when a valid password
    /// is not required, a default user targeting the default remote host
    /// is synthesized from the credentials and the override user/password.
    pub fn authenticate(&self, username: &str, password: &str) -> ControlResult<Arc<ProxyUser>> {
        let users = self.users.lock();
        if let Some(user) = users.get(&user_key(username, password)) {
            return Ok(user.clone());
        }
        if let Some(user) = users.get(&user_key(username, "")) {
            return Ok(user.clone());
        }
        if users.is_empty() || !self.config.require_valid_password {
            return Ok(Arc::new(self.default_user(username, password)));
        }
        Err(ControlError::InvalidCredentials(username.to_string()))
    }

    fn default_user(&self, username: &str, password: &str) -> ProxyUser {
        let pick = |over: &str, given: &str| {
            if over.is_empty() { given.to_string() } else { over.to_string() }
        };
        ProxyUser::new(
            username,
            password,
            self.config.default_remote_host(),
            pick(&self.config.override_user, username),
            pick(&self.config.override_password, password),
        )
    }

    /// Upstream address for `user`, falling back to the default remote.
    pub fn remote_host_for(&self, user: &ProxyUser) -> String {
        if user.remote_host.is_empty() {
            self.config.default_remote_host()
        } else {
            user.remote_host.clone()
        }
    }

    /// Register `user` and return its key.
    pub fn add_user(&self, user: ProxyUser) -> ControlResult<String> {
        let key = user.key();
        let mut users = self.users.lock();
        if users.contains_key(&key) {
            return Err(ControlError::UserExists(key));
        }
        users.insert(key.clone(), Arc::new(user));
        debug!(user = %key, "Proxy user added");
        Ok(key)
    }

    pub fn remove_user(&self, username: &str, password: &str) -> ControlResult<Arc<ProxyUser>> {
        let key = user_key(username, password);
        self.users
            .lock()
            .remove(&key)
            .ok_or(ControlError::UserNotFound(key))
    }

    pub fn user(&self, key: &str) -> Option<Arc<ProxyUser>> {
        self.users.lock().get(key).cloned()
    }

    pub fn user_by_username(&self, username: &str) -> Option<Arc<ProxyUser>> {
        self.users
            .lock()
            .values()
            .find(|u| u.username == username)
            .cloned()
    }

    pub fn users(&self) -> Vec<Arc<ProxyUser>> {
        self.users.lock().values().cloned().collect()
    }

    // --- sessions ---

    pub fn register_session(&self, session: Arc<Session>) {
        self.sessions.lock().register(session);
    }

    pub fn session(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(key)
    }

    /// Every session seen by this proxy, sorted by key.
    pub fn sessions(&self) -> Vec<(String, Arc<Session>)> {
        self.sessions.lock().sessions()
    }

    pub fn active_sessions(&self) -> Vec<(String, Arc<Session>)> {
        self.sessions()
            .into_iter()
            .filter(|(_, s)| s.is_active())
            .collect()
    }

    // --- viewers ---

    fn insert_viewer(&self, viewer: SessionViewer) -> Arc<SessionViewer> {
        let viewer = Arc::new(viewer);
        self.viewers
            .lock()
            .insert(viewer.secret.clone(), viewer.clone());
        viewer
    }

    /// New list viewer over every session of the user named `username`.
    pub fn create_user_viewer(&self, username: &str) -> ControlResult<Arc<SessionViewer>> {
        let user = self
            .user_by_username(username)
            .ok_or_else(|| ControlError::UserNotFound(username.to_string()))?;
        Ok(self.insert_viewer(SessionViewer::for_user(user)))
    }

    /// New single-session viewer. The session does not have to exist yet.
    pub fn create_session_viewer(&self, username: &str, session_key: &str) -> ControlResult<Arc<SessionViewer>> {
        let user = self
            .user_by_username(username)
            .ok_or_else(|| ControlError::UserNotFound(username.to_string()))?;
        Ok(self.insert_viewer(SessionViewer::for_session(user, session_key)))
    }

    /// Viewer for `secret`. Expired viewers are dropped on access.
    pub fn viewer(&self, secret: &str) -> ControlResult<Arc<SessionViewer>> {
        let mut viewers = self.viewers.lock();
        match viewers.get(secret) {
            Some(v) if v.is_expired() => {
                viewers.remove(secret);
                Err(ControlError::ViewerNotFound)
            }
            Some(v) => Ok(v.clone()),
            None => Err(ControlError::ViewerNotFound),
        }
    }

    fn find_viewers(&self, pred: impl Fn(&SessionViewer) -> bool) -> Vec<Arc<SessionViewer>> {
        self.viewers
            .lock()
            .values()
            .filter(|v| !v.is_expired() && pred(v))
            .cloned()
            .collect()
    }

    pub fn viewer_by_session_key(&self, session_key: &str) -> ControlResult<Arc<SessionViewer>> {
        self.viewers_by_session_key(session_key)
            .into_iter()
            .next()
            .ok_or(ControlError::ViewerNotFound)
    }

    pub fn viewer_by_username(&self, username: &str) -> ControlResult<Arc<SessionViewer>> {
        self.viewers_by_username(username)
            .into_iter()
            .next()
            .ok_or(ControlError::ViewerNotFound)
    }

    pub fn viewers_by_session_key(&self, session_key: &str) -> Vec<Arc<SessionViewer>> {
        self.find_viewers(|v| v.session_key == session_key)
    }

    pub fn viewers_by_username(&self, username: &str) -> Vec<Arc<SessionViewer>> {
        self.find_viewers(|v| v.user.username == username)
    }

    pub fn viewers(&self) -> Vec<Arc<SessionViewer>> {
        self.find_viewers(|_| true)
    }

    pub fn remove_viewer(&self, secret: &str) -> ControlResult<()> {
        self.viewers
            .lock()
            .remove(secret)
            .map(|_| ())
            .ok_or(ControlError::ViewerNotFound)
    }

    /// Sessions visible through the viewer holding `secret`.
    pub fn viewer_sessions(&self, secret: &str) -> ControlResult<Vec<(String, Arc<Session>)>> {
        let viewer = self.viewer(secret)?;
        Ok(viewer.sessions(&self.sessions.lock()))
    }

    // --- lifecycle ---

    /// Bind the listener and start accepting connections.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("proxy on {} is already running", self.config.listen_addr());
        }
        let listen = self.config.listen_addr();
        let listener = match tokio::net::TcpListener::bind(&listen).await {
            Ok(l) => l,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e).with_context(|| format!("binding proxy listener on {listen}"));
            }
        };
        let addr = listener.local_addr().context("reading listener address")?;
        *self.local_addr.lock() = Some(addr);

        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());

        info!(listen = %addr, upstream = %self.config.default_remote_host(), "SSH proxy listening");
        // `running` is owned by start/stop; the accept task only serves.
        tokio::spawn(server::serve(self.clone(), listener, token));
        Ok(())
    }

    /// Stop listening, drop every connection and end every session.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        *self.local_addr.lock() = None;
        let sessions = self.active_sessions();
        for (_, session) in &sessions {
            session.end();
        }
        info!(listen = %self.config.listen_addr(), sessions = sessions.len(), "SSH proxy stopped");
    }
}

impl Serialize for Proxy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ProxySnapshotRef {
            config: &self.config,
            users: self.users.lock().clone(),
            viewers: self.viewers.lock().clone(),
        }
        .serialize(serializer)
    }
}

#[derive(Serialize)]
struct ProxySnapshotRef<'a> {
    #[serde(flatten)]
    config: &'a ProxyConfig,
    #[serde(rename = "Users")]
    users: BTreeMap<String, Arc<ProxyUser>>,
    #[serde(rename = "Viewers")]
    viewers: BTreeMap<String, Arc<SessionViewer>>,
}

#[derive(Deserialize)]
struct ProxySnapshot {
    #[serde(flatten)]
    config: ProxyConfig,
    #[serde(rename = "Users", alias = "users", default)]
    users: Option<BTreeMap<String, ProxyUser>>,
    #[serde(rename = "Viewers", alias = "viewers", default)]
    viewers: Option<BTreeMap<String, SessionViewer>>,
}
