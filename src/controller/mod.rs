pub mod dispatch;
pub mod protocol;

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callbacks::CallbackDispatcher;
use crate::config::types::ControllerSection;
use crate::error::{ControlError, ControlResult};
use crate::proxy::{user_key, ChannelFilter, EventCallback, Proxy, ProxyUser};
use crate::transport::{self, socket_type_code, ClientHandler, ControlClient, ControlTransport, SocketType, TlsFiles};
use crate::utils::generate_correlation_id;
use crate::viewer::SessionViewer;
use crate::web;
use protocol::{ControlReply, SignedEnvelope};

/// Controller-wide settings, exported alongside the proxies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(rename = "SocketType", with = "socket_type_code", default)]
    pub socket_type: SocketType,
    #[serde(rename = "SocketHost", default)]
    pub socket_host: String,
    #[serde(rename = "PresharedKey", default)]
    pub preshared_key: String,
    #[serde(rename = "WebHost", default)]
    pub web_host: String,
    #[serde(rename = "WebStaticDir", default)]
    pub web_static_dir: String,
    #[serde(rename = "TLSCert", default)]
    pub tls_cert: String,
    #[serde(rename = "TLSKey", default)]
    pub tls_key: String,
    #[serde(rename = "BaseURI", default)]
    pub base_uri: String,
}

fn path_of(s: &str) -> Option<&Path> {
    (!s.is_empty()).then(|| Path::new(s))
}

fn path_string(p: &Option<std::path::PathBuf>) -> String {
    p.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
}

impl From<&ControllerSection> for ControllerSettings {
    fn from(section: &ControllerSection) -> Self {
        Self {
            socket_type: section.socket_type,
            socket_host: section.socket_host.clone(),
            preshared_key: section.preshared_key.clone(),
            web_host: section.web_host.clone(),
            web_static_dir: path_string(&section.web_static_dir),
            tls_cert: path_string(&section.tls_cert),
            tls_key: path_string(&section.tls_key),
            base_uri: section.base_uri.clone(),
        }
    }
}

impl ControllerSettings {
    pub fn tls_files(&self) -> TlsFiles<'_> {
        TlsFiles {
            cert: path_of(&self.tls_cert),
            key: path_of(&self.tls_key),
        }
    }

    /// The web server uses TLS only when both files are configured.
    pub fn web_uses_tls(&self) -> bool {
        !self.tls_cert.is_empty() && !self.tls_key.is_empty()
    }

    pub fn static_dir(&self) -> Option<&Path> {
        path_of(&self.web_static_dir)
    }
}

struct Registry {
    proxies: BTreeMap<u64, Arc<Proxy>>,
    counter: u64,
}

/// Which proxy user a filter or callback key belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HookOwner {
    proxy_id: u64,
    user_key: String,
}

/// Registry of proxies keyed by a never-reused counter, plus the control
/// socket and web server that drive them.
pub struct Controller {
    settings: ControllerSettings,
    host_key: PrivateKey,
    registry: Mutex<Registry>,
    filters: Mutex<HashMap<String, HookOwner>>,
    callbacks: Mutex<HashMap<String, HookOwner>>,
    dispatcher: CallbackDispatcher,
    transport: Mutex<Option<Box<dyn ControlTransport>>>,
    web_stop: Mutex<Option<CancellationToken>>,
}

impl Controller {
    pub fn new(settings: ControllerSettings, host_key: PrivateKey) -> Self {
        let dispatcher = CallbackDispatcher::new(Some(settings.preshared_key.clone()));
        Self {
            settings,
            host_key,
            registry: Mutex::new(Registry {
                proxies: BTreeMap::new(),
                counter: 0,
            }),
            filters: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            dispatcher,
            transport: Mutex::new(None),
            web_stop: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn host_key(&self) -> &PrivateKey {
        &self.host_key
    }

    pub fn dispatcher(&self) -> &CallbackDispatcher {
        &self.dispatcher
    }

    pub fn proxy_counter(&self) -> u64 {
        self.registry.lock().counter
    }

    /// Next ID to hand out. Never lower it below an ID already in use.
    pub fn set_proxy_counter(&self, counter: u64) {
        self.registry.lock().counter = counter;
    }

    // --- proxy registry ---

    pub fn add_existing_proxy(&self, proxy: Arc<Proxy>) -> u64 {
        let mut reg = self.registry.lock();
        let id = reg.counter;
        reg.counter += 1;
        reg.proxies.insert(id, proxy);
        debug!(proxy_id = id, "Proxy registered");
        id
    }

    /// Create a proxy from its JSON form, using the controller's host key.
    pub fn add_proxy_from_json(&self, data: &[u8]) -> ControlResult<u64> {
        let proxy = Proxy::from_json(data, self.host_key.clone())?;
        Ok(self.add_existing_proxy(Arc::new(proxy)))
    }

    pub fn get_proxy(&self, proxy_id: u64) -> ControlResult<Arc<Proxy>> {
        self.registry
            .lock()
            .proxies
            .get(&proxy_id)
            .cloned()
            .ok_or(ControlError::ProxyNotFound(proxy_id))
    }

    pub fn proxies(&self) -> BTreeMap<u64, Arc<Proxy>> {
        self.registry.lock().proxies.clone()
    }

    pub fn proxy_ids(&self) -> Vec<u64> {
        self.registry.lock().proxies.keys().copied().collect()
    }

    pub async fn start_proxy(&self, proxy_id: u64) -> ControlResult<()> {
        let proxy = self.get_proxy(proxy_id)?;
        if proxy.is_running() {
            return Err(ControlError::AlreadyRunning(proxy_id));
        }
        proxy.start().await?;
        info!(proxy_id, "Proxy started");
        Ok(())
    }

    pub fn stop_proxy(&self, proxy_id: u64) -> ControlResult<()> {
        self.get_proxy(proxy_id)?.stop();
        Ok(())
    }

    /// Stop the proxy and drop it. Its ID is not reused.
    pub fn destroy_proxy(&self, proxy_id: u64) -> ControlResult<()> {
        let proxy = self
            .registry
            .lock()
            .proxies
            .remove(&proxy_id)
            .ok_or(ControlError::ProxyNotFound(proxy_id))?;
        if proxy.is_running() {
            proxy.stop();
        }
        self.filters.lock().retain(|_, o| o.proxy_id != proxy_id);
        self.callbacks.lock().retain(|_, o| o.proxy_id != proxy_id);
        info!(proxy_id, "Proxy destroyed");
        Ok(())
    }

    pub fn activate_proxy(&self, proxy_id: u64) -> ControlResult<()> {
        self.get_proxy(proxy_id)?.activate();
        Ok(())
    }

    pub fn deactivate_proxy(&self, proxy_id: u64) -> ControlResult<()> {
        self.get_proxy(proxy_id)?.deactivate();
        Ok(())
    }

    // --- viewers ---

    pub fn create_session_viewer(
        &self,
        proxy_id: u64,
        username: &str,
        session_key: &str,
    ) -> ControlResult<Arc<SessionViewer>> {
        self.get_proxy(proxy_id)?.create_session_viewer(username, session_key)
    }

    pub fn create_user_viewer(&self, proxy_id: u64, username: &str) -> ControlResult<Arc<SessionViewer>> {
        self.get_proxy(proxy_id)?.create_user_viewer(username)
    }

    pub fn get_proxy_viewer_by_secret(&self, proxy_id: u64, secret: &str) -> ControlResult<Arc<SessionViewer>> {
        self.get_proxy(proxy_id)?.viewer(secret)
    }

    pub fn get_proxy_viewer_by_session_key(
        &self,
        proxy_id: u64,
        session_key: &str,
    ) -> ControlResult<Arc<SessionViewer>> {
        self.get_proxy(proxy_id)?.viewer_by_session_key(session_key)
    }

    pub fn get_proxy_viewer_by_username(&self, proxy_id: u64, username: &str) -> ControlResult<Arc<SessionViewer>> {
        self.get_proxy(proxy_id)?.viewer_by_username(username)
    }

    pub fn get_proxy_viewers(&self, proxy_id: u64) -> ControlResult<Vec<Arc<SessionViewer>>> {
        Ok(self.get_proxy(proxy_id)?.viewers())
    }

    pub fn get_proxy_viewers_by_session_key(
        &self,
        proxy_id: u64,
        session_key: &str,
    ) -> ControlResult<Vec<Arc<SessionViewer>>> {
        Ok(self.get_proxy(proxy_id)?.viewers_by_session_key(session_key))
    }

    pub fn get_proxy_viewers_by_username(
        &self,
        proxy_id: u64,
        username: &str,
    ) -> ControlResult<Vec<Arc<SessionViewer>>> {
        Ok(self.get_proxy(proxy_id)?.viewers_by_username(username))
    }

    pub fn remove_viewer_from_proxy(&self, proxy_id: u64, secret: &str) -> ControlResult<()> {
        self.get_proxy(proxy_id)?.remove_viewer(secret)
    }

    // --- users, filters, callbacks ---

    pub fn add_user_to_proxy(&self, proxy_id: u64, user: ProxyUser) -> ControlResult<String> {
        self.get_proxy(proxy_id)?.add_user(user)
    }

    /// Remove a user together with the filter and callback keys it owned.
    pub fn remove_user_from_proxy(&self, proxy_id: u64, username: &str, password: &str) -> ControlResult<()> {
        let removed = self.get_proxy(proxy_id)?.remove_user(username, password)?;
        let owner = HookOwner {
            proxy_id,
            user_key: removed.key(),
        };
        self.filters.lock().retain(|_, o| *o != owner);
        self.callbacks.lock().retain(|_, o| *o != owner);
        Ok(())
    }

    fn registered_user(&self, proxy_id: u64, username: &str, password: &str) -> ControlResult<(Arc<ProxyUser>, HookOwner)> {
        let key = user_key(username, password);
        let user = self
            .get_proxy(proxy_id)?
            .user(&key)
            .ok_or_else(|| ControlError::UserNotFound(key.clone()))?;
        Ok((user, HookOwner { proxy_id, user_key: key }))
    }

    pub fn add_user_filter(
        &self,
        proxy_id: u64,
        username: &str,
        password: &str,
        filter: ChannelFilter,
    ) -> ControlResult<String> {
        let (user, owner) = self.registered_user(proxy_id, username, password)?;
        let key = uuid::Uuid::new_v4().to_string();
        self.filters.lock().insert(key.clone(), owner);
        user.add_filter(key.clone(), filter);
        debug!(proxy_id, username = %username, filter = %key, "Filter added");
        Ok(key)
    }

    pub fn remove_user_filter(&self, proxy_id: u64, username: &str, password: &str, key: &str) -> ControlResult<()> {
        let (user, owner) = self.registered_user(proxy_id, username, password)?;
        let mut filters = self.filters.lock();
        if filters.get(key) != Some(&owner) || !user.remove_filter(key) {
            return Err(ControlError::FilterNotFound(key.to_string()));
        }
        filters.remove(key);
        Ok(())
    }

    pub fn add_user_callback(
        &self,
        proxy_id: u64,
        username: &str,
        password: &str,
        callback: EventCallback,
    ) -> ControlResult<String> {
        let (user, owner) = self.registered_user(proxy_id, username, password)?;
        let key = uuid::Uuid::new_v4().to_string();
        self.callbacks.lock().insert(key.clone(), owner);
        user.add_callback(key.clone(), callback);
        debug!(proxy_id, username = %username, callback = %key, "Callback added");
        Ok(key)
    }

    pub fn remove_user_callback(&self, proxy_id: u64, username: &str, password: &str, key: &str) -> ControlResult<()> {
        let (user, owner) = self.registered_user(proxy_id, username, password)?;
        let mut callbacks = self.callbacks.lock();
        if callbacks.get(key) != Some(&owner) || !user.remove_callback(key) {
            return Err(ControlError::CallbackNotFound(key.to_string()));
        }
        callbacks.remove(key);
        Ok(())
    }

    // --- control socket ---

    /// Verify, dispatch and answer one control line.
    pub async fn handle_line(&self, line: &[u8]) -> ControlReply {
        let message = SignedEnvelope::from_json(line)
            .and_then(|envelope| envelope.verify(self.settings.preshared_key.as_bytes()));
        match message {
            Ok(message) => dispatch::handle_message(self, message).await,
            Err(e) => ControlReply::rejected(&e),
        }
    }

    /// Serve one control connection until the peer leaves. A failed command
    /// never closes the connection.
    pub async fn serve_client(&self, mut client: Box<dyn ControlClient>) {
        let conn_id = generate_correlation_id();
        let peer = client.peer();
        debug!(conn_id = %conn_id, peer = %peer, "Control client connected");
        loop {
            let line = match client.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(conn_id = %conn_id, error = %e, "Control read ended");
                    break;
                }
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let reply = self.handle_line(&line).await;
            match &reply.error {
                Some(error) => warn!(conn_id = %conn_id, peer = %peer, reply = %reply.message_type, error = %error, "Control command rejected"),
                None => debug!(conn_id = %conn_id, reply = %reply.message_type, "Control command handled"),
            }
            if let Err(e) = client.send_line(&reply.to_json()).await {
                debug!(conn_id = %conn_id, error = %e, "Control write failed");
                break;
            }
        }
        debug!(conn_id = %conn_id, peer = %peer, "Control client disconnected");
    }

    /// Open the control socket described by the settings.
    pub async fn listen(self: &Arc<Self>) -> Result<SocketAddr> {
        let transport = transport::build(
            self.settings.socket_type,
            self.settings.tls_files(),
            web::viewer_routes(self.clone()),
        )?;
        let controller = Arc::downgrade(self);
        let handler: ClientHandler = Arc::new(move |client: Box<dyn ControlClient>| -> BoxFuture<'static, ()> {
            let controller = controller.clone();
            async move {
                if let Some(controller) = controller.upgrade() {
                    controller.serve_client(client).await;
                }
            }
            .boxed()
        });
        let addr = transport.listen(&self.settings.socket_host, handler).await?;
        if let Some(old) = self.transport.lock().replace(transport) {
            old.stop();
        }
        info!(listen = %addr, socket_type = %self.settings.socket_type, "Controller listening");
        Ok(addr)
    }

    // --- web server ---

    /// Serve the viewer socket and static files on `web_host`.
    pub async fn start_web_server(self: &Arc<Self>) -> Result<SocketAddr> {
        let tls = if self.settings.web_uses_tls() {
            let files = self.settings.tls_files();
            let (Some(cert), Some(key)) = (files.cert, files.key) else {
                anyhow::bail!("web TLS needs both a certificate and a key");
            };
            Some(tokio_rustls::TlsAcceptor::from(transport::load_tls_config(cert, key)?))
        } else {
            None
        };
        let listener = tokio::net::TcpListener::bind(&self.settings.web_host)
            .await
            .with_context(|| format!("binding web server on {}", self.settings.web_host))?;
        let addr = listener.local_addr()?;
        let router = web::router(self.clone(), self.settings.static_dir());

        let token = CancellationToken::new();
        if let Some(old) = self.web_stop.lock().replace(token.clone()) {
            old.cancel();
        }
        info!(listen = %addr, tls = tls.is_some(), "Web server listening");
        tokio::spawn(transport::web::serve_http(listener, router, tls, token));
        Ok(addr)
    }

    pub fn stop_web_server(&self) {
        if let Some(token) = self.web_stop.lock().take() {
            token.cancel();
        }
    }

    /// Close the control socket, the web server and every proxy.
    pub fn stop(&self) {
        if let Some(transport) = self.transport.lock().take() {
            transport.stop();
        }
        self.stop_web_server();
        for (id, proxy) in self.proxies() {
            if proxy.is_running() {
                proxy.stop();
                debug!(proxy_id = id, "Proxy stopped with controller");
            }
        }
        info!("Controller stopped");
    }

    // --- export / import ---

    /// Indented JSON of the settings, every proxy and the ID counter.
    pub fn export(&self) -> Result<String> {
        let (proxies, counter) = {
            let reg = self.registry.lock();
            (reg.proxies.clone(), reg.counter)
        };
        let export = ControllerExportRef {
            settings: &self.settings,
            proxies,
            proxy_counter: counter,
        };
        serde_json::to_string_pretty(&export).context("serializing controller state")
    }

    /// Rebuild a controller from [`Controller::export`] output. Proxies keep
    /// their IDs and are left stopped.
    pub fn import(data: &[u8], host_key: PrivateKey) -> Result<Self> {
        let raw: ControllerExport = serde_json::from_slice(data).context("parsing controller state")?;
        let controller = Self::new(raw.settings, host_key);
        {
            let mut reg = controller.registry.lock();
            for (id, proxy) in raw.proxies.unwrap_or_default() {
                let id: u64 = id.parse().with_context(|| format!("invalid proxy id {id:?}"))?;
                let bytes = serde_json::to_vec(&proxy)?;
                let proxy = Proxy::from_json(&bytes, controller.host_key.clone())
                    .with_context(|| format!("restoring proxy {id}"))?;
                reg.proxies.insert(id, Arc::new(proxy));
            }
            let next_free = reg.proxies.keys().next_back().map_or(0, |id| id + 1);
            reg.counter = raw.proxy_counter.max(next_free);
        }
        Ok(controller)
    }
}

#[derive(Serialize)]
struct ControllerExportRef<'a> {
    #[serde(flatten)]
    settings: &'a ControllerSettings,
    #[serde(rename = "Proxies")]
    proxies: BTreeMap<u64, Arc<Proxy>>,
    #[serde(rename = "ProxyCounter")]
    proxy_counter: u64,
}

#[derive(Deserialize)]
struct ControllerExport {
    #[serde(flatten)]
    settings: ControllerSettings,
    #[serde(rename = "Proxies", default)]
    proxies: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(rename = "ProxyCounter", default)]
    proxy_counter: u64,
}
