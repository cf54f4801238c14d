//! Viewer socket: a small text-frame protocol for listing sessions and
//! streaming their events live, plus the controller's web router.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::proxy::Proxy;
use crate::session::Session;

pub const PUBLIC_QUERY_DISABLED: &str = "public query disabled";
pub const UNSUPPORTED_MESSAGE: &str = "unsupported message type";
pub const NO_SUCH_SESSION: &str = "could not find session";
pub const NO_SUCH_VIEWER: &str = "could not find viewer";
pub const NO_SUCH_PROXY: &str = "could not find proxy";
pub const ACK: &str = "ack";

/// One row of a session listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub key: String,
    pub active: bool,
    pub start: i64,
    pub length: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
}

impl SessionInfo {
    fn new(key: String, session: &Session) -> Self {
        Self {
            key,
            active: session.is_active(),
            start: session.start_unix(),
            length: session.length_secs(),
            user: String::new(),
            secret: String::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ViewerQuery {
    #[serde(default)]
    id: Option<String>,
}

impl ViewerQuery {
    /// A missing or unparsable id selects proxy 0.
    fn proxy_id(&self) -> u64 {
        self.id.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0)
    }
}

/// `/proxysocket/` routes, mounted by the web server and the WebSocket
/// control transports.
pub fn viewer_routes(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/proxysocket/", get(viewer_upgrade))
        .route("/proxysocket", get(viewer_upgrade))
        .with_state(controller)
}

/// Viewer routes with static files from `static_dir` as the fallback.
pub fn router(controller: Arc<Controller>, static_dir: Option<&Path>) -> Router {
    let router = viewer_routes(controller);
    match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    }
}

async fn viewer_upgrade(
    State(controller): State<Arc<Controller>>,
    Query(query): Query<ViewerQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let proxy_id = query.proxy_id();
    ws.on_upgrade(move |socket| async move {
        let mut conn = ViewerConn { socket, proxy_id };
        conn.run(&controller).await;
    })
}

struct ViewerConn {
    socket: WebSocket,
    proxy_id: u64,
}

impl ViewerConn {
    async fn run(&mut self, controller: &Controller) {
        info!(proxy_id = self.proxy_id, "Viewer socket connected");
        while let Some(command) = self.recv_text().await {
            let result = match controller.get_proxy(self.proxy_id) {
                Ok(proxy) => self.handle(&proxy, &command).await,
                Err(_) => self.send(NO_SUCH_PROXY).await,
            };
            if result.is_err() {
                break;
            }
        }
        info!(proxy_id = self.proxy_id, "Viewer socket closed");
    }

    /// Run one command. An error means the socket is gone.
    async fn handle(&mut self, proxy: &Proxy, command: &str) -> Result<(), axum::Error> {
        match command {
            "list-active" | "list-all" => {
                if !proxy.public_access() {
                    return self.send(PUBLIC_QUERY_DISABLED).await;
                }
                let sessions = if command == "list-active" {
                    proxy.active_sessions()
                } else {
                    proxy.sessions()
                };
                let list: Vec<SessionInfo> = sessions
                    .into_iter()
                    .map(|(key, s)| SessionInfo::new(key, &s))
                    .collect();
                self.send_json(&list).await
            }
            "viewer-list" => {
                let Some(secret) = self.recv_text().await else {
                    return Ok(());
                };
                let viewer = match proxy.viewer(&secret) {
                    Ok(v) => v,
                    Err(_) => return self.send(NO_SUCH_VIEWER).await,
                };
                let user_key = viewer.user.key();
                let list: Vec<SessionInfo> = proxy
                    .viewer_sessions(&secret)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, s)| SessionInfo {
                        user: user_key.clone(),
                        secret: viewer.secret.clone(),
                        ..SessionInfo::new(key, &s)
                    })
                    .collect();
                self.send_json(&list).await
            }
            "viewer-get" => {
                let Some(secret) = self.recv_text().await else {
                    return Ok(());
                };
                let Ok(sessions) = proxy.viewer_sessions(&secret) else {
                    return self.send(NO_SUCH_VIEWER).await;
                };
                let Some(session_key) = self.recv_text().await else {
                    return Ok(());
                };
                match sessions.into_iter().find(|(key, _)| *key == session_key) {
                    Some((_, session)) => self.play(&session).await,
                    None => self.send(NO_SUCH_SESSION).await,
                }
            }
            "get" => {
                if !proxy.public_access() {
                    return self.send(PUBLIC_QUERY_DISABLED).await;
                }
                let Some(session_key) = self.recv_text().await else {
                    return Ok(());
                };
                match proxy.session(&session_key) {
                    Some(session) => self.play(&session).await,
                    None => self.send(NO_SUCH_SESSION).await,
                }
            }
            _ => self.send(UNSUPPORTED_MESSAGE).await,
        }
    }

    /// Stream every recorded event of `session`, then new ones as they
    /// arrive, until the session has ended and all of them were sent.
    /// Each event waits for an `ack` before the next goes out.
    async fn play(&mut self, session: &Session) -> Result<(), axum::Error> {
        // Subscribe before reading the backlog so no append is missed.
        let mut signal = session.subscribe();
        let mut sent = 0;
        debug!(session = %session.key(), "Viewer playback started");
        loop {
            let ended = signal.borrow_and_update().ended;
            for event in session.events_since(sent) {
                self.send_acked(&event.to_json()).await?;
                sent += 1;
            }
            if ended && sent >= session.event_count() {
                break;
            }
            if signal.changed().await.is_err() {
                break;
            }
        }
        debug!(session = %session.key(), events = sent, "Viewer playback finished");
        Ok(())
    }

    /// Send `data` until the peer answers `ack`.
    async fn send_acked(&mut self, data: &str) -> Result<(), axum::Error> {
        loop {
            self.send(data).await?;
            match self.recv_text().await {
                Some(reply) if reply == ACK => return Ok(()),
                Some(_) => warn!("Viewer did not ack event, resending"),
                None => return Err(axum::Error::new("viewer socket closed")),
            }
        }
    }

    async fn send(&mut self, text: &str) -> Result<(), axum::Error> {
        self.socket.send(Message::Text(text.to_string())).await
    }

    async fn send_json<T: Serialize>(&mut self, value: &T) -> Result<(), axum::Error> {
        let json = serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string());
        self.send(&json).await
    }

    /// Next text (or binary) frame, or None once the socket is closed.
    async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Binary(data)) => return Some(String::from_utf8_lossy(&data).into_owned()),
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => {
                    debug!(error = %e, "Viewer socket receive failed");
                    return None;
                }
            }
        }
    }
}
