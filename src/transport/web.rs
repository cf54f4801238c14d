use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClientHandler, ControlClient, ControlTransport};

/// Control client over a WebSocket: one text frame per line.
pub struct WsClient {
    socket: WebSocket,
    peer: String,
    stop: CancellationToken,
}

impl WsClient {
    pub fn new(socket: WebSocket, peer: String, stop: CancellationToken) -> Self {
        Self { socket, peer, stop }
    }
}

#[async_trait]
impl ControlClient for WsClient {
    async fn send_line(&mut self, data: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(data).into_owned();
        self.socket
            .send(Message::Text(text))
            .await
            .context("websocket send")
    }

    async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let msg = tokio::select! {
                _ = self.stop.cancelled() => anyhow::bail!("transport stopped"),
                msg = self.socket.recv() => msg,
            };
            match msg {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Err(e)) => return Err(e).context("websocket receive"),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            }
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

#[derive(Clone)]
struct ControlRoute {
    handler: ClientHandler,
    stop: CancellationToken,
}

async fn control_upgrade(
    State(route): State<ControlRoute>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let client = WsClient::new(socket, peer.to_string(), route.stop.clone());
        (route.handler)(Box::new(client)).await;
    })
}

/// WebSocket control transport at `/`, optionally over TLS.
pub struct WebSocketTransport {
    tls: Option<TlsAcceptor>,
    extra_routes: Router,
    stop: Mutex<CancellationToken>,
}

impl WebSocketTransport {
    pub fn new(tls: Option<TlsAcceptor>, extra_routes: Router) -> Self {
        Self {
            tls,
            extra_routes,
            stop: Mutex::new(CancellationToken::new()),
        }
    }
}

#[async_trait]
impl ControlTransport for WebSocketTransport {
    async fn listen(&self, host: &str, handler: ClientHandler) -> Result<SocketAddr> {
        let listener = TcpListener::bind(host)
            .await
            .with_context(|| format!("binding websocket control socket on {host}"))?;
        let addr = listener.local_addr()?;
        let stop = {
            let mut guard = self.stop.lock();
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };
        let router = Router::new()
            .route("/", get(control_upgrade))
            .with_state(ControlRoute {
                handler,
                stop: stop.clone(),
            })
            .merge(self.extra_routes.clone());
        info!(listen = %addr, tls = self.tls.is_some(), "WebSocket control socket listening");
        tokio::spawn(serve_http(listener, router, self.tls.clone(), stop));
        Ok(addr)
    }

    fn stop(&self) {
        self.stop.lock().cancel();
    }
}

/// Serve `router` on `listener` until `stop` fires, with WebSocket upgrades
/// and an optional TLS wrap. Handlers can extract `ConnectInfo<SocketAddr>`.
pub async fn serve_http(listener: TcpListener, router: Router, tls: Option<TlsAcceptor>, stop: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!(error = %e, "HTTP accept failed");
                    continue;
                }
            },
        };
        let router = router.clone();
        let tls = tls.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = serve_connection(stream, peer, router, tls) => {}
            }
        });
    }
    debug!("HTTP accept loop exited");
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, router: Router, tls: Option<TlsAcceptor>) {
    let service = TowerToHyperService::new(router.layer(Extension(ConnectInfo(peer))));
    let builder = auto::Builder::new(TokioExecutor::new());
    let result = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                builder
                    .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                    .await
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "HTTP TLS handshake failed");
                return;
            }
        },
        None => {
            builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
        }
    };
    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "HTTP connection ended with error");
    }
}
