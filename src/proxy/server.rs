use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Proxy;
use crate::ssh::ProxyHandler;

/// russh server settings for a proxy listener.
pub fn ssh_config(proxy: &Proxy) -> russh::server::Config {
    let mut config = russh::server::Config::default();
    config.keys.push(proxy.host_key().clone());
    config.server_id = russh::SshId::Standard(proxy.config().server_version.clone());
    config.auth_rejection_time = Duration::from_secs(1);
    config.auth_rejection_time_initial = Some(Duration::from_secs(0));
    config
}

/// Accept connections until `shutdown` fires. Each connection runs on its
/// own task with a child token of `shutdown`.
pub async fn serve(proxy: Arc<Proxy>, listener: TcpListener, shutdown: CancellationToken) {
    let config = Arc::new(ssh_config(&proxy));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let proxy = proxy.clone();
                        let config = config.clone();
                        let conn_token = shutdown.child_token();
                        tokio::spawn(handle_connection(proxy, config, stream, peer, conn_token));
                    }
                    Err(e) => {
                        warn!(error = %e, "Proxy accept failed");
                    }
                }
            }
        }
    }
    debug!("Proxy accept loop exited");
}

async fn handle_connection(
    proxy: Arc<Proxy>,
    config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    conn_token: CancellationToken,
) {
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Could not read local address");
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let handler = ProxyHandler::new(proxy, local, peer, conn_token.clone());
    let session_key = handler.session_key().to_string();
    debug!(peer = %peer, session = %session_key, "Connection accepted");

    let running = match russh::server::run_stream(config, stream, handler).await {
        Ok(s) => s,
        Err(e) => {
            debug!(peer = %peer, error = %e, "SSH handshake failed");
            conn_token.cancel();
            return;
        }
    };
    let handle = running.handle();
    tokio::pin!(running);

    let result = tokio::select! {
        r = &mut running => r,
        _ = conn_token.cancelled() => {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "proxy session closed".into(), "en".into())
                .await;
            running.await
        }
    };
    conn_token.cancel();

    match result {
        Ok(()) => info!(peer = %peer, session = %session_key, "Connection closed"),
        Err(e) => debug!(peer = %peer, session = %session_key, error = %e, "Connection ended with error"),
    }
}
