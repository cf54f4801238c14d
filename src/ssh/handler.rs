use russh::server::{Auth, Msg, Session as SshSession};
use russh::{Channel, ChannelId, Pty, Sig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::requests::{self, ChannelRequest, SUPPORTED_CHANNEL_TYPE};
use super::upstream::{self, ChannelRelay, RelayCommand, UpstreamHandle};
use crate::proxy::Proxy;
use crate::session::events::{Direction, SessionEvent, Stream};
use crate::session::{ActivityGuard, Session, SessionParams};
use crate::utils::generate_correlation_id;

/// Interval at which an authenticated connection re-checks whether its
/// proxy has been activated.
pub const ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a client request waits for the upstream's success/failure reply.
pub const REQUEST_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

struct ChannelLink {
    num: u32,
    commands: mpsc::Sender<RelayCommand>,
}

/// Per-connection russh handler: authenticates the client against the proxy,
/// opens the upstream connection and mirrors channels onto it.
pub struct ProxyHandler {
    proxy: Arc<Proxy>,
    session_key: String,
    peer_addr: SocketAddr,
    conn_id: String,
    conn_token: CancellationToken,
    session: Option<Arc<Session>>,
    upstream: Option<Arc<AsyncMutex<UpstreamHandle>>>,
    channels: HashMap<ChannelId, ChannelLink>,
    _conn_guard: Option<ActivityGuard>,
}

impl ProxyHandler {
    pub fn new(
        proxy: Arc<Proxy>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        conn_token: CancellationToken,
    ) -> Self {
        Self {
            proxy,
            session_key: format!("{local_addr}:{peer_addr}"),
            peer_addr,
            conn_id: generate_correlation_id(),
            conn_token,
            session: None,
            upstream: None,
            channels: HashMap::new(),
            _conn_guard: None,
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Block until the proxy is active. Returns false if the connection was
    /// closed while waiting.
    async fn wait_until_active(&self) -> bool {
        while !self.proxy.is_active() {
            if self.conn_token.is_cancelled() {
                return false;
            }
            tokio::time::sleep(ACTIVE_POLL_INTERVAL).await;
        }
        true
    }

    /// End a session that never reached the relay stage.
    fn abort_session(&mut self) {
        self._conn_guard = None;
        if let Some(session) = self.session.take() {
            session.end();
        }
    }

    /// Record a client request on `channel`, forward it, and answer the
    /// client with the upstream's verdict before the next request is read.
    /// russh only sends the answer when the client asked for one.
    async fn client_request(&mut self, channel: ChannelId, request: ChannelRequest, session: &mut SshSession) {
        let (Some(sess), Some(link)) = (self.session.as_ref(), self.channels.get(&channel)) else {
            let _ = session.channel_failure(channel);
            return;
        };
        let request_type = request.request_type();
        let payload = request.payload();
        let request_id = sess.next_request_id(request_type);
        sess.handle_event(SessionEvent::new_request(request_type, &payload, link.num, request_id));

        if let Some((rows, cols)) = request.geometry() {
            sess.set_term_size(rows, cols);
            sess.handle_event(SessionEvent::window_resize(rows, cols));
        }

        if !requests::should_forward(request_type) {
            let _ = session.channel_failure(channel);
            return;
        }
        let (reply, verdict) = if request.upstream_replies() {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        if link.commands.send(RelayCommand::Request { request, reply }).await.is_err() {
            warn!(conn_id = %self.conn_id, request = request_type, "Relay gone, request rejected");
            let _ = session.channel_failure(channel);
            return;
        }

        let ok = match verdict {
            Some(verdict) => self.await_verdict(request_type, verdict).await,
            None => true,
        };
        let _ = if ok {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        };
    }

    async fn await_verdict(&self, request_type: &str, verdict: oneshot::Receiver<bool>) -> bool {
        tokio::select! {
            _ = self.conn_token.cancelled() => false,
            answer = tokio::time::timeout(REQUEST_REPLY_TIMEOUT, verdict) => match answer {
                Ok(Ok(ok)) => ok,
                Ok(Err(_)) => false,
                Err(_) => {
                    warn!(conn_id = %self.conn_id, request = request_type, "Upstream reply timed out");
                    false
                }
            },
        }
    }

    /// Record client input and queue it for the upstream. Waits while the
    /// channel's queue is full, which stops reading from the client.
    async fn client_data(&mut self, channel: ChannelId, ext: Option<u32>, data: &[u8]) {
        let (Some(sess), Some(link)) = (self.session.as_ref(), self.channels.get(&channel)) else {
            return;
        };
        let stream = if ext.is_some() { Stream::Stderr } else { Stream::Stdout };
        let out = upstream::tap(sess, link.num, Direction::Outgoing, stream, data);
        let cmd = match ext {
            Some(code) => RelayCommand::ExtendedData(code, out),
            None => RelayCommand::Data(out),
        };
        let _ = link.commands.send(cmd).await;
    }

    /// Record a channel the proxy does not relay, then refuse it.
    fn refuse_channel(&self, channel_type: &str, extra_data: &[u8]) -> bool {
        if let Some(sess) = &self.session {
            let num = sess.next_channel_id();
            sess.handle_event(SessionEvent::new_channel(channel_type, extra_data, num));
        }
        warn!(conn_id = %self.conn_id, channel_type, "Channel type denied");
        false
    }

    /// Record a connection-level request under channel 0.
    fn record_global_request(&self, request_type: &str, payload: &[u8]) {
        if let Some(sess) = &self.session {
            let request_id = sess.next_request_id(request_type);
            sess.handle_event(SessionEvent::new_request(request_type, payload, 0, request_id));
        }
    }
}

impl russh::server::Handler for ProxyHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let proxy_user = match self.proxy.authenticate(user, password) {
            Ok(u) => u,
            Err(e) => {
                warn!(conn_id = %self.conn_id, peer = %self.peer_addr, username = %user, error = %e, "SSH password auth failed");
                return Ok(Self::reject());
            }
        };

        let remote_host = self.proxy.remote_host_for(&proxy_user);
        let session = Session::new(SessionParams {
            key: &self.session_key,
            client_host: &self.peer_addr.to_string(),
            server_host: &remote_host,
            client_username: user,
            client_password: password,
            user: proxy_user.clone(),
            log_dir: self.proxy.session_folder(),
            close: self.conn_token.clone(),
        });
        self.proxy.register_session(session.clone());
        session.begin();
        self._conn_guard = Some(session.track());
        self.session = Some(session);

        if !self.proxy.is_active() {
            debug!(conn_id = %self.conn_id, session = %self.session_key, "Proxy inactive, holding connection");
        }
        if !self.wait_until_active().await {
            self.abort_session();
            return Ok(Self::reject());
        }

        let handle = match upstream::connect_upstream(
            &remote_host,
            &proxy_user.remote_username,
            &proxy_user.remote_password,
            self.conn_token.clone(),
        )
        .await
        {
            Ok(h) => Arc::new(AsyncMutex::new(h)),
            Err(e) => {
                warn!(
                    conn_id = %self.conn_id,
                    upstream = %remote_host,
                    error = format!("{e:#}"),
                    "Upstream connect failed"
                );
                self.abort_session();
                return Ok(Self::reject());
            }
        };

        let watchdog = handle.clone();
        let token = self.conn_token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let _ = watchdog
                .lock()
                .await
                .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
                .await;
        });
        self.upstream = Some(handle);

        info!(
            conn_id = %self.conn_id,
            peer = %self.peer_addr,
            username = %user,
            upstream = %remote_host,
            session = %self.session_key,
            "SSH password auth success"
        );
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        let (Some(sess), Some(upstream)) = (self.session.clone(), self.upstream.clone()) else {
            return Ok(false);
        };
        let client_channel = channel.id();
        drop(channel);

        let num = sess.next_channel_id();
        sess.handle_event(SessionEvent::new_channel(SUPPORTED_CHANNEL_TYPE, &[], num));

        let opened = upstream.lock().await.channel_open_session().await;
        let upstream_channel = match opened {
            Ok(c) => c,
            Err(e) => {
                warn!(conn_id = %self.conn_id, channel_id = num, error = %e, "Upstream channel open rejected");
                return Ok(false);
            }
        };

        let (tx, rx) = mpsc::channel(upstream::RELAY_QUEUE_DEPTH);
        self.channels.insert(client_channel, ChannelLink { num, commands: tx });
        upstream::spawn_channel_relay(ChannelRelay {
            session: sess,
            server: session.handle(),
            client_channel,
            channel_num: num,
            upstream: upstream_channel,
            commands: rx,
            conn_token: self.conn_token.clone(),
        });
        debug!(conn_id = %self.conn_id, channel_id = num, "Channel opened");
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        let mut extra = requests::tcpip_forward_payload(host_to_connect, port_to_connect);
        extra.extend(requests::tcpip_forward_payload(originator_address, originator_port));
        Ok(self.refuse_channel("direct-tcpip", &extra))
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        let extra = requests::tcpip_forward_payload(originator_address, originator_port);
        Ok(self.refuse_channel("x11", &extra))
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        self.record_global_request("tcpip-forward", &requests::tcpip_forward_payload(address, *port));
        let Some(upstream) = self.upstream.clone() else {
            return Ok(false);
        };
        let mut handle = upstream.lock().await;
        let forwarded = tokio::time::timeout(REQUEST_REPLY_TIMEOUT, handle.tcpip_forward(address, *port)).await;
        match forwarded {
            Ok(Ok(bound)) => {
                if *port == 0 {
                    *port = bound;
                }
                debug!(conn_id = %self.conn_id, address, port = *port, "tcpip-forward relayed");
                Ok(true)
            }
            Ok(Err(e)) => {
                debug!(conn_id = %self.conn_id, address, error = %e, "tcpip-forward rejected upstream");
                Ok(false)
            }
            Err(_) => {
                warn!(conn_id = %self.conn_id, address, "tcpip-forward reply timed out");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        self.record_global_request("cancel-tcpip-forward", &requests::tcpip_forward_payload(address, port));
        let Some(upstream) = self.upstream.clone() else {
            return Ok(false);
        };
        let handle = upstream.lock().await;
        let cancelled = tokio::time::timeout(REQUEST_REPLY_TIMEOUT, handle.cancel_tcpip_forward(address, port)).await;
        match cancelled {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                debug!(conn_id = %self.conn_id, address, error = %e, "cancel-tcpip-forward rejected upstream");
                Ok(false)
            }
            Err(_) => {
                warn!(conn_id = %self.conn_id, address, "cancel-tcpip-forward reply timed out");
                Ok(false)
            }
        }
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut SshSession) -> Result<(), Self::Error> {
        self.client_data(channel, None, data).await;
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.client_data(channel, Some(code), data).await;
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut SshSession) -> Result<(), Self::Error> {
        if let Some(link) = self.channels.get(&channel) {
            let _ = link.commands.send(RelayCommand::Eof).await;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut SshSession) -> Result<(), Self::Error> {
        if let Some(link) = self.channels.remove(&channel) {
            let _ = link.commands.send(RelayCommand::Close).await;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Pty {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        };
        self.client_request(channel, request, session).await;
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::X11 {
            single_connection,
            auth_protocol: x11_auth_protocol.to_string(),
            auth_cookie: x11_auth_cookie.to_string(),
            screen_number: x11_screen_number,
        };
        self.client_request(channel, request, session).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.client_request(channel, request, session).await;
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut SshSession) -> Result<(), Self::Error> {
        self.client_request(channel, ChannelRequest::Shell, session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.client_request(channel, ChannelRequest::Exec(data.to_vec()), session).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.client_request(channel, ChannelRequest::Subsystem(name.to_string()), session).await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::WindowChange {
            cols: col_width,
            rows: row_height,
            pix_width,
            pix_height,
        };
        self.client_request(channel, request, session).await;
        Ok(())
    }

    async fn signal(&mut self, channel: ChannelId, signal: Sig, session: &mut SshSession) -> Result<(), Self::Error> {
        self.client_request(channel, ChannelRequest::Signal(signal), session).await;
        Ok(())
    }
}
