use anyhow::{Context, Result};
use russh::client;
use russh::{ChannelId, ChannelMsg, CryptoVec};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::requests::{self, ChannelRequest};
use crate::proxy::user::ChannelContext;
use crate::session::events::{Direction, SessionEvent, Stream};
use crate::session::Session;

/// Timeout for dialing and handshaking with the upstream server.
pub const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Client input queued per channel before the handler stops reading from
/// the client connection.
pub const RELAY_QUEUE_DEPTH: usize = 64;

/// russh client handler for the proxy's outbound connection.
///
/// Upstream host keys are not verified. Dropping the handler (the upstream
/// connection is gone) cancels the connection token so the client side is
/// torn down as well.
pub struct UpstreamHandler {
    conn_token: CancellationToken,
}

impl UpstreamHandler {
    pub fn new(conn_token: CancellationToken) -> Self {
        Self { conn_token }
    }
}

impl Drop for UpstreamHandler {
    fn drop(&mut self) {
        self.conn_token.cancel();
    }
}

impl client::Handler for UpstreamHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub type UpstreamHandle = client::Handle<UpstreamHandler>;

/// Dial `remote_host` and authenticate with a password.
pub async fn connect_upstream(
    remote_host: &str,
    username: &str,
    password: &str,
    conn_token: CancellationToken,
) -> Result<UpstreamHandle> {
    let config = Arc::new(client::Config::default());
    let handler = UpstreamHandler::new(conn_token);

    let mut handle = tokio::time::timeout(
        UPSTREAM_DIAL_TIMEOUT,
        client::connect(config, remote_host, handler),
    )
    .await
    .with_context(|| format!("dialing {remote_host}: timed out"))?
    .with_context(|| format!("dialing {remote_host}"))?;

    let auth = tokio::time::timeout(
        UPSTREAM_DIAL_TIMEOUT,
        handle.authenticate_password(username, password),
    )
    .await
    .with_context(|| format!("authenticating to {remote_host}: timed out"))?
    .with_context(|| format!("authenticating to {remote_host}"))?;

    if !auth.success() {
        anyhow::bail!("upstream {remote_host} rejected credentials for {username}");
    }
    Ok(handle)
}

/// Work handed from the client-side handler to a channel's relay task.
#[derive(Debug)]
pub enum RelayCommand {
    Data(Vec<u8>),
    ExtendedData(u32, Vec<u8>),
    /// A channel request. When `reply` is set the upstream is asked to
    /// answer and its verdict is sent back on it.
    Request {
        request: ChannelRequest,
        reply: Option<oneshot::Sender<bool>>,
    },
    Eof,
    Close,
}

/// Everything a channel relay needs; see [`spawn_channel_relay`].
pub struct ChannelRelay {
    pub session: Arc<Session>,
    pub server: russh::server::Handle,
    pub client_channel: ChannelId,
    pub channel_num: u32,
    pub upstream: russh::Channel<client::Msg>,
    pub commands: mpsc::Receiver<RelayCommand>,
    pub conn_token: CancellationToken,
}

/// Run one mirrored channel until either side closes it.
///
/// Upstream output is filtered, recorded as `incoming` messages and written
/// to the client. Client input arrives already filtered and recorded as
/// [`RelayCommand`]s. Upstream success/failure replies are matched to the
/// forwarded requests in order. The task holds the session open while it runs.
pub fn spawn_channel_relay(relay: ChannelRelay) {
    let guard = relay.session.track();
    tokio::spawn(async move {
        let _guard = guard;
        run_relay(relay).await;
    });
}

async fn run_relay(relay: ChannelRelay) {
    let ChannelRelay {
        session,
        server,
        client_channel,
        channel_num,
        mut upstream,
        mut commands,
        conn_token,
    } = relay;
    let mut pending: VecDeque<oneshot::Sender<bool>> = VecDeque::new();
    let mut client_open = true;

    loop {
        tokio::select! {
            _ = conn_token.cancelled() => break,
            msg = upstream.wait() => {
                let Some(msg) = msg else {
                    break;
                };
                match msg {
                    ChannelMsg::Data { data } => {
                        let out = tap(&session, channel_num, Direction::Incoming, Stream::Stdout, &data);
                        if server.data(client_channel, CryptoVec::from_slice(&out)).await.is_err() {
                            break;
                        }
                    }
                    ChannelMsg::ExtendedData { data, ext } => {
                        let out = tap(&session, channel_num, Direction::Incoming, Stream::Stderr, &data);
                        if server
                            .extended_data(client_channel, ext, CryptoVec::from_slice(&out))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    ChannelMsg::Eof => {
                        let _ = server.eof(client_channel).await;
                    }
                    ChannelMsg::Close => break,
                    ChannelMsg::ExitStatus { exit_status } => {
                        record_upstream_request(
                            &session,
                            channel_num,
                            "exit-status",
                            &requests::exit_status_payload(exit_status),
                        );
                        let _ = server.exit_status_request(client_channel, exit_status).await;
                    }
                    ChannelMsg::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                        lang_tag,
                    } => {
                        record_upstream_request(
                            &session,
                            channel_num,
                            "exit-signal",
                            &requests::exit_signal_payload(&signal_name, core_dumped, &error_message, &lang_tag),
                        );
                        let _ = server
                            .exit_signal_request(client_channel, signal_name, core_dumped, error_message, lang_tag)
                            .await;
                    }
                    ChannelMsg::Success => resolve_reply(&mut pending, true),
                    ChannelMsg::Failure => resolve_reply(&mut pending, false),
                    other => {
                        debug!(session = %session.key(), channel_id = channel_num, msg = ?other, "Unhandled upstream channel message");
                    }
                }
            }
            cmd = commands.recv(), if client_open => {
                match cmd {
                    Some(RelayCommand::Data(data)) => {
                        if upstream.data(&data[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(RelayCommand::ExtendedData(ext, data)) => {
                        if upstream.extended_data(ext, &data[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(RelayCommand::Request { request, reply }) => {
                        match forward_request(&upstream, &request, reply.is_some()).await {
                            Ok(()) => pending.extend(reply),
                            Err(e) => {
                                warn!(
                                    session = %session.key(),
                                    channel_id = channel_num,
                                    request = request.request_type(),
                                    error = %e,
                                    "Forwarding channel request failed"
                                );
                                if let Some(reply) = reply {
                                    let _ = reply.send(false);
                                }
                            }
                        }
                    }
                    Some(RelayCommand::Eof) => {
                        let _ = upstream.eof().await;
                    }
                    Some(RelayCommand::Close) | None => {
                        client_open = false;
                        let _ = upstream.close().await;
                    }
                }
            }
        }
    }

    let _ = upstream.close().await;
    let _ = server.close(client_channel).await;
    info!(session = %session.key(), channel_id = channel_num, "Channel relay completed");
}

/// Filter a chunk for `session`'s user and record it as a message event.
/// Returns the bytes to deliver.
pub fn tap(session: &Session, channel_num: u32, direction: Direction, stream: Stream, data: &[u8]) -> Vec<u8> {
    let ctx = ChannelContext {
        session_key: session.key().to_string(),
        channel_id: channel_num,
        direction,
        stream,
    };
    let out = session.user().apply_filters(data, &ctx);
    session.handle_event(SessionEvent::message(direction, stream, channel_num, out.clone()));
    out
}

/// Hand the upstream's verdict to the oldest request still waiting on one.
fn resolve_reply(pending: &mut VecDeque<oneshot::Sender<bool>>, ok: bool) {
    if let Some(reply) = pending.pop_front() {
        let _ = reply.send(ok);
    }
}

fn record_upstream_request(session: &Session, channel_num: u32, request_type: &str, payload: &[u8]) {
    let request_id = session.next_request_id(request_type);
    session.handle_event(SessionEvent::new_request(request_type, payload, channel_num, request_id));
}

async fn forward_request(
    upstream: &russh::Channel<client::Msg>,
    request: &ChannelRequest,
    want_reply: bool,
) -> Result<(), russh::Error> {
    match request {
        ChannelRequest::Pty {
            term,
            cols,
            rows,
            pix_width,
            pix_height,
            modes,
        } => {
            upstream
                .request_pty(want_reply, term, *cols, *rows, *pix_width, *pix_height, modes)
                .await
        }
        ChannelRequest::Shell => upstream.request_shell(want_reply).await,
        ChannelRequest::Exec(command) => upstream.exec(want_reply, command.clone()).await,
        ChannelRequest::Subsystem(name) => upstream.request_subsystem(want_reply, name).await,
        ChannelRequest::Env { name, value } => upstream.set_env(want_reply, name, value).await,
        ChannelRequest::WindowChange {
            cols,
            rows,
            pix_width,
            pix_height,
        } => upstream.window_change(*cols, *rows, *pix_width, *pix_height).await,
        ChannelRequest::Signal(sig) => upstream.signal(sig.clone()).await,
        ChannelRequest::X11 {
            single_connection,
            auth_protocol,
            auth_cookie,
            screen_number,
        } => {
            upstream
                .request_x11(want_reply, *single_connection, auth_protocol, auth_cookie, *screen_number)
                .await
        }
    }
}
