pub mod events;
pub mod log;
pub mod registry;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proxy::user::ProxyUser;
use events::{EventType, SessionEvent, SessionSummary};
use log::SessionLog;

/// Progress published to live viewers after every appended event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSignal {
    pub events: usize,
    pub ended: bool,
}

#[derive(Debug)]
struct LifecycleState {
    in_flight: i64,
    active: bool,
    stop: Option<DateTime<Utc>>,
    term_rows: u32,
    term_cols: u32,
    channel_counter: u32,
    request_counter: u32,
    request_types: Vec<String>,
}

/// One client connection through a proxy and its recorded events.
///
/// Every task that works on behalf of the session holds an
/// [`ActivityGuard`]. When the last guard is released the session ends:
/// the stop event is recorded, viewers are told, the log is closed and
/// indexed, and `closed()` fires so the connection can be torn down.
/// [`Session::end`] runs its body at most once.
#[derive(Debug)]
pub struct Session {
    key: String,
    client_host: String,
    server_host: String,
    client_username: String,
    client_password: String,
    user: Arc<ProxyUser>,
    log_dir: PathBuf,
    start: DateTime<Utc>,
    state: Mutex<LifecycleState>,
    events: RwLock<Vec<Arc<SessionEvent>>>,
    log: Mutex<SessionLog>,
    signal: watch::Sender<SessionSignal>,
    closed: CancellationToken,
}

pub struct SessionParams<'a> {
    pub key: &'a str,
    pub client_host: &'a str,
    pub server_host: &'a str,
    pub client_username: &'a str,
    pub client_password: &'a str,
    pub user: Arc<ProxyUser>,
    pub log_dir: &'a Path,
    /// Fired when the session ends. Usually the connection's token, so that
    /// ending the session also tears down both SSH connections.
    pub close: CancellationToken,
}

impl Session {
    /// Create the session record and open its log. The session starts active.
    pub fn new(params: SessionParams<'_>) -> Arc<Self> {
        let (signal, _) = watch::channel(SessionSignal::default());
        Arc::new(Self {
            key: params.key.to_string(),
            client_host: params.client_host.to_string(),
            server_host: params.server_host.to_string(),
            client_username: params.client_username.to_string(),
            client_password: params.client_password.to_string(),
            user: params.user,
            log_dir: params.log_dir.to_path_buf(),
            start: Utc::now(),
            state: Mutex::new(LifecycleState {
                in_flight: 0,
                active: true,
                stop: None,
                term_rows: 0,
                term_cols: 0,
                channel_counter: 0,
                request_counter: 0,
                request_types: Vec::new(),
            }),
            events: RwLock::new(Vec::new()),
            log: Mutex::new(SessionLog::open(params.log_dir, params.key)),
            signal,
            closed: params.close,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn user(&self) -> &Arc<ProxyUser> {
        &self.user
    }

    pub fn client_host(&self) -> &str {
        &self.client_host
    }

    pub fn server_host(&self) -> &str {
        &self.server_host
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn start_unix(&self) -> i64 {
        self.start.timestamp()
    }

    /// Whole seconds from start to stop, or to now while active.
    pub fn length_secs(&self) -> i64 {
        let stop = self.state.lock().stop.unwrap_or_else(Utc::now);
        (stop - self.start).num_seconds()
    }

    pub fn term_size(&self) -> (u32, u32) {
        let st = self.state.lock();
        (st.term_rows, st.term_cols)
    }

    pub fn set_term_size(&self, rows: u32, cols: u32) {
        let mut st = self.state.lock();
        st.term_rows = rows;
        st.term_cols = cols;
    }

    pub fn log_filename(&self) -> String {
        self.log.lock().filename().to_string()
    }

    /// Next channel ID. The first channel is 1.
    pub fn next_channel_id(&self) -> u32 {
        let mut st = self.state.lock();
        st.channel_counter += 1;
        st.channel_counter
    }

    /// Allocate a request ID (starting at 1) and remember the request type
    /// for the session index.
    pub fn next_request_id(&self, request_type: &str) -> u32 {
        let mut st = self.state.lock();
        st.request_counter += 1;
        st.request_types.push(request_type.to_string());
        st.request_counter
    }

    /// Token cancelled when the session has ended or its connection closed.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSignal> {
        self.signal.subscribe()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    /// Events from index `from` onward.
    pub fn events_since(&self, from: usize) -> Vec<Arc<SessionEvent>> {
        let events = self.events.read();
        events.get(from..).map(|s| s.to_vec()).unwrap_or_default()
    }

    /// Record `event`: stamp its offset, append it to the event list and
    /// the log, wake viewers, then run the user's callbacks for its type.
    pub fn handle_event(&self, mut event: SessionEvent) -> Arc<SessionEvent> {
        if event.event_type != EventType::SessionStart {
            event.offset = (Utc::now() - self.start).num_milliseconds();
        }
        let event = Arc::new(event);
        let count = {
            let mut events = self.events.write();
            events.push(event.clone());
            self.log.lock().append(&event.to_json());
            events.len()
        };
        self.signal.send_modify(|s| s.events = count);

        for callback in self.user.callbacks_for(event.event_type) {
            callback.invoke(&event);
        }
        event
    }

    /// Record the session-start event.
    pub fn begin(&self) {
        self.handle_event(SessionEvent {
            key: self.key.clone(),
            server_host: self.server_host.clone(),
            client_host: self.client_host.clone(),
            username: self.client_username.clone(),
            password: self.client_password.clone(),
            start: self.start_unix(),
            ..SessionEvent::new(EventType::SessionStart)
        });
    }

    pub fn mark_started(&self) {
        self.state.lock().in_flight += 1;
    }

    pub fn mark_stopped(&self) {
        let drained = {
            let mut st = self.state.lock();
            st.in_flight -= 1;
            st.in_flight < 1
        };
        if drained {
            self.end();
        }
    }

    /// Count the caller as in-flight work until the guard is dropped.
    pub fn track(self: &Arc<Self>) -> ActivityGuard {
        self.mark_started();
        ActivityGuard {
            session: self.clone(),
        }
    }

    /// Finish the session. Only the first call has any effect.
    pub fn end(&self) {
        let (stop, request_types, term_rows, term_cols) = {
            let mut st = self.state.lock();
            if !st.active {
                return;
            }
            st.active = false;
            let stop = Utc::now();
            st.stop = Some(stop);
            (stop, st.request_types.clone(), st.term_rows, st.term_cols)
        };
        let length = (stop - self.start).num_seconds();

        self.handle_event(SessionEvent {
            stop: stop.timestamp(),
            length,
            ..SessionEvent::new(EventType::SessionStop)
        });
        self.signal.send_modify(|s| s.ended = true);

        let event_count = self.event_count();
        let filename = self.log.lock().finalize(event_count);

        let summary = SessionSummary {
            start: self.start_unix(),
            stop: stop.timestamp(),
            length,
            client_host: self.client_host.clone(),
            server_host: self.server_host.clone(),
            username: self.client_username.clone(),
            password: self.client_password.clone(),
            term_rows,
            term_cols,
            filename: filename.clone(),
            requests: request_types,
        };
        if let Err(e) = log::append_index(&self.log_dir, &summary) {
            warn!(session = %self.key, error = %e, "Session index write failed");
        }

        self.closed.cancel();
        info!(
            session = %self.key,
            username = %self.client_username,
            events = event_count,
            file = %filename,
            "Session finalized"
        );
    }
}

/// Scope guard pairing `mark_started` with `mark_stopped`.
pub struct ActivityGuard {
    session: Arc<Session>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        debug!(session = %self.session.key, "Session task finished");
        self.session.mark_stopped();
    }
}
