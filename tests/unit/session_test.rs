use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sshproxyplus::proxy::{EventCallback, ProxyUser};
use sshproxyplus::session::events::{Direction, EventType, SessionEvent, Stream};
use sshproxyplus::session::log::{read_index, SCAN_THRESHOLD};
use sshproxyplus::session::registry::SessionRegistry;
use sshproxyplus::session::{Session, SessionParams};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn make_session(dir: &TempDir, key: &str, user: Arc<ProxyUser>) -> Arc<Session> {
    Session::new(SessionParams {
        key,
        client_host: "198.51.100.7:50000",
        server_host: "10.0.0.1:22",
        client_username: &user.username.clone(),
        client_password: &user.password.clone(),
        user,
        log_dir: dir.path(),
        close: CancellationToken::new(),
    })
}

fn alice() -> Arc<ProxyUser> {
    Arc::new(ProxyUser::new("alice", "pw", "10.0.0.1:22", "", ""))
}

#[test]
fn test_begin_records_start_event() {
    let dir = TempDir::new().unwrap();
    let session = make_session(&dir, "0.0.0.0:2222:198.51.100.7:50000", alice());
    session.begin();
    let events = session.events_since(0);
    assert_eq!(events.len(), 1);
    let start = &events[0];
    assert_eq!(start.event_type, EventType::SessionStart);
    assert_eq!(start.key, "0.0.0.0:2222:198.51.100.7:50000");
    assert_eq!(start.username, "alice");
    assert_eq!(start.password, "pw");
    assert_eq!(start.client_host, "198.51.100.7:50000");
    assert_eq!(start.offset, 0);
    assert_eq!(start.start, session.start_unix());
    assert!(session.is_active());
}

#[test]
fn test_counters_start_at_one() {
    let dir = TempDir::new().unwrap();
    let session = make_session(&dir, "k", alice());
    assert_eq!(session.next_channel_id(), 1);
    assert_eq!(session.next_channel_id(), 2);
    assert_eq!(session.next_request_id("pty-req"), 1);
    assert_eq!(session.next_request_id("shell"), 2);
}

#[test]
fn test_last_guard_ends_session_once() {
    let dir = TempDir::new().unwrap();
    let session = make_session(&dir, "k", alice());
    let closed = session.closed();
    session.begin();

    let a = session.track();
    let b = session.track();
    drop(a);
    assert!(session.is_active());
    assert!(!closed.is_cancelled());

    drop(b);
    assert!(!session.is_active());
    assert!(closed.is_cancelled());

    // A second end is a no-op.
    session.end();
    let stops = session
        .events_since(0)
        .iter()
        .filter(|e| e.event_type == EventType::SessionStop)
        .count();
    assert_eq!(stops, 1);
}

#[test]
fn test_end_writes_log_and_index() {
    let dir = TempDir::new().unwrap();
    let session = make_session(&dir, "k", alice());
    session.begin();
    session.next_request_id("pty-req");
    session.set_term_size(24, 80);
    for i in 0..SCAN_THRESHOLD {
        session.handle_event(SessionEvent::message(
            Direction::Incoming,
            Stream::Stdout,
            1,
            format!("line {i}\n").into_bytes(),
        ));
    }
    session.end();

    let log = std::fs::read_to_string(dir.path().join("k.log.json")).unwrap();
    let events: Vec<SessionEvent> = serde_json::from_str(&log).unwrap();
    assert_eq!(events.len(), SCAN_THRESHOLD + 2);
    assert_eq!(events.last().unwrap().event_type, EventType::SessionStop);

    let index = read_index(dir.path()).unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index[0].filename, "k.log.json");
    assert_eq!(index[0].username, "alice");
    assert_eq!(index[0].requests, vec!["pty-req".to_string()]);
    assert_eq!((index[0].term_rows, index[0].term_cols), (24, 80));
}

#[test]
fn test_short_session_log_is_renamed_scan() {
    let dir = TempDir::new().unwrap();
    let session = make_session(&dir, "short", alice());
    session.begin();
    session.end();
    assert!(dir.path().join("short.log.json.scan").exists());
    assert!(!dir.path().join("short.log.json").exists());
    assert_eq!(session.log_filename(), "short.log.json.scan");
}

#[test]
fn test_offsets_are_relative_to_start() {
    let dir = TempDir::new().unwrap();
    let session = make_session(&dir, "k", alice());
    session.begin();
    std::thread::sleep(std::time::Duration::from_millis(20));
    let ev = session.handle_event(SessionEvent::window_resize(30, 100));
    assert!(ev.offset >= 20, "offset was {}", ev.offset);
}

#[test]
fn test_subscribers_see_progress_and_end() {
    let dir = TempDir::new().unwrap();
    let session = make_session(&dir, "k", alice());
    let rx = session.subscribe();
    session.begin();
    assert_eq!(rx.borrow().events, 1);
    assert!(!rx.borrow().ended);
    session.end();
    assert_eq!(rx.borrow().events, 2);
    assert!(rx.borrow().ended);
}

#[test]
fn test_callbacks_fire_for_subscribed_types() {
    let dir = TempDir::new().unwrap();
    let user = alice();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    user.add_callback(
        "cb".into(),
        EventCallback::new([EventType::NewMessage], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let session = make_session(&dir, "k", user);
    session.begin();
    session.handle_event(SessionEvent::message(Direction::Outgoing, Stream::Stdout, 1, b"ls\n".to_vec()));
    session.handle_event(SessionEvent::window_resize(1, 1));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_registry_renames_stale_key() {
    let dir = TempDir::new().unwrap();
    let mut registry = SessionRegistry::default();
    let first = make_session(&dir, "dup", alice());
    let second = make_session(&dir, "dup", alice());
    registry.register(first.clone());
    registry.register(second.clone());

    assert_eq!(registry.keys(), vec!["dup".to_string(), "dup_old".to_string()]);
    assert!(Arc::ptr_eq(&registry.get("dup").unwrap(), &second));
    assert!(Arc::ptr_eq(&registry.get("dup_old").unwrap(), &first));
    let owned: Vec<String> = registry
        .user_sessions("alice:pw")
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(owned, vec!["dup".to_string(), "dup_old".to_string()]);
}

#[test]
fn test_registry_active_keys() {
    let dir = TempDir::new().unwrap();
    let mut registry = SessionRegistry::default();
    let live = make_session(&dir, "live", alice());
    let done = make_session(&dir, "done", alice());
    done.end();
    registry.register(live);
    registry.register(done);
    assert_eq!(registry.active_keys(), vec!["live".to_string()]);
    assert_eq!(registry.len(), 2);
}
