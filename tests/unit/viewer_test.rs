use russh::keys::{Algorithm, PrivateKey};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use sshproxyplus::error::ControlError;
use sshproxyplus::proxy::{Proxy, ProxyConfig, ProxyUser};
use sshproxyplus::session::{Session, SessionParams};
use sshproxyplus::utils::SECRET_ALPHABET;
use sshproxyplus::viewer::{SessionViewer, ViewerType, VIEWER_NO_EXPIRATION, VIEWER_SECRET_LEN};

fn proxy() -> Proxy {
    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
    let proxy = Proxy::new(ProxyConfig::default(), key);
    proxy.add_user(ProxyUser::new("alice", "pw", "", "", "")).unwrap();
    proxy.add_user(ProxyUser::new("bob", "pw", "", "", "")).unwrap();
    proxy
}

fn add_session(proxy: &Proxy, dir: &TempDir, key: &str, user_key: &str) -> Arc<Session> {
    let user = proxy.user(user_key).unwrap();
    let session = Session::new(SessionParams {
        key,
        client_host: "c",
        server_host: "s",
        client_username: "",
        client_password: "",
        user,
        log_dir: dir.path(),
        close: CancellationToken::new(),
    });
    proxy.register_session(session.clone());
    session
}

#[test]
fn test_secret_shape() {
    let user = Arc::new(ProxyUser::new("a", "b", "", "", ""));
    let viewer = SessionViewer::for_user(user.clone());
    assert_eq!(viewer.secret.len(), VIEWER_SECRET_LEN);
    assert!(viewer.secret.bytes().all(|b| SECRET_ALPHABET.contains(&b)));
    assert_ne!(viewer.secret, SessionViewer::for_user(user).secret);
    assert_eq!(viewer.expiration, VIEWER_NO_EXPIRATION);
    assert_eq!(viewer.viewer_type, ViewerType::List);
}

#[test]
fn test_user_viewer_sees_only_that_users_sessions() {
    let dir = TempDir::new().unwrap();
    let proxy = proxy();
    add_session(&proxy, &dir, "s1", "alice:pw");
    add_session(&proxy, &dir, "s2", "alice:pw");
    add_session(&proxy, &dir, "s3", "bob:pw");

    let viewer = proxy.create_user_viewer("alice").unwrap();
    let keys: Vec<String> = proxy
        .viewer_sessions(&viewer.secret)
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec!["s1".to_string(), "s2".to_string()]);
}

#[test]
fn test_session_viewer_sees_one_session() {
    let dir = TempDir::new().unwrap();
    let proxy = proxy();
    add_session(&proxy, &dir, "s1", "alice:pw");
    add_session(&proxy, &dir, "s2", "alice:pw");
    add_session(&proxy, &dir, "s3", "bob:pw");

    let viewer = proxy.create_session_viewer("alice", "s2").unwrap();
    assert_eq!(viewer.viewer_type, ViewerType::Single);
    let sessions = proxy.viewer_sessions(&viewer.secret).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].0, "s2");

    // A session of another user is not visible even by key.
    let wrong = proxy.create_session_viewer("alice", "s3").unwrap();
    assert!(proxy.viewer_sessions(&wrong.secret).unwrap().is_empty());
}

#[test]
fn test_viewer_for_unknown_user() {
    let proxy = proxy();
    assert!(matches!(
        proxy.create_user_viewer("mallory"),
        Err(ControlError::UserNotFound(_))
    ));
}

#[test]
fn test_viewer_lookups() {
    let proxy = proxy();
    let a = proxy.create_session_viewer("alice", "s1").unwrap();
    let b = proxy.create_user_viewer("bob").unwrap();

    assert_eq!(proxy.viewer(&a.secret).unwrap().secret, a.secret);
    assert_eq!(proxy.viewer_by_session_key("s1").unwrap().secret, a.secret);
    assert_eq!(proxy.viewer_by_username("bob").unwrap().secret, b.secret);
    assert_eq!(proxy.viewers_by_username("alice").len(), 1);
    assert_eq!(proxy.viewers().len(), 2);
    assert!(matches!(proxy.viewer("nope"), Err(ControlError::ViewerNotFound)));
    assert!(matches!(proxy.viewer_by_session_key("s9"), Err(ControlError::ViewerNotFound)));

    proxy.remove_viewer(&a.secret).unwrap();
    assert!(proxy.viewer(&a.secret).is_err());
    assert!(proxy.remove_viewer(&a.secret).is_err());
}

#[test]
fn test_viewers_survive_proxy_json() {
    let proxy = proxy();
    let viewer = proxy.create_user_viewer("alice").unwrap();
    let json = serde_json::to_vec(&proxy).unwrap();

    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
    let restored = Proxy::from_json(&json, key).unwrap();
    let back = restored.viewer(&viewer.secret).unwrap();
    assert_eq!(back.user.key(), "alice:pw");
    // The restored viewer shares the restored user entry.
    assert!(Arc::ptr_eq(&back.user, &restored.user("alice:pw").unwrap()));
}
