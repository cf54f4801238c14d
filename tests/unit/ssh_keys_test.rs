use sshproxyplus::ssh::keys::{fingerprint, host_key_or_generate, load_or_generate_host_key};
use tempfile::TempDir;

#[test]
fn test_generated_key_is_persisted_and_reused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("keys").join("host_key");
    let first = load_or_generate_host_key(&path).unwrap();
    assert!(path.exists());
    let second = load_or_generate_host_key(&path).unwrap();
    assert_eq!(fingerprint(&first), fingerprint(&second));
}

#[cfg(unix)]
#[test]
fn test_generated_key_is_private() {
    use std::os::unix::fs::PermissionsExt;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("host_key");
    load_or_generate_host_key(&path).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_ephemeral_keys_differ() {
    let a = host_key_or_generate(None).unwrap();
    let b = host_key_or_generate(None).unwrap();
    assert_ne!(fingerprint(&a), fingerprint(&b));
    assert!(fingerprint(&a).starts_with("SHA256:"));
}

#[test]
fn test_garbage_key_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("host_key");
    std::fs::write(&path, "not a key").unwrap();
    let err = host_key_or_generate(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("decoding host key"));
}
