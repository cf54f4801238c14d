use anyhow::{Context, Result};
use russh::keys::{Algorithm, HashAlg, PrivateKey};
use std::path::Path;
use tracing::{debug, info};

/// Host key for a proxy listener.
///
/// With a path, the key is read from it, or generated and written there on
/// first use so restarts keep the same identity. Without one, a fresh
/// in-memory key is generated.
pub fn host_key_or_generate(path: Option<&Path>) -> Result<PrivateKey> {
    match path {
        Some(path) if path.exists() => read_host_key(path),
        Some(path) => {
            let key = random_ed25519()?;
            write_host_key(&key, path)?;
            info!(path = %path.display(), fingerprint = %fingerprint(&key), "Generated host key");
            Ok(key)
        }
        None => {
            let key = random_ed25519()?;
            debug!(fingerprint = %fingerprint(&key), "Using ephemeral host key");
            Ok(key)
        }
    }
}

/// Load the PEM host key at `path`, generating and saving an Ed25519 key
/// there if the file does not exist.
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    host_key_or_generate(Some(path))
}

/// SHA-256 fingerprint of the key's public half, as printed by ssh-keygen.
pub fn fingerprint(key: &PrivateKey) -> String {
    key.public_key().fingerprint(HashAlg::Sha256).to_string()
}

fn read_host_key(path: &Path) -> Result<PrivateKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("reading host key: {}", path.display()))?;
    russh::keys::decode_secret_key(&pem, None)
        .map_err(|e| anyhow::anyhow!("decoding host key {}: {}", path.display(), e))
}

fn random_ed25519() -> Result<PrivateKey> {
    PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| anyhow::anyhow!("Ed25519 key generation failed: {}", e))
}

fn write_host_key(key: &PrivateKey, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory: {}", parent.display()))?;
    }

    let mut pem = Vec::new();
    russh::keys::encode_pkcs8_pem(key, &mut pem)
        .map_err(|e| anyhow::anyhow!("encoding host key: {}", e))?;

    // Created 0600 so the key is never briefly world-readable.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("creating host key file: {}", path.display()))?;
        file.write_all(&pem)
            .with_context(|| format!("writing host key: {}", path.display()))?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, &pem).with_context(|| format!("writing host key: {}", path.display()))?;

    Ok(())
}
