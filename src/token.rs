//! Access-token store.
//!
//! The access token is the one shared secret that gates login and every
//! mutating route. Only a salted SHA-256 digest is kept, and on disk that
//! digest sits inside a ChaCha20-Poly1305 blob keyed by a machine-derived key.
//! The store moves from unconfigured to configured exactly once; the only way
//! back is deleting the file out of band.

use std::path::{Path, PathBuf};

use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Name of the encrypted token file inside the data directory.
pub const TOKEN_FILE: &str = "security.dat";

const MIN_TOKEN_LEN: usize = 4;
const MAX_TOKEN_LEN: usize = 64;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("an access token is already configured")]
    AlreadyConfigured,
    #[error("no access token is configured")]
    NotConfigured,
    #[error("token must be 4-64 printable characters without spaces")]
    InvalidFormat,
    #[error("current token does not match")]
    Mismatch,
    #[error("token store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("token store is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredDigest {
    version: u8,
    salt: String,
    hash: String,
}

#[derive(Clone)]
struct SaltedDigest {
    salt: [u8; 16],
    hash: [u8; 32],
}

impl SaltedDigest {
    fn compute(token: &str) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let hash = salted_hash(&salt, token);
        Self { salt, hash }
    }

    fn matches(&self, candidate: &str) -> bool {
        salted_hash(&self.salt, candidate)[..].ct_eq(&self.hash[..]).into()
    }
}

fn salted_hash(salt: &[u8], token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Shared-secret store with optional file persistence.
pub struct TokenStore {
    path: Option<PathBuf>,
    key: [u8; 32],
    digest: Mutex<Option<SaltedDigest>>,
}

impl TokenStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            key: machine_key(),
            digest: Mutex::new(None),
        }
    }

    /// Open the store backed by `<data_dir>/security.dat`, loading the
    /// digest if the file exists.
    pub fn open(data_dir: &Path) -> Result<Self, TokenError> {
        std::fs::create_dir_all(data_dir).map_err(|source| TokenError::Io {
            path: data_dir.to_path_buf(),
            source,
        })?;
        let path = data_dir.join(TOKEN_FILE);
        let key = machine_key();
        let digest = if path.exists() {
            let blob = std::fs::read(&path).map_err(|source| TokenError::Io {
                path: path.clone(),
                source,
            })?;
            let digest = decode_blob(&key, &blob)?;
            tracing::info!(path = %path.display(), "loaded access token");
            Some(digest)
        } else {
            tracing::info!(path = %path.display(), "no access token configured yet");
            None
        };
        Ok(Self {
            path: Some(path),
            key,
            digest: Mutex::new(digest),
        })
    }

    /// Generate a fresh human-typable token, e.g. `4F2-A9C`.
    pub fn generate() -> String {
        let mut bytes = [0u8; 3];
        rand::thread_rng().fill(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
        format!("{}-{}", &hex[..3], &hex[3..])
    }

    pub fn is_configured(&self) -> bool {
        self.digest.lock().is_some()
    }

    /// Configure the token. Fails if one is already set.
    pub fn set_token(&self, value: &str) -> Result<(), TokenError> {
        check_format(value)?;
        let mut guard = self.digest.lock();
        if guard.is_some() {
            return Err(TokenError::AlreadyConfigured);
        }
        let digest = SaltedDigest::compute(value);
        self.persist(&digest)?;
        *guard = Some(digest);
        tracing::info!("access token configured");
        Ok(())
    }

    /// Replace the token after proving knowledge of the current one.
    pub fn rotate(&self, current: &str, new_value: &str) -> Result<(), TokenError> {
        check_format(new_value)?;
        let mut guard = self.digest.lock();
        let Some(existing) = guard.as_ref() else {
            return Err(TokenError::NotConfigured);
        };
        if !existing.matches(current) {
            return Err(TokenError::Mismatch);
        }
        let digest = SaltedDigest::compute(new_value);
        self.persist(&digest)?;
        *guard = Some(digest);
        tracing::info!("access token rotated");
        Ok(())
    }

    /// Constant-time check of `candidate` against the stored digest.
    pub fn validate(&self, candidate: &str) -> bool {
        let guard = self.digest.lock();
        let valid = guard.as_ref().is_some_and(|d| d.matches(candidate));
        if !valid {
            tracing::debug!("access token validation failed");
        }
        valid
    }

    fn persist(&self, digest: &SaltedDigest) -> Result<(), TokenError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let blob = encode_blob(&self.key, digest)?;
        let tmp = path.with_extension("dat.tmp");
        std::fs::write(&tmp, &blob)
            .and_then(|_| restrict_permissions(&tmp))
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|source| TokenError::Io {
                path: path.clone(),
                source,
            })
    }
}

fn check_format(value: &str) -> Result<(), TokenError> {
    let len = value.chars().count();
    let printable = value.chars().all(|c| !c.is_control() && !c.is_whitespace());
    if (MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&len) && printable {
        Ok(())
    } else {
        Err(TokenError::InvalidFormat)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Symmetric key derived from stable machine properties.
/// Stable per-install identifiers, first readable one wins.
const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

fn machine_key() -> [u8; 32] {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    let paths: Vec<&Path> = MACHINE_ID_PATHS.iter().map(Path::new).collect();
    let machine_id = read_machine_id(&paths);
    let mut hasher = Sha256::new();
    hasher.update(b"deskgate-token-store-v2");
    hasher.update(host.as_bytes());
    hasher.update([0u8]);
    hasher.update(machine_id.as_bytes());
    hasher.finalize().into()
}

fn read_machine_id(candidates: &[&Path]) -> String {
    candidates
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .unwrap_or_default()
}

fn encode_blob(key: &[u8; 32], digest: &SaltedDigest) -> Result<Vec<u8>, TokenError> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let stored = StoredDigest {
        version: 1,
        salt: b64.encode(digest.salt),
        hash: b64.encode(digest.hash),
    };
    let plaintext =
        serde_json::to_vec(&stored).map_err(|e| TokenError::Corrupt(e.to_string()))?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
        .map_err(|e| TokenError::Corrupt(format!("encrypt: {e}")))?;

    let mut blob = nonce_bytes.to_vec();
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn decode_blob(key: &[u8; 32], blob: &[u8]) -> Result<SaltedDigest, TokenError> {
    if blob.len() <= NONCE_LEN {
        return Err(TokenError::Corrupt("file too short".into()));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| TokenError::Corrupt(
            "decryption failed (different machine? run `deskgate reset-token`)".into(),
        ))?;
    let stored: StoredDigest =
        serde_json::from_slice(&plaintext).map_err(|e| TokenError::Corrupt(e.to_string()))?;

    let b64 = base64::engine::general_purpose::STANDARD;
    let salt = b64
        .decode(&stored.salt)
        .map_err(|e| TokenError::Corrupt(e.to_string()))?;
    let hash = b64
        .decode(&stored.hash)
        .map_err(|e| TokenError::Corrupt(e.to_string()))?;
    Ok(SaltedDigest {
        salt: salt
            .try_into()
            .map_err(|_| TokenError::Corrupt("bad salt length".into()))?,
        hash: hash
            .try_into()
            .map_err(|_| TokenError::Corrupt("bad hash length".into()))?,
    })
}
