//! Provider Key Store (§4.3): JWT provider configuration (audience, allowed
//! issuers, HS secret and/or RS/ES/PS public keys), loaded from
//! `<prefix>/certs/<providerId>/provider.json` and reloaded on a heartbeat.
//! Reload is gated by an exclusive lock file so that, if several processes
//! share the same cert directory, only one of them reloads at a time; a
//! contended lock is retried once after one second and otherwise left for
//! the next heartbeat.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct ProviderKey {
    pub kid: String,
    pub family: KeyFamily,
    pub public_key_der: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ec,
}

#[derive(Debug, Clone)]
pub struct Provider {
    pub id: String,
    pub audience: String,
    pub issuers: HashSet<String>,
    pub secret: Option<Vec<u8>>,
    pub public_keys: HashMap<String, ProviderKey>,
    pub auth_uri: String,
    pub token_uri: String,
}

impl Provider {
    pub fn allows_issuer(&self, iss: &str) -> bool {
        self.issuers.contains(iss)
    }
}

#[derive(Debug, Deserialize)]
struct ProviderManifest {
    audience: String,
    issuers: Vec<String>,
    #[serde(default)]
    secret_base64: Option<String>,
    #[serde(default)]
    auth_uri: String,
    #[serde(default)]
    token_uri: String,
    #[serde(default)]
    keys: Vec<ManifestKey>,
}

#[derive(Debug, Deserialize)]
struct ManifestKey {
    kid: String,
    family: String,
    public_key_der_base64: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderLoadError {
    #[error("failed reading provider directory: {0}")]
    Io(String),
    #[error("malformed provider manifest for {0}: {1}")]
    Malformed(String, String),
}

pub struct ProviderKeyStore {
    certs_prefix: PathBuf,
    providers: RwLock<HashMap<String, Arc<Provider>>>,
}

impl ProviderKeyStore {
    pub fn new(certs_prefix: impl Into<PathBuf>) -> Self {
        Self {
            certs_prefix: certs_prefix.into(),
            providers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn by_id(&self, id: &str) -> Option<Arc<Provider>> {
        self.providers.read().await.get(id).cloned()
    }

    pub async fn by_audience(&self, audience: &str) -> Option<Arc<Provider>> {
        self.providers
            .read()
            .await
            .values()
            .find(|p| p.audience == audience)
            .cloned()
    }

    /// Scan `<prefix>/certs/*/provider.json` and atomically replace each
    /// provider entry found. A provider directory that fails to parse is
    /// logged and skipped rather than aborting the whole reload — one bad
    /// manifest must not take every other provider offline.
    pub async fn reload_all(&self) -> Result<usize, ProviderLoadError> {
        let entries = match fs::read_dir(&self.certs_prefix) {
            Ok(e) => e,
            Err(e) => return Err(ProviderLoadError::Io(e.to_string())),
        };

        let mut loaded = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if id == "lock" {
                continue;
            }
            match load_one(&path, id) {
                Ok(provider) => {
                    let mut providers = self.providers.write().await;
                    providers.insert(id.to_string(), Arc::new(provider));
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(target: "gateway.auth.providers", provider = id, error = %e, "skipping provider with invalid manifest");
                }
            }
        }
        tracing::info!(target: "gateway.auth.providers", loaded, "provider key store reloaded");
        Ok(loaded)
    }

    /// Reload gated by the lock file at `<prefix>/certs/lock`. On
    /// contention, retries once after one second; if still contended, skips
    /// and leaves the next heartbeat to try again (§4.3, §5).
    pub async fn reload_with_lock(&self) -> Result<usize, ProviderLoadError> {
        let lock_path = self.certs_prefix.join("lock");
        if let Some(guard) = try_acquire_lock(&lock_path) {
            let result = self.reload_all().await;
            drop(guard);
            return result;
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Some(guard) = try_acquire_lock(&lock_path) {
            let result = self.reload_all().await;
            drop(guard);
            return result;
        }

        tracing::debug!(target: "gateway.auth.providers", "reload skipped, lock contended");
        Ok(0)
    }
}

/// RAII guard that removes the lock file on drop.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn try_acquire_lock(lock_path: &Path) -> Option<LockGuard> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
        .ok()
        .map(|_| LockGuard {
            path: lock_path.to_path_buf(),
        })
}

fn load_one(dir: &Path, id: &str) -> Result<Provider, ProviderLoadError> {
    let manifest_path = dir.join("provider.json");
    let raw = fs::read_to_string(&manifest_path)
        .map_err(|e| ProviderLoadError::Io(format!("{}: {e}", manifest_path.display())))?;
    let manifest: ProviderManifest = serde_json::from_str(&raw)
        .map_err(|e| ProviderLoadError::Malformed(id.to_string(), e.to_string()))?;

    let secret = manifest
        .secret_base64
        .map(|s| STANDARD.decode(s))
        .transpose()
        .map_err(|e| ProviderLoadError::Malformed(id.to_string(), e.to_string()))?;

    let mut public_keys = HashMap::new();
    for key in manifest.keys {
        let family = match key.family.as_str() {
            "rsa" => KeyFamily::Rsa,
            "ec" => KeyFamily::Ec,
            other => {
                return Err(ProviderLoadError::Malformed(
                    id.to_string(),
                    format!("unknown key family: {other}"),
                ))
            }
        };
        let der = STANDARD
            .decode(key.public_key_der_base64)
            .map_err(|e| ProviderLoadError::Malformed(id.to_string(), e.to_string()))?;
        public_keys.insert(
            key.kid.clone(),
            ProviderKey {
                kid: key.kid,
                family,
                public_key_der: der,
            },
        );
    }

    Ok(Provider {
        id: id.to_string(),
        audience: manifest.audience,
        issuers: manifest.issuers.into_iter().collect(),
        secret,
        public_keys,
        auth_uri: manifest.auth_uri,
        token_uri: manifest.token_uri,
    })
}
