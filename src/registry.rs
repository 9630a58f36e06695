//! Registry Manager: credential resolution, image-name parsing, and a
//! size-bounded, `redb`-persisted image cache (§4.10).
//!
//! Credential storage is grounded on the corpus's `secrets.rs`, but swaps its
//! hand-rolled XOR cipher for `secrecy::SecretString` (see DESIGN.md) — the
//! wrapper type, not an at-rest encryption scheme, is what the spec asks for.
//! `ImageCache`'s persistence is grounded on `mondalsuman-boternity`'s use of
//! `redb` for its workflow state store, adapted to a simple size-LRU table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use redb::{Database, ReadableTable, TableDefinition};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const CACHE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("image_cache");

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("malformed image reference '{0}'")]
    MalformedImageReference(String),
    #[error("docker config at {0} is not valid JSON")]
    MalformedDockerConfig(PathBuf),
    #[error(transparent)]
    Db(#[from] redb::Error),
    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),
    #[error(transparent)]
    Table(#[from] redb::TableError),
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Registry credentials, never `Debug`/`Display`-printed in full thanks to
/// [`SecretString`]'s redaction.
#[derive(Clone)]
pub enum Credentials {
    Password { username: String, password: SecretString },
    Token { token: SecretString },
}

/// `[registry[:port]/][namespace/]name[:tag]`, defaults applied per §4.10.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImage {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    pub tag: String,
}

impl std::fmt::Display for ParsedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}:{}", self.registry, self.namespace, self.name, self.tag)
    }
}

/// `registry.io:5000/ns/name:tag` → parsed parts, with `docker.io`/`library`
/// defaults applied and bare `index.docker.io`/`""` normalized to `docker.io`.
pub fn parse_image_name(image: &str) -> Result<ParsedImage, RegistryError> {
    if image.is_empty() {
        return Err(RegistryError::MalformedImageReference(image.to_string()));
    }
    let (name_and_tag, digest_stripped) = match image.split_once('@') {
        Some((rest, _digest)) => (rest, true),
        None => (image, false),
    };
    let _ = digest_stripped;

    let mut parts: Vec<&str> = name_and_tag.split('/').collect();
    let registry = if parts.len() > 1 && (parts[0].contains('.') || parts[0].contains(':') || parts[0] == "localhost") {
        normalize_registry_host(parts.remove(0))
    } else {
        "docker.io".to_string()
    };

    let namespace = if parts.len() > 1 {
        parts.remove(0).to_string()
    } else {
        "library".to_string()
    };

    let last = parts
        .into_iter()
        .next()
        .ok_or_else(|| RegistryError::MalformedImageReference(image.to_string()))?;
    let (name, tag) = match last.rsplit_once(':') {
        Some((n, t)) => (n.to_string(), t.to_string()),
        None => (last.to_string(), "latest".to_string()),
    };

    Ok(ParsedImage {
        registry,
        namespace,
        name,
        tag,
    })
}

fn normalize_registry_host(host: &str) -> String {
    let stripped = host
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    match stripped {
        "" | "index.docker.io" => "docker.io".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfigFile {
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
}

/// Loads `~/.docker/config.json`-style credentials: `auth` is base64 of
/// `user:pass`. Registries absent from the file simply have no credentials.
pub fn load_docker_config(path: &Path) -> Result<HashMap<String, Credentials>, RegistryError> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: DockerConfigFile =
        serde_json::from_str(&raw).map_err(|_| RegistryError::MalformedDockerConfig(path.to_path_buf()))?;

    let mut out = HashMap::new();
    for (host, entry) in parsed.auths {
        let Some(encoded) = entry.auth else { continue };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
            continue;
        };
        let Ok(decoded) = String::from_utf8(decoded) else { continue };
        let Some((user, pass)) = decoded.split_once(':') else { continue };
        let host = normalize_registry_host(&host);
        out.insert(
            host,
            Credentials::Password {
                username: user.to_string(),
                password: SecretString::from(pass.to_string()),
            },
        );
    }
    Ok(out)
}

impl Credentials {
    /// Exposes the secret for handoff to a subprocess, never for logging.
    pub fn expose_password(&self) -> Option<&str> {
        match self {
            Self::Password { password, .. } => Some(password.expose_secret()),
            Self::Token { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    local_path: String,
    size_bytes: u64,
    last_used_unix: i64,
}

const DEFAULT_CACHE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Size-bounded, `redb`-persisted record of locally cached images. Eviction
/// removes the on-disk path as well as the table row.
pub struct ImageCache {
    db: Database,
    max_bytes: u64,
}

impl ImageCache {
    pub fn open(db_path: &Path) -> Result<Self, RegistryError> {
        Self::open_with_capacity(db_path, DEFAULT_CACHE_BYTES)
    }

    pub fn open_with_capacity(db_path: &Path, max_bytes: u64) -> Result<Self, RegistryError> {
        let db = Database::create(db_path)?;
        {
            let tx = db.begin_write()?;
            {
                let _ = tx.open_table(CACHE_TABLE)?;
            }
            tx.commit()?;
        }
        Ok(Self { db, max_bytes })
    }

    pub fn record(&self, image: &str, local_path: &str, size_bytes: u64, now_unix: i64) -> Result<(), RegistryError> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(CACHE_TABLE)?;
            let record = CacheRecord {
                local_path: local_path.to_string(),
                size_bytes,
                last_used_unix: now_unix,
            };
            let bytes = serde_json::to_vec(&record).expect("cache record always serializes");
            table.insert(image, bytes.as_slice())?;
        }
        tx.commit()?;
        self.evict_if_over_capacity(now_unix)
    }

    pub fn touch(&self, image: &str, now_unix: i64) -> Result<bool, RegistryError> {
        let existing = self.get(image)?;
        let Some(mut record) = existing else { return Ok(false) };
        record.last_used_unix = now_unix;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(CACHE_TABLE)?;
            let bytes = serde_json::to_vec(&record).expect("cache record always serializes");
            table.insert(image, bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn get(&self, image: &str) -> Result<Option<CacheRecord>, RegistryError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(CACHE_TABLE)?;
        match table.get(image)? {
            Some(value) => Ok(Some(
                serde_json::from_slice(value.value()).expect("stored cache record is always valid json"),
            )),
            None => Ok(None),
        }
    }

    pub fn total_bytes(&self) -> Result<u64, RegistryError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(CACHE_TABLE)?;
        let mut total = 0u64;
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: CacheRecord = serde_json::from_slice(value.value()).expect("stored cache record is always valid json");
            total += record.size_bytes;
        }
        Ok(total)
    }

    /// Evicts least-recently-used entries (removing their on-disk paths)
    /// until the cache is back under `max_bytes`.
    fn evict_if_over_capacity(&self, _now_unix: i64) -> Result<(), RegistryError> {
        loop {
            let total = self.total_bytes()?;
            if total <= self.max_bytes {
                return Ok(());
            }
            let victim = {
                let tx = self.db.begin_read()?;
                let table = tx.open_table(CACHE_TABLE)?;
                let mut oldest: Option<(String, CacheRecord)> = None;
                for entry in table.iter()? {
                    let (key, value) = entry?;
                    let record: CacheRecord =
                        serde_json::from_slice(value.value()).expect("stored cache record is always valid json");
                    if oldest.as_ref().map(|(_, r)| record.last_used_unix < r.last_used_unix).unwrap_or(true) {
                        oldest = Some((key.value().to_string(), record));
                    }
                }
                oldest
            };
            let Some((key, record)) = victim else { return Ok(()) };
            if let Err(e) = std::fs::remove_file(&record.local_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %record.local_path, error = %e, "failed to remove evicted cache entry");
                }
            }
            let tx = self.db.begin_write()?;
            {
                let mut table = tx.open_table(CACHE_TABLE)?;
                table.remove(key.as_str())?;
            }
            tx.commit()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_bare_name_with_defaults() {
        let parsed = parse_image_name("alpine").unwrap();
        assert_eq!(parsed.registry, "docker.io");
        assert_eq!(parsed.namespace, "library");
        assert_eq!(parsed.name, "alpine");
        assert_eq!(parsed.tag, "latest");
    }

    #[test]
    fn parses_full_reference() {
        let parsed = parse_image_name("registry.example.com:5000/team/app:v2").unwrap();
        assert_eq!(parsed.registry, "registry.example.com:5000");
        assert_eq!(parsed.namespace, "team");
        assert_eq!(parsed.name, "app");
        assert_eq!(parsed.tag, "v2");
    }

    #[test]
    fn index_docker_io_normalizes() {
        let parsed = parse_image_name("index.docker.io/library/alpine:3.19").unwrap();
        assert_eq!(parsed.registry, "docker.io");
    }

    #[test]
    fn docker_config_decodes_auth_blob() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:hunter2");
        std::fs::write(
            &config_path,
            format!(r#"{{"auths": {{"docker.io": {{"auth": "{encoded}"}}}}}}"#),
        )
        .unwrap();
        let creds = load_docker_config(&config_path).unwrap();
        let cred = creds.get("docker.io").unwrap();
        assert_eq!(cred.expose_password(), Some("hunter2"));
    }

    #[test]
    fn cache_records_and_evicts_by_lru() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("cache.redb");
        let cache = ImageCache::open_with_capacity(&db_path, 150).unwrap();

        let file_a = dir.path().join("a.tar");
        let file_b = dir.path().join("b.tar");
        std::fs::write(&file_a, "x").unwrap();
        std::fs::write(&file_b, "y").unwrap();

        cache.record("a", file_a.to_str().unwrap(), 100, 1).unwrap();
        cache.record("b", file_b.to_str().unwrap(), 100, 2).unwrap();

        assert!(cache.total_bytes().unwrap() <= 150);
        assert!(!file_a.exists());
        assert!(file_b.exists());
    }
}
