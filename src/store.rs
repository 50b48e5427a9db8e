//! Disk-backed certificate store.
//!
//! The store owns one directory holding the root CA (`<name>.crt`,
//! `<name>.key`) and one certificate/key pair per issued hostname. Leaf pairs
//! are cached in memory after they have been persisted and read back.

use std::{
    collections::HashMap,
    env, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::{
    ca::{self, RootCaOptions, RootCaPem},
    error::{CertError, CertResult},
    subject::SubjectOverrides,
};

pub const DEFAULT_STORE_SUBDIR: &str = ".cert";
pub const DEFAULT_ROOT_NAME: &str = "root";
const CERT_EXTENSION: &str = "crt";
const KEY_EXTENSION: &str = "key";
const DIR_MODE_RESTRICTED: u32 = 0o700;
const FILE_MODE_RESTRICTED: u32 = 0o600;
const FILE_MODE_READABLE: u32 = 0o644;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Defaults to `$HOME/.cert`.
    pub dir: Option<PathBuf>,
    /// Defaults to `root`.
    pub name: Option<String>,
    /// Overrides applied to the root CA subject.
    pub subject: SubjectOverrides,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCaFiles {
    pub certificate: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePair {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
    pub roots_generated: u64,
}

#[derive(Debug)]
pub struct CertStore {
    dir: PathBuf,
    name: String,
    root_cert_path: PathBuf,
    root_key_path: PathBuf,
    subject: SubjectOverrides,
    root: RwLock<Option<Arc<RootCaPem>>>,
    cache: Mutex<HashMap<String, CertificatePair>>,
    inflight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
    roots_generated: AtomicU64,
}

impl CertStore {
    pub fn new(options: StoreOptions) -> CertResult<Self> {
        let dir = match options.dir {
            Some(dir) => dir,
            None => default_store_dir()?,
        };
        let dir = std::path::absolute(&dir).map_err(|err| CertError::io("resolve", &dir, err))?;
        let name = options
            .name
            .unwrap_or_else(|| DEFAULT_ROOT_NAME.to_owned());
        validate_file_stem(&name).map_err(|reason| {
            CertError::InvalidConfiguration(format!("root CA name `{name}` {reason}"))
        })?;

        Ok(Self {
            root_cert_path: dir.join(format!("{name}.{CERT_EXTENSION}")),
            root_key_path: dir.join(format!("{name}.{KEY_EXTENSION}")),
            dir,
            name,
            subject: options.subject,
            root: RwLock::new(None),
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
            roots_generated: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_cert_path(&self) -> &Path {
        &self.root_cert_path
    }

    pub fn root_key_path(&self) -> &Path {
        &self.root_key_path
    }

    pub fn leaf_paths(&self, hostname: &str) -> CertResult<(PathBuf, PathBuf)> {
        let hostname = self.normalize_hostname(hostname)?;
        Ok(self.leaf_paths_for(&hostname))
    }

    /// Wipes the store and writes a fresh root CA.
    ///
    /// Leaf entries cached in memory were signed by the previous root, so the
    /// cache and the loaded root are dropped as well.
    pub async fn generate_root_ca(&self) -> CertResult<RootCaFiles> {
        self.clear_certs().await?;
        create_store_dir(&self.dir).await?;

        let options = RootCaOptions {
            subject: self.subject.clone(),
            ..RootCaOptions::default()
        };
        let root = tokio::task::spawn_blocking(move || ca::generate_root_ca(&options))
            .await
            .map_err(|err| CertError::TaskJoin(format!("generate root CA: {err}")))??;

        write_pair(
            (self.root_cert_path.as_path(), root.certificate_pem.as_str()),
            (self.root_key_path.as_path(), root.private_key_pem.as_str()),
        )
        .await?;

        self.reset_memory().await;
        self.roots_generated.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            dir = %self.dir.display(),
            name = %self.name,
            "generated root CA"
        );

        Ok(RootCaFiles {
            certificate: root.certificate_pem,
            key: root.private_key_pem,
        })
    }

    pub async fn get_certificate(&self, hostname: &str) -> CertResult<CertificatePair> {
        let hostname = self.normalize_hostname(hostname)?;
        if let Some(cached) = self.cached(&hostname) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%hostname, "leaf certificate served from cache");
            return Ok(cached);
        }

        let flight = self.inflight_slot(&hostname);
        let _guard = flight.lock.lock().await;
        // Another caller may have finished issuing while we waited.
        if let Some(cached) = self.cached(&hostname) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let root = self.load_root().await?;
        let (cert_path, key_path) = self.leaf_paths_for(&hostname);

        if !all_exist(&[cert_path.as_path(), key_path.as_path()]).await {
            let issue_host = hostname.clone();
            let leaf = tokio::task::spawn_blocking(move || {
                ca::generate_cert_for_hostname(&issue_host, &root)
            })
            .await
            .map_err(|err| CertError::TaskJoin(format!("issue leaf for `{hostname}`: {err}")))??;

            write_pair(
                (cert_path.as_path(), leaf.certificate_pem.as_str()),
                (key_path.as_path(), leaf.private_key_pem.as_str()),
            )
            .await?;
            self.leaves_issued.fetch_add(1, Ordering::Relaxed);
            tracing::info!(%hostname, path = %cert_path.display(), "issued leaf certificate");
        }

        let (cert, key) = tokio::try_join!(read_file(&cert_path), read_file(&key_path))?;
        let pair = CertificatePair { cert, key };
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(hostname, pair.clone());
        Ok(pair)
    }

    pub async fn is_root_ca_exists(&self) -> CertResult<bool> {
        Ok(all_exist(&[self.root_cert_path.as_path(), self.root_key_path.as_path()]).await)
    }

    /// Removes the whole store directory when a root CA is present.
    pub async fn clear_certs(&self) -> CertResult<()> {
        if !self.is_root_ca_exists().await? {
            return Ok(());
        }

        tokio::fs::remove_dir_all(&self.dir)
            .await
            .map_err(|err| CertError::io("remove store directory", &self.dir, err))?;
        self.reset_memory().await;
        tracing::info!(dir = %self.dir.display(), "cleared certificate store");
        Ok(())
    }

    pub async fn root_certificate_pem(&self) -> CertResult<String> {
        read_root_file(&self.root_cert_path).await
    }

    pub fn metrics_snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
            roots_generated: self.roots_generated.load(Ordering::Relaxed),
        }
    }

    async fn load_root(&self) -> CertResult<RootCaPem> {
        if let Some(root) = self.root.read().await.as_ref() {
            return Ok(RootCaPem::clone(root));
        }

        let mut slot = self.root.write().await;
        if let Some(root) = slot.as_ref() {
            return Ok(RootCaPem::clone(root));
        }
        let (certificate_pem, private_key_pem) = tokio::try_join!(
            read_root_file(&self.root_cert_path),
            read_root_file(&self.root_key_path)
        )?;
        let root = Arc::new(RootCaPem {
            certificate_pem,
            private_key_pem,
        });
        *slot = Some(Arc::clone(&root));
        tracing::debug!(path = %self.root_cert_path.display(), "loaded root CA");
        Ok(RootCaPem::clone(&root))
    }

    async fn reset_memory(&self) {
        *self.root.write().await = None;
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn cached(&self, hostname: &str) -> Option<CertificatePair> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(hostname)
            .cloned()
    }

    fn inflight_slot(&self, hostname: &str) -> InflightSlot<'_> {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        InflightSlot {
            inflight: &self.inflight,
            hostname: hostname.to_owned(),
            lock: Arc::clone(inflight.entry(hostname.to_owned()).or_default()),
        }
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn leaf_paths_for(&self, hostname: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{hostname}.{CERT_EXTENSION}")),
            self.dir.join(format!("{hostname}.{KEY_EXTENSION}")),
        )
    }

    fn normalize_hostname(&self, hostname: &str) -> CertResult<String> {
        let trimmed = hostname.trim();
        let mut normalized = trimmed.to_ascii_lowercase();
        if let Some(stripped) = normalized.strip_suffix('.')
            && !stripped.is_empty()
        {
            normalized = stripped.to_owned();
        }
        validate_file_stem(&normalized)
            .map_err(|reason| CertError::InvalidHostname(format!("`{trimmed}` {reason}")))?;
        if normalized == self.name.to_ascii_lowercase() {
            return Err(CertError::InvalidHostname(format!(
                "`{trimmed}` collides with the root CA file name"
            )));
        }
        Ok(normalized)
    }
}

/// A caller's handle on the per-hostname issuance lock. The last handle to
/// go away removes the map entry, including when the request is cancelled.
struct InflightSlot<'a> {
    inflight: &'a Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    hostname: String,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // New handles are only cloned under the map lock, so a count of two
        // (map + this handle) means nobody else is waiting.
        let last = inflight
            .get(&self.hostname)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2);
        if last {
            inflight.remove(&self.hostname);
        }
    }
}

pub fn default_store_dir() -> CertResult<PathBuf> {
    let Some(home) = env::var_os("HOME") else {
        return Err(CertError::InvalidConfiguration(
            "cannot resolve certificate directory: HOME is not set".to_owned(),
        ));
    };
    Ok(Path::new(&home).join(DEFAULT_STORE_SUBDIR))
}

fn validate_file_stem(stem: &str) -> Result<(), &'static str> {
    if stem.is_empty() {
        return Err("must not be empty");
    }
    if stem == "." || stem == ".." || stem.starts_with('.') {
        return Err("must not start with `.`");
    }
    if stem.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control()) {
        return Err("must not contain path separators or control characters");
    }
    Ok(())
}

async fn all_exist(paths: &[&Path]) -> bool {
    for path in paths {
        if !matches!(tokio::fs::try_exists(path).await, Ok(true)) {
            return false;
        }
    }
    true
}

async fn create_store_dir(dir: &Path) -> CertResult<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| CertError::io("create store directory", dir, err))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIR_MODE_RESTRICTED))
            .await
            .map_err(|err| CertError::io("set permissions on", dir, err))?;
    }
    Ok(())
}

async fn read_file(path: &Path) -> CertResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| CertError::io("read", path, err))
}

async fn read_root_file(path: &Path) -> CertResult<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(CertError::NotFound {
            path: path.to_path_buf(),
        }),
        Err(err) => Err(CertError::io("read root CA file", path, err)),
    }
}

/// Writes a certificate and its key concurrently. Each file lands via a
/// temporary sibling and a rename; if either write fails, both final paths
/// are removed so a half-written pair is never picked up later.
async fn write_pair(cert: (&Path, &str), key: (&Path, &str)) -> CertResult<()> {
    let result = tokio::try_join!(
        write_file_atomic(cert.0, cert.1, FILE_MODE_READABLE),
        write_file_atomic(key.0, key.1, FILE_MODE_RESTRICTED),
    );
    if let Err(err) = result {
        for path in [cert.0, key.0] {
            remove_if_present(path).await;
        }
        return Err(err);
    }
    Ok(())
}

async fn write_file_atomic(path: &Path, contents: &str, mode: u32) -> CertResult<()> {
    let tmp_path = temp_sibling(path);
    let written = write_new_file(&tmp_path, contents.as_bytes(), mode).await;
    let renamed = match written {
        Ok(()) => tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|err| CertError::io("rename into place", path, err)),
        Err(err) => Err(err),
    };
    if renamed.is_err() {
        remove_if_present(&tmp_path).await;
    }
    renamed
}

async fn write_new_file(path: &Path, contents: &[u8], mode: u32) -> CertResult<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(path)
        .await
        .map_err(|err| CertError::io("create file", path, err))?;
    file.write_all(contents)
        .await
        .map_err(|err| CertError::io("write file", path, err))?;
    file.sync_all()
        .await
        .map_err(|err| CertError::io("sync file", path, err))?;
    Ok(())
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), "failed to remove partial certificate file: {err}");
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.tmp"))
}
