use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    future::Future,
    io::Write,
    path::{Path, PathBuf},
};
use udf_core::Result;

use crate::{
    fingerprint::Fingerprint,
    key::{CacheArgs, CacheKey},
};

pub const DEFAULT_NAMESPACE: &str = "tmp";

/// Where cache entries live.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
        }
    }
}

/// `/mount/cached_data` when a writable mount exists, else `cached_data` under the temp dir.
pub fn default_cache_root() -> PathBuf {
    let mount = Path::new("/mount");
    let writable = std::fs::metadata(mount)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false);
    let base = if writable {
        mount.to_path_buf()
    } else {
        std::env::temp_dir()
    };
    base.join("cached_data")
}

/// Per-call cache behavior.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Subdirectory under the cache root. Leading and trailing `/` are ignored.
    pub namespace: String,
    /// Recompute and overwrite even when an entry exists.
    pub reset: bool,
    /// Recompute once when an entry fails to deserialize; otherwise return `None`.
    pub retry: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            reset: false,
            retry: true,
        }
    }
}

impl CacheOptions {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }
}

enum Lookup<T> {
    Hit(T),
    Miss,
    Corrupt,
}

/// On-disk content-addressable result cache.
#[derive(Debug, Clone)]
pub struct ContentCache {
    cfg: CacheConfig,
}

impl ContentCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self { cfg }
    }

    pub fn root(&self) -> &Path {
        &self.cfg.root
    }

    /// File backing `key` in `namespace`.
    pub fn entry_path(&self, namespace: &str, key: &CacheKey) -> PathBuf {
        self.cfg
            .root
            .join(namespace.trim_matches('/'))
            .join(key.file_name())
    }

    /// Wrap a callable so every call through it is memoized.
    pub fn wrap(&self, name: impl Into<String>, code: Fingerprint) -> Cached {
        Cached {
            name: name.into(),
            code,
            cache: self.clone(),
            options: CacheOptions::default(),
        }
    }

    /// Memoize `compute`, identified by `code` and `args`.
    ///
    /// Returns `Ok(None)` only when an existing entry is corrupt and `retry` is off.
    pub fn call<T, F>(
        &self,
        name: &str,
        code: &Fingerprint,
        args: &CacheArgs,
        options: &CacheOptions,
        compute: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let key = CacheKey::derive(code, args);
        let path = self.entry_path(&options.namespace, &key);

        if !options.reset {
            match lookup::<T>(&path, std::fs::read(&path)) {
                Lookup::Hit(value) => {
                    tracing::info!(event = "udf.cache.hit", key = %key, "{name} was cached");
                    return Ok(Some(value));
                }
                Lookup::Corrupt if !options.retry => return Ok(None),
                Lookup::Corrupt | Lookup::Miss => {}
            }
        }

        let value = compute()?;
        write_entry(&path, &serde_json::to_vec(&value)?)?;
        Ok(Some(value))
    }

    /// Async twin of [`ContentCache::call`]; key derivation and corruption handling are the same.
    pub async fn call_async<T, F, Fut>(
        &self,
        name: &str,
        code: &Fingerprint,
        args: &CacheArgs,
        options: &CacheOptions,
        compute: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = CacheKey::derive(code, args);
        let path = self.entry_path(&options.namespace, &key);

        if !options.reset {
            match lookup::<T>(&path, tokio::fs::read(&path).await) {
                Lookup::Hit(value) => {
                    tracing::info!(event = "udf.cache.hit", key = %key, "{name} was cached");
                    return Ok(Some(value));
                }
                Lookup::Corrupt if !options.retry => return Ok(None),
                Lookup::Corrupt | Lookup::Miss => {}
            }
        }

        let value = compute().await?;
        let bytes = serde_json::to_vec(&value)?;
        tokio::task::spawn_blocking(move || write_entry(&path, &bytes))
            .await
            .context("join cache write task")??;
        Ok(Some(value))
    }
}

fn lookup<T: DeserializeOwned>(path: &Path, read: std::io::Result<Vec<u8>>) -> Lookup<T> {
    let bytes = match read {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Lookup::Miss,
        Err(err) => {
            tracing::warn!(event = "udf.cache.read_failed", path = %path.display(), error = %err);
            return Lookup::Corrupt;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Lookup::Hit(value),
        Err(err) => {
            tracing::warn!(
                event = "udf.cache.corrupt",
                path = %path.display(),
                error = %err,
                "cache entry could not be read"
            );
            Lookup::Corrupt
        }
    }
}

/// Replace the entry in one rename; readers never see a partial file.
fn write_entry(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().context("cache entry has no parent dir")?;
    std::fs::create_dir_all(dir).with_context(|| format!("create cache dir {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("create temp cache entry")?;
    tmp.write_all(bytes).context("write cache entry")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("persist cache entry {}", path.display()))?;
    Ok(())
}

/// A callable bound to a cache, with its own options.
#[derive(Debug, Clone)]
pub struct Cached {
    name: String,
    code: Fingerprint,
    cache: ContentCache,
    options: CacheOptions,
}

impl Cached {
    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    /// Code identity; a `Cached` passed as an argument hashes as the callable it wraps.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.code
    }

    pub fn key(&self, args: &CacheArgs) -> CacheKey {
        CacheKey::derive(&self.code, args)
    }

    pub fn path(&self, args: &CacheArgs) -> PathBuf {
        self.cache.entry_path(&self.options.namespace, &self.key(args))
    }

    pub fn call<T, F>(&self, args: &CacheArgs, compute: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        self.cache
            .call(&self.name, &self.code, args, &self.options, compute)
    }

    pub async fn call_async<T, F, Fut>(&self, args: &CacheArgs, compute: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.cache
            .call_async(&self.name, &self.code, args, &self.options, compute)
            .await
    }
}
