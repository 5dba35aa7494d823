//! Two-level, version-aware artifact cache
//!
//! L1 is an in-memory write-through mirror bounded by bytes with FIFO
//! eviction; L2 (the filesystem) is the source of truth. Disk I/O runs on
//! the blocking pool under an `fs2` advisory lock so multiple worker
//! processes can share one cache directory, and every write is
//! temp-file + rename so readers never observe partial state.

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::meta::{ArtifactMeta, LEDGER_FILE, VersionLedger};
use super::version::{VersionedKey, versioned_key};
use crate::config::{CacheStrategy, ScrapeConfig};

/// Lock file guarding cross-process disk access.
const LOCK_FILE: &str = ".cache.lock";

/// One cached body plus its sidecar metadata.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub body: Vec<u8>,
    pub meta: ArtifactMeta,
}

/// Diagnostic row for `status()`.
#[derive(Debug, Clone)]
pub struct ArtifactStatus {
    pub filename: String,
    pub version: String,
    pub size: u64,
    pub age_secs: i64,
    /// URL the ledger recorded for this filename's current version.
    pub source_url: Option<String>,
    /// Seconds since the ledger last moved this filename's version.
    pub tracked_age_secs: Option<i64>,
    /// The ledger has moved past this artifact's version.
    pub stale: bool,
}

/// Tuning knobs for the cache, usually derived from `ScrapeConfig`.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub dir: PathBuf,
    pub max_memory_bytes: u64,
    pub max_age: Duration,
    pub strategy: CacheStrategy,
}

impl CacheOptions {
    #[must_use]
    pub fn from_config(config: &ScrapeConfig) -> Self {
        Self {
            dir: config.cache_dir().to_path_buf(),
            max_memory_bytes: config.cache_memory_bytes(),
            max_age: config.cache_max_age(),
            strategy: config.cache_strategy(),
        }
    }
}

/// FIFO-bounded memory tier.
struct MemoryTier {
    map: HashMap<String, Arc<CachedArtifact>>,
    order: VecDeque<String>,
    bytes: u64,
}

impl MemoryTier {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            bytes: 0,
        }
    }

    fn get(&self, name: &str) -> Option<Arc<CachedArtifact>> {
        self.map.get(name).cloned()
    }

    fn remove(&mut self, name: &str) {
        if let Some(old) = self.map.remove(name) {
            self.bytes = self.bytes.saturating_sub(old.body.len() as u64);
            self.order.retain(|n| n != name);
        }
    }

    fn insert(&mut self, name: String, artifact: Arc<CachedArtifact>, bound: u64) {
        self.remove(&name);
        self.bytes += artifact.body.len() as u64;
        self.order.push_back(name.clone());
        self.map.insert(name, artifact);
        while self.bytes > bound {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.map.remove(&oldest) {
                self.bytes = self.bytes.saturating_sub(evicted.body.len() as u64);
                debug!("evicted {oldest} from memory tier (FIFO)");
            }
        }
    }
}

struct CacheInner {
    options: CacheOptions,
    memory: Mutex<MemoryTier>,
    /// Guards both the in-memory ledger and its on-disk document.
    ledger: tokio::sync::Mutex<VersionLedger>,
}

/// Handle to the two-level cache; cheap to clone.
#[derive(Clone)]
pub struct ScriptCache {
    inner: Arc<CacheInner>,
}

impl ScriptCache {
    /// Open (or create) the cache directory and load the version ledger.
    pub fn open(options: CacheOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.dir)
            .with_context(|| format!("creating cache dir {}", options.dir.display()))?;
        let ledger = VersionLedger::load(&options.dir.join(LEDGER_FILE))?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                options,
                memory: Mutex::new(MemoryTier::new()),
                ledger: tokio::sync::Mutex::new(ledger),
            }),
        })
    }

    /// Look up an artifact by URL.
    ///
    /// Returns `None` when the URL carries no version key, the artifact is
    /// absent, its version no longer matches the ledger, or it exceeded
    /// max-age under the configured strategy.
    pub async fn load(&self, url: &str) -> Option<Arc<CachedArtifact>> {
        let Ok(key) = versioned_key(url) else {
            return None;
        };
        let strategy = self.inner.options.strategy;
        if strategy == CacheStrategy::AlwaysRevalidate {
            return None;
        }

        if matches!(
            strategy,
            CacheStrategy::AgeAndVersion | CacheStrategy::VersionOnly
        ) {
            let ledger = self.inner.ledger.lock().await;
            if let Some(tracked) = ledger.version_of(&key.filename)
                && tracked != key.version
            {
                debug!(
                    "version mismatch for {}: requested {}, tracked {tracked}",
                    key.filename, key.version
                );
                return None;
            }
        }

        let object_name = key.object_name();

        // Guard is dropped before the freshness branch so the removal
        // below can re-lock.
        let l1_hit = self.inner.memory.lock().get(&object_name);
        if let Some(artifact) = l1_hit {
            if self.is_fresh(&artifact.meta) {
                return Some(artifact);
            }
            // Memory mirrors disk, so an expired L1 entry means the L2
            // copy is expired too.
            self.inner.memory.lock().remove(&object_name);
            return None;
        }

        let dir = self.inner.options.dir.clone();
        let key_for_read = key.clone();
        let loaded = tokio::task::spawn_blocking(move || read_artifact(&dir, &key_for_read))
            .await
            .ok()?
            .unwrap_or_else(|e| {
                warn!("cache read failed for {object_name}: {e:#}");
                None
            })?;

        if !self.is_fresh(&loaded.meta) {
            return None;
        }

        let artifact = Arc::new(loaded);
        self.inner.memory.lock().insert(
            object_name,
            artifact.clone(),
            self.inner.options.max_memory_bytes,
        );
        Some(artifact)
    }

    /// Persist an artifact under its (filename, version) key.
    ///
    /// # Errors
    ///
    /// Refuses URLs with no extractable version segment, the safeguard
    /// that keeps un-keyable entries out of the cache. Disk failures
    /// propagate.
    pub async fn save(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: Option<String>,
        etag: Option<String>,
        last_modified: Option<String>,
    ) -> Result<()> {
        let key = versioned_key(url)
            .context("refusing to cache artifact without a version segment")?;

        let meta = ArtifactMeta {
            url: url.to_string(),
            cached_at: Utc::now(),
            size: body.len() as u64,
            version: key.version.clone(),
            etag,
            last_modified,
            content_type,
        };
        let artifact = Arc::new(CachedArtifact { body, meta });

        let dir = self.inner.options.dir.clone();
        let key_for_write = key.clone();
        let artifact_for_write = artifact.clone();
        tokio::task::spawn_blocking(move || write_artifact(&dir, &key_for_write, &artifact_for_write))
            .await
            .context("cache write task panicked")??;

        {
            let mut ledger = self.inner.ledger.lock().await;
            if let Some(previous) = ledger.track(&key.filename, &key.version, url) {
                debug!(
                    "version advanced for {}: {previous} -> {}",
                    key.filename, key.version
                );
                let stale = VersionedKey {
                    filename: key.filename.clone(),
                    version: previous,
                };
                self.inner.memory.lock().remove(&stale.object_name());
                let dir = self.inner.options.dir.clone();
                tokio::task::spawn_blocking(move || remove_artifact(&dir, &stale))
                    .await
                    .ok();
            }
            let snapshot = ledger.clone();
            let dir = self.inner.options.dir.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let _lock = disk_lock(&dir)?;
                snapshot.save(&dir.join(LEDGER_FILE))
            })
            .await
            .context("ledger write task panicked")??;
        }

        self.inner.memory.lock().insert(
            key.object_name(),
            artifact,
            self.inner.options.max_memory_bytes,
        );
        Ok(())
    }

    /// Diagnostic listing of every artifact on disk, annotated with the
    /// ledger's view of each filename.
    pub async fn status(&self) -> Result<Vec<ArtifactStatus>> {
        let dir = self.inner.options.dir.clone();
        let mut rows = tokio::task::spawn_blocking(move || scan_status(&dir))
            .await
            .context("status task panicked")??;

        let ledger = self.inner.ledger.lock().await;
        for row in &mut rows {
            if let Some(entry) = ledger.entry(&row.filename) {
                row.source_url = Some(entry.url.clone());
                row.tracked_age_secs = Some((Utc::now() - entry.updated_at).num_seconds());
                row.stale = entry.version != row.version;
            }
        }
        Ok(rows)
    }

    /// Bytes currently held by the memory tier.
    #[must_use]
    pub fn memory_bytes(&self) -> u64 {
        self.inner.memory.lock().bytes
    }

    fn is_fresh(&self, meta: &ArtifactMeta) -> bool {
        match self.inner.options.strategy {
            CacheStrategy::VersionOnly => true,
            CacheStrategy::AlwaysRevalidate => false,
            CacheStrategy::AgeOnly | CacheStrategy::AgeAndVersion => {
                let max_age = chrono::Duration::from_std(self.inner.options.max_age)
                    .unwrap_or(chrono::Duration::MAX);
                meta.age() <= max_age
            }
        }
    }
}

fn disk_lock(dir: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(dir.join(LOCK_FILE))
        .context("opening cache lock file")?;
    file.lock_exclusive().context("locking cache directory")?;
    Ok(file)
}

fn read_artifact(dir: &Path, key: &VersionedKey) -> Result<Option<CachedArtifact>> {
    let _lock = disk_lock(dir)?;
    let meta_path = dir.join(key.meta_name());
    let meta_raw = match std::fs::read_to_string(&meta_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("reading {}", meta_path.display()));
        }
    };
    let meta: ArtifactMeta = serde_json::from_str(&meta_raw)
        .with_context(|| format!("corrupt metadata at {}", meta_path.display()))?;

    let body_path = dir.join(key.object_name());
    let body = match std::fs::read(&body_path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("reading {}", body_path.display()));
        }
    };
    if body.len() as u64 != meta.size {
        warn!(
            "size mismatch for {}: body {} bytes, meta claims {}",
            key.object_name(),
            body.len(),
            meta.size
        );
        return Ok(None);
    }
    Ok(Some(CachedArtifact { body, meta }))
}

fn write_artifact(dir: &Path, key: &VersionedKey, artifact: &CachedArtifact) -> Result<()> {
    let _lock = disk_lock(dir)?;

    let mut body_tmp =
        tempfile::NamedTempFile::new_in(dir).context("creating body temp file")?;
    body_tmp
        .write_all(&artifact.body)
        .context("writing body temp file")?;
    body_tmp.flush().context("flushing body temp file")?;
    body_tmp
        .persist(dir.join(key.object_name()))
        .context("replacing cache body")?;

    let mut meta_tmp =
        tempfile::NamedTempFile::new_in(dir).context("creating meta temp file")?;
    serde_json::to_writer(&mut meta_tmp, &artifact.meta).context("serializing metadata")?;
    meta_tmp.flush().context("flushing meta temp file")?;
    meta_tmp
        .persist(dir.join(key.meta_name()))
        .context("replacing cache metadata")?;
    Ok(())
}

fn remove_artifact(dir: &Path, key: &VersionedKey) {
    for path in [dir.join(key.object_name()), dir.join(key.meta_name())] {
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed removing stale artifact {}: {e}", path.display());
        }
    }
}

fn scan_status(dir: &Path) -> Result<Vec<ArtifactStatus>> {
    let _lock = disk_lock(dir)?;
    let mut rows = Vec::new();
    for entry in std::fs::read_dir(dir).context("listing cache dir")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(object_name) = name.strip_suffix(".meta") else {
            continue;
        };
        let raw = match std::fs::read_to_string(entry.path()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("unreadable metadata {}: {e}", entry.path().display());
                continue;
            }
        };
        let Ok(meta) = serde_json::from_str::<ArtifactMeta>(&raw) else {
            warn!("corrupt metadata {}", entry.path().display());
            continue;
        };
        let filename = object_name
            .split("_v_")
            .next()
            .unwrap_or(object_name)
            .to_string();
        rows.push(ArtifactStatus {
            filename,
            version: meta.version.clone(),
            size: meta.size,
            age_secs: meta.age().num_seconds(),
            source_url: None,
            tracked_age_secs: None,
            stale: false,
        });
    }
    rows.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &Path) -> CacheOptions {
        CacheOptions {
            dir: dir.to_path_buf(),
            max_memory_bytes: 1024 * 1024,
            max_age: Duration::from_secs(3600),
            strategy: CacheStrategy::AgeAndVersion,
        }
    }

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ScriptCache::open(options(dir.path())).expect("open");

        let url = "https://cdn.example.com/assets/v1/main.js";
        cache
            .save(url, b"alert(1)".to_vec(), Some("text/javascript".into()), None, None)
            .await
            .expect("save should succeed");

        let artifact = cache.load(url).await.expect("artifact should hit");
        assert_eq!(artifact.body, b"alert(1)");
        assert_eq!(artifact.meta.version, "v1");
        assert!(cache.memory_bytes() > 0);
    }

    #[tokio::test]
    async fn disk_survives_memory_loss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://cdn.example.com/assets/v1/main.js";
        {
            let cache = ScriptCache::open(options(dir.path())).expect("open");
            cache
                .save(url, b"body".to_vec(), None, None, None)
                .await
                .expect("save");
        }
        // Fresh handle: empty L1, must be served from L2.
        let cache = ScriptCache::open(options(dir.path())).expect("reopen");
        assert_eq!(cache.memory_bytes(), 0);
        let artifact = cache.load(url).await.expect("L2 should hit");
        assert_eq!(artifact.body, b"body");
        // L1 populated on the way through.
        assert!(cache.memory_bytes() > 0);
    }

    #[tokio::test]
    async fn versionless_url_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ScriptCache::open(options(dir.path())).expect("open");
        let result = cache
            .save("https://host/naked.js", b"x".to_vec(), None, None, None)
            .await;
        assert!(result.is_err());
        assert!(cache.status().await.expect("status").is_empty());
        assert_eq!(cache.memory_bytes(), 0);
    }

    #[tokio::test]
    async fn version_change_misses_and_updates_ledger() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ScriptCache::open(options(dir.path())).expect("open");

        cache
            .save("https://host/assets/v1/app.js", b"one".to_vec(), None, None, None)
            .await
            .expect("save v1");
        // Request for the same filename at a new version must miss.
        assert!(cache.load("https://host/assets/v2/app.js").await.is_none());

        cache
            .save("https://host/assets/v2/app.js", b"two".to_vec(), None, None, None)
            .await
            .expect("save v2");
        // Ledger moved to v2: the old artifact is no longer served.
        assert!(cache.load("https://host/assets/v1/app.js").await.is_none());
        let artifact = cache
            .load("https://host/assets/v2/app.js")
            .await
            .expect("v2 should hit");
        assert_eq!(artifact.body, b"two");

        let status = cache.status().await.expect("status");
        assert_eq!(status.len(), 1, "stale object should be replaced");
        assert_eq!(status[0].version, "v2");
        assert_eq!(
            status[0].source_url.as_deref(),
            Some("https://host/assets/v2/app.js")
        );
        assert!(!status[0].stale);
        assert!(status[0].tracked_age_secs.is_some());
    }

    #[tokio::test]
    async fn resave_same_version_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ScriptCache::open(options(dir.path())).expect("open");
        let url = "https://host/assets/v1/app.js";
        cache
            .save(url, b"first".to_vec(), None, None, None)
            .await
            .expect("first save");
        cache
            .save(url, b"second".to_vec(), None, None, None)
            .await
            .expect("second save");
        let artifact = cache.load(url).await.expect("hit");
        assert_eq!(artifact.body, b"second");
        assert_eq!(cache.status().await.expect("status").len(), 1);
    }

    #[tokio::test]
    async fn fifo_eviction_respects_bound() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut opts = options(dir.path());
        opts.max_memory_bytes = 10;
        let cache = ScriptCache::open(opts).expect("open");

        cache
            .save("https://host/v1/a.js", vec![0u8; 6], None, None, None)
            .await
            .expect("save a");
        cache
            .save("https://host/v1/b.js", vec![0u8; 6], None, None, None)
            .await
            .expect("save b");
        // a.js was evicted from memory, but disk still serves it.
        assert!(cache.memory_bytes() <= 10);
        assert!(cache.load("https://host/v1/a.js").await.is_some());
    }

    #[tokio::test]
    async fn always_revalidate_never_hits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut opts = options(dir.path());
        opts.strategy = CacheStrategy::AlwaysRevalidate;
        let cache = ScriptCache::open(opts).expect("open");
        let url = "https://host/v1/a.js";
        cache
            .save(url, b"x".to_vec(), None, None, None)
            .await
            .expect("save");
        assert!(cache.load(url).await.is_none());
    }

    #[tokio::test]
    async fn age_expiry_invalidates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut opts = options(dir.path());
        opts.max_age = Duration::ZERO;
        let cache = ScriptCache::open(opts).expect("open");
        let url = "https://host/v1/a.js";
        cache
            .save(url, b"x".to_vec(), None, None, None)
            .await
            .expect("save");
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.load(url).await.is_none());
    }
}
