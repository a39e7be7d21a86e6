//! Bucket-style object storage, the run lock, and completion work-queue clients.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use feedloader_core::CompletionPayload;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedloader-storage";

/// Name of the marker object whose presence means a run holds the lock.
pub const LOCK_MARKER_NAME: &str = "EOF.lock";

/// Written next to the lock marker when a run keeps the lock for a retry trigger.
pub const RETAINED_MARKER_NAME: &str = "EOF.retained";

/// Whether a listing descends into "folders" (a `/` delimiter stops at the top level).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listing {
    TopLevel,
    Recursive,
}

/// Minimal object-store surface used by a reconciliation run.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, bucket: &str, name: &str) -> anyhow::Result<bool>;

    /// Object names in the bucket, sorted.
    async fn list(&self, bucket: &str, listing: Listing) -> anyhow::Result<Vec<String>>;

    async fn read(&self, bucket: &str, name: &str) -> anyhow::Result<Vec<u8>>;

    /// Creates or replaces an object.
    async fn write(&self, bucket: &str, name: &str, bytes: &[u8]) -> anyhow::Result<()>;

    /// Returns `false` when the object did not exist.
    async fn delete(&self, bucket: &str, name: &str) -> anyhow::Result<bool>;

    /// Moves an object. Fails if the source is gone or the destination already exists.
    async fn rename(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
    ) -> anyhow::Result<()>;
}

/// Buckets are directories under a root; object names may contain `/`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket_path(&self, bucket: &str) -> anyhow::Result<PathBuf> {
        let mut components = Path::new(bucket).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(bucket)),
            _ => bail!("invalid bucket name {bucket:?}"),
        }
    }

    pub fn object_path(&self, bucket: &str, name: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(name);
        if name.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid object name {name:?} in bucket {bucket}");
        }
        Ok(self.bucket_path(bucket)?.join(relative))
    }

    async fn ensure_parent(path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, bucket: &str, name: &str) -> anyhow::Result<bool> {
        let path = self.object_path(bucket, name)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking object {}", path.display()))
    }

    async fn list(&self, bucket: &str, listing: Listing) -> anyhow::Result<Vec<String>> {
        let base = self.bucket_path(bucket)?;
        let mut names = Vec::new();
        let mut pending = vec![(base, String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("listing bucket directory {}", dir.display()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("reading entry in {}", dir.display()))?
            {
                let file_name = entry.file_name().to_string_lossy().to_string();
                // In-flight temp files from `write`.
                if file_name.starts_with('.') {
                    continue;
                }
                let full = if prefix.is_empty() {
                    file_name
                } else {
                    format!("{prefix}/{file_name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .with_context(|| format!("inspecting {}", entry.path().display()))?;
                if file_type.is_dir() {
                    if listing == Listing::Recursive {
                        pending.push((entry.path(), full));
                    }
                } else {
                    names.push(full);
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn read(&self, bucket: &str, name: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.object_path(bucket, name)?;
        fs::read(&path)
            .await
            .with_context(|| format!("reading object {}", path.display()))
    }

    /// Atomic temp-file write followed by a rename into place.
    async fn write(&self, bucket: &str, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let absolute_path = self.object_path(bucket, name)?;
        Self::ensure_parent(&absolute_path).await?;

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path.with_file_name(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp object file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp object file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp object file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp object {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(())
    }

    async fn delete(&self, bucket: &str, name: &str) -> anyhow::Result<bool> {
        let path = self.object_path(bucket, name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("deleting object {}", path.display())),
        }
    }

    async fn rename(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
    ) -> anyhow::Result<()> {
        let src = self.object_path(src_bucket, src_name)?;
        let dst = self.object_path(dst_bucket, dst_name)?;
        Self::ensure_parent(&dst).await?;

        // A hard link refuses an existing destination, which makes the move exclusive.
        fs::hard_link(&src, &dst)
            .await
            .with_context(|| format!("linking {} -> {}", src.display(), dst.display()))?;

        if let Err(err) = fs::remove_file(&src).await {
            let _ = fs::remove_file(&dst).await;
            return Err(err).with_context(|| format!("removing moved source {}", src.display()));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("an EOF.lock marker already exists; another run is in flight")]
    Held,
    #[error("lock marker could not be queried: {0:#}")]
    Unavailable(anyhow::Error),
    #[error("trigger {trigger} could not be consumed into the lock marker: {cause:#}")]
    Consume {
        trigger: String,
        cause: anyhow::Error,
    },
}

/// Global mutual-exclusion marker created by moving the trigger object into the lock bucket.
#[derive(Clone)]
pub struct RunLock {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl RunLock {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn exists(&self) -> anyhow::Result<bool> {
        self.store.exists(&self.bucket, LOCK_MARKER_NAME).await
    }

    /// Consumes the trigger object by renaming it into the lock marker.
    pub async fn acquire(
        &self,
        trigger_bucket: &str,
        trigger_name: &str,
    ) -> Result<LockGuard, LockError> {
        if self.exists().await.map_err(LockError::Unavailable)? {
            return Err(LockError::Held);
        }
        self.store
            .rename(trigger_bucket, trigger_name, &self.bucket, LOCK_MARKER_NAME)
            .await
            .map_err(|cause| LockError::Consume {
                trigger: format!("{trigger_bucket}/{trigger_name}"),
                cause,
            })?;
        info!(bucket = %self.bucket, trigger = trigger_name, "run lock acquired");
        Ok(LockGuard::new(self.clone(), false))
    }

    /// Continues a run whose lock was retained, consuming the retry marker.
    ///
    /// A lock without the retained mark belongs to a run still in flight and is
    /// reported as [`LockError::Held`]. With no lock held this behaves exactly
    /// like [`RunLock::acquire`].
    pub async fn resume(
        &self,
        trigger_bucket: &str,
        trigger_name: &str,
    ) -> Result<LockGuard, LockError> {
        if !self.exists().await.map_err(LockError::Unavailable)? {
            return self.acquire(trigger_bucket, trigger_name).await;
        }
        // Only the caller that deletes the mark may adopt the lock.
        let claimed = self
            .store
            .delete(&self.bucket, RETAINED_MARKER_NAME)
            .await
            .map_err(LockError::Unavailable)?;
        if !claimed {
            return Err(LockError::Held);
        }
        if let Err(cause) = self.store.delete(trigger_bucket, trigger_name).await {
            let _ = self.store.write(&self.bucket, RETAINED_MARKER_NAME, b"").await;
            return Err(LockError::Consume {
                trigger: format!("{trigger_bucket}/{trigger_name}"),
                cause,
            });
        }
        info!(bucket = %self.bucket, trigger = trigger_name, "retained run lock adopted");
        Ok(LockGuard::new(self.clone(), true))
    }

    /// Deletes the marker and any retained mark; an absent marker is a
    /// successful no-op (`Ok(false)`).
    pub async fn release(&self) -> anyhow::Result<bool> {
        self.store.delete(&self.bucket, RETAINED_MARKER_NAME).await?;
        self.store.delete(&self.bucket, LOCK_MARKER_NAME).await
    }
}

/// Proof of lock ownership. Must end in [`LockGuard::release`] or [`LockGuard::retain`].
pub struct LockGuard {
    lock: RunLock,
    adopted: bool,
    settled: bool,
}

impl LockGuard {
    fn new(lock: RunLock, adopted: bool) -> Self {
        Self {
            lock,
            adopted,
            settled: false,
        }
    }

    /// True when the guard took over a lock retained by an earlier run.
    pub fn adopted(&self) -> bool {
        self.adopted
    }

    pub async fn release(mut self) -> anyhow::Result<bool> {
        self.settled = true;
        self.lock.release().await
    }

    /// Leaves the marker in place so later `EOF` triggers are blocked, and marks it
    /// as adoptable by a retry trigger.
    pub async fn retain(mut self) -> anyhow::Result<()> {
        self.settled = true;
        self.lock
            .store
            .write(&self.lock.bucket, RETAINED_MARKER_NAME, b"")
            .await
            .context("marking run lock as retained")?;
        warn!(bucket = %self.lock.bucket, "run lock intentionally retained");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.settled {
            error!(
                bucket = %self.lock.bucket,
                "run lock guard dropped without release; marker left in place"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("enqueue request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("encoding completion payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("writing completion payload to outbox: {0:#}")]
    Storage(anyhow::Error),
}

/// Asynchronous work queue that receives the completion record of a run.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Human-readable target used in logs.
    fn describe(&self) -> String;

    async fn enqueue(&self, payload: &CompletionPayload) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone)]
pub struct QueueTarget {
    pub name: String,
    pub location: String,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Posts the payload to `<endpoint>/locations/<location>/queues/<name>/tasks`.
#[derive(Debug)]
pub struct HttpTaskQueue {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
}

impl HttpTaskQueue {
    pub fn new(
        endpoint: &str,
        target: &QueueTarget,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let url = format!(
            "{}/locations/{}/queues/{}/tasks",
            endpoint.trim_end_matches('/'),
            target.location,
            target.name
        );

        Ok(Self {
            client,
            url,
            backoff: config.backoff,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TaskQueue for HttpTaskQueue {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn enqueue(&self, payload: &CompletionPayload) -> Result<(), DispatchError> {
        let span = info_span!("enqueue", url = %self.url);
        async {
            for attempt in 0..=self.backoff.max_retries {
                match self.client.post(&self.url).json(payload).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            info!(%status, "completion task enqueued");
                            return Ok(());
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(%status, attempt, "enqueue rejected; retrying");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        return Err(DispatchError::HttpStatus {
                            status: status.as_u16(),
                            url: self.url.clone(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "enqueue request failed; retrying");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(DispatchError::Request(err));
                    }
                }
            }
            unreachable!("the final attempt always returns")
        }
        .instrument(span)
        .await
    }
}

/// Writes each completion record as a JSON object into an outbox bucket.
pub struct BucketTaskQueue {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    target: QueueTarget,
}

impl BucketTaskQueue {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, target: QueueTarget) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            target,
        }
    }
}

#[async_trait]
impl TaskQueue for BucketTaskQueue {
    fn describe(&self) -> String {
        format!("{}/{} ({})", self.bucket, self.target.name, self.target.location)
    }

    async fn enqueue(&self, payload: &CompletionPayload) -> Result<(), DispatchError> {
        let bytes = serde_json::to_vec(payload)?;
        let name = format!(
            "{}/{}-{}.json",
            self.target.name,
            Utc::now().format("%Y%m%d%H%M%S%6f"),
            Uuid::new_v4()
        );
        self.store
            .write(&self.bucket, &name, &bytes)
            .await
            .map_err(DispatchError::Storage)?;
        info!(bucket = %self.bucket, object = %name, "completion task written to outbox");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct UnreachableStore;

    #[async_trait]
    impl ObjectStore for UnreachableStore {
        async fn exists(&self, _bucket: &str, _name: &str) -> anyhow::Result<bool> {
            bail!("storage backend unreachable")
        }
        async fn list(&self, _bucket: &str, _listing: Listing) -> anyhow::Result<Vec<String>> {
            bail!("storage backend unreachable")
        }
        async fn read(&self, _bucket: &str, _name: &str) -> anyhow::Result<Vec<u8>> {
            bail!("storage backend unreachable")
        }
        async fn write(&self, _bucket: &str, _name: &str, _bytes: &[u8]) -> anyhow::Result<()> {
            bail!("storage backend unreachable")
        }
        async fn delete(&self, _bucket: &str, _name: &str) -> anyhow::Result<bool> {
            bail!("storage backend unreachable")
        }
        async fn rename(
            &self,
            _src_bucket: &str,
            _src_name: &str,
            _dst_bucket: &str,
            _dst_name: &str,
        ) -> anyhow::Result<()> {
            bail!("storage backend unreachable")
        }
    }

    fn fs_store(root: &Path) -> Arc<dyn ObjectStore> {
        Arc::new(FsObjectStore::new(root))
    }

    #[tokio::test]
    async fn top_level_listing_skips_nested_objects() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        store.write("feed", "b.csv", b"b").await.expect("write b");
        store.write("feed", "a.csv", b"a").await.expect("write a");
        store
            .write("feed", "archive/2026_01_01/old.csv", b"old")
            .await
            .expect("write archived");

        let top = store.list("feed", Listing::TopLevel).await.expect("list");
        assert_eq!(top, vec!["a.csv".to_string(), "b.csv".to_string()]);

        let all = store.list("feed", Listing::Recursive).await.expect("list all");
        assert_eq!(all.len(), 3);
        assert!(all.contains(&"archive/2026_01_01/old.csv".to_string()));
    }

    #[tokio::test]
    async fn rename_refuses_existing_destination() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        store.write("update", "EOF", b"").await.expect("write trigger");
        store.write("lock", "EOF.lock", b"").await.expect("write marker");

        let err = store.rename("update", "EOF", "lock", "EOF.lock").await;
        assert!(err.is_err());
        assert!(store.exists("update", "EOF").await.expect("exists"));
    }

    #[tokio::test]
    async fn object_names_cannot_escape_the_bucket() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        assert!(store.write("feed", "../escape", b"x").await.is_err());
        assert!(store.write("../feed", "ok", b"x").await.is_err());
        assert!(!store.delete("feed", "missing").await.expect("delete missing"));
    }

    #[tokio::test]
    async fn acquiring_consumes_the_trigger_and_blocks_a_second_run() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        store.write("update", "EOF", b"").await.expect("write trigger");
        let lock = RunLock::new(store.clone(), "lock");

        let guard = lock.acquire("update", "EOF").await.expect("acquire");
        assert!(!guard.adopted());
        assert!(!store.exists("update", "EOF").await.expect("exists"));
        assert!(lock.exists().await.expect("lock exists"));

        store.write("update", "EOF", b"").await.expect("second trigger");
        assert!(matches!(
            lock.acquire("update", "EOF").await,
            Err(LockError::Held)
        ));

        assert!(guard.release().await.expect("release"));
        assert!(!lock.release().await.expect("release again is a no-op"));
    }

    #[tokio::test]
    async fn missing_trigger_fails_acquisition_without_side_effects() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        let lock = RunLock::new(store, "lock");

        let result = lock.acquire("update", "EOF").await;
        assert!(matches!(result, Err(LockError::Consume { .. })));
        assert!(!lock.exists().await.expect("exists"));
    }

    #[tokio::test]
    async fn unreadable_lock_is_a_distinct_error() {
        let lock = RunLock::new(Arc::new(UnreachableStore), "lock");
        let result = lock.acquire("update", "EOF").await;
        assert!(matches!(result, Err(LockError::Unavailable(_))));
    }

    #[tokio::test]
    async fn retry_trigger_adopts_a_retained_lock() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        store.write("update", "EOF", b"").await.expect("write trigger");
        let lock = RunLock::new(store.clone(), "lock");

        lock.acquire("update", "EOF")
            .await
            .expect("acquire")
            .retain()
            .await
            .expect("retain");
        assert!(lock.exists().await.expect("still held"));
        assert!(store.exists("lock", RETAINED_MARKER_NAME).await.expect("mark"));

        store.write("update", "EOF.retry", b"").await.expect("retry marker");
        let guard = lock.resume("update", "EOF.retry").await.expect("resume");
        assert!(guard.adopted());
        assert!(!store.exists("update", "EOF.retry").await.expect("consumed"));
        assert!(!store.exists("lock", RETAINED_MARKER_NAME).await.expect("mark consumed"));
        guard.release().await.expect("release");
        assert!(!lock.exists().await.expect("released"));
    }

    #[tokio::test]
    async fn retry_trigger_cannot_adopt_a_lock_held_by_a_running_run() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        store.write("update", "EOF", b"").await.expect("write trigger");
        let lock = RunLock::new(store.clone(), "lock");
        let running = lock.acquire("update", "EOF").await.expect("acquire");

        store.write("update", "EOF.retry", b"").await.expect("retry marker");
        assert!(matches!(
            lock.resume("update", "EOF.retry").await,
            Err(LockError::Held)
        ));
        assert!(store.exists("update", "EOF.retry").await.expect("retry kept"));
        assert!(lock.exists().await.expect("still held"));

        running.release().await.expect("release");
    }

    #[tokio::test]
    async fn only_one_retry_adopts_a_retained_lock() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        store.write("update", "EOF", b"").await.expect("write trigger");
        let lock = RunLock::new(store.clone(), "lock");
        lock.acquire("update", "EOF")
            .await
            .expect("acquire")
            .retain()
            .await
            .expect("retain");

        store.write("update", "EOF.retry", b"").await.expect("first retry");
        let adopted = lock.resume("update", "EOF.retry").await.expect("resume");
        store.write("update", "EOF.retry", b"").await.expect("second retry");
        assert!(matches!(
            lock.resume("update", "EOF.retry").await,
            Err(LockError::Held)
        ));
        adopted.release().await.expect("release");
    }

    #[tokio::test]
    async fn bucket_queue_writes_the_payload_as_json() {
        let dir = tempdir().expect("tempdir");
        let store = fs_store(dir.path());
        let queue = BucketTaskQueue::new(
            store.clone(),
            "outbox",
            QueueTarget {
                name: "trigger-initiator".into(),
                location: "us-central1".into(),
            },
        );
        let payload = CompletionPayload {
            delete_count: 4,
            expiring_count: 0,
            upsert_count: 9,
        };
        queue.enqueue(&payload).await.expect("enqueue");

        let names = store.list("outbox", Listing::Recursive).await.expect("list");
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("trigger-initiator/"));
        let bytes = store.read("outbox", &names[0]).await.expect("read");
        let decoded: CompletionPayload = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn http_queue_url_includes_location_and_queue() {
        let queue = HttpTaskQueue::new(
            "http://localhost:8123/",
            &QueueTarget {
                name: "trigger-initiator".into(),
                location: "us-central1".into(),
            },
            HttpClientConfig::default(),
        )
        .expect("client");
        assert_eq!(
            queue.url(),
            "http://localhost:8123/locations/us-central1/queues/trigger-initiator/tasks"
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
