//! Persistent record of events this broker has already seen.
//!
//! Events are identified by the SHA-1 of their raw bytes. Records are
//! sharded by the authority and resource key of the event's ivorn, so
//! unrelated streams never contend for the same lock. Each shard lives in
//! memory and in a plain text file of `<sha1-hex> <unix-seconds>` lines
//! under the store root: inserts are appended, pruning rewrites the file.
//!
//! Shards are opened on first use and kept for the life of the store.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::document::Event;
use crate::ivoid::parse_ivoid;
use crate::pipeline::WorkerPool;
use crate::types::StoreError;

/// How often the broker prunes its store by default.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Records older than this are dropped by the default prune loop.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

struct Shard {
    path: PathBuf,
    entries: HashMap<String, i64>,
    log: File,
}

impl Shard {
    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let mut entries = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next().and_then(|ts| ts.parse::<i64>().ok())) {
                    (Some(hash), Some(ts)) => {
                        entries.insert(hash.to_string(), ts);
                    }
                    _ if line.trim().is_empty() => {}
                    _ => warn!(shard = %path.display(), line = %line, "skipping malformed record"),
                }
            }
        }
        let log = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, entries, log })
    }

    fn insert(&mut self, hash: String, now: i64) -> Result<bool, StoreError> {
        if self.entries.contains_key(&hash) {
            return Ok(false);
        }
        writeln!(self.log, "{hash} {now}")?;
        self.entries.insert(hash, now);
        Ok(true)
    }

    fn prune(&mut self, now: i64, max_age: i64) -> Result<usize, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|_, ts| now - *ts < max_age);
        let removed = before - self.entries.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut out = File::create(&tmp)?;
            for (hash, ts) in &self.entries {
                writeln!(out, "{hash} {ts}")?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.log = OpenOptions::new().append(true).open(&self.path)?;
        Ok(removed)
    }
}

/// Sharded, file-backed dedup store.
pub struct EventDb {
    root: PathBuf,
    shards: DashMap<String, Arc<Mutex<Shard>>>,
}

impl EventDb {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let unusable = |reason: String| StoreError::UnusableRoot {
            path: root.display().to_string(),
            reason,
        };

        fs::create_dir_all(&root).map_err(|e| unusable(e.to_string()))?;
        if !root.is_dir() {
            return Err(unusable("not a directory".into()));
        }
        let marker = root.join(".write-check");
        File::create(&marker).map_err(|e| unusable(format!("not writable: {e}")))?;
        let _ = fs::remove_file(&marker);

        info!(root = %root.display(), "event store opened");
        Ok(Self {
            root,
            shards: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn digest(event: &Event) -> String {
        hex::encode(Sha1::digest(event.raw_bytes()))
    }

    fn shard_for(&self, ivorn: &str) -> Result<Arc<Mutex<Shard>>, StoreError> {
        let key = parse_ivoid(ivorn)
            .ok_or_else(|| StoreError::BadIvorn(ivorn.to_string()))?
            .shard_key();
        if let Some(shard) = self.shards.get(&key) {
            return Ok(Arc::clone(shard.value()));
        }
        // Read the file with no map lock held. A racing opener may beat us
        // to the insert, in which case its copy wins and ours is dropped.
        let opened = Shard::open(self.root.join(&key))?;
        let records = opened.entries.len();
        let shard = self
            .shards
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(shard = %key, records, "opened shard");
                Arc::new(Mutex::new(opened))
            });
        Ok(Arc::clone(shard.value()))
    }

    /// Atomically check whether `event` is new, recording it if so.
    ///
    /// Returns `true` the first time a given event is checked and `false`
    /// ever after (until pruned).
    pub fn check(&self, event: &Event) -> Result<bool, StoreError> {
        let shard = self.shard_for(event.ivorn())?;
        let hash = Self::digest(event);
        let mut guard = shard.lock();
        guard.insert(hash, Utc::now().timestamp())
    }

    /// Record `event` as seen; a no-op if it already is.
    pub fn record(&self, event: &Event) -> Result<(), StoreError> {
        self.check(event).map(|_| ())
    }

    /// Drop every record at least `max_age` old. Returns how many went.
    pub fn prune(&self, max_age: Duration) -> Result<usize, StoreError> {
        let shards: Vec<_> = self.shards.iter().map(|s| Arc::clone(s.value())).collect();
        let now = Utc::now().timestamp();
        let max_age = max_age_secs(max_age);
        let mut removed = 0;
        for shard in shards {
            removed += shard.lock().prune(now, max_age)?;
        }
        Ok(removed)
    }

    /// Prune every shard concurrently on the worker pool.
    ///
    /// A shard that fails to prune is logged and skipped.
    pub async fn prune_concurrently(&self, pool: &WorkerPool, max_age: Duration) -> usize {
        let now = Utc::now().timestamp();
        let max_age = max_age_secs(max_age);
        let jobs = self.shards.iter().map(|entry| {
            let name = entry.key().clone();
            let shard = Arc::clone(entry.value());
            let job = pool.run(move || shard.lock().prune(now, max_age));
            async move { (name, job.await) }
        });
        let jobs: Vec<_> = jobs.collect();

        let mut removed = 0;
        for (name, result) in join_all(jobs).await {
            match result {
                Ok(Ok(n)) => removed += n,
                Ok(Err(e)) => warn!(shard = %name, error = %e, "failed to prune shard"),
                Err(e) => warn!(shard = %name, error = %e, "prune job did not run"),
            }
        }
        removed
    }

    /// Prune every `interval` until `shutdown` is cancelled.
    pub fn spawn_prune_loop(
        self: Arc<Self>,
        pool: WorkerPool,
        interval: Duration,
        max_age: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        info!("pruning event store");
                        let removed = self.prune_concurrently(&pool, max_age).await;
                        info!(removed, "event store pruned");
                    }
                }
            }
        })
    }
}

fn max_age_secs(max_age: Duration) -> i64 {
    i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX)
}
