//! Fingerprint-keyed result cache with in-flight de-duplication.
//!
//! A fingerprint is either absent, *in flight* (one job holds a
//! [`Reservation`] and is running the engine), or *completed* (an entry with
//! an artifact in the cache directory). [`ResultCache::lookup_or_reserve`]
//! decides between the three under one lock, so two workers can never both
//! start the same transcode.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{MediaJobError, Result};
use crate::job::{JobRequest, JobResult, MediaSource};
use crate::media::processor::move_file;
use crate::media::OperationPlan;

const INDEX_FILE: &str = "index.json";

/// Deterministic identity of a job's inputs and parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash source identity, operation and the validated operation plan.
    ///
    /// Hashing the plan rather than the raw parameters makes defaults and
    /// spelled-out defaults equal. Local sources are identified by canonical
    /// path, size and modification time, so an edited file gets a new
    /// fingerprint.
    pub fn of(request: &JobRequest) -> Result<Self> {
        let mut identity = Vec::new();
        for source in request.sources() {
            identity.push(source_identity(source)?);
        }
        let plan = format!("{:?}", OperationPlan::parse(request)?);

        let digest = |salt: &str| {
            let mut hasher = DefaultHasher::new();
            salt.hash(&mut hasher);
            identity.hash(&mut hasher);
            request.operation().as_str().hash(&mut hasher);
            plan.hash(&mut hasher);
            hasher.finish()
        };

        Ok(Self(format!("{:016x}{:016x}", digest("media-jobs/a"), digest("media-jobs/b"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn source_identity(source: &MediaSource) -> Result<String> {
    match source {
        MediaSource::Local(path) => {
            let canonical = std::fs::canonicalize(path)?;
            let metadata = std::fs::metadata(&canonical)?;
            let modified = metadata
                .modified()?
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            Ok(format!("file:{}:{}:{}", canonical.display(), metadata.len(), modified))
        }
        MediaSource::Remote(url) => Ok(format!("url:{}", url)),
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result: JobResult,
    pub size_bytes: u64,
    /// Unix timestamp
    pub stored_at: u64,
    /// Unix timestamp
    pub last_access: u64,
    /// Recency order; larger is more recent
    pub seq: u64,
}

impl CacheEntry {
    fn artifact(&self) -> Option<&Path> {
        self.result.output.as_deref()
    }
}

#[derive(Debug)]
pub struct CacheInfo {
    pub entries: usize,
    pub total_bytes: u64,
    pub in_flight: usize,
    pub oldest_entry: Option<u64>,
    pub newest_entry: Option<u64>,
}

/// Outcome of [`ResultCache::lookup_or_reserve`]
pub enum CacheLookup {
    /// A completed result for this fingerprint
    Hit(JobResult),
    /// Another job is producing it
    InFlight(InFlightWaiter),
    /// The caller is now the only job producing it
    Reserved(Reservation),
}

struct CacheState {
    entries: HashMap<Fingerprint, CacheEntry>,
    in_flight: HashMap<Fingerprint, watch::Sender<Option<JobResult>>>,
    next_seq: u64,
}

impl CacheState {
    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    fn touch(&mut self, fingerprint: &Fingerprint) -> Option<JobResult> {
        let seq = self.next_seq;
        let entry = self.entries.get_mut(fingerprint)?;
        entry.last_access = unix_now();
        entry.seq = seq;
        self.next_seq += 1;
        Some(entry.result.clone())
    }
}

pub struct ResultCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl ResultCache {
    /// Open the cache directory, loading the persisted index if there is one
    pub fn open(config: CacheConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| MediaJobError::Cache(format!("Failed to create cache directory: {}", e)))?;

        let index_path = config.dir.join(INDEX_FILE);
        let mut entries = HashMap::new();
        if index_path.exists() {
            match std::fs::read_to_string(&index_path)
                .map_err(MediaJobError::from)
                .and_then(|content| serde_json::from_str::<Vec<CacheEntry>>(&content).map_err(MediaJobError::from))
            {
                Ok(loaded) => {
                    for entry in loaded {
                        if entry.artifact().is_some_and(|p| p.is_file()) {
                            entries.insert(entry.fingerprint.clone(), entry);
                        }
                    }
                }
                Err(e) => warn!("Ignoring unreadable cache index {}: {}", index_path.display(), e),
            }
        }

        let next_seq = entries.values().map(|e| e.seq + 1).max().unwrap_or(0);
        info!("Result cache at {} holds {} entries", config.dir.display(), entries.len());

        let cache = Arc::new(Self {
            config,
            state: Mutex::new(CacheState {
                entries,
                in_flight: HashMap::new(),
                next_seq,
            }),
        });
        let doomed = cache.evict(&mut cache.lock(), None);
        cache.finish_eviction(doomed);
        Ok(cache)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Completed result for a fingerprint, refreshing its recency
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<JobResult> {
        let mut state = self.lock();
        let doomed = self.drop_if_stale(&mut state, fingerprint);
        let hit = state.touch(fingerprint);
        drop(state);
        self.finish_eviction(doomed);
        hit
    }

    /// Atomically return a hit, join an in-flight execution, or reserve the fingerprint
    pub fn lookup_or_reserve(self: &Arc<Self>, fingerprint: &Fingerprint) -> CacheLookup {
        let mut state = self.lock();
        let doomed = self.drop_if_stale(&mut state, fingerprint);

        let lookup = if let Some(result) = state.touch(fingerprint) {
            debug!("Cache hit for {}", fingerprint);
            CacheLookup::Hit(result)
        } else if let Some(sender) = state.in_flight.get(fingerprint) {
            debug!("Joining in-flight execution for {}", fingerprint);
            CacheLookup::InFlight(InFlightWaiter {
                receiver: sender.subscribe(),
            })
        } else {
            let (sender, _) = watch::channel(None);
            state.in_flight.insert(fingerprint.clone(), sender.clone());
            CacheLookup::Reserved(Reservation {
                cache: Arc::clone(self),
                fingerprint: fingerprint.clone(),
                sender: Some(sender),
            })
        };

        drop(state);
        self.finish_eviction(doomed);
        lookup
    }

    /// Adopt a successful result's artifact into the cache directory.
    ///
    /// Returns the result rewritten to point at the cached copy. Results that
    /// did not succeed are returned unchanged and not stored.
    pub async fn store(&self, fingerprint: &Fingerprint, result: JobResult) -> Result<JobResult> {
        let Some(output) = result.output.clone().filter(|_| result.is_success()) else {
            return Ok(result);
        };
        let size_bytes = tokio::fs::metadata(&output).await?.len();
        if size_bytes > self.config.max_bytes {
            debug!(
                "Not caching {}: {} bytes exceeds the cache limit of {}",
                fingerprint, size_bytes, self.config.max_bytes
            );
            return Ok(result);
        }

        let file_name = match output.extension() {
            Some(ext) => format!("{}.{}", fingerprint, ext.to_string_lossy()),
            None => fingerprint.to_string(),
        };
        let cached_path = self.config.dir.join(file_name);
        if output != cached_path {
            move_file(&output, &cached_path)
                .await
                .map_err(|e| MediaJobError::Cache(format!("Failed to move artifact into cache: {}", e)))?;
        }
        let mut stored = result;
        stored.output = Some(cached_path);

        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let now = unix_now();
        state.entries.insert(
            fingerprint.clone(),
            CacheEntry {
                fingerprint: fingerprint.clone(),
                result: stored.clone(),
                size_bytes,
                stored_at: now,
                last_access: now,
                seq,
            },
        );
        let doomed = self.evict(&mut state, Some(fingerprint));
        drop(state);
        if doomed.is_empty() {
            if let Err(e) = self.save_index() {
                warn!("Failed to persist cache index: {}", e);
            }
        } else {
            self.finish_eviction(doomed);
        }

        debug!("Cached {} ({} bytes)", fingerprint, size_bytes);
        Ok(stored)
    }

    /// All completed entries, oldest first
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<_> = self.lock().entries.values().cloned().collect();
        entries.sort_by_key(|e| (e.stored_at, e.seq));
        entries
    }

    pub fn info(&self) -> CacheInfo {
        let state = self.lock();
        CacheInfo {
            entries: state.entries.len(),
            total_bytes: state.total_bytes(),
            in_flight: state.in_flight.len(),
            oldest_entry: state.entries.values().map(|e| e.stored_at).min(),
            newest_entry: state.entries.values().map(|e| e.stored_at).max(),
        }
    }

    /// Remove every completed entry and its artifact
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let doomed: Vec<CacheEntry> = state.entries.drain().map(|(_, e)| e).collect();
        drop(state);
        let count = doomed.len();
        self.finish_eviction(doomed);
        count
    }

    /// Remove entries stored longer ago than `age`
    pub fn clean(&self, age: Duration) -> usize {
        let cutoff = unix_now().saturating_sub(age.as_secs());
        let mut state = self.lock();
        let stale: Vec<Fingerprint> = state
            .entries
            .values()
            .filter(|e| e.stored_at < cutoff)
            .map(|e| e.fingerprint.clone())
            .collect();
        let doomed: Vec<CacheEntry> = stale.iter().filter_map(|fp| state.entries.remove(fp)).collect();
        drop(state);
        let count = doomed.len();
        self.finish_eviction(doomed);
        count
    }

    fn drop_if_stale(&self, state: &mut CacheState, fingerprint: &Fingerprint) -> Vec<CacheEntry> {
        let max_age = self.config.max_age_secs;
        let stale = match state.entries.get(fingerprint) {
            Some(entry) => {
                let expired = unix_now().saturating_sub(entry.stored_at) > max_age;
                let missing = !entry.artifact().is_some_and(|p| p.is_file());
                expired || missing
            }
            None => false,
        };
        if stale {
            debug!("Dropping stale cache entry {}", fingerprint);
            state.entries.remove(fingerprint).into_iter().collect()
        } else {
            Vec::new()
        }
    }

    /// Pick entries to drop: expired ones, then least recently used until
    /// within the entry and byte bounds. `keep` is never evicted.
    fn evict(&self, state: &mut CacheState, keep: Option<&Fingerprint>) -> Vec<CacheEntry> {
        let now = unix_now();
        let max_age = self.config.max_age_secs;
        let expired: Vec<Fingerprint> = state
            .entries
            .values()
            .filter(|e| now.saturating_sub(e.stored_at) > max_age && Some(&e.fingerprint) != keep)
            .map(|e| e.fingerprint.clone())
            .collect();
        let mut doomed: Vec<CacheEntry> = expired.iter().filter_map(|fp| state.entries.remove(fp)).collect();

        let mut total = state.total_bytes();
        while state.entries.len() > self.config.max_entries || total > self.config.max_bytes {
            let victim = state
                .entries
                .values()
                .filter(|e| Some(&e.fingerprint) != keep)
                .min_by_key(|e| e.seq)
                .map(|e| e.fingerprint.clone());
            let Some(victim) = victim else { break };
            if let Some(entry) = state.entries.remove(&victim) {
                total = total.saturating_sub(entry.size_bytes);
                doomed.push(entry);
            }
        }
        doomed
    }

    /// Delete evicted artifacts and persist the index
    fn finish_eviction(&self, doomed: Vec<CacheEntry>) {
        if doomed.is_empty() {
            return;
        }
        for entry in &doomed {
            if let Some(path) = entry.artifact() {
                if let Err(e) = std::fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove cached artifact {}: {}", path.display(), e);
                    }
                }
            }
            debug!("Evicted cache entry {}", entry.fingerprint);
        }
        if let Err(e) = self.save_index() {
            warn!("Failed to persist cache index: {}", e);
        }
    }

    fn save_index(&self) -> Result<()> {
        let entries = self.entries();
        let content = serde_json::to_string_pretty(&entries)?;
        let index_path = self.config.dir.join(INDEX_FILE);
        let temp_path = index_path.with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &index_path)?;
        Ok(())
    }
}

/// Waits for the leader of an in-flight fingerprint
pub struct InFlightWaiter {
    receiver: watch::Receiver<Option<JobResult>>,
}

impl InFlightWaiter {
    /// The leader's stored result, or `None` if it failed or gave up
    pub async fn wait(mut self) -> Option<JobResult> {
        loop {
            if let Some(result) = self.receiver.borrow_and_update().clone() {
                return Some(result);
            }
            if self.receiver.changed().await.is_err() {
                return self.receiver.borrow().clone();
            }
        }
    }
}

/// Exclusive claim on a fingerprint while its job runs.
///
/// Dropping it without [`Reservation::complete`] releases the fingerprint
/// and wakes followers with `None`.
pub struct Reservation {
    cache: Arc<ResultCache>,
    fingerprint: Fingerprint,
    sender: Option<watch::Sender<Option<JobResult>>>,
}

impl Reservation {
    /// Store a successful result and hand it to every follower
    pub async fn complete(mut self, result: JobResult) -> Result<JobResult> {
        if !result.is_success() {
            return Ok(result);
        }
        let stored = self.cache.store(&self.fingerprint, result).await?;
        self.release(Some(stored.clone()));
        Ok(stored)
    }

    fn release(&mut self, value: Option<JobResult>) {
        let Some(sender) = self.sender.take() else { return };
        self.cache.lock().in_flight.remove(&self.fingerprint);
        if value.is_some() {
            sender.send_replace(value);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release(None);
    }
}
