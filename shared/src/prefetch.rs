//! Concurrent thumbnail prefetching.
//!
//! Best-effort by contract: a key that fails to download or decode is left out
//! of the cache, counted, and logged at debug level. Callers render a
//! placeholder for it and a later batch may try again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, Span};

use crate::cache::{CachedImage, ImageStore};
use crate::imaging::{self, DecodeLimits, ImagingError};
use crate::model::ImageKey;
use crate::services::ImageFetcher;

#[derive(Clone, Debug)]
pub struct PrefetchConfig {
    /// Upper bound on simultaneous downloads within one batch.
    pub max_in_flight: usize,
    pub decode: DecodeLimits,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: crate::DEFAULT_MAX_CONCURRENT_FETCHES,
            decode: DecodeLimits::default(),
        }
    }
}

/// Outcome of one `prefetch` call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Distinct keys handed in.
    pub requested: usize,
    pub already_cached: usize,
    /// Keys another batch was already downloading. The batch waits for
    /// those downloads instead of starting its own.
    pub joined: usize,
    /// Fetch calls this batch made to the image fetcher.
    pub issued: usize,
    /// Issued and joined keys that ended up in the cache.
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.succeeded + self.failed == self.issued + self.joined
    }
}

#[derive(Debug, Default)]
pub struct PrefetchMetrics {
    pub batches_completed: AtomicU64,
    pub batches_cancelled: AtomicU64,
    pub fetches_issued: AtomicU64,
    pub fetches_succeeded: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub decode_failures: AtomicU64,
    pub skipped_cached: AtomicU64,
    pub joined_in_flight: AtomicU64,
}

impl PrefetchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PrefetchMetricsSnapshot {
        PrefetchMetricsSnapshot {
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_cancelled: self.batches_cancelled.load(Ordering::Relaxed),
            fetches_issued: self.fetches_issued.load(Ordering::Relaxed),
            fetches_succeeded: self.fetches_succeeded.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            skipped_cached: self.skipped_cached.load(Ordering::Relaxed),
            joined_in_flight: self.joined_in_flight.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchMetricsSnapshot {
    pub batches_completed: u64,
    pub batches_cancelled: u64,
    pub fetches_issued: u64,
    pub fetches_succeeded: u64,
    pub fetch_failures: u64,
    pub decode_failures: u64,
    pub skipped_cached: u64,
    pub joined_in_flight: u64,
}

impl PrefetchMetricsSnapshot {
    /// Every thumbnail that did not make it into the cache.
    pub fn failed_total(&self) -> u64 {
        self.fetch_failures + self.decode_failures
    }
}

/// One key's download, awaitable from every batch that asked for it.
/// Resolves to whether the image landed in the cache.
type Download = Shared<BoxFuture<'static, bool>>;

struct InFlight {
    claim: u64,
    download: Download,
}

pub struct ImagePrefetcher {
    inner: Arc<Inner>,
}

/// State the download futures outlive their batch with.
struct Inner {
    cache: Arc<dyn ImageStore>,
    fetcher: Arc<dyn ImageFetcher>,
    config: PrefetchConfig,
    in_flight: Mutex<HashMap<ImageKey, InFlight>>,
    next_claim: AtomicU64,
    metrics: PrefetchMetrics,
}

impl ImagePrefetcher {
    pub fn new(
        cache: Arc<dyn ImageStore>,
        fetcher: Arc<dyn ImageFetcher>,
        config: PrefetchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                fetcher,
                config,
                in_flight: Mutex::new(HashMap::new()),
                next_claim: AtomicU64::new(0),
                metrics: PrefetchMetrics::new(),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<dyn ImageStore> {
        &self.inner.cache
    }

    pub fn metrics(&self) -> PrefetchMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Fetches every key that is not cached, at most `max_in_flight` at a
    /// time, and resolves once all of them have settled or `cancel` fires.
    /// A key another batch is already downloading is waited on, not fetched
    /// twice.
    #[instrument(skip_all, fields(keys = tracing::field::Empty))]
    pub async fn prefetch<I>(&self, keys: I, cancel: &CancellationToken) -> BatchReport
    where
        I: IntoIterator<Item = ImageKey>,
    {
        let mut report = BatchReport::default();
        let mut seen = HashSet::new();
        let mut claims = Claims::new(&self.inner);
        let mut downloads = Vec::new();

        for key in keys {
            if !seen.insert(key.clone()) {
                continue;
            }
            report.requested += 1;

            if self.inner.cache.contains(&key) {
                report.already_cached += 1;
                continue;
            }
            match claims.claim(key) {
                Claim::Issued(download) => {
                    report.issued += 1;
                    downloads.push(download);
                }
                Claim::Joined(download) => {
                    report.joined += 1;
                    downloads.push(download);
                }
            }
        }

        Span::current().record("keys", report.requested as u64);
        let metrics = &self.inner.metrics;
        metrics
            .skipped_cached
            .fetch_add(report.already_cached as u64, Ordering::Relaxed);
        metrics
            .joined_in_flight
            .fetch_add(report.joined as u64, Ordering::Relaxed);

        {
            let mut settled =
                stream::iter(downloads).buffer_unordered(self.inner.config.max_in_flight.max(1));

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                    next = settled.next() => match next {
                        Some(true) => report.succeeded += 1,
                        Some(false) => report.failed += 1,
                        None => break,
                    },
                }
            }
        }
        drop(claims);

        if report.cancelled {
            metrics.batches_cancelled.fetch_add(1, Ordering::Relaxed);
        } else {
            metrics.batches_completed.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            requested = report.requested,
            cached = report.already_cached,
            joined = report.joined,
            issued = report.issued,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            "prefetch batch settled"
        );

        report
    }

    /// Callback form of [`prefetch`](Self::prefetch): `on_batch_done` runs
    /// exactly once, on the spawned task, after the batch settles.
    pub fn spawn_prefetch<F>(
        self: &Arc<Self>,
        keys: Vec<ImageKey>,
        cancel: CancellationToken,
        on_batch_done: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(BatchReport) + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let report = this.prefetch(keys, &cancel).await;
            on_batch_done(report);
        })
    }
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<ImageKey, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn download(self: &Arc<Self>, key: ImageKey, claim: u64) -> Download {
        let this = Arc::clone(self);
        async move {
            let stored = this.fetch_one(&key).await;
            this.release(&key, claim);
            stored
        }
        .boxed()
        .shared()
    }

    /// Forgets `key` unless a later claim has replaced this one.
    fn release(&self, key: &ImageKey, claim: u64) {
        let mut in_flight = self.in_flight();
        if in_flight.get(key).is_some_and(|entry| entry.claim == claim) {
            in_flight.remove(key);
        }
    }

    async fn fetch_one(&self, key: &ImageKey) -> bool {
        self.metrics.fetches_issued.fetch_add(1, Ordering::Relaxed);

        let bytes = match self.fetcher.fetch_bytes(key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.metrics.fetch_failures.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, error = %e, "thumbnail fetch failed");
                return false;
            }
        };

        let limits = self.config.decode.clone();
        let decoded = tokio::task::spawn_blocking(move || {
            let image = imaging::decode_image(&limits, &bytes)?;
            Ok::<_, ImagingError>(CachedImage::new(bytes, image))
        })
        .await;

        match decoded {
            Ok(Ok(image)) => {
                self.cache.put(key.clone(), Arc::new(image));
                self.metrics.fetches_succeeded.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(Err(e)) => {
                self.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, error = %e, "thumbnail decode failed");
                false
            }
            Err(e) => {
                self.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, error = %e, "thumbnail decode task failed");
                false
            }
        }
    }
}

enum Claim {
    Issued(Download),
    Joined(Download),
}

/// Downloads this batch started. Released on drop, including when the
/// owning future is dropped mid-batch; batches that joined one keep
/// driving it to completion.
struct Claims<'a> {
    owner: &'a Arc<Inner>,
    issued: Vec<(ImageKey, u64)>,
}

impl<'a> Claims<'a> {
    fn new(owner: &'a Arc<Inner>) -> Self {
        Self {
            owner,
            issued: Vec::new(),
        }
    }

    fn claim(&mut self, key: ImageKey) -> Claim {
        let mut in_flight = self.owner.in_flight();
        if let Some(entry) = in_flight.get(&key) {
            return Claim::Joined(entry.download.clone());
        }

        let claim = self.owner.next_claim.fetch_add(1, Ordering::Relaxed);
        let download = self.owner.download(key.clone(), claim);
        in_flight.insert(
            key.clone(),
            InFlight {
                claim,
                download: download.clone(),
            },
        );
        self.issued.push((key, claim));
        Claim::Issued(download)
    }
}

impl Drop for Claims<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.owner.in_flight();
        for (key, claim) in &self.issued {
            if in_flight.get(key).is_some_and(|entry| entry.claim == *claim) {
                in_flight.remove(key);
            }
        }
    }
}
