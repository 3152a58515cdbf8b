//! Re-embedding pipeline: rebuilds the whole gallery from enrolled source
//! images on a background worker.
//!
//! At most one run is active at a time. The running flag is claimed with a
//! compare-and-swap before the worker is spawned and released by a drop
//! guard, so it returns to idle on success, abandonment or panic alike.
//! With a [`RunLock`] attached, the same holds across processes sharing the
//! lock file.

use crate::descriptor::FeatureExtractor;
use crate::gallery::{Gallery, GalleryStore};
use crate::runlock::{RunLock, RunLockGuard};
use crate::types::{Identity, TrainingState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;

/// Failure reported by an [`EnrollmentSource`] backend.
#[derive(Error, Debug)]
#[error("enrollment source: {0}")]
pub struct SourceError(Box<dyn std::error::Error + Send + Sync>);

impl SourceError {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

/// Record store view the pipeline reads enrollments from.
pub trait EnrollmentSource: Send + Sync {
    fn enrolled_identities(&self) -> Result<Vec<Identity>, SourceError>;

    /// Stored enrollment image bytes, or `None` if the image is missing.
    fn read_source_image(&self, identity: &Identity) -> Result<Option<Vec<u8>>, SourceError>;
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to spawn re-embedding worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed to take re-embedding lock: {0}")]
    Lock(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A new gallery replaced the old one.
    Installed,
    /// Nothing could be embedded; the existing gallery was left alone.
    Abandoned,
}

/// Aggregate result of one run. Per-identity failures only show up here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub embedded: usize,
    pub skipped: usize,
    pub outcome: RunOutcome,
}

/// Completion signal for a started run.
pub struct RunHandle {
    done: oneshot::Receiver<RunReport>,
}

impl RunHandle {
    /// Await the run. `None` if the worker died without reporting.
    pub async fn finished(self) -> Option<RunReport> {
        self.done.await.ok()
    }

    /// Block the current thread until the run ends. Must not be called from
    /// within an async context.
    pub fn wait(self) -> Option<RunReport> {
        self.done.blocking_recv().ok()
    }
}

/// Result of asking for a run.
pub enum Trigger {
    Started(RunHandle),
    /// A run is already active; this request was absorbed.
    AlreadyRunning,
}

impl Trigger {
    pub fn started(&self) -> bool {
        matches!(self, Trigger::Started(_))
    }

    pub fn into_handle(self) -> Option<RunHandle> {
        match self {
            Trigger::Started(handle) => Some(handle),
            Trigger::AlreadyRunning => None,
        }
    }
}

struct Inner {
    running: AtomicBool,
    lock: Option<RunLock>,
    extractor: Arc<FeatureExtractor>,
    source: Arc<dyn EnrollmentSource>,
    gallery: Arc<GalleryStore>,
}

/// Releases the running flag, then the lock file, when the run ends,
/// however it ends.
struct RunGuard {
    inner: Arc<Inner>,
    _file_lock: Option<RunLockGuard>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
    }
}

/// Single-flight gallery rebuilder. Cheap to clone; clones share the flag.
#[derive(Clone)]
pub struct ReembedPipeline {
    inner: Arc<Inner>,
}

impl ReembedPipeline {
    pub fn new(
        extractor: Arc<FeatureExtractor>,
        source: Arc<dyn EnrollmentSource>,
        gallery: Arc<GalleryStore>,
    ) -> Self {
        Self::build(extractor, source, gallery, None)
    }

    /// Like [`new`](Self::new), but runs also hold `lock` so other processes
    /// using the same lock file neither start a second run nor report idle.
    pub fn with_run_lock(
        extractor: Arc<FeatureExtractor>,
        source: Arc<dyn EnrollmentSource>,
        gallery: Arc<GalleryStore>,
        lock: RunLock,
    ) -> Self {
        Self::build(extractor, source, gallery, Some(lock))
    }

    fn build(
        extractor: Arc<FeatureExtractor>,
        source: Arc<dyn EnrollmentSource>,
        gallery: Arc<GalleryStore>,
        lock: Option<RunLock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(false),
                lock,
                extractor,
                source,
                gallery,
            }),
        }
    }

    pub fn state(&self) -> TrainingState {
        let elsewhere = || self.inner.lock.as_ref().is_some_and(RunLock::is_held);
        if self.inner.running.load(Ordering::Acquire) || elsewhere() {
            TrainingState::Running
        } else {
            TrainingState::Idle
        }
    }

    /// Start a run on a background worker unless one is already active.
    pub fn trigger(&self) -> Result<Trigger, PipelineError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("re-embedding already running; request absorbed");
            return Ok(Trigger::AlreadyRunning);
        }

        let mut guard = RunGuard {
            inner: Arc::clone(&self.inner),
            _file_lock: None,
        };
        if let Some(lock) = &self.inner.lock {
            match lock.try_acquire() {
                Ok(Some(held)) => guard._file_lock = Some(held),
                Ok(None) => {
                    tracing::debug!("re-embedding running in another process; request absorbed");
                    return Ok(Trigger::AlreadyRunning);
                }
                Err(e) => return Err(PipelineError::Lock(e)),
            }
        }
        let (tx, rx) = oneshot::channel();

        // If spawning fails the closure (and the guard) is dropped, which
        // releases the flag.
        std::thread::Builder::new()
            .name("attend-reembed".into())
            .spawn(move || {
                // Locals drop in reverse order: on panic the flag is released
                // before the completion channel closes.
                let tx = tx;
                let guard = guard;
                let report = guard.inner.run();
                drop(guard);
                let _ = tx.send(report);
            })?;

        Ok(Trigger::Started(RunHandle { done: rx }))
    }
}

impl Inner {
    fn run(&self) -> RunReport {
        let started = Instant::now();

        let identities = match self.source.enrolled_identities() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "cannot enumerate enrollments; keeping existing gallery");
                return RunReport {
                    embedded: 0,
                    skipped: 0,
                    outcome: RunOutcome::Abandoned,
                };
            }
        };
        tracing::info!(enrolled = identities.len(), "re-embedding started");

        let mut gallery = Gallery::new();
        let mut skipped = 0usize;

        for identity in identities {
            let bytes = match self.source.read_source_image(&identity) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    tracing::debug!(identity = %identity, "source image missing; skipping");
                    skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(identity = %identity, error = %e, "source image unreadable; skipping");
                    skipped += 1;
                    continue;
                }
            };

            match self.extractor.extract(&bytes) {
                Ok(vector) => {
                    tracing::debug!(identity = %identity, "extracted features");
                    gallery.insert(identity, vector);
                }
                Err(e) => {
                    tracing::warn!(identity = %identity, error = %e, "no usable vector; skipping");
                    skipped += 1;
                }
            }
        }

        if gallery.is_empty() {
            tracing::warn!(skipped, "no identities embedded; keeping existing gallery");
            return RunReport {
                embedded: 0,
                skipped,
                outcome: RunOutcome::Abandoned,
            };
        }

        let embedded = gallery.len();
        if let Err(e) = self.gallery.replace(gallery) {
            tracing::error!(error = %e, "failed to persist gallery; serving in-memory copy only");
        }

        tracing::info!(
            embedded,
            skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "re-embedding complete"
        );

        RunReport {
            embedded,
            skipped,
            outcome: RunOutcome::Installed,
        }
    }
}
