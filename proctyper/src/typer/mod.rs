//! Executable classification.
//!
//! Decides which runtime a newly observed executable uses and where its
//! instrumentation points are, inspecting each distinct binary at most once:
//!
//! 1. Results are cached per [`ExecutableIdentity`] in a bounded LRU store.
//! 2. Concurrent misses on the same identity are serialized so only one of
//!    them inspects; the rest reuse its result.
//! 3. A process-wide limiter caps how many inspections run at once.

pub mod cache;
pub mod inflight;
pub mod inspect;
pub mod limiter;

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use log::{debug, warn};
use proctyper_common::{ExecutableIdentity, RuntimeKind, RuntimeOffsets};

use crate::settings::TyperConfig;
use crate::telemetry;
use cache::ClassificationCache;
use inflight::InflightTable;
use limiter::InspectionLimiter;

/// Executable of a discovered process.
#[derive(Debug, Clone)]
pub struct ExecutableInfo {
    pub pid: u32,
    pub exe_path: PathBuf,
    pub identity: ExecutableIdentity,
}

impl ExecutableInfo {
    /// Path that reaches the binary from the host, even inside another mount namespace.
    pub fn open_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/{}/exe", self.pid))
    }

    pub fn file_name(&self) -> Option<&str> {
        self.exe_path.file_name().and_then(|n| n.to_str())
    }
}

/// Successful inspection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub kind: RuntimeKind,
    pub offsets: Option<RuntimeOffsets>,
}

/// Parses an executable to find out how it can be instrumented.
///
/// Implementations are blocking and expensive. They must not cache, and
/// inspecting the same file twice must give the same class of result.
pub trait Inspector: Send + Sync {
    fn inspect(&self, exe: &ExecutableInfo) -> Result<Inspection>;
}

/// Outcome of classifying one executable. Immutable and shared by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub kind: RuntimeKind,
    pub offsets: Option<RuntimeOffsets>,
    /// Why the executable could not be classified.
    pub error: Option<String>,
    pub classified_at: Instant,
}

impl ClassificationResult {
    pub fn new(kind: RuntimeKind, offsets: Option<RuntimeOffsets>) -> Self {
        Self {
            kind,
            offsets,
            error: None,
            classified_at: Instant::now(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            kind: RuntimeKind::NotInstrumentable,
            offsets: None,
            error: Some(reason.into()),
            classified_at: Instant::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.kind == RuntimeKind::NotInstrumentable
    }

    pub fn instrumentable(&self) -> bool {
        !self.is_failure()
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.classified_at.elapsed() >= ttl
    }
}

impl From<Inspection> for ClassificationResult {
    fn from(inspection: Inspection) -> Self {
        Self::new(inspection.kind, inspection.offsets)
    }
}

/// Classifier shared by every discovery worker.
pub struct Typer {
    cache: Arc<ClassificationCache>,
    limiter: InspectionLimiter,
    inflight: Arc<InflightTable>,
    inspector: Arc<dyn Inspector>,
}

impl Typer {
    pub fn new(config: &TyperConfig, inspector: Arc<dyn Inspector>) -> Self {
        let cache = ClassificationCache::new(config.cache_size, config.failed_entry_ttl);
        let limiter = InspectionLimiter::new(config.max_concurrent_inspections);
        Self::with_parts(Arc::new(cache), limiter, inspector)
    }

    /// Builds a classifier around an existing cache and limiter.
    pub fn with_parts(
        cache: Arc<ClassificationCache>,
        limiter: InspectionLimiter,
        inspector: Arc<dyn Inspector>,
    ) -> Self {
        Self {
            cache,
            limiter,
            inflight: InflightTable::new(),
            inspector,
        }
    }

    pub fn cache(&self) -> &Arc<ClassificationCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &InspectionLimiter {
        &self.limiter
    }

    pub fn inflight(&self) -> &Arc<InflightTable> {
        &self.inflight
    }

    /// Classifies an executable, inspecting it only if its identity is not cached.
    pub async fn classify(&self, exe: &ExecutableInfo) -> Arc<ClassificationResult> {
        let identity = exe.identity;

        if let Some(hit) = self.cache.lookup(&identity) {
            telemetry::record_cache_lookup(true);
            return hit;
        }
        telemetry::record_cache_lookup(false);

        let guard = self.inflight.lock(identity).await;

        // Another caller may have finished the inspection while we waited
        if let Some(hit) = self.cache.lookup(&identity) {
            debug!(
                "Reusing classification of {:?} for PID {}",
                identity, exe.pid
            );
            return hit;
        }

        let permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => return Arc::new(ClassificationResult::failed(e.to_string())),
        };

        let cache = Arc::clone(&self.cache);
        let inspector = Arc::clone(&self.inspector);
        let job_exe = exe.clone();

        // The permit and the identity lock live inside the job: if this call is
        // cancelled the inspection still completes, gets cached, and only then
        // frees its slot and lock.
        let job = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _guard = guard;

            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| inspector.inspect(&job_exe)));
            telemetry::record_inspection(started.elapsed());

            let result = match outcome {
                Ok(Ok(inspection)) => ClassificationResult::from(inspection),
                Ok(Err(e)) => {
                    warn!(
                        "Failed to inspect {} (PID: {}): {:#}",
                        job_exe.exe_path.display(),
                        job_exe.pid,
                        e
                    );
                    ClassificationResult::failed(format!("{:#}", e))
                }
                Err(_) => {
                    warn!(
                        "Inspector panicked on {} (PID: {})",
                        job_exe.exe_path.display(),
                        job_exe.pid
                    );
                    ClassificationResult::failed("inspector panicked")
                }
            };
            let result = Arc::new(result);

            if result.is_failure() {
                telemetry::record_inspection_failure();
            }
            if cache.insert(identity, Arc::clone(&result)).is_some() {
                telemetry::record_cache_eviction();
            }
            result
        });

        match job.await {
            Ok(result) => {
                telemetry::record_classification(result.kind);
                result
            }
            Err(e) => {
                warn!("Inspection task for PID {} did not complete: {}", exe.pid, e);
                Arc::new(ClassificationResult::failed("inspection task aborted"))
            }
        }
    }

    /// Stops admitting new inspections. Pending classifications resolve as failures.
    pub fn shutdown(&self) {
        self.limiter.close();
    }
}
