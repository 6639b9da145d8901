//! Coalescing read-through cache.
//!
//! For a given key at most one execution of the compute function is in
//! flight in this process. The first caller to miss becomes the leader and
//! starts an execution; callers that miss while it runs become followers and
//! await the same result.
//!
//! An execution is driven by its own task, not by the leader's request, so
//! cancelling the leader never strands the followers. The driver:
//!
//! 1. spawns the compute as a separate task,
//! 2. races it against `ttl / 2`,
//! 3. stores the outcome when the entry policy allows it,
//! 4. publishes exactly one resolution on a watch channel,
//! 5. removes its slot, but only if the slot still belongs to it.
//!
//! Because the resolution is published before the slot is removed, a caller
//! that joins in between simply replays it. The slot is also removed when the
//! driver unwinds, so a panicking backend cannot leave a key stuck in flight.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ecorpc_core::{
    decode_outcome, encode_outcome, CacheError, CacheKey, CacheResult, ErrorCode, Outcome,
    RpcError,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::backend::CacheBackend;

/// Future produced by a compute function.
pub type ComputeFuture = BoxFuture<'static, Outcome>;

/// Called with the number of in-flight executions whenever it changes.
pub type InFlightObserver = Arc<dyn Fn(usize) + Send + Sync>;

type Resolution = Result<Outcome, CacheError>;

// ============================================================================
// POLICIES
// ============================================================================

/// What happens to a compute that is still running when its waiters time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Keep running detached; its result is discarded.
    #[default]
    Detach,
    /// Keep running detached and store its result if it is storable and the
    /// key holds no fresh entry by then. A later execution that already
    /// stored a result is never overwritten by an older one.
    DetachAndStore,
    /// Abort the compute task.
    Abort,
}

/// Storage policy for one lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPolicy {
    pub ttl: Duration,
    pub cache_errors: bool,
}

impl EntryPolicy {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache_errors: true,
        }
    }

    pub fn with_cache_errors(mut self, cache_errors: bool) -> Self {
        self.cache_errors = cache_errors;
        self
    }

    /// Budget for one execution before waiters are released.
    pub fn compute_timeout(&self) -> Duration {
        self.ttl / 2
    }

    /// Payloads are always stored; business errors only when the policy says
    /// so. Unstructured and infrastructure errors never are.
    pub fn should_store(&self, outcome: &Outcome) -> bool {
        match outcome {
            Outcome::Payload(_) => true,
            Outcome::Error(err) => self.cache_errors && err.is_business(),
        }
    }
}

/// Where a served outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Read from the backing store.
    Hit,
    /// This caller started the execution.
    Leader,
    /// This caller awaited an execution started by another.
    Coalesced,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Hit => "hit",
            Source::Leader => "leader",
            Source::Coalesced => "coalesced",
        }
    }
}

/// An outcome together with how it was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub outcome: Outcome,
    pub source: Source,
}

// ============================================================================
// CRASH REPORTING
// ============================================================================

/// Hook invoked when a compute aborts abnormally.
pub trait CrashReporter: Send + Sync {
    fn report(&self, method: &str, detail: &str);
}

/// Reports crashes as error-level log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingCrashReporter;

impl CrashReporter for TracingCrashReporter {
    fn report(&self, method: &str, detail: &str) {
        tracing::error!(method = %method, panic = %detail, "Handler panicked");
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// COALESCING CACHE
// ============================================================================

struct Slot {
    id: u64,
    rx: watch::Receiver<Option<Resolution>>,
}

/// Read-through cache with per-key execution coalescing.
pub struct CoalescingCache<B: CacheBackend + ?Sized + 'static> {
    backend: Arc<B>,
    slots: Arc<DashMap<String, Slot>>,
    next_id: AtomicU64,
    timeout_policy: TimeoutPolicy,
    reporter: Arc<dyn CrashReporter>,
    observer: Option<InFlightObserver>,
}

impl<B: CacheBackend + ?Sized + 'static> CoalescingCache<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            slots: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            timeout_policy: TimeoutPolicy::default(),
            reporter: Arc::new(TracingCrashReporter),
            observer: None,
        }
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn with_crash_reporter(mut self, reporter: Arc<dyn CrashReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Report the in-flight count each time an execution starts or ends.
    pub fn with_in_flight_observer(mut self, observer: InFlightObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        self.timeout_policy
    }

    /// Number of executions currently in flight.
    pub fn in_flight_len(&self) -> usize {
        self.slots.len()
    }

    /// Serve `key` from the store, or from a single shared execution of
    /// `compute` among all concurrent callers that missed.
    ///
    /// Backend read failures are returned as-is and `compute` is not run.
    pub async fn get<F>(
        &self,
        method: &str,
        key: &CacheKey,
        policy: EntryPolicy,
        compute: F,
    ) -> CacheResult<Served>
    where
        F: FnOnce() -> ComputeFuture + Send + 'static,
    {
        if let Some(raw) = self.backend.get(key.as_str()).await? {
            match decode_outcome(&raw) {
                Ok(outcome) => {
                    return Ok(Served {
                        outcome,
                        source: Source::Hit,
                    })
                }
                Err(e) => {
                    tracing::warn!(
                        method = %method,
                        key = %key.fingerprint(),
                        error = %e,
                        "Ignoring undecodable cache entry"
                    );
                }
            }
        }

        let (mut rx, source, execution) = match self.slots.entry(key.as_str().to_string()) {
            Entry::Occupied(slot) => (slot.get().rx.clone(), Source::Coalesced, None),
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                vacant.insert(Slot { id, rx: rx.clone() });

                let execution = Execution {
                    backend: Arc::clone(&self.backend),
                    reporter: Arc::clone(&self.reporter),
                    timeout_policy: self.timeout_policy,
                    method: method.to_string(),
                    key: key.as_str().to_string(),
                    policy,
                    release: SlotRelease {
                        slots: Arc::clone(&self.slots),
                        observer: self.observer.clone(),
                        key: key.as_str().to_string(),
                        id,
                    },
                };
                (rx, Source::Leader, Some((execution, tx)))
            }
        };
        // Report the start outside the entry guard, before the driver can
        // report its own end.
        if let Some((execution, tx)) = execution {
            self.observe();
            tokio::spawn(execution.run(tx, compute));
        }

        let resolution = match rx.wait_for(Option::is_some).await {
            Ok(state) => state
                .clone()
                .unwrap_or_else(|| Err(CacheError::internal("execution published no result"))),
            Err(_) => Err(CacheError::internal(
                "execution ended without publishing a result",
            )),
        };

        resolution.map(|outcome| Served { outcome, source })
    }

    fn observe(&self) {
        if let Some(observer) = &self.observer {
            observer(self.slots.len());
        }
    }
}

/// Removes an execution's slot when dropped, whether the driver finished or
/// unwound.
struct SlotRelease {
    slots: Arc<DashMap<String, Slot>>,
    observer: Option<InFlightObserver>,
    key: String,
    id: u64,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        let id = self.id;
        self.slots.remove_if(&self.key, |_, slot| slot.id == id);
        if let Some(observer) = &self.observer {
            observer(self.slots.len());
        }
    }
}

/// State owned by the task driving one execution.
struct Execution<B: CacheBackend + ?Sized + 'static> {
    backend: Arc<B>,
    reporter: Arc<dyn CrashReporter>,
    timeout_policy: TimeoutPolicy,
    method: String,
    key: String,
    policy: EntryPolicy,
    release: SlotRelease,
}

impl<B: CacheBackend + ?Sized + 'static> Execution<B> {
    async fn run<F>(self, tx: watch::Sender<Option<Resolution>>, compute: F)
    where
        F: FnOnce() -> ComputeFuture + Send + 'static,
    {
        let started = Instant::now();
        let limit = self.policy.compute_timeout();
        let mut handle: JoinHandle<Outcome> = tokio::spawn(async move { compute().await });

        let resolution = match timeout(limit, &mut handle).await {
            Ok(Ok(outcome)) => {
                tracing::debug!(
                    method = %self.method,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = outcome.is_error(),
                    "Cached call computed"
                );
                if self.policy.should_store(&outcome) {
                    let stored = AssertUnwindSafe(store(
                        self.backend.as_ref(),
                        &self.method,
                        &self.key,
                        &outcome,
                        self.policy.ttl,
                        StoreMode::Replace,
                    ))
                    .catch_unwind()
                    .await;
                    if let Err(payload) = stored {
                        tracing::error!(
                            method = %self.method,
                            backend = self.backend.name(),
                            panic = %panic_message(payload.as_ref()),
                            "Cache backend panicked while storing"
                        );
                    }
                }
                Ok(outcome)
            }
            Ok(Err(join_err)) => {
                let detail = if join_err.is_panic() {
                    panic_message(join_err.into_panic().as_ref())
                } else {
                    "compute task was cancelled".to_string()
                };
                self.reporter.report(&self.method, &detail);
                Ok(Outcome::Error(RpcError::from_code(ErrorCode::Internal)))
            }
            Err(_) => {
                tracing::warn!(
                    method = %self.method,
                    timeout_ms = limit.as_millis() as u64,
                    policy = ?self.timeout_policy,
                    "Cached call timed out"
                );
                self.release_late(handle);
                Err(CacheError::Timeout {
                    method: self.method.clone(),
                    waited: limit,
                })
            }
        };

        tx.send_replace(Some(resolution));
        drop(self.release);
    }

    fn release_late(&self, handle: JoinHandle<Outcome>) {
        match self.timeout_policy {
            TimeoutPolicy::Detach => drop(handle),
            TimeoutPolicy::Abort => handle.abort(),
            TimeoutPolicy::DetachAndStore => {
                let backend = Arc::clone(&self.backend);
                let method = self.method.clone();
                let key = self.key.clone();
                let policy = self.policy;
                tokio::spawn(async move {
                    if let Ok(outcome) = handle.await {
                        if policy.should_store(&outcome) {
                            store(backend.as_ref(), &method, &key, &outcome, policy.ttl, StoreMode::IfAbsent)
                                .await;
                        }
                    }
                });
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreMode {
    Replace,
    IfAbsent,
}

/// Write an outcome to the backend. Failures are logged, never returned: the
/// caller already has its result.
async fn store<B: CacheBackend + ?Sized>(
    backend: &B,
    method: &str,
    key: &str,
    outcome: &Outcome,
    ttl: Duration,
    mode: StoreMode,
) {
    let encoded = match encode_outcome(outcome) {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::warn!(method = %method, error = %e, "Failed to encode cache entry");
            return;
        }
    };
    let result = match mode {
        StoreMode::Replace => backend.set(key, encoded, ttl).await,
        StoreMode::IfAbsent => match backend.set_if_absent(key, encoded, ttl).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!(method = %method, "Late result skipped; key already holds a newer entry");
                Ok(())
            }
            Err(e) => Err(e),
        },
    };
    if let Err(e) = result {
        tracing::warn!(
            method = %method,
            backend = backend.name(),
            error = %e,
            "Failed to store cache entry"
        );
    }
}
