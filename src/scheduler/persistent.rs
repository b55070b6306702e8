//! Persistent recurring scheduler.
//!
//! Drives the periodic lineup and guide refreshes. The next-run instant is
//! persisted to a small JSON file so a restart picks up the remaining wait
//! instead of starting the cycle over. Delays longer than a single timer
//! slice are realized as a chain of sub-slice waits that re-evaluate the
//! remaining delay at every link; a generation token invalidates links
//! left over from a cancelled or superseded arm.
//!
//! The persisted state always describes the *next* run: it is rewritten
//! strictly after the task callback completes and before re-arming, so a
//! crash in between at worst causes one extra immediate run on restart,
//! never a lost one.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

/// Longest single sleep we schedule; longer waits are chained.
const MAX_TIMER_SLICE_MS: u64 = i32::MAX as u64;

/// Result of one refresh-task invocation. Errors are caught and logged by
/// the scheduler; they never break the recurring cycle.
pub type TaskResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The externally supplied refresh callback.
pub type TaskFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = TaskResult> + Send>> + Send + Sync>;

/// Schedule-file I/O problems. Recovered locally by resetting to a fresh
/// default schedule; never fatal.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("schedule file parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The durable record: how often to run, and the concrete instant of the
/// next run. `next_run_at` is always absolute, never relative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleState {
    pub interval_ms: u64,
    pub next_run_at: DateTime<Utc>,
}

impl ScheduleState {
    fn fresh(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            next_run_at: Utc::now(),
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Restart-safe, cancellable recurring-task runner.
pub struct PersistentScheduler {
    label: String,
    path: PathBuf,
    task: TaskFn,
    state: Mutex<ScheduleState>,
    /// Bumped on every cancel/re-arm; a timer link only acts while its own
    /// generation is still current, and a due link must atomically bump it
    /// past itself before running.
    generation: AtomicU64,
    cancelled: Notify,
    max_slice: Duration,
}

impl PersistentScheduler {
    /// Load the schedule from `path`, or initialize it to "run now" with
    /// `default_interval` and persist immediately.
    pub fn new(
        path: impl Into<PathBuf>,
        label: impl Into<String>,
        default_interval: Duration,
        task: TaskFn,
    ) -> Arc<Self> {
        let path = path.into();
        let label = label.into();

        let state = match Self::load(&path) {
            Ok(Some(state)) => state,
            Ok(None) => {
                let state = ScheduleState::fresh(default_interval);
                if let Err(e) = Self::persist(&path, &state) {
                    warn!("{}: could not write initial schedule file: {}", label, e);
                }
                state
            }
            Err(e) => {
                error!(
                    "{}: schedule file {:?} unreadable ({}); resetting to run now",
                    label, path, e
                );
                let state = ScheduleState::fresh(default_interval);
                if let Err(e) = Self::persist(&path, &state) {
                    warn!("{}: could not rewrite schedule file: {}", label, e);
                }
                state
            }
        };

        Arc::new(Self {
            label,
            path,
            task,
            state: Mutex::new(state),
            generation: AtomicU64::new(0),
            cancelled: Notify::new(),
            max_slice: Duration::from_millis(MAX_TIMER_SLICE_MS),
        })
    }

    /// Shrink the maximum single-sleep slice. Exercised by the chained-wait
    /// tests; production uses the default.
    pub fn with_max_slice(self: Arc<Self>, max_slice: Duration) -> Arc<Self> {
        let mut this = Arc::try_unwrap(self).unwrap_or_else(|_| {
            panic!("with_max_slice requires exclusive ownership")
        });
        this.max_slice = max_slice;
        Arc::new(this)
    }

    fn load(path: &PathBuf) -> Result<Option<ScheduleState>, ScheduleError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whole-file rewrite via a temp file so a reload never sees a torn
    /// record.
    fn persist(path: &PathBuf, state: &ScheduleState) -> Result<(), ScheduleError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Current durable state (primarily for startup logging and tests).
    pub async fn state(&self) -> ScheduleState {
        self.state.lock().await.clone()
    }

    /// Run immediately if the persisted instant is due, otherwise arm a
    /// timer chain for the remaining delay.
    pub async fn schedule_next_run(self: &Arc<Self>) {
        let next_run_at = self.state.lock().await.next_run_at;
        if next_run_at <= Utc::now() {
            self.run_task().await;
        } else {
            info!("{} scheduled for {}", self.label, next_run_at.to_rfc3339());
            self.arm();
        }
    }

    /// Cancel any pending timer chain. Idempotent; a task invocation
    /// already in progress is not interrupted.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cancelled.notify_waiters();
    }

    /// Cancel any pending arm and run the task right now.
    pub async fn force_run_now(self: &Arc<Self>) {
        self.cancel();
        self.run_task().await;
    }

    /// Run the task, persist the next instant, re-arm.
    async fn run_task(self: &Arc<Self>) {
        // Supersede any pending chain so a stale link can't double-run.
        self.cancel();

        info!("Running {}...", self.label);
        if let Err(e) = (self.task)().await {
            error!("{} failed: {}", self.label, e);
        }

        let next_run_at = {
            let mut state = self.state.lock().await;
            state.next_run_at = Utc::now()
                + chrono::Duration::milliseconds(state.interval_ms as i64);
            state.clone()
        };

        // Persist after the callback and before re-arming: a crash here
        // costs at most one extra run on restart.
        if let Err(e) = Self::persist(&self.path, &next_run_at) {
            warn!("{}: could not persist schedule: {}", self.label, e);
        }

        info!(
            "{} finished. Next run scheduled for {}",
            self.label,
            next_run_at.next_run_at.to_rfc3339()
        );
        self.arm();
    }

    /// Spawn the chained-wait timer for the currently persisted instant.
    fn arm(self: &Arc<Self>) {
        let my_generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let scheduler = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                // Created before the generation check: a cancel that lands
                // in between still wakes this link instead of leaving it
                // asleep for a whole slice.
                let cancelled = scheduler.cancelled.notified();

                if scheduler.generation.load(Ordering::Acquire) != my_generation {
                    return; // superseded while waiting
                }

                // Re-evaluate the remaining delay at every link; never
                // trust an accumulated countdown.
                let target = scheduler.state.lock().await.next_run_at;
                let remaining = target - Utc::now();
                let Ok(remaining) = remaining.to_std() else {
                    break; // due (or past due)
                };
                if remaining.is_zero() {
                    break;
                }

                let slice = remaining.min(scheduler.max_slice);
                tokio::select! {
                    _ = tokio::time::sleep(slice) => {}
                    _ = cancelled => {}
                }
            }

            // Claim the run by superseding this link's own generation in a
            // single step. A cancel or forced run landing in the same
            // instant bumps the generation first and wins the claim, so the
            // callback can never fire twice for one due instant.
            if scheduler
                .generation
                .compare_exchange(
                    my_generation,
                    my_generation + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                scheduler.run_task().await;
            }
        });
    }
}
