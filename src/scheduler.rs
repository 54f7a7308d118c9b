// =============================================================================
// Scheduler — fixed-interval jobs with overlap skip and per-job stats
// =============================================================================
//
// Each job owns a driver task that ticks at its fixed period and spawns the
// actual work as a separate task. If a tick fires while the previous run is
// still in flight, the tick is SKIPPED (never queued) and recorded with
// reason `previous_still_running` — a job has at most one live run.
//
// Shutdown: the scheduler stops all tickers immediately, grants in-flight
// runs a bounded grace period, then aborts whatever is left.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Skip reason recorded when a tick lands on a still-running job.
pub const SKIP_PREVIOUS_STILL_RUNNING: &str = "previous_still_running";

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Mutable per-job execution statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub last_started: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_result: Option<String>,
    pub runs: u64,
    pub errors: u64,
    pub skips: u64,
    pub last_error: Option<String>,
}

/// Read-only view of one job for status logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: String,
    pub running: bool,
    pub stats: JobStats,
}

struct Job {
    name: String,
    stats: Arc<RwLock<JobStats>>,
    running: Arc<AtomicBool>,
    driver: JoinHandle<()>,
    current_run: Arc<Mutex<Option<JoinHandle<()>>>>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    jobs: Mutex<Vec<Job>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            jobs: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a job that runs `task` every `period`, starting one period
    /// from now. `task` is invoked once per non-skipped tick and returns a
    /// short human-readable result for the job log.
    pub fn spawn_job<F, Fut>(&self, name: &str, period: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let name = name.to_string();
        let stats: Arc<RwLock<JobStats>> = Arc::new(RwLock::new(JobStats::default()));
        let running = Arc::new(AtomicBool::new(false));
        let current_run: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));

        let driver = {
            let name = name.clone();
            let stats = stats.clone();
            let running = running.clone();
            let current_run = current_run.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                let start_at = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start_at, period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                info!(job = %name, period_s = period.as_secs_f64(), "job scheduled");

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown_rx.changed() => {
                            info!(job = %name, "job ticker stopped");
                            break;
                        }
                    }

                    // Overlap prevention: skip, never queue.
                    if running.swap(true, Ordering::SeqCst) {
                        let mut s = stats.write();
                        s.skips += 1;
                        s.last_result = Some(format!("skipped: {SKIP_PREVIOUS_STILL_RUNNING}"));
                        warn!(job = %name, reason = SKIP_PREVIOUS_STILL_RUNNING, "cycle skipped");
                        continue;
                    }

                    stats.write().last_started = Some(Utc::now());

                    let run = {
                        let name = name.clone();
                        let stats = stats.clone();
                        let running = running.clone();
                        let fut = task();
                        tokio::spawn(async move {
                            let started = std::time::Instant::now();
                            let result = fut.await;
                            let elapsed_ms = started.elapsed().as_millis() as u64;

                            let mut s = stats.write();
                            s.last_duration_ms = Some(elapsed_ms);
                            match result {
                                Ok(message) => {
                                    s.runs += 1;
                                    s.last_result = Some(message);
                                }
                                Err(e) => {
                                    s.errors += 1;
                                    s.last_error = Some(e.to_string());
                                    s.last_result = Some("error".to_string());
                                    error!(job = %name, error = %e, "job run failed");
                                }
                            }
                            drop(s);
                            running.store(false, Ordering::SeqCst);
                        })
                    };
                    *current_run.lock() = Some(run);
                }
            })
        };

        self.jobs.lock().push(Job {
            name,
            stats,
            running,
            driver,
            current_run,
        });
    }

    /// Status snapshot for every registered job.
    pub fn status(&self) -> Vec<JobStatus> {
        self.jobs
            .lock()
            .iter()
            .map(|job| JobStatus {
                name: job.name.clone(),
                running: job.running.load(Ordering::SeqCst),
                stats: job.stats.read().clone(),
            })
            .collect()
    }

    /// Stop accepting new ticks, grant in-flight runs `grace` to finish, then
    /// cancel whatever is still running.
    pub async fn shutdown(&self, grace: Duration) {
        info!(grace_s = grace.as_secs_f64(), "scheduler shutting down");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let any_running = self
                .jobs
                .lock()
                .iter()
                .any(|job| job.running.load(Ordering::SeqCst));
            if !any_running || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let jobs = self.jobs.lock();
        for job in jobs.iter() {
            job.driver.abort();
            if job.running.load(Ordering::SeqCst) {
                warn!(job = %job.name, "job still running after grace — cancelling");
                if let Some(run) = job.current_run.lock().take() {
                    run.abort();
                }
            }
        }
        info!("scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs.lock().len())
            .finish()
    }
}
