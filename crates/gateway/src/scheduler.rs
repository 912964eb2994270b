//! Periodic job runner with per-job locking, consecutive-failure
//! auto-pause, and manual trigger/pause/resume.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use aegis_domain::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub id: String,
    pub name: String,
    pub interval_ms: u64,
    pub initial_delay_ms: Option<u64>,
    pub run_immediately: bool,
    pub max_consecutive_failures: u32,
    pub enabled: bool,
    /// Only the cluster leader runs this job.
    pub leader_only: bool,
}

impl JobConfig {
    pub fn new(id: &str, name: &str, interval_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            interval_ms,
            initial_delay_ms: None,
            run_immediately: false,
            max_consecutive_failures: 5,
            enabled: true,
            leader_only: false,
        }
    }

    pub fn leader_only(mut self) -> Self {
        self.leader_only = true;
        self
    }

    pub fn run_immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Error,
}

pub type JobHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Broadcast to listeners after every execution.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub run_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job locks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serializes each job's execution (cluster-wide when backed by
/// advisory locks).
#[async_trait::async_trait]
pub trait JobLock: Send + Sync {
    /// Returns a guard while the lock is held, or `None` when another
    /// holder is running the job.
    async fn try_acquire(&self, job_id: &str) -> Option<Box<dyn Send>>;
}

/// Process-local lock for single-node deployments and tests.
#[derive(Default)]
pub struct LocalJobLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LocalJobLock {
    pub fn new() -> Self {
        Self::default()
    }
}

struct LocalGuard {
    held: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl Drop for LocalGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.job_id);
    }
}

#[async_trait::async_trait]
impl JobLock for LocalJobLock {
    async fn try_acquire(&self, job_id: &str) -> Option<Box<dyn Send>> {
        if !self.held.lock().insert(job_id.to_string()) {
            return None;
        }
        Some(Box::new(LocalGuard {
            held: self.held.clone(),
            job_id: job_id.to_string(),
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct JobEntry {
    config: JobConfig,
    handler: JobHandler,
    status: JobStatus,
    run_count: u64,
    last_run: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
    next_run: Instant,
}

pub struct Scheduler {
    jobs: Mutex<HashMap<String, JobEntry>>,
    lock: Arc<dyn JobLock>,
    is_leader: Arc<dyn Fn() -> bool + Send + Sync>,
    listeners: broadcast::Sender<JobOutcome>,
}

impl Scheduler {
    pub fn new(lock: Arc<dyn JobLock>, is_leader: Arc<dyn Fn() -> bool + Send + Sync>) -> Arc<Self> {
        let (listeners, _) = broadcast::channel(64);
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            lock,
            is_leader,
            listeners,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.listeners.subscribe()
    }

    pub fn register(&self, config: JobConfig, handler: JobHandler) -> Result<()> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&config.id) {
            return Err(Error::Validation(format!(
                "job '{}' is already registered",
                config.id
            )));
        }
        let delay = if config.run_immediately {
            Duration::ZERO
        } else {
            Duration::from_millis(config.initial_delay_ms.unwrap_or(config.interval_ms))
        };
        let status = if config.enabled {
            JobStatus::Pending
        } else {
            JobStatus::Paused
        };
        jobs.insert(
            config.id.clone(),
            JobEntry {
                next_run: Instant::now() + delay,
                status,
                handler,
                config,
                run_count: 0,
                last_run: None,
                last_error: None,
                consecutive_failures: 0,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, job_id: &str) -> bool {
        self.jobs.lock().remove(job_id).is_some()
    }

    pub fn pause(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(job_id) {
            Some(entry) => {
                entry.status = JobStatus::Paused;
                true
            }
            None => false,
        }
    }

    /// Resume a paused or errored job, clearing the failure streak.
    pub fn resume(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(job_id) {
            Some(entry) => {
                entry.status = JobStatus::Pending;
                entry.consecutive_failures = 0;
                entry.next_run = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Run a job now, regardless of schedule or pause state.
    pub async fn trigger(self: &Arc<Self>, job_id: &str) -> Result<()> {
        if !self.jobs.lock().contains_key(job_id) {
            return Err(Error::NotFound(format!("job '{job_id}'")));
        }
        self.execute(job_id.to_string()).await;
        Ok(())
    }

    pub fn view(&self, job_id: &str) -> Option<JobView> {
        self.jobs.lock().get(job_id).map(entry_view)
    }

    pub fn list(&self) -> Vec<JobView> {
        let mut views: Vec<JobView> = self.jobs.lock().values().map(entry_view).collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// Spawn the tick loop.
    pub fn spawn_loop(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(500));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                scheduler.tick().await;
            }
        })
    }

    /// One scheduler pass: start every due job.
    pub async fn tick(self: &Arc<Self>) {
        let now = Instant::now();
        let due: Vec<String> = self
            .jobs
            .lock()
            .iter_mut()
            .filter_map(|(id, entry)| {
                if entry.status != JobStatus::Pending || entry.next_run > now {
                    return None;
                }
                // Reschedule up front so a long run can't double-fire.
                entry.next_run = now + Duration::from_millis(entry.config.interval_ms);
                Some(id.clone())
            })
            .collect();

        for id in due {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.execute(id).await;
            });
        }
    }

    async fn execute(self: &Arc<Self>, job_id: String) {
        let (handler, leader_only, max_failures) = {
            let mut jobs = self.jobs.lock();
            let Some(entry) = jobs.get_mut(&job_id) else { return };
            if entry.status == JobStatus::Running {
                return;
            }
            (
                entry.handler.clone(),
                entry.config.leader_only,
                entry.config.max_consecutive_failures,
            )
        };

        if leader_only && !(self.is_leader)() {
            tracing::debug!(job_id = %job_id, "not leader, skipping job");
            return;
        }

        // Per-job lock serializes execution cluster-wide.
        let Some(_guard) = self.lock.try_acquire(&job_id).await else {
            tracing::debug!(job_id = %job_id, "job lock held elsewhere, skipping");
            return;
        };

        if let Some(entry) = self.jobs.lock().get_mut(&job_id) {
            entry.status = JobStatus::Running;
        }

        let result = handler().await;
        let finished_at = Utc::now();

        let outcome = {
            let mut jobs = self.jobs.lock();
            let Some(entry) = jobs.get_mut(&job_id) else { return };
            entry.run_count += 1;
            entry.last_run = Some(finished_at);
            match &result {
                Ok(()) => {
                    entry.consecutive_failures = 0;
                    entry.last_error = None;
                    if entry.status == JobStatus::Running {
                        entry.status = JobStatus::Pending;
                    }
                }
                Err(e) => {
                    entry.consecutive_failures += 1;
                    entry.last_error = Some(e.to_string());
                    if entry.consecutive_failures >= max_failures {
                        tracing::error!(
                            job_id = %job_id,
                            failures = entry.consecutive_failures,
                            "job auto-paused after consecutive failures"
                        );
                        entry.status = JobStatus::Error;
                    } else if entry.status == JobStatus::Running {
                        entry.status = JobStatus::Pending;
                    }
                }
            }
            JobOutcome {
                job_id: job_id.clone(),
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                finished_at,
            }
        };

        let _ = self.listeners.send(outcome);
    }
}

fn entry_view(entry: &JobEntry) -> JobView {
    JobView {
        id: entry.config.id.clone(),
        name: entry.config.name.clone(),
        status: entry.status,
        run_count: entry.run_count,
        last_run: entry.last_run,
        last_error: entry.last_error.clone(),
        consecutive_failures: entry.consecutive_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn make_scheduler(leader: bool) -> Arc<Scheduler> {
        let leader_flag = Arc::new(AtomicBool::new(leader));
        Scheduler::new(
            Arc::new(LocalJobLock::new()),
            Arc::new(move || leader_flag.load(Ordering::SeqCst)),
        )
    }

    fn counting_handler(counter: Arc<AtomicU32>, fail: bool) -> JobHandler {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(Error::Other("job failed".into()))
                } else {
                    Ok(())
                }
            })
        })
    }

    #[tokio::test]
    async fn trigger_runs_and_counts() {
        let scheduler = make_scheduler(true);
        let runs = Arc::new(AtomicU32::new(0));
        scheduler
            .register(
                JobConfig::new("j1", "test", 60_000),
                counting_handler(runs.clone(), false),
            )
            .unwrap();

        scheduler.trigger("j1").await.unwrap();
        scheduler.trigger("j1").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let view = scheduler.view("j1").unwrap();
        assert_eq!(view.run_count, 2);
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn consecutive_failures_pause_the_job() {
        let scheduler = make_scheduler(true);
        let runs = Arc::new(AtomicU32::new(0));
        let mut config = JobConfig::new("flaky", "flaky", 60_000);
        config.max_consecutive_failures = 2;
        scheduler
            .register(config, counting_handler(runs.clone(), true))
            .unwrap();

        scheduler.trigger("flaky").await.unwrap();
        assert_eq!(scheduler.view("flaky").unwrap().status, JobStatus::Pending);
        scheduler.trigger("flaky").await.unwrap();
        assert_eq!(scheduler.view("flaky").unwrap().status, JobStatus::Error);
        assert!(scheduler.view("flaky").unwrap().last_error.is_some());

        // Resume clears the streak.
        assert!(scheduler.resume("flaky"));
        assert_eq!(scheduler.view("flaky").unwrap().status, JobStatus::Pending);
        assert_eq!(scheduler.view("flaky").unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn leader_only_jobs_skip_followers() {
        let scheduler = make_scheduler(false);
        let runs = Arc::new(AtomicU32::new(0));
        scheduler
            .register(
                JobConfig::new("singleton", "singleton", 60_000).leader_only(),
                counting_handler(runs.clone(), false),
            )
            .unwrap();

        scheduler.trigger("singleton").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0, "follower must not run");
    }

    #[tokio::test]
    async fn tick_respects_schedule_and_pause() {
        let scheduler = make_scheduler(true);
        let runs = Arc::new(AtomicU32::new(0));
        scheduler
            .register(
                JobConfig::new("fast", "fast", 30).run_immediately(),
                counting_handler(runs.clone(), false),
            )
            .unwrap();

        scheduler.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runs.load(Ordering::SeqCst) >= 1);

        scheduler.pause("fast");
        let before = runs.load(Ordering::SeqCst);
        scheduler.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), before, "paused job must not run");
    }

    #[tokio::test]
    async fn listeners_see_outcomes() {
        let scheduler = make_scheduler(true);
        let mut outcomes = scheduler.subscribe();
        scheduler
            .register(
                JobConfig::new("ok", "ok", 60_000),
                Arc::new(|| Box::pin(async { Ok(()) })),
            )
            .unwrap();
        scheduler.trigger("ok").await.unwrap();

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.job_id, "ok");
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let scheduler = make_scheduler(true);
        scheduler
            .register(
                JobConfig::new("dup", "dup", 1000),
                Arc::new(|| Box::pin(async { Ok(()) })),
            )
            .unwrap();
        assert!(scheduler
            .register(
                JobConfig::new("dup", "dup", 1000),
                Arc::new(|| Box::pin(async { Ok(()) })),
            )
            .is_err());
        assert!(scheduler.unregister("dup"));
        assert!(!scheduler.unregister("dup"));
    }
}
