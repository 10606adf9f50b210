//! Process-wide map of job id to running orchestrator.
//!
//! The registry owns orchestrator lifecycles only. Each loop owns its own
//! snapshot and pool; the only shared mutable state is the handle map below.

use crate::control::{channel, ControlHandle, Directive};
use crate::error::{EngineError, Result};
use crate::orchestrator::{CleanupReport, Deps, JobOrchestrator};
use cadence_core::activity::{ActivityRecord, ErrorKind};
use cadence_core::client_pool::PlatformConnector;
use cadence_core::clock::Clock;
use cadence_core::config::{JobConfig, ServiceConfig, WarnLevel};
use cadence_core::content::ContentGenerator;
use cadence_core::paths;
use cadence_core::snapshot::{JobFilter, JobSnapshot, JobSummary};
use cadence_core::store::StateStore;
use cadence_core::types::JobStatus;
use cadence_core::CadenceError;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

struct RunningJob {
    control: ControlHandle,
    /// Taken by whoever stops the loop. The entry stays in the map until that
    /// caller has seen the loop exit, so the id cannot be launched twice.
    task: Option<JoinHandle<JobStatus>>,
    /// Distinguishes a restarted loop from the one it replaced.
    generation: u64,
}

impl RunningJob {
    fn is_stopping(&self) -> bool {
        self.task.is_none()
    }
}

struct Inner {
    jobs: Mutex<HashMap<String, RunningJob>>,
    deps: Deps,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Inner>,
}

impl JobRegistry {
    pub fn new(
        store: Arc<dyn StateStore>,
        connector: Arc<dyn PlatformConnector>,
        content: Arc<dyn ContentGenerator>,
        clock: Arc<dyn Clock>,
        service: ServiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                deps: Deps {
                    store,
                    connector,
                    content,
                    clock,
                    service,
                },
                generation: AtomicU64::new(1),
            }),
        }
    }

    fn deps(&self) -> &Deps {
        &self.inner.deps
    }

    // -----------------------------------------------------------------------
    // Blocking store access
    // -----------------------------------------------------------------------

    async fn load(&self, id: &str) -> Result<JobSnapshot> {
        paths::validate_job_id(id)?;
        let store = Arc::clone(&self.deps().store);
        let id = id.to_string();
        Ok(tokio::task::spawn_blocking(move || store.load(&id)).await??)
    }

    async fn save(&self, snapshot: JobSnapshot) -> Result<()> {
        let store = Arc::clone(&self.deps().store);
        Ok(tokio::task::spawn_blocking(move || store.save(&snapshot)).await??)
    }

    async fn is_running(&self, id: &str) -> bool {
        self.inner.jobs.lock().await.contains_key(id)
    }

    /// Record `message` and mark the job `errored` in the store.
    async fn mark_errored(&self, mut snapshot: JobSnapshot, kind: ErrorKind, message: String) -> Result<()> {
        let now = self.deps().clock.now();
        snapshot.record_error(kind, message, None, now);
        snapshot.set_status(JobStatus::Errored, now)?;
        self.save(snapshot).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Validate `config`, persist a new job and start its loop.
    pub async fn start(&self, config: JobConfig) -> Result<String> {
        for w in config.ensure_valid()? {
            match w.level {
                WarnLevel::Error => error!("{}", w.message),
                WarnLevel::Warning => warn!("{}", w.message),
            }
        }

        let id = loop {
            let candidate = paths::new_job_id();
            match self.load(&candidate).await {
                Err(EngineError::Core(CadenceError::JobNotFound(_))) => break candidate,
                Ok(_) | Err(EngineError::Core(CadenceError::CorruptSnapshot { .. })) => continue,
                Err(e) => return Err(e),
            }
        };

        let snapshot = JobSnapshot::new(id.clone(), config, self.deps().clock.now());
        info!(job = %id, platform = %snapshot.platform_kind(), name = %snapshot.display_name(), "starting job");
        self.save(snapshot.clone()).await?;
        self.spawn(snapshot, Directive::Run).await?;
        Ok(id)
    }

    /// Launch a loop for a job read back from the store. A config that no
    /// longer validates marks the job `errored` instead.
    async fn relaunch(&self, snapshot: JobSnapshot, directive: Directive) -> Result<()> {
        if let Err(e) = snapshot.config.ensure_valid() {
            warn!(job = %snapshot.id, error = %e, "stored config is invalid; marking job errored");
            self.mark_errored(snapshot, ErrorKind::Config, e.to_string()).await?;
            return Err(e.into());
        }
        self.spawn(snapshot, directive).await
    }

    /// Hand `snapshot` to a fresh orchestrator loop.
    async fn spawn(&self, snapshot: JobSnapshot, directive: Directive) -> Result<()> {
        let id = snapshot.id.clone();
        let mut jobs = self.inner.jobs.lock().await;
        if jobs.contains_key(&id) {
            warn!(job = %id, "job already has a running loop");
            return Err(EngineError::AlreadyRunning(id));
        }

        let (control, listener) = channel(directive);
        let orchestrator = JobOrchestrator::new(snapshot, self.deps().clone(), listener);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            let status = match AssertUnwindSafe(orchestrator.run()).catch_unwind().await {
                Ok(status) => status,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(job = %task_id, panic = %message, "orchestrator panicked");
                    record_crash(&inner.deps, &task_id, message).await
                }
            };
            // A stopping entry is released by the caller that stopped it.
            let mut jobs = inner.jobs.lock().await;
            if jobs
                .get(&task_id)
                .is_some_and(|r| r.generation == generation && !r.is_stopping())
            {
                jobs.remove(&task_id);
            }
            info!(job = %task_id, status = %status, "orchestrator loop exited");
            status
        });
        jobs.insert(
            id,
            RunningJob {
                control,
                task: Some(task),
                generation,
            },
        );
        Ok(())
    }

    /// Stop a job. A live loop finishes its in-flight save first; a loop that
    /// does not exit within the stop timeout is aborted.
    pub async fn stop(&self, id: &str) -> Result<()> {
        match self.begin_stop(id).await? {
            Some((task, generation)) => {
                info!(job = %id, "stopping job");
                self.await_exit(id, task).await;
                let result = self.mark_stopped(id).await;
                self.release(id, generation).await;
                result
            }
            None => {
                let mut snapshot = self.load(id).await?;
                ensure_live(&snapshot)?;
                snapshot.set_status(JobStatus::Stopped, self.deps().clock.now())?;
                self.save(snapshot).await?;
                info!(job = %id, "stopped job with no running loop");
                Ok(())
            }
        }
    }

    /// Signal a live loop to stop and take its task, leaving the entry in the
    /// map. `None` means the job has no loop.
    async fn begin_stop(&self, id: &str) -> Result<Option<(JoinHandle<JobStatus>, u64)>> {
        let mut jobs = self.inner.jobs.lock().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };
        let Some(task) = job.task.take() else {
            return Err(EngineError::Stopping(id.to_string()));
        };
        job.control.stop();
        Ok(Some((task, job.generation)))
    }

    /// Drop the entry for a stopped loop, unless it has been replaced.
    async fn release(&self, id: &str, generation: u64) {
        let mut jobs = self.inner.jobs.lock().await;
        if jobs.get(id).is_some_and(|r| r.generation == generation) {
            jobs.remove(id);
        }
    }

    /// An aborted loop could not persist its final status.
    async fn mark_stopped(&self, id: &str) -> Result<()> {
        let mut snapshot = self.load(id).await?;
        if !snapshot.status.is_terminal() {
            snapshot.set_status(JobStatus::Stopped, self.deps().clock.now())?;
            self.save(snapshot).await?;
        }
        Ok(())
    }

    /// The loop's control handle must still be in the map while this runs,
    /// or the loop would read a detach instead of the stop.
    async fn await_exit(&self, id: &str, task: JoinHandle<JobStatus>) -> Option<JobStatus> {
        let abort = task.abort_handle();
        match tokio::time::timeout(self.deps().service.stop_timeout(), task).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                error!(job = %id, error = %e, "orchestrator task failed");
                None
            }
            Err(_) => {
                warn!(job = %id, "orchestrator did not exit in time; aborting");
                abort.abort();
                None
            }
        }
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        {
            let jobs = self.inner.jobs.lock().await;
            if let Some(job) = jobs.get(id) {
                if job.is_stopping() {
                    return Err(EngineError::Stopping(id.to_string()));
                }
                job.control.pause();
                info!(job = %id, "pause requested");
                return Ok(());
            }
        }
        let mut snapshot = self.load(id).await?;
        ensure_live(&snapshot)?;
        snapshot.set_status(JobStatus::Paused, self.deps().clock.now())?;
        self.save(snapshot).await
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        {
            let jobs = self.inner.jobs.lock().await;
            if let Some(job) = jobs.get(id) {
                if job.is_stopping() {
                    return Err(EngineError::Stopping(id.to_string()));
                }
                job.control.resume();
                info!(job = %id, "resume requested");
                return Ok(());
            }
        }
        let snapshot = self.load(id).await?;
        ensure_live(&snapshot)?;
        info!(job = %id, "resuming job without a loop");
        self.relaunch(snapshot, Directive::Run).await
    }

    /// Wake a running loop and force one decision.
    pub async fn generate_now(&self, id: &str) -> Result<()> {
        {
            let jobs = self.inner.jobs.lock().await;
            if let Some(job) = jobs.get(id) {
                if job.is_stopping() {
                    return Err(EngineError::Stopping(id.to_string()));
                }
                if job.control.directive() != Directive::Run {
                    return Err(not_terminal_err(id, JobStatus::Paused, "resume it first").into());
                }
                job.control.act_now();
                info!(job = %id, "generate-now requested");
                return Ok(());
            }
        }
        // Distinguish an unknown id from a job that simply is not running.
        self.load(id).await?;
        Err(EngineError::NotRunning(id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The last persisted snapshot. Running loops save after every activity.
    pub async fn get(&self, id: &str) -> Result<JobSnapshot> {
        self.load(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobSummary>> {
        let store = Arc::clone(&self.deps().store);
        let filter = filter.clone();
        Ok(tokio::task::spawn_blocking(move || store.list(&filter)).await??)
    }

    /// A page of the activity log, most recent first.
    pub async fn activity(&self, id: &str, offset: usize, limit: usize) -> Result<Vec<ActivityRecord>> {
        let snapshot = self.load(id).await?;
        Ok(snapshot.activity_log.page(offset, limit))
    }

    pub async fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.jobs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // -----------------------------------------------------------------------
    // Removal and cleanup
    // -----------------------------------------------------------------------

    /// Stop the loop if there is one, then remove the job's snapshot.
    pub async fn delete(&self, id: &str) -> Result<()> {
        paths::validate_job_id(id)?;
        let claimed = match self.begin_stop(id).await? {
            Some((task, generation)) => {
                self.await_exit(id, task).await;
                Some(generation)
            }
            None => None,
        };
        let result = self.remove_snapshot(id).await;
        if let Some(generation) = claimed {
            self.release(id, generation).await;
        }
        result?;
        info!(job = %id, "job deleted");
        Ok(())
    }

    async fn remove_snapshot(&self, id: &str) -> Result<()> {
        let store = Arc::clone(&self.deps().store);
        let key = id.to_string();
        Ok(tokio::task::spawn_blocking(move || store.delete(&key)).await??)
    }

    /// Delete everything the job created on the platform. The job must not
    /// have a running loop.
    pub async fn cleanup(&self, id: &str) -> Result<CleanupReport> {
        if self.is_running(id).await {
            return Err(EngineError::JobRunning(id.to_string()));
        }
        let snapshot = self.load(id).await?;
        let (_control, listener) = channel(Directive::Run);
        let mut orchestrator = JobOrchestrator::new(snapshot, self.deps().clone(), listener);
        Ok(orchestrator.cleanup().await)
    }

    // -----------------------------------------------------------------------
    // Process lifecycle
    // -----------------------------------------------------------------------

    /// Relaunch loops for every persisted job that was running or paused.
    /// Returns how many loops were started.
    pub async fn restore(&self) -> Result<usize> {
        let summaries = self.list(&JobFilter::default()).await?;
        let mut restored = 0;
        for summary in summaries {
            let directive = match summary.status {
                JobStatus::Running => Directive::Run,
                JobStatus::Paused => Directive::Pause,
                _ => continue,
            };
            if self.is_running(&summary.id).await {
                continue;
            }
            let snapshot = match self.load(&summary.id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(job = %summary.id, error = %e, "skipping job that failed to load");
                    continue;
                }
            };
            match self.relaunch(snapshot, directive).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(job = %summary.id, error = %e, "could not restore job"),
            }
        }
        info!(restored, "restored persisted jobs");
        Ok(restored)
    }

    /// Detach every loop without touching persisted statuses, so the next
    /// process start restores them.
    /// Loops that are already stopping are left to the caller stopping them.
    pub async fn shutdown(&self) {
        let jobs: Vec<(String, RunningJob)> = {
            let mut map = self.inner.jobs.lock().await;
            let ids: Vec<String> = map
                .iter()
                .filter(|(_, job)| !job.is_stopping())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| map.remove_entry(&id)).collect()
        };
        info!(jobs = jobs.len(), "shutting down registry");
        for (_, job) in &jobs {
            job.control.detach();
        }
        for (id, job) in jobs {
            // Keep the handle alive so the loop reads the detach.
            let RunningJob { control, task, .. } = job;
            if let Some(task) = task {
                self.await_exit(&id, task).await;
            }
            drop(control);
        }
    }
}

/// Mark a job whose loop panicked as `errored`. Returns the stored status.
async fn record_crash(deps: &Deps, id: &str, message: String) -> JobStatus {
    let store = Arc::clone(&deps.store);
    let now = deps.clock.now();
    let key = id.to_string();
    let result = tokio::task::spawn_blocking(move || -> cadence_core::Result<JobStatus> {
        let mut snapshot = store.load(&key)?;
        if !snapshot.status.is_terminal() {
            snapshot.record_error(
                ErrorKind::Unexpected,
                format!("orchestrator panicked: {message}"),
                None,
                now,
            );
            snapshot.set_status(JobStatus::Errored, now)?;
            store.save(&snapshot)?;
        }
        Ok(snapshot.status)
    })
    .await;
    match result {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            error!(job = %id, error = %e, "could not record crashed job");
            JobStatus::Errored
        }
        Err(e) => {
            error!(job = %id, error = %e, "crash bookkeeping task failed");
            JobStatus::Errored
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn not_terminal_err(id: &str, from: JobStatus, hint: &str) -> CadenceError {
    CadenceError::InvalidTransition {
        from: from.to_string(),
        to: JobStatus::Running.to_string(),
        reason: format!("job {id} is {from}; {hint}"),
    }
}

/// Control requests against a finished job are rejected.
fn ensure_live(snapshot: &JobSnapshot) -> std::result::Result<(), CadenceError> {
    if snapshot.status.is_terminal() {
        return Err(not_terminal_err(&snapshot.id, snapshot.status, "it cannot change again"));
    }
    Ok(())
}
