//! Durable, priority-ordered job queue and its worker pools.
//!
//! Entries live in the repository (`queue_entries` in PostgreSQL), so
//! enqueued work survives restarts. [`JobQueue`] owns the worker loops;
//! [`Enqueuer`] is the cheap handle every producer holds.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex, Notify},
    task::JoinHandle,
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::config::QueueSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{string_enum, JobStatus, NewQueueEntry, QueueEntry, SyncStatus};
use crate::repository::{Repository, RepositoryResult};
use crate::workers::{Dispatcher, JobExecution};

mod kind;

pub use kind::{DownstreamTask, JobKind};

string_enum! {
    pub enum QueueName {
        Extraction => "extraction",
        Indexing => "indexing",
        Storage => "storage",
        Downstream => "downstream",
    }
}

impl QueueName {
    fn worker_count(self, settings: &QueueSettings) -> usize {
        match self {
            QueueName::Extraction => settings.extraction_workers,
            QueueName::Indexing => settings.index_workers,
            QueueName::Storage => settings.storage_workers,
            QueueName::Downstream => settings.downstream_workers,
        }
    }
}

#[derive(Clone)]
pub struct Enqueuer {
    repo: Arc<dyn Repository>,
    signal: Arc<Notify>,
    max_attempts: i32,
}

impl Enqueuer {
    pub fn new(repo: Arc<dyn Repository>, max_attempts: i32) -> Self {
        Self {
            repo,
            signal: Arc::new(Notify::new()),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Durably records `job`. Returns `None` when an identical job is already
    /// waiting in the queue.
    pub async fn enqueue(&self, job: JobKind, priority: i32) -> PipelineResult<Option<QueueEntry>> {
        self.enqueue_after(job, priority, Duration::ZERO).await
    }

    pub async fn enqueue_default(&self, job: JobKind) -> PipelineResult<Option<QueueEntry>> {
        let priority = job.default_priority();
        self.enqueue(job, priority).await
    }

    pub async fn enqueue_after(
        &self,
        job: JobKind,
        priority: i32,
        delay: Duration,
    ) -> PipelineResult<Option<QueueEntry>> {
        let payload = serde_json::to_value(&job).map_err(|err| {
            PipelineError::Configuration(format!("job payload is not serializable: {err}"))
        })?;
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let entry = NewQueueEntry {
            queue: job.queue().to_string(),
            payload,
            priority,
            max_attempts: self.max_attempts,
            run_after: Utc::now() + delay,
            dedupe_key: Some(job.dedupe_key()),
        };

        let stored = self.repo.enqueue(entry).await?;
        match &stored {
            Some(entry) => {
                info!(entry = %entry, job = job.label(), priority, "job enqueued");
                self.signal.notify_waiters();
            }
            None => info!(job = job.label(), key = %job.dedupe_key(), "job already queued"),
        }
        Ok(stored)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub queue: QueueName,
    pub pending: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub running: bool,
    pub queues: Vec<QueueDepth>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub requeued_entries: usize,
    pub reset_extraction_jobs: usize,
    pub enqueued_extraction_jobs: usize,
    pub reset_sync_jobs: usize,
    pub enqueued_sync_jobs: usize,
    pub enqueued_index_jobs: usize,
}

/// Closes the gap between "job recorded" and "job scheduled".
#[derive(Clone)]
struct Recovery {
    repo: Arc<dyn Repository>,
    enqueuer: Enqueuer,
    settings: QueueSettings,
    index_max_retries: i32,
    /// A running sync is only abandoned once its own deadline has passed too.
    sync_stale_after: Duration,
}

impl Recovery {
    async fn sweep(&self) -> PipelineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let stale_after = chrono::Duration::from_std(self.settings.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let cutoff = Utc::now() - stale_after;
        let batch = self.settings.recovery_batch_size;

        report.requeued_entries = self.repo.requeue_stale_entries(cutoff).await?;

        for mut job in self.repo.list_stale_extraction_jobs(cutoff).await? {
            let abandoned = PipelineError::TransientIo("extraction attempt abandoned".into());
            if job.fail(&abandoned).is_err() {
                continue;
            }
            match self
                .repo
                .update_extraction_job(&job, JobStatus::Processing)
                .await
            {
                Ok(()) => {
                    warn!(job_id = %job.id, file_id = %job.file_id, status = %job.status, "reset stale extraction job");
                    report.reset_extraction_jobs += 1;
                }
                Err(err) => warn!(job_id = %job.id, error = %err, "could not reset stale extraction job"),
            }
        }

        for job in self.repo.list_extraction_jobs(JobStatus::Pending, batch).await? {
            let kind = JobKind::Extraction {
                extraction_job_id: job.id,
                file_id: job.file_id,
                method: job.method,
                priority: job.priority,
            };
            if self.enqueuer.enqueue(kind, job.priority).await?.is_some() {
                report.enqueued_extraction_jobs += 1;
            }
        }

        let sync_stale_after = chrono::Duration::from_std(self.sync_stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        for mut job in self
            .repo
            .list_stale_sync_jobs(Utc::now() - sync_stale_after)
            .await?
        {
            job.status = SyncStatus::Pending;
            job.started_at = None;
            job.error_message = Some("storage sync abandoned".to_string());
            match self.repo.update_sync_job(&job).await {
                Ok(()) => {
                    warn!(sync_job_id = %job.id, organization_id = %job.organization_id, "reset stale storage sync");
                    report.reset_sync_jobs += 1;
                }
                Err(err) => warn!(sync_job_id = %job.id, error = %err, "could not reset stale storage sync"),
            }
        }

        for job in self.repo.list_pending_sync_jobs(batch).await? {
            let kind = JobKind::StorageSync {
                sync_job_id: job.id,
            };
            if self.enqueuer.enqueue_default(kind).await?.is_some() {
                report.enqueued_sync_jobs += 1;
            }
        }

        let failed = self
            .repo
            .list_failed_index_statuses(self.index_max_retries, batch)
            .await?;
        let interrupted = self.repo.list_stale_indexing_statuses(cutoff, batch).await?;
        for status in failed.into_iter().chain(interrupted) {
            let kind = JobKind::IndexFile {
                file_id: status.file_id,
            };
            if self.enqueuer.enqueue_default(kind).await?.is_some() {
                report.enqueued_index_jobs += 1;
            }
        }

        if report != RecoveryReport::default() {
            info!(?report, "recovery sweep rescheduled work");
        }
        Ok(report)
    }
}

struct RunningPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Explicitly constructed scheduler with its own lifecycle.
pub struct JobQueue {
    repo: Arc<dyn Repository>,
    dispatcher: Arc<Dispatcher>,
    recovery: Recovery,
    settings: QueueSettings,
    running: Mutex<Option<RunningPool>>,
}

impl JobQueue {
    pub fn new(repo: Arc<dyn Repository>, dispatcher: Arc<Dispatcher>, settings: QueueSettings) -> Self {
        let recovery = Recovery {
            repo: repo.clone(),
            enqueuer: dispatcher.enqueuer().clone(),
            settings: settings.clone(),
            index_max_retries: dispatcher.settings().index_max_retries,
            sync_stale_after: settings.stale_after.max(dispatcher.settings().sync_timeout),
        };
        Self {
            repo,
            dispatcher,
            recovery,
            settings,
            running: Mutex::new(None),
        }
    }

    pub fn enqueuer(&self) -> &Enqueuer {
        self.dispatcher.enqueuer()
    }

    /// Spawns the worker loops and the periodic recovery sweep. Returns
    /// `false` when the queue was already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        for queue in QueueName::ALL.iter().copied() {
            for slot in 0..queue.worker_count(&self.settings) {
                let worker = QueueWorker {
                    queue,
                    slot,
                    repo: self.repo.clone(),
                    dispatcher: self.dispatcher.clone(),
                    signal: self.enqueuer().signal.clone(),
                    poll_interval: self.settings.poll_interval,
                };
                handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
            }
        }

        let recovery = self.recovery.clone();
        let every = self.settings.recovery_interval;
        let mut recovery_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(every.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = recovery.sweep().await {
                            error!(error = %err, "recovery sweep failed");
                        }
                    }
                    _ = recovery_shutdown.changed() => break,
                }
            }
        }));

        info!(workers = handles.len() - 1, "job queue started");
        *running = Some(RunningPool { shutdown, handles });
        true
    }

    /// Signals every loop to stop and waits for in-flight jobs to finish.
    pub async fn stop(&self) -> bool {
        let Some(pool) = self.running.lock().await.take() else {
            return false;
        };
        let _ = pool.shutdown.send(true);
        self.enqueuer().signal.notify_waiters();
        for result in join_all(pool.handles).await {
            if let Err(err) = result {
                error!(error = %err, "queue worker ended abnormally");
            }
        }
        info!("job queue stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn process_pending_database_jobs(&self) -> PipelineResult<RecoveryReport> {
        self.recovery.sweep().await
    }

    pub async fn health_check(&self) -> PipelineResult<QueueHealth> {
        let mut queues = Vec::with_capacity(QueueName::ALL.len());
        for queue in QueueName::ALL.iter().copied() {
            let pending = self.repo.queued_count(queue.as_str()).await?;
            queues.push(QueueDepth { queue, pending });
        }
        Ok(QueueHealth {
            running: self.is_running().await,
            queues,
        })
    }

    /// Processes at most one ready entry of `queue` on the calling task.
    pub async fn run_once(&self, queue: QueueName) -> PipelineResult<bool> {
        Ok(process_next(self.repo.as_ref(), &self.dispatcher, queue).await?)
    }

    /// Runs ready entries of every queue on the calling task until none are
    /// left. Entries scheduled for later are not waited for.
    pub async fn drain(&self) -> PipelineResult<usize> {
        let mut processed = 0;
        loop {
            let mut progressed = false;
            for queue in QueueName::ALL.iter().copied() {
                while self.run_once(queue).await? {
                    processed += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(processed);
            }
        }
    }
}

struct QueueWorker {
    queue: QueueName,
    slot: usize,
    repo: Arc<dyn Repository>,
    dispatcher: Arc<Dispatcher>,
    signal: Arc<Notify>,
    poll_interval: Duration,
}

impl QueueWorker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.queue, slot = self.slot, "queue worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match process_next(self.repo.as_ref(), &self.dispatcher, self.queue).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    error!(queue = %self.queue, error = %err, "queue worker tick failed");
                }
            }
            tokio::select! {
                _ = self.signal.notified() => {}
                _ = sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(queue = %self.queue, slot = self.slot, "queue worker stopped");
    }
}

async fn process_next(
    repo: &dyn Repository,
    dispatcher: &Dispatcher,
    queue: QueueName,
) -> RepositoryResult<bool> {
    let Some(entry) = repo.reserve_entry(queue.as_str()).await? else {
        return Ok(false);
    };

    let started = Instant::now();
    let execution = dispatcher.dispatch(&entry).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match execution {
        JobExecution::Success => {
            repo.mark_entry_succeeded(entry.id).await?;
            info!(entry = %entry, attempts = entry.attempts, elapsed_ms, "job completed successfully");
        }
        JobExecution::Retry { delay, error } if entry.attempts < entry.max_attempts => {
            warn!(entry = %entry, attempts = entry.attempts, %error, "job will retry");
            let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(30));
            repo.retry_entry_after(entry.id, Utc::now() + delay, &error)
                .await?;
        }
        JobExecution::Retry { error, .. } => {
            error!(entry = %entry, attempts = entry.attempts, %error, "job exhausted its attempts");
            repo.mark_entry_failed(entry.id, &error).await?;
        }
        JobExecution::Failed { error } => {
            error!(entry = %entry, %error, "job failed");
            repo.mark_entry_failed(entry.id, &error).await?;
        }
    }
    Ok(true)
}
