#![forbid(unsafe_code)]

//! In-process job registry.
//!
//! Every download request becomes a [`Job`] whose status only ever moves
//! forward: `pending -> in_progress -> completed | failed`. Terminal jobs are
//! frozen; late updates from a download task that lost a race with a cancel
//! are rejected instead of resurrecting the job.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::JobStore;
use crate::youtube::VideoMetadata;

pub const CANCELLED_BY_USER: &str = "Job cancelled by user";
pub const INTERRUPTED_BY_RESTART: &str = "Interrupted by server restart";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Transition table. Re-entering the same non-terminal state is allowed so
    /// messages can be refreshed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            Self::Pending => true,
            Self::InProgress => next != Self::Pending,
            Self::Completed | Self::Failed => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub url: String,
    #[serde(default)]
    pub metadata: Option<VideoMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub progress: Option<f64>,
    pub message: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub error_details: Option<String>,
}

/// Changes applied together with a status transition. `None` fields keep the
/// current value.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub message: Option<String>,
    pub progress: Option<f64>,
    pub file_path: Option<String>,
    pub error_details: Option<String>,
}

impl JobUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            message: None,
            progress: None,
            file_path: None,
            error_details: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn error_details(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Job not found")]
    NotFound(String),
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("Job already finished with status {0}")]
    AlreadyFinished(&'static str),
}

#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<JobRegistryInner>,
}

struct JobRegistryInner {
    jobs: Mutex<HashMap<String, Job>>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
    store: Option<JobStore>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl JobRegistry {
    pub fn in_memory() -> Self {
        Self::build(HashMap::new(), None)
    }

    /// Opens a registry backed by `store`. Jobs a previous process left
    /// unfinished have no worker anymore, so they are failed on load.
    pub async fn with_store(store: JobStore) -> Result<Self> {
        let mut jobs = HashMap::new();
        for mut job in store.list_jobs().await? {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.message = "Download failed".to_string();
                job.error_details = Some(INTERRUPTED_BY_RESTART.to_string());
                job.updated_at = Utc::now();
                store.upsert_job(&job).await?;
                warn!(job_id = %job.id, "marking interrupted job as failed");
            }
            jobs.insert(job.id.clone(), job);
        }
        info!(count = jobs.len(), "loaded persisted jobs");
        Ok(Self::build(jobs, Some(store)))
    }

    fn build(jobs: HashMap<String, Job>, store: Option<JobStore>) -> Self {
        Self {
            inner: Arc::new(JobRegistryInner {
                jobs: Mutex::new(jobs),
                cancellations: Mutex::new(HashMap::new()),
                store,
            }),
        }
    }

    pub fn generate_job_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub async fn create(&self, url: impl Into<String>, metadata: Option<VideoMetadata>) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: Self::generate_job_id(),
            status: JobStatus::Pending,
            url: url.into(),
            metadata,
            created_at: now,
            updated_at: now,
            progress: None,
            message: "Download started successfully".to_string(),
            file_path: None,
            error_details: None,
        };

        // Register only once the record is durable.
        self.persist(&job).await?;
        self.inner
            .cancellations
            .lock()
            .insert(job.id.clone(), CancellationToken::new());
        self.inner.jobs.lock().insert(job.id.clone(), job.clone());
        info!(job_id = %job.id, url = %job.url, "job created");
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.inner.jobs.lock().get(id).cloned()
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancellation_token(&self, id: &str) -> Option<CancellationToken> {
        self.inner.cancellations.lock().get(id).cloned()
    }

    pub async fn transition(&self, id: &str, update: JobUpdate) -> Result<Job, JobError> {
        let job = {
            let mut jobs = self.inner.jobs.lock();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            if !job.status.can_transition_to(update.status) {
                return Err(JobError::InvalidTransition {
                    id: id.to_string(),
                    from: job.status.as_str(),
                    to: update.status.as_str(),
                });
            }
            apply_update(job, update);
            job.clone()
        };

        if job.status.is_terminal() {
            self.inner.cancellations.lock().remove(id);
        }
        self.persist_logged(&job).await;
        Ok(job)
    }

    /// Progress ticks stay in memory; only transitions are persisted.
    pub fn set_progress(&self, id: &str, progress: f64) {
        if let Some(job) = self.inner.jobs.lock().get_mut(id)
            && !job.status.is_terminal()
        {
            job.progress = Some(progress.clamp(0.0, 100.0));
            job.updated_at = Utc::now();
        }
    }

    /// Fails a pending or running job and stops its worker.
    pub async fn cancel(&self, id: &str) -> Result<Job, JobError> {
        let job = {
            let mut jobs = self.inner.jobs.lock();
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            if job.status.is_terminal() {
                return Err(JobError::AlreadyFinished(job.status.as_str()));
            }
            apply_update(
                job,
                JobUpdate::new(JobStatus::Failed)
                    .message("Job cancelled")
                    .error_details(CANCELLED_BY_USER),
            );
            job.clone()
        };

        if let Some(token) = self.inner.cancellations.lock().remove(id) {
            token.cancel();
        }
        self.persist_logged(&job).await;
        info!(job_id = %id, "job cancelled");
        Ok(job)
    }

    async fn persist(&self, job: &Job) -> Result<()> {
        if let Some(store) = &self.inner.store {
            store.upsert_job(job).await?;
        }
        Ok(())
    }

    async fn persist_logged(&self, job: &Job) {
        if let Err(err) = self.persist(job).await {
            warn!(job_id = %job.id, "failed to persist job: {err:#}");
        }
    }
}

fn apply_update(job: &mut Job, update: JobUpdate) {
    job.status = update.status;
    if let Some(message) = update.message {
        job.message = message;
    }
    if let Some(progress) = update.progress {
        job.progress = Some(progress.clamp(0.0, 100.0));
    }
    if let Some(path) = update.file_path {
        job.file_path = Some(path);
    }
    if let Some(details) = update.error_details {
        job.error_details = Some(details);
    }
    job.updated_at = Utc::now();
}
