#![forbid(unsafe_code)]

//! Background download workers.
//!
//! `DownloadManager::start` registers a job and hands the actual transfer to a
//! tokio task. The task only talks to the job through the registry, so a cancel
//! that lands first always wins.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jobs::{Job, JobError, JobRegistry, JobStatus, JobUpdate};
use crate::youtube::{FetchError, ProgressSink, VideoFetcher, VideoMetadata, YouTubeService};

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<DownloadManagerInner>,
}

struct DownloadManagerInner {
    registry: JobRegistry,
    youtube: Arc<YouTubeService>,
}

impl DownloadManager {
    pub fn new(registry: JobRegistry, youtube: Arc<YouTubeService>) -> Self {
        Self {
            inner: Arc::new(DownloadManagerInner { registry, youtube }),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    /// Creates a pending job for `url` and starts downloading it in the
    /// background. The fetcher is picked now, so toggling test mode later
    /// does not affect jobs already running.
    pub async fn start(&self, url: &str, metadata: Option<VideoMetadata>) -> Result<Job> {
        let job = self.inner.registry.create(url, metadata).await?;
        let cancel = self
            .inner
            .registry
            .cancellation_token(&job.id)
            .unwrap_or_default();
        let fetcher = self.inner.youtube.fetcher();

        let registry = self.inner.registry.clone();
        let job_id = job.id.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            run_download(registry, fetcher, job_id, url, cancel).await;
        });

        Ok(job)
    }
}

async fn run_download(
    registry: JobRegistry,
    fetcher: Arc<dyn VideoFetcher>,
    job_id: String,
    url: String,
    cancel: CancellationToken,
) {
    let started = registry
        .transition(
            &job_id,
            JobUpdate::new(JobStatus::InProgress)
                .message("Downloading video")
                .progress(0.0),
        )
        .await;
    if let Err(err) = started {
        debug!(job_id = %job_id, "download not started: {err}");
        return;
    }

    let sink: ProgressSink = {
        let registry = registry.clone();
        let job_id = job_id.clone();
        Arc::new(move |pct| registry.set_progress(&job_id, pct))
    };

    let update = match fetcher.download(&url, sink, cancel.clone()).await {
        Ok(path) => {
            info!(job_id = %job_id, path = %path.display(), "download completed");
            JobUpdate::new(JobStatus::Completed)
                .message("Download completed successfully")
                .progress(100.0)
                .file_path(path.to_string_lossy())
        }
        Err(FetchError::Cancelled) => {
            debug!(job_id = %job_id, "download stopped after cancellation");
            return;
        }
        Err(_) if cancel.is_cancelled() => return,
        Err(err) => {
            warn!(job_id = %job_id, "download failed: {err}");
            JobUpdate::new(JobStatus::Failed)
                .message("Download failed")
                .error_details(format!("Error downloading video: {err}"))
        }
    };

    match registry.transition(&job_id, update).await {
        Ok(_) => {}
        Err(JobError::InvalidTransition { from, .. }) => {
            debug!(job_id = %job_id, from, "job finished elsewhere; result dropped");
        }
        Err(err) => warn!(job_id = %job_id, "could not record download result: {err}"),
    }
}
