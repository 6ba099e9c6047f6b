//! Job bookkeeping for background exports: the status table, the per-job
//! event stream and the service that accepts requests.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::encoder::EncoderFactory;
use super::{ExportRenderer, ExportRequest};
use crate::config::ExportSettings;
use crate::render::VisualRenderer;
use crate::{BeatframeError, Result};

/// Opaque export job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Rendering,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Point-in-time view of one job, as returned by the status boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub percent: u8,
    pub message: String,
    pub result_location: Option<String>,
    pub error: Option<String>,
}

/// Push notifications for one job. `Complete` and `Error` are terminal and
/// mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobEvent {
    Status { status: JobStatus, message: String },
    Progress { percent: u8, message: String },
    Complete { result_location: String },
    Error { error: String },
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// Receives `{percent, message}` updates from a running export.
pub trait ProgressSink {
    fn report(&mut self, percent: u8, message: &str);
}

/// Shared job-status table keyed by job id.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    inner: Arc<Mutex<HashMap<JobId, JobSnapshot>>>,
}

impl JobTable {
    pub fn get(&self, id: JobId) -> Option<JobSnapshot> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.inner.lock().keys().copied().collect()
    }

    fn insert(&self, snapshot: JobSnapshot) {
        self.inner.lock().insert(snapshot.id, snapshot);
    }

    fn update(&self, id: JobId, apply: impl FnOnce(&mut JobSnapshot)) {
        if let Some(job) = self.inner.lock().get_mut(&id) {
            apply(job);
        }
    }

    fn remove(&self, id: JobId) -> Option<JobSnapshot> {
        self.inner.lock().remove(&id)
    }
}

/// The only writer of a job's slot. Keeps `percent` monotonic and lets
/// exactly one terminal event through.
pub struct JobRecorder {
    id: JobId,
    table: JobTable,
    events: Sender<JobEvent>,
    status: JobStatus,
    percent: Option<u8>,
}

impl JobRecorder {
    pub fn new(id: JobId, table: JobTable, events: Sender<JobEvent>) -> Self {
        let message = "export accepted".to_string();
        table.insert(JobSnapshot {
            id,
            status: JobStatus::Starting,
            percent: 0,
            message: message.clone(),
            result_location: None,
            error: None,
        });
        let _ = events.send(JobEvent::Status {
            status: JobStatus::Starting,
            message,
        });
        Self {
            id,
            table,
            events,
            status: JobStatus::Starting,
            percent: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn complete(&mut self, location: &Path) {
        if self.status.is_terminal() {
            return;
        }
        let location = location.display().to_string();
        self.status = JobStatus::Complete;
        self.percent = Some(100);
        self.table.update(self.id, |job| {
            job.status = JobStatus::Complete;
            job.percent = 100;
            job.message = "export complete".to_string();
            job.result_location = Some(location.clone());
        });
        tracing::info!(job = %self.id, location = %location, "export complete");
        let _ = self.events.send(JobEvent::Complete {
            result_location: location,
        });
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let error = error.into();
        self.status = JobStatus::Failed;
        self.table.update(self.id, |job| {
            job.status = JobStatus::Failed;
            job.message = "export failed".to_string();
            job.error = Some(error.clone());
        });
        tracing::error!(job = %self.id, error = %error, "export failed");
        let _ = self.events.send(JobEvent::Error { error });
    }
}

impl ProgressSink for JobRecorder {
    fn report(&mut self, percent: u8, message: &str) {
        if self.status.is_terminal() {
            return;
        }
        if self.status == JobStatus::Starting {
            self.status = JobStatus::Rendering;
            self.table.update(self.id, |job| job.status = JobStatus::Rendering);
            let _ = self.events.send(JobEvent::Status {
                status: JobStatus::Rendering,
                message: message.to_string(),
            });
        }

        let percent = percent.min(100).max(self.percent.unwrap_or(0));
        let changed = self.percent != Some(percent);
        self.percent = Some(percent);
        self.table.update(self.id, |job| {
            job.percent = percent;
            job.message = message.to_string();
        });
        if changed {
            let _ = self.events.send(JobEvent::Progress {
                percent,
                message: message.to_string(),
            });
        }
    }
}

impl Drop for JobRecorder {
    fn drop(&mut self) {
        // A job must never be left hanging in a non-terminal state.
        if !self.status.is_terminal() {
            self.fail("export ended without a result");
        }
    }
}

impl fmt::Debug for JobRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRecorder")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("percent", &self.percent)
            .finish()
    }
}

/// Returned immediately by [`ExportService::submit`].
#[derive(Debug)]
pub struct JobTicket {
    pub id: JobId,
    pub status: JobStatus,
    pub events: Receiver<JobEvent>,
}

/// Accepts export requests and runs each on its own thread.
pub struct ExportService {
    settings: ExportSettings,
    renderer: Arc<dyn VisualRenderer>,
    encoders: Arc<dyn EncoderFactory>,
    jobs: JobTable,
}

impl ExportService {
    pub fn new(
        settings: ExportSettings,
        renderer: Arc<dyn VisualRenderer>,
        encoders: Arc<dyn EncoderFactory>,
    ) -> Self {
        Self {
            settings,
            renderer,
            encoders,
            jobs: JobTable::default(),
        }
    }

    /// Validates and accepts `request`. Never waits for the render.
    pub fn submit(&self, request: ExportRequest) -> Result<JobTicket> {
        request.validate_within(&self.settings)?;

        let id = JobId::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut recorder = JobRecorder::new(id, self.jobs.clone(), tx);
        let renderer = ExportRenderer::new(
            self.renderer.clone(),
            self.encoders.clone(),
            self.settings.clone(),
        );

        tracing::info!(
            job = %id,
            width = request.width,
            height = request.height,
            fps = request.fps,
            duration = request.duration_seconds,
            bpm = request.bpm,
            "export accepted"
        );

        let spawned = std::thread::Builder::new()
            .name(format!("export-{id}"))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    renderer.run(&request, id, &mut recorder)
                }));
                match outcome {
                    Ok(Ok(path)) => recorder.complete(&path),
                    Ok(Err(err)) => recorder.fail(err.to_string()),
                    Err(payload) => recorder.fail(panic_message(payload.as_ref())),
                }
            });

        if let Err(err) = spawned {
            self.jobs.remove(id);
            return Err(BeatframeError::msg(format!(
                "failed to spawn export thread: {err}"
            )));
        }

        Ok(JobTicket {
            id,
            status: JobStatus::Starting,
            events: rx,
        })
    }

    pub fn status(&self, id: JobId) -> Result<JobSnapshot> {
        self.jobs
            .get(id)
            .ok_or_else(|| BeatframeError::JobNotFound(id.to_string()))
    }

    pub fn jobs(&self) -> Vec<JobId> {
        self.jobs.ids()
    }

    /// Drops a finished job from the table. Running jobs are kept.
    pub fn forget(&self, id: JobId) -> Result<JobSnapshot> {
        let snapshot = self.status(id)?;
        if !snapshot.status.is_terminal() {
            return Err(BeatframeError::msg(format!("export job `{id}` is still running")));
        }
        self.jobs
            .remove(id)
            .ok_or_else(|| BeatframeError::JobNotFound(id.to_string()))
    }
}

impl fmt::Debug for ExportService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportService")
            .field("settings", &self.settings)
            .field("jobs", &self.jobs.ids().len())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("export panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("export panicked: {message}")
    } else {
        "export panicked".to_string()
    }
}
