//! Evidence capture: audio from a recorder, screenshots from an out-of-band
//! capture service that needs a one-shot grant.
//!
//! Screenshot readiness is decided by polling the filesystem, never by the
//! trigger call returning. Both waits (grant, then file) are bounded and end
//! with one last-chance check.

use crate::error::LoopError;
use crate::orchestrator::RunId;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

// ========================= Collaborators =========================

/// Opaque authorization handed to the capture service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrantToken(pub String);

pub trait GrantProvider: Send + Sync {
    fn grant(&self) -> Option<GrantToken>;

    /// Ask the host for a grant. The answer arrives out-of-band and is seen
    /// through [`GrantProvider::grant`].
    fn request_grant(&self);

    fn has_grant(&self) -> bool {
        self.grant().is_some()
    }
}

pub trait CaptureTrigger: Send + Sync {
    /// Start writing a screenshot to `target`. Returning does not mean the file exists.
    fn trigger_screenshot(&self, run_id: &RunId, target: &Path, grant: &GrantToken) -> anyhow::Result<()>;
    fn trigger_audio_start(&self, target: &Path) -> anyhow::Result<()>;
    fn trigger_audio_stop(&self) -> anyhow::Result<()>;
}

/// Process-wide grant slot. The first installed token is kept for the rest of
/// the process; there is no revocation path.
pub struct GrantStore {
    token: OnceLock<GrantToken>,
    requester: Box<dyn Fn() + Send + Sync>,
}

impl GrantStore {
    pub fn new(requester: impl Fn() + Send + Sync + 'static) -> Self {
        Self { token: OnceLock::new(), requester: Box::new(requester) }
    }

    /// Record the host's answer. Returns false if a token was already held.
    pub fn install(&self, token: GrantToken) -> bool {
        let took = self.token.set(token).is_ok();
        if took {
            info!("capture grant installed");
        } else {
            debug!("capture grant already held, ignoring new token");
        }
        took
    }
}

impl GrantProvider for GrantStore {
    fn grant(&self) -> Option<GrantToken> {
        self.token.get().cloned()
    }

    fn request_grant(&self) {
        (self.requester)();
    }
}

// ========================= Types =========================

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub dir: PathBuf,
    pub grant_poll_interval: Duration,
    pub grant_poll_attempts: u32,
    pub artifact_poll_interval: Duration,
    pub artifact_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("decision_loop"),
            grant_poll_interval: Duration::from_millis(500),
            grant_poll_attempts: 20,
            artifact_poll_interval: Duration::from_millis(200),
            artifact_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Artifact {
    NotRequested,
    Ready { path: PathBuf },
    Unavailable { error: LoopError },
}

impl Artifact {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Artifact::Ready { path } => Some(path),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&LoopError> {
        match self {
            Artifact::Unavailable { error } => Some(error),
            _ => None,
        }
    }

    fn from_result(r: Result<PathBuf, LoopError>) -> Self {
        match r {
            Ok(path) => Artifact::Ready { path },
            Err(error) => Artifact::Unavailable { error },
        }
    }
}

/// Joined result of one capture. Every requested artifact is either ready or
/// explicitly unavailable.
#[derive(Clone, Debug, Serialize)]
pub struct Evidence {
    pub run_id: RunId,
    pub audio: Artifact,
    pub screenshot: Artifact,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvidenceRequest {
    pub audio: bool,
    pub screenshot: bool,
}

impl EvidenceRequest {
    pub const SCREENSHOT_ONLY: Self = Self { audio: false, screenshot: true };
    pub const FULL: Self = Self { audio: true, screenshot: true };
}

// ========================= Coordinator =========================

pub struct CaptureCoordinator {
    cfg: CaptureConfig,
    grants: Arc<dyn GrantProvider>,
    trigger: Arc<dyn CaptureTrigger>,
    seq: AtomicU64,
    recording: Mutex<Option<PathBuf>>,
}

impl CaptureCoordinator {
    pub fn new(cfg: CaptureConfig, grants: Arc<dyn GrantProvider>, trigger: Arc<dyn CaptureTrigger>) -> Self {
        Self { cfg, grants, trigger, seq: AtomicU64::new(0), recording: Mutex::new(None) }
    }

    /// Start recording into `audio_<run>.m4a`. Replaces (and stops) any
    /// recording left over from an earlier run.
    pub async fn start_audio(&self, run_id: &RunId) -> Result<PathBuf, LoopError> {
        self.ensure_dir()?;
        let path = self.cfg.dir.join(format!("audio_{}.m4a", run_id));
        let mut rec = self.recording.lock().await;
        if rec.take().is_some() {
            warn!(run_id = %run_id, "stale recording found, stopping it first");
            let _ = self.trigger.trigger_audio_stop();
        }
        self.trigger
            .trigger_audio_start(&path)
            .map_err(|e| LoopError::Capture(format!("audio start: {e}")))?;
        info!(run_id = %run_id, path = %path.display(), "recording started");
        *rec = Some(path.clone());
        Ok(path)
    }

    /// Stop a recording without collecting it. Returns false when nothing
    /// was recording.
    pub async fn abort_audio(&self) -> bool {
        let Some(path) = self.recording.lock().await.take() else {
            return false;
        };
        if let Err(e) = self.trigger.trigger_audio_stop() {
            warn!(path = %path.display(), "audio stop failed: {}", e);
        }
        true
    }

    /// Gather the requested artifacts for `run_id`.
    ///
    /// Audio is stopped and checked first; the screenshot wait follows, and
    /// the evidence is only returned once both are settled. Dropping the
    /// future abandons any pending poll.
    pub async fn capture_evidence(&self, run_id: &RunId, req: EvidenceRequest) -> Evidence {
        let audio = if req.audio {
            Artifact::from_result(self.finish_audio().await)
        } else {
            Artifact::NotRequested
        };
        let screenshot = if req.screenshot {
            Artifact::from_result(self.screenshot(run_id).await)
        } else {
            Artifact::NotRequested
        };
        if let Some(e) = audio.error() {
            warn!(run_id = %run_id, kind = e.kind(), "audio unavailable: {}", e);
        }
        if let Some(e) = screenshot.error() {
            warn!(run_id = %run_id, kind = e.kind(), "screenshot unavailable: {}", e);
        }
        Evidence { run_id: run_id.clone(), audio, screenshot }
    }

    async fn finish_audio(&self) -> Result<PathBuf, LoopError> {
        let path = self
            .recording
            .lock()
            .await
            .take()
            .ok_or_else(|| LoopError::Capture("no recording in progress".into()))?;
        self.trigger
            .trigger_audio_stop()
            .map_err(|e| LoopError::Capture(format!("audio stop: {e}")))?;
        if artifact_ready(&path) {
            Ok(path)
        } else {
            Err(LoopError::ArtifactTimeout { path, waited: Duration::ZERO })
        }
    }

    async fn screenshot(&self, run_id: &RunId) -> Result<PathBuf, LoopError> {
        let grant = self.await_grant().await?;
        self.ensure_dir()?;
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = self.cfg.dir.join(format!("screenshot_{}_{}.png", run_id, n));
        self.trigger
            .trigger_screenshot(run_id, &path, &grant)
            .map_err(|e| LoopError::Capture(format!("screenshot trigger: {e}")))?;
        debug!(run_id = %run_id, path = %path.display(), "screenshot triggered");
        self.await_artifact(&path).await?;
        info!(run_id = %run_id, path = %path.display(), "screenshot ready");
        Ok(path)
    }

    async fn await_grant(&self) -> Result<GrantToken, LoopError> {
        if let Some(token) = self.grants.grant() {
            return Ok(token);
        }
        info!("capture grant missing, requesting");
        self.grants.request_grant();

        let attempts = self.cfg.grant_poll_attempts;
        for attempt in 1..=attempts {
            sleep(self.cfg.grant_poll_interval).await;
            if let Some(token) = self.grants.grant() {
                debug!(attempt, "capture grant observed");
                return Ok(token);
            }
            debug!(attempt, "capture grant still pending");
        }
        // last chance
        self.grants.grant().ok_or(LoopError::GrantUnavailable { attempts })
    }

    async fn await_artifact(&self, path: &Path) -> Result<(), LoopError> {
        let interval = self.cfg.artifact_poll_interval;
        let polls = self.cfg.artifact_timeout.as_millis() / interval.as_millis().max(1);
        for _ in 0..polls {
            if artifact_ready(path) {
                return Ok(());
            }
            sleep(interval).await;
        }
        // last chance
        if artifact_ready(path) {
            return Ok(());
        }
        Err(LoopError::ArtifactTimeout {
            path: path.to_path_buf(),
            waited: self.cfg.artifact_timeout,
        })
    }

    fn ensure_dir(&self) -> Result<(), LoopError> {
        std::fs::create_dir_all(&self.cfg.dir)
            .map_err(|e| LoopError::Capture(format!("create {}: {}", self.cfg.dir.display(), e)))
    }
}

/// Present and non-empty. A zero-length file is a write still in flight.
fn artifact_ready(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
