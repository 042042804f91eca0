#![allow(dead_code)]

use async_trait::async_trait;
use decision_loop::capture::{CaptureTrigger, Evidence, GrantProvider, GrantToken};
use decision_loop::input::{AccessibilityHost, Target, TargetOverlay, Touch};
use decision_loop::{
    Collaborators, DecisionService, LoopConfig, LoopError, Orchestrator, RawResponse, RunId, RunObserver,
    RunState, RunTermination,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub struct Grants(pub AtomicBool);

impl GrantProvider for Grants {
    fn grant(&self) -> Option<GrantToken> {
        self.0.load(Ordering::SeqCst).then(|| GrantToken("granted".into()))
    }

    fn request_grant(&self) {}
}

/// Writes screenshots the moment they are triggered.
#[derive(Default)]
pub struct Screens {
    pub shots: Mutex<Vec<(RunId, PathBuf, Instant)>>,
    audio: Mutex<Option<PathBuf>>,
}

impl Screens {
    /// True while an audio recording has been started and not stopped.
    pub fn recording(&self) -> bool {
        self.audio.lock().unwrap().is_some()
    }
}

impl CaptureTrigger for Screens {
    fn trigger_screenshot(&self, run_id: &RunId, target: &Path, _grant: &GrantToken) -> anyhow::Result<()> {
        std::fs::write(target, b"png")?;
        self.shots.lock().unwrap().push((run_id.clone(), target.to_path_buf(), Instant::now()));
        Ok(())
    }

    fn trigger_audio_start(&self, target: &Path) -> anyhow::Result<()> {
        *self.audio.lock().unwrap() = Some(target.to_path_buf());
        Ok(())
    }

    fn trigger_audio_stop(&self) -> anyhow::Result<()> {
        if let Some(p) = self.audio.lock().unwrap().take() {
            std::fs::write(p, b"m4a")?;
        }
        Ok(())
    }
}

pub struct Host {
    pub enabled: AtomicBool,
    pub taps: Mutex<Vec<(f64, f64)>>,
}

#[async_trait]
impl AccessibilityHost for Host {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn screen_size(&self) -> (u32, u32) {
        (1000, 2000)
    }

    async fn tap(&self, x: f64, y: f64, _duration: Duration) -> bool {
        self.taps.lock().unwrap().push((x, y));
        true
    }
}

#[derive(Default)]
pub struct Overlay {
    touch: Mutex<Option<Touch>>,
    pub visible: AtomicBool,
}

impl Overlay {
    /// Simulate the user touching the shown target.
    pub fn touch(&self) -> bool {
        match self.touch.lock().unwrap().take() {
            Some(t) => {
                t.fire();
                true
            }
            None => false,
        }
    }
}

impl TargetOverlay for Overlay {
    fn show(&self, _target: &Target, touch: Touch) -> anyhow::Result<()> {
        *self.touch.lock().unwrap() = Some(touch);
        self.visible.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn hide(&self) {
        self.visible.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub endpoint: &'static str,
    pub run_id: RunId,
    pub audio: Option<PathBuf>,
    pub screenshot: Option<PathBuf>,
}

/// Replays queued answers; answers `end` once the queue is empty.
#[derive(Default)]
pub struct Decisions {
    replies: Mutex<VecDeque<Result<RawResponse, LoopError>>>,
    pub calls: Mutex<Vec<Call>>,
}

impl Decisions {
    pub fn reply(&self, body: &str) {
        self.replies.lock().unwrap().push_back(Ok(RawResponse(body.into())));
    }

    pub fn fail(&self, error: LoopError) {
        self.replies.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self) -> Result<RawResponse, LoopError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(RawResponse("action_type:end".into())))
    }
}

#[async_trait]
impl DecisionService for Decisions {
    async fn send_init(
        &self,
        run_id: &RunId,
        audio: Option<&Path>,
        screenshot: Option<&Path>,
    ) -> Result<RawResponse, LoopError> {
        self.calls.lock().unwrap().push(Call {
            endpoint: "init",
            run_id: run_id.clone(),
            audio: audio.map(Path::to_path_buf),
            screenshot: screenshot.map(Path::to_path_buf),
        });
        self.next()
    }

    async fn send_feedback(&self, run_id: &RunId, screenshot: Option<&Path>) -> Result<RawResponse, LoopError> {
        self.calls.lock().unwrap().push(Call {
            endpoint: "feedback",
            run_id: run_id.clone(),
            audio: None,
            screenshot: screenshot.map(Path::to_path_buf),
        });
        self.next()
    }
}

pub struct Recorder {
    pub states: Mutex<Vec<RunState>>,
    pub ticks: Mutex<Vec<Duration>>,
    pub evidence: Mutex<Vec<Evidence>>,
    terminated: mpsc::UnboundedSender<RunTermination>,
}

impl RunObserver for Recorder {
    fn on_state_changed(&self, _run_id: &RunId, state: RunState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_countdown(&self, _run_id: &RunId, remaining: Duration) {
        self.ticks.lock().unwrap().push(remaining);
    }

    fn on_evidence_ready(&self, evidence: &Evidence) {
        self.evidence.lock().unwrap().push(evidence.clone());
    }

    fn on_run_terminated(&self, termination: &RunTermination) {
        let _ = self.terminated.send(termination.clone());
    }
}

pub struct Rig {
    pub orch: Orchestrator,
    pub grants: Arc<Grants>,
    pub screens: Arc<Screens>,
    pub host: Arc<Host>,
    pub overlay: Arc<Overlay>,
    pub decisions: Arc<Decisions>,
    pub recorder: Arc<Recorder>,
    pub dir: tempfile::TempDir,
    terminations: mpsc::UnboundedReceiver<RunTermination>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(tweak: impl FnOnce(&mut LoopConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let grants = Arc::new(Grants(AtomicBool::new(true)));
        let screens = Arc::new(Screens::default());
        let host = Arc::new(Host { enabled: AtomicBool::new(true), taps: Mutex::new(Vec::new()) });
        let overlay = Arc::new(Overlay::default());
        let decisions = Arc::new(Decisions::default());
        let recorder = Arc::new(Recorder {
            states: Mutex::new(Vec::new()),
            ticks: Mutex::new(Vec::new()),
            evidence: Mutex::new(Vec::new()),
            terminated: tx,
        });

        let mut cfg = LoopConfig::default();
        cfg.capture.dir = dir.path().to_path_buf();
        tweak(&mut cfg);

        let orch = Orchestrator::spawn(
            Collaborators {
                grants: grants.clone(),
                capture: screens.clone(),
                host: host.clone(),
                overlay: overlay.clone(),
                decision: decisions.clone(),
                observer: recorder.clone(),
            },
            cfg,
        );
        Self { orch, grants, screens, host, overlay, decisions, recorder, dir, terminations: rx }
    }

    pub async fn terminated(&mut self) -> RunTermination {
        self.terminations.recv().await.expect("termination notice")
    }

    pub fn pending_terminations(&mut self) -> usize {
        let mut n = 0;
        while self.terminations.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    pub fn states(&self) -> Vec<RunState> {
        self.recorder.states.lock().unwrap().clone()
    }

    pub fn ticks(&self) -> Vec<Duration> {
        self.recorder.ticks.lock().unwrap().clone()
    }

    pub fn shots(&self) -> Vec<(RunId, PathBuf, Instant)> {
        self.screens.shots.lock().unwrap().clone()
    }

    /// Drop the last orchestrator handle, keeping only the termination feed.
    pub fn drop_handle(self) -> mpsc::UnboundedReceiver<RunTermination> {
        let Rig { orch, terminations, .. } = self;
        drop(orch);
        terminations
    }
}
