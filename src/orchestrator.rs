use crate::capture::{
    Artifact, CaptureConfig, CaptureCoordinator, CaptureTrigger, Evidence, EvidenceRequest, GrantProvider,
};
use crate::countdown::{Countdown, CountdownOutcome};
use crate::decision::DecisionService;
use crate::error::LoopError;
use crate::input::{AccessibilityHost, InputConfig, InputExecutor, Target, TargetOverlay};
use crate::instruction::{Instruction, RawResponse};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ========================= Core Types =========================

/// Correlates every file name and request belonging to one run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        RunId(nanoid!())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Init,
    Click,
    Wait,
    Feedback,
    End,
}

/// Payload of the once-per-run termination notice. `normal` is false for
/// forced stops and fatal errors.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunTermination {
    pub run_id: RunId,
    pub normal: bool,
    pub reason: Option<String>,
}

pub const STOPPED_REASON: &str = "stopped";

/// Notifications out of the loop. Called from the orchestrator task, in order.
pub trait RunObserver: Send + Sync {
    fn on_state_changed(&self, _run_id: &RunId, _state: RunState) {}
    fn on_countdown(&self, _run_id: &RunId, _remaining: Duration) {}
    fn on_evidence_ready(&self, _evidence: &Evidence) {}
    fn on_run_terminated(&self, _termination: &RunTermination) {}
}

#[derive(Clone, Debug)]
pub struct TimingConfig {
    /// Pause after a click confirmation or countdown expiry, before the next screenshot.
    pub settle_delay: Duration,
    /// Pause between evidence readiness and the decision request.
    pub submit_delay: Duration,
    pub tick: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(1000),
            submit_delay: Duration::from_millis(2000),
            tick: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoopConfig {
    pub timing: TimingConfig,
    pub capture: CaptureConfig,
    pub input: InputConfig,
}

/// Everything the loop talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub grants: Arc<dyn GrantProvider>,
    pub capture: Arc<dyn CaptureTrigger>,
    pub host: Arc<dyn AccessibilityHost>,
    pub overlay: Arc<dyn TargetOverlay>,
    pub decision: Arc<dyn DecisionService>,
    pub observer: Arc<dyn RunObserver>,
}

// ========================= Handle =========================

enum Command {
    Start { instruction: Instruction, reply: oneshot::Sender<Option<RunId>> },
    BeginRecording { reply: oneshot::Sender<Option<RunId>> },
    SubmitRecording { reply: oneshot::Sender<bool> },
    End { reply: oneshot::Sender<bool> },
    Stop { reply: oneshot::Sender<bool> },
}

/// Handle to the orchestrator task. Cheap to clone; when the last handle is
/// dropped any active run is stopped and the task exits.
#[derive(Clone)]
pub struct Orchestrator {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<RunState>,
}

impl Orchestrator {
    /// Spawn the orchestrator task on the current tokio runtime.
    pub fn spawn(collab: Collaborators, cfg: LoopConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RunState::Idle);

        let capture = Arc::new(CaptureCoordinator::new(cfg.capture.clone(), collab.grants, collab.capture));
        let input = InputExecutor::new(cfg.input.clone(), collab.host, collab.overlay);
        let machine = Machine {
            timing: cfg.timing,
            capture,
            input,
            decision: collab.decision,
            observer: collab.observer,
            run: None,
            next_epoch: 0,
            events: ev_tx,
            state: state_tx,
        };
        tokio::spawn(drive(machine, cmd_rx, ev_rx));
        Self { commands: cmd_tx, state: state_rx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).await.is_err() {
            warn!("orchestrator task is gone");
            return None;
        }
        rx.await.ok()
    }

    /// Open a run and dispatch `instruction`. None if a run is already active.
    pub async fn start(&self, instruction: Instruction) -> Option<RunId> {
        self.request(|reply| Command::Start { instruction, reply }).await.flatten()
    }

    /// Open a run in `Init` and start recording audio for it.
    pub async fn begin_recording(&self) -> Option<RunId> {
        self.request(|reply| Command::BeginRecording { reply }).await.flatten()
    }

    /// Stop recording, capture initial evidence and ask for the first instruction.
    pub async fn submit_recording(&self) -> bool {
        self.request(|reply| Command::SubmitRecording { reply }).await.unwrap_or(false)
    }

    /// End the active run normally. False if no run was active.
    pub async fn end(&self) -> bool {
        self.request(|reply| Command::End { reply }).await.unwrap_or(false)
    }

    /// Abort the active run from any state. False if no run was active.
    pub async fn stop(&self) -> bool {
        self.request(|reply| Command::Stop { reply }).await.unwrap_or(false)
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }
}

// ========================= State Machine =========================

#[derive(Clone, Copy, Debug)]
enum Phase {
    Init,
    Feedback,
}

enum Event {
    Countdown(Duration),
    Settled,
    Evidence(Evidence, Phase),
    Decision(Result<RawResponse, LoopError>),
    Failed(LoopError),
}

struct Tagged {
    epoch: u64,
    event: Event,
}

/// Sender side given to background steps. Events carry the epoch of the run
/// that spawned them so late arrivals can be told apart.
#[derive(Clone)]
struct Emitter {
    epoch: u64,
    tx: mpsc::UnboundedSender<Tagged>,
    cancel: CancellationToken,
}

impl Emitter {
    fn send(&self, event: Event) {
        let _ = self.tx.send(Tagged { epoch: self.epoch, event });
    }
}

struct Run {
    id: RunId,
    epoch: u64,
    state: RunState,
    instruction: Option<Instruction>,
    recording: bool,
    cancel: CancellationToken,
}

struct Machine {
    timing: TimingConfig,
    capture: Arc<CaptureCoordinator>,
    input: InputExecutor,
    decision: Arc<dyn DecisionService>,
    observer: Arc<dyn RunObserver>,
    run: Option<Run>,
    next_epoch: u64,
    events: mpsc::UnboundedSender<Tagged>,
    state: watch::Sender<RunState>,
}

async fn drive(
    mut machine: Machine,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::UnboundedReceiver<Tagged>,
) {
    loop {
        tokio::select! {
            biased;
            Some(tagged) = events.recv() => machine.on_event(tagged).await,
            cmd = commands.recv() => match cmd {
                Some(cmd) => machine.on_command(cmd).await,
                None => break,
            },
        }
    }
    machine.stop().await;
    debug!("orchestrator task finished");
}

impl Machine {
    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { instruction, reply } => {
                let id = self.start(instruction).await;
                let _ = reply.send(id);
            }
            Command::BeginRecording { reply } => {
                let id = self.begin_recording().await;
                let _ = reply.send(id);
            }
            Command::SubmitRecording { reply } => {
                let _ = reply.send(self.submit_recording());
            }
            Command::End { reply } => {
                let active = self.run.is_some();
                self.enter_end(true, None).await;
                let _ = reply.send(active);
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.stop().await);
            }
        }
    }

    async fn on_event(&mut self, tagged: Tagged) {
        let run_id = match &self.run {
            Some(run) if run.epoch == tagged.epoch => run.id.clone(),
            _ => {
                debug!(epoch = tagged.epoch, "dropping event from a finished run");
                return;
            }
        };
        match tagged.event {
            Event::Countdown(remaining) => self.observer.on_countdown(&run_id, remaining),
            Event::Settled => self.enter_feedback(),
            Event::Evidence(evidence, phase) => self.on_evidence(evidence, phase).await,
            Event::Decision(Ok(raw)) => {
                let parsed = raw.parse();
                info!(
                    run_id = %run_id,
                    kind = parsed.instruction.kind(),
                    instruction = %parsed.instruction,
                    "decision received"
                );
                self.dispatch(parsed.instruction).await;
            }
            Event::Decision(Err(e)) | Event::Failed(e) => self.fail(e).await,
        }
    }

    fn open_run(&mut self) -> Option<RunId> {
        if let Some(run) = &self.run {
            warn!(run_id = %run.id, state = ?run.state, "run already active, ignoring start");
            return None;
        }
        let id = RunId::generate();
        self.next_epoch += 1;
        self.run = Some(Run {
            id: id.clone(),
            epoch: self.next_epoch,
            state: RunState::Idle,
            instruction: None,
            recording: false,
            cancel: CancellationToken::new(),
        });
        self.set_state(RunState::Init);
        Some(id)
    }

    async fn start(&mut self, instruction: Instruction) -> Option<RunId> {
        let id = self.open_run()?;
        info!(run_id = %id, instruction = %instruction, "run started");
        self.dispatch(instruction).await;
        Some(id)
    }

    async fn begin_recording(&mut self) -> Option<RunId> {
        let id = self.open_run()?;
        match self.capture.start_audio(&id).await {
            Ok(_) => {
                if let Some(run) = self.run.as_mut() {
                    run.recording = true;
                }
            }
            Err(e) => self.fail(e).await,
        }
        Some(id)
    }

    fn submit_recording(&mut self) -> bool {
        let Some(run) = self.run.as_mut() else {
            warn!("no active run to submit");
            return false;
        };
        if run.state != RunState::Init || !run.recording {
            warn!(run_id = %run.id, state = ?run.state, "no recording in progress");
            return false;
        }
        run.recording = false;
        let run_id = run.id.clone();
        let capture = self.capture.clone();
        self.spawn_step(move |_| async move {
            let evidence = capture.capture_evidence(&run_id, EvidenceRequest::FULL).await;
            Some(Event::Evidence(evidence, Phase::Init))
        });
        true
    }

    fn set_state(&mut self, state: RunState) {
        if let Some(run) = self.run.as_mut() {
            run.state = state;
            info!(run_id = %run.id, state = ?state, "state transition");
            self.observer.on_state_changed(&run.id, state);
        }
        self.state.send_replace(state);
    }

    /// Run `work` in the background under the active run's cancellation
    /// token. Its result is posted back to this task, never applied directly.
    fn spawn_step<F, Fut>(&self, work: F)
    where
        F: FnOnce(Emitter) -> Fut,
        Fut: Future<Output = Option<Event>> + Send + 'static,
    {
        let Some(run) = &self.run else { return };
        let emitter = Emitter { epoch: run.epoch, tx: self.events.clone(), cancel: run.cancel.clone() };
        let fut = work(emitter.clone());
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = emitter.cancel.cancelled() => {}
                event = fut => {
                    if let Some(event) = event {
                        emitter.send(event);
                    }
                }
            }
        });
    }

    async fn dispatch(&mut self, instruction: Instruction) {
        if let Some(run) = self.run.as_mut() {
            run.instruction = Some(instruction.clone());
        }
        match instruction {
            Instruction::Click { x, y, radius } => self.enter_click(x, y, radius).await,
            Instruction::Wait { seconds } => self.enter_wait(seconds),
            Instruction::End => self.enter_end(true, None).await,
        }
    }

    async fn enter_click(&mut self, x: f64, y: f64, radius: f64) {
        self.set_state(RunState::Click);
        let pending = match self.input.present_target(Target { x, y, radius }) {
            Ok(p) => p,
            Err(e) => return self.fail(e).await,
        };
        debug!(at = ?pending.target(), "awaiting touch");
        let settle = self.timing.settle_delay;
        self.spawn_step(move |_| async move {
            match pending.confirmed().await {
                Ok(_) => {
                    sleep(settle).await;
                    Some(Event::Settled)
                }
                Err(e) => Some(Event::Failed(e)),
            }
        });
    }

    fn enter_wait(&mut self, seconds: f64) {
        self.set_state(RunState::Wait);
        let total = Countdown::total_from_secs(seconds);
        let countdown = Countdown::new(self.timing.tick);
        let settle = self.timing.settle_delay;
        self.spawn_step(move |emit| async move {
            let outcome = countdown
                .run(total, |remaining| emit.send(Event::Countdown(remaining)), emit.cancel.cancelled())
                .await;
            if outcome == CountdownOutcome::Cancelled {
                return None;
            }
            sleep(settle).await;
            Some(Event::Settled)
        });
    }

    fn enter_feedback(&mut self) {
        self.set_state(RunState::Feedback);
        let Some(run) = &self.run else { return };
        let run_id = run.id.clone();
        let capture = self.capture.clone();
        self.spawn_step(move |_| async move {
            let evidence = capture.capture_evidence(&run_id, EvidenceRequest::SCREENSHOT_ONLY).await;
            Some(Event::Evidence(evidence, Phase::Feedback))
        });
    }

    async fn on_evidence(&mut self, evidence: Evidence, phase: Phase) {
        self.observer.on_evidence_ready(&evidence);
        let decision = self.decision.clone();
        let delay = self.timing.submit_delay;
        let run_id = evidence.run_id.clone();
        match phase {
            Phase::Init => {
                let audio = evidence.audio.path().map(|p| p.to_path_buf());
                let screenshot = evidence.screenshot.path().map(|p| p.to_path_buf());
                self.spawn_step(move |_| async move {
                    sleep(delay).await;
                    let resp = decision.send_init(&run_id, audio.as_deref(), screenshot.as_deref()).await;
                    Some(Event::Decision(resp))
                });
            }
            Phase::Feedback => {
                let path = match evidence.screenshot {
                    Artifact::Ready { path } => path,
                    Artifact::Unavailable { error } => return self.fail(error).await,
                    Artifact::NotRequested => {
                        return self.fail(LoopError::Capture("screenshot not captured".into())).await
                    }
                };
                self.spawn_step(move |_| async move {
                    sleep(delay).await;
                    let resp = decision.send_feedback(&run_id, Some(&path)).await;
                    Some(Event::Decision(resp))
                });
            }
        }
    }

    async fn fail(&mut self, error: LoopError) {
        if let Some(run) = &self.run {
            warn!(run_id = %run.id, state = ?run.state, kind = error.kind(), "run failed: {}", error);
        }
        self.enter_end(false, Some(error.to_string())).await;
    }

    /// Terminal transition. A second call finds no run and does nothing.
    async fn enter_end(&mut self, normal: bool, reason: Option<String>) {
        if self.run.is_none() {
            debug!("end requested with no active run");
            return;
        }
        self.set_state(RunState::End);
        let Some(run) = self.run.take() else { return };
        self.release(&run).await;
        info!(run_id = %run.id, normal, last = ?run.instruction, "run finished");
        self.observer.on_run_terminated(&RunTermination { run_id: run.id, normal, reason });
    }

    /// Forced abort. Nothing pending for the run survives it.
    async fn stop(&mut self) -> bool {
        let Some(run) = self.run.take() else {
            return false;
        };
        self.release(&run).await;
        self.state.send_replace(RunState::Idle);
        self.observer.on_state_changed(&run.id, RunState::Idle);
        info!(run_id = %run.id, state = ?run.state, "run stopped");
        self.observer.on_run_terminated(&RunTermination {
            run_id: run.id,
            normal: false,
            reason: Some(STOPPED_REASON.to_string()),
        });
        true
    }

    async fn release(&self, run: &Run) {
        run.cancel.cancel();
        self.input.dismiss();
        // a submitted recording may not have reached its capture step yet
        if self.capture.abort_audio().await {
            debug!(run_id = %run.id, "recording aborted");
        }
    }
}
