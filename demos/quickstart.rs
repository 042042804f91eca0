use anyhow::Result;
use async_trait::async_trait;
use decision_loop::capture::{CaptureTrigger, GrantProvider, GrantToken};
use decision_loop::input::{AccessibilityHost, Target, TargetOverlay, Touch};
use decision_loop::{
    logging, Collaborators, DecisionConfig, GrantStore, HttpDecisionClient, Instruction, LoopConfig, Orchestrator,
    RunId, RunObserver, RunState, RunTermination,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Writes placeholder bytes where a real device would put its captures.
struct FakeDevice;

impl CaptureTrigger for FakeDevice {
    fn trigger_screenshot(&self, _run_id: &RunId, target: &Path, _grant: &GrantToken) -> Result<()> {
        std::fs::write(target, b"\x89PNG demo")?;
        Ok(())
    }

    fn trigger_audio_start(&self, target: &Path) -> Result<()> {
        std::fs::write(target, b"demo audio")?;
        Ok(())
    }

    fn trigger_audio_stop(&self) -> Result<()> {
        Ok(())
    }
}

struct LoggingHost;

#[async_trait]
impl AccessibilityHost for LoggingHost {
    fn is_enabled(&self) -> bool {
        true
    }

    fn screen_size(&self) -> (u32, u32) {
        (1080, 2400)
    }

    async fn tap(&self, x: f64, y: f64, duration: Duration) -> bool {
        info!(x, y, ?duration, "tap");
        true
    }
}

/// Pretends the user touches every target half a second after it appears.
struct EagerUser;

impl TargetOverlay for EagerUser {
    fn show(&self, target: &Target, touch: Touch) -> Result<()> {
        info!(x = target.x, y = target.y, radius = target.radius, "target shown");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            touch.fire();
        });
        Ok(())
    }

    fn hide(&self) {}
}

struct Printer(mpsc::UnboundedSender<RunTermination>);

impl RunObserver for Printer {
    fn on_state_changed(&self, run_id: &RunId, state: RunState) {
        info!(run_id = %run_id, ?state, "state");
    }

    fn on_run_terminated(&self, termination: &RunTermination) {
        let _ = self.0.send(termination.clone());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let base_url = std::env::var("DECISION_BASE_URL").unwrap_or_else(|_| DecisionConfig::default().base_url);
    let client = HttpDecisionClient::new(DecisionConfig { base_url, ..Default::default() })?;
    if !client.health().await.unwrap_or(false) {
        info!("decision service is not answering /health, the run will likely end abnormally");
    }

    let grants = Arc::new(GrantStore::new(|| info!("capture grant requested")));
    let installer = grants.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(800)).await;
        installer.install(GrantToken("demo".into()));
    });
    info!(granted = grants.has_grant(), "grant store ready");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let orch = Orchestrator::spawn(
        Collaborators {
            grants,
            capture: Arc::new(FakeDevice),
            host: Arc::new(LoggingHost),
            overlay: Arc::new(EagerUser),
            decision: Arc::new(client),
            observer: Arc::new(Printer(tx)),
        },
        LoopConfig::default(),
    );

    let Some(run_id) = orch.begin_recording().await else {
        anyhow::bail!("could not open a run");
    };
    info!(run_id = %run_id, "speak now");
    tokio::time::sleep(Duration::from_secs(2)).await;
    orch.submit_recording().await;

    tokio::select! {
        done = rx.recv() => {
            if let Some(done) = done {
                println!("{}", serde_json::to_string_pretty(&done)?);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            orch.stop().await;
        }
    }
    Ok(())
}
