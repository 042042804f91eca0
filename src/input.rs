use crate::error::LoopError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, info, warn};

// ========================= Collaborators =========================

/// Host gesture capability (an accessibility service or equivalent).
#[async_trait]
pub trait AccessibilityHost: Send + Sync {
    fn is_enabled(&self) -> bool;
    /// Physical screen size in pixels, (width, height).
    fn screen_size(&self) -> (u32, u32);
    async fn tap(&self, x: f64, y: f64, duration: Duration) -> bool;
}

/// Draws the actionable region. Rendering is entirely the host's business.
pub trait TargetOverlay: Send + Sync {
    /// Show `target` and fire `touch` when the user interacts with it.
    fn show(&self, target: &Target, touch: Touch) -> anyhow::Result<()>;
    fn hide(&self);
}

/// One-shot touch signal handed to the overlay.
pub struct Touch(oneshot::Sender<()>);

impl Touch {
    pub fn fire(self) {
        let _ = self.0.send(());
    }
}

// ========================= Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
    /// 0..1000 on each axis, scaled to the physical screen.
    PerMille,
    Absolute,
}

#[derive(Clone, Debug)]
pub struct InputConfig {
    pub tap_duration: Duration,
    pub pre_tap_delay: Duration,
    pub coordinates: CoordinateSpace,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            tap_duration: Duration::from_millis(200),
            pre_tap_delay: Duration::from_millis(30),
            coordinates: CoordinateSpace::PerMille,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

// ========================= Executor =========================

#[derive(Clone)]
pub struct InputExecutor {
    cfg: InputConfig,
    host: Arc<dyn AccessibilityHost>,
    overlay: Arc<dyn TargetOverlay>,
}

impl InputExecutor {
    pub fn new(cfg: InputConfig, host: Arc<dyn AccessibilityHost>, overlay: Arc<dyn TargetOverlay>) -> Self {
        Self { cfg, host, overlay }
    }

    fn require_enabled(&self) -> Result<(), LoopError> {
        if self.host.is_enabled() {
            Ok(())
        } else {
            Err(LoopError::CapabilityDisabled("accessibility host".into()))
        }
    }

    fn to_physical(&self, target: Target) -> Target {
        match self.cfg.coordinates {
            CoordinateSpace::Absolute => target,
            CoordinateSpace::PerMille => {
                let (w, h) = self.host.screen_size();
                Target {
                    x: f64::from(w) * target.x / 1000.0,
                    y: f64::from(h) * target.y / 1000.0,
                    radius: target.radius,
                }
            }
        }
    }

    /// Show the target and hand back a handle that resolves on touch.
    pub fn present_target(&self, target: Target) -> Result<PendingTarget, LoopError> {
        self.require_enabled()?;
        let physical = self.to_physical(target);
        self.overlay.hide();
        let (tx, rx) = oneshot::channel();
        self.overlay
            .show(&physical, Touch(tx))
            .map_err(|e| LoopError::CapabilityDisabled(format!("overlay: {e}")))?;
        info!(x = physical.x, y = physical.y, radius = physical.radius, "target shown");
        Ok(PendingTarget { touched: rx, target: physical, input: self.clone() })
    }

    /// Tap at physical coordinates. Ok(false) means the host refused the gesture.
    pub async fn execute_tap(&self, x: f64, y: f64) -> Result<bool, LoopError> {
        self.require_enabled()?;
        debug!(x, y, "tap");
        Ok(self.host.tap(x, y, self.cfg.tap_duration).await)
    }

    pub fn dismiss(&self) {
        self.overlay.hide();
    }
}

pub struct PendingTarget {
    touched: oneshot::Receiver<()>,
    target: Target,
    input: InputExecutor,
}

impl PendingTarget {
    pub fn target(&self) -> Target {
        self.target
    }

    /// Wait for the touch, remove the overlay, then tap underneath it.
    /// Returns whether the host reported the tap as successful.
    pub async fn confirmed(self) -> Result<bool, LoopError> {
        self.touched.await.map_err(|_| LoopError::TargetDismissed)?;
        self.input.overlay.hide();
        sleep(self.input.cfg.pre_tap_delay).await;
        let ok = self.input.execute_tap(self.target.x, self.target.y).await?;
        if !ok {
            warn!(x = self.target.x, y = self.target.y, "host reported tap failure");
        }
        Ok(ok)
    }
}
