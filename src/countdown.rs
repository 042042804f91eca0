use std::time::Duration;
use tokio::time::sleep;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountdownOutcome {
    Completed,
    Cancelled,
}

/// Cooperative tick loop behind the `wait` instruction.
///
/// `on_tick` sees the remaining time at the start of each tick, so a
/// 200 ms wait on 100 ms ticks reports 200 ms, then 100 ms, then completes.
/// Totals that are zero or negative complete at once with no tick.
#[derive(Clone, Copy, Debug)]
pub struct Countdown {
    tick: Duration,
}

impl Countdown {
    pub fn new(tick: Duration) -> Self {
        Self { tick: tick.max(Duration::from_millis(1)) }
    }

    /// Convert a decision-service duration. Negative and non-finite values read as zero.
    pub fn total_from_secs(seconds: f64) -> Duration {
        if seconds.is_finite() && seconds > 0.0 {
            Duration::from_millis((seconds * 1000.0).round() as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Run until `total` has elapsed or `cancelled` resolves. After
    /// cancellation no further tick fires.
    pub async fn run<F, C>(&self, total: Duration, mut on_tick: F, cancelled: C) -> CountdownOutcome
    where
        F: FnMut(Duration),
        C: std::future::Future<Output = ()>,
    {
        tokio::pin!(cancelled);
        let mut remaining = total;
        while !remaining.is_zero() {
            on_tick(remaining);
            tokio::select! {
                _ = &mut cancelled => return CountdownOutcome::Cancelled,
                _ = sleep(self.tick.min(remaining)) => {}
            }
            remaining = remaining.saturating_sub(self.tick);
        }
        CountdownOutcome::Completed
    }
}

impl Default for Countdown {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}
