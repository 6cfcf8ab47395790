use rand::{thread_rng, Rng};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay policy consulted before every outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    #[default]
    Off,
    /// Uniformly random delay in `[min, max]`.
    Jitter { min: Duration, max: Duration },
}

impl Pacing {
    pub fn jitter_ms(min_ms: u64, max_ms: u64) -> Self {
        if max_ms == 0 {
            return Pacing::Off;
        }
        Pacing::Jitter {
            min: Duration::from_millis(min_ms.min(max_ms)),
            max: Duration::from_millis(max_ms),
        }
    }

    pub fn next_delay(&self) -> Duration {
        match *self {
            Pacing::Off => Duration::ZERO,
            Pacing::Jitter { min, max } => {
                let lo = min.as_millis() as u64;
                let hi = max.as_millis() as u64;
                Duration::from_millis(thread_rng().gen_range(lo..=hi))
            }
        }
    }

    /// Sleep for the next delay. Returns `false` if `cancel` fired first.
    pub async fn pause(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let delay = self.next_delay();
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
