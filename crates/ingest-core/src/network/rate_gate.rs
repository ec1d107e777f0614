//! Per-client monotonic-clock rate limiting.
//!
//! Each provider or source client that must be polite to an upstream API
//! owns one [`RateGate`]. Before issuing a request the caller awaits
//! [`RateGate::wait`], which sleeps just long enough that no two requests
//! through this gate are less than `1/max_rps` apart.

use std::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Minimum inter-request interval gate, shared across a client's workers.
pub struct RateGate {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateGate {
    /// Build a gate enforcing at most `max_rps` requests per second.
    ///
    /// `max_rps <= 0.0` disables throttling entirely.
    pub fn new(max_rps: f64) -> Self {
        let min_interval = if max_rps > 0.0 {
            Duration::from_secs_f64(1.0 / max_rps)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Block until it is safe to issue the next request.
    pub async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let sleep_for = {
            let mut last = self.last_request.lock().expect("rate gate mutex poisoned");
            let now = Instant::now();
            let sleep_for = match *last {
                Some(prev) => {
                    let elapsed = now.duration_since(prev);
                    self.min_interval.saturating_sub(elapsed)
                }
                None => Duration::ZERO,
            };
            *last = Some(now + sleep_for);
            sleep_for
        };
        if !sleep_for.is_zero() {
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_gate_never_sleeps() {
        let gate = RateGate::new(0.0);
        let start = Instant::now();
        gate.wait().await;
        gate.wait().await;
        assert!(Instant::now().duration_since(start) < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn gate_enforces_minimum_spacing() {
        let gate = RateGate::new(20.0); // 50ms apart
        let start = Instant::now();
        gate.wait().await;
        gate.wait().await;
        gate.wait().await;
        let elapsed = Instant::now().duration_since(start);
        assert!(elapsed >= Duration::from_millis(95), "elapsed={:?}", elapsed);
    }
}
