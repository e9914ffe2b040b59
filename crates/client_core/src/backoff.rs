use std::time::Duration;

/// Exponential reconnect delay with a cap and symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30), 0.2)
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::random::<f64>())
    }

    /// `random` is expected in `[0.0, 1.0)`; it maps onto `[-jitter, +jitter]`.
    /// The result never exceeds `max`.
    pub fn delay_with(&self, attempt: u32, random: f64) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let exponential = base_ms.saturating_mul(1u64 << attempt.min(31));
        let capped = exponential.min(max_ms) as f64;

        let spread = (random.clamp(0.0, 1.0) * 2.0 - 1.0) * self.jitter;
        let jittered = (capped * (1.0 + spread)).round().max(0.0) as u64;
        Duration::from_millis(jittered.min(max_ms))
    }
}
