//! `PeerMetrics`: EMA-smoothed reliability tracking for a remote peer.

/// Smoothing factor for both the success-rate and response-time EMAs.
const EMA_ALPHA: f64 = 0.1;

/// Per-peer send/receive outcome tracking, used by the transport to rank
/// peers for fan-out and to decide when a peer should be dropped.
#[derive(Debug, Clone)]
pub struct PeerMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub total_response_time_ms: u64,
    pub last_operation_time: u64,
    pub consecutive_failures: u32,
    success_rate_ema: f64,
    response_time_ema: f64,
}

impl Default for PeerMetrics {
    fn default() -> Self {
        Self {
            total_operations: 0,
            successful_operations: 0,
            total_response_time_ms: 0,
            last_operation_time: 0,
            consecutive_failures: 0,
            // Optimistic prior: an unseen peer hasn't failed yet.
            success_rate_ema: 1.0,
            response_time_ema: 0.0,
        }
    }
}

impl PeerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful operation (send or receive) at `now`.
    pub fn record_success(&mut self, response_time_ms: u64, now: u64) {
        self.total_operations += 1;
        self.successful_operations += 1;
        self.total_response_time_ms += response_time_ms;
        self.last_operation_time = now;
        self.consecutive_failures = 0;

        self.success_rate_ema = ema(self.success_rate_ema, 1.0);
        self.response_time_ema = ema(self.response_time_ema, response_time_ms as f64);
    }

    /// Record a failed send to this peer at `now`.
    pub fn record_failure(&mut self, now: u64) {
        self.total_operations += 1;
        self.last_operation_time = now;
        self.consecutive_failures += 1;

        self.success_rate_ema = ema(self.success_rate_ema, 0.0);
    }

    pub fn success_rate(&self) -> f64 {
        self.success_rate_ema
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        self.response_time_ema
    }

    /// Reliability in `[0, 1]`: success rate penalized up to 30% for slow
    /// responses and up to 50% for consecutive failures.
    pub fn reliability_score(&self) -> f64 {
        let latency_penalty = 1.0 - 0.3 * (self.response_time_ema / 1000.0).min(1.0);
        let failure_penalty = 1.0 - 0.5 * (self.consecutive_failures as f64 / 10.0).min(1.0);
        self.success_rate_ema * latency_penalty * failure_penalty
    }

    /// False once the peer crosses the unhealthy thresholds: more than 5
    /// consecutive failures, success rate below 0.5, or more than 3 attempts
    /// with zero successes.
    pub fn is_healthy(&self) -> bool {
        if self.consecutive_failures > 5 {
            return false;
        }
        if self.success_rate_ema < 0.5 {
            return false;
        }
        if self.successful_operations == 0 && self.total_operations > 3 {
            return false;
        }
        true
    }
}

fn ema(previous: f64, sample: f64) -> f64 {
    EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * previous
}
