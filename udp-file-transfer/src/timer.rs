//! Retransmission timeout management.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent if no
//! ACK arrives within a bounded time.  [`RetransmitTimer`] tracks the current
//! retransmit timeout (RTO) for one connection; the send window arms a
//! deadline from it whenever segments are outstanding.
//!
//! RTO is computed using Jacobson's algorithm (RFC 6298):
//!   `RTO = SRTT + 4 × RTTVAR`
//! clamped to `[min_rto, max_rto]`, and doubles on each consecutive timeout
//! (exponential back-off) up to `max_rto`.  Only segments transmitted exactly
//! once produce samples (Karn's rule); the caller enforces that.

use std::time::Duration;

/// Adjustable timeout parameters.
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    /// RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// Floor applied to computed RTOs.
    pub min_rto: Duration,
    /// Maximum RTO after repeated back-off.
    pub max_rto: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: crate::config::INITIAL_RTO,
            min_rto: crate::config::MIN_RTO,
            max_rto: crate::config::MAX_RTO,
        }
    }
}

/// RTO state for one connection.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    config: TimerConfig,
    current_rto: Duration,
    /// Smoothed RTT estimate (SRTT).
    srtt: Option<Duration>,
    /// RTT variance estimate (RTTVAR).
    rttvar: Option<Duration>,
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        Self::new(TimerConfig::default())
    }
}

impl RetransmitTimer {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            current_rto: config.initial_rto,
            config,
            srtt: None,
            rttvar: None,
        }
    }

    pub fn rto(&self) -> Duration {
        self.current_rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = Some(rttvar * 3 / 4 + diff / 4);
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
            _ => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }
        self.reset();
    }

    /// Double the RTO on retransmit timeout (RFC 6298 §5.5), capped at
    /// `max_rto`.
    pub fn back_off(&mut self) {
        self.current_rto = (self.current_rto * 2).min(self.config.max_rto);
    }

    /// Restore the RTO from the current estimates after forward progress.
    ///
    /// Falls back to `initial_rto` before the first RTT sample is available.
    pub fn reset(&mut self) {
        let rto = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => srtt + rttvar * 4,
            _ => self.config.initial_rto,
        };
        self.current_rto = rto.clamp(self.config.min_rto, self.config.max_rto);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> RetransmitTimer {
        RetransmitTimer::new(TimerConfig {
            initial_rto: Duration::from_millis(1000),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(8),
        })
    }

    #[test]
    fn starts_at_initial_rto() {
        assert_eq!(timer().rto(), Duration::from_millis(1000));
    }

    #[test]
    fn back_off_doubles_up_to_cap() {
        let mut t = timer();
        t.back_off();
        assert_eq!(t.rto(), Duration::from_secs(2));
        for _ in 0..10 {
            t.back_off();
        }
        assert_eq!(t.rto(), Duration::from_secs(8));
    }

    #[test]
    fn first_sample_sets_srtt_and_rto() {
        let mut t = timer();
        t.record_rtt_sample(Duration::from_millis(100));
        assert_eq!(t.srtt(), Some(Duration::from_millis(100)));
        // 100 + 4 * 50
        assert_eq!(t.rto(), Duration::from_millis(300));
    }

    #[test]
    fn tiny_samples_are_clamped_to_min_rto() {
        let mut t = timer();
        t.record_rtt_sample(Duration::from_micros(50));
        assert_eq!(t.rto(), Duration::from_millis(200));
    }

    #[test]
    fn reset_undoes_back_off() {
        let mut t = timer();
        t.record_rtt_sample(Duration::from_millis(100));
        t.back_off();
        t.back_off();
        assert_eq!(t.rto(), Duration::from_millis(1200));
        t.reset();
        assert_eq!(t.rto(), Duration::from_millis(300));
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut t = timer();
        t.record_rtt_sample(Duration::from_millis(100));
        t.record_rtt_sample(Duration::from_millis(180));
        // SRTT = 7/8·100 + 1/8·180 = 110
        assert_eq!(t.srtt(), Some(Duration::from_millis(110)));
    }
}
