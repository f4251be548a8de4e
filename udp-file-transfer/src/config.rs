//! Tunables shared by the sender and receiver engines.

use std::time::Duration;

use crate::packet::MAX_SEGMENT_SIZE;
use crate::timer::TimerConfig;

/// Default RTO before any RTT sample is available.
pub const INITIAL_RTO: Duration = Duration::from_secs(1);
/// Floor for the adaptive RTO.
pub const MIN_RTO: Duration = Duration::from_millis(200);
/// Ceiling for the RTO after repeated back-off.
pub const MAX_RTO: Duration = Duration::from_secs(60);
/// Consecutive retransmission timeouts tolerated before giving up.
pub const MAX_RETRIES: u32 = 6;
/// Congestion window ceiling, in segments.
pub const MAX_CONGESTION_WINDOW: u32 = 1024;
/// Reassembly queue capacity used by the receiver when none is given.
pub const DEFAULT_CAPACITY: usize = 16;

/// Configuration for one transfer endpoint.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Largest payload framed per data segment.  Clamped to
    /// [`MAX_SEGMENT_SIZE`].
    pub max_segment_size: usize,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// Consecutive data timeouts before [`crate::TransferError::RetriesExhausted`].
    pub max_retries: u32,
    /// SYN transmissions before [`crate::TransferError::HandshakeFailed`].
    pub handshake_attempts: u32,
    /// Wait per handshake attempt.
    pub handshake_timeout: Duration,
    /// FIN transmissions before teardown is abandoned.
    pub teardown_attempts: u32,
    /// Wait per teardown attempt; also the sender's linger after its final ACK.
    pub teardown_timeout: Duration,
    pub max_congestion_window: u32,
    /// Fixed initial sequence number; random when `None`.
    pub initial_seq: Option<u32>,
    /// Period over which the consumer's write rate is measured.
    pub write_quantum: Duration,
    /// Receiver gives up after this long without hearing from the sender.
    pub idle_timeout: Duration,
    /// How long `accept` waits for a SYN; forever when `None`.
    pub accept_timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_segment_size: MAX_SEGMENT_SIZE,
            initial_rto: INITIAL_RTO,
            min_rto: MIN_RTO,
            max_rto: MAX_RTO,
            max_retries: MAX_RETRIES,
            handshake_attempts: 5,
            handshake_timeout: Duration::from_secs(1),
            teardown_attempts: 5,
            teardown_timeout: Duration::from_secs(1),
            max_congestion_window: MAX_CONGESTION_WINDOW,
            initial_seq: None,
            write_quantum: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            accept_timeout: None,
        }
    }
}

impl TransferConfig {
    /// Initial sequence number for a new connection.
    pub fn isn(&self) -> u32 {
        self.initial_seq.unwrap_or_else(rand::random)
    }

    /// Effective payload size per segment (at least 1, at most the MSS).
    pub fn segment_size(&self) -> usize {
        self.max_segment_size.clamp(1, MAX_SEGMENT_SIZE)
    }

    pub fn timer(&self) -> TimerConfig {
        TimerConfig {
            initial_rto: self.initial_rto,
            min_rto: self.min_rto,
            max_rto: self.max_rto,
        }
    }
}
