//! Send-side sliding window with AIMD congestion control.
//!
//! [`SendWindow`] owns every data segment that has been framed but not yet
//! acknowledged, split in two queues:
//!
//! ```text
//!  send_base                 first pending              next_seq
//!      │                           │                        │
//!  ────┼───────── in_flight ───────┼──────── pending ───────┼──▶ seq space
//!      │  transmitted, unacked     │  framed, awaiting a    │
//!      │                           │  (re)transmission slot │
//! ```
//!
//! Loss signals move the whole of `in_flight` back to the front of
//! `pending`, so retransmission always restarts at the oldest unacknowledged
//! segment and proceeds in sequence order.
//!
//! A segment `s` may go out only while
//! - fewer than `cwnd` segments are in flight, and
//! - `s < send_base + peer_window` (the receiver has room for it).
//!
//! With a zero advertised window only a single probe segment is allowed, and
//! only after the persist timer fired.
//!
//! Three different signals are kept apart:
//! - NAK: loss.  `cwnd` is halved once per gap and the window goes back.
//! - zero-window ACK: back-pressure.  Sending pauses; `cwnd` is untouched.
//! - duplicate ACK: nothing happens at all.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::packet::{flags, seq_distance, seq_le, seq_lt, Header, Segment};
use crate::timer::{RetransmitTimer, TimerConfig};

// ---------------------------------------------------------------------------
// Outstanding
// ---------------------------------------------------------------------------

/// A framed data segment that has not been acknowledged yet.
#[derive(Debug, Clone)]
struct Outstanding {
    segment: Segment,
    /// Total number of times this segment has been transmitted.
    tx_count: u32,
    /// Time of the most recent transmission (for RTT sampling).
    sent_at: Option<Instant>,
}

impl Outstanding {
    fn seq(&self) -> u32 {
        self.segment.header.seq
    }
}

// ---------------------------------------------------------------------------
// Outcomes / stats
// ---------------------------------------------------------------------------

/// What an incoming acknowledgement did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `acked` segments left the window.
    Advanced { acked: usize },
    /// Nothing new acknowledged; state unchanged.
    Duplicate,
    /// NAK: window reduced and retransmission queued from the gap.
    Loss,
    /// The receiver advertised a zero window; sending is paused.
    Paused,
    /// The receiver re-opened its window after a pause.
    Reopened,
    /// Stale or out-of-range acknowledgement.
    Ignored,
}

/// What a retransmission timeout did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Nothing was outstanding.
    Nothing,
    /// Window reduced and retransmission queued.
    Loss,
    /// Window closed: one probe segment may go out.
    Probe,
    /// Too many consecutive timeouts without a response.
    Exhausted { retries: u32 },
}

/// Counters describing one transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Data segment transmissions, retransmissions included.
    pub data_segments_sent: u64,
    pub retransmissions: u64,
    /// Window reductions caused by NAKs or timeouts.
    pub loss_events: u64,
    pub timeouts: u64,
    /// Largest number of segments ever in flight at once.
    pub peak_in_flight: usize,
    /// Payload bytes acknowledged by the receiver.
    pub bytes_acked: u64,
}

// ---------------------------------------------------------------------------
// SendWindow
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SendWindow {
    /// Oldest unacknowledged sequence number.
    send_base: u32,
    /// Sequence number for the next framed chunk.
    next_seq: u32,
    /// One past the highest sequence number ever transmitted.
    high_sent: u32,
    /// ACK field carried by every data segment.
    peer_ack: u32,

    cwnd: u32,
    max_cwnd: u32,
    peer_window: u16,

    in_flight: VecDeque<Outstanding>,
    pending: VecDeque<Outstanding>,

    /// ACK point of the last loss reaction; repeated NAKs for it are ignored.
    recovery_point: Option<u32>,
    probe_due: bool,
    source_done: bool,
    stopped: bool,

    timer: RetransmitTimer,
    deadline: Option<Instant>,
    retries: u32,
    max_retries: u32,

    stats: TransferStats,
}

impl SendWindow {
    /// Create a window whose first data segment will carry `first_seq`.
    ///
    /// `peer_ack` is the receiver's next expected sequence number and
    /// `peer_window` the window it advertised during the handshake.
    pub fn new(
        first_seq: u32,
        peer_ack: u32,
        peer_window: u16,
        max_cwnd: u32,
        max_retries: u32,
        timer: TimerConfig,
    ) -> Self {
        Self {
            send_base: first_seq,
            next_seq: first_seq,
            high_sent: first_seq,
            peer_ack,
            cwnd: 1,
            max_cwnd: max_cwnd.max(1),
            peer_window,
            in_flight: VecDeque::new(),
            pending: VecDeque::new(),
            recovery_point: None,
            probe_due: false,
            source_done: false,
            stopped: false,
            timer: RetransmitTimer::new(timer),
            deadline: None,
            retries: 0,
            max_retries,
            stats: TransferStats::default(),
        }
    }

    pub fn send_base(&self) -> u32 {
        self.send_base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn peer_window(&self) -> u16 {
        self.peer_window
    }

    /// Number of segments currently awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn retransmit_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// `true` when the source is exhausted and everything was acknowledged.
    pub fn is_complete(&self) -> bool {
        self.source_done && self.pending.is_empty() && self.in_flight.is_empty()
    }

    // -----------------------------------------------------------------------
    // Transmit path
    // -----------------------------------------------------------------------

    /// `true` when a freshly read chunk could be sent right away.
    pub fn needs_data(&self) -> bool {
        !self.stopped
            && !self.source_done
            && self.pending.is_empty()
            && self.can_transmit(self.next_seq)
    }

    /// Frame `payload` as the next data segment and queue it for sending.
    pub fn push_chunk(&mut self, payload: Vec<u8>) {
        let segment = Segment::data(self.next_seq, self.peer_ack, payload);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.pending.push_back(Outstanding {
            segment,
            tx_count: 0,
            sent_at: None,
        });
    }

    /// Record that the source reached end of input.
    pub fn finish_source(&mut self) {
        self.source_done = true;
    }

    /// Whether a segment with sequence `seq` may be put on the wire now.
    pub fn can_transmit(&self, seq: u32) -> bool {
        if self.peer_window == 0 {
            return self.probe_due && self.in_flight.is_empty() && seq == self.send_base;
        }
        let in_window = seq_distance(self.send_base, seq) < i32::from(self.peer_window);
        (self.in_flight.len() as u32) < self.cwnd && in_window
    }

    /// Take the next segment to transmit, marking it in flight.
    pub fn next_transmission(&mut self) -> Option<Segment> {
        if self.stopped {
            return None;
        }
        let seq = self.pending.front()?.seq();
        if !self.can_transmit(seq) {
            return None;
        }
        let mut entry = self.pending.pop_front()?;
        let now = Instant::now();

        entry.tx_count += 1;
        entry.sent_at = Some(now);
        self.stats.data_segments_sent += 1;
        if entry.tx_count > 1 {
            self.stats.retransmissions += 1;
        }
        if self.in_flight.is_empty() {
            self.deadline = Some(now + self.timer.rto());
        }
        if seq_le(self.high_sent, seq) {
            self.high_sent = seq.wrapping_add(1);
        }
        self.probe_due = false;

        let segment = entry.segment.clone();
        self.in_flight.push_back(entry);
        self.stats.peak_in_flight = self.stats.peak_in_flight.max(self.in_flight.len());
        Some(segment)
    }

    // -----------------------------------------------------------------------
    // Acknowledgement path
    // -----------------------------------------------------------------------

    /// Process an acknowledgement header (ACK or NAK).
    pub fn on_ack(&mut self, header: &Header) -> AckOutcome {
        let ack = header.ack;
        if !seq_le(self.send_base, ack) || !seq_le(ack, self.high_sent) {
            return AckOutcome::Ignored;
        }
        self.retries = 0;

        let acked = if ack != self.send_base {
            self.advance_to(ack, !header.has(flags::NAK))
        } else {
            0
        };

        let was_closed = self.peer_window == 0;
        self.peer_window = header.window;

        if header.has(flags::NAK) {
            if !self.in_flight.is_empty() && self.recovery_point != Some(ack) {
                self.recovery_point = Some(ack);
                self.reduce();
                self.requeue();
                return AckOutcome::Loss;
            }
            return if acked > 0 {
                AckOutcome::Advanced { acked }
            } else {
                AckOutcome::Duplicate
            };
        }

        if self.peer_window == 0 {
            // Everything still in flight was (or will be) refused.
            self.requeue();
            self.probe_due = false;
            self.deadline = if self.is_complete() {
                None
            } else {
                Some(Instant::now() + self.timer.rto())
            };
            return AckOutcome::Paused;
        }

        if was_closed {
            self.probe_due = false;
            if self.in_flight.is_empty() {
                self.deadline = None;
            }
            return AckOutcome::Reopened;
        }

        if acked > 0 {
            AckOutcome::Advanced { acked }
        } else {
            AckOutcome::Duplicate
        }
    }

    /// Drop every segment below `ack`; with `grow`, widen the window by one.
    fn advance_to(&mut self, ack: u32, grow: bool) -> usize {
        let mut acked = 0;
        let mut sample = None;
        while let Some(front) = self.in_flight.front() {
            if !seq_lt(front.seq(), ack) {
                break;
            }
            if let Some(entry) = self.in_flight.pop_front() {
                // Karn: only unambiguous samples.
                if entry.tx_count == 1 {
                    sample = entry.sent_at;
                }
                self.stats.bytes_acked += entry.segment.payload.len() as u64;
                acked += 1;
            }
        }
        // Segments requeued after a pause may already have been delivered.
        while let Some(front) = self.pending.front() {
            if !seq_lt(front.seq(), ack) {
                break;
            }
            if let Some(entry) = self.pending.pop_front() {
                self.stats.bytes_acked += entry.segment.payload.len() as u64;
                acked += 1;
            }
        }

        self.send_base = ack;
        if grow {
            self.cwnd = (self.cwnd + 1).min(self.max_cwnd);
        }
        self.recovery_point = None;

        if let Some(sent_at) = sample {
            self.timer.record_rtt_sample(sent_at.elapsed());
        } else {
            self.timer.reset();
        }
        self.deadline = if self.in_flight.is_empty() {
            None
        } else {
            Some(Instant::now() + self.timer.rto())
        };
        acked
    }

    /// Multiplicative decrease, floored at one segment.
    fn reduce(&mut self) {
        self.cwnd = (self.cwnd / 2).max(1);
        self.stats.loss_events += 1;
    }

    /// Move every in-flight segment back to the front of `pending`.
    fn requeue(&mut self) {
        while let Some(entry) = self.in_flight.pop_back() {
            self.pending.push_front(entry);
        }
        self.deadline = None;
    }

    // -----------------------------------------------------------------------
    // Timer path
    // -----------------------------------------------------------------------

    /// Handle expiry of [`retransmit_deadline`](Self::retransmit_deadline).
    pub fn on_timeout(&mut self) -> TimeoutOutcome {
        self.deadline = None;
        if self.in_flight.is_empty() && self.peer_window != 0 {
            return TimeoutOutcome::Nothing;
        }
        self.retries += 1;
        self.stats.timeouts += 1;
        if self.retries > self.max_retries {
            return TimeoutOutcome::Exhausted {
                retries: self.retries - 1,
            };
        }
        self.timer.back_off();
        self.requeue();

        if self.peer_window == 0 {
            self.probe_due = true;
            return TimeoutOutcome::Probe;
        }
        self.reduce();
        self.recovery_point = Some(self.send_base);
        TimeoutOutcome::Loss
    }
}
