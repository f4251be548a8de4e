//! Receive-side ordering, loss detection and flow control.
//!
//! [`RecvWindow`] classifies every inbound data segment against
//! `expected_next` and builds the acknowledgement to send back:
//!
//! | Segment                      | Disposition  | Reply                      |
//! |------------------------------|--------------|----------------------------|
//! | `seq < expected_next`        | `Duplicate`  | cumulative ACK             |
//! | queue full                   | `Refused`    | ACK, window 0              |
//! | `seq > expected_next`        | `Gap`        | ACK + NAK at expected_next |
//! | `seq == expected_next`       | `Accepted`   | cumulative ACK             |
//!
//! Rows are checked top to bottom, so a full queue always answers with a
//! zero window, never with a NAK.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use crate::packet::{flags, seq_lt, Segment};
use crate::queue::ReassemblyQueue;

/// What happened to one inbound data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    Duplicate,
    Refused,
    Gap,
}

/// Counters describing one receive session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    pub accepted: u64,
    pub bytes_accepted: u64,
    pub duplicates: u64,
    pub naks_sent: u64,
    pub zero_windows_sent: u64,
    pub window_updates: u64,
}

#[derive(Debug)]
pub struct RecvWindow {
    /// Next in-order sequence number.
    expected_next: u32,
    /// Sequence number carried by our acknowledgements.
    local_seq: u32,
    /// A zero window went out and no update has followed yet.
    zero_window_advertised: bool,
    stats: ReceiveStats,
}

impl RecvWindow {
    /// `expected_next` is the sender's ISN + 1 and `local_seq` our own
    /// ISN + 1, both taken from the completed handshake.
    pub fn new(expected_next: u32, local_seq: u32) -> Self {
        Self {
            expected_next,
            local_seq,
            zero_window_advertised: false,
            stats: ReceiveStats::default(),
        }
    }

    pub fn expected_next(&self) -> u32 {
        self.expected_next
    }

    pub fn stats(&self) -> ReceiveStats {
        self.stats
    }

    pub fn zero_window_advertised(&self) -> bool {
        self.zero_window_advertised
    }

    /// Classify `segment`, enqueueing it when it is the next in order.
    pub fn on_segment(&mut self, segment: Segment, queue: &ReassemblyQueue) -> Disposition {
        let seq = segment.header.seq;
        if seq_lt(seq, self.expected_next) {
            self.stats.duplicates += 1;
            return Disposition::Duplicate;
        }
        if queue.free_space() == 0 {
            return Disposition::Refused;
        }
        if seq != self.expected_next {
            return Disposition::Gap;
        }
        let len = segment.payload.len() as u64;
        if !queue.try_enqueue(segment) {
            return Disposition::Refused;
        }
        self.expected_next = self.expected_next.wrapping_add(1);
        self.stats.accepted += 1;
        self.stats.bytes_accepted += len;
        Disposition::Accepted
    }

    /// Acknowledgement answering a segment with the given disposition.
    pub fn reply(&mut self, disposition: Disposition, queue: &ReassemblyQueue) -> Segment {
        let mut flag_bits = flags::ACK;
        if disposition == Disposition::Gap {
            flag_bits |= flags::NAK;
            self.stats.naks_sent += 1;
        }
        self.ack(flag_bits, queue)
    }

    /// Unsolicited ACK re-opening the window, once a zero window was
    /// advertised and the consumer has freed space since.
    pub fn window_update(&mut self, queue: &ReassemblyQueue) -> Option<Segment> {
        if !self.zero_window_advertised || queue.free_space() == 0 {
            return None;
        }
        self.stats.window_updates += 1;
        Some(self.ack(flags::ACK, queue))
    }

    fn ack(&mut self, flag_bits: u8, queue: &ReassemblyQueue) -> Segment {
        let window = u16::try_from(queue.free_space()).unwrap_or(u16::MAX);
        self.zero_window_advertised = window == 0;
        if window == 0 {
            self.stats.zero_windows_sent += 1;
        }
        Segment::control(self.local_seq, self.expected_next, flag_bits, window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u32) -> Segment {
        Segment::data(seq, 5001, vec![seq as u8; 3])
    }

    #[test]
    fn in_order_segment_is_accepted() {
        let q = ReassemblyQueue::new(4);
        let mut w = RecvWindow::new(101, 5001);
        assert_eq!(w.on_segment(data(101), &q), Disposition::Accepted);
        let reply = w.reply(Disposition::Accepted, &q);
        assert_eq!(reply.header.ack, 102);
        assert_eq!(reply.header.seq, 5001);
        assert_eq!(reply.header.window, 3);
        assert!(!reply.header.has(flags::NAK));
        assert_eq!(q.len(), 1);
        assert_eq!(w.stats().bytes_accepted, 3);
    }

    #[test]
    fn gap_is_nakked_at_expected() {
        let q = ReassemblyQueue::new(4);
        let mut w = RecvWindow::new(101, 5001);
        assert_eq!(w.on_segment(data(103), &q), Disposition::Gap);
        let reply = w.reply(Disposition::Gap, &q);
        assert!(reply.header.has(flags::ACK | flags::NAK));
        assert_eq!(reply.header.ack, 101);
        assert!(q.is_empty());
        assert_eq!(w.stats().naks_sent, 1);
    }

    #[test]
    fn duplicate_gets_plain_ack() {
        let q = ReassemblyQueue::new(4);
        let mut w = RecvWindow::new(101, 5001);
        w.on_segment(data(101), &q);
        assert_eq!(w.on_segment(data(101), &q), Disposition::Duplicate);
        let reply = w.reply(Disposition::Duplicate, &q);
        assert!(!reply.header.has(flags::NAK));
        assert_eq!(reply.header.ack, 102);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn full_queue_refuses_with_zero_window_never_nak() {
        let q = ReassemblyQueue::new(1);
        let mut w = RecvWindow::new(101, 5001);
        w.on_segment(data(101), &q);
        // Both the next in-order and an out-of-order segment hit a full queue.
        for seq in [102, 104] {
            let d = w.on_segment(data(seq), &q);
            assert_eq!(d, Disposition::Refused);
            let reply = w.reply(d, &q);
            assert_eq!(reply.header.window, 0);
            assert!(!reply.header.has(flags::NAK));
        }
        assert_eq!(w.stats().naks_sent, 0);
        assert_eq!(w.expected_next(), 102);
        assert!(w.zero_window_advertised());
    }

    #[test]
    fn window_update_follows_zero_window() {
        let q = ReassemblyQueue::new(1);
        let mut w = RecvWindow::new(101, 5001);
        assert!(w.window_update(&q).is_none());
        w.on_segment(data(101), &q);
        w.reply(Disposition::Accepted, &q);
        assert!(w.window_update(&q).is_none(), "still full");
        q.try_dequeue();
        let update = w.window_update(&q).unwrap();
        assert_eq!(update.header.window, 1);
        assert_eq!(update.header.ack, 102);
        assert!(!w.zero_window_advertised());
        assert!(w.window_update(&q).is_none());
    }

    #[test]
    fn sequence_wraps() {
        let q = ReassemblyQueue::new(4);
        let mut w = RecvWindow::new(u32::MAX, 0);
        assert_eq!(w.on_segment(data(u32::MAX), &q), Disposition::Accepted);
        assert_eq!(w.on_segment(data(0), &q), Disposition::Accepted);
        assert_eq!(w.on_segment(data(u32::MAX), &q), Disposition::Duplicate);
        assert_eq!(w.expected_next(), 1);
    }
}
