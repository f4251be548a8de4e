//! Connection finite-state machine.
//!
//! [`StateMachine`] validates every handshake and teardown segment against
//! the values expected in the current state and builds the control segment
//! to send in reply.  It performs no I/O; [`crate::connection::Connection`]
//! drives it from the socket and owns the retry loops.
//!
//! ```text
//!  sender                                   receiver
//!  CLOSED ──SYN──▶ SYN_SENT                 CLOSED ──SYN──▶ SYN_RCVD
//!  SYN_SENT ──SYN+ACK──▶ ESTABLISHED        SYN_RCVD ──ACK──▶ ESTABLISHED
//!  ESTABLISHED ──FIN──▶ FIN_SENT            ESTABLISHED ──FIN──▶ FIN_RCVD
//!  FIN_SENT ──FIN+ACK──▶ CLOSED             FIN_RCVD ──own FIN, ACK──▶ CLOSED
//! ```
//!
//! A segment that does not match is reported as a [`ProtocolViolation`] and
//! leaves the state untouched; the caller re-sends its last control segment.

use thiserror::Error;

use crate::packet::{flags, Segment};

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection exists; initial and final state.
    #[default]
    Closed,
    /// SYN has been sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received; SYN+ACK sent; waiting for ACK.
    SynReceived,
    /// Handshake complete; data transfer in progress.
    Established,
    /// Local side sent FIN; waiting for the peer's FIN+ACK.
    FinSent,
    /// Peer's FIN received and acknowledged; local FIN pending or unacknowledged.
    FinReceived,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::FinSent => "FIN_SENT",
            Self::FinReceived => "FIN_RCVD",
        };
        f.write_str(name)
    }
}

/// A segment that does not fit the exchange in progress.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("protocol violation in {state}: {reason}")]
pub struct ProtocolViolation {
    pub state: ConnectionState,
    pub reason: String,
}

/// Result of feeding a reply to our FIN into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinProgress {
    /// The peer acknowledged our FIN; its own FIN is still outstanding.
    FinAcked,
    /// The peer's FIN+ACK arrived.  The enclosed final ACK must be sent.
    Closed(Segment),
}

/// Handshake and teardown bookkeeping for one side of a connection.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ConnectionState,
    /// Initial sequence number chosen by this side.
    isn: u32,
    /// Next sequence number this side will use.
    local_seq: u32,
    /// Next sequence number expected from the peer.
    peer_seq: u32,
    /// Window advertised in outbound control segments.
    window: u16,
    /// Sequence number of our FIN, once sent.
    fin_seq: Option<u32>,
    fin_acked: bool,
}

impl StateMachine {
    pub fn new(isn: u32, window: u16) -> Self {
        Self {
            state: ConnectionState::Closed,
            isn,
            local_seq: isn,
            peer_seq: 0,
            window,
            fin_seq: None,
            fin_acked: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn isn(&self) -> u32 {
        self.isn
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    pub fn peer_seq(&self) -> u32 {
        self.peer_seq
    }

    pub fn set_window(&mut self, window: u16) {
        self.window = window;
    }

    pub fn fin_acked(&self) -> bool {
        self.fin_acked
    }

    fn violation(&self, reason: impl Into<String>) -> ProtocolViolation {
        ProtocolViolation {
            state: self.state,
            reason: reason.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Active open (sender)
    // -----------------------------------------------------------------------

    /// Build (or rebuild, on retry) the SYN and enter `SYN_SENT`.
    pub fn syn(&mut self) -> Segment {
        self.state = ConnectionState::SynSent;
        Segment::control(self.isn, 0, flags::SYN, self.window)
    }

    /// Validate a SYN+ACK.  On success the connection is established and the
    /// returned ACK completes the handshake.
    ///
    /// A repeated SYN+ACK after establishment (our ACK was lost) yields the
    /// same ACK again without changing state.
    pub fn on_syn_ack(&mut self, seg: &Segment) -> Result<Segment, ProtocolViolation> {
        let h = &seg.header;
        if !h.has(flags::SYN | flags::ACK) {
            return Err(self.violation(format!("expected SYN+ACK, got {seg}")));
        }
        let expected = self.isn.wrapping_add(1);
        if h.ack != expected {
            return Err(self.violation(format!("SYN+ACK acks {} but expected {expected}", h.ack)));
        }
        match self.state {
            ConnectionState::SynSent => {
                self.peer_seq = h.seq.wrapping_add(1);
                self.local_seq = expected;
                self.state = ConnectionState::Established;
                Ok(self.handshake_ack())
            }
            ConnectionState::Established if h.seq.wrapping_add(1) == self.peer_seq => {
                Ok(self.handshake_ack())
            }
            _ => Err(self.violation("unexpected SYN+ACK")),
        }
    }

    /// Final ACK of the three-way handshake.
    pub fn handshake_ack(&self) -> Segment {
        Segment::control(self.local_seq, self.peer_seq, flags::ACK, self.window)
    }

    // -----------------------------------------------------------------------
    // Passive open (receiver)
    // -----------------------------------------------------------------------

    /// Accept a SYN and enter `SYN_RCVD`, returning the SYN+ACK to send.
    ///
    /// A duplicate of the same SYN while in `SYN_RCVD` returns the SYN+ACK
    /// again (our reply was lost).
    pub fn on_syn(&mut self, seg: &Segment) -> Result<Segment, ProtocolViolation> {
        let h = &seg.header;
        if !h.has(flags::SYN) || h.has(flags::ACK) {
            return Err(self.violation(format!("expected SYN, got {seg}")));
        }
        match self.state {
            ConnectionState::Closed => {
                self.peer_seq = h.seq.wrapping_add(1);
                self.state = ConnectionState::SynReceived;
                Ok(self.syn_ack())
            }
            ConnectionState::SynReceived if h.seq.wrapping_add(1) == self.peer_seq => {
                Ok(self.syn_ack())
            }
            _ => Err(self.violation(format!("unexpected SYN seq={}", h.seq))),
        }
    }

    pub fn syn_ack(&self) -> Segment {
        Segment::control(
            self.isn,
            self.peer_seq,
            flags::SYN | flags::ACK,
            self.window,
        )
    }

    /// Validate the ACK that completes the handshake.
    ///
    /// The first data segment (or an immediate FIN) also qualifies: it carries
    /// the same ACK field, and arrives first when the pure ACK was lost.
    pub fn on_handshake_ack(&mut self, seg: &Segment) -> Result<(), ProtocolViolation> {
        if self.state != ConnectionState::SynReceived {
            return Err(self.violation("no handshake in progress"));
        }
        let h = &seg.header;
        let expected_ack = self.isn.wrapping_add(1);
        if !h.has(flags::ACK) || h.has(flags::SYN) || h.has(flags::NAK) {
            return Err(self.violation(format!("expected handshake ACK, got {seg}")));
        }
        if h.ack != expected_ack {
            return Err(self.violation(format!("ACK {} but expected {expected_ack}", h.ack)));
        }
        if h.seq != self.peer_seq {
            return Err(self.violation(format!(
                "ACK carries seq {} but expected {}",
                h.seq, self.peer_seq
            )));
        }
        self.local_seq = expected_ack;
        self.state = ConnectionState::Established;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Build our FIN at `seq` and enter `FIN_SENT`.
    ///
    /// Valid from `ESTABLISHED` (first send) and `FIN_SENT` (retransmit).
    pub fn fin(&mut self, seq: u32) -> Result<Segment, ProtocolViolation> {
        match self.state {
            ConnectionState::Established | ConnectionState::FinSent => {
                self.state = ConnectionState::FinSent;
                self.fin_seq = Some(seq);
                Ok(Segment::control(
                    seq,
                    self.peer_seq,
                    flags::FIN | flags::ACK,
                    self.window,
                ))
            }
            _ => Err(self.violation("cannot send FIN")),
        }
    }

    /// Validate a reply to our FIN.
    ///
    /// A plain ACK of the FIN yields [`FinProgress::FinAcked`]; the peer's
    /// own FIN+ACK closes the connection.  A repeated peer FIN after closing
    /// yields the final ACK again.
    pub fn on_fin_reply(&mut self, seg: &Segment) -> Result<FinProgress, ProtocolViolation> {
        let Some(fin_seq) = self.fin_seq else {
            return Err(self.violation("no FIN outstanding"));
        };
        let h = &seg.header;
        let expected = fin_seq.wrapping_add(1);
        match self.state {
            ConnectionState::FinSent => {
                if !h.has(flags::ACK) || h.ack != expected || h.has(flags::NAK) {
                    return Err(self.violation(format!(
                        "expected ACK of FIN ({expected}), got {seg}"
                    )));
                }
                self.fin_acked = true;
                if h.has(flags::FIN) {
                    self.peer_seq = h.seq.wrapping_add(1);
                    self.local_seq = expected;
                    self.state = ConnectionState::Closed;
                    Ok(FinProgress::Closed(self.final_ack()))
                } else {
                    Ok(FinProgress::FinAcked)
                }
            }
            ConnectionState::Closed
                if h.has(flags::FIN) && h.seq.wrapping_add(1) == self.peer_seq =>
            {
                Ok(FinProgress::Closed(self.final_ack()))
            }
            _ => Err(self.violation(format!("unexpected {seg}"))),
        }
    }

    fn final_ack(&self) -> Segment {
        Segment::control(self.local_seq, self.peer_seq, flags::ACK, self.window)
    }

    /// Accept the peer's FIN and enter `FIN_RCVD`, returning the ACK to send.
    ///
    /// The FIN ends the stream wherever it lands: `peer_seq` becomes
    /// `seq + 1`.  A duplicate of the same FIN re-yields the ACK.
    pub fn on_fin(&mut self, seg: &Segment) -> Result<Segment, ProtocolViolation> {
        let h = &seg.header;
        if !h.has(flags::FIN) {
            return Err(self.violation(format!("expected FIN, got {seg}")));
        }
        match self.state {
            ConnectionState::Established => {
                self.peer_seq = h.seq.wrapping_add(1);
                self.state = ConnectionState::FinReceived;
                Ok(self.final_ack())
            }
            ConnectionState::FinReceived if h.seq.wrapping_add(1) == self.peer_seq => {
                Ok(self.final_ack())
            }
            _ => Err(self.violation(format!("unexpected FIN seq={}", h.seq))),
        }
    }

    /// Build this side's FIN after the peer's FIN was acknowledged.
    pub fn own_fin(&mut self) -> Result<Segment, ProtocolViolation> {
        if self.state != ConnectionState::FinReceived {
            return Err(self.violation("peer FIN not yet received"));
        }
        self.fin_seq = Some(self.local_seq);
        Ok(Segment::control(
            self.local_seq,
            self.peer_seq,
            flags::FIN | flags::ACK,
            self.window,
        ))
    }

    /// Validate the last ACK of the teardown (receiver side).
    pub fn on_last_ack(&mut self, seg: &Segment) -> Result<(), ProtocolViolation> {
        let Some(fin_seq) = self.fin_seq else {
            return Err(self.violation("own FIN not sent"));
        };
        if self.state != ConnectionState::FinReceived {
            return Err(self.violation("not awaiting the last ACK"));
        }
        let h = &seg.header;
        let expected = fin_seq.wrapping_add(1);
        if !h.has(flags::ACK) || h.has(flags::FIN) || h.ack != expected {
            return Err(self.violation(format!("expected ACK {expected}, got {seg}")));
        }
        self.local_seq = expected;
        self.fin_acked = true;
        self.state = ConnectionState::Closed;
        Ok(())
    }

    /// Drop straight to `CLOSED` (retry budget exhausted or fatal error).
    pub fn force_close(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a clean handshake and return (sender, receiver) machines.
    fn established() -> (StateMachine, StateMachine) {
        let mut tx = StateMachine::new(100, 0);
        let mut rx = StateMachine::new(5000, 16);
        let syn = tx.syn();
        let syn_ack = rx.on_syn(&syn).unwrap();
        let ack = tx.on_syn_ack(&syn_ack).unwrap();
        rx.on_handshake_ack(&ack).unwrap();
        (tx, rx)
    }

    #[test]
    fn clean_handshake_establishes_both_sides() {
        let (tx, rx) = established();
        assert_eq!(tx.state(), ConnectionState::Established);
        assert_eq!(rx.state(), ConnectionState::Established);
        assert_eq!(tx.local_seq(), 101);
        assert_eq!(rx.peer_seq(), 101);
        assert_eq!(tx.peer_seq(), 5001);
        assert_eq!(rx.local_seq(), 5001);
    }

    #[test]
    fn syn_ack_with_wrong_ack_is_violation() {
        let mut tx = StateMachine::new(100, 0);
        tx.syn();
        let bogus = Segment::control(7, 999, flags::SYN | flags::ACK, 4);
        let err = tx.on_syn_ack(&bogus).unwrap_err();
        assert_eq!(err.state, ConnectionState::SynSent);
        assert_eq!(tx.state(), ConnectionState::SynSent);
    }

    #[test]
    fn plain_ack_in_syn_sent_is_violation() {
        let mut tx = StateMachine::new(100, 0);
        tx.syn();
        assert!(tx.on_syn_ack(&Segment::control(7, 101, flags::ACK, 4)).is_err());
        assert_eq!(tx.state(), ConnectionState::SynSent);
    }

    #[test]
    fn duplicate_syn_ack_re_yields_handshake_ack() {
        let mut tx = StateMachine::new(100, 0);
        let mut rx = StateMachine::new(5000, 16);
        let syn_ack = rx.on_syn(&tx.syn()).unwrap();
        let first = tx.on_syn_ack(&syn_ack).unwrap();
        let again = tx.on_syn_ack(&syn_ack).unwrap();
        assert_eq!(first, again);
        assert_eq!(tx.state(), ConnectionState::Established);
    }

    #[test]
    fn duplicate_syn_re_yields_syn_ack() {
        let mut tx = StateMachine::new(100, 0);
        let mut rx = StateMachine::new(5000, 16);
        let syn = tx.syn();
        let first = rx.on_syn(&syn).unwrap();
        let again = rx.on_syn(&syn).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.header.window, 16);
        // A SYN with a different ISN is a stray.
        assert!(rx.on_syn(&Segment::control(555, 0, flags::SYN, 0)).is_err());
    }

    #[test]
    fn first_data_segment_completes_handshake() {
        let mut tx = StateMachine::new(100, 0);
        let mut rx = StateMachine::new(5000, 16);
        let syn_ack = rx.on_syn(&tx.syn()).unwrap();
        tx.on_syn_ack(&syn_ack).unwrap();
        let data = Segment::data(tx.local_seq(), tx.peer_seq(), b"x".to_vec());
        rx.on_handshake_ack(&data).unwrap();
        assert_eq!(rx.state(), ConnectionState::Established);
    }

    #[test]
    fn handshake_ack_with_wrong_seq_is_violation() {
        let mut tx = StateMachine::new(100, 0);
        let mut rx = StateMachine::new(5000, 16);
        rx.on_syn(&tx.syn()).unwrap();
        // Second data segment overtook the first: seq is one too far.
        let data = Segment::data(102, 5001, b"y".to_vec());
        assert!(rx.on_handshake_ack(&data).is_err());
        assert_eq!(rx.state(), ConnectionState::SynReceived);
    }

    #[test]
    fn full_teardown_closes_both_sides() {
        let (mut tx, mut rx) = established();
        let fin = tx.fin(108).unwrap();
        assert_eq!(tx.state(), ConnectionState::FinSent);

        let ack = rx.on_fin(&fin).unwrap();
        assert_eq!(rx.state(), ConnectionState::FinReceived);
        assert_eq!(ack.header.ack, 109);
        assert_eq!(tx.on_fin_reply(&ack).unwrap(), FinProgress::FinAcked);
        assert_eq!(tx.state(), ConnectionState::FinSent);

        let rx_fin = rx.own_fin().unwrap();
        let last = match tx.on_fin_reply(&rx_fin).unwrap() {
            FinProgress::Closed(last) => last,
            other => panic!("expected Closed, got {other:?}"),
        };
        assert_eq!(tx.state(), ConnectionState::Closed);

        rx.on_last_ack(&last).unwrap();
        assert_eq!(rx.state(), ConnectionState::Closed);
    }

    #[test]
    fn fin_ack_alone_closes_sender() {
        let (mut tx, mut rx) = established();
        let fin = tx.fin(101).unwrap();
        rx.on_fin(&fin).unwrap();
        let rx_fin = rx.own_fin().unwrap();
        assert!(matches!(tx.on_fin_reply(&rx_fin), Ok(FinProgress::Closed(_))));
        // A retransmitted peer FIN after closing is re-acknowledged.
        assert!(matches!(tx.on_fin_reply(&rx_fin), Ok(FinProgress::Closed(_))));
    }

    #[test]
    fn stale_ack_during_fin_sent_is_violation() {
        let (mut tx, _) = established();
        tx.fin(110).unwrap();
        let stale = Segment::control(5001, 105, flags::ACK, 4);
        assert!(tx.on_fin_reply(&stale).is_err());
        assert_eq!(tx.state(), ConnectionState::FinSent);
        assert!(!tx.fin_acked());
    }

    #[test]
    fn duplicate_fin_re_yields_ack() {
        let (mut tx, mut rx) = established();
        let fin = tx.fin(104).unwrap();
        let first = rx.on_fin(&fin).unwrap();
        let again = rx.on_fin(&fin).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn own_fin_requires_peer_fin() {
        let (_, mut rx) = established();
        assert!(rx.own_fin().is_err());
    }

    #[test]
    fn last_ack_must_cover_own_fin() {
        let (mut tx, mut rx) = established();
        rx.on_fin(&tx.fin(101).unwrap()).unwrap();
        rx.own_fin().unwrap();
        let wrong = Segment::control(102, 5000, flags::ACK, 0);
        assert!(rx.on_last_ack(&wrong).is_err());
        assert_eq!(rx.state(), ConnectionState::FinReceived);
    }

    #[test]
    fn fin_not_allowed_before_establishment() {
        let mut tx = StateMachine::new(1, 0);
        assert!(tx.fin(2).is_err());
        tx.syn();
        assert!(tx.fin(2).is_err());
    }

    #[test]
    fn display_uses_protocol_names() {
        assert_eq!(ConnectionState::SynReceived.to_string(), "SYN_RCVD");
        assert_eq!(ConnectionState::FinSent.to_string(), "FIN_SENT");
    }
}
