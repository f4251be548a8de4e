//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the handshake and teardown of one peer-to-peer
//! session.  It drives the pure [`StateMachine`] from the socket and
//! supplies the bounded retry loops around every control exchange:
//!
//! ```text
//!  sender (connect / close)                receiver (accept / finish)
//!  ── SYN ───────────────────────────────▶
//!  ◀─────────────────────────── SYN+ACK ──   window = queue capacity
//!  ── ACK (or first DATA) ───────────────▶
//!              ... data transfer (sender / receiver engines) ...
//!  ── FIN ───────────────────────────────▶
//!  ◀─────────────────────────────── ACK ──
//!  ◀─────────────────────────── FIN+ACK ──   after the consumer flushed
//!  ── ACK ───────────────────────────────▶
//! ```
//!
//! Every exchange re-sends its control segment when a reply does not match
//! (protocol violation) or an attempt times out, up to a fixed number of
//! attempts.  Handshake exhaustion is fatal; teardown exhaustion only logs a
//! warning, because the data has already been delivered.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::packet::{flags, Segment};
use crate::socket::Socket;
use crate::state::{ConnectionState, FinProgress, ProtocolViolation, StateMachine};

// ---------------------------------------------------------------------------
// Control exchanges
// ---------------------------------------------------------------------------

/// How a reply to an outstanding control segment is handled.
enum Reply<T> {
    /// The exchange is complete.
    Done(T),
    /// The peer acknowledged the control segment but the exchange is not
    /// over yet: stop re-sending and wait for the rest.
    Progress,
    /// The peer repeated itself because our reply was lost; re-send.
    Retransmit,
    /// Not relevant to this exchange.
    Ignore,
    Violation(ProtocolViolation),
}

enum Exchange<T> {
    Done(T),
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    attempts: u32,
    timeout: Duration,
    /// Wait for the rest of the exchange after [`Reply::Progress`].
    patience: Duration,
}

/// Send `control` and feed replies from `peer` into `on_reply` until it
/// reports completion or every attempt timed out.
async fn exchange<T>(
    socket: &Socket,
    peer: SocketAddr,
    control: &Segment,
    retry: Retry,
    mut on_reply: impl FnMut(&Segment) -> Reply<T>,
) -> Result<Exchange<T>> {
    let mut attempt = 0;
    let mut resend = true;
    let mut progressed = false;
    let mut deadline = Instant::now();

    loop {
        if resend {
            if attempt == retry.attempts {
                return Ok(Exchange::Exhausted);
            }
            attempt += 1;
            socket.send_to(control, peer).await?;
            log::debug!("[conn] → {control} (attempt {attempt}/{})", retry.attempts);
            deadline = Instant::now() + retry.timeout;
            resend = false;
        }

        let (segment, from) = match timeout_at(deadline, socket.recv_segment()).await {
            Ok(received) => received?,
            Err(_) if progressed => return Ok(Exchange::Exhausted),
            Err(_) => {
                resend = true;
                continue;
            }
        };
        if from != peer {
            log::debug!("[conn] ← {segment} from stranger {from}; dropped");
            continue;
        }
        log::debug!("[conn] ← {segment}");

        match on_reply(&segment) {
            Reply::Done(value) => return Ok(Exchange::Done(value)),
            Reply::Progress => {
                if !progressed {
                    progressed = true;
                    deadline = Instant::now() + retry.patience;
                }
            }
            Reply::Retransmit => {
                socket.send_to(control, peer).await?;
                log::debug!("[conn] → {control} (peer repeated itself)");
            }
            Reply::Ignore => {}
            Reply::Violation(v) => {
                log::debug!("[conn] {v}");
                if !progressed {
                    socket.send_to(control, peer).await?;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A handle to one reliable connection over UDP.
#[derive(Debug)]
pub struct Connection {
    fsm: StateMachine,
    socket: Arc<Socket>,
    peer: SocketAddr,
    /// Window advertised by the peer during the handshake.
    peer_window: u16,
    config: TransferConfig,
    /// Data or FIN segment that completed a passive open implicitly.
    pending: Option<Segment>,
}

impl Connection {
    /// Active open: run the three-way handshake with `peer`.
    ///
    /// Fails with [`TransferError::HandshakeFailed`] after
    /// `config.handshake_attempts` unanswered SYNs.
    pub async fn connect(
        socket: Arc<Socket>,
        peer: SocketAddr,
        config: TransferConfig,
    ) -> Result<Self> {
        let mut fsm = StateMachine::new(config.isn(), 0);
        let syn = fsm.syn();
        let retry = config.handshake_retry();

        let outcome = exchange(&socket, peer, &syn, retry, |seg| match fsm.on_syn_ack(seg) {
            Ok(ack) => Reply::Done((ack, seg.header.window)),
            Err(v) => Reply::Violation(v),
        })
        .await?;

        let (ack, peer_window) = match outcome {
            Exchange::Done(done) => done,
            Exchange::Exhausted => {
                log::warn!("[conn] no SYN+ACK from {peer}; giving up");
                return Err(TransferError::HandshakeFailed {
                    attempts: retry.attempts,
                });
            }
        };
        socket.send_to(&ack, peer).await?;
        log::info!(
            "[conn] established with {peer} (isn={}, peer isn={}, window={peer_window})",
            fsm.isn(),
            fsm.peer_seq().wrapping_sub(1)
        );

        Ok(Self {
            fsm,
            socket,
            peer,
            peer_window,
            config,
            pending: None,
        })
    }

    /// Passive open: wait for a SYN and complete the handshake, advertising
    /// `capacity` free slots.
    pub async fn accept(
        socket: Arc<Socket>,
        capacity: usize,
        config: TransferConfig,
    ) -> Result<Self> {
        let window = u16::try_from(capacity).unwrap_or(u16::MAX);
        let mut fsm = StateMachine::new(config.isn(), window);
        let listen_deadline = config.accept_timeout.map(|t| Instant::now() + t);

        let (syn_ack, peer) = loop {
            let received = match listen_deadline {
                Some(deadline) => match timeout_at(deadline, socket.recv_segment()).await {
                    Ok(received) => received,
                    Err(_) => {
                        return Err(TransferError::IdleTimeout {
                            after: config.accept_timeout.unwrap_or_default(),
                        })
                    }
                },
                None => socket.recv_segment().await,
            };
            let (segment, from) = received?;
            match fsm.on_syn(&segment) {
                Ok(syn_ack) => {
                    log::debug!("[conn] ← {segment} from {from}");
                    break (syn_ack, from);
                }
                Err(v) => log::debug!("[conn] listening, ignored {segment} from {from}: {v}"),
            }
        };

        let retry = config.handshake_retry();
        let outcome = exchange(&socket, peer, &syn_ack, retry, |seg| {
            if seg.header.has(flags::SYN) {
                return match fsm.on_syn(seg) {
                    Ok(_) => Reply::Retransmit,
                    Err(v) => Reply::Violation(v),
                };
            }
            match fsm.on_handshake_ack(seg) {
                Ok(()) if seg.is_data() || seg.header.has(flags::FIN) => {
                    Reply::Done(Some(seg.clone()))
                }
                Ok(()) => Reply::Done(None),
                Err(v) => Reply::Violation(v),
            }
        })
        .await?;

        let pending = match outcome {
            Exchange::Done(pending) => pending,
            Exchange::Exhausted => {
                log::warn!("[conn] handshake with {peer} never completed");
                return Err(TransferError::HandshakeFailed {
                    attempts: retry.attempts,
                });
            }
        };
        if pending.is_some() {
            log::debug!("[conn] handshake ACK lost; completed by first segment");
        }
        log::info!("[conn] accepted {peer} (isn={}, window={window})", fsm.isn());

        Ok(Self {
            fsm,
            socket,
            peer,
            peer_window: 0,
            config,
            pending,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.fsm.state()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Our initial sequence number.
    pub fn isn(&self) -> u32 {
        self.fsm.isn()
    }

    /// Next sequence number this side sends.
    pub fn local_seq(&self) -> u32 {
        self.fsm.local_seq()
    }

    /// Next sequence number expected from the peer.
    pub fn peer_seq(&self) -> u32 {
        self.fsm.peer_seq()
    }

    pub fn peer_window(&self) -> u16 {
        self.peer_window
    }

    /// Segment that arrived in place of the final handshake ACK, if any.
    pub fn take_pending(&mut self) -> Option<Segment> {
        self.pending.take()
    }

    /// The ACK completing our active open, for re-sending when the peer
    /// repeats its SYN+ACK.
    pub fn handshake_ack(&self) -> Segment {
        self.fsm.handshake_ack()
    }

    pub fn set_window(&mut self, window: u16) {
        self.fsm.set_window(window);
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Sender-side graceful close with FIN at `fin_seq`.
    ///
    /// Waits for the peer's FIN+ACK, answers it with the final ACK and then
    /// lingers for one teardown timeout, re-acknowledging repeated FINs.
    pub async fn close(&mut self, fin_seq: u32) -> Result<()> {
        let fin = self
            .fin(fin_seq)
            .ok_or(TransferError::BadState(self.fsm.state()))?;
        let retry = self.config.teardown_retry();
        let fsm = &mut self.fsm;

        let outcome = exchange(&self.socket, self.peer, &fin, retry, |seg| {
            match fsm.on_fin_reply(seg) {
                Ok(FinProgress::FinAcked) => Reply::Progress,
                Ok(FinProgress::Closed(last_ack)) => Reply::Done(last_ack),
                Err(v) => Reply::Violation(v),
            }
        })
        .await?;

        let last_ack = match outcome {
            Exchange::Done(last_ack) => last_ack,
            Exchange::Exhausted => {
                log::warn!("[conn] teardown with {} incomplete; force-closing", self.peer);
                self.fsm.force_close();
                return Ok(());
            }
        };
        self.socket.send_to(&last_ack, self.peer).await?;
        log::debug!("[conn] → {last_ack} (final)");

        let linger_until = Instant::now() + self.config.teardown_timeout;
        while let Ok(received) = timeout_at(linger_until, self.socket.recv_segment()).await {
            let (segment, from) = received?;
            if from != self.peer {
                continue;
            }
            if let Ok(FinProgress::Closed(ack)) = self.fsm.on_fin_reply(&segment) {
                log::debug!("[conn] ← {segment} again; → {ack}");
                self.socket.send_to(&ack, self.peer).await?;
            }
        }
        log::info!("[conn] closed");
        Ok(())
    }

    /// Abortive close from the receiving side: send FIN and wait only for
    /// its acknowledgement.
    pub async fn abandon(&mut self) -> Result<()> {
        let fin = self
            .fin(self.fsm.local_seq())
            .ok_or(TransferError::BadState(self.fsm.state()))?;
        let retry = self.config.teardown_retry();
        let fsm = &mut self.fsm;

        let outcome = exchange(&self.socket, self.peer, &fin, retry, |seg| {
            match fsm.on_fin_reply(seg) {
                Ok(_) => Reply::Done(()),
                // Data and ACKs still in flight toward us.
                Err(_) if !seg.header.has(flags::FIN) => Reply::Ignore,
                Err(v) => Reply::Violation(v),
            }
        })
        .await?;
        if let Exchange::Exhausted = outcome {
            log::warn!("[conn] FIN to {} never acknowledged", self.peer);
        }
        self.fsm.force_close();
        Ok(())
    }

    /// Drop to CLOSED without a FIN exchange.
    pub fn force_close(&mut self) {
        self.fsm.force_close();
    }

    fn fin(&mut self, seq: u32) -> Option<Segment> {
        match self.fsm.fin(seq) {
            Ok(fin) => Some(fin),
            Err(v) => {
                log::warn!("[conn] {v}");
                None
            }
        }
    }

    /// Receiver side: acknowledge the peer's FIN (first or repeated).
    ///
    /// Returns `false` when `segment` is not an acceptable FIN.
    pub async fn acknowledge_fin(&mut self, segment: &Segment) -> Result<bool> {
        match self.fsm.on_fin(segment) {
            Ok(ack) => {
                self.socket.send_to(&ack, self.peer).await?;
                log::debug!("[conn] ← {segment}; → {ack}");
                Ok(true)
            }
            Err(v) => {
                log::debug!("[conn] {v}");
                Ok(false)
            }
        }
    }

    /// Receiver side: send our own FIN after the peer's FIN and wait for the
    /// last ACK.
    pub async fn finish(&mut self) -> Result<()> {
        let fin = self.fsm.own_fin().map_err(|v| {
            log::warn!("[conn] {v}");
            TransferError::BadState(v.state)
        })?;
        let retry = self.config.teardown_retry();
        let fsm = &mut self.fsm;

        let outcome = exchange(&self.socket, self.peer, &fin, retry, |seg| {
            if seg.header.has(flags::FIN) {
                // Our ACK of the peer's FIN was lost; FIN+ACK covers it too.
                return Reply::Retransmit;
            }
            match fsm.on_last_ack(seg) {
                Ok(()) => Reply::Done(()),
                Err(v) => Reply::Violation(v),
            }
        })
        .await?;

        match outcome {
            Exchange::Done(()) => log::info!("[conn] closed"),
            Exchange::Exhausted => {
                log::warn!("[conn] last ACK from {} never arrived; force-closing", self.peer);
                self.fsm.force_close();
            }
        }
        Ok(())
    }
}

impl TransferConfig {
    fn handshake_retry(&self) -> Retry {
        Retry {
            attempts: self.handshake_attempts.max(1),
            timeout: self.handshake_timeout,
            patience: self.handshake_timeout,
        }
    }

    fn teardown_retry(&self) -> Retry {
        Retry {
            attempts: self.teardown_attempts.max(1),
            timeout: self.teardown_timeout,
            patience: self.idle_timeout,
        }
    }
}
