//! Sending side of a file transfer.
//!
//! [`SenderEngine::transfer`] runs the whole session: handshake, windowed
//! data transfer, teardown.  During the data phase two tasks share one
//! [`SendWindow`] behind a mutex:
//!
//! ```text
//!   source ──read_chunk──▶ transmitter ──DATA──▶ socket ──▶ receiver
//!                             ▲  │
//!                       wake  │  │ lock
//!                             │  ▼
//!                        ┌──────────────┐
//!                        │  SendWindow  │  cwnd, in_flight, pending, RTO
//!                        └──────────────┘
//!                             ▲  │
//!                        lock │  │ deadline
//!                             │  ▼
//!   receiver ──ACK/NAK──▶ ack processor (spawned) ◀── retransmit timer
//! ```
//!
//! Neither task holds the lock across an `.await`; the ack processor wakes
//! the transmitter through a [`Notify`] after every state change.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use crate::abort::AbortSignal;
use crate::chunk::read_chunk;
use crate::config::TransferConfig;
use crate::connection::Connection;
use crate::error::{Result, TransferError};
use crate::packet::{flags, Segment};
use crate::send_window::{AckOutcome, SendWindow, TimeoutOutcome, TransferStats};
use crate::socket::Socket;

/// Stand-in deadline while no retransmission timer is armed.
const DISARMED: Duration = Duration::from_secs(86_400);

/// Result of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    /// Source bytes acknowledged by the receiver, retransmissions excluded.
    pub bytes_sent: u64,
    pub stats: TransferStats,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    window: Mutex<SendWindow>,
    /// Transmitter wake-up: the window changed.
    wake: Notify,
    /// Ack processor wake-up: a send armed the retransmission timer.
    rearm: Notify,
    /// Ack processor shutdown request.
    shutdown: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SendWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Step {
    Send {
        segment: Segment,
        cwnd: u32,
        in_flight: usize,
        armed: bool,
    },
    Read,
    Wait,
    Done,
    Stop,
}

// ---------------------------------------------------------------------------
// SenderEngine
// ---------------------------------------------------------------------------

pub struct SenderEngine {
    socket: Arc<Socket>,
    config: TransferConfig,
    abort: AbortSignal,
}

impl SenderEngine {
    pub fn new(socket: Arc<Socket>, config: TransferConfig) -> Self {
        Self {
            socket,
            config,
            abort: AbortSignal::new(),
        }
    }

    /// Share an externally owned abort signal.
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Send at most `total_bytes` from `source` to `dest`.
    ///
    /// Returns the number of bytes the receiver acknowledged.
    pub async fn transfer<R>(&self, source: R, dest: SocketAddr, total_bytes: u64) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        Ok(self
            .transfer_with_report(source, dest, total_bytes)
            .await?
            .bytes_sent)
    }

    /// Like [`transfer`](Self::transfer), returning the session statistics too.
    pub async fn transfer_with_report<R>(
        &self,
        source: R,
        dest: SocketAddr,
        total_bytes: u64,
    ) -> Result<TransferReport>
    where
        R: AsyncRead + Unpin,
    {
        let mut conn = Connection::connect(Arc::clone(&self.socket), dest, self.config.clone()).await?;

        let window = SendWindow::new(
            conn.local_seq(),
            conn.peer_seq(),
            conn.peer_window(),
            self.config.max_congestion_window,
            self.config.max_retries,
            self.config.timer(),
        );
        let shared = Arc::new(Shared {
            window: Mutex::new(window),
            wake: Notify::new(),
            rearm: Notify::new(),
            shutdown: Notify::new(),
        });

        let acks = tokio::spawn(process_acks(
            Arc::clone(&shared),
            Arc::clone(&self.socket),
            dest,
            conn.handshake_ack(),
            self.abort.clone(),
        ));

        let transmitted = self.transmit(&shared, source.take(total_bytes), dest).await;

        shared.lock().stop();
        shared.shutdown.notify_one();
        let acked = acks.await?;

        let (fin_seq, stats) = {
            let window = shared.lock();
            (window.next_seq(), window.stats())
        };

        if let Err(e) = acked {
            log::debug!("[send] dropping connection to {dest} without teardown");
            conn.force_close();
            return Err(e);
        }
        match transmitted {
            Ok(()) => {}
            Err(e @ (TransferError::SourceRead(_) | TransferError::Aborted)) => {
                log::warn!("[send] {e}; closing connection");
                if let Err(close_err) = conn.close(fin_seq).await {
                    log::warn!("[send] teardown after failure: {close_err}");
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        conn.close(fin_seq).await?;
        log::info!(
            "[send] done: {} bytes in {} segments ({} retransmitted)",
            stats.bytes_acked,
            stats.data_segments_sent,
            stats.retransmissions
        );
        Ok(TransferReport {
            bytes_sent: stats.bytes_acked,
            stats,
        })
    }

    /// Transmit loop: frame source chunks and send whatever the window allows.
    async fn transmit<R>(&self, shared: &Shared, mut source: R, dest: SocketAddr) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mss = self.config.segment_size();
        loop {
            if self.abort.is_aborted() {
                return Err(TransferError::Aborted);
            }

            let step = {
                let mut window = shared.lock();
                let was_armed = window.retransmit_deadline().is_some();
                if window.is_stopped() {
                    Step::Stop
                } else if let Some(segment) = window.next_transmission() {
                    Step::Send {
                        segment,
                        cwnd: window.cwnd(),
                        in_flight: window.in_flight(),
                        armed: !was_armed && window.retransmit_deadline().is_some(),
                    }
                } else if window.is_complete() {
                    Step::Done
                } else if window.needs_data() {
                    Step::Read
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Send {
                    segment,
                    cwnd,
                    in_flight,
                    armed,
                } => {
                    if armed {
                        shared.rearm.notify_one();
                    }
                    self.socket.send_to(&segment, dest).await?;
                    log::debug!(
                        "[send] → DATA seq={} len={} cwnd={cwnd} in_flight={in_flight}",
                        segment.header.seq,
                        segment.payload.len()
                    );
                }
                Step::Read => {
                    let chunk = read_chunk(&mut source, mss)
                        .await
                        .map_err(TransferError::SourceRead)?;
                    let mut window = shared.lock();
                    match chunk {
                        Some(chunk) => window.push_chunk(chunk),
                        None => {
                            log::debug!("[send] source exhausted at seq={}", window.next_seq());
                            window.finish_source();
                        }
                    }
                }
                Step::Wait => {
                    tokio::select! {
                        _ = shared.wake.notified() => {}
                        _ = self.abort.aborted() => {}
                    }
                }
                Step::Done | Step::Stop => return Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Acknowledgement processing
// ---------------------------------------------------------------------------

async fn process_acks(
    shared: Arc<Shared>,
    socket: Arc<Socket>,
    peer: SocketAddr,
    handshake_ack: Segment,
    abort: AbortSignal,
) -> Result<()> {
    let result = ack_loop(&shared, &socket, peer, &handshake_ack, &abort).await;
    if result.is_err() {
        shared.lock().stop();
    }
    shared.wake.notify_one();
    result
}

async fn ack_loop(
    shared: &Shared,
    socket: &Socket,
    peer: SocketAddr,
    handshake_ack: &Segment,
    abort: &AbortSignal,
) -> Result<()> {
    loop {
        let deadline = shared
            .lock()
            .retransmit_deadline()
            .unwrap_or_else(|| Instant::now() + DISARMED);

        tokio::select! {
            _ = shared.shutdown.notified() => return Ok(()),
            _ = abort.aborted() => return Ok(()),
            // Re-read the deadline the transmitter just armed.
            _ = shared.rearm.notified() => {}
            received = socket.recv_segment() => {
                let (segment, from) = received?;
                if from != peer {
                    continue;
                }
                let h = segment.header;
                if h.has(flags::SYN | flags::ACK) {
                    // Our handshake ACK was lost.
                    socket.send_to(handshake_ack, peer).await?;
                    log::debug!("[send] ← {segment}; → {handshake_ack}");
                    continue;
                }
                if h.has(flags::FIN) {
                    let ack = Segment::control(h.ack, h.seq.wrapping_add(1), flags::ACK, 0);
                    socket.send_to(&ack, peer).await?;
                    log::warn!("[send] receiver closed the connection mid-transfer");
                    return Err(TransferError::PeerClosed);
                }
                let outcome = shared.lock().on_ack(&h);
                match outcome {
                    AckOutcome::Loss => log::debug!("[send] ← NAK ack={}; going back", h.ack),
                    AckOutcome::Paused => log::debug!("[send] ← ACK ack={} wnd=0; paused", h.ack),
                    AckOutcome::Reopened => {
                        log::debug!("[send] ← ACK ack={} wnd={}; resumed", h.ack, h.window)
                    }
                    other => log::trace!("[send] ← {segment} {other:?}"),
                }
                shared.wake.notify_one();
            }
            _ = sleep_until(deadline) => {
                let outcome = shared.lock().on_timeout();
                match outcome {
                    TimeoutOutcome::Exhausted { retries } => {
                        log::warn!("[send] no response after {retries} retransmissions");
                        return Err(TransferError::RetriesExhausted { retries });
                    }
                    TimeoutOutcome::Loss => log::debug!("[send] timeout; retransmitting window"),
                    TimeoutOutcome::Probe => log::debug!("[send] window closed; probing"),
                    TimeoutOutcome::Nothing => {}
                }
                shared.wake.notify_one();
            }
        }
    }
}
