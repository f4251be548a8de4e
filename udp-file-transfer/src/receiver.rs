//! Receiving side of a file transfer.
//!
//! [`ReceiverEngine::accept`] completes the passive open;
//! [`ReceiverEngine::serve`] then runs the reception loop next to a spawned
//! [`Consumer`]:
//!
//! ```text
//!  socket ──DATA──▶ reception loop ──enqueue──▶ ReassemblyQueue ──▶ consumer ──▶ sink
//!     ▲                  │                            │
//!     └──ACK / NAK / ────┘◀──── writable (slot freed) ─┘
//!        window update
//! ```
//!
//! The two sides share only the queue.  When the sender's FIN arrives the
//! queue is closed, the consumer drains and flushes it, and only then does
//! the receiver send its own FIN.

use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;

use crate::abort::AbortSignal;
use crate::config::TransferConfig;
use crate::connection::Connection;
use crate::consumer::Consumer;
use crate::error::{Result, TransferError};
use crate::packet::{flags, Segment};
use crate::queue::ReassemblyQueue;
use crate::recv_window::{Disposition, ReceiveStats, RecvWindow};
use crate::socket::Socket;

/// Outcome of a completed receive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Sequence number of the sender's FIN.
    pub final_seq: u32,
    pub bytes_written: u64,
    pub stats: ReceiveStats,
    /// Most segments the reassembly queue ever held at once.
    pub high_water: usize,
}

pub struct ReceiverEngine {
    socket: Arc<Socket>,
    config: TransferConfig,
    abort: AbortSignal,
}

impl ReceiverEngine {
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

    /// Wait for a sender and complete the handshake, advertising `capacity`.
    pub async fn accept(&self, capacity: usize) -> Result<Connection> {
        Connection::accept(Arc::clone(&self.socket), capacity, self.config.clone()).await
    }

    /// Accept one sender and write everything it sends into `sink`.
    pub async fn receive<W>(&self, sink: W, capacity: usize, write_rate: u64) -> Result<Delivery>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = capacity.max(1);
        let queue = Arc::new(ReassemblyQueue::new(capacity));
        let conn = self.accept(capacity).await?;
        self.serve(conn, queue, sink, write_rate).await
    }

    /// Run the reception loop on an established connection until the
    /// sender's FIN, then drain the consumer and close.
    pub async fn serve<W>(
        &self,
        mut conn: Connection,
        queue: Arc<ReassemblyQueue>,
        sink: W,
        write_rate: u64,
    ) -> Result<Delivery>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let socket = Arc::clone(conn.socket());
        let peer = conn.peer();
        let idle = self.config.idle_timeout;
        let mut window = RecvWindow::new(conn.peer_seq(), conn.local_seq());

        let mut consumer = Consumer::new(
            Arc::clone(&queue),
            sink,
            write_rate,
            self.config.write_quantum,
        );
        let mut consumer_task: JoinHandle<Result<u64>> =
            tokio::spawn(async move { consumer.run().await });

        let mut fin = None;
        if let Some(first) = conn.take_pending() {
            if first.header.has(flags::FIN) {
                fin = Some(first);
            } else {
                self.on_data(&socket, &mut conn, &mut window, &queue, first)
                    .await?;
            }
        }

        // ---------------------------------------------------------------
        // Data phase
        // ---------------------------------------------------------------
        let fin = loop {
            if let Some(fin) = fin.take() {
                break fin;
            }
            if self.abort.is_aborted() {
                return self.bail(&mut conn, &queue, consumer_task, TransferError::Aborted).await;
            }
            let zero_window = window.zero_window_advertised();

            tokio::select! {
                received = timeout(idle, socket.recv_segment()) => {
                    let (segment, from) = match received {
                        Ok(received) => received?,
                        Err(_) => {
                            log::warn!("[recv] nothing from {peer} for {idle:?}");
                            stop_consumer(&queue, &consumer_task);
                            return Err(TransferError::IdleTimeout { after: idle });
                        }
                    };
                    if from != peer {
                        log::debug!("[recv] ← {segment} from stranger {from}; dropped");
                        continue;
                    }
                    if segment.header.has(flags::FIN) {
                        fin = Some(segment);
                    } else if segment.is_data() {
                        self.on_data(&socket, &mut conn, &mut window, &queue, segment).await?;
                    } else {
                        log::trace!("[recv] ← {segment}; ignored");
                    }
                }
                _ = queue.writable(), if zero_window => {
                    if let Some(update) = window.window_update(&queue) {
                        socket.send_to(&update, peer).await?;
                        log::debug!("[recv] → window update ack={} wnd={}",
                            update.header.ack, update.header.window);
                    }
                }
                joined = &mut consumer_task => {
                    let e = consumer_failure(joined);
                    log::warn!("[recv] consumer failed: {e}");
                    queue.close();
                    if let Err(close_err) = conn.abandon().await {
                        log::warn!("[recv] teardown after failure: {close_err}");
                    }
                    return Err(e);
                }
                _ = self.abort.aborted() => {}
            }
        };

        // ---------------------------------------------------------------
        // Teardown
        // ---------------------------------------------------------------
        let expected = window.expected_next();
        if fin.header.seq != expected {
            log::warn!(
                "[recv] FIN at seq={} while expecting {expected}; stream ends here",
                fin.header.seq
            );
        }
        conn.set_window(free_window(&queue));
        conn.acknowledge_fin(&fin).await?;
        queue.close();

        let written = loop {
            tokio::select! {
                joined = &mut consumer_task => break joined?,
                received = socket.recv_segment() => {
                    let (segment, from) = received?;
                    if from == peer && segment.header.has(flags::FIN) {
                        conn.acknowledge_fin(&segment).await?;
                    }
                }
            }
        };
        let bytes_written = match written {
            Ok(n) => n,
            Err(e) => {
                if let Err(close_err) = conn.finish().await {
                    log::warn!("[recv] teardown after failure: {close_err}");
                }
                return Err(e);
            }
        };

        conn.finish().await?;
        let stats = window.stats();
        log::info!(
            "[recv] done: {bytes_written} bytes, {} segments accepted, {} duplicates, {} NAKs",
            stats.accepted,
            stats.duplicates,
            stats.naks_sent
        );
        Ok(Delivery {
            final_seq: fin.header.seq,
            bytes_written,
            stats,
            high_water: queue.high_water_mark(),
        })
    }

    async fn on_data(
        &self,
        socket: &Socket,
        conn: &mut Connection,
        window: &mut RecvWindow,
        queue: &ReassemblyQueue,
        segment: Segment,
    ) -> Result<()> {
        let seq = segment.header.seq;
        let len = segment.payload.len();
        let disposition = window.on_segment(segment, queue);
        let reply = window.reply(disposition, queue);
        conn.set_window(reply.header.window);
        socket.send_to(&reply, conn.peer()).await?;

        match disposition {
            Disposition::Accepted => log::debug!(
                "[recv] ← DATA seq={seq} len={len}; → ACK ack={} wnd={}",
                reply.header.ack,
                reply.header.window
            ),
            Disposition::Gap => log::debug!(
                "[recv] ← DATA seq={seq} out of order; → NAK ack={}",
                reply.header.ack
            ),
            Disposition::Refused => log::debug!("[recv] ← DATA seq={seq}; queue full, → wnd=0"),
            Disposition::Duplicate => log::trace!("[recv] ← DATA seq={seq} duplicate"),
        }
        Ok(())
    }

    async fn bail(
        &self,
        conn: &mut Connection,
        queue: &ReassemblyQueue,
        consumer_task: JoinHandle<Result<u64>>,
        error: TransferError,
    ) -> Result<Delivery> {
        log::warn!("[recv] {error}; closing connection");
        stop_consumer(queue, &consumer_task);
        if let Err(close_err) = conn.abandon().await {
            log::warn!("[recv] teardown after failure: {close_err}");
        }
        Err(error)
    }
}

fn free_window(queue: &ReassemblyQueue) -> u16 {
    u16::try_from(queue.free_space()).unwrap_or(u16::MAX)
}

fn stop_consumer(queue: &ReassemblyQueue, task: &JoinHandle<Result<u64>>) {
    queue.close();
    task.abort();
}

/// The consumer only returns early on failure.
fn consumer_failure(joined: std::result::Result<Result<u64>, JoinError>) -> TransferError {
    match joined {
        Ok(Err(e)) => e,
        Err(e) => e.into(),
        Ok(Ok(_)) => TransferError::DestinationWrite(std::io::Error::other(
            "consumer stopped before end of stream",
        )),
    }
}
