//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`Segment`] instead of raw bytes.  All protocol logic lives elsewhere;
//! this module owns only byte I/O, bounded retry of transient send failures,
//! and (when configured) fault injection through a [`Simulator`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{PacketError, Segment, HEADER_LEN, MAX_SEGMENT_SIZE};
use crate::simulator::{Fate, Simulator, SimulatorConfig, SimulatorStats};

/// Largest datagram this protocol ever produces.
const MAX_DATAGRAM: usize = HEADER_LEN + MAX_SEGMENT_SIZE;

/// Attempts for a send that keeps failing with a transient error.
pub const SEND_ATTEMPTS: u32 = 3;

const SEND_RETRY_DELAY: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
}

/// Returns true if the error is likely transient (retry may succeed).
fn is_transient_io_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
    )
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, segment-oriented UDP socket.
///
/// All methods are `&self` so one socket can be shared (behind an `Arc`)
/// between the transmit path and the acknowledgement path.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    inner: Arc<UdpSocket>,
    faults: Option<Mutex<Simulator>>,
    send_attempts: u32,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner: Arc::new(inner),
            faults: None,
            send_attempts: SEND_ATTEMPTS,
        })
    }

    /// Route every outbound segment through a fault-injecting [`Simulator`].
    pub fn with_faults(mut self, config: SimulatorConfig) -> Self {
        self.faults = Some(Mutex::new(Simulator::new(config)));
        self
    }

    pub fn with_send_attempts(mut self, attempts: u32) -> Self {
        self.send_attempts = attempts.max(1);
        self
    }

    /// Faults injected so far, if a simulator is attached.
    pub fn fault_stats(&self) -> Option<SimulatorStats> {
        self.faults
            .as_ref()
            .map(|sim| sim.lock().unwrap_or_else(PoisonError::into_inner).stats())
    }

    /// Encode `segment` and send it as a single UDP datagram to `dest`.
    pub async fn send_to(&self, segment: &Segment, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = segment.encode()?;

        let fate = match &self.faults {
            Some(sim) => sim
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .plan(segment),
            None => Fate::Deliver {
                copies: 1,
                delay: None,
            },
        };

        match fate {
            Fate::Drop => {
                log::trace!("[sim] ✗ dropped {segment}");
                Ok(())
            }
            Fate::Deliver {
                copies,
                delay: Some(delay),
            } => {
                log::trace!("[sim] ⏳ delaying {segment} by {delay:?}");
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for _ in 0..copies {
                        let _ = inner.send_to(&bytes, dest).await;
                    }
                });
                Ok(())
            }
            Fate::Deliver { copies, delay: None } => {
                for _ in 0..copies {
                    self.send_bytes(&bytes, dest).await?;
                }
                Ok(())
            }
        }
    }

    async fn send_bytes(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        let mut attempt = 1;
        loop {
            match self.inner.send_to(bytes, dest).await {
                Ok(_) => return Ok(()),
                Err(e) if is_transient_io_error(&e) && attempt < self.send_attempts => {
                    log::debug!("[socket] send to {dest} failed ({e}), retry {attempt}");
                    attempt += 1;
                    tokio::time::sleep(SEND_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receive the next datagram and decode it into a [`Segment`].
    ///
    /// Returns `(segment, sender_address)`.  Datagrams that fail to decode
    /// are returned as `Err`; the caller decides whether to retry.
    pub async fn recv_from(&self) -> Result<(Segment, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let segment = Segment::decode(&buf[..n])?;
        Ok((segment, addr))
    }

    /// Like [`recv_from`](Self::recv_from), but skips malformed datagrams and
    /// ICMP-induced resets instead of returning them.
    pub async fn recv_segment(&self) -> Result<(Segment, SocketAddr), SocketError> {
        loop {
            match self.recv_from().await {
                Ok(received) => return Ok(received),
                Err(SocketError::Packet(e)) => {
                    log::debug!("[socket] discarding datagram: {e}");
                }
                Err(SocketError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    log::debug!("[socket] ignoring {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::flags;

    async fn pair() -> (Socket, Socket) {
        let a = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn segment_survives_the_wire() {
        let (a, b) = pair().await;
        let seg = Segment::data(5, 9, b"payload".to_vec());
        a.send_to(&seg, b.local_addr).await.unwrap();
        let (got, from) = b.recv_from().await.unwrap();
        assert_eq!(got, seg);
        assert_eq!(from, a.local_addr);
    }

    #[tokio::test]
    async fn single_send_attempt_still_delivers() {
        let (a, b) = pair().await;
        let a = a.with_send_attempts(0);
        let fin = Segment::control(7, 8, flags::FIN | flags::ACK, 1);
        a.send_to(&fin, b.local_addr).await.unwrap();
        let (got, _) = b.recv_from().await.unwrap();
        assert_eq!(got, fin);
    }

    #[tokio::test]
    async fn recv_segment_skips_garbage() {
        let (a, b) = pair().await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"junk", b.local_addr).await.unwrap();
        let ack = Segment::control(1, 2, flags::ACK, 3);
        a.send_to(&ack, b.local_addr).await.unwrap();
        let (got, _) = b.recv_segment().await.unwrap();
        assert_eq!(got, ack);
    }

    #[tokio::test]
    async fn simulator_drops_and_duplicates() {
        let (a, b) = pair().await;
        let a = a.with_faults(SimulatorConfig {
            drop_first: 1,
            duplicate_rate: 1.0,
            ..SimulatorConfig::default()
        });
        a.send_to(&Segment::control(1, 0, flags::SYN, 0), b.local_addr)
            .await
            .unwrap();
        a.send_to(&Segment::control(2, 0, flags::SYN, 0), b.local_addr)
            .await
            .unwrap();
        let (first, _) = b.recv_from().await.unwrap();
        let (second, _) = b.recv_from().await.unwrap();
        assert_eq!(first.header.seq, 2);
        assert_eq!(second.header.seq, 2);
        let stats = a.fault_stats().unwrap();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.duplicated, 1);
    }
}
