use std::time::Duration;

use thiserror::Error;

use crate::socket::SocketError;
use crate::state::ConnectionState;

/// Errors surfaced by the transfer engines.
///
/// Protocol violations, lost segments and a full reassembly queue are
/// recovered inside the engines and never appear here.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("handshake failed after {attempts} attempts")]
    HandshakeFailed { attempts: u32 },

    #[error("peer stopped responding after {retries} retransmission timeouts")]
    RetriesExhausted { retries: u32 },

    #[error("no traffic from peer for {after:?}")]
    IdleTimeout { after: Duration },

    #[error("reading source failed: {0}")]
    SourceRead(#[source] std::io::Error),

    #[error("writing destination failed: {0}")]
    DestinationWrite(#[source] std::io::Error),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("transfer aborted")]
    Aborted,

    #[error("peer closed the connection before the transfer completed")]
    PeerClosed,

    #[error("operation not valid in state {0}")]
    BadState(ConnectionState),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, TransferError>;
