//! `udp-file-transfer`: reliable, flow- and congestion-controlled file
//! transfer over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   DATA segments   ┌────────────────┐   in-order   ┌──────────┐
//!  │ SenderEngine │──────────────────▶│ ReceiverEngine │─────────────▶│ Reassem- │
//!  │ (SendWindow: │                   │ (RecvWindow:   │   enqueue    │ blyQueue │
//!  │  cwnd, RTO)  │◀──────────────────│  ACK/NAK/wnd)  │              └────┬─────┘
//!  └──────┬───────┘  ACK / NAK / wnd  └───────┬────────┘                   │
//!         │                                   │                      ┌────▼─────┐
//!  ┌──────▼───────────────────────────────────▼───────┐              │ Consumer │──▶ sink
//!  │  Connection (StateMachine: handshake, teardown)  │              └──────────┘
//!  └──────┬───────────────────────────────────────────┘
//!         │ raw UDP datagrams
//!  ┌──────▼────┐
//!  │  Socket   │  (tokio UdpSocket + optional fault Simulator)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]        wire format (serialise / deserialise), sequence arithmetic
//! - [`state`]         connection finite-state machine (pure)
//! - [`connection`]    handshake and teardown exchanges with bounded retries
//! - [`send_window`]   sliding window, AIMD congestion control, loss reaction
//! - [`sender`]        sending engine: transmitter + acknowledgement tasks
//! - [`recv_window`]   ordering, loss detection, flow-control replies
//! - [`receiver`]      receiving engine: reception loop + consumer
//! - [`queue`]         bounded reassembly queue
//! - [`consumer`]      rate-limited drain of the queue into the destination
//! - [`chunk`]         source / destination collaborators
//! - [`timer`]         retransmission timeout estimation
//! - [`simulator`]     seeded loss / duplication / reordering for tests
//! - [`socket`]        async UDP socket abstraction
//! - [`abort`]         shared cancellation flag
//! - [`config`]        tunables
//! - [`error`]         error taxonomy

pub mod abort;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod packet;
pub mod queue;
pub mod receiver;
pub mod recv_window;
pub mod send_window;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;

pub use abort::AbortSignal;
pub use config::TransferConfig;
pub use connection::Connection;
pub use error::{Result, TransferError};
pub use receiver::{Delivery, ReceiverEngine};
pub use sender::{SenderEngine, TransferReport};
pub use simulator::SimulatorConfig;
pub use socket::Socket;
