//! MS/TP (Master-Slave/Token-Passing) data-link layer for RS-485 field buses.
//!
//! A [`Link`] runs the MS/TP state machines for one station on a worker
//! thread, on top of any byte [`Transport`]. The application queues frames
//! with [`Link::send`], reads them with [`Link::recv`], and can query other
//! stations with management requests ([`Link::send_request`]).
//!
//! A link plays one [`Role`] at a time: a token passing master, a slave
//! that only answers, or a sniffer that just listens.

mod buffer;
pub mod comm;
pub mod config;
mod crc;
pub mod event;
pub mod frame;
mod link;
mod mailbox;
pub mod master;
pub mod mgmt;
mod node;
mod nom_parser;
mod slave;
mod sniffer;
pub mod stats;
mod sync;
pub mod transport;
pub mod types;

pub use comm::{RecvError, Transceiver};
pub use config::{ConfigError, LinkConfig, Timing};
pub use event::{Event, MgmtHandler, NullHandler};
pub use frame::{DecodeError, Frame, FrameInfo, Payload, MAX_DATA_LEN};
pub use link::{Error, Link};
pub use master::State;
pub use mgmt::{Reply, MAX_MGMT_PAYLOAD};
pub use stats::{CommStats, LinkStats, NetMap};
#[cfg(feature = "serial")]
pub use transport::SerialTransport;
pub use transport::{RxEvent, Transport};
pub use types::{addr, Address, FrameType, IntoAddress, Role};
