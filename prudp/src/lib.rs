//! `prudp`: a reliable, connection-oriented datagram protocol over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────┐  SYN / CONNECT / DATA  ┌───────────────┐
//!  │ client        │───────────────────────▶│ Listener      │
//!  │ session task  │◀───────────────────────│  demux task   │
//!  └──────┬────────┘          ACKs          └──────┬────────┘
//!         │                                        │ per origin
//!  ┌──────▼──────────────────────┐   ┌─────────────▼───────────────┐
//!  │ Connection (state machine)  │   │ Connection (state machine)  │
//!  │  CongestionWindow + timers  │   │  CongestionWindow + timers  │
//!  └──────┬──────────────────────┘   └─────────────┬───────────────┘
//!         │ raw UDP datagrams                      │
//!  ┌──────▼──────┐                          ┌──────▼──────┐
//!  │  Socket     │                          │  Socket     │ (shared)
//!  └─────────────┘                          └─────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]: version-0 wire format, checksum, acknowledgements
//! - [`identity`]: access keys, signatures, session ids
//! - [`window`]: in-flight packet tracking
//! - [`timer`]: retransmit scheduling
//! - [`state`]: finite-state-machine types
//! - [`connection`]: per-connection protocol logic (no I/O)
//! - [`session`]: tokio task driving a connection, client entry points
//! - [`listener`]: server socket and per-origin demultiplexing
//! - [`cipher`]: DATA payload encryption seam
//! - [`config`]: connection and listener settings
//! - [`socket`]: async UDP socket abstraction

pub mod cipher;
pub mod config;
pub mod connection;
pub mod identity;
pub mod listener;
pub mod packet;
pub mod session;
pub mod socket;
pub mod state;
pub mod timer;
pub mod window;

pub use config::{ConnectionConfig, ListenerConfig};
pub use connection::{ConnError, ConnectionEvent};
pub use identity::AccessKey;
pub use listener::{Listener, ListenerEvent};
pub use session::{connect, connect_with, ConnectionHandle};
pub use state::ConnectionState;
