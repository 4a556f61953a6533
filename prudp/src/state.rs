//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy.  Transitions live in [`crate::connection`].
//!
//! ```text
//!  client:  CLOSED ──connect()──▶ CONNECTING ──CONNECT-ACK──▶ OPEN
//!  server:  (admitted on SYN)     CONNECTING ──ack CONNECT──▶ OPEN
//!
//!  OPEN ──disconnect()──▶ CLOSING ──DISCONNECT-ACK──▶ CLOSED
//!  OPEN ──peer DISCONNECT──────────────────────────▶ CLOSED
//! ```

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session; initial state of a client and terminal state of both roles.
    #[default]
    Closed,
    /// Handshake in progress.  Server-admitted connections start here.
    Connecting,
    /// Handshake complete; data may flow.
    Open,
    /// Local DISCONNECT sent; waiting for its acknowledgement.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

/// Which side of the handshake a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Actively opened with [`crate::connection::Connection::connect`].
    Client,
    /// Admitted by a [`crate::listener::Listener`] on an inbound SYN.
    Server,
}
