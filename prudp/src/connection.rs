//! Per-connection protocol state machine.
//!
//! A [`Connection`] owns the complete state for one logical peer-to-peer
//! session.  Its responsibilities are:
//! - Running the validation gate on every inbound datagram (version,
//!   checksum, channels).
//! - Driving the handshake FSM (see [`crate::state`]) in either role.
//! - Assigning sequence ids and tracking unacknowledged packets in the
//!   [`CongestionWindow`], arming a retransmit timer for each.
//! - Acknowledging inbound packets and signalling [`ConnectionEvent`]s to its
//!   observers.
//!
//! The connection performs no I/O.  Outbound datagrams queue up and are
//! drained with [`Connection::poll_transmit`]; timers go through a
//! [`Scheduler`].  [`crate::session`] wires both to tokio.
//!
//! # Handshake
//!
//! ```text
//!  client                                   server
//!    │ ── SYN (NEED_ACK) ─────────────────────▶ │  admitted, CONNECTING
//!    │ ◀──────── SYN-ACK (HAS_SIZE, srv sig) ── │
//!    │ ── CONNECT (cli sig, srv sig) ─────────▶ │
//!    │ ◀──────── CONNECT-ACK (cli sig) ──────── │  OPEN, "connected"
//!  OPEN, "connected"
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ConnectionConfig;
use crate::identity::{connection_hash, random_session_id, signature_from_hash};
use crate::packet::{AckOptions, Packet, PacketError, PacketFlags, PacketType, Signature};
use crate::socket::SocketError;
use crate::state::{ConnectionState, Role};
use crate::timer::Scheduler;
use crate::window::{CongestionWindow, SentPacket};

/// How many recently delivered DATA sequence ids are remembered for
/// duplicate suppression.
const RECENT_DATA_HISTORY: usize = 64;

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConnError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("received packet of version {actual}, expected {expected}")]
    VersionMismatch { expected: u8, actual: u8 },
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("operation not valid in state {0}")]
    BadState(ConnectionState),
    #[error("connection closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Notifications delivered to every subscribed observer.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake complete; emitted once per connection.
    Connected,
    /// Decrypted payload of an inbound DATA packet.
    Data(Vec<u8>),
    /// The session ended (peer or local DISCONNECT, or teardown).
    Disconnected,
    /// A non-fatal problem; the connection keeps running.
    Error(Arc<ConnError>),
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct Connection<S: Scheduler> {
    role: Role,
    remote: SocketAddr,
    config: ConnectionConfig,
    checksum_key: u8,
    session_id: u8,
    state: ConnectionState,
    next_sequence_id: u16,
    /// HMAC of the remote endpoint under the access-key digest.
    local_hash: [u8; 32],
    /// The peer's signature, learned during the handshake.
    remote_hash: Option<Signature>,
    window: CongestionWindow<S::Handle>,
    scheduler: S,
    outbox: VecDeque<Vec<u8>>,
    observers: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
    recent_data: VecDeque<u16>,
}

impl<S: Scheduler> Connection<S> {
    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    /// A client connection in [`ConnectionState::Closed`]; call
    /// [`Connection::connect`] to start the handshake.
    pub fn client(remote: SocketAddr, config: ConnectionConfig, scheduler: S) -> Self {
        Self::new(Role::Client, remote, config, scheduler, ConnectionState::Closed)
    }

    /// A server connection, admitted mid-handshake in
    /// [`ConnectionState::Connecting`].
    pub fn server(remote: SocketAddr, config: ConnectionConfig, scheduler: S) -> Self {
        Self::new(Role::Server, remote, config, scheduler, ConnectionState::Connecting)
    }

    fn new(
        role: Role,
        remote: SocketAddr,
        config: ConnectionConfig,
        scheduler: S,
        state: ConnectionState,
    ) -> Self {
        let checksum_key = config.access_key.checksum_key();
        let local_hash = connection_hash(&config.access_key, remote);
        let window = CongestionWindow::new(config.window_size);
        Self {
            role,
            remote,
            config,
            checksum_key,
            session_id: random_session_id(),
            state,
            next_sequence_id: 0,
            local_hash,
            remote_hash: None,
            window,
            scheduler,
            outbox: VecDeque::new(),
            observers: Vec::new(),
            recent_data: VecDeque::with_capacity(RECENT_DATA_HISTORY),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    /// The signature this side offers during the handshake.
    pub fn local_signature(&self) -> Signature {
        signature_from_hash(&self.local_hash)
    }

    pub fn remote_signature(&self) -> Option<Signature> {
        self.remote_hash
    }

    /// Number of packets awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    /// Register a new observer for [`ConnectionEvent`]s.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    /// Next serialised datagram to send to [`Connection::remote_addr`].
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.outbox.pop_front()
    }

    // -----------------------------------------------------------------------
    // Local operations
    // -----------------------------------------------------------------------

    /// Start the client handshake by sending SYN.
    pub fn connect(&mut self) -> Result<(), ConnError> {
        if self.role != Role::Client || self.state != ConnectionState::Closed {
            return Err(ConnError::BadState(self.state));
        }
        self.state = ConnectionState::Connecting;
        let syn = Packet::syn(self.config.local_channel, self.config.remote_channel);
        self.send(syn)?;
        log::debug!("[prudp] → SYN to {}", self.remote);
        Ok(())
    }

    /// Send `payload` as one reliable DATA packet.
    ///
    /// Returns `Ok(false)` when the congestion window is full; the payload is
    /// dropped and the caller must retry later.
    pub fn send_data(&mut self, payload: &[u8]) -> Result<bool, ConnError> {
        if self.state != ConnectionState::Open {
            return Err(ConnError::BadState(self.state));
        }
        let body = self
            .config
            .cipher
            .encrypt(payload, &self.config.encryption_key);
        let mut data = Packet::data(self.config.local_channel, self.config.remote_channel, body);
        data.session_id = self.session_id;
        data.packet_signature = self.peer_signature();
        self.send(data)
    }

    /// Begin a graceful close by sending DISCONNECT.
    pub fn disconnect(&mut self) -> Result<bool, ConnError> {
        if self.state != ConnectionState::Open {
            return Err(ConnError::BadState(self.state));
        }
        let mut disconnect =
            Packet::disconnect(self.config.local_channel, self.config.remote_channel);
        disconnect.session_id = self.session_id;
        disconnect.packet_signature = self.peer_signature();
        let sent = self.send(disconnect)?;
        if sent {
            self.state = ConnectionState::Closing;
            log::debug!("[prudp] → DISCONNECT to {}", self.remote);
        }
        Ok(sent)
    }

    /// Tear the connection down immediately, cancelling every pending timer.
    pub fn destroy(&mut self) {
        self.outbox.clear();
        self.close();
    }

    /// Retransmit the packet behind a fired timer and rearm it.
    ///
    /// Fires for packets that were acknowledged in the meantime are ignored.
    pub fn on_retransmit_timeout(&mut self, sequence_id: u16) -> Result<(), ConnError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        let Some(record) = self.window.get(sequence_id) else {
            return Ok(());
        };
        let mut packet = record.packet.clone();
        let attempt = record.transmissions + 1;

        let bytes = packet.seal(self.checksum_key)?;
        self.outbox.push_back(bytes);
        let timer = self
            .scheduler
            .schedule(self.config.timers.retransmit_timeout, sequence_id);
        self.window.replace_timer(sequence_id, timer);

        log::debug!(
            "[prudp] timeout, resending {:?} seq={} attempt={}",
            packet.packet_type,
            sequence_id,
            attempt
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound path
    // -----------------------------------------------------------------------

    /// Parse and process one datagram received from the remote endpoint.
    ///
    /// Problems are reported to observers as [`ConnectionEvent::Error`]; none
    /// of them stop the connection.
    pub fn handle_datagram(&mut self, bytes: &[u8]) {
        let packet = match Packet::parse(bytes) {
            Ok(packet) => packet,
            Err(PacketError::UnsupportedVersion(actual)) => {
                self.report(ConnError::VersionMismatch {
                    expected: self.config.version,
                    actual,
                });
                return;
            }
            Err(e) => {
                self.report(e.into());
                return;
            }
        };
        if let Err(e) = self.handle_packet(packet) {
            self.report(e);
        }
    }

    /// Validate a parsed packet and dispatch it.
    pub fn handle_packet(&mut self, packet: Packet) -> Result<(), ConnError> {
        if packet.version != self.config.version {
            self.report(ConnError::VersionMismatch {
                expected: self.config.version,
                actual: packet.version,
            });
        }
        if packet.implements_checksum() && !packet.verify_checksum(self.checksum_key) {
            log::trace!("[prudp] checksum mismatch from {}; dropping", self.remote);
            return Ok(());
        }
        if packet.destination != self.config.local_channel
            && packet.source != self.config.remote_channel
        {
            log::trace!(
                "[prudp] channel mismatch {:#04x}→{:#04x}; dropping",
                packet.source,
                packet.destination
            );
            return Ok(());
        }
        if self.state == ConnectionState::Closed {
            // The peer resends DISCONNECT until an ack gets through.
            if packet.packet_type == PacketType::Disconnect && !packet.is_ack() {
                return self.acknowledge(&packet);
            }
            return Ok(());
        }

        if packet.is_ack() {
            if !self.accepts_ack(&packet) {
                log::debug!(
                    "[prudp] ← ACK {:?} seq={} rejected; keeping packet in flight",
                    packet.packet_type,
                    packet.sequence_id
                );
                return Ok(());
            }
            if self.window.acknowledge_packet(&packet) {
                log::debug!(
                    "[prudp] ← ACK {:?} seq={} in_flight={}",
                    packet.packet_type,
                    packet.sequence_id,
                    self.window.len()
                );
            }
            return self.on_ack(&packet);
        }

        match packet.packet_type {
            PacketType::Syn => self.on_syn(&packet),
            PacketType::Connect => self.on_connect(&packet),
            PacketType::Data => self.on_data(&packet),
            PacketType::Disconnect => self.on_disconnect(&packet),
            PacketType::Ping | PacketType::Unknown(_) => self.acknowledge(&packet),
        }
    }

    /// Handshake acks must be well-formed before they release the packet
    /// they acknowledge; anything else is taken at face value.
    fn accepts_ack(&self, ack: &Packet) -> bool {
        match (self.role, ack.packet_type, self.state) {
            (Role::Client, PacketType::Syn, ConnectionState::Connecting) => {
                ack.has_flag(PacketFlags::HAS_SIZE) && ack.connection_signature.is_some()
            }
            (Role::Client, PacketType::Connect, ConnectionState::Connecting) => {
                ack.packet_signature == self.local_signature()
            }
            _ => true,
        }
    }

    fn on_ack(&mut self, ack: &Packet) -> Result<(), ConnError> {
        match (self.role, ack.packet_type, self.state) {
            (Role::Client, PacketType::Syn, ConnectionState::Connecting) => {
                // A second SYN-ACK answers a resent SYN; CONNECT is already out.
                if self.remote_hash.is_some() {
                    return Ok(());
                }
                let Some(server_signature) = ack.connection_signature else {
                    return Ok(());
                };
                self.remote_hash = Some(server_signature);

                let mut connect = Packet::connect(
                    self.config.local_channel,
                    self.config.remote_channel,
                    self.local_signature(),
                    server_signature,
                );
                connect.session_id = self.session_id;
                self.send(connect)?;
                log::debug!("[prudp] ← SYN-ACK; → CONNECT to {}", self.remote);
            }
            (Role::Client, PacketType::Connect, ConnectionState::Connecting) => self.open(),
            (_, PacketType::Disconnect, ConnectionState::Closing) => {
                log::debug!("[prudp] ← DISCONNECT-ACK from {}", self.remote);
                self.close();
            }
            _ => {}
        }
        Ok(())
    }

    fn on_syn(&mut self, syn: &Packet) -> Result<(), ConnError> {
        if self.role != Role::Server || self.state != ConnectionState::Connecting {
            return Ok(());
        }
        let options = AckOptions {
            session_id: Some(self.session_id),
            connection_signature: Some(self.local_signature().to_vec()),
            packet_signature: None,
        };
        if let Some(ack) = syn.ack(&options)? {
            self.send(ack)?;
            log::debug!("[prudp] ← SYN; → SYN-ACK to {}", self.remote);
        }
        Ok(())
    }

    fn on_connect(&mut self, connect: &Packet) -> Result<(), ConnError> {
        if self.role != Role::Server
            || !matches!(self.state, ConnectionState::Connecting | ConnectionState::Open)
        {
            return Ok(());
        }
        // The client must echo the signature we offered in the SYN-ACK.
        if connect.packet_signature != self.local_signature() {
            log::debug!(
                "[prudp] CONNECT from {} carries a foreign signature; dropping",
                self.remote
            );
            return Ok(());
        }
        let Some(client_signature) = connect.connection_signature else {
            return Ok(());
        };
        self.remote_hash = Some(client_signature);
        self.acknowledge(connect)?;

        if self.state == ConnectionState::Connecting {
            self.open();
        }
        Ok(())
    }

    fn on_data(&mut self, data: &Packet) -> Result<(), ConnError> {
        if !matches!(self.state, ConnectionState::Open | ConnectionState::Closing) {
            return Ok(());
        }
        self.acknowledge(data)?;

        if self.recent_data.contains(&data.sequence_id) {
            log::trace!("[prudp] duplicate DATA seq={}", data.sequence_id);
            return Ok(());
        }
        if self.recent_data.len() == RECENT_DATA_HISTORY {
            self.recent_data.pop_front();
        }
        self.recent_data.push_back(data.sequence_id);

        let payload = self
            .config
            .cipher
            .decrypt(&data.payload, &self.config.encryption_key);
        log::debug!(
            "[prudp] ← DATA seq={} len={}",
            data.sequence_id,
            payload.len()
        );
        self.emit(ConnectionEvent::Data(payload));
        Ok(())
    }

    fn on_disconnect(&mut self, disconnect: &Packet) -> Result<(), ConnError> {
        self.acknowledge(disconnect)?;
        log::debug!("[prudp] ← DISCONNECT from {}", self.remote);
        self.close();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Send the acknowledgement `packet` asks for, if any.
    fn acknowledge(&mut self, packet: &Packet) -> Result<(), ConnError> {
        let options = AckOptions {
            session_id: Some(self.session_id),
            connection_signature: None,
            packet_signature: self.remote_hash.map(|s| s.to_vec()),
        };
        if let Some(ack) = packet.ack(&options)? {
            self.send(ack)?;
        }
        Ok(())
    }

    /// Assign a sequence id, seal, queue, and track `packet` as needed.
    ///
    /// Returns `Ok(false)` when a tracked packet meets a full window, or when
    /// the next sequence id has wrapped onto a packet still in flight.
    fn send(&mut self, mut packet: Packet) -> Result<bool, ConnError> {
        let tracked = packet.requires_tracking();
        if tracked && self.window.is_full() {
            log::warn!(
                "[prudp] congestion window full ({}); dropping {:?}",
                self.window.capacity(),
                packet.packet_type
            );
            return Ok(false);
        }
        if tracked && self.window.waiting_for(self.next_sequence_id) {
            log::warn!(
                "[prudp] seq={} still in flight; dropping {:?}",
                self.next_sequence_id,
                packet.packet_type
            );
            return Ok(false);
        }

        if !packet.is_ack() {
            packet.sequence_id = self.next_sequence_id;
            self.next_sequence_id = self.next_sequence_id.wrapping_add(1);
        }

        let bytes = packet.seal(self.checksum_key)?;
        self.outbox.push_back(bytes);

        if tracked {
            let timer = self
                .scheduler
                .schedule(self.config.timers.retransmit_timeout, packet.sequence_id);
            self.window.add_sent_packet(SentPacket::new(packet, timer));
        }
        Ok(true)
    }

    /// Signature placed on outbound packets once the peer's is known.
    fn peer_signature(&self) -> Signature {
        self.remote_hash.unwrap_or_default()
    }

    fn open(&mut self) {
        self.state = ConnectionState::Open;
        log::info!("[prudp] connection to {} open", self.remote);
        self.emit(ConnectionEvent::Connected);
    }

    fn close(&mut self) {
        let was_established =
            matches!(self.state, ConnectionState::Open | ConnectionState::Closing);
        self.window.clear();
        self.state = ConnectionState::Closed;
        if was_established {
            log::info!("[prudp] connection to {} closed", self.remote);
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    fn emit(&mut self, event: ConnectionEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Log `err` and deliver it to observers.
    pub(crate) fn report(&mut self, err: ConnError) {
        log::warn!("[prudp] {}: {err}", self.remote);
        self.emit(ConnectionEvent::Error(Arc::new(err)));
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
