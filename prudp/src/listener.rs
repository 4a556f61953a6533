//! Server side: one socket, many connections.
//!
//! A [`Listener`] binds a socket and spawns a receive task that owns the peer
//! table.  Every datagram is parsed and checksummed once, then routed by
//! origin address:
//!
//! ```text
//!                      ┌──────────────┐   Datagram   ┌──────────────┐
//!  UDP ──recv_from──▶  │  demux task  │ ───────────▶ │ session(A)   │
//!                      │  peers: addr │ ───────────▶ │ session(B)   │
//!                      │   → Peer     │              └──────┬───────┘
//!                      └──────┬───────┘                     │ send_to
//!                             │ SYN from new origin         ▼
//!                             └──▶ spawn_session ───▶  shared Socket
//! ```
//!
//! Admitted connections are announced with [`ListenerEvent::Connection`] once
//! their handshake completes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ListenerConfig;
use crate::connection::ConnError;
use crate::packet::{AckOptions, Packet, PacketError, PacketFlags, PacketType};
use crate::session::{spawn_session, ConnectionHandle, Input};
use crate::socket::Socket;
use crate::state::{ConnectionState, Role};

/// Notifications from a running [`Listener`].
#[derive(Debug)]
pub enum ListenerEvent {
    /// The socket is bound; carries the actual local address.
    Listening(SocketAddr),
    /// An admitted connection reached OPEN.
    Connection(ConnectionHandle),
    /// A datagram could not be processed, or the socket failed.
    Error(Arc<ConnError>),
}

/// A bound PRUDP server socket.
///
/// Dropping the listener stops its receive task.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    events: mpsc::UnboundedReceiver<ListenerEvent>,
    task: JoinHandle<()>,
}

impl Listener {
    pub async fn bind(config: ListenerConfig) -> Result<Self, ConnError> {
        config.validate()?;
        let socket = Arc::new(Socket::bind(config.bind).await?);
        let local_addr = socket.local_addr;
        log::info!("[listener] listening on {local_addr}");

        let (events_tx, events) = mpsc::unbounded_channel();
        let _ = events_tx.send(ListenerEvent::Listening(local_addr));
        let task = tokio::spawn(demux_loop(socket, config, events_tx));

        Ok(Self {
            local_addr,
            events,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn next_event(&mut self) -> Option<ListenerEvent> {
        self.events.recv().await
    }

    /// Wait for the next connection to complete its handshake.
    ///
    /// Other events are logged and skipped.
    pub async fn accept(&mut self) -> Result<ConnectionHandle, ConnError> {
        loop {
            match self.events.recv().await {
                Some(ListenerEvent::Connection(handle)) => return Ok(handle),
                Some(ListenerEvent::Listening(_)) => {}
                Some(ListenerEvent::Error(e)) => log::debug!("[listener] skipping error: {e}"),
                None => return Err(ConnError::Closed),
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Demultiplexer
// ---------------------------------------------------------------------------

/// The demux task's view of one admitted connection.
struct Peer {
    inbox: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<ConnectionState>,
}

impl Peer {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_live(&self) -> bool {
        !self.inbox.is_closed() && self.state() != ConnectionState::Closed
    }
}

enum Route {
    Forward,
    Admit,
    /// Acknowledge a DISCONNECT whose connection is already gone.
    AckDisconnect,
    Ignore,
}

async fn demux_loop(
    socket: Arc<Socket>,
    config: ListenerConfig,
    events: mpsc::UnboundedSender<ListenerEvent>,
) {
    let checksum_key = config.access_key.checksum_key();
    let mut peers: HashMap<SocketAddr, Peer> = HashMap::new();

    loop {
        let (bytes, origin) = match socket.recv_from().await {
            Ok(datagram) => datagram,
            Err(e) if e.is_transient() => {
                log::debug!("[listener] transient recv error: {e}");
                continue;
            }
            Err(e) => {
                log::warn!("[listener] recv error, stopping: {e}");
                let _ = events.send(ListenerEvent::Error(Arc::new(e.into())));
                return;
            }
        };

        peers.retain(|addr, peer| {
            let live = peer.is_live();
            if !live {
                log::debug!("[listener] pruning finished connection {addr}");
            }
            live
        });

        let packet = match Packet::parse(&bytes) {
            Ok(packet) => packet,
            Err(PacketError::UnsupportedVersion(actual)) => {
                let err = ConnError::VersionMismatch {
                    expected: config.version,
                    actual,
                };
                report(&events, origin, err);
                continue;
            }
            Err(e) => {
                report(&events, origin, e.into());
                continue;
            }
        };
        if packet.implements_checksum() && !packet.verify_checksum(checksum_key) {
            log::trace!("[listener] checksum mismatch from {origin}; dropping");
            continue;
        }

        let opens_session = packet.packet_type == PacketType::Syn
            && packet.has_flag(PacketFlags::NEED_ACK)
            && !packet.is_ack();

        let is_disconnect = packet.packet_type == PacketType::Disconnect && !packet.is_ack();

        let route = match peers.get(&origin) {
            Some(_) if !opens_session => Route::Forward,
            None if is_disconnect => Route::AckDisconnect,
            None if !opens_session => {
                log::trace!("[listener] no connection for {origin}; dropping");
                Route::Ignore
            }
            None => Route::Admit,
            Some(peer) if peer.state() == ConnectionState::Connecting => Route::Forward,
            Some(_) if config.destroy_old_connections => Route::Admit,
            Some(_) => {
                log::debug!("[listener] {origin} already connected; ignoring SYN");
                Route::Ignore
            }
        };

        match route {
            Route::Forward => {
                let delivered = peers
                    .get(&origin)
                    .is_some_and(|peer| peer.inbox.send(Input::Datagram(bytes)).is_ok());
                if !delivered {
                    peers.remove(&origin);
                    if is_disconnect {
                        if let Err(e) = ack_disconnect(&socket, &packet, checksum_key, origin).await
                        {
                            report(&events, origin, e);
                        }
                    }
                }
            }
            Route::Admit => {
                if let Some(old) = peers.remove(&origin) {
                    log::info!("[listener] {origin} reconnected; destroying old connection");
                    let _ = old.inbox.send(Input::Destroy);
                }
                if let Some(peer) = admit(&socket, &config, origin, packet.source, bytes, &events)
                {
                    peers.insert(origin, peer);
                }
            }
            Route::AckDisconnect => {
                if let Err(e) = ack_disconnect(&socket, &packet, checksum_key, origin).await {
                    report(&events, origin, e);
                }
            }
            Route::Ignore => {}
        }
    }
}

/// Spawn a server session for `origin` and hand it the opening SYN.
///
/// A session that is still CONNECTING after the handshake timeout destroys
/// itself and is pruned with the other finished peers.
fn admit(
    socket: &Arc<Socket>,
    config: &ListenerConfig,
    origin: SocketAddr,
    remote_channel: u8,
    syn: Vec<u8>,
    events: &mpsc::UnboundedSender<ListenerEvent>,
) -> Option<Peer> {
    let connection_config = config.connection_config(remote_channel);
    let mut handle = match spawn_session(
        Role::Server,
        origin,
        connection_config,
        Arc::clone(socket),
        false,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            report(events, origin, e);
            return None;
        }
    };
    log::debug!("[listener] admitted {origin}");

    let peer = Peer {
        inbox: handle.inbox(),
        state: handle.state_watch(),
    };
    let _ = peer.inbox.send(Input::Datagram(syn));

    let events = events.clone();
    tokio::spawn(async move {
        if handle.wait_connected().await.is_ok() {
            log::info!("[listener] connection from {origin} open");
            let _ = events.send(ListenerEvent::Connection(handle));
        }
    });
    Some(peer)
}

/// Ack a resent DISCONNECT from an origin whose session already closed, so
/// the peer stops retransmitting it.
async fn ack_disconnect(
    socket: &Socket,
    disconnect: &Packet,
    checksum_key: u8,
    origin: SocketAddr,
) -> Result<(), ConnError> {
    let options = AckOptions {
        session_id: Some(disconnect.session_id),
        ..AckOptions::default()
    };
    if let Some(mut ack) = disconnect.ack(&options)? {
        log::debug!(
            "[listener] → ACK DISCONNECT seq={} to {origin} (no connection)",
            ack.sequence_id
        );
        socket.send_to(&ack.seal(checksum_key)?, origin).await?;
    }
    Ok(())
}

fn report(events: &mpsc::UnboundedSender<ListenerEvent>, origin: SocketAddr, err: ConnError) {
    log::warn!("[listener] {origin}: {err}");
    let _ = events.send(ListenerEvent::Error(Arc::new(err)));
}
