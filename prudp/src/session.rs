//! Tokio driver for a [`Connection`].
//!
//! Each connection runs as one spawned task that owns the state machine and
//! processes a single inbox serially:
//!
//! ```text
//!   reader task ──Datagram──┐
//!   timer tasks ──Retransmit┼──▶ inbox ──▶ run() ──▶ Connection
//!   ConnectionHandle ─Send──┘                 │
//!                                             └──poll_transmit──▶ Socket
//! ```
//!
//! Inbound datagrams, retransmit fires and application calls therefore never
//! race each other.  The application talks to the task through a
//! [`ConnectionHandle`].

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use crate::config::ConnectionConfig;
use crate::connection::{ConnError, Connection, ConnectionEvent};
use crate::socket::Socket;
use crate::state::{ConnectionState, Role};
use crate::timer::TokioScheduler;

type Reply = oneshot::Sender<Result<bool, ConnError>>;

/// Everything a session task reacts to.
#[derive(Debug)]
pub(crate) enum Input {
    /// A datagram from the remote endpoint.
    Datagram(Vec<u8>),
    /// The retransmit timer for this sequence id fired.
    Retransmit(u16),
    Send(Vec<u8>, Reply),
    Disconnect(Reply),
    Destroy,
}

type SessionConnection = Connection<TokioScheduler<Input>>;

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Open a client connection to `remote` from a fresh ephemeral socket.
///
/// The handshake starts immediately; use
/// [`ConnectionHandle::wait_connected`] to wait for it.
pub async fn connect(
    remote: SocketAddr,
    config: ConnectionConfig,
) -> Result<ConnectionHandle, ConnError> {
    let bind = match remote {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    let socket = Socket::bind(bind).await?;
    log::debug!("[prudp] client bound to {}", socket.local_addr);
    connect_with(Arc::new(socket), remote, config)
}

/// Open a client connection to `remote` over an existing socket.
///
/// The session reads from `socket` and keeps datagrams from `remote` only.
pub fn connect_with(
    socket: Arc<Socket>,
    remote: SocketAddr,
    config: ConnectionConfig,
) -> Result<ConnectionHandle, ConnError> {
    spawn_session(Role::Client, remote, config, socket, true)
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

/// Spawn the task driving one connection.
///
/// With `with_reader` the session also reads `socket` itself; otherwise the
/// caller feeds it [`Input::Datagram`]s through the handle's inbox.
pub(crate) fn spawn_session(
    role: Role,
    remote: SocketAddr,
    config: ConnectionConfig,
    socket: Arc<Socket>,
    with_reader: bool,
) -> Result<ConnectionHandle, ConnError> {
    config.validate()?;
    // Clients retry until destroyed; an admitted peer that never finishes its
    // handshake is dropped.
    let handshake_deadline = (role == Role::Server).then_some(config.timers.handshake_timeout);

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let scheduler = TokioScheduler::new(inbox_tx.clone(), Input::Retransmit);

    let mut conn = match role {
        Role::Client => Connection::client(remote, config, scheduler),
        Role::Server => Connection::server(remote, config, scheduler),
    };
    let events = conn.subscribe();
    if role == Role::Client {
        conn.connect()?;
    }

    let (state_tx, state_rx) = watch::channel(conn.state());
    let reader = with_reader.then(|| {
        tokio::spawn(read_loop(Arc::clone(&socket), remote, inbox_tx.clone())).abort_handle()
    });
    tokio::spawn(run(conn, inbox_rx, socket, state_tx, reader, handshake_deadline));

    Ok(ConnectionHandle {
        remote,
        inbox: inbox_tx,
        events,
        state: state_rx,
    })
}

async fn run(
    mut conn: SessionConnection,
    mut inbox: mpsc::UnboundedReceiver<Input>,
    socket: Arc<Socket>,
    state_tx: watch::Sender<ConnectionState>,
    reader: Option<AbortHandle>,
    handshake_deadline: Option<Duration>,
) {
    flush(&mut conn, &socket).await;

    let deadline = tokio::time::sleep(handshake_deadline.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);
    let mut deadline_armed = handshake_deadline.is_some();

    loop {
        let input = tokio::select! {
            input = inbox.recv() => match input {
                Some(input) => input,
                None => break,
            },
            _ = &mut deadline, if deadline_armed => {
                log::info!(
                    "[prudp] handshake with {} timed out; destroying",
                    conn.remote_addr()
                );
                conn.destroy();
                break;
            }
        };

        match input {
            Input::Datagram(bytes) => conn.handle_datagram(&bytes),
            Input::Retransmit(sequence_id) => {
                if let Err(e) = conn.on_retransmit_timeout(sequence_id) {
                    conn.report(e);
                }
            }
            Input::Send(payload, reply) => {
                let _ = reply.send(conn.send_data(&payload));
            }
            Input::Disconnect(reply) => {
                let _ = reply.send(conn.disconnect());
            }
            Input::Destroy => conn.destroy(),
        }

        flush(&mut conn, &socket).await;
        state_tx.send_replace(conn.state());
        if conn.state() != ConnectionState::Connecting {
            deadline_armed = false;
        }
        if conn.state() == ConnectionState::Closed {
            break;
        }
    }

    conn.destroy();
    state_tx.send_replace(ConnectionState::Closed);
    if let Some(reader) = reader {
        reader.abort();
    }
    log::debug!("[prudp] session with {} finished", conn.remote_addr());
}

/// Send every queued datagram.  Socket failures are reported, not fatal.
async fn flush(conn: &mut SessionConnection, socket: &Socket) {
    let remote = conn.remote_addr();
    while let Some(datagram) = conn.poll_transmit() {
        if let Err(e) = socket.send_to(&datagram, remote).await {
            conn.report(e.into());
        }
    }
}

/// Forward datagrams from `remote` into the session inbox.
async fn read_loop(socket: Arc<Socket>, remote: SocketAddr, inbox: mpsc::UnboundedSender<Input>) {
    loop {
        match socket.recv_from().await {
            Ok((bytes, from)) if from == remote => {
                if inbox.send(Input::Datagram(bytes)).is_err() {
                    return;
                }
            }
            Ok((_, from)) => log::trace!("[prudp] ignoring datagram from {from}"),
            Err(e) if e.is_transient() => log::debug!("[prudp] transient recv error: {e}"),
            Err(e) => {
                log::warn!("[prudp] recv error, reader stopping: {e}");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionHandle
// ---------------------------------------------------------------------------

/// Application-side handle to a running connection.
///
/// Dropping the handle does not close the connection; call
/// [`ConnectionHandle::disconnect`] or [`ConnectionHandle::destroy`].
#[derive(Debug)]
pub struct ConnectionHandle {
    remote: SocketAddr,
    inbox: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// State as of the last processed event.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Send `payload` as one DATA packet.
    ///
    /// `Ok(false)` means the congestion window was full and the payload was
    /// dropped.
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<bool, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Input::Send(payload.into(), tx))
            .map_err(|_| ConnError::Closed)?;
        rx.await.map_err(|_| ConnError::Closed)?
    }

    /// Start a graceful close.  Completion is signalled by
    /// [`ConnectionEvent::Disconnected`].
    pub async fn disconnect(&self) -> Result<bool, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Input::Disconnect(tx))
            .map_err(|_| ConnError::Closed)?;
        rx.await.map_err(|_| ConnError::Closed)?
    }

    /// Tear the connection down without telling the peer.
    pub fn destroy(&self) {
        let _ = self.inbox.send(Input::Destroy);
    }

    /// Next event, or `None` once the session has finished and every event
    /// was consumed.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Wait until the handshake completes.
    ///
    /// Errors reported during the handshake are logged and skipped.
    pub async fn wait_connected(&mut self) -> Result<(), ConnError> {
        loop {
            match self.events.recv().await {
                Some(ConnectionEvent::Connected) => return Ok(()),
                Some(ConnectionEvent::Disconnected) | None => return Err(ConnError::Closed),
                Some(ConnectionEvent::Error(e)) => {
                    log::debug!("[prudp] during handshake with {}: {e}", self.remote);
                }
                Some(ConnectionEvent::Data(_)) => {}
            }
        }
    }

    /// Resolve once the connection reaches [`ConnectionState::Closed`].
    pub async fn closed(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    pub(crate) fn inbox(&self) -> mpsc::UnboundedSender<Input> {
        self.inbox.clone()
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}
