//! Connection and listener configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::cipher::{PayloadCipher, Plaintext};
use crate::connection::ConnError;
use crate::identity::AccessKey;
use crate::timer::TimerConfig;
use crate::window::DEFAULT_WINDOW_SIZE;

/// Channel a client sends from unless configured otherwise.
pub const DEFAULT_CLIENT_CHANNEL: u8 = 0xAF;
/// Channel a server listens on unless configured otherwise.
pub const DEFAULT_SERVER_CHANNEL: u8 = 0xA1;

/// Settings for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Protocol version expected on inbound packets.
    pub version: u8,
    pub local_channel: u8,
    pub remote_channel: u8,
    /// Keys checksums and signature derivation.
    pub access_key: AccessKey,
    /// Passed to `cipher` for DATA payloads.
    pub encryption_key: Vec<u8>,
    /// Congestion window capacity.
    pub window_size: usize,
    pub timers: TimerConfig,
    pub cipher: Arc<dyn PayloadCipher>,
}

impl ConnectionConfig {
    /// Client defaults with the given access key.
    pub fn new(access_key: impl Into<AccessKey>) -> Self {
        Self {
            access_key: access_key.into(),
            ..Self::default()
        }
    }

    /// Reject settings no connection can run with.
    pub fn validate(&self) -> Result<(), ConnError> {
        check_window_size(self.window_size)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            version: 0,
            local_channel: DEFAULT_CLIENT_CHANNEL,
            remote_channel: DEFAULT_SERVER_CHANNEL,
            access_key: AccessKey::Secret(Vec::new()),
            encryption_key: Vec::new(),
            window_size: DEFAULT_WINDOW_SIZE,
            timers: TimerConfig::default(),
            cipher: Arc::new(Plaintext),
        }
    }
}

/// Settings for a [`crate::listener::Listener`] and the connections it admits.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind: SocketAddr,
    pub version: u8,
    pub local_channel: u8,
    /// When a new handshake arrives from an origin that already has an
    /// established connection: `true` tears the old one down and admits the
    /// new one, `false` ignores the new handshake.
    pub destroy_old_connections: bool,
    pub access_key: AccessKey,
    pub encryption_key: Vec<u8>,
    pub window_size: usize,
    pub timers: TimerConfig,
    pub cipher: Arc<dyn PayloadCipher>,
}

impl ListenerConfig {
    pub fn new(bind: SocketAddr, access_key: impl Into<AccessKey>) -> Self {
        Self {
            bind,
            access_key: access_key.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConnError> {
        check_window_size(self.window_size)
    }

    /// Configuration for a connection admitted from `remote_channel`.
    pub(crate) fn connection_config(&self, remote_channel: u8) -> ConnectionConfig {
        ConnectionConfig {
            version: self.version,
            local_channel: self.local_channel,
            remote_channel,
            access_key: self.access_key.clone(),
            encryption_key: self.encryption_key.clone(),
            window_size: self.window_size,
            timers: self.timers.clone(),
            cipher: Arc::clone(&self.cipher),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            version: 0,
            local_channel: DEFAULT_SERVER_CHANNEL,
            destroy_old_connections: true,
            access_key: AccessKey::Secret(Vec::new()),
            encryption_key: Vec::new(),
            window_size: DEFAULT_WINDOW_SIZE,
            timers: TimerConfig::default(),
            cipher: Arc::new(Plaintext),
        }
    }
}

fn check_window_size(window_size: usize) -> Result<(), ConnError> {
    if window_size == 0 {
        return Err(ConnError::InvalidConfig("window_size must be at least 1"));
    }
    Ok(())
}
