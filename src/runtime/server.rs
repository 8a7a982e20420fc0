//! Virtual server configuration.
//!
//! A `ServerConf` is built once at startup and shared read-only by every
//! address it listens on and every session that selects it.

use crate::runtime::phase::SessionPhase;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default receive buffer capacity in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 10;

/// Default time allowed for a TLS handshake to complete.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration of one virtual server.
pub struct ServerConf {
    /// Name used in log context.
    pub name: String,
    /// Apply TCP_NODELAY on stream connections.
    pub tcp_nodelay: bool,
    /// Enable SO_KEEPALIVE on listening sockets.
    pub so_keepalive: bool,
    /// Capacity of each session's receive buffer.
    pub buffer_size: usize,
    /// Deadline for the TLS handshake on encrypted listeners.
    pub handshake_timeout: Duration,
    /// Certificate material for encrypted listeners.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Connection limiting phase, run first.
    pub limit_conn: Option<Box<dyn SessionPhase>>,
    /// Access control phase, run after limiting.
    pub access: Option<Box<dyn SessionPhase>>,
}

impl ServerConf {
    /// Plain server with default options and no phases.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tcp_nodelay: true,
            so_keepalive: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tls: None,
            limit_conn: None,
            access: None,
        }
    }
}

impl fmt::Debug for ServerConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConf")
            .field("name", &self.name)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("so_keepalive", &self.so_keepalive)
            .field("buffer_size", &self.buffer_size)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("tls", &self.tls.is_some())
            .field("limit_conn", &self.limit_conn)
            .field("access", &self.access)
            .finish()
    }
}
