//! Per-connection session state.
//!
//! A session is created once the virtual server for a connection is known
//! and lives until the connection is torn down. It owns its receive buffer
//! and its typed context slots; dropping the session releases all of them
//! together.

use crate::runtime::buffer::ReceiveBuffer;
use crate::runtime::handler::SessionHandler;
use crate::runtime::server::ServerConf;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Progress of the TLS handshake on an encrypted listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl HandshakeState {
    /// Completed and Failed never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Completed | HandshakeState::Failed)
    }
}

/// Context slots keyed by type.
///
/// Each phase or handler stores its own state under its own type, so
/// nothing indexes into a shared table by number.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, returning the previous value of the same type.
    pub fn insert<T: Any>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast().ok().map(|boxed| *boxed))
    }

    pub fn get_or_insert_with<T: Any, F: FnOnce() -> T>(&mut self, f: F) -> &mut T {
        self.map
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(f()))
            .downcast_mut()
            .unwrap_or_else(|| unreachable!("slot keyed by its own TypeId"))
    }

}

#[cfg(test)]
impl Extensions {
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// State of one accepted connection.
pub struct Session {
    id: u64,
    client: SocketAddr,
    addr_text: Arc<str>,
    server: Arc<ServerConf>,
    received: u64,
    ctx: Extensions,
    handshake: Option<HandshakeState>,
    buffer: Option<ReceiveBuffer>,
}

impl Session {
    pub fn new(
        id: u64,
        client: SocketAddr,
        addr_text: Arc<str>,
        server: Arc<ServerConf>,
    ) -> Self {
        Self {
            id,
            client,
            addr_text,
            server,
            received: 0,
            ctx: Extensions::new(),
            handshake: None,
            buffer: None,
        }
    }

    /// Connection number, unique for the life of the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    /// Text of the listen address this session was selected by.
    pub fn addr_text(&self) -> &str {
        &self.addr_text
    }

    pub fn server(&self) -> &Arc<ServerConf> {
        &self.server
    }

    /// Total bytes received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn ctx_mut(&mut self) -> &mut Extensions {
        &mut self.ctx
    }

    /// `None` on plain listeners.
    pub fn handshake(&self) -> Option<HandshakeState> {
        self.handshake
    }

    pub(crate) fn set_handshake(&mut self, state: HandshakeState) {
        debug_assert!(
            !self.handshake.is_some_and(HandshakeState::is_terminal),
            "handshake already finished"
        );
        self.handshake = Some(state);
    }

    pub(crate) fn buffer_mut(&mut self) -> Option<&mut ReceiveBuffer> {
        self.buffer.as_mut()
    }

    pub(crate) fn attach_buffer(&mut self, buffer: ReceiveBuffer) {
        self.buffer = Some(buffer);
    }

    pub(crate) fn add_received(&mut self, n: usize) {
        self.received += n as u64;
    }

    /// Give the buffered bytes to `handler`, then rewind the buffer.
    pub(crate) fn hand_off<H: SessionHandler + ?Sized>(&mut self, handler: &mut H) {
        if let Some(mut buffer) = self.buffer.take() {
            handler.on_data(self, buffer.filled());
            buffer.reset();
            self.buffer = Some(buffer);
        }
    }
}

#[cfg(test)]
impl Session {
    pub fn ctx(&self) -> &Extensions {
        &self.ctx
    }

    pub fn buffer(&self) -> Option<&ReceiveBuffer> {
        self.buffer.as_ref()
    }
}
