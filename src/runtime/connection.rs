//! Connection state machine.
//!
//! A `Connection` goes through, in order:
//! - virtual server selection from the listening port's address table,
//! - session creation and the limiting/access phases,
//! - an optional TLS handshake, suspended on would-block with a timer armed,
//! - the receive loop, driven by read readiness,
//! - teardown, which may itself suspend while a TLS close_notify drains.
//!
//! Every fatal condition funnels through `close`, which runs at most once.
//! All entry points take the reactor explicitly; nothing here blocks.

use crate::error::SessionError;
use crate::runtime::addr::ListeningPort;
use crate::runtime::buffer::ReceiveBuffer;
use crate::runtime::handler::SessionHandler;
use crate::runtime::phase::PhaseResult;
use crate::runtime::reactor::Reactor;
use crate::runtime::session::{HandshakeState, Session};
use crate::runtime::stats::ConnStats;
use crate::runtime::transport::{HandshakeStep, NoDelay, Recv, ShutdownStep, Transport};
use mio::Token;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Teardown progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Open,
    /// Waiting for the socket to take a TLS close_notify. No timer bounds
    /// this state: it ends on the next readiness event or socket error, and
    /// lingers while the peer neither reads nor closes.
    ShuttingDown,
    Closed,
}

/// Which readiness a callback reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// The peer closed its write side or the socket reported an error.
    pub read_closed: bool,
}

impl Readiness {
    pub const READ: Readiness = Readiness {
        readable: true,
        writable: false,
        read_closed: false,
    };
}

/// One accepted connection and its session.
pub struct Connection<T> {
    token: Token,
    number: u64,
    transport: T,
    client: SocketAddr,
    port: Arc<ListeningPort>,
    session: Option<Session>,
    lifecycle: Lifecycle,
    /// Receive and send handlers installed.
    reading: bool,
    /// A readiness event reported end of stream; a short read must not end
    /// the pass without another read being posted.
    read_closed: bool,
    /// What the connection was doing, for log context.
    action: &'static str,
    stats: Arc<ConnStats>,
}

impl<T: Transport> Connection<T> {
    pub fn new(
        token: Token,
        number: u64,
        transport: T,
        client: SocketAddr,
        port: Arc<ListeningPort>,
        stats: Arc<ConnStats>,
    ) -> Self {
        stats.opened();
        Self {
            token,
            number,
            transport,
            client,
            port,
            session: None,
            lifecycle: Lifecycle::Open,
            reading: false,
            read_closed: false,
            action: "accepting connection",
            stats,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == Lifecycle::Closed
    }

    /// Entry point for a freshly accepted connection.
    ///
    /// Either leaves the connection reading, suspends it in the TLS
    /// handshake, or closes it.
    pub fn init<R: Reactor<T>>(&mut self, reactor: &mut R) {
        if let Err(err) = self.start(reactor) {
            self.fail(reactor, err);
        }
    }

    /// Dispatch a readiness callback according to the connection's state.
    pub fn on_ready<R, H>(&mut self, reactor: &mut R, handler: &mut H, ready: Readiness)
    where
        R: Reactor<T>,
        H: SessionHandler + ?Sized,
    {
        match self.lifecycle {
            Lifecycle::Closed => return,
            Lifecycle::ShuttingDown => {
                self.close(reactor);
                return;
            }
            Lifecycle::Open => {}
        }

        if ready.read_closed {
            self.read_closed = true;
        }

        let result = if self.handshake_state() == Some(HandshakeState::InProgress) {
            if ready.readable || ready.writable {
                self.drive_handshake(reactor)
            } else {
                Ok(())
            }
        } else if self.reading {
            if ready.writable {
                trace!(conn = self.number, "write ready");
            }
            self.receive(reactor, handler, ready.readable)
        } else {
            Ok(())
        };

        if let Err(err) = result {
            self.fail(reactor, err);
        }
    }

    /// The connection's timer expired.
    pub fn on_timeout<R: Reactor<T>>(&mut self, reactor: &mut R) {
        if self.lifecycle != Lifecycle::Open {
            return;
        }
        if self.handshake_state() == Some(HandshakeState::InProgress) {
            if let Some(session) = self.session.as_mut() {
                session.set_handshake(HandshakeState::Failed);
            }
            self.fail(
                reactor,
                SessionError::Handshake("handshake timed out".to_string()),
            );
        }
    }

    /// Release the connection and everything its session owns.
    ///
    /// Safe to call from any state and any number of times; only the first
    /// call that gets past a pending TLS shutdown releases anything.
    pub fn close<R: Reactor<T>>(&mut self, reactor: &mut R) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }

        debug!(conn = self.number, client = %self.client, "close stream connection");
        self.action = "closing connection";

        if self.transport.is_secure() && self.transport.shutdown() == ShutdownStep::WouldBlock {
            self.lifecycle = Lifecycle::ShuttingDown;
            return;
        }

        reactor.deregister(self.token, &mut self.transport);
        self.stats.closed(self.reading);
        self.reading = false;
        self.transport.close();
        self.session = None;
        self.lifecycle = Lifecycle::Closed;
    }

    fn handshake_state(&self) -> Option<HandshakeState> {
        self.session.as_ref().and_then(Session::handshake)
    }

    fn session_mut(&mut self) -> Result<&mut Session, SessionError> {
        self.session.as_mut().ok_or_else(|| {
            SessionError::Transport(io::Error::new(io::ErrorKind::NotConnected, "no session"))
        })
    }

    fn start<R: Reactor<T>>(&mut self, reactor: &mut R) -> Result<(), SessionError> {
        // find the server configuration for the address:port
        let port = Arc::clone(&self.port);
        let transport = &self.transport;
        let addr_conf = port.select(|| transport.local_addr())?;
        let server = Arc::clone(&addr_conf.server);

        info!(
            "*{} client {} connected to {}",
            self.number,
            self.client,
            addr_conf.addr_text
        );

        self.session = Some(Session::new(
            self.number,
            self.client,
            Arc::clone(&addr_conf.addr_text),
            Arc::clone(&server),
        ));
        self.action = "initializing connection";

        let client = self.client;
        let session = self.session_mut()?;

        if let Some(phase) = &server.limit_conn {
            if phase.handle(session, client) != PhaseResult::Declined {
                return Err(SessionError::AccessDenied { phase: phase.name() });
            }
        }

        if let Some(phase) = &server.access {
            match phase.handle(session, client) {
                PhaseResult::Ok | PhaseResult::Declined => {}
                PhaseResult::Deny => {
                    return Err(SessionError::AccessDenied { phase: phase.name() })
                }
            }
        }

        if server.tcp_nodelay && self.transport.nodelay() == NoDelay::Unset {
            debug!(conn = self.number, "tcp_nodelay");
            self.transport.set_nodelay().map_err(SessionError::Transport)?;
        }

        if addr_conf.ssl {
            self.action = "SSL handshaking";

            let tls = server.tls.clone().ok_or_else(|| {
                SessionError::Handshake(format!(
                    "no certificate is defined for server \"{}\" listening on SSL port",
                    server.name
                ))
            })?;
            self.transport
                .start_tls(tls)
                .map_err(|e| SessionError::Handshake(e.to_string()))?;
            self.session_mut()?.set_handshake(HandshakeState::NotStarted);

            return self.drive_handshake(reactor);
        }

        self.init_session(reactor)
    }

    fn drive_handshake<R: Reactor<T>>(&mut self, reactor: &mut R) -> Result<(), SessionError> {
        self.session_mut()?.set_handshake(HandshakeState::InProgress);

        match self.transport.handshake() {
            HandshakeStep::WouldBlock => {
                if !reactor.timer_armed(self.token) {
                    let timeout = self.session_mut()?.server().handshake_timeout;
                    reactor.arm_timer(self.token, timeout);
                }
                trace!(conn = self.number, "SSL handshake would block");
                Ok(())
            }
            HandshakeStep::Failed(reason) => {
                self.session_mut()?.set_handshake(HandshakeState::Failed);
                Err(SessionError::Handshake(reason))
            }
            HandshakeStep::Done => self.handshake_done(reactor),
        }
    }

    fn handshake_done<R: Reactor<T>>(&mut self, reactor: &mut R) -> Result<(), SessionError> {
        if reactor.timer_armed(self.token) {
            reactor.cancel_timer(self.token);
        }

        if !self.transport.is_handshaked() {
            self.session_mut()?.set_handshake(HandshakeState::Failed);
            return Err(SessionError::Handshake(
                "connection finished without a handshake".to_string(),
            ));
        }

        self.session_mut()?.set_handshake(HandshakeState::Completed);
        debug!(conn = self.number, "SSL handshake completed");

        self.init_session(reactor)
    }

    /// Steps deferred until the transport is usable: buffer, handlers, read
    /// readiness.
    fn init_session<R: Reactor<T>>(&mut self, reactor: &mut R) -> Result<(), SessionError> {
        self.action = "handling client connection";

        let session = self.session_mut()?;
        let capacity = session.server().buffer_size;
        session.attach_buffer(ReceiveBuffer::new(capacity)?);

        self.reading = true;
        self.stats.started_reading();

        reactor
            .rearm_read(self.token, &mut self.transport)
            .map_err(SessionError::ReadinessRegistration)?;

        // plaintext that arrived with the last handshake flight is already
        // buffered in the TLS session and will not raise readiness again
        if self.transport.is_secure() {
            reactor.post_read(self.token);
        }

        Ok(())
    }

    /// Receive loop for one read-readiness callback.
    fn receive<R, H>(&mut self, reactor: &mut R, handler: &mut H, ready: bool) -> Result<(), SessionError>
    where
        R: Reactor<T>,
        H: SessionHandler + ?Sized,
    {
        if !ready {
            return Ok(());
        }

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(buffer) = session.buffer_mut() else {
            return Ok(());
        };

        let mut nrecv = 0;
        while !buffer.is_full() {
            let offered = buffer.remaining();

            match self.transport.recv(buffer.spare_mut()) {
                Recv::Data(n) => {
                    buffer.advance(n);
                    nrecv += n;
                    if n < offered {
                        // the edge that carried this data also carried the
                        // close; nothing will report it again
                        if self.read_closed || self.transport.has_pending() {
                            reactor.post_read(self.token);
                        }
                        break;
                    }
                }
                Recv::WouldBlock => {
                    reactor
                        .rearm_read(self.token, &mut self.transport)
                        .map_err(SessionError::ReadinessRegistration)?;
                    break;
                }
                Recv::Error(e) => return Err(SessionError::Transport(e)),
                Recv::Closed => {
                    info!(
                        conn = self.number,
                        client = %self.client,
                        action = self.action,
                        "client closed connection"
                    );
                    return Err(SessionError::peer_closed());
                }
            }
        }

        if nrecv == 0 {
            return Ok(());
        }

        let full = buffer.is_full();
        session.add_received(nrecv);

        // come back for the rest after other connections had their turn
        if full {
            reactor.post_read(self.token);
        }

        session.hand_off(handler);
        Ok(())
    }

    fn fail<R: Reactor<T>>(&mut self, reactor: &mut R, err: SessionError) {
        match &err {
            SessionError::Transport(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
            SessionError::AccessDenied { .. } | SessionError::Handshake(_) => {
                info!(
                    conn = self.number,
                    client = %self.client,
                    action = self.action,
                    kind = err.kind(),
                    error = %err,
                    "closing connection"
                );
            }
            _ => {
                warn!(
                    conn = self.number,
                    client = %self.client,
                    action = self.action,
                    kind = err.kind(),
                    error = %err,
                    "closing connection"
                );
            }
        }
        self.close(reactor);
    }
}

#[cfg(test)]
impl<T> Connection<T> {
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}
