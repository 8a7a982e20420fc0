//! Scripted transport, recording reactor and handler for state machine tests.

use crate::runtime::handler::SessionHandler;
use crate::runtime::reactor::Reactor;
use crate::runtime::session::Session;
use crate::runtime::transport::{HandshakeStep, NoDelay, Recv, ShutdownStep, Transport};
use mio::Token;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

enum Step {
    Data(Vec<u8>),
    WouldBlock,
    Closed,
    Error(io::ErrorKind),
}

/// Transport that replays a fixed script of receive outcomes.
///
/// Once the script runs out every receive reports would-block.
#[derive(Default)]
pub struct MockTransport {
    script: VecDeque<Step>,
    handshakes: VecDeque<HandshakeStep>,
    shutdowns: VecDeque<ShutdownStep>,
    local: Option<SocketAddr>,
    fail_nodelay: bool,
    never_handshaked: bool,
    defers_close: bool,
    nodelay: Option<NoDelay>,
    secure: bool,
    handshaked: bool,
    recv_calls: usize,
    handshake_calls: usize,
    shutdown_calls: usize,
    close_calls: usize,
    local_addr_calls: std::cell::Cell<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(mut self, bytes: &[u8]) -> Self {
        self.script.push_back(Step::Data(bytes.to_vec()));
        self
    }

    pub fn would_block(mut self) -> Self {
        self.script.push_back(Step::WouldBlock);
        self
    }

    pub fn closed(mut self) -> Self {
        self.script.push_back(Step::Closed);
        self
    }

    pub fn error(mut self, kind: io::ErrorKind) -> Self {
        self.script.push_back(Step::Error(kind));
        self
    }

    pub fn handshake(mut self, steps: Vec<HandshakeStep>) -> Self {
        self.handshakes.extend(steps);
        self
    }

    pub fn shutdown(mut self, steps: Vec<ShutdownStep>) -> Self {
        self.shutdowns.extend(steps);
        self
    }

    pub fn local_addr(mut self, addr: &str) -> Self {
        self.local = Some(addr.parse().unwrap());
        self
    }

    pub fn fail_nodelay(mut self) -> Self {
        self.fail_nodelay = true;
        self
    }

    /// Report handshakes as finished without ever being negotiated.
    pub fn never_handshaked(mut self) -> Self {
        self.never_handshaked = true;
        self
    }

    /// Report a scripted close or error as already seen behind the data
    /// before it, the way a TLS record layer does.
    pub fn defers_close(mut self) -> Self {
        self.defers_close = true;
        self
    }

    pub fn recv_calls(&self) -> usize {
        self.recv_calls
    }

    pub fn handshake_calls(&self) -> usize {
        self.handshake_calls
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls
    }

    pub fn local_addr_calls(&self) -> usize {
        self.local_addr_calls.get()
    }
}

impl Transport for MockTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.local_addr_calls.set(self.local_addr_calls.get() + 1);
        self.local
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no local address"))
    }

    fn nodelay(&self) -> NoDelay {
        self.nodelay.unwrap_or(NoDelay::Unset)
    }

    fn set_nodelay(&mut self) -> io::Result<()> {
        if self.fail_nodelay {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "setsockopt failed"));
        }
        self.nodelay = Some(NoDelay::Set);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Recv {
        assert!(!buf.is_empty(), "recv called with an empty buffer");
        self.recv_calls += 1;

        match self.script.pop_front() {
            Some(Step::Data(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.script.push_front(Step::Data(bytes.split_off(n)));
                }
                Recv::Data(n)
            }
            Some(Step::WouldBlock) | None => Recv::WouldBlock,
            Some(Step::Closed) => Recv::Closed,
            Some(Step::Error(kind)) => Recv::Error(io::Error::new(kind, "scripted error")),
        }
    }

    fn has_pending(&self) -> bool {
        self.defers_close && matches!(self.script.front(), Some(Step::Closed | Step::Error(_)))
    }

    fn start_tls(&mut self, _config: Arc<rustls::ServerConfig>) -> Result<(), rustls::Error> {
        self.secure = true;
        Ok(())
    }

    fn handshake(&mut self) -> HandshakeStep {
        self.handshake_calls += 1;
        let step = self.handshakes.pop_front().unwrap_or(HandshakeStep::WouldBlock);
        if matches!(step, HandshakeStep::Done) && !self.never_handshaked {
            self.handshaked = true;
        }
        step
    }

    fn is_handshaked(&self) -> bool {
        self.handshaked
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn shutdown(&mut self) -> ShutdownStep {
        self.shutdown_calls += 1;
        self.shutdowns.pop_front().unwrap_or(ShutdownStep::Done)
    }

    fn close(&mut self) {
        self.close_calls += 1;
    }
}

/// Reactor that records what was asked of it.
#[derive(Default)]
pub struct MockReactor {
    pub rearms: usize,
    pub fail_rearm: bool,
    pub deregistered: usize,
    pub timers: HashMap<Token, Duration>,
    pub armed_count: usize,
    pub posted: Vec<Token>,
}

impl<S: ?Sized> Reactor<S> for MockReactor {
    fn rearm_read(&mut self, _token: Token, _source: &mut S) -> io::Result<()> {
        if self.fail_rearm {
            return Err(io::Error::new(io::ErrorKind::Other, "epoll_ctl failed"));
        }
        self.rearms += 1;
        Ok(())
    }

    fn deregister(&mut self, token: Token, _source: &mut S) {
        self.deregistered += 1;
        self.timers.remove(&token);
        self.posted.retain(|posted| *posted != token);
    }

    fn arm_timer(&mut self, token: Token, after: Duration) {
        self.armed_count += 1;
        self.timers.insert(token, after);
    }

    fn cancel_timer(&mut self, token: Token) {
        self.timers.remove(&token);
    }

    fn timer_armed(&self, token: Token) -> bool {
        self.timers.contains_key(&token)
    }

    fn post_read(&mut self, token: Token) {
        if !self.posted.contains(&token) {
            self.posted.push(token);
        }
    }
}

/// Handler that keeps a copy of every hand-off.
#[derive(Default)]
pub struct RecordingHandler {
    pub chunks: Vec<Vec<u8>>,
}

impl SessionHandler for RecordingHandler {
    fn on_data(&mut self, _session: &mut Session, data: &[u8]) {
        self.chunks.push(data.to_vec());
    }
}

/// Server TLS config with no certificates; enough for code paths that
/// never negotiate.
pub fn dummy_tls_config() -> Arc<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(rustls::server::ResolvesServerCertUsingSni::new()));
    Arc::new(config)
}
