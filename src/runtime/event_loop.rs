//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! connection state machine performs non-blocking reads and handshake
//! steps. Uses epoll on Linux, kqueue on macOS.
//!
//! Each turn of the loop:
//! 1. polls, blocking no longer than the earliest handshake timer (or not at
//!    all when posted events are pending),
//! 2. accepts on ready listeners and dispatches connection readiness,
//! 3. fires expired timers,
//! 4. drains the events posted before this turn.

use crate::runtime::addr::{Family, ListeningPort};
use crate::runtime::connection::{Connection, Readiness};
use crate::runtime::handler::SessionHandler;
use crate::runtime::reactor::MioReactor;
use crate::runtime::stats::ConnStats;
use crate::runtime::transport::NetStream;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Listener tokens count down from here; connection tokens are slab keys.
const LISTENER_TOKEN_BASE: usize = usize::MAX;

/// Limits shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_connections: usize,
    pub batch_size: usize,
    /// Listen backlog.
    pub backlog: i32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            batch_size: 1024,
            backlog: 1024,
        }
    }
}

struct Listener {
    socket: TcpListener,
    port: Arc<ListeningPort>,
}

/// One event loop thread's state.
pub struct Worker<H> {
    id: usize,
    poll: Poll,
    events: Events,
    reactor: MioReactor,
    listeners: Vec<Listener>,
    connections: Slab<Connection<NetStream>>,
    max_connections: usize,
    stats: Arc<ConnStats>,
    handler: H,
}

impl<H: SessionHandler> Worker<H> {
    /// Open this worker's listening sockets and register them.
    pub fn new(
        id: usize,
        ports: &[Arc<ListeningPort>],
        settings: &WorkerSettings,
        stats: Arc<ConnStats>,
        handler: H,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let reactor = MioReactor::new(poll.registry().try_clone()?);

        let mut listeners = Vec::with_capacity(ports.len());
        for (i, port) in ports.iter().enumerate() {
            let socket = create_listener(port, settings.backlog)?;
            let mut socket = TcpListener::from_std(socket);
            poll.registry().register(
                &mut socket,
                Token(LISTENER_TOKEN_BASE - i),
                Interest::READABLE,
            )?;
            listeners.push(Listener {
                socket,
                port: Arc::clone(port),
            });
        }

        info!(
            worker = id,
            listeners = listeners.len(),
            max_connections = settings.max_connections,
            "Worker started"
        );

        Ok(Self {
            id,
            poll,
            events: Events::with_capacity(settings.batch_size),
            reactor,
            listeners,
            connections: Slab::with_capacity(settings.max_connections),
            max_connections: settings.max_connections,
            stats,
            handler,
        })
    }

    /// Run until polling fails.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.turn(None)?;
        }
    }

    /// One poll and everything it makes runnable. `max_wait` caps how long
    /// the poll may block.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> io::Result<()> {
        let timeout = match (self.reactor.next_timeout(Instant::now()), max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let Self {
            id,
            events,
            reactor,
            listeners,
            connections,
            max_connections,
            stats,
            handler,
            ..
        } = self;

        for event in events.iter() {
            let token = event.token();
            let listener_idx = LISTENER_TOKEN_BASE - token.0;

            if listener_idx < listeners.len() {
                accept_connections(
                    *id,
                    &listeners[listener_idx],
                    reactor,
                    connections,
                    *max_connections,
                    stats,
                );
                continue;
            }

            let ready = Readiness {
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed(),
                read_closed: event.is_read_closed() || event.is_error(),
            };
            if let Some(conn) = connections.get_mut(token.0) {
                conn.on_ready(reactor, handler, ready);
            }
            reap(connections, token);
        }

        for token in reactor.expired(Instant::now()) {
            if let Some(conn) = connections.get_mut(token.0) {
                conn.on_timeout(reactor);
            }
            reap(connections, token);
        }

        for token in reactor.take_posted() {
            if let Some(conn) = connections.get_mut(token.0) {
                conn.on_ready(reactor, handler, Readiness::READ);
            }
            reap(connections, token);
        }

        Ok(())
    }
}

#[cfg(test)]
impl<H> Worker<H> {
    /// Addresses the listening sockets are actually bound to.
    pub fn local_addrs(&self) -> io::Result<Vec<std::net::SocketAddr>> {
        self.listeners.iter().map(|l| l.socket.local_addr()).collect()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

fn accept_connections(
    worker_id: usize,
    listener: &Listener,
    reactor: &mut MioReactor,
    connections: &mut Slab<Connection<NetStream>>,
    max_connections: usize,
    stats: &Arc<ConnStats>,
) {
    loop {
        match listener.socket.accept() {
            Ok((stream, peer_addr)) => {
                stats.accepted();

                if connections.len() >= max_connections {
                    warn!(worker = worker_id, peer = %peer_addr, "Connection limit reached");
                    continue;
                }

                let entry = connections.vacant_entry();
                let token = Token(entry.key());
                let mut transport = NetStream::new(stream);

                if let Err(e) = reactor.register(token, &mut transport) {
                    error!(worker = worker_id, error = %e, "Failed to register connection");
                    continue;
                }

                let conn = entry.insert(Connection::new(
                    token,
                    stats.next_number(),
                    transport,
                    peer_addr,
                    Arc::clone(&listener.port),
                    Arc::clone(stats),
                ));

                debug!(
                    worker = worker_id,
                    conn = conn.number(),
                    peer = %peer_addr,
                    "Accepted connection"
                );

                conn.init(reactor);
                reap(connections, token);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(worker = worker_id, error = %e, "Accept error");
                break;
            }
        }
    }
}

/// Drop a connection whose teardown has completed.
fn reap(connections: &mut Slab<Connection<NetStream>>, token: Token) {
    if connections.get(token.0).is_some_and(Connection::is_closed) {
        let conn = connections.remove(token.0);
        debug!(conn = conn.number(), "Connection closed");
    }
}

/// Create a listening socket with SO_REUSEPORT so every worker can accept
/// on the same address.
fn create_listener(port: &ListeningPort, backlog: i32) -> io::Result<std::net::TcpListener> {
    let addr = port.bind_addr();
    let socket = socket2::Socket::new(
        match port.family() {
            Family::Inet => socket2::Domain::IPV4,
            Family::Inet6 => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if port.family() == Family::Inet6 {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    if port.so_keepalive() {
        socket.set_keepalive(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::addr::{AddrConf, BoundAddr};
    use crate::runtime::server::ServerConf;
    use crate::runtime::testing::RecordingHandler;
    use crate::runtime::tls::load_server_config;
    use std::io::{BufReader, Read, Write};
    use std::net::{Shutdown, SocketAddr};

    fn testdata(name: &str) -> std::path::PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("testdata")
            .join(name)
    }

    fn single_port(buffer_size: usize) -> Arc<ListeningPort> {
        let mut server = ServerConf::new("loopback");
        server.buffer_size = buffer_size;
        port(server, false)
    }

    fn tls_port(buffer_size: usize) -> Arc<ListeningPort> {
        let mut server = ServerConf::new("secure");
        server.buffer_size = buffer_size;
        server.tls = Some(
            load_server_config(&testdata("server.pem"), &testdata("server.key")).unwrap(),
        );
        port(server, true)
    }

    fn port(server: ServerConf, ssl: bool) -> Arc<ListeningPort> {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        Arc::new(
            ListeningPort::new(
                addr,
                vec![BoundAddr {
                    addr,
                    conf: AddrConf {
                        server: Arc::new(server),
                        addr_text: "127.0.0.1:0".into(),
                        ssl,
                    },
                }],
            )
            .unwrap(),
        )
    }

    fn worker(buffer_size: usize) -> (Worker<RecordingHandler>, Arc<ConnStats>) {
        worker_on(single_port(buffer_size))
    }

    fn worker_on(port: Arc<ListeningPort>) -> (Worker<RecordingHandler>, Arc<ConnStats>) {
        let stats = Arc::new(ConnStats::new());
        let worker = Worker::new(
            0,
            &[port],
            &WorkerSettings::default(),
            Arc::clone(&stats),
            RecordingHandler::default(),
        )
        .unwrap();
        (worker, stats)
    }

    fn turn_until<H: SessionHandler>(worker: &mut Worker<H>, mut done: impl FnMut(&Worker<H>) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(worker) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            worker.turn(Some(Duration::from_millis(20))).unwrap();
        }
    }

    #[test]
    fn test_loopback_receive() {
        let (mut worker, stats) = worker(10);
        let addr = worker.local_addrs().unwrap()[0];

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        turn_until(&mut worker, |w| w.connection_count() == 1);

        client.write_all(b"abc").unwrap();
        turn_until(&mut worker, |w| !w.handler().chunks.is_empty());

        assert_eq!(worker.handler().chunks, vec![b"abc".to_vec()]);
        assert_eq!(worker.connection_count(), 1);
        assert_eq!(stats.snapshot().reading, 1);

        drop(client);
        turn_until(&mut worker, |w| w.connection_count() == 0);
        assert_eq!(stats.snapshot().active, 0);
    }

    #[test]
    fn test_loopback_large_write_is_not_lost() {
        let (mut worker, _) = worker(10);
        let addr = worker.local_addrs().unwrap()[0];

        let payload: Vec<u8> = (0..95u8).map(|i| b'a' + i % 26).collect();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(&payload).unwrap();

        let total = |w: &Worker<RecordingHandler>| -> usize {
            w.handler().chunks.iter().map(Vec::len).sum()
        };
        turn_until(&mut worker, |w| total(w) == payload.len());

        let received: Vec<u8> = worker.handler().chunks.concat();
        assert_eq!(received, payload);
        assert!(worker.handler().chunks.iter().all(|c| c.len() <= 10));
    }

    #[test]
    fn test_loopback_data_and_fin_in_one_edge() {
        let (mut worker, stats) = worker(10);
        let addr = worker.local_addrs().unwrap()[0];

        // data and FIN are both queued before the worker sees the socket
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"abc").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        turn_until(&mut worker, |w| {
            !w.handler().chunks.is_empty() && w.connection_count() == 0
        });

        assert_eq!(worker.handler().chunks, vec![b"abc".to_vec()]);
        assert_eq!(stats.snapshot().active, 0);
    }

    #[test]
    fn test_loopback_tls_session() {
        let (mut worker, stats) = worker_on(tls_port(10));
        let addr = worker.local_addrs().unwrap()[0];

        let mut roots = rustls::RootCertStore::empty();
        let mut ca = BufReader::new(std::fs::File::open(testdata("ca.pem")).unwrap());
        for cert in rustls_pemfile::certs(&mut ca) {
            roots.add(cert.unwrap()).unwrap();
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let client = std::thread::spawn(move || -> io::Result<Vec<u8>> {
            let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
            let conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();
            let sock = std::net::TcpStream::connect(addr)?;
            sock.set_read_timeout(Some(Duration::from_secs(5)))?;

            let mut tls = rustls::StreamOwned::new(conn, sock);
            tls.write_all(b"hello")?;
            tls.conn.send_close_notify();
            tls.flush()?;

            let mut rest = Vec::new();
            tls.read_to_end(&mut rest)?;
            Ok(rest)
        });

        turn_until(&mut worker, |w| {
            !w.handler().chunks.is_empty() && w.connection_count() == 0
        });

        assert_eq!(worker.handler().chunks.concat(), b"hello".to_vec());
        assert_eq!(stats.snapshot().active, 0);
        assert_eq!(stats.snapshot().reading, 0);

        // the server answered with its own close_notify
        let rest = client.join().unwrap().unwrap();
        assert!(rest.is_empty());
    }
}
