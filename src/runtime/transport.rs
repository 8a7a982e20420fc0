//! Non-blocking transports driven by the session state machine.
//!
//! The state machine only sees the `Transport` trait: receive bytes, step a
//! handshake, step a secure shutdown, query addresses and socket options.
//! `NetStream` implements it for a mio TCP stream, optionally wrapped in a
//! rustls server session.

use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use tracing::trace;

/// Result of one receive attempt.
#[derive(Debug)]
pub enum Recv {
    /// `n > 0` bytes were written into the buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The peer closed its write side.
    Closed,
    /// Hard transport error.
    Error(io::Error),
}

/// Result of one handshake step.
#[derive(Debug)]
pub enum HandshakeStep {
    /// The negotiation finished without error.
    Done,
    WouldBlock,
    Failed(String),
}

/// Result of one secure shutdown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    Done,
    WouldBlock,
}

/// TCP_NODELAY state of a stream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoDelay {
    Unset,
    Set,
}

/// Narrow interface the session state machine drives.
pub trait Transport {
    /// Local address of the accepted socket (getsockname).
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn nodelay(&self) -> NoDelay;

    fn set_nodelay(&mut self) -> io::Result<()>;

    /// Read into `buf`, which is never empty.
    fn recv(&mut self, buf: &mut [u8]) -> Recv;

    /// An end of stream or error was seen behind data already returned; the
    /// next `recv` reports it.
    fn has_pending(&self) -> bool;

    /// Wrap the connection in a TLS server session.
    fn start_tls(&mut self, config: Arc<rustls::ServerConfig>) -> Result<(), rustls::Error>;

    /// Drive the TLS handshake as far as the socket allows.
    fn handshake(&mut self) -> HandshakeStep;

    /// True once a TLS session has finished negotiating.
    fn is_handshaked(&self) -> bool;

    /// True when a TLS session is attached.
    fn is_secure(&self) -> bool;

    /// Send close_notify and flush it as far as the socket allows.
    fn shutdown(&mut self) -> ShutdownStep;

    /// Shut the socket down in both directions.
    fn close(&mut self);
}

/// Accepted TCP connection, optionally carrying TLS.
pub struct NetStream {
    tcp: TcpStream,
    tls: Option<rustls::ServerConnection>,
    nodelay: NoDelay,
    close_notify_sent: bool,
    /// Outcome held back so that decrypted bytes are delivered first.
    pending: Option<Recv>,
}

impl NetStream {
    pub fn new(tcp: TcpStream) -> Self {
        Self {
            tcp,
            tls: None,
            nodelay: NoDelay::Unset,
            close_notify_sent: false,
            pending: None,
        }
    }

    /// Flush pending TLS records. `Ok(false)` means the socket is full.
    fn flush_tls(&mut self) -> io::Result<bool> {
        let Some(tls) = self.tls.as_mut() else {
            return Ok(true);
        };
        while tls.wants_write() {
            match tls.write_tls(&mut self.tcp) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn recv_plain(&mut self, buf: &mut [u8]) -> Recv {
        loop {
            return match self.tcp.read(buf) {
                Ok(0) => Recv::Closed,
                Ok(n) => Recv::Data(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Recv::WouldBlock,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Recv::Error(e),
            };
        }
    }

    /// Decrypt into `buf` until it is full or the socket runs dry, so that a
    /// short result always means the socket has nothing more right now.
    fn recv_tls(&mut self, buf: &mut [u8]) -> Recv {
        let mut filled = 0;

        loop {
            let Some(tls) = self.tls.as_mut() else {
                return Recv::Error(io::Error::new(io::ErrorKind::NotConnected, "no TLS session"));
            };

            let read = tls.reader().read(&mut buf[filled..]);
            match read {
                Ok(0) => return self.defer(filled, Recv::Closed),
                Ok(n) => {
                    filled += n;
                    if filled == buf.len() {
                        return Recv::Data(filled);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return self.defer(filled, Recv::Error(e)),
            }

            match tls.read_tls(&mut self.tcp) {
                Ok(0) => return self.defer(filled, Recv::Closed),
                Ok(n) => trace!(len = n, "read TLS records"),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return self.defer(filled, Recv::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.defer(filled, Recv::Error(e)),
            }

            if let Err(err) = tls.process_new_packets() {
                // best effort: deliver the alert
                let _ = tls.write_tls(&mut self.tcp);
                return self.defer(
                    filled,
                    Recv::Error(io::Error::new(io::ErrorKind::InvalidData, err)),
                );
            }

            if let Err(e) = self.flush_tls() {
                return self.defer(filled, Recv::Error(e));
            }
        }
    }

    /// Report bytes already decrypted before `outcome`, keeping a close or
    /// error for the next call.
    fn defer(&mut self, filled: usize, outcome: Recv) -> Recv {
        if filled == 0 {
            return outcome;
        }
        if !matches!(outcome, Recv::WouldBlock) {
            self.pending = Some(outcome);
        }
        Recv::Data(filled)
    }
}

impl Transport for NetStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    fn nodelay(&self) -> NoDelay {
        self.nodelay
    }

    fn set_nodelay(&mut self) -> io::Result<()> {
        self.tcp.set_nodelay(true)?;
        self.nodelay = NoDelay::Set;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Recv {
        if let Some(outcome) = self.pending.take() {
            return outcome;
        }
        if self.tls.is_some() {
            self.recv_tls(buf)
        } else {
            self.recv_plain(buf)
        }
    }

    fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn start_tls(&mut self, config: Arc<rustls::ServerConfig>) -> Result<(), rustls::Error> {
        self.tls = Some(rustls::ServerConnection::new(config)?);
        Ok(())
    }

    fn handshake(&mut self) -> HandshakeStep {
        loop {
            match self.flush_tls() {
                Ok(true) => {}
                Ok(false) => return HandshakeStep::WouldBlock,
                Err(e) => return HandshakeStep::Failed(e.to_string()),
            }

            let Some(tls) = self.tls.as_mut() else {
                return HandshakeStep::Failed("no TLS session".to_string());
            };
            if !tls.is_handshaking() {
                return HandshakeStep::Done;
            }

            match tls.read_tls(&mut self.tcp) {
                Ok(0) => {
                    return HandshakeStep::Failed("peer closed connection in handshake".to_string())
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeStep::WouldBlock
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return HandshakeStep::Failed(e.to_string()),
            }

            if let Err(err) = tls.process_new_packets() {
                let _ = tls.write_tls(&mut self.tcp);
                return HandshakeStep::Failed(err.to_string());
            }
        }
    }

    fn is_handshaked(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| !tls.is_handshaking())
    }

    fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    fn shutdown(&mut self) -> ShutdownStep {
        match self.tls.as_mut() {
            // nothing to close cleanly before the handshake finished
            Some(tls) if tls.is_handshaking() => return ShutdownStep::Done,
            Some(tls) if !self.close_notify_sent => {
                tls.send_close_notify();
                self.close_notify_sent = true;
            }
            Some(_) => {}
            None => return ShutdownStep::Done,
        }

        match self.flush_tls() {
            Ok(false) => ShutdownStep::WouldBlock,
            Ok(true) | Err(_) => ShutdownStep::Done,
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.tcp.shutdown(Shutdown::Both) {
            trace!(error = %e, "socket shutdown");
        }
    }
}

impl Source for NetStream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.tcp.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.tcp.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.tcp.deregister(registry)
    }
}
