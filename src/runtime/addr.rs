//! Per-port address tables and virtual server selection.
//!
//! A listening socket may serve several addresses on the same port: the
//! specific ones that were configured plus the `*:port` wildcard, which is
//! always last. A connection's local address picks the entry; anything that
//! matches no specific address falls through to the wildcard.

use crate::error::SessionError;
use crate::runtime::server::ServerConf;
use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;

/// Address family of a listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Family {
    Inet,
    Inet6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::Inet,
            SocketAddr::V6(_) => Family::Inet6,
        }
    }
}

/// What a table entry resolves to.
#[derive(Debug, Clone)]
pub struct AddrConf {
    pub server: Arc<ServerConf>,
    /// The address as written in the configuration, for logs.
    pub addr_text: Arc<str>,
    /// Connections on this address start with a TLS handshake.
    pub ssl: bool,
}

#[derive(Debug, Clone)]
pub struct InAddr {
    pub addr: u32,
    pub conf: AddrConf,
}

#[derive(Debug, Clone)]
pub struct In6Addr {
    pub addr: [u8; 16],
    pub conf: AddrConf,
}

/// Family-specific address table; the wildcard, if any, is the last entry.
#[derive(Debug, Clone)]
pub enum AddrTable {
    V4(Vec<InAddr>),
    V6(Vec<In6Addr>),
}

/// One configured listen address before grouping.
#[derive(Debug, Clone)]
pub struct BoundAddr {
    pub addr: SocketAddr,
    pub conf: AddrConf,
}

impl BoundAddr {
    pub fn is_wildcard(&self) -> bool {
        self.addr.ip().is_unspecified()
    }
}

#[derive(Debug, Error)]
pub enum AddrTableError {
    #[error("listening port has no addresses")]
    Empty,
    #[error("address {0} does not match the family of the listening socket")]
    MixedFamily(SocketAddr),
    #[error("address {0} does not match the port of the listening socket")]
    MixedPort(SocketAddr),
    #[error("more than one address on a port requires the wildcard as the last entry")]
    WildcardNotLast,
    #[error("duplicate listen address {0}")]
    Duplicate(SocketAddr),
}

/// A listening socket and the addresses it serves.
#[derive(Debug)]
pub struct ListeningPort {
    bind: SocketAddr,
    so_keepalive: bool,
    table: AddrTable,
}

impl ListeningPort {
    /// Build a port bound to `bind` that serves `entries` in order.
    ///
    /// With more than one entry the last must be the wildcard and no other
    /// entry may be.
    pub fn new(bind: SocketAddr, entries: Vec<BoundAddr>) -> Result<Self, AddrTableError> {
        if entries.is_empty() {
            return Err(AddrTableError::Empty);
        }

        let family = Family::of(&bind);
        for (i, entry) in entries.iter().enumerate() {
            if Family::of(&entry.addr) != family {
                return Err(AddrTableError::MixedFamily(entry.addr));
            }
            if entry.addr.port() != bind.port() {
                return Err(AddrTableError::MixedPort(entry.addr));
            }
            let last = i + 1 == entries.len();
            if entries.len() > 1 && entry.is_wildcard() != last {
                return Err(AddrTableError::WildcardNotLast);
            }
        }

        let so_keepalive = entries.iter().any(|e| e.conf.server.so_keepalive);

        let table = match family {
            Family::Inet => AddrTable::V4(
                entries
                    .into_iter()
                    .map(|e| InAddr {
                        addr: match e.addr.ip() {
                            IpAddr::V4(v4) => u32::from(v4),
                            IpAddr::V6(_) => unreachable!("family checked above"),
                        },
                        conf: e.conf,
                    })
                    .collect(),
            ),
            Family::Inet6 => AddrTable::V6(
                entries
                    .into_iter()
                    .map(|e| In6Addr {
                        addr: match e.addr.ip() {
                            IpAddr::V6(v6) => v6.octets(),
                            IpAddr::V4(_) => unreachable!("family checked above"),
                        },
                        conf: e.conf,
                    })
                    .collect(),
            ),
        };

        Ok(Self {
            bind,
            so_keepalive,
            table,
        })
    }

    /// Group configured addresses into listening ports.
    ///
    /// Addresses are grouped by family and port. A group that contains a
    /// wildcard becomes a single socket bound to the wildcard, serving the
    /// specific addresses first and the wildcard last. A group without a
    /// wildcard becomes one socket per address.
    pub fn group(addrs: Vec<BoundAddr>) -> Result<Vec<ListeningPort>, AddrTableError> {
        let mut groups: BTreeMap<(Family, u16), Vec<BoundAddr>> = BTreeMap::new();
        for bound in addrs {
            let group = groups
                .entry((Family::of(&bound.addr), bound.addr.port()))
                .or_default();
            if group.iter().any(|b| b.addr == bound.addr) {
                return Err(AddrTableError::Duplicate(bound.addr));
            }
            group.push(bound);
        }

        let mut ports = Vec::new();
        for (_, mut group) in groups {
            match group.iter().position(BoundAddr::is_wildcard) {
                Some(idx) => {
                    let wildcard = group.remove(idx);
                    let bind = wildcard.addr;
                    group.push(wildcard);
                    ports.push(ListeningPort::new(bind, group)?);
                }
                None => {
                    for bound in group {
                        ports.push(ListeningPort::new(bound.addr, vec![bound])?);
                    }
                }
            }
        }

        Ok(ports)
    }

    /// Address the listening socket binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }

    pub fn family(&self) -> Family {
        Family::of(&self.bind)
    }

    pub fn so_keepalive(&self) -> bool {
        self.so_keepalive
    }

    pub fn table(&self) -> &AddrTable {
        &self.table
    }

    /// Configurations served by this socket, in table order.
    pub fn confs(&self) -> Vec<&AddrConf> {
        match self.table() {
            AddrTable::V4(addrs) => addrs.iter().map(|a| &a.conf).collect(),
            AddrTable::V6(addrs) => addrs.iter().map(|a| &a.conf).collect(),
        }
    }

    /// Number of addresses served by this socket.
    pub fn naddrs(&self) -> usize {
        match &self.table {
            AddrTable::V4(addrs) => addrs.len(),
            AddrTable::V6(addrs) => addrs.len(),
        }
    }

    /// Pick the configuration for a connection accepted on this port.
    ///
    /// `local_addr` is only called when the port serves more than one
    /// address; with a single entry its configuration applies as is.
    pub fn select<F>(&self, local_addr: F) -> Result<&AddrConf, SessionError>
    where
        F: FnOnce() -> io::Result<SocketAddr>,
    {
        if self.naddrs() == 1 {
            return Ok(match &self.table {
                AddrTable::V4(addrs) => &addrs[0].conf,
                AddrTable::V6(addrs) => &addrs[0].conf,
            });
        }

        let local = local_addr().map_err(SessionError::AddressResolution)?;

        // the last address is the wildcard
        Ok(match &self.table {
            AddrTable::V6(addrs) => {
                let wanted = match local.ip() {
                    IpAddr::V6(v6) => v6.octets(),
                    IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
                };
                let idx = addrs[..addrs.len() - 1]
                    .iter()
                    .position(|a| a.addr == wanted)
                    .unwrap_or(addrs.len() - 1);
                &addrs[idx].conf
            }
            AddrTable::V4(addrs) => {
                let wanted = match local.ip() {
                    IpAddr::V4(v4) => Some(u32::from(v4)),
                    IpAddr::V6(v6) => v6.to_ipv4_mapped().map(u32::from),
                };
                let idx = addrs[..addrs.len() - 1]
                    .iter()
                    .position(|a| Some(a.addr) == wanted)
                    .unwrap_or(addrs.len() - 1);
                &addrs[idx].conf
            }
        })
    }
}
