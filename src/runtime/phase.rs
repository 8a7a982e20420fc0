//! Pre-handshake session phases: connection limiting and access control.
//!
//! Phases run in a fixed order when a session is created, before any TLS
//! negotiation. The limiting phase must decline (let the session through);
//! any other result aborts. The access phase may allow or decline; anything
//! else aborts.

use crate::runtime::session::Session;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of running a phase against a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseResult {
    /// The phase explicitly accepts the session.
    Ok,
    /// The phase has no opinion; continue.
    Declined,
    /// The session must be closed.
    Deny,
}

/// A check run against a freshly created session.
pub trait SessionPhase: Send + Sync + fmt::Debug {
    /// Name used in logs and `AccessDenied` errors.
    fn name(&self) -> &'static str;

    /// Inspect the session and its client address.
    fn handle(&self, session: &mut Session, client: SocketAddr) -> PhaseResult;
}

/// Limits the number of concurrent sessions of one virtual server.
///
/// The counter is shared by every worker thread; a session that passes
/// holds a `ConnSlot` in its context until teardown.
#[derive(Debug)]
pub struct ConnLimit {
    max: usize,
    active: Arc<AtomicUsize>,
}

/// Occupied slot in a `ConnLimit`, released on drop.
#[derive(Debug)]
pub struct ConnSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConnLimit {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sessions currently holding a slot.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> Option<ConnSlot> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ConnSlot {
                        active: Arc::clone(&self.active),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl SessionPhase for ConnLimit {
    fn name(&self) -> &'static str {
        "limit_conn"
    }

    fn handle(&self, session: &mut Session, client: SocketAddr) -> PhaseResult {
        match self.try_acquire() {
            Some(slot) => {
                session.ctx_mut().insert(slot);
                debug!(
                    session = session.id(),
                    active = self.active(),
                    limit = self.max,
                    "connection slot taken"
                );
                PhaseResult::Declined
            }
            None => {
                info!(
                    session = session.id(),
                    client = %client,
                    limit = self.max,
                    "limiting connections"
                );
                PhaseResult::Deny
            }
        }
    }
}

/// Rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessAction {
    Allow,
    Deny,
}

/// Address or network a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    All,
    V4 { addr: u32, mask: u32 },
    V6 { addr: u128, mask: u128 },
}

impl Network {
    /// Parse `all`, a bare address, or `addr/prefix`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s == "all" {
            return Ok(Network::All);
        }

        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u32 = prefix
                    .parse()
                    .map_err(|_| format!("invalid prefix length in \"{s}\""))?;
                (addr, Some(prefix))
            }
            None => (s, None),
        };

        let ip: IpAddr = addr
            .parse()
            .map_err(|_| format!("invalid address \"{s}\""))?;

        match ip {
            IpAddr::V4(v4) => {
                let prefix = prefix.unwrap_or(32);
                if prefix > 32 {
                    return Err(format!("invalid prefix length in \"{s}\""));
                }
                let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
                Ok(Network::V4 {
                    addr: u32::from(v4) & mask,
                    mask,
                })
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.unwrap_or(128);
                if prefix > 128 {
                    return Err(format!("invalid prefix length in \"{s}\""));
                }
                let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
                Ok(Network::V6 {
                    addr: u128::from(v6) & mask,
                    mask,
                })
            }
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip.to_canonical()) {
            (Network::All, _) => true,
            (Network::V4 { addr, mask }, IpAddr::V4(v4)) => u32::from(v4) & mask == *addr,
            (Network::V6 { addr, mask }, IpAddr::V6(v6)) => u128::from(v6) & mask == *addr,
            _ => false,
        }
    }
}

/// One allow/deny rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRule {
    pub action: AccessAction,
    pub network: Network,
}

/// Ordered allow/deny list; the first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct AccessRules {
    rules: Vec<AccessRule>,
}

impl AccessRules {
    pub fn new(rules: Vec<AccessRule>) -> Self {
        Self { rules }
    }
}

impl SessionPhase for AccessRules {
    fn name(&self) -> &'static str {
        "access"
    }

    fn handle(&self, session: &mut Session, client: SocketAddr) -> PhaseResult {
        let ip = client.ip();
        match self.rules.iter().find(|rule| rule.network.contains(ip)) {
            Some(rule) if rule.action == AccessAction::Allow => PhaseResult::Ok,
            Some(_) => {
                info!(session = session.id(), client = %client, "access forbidden by rule");
                PhaseResult::Deny
            }
            None => {
                debug!(session = session.id(), client = %client, "no access rule matched");
                PhaseResult::Declined
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::server::ServerConf;

    fn session() -> Session {
        Session::new(
            1,
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:9000".into(),
            Arc::new(ServerConf::new("test")),
        )
    }

    #[test]
    fn test_network_parse() {
        assert_eq!(Network::parse("all").unwrap(), Network::All);
        assert_eq!(
            Network::parse("10.1.2.3/8").unwrap(),
            Network::V4 {
                addr: 0x0a00_0000,
                mask: 0xff00_0000
            }
        );
        assert!(matches!(
            Network::parse("::1").unwrap(),
            Network::V6 { addr: 1, mask: u128::MAX }
        ));
        assert!(Network::parse("10.0.0.0/33").is_err());
        assert!(Network::parse("nonsense").is_err());
    }

    #[test]
    fn test_network_contains() {
        let net = Network::parse("192.168.0.0/16").unwrap();
        assert!(net.contains("192.168.44.1".parse().unwrap()));
        assert!(!net.contains("192.169.0.1".parse().unwrap()));
        assert!(net.contains("::ffff:192.168.1.1".parse().unwrap()));
        assert!(!net.contains("fe80::1".parse().unwrap()));

        let zero = Network::parse("0.0.0.0/0").unwrap();
        assert!(zero.contains("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_access_rules_first_match_wins() {
        let rules = AccessRules::new(vec![
            AccessRule {
                action: AccessAction::Deny,
                network: Network::parse("127.0.0.2").unwrap(),
            },
            AccessRule {
                action: AccessAction::Allow,
                network: Network::parse("127.0.0.0/8").unwrap(),
            },
        ]);
        let mut s = session();

        assert_eq!(
            rules.handle(&mut s, "127.0.0.1:1".parse().unwrap()),
            PhaseResult::Ok
        );
        assert_eq!(
            rules.handle(&mut s, "127.0.0.2:1".parse().unwrap()),
            PhaseResult::Deny
        );
        assert_eq!(
            rules.handle(&mut s, "10.0.0.1:1".parse().unwrap()),
            PhaseResult::Declined
        );
    }

    #[test]
    fn test_conn_limit_slots() {
        let limit = ConnLimit::new(1);
        let client = "127.0.0.1:1".parse().unwrap();

        let mut first = session();
        assert_eq!(limit.handle(&mut first, client), PhaseResult::Declined);
        assert_eq!(limit.active(), 1);

        let mut second = session();
        assert_eq!(limit.handle(&mut second, client), PhaseResult::Deny);

        drop(first);
        assert_eq!(limit.active(), 0);

        let mut third = session();
        assert_eq!(limit.handle(&mut third, client), PhaseResult::Declined);
    }
}
