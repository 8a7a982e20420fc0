//! Event-loop services used by the session state machine.
//!
//! `Reactor` is what a connection can ask of its event loop: re-arm read
//! readiness, arm or cancel its handshake timer, post a deferred read, and
//! drop out of the loop at teardown. `MioReactor` implements it on top of a
//! mio `Registry` with an ordered timer set and a posted-event queue that
//! the worker drains after every poll.

use mio::event::Source;
use mio::{Interest, Registry, Token};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::time::{Duration, Instant};
use tracing::trace;

/// Interest every connection is registered with. Registrations are
/// edge-triggered, so a consumer must read until would-block or post
/// itself to be called again.
pub const CONNECTION_INTEREST: Interest = Interest::READABLE.add(Interest::WRITABLE);

pub trait Reactor<S: ?Sized> {
    /// Ask to be told again when `source` becomes readable.
    fn rearm_read(&mut self, token: Token, source: &mut S) -> io::Result<()>;

    /// Remove `source` from the loop, together with its timer and any
    /// posted event.
    fn deregister(&mut self, token: Token, source: &mut S);

    /// Fire a timeout for `token` after `after`, replacing any earlier timer.
    fn arm_timer(&mut self, token: Token, after: Duration);

    fn cancel_timer(&mut self, token: Token);

    fn timer_armed(&self, token: Token) -> bool;

    /// Deliver a read event for `token` after the current poll batch.
    fn post_read(&mut self, token: Token);
}

/// mio-backed reactor owned by one worker.
pub struct MioReactor {
    registry: Registry,
    timers: BTreeSet<(Instant, usize)>,
    deadlines: HashMap<usize, Instant>,
    posted: VecDeque<Token>,
}

impl MioReactor {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            timers: BTreeSet::new(),
            deadlines: HashMap::new(),
            posted: VecDeque::new(),
        }
    }

    /// Register a freshly accepted connection.
    pub fn register<S: Source + ?Sized>(&self, token: Token, source: &mut S) -> io::Result<()> {
        self.registry.register(source, token, CONNECTION_INTEREST)
    }

    /// Longest the next poll may block: zero with posted events pending,
    /// otherwise until the earliest timer.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        if !self.posted.is_empty() {
            return Some(Duration::ZERO);
        }
        self.timers
            .first()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    /// Remove and return every timer due at `now`.
    pub fn expired(&mut self, now: Instant) -> Vec<Token> {
        let mut due = Vec::new();
        while let Some(&(deadline, key)) = self.timers.first() {
            if deadline > now {
                break;
            }
            self.timers.pop_first();
            self.deadlines.remove(&key);
            due.push(Token(key));
        }
        due
    }

    /// Take the posted events queued so far. Events posted while these are
    /// handled wait for the next batch.
    pub fn take_posted(&mut self) -> VecDeque<Token> {
        std::mem::take(&mut self.posted)
    }

    fn remove_timer(&mut self, key: usize) {
        if let Some(deadline) = self.deadlines.remove(&key) {
            self.timers.remove(&(deadline, key));
        }
    }
}

impl<S: Source + ?Sized> Reactor<S> for MioReactor {
    fn rearm_read(&mut self, token: Token, source: &mut S) -> io::Result<()> {
        self.registry.reregister(source, token, CONNECTION_INTEREST)
    }

    fn deregister(&mut self, token: Token, source: &mut S) {
        if let Err(e) = self.registry.deregister(source) {
            trace!(token = token.0, error = %e, "deregister");
        }
        self.remove_timer(token.0);
        self.posted.retain(|posted| *posted != token);
    }

    fn arm_timer(&mut self, token: Token, after: Duration) {
        self.remove_timer(token.0);
        let deadline = Instant::now() + after;
        self.timers.insert((deadline, token.0));
        self.deadlines.insert(token.0, deadline);
    }

    fn cancel_timer(&mut self, token: Token) {
        self.remove_timer(token.0);
    }

    fn timer_armed(&self, token: Token) -> bool {
        self.deadlines.contains_key(&token.0)
    }

    fn post_read(&mut self, token: Token) {
        if !self.posted.contains(&token) {
            self.posted.push_back(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpStream;
    use mio::Poll;

    fn reactor() -> (Poll, MioReactor) {
        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        (poll, MioReactor::new(registry))
    }

    // The source type parameter only matters for registration calls.
    fn timers(r: &mut MioReactor) -> &mut dyn Reactor<TcpStream> {
        r
    }

    #[test]
    fn test_timers_fire_in_order() {
        let (_poll, mut reactor) = reactor();
        let now = Instant::now();

        timers(&mut reactor).arm_timer(Token(2), Duration::from_millis(20));
        timers(&mut reactor).arm_timer(Token(1), Duration::ZERO);
        assert!(timers(&mut reactor).timer_armed(Token(1)));

        assert!(reactor.next_timeout(now).unwrap() <= Duration::from_millis(20));

        let due = reactor.expired(now + Duration::from_secs(1));
        assert_eq!(due, vec![Token(1), Token(2)]);
        assert!(!timers(&mut reactor).timer_armed(Token(1)));
        assert!(reactor.next_timeout(now).is_none());
    }

    #[test]
    fn test_rearming_replaces_timer() {
        let (_poll, mut reactor) = reactor();

        timers(&mut reactor).arm_timer(Token(5), Duration::ZERO);
        timers(&mut reactor).arm_timer(Token(5), Duration::from_secs(60));

        assert!(reactor.expired(Instant::now()).is_empty());
        timers(&mut reactor).cancel_timer(Token(5));
        assert!(!timers(&mut reactor).timer_armed(Token(5)));
        assert!(reactor.expired(Instant::now() + Duration::from_secs(120)).is_empty());
    }

    #[test]
    fn test_posted_events() {
        let (_poll, mut reactor) = reactor();

        timers(&mut reactor).post_read(Token(3));
        timers(&mut reactor).post_read(Token(3));
        timers(&mut reactor).post_read(Token(4));
        assert_eq!(reactor.next_timeout(Instant::now()), Some(Duration::ZERO));

        let posted = reactor.take_posted();
        assert_eq!(posted, VecDeque::from([Token(3), Token(4)]));
        assert!(reactor.take_posted().is_empty());
    }
}
