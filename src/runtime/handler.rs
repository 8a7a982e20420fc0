//! Application-level consumers of received bytes.
//!
//! The receive loop imposes no framing: whatever it accumulated in one
//! readiness callback is handed to a `SessionHandler`, after which the
//! session's buffer is rewound and reused.

use crate::runtime::session::Session;
use tracing::info;

/// Consumer of the bytes accumulated by the receive loop.
pub trait SessionHandler {
    /// Called with the buffer contents of one receive pass. `data` is only
    /// valid for the duration of the call.
    fn on_data(&mut self, session: &mut Session, data: &[u8]);
}

/// Number of hand-offs a session has seen, kept in its context slots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandoffCount(pub u64);

/// Default handler: logs each hand-off.
#[derive(Debug, Default)]
pub struct LogHandler;

impl SessionHandler for LogHandler {
    fn on_data(&mut self, session: &mut Session, data: &[u8]) {
        let count = session.ctx_mut().get_or_insert_with(HandoffCount::default);
        count.0 += 1;
        let handoff = count.0;

        info!(
            session = session.id(),
            client = %session.client(),
            addr = session.addr_text(),
            handoff,
            len = data.len(),
            received = session.received(),
            data = %String::from_utf8_lossy(data),
            "recv"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::server::ServerConf;
    use std::sync::Arc;

    #[test]
    fn test_log_handler_counts_handoffs() {
        let mut session = Session::new(
            3,
            "127.0.0.1:4000".parse().unwrap(),
            "127.0.0.1:9000".into(),
            Arc::new(ServerConf::new("test")),
        );
        let mut handler = LogHandler;

        handler.on_data(&mut session, b"abc");
        handler.on_data(&mut session, b"\xff\xfe");

        assert_eq!(session.ctx().get::<HandoffCount>(), Some(&HandoffCount(2)));
    }
}
