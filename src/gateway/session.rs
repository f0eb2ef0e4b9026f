//! Pure session state tracking.

use std::time::Duration;

/// Session bookkeeping for one shard.
///
/// No I/O happens here; the connection manager feeds observations in and
/// consults [`Session::can_resume`] on every (re)connect. The sequence number
/// only moves forward within a connection epoch.
#[derive(Debug, Default, Clone)]
pub struct Session {
    session_id: Option<String>,
    last_sequence: Option<u64>,
    heartbeat_interval: Option<Duration>,
    trace: Vec<String>,
}

impl Session {
    /// Create empty state, the next connect will identify fresh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the server hello.
    pub fn observe_hello(&mut self, heartbeat_interval: Duration, trace: Vec<String>) {
        self.heartbeat_interval = Some(heartbeat_interval);
        self.trace = trace;
    }

    /// Record the sequence number of a dispatch. Envelopes without one leave
    /// the state unchanged, stale numbers are ignored.
    pub fn observe_sequence(&mut self, seq: Option<u64>) {
        if let Some(seq) = seq {
            if self.last_sequence.map_or(true, |last| seq > last) {
                self.last_sequence = Some(seq);
            }
        }
    }

    /// Record a completed fresh handshake.
    pub fn observe_ready(&mut self, session_id: String, trace: Vec<String>) {
        self.session_id = Some(session_id);
        if !trace.is_empty() {
            self.trace = trace;
        }
    }

    /// Record a server "invalid session" signal. Non-resumable ones discard
    /// the session so the next connect identifies fresh.
    pub fn observe_invalid_session(&mut self, resumable: bool) {
        if !resumable {
            self.session_id = None;
            self.last_sequence = None;
        }
    }

    /// Discard the session entirely.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether the next connect may send a resume instead of identify.
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    /// Current session id.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Last seen sequence number.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Heartbeat interval dictated by the last hello.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    /// Gateway server names from the last hello/ready.
    pub fn trace(&self) -> &[String] {
        &self.trace
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fresh_session_identifies() {
        let session = Session::new();
        assert!(!session.can_resume());
        assert_eq!(session.last_sequence(), None);
    }

    #[test]
    fn test_ready_enables_resume() {
        let mut session = Session::new();
        session.observe_ready("abc".to_string(), vec!["trace-a".to_string()]);

        assert!(session.can_resume());
        assert_eq!(session.session_id(), Some("abc"));
        assert_eq!(session.trace(), ["trace-a".to_string()]);
    }

    #[test]
    fn test_sequence_only_moves_forward() {
        let mut session = Session::new();
        session.observe_sequence(Some(5));
        session.observe_sequence(Some(3));
        session.observe_sequence(None);

        assert_eq!(session.last_sequence(), Some(5));

        session.observe_sequence(Some(6));
        assert_eq!(session.last_sequence(), Some(6));
    }

    #[test]
    fn test_invalid_session_resumable_keeps_state() {
        let mut session = Session::new();
        session.observe_ready("abc".to_string(), vec![]);
        session.observe_sequence(Some(10));

        session.observe_invalid_session(true);

        assert!(session.can_resume());
        assert_eq!(session.last_sequence(), Some(10));
    }

    #[test]
    fn test_invalid_session_not_resumable_clears_state() {
        let mut session = Session::new();
        session.observe_ready("abc".to_string(), vec![]);
        session.observe_sequence(Some(10));

        session.observe_invalid_session(false);

        assert!(!session.can_resume());
        assert_eq!(session.last_sequence(), None);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut session = Session::new();
        session.observe_hello(Duration::from_millis(41250), vec!["t".to_string()]);
        session.observe_ready("abc".to_string(), vec![]);
        session.observe_sequence(Some(10));

        session.reset();

        assert!(!session.can_resume());
        assert_eq!(session.last_sequence(), None);
        assert_eq!(session.heartbeat_interval(), None);
        assert!(session.trace().is_empty());
    }
}
