use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle of one ingestion session. Ordered: `Open < Draining < Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Receiving frames.
    Open,
    /// Intake ended; the queue is complete and the backlog is being persisted.
    Draining,
    /// All tasks joined, transport closed.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Single-writer cell holding a session's state. Readers subscribe and are
/// woken on every transition.
pub struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Open);
        Self { tx }
    }

    pub fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move forward to `next`. Returns false (and leaves the state untouched)
    /// if `next` is not strictly after the current state.
    pub fn advance(&self, next: SessionState) -> bool {
        self.tx.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_open() {
        assert_eq!(StateCell::new().current(), SessionState::Open);
    }

    #[test]
    fn transitions_are_monotonic() {
        let cell = StateCell::new();
        assert!(cell.advance(SessionState::Draining));
        assert!(!cell.advance(SessionState::Open));
        assert!(!cell.advance(SessionState::Draining));
        assert_eq!(cell.current(), SessionState::Draining);

        assert!(cell.advance(SessionState::Closed));
        assert!(!cell.advance(SessionState::Draining));
        assert_eq!(cell.current(), SessionState::Closed);
    }

    #[test]
    fn open_may_skip_straight_to_closed() {
        let cell = StateCell::new();
        assert!(cell.advance(SessionState::Closed));
        assert_eq!(cell.current(), SessionState::Closed);
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();

        let waiter = tokio::spawn(async move {
            rx.wait_for(|s| *s != SessionState::Open).await.map(|s| *s)
        });

        cell.advance(SessionState::Draining);
        let seen = waiter.await.unwrap().unwrap();
        assert_eq!(seen, SessionState::Draining);
    }

    #[test]
    fn display_strings() {
        assert_eq!(SessionState::Draining.to_string(), "draining");
        assert_eq!(
            serde_json::to_string(&SessionState::Closed).unwrap(),
            "\"closed\""
        );
    }
}
