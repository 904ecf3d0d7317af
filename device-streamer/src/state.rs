use serde::Serialize;
use std::fmt;
use tokio::sync::watch;

/// Lifecycle of a streaming session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum StreamingState {
    Idle,
    Starting,
    Streaming,
    Stopping,
    Stopped,
    Failed(String),
}

impl StreamingState {
    /// States from which a new session may be started.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Stopped | Self::Failed(_))
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    /// A session exists and has not finished tearing down.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Streaming | Self::Stopping)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }
}

impl Default for StreamingState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for StreamingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Starting => write!(f, "STARTING"),
            Self::Streaming => write!(f, "STREAMING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Failed(reason) => write!(f, "FAILED ({})", reason),
        }
    }
}

/// The single authoritative `StreamingState` of a controller.
///
/// Readers get a cheap snapshot or a `watch` subscription; only the owning
/// controller calls `transition`, which checks and swaps the state under the
/// channel's lock so two transitions can never interleave.
pub struct StateMachine {
    tx: watch::Sender<StreamingState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StreamingState::Idle);
        Self { tx }
    }

    pub fn current(&self) -> StreamingState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamingState> {
        self.tx.subscribe()
    }

    /// Move to `next` if `allowed` accepts the current state.
    ///
    /// Returns the previous state on success and the unchanged current state
    /// on rejection.
    pub(crate) fn transition<F>(&self, allowed: F, next: StreamingState) -> Result<StreamingState, StreamingState>
    where
        F: FnOnce(&StreamingState) -> bool,
    {
        let mut outcome = Err(StreamingState::Idle);
        self.tx.send_if_modified(|state| {
            if allowed(state) {
                outcome = Ok(std::mem::replace(state, next));
                true
            } else {
                outcome = Err(state.clone());
                false
            }
        });
        outcome
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_idle() {
        assert_eq!(StateMachine::new().current(), StreamingState::Idle);
    }

    #[test]
    fn test_can_start() {
        assert!(StreamingState::Idle.can_start());
        assert!(StreamingState::Stopped.can_start());
        assert!(StreamingState::Failed("camera gone".into()).can_start());
        assert!(!StreamingState::Starting.can_start());
        assert!(!StreamingState::Streaming.can_start());
        assert!(!StreamingState::Stopping.can_start());
    }

    #[test]
    fn test_transition_accepts_and_rejects() {
        let machine = StateMachine::new();

        let previous = machine.transition(StreamingState::can_start, StreamingState::Starting);
        assert_eq!(previous, Ok(StreamingState::Idle));
        assert_eq!(machine.current(), StreamingState::Starting);

        let rejected = machine.transition(StreamingState::can_start, StreamingState::Starting);
        assert_eq!(rejected, Err(StreamingState::Starting));
        assert_eq!(machine.current(), StreamingState::Starting);
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();

        machine
            .transition(|s| *s == StreamingState::Idle, StreamingState::Starting)
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), StreamingState::Starting);

        // A rejected transition does not wake subscribers.
        assert!(machine
            .transition(|s| *s == StreamingState::Idle, StreamingState::Streaming)
            .is_err());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_display() {
        assert_eq!(StreamingState::Streaming.to_string(), "STREAMING");
        assert_eq!(StreamingState::Failed("no mic".into()).to_string(), "FAILED (no mic)");
    }
}
