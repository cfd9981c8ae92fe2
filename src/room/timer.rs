use std::time::Duration;
use tokio::time::Instant;

/// Re-armable one-shot deadline. Backs the save debounce: every accepted
/// update re-arms it, a teardown flush cancels it, and the room loop fires
/// the pending action once the deadline passes. Deadlines are plain
/// `tokio::time::Instant`s, so tests drive it with a paused clock instead
/// of wall-time waits.
#[derive(Debug, Default)]
pub struct FireOnce {
    deadline: Option<Instant>,
}

impl FireOnce {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// (Re)start the window; any previously armed deadline is superseded.
    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
