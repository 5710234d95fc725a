use std::time::Duration;

use tokio::time::Instant;

/// Coalescing flush scheduler.
///
/// Every `touch` pushes the deadline out by the quiet period, so a burst of
/// commits produces one flush once the burst is over.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            deadline: None,
        }
    }

    /// Record a write and reschedule the flush
    pub fn touch(&mut self) {
        self.deadline = Some(Instant::now() + self.quiet);
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Disarm, returning whether a flush was owed
    pub fn take(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    /// Resolves at the deadline; never resolves while disarmed
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
