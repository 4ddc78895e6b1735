use std::time::Duration;

/// Restart delay that doubles on every quick crash
///
/// A run that stayed up for at least `stable_after` is taken as a sign the
/// child recovered, and the delay drops back to `initial`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    stable_after: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, stable_after: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            stable_after,
            current: initial,
        }
    }

    /// Delay to wait before the next start, given how long the last run lasted
    pub fn next_delay(&mut self, ran_for: Duration) -> Duration {
        if ran_for >= self.stable_after {
            self.current = self.initial;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}
