use std::time::Duration;

/// Restart policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Resident memory ceiling in bytes; `None` is unlimited
    pub max_memory: Option<u64>,
    /// Delays indexed by consecutive-failure count; the last entry repeats
    pub backoff: Vec<Duration>,
    /// Consecutive failures at which the policy gives up
    pub max_consecutive_failures: u32,
}

/// Outcome of consulting the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart(Duration),
    GiveUp,
}

impl RestartPolicy {
    /// Create a restart policy with default values
    pub fn new() -> Self {
        Self {
            enabled: true,
            max_memory: None,
            backoff: vec![
                Duration::from_secs(0),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            max_consecutive_failures: 15,
        }
    }

    /// Decide what to do after `consecutive_failures` failures in a row.
    ///
    /// Pure: the table lookup saturates at the last entry, so non-monotonic
    /// schedules behave exactly as written.
    pub fn decide(&self, consecutive_failures: u32) -> RestartDecision {
        if !self.enabled || consecutive_failures >= self.max_consecutive_failures {
            return RestartDecision::GiveUp;
        }

        RestartDecision::Restart(self.delay_for(consecutive_failures))
    }

    /// Decide after a memory recycle that follows `consecutive_failures` failures.
    ///
    /// The recycle counts toward the streak, so the limit is checked against the
    /// count including it, while the delay comes from the entry for the streak
    /// before it: a healthy process gets `backoff[0]`.
    pub fn decide_recycle(&self, consecutive_failures: u32) -> RestartDecision {
        if !self.enabled || consecutive_failures.saturating_add(1) >= self.max_consecutive_failures {
            return RestartDecision::GiveUp;
        }

        RestartDecision::Restart(self.delay_for(consecutive_failures))
    }

    fn delay_for(&self, consecutive_failures: u32) -> Duration {
        match self.backoff.len() {
            0 => Duration::ZERO,
            len => {
                let index = (consecutive_failures as usize).min(len - 1);
                self.backoff[index]
            }
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new()
    }
}
