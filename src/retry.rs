use std::time::Duration;

/// Where a target's scrape stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Init,
    Attempting,
    Retrying,
    Succeeded,
    Failed,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Succeeded | AttemptState::Failed)
    }
}

/// Retry envelope for one target. `budget` is the total number of
/// attempts; every failed attempt spends one, and a retry happens only
/// while some are left.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    state: AttemptState,
    retries_left: u32,
    attempts: u32,
    backoff: Duration,
}

impl RetryMachine {
    pub fn new(budget: u32, backoff: Duration) -> Self {
        RetryMachine {
            state: AttemptState::Init,
            retries_left: budget.max(1),
            attempts: 0,
            backoff,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Init → Attempting, once a fresh source is in hand.
    pub fn begin_attempt(&mut self) {
        debug_assert_eq!(self.state, AttemptState::Init);
        self.attempts += 1;
        self.state = AttemptState::Attempting;
    }

    /// Attempting → Succeeded.
    pub fn succeed(&mut self) {
        self.state = AttemptState::Succeeded;
    }

    /// Attempting (or a failed open in Init) → Retrying or Failed.
    pub fn fail(&mut self) -> AttemptState {
        if self.state == AttemptState::Init {
            // Opening the source counts as the attempt.
            self.attempts += 1;
        }
        self.retries_left = self.retries_left.saturating_sub(1);
        self.state = if self.retries_left > 0 {
            AttemptState::Retrying
        } else {
            AttemptState::Failed
        };
        self.state
    }

    /// Retrying → Init, after the backoff pause.
    pub fn resume(&mut self) {
        debug_assert_eq!(self.state, AttemptState::Retrying);
        self.state = AttemptState::Init;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_attempt_failing_spends_whole_budget() {
        let mut m = RetryMachine::new(3, Duration::ZERO);
        let mut trace = Vec::new();
        while !m.state().is_terminal() {
            m.begin_attempt();
            let next = m.fail();
            trace.push(next);
            if next == AttemptState::Retrying {
                m.resume();
            }
        }
        assert_eq!(m.attempts(), 3);
        assert_eq!(
            trace,
            vec![AttemptState::Retrying, AttemptState::Retrying, AttemptState::Failed]
        );
    }

    #[test]
    fn success_after_retry() {
        let mut m = RetryMachine::new(3, Duration::from_millis(10));
        m.begin_attempt();
        assert_eq!(m.fail(), AttemptState::Retrying);
        m.resume();
        m.begin_attempt();
        m.succeed();
        assert_eq!(m.state(), AttemptState::Succeeded);
        assert_eq!(m.attempts(), 2);
        assert_eq!(m.retries_left(), 2);
    }

    #[test]
    fn open_failure_counts_as_attempt() {
        let mut m = RetryMachine::new(1, Duration::ZERO);
        assert_eq!(m.fail(), AttemptState::Failed);
        assert_eq!(m.attempts(), 1);
    }

    #[test]
    fn zero_budget_still_tries_once() {
        let mut m = RetryMachine::new(0, Duration::ZERO);
        m.begin_attempt();
        assert_eq!(m.fail(), AttemptState::Failed);
        assert_eq!(m.attempts(), 1);
    }
}
