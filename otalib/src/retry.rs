use std::time::Duration;

/// How a failed transfer attempt should be treated by the retry policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureClass {
    /// Network-level failure (connection reset, DNS, timeouts, premature EOF).
    Connection,
    /// Local I/O failure (disk full, permission revoked).
    Io,
    /// The server answered, but unsuccessfully. Usually a bad link, so this is
    /// not self-healing.
    Server,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Linear backoff: the n-th retry waits `base_delay * n`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Decide what to do after `failures` failed attempts in the current run
    /// of a transfer job (1 = the initial attempt failed).
    pub fn decide(&self, failures: u32, class: FailureClass) -> RetryDecision {
        if class == FailureClass::Server || failures > self.max_retries {
            return RetryDecision::NoRetry;
        }

        RetryDecision::RetryAfter(self.base_delay.saturating_mul(failures.max(1)))
    }
}
