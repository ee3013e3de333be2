//! 🐢 Exponential backoff for throttled reads.
//!
//! `base · 2^k`, where k counts consecutive throttles. No ceiling. If a table
//! throttles us sixty times in a row the wait saturates at `Duration::MAX` and,
//! frankly, we all have bigger problems by then.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { base, attempts: 0 }
    }

    /// ⏳ The wait for the next retry; bumps the attempt counter.
    pub fn next_wait(&mut self) -> Duration {
        let wait = 2u32
            .checked_pow(self.attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        self.attempts = self.attempts.saturating_add(1);
        wait
    }

    /// 🔢 Consecutive throttles seen since the last successful read.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// ✅ A read went through. Back to square one.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
