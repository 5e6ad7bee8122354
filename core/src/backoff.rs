/// Retry/backoff state for one poll session
use std::time::Duration;

/// What the poll loop should do after a failed fetch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureAction {
    /// Retry after the (grown) interval and report the error
    Retry { retry: u32, delay: Duration },
    /// Retries exhausted: state was reset, skip one poll cycle
    Cooldown { delay: Duration },
}

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    max_retries: u32,
    retries: u32,
    interval: Duration,
    skip_next: bool,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, max_retries: u32) -> Self {
        Self {
            base,
            factor,
            max_retries,
            retries: 0,
            interval: base,
            skip_next: false,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Interval before the next regular poll
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delay until the next fetch, consuming a pending cooldown beat
    pub fn next_delay(&mut self) -> Duration {
        if std::mem::take(&mut self.skip_next) {
            self.interval * 2
        } else {
            self.interval
        }
    }

    pub fn on_success(&mut self) {
        self.retries = 0;
        self.interval = self.base;
        self.skip_next = false;
    }

    pub fn on_failure(&mut self) -> FailureAction {
        self.retries += 1;
        if self.retries <= self.max_retries {
            self.interval = self.interval.mul_f64(self.factor);
            FailureAction::Retry {
                retry: self.retries,
                delay: self.interval,
            }
        } else {
            self.retries = 0;
            self.interval = self.base;
            self.skip_next = true;
            FailureAction::Cooldown {
                delay: self.base * 2,
            }
        }
    }
}
