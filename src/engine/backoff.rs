use std::time::Duration;

/// Power-saving delay: 1 s doubling to 30 s
pub const SILENCE_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const SILENCE_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Hardware recovery delay: 0.5 s doubling to 10 s
pub const RECOVERY_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const RECOVERY_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Doubling delay with a ceiling
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    pub fn silence() -> Self {
        Self::new(SILENCE_BACKOFF_BASE, SILENCE_BACKOFF_CAP)
    }

    pub fn recovery() -> Self {
        Self::new(RECOVERY_BACKOFF_BASE, RECOVERY_BACKOFF_CAP)
    }

    /// Delay to use now; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Delay the next call will return
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
