use std::thread;
use std::time::Duration;

/// Exponential backoff applied while a downstream conveyor is full.
///
/// A full conveyor makes `push` fail immediately; the producer snoozes and
/// tries again, so a slow consumer throttles every stage feeding it.
#[derive(Debug, Clone)]
pub struct PushBackoff {
    /// Number of consecutive failed attempts
    attempt: u32,
    /// Upper bound for a single sleep, in microseconds
    max_micros: u64,
}

impl PushBackoff {
    /// Create a new backoff
    /// Default: 1µs doubling up to 1ms
    pub fn new() -> Self {
        Self {
            attempt: 0,
            max_micros: 1000,
        }
    }

    /// Set a custom cap for a single sleep
    pub fn with_max_delay(max: Duration) -> Self {
        Self {
            attempt: 0,
            max_micros: (max.as_micros() as u64).max(1),
        }
    }

    /// Delay the next snooze will sleep for
    pub fn next_delay(&self) -> Duration {
        let micros = (1u64 << self.attempt.min(20)).min(self.max_micros);
        Duration::from_micros(micros)
    }

    /// Sleep for the current delay and grow it for the next attempt
    pub fn snooze(&mut self) {
        thread::sleep(self.next_delay());
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Reset after a successful push
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for PushBackoff {
    fn default() -> Self {
        Self::new()
    }
}
