//! Rate limiting for repeated warnings.
//!
//! Non-fatal conditions such as an open 4–20 mA loop persist for many ticks.
//! [`WarningLimiter`] lets the first warning of a class through, then
//! suppresses the same class until its window has passed.

use crate::limits::WARNING_RATE_LIMIT;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct ClassState {
    last_emitted: Instant,
    suppressed: u64,
}

/// Per-class warning rate limiter.
#[derive(Debug)]
pub struct WarningLimiter {
    window: Duration,
    classes: Mutex<HashMap<String, ClassState>>,
}

impl WarningLimiter {
    /// Limiter allowing one warning per class every `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            classes: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a warning of `class` should be emitted now.
    ///
    /// Returns the number of warnings suppressed since the last emitted one
    /// when it should, `None` otherwise.
    pub fn should_emit(&self, class: &str) -> Option<u64> {
        let now = Instant::now();
        let mut classes = self.classes.lock();
        match classes.get_mut(class) {
            Some(state) if now.duration_since(state.last_emitted) < self.window => {
                state.suppressed += 1;
                None
            }
            Some(state) => {
                let suppressed = state.suppressed;
                *state = ClassState {
                    last_emitted: now,
                    suppressed: 0,
                };
                Some(suppressed)
            }
            None => {
                classes.insert(
                    class.to_string(),
                    ClassState {
                        last_emitted: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Warnings of `class` currently held back.
    pub fn suppressed(&self, class: &str) -> u64 {
        self.classes
            .lock()
            .get(class)
            .map_or(0, |state| state.suppressed)
    }

    /// Forget every class.
    pub fn reset(&self) {
        self.classes.lock().clear();
    }
}

impl Default for WarningLimiter {
    fn default() -> Self {
        Self::new(WARNING_RATE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn one_warning_per_class_per_window() {
        let limiter = WarningLimiter::default();
        assert_eq!(limiter.should_emit("temperature_sensor"), Some(0));
        assert_eq!(limiter.should_emit("temperature_sensor"), None);
        assert_eq!(limiter.should_emit("level_sensor"), Some(0));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(limiter.should_emit("temperature_sensor"), None);
        assert_eq!(limiter.suppressed("temperature_sensor"), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(limiter.should_emit("temperature_sensor"), Some(2));
        assert_eq!(limiter.suppressed("temperature_sensor"), 0);
    }
}
