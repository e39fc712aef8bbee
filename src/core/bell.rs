//! Visual bell
//!
//! A bell from the backend starts a short pulse whose intensity decays
//! linearly to zero. The render step samples it every frame.

use std::time::{Duration, Instant};

/// Full pulse intensity
pub const BELL_MAX_INTENSITY: u16 = 1000;

/// Default pulse length
pub const BELL_DURATION: Duration = Duration::from_millis(180);

#[derive(Debug, Clone)]
pub struct BellState {
    start: Option<Instant>,
    duration: Duration,
}

impl Default for BellState {
    fn default() -> Self {
        Self::new(BELL_DURATION)
    }
}

impl BellState {
    pub fn new(duration: Duration) -> Self {
        Self {
            start: None,
            duration,
        }
    }

    /// Start (or restart) the pulse at full intensity
    pub fn trigger(&mut self, now: Instant) {
        self.start = Some(now);
    }

    /// Intensity in `0..=BELL_MAX_INTENSITY`; zero means no overlay
    pub fn sample(&self, now: Instant) -> u16 {
        let Some(start) = self.start else {
            return 0;
        };
        if self.duration.is_zero() {
            return 0;
        }

        let elapsed = now.saturating_duration_since(start);
        if elapsed >= self.duration {
            return 0;
        }

        let remaining = (self.duration - elapsed).as_micros();
        let total = self.duration.as_micros();
        (remaining * u128::from(BELL_MAX_INTENSITY) / total) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_never_triggered_is_silent() {
        let bell = BellState::default();
        assert_eq!(bell.sample(Instant::now()), 0);
    }

    #[test]
    fn test_linear_decay() {
        let mut bell = BellState::default();
        let start = Instant::now();
        bell.trigger(start);

        assert_eq!(bell.sample(start), BELL_MAX_INTENSITY);
        assert_eq!(bell.sample(start + ms(90)), 500);
        assert_eq!(bell.sample(start + ms(180)), 0);
        assert_eq!(bell.sample(start + ms(1000)), 0);

        let mut last = bell.sample(start);
        for step in 1..=18 {
            let value = bell.sample(start + ms(step * 10));
            assert!(value < last, "not decreasing at {} ms", step * 10);
            last = value;
        }
    }

    #[test]
    fn test_retrigger_restarts_without_stacking() {
        let mut bell = BellState::default();
        let start = Instant::now();
        bell.trigger(start);
        bell.trigger(start + ms(100));

        assert_eq!(bell.sample(start + ms(100)), BELL_MAX_INTENSITY);
        assert_eq!(bell.sample(start + ms(190)), 500);
        assert!(bell.sample(start + ms(200)) > 0);
        assert_eq!(bell.sample(start + ms(280)), 0);
    }

    #[test]
    fn test_sample_before_trigger_time_is_full() {
        let mut bell = BellState::default();
        let later = Instant::now() + ms(50);
        bell.trigger(later);
        assert_eq!(bell.sample(later - ms(10)), BELL_MAX_INTENSITY);
    }
}
