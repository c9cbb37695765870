use std::time::Duration;

/// Two-state (idle/triggered) gate with a refractory window.
///
/// A trigger is accepted when the condition holds and at least `window` has
/// elapsed since the previous acceptance. A channel that has never fired
/// accepts immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Debouncer {
    window: Duration,
    last_accepted: Option<Duration>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: None,
        }
    }

    pub fn accept(&mut self, condition: bool, now: Duration) -> bool {
        if !condition {
            return false;
        }

        let elapsed = match self.last_accepted {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.window,
        };

        if elapsed {
            self.last_accepted = Some(now);
        }
        elapsed
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn last_accepted(&self) -> Option<Duration> {
        self.last_accepted
    }

    /// Forgets the last acceptance.
    pub fn clear(&mut self) {
        self.last_accepted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn holds_off_until_window_elapses() {
        let mut gate = Debouncer::new(ms(50));

        assert!(!gate.accept(false, ms(0)));
        assert!(gate.accept(true, ms(10)));
        assert!(!gate.accept(true, ms(20)));
        assert!(!gate.accept(true, ms(30)));
        assert!(gate.accept(true, ms(60)));
        assert_eq!(gate.last_accepted(), Some(ms(60)));
    }

    #[test]
    fn continuous_condition_never_fires_inside_window() {
        let window = ms(25);
        let mut gate = Debouncer::new(window);
        let mut accepted = Vec::new();

        for t in 0..200 {
            if gate.accept(true, ms(t)) {
                accepted.push(t);
            }
        }

        for pair in accepted.windows(2) {
            assert!(ms(pair[1] - pair[0]) >= window);
        }
        assert_eq!(accepted.first(), Some(&0));
        assert_eq!(accepted.len(), 8);
    }

    #[test]
    fn zero_window_accepts_every_time_condition_holds() {
        let mut gate = Debouncer::new(Duration::ZERO);
        assert!(gate.accept(true, ms(1)));
        assert!(gate.accept(true, ms(1)));
        assert!(!gate.accept(false, ms(2)));
    }
}
