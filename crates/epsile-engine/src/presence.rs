use epsile_core::events::ServerEvent;

/// How unpairing decrements the presence counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresenceAccounting {
    /// Historical bookkeeping: ending a conversation always subtracts 2, and a
    /// disconnect that clears the waiting slot subtracts one more.
    #[default]
    Inherited,
    /// Subtract only when a mutual pair actually dissolves.
    Exact,
}

/// Count of connections in an active pairing. Never negative.
#[derive(Debug, Default)]
pub struct PresenceCounter {
    active: u64,
}

impl PresenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> u64 {
        self.active
    }

    pub fn add_pair(&mut self) {
        self.active += 2;
    }

    pub fn remove_pair(&mut self) {
        self.subtract(2);
    }

    /// Compensating decrement applied when a disconnect clears the waiting slot.
    pub fn remove_one(&mut self) {
        self.subtract(1);
    }

    fn subtract(&mut self, n: u64) {
        if self.active < n {
            tracing::debug!(active = self.active, by = n, "Presence decrement clamped at zero");
        }
        self.active = self.active.saturating_sub(n);
    }

    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::presence(self.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_move_by_two() {
        let mut counter = PresenceCounter::new();
        counter.add_pair();
        counter.add_pair();
        assert_eq!(counter.active(), 4);
        counter.remove_pair();
        assert_eq!(counter.active(), 2);
    }

    #[test]
    fn never_goes_negative() {
        let mut counter = PresenceCounter::new();
        counter.remove_one();
        assert_eq!(counter.active(), 0);
        counter.remove_pair();
        assert_eq!(counter.active(), 0);

        counter.add_pair();
        counter.remove_one();
        counter.remove_pair();
        assert_eq!(counter.active(), 0);
    }

    #[test]
    fn event_carries_current_count() {
        let mut counter = PresenceCounter::new();
        counter.add_pair();
        assert_eq!(counter.to_event(), ServerEvent::presence(2));
    }

    #[test]
    fn inherited_is_default() {
        assert_eq!(PresenceAccounting::default(), PresenceAccounting::Inherited);
    }
}
