//! Definition of counters, used for retry attempts, and message IDs.

/// Counter errors.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The counter exceeded its maximum value and wrapped.
    Exceeded,
}

/// A wrapping counter with a per-purpose maximum value.
#[derive(Debug, Clone, Copy)]
pub struct Counter {
    value: u8,
    max_value: u8,
}

/// The purposes that counters exist for.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterType {
    /// Bounds attempts to advertise source capabilities.
    Caps,
    /// Bounds attempts to discover the port partner's identity.
    DiscoverIdentity,
    /// Bounds hard reset attempts within one session.
    HardReset,
    /// Bounds hard resets that were caused by failed power role swaps.
    SwapHardReset,
    /// The rolling message ID.
    MessageId,
    /// Bounds message retransmissions.
    Retry,
}

impl Counter {
    /// Create a zeroed counter for a given purpose.
    pub fn new(counter_type: CounterType) -> Self {
        let max_value = match counter_type {
            CounterType::Caps => 16,
            CounterType::DiscoverIdentity => 20,
            CounterType::HardReset => 4,
            CounterType::SwapHardReset => 4,
            CounterType::MessageId => 7,
            CounterType::Retry => 3,
        };

        Self { value: 0, max_value }
    }

    /// Create a counter for a given purpose, preset to a value.
    pub fn new_from_value(counter_type: CounterType, value: u8) -> Self {
        let mut counter = Self::new(counter_type);
        counter.set(value);
        counter
    }

    /// Set the counter value, wrapping at the maximum.
    pub fn set(&mut self, value: u8) {
        self.value = value % (self.max_value + 1);
    }

    /// Get the current counter value.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Increment the counter.
    ///
    /// Reports [`Error::Exceeded`] when the counter wraps past its maximum.
    pub fn increment(&mut self) -> Result<(), Error> {
        self.set(self.value + 1);

        if self.value == 0 { Err(Error::Exceeded) } else { Ok(()) }
    }

    /// Reset the counter to zero.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{Counter, CounterType};

    #[test]
    fn message_id_wraps_modulo_eight() {
        let mut counter = Counter::new(CounterType::MessageId);

        for expected in 1..=7 {
            counter.increment().unwrap();
            assert_eq!(counter.value(), expected);
        }

        // The eighth increment wraps back to zero and reports the wrap.
        assert!(counter.increment().is_err());
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn retry_counter_allows_three_attempts() {
        let mut counter = Counter::new(CounterType::Retry);

        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_err());
    }

    #[test]
    fn hard_reset_counter_allows_four_attempts() {
        let mut counter = Counter::new(CounterType::HardReset);

        for _ in 0..4 {
            assert!(counter.increment().is_ok());
        }
        assert!(counter.increment().is_err());
    }
}
