//! Thread-safe sequence counter for command lines.
//!
//! The player echoes the sequence digit of each command in its reply, which is
//! how a reply is matched to the command that caused it.  The digit is a single
//! character, so the counter cycles through `1..=9` and wraps back to `1`.
//! `0` is never produced; `!` is reserved for unsolicited events.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU8` with `fetch_update`, so concurrent callers each
//! get a distinct digit without taking a lock.

use std::sync::atomic::{AtomicU8, Ordering};

/// Highest sequence digit before wrapping back to 1.
pub const MAX_SEQUENCE: u8 = 9;

/// A cycling counter producing sequence digits `1..=9`.
///
/// # Examples
///
/// ```rust
/// use kscape_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
pub struct SequenceCounter {
    /// Last digit handed out; 0 before the first call.
    inner: AtomicU8,
}

impl SequenceCounter {
    /// Creates a new counter whose first value is 1.
    pub fn new() -> Self {
        Self {
            inner: AtomicU8::new(0),
        }
    }

    /// Returns the next sequence digit, wrapping from 9 back to 1.
    pub fn next(&self) -> u8 {
        let previous = self
            .inner
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(advance(current))
            })
            // The closure never returns None, so both arms carry the old value.
            .unwrap_or_else(|current| current);
        advance(previous)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

fn advance(current: u8) -> u8 {
    if current >= MAX_SEQUENCE {
        1
    } else {
        current + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_first_value_is_one() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn test_wraps_from_nine_to_one() {
        // Arrange
        let counter = SequenceCounter::new();
        for _ in 0..8 {
            counter.next();
        }

        // Act / Assert
        assert_eq!(counter.next(), 9);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn test_never_produces_zero() {
        let counter = SequenceCounter::new();
        for _ in 0..100 {
            let seq = counter.next();
            assert!((1..=9).contains(&seq), "got {seq}");
        }
    }

    #[test]
    fn test_concurrent_callers_cover_every_digit() {
        // Arrange – 9 threads each take one digit from a fresh counter.
        let counter = Arc::new(SequenceCounter::new());
        let handles: Vec<_> = (0..9)
            .map(|_| {
                let c = Arc::clone(&counter);
                std::thread::spawn(move || c.next())
            })
            .collect();

        // Act
        let seen: HashSet<u8> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Assert
        assert_eq!(seen, (1..=9).collect());
    }
}
