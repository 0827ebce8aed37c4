//! # Time
//!
//! Wrap-tolerant time arithmetic. Port clocks are free-running `u32`
//! counters that wrap (every ~49.7 days in milliseconds, every ~71.6 minutes
//! in microseconds). Comparisons use serial-number arithmetic, so they stay
//! correct across a wrap as long as the spans involved are shorter than
//! `2^31` units.

/// Returns `true` once `now` is at or past `deadline`.
#[inline]
pub fn reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) as i32 >= 0
}

/// Units left until `deadline`, or 0 if it has been reached.
#[inline]
pub fn remaining(now: u32, deadline: u32) -> u32 {
    if reached(now, deadline) {
        0
    } else {
        deadline.wrapping_sub(now)
    }
}

/// A snapshot of both port clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub ms: u32,
    pub us: u32,
}

/// The earliest instant a sleeping task may be resumed, in the clock
/// domain it was requested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Millis(u32),
    Micros(u32),
}

impl Deadline {
    #[inline]
    pub fn has_passed(self, now: Timestamp) -> bool {
        match self {
            Deadline::Millis(at) => reached(now.ms, at),
            Deadline::Micros(at) => reached(now.us, at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reached_without_wrap() {
        assert!(!reached(99, 100));
        assert!(reached(100, 100));
        assert!(reached(101, 100));
    }

    #[test]
    fn test_reached_across_wrap() {
        let deadline = u32::MAX.wrapping_add(10); // 9
        assert!(!reached(u32::MAX - 5, deadline));
        assert!(!reached(8, deadline));
        assert!(reached(9, deadline));
        assert!(reached(20, deadline));
    }

    #[test]
    fn test_remaining() {
        assert_eq!(remaining(10, 25), 15);
        assert_eq!(remaining(30, 25), 0);
        assert_eq!(remaining(u32::MAX - 1, 3), 5);
    }

    #[test]
    fn test_deadline_uses_its_own_clock() {
        let now = Timestamp { ms: 5, us: 5_400 };
        assert!(Deadline::Millis(5).has_passed(now));
        assert!(!Deadline::Millis(6).has_passed(now));
        assert!(Deadline::Micros(5_400).has_passed(now));
        assert!(!Deadline::Micros(5_401).has_passed(now));
    }
}
