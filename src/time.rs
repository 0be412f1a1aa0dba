//! Wall-clock duration/timestamp type used by the timed-signal subsystem.
//!
//! A narrow hardware-tick counter widened into a full timestamp via a
//! stable anchor, expressed directly in `hours`/`micros` units rather than
//! a raw tick count, since the timer ISR reasons about absolute time in
//! those units.

/// An absolute timestamp or a duration, expressed as hours plus microseconds
/// within the hour.
///
/// `hours` uses only its low 15 bits: once
/// `time_last_stable.hours` reaches `0x8000` the high bit is cleared and the
/// high bits of every scheduled `trigger_time.hours` are masked the same
/// way, keeping delay arithmetic within a single wraparound window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeUnit {
    pub hours: u16,
    pub micros: u32,
}

const MICROS_PER_HOUR: u32 = 3_600_000_000;

impl TimeUnit {
    pub const ZERO: TimeUnit = TimeUnit { hours: 0, micros: 0 };

    /// Bitmask applied to `hours` fields per the 15-bit wraparound rule.
    pub const HOURS_MASK: u16 = 0x7fff;

    pub const fn new(hours: u16, micros: u32) -> Self {
        Self { hours, micros }
    }

    pub const fn from_micros(micros: u64) -> Self {
        let hours = (micros / MICROS_PER_HOUR as u64) as u16;
        let rem = (micros % MICROS_PER_HOUR as u64) as u32;
        Self { hours, micros: rem }
    }

    pub const fn as_micros(self) -> u64 {
        (self.hours as u64) * (MICROS_PER_HOUR as u64) + self.micros as u64
    }

    /// Add a duration to an absolute time, masking `hours` to 15 bits per
    /// the wraparound rule.
    pub fn checked_add(self, rhs: TimeUnit) -> Option<TimeUnit> {
        let micros = self.micros as u64 + rhs.micros as u64;
        let (micros, carry) = if micros >= MICROS_PER_HOUR as u64 {
            (micros - MICROS_PER_HOUR as u64, 1u16)
        } else {
            (micros, 0)
        };
        let hours = self.hours.checked_add(rhs.hours)?.checked_add(carry)?;
        Some(TimeUnit {
            hours: hours & Self::HOURS_MASK,
            micros: micros as u32,
        })
    }

    /// Mask `hours` to its low 15 bits, per the anchor-advance rule.
    pub fn masked(self) -> TimeUnit {
        TimeUnit {
            hours: self.hours & Self::HOURS_MASK,
            micros: self.micros,
        }
    }
}

impl PartialOrd for TimeUnit {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeUnit {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.hours, self.micros).cmp(&(other.hours, other.micros))
    }
}
