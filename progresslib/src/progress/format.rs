use std::{fmt, time::Duration};

use number_prefix::NumberPrefix;

/// File size in base 2 units.
#[derive(Debug)]
pub struct BinarySize(pub u64);

impl fmt::Display for BinarySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NumberPrefix::binary(self.0 as f64) {
            NumberPrefix::Standalone(number) => write!(f, "{number:.0}B"),
            NumberPrefix::Prefixed(prefix, number) => write!(f, "{number:.2}{prefix}B"),
        }
    }
}

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;

/// Remaining time, showing only the two most significant units.
#[derive(Debug)]
pub struct Eta(pub Option<u64>);

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(secs) = self.0 else {
            return f.write_str("unknown");
        };

        let hours = secs / SECS_PER_HOUR;
        let minutes = secs % SECS_PER_HOUR / SECS_PER_MINUTE;
        let secs = secs % SECS_PER_MINUTE;

        if hours > 0 {
            write!(f, "{hours}h{minutes}m")
        } else if minutes > 0 {
            write!(f, "{minutes}m{secs}s")
        } else {
            write!(f, "{secs}s")
        }
    }
}

/// Elapsed time in `HH:MM:SS` form. Sub-second precision is dropped.
#[derive(Debug)]
pub struct ClockDuration(pub Duration);

impl fmt::Display for ClockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let hours = secs / SECS_PER_HOUR;
        let minutes = secs % SECS_PER_HOUR / SECS_PER_MINUTE;
        let secs = secs % SECS_PER_MINUTE;

        write!(f, "{hours:02}:{minutes:02}:{secs:02}")
    }
}
