//! Wall-clock-aligned interval arithmetic.
//!
//! Analysis intervals are fixed-length buckets aligned to multiples of
//! the configured interval length, so every worker derives the same
//! boundaries from packet timestamps alone.

/// The interval a worker is currently filling. Interval 0 has a start
/// time of 0 until the first admitted packet pins it to a boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interval {
    pub number: u32,
    pub start_time: u32,
}

/// Start of the interval containing `ts`.
pub fn interval_floor(ts: u32, interval_seconds: u32) -> u32 {
    ts - (ts % interval_seconds)
}
