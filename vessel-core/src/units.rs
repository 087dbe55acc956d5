// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `units` module provides timestamp and timescale conversions.
//!
//! Public timestamps are expressed either as microseconds (`i64`) or seconds (`f64`).
//! Container-internal timestamps are integer ticks of a per-track timescale. All
//! seconds-to-tick conversions round to the nearest tick, and all time queries snap to a
//! stable microsecond grid so that repeated conversions cannot drift.

pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Convert seconds to whole microseconds, rounding to the nearest microsecond.
#[inline]
pub fn secs_to_micros(secs: f64) -> i64 {
    (secs * MICROS_PER_SECOND as f64).round() as i64
}

/// Convert microseconds to seconds.
#[inline]
pub fn micros_to_secs(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_SECOND as f64
}

/// Snap a time in seconds up to the microsecond grid.
///
/// Lookup queries use this so that a time that was previously reported by the library
/// (and therefore lies on the grid) always resolves to the same sample it came from.
#[inline]
pub fn ceil_to_micros(secs: f64) -> f64 {
    (secs * MICROS_PER_SECOND as f64).ceil() / MICROS_PER_SECOND as f64
}

/// Convert seconds to integer timescale ticks, rounding to the nearest tick.
#[inline]
pub fn secs_to_timescale(secs: f64, timescale: u32) -> i64 {
    (secs * f64::from(timescale)).round() as i64
}

/// Convert integer timescale ticks to seconds.
#[inline]
pub fn timescale_to_secs(ticks: i64, timescale: u32) -> f64 {
    ticks as f64 / f64::from(timescale)
}

/// Find the index of the last element in `values` for which `key(value) <= target`.
///
/// Returns `None` for an empty slice or when every key exceeds the target. The midpoint
/// biases high so the search converges onto the last candidate of an equal run.
pub fn binary_search_less_or_equal<T, K>(values: &[T], target: f64, key: K) -> Option<usize>
where
    K: Fn(&T) -> f64,
{
    if values.is_empty() {
        return None;
    }

    let mut lo = 0usize;
    let mut hi = values.len() - 1;

    if key(&values[lo]) > target {
        return None;
    }

    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;

        if key(&values[mid]) <= target {
            lo = mid;
        }
        else {
            hi = mid - 1;
        }
    }

    Some(lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_microsecond_grid() {
        assert_eq!(secs_to_micros(1.5), 1_500_000);
        assert_eq!(secs_to_micros(0.0000015), 2);
        assert_eq!(micros_to_secs(1_500_000), 1.5);

        // A value already on the grid must not move.
        let t = micros_to_secs(333_333);
        assert_eq!(ceil_to_micros(t), t);
    }

    #[test]
    fn verify_timescale_round_trip() {
        // 93 AAC frames of 1024 samples at 48 kHz.
        for i in 0..93i64 {
            let secs = (i * 1024) as f64 / 48_000.0;
            assert_eq!(secs_to_timescale(secs, 48_000), i * 1024);
        }
    }

    #[test]
    fn verify_binary_search_less_or_equal() {
        let empty: [f64; 0] = [];
        assert_eq!(binary_search_less_or_equal(&empty, 1.0, |&v| v), None);

        let one = [2.0];
        assert_eq!(binary_search_less_or_equal(&one, 1.0, |&v| v), None);
        assert_eq!(binary_search_less_or_equal(&one, 2.0, |&v| v), Some(0));

        let values = [0.0, 1.0, 1.0, 2.0, 5.0];
        assert_eq!(binary_search_less_or_equal(&values, -0.5, |&v| v), None);
        assert_eq!(binary_search_less_or_equal(&values, 0.0, |&v| v), Some(0));
        assert_eq!(binary_search_less_or_equal(&values, 1.5, |&v| v), Some(2));
        assert_eq!(binary_search_less_or_equal(&values, 9.0, |&v| v), Some(4));
    }
}
