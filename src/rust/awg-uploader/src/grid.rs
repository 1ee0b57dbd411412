// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

pub fn ceil_to_grid(value: u64, grid: u64) -> u64 {
    value + (grid - (value % grid)) % grid
}

/// Values this close to a whole sample count are rounded to it.
const SAMPLE_TOLERANCE: f64 = 1e-6;

/// Number of whole samples needed to cover `value`, never negative.
///
/// Absorbs floating point noise from unit conversions, e.g. `50.00000000000001`
/// yields 50 rather than 51.
pub fn ceil_to_samples(value: f64) -> u64 {
    if !(value.is_finite() && value > 0.0) {
        return 0;
    }
    let nearest = value.round();
    if (value - nearest).abs() <= SAMPLE_TOLERANCE {
        nearest as u64
    } else {
        value.ceil() as u64
    }
}
