// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fitting and quantizing LPC predictor coefficients
//!
//! Samples are shaped by a fixed Tukey window, autocorrelated,
//! and run through the Levinson-Durbin recursion, which yields
//! the coefficients of *every* order up to the maximum in one
//! pass along with each order's prediction error energy.

use arrayvec::ArrayVec;

/// The largest supported predictor order (a 5 bit field, plus one)
pub(crate) const MAX_LPC_ORDER: usize = 32;

/// A quantized fixed-point LPC predictor
#[derive(Clone, Debug)]
pub(crate) struct QuantizedLpc {
    /// Coefficient precision, in bits
    pub precision: u32,
    /// Right-shift applied to each prediction's dot product
    pub shift: i32,
    /// The quantized coefficients, most recent sample first
    pub coefficients: ArrayVec<i32, MAX_LPC_ORDER>,
}

impl QuantizedLpc {
    pub fn order(&self) -> usize {
        self.coefficients.len()
    }

    /// The do-nothing predictor for blocks with nothing to model
    ///
    /// Its single coefficient is 0, so the lone post-warm-up
    /// "prediction" is 0 and the residuals are the samples themselves.
    pub fn trivial() -> Self {
        Self {
            precision: 2,
            shift: 0,
            coefficients: std::iter::once(0).collect(),
        }
    }
}

/// The outcome of modeling one block of samples
pub(crate) enum LpcAnalysis {
    /// A single-sample or all-zero block which can't be predicted
    Trivial,
    /// Usable models of every order up to the maximum
    Model(CoefficientTable),
}

/// Models the given samples at every order up to `max_order`
///
/// `max_order` must be at least 1 and below the sample count;
/// `window` must hold at least as many entries as `samples`.
pub(crate) fn analyze(window: &[f64], samples: &[i32], max_order: usize) -> LpcAnalysis {
    if samples.len() < 2 {
        return LpcAnalysis::Trivial;
    }

    let windowed = samples
        .iter()
        .zip(window)
        .map(|(sample, w)| f64::from(*sample) * w)
        .collect::<Vec<_>>();

    let autocorrelated = autocorrelate(&windowed, max_order);

    if autocorrelated[0] == 0.0 {
        LpcAnalysis::Trivial
    } else {
        LpcAnalysis::Model(CoefficientTable::new(&autocorrelated))
    }
}

/// Autocorrelation of the windowed signal at lags `0..=max_order`
fn autocorrelate(windowed: &[f64], max_order: usize) -> Vec<f64> {
    (0..=max_order)
        .map(|lag| {
            windowed[lag..]
                .iter()
                .zip(windowed)
                .map(|(a, b)| a * b)
                .sum()
        })
        .collect()
}

/// The Levinson-Durbin recursion's full output:
/// one row of floating-point coefficients per order,
/// plus each order's residual error energy
pub(crate) struct CoefficientTable {
    rows: Vec<Vec<f64>>,
    errors: Vec<f64>,
}

impl CoefficientTable {
    fn new(autocorrelated: &[f64]) -> Self {
        let max_order = autocorrelated.len() - 1;

        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(max_order);
        let mut errors = Vec::with_capacity(max_order);

        let mut k = autocorrelated[1] / autocorrelated[0];
        rows.push(vec![k]);
        errors.push(autocorrelated[0] * (1.0 - k * k));

        for i in 1..max_order {
            let previous = &rows[i - 1];

            let q = autocorrelated[i + 1]
                - (0..i)
                    .map(|j| previous[j] * autocorrelated[i - j])
                    .sum::<f64>();
            k = q / errors[i - 1];

            let mut row = (0..i)
                .map(|j| previous[j] - k * previous[i - j - 1])
                .collect::<Vec<_>>();
            row.push(k);

            rows.push(row);
            errors.push(errors[i - 1] * (1.0 - k * k));
        }

        Self { rows, errors }
    }

    pub fn max_order(&self) -> usize {
        self.rows.len()
    }

    /// Estimates the order with the smallest encoded subframe,
    /// without performing any trial encodings
    ///
    /// Each order is charged its real per-order header cost plus
    /// an information-theoretic bits-per-residual approximation
    /// derived from its prediction error energy.
    pub fn estimate_order(&self, bits_per_sample: u32, precision: u32, sample_count: usize) -> usize {
        let error_scale = std::f64::consts::LN_2.powi(2) / (2.0 * sample_count as f64);

        let mut best_order = 0;
        let mut best_bits = f64::MAX;

        for order in 1..=self.rows.len() {
            let header_bits = order as f64 * f64::from(bits_per_sample + precision);
            let bits_per_residual = (self.errors[order - 1] * error_scale).log2() / 2.0;
            let subframe_bits = header_bits + bits_per_residual * (sample_count - order) as f64;

            if subframe_bits < best_bits {
                best_order = order;
                best_bits = subframe_bits;
            }
        }

        best_order.max(1)
    }

    /// Quantizes the given order's coefficients to fixed-point integers
    ///
    /// Each rounding's remainder is carried into the next coefficient
    /// so quantization error doesn't accumulate in one direction.
    pub fn quantize(&self, order: usize, precision: u32) -> QuantizedLpc {
        const MAX_SHIFT: i32 = (1 << 4) - 1;

        let row = &self.rows[order - 1];

        let max_coefficient = row.iter().fold(0.0f64, |max, c| c.abs().max(max));

        let shift = if max_coefficient > 0.0 {
            ((precision as i32 - 1) - (max_coefficient.log2().floor() as i32) - 1)
                .clamp(0, MAX_SHIFT)
        } else {
            0
        };

        let max_quantized = (1i64 << (precision - 1)) - 1;
        let min_quantized = -(1i64 << (precision - 1));

        let mut error = 0.0;
        let mut coefficients = ArrayVec::new();

        for coefficient in row {
            let sum = error + coefficient * (1i64 << shift) as f64;
            let quantized = (sum.round() as i64).clamp(min_quantized, max_quantized);
            coefficients.push(quantized as i32);
            error = sum - quantized as f64;
        }

        QuantizedLpc {
            precision,
            shift,
            coefficients,
        }
    }
}

/// A Tukey (tapered cosine) window of the given block size
///
/// Computed once per encode and shared by every block;
/// short final blocks window with its leading entries.
pub(crate) fn tukey_window(alpha: f64, block_size: usize) -> Box<[f64]> {
    use std::f64::consts::PI;

    let taper = ((alpha / 2.0 * block_size as f64 - 1.0) as usize).max(1);

    (0..block_size)
        .map(|i| {
            if i <= taper {
                (1.0 - (PI * i as f64 / taper as f64).cos()) / 2.0
            } else if i >= block_size - taper - 1 {
                (1.0 - (PI * (block_size - i - 1) as f64 / taper as f64).cos()) / 2.0
            } else {
                1.0
            }
        })
        .collect()
}
