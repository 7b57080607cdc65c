// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Rice coding of prediction residuals
//!
//! Residuals are split into 2ᵒʳᵈᵉʳ equal partitions, each with its
//! own Rice parameter estimated from the partition's mean magnitude.
//! Partitions whose Rice form blows up are stored escaped, as plain
//! fixed-width values, without disturbing their neighbors.

use crate::encode::Parameters;
use bitstream_io::{BigEndian, BitRecorder, BitWrite};

/// A failed trial encoding
#[derive(Debug)]
pub(crate) enum TrialError {
    /// The candidate ran past its size budget
    Oversize,
    /// An error from the underlying stream
    Io(std::io::Error),
}

impl From<std::io::Error> for TrialError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

/// Checks a trial encoding against its size budget, if any
pub(crate) fn within_budget(
    recorder: &BitRecorder<u32, BigEndian>,
    budget: Option<u32>,
) -> Result<(), TrialError> {
    match budget {
        Some(bits) if recorder.written() > bits => Err(TrialError::Oversize),
        _ => Ok(()),
    }
}

/// The residual block's coding method
///
/// Rice parameters above 14 require the wider RICE2 variant,
/// whose 5-bit parameter fields reach up to 31.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum CodingMethod {
    Rice = 0,
    Rice2 = 1,
}

impl CodingMethod {
    fn parameter_width(self) -> u32 {
        match self {
            Self::Rice => 4,
            Self::Rice2 => 5,
        }
    }

    /// The parameter value marking an escaped partition
    fn escape_parameter(self) -> u32 {
        match self {
            Self::Rice => 15,
            Self::Rice2 => 31,
        }
    }
}

/// Writes a whole coded residual block
///
/// | Bits | Field |
/// |-----:|-------|
/// | 2    | coding method |
/// | 4    | partition order |
/// | | partition₀, partition₁, … |
pub(crate) fn write_residual_block(
    w: &mut BitRecorder<u32, BigEndian>,
    budget: Option<u32>,
    params: &Parameters,
    sample_count: usize,
    predictor_order: usize,
    residuals: &[i32],
) -> Result<(), TrialError> {
    let (partition_order, parameters) =
        best_rice_parameters(params, sample_count, predictor_order, residuals);

    let method = if parameters.iter().any(|p| *p > 14) {
        CodingMethod::Rice2
    } else {
        CodingMethod::Rice
    };

    w.write::<2, u8>(method as u8)?;
    w.write_var(4, partition_order)?;

    let partition_count = 1usize << partition_order;
    let mut start = 0;

    for (p, parameter) in parameters.iter().enumerate() {
        let partition_size =
            sample_count / partition_count - if p == 0 { predictor_order } else { 0 };
        let partition = &residuals[start..start + partition_size];

        if params.use_verbatim || partition_size == 0 {
            // if the residuals get too large, the subframe's own
            // budget fails the whole candidate and VERBATIM bails us out
            write_rice_partition(w, budget, method, *parameter, partition)?;
        } else {
            // with VERBATIM unavailable, an oversized partition
            // falls back to escaped fixed-width values instead
            let width = largest_residual_bits(partition);

            let mut trial = BitRecorder::new();
            match write_rice_partition(
                &mut trial,
                Some(width * partition_size as u32),
                method,
                *parameter,
                partition,
            ) {
                Ok(()) => trial.playback(w)?,
                Err(TrialError::Oversize) => {
                    write_escaped_partition(w, method, width, partition)?
                }
                Err(err) => return Err(err),
            }
        }

        start += partition_size;
        within_budget(w, budget)?;
    }

    Ok(())
}

/// Writes one Rice-coded partition, parameter field included
fn write_rice_partition(
    w: &mut BitRecorder<u32, BigEndian>,
    budget: Option<u32>,
    method: CodingMethod,
    parameter: u32,
    residuals: &[i32],
) -> Result<(), TrialError> {
    w.write_var(method.parameter_width(), parameter)?;

    for residual in residuals {
        let unsigned = zigzag(*residual);
        let quotient = unsigned >> parameter;

        // a hopeless quotient fails the budget before it's materialized
        if let Some(bits) = budget {
            if u64::from(w.written()) + u64::from(quotient) > u64::from(bits) {
                return Err(TrialError::Oversize);
            }
        }

        w.write_unary::<1>(quotient)?;
        if parameter > 0 {
            w.write_var(parameter, unsigned & ((1 << parameter) - 1))?;
        }
        within_budget(w, budget)?;
    }

    Ok(())
}

/// Writes one escaped partition of fixed-width signed residuals
fn write_escaped_partition(
    w: &mut BitRecorder<u32, BigEndian>,
    method: CodingMethod,
    width: u32,
    residuals: &[i32],
) -> Result<(), TrialError> {
    w.write_var(method.parameter_width(), method.escape_parameter())?;
    w.write_var(5, width)?;

    for residual in residuals {
        w.write_var(width, *residual)?;
    }

    Ok(())
}

/// Picks the partition order and per-partition Rice parameters
/// whose estimated total coded size is smallest
fn best_rice_parameters(
    params: &Parameters,
    sample_count: usize,
    predictor_order: usize,
    residuals: &[i32],
) -> (u32, Vec<u32>) {
    if sample_count == predictor_order {
        // no residuals beyond the warm-up samples
        return (0, vec![0]);
    }

    let max_order =
        maximum_partition_order(sample_count, predictor_order, params.max_partition_order);

    let mut best: Option<(u64, u32, Vec<u32>)> = None;

    for order in params.min_partition_order.min(max_order)..=max_order {
        let partition_count = 1usize << order;
        let mut parameters = Vec::with_capacity(partition_count);
        let mut total_size = 0;

        for p in 0..partition_count {
            let partition_samples =
                sample_count / partition_count - if p == 0 { predictor_order } else { 0 };
            let start = if p == 0 {
                0
            } else {
                p * sample_count / partition_count - predictor_order
            };

            let sum: u64 = residuals[start..start + partition_samples]
                .iter()
                .map(|r| u64::from(r.unsigned_abs()))
                .sum();

            let parameter = if sum > partition_samples as u64 {
                ((sum as f64 / partition_samples as f64).log2().ceil() as u32)
                    .min(params.max_rice_parameter)
            } else {
                0
            };

            // closed-form approximation of unary + remainder cost
            total_size += 4
                + u64::from(parameter + 1) * partition_samples as u64
                + if parameter > 0 {
                    sum >> (parameter - 1)
                } else {
                    sum << 1
                }
                - partition_samples as u64 / 2;

            parameters.push(parameter);
        }

        match &best {
            Some((size, ..)) if total_size >= *size => {}
            _ => best = Some((total_size, order, parameters)),
        }
    }

    let (_, order, parameters) = best.unwrap();
    (order, parameters)
}

/// Returns the largest valid partition order
///
/// Residuals must divide evenly into 2ᵒʳᵈᵉʳ partitions, the first
/// partition must keep at least one sample past the warm-up, and
/// the order must not exceed the configured maximum.
pub(crate) fn maximum_partition_order(
    sample_count: usize,
    predictor_order: usize,
    max_partition_order: u32,
) -> u32 {
    let mut order = 0;

    while sample_count % (1 << order) == 0
        && sample_count / (1 << order) > predictor_order
        && order <= max_partition_order
    {
        order += 1;
    }

    // one of the conditions no longer holds, so back up one
    order.saturating_sub(1)
}

/// The fixed width which holds every residual in a partition,
/// for escaped emission
fn largest_residual_bits(residuals: &[i32]) -> u32 {
    match residuals.iter().map(|r| r.unsigned_abs()).max() {
        Some(max) if max > 0 => ceil_log2(max) + 2,
        _ => 2,
    }
}

fn ceil_log2(value: u32) -> u32 {
    debug_assert!(value > 0);
    32 - (value - 1).leading_zeros()
}

/// Maps a signed residual to an unsigned value,
/// interleaving magnitudes by sign
pub(crate) fn zigzag(residual: i32) -> u32 {
    if residual >= 0 {
        (residual as u32) << 1
    } else {
        ((!residual as u32) << 1) | 1
    }
}
