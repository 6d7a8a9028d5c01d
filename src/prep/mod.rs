//! Preprocessing primitives shared by the stage runners.

pub mod linguistic;
pub mod phoneme;
pub mod speaker;

use crate::{Error, Result};

/// Training step count of the diffusion models. Both the speedup
/// quantisation and the shallow-diffusion depth discretisation are expressed
/// against this base.
pub const DIFFUSION_TOTAL_STEPS: i64 = 1000;

/// Resample a dense curve from `source_interval` onto a grid of
/// `target_length` frames spaced `target_interval` apart.
///
/// Target frame `i` reads the source at position `i · Δtgt/Δsrc` with linear
/// interpolation. Past the final source sample the last value holds when
/// `align_last_value` is set, otherwise the output is zero-padded. An empty
/// input yields an empty output, which callers treat as "use the default".
pub fn resample(
    values: &[f64],
    source_interval: f64,
    target_interval: f64,
    target_length: usize,
    align_last_value: bool,
) -> Vec<f64> {
    if values.is_empty() || source_interval <= 0.0 || target_interval <= 0.0 {
        return Vec::new();
    }
    let ratio = target_interval / source_interval;
    let last = values.len() - 1;
    let mut out = Vec::with_capacity(target_length);
    for i in 0..target_length {
        let pos = i as f64 * ratio;
        let sample = if pos >= last as f64 {
            if align_last_value || pos == last as f64 {
                values[last]
            } else {
                0.0
            }
        } else {
            let i0 = pos.floor() as usize;
            let frac = pos - i0 as f64;
            values[i0] + (values[i0 + 1] - values[i0]) * frac
        };
        out.push(sample);
    }
    out
}

/// Replace every rest entry with the nearest non-rest value, ties resolving
/// to the left. Already-filled frames count as neighbours, so the interior of
/// a rest run propagates from its left edge. Fails only when every entry is
/// a rest.
pub fn fill_rest_with_nearest<T: Copy>(values: &mut [T], rest: &[bool]) -> Result<()> {
    debug_assert_eq!(values.len(), rest.len());
    if values.is_empty() {
        return Ok(());
    }
    if rest.iter().all(|&r| r) {
        return Err(Error::Session("failed to fill rest notes".to_string()));
    }
    let mut last_filled: Option<usize> = None;
    for i in 0..values.len() {
        if !rest[i] {
            last_filled = Some(i);
            continue;
        }
        let next = rest[i + 1..]
            .iter()
            .position(|&r| !r)
            .map(|off| i + 1 + off);
        values[i] = match (last_filled, next) {
            (None, None) => unreachable!("all-rest sequences are rejected above"),
            (Some(l), None) => values[l],
            (None, Some(r)) => values[r],
            (Some(l), Some(r)) => {
                if i - l <= r - i {
                    values[l]
                } else {
                    values[r]
                }
            }
        };
        last_filled = Some(i);
    }
    Ok(())
}

/// Quantise a requested step count to a speedup scalar: the largest integer
/// divisor of `total_steps` that does not exceed `steps`. Requests below one
/// step clamp to a speedup of 1.
pub fn speedup_from_steps(steps: i64, total_steps: i64) -> i64 {
    let cap = steps.min(total_steps);
    if cap <= 1 {
        return 1;
    }
    for d in (1..=cap).rev() {
        if total_steps % d == 0 {
            return d;
        }
    }
    1
}
