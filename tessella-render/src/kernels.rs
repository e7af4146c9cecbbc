// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `kernels` module builds the interpolation kernel banks used by the channel
//! resamplers.
//!
//! A bank holds 33 kernels indexed by sub-sample phase sigma * 32. The 6-tap kernels
//! are windowed sincs with an overshoot-limiting blend toward the 2-tap linear kernel;
//! the 2-tap kernels additionally come in a packed form of four progressive lengths
//! (2, 3, 4, 5) so four consecutive output phases of a uniform expansion can be served
//! from a single source window.

use tessella_core::errors::{expansion_error, Result, TessellaError};

/// Number of phase-indexed kernels in a bank.
pub const KERNEL_PHASES: usize = 33;

/// Taps of the long (windowed sinc) kernels.
pub const SINC_TAPS: usize = 6;

/// Boxcar cell areas must stay below this product.
pub const MAX_BOXCAR_AREA: i64 = 1 << 23;

/// Reduces an expansion ratio to lowest terms, validating it.
pub fn reduce_ratio(num: i64, den: i64) -> Result<(i32, i32)> {
    if num <= 0 || den <= 0 {
        return expansion_error("expansion terms must be positive");
    }
    let g = gcd(num, den);
    let (num, den) = (num / g, den / g);
    if num > i64::from(i32::MAX) || den > i64::from(i32::MAX) {
        return Err(TessellaError::RatioNotRepresentable);
    }
    Ok((num as i32, den as i32))
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Validates a boxcar cell size: both axes powers of two with a bounded product.
pub fn validate_boxcar(size_x: i32, size_y: i32) -> Result<()> {
    if size_x <= 0 || size_y <= 0 {
        return expansion_error("boxcar size must be positive");
    }
    if !(size_x as u32).is_power_of_two() || !(size_y as u32).is_power_of_two() {
        return expansion_error("boxcar size must be a power of two");
    }
    if i64::from(size_x) * i64::from(size_y) >= MAX_BOXCAR_AREA {
        return expansion_error("boxcar cell area too large");
    }
    Ok(())
}

/// A bank of phase-indexed interpolation kernels for one expansion factor.
#[derive(Debug)]
pub struct KernelBank {
    /// 6 for windowed-sinc interpolation, 2 for linear.
    pub kernel_length: usize,
    pub expansion: f32,
    pub max_overshoot: f32,
    /// `KERNEL_PHASES` kernels of `kernel_length` taps each, flattened.
    pub taps: Vec<f32>,
    /// The parallel 15-bit fixed point bank, negated so reconstruction can use
    /// `(2^14 - sum(k16 * s)) >> 15`.
    pub taps_fix: Vec<i16>,
    /// For 2-tap banks: packed groups of four progressive kernels of lengths 2, 3, 4
    /// and 5, serving four consecutive output phases from one source window.
    pub packed_linear: Vec<f32>,
}

impl KernelBank {
    /// Builds the kernel bank for the given expansion factor (output/input ratio).
    ///
    /// `max_overshoot` bounds the step response overshoot of the 6-tap kernels; for
    /// expansions above 1 it is scaled down linearly, reaching zero at
    /// `zero_overshoot_threshold`, beyond which the bank degenerates to the 2-tap
    /// linear kernel.
    pub fn new(expansion: f32, max_overshoot: f32, zero_overshoot_threshold: f32) -> Result<Self> {
        if expansion <= 0.0 {
            return expansion_error("expansion factor must be positive");
        }
        let overshoot = effective_overshoot(expansion, max_overshoot, zero_overshoot_threshold);
        if expansion > 1.0 && (expansion >= zero_overshoot_threshold || overshoot <= 0.0) {
            return Ok(Self::linear(expansion));
        }
        Ok(Self::windowed_sinc(expansion, overshoot))
    }

    fn linear(expansion: f32) -> Self {
        let mut taps = vec![0f32; KERNEL_PHASES * 2];
        for p in 0..KERNEL_PHASES {
            let sigma = p as f32 / 32.0;
            taps[2 * p] = 1.0 - sigma;
            taps[2 * p + 1] = sigma;
        }
        let taps_fix = fix_bank(&taps, 2);

        // Packed progressive kernels: lengths 2, 3, 4 and 5 that evaluate phases
        // sigma, sigma + 1/4, sigma + 2/4 and sigma + 3/4 against one window of five
        // source samples.
        let mut packed_linear = Vec::with_capacity(KERNEL_PHASES * (2 + 3 + 4 + 5));
        for p in 0..KERNEL_PHASES {
            let sigma = p as f32 / 32.0;
            for (k, len) in (2usize..=5).enumerate() {
                let pos = sigma + k as f32 * 0.25;
                let left = pos.floor() as usize;
                let frac = pos - pos.floor();
                for t in 0..len {
                    let v = if t == left {
                        1.0 - frac
                    }
                    else if t == left + 1 {
                        frac
                    }
                    else {
                        0.0
                    };
                    packed_linear.push(v);
                }
            }
        }
        KernelBank {
            kernel_length: 2,
            expansion,
            max_overshoot: 0.0,
            taps,
            taps_fix,
            packed_linear,
        }
    }

    fn windowed_sinc(expansion: f32, max_overshoot: f32) -> Self {
        let bw = f64::from(expansion.min(1.0));
        let mut taps = vec![0f32; KERNEL_PHASES * SINC_TAPS];
        // Build phases 0..=16 and mirror the rest.
        for p in 0..=(KERNEL_PHASES / 2) {
            let sigma = p as f64 / 32.0;
            let mut kernel = [0f64; SINC_TAPS];
            let mut sum = 0.0;
            for (n, k) in kernel.iter_mut().enumerate() {
                let x = std::f64::consts::PI * (n as f64 - 2.0 - sigma);
                let sinc = if x.abs() < 1e-9 { bw } else { (bw * x).sin() / x };
                *k = sinc * (1.0 + (x / 3.0).cos());
                sum += *k;
            }
            for k in kernel.iter_mut() {
                *k /= sum;
            }

            // Bound the step response: blend toward the linear kernel by exactly the
            // fraction that brings the overshoot down to the allowed limit.
            let overshoot = step_overshoot(&kernel);
            if overshoot > f64::from(max_overshoot) {
                let linear = linear_as_sinc(sigma);
                let blend = (overshoot - f64::from(max_overshoot)) / overshoot;
                for (k, l) in kernel.iter_mut().zip(linear.iter()) {
                    *k = *k * (1.0 - blend) + *l * blend;
                }
            }

            for (n, &k) in kernel.iter().enumerate() {
                taps[p * SINC_TAPS + n] = k as f32;
            }
        }
        for p in (KERNEL_PHASES / 2 + 1)..KERNEL_PHASES {
            for n in 0..SINC_TAPS {
                taps[p * SINC_TAPS + n] = taps[(32 - p) * SINC_TAPS + (SINC_TAPS - 1 - n)];
            }
        }
        let taps_fix = fix_bank(&taps, SINC_TAPS);
        KernelBank {
            kernel_length: SINC_TAPS,
            expansion,
            max_overshoot,
            taps,
            taps_fix,
            packed_linear: Vec::new(),
        }
    }

    /// The floating point kernel for the given phase index (0..=32).
    pub fn kernel(&self, phase: usize) -> &[f32] {
        let len = self.kernel_length;
        &self.taps[phase * len..(phase + 1) * len]
    }

    /// The fixed point kernel for the given phase index.
    pub fn kernel_fix(&self, phase: usize) -> &[i16] {
        let len = self.kernel_length;
        &self.taps_fix[phase * len..(phase + 1) * len]
    }

    /// Reuses `other` when it was built for close enough parameters: the expansion and
    /// overshoot agree within 5% and the kernel length matches.
    pub fn copy(other: &KernelBank, expansion: f32, max_overshoot: f32) -> Option<KernelBank> {
        let rel = |a: f32, b: f32| {
            if a == b {
                0.0
            }
            else {
                (a - b).abs() / a.abs().max(b.abs())
            }
        };
        if rel(other.expansion, expansion) <= 0.05 && rel(other.max_overshoot, max_overshoot) <= 0.05
        {
            Some(KernelBank {
                kernel_length: other.kernel_length,
                expansion: other.expansion,
                max_overshoot: other.max_overshoot,
                taps: other.taps.clone(),
                taps_fix: other.taps_fix.clone(),
                packed_linear: other.packed_linear.clone(),
            })
        }
        else {
            None
        }
    }
}

/// The overshoot allowance after the linear roll-off applied to expansions above 1:
/// the target shrinks to zero as the expansion approaches `zero_overshoot_threshold`.
pub fn effective_overshoot(expansion: f32, max_overshoot: f32, zero_overshoot_threshold: f32) -> f32 {
    let mut overshoot = max_overshoot;
    if expansion > 1.0 && zero_overshoot_threshold > 1.0 {
        let fraction = (zero_overshoot_threshold - expansion) / (zero_overshoot_threshold - 1.0);
        overshoot *= fraction.clamp(0.0, 1.0);
    }
    overshoot
}

/// Maximum amount by which a running (step response) sum of the kernel exceeds 1.
fn step_overshoot(kernel: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut peak = 0.0f64;
    for &k in kernel {
        sum += k;
        peak = peak.max(sum);
    }
    (peak - 1.0).max(0.0)
}

/// The 2-tap linear kernel at phase `sigma`, placed on the 6-tap grid.
fn linear_as_sinc(sigma: f64) -> [f64; SINC_TAPS] {
    let mut out = [0f64; SINC_TAPS];
    out[2] = 1.0 - sigma;
    out[3] = sigma;
    out
}

/// Produces the negated 15-bit fixed point bank, forcing each kernel's sum to exactly
/// -2^15 by folding the rounding residue into the largest tap.
fn fix_bank(taps: &[f32], len: usize) -> Vec<i16> {
    let mut out = vec![0i16; taps.len()];
    for p in 0..(taps.len() / len) {
        let kernel = &taps[p * len..(p + 1) * len];
        let fixed = &mut out[p * len..(p + 1) * len];
        let mut sum = 0i32;
        let mut largest = 0usize;
        for (n, &k) in kernel.iter().enumerate() {
            let v = -((k * 32768.0).round() as i32);
            fixed[n] = v as i16;
            sum += v;
            if kernel[n] > kernel[largest] {
                largest = n;
            }
        }
        let residue = -32768 - sum;
        fixed[largest] = (i32::from(fixed[largest]) + residue) as i16;
    }
    out
}
