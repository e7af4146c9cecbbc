// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `dequantizer` module reconstructs subband sample lines from sign-magnitude
//! code-block samples. It is the mirror of the quantizer, including the detection of
//! samples that were downshifted as ROI background.

use tessella_core::block::CodeBlock;
use tessella_core::errors::{precision_error, Result};
use tessella_core::geometry::Coords;
use tessella_core::sample::{LineType, SampleLine, FIX_POINT};
use tessella_core::util::bits::MAG_MASK;

/// Per-subband dequantization parameters.
#[derive(Copy, Clone, Debug)]
pub struct BlockDequantizer {
    pub k_max: u32,
    pub k_max_prime: u32,
    pub reversible: bool,
    /// Irreversible step size; ignored when `reversible`.
    pub delta: f32,
}

impl BlockDequantizer {
    /// Magnitudes at or above this value belong to the ROI foreground.
    fn foreground_threshold(&self) -> i32 {
        1 << (31 - self.k_max)
    }

    /// Reconstructs `xfer.y` lines of `xfer.x` samples from `block`, writing them into
    /// `lines` starting `offset` samples into each line. The output representation is
    /// taken from the lines themselves: fix16 for low-precision paths, int32 for
    /// high-precision reversible data, float32 for irreversible high-precision data.
    pub fn dequantize_block(
        &self,
        block: &CodeBlock,
        lines: &mut [SampleLine],
        offset: usize,
        xfer: Coords,
    ) -> Result<()> {
        if self.k_max > 31 && self.reversible {
            return precision_error();
        }
        let rows = xfer.y as usize;
        let cols = xfer.x as usize;
        let row_gap = block.size.x as usize;
        let roi_active = self.k_max_prime > self.k_max && self.k_max_prime <= 31;
        let fg_thresh = self.foreground_threshold();
        let fg_shift = 31 - self.k_max;
        let bg_shift = 31u32.saturating_sub(self.k_max_prime);

        for (m, line) in lines.iter_mut().enumerate().take(rows) {
            let src = &block.samples[m * row_gap..m * row_gap + cols];
            match line.line_type() {
                LineType::Fix16 { absolute: true } => {
                    let dst = line.buf16_mut().expect("short line");
                    for (n, &val) in src.iter().enumerate() {
                        dst[offset + n] = self.invert_integer(val, roi_active, fg_thresh,
                                                              fg_shift, bg_shift) as i16;
                    }
                }
                LineType::Int32 { absolute: true } => {
                    let dst = line.buf32_mut().expect("int32 line");
                    for (n, &val) in src.iter().enumerate() {
                        dst[offset + n] =
                            self.invert_integer(val, roi_active, fg_thresh, fg_shift, bg_shift);
                    }
                }
                LineType::Fix16 { absolute: false } => {
                    // Irreversible reconstruction back to the fixed point domain.
                    let fscale = self.delta * (1u32 << FIX_POINT) as f32
                        / (1u64 << (31 - self.k_max.min(31))) as f32;
                    let dst = line.buf16_mut().expect("short line");
                    for (n, &val) in src.iter().enumerate() {
                        let mag = self.roi_adjusted_mag(val, roi_active, fg_thresh) as f32;
                        let out = (mag * fscale + 0.5) as i32;
                        dst[offset + n] = if val < 0 { -out as i16 } else { out as i16 };
                    }
                }
                LineType::Float32 => {
                    let fscale =
                        self.delta / (1u64 << (31 - self.k_max.min(31))) as f32;
                    let dst = line.buf_f32_mut().expect("float line");
                    for (n, &val) in src.iter().enumerate() {
                        let mag = self.roi_adjusted_mag(val, roi_active, fg_thresh) as f32;
                        let out = mag * fscale;
                        dst[offset + n] = if val < 0 { -out } else { out };
                    }
                }
                LineType::Int32 { absolute: false } => {
                    unreachable!("fractional int32 lines are not produced by the decoder");
                }
            }
        }
        Ok(())
    }

    /// Inspects the sign bit, clears it, shifts the magnitude down (choosing the
    /// background shift when the magnitude falls below the foreground threshold), and
    /// re-applies the sign.
    #[inline]
    fn invert_integer(
        &self,
        val: i32,
        roi_active: bool,
        fg_thresh: i32,
        fg_shift: u32,
        bg_shift: u32,
    ) -> i32 {
        let mag = val & MAG_MASK;
        let out = if roi_active && mag != 0 && mag < fg_thresh {
            mag >> bg_shift
        }
        else {
            mag >> fg_shift
        };
        if val < 0 {
            -out
        }
        else {
            out
        }
    }

    /// The magnitude with any ROI background downshift undone, left in the upshifted
    /// domain used by irreversible reconstruction.
    #[inline]
    fn roi_adjusted_mag(&self, val: i32, roi_active: bool, fg_thresh: i32) -> i32 {
        let mag = val & MAG_MASK;
        if roi_active && mag != 0 && mag < fg_thresh {
            mag << (self.k_max_prime - self.k_max)
        }
        else {
            mag
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantizer::BlockQuantizer;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn quantize_lines(
        q: &BlockQuantizer,
        lines: &[SampleLine],
        size: Coords,
    ) -> (CodeBlock, i32) {
        let mut block = CodeBlock::new(Coords::new(0, 0), size);
        block.set_max_samples((size.x * size.y) as usize);
        let or_val = q.transfer_block(lines, 0, &mut block, size).unwrap();
        (block, or_val)
    }

    #[test]
    fn verify_reversible_round_trip_4x4() {
        let q = BlockQuantizer { k_max: 5, k_max_prime: 5, reversible: true, delta: 0.0 };
        let dq = BlockDequantizer { k_max: 5, k_max_prime: 5, reversible: true, delta: 0.0 };
        let values: [[i16; 4]; 4] =
            [[1, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12], [13, 14, 15, 16]];
        let lines: Vec<SampleLine> = values
            .iter()
            .map(|row| {
                let mut l = SampleLine::new(4, LineType::Fix16 { absolute: true });
                l.buf16_mut().unwrap().copy_from_slice(row);
                l
            })
            .collect();
        let (mut block, or_val) = quantize_lines(&q, &lines, Coords::new(4, 4));
        q.finish_block(&mut block, or_val, false);

        let mut out: Vec<SampleLine> = (0..4)
            .map(|_| SampleLine::new(4, LineType::Fix16 { absolute: true }))
            .collect();
        dq.dequantize_block(&block, &mut out, 0, Coords::new(4, 4)).unwrap();
        for (line, row) in out.iter().zip(values.iter()) {
            assert_eq!(line.buf16().unwrap(), row);
        }
    }

    #[test]
    fn verify_reversible_round_trip_random() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        for &k_max in &[3u32, 8, 12] {
            let q =
                BlockQuantizer { k_max, k_max_prime: k_max, reversible: true, delta: 0.0 };
            let dq =
                BlockDequantizer { k_max, k_max_prime: k_max, reversible: true, delta: 0.0 };
            let limit = (1i32 << k_max) - 1;
            let rows = 8;
            let cols = 16;
            let lines: Vec<SampleLine> = (0..rows)
                .map(|_| {
                    let mut l = SampleLine::new(cols, LineType::Fix16 { absolute: true });
                    for s in l.buf16_mut().unwrap() {
                        *s = rng.gen_range(-limit..=limit) as i16;
                    }
                    l
                })
                .collect();
            let (block, _) = quantize_lines(&q, &lines, Coords::new(cols as i32, rows as i32));
            let mut out: Vec<SampleLine> = (0..rows)
                .map(|_| SampleLine::new(cols, LineType::Fix16 { absolute: true }))
                .collect();
            dq.dequantize_block(&block, &mut out, 0, Coords::new(cols as i32, rows as i32))
                .unwrap();
            for (a, b) in out.iter().zip(lines.iter()) {
                assert_eq!(a.buf16().unwrap(), b.buf16().unwrap());
            }
        }
    }

    #[test]
    fn verify_roi_round_trip() {
        use crate::quantizer::RoiWindow;

        let q = BlockQuantizer { k_max: 4, k_max_prime: 9, reversible: true, delta: 0.0 };
        let dq = BlockDequantizer { k_max: 4, k_max_prime: 9, reversible: true, delta: 0.0 };
        let values: [[i16; 2]; 2] = [[9, -6], [3, 15]];
        let lines: Vec<SampleLine> = values
            .iter()
            .map(|row| {
                let mut l = SampleLine::new(2, LineType::Fix16 { absolute: true });
                l.buf16_mut().unwrap().copy_from_slice(row);
                l
            })
            .collect();
        let (mut block, or_val) = quantize_lines(&q, &lines, Coords::new(2, 2));
        q.apply_roi_shift_mask(&mut block).unwrap();
        let mask = [1u8, 0, 0, 1];
        let roi = RoiWindow { mask: &mask, row_gap: 2, base_col: 0 };
        let (or_val, bg, _) =
            q.apply_roi_background(&roi, 0, &mut block, Coords::new(2, 2), or_val);
        assert!(bg);
        q.finish_block(&mut block, or_val, true);

        let mut out: Vec<SampleLine> =
            (0..2).map(|_| SampleLine::new(2, LineType::Fix16 { absolute: true })).collect();
        dq.dequantize_block(&block, &mut out, 0, Coords::new(2, 2)).unwrap();
        for (line, row) in out.iter().zip(values.iter()) {
            assert_eq!(line.buf16().unwrap(), row);
        }
    }

    #[test]
    fn verify_irreversible_float_reconstruction() {
        let delta = 1.0 / 1024.0;
        let q = BlockQuantizer { k_max: 10, k_max_prime: 10, reversible: false, delta };
        let dq = BlockDequantizer { k_max: 10, k_max_prime: 10, reversible: false, delta };
        let mut line = SampleLine::new(4, LineType::Float32);
        line.buf_f32_mut().unwrap().copy_from_slice(&[0.25, -0.125, 0.0, 0.4999]);
        let (block, _) = quantize_lines(&q, &[line], Coords::new(4, 1));

        let mut out = vec![SampleLine::new(4, LineType::Float32)];
        dq.dequantize_block(&block, &mut out, 0, Coords::new(4, 1)).unwrap();
        let got = out[0].buf_f32().unwrap();
        for (g, want) in got.iter().zip([0.25f32, -0.125, 0.0, 0.4999].iter()) {
            assert!((g - want).abs() <= delta, "{} vs {}", g, want);
        }
    }
}
