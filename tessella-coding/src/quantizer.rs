// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `quantizer` module maps subband sample lines into sign-magnitude code-block
//! samples.

use log::warn;

use tessella_core::block::CodeBlock;
use tessella_core::errors::{precision_error, Result, TessellaError};
use tessella_core::geometry::Coords;
use tessella_core::sample::{SampleLine, FIX_POINT};
use tessella_core::util::bits::{missing_msbs, to_sign_magnitude, MAG_MASK, SIGN_BIT};

/// A window into the per-stripe ROI mask buffer covering one encoding job. A zero mask
/// byte marks a background sample.
pub struct RoiWindow<'a> {
    pub mask: &'a [u8],
    pub row_gap: usize,
    /// Line column corresponding to mask column 0.
    pub base_col: usize,
}

/// Per-subband quantization parameters, fixed before any block is processed.
#[derive(Copy, Clone, Debug)]
pub struct BlockQuantizer {
    pub k_max: u32,
    pub k_max_prime: u32,
    pub reversible: bool,
    /// Irreversible step size; ignored when `reversible`.
    pub delta: f32,
}

impl BlockQuantizer {
    /// The scale factor for irreversible quantization of a fractional source with
    /// `frac_bits` bits below the binary point.
    fn irreversible_scale(&self, frac_bits: u32) -> f32 {
        let mut scale = 1.0 / (self.delta * (1u32 << frac_bits) as f32);
        if self.k_max <= 31 {
            scale *= (1u64 << (31 - self.k_max)) as f32;
        }
        else {
            // Cannot encode all planes; drop the excess.
            scale /= (1u64 << (self.k_max - 31)) as f32;
        }
        scale
    }

    /// Transfers and quantizes one block's samples from `lines`, honouring the block's
    /// transpose/vflip/hflip geometry. `offset` locates the block's first sample within
    /// each line and `xfer` gives the transfer dimensions in source orientation.
    /// Returns the bitwise OR of every sample written, sign bits included.
    pub fn transfer_block(
        &self,
        lines: &[SampleLine],
        offset: usize,
        block: &mut CodeBlock,
        xfer: Coords,
    ) -> Result<i32> {
        let rows = xfer.y as usize;
        let cols = xfer.x as usize;
        let row_gap = block.size.x as usize;
        let mut or_val = 0i32;

        // Destination index for source sample (m, n) under the block geometry.
        let dst_index = |m: usize, n: usize| -> usize {
            if block.transpose {
                n * row_gap + m
            }
            else {
                m * row_gap + n
            }
        };
        let vflip = block.vflip;
        let hflip = block.hflip;
        let src_row = |m: usize| if vflip { rows - 1 - m } else { m };
        let src_col = |n: usize| offset + if hflip { cols - 1 - n } else { n };

        let short = lines[0].line_type().is_short();
        if short {
            if self.reversible {
                // Source data is 16-bit absolute integers.
                debug_assert!(self.k_max <= 31);
                let upshift = 31 - self.k_max;
                for m in 0..rows {
                    let sp = lines[src_row(m)].buf16().expect("short line");
                    for n in 0..cols {
                        let val = to_sign_magnitude(i32::from(sp[src_col(n)]), upshift);
                        block.samples[dst_index(m, n)] = val;
                        or_val |= val;
                    }
                }
            }
            else {
                // Source data is 16-bit fixed point integers.
                let fscale = self.irreversible_scale(FIX_POINT);
                let scale = (fscale + 0.5) as i64;
                for m in 0..rows {
                    let sp = lines[src_row(m)].buf16().expect("short line");
                    for n in 0..cols {
                        let prod = i64::from(sp[src_col(n)]) * scale;
                        let val = quantize_product(prod);
                        block.samples[dst_index(m, n)] = val;
                        or_val |= val;
                    }
                }
            }
        }
        else if self.reversible {
            // Source data is 32-bit absolute integers.
            if self.k_max > 31 {
                return precision_error();
            }
            let upshift = 31 - self.k_max;
            for m in 0..rows {
                let sp = lines[src_row(m)].buf32().expect("int32 line");
                for n in 0..cols {
                    let val = to_sign_magnitude(sp[src_col(n)], upshift);
                    block.samples[dst_index(m, n)] = val;
                    or_val |= val;
                }
            }
        }
        else {
            // Source data is true floating point values.
            let scale = self.irreversible_scale(0);
            for m in 0..rows {
                let sp = lines[src_row(m)].buf_f32().expect("float line");
                for n in 0..cols {
                    let val = scale * sp[src_col(n)];
                    let val = if val < 0.0 {
                        ((-val) as i32) | SIGN_BIT
                    }
                    else {
                        val as i32
                    };
                    block.samples[dst_index(m, n)] = val;
                    or_val |= val;
                }
            }
        }
        Ok(or_val)
    }

    /// Zeroes out low-order magnitude bits when an ROI up-shift is in force, so the
    /// foreground and background magnitude ranges cannot alias.
    pub fn apply_roi_shift_mask(&self, block: &mut CodeBlock) -> Result<()> {
        if self.k_max_prime <= self.k_max {
            return Ok(());
        }
        if (self.k_max_prime - self.k_max) < self.k_max {
            warn!(
                "roi up-shift {} is smaller than the magnitude bit-plane count {}",
                self.k_max_prime - self.k_max,
                self.k_max
            );
            return Err(TessellaError::RoiShiftTooSmall);
        }
        let mask = (-1i32) << (31 - self.k_max);
        let area = (block.size.x * block.size.y) as usize;
        for dp in &mut block.samples[..area] {
            *dp &= mask;
        }
        Ok(())
    }

    /// Shifts background samples down according to the ROI mask. The mask is traversed
    /// with the same geometry as `transfer_block`. Returns the adjusted OR aggregate
    /// together with flags recording whether any background or foreground was seen.
    pub fn apply_roi_background(
        &self,
        roi: &RoiWindow<'_>,
        offset: usize,
        block: &mut CodeBlock,
        xfer: Coords,
        or_val: i32,
    ) -> (i32, bool, bool) {
        debug_assert!(self.k_max_prime > self.k_max);
        let rows = xfer.y as usize;
        let cols = xfer.x as usize;
        let row_gap = block.size.x as usize;
        let downshift = self.k_max_prime - self.k_max;
        let mut have_background = false;
        let mut have_foreground = false;

        let transpose = block.transpose;
        let vflip = block.vflip;
        let hflip = block.hflip;
        for m in 0..rows {
            let sm = if vflip { rows - 1 - m } else { m };
            let mask_row = &roi.mask[sm * roi.row_gap..];
            for n in 0..cols {
                let sn = offset + if hflip { cols - 1 - n } else { n };
                let dst = if transpose { n * row_gap + m } else { m * row_gap + n };
                if mask_row[sn - roi.base_col] == 0 {
                    have_background = true;
                    let val = block.samples[dst];
                    block.samples[dst] = (val & SIGN_BIT) | ((val & MAG_MASK) >> downshift);
                }
                else {
                    have_foreground = true;
                }
            }
        }
        let or_val = if have_foreground {
            or_val
        }
        else {
            (or_val & MAG_MASK) >> downshift
        };
        (or_val, have_background, have_foreground)
    }

    /// Derives `missing_msbs` and `num_passes` from the OR aggregate and latches the
    /// insufficient-precision condition for reversible ROI encodes that exceed 30
    /// effective bit-planes.
    pub fn finish_block(&self, block: &mut CodeBlock, or_val: i32, have_background: bool) {
        let mut k = if have_background { self.k_max_prime } else { self.k_max };
        if k > 30
            && self.reversible
            && self.k_max_prime > self.k_max
            && !block.insufficient_precision_detected
        {
            block.insufficient_precision_detected = true;
            warn!(
                "roi up-shift too large for truly lossless recovery of both the \
                 foreground and background regions"
            );
        }
        k = k.min(31);
        let missing = missing_msbs(or_val);
        if missing >= k {
            block.missing_msbs = k;
            block.num_passes = 0;
        }
        else {
            block.missing_msbs = missing;
            block.num_passes = 3 * (k - missing) - 2;
        }
    }
}

/// Converts a scaled product to a sign-magnitude word, truncating toward zero and
/// saturating the magnitude field.
#[inline]
fn quantize_product(prod: i64) -> i32 {
    if prod < 0 {
        ((-prod).min(MAG_MASK as i64) as i32) | SIGN_BIT
    }
    else {
        prod.min(MAG_MASK as i64) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessella_core::sample::LineType;

    fn fix16_lines(values: &[&[i16]]) -> Vec<SampleLine> {
        values
            .iter()
            .map(|row| {
                let mut line = SampleLine::new(row.len(), LineType::Fix16 { absolute: true });
                line.buf16_mut().unwrap().copy_from_slice(row);
                line
            })
            .collect()
    }

    fn quantizer(k_max: u32) -> BlockQuantizer {
        BlockQuantizer { k_max, k_max_prime: k_max, reversible: true, delta: 0.0 }
    }

    #[test]
    fn verify_reversible_4x4() {
        // A 4x4 absolute subband holding 1..=16 with K_max = 5.
        let lines = fix16_lines(&[
            &[1, 2, 3, 4],
            &[5, 6, 7, 8],
            &[9, 10, 11, 12],
            &[13, 14, 15, 16],
        ]);
        let q = quantizer(5);
        let mut block = CodeBlock::new(Coords::new(0, 0), Coords::new(4, 4));
        block.set_max_samples(16);
        let or_val = q.transfer_block(&lines, 0, &mut block, Coords::new(4, 4)).unwrap();

        // All five magnitude planes are exercised: the OR spans bits 26..=30.
        assert_eq!(or_val, 0x1f << 26);
        q.finish_block(&mut block, or_val, false);
        assert_eq!(block.missing_msbs, 0);
        assert_eq!(block.num_passes, 3 * 5 - 2);
        assert_eq!(block.samples[0], 1 << 26);
        assert_eq!(block.samples[15], 16 << 26);
    }

    #[test]
    fn verify_single_column_block() {
        let lines = fix16_lines(&[&[7], &[-7], &[0]]);
        let q = quantizer(3);
        let mut block = CodeBlock::new(Coords::new(0, 0), Coords::new(1, 3));
        block.set_max_samples(3);
        let or_val = q.transfer_block(&lines, 0, &mut block, Coords::new(1, 3)).unwrap();
        assert_eq!(block.samples[0], 7 << 28);
        assert_eq!(block.samples[1], (7 << 28) | SIGN_BIT);
        assert_eq!(block.samples[2], 0);
        q.finish_block(&mut block, or_val, false);
        assert_eq!(block.missing_msbs, 0);
    }

    #[test]
    fn verify_empty_aggregate() {
        let lines = fix16_lines(&[&[0, 0], &[0, 0]]);
        let q = quantizer(5);
        let mut block = CodeBlock::new(Coords::new(0, 0), Coords::new(2, 2));
        block.set_max_samples(4);
        let or_val = q.transfer_block(&lines, 0, &mut block, Coords::new(2, 2)).unwrap();
        q.finish_block(&mut block, or_val, false);
        assert_eq!(block.missing_msbs, 5);
        assert_eq!(block.num_passes, 0);
    }

    #[test]
    fn verify_geometry_flips() {
        let lines = fix16_lines(&[&[1, 2], &[3, 4]]);
        let q = quantizer(3);

        let mut block = CodeBlock::new(Coords::new(0, 0), Coords::new(2, 2));
        block.set_max_samples(4);
        block.vflip = true;
        q.transfer_block(&lines, 0, &mut block, Coords::new(2, 2)).unwrap();
        assert_eq!(block.samples[0], 3 << 28);
        assert_eq!(block.samples[1], 4 << 28);

        let mut block = CodeBlock::new(Coords::new(0, 0), Coords::new(2, 2));
        block.set_max_samples(4);
        block.transpose = true;
        q.transfer_block(&lines, 0, &mut block, Coords::new(2, 2)).unwrap();
        // Rows and columns interchange: source (0,1) = 2 lands at (1,0).
        assert_eq!(block.samples[2], 2 << 28);
        assert_eq!(block.samples[1], 3 << 28);
    }

    #[test]
    fn verify_roi_shift_too_small() {
        let q = BlockQuantizer { k_max: 5, k_max_prime: 8, reversible: true, delta: 0.0 };
        let mut block = CodeBlock::new(Coords::new(0, 0), Coords::new(2, 2));
        block.set_max_samples(4);
        assert!(matches!(
            q.apply_roi_shift_mask(&mut block),
            Err(TessellaError::RoiShiftTooSmall)
        ));
    }

    #[test]
    fn verify_roi_background_downshift() {
        let lines = fix16_lines(&[&[4, 4], &[4, 4]]);
        let q = BlockQuantizer { k_max: 3, k_max_prime: 6, reversible: true, delta: 0.0 };
        let mut block = CodeBlock::new(Coords::new(0, 0), Coords::new(2, 2));
        block.set_max_samples(4);
        let or_val = q.transfer_block(&lines, 0, &mut block, Coords::new(2, 2)).unwrap();
        q.apply_roi_shift_mask(&mut block).unwrap();

        // Left column foreground, right column background.
        let mask = [1u8, 0, 1, 0];
        let roi = RoiWindow { mask: &mask, row_gap: 2, base_col: 0 };
        let (or_val, bg, fg) =
            q.apply_roi_background(&roi, 0, &mut block, Coords::new(2, 2), or_val);
        assert!(bg && fg);
        assert_eq!(block.samples[0], 4 << 28);
        assert_eq!(block.samples[1], (4 << 28) >> 3);
        q.finish_block(&mut block, or_val, true);
        // Effective plane count is K_max_prime once background is present.
        assert_eq!(block.num_passes, 3 * 6 - 2);
    }
}
