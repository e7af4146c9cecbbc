// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `subband` module defines the read-only subband descriptor consumed by the coding
//! pipeline.

use crate::geometry::{Coords, Rect};

/// Visual masking parameters attached to a subband. Only a masking exponent of 0.5 is
/// supported; the cell generator accumulates square roots of sample magnitudes.
#[derive(Copy, Clone, Debug)]
pub struct MaskingParams {
    /// Visibility floor; must be positive for masking to be active.
    pub visibility_floor: f32,
    /// Always 0.5 in this implementation.
    pub masking_exponent: f32,
    /// Scale applied to squared cell activity before reciprocation.
    pub visual_scale: f32,
}

impl MaskingParams {
    pub fn is_valid(&self) -> bool {
        self.visibility_floor > 0.0
            && self.visual_scale > 0.0
            && self.masking_exponent > 0.49
            && self.masking_exponent < 0.51
    }
}

/// Describes a subband to the encoder and decoder. All fields are fixed before any
/// sample processing begins.
#[derive(Clone, Debug)]
pub struct SubbandSpec {
    /// Magnitude bit-planes required by the subband's samples, excluding any ROI upshift.
    pub k_max: u32,
    /// Magnitude bit-planes including the ROI upshift; equals `k_max` when no ROI shift
    /// is in force.
    pub k_max_prime: u32,
    /// True for reversible (integer) coding.
    pub reversible: bool,
    /// Irreversible quantization step size; ignored when `reversible`.
    pub delta: f32,
    /// Weighted MSE contribution of the most significant magnitude bit-plane.
    pub msb_wmse: f32,
    /// Multiplies `msb_wmse` for blocks intersecting the ROI foreground.
    pub roi_weight: Option<f32>,
    /// Subband sample region on the canvas.
    pub dims: Rect,
    /// Nominal code-block size.
    pub nominal_block_size: Coords,
    /// Size of the first (upper-left) code-block, which may be smaller than nominal.
    pub first_block_size: Coords,
    /// Range of valid code-block indices.
    pub valid_blocks: Rect,
    /// Index of the band within its resolution level; 0 identifies the LL band.
    pub band_idx: u32,
    /// True for bands belonging to the highest resolution level.
    pub top_level: bool,
    /// Visual masking parameters, when the subband requests masking-weighted encoding.
    pub masking: Option<MaskingParams>,
}

impl SubbandSpec {
    /// The height of the code-block row containing subband row index `stripe`, counting
    /// block rows from the top of the subband.
    pub fn block_row_height(&self, block_row: i32) -> i32 {
        let rows = self.dims.size.y;
        if block_row == 0 {
            self.first_block_size.y.min(rows)
        }
        else {
            let consumed = self.first_block_size.y + (block_row - 1) * self.nominal_block_size.y;
            (rows - consumed).min(self.nominal_block_size.y).max(0)
        }
    }

    /// Total number of code-block rows in the subband.
    pub fn block_rows(&self) -> i32 {
        self.valid_blocks.size.y
    }

    pub fn has_masking(&self) -> bool {
        self.masking.map(|m| m.is_valid()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rows: i32, first: i32, nominal: i32) -> SubbandSpec {
        let blocks_high = if rows <= first {
            1
        }
        else {
            1 + (rows - first + nominal - 1) / nominal
        };
        SubbandSpec {
            k_max: 5,
            k_max_prime: 5,
            reversible: true,
            delta: 0.0,
            msb_wmse: 1.0,
            roi_weight: None,
            dims: Rect::new(Coords::new(0, 0), Coords::new(64, rows)),
            nominal_block_size: Coords::new(64, nominal),
            first_block_size: Coords::new(64, first),
            valid_blocks: Rect::new(Coords::new(0, 0), Coords::new(1, blocks_high)),
            band_idx: 1,
            top_level: true,
            masking: None,
        }
    }

    #[test]
    fn verify_block_row_heights() {
        let s = spec(100, 24, 32);
        assert_eq!(s.block_row_height(0), 24);
        assert_eq!(s.block_row_height(1), 32);
        assert_eq!(s.block_row_height(2), 32);
        assert_eq!(s.block_row_height(3), 12);
        assert_eq!(s.block_rows(), 4);
    }
}
