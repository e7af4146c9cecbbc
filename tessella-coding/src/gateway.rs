// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `gateway` module defines the contract between the encoding pipeline and an
//! external block entropy codec.

use tessella_core::block::CodeBlock;
use tessella_core::errors::Result;

/// A block entropy codec.
///
/// On entry to either function, `block.samples` holds sign-magnitude values and
/// `block.missing_msbs` and `block.num_passes` have been set by the quantizer. On
/// return, the block carries its emitted pass data and rate-distortion slope
/// thresholds; final truncation is the codestream layer's responsibility.
///
/// Implementations must be callable concurrently from multiple worker threads without
/// observable state changes.
pub trait BlockCoder: Send + Sync {
    /// Encodes one code-block.
    fn encode(
        &self,
        block: &mut CodeBlock,
        reversible: bool,
        msb_wmse: f64,
        slope_threshold: u16,
    ) -> Result<()>;

    /// Encodes one code-block, scaling distortion by per-cell visual weights.
    ///
    /// `cell_weights` holds one weight per 4x4 cell of the block, in raster order after
    /// any geometric transformation. `first_cell_cols` and `first_cell_rows` give the
    /// width and height of the first column and row of cells, which may be partial when
    /// the block straddles the subband's cell grid.
    #[allow(clippy::too_many_arguments)]
    fn cellular_encode(
        &self,
        block: &mut CodeBlock,
        reversible: bool,
        msb_wmse: f64,
        cell_weights: &[f32],
        first_cell_cols: i32,
        first_cell_rows: i32,
        slope_threshold: u16,
    ) -> Result<()>;
}
