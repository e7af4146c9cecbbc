// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `block` module defines the code-block container exchanged with the codestream layer.

use crate::geometry::Coords;

/// Floor for sample buffer growth, so that repeated `open_block` calls on typical 64x64
/// blocks do not reallocate.
const MIN_BLOCK_SAMPLES: usize = 4096;

/// A rectangular collection of quantized subband samples that forms the unit of entropy
/// coding.
///
/// Code-blocks are created by the codestream layer on demand, populated by the quantizer
/// (encode path) or by the block decoder (decode path), and closed back to the codestream
/// layer afterwards. Samples are stored in 32-bit sign-magnitude form.
pub struct CodeBlock {
    /// Absolute code-block index within the subband.
    pub idx: Coords,
    /// Sample dimensions; never larger than the subband's nominal block size.
    pub size: Coords,
    /// Samples are transferred with rows and columns interchanged.
    pub transpose: bool,
    /// Samples are transferred bottom-up.
    pub vflip: bool,
    /// Samples are transferred right-to-left.
    pub hflip: bool,
    /// Sign-magnitude sample values, `size.x * size.y` of them (row-major, post-geometry).
    pub samples: Vec<i32>,
    /// Capacity of `samples` in samples.
    pub max_samples: usize,
    /// Number of high-order magnitude bit-planes known to be zero for every sample.
    pub missing_msbs: u32,
    /// Number of coding passes covering the remaining bit-planes.
    pub num_passes: u32,
    /// Latched when a reversible ROI encode could not represent every bit-plane.
    pub insufficient_precision_detected: bool,
    /// Emitted pass byte stream, produced by the block coder.
    pub byte_buffer: Vec<u8>,
    /// Cumulative pass lengths into `byte_buffer`.
    pub pass_lengths: Vec<usize>,
    /// Rate-distortion slope threshold recorded per pass.
    pub pass_slopes: Vec<u16>,
}

impl CodeBlock {
    pub fn new(idx: Coords, size: Coords) -> Self {
        CodeBlock {
            idx,
            size,
            transpose: false,
            vflip: false,
            hflip: false,
            samples: Vec::new(),
            max_samples: 0,
            missing_msbs: 0,
            num_passes: 0,
            insufficient_precision_detected: false,
            byte_buffer: Vec::new(),
            pass_lengths: Vec::new(),
            pass_slopes: Vec::new(),
        }
    }

    /// Ensures the sample buffer can hold at least `num_samples` samples, growing to no
    /// less than 4096 samples whenever growth is required.
    pub fn set_max_samples(&mut self, num_samples: usize) {
        if self.max_samples < num_samples {
            self.max_samples = num_samples.max(MIN_BLOCK_SAMPLES);
            self.samples.resize(self.max_samples, 0);
        }
        else if self.samples.len() < self.max_samples {
            self.samples.resize(self.max_samples, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_max_samples_floor() {
        let mut block = CodeBlock::new(Coords::new(0, 0), Coords::new(8, 8));
        block.set_max_samples(64);
        assert_eq!(block.max_samples, 4096);
        assert_eq!(block.samples.len(), 4096);
        block.set_max_samples(8192);
        assert_eq!(block.max_samples, 8192);
    }
}
