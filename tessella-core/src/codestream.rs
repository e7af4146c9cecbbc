// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `codestream` module defines the trait seams between the coding/rendering core and
//! the codestream layer that supplies and consumes code-blocks, tiles, and component
//! lines. The core never depends on a concrete codestream implementation.

use std::sync::Arc;

use crate::block::CodeBlock;
use crate::errors::Result;
use crate::geometry::{Coords, Rect};
use crate::sample::SampleLine;
use crate::subband::SubbandSpec;

/// Receives notifications about the progress of code-block resource allocation.
///
/// The codestream layer resources code-block containers asynchronously. As resources
/// become available it reports progress by invoking `update_dependencies` with a positive
/// `p_delta`, encoded as whole block rows shifted by the quantum bit count plus ready
/// quanta. A call with `p_delta == 0` and `closure` set completes a deferred detachment.
pub trait BlockNotifier: Send + Sync {
    fn update_dependencies(&self, p_delta: i32, closure: bool) -> bool;
}

/// The subband face of the codestream layer, as seen by the block encoder.
pub trait BlockSink: Send + Sync {
    /// The descriptor for this subband.
    fn spec(&self) -> &SubbandSpec;

    /// Opens the code-block with absolute index `idx`. `remaining` counts the blocks the
    /// caller will still open in the current scan, and `scan_start` marks the first open
    /// of a scan; both exist so an implementation can amortize internal locking.
    fn open_block(&self, idx: Coords, remaining: usize, scan_start: bool) -> Result<CodeBlock>;

    /// Returns a fully coded block to the codestream layer.
    fn close_block(&self, block: CodeBlock) -> Result<()>;

    /// A conservative estimate of the rate-distortion slope threshold below which coding
    /// passes are unlikely to be included in the final stream.
    fn conservative_slope_threshold(&self) -> u16 {
        0
    }

    /// Installs `notifier` to receive resource-availability notifications. Returns false
    /// if the codestream layer does not perform background resourcing, in which case no
    /// notifications will ever arrive.
    fn attach_block_notifier(&self, notifier: Arc<dyn BlockNotifier>) -> bool;

    /// Detaches a previously attached notifier. Returns true if the detachment completed
    /// synchronously (or no notifier was ever attached); returns false if a final
    /// `update_dependencies` call with `closure` set will be delivered later.
    fn detach_block_notifier(&self) -> bool;

    /// Requests that resources for `rows` further whole code-block rows be prepared in
    /// the background. `quantum_bits` and `num_quantum_blocks` fix the encoding of the
    /// `p_delta` values that subsequent notifications will carry.
    fn advance_block_rows_needed(&self, rows: u32, quantum_bits: u32, num_quantum_blocks: u32);

    /// Reports that a whole row of code-blocks of the given height has been generated.
    /// Rows are always reported in subband order; `is_final` accompanies the last row.
    fn block_row_generated(&self, height: i32, is_final: bool);
}

/// Upward-facing queue notifications issued by the encoder.
pub trait DependencyMonitor: Send + Sync {
    /// `new_dependencies` reports a change in the number of currently blocking
    /// conditions; `delta_max_dependencies` reports a change in the number of conditions
    /// that could ever block in the future.
    fn propagate_dependencies(&self, new_dependencies: i32, delta_max_dependencies: i32);

    /// Invoked exactly once, after the last in-flight job has finished and no further
    /// work remains.
    fn all_done(&self);
}

/// A `DependencyMonitor` that ignores every notification.
pub struct NullMonitor;

impl DependencyMonitor for NullMonitor {
    fn propagate_dependencies(&self, _new_dependencies: i32, _delta_max_dependencies: i32) {}

    fn all_done(&self) {}
}

/// Produces reconstructed component lines for one tile. Implemented by the synthesis
/// machinery (inverse DWT plus dequantization) of the codestream layer.
pub trait SynthesisEngine {
    /// Pulls the next line of the given component, or `None` once the tile region is
    /// exhausted.
    fn get_line(&mut self, component: usize) -> Result<Option<SampleLine>>;
}

/// The tile-level face of the codestream layer, as seen by the region renderer.
pub trait TileSource {
    /// Opens the tile with the given index, yielding its synthesis engine.
    fn open_tile(&mut self, idx: Coords) -> Result<Box<dyn SynthesisEngine>>;

    /// The region of the given component covered by the tile, in the transformed
    /// geometry the renderer operates in.
    fn tile_dims(&self, idx: Coords, component: usize) -> Rect;

    /// Maps a region on the full-image canvas onto the given component's coordinates.
    fn map_region(&self, component: usize, region: Rect) -> Rect;

    /// Per-axis subsampling factors of the given component.
    fn subsampling(&self, component: usize) -> Coords;

    /// Restricts subsequent tile opens to the intersection with `region`, decoding at
    /// most `max_layers` quality layers (0 means no limit).
    fn apply_input_restrictions(&mut self, region: Rect, max_layers: usize) -> Result<()>;

    /// The range of valid tile indices after restrictions.
    fn valid_tiles(&self) -> Rect;

    /// The full region of the given component.
    fn image_dims(&self, component: usize) -> Rect;
}
