// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `tiles` module manages the horizontal run of codestream tiles opened for one
//! pass of the region renderer.

use log::debug;

use tessella_core::codestream::{SynthesisEngine, TileSource};
use tessella_core::errors::Result;
use tessella_core::geometry::{Coords, Rect};
use tessella_core::sample::SampleLine;

/// One open tile and its synthesis engine.
pub struct OpenTile {
    pub idx: Coords,
    pub engine: Box<dyn SynthesisEngine>,
    /// Region of each component covered by this tile.
    pub comp_regions: Vec<Rect>,
}

/// A horizontal run of open tiles, pulled from left to right to assemble full-width
/// component lines.
pub struct TileBank {
    pub tile_row: i32,
    pub tiles: Vec<OpenTile>,
    /// Per-component union of the tiles' regions.
    pub comp_regions: Vec<Rect>,
    /// Lines already pulled from each component.
    lines_pulled: Vec<i32>,
}

impl TileBank {
    /// Opens every tile of row `tile_row` that contributes samples, or returns `None`
    /// when no tile in the row survives the current input restrictions. The caller
    /// then simply advances its row cursor.
    pub fn open(
        source: &mut dyn TileSource,
        tile_row: i32,
        num_components: usize,
    ) -> Result<Option<TileBank>> {
        let valid = source.valid_tiles();
        if tile_row < valid.pos.y || tile_row >= valid.limit().y {
            return Ok(None);
        }
        let mut tiles = Vec::new();
        let mut comp_regions = vec![Rect::default(); num_components];
        for tx in valid.pos.x..valid.limit().x {
            let idx = Coords::new(tx, tile_row);
            let mut regions = Vec::with_capacity(num_components);
            let mut empty = true;
            for c in 0..num_components {
                let dims = source.tile_dims(idx, c);
                if !dims.is_empty() {
                    empty = false;
                }
                regions.push(dims);
            }
            if empty {
                continue;
            }
            let engine = source.open_tile(idx)?;
            for (c, dims) in regions.iter().enumerate() {
                comp_regions[c] = comp_regions[c].union(dims);
            }
            tiles.push(OpenTile { idx, engine, comp_regions: regions });
        }
        if tiles.is_empty() {
            return Ok(None);
        }
        debug!("opened tile bank: row {}, {} tiles", tile_row, tiles.len());
        Ok(Some(TileBank {
            tile_row,
            tiles,
            comp_regions,
            lines_pulled: vec![0; num_components],
        }))
    }

    /// The region this bank covers on component `c`.
    pub fn comp_region(&self, c: usize) -> Rect {
        self.comp_regions[c]
    }

    /// True once every line of component `c` has been pulled.
    pub fn exhausted(&self, c: usize) -> bool {
        self.lines_pulled[c] >= self.comp_regions[c].size.y
    }

    /// Pulls the next full-width line of component `c`, splicing the per-tile lines
    /// together. Tiles that deliver short lines are padded by replicating their last
    /// sample. Returns `None` once the bank is exhausted.
    pub fn pull_line(&mut self, c: usize) -> Result<Option<SampleLine>> {
        if self.exhausted(c) {
            return Ok(None);
        }
        let width = self.comp_regions[c].size.x as usize;
        let mut assembled: Option<SampleLine> = None;
        let mut at = 0usize;
        for tile in self.tiles.iter_mut() {
            let tile_width = tile.comp_regions[c].size.x as usize;
            if tile_width == 0 {
                continue;
            }
            let Some(line) = tile.engine.get_line(c)? else { continue };
            let out = assembled
                .get_or_insert_with(|| SampleLine::new(width, line.line_type()));
            splice(out, at, &line, tile_width);
            at += tile_width;
        }
        self.lines_pulled[c] += 1;
        Ok(assembled)
    }
}

/// Copies `width` samples of `src` into `dst` starting at `at`, replicating the last
/// available sample when the source line is short.
fn splice(dst: &mut SampleLine, at: usize, src: &SampleLine, width: usize) {
    let n = src.width().min(width);
    if n == 0 {
        return;
    }
    if let (Some(s), Some(d)) = (src.buf16(), dst.buf16_mut()) {
        d[at..at + n].copy_from_slice(&s[..n]);
        let last = s[n - 1];
        for v in d[at + n..at + width].iter_mut() {
            *v = last;
        }
    }
    else if let (Some(s), Some(d)) = (src.buf32(), dst.buf32_mut()) {
        d[at..at + n].copy_from_slice(&s[..n]);
        let last = s[n - 1];
        for v in d[at + n..at + width].iter_mut() {
            *v = last;
        }
    }
    else if let (Some(s), Some(d)) = (src.buf_f32(), dst.buf_f32_mut()) {
        d[at..at + n].copy_from_slice(&s[..n]);
        let last = s[n - 1];
        for v in d[at + n..at + width].iter_mut() {
            *v = last;
        }
    }
}
