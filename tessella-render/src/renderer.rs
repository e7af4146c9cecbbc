// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `renderer` module orchestrates region decompression: it opens tile banks,
//! drives the per-channel pipelines, applies colour conversion and white stretch, and
//! transfers finished rows into the caller's buffer.

use log::debug;

use tessella_core::codestream::TileSource;
use tessella_core::errors::{Result, TessellaError};
use tessella_core::geometry::{Coords, Rect};
use tessella_core::sample::{LineType, SampleLine};

use crate::channel::{Alignment, ChannelParams, ChannelPipeline, SourceInfo};
use crate::tiles::TileBank;
use crate::transfer::{
    derive_scaling, fill_transfer_bytes, interleaved_applicable,
    transfer_interleaved_fix16_to_bytes, transfer_to_bytes, transfer_to_floats,
    transfer_to_words, TransferFlags, TransferParams, TransferSource,
};

/// Converts a set of channel rows between colour spaces in place. The conversion
/// maths live outside the core; a renderer without a converter passes rows through.
pub trait ColourConverter {
    fn convert_rows(&self, rows: &mut [SampleLine]) -> Result<()>;
}

/// Static configuration of a render pass.
pub struct RendererConfig {
    pub channels: Vec<ChannelParams>,
    /// Source description per codestream component.
    pub components: Vec<SourceInfo>,
    pub colour: Option<Box<dyn ColourConverter>>,
    /// Maximum quality layers to decode; 0 means no limit.
    pub max_layers: usize,
    pub max_overshoot: f32,
    pub zero_overshoot_threshold: f32,
    /// Output precision; 0 selects [0, 1] float normalization.
    pub dst_prec: u32,
    /// Bytes per output sample: 1, 2, or 4 (floats).
    pub sample_bytes: usize,
    /// Samples per pixel in the output buffer.
    pub pixel_gap: usize,
    pub flags: TransferFlags,
    /// Append a constant alpha-fill channel after the real channels.
    pub alpha_fill: bool,
}

/// Per-bank rendering state: the open tiles plus one pipeline per channel.
struct BankState {
    bank: TileBank,
    pipelines: Vec<ChannelPipeline>,
    transfers: Vec<TransferParams>,
    out_x0: i32,
    out_width: usize,
    out_y: i32,
    out_end_y: i32,
}

/// Renders a client-specified window of the image into caller buffers.
pub struct RegionRenderer {
    source: Box<dyn TileSource>,
    config: RendererConfig,
    full_region: Rect,
    incomplete: Rect,
    next_tile_row: i32,
    bank: Option<BankState>,
    /// Pre-opened tiles for the following row, so a bank transition does not stall on
    /// tile opens.
    background: Option<(i32, TileBank)>,
}

impl std::fmt::Debug for RegionRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionRenderer")
            .field("full_region", &self.full_region)
            .field("incomplete", &self.incomplete)
            .field("next_tile_row", &self.next_tile_row)
            .finish_non_exhaustive()
    }
}

/// Maps a rectangle through the rational expansion `num`/`den` per axis, covering
/// every output cell any input cell touches.
fn scale_rect(rect: Rect, num: Coords, den: Coords) -> Rect {
    let x0 = floor_ratio(rect.pos.x, num.x, den.x);
    let y0 = floor_ratio(rect.pos.y, num.y, den.y);
    let x1 = ceil_ratio(rect.limit().x, num.x, den.x);
    let y1 = ceil_ratio(rect.limit().y, num.y, den.y);
    Rect::new(Coords::new(x0, y0), Coords::new(x1 - x0, y1 - y0))
}

fn floor_ratio(v: i32, num: i32, den: i32) -> i32 {
    let prod = i64::from(v) * i64::from(num);
    (prod.div_euclid(i64::from(den))) as i32
}

fn ceil_ratio(v: i32, num: i32, den: i32) -> i32 {
    let prod = i64::from(v) * i64::from(num);
    (-((-prod).div_euclid(i64::from(den)))) as i32
}

impl RegionRenderer {
    /// Prepares a render pass over `region`, given on the output grid (the reference
    /// channel's expanded coordinate system).
    pub fn start(
        mut source: Box<dyn TileSource>,
        config: RendererConfig,
        region: Rect,
    ) -> Result<RegionRenderer> {
        assert!(!config.channels.is_empty());
        let ref_ch = &config.channels[0];
        let image = source.image_dims(ref_ch.source_component);
        let image_out = scale_rect(image, ref_ch.sampling_num, ref_ch.sampling_den);
        if !image_out.contains(&region) {
            return Err(TessellaError::RegionOutsideImage);
        }

        // Restrict the codestream to the source region feeding the render window.
        let comp_region = scale_rect(region, ref_ch.sampling_den, ref_ch.sampling_num);
        source.apply_input_restrictions(comp_region, config.max_layers)?;
        let next_tile_row = source.valid_tiles().pos.y;
        debug!("render pass over {:?}", region);
        Ok(RegionRenderer {
            source,
            config,
            full_region: region,
            incomplete: region,
            next_tile_row,
            bank: None,
            background: None,
        })
    }

    pub fn full_region(&self) -> Rect {
        self.full_region
    }

    /// Renders as much of the incomplete region as the current tile bank provides.
    ///
    /// `buffer` spans `buffer_region` on the output grid, `row_gap` pixels per row,
    /// `pixel_gap` samples per pixel. Returns the rectangle rendered by this call and
    /// shrinks `incomplete_region` accordingly; an empty incomplete region returns at
    /// once without touching the buffer.
    pub fn process(
        &mut self,
        buffer: &mut [u8],
        buffer_region: Rect,
        row_gap: usize,
        incomplete_region: &mut Rect,
    ) -> Result<Rect> {
        if incomplete_region.is_empty() {
            return Ok(Rect::default());
        }
        self.incomplete = *incomplete_region;

        if self.bank.is_none() && !self.open_next_bank()? {
            // Nothing left to render.
            *incomplete_region = Rect::default();
            return Ok(Rect::default());
        }

        let rendered = self.render_bank(buffer, buffer_region, row_gap)?;
        let finished = {
            let state = self.bank.as_ref().unwrap();
            state.out_y >= state.out_end_y
        };
        if finished {
            self.bank = None;
            self.next_tile_row += 1;
        }

        if !rendered.is_empty() {
            let consumed = rendered.limit().y - self.incomplete.pos.y;
            if consumed > 0 {
                self.incomplete.pos.y += consumed;
                self.incomplete.size.y -= consumed;
            }
        }
        *incomplete_region = self.incomplete;

        if finished && !self.incomplete.is_empty() {
            self.prefetch_background()?;
        }
        Ok(rendered)
    }

    /// Opens the next contributing tile row ahead of time.
    fn prefetch_background(&mut self) -> Result<()> {
        if self.background.is_some() {
            return Ok(());
        }
        let valid = self.source.valid_tiles();
        if self.next_tile_row >= valid.limit().y {
            return Ok(());
        }
        let num_components = self.config.components.len();
        if let Some(bank) =
            TileBank::open(self.source.as_mut(), self.next_tile_row, num_components)?
        {
            self.background = Some((self.next_tile_row, bank));
        }
        Ok(())
    }

    /// Opens the next tile bank that contributes to the region, building its channel
    /// pipelines. Returns false when the tile rows are exhausted.
    fn open_next_bank(&mut self) -> Result<bool> {
        let num_components = self.config.components.len();
        loop {
            let valid = self.source.valid_tiles();
            if self.next_tile_row >= valid.limit().y {
                return Ok(false);
            }
            let opened = match self.background.take() {
                Some((row, bank)) if row == self.next_tile_row => Some(bank),
                Some(_) => {
                    // Stale prefetch from before a restriction change.
                    TileBank::open(self.source.as_mut(), self.next_tile_row, num_components)?
                }
                None => TileBank::open(self.source.as_mut(), self.next_tile_row, num_components)?,
            };
            match opened {
                Some(bank) => {
                    let state = self.build_bank_state(bank)?;
                    let empty = state.out_y >= state.out_end_y;
                    self.bank = Some(state);
                    if empty {
                        // The bank lies outside the remaining region.
                        self.bank = None;
                        self.next_tile_row += 1;
                        continue;
                    }
                    return Ok(true);
                }
                None => {
                    // No tile in this row survives the region; advance without error.
                    self.next_tile_row += 1;
                }
            }
        }
    }

    fn build_bank_state(&mut self, bank: TileBank) -> Result<BankState> {
        let ref_ch = &self.config.channels[0];
        let ref_region = bank.comp_region(ref_ch.source_component);
        let bank_out =
            scale_rect(ref_region, ref_ch.sampling_num, ref_ch.sampling_den);
        let window = bank_out.intersect(&self.incomplete);

        let mut pipelines = Vec::with_capacity(self.config.channels.len());
        let mut transfers = Vec::with_capacity(self.config.channels.len());
        for ch in &self.config.channels {
            let src = self.config.components[ch.source_component];
            let comp_region = bank.comp_region(ch.source_component);
            // Anchor the window against the source region: the first output sample may
            // sit a fractional phase past a source sample the tiles deliver.
            let src_x = floor_ratio(window.pos.x, ch.sampling_den.x, ch.sampling_num.x);
            let src_y = floor_ratio(window.pos.y, ch.sampling_den.y, ch.sampling_num.y);
            let align = Alignment {
                src_offset: (src_x - comp_region.pos.x).max(0) as usize,
                skip_rows: (src_y - comp_region.pos.y).max(0) as usize,
                h_phase: window.pos.x * ch.sampling_den.x - src_x * ch.sampling_num.x,
                v_phase: window.pos.y * ch.sampling_den.y - src_y * ch.sampling_num.y,
            };
            let pipeline = ChannelPipeline::new(
                ch.clone(),
                src,
                window.size.x.max(0) as usize,
                window.size.y.max(0) as usize,
                comp_region.size.x as usize,
                comp_region.size.y as usize,
                align,
                self.config.max_overshoot,
                self.config.zero_overshoot_threshold,
            )?;
            let normalized_max = 0.5 - 0.5f32.powi(src.precision as i32);
            let (scale, offset) =
                derive_scaling(self.config.flags, src.signed, normalized_max, ch.zeta);
            transfers.push(TransferParams {
                dst_prec: self.config.dst_prec,
                pixel_gap: self.config.pixel_gap,
                flags: self.config.flags,
                scale,
                offset,
            });
            pipelines.push(pipeline);
        }
        Ok(BankState {
            bank,
            pipelines,
            transfers,
            out_x0: window.pos.x,
            out_width: window.size.x.max(0) as usize,
            out_y: window.pos.y,
            out_end_y: window.limit().y,
        })
    }

    /// Pumps source lines and writes every output row the current bank can produce.
    fn render_bank(
        &mut self,
        buffer: &mut [u8],
        buffer_region: Rect,
        row_gap: usize,
    ) -> Result<Rect> {
        let state = self.bank.as_mut().unwrap();
        let start_y = state.out_y;
        let mut rows = Vec::with_capacity(state.pipelines.len());
        while state.out_y < state.out_end_y {
            // Feed components until every channel has a finished row. A component line
            // is pulled once and distributed to every channel it serves.
            loop {
                let mut comps_needed: Vec<usize> = Vec::new();
                for (c, pipe) in state.pipelines.iter().enumerate() {
                    if !pipe.has_ready() {
                        let comp = self.config.channels[c].source_component;
                        if !comps_needed.contains(&comp) {
                            comps_needed.push(comp);
                        }
                    }
                }
                if comps_needed.is_empty() {
                    break;
                }
                for &comp in &comps_needed {
                    let Some(line) = state.bank.pull_line(comp)? else {
                        return Err(TessellaError::CodestreamFailure(
                            "tile bank ran out of lines".into(),
                        ));
                    };
                    let users: Vec<usize> = (0..state.pipelines.len())
                        .filter(|&c| self.config.channels[c].source_component == comp)
                        .collect();
                    if users.len() == 1 {
                        // Sole consumer: the channel may adopt the line outright.
                        state.pipelines[users[0]].push_source_line_owned(line)?;
                    }
                    else {
                        for &c in &users {
                            state.pipelines[c].push_source_line(&line)?;
                        }
                    }
                }
            }
            for pipe in state.pipelines.iter_mut() {
                let Some(row) = pipe.pull_output() else {
                    return Err(TessellaError::CodestreamFailure(
                        "channel pipeline produced no row".into(),
                    ));
                };
                rows.push(row);
            }

            if let Some(colour) = self.config.colour.as_ref() {
                colour.convert_rows(&mut rows)?;
            }
            for (c, row) in rows.iter_mut().enumerate() {
                state.pipelines[c].stretch_line(row);
            }
            Self::write_rows(&self.config, state, &rows, buffer, buffer_region, row_gap)?;
            for (c, row) in rows.drain(..).enumerate() {
                state.pipelines[c].recycle(row);
            }
            state.out_y += 1;
        }
        Ok(Rect::new(
            Coords::new(state.out_x0, start_y),
            Coords::new(state.out_width as i32, state.out_y - start_y),
        ))
    }

    /// Writes one set of channel rows at the bank's current output row.
    fn write_rows(
        config: &RendererConfig,
        state: &BankState,
        rows: &[SampleLine],
        buffer: &mut [u8],
        buffer_region: Rect,
        row_gap: usize,
    ) -> Result<()> {
        let y = state.out_y;
        if y < buffer_region.pos.y || y >= buffer_region.limit().y {
            return Ok(());
        }
        let gap = config.pixel_gap;
        let row_pixels =
            ((y - buffer_region.pos.y) as usize) * row_gap
                + (state.out_x0 - buffer_region.pos.x) as usize;
        let num = state.out_width;

        // Four fix16 channels into interleaved 8-bit pixels go through the 4-way
        // transfer when nothing needs scaling.
        if config.sample_bytes == 1
            && rows.len() == 4
            && gap == 4
            && !config.alpha_fill
            && rows.iter().all(|r| r.buf16().is_some())
            && state
                .transfers
                .iter()
                .all(|t| interleaved_applicable(t, true))
        {
            let srcs = [
                rows[0].buf16().unwrap(),
                rows[1].buf16().unwrap(),
                rows[2].buf16().unwrap(),
                rows[3].buf16().unwrap(),
            ];
            let dst = &mut buffer[row_pixels * 4..];
            transfer_interleaved_fix16_to_bytes(srcs, 0, num, dst, config.dst_prec);
            return Ok(());
        }

        for (c, row) in rows.iter().enumerate() {
            let params = &state.transfers[c];
            let src = match row.line_type() {
                LineType::Fix16 { .. } => TransferSource::Fix16(row.buf16().unwrap()),
                LineType::Int32 { .. } => TransferSource::Int32 {
                    samples: row.buf32().unwrap(),
                    precision: state.pipelines[c].in_precision(),
                },
                LineType::Float32 => TransferSource::Float32(row.buf_f32().unwrap()),
            };
            match config.sample_bytes {
                1 => {
                    let dst = &mut buffer[(row_pixels * gap + c)..];
                    transfer_to_bytes(src, 0, num, dst, params);
                }
                2 => {
                    // The caller's byte buffer must be aligned and sized for whole
                    // 16-bit samples; anything else is a geometry error, not a panic.
                    let words: &mut [u16] = bytemuck::try_cast_slice_mut(buffer)
                        .map_err(|_| TessellaError::DimensionOverflow)?;
                    let dst = &mut words[(row_pixels * gap + c)..];
                    transfer_to_words(src, 0, num, dst, params);
                }
                4 => {
                    let floats: &mut [f32] = bytemuck::try_cast_slice_mut(buffer)
                        .map_err(|_| TessellaError::DimensionOverflow)?;
                    let dst = &mut floats[(row_pixels * gap + c)..];
                    transfer_to_floats(src, 0, num, dst, params);
                }
                _ => {
                    return Err(TessellaError::UnsupportedFormat(
                        "output samples must be 1, 2 or 4 bytes",
                    ));
                }
            }
        }
        if config.alpha_fill && config.sample_bytes == 1 {
            let c = rows.len();
            let params = TransferParams {
                dst_prec: config.dst_prec,
                pixel_gap: gap,
                flags: config.flags,
                scale: 1.0,
                offset: 0.0,
            };
            let dst = &mut buffer[(row_pixels * gap + c)..];
            fill_transfer_bytes(num, dst, &params);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use tessella_core::codestream::SynthesisEngine;
    use tessella_core::sample::FIX_POINT;

    /// One-component in-memory image split into horizontal tile rows.
    struct MemSource {
        dims: Rect,
        rows_per_tile: i32,
        data: Vec<i16>,
        restricted: Rect,
    }

    struct MemEngine {
        lines: VecDeque<Vec<i16>>,
    }

    impl SynthesisEngine for MemEngine {
        fn get_line(&mut self, _component: usize) -> Result<Option<SampleLine>> {
            let Some(row) = self.lines.pop_front() else { return Ok(None) };
            let mut line = SampleLine::new(row.len(), LineType::Fix16 { absolute: false });
            line.buf16_mut().unwrap().copy_from_slice(&row);
            Ok(Some(line))
        }
    }

    impl MemSource {
        fn new(width: i32, height: i32, rows_per_tile: i32) -> Self {
            let data = (0..width * height)
                .map(|i| (((i * 731) % 8192) - 4096) as i16)
                .collect();
            MemSource {
                dims: Rect::new(Coords::new(0, 0), Coords::new(width, height)),
                rows_per_tile,
                data,
                restricted: Rect::new(Coords::new(0, 0), Coords::new(width, height)),
            }
        }
    }

    impl TileSource for MemSource {
        fn open_tile(&mut self, idx: Coords) -> Result<Box<dyn SynthesisEngine>> {
            let dims = self.tile_dims(idx, 0);
            let width = self.dims.size.x as usize;
            let mut lines = VecDeque::new();
            for y in dims.pos.y..dims.limit().y {
                let row = &self.data[(y as usize) * width..][..width];
                let x0 = dims.pos.x as usize;
                lines.push_back(row[x0..x0 + dims.size.x as usize].to_vec());
            }
            Ok(Box::new(MemEngine { lines }))
        }

        fn tile_dims(&self, idx: Coords, _component: usize) -> Rect {
            let y0 = idx.y * self.rows_per_tile;
            let h = (self.dims.size.y - y0).min(self.rows_per_tile);
            let tile = Rect::new(Coords::new(0, y0), Coords::new(self.dims.size.x, h.max(0)));
            tile.intersect(&self.restricted)
        }

        fn map_region(&self, _component: usize, region: Rect) -> Rect {
            region
        }

        fn subsampling(&self, _component: usize) -> Coords {
            Coords::new(1, 1)
        }

        fn apply_input_restrictions(&mut self, region: Rect, _max_layers: usize) -> Result<()> {
            self.restricted = region.intersect(&self.dims);
            Ok(())
        }

        fn valid_tiles(&self) -> Rect {
            let rows = (self.dims.size.y + self.rows_per_tile - 1) / self.rows_per_tile;
            Rect::new(Coords::new(0, 0), Coords::new(1, rows))
        }

        fn image_dims(&self, _component: usize) -> Rect {
            self.dims
        }
    }

    fn byte_config() -> RendererConfig {
        RendererConfig {
            channels: vec![ChannelParams::default()],
            components: vec![SourceInfo {
                line_type: LineType::Fix16 { absolute: false },
                precision: 8,
                signed: false,
            }],
            colour: None,
            max_layers: 0,
            max_overshoot: 0.4,
            zero_overshoot_threshold: 2.0,
            dst_prec: 8,
            sample_bytes: 1,
            pixel_gap: 1,
            flags: TransferFlags::empty(),
            alpha_fill: false,
        }
    }

    fn expected_byte(v: i16) -> u8 {
        let y = f32::from(v) / (1 << FIX_POINT) as f32 + 0.5;
        ((y * 256.0 + 0.5).floor() as i32).clamp(0, 255) as u8
    }

    fn render_all(source: MemSource, config: RendererConfig, region: Rect) -> Vec<u8> {
        let mut renderer = RegionRenderer::start(Box::new(source), config, region).unwrap();
        let mut buffer = vec![0u8; (region.size.x * region.size.y) as usize];
        let mut incomplete = region;
        let mut guard = 0;
        while !incomplete.is_empty() {
            renderer
                .process(&mut buffer, region, region.size.x as usize, &mut incomplete)
                .unwrap();
            guard += 1;
            assert!(guard < 100, "render did not converge");
        }
        buffer
    }

    #[test]
    fn verify_unit_render_matches_source() {
        // With 1:1 sampling and no palette or conversion, every rendered sample equals
        // the transfer of the component sample at the mapped point.
        let source = MemSource::new(8, 8, 8);
        let expect: Vec<u8> = source.data.iter().map(|&v| expected_byte(v)).collect();
        let region = Rect::new(Coords::new(0, 0), Coords::new(8, 8));
        let buffer = render_all(source, byte_config(), region);
        assert_eq!(buffer, expect);
    }

    #[test]
    fn verify_multiple_tile_banks() {
        // The same image split over four tile rows renders identically.
        let source = MemSource::new(8, 8, 2);
        let expect: Vec<u8> = source.data.iter().map(|&v| expected_byte(v)).collect();
        let region = Rect::new(Coords::new(0, 0), Coords::new(8, 8));
        let buffer = render_all(source, byte_config(), region);
        assert_eq!(buffer, expect);
    }

    #[test]
    fn verify_render_is_idempotent() {
        let region = Rect::new(Coords::new(0, 0), Coords::new(8, 8));
        let a = render_all(MemSource::new(8, 8, 4), byte_config(), region);
        let b = render_all(MemSource::new(8, 8, 4), byte_config(), region);
        assert_eq!(a, b);
    }

    #[test]
    fn verify_empty_incomplete_region_is_a_no_op() {
        let source = MemSource::new(4, 4, 4);
        let region = Rect::new(Coords::new(0, 0), Coords::new(4, 4));
        let mut renderer =
            RegionRenderer::start(Box::new(source), byte_config(), region).unwrap();
        let mut buffer = vec![0xabu8; 16];
        let mut incomplete = Rect::default();
        let rendered = renderer.process(&mut buffer, region, 4, &mut incomplete).unwrap();
        assert!(rendered.is_empty());
        assert!(buffer.iter().all(|&b| b == 0xab));
    }

    #[test]
    fn verify_interleaved_four_channel_render() {
        // Four channels reading the same component through the 4-way byte transfer:
        // every pixel carries four identical samples.
        let source = MemSource::new(4, 4, 4);
        let expect: Vec<u8> = source.data.iter().map(|&v| expected_byte(v)).collect();
        let mut config = byte_config();
        config.channels = vec![
            ChannelParams::default(),
            ChannelParams::default(),
            ChannelParams::default(),
            ChannelParams::default(),
        ];
        config.pixel_gap = 4;
        let region = Rect::new(Coords::new(0, 0), Coords::new(4, 4));
        let mut renderer = RegionRenderer::start(Box::new(source), config, region).unwrap();
        let mut buffer = vec![0u8; 64];
        let mut incomplete = region;
        while !incomplete.is_empty() {
            renderer.process(&mut buffer, region, 4, &mut incomplete).unwrap();
        }
        for (i, &e) in expect.iter().enumerate() {
            for c in 0..4 {
                assert_eq!(buffer[i * 4 + c], e, "pixel {} channel {}", i, c);
            }
        }
    }

    #[test]
    fn verify_alpha_fill_channel() {
        let source = MemSource::new(4, 4, 4);
        let expect: Vec<u8> = source.data.iter().map(|&v| expected_byte(v)).collect();
        let mut config = byte_config();
        config.pixel_gap = 2;
        config.alpha_fill = true;
        let region = Rect::new(Coords::new(0, 0), Coords::new(4, 4));
        let mut renderer = RegionRenderer::start(Box::new(source), config, region).unwrap();
        let mut buffer = vec![0u8; 32];
        let mut incomplete = region;
        while !incomplete.is_empty() {
            renderer.process(&mut buffer, region, 4, &mut incomplete).unwrap();
        }
        for (i, &e) in expect.iter().enumerate() {
            assert_eq!(buffer[i * 2], e);
            assert_eq!(buffer[i * 2 + 1], 255);
        }
    }

    #[test]
    fn verify_region_outside_image() {
        let source = MemSource::new(4, 4, 4);
        let region = Rect::new(Coords::new(0, 0), Coords::new(5, 4));
        let err = RegionRenderer::start(Box::new(source), byte_config(), region).unwrap_err();
        assert!(matches!(err, TessellaError::RegionOutsideImage));
    }

    #[test]
    fn verify_cropped_render() {
        // A window strictly inside the image renders exactly the covered samples.
        let source = MemSource::new(8, 8, 8);
        let region = Rect::new(Coords::new(2, 1), Coords::new(4, 3));
        let mut expect = Vec::new();
        for y in 1..4 {
            for x in 2..6 {
                expect.push(expected_byte(source.data[y * 8 + x]));
            }
        }
        let mut renderer =
            RegionRenderer::start(Box::new(source), byte_config(), region).unwrap();
        let mut buffer = vec![0u8; 12];
        let mut incomplete = region;
        let mut guard = 0;
        while !incomplete.is_empty() {
            renderer.process(&mut buffer, region, 4, &mut incomplete).unwrap();
            guard += 1;
            assert!(guard < 100);
        }
        assert_eq!(buffer, expect);
    }

    #[test]
    fn verify_upsampled_render() {
        // A 2x2 source expanded 2:1 on both axes fills a 4x4 output; constant input
        // renders as a constant field.
        let mut source = MemSource::new(2, 2, 2);
        source.data = vec![1000i16; 4];
        let mut config = byte_config();
        config.channels[0].sampling_num = Coords::new(2, 2);
        config.channels[0].sampling_den = Coords::new(1, 1);
        let region = Rect::new(Coords::new(0, 0), Coords::new(4, 4));
        let buffer = render_all(source, config, region);
        assert!(buffer.iter().all(|&b| b == expected_byte(1000)), "{:?}", buffer);
    }
}
