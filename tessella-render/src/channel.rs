// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `channel` module implements the per-output-channel sample pipeline: boxcar
//! pre-integration, palette mapping, format conversion, horizontal and vertical
//! rational resampling, and white stretch.
//!
//! Component lines are pushed in; finished output rows are pulled out. Working lines
//! circulate through a small recycling pool rather than being reallocated, and the
//! vertical resampler keeps a sliding window of up to six horizontally finished lines.

use std::collections::VecDeque;

use log::trace;

use tessella_core::errors::{expansion_error, Result, TessellaError};
use tessella_core::geometry::Coords;
use tessella_core::sample::{LineType, SampleLine, FIX_POINT};

use crate::floatrep::FloatReinterpret;
use crate::kernels::{validate_boxcar, KernelBank};

/// Number of working lines kept in a channel's recycling pool.
pub const CHANNEL_LINE_BUFS: usize = 4;

/// Maximum height of the vertical resampling window.
pub const VERT_WINDOW: usize = 6;

/// A palette attached to a channel, in fixed point and/or floating point form.
#[derive(Clone)]
#[derive(Debug)]
pub struct Palette {
    pub bits: u32,
    pub fix16_lut: Option<Vec<i16>>,
    pub float_lut: Option<Vec<f32>>,
}

/// Static description of one output channel.
#[derive(Clone)]
pub struct ChannelParams {
    pub source_component: usize,
    pub palette: Option<Palette>,
    /// Expansion ratio per axis: output/input = numerator/denominator.
    pub sampling_num: Coords,
    pub sampling_den: Coords,
    /// Power-of-two pre-averaging cell; (1, 1) disables the boxcar stage.
    pub boxcar_size: Coords,
    /// Nonzero for reinterpret-as-float channels.
    pub float_exp_bits: u32,
    /// Nonzero for fixpoint-formatted channels: integer bits above the binary point.
    pub fixpoint_int_bits: i32,
    /// Output precision driving white stretch; 0 disables the stretch.
    pub white_stretch_prec: u32,
    /// Natural-unsigned-zero offset, in [0, 1).
    pub zeta: f32,
}

impl Default for ChannelParams {
    fn default() -> Self {
        ChannelParams {
            source_component: 0,
            palette: None,
            sampling_num: Coords::new(1, 1),
            sampling_den: Coords::new(1, 1),
            boxcar_size: Coords::new(1, 1),
            float_exp_bits: 0,
            fixpoint_int_bits: 0,
            white_stretch_prec: 0,
            zeta: 0.0,
        }
    }
}

/// What the source component delivers.
#[derive(Copy, Clone, Debug)]
pub struct SourceInfo {
    pub line_type: LineType,
    pub precision: u32,
    pub signed: bool,
}

/// Alignment of the channel's output window against the source region it is fed from.
///
/// When a render window starts at a fractional source position, the first output
/// sample sits `h_phase`/`v_phase` (out of the sampling numerator) past the source
/// sample at `src_offset`/`skip_rows`.
#[derive(Copy, Clone, Debug, Default)]
pub struct Alignment {
    /// Source samples to skip at the start of every line.
    pub src_offset: usize,
    /// Source lines to discard before the window's first row.
    pub skip_rows: usize,
    /// Initial horizontal phase accumulator.
    pub h_phase: i32,
    /// Initial vertical phase accumulator.
    pub v_phase: i32,
}

/// Computes the white stretch residual for stretching a `src_prec`-bit source onto a
/// `dst_prec`-bit output range; zero when no stretch is needed.
pub fn white_stretch_residual(src_prec: u32, dst_prec: u32) -> i32 {
    if dst_prec <= src_prec || src_prec == 0 {
        return 0;
    }
    let num = 1.0 - 0.5f64.powi(dst_prec as i32);
    let den = 1.0 - 0.5f64.powi(src_prec as i32);
    ((num / den - 1.0) * 65536.0).round() as i32
}

/// Applies the white stretch in place on a fix16 line.
pub fn apply_white_stretch(samples: &mut [i16], residual: i32) {
    if residual == 0 {
        return;
    }
    let off = (1i32 << 15) + (residual << (FIX_POINT - 1));
    for s in samples.iter_mut() {
        let v = i32::from(*s);
        *s = (v + ((v * residual + off) >> 16)) as i16;
    }
}

const SINC_SUPPORT_LEFT: usize = 2;
const SINC_SUPPORT_RIGHT: usize = 3;

/// One channel's processing pipeline for a render pass.
#[derive(Debug)]
pub struct ChannelPipeline {
    line_type: LineType,
    in_precision: u32,
    out_width: usize,
    out_height: usize,
    produced: usize,

    /// Source samples consumed per horizontal pass (before resampling).
    in_needed: usize,
    h_kernels: Option<KernelBank>,
    v_kernels: Option<KernelBank>,
    sampling_num: Coords,
    sampling_den: Coords,
    h_phase0: i32,
    src_offset: usize,
    skip_rows: usize,

    boxcar_size: Coords,
    boxcar_acc: Vec<f64>,
    boxcar_lines: i32,

    palette: Option<Palette>,
    reinterpret: Option<FloatReinterpret>,
    fixpoint_int_bits: i32,
    src: SourceInfo,
    white_residual: i32,

    /// Input-side staging line with filter support extensions.
    in_line: SampleLine,
    /// Vertical sliding window of horizontally finished lines.
    vwin: VecDeque<SampleLine>,
    v_phase: i32,
    v_primed: bool,
    /// Recycling pool for working lines.
    free_lines: Vec<SampleLine>,
    /// Finished output rows awaiting the caller.
    ready: VecDeque<SampleLine>,
    /// Most recent horizontal line, kept for vertical drain replication.
    last_hline: Option<SampleLine>,
    src_rows_left: i32,
}

impl ChannelPipeline {
    /// Builds the pipeline for one channel of a render pass.
    ///
    /// `out_width`/`out_height` give the channel's region on the output grid;
    /// `in_width`/`in_rows` the source region delivered by the synthesis engines,
    /// after any boxcar integration has been accounted for by the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: ChannelParams,
        src: SourceInfo,
        out_width: usize,
        out_height: usize,
        in_width: usize,
        in_rows: usize,
        align: Alignment,
        max_overshoot: f32,
        zero_overshoot_threshold: f32,
    ) -> Result<ChannelPipeline> {
        validate_boxcar(params.boxcar_size.x, params.boxcar_size.y)?;
        if params.sampling_num.x <= 0
            || params.sampling_num.y <= 0
            || params.sampling_den.x <= 0
            || params.sampling_den.y <= 0
        {
            return expansion_error("sampling ratio terms must be positive");
        }

        let needs_float_lut = params
            .palette
            .as_ref()
            .map(|p| p.fix16_lut.is_none())
            .unwrap_or(false);
        let resampling_x = params.sampling_num.x != params.sampling_den.x;
        let resampling_y = params.sampling_num.y != params.sampling_den.y;
        let unit_sampling = !resampling_x && !resampling_y;

        // Line representation: floats when the format or palette demands the
        // precision, int32 for an absolute pass-through, fix16 otherwise.
        let line_type = if params.float_exp_bits > 0
            || params.fixpoint_int_bits != 0
            || needs_float_lut
            || (unit_sampling && src.line_type == LineType::Float32)
        {
            LineType::Float32
        }
        else if unit_sampling
            && src.line_type == (LineType::Int32 { absolute: true })
            && params.palette.is_none()
            && params.boxcar_size == Coords::new(1, 1)
        {
            LineType::Int32 { absolute: true }
        }
        else {
            LineType::Fix16 { absolute: false }
        };
        if let Some(palette) = params.palette.as_ref() {
            if line_type == LineType::Float32 && palette.float_lut.is_none() {
                return Err(TessellaError::PaletteFormatMismatch);
            }
        }
        let in_precision = match line_type {
            LineType::Fix16 { .. } => FIX_POINT,
            LineType::Int32 { .. } => src.precision,
            LineType::Float32 => 0,
        };

        let reinterpret = if params.float_exp_bits > 0 {
            Some(FloatReinterpret::new(params.float_exp_bits, src.precision, src.signed)?)
        }
        else {
            None
        };

        let h_kernels = if resampling_x {
            let expansion = params.sampling_num.x as f32 / params.sampling_den.x as f32;
            Some(KernelBank::new(expansion, max_overshoot, zero_overshoot_threshold)?)
        }
        else {
            None
        };
        let v_kernels = if resampling_y {
            let expansion = params.sampling_num.y as f32 / params.sampling_den.y as f32;
            // Reuse the horizontal bank when the vertical ratio is close enough.
            let target = crate::kernels::effective_overshoot(
                expansion,
                max_overshoot,
                zero_overshoot_threshold,
            );
            let reused =
                h_kernels.as_ref().and_then(|bank| KernelBank::copy(bank, expansion, target));
            match reused {
                Some(bank) => Some(bank),
                None => Some(KernelBank::new(expansion, max_overshoot, zero_overshoot_threshold)?),
            }
        }
        else {
            None
        };

        // Source samples touched by one horizontal pass.
        let in_needed = if resampling_x {
            let num = params.sampling_num.x as i64;
            let den = params.sampling_den.x as i64;
            ((out_width as i64 * den + num - 1) / num + 1) as usize
        }
        else {
            out_width
        };
        let in_line = SampleLine::with_extensions(
            in_needed,
            line_type,
            SINC_SUPPORT_LEFT,
            SINC_SUPPORT_RIGHT + 1,
        );

        let boxcar_cells = if params.boxcar_size.x > 1 || params.boxcar_size.y > 1 {
            let bx = params.boxcar_size.x as usize;
            (in_width.max(1) + bx - 1) / bx
        }
        else {
            0
        };
        let white_residual = white_stretch_residual(src.precision, params.white_stretch_prec);
        trace!(
            "channel pipeline: {}x{} out, {} in samples, type {:?}",
            out_width,
            out_height,
            in_needed,
            line_type
        );

        Ok(ChannelPipeline {
            line_type,
            in_precision,
            out_width,
            out_height,
            produced: 0,
            in_needed,
            h_kernels,
            v_kernels,
            sampling_num: params.sampling_num,
            sampling_den: params.sampling_den,
            h_phase0: align.h_phase,
            src_offset: align.src_offset,
            skip_rows: align.skip_rows,
            boxcar_size: params.boxcar_size,
            boxcar_acc: vec![0.0; boxcar_cells],
            boxcar_lines: 0,
            palette: params.palette,
            reinterpret,
            fixpoint_int_bits: params.fixpoint_int_bits,
            src,
            white_residual,
            in_line,
            vwin: VecDeque::new(),
            v_phase: align.v_phase,
            v_primed: false,
            free_lines: Vec::new(),
            ready: VecDeque::new(),
            last_hline: None,
            src_rows_left: in_rows as i32,
        })
    }

    pub fn line_type(&self) -> LineType {
        self.line_type
    }

    pub fn in_precision(&self) -> u32 {
        self.in_precision
    }

    pub fn white_residual(&self) -> i32 {
        self.white_residual
    }

    /// Returns a finished output row, if one is available. The caller hands the line
    /// back through [`ChannelPipeline::recycle`] once transferred.
    pub fn pull_output(&mut self) -> Option<SampleLine> {
        self.ready.pop_front()
    }

    /// True when at least one finished output row is waiting.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Returns a transferred line to the channel's pool.
    pub fn recycle(&mut self, line: SampleLine) {
        if self.free_lines.len() < CHANNEL_LINE_BUFS {
            self.free_lines.push(line);
        }
    }

    fn take_line(&mut self) -> SampleLine {
        match self.free_lines.pop() {
            Some(line) => line,
            None => SampleLine::new(self.out_width, self.line_type),
        }
    }

    /// True when component lines can bypass every processing stage: no palette, 1:1
    /// sampling, no boxcar, and a representation the output can carry unchanged.
    pub fn direct_path(&self) -> bool {
        self.h_kernels.is_none()
            && self.v_kernels.is_none()
            && self.palette.is_none()
            && self.reinterpret.is_none()
            && self.fixpoint_int_bits == 0
            && self.boxcar_size == Coords::new(1, 1)
            && self.src.line_type == self.line_type
            && self.src_offset == 0
    }

    /// Pushes one component line the pipeline may keep, taking the direct path when
    /// nothing needs to change: the line's storage is adopted instead of copied.
    pub fn push_source_line_owned(&mut self, line: SampleLine) -> Result<()> {
        if self.direct_path() && line.width() == self.out_width {
            debug_assert!(self.src_rows_left > 0);
            self.src_rows_left -= 1;
            if self.skip_rows > 0 {
                self.skip_rows -= 1;
                self.recycle(line);
                return Ok(());
            }
            if self.produced < self.out_height {
                self.produced += 1;
                self.ready.push_back(line);
            }
            return Ok(());
        }
        self.push_source_line(&line)
    }

    /// Pushes one component line through the pipeline.
    pub fn push_source_line(&mut self, line: &SampleLine) -> Result<()> {
        debug_assert!(self.src_rows_left > 0);
        self.src_rows_left -= 1;
        if self.skip_rows > 0 {
            // Rows above the window's first source row.
            self.skip_rows -= 1;
            return Ok(());
        }
        if self.boxcar_size.x > 1 || self.boxcar_size.y > 1 {
            self.boxcar_add(line)?;
            self.boxcar_lines += 1;
            let complete = self.boxcar_lines == self.boxcar_size.y || self.src_rows_left == 0;
            if !complete {
                return Ok(());
            }
            self.flush_boxcar()?;
        }
        else {
            self.convert_into_staging(line)?;
        }
        self.horizontal_pass()?;
        if self.src_rows_left == 0 {
            self.drain_vertical();
        }
        Ok(())
    }

    /// Accumulates one line into the boxcar cells at full precision.
    fn boxcar_add(&mut self, line: &SampleLine) -> Result<()> {
        let bx = self.boxcar_size.x as usize;
        let cells = self.boxcar_acc.len();
        let width = line.width();
        for c in 0..cells {
            let mut sum = 0.0;
            for k in 0..bx {
                let i = (self.src_offset + c * bx + k).min(width - 1);
                sum += self.source_value(line, i)?;
            }
            self.boxcar_acc[c] += sum;
        }
        Ok(())
    }

    /// Normalizes the completed boxcar cells into the staging line and resets them.
    fn flush_boxcar(&mut self) -> Result<()> {
        let area = (self.boxcar_size.x * self.boxcar_lines) as f64;
        let cells = self.boxcar_acc.len();
        let n = self.in_needed;
        match self.line_type {
            LineType::Fix16 { .. } => {
                let buf = self.in_line.extended16_mut().expect("fix16 staging");
                for i in 0..n {
                    let c = i.min(cells - 1);
                    let v = self.boxcar_acc[c] / area * f64::from(1 << FIX_POINT);
                    buf[SINC_SUPPORT_LEFT + i] = v.round() as i16;
                }
            }
            LineType::Float32 => {
                let buf = self.in_line.extended_f32_mut().expect("float staging");
                for i in 0..n {
                    let c = i.min(cells - 1);
                    buf[SINC_SUPPORT_LEFT + i] = (self.boxcar_acc[c] / area) as f32;
                }
            }
            LineType::Int32 { .. } => {
                unreachable!("boxcar integration never selects the int32 pass-through");
            }
        }
        for v in &mut self.boxcar_acc {
            *v = 0.0;
        }
        self.boxcar_lines = 0;
        self.extend_staging();
        Ok(())
    }

    /// One source sample as a normalized value, shared by the boxcar accumulators.
    fn source_value(&self, line: &SampleLine, i: usize) -> Result<f64> {
        let v = match line.line_type() {
            LineType::Fix16 { absolute: false } => {
                f64::from(line.buf16().unwrap()[i]) / f64::from(1 << FIX_POINT)
            }
            LineType::Fix16 { absolute: true } => {
                f64::from(line.buf16().unwrap()[i]) / (1u64 << self.src.precision) as f64
            }
            LineType::Int32 { absolute: true } => {
                f64::from(line.buf32().unwrap()[i]) / (1u64 << self.src.precision) as f64
            }
            LineType::Int32 { absolute: false } => {
                f64::from(line.buf32().unwrap()[i]) / f64::from(1 << FIX_POINT)
            }
            LineType::Float32 => f64::from(line.buf_f32().unwrap()[i]),
        };
        Ok(v)
    }

    /// Converts one component line into the staging buffer, applying the palette or
    /// format reinterpretation and replicating at both edges.
    fn convert_into_staging(&mut self, line: &SampleLine) -> Result<()> {
        let n = self.in_needed;
        let width = line.width();
        debug_assert!(width > 0);

        if let Some(palette) = self.palette.as_ref() {
            // Palette indices come from 16-bit absolute source values.
            let src = line.buf16().ok_or(TessellaError::UnsupportedFormat(
                "palette lookup requires 16-bit absolute samples",
            ))?;
            let limit = (1i32 << palette.bits) - 1;
            match self.line_type {
                LineType::Float32 => {
                    let lut = palette.float_lut.as_ref().expect("float palette");
                    let buf = self.in_line.extended_f32_mut().unwrap();
                    for i in 0..n {
                        let idx = i32::from(src[(self.src_offset + i).min(width - 1)]).clamp(0, limit) as usize;
                        buf[SINC_SUPPORT_LEFT + i] = lut[idx];
                    }
                }
                _ => {
                    let lut = palette.fix16_lut.as_ref().expect("fix16 palette");
                    let buf = self.in_line.extended16_mut().unwrap();
                    for i in 0..n {
                        let idx = i32::from(src[(self.src_offset + i).min(width - 1)]).clamp(0, limit) as usize;
                        buf[SINC_SUPPORT_LEFT + i] = lut[idx];
                    }
                }
            }
            self.extend_staging();
            return Ok(());
        }

        match self.line_type {
            LineType::Fix16 { .. } => {
                let prec = self.src.precision;
                let buf = self.in_line.extended16_mut().unwrap();
                match line.line_type() {
                    LineType::Fix16 { absolute: false } => {
                        let src = line.buf16().unwrap();
                        for i in 0..n {
                            buf[SINC_SUPPORT_LEFT + i] = src[(self.src_offset + i).min(width - 1)];
                        }
                    }
                    LineType::Fix16 { absolute: true } => {
                        let src = line.buf16().unwrap();
                        for i in 0..n {
                            buf[SINC_SUPPORT_LEFT + i] =
                                rescale_int(i32::from(src[(self.src_offset + i).min(width - 1)]), prec) as i16;
                        }
                    }
                    LineType::Int32 { absolute: true } => {
                        let src = line.buf32().unwrap();
                        for i in 0..n {
                            buf[SINC_SUPPORT_LEFT + i] =
                                rescale_int(src[(self.src_offset + i).min(width - 1)], prec) as i16;
                        }
                    }
                    LineType::Float32 => {
                        let src = line.buf_f32().unwrap();
                        for i in 0..n {
                            let v = src[(self.src_offset + i).min(width - 1)] * (1 << FIX_POINT) as f32;
                            buf[SINC_SUPPORT_LEFT + i] = v.round() as i16;
                        }
                    }
                    LineType::Int32 { absolute: false } => {
                        let src = line.buf32().unwrap();
                        for i in 0..n {
                            buf[SINC_SUPPORT_LEFT + i] = src[(self.src_offset + i).min(width - 1)] as i16;
                        }
                    }
                }
            }
            LineType::Int32 { .. } => {
                let src = line.buf32().ok_or(TessellaError::UnsupportedFormat(
                    "int32 pass-through requires 32-bit absolute samples",
                ))?;
                let buf = self.in_line.extended32_mut().unwrap();
                for i in 0..n {
                    buf[SINC_SUPPORT_LEFT + i] = src[(self.src_offset + i).min(width - 1)];
                }
            }
            LineType::Float32 => {
                if let Some(reinterpret) = self.reinterpret {
                    let src = line.buf32().ok_or(TessellaError::UnsupportedFormat(
                        "float reinterpretation requires absolute 32-bit samples",
                    ))?;
                    let buf = self.in_line.extended_f32_mut().unwrap();
                    for i in 0..n {
                        buf[SINC_SUPPORT_LEFT + i] = reinterpret.convert(src[(self.src_offset + i).min(width - 1)]);
                    }
                }
                else if self.fixpoint_int_bits != 0 {
                    let src = line.buf32().ok_or(TessellaError::UnsupportedFormat(
                        "fixpoint formats require absolute 32-bit samples",
                    ))?;
                    let shift = self.src.precision as i32 - self.fixpoint_int_bits;
                    let scale = 2f32.powi(-shift);
                    let buf = self.in_line.extended_f32_mut().unwrap();
                    for i in 0..n {
                        buf[SINC_SUPPORT_LEFT + i] = src[(self.src_offset + i).min(width - 1)] as f32 * scale;
                    }
                }
                else {
                    let buf = self.in_line.extended_f32_mut().unwrap();
                    match line.line_type() {
                        LineType::Float32 => {
                            let src = line.buf_f32().unwrap();
                            for i in 0..n {
                                buf[SINC_SUPPORT_LEFT + i] = src[(self.src_offset + i).min(width - 1)];
                            }
                        }
                        LineType::Fix16 { .. } => {
                            let src = line.buf16().unwrap();
                            for i in 0..n {
                                buf[SINC_SUPPORT_LEFT + i] =
                                    f32::from(src[(self.src_offset + i).min(width - 1)]) / (1 << FIX_POINT) as f32;
                            }
                        }
                        LineType::Int32 { .. } => {
                            let src = line.buf32().unwrap();
                            let scale = 1.0 / (1u64 << self.src.precision) as f32;
                            for i in 0..n {
                                buf[SINC_SUPPORT_LEFT + i] = src[(self.src_offset + i).min(width - 1)] as f32 * scale;
                            }
                        }
                    }
                }
            }
        }
        self.extend_staging();
        Ok(())
    }

    /// Replicates the staging line's first and last samples into its extensions.
    fn extend_staging(&mut self) {
        let n = self.in_needed;
        match self.line_type {
            LineType::Fix16 { .. } => {
                let buf = self.in_line.extended16_mut().unwrap();
                let first = buf[SINC_SUPPORT_LEFT];
                let last = buf[SINC_SUPPORT_LEFT + n - 1];
                for i in 0..SINC_SUPPORT_LEFT {
                    buf[i] = first;
                }
                for v in buf[SINC_SUPPORT_LEFT + n..].iter_mut() {
                    *v = last;
                }
            }
            LineType::Int32 { .. } => {
                let buf = self.in_line.extended32_mut().unwrap();
                let first = buf[SINC_SUPPORT_LEFT];
                let last = buf[SINC_SUPPORT_LEFT + n - 1];
                for i in 0..SINC_SUPPORT_LEFT {
                    buf[i] = first;
                }
                for v in buf[SINC_SUPPORT_LEFT + n..].iter_mut() {
                    *v = last;
                }
            }
            LineType::Float32 => {
                let buf = self.in_line.extended_f32_mut().unwrap();
                let first = buf[SINC_SUPPORT_LEFT];
                let last = buf[SINC_SUPPORT_LEFT + n - 1];
                for i in 0..SINC_SUPPORT_LEFT {
                    buf[i] = first;
                }
                for v in buf[SINC_SUPPORT_LEFT + n..].iter_mut() {
                    *v = last;
                }
            }
        }
    }

    /// Runs the horizontal stage on the staging line and feeds the result to the
    /// vertical stage.
    fn horizontal_pass(&mut self) -> Result<()> {
        let mut out = self.take_line();
        if self.h_kernels.is_none() {
            // 1:1 sampling bypasses the resampler entirely.
            copy_from_staging(&self.in_line, &mut out, self.out_width);
        }
        else {
            let bank = self.h_kernels.as_ref().unwrap();
            let num = self.sampling_num.x;
            let den = self.sampling_den.x;
            let mut phase = self.h_phase0;
            let mut s = 0usize;
            match self.line_type {
                LineType::Fix16 { .. } => {
                    let src = self.in_line.extended16_mut().unwrap();
                    let src: &[i16] = src;
                    let dst = out.buf16_mut().unwrap();
                    for d in dst.iter_mut().take(self.out_width) {
                        let taps = bank.kernel(phase_index(phase, num));
                        let base = window_base(s, bank.kernel_length);
                        let mut acc = 0f32;
                        for (t, &k) in taps.iter().enumerate() {
                            acc += k * f32::from(src[base + t]);
                        }
                        *d = acc.round() as i16;
                        phase += den;
                        while phase >= num {
                            phase -= num;
                            s += 1;
                        }
                    }
                }
                LineType::Float32 => {
                    let src = self.in_line.extended_f32_mut().unwrap();
                    let src: &[f32] = src;
                    let dst = out.buf_f32_mut().unwrap();
                    for d in dst.iter_mut().take(self.out_width) {
                        let taps = bank.kernel(phase_index(phase, num));
                        let base = window_base(s, bank.kernel_length);
                        let mut acc = 0f32;
                        for (t, &k) in taps.iter().enumerate() {
                            acc += k * src[base + t];
                        }
                        *d = acc;
                        phase += den;
                        while phase >= num {
                            phase -= num;
                            s += 1;
                        }
                    }
                }
                LineType::Int32 { .. } => {
                    unreachable!("the int32 pass-through never resamples");
                }
            }
        }
        self.vertical_push(out);
        Ok(())
    }

    /// Admits a horizontally finished line to the vertical window and produces every
    /// output row the window now supports.
    fn vertical_push(&mut self, line: SampleLine) {
        if self.v_kernels.is_none() {
            if self.produced < self.out_height {
                self.produced += 1;
                self.ready.push_back(line);
            }
            return;
        }
        let support = if self.v_kernels.as_ref().unwrap().kernel_length == 2 { 0 } else { 2 };
        if !self.v_primed {
            // Replicate the first line to cover the filter support above the image.
            for _ in 0..support {
                let mut copy = self.take_line();
                copy.copy_from(&line);
                self.vwin.push_back(copy);
            }
            self.v_primed = true;
        }
        let mut keep = self.take_line();
        keep.copy_from(&line);
        self.last_hline = Some(line);
        self.vwin.push_back(keep);
        self.produce_vertical_outputs();
    }

    fn produce_vertical_outputs(&mut self) {
        let bank_len = self.v_kernels.as_ref().unwrap().kernel_length;
        let num = self.sampling_num.y;
        let den = self.sampling_den.y;
        loop {
            // Roll the window past any source rows the phase has already consumed
            // before evaluating another output.
            while self.v_phase >= num {
                let Some(line) = self.vwin.pop_front() else { return };
                self.recycle(line);
                self.v_phase -= num;
            }
            if self.produced >= self.out_height || self.vwin.len() < bank_len {
                return;
            }
            let mut out = self.take_line();
            {
                let bank = self.v_kernels.as_ref().unwrap();
                let taps = bank.kernel(phase_index(self.v_phase, num));
                match self.line_type {
                    LineType::Fix16 { .. } => {
                        let dst = out.buf16_mut().unwrap();
                        for (i, d) in dst.iter_mut().enumerate().take(self.out_width) {
                            let mut acc = 0f32;
                            for (t, &k) in taps.iter().enumerate() {
                                acc += k * f32::from(self.vwin[t].buf16().unwrap()[i]);
                            }
                            *d = acc.round() as i16;
                        }
                    }
                    LineType::Float32 => {
                        let dst = out.buf_f32_mut().unwrap();
                        for (i, d) in dst.iter_mut().enumerate().take(self.out_width) {
                            let mut acc = 0f32;
                            for (t, &k) in taps.iter().enumerate() {
                                acc += k * self.vwin[t].buf_f32().unwrap()[i];
                            }
                            *d = acc;
                        }
                    }
                    LineType::Int32 { .. } => {
                        unreachable!("the int32 pass-through never resamples");
                    }
                }
            }
            self.produced += 1;
            self.ready.push_back(out);
            self.v_phase += den;
        }
    }

    /// Replicates the final line until every expected output row has been produced.
    fn drain_vertical(&mut self) {
        if self.v_kernels.is_none() {
            return;
        }
        while self.produced < self.out_height {
            if self.last_hline.is_none() {
                return;
            }
            let mut copy = self.take_line();
            copy.copy_from(self.last_hline.as_ref().unwrap());
            self.vwin.push_back(copy);
            self.produce_vertical_outputs();
        }
    }

    /// Applies the channel's white stretch to a pulled output line.
    pub fn stretch_line(&self, line: &mut SampleLine) {
        if self.white_residual != 0 {
            if let Some(buf) = line.buf16_mut() {
                apply_white_stretch(buf, self.white_residual);
            }
        }
    }
}

/// Kernel index (0..=32) for an accumulator `phase` out of `num`.
#[inline]
fn phase_index(phase: i32, num: i32) -> usize {
    (((phase * 64) / num + 1) >> 1) as usize
}

/// First extended-buffer index touched by a kernel anchored at source sample `s`.
#[inline]
fn window_base(s: usize, kernel_length: usize) -> usize {
    if kernel_length == 2 {
        s + SINC_SUPPORT_LEFT
    }
    else {
        s // s - 2 in line coordinates, shifted by the left extension
    }
}

/// Copies the first `n` samples of the staging line into an output line.
fn copy_from_staging(staging: &SampleLine, out: &mut SampleLine, n: usize) {
    match staging.line_type() {
        LineType::Fix16 { .. } => {
            let src = staging.buf16().unwrap();
            out.buf16_mut().unwrap()[..n].copy_from_slice(&src[..n]);
        }
        LineType::Int32 { .. } => {
            let src = staging.buf32().unwrap();
            out.buf32_mut().unwrap()[..n].copy_from_slice(&src[..n]);
        }
        LineType::Float32 => {
            let src = staging.buf_f32().unwrap();
            out.buf_f32_mut().unwrap()[..n].copy_from_slice(&src[..n]);
        }
    }
}

/// Rescales an absolute integer of `prec` bits to the fix16 binary point, rounding
/// half-up on downshifts.
#[inline]
fn rescale_int(v: i32, prec: u32) -> i32 {
    if prec <= FIX_POINT {
        v << (FIX_POINT - prec)
    }
    else {
        let downshift = prec - FIX_POINT;
        (v + (1 << (downshift - 1))) >> downshift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix16_frac(vals: &[i16]) -> SampleLine {
        let mut line = SampleLine::new(vals.len(), LineType::Fix16 { absolute: false });
        line.buf16_mut().unwrap().copy_from_slice(vals);
        line
    }

    fn basic_source() -> SourceInfo {
        SourceInfo { line_type: LineType::Fix16 { absolute: false }, precision: 8, signed: false }
    }

    #[test]
    fn verify_unit_sampling_bypass() {
        let mut ch = ChannelPipeline::new(
            ChannelParams::default(),
            basic_source(),
            4,
            2,
            4,
            2,
            Alignment::default(),
            0.4,
            2.0,
        )
        .unwrap();
        assert!(ch.h_kernels.is_none() && ch.v_kernels.is_none());
        ch.push_source_line(&fix16_frac(&[10, 20, 30, 40])).unwrap();
        let out = ch.pull_output().unwrap();
        assert_eq!(out.buf16().unwrap(), &[10, 20, 30, 40]);
    }

    #[test]
    fn verify_2x_upsampling_of_constant() {
        // A 1x1 input expanded 2:1 on both axes: the 2-tap kernels are selected and a
        // constant input stays constant.
        let params = ChannelParams {
            sampling_num: Coords::new(2, 2),
            sampling_den: Coords::new(1, 1),
            ..ChannelParams::default()
        };
        let mut ch =
            ChannelPipeline::new(params, basic_source(), 2, 2, 1, 1, Alignment::default(), 0.4, 2.0)
                .unwrap();
        assert_eq!(ch.h_kernels.as_ref().unwrap().kernel_length, 2);
        ch.push_source_line(&fix16_frac(&[1000])).unwrap();
        for _ in 0..2 {
            let out = ch.pull_output().expect("output row");
            assert_eq!(out.buf16().unwrap(), &[1000, 1000]);
            ch.recycle(out);
        }
        assert!(ch.pull_output().is_none());
    }

    #[test]
    fn verify_palette_mapping() {
        let lut = vec![0i16, 4096, 8192, 12288, 16384, 20480, 24576, 28672];
        let params = ChannelParams {
            palette: Some(Palette { bits: 3, fix16_lut: Some(lut), float_lut: None }),
            ..ChannelParams::default()
        };
        let src = SourceInfo {
            line_type: LineType::Fix16 { absolute: true },
            precision: 8,
            signed: false,
        };
        let mut ch = ChannelPipeline::new(params, src, 5, 1, 5, 1, Alignment::default(), 0.4, 2.0)
            .unwrap();
        let mut line = SampleLine::new(5, LineType::Fix16 { absolute: true });
        line.buf16_mut().unwrap().copy_from_slice(&[0, 3, 7, 4, 0]);
        ch.push_source_line(&line).unwrap();
        let out = ch.pull_output().unwrap();
        assert_eq!(out.buf16().unwrap(), &[0, 12288, 28672, 16384, 0]);
    }

    #[test]
    fn verify_palette_index_clip() {
        let lut = vec![0i16, 100, 200, 300];
        let params = ChannelParams {
            palette: Some(Palette { bits: 2, fix16_lut: Some(lut), float_lut: None }),
            ..ChannelParams::default()
        };
        let src = SourceInfo {
            line_type: LineType::Fix16 { absolute: true },
            precision: 8,
            signed: false,
        };
        let mut ch = ChannelPipeline::new(params, src, 2, 1, 2, 1, Alignment::default(), 0.4, 2.0)
            .unwrap();
        let mut line = SampleLine::new(2, LineType::Fix16 { absolute: true });
        line.buf16_mut().unwrap().copy_from_slice(&[9, -3]);
        ch.push_source_line(&line).unwrap();
        let out = ch.pull_output().unwrap();
        // Out-of-range indices clip to the ends of the table rather than failing.
        assert_eq!(out.buf16().unwrap(), &[300, 0]);
    }

    #[test]
    fn verify_palette_format_mismatch() {
        let params = ChannelParams {
            palette: Some(Palette { bits: 2, fix16_lut: Some(vec![0; 4]), float_lut: None }),
            float_exp_bits: 5,
            ..ChannelParams::default()
        };
        let src = SourceInfo {
            line_type: LineType::Int32 { absolute: true },
            precision: 16,
            signed: false,
        };
        let err = ChannelPipeline::new(params, src, 2, 1, 2, 1, Alignment::default(), 0.4, 2.0)
            .unwrap_err();
        assert!(matches!(err, TessellaError::PaletteFormatMismatch));
    }

    #[test]
    fn verify_white_stretch_values() {
        // Stretching a 7-bit source onto an 8-bit range.
        let residual = white_stretch_residual(7, 8);
        assert_eq!(residual, 258);
        let mut samples = [4096i16, -4096, 4032];
        apply_white_stretch(&mut samples, residual);
        // v' = v + (v * r + 2^15 + (r << 12)) >> 16, pinned for these inputs.
        assert_eq!(samples[0], 4128);
        assert_eq!(samples[1], -4096);
        assert_eq!(samples[2], 4064);

        // No stretch when the source already fills the output range.
        assert_eq!(white_stretch_residual(8, 8), 0);
    }

    #[test]
    fn verify_boxcar_reduction() {
        // 2x2 boxcar over a 4x2 source produces a 2x1 output of cell averages.
        let params = ChannelParams {
            boxcar_size: Coords::new(2, 2),
            ..ChannelParams::default()
        };
        let mut ch =
            ChannelPipeline::new(params, basic_source(), 2, 1, 4, 2, Alignment::default(), 0.4, 2.0)
                .unwrap();
        ch.push_source_line(&fix16_frac(&[800, 1600, 3200, 6400])).unwrap();
        ch.push_source_line(&fix16_frac(&[800, 1600, 3200, 6400])).unwrap();
        let out = ch.pull_output().unwrap();
        assert_eq!(out.buf16().unwrap(), &[1200, 4800]);
    }

    #[test]
    fn verify_boxcar_area_rejected() {
        let params = ChannelParams {
            boxcar_size: Coords::new(4096, 2048),
            ..ChannelParams::default()
        };
        let err = ChannelPipeline::new(
            params,
            basic_source(),
            2,
            1,
            8192,
            4096,
            Alignment::default(),
            0.4,
            2.0,
        )
        .unwrap_err();
        assert!(matches!(err, TessellaError::InvalidExpansion(_)));
    }
}
