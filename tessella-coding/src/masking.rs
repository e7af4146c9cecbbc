// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `masking` module generates visual masking weights for the encoder.
//!
//! Subband activity is accumulated into overlapping 4x4 cells: each cell gathers the
//! square roots of sample magnitudes over an 8x8 neighbourhood (two rows and columns of
//! overlap on every side). The LL band is first passed through a small high-pass filter
//! so that flat regions do not register as activity. Completed cell rows land in the
//! per-stripe cell tables read by the encoding jobs, which turn activity `v` into the
//! weight `1 / (floor + scale * v^2)`.

use tessella_core::errors::Result;
use tessella_core::sample::{LineType, SampleLine};

use crate::encoder::{Encoder, EncoderOptions, RoiSource, StripeState, SubbandPush};
use crate::gateway::BlockCoder;
use crate::pool::WorkerPool;

use std::sync::Arc;

use tessella_core::codestream::{BlockSink, DependencyMonitor};

/// Accumulates cell activity for one subband.
///
/// Two accumulator rows are maintained because cells overlap vertically: every sample
/// line contributes to the cell row being finished and to the one after it.
struct MaskingState {
    cur_cell_height: i32,
    cur_cell_lines_pushed: i32,
    nxt_cell_lines_pushed: i32,
    subband_lines_left: i32,
    /// Accumulators with two samples of slack on each side for horizontal extension.
    cur_acc: Vec<f32>,
    nxt_acc: Vec<f32>,
    samples_across: usize,
    cells_across: usize,
    first_cell_width: i32,
    last_cell_width: i32,
    num_stripes: usize,
    nominal_stripe_cell_rows: i32,
    active_stripe: usize,
    active_stripe_cell_rows_left: i32,
    next_stripe_cell_rows: i32,
    /// Cell row within the active stripe's table receiving the next generated row.
    active_cell_row: usize,
}

impl MaskingState {
    fn new(
        first_block_width: i32,
        subband_cols: i32,
        subband_rows: i32,
        num_stripes: usize,
        first_block_height: i32,
        nominal_block_height: i32,
    ) -> Self {
        let cells_across =
            (((first_block_width + 3) >> 2) + ((subband_cols - first_block_width + 3) >> 2)) as usize;
        let nominal_stripe_cell_rows = (nominal_block_height + 3) >> 2;
        let next_rows = ((subband_rows - first_block_height + 3) >> 2).min(nominal_stripe_cell_rows);
        MaskingState {
            cur_cell_height: 4 - ((-first_block_height) & 3),
            cur_cell_lines_pushed: 0,
            nxt_cell_lines_pushed: 0,
            subband_lines_left: subband_rows,
            cur_acc: vec![0.0; subband_cols as usize + 4],
            nxt_acc: vec![0.0; subband_cols as usize + 4],
            samples_across: subband_cols as usize,
            cells_across,
            first_cell_width: 4 - ((-first_block_width) & 3),
            last_cell_width: 4 - ((-(subband_cols - first_block_width)) & 3),
            num_stripes,
            nominal_stripe_cell_rows,
            active_stripe: 0,
            active_stripe_cell_rows_left: (first_block_height + 3) >> 2,
            next_stripe_cell_rows: next_rows,
            active_cell_row: 0,
        }
    }

    fn reset_next_row_if_due(&mut self) {
        if self.cur_cell_lines_pushed == self.cur_cell_height {
            // Four lines from finishing the current cell row; the next row starts
            // accumulating now.
            for v in &mut self.nxt_acc[2..2 + self.samples_across] {
                *v = 0.0;
            }
            self.nxt_cell_lines_pushed = 0;
        }
    }

    fn finish_line(&mut self, stripes: &[StripeState]) {
        self.cur_cell_lines_pushed += 1;
        self.nxt_cell_lines_pushed += 1;
        if self.cur_cell_lines_pushed == self.cur_cell_height + 4 {
            self.generate_cells(stripes);
            std::mem::swap(&mut self.cur_acc, &mut self.nxt_acc);
            self.cur_cell_lines_pushed = self.nxt_cell_lines_pushed;
            self.nxt_cell_lines_pushed = 0;
            self.cur_cell_height = self.subband_lines_left.min(4);
        }
    }

    /// Accumulates one detail-band line: `sqrt(|x|)` per sample into both rows.
    fn process_line(&mut self, line: &SampleLine, stripes: &[StripeState]) {
        self.reset_next_row_if_due();
        let w = self.samples_across;
        if let Some(sp) = line.buf16() {
            for n in 0..w {
                let val = (sp[n].unsigned_abs() as f32).sqrt();
                self.cur_acc[2 + n] += val;
                self.nxt_acc[2 + n] += val;
            }
        }
        else if let Some(sp) = line.buf32() {
            for n in 0..w {
                let val = (sp[n].unsigned_abs() as f32).sqrt();
                self.cur_acc[2 + n] += val;
                self.nxt_acc[2 + n] += val;
            }
        }
        else {
            let sp = line.buf_f32().expect("float line");
            for n in 0..w {
                let val = sp[n].abs().sqrt();
                self.cur_acc[2 + n] += val;
                self.nxt_acc[2 + n] += val;
            }
        }
        self.finish_line(stripes);
    }

    /// Accumulates one LL-band line, applying the 5-tap high-pass filter first. The
    /// right neighbour of the last sample replicates that sample.
    fn process_line_ll(
        &mut self,
        prev: &SampleLine,
        line: &SampleLine,
        next: &SampleLine,
        stripes: &[StripeState],
    ) {
        self.reset_next_row_if_due();
        let w = self.samples_across;
        if let Some(sp) = line.buf16() {
            let pp = prev.buf16().expect("short line");
            let np = next.buf16().expect("short line");
            let mut left_val = i32::from(sp[0]);
            for n in 0..w {
                let right = i32::from(sp[(n + 1).min(w - 1)]);
                let mut v = left_val + right + i32::from(pp[n]) + i32::from(np[n]);
                left_val = i32::from(sp[n]);
                v = ((v + 2) >> 2) - left_val;
                let val = (v.unsigned_abs() as f32).sqrt();
                self.cur_acc[2 + n] += val;
                self.nxt_acc[2 + n] += val;
            }
        }
        else if let Some(sp) = line.buf32() {
            let pp = prev.buf32().expect("int32 line");
            let np = next.buf32().expect("int32 line");
            let mut left_val = sp[0];
            for n in 0..w {
                let right = sp[(n + 1).min(w - 1)];
                let mut v = left_val + right + pp[n] + np[n];
                left_val = sp[n];
                v = ((v + 2) >> 2) - left_val;
                let val = (v.unsigned_abs() as f32).sqrt();
                self.cur_acc[2 + n] += val;
                self.nxt_acc[2 + n] += val;
            }
        }
        else {
            let sp = line.buf_f32().expect("float line");
            let pp = prev.buf_f32().expect("float line");
            let np = next.buf_f32().expect("float line");
            let mut left_val = sp[0];
            for n in 0..w {
                let right = sp[(n + 1).min(w - 1)];
                let v = 0.25 * (left_val + right + pp[n] + np[n]) - sp[n];
                left_val = sp[n];
                let val = v.abs().sqrt();
                self.cur_acc[2 + n] += val;
                self.nxt_acc[2 + n] += val;
            }
        }
        self.finish_line(stripes);
    }

    /// Folds the completed accumulator row into one row of cells: horizontal sums over
    /// 8-wide neighbourhoods (reduced at the subband edges), normalized by cell area.
    /// The visibility threshold, squaring, and reciprocation are left to the encoding
    /// jobs.
    fn generate_cells(&mut self, stripes: &[StripeState]) {
        debug_assert_eq!(self.cur_cell_lines_pushed, self.cur_cell_height + 4);
        let w = self.samples_across;
        let acc = &mut self.cur_acc;
        acc[0] = acc[2];
        acc[1] = acc[2];
        acc[2 + w] = acc[1 + w];
        acc[3 + w] = acc[1 + w];

        let cells_mutex = stripes[self.active_stripe].cells.as_ref().expect("cell table");
        let mut cells = cells_mutex.lock().unwrap();
        let row_base = self.active_cell_row * self.cells_across;
        let dst = &mut cells[row_base..row_base + self.cells_across];

        let lines = self.cur_cell_lines_pushed as f32;
        let mut sp = 0usize;
        let span = (self.first_cell_width + 4) as usize;
        let sum: f32 = acc[sp..sp + span].iter().sum();
        dst[0] = sum / (span as f32 * lines);
        if self.cells_across > 1 {
            sp += span - 4;
            let factor = 1.0 / (lines * 8.0);
            for cell in dst[1..self.cells_across - 1].iter_mut() {
                let sum: f32 = acc[sp..sp + 8].iter().sum();
                *cell = sum * factor;
                sp += 4;
            }
            let span = (self.last_cell_width + 4) as usize;
            let sum: f32 = acc[sp..sp + span].iter().sum();
            dst[self.cells_across - 1] = sum / (span as f32 * lines);
        }
        drop(cells);

        debug_assert!(self.subband_lines_left >= self.cur_cell_height);
        self.subband_lines_left -= self.cur_cell_height;
        self.active_stripe_cell_rows_left -= 1;
        self.active_cell_row += 1;
        if self.active_stripe_cell_rows_left == 0 {
            // Move on to the next stripe's cell table.
            self.active_stripe_cell_rows_left = self.next_stripe_cell_rows;
            self.next_stripe_cell_rows =
                ((self.subband_lines_left + 3) >> 2).min(self.nominal_stripe_cell_rows);
            self.active_stripe = (self.active_stripe + 1) % self.num_stripes;
            self.active_cell_row = 0;
        }
    }
}

/// An encoder variant that derives visual masking weights from subband activity.
///
/// Lines are delayed by two lines (three for the LL band, whose high-pass filter needs
/// an extra neighbour) so that a stripe's cell weights are complete before its samples
/// become schedulable. The first and last lines are replicated to prime and drain the
/// delay queue.
pub struct MaskEncoder {
    base: Encoder,
    state: MaskingState,
    delay: Vec<SampleLine>,
    num_delay_lines: usize,
    ll_band: bool,
    lines_received: i32,
    subband_rows: i32,
    subband_cols: usize,
}

impl MaskEncoder {
    pub fn new(
        band: Arc<dyn BlockSink>,
        coder: Arc<dyn BlockCoder>,
        monitor: Arc<dyn DependencyMonitor>,
        pool: Option<Arc<WorkerPool>>,
        roi: Option<Box<dyn RoiSource>>,
        options: EncoderOptions,
    ) -> Result<MaskEncoder> {
        let spec = band.spec().clone();
        debug_assert!(spec.has_masking());
        let ll_band = spec.band_idx == 0;
        let base = Encoder::new(band, coder, monitor, pool, roi, options)?;
        let p = &base.shared().params;
        let state = MaskingState::new(
            spec.first_block_size.x,
            spec.dims.size.x,
            spec.dims.size.y,
            p.num_stripes.max(1),
            spec.first_block_size.y.min(spec.dims.size.y),
            spec.nominal_block_size.y,
        );
        let num_delay_lines = if ll_band { 3 } else { 2 };
        let line_type = p.line_type;
        let subband_cols = spec.dims.size.x as usize;
        let delay =
            (0..num_delay_lines).map(|_| SampleLine::new(subband_cols, line_type)).collect();
        Ok(MaskEncoder {
            base,
            state,
            delay,
            num_delay_lines,
            ll_band,
            lines_received: 0,
            subband_rows: spec.dims.size.y,
            subband_cols,
        })
    }

    fn rotate_in(&mut self, line: &mut SampleLine) {
        let mut head = self.delay.remove(0);
        if !head.raw_exchange(line, self.subband_cols) {
            head.copy_from(line);
        }
        self.delay.push(head);
    }

    fn drain(&mut self) -> Result<()> {
        // Replicate the last line until the delay queue is flushed.
        while self.lines_received < self.subband_rows + self.num_delay_lines as i32 {
            let stripes = &self.base.shared().stripes;
            if self.num_delay_lines == 2 {
                self.state.process_line(&self.delay[1], stripes);
            }
            else {
                self.state.process_line_ll(&self.delay[1], &self.delay[2], &self.delay[2], stripes);
            }
            if self.lines_received >= self.num_delay_lines as i32 {
                // The subband may have fewer lines than the delay depth.
                let mut head = self.delay.remove(0);
                self.base.push(&mut head)?;
                head.copy_from(&self.delay[self.num_delay_lines - 2]);
                self.delay.push(head);
            }
            else {
                let mut head = self.delay.remove(0);
                head.copy_from(&self.delay[self.num_delay_lines - 2]);
                self.delay.push(head);
            }
            self.lines_received += 1;
        }
        Ok(())
    }
}

impl SubbandPush for MaskEncoder {
    fn start(&mut self) -> Result<()> {
        self.base.start()
    }

    fn push(&mut self, line: &mut SampleLine) -> Result<()> {
        if line.width() == 0 {
            return Ok(());
        }
        debug_assert!(self.lines_received < self.subband_rows);
        if self.lines_received == 0 {
            // Prime the delay queue with copies of the first line, accounting for the
            // two extrapolated lines above the subband.
            for d in 0..self.num_delay_lines {
                self.delay[d].copy_from(line);
            }
            let stripes = &self.base.shared().stripes;
            if self.num_delay_lines == 2 {
                self.state.process_line(&self.delay[0], stripes);
                self.state.process_line(&self.delay[1], stripes);
            }
            else {
                self.state.process_line_ll(&self.delay[0], &self.delay[1], &self.delay[2], stripes);
                self.state.process_line_ll(&self.delay[1], &self.delay[2], line, stripes);
            }
        }

        {
            let stripes = &self.base.shared().stripes;
            if self.num_delay_lines == 2 {
                self.state.process_line(line, stripes);
            }
            else {
                self.state.process_line_ll(&self.delay[1], &self.delay[2], line, stripes);
            }
        }

        if self.lines_received >= self.num_delay_lines as i32 {
            let mut head = self.delay.remove(0);
            self.base.push(&mut head)?;
            self.delay.insert(0, head);
        }
        self.rotate_in(line);

        self.lines_received += 1;
        if self.lines_received == self.subband_rows {
            self.drain()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.base.finish()
    }

    fn request_termination(&self) {
        self.base.request_termination();
    }
}

/// Creates the encoder appropriate for the subband: the masking variant when masking
/// parameters are present, the plain encoder otherwise.
pub fn make_encoder(
    band: Arc<dyn BlockSink>,
    coder: Arc<dyn BlockCoder>,
    monitor: Arc<dyn DependencyMonitor>,
    pool: Option<Arc<WorkerPool>>,
    roi: Option<Box<dyn RoiSource>>,
    options: EncoderOptions,
) -> Result<Box<dyn SubbandPush>> {
    if band.spec().has_masking() {
        Ok(Box::new(MaskEncoder::new(band, coder, monitor, pool, roi, options)?))
    }
    else {
        Ok(Box::new(Encoder::new(band, coder, monitor, pool, roi, options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tessella_core::block::CodeBlock;
    use tessella_core::codestream::{BlockNotifier, NullMonitor};
    use tessella_core::geometry::{Coords, Rect};
    use tessella_core::subband::{MaskingParams, SubbandSpec};

    struct MaskSink {
        spec: SubbandSpec,
        closed: Mutex<Vec<CodeBlock>>,
    }

    impl BlockSink for MaskSink {
        fn spec(&self) -> &SubbandSpec {
            &self.spec
        }

        fn open_block(&self, idx: Coords, _remaining: usize, _scan_start: bool) -> Result<CodeBlock> {
            let h = self.spec.block_row_height(idx.y);
            Ok(CodeBlock::new(idx, Coords::new(self.spec.dims.size.x, h)))
        }

        fn close_block(&self, block: CodeBlock) -> Result<()> {
            self.closed.lock().unwrap().push(block);
            Ok(())
        }

        fn attach_block_notifier(&self, _notifier: Arc<dyn BlockNotifier>) -> bool {
            false
        }

        fn detach_block_notifier(&self) -> bool {
            true
        }

        fn advance_block_rows_needed(&self, _rows: u32, _qbits: u32, _nblocks: u32) {}

        fn block_row_generated(&self, _height: i32, _is_final: bool) {}
    }

    struct WeightCapture {
        weights: Mutex<Vec<Vec<f32>>>,
    }

    impl BlockCoder for WeightCapture {
        fn encode(
            &self,
            _block: &mut CodeBlock,
            _reversible: bool,
            _msb_wmse: f64,
            _slope: u16,
        ) -> Result<()> {
            panic!("masking bands must use cellular_encode");
        }

        fn cellular_encode(
            &self,
            _block: &mut CodeBlock,
            _reversible: bool,
            _msb_wmse: f64,
            cell_weights: &[f32],
            _first_cell_cols: i32,
            _first_cell_rows: i32,
            _slope: u16,
        ) -> Result<()> {
            self.weights.lock().unwrap().push(cell_weights.to_vec());
            Ok(())
        }
    }

    fn masking_spec(cols: i32, rows: i32) -> SubbandSpec {
        SubbandSpec {
            k_max: 5,
            k_max_prime: 5,
            reversible: true,
            delta: 0.0,
            msb_wmse: 1.0,
            roi_weight: None,
            dims: Rect::new(Coords::new(0, 0), Coords::new(cols, rows)),
            nominal_block_size: Coords::new(cols.max(4), 4),
            first_block_size: Coords::new(cols.max(4), rows.min(4)),
            valid_blocks: Rect::new(Coords::new(0, 0), Coords::new(1, (rows + 3) / 4)),
            band_idx: 1,
            top_level: true,
            masking: Some(MaskingParams {
                visibility_floor: 0.01,
                masking_exponent: 0.5,
                visual_scale: 1.0,
            }),
        }
    }

    #[test]
    fn verify_single_line_subband_weights() {
        // A 1-line subband still produces well-defined cell weights: the line is
        // replicated on both sides of the cell row.
        let sink = Arc::new(MaskSink { spec: masking_spec(4, 1), closed: Mutex::new(Vec::new()) });
        let coder = Arc::new(WeightCapture { weights: Mutex::new(Vec::new()) });
        let mut enc = MaskEncoder::new(
            Arc::clone(&sink) as Arc<dyn BlockSink>,
            Arc::clone(&coder) as Arc<dyn BlockCoder>,
            Arc::new(NullMonitor),
            None,
            None,
            EncoderOptions::default(),
        )
        .unwrap();
        let mut line = SampleLine::new(4, LineType::Fix16 { absolute: true });
        line.buf16_mut().unwrap().copy_from_slice(&[4, 4, 4, 4]);
        enc.push(&mut line).unwrap();
        enc.finish().unwrap();

        let weights = coder.weights.lock().unwrap();
        assert_eq!(weights.len(), 1);
        assert_eq!(weights[0].len(), 1);
        // Every accumulated sample contributes sqrt(4) = 2 over 5 lines and an 8-wide
        // horizontally extended span: activity = 2, weight = 1 / (0.01 + 4).
        let expect = 1.0 / (0.01 + 4.0);
        assert!((weights[0][0] - expect).abs() < 1e-5, "weight {}", weights[0][0]);
    }

    #[test]
    fn verify_ll_band_high_pass() {
        // A constant LL band has no activity once the high-pass filter runs, so the
        // weight collapses to the reciprocal of the visibility floor.
        let mut spec = masking_spec(4, 4);
        spec.band_idx = 0;
        let sink = Arc::new(MaskSink { spec, closed: Mutex::new(Vec::new()) });
        let coder = Arc::new(WeightCapture { weights: Mutex::new(Vec::new()) });
        let mut enc = MaskEncoder::new(
            Arc::clone(&sink) as Arc<dyn BlockSink>,
            Arc::clone(&coder) as Arc<dyn BlockCoder>,
            Arc::new(NullMonitor),
            None,
            None,
            EncoderOptions::default(),
        )
        .unwrap();
        for _ in 0..4 {
            let mut line = SampleLine::new(4, LineType::Fix16 { absolute: true });
            line.buf16_mut().unwrap().copy_from_slice(&[9, 9, 9, 9]);
            enc.push(&mut line).unwrap();
        }
        enc.finish().unwrap();

        let weights = coder.weights.lock().unwrap();
        assert_eq!(weights.len(), 1);
        let expect = 1.0 / 0.01;
        assert!((weights[0][0] - expect).abs() < 1e-2, "weight {}", weights[0][0]);
        assert_eq!(sink.closed.lock().unwrap().len(), 1);
    }

    #[test]
    fn verify_detail_band_weights_4x4() {
        let sink = Arc::new(MaskSink { spec: masking_spec(4, 4), closed: Mutex::new(Vec::new()) });
        let coder = Arc::new(WeightCapture { weights: Mutex::new(Vec::new()) });
        let mut enc = MaskEncoder::new(
            Arc::clone(&sink) as Arc<dyn BlockSink>,
            Arc::clone(&coder) as Arc<dyn BlockCoder>,
            Arc::new(NullMonitor),
            None,
            None,
            EncoderOptions::default(),
        )
        .unwrap();
        for _ in 0..4 {
            let mut line = SampleLine::new(4, LineType::Fix16 { absolute: true });
            line.buf16_mut().unwrap().copy_from_slice(&[9, 9, 9, 9]);
            enc.push(&mut line).unwrap();
        }
        enc.finish().unwrap();

        let weights = coder.weights.lock().unwrap();
        assert_eq!(weights.len(), 1);
        // A constant 4x4 block: activity is sqrt(9) = 3, one cell.
        let expect = 1.0 / (0.01 + 9.0);
        assert!((weights[0][0] - expect).abs() < 1e-5, "weight {}", weights[0][0]);
        assert_eq!(sink.closed.lock().unwrap().len(), 1);
    }
}
