// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `encoder` module drives parallel block encoding for one subband.
//!
//! Subband lines are pushed into a ring of 1 to 4 stripe buffers, each holding one row
//! of code-blocks. Completed stripes release their encoding jobs in quanta; jobs
//! quantize and entropy-code groups of adjacent code-blocks on the worker pool, and all
//! synchronization between the push thread and the workers flows through the single
//! scheduling word of [`crate::sched`].

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;
use smallvec::SmallVec;

use tessella_core::codestream::{BlockNotifier, BlockSink, DependencyMonitor};
use tessella_core::errors::Result;
use tessella_core::geometry::Coords;
use tessella_core::sample::{LineType, SampleLine, FIX_POINT};
use tessella_core::util::bits::align_offset;

use crate::gateway::BlockCoder;
use crate::pool::{FailureLatch, WorkerPool};
use crate::quantizer::{BlockQuantizer, RoiWindow};
use crate::sched;
use crate::sched::{
    first_unscheduled_job, p_is_sentinel, StripeSync, MAX_REL_P, MAX_STRIPES, MS_UNSET,
    QUANTUM_BITS,
};

/// Supplies one line of ROI mask bytes per subband line; zero marks background.
pub trait RoiSource: Send {
    fn pull(&mut self, dst: &mut [u8]);
}

/// The push interface shared by the plain and masking encoders.
pub trait SubbandPush {
    /// Completes initialization; called implicitly by the first `push`.
    fn start(&mut self) -> Result<()>;

    /// Pushes the next subband line, blocking if every stripe is busy.
    fn push(&mut self, line: &mut SampleLine) -> Result<()>;

    /// Surfaces the first failure captured by any worker.
    fn finish(&mut self) -> Result<()>;

    /// Cooperative cancellation; `all_done` fires once in-flight jobs drain.
    fn request_termination(&self);
}

/// Construction options for an encoder.
#[derive(Copy, Clone, Debug)]
pub struct EncoderOptions {
    /// Process 16-bit sample lines rather than 32-bit ones.
    pub use_shorts: bool,
    /// Scale factor already applied to the data, folded into the step size.
    pub normalization: f32,
    /// The caller's lines will carry one extra sample of width for filter support.
    pub line_will_be_extended: bool,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        EncoderOptions { use_shorts: true, normalization: 1.0, line_will_be_extended: false }
    }
}

const LOG2_MIN_JOB_SAMPLES: u32 = 12;
const LOG2_IDEAL_JOB_SAMPLES: u32 = 14;

/// Immutable dimensioning and quantization parameters shared by push and workers.
pub(crate) struct EncoderParams {
    pub quantizer: BlockQuantizer,
    pub line_type: LineType,
    pub msb_wmse: f32,
    pub roi_weight: f32,
    pub subband_cols: i32,
    pub subband_rows: i32,
    pub first_block_height: i32,
    pub nominal_block_height: i32,
    pub block_rows: i32,
    pub num_stripes: usize,
    pub jobs_per_stripe: usize,
    pub jobs_per_quantum: usize,
    pub quanta_per_stripe: i32,
    pub log2_job_blocks: u32,
    pub lines_per_quantum: i32,
    pub quantum_offset: i32,
    pub stripe_heights: [i32; MAX_STRIPES],
    pub buffer_offset: usize,
    pub raw_line_width: i32,
    pub roi_row_gap: usize,
}

/// One encoding job: a group of horizontally adjacent code-blocks within a stripe.
pub(crate) struct JobDesc {
    /// Column of the group's first sample within the stripe lines.
    pub grp_offset: usize,
    pub grp_blocks: i32,
    pub first_block_x: i32,
    /// Block row processed by the next run of this job; advances by the stripe count.
    pub next_block_y: AtomicI32,
    /// First cell of the group within the stripe's cell-weight rows.
    pub cell_offset: usize,
}

/// Mutable per-stripe storage. The scheduling protocol guarantees each mutex is only
/// ever taken uncontended: the push thread owns a stripe while its status is unused,
/// the workers while it is schedulable.
pub(crate) struct StripeState {
    pub pending_jobs: AtomicI32,
    pub lines: Mutex<Vec<SampleLine>>,
    pub roi: Option<Mutex<Vec<u8>>>,
    pub cells: Option<Mutex<Vec<f32>>>,
}

/// Masking parameters shared with the jobs, present only for masking-weighted encoding.
pub(crate) struct MaskShared {
    pub mask_offset: f32,
    pub mask_scale: f32,
    pub cells_across: usize,
}

/// State shared between the push thread, the workers, and the codestream layer's
/// background notifications.
pub(crate) struct EncoderShared {
    pub band: Arc<dyn BlockSink>,
    pub coder: Arc<dyn BlockCoder>,
    pub monitor: Arc<dyn DependencyMonitor>,
    pub pool: Option<Arc<WorkerPool>>,
    pub sync: StripeSync,
    pub failure: FailureLatch,
    pub params: EncoderParams,
    pub stripes: Vec<StripeState>,
    pub jobs: Vec<Vec<JobDesc>>,
    pub mask: Option<MaskShared>,
}

/// Routes background resource notifications to the encoder without keeping it alive.
struct NotifierHandle(Weak<EncoderShared>);

impl BlockNotifier for NotifierHandle {
    fn update_dependencies(&self, p_delta: i32, closure: bool) -> bool {
        if let Some(shared) = self.0.upgrade() {
            EncoderShared::update_dependencies(&shared, p_delta, closure);
        }
        true
    }
}

impl EncoderShared {
    /// Executes one encoding job and performs the stripe-completion bookkeeping.
    fn run_job(shared: &Arc<EncoderShared>, stripe: usize, job_idx: usize) {
        if let Err(err) = shared.encode_job_blocks(stripe, job_idx) {
            shared.failure.record(err);
        }
        let old = shared.stripes[stripe].pending_jobs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0);
        if old == 1 {
            EncoderShared::stripe_encoded(shared, stripe);
        }
    }

    /// Quantizes and entropy-codes every code-block of the job's group.
    fn encode_job_blocks(&self, stripe: usize, job_idx: usize) -> Result<()> {
        let p = &self.params;
        let job = &self.jobs[stripe][job_idx];
        let block_y = job.next_block_y.fetch_add(p.num_stripes as i32, Ordering::AcqRel);
        let slope = self.band.conservative_slope_threshold();
        let state = &self.stripes[stripe];
        let lines = state.lines.lock().unwrap();
        let roi_guard = state.roi.as_ref().map(|m| m.lock().unwrap());
        let cells_guard = state.cells.as_ref().map(|m| m.lock().unwrap());

        let mut offset = job.grp_offset;
        let mut cell_offset = job.cell_offset;
        let mut idx = Coords::new(job.first_block_x, block_y);
        let mut blocks_remaining = job.grp_blocks;
        let mut scan_start = true;
        let mut cell_weights: Vec<f32> = Vec::new();
        while blocks_remaining > 0 {
            let mut block = self.band.open_block(idx, blocks_remaining as usize, scan_start)?;
            let mut xfer = block.size;
            if block.transpose {
                xfer.transpose();
            }

            let mut block_first_cell_rows = 0;
            let mut block_first_cell_cols = 0;
            let mut src_cells_across = 0usize;
            if let (Some(mask), Some(cells)) = (self.mask.as_ref(), cells_guard.as_deref()) {
                src_cells_across = ((xfer.x + 3) >> 2) as usize;
                let src_cells_down = ((xfer.y + 3) >> 2) as usize;
                cell_weights.clear();
                cell_weights.resize(src_cells_down * src_cells_across, 0.0);
                let mut cell_h_inc: isize;
                let mut cell_v_inc: isize;
                if !block.transpose {
                    cell_h_inc = 1;
                    cell_v_inc = src_cells_across as isize;
                    block_first_cell_rows = if block.vflip { 4 } else { 4 - ((-xfer.y) & 3) };
                    block_first_cell_cols = if block.hflip { 4 } else { 4 - ((-xfer.x) & 3) };
                }
                else {
                    cell_h_inc = src_cells_down as isize;
                    cell_v_inc = 1;
                    block_first_cell_cols = if block.vflip { 4 } else { 4 - ((-xfer.y) & 3) };
                    block_first_cell_rows = if block.hflip { 4 } else { 4 - ((-xfer.x) & 3) };
                }
                let mut dst_base: isize = 0;
                if block.vflip {
                    dst_base += cell_v_inc * (src_cells_down as isize - 1);
                    cell_v_inc = -cell_v_inc;
                }
                if block.hflip {
                    dst_base += cell_h_inc * (src_cells_across as isize - 1);
                    cell_h_inc = -cell_h_inc;
                }
                for i in 0..src_cells_down {
                    let src_row = &cells[cell_offset + i * mask.cells_across..];
                    for j in 0..src_cells_across {
                        let val = src_row[j];
                        let w = 1.0 / (mask.mask_offset + mask.mask_scale * val * val);
                        let dst =
                            dst_base + (i as isize) * cell_v_inc + (j as isize) * cell_h_inc;
                        cell_weights[dst as usize] = w;
                    }
                }
            }

            let block_stripes = (block.size.y + 3) >> 2;
            let num_samples = ((block_stripes << 2) * block.size.x) as usize;
            debug_assert!(num_samples > 0);
            block.set_max_samples(num_samples);

            let q = &p.quantizer;
            let mut or_val = q.transfer_block(&lines, offset, &mut block, xfer)?;
            q.apply_roi_shift_mask(&mut block)?;

            let mut have_background = false;
            let mut scale_wmse = false;
            if let Some(roi) = roi_guard.as_deref() {
                let window = RoiWindow {
                    mask: roi.as_slice(),
                    row_gap: p.roi_row_gap,
                    base_col: p.buffer_offset,
                };
                if q.k_max_prime > q.k_max {
                    let (adj_or, bg, _fg) =
                        q.apply_roi_background(&window, offset, &mut block, xfer, or_val);
                    or_val = adj_or;
                    have_background = bg;
                    scale_wmse = true; // Background is shifted down at least.
                }
                else {
                    // Treat the whole block as foreground if it intersects the ROI.
                    'scan: for m in 0..xfer.y as usize {
                        let row = &roi[m * p.roi_row_gap..];
                        for n in 0..xfer.x as usize {
                            if row[offset - p.buffer_offset + n] != 0 {
                                scale_wmse = true;
                                break 'scan;
                            }
                        }
                    }
                }
            }
            else {
                scale_wmse = true; // Everything belongs to the foreground.
            }

            q.finish_block(&mut block, or_val, have_background);
            let msb_wmse = if scale_wmse {
                f64::from(p.msb_wmse) * f64::from(p.roi_weight)
            }
            else {
                f64::from(p.msb_wmse)
            };
            if cells_guard.is_some() {
                self.coder.cellular_encode(
                    &mut block,
                    q.reversible,
                    msb_wmse,
                    &cell_weights,
                    block_first_cell_cols,
                    block_first_cell_rows,
                    slope,
                )?;
            }
            else {
                self.coder.encode(&mut block, q.reversible, msb_wmse, slope)?;
            }
            self.band.close_block(block)?;

            blocks_remaining -= 1;
            idx.x += 1;
            offset += xfer.x as usize;
            cell_offset += src_cells_across;
            scan_start = false;
        }
        Ok(())
    }

    /// Called when the last job of stripe `which` completes. Returns true if `all_done`
    /// was invoked (or arranged for).
    pub(crate) fn stripe_encoded(shared: &Arc<EncoderShared>, which: usize) -> bool {
        let p = &shared.params;
        let (old, new) = shared.sync.stripe_completed(which, p.num_stripes);
        if (old ^ new) & sched::S_MASK == 0 {
            // S has not changed and no R reference was taken. Out-of-order rows are
            // reported only once S advances.
            return false;
        }
        if old & sched::W_BIT != 0 {
            debug_assert_eq!(sched::s_field(old), 0);
            shared.sync.wake_push();
        }

        let old_s = sched::s_field(old) as i32;
        let new_s = sched::s_field(new) as i32;
        let min_s = sched::ms_field(new) as i32;
        let delta_s = new_s - old_s;
        debug_assert!(delta_s > 0);
        if old & sched::T_BIT == 0 {
            let subband_finished = min_s == 0 && (new & sched::U_MASK) == 0;
            let mut height = p.nominal_block_height;
            if p.nominal_block_height != p.first_block_height && shared.sync.first_block_row() {
                height = p.first_block_height;
            }
            let mut s = delta_s;
            while s > 0 {
                shared.band.block_row_generated(height, subband_finished && s == 1);
                height = p.nominal_block_height;
                s -= 1;
            }

            if old_s < min_s && new_s >= min_s {
                // Push can never block again, and this is the first time we know it.
                if old_s == 0 {
                    shared.monitor.propagate_dependencies(-1, -1);
                }
                else {
                    shared.monitor.propagate_dependencies(0, -1);
                }
            }
            else if old_s == 0 && min_s > 0 {
                debug_assert!(new_s < min_s);
                shared.monitor.propagate_dependencies(-1, 0);
            }
        }

        match shared.sync.release_reference() {
            sched::Release::Done => false,
            sched::Release::AllDone => {
                if p_is_sentinel(shared.sync.load()) || shared.band.detach_block_notifier() {
                    shared.monitor.all_done();
                }
                // Otherwise a final closure notification will deliver `all_done`.
                true
            }
        }
    }

    /// Accumulates a resource-availability notification and schedules any jobs it
    /// unblocks. See [`tessella_core::codestream::BlockNotifier`].
    pub(crate) fn update_dependencies(shared: &Arc<EncoderShared>, p_delta: i32, closure: bool) {
        if p_delta == 0 {
            if closure {
                // Completion of a deferred notifier detachment.
                debug_assert_ne!(shared.sync.load() & sched::T_BIT, 0);
                debug_assert_eq!(shared.sync.load() & sched::U_MASK, 0);
                shared.monitor.all_done();
            }
            return;
        }
        debug_assert!(p_delta > 0);
        if let Some((old, new)) = shared.sync.add_p_delta(p_delta as u32, closure) {
            EncoderShared::schedule_new_jobs(shared, old, new);
        }
    }

    /// Submits every job that is schedulable under `new` but was not under `old`.
    pub(crate) fn schedule_new_jobs(shared: &Arc<EncoderShared>, old: u32, new: u32) {
        let p = &shared.params;
        let Some(pool) = shared.pool.as_ref() else { return };
        let mut batch: SmallVec<[(usize, usize); 16]> = SmallVec::new();
        let mut s = sched::a_field(new) as usize;
        for _ in 0..p.num_stripes {
            let status = sched::status_field(new, s);
            if status == 0 {
                break; // No more active stripes
            }
            if status >= 2 {
                let j_lim = first_unscheduled_job(
                    new, s, p.num_stripes, p.jobs_per_stripe, p.jobs_per_quantum,
                );
                let j_start = first_unscheduled_job(
                    old, s, p.num_stripes, p.jobs_per_stripe, p.jobs_per_quantum,
                );
                for j in j_start..j_lim {
                    batch.push((s, j));
                }
            }
            s += 1;
            if s == p.num_stripes {
                s = 0;
            }
        }
        for (stripe, job) in batch {
            let worker_shared = Arc::clone(shared);
            pool.submit(Box::new(move || EncoderShared::run_job(&worker_shared, stripe, job)));
        }
    }

    /// Ensures no further jobs are scheduled and that `all_done` fires as soon as all
    /// in-flight jobs complete, immediately if there are none.
    pub(crate) fn request_termination(shared: &Arc<EncoderShared>) {
        let p = &shared.params;
        let (old_sched, new_sched) = shared.sync.mark_termination();

        // Pretend any jobs that never got scheduled have already completed, so the
        // pending counters reconcile and the last in-flight job triggers `all_done`.
        for n in 0..p.num_stripes {
            let old_status = sched::status_field(old_sched, n);
            if old_status < 2 {
                continue;
            }
            debug_assert_eq!(sched::status_field(new_sched, n), 3);
            let first = first_unscheduled_job(
                old_sched, n, p.num_stripes, p.jobs_per_stripe, p.jobs_per_quantum,
            );
            let lim = first_unscheduled_job(
                new_sched, n, p.num_stripes, p.jobs_per_stripe, p.jobs_per_quantum,
            );
            let extra = lim as i32 - first as i32;
            if extra > 0 {
                let old_jobs = shared.stripes[n].pending_jobs.fetch_sub(extra, Ordering::AcqRel);
                debug_assert!(old_jobs >= extra);
                if old_jobs == extra && EncoderShared::stripe_encoded(shared, n) {
                    return; // `all_done` called or arranged for.
                }
            }
        }

        let sched_now = shared.sync.load();
        if sched_now & sched::INFLIGHT_MASK == 0 {
            if p_is_sentinel(sched_now) || shared.band.detach_block_notifier() {
                shared.monitor.all_done();
            }
        }
    }
}

/// Tracking owned exclusively by the push thread.
struct PushState {
    active_push_stripe: usize,
    active_push_line: usize,
    active_lines_left: i32,
    next_stripe_height: i32,
    subband_lines_left: i32,
    active_sched_stripe: usize,
    partial_quanta_remaining: i32,
    num_stripes_released: i32,
    last_stripes_requested: i32,
}

impl PushState {
    fn new(first_stripe_height: i32, subband_rows: i32) -> Self {
        PushState {
            active_push_stripe: 0,
            active_push_line: 0,
            active_lines_left: 0,
            next_stripe_height: first_stripe_height,
            subband_lines_left: subband_rows,
            active_sched_stripe: 0,
            partial_quanta_remaining: 0,
            num_stripes_released: 0,
            last_stripes_requested: 0,
        }
    }
}

/// The subband block encoder.
pub struct Encoder {
    shared: Arc<EncoderShared>,
    push_state: PushState,
    roi: Option<Box<dyn RoiSource>>,
    initialized: bool,
    inert: bool,
}

impl Encoder {
    pub fn new(
        band: Arc<dyn BlockSink>,
        coder: Arc<dyn BlockCoder>,
        monitor: Arc<dyn DependencyMonitor>,
        pool: Option<Arc<WorkerPool>>,
        mut roi: Option<Box<dyn RoiSource>>,
        options: EncoderOptions,
    ) -> Result<Encoder> {
        let spec = band.spec().clone();
        let subband_cols = spec.dims.size.x;
        let subband_rows = spec.dims.size.y;
        let quantizer = BlockQuantizer {
            k_max: spec.k_max,
            k_max_prime: spec.k_max_prime,
            reversible: spec.reversible,
            delta: spec.delta * options.normalization,
        };
        let line_type = match (options.use_shorts, spec.reversible) {
            (true, rev) => LineType::Fix16 { absolute: rev },
            (false, true) => LineType::Int32 { absolute: true },
            (false, false) => LineType::Float32,
        };
        if subband_cols <= 0 || subband_rows <= 0 {
            let params = EncoderParams {
                quantizer,
                line_type,
                msb_wmse: spec.msb_wmse,
                roi_weight: 1.0,
                subband_cols: 0,
                subband_rows: 0,
                first_block_height: 0,
                nominal_block_height: 0,
                block_rows: 0,
                num_stripes: 0,
                jobs_per_stripe: 0,
                jobs_per_quantum: 1,
                quanta_per_stripe: 1,
                log2_job_blocks: 0,
                lines_per_quantum: 0,
                quantum_offset: 1,
                stripe_heights: [0; MAX_STRIPES],
                buffer_offset: 0,
                raw_line_width: 0,
                roi_row_gap: 0,
            };
            let shared = Arc::new(EncoderShared {
                band,
                coder,
                monitor,
                pool,
                sync: StripeSync::new(),
                failure: FailureLatch::new(),
                params,
                stripes: Vec::new(),
                jobs: Vec::new(),
                mask: None,
            });
            return Ok(Encoder {
                shared,
                push_state: PushState::new(0, 0),
                roi: None,
                initialized: true,
                inert: true,
            });
        }

        let num_threads = pool.as_ref().map(|p| p.num_threads()).unwrap_or(1);
        let multi_threaded = pool.is_some();

        // Partition each stripe into jobs and quanta. A job grows to a minimum sample
        // count, then toward an ideal size unless that starves the thread count.
        let blocks_across = spec.valid_blocks.size.x;
        let mut log2_job_blocks = 0u32;
        let mut blocks_per_job = 1i64;
        let mut job_width = i64::from(spec.nominal_block_size.x);
        let mut job_samples = job_width
            * if spec.first_block_size.y == subband_rows {
                i64::from(spec.first_block_size.y)
            }
            else {
                i64::from(spec.nominal_block_size.y)
            };
        let min_jobs_across = num_threads as i64;
        while blocks_per_job < i64::from(blocks_across)
            && (job_width < 64 || (job_samples + (job_samples >> 1)) < (1 << LOG2_MIN_JOB_SAMPLES))
        {
            job_samples *= 2;
            job_width *= 2;
            blocks_per_job *= 2;
            log2_job_blocks += 1;
        }
        while blocks_per_job < i64::from(blocks_across)
            && (job_samples + (job_samples >> 1)) < (1 << LOG2_IDEAL_JOB_SAMPLES)
        {
            if (job_samples + (job_samples >> 1)) * min_jobs_across > i64::from(blocks_across) {
                break;
            }
            job_samples *= 2;
            job_width *= 2;
            blocks_per_job *= 2;
            log2_job_blocks += 1;
        }
        if blocks_per_job >= (i64::from(blocks_across) - (blocks_per_job >> 1)) {
            // Avoid two highly unequal trailing jobs.
            blocks_per_job *= 2;
            log2_job_blocks += 1;
        }
        let jobs_per_stripe = (1 + ((blocks_across - 1) >> log2_job_blocks)) as usize;
        let jobs_per_quantum = 1 + ((jobs_per_stripe - 1) >> QUANTUM_BITS);
        let quanta_per_stripe = (1 + (jobs_per_stripe - 1) / jobs_per_quantum) as i32;
        debug_assert!(quanta_per_stripe <= (1 << QUANTUM_BITS));

        // Stripe count policy: double buffering by default, deeper rings for lower
        // resolutions when many threads could otherwise starve.
        let mut num_stripes = 1usize;
        let mut lines_per_quantum = 0i32;
        if multi_threaded {
            let is_top = spec.top_level;
            let ideal_stripes = if is_top {
                if (jobs_per_stripe as i64) < min_jobs_across && num_threads > 8 {
                    3
                }
                else {
                    2
                }
            }
            else if num_threads > 8 && 2 * (jobs_per_stripe as i64) < min_jobs_across {
                4
            }
            else if num_threads > 4 {
                3
            }
            else {
                2
            };
            let mut cum_height = spec.first_block_size.y;
            while num_stripes < ideal_stripes && cum_height < subband_rows {
                num_stripes += 1;
                cum_height += spec.nominal_block_size.y;
            }
            debug_assert!(num_stripes as i32 <= spec.valid_blocks.size.y);
            if quanta_per_stripe > 1 && num_stripes > 2 && !is_top {
                lines_per_quantum = 1 + (spec.nominal_block_size.y - 1) / quanta_per_stripe;
            }
        }

        // Stripe heights; the last stripe may need less storage. Whole 4-line block
        // stripes simplify stripe-oriented scans in the block coder.
        let full_block_stripes = subband_rows >= 4;
        let mut stripe_heights = [0i32; MAX_STRIPES];
        for (s, height) in stripe_heights.iter_mut().enumerate().take(num_stripes) {
            let mut max_height = spec.nominal_block_size.y;
            if s == num_stripes - 1 {
                let mut left = subband_rows;
                if s > 0 {
                    left -= spec.first_block_size.y + (s as i32 - 1) * spec.nominal_block_size.y;
                }
                max_height = left.min(spec.nominal_block_size.y);
            }
            if full_block_stripes {
                max_height = (max_height + 3) & !3;
            }
            *height = max_height;
        }

        let alignment: u32 = if options.use_shorts { 16 } else { 8 };
        let buffer_offset = if blocks_across > 1 {
            align_offset(spec.first_block_size.x as u32, alignment) as usize
        }
        else {
            0
        };
        let mut raw_line_width = subband_cols;
        if buffer_offset == 0 && options.line_will_be_extended {
            raw_line_width += 1;
        }

        // ROI buffers are only needed when the mask can change the coded output.
        let have_roi_weight = spec.roi_weight.is_some();
        if roi.is_some() && spec.k_max_prime == spec.k_max && !have_roi_weight {
            roi = None;
        }
        let roi_row_gap = ((subband_cols as usize) + 15) & !15;

        let masking = spec.has_masking();
        let cells_across = if masking {
            let first = spec.first_block_size.x;
            (((first + 3) >> 2) + ((subband_cols - first + 3) >> 2)) as usize
        }
        else {
            0
        };
        let nominal_stripe_cell_rows = ((spec.nominal_block_size.y + 3) >> 2) as usize;

        let mut stripes = Vec::with_capacity(num_stripes);
        for &height in stripe_heights.iter().take(num_stripes) {
            let mut lines = Vec::with_capacity(height as usize);
            for _ in 0..height {
                lines.push(SampleLine::new(buffer_offset + raw_line_width as usize, line_type));
            }
            let roi_buf = if roi.is_some() {
                Some(Mutex::new(vec![0u8; roi_row_gap * height as usize]))
            }
            else {
                None
            };
            let cells = if masking {
                Some(Mutex::new(vec![0f32; cells_across * nominal_stripe_cell_rows]))
            }
            else {
                None
            };
            stripes.push(StripeState {
                pending_jobs: AtomicI32::new(0),
                lines: Mutex::new(lines),
                roi: roi_buf,
                cells,
            });
        }

        // Lay out the job table. Jobs cover `2^log2_job_blocks` adjacent blocks; the
        // first job absorbs the first block's reduced width.
        let mut jobs = Vec::with_capacity(num_stripes);
        for s in 0..num_stripes {
            let mut stripe_jobs = Vec::with_capacity(jobs_per_stripe);
            let mut remaining_cols = subband_cols;
            let mut remaining_blocks = blocks_across;
            let mut grp_offset = buffer_offset;
            let mut cell_offset = 0usize;
            let mut first_block_x = spec.valid_blocks.pos.x;
            for j in 0..jobs_per_stripe {
                let mut width = spec.nominal_block_size.x << log2_job_blocks;
                let mut blocks = 1i32 << log2_job_blocks;
                if j == 0 {
                    width += spec.first_block_size.x - spec.nominal_block_size.x;
                }
                width = width.min(remaining_cols);
                blocks = blocks.min(remaining_blocks);
                debug_assert!(width > 0 && blocks > 0);
                stripe_jobs.push(JobDesc {
                    grp_offset,
                    grp_blocks: blocks,
                    first_block_x,
                    next_block_y: AtomicI32::new(spec.valid_blocks.pos.y + s as i32),
                    cell_offset,
                });
                remaining_cols -= width;
                remaining_blocks -= blocks;
                first_block_x += blocks;
                grp_offset += width as usize;
                cell_offset += ((width + 3) >> 2) as usize;
            }
            jobs.push(stripe_jobs);
        }

        let mask = if masking {
            let mp = spec.masking.unwrap();
            let mut mask_scale = mp.visual_scale;
            if !spec.reversible {
                mask_scale /= options.normalization;
                if options.use_shorts {
                    mask_scale /= (1u32 << FIX_POINT) as f32;
                }
            }
            Some(MaskShared { mask_offset: mp.visibility_floor, mask_scale, cells_across })
        }
        else {
            None
        };

        let params = EncoderParams {
            quantizer,
            line_type,
            msb_wmse: spec.msb_wmse,
            roi_weight: spec.roi_weight.unwrap_or(1.0),
            subband_cols,
            subband_rows,
            first_block_height: spec.first_block_size.y,
            nominal_block_height: spec.nominal_block_size.y,
            block_rows: spec.valid_blocks.size.y,
            num_stripes,
            jobs_per_stripe,
            jobs_per_quantum,
            quanta_per_stripe,
            log2_job_blocks,
            lines_per_quantum,
            quantum_offset: 1,
            stripe_heights,
            buffer_offset,
            raw_line_width,
            roi_row_gap,
        };
        debug!(
            "encoder: {}x{} subband, {} stripes, {} jobs/stripe, {} jobs/quantum",
            subband_cols, subband_rows, num_stripes, jobs_per_stripe, jobs_per_quantum
        );

        let first_stripe_height = params.first_block_height.min(subband_rows);
        let shared = Arc::new(EncoderShared {
            band,
            coder,
            monitor,
            pool,
            sync: StripeSync::new(),
            failure: FailureLatch::new(),
            params,
            stripes,
            jobs,
            mask,
        });

        if multi_threaded {
            shared.band.attach_block_notifier(Arc::new(NotifierHandle(Arc::downgrade(&shared))));
            if (num_stripes as i32) < shared.params.block_rows {
                shared.monitor.propagate_dependencies(0, 1);
            }
        }

        Ok(Encoder {
            shared,
            push_state: PushState::new(first_stripe_height, subband_rows),
            roi,
            initialized: false,
            inert: false,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<EncoderShared> {
        &self.shared
    }

    fn multi_threaded(&self) -> bool {
        self.shared.pool.is_some()
    }

    /// Copies (or exchanges) the caller's line into the active stripe.
    fn store_line(&mut self, line: &mut SampleLine) {
        let p = &self.shared.params;
        let stripe = &self.shared.stripes[self.push_state.active_push_stripe];
        let mut lines = stripe.lines.lock().unwrap();
        let dst = &mut lines[self.push_state.active_push_line];
        if p.buffer_offset == 0 && line.raw_exchange(dst, p.subband_cols as usize) {
            return;
        }
        let n = p.subband_cols as usize;
        let at = p.buffer_offset;
        match p.line_type {
            LineType::Fix16 { .. } => {
                let src = line.buf16().expect("short line");
                dst.buf16_mut().unwrap()[at..at + n].copy_from_slice(&src[..n]);
            }
            LineType::Int32 { .. } => {
                let src = line.buf32().expect("int32 line");
                dst.buf32_mut().unwrap()[at..at + n].copy_from_slice(&src[..n]);
            }
            LineType::Float32 => {
                let src = line.buf_f32().expect("float line");
                dst.buf_f32_mut().unwrap()[at..at + n].copy_from_slice(&src[..n]);
            }
        }
    }
}

impl SubbandPush for Encoder {
    fn start(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        let p = &self.shared.params;
        if self.multi_threaded() {
            let s_val = p.num_stripes as u32;
            let min_s =
                if s_val as i32 >= p.block_rows { p.block_rows as u32 } else { MS_UNSET };
            self.shared.sync.init_word(s_val, min_s);

            // Request availability for all the block rows we could possibly touch up
            // front; block encoding cannot start until analysis catches up anyway.
            let max_rp = (p.num_stripes as i32).min(MAX_REL_P);
            self.push_state.last_stripes_requested = max_rp;
            self.shared.band.advance_block_rows_needed(
                max_rp as u32,
                QUANTUM_BITS,
                (p.jobs_per_quantum << p.log2_job_blocks) as u32,
            );
        }
        Ok(())
    }

    fn push(&mut self, line: &mut SampleLine) -> Result<()> {
        if line.width() == 0 || self.inert {
            return Ok(());
        }
        if !self.initialized {
            self.start()?;
        }
        let multi_threaded = self.multi_threaded();
        debug_assert!(
            !multi_threaded || self.shared.sync.load() & sched::T_BIT == 0,
            "push after request_termination"
        );
        if self.push_state.active_lines_left == 0 {
            debug_assert!(self.push_state.subband_lines_left > 0);
            // Obtain a new empty stripe, blocking while none is available.
            if multi_threaded {
                let sched = self.shared.sync.wait_for_stripe();
                let sched_s = sched::s_field(sched) as i32;
                let p = &self.shared.params;
                // Advance the background block-row request, never by more than one
                // stripe at a time and never so far that the P field could overflow.
                if self.push_state.last_stripes_requested < p.block_rows {
                    let test_max_rp = self.push_state.last_stripes_requested + 1;
                    if (test_max_rp - self.push_state.num_stripes_released
                        + p.num_stripes as i32
                        - sched_s)
                        <= MAX_REL_P
                    {
                        self.push_state.last_stripes_requested += 1;
                        self.shared.band.advance_block_rows_needed(
                            1,
                            QUANTUM_BITS,
                            (p.jobs_per_quantum << p.log2_job_blocks) as u32,
                        );
                    }
                }
            }
            self.push_state.active_lines_left = self.push_state.next_stripe_height;
            self.push_state.subband_lines_left -= self.push_state.active_lines_left;
            self.push_state.next_stripe_height = self
                .shared
                .params
                .nominal_block_height
                .min(self.push_state.subband_lines_left);
            debug_assert_eq!(self.push_state.active_push_line, 0);
        }

        debug_assert_eq!(line.width(), self.shared.params.subband_cols as usize);
        self.store_line(line);
        if let Some(roi) = self.roi.as_mut() {
            let p = &self.shared.params;
            let stripe = &self.shared.stripes[self.push_state.active_push_stripe];
            let mut buf = stripe.roi.as_ref().unwrap().lock().unwrap();
            let row = self.push_state.active_push_line * p.roi_row_gap;
            roi.pull(&mut buf[row..row + p.subband_cols as usize]);
        }

        self.push_state.active_push_line += 1;
        self.push_state.active_lines_left -= 1;
        debug_assert!(self.push_state.active_lines_left >= 0);

        let p = &self.shared.params;
        let mut sched_inc: i32 = 0;
        if self.push_state.active_lines_left == 0 {
            // The active stripe is full.
            self.push_state.active_push_line = 0;
            if !multi_threaded {
                // Encode the stripe in place on the caller's thread.
                debug_assert_eq!(p.num_stripes, 1);
                for j in 0..p.jobs_per_stripe {
                    self.shared.encode_job_blocks(0, j)?;
                }
                return Ok(());
            }

            let stripe_idx = self.push_state.active_push_stripe;
            self.push_state.active_push_stripe = (stripe_idx + 1) % p.num_stripes;
            self.push_state.active_sched_stripe = stripe_idx;
            debug_assert_eq!(self.push_state.partial_quanta_remaining, 0);

            sched_inc -= 1 << sched::S_POS;
            self.shared.stripes[stripe_idx]
                .pending_jobs
                .store(p.jobs_per_stripe as i32, Ordering::Release);
            self.push_state.num_stripes_released += 1;
            let stripes_left = p.block_rows - self.push_state.num_stripes_released;
            if stripes_left == p.num_stripes as i32 {
                // MS moves from "unset" to the stripe count.
                sched_inc += (p.num_stripes as i32 - MS_UNSET as i32) << sched::MS_POS;
            }
            else if stripes_left < p.num_stripes as i32 {
                sched_inc -= 1 << sched::MS_POS;
            }
            if p.lines_per_quantum > 0 && stripes_left > 0 {
                debug_assert!(self.push_state.next_stripe_height > 0);
                self.push_state.partial_quanta_remaining =
                    (self.push_state.next_stripe_height - p.quantum_offset)
                        / p.lines_per_quantum;
            }
            if self.push_state.partial_quanta_remaining <= 0 {
                self.push_state.partial_quanta_remaining = 0;
                sched_inc += 3 << (sched::U_POS + 2 * stripe_idx as u32);
            }
            else {
                let q = (p.quanta_per_stripe - self.push_state.partial_quanta_remaining).max(0);
                debug_assert!(q < (1 << QUANTUM_BITS));
                sched_inc += 2 << (sched::U_POS + 2 * stripe_idx as u32);
                sched_inc += q << sched::Q_POS;
            }
        }
        else {
            // Possibly release further job quanta from the partially scheduled stripe.
            let stripe_idx = self.push_state.active_sched_stripe;
            let old_q = self.push_state.partial_quanta_remaining;
            if old_q == 0 {
                return Ok(());
            }
            let mut new_q = 0;
            if p.lines_per_quantum > 0 {
                new_q = (self.push_state.active_lines_left - p.quantum_offset)
                    / p.lines_per_quantum;
                if old_q == new_q {
                    return Ok(());
                }
            }
            self.push_state.partial_quanta_remaining = new_q;
            let old_q = (p.quanta_per_stripe - old_q).max(0);
            let mut new_q = (p.quanta_per_stripe - new_q).max(0);
            if new_q >= p.quanta_per_stripe {
                // The stripe becomes fully schedulable; Q resets to zero.
                self.push_state.partial_quanta_remaining = 0;
                new_q = 0;
                sched_inc += 1 << (sched::U_POS + 2 * stripe_idx as u32);
            }
            sched_inc += (new_q - old_q) << sched::Q_POS;
        }

        if sched_inc == 0 {
            return Ok(());
        }
        let old = self.shared.sync.fetch_add(sched_inc);
        let new = old.wrapping_add(sched_inc as u32);
        debug_assert_eq!(old & sched::T_BIT, 0);
        EncoderShared::schedule_new_jobs(&self.shared, old, new);
        if new & sched::S_MASK == 0 && new & sched::MS_MASK != 0 {
            // The next push call might block.
            self.shared.monitor.propagate_dependencies(1, 0);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        match self.shared.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn request_termination(&self) {
        if !self.inert {
            EncoderShared::request_termination(&self.shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Condvar;
    use std::time::Duration;

    use tessella_core::block::CodeBlock;
    use tessella_core::geometry::Rect;
    use tessella_core::subband::SubbandSpec;

    /// Records every closed block and block-row notification, and plays the codestream
    /// layer's background resourcing role by answering `advance_block_rows_needed`
    /// with an immediate availability notification.
    struct MockSink {
        spec: SubbandSpec,
        closed: Mutex<Vec<CodeBlock>>,
        rows: Mutex<Vec<(i32, bool)>>,
        notifier: Mutex<Option<Arc<dyn BlockNotifier>>>,
    }

    impl MockSink {
        fn new(spec: SubbandSpec) -> Self {
            MockSink {
                spec,
                closed: Mutex::new(Vec::new()),
                rows: Mutex::new(Vec::new()),
                notifier: Mutex::new(None),
            }
        }

        fn block_size(&self, idx: Coords) -> Coords {
            let s = &self.spec;
            let w = if idx.x == 0 {
                s.first_block_size.x.min(s.dims.size.x)
            }
            else {
                (s.dims.size.x - s.first_block_size.x - (idx.x - 1) * s.nominal_block_size.x)
                    .min(s.nominal_block_size.x)
            };
            let h = s.block_row_height(idx.y);
            Coords::new(w, h)
        }
    }

    impl BlockSink for MockSink {
        fn spec(&self) -> &SubbandSpec {
            &self.spec
        }

        fn open_block(&self, idx: Coords, _remaining: usize, _scan_start: bool) -> Result<CodeBlock> {
            Ok(CodeBlock::new(idx, self.block_size(idx)))
        }

        fn close_block(&self, block: CodeBlock) -> Result<()> {
            self.closed.lock().unwrap().push(block);
            Ok(())
        }

        fn attach_block_notifier(&self, notifier: Arc<dyn BlockNotifier>) -> bool {
            *self.notifier.lock().unwrap() = Some(notifier);
            true
        }

        fn detach_block_notifier(&self) -> bool {
            self.notifier.lock().unwrap().take();
            true
        }

        fn advance_block_rows_needed(
            &self,
            rows: u32,
            quantum_bits: u32,
            _num_quantum_blocks: u32,
        ) {
            let notifier = self.notifier.lock().unwrap().clone();
            if let Some(notifier) = notifier {
                notifier.update_dependencies((rows << quantum_bits) as i32, false);
            }
        }

        fn block_row_generated(&self, height: i32, is_final: bool) {
            self.rows.lock().unwrap().push((height, is_final));
        }
    }

    /// Counts coded blocks without producing pass data.
    struct CountingCoder {
        count: AtomicUsize,
    }

    impl BlockCoder for CountingCoder {
        fn encode(
            &self,
            block: &mut CodeBlock,
            _reversible: bool,
            _msb_wmse: f64,
            _slope_threshold: u16,
        ) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            block.pass_lengths.push(0);
            Ok(())
        }

        fn cellular_encode(
            &self,
            block: &mut CodeBlock,
            reversible: bool,
            msb_wmse: f64,
            _cell_weights: &[f32],
            _first_cell_cols: i32,
            _first_cell_rows: i32,
            slope_threshold: u16,
        ) -> Result<()> {
            self.encode(block, reversible, msb_wmse, slope_threshold)
        }
    }

    /// A monitor whose `all_done` can be awaited.
    struct TestMonitor {
        done: Mutex<usize>,
        cond: Condvar,
        deps: Mutex<Vec<(i32, i32)>>,
    }

    impl TestMonitor {
        fn new() -> Self {
            TestMonitor { done: Mutex::new(0), cond: Condvar::new(), deps: Mutex::new(Vec::new()) }
        }

        fn wait_all_done(&self, timeout: Duration) -> usize {
            let guard = self.done.lock().unwrap();
            let (guard, _) =
                self.cond.wait_timeout_while(guard, timeout, |n| *n == 0).unwrap();
            *guard
        }
    }

    impl DependencyMonitor for TestMonitor {
        fn propagate_dependencies(&self, new_dependencies: i32, delta_max_dependencies: i32) {
            self.deps.lock().unwrap().push((new_dependencies, delta_max_dependencies));
        }

        fn all_done(&self) {
            let mut done = self.done.lock().unwrap();
            *done += 1;
            self.cond.notify_all();
        }
    }

    fn test_spec(cols: i32, rows: i32, block: i32) -> SubbandSpec {
        let blocks_across = 1 + (cols - 1) / block;
        let blocks_high = 1 + (rows - 1) / block;
        SubbandSpec {
            k_max: 5,
            k_max_prime: 5,
            reversible: true,
            delta: 0.0,
            msb_wmse: 1.0,
            roi_weight: None,
            dims: Rect::new(Coords::new(0, 0), Coords::new(cols, rows)),
            nominal_block_size: Coords::new(block, block),
            first_block_size: Coords::new(block, block),
            valid_blocks: Rect::new(Coords::new(0, 0), Coords::new(blocks_across, blocks_high)),
            band_idx: 1,
            top_level: true,
            masking: None,
        }
    }

    fn push_lines(enc: &mut Encoder, cols: usize, rows: usize) {
        for r in 0..rows {
            let mut line = SampleLine::new(cols, LineType::Fix16 { absolute: true });
            for (c, s) in line.buf16_mut().unwrap().iter_mut().enumerate() {
                *s = ((r * cols + c) % 17) as i16;
            }
            enc.push(&mut line).unwrap();
        }
    }

    #[test]
    fn verify_synchronous_encode() {
        let sink = Arc::new(MockSink::new(test_spec(8, 8, 4)));
        let coder = Arc::new(CountingCoder { count: AtomicUsize::new(0) });
        let monitor = Arc::new(TestMonitor::new());
        let mut enc = Encoder::new(
            Arc::clone(&sink) as Arc<dyn BlockSink>,
            Arc::clone(&coder) as Arc<dyn BlockCoder>,
            monitor,
            None,
            None,
            EncoderOptions::default(),
        )
        .unwrap();
        push_lines(&mut enc, 8, 8);
        enc.finish().unwrap();

        assert_eq!(coder.count.load(Ordering::SeqCst), 4);
        let closed = sink.closed.lock().unwrap();
        assert_eq!(closed.len(), 4);
        // Samples of the first block quantized with K_max = 5 (upshift 26).
        let b0 = closed.iter().find(|b| b.idx == Coords::new(0, 0)).unwrap();
        assert_eq!(b0.samples[0], 0);
        assert_eq!(b0.samples[1], 1 << 26);
    }

    #[test]
    fn verify_threaded_encode_runs_to_completion() {
        let pool = Arc::new(WorkerPool::new(3).unwrap());
        let sink = Arc::new(MockSink::new(test_spec(16, 16, 4)));
        let coder = Arc::new(CountingCoder { count: AtomicUsize::new(0) });
        let monitor = Arc::new(TestMonitor::new());
        let mut enc = Encoder::new(
            Arc::clone(&sink) as Arc<dyn BlockSink>,
            Arc::clone(&coder) as Arc<dyn BlockCoder>,
            Arc::clone(&monitor) as Arc<dyn DependencyMonitor>,
            Some(pool),
            None,
            EncoderOptions::default(),
        )
        .unwrap();
        push_lines(&mut enc, 16, 16);
        assert_eq!(monitor.wait_all_done(Duration::from_secs(10)), 1);
        enc.finish().unwrap();

        // 4x4 block rows of 4 blocks each.
        assert_eq!(coder.count.load(Ordering::SeqCst), 16);
        assert_eq!(sink.closed.lock().unwrap().len(), 16);
        let rows = sink.rows.lock().unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows[..3].iter().all(|&(h, f)| h == 4 && !f));
        assert_eq!(rows[3], (4, true));
    }

    #[test]
    fn verify_synchronous_irreversible_float_encode() {
        let mut spec = test_spec(4, 4, 4);
        spec.reversible = false;
        spec.delta = 1.0 / 512.0;
        spec.k_max = 9;
        spec.k_max_prime = 9;
        let sink = Arc::new(MockSink::new(spec));
        let coder = Arc::new(CountingCoder { count: AtomicUsize::new(0) });
        let monitor = Arc::new(TestMonitor::new());
        let options = EncoderOptions { use_shorts: false, ..EncoderOptions::default() };
        let mut enc = Encoder::new(
            Arc::clone(&sink) as Arc<dyn BlockSink>,
            coder,
            monitor,
            None,
            None,
            options,
        )
        .unwrap();
        for _ in 0..4 {
            let mut line = SampleLine::new(4, LineType::Float32);
            line.buf_f32_mut().unwrap().copy_from_slice(&[0.25, -0.25, 0.0, 0.125]);
            enc.push(&mut line).unwrap();
        }
        enc.finish().unwrap();

        let closed = sink.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        // scale = (1/delta) * 2^(31 - K_max) = 2^31; 0.25 quantizes to 2^29.
        let b = &closed[0];
        assert_eq!(b.samples[0], 1 << 29);
        assert_eq!(b.samples[1], (1 << 29) | i32::MIN);
        assert_eq!(b.samples[2], 0);
        assert_eq!(b.samples[3], 1 << 28);
        assert_eq!(b.missing_msbs, 1);
        assert_eq!(b.num_passes, 3 * (9 - 1) - 2);
    }

    struct StripeMask {
        rows: Vec<Vec<u8>>,
        next: usize,
    }

    impl RoiSource for StripeMask {
        fn pull(&mut self, dst: &mut [u8]) {
            let row = &self.rows[self.next % self.rows.len()];
            dst[..row.len()].copy_from_slice(row);
            self.next += 1;
        }
    }

    #[test]
    fn verify_roi_background_encode() {
        let mut spec = test_spec(4, 4, 4);
        spec.k_max = 3;
        spec.k_max_prime = 6;
        spec.roi_weight = Some(2.0);
        let sink = Arc::new(MockSink::new(spec));
        let coder = Arc::new(CountingCoder { count: AtomicUsize::new(0) });
        let monitor = Arc::new(TestMonitor::new());
        // Left half foreground, right half background.
        let roi = StripeMask { rows: vec![vec![1, 1, 0, 0]], next: 0 };
        let mut enc = Encoder::new(
            Arc::clone(&sink) as Arc<dyn BlockSink>,
            coder,
            monitor,
            None,
            Some(Box::new(roi)),
            EncoderOptions::default(),
        )
        .unwrap();
        for _ in 0..4 {
            let mut line = SampleLine::new(4, LineType::Fix16 { absolute: true });
            line.buf16_mut().unwrap().copy_from_slice(&[4, 4, 4, 4]);
            enc.push(&mut line).unwrap();
        }
        enc.finish().unwrap();

        let closed = sink.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        let b = &closed[0];
        // Foreground keeps the K_max-plane position; background drops by the ROI shift.
        assert_eq!(b.samples[0], 4 << 28);
        assert_eq!(b.samples[2], (4 << 28) >> 3);
        assert_eq!(b.num_passes, 3 * 6 - 2);
    }

    #[test]
    fn verify_termination_without_work() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let sink = Arc::new(MockSink::new(test_spec(8, 8, 4)));
        let coder = Arc::new(CountingCoder { count: AtomicUsize::new(0) });
        let monitor = Arc::new(TestMonitor::new());
        let mut enc = Encoder::new(
            Arc::clone(&sink) as Arc<dyn BlockSink>,
            coder,
            Arc::clone(&monitor) as Arc<dyn DependencyMonitor>,
            Some(pool),
            None,
            EncoderOptions::default(),
        )
        .unwrap();
        enc.start().unwrap();
        enc.request_termination();
        assert_eq!(monitor.wait_all_done(Duration::from_secs(10)), 1);
    }

    #[test]
    fn verify_termination_mid_subband() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let sink = Arc::new(MockSink::new(test_spec(16, 16, 4)));
        let coder = Arc::new(CountingCoder { count: AtomicUsize::new(0) });
        let monitor = Arc::new(TestMonitor::new());
        let mut enc = Encoder::new(
            Arc::clone(&sink) as Arc<dyn BlockSink>,
            coder,
            Arc::clone(&monitor) as Arc<dyn DependencyMonitor>,
            Some(pool),
            None,
            EncoderOptions::default(),
        )
        .unwrap();
        // Push one full stripe plus a partial one, then cancel.
        push_lines(&mut enc, 16, 6);
        enc.request_termination();
        assert_eq!(monitor.wait_all_done(Duration::from_secs(10)), 1);
    }
}
