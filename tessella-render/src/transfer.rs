// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `transfer` module writes rendered channel lines into caller buffers, adapting
//! precision and layout.
//!
//! Samples arrive in the renderer's nominal [-0.5, 0.5] range (fix16 with an implicit
//! binary point, absolute integers of a known precision, or floats) and leave as bytes,
//! 16-bit words, or floats, optionally interleaved and optionally rescaled so the
//! source's natural zero or nominal maximum lands on the corresponding point of the
//! output range.

use bitflags::bitflags;

use tessella_core::sample::FIX_POINT;

bitflags! {
    /// Output-range options for a transfer.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct TransferFlags: u32 {
        /// Map the source's natural zero onto the output's natural zero.
        const TRUE_ZERO = 1 << 0;
        /// Stretch the source's nominal maximum to the output's maximum.
        const TRUE_MAX = 1 << 1;
        /// Clamp floating point outputs to their nominal range. Integer outputs are
        /// always clamped to the representable range.
        const CLIP_OUTPUTS = 1 << 2;
        /// Level-shift integer outputs into the signed range.
        const LEAVE_SIGNED = 1 << 3;
    }
}

/// One source line for a transfer.
#[derive(Copy, Clone)]
pub enum TransferSource<'a> {
    Fix16(&'a [i16]),
    Int32 { samples: &'a [i32], precision: u32 },
    Float32(&'a [f32]),
}

impl<'a> TransferSource<'a> {
    /// The sample at `idx` in the normalized [-0.5, 0.5] range.
    #[inline]
    fn normalized(&self, idx: usize) -> f32 {
        match *self {
            TransferSource::Fix16(s) => f32::from(s[idx]) / (1 << FIX_POINT) as f32,
            TransferSource::Int32 { samples, precision } => {
                samples[idx] as f32 / (1u64 << precision) as f32
            }
            TransferSource::Float32(s) => s[idx],
        }
    }

    pub fn len(&self) -> usize {
        match *self {
            TransferSource::Fix16(s) => s.len(),
            TransferSource::Int32 { samples, .. } => samples.len(),
            TransferSource::Float32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed per-channel transfer parameters.
#[derive(Copy, Clone, Debug)]
pub struct TransferParams {
    /// Output precision in bits for integer outputs; 0 selects [0, 1] normalization
    /// for float outputs.
    pub dst_prec: u32,
    /// Distance between consecutive pixels of this channel, in samples.
    pub pixel_gap: usize,
    pub flags: TransferFlags,
    pub scale: f32,
    pub offset: f32,
}

/// Derives the scale and offset implementing the true-zero / true-max range options.
///
/// `normalized_max` is the source's nominal maximum in normalized units (0.5 minus one
/// source quantum, for integer sources). `zeta` is the channel's natural-unsigned-zero
/// offset within the output range, in [0, 1).
pub fn derive_scaling(
    flags: TransferFlags,
    src_signed: bool,
    normalized_max: f32,
    zeta: f32,
) -> (f32, f32) {
    let mut scale = 1.0f32;
    let mut offset = 0.0f32;
    if flags.contains(TransferFlags::TRUE_MAX) {
        if src_signed {
            // Stretch only the positive half, and only when it is meaningfully used.
            if normalized_max > 0.01 {
                scale = 0.5 / normalized_max;
            }
        }
        else {
            scale = 1.0 / (0.5 + normalized_max);
            offset = 0.5 * scale - 0.5;
        }
    }
    if flags.contains(TransferFlags::TRUE_ZERO) {
        let xz = if src_signed { 0.0 } else { -0.5 };
        let yz = if flags.contains(TransferFlags::LEAVE_SIGNED) { 0.5 } else { zeta };
        offset = yz - (xz * scale + 0.5);
    }
    (scale, offset)
}

#[inline]
fn to_integer(x: f32, params: &TransferParams) -> i32 {
    let prec = params.dst_prec;
    let y = x * params.scale + params.offset + 0.5;
    let max = (1i64 << prec) - 1;
    let v = (y * (1i64 << prec) as f32 + 0.5).floor() as i64;
    let v = v.clamp(0, max) as i32;
    if params.flags.contains(TransferFlags::LEAVE_SIGNED) {
        v - (1 << (prec - 1))
    }
    else {
        v
    }
}

/// Writes `num` samples starting `skip` samples into `src` as bytes.
pub fn transfer_to_bytes(
    src: TransferSource<'_>,
    skip: usize,
    num: usize,
    dst: &mut [u8],
    params: &TransferParams,
) {
    debug_assert!(params.dst_prec >= 1 && params.dst_prec <= 8);
    let gap = params.pixel_gap;
    for i in 0..num {
        let v = to_integer(src.normalized(skip + i), params);
        dst[i * gap] = v as u8;
    }
}

/// Writes `num` samples as 16-bit words.
pub fn transfer_to_words(
    src: TransferSource<'_>,
    skip: usize,
    num: usize,
    dst: &mut [u16],
    params: &TransferParams,
) {
    debug_assert!(params.dst_prec >= 1 && params.dst_prec <= 16);
    let gap = params.pixel_gap;
    for i in 0..num {
        let v = to_integer(src.normalized(skip + i), params);
        dst[i * gap] = v as u16;
    }
}

/// Writes `num` samples as floats. With `dst_prec` 0 the output is normalized to
/// [0, 1] (or [-0.5, 0.5] when `LEAVE_SIGNED`); a nonzero precision scales to the
/// corresponding integer range without rounding.
pub fn transfer_to_floats(
    src: TransferSource<'_>,
    skip: usize,
    num: usize,
    dst: &mut [f32],
    params: &TransferParams,
) {
    let gap = params.pixel_gap;
    let clip = params.flags.contains(TransferFlags::CLIP_OUTPUTS);
    let signed = params.flags.contains(TransferFlags::LEAVE_SIGNED);
    let range = if params.dst_prec == 0 { 1.0 } else { (1u64 << params.dst_prec) as f32 };
    for i in 0..num {
        let mut y = src.normalized(skip + i) * params.scale + params.offset + 0.5;
        if clip {
            y = y.clamp(0.0, 1.0);
        }
        if signed {
            y -= 0.5;
        }
        dst[i * gap] = y * range;
    }
}

/// Writes fix16 samples as bytes through pure integer arithmetic. Applicable when the
/// scale and offset are trivial; produces exactly the general path's values.
pub fn transfer_fix16_to_bytes(
    src: &[i16],
    skip: usize,
    num: usize,
    dst: &mut [u8],
    params: &TransferParams,
) {
    debug_assert!(params.dst_prec >= 1 && params.dst_prec <= 8);
    debug_assert!(params.scale == 1.0 && params.offset == 0.0);
    let prec = params.dst_prec;
    let downshift = FIX_POINT - prec;
    let rounding = (1i32 << (FIX_POINT - 1)) + (1i32 << (downshift - 1));
    let max = (1i32 << prec) - 1;
    let level = if params.flags.contains(TransferFlags::LEAVE_SIGNED) {
        1i32 << (prec - 1)
    }
    else {
        0
    };
    let gap = params.pixel_gap;
    for i in 0..num {
        let v = (i32::from(src[skip + i]) + rounding) >> downshift;
        dst[i * gap] = (v.clamp(0, max) - level) as u8;
    }
}

/// Writes fix16 samples as 16-bit words through pure integer arithmetic; trivial scale
/// and offset only.
pub fn transfer_fix16_to_words(
    src: &[i16],
    skip: usize,
    num: usize,
    dst: &mut [u16],
    params: &TransferParams,
) {
    debug_assert!(params.dst_prec >= 1 && params.dst_prec <= 16);
    debug_assert!(params.scale == 1.0 && params.offset == 0.0);
    let prec = params.dst_prec;
    let max = (1i64 << prec) - 1;
    let level = if params.flags.contains(TransferFlags::LEAVE_SIGNED) {
        1i64 << (prec - 1)
    }
    else {
        0
    };
    let gap = params.pixel_gap;
    for i in 0..num {
        let out = refine_word(i64::from(src[skip + i]), prec).clamp(0, max);
        dst[i * gap] = (out - level) as u16;
    }
}

/// `floor((x/2^FIX_POINT + 0.5) * 2^prec + 0.5)` evaluated in integers.
#[inline]
fn refine_word(v: i64, prec: u32) -> i64 {
    let num = (v + (1 << (FIX_POINT - 1))) << prec;
    (num + (1 << (FIX_POINT - 1))) >> FIX_POINT
}

/// True when the 4-way interleaved byte fast path applies.
pub fn interleaved_applicable(params: &TransferParams, src_fix16: bool) -> bool {
    src_fix16
        && params.pixel_gap == 4
        && params.dst_prec <= 8
        && !params.flags.contains(TransferFlags::LEAVE_SIGNED)
        && params.scale == 1.0
        && params.offset == 0.0
}

/// Transfers four fix16 channels at once into interleaved bytes, `dst_prec` at most 8,
/// with no scaling. Produces exactly the same values as the general path.
pub fn transfer_interleaved_fix16_to_bytes(
    srcs: [&[i16]; 4],
    skip: usize,
    num_pixels: usize,
    dst: &mut [u8],
    dst_prec: u32,
) {
    debug_assert!(dst_prec >= 1 && dst_prec <= 8);
    let downshift = FIX_POINT - dst_prec;
    let rounding = (1i32 << (FIX_POINT - 1)) + (1i32 << (downshift - 1));
    let max = (1i32 << dst_prec) - 1;
    for i in 0..num_pixels {
        for (c, src) in srcs.iter().enumerate() {
            let v = (i32::from(src[skip + i]) + rounding) >> downshift;
            dst[i * 4 + c] = v.clamp(0, max) as u8;
        }
    }
}

/// Emits the constant fill value used for expand-monochrome and alpha-fill channels:
/// the output maximum, clamped for signed outputs.
pub fn fill_transfer_bytes(num: usize, dst: &mut [u8], params: &TransferParams) {
    let prec = params.dst_prec;
    let v = if params.flags.contains(TransferFlags::LEAVE_SIGNED) {
        (1i32 << (prec - 1)) - 1
    }
    else {
        (1i32 << prec) - 1
    };
    let gap = params.pixel_gap;
    for i in 0..num {
        dst[i * gap] = v as u8;
    }
}
