// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `floatrep` module reinterprets integer sample bit patterns as custom
//! floating point values, as required by reinterpret-as-float channel descriptors.
//!
//! A sample with `P` total bits (including the sign bit for signed formats) is split
//! into `exp_bits` exponent bits and `P - 1 - exp_bits` mantissa bits. Conversion
//! renormalizes the exponent bias to the IEEE-754 one, shifts the mantissa into IEEE
//! alignment, and bitcasts; source denormals fall back to their linear value. Unsigned
//! results are shifted down by 0.5 and signed results halved, so outputs line up with
//! the renderer's nominal [-0.5, 0.5] sample range.

use tessella_core::errors::{unsupported_error, Result};
use tessella_core::sample::{LineType, SampleLine};

/// A prepared reinterpretation of `precision`-bit integers as custom floats.
#[derive(Copy, Clone, Debug)]
pub struct FloatReinterpret {
    pub exp_bits: u32,
    pub mantissa_bits: u32,
    pub precision: u32,
    pub signed: bool,
    /// Exponent bias correction, in raw (pre-upshift) units.
    pre_adjust: i32,
    /// Bits to shift the custom mantissa up into the IEEE mantissa field.
    mantissa_upshift: u32,
    /// Value of one raw unit in the source's denormal (linear) range.
    denorm_scale: f32,
}

impl FloatReinterpret {
    /// Prepares a conversion for `float_exp_bits` exponent bits within `precision`
    /// total bits. Formats the IEEE single format cannot host are rejected.
    pub fn new(float_exp_bits: u32, precision: u32, signed: bool) -> Result<Self> {
        if precision < 2 || precision > 32 || float_exp_bits == 0 {
            return unsupported_error("float reinterpretation precision out of range");
        }
        let exp_bits = float_exp_bits.min(precision - 1);
        let mantissa_bits = precision - 1 - exp_bits;
        if exp_bits > 8 || mantissa_bits > 23 {
            return unsupported_error("custom float format exceeds the IEEE single range");
        }
        let exp_off = (1i32 << (exp_bits - 1)) - 1;
        Ok(FloatReinterpret {
            exp_bits,
            mantissa_bits,
            precision,
            signed,
            pre_adjust: (exp_off - 127) << mantissa_bits,
            mantissa_upshift: 23 - mantissa_bits,
            denorm_scale: (2f64.powi(1 - exp_off - mantissa_bits as i32)) as f32,
        })
    }

    /// Decodes one raw magnitude pattern (exponent and mantissa fields only).
    #[inline]
    fn magnitude(&self, raw: u32) -> f32 {
        let exp = raw >> self.mantissa_bits;
        if exp == 0 {
            // Denormal range: the value is linear in the mantissa.
            (raw as f32) * self.denorm_scale
        }
        else {
            let bits = ((raw as i32 - self.pre_adjust) as u32) << self.mantissa_upshift;
            f32::from_bits(bits)
        }
    }

    /// Converts one level-shifted integer sample.
    ///
    /// For unsigned formats `val` is the raw pattern minus `2^(P-1)`; for signed
    /// formats `val` carries the sign in its own right and the magnitude pattern in its
    /// absolute value.
    #[inline]
    pub fn convert(&self, val: i32) -> f32 {
        if self.signed {
            let mag_mask = (1u32 << (self.precision - 1)) - 1;
            let mag = (val.unsigned_abs()).min(mag_mask);
            let out = self.magnitude(mag) * 0.5;
            if val < 0 {
                -out
            }
            else {
                out
            }
        }
        else {
            // The exponent and mantissa fields span P - 1 bits.
            let limit = (1i64 << (self.precision - 1)) - 1;
            let raw = (i64::from(val) + (1i64 << (self.precision - 1))).clamp(0, limit) as u32;
            self.magnitude(raw) - 0.5
        }
    }

    /// Reinterprets an absolute int32 line into the float line `dst`. Any other source
    /// representation is rejected with `UnsupportedFormat`, matching the restriction of
    /// reinterpret-as-float channel descriptors.
    pub fn convert_line(&self, src: &SampleLine, dst: &mut SampleLine) -> Result<()> {
        if src.line_type() != (LineType::Int32 { absolute: true }) {
            return unsupported_error("float reinterpretation requires absolute 32-bit samples");
        }
        let n = src.width().min(dst.width());
        let src = src.buf32().expect("int32 line");
        let dst = dst.buf_f32_mut().expect("float line");
        for i in 0..n {
            dst[i] = self.convert(src[i]);
        }
        Ok(())
    }
}
