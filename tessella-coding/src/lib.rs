// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod dequantizer;
pub mod encoder;
pub mod gateway;
pub mod masking;
pub mod pool;
pub mod quantizer;
pub mod sched;

pub use encoder::{Encoder, EncoderOptions, RoiSource, SubbandPush};
pub use masking::{make_encoder, MaskEncoder};
