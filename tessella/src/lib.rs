// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Project Tessella is a pure Rust JPEG2000 codestream engine core: a parallel block
//! encoding pipeline and a region rendering pipeline built on a shared sample data
//! model. The entropy coder kernel, wavelet transforms, and container parsing live
//! behind trait seams in [`tessella_core::codestream`] and
//! [`tessella_coding::gateway`], so they can be supplied independently.

pub use tessella_core as core;

#[cfg(feature = "coding")]
pub use tessella_coding as coding;

#[cfg(feature = "render")]
pub use tessella_render as render;

pub use tessella_core::errors::{Result, TessellaError};
