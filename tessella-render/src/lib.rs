// Tessella
// Copyright (c) 2025 The Project Tessella Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod channel;
pub mod floatrep;
pub mod kernels;
pub mod renderer;
pub mod tiles;
pub mod transfer;

pub use channel::{Alignment, ChannelParams, ChannelPipeline, Palette, SourceInfo};
pub use renderer::{ColourConverter, RegionRenderer, RendererConfig};
pub use transfer::TransferFlags;
