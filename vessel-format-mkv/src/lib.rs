// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod codecs;
mod ebml;
mod schema;
mod vp9;

pub mod demuxer;
pub mod muxer;

pub use demuxer::MkvDemuxer;
pub use muxer::{
    AudioTrackOptions, MkvMuxer, MkvMuxerOptions, MkvSubtitleCue, MkvVariant,
    SubtitleTrackOptions, TrackId, VideoTrackOptions,
};
