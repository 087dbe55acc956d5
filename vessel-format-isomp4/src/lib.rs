// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod boxes;

pub mod demuxer;
pub mod muxer;
pub mod vtt;

pub use demuxer::Mp4Demuxer;
pub use muxer::{
    AudioTrackOptions, Mp4Mode, Mp4Muxer, Mp4MuxerOptions, Mp4Variant, SubtitleTrackOptions,
    TrackId, VideoTrackOptions,
};
pub use vtt::SubtitleCue;
