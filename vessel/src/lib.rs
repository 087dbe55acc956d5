// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! # Project Vessel
//!
//! Vessel is a pure Rust library for reading and writing time-indexed audiovisual
//! container files: the ISO Base Media File Format family (MP4, M4A, MOV) and the
//! Matroska family (MKV, WebM).
//!
//! Vessel neither encodes nor decodes media. Encoded samples and their decoder
//! configurations are exchanged with external codec implementations as
//! [`EncodedPacket`]s; Vessel handles the container structure, timing, interleaving,
//! and byte-level io on top of pluggable sources and sinks.
//!
//! ## Reading
//!
//! Open an [`Input`] over any [`MediaSource`] and query its tracks by time or by
//! predecessor packet:
//!
//! ```no_run
//! # async fn example() -> vessel::Result<()> {
//! use vessel::io::BufferSource;
//! use vessel::{Input, PacketOptions};
//!
//! let input = Input::open(Box::new(BufferSource::new(std::fs::read("in.mp4")?))).await?;
//! let track = input.primary_video_track().expect("a video track");
//!
//! let packet = track.packet_at(3.0, PacketOptions::default()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Writing
//!
//! Construct the muxer of the desired family directly, feed it packets in decode
//! order, and finalize:
//!
//! ```no_run
//! # async fn example() -> vessel::Result<()> {
//! use vessel::io::{BufferTarget, OutputTarget};
//! use vessel::isomp4::{Mp4Mode, Mp4Muxer, Mp4MuxerOptions, Mp4Variant, VideoTrackOptions};
//!
//! let target = BufferTarget::new();
//! let muxer = Mp4Muxer::new(
//!     OutputTarget::buffer(target.clone()),
//!     Mp4MuxerOptions { mode: Mp4Mode::FastStart, variant: Mp4Variant::Mp4 },
//! );
//! let video = muxer.add_video_track(VideoTrackOptions::default()).await?;
//! muxer.start().await?;
//! // muxer.add_video_packet(video, &packet, Some(&config)).await?;
//! muxer.finalize().await?;
//! let bytes = target.take_buffer().unwrap();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use vessel_core::errors::{decode_error, Result as CoreResult};
use vessel_core::io::MediaSource;
use vessel_core::track::InputTrack;

use vessel_format_isomp4::Mp4Demuxer;
use vessel_format_mkv::MkvDemuxer;

pub use vessel_core::codecs;
pub use vessel_core::errors::{Error, Result};
pub use vessel_core::io;
pub use vessel_core::packet::{EncodedPacket, PacketKind, PacketSeq};
pub use vessel_core::streams;
pub use vessel_core::sync::AsyncMutex;
pub use vessel_core::track::{InputTrack as Track, PacketOptions, Rotation, TrackType};
pub use vessel_core::units;

pub use vessel_format_isomp4 as isomp4;
pub use vessel_format_mkv as mkv;

/// The container family of an input, sniffed from its first bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InputFormat {
    IsoMp4,
    Matroska,
}

enum InputDemuxer {
    IsoMp4(Mp4Demuxer),
    Matroska(MkvDemuxer),
}

/// An opened media file: the format-sniffing entry point of the read path.
pub struct Input {
    format: InputFormat,
    demuxer: InputDemuxer,
}

impl Input {
    /// Sniff the container family from the first bytes of the source and open the
    /// matching demuxer.
    pub async fn open(source: Box<dyn MediaSource>) -> CoreResult<Input> {
        let head = source.read_range(0, 12).await?;

        let format = sniff(&head)?;
        let demuxer = match format {
            InputFormat::IsoMp4 => InputDemuxer::IsoMp4(Mp4Demuxer::open(source).await?),
            InputFormat::Matroska => InputDemuxer::Matroska(MkvDemuxer::open(source).await?),
        };

        Ok(Input { format, demuxer })
    }

    pub fn format(&self) -> InputFormat {
        self.format
    }

    /// Every readable track of the input.
    pub fn tracks(&self) -> Vec<Arc<dyn InputTrack>> {
        match &self.demuxer {
            InputDemuxer::IsoMp4(demuxer) => demuxer.tracks(),
            InputDemuxer::Matroska(demuxer) => demuxer.tracks(),
        }
    }

    /// The first video track, if any.
    pub fn primary_video_track(&self) -> Option<Arc<dyn InputTrack>> {
        self.primary_track(TrackType::Video)
    }

    /// The first audio track, if any.
    pub fn primary_audio_track(&self) -> Option<Arc<dyn InputTrack>> {
        self.primary_track(TrackType::Audio)
    }

    pub fn primary_track(&self, track_type: TrackType) -> Option<Arc<dyn InputTrack>> {
        match &self.demuxer {
            InputDemuxer::IsoMp4(demuxer) => demuxer.primary_track(track_type),
            InputDemuxer::Matroska(demuxer) => demuxer.primary_track(track_type),
        }
    }

    /// The duration of the longest track, in seconds.
    pub async fn compute_duration(&self) -> CoreResult<f64> {
        let mut duration = 0.0f64;
        for track in self.tracks() {
            duration = duration.max(track.compute_duration().await?);
        }
        Ok(duration)
    }
}

fn sniff(head: &[u8]) -> CoreResult<InputFormat> {
    if head.len() >= 4 && head[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        return Ok(InputFormat::Matroska);
    }

    // Any leading ISO box type is accepted; ftyp is the common case.
    if head.len() >= 8 {
        let box_type = &head[4..8];
        if matches!(
            box_type,
            b"ftyp" | b"moov" | b"mdat" | b"free" | b"skip" | b"styp" | b"sidx" | b"moof" | b"wide"
        ) {
            return Ok(InputFormat::IsoMp4);
        }
    }

    decode_error("unrecognized container format")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_sniffing() {
        assert_eq!(sniff(&[0x1A, 0x45, 0xDF, 0xA3, 0, 0, 0, 0]).unwrap(), InputFormat::Matroska);

        let mut mp4 = vec![0, 0, 0, 24];
        mp4.extend_from_slice(b"ftyp");
        mp4.extend_from_slice(&[0; 4]);
        assert_eq!(sniff(&mp4).unwrap(), InputFormat::IsoMp4);

        assert!(sniff(b"RIFF....WAVE").is_err());
        assert!(sniff(&[]).is_err());
    }
}
