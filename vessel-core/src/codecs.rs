// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `codecs` module defines codec identifiers and caller-supplied decoder
//! configuration. Vessel never touches sample payloads beyond container-level patching;
//! these types only describe what an external encoder produced or an external decoder
//! needs.

/// Video codec identifiers supported at the container level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    /// H.264 / AVC.
    Avc,
    /// H.265 / HEVC.
    Hevc,
    Vp8,
    Vp9,
    Av1,
}

/// Audio codec identifiers supported at the container level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    Aac,
    Opus,
    Vorbis,
    Flac,
    Mp3,
    /// Uncompressed little-endian signed PCM.
    Pcm,
}

/// Subtitle codec identifiers supported at the container level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubtitleCodec {
    WebVtt,
}

/// Colour description using ISO/IEC 23001-8 code points, as carried by an `nclx` colour
/// box or a Matroska `Colour` element.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorSpace {
    pub primaries: Option<u8>,
    pub transfer: Option<u8>,
    pub matrix: Option<u8>,
    pub full_range: Option<bool>,
}

/// Common ISO/IEC 23001-8 code points.
pub mod color {
    pub const PRIMARIES_BT709: u8 = 1;
    pub const PRIMARIES_BT470BG: u8 = 5;
    pub const PRIMARIES_SMPTE170M: u8 = 6;
    pub const PRIMARIES_BT2020: u8 = 9;

    pub const TRANSFER_BT709: u8 = 1;
    pub const TRANSFER_SMPTE170M: u8 = 6;
    pub const TRANSFER_SRGB: u8 = 13;
    pub const TRANSFER_PQ: u8 = 16;

    pub const MATRIX_RGB: u8 = 0;
    pub const MATRIX_BT709: u8 = 1;
    pub const MATRIX_BT470BG: u8 = 5;
    pub const MATRIX_SMPTE170M: u8 = 6;
    pub const MATRIX_BT2020_NCL: u8 = 9;
}

impl ColorSpace {
    /// A colour description is complete when all four fields are known. Only complete
    /// descriptions are written into containers.
    pub fn is_complete(&self) -> bool {
        self.primaries.is_some()
            && self.transfer.is_some()
            && self.matrix.is_some()
            && self.full_range.is_some()
    }
}

/// Decoder configuration for a video track, in the shape produced by WebCodecs-style
/// encoder callbacks.
#[derive(Clone, Debug)]
pub struct VideoDecoderConfig {
    pub codec: VideoCodec,
    pub coded_width: u32,
    pub coded_height: u32,
    /// Codec-specific description bytes (`avcC`, `hvcC`, etc. payload).
    pub description: Option<Box<[u8]>>,
    pub color_space: Option<ColorSpace>,
}

/// Decoder configuration for an audio track.
#[derive(Clone, Debug)]
pub struct AudioDecoderConfig {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channel_count: u32,
    /// Codec-specific description bytes (`AudioSpecificConfig`, `dOps` payload, etc.).
    pub description: Option<Box<[u8]>>,
}

impl VideoDecoderConfig {
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.coded_width == 0 || self.coded_height == 0 {
            return crate::errors::invalid_metadata_error("video coded size must be non-zero");
        }
        Ok(())
    }
}

impl AudioDecoderConfig {
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.sample_rate == 0 {
            return crate::errors::invalid_metadata_error("audio sample rate must be non-zero");
        }
        if self.channel_count == 0 {
            return crate::errors::invalid_metadata_error("audio channel count must be non-zero");
        }
        Ok(())
    }
}
