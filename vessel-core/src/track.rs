// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `track` module provides the uniform track interface every demuxer exposes, and
//! the track-level metadata shared by muxers and demuxers.

use async_trait::async_trait;

use crate::codecs::{AudioDecoderConfig, VideoDecoderConfig};
use crate::errors::Result;
use crate::packet::EncodedPacket;

/// The track type.
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
}

/// Display rotation of a video track, applied counterclockwise on presentation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    /// The tkhd transformation matrix for this rotation. Entries are raw fixed-point
    /// values: 16.16 for the linear part and 2.30 for the last column.
    pub fn to_matrix(self) -> [i32; 9] {
        const ONE: i32 = 0x0001_0000;
        const W: i32 = 0x4000_0000;
        match self {
            Rotation::R0 => [ONE, 0, 0, 0, ONE, 0, 0, 0, W],
            Rotation::R90 => [0, ONE, 0, -ONE, 0, 0, 0, 0, W],
            Rotation::R180 => [-ONE, 0, 0, 0, -ONE, 0, 0, 0, W],
            Rotation::R270 => [0, -ONE, 0, ONE, 0, 0, 0, 0, W],
        }
    }

    /// Match a tkhd matrix against the four standard rotation matrices. Translation
    /// entries are ignored. Any other matrix maps to no rotation.
    pub fn from_matrix(matrix: &[i32; 9]) -> Rotation {
        let linear = |m: &[i32; 9]| [m[0], m[1], m[3], m[4]];
        let target = linear(matrix);

        for rotation in [Rotation::R0, Rotation::R90, Rotation::R180, Rotation::R270] {
            if linear(&rotation.to_matrix()) == target {
                return rotation;
            }
        }
        Rotation::R0
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }
}

/// Options for packet lookups.
#[derive(Copy, Clone, Debug, Default)]
pub struct PacketOptions {
    /// When set, the packet payload is not read from the source. Timestamp, duration,
    /// key-ness, and byte length are still populated; `data` is empty.
    pub metadata_only: bool,
}

impl PacketOptions {
    pub const METADATA_ONLY: PacketOptions = PacketOptions { metadata_only: true };
}

/// A single track of an opened input, with random access to its packets by time or by
/// predecessor packet.
///
/// Lookup methods take times in seconds; the implementation snaps them up to the
/// microsecond grid before searching, so timestamps previously returned by the library
/// resolve back to the packet they came from.
#[async_trait]
pub trait InputTrack: Send + Sync {
    /// The container-assigned track id.
    fn id(&self) -> u32;

    fn track_type(&self) -> TrackType;

    /// The track timescale in ticks per second.
    fn time_scale(&self) -> u32;

    /// ISO 639-2 language code, if the container declares one.
    fn language(&self) -> Option<String>;

    fn rotation(&self) -> Rotation;

    fn video_config(&self) -> Option<VideoDecoderConfig>;

    fn audio_config(&self) -> Option<AudioDecoderConfig>;

    /// The total duration of the track in seconds, reading as much of the container
    /// index as required.
    async fn compute_duration(&self) -> Result<f64>;

    /// The first packet of the track in decode order, or `None` for an empty track.
    async fn first_packet(&self, options: PacketOptions) -> Result<Option<EncodedPacket>>;

    /// The packet with the greatest presentation timestamp less than or equal to the
    /// given time, or `None` when the time precedes the track.
    async fn packet_at(&self, time_secs: f64, options: PacketOptions)
        -> Result<Option<EncodedPacket>>;

    /// The packet following `prev` in decode order.
    async fn next_packet(
        &self,
        prev: &EncodedPacket,
        options: PacketOptions,
    ) -> Result<Option<EncodedPacket>>;

    /// The latest key packet whose presentation timestamp is less than or equal to the
    /// given time.
    async fn key_packet_at(
        &self,
        time_secs: f64,
        options: PacketOptions,
    ) -> Result<Option<EncodedPacket>>;

    /// The next key packet following `prev` in decode order.
    async fn next_key_packet(
        &self,
        prev: &EncodedPacket,
        options: PacketOptions,
    ) -> Result<Option<EncodedPacket>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_rotation_matrix_round_trip() {
        for rotation in [Rotation::R0, Rotation::R90, Rotation::R180, Rotation::R270] {
            assert_eq!(Rotation::from_matrix(&rotation.to_matrix()), rotation);
        }

        // A flip is not a rotation.
        const ONE: i32 = 0x0001_0000;
        let flip = [-ONE, 0, 0, 0, ONE, 0, 0, 0, 0x4000_0000];
        assert_eq!(Rotation::from_matrix(&flip), Rotation::R0);
    }
}
