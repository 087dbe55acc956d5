// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `packet` module defines the encoded packet structure exchanged with external
//! codec glue on both the mux and demux paths.

use crate::units::{micros_to_secs, secs_to_micros};

/// Whether a packet can be decoded without reference to other packets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketKind {
    /// A sync sample (key frame).
    Key,
    /// A predicted sample that requires prior samples to decode.
    Delta,
}

/// Positional handle of a packet within its container, used to resume iteration.
///
/// The meaning of `segment` depends on the container: the fragment index for fragmented
/// ISO BMFF, the cluster index for Matroska, and [`PacketSeq::WHOLE_MOVIE`] for
/// non-fragmented ISO BMFF where `index` alone addresses the sample table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketSeq {
    pub segment: u32,
    pub index: u32,
}

impl PacketSeq {
    pub const WHOLE_MOVIE: u32 = u32::MAX;

    pub fn new(segment: u32, index: u32) -> Self {
        PacketSeq { segment, index }
    }
}

/// An `EncodedPacket` contains one encoded sample of a single track: a video frame, an
/// audio frame, or a subtitle cue payload.
///
/// Timestamps and durations are integer microseconds. The demuxers compute them from
/// container timescale ticks and round to the nearest microsecond, so a timestamp read
/// from one packet can be fed back into a lookup without drift.
#[derive(Clone, Debug)]
pub struct EncodedPacket {
    /// The packet payload. Empty when the packet was fetched metadata-only.
    pub data: Box<[u8]>,
    /// The presentation timestamp in microseconds.
    pub timestamp: i64,
    /// The duration in microseconds.
    pub duration: i64,
    pub kind: PacketKind,
    /// Container position of this packet, used by `next_packet` style lookups.
    pub seq: PacketSeq,
    /// The payload length in bytes, also populated for metadata-only packets.
    pub byte_length: u64,
}

impl EncodedPacket {
    pub fn new(
        data: impl Into<Box<[u8]>>,
        timestamp: i64,
        duration: i64,
        kind: PacketKind,
        seq: PacketSeq,
    ) -> Self {
        let data = data.into();
        let byte_length = data.len() as u64;
        EncodedPacket { data, timestamp, duration, kind, seq, byte_length }
    }

    #[inline]
    pub fn is_key(&self) -> bool {
        self.kind == PacketKind::Key
    }

    /// The presentation timestamp in seconds.
    #[inline]
    pub fn timestamp_secs(&self) -> f64 {
        micros_to_secs(self.timestamp)
    }

    /// The duration in seconds.
    #[inline]
    pub fn duration_secs(&self) -> f64 {
        micros_to_secs(self.duration)
    }

    /// The presentation end time in seconds.
    #[inline]
    pub fn end_timestamp_secs(&self) -> f64 {
        micros_to_secs(self.timestamp + self.duration)
    }

    /// Create a packet from second-based timing, rounding onto the microsecond grid.
    pub fn from_secs(
        data: impl Into<Box<[u8]>>,
        timestamp_secs: f64,
        duration_secs: f64,
        kind: PacketKind,
        seq: PacketSeq,
    ) -> Self {
        Self::new(data, secs_to_micros(timestamp_secs), secs_to_micros(duration_secs), kind, seq)
    }
}
