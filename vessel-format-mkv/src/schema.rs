// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The subset of the Matroska element schema used by this crate: element ids, payload
//! types, and the id lookup table.

/// Raw element ids, including their length marker, as they appear in the stream.
pub mod ids {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    pub const SEGMENT: u32 = 0x1853_8067;

    pub const SEEK_HEAD: u32 = 0x114D_9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;

    pub const INFO: u32 = 0x1549_A966;
    pub const TIMESTAMP_SCALE: u32 = 0x2AD7B1;
    pub const DURATION: u32 = 0x4489;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const LANGUAGE: u32 = 0x22B59C;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;
    pub const DEFAULT_DURATION: u32 = 0x23E383;

    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const COLOUR: u32 = 0x55B0;
    pub const MATRIX_COEFFICIENTS: u32 = 0x55B1;
    pub const RANGE: u32 = 0x55B9;
    pub const TRANSFER_CHARACTERISTICS: u32 = 0x55BA;
    pub const PRIMARIES: u32 = 0x55BB;

    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;
    pub const BIT_DEPTH: u32 = 0x6264;

    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMESTAMP: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const BLOCK_ADDITIONS: u32 = 0x75A1;
    pub const BLOCK_MORE: u32 = 0xA6;
    pub const BLOCK_ADD_ID: u32 = 0xEE;
    pub const BLOCK_ADDITIONAL: u32 = 0xA5;
    pub const BLOCK_DURATION: u32 = 0x9B;
    pub const REFERENCE_BLOCK: u32 = 0xFB;

    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;

    pub const VOID: u32 = 0xEC;
    pub const CRC32: u32 = 0xBF;
}

/// Payload type of an element.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Type {
    Master,
    Unsigned,
    Signed,
    Binary,
    String,
    Float,
}

/// Element id to payload type. Elements not in this table are skipped.
pub static ELEMENTS: phf::Map<u32, Type> = phf::phf_map! {
    0x1A45_DFA3u32 => Type::Master,
    0x4286u32 => Type::Unsigned,
    0x42F7u32 => Type::Unsigned,
    0x42F2u32 => Type::Unsigned,
    0x42F3u32 => Type::Unsigned,
    0x4282u32 => Type::String,
    0x4287u32 => Type::Unsigned,
    0x4285u32 => Type::Unsigned,
    0x1853_8067u32 => Type::Master,
    0x114D_9B74u32 => Type::Master,
    0x4DBBu32 => Type::Master,
    0x53ABu32 => Type::Binary,
    0x53ACu32 => Type::Unsigned,
    0x1549_A966u32 => Type::Master,
    0x2AD7B1u32 => Type::Unsigned,
    0x4489u32 => Type::Float,
    0x4D80u32 => Type::String,
    0x5741u32 => Type::String,
    0x1654_AE6Bu32 => Type::Master,
    0xAEu32 => Type::Master,
    0xD7u32 => Type::Unsigned,
    0x73C5u32 => Type::Unsigned,
    0x83u32 => Type::Unsigned,
    0x9Cu32 => Type::Unsigned,
    0x22B59Cu32 => Type::String,
    0x86u32 => Type::String,
    0x63A2u32 => Type::Binary,
    0x23E383u32 => Type::Unsigned,
    0xE0u32 => Type::Master,
    0xB0u32 => Type::Unsigned,
    0xBAu32 => Type::Unsigned,
    0x55B0u32 => Type::Master,
    0x55B1u32 => Type::Unsigned,
    0x55B9u32 => Type::Unsigned,
    0x55BAu32 => Type::Unsigned,
    0x55BBu32 => Type::Unsigned,
    0xE1u32 => Type::Master,
    0xB5u32 => Type::Float,
    0x9Fu32 => Type::Unsigned,
    0x6264u32 => Type::Unsigned,
    0x1F43_B675u32 => Type::Master,
    0xE7u32 => Type::Unsigned,
    0xA3u32 => Type::Binary,
    0xA0u32 => Type::Master,
    0xA1u32 => Type::Binary,
    0x75A1u32 => Type::Master,
    0xA6u32 => Type::Master,
    0xEEu32 => Type::Unsigned,
    0xA5u32 => Type::Binary,
    0x9Bu32 => Type::Unsigned,
    0xFBu32 => Type::Signed,
    0x1C53_BB6Bu32 => Type::Master,
    0xBBu32 => Type::Master,
    0xB3u32 => Type::Unsigned,
    0xB7u32 => Type::Master,
    0xF7u32 => Type::Unsigned,
    0xF1u32 => Type::Unsigned,
    0xECu32 => Type::Binary,
    0xBFu32 => Type::Binary,
};

/// Whether an element id begins a top-level segment child worth resynchronizing on.
pub fn is_top_level(id: u32) -> bool {
    matches!(
        id,
        ids::SEEK_HEAD | ids::INFO | ids::TRACKS | ids::CLUSTER | ids::CUES
    )
}

/// Matroska track type values.
pub mod track_types {
    pub const VIDEO: u64 = 1;
    pub const AUDIO: u64 = 2;
    pub const SUBTITLE: u64 = 17;
}
