// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for the container round-trip tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use vessel::codecs::{AudioCodec, AudioDecoderConfig, VideoCodec, VideoDecoderConfig};
use vessel::io::{SinkChunk, StreamTarget};
use vessel::{EncodedPacket, PacketKind, PacketSeq, Result};

/// An H.264 decoder configuration record captured from a real encoder.
pub const AVC_DESCRIPTION: [u8; 42] = [
    0x01, 0x64, 0x00, 0x1e, 0xff, 0xe1, 0x00, 0x0a, 0x67, 0x64, 0x00, 0x1e, 0xac, 0xd9, 0x40,
    0xa0, 0x2f, 0xf9, 0x70, 0x11, 0x00, 0x00, 0x03, 0x00, 0x01, 0x00, 0x00, 0x03, 0x00, 0x32,
    0x8f, 0x18, 0x30, 0x36, 0x01, 0x00, 0x05, 0x68, 0xeb, 0xec, 0xb2, 0x2c,
];

/// An AAC-LC AudioSpecificConfig: 48 kHz, two channels.
pub const AAC_DESCRIPTION: [u8; 2] = [0x11, 0x90];

pub fn avc_config() -> VideoDecoderConfig {
    VideoDecoderConfig {
        codec: VideoCodec::Avc,
        coded_width: 640,
        coded_height: 360,
        description: Some(Box::from(AVC_DESCRIPTION.as_slice())),
        color_space: None,
    }
}

pub fn aac_config() -> AudioDecoderConfig {
    AudioDecoderConfig {
        codec: AudioCodec::Aac,
        sample_rate: 48_000,
        channel_count: 2,
        description: Some(Box::from(AAC_DESCRIPTION.as_slice())),
    }
}

/// One encoded packet with a recognizable payload.
pub fn packet(timestamp_us: i64, duration_us: i64, key: bool, tag: u8, len: usize) -> EncodedPacket {
    let payload: Vec<u8> = (0..len).map(|i| tag.wrapping_add(i as u8)).collect();
    EncodedPacket::new(
        payload,
        timestamp_us,
        duration_us,
        if key { PacketKind::Key } else { PacketKind::Delta },
        PacketSeq::new(0, 0),
    )
}

/// Compare a demuxed packet against the submitted one: byte-equal payload, key-ness,
/// and timing within one microsecond.
pub fn assert_packet_matches(expected: &EncodedPacket, actual: &EncodedPacket) {
    assert_eq!(expected.data, actual.data, "payload mismatch");
    assert_eq!(expected.kind, actual.kind, "kind mismatch");
    assert!(
        (expected.timestamp - actual.timestamp).abs() <= 1,
        "timestamp mismatch: {} vs {}",
        expected.timestamp,
        actual.timestamp
    );
    assert!(
        (expected.duration - actual.duration).abs() <= 1,
        "duration mismatch: {} vs {}",
        expected.duration,
        actual.duration
    );
}

/// The fourcc sequence of the file's top-level boxes.
pub fn top_level_boxes(bytes: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut pos = 0usize;

    while pos + 8 <= bytes.len() {
        let size32 = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as u64;
        let fourcc = String::from_utf8_lossy(&bytes[pos + 4..pos + 8]).into_owned();

        let size = match size32 {
            0 => (bytes.len() - pos) as u64,
            1 => u64::from_be_bytes(bytes[pos + 8..pos + 16].try_into().unwrap()),
            size => size,
        };

        out.push(fourcc);
        pos += size as usize;
    }

    out
}

/// A sink recording every posted chunk, for monotonicity checks.
pub struct RecordingSink {
    pub chunks: Arc<Mutex<Vec<SinkChunk>>>,
}

impl RecordingSink {
    pub fn new() -> (Box<dyn StreamTarget>, Arc<Mutex<Vec<SinkChunk>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        (Box::new(RecordingSink { chunks: chunks.clone() }), chunks)
    }
}

#[async_trait]
impl StreamTarget for RecordingSink {
    async fn write_chunk(&mut self, chunk: SinkChunk) -> Result<()> {
        self.chunks.lock().unwrap().push(chunk);
        Ok(())
    }
}

/// Assert the posted chunk sequence is strictly append-only.
pub fn assert_monotonic(chunks: &[SinkChunk]) {
    let mut expected = None;
    for chunk in chunks {
        if let Some(expected) = expected {
            assert_eq!(chunk.position, expected, "write out of append order");
        }
        expected = Some(chunk.position + chunk.data.len() as u64);
    }
}

/// Concatenate recorded chunks into the final file image.
pub fn assemble(chunks: &[SinkChunk]) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in chunks {
        let end = chunk.position as usize + chunk.data.len();
        if out.len() < end {
            out.resize(end, 0);
        }
        out[chunk.position as usize..end].copy_from_slice(&chunk.data);
    }
    out
}

// A minimal EBML walker for structural assertions on Matroska output.

/// Read an element id at `pos`; returns `(id, header_len)`.
fn read_ebml_id(bytes: &[u8], pos: usize) -> (u32, usize) {
    let first = bytes[pos];
    let extra = first.leading_zeros() as usize;
    let mut id = u32::from(first);
    for i in 0..extra {
        id = (id << 8) | u32::from(bytes[pos + 1 + i]);
    }
    (id, extra + 1)
}

/// Read an element size at `pos`; returns `(size, field_len)`, `None` size = unknown.
fn read_ebml_size(bytes: &[u8], pos: usize) -> (Option<u64>, usize) {
    let first = bytes[pos];
    if first == 0xff {
        return (None, 1);
    }
    let extra = first.leading_zeros() as usize;
    let mut value = u64::from(first) ^ (1 << (7 - extra));
    for i in 0..extra {
        value = (value << 8) | u64::from(bytes[pos + 1 + i]);
    }
    (Some(value), extra + 1)
}

/// One walked element: id, payload start, payload length.
pub struct EbmlElement {
    pub id: u32,
    pub data_pos: usize,
    pub data_len: Option<u64>,
}

/// The child elements of the byte range `[start, end)`.
pub fn ebml_children(bytes: &[u8], start: usize, end: usize) -> Vec<EbmlElement> {
    let mut out = Vec::new();
    let mut pos = start;

    while pos + 2 <= end {
        let (id, id_len) = read_ebml_id(bytes, pos);
        let (size, size_len) = read_ebml_size(bytes, pos + id_len);
        let data_pos = pos + id_len + size_len;

        out.push(EbmlElement { id, data_pos, data_len: size });

        match size {
            Some(size) => pos = data_pos + size as usize,
            None => break,
        }
    }

    out
}

/// Parse an unsigned integer payload.
pub fn ebml_uint(bytes: &[u8], element: &EbmlElement) -> u64 {
    let len = element.data_len.unwrap() as usize;
    let mut value = 0u64;
    for i in 0..len {
        value = (value << 8) | u64::from(bytes[element.data_pos + i]);
    }
    value
}
