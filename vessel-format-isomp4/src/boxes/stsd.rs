// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sample description box reading: visual, audio, and subtitle sample entries, the
//! MPEG-4 elementary stream descriptor chain, and the AAC `AudioSpecificConfig`.

use log::{debug, warn};

use vessel_core::codecs::{AudioCodec, ColorSpace, SubtitleCodec, VideoCodec};
use vessel_core::errors::{decode_error, unsupported_error, Result};
use vessel_core::io::{BitReader, ReadBytes};

use super::{BoxHeader, BoxIter, BoxType, ReadBox};

/// A parsed sample description entry.
#[derive(Clone, Debug)]
pub enum SampleEntry {
    Video(VideoSampleEntry),
    Audio(AudioSampleEntry),
    Subtitle(SubtitleSampleEntry),
}

#[derive(Clone, Debug)]
pub struct VideoSampleEntry {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// Raw decoder-configuration payload: `avcC`, `hvcC`, `vpcC`, or `av1C` contents.
    pub description: Option<Box<[u8]>>,
    pub color_space: Option<ColorSpace>,
}

#[derive(Clone, Debug)]
pub struct AudioSampleEntry {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channel_count: u32,
    /// Raw decoder-configuration payload: the AAC `AudioSpecificConfig` or the `dOps`
    /// contents.
    pub description: Option<Box<[u8]>>,
}

#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct SubtitleSampleEntry {
    pub codec: SubtitleCodec,
    /// The `vttC` configuration payload.
    pub config: Option<Box<[u8]>>,
}

/// Sample description box. Only the first recognized entry is kept; multiple sample
/// descriptions per track are not produced by this library and rare in practice.
#[derive(Debug, Default)]
pub struct StsdBox {
    pub entry: Option<SampleEntry>,
}

impl ReadBox for StsdBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (_, _) = header.read_extended_header(reader)?;

        let entry_count = reader.read_be_u32()?;
        let mut entry = None;

        let mut iter = BoxIter::new_in(&mut *reader, &header);

        for _ in 0..entry_count {
            let entry_header = match iter.next()? {
                Some(entry_header) => entry_header,
                None => break,
            };

            let parsed = match entry_header.box_type() {
                BoxType::VisualSampleEntryAvc1 => {
                    read_visual_entry(iter.inner_mut(), entry_header, VideoCodec::Avc)?
                }
                BoxType::VisualSampleEntryHev1 | BoxType::VisualSampleEntryHvc1 => {
                    read_visual_entry(iter.inner_mut(), entry_header, VideoCodec::Hevc)?
                }
                BoxType::VisualSampleEntryVp8 => {
                    read_visual_entry(iter.inner_mut(), entry_header, VideoCodec::Vp8)?
                }
                BoxType::VisualSampleEntryVp9 => {
                    read_visual_entry(iter.inner_mut(), entry_header, VideoCodec::Vp9)?
                }
                BoxType::VisualSampleEntryAv1 => {
                    read_visual_entry(iter.inner_mut(), entry_header, VideoCodec::Av1)?
                }
                BoxType::AudioSampleEntryMp4a => {
                    read_audio_entry(iter.inner_mut(), entry_header, AudioCodec::Aac)?
                }
                BoxType::AudioSampleEntryOpus => {
                    read_audio_entry(iter.inner_mut(), entry_header, AudioCodec::Opus)?
                }
                BoxType::SubtitleSampleEntryWebVtt => {
                    read_subtitle_entry(iter.inner_mut(), entry_header)?
                }
                other => {
                    // Unknown sample entries are tolerated; the track is unreadable but
                    // the rest of the file is not.
                    warn!("skipping unknown sample entry {:?}", other);
                    None
                }
            };

            if entry.is_none() {
                entry = parsed;
            }
        }

        Ok(StsdBox { entry })
    }
}

fn read_visual_entry<B: ReadBytes>(
    reader: &mut B,
    header: BoxHeader,
    codec: VideoCodec,
) -> Result<Option<SampleEntry>> {
    // SampleEntry: 6 reserved bytes and a data reference index.
    reader.ignore_bytes(6)?;
    let _data_ref_index = reader.read_be_u16()?;

    // VisualSampleEntry: pre-defined and reserved fields.
    reader.ignore_bytes(16)?;

    let width = u32::from(reader.read_be_u16()?);
    let height = u32::from(reader.read_be_u16()?);

    // Resolution, reserved, frame count, compressor name, depth, pre-defined.
    reader.ignore_bytes(4 + 4 + 4 + 2 + 32 + 2 + 2)?;

    let mut description = None;
    let mut color_space = None;

    let mut iter = BoxIter::new_in(&mut *reader, &header);

    while let Some(child) = iter.next()? {
        match child.box_type() {
            BoxType::AvcConfiguration
            | BoxType::HevcConfiguration
            | BoxType::Vp9Configuration
            | BoxType::Av1Configuration => {
                let len = match child.data_len() {
                    Some(len) => len as usize,
                    None => return decode_error("isomp4: unsized decoder configuration"),
                };
                let payload = iter.inner_mut().read_boxed_slice_exact(len)?;

                match child.box_type() {
                    BoxType::AvcConfiguration => {
                        if let Ok(record) = AvcConfigRecord::parse(&payload) {
                            debug!(
                                "avc configuration: profile={} constraints={:#x} level={} nal-length={}",
                                record.profile,
                                record.constraints,
                                record.level,
                                record.nal_length_size
                            );
                        }
                    }
                    BoxType::HevcConfiguration => {
                        if let Ok(record) = HevcConfigRecord::parse(&payload) {
                            debug!(
                                "hevc configuration: space={} tier={} profile={} level={} nal-length={}",
                                record.profile_space,
                                record.tier_flag,
                                record.profile_idc,
                                record.level_idc,
                                record.nal_length_size
                            );
                        }
                    }
                    _ => (),
                }

                description = Some(payload);
            }
            BoxType::ColorInfo => {
                color_space = read_colr(iter.inner_mut(), child)?;
            }
            _ => (),
        }
    }

    Ok(Some(SampleEntry::Video(VideoSampleEntry {
        codec,
        width,
        height,
        description,
        color_space,
    })))
}

fn read_audio_entry<B: ReadBytes>(
    reader: &mut B,
    header: BoxHeader,
    codec: AudioCodec,
) -> Result<Option<SampleEntry>> {
    // SampleEntry: 6 reserved bytes and a data reference index.
    reader.ignore_bytes(6)?;
    let _data_ref_index = reader.read_be_u16()?;

    let version = reader.read_be_u16()?;

    // Revision and vendor.
    reader.ignore_bytes(6)?;

    let channel_count = u32::from(reader.read_be_u16()?);
    let _sample_size = reader.read_be_u16()?;

    // Compression id and packet size.
    reader.ignore_bytes(4)?;

    // The sample rate is 16.16 fixed point; only the integer part is meaningful here.
    // Rates above 65535 Hz require a version 1 or 2 sound description.
    let sample_rate = reader.read_be_u32()? >> 16;

    match version {
        0 => (),
        1 => {
            // Samples per packet, bytes per packet, bytes per frame, bytes per sample.
            reader.ignore_bytes(16)?;
        }
        _ => return unsupported_error("isomp4: sound description version"),
    }

    let mut entry = AudioSampleEntry { codec, sample_rate, channel_count, description: None };

    let mut iter = BoxIter::new_in(&mut *reader, &header);

    while let Some(child) = iter.next()? {
        match child.box_type() {
            BoxType::Esds => {
                read_esds(iter.inner_mut(), child, &mut entry)?;
            }
            BoxType::OpusDsConfig => {
                let len = match child.data_len() {
                    Some(len) => len as usize,
                    None => return decode_error("isomp4: unsized dOps"),
                };
                let payload = iter.inner_mut().read_boxed_slice_exact(len)?;

                if payload.len() >= 10 {
                    // OpusSpecificBox: version, channel count, pre-skip, input rate.
                    entry.channel_count = u32::from(payload[1]);
                    entry.sample_rate = u32::from_be_bytes([
                        payload[4], payload[5], payload[6], payload[7],
                    ]);
                }

                entry.description = Some(payload);
            }
            _ => (),
        }
    }

    Ok(Some(SampleEntry::Audio(entry)))
}

fn read_subtitle_entry<B: ReadBytes>(
    reader: &mut B,
    header: BoxHeader,
) -> Result<Option<SampleEntry>> {
    // SampleEntry: 6 reserved bytes and a data reference index.
    reader.ignore_bytes(6)?;
    let _data_ref_index = reader.read_be_u16()?;

    let mut config = None;

    let mut iter = BoxIter::new_in(&mut *reader, &header);

    while let Some(child) = iter.next()? {
        if child.box_type() == BoxType::WebVttConfig {
            let len = match child.data_len() {
                Some(len) => len as usize,
                None => return decode_error("isomp4: unsized vttC"),
            };
            config = Some(iter.inner_mut().read_boxed_slice_exact(len)?);
        }
    }

    Ok(Some(SampleEntry::Subtitle(SubtitleSampleEntry { codec: SubtitleCodec::WebVtt, config })))
}

fn read_colr<B: ReadBytes>(reader: &mut B, header: BoxHeader) -> Result<Option<ColorSpace>> {
    let colour_type = reader.read_quad_bytes()?;

    if &colour_type != b"nclx" {
        debug!("ignoring colour box of type {:?}", colour_type);
        if let Some(len) = header.data_len() {
            reader.ignore_bytes(len.saturating_sub(4))?;
        }
        return Ok(None);
    }

    let primaries = reader.read_be_u16()?;
    let transfer = reader.read_be_u16()?;
    let matrix = reader.read_be_u16()?;
    let full_range = reader.read_u8()? & 0x80 != 0;

    Ok(Some(ColorSpace {
        primaries: Some(primaries as u8),
        transfer: Some(transfer as u8),
        matrix: Some(matrix as u8),
        full_range: Some(full_range),
    }))
}

// MPEG-4 descriptor class tags.
const ES_DESCRIPTOR: u8 = 0x03;
const DECODER_CONFIG_DESCRIPTOR: u8 = 0x04;
const DECODER_SPECIFIC_INFO: u8 = 0x05;

const OBJECT_TYPE_MP4A: u8 = 0x40;
const OBJECT_TYPE_MP3: u8 = 0x6b;

/// Read a descriptor header: a class tag and a variable-length size.
fn read_descriptor_header<B: ReadBytes>(reader: &mut B) -> Result<(u8, u32)> {
    let tag = reader.read_u8()?;

    let mut size = 0u32;
    for _ in 0..4 {
        let byte = reader.read_u8()?;
        size = (size << 7) | u32::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok((tag, size));
        }
    }

    decode_error("isomp4 (esds): descriptor size too long")
}

/// Walk the elementary stream descriptor chain and populate the audio entry with the
/// decoder-specific configuration.
fn read_esds<B: ReadBytes>(
    reader: &mut B,
    mut header: BoxHeader,
    entry: &mut AudioSampleEntry,
) -> Result<()> {
    let (_, _) = header.read_extended_header(reader)?;

    let (tag, _) = read_descriptor_header(reader)?;
    if tag != ES_DESCRIPTOR {
        return decode_error("isomp4 (esds): missing es descriptor");
    }

    let _es_id = reader.read_be_u16()?;
    let es_flags = reader.read_u8()?;

    if es_flags & 0x80 != 0 {
        let _depends_on_es_id = reader.read_be_u16()?;
    }
    if es_flags & 0x40 != 0 {
        let url_len = reader.read_u8()?;
        reader.ignore_bytes(u64::from(url_len))?;
    }
    if es_flags & 0x20 != 0 {
        let _ocr_es_id = reader.read_be_u16()?;
    }

    let (tag, _) = read_descriptor_header(reader)?;
    if tag != DECODER_CONFIG_DESCRIPTOR {
        return decode_error("isomp4 (esds): missing decoder config descriptor");
    }

    let object_type = reader.read_u8()?;

    // Stream type, buffer size, max and average bitrate.
    reader.ignore_bytes(1 + 3 + 4 + 4)?;

    match object_type {
        OBJECT_TYPE_MP4A => {
            let (tag, len) = read_descriptor_header(reader)?;
            if tag != DECODER_SPECIFIC_INFO {
                return decode_error("isomp4 (esds): missing decoder specific info");
            }

            let asc = reader.read_boxed_slice_exact(len as usize)?;
            let parsed = AacAudioSpecificConfig::parse(&asc)?;

            entry.codec = AudioCodec::Aac;
            entry.sample_rate = parsed.sample_rate;
            entry.channel_count = parsed.channel_count;
            entry.description = Some(asc);
        }
        OBJECT_TYPE_MP3 => {
            entry.codec = AudioCodec::Mp3;
        }
        other => {
            debug!("unhandled esds object type {:#x}", other);
        }
    }

    Ok(())
}

const AAC_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// The parsed fields of an AAC `AudioSpecificConfig`.
#[derive(Copy, Clone, Debug)]
pub struct AacAudioSpecificConfig {
    pub object_type: u8,
    pub sample_rate: u32,
    pub channel_count: u32,
}

impl AacAudioSpecificConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut bits = BitReader::new(data);

        // A 5-bit object type, escaped to 6 more bits for types past 31.
        let mut object_type = bits.read_bits(5)? as u8;
        if object_type == 31 {
            object_type = 32 + bits.read_bits(6)? as u8;
        }

        // A 4-bit frequency index, or an escaped explicit 24-bit rate.
        let frequency_index = bits.read_bits(4)?;
        let sample_rate = if frequency_index == 15 {
            bits.read_bits(24)?
        }
        else {
            match AAC_SAMPLE_RATES.get(frequency_index as usize) {
                Some(&rate) => rate,
                None => return decode_error("isomp4 (aac): reserved frequency index"),
            }
        };

        let channel_count = bits.read_bits(4)?;

        Ok(AacAudioSpecificConfig { object_type, sample_rate, channel_count })
    }

    /// Serialize the configuration back into its two-byte (or escaped) form.
    pub fn serialize(&self) -> Vec<u8> {
        let frequency_index =
            AAC_SAMPLE_RATES.iter().position(|&rate| rate == self.sample_rate);

        let mut bits: Vec<(u32, u32)> = Vec::new();
        bits.push((u32::from(self.object_type), 5));
        match frequency_index {
            Some(idx) => bits.push((idx as u32, 4)),
            None => {
                bits.push((15, 4));
                bits.push((self.sample_rate, 24));
            }
        }
        bits.push((self.channel_count, 4));

        let mut out = Vec::new();
        let mut acc = 0u64;
        let mut acc_len = 0u32;
        for (value, len) in bits {
            acc = (acc << len) | u64::from(value);
            acc_len += len;
            while acc_len >= 8 {
                out.push((acc >> (acc_len - 8)) as u8);
                acc_len -= 8;
            }
        }
        if acc_len > 0 {
            out.push(((acc << (8 - acc_len)) & 0xff) as u8);
        }
        out
    }
}

/// The header fields of an `avcC` decoder configuration record.
#[derive(Copy, Clone, Debug)]
pub struct AvcConfigRecord {
    pub profile: u8,
    pub constraints: u8,
    pub level: u8,
    /// Bytes used by each NAL unit length prefix.
    pub nal_length_size: u8,
}

impl AvcConfigRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 5 || data[0] != 1 {
            return decode_error("isomp4 (avc): invalid configuration record");
        }

        let mut bits = BitReader::new(&data[1..]);
        let profile = bits.read_bits(8)? as u8;
        let constraints = bits.read_bits(8)? as u8;
        let level = bits.read_bits(8)? as u8;
        bits.ignore_bits(6)?;
        let nal_length_size = bits.read_bits(2)? as u8 + 1;

        Ok(AvcConfigRecord { profile, constraints, level, nal_length_size })
    }
}

/// The header fields of an `hvcC` decoder configuration record.
#[derive(Copy, Clone, Debug)]
pub struct HevcConfigRecord {
    pub profile_space: u8,
    pub tier_flag: bool,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub nal_length_size: u8,
}

impl HevcConfigRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 23 || data[0] != 1 {
            return decode_error("isomp4 (hevc): invalid configuration record");
        }

        let mut bits = BitReader::new(&data[1..]);
        let profile_space = bits.read_bits(2)? as u8;
        let tier_flag = bits.read_bit()?;
        let profile_idc = bits.read_bits(5)? as u8;

        // Compatibility flags, constraint flags.
        bits.ignore_bits(32 + 48)?;
        let level_idc = bits.read_bits(8)? as u8;

        // Everything up to lengthSizeMinusOne at byte 21.
        let nal_length_size = (data[21] & 0x03) + 1;

        Ok(HevcConfigRecord { profile_space, tier_flag, profile_idc, level_idc, nal_length_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_aac_config_parse() {
        // AAC-LC, 48 kHz (index 3), 2 channels: 00010 0011 0010 ...
        let asc = [0x11, 0x90];
        let parsed = AacAudioSpecificConfig::parse(&asc).unwrap();

        assert_eq!(parsed.object_type, 2);
        assert_eq!(parsed.sample_rate, 48_000);
        assert_eq!(parsed.channel_count, 2);

        assert_eq!(parsed.serialize(), vec![0x11, 0x90]);
    }

    #[test]
    fn verify_aac_config_explicit_rate() {
        let config =
            AacAudioSpecificConfig { object_type: 2, sample_rate: 12_345, channel_count: 1 };
        let bytes = config.serialize();
        let parsed = AacAudioSpecificConfig::parse(&bytes).unwrap();

        assert_eq!(parsed.sample_rate, 12_345);
        assert_eq!(parsed.channel_count, 1);
    }

    #[test]
    fn verify_avc_record_parse() {
        let record = [
            0x01, 0x64, 0x00, 0x1e, 0xff, 0xe1, 0x00, 0x0a, 0x67, 0x64, 0x00, 0x1e, 0xac, 0xd9,
        ];
        let parsed = AvcConfigRecord::parse(&record).unwrap();

        assert_eq!(parsed.profile, 0x64);
        assert_eq!(parsed.level, 0x1e);
        assert_eq!(parsed.nal_length_size, 4);
    }

    #[test]
    fn verify_descriptor_header_round_trip() {
        use crate::boxes::write::ByteBuf;
        use vessel_core::io::BufReader;

        let mut buf = ByteBuf::new();
        buf.descriptor(0x05, &[0xaa; 300]);
        let bytes = buf.into_inner();

        let mut reader = BufReader::new(&bytes);
        let (tag, len) = read_descriptor_header(&mut reader).unwrap();
        assert_eq!(tag, 0x05);
        assert_eq!(len, 300);
    }
}
