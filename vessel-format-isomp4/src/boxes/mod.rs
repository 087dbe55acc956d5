// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use vessel_core::errors::{decode_error, Result};
use vessel_core::io::ReadBytes;

pub(crate) mod moof;
pub(crate) mod moov;
pub(crate) mod stbl;
pub(crate) mod stsd;
pub(crate) mod write;

/// Box types recognized by the demuxer. Anything else is carried as `Other` and skipped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BoxType {
    AudioSampleEntryMp4a,
    AudioSampleEntryOpus,
    Av1Configuration,
    AvcConfiguration,
    ChunkOffset,
    ChunkOffset64,
    ColorInfo,
    CompositionTimeToSample,
    Edit,
    Esds,
    FileType,
    Free,
    Handler,
    HevcConfiguration,
    Media,
    MediaData,
    MediaHeader,
    MediaInfo,
    Movie,
    MovieExtends,
    MovieExtendsHeader,
    MovieFragment,
    MovieFragmentHeader,
    MovieFragmentRandomAccess,
    MovieFragmentRandomAccessOffset,
    MovieHeader,
    OpusDsConfig,
    SampleDescription,
    SampleSize,
    SampleSizeCompact,
    SampleTable,
    SampleToChunk,
    Skip,
    SubtitleSampleEntryWebVtt,
    SyncSample,
    TimeToSample,
    Track,
    TrackExtends,
    TrackFragment,
    TrackFragmentBaseMediaDecodeTime,
    TrackFragmentHeader,
    TrackFragmentRandomAccess,
    TrackFragmentRun,
    TrackHeader,
    VisualSampleEntryAv1,
    VisualSampleEntryAvc1,
    VisualSampleEntryHev1,
    VisualSampleEntryHvc1,
    VisualSampleEntryVp8,
    VisualSampleEntryVp9,
    Vp9Configuration,
    WebVttConfig,
    Other([u8; 4]),
}

impl From<[u8; 4]> for BoxType {
    fn from(val: [u8; 4]) -> Self {
        match &val {
            b"av01" => BoxType::VisualSampleEntryAv1,
            b"av1C" => BoxType::Av1Configuration,
            b"avc1" => BoxType::VisualSampleEntryAvc1,
            b"avcC" => BoxType::AvcConfiguration,
            b"co64" => BoxType::ChunkOffset64,
            b"colr" => BoxType::ColorInfo,
            b"ctts" => BoxType::CompositionTimeToSample,
            b"dOps" => BoxType::OpusDsConfig,
            b"edts" => BoxType::Edit,
            b"esds" => BoxType::Esds,
            b"free" => BoxType::Free,
            b"ftyp" => BoxType::FileType,
            b"hdlr" => BoxType::Handler,
            b"hev1" => BoxType::VisualSampleEntryHev1,
            b"hvc1" => BoxType::VisualSampleEntryHvc1,
            b"hvcC" => BoxType::HevcConfiguration,
            b"mdat" => BoxType::MediaData,
            b"mdhd" => BoxType::MediaHeader,
            b"mdia" => BoxType::Media,
            b"mfhd" => BoxType::MovieFragmentHeader,
            b"mfra" => BoxType::MovieFragmentRandomAccess,
            b"mfro" => BoxType::MovieFragmentRandomAccessOffset,
            b"minf" => BoxType::MediaInfo,
            b"moof" => BoxType::MovieFragment,
            b"moov" => BoxType::Movie,
            b"mp4a" => BoxType::AudioSampleEntryMp4a,
            b"mvex" => BoxType::MovieExtends,
            b"mehd" => BoxType::MovieExtendsHeader,
            b"mvhd" => BoxType::MovieHeader,
            b"Opus" => BoxType::AudioSampleEntryOpus,
            b"skip" => BoxType::Skip,
            b"stbl" => BoxType::SampleTable,
            b"stco" => BoxType::ChunkOffset,
            b"stsc" => BoxType::SampleToChunk,
            b"stsd" => BoxType::SampleDescription,
            b"stss" => BoxType::SyncSample,
            b"stsz" => BoxType::SampleSize,
            b"stts" => BoxType::TimeToSample,
            b"stz2" => BoxType::SampleSizeCompact,
            b"tfdt" => BoxType::TrackFragmentBaseMediaDecodeTime,
            b"tfhd" => BoxType::TrackFragmentHeader,
            b"tfra" => BoxType::TrackFragmentRandomAccess,
            b"tkhd" => BoxType::TrackHeader,
            b"traf" => BoxType::TrackFragment,
            b"trak" => BoxType::Track,
            b"trex" => BoxType::TrackExtends,
            b"trun" => BoxType::TrackFragmentRun,
            b"vp08" => BoxType::VisualSampleEntryVp8,
            b"vp09" => BoxType::VisualSampleEntryVp9,
            b"vpcC" => BoxType::Vp9Configuration,
            b"wvtt" => BoxType::SubtitleSampleEntryWebVtt,
            b"vttC" => BoxType::WebVttConfig,
            _ => BoxType::Other(val),
        }
    }
}

/// Common box header.
#[derive(Copy, Clone, Debug)]
pub struct BoxHeader {
    box_type: BoxType,
    /// The size of all read headers.
    header_len: u8,
    /// The position of the box.
    box_pos: u64,
    /// The total size of the box including all headers. `None` when the box spans to the
    /// end of the stream.
    box_len: Option<u64>,
}

impl BoxHeader {
    /// Size of a standard box header.
    pub const HEADER_SIZE: u8 = 8;
    /// Size of a box header with a 64-bit size.
    pub const LARGE_HEADER_SIZE: u8 = BoxHeader::HEADER_SIZE + 8;

    /// Reads a box header from the provided stream.
    pub fn read<B: ReadBytes>(reader: &mut B) -> Result<BoxHeader> {
        let box_pos = reader.pos();

        let box_len = u64::from(reader.read_be_u32()?);
        let box_type = BoxType::from(reader.read_quad_bytes()?);

        let (header_len, box_len) = match box_len {
            0 => {
                // A box size of 0 indicates the box spans the remainder of the stream.
                (BoxHeader::HEADER_SIZE, None)
            }
            1 => {
                // A box size of 1 indicates a 64-bit box size follows.
                let large_box_len = reader.read_be_u64()?;

                if large_box_len < u64::from(BoxHeader::LARGE_HEADER_SIZE) {
                    return decode_error("isomp4: box size is invalid");
                }

                (BoxHeader::LARGE_HEADER_SIZE, Some(large_box_len))
            }
            _ => {
                if box_len < u64::from(BoxHeader::HEADER_SIZE) {
                    return decode_error("isomp4: box size is invalid");
                }

                (BoxHeader::HEADER_SIZE, Some(box_len))
            }
        };

        Ok(BoxHeader { box_type, box_pos, box_len, header_len })
    }

    /// Get the box type.
    pub fn box_type(&self) -> BoxType {
        self.box_type
    }

    /// Get the box position.
    pub fn box_pos(&self) -> u64 {
        self.box_pos
    }

    /// If known, get the total box size.
    pub fn box_len(&self) -> Option<u64> {
        self.box_len
    }

    /// The position of the payload data.
    pub fn data_pos(&self) -> u64 {
        self.box_pos + u64::from(self.header_len)
    }

    /// If the box size is known, get the total payload data size.
    pub fn data_len(&self) -> Option<u64> {
        self.box_len.map(|box_len| box_len - u64::from(self.header_len))
    }

    /// Read the version and flags extended header fields. On success, consumes 4 bytes
    /// from the payload size.
    pub fn read_extended_header<B: ReadBytes>(&mut self, reader: &mut B) -> Result<(u8, u32)> {
        if let Some(data_len) = self.data_len() {
            if data_len < 4 {
                return decode_error("isomp4: box too small for extended header");
            }
        }

        let header = (reader.read_u8()?, reader.read_be_u24()?);
        self.header_len += 4;

        Ok(header)
    }
}

/// A box that can be read from a byte stream.
pub trait ReadBox: Sized {
    fn read<B: ReadBytes>(reader: &mut B, header: BoxHeader) -> Result<Self>;
}

/// Iterator over sibling boxes within a parent box or a byte range.
pub struct BoxIter<B: ReadBytes> {
    reader: B,
    /// Exclusive end of the iterated range, if known.
    end: Option<u64>,
    next_box_pos: u64,
}

impl<B: ReadBytes> BoxIter<B> {
    /// Iterate over boxes from the reader's current position to the given end.
    #[allow(dead_code)]
    pub fn new(reader: B, end: Option<u64>) -> Self {
        let next_box_pos = reader.pos();
        BoxIter { reader, end, next_box_pos }
    }

    /// Iterate over the children of the given box.
    pub fn new_in(reader: B, parent: &BoxHeader) -> Self {
        let next_box_pos = reader.pos();
        BoxIter { reader, end: parent.data_len().map(|len| parent.data_pos() + len), next_box_pos }
    }

    pub fn inner_mut(&mut self) -> &mut B {
        &mut self.reader
    }

    /// Read the next sibling box header, skipping over any unread payload of the
    /// previous box.
    pub fn next(&mut self) -> Result<Option<BoxHeader>> {
        let cur_pos = self.reader.pos();

        if cur_pos < self.next_box_pos {
            self.reader.ignore_bytes(self.next_box_pos - cur_pos)?;
        }
        else if cur_pos > self.next_box_pos {
            // The box's stated length was too short, or a reader overran the payload.
            return decode_error("isomp4: overread box");
        }

        if let Some(end) = self.end {
            if self.next_box_pos >= end {
                return Ok(None);
            }
        }

        let header = BoxHeader::read(&mut self.reader)?;

        self.next_box_pos = match header.box_len() {
            None => self.end.unwrap_or(u64::MAX),
            Some(len) => header.box_pos() + len,
        };

        Ok(Some(header))
    }

    /// Read the current box as a typed box.
    pub fn read_box<T: ReadBox>(&mut self, header: BoxHeader) -> Result<T> {
        T::read(&mut self.reader, header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_core::io::BufReader;

    #[test]
    fn verify_box_header_read() {
        let data = [0x00, 0x00, 0x00, 0x10, b'm', b'o', b'o', b'v', 0, 0, 0, 0, 0, 0, 0, 0];
        let mut reader = BufReader::new(&data);
        let header = BoxHeader::read(&mut reader).unwrap();

        assert_eq!(header.box_type(), BoxType::Movie);
        assert_eq!(header.box_len(), Some(16));
        assert_eq!(header.data_pos(), 8);
        assert_eq!(header.data_len(), Some(8));
    }

    #[test]
    fn verify_large_box_header_read() {
        let mut data = vec![0x00, 0x00, 0x00, 0x01, b'm', b'd', b'a', b't'];
        data.extend_from_slice(&0x1_0000_0010u64.to_be_bytes());
        let mut reader = BufReader::new(&data);
        let header = BoxHeader::read(&mut reader).unwrap();

        assert_eq!(header.box_type(), BoxType::MediaData);
        assert_eq!(header.box_len(), Some(0x1_0000_0010));
        assert_eq!(header.data_pos(), 16);
    }

    #[test]
    fn verify_box_iter_skips_unread_payload() {
        let mut data = Vec::new();
        data.extend_from_slice(&12u32.to_be_bytes());
        data.extend_from_slice(b"free");
        data.extend_from_slice(&[0xaa; 4]);
        data.extend_from_slice(&8u32.to_be_bytes());
        data.extend_from_slice(b"skip");

        let mut iter = BoxIter::new(BufReader::new(&data), Some(data.len() as u64));

        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.box_type(), BoxType::Free);
        let second = iter.next().unwrap().unwrap();
        assert_eq!(second.box_type(), BoxType::Skip);
        assert!(iter.next().unwrap().is_none());
    }
}
