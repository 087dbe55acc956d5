// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Readers for the movie fragment structure: moof, mfhd, traf, tfhd, tfdt, trun, and
//! the random-access index boxes mfra, tfra, mfro.

use bitflags::bitflags;
use log::debug;

use vessel_core::errors::{decode_error, Result};
use vessel_core::io::ReadBytes;

use super::{BoxHeader, BoxIter, BoxType, ReadBox};

bitflags! {
    /// Field-presence flags of the track fragment header.
    #[derive(Copy, Clone, Debug)]
    pub struct TfhdFlags: u32 {
        const BASE_DATA_OFFSET_PRESENT         = 0x0000_0001;
        const SAMPLE_DESCRIPTION_INDEX_PRESENT = 0x0000_0002;
        const DEFAULT_SAMPLE_DURATION_PRESENT  = 0x0000_0008;
        const DEFAULT_SAMPLE_SIZE_PRESENT      = 0x0000_0010;
        const DEFAULT_SAMPLE_FLAGS_PRESENT     = 0x0000_0020;
        const DURATION_IS_EMPTY                = 0x0001_0000;
        const DEFAULT_BASE_IS_MOOF             = 0x0002_0000;
    }
}

bitflags! {
    /// Field-presence flags of the track fragment run.
    #[derive(Copy, Clone, Debug)]
    pub struct TrunFlags: u32 {
        const DATA_OFFSET_PRESENT                     = 0x0000_0001;
        const FIRST_SAMPLE_FLAGS_PRESENT              = 0x0000_0004;
        const SAMPLE_DURATION_PRESENT                 = 0x0000_0100;
        const SAMPLE_SIZE_PRESENT                     = 0x0000_0200;
        const SAMPLE_FLAGS_PRESENT                    = 0x0000_0400;
        const SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT = 0x0000_0800;
    }
}

/// The sample flags word marking an independently decodable sample.
pub const SAMPLE_FLAGS_KEY: u32 = 0x0200_0000;
/// The sample flags word marking a predicted, non-sync sample.
pub const SAMPLE_FLAGS_DELTA: u32 = 0x0101_0000;

/// Whether a sample flags word marks a sync sample.
#[inline]
pub fn sample_flags_is_key(flags: u32) -> bool {
    flags & 0x0001_0000 == 0
}

/// Track fragment header box.
#[allow(dead_code)]
#[derive(Debug)]
pub struct TfhdBox {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
    pub duration_is_empty: bool,
    /// If true, the implicit anchor for this track fragment is the first byte of the
    /// enclosing moof box.
    pub default_base_is_moof: bool,
}

impl ReadBox for TfhdBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (_, raw_flags) = header.read_extended_header(reader)?;
        let flags = TfhdFlags::from_bits_truncate(raw_flags);

        let track_id = reader.read_be_u32()?;

        let base_data_offset = match flags.contains(TfhdFlags::BASE_DATA_OFFSET_PRESENT) {
            false => None,
            true => Some(reader.read_be_u64()?),
        };

        let sample_description_index =
            match flags.contains(TfhdFlags::SAMPLE_DESCRIPTION_INDEX_PRESENT) {
                false => None,
                true => Some(reader.read_be_u32()?),
            };

        let default_sample_duration =
            match flags.contains(TfhdFlags::DEFAULT_SAMPLE_DURATION_PRESENT) {
                false => None,
                true => Some(reader.read_be_u32()?),
            };

        let default_sample_size = match flags.contains(TfhdFlags::DEFAULT_SAMPLE_SIZE_PRESENT) {
            false => None,
            true => Some(reader.read_be_u32()?),
        };

        let default_sample_flags = match flags.contains(TfhdFlags::DEFAULT_SAMPLE_FLAGS_PRESENT) {
            false => None,
            true => Some(reader.read_be_u32()?),
        };

        // The default-base-is-moof flag is ignored when an explicit base offset is set.
        let default_base_is_moof = base_data_offset.is_none()
            && flags.contains(TfhdFlags::DEFAULT_BASE_IS_MOOF);

        Ok(TfhdBox {
            track_id,
            base_data_offset,
            sample_description_index,
            default_sample_duration,
            default_sample_size,
            default_sample_flags,
            duration_is_empty: flags.contains(TfhdFlags::DURATION_IS_EMPTY),
            default_base_is_moof,
        })
    }
}

/// Track fragment base media decode time box.
#[derive(Debug)]
pub struct TfdtBox {
    pub base_media_decode_time: u64,
}

impl ReadBox for TfdtBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (version, _) = header.read_extended_header(reader)?;

        let base_media_decode_time = match version {
            0 => u64::from(reader.read_be_u32()?),
            1 => reader.read_be_u64()?,
            _ => return decode_error("isomp4 (tfdt): invalid version"),
        };

        Ok(TfdtBox { base_media_decode_time })
    }
}

/// Track fragment run box.
#[derive(Debug)]
pub struct TrunBox {
    pub data_offset: Option<i32>,
    pub sample_count: u32,
    pub first_sample_flags: Option<u32>,
    pub sample_durations: Vec<u32>,
    pub sample_sizes: Vec<u32>,
    pub sample_flags: Vec<u32>,
    pub sample_composition_time_offsets: Vec<i32>,
}

impl ReadBox for TrunBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (version, raw_flags) = header.read_extended_header(reader)?;
        let flags = TrunFlags::from_bits_truncate(raw_flags);

        let sample_count = reader.read_be_u32()?;

        let data_offset = match flags.contains(TrunFlags::DATA_OFFSET_PRESENT) {
            false => None,
            true => Some(reader.read_be_i32()?),
        };

        let first_sample_flags = match flags.contains(TrunFlags::FIRST_SAMPLE_FLAGS_PRESENT) {
            false => None,
            true => Some(reader.read_be_u32()?),
        };

        // The first-sample-flags flag overrides per-sample flags; both together are
        // contradictory.
        if first_sample_flags.is_some() && flags.contains(TrunFlags::SAMPLE_FLAGS_PRESENT) {
            return decode_error("isomp4 (trun): conflicting sample flag presence");
        }

        let mut sample_durations = Vec::new();
        let mut sample_sizes = Vec::new();
        let mut sample_flags = Vec::new();
        let mut sample_composition_time_offsets = Vec::new();

        for _ in 0..sample_count {
            if flags.contains(TrunFlags::SAMPLE_DURATION_PRESENT) {
                sample_durations.push(reader.read_be_u32()?);
            }
            if flags.contains(TrunFlags::SAMPLE_SIZE_PRESENT) {
                sample_sizes.push(reader.read_be_u32()?);
            }
            if flags.contains(TrunFlags::SAMPLE_FLAGS_PRESENT) {
                sample_flags.push(reader.read_be_u32()?);
            }
            if flags.contains(TrunFlags::SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT) {
                // Unsigned in version 0, signed in version 1.
                let raw = reader.read_be_u32()?;
                let offset = if version == 0 { raw as i64 as i32 } else { raw as i32 };
                sample_composition_time_offsets.push(offset);
            }
        }

        Ok(TrunBox {
            data_offset,
            sample_count,
            first_sample_flags,
            sample_durations,
            sample_sizes,
            sample_flags,
            sample_composition_time_offsets,
        })
    }
}

/// Track fragment box.
#[derive(Debug)]
pub struct TrafBox {
    pub tfhd: TfhdBox,
    pub tfdt: Option<TfdtBox>,
    pub truns: Vec<TrunBox>,
}

impl ReadBox for TrafBox {
    fn read<B: ReadBytes>(reader: &mut B, header: BoxHeader) -> Result<Self> {
        let mut tfhd = None;
        let mut tfdt = None;
        let mut truns = Vec::new();

        let mut iter = BoxIter::new_in(&mut *reader, &header);

        while let Some(child) = iter.next()? {
            match child.box_type() {
                BoxType::TrackFragmentHeader => {
                    tfhd = Some(iter.read_box::<TfhdBox>(child)?);
                }
                BoxType::TrackFragmentBaseMediaDecodeTime => {
                    tfdt = Some(iter.read_box::<TfdtBox>(child)?);
                }
                BoxType::TrackFragmentRun => {
                    truns.push(iter.read_box::<TrunBox>(child)?);
                }
                other => debug!("skipping box {:?} in traf", other),
            }
        }

        let tfhd = match tfhd {
            Some(tfhd) => tfhd,
            None => return decode_error("isomp4 (traf): missing tfhd"),
        };

        Ok(TrafBox { tfhd, tfdt, truns })
    }
}

/// Movie fragment box.
#[derive(Debug)]
pub struct MoofBox {
    /// File position of the first byte of this moof box.
    pub moof_pos: u64,
    /// Total size of the moof box.
    pub moof_len: u64,
    pub sequence_number: u32,
    pub trafs: Vec<TrafBox>,
}

impl ReadBox for MoofBox {
    fn read<B: ReadBytes>(reader: &mut B, header: BoxHeader) -> Result<Self> {
        let moof_pos = header.box_pos();
        let moof_len = match header.box_len() {
            Some(len) => len,
            None => return decode_error("isomp4 (moof): unsized moof"),
        };

        let mut sequence_number = 0;
        let mut trafs = Vec::new();

        let mut iter = BoxIter::new_in(&mut *reader, &header);

        while let Some(child) = iter.next()? {
            match child.box_type() {
                BoxType::MovieFragmentHeader => {
                    let mut child = child;
                    let (_, _) = child.read_extended_header(iter.inner_mut())?;
                    sequence_number = iter.inner_mut().read_be_u32()?;
                }
                BoxType::TrackFragment => {
                    trafs.push(iter.read_box::<TrafBox>(child)?);
                }
                other => debug!("skipping box {:?} in moof", other),
            }
        }

        Ok(MoofBox { moof_pos, moof_len, sequence_number, trafs })
    }
}

/// One random-access entry of a track.
#[derive(Copy, Clone, Debug)]
pub struct TfraEntry {
    /// Presentation time of the sync sample in the track timescale.
    pub time: u64,
    /// File position of the moof box containing the sync sample.
    pub moof_offset: u64,
}

/// Track fragment random access box.
#[derive(Debug)]
pub struct TfraBox {
    pub track_id: u32,
    pub entries: Vec<TfraEntry>,
}

impl ReadBox for TfraBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (version, _) = header.read_extended_header(reader)?;

        let track_id = reader.read_be_u32()?;

        let sizes = reader.read_be_u32()?;
        let traf_num_len = ((sizes >> 4) & 0x3) + 1;
        let trun_num_len = ((sizes >> 2) & 0x3) + 1;
        let sample_num_len = (sizes & 0x3) + 1;

        let entry_count = reader.read_be_u32()?;
        let mut entries = Vec::with_capacity(entry_count as usize);

        for _ in 0..entry_count {
            let (time, moof_offset) = match version {
                0 => (u64::from(reader.read_be_u32()?), u64::from(reader.read_be_u32()?)),
                1 => (reader.read_be_u64()?, reader.read_be_u64()?),
                _ => return decode_error("isomp4 (tfra): invalid version"),
            };

            // The traf, trun, and sample numbers locate the sample inside the moof; the
            // demuxer re-parses the moof anyway, so they are skipped.
            reader
                .ignore_bytes(u64::from(traf_num_len + trun_num_len + sample_num_len))?;

            entries.push(TfraEntry { time, moof_offset });
        }

        Ok(TfraBox { track_id, entries })
    }
}

/// Movie fragment random access box: per-track sync sample indexes.
#[derive(Debug, Default)]
pub struct MfraBox {
    pub tfras: Vec<TfraBox>,
}

impl ReadBox for MfraBox {
    fn read<B: ReadBytes>(reader: &mut B, header: BoxHeader) -> Result<Self> {
        let mut tfras = Vec::new();

        let mut iter = BoxIter::new_in(&mut *reader, &header);

        while let Some(child) = iter.next()? {
            match child.box_type() {
                BoxType::TrackFragmentRandomAccess => {
                    tfras.push(iter.read_box::<TfraBox>(child)?);
                }
                BoxType::MovieFragmentRandomAccessOffset => (),
                other => debug!("skipping box {:?} in mfra", other),
            }
        }

        Ok(MfraBox { tfras })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_sample_flags() {
        assert!(sample_flags_is_key(SAMPLE_FLAGS_KEY));
        assert!(!sample_flags_is_key(SAMPLE_FLAGS_DELTA));
    }
}
