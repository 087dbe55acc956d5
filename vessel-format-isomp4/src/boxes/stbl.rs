// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Readers for the sample-table sub-boxes: stts, ctts, stsc, stsz, stss, stco, co64.

use vessel_core::errors::{decode_error, unsupported_error, Result};
use vessel_core::io::ReadBytes;

use super::{BoxHeader, ReadBox};

#[derive(Copy, Clone, Debug)]
pub struct SampleDurationEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

/// Time-to-sample box.
#[derive(Debug, Default)]
pub struct SttsBox {
    pub entries: Vec<SampleDurationEntry>,
    pub total_duration: u64,
}

impl ReadBox for SttsBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (_, _) = header.read_extended_header(reader)?;

        let len = match header.data_len() {
            Some(len) if len >= 4 => len as u32,
            Some(_) => return decode_error("isomp4 (stts): box too small"),
            None => return decode_error("isomp4 (stts): expected box size to be known"),
        };

        let entry_count = reader.read_be_u32()?;
        if entry_count != (len - 4) / 8 {
            return decode_error("isomp4 (stts): invalid entry count");
        }

        let mut total_duration = 0;
        let mut entries = Vec::with_capacity(entry_count as usize);

        for _ in 0..entry_count {
            let sample_count = reader.read_be_u32()?;
            let sample_delta = reader.read_be_u32()?;

            total_duration += u64::from(sample_count) * u64::from(sample_delta);

            entries.push(SampleDurationEntry { sample_count, sample_delta });
        }

        Ok(SttsBox { entries, total_duration })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct CompositionOffsetEntry {
    pub sample_count: u32,
    /// Signed in version 1, unsigned in version 0. Stored signed either way.
    pub sample_offset: i32,
}

/// Composition time-to-sample box.
#[derive(Debug, Default)]
pub struct CttsBox {
    pub entries: Vec<CompositionOffsetEntry>,
}

impl ReadBox for CttsBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (version, _) = header.read_extended_header(reader)?;

        if version > 1 {
            return decode_error("isomp4 (ctts): invalid version");
        }

        let entry_count = reader.read_be_u32()?;
        let mut entries = Vec::with_capacity(entry_count as usize);

        for _ in 0..entry_count {
            let sample_count = reader.read_be_u32()?;
            let sample_offset = reader.read_be_i32()?;

            entries.push(CompositionOffsetEntry { sample_count, sample_offset });
        }

        Ok(CttsBox { entries })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SampleToChunkEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub sample_desc_index: u32,
}

/// Sample-to-chunk box.
#[derive(Debug, Default)]
pub struct StscBox {
    pub entries: Vec<SampleToChunkEntry>,
}

impl ReadBox for StscBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (_, _) = header.read_extended_header(reader)?;

        let entry_count = reader.read_be_u32()?;
        let mut entries = Vec::with_capacity(entry_count as usize);

        for _ in 0..entry_count {
            let first_chunk = reader.read_be_u32()?;
            let samples_per_chunk = reader.read_be_u32()?;
            let sample_desc_index = reader.read_be_u32()?;

            if first_chunk == 0 {
                return decode_error("isomp4 (stsc): chunk numbering starts at one");
            }

            entries.push(SampleToChunkEntry { first_chunk, samples_per_chunk, sample_desc_index });
        }

        // Entries must be sorted by first chunk.
        for pair in entries.windows(2) {
            if pair[0].first_chunk > pair[1].first_chunk {
                return decode_error("isomp4 (stsc): entries out of order");
            }
        }

        Ok(StscBox { entries })
    }
}

/// The size of every sample in a track, either constant or per-sample.
#[derive(Debug)]
pub enum SampleSize {
    Constant(u32),
    Variable(Vec<u32>),
}

impl Default for SampleSize {
    fn default() -> Self {
        SampleSize::Constant(0)
    }
}

/// Sample size box.
#[derive(Debug, Default)]
pub struct StszBox {
    pub sample_count: u32,
    pub sample_sizes: SampleSize,
}

impl ReadBox for StszBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (_, _) = header.read_extended_header(reader)?;

        let sample_size = reader.read_be_u32()?;
        let sample_count = reader.read_be_u32()?;

        let sample_sizes = if sample_size == 0 {
            let mut sizes = Vec::with_capacity(sample_count as usize);
            for _ in 0..sample_count {
                sizes.push(reader.read_be_u32()?);
            }
            SampleSize::Variable(sizes)
        }
        else {
            SampleSize::Constant(sample_size)
        };

        Ok(StszBox { sample_count, sample_sizes })
    }
}

/// The compact sample size box uses sub-byte size fields and is not supported.
pub fn reject_stz2<T>() -> Result<T> {
    unsupported_error("isomp4: stz2 compact sample sizes")
}

/// Sync sample box.
#[derive(Debug, Default)]
pub struct StssBox {
    /// One-based indices of sync samples, ascending.
    pub sample_numbers: Vec<u32>,
}

impl ReadBox for StssBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (_, _) = header.read_extended_header(reader)?;

        let entry_count = reader.read_be_u32()?;
        let mut sample_numbers = Vec::with_capacity(entry_count as usize);

        for _ in 0..entry_count {
            sample_numbers.push(reader.read_be_u32()?);
        }

        Ok(StssBox { sample_numbers })
    }
}

/// Chunk offset box, 32-bit or 64-bit offsets normalized to 64 bits.
#[derive(Debug, Default)]
pub struct ChunkOffsetBox {
    pub chunk_offsets: Vec<u64>,
}

impl ChunkOffsetBox {
    pub fn read_stco<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (_, _) = header.read_extended_header(reader)?;

        let entry_count = reader.read_be_u32()?;
        let mut chunk_offsets = Vec::with_capacity(entry_count as usize);

        for _ in 0..entry_count {
            chunk_offsets.push(u64::from(reader.read_be_u32()?));
        }

        Ok(ChunkOffsetBox { chunk_offsets })
    }

    pub fn read_co64<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (_, _) = header.read_extended_header(reader)?;

        let entry_count = reader.read_be_u32()?;
        let mut chunk_offsets = Vec::with_capacity(entry_count as usize);

        for _ in 0..entry_count {
            chunk_offsets.push(reader.read_be_u64()?);
        }

        Ok(ChunkOffsetBox { chunk_offsets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::BoxHeader;
    use vessel_core::io::BufReader;

    fn full_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&((12 + payload.len()) as u32).to_be_bytes());
        data.extend_from_slice(fourcc);
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn verify_stts_read() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&10u32.to_be_bytes());
        payload.extend_from_slice(&1920u32.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&960u32.to_be_bytes());

        let data = full_box(b"stts", &payload);
        let mut reader = BufReader::new(&data);
        let header = BoxHeader::read(&mut reader).unwrap();
        let stts = SttsBox::read(&mut reader, header).unwrap();

        assert_eq!(stts.entries.len(), 2);
        assert_eq!(stts.total_duration, 10 * 1920 + 960);
    }

    #[test]
    fn verify_stsz_constant_and_variable() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&512u32.to_be_bytes());
        payload.extend_from_slice(&7u32.to_be_bytes());

        let data = full_box(b"stsz", &payload);
        let mut reader = BufReader::new(&data);
        let header = BoxHeader::read(&mut reader).unwrap();
        let stsz = StszBox::read(&mut reader, header).unwrap();

        assert_eq!(stsz.sample_count, 7);
        assert!(matches!(stsz.sample_sizes, SampleSize::Constant(512)));

        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&100u32.to_be_bytes());
        payload.extend_from_slice(&200u32.to_be_bytes());

        let data = full_box(b"stsz", &payload);
        let mut reader = BufReader::new(&data);
        let header = BoxHeader::read(&mut reader).unwrap();
        let stsz = StszBox::read(&mut reader, header).unwrap();

        match stsz.sample_sizes {
            SampleSize::Variable(sizes) => assert_eq!(sizes, vec![100, 200]),
            _ => panic!("expected per-sample sizes"),
        }
    }

    #[test]
    fn verify_stsc_rejects_zero_chunk() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());

        let data = full_box(b"stsc", &payload);
        let mut reader = BufReader::new(&data);
        let header = BoxHeader::read(&mut reader).unwrap();
        assert!(StscBox::read(&mut reader, header).is_err());
    }
}
