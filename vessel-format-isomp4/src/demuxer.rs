// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ISO BMFF demuxer: lazy metadata reading, per-track sample tables built on first
//! query, and incremental moof discovery for fragmented movies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};

use vessel_core::codecs::{AudioDecoderConfig, VideoDecoderConfig};
use vessel_core::errors::{decode_error, Result};
use vessel_core::io::{BufReader, MediaSource, RangeReader, RangeReaderOptions, ReadBytes};
use vessel_core::packet::{EncodedPacket, PacketKind, PacketSeq};
use vessel_core::sync::AsyncMutex;
use vessel_core::track::{InputTrack, PacketOptions, Rotation, TrackType};
use vessel_core::units::{
    binary_search_less_or_equal, ceil_to_micros, secs_to_micros, timescale_to_secs,
};

use crate::boxes::moof::{sample_flags_is_key, MfraBox, MoofBox, TfraEntry};
use crate::boxes::moov::{HandlerType, MoovBox, TrakBox};
use crate::boxes::stbl::{
    reject_stz2, ChunkOffsetBox, CttsBox, SampleSize, StscBox, StssBox, StszBox, SttsBox,
};
use crate::boxes::stsd::SampleEntry;
use crate::boxes::{BoxHeader, BoxIter, BoxType, ReadBox};

/// A run of samples sharing one decode-timestamp delta.
struct TimingRun {
    start_index: u32,
    start_dts: i64,
    count: u32,
    delta: u32,
}

/// A run of samples sharing one composition offset.
struct OffsetRun {
    start_index: u32,
    count: u32,
    offset: i32,
}

/// A run of chunks sharing one samples-per-chunk value, augmented with the index of its
/// first sample.
struct ChunkRun {
    first_chunk_index: u32,
    samples_per_chunk: u32,
    start_sample_index: u32,
}

/// Fully materialized sample lookup table of one non-fragmented track.
struct SampleTable {
    sample_count: u32,
    timings: Vec<TimingRun>,
    composition_offsets: Vec<OffsetRun>,
    sample_sizes: SampleSize,
    /// Zero-based sync sample indices; `None` means every sample is a sync sample.
    key_indices: Option<Vec<u32>>,
    chunk_offsets: Vec<u64>,
    chunk_runs: Vec<ChunkRun>,
    /// `(pts, sample index)` sorted by pts.
    presentation: Vec<(i64, u32)>,
}

impl SampleTable {
    /// Decode timestamp and duration of a sample.
    fn sample_timing(&self, index: u32) -> Option<(i64, u32)> {
        let run_idx = self
            .timings
            .partition_point(|run| run.start_index <= index)
            .checked_sub(1)?;
        let run = &self.timings[run_idx];

        if index >= run.start_index + run.count {
            return None;
        }

        let dts = run.start_dts + i64::from(index - run.start_index) * i64::from(run.delta);
        Some((dts, run.delta))
    }

    fn composition_offset(&self, index: u32) -> i32 {
        let run_idx =
            match self.composition_offsets.partition_point(|run| run.start_index <= index) {
                0 => return 0,
                idx => idx - 1,
            };
        let run = &self.composition_offsets[run_idx];

        if index >= run.start_index + run.count {
            return 0;
        }
        run.offset
    }

    fn sample_pts(&self, index: u32) -> Option<i64> {
        let (dts, _) = self.sample_timing(index)?;
        Some(dts + i64::from(self.composition_offset(index)))
    }

    fn sample_size(&self, index: u32) -> Option<u32> {
        match &self.sample_sizes {
            SampleSize::Constant(size) => Some(*size),
            SampleSize::Variable(sizes) => sizes.get(index as usize).copied(),
        }
    }

    fn sample_is_key(&self, index: u32) -> bool {
        match &self.key_indices {
            None => true,
            Some(keys) => keys.binary_search(&index).is_ok(),
        }
    }

    /// The byte position and size of a sample.
    fn sample_location(&self, index: u32) -> Option<(u64, u32)> {
        let run_idx = self
            .chunk_runs
            .partition_point(|run| run.start_sample_index <= index)
            .checked_sub(1)?;
        let run = &self.chunk_runs[run_idx];

        if run.samples_per_chunk == 0 {
            return None;
        }

        let chunk_rel = (index - run.start_sample_index) / run.samples_per_chunk;
        let chunk_index = run.first_chunk_index + chunk_rel;
        let chunk_first_sample = run.start_sample_index + chunk_rel * run.samples_per_chunk;

        let base = *self.chunk_offsets.get(chunk_index as usize)?;

        let mut offset = base;
        for i in chunk_first_sample..index {
            offset += u64::from(self.sample_size(i)?);
        }

        Some((offset, self.sample_size(index)?))
    }
}

/// One sample of a fragment, fully located.
#[derive(Copy, Clone)]
struct FragSample {
    dts: i64,
    pts: i64,
    duration: u32,
    pos: u64,
    size: u32,
    is_key: bool,
}

/// Per-track data of one fragment.
struct FragmentTrackData {
    samples: Vec<FragSample>,
    /// Sample indices ordered by presentation timestamp.
    presentation_order: Vec<u32>,
    start_ts: i64,
    end_ts: i64,
    /// False until the missing tfdt base has been recovered from a predecessor.
    start_ts_is_final: bool,
}

struct Fragment {
    moof_pos: u64,
    moof_len: u64,
    sequence: u32,
    /// Track id to per-track fragment data.
    tracks: HashMap<u32, FragmentTrackData>,
    data_start: u64,
    data_end: u64,
    /// Arena index of the fragment that follows this one in file order.
    next_fragment: Option<u32>,
}

/// Static per-track description captured at open time.
struct TrackInfo {
    id: u32,
    track_type: TrackType,
    timescale: u32,
    /// Declared media duration in track timescale ticks; 0 or all-ones when unknown.
    media_duration: u64,
    language: Option<String>,
    rotation: Rotation,
    video_config: Option<VideoDecoderConfig>,
    audio_config: Option<AudioDecoderConfig>,
    stbl_pos: u64,
    stbl_end: u64,
    /// Movie-extends default sample duration for fragment runs.
    trex_default_duration: u32,
    trex_default_size: u32,
    trex_default_flags: u32,
}

struct DemuxState {
    reader: RangeReader,
    file_len: u64,
    fragmented: bool,
    /// Lazily built sample tables, one slot per track.
    tables: Vec<Option<SampleTable>>,
    /// Fragment arena in insertion order; indices are stable.
    fragments: Vec<Fragment>,
    /// Arena indices sorted by moof position.
    fragments_by_pos: Vec<u32>,
    /// Next top-level scan position for sequential moof discovery.
    next_scan_pos: u64,
    /// Random-access entries per track id, from the mfra box.
    fragment_lookup: HashMap<u32, Vec<TfraEntry>>,
    /// Movie-extends defaults per track id: duration, size, flags.
    trex_defaults: HashMap<u32, (u32, u32, u32)>,
}

struct DemuxShared {
    /// Serializes fragment discovery and lazy table builds.
    state: AsyncMutex<DemuxState>,
    tracks: Vec<TrackInfo>,
}

/// ISO BMFF demuxer.
pub struct Mp4Demuxer {
    shared: Arc<DemuxShared>,
}

impl Mp4Demuxer {
    /// Open a movie: walk the top-level boxes, parse the movie header, and load the
    /// random-access index of fragmented files. Sample tables are not built yet.
    pub async fn open(source: Box<dyn MediaSource>) -> Result<Mp4Demuxer> {
        Self::open_with(source, RangeReaderOptions::default()).await
    }

    pub async fn open_with(
        source: Box<dyn MediaSource>,
        options: RangeReaderOptions,
    ) -> Result<Mp4Demuxer> {
        let mut reader = RangeReader::new(source, options);
        let file_len = reader.source_len().await?;

        let mut moov: Option<MoovBox> = None;

        // Walk the top-level boxes until the movie box is found. Only box headers are
        // loaded; payloads load on demand.
        let mut pos = 0u64;
        while pos + u64::from(BoxHeader::HEADER_SIZE) <= file_len {
            let header_bytes =
                reader.fetch(pos, (pos + u64::from(BoxHeader::LARGE_HEADER_SIZE)).min(file_len)).await?;
            let mut br = BufReader::new_at(&header_bytes, pos);
            let header = BoxHeader::read(&mut br)?;

            match header.box_type() {
                BoxType::Movie => {
                    let len = match header.box_len() {
                        Some(len) => len,
                        None => file_len - pos,
                    };
                    let moov_bytes = reader.fetch(pos, pos + len).await?;
                    let mut br = BufReader::new_at(&moov_bytes, pos);
                    let header = BoxHeader::read(&mut br)?;
                    moov = Some(MoovBox::read(&mut br, header)?);
                    break;
                }
                BoxType::FileType | BoxType::Free | BoxType::Skip | BoxType::MediaData
                | BoxType::MovieFragment => (),
                other => debug!("skipping top-level box {:?}", other),
            }

            pos = match header.box_len() {
                Some(len) => header.box_pos() + len,
                None => break,
            };
        }

        let moov = match moov {
            Some(moov) => moov,
            None => return decode_error("isomp4: missing moov box"),
        };

        let fragmented = moov.is_fragmented();
        info!("opened movie with {} tracks, fragmented={}", moov.traks.len(), fragmented);

        let mut tracks = Vec::new();
        for trak in &moov.traks {
            match make_track_info(trak, &moov) {
                Some(info) => tracks.push(info),
                None => warn!("skipping track {} with unsupported media", trak.tkhd.id),
            }
        }

        // Fragmented movies keep a sync-sample index at the tail: the last sixteen
        // bytes are an mfro box pointing back at the mfra.
        let mut fragment_lookup = HashMap::new();
        if fragmented && file_len >= 16 {
            match read_mfra(&mut reader, file_len).await {
                Ok(Some(mfra)) => {
                    for tfra in mfra.tfras {
                        fragment_lookup.insert(tfra.track_id, tfra.entries);
                    }
                }
                Ok(None) => (),
                Err(err) => warn!("ignoring unreadable mfra: {}", err),
            }
        }

        let table_slots = tracks.len();
        let trex_defaults = tracks
            .iter()
            .map(|t| (t.id, (t.trex_default_duration, t.trex_default_size, t.trex_default_flags)))
            .collect();

        Ok(Mp4Demuxer {
            shared: Arc::new(DemuxShared {
                state: AsyncMutex::new(DemuxState {
                    reader,
                    file_len,
                    fragmented,
                    tables: (0..table_slots).map(|_| None).collect(),
                    fragments: Vec::new(),
                    fragments_by_pos: Vec::new(),
                    next_scan_pos: 0,
                    fragment_lookup,
                    trex_defaults,
                }),
                tracks,
            }),
        })
    }

    /// The tracks of the movie, as shareable handles.
    pub fn tracks(&self) -> Vec<Arc<dyn InputTrack>> {
        (0..self.shared.tracks.len())
            .map(|track_index| {
                Arc::new(Mp4Track { shared: self.shared.clone(), track_index })
                    as Arc<dyn InputTrack>
            })
            .collect()
    }

    /// The first track of the given type, if any.
    pub fn primary_track(&self, track_type: TrackType) -> Option<Arc<dyn InputTrack>> {
        self.shared
            .tracks
            .iter()
            .position(|t| t.track_type == track_type)
            .map(|track_index| {
                Arc::new(Mp4Track { shared: self.shared.clone(), track_index })
                    as Arc<dyn InputTrack>
            })
    }
}

async fn read_mfra(reader: &mut RangeReader, file_len: u64) -> Result<Option<MfraBox>> {
    let tail = reader.fetch(file_len - 16, file_len).await?;
    let mut br = BufReader::new_at(&tail, file_len - 16);
    let header = BoxHeader::read(&mut br)?;

    if header.box_type() != BoxType::MovieFragmentRandomAccessOffset {
        return Ok(None);
    }

    // Skip version and flags, then the stated mfra size.
    br.ignore_bytes(4)?;
    let mfra_len = u64::from(br.read_be_u32()?);
    if mfra_len > file_len {
        return decode_error("isomp4 (mfro): mfra size exceeds the file");
    }

    let mfra_pos = file_len - mfra_len;
    let bytes = reader.fetch(mfra_pos, file_len).await?;
    let mut br = BufReader::new_at(&bytes, mfra_pos);
    let header = BoxHeader::read(&mut br)?;

    if header.box_type() != BoxType::MovieFragmentRandomAccess {
        return decode_error("isomp4 (mfro): offset does not point at an mfra");
    }

    Ok(Some(MfraBox::read(&mut br, header)?))
}

fn make_track_info(trak: &TrakBox, moov: &MoovBox) -> Option<TrackInfo> {
    let (track_type, video_config, audio_config) = match (&trak.handler, &trak.stsd.entry) {
        (HandlerType::Video, Some(SampleEntry::Video(entry))) => (
            TrackType::Video,
            Some(VideoDecoderConfig {
                codec: entry.codec,
                coded_width: entry.width,
                coded_height: entry.height,
                description: entry.description.clone(),
                color_space: entry.color_space,
            }),
            None,
        ),
        (HandlerType::Sound, Some(SampleEntry::Audio(entry))) => (
            TrackType::Audio,
            None,
            Some(AudioDecoderConfig {
                codec: entry.codec,
                sample_rate: entry.sample_rate,
                channel_count: entry.channel_count,
                description: entry.description.clone(),
            }),
        ),
        (HandlerType::Subtitle, Some(SampleEntry::Subtitle(_))) => {
            (TrackType::Subtitle, None, None)
        }
        _ => return None,
    };

    let trex = moov
        .mvex
        .as_ref()
        .and_then(|mvex| mvex.trexs.iter().find(|t| t.track_id == trak.tkhd.id));

    Some(TrackInfo {
        id: trak.tkhd.id,
        track_type,
        timescale: trak.mdhd.timescale,
        media_duration: trak.mdhd.duration,
        language: trak.mdhd.language.clone(),
        rotation: Rotation::from_matrix(&trak.tkhd.matrix),
        video_config,
        audio_config,
        stbl_pos: trak.stbl_pos,
        stbl_end: trak.stbl_end,
        trex_default_duration: trex.map(|t| t.default_sample_duration).unwrap_or(0),
        trex_default_size: trex.map(|t| t.default_sample_size).unwrap_or(0),
        trex_default_flags: trex.map(|t| t.default_sample_flags).unwrap_or(0),
    })
}

/// A fully located sample, ready to be turned into a packet.
#[derive(Copy, Clone)]
struct Located {
    pts: i64,
    duration: u32,
    pos: u64,
    size: u32,
    is_key: bool,
}

/// A single track handle; all lookups serialize through the demuxer mutex.
struct Mp4Track {
    shared: Arc<DemuxShared>,
    track_index: usize,
}

impl Mp4Track {
    fn info(&self) -> &TrackInfo {
        &self.shared.tracks[self.track_index]
    }

    async fn make_packet(
        &self,
        state: &mut DemuxState,
        seq: PacketSeq,
        located: Located,
        options: PacketOptions,
    ) -> Result<EncodedPacket> {
        let timescale = self.info().timescale;
        let timestamp = secs_to_micros(timescale_to_secs(located.pts, timescale));
        let duration =
            secs_to_micros(timescale_to_secs(i64::from(located.duration), timescale));
        let kind = if located.is_key { PacketKind::Key } else { PacketKind::Delta };

        let data: Box<[u8]> = if options.metadata_only {
            Box::default()
        }
        else {
            state
                .reader
                .fetch(located.pos, located.pos + u64::from(located.size))
                .await?
                .into()
        };

        let mut packet = EncodedPacket::new(data, timestamp, duration, kind, seq);
        packet.byte_length = u64::from(located.size);
        Ok(packet)
    }

    async fn table_packet(
        &self,
        state: &mut DemuxState,
        index: u32,
        options: PacketOptions,
    ) -> Result<Option<EncodedPacket>> {
        build_table(state, self.info(), self.track_index).await?;
        let table = state.tables[self.track_index].as_ref().unwrap();

        if index >= table.sample_count {
            return Ok(None);
        }

        let (dts, duration) = match table.sample_timing(index) {
            Some(timing) => timing,
            None => return Ok(None),
        };
        let pts = dts + i64::from(table.composition_offset(index));
        let (pos, size) = match table.sample_location(index) {
            Some(location) => location,
            None => return decode_error("isomp4: sample has no chunk location"),
        };
        let is_key = table.sample_is_key(index);

        let seq = PacketSeq::new(PacketSeq::WHOLE_MOVIE, index);
        let located = Located { pts, duration, pos, size, is_key };
        self.make_packet(state, seq, located, options).await.map(Some)
    }

    async fn fragment_packet(
        &self,
        state: &mut DemuxState,
        fragment_idx: u32,
        sample_idx: u32,
        options: PacketOptions,
    ) -> Result<Option<EncodedPacket>> {
        let track_id = self.info().id;
        let sample = {
            let fragment = &state.fragments[fragment_idx as usize];
            let data = match fragment.tracks.get(&track_id) {
                Some(data) => data,
                None => return Ok(None),
            };
            match data.samples.get(sample_idx as usize) {
                Some(sample) => *sample,
                None => return Ok(None),
            }
        };

        let seq = PacketSeq::new(fragment_idx, sample_idx);
        let located = Located {
            pts: sample.pts,
            duration: sample.duration,
            pos: sample.pos,
            size: sample.size,
            is_key: sample.is_key,
        };
        self.make_packet(state, seq, located, options).await.map(Some)
    }

    /// Locate the sample with the greatest pts at or before `ts` among the loaded
    /// fragments, reading more fragments while they could still contain one.
    async fn fragment_lookup(
        &self,
        state: &mut DemuxState,
        ts: i64,
    ) -> Result<Option<(u32, u32)>> {
        let track_id = self.info().id;

        // Seed the scan with the random-access index when available.
        let hint = state.fragment_lookup.get(&track_id).and_then(|entries| {
            binary_search_less_or_equal(entries, ts as f64, |e| e.time as f64)
                .map(|idx| entries[idx].moof_offset)
        });
        if let Some(moof_offset) = hint {
            ensure_fragment_at(state, moof_offset).await?;
        }

        loop {
            let best = self.best_loaded_sample(state, ts);

            // A hit strictly inside a fragment is final; a hit at the tail may still be
            // superseded by a later fragment starting at or before ts.
            if let Some((fragment_idx, sample_idx)) = best {
                let fragment = &state.fragments[fragment_idx as usize];
                let data = &fragment.tracks[&track_id];
                if ts < data.end_ts {
                    return Ok(Some((fragment_idx, sample_idx)));
                }
            }

            match read_next_fragment(state).await? {
                Some(new_idx) => {
                    let fragment = &state.fragments[new_idx as usize];
                    if let Some(data) = fragment.tracks.get(&track_id) {
                        if data.start_ts > ts {
                            // Fragments are time-ordered in practice; nothing later can
                            // contain an earlier sample.
                            return Ok(self.best_loaded_sample(state, ts));
                        }
                    }
                }
                None => return Ok(self.best_loaded_sample(state, ts)),
            }
        }
    }

    fn best_loaded_sample(&self, state: &DemuxState, ts: i64) -> Option<(u32, u32)> {
        let track_id = self.info().id;
        let mut best: Option<(i64, u32, u32)> = None;

        for &arena_idx in &state.fragments_by_pos {
            let fragment = &state.fragments[arena_idx as usize];
            let data = match fragment.tracks.get(&track_id) {
                Some(data) => data,
                None => continue,
            };
            if data.start_ts > ts {
                continue;
            }

            let hit = binary_search_less_or_equal(&data.presentation_order, ts as f64, |&i| {
                data.samples[i as usize].pts as f64
            });

            if let Some(order_idx) = hit {
                let sample_idx = data.presentation_order[order_idx];
                let pts = data.samples[sample_idx as usize].pts;
                match best {
                    Some((best_pts, _, _)) if best_pts >= pts => (),
                    _ => best = Some((pts, arena_idx, sample_idx)),
                }
            }
        }

        best.map(|(_, fragment, sample)| (fragment, sample))
    }
}

#[async_trait]
impl InputTrack for Mp4Track {
    fn id(&self) -> u32 {
        self.info().id
    }

    fn track_type(&self) -> TrackType {
        self.info().track_type
    }

    fn time_scale(&self) -> u32 {
        self.info().timescale
    }

    fn language(&self) -> Option<String> {
        self.info().language.clone()
    }

    fn rotation(&self) -> Rotation {
        self.info().rotation
    }

    fn video_config(&self) -> Option<VideoDecoderConfig> {
        self.info().video_config.clone()
    }

    fn audio_config(&self) -> Option<AudioDecoderConfig> {
        self.info().audio_config.clone()
    }

    async fn compute_duration(&self) -> Result<f64> {
        let mut state = self.shared.state.lock().await;
        let state = &mut *state;
        let timescale = self.info().timescale;

        if !state.fragmented {
            // The declared media duration accounts for presentation reordering; fall
            // back to the sample table when the container left it unset.
            let declared = self.info().media_duration;
            if declared != 0 && declared != u64::MAX {
                return Ok(timescale_to_secs(declared as i64, timescale));
            }

            build_table(state, self.info(), self.track_index).await?;
            let table = state.tables[self.track_index].as_ref().unwrap();

            let end = table
                .presentation
                .last()
                .and_then(|&(_, index)| {
                    let (dts, duration) = table.sample_timing(index)?;
                    Some(dts + i64::from(table.composition_offset(index)) + i64::from(duration))
                })
                .unwrap_or(0);
            return Ok(timescale_to_secs(end, timescale));
        }

        // Fragmented: read every remaining fragment, then take the latest end.
        while read_next_fragment(state).await?.is_some() {}

        let track_id = self.info().id;
        let end = state
            .fragments
            .iter()
            .filter_map(|f| f.tracks.get(&track_id))
            .map(|d| d.end_ts)
            .max()
            .unwrap_or(0);
        Ok(timescale_to_secs(end, timescale))
    }

    async fn first_packet(&self, options: PacketOptions) -> Result<Option<EncodedPacket>> {
        let mut state = self.shared.state.lock().await;
        let state = &mut *state;

        if !state.fragmented {
            return self.table_packet(state, 0, options).await;
        }

        // The first packet lives in the file-order first fragment carrying this track.
        // Fragments may have been loaded out of order through the random-access index,
        // so the sequential scan must cover everything before a candidate counts.
        let track_id = self.info().id;
        loop {
            let candidate = state
                .fragments_by_pos
                .iter()
                .map(|&i| &state.fragments[i as usize])
                .find(|f| f.tracks.contains_key(&track_id))
                .map(|f| f.moof_pos);

            if let Some(pos) = candidate {
                if pos < state.next_scan_pos {
                    let arena_idx = state
                        .fragments
                        .iter()
                        .position(|f| f.moof_pos == pos)
                        .unwrap() as u32;
                    return self.fragment_packet(state, arena_idx, 0, options).await;
                }
            }

            if read_next_fragment(state).await?.is_none() {
                return Ok(None);
            }
        }
    }

    async fn packet_at(
        &self,
        time_secs: f64,
        options: PacketOptions,
    ) -> Result<Option<EncodedPacket>> {
        let mut state = self.shared.state.lock().await;
        let state = &mut *state;

        let ts = ts_for_query(time_secs, self.info().timescale);

        if !state.fragmented {
            build_table(state, self.info(), self.track_index).await?;
            let table = state.tables[self.track_index].as_ref().unwrap();

            let hit = binary_search_less_or_equal(&table.presentation, ts as f64, |&(pts, _)| {
                pts as f64
            });
            let index = match hit {
                Some(order_idx) => table.presentation[order_idx].1,
                None => return Ok(None),
            };
            return self.table_packet(state, index, options).await;
        }

        match self.fragment_lookup(state, ts).await? {
            Some((fragment_idx, sample_idx)) => {
                self.fragment_packet(state, fragment_idx, sample_idx, options).await
            }
            None => Ok(None),
        }
    }

    async fn next_packet(
        &self,
        prev: &EncodedPacket,
        options: PacketOptions,
    ) -> Result<Option<EncodedPacket>> {
        let mut state = self.shared.state.lock().await;
        let state = &mut *state;

        if prev.seq.segment == PacketSeq::WHOLE_MOVIE {
            return self.table_packet(state, prev.seq.index + 1, options).await;
        }

        let track_id = self.info().id;
        let mut fragment_idx = prev.seq.segment;

        // Advance within the fragment first, then along the file-order chain.
        {
            let fragment = &state.fragments[fragment_idx as usize];
            if let Some(data) = fragment.tracks.get(&track_id) {
                if (prev.seq.index + 1) < data.samples.len() as u32 {
                    return self
                        .fragment_packet(state, fragment_idx, prev.seq.index + 1, options)
                        .await;
                }
            }
        }

        loop {
            match state.fragments[fragment_idx as usize].next_fragment {
                Some(next) => {
                    if state.fragments[next as usize].tracks.contains_key(&track_id) {
                        return self.fragment_packet(state, next, 0, options).await;
                    }
                    fragment_idx = next;
                }
                None => {
                    // Scanning may load a fragment anywhere in the file; the successor
                    // link of the current fragment is re-checked rather than assuming
                    // the scanned fragment follows it.
                    if read_next_fragment(state).await?.is_none() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn key_packet_at(
        &self,
        time_secs: f64,
        options: PacketOptions,
    ) -> Result<Option<EncodedPacket>> {
        let mut state = self.shared.state.lock().await;
        let state = &mut *state;

        let ts = ts_for_query(time_secs, self.info().timescale);

        if !state.fragmented {
            build_table(state, self.info(), self.track_index).await?;
            let table = state.tables[self.track_index].as_ref().unwrap();

            let index = match &table.key_indices {
                None => {
                    // Every sample is a key; this is a plain timestamp lookup.
                    let hit = binary_search_less_or_equal(
                        &table.presentation,
                        ts as f64,
                        |&(pts, _)| pts as f64,
                    );
                    match hit {
                        Some(order_idx) => table.presentation[order_idx].1,
                        None => return Ok(None),
                    }
                }
                Some(keys) => {
                    // Key samples have non-decreasing pts, so their pts order follows
                    // their index order.
                    let hit = binary_search_less_or_equal(keys, ts as f64, |&key| {
                        table.sample_pts(key).unwrap_or(i64::MIN) as f64
                    });
                    match hit {
                        Some(key_idx) => keys[key_idx],
                        None => return Ok(None),
                    }
                }
            };
            return self.table_packet(state, index, options).await;
        }

        let (fragment_idx, sample_idx) = match self.fragment_lookup(state, ts).await? {
            Some(hit) => hit,
            None => return Ok(None),
        };

        // Walk backwards in presentation order until a sync sample.
        let track_id = self.info().id;
        let key = {
            let data = &state.fragments[fragment_idx as usize].tracks[&track_id];
            let order_pos = data
                .presentation_order
                .iter()
                .position(|&i| i == sample_idx)
                .unwrap_or(0);
            data.presentation_order[..=order_pos]
                .iter()
                .rev()
                .copied()
                .find(|&i| data.samples[i as usize].is_key)
        };

        match key {
            Some(key_idx) => self.fragment_packet(state, fragment_idx, key_idx, options).await,
            None => Ok(None),
        }
    }

    async fn next_key_packet(
        &self,
        prev: &EncodedPacket,
        options: PacketOptions,
    ) -> Result<Option<EncodedPacket>> {
        let mut state = self.shared.state.lock().await;
        let state = &mut *state;

        if prev.seq.segment == PacketSeq::WHOLE_MOVIE {
            build_table(state, self.info(), self.track_index).await?;
            let table = state.tables[self.track_index].as_ref().unwrap();

            let index = match &table.key_indices {
                None => prev.seq.index + 1,
                Some(keys) => {
                    let pos = keys.partition_point(|&key| key <= prev.seq.index);
                    match keys.get(pos) {
                        Some(&key) => key,
                        None => return Ok(None),
                    }
                }
            };
            return self.table_packet(state, index, options).await;
        }

        // Forward walk: first inside the fragment, then along the chain.
        let track_id = self.info().id;
        let mut fragment_idx = prev.seq.segment;
        let mut from_sample = prev.seq.index + 1;

        loop {
            let key = {
                let fragment = &state.fragments[fragment_idx as usize];
                fragment.tracks.get(&track_id).and_then(|data| {
                    (from_sample..data.samples.len() as u32)
                        .find(|&i| data.samples[i as usize].is_key)
                })
            };

            if let Some(key_idx) = key {
                return self.fragment_packet(state, fragment_idx, key_idx, options).await;
            }

            match state.fragments[fragment_idx as usize].next_fragment {
                Some(next) => {
                    fragment_idx = next;
                    from_sample = 0;
                }
                None => {
                    if read_next_fragment(state).await?.is_none() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Snap a query time onto the microsecond grid, then convert it to timescale ticks.
/// The tick conversion rounds to nearest so a timestamp previously reported by the
/// library (one rounding away from the exact tick) maps back onto the tick it came
/// from.
fn ts_for_query(time_secs: f64, timescale: u32) -> i64 {
    (ceil_to_micros(time_secs) * f64::from(timescale)).round() as i64
}

/// Build the sample lookup table of a non-fragmented track from its stbl range.
async fn build_table(state: &mut DemuxState, info: &TrackInfo, track_index: usize) -> Result<()> {
    if state.tables[track_index].is_some() {
        return Ok(());
    }

    let bytes = state.reader.fetch(info.stbl_pos, info.stbl_end).await?;
    let mut br = BufReader::new_at(&bytes, info.stbl_pos);
    let header = BoxHeader::read(&mut br)?;

    let mut stts: Option<SttsBox> = None;
    let mut ctts: Option<CttsBox> = None;
    let mut stsz: Option<StszBox> = None;
    let mut stss: Option<StssBox> = None;
    let mut stsc: Option<StscBox> = None;
    let mut offsets: Option<ChunkOffsetBox> = None;

    let mut iter = BoxIter::new_in(&mut br, &header);

    while let Some(child) = iter.next()? {
        match child.box_type() {
            BoxType::TimeToSample => stts = Some(iter.read_box(child)?),
            BoxType::CompositionTimeToSample => ctts = Some(iter.read_box(child)?),
            BoxType::SampleSize => stsz = Some(iter.read_box(child)?),
            BoxType::SampleSizeCompact => return reject_stz2(),
            BoxType::SyncSample => stss = Some(iter.read_box(child)?),
            BoxType::SampleToChunk => stsc = Some(iter.read_box(child)?),
            BoxType::ChunkOffset => {
                offsets = Some(ChunkOffsetBox::read_stco(iter.inner_mut(), child)?)
            }
            BoxType::ChunkOffset64 => {
                offsets = Some(ChunkOffsetBox::read_co64(iter.inner_mut(), child)?)
            }
            _ => (),
        }
    }

    let stts = stts.unwrap_or_default();
    let stsz = stsz.unwrap_or_default();
    let stsc = stsc.unwrap_or_default();
    let chunk_offsets = offsets.unwrap_or_default().chunk_offsets;

    let sample_count = stsz.sample_count;

    // Materialize the run-length timing entries with absolute start indices and
    // decode timestamps.
    let mut timings = Vec::with_capacity(stts.entries.len());
    let mut index = 0u32;
    let mut dts = 0i64;
    for entry in &stts.entries {
        timings.push(TimingRun {
            start_index: index,
            start_dts: dts,
            count: entry.sample_count,
            delta: entry.sample_delta,
        });
        index += entry.sample_count;
        dts += i64::from(entry.sample_count) * i64::from(entry.sample_delta);
    }

    let mut composition_offsets = Vec::new();
    if let Some(ctts) = ctts {
        let mut index = 0u32;
        for entry in &ctts.entries {
            composition_offsets.push(OffsetRun {
                start_index: index,
                count: entry.sample_count,
                offset: entry.sample_offset,
            });
            index += entry.sample_count;
        }
    }

    // Sync sample indices arrive one-based.
    let key_indices = stss.map(|stss| {
        stss.sample_numbers.iter().map(|&n| n.saturating_sub(1)).collect::<Vec<u32>>()
    });

    // Augment the sample-to-chunk runs with their starting sample index.
    let mut chunk_runs: Vec<ChunkRun> = Vec::with_capacity(stsc.entries.len());
    let mut start_sample = 0u32;
    for (i, entry) in stsc.entries.iter().enumerate() {
        let first_chunk_index = entry.first_chunk - 1;

        chunk_runs.push(ChunkRun {
            first_chunk_index,
            samples_per_chunk: entry.samples_per_chunk,
            start_sample_index: start_sample,
        });

        let run_chunks = match stsc.entries.get(i + 1) {
            Some(next) => next.first_chunk - entry.first_chunk,
            None => (chunk_offsets.len() as u32).saturating_sub(first_chunk_index),
        };
        start_sample += run_chunks * entry.samples_per_chunk;
    }

    let mut table = SampleTable {
        sample_count,
        timings,
        composition_offsets,
        sample_sizes: stsz.sample_sizes,
        key_indices,
        chunk_offsets,
        chunk_runs,
        presentation: Vec::new(),
    };

    // Finally, the pts-ordered index over all samples.
    let mut presentation = Vec::with_capacity(sample_count as usize);
    for index in 0..sample_count {
        if let Some(pts) = table.sample_pts(index) {
            presentation.push((pts, index));
        }
    }
    presentation.sort_by_key(|&(pts, _)| pts);
    table.presentation = presentation;

    debug!(
        "built sample table for track {}: {} samples, {} chunks",
        info.id,
        sample_count,
        table.chunk_offsets.len()
    );

    state.tables[track_index] = Some(table);
    Ok(())
}

/// Ensure the fragment whose moof starts at `moof_offset` is loaded.
async fn ensure_fragment_at(state: &mut DemuxState, moof_offset: u64) -> Result<()> {
    if state.fragments.iter().any(|f| f.moof_pos == moof_offset) {
        return Ok(());
    }

    read_fragment_at(state, moof_offset).await?;
    Ok(())
}

/// Scan forward from the sequential scan position and read the next moof. Returns the
/// arena index of the new fragment.
async fn read_next_fragment(state: &mut DemuxState) -> Result<Option<u32>> {
    loop {
        let pos = state.next_scan_pos;
        if pos + u64::from(BoxHeader::HEADER_SIZE) > state.file_len {
            return Ok(None);
        }

        let header_bytes = state
            .reader
            .fetch(pos, (pos + u64::from(BoxHeader::LARGE_HEADER_SIZE)).min(state.file_len))
            .await?;
        let mut br = BufReader::new_at(&header_bytes, pos);
        let header = BoxHeader::read(&mut br)?;

        let next = match header.box_len() {
            Some(len) => pos + len,
            None => state.file_len,
        };

        if header.box_type() == BoxType::MovieFragment {
            // Skip fragments already loaded through the random-access index.
            if state.fragments.iter().any(|f| f.moof_pos == pos) {
                state.next_scan_pos = next;
                continue;
            }

            let idx = read_fragment_at(state, pos).await?;
            state.next_scan_pos = next;
            return Ok(Some(idx));
        }

        state.next_scan_pos = next;
    }
}

/// Read and index one moof at a known offset.
async fn read_fragment_at(state: &mut DemuxState, moof_offset: u64) -> Result<u32> {
    let header_bytes = state
        .reader
        .fetch(moof_offset, (moof_offset + u64::from(BoxHeader::LARGE_HEADER_SIZE)).min(state.file_len))
        .await?;
    let mut br = BufReader::new_at(&header_bytes, moof_offset);
    let header = BoxHeader::read(&mut br)?;

    if header.box_type() != BoxType::MovieFragment {
        return decode_error("isomp4: expected a moof box");
    }
    let moof_len = match header.box_len() {
        Some(len) => len,
        None => return decode_error("isomp4 (moof): unsized moof"),
    };

    let bytes = state.reader.fetch(moof_offset, moof_offset + moof_len).await?;
    let mut br = BufReader::new_at(&bytes, moof_offset);
    let header = BoxHeader::read(&mut br)?;
    let moof = MoofBox::read(&mut br, header)?;

    let fragment = index_fragment(state, moof)?;

    let arena_idx = state.fragments.len() as u32;
    state.fragments.push(fragment);

    // Keep the by-position order and the file-order chain.
    let pos_idx = state
        .fragments_by_pos
        .partition_point(|&i| state.fragments[i as usize].moof_pos < moof_offset);
    state.fragments_by_pos.insert(pos_idx, arena_idx);

    if pos_idx > 0 {
        let pred = state.fragments_by_pos[pos_idx - 1];
        state.fragments[pred as usize].next_fragment = Some(arena_idx);
    }
    if pos_idx + 1 < state.fragments_by_pos.len() {
        let succ = state.fragments_by_pos[pos_idx + 1];
        state.fragments[arena_idx as usize].next_fragment = Some(succ);
    }

    resolve_start_timestamps(state);

    let fragment = &state.fragments[arena_idx as usize];
    debug!(
        "indexed fragment {} at {} ({} bytes, data [{}, {}))",
        fragment.sequence, fragment.moof_pos, fragment.moof_len, fragment.data_start,
        fragment.data_end
    );

    Ok(arena_idx)
}

/// Turn a parsed moof into a located fragment.
fn index_fragment(state: &DemuxState, moof: MoofBox) -> Result<Fragment> {
    let mut tracks = HashMap::new();
    let mut data_start = u64::MAX;
    let mut data_end = 0u64;

    for traf in &moof.trafs {
        // Resolve the anchor: an explicit base offset, or the start of the moof.
        let base = traf.tfhd.base_data_offset.unwrap_or(moof.moof_pos);

        let defaults = state
            .trex_defaults
            .get(&traf.tfhd.track_id)
            .copied()
            .unwrap_or((0, 0, 0));
        let default_duration = traf.tfhd.default_sample_duration.unwrap_or(defaults.0);
        let default_size = traf.tfhd.default_sample_size.unwrap_or(defaults.1);
        let default_flags = traf.tfhd.default_sample_flags.unwrap_or(defaults.2);

        let mut samples = Vec::new();
        let mut dts = traf.tfdt.as_ref().map(|t| t.base_media_decode_time as i64).unwrap_or(0);
        let start_ts_is_final = traf.tfdt.is_some();

        let mut run_pos = base;

        for trun in &traf.truns {
            let mut pos = match trun.data_offset {
                Some(offset) => {
                    if offset.is_negative() {
                        base - u64::from(offset.unsigned_abs())
                    }
                    else {
                        base + offset as u64
                    }
                }
                None => run_pos,
            };

            for i in 0..trun.sample_count as usize {
                let duration =
                    trun.sample_durations.get(i).copied().unwrap_or(default_duration);
                let size = trun.sample_sizes.get(i).copied().unwrap_or(default_size);

                let flags = if i == 0 {
                    trun.first_sample_flags
                        .or_else(|| trun.sample_flags.first().copied())
                        .unwrap_or(default_flags)
                }
                else {
                    trun.sample_flags.get(i).copied().unwrap_or(default_flags)
                };

                let offset =
                    trun.sample_composition_time_offsets.get(i).copied().unwrap_or(0);

                samples.push(FragSample {
                    dts,
                    pts: dts + i64::from(offset),
                    duration,
                    pos,
                    size,
                    is_key: sample_flags_is_key(flags),
                });

                data_start = data_start.min(pos);
                data_end = data_end.max(pos + u64::from(size));

                dts += i64::from(duration);
                pos += u64::from(size);
            }

            run_pos = pos;
        }

        if samples.is_empty() {
            continue;
        }

        let mut presentation_order: Vec<u32> = (0..samples.len() as u32).collect();
        presentation_order.sort_by_key(|&i| samples[i as usize].pts);

        let start_ts = samples.iter().map(|s| s.pts).min().unwrap_or(0);
        let end_ts = samples.iter().map(|s| s.pts + i64::from(s.duration)).max().unwrap_or(0);

        tracks.insert(
            traf.tfhd.track_id,
            FragmentTrackData { samples, presentation_order, start_ts, end_ts, start_ts_is_final },
        );
    }

    if data_start == u64::MAX {
        data_start = moof.moof_pos;
    }

    Ok(Fragment {
        moof_pos: moof.moof_pos,
        moof_len: moof.moof_len,
        sequence: moof.sequence_number,
        tracks,
        data_start,
        data_end,
        next_fragment: None,
    })
}

/// Resolve fragments whose track data lacked a tfdt: their timestamps are offset by the
/// end of the closest finalized predecessor of the same track.
fn resolve_start_timestamps(state: &mut DemuxState) {
    for pos_idx in 0..state.fragments_by_pos.len() {
        let arena_idx = state.fragments_by_pos[pos_idx] as usize;

        let track_ids: Vec<u32> = state.fragments[arena_idx]
            .tracks
            .iter()
            .filter(|(_, data)| !data.start_ts_is_final)
            .map(|(&id, _)| id)
            .collect();

        for track_id in track_ids {
            // Walk back to a finalized predecessor carrying the same track.
            let mut base: Option<i64> = None;
            for back in (0..pos_idx).rev() {
                let pred = &state.fragments[state.fragments_by_pos[back] as usize];
                if let Some(data) = pred.tracks.get(&track_id) {
                    if data.start_ts_is_final {
                        base = Some(data.end_ts);
                        break;
                    }
                    // An unresolved predecessor blocks this fragment too.
                    base = None;
                    break;
                }
            }

            let offset = match base {
                Some(end) => end,
                None if pos_idx == 0 => {
                    warn!(
                        "fragment at {} lacks a tfdt; assuming it starts at zero",
                        state.fragments[arena_idx].moof_pos
                    );
                    0
                }
                None => continue,
            };

            let data = state.fragments[arena_idx].tracks.get_mut(&track_id).unwrap();
            for sample in data.samples.iter_mut() {
                sample.dts += offset;
                sample.pts += offset;
            }
            data.start_ts += offset;
            data.end_ts += offset;
            data.start_ts_is_final = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_core::io::BufferSource;
    use vessel_core::units::micros_to_secs;

    fn table() -> SampleTable {
        SampleTable {
            sample_count: 5,
            timings: vec![
                TimingRun { start_index: 0, start_dts: 0, count: 2, delta: 100 },
                TimingRun { start_index: 2, start_dts: 200, count: 3, delta: 200 },
            ],
            composition_offsets: vec![OffsetRun { start_index: 1, count: 2, offset: 50 }],
            sample_sizes: SampleSize::Variable(vec![10, 20, 30, 40, 50]),
            key_indices: Some(vec![0, 3]),
            chunk_offsets: vec![1_000, 2_000],
            chunk_runs: vec![ChunkRun {
                first_chunk_index: 0,
                samples_per_chunk: 3,
                start_sample_index: 0,
            }],
            presentation: Vec::new(),
        }
    }

    #[test]
    fn verify_sample_timing_lookup() {
        let table = table();

        assert_eq!(table.sample_timing(0), Some((0, 100)));
        assert_eq!(table.sample_timing(1), Some((100, 100)));
        assert_eq!(table.sample_timing(2), Some((200, 200)));
        assert_eq!(table.sample_timing(4), Some((600, 200)));
        assert_eq!(table.sample_timing(5), None);

        assert_eq!(table.composition_offset(0), 0);
        assert_eq!(table.composition_offset(1), 50);
        assert_eq!(table.composition_offset(2), 50);
        assert_eq!(table.composition_offset(3), 0);
        assert_eq!(table.sample_pts(1), Some(150));
    }

    #[test]
    fn verify_sample_location() {
        let table = table();

        // Three-sample chunk runs split the five samples over two chunks; offsets
        // accumulate the sizes of the chunk's earlier samples.
        assert_eq!(table.sample_location(0), Some((1_000, 10)));
        assert_eq!(table.sample_location(1), Some((1_010, 20)));
        assert_eq!(table.sample_location(2), Some((1_030, 30)));
        assert_eq!(table.sample_location(3), Some((2_000, 40)));
        assert_eq!(table.sample_location(4), Some((2_040, 50)));
    }

    #[test]
    fn verify_key_sample_lookup() {
        let table = table();

        assert!(table.sample_is_key(0));
        assert!(!table.sample_is_key(1));
        assert!(table.sample_is_key(3));

        let all_key = SampleTable { key_indices: None, ..table };
        assert!(all_key.sample_is_key(1));
    }

    #[test]
    fn verify_query_grid_is_stable() {
        // A reported packet timestamp must resolve back onto the tick it came from.
        for timescale in [48_000u32, 57_600, 1_000] {
            for tick in [1i64, 7, 1_023, 4_801] {
                let reported =
                    micros_to_secs(secs_to_micros(timescale_to_secs(tick, timescale)));
                assert_eq!(ts_for_query(reported, timescale), tick, "{}/{}", tick, timescale);
            }
        }
    }

    fn frag(pos: u64, samples: &[(i64, u32)], start_ts_is_final: bool) -> Fragment {
        let samples: Vec<FragSample> = samples
            .iter()
            .map(|&(dts, duration)| FragSample {
                dts,
                pts: dts,
                duration,
                pos: 0,
                size: 0,
                is_key: true,
            })
            .collect();

        let presentation_order = (0..samples.len() as u32).collect();
        let start_ts = samples.iter().map(|s| s.pts).min().unwrap_or(0);
        let end_ts = samples.iter().map(|s| s.pts + i64::from(s.duration)).max().unwrap_or(0);

        let mut tracks = HashMap::new();
        tracks.insert(
            1,
            FragmentTrackData { samples, presentation_order, start_ts, end_ts, start_ts_is_final },
        );

        Fragment {
            moof_pos: pos,
            moof_len: 8,
            sequence: 0,
            tracks,
            data_start: 0,
            data_end: 0,
            next_fragment: None,
        }
    }

    fn empty_state() -> DemuxState {
        DemuxState {
            reader: RangeReader::new(
                Box::new(BufferSource::new(Vec::new())),
                RangeReaderOptions::default(),
            ),
            file_len: 0,
            fragmented: true,
            tables: Vec::new(),
            fragments: Vec::new(),
            fragments_by_pos: Vec::new(),
            next_scan_pos: 0,
            fragment_lookup: HashMap::new(),
            trex_defaults: HashMap::new(),
        }
    }

    #[test]
    fn verify_tfdt_back_resolution() {
        let mut state = empty_state();
        state.fragments = vec![frag(100, &[(0, 1_000)], true), frag(200, &[(0, 500)], false)];
        state.fragments_by_pos = vec![0, 1];

        resolve_start_timestamps(&mut state);

        let data = &state.fragments[1].tracks[&1];
        assert!(data.start_ts_is_final);
        assert_eq!(data.start_ts, 1_000);
        assert_eq!(data.end_ts, 1_500);
        assert_eq!(data.samples[0].dts, 1_000);
        assert_eq!(data.samples[0].pts, 1_000);
    }

    #[test]
    fn verify_chained_tfdt_resolution() {
        // Two consecutive fragments without a decode-time box resolve transitively in
        // one pass.
        let mut state = empty_state();
        state.fragments = vec![
            frag(100, &[(0, 1_000)], true),
            frag(200, &[(0, 500)], false),
            frag(300, &[(0, 250)], false),
        ];
        state.fragments_by_pos = vec![0, 1, 2];

        resolve_start_timestamps(&mut state);

        assert_eq!(state.fragments[1].tracks[&1].start_ts, 1_000);
        assert_eq!(state.fragments[2].tracks[&1].start_ts, 1_500);
        assert_eq!(state.fragments[2].tracks[&1].end_ts, 1_750);
        assert!(state.fragments[2].tracks[&1].start_ts_is_final);
    }

    #[test]
    fn verify_first_fragment_without_tfdt_starts_at_zero() {
        let mut state = empty_state();
        state.fragments = vec![frag(100, &[(0, 400)], false)];
        state.fragments_by_pos = vec![0];

        resolve_start_timestamps(&mut state);

        let data = &state.fragments[0].tracks[&1];
        assert!(data.start_ts_is_final);
        assert_eq!(data.start_ts, 0);
        assert_eq!(data.end_ts, 400);
    }
}
