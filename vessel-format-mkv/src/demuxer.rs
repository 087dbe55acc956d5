// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Matroska/WebM demuxer: lazy metadata reading and an incrementally built cluster
//! index serving random-access packet lookups.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};

use vessel_core::codecs::{AudioDecoderConfig, ColorSpace, VideoDecoderConfig};
use vessel_core::errors::{decode_error, Result};
use vessel_core::io::{BufReader, MediaSource, RangeReader, RangeReaderOptions, ReadBytes};
use vessel_core::packet::{EncodedPacket, PacketKind, PacketSeq};
use vessel_core::sync::AsyncMutex;
use vessel_core::track::{InputTrack, PacketOptions, Rotation, TrackType};
use vessel_core::units::{binary_search_less_or_equal, ceil_to_micros, secs_to_micros};

use crate::codecs::{audio_codec_from_id, subtitle_codec_from_id, video_codec_from_id};
use crate::ebml::{
    read_signed_vint, read_unsigned_vint, ElementHeader, ElementIterator,
};
use crate::schema::{ids, is_top_level, track_types};

/// One block frame, fully located in the file.
#[derive(Copy, Clone)]
struct BlockSample {
    pts_ms: i64,
    duration_ms: i64,
    pos: u64,
    size: u32,
    is_key: bool,
}

/// Per-track data of one cluster.
struct ClusterTrackData {
    /// Samples in file (decode) order.
    samples: Vec<BlockSample>,
    /// Sample indices ordered by presentation timestamp.
    presentation_order: Vec<u32>,
    start_ms: i64,
    end_ms: i64,
}

struct Cluster {
    pos: u64,
    /// File position just past the cluster, resolved even for unknown-size clusters.
    end: u64,
    timestamp_ms: i64,
    tracks: HashMap<u64, ClusterTrackData>,
    /// Arena index of the cluster that follows this one in file order.
    next_cluster: Option<u32>,
}

/// A cue index entry.
#[derive(Copy, Clone)]
struct CueEntry {
    time_ms: i64,
    /// Absolute file position of the referenced cluster.
    cluster_pos: u64,
}

/// Static per-track description captured at open time.
struct MkvTrackInfo {
    number: u64,
    track_type: TrackType,
    language: Option<String>,
    video_config: Option<VideoDecoderConfig>,
    audio_config: Option<AudioDecoderConfig>,
    /// Default block duration in milliseconds, from DefaultDuration.
    default_duration_ms: Option<i64>,
}

struct MkvDemuxState {
    reader: RangeReader,
    file_len: u64,
    /// Ticks per second implied by the timestamp scale; 1000 for the common case.
    ticks_per_second: u32,
    /// Duration from the segment info, in milliseconds.
    info_duration_ms: Option<f64>,
    clusters: Vec<Cluster>,
    clusters_by_pos: Vec<u32>,
    next_scan_pos: u64,
    cues: Vec<CueEntry>,
    /// Per-track default durations keyed by track number, used while parsing blocks.
    default_durations: HashMap<u64, i64>,
}

struct MkvShared {
    /// Serializes cluster discovery.
    state: AsyncMutex<MkvDemuxState>,
    tracks: Vec<MkvTrackInfo>,
}

/// Matroska/WebM demuxer.
pub struct MkvDemuxer {
    shared: Arc<MkvShared>,
}

impl MkvDemuxer {
    pub async fn open(source: Box<dyn MediaSource>) -> Result<MkvDemuxer> {
        Self::open_with(source, RangeReaderOptions::default()).await
    }

    pub async fn open_with(
        source: Box<dyn MediaSource>,
        options: RangeReaderOptions,
    ) -> Result<MkvDemuxer> {
        let mut reader = RangeReader::new(source, options);
        let file_len = reader.source_len().await?;

        // EBML header.
        let head = reader.fetch(0, 64.min(file_len)).await?;
        let mut br = BufReader::new(&head);
        let ebml_header = ElementHeader::read(&mut br)?;
        if ebml_header.id != ids::EBML {
            return decode_error("mkv: missing ebml header");
        }
        let ebml_end = match ebml_header.end() {
            Some(end) => end,
            None => return decode_error("mkv: unsized ebml header"),
        };

        {
            let bytes = reader.fetch(0, ebml_end).await?;
            let mut br = BufReader::new(&bytes);
            let header = ElementHeader::read(&mut br)?;
            let mut iter = ElementIterator::new_in(br, &header);
            while let Some(child) = iter.next()? {
                if child.id == ids::DOC_TYPE {
                    let doc_type = iter.read_string(&child)?;
                    if doc_type != "matroska" && doc_type != "webm" {
                        return decode_error("mkv: unsupported doc type");
                    }
                    info!("opening {} file", doc_type);
                }
            }
        }

        // Segment header.
        let seg_head = reader
            .fetch(ebml_end, (ebml_end + 16).min(file_len))
            .await?;
        let mut br = BufReader::new_at(&seg_head, ebml_end);
        let segment = ElementHeader::read(&mut br)?;
        if segment.id != ids::SEGMENT {
            return decode_error("mkv: missing segment");
        }
        let segment_data_start = segment.data_pos;
        let segment_end = segment.end().unwrap_or(file_len).min(file_len);

        let mut ticks_per_second = 1_000u32;
        let mut info_duration_ticks: Option<f64> = None;
        let mut tracks: Vec<MkvTrackInfo> = Vec::new();
        let mut cues: Vec<CueEntry> = Vec::new();
        let mut cues_pos_hint: Option<u64> = None;
        let mut first_cluster_pos = segment_end;

        // Walk the segment's top-level children up to the first cluster.
        let mut pos = segment_data_start;
        while pos + 12 <= segment_end {
            let head = reader.fetch(pos, (pos + 12).min(segment_end)).await?;
            let mut br = BufReader::new_at(&head, pos);
            let header = ElementHeader::read(&mut br)?;

            let end = header.end().unwrap_or(segment_end);

            match header.id {
                ids::INFO => {
                    let bytes = reader.fetch(pos, end).await?;
                    let mut br = BufReader::new_at(&bytes, pos);
                    let header = ElementHeader::read(&mut br)?;
                    let (scale, duration) = read_info(br, &header)?;
                    ticks_per_second = (1_000_000_000u64 / scale.max(1)) as u32;
                    info_duration_ticks = duration;
                }
                ids::TRACKS => {
                    let bytes = reader.fetch(pos, end).await?;
                    let mut br = BufReader::new_at(&bytes, pos);
                    let header = ElementHeader::read(&mut br)?;
                    tracks = read_tracks(br, &header)?;
                }
                ids::SEEK_HEAD => {
                    let bytes = reader.fetch(pos, end).await?;
                    let mut br = BufReader::new_at(&bytes, pos);
                    let header = ElementHeader::read(&mut br)?;
                    if let Some(rel) = read_seek_head(br, &header, ids::CUES)? {
                        cues_pos_hint = Some(segment_data_start + rel);
                    }
                }
                ids::CUES => {
                    let bytes = reader.fetch(pos, end).await?;
                    let mut br = BufReader::new_at(&bytes, pos);
                    let header = ElementHeader::read(&mut br)?;
                    cues = read_cues(br, &header, segment_data_start)?;
                }
                ids::CLUSTER => {
                    first_cluster_pos = pos;
                    break;
                }
                other => debug!("skipping segment child {:#x}", other),
            }

            if header.data_len.is_none() {
                break;
            }
            pos = end;
        }

        // The cue index commonly sits behind the clusters; follow the seek head there.
        if cues.is_empty() {
            if let Some(cues_pos) = cues_pos_hint {
                if cues_pos + 12 <= file_len {
                    let head = reader.fetch(cues_pos, (cues_pos + 12).min(file_len)).await?;
                    let mut br = BufReader::new_at(&head, cues_pos);
                    if let Ok(header) = ElementHeader::read(&mut br) {
                        if header.id == ids::CUES {
                            let end = header.end().unwrap_or(file_len);
                            let bytes = reader.fetch(cues_pos, end).await?;
                            let mut br = BufReader::new_at(&bytes, cues_pos);
                            let header = ElementHeader::read(&mut br)?;
                            cues = read_cues(br, &header, segment_data_start)?;
                        }
                    }
                }
            }
        }

        if tracks.is_empty() {
            return decode_error("mkv: missing tracks");
        }

        let default_durations = tracks
            .iter()
            .filter_map(|t| t.default_duration_ms.map(|d| (t.number, d)))
            .collect();

        Ok(MkvDemuxer {
            shared: Arc::new(MkvShared {
                state: AsyncMutex::new(MkvDemuxState {
                    reader,
                    file_len,
                    ticks_per_second,
                    info_duration_ms: info_duration_ticks
                        .map(|ticks| ticks * 1000.0 / f64::from(ticks_per_second)),
                    clusters: Vec::new(),
                    clusters_by_pos: Vec::new(),
                    next_scan_pos: first_cluster_pos,
                    cues,
                    default_durations,
                }),
                tracks,
            }),
        })
    }

    /// The tracks of the segment, as shareable handles.
    pub fn tracks(&self) -> Vec<Arc<dyn InputTrack>> {
        (0..self.shared.tracks.len())
            .map(|track_index| {
                Arc::new(MkvTrack { shared: self.shared.clone(), track_index })
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
                Arc::new(MkvTrack { shared: self.shared.clone(), track_index })
                    as Arc<dyn InputTrack>
            })
    }
}

fn read_info<R: ReadBytes>(reader: R, header: &ElementHeader) -> Result<(u64, Option<f64>)> {
    let mut scale = 1_000_000u64;
    let mut duration = None;

    let mut iter = ElementIterator::new_in(reader, header);
    while let Some(child) = iter.next()? {
        match child.id {
            ids::TIMESTAMP_SCALE => scale = iter.read_unsigned(&child)?,
            ids::DURATION => duration = Some(iter.read_float(&child)?),
            _ => (),
        }
    }

    Ok((scale, duration))
}

fn read_seek_head<R: ReadBytes>(
    reader: R,
    header: &ElementHeader,
    target_id: u32,
) -> Result<Option<u64>> {
    let target_bytes = {
        let bytes = target_id.to_be_bytes();
        let skip = (target_id.leading_zeros() / 8) as usize;
        bytes[skip..].to_vec()
    };

    let mut iter = ElementIterator::new_in(reader, header);
    while let Some(seek) = iter.next()? {
        if seek.id != ids::SEEK {
            continue;
        }

        let mut seek_id = None;
        let mut seek_pos = None;

        let mut seek_iter = ElementIterator::new_in(iter.inner_mut(), &seek);
        while let Some(child) = seek_iter.next()? {
            match child.id {
                ids::SEEK_ID => seek_id = Some(seek_iter.read_binary(&child)?),
                ids::SEEK_POSITION => seek_pos = Some(seek_iter.read_unsigned(&child)?),
                _ => (),
            }
        }

        if seek_id.as_deref() == Some(target_bytes.as_slice()) {
            return Ok(seek_pos);
        }
    }

    Ok(None)
}

fn read_cues<R: ReadBytes>(
    reader: R,
    header: &ElementHeader,
    segment_data_start: u64,
) -> Result<Vec<CueEntry>> {
    let mut entries = Vec::new();

    let mut iter = ElementIterator::new_in(reader, header);
    while let Some(point) = iter.next()? {
        if point.id != ids::CUE_POINT {
            continue;
        }

        let mut time_ms = 0i64;
        let mut positions = Vec::new();

        let mut point_iter = ElementIterator::new_in(iter.inner_mut(), &point);
        while let Some(child) = point_iter.next()? {
            match child.id {
                ids::CUE_TIME => time_ms = point_iter.read_unsigned(&child)? as i64,
                ids::CUE_TRACK_POSITIONS => {
                    let mut pos_iter =
                        ElementIterator::new_in(point_iter.inner_mut(), &child);
                    while let Some(entry) = pos_iter.next()? {
                        if entry.id == ids::CUE_CLUSTER_POSITION {
                            positions.push(pos_iter.read_unsigned(&entry)?);
                        }
                    }
                }
                _ => (),
            }
        }

        for position in positions {
            entries.push(CueEntry { time_ms, cluster_pos: segment_data_start + position });
        }
    }

    entries.sort_by_key(|e| e.time_ms);
    entries.dedup_by_key(|e| e.cluster_pos);
    Ok(entries)
}

fn read_tracks<R: ReadBytes>(reader: R, header: &ElementHeader) -> Result<Vec<MkvTrackInfo>> {
    let mut tracks = Vec::new();

    let mut iter = ElementIterator::new_in(reader, header);
    while let Some(entry) = iter.next()? {
        if entry.id != ids::TRACK_ENTRY {
            continue;
        }

        let mut number = 0u64;
        let mut track_type_raw = 0u64;
        let mut codec_id = String::new();
        let mut codec_private: Option<Box<[u8]>> = None;
        let mut default_duration_ns: Option<u64> = None;
        let mut language: Option<String> = None;
        let mut width = 0u32;
        let mut height = 0u32;
        let mut color_space: Option<ColorSpace> = None;
        let mut sample_rate = 0u32;
        let mut channels = 0u32;

        let mut entry_iter = ElementIterator::new_in(iter.inner_mut(), &entry);
        while let Some(child) = entry_iter.next()? {
            match child.id {
                ids::TRACK_NUMBER => number = entry_iter.read_unsigned(&child)?,
                ids::TRACK_TYPE => track_type_raw = entry_iter.read_unsigned(&child)?,
                ids::CODEC_ID => codec_id = entry_iter.read_string(&child)?,
                ids::CODEC_PRIVATE => codec_private = Some(entry_iter.read_binary(&child)?),
                ids::DEFAULT_DURATION => {
                    default_duration_ns = Some(entry_iter.read_unsigned(&child)?)
                }
                ids::LANGUAGE => language = Some(entry_iter.read_string(&child)?),
                ids::VIDEO => {
                    let mut video_iter =
                        ElementIterator::new_in(entry_iter.inner_mut(), &child);
                    while let Some(video_child) = video_iter.next()? {
                        match video_child.id {
                            ids::PIXEL_WIDTH => {
                                width = video_iter.read_unsigned(&video_child)? as u32
                            }
                            ids::PIXEL_HEIGHT => {
                                height = video_iter.read_unsigned(&video_child)? as u32
                            }
                            ids::COLOUR => {
                                color_space =
                                    Some(read_colour(&mut video_iter, &video_child)?);
                            }
                            _ => (),
                        }
                    }
                }
                ids::AUDIO => {
                    let mut audio_iter =
                        ElementIterator::new_in(entry_iter.inner_mut(), &child);
                    while let Some(audio_child) = audio_iter.next()? {
                        match audio_child.id {
                            ids::SAMPLING_FREQUENCY => {
                                sample_rate =
                                    audio_iter.read_float(&audio_child)?.round() as u32
                            }
                            ids::CHANNELS => {
                                channels = audio_iter.read_unsigned(&audio_child)? as u32
                            }
                            _ => (),
                        }
                    }
                }
                _ => (),
            }
        }

        let (track_type, video_config, audio_config) = match track_type_raw {
            track_types::VIDEO => match video_codec_from_id(&codec_id) {
                Some(codec) => (
                    TrackType::Video,
                    Some(VideoDecoderConfig {
                        codec,
                        coded_width: width,
                        coded_height: height,
                        description: codec_private.clone(),
                        color_space,
                    }),
                    None,
                ),
                None => {
                    warn!("skipping video track with unknown codec id {}", codec_id);
                    continue;
                }
            },
            track_types::AUDIO => match audio_codec_from_id(&codec_id) {
                Some(codec) => (
                    TrackType::Audio,
                    None,
                    Some(AudioDecoderConfig {
                        codec,
                        sample_rate,
                        channel_count: channels,
                        description: codec_private.clone(),
                    }),
                ),
                None => {
                    warn!("skipping audio track with unknown codec id {}", codec_id);
                    continue;
                }
            },
            track_types::SUBTITLE => match subtitle_codec_from_id(&codec_id) {
                Some(_) => (TrackType::Subtitle, None, None),
                None => {
                    warn!("skipping subtitle track with unknown codec id {}", codec_id);
                    continue;
                }
            },
            other => {
                debug!("skipping track of type {}", other);
                continue;
            }
        };

        tracks.push(MkvTrackInfo {
            number,
            track_type,
            language,
            video_config,
            audio_config,
            default_duration_ms: default_duration_ns.map(|ns| (ns / 1_000_000) as i64),
        });
    }

    Ok(tracks)
}

fn read_colour<R: ReadBytes>(
    iter: &mut ElementIterator<R>,
    header: &ElementHeader,
) -> Result<ColorSpace> {
    let mut color = ColorSpace::default();

    let mut colour_iter = ElementIterator::new_in(iter.inner_mut(), header);
    while let Some(child) = colour_iter.next()? {
        match child.id {
            ids::MATRIX_COEFFICIENTS => {
                color.matrix = Some(colour_iter.read_unsigned(&child)? as u8)
            }
            ids::TRANSFER_CHARACTERISTICS => {
                color.transfer = Some(colour_iter.read_unsigned(&child)? as u8)
            }
            ids::PRIMARIES => color.primaries = Some(colour_iter.read_unsigned(&child)? as u8),
            ids::RANGE => color.full_range = Some(colour_iter.read_unsigned(&child)? == 2),
            _ => (),
        }
    }

    Ok(color)
}

/// A single track handle; all lookups serialize through the demuxer mutex.
struct MkvTrack {
    shared: Arc<MkvShared>,
    track_index: usize,
}

impl MkvTrack {
    fn info(&self) -> &MkvTrackInfo {
        &self.shared.tracks[self.track_index]
    }

    async fn make_packet(
        &self,
        state: &mut MkvDemuxState,
        seq: PacketSeq,
        sample: BlockSample,
        options: PacketOptions,
    ) -> Result<EncodedPacket> {
        let ticks = f64::from(state.ticks_per_second);
        let timestamp = secs_to_micros(sample.pts_ms as f64 / ticks);
        let duration = secs_to_micros(sample.duration_ms as f64 / ticks);
        let kind = if sample.is_key { PacketKind::Key } else { PacketKind::Delta };

        let data: Box<[u8]> = if options.metadata_only {
            Box::default()
        }
        else {
            state
                .reader
                .fetch(sample.pos, sample.pos + u64::from(sample.size))
                .await?
                .into()
        };

        let mut packet = EncodedPacket::new(data, timestamp, duration, kind, seq);
        packet.byte_length = u64::from(sample.size);
        Ok(packet)
    }

    async fn cluster_packet(
        &self,
        state: &mut MkvDemuxState,
        cluster_idx: u32,
        sample_idx: u32,
        options: PacketOptions,
    ) -> Result<Option<EncodedPacket>> {
        let number = self.info().number;
        let sample = {
            let cluster = &state.clusters[cluster_idx as usize];
            let data = match cluster.tracks.get(&number) {
                Some(data) => data,
                None => return Ok(None),
            };
            match data.samples.get(sample_idx as usize) {
                Some(sample) => *sample,
                None => return Ok(None),
            }
        };

        let seq = PacketSeq::new(cluster_idx, sample_idx);
        self.make_packet(state, seq, sample, options).await.map(Some)
    }

    /// Locate the sample with the greatest pts at or before `ts_ms`, loading further
    /// clusters while they could still contain one.
    async fn cluster_lookup(
        &self,
        state: &mut MkvDemuxState,
        ts_ms: i64,
    ) -> Result<Option<(u32, u32)>> {
        // Seed from the cue index.
        let hint = binary_search_less_or_equal(&state.cues, ts_ms as f64, |e| e.time_ms as f64)
            .map(|idx| state.cues[idx].cluster_pos);
        if let Some(cluster_pos) = hint {
            ensure_cluster_at(state, cluster_pos).await?;
        }

        let number = self.info().number;

        loop {
            let best = best_loaded_sample(state, number, ts_ms);

            if let Some((cluster_idx, sample_idx)) = best {
                let data = &state.clusters[cluster_idx as usize].tracks[&number];
                if ts_ms < data.end_ms {
                    return Ok(Some((cluster_idx, sample_idx)));
                }
            }

            match read_next_cluster(state).await? {
                Some(new_idx) => {
                    let cluster = &state.clusters[new_idx as usize];
                    if cluster.timestamp_ms > ts_ms {
                        return Ok(best_loaded_sample(state, number, ts_ms));
                    }
                }
                None => return Ok(best_loaded_sample(state, number, ts_ms)),
            }
        }
    }
}

fn best_loaded_sample(state: &MkvDemuxState, number: u64, ts_ms: i64) -> Option<(u32, u32)> {
    let mut best: Option<(i64, u32, u32)> = None;

    for &arena_idx in &state.clusters_by_pos {
        let cluster = &state.clusters[arena_idx as usize];
        let data = match cluster.tracks.get(&number) {
            Some(data) => data,
            None => continue,
        };
        if data.start_ms > ts_ms {
            continue;
        }

        let hit = binary_search_less_or_equal(&data.presentation_order, ts_ms as f64, |&i| {
            data.samples[i as usize].pts_ms as f64
        });

        if let Some(order_idx) = hit {
            let sample_idx = data.presentation_order[order_idx];
            let pts = data.samples[sample_idx as usize].pts_ms;
            match best {
                Some((best_pts, _, _)) if best_pts >= pts => (),
                _ => best = Some((pts, arena_idx, sample_idx)),
            }
        }
    }

    best.map(|(_, cluster, sample)| (cluster, sample))
}

#[async_trait]
impl InputTrack for MkvTrack {
    fn id(&self) -> u32 {
        self.info().number as u32
    }

    fn track_type(&self) -> TrackType {
        self.info().track_type
    }

    fn time_scale(&self) -> u32 {
        1_000
    }

    fn language(&self) -> Option<String> {
        self.info().language.clone()
    }

    fn rotation(&self) -> Rotation {
        Rotation::R0
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

        if let Some(duration_ms) = state.info_duration_ms {
            return Ok(duration_ms / 1000.0);
        }

        while read_next_cluster(state).await?.is_some() {}

        let number = self.info().number;
        let end = state
            .clusters
            .iter()
            .filter_map(|c| c.tracks.get(&number))
            .map(|d| d.end_ms)
            .max()
            .unwrap_or(0);
        Ok(end as f64 / 1000.0)
    }

    async fn first_packet(&self, options: PacketOptions) -> Result<Option<EncodedPacket>> {
        let mut state = self.shared.state.lock().await;
        let state = &mut *state;

        // The first packet lives in the file-order first cluster carrying this track.
        // Clusters may have been loaded out of order through the cue index, so the
        // sequential scan must cover everything before a candidate counts.
        let number = self.info().number;
        loop {
            let candidate = state
                .clusters_by_pos
                .iter()
                .map(|&i| &state.clusters[i as usize])
                .find(|c| c.tracks.contains_key(&number))
                .map(|c| c.pos);

            if let Some(pos) = candidate {
                if pos < state.next_scan_pos {
                    let arena_idx =
                        state.clusters.iter().position(|c| c.pos == pos).unwrap() as u32;
                    return self.cluster_packet(state, arena_idx, 0, options).await;
                }
            }

            if read_next_cluster(state).await?.is_none() {
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

        let ts_ms = ms_for_query(time_secs);

        match self.cluster_lookup(state, ts_ms).await? {
            Some((cluster_idx, sample_idx)) => {
                self.cluster_packet(state, cluster_idx, sample_idx, options).await
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

        let number = self.info().number;
        let mut cluster_idx = prev.seq.segment;

        {
            let cluster = &state.clusters[cluster_idx as usize];
            if let Some(data) = cluster.tracks.get(&number) {
                if (prev.seq.index + 1) < data.samples.len() as u32 {
                    return self
                        .cluster_packet(state, cluster_idx, prev.seq.index + 1, options)
                        .await;
                }
            }
        }

        loop {
            match state.clusters[cluster_idx as usize].next_cluster {
                Some(next) => {
                    if state.clusters[next as usize].tracks.contains_key(&number) {
                        return self.cluster_packet(state, next, 0, options).await;
                    }
                    cluster_idx = next;
                }
                None => {
                    // Scanning may load a cluster anywhere in the file; re-check the
                    // successor link instead of assuming the scanned cluster follows.
                    if read_next_cluster(state).await?.is_none() {
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

        let ts_ms = ms_for_query(time_secs);

        let (cluster_idx, sample_idx) = match self.cluster_lookup(state, ts_ms).await? {
            Some(hit) => hit,
            None => return Ok(None),
        };

        let number = self.info().number;
        let key = {
            let data = &state.clusters[cluster_idx as usize].tracks[&number];
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
            Some(key_idx) => self.cluster_packet(state, cluster_idx, key_idx, options).await,
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

        let number = self.info().number;
        let mut cluster_idx = prev.seq.segment;
        let mut from_sample = prev.seq.index + 1;

        loop {
            let key = {
                let cluster = &state.clusters[cluster_idx as usize];
                cluster.tracks.get(&number).and_then(|data| {
                    (from_sample..data.samples.len() as u32)
                        .find(|&i| data.samples[i as usize].is_key)
                })
            };

            if let Some(key_idx) = key {
                return self.cluster_packet(state, cluster_idx, key_idx, options).await;
            }

            match state.clusters[cluster_idx as usize].next_cluster {
                Some(next) => {
                    cluster_idx = next;
                    from_sample = 0;
                }
                None => {
                    if read_next_cluster(state).await?.is_none() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Ensure the cluster starting at `cluster_pos` is loaded.
async fn ensure_cluster_at(state: &mut MkvDemuxState, cluster_pos: u64) -> Result<()> {
    if state.clusters.iter().any(|c| c.pos == cluster_pos) {
        return Ok(());
    }
    read_cluster_at(state, cluster_pos).await?;
    Ok(())
}

/// Scan forward and read the next cluster in file order.
async fn read_next_cluster(state: &mut MkvDemuxState) -> Result<Option<u32>> {
    loop {
        let pos = state.next_scan_pos;
        if pos + 12 > state.file_len {
            return Ok(None);
        }

        let head = state.reader.fetch(pos, (pos + 12).min(state.file_len)).await?;
        let mut br = BufReader::new_at(&head, pos);
        let header = match ElementHeader::read(&mut br) {
            Ok(header) => header,
            Err(_) => return Ok(None),
        };

        if header.id == ids::CLUSTER {
            if let Some(existing) = state.clusters.iter().find(|c| c.pos == pos) {
                state.next_scan_pos = existing.end;
                continue;
            }

            let (idx, end) = read_cluster_at(state, pos).await?;
            state.next_scan_pos = end;
            return Ok(Some(idx));
        }

        match header.end() {
            Some(end) => state.next_scan_pos = end,
            None => return Ok(None),
        }
    }
}

/// Read and index one cluster at a known offset. Returns the arena index and the file
/// position just past the cluster.
async fn read_cluster_at(state: &mut MkvDemuxState, cluster_pos: u64) -> Result<(u32, u64)> {
    if let Some(existing) = state.clusters.iter().position(|c| c.pos == cluster_pos) {
        let end = state.clusters[existing].end;
        return Ok((existing as u32, end));
    }

    let head = state
        .reader
        .fetch(cluster_pos, (cluster_pos + 12).min(state.file_len))
        .await?;
    let mut br = BufReader::new_at(&head, cluster_pos);
    let header = ElementHeader::read(&mut br)?;

    if header.id != ids::CLUSTER {
        return decode_error("mkv: expected a cluster");
    }

    // For unknown-size clusters, scan children until the next top-level element.
    let hard_end = header.end().unwrap_or(state.file_len).min(state.file_len);
    let bytes = state.reader.fetch(cluster_pos, hard_end).await?;
    let mut br = BufReader::new_at(&bytes, cluster_pos);
    let header = ElementHeader::read(&mut br)?;

    let mut timestamp_ms = 0i64;
    let mut blocks: HashMap<u64, Vec<BlockSample>> = HashMap::new();
    let mut end = hard_end;

    let mut iter = ElementIterator::new_in(&mut br, &header);
    loop {
        let child = match iter.next() {
            Ok(Some(child)) => child,
            Ok(None) => break,
            Err(_) => break,
        };

        if header.data_len.is_none() && is_top_level(child.id) {
            end = child.pos;
            break;
        }

        match child.id {
            ids::TIMESTAMP => {
                timestamp_ms = iter.read_unsigned(&child)? as i64;
            }
            ids::SIMPLE_BLOCK => {
                let payload_pos = child.data_pos;
                let payload = iter.read_binary(&child)?;
                parse_block(
                    &payload,
                    payload_pos,
                    timestamp_ms,
                    None,
                    None,
                    &mut blocks,
                    &state.default_durations,
                )?;
            }
            ids::BLOCK_GROUP => {
                let mut block_payload: Option<(u64, Box<[u8]>)> = None;
                let mut duration_ms: Option<i64> = None;
                let mut has_reference = false;

                let mut group_iter = ElementIterator::new_in(iter.inner_mut(), &child);
                while let Some(group_child) = group_iter.next()? {
                    match group_child.id {
                        ids::BLOCK => {
                            let pos = group_child.data_pos;
                            block_payload = Some((pos, group_iter.read_binary(&group_child)?));
                        }
                        ids::BLOCK_DURATION => {
                            duration_ms = Some(group_iter.read_unsigned(&group_child)? as i64)
                        }
                        ids::REFERENCE_BLOCK => {
                            let _ = group_iter.read_signed(&group_child)?;
                            has_reference = true;
                        }
                        _ => (),
                    }
                }

                if let Some((pos, payload)) = block_payload {
                    parse_block(
                        &payload,
                        pos,
                        timestamp_ms,
                        Some(!has_reference),
                        duration_ms,
                        &mut blocks,
                        &state.default_durations,
                    )?;
                }
            }
            _ => (),
        }
    }

    // Fill durations that blocks do not carry from the following sample of the same
    // track, then build the presentation index.
    let mut tracks = HashMap::new();
    for (number, mut samples) in blocks {
        let default = state.default_durations.get(&number).copied();
        fill_block_durations(&mut samples, default);

        let mut presentation_order: Vec<u32> = (0..samples.len() as u32).collect();
        presentation_order.sort_by_key(|&i| samples[i as usize].pts_ms);

        let start_ms = samples.iter().map(|s| s.pts_ms).min().unwrap_or(0);
        let end_ms = samples.iter().map(|s| s.pts_ms + s.duration_ms).max().unwrap_or(0);

        tracks.insert(
            number,
            ClusterTrackData { samples, presentation_order, start_ms, end_ms },
        );
    }

    let arena_idx = state.clusters.len() as u32;
    state
        .clusters
        .push(Cluster { pos: cluster_pos, end, timestamp_ms, tracks, next_cluster: None });

    let pos_idx = state
        .clusters_by_pos
        .partition_point(|&i| state.clusters[i as usize].pos < cluster_pos);
    state.clusters_by_pos.insert(pos_idx, arena_idx);

    if pos_idx > 0 {
        let pred = state.clusters_by_pos[pos_idx - 1];
        state.clusters[pred as usize].next_cluster = Some(arena_idx);
    }
    if pos_idx + 1 < state.clusters_by_pos.len() {
        let succ = state.clusters_by_pos[pos_idx + 1];
        state.clusters[arena_idx as usize].next_cluster = Some(succ);
    }

    debug!("indexed cluster at {} ({} ms)", cluster_pos, timestamp_ms);
    Ok((arena_idx, end))
}

/// Snap a query time onto the microsecond grid, then convert it to milliseconds. The
/// conversion rounds to nearest so a timestamp previously reported by the library (one
/// rounding away from the exact millisecond) maps back onto the block it came from.
fn ms_for_query(time_secs: f64) -> i64 {
    (ceil_to_micros(time_secs) * 1000.0).round() as i64
}

/// Fill in durations the blocks did not carry: the delta to the next same-track sample,
/// then the track default, then the last observed delta for a cluster's final block.
fn fill_block_durations(samples: &mut [BlockSample], default: Option<i64>) {
    for i in 0..samples.len() {
        if samples[i].duration_ms == 0 {
            let next_pts = samples.get(i + 1).map(|s| s.pts_ms);
            samples[i].duration_ms = match (next_pts, default) {
                (Some(next), _) if next > samples[i].pts_ms => next - samples[i].pts_ms,
                (_, Some(default)) => default,
                _ if i > 0 => samples[i - 1].duration_ms,
                _ => 0,
            };
        }
    }
}

/// Parse one block payload into per-track samples, expanding lacing.
fn parse_block(
    payload: &[u8],
    payload_pos: u64,
    cluster_ts_ms: i64,
    key_override: Option<bool>,
    duration_ms: Option<i64>,
    blocks: &mut HashMap<u64, Vec<BlockSample>>,
    default_durations: &HashMap<u64, i64>,
) -> Result<()> {
    let mut reader = BufReader::new(payload);

    let number = read_unsigned_vint(&mut reader)?;
    let rel_ts = reader.read_be_i16()?;
    let flags = reader.read_u8()?;

    let pts_ms = cluster_ts_ms + i64::from(rel_ts);
    // SimpleBlock marks keys in its flags; a Block's key-ness is decided by the absence
    // of a reference block.
    let is_key = key_override.unwrap_or(flags & 0x80 != 0);

    let lacing = (flags >> 1) & 0b11;

    let frame_sizes: Vec<u64> = match lacing {
        0b00 => vec![(payload.len() as u64) - reader.pos()],
        _ => {
            let frame_count = usize::from(reader.read_u8()?) + 1;
            match lacing {
                0b01 => {
                    // Xiph: 255-prefixed sizes for all but the last frame.
                    let mut sizes = Vec::with_capacity(frame_count);
                    let mut prefixes = 0u64;
                    while sizes.len() + 1 < frame_count {
                        let byte = u64::from(reader.read_u8()?);
                        if byte == 255 {
                            prefixes += 1;
                        }
                        else {
                            sizes.push(prefixes * 255 + byte);
                            prefixes = 0;
                        }
                    }
                    let used: u64 = sizes.iter().sum::<u64>() + reader.pos();
                    sizes.push((payload.len() as u64).saturating_sub(used));
                    sizes
                }
                0b10 => {
                    // Fixed size: equal split of the remainder.
                    let remainder = payload.len() as u64 - reader.pos();
                    let each = remainder / frame_count as u64;
                    vec![each; frame_count]
                }
                _ => {
                    // EBML: an absolute first size, then signed deltas, covering all
                    // but the last frame. The last frame takes the remainder, so a
                    // single-frame block carries no size fields at all.
                    let mut sizes = Vec::with_capacity(frame_count);
                    if frame_count > 1 {
                        let first = read_unsigned_vint(&mut reader)?;
                        sizes.push(first);
                        for _ in 1..frame_count - 1 {
                            let delta = read_signed_vint(&mut reader)?;
                            let last = *sizes.last().unwrap() as i64;
                            sizes.push((last + delta) as u64);
                        }
                    }
                    let used: u64 = sizes.iter().sum::<u64>() + reader.pos();
                    sizes.push((payload.len() as u64).saturating_sub(used));
                    sizes
                }
            }
        }
    };

    let default = default_durations.get(&number).copied();
    let samples = blocks.entry(number).or_default();

    let mut pos = payload_pos + reader.pos();
    let per_frame_duration = duration_ms
        .map(|d| d / frame_sizes.len() as i64)
        .or(default)
        .unwrap_or(0);

    for (i, &size) in frame_sizes.iter().enumerate() {
        samples.push(BlockSample {
            pts_ms: pts_ms + per_frame_duration * i as i64,
            duration_ms: per_frame_duration,
            pos,
            size: size as u32,
            is_key,
        });
        pos += size;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_core::io::BufferSource;
    use vessel_core::units::micros_to_secs;

    fn parse(
        payload: &[u8],
        key_override: Option<bool>,
        duration_ms: Option<i64>,
        defaults: &HashMap<u64, i64>,
    ) -> Vec<BlockSample> {
        let mut blocks = HashMap::new();
        parse_block(payload, 1000, 10_000, key_override, duration_ms, &mut blocks, defaults)
            .unwrap();
        blocks.remove(&1).unwrap_or_default()
    }

    /// Track number 1, a relative timestamp, flags, then the lace body.
    fn block_payload(rel_ts: i16, flags: u8, body: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x81];
        payload.extend_from_slice(&rel_ts.to_be_bytes());
        payload.push(flags);
        payload.extend_from_slice(body);
        payload
    }

    #[test]
    fn verify_unlaced_block_parse() {
        let samples = parse(&block_payload(100, 0x80, &[9, 9, 9]), None, None, &HashMap::new());

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].pts_ms, 10_100);
        assert_eq!(samples[0].size, 3);
        assert_eq!(samples[0].pos, 1000 + 4);
        assert!(samples[0].is_key);

        // Without the key bit a simple block is a delta frame.
        let samples = parse(&block_payload(0, 0x00, &[9]), None, None, &HashMap::new());
        assert!(!samples[0].is_key);
    }

    #[test]
    fn verify_block_group_key_comes_from_references() {
        // Inside a block group the flags carry no key bit; the presence of a
        // reference block decides.
        let payload = block_payload(0, 0x00, &[9]);
        assert!(parse(&payload, Some(true), Some(20), &HashMap::new())[0].is_key);
        assert!(!parse(&payload, Some(false), Some(20), &HashMap::new())[0].is_key);
    }

    #[test]
    fn verify_xiph_lacing() {
        // Three frames; sizes 300 (255 + 45) and 20 are explicit, the last takes the
        // remainder.
        let mut body = vec![0x02, 0xff, 45, 20];
        body.extend(vec![0xa1; 300]);
        body.extend(vec![0xa2; 20]);
        body.extend(vec![0xa3; 25]);

        let samples = parse(&block_payload(0, 0x80 | 0x02, &body), None, None, &HashMap::new());

        let sizes: Vec<u32> = samples.iter().map(|s| s.size).collect();
        assert_eq!(sizes, vec![300, 20, 25]);

        // Frames follow the four-byte block header and four-byte lace header
        // contiguously.
        assert_eq!(samples[0].pos, 1000 + 4 + 4);
        assert_eq!(samples[1].pos, samples[0].pos + 300);
        assert_eq!(samples[2].pos, samples[1].pos + 20);
    }

    #[test]
    fn verify_fixed_lacing() {
        let mut body = vec![0x02];
        body.extend(vec![0u8; 90]);

        let samples = parse(&block_payload(0, 0x80 | 0x04, &body), None, None, &HashMap::new());

        let sizes: Vec<u32> = samples.iter().map(|s| s.size).collect();
        assert_eq!(sizes, vec![30, 30, 30]);
        assert_eq!(samples[0].pos, 1000 + 4 + 1);
        assert_eq!(samples[2].pos, 1000 + 4 + 1 + 60);
    }

    #[test]
    fn verify_ebml_lacing() {
        // Three frames: explicit 40, delta -10 making 30, remainder 25.
        let mut body = vec![0x02, 0xa8, 0xb5];
        body.extend(vec![1u8; 40]);
        body.extend(vec![2u8; 30]);
        body.extend(vec![3u8; 25]);

        let samples = parse(&block_payload(0, 0x80 | 0x06, &body), None, None, &HashMap::new());

        let sizes: Vec<u32> = samples.iter().map(|s| s.size).collect();
        assert_eq!(sizes, vec![40, 30, 25]);
        assert_eq!(samples[0].pos, 1000 + 4 + 3);
    }

    #[test]
    fn verify_ebml_lacing_single_frame() {
        // A one-frame EBML-laced block carries no size fields after the count byte;
        // the frame is the whole remainder.
        let mut body = vec![0x00];
        body.extend(vec![7u8; 17]);

        let samples = parse(&block_payload(0, 0x80 | 0x06, &body), None, None, &HashMap::new());

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].size, 17);
        assert_eq!(samples[0].pos, 1000 + 4 + 1);
    }

    #[test]
    fn verify_laced_frame_timing_spread() {
        let mut body = vec![0x02];
        body.extend(vec![0u8; 90]);
        let payload = block_payload(0, 0x80 | 0x04, &body);

        // An explicit group duration splits across the laced frames.
        let samples = parse(&payload, Some(true), Some(60), &HashMap::new());
        let pts: Vec<i64> = samples.iter().map(|s| s.pts_ms).collect();
        assert_eq!(pts, vec![10_000, 10_020, 10_040]);
        assert!(samples.iter().all(|s| s.duration_ms == 20));

        // Without one, the track's default duration spaces them.
        let mut defaults = HashMap::new();
        defaults.insert(1u64, 20i64);
        let samples = parse(&payload, None, None, &defaults);
        let pts: Vec<i64> = samples.iter().map(|s| s.pts_ms).collect();
        assert_eq!(pts, vec![10_000, 10_020, 10_040]);
    }

    fn sample_at(pts_ms: i64) -> BlockSample {
        BlockSample { pts_ms, duration_ms: 0, pos: 0, size: 1, is_key: true }
    }

    #[test]
    fn verify_duration_fallback_chain() {
        // Next-sample deltas first; the final block carries the last delta forward.
        let mut samples = vec![sample_at(0), sample_at(40), sample_at(70)];
        fill_block_durations(&mut samples, None);
        let durations: Vec<i64> = samples.iter().map(|s| s.duration_ms).collect();
        assert_eq!(durations, vec![40, 30, 30]);

        // A lone block takes the track default.
        let mut samples = vec![sample_at(0)];
        fill_block_durations(&mut samples, Some(25));
        assert_eq!(samples[0].duration_ms, 25);

        // With nothing to derive from, the duration stays zero.
        let mut samples = vec![sample_at(0)];
        fill_block_durations(&mut samples, None);
        assert_eq!(samples[0].duration_ms, 0);
    }

    fn cluster_with(pos: u64, timestamp_ms: i64, pts: &[i64]) -> Cluster {
        let samples: Vec<BlockSample> = pts.iter().map(|&p| BlockSample {
            pts_ms: p,
            duration_ms: 20,
            pos: 0,
            size: 1,
            is_key: true,
        })
        .collect();

        let mut presentation_order: Vec<u32> = (0..samples.len() as u32).collect();
        presentation_order.sort_by_key(|&i| samples[i as usize].pts_ms);

        let start_ms = samples.iter().map(|s| s.pts_ms).min().unwrap_or(0);
        let end_ms = samples.iter().map(|s| s.pts_ms + s.duration_ms).max().unwrap_or(0);

        let mut tracks = HashMap::new();
        tracks.insert(1, ClusterTrackData { samples, presentation_order, start_ms, end_ms });

        Cluster { pos, end: pos + 1, timestamp_ms, tracks, next_cluster: None }
    }

    fn state_with_clusters(clusters: Vec<Cluster>) -> MkvDemuxState {
        let clusters_by_pos = (0..clusters.len() as u32).collect();
        MkvDemuxState {
            reader: RangeReader::new(
                Box::new(BufferSource::new(Vec::new())),
                RangeReaderOptions::default(),
            ),
            file_len: 0,
            ticks_per_second: 1000,
            info_duration_ms: None,
            clusters,
            clusters_by_pos,
            next_scan_pos: 0,
            cues: Vec::new(),
            default_durations: HashMap::new(),
        }
    }

    #[test]
    fn verify_best_loaded_sample_search() {
        let state = state_with_clusters(vec![
            cluster_with(100, 0, &[0, 40, 80]),
            cluster_with(200, 100, &[100, 140]),
        ]);

        assert_eq!(best_loaded_sample(&state, 1, 90), Some((0, 2)));
        assert_eq!(best_loaded_sample(&state, 1, 100), Some((1, 0)));
        assert_eq!(best_loaded_sample(&state, 1, 500), Some((1, 1)));
        assert_eq!(best_loaded_sample(&state, 1, -1), None);
        // An unknown track never matches.
        assert_eq!(best_loaded_sample(&state, 2, 100), None);
    }

    #[test]
    fn verify_cue_seed_selection() {
        // The lookup seeds cluster loading from the latest cue at or before the
        // query time.
        let cues = vec![
            CueEntry { time_ms: 0, cluster_pos: 100 },
            CueEntry { time_ms: 1_000, cluster_pos: 200 },
            CueEntry { time_ms: 2_000, cluster_pos: 300 },
        ];

        let seed = |ts: i64| {
            binary_search_less_or_equal(&cues, ts as f64, |e| e.time_ms as f64)
                .map(|idx| cues[idx].cluster_pos)
        };

        assert_eq!(seed(-1), None);
        assert_eq!(seed(0), Some(100));
        assert_eq!(seed(1_500), Some(200));
        assert_eq!(seed(9_000), Some(300));
    }

    #[test]
    fn verify_query_grid_is_stable() {
        // A reported packet timestamp must resolve back onto the block it came from.
        for ms in [1i64, 999, 21_312, 123_456] {
            let reported = micros_to_secs(ms * 1000);
            assert_eq!(ms_for_query(reported), ms, "{} ms", ms);
        }
    }
}
