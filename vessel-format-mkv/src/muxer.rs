// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Matroska/WebM muxer: clustered output with a cue index, in seekable form (fixed-size
//! segment and cluster fields backpatched at finalization) or streamable, append-only
//! form (unknown-size elements, no seek head).

use std::collections::VecDeque;

use log::debug;

use vessel_core::codecs::{AudioCodec, AudioDecoderConfig, VideoCodec, VideoDecoderConfig};
use vessel_core::errors::{
    invalid_metadata_error, programmer_error, timestamp_order_error, Error, Result,
};
use vessel_core::io::{OutputTarget, Writer};
use vessel_core::packet::EncodedPacket;
use vessel_core::sync::AsyncMutex;
use vessel_core::units::secs_to_timescale;

use crate::codecs::{
    audio_codec_id, subtitle_codec_id, video_codec_id, webm_allows_audio, webm_allows_video,
};
use crate::ebml::{write_vint_into, EbmlWriter, OpenElement};
use crate::schema::{ids, track_types};
use crate::vp9::patch_vp9_color_space;

/// All Matroska timestamps in this muxer are milliseconds.
const TIMESTAMP_SCALE_NS: u64 = 1_000_000;
const MS_TIMESCALE: u32 = 1_000;

/// A new cluster is cut at a key sample once the current one spans this long.
const CLUSTER_DURATION_MS: i64 = 1_000;
/// Cluster-relative block timestamps are signed 16-bit.
const MAX_CLUSTER_SPAN_MS: i64 = i16::MAX as i64;

/// Width of the backpatched segment size field.
const SEGMENT_SIZE_WIDTH: u8 = 6;
/// Width of the backpatched cluster size field.
const CLUSTER_SIZE_WIDTH: u8 = 5;

/// Container flavor: WebM restricts the codec set and names itself in the doc type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MkvVariant {
    Webm,
    Mkv,
}

#[derive(Copy, Clone, Debug)]
pub struct MkvMuxerOptions {
    pub variant: MkvVariant,
    /// Write append-only: unknown-size segment and clusters, no seek head, no
    /// duration. Required for sinks that cannot seek.
    pub streamable: bool,
}

impl Default for MkvMuxerOptions {
    fn default() -> Self {
        MkvMuxerOptions { variant: MkvVariant::Mkv, streamable: false }
    }
}

pub type TrackId = u64;

#[derive(Clone, Debug, Default)]
pub struct VideoTrackOptions {
    pub codec: Option<VideoCodec>,
    pub frame_rate: Option<f64>,
    pub language: Option<String>,
    /// Shift all timestamps of this track so the first sample lands at zero.
    pub offset_timestamps: bool,
}

#[derive(Clone, Debug, Default)]
pub struct AudioTrackOptions {
    pub codec: Option<AudioCodec>,
    pub language: Option<String>,
    pub offset_timestamps: bool,
}

#[derive(Clone, Debug, Default)]
pub struct SubtitleTrackOptions {
    pub language: Option<String>,
}

/// A WebVTT cue destined for a Matroska subtitle track. Identifier and settings travel
/// in a block addition.
#[derive(Clone, Debug)]
pub struct MkvSubtitleCue {
    pub timestamp: f64,
    pub duration: f64,
    pub text: String,
    pub identifier: Option<String>,
    pub settings: Option<String>,
}

struct Sample {
    pts: f64,
    duration: f64,
    data: Vec<u8>,
    is_key: bool,
    /// Out-of-band bits carried in a BlockAdditions element.
    addition: Option<Vec<u8>>,
    /// Force BlockGroup emission with an explicit duration.
    needs_block_group: bool,
}

enum TrackKind {
    Video { options: VideoTrackOptions, config: Option<VideoDecoderConfig> },
    Audio { options: AudioTrackOptions, config: Option<AudioDecoderConfig> },
    Subtitle { options: SubtitleTrackOptions },
}

struct TrackState {
    id: TrackId,
    kind: TrackKind,
    first_seen: bool,
    timestamp_offset: f64,
    max_timestamp: f64,
    last_key_timestamp: f64,
    max_end_timestamp: f64,
    pending: VecDeque<Sample>,
    /// Timestamp of the most recently written block, for reference blocks.
    last_written_ms: Option<i64>,
    /// Whether the track contributed a block to the open cluster.
    in_cluster: bool,
    closed: bool,
}

impl TrackState {
    fn offset_timestamps(&self) -> bool {
        match &self.kind {
            TrackKind::Video { options, .. } => options.offset_timestamps,
            TrackKind::Audio { options, .. } => options.offset_timestamps,
            TrackKind::Subtitle { .. } => false,
        }
    }
}

struct ClusterState {
    /// File position of the cluster element.
    pos: u64,
    /// Open size field, absent in streamable mode.
    open: Option<OpenElement>,
    timestamp_ms: i64,
}

struct CuePointData {
    time_ms: i64,
    /// `(track id, cluster position relative to the segment data start)`.
    positions: Vec<(TrackId, u64)>,
}

struct MkvInner {
    writer: Writer,
    options: MkvMuxerOptions,
    started: bool,
    finalized: bool,
    tracks: Vec<TrackState>,
    segment_open: Option<OpenElement>,
    segment_data_start: u64,
    /// File positions of the seek head's three position payloads.
    seek_position_patches: Option<[u64; 3]>,
    /// File position of the duration float payload.
    duration_patch: Option<u64>,
    info_pos: u64,
    tracks_pos: u64,
    tracks_written: bool,
    cues_file_pos: u64,
    cluster: Option<ClusterState>,
    cue_points: Vec<CuePointData>,
}

/// Matroska/WebM muxer. All methods serialize through one FIFO mutex.
pub struct MkvMuxer {
    state: AsyncMutex<MkvInner>,
}

impl MkvMuxer {
    pub fn new(target: OutputTarget, options: MkvMuxerOptions) -> Self {
        MkvMuxer {
            state: AsyncMutex::new(MkvInner {
                writer: target.into_writer(options.streamable),
                options,
                started: false,
                finalized: false,
                tracks: Vec::new(),
                segment_open: None,
                segment_data_start: 0,
                seek_position_patches: None,
                duration_patch: None,
                info_pos: 0,
                tracks_pos: 0,
                tracks_written: false,
                cues_file_pos: 0,
                cluster: None,
                cue_points: Vec::new(),
            }),
        }
    }

    /// Add a video track. Tracks must be added before `start`.
    pub async fn add_video_track(&self, options: VideoTrackOptions) -> Result<TrackId> {
        let mut inner = self.state.lock().await;

        if let (MkvVariant::Webm, Some(codec)) = (inner.options.variant, options.codec) {
            if !webm_allows_video(codec) {
                return invalid_metadata_error("codec is not allowed in webm");
            }
        }

        inner.add_track(|id| TrackState::new(id, TrackKind::Video { options, config: None }))
    }

    /// Add an audio track. Tracks must be added before `start`.
    pub async fn add_audio_track(&self, options: AudioTrackOptions) -> Result<TrackId> {
        let mut inner = self.state.lock().await;

        if let (MkvVariant::Webm, Some(codec)) = (inner.options.variant, options.codec) {
            if !webm_allows_audio(codec) {
                return invalid_metadata_error("codec is not allowed in webm");
            }
        }

        inner.add_track(|id| TrackState::new(id, TrackKind::Audio { options, config: None }))
    }

    /// Add a WebVTT subtitle track. Tracks must be added before `start`.
    pub async fn add_subtitle_track(&self, options: SubtitleTrackOptions) -> Result<TrackId> {
        let mut inner = self.state.lock().await;
        inner.add_track(|id| TrackState::new(id, TrackKind::Subtitle { options }))
    }

    /// Write the EBML header and open the segment.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.state.lock().await;

        if inner.started {
            return programmer_error("output was already started");
        }
        if inner.tracks.is_empty() {
            return invalid_metadata_error("output requires at least one track");
        }
        inner.started = true;

        inner.write_file_header();
        inner.writer.flush().await
    }

    /// Submit one encoded video sample in decode order. The decoder configuration must
    /// accompany the first sample.
    pub async fn add_video_packet(
        &self,
        track: TrackId,
        packet: &EncodedPacket,
        config: Option<&VideoDecoderConfig>,
    ) -> Result<()> {
        let mut inner = self.state.lock().await;
        inner.check_live()?;

        let idx = inner.track_index(track)?;

        if let Some(config) = config {
            config.validate()?;
            if inner.options.variant == MkvVariant::Webm && !webm_allows_video(config.codec) {
                return invalid_metadata_error("codec is not allowed in webm");
            }
            match &mut inner.tracks[idx].kind {
                TrackKind::Video { config: slot, .. } => match slot {
                    None => *slot = Some(config.clone()),
                    Some(prev) => {
                        if prev.coded_width != config.coded_width
                            || prev.coded_height != config.coded_height
                        {
                            return Err(Error::DimensionChange(
                                "video coded size changed mid-track",
                            ));
                        }
                    }
                },
                _ => return programmer_error("video packet submitted to a non-video track"),
            }
        }

        let mut data = packet.data.to_vec();

        // Recover colour-space bits that VP9 encoders leave unset.
        if packet.is_key() {
            if let TrackKind::Video { config: Some(config), .. } = &inner.tracks[idx].kind {
                if config.codec == VideoCodec::Vp9 {
                    if let Some(color_space) = &config.color_space {
                        if color_space.is_complete() {
                            patch_vp9_color_space(&mut data, color_space)?;
                        }
                    }
                }
            }
        }

        match &inner.tracks[idx].kind {
            TrackKind::Video { config: Some(_), .. } => (),
            TrackKind::Video { config: None, .. } => {
                return invalid_metadata_error("first video sample requires a decoder config")
            }
            _ => return programmer_error("video packet submitted to a non-video track"),
        }

        let sample = Sample {
            pts: packet.timestamp_secs(),
            duration: packet.duration_secs(),
            data,
            is_key: packet.is_key(),
            addition: None,
            needs_block_group: false,
        };
        inner.register_sample(idx, sample)?;
        inner.interleave(false)?;
        inner.writer.flush().await
    }

    /// Submit one encoded audio sample. The decoder configuration must accompany the
    /// first sample.
    pub async fn add_audio_packet(
        &self,
        track: TrackId,
        packet: &EncodedPacket,
        config: Option<&AudioDecoderConfig>,
    ) -> Result<()> {
        let mut inner = self.state.lock().await;
        inner.check_live()?;

        let idx = inner.track_index(track)?;

        if let Some(config) = config {
            config.validate()?;
            if inner.options.variant == MkvVariant::Webm && !webm_allows_audio(config.codec) {
                return invalid_metadata_error("codec is not allowed in webm");
            }
            match &mut inner.tracks[idx].kind {
                TrackKind::Audio { config: slot, .. } => match slot {
                    None => *slot = Some(config.clone()),
                    Some(prev) => {
                        if prev.sample_rate != config.sample_rate
                            || prev.channel_count != config.channel_count
                        {
                            return Err(Error::AudioParamsChange(
                                "audio parameters changed mid-track",
                            ));
                        }
                    }
                },
                _ => return programmer_error("audio packet submitted to a non-audio track"),
            }
        }

        match &inner.tracks[idx].kind {
            TrackKind::Audio { config: Some(_), .. } => (),
            TrackKind::Audio { config: None, .. } => {
                return invalid_metadata_error("first audio sample requires a decoder config")
            }
            _ => return programmer_error("audio packet submitted to a non-audio track"),
        }

        let sample = Sample {
            pts: packet.timestamp_secs(),
            duration: packet.duration_secs(),
            data: packet.data.to_vec(),
            is_key: packet.is_key(),
            addition: None,
            needs_block_group: false,
        };
        inner.register_sample(idx, sample)?;
        inner.interleave(false)?;
        inner.writer.flush().await
    }

    /// Submit one subtitle cue. The cue text travels in the block; identifier and
    /// settings, when present, travel in a block addition.
    pub async fn add_subtitle_cue(&self, track: TrackId, cue: MkvSubtitleCue) -> Result<()> {
        let mut inner = self.state.lock().await;
        inner.check_live()?;

        let idx = inner.track_index(track)?;
        if !matches!(inner.tracks[idx].kind, TrackKind::Subtitle { .. }) {
            return programmer_error("subtitle cue submitted to a non-subtitle track");
        }

        let addition = match (&cue.identifier, &cue.settings) {
            (None, None) => None,
            (identifier, settings) => {
                let mut bytes = Vec::new();
                bytes.extend_from_slice(identifier.as_deref().unwrap_or("").as_bytes());
                bytes.push(b'\n');
                bytes.extend_from_slice(settings.as_deref().unwrap_or("").as_bytes());
                Some(bytes)
            }
        };

        let sample = Sample {
            pts: cue.timestamp,
            duration: cue.duration,
            data: cue.text.into_bytes(),
            is_key: true,
            addition,
            needs_block_group: true,
        };
        inner.register_sample(idx, sample)?;
        inner.interleave(false)?;
        inner.writer.flush().await
    }

    /// Mark a track as complete. Closed tracks no longer hold back interleaving.
    pub async fn close_track(&self, track: TrackId) -> Result<()> {
        let mut inner = self.state.lock().await;
        inner.check_live()?;

        let idx = inner.track_index(track)?;
        inner.tracks[idx].closed = true;
        inner.interleave(false)?;
        inner.writer.flush().await
    }

    /// Drain all tracks, close the last cluster, write the cues, and backpatch the
    /// segment-level fields.
    pub async fn finalize(&self) -> Result<()> {
        let mut inner = self.state.lock().await;

        if !inner.started {
            return programmer_error("output was never started");
        }
        if inner.finalized {
            return programmer_error("output was already finalized");
        }
        inner.finalized = true;

        for track in inner.tracks.iter_mut() {
            track.closed = true;
        }
        inner.interleave(true)?;

        inner.close_cluster();
        inner.ensure_tracks_written()?;
        inner.write_cues();
        inner.backpatch();

        inner.writer.finalize().await
    }
}

impl MkvInner {
    fn add_track(&mut self, make: impl FnOnce(TrackId) -> TrackState) -> Result<TrackId> {
        if self.started {
            return programmer_error("tracks must be added before starting the output");
        }

        let id = self.tracks.len() as TrackId + 1;
        self.tracks.push(make(id));
        Ok(id)
    }

    fn check_live(&self) -> Result<()> {
        if !self.started {
            return programmer_error("samples cannot be added before starting the output");
        }
        if self.finalized {
            return programmer_error("samples cannot be added after finalization");
        }
        Ok(())
    }

    fn track_index(&self, id: TrackId) -> Result<usize> {
        if id == 0 || id as usize > self.tracks.len() {
            return programmer_error("unknown track id");
        }
        Ok(id as usize - 1)
    }

    fn write_file_header(&mut self) {
        let mut ebml = EbmlWriter::new(&mut self.writer);

        let doc_type = match self.options.variant {
            MkvVariant::Webm => "webm",
            MkvVariant::Mkv => "matroska",
        };

        let header = ebml.begin_master(ids::EBML, 1);
        ebml.element_uint(ids::EBML_VERSION, 1);
        ebml.element_uint(ids::EBML_READ_VERSION, 1);
        ebml.element_uint(ids::EBML_MAX_ID_LENGTH, 4);
        ebml.element_uint(ids::EBML_MAX_SIZE_LENGTH, 8);
        ebml.element_str(ids::DOC_TYPE, doc_type);
        ebml.element_uint(ids::DOC_TYPE_VERSION, 2);
        ebml.element_uint(ids::DOC_TYPE_READ_VERSION, 2);
        ebml.end_master(header);

        // Segment with a fixed-width size for later backpatching, or open-ended in
        // streamable mode.
        if self.options.streamable {
            ebml.begin_master_unsized(ids::SEGMENT);
            self.segment_open = None;
        }
        else {
            self.segment_open = Some(ebml.begin_master(ids::SEGMENT, SEGMENT_SIZE_WIDTH));
        }
        self.segment_data_start = ebml.pos();

        // Seek head with placeholder positions, patched during finalization.
        if !self.options.streamable {
            let mut patches = [0u64; 3];
            let seek_head = ebml.begin_master(ids::SEEK_HEAD, 2);
            for (i, target) in [ids::INFO, ids::TRACKS, ids::CUES].into_iter().enumerate() {
                let seek = ebml.begin_master(ids::SEEK, 1);
                ebml.element_bin(ids::SEEK_ID, &id_bytes(target));
                ebml.write_id(ids::SEEK_POSITION);
                ebml.write_size(8, 1);
                patches[i] = ebml.pos();
                ebml.raw(&0u64.to_be_bytes());
                ebml.end_master(seek);
            }
            ebml.end_master(seek_head);
            self.seek_position_patches = Some(patches);
        }

        // Info.
        self.info_pos = ebml.pos();
        let info = ebml.begin_master(ids::INFO, 2);
        ebml.element_uint(ids::TIMESTAMP_SCALE, TIMESTAMP_SCALE_NS);
        ebml.element_str(ids::MUXING_APP, "Vessel");
        ebml.element_str(ids::WRITING_APP, "Vessel");
        if !self.options.streamable {
            // Duration placeholder, patched during finalization.
            ebml.write_id(ids::DURATION);
            ebml.write_size(8, 1);
            self.duration_patch = Some(ebml.pos());
            ebml.raw(&0f64.to_be_bytes());
        }
        ebml.end_master(info);

        // The track entries need the decoder configurations, which arrive with the
        // first samples; Tracks is written just before the first cluster.
    }

    /// Write the Tracks element once every configured track can be described.
    fn ensure_tracks_written(&mut self) -> Result<()> {
        if self.tracks_written {
            return Ok(());
        }
        self.tracks_written = true;

        self.tracks_pos = self.writer.pos();

        struct Entry {
            id: TrackId,
            track_type: u64,
            codec_id: &'static str,
            codec_private: Option<Vec<u8>>,
            default_duration_ns: Option<u64>,
            language: Option<String>,
            video: Option<(u32, u32, Option<vessel_core::codecs::ColorSpace>)>,
            audio: Option<(f64, u64)>,
        }

        let mut entries = Vec::new();

        for track in &self.tracks {
            let entry = match &track.kind {
                TrackKind::Video { options, config } => {
                    let config = match config {
                        Some(config) => config,
                        // A track that never received a sample cannot be described.
                        None => continue,
                    };
                    Entry {
                        id: track.id,
                        track_type: track_types::VIDEO,
                        codec_id: video_codec_id(config.codec),
                        codec_private: config.description.as_ref().map(|d| d.to_vec()),
                        default_duration_ns: options
                            .frame_rate
                            .map(|rate| (1_000_000_000.0 / rate).round() as u64),
                        language: options.language.clone(),
                        video: Some((
                            config.coded_width,
                            config.coded_height,
                            config.color_space.filter(|c| c.is_complete()),
                        )),
                        audio: None,
                    }
                }
                TrackKind::Audio { options, config } => {
                    let config = match config {
                        Some(config) => config,
                        None => continue,
                    };
                    Entry {
                        id: track.id,
                        track_type: track_types::AUDIO,
                        codec_id: audio_codec_id(config.codec),
                        codec_private: audio_codec_private(config),
                        default_duration_ns: None,
                        language: options.language.clone(),
                        video: None,
                        audio: Some((
                            f64::from(config.sample_rate),
                            u64::from(config.channel_count),
                        )),
                    }
                }
                TrackKind::Subtitle { options } => Entry {
                    id: track.id,
                    track_type: track_types::SUBTITLE,
                    codec_id: subtitle_codec_id(
                        vessel_core::codecs::SubtitleCodec::WebVtt,
                    ),
                    codec_private: None,
                    default_duration_ns: None,
                    language: options.language.clone(),
                    video: None,
                    audio: None,
                },
            };
            entries.push(entry);
        }

        let mut ebml = EbmlWriter::new(&mut self.writer);
        let tracks = ebml.begin_master(ids::TRACKS, 2);

        for entry in entries {
            let track_entry = ebml.begin_master(ids::TRACK_ENTRY, 2);
            ebml.element_uint(ids::TRACK_NUMBER, entry.id);
            ebml.element_uint(ids::TRACK_UID, entry.id);
            ebml.element_uint(ids::TRACK_TYPE, entry.track_type);
            ebml.element_uint(ids::FLAG_LACING, 0);
            if let Some(language) = &entry.language {
                ebml.element_str(ids::LANGUAGE, language);
            }
            ebml.element_str(ids::CODEC_ID, entry.codec_id);
            if let Some(private) = &entry.codec_private {
                ebml.element_bin(ids::CODEC_PRIVATE, private);
            }
            if let Some(duration) = entry.default_duration_ns {
                ebml.element_uint(ids::DEFAULT_DURATION, duration);
            }

            if let Some((width, height, color_space)) = entry.video {
                let video = ebml.begin_master(ids::VIDEO, 2);
                ebml.element_uint(ids::PIXEL_WIDTH, u64::from(width));
                ebml.element_uint(ids::PIXEL_HEIGHT, u64::from(height));
                if let Some(color) = color_space {
                    let colour = ebml.begin_master(ids::COLOUR, 1);
                    ebml.element_uint(
                        ids::MATRIX_COEFFICIENTS,
                        u64::from(color.matrix.unwrap_or(2)),
                    );
                    ebml.element_uint(
                        ids::TRANSFER_CHARACTERISTICS,
                        u64::from(color.transfer.unwrap_or(2)),
                    );
                    ebml.element_uint(ids::PRIMARIES, u64::from(color.primaries.unwrap_or(2)));
                    ebml.element_uint(
                        ids::RANGE,
                        if color.full_range.unwrap_or(false) { 2 } else { 1 },
                    );
                    ebml.end_master(colour);
                }
                ebml.end_master(video);
            }

            if let Some((sample_rate, channels)) = entry.audio {
                let audio = ebml.begin_master(ids::AUDIO, 2);
                ebml.element_f64(ids::SAMPLING_FREQUENCY, sample_rate);
                ebml.element_uint(ids::CHANNELS, channels);
                ebml.end_master(audio);
            }

            ebml.end_master(track_entry);
        }

        ebml.end_master(tracks);
        Ok(())
    }

    /// Validate a sample's timing, normalize it, and queue it for interleaving.
    fn register_sample(&mut self, idx: usize, mut sample: Sample) -> Result<()> {
        let track = &mut self.tracks[idx];

        if track.closed {
            return programmer_error("samples cannot be added to a closed track");
        }

        if !track.first_seen {
            if !sample.is_key {
                return timestamp_order_error(format!(
                    "track {}: first sample must be a key frame",
                    track.id
                ));
            }
            if track.offset_timestamps() {
                track.timestamp_offset = sample.pts;
            }
            track.first_seen = true;
        }

        sample.pts -= track.timestamp_offset;

        if sample.pts < 0.0 {
            return timestamp_order_error(format!(
                "track {}: negative timestamp {}",
                track.id, sample.pts
            ));
        }
        if sample.duration < 0.0 {
            return timestamp_order_error(format!(
                "track {}: negative duration {}",
                track.id, sample.duration
            ));
        }

        if sample.is_key {
            if sample.pts < track.max_timestamp {
                return timestamp_order_error(format!(
                    "track {}: key frame timestamp {} precedes an earlier sample at {}",
                    track.id, sample.pts, track.max_timestamp
                ));
            }
            track.last_key_timestamp = sample.pts;
        }
        else if sample.pts < track.last_key_timestamp {
            return timestamp_order_error(format!(
                "track {}: timestamp {} precedes the preceding key frame at {}",
                track.id, sample.pts, track.last_key_timestamp
            ));
        }

        track.max_timestamp = track.max_timestamp.max(sample.pts);
        track.max_end_timestamp = track.max_end_timestamp.max(sample.pts + sample.duration);

        track.pending.push_back(sample);
        Ok(())
    }

    /// Move samples into clusters, always advancing the track with the smallest front
    /// timestamp.
    fn interleave(&mut self, force: bool) -> Result<()> {
        loop {
            if !force && self.tracks.iter().any(|t| !t.closed && t.pending.is_empty()) {
                return Ok(());
            }

            let mut pick: Option<usize> = None;
            for (idx, track) in self.tracks.iter().enumerate() {
                let front = match track.pending.front() {
                    Some(front) => front.pts,
                    None => continue,
                };
                match pick {
                    Some(best) if self.tracks[best].pending.front().unwrap().pts <= front => (),
                    _ => pick = Some(idx),
                }
            }

            let idx = match pick {
                Some(idx) => idx,
                None => return Ok(()),
            };

            let sample = self.tracks[idx].pending.pop_front().unwrap();
            self.write_block(idx, sample)?;
        }
    }

    fn write_block(&mut self, idx: usize, sample: Sample) -> Result<()> {
        let ms = secs_to_timescale(sample.pts, MS_TIMESCALE);

        // Cluster boundary: the first block ever, or a key-aligned cut point once the
        // cluster is long enough. Only video tracks trigger cuts when the output has
        // one, keeping clusters aligned to video key frames rather than to dense
        // all-key audio.
        let has_video = self.tracks.iter().any(|t| matches!(t.kind, TrackKind::Video { .. }));
        let triggers = !has_video || matches!(self.tracks[idx].kind, TrackKind::Video { .. });

        let cut = match &self.cluster {
            None => true,
            Some(cluster) => {
                sample.is_key
                    && triggers
                    && ms - cluster.timestamp_ms >= CLUSTER_DURATION_MS
                    && self.tracks.iter().enumerate().all(|(other, track)| {
                        other == idx
                            || track.closed
                            || track.pending.front().map(|f| f.is_key).unwrap_or(true)
                    })
            }
        };

        if cut {
            self.close_cluster();
            self.ensure_tracks_written()?;
            self.open_cluster(ms);
        }

        let cluster_ts = self.cluster.as_ref().map(|c| c.timestamp_ms).unwrap_or(0);
        let rel = ms - cluster_ts;
        if rel > MAX_CLUSTER_SPAN_MS || rel < i64::from(i16::MIN) {
            return Err(Error::ClusterOverflow(
                "block timestamp exceeds the signed 16-bit cluster-relative range",
            ));
        }

        let track_id = self.tracks[idx].id;
        let duration_ms = secs_to_timescale(sample.duration, MS_TIMESCALE);

        // The block payload common to SimpleBlock and Block: track number vint,
        // 16-bit relative timestamp, flags.
        let mut block = Vec::with_capacity(sample.data.len() + 8);
        write_vint_into(&mut block, track_id);
        block.extend_from_slice(&(rel as i16).to_be_bytes());

        let mut ebml = EbmlWriter::new(&mut self.writer);

        if sample.needs_block_group || sample.addition.is_some() {
            // Flags carry no key bit inside a BlockGroup.
            block.push(0);
            block.extend_from_slice(&sample.data);

            let group = ebml.begin_master(ids::BLOCK_GROUP, 2);
            ebml.element_bin(ids::BLOCK, &block);

            if !sample.is_key {
                if let Some(prev_ms) = self.tracks[idx].last_written_ms {
                    // Reference the predecessor block, relative to this block.
                    let mut reference = Vec::new();
                    let delta = prev_ms - ms;
                    let width = 2;
                    let bytes = (delta as i16).to_be_bytes();
                    reference.extend_from_slice(&bytes);
                    ebml.write_id(ids::REFERENCE_BLOCK);
                    ebml.write_size(width, 1);
                    ebml.raw(&reference);
                }
            }

            if let Some(addition) = &sample.addition {
                let additions = ebml.begin_master(ids::BLOCK_ADDITIONS, 1);
                let more = ebml.begin_master(ids::BLOCK_MORE, 1);
                ebml.element_uint(ids::BLOCK_ADD_ID, 1);
                ebml.element_bin(ids::BLOCK_ADDITIONAL, addition);
                ebml.end_master(more);
                ebml.end_master(additions);
            }

            ebml.element_uint(ids::BLOCK_DURATION, duration_ms as u64);
            ebml.end_master(group);
        }
        else {
            // SimpleBlock: bit 7 of the flags marks a key frame.
            block.push(if sample.is_key { 0x80 } else { 0 });
            block.extend_from_slice(&sample.data);
            ebml.element_bin(ids::SIMPLE_BLOCK, &block);
        }

        self.tracks[idx].last_written_ms = Some(ms);
        self.tracks[idx].in_cluster = true;
        Ok(())
    }

    fn open_cluster(&mut self, timestamp_ms: i64) {
        let pos = self.writer.pos();
        let mut ebml = EbmlWriter::new(&mut self.writer);

        let open = if self.options.streamable {
            ebml.begin_master_unsized(ids::CLUSTER);
            None
        }
        else {
            Some(ebml.begin_master(ids::CLUSTER, CLUSTER_SIZE_WIDTH))
        };

        ebml.element_uint(ids::TIMESTAMP, timestamp_ms as u64);

        for track in self.tracks.iter_mut() {
            track.in_cluster = false;
        }

        self.cluster = Some(ClusterState { pos, open, timestamp_ms });
        debug!("opened cluster at {} ms", timestamp_ms);
    }

    /// Close the open cluster: backpatch its size and record its cue point.
    fn close_cluster(&mut self) {
        let cluster = match self.cluster.take() {
            Some(cluster) => cluster,
            None => return,
        };

        if let Some(open) = cluster.open {
            let mut ebml = EbmlWriter::new(&mut self.writer);
            ebml.end_master(open);
        }

        let positions: Vec<(TrackId, u64)> = self
            .tracks
            .iter()
            .filter(|t| t.in_cluster)
            .map(|t| (t.id, cluster.pos - self.segment_data_start))
            .collect();

        if !positions.is_empty() {
            self.cue_points.push(CuePointData { time_ms: cluster.timestamp_ms, positions });
        }
    }

    fn write_cues(&mut self) {
        let cues_pos = self.writer.pos();
        let mut ebml = EbmlWriter::new(&mut self.writer);

        let cues = ebml.begin_master(ids::CUES, 4);
        for point in &self.cue_points {
            let cue_point = ebml.begin_master(ids::CUE_POINT, 2);
            ebml.element_uint(ids::CUE_TIME, point.time_ms as u64);
            for &(track_id, position) in &point.positions {
                let positions = ebml.begin_master(ids::CUE_TRACK_POSITIONS, 1);
                ebml.element_uint(ids::CUE_TRACK, track_id);
                ebml.element_uint(ids::CUE_CLUSTER_POSITION, position);
                ebml.end_master(positions);
            }
            ebml.end_master(cue_point);
        }
        ebml.end_master(cues);

        // Remembered for the seek head patch.
        self.cues_file_pos = cues_pos;
    }

    fn backpatch(&mut self) {
        if self.options.streamable {
            return;
        }

        let end = self.writer.pos();

        // Segment size.
        if let Some(open) = self.segment_open.take() {
            let mut ebml = EbmlWriter::new(&mut self.writer);
            ebml.end_master(open);
        }

        // Duration, in timestamp-scale ticks (milliseconds).
        if let Some(pos) = self.duration_patch {
            let duration_ms = self
                .tracks
                .iter()
                .map(|t| t.max_end_timestamp)
                .fold(0.0f64, f64::max)
                * 1000.0;
            self.writer.seek(pos);
            self.writer.write(&duration_ms.to_be_bytes());
        }

        // Seek head positions, relative to the segment data start.
        if let Some(patches) = self.seek_position_patches {
            let targets = [
                self.info_pos - self.segment_data_start,
                self.tracks_pos.saturating_sub(self.segment_data_start),
                self.cues_file_pos - self.segment_data_start,
            ];
            for (pos, value) in patches.into_iter().zip(targets) {
                self.writer.seek(pos);
                self.writer.write(&value.to_be_bytes());
            }
        }

        self.writer.seek(end);
    }
}

impl TrackState {
    fn new(id: TrackId, kind: TrackKind) -> Self {
        TrackState {
            id,
            kind,
            first_seen: false,
            timestamp_offset: 0.0,
            max_timestamp: 0.0,
            last_key_timestamp: 0.0,
            max_end_timestamp: 0.0,
            pending: VecDeque::new(),
            last_written_ms: None,
            in_cluster: false,
            closed: false,
        }
    }
}

/// The raw byte string of an element id.
fn id_bytes(id: u32) -> Vec<u8> {
    let bytes = id.to_be_bytes();
    let skip = (id.leading_zeros() / 8) as usize;
    bytes[skip..].to_vec()
}

/// Build the codec-private bytes for an audio configuration when the container needs
/// one and the caller did not supply it.
fn audio_codec_private(config: &AudioDecoderConfig) -> Option<Vec<u8>> {
    if let Some(description) = &config.description {
        return Some(description.to_vec());
    }

    match config.codec {
        AudioCodec::Opus => {
            // A minimal OpusHead.
            let mut head = Vec::new();
            head.extend_from_slice(b"OpusHead");
            head.push(1);
            head.push(config.channel_count as u8);
            head.extend_from_slice(&3840u16.to_le_bytes()); // Pre-skip.
            head.extend_from_slice(&config.sample_rate.to_le_bytes());
            head.extend_from_slice(&0u16.to_le_bytes()); // Output gain.
            head.push(0); // Channel mapping family.
            Some(head)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_core::io::BufferTarget;
    use vessel_core::packet::{PacketKind, PacketSeq};

    fn video_config() -> VideoDecoderConfig {
        VideoDecoderConfig {
            codec: VideoCodec::Avc,
            coded_width: 320,
            coded_height: 180,
            description: None,
            color_space: None,
        }
    }

    fn opus_config() -> AudioDecoderConfig {
        AudioDecoderConfig {
            codec: AudioCodec::Opus,
            sample_rate: 48_000,
            channel_count: 2,
            description: None,
        }
    }

    fn packet(timestamp_us: i64, duration_us: i64, key: bool, data: Vec<u8>) -> EncodedPacket {
        EncodedPacket::new(
            data,
            timestamp_us,
            duration_us,
            if key { PacketKind::Key } else { PacketKind::Delta },
            PacketSeq::new(0, 0),
        )
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    #[tokio::test]
    async fn verify_clusters_cut_on_video_key_frames() {
        let target = BufferTarget::new();
        let muxer = MkvMuxer::new(OutputTarget::buffer(target.clone()), MkvMuxerOptions::default());

        let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
        let audio = muxer.add_audio_track(AudioTrackOptions::default()).await.unwrap();
        muxer.start().await.unwrap();

        // Video every 500 ms with keys at 0 and 2 s; audio is dense and all-key, so it
        // must not cut clusters on its own.
        for i in 0..8i64 {
            let config = if i == 0 { Some(video_config()) } else { None };
            let p = packet(i * 500_000, 500_000, i % 4 == 0, vec![0x40 + i as u8; 8]);
            muxer.add_video_packet(video, &p, config.as_ref()).await.unwrap();
        }
        for i in 0..16i64 {
            let config = if i == 0 { Some(opus_config()) } else { None };
            let p = packet(i * 250_000, 250_000, true, vec![0x60 + i as u8; 4]);
            muxer.add_audio_packet(audio, &p, config.as_ref()).await.unwrap();
        }
        muxer.finalize().await.unwrap();

        let inner = muxer.state.lock().await;
        let times: Vec<i64> = inner.cue_points.iter().map(|p| p.time_ms).collect();
        assert_eq!(times, vec![0, 2_000]);
        for point in &inner.cue_points {
            assert_eq!(point.positions.len(), 2);
        }
        drop(inner);

        // Interleaving favors the lower track id on equal timestamps, so the video
        // block at time zero precedes the audio block.
        let bytes = target.take_buffer().unwrap();
        let video_block = find(&bytes, &[0x81, 0x00, 0x00, 0x80]).unwrap();
        let audio_block = find(&bytes, &[0x82, 0x00, 0x00, 0x80]).unwrap();
        assert!(video_block < audio_block);
    }

    #[tokio::test]
    async fn verify_simple_block_serialization() {
        let target = BufferTarget::new();
        let muxer = MkvMuxer::new(OutputTarget::buffer(target.clone()), MkvMuxerOptions::default());

        let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
        muxer.start().await.unwrap();

        let key = packet(0, 40_000, true, vec![0x21, 0x22, 0x23]);
        muxer.add_video_packet(video, &key, Some(&video_config())).await.unwrap();
        let delta = packet(40_000, 40_000, false, vec![0x24, 0x25, 0x26]);
        muxer.add_video_packet(video, &delta, None).await.unwrap();
        muxer.finalize().await.unwrap();

        let bytes = target.take_buffer().unwrap();

        // Track number vint, 16-bit relative timestamp, flags (bit 7 = key), payload.
        assert!(find(&bytes, &[0x81, 0x00, 0x00, 0x80, 0x21, 0x22, 0x23]).is_some());
        assert!(find(&bytes, &[0x81, 0x00, 0x28, 0x00, 0x24, 0x25, 0x26]).is_some());
    }

    #[tokio::test]
    async fn verify_subtitle_block_group() {
        let target = BufferTarget::new();
        let muxer = MkvMuxer::new(OutputTarget::buffer(target.clone()), MkvMuxerOptions::default());

        let subtitles = muxer.add_subtitle_track(SubtitleTrackOptions::default()).await.unwrap();
        muxer.start().await.unwrap();

        muxer
            .add_subtitle_cue(
                subtitles,
                MkvSubtitleCue {
                    timestamp: 0.0,
                    duration: 1.2,
                    text: "Hi".into(),
                    identifier: Some("c1".into()),
                    settings: Some("line:10%".into()),
                },
            )
            .await
            .unwrap();
        muxer.finalize().await.unwrap();

        let bytes = target.take_buffer().unwrap();

        // The Block inside the group carries no key bit in its flags.
        assert!(find(&bytes, &[0xa1, 0x86, 0x81, 0x00, 0x00, 0x00, b'H', b'i']).is_some());

        // BlockDuration of 1200 ms.
        assert!(find(&bytes, &[0x9b, 0x82, 0x04, 0xb0]).is_some());

        // The identifier and settings travel in a block addition.
        let mut addition = vec![0xa5, 0x8b];
        addition.extend_from_slice(b"c1\nline:10%");
        assert!(find(&bytes, &addition).is_some());
    }

    #[tokio::test]
    async fn verify_streamable_layout_is_open_ended() {
        let target = BufferTarget::new();
        let muxer = MkvMuxer::new(
            OutputTarget::buffer(target.clone()),
            MkvMuxerOptions { variant: MkvVariant::Mkv, streamable: true },
        );

        let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
        muxer.start().await.unwrap();
        let p = packet(0, 40_000, true, vec![0x21, 0x22, 0x23]);
        muxer.add_video_packet(video, &p, Some(&video_config())).await.unwrap();
        muxer.finalize().await.unwrap();

        let bytes = target.take_buffer().unwrap();

        // Segment and cluster use the unknown-size sentinel, and no seek head is
        // reserved.
        assert!(find(&bytes, &[0x18, 0x53, 0x80, 0x67, 0xff]).is_some());
        assert!(find(&bytes, &[0x1f, 0x43, 0xb6, 0x75, 0xff]).is_some());
        assert!(find(&bytes, &[0x11, 0x4d, 0x9b, 0x74]).is_none());
    }
}
