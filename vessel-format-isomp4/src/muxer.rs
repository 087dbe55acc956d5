// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ISO BMFF muxer with three output modes: streaming (mdat first, moov last),
//! in-memory fast start (moov before mdat), and fragmented (moof/mdat pairs with a
//! trailing mfra index).

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use vessel_core::codecs::{AudioCodec, AudioDecoderConfig, ColorSpace, VideoCodec, VideoDecoderConfig};
use vessel_core::errors::{
    invalid_metadata_error, programmer_error, timestamp_order_error, Error, Result,
};
use vessel_core::io::{OutputTarget, Writer};
use vessel_core::packet::EncodedPacket;
use vessel_core::sync::AsyncMutex;
use vessel_core::track::Rotation;
use vessel_core::units::secs_to_timescale;

use crate::boxes::moof::{TfhdFlags, TrunFlags, SAMPLE_FLAGS_DELTA, SAMPLE_FLAGS_KEY};
use crate::boxes::stsd::AacAudioSpecificConfig;
use crate::boxes::write::{write_box, ByteBuf, MuxBox, MP4_EPOCH_OFFSET};
use crate::vtt::{CuePacker, SubtitleCue};

/// Track timescale used for video unless the frame rate requires a finer one.
pub const DEFAULT_VIDEO_TIMESCALE: u32 = 57_600;
/// Track timescale used for subtitle tracks.
const SUBTITLE_TIMESCALE: u32 = 1_000;
/// Movie timescale (mvhd).
const MOVIE_TIMESCALE: u32 = 1_000;

/// A new chunk is started once the current one spans this many seconds.
const CHUNK_DURATION: f64 = 0.5;
/// A fragment is cut at a key sample once the current fragment spans this many seconds.
const FRAGMENT_DURATION: f64 = 1.0;

/// Output mode, chosen at construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mp4Mode {
    /// `ftyp`, a large-size `mdat` written as samples arrive, `moov` at the end. The
    /// target must accept one backpatch of the mdat size.
    Streaming,
    /// Samples are buffered in memory and the index is written ahead of the payload.
    FastStart,
    /// `ftyp` + `moov` with movie-extends defaults, then `moof`/`mdat` pairs and a
    /// trailing `mfra`. Strictly append-only.
    Fragmented,
}

/// Container flavor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mp4Variant {
    Mp4,
    Mov,
}

#[derive(Copy, Clone, Debug)]
pub struct Mp4MuxerOptions {
    pub mode: Mp4Mode,
    pub variant: Mp4Variant,
}

impl Default for Mp4MuxerOptions {
    fn default() -> Self {
        Mp4MuxerOptions { mode: Mp4Mode::Streaming, variant: Mp4Variant::Mp4 }
    }
}

pub type TrackId = u32;

#[derive(Clone, Debug, Default)]
pub struct VideoTrackOptions {
    pub codec: Option<VideoCodec>,
    pub frame_rate: Option<f64>,
    pub rotation: Rotation,
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

/// One media sample owned by the muxer until its chunk is flushed.
struct Sample {
    pts: f64,
    dts: f64,
    duration: f64,
    data: Vec<u8>,
    is_key: bool,
}

/// Decode-order sample metadata kept after payload bytes are released.
#[derive(Copy, Clone)]
struct SampleMeta {
    dts_ts: i64,
    pts_ts: i64,
    duration_ts: i64,
    size: u32,
    is_key: bool,
}

/// A finalized chunk: its file offset (streaming) or retained bytes (fast start).
struct ChunkMeta {
    offset: u64,
    sample_count: u32,
    data: Option<Vec<u8>>,
}

struct CurrentChunk {
    start_pts: f64,
    samples: Vec<Sample>,
}

enum TrackKind {
    Video { options: VideoTrackOptions, config: Option<VideoDecoderConfig> },
    Audio { options: AudioTrackOptions, config: Option<AudioDecoderConfig> },
    Subtitle { options: SubtitleTrackOptions, packer: CuePacker },
}

struct TrackState {
    id: TrackId,
    kind: TrackKind,
    timescale: Option<u32>,
    // Timestamp validation state.
    first_seen: bool,
    timestamp_offset: f64,
    max_timestamp: f64,
    last_key_timestamp: f64,
    max_end_timestamp: f64,
    /// Samples of the open key interval awaiting decode-timestamp assignment.
    queued: Vec<Sample>,
    /// Processed samples awaiting interleaving.
    pending: VecDeque<Sample>,
    // Non-fragmented chunk state.
    current_chunk: Option<CurrentChunk>,
    chunks: Vec<ChunkMeta>,
    /// Decode-order metadata of every written sample.
    samples: Vec<SampleMeta>,
    // Fragmented state.
    fragment_samples: Vec<Sample>,
    /// Random access index entries: sync sample time in track ticks, moof offset.
    tfra: Vec<(u64, u64)>,
    closed: bool,
}

impl TrackState {
    fn language(&self) -> Option<&str> {
        match &self.kind {
            TrackKind::Video { options, .. } => options.language.as_deref(),
            TrackKind::Audio { options, .. } => options.language.as_deref(),
            TrackKind::Subtitle { options, .. } => options.language.as_deref(),
        }
    }

    fn offset_timestamps(&self) -> bool {
        match &self.kind {
            TrackKind::Video { options, .. } => options.offset_timestamps,
            TrackKind::Audio { options, .. } => options.offset_timestamps,
            TrackKind::Subtitle { .. } => false,
        }
    }
}

struct MuxInner {
    writer: Writer,
    options: Mp4MuxerOptions,
    started: bool,
    finalized: bool,
    tracks: Vec<TrackState>,
    /// Position of the large-size mdat header in streaming mode.
    mdat_header_pos: Option<u64>,
    /// Global chunk write order for fast-start offset assignment.
    chunk_order: Vec<(usize, usize)>,
    moov_written: bool,
    next_sequence_number: u32,
    creation_time: u64,
}

/// ISO BMFF muxer.
///
/// All methods serialize through one FIFO mutex, so a muxer shared between tasks
/// observes submissions in request order, and sink backpressure suspends every caller.
pub struct Mp4Muxer {
    state: AsyncMutex<MuxInner>,
}

impl Mp4Muxer {
    pub fn new(target: OutputTarget, options: Mp4MuxerOptions) -> Self {
        // Fragmented output is streamable and must reach the sink append-only.
        let ensure_monotonicity = options.mode == Mp4Mode::Fragmented;

        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            + MP4_EPOCH_OFFSET;

        Mp4Muxer {
            state: AsyncMutex::new(MuxInner {
                writer: target.into_writer(ensure_monotonicity),
                options,
                started: false,
                finalized: false,
                tracks: Vec::new(),
                mdat_header_pos: None,
                chunk_order: Vec::new(),
                moov_written: false,
                next_sequence_number: 1,
                creation_time,
            }),
        }
    }

    /// Add a video track. Tracks must be added before `start`.
    pub async fn add_video_track(&self, options: VideoTrackOptions) -> Result<TrackId> {
        let mut inner = self.state.lock().await;
        inner.add_track(|id| TrackState::new(id, TrackKind::Video { options, config: None }))
    }

    /// Add an audio track. Tracks must be added before `start`.
    pub async fn add_audio_track(&self, options: AudioTrackOptions) -> Result<TrackId> {
        let mut inner = self.state.lock().await;
        inner.add_track(|id| TrackState::new(id, TrackKind::Audio { options, config: None }))
    }

    /// Add a WebVTT subtitle track. Tracks must be added before `start`.
    pub async fn add_subtitle_track(&self, options: SubtitleTrackOptions) -> Result<TrackId> {
        let mut inner = self.state.lock().await;
        inner.add_track(|id| {
            TrackState::new(id, TrackKind::Subtitle { options, packer: CuePacker::new() })
        })
    }

    /// Write the file type header and prepare the payload structures.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.state.lock().await;

        if inner.started {
            return programmer_error("output was already started");
        }
        if inner.tracks.is_empty() {
            return invalid_metadata_error("output requires at least one track");
        }
        inner.started = true;

        let ftyp = inner.build_ftyp();
        write_box(&mut inner.writer, &ftyp);

        if inner.options.mode == Mp4Mode::Streaming {
            // A large-size mdat whose length is backpatched during finalization.
            let pos = inner.writer.pos();
            inner.writer.write(&1u32.to_be_bytes());
            inner.writer.write(b"mdat");
            inner.writer.write(&0u64.to_be_bytes());
            inner.mdat_header_pos = Some(pos);
        }

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
            let track = &mut inner.tracks[idx];
            match &mut track.kind {
                TrackKind::Video { options, config: slot } => {
                    if let Some(declared) = options.codec {
                        if declared != config.codec {
                            return invalid_metadata_error(
                                "decoder config codec differs from the declared track codec",
                            );
                        }
                    }
                    match slot {
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
                    }
                }
                _ => return programmer_error("video packet submitted to a non-video track"),
            }
        }

        match &inner.tracks[idx].kind {
            TrackKind::Video { config: Some(_), .. } => (),
            TrackKind::Video { config: None, .. } => {
                return invalid_metadata_error("first video sample requires a decoder config")
            }
            _ => return programmer_error("video packet submitted to a non-video track"),
        }

        inner.register_packet(idx, packet)?;
        inner.interleave(false).await?;
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
            let track = &mut inner.tracks[idx];
            match &mut track.kind {
                TrackKind::Audio { options, config: slot } => {
                    if let Some(declared) = options.codec {
                        if declared != config.codec {
                            return invalid_metadata_error(
                                "decoder config codec differs from the declared track codec",
                            );
                        }
                    }
                    match slot {
                        None => {
                            *slot = Some(config.clone());
                            track.timescale = Some(config.sample_rate);
                        }
                        Some(prev) => {
                            if prev.sample_rate != config.sample_rate
                                || prev.channel_count != config.channel_count
                            {
                                return Err(Error::AudioParamsChange(
                                    "audio parameters changed mid-track",
                                ));
                            }
                        }
                    }
                }
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

        inner.register_packet(idx, packet)?;
        inner.interleave(false).await?;
        inner.writer.flush().await
    }

    /// Submit one subtitle cue. Cues must arrive ordered by start time.
    pub async fn add_subtitle_cue(&self, track: TrackId, cue: SubtitleCue) -> Result<()> {
        let mut inner = self.state.lock().await;
        inner.check_live()?;

        let idx = inner.track_index(track)?;

        let samples = match &mut inner.tracks[idx].kind {
            TrackKind::Subtitle { packer, .. } => packer.add(cue)?,
            _ => return programmer_error("subtitle cue submitted to a non-subtitle track"),
        };

        for sample in samples {
            inner.register_sample(
                idx,
                Sample {
                    pts: sample.timestamp,
                    dts: sample.timestamp,
                    duration: sample.duration,
                    data: sample.data,
                    is_key: true,
                },
            )?;
        }

        inner.interleave(false).await?;
        inner.writer.flush().await
    }

    /// Mark a track as complete. Closed tracks no longer hold back interleaving.
    pub async fn close_track(&self, track: TrackId) -> Result<()> {
        let mut inner = self.state.lock().await;
        inner.check_live()?;

        let idx = inner.track_index(track)?;
        inner.drain_subtitles(idx)?;
        inner.tracks[idx].process_timestamp_queue();
        inner.tracks[idx].closed = true;
        inner.interleave(false).await?;
        inner.writer.flush().await
    }

    /// Flush all tracks and write the movie index.
    pub async fn finalize(&self) -> Result<()> {
        let mut inner = self.state.lock().await;

        if !inner.started {
            return programmer_error("output was never started");
        }
        if inner.finalized {
            return programmer_error("output was already finalized");
        }
        inner.finalized = true;

        for idx in 0..inner.tracks.len() {
            inner.drain_subtitles(idx)?;
            inner.tracks[idx].process_timestamp_queue();
            inner.tracks[idx].closed = true;
        }
        inner.interleave(true).await?;

        match inner.options.mode {
            Mp4Mode::Streaming => inner.finalize_streaming()?,
            Mp4Mode::FastStart => inner.finalize_fast_start()?,
            Mp4Mode::Fragmented => inner.finalize_fragmented()?,
        }

        inner.writer.finalize().await
    }
}

impl MuxInner {
    fn add_track(&mut self, make: impl FnOnce(TrackId) -> TrackState) -> Result<TrackId> {
        if self.started {
            return programmer_error("tracks must be added before starting the output");
        }

        let id = self.tracks.len() as TrackId + 1;
        let mut track = make(id);

        // Video and subtitle timescales are fixed up front; audio adopts the sample
        // rate once the decoder config arrives.
        match &track.kind {
            TrackKind::Video { options, .. } => {
                track.timescale = Some(video_timescale(options.frame_rate));
            }
            TrackKind::Audio { .. } => (),
            TrackKind::Subtitle { .. } => {
                track.timescale = Some(SUBTITLE_TIMESCALE);
            }
        }

        self.tracks.push(track);
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

    fn register_packet(&mut self, idx: usize, packet: &EncodedPacket) -> Result<()> {
        let sample = Sample {
            pts: packet.timestamp_secs(),
            dts: packet.timestamp_secs(),
            duration: packet.duration_secs(),
            data: packet.data.to_vec(),
            is_key: packet.is_key(),
        };
        self.register_sample(idx, sample)
    }

    /// Validate a sample's timing, normalize it, and queue it for decode-timestamp
    /// assignment.
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

            let first = sample.pts - track.timestamp_offset;
            if first > 0.0 {
                return timestamp_order_error(format!(
                    "track {}: timestamps must start at zero, got {}",
                    track.id, first
                ));
            }

            track.first_seen = true;
        }

        sample.pts -= track.timestamp_offset;
        sample.dts = sample.pts;

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
            // A key sample closes the previous decode-reorder group.
            track.process_timestamp_queue();
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

        track.queued.push(sample);
        Ok(())
    }

    fn drain_subtitles(&mut self, idx: usize) -> Result<()> {
        let samples = match &mut self.tracks[idx].kind {
            TrackKind::Subtitle { packer, .. } => packer.finish(),
            _ => return Ok(()),
        };

        for sample in samples {
            self.register_sample(
                idx,
                Sample {
                    pts: sample.timestamp,
                    dts: sample.timestamp,
                    duration: sample.duration,
                    data: sample.data,
                    is_key: true,
                },
            )?;
        }
        Ok(())
    }

    /// Move samples across tracks into chunks, always advancing the track with the
    /// smallest front timestamp. Without `force`, interleaving pauses while any open
    /// track has nothing queued.
    async fn interleave(&mut self, force: bool) -> Result<()> {
        loop {
            if !force && self.tracks.iter().any(|t| !t.closed && t.pending.is_empty()) {
                return Ok(());
            }

            // Pick the smallest front timestamp; ties go to the lower track id.
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

            match self.options.mode {
                Mp4Mode::Fragmented => self.add_to_fragment(idx, sample)?,
                _ => self.add_to_chunk(idx, sample),
            }
        }
    }

    /// Whether a key sample of this track may cut a fragment boundary.
    fn is_cut_trigger(&self, idx: usize) -> bool {
        let has_video =
            self.tracks.iter().any(|t| matches!(t.kind, TrackKind::Video { .. }));
        !has_video || matches!(self.tracks[idx].kind, TrackKind::Video { .. })
    }

    fn add_to_chunk(&mut self, idx: usize, sample: Sample) {
        let needs_new = match &self.tracks[idx].current_chunk {
            None => true,
            Some(chunk) => sample.pts - chunk.start_pts >= CHUNK_DURATION,
        };

        if needs_new {
            self.finalize_current_chunk(idx);
            self.tracks[idx].current_chunk =
                Some(CurrentChunk { start_pts: sample.pts, samples: Vec::new() });
        }

        self.tracks[idx].current_chunk.as_mut().unwrap().samples.push(sample);
    }

    /// Close the open chunk of a track: record sample metadata and either write the
    /// payload (streaming) or retain it (fast start).
    fn finalize_current_chunk(&mut self, idx: usize) {
        let chunk = match self.tracks[idx].current_chunk.take() {
            Some(chunk) => chunk,
            None => return,
        };
        if chunk.samples.is_empty() {
            return;
        }

        // Samples cannot have been registered without a decoder config, which fixes
        // the timescale.
        let timescale = match self.tracks[idx].timescale {
            Some(timescale) => timescale,
            None => return,
        };

        for sample in &chunk.samples {
            let meta = SampleMeta {
                dts_ts: secs_to_timescale(sample.dts, timescale),
                pts_ts: secs_to_timescale(sample.pts, timescale),
                duration_ts: secs_to_timescale(sample.duration, timescale),
                size: sample.data.len() as u32,
                is_key: sample.is_key,
            };
            self.tracks[idx].samples.push(meta);
        }

        let chunk_idx = self.tracks[idx].chunks.len();
        self.chunk_order.push((idx, chunk_idx));

        let meta = match self.options.mode {
            Mp4Mode::Streaming => {
                let offset = self.writer.pos();
                for sample in &chunk.samples {
                    self.writer.write(&sample.data);
                }
                ChunkMeta { offset, sample_count: chunk.samples.len() as u32, data: None }
            }
            _ => {
                let mut data = Vec::new();
                for sample in &chunk.samples {
                    data.extend_from_slice(&sample.data);
                }
                ChunkMeta { offset: 0, sample_count: chunk.samples.len() as u32, data: Some(data) }
            }
        };

        self.tracks[idx].chunks.push(meta);
    }

    fn add_to_fragment(&mut self, idx: usize, sample: Sample) -> Result<()> {
        // Cut the fragment when a cut-trigger track delivers a key sample, the current
        // fragment on that track is long enough, and every other open track is also
        // sitting at a key. Dense all-key audio must not cut mid-group, so only video
        // tracks trigger whenever the output has one.
        let should_cut = sample.is_key
            && self.is_cut_trigger(idx)
            && match self.tracks[idx].fragment_samples.first() {
                Some(first) => sample.pts - first.pts >= FRAGMENT_DURATION,
                None => false,
            }
            && self.tracks.iter().enumerate().all(|(other, track)| {
                other == idx
                    || track.closed
                    || track.pending.front().map(|front| front.is_key).unwrap_or(true)
            });

        if should_cut {
            self.emit_fragment()?;
        }

        self.tracks[idx].fragment_samples.push(sample);
        Ok(())
    }

    /// Write one moof/mdat pair covering every track's accumulated fragment samples.
    fn emit_fragment(&mut self) -> Result<()> {
        if self.tracks.iter().all(|t| t.fragment_samples.is_empty()) {
            return Ok(());
        }

        self.ensure_moov_written()?;

        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;

        let moof_pos = self.writer.pos();

        // Plan one traf per participating track.
        struct TrafPlan {
            idx: usize,
            metas: Vec<SampleMeta>,
            data_len: u64,
            data_offset: i32,
        }

        let mut plans = Vec::new();

        for (idx, track) in self.tracks.iter().enumerate() {
            if track.fragment_samples.is_empty() {
                continue;
            }

            let timescale = match track.timescale {
                Some(timescale) => timescale,
                None => continue,
            };
            let samples = &track.fragment_samples;

            let mut metas = Vec::with_capacity(samples.len());
            for (i, sample) in samples.iter().enumerate() {
                let dts_ts = secs_to_timescale(sample.dts, timescale);
                // Decode deltas define the sample duration; the final sample falls back
                // to its own stated duration.
                let duration_ts = match samples.get(i + 1) {
                    Some(next) => secs_to_timescale(next.dts, timescale) - dts_ts,
                    None => secs_to_timescale(sample.duration, timescale),
                };
                metas.push(SampleMeta {
                    dts_ts,
                    pts_ts: secs_to_timescale(sample.pts, timescale),
                    duration_ts,
                    size: sample.data.len() as u32,
                    is_key: sample.is_key,
                });
            }

            let data_len = samples.iter().map(|s| s.data.len() as u64).sum();
            plans.push(TrafPlan { idx, metas, data_len, data_offset: 0 });
        }

        // The data offsets depend on the moof size, which is invariant under the
        // offset values themselves.
        let moof_probe = self.build_moof(sequence_number, &plans.iter().map(|p| (p.idx, p.metas.as_slice(), p.data_offset)).collect::<Vec<_>>());
        let moof_len = moof_probe.measure();

        let mut running = moof_len as i64 + 8;
        for plan in plans.iter_mut() {
            plan.data_offset = running as i32;
            running += plan.data_len as i64;
        }

        let moof = self.build_moof(sequence_number, &plans.iter().map(|p| (p.idx, p.metas.as_slice(), p.data_offset)).collect::<Vec<_>>());
        write_box(&mut self.writer, &moof);

        // mdat with every track's fragment payload, in traf order.
        let total_data: u64 = plans.iter().map(|p| p.data_len).sum();
        self.writer.write(&((total_data + 8) as u32).to_be_bytes());
        self.writer.write(b"mdat");

        for plan in &plans {
            for sample in &self.tracks[plan.idx].fragment_samples {
                self.writer.write(&sample.data);
            }
        }

        // Index the fragment and reset per-track state.
        for plan in &plans {
            let first = &plan.metas[0];
            self.tracks[plan.idx].tfra.push((first.pts_ts as u64, moof_pos));
            self.tracks[plan.idx].fragment_samples.clear();
        }

        debug!("fragment {} written at {}", sequence_number, moof_pos);
        Ok(())
    }

    fn build_moof(
        &self,
        sequence_number: u32,
        plans: &[(usize, &[SampleMeta], i32)],
    ) -> MuxBox {
        let mut mfhd = ByteBuf::new();
        mfhd.u32(sequence_number);

        let mut moof = MuxBox::with_children(
            b"moof",
            Vec::new(),
            vec![MuxBox::full(b"mfhd", 0, 0, mfhd)],
        );

        for &(idx, metas, data_offset) in plans {
            moof.push(self.build_traf(idx, metas, data_offset));
        }

        moof
    }

    fn build_traf(&self, idx: usize, metas: &[SampleMeta], data_offset: i32) -> MuxBox {
        let track = &self.tracks[idx];

        let default_duration = metas[0].duration_ts as u32;
        let default_size = metas[0].size;
        let flags_of = |m: &SampleMeta| if m.is_key { SAMPLE_FLAGS_KEY } else { SAMPLE_FLAGS_DELTA };
        let default_flags = flags_of(match metas.len() {
            1 => &metas[0],
            _ => &metas[1],
        });

        let uniform_duration = metas.iter().all(|m| m.duration_ts as u32 == default_duration);
        let uniform_size = metas.iter().all(|m| m.size == default_size);
        let tail_uniform_flags = metas.iter().skip(1).all(|m| flags_of(m) == default_flags);
        let any_ctts = metas.iter().any(|m| m.pts_ts != m.dts_ts);

        // tfhd: default-base-is-moof plus the per-track defaults.
        let mut tfhd = ByteBuf::new();
        tfhd.u32(track.id);
        tfhd.u32(default_duration);
        tfhd.u32(default_size);
        tfhd.u32(default_flags);
        let tfhd_flags = TfhdFlags::DEFAULT_BASE_IS_MOOF
            | TfhdFlags::DEFAULT_SAMPLE_DURATION_PRESENT
            | TfhdFlags::DEFAULT_SAMPLE_SIZE_PRESENT
            | TfhdFlags::DEFAULT_SAMPLE_FLAGS_PRESENT;
        let tfhd = MuxBox::full(b"tfhd", 0, tfhd_flags.bits(), tfhd);

        // tfdt: base decode time in track timescale units.
        let mut tfdt = ByteBuf::new();
        tfdt.u64(metas[0].dts_ts as u64);
        let tfdt = MuxBox::full(b"tfdt", 1, 0, tfdt);

        // trun: per-sample fields only where they differ from the defaults.
        let mut trun_flags = TrunFlags::DATA_OFFSET_PRESENT;
        if !uniform_duration {
            trun_flags |= TrunFlags::SAMPLE_DURATION_PRESENT;
        }
        if !uniform_size {
            trun_flags |= TrunFlags::SAMPLE_SIZE_PRESENT;
        }
        let first_flags_differs = flags_of(&metas[0]) != default_flags;
        if tail_uniform_flags {
            if first_flags_differs {
                trun_flags |= TrunFlags::FIRST_SAMPLE_FLAGS_PRESENT;
            }
        }
        else {
            trun_flags |= TrunFlags::SAMPLE_FLAGS_PRESENT;
        }
        if any_ctts {
            trun_flags |= TrunFlags::SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT;
        }

        let mut trun = ByteBuf::new();
        trun.u32(metas.len() as u32);
        trun.i32(data_offset);
        if trun_flags.contains(TrunFlags::FIRST_SAMPLE_FLAGS_PRESENT) {
            trun.u32(flags_of(&metas[0]));
        }
        for meta in metas {
            if trun_flags.contains(TrunFlags::SAMPLE_DURATION_PRESENT) {
                trun.u32(meta.duration_ts as u32);
            }
            if trun_flags.contains(TrunFlags::SAMPLE_SIZE_PRESENT) {
                trun.u32(meta.size);
            }
            if trun_flags.contains(TrunFlags::SAMPLE_FLAGS_PRESENT) {
                trun.u32(flags_of(meta));
            }
            if trun_flags.contains(TrunFlags::SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT) {
                trun.u32((meta.pts_ts - meta.dts_ts) as u32);
            }
        }
        let trun = MuxBox::full(b"trun", 0, trun_flags.bits(), trun);

        MuxBox::with_children(b"traf", Vec::new(), vec![tfhd, tfdt, trun])
    }

    /// Write the fragmented-mode moov (with movie-extends defaults) once, ahead of the
    /// first fragment.
    fn ensure_moov_written(&mut self) -> Result<()> {
        if self.moov_written {
            return Ok(());
        }

        let moov = self.build_moov(true)?;
        write_box(&mut self.writer, &moov);
        self.moov_written = true;
        Ok(())
    }

    fn finalize_streaming(&mut self) -> Result<()> {
        for idx in 0..self.tracks.len() {
            self.finalize_current_chunk(idx);
        }

        let mdat_header_pos = match self.mdat_header_pos {
            Some(pos) => pos,
            None => return programmer_error("streaming output finalized without an mdat"),
        };
        let moov_pos = self.writer.pos();

        let moov = self.build_moov(false)?;
        write_box(&mut self.writer, &moov);

        // Backpatch the large mdat size now that the payload span is known.
        let end = self.writer.pos();
        self.writer.seek(mdat_header_pos + 8);
        self.writer.write(&(moov_pos - mdat_header_pos).to_be_bytes());
        self.writer.seek(end);

        Ok(())
    }

    fn finalize_fast_start(&mut self) -> Result<()> {
        for idx in 0..self.tracks.len() {
            self.finalize_current_chunk(idx);
        }

        let total_data: u64 = self
            .tracks
            .iter()
            .flat_map(|t| t.chunks.iter())
            .map(|c| c.data.as_ref().map(|d| d.len() as u64).unwrap_or(0))
            .sum();

        let mdat_header_len: u64 = if total_data + 8 > u64::from(u32::MAX) { 16 } else { 8 };
        let header_end = self.writer.pos();

        // Assign chunk offsets. The offset table's own width feeds back into the moov
        // size, so offsets are recomputed once when they cross into co64 territory.
        loop {
            let moov = self.build_moov(false)?;
            let mdat_data_start = header_end + moov.measure() + mdat_header_len;

            let mut cursor = mdat_data_start;
            for &(track_idx, chunk_idx) in &self.chunk_order {
                let chunk = &mut self.tracks[track_idx].chunks[chunk_idx];
                chunk.offset = cursor;
                cursor += chunk.data.as_ref().map(|d| d.len() as u64).unwrap_or(0);
            }

            // The moov just measured was built from the previous offsets; rebuild once
            // more if the new offsets changed the offset-table width.
            let rebuilt = self.build_moov(false)?;
            if rebuilt.measure() == moov.measure() {
                break;
            }
        }

        let moov = self.build_moov(false)?;
        let mdat_data_start = header_end + moov.measure() + mdat_header_len;
        write_box(&mut self.writer, &moov);

        // Any slack between the index and the payload is consumed by a free box.
        let gap = (mdat_data_start - mdat_header_len).saturating_sub(self.writer.pos());
        if gap >= 8 {
            write_box(&mut self.writer, &MuxBox::new(b"free", vec![0; gap as usize - 8]));
        }

        if mdat_header_len == 16 {
            self.writer.write(&1u32.to_be_bytes());
            self.writer.write(b"mdat");
            self.writer.write(&(total_data + 16).to_be_bytes());
        }
        else {
            self.writer.write(&((total_data + 8) as u32).to_be_bytes());
            self.writer.write(b"mdat");
        }

        for &(track_idx, chunk_idx) in &self.chunk_order {
            let data = self.tracks[track_idx].chunks[chunk_idx].data.take();
            if let Some(data) = data {
                self.writer.write(&data);
            }
        }

        Ok(())
    }

    fn finalize_fragmented(&mut self) -> Result<()> {
        self.emit_fragment()?;

        if !self.moov_written {
            // No samples at all; still emit a valid empty movie.
            self.ensure_moov_written()?;
        }

        // mfra: one tfra per track, plus the mfro size tail.
        let mut mfra = MuxBox::with_children(b"mfra", Vec::new(), Vec::new());

        for track in &self.tracks {
            let mut tfra = ByteBuf::new();
            tfra.u32(track.id);
            // Single-byte traf, trun, and sample numbers.
            tfra.u32(0);
            tfra.u32(track.tfra.len() as u32);
            for &(time, moof_offset) in &track.tfra {
                tfra.u64(time);
                tfra.u64(moof_offset);
                tfra.u8(1).u8(1).u8(1);
            }
            mfra.push(MuxBox::full(b"tfra", 1, 0, tfra));
        }

        let mut mfro = ByteBuf::new();
        mfro.u32(mfra.measure() as u32 + 16);
        mfra.push(MuxBox::full(b"mfro", 0, 0, mfro));

        write_box(&mut self.writer, &mfra);
        Ok(())
    }

    fn build_ftyp(&self) -> MuxBox {
        let has_avc = self.tracks.iter().any(|t| {
            matches!(
                &t.kind,
                TrackKind::Video { options: VideoTrackOptions { codec: Some(VideoCodec::Avc), .. }, .. }
            )
        });

        let mut buf = ByteBuf::new();

        match (self.options.variant, self.options.mode) {
            (Mp4Variant::Mov, _) => {
                buf.fourcc(b"qt  ").u32(0).fourcc(b"qt  ");
            }
            (Mp4Variant::Mp4, Mp4Mode::Fragmented) => {
                buf.fourcc(b"iso5").u32(0x200).fourcc(b"iso5").fourcc(b"iso6").fourcc(b"mp41");
                if has_avc {
                    buf.fourcc(b"avc1");
                }
            }
            (Mp4Variant::Mp4, _) => {
                buf.fourcc(b"isom").u32(0x200).fourcc(b"isom").fourcc(b"iso2").fourcc(b"mp41");
                if has_avc {
                    buf.fourcc(b"avc1");
                }
            }
        }

        MuxBox::new(b"ftyp", buf.into_inner())
    }

    fn movie_duration_ts(&self) -> u64 {
        let max_end = self
            .tracks
            .iter()
            .map(|t| t.max_end_timestamp)
            .fold(0.0f64, f64::max);
        secs_to_timescale(max_end, MOVIE_TIMESCALE) as u64
    }

    fn build_moov(&self, fragmented: bool) -> Result<MuxBox> {
        let duration = if fragmented { 0 } else { self.movie_duration_ts() };

        let mut mvhd = ByteBuf::new();
        mvhd.u32(self.creation_time as u32);
        mvhd.u32(self.creation_time as u32);
        mvhd.u32(MOVIE_TIMESCALE);
        mvhd.u32(duration as u32);
        mvhd.fixed_16_16(1.0); // Rate.
        mvhd.fixed_8_8(1.0); // Volume.
        mvhd.zeros(2 + 8);
        mvhd.matrix(&Rotation::R0.to_matrix());
        mvhd.zeros(24);
        mvhd.u32(self.tracks.len() as u32 + 1);

        let mut moov =
            MuxBox::with_children(b"moov", Vec::new(), vec![MuxBox::full(b"mvhd", 0, 0, mvhd)]);

        for track in &self.tracks {
            moov.push(self.build_trak(track, fragmented)?);
        }

        if fragmented {
            let mut mvex = MuxBox::with_children(b"mvex", Vec::new(), Vec::new());
            for track in &self.tracks {
                let mut trex = ByteBuf::new();
                trex.u32(track.id);
                trex.u32(1); // Default sample description index.
                trex.u32(0); // Default sample duration.
                trex.u32(0); // Default sample size.
                trex.u32(0); // Default sample flags.
                mvex.push(MuxBox::full(b"trex", 0, 0, trex));
            }
            moov.push(mvex);
        }

        Ok(moov)
    }

    fn build_trak(&self, track: &TrackState, fragmented: bool) -> Result<MuxBox> {
        let timescale = match track.timescale {
            Some(timescale) => timescale,
            None => return invalid_metadata_error("track never received a decoder config"),
        };

        // A fragmented movie grows after the moov is written; its declared durations
        // stay zero and readers derive the real extent from the fragments.
        let (duration_movie_ts, duration_media_ts) = if fragmented {
            (0u64, 0u64)
        }
        else {
            (
                secs_to_timescale(track.max_end_timestamp, MOVIE_TIMESCALE) as u64,
                secs_to_timescale(track.max_end_timestamp, timescale) as u64,
            )
        };

        let (width, height, rotation, volume) = match &track.kind {
            TrackKind::Video { options, config } => {
                let config = config.as_ref();
                (
                    config.map(|c| c.coded_width).unwrap_or(0),
                    config.map(|c| c.coded_height).unwrap_or(0),
                    options.rotation,
                    0.0,
                )
            }
            TrackKind::Audio { .. } => (0, 0, Rotation::R0, 1.0),
            TrackKind::Subtitle { .. } => (0, 0, Rotation::R0, 0.0),
        };

        // tkhd with the enabled and in-movie flags.
        let mut tkhd = ByteBuf::new();
        tkhd.u32(self.creation_time as u32);
        tkhd.u32(self.creation_time as u32);
        tkhd.u32(track.id);
        tkhd.u32(0);
        tkhd.u32(duration_movie_ts as u32);
        tkhd.zeros(8);
        tkhd.u16(0); // Layer.
        tkhd.u16(0); // Alternate group.
        tkhd.fixed_8_8(volume);
        tkhd.u16(0);
        tkhd.matrix(&rotation.to_matrix());
        tkhd.u32(width << 16);
        tkhd.u32(height << 16);
        let tkhd = MuxBox::full(b"tkhd", 0, 3, tkhd);

        let mut mdhd = ByteBuf::new();
        mdhd.u32(self.creation_time as u32);
        mdhd.u32(self.creation_time as u32);
        mdhd.u32(timescale);
        mdhd.u32(duration_media_ts as u32);
        mdhd.language(track.language());
        mdhd.u16(0);
        let mdhd = MuxBox::full(b"mdhd", 0, 0, mdhd);

        let (handler, handler_name): (&[u8; 4], &str) = match &track.kind {
            TrackKind::Video { .. } => (b"vide", "VesselVideoHandler"),
            TrackKind::Audio { .. } => (b"soun", "VesselSoundHandler"),
            TrackKind::Subtitle { .. } => (b"text", "VesselTextHandler"),
        };

        let mut hdlr = ByteBuf::new();
        hdlr.u32(0);
        hdlr.fourcc(handler);
        hdlr.zeros(12);
        hdlr.ascii(handler_name).u8(0);
        let hdlr = MuxBox::full(b"hdlr", 0, 0, hdlr);

        let media_header = match &track.kind {
            TrackKind::Video { .. } => {
                let mut vmhd = ByteBuf::new();
                vmhd.zeros(8);
                MuxBox::full(b"vmhd", 0, 1, vmhd)
            }
            TrackKind::Audio { .. } => {
                let mut smhd = ByteBuf::new();
                smhd.zeros(4);
                MuxBox::full(b"smhd", 0, 0, smhd)
            }
            TrackKind::Subtitle { .. } => MuxBox::full(b"nmhd", 0, 0, ByteBuf::new()),
        };

        // A self-contained data reference.
        let url = MuxBox::full(b"url ", 0, 1, ByteBuf::new());
        let mut dref = ByteBuf::new();
        dref.u32(1);
        let dref = {
            let mut bx = MuxBox::full(b"dref", 0, 0, dref);
            bx.push(url);
            bx
        };
        let dinf = MuxBox::with_children(b"dinf", Vec::new(), vec![dref]);

        let stbl = self.build_stbl(track, fragmented)?;

        let minf =
            MuxBox::with_children(b"minf", Vec::new(), vec![media_header, dinf, stbl]);
        let mdia = MuxBox::with_children(b"mdia", Vec::new(), vec![mdhd, hdlr, minf]);

        Ok(MuxBox::with_children(b"trak", Vec::new(), vec![tkhd, mdia]))
    }

    fn build_stbl(&self, track: &TrackState, fragmented: bool) -> Result<MuxBox> {
        let mut stsd_payload = ByteBuf::new();
        stsd_payload.u32(1);
        let mut stsd = MuxBox::full(b"stsd", 0, 0, stsd_payload);
        stsd.push(self.build_sample_description(track)?);

        let metas: &[SampleMeta] = if fragmented { &[] } else { &track.samples };

        // stts from decode-timestamp deltas; the final sample uses its own duration.
        let mut stts = ByteBuf::new();
        let mut stts_runs: Vec<(u32, u32)> = Vec::new();
        for (i, meta) in metas.iter().enumerate() {
            let delta = match metas.get(i + 1) {
                Some(next) => (next.dts_ts - meta.dts_ts) as u32,
                None => meta.duration_ts as u32,
            };
            match stts_runs.last_mut() {
                Some((count, run_delta)) if *run_delta == delta => *count += 1,
                _ => stts_runs.push((1, delta)),
            }
        }
        stts.u32(stts_runs.len() as u32);
        for (count, delta) in &stts_runs {
            stts.u32(*count).u32(*delta);
        }
        let stts = MuxBox::full(b"stts", 0, 0, stts);

        // stss only when the track has delta samples.
        let all_key = metas.iter().all(|m| m.is_key);
        let stss = if all_key {
            None
        }
        else {
            let keys: Vec<u32> = metas
                .iter()
                .enumerate()
                .filter(|(_, m)| m.is_key)
                .map(|(i, _)| i as u32 + 1)
                .collect();
            let mut buf = ByteBuf::new();
            buf.u32(keys.len() as u32);
            for key in keys {
                buf.u32(key);
            }
            Some(MuxBox::full(b"stss", 0, 0, buf))
        };

        // ctts only when any composition offset is non-zero.
        let any_offset = metas.iter().any(|m| m.pts_ts != m.dts_ts);
        let ctts = if any_offset {
            let mut runs: Vec<(u32, u32)> = Vec::new();
            for meta in metas {
                let offset = (meta.pts_ts - meta.dts_ts) as u32;
                match runs.last_mut() {
                    Some((count, run_offset)) if *run_offset == offset => *count += 1,
                    _ => runs.push((1, offset)),
                }
            }
            let mut buf = ByteBuf::new();
            buf.u32(runs.len() as u32);
            for (count, offset) in runs {
                buf.u32(count).u32(offset);
            }
            Some(MuxBox::full(b"ctts", 0, 0, buf))
        }
        else {
            None
        };

        // stsc: one run per change in samples-per-chunk.
        let mut stsc_runs: Vec<(u32, u32)> = Vec::new();
        for (i, chunk) in track.chunks.iter().enumerate() {
            match stsc_runs.last() {
                Some(&(_, count)) if count == chunk.sample_count => (),
                _ => stsc_runs.push((i as u32 + 1, chunk.sample_count)),
            }
        }
        let mut stsc = ByteBuf::new();
        stsc.u32(stsc_runs.len() as u32);
        for (first_chunk, count) in &stsc_runs {
            stsc.u32(*first_chunk).u32(*count).u32(1);
        }
        let stsc = MuxBox::full(b"stsc", 0, 0, stsc);

        // stsz: collapsed to a constant when possible.
        let constant_size = match metas.first() {
            Some(first) if metas.iter().all(|m| m.size == first.size) => Some(first.size),
            _ => None,
        };
        let mut stsz = ByteBuf::new();
        match constant_size {
            Some(size) => {
                stsz.u32(size);
                stsz.u32(metas.len() as u32);
            }
            None => {
                stsz.u32(0);
                stsz.u32(metas.len() as u32);
                for meta in metas {
                    stsz.u32(meta.size);
                }
            }
        }
        let stsz = MuxBox::full(b"stsz", 0, 0, stsz);

        // stco, promoted to co64 when any offset needs 64 bits.
        let needs_co64 = track.chunks.iter().any(|c| c.offset >= u64::from(u32::MAX));
        let mut co = ByteBuf::new();
        co.u32(track.chunks.len() as u32);
        for chunk in &track.chunks {
            if needs_co64 {
                co.u64(chunk.offset);
            }
            else {
                co.u32(chunk.offset as u32);
            }
        }
        let co = MuxBox::full(if needs_co64 { b"co64" } else { b"stco" }, 0, 0, co);

        let mut children = vec![stsd, stts];
        if let Some(stss) = stss {
            children.push(stss);
        }
        if let Some(ctts) = ctts {
            children.push(ctts);
        }
        children.push(stsc);
        children.push(stsz);
        children.push(co);

        Ok(MuxBox::with_children(b"stbl", Vec::new(), children))
    }

    fn build_sample_description(&self, track: &TrackState) -> Result<MuxBox> {
        match &track.kind {
            TrackKind::Video { options: _, config } => {
                let config = match config {
                    Some(config) => config,
                    None => {
                        return invalid_metadata_error("video track missing a decoder config")
                    }
                };
                build_visual_sample_entry(config)
            }
            TrackKind::Audio { options: _, config } => {
                let config = match config {
                    Some(config) => config,
                    None => {
                        return invalid_metadata_error("audio track missing a decoder config")
                    }
                };
                build_audio_sample_entry(config)
            }
            TrackKind::Subtitle { .. } => {
                let mut entry = ByteBuf::new();
                entry.zeros(6);
                entry.u16(1);
                let mut bx = MuxBox::new(b"wvtt", entry.into_inner());
                bx.push(MuxBox::new(b"vttC", b"WEBVTT".to_vec()));
                Ok(bx)
            }
        }
    }
}

impl TrackState {
    fn new(id: TrackId, kind: TrackKind) -> Self {
        TrackState {
            id,
            kind,
            timescale: None,
            first_seen: false,
            timestamp_offset: 0.0,
            max_timestamp: 0.0,
            last_key_timestamp: 0.0,
            max_end_timestamp: 0.0,
            queued: Vec::new(),
            pending: VecDeque::new(),
            current_chunk: None,
            chunks: Vec::new(),
            samples: Vec::new(),
            fragment_samples: Vec::new(),
            tfra: Vec::new(),
            closed: false,
        }
    }

    /// Assign decode timestamps to the queued key interval.
    ///
    /// External encoders deliver samples in decode order, so sorting the interval's
    /// presentation timestamps yields the decode timeline; each queued sample takes the
    /// sorted value at its delivery position, clamped so a decode timestamp never
    /// exceeds its own presentation timestamp nor regresses.
    fn process_timestamp_queue(&mut self) {
        if self.queued.is_empty() {
            return;
        }

        let mut sorted: Vec<f64> = self.queued.iter().map(|s| s.pts).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let mut prev_dts = f64::NEG_INFINITY;
        for (i, sample) in self.queued.iter_mut().enumerate() {
            let mut dts = sorted[i].min(sample.pts);
            if dts < prev_dts {
                dts = prev_dts;
            }
            sample.dts = dts;
            prev_dts = dts;
        }

        self.pending.extend(self.queued.drain(..));
    }
}

fn video_timescale(frame_rate: Option<f64>) -> u32 {
    match frame_rate {
        Some(rate) if rate > 0.0 => {
            let scaled = DEFAULT_VIDEO_TIMESCALE as f64 / rate;
            if (scaled - scaled.round()).abs() < 1e-9 {
                DEFAULT_VIDEO_TIMESCALE
            }
            else {
                // The default timescale cannot represent this frame rate exactly; use a
                // frame-rate derived one instead.
                (rate.round() as u32).max(1) * 1000
            }
        }
        _ => DEFAULT_VIDEO_TIMESCALE,
    }
}

fn build_visual_sample_entry(config: &VideoDecoderConfig) -> Result<MuxBox> {
    let fourcc: &[u8; 4] = match config.codec {
        VideoCodec::Avc => b"avc1",
        VideoCodec::Hevc => b"hvc1",
        VideoCodec::Vp8 => b"vp08",
        VideoCodec::Vp9 => b"vp09",
        VideoCodec::Av1 => b"av01",
    };

    let mut entry = ByteBuf::new();
    entry.zeros(6);
    entry.u16(1); // Data reference index.
    entry.zeros(16);
    entry.u16(config.coded_width as u16);
    entry.u16(config.coded_height as u16);
    entry.u32(0x0048_0000); // Horizontal resolution, 72 dpi.
    entry.u32(0x0048_0000); // Vertical resolution, 72 dpi.
    entry.u32(0);
    entry.u16(1); // Frame count.
    entry.zeros(32); // Compressor name.
    entry.u16(0x18); // Depth.
    entry.i16(-1);

    let mut bx = MuxBox::new(fourcc, entry.into_inner());

    match config.codec {
        VideoCodec::Avc => {
            let description = match &config.description {
                Some(description) => description,
                None => return invalid_metadata_error("avc requires description bytes"),
            };
            bx.push(MuxBox::new(b"avcC", description.to_vec()));
        }
        VideoCodec::Hevc => {
            let description = match &config.description {
                Some(description) => description,
                None => return invalid_metadata_error("hevc requires description bytes"),
            };
            bx.push(MuxBox::new(b"hvcC", description.to_vec()));
        }
        VideoCodec::Vp8 | VideoCodec::Vp9 => {
            let payload = match &config.description {
                Some(description) => description.to_vec(),
                None => build_vpcc(config.color_space.as_ref()),
            };
            bx.push(MuxBox::new(b"vpcC", payload));
        }
        VideoCodec::Av1 => {
            let description = match &config.description {
                Some(description) => description,
                None => return invalid_metadata_error("av1 requires description bytes"),
            };
            bx.push(MuxBox::new(b"av1C", description.to_vec()));
        }
    }

    if let Some(color) = &config.color_space {
        if color.is_complete() {
            let mut colr = ByteBuf::new();
            colr.fourcc(b"nclx");
            colr.u16(u16::from(color.primaries.unwrap()));
            colr.u16(u16::from(color.transfer.unwrap()));
            colr.u16(u16::from(color.matrix.unwrap()));
            colr.u8(if color.full_range.unwrap() { 0x80 } else { 0 });
            bx.push(MuxBox::new(b"colr", colr.into_inner()));
        }
    }

    Ok(bx)
}

/// Build a vpcC box (version 1) when the encoder did not supply one.
fn build_vpcc(color: Option<&ColorSpace>) -> Vec<u8> {
    let mut buf = ByteBuf::new();
    buf.u8(1); // Version.
    buf.u24(0); // Flags.
    buf.u8(0); // Profile.
    buf.u8(10); // Level 1.0.

    let full_range = color.and_then(|c| c.full_range).unwrap_or(false);
    // Bit depth 8, chroma subsampling 4:2:0 colocated, full range flag.
    buf.u8((8 << 4) | (1 << 1) | u8::from(full_range));
    buf.u8(color.and_then(|c| c.primaries).unwrap_or(2));
    buf.u8(color.and_then(|c| c.transfer).unwrap_or(2));
    buf.u8(color.and_then(|c| c.matrix).unwrap_or(2));
    buf.u16(0); // No codec initialization data.
    buf.into_inner()
}

fn build_audio_sample_entry(config: &AudioDecoderConfig) -> Result<MuxBox> {
    let fourcc: &[u8; 4] = match config.codec {
        AudioCodec::Aac | AudioCodec::Mp3 => b"mp4a",
        AudioCodec::Opus => b"Opus",
        AudioCodec::Flac => b"fLaC",
        AudioCodec::Vorbis | AudioCodec::Pcm => {
            return invalid_metadata_error("codec has no isobmff sample entry")
        }
    };

    if config.sample_rate > u32::from(u16::MAX) {
        // The 16.16 sample rate field cannot carry this; a v1 sound description would
        // be required.
        return invalid_metadata_error("sample rate exceeds the sound description range");
    }

    let mut entry = ByteBuf::new();
    entry.zeros(6);
    entry.u16(1); // Data reference index.
    entry.u16(0); // Version.
    entry.zeros(6);
    entry.u16(config.channel_count as u16);
    entry.u16(16); // Sample size.
    entry.u32(0); // Compression id and packet size.
    entry.u32(config.sample_rate << 16);

    let mut bx = MuxBox::new(fourcc, entry.into_inner());

    match config.codec {
        AudioCodec::Aac => {
            let asc = match &config.description {
                Some(description) => description.to_vec(),
                None => AacAudioSpecificConfig {
                    object_type: 2,
                    sample_rate: config.sample_rate,
                    channel_count: config.channel_count,
                }
                .serialize(),
            };
            bx.push(build_esds(&asc, 0x40));
        }
        AudioCodec::Mp3 => {
            bx.push(build_esds(&[], 0x6b));
        }
        AudioCodec::Opus => {
            let payload = match &config.description {
                Some(description) => description.to_vec(),
                None => {
                    let mut dops = ByteBuf::new();
                    dops.u8(0); // Version.
                    dops.u8(config.channel_count as u8);
                    dops.u16(3840); // Pre-skip.
                    dops.u32(config.sample_rate);
                    dops.u16(0); // Output gain.
                    dops.u8(0); // Channel mapping family.
                    dops.into_inner()
                }
            };
            bx.push(MuxBox::new(b"dOps", payload));
        }
        AudioCodec::Flac => {
            let description = match &config.description {
                Some(description) => description,
                None => return invalid_metadata_error("flac requires description bytes"),
            };
            bx.push(MuxBox::new(b"dfLa", description.to_vec()));
        }
        _ => unreachable!(),
    }

    Ok(bx)
}

/// Build the esds box embedding the decoder-specific bytes for the given MPEG-4 object
/// type.
fn build_esds(decoder_specific: &[u8], object_type: u8) -> MuxBox {
    let mut dec_config = ByteBuf::new();
    dec_config.u8(object_type);
    dec_config.u8(0x15); // Audio stream type, upstream clear.
    dec_config.u24(0); // Buffer size.
    dec_config.u32(0); // Max bitrate.
    dec_config.u32(0); // Average bitrate.
    if !decoder_specific.is_empty() {
        dec_config.descriptor(0x05, decoder_specific);
    }

    let mut es = ByteBuf::new();
    es.u16(0); // ES id.
    es.u8(0); // Flags.
    es.descriptor(0x04, &dec_config.into_inner());
    es.descriptor(0x06, &[0x02]); // SL config: MP4.

    let mut payload = ByteBuf::new();
    payload.descriptor(0x03, &es.into_inner());

    MuxBox::full(b"esds", 0, 0, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pts: f64, is_key: bool) -> Sample {
        Sample { pts, dts: pts, duration: 0.1, data: vec![0], is_key }
    }

    #[test]
    fn verify_decode_timestamp_assignment() {
        let mut track =
            TrackState::new(1, TrackKind::Subtitle { options: Default::default(), packer: CuePacker::new() });

        // Delivery in decode order: key, then reordered deltas.
        track.queued = vec![
            sample(0.0, true),
            sample(0.4, false),
            sample(0.1, false),
            sample(0.2, false),
            sample(0.3, false),
        ];
        track.process_timestamp_queue();

        let dts: Vec<f64> = track.pending.iter().map(|s| s.dts).collect();
        assert_eq!(dts, vec![0.0, 0.1, 0.1, 0.2, 0.3]);

        // Composition offsets in a 57600 timescale.
        let offsets: Vec<i64> = track
            .pending
            .iter()
            .map(|s| secs_to_timescale(s.pts, 57_600) - secs_to_timescale(s.dts, 57_600))
            .collect();
        assert_eq!(offsets, vec![0, 17_280, 0, 0, 0]);
    }

    #[test]
    fn verify_in_order_samples_keep_their_timestamps() {
        let mut track =
            TrackState::new(1, TrackKind::Subtitle { options: Default::default(), packer: CuePacker::new() });

        track.queued = (0..5).map(|i| sample(i as f64 * 0.1, i == 0)).collect();
        track.process_timestamp_queue();

        for s in &track.pending {
            assert_eq!(s.pts, s.dts);
        }
    }

    #[test]
    fn verify_video_timescale_selection() {
        assert_eq!(video_timescale(None), 57_600);
        assert_eq!(video_timescale(Some(30.0)), 57_600);
        assert_eq!(video_timescale(Some(24.0)), 57_600);
        // 44 does not divide 57600.
        assert_eq!(video_timescale(Some(44.0)), 44_000);
    }
}
