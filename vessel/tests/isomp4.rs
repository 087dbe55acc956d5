// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ISO BMFF round-trip and structure tests.

mod common;

use std::sync::Arc;

use common::*;

use vessel::io::{BufferSource, BufferTarget, OutputTarget};
use vessel::isomp4::{
    AudioTrackOptions, Mp4Mode, Mp4Muxer, Mp4MuxerOptions, Mp4Variant, SubtitleCue,
    SubtitleTrackOptions, VideoTrackOptions,
};
use vessel::streams::PacketStream;
use vessel::{EncodedPacket, Input, InputFormat, PacketOptions, Rotation, TrackType};

fn mp4_options(mode: Mp4Mode) -> Mp4MuxerOptions {
    Mp4MuxerOptions { mode, variant: Mp4Variant::Mp4 }
}

/// 30 video frames at 30 fps with keys at 0 and 15.
fn video_packets() -> Vec<EncodedPacket> {
    (0..30)
        .map(|i| {
            let ts = (i as f64 / 30.0 * 1e6).round() as i64;
            let dur = (1e6_f64 / 30.0).round() as i64;
            packet(ts, dur, i == 0 || i == 15, 0x40 + i as u8, 120 + i as usize)
        })
        .collect()
}

/// 93 AAC frames of 1024 samples at 48 kHz.
fn audio_packets() -> Vec<EncodedPacket> {
    (0..93)
        .map(|i| {
            let ts = (i as f64 * 1024.0 / 48_000.0 * 1e6).round() as i64;
            let dur = (1024.0_f64 / 48_000.0 * 1e6).round() as i64;
            packet(ts, dur, true, 0x80 + i as u8, 48 + (i % 7) as usize)
        })
        .collect()
}

async fn collect_track(
    track: &Arc<dyn vessel::Track>,
    options: PacketOptions,
) -> Vec<EncodedPacket> {
    let mut out = Vec::new();
    let mut current = track.first_packet(options).await.unwrap();
    while let Some(packet) = current {
        current = track.next_packet(&packet, options).await.unwrap();
        out.push(packet);
    }
    out
}

#[tokio::test]
async fn two_track_streamed_mp4_round_trips() {
    let target = BufferTarget::new();
    let muxer = Mp4Muxer::new(OutputTarget::buffer(target.clone()), mp4_options(Mp4Mode::Streaming));

    let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
    let audio = muxer.add_audio_track(AudioTrackOptions::default()).await.unwrap();
    muxer.start().await.unwrap();

    let video_in = video_packets();
    let audio_in = audio_packets();

    for (i, packet) in video_in.iter().enumerate() {
        let config = if i == 0 { Some(avc_config()) } else { None };
        muxer.add_video_packet(video, packet, config.as_ref()).await.unwrap();
    }
    for (i, packet) in audio_in.iter().enumerate() {
        let config = if i == 0 { Some(aac_config()) } else { None };
        muxer.add_audio_packet(audio, packet, config.as_ref()).await.unwrap();
    }

    muxer.finalize().await.unwrap();
    let bytes = target.take_buffer().unwrap();

    // Streaming layout: ftyp, the payload, then the index.
    assert_eq!(&bytes[4..8], b"ftyp");
    assert_eq!(&bytes[8..12], b"isom");
    assert_eq!(top_level_boxes(&bytes), vec!["ftyp", "mdat", "moov"]);

    let input = Input::open(Box::new(BufferSource::new(bytes))).await.unwrap();
    assert_eq!(input.format(), InputFormat::IsoMp4);

    let tracks = input.tracks();
    assert_eq!(tracks.len(), 2);

    let video_track = input.primary_video_track().unwrap();
    let audio_track = input.primary_audio_track().unwrap();
    assert_eq!(video_track.rotation(), Rotation::R0);
    assert_eq!(video_track.track_type(), TrackType::Video);

    let video_config = video_track.video_config().unwrap();
    assert_eq!(video_config.coded_width, 640);
    assert_eq!(video_config.coded_height, 360);
    assert_eq!(video_config.description.as_deref(), Some(AVC_DESCRIPTION.as_slice()));

    let audio_config = audio_track.audio_config().unwrap();
    assert_eq!(audio_config.sample_rate, 48_000);
    assert_eq!(audio_config.channel_count, 2);

    let video_out = collect_track(&video_track, PacketOptions::default()).await;
    let audio_out = collect_track(&audio_track, PacketOptions::default()).await;

    assert_eq!(video_out.len(), 30);
    assert_eq!(audio_out.len(), 93);

    for (expected, actual) in video_in.iter().zip(&video_out) {
        assert_packet_matches(expected, actual);
    }
    for (expected, actual) in audio_in.iter().zip(&audio_out) {
        assert_packet_matches(expected, actual);
    }
}

#[tokio::test]
async fn metadata_only_lookup_is_equivalent() {
    let target = BufferTarget::new();
    let muxer = Mp4Muxer::new(OutputTarget::buffer(target.clone()), mp4_options(Mp4Mode::Streaming));

    let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
    muxer.start().await.unwrap();
    for (i, packet) in video_packets().iter().enumerate() {
        let config = if i == 0 { Some(avc_config()) } else { None };
        muxer.add_video_packet(video, packet, config.as_ref()).await.unwrap();
    }
    muxer.finalize().await.unwrap();

    let input = Input::open(Box::new(BufferSource::new(target.take_buffer().unwrap())))
        .await
        .unwrap();
    let track = input.primary_video_track().unwrap();

    let full = track.packet_at(0.5, PacketOptions::default()).await.unwrap().unwrap();
    let meta = track.packet_at(0.5, PacketOptions::METADATA_ONLY).await.unwrap().unwrap();

    assert_eq!(full.timestamp, meta.timestamp);
    assert_eq!(full.duration, meta.duration);
    assert_eq!(full.kind, meta.kind);
    assert_eq!(full.byte_length, meta.byte_length);
    assert!(!full.data.is_empty());
    assert!(meta.data.is_empty());
}

#[tokio::test]
async fn fast_start_reorders_b_frames() {
    let target = BufferTarget::new();
    let muxer = Mp4Muxer::new(OutputTarget::buffer(target.clone()), mp4_options(Mp4Mode::FastStart));

    let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
    muxer.start().await.unwrap();

    // Decode-order delivery with reordered presentation timestamps.
    let pts_us = [0i64, 400_000, 100_000, 200_000, 300_000];
    let packets: Vec<EncodedPacket> = pts_us
        .iter()
        .enumerate()
        .map(|(i, &ts)| packet(ts, 100_000, i == 0, 0x10 + i as u8, 64))
        .collect();

    for (i, p) in packets.iter().enumerate() {
        let config = if i == 0 { Some(avc_config()) } else { None };
        muxer.add_video_packet(video, p, config.as_ref()).await.unwrap();
    }
    muxer.finalize().await.unwrap();

    let bytes = target.take_buffer().unwrap();

    // Fast-start layout: the index precedes the payload.
    let boxes = top_level_boxes(&bytes);
    assert_eq!(boxes[0], "ftyp");
    let moov_idx = boxes.iter().position(|b| b == "moov").unwrap();
    let mdat_idx = boxes.iter().position(|b| b == "mdat").unwrap();
    assert!(moov_idx < mdat_idx);

    // Reordering produced a composition-offset table.
    assert!(bytes.windows(4).any(|w| w == b"ctts"));

    let input = Input::open(Box::new(BufferSource::new(bytes))).await.unwrap();
    let track = input.primary_video_track().unwrap();

    let out = collect_track(&track, PacketOptions::default()).await;
    assert_eq!(out.len(), 5);
    for (expected, actual) in packets.iter().zip(&out) {
        assert_packet_matches(expected, actual);
    }

    // The movie spans the full presentation range.
    let duration = input.compute_duration().await.unwrap();
    assert!((duration - 0.5).abs() < 1e-6, "duration was {}", duration);
}

/// 30 one-second video samples with keys at 0, 10, and 20 seconds.
fn long_running_packets() -> Vec<EncodedPacket> {
    (0..30)
        .map(|i| packet(i as i64 * 1_000_000, 1_000_000, i % 10 == 0, 0x20 + i as u8, 96))
        .collect()
}

#[tokio::test]
async fn fragmented_output_structure_and_lookup() {
    let target = BufferTarget::new();
    let muxer =
        Mp4Muxer::new(OutputTarget::buffer(target.clone()), mp4_options(Mp4Mode::Fragmented));

    let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
    muxer.start().await.unwrap();

    for (i, p) in long_running_packets().iter().enumerate() {
        let config = if i == 0 { Some(avc_config()) } else { None };
        muxer.add_video_packet(video, p, config.as_ref()).await.unwrap();
    }
    muxer.finalize().await.unwrap();

    let bytes = target.take_buffer().unwrap();

    assert_eq!(&bytes[8..12], b"iso5");
    assert_eq!(
        top_level_boxes(&bytes),
        vec!["ftyp", "moov", "moof", "mdat", "moof", "mdat", "moof", "mdat", "mfra"]
    );

    let input = Input::open(Box::new(BufferSource::new(bytes))).await.unwrap();
    let track = input.primary_video_track().unwrap();

    // Random access inside the third fragment.
    let hit = track.packet_at(25.0, PacketOptions::default()).await.unwrap().unwrap();
    assert_eq!(hit.timestamp, 25_000_000);

    let key = track.key_packet_at(25.0, PacketOptions::default()).await.unwrap().unwrap();
    assert_eq!(key.timestamp, 20_000_000);

    let next_key =
        track.next_key_packet(&hit, PacketOptions::default()).await.unwrap();
    assert!(next_key.is_none());

    let all = collect_track(&track, PacketOptions::default()).await;
    assert_eq!(all.len(), 30);

    let duration = input.compute_duration().await.unwrap();
    assert!((duration - 30.0).abs() < 1e-6);
}

#[tokio::test]
async fn fragmented_duration_recovers_without_tfdt() {
    let target = BufferTarget::new();
    let muxer =
        Mp4Muxer::new(OutputTarget::buffer(target.clone()), mp4_options(Mp4Mode::Fragmented));

    let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
    muxer.start().await.unwrap();
    for (i, p) in long_running_packets().iter().enumerate() {
        let config = if i == 0 { Some(avc_config()) } else { None };
        muxer.add_video_packet(video, p, config.as_ref()).await.unwrap();
    }
    muxer.finalize().await.unwrap();

    let mut bytes = target.take_buffer().unwrap();

    // Strip the decode-time boxes of the later fragments, leaving their start
    // timestamps to be recovered by walking back from the preceding fragment.
    let mut found = 0;
    for i in 0..bytes.len() - 4 {
        if &bytes[i..i + 4] == b"tfdt" {
            found += 1;
            if found > 1 {
                bytes[i..i + 4].copy_from_slice(b"free");
            }
        }
    }
    assert_eq!(found, 3);

    let input = Input::open(Box::new(BufferSource::new(bytes))).await.unwrap();
    let duration = input.compute_duration().await.unwrap();
    assert!((duration - 30.0).abs() < 1e-6, "duration was {}", duration);
}

#[tokio::test]
async fn fragmented_writes_reach_the_sink_monotonically() {
    let (sink, chunks) = RecordingSink::new();
    let muxer = Mp4Muxer::new(OutputTarget::stream(sink), mp4_options(Mp4Mode::Fragmented));

    let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
    muxer.start().await.unwrap();
    for (i, p) in long_running_packets().iter().enumerate() {
        let config = if i == 0 { Some(avc_config()) } else { None };
        muxer.add_video_packet(video, p, config.as_ref()).await.unwrap();
    }
    muxer.finalize().await.unwrap();

    let chunks = chunks.lock().unwrap();
    assert!(!chunks.is_empty());
    assert_monotonic(&chunks);

    // The assembled image is the same file a buffer target would have produced.
    let bytes = assemble(&chunks);
    assert_eq!(top_level_boxes(&bytes).first().map(String::as_str), Some("ftyp"));
}

#[tokio::test]
async fn packet_stream_matches_manual_iteration() {
    let target = BufferTarget::new();
    let muxer = Mp4Muxer::new(OutputTarget::buffer(target.clone()), mp4_options(Mp4Mode::Streaming));

    let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
    muxer.start().await.unwrap();
    for (i, p) in video_packets().iter().enumerate() {
        let config = if i == 0 { Some(avc_config()) } else { None };
        muxer.add_video_packet(video, p, config.as_ref()).await.unwrap();
    }
    muxer.finalize().await.unwrap();

    let input = Input::open(Box::new(BufferSource::new(target.take_buffer().unwrap())))
        .await
        .unwrap();
    let track = input.primary_video_track().unwrap();

    let manual = collect_track(&track, PacketOptions::default()).await;

    let mut stream = PacketStream::new(track, PacketOptions::default());
    let mut streamed = Vec::new();
    while let Some(packet) = stream.next().await.unwrap() {
        streamed.push(packet);
    }

    assert_eq!(manual.len(), streamed.len());
    for (a, b) in manual.iter().zip(&streamed) {
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.data, b.data);
    }
}

#[tokio::test]
async fn webvtt_cues_become_gap_and_cue_samples() {
    let target = BufferTarget::new();
    let muxer = Mp4Muxer::new(OutputTarget::buffer(target.clone()), mp4_options(Mp4Mode::FastStart));

    let subtitles = muxer.add_subtitle_track(SubtitleTrackOptions::default()).await.unwrap();
    muxer.start().await.unwrap();

    muxer
        .add_subtitle_cue(
            subtitles,
            SubtitleCue {
                timestamp: 1.5,
                duration: 2.0,
                text: "Hello <00:02.000>world".into(),
                identifier: Some("c1".into()),
                settings: Some("line:10%".into()),
                notes: None,
            },
        )
        .await
        .unwrap();
    muxer.finalize().await.unwrap();

    let input = Input::open(Box::new(BufferSource::new(target.take_buffer().unwrap())))
        .await
        .unwrap();
    let track = input.primary_track(TrackType::Subtitle).unwrap();

    let samples = collect_track(&track, PacketOptions::default()).await;
    assert_eq!(samples.len(), 2);

    // The gap sample covers the silence before the cue.
    assert_eq!(samples[0].timestamp, 0);
    assert_eq!(samples[0].duration, 1_500_000);
    assert!(samples[0].data.windows(4).any(|w| w == b"vtte"));

    // The cue sample carries the payload with identity, timing, and settings.
    assert_eq!(samples[1].timestamp, 1_500_000);
    assert_eq!(samples[1].duration, 2_000_000);
    let text = String::from_utf8_lossy(&samples[1].data);
    assert!(text.contains("vttc"));
    assert!(text.contains("c1"));
    assert!(text.contains("00:00:01.500"));
    assert!(text.contains("line:10%"));
    assert!(text.contains("Hello <00:02.000>world"));
}

#[tokio::test]
async fn timestamp_violations_are_rejected() {
    let target = BufferTarget::new();
    let muxer = Mp4Muxer::new(OutputTarget::buffer(target.clone()), mp4_options(Mp4Mode::Streaming));

    let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
    muxer.start().await.unwrap();

    // A non-key first sample is rejected.
    let delta_first = packet(0, 33_333, false, 1, 16);
    assert!(matches!(
        muxer.add_video_packet(video, &delta_first, Some(&avc_config())).await,
        Err(vessel::Error::TimestampOrder(_))
    ));

    // A positive first timestamp is rejected.
    let late_first = packet(500_000, 33_333, true, 1, 16);
    assert!(matches!(
        muxer.add_video_packet(video, &late_first, Some(&avc_config())).await,
        Err(vessel::Error::TimestampOrder(_))
    ));

    // A proper start, then a key frame behind the running maximum.
    let first = packet(0, 33_333, true, 1, 16);
    muxer.add_video_packet(video, &first, Some(&avc_config())).await.unwrap();
    let second = packet(100_000, 33_333, false, 2, 16);
    muxer.add_video_packet(video, &second, None).await.unwrap();

    let regressed_key = packet(50_000, 33_333, true, 3, 16);
    assert!(matches!(
        muxer.add_video_packet(video, &regressed_key, None).await,
        Err(vessel::Error::TimestampOrder(_))
    ));
}

#[tokio::test]
async fn adding_after_finalize_is_an_error() {
    let target = BufferTarget::new();
    let muxer = Mp4Muxer::new(OutputTarget::buffer(target.clone()), mp4_options(Mp4Mode::Streaming));

    let video = muxer.add_video_track(VideoTrackOptions::default()).await.unwrap();
    muxer.start().await.unwrap();
    let first = packet(0, 33_333, true, 1, 16);
    muxer.add_video_packet(video, &first, Some(&avc_config())).await.unwrap();
    muxer.finalize().await.unwrap();

    assert!(matches!(
        muxer.add_video_packet(video, &first, None).await,
        Err(vessel::Error::ProgrammerError(_))
    ));
    assert!(matches!(muxer.finalize().await, Err(vessel::Error::ProgrammerError(_))));
}
