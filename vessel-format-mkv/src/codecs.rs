// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Codec tag to Matroska codec-id string mapping.

use vessel_core::codecs::{AudioCodec, SubtitleCodec, VideoCodec};

pub(crate) fn video_codec_id(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::Avc => "V_MPEG4/ISO/AVC",
        VideoCodec::Hevc => "V_MPEGH/ISO/HEVC",
        VideoCodec::Vp8 => "V_VP8",
        VideoCodec::Vp9 => "V_VP9",
        VideoCodec::Av1 => "V_AV1",
    }
}

pub(crate) fn audio_codec_id(codec: AudioCodec) -> &'static str {
    match codec {
        AudioCodec::Aac => "A_AAC",
        AudioCodec::Opus => "A_OPUS",
        AudioCodec::Vorbis => "A_VORBIS",
        AudioCodec::Flac => "A_FLAC",
        AudioCodec::Mp3 => "A_MPEG/L3",
        AudioCodec::Pcm => "A_PCM/INT/LIT",
    }
}

pub(crate) fn subtitle_codec_id(codec: SubtitleCodec) -> &'static str {
    match codec {
        SubtitleCodec::WebVtt => "S_TEXT/WEBVTT",
    }
}

pub(crate) fn video_codec_from_id(id: &str) -> Option<VideoCodec> {
    match id {
        "V_MPEG4/ISO/AVC" => Some(VideoCodec::Avc),
        "V_MPEGH/ISO/HEVC" => Some(VideoCodec::Hevc),
        "V_VP8" => Some(VideoCodec::Vp8),
        "V_VP9" => Some(VideoCodec::Vp9),
        "V_AV1" => Some(VideoCodec::Av1),
        _ => None,
    }
}

pub(crate) fn audio_codec_from_id(id: &str) -> Option<AudioCodec> {
    match id {
        "A_AAC" => Some(AudioCodec::Aac),
        "A_OPUS" => Some(AudioCodec::Opus),
        "A_VORBIS" => Some(AudioCodec::Vorbis),
        "A_FLAC" => Some(AudioCodec::Flac),
        "A_MPEG/L3" => Some(AudioCodec::Mp3),
        "A_PCM/INT/LIT" => Some(AudioCodec::Pcm),
        _ => None,
    }
}

pub(crate) fn subtitle_codec_from_id(id: &str) -> Option<SubtitleCodec> {
    match id {
        "S_TEXT/WEBVTT" => Some(SubtitleCodec::WebVtt),
        _ => None,
    }
}

/// Whether a codec is allowed inside a WebM file.
pub(crate) fn webm_allows_video(codec: VideoCodec) -> bool {
    matches!(codec, VideoCodec::Vp8 | VideoCodec::Vp9 | VideoCodec::Av1)
}

/// Whether a codec is allowed inside a WebM file.
pub(crate) fn webm_allows_audio(codec: AudioCodec) -> bool {
    matches!(codec, AudioCodec::Opus | AudioCodec::Vorbis)
}
