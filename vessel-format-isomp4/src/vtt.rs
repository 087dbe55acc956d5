// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! WebVTT cue packing for ISO BMFF subtitle tracks (ISO/IEC 14496-30).
//!
//! Cues arrive with arbitrary, possibly overlapping time ranges. The track timeline is
//! split at every cue start and end; each segment between two boundaries becomes one
//! sample, either a `vtte` gap sample or a `vttc` sample carrying every cue active in
//! that segment.

use vessel_core::errors::{invalid_metadata_error, Result};

use crate::boxes::write::{ByteBuf, MuxBox};

/// A WebVTT cue handed to the muxer. The text is the already parsed cue payload; this
/// library never parses WebVTT itself.
#[derive(Clone, Debug)]
pub struct SubtitleCue {
    /// Cue start in seconds.
    pub timestamp: f64,
    /// Cue duration in seconds.
    pub duration: f64,
    pub text: String,
    pub identifier: Option<String>,
    /// Cue settings list, e.g. `line:10%`.
    pub settings: Option<String>,
    /// Comment blocks preceding the cue.
    pub notes: Option<String>,
}

/// One packed subtitle sample.
#[derive(Debug)]
pub struct SubtitleSample {
    pub timestamp: f64,
    pub duration: f64,
    pub data: Vec<u8>,
}

struct ActiveCue {
    cue: SubtitleCue,
    /// Source id shared by every sample a cue appears in.
    uid: u32,
    /// Whether the cue has already appeared in an emitted sample.
    continued: bool,
}

/// Incremental cue-to-sample packer. Cues must arrive ordered by start time.
pub struct CuePacker {
    active: Vec<ActiveCue>,
    /// End of the last emitted sample; the timeline is covered without holes up to
    /// this point.
    last_cue_end: f64,
    next_uid: u32,
}

impl Default for CuePacker {
    fn default() -> Self {
        CuePacker { active: Vec::new(), last_cue_end: 0.0, next_uid: 1 }
    }
}

impl CuePacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// End of the last emitted sample.
    pub fn last_cue_end(&self) -> f64 {
        self.last_cue_end
    }

    /// Add a cue, returning the samples that became complete.
    pub fn add(&mut self, cue: SubtitleCue) -> Result<Vec<SubtitleSample>> {
        if cue.duration < 0.0 {
            return invalid_metadata_error("cue duration must be non-negative");
        }

        let mut samples = self.emit_until(cue.timestamp);

        if self.active.is_empty() && cue.timestamp > self.last_cue_end {
            // A gap between the last emitted sample and this cue.
            samples.push(gap_sample(self.last_cue_end, cue.timestamp));
            self.last_cue_end = cue.timestamp;
        }

        let uid = self.next_uid;
        self.next_uid += 1;
        self.active.push(ActiveCue { cue, uid, continued: false });

        Ok(samples)
    }

    /// Emit all remaining samples.
    pub fn finish(&mut self) -> Vec<SubtitleSample> {
        self.emit_until(f64::INFINITY)
    }

    /// Emit samples for every timeline segment that ends at or before `until`.
    fn emit_until(&mut self, until: f64) -> Vec<SubtitleSample> {
        let mut samples = Vec::new();

        while !self.active.is_empty() {
            let cursor = self.last_cue_end;

            // The next boundary is the earliest active cue end, capped at `until`.
            let min_end = self
                .active
                .iter()
                .map(|a| a.cue.timestamp + a.cue.duration)
                .fold(f64::INFINITY, f64::min);
            let boundary = min_end.min(until);

            if boundary <= cursor {
                if min_end <= cursor {
                    // Fully elapsed cues contribute no further samples.
                    self.active.retain(|a| a.cue.timestamp + a.cue.duration > cursor);
                    continue;
                }
                break;
            }

            if boundary == f64::INFINITY {
                break;
            }

            samples.push(self.cue_sample(cursor, boundary));
            self.last_cue_end = boundary;

            self.active.retain(|a| a.cue.timestamp + a.cue.duration > boundary);
        }

        samples
    }

    fn cue_sample(&mut self, start: f64, end: f64) -> SubtitleSample {
        let mut data = Vec::new();

        for active in self.active.iter_mut() {
            if active.cue.timestamp > start {
                continue;
            }

            let bx = serialize_cue(&active.cue, active.uid, active.continued);
            append_box(&mut data, &bx);
            active.continued = true;
        }

        SubtitleSample { timestamp: start, duration: end - start, data }
    }
}

fn gap_sample(start: f64, end: f64) -> SubtitleSample {
    let bx = MuxBox::new(b"vtte", Vec::new());
    let mut data = Vec::new();
    append_box(&mut data, &bx);
    SubtitleSample { timestamp: start, duration: end - start, data }
}

fn serialize_cue(cue: &SubtitleCue, uid: u32, continued: bool) -> MuxBox {
    let mut vttc = MuxBox::new(b"vttc", Vec::new());

    if continued {
        // Ties the continuation samples of one cue together.
        let mut vsid = ByteBuf::new();
        vsid.i32(uid as i32);
        vttc.push(MuxBox::new(b"vsid", vsid.into_inner()));
    }

    if let Some(notes) = &cue.notes {
        vttc.push(MuxBox::new(b"vtta", notes.as_bytes().to_vec()));
    }

    if let Some(identifier) = &cue.identifier {
        vttc.push(MuxBox::new(b"iden", identifier.as_bytes().to_vec()));
    }

    if has_inline_timestamp(&cue.text) {
        // Inline cue timestamps are relative to this original start time.
        let ctim = format_timestamp(cue.timestamp);
        vttc.push(MuxBox::new(b"ctim", ctim.into_bytes()));
    }

    if let Some(settings) = &cue.settings {
        vttc.push(MuxBox::new(b"sttg", settings.as_bytes().to_vec()));
    }

    vttc.push(MuxBox::new(b"payl", cue.text.as_bytes().to_vec()));

    vttc
}

/// Whether the cue text contains an inline `<mm:ss.mmm>` style timestamp.
fn has_inline_timestamp(text: &str) -> bool {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'<' {
            if let Some(&next) = bytes.get(i + 1) {
                if next.is_ascii_digit() {
                    return true;
                }
            }
        }
    }
    false
}

/// Format a time in seconds as `HH:MM:SS.mmm`.
fn format_timestamp(secs: f64) -> String {
    let millis = (secs * 1000.0).round() as u64;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        millis / 3_600_000,
        (millis / 60_000) % 60,
        (millis / 1000) % 60,
        millis % 1000
    )
}

/// Serialize a box tree into a plain byte vector.
fn append_box(out: &mut Vec<u8>, bx: &MuxBox) {
    out.extend_from_slice(&(bx.measure() as u32).to_be_bytes());
    out.extend_from_slice(&bx.fourcc);
    out.extend_from_slice(&bx.contents);
    for child in &bx.children {
        append_box(out, child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn box_types(mut data: &[u8]) -> Vec<[u8; 4]> {
        let mut types = Vec::new();
        while data.len() >= 8 {
            let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            types.push([data[4], data[5], data[6], data[7]]);
            data = &data[size..];
        }
        types
    }

    #[test]
    fn verify_gap_then_cue() {
        let mut packer = CuePacker::new();

        let samples = packer
            .add(SubtitleCue {
                timestamp: 1.5,
                duration: 2.0,
                text: "Hello <00:02.000>world".into(),
                identifier: Some("c1".into()),
                settings: Some("line:10%".into()),
                notes: None,
            })
            .unwrap();

        // A vtte gap covering [0, 1.5).
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp, 0.0);
        assert_eq!(samples[0].duration, 1.5);
        assert_eq!(box_types(&samples[0].data), vec![*b"vtte"]);

        let samples = packer.finish();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp, 1.5);
        assert_eq!(samples[0].duration, 2.0);
        assert_eq!(packer.last_cue_end(), 3.5);

        // The cue sample is a single vttc with iden, ctim, sttg, payl children.
        let types = box_types(&samples[0].data);
        assert_eq!(types, vec![*b"vttc"]);
        let inner = box_types(&samples[0].data[8..]);
        assert_eq!(inner, vec![*b"iden", *b"ctim", *b"sttg", *b"payl"]);

        // ctim carries the formatted original start time.
        let text = String::from_utf8_lossy(&samples[0].data);
        assert!(text.contains("00:00:01.500"));
        assert!(text.contains("line:10%"));
        assert!(text.contains("Hello <00:02.000>world"));
    }

    #[test]
    fn verify_overlapping_cues_split_at_boundaries() {
        let mut packer = CuePacker::new();

        packer
            .add(SubtitleCue {
                timestamp: 0.0,
                duration: 4.0,
                text: "a".into(),
                identifier: None,
                settings: None,
                notes: None,
            })
            .unwrap();

        let samples = packer
            .add(SubtitleCue {
                timestamp: 2.0,
                duration: 4.0,
                text: "b".into(),
                identifier: None,
                settings: None,
                notes: None,
            })
            .unwrap();

        // The first segment [0, 2) contains only cue a.
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp, 0.0);
        assert_eq!(samples[0].duration, 2.0);
        assert_eq!(box_types(&samples[0].data), vec![*b"vttc"]);

        let samples = packer.finish();

        // [2, 4) carries both cues, [4, 6) only cue b with a vsid continuation.
        assert_eq!(samples.len(), 2);
        assert_eq!(box_types(&samples[0].data), vec![*b"vttc", *b"vttc"]);
        assert_eq!(samples[1].timestamp, 4.0);
        let inner = box_types(&samples[1].data[8..]);
        assert!(inner.contains(&*b"vsid"));
    }

    #[test]
    fn verify_no_inline_timestamp_no_ctim() {
        let mut packer = CuePacker::new();
        packer
            .add(SubtitleCue {
                timestamp: 0.0,
                duration: 1.0,
                text: "plain".into(),
                identifier: None,
                settings: None,
                notes: None,
            })
            .unwrap();

        let samples = packer.finish();
        let inner = box_types(&samples[0].data[8..]);
        assert_eq!(inner, vec![*b"payl"]);
    }
}
