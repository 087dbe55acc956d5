// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `streams` module layers lazy iteration on top of an [`InputTrack`]: a packet
//! stream with bounded readahead, and decoded-frame streams that orchestrate an
//! external decoder.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::errors::Result;
use crate::packet::EncodedPacket;
use crate::track::{InputTrack, PacketOptions};

/// Bound on in-flight decode work: submitted packets plus queued output frames.
pub const MAX_QUEUE_SIZE: usize = 8;

/// Minimum readahead of a packet stream.
const MIN_PACKET_QUEUE: usize = 2;

/// A lazily produced sequence of a track's packets in decode order.
///
/// The stream keeps a bounded readahead queue. The queue bound starts at two packets and
/// grows with the observed consumption rate over the last second, smoothing consumer
/// jitter without unbounded buffering.
pub struct PacketStream {
    track: Arc<dyn InputTrack>,
    options: PacketOptions,
    end_timestamp: f64,
    queue: VecDeque<EncodedPacket>,
    capacity: usize,
    consume_times: VecDeque<Instant>,
    /// The packet most recently handed to the queue, used to resume iteration.
    cursor: Option<EncodedPacket>,
    started: bool,
    ended: bool,
}

impl PacketStream {
    /// Stream every packet of the track.
    pub fn new(track: Arc<dyn InputTrack>, options: PacketOptions) -> Self {
        Self::with_range(track, None, f64::INFINITY, options)
    }

    /// Stream packets starting from `start` (or the first packet when `None`) up to but
    /// excluding packets at or after `end_timestamp` seconds.
    pub fn with_range(
        track: Arc<dyn InputTrack>,
        start: Option<EncodedPacket>,
        end_timestamp: f64,
        options: PacketOptions,
    ) -> Self {
        let started = start.is_some();
        let mut queue = VecDeque::new();
        let cursor = start.clone();

        if let Some(start) = start {
            if start.timestamp_secs() < end_timestamp {
                queue.push_back(start);
            }
        }

        PacketStream {
            track,
            options,
            end_timestamp,
            queue,
            capacity: MIN_PACKET_QUEUE,
            consume_times: VecDeque::new(),
            cursor,
            started,
            ended: false,
        }
    }

    /// The next packet, or `None` once the track (or the requested range) is exhausted.
    pub async fn next(&mut self) -> Result<Option<EncodedPacket>> {
        self.record_consume();

        if self.queue.is_empty() && !self.ended {
            self.produce().await?;
        }

        let item = self.queue.pop_front();

        // Refill the readahead window on the consumer's schedule.
        while !self.ended && self.queue.len() < self.capacity {
            self.produce().await?;
        }

        Ok(item)
    }

    /// Stop the stream. Remaining queued packets are dropped.
    pub fn close(&mut self) {
        self.ended = true;
        self.queue.clear();
    }

    fn record_consume(&mut self) {
        let now = Instant::now();
        self.consume_times.push_back(now);

        while let Some(first) = self.consume_times.front() {
            if now.duration_since(*first) > Duration::from_secs(1) {
                self.consume_times.pop_front();
            }
            else {
                break;
            }
        }

        self.capacity = self.consume_times.len().max(MIN_PACKET_QUEUE);
    }

    async fn produce(&mut self) -> Result<()> {
        let next = match (&self.cursor, self.started) {
            (None, false) => self.track.first_packet(self.options).await,
            (None, true) => Ok(None),
            (Some(prev), _) => self.track.next_packet(prev, self.options).await,
        };

        match next {
            Ok(Some(packet)) => {
                self.started = true;
                if packet.timestamp_secs() >= self.end_timestamp {
                    self.ended = true;
                }
                else {
                    self.cursor = Some(packet.clone());
                    self.queue.push_back(packet);
                }
            }
            Ok(None) => {
                self.ended = true;
            }
            Err(err) => {
                // A source error ends the stream for good.
                self.ended = true;
                return Err(err);
            }
        }

        Ok(())
    }
}

/// One decoded frame handed back from the external decoder.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    /// Presentation timestamp in seconds.
    pub timestamp: f64,
    /// Duration in seconds.
    pub duration: f64,
    pub data: Box<[u8]>,
}

/// External decoder contract.
///
/// Packets are submitted in decode order; frames come back in presentation order
/// through `next_frame`. The library bounds submitted-but-unproduced work using
/// `decode_queue_size`.
#[async_trait]
pub trait Decoder: Send {
    /// Number of packets submitted but not yet surfaced as frames.
    fn decode_queue_size(&self) -> usize;

    /// Submit one packet in decode order.
    async fn decode(&mut self, packet: &EncodedPacket) -> Result<()>;

    /// Signal the end of submission, making all remaining frames available.
    async fn flush(&mut self) -> Result<()>;

    /// Take the next decoded frame in presentation order, if one is ready.
    fn next_frame(&mut self) -> Option<DecodedFrame>;

    /// Discard internal decode state before seeding from a new key packet.
    fn reset(&mut self);
}

/// Decoded frames of a presentation-time range.
///
/// Decoding starts from the key packet at or before `start` so every emitted frame is
/// fully decodable. Frames before `start` are dropped, except that the latest such
/// frame is emitted first, giving the consumer a defined frame at time `start`.
pub struct FrameRangeStream {
    track: Arc<dyn InputTrack>,
    decoder: Box<dyn Decoder>,
    start: f64,
    end: f64,
    cursor: Option<EncodedPacket>,
    pending: VecDeque<DecodedFrame>,
    hold_back: Option<DecodedFrame>,
    emitted_any: bool,
    feeding_done: bool,
    flushed: bool,
}

impl FrameRangeStream {
    pub async fn new(
        track: Arc<dyn InputTrack>,
        decoder: Box<dyn Decoder>,
        start: f64,
        end: f64,
    ) -> Result<Self> {
        // Seed from the key packet at or before the range start; a range that precedes
        // the whole track starts from the first packet instead.
        let cursor = match track.key_packet_at(start, PacketOptions::default()).await? {
            Some(packet) => Some(packet),
            None => track.first_packet(PacketOptions::default()).await?,
        };

        Ok(FrameRangeStream {
            track,
            decoder,
            start,
            end,
            cursor,
            pending: VecDeque::new(),
            hold_back: None,
            emitted_any: false,
            feeding_done: false,
            flushed: false,
        })
    }

    /// The next frame of the range in presentation order, or `None` when done.
    pub async fn next(&mut self) -> Result<Option<DecodedFrame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }

            if self.flushed {
                return Ok(None);
            }

            if self.feeding_done {
                self.decoder.flush().await?;
                self.flushed = true;
                self.drain();
                continue;
            }

            // Keep the decoder fed, bounded by in-flight work.
            while !self.feeding_done && self.decoder.decode_queue_size() < MAX_QUEUE_SIZE {
                match self.cursor.take() {
                    Some(packet) => {
                        // Feeding stops at the first key packet at or past the range
                        // end; every frame before `end` is complete by then.
                        if packet.is_key() && packet.timestamp_secs() >= self.end {
                            self.feeding_done = true;
                            break;
                        }

                        self.decoder.decode(&packet).await?;
                        self.cursor =
                            self.track.next_packet(&packet, PacketOptions::default()).await?;
                    }
                    None => {
                        self.feeding_done = true;
                    }
                }
            }

            self.drain();
        }
    }

    fn drain(&mut self) {
        while let Some(frame) = self.decoder.next_frame() {
            if frame.timestamp < self.start {
                // Keep only the most recent frame preceding the range.
                self.hold_back = Some(frame);
            }
            else {
                if !self.emitted_any {
                    if let Some(held) = self.hold_back.take() {
                        self.pending.push_back(held);
                    }
                    self.emitted_any = true;
                }

                if frame.timestamp < self.end {
                    self.pending.push_back(frame);
                }
                else {
                    self.feeding_done = true;
                }
            }
        }

        // A range that ends before any in-range frame still surfaces the held frame.
        if self.flushed && !self.emitted_any {
            if let Some(held) = self.hold_back.take() {
                self.pending.push_back(held);
                self.emitted_any = true;
            }
        }
    }
}

/// Decoded frames for an explicit list of presentation timestamps.
///
/// For each requested timestamp the stream locates the containing packet and its key
/// packet. When the required decode prefix matches the previous one and the target does
/// not move backwards, the decoder state is reused; repeated timestamps duplicate the
/// previously emitted frame without decoding at all.
pub struct FrameTimestampStream {
    track: Arc<dyn InputTrack>,
    decoder: Box<dyn Decoder>,
    timestamps: VecDeque<f64>,
    /// Key packet timestamp of the decode run currently inside the decoder.
    seeded_key: Option<i64>,
    /// The packet most recently submitted to the decoder.
    fed: Option<EncodedPacket>,
    last_emitted: Option<DecodedFrame>,
    /// Presentation timestamps awaiting a matching output frame.
    timestamps_of_interest: VecDeque<f64>,
}

impl FrameTimestampStream {
    pub fn new(
        track: Arc<dyn InputTrack>,
        decoder: Box<dyn Decoder>,
        timestamps: impl IntoIterator<Item = f64>,
    ) -> Self {
        FrameTimestampStream {
            track,
            decoder,
            timestamps: timestamps.into_iter().collect(),
            seeded_key: None,
            fed: None,
            last_emitted: None,
            timestamps_of_interest: VecDeque::new(),
        }
    }

    /// The frame for the next requested timestamp, or `None` when the list is done.
    /// Timestamps without a containing packet yield `None` entries skipped over.
    pub async fn next(&mut self) -> Result<Option<DecodedFrame>> {
        let target_time = match self.timestamps.pop_front() {
            Some(t) => t,
            None => return Ok(None),
        };

        let target = match self.track.packet_at(target_time, PacketOptions::default()).await? {
            Some(packet) => packet,
            None => match self.track.first_packet(PacketOptions::default()).await? {
                Some(packet) => packet,
                None => return Ok(None),
            },
        };

        let key = match self
            .track
            .key_packet_at(target.timestamp_secs(), PacketOptions::default())
            .await?
        {
            Some(packet) => packet,
            None => target.clone(),
        };

        // Same decode prefix and a non-regressing target: the frame is either already
        // emitted (a repeat) or further along the current run.
        let reusable = self.seeded_key == Some(key.timestamp)
            && self
                .last_emitted
                .as_ref()
                .map(|f| target.timestamp_secs() >= f.timestamp)
                .unwrap_or(false);

        if reusable {
            if let Some(last) = &self.last_emitted {
                if last.timestamp == target.timestamp_secs() {
                    return Ok(Some(last.clone()));
                }
            }
        }
        else {
            // Re-seed the decoder from the target's key packet.
            self.decoder.reset();
            self.seeded_key = Some(key.timestamp);
            self.decoder.decode(&key).await?;
            self.fed = Some(key);
        }

        self.timestamps_of_interest.push_back(target.timestamp_secs());

        // Submit packets until the frame of interest appears.
        loop {
            while let Some(frame) = self.decoder.next_frame() {
                if let Some(front) = self.timestamps_of_interest.front() {
                    if frame.timestamp == *front {
                        self.timestamps_of_interest.pop_front();
                        self.last_emitted = Some(frame.clone());
                        return Ok(Some(frame));
                    }
                }
            }

            let prev = match &self.fed {
                Some(prev) => prev.clone(),
                None => {
                    // Nothing left to submit and the frame never appeared.
                    self.decoder.flush().await?;
                    match self.decoder.next_frame() {
                        Some(frame) => {
                            self.timestamps_of_interest.pop_front();
                            self.last_emitted = Some(frame.clone());
                            return Ok(Some(frame));
                        }
                        None => return Ok(None),
                    }
                }
            };

            if self.decoder.decode_queue_size() >= MAX_QUEUE_SIZE {
                self.decoder.flush().await?;
                continue;
            }

            match self.track.next_packet(&prev, PacketOptions::default()).await? {
                Some(packet) => {
                    self.decoder.decode(&packet).await?;
                    self.fed = Some(packet);
                }
                None => {
                    self.decoder.flush().await?;
                    self.fed = None;
                }
            }
        }
    }
}
