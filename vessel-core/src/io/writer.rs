// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::trace;

use crate::errors::{monotonicity_error, Result};

/// Default page size of the chunked stream writer.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024 * 1024;

/// Minimum page size of the chunked stream writer.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Number of resident pages the chunked stream writer keeps before forcing older pages
/// out on the next flush.
const MAX_RESIDENT_PAGES: usize = 2;

/// A positioned write posted to a [`StreamTarget`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkChunk {
    pub position: u64,
    pub data: Vec<u8>,
}

/// A byte sink accepting positioned writes, with an optional backpressure signal.
///
/// A writer polls `desired_size` before posting: while it is zero or negative the
/// writer awaits `ready`, propagating sink slowness back through the muxer to the
/// caller.
#[async_trait]
pub trait StreamTarget: Send {
    /// Accept one positioned write.
    async fn write_chunk(&mut self, chunk: SinkChunk) -> Result<()>;

    /// The sink's remaining appetite in bytes. Non-positive values request
    /// backpressure.
    fn desired_size(&self) -> i64 {
        1
    }

    /// Resolve once the sink is ready to accept more data.
    async fn ready(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once by `finalize` after all chunks were posted.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A target backed by an in-memory buffer, populated when the output is finalized.
///
/// Handles are cheap clones sharing the same buffer slot, so the caller can keep one
/// while the writer owns another.
#[derive(Clone, Default)]
pub struct BufferTarget {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl BufferTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// The finalized buffer, or `None` before finalization.
    pub fn buffer(&self) -> Option<Vec<u8>> {
        self.slot.lock().unwrap().clone()
    }

    /// Take the finalized buffer out of the target.
    pub fn take_buffer(&self) -> Option<Vec<u8>> {
        self.slot.lock().unwrap().take()
    }

    fn set_buffer(&self, buf: Vec<u8>) {
        *self.slot.lock().unwrap() = Some(buf);
    }
}

/// Where the bytes of an output go. Passed to a muxer at construction; the muxer turns
/// it into the matching [`Writer`] variant.
pub enum OutputTarget {
    Buffer(BufferTarget),
    Stream { sink: Box<dyn StreamTarget>, chunked: bool, page_size: usize },
}

impl OutputTarget {
    pub fn buffer(target: BufferTarget) -> Self {
        OutputTarget::Buffer(target)
    }

    pub fn stream(sink: Box<dyn StreamTarget>) -> Self {
        OutputTarget::Stream { sink, chunked: false, page_size: DEFAULT_PAGE_SIZE }
    }

    pub fn chunked_stream(sink: Box<dyn StreamTarget>, page_size: usize) -> Self {
        let page_size = page_size.max(MIN_PAGE_SIZE);
        OutputTarget::Stream { sink, chunked: true, page_size }
    }

    /// Build the writer for this target. `ensure_monotonicity` is chosen by the muxer
    /// output mode, not by the caller.
    pub fn into_writer(self, ensure_monotonicity: bool) -> Writer {
        match self {
            OutputTarget::Buffer(target) => Writer::Buffer(BufferWriter::new(target)),
            OutputTarget::Stream { sink, chunked: false, .. } => {
                Writer::Stream(StreamWriter::new(sink, ensure_monotonicity))
            }
            OutputTarget::Stream { sink, chunked: true, page_size } => {
                Writer::Chunked(ChunkedStreamWriter::new(sink, page_size, ensure_monotonicity))
            }
        }
    }
}

/// An append-with-seek byte writer.
pub enum Writer {
    Buffer(BufferWriter),
    Stream(StreamWriter),
    Chunked(ChunkedStreamWriter),
}

impl Writer {
    /// Append bytes at the current position.
    pub fn write(&mut self, bytes: &[u8]) {
        match self {
            Writer::Buffer(w) => w.write(bytes),
            Writer::Stream(w) => w.write(bytes),
            Writer::Chunked(w) => w.write(bytes),
        }
    }

    /// Move the write position.
    pub fn seek(&mut self, pos: u64) {
        match self {
            Writer::Buffer(w) => w.pos = pos,
            Writer::Stream(w) => w.pos = pos,
            Writer::Chunked(w) => w.pos = pos,
        }
    }

    /// The current write position.
    pub fn pos(&self) -> u64 {
        match self {
            Writer::Buffer(w) => w.pos,
            Writer::Stream(w) => w.pos,
            Writer::Chunked(w) => w.pos,
        }
    }

    /// Push buffered writes towards the target, honoring sink backpressure.
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Writer::Buffer(_) => Ok(()),
            Writer::Stream(w) => w.flush().await,
            Writer::Chunked(w) => w.flush(false).await,
        }
    }

    /// Flush everything and complete the target.
    pub async fn finalize(&mut self) -> Result<()> {
        match self {
            Writer::Buffer(w) => {
                w.finalize();
                Ok(())
            }
            Writer::Stream(w) => {
                w.flush().await?;
                w.sink.finish().await
            }
            Writer::Chunked(w) => {
                w.flush(true).await?;
                w.sink.finish().await
            }
        }
    }
}

/// Writer over a growing in-memory buffer. Seeks are free.
pub struct BufferWriter {
    target: BufferTarget,
    buf: Vec<u8>,
    pos: u64,
    len: u64,
}

impl BufferWriter {
    fn new(target: BufferTarget) -> Self {
        BufferWriter { target, buf: Vec::new(), pos: 0, len: 0 }
    }

    fn write(&mut self, bytes: &[u8]) {
        let end = self.pos as usize + bytes.len();

        if end > self.buf.len() {
            // Grow by doubling so repeated small appends stay amortized.
            let mut new_len = self.buf.len().max(64);
            while new_len < end {
                new_len *= 2;
            }
            self.buf.resize(new_len, 0);
        }

        self.buf[self.pos as usize..end].copy_from_slice(bytes);
        self.pos = end as u64;
        self.len = self.len.max(self.pos);
    }

    fn finalize(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.truncate(self.len as usize);
        self.target.set_buffer(buf);
    }
}

struct Section {
    start: u64,
    data: Vec<u8>,
}

/// Writer over a streaming sink. Writes are deferred as positioned sections; `flush`
/// sorts them, merges overlaps, and posts the result in position order.
pub struct StreamWriter {
    sink: Box<dyn StreamTarget>,
    sections: Vec<Section>,
    pos: u64,
    ensure_monotonicity: bool,
    last_flushed_end: Option<u64>,
}

impl StreamWriter {
    fn new(sink: Box<dyn StreamTarget>, ensure_monotonicity: bool) -> Self {
        StreamWriter { sink, sections: Vec::new(), pos: 0, ensure_monotonicity, last_flushed_end: None }
    }

    fn write(&mut self, bytes: &[u8]) {
        match self.sections.last_mut() {
            Some(last) if last.start + last.data.len() as u64 == self.pos => {
                last.data.extend_from_slice(bytes);
            }
            _ => {
                self.sections.push(Section { start: self.pos, data: bytes.to_vec() });
            }
        }
        self.pos += bytes.len() as u64;
    }

    async fn flush(&mut self) -> Result<()> {
        if self.sections.is_empty() {
            return Ok(());
        }

        let mut sections = std::mem::take(&mut self.sections);
        sections.sort_by_key(|s| s.start);

        // Merge sections into contiguous chunks. Overlapping bytes are overwritten by
        // the section sorting later in position order.
        let mut chunks: Vec<SinkChunk> = Vec::new();

        for section in sections {
            match chunks.last_mut() {
                Some(chunk)
                    if section.start <= chunk.position + chunk.data.len() as u64 =>
                {
                    let offset = (section.start - chunk.position) as usize;
                    let end = offset + section.data.len();
                    if end > chunk.data.len() {
                        chunk.data.resize(end, 0);
                    }
                    chunk.data[offset..end].copy_from_slice(&section.data);
                }
                _ => {
                    chunks.push(SinkChunk { position: section.start, data: section.data });
                }
            }
        }

        for chunk in chunks {
            self.post(chunk).await?;
        }

        Ok(())
    }

    async fn post(&mut self, chunk: SinkChunk) -> Result<()> {
        if self.ensure_monotonicity {
            if let Some(expected) = self.last_flushed_end {
                if chunk.position != expected {
                    return monotonicity_error("stream write out of append order");
                }
            }
        }
        self.last_flushed_end = Some(chunk.position + chunk.data.len() as u64);

        while self.sink.desired_size() <= 0 {
            self.sink.ready().await?;
        }

        trace!("posting {} bytes at {}", chunk.data.len(), chunk.position);
        self.sink.write_chunk(chunk).await
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct PageInterval {
    start: usize,
    end: usize,
}

struct Page {
    /// Page number; the page covers `[number * page_size, (number + 1) * page_size)`.
    number: u64,
    data: Vec<u8>,
    /// Written intervals, page-relative, sorted and disjoint.
    intervals: Vec<PageInterval>,
    age: u64,
}

/// Writer over a streaming sink that partitions the address space into fixed-size pages.
/// A page leaves memory once its written intervals cover it completely, or when too many
/// pages are resident.
pub struct ChunkedStreamWriter {
    sink: Box<dyn StreamTarget>,
    pages: Vec<Page>,
    pos: u64,
    page_size: usize,
    next_age: u64,
    ensure_monotonicity: bool,
    last_flushed_end: Option<u64>,
}

impl ChunkedStreamWriter {
    fn new(sink: Box<dyn StreamTarget>, page_size: usize, ensure_monotonicity: bool) -> Self {
        ChunkedStreamWriter {
            sink,
            pages: Vec::new(),
            pos: 0,
            page_size,
            next_age: 0,
            ensure_monotonicity,
            last_flushed_end: None,
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut remaining = bytes;

        while !remaining.is_empty() {
            let number = self.pos / self.page_size as u64;
            let offset = (self.pos % self.page_size as u64) as usize;
            let take = remaining.len().min(self.page_size - offset);

            let page = self.page_mut(number);
            page.data[offset..offset + take].copy_from_slice(&remaining[..take]);
            insert_interval(&mut page.intervals, offset, offset + take);

            self.pos += take as u64;
            remaining = &remaining[take..];
        }
    }

    fn page_mut(&mut self, number: u64) -> &mut Page {
        let idx = match self.pages.binary_search_by_key(&number, |p| p.number) {
            Ok(idx) => idx,
            Err(idx) => {
                self.pages.insert(
                    idx,
                    Page {
                        number,
                        data: vec![0; self.page_size],
                        intervals: Vec::new(),
                        age: self.next_age,
                    },
                );
                self.next_age += 1;
                idx
            }
        };
        &mut self.pages[idx]
    }

    async fn flush(&mut self, all: bool) -> Result<()> {
        // A page is ready when its intervals cover it fully. Beyond the residency limit,
        // the oldest pages are forced out too.
        let full = PageInterval { start: 0, end: self.page_size };

        let mut ready: Vec<u64> = self
            .pages
            .iter()
            .filter(|p| all || (p.intervals.len() == 1 && p.intervals[0] == full))
            .map(|p| p.number)
            .collect();

        let resident = self.pages.len() - ready.len();
        if !all && resident > MAX_RESIDENT_PAGES {
            let mut overflow: Vec<&Page> = self
                .pages
                .iter()
                .filter(|p| !ready.contains(&p.number))
                .collect();
            overflow.sort_by_key(|p| p.age);

            for page in overflow.iter().take(resident - MAX_RESIDENT_PAGES) {
                ready.push(page.number);
            }
        }

        // Emit in position order so streamable outputs remain append-only.
        ready.sort_unstable();

        for number in ready {
            let idx = self.pages.binary_search_by_key(&number, |p| p.number).unwrap();
            let page = self.pages.remove(idx);
            let base = page.number * self.page_size as u64;

            for interval in &page.intervals {
                let chunk = SinkChunk {
                    position: base + interval.start as u64,
                    data: page.data[interval.start..interval.end].to_vec(),
                };

                if self.ensure_monotonicity {
                    if let Some(expected) = self.last_flushed_end {
                        if chunk.position != expected {
                            return monotonicity_error("page write out of append order");
                        }
                    }
                }
                self.last_flushed_end = Some(chunk.position + chunk.data.len() as u64);

                while self.sink.desired_size() <= 0 {
                    self.sink.ready().await?;
                }
                self.sink.write_chunk(chunk).await?;
            }
        }

        Ok(())
    }
}

/// Insert `[start, end)` into a sorted list of disjoint intervals, merging overlaps and
/// adjacencies.
fn insert_interval(intervals: &mut Vec<PageInterval>, start: usize, end: usize) {
    let mut new = PageInterval { start, end };
    let mut idx = intervals.partition_point(|iv| iv.end < start);

    while idx < intervals.len() && intervals[idx].start <= new.end {
        new.start = new.start.min(intervals[idx].start);
        new.end = new.end.max(intervals[idx].end);
        intervals.remove(idx);
    }

    intervals.insert(idx, new);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test sink recording every chunk, with an optional fixed appetite.
    pub(crate) struct RecordingSink {
        pub chunks: Arc<Mutex<Vec<SinkChunk>>>,
    }

    #[async_trait]
    impl StreamTarget for RecordingSink {
        async fn write_chunk(&mut self, chunk: SinkChunk) -> Result<()> {
            self.chunks.lock().unwrap().push(chunk);
            Ok(())
        }
    }

    fn recording_pair() -> (Box<dyn StreamTarget>, Arc<Mutex<Vec<SinkChunk>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        (Box::new(RecordingSink { chunks: chunks.clone() }), chunks)
    }

    #[test]
    fn verify_interval_merge() {
        let mut intervals = Vec::new();
        insert_interval(&mut intervals, 10, 20);
        insert_interval(&mut intervals, 30, 40);
        insert_interval(&mut intervals, 20, 30);
        assert_eq!(intervals, vec![PageInterval { start: 10, end: 40 }]);

        insert_interval(&mut intervals, 0, 5);
        assert_eq!(intervals.len(), 2);
        insert_interval(&mut intervals, 5, 10);
        assert_eq!(intervals, vec![PageInterval { start: 0, end: 40 }]);
    }

    #[tokio::test]
    async fn verify_buffer_writer_high_water() {
        let target = BufferTarget::new();
        let mut writer = OutputTarget::buffer(target.clone()).into_writer(false);

        writer.write(&[1, 2, 3, 4]);
        writer.seek(1);
        writer.write(&[9]);
        writer.finalize().await.unwrap();

        assert_eq!(target.buffer().unwrap(), vec![1, 9, 3, 4]);
    }

    #[tokio::test]
    async fn verify_stream_writer_merges_sections() {
        let (sink, chunks) = recording_pair();
        let mut writer = OutputTarget::stream(sink).into_writer(false);

        writer.write(&[0, 0, 0, 0]);
        writer.write(&[5, 6]);
        // Backpatch within the pending range.
        writer.seek(0);
        writer.write(&[1, 2]);
        writer.flush().await.unwrap();

        let posted = chunks.lock().unwrap().clone();
        assert_eq!(posted, vec![SinkChunk { position: 0, data: vec![1, 2, 0, 0, 5, 6] }]);
    }

    #[tokio::test]
    async fn verify_stream_writer_monotonicity() {
        let (sink, _chunks) = recording_pair();
        let mut writer = OutputTarget::stream(sink).into_writer(true);

        writer.write(&[1, 2, 3]);
        writer.flush().await.unwrap();

        // A rewritten earlier range must be rejected.
        writer.seek(0);
        writer.write(&[9]);
        assert!(matches!(
            writer.flush().await,
            Err(crate::errors::Error::MonotonicityViolation(_))
        ));
    }

    #[tokio::test]
    async fn verify_chunked_writer_page_flush() {
        let (sink, chunks) = recording_pair();
        let mut writer = Writer::Chunked(ChunkedStreamWriter::new(sink, MIN_PAGE_SIZE, true));

        // Fill one page exactly; it becomes flush-ready.
        writer.write(&vec![7u8; MIN_PAGE_SIZE]);
        writer.write(&[8, 8]);
        writer.flush().await.unwrap();

        {
            let posted = chunks.lock().unwrap();
            assert_eq!(posted.len(), 1);
            assert_eq!(posted[0].position, 0);
            assert_eq!(posted[0].data.len(), MIN_PAGE_SIZE);
        }

        // The partial tail page leaves on finalize.
        writer.finalize().await.unwrap();
        let posted = chunks.lock().unwrap();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[1].position, MIN_PAGE_SIZE as u64);
        assert_eq!(posted[1].data, vec![8, 8]);
    }

    #[tokio::test]
    async fn verify_chunked_writer_residency_limit() {
        let (sink, chunks) = recording_pair();
        let mut writer = Writer::Chunked(ChunkedStreamWriter::new(sink, MIN_PAGE_SIZE, false));

        // Touch four pages partially; none is fully covered.
        for page in 0..4u64 {
            writer.seek(page * MIN_PAGE_SIZE as u64);
            writer.write(&[page as u8]);
        }
        writer.flush().await.unwrap();

        // The two oldest pages were forced out.
        let posted = chunks.lock().unwrap().clone();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].position, 0);
        assert_eq!(posted[1].position, MIN_PAGE_SIZE as u64);
    }
}
