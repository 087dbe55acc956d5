// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::trace;

use crate::errors::{programmer_error, Result};

use super::MediaSource;

const DEFAULT_MAX_STORABLE_BYTES: usize = 64 * 1024 * 1024;

/// `RangeReader` options.
#[derive(Copy, Clone, Debug)]
pub struct RangeReaderOptions {
    /// The maximum number of cached bytes. When the cache exceeds this budget, the least
    /// recently used range is evicted, always keeping at least one. Default: 64 MiB.
    pub max_storable_bytes: usize,
}

impl Default for RangeReaderOptions {
    fn default() -> Self {
        RangeReaderOptions { max_storable_bytes: DEFAULT_MAX_STORABLE_BYTES }
    }
}

struct LoadedRange {
    start: u64,
    bytes: Vec<u8>,
    /// Monotonic age counter, bumped on each view hit. The lowest value is the eviction
    /// candidate.
    age: u64,
}

impl LoadedRange {
    #[inline]
    fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }
}

/// A range cache over a [`MediaSource`].
///
/// `load_range` fetches a byte range from the source unless an already cached range
/// fully covers it; `view` then returns the bytes synchronously. Viewing a range that
/// was never loaded is a caller bug and reported as a programmer error.
pub struct RangeReader {
    source: Box<dyn MediaSource>,
    /// Cached ranges, pairwise non-overlapping in the containment sense, sorted by
    /// start position.
    ranges: Vec<LoadedRange>,
    total_bytes: usize,
    next_age: u64,
    source_len: Option<u64>,
    options: RangeReaderOptions,
}

impl RangeReader {
    pub fn new(source: Box<dyn MediaSource>, options: RangeReaderOptions) -> Self {
        RangeReader {
            source,
            ranges: Vec::new(),
            total_bytes: 0,
            next_age: 0,
            source_len: None,
            options,
        }
    }

    /// The total length of the underlying source, fetched once and cached.
    pub async fn source_len(&mut self) -> Result<u64> {
        match self.source_len {
            Some(len) => Ok(len),
            None => {
                let len = self.source.len().await?;
                self.source_len = Some(len);
                Ok(len)
            }
        }
    }

    /// Ensure the byte range `[start, end)` is cached.
    pub async fn load_range(&mut self, start: u64, end: u64) -> Result<()> {
        if end <= start {
            return Ok(());
        }

        if self.find_covering(start, end).is_some() {
            return Ok(());
        }

        trace!("loading range [{}, {})", start, end);

        let bytes = self.source.read_range(start, end).await?;
        self.insert(start, bytes);
        self.evict_over_budget();

        Ok(())
    }

    /// Get a view of the byte range `[start, end)`. The range must have been loaded
    /// first.
    pub fn view(&mut self, start: u64, end: u64) -> Result<&[u8]> {
        let idx = match self.find_covering(start, end) {
            Some(idx) => idx,
            None => return programmer_error("viewed a range that was not loaded"),
        };

        let range = &mut self.ranges[idx];
        range.age = self.next_age;
        self.next_age += 1;

        let offset = (start - range.start) as usize;
        Ok(&range.bytes[offset..offset + (end - start) as usize])
    }

    /// Load and view in one step, returning owned bytes.
    pub async fn fetch(&mut self, start: u64, end: u64) -> Result<Vec<u8>> {
        self.load_range(start, end).await?;
        Ok(self.view(start, end)?.to_vec())
    }

    /// Drop a range previously loaded with exactly the given bounds.
    pub fn forget_range(&mut self, start: u64, end: u64) {
        if let Some(idx) = self.ranges.iter().position(|r| r.start == start && r.end() == end) {
            self.total_bytes -= self.ranges[idx].bytes.len();
            self.ranges.remove(idx);
        }
    }

    /// The number of cached bytes.
    pub fn cached_bytes(&self) -> usize {
        self.total_bytes
    }

    /// The number of cached ranges.
    pub fn cached_range_count(&self) -> usize {
        self.ranges.len()
    }

    fn find_covering(&self, start: u64, end: u64) -> Option<usize> {
        // Candidate: the last range starting at or before start.
        let idx = self.ranges.partition_point(|r| r.start <= start).checked_sub(1)?;
        let range = &self.ranges[idx];

        if range.end() >= end {
            Some(idx)
        }
        else {
            None
        }
    }

    fn insert(&mut self, start: u64, bytes: Vec<u8>) {
        let end = start + bytes.len() as u64;

        // Absorb every cached range fully contained in the new one.
        self.ranges.retain(|r| {
            let contained = r.start >= start && r.end() <= end;
            if contained {
                self.total_bytes -= r.bytes.len();
            }
            !contained
        });

        self.total_bytes += bytes.len();

        let idx = self.ranges.partition_point(|r| r.start <= start);
        self.ranges.insert(idx, LoadedRange { start, bytes, age: self.next_age });
        self.next_age += 1;
    }

    fn evict_over_budget(&mut self) {
        while self.total_bytes > self.options.max_storable_bytes && self.ranges.len() >= 2 {
            let oldest = self
                .ranges
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.age)
                .map(|(i, _)| i)
                .unwrap();

            trace!(
                "evicting range [{}, {})",
                self.ranges[oldest].start,
                self.ranges[oldest].end()
            );

            self.total_bytes -= self.ranges[oldest].bytes.len();
            self.ranges.remove(oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BufferSource;

    fn reader_with(len: usize, budget: usize) -> RangeReader {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        RangeReader::new(
            Box::new(BufferSource::new(data)),
            RangeReaderOptions { max_storable_bytes: budget },
        )
    }

    #[tokio::test]
    async fn verify_view_requires_load() {
        let mut reader = reader_with(1024, usize::MAX);

        assert!(reader.view(0, 16).is_err());

        reader.load_range(0, 16).await.unwrap();
        let view = reader.view(0, 16).unwrap();
        assert_eq!(view.len(), 16);
        assert_eq!(view[3], 3);
    }

    #[tokio::test]
    async fn verify_contained_range_is_absorbed() {
        let mut reader = reader_with(4096, usize::MAX);

        reader.load_range(100, 200).await.unwrap();
        reader.load_range(300, 400).await.unwrap();
        assert_eq!(reader.cached_range_count(), 2);

        // A superset swallows both.
        reader.load_range(0, 1000).await.unwrap();
        assert_eq!(reader.cached_range_count(), 1);
        assert_eq!(reader.cached_bytes(), 1000);

        // A sub-range is served from cache.
        reader.load_range(150, 350).await.unwrap();
        assert_eq!(reader.cached_range_count(), 1);
    }

    #[tokio::test]
    async fn verify_budget_eviction() {
        let mut reader = reader_with(4096, 256);

        reader.load_range(0, 128).await.unwrap();
        reader.load_range(1024, 1152).await.unwrap();
        assert_eq!(reader.cached_bytes(), 256);

        // Bump the age of the first range so the second becomes the eviction candidate.
        reader.view(0, 1).unwrap();

        reader.load_range(2048, 2176).await.unwrap();
        assert_eq!(reader.cached_bytes(), 256);
        assert!(reader.view(1024, 1152).is_err());
        assert!(reader.view(0, 128).is_ok());
    }

    #[tokio::test]
    async fn verify_single_range_exceeding_budget_is_kept() {
        let mut reader = reader_with(4096, 256);

        reader.load_range(0, 1024).await.unwrap();
        assert_eq!(reader.cached_range_count(), 1);
        assert!(reader.view(0, 1024).is_ok());
    }

    #[tokio::test]
    async fn verify_forget_range() {
        let mut reader = reader_with(4096, usize::MAX);

        reader.load_range(0, 64).await.unwrap();
        reader.forget_range(0, 32);
        assert_eq!(reader.cached_range_count(), 1);
        reader.forget_range(0, 64);
        assert_eq!(reader.cached_range_count(), 0);
        assert_eq!(reader.cached_bytes(), 0);
    }
}
