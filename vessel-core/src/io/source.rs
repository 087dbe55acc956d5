// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;

use crate::errors::Result;

/// `MediaSource` is a random-access byte provider. A source *must* implement this trait
/// to be demuxed.
///
/// Ranges may be requested in any order, may overlap, and may extend past the end of the
/// source; reads past the end return the available prefix.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Returns the total length of the source in bytes.
    async fn len(&self) -> Result<u64>;

    /// Reads the byte range `[start, end)` and returns it.
    async fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>>;
}

/// An in-memory [`MediaSource`] over a byte buffer.
pub struct BufferSource {
    buf: Vec<u8>,
}

impl BufferSource {
    pub fn new(buf: impl Into<Vec<u8>>) -> Self {
        BufferSource { buf: buf.into() }
    }
}

#[async_trait]
impl MediaSource for BufferSource {
    async fn len(&self) -> Result<u64> {
        Ok(self.buf.len() as u64)
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let len = self.buf.len() as u64;
        let start = start.min(len) as usize;
        let end = end.clamp(start as u64, len) as usize;
        Ok(self.buf[start..end].to_vec())
    }
}
