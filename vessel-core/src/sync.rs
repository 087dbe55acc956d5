// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `sync` module provides the single-acquirer serialization primitive used to
//! linearize container-structural mutations and writer flushes.

use tokio::sync::{Mutex, MutexGuard};

/// A FIFO async mutex.
///
/// Acquirers are granted the lock in request order, which linearizes every public
/// mutation of a muxer or demuxer: `start`, each sample submission, track close, and
/// `finalize` on the mux side; fragment discovery on the demux side. The guard releases
/// on drop, including on every error path.
pub struct AsyncMutex<T> {
    inner: Mutex<T>,
}

impl<T> AsyncMutex<T> {
    pub fn new(value: T) -> Self {
        AsyncMutex { inner: Mutex::new(value) }
    }

    /// Acquire the mutex, suspending until every earlier acquirer has released it.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().await
    }

    /// Get the inner value when no other handles exist.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for AsyncMutex<T> {
    fn default() -> Self {
        AsyncMutex::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn verify_fifo_acquisition() {
        let mutex = Arc::new(AsyncMutex::new(Vec::new()));

        let guard = mutex.lock().await;

        let waiters: Vec<_> = (0..4)
            .map(|i| {
                let mutex = mutex.clone();
                tokio::spawn(async move {
                    mutex.lock().await.push(i);
                })
            })
            .collect();

        // Let every waiter enqueue behind the held guard.
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        drop(guard);

        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert_eq!(*mutex.lock().await, vec![0, 1, 2, 3]);
    }
}
