// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Task execution seam.
//!
//! Sync jobs run off the caller's thread so that `tick()` returns
//! immediately. The trait exists so tests can run jobs inline or on a
//! current-thread runtime without reaching for a multi-thread scheduler.

use futures::future::BoxFuture;

pub type BoxedJob = BoxFuture<'static, ()>;

/// Runs one job to completion in the background.
pub trait TaskExecutor: Send + Sync + 'static {
    fn submit(&self, job: BoxedJob);
}

/// Spawns onto the ambient tokio runtime.
#[derive(Clone, Default)]
pub struct TokioExecutor;

impl TaskExecutor for TokioExecutor {
    fn submit(&self, job: BoxedJob) {
        tokio::spawn(job);
    }
}
