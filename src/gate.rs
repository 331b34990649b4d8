//! Inference Gate
//!
//! A single process-wide permit guarding the segmentation pipeline. Requests
//! never queue: if the permit is taken the caller is told to come back later.

use crate::error::{Result, SegmentError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct GateMetrics {
    admitted: AtomicU64,
    rejected: AtomicU64,
}

/// Mutual-exclusion gate with non-blocking acquisition.
#[derive(Debug, Clone)]
pub struct InferenceGate {
    semaphore: Arc<Semaphore>,
    metrics: Arc<GateMetrics>,
}

impl Default for InferenceGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceGate {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            metrics: Arc::new(GateMetrics::default()),
        }
    }

    /// Try to take the gate without waiting.
    ///
    /// The returned guard is owned (`'static`) so it can move into the task
    /// that runs the pipeline; the gate is released when that guard drops.
    pub fn try_acquire(&self) -> Result<GateGuard> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.metrics.admitted.fetch_add(1, Ordering::Relaxed);
                crate::metrics::SEGMENT_IN_FLIGHT.inc();
                Ok(GateGuard { _permit: permit })
            }
            Err(_) => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                crate::metrics::SEGMENT_BUSY_REJECTIONS.inc();
                Err(SegmentError::Busy)
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    pub fn get_stats(&self) -> GateStats {
        GateStats {
            busy: self.is_busy(),
            admitted: self.metrics.admitted.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard that releases the gate on drop
pub struct GateGuard {
    _permit: OwnedSemaphorePermit,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        crate::metrics::SEGMENT_IN_FLIGHT.dec();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub busy: bool,
    pub admitted: u64,
    pub rejected: u64,
}
