//! Memory-pressure policy.
//!
//! The daemon samples host free memory on a fixed period, smooths the
//! samples with an exponential moving average and compares the average with
//! two thresholds. Each threshold has its own consecutive-hit counter: a low
//! average must persist for `evict_hit_threshold` samples before chunks are
//! reclaimed, and a high average for `expand_hit_threshold` samples before
//! more chunks are offered.
//!
//! This module only decides. Acting on a [`Decision`] (sending EVICT,
//! growing the pool) is the daemon's job.

use crate::config::MonitorConfig;
use crate::units::bytes_to_gb;

/// Exponential moving average of host free memory, in GB.
///
/// `avg = weight * avg + (1 - weight) * sample`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreeMemoryAverage {
    weight: f64,
    value: Option<f64>,
}

impl FreeMemoryAverage {
    /// Average seeded by its first sample.
    #[must_use]
    pub const fn new(weight: f64) -> Self {
        Self {
            weight,
            value: None,
        }
    }

    /// Average starting from a known value.
    #[must_use]
    pub const fn with_initial(weight: f64, initial_gb: f64) -> Self {
        Self {
            weight,
            value: Some(initial_gb),
        }
    }

    /// Fold in one sample and return the new average.
    pub fn update(&mut self, sample_gb: f64) -> f64 {
        let next = match self.value {
            Some(avg) => self.weight * avg + (1.0 - self.weight) * sample_gb,
            None => sample_gb,
        };
        self.value = Some(next);
        next
    }

    /// Current average, if any sample has been seen.
    #[must_use]
    pub const fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Outcome of one monitor cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do.
    Hold,
    /// Reclaim this many chunks.
    Evict {
        /// Chunks to reclaim.
        chunks: usize,
    },
    /// Offer this many more chunks.
    Expand {
        /// Chunks to add to capacity.
        chunks: usize,
    },
}

/// Evict/expand hysteresis over smoothed free memory.
#[derive(Debug, Clone)]
pub struct PressurePolicy {
    average: FreeMemoryAverage,
    evict_threshold_gb: f64,
    expand_threshold_gb: f64,
    evict_hit_threshold: u32,
    expand_hit_threshold: u32,
    expand_step: usize,
    chunk_gb: f64,
    evict_hits: u32,
    expand_hits: u32,
}

impl PressurePolicy {
    /// Build a policy for chunks of `chunk_size` bytes.
    #[must_use]
    pub fn new(config: &MonitorConfig, chunk_size: u64) -> Self {
        Self {
            average: FreeMemoryAverage::new(config.free_mem_weight),
            evict_threshold_gb: config.evict_threshold_gb as f64,
            expand_threshold_gb: config.expand_threshold_gb as f64,
            evict_hit_threshold: config.evict_hit_threshold.max(1),
            expand_hit_threshold: config.expand_hit_threshold.max(1),
            expand_step: config.expand_step,
            chunk_gb: bytes_to_gb(chunk_size),
            evict_hits: 0,
            expand_hits: 0,
        }
    }

    /// Replace the average, e.g. to seed it with a known starting value.
    #[must_use]
    pub const fn with_average(mut self, average: FreeMemoryAverage) -> Self {
        self.average = average;
        self
    }

    /// Feed one free-memory sample (bytes) and decide.
    pub fn observe(&mut self, free_bytes: u64) -> Decision {
        let avg = self.average.update(bytes_to_gb(free_bytes));

        if avg < self.evict_threshold_gb {
            self.expand_hits = 0;
            self.evict_hits += 1;
            if self.evict_hits >= self.evict_hit_threshold {
                self.evict_hits = 0;
                return Decision::Evict {
                    chunks: self.eviction_size(avg),
                };
            }
        } else if avg > self.expand_threshold_gb {
            self.evict_hits = 0;
            self.expand_hits += 1;
            if self.expand_hits >= self.expand_hit_threshold {
                self.expand_hits = 0;
                return Decision::Expand {
                    chunks: self.expand_step,
                };
            }
        } else {
            self.evict_hits = 0;
            self.expand_hits = 0;
        }
        Decision::Hold
    }

    /// Chunks needed to lift `avg` back above the evict threshold.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn eviction_size(&self, avg: f64) -> usize {
        let deficit = (self.evict_threshold_gb - avg).max(0.0);
        (deficit / self.chunk_gb).floor() as usize + 1
    }

    /// Smoothed free memory in GB.
    #[must_use]
    pub const fn average_gb(&self) -> Option<f64> {
        self.average.value()
    }

    /// Current (evict, expand) consecutive-hit counters.
    #[must_use]
    pub const fn hits(&self) -> (u32, u32) {
        (self.evict_hits, self.expand_hits)
    }
}
