//! Run configuration.
//!
//! Built once by the caller and handed by value to whichever coordinator or stage needs it.

use serde::{Deserialize, Serialize};

use crate::aggregate::{AnomalyFilter, DEFAULT_ANOMALY_THRESHOLD};
use crate::error::{AnalysisError, Result};
use crate::window::SeasonConfig;

/// Months audited for heating faults when none are given.
pub const DEFAULT_HEATING_MONTHS: [u8; 4] = [12, 1, 2, 3];

/// Months audited for cooling faults when none are given.
pub const DEFAULT_COOLING_MONTHS: [u8; 3] = [7, 8, 9];

/// Capacity of each bounded queue between pipeline stages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Records per message between stage processes.
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub season: SeasonConfig,
    pub threshold: f64,
    /// Parallelism of the partitioned scan.
    pub workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            season: SeasonConfig::default(),
            threshold: DEFAULT_ANOMALY_THRESHOLD,
            workers: num_cpus::get(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl AnalysisConfig {
    pub fn new(heating: &[u8], cooling: &[u8], threshold: f64) -> Result<Self> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(AnalysisError::Config(format!("anomaly threshold {threshold} must be a non-negative number")));
        }
        Ok(Self {
            season: SeasonConfig::new(heating, cooling)?,
            threshold,
            ..Self::default()
        })
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn filter(&self) -> AnomalyFilter {
        AnomalyFilter::new(self.threshold)
    }
}
