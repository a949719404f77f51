use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregate::Window;
use crate::error::{AnalysisError, Result};
use crate::reading::{MonthKey, TimeKey};

/// Months 1-12 packed into the low bits of a `u16`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthSet(u16);

impl MonthSet {
    pub fn from_months(months: &[u8]) -> Result<Self> {
        let mut set = Self::default();
        for &month in months {
            if !(1..=12).contains(&month) {
                return Err(AnalysisError::Config(format!("month {month} is outside 1-12")));
            }
            set.insert(month);
        }
        Ok(set)
    }

    pub fn insert(&mut self, month: u8) {
        self.0 |= 1 << month;
    }

    pub fn contains(&self, month: u8) -> bool {
        month <= 12 && self.0 & (1 << month) != 0
    }

    pub fn union(&self, other: &MonthSet) -> MonthSet {
        MonthSet(self.0 | other.0)
    }

    pub fn intersects(&self, other: &MonthSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=12).filter(|&month| self.contains(month))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Heating,
    Cooling,
}

impl Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Classification::Heating => write!(f, "Heating"),
            Classification::Cooling => write!(f, "Cooling"),
        }
    }
}

impl Classification {
    /// Heating months flag cold hours, cooling months flag hot ones.
    pub fn flags(&self, hourly_mean: f64, stats: &MonthlyStatistics) -> bool {
        match self {
            Classification::Heating => hourly_mean < stats.mean - stats.std_dev,
            Classification::Cooling => hourly_mean > stats.mean + stats.std_dev,
        }
    }
}

/// Which months are audited, and in which direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonConfig {
    heating: MonthSet,
    cooling: MonthSet,
}

impl Default for SeasonConfig {
    fn default() -> Self {
        Self {
            heating: MonthSet(1 << 12 | 1 << 1 | 1 << 2 | 1 << 3),
            cooling: MonthSet(1 << 7 | 1 << 8 | 1 << 9),
        }
    }
}

impl SeasonConfig {
    pub fn new(heating: &[u8], cooling: &[u8]) -> Result<Self> {
        let heating = MonthSet::from_months(heating)?;
        let cooling = MonthSet::from_months(cooling)?;
        if heating.intersects(&cooling) {
            return Err(AnalysisError::Config("a month cannot be both heating and cooling".to_string()));
        }
        Ok(Self { heating, cooling })
    }

    pub fn heating(&self) -> MonthSet {
        self.heating
    }

    pub fn cooling(&self) -> MonthSet {
        self.cooling
    }

    pub fn configured(&self) -> MonthSet {
        self.heating.union(&self.cooling)
    }

    pub fn classify(&self, month: u8) -> Option<Classification> {
        if self.heating.contains(month) {
            Some(Classification::Heating)
        } else if self.cooling.contains(month) {
            Some(Classification::Cooling)
        } else {
            None
        }
    }
}

/// Population statistics over the hourly means of one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MonthlyStatistics {
    pub mean: f64,
    pub std_dev: f64,
    pub sample_count: usize,
}

impl MonthlyStatistics {
    pub fn from_means(means: &[f64]) -> Self {
        if means.is_empty() {
            return Self::default();
        }
        let n = means.len() as f64;
        let mean = means.iter().sum::<f64>() / n;
        let variance = means.iter().map(|m| (m - mean) * (m - mean)).sum::<f64>() / n;
        Self { mean, std_dev: variance.sqrt(), sample_count: means.len() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub time_key: TimeKey,
    /// Mean of the flagged hour.
    pub temperature: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub classification: Classification,
}

/// Outcome of evaluating one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowReport {
    pub key: MonthKey,
    pub stats: MonthlyStatistics,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, Copy)]
pub struct WindowEvaluator {
    season: SeasonConfig,
}

impl WindowEvaluator {
    pub fn new(season: SeasonConfig) -> Self {
        Self { season }
    }

    pub fn evaluate(&self, window: &Window) -> WindowReport {
        let hourly: Vec<(TimeKey, f64)> = window
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.count > 0)
            .map(|(key, bucket)| (*key, bucket.mean()))
            .collect();
        let means: Vec<f64> = hourly.iter().map(|(_, mean)| *mean).collect();
        let stats = MonthlyStatistics::from_means(&means);

        let issues = match self.season.classify(window.key.month) {
            Some(classification) => hourly
                .iter()
                .filter(|(_, mean)| classification.flags(*mean, &stats))
                .map(|&(time_key, temperature)| Issue {
                    time_key,
                    temperature,
                    mean: stats.mean,
                    std_dev: stats.std_dev,
                    classification,
                })
                .collect(),
            None => Vec::new(),
        };

        info!(
            month = %window.key,
            mean = stats.mean,
            stddev = stats.std_dev,
            hours = stats.sample_count,
            issues = issues.len(),
            "window evaluated"
        );
        WindowReport { key: window.key, stats, issues }
    }
}
