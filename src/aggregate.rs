use std::collections::BTreeMap;
use std::hash::BuildHasher;
use std::sync::{Mutex, PoisonError};

use crossbeam::utils::CachePadded;
use hashbrown::hash_map::{DefaultHashBuilder, Entry};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::reading::{MonthKey, Reading, TimeKey};

pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 2.0;

const SHARD_COUNT: usize = 64;
// A month has at most 31 * 24 hourly buckets
const MAX_BUCKETS_PER_WINDOW: usize = 744;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

/// Fixed-threshold spike detector. The threshold is in whatever unit the log carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyFilter {
    pub threshold: f64,
}

impl Default for AnomalyFilter {
    fn default() -> Self {
        Self { threshold: DEFAULT_ANOMALY_THRESHOLD }
    }
}

impl AnomalyFilter {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn is_anomaly(&self, current: f64, reference: f64) -> bool {
        (current - reference).abs() > self.threshold
    }
}

/// Running state of one hourly bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourlyAccumulator {
    pub sum: f64,
    pub count: u32,
    pub last_accepted: f64,
}

impl HourlyAccumulator {
    /// The first reading of a bucket has nothing to be judged against.
    pub fn first(temperature: f64) -> Self {
        Self { sum: temperature, count: 1, last_accepted: temperature }
    }

    /// Admits `temperature` unless it strays from the last admitted reading by more than the threshold.
    pub fn offer(&mut self, temperature: f64, filter: &AnomalyFilter) -> Admission {
        if filter.is_anomaly(temperature, self.last_accepted) {
            return Admission::Rejected;
        }
        self.sum += temperature;
        self.count += 1;
        self.last_accepted = temperature;
        Admission::Admitted
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }
}

fn admit_into(
    buckets: &mut HashMap<TimeKey, HourlyAccumulator>,
    reading: &Reading,
    filter: &AnomalyFilter,
) -> Admission {
    match buckets.entry(reading.time_key()) {
        Entry::Occupied(mut entry) => entry.get_mut().offer(reading.temperature, filter),
        Entry::Vacant(entry) => {
            entry.insert(HourlyAccumulator::first(reading.temperature));
            Admission::Admitted
        }
    }
}

/// Every bucket of one reporting window, ordered by `TimeKey`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub key: MonthKey,
    pub buckets: Vec<(TimeKey, HourlyAccumulator)>,
}

impl Window {
    fn from_unordered(key: MonthKey, mut buckets: Vec<(TimeKey, HourlyAccumulator)>) -> Self {
        buckets.sort_unstable_by_key(|(time_key, _)| *time_key);
        Self { key, buckets }
    }
}

type Shard = CachePadded<Mutex<HashMap<TimeKey, HourlyAccumulator>>>;

/// Bucket map shared by all scan workers.
///
/// Keys are spread over lock-guarded shards; an admission holds exactly one shard lock for the
/// whole lookup-compare-update, so two readings for the same key never interleave.
pub struct BucketAggregator {
    filter: AnomalyFilter,
    hasher: DefaultHashBuilder,
    shards: Box<[Shard]>,
}

impl BucketAggregator {
    pub fn new(filter: AnomalyFilter) -> Self {
        Self {
            filter,
            hasher: DefaultHashBuilder::default(),
            shards: (0..SHARD_COUNT).map(|_| CachePadded::new(Mutex::new(HashMap::new()))).collect(),
        }
    }

    fn shard(&self, key: &TimeKey) -> &Mutex<HashMap<TimeKey, HourlyAccumulator>> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    pub fn admit(&self, reading: &Reading) -> Admission {
        let mut buckets = self
            .shard(&reading.time_key())
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        admit_into(&mut buckets, reading, &self.filter)
    }

    pub fn get(&self, key: &TimeKey) -> Option<HourlyAccumulator> {
        let buckets = self.shard(key).lock().unwrap_or_else(PoisonError::into_inner);
        buckets.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes the map and groups its buckets into windows, oldest month first.
    pub fn into_windows(self) -> Vec<Window> {
        let mut months = BTreeMap::<MonthKey, Vec<(TimeKey, HourlyAccumulator)>>::new();
        for shard in self.shards.into_vec() {
            let buckets = CachePadded::into_inner(shard).into_inner().unwrap_or_else(PoisonError::into_inner);
            for (key, accumulator) in buckets {
                months.entry(key.month_key()).or_default().push((key, accumulator));
            }
        }
        months
            .into_iter()
            .map(|(key, buckets)| Window::from_unordered(key, buckets))
            .collect()
    }
}

/// Single-owner aggregation for ordered streams.
///
/// Holds the buckets of the month currently being read and hands back the completed window as
/// soon as a reading from a different month shows up.
pub struct WindowAccumulator {
    filter: AnomalyFilter,
    open: Option<MonthKey>,
    buckets: HashMap<TimeKey, HourlyAccumulator>,
}

impl WindowAccumulator {
    pub fn new(filter: AnomalyFilter) -> Self {
        Self {
            filter,
            open: None,
            buckets: HashMap::with_capacity(MAX_BUCKETS_PER_WINDOW),
        }
    }

    pub fn open_month(&self) -> Option<MonthKey> {
        self.open
    }

    pub fn push(&mut self, reading: &Reading) -> (Admission, Option<Window>) {
        let month = reading.month_key();
        let closed = match self.open {
            Some(open) if open != month => self.take_window(),
            _ => None,
        };
        self.open = Some(month);
        (admit_into(&mut self.buckets, reading, &self.filter), closed)
    }

    /// Flushes whatever month is still open at end of stream.
    pub fn finish(&mut self) -> Option<Window> {
        let window = self.take_window();
        self.open = None;
        window
    }

    fn take_window(&mut self) -> Option<Window> {
        let key = self.open?;
        if self.buckets.is_empty() {
            return None;
        }
        let buckets = self.buckets.drain().collect();
        Some(Window::from_unordered(key, buckets))
    }
}
