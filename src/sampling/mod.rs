/*
 * Copyright 2025 MED Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Windowed value aggregation over stored history
//!
//! The storage engine is an external collaborator, reached through the
//! [`Storage`] trait. The sampler clamps an instance's tick window to the
//! range actually stored for a dimension, walks a forward cursor over it and
//! reduces the existing samples to one value per the configured aggregation
//! mode. Cursors release their storage handle on drop, on every exit path.

use crate::config::DataSource;
use ahash::{HashMap, HashMapExt};
use std::sync::RwLock;

/// One stored sample. Storage may mark gaps; gap samples do not exist and are
/// not aggregated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredSample {
    /// Unix timestamp of the sample, seconds.
    pub time: i64,

    /// Stored value.
    pub value: f64,

    /// False for a gap slot.
    pub exists: bool,
}

/// Forward cursor over a dimension's stored samples in a closed time window.
///
/// Implementations release any storage-engine handle in their `Drop`, so the
/// resource is reclaimed even when the window holds zero samples.
pub trait StorageCursor {
    /// Next sample in time order, `None` when the window is exhausted.
    fn next_sample(&mut self) -> Option<StoredSample>;
}

/// Boundary to the time-series storage engine.
pub trait Storage: Send + Sync {
    /// Timestamp of the oldest stored sample for a dimension, 0 when empty.
    fn oldest_time(&self, dimension_id: &str) -> i64;

    /// Timestamp of the latest stored sample for a dimension, 0 when empty.
    fn latest_time(&self, dimension_id: &str) -> i64;

    /// Open a forward cursor over `[after, before]`, both ends inclusive.
    fn query(&self, dimension_id: &str, after: i64, before: i64) -> Box<dyn StorageCursor + '_>;
}

/// In-memory storage used by the agent's own counters and by tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    series: RwLock<HashMap<String, Vec<StoredSample>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Append a sample for a dimension. Samples are expected in time order.
    pub fn add_sample(&self, dimension_id: &str, sample: StoredSample) {
        self.series
            .write()
            .expect("storage lock poisoned")
            .entry(dimension_id.to_string())
            .or_default()
            .push(sample);
    }
}

struct MemoryCursor {
    samples: std::vec::IntoIter<StoredSample>,
}

impl StorageCursor for MemoryCursor {
    fn next_sample(&mut self) -> Option<StoredSample> {
        self.samples.next()
    }
}

impl Storage for MemoryStorage {
    fn oldest_time(&self, dimension_id: &str) -> i64 {
        self.series
            .read()
            .expect("storage lock poisoned")
            .get(dimension_id)
            .and_then(|samples| samples.first())
            .map_or(0, |sample| sample.time)
    }

    fn latest_time(&self, dimension_id: &str) -> i64 {
        self.series
            .read()
            .expect("storage lock poisoned")
            .get(dimension_id)
            .and_then(|samples| samples.last())
            .map_or(0, |sample| sample.time)
    }

    fn query(&self, dimension_id: &str, after: i64, before: i64) -> Box<dyn StorageCursor + '_> {
        let samples: Vec<StoredSample> = self
            .series
            .read()
            .expect("storage lock poisoned")
            .get(dimension_id)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|sample| sample.time >= after && sample.time <= before)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        Box::new(MemoryCursor {
            samples: samples.into_iter(),
        })
    }
}

/// Reduce the stored samples of `[after, before]` to one value.
///
/// The window is clamped to the dimension's stored range; a window that lies
/// entirely outside it falls back to the full stored range. Returns the
/// aggregated value and the timestamp of the last sample consumed, or `None`
/// when the clamped window holds no existing samples ("no data", the metric
/// is skipped for this cycle).
pub fn calculate_value_from_stored_data(
    storage: &dyn Storage,
    dimension_id: &str,
    after: i64,
    before: i64,
    data_source: DataSource,
) -> Option<(f64, i64)> {
    if data_source == DataSource::AsCollected {
        // as-collected uses the raw last-collected value, never a windowed read
        return None;
    }

    let first_t = storage.oldest_time(dimension_id);
    let last_t = storage.latest_time(dimension_id);

    let mut after = after.max(first_t);
    let before = before.min(last_t);
    if after > before {
        after = first_t;
    }

    let mut cursor = storage.query(dimension_id, after, before);
    let mut sum = 0.0;
    let mut count: u64 = 0;
    let mut last_timestamp = 0;

    while let Some(sample) = cursor.next_sample() {
        if !sample.exists {
            continue;
        }
        sum += sample.value;
        count += 1;
        last_timestamp = sample.time;
    }
    drop(cursor);

    if count == 0 {
        return None;
    }

    let value = match data_source {
        DataSource::Average => sum / count as f64,
        DataSource::Sum => sum,
        DataSource::AsCollected => unreachable!(),
    };
    Some((value, last_timestamp))
}
