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

//! Core data model for the exporting engine
//!
//! Defines the collected-metrics tree (hosts, charts, dimensions) that the
//! exporting engine walks, the sticky exportability flags cached on hosts and
//! charts, and the per-instance transmission statistics.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

/// Sticky exportability verdict cached on a host or chart.
///
/// The flag makes a single `Undecided -> decided` transition the first time a
/// filter evaluates the object for export; later ticks reuse the cached
/// verdict without re-running the pattern matcher. Only an external reset
/// (`clear`) returns it to `Undecided`.
#[derive(Debug, Default)]
pub struct ExportFlag(AtomicU8);

const FLAG_UNDECIDED: u8 = 0;
const FLAG_SEND: u8 = 1;
const FLAG_DONT_SEND: u8 = 2;

impl ExportFlag {
    /// Return the cached verdict, if one has been made.
    pub fn get(&self) -> Option<bool> {
        match self.0.load(Ordering::Acquire) {
            FLAG_SEND => Some(true),
            FLAG_DONT_SEND => Some(false),
            _ => None,
        }
    }

    /// Record a verdict if none exists yet and return the winning one.
    ///
    /// The compare-and-set keeps the transition monotonic: a concurrent
    /// decision cannot be silently overwritten, the first writer wins.
    pub fn decide(&self, send: bool) -> bool {
        let wanted = if send { FLAG_SEND } else { FLAG_DONT_SEND };
        match self
            .0
            .compare_exchange(FLAG_UNDECIDED, wanted, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => send,
            Err(current) => current == FLAG_SEND,
        }
    }

    /// External reset back to `Undecided`, used when filter configuration
    /// changes out from under the cache.
    pub fn clear(&self) {
        self.0.store(FLAG_UNDECIDED, Ordering::Release);
    }
}

/// One dimension of a chart: a single exported time-series.
///
/// The last-collected fields are atomics because the collection subsystem
/// updates them concurrently with the exporting coordinator reading them.
#[derive(Debug)]
pub struct Dimension {
    /// Internal id of the dimension.
    pub id: String,

    /// Human-readable name, preferred when "send names instead of ids" is on.
    pub name: String,

    last_collected_value: AtomicI64,
    last_collected_time: AtomicI64,
}

impl Dimension {
    /// Create a dimension with no collected data yet.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            last_collected_value: AtomicI64::new(0),
            last_collected_time: AtomicI64::new(0),
        }
    }

    /// Record a freshly collected raw value (collection side).
    pub fn set_collected(&self, value: i64, time: i64) {
        self.last_collected_value.store(value, Ordering::Release);
        self.last_collected_time.store(time, Ordering::Release);
    }

    /// Last raw collected value.
    pub fn last_collected_value(&self) -> i64 {
        self.last_collected_value.load(Ordering::Acquire)
    }

    /// Collection timestamp of the last raw value, unix seconds.
    pub fn last_collected_time(&self) -> i64 {
        self.last_collected_time.load(Ordering::Acquire)
    }
}

/// A chart: a named group of dimensions collected together.
#[derive(Debug)]
pub struct Chart {
    /// Internal chart id.
    pub id: String,

    /// Human-readable chart name.
    pub name: String,

    /// Sticky exportability verdict for this chart.
    pub export: ExportFlag,

    dimensions: RwLock<Vec<Arc<Dimension>>>,
}

impl Chart {
    /// Create an empty chart.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            export: ExportFlag::default(),
            dimensions: RwLock::new(Vec::new()),
        }
    }

    /// Add a dimension (collection side).
    pub fn add_dimension(&self, dimension: Arc<Dimension>) {
        self.dimensions
            .write()
            .expect("dimension list lock poisoned")
            .push(dimension);
    }

    /// Snapshot of the chart's dimensions.
    pub fn dimensions(&self) -> Vec<Arc<Dimension>> {
        self.dimensions
            .read()
            .expect("dimension list lock poisoned")
            .clone()
    }
}

/// A monitored host carrying a tree of charts.
#[derive(Debug)]
pub struct Host {
    /// Canonical hostname, matched by host-inclusion patterns.
    pub hostname: String,

    /// True for the host the agent itself runs on; the engine substitutes its
    /// configured reporting hostname for it on the wire.
    pub local: bool,

    /// Pre-rendered host tags, e.g. `"TAG1=VALUE1 TAG2=VALUE2"`. Appended to
    /// metric paths verbatim.
    pub tags: Option<String>,

    /// Sticky exportability verdict for this host.
    pub export: ExportFlag,

    charts: RwLock<Vec<Arc<Chart>>>,
}

impl Host {
    /// Create a host with no charts.
    pub fn new(hostname: impl Into<String>, local: bool, tags: Option<String>) -> Self {
        Self {
            hostname: hostname.into(),
            local,
            tags,
            export: ExportFlag::default(),
            charts: RwLock::new(Vec::new()),
        }
    }

    /// Add a chart (collection side).
    pub fn add_chart(&self, chart: Arc<Chart>) {
        self.charts
            .write()
            .expect("chart list lock poisoned")
            .push(chart);
    }

    /// Snapshot of the host's charts.
    pub fn charts(&self) -> Vec<Arc<Chart>> {
        self.charts.read().expect("chart list lock poisoned").clone()
    }
}

/// Per-instance transmission statistics.
///
/// The buffered counters are written by the coordinator while it fills the
/// instance buffer; everything else is written by the instance's transmission
/// worker. Internal-metrics reporting reads all of them.
#[derive(Debug, Default)]
pub struct ExportStats {
    pub buffered_metrics: AtomicU64,
    pub buffered_bytes: AtomicU64,
    pub sent_bytes: AtomicU64,
    pub sent_metrics: AtomicU64,
    pub received_bytes: AtomicU64,
    pub transmission_successes: AtomicU64,
    pub transmission_failures: AtomicU64,
    pub receptions: AtomicU64,
    pub data_lost_events: AtomicU64,
}

impl ExportStats {
    /// Relaxed snapshot of a single counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Relaxed increment of a single counter.
    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_flag_is_sticky() {
        let flag = ExportFlag::default();
        assert_eq!(flag.get(), None);

        assert!(flag.decide(true));
        assert_eq!(flag.get(), Some(true));

        // A later contradictory decision does not overwrite the first one.
        assert!(flag.decide(false));
        assert_eq!(flag.get(), Some(true));

        flag.clear();
        assert_eq!(flag.get(), None);
        assert!(!flag.decide(false));
        assert_eq!(flag.get(), Some(false));
    }

    #[test]
    fn test_dimension_collected_values() {
        let dimension = Dimension::new("dim_id", "dimension_name");
        dimension.set_collected(123000321, 15051);

        assert_eq!(dimension.last_collected_value(), 123000321);
        assert_eq!(dimension.last_collected_time(), 15051);
    }

    #[test]
    fn test_host_chart_tree() {
        let host = Host::new("test-host", true, Some("TAG1=VALUE1".to_string()));
        let chart = Arc::new(Chart::new("chart_id", "chart_name"));
        chart.add_dimension(Arc::new(Dimension::new("dim_id", "dimension_name")));
        host.add_chart(Arc::clone(&chart));

        assert_eq!(host.charts().len(), 1);
        assert_eq!(host.charts()[0].dimensions().len(), 1);
        assert_eq!(host.charts()[0].dimensions()[0].name, "dimension_name");
    }
}
