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

//! Configuration parsing for the exporting engine
//!
//! One global section plus one section per connector/instance pair, keyed
//! `"type:name"` (e.g. `"graphite:primary"`). The registry walks the parsed
//! sections and hands out (connector, instance) pairs in FIFO order during
//! engine construction; it is an explicit object with no process-wide state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::str::FromStr;
use tracing::error;

/// Aggregation mode applied when exporting values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// Export the last raw collected value, no windowed read.
    AsCollected,
    /// Arithmetic mean of the stored samples in the tick window.
    Average,
    /// Arithmetic sum of the stored samples in the tick window.
    Sum,
}

impl FromStr for DataSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "as-collected" | "as collected" | "raw" => Ok(Self::AsCollected),
            "average" => Ok(Self::Average),
            "sum" | "volume" => Ok(Self::Sum),
            other => Err(anyhow::anyhow!("unknown data source '{}'", other)),
        }
    }
}

/// Top-level exporting configuration: the global section plus all
/// connector/instance sections.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MedConfig {
    /// Metric path prefix prepended to every exported metric.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Hostname reported for the local host on the wire.
    pub hostname: String,

    /// Default tick period in seconds for instances that do not override it.
    #[serde(default = "default_update_every")]
    pub update_every: u64,

    /// Default aggregation mode: `as-collected`, `average` or `sum`.
    #[serde(default = "default_data_source")]
    pub data_source: String,

    /// Connector/instance sections, keyed `"type:name"`. A BTreeMap keeps the
    /// registration order deterministic.
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceSection>,
}

/// One connector/instance section.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSection {
    /// Ordered list of `host[:port]` targets, space or comma separated.
    #[serde(default = "default_destination")]
    pub destination: String,

    /// Instance tick period in seconds; engine default when absent.
    pub update_every: Option<u64>,

    /// Consecutive-failure threshold before a buffered batch is dropped.
    #[serde(default = "default_buffer_on_failures")]
    pub buffer_on_failures: u32,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Chart-inclusion pattern.
    #[serde(default = "default_pattern")]
    pub send_charts_matching: String,

    /// Host-inclusion pattern.
    #[serde(default = "default_pattern")]
    pub send_hosts_matching: String,

    /// Prefer human-readable names over internal ids in metric paths.
    #[serde(default = "default_send_names")]
    pub send_names_instead_of_ids: bool,

    /// Aggregation mode override; engine default when absent.
    pub data_source: Option<String>,
}

impl Default for InstanceSection {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            update_every: None,
            buffer_on_failures: default_buffer_on_failures(),
            timeout_ms: default_timeout_ms(),
            send_charts_matching: default_pattern(),
            send_hosts_matching: default_pattern(),
            send_names_instead_of_ids: default_send_names(),
            data_source: None,
        }
    }
}

impl MedConfig {
    /// Load configuration from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&contents)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse exporting configuration")
    }
}

// Default value functions
fn default_prefix() -> String {
    "netdata".to_string()
}

fn default_update_every() -> u64 {
    10
}

fn default_data_source() -> String {
    "average".to_string()
}

fn default_destination() -> String {
    "localhost".to_string()
}

fn default_buffer_on_failures() -> u32 {
    10
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_pattern() -> String {
    "*".to_string()
}

fn default_send_names() -> bool {
    true
}

/// A (connector, instance) pair discovered in the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorInstance {
    /// Connector type name, e.g. `"graphite"`.
    pub connector: String,

    /// Instance name within the connector, e.g. `"primary"`.
    pub instance: String,

    /// The section the pair was registered from.
    pub section: InstanceSection,
}

/// FIFO registry of configured (connector, instance) pairs.
///
/// Populated while the config sections are walked, consumed once during
/// engine construction, single-threaded throughout.
#[derive(Debug, Default)]
pub struct ConnectorRegistry {
    pairs: VecDeque<ConnectorInstance>,
}

impl ConnectorRegistry {
    /// Build a registry from all `"type:name"` sections of a configuration.
    ///
    /// A section key without a `:` separator is a construction-time error for
    /// that instance only; it is logged and skipped, the rest proceed.
    pub fn from_config(config: &MedConfig) -> Self {
        let mut registry = Self::default();
        for (key, section) in &config.instances {
            match key.split_once(':') {
                Some((connector, instance)) if !connector.is_empty() && !instance.is_empty() => {
                    registry.register(connector, instance, section.clone());
                }
                _ => {
                    error!("Invalid instance section key '{}', expected 'type:name'", key);
                }
            }
        }
        registry
    }

    /// Append a (connector, instance) registration.
    pub fn register(&mut self, connector: &str, instance: &str, section: InstanceSection) {
        self.pairs.push_back(ConnectorInstance {
            connector: connector.to_string(),
            instance: instance.to_string(),
            section,
        });
    }

    /// Consume the next unconsumed registration, FIFO order.
    pub fn lookup(&mut self) -> Option<ConnectorInstance> {
        self.pairs.pop_front()
    }

    /// Release all registrations.
    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// Number of unconsumed registrations.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True when no registrations remain.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
