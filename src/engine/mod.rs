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

//! The exporting engine: connector/instance tree and coordinator tick loop
//!
//! One engine per process. The engine owns an ordered list of connectors,
//! each grouping the instances of one backend type; every instance is one
//! configured destination with its own schedule, filters, buffer and
//! transmission worker. Per tick the coordinator advances the clock, marks
//! due instances, fills their buffers, hands the batches to the workers and
//! reports its own counters.

use crate::config::{ConnectorRegistry, DataSource, InstanceSection, MedConfig};
use crate::filters::SimplePattern;
use crate::format::{FormatterHooks, GraphiteFormatter, GraphiteVariant};
use crate::model::{ExportStats, Host};
use crate::pipeline;
use crate::sampling::Storage;
use crate::sinks;
use anyhow::{Context, Result};
use chrono::Utc;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default Graphite plaintext port.
pub const GRAPHITE_DEFAULT_PORT: u16 = 2003;

/// Backend type of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Graphite plaintext line protocol over TCP.
    Graphite,
}

impl BackendType {
    /// Default destination port for the backend.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Graphite => GRAPHITE_DEFAULT_PORT,
        }
    }
}

impl FromStr for BackendType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "graphite" => Ok(Self::Graphite),
            other => Err(anyhow::anyhow!("unknown connector type '{}'", other)),
        }
    }
}

/// Immutable per-instance settings, shared with the transmission worker.
#[derive(Debug)]
pub struct InstanceSettings {
    /// Ordered list of `host[:port]` destinations.
    pub destinations: Vec<String>,

    /// Port used for destinations without an explicit one.
    pub default_port: u16,

    /// Tick period in seconds.
    pub update_every: u64,

    /// Consecutive-failure threshold before a batch is dropped.
    pub buffer_on_failures: u32,

    /// Connect timeout.
    pub timeout: Duration,

    /// Host-inclusion pattern.
    pub hosts_pattern: SimplePattern,

    /// Chart-inclusion pattern.
    pub charts_pattern: SimplePattern,

    /// Prefer human-readable names over internal ids.
    pub send_names: bool,

    /// Aggregation mode.
    pub data_source: DataSource,
}

/// One configured export destination.
pub struct Instance {
    /// Position in engine initialization order.
    pub index: usize,

    /// Full section name, `"type:name"`.
    pub name: String,

    pub settings: Arc<InstanceSettings>,

    /// Formatter strategy selected at instance init.
    pub formatter: Box<dyn FormatterHooks>,

    /// Set by the scheduler, cleared by the formatter pipeline in the same
    /// tick.
    pub scheduled: bool,

    /// Tick the instance was last marked due, 0 before the first run.
    pub last_run: i64,

    /// Tick window start.
    pub after: i64,

    /// Tick window end.
    pub before: i64,

    /// Output buffer; the coordinator is its only writer, the worker receives
    /// filled batches by ownership transfer.
    pub buffer: String,

    pub stats: Arc<ExportStats>,

    /// Capacity-1 channel to the transmission worker; at most one batch in
    /// flight per instance.
    pub sender: Option<mpsc::Sender<String>>,

    /// Worker task handle, joined on shutdown.
    pub worker: Option<JoinHandle<()>>,
}

/// A backend-type grouping of instances.
pub struct Connector {
    pub backend: BackendType,
    pub default_port: u16,
    pub instances: Vec<Instance>,
}

/// Global engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub prefix: String,
    pub hostname: String,
    pub update_every: u64,
    pub data_source: DataSource,
}

/// The top-level exporting engine.
pub struct Engine {
    pub config: EngineConfig,
    pub connectors: Vec<Connector>,
    pub instance_num: usize,

    /// Coordinator clock, unix seconds, advanced once per tick.
    pub now: i64,

    /// Collected-metrics tree, shared with the collection subsystem.
    pub hosts: Arc<RwLock<Vec<Arc<Host>>>>,

    /// Storage engine queried for windowed reads.
    pub storage: Arc<dyn Storage>,
}

/// Unix wall-clock seconds.
pub fn now_realtime_sec() -> i64 {
    Utc::now().timestamp()
}

/// Select the Graphite formatter variant for an instance's aggregation mode.
pub fn init_graphite_instance(data_source: DataSource) -> Result<GraphiteFormatter> {
    let variant = match data_source {
        DataSource::AsCollected => GraphiteVariant::Collected,
        DataSource::Average | DataSource::Sum => GraphiteVariant::Stored,
    };
    Ok(GraphiteFormatter { variant })
}

fn build_instance(
    name: String,
    index: usize,
    backend: BackendType,
    section: &InstanceSection,
    engine_config: &EngineConfig,
) -> Result<Instance> {
    let destinations: Vec<String> = section
        .destination
        .split([' ', ','])
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();
    if destinations.is_empty() {
        anyhow::bail!("no destination configured");
    }

    let data_source = match &section.data_source {
        Some(raw) => DataSource::from_str(raw)
            .with_context(|| format!("instance '{}'", name))?,
        None => engine_config.data_source,
    };

    let settings = Arc::new(InstanceSettings {
        destinations,
        default_port: backend.default_port(),
        update_every: section.update_every.unwrap_or(engine_config.update_every),
        buffer_on_failures: section.buffer_on_failures,
        timeout: Duration::from_millis(section.timeout_ms),
        hosts_pattern: SimplePattern::parse(&section.send_hosts_matching),
        charts_pattern: SimplePattern::parse(&section.send_charts_matching),
        send_names: section.send_names_instead_of_ids,
        data_source,
    });

    let formatter: Box<dyn FormatterHooks> = match backend {
        BackendType::Graphite => Box::new(init_graphite_instance(data_source)?),
    };

    Ok(Instance {
        index,
        name,
        settings,
        formatter,
        scheduled: false,
        last_run: 0,
        after: 0,
        before: 0,
        buffer: String::new(),
        stats: Arc::new(ExportStats::default()),
        sender: None,
        worker: None,
    })
}

/// Build the engine from configuration.
///
/// Consumes the connector registry in FIFO order. A misconfigured instance
/// (unknown connector type, malformed destinations, unknown data source) is
/// logged and skipped; the rest of the engine proceeds.
pub fn read_exporting_config(
    config: &MedConfig,
    hosts: Arc<RwLock<Vec<Arc<Host>>>>,
    storage: Arc<dyn Storage>,
) -> Result<Engine> {
    let data_source = DataSource::from_str(&config.data_source)
        .context("global data source")?;

    let engine_config = EngineConfig {
        prefix: config.prefix.clone(),
        hostname: config.hostname.clone(),
        update_every: config.update_every,
        data_source,
    };

    let mut engine = Engine {
        config: engine_config,
        connectors: Vec::new(),
        instance_num: 0,
        now: 0,
        hosts,
        storage,
    };

    let mut registry = ConnectorRegistry::from_config(config);
    let mut index = 0usize;
    while let Some(pair) = registry.lookup() {
        let name = format!("{}:{}", pair.connector, pair.instance);
        let backend = match BackendType::from_str(&pair.connector) {
            Ok(backend) => backend,
            Err(e) => {
                error!("Skipping exporting instance '{}': {:#}", name, e);
                continue;
            }
        };
        match build_instance(name.clone(), index, backend, &pair.section, &engine.config) {
            Ok(instance) => {
                index += 1;
                engine.connector_for(backend).instances.push(instance);
            }
            Err(e) => {
                error!("Skipping exporting instance '{}': {:#}", name, e);
            }
        }
    }

    Ok(engine)
}

impl Engine {
    /// Find or create the connector for a backend type, keeping registration
    /// order.
    fn connector_for(&mut self, backend: BackendType) -> &mut Connector {
        if let Some(position) = self
            .connectors
            .iter()
            .position(|connector| connector.backend == backend)
        {
            return &mut self.connectors[position];
        }
        self.connectors.push(Connector {
            backend,
            default_port: backend.default_port(),
            instances: Vec::new(),
        });
        self.connectors.last_mut().expect("just pushed")
    }

    /// Iterate all instances across all connectors.
    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        self.connectors
            .iter_mut()
            .flat_map(|connector| connector.instances.iter_mut())
    }

    /// Spawn every instance's transmission worker and stamp the initial tick
    /// window.
    pub fn init_connectors(&mut self) {
        self.now = now_realtime_sec();
        let now = self.now;
        let mut count = 0usize;
        for instance in self.instances_mut() {
            instance.after = now;
            let (sender, worker) = sinks::spawn_worker(sinks::WorkerContext {
                name: instance.name.clone(),
                settings: Arc::clone(&instance.settings),
                stats: Arc::clone(&instance.stats),
            });
            instance.sender = Some(sender);
            instance.worker = Some(worker);
            count += 1;
            info!("Started exporting instance '{}'", instance.name);
        }
        self.instance_num = count;
    }

    /// Hand each filled buffer to its instance's worker.
    ///
    /// The batch moves by ownership transfer through a capacity-1 channel. A
    /// full channel means the worker still owns the previous batch; the lines
    /// stay in the instance buffer and ride along on the next natural tick,
    /// so coordinator and worker never touch one buffer concurrently.
    pub fn notify_workers(&mut self) {
        for instance in self.instances_mut() {
            if instance.buffer.is_empty() {
                continue;
            }
            let Some(sender) = &instance.sender else {
                continue;
            };
            let batch = std::mem::take(&mut instance.buffer);
            let size = batch.len() as u64;
            match sender.try_send(batch) {
                Ok(()) => {
                    ExportStats::add(&instance.stats.buffered_bytes, size);
                }
                Err(mpsc::error::TrySendError::Full(batch)) => {
                    debug!(
                        "Worker of instance '{}' is still busy, deferring batch",
                        instance.name
                    );
                    instance.buffer = batch;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Worker of instance '{}' is gone, dropping batch", instance.name);
                    ExportStats::add(&instance.stats.data_lost_events, 1);
                }
            }
        }
    }

    /// Report the engine's own counters as self-observed metrics.
    pub fn send_internal_metrics(&self) {
        for connector in &self.connectors {
            for instance in &connector.instances {
                let stats = &instance.stats;
                debug!(
                    instance = %instance.name,
                    buffered_metrics = ExportStats::get(&stats.buffered_metrics),
                    buffered_bytes = ExportStats::get(&stats.buffered_bytes),
                    sent_metrics = ExportStats::get(&stats.sent_metrics),
                    sent_bytes = ExportStats::get(&stats.sent_bytes),
                    received_bytes = ExportStats::get(&stats.received_bytes),
                    transmission_successes = ExportStats::get(&stats.transmission_successes),
                    transmission_failures = ExportStats::get(&stats.transmission_failures),
                    receptions = ExportStats::get(&stats.receptions),
                    data_lost_events = ExportStats::get(&stats.data_lost_events),
                    "exporting instance statistics"
                );
            }
        }
    }

    /// Run one coordinator tick against the given clock value.
    pub fn tick(&mut self, now: i64) {
        self.now = now;
        let due = pipeline::mark_scheduled_instances(self);
        if due > 0 {
            let buffered = pipeline::prepare_buffers(self);
            debug!("Buffered {} metrics for {} due instances", buffered, due);
        }
        self.notify_workers();
        self.send_internal_metrics();
    }

    /// The coordinator loop: start workers, then tick until shutdown.
    ///
    /// Recoverable runtime errors never leave this loop; on shutdown the
    /// workers drain any batch already handed to them and exit.
    pub async fn run(mut self, shutdown: Arc<Notify>) {
        self.init_connectors();

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.update_every.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(now_realtime_sec());
                }
                _ = shutdown.notified() => {
                    info!("Exporting engine shutting down");
                    break;
                }
            }
        }

        for instance in self.instances_mut() {
            // closing the channel tells the worker to drain and exit
            instance.sender.take();
            if let Some(worker) = instance.worker.take() {
                if let Err(e) = worker.await {
                    warn!("Exporting worker '{}' panicked: {}", instance.name, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::MemoryStorage;

    fn test_config(json: &str) -> MedConfig {
        MedConfig::from_json(json).unwrap()
    }

    fn build_engine(json: &str) -> Engine {
        read_exporting_config(
            &test_config(json),
            Arc::new(RwLock::new(Vec::new())),
            Arc::new(MemoryStorage::new()),
        )
        .unwrap()
    }

    const BASIC_CONFIG: &str = r#"
    {
        "prefix": "netdata",
        "hostname": "test-host",
        "updateEvery": 3,
        "instances": {
            "graphite:test": {
                "destination": "localhost",
                "updateEvery": 1,
                "dataSource": "as-collected"
            }
        }
    }
    "#;

    #[test]
    fn test_read_exporting_config() {
        let engine = build_engine(BASIC_CONFIG);

        assert_eq!(engine.config.prefix, "netdata");
        assert_eq!(engine.config.hostname, "test-host");
        assert_eq!(engine.config.update_every, 3);
        assert_eq!(engine.instance_num, 0);
        assert_eq!(engine.connectors.len(), 1);

        let connector = &engine.connectors[0];
        assert_eq!(connector.backend, BackendType::Graphite);
        assert_eq!(connector.default_port, 2003);
        assert_eq!(connector.instances.len(), 1);

        let instance = &connector.instances[0];
        assert_eq!(instance.name, "graphite:test");
        assert_eq!(instance.index, 0);
        assert_eq!(instance.settings.destinations, vec!["localhost"]);
        assert_eq!(instance.settings.update_every, 1);
        assert_eq!(instance.settings.buffer_on_failures, 10);
        assert_eq!(instance.settings.timeout, Duration::from_millis(10000));
        assert!(instance.settings.send_names);
        assert_eq!(instance.settings.data_source, DataSource::AsCollected);
        assert!(instance.settings.charts_pattern.matches("any_chart"));
        assert!(instance.settings.hosts_pattern.matches("any_host"));
        assert!(!instance.scheduled);
    }

    #[test]
    fn test_init_graphite_instance_selects_formatter() {
        assert_eq!(
            init_graphite_instance(DataSource::AsCollected).unwrap().variant,
            GraphiteVariant::Collected
        );
        assert_eq!(
            init_graphite_instance(DataSource::Average).unwrap().variant,
            GraphiteVariant::Stored
        );
        assert_eq!(
            init_graphite_instance(DataSource::Sum).unwrap().variant,
            GraphiteVariant::Stored
        );
    }

    #[test]
    fn test_unknown_connector_type_skips_instance() {
        let engine = build_engine(
            r#"
            {
                "hostname": "test-host",
                "instances": {
                    "carbonara:test": {},
                    "graphite:kept": {}
                }
            }
            "#,
        );
        assert_eq!(engine.connectors.len(), 1);
        assert_eq!(engine.connectors[0].instances.len(), 1);
        assert_eq!(engine.connectors[0].instances[0].name, "graphite:kept");
    }

    #[test]
    fn test_unknown_data_source_skips_instance() {
        let engine = build_engine(
            r#"
            {
                "hostname": "test-host",
                "instances": {
                    "graphite:bad": { "dataSource": "bogus" }
                }
            }
            "#,
        );
        // the instance never made it far enough to create its connector
        assert!(engine.connectors.is_empty());
    }

    #[test]
    fn test_empty_destination_skips_instance() {
        let engine = build_engine(
            r#"
            {
                "hostname": "test-host",
                "instances": {
                    "graphite:bad": { "destination": " , " }
                }
            }
            "#,
        );
        assert!(engine.connectors.is_empty());
    }

    #[test]
    fn test_destination_list_parsing() {
        let engine = build_engine(
            r#"
            {
                "hostname": "test-host",
                "instances": {
                    "graphite:multi": { "destination": "primary:2004 fallback,10.0.0.2" }
                }
            }
            "#,
        );
        assert_eq!(
            engine.connectors[0].instances[0].settings.destinations,
            vec!["primary:2004", "fallback", "10.0.0.2"]
        );
    }

    #[tokio::test]
    async fn test_init_connectors_spawns_workers() {
        let mut engine = build_engine(BASIC_CONFIG);
        engine.init_connectors();

        assert_eq!(engine.instance_num, 1);
        let now = engine.now;
        let instance = &mut engine.connectors[0].instances[0];
        assert_eq!(instance.after, now);
        assert!(instance.sender.is_some());
        assert!(instance.worker.is_some());

        instance.sender.take();
        instance.worker.take().unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_notify_workers_defers_when_channel_full() {
        let mut engine = build_engine(BASIC_CONFIG);

        // a channel with no reader: the first batch fills it, the second must
        // stay in the instance buffer
        let (sender, _receiver) = mpsc::channel(1);
        {
            let instance = &mut engine.connectors[0].instances[0];
            instance.sender = Some(sender);
            instance.buffer = "first\n".to_string();
        }
        engine.notify_workers();
        assert!(engine.connectors[0].instances[0].buffer.is_empty());

        engine.connectors[0].instances[0].buffer = "second\n".to_string();
        engine.notify_workers();
        assert_eq!(engine.connectors[0].instances[0].buffer, "second\n");
    }
}
