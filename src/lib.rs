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

//! # Metrics Exporting Daemon (MED)
//!
//! A metrics-exporting service that periodically samples locally-collected
//! time-series (hosts -> charts -> dimensions) and pushes them to one or more
//! external time-series backends over TCP.
//!
//! ## Features
//!
//! - **Connector/instance model**: any number of configured destinations,
//!   each with its own schedule, filters, buffer and transmission worker
//! - **Filtering**: host and chart inclusion patterns with sticky verdict
//!   caching
//! - **Aggregation modes**: as-collected raw values, or windowed average/sum
//!   over stored history
//! - **Bounded retry**: failed batches are kept until a configurable
//!   consecutive-failure threshold, then dropped
//!
//! ## Example
//!
//! ```rust,no_run
//! use med::{config::MedConfig, Med};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MedConfig::from_file("exporting.json")?;
//!     let med = Med::new(config).await?;
//!     med.start().await?;
//!     med.wait_for_shutdown().await?;
//!     Ok(())
//! }
//! ```

use anyhow::Result;
use std::sync::{Arc, RwLock};
use tokio::signal;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod config;
pub mod engine;
pub mod filters;
pub mod format;
pub mod model;
pub mod pipeline;
pub mod sampling;
pub mod sinks;

use config::MedConfig;
use model::Host;
use sampling::{MemoryStorage, Storage};

/// Main MED application instance
pub struct Med {
    config: MedConfig,
    hosts: Arc<RwLock<Vec<Arc<Host>>>>,
    storage: Arc<dyn Storage>,
    shutdown_notify: Arc<Notify>,
    stop_notify: Arc<Notify>,
    engine_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Med {
    /// Create a new MED instance with the given configuration.
    pub async fn new(config: MedConfig) -> Result<Self> {
        Ok(Self {
            config,
            hosts: Arc::new(RwLock::new(Vec::new())),
            storage: Arc::new(MemoryStorage::new()),
            shutdown_notify: Arc::new(Notify::new()),
            stop_notify: Arc::new(Notify::new()),
            engine_task: std::sync::Mutex::new(None),
        })
    }

    /// The collected-metrics tree, shared with the collection side.
    pub fn hosts(&self) -> Arc<RwLock<Vec<Arc<Host>>>> {
        Arc::clone(&self.hosts)
    }

    /// The storage engine backing windowed reads.
    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// Build the exporting engine from configuration and start its
    /// coordinator loop and workers.
    pub async fn start(&self) -> Result<()> {
        info!("Starting MED services");

        let engine = engine::read_exporting_config(
            &self.config,
            Arc::clone(&self.hosts),
            Arc::clone(&self.storage),
        )?;
        let stop = Arc::clone(&self.stop_notify);
        let task = tokio::spawn(engine.run(stop));
        *self.engine_task.lock().expect("engine task lock poisoned") = Some(task);

        self.setup_signal_handlers().await;

        info!("All services started successfully");
        Ok(())
    }

    /// Wait for the shutdown signal, then stop the engine and its workers.
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        self.shutdown_notify.notified().await;
        info!("Shutdown signal received, stopping services...");

        self.stop_notify.notify_one();
        let task = self
            .engine_task
            .lock()
            .expect("engine task lock poisoned")
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Exporting engine task failed: {}", e);
            }
        }

        Ok(())
    }

    async fn setup_signal_handlers(&self) {
        let shutdown_notify = Arc::clone(&self.shutdown_notify);

        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown_notify.notify_one();
                }
                Err(err) => {
                    warn!("Failed to listen for SIGINT: {}", err);
                }
            }
        });

        #[cfg(unix)]
        {
            let shutdown_notify = Arc::clone(&self.shutdown_notify);
            tokio::spawn(async move {
                let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler");

                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown");
                shutdown_notify.notify_one();
            });
        }
    }
}
