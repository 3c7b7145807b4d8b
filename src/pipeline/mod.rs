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

//! Scheduler and formatter pipeline
//!
//! Both run on the coordinator, synchronously and sequentially across all
//! instances each tick: the scheduler decides which instances are due, the
//! pipeline walks the filtered host -> chart -> dimension tree for each due
//! instance and fills its buffer through the instance's formatter strategy.

use crate::engine::{Engine, Instance};
use crate::filters;
use crate::format::FormatContext;
use crate::model::ExportStats;

/// Mark every instance whose tick period has elapsed.
///
/// An instance is due iff `now - last_run >= update_every`, ties resolving to
/// due. A due instance gets `before = now` and `scheduled = true`; anything
/// not due is left untouched. Returns the number of due instances.
pub fn mark_scheduled_instances(engine: &mut Engine) -> usize {
    let now = engine.now;
    let mut due = 0usize;
    for instance in engine.instances_mut() {
        if now - instance.last_run >= instance.settings.update_every as i64 {
            instance.last_run = now;
            instance.before = now;
            instance.scheduled = true;
            due += 1;
        }
    }
    due
}

/// Fill the buffer of every scheduled instance.
///
/// Walks the host tree once per due instance, applying the host and chart
/// filters, and drives the instance's seven-stage formatter strategy. Always
/// clears `scheduled` and advances the window start to the window end, even
/// when every hook is a no-op and nothing is buffered. Returns the number of
/// metrics buffered across all due instances.
pub fn prepare_buffers(engine: &mut Engine) -> usize {
    let hosts = engine
        .hosts
        .read()
        .expect("host list lock poisoned")
        .clone();
    let storage = std::sync::Arc::clone(&engine.storage);

    let Engine {
        ref config,
        ref mut connectors,
        ..
    } = *engine;

    let mut total = 0usize;
    for connector in connectors.iter_mut() {
        for instance in connector.instances.iter_mut() {
            if !instance.scheduled {
                continue;
            }

            let Instance {
                ref name,
                ref settings,
                ref formatter,
                ref mut buffer,
                ref stats,
                ref mut scheduled,
                ref mut after,
                ref before,
                ..
            } = *instance;

            let ctx = FormatContext {
                prefix: &config.prefix,
                hostname: &config.hostname,
                send_names: settings.send_names,
                data_source: settings.data_source,
                after: *after,
                before: *before,
                storage: storage.as_ref(),
            };

            formatter.start_batch(&ctx, buffer);
            for host in &hosts {
                let host = host.as_ref();
                if !filters::host_is_exportable(&settings.hosts_pattern, name, host) {
                    continue;
                }
                formatter.start_host(&ctx, host, buffer);
                for chart in host.charts() {
                    let chart = chart.as_ref();
                    if !filters::chart_is_exportable(&settings.charts_pattern, chart) {
                        continue;
                    }
                    formatter.start_chart(&ctx, host, chart, buffer);
                    for dimension in chart.dimensions() {
                        if formatter.metric(&ctx, host, chart, dimension.as_ref(), buffer) {
                            ExportStats::add(&stats.buffered_metrics, 1);
                            total += 1;
                        }
                    }
                    formatter.end_chart(&ctx, host, chart, buffer);
                }
                formatter.end_host(&ctx, host, buffer);
            }
            formatter.end_batch(&ctx, buffer);

            *scheduled = false;
            *after = *before;
        }
    }
    total
}
