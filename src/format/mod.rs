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

//! Name sanitizing and wire formatting
//!
//! The formatter strategy is a trait with default no-op hooks for the seven
//! stages of the pipeline (batch/host/chart begin and end plus the per-metric
//! stage); a backend only overrides what its wire format needs. The reference
//! backend is the Graphite plaintext line protocol:
//!
//! `<prefix>.<host>.<chart>.<dimension>[;tags] <value> <unix_timestamp>\n`

use crate::config::DataSource;
use crate::model::{Chart, Dimension, Host};
use crate::sampling::{self, Storage};
use std::fmt::Write;

/// Maximum length of a sanitized name component.
pub const MAX_NAME_LENGTH: usize = 200;

/// Copy `source` into `destination`, replacing every character outside
/// `[A-Za-z0-9._-]` with `_` and truncating at `max_len` characters.
/// `destination` is cleared first; returns the number of characters written.
pub fn sanitize_name(destination: &mut String, source: &str, max_len: usize) -> usize {
    destination.clear();
    for c in source.chars().take(max_len) {
        destination.push(match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        });
    }
    destination.len()
}

/// Read-only context the formatter hooks run against: the engine's global
/// settings plus the due instance's options and tick window.
pub struct FormatContext<'a> {
    /// Metric path prefix.
    pub prefix: &'a str,

    /// Reporting hostname, substituted for the local host on the wire.
    pub hostname: &'a str,

    /// Prefer human-readable names over internal ids.
    pub send_names: bool,

    /// Aggregation mode of the instance.
    pub data_source: DataSource,

    /// Tick window start, exclusive of the previous window.
    pub after: i64,

    /// Tick window end.
    pub before: i64,

    /// Storage engine queried by stored-data formatters.
    pub storage: &'a dyn Storage,
}

/// The seven-stage formatter strategy, selected per instance at init time.
///
/// Every hook defaults to a no-op; a strategy that overrides nothing formats
/// nothing, and the pipeline still walks the tree and updates its scheduling
/// state. The per-metric hook reports whether it appended a line, so the
/// pipeline can count buffered metrics.
pub trait FormatterHooks: Send + Sync {
    fn start_batch(&self, _ctx: &FormatContext, _buffer: &mut String) {}

    fn start_host(&self, _ctx: &FormatContext, _host: &Host, _buffer: &mut String) {}

    fn start_chart(&self, _ctx: &FormatContext, _host: &Host, _chart: &Chart, _buffer: &mut String) {
    }

    /// Append one formatted line for a dimension; true if a line was written.
    fn metric(
        &self,
        _ctx: &FormatContext,
        _host: &Host,
        _chart: &Chart,
        _dimension: &Dimension,
        _buffer: &mut String,
    ) -> bool {
        false
    }

    fn end_chart(&self, _ctx: &FormatContext, _host: &Host, _chart: &Chart, _buffer: &mut String) {}

    fn end_host(&self, _ctx: &FormatContext, _host: &Host, _buffer: &mut String) {}

    fn end_batch(&self, _ctx: &FormatContext, _buffer: &mut String) {}
}

/// A strategy with every hook left at its default.
#[derive(Debug, Default)]
pub struct NoopFormatter;

impl FormatterHooks for NoopFormatter {}

/// Which value the Graphite formatter exports per dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphiteVariant {
    /// Last raw collected value at its collection time.
    Collected,
    /// Windowed reduction over stored history.
    Stored,
}

/// Graphite plaintext formatter.
#[derive(Debug)]
pub struct GraphiteFormatter {
    pub variant: GraphiteVariant,
}

impl GraphiteFormatter {
    /// Append `<prefix>.<host>.<chart>.<dimension>[;tags]` to the buffer.
    fn write_metric_path(
        &self,
        ctx: &FormatContext,
        host: &Host,
        chart: &Chart,
        dimension: &Dimension,
        buffer: &mut String,
    ) {
        let mut component = String::new();

        buffer.push_str(ctx.prefix);
        buffer.push('.');

        let hostname = if host.local { ctx.hostname } else { &host.hostname };
        sanitize_name(&mut component, hostname, MAX_NAME_LENGTH);
        buffer.push_str(&component);
        buffer.push('.');

        let chart_name = if ctx.send_names { &chart.name } else { &chart.id };
        sanitize_name(&mut component, chart_name, MAX_NAME_LENGTH);
        buffer.push_str(&component);
        buffer.push('.');

        let dimension_name = if ctx.send_names {
            &dimension.name
        } else {
            &dimension.id
        };
        sanitize_name(&mut component, dimension_name, MAX_NAME_LENGTH);
        buffer.push_str(&component);

        if let Some(tags) = &host.tags {
            buffer.push(';');
            buffer.push_str(tags);
        }
    }
}

impl FormatterHooks for GraphiteFormatter {
    fn metric(
        &self,
        ctx: &FormatContext,
        host: &Host,
        chart: &Chart,
        dimension: &Dimension,
        buffer: &mut String,
    ) -> bool {
        match self.variant {
            GraphiteVariant::Collected => {
                self.write_metric_path(ctx, host, chart, dimension, buffer);
                let _ = writeln!(
                    buffer,
                    " {} {}",
                    dimension.last_collected_value(),
                    dimension.last_collected_time()
                );
                true
            }
            GraphiteVariant::Stored => {
                let Some((value, timestamp)) = sampling::calculate_value_from_stored_data(
                    ctx.storage,
                    &dimension.id,
                    ctx.after,
                    ctx.before,
                    ctx.data_source,
                ) else {
                    // no data in the window, skip the metric this cycle
                    return false;
                };
                self.write_metric_path(ctx, host, chart, dimension, buffer);
                let _ = writeln!(buffer, " {:.7} {}", value, timestamp);
                true
            }
        }
    }
}
