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

//! Host and chart exportability filters
//!
//! Wraps the simple-pattern matcher and caches each verdict as a sticky flag
//! on the host or chart, so the pattern is evaluated at most once per object
//! until the flag is externally cleared.

use crate::model::{Chart, Host};
use tracing::info;

/// A simple pattern: space-separated glob expressions, each optionally
/// prefixed with `!` for negation. The first matching expression wins; no
/// match means exclusion.
#[derive(Debug, Clone)]
pub struct SimplePattern {
    expressions: Vec<Expression>,
}

#[derive(Debug, Clone)]
struct Expression {
    negated: bool,
    glob: String,
}

impl SimplePattern {
    /// Parse a pattern list, e.g. `"!*.internal *"`.
    pub fn parse(pattern: &str) -> Self {
        let expressions = pattern
            .split_whitespace()
            .map(|word| {
                let (negated, glob) = match word.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, word),
                };
                Expression {
                    negated,
                    glob: glob.to_string(),
                }
            })
            .collect();
        Self { expressions }
    }

    /// Match `text` against the expression list, first match wins.
    pub fn matches(&self, text: &str) -> bool {
        for expression in &self.expressions {
            if glob_match(&expression.glob, text) {
                return !expression.negated;
            }
        }
        false
    }
}

/// Glob match supporting `*` as "any run of characters".
fn glob_match(glob: &str, text: &str) -> bool {
    let glob: Vec<char> = glob.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut g, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if g < glob.len() && (glob[g] == text[t]) {
            g += 1;
            t += 1;
        } else if g < glob.len() && glob[g] == '*' {
            star = Some((g, t));
            g += 1;
        } else if let Some((star_g, star_t)) = star {
            // backtrack: let the last * swallow one more character
            g = star_g + 1;
            t = star_t + 1;
            star = Some((star_g, star_t + 1));
        } else {
            return false;
        }
    }
    while g < glob.len() && glob[g] == '*' {
        g += 1;
    }
    g == glob.len()
}

/// Decide whether `host` is in scope for an instance.
///
/// A cached verdict is returned unchanged. Otherwise the host-inclusion
/// pattern is evaluated against the canonical hostname, the verdict is cached
/// on the host, and the first decision is logged.
pub fn host_is_exportable(pattern: &SimplePattern, instance_name: &str, host: &Host) -> bool {
    if let Some(verdict) = host.export.get() {
        return verdict;
    }

    let verdict = host.export.decide(pattern.matches(&host.hostname));
    info!(
        "{} exporting of host '{}' for instance '{}'",
        if verdict { "enabled" } else { "disabled" },
        host.hostname,
        instance_name
    );
    verdict
}

/// Decide whether `chart` is in scope for an instance; symmetric to
/// [`host_is_exportable`] but silent.
pub fn chart_is_exportable(pattern: &SimplePattern, chart: &Chart) -> bool {
    if let Some(verdict) = chart.export.get() {
        return verdict;
    }
    chart.export.decide(pattern.matches(&chart.id) || pattern.matches(&chart.name))
}
