//! In-process performance counters.
//!
//! Tracks per-operation durations against a slowness threshold, how often each tool is
//! called (and refused), and failures per [`ErrorCode`]. Everything is kept in memory;
//! [`Metrics::summary`] gives a serializable view and [`Metrics::export`] writes it out.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    path::Path,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

use crate::{
    errors::Error, model::types::ConversationMessage, protocol::ErrorCode, tools::ToolName,
    Result,
};

const DEFAULT_THRESHOLD: Duration = Duration::from_secs(5);
const RECENT_ERRORS: usize = 5;

#[derive(Debug, Default)]
struct OperationStats {
    count: u64,
    failures: u64,
    slow: u64,
    total: Duration,
    max: Duration,
    recent_errors: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUsage {
    pub calls: u64,
    pub denied: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub count: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub average_ms: u64,
    pub max_ms: u64,
    /// Runs that took longer than the operation's threshold.
    pub slow: u64,
    pub recent_errors: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub since: DateTime<Utc>,
    pub total_operations: u64,
    pub success_rate: f64,
    pub operations: BTreeMap<String, OperationSummary>,
    pub tools: BTreeMap<ToolName, ToolUsage>,
    pub most_used_tool: Option<ToolName>,
    pub errors: BTreeMap<String, u64>,
}

#[derive(Debug)]
pub struct Metrics {
    since: DateTime<Utc>,
    thresholds: HashMap<String, Duration>,
    operations: DashMap<String, OperationStats>,
    tools: DashMap<ToolName, ToolUsage>,
    errors: DashMap<ErrorCode, u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        let thresholds = [("query", 5), ("query_once", 5), ("send_to_session", 5)]
            .into_iter()
            .map(|(op, secs)| (op.to_string(), Duration::from_secs(secs)))
            .collect();
        Self {
            since: Utc::now(),
            thresholds,
            operations: DashMap::new(),
            tools: DashMap::new(),
            errors: DashMap::new(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, operation: &str, threshold: Duration) -> Self {
        self.thresholds.insert(operation.to_string(), threshold);
        self
    }

    pub fn threshold(&self, operation: &str) -> Duration {
        self.thresholds
            .get(operation)
            .copied()
            .unwrap_or(DEFAULT_THRESHOLD)
    }

    /// Record one finished operation.
    pub fn record(&self, operation: &str, elapsed: Duration, error: Option<&Error>) {
        let threshold = self.threshold(operation);
        {
            let mut stats = self.operations.entry(operation.to_string()).or_default();
            stats.count += 1;
            stats.total += elapsed;
            stats.max = stats.max.max(elapsed);
            if elapsed > threshold {
                stats.slow += 1;
            }
            if let Some(e) = error {
                stats.failures += 1;
                stats.recent_errors.push(e.to_string());
                if stats.recent_errors.len() > RECENT_ERRORS {
                    stats.recent_errors.remove(0);
                }
            }
        }

        if elapsed > threshold {
            warn!(
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "slow operation"
            );
        }
        if let Some(e) = error {
            *self.errors.entry(e.code()).or_default() += 1;
            if let Error::PermissionDenied { tool, .. } = e {
                if let Ok(tool) = tool.parse::<ToolName>() {
                    self.tools.entry(tool).or_default().denied += 1;
                }
            }
        }
    }

    /// Run `fut` and record how long it took and whether it failed.
    pub async fn time<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let out = fut.await;
        self.record(operation, started.elapsed(), out.as_ref().err());
        out
    }

    /// Count the tool calls a message carries.
    pub fn record_tool_calls(&self, message: &ConversationMessage) {
        for call in message.tool_calls.iter().flatten() {
            self.tools.entry(call.tool).or_default().calls += 1;
        }
    }

    pub fn error_count(&self, code: ErrorCode) -> u64 {
        self.errors.get(&code).map(|n| *n).unwrap_or(0)
    }

    pub fn tool_usage(&self, tool: ToolName) -> ToolUsage {
        self.tools.get(&tool).map(|u| *u).unwrap_or_default()
    }

    pub fn summary(&self) -> MetricsSummary {
        let mut total = 0;
        let mut failures = 0;
        let operations = self
            .operations
            .iter()
            .map(|entry| {
                let s = entry.value();
                total += s.count;
                failures += s.failures;
                let summary = OperationSummary {
                    count: s.count,
                    failures: s.failures,
                    success_rate: success_rate(s.count, s.failures),
                    average_ms: millis(s.total) / s.count.max(1),
                    max_ms: millis(s.max),
                    slow: s.slow,
                    recent_errors: s.recent_errors.clone(),
                };
                (entry.key().clone(), summary)
            })
            .collect();

        let tools: BTreeMap<_, _> = self.tools.iter().map(|e| (*e.key(), *e.value())).collect();
        let most_used_tool = tools
            .iter()
            .filter(|(_, u)| u.calls > 0)
            .max_by_key(|(tool, u)| (u.calls, std::cmp::Reverse(**tool)))
            .map(|(tool, _)| *tool);
        let errors = self
            .errors
            .iter()
            .map(|e| (code_name(*e.key()), *e.value()))
            .collect();

        MetricsSummary {
            since: self.since,
            total_operations: total,
            success_rate: success_rate(total, failures),
            operations,
            tools,
            most_used_tool,
            errors,
        }
    }

    /// Write the summary as pretty JSON.
    pub fn export(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&self.summary())?)?;
        Ok(())
    }

    pub fn clear(&self) {
        self.operations.clear();
        self.tools.clear();
        self.errors.clear();
    }
}

fn success_rate(count: u64, failures: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (count - failures) as f64 / count as f64
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn code_name(code: ErrorCode) -> String {
    serde_json::to_value(code)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{code:?}"))
}
