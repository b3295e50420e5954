// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Timing events for store operations.
//
// The adapter measures the wall-clock duration of every operation and hands
// a `MetricEvent` to an injected `MetricsObserver`. Observers are a pure side
// channel: `record` cannot fail and its result is never consulted, so an
// adapter behaves identically with `NoopObserver`.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// The operation a [`MetricEvent`] measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Init,
    Get,
    Set,
    Remove,
    Bulk,
}

impl MetricKind {
    /// Event name, e.g. `metric.set`.
    pub fn event_name(self) -> &'static str {
        match self {
            MetricKind::Init => "metric.init",
            MetricKind::Get => "metric.get",
            MetricKind::Set => "metric.set",
            MetricKind::Remove => "metric.remove",
            MetricKind::Bulk => "metric.bulk",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// One timed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricEvent {
    pub kind: MetricKind,
    pub elapsed: Duration,
    /// Whether the operation returned `Ok`.
    pub succeeded: bool,
}

/// Receives timing events from a store adapter.
pub trait MetricsObserver: Send + Sync {
    fn record(&self, event: MetricEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl MetricsObserver for NoopObserver {
    fn record(&self, _event: MetricEvent) {}
}

/// Forwards events to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl MetricsObserver for TracingObserver {
    fn record(&self, event: MetricEvent) {
        tracing::debug!(
            target: "strata::metrics",
            event = event.kind.event_name(),
            elapsed_ms = event.elapsed.as_secs_f64() * 1000.0,
            succeeded = event.succeeded,
            "store operation timed"
        );
    }
}

/// Sends events over an unbounded tokio channel.
///
/// A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<MetricEvent>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MetricEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl MetricsObserver for ChannelObserver {
    fn record(&self, event: MetricEvent) {
        let _ = self.sender.send(event);
    }
}

/// Accumulated statistics for one adapter.
///
/// All counters are monotonically increasing until [`StatsObserver::reset`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendStats {
    /// Number of `init` calls.
    pub init_count: u64,
    /// Number of `get` operations performed.
    pub get_count: u64,
    /// Number of `set` operations performed.
    pub set_count: u64,
    /// Number of `remove` operations performed.
    pub remove_count: u64,
    /// Number of `do_bulk` calls performed.
    pub bulk_count: u64,
    /// Operations of any kind that returned an error.
    pub failure_count: u64,
    /// Cumulative wall-clock latency of all `get` calls, in milliseconds.
    pub get_latency_sum_ms: f64,
    /// Cumulative wall-clock latency of all `set` calls, in milliseconds.
    pub set_latency_sum_ms: f64,
    /// Cumulative wall-clock latency of all `remove` calls, in milliseconds.
    pub remove_latency_sum_ms: f64,
    /// Cumulative wall-clock latency of all `do_bulk` calls, in milliseconds.
    pub bulk_latency_sum_ms: f64,
}

/// Collects [`BackendStats`] from the events it observes.
#[derive(Debug, Default)]
pub struct StatsObserver {
    stats: Mutex<BackendStats>,
}

impl StatsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a snapshot of the current statistics.
    pub fn stats(&self) -> BackendStats {
        self.stats.lock().clone()
    }

    /// Reset all statistics to zero.
    pub fn reset(&self) {
        *self.stats.lock() = BackendStats::default();
    }
}

impl MetricsObserver for StatsObserver {
    fn record(&self, event: MetricEvent) {
        let elapsed_ms = event.elapsed.as_secs_f64() * 1000.0;
        let mut s = self.stats.lock();
        if !event.succeeded {
            s.failure_count += 1;
        }
        match event.kind {
            MetricKind::Init => s.init_count += 1,
            MetricKind::Get => {
                s.get_count += 1;
                s.get_latency_sum_ms += elapsed_ms;
            }
            MetricKind::Set => {
                s.set_count += 1;
                s.set_latency_sum_ms += elapsed_ms;
            }
            MetricKind::Remove => {
                s.remove_count += 1;
                s.remove_latency_sum_ms += elapsed_ms;
            }
            MetricKind::Bulk => {
                s.bulk_count += 1;
                s.bulk_latency_sum_ms += elapsed_ms;
            }
        }
    }
}
