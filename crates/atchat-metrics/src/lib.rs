//! Metrics for the AT chat engine.
//!
//! This crate declares every metric the chat engine emits as a structured
//! [`Metric`] constant, and re-exports the `metrics` facade so callers do not
//! need a direct dependency. Nothing is recorded unless the host installs a
//! recorder; without one the macros are no-ops.
//!
//! # Example
//!
//! ```rust,ignore
//! use atchat_metrics::{metric_defs, describe_metrics, MetricLabels};
//!
//! // Initialize metric descriptions at startup
//! describe_metrics();
//!
//! let labels = MetricLabels::new("modem0");
//! metrics::counter!(metric_defs::COMMANDS_SUBMITTED.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// Declared with the const constructors so that every metric lives in
/// [`metric_defs`] as a compile-time constant.
///
/// ```rust
/// use atchat_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const LINES: Metric = Metric::counter("atchat.lines")
///     .with_description("Lines seen")
///     .with_unit(Unit::Count)
///     .with_labels(&["channel"]);
///
/// assert_eq!(LINES.name, "atchat.lines");
/// assert_eq!(LINES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "atchat.bytes.rx").
    pub name: &'static str,
    /// The kind of metric (counter, gauge, histogram).
    pub kind: MetricKind,
    /// Human-readable description of the metric.
    pub description: &'static str,
    /// The unit of measurement (optional).
    pub unit: Option<Unit>,
    /// Expected label keys for this metric.
    pub labels: &'static [&'static str],
}

impl Metric {
    /// Creates a new counter metric with the given name.
    pub const fn counter(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a new gauge metric with the given name.
    pub const fn gauge(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Gauge,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a new histogram metric with the given name.
    pub const fn histogram(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Histogram,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Sets the description for the metric.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit for the metric.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys for the metric.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

/// All metric definitions emitted by the chat engine.
pub mod metric_defs {
    use super::{Metric, Unit};

    /// Label present on every engine metric.
    pub const CHANNEL_LABELS: &[&str] = &["channel"];

    // ========================================================================
    // Command Queue
    // ========================================================================

    /// Commands accepted into the queue.
    pub const COMMANDS_SUBMITTED: Metric = Metric::counter("atchat.commands.submitted")
        .with_description("Commands accepted into the command queue")
        .with_unit(Unit::Count)
        .with_labels(CHANNEL_LABELS);

    /// Commands resolved by a terminator line or a timeout.
    ///
    /// Labels: channel, outcome (`ok` | `error`)
    pub const COMMANDS_COMPLETED: Metric = Metric::counter("atchat.commands.completed")
        .with_description("Commands resolved by a terminator line or timeout")
        .with_unit(Unit::Count)
        .with_labels(&["channel", "outcome"]);

    /// Commands removed or muted by a cancel request.
    pub const COMMANDS_CANCELED: Metric = Metric::counter("atchat.commands.canceled")
        .with_description("Commands removed or muted by cancellation")
        .with_unit(Unit::Count)
        .with_labels(CHANNEL_LABELS);

    /// Commands failed because their opt-in response timeout expired.
    pub const COMMANDS_TIMED_OUT: Metric = Metric::counter("atchat.commands.timeouts")
        .with_description("Commands failed by their response timeout")
        .with_unit(Unit::Count)
        .with_labels(CHANNEL_LABELS);

    /// Number of commands waiting in the queue, including the one in flight.
    pub const QUEUE_DEPTH: Metric = Metric::gauge("atchat.queue.depth")
        .with_description("Commands waiting in the queue")
        .with_unit(Unit::Count)
        .with_labels(CHANNEL_LABELS);

    // ========================================================================
    // Line Dispatch
    // ========================================================================

    /// Unsolicited lines delivered to at least one notification handler.
    pub const NOTIFICATIONS_DISPATCHED: Metric = Metric::counter("atchat.notifications.dispatched")
        .with_description("Unsolicited lines delivered to notification handlers")
        .with_unit(Unit::Count)
        .with_labels(CHANNEL_LABELS);

    /// Lines that matched no command and no notification.
    pub const LINES_UNMATCHED: Metric = Metric::counter("atchat.lines.unmatched")
        .with_description("Lines matching neither a command nor a notification")
        .with_unit(Unit::Count)
        .with_labels(CHANNEL_LABELS);

    // ========================================================================
    // Transport
    // ========================================================================

    /// Bytes received from the transport.
    pub const BYTES_RX: Metric = Metric::counter("atchat.bytes.rx")
        .with_description("Bytes received from the transport")
        .with_unit(Unit::Bytes)
        .with_labels(CHANNEL_LABELS);

    /// Bytes written to the transport.
    pub const BYTES_TX: Metric = Metric::counter("atchat.bytes.tx")
        .with_description("Bytes written to the transport")
        .with_unit(Unit::Bytes)
        .with_labels(CHANNEL_LABELS);

    // ========================================================================
    // Wakeup
    // ========================================================================

    /// Wakeup commands spliced in front of the queue.
    pub const WAKEUP_SENT: Metric = Metric::counter("atchat.wakeup.sent")
        .with_description("Wakeup commands queued ahead of user commands")
        .with_unit(Unit::Count)
        .with_labels(CHANNEL_LABELS);

    /// Wakeup commands that got no response in time.
    pub const WAKEUP_TIMEOUTS: Metric = Metric::counter("atchat.wakeup.timeouts")
        .with_description("Wakeup commands that got no response in time")
        .with_unit(Unit::Count)
        .with_labels(CHANNEL_LABELS);

    /// Time between writing the last byte of a command and its terminator line.
    pub const RESPONSE_LATENCY: Metric = Metric::histogram("atchat.commands.response_latency_ms")
        .with_description("Time from command write to terminator line in milliseconds")
        .with_unit(Unit::Milliseconds)
        .with_labels(CHANNEL_LABELS);

    /// Returns a slice of all defined metrics.
    pub const ALL: &[&Metric] = &[
        &COMMANDS_SUBMITTED,
        &COMMANDS_COMPLETED,
        &COMMANDS_CANCELED,
        &COMMANDS_TIMED_OUT,
        &QUEUE_DEPTH,
        &NOTIFICATIONS_DISPATCHED,
        &LINES_UNMATCHED,
        &BYTES_RX,
        &BYTES_TX,
        &WAKEUP_SENT,
        &WAKEUP_TIMEOUTS,
        &RESPONSE_LATENCY,
    ];
}

/// Labels identifying the channel a metric belongs to.
///
/// ```rust
/// use atchat_metrics::MetricLabels;
///
/// let labels = MetricLabels::new("modem0");
/// let extended = labels.with(&[("outcome", "ok".to_string())]);
/// assert_eq!(extended.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct MetricLabels {
    /// Channel name, taken from the chat configuration.
    pub channel: String,
}

impl MetricLabels {
    /// Creates labels for the named channel.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }

    /// Converts the labels to the metrics crate label format.
    pub fn to_labels(&self) -> [(&'static str, String); 1] {
        [("channel", self.channel.clone())]
    }

    /// Returns labels with additional key-value pairs.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels().to_vec();
        labels.extend_from_slice(extra);
        labels
    }
}

/// Describes all engine metrics.
///
/// Call once at startup after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
