//! Metric declarations for the OpenLCB CAN stack.
//!
//! Every metric the executor and the CAN interface emit is declared once in
//! [`metric_defs`] as a [`Metric`] constant carrying its name, kind, unit and
//! label keys. Emitting code refers to the constant, never to a bare string.
//! Nothing here installs a recorder; with none installed the `metrics` macros
//! are no-ops.
//!
//! ```rust
//! use lcb_metrics::{describe_metrics, metric_defs, MetricLabels};
//!
//! describe_metrics();
//!
//! let labels = MetricLabels::new("can0", "interface");
//! metrics::counter!(metric_defs::FRAMES_TX.name, &labels.to_labels()).increment(1);
//! metrics::gauge!(metric_defs::PENDING_LOOKUPS.name, &labels.to_labels()).set(2.0);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// One declared metric.
///
/// ```rust
/// use lcb_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const RETRIES: Metric = Metric::counter("lcb.can.retries")
///     .with_description("Frames sent again")
///     .with_unit(Unit::Count)
///     .with_labels(&["iface"]);
///
/// assert_eq!(RETRIES.kind, MetricKind::Counter);
/// assert_eq!(RETRIES.labels, &["iface"]);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// Dotted name, `lcb.<area>.<what>`.
    pub name: &'static str,
    pub kind: MetricKind,
    pub description: &'static str,
    pub unit: Option<Unit>,
    /// Label keys every emission carries.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn declare(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    pub const fn counter(name: &'static str) -> Self {
        Self::declare(name, MetricKind::Counter)
    }

    pub const fn gauge(name: &'static str) -> Self {
        Self::declare(name, MetricKind::Gauge)
    }

    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Register the description and unit with the installed recorder.
    pub fn describe(&self) {
        let unit = self.unit.unwrap_or(Unit::Count);
        match self.kind {
            MetricKind::Counter => describe_counter!(self.name, unit, self.description),
            MetricKind::Gauge => describe_gauge!(self.name, unit, self.description),
        }
    }
}

pub mod metric_defs {
    use super::{Metric, Unit};

    /// Interface (or executor) name and the emitting component.
    pub const STANDARD_LABELS: &[&str] = &["iface", "component"];

    /// Write completions also carry the write kind and its result.
    pub const WRITE_LABELS: &[&str] = &["iface", "component", "kind", "result"];

    // ------------------------------------------------------------------
    // frames

    pub const FRAMES_TX: Metric = Metric::counter("lcb.can.frames_tx")
        .with_description("CAN frames handed to the transport")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const FRAMES_RX: Metric = Metric::counter("lcb.can.frames_rx")
        .with_description("CAN frames delivered by the transport")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    /// Standard-format or undecodable frames discarded before dispatch.
    pub const FRAMES_DROPPED: Metric = Metric::counter("lcb.can.frames_dropped")
        .with_description("Received frames dropped before dispatch")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const HANDLER_CALLS: Metric = Metric::counter("lcb.can.handler_calls")
        .with_description("Frame and message handler invocations")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    // ------------------------------------------------------------------
    // alias protocol

    pub const ALIAS_RESERVED: Metric = Metric::counter("lcb.alias.reserved")
        .with_description("Aliases reserved after a quiet contention window")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    /// Candidates lost during allocation and bound aliases taken over.
    pub const ALIAS_CONFLICTS: Metric = Metric::counter("lcb.alias.conflicts")
        .with_description("Alias conflicts detected")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const LOOKUP_ESCALATIONS: Metric = Metric::counter("lcb.alias.lookup_escalations")
        .with_description("Alias lookups escalated to Verify Node ID Global")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const LOOKUP_TIMEOUTS: Metric = Metric::counter("lcb.alias.lookup_timeouts")
        .with_description("Alias lookups abandoned after both timeouts")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    /// Destinations with a lookup in flight, one per Node ID.
    pub const PENDING_LOOKUPS: Metric = Metric::gauge("lcb.alias.pending_lookups")
        .with_description("Destinations with an alias lookup in flight")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    // ------------------------------------------------------------------
    // writes and flows

    pub const WRITE_COMPLETED: Metric = Metric::counter("lcb.write.completed")
        .with_description("Write requests completed")
        .with_unit(Unit::Count)
        .with_labels(WRITE_LABELS);

    pub const FLOW_RUNS: Metric = Metric::counter("lcb.executor.flow_runs")
        .with_description("Flow activations run by an executor")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    pub const ALL: &[&Metric] = &[
        &FRAMES_TX,
        &FRAMES_RX,
        &FRAMES_DROPPED,
        &HANDLER_CALLS,
        &ALIAS_RESERVED,
        &ALIAS_CONFLICTS,
        &LOOKUP_ESCALATIONS,
        &LOOKUP_TIMEOUTS,
        &PENDING_LOOKUPS,
        &WRITE_COMPLETED,
        &FLOW_RUNS,
    ];
}

/// Label values identifying where a metric comes from.
#[derive(Debug, Clone)]
pub struct MetricLabels {
    pub iface: String,
    /// `interface` or `executor`.
    pub component: String,
}

impl MetricLabels {
    pub fn new(iface: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            component: component.into(),
        }
    }

    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("iface", self.iface.clone()), ("component", self.component.clone())]
    }

    /// The standard labels followed by `extra`.
    ///
    /// ```rust
    /// use lcb_metrics::MetricLabels;
    ///
    /// let labels = MetricLabels::new("can0", "interface").with(&[("result", "ok".to_string())]);
    /// assert_eq!(labels.last(), Some(&("result", "ok".to_string())));
    /// ```
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.extend_from_slice(extra);
        labels
    }
}

/// Describe every metric in [`metric_defs::ALL`]. Call after installing a
/// recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
