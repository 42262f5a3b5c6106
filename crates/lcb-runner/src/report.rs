//! What a run leaves behind: the frame trace, write outcomes and the final
//! alias tables.

use std::fmt;

use lcb_can::{IfCan, IfError, IfResult};
use serde::Serialize;

use crate::error::RunnerResult;

fn fmt_ms(us: u64) -> String {
    format!("{:>10.3} ms", us as f64 / 1000.0)
}

/// One frame as it appeared on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub time_us: u64,
    /// Interface that transmitted the frame, or `external` for injections.
    pub origin: String,
    /// GridConnect text.
    pub frame: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    Ok,
    Failed(String),
    /// Still in flight when the run ended.
    Pending,
}

impl WriteStatus {
    pub fn failed(err: &IfError) -> Self {
        WriteStatus::Failed(err.to_string())
    }
}

impl From<IfResult<()>> for WriteStatus {
    fn from(result: IfResult<()>) -> Self {
        match result {
            Ok(()) => WriteStatus::Ok,
            Err(err) => WriteStatus::failed(&err),
        }
    }
}

/// Outcome of one write issued during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    /// Issue order, starting at zero.
    pub index: usize,
    pub interface: String,
    /// `global` or `addressed`.
    pub kind: String,
    pub mti: u16,
    pub issued_us: u64,
    pub completed_us: Option<u64>,
    pub status: WriteStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AliasBinding {
    pub node: String,
    pub alias: String,
}

/// Alias tables of one interface at the end of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceSummary {
    pub name: String,
    pub node_id: String,
    pub local_aliases: Vec<AliasBinding>,
    pub reserved_aliases: usize,
    pub remote_aliases: usize,
}

impl InterfaceSummary {
    pub(crate) fn of(if_can: &IfCan) -> Self {
        InterfaceSummary {
            name: if_can.name().to_string(),
            node_id: if_can.node_id().to_string(),
            local_aliases: if_can
                .local_aliases()
                .bound()
                .map(|(node, alias)| AliasBinding {
                    node: node.to_string(),
                    alias: alias.to_string(),
                })
                .collect(),
            reserved_aliases: if_can.reserved_alias_count(),
            remote_aliases: if_can.remote_aliases().len(),
        }
    }
}

/// Everything recorded by [`VirtualBus::run`](crate::VirtualBus::run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub scenario: Option<String>,
    pub end_us: u64,
    pub frames: Vec<TraceEntry>,
    pub writes: Vec<WriteOutcome>,
    pub interfaces: Vec<InterfaceSummary>,
    /// Frames an interface had no receive slot for.
    pub dropped_frames: u64,
}

impl RunReport {
    /// GridConnect text of every frame sent by `origin`, in bus order.
    pub fn frames_from(&self, origin: &str) -> Vec<&str> {
        self.frames
            .iter()
            .filter(|e| e.origin == origin)
            .map(|e| e.frame.as_str())
            .collect()
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceSummary> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn to_json(&self) -> RunnerResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.scenario {
            writeln!(f, "scenario {name}")?;
        }
        let width = self.frames.iter().map(|e| e.origin.len()).max().unwrap_or(0);
        for entry in &self.frames {
            writeln!(f, "{}  {:<width$}  {}", fmt_ms(entry.time_us), entry.origin, entry.frame)?;
        }

        writeln!(f)?;
        for write in &self.writes {
            let done = write.completed_us.map(fmt_ms).unwrap_or_else(|| "         - ".to_string());
            let status = match &write.status {
                WriteStatus::Ok => "ok".to_string(),
                WriteStatus::Failed(err) => format!("failed: {err}"),
                WriteStatus::Pending => "pending".to_string(),
            };
            writeln!(
                f,
                "write #{:<3} {:<10} {:<9} mti=0x{:03X} issued {} done {}  {}",
                write.index,
                write.interface,
                write.kind,
                write.mti,
                fmt_ms(write.issued_us),
                done,
                status
            )?;
        }

        for iface in &self.interfaces {
            let bound: Vec<String> = iface
                .local_aliases
                .iter()
                .map(|b| format!("{}={}", b.node, b.alias))
                .collect();
            writeln!(
                f,
                "{} ({}): local [{}], reserved {}, remote {}",
                iface.name,
                iface.node_id,
                bound.join(", "),
                iface.reserved_aliases,
                iface.remote_aliases
            )?;
        }
        if self.dropped_frames > 0 {
            writeln!(f, "dropped frames: {}", self.dropped_frames)?;
        }
        write!(f, "ended at {}", fmt_ms(self.end_us))
    }
}
