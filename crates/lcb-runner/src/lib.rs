//! # lcb-runner
//!
//! Runs OpenLCB CAN interfaces against each other on a virtual bus.
//!
//! - [`Scenario`]: YAML description of interfaces, their nodes and timed
//!   stimuli (global writes, addressed writes, injected frames).
//! - [`VirtualBus`]: lockstep simulated time across interfaces; every
//!   transmitted frame is recorded and delivered to every other interface.
//! - [`RunReport`]: the frame trace, the outcome of every write and the
//!   final alias tables, printable or as JSON.
//!
//! ```rust
//! use lcb_runner::{run_scenario, Scenario, WriteStatus};
//!
//! let scenario = Scenario::from_yaml(r#"
//! interfaces:
//!   - name: left
//!     node_id: "02.01.0D.00.00.03"
//!     nodes:
//!       - id: "02.01.0D.00.00.03"
//!         alias: 0x22A
//!   - name: right
//!     node_id: "05.01.01.FF.FF.DD"
//! events:
//!   - at_ms: 0
//!     interface: left
//!     action: global
//!     mti: 0x5B4
//!     src: "02.01.0D.00.00.03"
//!     payload: "0102030405060708"
//! "#).unwrap();
//!
//! let report = run_scenario(&scenario, None).unwrap();
//! assert_eq!(report.frames_from("left"), vec![":X195B422AN0102030405060708;"]);
//! assert_eq!(report.writes[0].status, WriteStatus::Ok);
//! ```

mod bus;
mod error;
mod report;
mod scenario;

use std::time::Duration;

use lcb_can::{IfCanBuilder, RandomAliasSource, ScriptedAliasSource};
use lcb_executor::FlowTime;
use tracing::info;

pub use bus::{VirtualBus, EXTERNAL_ORIGIN};
pub use error::{RunnerError, RunnerResult};
pub use report::{AliasBinding, InterfaceSummary, RunReport, TraceEntry, WriteOutcome, WriteStatus};
pub use scenario::{
    load_scenario, ActionKind, EventSpec, HexValue, InterfaceSpec, NodeSpec, Scenario, ScheduledStimulus,
    Stimulus,
};

/// Attach every interface of `scenario` to a fresh bus, with its nodes
/// already bound.
pub fn build_bus(scenario: &Scenario) -> RunnerResult<VirtualBus> {
    scenario.validate()?;
    let mut bus = VirtualBus::new();
    for spec in &scenario.interfaces {
        let node = spec.node_id.node_id("node_id")?;
        let mut builder = IfCanBuilder::new(node).with_config(spec.config.clone());
        if !spec.aliases.is_empty() {
            let aliases = spec
                .aliases
                .iter()
                .map(|a| a.alias("aliases").map(|a| a.raw()))
                .collect::<RunnerResult<Vec<u16>>>()?;
            builder = builder.with_alias_source(ScriptedAliasSource::new(node, aliases));
        } else if let Some(seed) = spec.alias_seed {
            builder = builder.with_alias_source(RandomAliasSource::new(seed));
        }

        let if_can = bus.attach(&spec.name, builder)?;
        for local in &spec.nodes {
            if_can.add_local_node(local.id.node_id("nodes.id")?, local.alias.alias("nodes.alias")?);
        }
        info!(iface = %spec.name, node = %node, nodes = spec.nodes.len(), "interface ready");
    }
    Ok(bus)
}

/// Build the bus, apply the scenario's events and run until `until`, or the
/// scenario's own duration.
pub fn run_scenario(scenario: &Scenario, until: Option<Duration>) -> RunnerResult<RunReport> {
    let mut bus = build_bus(scenario)?;
    let schedule = scenario.schedule()?;
    let end = match until {
        Some(limit) => FlowTime::ZERO + limit,
        None => FlowTime::from_millis(scenario.duration_ms),
    };
    info!(
        scenario = scenario.name.as_deref().unwrap_or("-"),
        events = schedule.len(),
        end = %end,
        "running scenario"
    );
    let mut report = bus.run(&schedule, end)?;
    report.scenario = scenario.name.clone();
    Ok(report)
}
