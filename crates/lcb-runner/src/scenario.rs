//! Scenario files.
//!
//! A scenario names the interfaces sharing one bus and the stimuli applied
//! to them over simulated time:
//!
//! ```yaml
//! name: lookup
//! duration_ms: 5000
//! interfaces:
//!   - name: left
//!     node_id: "05.01.01.01.22.00"
//!     config:
//!       contention_window_ms: 200
//!     nodes:
//!       - id: "05.01.01.01.22.00"
//!         alias: 0x22A
//!   - name: right
//!     node_id: "05.01.01.01.33.00"
//!     aliases: [0x33B]
//! events:
//!   - at_ms: 10
//!     interface: right
//!     action: addressed
//!     mti: 0x488
//!     src: "05.01.01.01.33.00"
//!     dst: "05.01.01.01.22.00"
//!   - at_ms: 20
//!     action: inject
//!     frame: ":X195B4777N0102030405060708;"
//! ```
//!
//! Numeric fields accept YAML integers as written (`0x22A`, `554`) or
//! strings, which are always hexadecimal and may use `.`, `:` or `-` as
//! separators.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use lcb_can::{CanFrame, IfConfig, Mti, NodeAlias, NodeHandle, NodeId};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RunnerError, RunnerResult};

fn default_duration_ms() -> u64 {
    10_000
}

/// A number written in a scenario file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HexValue(pub u64);

impl HexValue {
    /// Parse hexadecimal text, with or without a `0x` prefix.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let cleaned: String = digits.chars().filter(|c| !matches!(c, '.' | ':' | '-' | '_')).collect();
        if cleaned.is_empty() {
            return Err(format!("empty value '{s}'"));
        }
        u64::from_str_radix(&cleaned, 16)
            .map(HexValue)
            .map_err(|e| format!("invalid hex '{s}': {e}"))
    }

    pub(crate) fn node_id(self, field: &'static str) -> RunnerResult<NodeId> {
        if self.0 > NodeId::MASK {
            return Err(RunnerError::invalid(field, format!("{:#X} is wider than 48 bits", self.0)));
        }
        Ok(NodeId::new(self.0))
    }

    pub(crate) fn alias(self, field: &'static str) -> RunnerResult<NodeAlias> {
        let alias = u16::try_from(self.0)
            .ok()
            .map(NodeAlias::new)
            .filter(|a| a.is_valid() && u64::from(a.raw()) == self.0);
        alias.ok_or_else(|| RunnerError::invalid(field, format!("{:#X} is not a valid alias", self.0)))
    }

    fn mti(self) -> RunnerResult<Mti> {
        u16::try_from(self.0)
            .map(Mti)
            .map_err(|_| RunnerError::invalid("mti", format!("{:#X} is wider than 16 bits", self.0)))
    }
}

impl Serialize for HexValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:X}", self.0))
    }
}

impl<'de> Deserialize<'de> for HexValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HexVisitor;

        impl<'de> Visitor<'de> for HexVisitor {
            type Value = HexValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an integer or a hexadecimal string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<HexValue, E> {
                Ok(HexValue(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<HexValue, E> {
                u64::try_from(v)
                    .map(HexValue)
                    .map_err(|_| E::custom(format!("negative value {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<HexValue, E> {
                HexValue::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(HexVisitor)
    }
}

/// A complete scenario file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    /// Simulated time to run when the caller gives no limit.
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    pub interfaces: Vec<InterfaceSpec>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
}

/// One interface attached to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub name: String,
    /// Node ID the interface claims aliases with.
    pub node_id: HexValue,
    #[serde(default)]
    pub config: IfConfig,
    /// Alias candidates tried first, in order.
    #[serde(default)]
    pub aliases: Vec<HexValue>,
    /// Draw candidates from a seeded random source instead of the Node ID
    /// sequence. Ignored when `aliases` is given.
    #[serde(default)]
    pub alias_seed: Option<u64>,
    /// Nodes that start with an alias already bound.
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: HexValue,
    pub alias: HexValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Write an unaddressed message.
    Global,
    /// Write an addressed message.
    Addressed,
    /// Put a raw frame on the bus as if another node had sent it.
    Inject,
}

/// One timed stimulus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSpec {
    pub at_ms: u64,
    pub action: ActionKind,
    /// Interface performing a write. Injected frames reach every interface.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub mti: Option<HexValue>,
    #[serde(default)]
    pub src: Option<HexValue>,
    #[serde(default)]
    pub dst: Option<HexValue>,
    #[serde(default)]
    pub dst_alias: Option<HexValue>,
    /// Payload as hex text.
    #[serde(default)]
    pub payload: String,
    /// GridConnect frame for `inject`.
    #[serde(default)]
    pub frame: Option<String>,
}

/// A validated stimulus, ready to apply to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stimulus {
    Global {
        interface: String,
        mti: Mti,
        src: NodeId,
        payload: Vec<u8>,
    },
    Addressed {
        interface: String,
        mti: Mti,
        src: NodeId,
        dst: NodeHandle,
        payload: Vec<u8>,
    },
    Inject {
        frame: CanFrame,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledStimulus {
    pub at_ms: u64,
    pub stimulus: Stimulus,
}

impl Scenario {
    pub fn from_yaml(text: &str) -> RunnerResult<Self> {
        let scenario: Scenario = serde_yaml::from_str(text)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn to_yaml(&self) -> RunnerResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check names, identifiers and every event without running anything.
    pub fn validate(&self) -> RunnerResult<()> {
        let mut names = HashSet::new();
        for iface in &self.interfaces {
            if !names.insert(iface.name.as_str()) {
                return Err(RunnerError::DuplicateInterface(iface.name.clone()));
            }
            iface.node_id.node_id("node_id")?;
            for alias in &iface.aliases {
                alias.alias("aliases")?;
            }
            for node in &iface.nodes {
                node.id.node_id("nodes.id")?;
                node.alias.alias("nodes.alias")?;
            }
        }
        self.schedule().map(|_| ())
    }

    /// Events resolved to typed stimuli, in time order. Events at the same
    /// time keep file order.
    pub fn schedule(&self) -> RunnerResult<Vec<ScheduledStimulus>> {
        let mut out = Vec::with_capacity(self.events.len());
        for event in &self.events {
            out.push(ScheduledStimulus {
                at_ms: event.at_ms,
                stimulus: self.resolve(event)?,
            });
        }
        out.sort_by_key(|s| s.at_ms);
        Ok(out)
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceSpec> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    fn resolve(&self, event: &EventSpec) -> RunnerResult<Stimulus> {
        if event.action == ActionKind::Inject {
            let text = event
                .frame
                .as_deref()
                .ok_or_else(|| RunnerError::invalid("frame", "inject needs a frame"))?;
            return Ok(Stimulus::Inject { frame: text.parse()? });
        }

        let interface = event
            .interface
            .clone()
            .ok_or_else(|| RunnerError::invalid("interface", "writes need an interface"))?;
        if self.interface(&interface).is_none() {
            return Err(RunnerError::UnknownInterface(interface));
        }
        let mti = event
            .mti
            .ok_or_else(|| RunnerError::invalid("mti", "writes need an MTI"))?
            .mti()?;
        let src = event
            .src
            .ok_or_else(|| RunnerError::invalid("src", "writes need a source node"))?
            .node_id("src")?;
        let payload = hex::decode(event.payload.replace([' ', '.'], ""))
            .map_err(|e| RunnerError::invalid("payload", e.to_string()))?;

        match event.action {
            ActionKind::Global => Ok(Stimulus::Global {
                interface,
                mti,
                src,
                payload,
            }),
            ActionKind::Addressed => {
                let dst = NodeHandle {
                    id: event.dst.map(|d| d.node_id("dst")).transpose()?,
                    alias: event.dst_alias.map(|a| a.alias("dst_alias")).transpose()?,
                };
                if dst.is_empty() {
                    return Err(RunnerError::invalid("dst", "addressed writes need dst or dst_alias"));
                }
                Ok(Stimulus::Addressed {
                    interface,
                    mti,
                    src,
                    dst,
                    payload,
                })
            }
            ActionKind::Inject => Err(RunnerError::invalid("action", "unreachable inject")),
        }
    }
}

/// Read and validate a scenario file.
pub fn load_scenario(path: impl AsRef<Path>) -> RunnerResult<Scenario> {
    let text = std::fs::read_to_string(path)?;
    Scenario::from_yaml(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
name: basic
interfaces:
  - name: left
    node_id: "02.01.0D.00.00.03"
    config:
      contention_window_ms: 50
    nodes:
      - id: "02010D000003"
        alias: 0x22A
  - name: right
    node_id: 0x050101FFFFDD
    aliases: ["33B", 0x44C]
events:
  - at_ms: 100
    interface: right
    action: addressed
    mti: 0x488
    src: 0x050101FFFFDD
    dst: "02.01.0D.00.00.03"
  - at_ms: 5
    interface: left
    action: global
    mti: 0x5B4
    src: "02010D000003"
    payload: "0102030405060708"
  - at_ms: 5
    action: inject
    frame: ":X19170210N050101FFFFDD;"
"#;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_yaml(SCENARIO).unwrap();
        assert_eq!(scenario.name.as_deref(), Some("basic"));
        assert_eq!(scenario.duration_ms, 10_000);
        assert_eq!(scenario.interfaces.len(), 2);

        let left = scenario.interface("left").unwrap();
        assert_eq!(left.node_id, HexValue(0x02010D000003));
        assert_eq!(left.config.contention_window_ms, 50);
        assert_eq!(left.config.verify_timeout_ms, IfConfig::default().verify_timeout_ms);
        assert_eq!(left.nodes[0].alias, HexValue(0x22A));

        let right = scenario.interface("right").unwrap();
        assert_eq!(right.aliases, vec![HexValue(0x33B), HexValue(0x44C)]);
    }

    #[test]
    fn test_schedule_is_time_ordered() {
        let scenario = Scenario::from_yaml(SCENARIO).unwrap();
        let schedule = scenario.schedule().unwrap();
        let times: Vec<u64> = schedule.iter().map(|s| s.at_ms).collect();
        assert_eq!(times, vec![5, 5, 100]);
        assert!(matches!(schedule[0].stimulus, Stimulus::Global { .. }));
        assert!(matches!(schedule[1].stimulus, Stimulus::Inject { .. }));
        match &schedule[2].stimulus {
            Stimulus::Addressed { mti, dst, payload, .. } => {
                assert_eq!(*mti, Mti::VERIFY_NODE_ID_ADDRESSED);
                assert_eq!(dst.id, Some(NodeId::new(0x02010D000003)));
                assert!(payload.is_empty());
            }
            other => panic!("unexpected stimulus {other:?}"),
        }
    }

    #[test]
    fn test_hex_value_parse() {
        assert_eq!(HexValue::parse("0x22A"), Ok(HexValue(0x22A)));
        assert_eq!(HexValue::parse("02.01.0D.00.00.03"), Ok(HexValue(0x02010D000003)));
        assert_eq!(HexValue::parse("05:01:01:FF:FF:DD"), Ok(HexValue(0x050101FFFFDD)));
        assert!(HexValue::parse("xyz").is_err());
        assert!(HexValue::parse("").is_err());
    }

    #[test]
    fn test_rejects_unknown_interface() {
        let text = r#"
interfaces:
  - name: left
    node_id: 0x1
events:
  - at_ms: 0
    interface: nowhere
    action: global
    mti: 0x5B4
    src: 0x1
"#;
        assert!(matches!(
            Scenario::from_yaml(text),
            Err(RunnerError::UnknownInterface(name)) if name == "nowhere"
        ));
    }

    #[test]
    fn test_rejects_duplicate_interface() {
        let text = r#"
interfaces:
  - name: left
    node_id: 0x1
  - name: left
    node_id: 0x2
"#;
        assert!(matches!(Scenario::from_yaml(text), Err(RunnerError::DuplicateInterface(_))));
    }

    #[test]
    fn test_rejects_bad_values() {
        let alias_zero = r#"
interfaces:
  - name: left
    node_id: 0x1
    nodes:
      - id: 0x1
        alias: 0x0
"#;
        assert!(matches!(
            Scenario::from_yaml(alias_zero),
            Err(RunnerError::Invalid { field: "nodes.alias", .. })
        ));

        let bad_frame = r#"
interfaces: []
events:
  - at_ms: 0
    action: inject
    frame: "X195B4"
"#;
        assert!(matches!(Scenario::from_yaml(bad_frame), Err(RunnerError::Frame(_))));

        let no_dst = r#"
interfaces:
  - name: left
    node_id: 0x1
events:
  - at_ms: 0
    interface: left
    action: addressed
    mti: 0x488
    src: 0x1
"#;
        assert!(matches!(
            Scenario::from_yaml(no_dst),
            Err(RunnerError::Invalid { field: "dst", .. })
        ));
    }

    #[test]
    fn test_yaml_round_trip_keeps_schedule() {
        let scenario = Scenario::from_yaml(SCENARIO).unwrap();
        let again = Scenario::from_yaml(&scenario.to_yaml().unwrap()).unwrap();
        assert_eq!(scenario.schedule().unwrap(), again.schedule().unwrap());
    }
}
