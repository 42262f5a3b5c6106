//! Message type indicators.

use std::fmt;

use serde::{Deserialize, Serialize};

/// OpenLCB message type indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mti(pub u16);

impl Mti {
    pub const INITIALIZATION_COMPLETE: Mti = Mti(0x100);
    pub const VERIFY_NODE_ID_ADDRESSED: Mti = Mti(0x488);
    pub const VERIFY_NODE_ID_GLOBAL: Mti = Mti(0x490);
    pub const VERIFIED_NODE_ID: Mti = Mti(0x170);
    pub const VERIFIED_NODE_ID_SIMPLE: Mti = Mti(0x171);
    pub const OPTIONAL_INTERACTION_REJECTED: Mti = Mti(0x068);
    pub const TERMINATE_DUE_TO_ERROR: Mti = Mti(0x0A8);
    pub const PROTOCOL_SUPPORT_INQUIRY: Mti = Mti(0x828);
    pub const PROTOCOL_SUPPORT_REPLY: Mti = Mti(0x668);
    pub const IDENTIFY_CONSUMERS: Mti = Mti(0x8F4);
    pub const CONSUMER_IDENTIFIED_VALID: Mti = Mti(0x4C4);
    pub const IDENTIFY_PRODUCERS: Mti = Mti(0x914);
    pub const PRODUCER_IDENTIFIED_VALID: Mti = Mti(0x544);
    pub const EVENTS_IDENTIFY_ADDRESSED: Mti = Mti(0x968);
    pub const EVENTS_IDENTIFY_GLOBAL: Mti = Mti(0x970);
    pub const EVENT_REPORT: Mti = Mti(0x5B4);
    pub const TRACTION_CONTROL_COMMAND: Mti = Mti(0x5EB);
    pub const DATAGRAM: Mti = Mti(0x1C48);
    pub const DATAGRAM_OK: Mti = Mti(0xA28);
    pub const DATAGRAM_REJECTED: Mti = Mti(0xA48);
    pub const STREAM_DATA: Mti = Mti(0x1F88);

    /// Bit marking messages that carry a destination.
    pub const ADDRESS_PRESENT: u16 = 0x008;

    pub const fn raw(&self) -> u16 {
        self.0
    }

    pub const fn is_addressed(&self) -> bool {
        self.0 & Self::ADDRESS_PRESENT != 0
    }

    /// True if the MTI fits the 12-bit field of a message frame.
    pub const fn fits_frame(&self) -> bool {
        self.0 <= 0xFFF
    }
}

impl fmt::Display for Mti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03X}", self.0)
    }
}
