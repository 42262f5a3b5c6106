//! CAN frames, the OpenLCB identifier layout, and the GridConnect text form.
//!
//! ## Extended identifier layout
//!
//! | Bits  | Message frame          | Control frame                         |
//! |-------|------------------------|---------------------------------------|
//! | 28    | always 1               | always 1                              |
//! | 27    | 1                      | 0                                     |
//! | 24-26 | frame type             | 7..4: Check-ID sequence, 0: other     |
//! | 12-23 | MTI                    | CID: Node ID segment, 0: control type |
//! | 0-11  | source alias           | source alias                          |
//!
//! ## GridConnect
//!
//! `:X195B422AN0102030405060708;` is an extended frame with id `0x195B422A`
//! and eight data bytes. `S` replaces `X` for standard frames and `R`
//! replaces `N` for remote frames.

use std::fmt;
use std::str::FromStr;

use crate::error::FrameError;
use crate::mti::Mti;
use crate::node::NodeAlias;

/// A classic CAN frame of at most eight data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    rtr: bool,
    len: u8,
    data: [u8; 8],
}

impl CanFrame {
    pub const MAX_DATA: usize = 8;
    const EXT_ID_MAX: u32 = 0x1FFF_FFFF;
    const STD_ID_MAX: u32 = 0x7FF;

    /// An extended (29-bit) data frame.
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self, FrameError> {
        if id > Self::EXT_ID_MAX {
            return Err(FrameError::IdOutOfRange { id, bits: 29 });
        }
        Self::build(id, true, false, data)
    }

    /// A standard (11-bit) data frame.
    pub fn new_standard(id: u32, data: &[u8]) -> Result<Self, FrameError> {
        if id > Self::STD_ID_MAX {
            return Err(FrameError::IdOutOfRange { id, bits: 11 });
        }
        Self::build(id, false, false, data)
    }

    /// Mark the frame as a remote transmission request.
    pub fn with_rtr(mut self) -> Self {
        self.rtr = true;
        self
    }

    fn build(id: u32, extended: bool, rtr: bool, data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > Self::MAX_DATA {
            return Err(FrameError::DataTooLong { len: data.len() });
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Ok(CanFrame {
            id,
            extended,
            rtr,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Extended frame from parts the stack built itself; data beyond eight
    /// bytes is cut off.
    pub(crate) fn eff(id: u32, data: &[u8]) -> Self {
        debug_assert!(data.len() <= Self::MAX_DATA, "frame data too long");
        let len = data.len().min(Self::MAX_DATA);
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(&data[..len]);
        CanFrame {
            id: id & Self::EXT_ID_MAX,
            extended: true,
            rtr: false,
            len: len as u8,
            data: buf,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn is_rtr(&self) -> bool {
        self.rtr
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Source alias in the low twelve bits.
    pub fn source(&self) -> NodeAlias {
        NodeAlias::new((self.id & 0xFFF) as u16)
    }

    /// Decode the OpenLCB meaning of the identifier. `None` for standard frames.
    pub fn kind(&self) -> Option<FrameKind> {
        self.extended.then(|| FrameKind::decode(self.id))
    }

    /// GridConnect text form.
    pub fn to_gridconnect(&self) -> String {
        let mut out = String::with_capacity(30);
        out.push(':');
        if self.extended {
            out.push('X');
            out.push_str(&format!("{:08X}", self.id));
        } else {
            out.push('S');
            out.push_str(&format!("{:03X}", self.id));
        }
        out.push(if self.rtr { 'R' } else { 'N' });
        out.push_str(&hex::encode_upper(self.data()));
        out.push(';');
        out
    }

    /// Parse one GridConnect frame. Surrounding whitespace is ignored.
    pub fn from_gridconnect(text: &str) -> Result<Self, FrameError> {
        let malformed = || FrameError::Malformed(text.to_string());
        let body = text
            .trim()
            .strip_prefix(':')
            .and_then(|s| s.strip_suffix(';'))
            .ok_or_else(malformed)?;

        let mut chars = body.chars();
        let extended = match chars.next() {
            Some('X') | Some('x') => true,
            Some('S') | Some('s') => false,
            _ => return Err(malformed()),
        };
        let rest = chars.as_str();
        let split = rest
            .find(|c: char| matches!(c, 'N' | 'n' | 'R' | 'r'))
            .ok_or_else(malformed)?;
        let (id_text, tail) = rest.split_at(split);
        let rtr = matches!(tail.as_bytes()[0], b'R' | b'r');
        let data_text = &tail[1..];

        let max_digits = if extended { 8 } else { 3 };
        if id_text.is_empty() || id_text.len() > max_digits {
            return Err(malformed());
        }
        let id = u32::from_str_radix(id_text, 16)
            .map_err(|_| FrameError::InvalidHex(id_text.to_string()))?;
        let data = hex::decode(data_text).map_err(|_| FrameError::InvalidHex(data_text.to_string()))?;

        let frame = if extended {
            Self::new_extended(id, &data)?
        } else {
            Self::new_standard(id, &data)?
        };
        Ok(if rtr { frame.with_rtr() } else { frame })
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_gridconnect())
    }
}

impl FromStr for CanFrame {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_gridconnect(s)
    }
}

// ============================================================================
// Identifier codec
// ============================================================================

const PRIORITY_BIT: u32 = 1 << 28;
const MESSAGE_BIT: u32 = 1 << 27;

/// CAN control frames other than Check-ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    /// Reserve ID.
    Rid,
    /// Alias map definition.
    Amd,
    /// Alias map enquiry.
    Ame,
    /// Alias map reset.
    Amr,
    /// A control value this stack does not know.
    Other(u16),
}

impl ControlType {
    fn code(&self) -> u16 {
        match self {
            ControlType::Rid => 0x700,
            ControlType::Amd => 0x701,
            ControlType::Ame => 0x702,
            ControlType::Amr => 0x703,
            ControlType::Other(v) => *v,
        }
    }

    fn from_code(code: u16) -> Self {
        match code {
            0x700 => ControlType::Rid,
            0x701 => ControlType::Amd,
            0x702 => ControlType::Ame,
            0x703 => ControlType::Amr,
            other => ControlType::Other(other),
        }
    }
}

/// Frame types of message frames (bits 24-26).
pub mod frame_type {
    pub const GLOBAL_ADDRESSED: u8 = 1;
    pub const DATAGRAM_ONLY: u8 = 2;
    pub const DATAGRAM_FIRST: u8 = 3;
    pub const DATAGRAM_MIDDLE: u8 = 4;
    pub const DATAGRAM_FINAL: u8 = 5;
    pub const STREAM: u8 = 7;
}

/// What an extended identifier means to OpenLCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Check-ID frame `seq` (7..=4) carrying a 12-bit Node ID segment.
    CheckId { seq: u8, segment: u16 },
    /// RID, AMD, AME, AMR.
    Control(ControlType),
    /// Message frame; `mti` is only meaningful for frame type 1.
    Message { frame_type: u8, mti: Mti },
}

impl FrameKind {
    pub fn decode(id: u32) -> Self {
        let variable = ((id >> 12) & 0xFFF) as u16;
        let type_bits = ((id >> 24) & 0x7) as u8;
        if id & MESSAGE_BIT != 0 {
            FrameKind::Message {
                frame_type: type_bits,
                mti: Mti(variable),
            }
        } else if type_bits >= 4 {
            FrameKind::CheckId {
                seq: type_bits,
                segment: variable,
            }
        } else {
            FrameKind::Control(ControlType::from_code(variable))
        }
    }

    pub fn is_check_id(&self) -> bool {
        matches!(self, FrameKind::CheckId { .. })
    }
}

/// Identifier of Check-ID frame `seq` for `src`.
pub fn cid_id(seq: u8, segment: u16, src: NodeAlias) -> u32 {
    PRIORITY_BIT
        | (u32::from(seq & 0x7) << 24)
        | (u32::from(segment & 0xFFF) << 12)
        | u32::from(src.raw())
}

/// Identifier of a RID/AMD/AME/AMR frame from `src`.
pub fn control_id(control: ControlType, src: NodeAlias) -> u32 {
    PRIORITY_BIT | (u32::from(control.code() & 0xFFF) << 12) | u32::from(src.raw())
}

/// Identifier of a global or addressed message frame from `src`.
pub fn message_id(mti: Mti, src: NodeAlias) -> u32 {
    PRIORITY_BIT
        | MESSAGE_BIT
        | (u32::from(frame_type::GLOBAL_ADDRESSED) << 24)
        | (u32::from(mti.raw() & 0xFFF) << 12)
        | u32::from(src.raw())
}
