//! Guest-visible custom instructions.
//!
//! ```text
//! x86: 0x0F 0x3F 0x00 OP SUB 0x00 0x00 0x00 0x00 0x00   (10 bytes)
//! ARM: 0xFF OP SUB 0x00                                 (4 bytes)
//! ```
//!
//! `OP` selects the plugin, `SUB` the plugin-specific function.

use crate::config::types::OpcodeFlavor;

/// Main opcode owned by the state manager
pub const STATE_MANAGER_OPCODE: u8 = 0xAD;

/// Where the opcode bytes sit in the raw operand, and how long the
/// instruction is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpcodeLayout {
    pub op_shift: u32,
    pub subop_shift: u32,
    pub size: u64,
}

impl OpcodeLayout {
    pub const X86: OpcodeLayout = OpcodeLayout {
        op_shift: 8,
        subop_shift: 16,
        size: 2 + 8,
    };

    pub const ARM: OpcodeLayout = OpcodeLayout {
        op_shift: 16,
        subop_shift: 8,
        size: 2 + 2,
    };

    pub fn for_flavor(flavor: OpcodeFlavor) -> Self {
        match flavor {
            OpcodeFlavor::X86 => Self::X86,
            OpcodeFlavor::Arm => Self::ARM,
        }
    }

    pub fn matches(&self, operand: u64, opcode: u8) -> bool {
        ((operand >> self.op_shift) & 0xFF) as u8 == opcode
    }

    pub fn subfunction(&self, operand: u64) -> u8 {
        ((operand >> self.subop_shift) & 0xFF) as u8
    }

    /// Raw operand for `opcode`/`subfunction` in this layout
    pub fn encode(&self, opcode: u8, subfunction: u8) -> u64 {
        ((opcode as u64) << self.op_shift) | ((subfunction as u64) << self.subop_shift)
    }
}

/// State manager sub-functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateManagerOp {
    /// Mark the calling state succeeded; status code in the status register
    Succeed,
    /// Write the fleet-wide succeeded-state count into the status register
    GetSuccessfulStateCount,
}

impl StateManagerOp {
    pub fn from_subfunction(sub: u8) -> Option<Self> {
        match sub {
            0 => Some(StateManagerOp::Succeed),
            1 => Some(StateManagerOp::GetSuccessfulStateCount),
            _ => None,
        }
    }

    pub fn subfunction(self) -> u8 {
        match self {
            StateManagerOp::Succeed => 0,
            StateManagerOp::GetSuccessfulStateCount => 1,
        }
    }
}
