//! Guest program model for the simulated interpreter.
//!
//! A program is a map from guest pc to instruction. Ordinary instructions are
//! one byte wide; custom instructions take the width of the opcode layout so
//! pc arithmetic matches real guests.

use crate::core::opcodes::{OpcodeLayout, StateManagerOp, STATE_MANAGER_OPCODE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Insn {
    /// Start of a basic block
    Block,
    /// Symbolic branch: the running state continues at the first target,
    /// one new state is forked for every other target
    Fork(Vec<u64>),
    /// Raw custom-instruction operand
    Custom(u64),
    SetReg { reg: usize, value: u64 },
    Jump(u64),
    /// Path ends normally
    Exit,
}

/// How one path of a [`Program::fan_out`] program ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PathEnd {
    /// Signal success with the path index as status
    Succeed,
    /// Terminate without signalling
    Exit,
    /// Loop forever over an already covered block
    Spin,
}

#[derive(Clone, Debug)]
pub struct Program {
    insns: BTreeMap<u64, Insn>,
    entry: u64,
    layout: OpcodeLayout,
}

impl Program {
    /// Single block that exits immediately.
    pub fn idle(layout: OpcodeLayout) -> Self {
        let mut builder = ProgramBuilder::new(layout);
        builder.emit(Insn::Block);
        builder.emit(Insn::Exit);
        builder.build()
    }

    /// One entry block followed by a symbolic branch into `paths.len()`
    /// independent paths, each ending as described.
    pub fn fan_out(layout: OpcodeLayout, paths: &[PathEnd]) -> Self {
        let mut builder = ProgramBuilder::new(layout);
        builder.emit(Insn::Block);
        let fork = builder.emit(Insn::Fork(Vec::new()));

        let mut targets = Vec::with_capacity(paths.len());
        for (index, end) in paths.iter().enumerate() {
            let start = builder.emit(Insn::Block);
            targets.push(start);
            match end {
                PathEnd::Succeed => {
                    builder.emit(Insn::SetReg {
                        reg: 0,
                        value: index as u64,
                    });
                    builder.emit_state_manager(StateManagerOp::Succeed);
                    builder.emit(Insn::Exit);
                }
                PathEnd::Exit => {
                    builder.emit(Insn::Exit);
                }
                PathEnd::Spin => {
                    builder.emit(Insn::Jump(start));
                }
            }
        }

        if targets.is_empty() {
            builder.patch(fork, Insn::Exit);
        } else {
            builder.patch(fork, Insn::Fork(targets));
        }
        builder.build()
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn layout(&self) -> OpcodeLayout {
        self.layout
    }

    pub fn fetch(&self, pc: u64) -> Option<&Insn> {
        self.insns.get(&pc)
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }
}

/// Lays instructions out at consecutive addresses.
#[derive(Debug)]
pub struct ProgramBuilder {
    insns: BTreeMap<u64, Insn>,
    next: u64,
    entry: u64,
    layout: OpcodeLayout,
}

impl ProgramBuilder {
    pub fn new(layout: OpcodeLayout) -> Self {
        Self {
            insns: BTreeMap::new(),
            next: 0,
            entry: 0,
            layout,
        }
    }

    pub fn here(&self) -> u64 {
        self.next
    }

    /// Append an instruction, returning its address.
    pub fn emit(&mut self, insn: Insn) -> u64 {
        let addr = self.next;
        self.next += match insn {
            Insn::Custom(_) => self.layout.size,
            _ => 1,
        };
        self.insns.insert(addr, insn);
        addr
    }

    pub fn emit_state_manager(&mut self, op: StateManagerOp) -> u64 {
        let raw = self.layout.encode(STATE_MANAGER_OPCODE, op.subfunction());
        self.emit(Insn::Custom(raw))
    }

    /// Replace a placeholder emitted earlier. Widths must match.
    pub fn patch(&mut self, addr: u64, insn: Insn) {
        self.insns.insert(addr, insn);
    }

    pub fn entry_at(&mut self, addr: u64) {
        self.entry = addr;
    }

    pub fn build(self) -> Program {
        Program {
            insns: self.insns,
            entry: self.entry,
            layout: self.layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_insn_takes_layout_width() {
        let mut builder = ProgramBuilder::new(OpcodeLayout::X86);
        let custom = builder.emit_state_manager(StateManagerOp::Succeed);
        let after = builder.emit(Insn::Exit);
        assert_eq!(after - custom, OpcodeLayout::X86.size);
    }

    #[test]
    fn test_fan_out_branches_to_every_path() {
        let program = Program::fan_out(
            OpcodeLayout::ARM,
            &[PathEnd::Succeed, PathEnd::Exit, PathEnd::Spin],
        );
        let Some(Insn::Fork(targets)) = program.fetch(1) else {
            panic!("expected a fork at pc 1");
        };
        assert_eq!(targets.len(), 3);
        for target in targets {
            assert_eq!(program.fetch(*target), Some(&Insn::Block));
        }
        let spin = targets[2];
        assert_eq!(program.fetch(spin + 1), Some(&Insn::Jump(spin)));
    }
}
