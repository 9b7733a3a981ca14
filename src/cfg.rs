//! Input types recovered from a control-flow graph.
//!
//! CFG construction itself happens upstream; the identifier consumes
//! routines that are already carved into basic blocks.  Instruction
//! streams are not stored here; blocks are decoded on demand through
//! the emulator substrate.

use crate::common::*;
use crate::emu::JumpKind;

/// One routine of the analyzed program.  Immutable during
/// identification.
#[derive(Clone, Debug)]
pub struct Routine {
    /// Entry address; also the routine's identity.
    pub entry: u64,
    /// Symbolic name, when the CFG recovery knew one.
    pub name: Option<String>,
    /// Syscall stubs are never identified.
    pub is_syscall: bool,
    /// Address of the discovered entry block, if any.
    pub startpoint: Option<u64>,
    /// Addresses of every basic block belonging to the routine.
    pub block_addrs: Set<u64>,
    /// Addresses of the blocks the routine can end at.
    pub endpoints: Set<u64>,
}

impl Routine {
    /// How the routine shows up in diagnostics: its name when known,
    /// its entry address otherwise.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{name} at {:#x}", self.entry),
            None => format!("{:#x}", self.entry),
        }
    }
}

/// A decoded basic block.
#[derive(Clone, Debug)]
pub struct Block {
    /// Address of the first instruction.
    pub addr: u64,
    /// Addresses of every instruction in the block, in order.
    pub instruction_addrs: Vec<u64>,
    /// Size of the block in bytes.
    pub size: u64,
    /// Control-flow kind of the block's terminator.
    pub terminator: JumpKind,
}

impl Block {
    /// Number of instructions in the block.
    pub fn instructions(&self) -> usize {
        self.instruction_addrs.len()
    }
}
