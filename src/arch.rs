//! Architecture descriptors.
//!
//! The frame heuristics in this crate target stack-based ABIs of
//! small-word general-purpose machines with an explicit frame-pointer
//! convention.  The canonical frame such a routine maintains:
//!
//! ```txt
//!   High memory addresses
//!
//!   +-------------------------+
//!   | Caller's frame          |
//!   |   ...                   |
//!   +-------------------------+
//!   | Stack arguments         |
//!   +-------------------------+
//!   | Return address          | <- SP at entry
//!   +-------------------------+
//!   | Saved frame pointer     | <- BP after the preamble
//!   +-------------------------+
//!   | Callee-saved registers  |
//!   | Local variables         |
//!   +-------------------------+ <- SP after the preamble
//!
//!   Low memory addresses
//! ```
//!
//! - The stack grows down; a `call` pushes the return address, so SP at
//!   entry points one word above the callee's own frame.
//! - Frame-pointer-based routines copy SP into BP right after saving the
//!   caller's BP; offsets into the frame are then expressed relative to
//!   BP.  SP-based routines leave BP untouched and address everything
//!   relative to SP.
//! - Stack arguments live on the caller's side of the return-address
//!   slot, one word apart.
//!
//! An [`Arch`] value carries the register-file facts the rest of the
//! crate needs: word width, the offset-keyed register-name table, which
//! registers are SP/BP/IP, and which registers start out symbolic when a
//! routine is explored.

use crate::common::*;

/// Register-file and stack conventions of one architecture.
#[derive(Clone, Debug)]
pub struct Arch {
    /// Human-readable architecture name.
    pub name: &'static str,
    /// Word size in bits.
    pub bits: u32,
    /// Stack-pointer register.
    pub sp: Id,
    /// Base-pointer (frame-pointer) register.
    pub bp: Id,
    /// Instruction-pointer register.
    pub ip: Id,
    /// Register names keyed by their offset in the register file.
    register_names: Map<u32, Id>,
    /// General-purpose registers that start out symbolic during
    /// exploration.  May include SP; [`Arch::symbolic_regs`] filters it.
    default_symbolic: Vec<Id>,
}

impl Arch {
    /// Word size in bytes.
    pub fn bytes(&self) -> u64 {
        u64::from(self.bits) / 8
    }

    /// All-ones mask of one word.
    pub fn word_mask(&self) -> u64 {
        if self.bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }

    /// Resolve a register-file offset to a register name.
    ///
    /// Side effects report sub-register offsets (a write to `ah` lands
    /// one past `eax`), so the lookup walks the offset downward up to a
    /// word before giving up.
    pub fn reg_name(&self, offset: u32) -> Option<Id> {
        let floor = i64::from(offset) - self.bytes() as i64;
        let mut at = i64::from(offset);
        while at >= 0 && at >= floor {
            if let Some(name) = self.register_names.get(&(at as u32)) {
                return Some(*name);
            }
            at -= 1;
        }
        None
    }

    /// Every named register, in register-file order.
    pub fn registers(&self) -> impl Iterator<Item = Id> + '_ {
        self.register_names.values().copied()
    }

    /// Register-file offset of a named register.
    pub fn reg_offset(&self, name: Id) -> Option<u32> {
        self.register_names
            .iter()
            .find(|(_, reg)| **reg == name)
            .map(|(off, _)| *off)
    }

    /// The default-symbolic register list minus SP and IP: the registers
    /// the frame reconstructor works over.
    pub fn symbolic_regs(&self) -> Vec<Id> {
        self.default_symbolic
            .iter()
            .copied()
            .filter(|r| *r != self.sp && *r != self.ip)
            .collect()
    }

    /// 32-bit x86, with the conventional register-file offsets.
    pub fn i386() -> Arch {
        let table = [
            (8, "eax"),
            (12, "ecx"),
            (16, "edx"),
            (20, "ebx"),
            (24, "esp"),
            (28, "ebp"),
            (32, "esi"),
            (36, "edi"),
            (68, "eip"),
        ];
        Arch {
            name: "i386",
            bits: 32,
            sp: id("esp"),
            bp: id("ebp"),
            ip: id("eip"),
            register_names: table.iter().map(|(off, r)| (*off, id(r))).collect(),
            default_symbolic: ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"]
                .iter()
                .map(|r| id(r))
                .collect(),
        }
    }
}
