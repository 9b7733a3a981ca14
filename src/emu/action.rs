//! Side-effect records observed while stepping.

use derive_more::Display;

/// Control-flow kind that terminated a step or a block.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum JumpKind {
    #[display("call")]
    Call,
    #[display("ret")]
    Ret,
    #[display("fallthrough")]
    Fallthrough,
    /// The successor's instruction pointer could not be pinned down.
    #[display("unconstrained")]
    Unconstrained,
}

/// How a location was touched.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
pub enum Access {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
    /// The location's address was materialized into a register, as in
    /// `lea`-style address-of patterns.  Never produced by the substrate
    /// itself; the reconstructor records it for slots it saw taken by
    /// address.
    #[display("load")]
    Load,
}

/// One side effect performed during a step, annotated with the address
/// of the instruction that performed it.
#[derive(Clone, Debug)]
pub enum Action<E> {
    /// A memory access at a (possibly symbolic) address.
    Mem {
        access: Access,
        addr: E,
        data: E,
        ins_addr: u64,
    },
    /// A register access; `offset` keys the architecture's register
    /// table.
    Reg {
        access: Access,
        offset: u32,
        data: E,
        ins_addr: u64,
    },
}

impl<E> Action<E> {
    /// Address of the instruction that performed the effect.
    pub fn ins_addr(&self) -> u64 {
        match self {
            Action::Mem { ins_addr, .. } | Action::Reg { ins_addr, .. } => *ins_addr,
        }
    }
}
