//! The substrate contract and the helpers built directly on it.

use thiserror::Error;

use crate::arch::Arch;
use crate::cfg::Block;
use crate::common::Id;

use super::action::{Action, JumpKind};
use super::callconv::CallConv;

/// Substrate-level failures.  Always caught at the nearest enclosing
/// operation: per routine during reconstruction, per test during
/// probing.
#[derive(Debug, Error)]
pub enum EmuError {
    #[error("decode failed at {0:#x}")]
    Decode(u64),
    #[error("no successor state at {0:#x}")]
    NoSuccessor(u64),
    #[error("solver failure: {0}")]
    Solver(String),
    #[error("emulator fault: {0}")]
    Fault(String),
}

/// Failure modes of a concrete-only emulated call.
#[derive(Debug, Error)]
pub enum CallError {
    /// Execution would have forked.  A concrete-only call refuses to
    /// branch, so this is a failure signal rather than a search space.
    #[error("emulated call branched")]
    Multistate,
    #[error(transparent)]
    Emul(#[from] EmuError),
}

/// Per-state solver behavior knobs.
#[derive(Clone, Copy, Debug, Default)]
pub struct StateOptions {
    /// Fill unconstrained memory with zeroes instead of fresh symbols.
    pub zero_fill: bool,
    /// Disable lazy and simplifying solver modes that would mask
    /// concrete mismatches.
    pub strict_solver: bool,
}

/// Result of stepping a state: the successor, how control flow left the
/// stepped range, and the side effects in program order.
#[derive(Clone, Debug)]
pub struct StepOut<E, St> {
    pub state: St,
    pub kind: JumpKind,
    pub actions: Vec<Action<E>>,
}

/// The symbolic-execution substrate.
///
/// `Expr` values are immutable symbolic bitvectors; whether one is
/// concrete under a state's constraints is a solver question
/// ([`Substrate::concretize`], [`Substrate::solutions`]), while
/// [`Substrate::is_symbolic`] and [`Substrate::simplify`] are structural
/// and ignore constraints.  The split matters: classifying an address as
/// "still depends on another register" must survive constraints that pin
/// that register to a single value.
pub trait Substrate {
    type Expr: Clone;
    type State: Clone;

    fn arch(&self) -> &Arch;

    /// Create a named symbolic bitvector.
    fn fresh_symbolic(&mut self, name: &str, bits: u32) -> Self::Expr;
    /// A concrete word.
    fn imm(&self, value: u64, bits: u32) -> Self::Expr;
    fn sub(&self, lhs: &Self::Expr, rhs: &Self::Expr) -> Self::Expr;
    /// An equality condition usable with [`Substrate::add_constraint`].
    fn eq(&self, lhs: &Self::Expr, rhs: &Self::Expr) -> Self::Expr;
    /// A stable structural fingerprint.  Two expressions with the same
    /// fingerprint are the same value; fresh symbols fingerprint
    /// distinctly.
    fn fingerprint(&self, expr: &Self::Expr) -> u64;
    /// Does the expression depend on the named symbol?
    fn mentions(&self, expr: &Self::Expr, name: &str) -> bool;
    /// Structural simplification; never consults state constraints.
    fn simplify(&self, expr: &Self::Expr) -> Self::Expr;
    /// Structurally symbolic: mentions at least one free symbol.
    fn is_symbolic(&self, expr: &Self::Expr) -> bool;

    /// A concrete value of the expression under the state's constraints.
    fn concretize(&self, state: &Self::State, expr: &Self::Expr) -> Result<u64, EmuError>;
    /// Up to `cap` distinct concrete values under the state's
    /// constraints.
    fn solutions(
        &self,
        state: &Self::State,
        expr: &Self::Expr,
        cap: usize,
    ) -> Result<Vec<u64>, EmuError>;
    /// Concrete bytes of a byte-blob expression under the state's
    /// constraints.
    fn bytes_of(&self, state: &Self::State, expr: &Self::Expr) -> Result<Vec<u8>, EmuError>;

    /// A fresh state with concrete-suitable SP and IP.
    fn entry_state(&mut self) -> Result<Self::State, EmuError>;
    /// Apply solver behavior knobs to an existing state.
    fn harden(&self, state: &mut Self::State, opts: StateOptions);
    fn add_constraint(&self, state: &mut Self::State, cond: Self::Expr);
    fn load_reg(&self, state: &Self::State, reg: Id) -> Self::Expr;
    fn store_reg(&self, state: &mut Self::State, reg: Id, value: Self::Expr);
    fn load_mem(&self, state: &Self::State, addr: u64, len: usize) -> Self::Expr;
    fn store_mem(&self, state: &mut Self::State, addr: u64, data: &[u8]);
    fn set_ip(&self, state: &mut Self::State, addr: u64);
    /// Map a read-only region at `addr` seeded with `data`.
    fn map_readonly(&mut self, state: &mut Self::State, addr: u64, data: Self::Expr);
    /// Seed the state's single input stream.
    fn preload_stdin(&self, state: &mut Self::State, bytes: &[u8]);
    /// Number of bytes written to the state's output stream so far.
    fn stdout_len(&self, state: &Self::State) -> Self::Expr;
    /// The first `len` bytes of the state's output stream.
    fn read_stdout(&self, state: &Self::State, len: usize) -> Self::Expr;

    /// Step `num_inst` instructions (a whole block when `None`) from the
    /// state's IP, reporting the first successor and its side effects.
    fn step(
        &mut self,
        state: &Self::State,
        num_inst: Option<usize>,
    ) -> Result<StepOut<Self::Expr, Self::State>, EmuError>;
    /// Decode the block starting at `addr`, truncated to `num_inst`
    /// instructions when given.
    fn block(&mut self, addr: u64, num_inst: Option<usize>) -> Result<Block, EmuError>;

    /// Invoke the routine at `entry` with concrete word arguments,
    /// refusing to branch and capped at `max_steps` instructions.
    /// Returns the return-value expression and the post-call state.
    fn call(
        &mut self,
        entry: u64,
        cc: &CallConv,
        args: &[u64],
        base: Self::State,
        max_steps: u64,
    ) -> Result<(Self::Expr, Self::State), CallError>;

    /// Replace the platform's transmit/receive primitives with fixed
    /// concrete variants that talk to the state's stdin/stdout buffers.
    /// Process-wide; invoked once before any probe runs.
    fn install_fixed_io(&mut self);
}

/// A state whose listed registers hold fresh, distinct symbols, ready
/// for exploration.  SP and IP keep their concrete-suitable values from
/// [`Substrate::entry_state`].
pub fn make_symbolic_initial_state<S: Substrate>(
    emu: &mut S,
    regs: &[Id],
    namer: &mut Namer,
) -> Result<S::State, EmuError> {
    let bits = emu.arch().bits;
    let mut state = emu.entry_state()?;
    for &reg in regs {
        let sym = emu.fresh_symbolic(&namer.fresh(&format!("sreg_{reg}")), bits);
        emu.store_reg(&mut state, reg, sym);
    }
    Ok(state)
}

/// Mints symbol names unique to one reconstruction.  Substrates intern
/// names, so two routines must never mint the same one.
#[derive(Debug)]
pub struct Namer {
    routine: u64,
    next: u32,
}

impl Namer {
    pub fn new(routine: u64) -> Namer {
        Namer { routine, next: 0 }
    }

    /// `stem`, tagged with the routine and a serial number.
    pub fn fresh(&mut self, stem: &str) -> String {
        let serial = self.next;
        self.next += 1;
        format!("{stem}_{:x}_{serial}", self.routine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namer_never_repeats_within_a_routine() {
        let mut namer = Namer::new(0x8048000);
        let a = namer.fresh("sym_sp");
        let b = namer.fresh("sym_sp");
        assert_ne!(a, b);
    }

    #[test]
    fn namer_tags_the_routine() {
        let mut at_a = Namer::new(0x1000);
        let mut at_b = Namer::new(0x2000);
        assert_ne!(at_a.fresh("sreg_eax"), at_b.fresh("sreg_eax"));
    }
}
