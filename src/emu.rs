//! The emulator adapter: a thin contract over the symbolic-execution
//! substrate.
//!
//! The reconstructor and the probe depend only on the operations defined
//! here.  Any engine offering symbolic bitvectors, states with observable
//! memory/register side effects, and a concrete-only call facility can
//! back them.

pub mod action;
pub mod callconv;
pub mod substrate;

pub use action::*;
pub use callconv::*;
pub use substrate::*;
