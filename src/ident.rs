//! Identification of library functions in recovered routines.
//!
//! [`frame`] rebuilds a routine's stack-frame summary, [`probe`] runs
//! the routine on synthesized inputs, [`catalogue`] defines what a
//! candidate function must provide, and [`driver`] sweeps a whole
//! program's routines against a catalogue.

pub mod catalogue;
pub mod driver;
pub mod frame;
pub mod probe;

pub use catalogue::*;
pub use driver::*;
pub use frame::*;
pub use probe::*;
