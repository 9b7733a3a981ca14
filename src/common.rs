//! Common definitions that are shared between different parts of the
//! identifier.

// Use sorted sets and maps so every sweep over recovered state is
// reproducible run to run.
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Interned names: register names and symbolic-bitvector stems.
pub type Id = internment::Intern<String>;

/// Intern a name.
pub fn id(name: &str) -> Id {
    Id::new(name.to_owned())
}
