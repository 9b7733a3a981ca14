//! The identifier driver.
//!
//! Sweeps every non-syscall routine: reconstruct the frame, filter the
//! catalogue by arity and variadicity, probe the survivors, record the
//! first match.  A second, special-case pass covers the few functions
//! that only a bespoke matcher can recognize.

use tracing::{debug, warn};

use crate::cfg::Routine;
use crate::common::Map;
use crate::emu::Substrate;

use super::catalogue::{Candidate, Catalogue};
use super::frame::{reconstruct, FuncInfo};
use super::probe::Probe;

/// Randomized test cases drawn per candidate before declaring a match.
pub const NUM_TESTS: usize = 10;

/// Candidates whose semantics need the bespoke second pass: they mutate
/// allocator state instead of producing observable outputs.
const SPECIAL_CASES: [&str; 2] = ["free", "realloc"];

/// One recorded identification.
pub struct Match<S: Substrate> {
    pub name: String,
    pub candidate: Box<dyn Candidate<S>>,
}

/// Read-only view of the driver's accumulated state, handed to bespoke
/// matchers in the special-case pass.  Borrows only the caches, so a
/// probe can hold the substrate mutably at the same time.
pub struct IdentifierView<'a, S: Substrate> {
    func_info: &'a Map<u64, FuncInfo>,
    matches: &'a Map<u64, Match<S>>,
}

impl<'a, S: Substrate> IdentifierView<'a, S> {
    /// The frame summary reconstructed for a routine, if any.
    pub fn func_info(&self, entry: u64) -> Option<&'a FuncInfo> {
        self.func_info.get(&entry)
    }

    /// Every frame summary reconstructed so far, keyed by entry address.
    pub fn func_infos(&self) -> &'a Map<u64, FuncInfo> {
        self.func_info
    }

    /// The matches recorded so far, keyed by entry address.
    pub fn matches(&self) -> &'a Map<u64, Match<S>> {
        self.matches
    }
}

/// Owns the substrate, the catalogue, and everything learned during a
/// sweep.
pub struct Identifier<S: Substrate> {
    emu: S,
    catalogue: Catalogue<S>,
    func_info: Map<u64, FuncInfo>,
    matches: Map<u64, Match<S>>,
}

impl<S: Substrate> Identifier<S> {
    pub fn new(emu: S, catalogue: Catalogue<S>) -> Identifier<S> {
        Identifier {
            emu,
            catalogue,
            func_info: Map::new(),
            matches: Map::new(),
        }
    }

    /// Identify every routine.  Partial failures degrade to "no match"
    /// and never stop the sweep; each routine matches at most once.
    pub fn run(&mut self, routines: &[Routine]) -> &Map<u64, Match<S>> {
        self.emu.install_fixed_io();

        for routine in routines {
            if routine.is_syscall {
                continue;
            }
            match self.identify_routine(routine) {
                Some(found) => {
                    debug!(routine = %routine.label(), name = %found.name, "found match");
                    self.matches.insert(routine.entry, found);
                }
                None => debug!(routine = %routine.label(), "no match"),
            }
        }

        for name in SPECIAL_CASES {
            let Some(ctor) = self.catalogue.get(name) else {
                continue;
            };
            for routine in routines {
                if routine.is_syscall || self.matches.contains_key(&routine.entry) {
                    continue;
                }
                let Some(info) = self.func_info.get(&routine.entry) else {
                    continue;
                };
                let mut candidate = ctor();
                if candidate.num_args() != info.stack_args.len() {
                    continue;
                }
                let view = IdentifierView {
                    func_info: &self.func_info,
                    matches: &self.matches,
                };
                let mut probe = Probe::new(&mut self.emu);
                if candidate.try_match(routine, &view, &mut probe) {
                    debug!(routine = %routine.label(), name, "special-case match");
                    self.matches.insert(
                        routine.entry,
                        Match {
                            name: name.to_owned(),
                            candidate,
                        },
                    );
                }
            }
        }

        &self.matches
    }

    pub fn matches(&self) -> &Map<u64, Match<S>> {
        &self.matches
    }

    pub fn into_matches(self) -> Map<u64, Match<S>> {
        self.matches
    }

    /// The cached frame summary for a routine, when reconstruction
    /// succeeded.
    pub fn func_info(&self, entry: u64) -> Option<&FuncInfo> {
        self.func_info.get(&entry)
    }

    fn identify_routine(&mut self, routine: &Routine) -> Option<Match<S>> {
        if !self.func_info.contains_key(&routine.entry) {
            match reconstruct(&mut self.emu, routine) {
                Ok(info) => {
                    self.func_info.insert(routine.entry, info);
                }
                Err(error) => {
                    warn!(routine = %routine.label(), %error, "frame reconstruction failed");
                    return None;
                }
            }
        }
        let info = self.func_info[&routine.entry].clone();

        for (name, ctor) in self.catalogue.entries() {
            let mut candidate = ctor();
            if candidate.num_args() != info.stack_args.len()
                || candidate.var_args() != info.var_args
            {
                continue;
            }
            debug!(routine = %routine.label(), candidate = name, "testing");
            if Self::check(&mut self.emu, routine, candidate.as_mut()) {
                return Some(Match {
                    name: name.to_owned(),
                    candidate,
                });
            }
        }
        None
    }

    /// The generic acceptance test: the candidate's own pre-filter, then
    /// a budget of drawn test cases, each of which must pass.
    fn check(emu: &mut S, routine: &Routine, candidate: &mut dyn Candidate<S>) -> bool {
        let mut probe = Probe::new(emu);
        if !candidate.pre_test(routine, &mut probe) {
            return false;
        }
        for _ in 0..NUM_TESTS {
            let Some(data) = candidate.gen_input_output_pair() else {
                continue;
            };
            if !probe.test(routine, &data) {
                debug!(candidate = candidate.name(), "failed a drawn test");
                return false;
            }
        }
        true
    }
}

/// The single driver entry: sweep `routines` against `catalogue` on top
/// of `emu` and return the match map, keyed by routine entry address.
pub fn identify<S: Substrate>(
    emu: S,
    catalogue: Catalogue<S>,
    routines: &[Routine],
) -> Map<u64, Match<S>> {
    let mut driver = Identifier::new(emu, catalogue);
    driver.run(routines);
    driver.into_matches()
}
