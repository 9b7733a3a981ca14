//! The candidate-catalogue interface.
//!
//! A candidate describes one well-known library function: its arity,
//! whether it is variadic, how to synthesize test cases for it, and (for
//! the few functions whose behavior input/output pairs cannot capture)
//! a bespoke matcher.  The catalogue of actual candidates
//! lives with the caller; this crate only consumes the interface.

use crate::cfg::Routine;
use crate::emu::Substrate;

use super::driver::IdentifierView;
use super::probe::Probe;

/// Input passed to the probed routine at one argument position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    /// Passed verbatim.
    Int(u64),
    /// Stored NUL-terminated into scratch memory; the routine receives
    /// the buffer's address.
    Bytes(Vec<u8>),
}

/// What one argument position must hold after the call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expected {
    /// Don't care.
    Ignore,
    /// Exactly these bytes in the memory the corresponding buffer input
    /// pointed to.
    Bytes(Vec<u8>),
}

/// One synthesized test case: inputs to hand the routine, and the
/// behavior expected back.
#[derive(Clone, Debug)]
pub struct TestData {
    pub input_args: Vec<Arg>,
    /// Same length as `input_args`.
    pub expected_output_args: Vec<Expected>,
    /// Negative values are reinterpreted modulo 2^W at check time.
    pub expected_return_val: Option<i64>,
    /// Bytes waiting on the routine's input stream.
    pub preloaded_stdin: Vec<u8>,
    /// Expected prefix of the routine's output stream.
    pub expected_stdout: Vec<u8>,
    /// Hard cap on emulated instructions.
    pub max_steps: u64,
}

impl TestData {
    pub fn new(
        input_args: Vec<Arg>,
        expected_output_args: Vec<Expected>,
        expected_return_val: Option<i64>,
        max_steps: u64,
    ) -> TestData {
        TestData {
            input_args,
            expected_output_args,
            expected_return_val,
            preloaded_stdin: Vec::new(),
            expected_stdout: Vec::new(),
            max_steps,
        }
    }

    /// Abort on malformed test data.  These are bugs in a candidate's
    /// generator, not probe misses, so they panic instead of degrading
    /// to "no match".
    pub fn validate(&self) {
        assert_eq!(
            self.input_args.len(),
            self.expected_output_args.len(),
            "test case must pair every input with an expected output"
        );
        assert!(self.max_steps > 0, "test case needs a positive step cap");
        for (position, expected) in self.expected_output_args.iter().enumerate() {
            if let Expected::Bytes(bytes) = expected {
                assert!(
                    !bytes.is_empty(),
                    "empty expected output at position {position}"
                );
                assert!(
                    matches!(self.input_args[position], Arg::Bytes(_)),
                    "expected output at position {position} needs a buffer input to read back"
                );
            }
        }
    }
}

/// A specification of one known library function.
pub trait Candidate<S: Substrate> {
    fn name(&self) -> &str;

    /// Number of word-sized stack arguments.
    fn num_args(&self) -> usize;

    /// Does the function take a variadic tail?
    fn var_args(&self) -> bool {
        false
    }

    /// A randomized, self-consistent test case.  `None` means "no
    /// opinion on this draw, skip it".  Candidates wanting reproducible
    /// runs draw from their own seeded source.
    fn gen_input_output_pair(&mut self) -> Option<TestData>;

    /// Cheap custom filter consulted before the generic probing; `false`
    /// rejects the routine outright.
    fn pre_test(&mut self, routine: &Routine, probe: &mut Probe<'_, S>) -> bool {
        let _ = (routine, probe);
        true
    }

    /// Bespoke matcher for functions whose semantics input/output pairs
    /// cannot capture (allocator bookkeeping and the like).  Only
    /// consulted during the driver's special-case pass.  `ident` exposes
    /// everything the sweep has learned so far, so a matcher can
    /// correlate against other routines' frames and matches.
    fn try_match(
        &mut self,
        routine: &Routine,
        ident: &IdentifierView<'_, S>,
        probe: &mut Probe<'_, S>,
    ) -> bool {
        let _ = (routine, ident, probe);
        false
    }
}

/// Constructor producing a fresh candidate instance.
pub type Constructor<S> = fn() -> Box<dyn Candidate<S>>;

/// Ordered registry of candidate constructors.  Iteration order is
/// registration order, and therefore stable across runs.
pub struct Catalogue<S: Substrate> {
    entries: Vec<(String, Constructor<S>)>,
}

impl<S: Substrate> Catalogue<S> {
    pub fn new() -> Catalogue<S> {
        Catalogue {
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, name: &str, ctor: Constructor<S>) {
        self.entries.push((name.to_owned(), ctor));
    }

    /// Look a candidate up by name.
    pub fn get(&self, name: &str) -> Option<Constructor<S>> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, ctor)| *ctor)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, Constructor<S>)> + '_ {
        self.entries
            .iter()
            .map(|(name, ctor)| (name.as_str(), *ctor))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Substrate> Default for Catalogue<S> {
    fn default() -> Catalogue<S> {
        Catalogue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_a_well_formed_case() {
        let mut data = TestData::new(
            vec![Arg::Bytes(b"abc".to_vec()), Arg::Int(3)],
            vec![Expected::Bytes(b"abc".to_vec()), Expected::Ignore],
            Some(0),
            1000,
        );
        data.expected_stdout = b"x".to_vec();
        data.validate();
    }

    #[test]
    #[should_panic(expected = "pair every input")]
    fn validate_rejects_length_mismatch() {
        TestData::new(vec![Arg::Int(1)], vec![], None, 1000).validate();
    }

    #[test]
    #[should_panic(expected = "needs a buffer input")]
    fn validate_rejects_expected_output_without_buffer() {
        TestData::new(
            vec![Arg::Int(7)],
            vec![Expected::Bytes(b"x".to_vec())],
            None,
            1000,
        )
        .validate();
    }

    #[test]
    #[should_panic(expected = "empty expected output")]
    fn validate_rejects_empty_expected_output() {
        TestData::new(
            vec![Arg::Bytes(b"x".to_vec())],
            vec![Expected::Bytes(Vec::new())],
            None,
            1000,
        )
        .validate();
    }
}
