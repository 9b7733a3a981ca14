//! The behavioral probe.
//!
//! Drives a routine with synthesized inputs inside a hardened concrete
//! state and compares what comes back (output buffers, return
//! value, stdout) against a test case's expectations.

use tracing::info;

use crate::cfg::Routine;
use crate::common::Id;
use crate::emu::{CallConv, CallError, EmuError, StateOptions, Substrate};

use super::catalogue::{Arg, Expected, TestData};

/// Fixed low address where buffer inputs are laid out.
const SCRATCH_BASE: u64 = 0x1000;
/// Scratch-region granule.  The cursor advances by at least a page per
/// buffer so inputs never overlap, however large they are.
const PAGE_SIZE: u64 = 0x1000;
/// Fixed address of the read-only environment page.  Its concrete
/// contents are irrelevant, but the mapping must exist.
const ENV_PAGE: u64 = 0x4347_c000;

/// A probe borrows the substrate for the duration of one test sweep.
pub struct Probe<'e, S: Substrate> {
    emu: &'e mut S,
}

impl<'e, S: Substrate> Probe<'e, S> {
    pub fn new(emu: &'e mut S) -> Probe<'e, S> {
        Probe { emu }
    }

    /// Direct substrate access, for candidates with bespoke checks.
    pub fn emu(&mut self) -> &mut S {
        &mut *self.emu
    }

    /// Run one test case against the routine.  `true` iff the call
    /// completed concretely and every expectation held.
    pub fn test(&mut self, routine: &Routine, data: &TestData) -> bool {
        data.validate();
        let (ret, end, mapped) = match self.launch(routine, data, None) {
            Ok(out) => out,
            Err(error) => {
                info!(routine = %routine.label(), %error, "probe call failed");
                return false;
            }
        };

        for (position, expected) in data.expected_output_args.iter().enumerate() {
            let Expected::Bytes(want) = expected else {
                continue;
            };
            let got = self.emu.load_mem(&end, mapped[position], want.len());
            if self.emu.is_symbolic(&got) {
                info!(position, "symbolic memory output");
                return false;
            }
            match self.emu.bytes_of(&end, &got) {
                Ok(bytes) if bytes == *want => {}
                Ok(_) => {
                    info!(position, "output buffer mismatch");
                    return false;
                }
                Err(error) => {
                    info!(position, %error, "output buffer unreadable");
                    return false;
                }
            }
        }

        if let Some(want) = data.expected_return_val {
            if self.emu.is_symbolic(&ret) {
                info!("symbolic return value");
                return false;
            }
            let want = normalize_return(want, self.emu.arch().bits);
            match self.emu.concretize(&end, &ret) {
                Ok(got) if got == want => {}
                Ok(got) => {
                    info!(got, want, "return value mismatch");
                    return false;
                }
                Err(error) => {
                    info!(%error, "return value unreadable");
                    return false;
                }
            }
        }

        self.stdout_matches(&end, &data.expected_stdout)
    }

    /// The same pipeline without verification: run the test case and
    /// hand back the post-call state, for candidates that inspect side
    /// effects themselves.  An optional initial state lets such
    /// candidates chain several calls.
    pub fn out_state(
        &mut self,
        routine: &Routine,
        data: &TestData,
        initial: Option<&S::State>,
    ) -> Option<S::State> {
        data.validate();
        match self.launch(routine, data, initial) {
            Ok((_, end, _)) => Some(end),
            Err(error) => {
                info!(routine = %routine.label(), %error, "probe call failed");
                None
            }
        }
    }

    /// Map the inputs, build the calling convention, and perform the
    /// concrete-only call.  Returns the return-value expression, the
    /// post-call state, and the word each argument position ended up
    /// passing.
    fn launch(
        &mut self,
        routine: &Routine,
        data: &TestData,
        initial: Option<&S::State>,
    ) -> Result<(S::Expr, S::State, Vec<u64>), CallError> {
        let mut state = self.setup_state(data, initial)?;

        let mut mapped = Vec::with_capacity(data.input_args.len());
        let mut cursor = SCRATCH_BASE;
        for arg in &data.input_args {
            match arg {
                Arg::Bytes(bytes) => {
                    let mut stored = bytes.clone();
                    stored.push(0);
                    self.emu.store_mem(&mut state, cursor, &stored);
                    mapped.push(cursor);
                    cursor += (bytes.len() as u64).max(PAGE_SIZE);
                }
                Arg::Int(value) => mapped.push(*value),
            }
        }

        let cc = CallConv::word_ints(mapped.len(), self.emu.arch());
        let entry = routine.startpoint.unwrap_or(routine.entry);
        let (ret, end) = self
            .emu
            .call(entry, &cc, &mapped, state, data.max_steps)?;
        Ok((ret, end, mapped))
    }

    /// A base state hardened for concrete probing: unconstrained memory
    /// zero-fills, the solver stays strict, stdin is preloaded, the
    /// environment page is mapped, and any register still symbolic is
    /// pinned to zero.
    fn setup_state(
        &mut self,
        data: &TestData,
        initial: Option<&S::State>,
    ) -> Result<S::State, EmuError> {
        let mut state = match initial {
            Some(given) => given.clone(),
            None => self.emu.entry_state()?,
        };
        self.emu.harden(
            &mut state,
            StateOptions {
                zero_fill: true,
                strict_solver: true,
            },
        );
        self.emu.preload_stdin(&mut state, &data.preloaded_stdin);

        if initial.is_none() {
            let blob = self
                .emu
                .fresh_symbolic("env_page_data", PAGE_SIZE as u32 * 8);
            self.emu.map_readonly(&mut state, ENV_PAGE, blob);
        }

        let bits = self.emu.arch().bits;
        let regs: Vec<Id> = self.emu.arch().registers().collect();
        for reg in regs {
            let value = self.emu.load_reg(&state, reg);
            if self.emu.is_symbolic(&value) {
                let zero = self.emu.imm(0, bits);
                self.emu.store_reg(&mut state, reg, zero);
            }
        }
        Ok(state)
    }

    /// Prefix comparison of the state's stdout against the expectation.
    /// An empty expectation passes trivially.
    fn stdout_matches(&mut self, end: &S::State, expected: &[u8]) -> bool {
        let len_expr = self.emu.stdout_len(end);
        if self.emu.is_symbolic(&len_expr) {
            info!("symbolic stdout length");
            return false;
        }
        let len = match self.emu.concretize(end, &len_expr) {
            Ok(len) => len as usize,
            Err(error) => {
                info!(%error, "stdout length unreadable");
                return false;
            }
        };
        let stdout = if len == 0 {
            Vec::new()
        } else {
            let expr = self.emu.read_stdout(end, len);
            if self.emu.is_symbolic(&expr) {
                info!("symbolic stdout");
                return false;
            }
            match self.emu.bytes_of(end, &expr) {
                Ok(bytes) => bytes,
                Err(error) => {
                    info!(%error, "stdout unreadable");
                    return false;
                }
            }
        };
        let cut = stdout.len().min(expected.len());
        if stdout[..cut] != *expected {
            info!("stdout mismatch");
            return false;
        }
        true
    }
}

/// Expected return values are word-sized: negatives reinterpret modulo
/// 2^bits.
fn normalize_return(want: i64, bits: u32) -> u64 {
    (i128::from(want)).rem_euclid(1i128 << bits) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_returns_normalize_to_twos_complement() {
        assert_eq!(normalize_return(-1, 32), 0xffff_ffff);
        assert_eq!(normalize_return(-5, 32), 0xffff_fffb);
        assert_eq!(normalize_return(5, 32), 5);
        assert_eq!(normalize_return(0, 32), 0);
    }
}
