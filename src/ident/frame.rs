//! Stack-frame reconstruction.
//!
//! From a routine's entry block and body, recover where the preamble
//! ends, which callee-saved registers it pushes, how large the frame
//! is, and which stack slots the body touches, classified as scalars or
//! buffers and split into locals and caller-side arguments.
//!
//! The reconstruction never decompiles anything.  It steps the routine
//! symbolically: the preamble boundary falls out of watching the stack
//! pointer settle, pushed registers out of matching store data against
//! the entry-time register symbols, and stack slots out of substituting
//! a named symbol for SP (and BP, in frame-pointer routines) and
//! watching which accesses depend on it.

use thiserror::Error;
use tracing::debug;

use crate::cfg::Routine;
use crate::common::*;
use crate::emu::{
    make_symbolic_initial_state, Access, Action, EmuError, JumpKind, Namer, StepOut, Substrate,
};

/// Structural summary of one routine's stack frame.  Produced once per
/// routine and immutable afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FuncInfo {
    /// Bytes between the entry SP and the lowest SP inside the body,
    /// excluding the return-address slot.
    pub frame_size: u64,
    /// Callee-saved registers stored by the preamble, first-pushed
    /// first.
    pub pushed_regs: Vec<Id>,
    /// Every distinct stack slot the body reads or writes, as offsets
    /// relative to the frame pointer (or its synthesized equivalent).
    pub stack_vars: Set<i64>,
    /// For each offset, the instruction addresses that touched it and
    /// how.
    pub stack_var_accesses: Map<i64, Set<(u64, Access)>>,
    /// Caller-frame slots, canonicalized so the first argument sits at
    /// offset 0.  Strictly ascending.
    pub stack_args: Vec<i64>,
    /// [`FuncInfo::stack_var_accesses`] restricted to the arguments,
    /// rekeyed to canonical offsets.
    pub stack_arg_accesses: Map<i64, Set<(u64, Access)>>,
    /// Slots whose effective address also depended on other registers:
    /// pointer/buffer semantics rather than scalar storage.
    pub buffers: Set<i64>,
    /// A trailing argument slot was only ever taken by address and got
    /// stripped: the variadic-cursor idiom.
    pub var_args: bool,
}

/// Why a routine's frame could not be reconstructed.
#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("routine has no startpoint")]
    StartpointMissing,
    #[error("no instruction prefix reaches a stable stack pointer")]
    PreambleNotFound,
    #[error(transparent)]
    Emul(#[from] EmuError),
}

/// Reconstruct the frame of `routine`.
pub fn reconstruct<S: Substrate>(
    emu: &mut S,
    routine: &Routine,
) -> Result<FuncInfo, ReconstructError> {
    let arch = emu.arch();
    let mut rec = Reconstruction {
        sp: arch.sp,
        bp: arch.bp,
        bits: arch.bits,
        bytes: arch.bytes(),
        reg_list: arch.symbolic_regs(),
        namer: Namer::new(routine.entry),
        emu,
    };
    rec.run(routine)
}

struct Reconstruction<'e, S: Substrate> {
    emu: &'e mut S,
    namer: Namer,
    reg_list: Vec<Id>,
    sp: Id,
    bp: Id,
    bits: u32,
    bytes: u64,
}

impl<S: Substrate> Reconstruction<'_, S> {
    fn run(&mut self, routine: &Routine) -> Result<FuncInfo, ReconstructError> {
        let start = routine
            .startpoint
            .ok_or(ReconstructError::StartpointMissing)?;

        // Entry state: fresh symbols everywhere interesting, and a map
        // from their fingerprints back to register names so preamble
        // stores can be attributed.
        let mut initial_state =
            make_symbolic_initial_state(self.emu, &self.reg_list, &mut self.namer)?;
        let mut reg_fps: Map<u64, Id> = Map::new();
        for &reg in &self.reg_list {
            let value = self.emu.load_reg(&initial_state, reg);
            reg_fps.insert(self.emu.fingerprint(&value), reg);
        }
        self.emu.set_ip(&mut initial_state, start);
        let initial_sp = self.sp_of(&initial_state)?;

        // Where should SP settle once the preamble is done?
        let entry_block = self.emu.block(start, None)?;
        let goal_sp = self.goal_sp(&initial_state, initial_sp, entry_block.instructions())?;

        // The preamble is the smallest entry-block prefix that lands SP
        // on the goal.
        let mut found = None;
        for prefix in 1..entry_block.instructions() {
            let probe = self.emu.step(&initial_state, Some(prefix))?;
            if self.sp_of(&probe.state)? == goal_sp {
                found = Some((prefix, probe));
                break;
            }
        }
        let (num_preamble, succ) = found.ok_or(ReconstructError::PreambleNotFound)?;

        let frame_size = (initial_sp as i64 - goal_sp as i64 - self.bytes as i64).max(0) as u64;

        // Frame-pointer mode: exactly one solution for entry_SP - BP,
        // and it is one word (the saved-BP slot sits right under the
        // return address).
        let entry_sp_expr = self.emu.load_reg(&initial_state, self.sp);
        let succ_bp_expr = self.emu.load_reg(&succ.state, self.bp);
        let diff = self.emu.sub(&entry_sp_expr, &succ_bp_expr);
        let bp_based = self.emu.solutions(&succ.state, &diff, 2)? == vec![self.bytes];

        // Callee-save pushes: preamble stores into the frame whose data
        // is the entry-time value of a known register.
        let mut pushed_regs = Vec::new();
        for action in &succ.actions {
            if let Action::Mem {
                access: Access::Write,
                addr,
                data,
                ..
            } = action
            {
                let at = self.emu.concretize(&succ.state, addr)?;
                if at >= goal_sp && at <= initial_sp {
                    if let Some(&reg) = reg_fps.get(&self.emu.fingerprint(data)) {
                        pushed_regs.push(reg);
                    }
                }
            }
        }
        pushed_regs.reverse();

        // Main state for the body: every general-purpose register gets a
        // fresh symbol, SP and BP keep their just-established values.
        let mut main_state = succ.state.clone();
        for &reg in &self.reg_list {
            let name = self.namer.fresh(&format!("sreg_{reg}"));
            let sym = self.emu.fresh_symbolic(&name, self.bits);
            self.emu.store_reg(&mut main_state, reg, sym);
        }
        self.emu.store_reg(&mut main_state, self.bp, succ_bp_expr);

        let preamble_block = self.emu.block(start, Some(num_preamble))?;
        let preamble_addrs: Set<u64> = preamble_block.instruction_addrs.iter().copied().collect();
        let end_preamble = start + preamble_block.size;

        let end_addrs = self.end_addrs(routine, &mut main_state, &preamble_addrs, end_preamble)?;

        let bp_sp_diff = if bp_based {
            let bp_expr = self.emu.load_reg(&main_state, self.bp);
            let sp_expr = self.emu.load_reg(&main_state, self.sp);
            let d = self.emu.sub(&bp_expr, &sp_expr);
            self.emu.concretize(&main_state, &d)? as i64
        } else {
            0
        };

        let mut all_addrs: Set<u64> = Set::new();
        for &block_addr in &routine.block_addrs {
            let block = self.emu.block(block_addr, None)?;
            all_addrs.extend(block.instruction_addrs.iter().copied());
        }

        // Swap SP (and BP) for named symbols: from here on, "touches the
        // frame" means "the expression mentions one of these names".
        let sym_sp_name = self.namer.fresh("sym_sp");
        let sym_sp = self.emu.fresh_symbolic(&sym_sp_name, self.bits);
        self.emu.store_reg(&mut main_state, self.sp, sym_sp.clone());
        let sym_bp = if bp_based {
            let name = self.namer.fresh("sym_bp");
            let sym = self.emu.fresh_symbolic(&name, self.bits);
            self.emu.store_reg(&mut main_state, self.bp, sym.clone());
            Some((name, sym))
        } else {
            None
        };

        // Single-step every body instruction in isolation and collect
        // frame-dependent effects.
        let mut observed: Vec<(u64, S::Expr, Access)> = Vec::new();
        for &addr in &all_addrs {
            if end_addrs.contains(&addr) || preamble_addrs.contains(&addr) {
                continue;
            }
            self.emu.set_ip(&mut main_state, addr);
            let out = self.emu.step(&main_state, Some(1))?;

            // A call site's effects belong to the callee, not this frame.
            if out.kind == JumpKind::Call {
                continue;
            }
            for action in &out.actions {
                if let Action::Mem {
                    access,
                    addr: addr_expr,
                    ..
                } = action
                {
                    if self.frame_tainted(addr_expr, &sym_sp_name, sym_bp.as_ref()) {
                        observed.push((addr, addr_expr.clone(), *access));
                    }
                }
            }
            // Address-of: a stack address surviving in a register after
            // the step (`lea` and friends).
            for &reg in &self.reg_list {
                if bp_based && reg == self.bp {
                    continue;
                }
                let value = self.emu.load_reg(&out.state, reg);
                if self.frame_tainted(&value, &sym_sp_name, sym_bp.as_ref()) {
                    observed.push((addr, value, Access::Load));
                }
            }
        }

        // Offsets are judged with every other register pinned to zero,
        // so buffer-address arithmetic collapses to its base.
        let mut verdict_state = main_state.clone();
        for &reg in &self.reg_list {
            let value = self.emu.load_reg(&main_state, reg);
            let zero = self.emu.imm(0, self.bits);
            let cond = self.emu.eq(&value, &zero);
            self.emu.add_constraint(&mut verdict_state, cond);
        }

        let mut stack_vars: Set<i64> = Set::new();
        let mut stack_var_accesses: Map<i64, Set<(u64, Access)>> = Map::new();
        let mut buffers: Set<i64> = Set::new();
        for (at, expr, access) in observed {
            let bp_off = if self.emu.mentions(&expr, &sym_sp_name) {
                let off_expr = self.emu.sub(&expr, &sym_sp);
                let is_buffer = self.emu.is_symbolic(&self.emu.simplify(&off_expr));
                let raw = self.emu.concretize(&verdict_state, &off_expr)?;
                let sp_off = wrap_above_sp(raw, self.bits);
                let bp_off = if bp_based {
                    sp_off - bp_sp_diff
                } else {
                    sp_off - (initial_sp as i64 - goal_sp as i64) + self.bytes as i64
                };
                if is_buffer {
                    buffers.insert(bp_off);
                }
                bp_off
            } else {
                let (_, sym) = sym_bp
                    .as_ref()
                    .expect("bp-tainted access observed in an sp-based routine");
                let off_expr = self.emu.sub(&expr, sym);
                let is_buffer = self.emu.is_symbolic(&self.emu.simplify(&off_expr));
                let raw = self.emu.concretize(&verdict_state, &off_expr)?;
                let bp_off = wrap_signed(raw, self.bits);
                if is_buffer {
                    buffers.insert(bp_off);
                }
                bp_off
            };
            stack_vars.insert(bp_off);
            stack_var_accesses
                .entry(bp_off)
                .or_default()
                .insert((at, access));
        }

        // Caller-frame slots become arguments: shift the return-address
        // and saved-BP pair off so argument 0 sits at offset 0.
        let shift = 2 * self.bytes as i64;
        let mut stack_args = Vec::new();
        let mut stack_arg_accesses: Map<i64, Set<(u64, Access)>> = Map::new();
        for &var in &stack_vars {
            if var > 0 {
                stack_args.push(var - shift);
                stack_arg_accesses.insert(var - shift, stack_var_accesses[&var].clone());
            }
        }

        // A trailing argument that was only ever taken by address is the
        // variadic cursor, not a real argument.
        let mut var_args = false;
        if let Some(&last) = stack_args.last() {
            let accesses = &stack_arg_accesses[&last];
            if !accesses.is_empty() && accesses.iter().all(|(_, a)| *a == Access::Load) {
                stack_arg_accesses.remove(&last);
                stack_args.pop();
                var_args = true;
            }
        }

        debug!(
            routine = %routine.label(),
            frame_size,
            args = stack_args.len(),
            var_args,
            "reconstructed frame"
        );

        Ok(FuncInfo {
            frame_size,
            pushed_regs,
            stack_vars,
            stack_var_accesses,
            stack_args,
            stack_arg_accesses,
            buffers,
            var_args,
        })
    }

    /// The SP value expected at the end of the preamble, judged from the
    /// entry block's own control flow.
    fn goal_sp(
        &mut self,
        initial_state: &S::State,
        initial_sp: u64,
        entry_len: usize,
    ) -> Result<u64, ReconstructError> {
        let first: StepOut<S::Expr, S::State> = self.emu.step(initial_state, None)?;
        let goal = match first.kind {
            // Undo the return address the call pushed.
            JumpKind::Call => self.sp_of(&first.state)? + self.bytes,
            // No real body: the preamble is the strictly descending SP
            // stretch, so scan per instruction for the minimum.
            JumpKind::Ret => {
                let mut min_sp = initial_sp;
                for prefix in 1..entry_len {
                    let probe = self.emu.step(initial_state, Some(prefix))?;
                    let sp = self.sp_of(&probe.state)?;
                    if sp < min_sp {
                        min_sp = sp;
                    } else if sp > min_sp {
                        break;
                    }
                }
                min_sp
            }
            _ => self.sp_of(&first.state)?,
        };
        Ok(goal)
    }

    /// Addresses belonging to epilogues: instructions in `Ret`-ending
    /// end-blocks that write SP (the stack teardown), widened to their
    /// whole blocks.
    fn end_addrs(
        &mut self,
        routine: &Routine,
        main_state: &mut S::State,
        preamble_addrs: &Set<u64>,
        end_preamble: u64,
    ) -> Result<Set<u64>, ReconstructError> {
        let mut end_addrs: Set<u64> = Set::new();
        for &endpoint in &routine.endpoints {
            let addr = if preamble_addrs.contains(&endpoint) {
                end_preamble
            } else {
                endpoint
            };
            if self.emu.block(addr, None)?.terminator != JumpKind::Ret {
                continue;
            }
            self.emu.set_ip(main_state, addr);
            let out = self.emu.step(main_state, None)?;
            for action in &out.actions {
                if let Action::Reg {
                    access: Access::Write,
                    offset,
                    ins_addr,
                    ..
                } = action
                {
                    let writes_sp = self.emu.arch().reg_name(*offset) == Some(self.sp);
                    if writes_sp {
                        let block = self.emu.block(*ins_addr, None)?;
                        end_addrs.extend(block.instruction_addrs.iter().copied());
                    }
                }
            }
        }
        Ok(end_addrs)
    }

    fn sp_of(&self, state: &S::State) -> Result<u64, EmuError> {
        let sp = self.emu.load_reg(state, self.sp);
        self.emu.concretize(state, &sp)
    }

    fn frame_tainted(
        &self,
        expr: &S::Expr,
        sp_name: &str,
        bp: Option<&(String, S::Expr)>,
    ) -> bool {
        self.emu.mentions(expr, sp_name)
            || bp.is_some_and(|(name, _)| self.emu.mentions(expr, name))
    }
}

/// SP-relative raw offsets above the signed midpoint fold back to the
/// positive side: they are near-top addresses, not negative locals.
fn wrap_above_sp(raw: u64, bits: u32) -> i64 {
    let half = 1u64 << (bits - 1);
    if raw > half {
        ((1u128 << bits) - u128::from(raw)) as i64
    } else {
        raw as i64
    }
}

/// BP-relative raw offsets reinterpret as two's complement: locals sit
/// below the frame pointer.
fn wrap_signed(raw: u64, bits: u32) -> i64 {
    let half = 1u64 << (bits - 1);
    if raw > half {
        -(((1u128 << bits) - u128::from(raw)) as i64)
    } else {
        raw as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sp_offsets_fold_to_the_positive_side() {
        assert_eq!(wrap_above_sp(8, 32), 8);
        assert_eq!(wrap_above_sp(0xffff_fffc, 32), 4);
        assert_eq!(wrap_above_sp(0, 32), 0);
    }

    #[test]
    fn bp_offsets_reinterpret_as_twos_complement() {
        assert_eq!(wrap_signed(8, 32), 8);
        assert_eq!(wrap_signed(0xffff_fffc, 32), -4);
        assert_eq!(wrap_signed(0, 32), 0);
    }
}
