//! The allocator core: a single forward pass that rewrites instructions
//! while tracking the disposition of every allocatable real register.
//!
//! The pass keeps one [`RRegState`] per allocatable register and holds a
//! running agreement with the precomputed live ranges: a register inside
//! a hard range is `Unavail`, a register holding a live vreg is `Bound`,
//! everything else is `Free`. The agreement is re-checked at the top of
//! every instruction before any mutation.

use log::{debug, trace};
use smallvec::SmallVec;

use crate::liveness::{
    RRegInterval, VRegInfo, VRegTable, collect_rreg_intervals, summarize_vregs,
};
use crate::spill::{assign_spill_slots, compute_preferences};
use crate::{AllocError, AllocInst, RReg, Reg, RegMap, RegMode, RegRef, VReg};

/// Disposition of one allocatable real register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disp {
    /// Available for use.
    Free,
    /// Inside a hard live range.
    Unavail,
    /// Holding the value of a vreg.
    Bound(VReg),
}

/// Running state for one allocatable real register.
#[derive(Debug, Clone, Copy)]
struct RRegState {
    rreg: RReg,
    disp: Disp,
}

/// One instruction's virtual operands, collapsed so each vreg appears
/// once with its combined access.
#[derive(Debug, Clone, Copy)]
struct VRegUse {
    vreg: VReg,
    reads: bool,
    writes: bool,
}

/// Rewrite `insts` so that every virtual register lives in a real one.
///
/// `n_vregs` bounds the dense vreg indices the instructions may use;
/// `allocatable` lists the distinct real registers the allocator may hand
/// out, in the order that breaks selection ties. Real registers outside
/// that set pass through untouched. Returns the new instruction vector,
/// which interleaves spills and restores with the (rewritten) originals.
pub fn allocate<I: AllocInst>(
    insts: &[I],
    n_vregs: u32,
    allocatable: &[RReg],
) -> Result<Vec<I>, AllocError> {
    debug_assert!(
        allocatable
            .iter()
            .enumerate()
            .all(|(i, r)| !allocatable[..i].contains(r)),
        "allocatable registers must be distinct"
    );

    let mut vregs = summarize_vregs(insts, n_vregs)?;
    let rreg_intervals = collect_rreg_intervals(insts, allocatable)?;
    assign_spill_slots(&mut vregs)?;
    compute_preferences(insts, &mut vregs, allocatable)?;

    let mut state: Vec<RRegState> = allocatable
        .iter()
        .map(|&rreg| RRegState {
            rreg,
            disp: Disp::Free,
        })
        .collect();

    let mut out: Vec<I> = Vec::with_capacity(insts.len() + insts.len() / 4 + 4);
    let mut ops: Vec<RegRef> = Vec::new();
    let mut uses: SmallVec<[VRegUse; 4]> = SmallVec::new();

    for (ii, inst) in insts.iter().enumerate() {
        sanity_check(ii, &state, &rreg_intervals, &vregs)?;

        // Expire bindings whose vreg has died. `dead_before` is one past
        // the last user, so dead-at-the-boundary is the exact condition.
        for st in state.iter_mut() {
            if let Disp::Bound(vreg) = st.disp
                && live_info(&vregs, vreg).range.end == ii as u32
            {
                trace!("{ii}: {vreg} dead, {} freed", st.rreg);
                st.disp = Disp::Free;
            }
        }

        // Hard-range transitions. Exits first: a register may leave one
        // reservation and enter another at the same instruction.
        for itv in &rreg_intervals {
            if itv.range.end == ii as u32 {
                let ir = rreg_index(&state, itv.rreg)
                    .expect("interval register is allocatable");
                debug_assert_eq!(state[ir].disp, Disp::Unavail);
                trace!("{ii}: {} leaves its hard range", itv.rreg);
                state[ir].disp = Disp::Free;
            }
        }
        for itv in &rreg_intervals {
            if itv.range.start == ii as u32 {
                let ir = rreg_index(&state, itv.rreg)
                    .expect("interval register is allocatable");
                if let Disp::Bound(vreg) = state[ir].disp {
                    let info = live_info(&vregs, vreg);
                    trace!("{ii}: {} reserved, spilling {vreg}", itv.rreg);
                    out.push(I::gen_spill(state[ir].rreg, info.spill_offset));
                }
                state[ir].disp = Disp::Unavail;
            }
        }

        // Collapse this instruction's virtual operands.
        ops.clear();
        inst.reg_usage(&mut ops);
        uses.clear();
        for op in &ops {
            let Reg::Virtual(vreg) = op.reg else { continue };
            let (reads, writes) = match op.mode {
                RegMode::Read => (true, false),
                RegMode::Write => (false, true),
                RegMode::Modify => (true, true),
            };
            if let Some(u) = uses.iter_mut().find(|u| u.vreg == vreg) {
                u.reads |= reads;
                u.writes |= writes;
            } else {
                uses.push(VRegUse { vreg, reads, writes });
            }
        }

        // Reads and modifies must be resident; reload from the home slot
        // when they are not.
        let mut map = RegMap::default();
        for u in uses.iter().filter(|u| u.reads) {
            let ir = match find_binding(&state, u.vreg) {
                Some(ir) => ir,
                None => {
                    let ir = choose_rreg(ii, &mut state, &vregs, u.vreg, &uses, &mut out)?;
                    let info = live_info(&vregs, u.vreg);
                    trace!("{ii}: restore {} into {}", u.vreg, state[ir].rreg);
                    out.push(I::gen_restore(state[ir].rreg, info.spill_offset));
                    state[ir].disp = Disp::Bound(u.vreg);
                    ir
                }
            };
            map.bind(u.vreg, state[ir].rreg);
        }

        // Pure writes need a home but no reload. A written vreg that is
        // already bound keeps its binding.
        for u in uses.iter().filter(|u| u.writes && !u.reads) {
            let ir = match find_binding(&state, u.vreg) {
                Some(ir) => ir,
                None => {
                    let ir = choose_rreg(ii, &mut state, &vregs, u.vreg, &uses, &mut out)?;
                    trace!("{ii}: {} defined into {}", u.vreg, state[ir].rreg);
                    state[ir].disp = Disp::Bound(u.vreg);
                    ir
                }
            };
            map.bind(u.vreg, state[ir].rreg);
        }

        // Rewrite a copy of the instruction under the substitution and
        // emit it.
        let mut rewritten = inst.clone();
        rewritten.map_regs(&map);
        out.push(rewritten);
    }

    debug!(
        "allocated {} instruction(s) into {} ({} vreg(s), {} rreg(s))",
        insts.len(),
        out.len(),
        n_vregs,
        allocatable.len()
    );
    Ok(out)
}

/// Pick a real register for `vreg`: its preferred register when free, the
/// lowest-index free register of the right class otherwise, and failing
/// that evict the binding of matching class with the farthest-future
/// death among those the current instruction does not itself reference.
fn choose_rreg<I: AllocInst>(
    ii: usize,
    state: &mut [RRegState],
    vregs: &VRegTable,
    vreg: VReg,
    uses: &[VRegUse],
    out: &mut Vec<I>,
) -> Result<usize, AllocError> {
    let info = live_info(vregs, vreg);
    let class = info.class;

    if let Some(pref) = info.preferred
        && let Some(ir) = rreg_index(state, pref)
        && state[ir].disp == Disp::Free
    {
        return Ok(ir);
    }

    if let Some(ir) = state
        .iter()
        .position(|st| st.disp == Disp::Free && st.rreg.class() == class)
    {
        return Ok(ir);
    }

    // Eviction. The victim's vreg must not be an operand of the current
    // instruction: un-mapping a register the rewrite is about to need
    // would be self-defeating.
    let mut victim: Option<(usize, VReg, u32)> = None;
    for (ir, st) in state.iter().enumerate() {
        let Disp::Bound(held) = st.disp else { continue };
        if st.rreg.class() != class {
            continue;
        }
        if uses.iter().any(|u| u.vreg == held) {
            continue;
        }
        let end = live_info(vregs, held).range.end;
        if victim.is_none_or(|(_, _, best)| end > best) {
            victim = Some((ir, held, end));
        }
    }
    let Some((ir, held, _)) = victim else {
        return Err(AllocError::NoRegForClass { at: ii, class });
    };

    let held_info = live_info(vregs, held);
    trace!(
        "{ii}: evict {held} from {}, spilling to offset {}",
        state[ir].rreg, held_info.spill_offset
    );
    out.push(I::gen_spill(state[ir].rreg, held_info.spill_offset));
    state[ir].disp = Disp::Free;
    Ok(ir)
}

/// Position of `rreg` in the running-state array. State is always indexed
/// this way, never by the register's hardware encoding.
fn rreg_index(state: &[RRegState], rreg: RReg) -> Option<usize> {
    state.iter().position(|st| st.rreg == rreg)
}

/// State slot currently bound to `vreg`, if any.
fn find_binding(state: &[RRegState], vreg: VReg) -> Option<usize> {
    state.iter().position(|st| st.disp == Disp::Bound(vreg))
}

/// Liveness summary of a vreg that is known to be live. Only reachable
/// for vregs the summariser has seen: operands were checked during
/// summarisation and bindings only ever hold summarised vregs.
fn live_info(vregs: &VRegTable, vreg: VReg) -> &VRegInfo {
    vregs[vreg.index() as usize]
        .as_ref()
        .expect("bound vreg has a live range")
}

/// Cross-checks between the running state and the precomputed ranges,
/// run before any mutation for instruction `ii`.
fn sanity_check(
    ii: usize,
    state: &[RRegState],
    intervals: &[RRegInterval],
    vregs: &VRegTable,
) -> Result<(), AllocError> {
    let fail = |what: String| AllocError::InternalInvariant { at: ii, what };
    let ii = ii as u32;

    // A register inside a hard range must be reserved.
    for itv in intervals {
        if itv.range.start < ii && ii < itv.range.end {
            let Some(ir) = rreg_index(state, itv.rreg) else {
                return Err(fail(format!("{} has a hard range but no state slot", itv.rreg)));
            };
            if state[ir].disp != Disp::Unavail {
                return Err(fail(format!(
                    "{} is inside a hard range but not reserved",
                    itv.rreg
                )));
            }
        }
    }

    // Conversely, a reserved register must be inside a hard range. The
    // reservation is released while processing `ii == end`, so the exit
    // boundary still counts as covered here.
    for st in state {
        if st.disp != Disp::Unavail {
            continue;
        }
        let covered = intervals
            .iter()
            .any(|itv| itv.rreg == st.rreg && itv.range.start < ii && ii <= itv.range.end);
        if !covered {
            return Err(fail(format!("{} is reserved outside any hard range", st.rreg)));
        }
    }

    // No vreg is bound to two registers.
    for (i, a) in state.iter().enumerate() {
        let Disp::Bound(va) = a.disp else { continue };
        for b in &state[i + 1..] {
            if b.disp == Disp::Bound(va) {
                return Err(fail(format!(
                    "{va} bound to both {} and {}",
                    a.rreg, b.rreg
                )));
            }
        }
    }

    // Bindings pair registers of one class, and the bound vreg is one
    // the summariser saw as live.
    for st in state {
        let Disp::Bound(vreg) = st.disp else { continue };
        let Some(info) = vregs.get(vreg.index() as usize).and_then(|i| i.as_ref()) else {
            return Err(fail(format!("{} bound to unknown {vreg}", st.rreg)));
        };
        if info.class != st.rreg.class() {
            return Err(fail(format!("class mismatch: {} holds {vreg}", st.rreg)));
        }
    }

    Ok(())
}
