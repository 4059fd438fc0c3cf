//! Spill-slot assignment and move preferencing.

use log::{debug, trace};

use crate::liveness::VRegTable;
use crate::{AllocError, AllocInst, RReg, Reg, VReg};

/// Number of 8-byte slots in the spill area.
pub const SPILL_AREA_SLOTS: usize = 256;

/// Width of one spill slot in bytes. Wider values take consecutive slots.
pub const SPILL_SLOT_BYTES: u32 = 8;

/// Assign every live vreg a home slot such that two vregs sharing a slot
/// have disjoint live ranges.
///
/// First-fit in vreg order: the vreg takes the lowest run of
/// `spill_size / 8` consecutive slots that are all free at the start of
/// its range, and holds them until its range ends. Every live vreg gets a
/// home even if it is never spilled.
pub(crate) fn assign_spill_slots(vregs: &mut VRegTable) -> Result<(), AllocError> {
    // Index j holds the instruction index before which slot j is free
    // again.
    let mut busy_until_before = [0u32; SPILL_AREA_SLOTS];

    for (index, info) in vregs.iter_mut().enumerate() {
        let Some(info) = info else { continue };
        let need = (info.spill_size / SPILL_SLOT_BYTES) as usize;

        let mut found = None;
        'slots: for j in 0..=SPILL_AREA_SLOTS.saturating_sub(need) {
            for k in 0..need {
                if busy_until_before[j + k] > info.range.start {
                    continue 'slots;
                }
            }
            found = Some(j);
            break;
        }
        let Some(j) = found else {
            return Err(AllocError::OutOfSpillSlots {
                vreg: VReg::new(index as u32, info.class),
                need: need as u32,
            });
        };

        for k in 0..need {
            busy_until_before[j + k] = info.range.end;
        }
        info.spill_offset = j as u32 * SPILL_SLOT_BYTES;
        trace!("home slot for v{index}: offset {}", info.spill_offset);
    }
    Ok(())
}

/// Record a preferred real register for every vreg that a flagged move
/// pairs with an allocatable real register.
///
/// Landing such a vreg in its preferred register turns the move into a
/// self-copy the encoder can drop; allocation correctness never depends
/// on the hint, and the main loop falls back to any free register when
/// the preferred one is taken.
pub(crate) fn compute_preferences<I: AllocInst>(
    insts: &[I],
    vregs: &mut VRegTable,
    allocatable: &[RReg],
) -> Result<(), AllocError> {
    let mut hinted = 0usize;

    for (ii, inst) in insts.iter().enumerate() {
        let Some((src, dst)) = inst.as_move() else { continue };
        if src.class() != dst.class() {
            return Err(AllocError::MalformedInput {
                at: ii,
                what: format!("move mixes register classes ({src} -> {dst})"),
            });
        }

        let (vreg, rreg) = match (src, dst) {
            (Reg::Real(r), Reg::Virtual(v)) | (Reg::Virtual(v), Reg::Real(r)) => (v, r),
            _ => continue,
        };
        if !allocatable.contains(&rreg) {
            continue;
        }
        if let Some(info) = vregs.get_mut(vreg.index() as usize).and_then(|i| i.as_mut()) {
            info.preferred = Some(rreg);
            hinted += 1;
        }
    }

    if hinted > 0 {
        debug!("move preferences: {hinted} vreg(s) hinted");
    }
    Ok(())
}
