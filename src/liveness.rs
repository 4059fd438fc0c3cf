//! Live-range summarisation for virtual and real registers.
//!
//! Two forward scans over the instruction stream. The first records the
//! half-open `[live_after, dead_before)` range of every virtual register;
//! the second records the intervals during which an allocatable real
//! register is architecturally reserved (a divide clobbering a fixed
//! register, say). Both tables are computed once and read-only afterwards.

use log::debug;

use crate::{AllocError, AllocInst, RReg, Reg, RegClass, RegMode, RegRef};

/// A half-open range `[start, end)` in instruction indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: u32,
    pub end: u32,
}

impl LiveRange {
    /// Whether two ranges share at least one instruction.
    pub fn overlaps(self, other: LiveRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Summary of one live virtual register. Built by [`summarize_vregs`],
/// completed by the spill-slot and preference passes, read-only in the
/// main loop.
#[derive(Debug, Clone)]
pub(crate) struct VRegInfo {
    pub range: LiveRange,
    pub class: RegClass,
    /// Byte offset of the home spill slot. Never changes once assigned.
    pub spill_offset: u32,
    /// Width in bytes of the home slot.
    pub spill_size: u32,
    /// Where this vreg would like to live, if anywhere.
    pub preferred: Option<RReg>,
}

/// Per-vreg table, indexed by the dense vreg number. `None` for vregs
/// the block never references.
pub(crate) type VRegTable = Vec<Option<VRegInfo>>;

/// A hard interval during which `rreg` is reserved. A single register may
/// contribute several disjoint intervals.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RRegInterval {
    pub rreg: RReg,
    pub range: LiveRange,
}

/// Scan once, recording each vreg's end-to-end live range and class.
///
/// The first event for a vreg must be a write; `dead_before` always ends
/// up one past the last instruction that touches the vreg, so a vreg
/// whose only event is a write at `i` has range `[i, i+1)`.
pub(crate) fn summarize_vregs<I: AllocInst>(
    insts: &[I],
    n_vregs: u32,
) -> Result<VRegTable, AllocError> {
    let mut table: VRegTable = vec![None; n_vregs as usize];
    let mut ops: Vec<RegRef> = Vec::new();

    for (ii, inst) in insts.iter().enumerate() {
        ops.clear();
        inst.reg_usage(&mut ops);

        for op in &ops {
            let Reg::Virtual(vreg) = op.reg else { continue };
            if vreg.index() >= n_vregs {
                return Err(AllocError::MalformedInput {
                    at: ii,
                    what: format!("{vreg} out of range (vreg count {n_vregs})"),
                });
            }

            let slot = &mut table[vreg.index() as usize];
            match slot {
                None => {
                    if op.mode != RegMode::Write {
                        return Err(AllocError::MalformedInput {
                            at: ii,
                            what: format!("first event for {vreg} is {:?}", op.mode),
                        });
                    }
                    *slot = Some(VRegInfo {
                        range: LiveRange {
                            start: ii as u32,
                            end: ii as u32 + 1,
                        },
                        class: vreg.class(),
                        spill_offset: 0,
                        spill_size: vreg.class().spill_size(),
                        preferred: None,
                    });
                }
                Some(info) => {
                    if info.class != vreg.class() {
                        return Err(AllocError::MalformedInput {
                            at: ii,
                            what: format!(
                                "{vreg} previously referenced as {:?}, now {:?}",
                                info.class,
                                vreg.class()
                            ),
                        });
                    }
                    info.range.end = ii as u32 + 1;
                }
            }
        }
    }

    debug!(
        "vreg liveness: {} of {} vreg(s) live",
        table.iter().flatten().count(),
        n_vregs
    );
    Ok(table)
}

/// Scan once, collecting every hard interval of every allocatable real
/// register.
///
/// A write opens a new interval, flushing any previous one for the same
/// register; reads and modifies extend the open interval. Intervals still
/// open after the last instruction are flushed at the end. Real registers
/// outside `allocatable` (stack pointer and friends) are ignored
/// entirely.
pub(crate) fn collect_rreg_intervals<I: AllocInst>(
    insts: &[I],
    allocatable: &[RReg],
) -> Result<Vec<RRegInterval>, AllocError> {
    // Open interval per allocatable register, if any.
    let mut open: Vec<Option<LiveRange>> = vec![None; allocatable.len()];
    let mut intervals: Vec<RRegInterval> = Vec::new();
    let mut ops: Vec<RegRef> = Vec::new();

    for (ii, inst) in insts.iter().enumerate() {
        ops.clear();
        inst.reg_usage(&mut ops);

        for op in &ops {
            let Reg::Real(rreg) = op.reg else { continue };
            let Some(ir) = allocatable.iter().position(|r| *r == rreg) else {
                continue;
            };

            match (op.mode, open[ir]) {
                (RegMode::Write, prev) => {
                    if let Some(range) = prev {
                        intervals.push(RRegInterval { rreg, range });
                    }
                    open[ir] = Some(LiveRange {
                        start: ii as u32,
                        end: ii as u32 + 1,
                    });
                }
                (RegMode::Read | RegMode::Modify, Some(range)) => {
                    open[ir] = Some(LiveRange {
                        start: range.start,
                        end: ii as u32 + 1,
                    });
                }
                (RegMode::Read | RegMode::Modify, None) => {
                    return Err(AllocError::MalformedInput {
                        at: ii,
                        what: format!("first event for {rreg} is {:?}", op.mode),
                    });
                }
            }
        }
    }

    for (ir, range) in open.into_iter().enumerate() {
        if let Some(range) = range {
            intervals.push(RRegInterval {
                rreg: allocatable[ir],
                range,
            });
        }
    }

    debug!("rreg hard ranges: {} interval(s)", intervals.len());
    Ok(intervals)
}
