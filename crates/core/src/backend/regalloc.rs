//! Linear-scan register allocation over a block's value liveness intervals.

use std::collections::HashMap;

use crate::backend::registers::{Reg, ALLOCATABLE};
use crate::ir::{Instruction, ValueId};

/// Where a value lives once allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    /// Held in a host register for its entire live range.
    Reg(Reg),
    /// Spilled to a fixed offset (in 8-byte slots) within the guest
    /// context's scratch area.
    Spill(usize),
}

/// The allocator's output: every value's location, and how many spill slots
/// the block's prologue/epilogue must reserve.
#[derive(Debug, Default)]
pub struct Allocation {
    locations: HashMap<ValueId, Location>,
    /// Number of 8-byte spill slots used.
    pub spill_slots: usize,
}

impl Allocation {
    /// Returns where `value` lives. Panics if `value` was never allocated
    /// (a frontend/builder bug: every used value must have a producer in
    /// the same instruction list this allocation was built from).
    #[must_use]
    pub fn location_of(&self, value: ValueId) -> Location {
        self.locations[&value]
    }
}

struct Interval {
    value: ValueId,
    start: usize,
    end: usize,
}

/// Runs linear-scan allocation over `instrs`'s value liveness.
///
/// Interval `start` is a value's defining instruction index; `end` is the
/// index of its last use (or `start` if it is never used, e.g. a dead
/// `StoreGuestReg` target that simplification left behind). Intervals are
/// processed in order of increasing start; ties broken by lower value id.
/// When the allocatable set is exhausted, the active interval ending
/// furthest in the future is spilled in favor of the new one — unless the
/// new interval itself ends no sooner, in which case the earlier-ending
/// (already active) interval keeps its register and the new one spills.
#[must_use]
pub fn allocate(instrs: &[Instruction]) -> Allocation {
    let mut intervals: Vec<Interval> = instrs
        .iter()
        .enumerate()
        .filter_map(|(i, instr)| instr.dest.map(|v| Interval { value: v, start: i, end: i }))
        .collect();

    for (i, instr) in instrs.iter().enumerate() {
        for operand in instr.operands.into_iter().flatten() {
            if let Some(iv) = intervals.iter_mut().find(|iv| iv.value == operand) {
                iv.end = iv.end.max(i);
            }
        }
    }

    intervals.sort_by_key(|iv| (iv.start, iv.value.0));

    let mut free_regs: Vec<Reg> = ALLOCATABLE.to_vec();
    let mut active: Vec<Interval> = Vec::new();
    let mut locations: HashMap<ValueId, Location> = HashMap::new();
    let mut spill_slots = 0usize;

    for iv in intervals {
        let mut i = 0;
        while i < active.len() {
            if active[i].end < iv.start {
                let expired = active.remove(i);
                if let Some(Location::Reg(r)) = locations.get(&expired.value) {
                    free_regs.push(*r);
                }
            } else {
                i += 1;
            }
        }

        if let Some(reg) = free_regs.pop() {
            locations.insert(iv.value, Location::Reg(reg));
            active.push(iv);
            active.sort_by_key(|a| a.end);
        } else {
            let furthest_end = active.last().map(|a| a.end);
            match furthest_end {
                Some(end) if end > iv.end => {
                    let evicted = active.pop().unwrap();
                    let reg = match locations.insert(evicted.value, Location::Spill(spill_slots)) {
                        Some(Location::Reg(r)) => r,
                        _ => unreachable!("active interval always holds a register"),
                    };
                    spill_slots += 1;
                    locations.insert(iv.value, Location::Reg(reg));
                    active.push(iv);
                    active.sort_by_key(|a| a.end);
                }
                _ => {
                    locations.insert(iv.value, Location::Spill(spill_slots));
                    spill_slots += 1;
                }
            }
        }
    }

    Allocation { locations, spill_slots }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IRBuilder;
    use crate::ir::IrType;

    #[test]
    fn short_lived_values_fit_in_registers() {
        let mut b = IRBuilder::new();
        let r1 = b.load_guest_reg(1, IrType::I64);
        let r2 = b.load_guest_reg(2, IrType::I64);
        let sum = b.emit(crate::ir::opcode::Opcode::Add, &[r1, r2], None, Some(IrType::I64));
        b.store_guest_reg(0, sum);
        b.return_to_dispatcher();
        let instrs = b.finish().unwrap();

        let alloc = allocate(&instrs);
        assert_eq!(alloc.spill_slots, 0);
        assert!(matches!(alloc.location_of(sum), Location::Reg(_)));
    }

    #[test]
    fn exhausting_registers_spills_something() {
        let mut b = IRBuilder::new();
        let mut lives = Vec::new();
        // More concurrently-live values than ALLOCATABLE has registers.
        for reg in 0..(ALLOCATABLE.len() as u16 + 2) {
            lives.push(b.load_guest_reg(reg, IrType::I64));
        }
        let mut acc = lives[0];
        for &v in &lives[1..] {
            acc = b.emit(crate::ir::opcode::Opcode::Add, &[acc, v], None, Some(IrType::I64));
        }
        b.store_guest_reg(0, acc);
        b.return_to_dispatcher();
        let instrs = b.finish().unwrap();

        let alloc = allocate(&instrs);
        assert!(alloc.spill_slots > 0);
    }
}
