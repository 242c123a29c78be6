//! Linear-scan register allocation
//!
//! Per function: number the instructions in block layout order, build a
//! live interval `[start, end]` for every vreg (definition index to last
//! use), sort by start and scan. Expired intervals return their registers;
//! when nothing is free the active interval with the furthest end spills
//! (either the incumbent or the incoming interval, whichever ends later)
//! and takes a fresh stack slot.
//!
//! Parameters are pre-assigned to the platform argument registers; excess
//! parameters go straight to frame slots read by the emitter prologue.
//! Constants are never allocated; emitters rematerialize them at each use.

use crate::celestial::ir::{Function, InstId, ValueId, ValueKind};
use std::collections::HashMap;

pub type PhysReg = u8;

/// Register environment of a target.
pub struct TargetAbi {
    pub name: &'static str,
    /// Argument registers, in order.
    pub arg_regs: &'static [PhysReg],
    /// Allocatable, in preference order (caller-saved first).
    pub allocatable: &'static [PhysReg],
    /// Allocatable registers the callee must preserve.
    pub callee_saved: &'static [PhysReg],
    /// Never allocated: stack/frame pointers, substrate and capability
    /// context registers, emitter scratch.
    pub reserved: &'static [PhysReg],
}

// x86-64 numbering: rax=0 rcx=1 rdx=2 rbx=3 rsp=4 rbp=5 rsi=6 rdi=7 r8..r15=8..15.
pub const X64_ABI: TargetAbi = TargetAbi {
    name: "x86-64",
    arg_regs: &[7, 6, 2, 1, 8, 9], // rdi rsi rdx rcx r8 r9
    // rax/r10/r11 are emitter scratch; the rest allocate freely.
    allocatable: &[1, 2, 6, 7, 8, 9, 3, 12], // rcx rdx rsi rdi r8 r9 | rbx r12
    callee_saved: &[3, 12],                  // rbx r12
    reserved: &[0, 4, 5, 10, 11, 13, 14, 15], // rax rsp rbp r10 r11 r13 r14 r15
};

// RV64 numbering is the architectural x0..x31.
pub const RV64_ABI: TargetAbi = TargetAbi {
    name: "rv64imac",
    arg_regs: &[10, 11, 12, 13, 14, 15, 16, 17], // a0..a7
    // t4..t6 and a0..a7, then s0..s9 (t0..t3 are emitter scratch).
    allocatable: &[
        29, 30, 31, // t4..t6
        10, 11, 12, 13, 14, 15, 16, 17, // a0..a7
        8, 9, 18, 19, 20, 21, 22, 23, 24, 25, // s0..s9
    ],
    callee_saved: &[8, 9, 18, 19, 20, 21, 22, 23, 24, 25],
    // x0..x4 (zero ra sp gp tp), t0..t3 scratch, s10/s11 context registers.
    reserved: &[0, 1, 2, 3, 4, 5, 6, 7, 26, 27, 28],
};

/// Where a value lives during code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Reg(PhysReg),
    /// Frame slot index; the emitter turns it into an rbp/fp offset.
    Slot(u32),
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    value: ValueId,
    start: u32,
    end: u32,
    /// Pre-assigned argument register, if any.
    fixed: Option<PhysReg>,
}

/// Allocation result consumed by the emitters.
#[derive(Debug, Default)]
pub struct Allocation {
    pub locations: HashMap<ValueId, Location>,
    pub num_slots: u32,
    /// Callee-saved registers handed out; the prologue saves them.
    pub used_callee_saved: Vec<PhysReg>,
    /// Instruction numbering in block layout order.
    pub inst_order: Vec<InstId>,
}

impl Allocation {
    pub fn location(&self, v: ValueId) -> Option<Location> {
        self.locations.get(&v).copied()
    }
}

pub fn allocate(func: &Function, abi: &TargetAbi) -> Allocation {
    // 1. Flat numbering in layout order.
    let mut inst_order: Vec<InstId> = Vec::new();
    let mut index_of: HashMap<InstId, u32> = HashMap::new();
    for block in &func.blocks {
        for &inst_id in &block.insts {
            index_of.insert(inst_id, inst_order.len() as u32);
            inst_order.push(inst_id);
        }
    }

    // 2. Live intervals for vregs and parameters.
    let mut intervals: HashMap<ValueId, Interval> = HashMap::new();
    for (i, &param) in func.params.iter().enumerate() {
        intervals.insert(
            param,
            Interval {
                value: param,
                start: 0,
                end: 0,
                fixed: abi.arg_regs.get(i).copied(),
            },
        );
    }
    for (vid, v) in func.values.iter().enumerate() {
        if let ValueKind::VReg { def } = v.kind {
            if let Some(&at) = index_of.get(&def) {
                intervals.insert(
                    vid as ValueId,
                    Interval {
                        value: vid as ValueId,
                        start: at,
                        end: at,
                        fixed: None,
                    },
                );
            }
        }
    }
    for (at, &inst_id) in inst_order.iter().enumerate() {
        for &operand in &func.inst(inst_id).operands {
            if let Some(interval) = intervals.get_mut(&operand) {
                interval.end = interval.end.max(at as u32);
            }
        }
        // Return-style uses of parameters also extend them.
    }

    let mut sorted: Vec<Interval> = intervals.into_values().collect();
    sorted.sort_by_key(|iv| (iv.start, iv.value));

    // 3. Scan.
    let mut allocation = Allocation {
        inst_order,
        ..Allocation::default()
    };
    let mut free: Vec<PhysReg> = abi.allocatable.to_vec();
    let mut active: Vec<Interval> = Vec::new();

    let mut note_callee_saved = |alloc: &mut Allocation, reg: PhysReg| {
        if abi.callee_saved.contains(&reg) && !alloc.used_callee_saved.contains(&reg) {
            alloc.used_callee_saved.push(reg);
        }
    };

    for interval in sorted {
        // Expire.
        let mut expired: Vec<Interval> = Vec::new();
        active.retain(|a| {
            if a.end < interval.start {
                expired.push(*a);
                false
            } else {
                true
            }
        });
        for e in expired {
            if let Some(Location::Reg(r)) = allocation.location(e.value) {
                free.push(r);
            }
        }

        // Fixed argument registers claim their register when available.
        if let Some(reg) = interval.fixed {
            if let Some(pos) = free.iter().position(|&r| r == reg) {
                free.remove(pos);
                allocation.locations.insert(interval.value, Location::Reg(reg));
                note_callee_saved(&mut allocation, reg);
                active.push(interval);
                continue;
            }
            // The arg register was taken (or is not allocatable on this
            // target): fall through to the general path.
        } else if func.params.contains(&interval.value) {
            // Parameter beyond the register convention: frame slot.
            let slot = allocation.num_slots;
            allocation.num_slots += 1;
            allocation
                .locations
                .insert(interval.value, Location::Slot(slot));
            continue;
        }

        if let Some(reg) = free.pop() {
            allocation.locations.insert(interval.value, Location::Reg(reg));
            note_callee_saved(&mut allocation, reg);
            active.push(interval);
            continue;
        }

        // Spill: the furthest-ending of the actives vs the newcomer.
        let (furthest_idx, furthest_end) = active
            .iter()
            .enumerate()
            .map(|(i, a)| (i, a.end))
            .max_by_key(|&(_, end)| end)
            .expect("active set cannot be empty when nothing is free");

        if furthest_end > interval.end {
            // Evict the incumbent, hand its register to the newcomer.
            let evicted = active.remove(furthest_idx);
            let reg = match allocation.location(evicted.value) {
                Some(Location::Reg(r)) => r,
                _ => unreachable!("active interval without a register"),
            };
            let slot = allocation.num_slots;
            allocation.num_slots += 1;
            allocation
                .locations
                .insert(evicted.value, Location::Slot(slot));
            allocation.locations.insert(interval.value, Location::Reg(reg));
            note_callee_saved(&mut allocation, reg);
            active.push(interval);
        } else {
            // The newcomer ends last: it is the one that spills.
            let slot = allocation.num_slots;
            allocation.num_slots += 1;
            allocation
                .locations
                .insert(interval.value, Location::Slot(slot));
        }
    }

    allocation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::celestial::builder::Builder;
    use crate::celestial::ir::{Function, Module, Opcode};
    use crate::types::{EffectSet, Type};

    fn simple_fn(n_params: usize) -> Module {
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "f",
            vec![Type::I64; n_params],
            Type::I64,
            EffectSet::NONE,
        ));
        m
    }

    #[test]
    fn params_take_arg_registers() {
        let mut m = simple_fn(3);
        let mut b = Builder::new(&mut m, 0);
        let (p0, p1, p2) = (b.param(0), b.param(1), b.param(2));
        let s = b.binary(Opcode::Add, Type::I64, p0, p1);
        let s2 = b.binary(Opcode::Add, Type::I64, s, p2);
        b.ret(Some(s2));

        let alloc = allocate(&m.functions[0], &X64_ABI);
        assert_eq!(alloc.location(p0), Some(Location::Reg(7))); // rdi
        assert_eq!(alloc.location(p1), Some(Location::Reg(6))); // rsi
        assert_eq!(alloc.location(p2), Some(Location::Reg(2))); // rdx
    }

    #[test]
    fn excess_params_get_frame_slots() {
        let mut m = simple_fn(8);
        let mut b = Builder::new(&mut m, 0);
        let p6 = b.param(6);
        let p7 = b.param(7);
        b.ret(Some(p7));

        let alloc = allocate(&m.functions[0], &X64_ABI);
        // Six in registers, the rest in slots.
        assert!(matches!(alloc.location(p6), Some(Location::Slot(_))));
        assert!(matches!(alloc.location(p7), Some(Location::Slot(_))));
        // RV64 takes eight in registers.
        let alloc = allocate(&m.functions[0], &RV64_ABI);
        assert_eq!(alloc.location(p7), Some(Location::Reg(17))); // a7
    }

    #[test]
    fn registers_are_reused_after_expiry() {
        let mut m = simple_fn(0);
        let mut b = Builder::new(&mut m, 0);
        // Two disjoint short chains; the second can reuse the first's register.
        let c1 = b.const_int(Type::I64, 1);
        let a = b.neg(Type::I64, c1);
        let a2 = b.neg(Type::I64, a);
        let b2 = b.neg(Type::I64, a2);
        b.ret(Some(b2));

        let alloc = allocate(&m.functions[0], &X64_ABI);
        let used: std::collections::HashSet<_> = [a, a2, b2]
            .iter()
            .filter_map(|&v| match alloc.location(v) {
                Some(Location::Reg(r)) => Some(r),
                _ => None,
            })
            .collect();
        // Three values, but lifetimes overlap only pairwise.
        assert!(used.len() <= 2, "expected register reuse, got {:?}", used);
        assert_eq!(alloc.num_slots, 0);
    }

    #[test]
    fn pressure_forces_spills() {
        let mut m = simple_fn(0);
        let mut b = Builder::new(&mut m, 0);
        // More simultaneously-live values than allocatable registers.
        let n = X64_ABI.allocatable.len() + 3;
        let zero = b.const_int(Type::I64, 0);
        let mut live: Vec<_> = Vec::new();
        for i in 0..n {
            let c = b.const_int(Type::I64, i as u64);
            live.push(b.binary(Opcode::Add, Type::I64, zero, c));
        }
        // Use them all at the end so every interval spans the block.
        let mut acc = live[0];
        for &v in &live[1..] {
            acc = b.binary(Opcode::Add, Type::I64, acc, v);
        }
        b.ret(Some(acc));

        let alloc = allocate(&m.functions[0], &X64_ABI);
        assert!(alloc.num_slots > 0, "expected at least one spill");
        // Everything has a home.
        for &v in &live {
            assert!(alloc.location(v).is_some());
        }
    }

    #[test]
    fn reserved_registers_never_allocated() {
        let mut m = simple_fn(0);
        let mut b = Builder::new(&mut m, 0);
        let zero = b.const_int(Type::I64, 0);
        let mut acc = b.neg(Type::I64, zero);
        for _ in 0..20 {
            acc = b.neg(Type::I64, acc);
        }
        b.ret(Some(acc));

        for abi in [&X64_ABI, &RV64_ABI] {
            let alloc = allocate(&m.functions[0], abi);
            for loc in alloc.locations.values() {
                if let Location::Reg(r) = loc {
                    assert!(
                        !abi.reserved.contains(r),
                        "{}: reserved register {} was allocated",
                        abi.name,
                        r
                    );
                }
            }
        }
    }

    #[test]
    fn callee_saved_usage_is_reported() {
        let mut m = simple_fn(0);
        let mut b = Builder::new(&mut m, 0);
        let n = X64_ABI.allocatable.len();
        let zero = b.const_int(Type::I64, 0);
        let mut live = Vec::new();
        for i in 0..n {
            let c = b.const_int(Type::I64, i as u64);
            live.push(b.binary(Opcode::Add, Type::I64, zero, c));
        }
        let mut acc = live[0];
        for &v in &live[1..] {
            acc = b.binary(Opcode::Add, Type::I64, acc, v);
        }
        b.ret(Some(acc));

        let alloc = allocate(&m.functions[0], &X64_ABI);
        // With every allocatable register live at once, the callee-saved
        // ones are in play and must be reported for the prologue.
        assert!(!alloc.used_callee_saved.is_empty());
        for r in &alloc.used_callee_saved {
            assert!(X64_ABI.callee_saved.contains(r));
        }
    }
}
