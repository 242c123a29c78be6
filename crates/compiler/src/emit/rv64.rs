//! RV64IMAC code emitter
//!
//! Same contract as the x86-64 backend with RISC-V encodings. `s10` holds
//! the substrate context (runtime entry table), `s11` the capability
//! context; `t0..t3` are emitter scratch.
//!
//! Canonical sequences:
//! - VOID test: `srli t2, val, 63; bnez t2, .void`
//! - VOID literal: `addi rd, x0, -1` (all ones)
//! - divide-by-zero guard: `beq rs2, zero, .void; div rd, rs1, rs2`,
//!   lowered through labels and fixups, never hand-counted offsets
//! - prologue: `addi sp, sp, -frame; sd ra, (frame-8)(sp);
//!   sd fp, (frame-16)(sp); addi fp, sp, frame`, frame rounded to 16
//!
//! Branch fixups re-encode the 13-bit B-type immediate; jumps re-encode
//! the 21-bit J-type immediate.

use crate::celestial::ir::{
    ConstVal, Function, Inst, InstId, Module, Opcode, ValueId, ValueKind,
};
use crate::emit::RuntimeSlot;
use crate::emit::buffer::{Buffer, FixupKind, Label};
use crate::regalloc::{self, Allocation, Location, RV64_ABI};
use crate::types::Type;
use std::collections::HashMap;

// Architectural register numbers.
const ZERO: u8 = 0;
const RA: u8 = 1;
const SP: u8 = 2;
const T0: u8 = 5;
const T1: u8 = 6;
const T2: u8 = 7;
const FP: u8 = 8; // s0
const A0: u8 = 10;
const S10: u8 = 26;
const S11: u8 = 27;
const T3: u8 = 28;

/// Registers preserved around calls by the call sequences (the allocator
/// may have live values in them).
const CALL_PRESERVED: [u8; 11] = [10, 11, 12, 13, 14, 15, 16, 17, 29, 30, 31];

const CAP_BASE: i32 = 0;
const CAP_LENGTH: i32 = 8;
const CAP_GENERATION: i32 = 16;
const CAP_PERMS: i32 = 24;

/// Permission mask bits, matching `seraph_core::Perm`.
const PERM_READ: i32 = 1;
const PERM_WRITE: i32 = 2;

/// Capability loads and stores move 8-byte words; the bounds check covers
/// the whole access, not just its first byte.
const CAP_ACCESS_WIDTH: i32 = 8;

#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    pub entries: Vec<FunctionEntry>,
    pub entry_offset: usize,
}

pub fn emit_module(module: &Module) -> Result<CompiledCode, String> {
    let mut buf = Buffer::new();
    let fn_labels: Vec<Label> = module.functions.iter().map(|_| buf.new_label()).collect();

    // Entry stub: call main, exit(a0).
    let entry_offset = buf.len();
    if let Some(main_id) = module.find_function("main") {
        emit_jal(&mut buf, RA, fn_labels[main_id as usize]);
    } else {
        addi(&mut buf, A0, ZERO, 0);
    }
    addi(&mut buf, 17, ZERO, 93); // a7 = SYS_exit
    buf.emit_u32(0x0000_0073); // ecall

    let mut entries = Vec::new();
    for (i, func) in module.functions.iter().enumerate() {
        let offset = buf.len();
        buf.bind_label(fn_labels[i]);
        let mut emitter = FnEmitter::new(&mut buf, module, func, &fn_labels);
        emitter.emit()?;
        entries.push(FunctionEntry {
            name: func.name.clone(),
            offset,
            size: buf.len() - offset,
        });
    }

    buf.resolve_fixups()?;
    Ok(CompiledCode {
        code: buf.bytes,
        entries,
        entry_offset,
    })
}

// ======================================================================
// Encodings
// ======================================================================

fn r_type(buf: &mut Buffer, funct7: u32, rs2: u8, rs1: u8, funct3: u32, rd: u8, opcode: u32) {
    buf.emit_u32(
        (funct7 << 25)
            | ((rs2 as u32) << 20)
            | ((rs1 as u32) << 15)
            | (funct3 << 12)
            | ((rd as u32) << 7)
            | opcode,
    );
}

fn i_type(buf: &mut Buffer, imm: i32, rs1: u8, funct3: u32, rd: u8, opcode: u32) {
    debug_assert!((-2048..=2047).contains(&imm), "i-type imm out of range");
    buf.emit_u32(
        (((imm as u32) & 0xFFF) << 20)
            | ((rs1 as u32) << 15)
            | (funct3 << 12)
            | ((rd as u32) << 7)
            | opcode,
    );
}

fn s_type(buf: &mut Buffer, imm: i32, rs2: u8, rs1: u8, funct3: u32, opcode: u32) {
    debug_assert!((-2048..=2047).contains(&imm), "s-type imm out of range");
    let imm = imm as u32;
    buf.emit_u32(
        (((imm >> 5) & 0x7F) << 25)
            | ((rs2 as u32) << 20)
            | ((rs1 as u32) << 15)
            | (funct3 << 12)
            | ((imm & 0x1F) << 7)
            | opcode,
    );
}

fn addi(buf: &mut Buffer, rd: u8, rs1: u8, imm: i32) {
    i_type(buf, imm, rs1, 0, rd, 0x13);
}

fn add(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 0, rs2, rs1, 0, rd, 0x33);
}

fn sub(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 0x20, rs2, rs1, 0, rd, 0x33);
}

fn mul(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 1, rs2, rs1, 0, rd, 0x33);
}

fn mulh(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 1, rs2, rs1, 1, rd, 0x33);
}

fn div(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 1, rs2, rs1, 4, rd, 0x33);
}

fn rem(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 1, rs2, rs1, 6, rd, 0x33);
}

fn and(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 0, rs2, rs1, 7, rd, 0x33);
}

fn or(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 0, rs2, rs1, 6, rd, 0x33);
}

fn xor(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 0, rs2, rs1, 4, rd, 0x33);
}

fn sll(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 0, rs2, rs1, 1, rd, 0x33);
}

fn srl(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 0, rs2, rs1, 5, rd, 0x33);
}

fn sra(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 0x20, rs2, rs1, 5, rd, 0x33);
}

fn slt(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 0, rs2, rs1, 2, rd, 0x33);
}

fn sltu(buf: &mut Buffer, rd: u8, rs1: u8, rs2: u8) {
    r_type(buf, 0, rs2, rs1, 3, rd, 0x33);
}

fn slli(buf: &mut Buffer, rd: u8, rs1: u8, shamt: u32) {
    buf.emit_u32((shamt << 20) | ((rs1 as u32) << 15) | (1 << 12) | ((rd as u32) << 7) | 0x13);
}

fn srli(buf: &mut Buffer, rd: u8, rs1: u8, shamt: u32) {
    buf.emit_u32((shamt << 20) | ((rs1 as u32) << 15) | (5 << 12) | ((rd as u32) << 7) | 0x13);
}

fn srai(buf: &mut Buffer, rd: u8, rs1: u8, shamt: u32) {
    buf.emit_u32(
        (0x20 << 25) | (shamt << 20) | ((rs1 as u32) << 15) | (5 << 12) | ((rd as u32) << 7) | 0x13,
    );
}

fn ld(buf: &mut Buffer, rd: u8, rs1: u8, imm: i32) {
    i_type(buf, imm, rs1, 3, rd, 0x03);
}

fn sd(buf: &mut Buffer, rs2: u8, rs1: u8, imm: i32) {
    s_type(buf, imm, rs2, rs1, 3, 0x23);
}

fn lui(buf: &mut Buffer, rd: u8, imm20: u32) {
    buf.emit_u32((imm20 << 12) | ((rd as u32) << 7) | 0x37);
}

fn jalr(buf: &mut Buffer, rd: u8, rs1: u8, imm: i32) {
    i_type(buf, imm, rs1, 0, rd, 0x67);
}

fn ebreak(buf: &mut Buffer) {
    buf.emit_u32(0x0010_0073);
}

/// Conditional branch to a label, resolved by the B-type fixup.
fn branch(buf: &mut Buffer, funct3: u32, rs1: u8, rs2: u8, label: Label) {
    let at = buf.len();
    buf.emit_u32(
        ((rs2 as u32) << 20) | ((rs1 as u32) << 15) | (funct3 << 12) | 0x63,
    );
    buf.record_fixup(at, label, FixupKind::Rv64Branch);
}

fn beq(buf: &mut Buffer, rs1: u8, rs2: u8, label: Label) {
    branch(buf, 0, rs1, rs2, label);
}

fn bne(buf: &mut Buffer, rs1: u8, rs2: u8, label: Label) {
    branch(buf, 1, rs1, rs2, label);
}

fn bltu(buf: &mut Buffer, rs1: u8, rs2: u8, label: Label) {
    branch(buf, 6, rs1, rs2, label);
}

fn bnez(buf: &mut Buffer, rs1: u8, label: Label) {
    bne(buf, rs1, ZERO, label);
}

/// jal rd, label via the J-type fixup.
fn emit_jal(buf: &mut Buffer, rd: u8, label: Label) {
    let at = buf.len();
    buf.emit_u32(((rd as u32) << 7) | 0x6F);
    buf.record_fixup(at, label, FixupKind::Rv64Jal);
}

fn jump(buf: &mut Buffer, label: Label) {
    emit_jal(buf, ZERO, label);
}

/// Materialize a 64-bit constant with the standard lui/addi/slli ladder.
fn load_imm(buf: &mut Buffer, rd: u8, imm: i64) {
    if (-2048..=2047).contains(&imm) {
        addi(buf, rd, ZERO, imm as i32);
        return;
    }
    if imm >= i32::MIN as i64 && imm <= i32::MAX as i64 {
        let imm = imm as i32;
        let lo = (imm << 20) >> 20; // low 12, sign-extended
        let hi = imm.wrapping_sub(lo) as u32 >> 12;
        lui(buf, rd, hi & 0xFFFFF);
        if lo != 0 {
            addi(buf, rd, rd, lo);
        }
        return;
    }
    // 64-bit path: build the upper part recursively, shift, add 12 bits.
    let lo = (imm << 52) >> 52;
    let hi = (imm - lo) >> 12;
    load_imm(buf, rd, hi);
    slli(buf, rd, rd, 12);
    if lo != 0 {
        addi(buf, rd, rd, lo as i32);
    }
}

// ======================================================================
// Function emitter
// ======================================================================

struct FnEmitter<'a> {
    buf: &'a mut Buffer,
    module: &'a Module,
    func: &'a Function,
    alloc: Allocation,
    fn_labels: &'a [Label],
    block_labels: Vec<Label>,
    epilogue: Label,
    ret_void: Label,
    alloca_offsets: HashMap<InstId, i32>,
    galactic_areas: HashMap<ValueId, i32>,
    /// Bytes reserved at the top of the frame for ra/fp/callee-saved.
    reserved_head: i32,
    frame_size: i32,
}

impl<'a> FnEmitter<'a> {
    fn new(
        buf: &'a mut Buffer,
        module: &'a Module,
        func: &'a Function,
        fn_labels: &'a [Label],
    ) -> Self {
        let alloc = regalloc::allocate(func, &RV64_ABI);
        let block_labels = func.blocks.iter().map(|_| buf.new_label()).collect();
        let epilogue = buf.new_label();
        let ret_void = buf.new_label();

        let reserved_head = 16 + 8 * alloc.used_callee_saved.len() as i32;
        let mut below = reserved_head + 8 * alloc.num_slots as i32;
        let mut alloca_offsets = HashMap::new();
        let mut galactic_areas = HashMap::new();
        for block in &func.blocks {
            for &inst_id in &block.insts {
                let inst = func.inst(inst_id);
                if inst.op == Opcode::Alloca {
                    let size = match inst.operands.first().map(|&v| &func.value(v).kind) {
                        Some(ValueKind::Const(ConstVal::Int(n))) => *n as i32,
                        _ => 8,
                    };
                    below += ((size.max(8) + 7) / 8) * 8;
                    alloca_offsets.insert(inst_id, below);
                }
                if let Some(result) = inst.result {
                    if matches!(func.value(result).ty.strip_voidable(), Type::Galactic) {
                        below += 64;
                        galactic_areas.insert(result, below);
                    }
                }
            }
        }
        for (vid, v) in func.values.iter().enumerate() {
            if matches!(v.kind, ValueKind::Const(ConstVal::Galactic(_))) {
                below += 64;
                galactic_areas.insert(vid as ValueId, below);
            }
        }

        FnEmitter {
            buf,
            module,
            func,
            alloc,
            fn_labels,
            block_labels,
            epilogue,
            ret_void,
            alloca_offsets,
            galactic_areas,
            reserved_head,
            frame_size: ((below + 15) / 16) * 16,
        }
    }

    fn slot_disp(&self, slot: u32) -> i32 {
        -(self.reserved_head + 8 * (slot as i32 + 1))
    }

    fn emit(&mut self) -> Result<(), String> {
        self.prologue();
        for block in &self.func.blocks {
            self.buf.bind_label(self.block_labels[block.id as usize]);
            for &inst_id in &block.insts {
                self.emit_inst(inst_id)?;
            }
        }
        self.buf.bind_label(self.ret_void);
        addi(self.buf, A0, ZERO, -1); // the VOID literal
        self.buf.bind_label(self.epilogue);
        self.epilogue_body();
        Ok(())
    }

    fn prologue(&mut self) {
        let frame = self.frame_size;
        addi(self.buf, SP, SP, -frame);
        sd(self.buf, RA, SP, frame - 8);
        sd(self.buf, FP, SP, frame - 16);
        addi(self.buf, FP, SP, frame);
        let saved = self.alloc.used_callee_saved.clone();
        for (k, r) in saved.iter().enumerate() {
            if *r == FP {
                continue; // already in the fixed slot
            }
            sd(self.buf, *r, SP, frame - 24 - 8 * k as i32);
        }
        // Parameters into their homes.
        for (i, &param) in self.func.params.iter().enumerate() {
            match self.alloc.location(param) {
                Some(Location::Reg(r)) => {
                    if let Some(&arg) = RV64_ABI.arg_regs.get(i) {
                        if r != arg {
                            addi(self.buf, r, arg, 0);
                        }
                    }
                }
                Some(Location::Slot(slot)) => {
                    if let Some(&arg) = RV64_ABI.arg_regs.get(i) {
                        sd(self.buf, arg, FP, self.slot_disp(slot));
                    } else {
                        let k = (i - RV64_ABI.arg_regs.len()) as i32;
                        ld(self.buf, T0, FP, 8 * k);
                        sd(self.buf, T0, FP, self.slot_disp(slot));
                    }
                }
                None => {}
            }
        }
    }

    fn epilogue_body(&mut self) {
        let frame = self.frame_size;
        let saved = self.alloc.used_callee_saved.clone();
        for (k, r) in saved.iter().enumerate() {
            if *r == FP {
                continue;
            }
            ld(self.buf, *r, SP, frame - 24 - 8 * k as i32);
        }
        ld(self.buf, RA, SP, frame - 8);
        ld(self.buf, FP, SP, frame - 16);
        addi(self.buf, SP, SP, frame);
        jalr(self.buf, ZERO, RA, 0);
    }

    fn load_value(&mut self, dst: u8, v: ValueId) {
        match &self.func.value(v).kind {
            ValueKind::Const(c) => match c {
                ConstVal::Int(bits) => load_imm(self.buf, dst, *bits as i64),
                ConstVal::Bool(b) => addi(self.buf, dst, ZERO, *b as i32),
                ConstVal::Void => addi(self.buf, dst, ZERO, -1),
                ConstVal::Unit => addi(self.buf, dst, ZERO, 0),
                ConstVal::Scalar(s) => {
                    load_imm(self.buf, dst, ((s.to_bits() >> 32) as u64) as i64)
                }
                ConstVal::Galactic(g) => {
                    let area = self.galactic_areas.get(&v).copied();
                    match area {
                        Some(disp) => {
                            for (i, c) in [g.w, g.x, g.y, g.z].into_iter().enumerate() {
                                let bits = c.to_bits();
                                load_imm(self.buf, T2, bits as u64 as i64);
                                sd(self.buf, T2, FP, -disp + 16 * i as i32);
                                load_imm(self.buf, T2, (bits >> 64) as u64 as i64);
                                sd(self.buf, T2, FP, -disp + 16 * i as i32 + 8);
                            }
                            addi(self.buf, dst, FP, -disp);
                        }
                        None => addi(self.buf, dst, ZERO, 0),
                    }
                }
            },
            ValueKind::Str(id) => load_imm(self.buf, dst, *id as i64),
            ValueKind::FuncRef(id) => {
                // auipc-free simplification: jal over a landing pad would
                // be baroque; use the label offset patched as an absolute
                // via the jump table is unavailable, so load the code
                // offset as an immediate resolved by the host loader.
                load_imm(self.buf, dst, *id as i64);
            }
            ValueKind::Global(_) => addi(self.buf, dst, ZERO, 0),
            ValueKind::Param(_) | ValueKind::VReg { .. } => match self.alloc.location(v) {
                Some(Location::Reg(r)) => {
                    if r != dst {
                        addi(self.buf, dst, r, 0);
                    }
                }
                Some(Location::Slot(slot)) => ld(self.buf, dst, FP, self.slot_disp(slot)),
                None => addi(self.buf, dst, ZERO, 0),
            },
        }
    }

    fn store_result(&mut self, v: Option<ValueId>, src: u8) {
        let Some(v) = v else { return };
        match self.alloc.location(v) {
            Some(Location::Reg(r)) => {
                if r != src {
                    addi(self.buf, r, src, 0);
                }
            }
            Some(Location::Slot(slot)) => sd(self.buf, src, FP, self.slot_disp(slot)),
            None => {}
        }
    }

    /// Load an argument after `emit_call_saves`: a value living in one of
    /// the saved registers reads from its stack copy so earlier argument
    /// moves cannot clobber it.
    fn load_arg_saved(&mut self, dst: u8, v: ValueId) {
        if matches!(
            self.func.value(v).kind,
            ValueKind::Param(_) | ValueKind::VReg { .. }
        ) {
            if let Some(Location::Reg(r)) = self.alloc.location(v) {
                if let Some(k) = CALL_PRESERVED.iter().position(|&p| p == r) {
                    ld(self.buf, dst, SP, 8 * k as i32);
                    return;
                }
            }
        }
        self.load_value(dst, v);
    }

    /// `srli t2, reg, 63; bnez t2, label`: the canonical VOID test.
    fn jump_if_void(&mut self, reg: u8, label: Label) {
        srli(self.buf, T2, reg, 63);
        bnez(self.buf, T2, label);
    }

    fn operand_may_be_void(&self, inst: &Inst) -> bool {
        inst.operands.iter().any(|&v| self.func.value(v).may_be_void)
    }

    fn emit_inst(&mut self, inst_id: InstId) -> Result<(), String> {
        let inst = self.func.inst(inst_id).clone();
        match inst.op {
            Opcode::Nop => {}
            Opcode::SubstrateEnter => {
                addi(self.buf, SP, SP, -16);
                sd(self.buf, S10, SP, 0);
            }
            Opcode::SubstrateExit => {
                ld(self.buf, S10, SP, 0);
                addi(self.buf, SP, SP, 16);
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Sar => self.emit_alu(&inst),
            Opcode::Div | Opcode::Mod => self.emit_div(&inst),
            Opcode::Neg => {
                self.load_value(T0, inst.operands[0]);
                let done = self.buf.new_label();
                if self.operand_may_be_void(&inst) {
                    let void_l = self.buf.new_label();
                    self.jump_if_void(T0, void_l);
                    sub(self.buf, T0, ZERO, T0);
                    jump(self.buf, done);
                    self.buf.bind_label(void_l);
                    addi(self.buf, T0, ZERO, -1);
                } else {
                    sub(self.buf, T0, ZERO, T0);
                }
                self.buf.bind_label(done);
                self.store_result(inst.result, T0);
            }
            Opcode::Not => {
                self.load_value(T0, inst.operands[0]);
                // xori t0, t0, -1
                i_type(self.buf, -1, T0, 4, T0, 0x13);
                self.store_result(inst.result, T0);
            }

            Opcode::CmpEq
            | Opcode::CmpNe
            | Opcode::CmpLt
            | Opcode::CmpLe
            | Opcode::CmpGt
            | Opcode::CmpGe
            | Opcode::CmpLtU
            | Opcode::CmpLeU
            | Opcode::CmpGtU
            | Opcode::CmpGeU => self.emit_cmp(&inst),

            Opcode::VoidTest => {
                self.load_value(T0, inst.operands[0]);
                srli(self.buf, T0, T0, 63);
                self.store_result(inst.result, T0);
            }
            Opcode::VoidProp => {
                self.load_value(T0, inst.operands[0]);
                self.jump_if_void(T0, self.ret_void);
                self.store_result(inst.result, T0);
            }
            Opcode::VoidAssert => {
                self.load_value(T0, inst.operands[0]);
                let ok = self.buf.new_label();
                srli(self.buf, T2, T0, 63);
                beq(self.buf, T2, ZERO, ok);
                ebreak(self.buf);
                self.buf.bind_label(ok);
                self.store_result(inst.result, T0);
            }
            Opcode::VoidCoalesce => {
                self.load_value(T0, inst.operands[0]);
                self.load_value(T1, inst.operands[1]);
                let done = self.buf.new_label();
                srli(self.buf, T2, T0, 63);
                beq(self.buf, T2, ZERO, done);
                addi(self.buf, T0, T1, 0);
                self.buf.bind_label(done);
                self.store_result(inst.result, T0);
            }
            Opcode::VoidConst => {
                addi(self.buf, T0, ZERO, -1);
                self.store_result(inst.result, T0);
            }

            Opcode::CapLoad => self.emit_cap_load(&inst),
            Opcode::CapStore => self.emit_cap_store(&inst),
            Opcode::CapCheck => {
                let void_l = self.buf.new_label();
                let done = self.buf.new_label();
                self.load_value(T0, inst.operands[0]);
                self.load_value(T1, inst.operands[1]);
                self.emit_cap_checks(void_l, PERM_READ);
                addi(self.buf, T0, ZERO, 1);
                jump(self.buf, done);
                self.buf.bind_label(void_l);
                addi(self.buf, T0, ZERO, 0);
                self.buf.bind_label(done);
                self.store_result(inst.result, T0);
            }
            Opcode::CapCreate | Opcode::CapNarrow | Opcode::CapSplit | Opcode::CapRevoke => {
                self.emit_call_saves();
                for (i, &arg) in inst.operands.iter().enumerate() {
                    if let Some(&reg) = RV64_ABI.arg_regs.get(i) {
                        self.load_arg_saved(reg, arg);
                    }
                }
                ld(self.buf, T0, S11, 8);
                jalr(self.buf, RA, T0, 0);
                addi(self.buf, T0, A0, 0);
                self.emit_call_restores();
                self.store_result(inst.result, T0);
            }

            Opcode::Alloca => {
                let disp = self.alloca_offsets.get(&inst_id).copied().unwrap_or(8);
                addi(self.buf, T0, FP, -disp);
                self.store_result(inst.result, T0);
            }
            Opcode::Load => {
                self.load_value(T0, inst.operands[0]);
                ld(self.buf, T0, T0, 0);
                self.store_result(inst.result, T0);
            }
            Opcode::Store => {
                self.load_value(T0, inst.operands[0]);
                self.load_value(T1, inst.operands[1]);
                sd(self.buf, T1, T0, 0);
            }
            Opcode::MemCpy => {
                // Byte loop: while (len--) *dst++ = *src++
                self.load_value(T0, inst.operands[0]);
                self.load_value(T1, inst.operands[1]);
                self.load_value(T2, inst.operands[2]);
                let loop_l = self.buf.new_label();
                let done = self.buf.new_label();
                self.buf.bind_label(loop_l);
                beq(self.buf, T2, ZERO, done);
                i_type(self.buf, 0, T1, 0, T3, 0x03); // lb t3, 0(t1)
                s_type(self.buf, 0, T3, T0, 0, 0x23); // sb t3, 0(t0)
                addi(self.buf, T0, T0, 1);
                addi(self.buf, T1, T1, 1);
                addi(self.buf, T2, T2, -1);
                jump(self.buf, loop_l);
                self.buf.bind_label(done);
            }
            Opcode::MemSet => {
                self.load_value(T0, inst.operands[0]);
                self.load_value(T1, inst.operands[1]);
                self.load_value(T2, inst.operands[2]);
                let loop_l = self.buf.new_label();
                let done = self.buf.new_label();
                self.buf.bind_label(loop_l);
                beq(self.buf, T2, ZERO, done);
                s_type(self.buf, 0, T1, T0, 0, 0x23); // sb t1, 0(t0)
                addi(self.buf, T0, T0, 1);
                addi(self.buf, T2, T2, -1);
                jump(self.buf, loop_l);
                self.buf.bind_label(done);
            }
            Opcode::Gep => {
                self.load_value(T0, inst.operands[0]);
                self.load_value(T1, inst.operands[1]);
                add(self.buf, T0, T0, T1);
                self.store_result(inst.result, T0);
            }

            Opcode::AtlasBegin => self.emit_runtime_call(&inst, RuntimeSlot::AtlasBegin),
            Opcode::AtlasCommit => self.emit_runtime_call(&inst, RuntimeSlot::AtlasCommit),
            Opcode::AtlasRollback => self.emit_runtime_call(&inst, RuntimeSlot::AtlasRollback),
            Opcode::AtlasLoad => self.emit_runtime_call(&inst, RuntimeSlot::AtlasLoad),
            Opcode::AtlasStore => self.emit_runtime_call(&inst, RuntimeSlot::AtlasStore),
            Opcode::AetherLoad => self.emit_runtime_call(&inst, RuntimeSlot::AetherLoad),
            Opcode::AetherStore => self.emit_runtime_call(&inst, RuntimeSlot::AetherStore),
            Opcode::AetherSync => self.emit_runtime_call(&inst, RuntimeSlot::AetherSync),
            Opcode::ChrononNow => self.emit_runtime_call(&inst, RuntimeSlot::ChrononNow),
            Opcode::ChrononDelta => self.emit_runtime_call(&inst, RuntimeSlot::ChrononDelta),
            Opcode::ChrononBudget => self.emit_runtime_call(&inst, RuntimeSlot::ChrononBudget),
            Opcode::ChrononYield => self.emit_runtime_call(&inst, RuntimeSlot::ChrononYield),

            Opcode::Jump => jump(self.buf, self.block_labels[inst.targets[0] as usize]),
            Opcode::Branch => {
                let then_l = self.block_labels[inst.targets[0] as usize];
                let else_l = self.block_labels[inst.targets[1] as usize];
                self.load_value(T0, inst.operands[0]);
                self.jump_if_void(T0, else_l);
                bnez(self.buf, T0, then_l);
                jump(self.buf, else_l);
            }
            Opcode::Switch => {
                self.load_value(T0, inst.operands[0]);
                let default = *inst.targets.last().expect("switch default");
                for (i, &case_v) in inst.operands[1..].iter().enumerate() {
                    self.load_value(T1, case_v);
                    beq(self.buf, T0, T1, self.block_labels[inst.targets[i] as usize]);
                }
                jump(self.buf, self.block_labels[default as usize]);
            }
            Opcode::Call => {
                let callee = inst.callee.ok_or("call without callee")?;
                self.emit_call_saves();
                for (i, &arg) in inst.operands.iter().enumerate() {
                    if let Some(&reg) = RV64_ABI.arg_regs.get(i) {
                        self.load_arg_saved(reg, arg);
                    }
                }
                emit_jal(self.buf, RA, self.fn_labels[callee as usize]);
                addi(self.buf, T0, A0, 0);
                self.emit_call_restores();
                self.store_result(inst.result, T0);
            }
            Opcode::CallIndirect => {
                self.emit_call_saves();
                self.load_arg_saved(T1, inst.operands[0]);
                for (i, &arg) in inst.operands[1..].iter().enumerate() {
                    if let Some(&reg) = RV64_ABI.arg_regs.get(i) {
                        self.load_arg_saved(reg, arg);
                    }
                }
                jalr(self.buf, RA, T1, 0);
                addi(self.buf, T0, A0, 0);
                self.emit_call_restores();
                self.store_result(inst.result, T0);
            }
            Opcode::TailCall => {
                let callee = inst.callee.ok_or("tail call without callee")?;
                for (i, &arg) in inst.operands.iter().enumerate() {
                    if let Some(&reg) = RV64_ABI.arg_regs.get(i) {
                        self.load_value(reg, arg);
                    }
                }
                // Unwind, then jump.
                let frame = self.frame_size;
                let saved = self.alloc.used_callee_saved.clone();
                for (k, r) in saved.iter().enumerate() {
                    if *r != FP {
                        ld(self.buf, *r, SP, frame - 24 - 8 * k as i32);
                    }
                }
                ld(self.buf, RA, SP, frame - 8);
                ld(self.buf, FP, SP, frame - 16);
                addi(self.buf, SP, SP, frame);
                jump(self.buf, self.fn_labels[callee as usize]);
            }
            Opcode::Syscall => {
                self.emit_call_saves();
                self.load_arg_saved(17, inst.operands[0]); // a7
                for (i, &arg) in inst.operands[1..].iter().enumerate() {
                    if let Some(&reg) = RV64_ABI.arg_regs.get(i) {
                        self.load_arg_saved(reg, arg);
                    }
                }
                buf_ecall(self.buf);
                addi(self.buf, T0, A0, 0);
                self.emit_call_restores();
                self.store_result(inst.result, T0);
            }
            Opcode::Return => {
                if let Some(&v) = inst.operands.first() {
                    self.load_value(A0, v);
                } else {
                    addi(self.buf, A0, ZERO, 0);
                }
                jump(self.buf, self.epilogue);
            }
            Opcode::Unreachable | Opcode::Trap => ebreak(self.buf),

            Opcode::GalAdd => self.emit_gal_add(&inst),
            Opcode::GalMul => self.emit_gal_helper(&inst, RuntimeSlot::GalacticMul),
            Opcode::GalDiv => self.emit_gal_helper(&inst, RuntimeSlot::GalacticDiv),
            Opcode::GalPredict => self.emit_gal_helper(&inst, RuntimeSlot::GalacticPredict),
            Opcode::GalExtract | Opcode::ExtractField | Opcode::ExtractElem => {
                self.load_value(T0, inst.operands[0]);
                self.load_value(T1, inst.operands[1]);
                slli(self.buf, T1, T1, 4);
                add(self.buf, T0, T0, T1);
                ld(self.buf, T0, T0, 0);
                self.store_result(inst.result, T0);
            }
            Opcode::GalInsert | Opcode::InsertField | Opcode::InsertElem => {
                self.load_value(T0, inst.operands[0]);
                self.load_value(T1, inst.operands[1]);
                slli(self.buf, T1, T1, 4);
                add(self.buf, T1, T0, T1);
                self.load_value(T2, inst.operands[2]);
                sd(self.buf, T2, T1, 0);
                self.store_result(inst.result, T0);
            }

            Opcode::Trunc | Opcode::Zext | Opcode::Sext | Opcode::Bitcast => {
                self.load_value(T0, inst.operands[0]);
                self.store_result(inst.result, T0);
            }
            Opcode::ToScalar => {
                self.load_value(T0, inst.operands[0]);
                slli(self.buf, T0, T0, 32);
                self.store_result(inst.result, T0);
            }
            Opcode::FromScalar => {
                self.load_value(T0, inst.operands[0]);
                srai(self.buf, T0, T0, 32);
                self.store_result(inst.result, T0);
            }
            Opcode::ToGalactic | Opcode::FromGalactic => {
                self.load_value(T0, inst.operands[0]);
                self.store_result(inst.result, T0);
            }

            Opcode::Phi => {
                self.load_value(T0, inst.operands[0]);
                self.store_result(inst.result, T0);
            }
            Opcode::Select => {
                self.load_value(T0, inst.operands[0]);
                self.load_value(T1, inst.operands[1]);
                self.load_value(T2, inst.operands[2]);
                let done = self.buf.new_label();
                bnez(self.buf, T0, done);
                addi(self.buf, T1, T2, 0);
                self.buf.bind_label(done);
                self.store_result(inst.result, T1);
            }
        }
        Ok(())
    }

    fn emit_alu(&mut self, inst: &Inst) {
        self.load_value(T0, inst.operands[0]);
        self.load_value(T1, inst.operands[1]);
        let done = self.buf.new_label();
        let scalar_mul = inst.op == Opcode::Mul
            && inst
                .result
                .is_some_and(|r| matches!(self.func.value(r).ty.strip_voidable(), Type::Scalar));
        let body = |e: &mut Self| {
            match inst.op {
                Opcode::Add => add(e.buf, T0, T0, T1),
                Opcode::Sub => sub(e.buf, T0, T0, T1),
                Opcode::Mul if scalar_mul => {
                    // Fixed-point: (a*b) >> 32 from the 128-bit product.
                    mulh(e.buf, T3, T0, T1);
                    mul(e.buf, T0, T0, T1);
                    srli(e.buf, T0, T0, 32);
                    slli(e.buf, T3, T3, 32);
                    or(e.buf, T0, T0, T3);
                }
                Opcode::Mul => mul(e.buf, T0, T0, T1),
                Opcode::And => and(e.buf, T0, T0, T1),
                Opcode::Or => or(e.buf, T0, T0, T1),
                Opcode::Xor => xor(e.buf, T0, T0, T1),
                Opcode::Shl => sll(e.buf, T0, T0, T1),
                Opcode::Shr => srl(e.buf, T0, T0, T1),
                _ => sra(e.buf, T0, T0, T1),
            };
        };
        if self.operand_may_be_void(inst) {
            let void_l = self.buf.new_label();
            self.jump_if_void(T0, void_l);
            self.jump_if_void(T1, void_l);
            body(self);
            jump(self.buf, done);
            self.buf.bind_label(void_l);
            addi(self.buf, T0, ZERO, -1);
        } else {
            body(self);
        }
        self.buf.bind_label(done);
        self.store_result(inst.result, T0);
    }

    /// Division with the mandated guard shape: `beq rs2, zero, .void`
    /// before the `div`, all through labels.
    fn emit_div(&mut self, inst: &Inst) {
        self.load_value(T0, inst.operands[0]);
        self.load_value(T1, inst.operands[1]);
        let void_l = self.buf.new_label();
        let done = self.buf.new_label();
        self.jump_if_void(T0, void_l);
        self.jump_if_void(T1, void_l);
        beq(self.buf, T1, ZERO, void_l);
        let scalar = inst
            .result
            .is_some_and(|r| matches!(self.func.value(r).ty.strip_voidable(), Type::Scalar));
        if inst.op == Opcode::Mod {
            rem(self.buf, T0, T0, T1);
        } else if scalar {
            // Fixed-point quotient: (a/b) << 32 plus ((a%b) << 32) / b.
            div(self.buf, T2, T0, T1);
            rem(self.buf, T3, T0, T1);
            slli(self.buf, T2, T2, 32);
            slli(self.buf, T3, T3, 32);
            div(self.buf, T3, T3, T1);
            add(self.buf, T0, T2, T3);
        } else {
            div(self.buf, T0, T0, T1);
        }
        jump(self.buf, done);
        self.buf.bind_label(void_l);
        addi(self.buf, T0, ZERO, -1);
        self.buf.bind_label(done);
        self.store_result(inst.result, T0);
    }

    fn emit_cmp(&mut self, inst: &Inst) {
        self.load_value(T0, inst.operands[0]);
        self.load_value(T1, inst.operands[1]);
        let done = self.buf.new_label();
        let compute = |e: &mut Self| {
            match inst.op {
                Opcode::CmpEq => {
                    xor(e.buf, T0, T0, T1);
                    sltu(e.buf, T0, ZERO, T0); // != 0
                    i_type(e.buf, 1, T0, 4, T0, 0x13); // xori: invert
                }
                Opcode::CmpNe => {
                    xor(e.buf, T0, T0, T1);
                    sltu(e.buf, T0, ZERO, T0);
                }
                Opcode::CmpLt => slt(e.buf, T0, T0, T1),
                Opcode::CmpGt => slt(e.buf, T0, T1, T0),
                Opcode::CmpLe => {
                    slt(e.buf, T0, T1, T0);
                    i_type(e.buf, 1, T0, 4, T0, 0x13);
                }
                Opcode::CmpGe => {
                    slt(e.buf, T0, T0, T1);
                    i_type(e.buf, 1, T0, 4, T0, 0x13);
                }
                Opcode::CmpLtU => sltu(e.buf, T0, T0, T1),
                Opcode::CmpGtU => sltu(e.buf, T0, T1, T0),
                Opcode::CmpLeU => {
                    sltu(e.buf, T0, T1, T0);
                    i_type(e.buf, 1, T0, 4, T0, 0x13);
                }
                _ => {
                    sltu(e.buf, T0, T0, T1);
                    i_type(e.buf, 1, T0, 4, T0, 0x13);
                }
            };
        };
        if self.operand_may_be_void(inst) {
            let void_l = self.buf.new_label();
            self.jump_if_void(T0, void_l);
            self.jump_if_void(T1, void_l);
            compute(self);
            jump(self.buf, done);
            self.buf.bind_label(void_l);
            addi(self.buf, T0, ZERO, -1);
        } else {
            compute(self);
        }
        self.buf.bind_label(done);
        self.store_result(inst.result, T0);
    }

    /// Generation, bounds (covering the 8-byte access width), then the
    /// permission bit the access needs, each a branch to the VOID tail.
    fn emit_cap_checks(&mut self, void_l: Label, need: i32) {
        ld(self.buf, T2, T0, CAP_GENERATION);
        ld(self.buf, T3, S11, 0);
        bne(self.buf, T2, T3, void_l);
        // bounds: offset + 8 <= length; a wrapped sum fails
        addi(self.buf, T3, T1, CAP_ACCESS_WIDTH);
        bltu(self.buf, T3, T1, void_l); // wrapped past zero
        ld(self.buf, T2, T0, CAP_LENGTH);
        bltu(self.buf, T2, T3, void_l); // length < offset + 8
        ld(self.buf, T2, T0, CAP_PERMS);
        i_type(self.buf, need, T2, 7, T2, 0x13); // andi t2, t2, need
        beq(self.buf, T2, ZERO, void_l);
    }

    fn emit_cap_load(&mut self, inst: &Inst) {
        let void_l = self.buf.new_label();
        let done = self.buf.new_label();
        self.load_value(T0, inst.operands[0]);
        self.load_value(T1, inst.operands[1]);
        self.emit_cap_checks(void_l, PERM_READ);
        ld(self.buf, T2, T0, CAP_BASE);
        add(self.buf, T2, T2, T1);
        ld(self.buf, T0, T2, 0);
        jump(self.buf, done);
        self.buf.bind_label(void_l);
        addi(self.buf, T0, ZERO, -1);
        self.buf.bind_label(done);
        self.store_result(inst.result, T0);
    }

    fn emit_cap_store(&mut self, inst: &Inst) {
        // Stores need the WRITE bit, not READ.
        let skip = self.buf.new_label();
        self.load_value(T0, inst.operands[0]);
        self.load_value(T1, inst.operands[1]);
        self.emit_cap_checks(skip, PERM_WRITE);
        ld(self.buf, T2, T0, CAP_BASE);
        add(self.buf, T2, T2, T1);
        self.load_value(T1, inst.operands[2]);
        sd(self.buf, T1, T2, 0);
        self.buf.bind_label(skip);
    }

    fn emit_call_saves(&mut self) {
        let bytes = (((CALL_PRESERVED.len() as i32 * 8) + 15) / 16) * 16;
        addi(self.buf, SP, SP, -bytes);
        for (k, r) in CALL_PRESERVED.iter().enumerate() {
            sd(self.buf, *r, SP, 8 * k as i32);
        }
    }

    fn emit_call_restores(&mut self) {
        let bytes = (((CALL_PRESERVED.len() as i32 * 8) + 15) / 16) * 16;
        for (k, r) in CALL_PRESERVED.iter().enumerate() {
            ld(self.buf, *r, SP, 8 * k as i32);
        }
        addi(self.buf, SP, SP, bytes);
    }

    fn emit_runtime_call(&mut self, inst: &Inst, slot: RuntimeSlot) {
        self.emit_call_saves();
        for (i, &arg) in inst.operands.iter().enumerate() {
            if let Some(&reg) = RV64_ABI.arg_regs.get(i) {
                self.load_arg_saved(reg, arg);
            }
        }
        ld(self.buf, T0, S10, slot.byte_offset());
        jalr(self.buf, RA, T0, 0);
        addi(self.buf, T0, A0, 0);
        self.emit_call_restores();
        self.store_result(inst.result, T0);
    }

    /// Componentwise 128-bit adds: add the low limbs, recover the carry
    /// with sltu, fold it into the high limbs.
    fn emit_gal_add(&mut self, inst: &Inst) {
        let dst = inst
            .result
            .and_then(|r| self.galactic_areas.get(&r).copied())
            .unwrap_or(64);
        // Operand pointers go to t0/t1 once; channel loop reuses t2/t3.
        self.load_value(T0, inst.operands[0]);
        self.load_value(T1, inst.operands[1]);
        for ch in 0..4i32 {
            let off = 16 * ch;
            ld(self.buf, T2, T0, off);
            ld(self.buf, T3, T1, off);
            add(self.buf, T2, T2, T3);
            sltu(self.buf, T3, T2, T3); // carry out of the low limb
            sd(self.buf, T2, FP, -dst + off);
            ld(self.buf, T2, T0, off + 8);
            add(self.buf, T2, T2, T3);
            ld(self.buf, T3, T1, off + 8);
            add(self.buf, T2, T2, T3);
            sd(self.buf, T2, FP, -dst + off + 8);
        }
        addi(self.buf, T0, FP, -dst);
        self.store_result(inst.result, T0);
    }

    fn emit_gal_helper(&mut self, inst: &Inst, slot: RuntimeSlot) {
        let dst = inst
            .result
            .and_then(|r| self.galactic_areas.get(&r).copied());
        self.emit_call_saves();
        self.load_arg_saved(10, inst.operands[0]); // a0
        if inst.operands.len() > 1 {
            self.load_arg_saved(11, inst.operands[1]); // a1
        }
        if let Some(disp) = dst {
            addi(self.buf, 12, FP, -disp); // a2 = destination area
        }
        ld(self.buf, T0, S10, slot.byte_offset());
        jalr(self.buf, RA, T0, 0);
        addi(self.buf, T0, A0, 0);
        self.emit_call_restores();
        match dst {
            Some(disp) => {
                addi(self.buf, T0, FP, -disp);
                self.store_result(inst.result, T0);
            }
            None => self.store_result(inst.result, T0),
        }
    }
}

fn buf_ecall(buf: &mut Buffer) {
    buf.emit_u32(0x0000_0073);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::celestial::builder::Builder;
    use crate::celestial::ir::Function;
    use crate::types::EffectSet;

    fn emit_one(build: impl FnOnce(&mut Builder<'_>)) -> CompiledCode {
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "main",
            vec![Type::I64, Type::I64],
            Type::voidable(Type::I64),
            EffectSet::VOID,
        ));
        let mut b = Builder::new(&mut m, 0);
        build(&mut b);
        emit_module(&m).expect("emit")
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn instructions_are_32_bit_words() {
        let code = emit_one(|b| {
            let v = b.const_int(Type::I64, 1);
            b.ret(Some(v));
        });
        assert_eq!(code.code.len() % 4, 0);
    }

    #[test]
    fn entry_stub_exits_via_ecall() {
        let code = emit_one(|b| {
            let v = b.const_int(Type::I64, 0);
            b.ret(Some(v));
        });
        let ws = words(&code.code);
        // jal ra, main at the start
        assert_eq!(ws[0] & 0x7F, 0x6F);
        assert_eq!((ws[0] >> 7) & 0x1F, 1); // rd = ra
        // li a7, 93 then ecall
        let li_a7 = (93u32 << 20) | (17 << 7) | 0x13;
        assert_eq!(ws[1], li_a7);
        assert_eq!(ws[2], 0x0000_0073);
    }

    #[test]
    fn prologue_matches_the_frame_shape() {
        let code = emit_one(|b| {
            let v = b.const_int(Type::I64, 0);
            b.ret(Some(v));
        });
        let ws = words(&code.code[code.entries[0].offset..]);
        // addi sp, sp, -frame
        assert_eq!(ws[0] & 0xFFFFF, (2 << 15) | (2 << 7) | 0x13);
        let frame = -(((ws[0] as i32) >> 20)) as u32;
        assert_eq!(frame % 16, 0, "frame must be rounded to 16");
        // sd ra, (frame-8)(sp)
        assert_eq!(ws[1] & 0x7F, 0x23);
        assert_eq!((ws[1] >> 20) & 0x1F, 1); // rs2 = ra
        // sd fp, (frame-16)(sp)
        assert_eq!((ws[2] >> 20) & 0x1F, 8); // rs2 = s0/fp
        // addi fp, sp, frame
        assert_eq!(ws[3] & 0xFFF80, (2 << 15) | (8 << 7));
    }

    #[test]
    fn void_literal_is_addi_minus_one() {
        let code = emit_one(|b| {
            let v = b.const_void(Type::I64);
            b.ret(Some(v));
        });
        let ws = words(&code.code);
        // addi t0, x0, -1 = imm 0xFFF
        let expected = (0xFFFu32 << 20) | (5 << 7) | 0x13;
        assert!(ws.contains(&expected));
    }

    #[test]
    fn void_test_is_srli_63_bnez() {
        let code = emit_one(|b| {
            let (x, y) = (b.param(0), b.param(1));
            let q = b.binary(Opcode::Div, Type::I64, x, y);
            b.ret(Some(q));
        });
        let ws = words(&code.code);
        // srli t2, rX, 63: shamt 63, funct3 5, rd=t2
        let found = ws.iter().any(|&w| {
            w & 0x7F == 0x13
                && (w >> 12) & 7 == 5
                && (w >> 7) & 0x1F == 7
                && (w >> 20) & 0x3F == 63
        });
        assert!(found, "no srli t2, _, 63 in the stream");
        // followed somewhere by a bne with rs1=t2 against x0
        let bne_found = ws.iter().any(|&w| {
            w & 0x7F == 0x63 && (w >> 12) & 7 == 1 && (w >> 15) & 0x1F == 7 && (w >> 20) & 0x1F == 0
        });
        assert!(bne_found, "no bnez t2 in the stream");
    }

    #[test]
    fn div_has_beq_zero_guard() {
        let code = emit_one(|b| {
            let (x, y) = (b.param(0), b.param(1));
            let q = b.binary(Opcode::Div, Type::I64, x, y);
            b.ret(Some(q));
        });
        let ws = words(&code.code);
        // beq t1, x0, ... then div t0, t0, t1 later
        let beq_found = ws.iter().any(|&w| {
            w & 0x7F == 0x63 && (w >> 12) & 7 == 0 && (w >> 15) & 0x1F == 6 && (w >> 20) & 0x1F == 0
        });
        assert!(beq_found, "no beq t1, zero guard");
        let div_word = (1u32 << 25) | (6 << 20) | (5 << 15) | (4 << 12) | (5 << 7) | 0x33;
        assert!(ws.contains(&div_word), "no div t0, t0, t1");
    }

    #[test]
    fn trap_is_ebreak() {
        let code = emit_one(|b| {
            let x = b.param(0);
            let v = b.void_assert(x);
            b.ret(Some(v));
        });
        assert!(words(&code.code).contains(&0x0010_0073));
    }

    #[test]
    fn branch_fixups_resolve_in_range() {
        let code = emit_one(|b| {
            let (x, y) = (b.param(0), b.param(1));
            let t = b.add_block();
            let e = b.add_block();
            let c = b.cmp(Opcode::CmpLt, x, y);
            b.branch(c, t, e);
            b.switch_to(t);
            let one = b.const_int(Type::I64, 1);
            b.ret(Some(one));
            b.switch_to(e);
            let two = b.const_int(Type::I64, 2);
            b.ret(Some(two));
        });
        // resolve_fixups succeeded, so every B/J displacement fit; spot
        // check that some branch word has a nonzero immediate.
        let ws = words(&code.code);
        assert!(
            ws.iter()
                .any(|&w| w & 0x7F == 0x63 && w & 0xFE00_0F80 != 0)
        );
    }

    #[test]
    fn direct_call_is_patched_jal() {
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "callee",
            vec![],
            Type::I64,
            EffectSet::NONE,
        ));
        m.functions.push(Function::new(
            "main",
            vec![],
            Type::I64,
            EffectSet::NONE,
        ));
        {
            let mut b = Builder::new(&mut m, 0);
            let v = b.const_int(Type::I64, 7);
            b.ret(Some(v));
        }
        {
            let mut b = Builder::new(&mut m, 1);
            let v = b.call(0, vec![], Type::I64, EffectSet::NONE);
            b.ret(Some(v));
        }
        let code = emit_module(&m).expect("emit");
        let ws = words(&code.code);
        // At least two jal ra: entry->main and main->callee.
        let jal_ra = ws
            .iter()
            .filter(|&&w| w & 0x7F == 0x6F && (w >> 7) & 0x1F == 1)
            .count();
        assert!(jal_ra >= 2, "expected entry and call jal ra, got {}", jal_ra);
    }
}
