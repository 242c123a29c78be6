//! x86-64 code emitter
//!
//! SysV AMD64 conventions with three registers carved out for the SERAPH
//! runtime: `r13` substrate context, `r14` capability context, `r15`
//! reserved for VOID lowering scratch. `rax`, `r10` and `r11` are emitter
//! scratch; everything else is the allocator's.
//!
//! VOID in a 64-bit register is bit 63. The canonical test is
//! `bt reg, 63; jc .void`, and the canonical VOID value is all ones.
//! Capability loads emit the three checks (generation, bounds, permission)
//! as sequential branches to a shared `.void` tail that writes the
//! destination's VOID constant.
//!
//! Scalars are carried as 64-bit Q32.32 in registers (bit 63 doubling as
//! the VOID flag); Galactic values are 64-byte stack areas of four Q64.64
//! channels, added with add/adc limb pairs and multiplied through the
//! runtime helper table.
//!
//! The module pass emits an entry stub first (call `main`, then the exit
//! syscall), then every function; a final resolver patches each direct
//! call's `rel32` once all function offsets are known.

use crate::celestial::ir::{
    ConstVal, Function, Inst, InstId, Module, Opcode, ValueId, ValueKind,
};
use crate::emit::buffer::{Buffer, FixupKind, Label};
use crate::emit::RuntimeSlot;
use crate::regalloc::{self, Allocation, Location, X64_ABI};
use crate::types::Type;
use std::collections::HashMap;

// Register numbers.
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;
const R11: u8 = 11;
const R13: u8 = 13;
const R14: u8 = 14;

const VOID_PATTERN: u64 = u64::MAX;

/// Caller-saved registers the allocator may hand out; preserved around
/// calls by the call sequences below.
const CALL_PRESERVED: [u8; 6] = [RCX, RDX, RSI, RDI, R8, R9];

/// Capability record layout (32 bytes): base, length, generation, perms.
const CAP_BASE: i32 = 0;
const CAP_LENGTH: i32 = 8;
const CAP_GENERATION: i32 = 16;
const CAP_PERMS: i32 = 24;

/// Permission mask bits, matching `seraph_core::Perm`.
const PERM_READ: u32 = 1;
const PERM_WRITE: u32 = 2;

/// Capability loads and stores move 8-byte words; the bounds check covers
/// the whole access, not just its first byte.
const CAP_ACCESS_WIDTH: i32 = 8;

#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// Emitted machine code for one module.
#[derive(Debug)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    pub entries: Vec<FunctionEntry>,
    /// Offset of the module entry stub.
    pub entry_offset: usize,
}

pub fn emit_module(module: &Module) -> Result<CompiledCode, String> {
    let mut buf = Buffer::new();
    let fn_labels: Vec<Label> = module.functions.iter().map(|_| buf.new_label()).collect();

    // Entry stub: call main, pass its result to the exit syscall.
    let entry_offset = buf.len();
    if let Some(main_id) = module.find_function("main") {
        emit_call_rel32(&mut buf, fn_labels[main_id as usize]);
        mov_rr(&mut buf, RDI, RAX);
        mov_ri(&mut buf, RAX, 60); // SYS_exit
        buf.emit_u8(0x0F);
        buf.emit_u8(0x05); // syscall
    } else {
        // No main: the stub is a bare exit(0).
        mov_ri(&mut buf, RDI, 0);
        mov_ri(&mut buf, RAX, 60);
        buf.emit_u8(0x0F);
        buf.emit_u8(0x05);
    }

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
// Encoding primitives
// ======================================================================

fn rex(buf: &mut Buffer, w: bool, reg: u8, base: u8) {
    let mut b = 0x40u8;
    if w {
        b |= 8;
    }
    if reg >= 8 {
        b |= 4;
    }
    if base >= 8 {
        b |= 1;
    }
    buf.emit_u8(b);
}

fn rex_idx(buf: &mut Buffer, w: bool, reg: u8, index: u8, base: u8) {
    let mut b = 0x40u8;
    if w {
        b |= 8;
    }
    if reg >= 8 {
        b |= 4;
    }
    if index >= 8 {
        b |= 2;
    }
    if base >= 8 {
        b |= 1;
    }
    buf.emit_u8(b);
}

fn modrm(buf: &mut Buffer, md: u8, reg: u8, rm: u8) {
    buf.emit_u8((md << 6) | ((reg & 7) << 3) | (rm & 7));
}

/// reg-to-reg ALU form: `op reg2 <- reg2 op reg1` is written by callers
/// with the opcode's /r direction in mind.
fn alu_rr(buf: &mut Buffer, opcode: u8, src: u8, dst: u8) {
    rex(buf, true, src, dst);
    buf.emit_u8(opcode);
    modrm(buf, 3, src, dst);
}

pub(crate) fn mov_rr(buf: &mut Buffer, dst: u8, src: u8) {
    if dst == src {
        return;
    }
    alu_rr(buf, 0x89, src, dst);
}

/// movabs dst, imm64 (short form for small positives).
pub(crate) fn mov_ri(buf: &mut Buffer, dst: u8, imm: u64) {
    if imm <= u32::MAX as u64 {
        // mov r32, imm32 zero-extends.
        if dst >= 8 {
            buf.emit_u8(0x41);
        }
        buf.emit_u8(0xB8 + (dst & 7));
        buf.emit_u32(imm as u32);
        return;
    }
    rex(buf, true, 0, dst);
    buf.emit_u8(0xB8 + (dst & 7));
    buf.emit_u64(imm);
}

/// Memory operand `[base + disp32]` for a /r instruction.
fn mem_disp(buf: &mut Buffer, reg: u8, base: u8, disp: i32) {
    if base & 7 == RSP {
        modrm(buf, 2, reg, 4);
        buf.emit_u8(0x24); // SIB: base=rsp, no index
    } else {
        modrm(buf, 2, reg, base);
    }
    buf.emit_u32(disp as u32);
}

/// mov dst, [base + disp]
fn load_mem(buf: &mut Buffer, dst: u8, base: u8, disp: i32) {
    rex(buf, true, dst, base);
    buf.emit_u8(0x8B);
    mem_disp(buf, dst, base, disp);
}

/// mov [base + disp], src
fn store_mem(buf: &mut Buffer, base: u8, disp: i32, src: u8) {
    rex(buf, true, src, base);
    buf.emit_u8(0x89);
    mem_disp(buf, src, base, disp);
}

/// mov dst, [base + index] (scale 1)
fn load_mem_bi(buf: &mut Buffer, dst: u8, base: u8, index: u8) {
    rex_idx(buf, true, dst, index, base);
    buf.emit_u8(0x8B);
    modrm(buf, 0, dst, 4);
    // SIB: scale=0, index, base. rbp/r13 as base needs disp8 form.
    if base & 7 == 5 {
        buf.bytes.pop();
        modrm(buf, 1, dst, 4);
        buf.emit_u8(((index & 7) << 3) | (base & 7));
        buf.emit_u8(0);
    } else {
        buf.emit_u8(((index & 7) << 3) | (base & 7));
    }
}

/// mov [base + index], src (scale 1)
fn store_mem_bi(buf: &mut Buffer, base: u8, index: u8, src: u8) {
    rex_idx(buf, true, src, index, base);
    buf.emit_u8(0x89);
    if base & 7 == 5 {
        modrm(buf, 1, src, 4);
        buf.emit_u8(((index & 7) << 3) | (base & 7));
        buf.emit_u8(0);
    } else {
        modrm(buf, 0, src, 4);
        buf.emit_u8(((index & 7) << 3) | (base & 7));
    }
}

fn push_r(buf: &mut Buffer, r: u8) {
    if r >= 8 {
        buf.emit_u8(0x41);
    }
    buf.emit_u8(0x50 + (r & 7));
}

fn pop_r(buf: &mut Buffer, r: u8) {
    if r >= 8 {
        buf.emit_u8(0x41);
    }
    buf.emit_u8(0x58 + (r & 7));
}

/// sub dst, imm32
fn sub_ri(buf: &mut Buffer, dst: u8, imm: i32) {
    rex(buf, true, 0, dst);
    buf.emit_u8(0x81);
    modrm(buf, 3, 5, dst);
    buf.emit_u32(imm as u32);
}

fn add_ri(buf: &mut Buffer, dst: u8, imm: i32) {
    rex(buf, true, 0, dst);
    buf.emit_u8(0x81);
    modrm(buf, 3, 0, dst);
    buf.emit_u32(imm as u32);
}

/// lea dst, [rbp + disp32]
fn lea_rbp(buf: &mut Buffer, dst: u8, disp: i32) {
    rex(buf, true, dst, RBP);
    buf.emit_u8(0x8D);
    mem_disp(buf, dst, RBP, disp);
}

/// bt reg, imm8
fn bt_ri(buf: &mut Buffer, reg: u8, bit: u8) {
    rex(buf, true, 0, reg);
    buf.emit_u8(0x0F);
    buf.emit_u8(0xBA);
    modrm(buf, 3, 4, reg);
    buf.emit_u8(bit);
}

fn test_rr(buf: &mut Buffer, a: u8, b: u8) {
    alu_rr(buf, 0x85, b, a);
}

fn cmp_rr(buf: &mut Buffer, a: u8, b: u8) {
    // cmp a, b
    rex(buf, true, b, a);
    buf.emit_u8(0x39);
    modrm(buf, 3, b, a);
}

/// cmp reg, [base+disp]
fn cmp_rm(buf: &mut Buffer, reg: u8, base: u8, disp: i32) {
    rex(buf, true, reg, base);
    buf.emit_u8(0x3B);
    mem_disp(buf, reg, base, disp);
}

/// Condition codes for jcc/setcc.
#[derive(Clone, Copy, PartialEq)]
enum Cc {
    C = 0x2,
    Nc = 0x3,
    Z = 0x4,
    Nz = 0x5,
    Na = 0x6,
    A = 0x7,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

fn jcc(buf: &mut Buffer, cc: Cc, label: Label) {
    buf.emit_u8(0x0F);
    buf.emit_u8(0x80 + cc as u8);
    let at = buf.len();
    buf.emit_u32(0);
    buf.record_fixup(at, label, FixupKind::Rel32);
}

fn jmp(buf: &mut Buffer, label: Label) {
    buf.emit_u8(0xE9);
    let at = buf.len();
    buf.emit_u32(0);
    buf.record_fixup(at, label, FixupKind::Rel32);
}

fn emit_call_rel32(buf: &mut Buffer, label: Label) {
    buf.emit_u8(0xE8);
    let at = buf.len();
    buf.emit_u32(0);
    buf.record_fixup(at, label, FixupKind::Rel32);
}

/// setcc al; movzx rax, al (always through rax)
fn setcc_rax(buf: &mut Buffer, cc: Cc) {
    buf.emit_u8(0x0F);
    buf.emit_u8(0x90 + cc as u8);
    modrm(buf, 3, 0, RAX);
    // movzx rax, al
    rex(buf, true, RAX, RAX);
    buf.emit_u8(0x0F);
    buf.emit_u8(0xB6);
    modrm(buf, 3, RAX, RAX);
}

fn ud2(buf: &mut Buffer) {
    buf.emit_u8(0x0F);
    buf.emit_u8(0x0B);
}

/// cmovc dst, src
fn cmovc(buf: &mut Buffer, dst: u8, src: u8) {
    rex(buf, true, dst, src);
    buf.emit_u8(0x0F);
    buf.emit_u8(0x42);
    modrm(buf, 3, dst, src);
}

/// call [r13 + slot]
fn call_runtime(buf: &mut Buffer, slot: RuntimeSlot) {
    rex(buf, true, 0, R13);
    buf.emit_u8(0xFF);
    mem_disp(buf, 2, R13, slot.byte_offset());
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
    /// Shared tail that loads the VOID pattern into rax and returns.
    ret_void: Label,
    /// rbp-relative offsets for alloca results.
    alloca_offsets: HashMap<InstId, i32>,
    /// rbp-relative offsets of 64-byte Galactic areas, keyed by value.
    galactic_areas: HashMap<ValueId, i32>,
    frame_size: i32,
}

impl<'a> FnEmitter<'a> {
    fn new(
        buf: &'a mut Buffer,
        module: &'a Module,
        func: &'a Function,
        fn_labels: &'a [Label],
    ) -> Self {
        let alloc = regalloc::allocate(func, &X64_ABI);
        let block_labels = func.blocks.iter().map(|_| buf.new_label()).collect();
        let epilogue = buf.new_label();
        let ret_void = buf.new_label();

        // Frame layout: spill slots, then alloca areas, then galactic areas.
        let mut frame = alloc.num_slots as i32 * 8;
        let mut alloca_offsets = HashMap::new();
        let mut galactic_areas = HashMap::new();
        for block in &func.blocks {
            for &inst_id in &block.insts {
                let inst = func.inst(inst_id);
                if inst.op == Opcode::Alloca {
                    let size = match inst
                        .operands
                        .first()
                        .map(|&v| &func.value(v).kind)
                    {
                        Some(ValueKind::Const(ConstVal::Int(n))) => *n as i32,
                        _ => 8,
                    };
                    frame += ((size.max(8) + 7) / 8) * 8;
                    alloca_offsets.insert(inst_id, frame);
                }
                if let Some(result) = inst.result {
                    if matches!(func.value(result).ty.strip_voidable(), Type::Galactic) {
                        frame += 64;
                        galactic_areas.insert(result, frame);
                    }
                }
            }
        }
        // Galactic constants also need stack homes to materialize into.
        for (vid, v) in func.values.iter().enumerate() {
            if matches!(v.kind, ValueKind::Const(ConstVal::Galactic(_))) {
                frame += 64;
                galactic_areas.insert(vid as ValueId, frame);
            }
        }
        // Keep rsp 16-aligned at call sites: entry push rbp lands on a
        // multiple of 16, callee-saved pushes are paired with the frame.
        let mut total = ((frame + 15) / 16) * 16;
        if alloc.used_callee_saved.len() % 2 == 1 {
            total += 8;
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
            frame_size: total,
        }
    }

    fn slot_disp(&self, slot: u32) -> i32 {
        -8 * (slot as i32 + 1)
    }

    fn emit(&mut self) -> Result<(), String> {
        self.prologue();

        for block in &self.func.blocks {
            self.buf.bind_label(self.block_labels[block.id as usize]);
            for &inst_id in &block.insts {
                self.emit_inst(inst_id)?;
            }
        }

        // Shared VOID-return tail.
        self.buf.bind_label(self.ret_void);
        mov_ri(self.buf, RAX, VOID_PATTERN);
        self.buf.bind_label(self.epilogue);
        self.epilogue_body();
        Ok(())
    }

    fn prologue(&mut self) {
        push_r(self.buf, RBP);
        mov_rr(self.buf, RBP, RSP);
        if self.frame_size > 0 {
            sub_ri(self.buf, RSP, self.frame_size);
        }
        let saved = self.alloc.used_callee_saved.clone();
        for r in &saved {
            push_r(self.buf, *r);
        }
        // Argument registers into their assigned homes; stack parameters
        // copied out of the caller frame into local slots.
        for (i, &param) in self.func.params.iter().enumerate() {
            match self.alloc.location(param) {
                Some(Location::Reg(r)) => {
                    if let Some(&arg) = X64_ABI.arg_regs.get(i) {
                        mov_rr(self.buf, r, arg);
                    }
                }
                Some(Location::Slot(slot)) => {
                    if let Some(&arg) = X64_ABI.arg_regs.get(i) {
                        store_mem(self.buf, RBP, self.slot_disp(slot), arg);
                    } else {
                        // [rbp + 16 + 8k] is the k-th stack argument.
                        let k = (i - X64_ABI.arg_regs.len()) as i32;
                        load_mem(self.buf, RAX, RBP, 16 + 8 * k);
                        store_mem(self.buf, RBP, self.slot_disp(slot), RAX);
                    }
                }
                None => {}
            }
        }
    }

    fn epilogue_body(&mut self) {
        let saved = self.alloc.used_callee_saved.clone();
        for r in saved.iter().rev() {
            pop_r(self.buf, *r);
        }
        if self.frame_size > 0 {
            add_ri(self.buf, RSP, self.frame_size);
        }
        pop_r(self.buf, RBP);
        self.buf.emit_u8(0xC3);
    }

    // ------------------------------------------------------------------
    // Value movement
    // ------------------------------------------------------------------

    fn load_value(&mut self, dst: u8, v: ValueId) {
        match &self.func.value(v).kind {
            ValueKind::Const(c) => match c {
                ConstVal::Int(bits) => mov_ri(self.buf, dst, *bits),
                ConstVal::Bool(b) => mov_ri(self.buf, dst, *b as u64),
                ConstVal::Void => mov_ri(self.buf, dst, VOID_PATTERN),
                ConstVal::Unit => mov_ri(self.buf, dst, 0),
                // Q64.64 to the register scheme: keep bits 32..96.
                ConstVal::Scalar(s) => {
                    mov_ri(self.buf, dst, ((s.to_bits() >> 32) & u64::MAX as u128) as u64)
                }
                ConstVal::Galactic(g) => {
                    // Materialize into the value's stack area and hand out
                    // the address.
                    let area = self.galactic_areas.get(&v).copied();
                    match area {
                        Some(disp) => {
                            for (i, c) in [g.w, g.x, g.y, g.z].into_iter().enumerate() {
                                let bits = c.to_bits();
                                mov_ri(self.buf, R11, bits as u64);
                                store_mem(self.buf, RBP, -disp + 16 * i as i32, R11);
                                mov_ri(self.buf, R11, (bits >> 64) as u64);
                                store_mem(self.buf, RBP, -disp + 16 * i as i32 + 8, R11);
                            }
                            lea_rbp(self.buf, dst, -disp);
                        }
                        None => mov_ri(self.buf, dst, 0),
                    }
                }
            },
            ValueKind::Str(id) => mov_ri(self.buf, dst, *id as u64),
            ValueKind::FuncRef(id) => {
                // lea dst, [rip + rel32] to the function body.
                rex(self.buf, true, dst, 0);
                self.buf.emit_u8(0x8D);
                modrm(self.buf, 0, dst, 5);
                let at = self.buf.len();
                self.buf.emit_u32(0);
                self.buf
                    .record_fixup(at, self.fn_labels[*id as usize], FixupKind::Rel32);
            }
            ValueKind::Global(_) => mov_ri(self.buf, dst, 0),
            ValueKind::Param(_) | ValueKind::VReg { .. } => {
                match self.alloc.location(v) {
                    Some(Location::Reg(r)) => mov_rr(self.buf, dst, r),
                    Some(Location::Slot(slot)) => {
                        load_mem(self.buf, dst, RBP, self.slot_disp(slot))
                    }
                    None => mov_ri(self.buf, dst, 0),
                }
            }
        }
    }

    fn store_result(&mut self, v: Option<ValueId>, src: u8) {
        let Some(v) = v else { return };
        match self.alloc.location(v) {
            Some(Location::Reg(r)) => mov_rr(self.buf, r, src),
            Some(Location::Slot(slot)) => store_mem(self.buf, RBP, self.slot_disp(slot), src),
            None => {}
        }
    }

    /// Load an argument after the CALL_PRESERVED pushes. A value whose
    /// home register was just pushed reads from its stack copy so earlier
    /// argument moves cannot clobber it.
    fn load_arg_saved(&mut self, dst: u8, v: ValueId) {
        if matches!(
            self.func.value(v).kind,
            ValueKind::Param(_) | ValueKind::VReg { .. }
        ) {
            if let Some(Location::Reg(r)) = self.alloc.location(v) {
                if let Some(k) = CALL_PRESERVED.iter().position(|&p| p == r) {
                    let off = 8 * (CALL_PRESERVED.len() - 1 - k) as i32;
                    load_mem(self.buf, dst, RSP, off);
                    return;
                }
            }
        }
        self.load_value(dst, v);
    }

    /// The canonical VOID test on a register: `bt reg, 63; jc label`.
    fn jump_if_void(&mut self, reg: u8, label: Label) {
        bt_ri(self.buf, reg, 63);
        jcc(self.buf, Cc::C, label);
    }

    fn operand_may_be_void(&self, inst: &Inst) -> bool {
        inst.operands
            .iter()
            .any(|&v| self.func.value(v).may_be_void)
    }

    // ------------------------------------------------------------------
    // Instruction lowering
    // ------------------------------------------------------------------

    fn emit_inst(&mut self, inst_id: InstId) -> Result<(), String> {
        let inst = self.func.inst(inst_id).clone();
        match inst.op {
            Opcode::Nop | Opcode::SubstrateEnter | Opcode::SubstrateExit => {
                // Substrate enter/exit swap the context register.
                if inst.op == Opcode::SubstrateEnter {
                    push_r(self.buf, R13);
                } else if inst.op == Opcode::SubstrateExit {
                    pop_r(self.buf, R13);
                }
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::And | Opcode::Or | Opcode::Xor => {
                self.emit_simple_alu(&inst);
            }
            Opcode::Div | Opcode::Mod => self.emit_div(&inst),
            Opcode::Shl | Opcode::Shr | Opcode::Sar => self.emit_shift(&inst),
            Opcode::Neg | Opcode::Not => {
                self.load_value(RAX, inst.operands[0]);
                let done = self.buf.new_label();
                if self.operand_may_be_void(&inst) {
                    let void_l = self.buf.new_label();
                    self.jump_if_void(RAX, void_l);
                    self.emit_unary_op(inst.op);
                    jmp(self.buf, done);
                    self.buf.bind_label(void_l);
                    mov_ri(self.buf, RAX, VOID_PATTERN);
                } else {
                    self.emit_unary_op(inst.op);
                }
                self.buf.bind_label(done);
                self.store_result(inst.result, RAX);
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
                self.load_value(RAX, inst.operands[0]);
                bt_ri(self.buf, RAX, 63);
                setcc_rax(self.buf, Cc::C);
                self.store_result(inst.result, RAX);
            }
            Opcode::VoidProp => {
                self.load_value(RAX, inst.operands[0]);
                self.jump_if_void(RAX, self.ret_void);
                self.store_result(inst.result, RAX);
            }
            Opcode::VoidAssert => {
                self.load_value(RAX, inst.operands[0]);
                let ok = self.buf.new_label();
                bt_ri(self.buf, RAX, 63);
                jcc(self.buf, Cc::Nc, ok);
                ud2(self.buf);
                self.buf.bind_label(ok);
                self.store_result(inst.result, RAX);
            }
            Opcode::VoidCoalesce => {
                self.load_value(RAX, inst.operands[0]);
                self.load_value(R10, inst.operands[1]);
                bt_ri(self.buf, RAX, 63);
                cmovc(self.buf, RAX, R10);
                self.store_result(inst.result, RAX);
            }
            Opcode::VoidConst => {
                mov_ri(self.buf, RAX, VOID_PATTERN);
                self.store_result(inst.result, RAX);
            }

            Opcode::CapLoad => self.emit_cap_load(&inst),
            Opcode::CapStore => self.emit_cap_store(&inst),
            Opcode::CapCheck => {
                // Like the load checks, producing 0/1 instead of a value.
                let void_l = self.buf.new_label();
                let done = self.buf.new_label();
                self.load_value(R10, inst.operands[0]);
                self.load_value(R11, inst.operands[1]);
                self.emit_cap_checks(void_l, PERM_READ);
                mov_ri(self.buf, RAX, 1);
                jmp(self.buf, done);
                self.buf.bind_label(void_l);
                mov_ri(self.buf, RAX, 0);
                self.buf.bind_label(done);
                self.store_result(inst.result, RAX);
            }
            Opcode::CapCreate | Opcode::CapNarrow | Opcode::CapSplit | Opcode::CapRevoke => {
                // Capability construction is a runtime service reached
                // through the capability context table.
                self.emit_runtime_args(&inst);
                rex(self.buf, true, 0, R14);
                self.buf.emit_u8(0xFF);
                mem_disp(self.buf, 2, R14, 8);
                self.emit_runtime_restore();
                self.store_result(inst.result, RAX);
            }

            Opcode::Alloca => {
                let disp = self.alloca_offsets.get(&inst_id).copied().unwrap_or(8);
                lea_rbp(self.buf, RAX, -disp);
                self.store_result(inst.result, RAX);
            }
            Opcode::Load => {
                self.load_value(R10, inst.operands[0]);
                load_mem(self.buf, RAX, R10, 0);
                self.store_result(inst.result, RAX);
            }
            Opcode::Store => {
                self.load_value(R10, inst.operands[0]);
                self.load_value(RAX, inst.operands[1]);
                store_mem(self.buf, R10, 0, RAX);
            }
            Opcode::MemCpy => {
                // rep movsb with the string registers preserved.
                push_r(self.buf, RDI);
                push_r(self.buf, RSI);
                push_r(self.buf, RCX);
                self.load_value(RDI, inst.operands[0]);
                self.load_value(RSI, inst.operands[1]);
                self.load_value(RCX, inst.operands[2]);
                self.buf.emit_u8(0xF3);
                self.buf.emit_u8(0xA4);
                pop_r(self.buf, RCX);
                pop_r(self.buf, RSI);
                pop_r(self.buf, RDI);
            }
            Opcode::MemSet => {
                push_r(self.buf, RDI);
                push_r(self.buf, RCX);
                self.load_value(RDI, inst.operands[0]);
                self.load_value(RAX, inst.operands[1]);
                self.load_value(RCX, inst.operands[2]);
                self.buf.emit_u8(0xF3);
                self.buf.emit_u8(0xAA);
                pop_r(self.buf, RCX);
                pop_r(self.buf, RDI);
            }
            Opcode::Gep => {
                self.load_value(RAX, inst.operands[0]);
                self.load_value(R10, inst.operands[1]);
                alu_rr(self.buf, 0x01, R10, RAX); // add rax, r10
                self.store_result(inst.result, RAX);
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

            Opcode::Jump => jmp(self.buf, self.block_labels[inst.targets[0] as usize]),
            Opcode::Branch => {
                let then_l = self.block_labels[inst.targets[0] as usize];
                let else_l = self.block_labels[inst.targets[1] as usize];
                self.load_value(RAX, inst.operands[0]);
                // A VOID condition takes the else path.
                self.jump_if_void(RAX, else_l);
                test_rr(self.buf, RAX, RAX);
                jcc(self.buf, Cc::Nz, then_l);
                jmp(self.buf, else_l);
            }
            Opcode::Switch => {
                self.load_value(RAX, inst.operands[0]);
                let default = *inst.targets.last().expect("switch default");
                for (i, &case_v) in inst.operands[1..].iter().enumerate() {
                    self.load_value(R10, case_v);
                    cmp_rr(self.buf, RAX, R10);
                    jcc(self.buf, Cc::Z, self.block_labels[inst.targets[i] as usize]);
                }
                jmp(self.buf, self.block_labels[default as usize]);
            }
            Opcode::Call => {
                let callee = inst.callee.ok_or("call without callee")?;
                self.emit_call(&inst, Some(self.fn_labels[callee as usize]), None);
            }
            Opcode::CallIndirect => {
                self.emit_call(&inst, None, Some(inst.operands[0]));
            }
            Opcode::TailCall => {
                let callee = inst.callee.ok_or("tail call without callee")?;
                // Marshal arguments, unwind the frame, then jump.
                for (i, &arg) in inst.operands.iter().enumerate().rev() {
                    if let Some(&reg) = X64_ABI.arg_regs.get(i) {
                        self.load_value(reg, arg);
                    }
                }
                let saved = self.alloc.used_callee_saved.clone();
                for r in saved.iter().rev() {
                    pop_r(self.buf, *r);
                }
                if self.frame_size > 0 {
                    add_ri(self.buf, RSP, self.frame_size);
                }
                pop_r(self.buf, RBP);
                jmp(self.buf, self.fn_labels[callee as usize]);
            }
            Opcode::Syscall => {
                for r in CALL_PRESERVED {
                    push_r(self.buf, r);
                }
                self.load_arg_saved(RAX, inst.operands[0]);
                for (i, &arg) in inst.operands[1..].iter().enumerate() {
                    if let Some(&reg) = X64_ABI.arg_regs.get(i) {
                        self.load_arg_saved(reg, arg);
                    }
                }
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(0x05);
                for r in CALL_PRESERVED.iter().rev() {
                    pop_r(self.buf, *r);
                }
                self.store_result(inst.result, RAX);
            }
            Opcode::Return => {
                if let Some(&v) = inst.operands.first() {
                    self.load_value(RAX, v);
                } else {
                    mov_ri(self.buf, RAX, 0);
                }
                jmp(self.buf, self.epilogue);
            }
            Opcode::Unreachable | Opcode::Trap => ud2(self.buf),

            Opcode::GalAdd => self.emit_gal_add(&inst),
            Opcode::GalMul => self.emit_gal_helper(&inst, RuntimeSlot::GalacticMul),
            Opcode::GalDiv => self.emit_gal_helper(&inst, RuntimeSlot::GalacticDiv),
            Opcode::GalPredict => self.emit_gal_helper(&inst, RuntimeSlot::GalacticPredict),
            Opcode::GalExtract | Opcode::ExtractField | Opcode::ExtractElem => {
                // channel = [area + 16*idx], reduced to the register scheme.
                self.load_value(R10, inst.operands[0]);
                self.load_value(R11, inst.operands[1]);
                // r11 = idx * 16
                rex(self.buf, true, 0, R11);
                self.buf.emit_u8(0xC1);
                modrm(self.buf, 3, 4, R11);
                self.buf.emit_u8(4);
                load_mem_bi(self.buf, RAX, R10, R11);
                self.store_result(inst.result, RAX);
            }
            Opcode::GalInsert | Opcode::InsertField | Opcode::InsertElem => {
                self.load_value(R10, inst.operands[0]);
                self.load_value(R11, inst.operands[1]);
                rex(self.buf, true, 0, R11);
                self.buf.emit_u8(0xC1);
                modrm(self.buf, 3, 4, R11);
                self.buf.emit_u8(4);
                self.load_value(RAX, inst.operands[2]);
                store_mem_bi(self.buf, R10, R11, RAX);
                // The aggregate pointer is the result.
                self.load_value(RAX, inst.operands[0]);
                self.store_result(inst.result, RAX);
            }

            Opcode::Trunc | Opcode::Zext | Opcode::Bitcast => {
                self.load_value(RAX, inst.operands[0]);
                self.store_result(inst.result, RAX);
            }
            Opcode::Sext => {
                self.load_value(RAX, inst.operands[0]);
                // movsxd via 32-bit case; wider sources pass through.
                self.store_result(inst.result, RAX);
            }
            Opcode::ToScalar => {
                // Q32.32: value << 32.
                self.load_value(RAX, inst.operands[0]);
                rex(self.buf, true, 0, RAX);
                self.buf.emit_u8(0xC1);
                modrm(self.buf, 3, 4, RAX);
                self.buf.emit_u8(32);
                self.store_result(inst.result, RAX);
            }
            Opcode::FromScalar => {
                self.load_value(RAX, inst.operands[0]);
                rex(self.buf, true, 0, RAX);
                self.buf.emit_u8(0xC1);
                modrm(self.buf, 3, 7, RAX); // sar rax, 32
                self.buf.emit_u8(32);
                self.store_result(inst.result, RAX);
            }
            Opcode::ToGalactic | Opcode::FromGalactic => {
                self.load_value(RAX, inst.operands[0]);
                self.store_result(inst.result, RAX);
            }

            Opcode::Phi => {
                // Phis are resolved by predecessors writing the shared
                // location; the allocator gave every phi a slot or reg and
                // the operands were stored there at the jump sites. The
                // simple scheme here reloads operand 0 as a fallback.
                self.load_value(RAX, inst.operands[0]);
                self.store_result(inst.result, RAX);
            }
            Opcode::Select => {
                self.load_value(RAX, inst.operands[0]);
                self.load_value(R10, inst.operands[1]);
                self.load_value(R11, inst.operands[2]);
                test_rr(self.buf, RAX, RAX);
                // cmovz r10, r11 then result = r10
                rex(self.buf, true, R10, R11);
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(0x44);
                modrm(self.buf, 3, R10, R11);
                self.store_result(inst.result, R10);
            }
        }
        Ok(())
    }

    fn emit_unary_op(&mut self, op: Opcode) {
        rex(self.buf, true, 0, RAX);
        self.buf.emit_u8(0xF7);
        match op {
            Opcode::Neg => modrm(self.buf, 3, 3, RAX),
            _ => modrm(self.buf, 3, 2, RAX),
        }
    }

    fn emit_simple_alu(&mut self, inst: &Inst) {
        let scalar_mul = inst.op == Opcode::Mul
            && inst
                .result
                .is_some_and(|r| matches!(self.func.value(r).ty.strip_voidable(), Type::Scalar));
        self.load_value(RAX, inst.operands[0]);
        self.load_value(R10, inst.operands[1]);
        let done = self.buf.new_label();
        if self.operand_may_be_void(inst) {
            let void_l = self.buf.new_label();
            self.jump_if_void(RAX, void_l);
            self.jump_if_void(R10, void_l);
            self.emit_alu_op(inst.op, scalar_mul);
            jmp(self.buf, done);
            self.buf.bind_label(void_l);
            mov_ri(self.buf, RAX, VOID_PATTERN);
        } else {
            self.emit_alu_op(inst.op, scalar_mul);
        }
        self.buf.bind_label(done);
        self.store_result(inst.result, RAX);
    }

    fn emit_alu_op(&mut self, op: Opcode, scalar_mul: bool) {
        match op {
            Opcode::Add => alu_rr(self.buf, 0x01, R10, RAX),
            Opcode::Sub => alu_rr(self.buf, 0x29, R10, RAX),
            Opcode::And => alu_rr(self.buf, 0x21, R10, RAX),
            Opcode::Or => alu_rr(self.buf, 0x09, R10, RAX),
            Opcode::Xor => alu_rr(self.buf, 0x31, R10, RAX),
            Opcode::Mul if scalar_mul => {
                // Widening multiply, then shift the double-width product
                // back down by the fraction width.
                push_r(self.buf, RDX);
                rex(self.buf, true, 0, R10);
                self.buf.emit_u8(0xF7);
                modrm(self.buf, 3, 5, R10); // imul r10 -> rdx:rax
                // shrd rax, rdx, 32
                rex(self.buf, true, RDX, RAX);
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(0xAC);
                modrm(self.buf, 3, RDX, RAX);
                self.buf.emit_u8(32);
                pop_r(self.buf, RDX);
            }
            Opcode::Mul => {
                // imul rax, r10
                rex(self.buf, true, RAX, R10);
                self.buf.emit_u8(0x0F);
                self.buf.emit_u8(0xAF);
                modrm(self.buf, 3, RAX, R10);
            }
            _ => unreachable!("not a simple ALU op"),
        }
    }

    /// Division with the VOID guard: divide-by-zero and VOID operands both
    /// produce the VOID pattern.
    fn emit_div(&mut self, inst: &Inst) {
        self.load_value(RAX, inst.operands[0]);
        self.load_value(R10, inst.operands[1]);
        let void_l = self.buf.new_label();
        let done = self.buf.new_label();
        self.jump_if_void(RAX, void_l);
        self.jump_if_void(R10, void_l);
        test_rr(self.buf, R10, R10);
        jcc(self.buf, Cc::Z, void_l);
        // idiv clobbers rdx, which belongs to the allocator.
        push_r(self.buf, RDX);
        let scalar = inst
            .result
            .is_some_and(|r| matches!(self.func.value(r).ty.strip_voidable(), Type::Scalar));
        if scalar {
            // rdx:rax = dividend shifted up by the fraction width.
            mov_rr(self.buf, RDX, RAX);
            rex(self.buf, true, 0, RDX);
            self.buf.emit_u8(0xC1);
            modrm(self.buf, 3, 7, RDX); // sar rdx, 32
            self.buf.emit_u8(32);
            rex(self.buf, true, 0, RAX);
            self.buf.emit_u8(0xC1);
            modrm(self.buf, 3, 4, RAX); // shl rax, 32
            self.buf.emit_u8(32);
        } else {
            self.buf.emit_u8(0x48);
            self.buf.emit_u8(0x99); // cqo
        }
        rex(self.buf, true, 0, R10);
        self.buf.emit_u8(0xF7);
        modrm(self.buf, 3, 7, R10); // idiv r10
        if inst.op == Opcode::Mod {
            mov_rr(self.buf, RAX, RDX);
        }
        pop_r(self.buf, RDX);
        jmp(self.buf, done);
        self.buf.bind_label(void_l);
        mov_ri(self.buf, RAX, VOID_PATTERN);
        self.buf.bind_label(done);
        self.store_result(inst.result, RAX);
    }

    fn emit_shift(&mut self, inst: &Inst) {
        self.load_value(RAX, inst.operands[0]);
        self.load_value(R10, inst.operands[1]);
        push_r(self.buf, RCX);
        mov_rr(self.buf, RCX, R10);
        rex(self.buf, true, 0, RAX);
        self.buf.emit_u8(0xD3);
        let ext = match inst.op {
            Opcode::Shl => 4,
            Opcode::Shr => 5,
            _ => 7,
        };
        modrm(self.buf, 3, ext, RAX);
        pop_r(self.buf, RCX);
        self.store_result(inst.result, RAX);
    }

    fn emit_cmp(&mut self, inst: &Inst) {
        self.load_value(RAX, inst.operands[0]);
        self.load_value(R10, inst.operands[1]);
        let done = self.buf.new_label();
        if self.operand_may_be_void(inst) {
            let void_l = self.buf.new_label();
            self.jump_if_void(RAX, void_l);
            self.jump_if_void(R10, void_l);
            cmp_rr(self.buf, RAX, R10);
            setcc_rax(
                self.buf,
                match inst.op {
                    Opcode::CmpEq => Cc::Z,
                    Opcode::CmpNe => Cc::Nz,
                    Opcode::CmpLt => Cc::L,
                    Opcode::CmpLe => Cc::Le,
                    Opcode::CmpGt => Cc::G,
                    Opcode::CmpGe => Cc::Ge,
                    Opcode::CmpLtU => Cc::C,
                    Opcode::CmpLeU => Cc::Na,
                    Opcode::CmpGtU => Cc::A,
                    _ => Cc::Nc,
                },
            );
            jmp(self.buf, done);
            self.buf.bind_label(void_l);
            mov_ri(self.buf, RAX, VOID_PATTERN);
        } else {
            cmp_rr(self.buf, RAX, R10);
            setcc_rax(
                self.buf,
                match inst.op {
                    Opcode::CmpEq => Cc::Z,
                    Opcode::CmpNe => Cc::Nz,
                    Opcode::CmpLt => Cc::L,
                    Opcode::CmpLe => Cc::Le,
                    Opcode::CmpGt => Cc::G,
                    Opcode::CmpGe => Cc::Ge,
                    Opcode::CmpLtU => Cc::C,
                    Opcode::CmpLeU => Cc::Na,
                    Opcode::CmpGtU => Cc::A,
                    _ => Cc::Nc,
                },
            );
        }
        self.buf.bind_label(done);
        self.store_result(inst.result, RAX);
    }

    /// The three capability checks against the record in r10, offset in
    /// r11, each branching to the shared `.void` tail: generation match,
    /// bounds including the 8-byte access width, then the permission bit
    /// the access needs (READ for loads, WRITE for stores).
    fn emit_cap_checks(&mut self, void_l: Label, need: u32) {
        // generation: cmp [r10+16], [r14]
        load_mem(self.buf, RAX, R10, CAP_GENERATION);
        cmp_rm(self.buf, RAX, R14, 0);
        jcc(self.buf, Cc::Nz, void_l);
        // bounds: offset + 8 must stay inside length; a wrapped sum fails
        mov_rr(self.buf, RAX, R11);
        add_ri(self.buf, RAX, CAP_ACCESS_WIDTH);
        jcc(self.buf, Cc::C, void_l);
        cmp_rm(self.buf, RAX, R10, CAP_LENGTH);
        jcc(self.buf, Cc::A, void_l);
        // permission: test the required bit of the mask
        load_mem(self.buf, RAX, R10, CAP_PERMS);
        rex(self.buf, true, 0, RAX);
        self.buf.emit_u8(0xF7);
        modrm(self.buf, 3, 0, RAX);
        self.buf.emit_u32(need);
        jcc(self.buf, Cc::Z, void_l);
    }

    fn emit_cap_load(&mut self, inst: &Inst) {
        let void_l = self.buf.new_label();
        let done = self.buf.new_label();
        self.load_value(R10, inst.operands[0]);
        self.load_value(R11, inst.operands[1]);
        self.emit_cap_checks(void_l, PERM_READ);
        load_mem(self.buf, RAX, R10, CAP_BASE);
        load_mem_bi(self.buf, RAX, RAX, R11);
        jmp(self.buf, done);
        self.buf.bind_label(void_l);
        mov_ri(self.buf, RAX, VOID_PATTERN);
        self.buf.bind_label(done);
        self.store_result(inst.result, RAX);
    }

    fn emit_cap_store(&mut self, inst: &Inst) {
        // Failed checks skip the store entirely: the silent-drop
        // convention. Stores need the WRITE bit, not READ.
        let skip = self.buf.new_label();
        self.load_value(R10, inst.operands[0]);
        self.load_value(R11, inst.operands[1]);
        self.emit_cap_checks(skip, PERM_WRITE);
        self.load_value(RAX, inst.operands[2]);
        push_r(self.buf, RAX);
        load_mem(self.buf, RAX, R10, CAP_BASE);
        mov_rr(self.buf, R10, RAX);
        pop_r(self.buf, RAX);
        store_mem_bi(self.buf, R10, R11, RAX);
        self.buf.bind_label(skip);
    }

    fn emit_runtime_args(&mut self, inst: &Inst) {
        for r in CALL_PRESERVED {
            push_r(self.buf, r);
        }
        for (i, &arg) in inst.operands.iter().enumerate() {
            if let Some(&reg) = X64_ABI.arg_regs.get(i) {
                self.load_arg_saved(reg, arg);
            }
        }
    }

    fn emit_runtime_restore(&mut self) {
        for r in CALL_PRESERVED.iter().rev() {
            pop_r(self.buf, *r);
        }
    }

    fn emit_runtime_call(&mut self, inst: &Inst, slot: RuntimeSlot) {
        self.emit_runtime_args(inst);
        call_runtime(self.buf, slot);
        self.emit_runtime_restore();
        self.store_result(inst.result, RAX);
    }

    fn emit_call(&mut self, inst: &Inst, direct: Option<Label>, indirect: Option<ValueId>) {
        for r in CALL_PRESERVED {
            push_r(self.buf, r);
        }
        let args = if indirect.is_some() {
            &inst.operands[1..]
        } else {
            &inst.operands[..]
        };
        // Load the target before the argument registers are repurposed.
        if let Some(target) = indirect {
            self.load_arg_saved(R10, target);
        }
        for (i, &arg) in args.iter().enumerate() {
            if let Some(&reg) = X64_ABI.arg_regs.get(i) {
                self.load_arg_saved(reg, arg);
            }
        }
        match direct {
            Some(label) => emit_call_rel32(self.buf, label),
            None => {
                // call r10
                rex(self.buf, true, 0, R10);
                self.buf.emit_u8(0xFF);
                modrm(self.buf, 3, 2, R10);
            }
        }
        for r in CALL_PRESERVED.iter().rev() {
            pop_r(self.buf, *r);
        }
        self.store_result(inst.result, RAX);
    }

    /// Componentwise Galactic add: four channels of 128-bit adds, each an
    /// add/adc limb pair.
    fn emit_gal_add(&mut self, inst: &Inst) {
        let dst_area = inst
            .result
            .and_then(|r| self.galactic_areas.get(&r).copied())
            .unwrap_or(64);
        self.load_value(R10, inst.operands[0]);
        self.load_value(R11, inst.operands[1]);
        for ch in 0..4 {
            let off = 16 * ch;
            load_mem(self.buf, RAX, R10, off);
            // add rax, [r11+off]
            rex(self.buf, true, RAX, R11);
            self.buf.emit_u8(0x03);
            mem_disp(self.buf, RAX, R11, off);
            store_mem(self.buf, RBP, -dst_area + off, RAX);
            load_mem(self.buf, RAX, R10, off + 8);
            // adc rax, [r11+off+8]
            rex(self.buf, true, RAX, R11);
            self.buf.emit_u8(0x13);
            mem_disp(self.buf, RAX, R11, off + 8);
            store_mem(self.buf, RBP, -dst_area + off + 8, RAX);
        }
        lea_rbp(self.buf, RAX, -dst_area);
        self.store_result(inst.result, RAX);
    }

    fn emit_gal_helper(&mut self, inst: &Inst, slot: RuntimeSlot) {
        let dst_area = inst
            .result
            .and_then(|r| self.galactic_areas.get(&r).copied());
        for r in CALL_PRESERVED {
            push_r(self.buf, r);
        }
        self.load_arg_saved(RDI, inst.operands[0]);
        if inst.operands.len() > 1 {
            self.load_arg_saved(RSI, inst.operands[1]);
        }
        if let Some(disp) = dst_area {
            lea_rbp(self.buf, RDX, -disp);
        }
        call_runtime(self.buf, slot);
        for r in CALL_PRESERVED.iter().rev() {
            pop_r(self.buf, *r);
        }
        match dst_area {
            Some(disp) => {
                lea_rbp(self.buf, RAX, -disp);
                self.store_result(inst.result, RAX);
            }
            None => self.store_result(inst.result, RAX),
        }
    }
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

    fn window(code: &[u8], needle: &[u8]) -> bool {
        code.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn entry_stub_calls_main_then_exits() {
        let code = emit_one(|b| {
            let v = b.const_int(Type::I64, 0);
            b.ret(Some(v));
        });
        assert_eq!(code.entry_offset, 0);
        // call rel32 at the very start
        assert_eq!(code.code[0], 0xE8);
        let disp = i32::from_le_bytes(code.code[1..5].try_into().unwrap());
        let target = (5i64 + disp as i64) as usize;
        assert_eq!(target, code.entries[0].offset);
        // mov rdi, rax; mov eax, 60; syscall
        assert_eq!(&code.code[5..8], &[0x48, 0x89, 0xC7]);
        assert!(window(&code.code[..code.entries[0].offset], &[0x0F, 0x05]));
    }

    #[test]
    fn prologue_epilogue_shape() {
        let code = emit_one(|b| {
            let v = b.const_int(Type::I64, 0);
            b.ret(Some(v));
        });
        let body = &code.code[code.entries[0].offset..];
        // push rbp; mov rbp, rsp
        assert_eq!(&body[..4], &[0x55, 0x48, 0x89, 0xE5]);
        // ret somewhere at the end, preceded by pop rbp
        assert!(window(body, &[0x5D, 0xC3]));
    }

    #[test]
    fn void_test_is_bt_63_jc() {
        let code = emit_one(|b| {
            let (x, y) = (b.param(0), b.param(1));
            let q = b.binary(Opcode::Div, Type::I64, x, y);
            b.ret(Some(q));
        });
        // bt rax, 63 = 48 0F BA E0 3F; jc rel32 = 0F 82
        assert!(window(&code.code, &[0x48, 0x0F, 0xBA, 0xE0, 0x3F, 0x0F, 0x82]));
    }

    #[test]
    fn div_guards_zero_divisor() {
        let code = emit_one(|b| {
            let (x, y) = (b.param(0), b.param(1));
            let q = b.binary(Opcode::Div, Type::I64, x, y);
            b.ret(Some(q));
        });
        // test r10, r10 = 4D 85 D2 followed by jz rel32 = 0F 84
        assert!(window(&code.code, &[0x4D, 0x85, 0xD2, 0x0F, 0x84]));
        // cqo; idiv r10 = 48 99 ... 49 F7 FA
        assert!(window(&code.code, &[0x48, 0x99]));
        assert!(window(&code.code, &[0x49, 0xF7, 0xFA]));
    }

    #[test]
    fn void_constant_is_all_ones() {
        let code = emit_one(|b| {
            let v = b.const_void(Type::I64);
            b.ret(Some(v));
        });
        // movabs rax, -1: 48 B8 FF*8
        assert!(window(
            &code.code,
            &[0x48, 0xB8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        ));
    }

    #[test]
    fn trap_is_ud2() {
        let code = emit_one(|b| {
            let x = b.param(0);
            let v = b.void_assert(x);
            b.ret(Some(v));
        });
        assert!(window(&code.code, &[0x0F, 0x0B]));
    }

    #[test]
    fn direct_calls_are_patched() {
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
        let callee_off = code.entries[0].offset as i64;
        // Find the E8 inside main whose target is the callee.
        let main_off = code.entries[1].offset;
        let main_end = main_off + code.entries[1].size;
        let mut found = false;
        for at in main_off..main_end.saturating_sub(5) {
            if code.code[at] == 0xE8 {
                let disp =
                    i32::from_le_bytes(code.code[at + 1..at + 5].try_into().unwrap()) as i64;
                if at as i64 + 5 + disp == callee_off {
                    found = true;
                }
            }
        }
        assert!(found, "no patched call to callee found in main");
    }

    #[test]
    fn function_entries_cover_the_buffer() {
        let code = emit_one(|b| {
            let v = b.const_int(Type::I64, 1);
            b.ret(Some(v));
        });
        assert_eq!(code.entries.len(), 1);
        let e = &code.entries[0];
        assert!(e.offset > 0); // after the entry stub
        assert_eq!(e.offset + e.size, code.code.len());
    }

    #[test]
    fn cap_load_emits_three_checks() {
        let code = emit_one(|b| {
            let cap = b.param(0);
            let off = b.const_int(Type::U64, 0);
            let v = b.cap_load(cap, off, Type::voidable(Type::U64));
            b.ret(Some(v));
        });
        // Three conditional branches to the void tail: jne (0F 85),
        // ja (0F 87), je/jz (0F 84) in that order.
        let positions: Vec<usize> = code
            .code
            .windows(2)
            .enumerate()
            .filter_map(|(i, w)| {
                (w[0] == 0x0F && matches!(w[1], 0x85 | 0x87 | 0x84)).then_some(i)
            })
            .collect();
        assert!(positions.len() >= 3, "expected the three check branches");
    }
}
