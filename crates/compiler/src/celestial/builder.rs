//! Celestial IR builder
//!
//! The builder owns the insertion point for one function inside a module
//! and keeps two invariants while it inserts:
//!
//! - SSA: every arithmetic/VOID/memory helper allocates a fresh vreg with
//!   the correct result type.
//! - `may_be_void` flows: a result is flagged as possibly-VOID when any
//!   operand is flagged, and always for operations that can produce VOID
//!   at runtime (division, capability and substrate loads). `VoidProp`,
//!   `VoidAssert` and `VoidCoalesce` results are stripped.
//!
//! Inserting past a terminator is a bug in the caller; the builder debug
//! asserts against it.

use crate::celestial::ir::{
    BlockId, ConstVal, FuncId, Inst, InstId, Module, Opcode, StrId, ValueData, ValueId, ValueKind,
};
use crate::diagnostics::SourceLoc;
use crate::types::{EffectSet, Type};
use seraph_core::{Galactic, Scalar};

pub struct Builder<'m> {
    pub module: &'m mut Module,
    pub func: FuncId,
    pub block: BlockId,
    pub loc: SourceLoc,
}

impl<'m> Builder<'m> {
    pub fn new(module: &'m mut Module, func: FuncId) -> Self {
        let entry = module.function(func).entry;
        Builder {
            module,
            func,
            block: entry,
            loc: SourceLoc::default(),
        }
    }

    fn f(&mut self) -> &mut crate::celestial::ir::Function {
        &mut self.module.functions[self.func as usize]
    }

    pub fn func_ref(&self) -> &crate::celestial::ir::Function {
        &self.module.functions[self.func as usize]
    }

    pub fn set_loc(&mut self, loc: SourceLoc) {
        self.loc = loc;
    }

    pub fn add_block(&mut self) -> BlockId {
        self.f().add_block()
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.block = block;
    }

    /// Whether the current block already ends in a terminator.
    pub fn is_terminated(&self) -> bool {
        let f = &self.module.functions[self.func as usize];
        f.terminator(self.block).is_some()
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    pub fn param(&self, index: usize) -> ValueId {
        self.module.functions[self.func as usize].params[index]
    }

    fn add_value(&mut self, ty: Type, kind: ValueKind, may_be_void: bool) -> ValueId {
        self.f().add_value(ValueData {
            ty,
            kind,
            may_be_void,
        })
    }

    pub fn const_int(&mut self, ty: Type, bits: u64) -> ValueId {
        self.add_value(ty, ValueKind::Const(ConstVal::Int(bits)), false)
    }

    pub fn const_bool(&mut self, v: bool) -> ValueId {
        self.add_value(Type::Bool, ValueKind::Const(ConstVal::Bool(v)), false)
    }

    pub fn const_scalar(&mut self, v: Scalar) -> ValueId {
        self.add_value(Type::Scalar, ValueKind::Const(ConstVal::Scalar(v)), false)
    }

    pub fn const_galactic(&mut self, v: Galactic) -> ValueId {
        self.add_value(
            Type::Galactic,
            ValueKind::Const(ConstVal::Galactic(v)),
            false,
        )
    }

    pub fn const_unit(&mut self) -> ValueId {
        self.add_value(Type::Void, ValueKind::Const(ConstVal::Unit), false)
    }

    /// The VOID constant of a type.
    pub fn const_void(&mut self, ty: Type) -> ValueId {
        self.add_value(ty, ValueKind::Const(ConstVal::Void), true)
    }

    pub fn str_const(&mut self, s: &str) -> ValueId {
        let id: StrId = self.module.intern_string(s);
        self.add_value(Type::Str, ValueKind::Str(id), false)
    }

    pub fn func_value(&mut self, callee: FuncId) -> ValueId {
        let f = self.module.function(callee);
        let ty = Type::Function {
            params: f.param_types.clone(),
            ret: Box::new(f.ret_type.clone()),
            effects: f.declared_effects,
        };
        self.add_value(ty, ValueKind::FuncRef(callee), false)
    }

    fn operands_may_be_void(&self, operands: &[ValueId]) -> bool {
        let f = &self.module.functions[self.func as usize];
        operands.iter().any(|&v| f.value(v).may_be_void)
    }

    // ------------------------------------------------------------------
    // Instruction insertion
    // ------------------------------------------------------------------

    fn insert(&mut self, inst: Inst) -> InstId {
        debug_assert!(
            !self.is_terminated(),
            "inserting into a terminated block in {}",
            self.func_ref().name
        );
        let block = self.block;
        let f = self.f();
        let id = f.insts.len() as InstId;
        f.insts.push(inst);
        f.blocks[block as usize].insts.push(id);
        id
    }

    fn insert_terminator(&mut self, inst: Inst) -> InstId {
        let targets = inst.targets.clone();
        let id = self.insert(inst);
        let block = self.block;
        for t in targets {
            let f = self.f();
            if !f.blocks[block as usize].succs.contains(&t) {
                f.blocks[block as usize].succs.push(t);
            }
            if !f.blocks[t as usize].preds.contains(&block) {
                f.blocks[t as usize].preds.push(block);
            }
        }
        id
    }

    /// Insert an instruction producing a fresh vreg.
    fn emit(
        &mut self,
        op: Opcode,
        ty: Type,
        operands: Vec<ValueId>,
        effects: EffectSet,
        may_be_void: bool,
    ) -> ValueId {
        let loc = self.loc;
        let f = self.f();
        let inst_id = f.insts.len() as InstId;
        let result = f.add_value(ValueData {
            ty,
            kind: ValueKind::VReg { def: inst_id },
            may_be_void,
        });
        self.insert(Inst {
            op,
            result: Some(result),
            operands,
            targets: Vec::new(),
            callee: None,
            effects,
            loc,
        });
        result
    }

    /// Insert an effectful instruction with no result.
    fn emit_void(&mut self, op: Opcode, operands: Vec<ValueId>, effects: EffectSet) -> InstId {
        let loc = self.loc;
        self.insert(Inst {
            op,
            result: None,
            operands,
            targets: Vec::new(),
            callee: None,
            effects,
            loc,
        })
    }

    // ------------------------------------------------------------------
    // Arithmetic and bitwise
    // ------------------------------------------------------------------

    pub fn binary(&mut self, op: Opcode, ty: Type, a: ValueId, b: ValueId) -> ValueId {
        let mut flag = self.operands_may_be_void(&[a, b]);
        let mut effects = EffectSet::NONE;
        if matches!(op, Opcode::Div | Opcode::Mod) {
            // Divide-by-zero yields VOID at runtime.
            flag = true;
            effects |= EffectSet::VOID;
        }
        self.emit(op, ty, vec![a, b], effects, flag)
    }

    pub fn neg(&mut self, ty: Type, v: ValueId) -> ValueId {
        let flag = self.operands_may_be_void(&[v]);
        self.emit(Opcode::Neg, ty, vec![v], EffectSet::NONE, flag)
    }

    pub fn not(&mut self, ty: Type, v: ValueId) -> ValueId {
        let flag = self.operands_may_be_void(&[v]);
        self.emit(Opcode::Not, ty, vec![v], EffectSet::NONE, flag)
    }

    /// Comparisons produce `bool`; a VOID operand makes the result VOID
    /// (Vbit semantics), tracked through the flag.
    pub fn cmp(&mut self, op: Opcode, a: ValueId, b: ValueId) -> ValueId {
        let flag = self.operands_may_be_void(&[a, b]);
        self.emit(op, Type::Bool, vec![a, b], EffectSet::NONE, flag)
    }

    // ------------------------------------------------------------------
    // VOID operations
    // ------------------------------------------------------------------

    /// `void.test v -> Vbit` (represented as a possibly-VOID bool).
    pub fn void_test(&mut self, v: ValueId) -> ValueId {
        self.emit(Opcode::VoidTest, Type::Bool, vec![v], EffectSet::NONE, false)
    }

    /// `void.prop v`: if VOID, the enclosing function returns its VOID
    /// constant; otherwise the result is `v` stripped of its wrapper.
    pub fn void_prop(&mut self, v: ValueId) -> ValueId {
        let ty = self.func_ref().value(v).ty.strip_voidable().clone();
        self.emit(Opcode::VoidProp, ty, vec![v], EffectSet::VOID, false)
    }

    /// `void.assert v`: traps on VOID.
    pub fn void_assert(&mut self, v: ValueId) -> ValueId {
        let ty = self.func_ref().value(v).ty.strip_voidable().clone();
        self.emit(Opcode::VoidAssert, ty, vec![v], EffectSet::VOID, false)
    }

    /// `void.coalesce v, d`: v unless VOID, else d.
    pub fn void_coalesce(&mut self, v: ValueId, d: ValueId) -> ValueId {
        let ty = self.func_ref().value(d).ty.clone();
        let flag = self.func_ref().value(d).may_be_void;
        self.emit(
            Opcode::VoidCoalesce,
            ty.strip_voidable().clone(),
            vec![v, d],
            EffectSet::VOID,
            flag,
        )
    }

    // ------------------------------------------------------------------
    // Capability operations
    // ------------------------------------------------------------------

    pub fn cap_create(&mut self, base: ValueId, len: ValueId, perms: ValueId) -> ValueId {
        let flag = self.operands_may_be_void(&[base, len, perms]);
        self.emit(
            Opcode::CapCreate,
            Type::Capability,
            vec![base, len, perms],
            EffectSet::NONE,
            flag,
        )
    }

    pub fn cap_narrow(&mut self, cap: ValueId, off: ValueId, len: ValueId) -> ValueId {
        self.emit(
            Opcode::CapNarrow,
            Type::Capability,
            vec![cap, off, len],
            EffectSet::NONE,
            true,
        )
    }

    /// Any of the three checks can fail, so the loaded value is flagged.
    pub fn cap_load(&mut self, cap: ValueId, off: ValueId, ty: Type) -> ValueId {
        self.emit(
            Opcode::CapLoad,
            ty,
            vec![cap, off],
            EffectSet::VOID,
            true,
        )
    }

    /// A failed check silently drops the store.
    pub fn cap_store(&mut self, cap: ValueId, off: ValueId, v: ValueId) -> InstId {
        self.emit_void(Opcode::CapStore, vec![cap, off, v], EffectSet::VOID)
    }

    pub fn cap_check(&mut self, cap: ValueId, off: ValueId, len: ValueId) -> ValueId {
        self.emit(
            Opcode::CapCheck,
            Type::Bool,
            vec![cap, off, len],
            EffectSet::NONE,
            true,
        )
    }

    pub fn cap_revoke(&mut self, cap: ValueId) -> InstId {
        self.emit_void(Opcode::CapRevoke, vec![cap], EffectSet::NONE)
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    pub fn alloca(&mut self, ty: Type, size: u64) -> ValueId {
        let size_v = self.const_int(Type::U64, size);
        self.emit(
            Opcode::Alloca,
            Type::Pointer(Box::new(ty)),
            vec![size_v],
            EffectSet::NONE,
            false,
        )
    }

    pub fn load(&mut self, ptr: ValueId, ty: Type) -> ValueId {
        let flag = ty.is_voidable();
        self.emit(Opcode::Load, ty, vec![ptr], EffectSet::NONE, flag)
    }

    pub fn store(&mut self, ptr: ValueId, v: ValueId) -> InstId {
        self.emit_void(Opcode::Store, vec![ptr, v], EffectSet::NONE)
    }

    // ------------------------------------------------------------------
    // Substrate
    // ------------------------------------------------------------------

    pub fn atlas_begin(&mut self) -> ValueId {
        self.emit(
            Opcode::AtlasBegin,
            Type::I64,
            vec![],
            EffectSet::PERSIST | EffectSet::VOID,
            false,
        )
    }

    pub fn atlas_commit(&mut self, tx: ValueId) -> InstId {
        self.emit_void(
            Opcode::AtlasCommit,
            vec![tx],
            EffectSet::PERSIST | EffectSet::VOID,
        )
    }

    pub fn atlas_rollback(&mut self, tx: ValueId) -> InstId {
        self.emit_void(
            Opcode::AtlasRollback,
            vec![tx],
            EffectSet::PERSIST | EffectSet::VOID,
        )
    }

    pub fn atlas_load(&mut self, addr: ValueId) -> ValueId {
        self.emit(
            Opcode::AtlasLoad,
            Type::voidable(Type::U64),
            vec![addr],
            EffectSet::PERSIST | EffectSet::VOID,
            true,
        )
    }

    pub fn atlas_store(&mut self, addr: ValueId, v: ValueId) -> InstId {
        self.emit_void(
            Opcode::AtlasStore,
            vec![addr, v],
            EffectSet::PERSIST | EffectSet::VOID,
        )
    }

    pub fn aether_load(&mut self, addr: ValueId) -> ValueId {
        self.emit(
            Opcode::AetherLoad,
            Type::voidable(Type::U64),
            vec![addr],
            EffectSet::NETWORK | EffectSet::VOID,
            true,
        )
    }

    pub fn aether_store(&mut self, addr: ValueId, v: ValueId) -> InstId {
        self.emit_void(
            Opcode::AetherStore,
            vec![addr, v],
            EffectSet::NETWORK | EffectSet::VOID,
        )
    }

    pub fn aether_sync(&mut self) -> InstId {
        self.emit_void(
            Opcode::AetherSync,
            vec![],
            EffectSet::NETWORK | EffectSet::VOID,
        )
    }

    pub fn substrate_enter(&mut self, substrate: ValueId) -> InstId {
        self.emit_void(Opcode::SubstrateEnter, vec![substrate], EffectSet::NONE)
    }

    pub fn substrate_exit(&mut self) -> InstId {
        self.emit_void(Opcode::SubstrateExit, vec![], EffectSet::NONE)
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    pub fn jump(&mut self, target: BlockId) -> InstId {
        let loc = self.loc;
        self.insert_terminator(Inst {
            op: Opcode::Jump,
            result: None,
            operands: vec![],
            targets: vec![target],
            callee: None,
            effects: EffectSet::NONE,
            loc,
        })
    }

    pub fn branch(&mut self, cond: ValueId, then_bb: BlockId, else_bb: BlockId) -> InstId {
        let loc = self.loc;
        self.insert_terminator(Inst {
            op: Opcode::Branch,
            result: None,
            operands: vec![cond],
            targets: vec![then_bb, else_bb],
            callee: None,
            effects: EffectSet::NONE,
            loc,
        })
    }

    /// `switch v, [case0, case1, ...], default`. Case values are constant
    /// operands aligned with the leading targets; the final target is the
    /// default.
    pub fn switch_(
        &mut self,
        v: ValueId,
        cases: Vec<(ValueId, BlockId)>,
        default: BlockId,
    ) -> InstId {
        let loc = self.loc;
        let mut operands = vec![v];
        let mut targets = Vec::new();
        for (case_v, case_bb) in cases {
            operands.push(case_v);
            targets.push(case_bb);
        }
        targets.push(default);
        self.insert_terminator(Inst {
            op: Opcode::Switch,
            result: None,
            operands,
            targets,
            callee: None,
            effects: EffectSet::NONE,
            loc,
        })
    }

    pub fn ret(&mut self, v: Option<ValueId>) -> InstId {
        let loc = self.loc;
        self.insert_terminator(Inst {
            op: Opcode::Return,
            result: None,
            operands: v.into_iter().collect(),
            targets: vec![],
            callee: None,
            effects: EffectSet::NONE,
            loc,
        })
    }

    pub fn unreachable(&mut self) -> InstId {
        let loc = self.loc;
        self.insert_terminator(Inst {
            op: Opcode::Unreachable,
            result: None,
            operands: vec![],
            targets: vec![],
            callee: None,
            effects: EffectSet::NONE,
            loc,
        })
    }

    pub fn trap(&mut self) -> InstId {
        self.emit_void(Opcode::Trap, vec![], EffectSet::NONE)
    }

    pub fn call(
        &mut self,
        callee: FuncId,
        args: Vec<ValueId>,
        ret_ty: Type,
        effects: EffectSet,
    ) -> ValueId {
        let loc = self.loc;
        let flag = ret_ty.is_voidable();
        let f = self.f();
        let inst_id = f.insts.len() as InstId;
        let result = f.add_value(ValueData {
            ty: ret_ty,
            kind: ValueKind::VReg { def: inst_id },
            may_be_void: flag,
        });
        self.insert(Inst {
            op: Opcode::Call,
            result: Some(result),
            operands: args,
            targets: vec![],
            callee: Some(callee),
            effects,
            loc,
        });
        result
    }

    pub fn call_indirect(
        &mut self,
        target: ValueId,
        mut args: Vec<ValueId>,
        ret_ty: Type,
        effects: EffectSet,
    ) -> ValueId {
        let mut operands = vec![target];
        operands.append(&mut args);
        let flag = ret_ty.is_voidable();
        self.emit(Opcode::CallIndirect, ret_ty, operands, effects, flag)
    }

    pub fn syscall(&mut self, number: ValueId, args: Vec<ValueId>) -> ValueId {
        let mut operands = vec![number];
        operands.extend(args);
        self.emit(Opcode::Syscall, Type::I64, operands, EffectSet::IO, false)
    }

    // ------------------------------------------------------------------
    // Galactic and chronon
    // ------------------------------------------------------------------

    pub fn gal_binary(&mut self, op: Opcode, a: ValueId, b: ValueId) -> ValueId {
        let flag = self.operands_may_be_void(&[a, b]) || op == Opcode::GalDiv;
        let effects = if op == Opcode::GalDiv {
            EffectSet::VOID
        } else {
            EffectSet::NONE
        };
        self.emit(op, Type::Galactic, vec![a, b], effects, flag)
    }

    pub fn gal_predict(&mut self, g: ValueId, dt: ValueId) -> ValueId {
        let flag = self.operands_may_be_void(&[g, dt]);
        self.emit(
            Opcode::GalPredict,
            Type::Scalar,
            vec![g, dt],
            EffectSet::NONE,
            flag,
        )
    }

    pub fn gal_extract(&mut self, g: ValueId, idx: ValueId) -> ValueId {
        let flag = self.operands_may_be_void(&[g]);
        self.emit(
            Opcode::GalExtract,
            Type::Scalar,
            vec![g, idx],
            EffectSet::NONE,
            flag,
        )
    }

    pub fn gal_insert(&mut self, g: ValueId, idx: ValueId, v: ValueId) -> ValueId {
        let flag = self.operands_may_be_void(&[g, v]);
        self.emit(
            Opcode::GalInsert,
            Type::Galactic,
            vec![g, idx, v],
            EffectSet::NONE,
            flag,
        )
    }

    pub fn chronon_now(&mut self) -> ValueId {
        self.emit(
            Opcode::ChrononNow,
            Type::I64,
            vec![],
            EffectSet::TIMER,
            false,
        )
    }

    pub fn chronon_delta(&mut self, since: ValueId) -> ValueId {
        self.emit(
            Opcode::ChrononDelta,
            Type::I64,
            vec![since],
            EffectSet::TIMER,
            false,
        )
    }

    pub fn chronon_budget(&mut self) -> ValueId {
        self.emit(
            Opcode::ChrononBudget,
            Type::I64,
            vec![],
            EffectSet::TIMER,
            false,
        )
    }

    pub fn chronon_yield(&mut self) -> InstId {
        self.emit_void(Opcode::ChrononYield, vec![], EffectSet::TIMER)
    }

    // ------------------------------------------------------------------
    // Conversions and aggregates
    // ------------------------------------------------------------------

    pub fn convert(&mut self, op: Opcode, ty: Type, v: ValueId) -> ValueId {
        let flag = self.operands_may_be_void(&[v]);
        self.emit(op, ty, vec![v], EffectSet::NONE, flag)
    }

    pub fn extract_field(&mut self, agg: ValueId, index: ValueId, ty: Type) -> ValueId {
        let flag = self.operands_may_be_void(&[agg]);
        self.emit(
            Opcode::ExtractField,
            ty,
            vec![agg, index],
            EffectSet::NONE,
            flag,
        )
    }

    pub fn insert_field(&mut self, agg: ValueId, index: ValueId, v: ValueId) -> ValueId {
        let ty = self.func_ref().value(agg).ty.clone();
        let flag = self.operands_may_be_void(&[agg, v]);
        self.emit(
            Opcode::InsertField,
            ty,
            vec![agg, index, v],
            EffectSet::NONE,
            flag,
        )
    }

    pub fn extract_elem(&mut self, agg: ValueId, index: ValueId, ty: Type) -> ValueId {
        // Out-of-range element reads are VOID at runtime.
        self.emit(
            Opcode::ExtractElem,
            ty,
            vec![agg, index],
            EffectSet::VOID,
            true,
        )
    }

    pub fn insert_elem(&mut self, agg: ValueId, index: ValueId, v: ValueId) -> ValueId {
        let ty = self.func_ref().value(agg).ty.clone();
        let flag = self.operands_may_be_void(&[agg, v]);
        self.emit(
            Opcode::InsertElem,
            ty,
            vec![agg, index, v],
            EffectSet::VOID,
            flag,
        )
    }

    pub fn gep(&mut self, base: ValueId, offset: ValueId, ty: Type) -> ValueId {
        let flag = self.operands_may_be_void(&[base]);
        self.emit(
            Opcode::Gep,
            Type::Pointer(Box::new(ty)),
            vec![base, offset],
            EffectSet::NONE,
            flag,
        )
    }

    pub fn phi(&mut self, ty: Type, incoming: Vec<(ValueId, BlockId)>) -> ValueId {
        let loc = self.loc;
        let flag = self.operands_may_be_void(
            &incoming.iter().map(|(v, _)| *v).collect::<Vec<_>>(),
        );
        let operands: Vec<ValueId> = incoming.iter().map(|(v, _)| *v).collect();
        let targets: Vec<BlockId> = incoming.iter().map(|(_, b)| *b).collect();
        let f = self.f();
        let inst_id = f.insts.len() as InstId;
        let result = f.add_value(ValueData {
            ty,
            kind: ValueKind::VReg { def: inst_id },
            may_be_void: flag,
        });
        // Phis go at the head of the block, before any non-phi.
        let block = self.block;
        let f = self.f();
        f.insts.push(Inst {
            op: Opcode::Phi,
            result: Some(result),
            operands,
            targets,
            callee: None,
            effects: EffectSet::NONE,
            loc,
        });
        let at = {
            let block_insts = &f.blocks[block as usize].insts;
            block_insts
                .iter()
                .position(|&i| f.insts[i as usize].op != Opcode::Phi)
                .unwrap_or(block_insts.len())
        };
        f.blocks[block as usize].insts.insert(at, inst_id);
        result
    }

    pub fn select(&mut self, cond: ValueId, t: ValueId, e: ValueId) -> ValueId {
        let ty = self.func_ref().value(t).ty.clone();
        let flag = self.operands_may_be_void(&[cond, t, e]);
        self.emit(Opcode::Select, ty, vec![cond, t, e], EffectSet::NONE, flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::celestial::ir::Function;

    fn fresh_module() -> (Module, FuncId) {
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "f",
            vec![Type::I64, Type::I64],
            Type::voidable(Type::I64),
            EffectSet::VOID,
        ));
        (m, 0)
    }

    #[test]
    fn div_result_is_flagged_void() {
        let (mut m, f) = fresh_module();
        let mut b = Builder::new(&mut m, f);
        let (x, y) = (b.param(0), b.param(1));
        let q = b.binary(Opcode::Div, Type::I64, x, y);
        assert!(b.func_ref().value(q).may_be_void);
        let s = b.binary(Opcode::Add, Type::I64, x, y);
        assert!(!b.func_ref().value(s).may_be_void);
    }

    #[test]
    fn void_flag_unions_through_operands() {
        let (mut m, f) = fresh_module();
        let mut b = Builder::new(&mut m, f);
        let (x, y) = (b.param(0), b.param(1));
        let q = b.binary(Opcode::Div, Type::I64, x, y);
        // q may be VOID, so q + 1 may be VOID
        let one = b.const_int(Type::I64, 1);
        let sum = b.binary(Opcode::Add, Type::I64, q, one);
        assert!(b.func_ref().value(sum).may_be_void);
    }

    #[test]
    fn void_prop_strips_the_flag() {
        let (mut m, f) = fresh_module();
        let mut b = Builder::new(&mut m, f);
        let (x, y) = (b.param(0), b.param(1));
        let q = b.binary(Opcode::Div, Type::I64, x, y);
        let stripped = b.void_prop(q);
        assert!(!b.func_ref().value(stripped).may_be_void);
        assert_eq!(b.func_ref().value(stripped).ty, Type::I64);
    }

    #[test]
    fn branch_updates_cfg_edges() {
        let (mut m, f) = fresh_module();
        let mut b = Builder::new(&mut m, f);
        let then_bb = b.add_block();
        let else_bb = b.add_block();
        let cond = b.const_bool(true);
        b.branch(cond, then_bb, else_bb);
        let func = b.func_ref();
        assert_eq!(func.block(0).succs, vec![then_bb, else_bb]);
        assert_eq!(func.block(then_bb).preds, vec![0]);
        assert_eq!(func.block(else_bb).preds, vec![0]);
    }

    #[test]
    fn every_vreg_has_one_def() {
        let (mut m, f) = fresh_module();
        let mut b = Builder::new(&mut m, f);
        let (x, y) = (b.param(0), b.param(1));
        let a = b.binary(Opcode::Add, Type::I64, x, y);
        let c = b.binary(Opcode::Mul, Type::I64, a, a);
        b.ret(Some(c));
        let func = b.func_ref();
        for (vid, v) in func.values.iter().enumerate() {
            if let ValueKind::VReg { def } = v.kind {
                assert_eq!(func.inst(def).result, Some(vid as ValueId));
            }
        }
    }
}
