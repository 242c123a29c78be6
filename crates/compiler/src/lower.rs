//! Lowering: checked AST to Celestial IR
//!
//! Locals and parameters are uniformly backed by `alloca` slots with loads
//! at each use; nothing here runs mem2reg, the optimizer only folds and
//! strips dead work. Control flow lowers to explicit blocks; merge points
//! (if/match/recover/short-circuit values) carry their result through a
//! slot written by each branch, so the emitters never face phi
//! resolution. The checker's per-expression type table drives opcode
//! selection (integer vs scalar vs galactic, signed vs unsigned
//! comparisons).
//!
//! Substrate sugar:
//! - `persist { .. }` begins an Atlas transaction, commits on the normal
//!   exit and rolls back on the VOID path.
//! - builtin calls by name (`atlas_*`, `aether_*`, `chronon_*`) lower to
//!   their dedicated opcodes; `print_*`/`read_*`/`write_*` lower to
//!   syscalls. Atlas address 0 names the root-pointer slot.

use crate::ast::{
    BinOp, Block, Decl, Expr, ExprKind, FnDecl, Pattern, Program, Stmt, UnOp,
};
use crate::celestial::builder::Builder;
use crate::celestial::ir::{BlockId, FuncId, Function, Module, Opcode, ValueId};
use crate::checker::CheckedProgram;
use crate::lexer::NumSuffix;
use crate::types::{EffectSet, Type};
use seraph_core::{Galactic, Scalar};
use std::collections::HashMap;

/// Substrate ids used by `substrate.enter`.
const SUBSTRATE_ATLAS: u64 = 1;
const SUBSTRATE_AETHER: u64 = 2;

/// Syscall numbers for the IO builtins.
const SYS_READ: u64 = 0;
const SYS_WRITE: u64 = 1;

pub fn lower_program(name: &str, program: &Program, checked: &CheckedProgram) -> Module {
    let mut module = Module::new(name);

    // Declare every function first so call sites resolve to ids.
    let mut fn_ids: HashMap<String, FuncId> = HashMap::new();
    let mut decls: Vec<(String, &FnDecl)> = Vec::new();
    for decl in &program.decls {
        match decl {
            Decl::Fn(f) => decls.push((f.name.clone(), f)),
            Decl::Impl(imp) => {
                for m in &imp.methods {
                    decls.push((format!("{}::{}", imp.ty_name, m.name), m));
                }
            }
            _ => {}
        }
    }
    for (qualified, _) in &decls {
        let Some(sig) = checked.fn_sigs.get(qualified) else {
            continue;
        };
        let id = module.functions.len() as FuncId;
        module.functions.push(Function::new(
            qualified,
            sig.params.iter().map(|(_, t)| t.clone()).collect(),
            sig.ret.clone(),
            sig.effects,
        ));
        fn_ids.insert(qualified.clone(), id);
    }

    for (qualified, decl) in decls {
        let Some(&id) = fn_ids.get(&qualified) else {
            continue;
        };
        let mut ctx = LowerCtx {
            builder: Builder::new(&mut module, id),
            checked,
            fn_ids: &fn_ids,
            scopes: Vec::new(),
            loop_stack: Vec::new(),
        };
        ctx.lower_fn(decl, &qualified);
    }
    module
}

struct LoopFrame {
    break_bb: BlockId,
    continue_bb: BlockId,
}

struct LowerCtx<'a, 'm> {
    builder: Builder<'m>,
    checked: &'a CheckedProgram,
    fn_ids: &'a HashMap<String, FuncId>,
    /// Name -> alloca slot holding the local.
    scopes: Vec<HashMap<String, (ValueId, Type)>>,
    loop_stack: Vec<LoopFrame>,
}

impl<'a, 'm> LowerCtx<'a, 'm> {
    fn expr_ty(&self, e: &Expr) -> Type {
        self.checked
            .expr_types
            .get(&e.id)
            .cloned()
            .unwrap_or(Type::I64)
    }

    fn lower_fn(&mut self, decl: &FnDecl, qualified: &str) {
        let sig = self.checked.fn_sigs[qualified].clone();
        self.scopes.push(HashMap::new());

        // Spill parameters into slots so assignments and loops see memory.
        for (i, (pname, pty)) in sig.params.iter().enumerate() {
            let size = pty.byte_size().unwrap_or(8).max(8);
            let slot = self.builder.alloca(pty.clone(), size);
            let param = self.builder.param(i);
            self.builder.store(slot, param);
            self.scopes
                .last_mut()
                .expect("fn scope")
                .insert(pname.clone(), (slot, pty.clone()));
        }

        let tail = self.lower_block(&decl.body);
        if !self.builder.is_terminated() {
            match tail {
                Some(v) if sig.ret != Type::Void => self.builder.ret(Some(v)),
                _ => self.builder.ret(None),
            };
        }
        self.scopes.pop();
    }

    /// Lower a block, returning its trailing value when it has one.
    fn lower_block(&mut self, block: &Block) -> Option<ValueId> {
        self.scopes.push(HashMap::new());
        for stmt in &block.stmts {
            if self.builder.is_terminated() {
                break;
            }
            self.lower_stmt(stmt);
        }
        let out = match &block.tail {
            Some(e) if !self.builder.is_terminated() => Some(self.lower_expr(e)),
            _ => None,
        };
        self.scopes.pop();
        out
    }

    fn lower_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Let {
                name, value, loc, ..
            }
            | Stmt::Const {
                name, value, loc, ..
            } => {
                self.builder.set_loc(*loc);
                let v = self.lower_expr(value);
                let ty = self.expr_ty(value);
                let size = ty.byte_size().unwrap_or(8).max(8);
                let slot = self.builder.alloca(ty.clone(), size);
                self.builder.store(slot, v);
                self.scopes
                    .last_mut()
                    .expect("block scope")
                    .insert(name.clone(), (slot, ty));
            }
            Stmt::Return { value, loc } => {
                self.builder.set_loc(*loc);
                let v = value.as_ref().map(|e| self.lower_expr(e));
                self.builder.ret(v);
            }
            Stmt::While { cond, body, loc } => {
                self.builder.set_loc(*loc);
                let cond_bb = self.builder.add_block();
                let body_bb = self.builder.add_block();
                let exit_bb = self.builder.add_block();
                self.builder.jump(cond_bb);

                self.builder.switch_to(cond_bb);
                let c = self.lower_expr(cond);
                self.builder.branch(c, body_bb, exit_bb);

                self.builder.switch_to(body_bb);
                self.loop_stack.push(LoopFrame {
                    break_bb: exit_bb,
                    continue_bb: cond_bb,
                });
                self.lower_block(body);
                self.loop_stack.pop();
                if !self.builder.is_terminated() {
                    self.builder.jump(cond_bb);
                }
                self.builder.switch_to(exit_bb);
            }
            Stmt::ForIn {
                var,
                iter,
                body,
                loc,
            } => self.lower_for_in(var, iter, body, *loc),
            Stmt::Break { loc } => {
                self.builder.set_loc(*loc);
                if let Some(frame) = self.loop_stack.last() {
                    let bb = frame.break_bb;
                    self.builder.jump(bb);
                }
            }
            Stmt::Continue { loc } => {
                self.builder.set_loc(*loc);
                if let Some(frame) = self.loop_stack.last() {
                    let bb = frame.continue_bb;
                    self.builder.jump(bb);
                }
            }
            Stmt::Expr(e) => {
                self.lower_expr(e);
            }
        }
    }

    fn lower_for_in(
        &mut self,
        var: &str,
        iter: &Expr,
        body: &Block,
        loc: crate::diagnostics::SourceLoc,
    ) {
        self.builder.set_loc(loc);
        // Only range iteration lowers natively; slices drive an index loop
        // through the same shape.
        let ExprKind::Range { lo, hi, inclusive } = &iter.kind else {
            // Fallback: evaluate the iterable for effects and skip the loop.
            self.lower_expr(iter);
            return;
        };
        let lo_v = self.lower_expr(lo);
        let hi_v = self.lower_expr(hi);

        let slot = self.builder.alloca(Type::I64, 8);
        self.builder.store(slot, lo_v);

        let cond_bb = self.builder.add_block();
        let body_bb = self.builder.add_block();
        let step_bb = self.builder.add_block();
        let exit_bb = self.builder.add_block();
        self.builder.jump(cond_bb);

        self.builder.switch_to(cond_bb);
        let i = self.builder.load(slot, Type::I64);
        let cmp_op = if *inclusive {
            Opcode::CmpLe
        } else {
            Opcode::CmpLt
        };
        let c = self.builder.cmp(cmp_op, i, hi_v);
        self.builder.branch(c, body_bb, exit_bb);

        self.builder.switch_to(body_bb);
        self.scopes.push(HashMap::new());
        self.scopes
            .last_mut()
            .expect("loop scope")
            .insert(var.to_string(), (slot, Type::I64));
        self.loop_stack.push(LoopFrame {
            break_bb: exit_bb,
            continue_bb: step_bb,
        });
        self.lower_block(body);
        self.loop_stack.pop();
        self.scopes.pop();
        if !self.builder.is_terminated() {
            self.builder.jump(step_bb);
        }

        self.builder.switch_to(step_bb);
        let i = self.builder.load(slot, Type::I64);
        let one = self.builder.const_int(Type::I64, 1);
        let next = self.builder.binary(Opcode::Add, Type::I64, i, one);
        self.builder.store(slot, next);
        self.builder.jump(cond_bb);

        self.builder.switch_to(exit_bb);
    }

    fn lookup_local(&self, name: &str) -> Option<(ValueId, Type)> {
        for scope in self.scopes.iter().rev() {
            if let Some(v) = scope.get(name) {
                return Some(v.clone());
            }
        }
        None
    }

    fn lower_expr(&mut self, e: &Expr) -> ValueId {
        self.builder.set_loc(e.loc);
        let ty = self.expr_ty(e);
        match &e.kind {
            ExprKind::Int { value, .. } => self.builder.const_int(ty, *value),
            ExprKind::Float { value, suffix } => match suffix {
                NumSuffix::Galactic => {
                    let g = Galactic::constant(Scalar::from_f64(*value));
                    self.builder.const_galactic(g)
                }
                _ => self.builder.const_scalar(Scalar::from_f64(*value)),
            },
            ExprKind::Str(s) => self.builder.str_const(s),
            ExprKind::Char(c) => self.builder.const_int(ty, *c as u64),
            ExprKind::Bool(b) => self.builder.const_bool(*b),
            ExprKind::Void => self.builder.const_void(Type::I64),
            ExprKind::Ident(name) => {
                if let Some((slot, local_ty)) = self.lookup_local(name) {
                    return self.builder.load(slot, local_ty);
                }
                if let Some(&id) = self.fn_ids.get(name) {
                    return self.builder.func_value(id);
                }
                // Unresolved names were already diagnosed; keep the IR
                // well-formed with a VOID constant.
                self.builder.const_void(Type::I64)
            }
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs),
            ExprKind::Unary { op, operand } => {
                let v = self.lower_expr(operand);
                let ty = self.expr_ty(operand);
                match op {
                    UnOp::Neg => self.builder.neg(ty.strip_voidable().clone(), v),
                    UnOp::Not | UnOp::BitNot => {
                        self.builder.not(ty.strip_voidable().clone(), v)
                    }
                }
            }
            ExprKind::Assign { target, op, value } => {
                let v = self.lower_expr(value);
                let v = match op {
                    Some(op) => {
                        let current = self.lower_expr(target);
                        let t = self.expr_ty(target);
                        self.lower_binop_values(*op, current, v, &t)
                    }
                    None => v,
                };
                self.lower_store_to(target, v);
                self.builder.const_unit()
            }
            ExprKind::Call { callee, args } => self.lower_call(callee, args, &ty),
            ExprKind::MethodCall { recv, name, args } => {
                let recv_ty = self.expr_ty(recv);
                let ty_name = match recv_ty.strip_voidable() {
                    Type::Struct(n) | Type::Enum(n) => n.clone(),
                    _ => return self.builder.const_void(Type::I64),
                };
                let qualified = format!("{}::{}", ty_name, name);
                let recv_v = self.lower_expr(recv);
                let mut arg_vs = vec![recv_v];
                for a in args {
                    arg_vs.push(self.lower_expr(a));
                }
                match self.fn_ids.get(&qualified) {
                    Some(&id) => {
                        let sig = &self.checked.fn_sigs[&qualified];
                        let effects = sig.effects;
                        let ret = sig.ret.clone();
                        self.builder.call(id, arg_vs, ret, effects)
                    }
                    None => self.builder.const_void(Type::I64),
                }
            }
            ExprKind::Field { recv, name } => {
                let recv_ty = self.expr_ty(recv);
                let recv_v = self.lower_expr(recv);
                match recv_ty.strip_voidable() {
                    Type::Galactic => {
                        let idx = galactic_field_index(name);
                        let idx_v = self.builder.const_int(Type::I64, idx);
                        self.builder.extract_field(recv_v, idx_v, Type::Scalar)
                    }
                    Type::Struct(sname) => {
                        let offset = self
                            .checked
                            .structs
                            .get(sname)
                            .and_then(|info| {
                                info.field_index(name).map(|i| info.field_offset(i))
                            })
                            .unwrap_or(0);
                        let off_v = self.builder.const_int(Type::U64, offset);
                        let addr = self.builder.gep(recv_v, off_v, ty.clone());
                        self.builder.load(addr, ty)
                    }
                    _ => self.builder.const_void(Type::I64),
                }
            }
            ExprKind::Index { recv, index } => {
                let recv_ty = self.expr_ty(recv);
                let recv_v = self.lower_expr(recv);
                let idx_v = self.lower_expr(index);
                match recv_ty.strip_voidable() {
                    // Capability-backed reads miss to VOID.
                    Type::Slice(_) | Type::Capability | Type::Str => {
                        self.builder.cap_load(recv_v, idx_v, ty)
                    }
                    Type::Array(elem, _) => {
                        let size = elem.byte_size().unwrap_or(8).max(1);
                        let size_v = self.builder.const_int(Type::U64, size);
                        let byte_off =
                            self.builder.binary(Opcode::Mul, Type::U64, idx_v, size_v);
                        let addr = self.builder.gep(recv_v, byte_off, ty.clone());
                        self.builder.load(addr, ty)
                    }
                    _ => self.builder.const_void(Type::I64),
                }
            }
            ExprKind::Cast { expr, ty: _ } => {
                let from_ty = self.expr_ty(expr);
                let v = self.lower_expr(expr);
                self.lower_cast(v, from_ty.strip_voidable(), ty.strip_voidable())
            }
            ExprKind::Block(block) => {
                let out = self.lower_block(block);
                out.unwrap_or_else(|| self.builder.const_unit())
            }
            ExprKind::If {
                cond,
                then_block,
                else_branch,
            } => self.lower_if(cond, then_block, else_branch.as_deref(), &ty),
            ExprKind::Match { scrutinee, arms } => self.lower_match(scrutinee, arms, &ty),
            ExprKind::Range { lo, hi, .. } => {
                // Ranges outside for-in only appear transiently; lower the
                // bounds for effects and hand back the low bound.
                let lo_v = self.lower_expr(lo);
                self.lower_expr(hi);
                lo_v
            }
            ExprKind::VoidProp(operand) => {
                let v = self.lower_expr(operand);
                self.builder.void_prop(v)
            }
            ExprKind::VoidAssert(operand) => {
                let v = self.lower_expr(operand);
                self.builder.void_assert(v)
            }
            ExprKind::Coalesce { value, default } => {
                let v = self.lower_expr(value);
                let d = self.lower_expr(default);
                self.builder.void_coalesce(v, d)
            }
            ExprKind::Pipe { value, func } => {
                // v |> f is f(v).
                let args = std::slice::from_ref(value.as_ref());
                self.lower_call_with_values(func, args, &ty)
            }
            ExprKind::Persist(block) => self.lower_persist(block),
            ExprKind::Aether(block) => {
                let sub = self.builder.const_int(Type::U64, SUBSTRATE_AETHER);
                self.builder.substrate_enter(sub);
                let out = self.lower_block(block);
                self.builder.substrate_exit();
                out.unwrap_or_else(|| self.builder.const_unit())
            }
            ExprKind::Recover { body, handler } => self.lower_recover(body, handler, &ty),
        }
    }

    fn lower_store_to(&mut self, target: &Expr, v: ValueId) {
        match &target.kind {
            ExprKind::Ident(name) => {
                if let Some((slot, _)) = self.lookup_local(name) {
                    self.builder.store(slot, v);
                }
            }
            ExprKind::Field { recv, name } => {
                let recv_ty = self.expr_ty(recv);
                let recv_v = self.lower_expr(recv);
                if let Type::Struct(sname) = recv_ty.strip_voidable() {
                    let offset = self
                        .checked
                        .structs
                        .get(sname)
                        .and_then(|info| info.field_index(name).map(|i| info.field_offset(i)))
                        .unwrap_or(0);
                    let off_v = self.builder.const_int(Type::U64, offset);
                    let addr = self.builder.gep(recv_v, off_v, Type::U64);
                    self.builder.store(addr, v);
                }
            }
            ExprKind::Index { recv, index } => {
                let recv_ty = self.expr_ty(recv);
                let recv_v = self.lower_expr(recv);
                let idx_v = self.lower_expr(index);
                match recv_ty.strip_voidable() {
                    Type::Slice(_) | Type::Capability => {
                        self.builder.cap_store(recv_v, idx_v, v);
                    }
                    Type::Array(elem, _) => {
                        let size = elem.byte_size().unwrap_or(8).max(1);
                        let size_v = self.builder.const_int(Type::U64, size);
                        let byte_off =
                            self.builder.binary(Opcode::Mul, Type::U64, idx_v, size_v);
                        let addr = self.builder.gep(recv_v, byte_off, Type::U64);
                        self.builder.store(addr, v);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn lower_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> ValueId {
        // Short-circuit forms get their own control flow.
        if matches!(op, BinOp::And | BinOp::Or) {
            return self.lower_short_circuit(op, lhs, rhs);
        }
        let lt = self.expr_ty(lhs);
        let a = self.lower_expr(lhs);
        let b = self.lower_expr(rhs);
        self.lower_binop_values(op, a, b, &lt)
    }

    fn lower_binop_values(&mut self, op: BinOp, a: ValueId, b: ValueId, lt: &Type) -> ValueId {
        let base = lt.strip_voidable().clone();
        let galactic = matches!(base, Type::Galactic);
        let unsigned = matches!(base, Type::Int { signed: false, .. });

        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                let opcode = match op {
                    BinOp::Add => Opcode::Add,
                    BinOp::Sub => Opcode::Sub,
                    BinOp::Mul => Opcode::Mul,
                    BinOp::Div => Opcode::Div,
                    _ => Opcode::Mod,
                };
                if galactic {
                    let gop = match opcode {
                        Opcode::Add => Opcode::GalAdd,
                        Opcode::Mul => Opcode::GalMul,
                        Opcode::Div => Opcode::GalDiv,
                        other => other,
                    };
                    self.builder.gal_binary(gop, a, b)
                } else {
                    self.builder.binary(opcode, base, a, b)
                }
            }
            BinOp::BitAnd => self.builder.binary(Opcode::And, base, a, b),
            BinOp::BitOr => self.builder.binary(Opcode::Or, base, a, b),
            BinOp::BitXor => self.builder.binary(Opcode::Xor, base, a, b),
            BinOp::Shl => self.builder.binary(Opcode::Shl, base, a, b),
            BinOp::Shr => {
                let opcode = if unsigned { Opcode::Shr } else { Opcode::Sar };
                self.builder.binary(opcode, base, a, b)
            }
            BinOp::Eq => self.builder.cmp(Opcode::CmpEq, a, b),
            BinOp::Ne => self.builder.cmp(Opcode::CmpNe, a, b),
            BinOp::Lt => {
                let opcode = if unsigned { Opcode::CmpLtU } else { Opcode::CmpLt };
                self.builder.cmp(opcode, a, b)
            }
            BinOp::Le => {
                let opcode = if unsigned { Opcode::CmpLeU } else { Opcode::CmpLe };
                self.builder.cmp(opcode, a, b)
            }
            BinOp::Gt => {
                let opcode = if unsigned { Opcode::CmpGtU } else { Opcode::CmpGt };
                self.builder.cmp(opcode, a, b)
            }
            BinOp::Ge => {
                let opcode = if unsigned { Opcode::CmpGeU } else { Opcode::CmpGe };
                self.builder.cmp(opcode, a, b)
            }
            BinOp::And | BinOp::Or => unreachable!("short-circuit handled earlier"),
        }
    }

    /// Merge points carry their value through a slot rather than a phi,
    /// so every block writes the location before jumping and the join
    /// reloads it.
    fn merge_slot(&mut self, ty: &Type) -> ValueId {
        let size = ty.byte_size().unwrap_or(8).max(8);
        self.builder.alloca(ty.clone(), size)
    }

    fn lower_short_circuit(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> ValueId {
        let slot = self.merge_slot(&Type::Bool);
        let a = self.lower_expr(lhs);
        self.builder.store(slot, a);
        let rhs_bb = self.builder.add_block();
        let join_bb = self.builder.add_block();

        match op {
            // a && b: only evaluate b when a is true.
            BinOp::And => self.builder.branch(a, rhs_bb, join_bb),
            // a || b: only evaluate b when a is false.
            _ => self.builder.branch(a, join_bb, rhs_bb),
        };

        self.builder.switch_to(rhs_bb);
        let b = self.lower_expr(rhs);
        self.builder.store(slot, b);
        self.builder.jump(join_bb);

        self.builder.switch_to(join_bb);
        self.builder.load(slot, Type::Bool)
    }

    fn lower_if(
        &mut self,
        cond: &Expr,
        then_block: &Block,
        else_branch: Option<&Expr>,
        ty: &Type,
    ) -> ValueId {
        let has_value = *ty != Type::Void;
        let slot = has_value.then(|| self.merge_slot(ty));
        let c = self.lower_expr(cond);
        let then_bb = self.builder.add_block();
        let else_bb = self.builder.add_block();
        let join_bb = self.builder.add_block();
        self.builder.branch(c, then_bb, else_bb);

        self.builder.switch_to(then_bb);
        let then_v = self.lower_block(then_block);
        if !self.builder.is_terminated() {
            if let (Some(slot), Some(v)) = (slot, then_v) {
                self.builder.store(slot, v);
            }
            self.builder.jump(join_bb);
        }

        self.builder.switch_to(else_bb);
        let else_v = else_branch.map(|e| self.lower_expr(e));
        if !self.builder.is_terminated() {
            if let (Some(slot), Some(v)) = (slot, else_v) {
                self.builder.store(slot, v);
            }
            self.builder.jump(join_bb);
        }

        self.builder.switch_to(join_bb);
        match slot {
            Some(slot) => self.builder.load(slot, ty.clone()),
            None => self.builder.const_unit(),
        }
    }

    fn lower_match(
        &mut self,
        scrutinee: &Expr,
        arms: &[crate::ast::MatchArm],
        ty: &Type,
    ) -> ValueId {
        let slot = (*ty != Type::Void).then(|| self.merge_slot(ty));
        let scrut_ty = self.expr_ty(scrutinee);
        let scrut_v = self.lower_expr(scrutinee);

        // Enum scrutinees switch on the tag stored at offset 0.
        let is_enum = matches!(scrut_ty.strip_voidable(), Type::Enum(_));
        let switch_v = if is_enum {
            let zero = self.builder.const_int(Type::U64, 0);
            let addr = self.builder.gep(scrut_v, zero, Type::I64);
            self.builder.load(addr, Type::I64)
        } else {
            scrut_v
        };

        let join_bb = self.builder.add_block();
        let mut cases: Vec<(ValueId, BlockId)> = Vec::new();
        let mut default_bb = None;
        let mut arm_blocks: Vec<(BlockId, &crate::ast::MatchArm)> = Vec::new();

        for arm in arms {
            let bb = self.builder.add_block();
            match &arm.pattern {
                Pattern::Int(v) => {
                    let case_v = self.builder.const_int(Type::I64, *v as u64);
                    cases.push((case_v, bb));
                }
                Pattern::Bool(v) => {
                    let case_v = self.builder.const_int(Type::I64, *v as u64);
                    cases.push((case_v, bb));
                }
                Pattern::Variant { name, .. } => {
                    let tag = self.variant_tag(&scrut_ty, name);
                    let case_v = self.builder.const_int(Type::I64, tag);
                    cases.push((case_v, bb));
                }
                Pattern::Void | Pattern::Wildcard | Pattern::Binding(_) => {
                    if default_bb.is_none() {
                        default_bb = Some(bb);
                    }
                }
            }
            arm_blocks.push((bb, arm));
        }
        let default = default_bb.unwrap_or(join_bb);
        self.builder.switch_(switch_v, cases, default);

        for (bb, arm) in arm_blocks {
            self.builder.switch_to(bb);
            self.scopes.push(HashMap::new());
            self.bind_pattern_values(&arm.pattern, scrut_v, &scrut_ty);
            let v = self.lower_expr(&arm.body);
            self.scopes.pop();
            if !self.builder.is_terminated() {
                if let Some(slot) = slot {
                    self.builder.store(slot, v);
                }
                self.builder.jump(join_bb);
            }
        }

        self.builder.switch_to(join_bb);
        match slot {
            Some(slot) => self.builder.load(slot, ty.clone()),
            None => self.builder.const_unit(),
        }
    }

    fn variant_tag(&self, scrut_ty: &Type, name: &str) -> u64 {
        if let Type::Enum(ename) = scrut_ty.strip_voidable() {
            if let Some(info) = self.checked.enums.get(ename) {
                if let Some(idx) = info.variant_index(name) {
                    return idx as u64;
                }
            }
        }
        0
    }

    fn bind_pattern_values(&mut self, pattern: &Pattern, scrut_v: ValueId, scrut_ty: &Type) {
        match pattern {
            Pattern::Binding(name) => {
                let ty = scrut_ty.clone();
                let size = ty.byte_size().unwrap_or(8).max(8);
                let slot = self.builder.alloca(ty.clone(), size);
                self.builder.store(slot, scrut_v);
                self.scopes
                    .last_mut()
                    .expect("arm scope")
                    .insert(name.clone(), (slot, ty));
            }
            Pattern::Variant { name, bindings } => {
                // Payload fields live after the tag word.
                let Type::Enum(ename) = scrut_ty.strip_voidable() else {
                    return;
                };
                let Some(info) = self.checked.enums.get(ename).cloned() else {
                    return;
                };
                let Some(idx) = info.variant_index(name) else {
                    return;
                };
                let payload = &info.variants[idx].1;
                for (i, (bname, bty)) in
                    bindings.iter().zip(payload.iter()).enumerate()
                {
                    let off = self.builder.const_int(Type::U64, 8 * (i as u64 + 1));
                    let addr = self.builder.gep(scrut_v, off, bty.clone());
                    let v = self.builder.load(addr, bty.clone());
                    let size = bty.byte_size().unwrap_or(8).max(8);
                    let slot = self.builder.alloca(bty.clone(), size);
                    self.builder.store(slot, v);
                    self.scopes
                        .last_mut()
                        .expect("arm scope")
                        .insert(bname.clone(), (slot, bty.clone()));
                }
            }
            _ => {}
        }
    }

    fn lower_call(&mut self, callee: &Expr, args: &[Expr], ret_ty: &Type) -> ValueId {
        if let ExprKind::Ident(name) = &callee.kind {
            // Builtins lower to opcodes.
            if let Some(v) = self.lower_builtin(name, args) {
                return v;
            }
            // Enum variant constructor.
            if let Some(v) = self.lower_variant_ctor(name, args) {
                return v;
            }
            if let Some(&id) = self.fn_ids.get(name.as_str()) {
                let sig = self.checked.fn_sigs[name.as_str()].clone();
                let arg_vs: Vec<ValueId> = args.iter().map(|a| self.lower_expr(a)).collect();
                return self.builder.call(id, arg_vs, sig.ret, sig.effects);
            }
        }
        self.lower_call_with_values(callee, args, ret_ty)
    }

    fn lower_call_with_values(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        ret_ty: &Type,
    ) -> ValueId {
        // Direct call when the callee names a function.
        if let ExprKind::Ident(name) = &callee.kind {
            if let Some(&id) = self.fn_ids.get(name.as_str()) {
                let sig = self.checked.fn_sigs[name.as_str()].clone();
                let arg_vs: Vec<ValueId> = args.iter().map(|a| self.lower_expr(a)).collect();
                return self.builder.call(id, arg_vs, sig.ret, sig.effects);
            }
        }
        let target = self.lower_expr(callee);
        let effects = match self.expr_ty(callee) {
            Type::Function { effects, .. } => effects,
            _ => EffectSet::ALL,
        };
        let arg_vs: Vec<ValueId> = args.iter().map(|a| self.lower_expr(a)).collect();
        self.builder
            .call_indirect(target, arg_vs, ret_ty.clone(), effects)
    }

    fn lower_variant_ctor(&mut self, name: &str, args: &[Expr]) -> Option<ValueId> {
        let (ename, idx, payload_len) = self.checked.enums.iter().find_map(|(ename, info)| {
            info.variant_index(name)
                .map(|i| (ename.clone(), i, info.variants[i].1.len()))
        })?;
        let _ = ename;
        // Tagged-union layout: [tag][field0][field1]...
        let size = 8 * (payload_len as u64 + 1);
        let slot = self.builder.alloca(Type::I64, size);
        let tag = self.builder.const_int(Type::I64, idx as u64);
        self.builder.store(slot, tag);
        for (i, a) in args.iter().enumerate() {
            let v = self.lower_expr(a);
            let off = self.builder.const_int(Type::U64, 8 * (i as u64 + 1));
            let addr = self.builder.gep(slot, off, Type::U64);
            self.builder.store(addr, v);
        }
        Some(slot)
    }

    fn lower_builtin(&mut self, name: &str, args: &[Expr]) -> Option<ValueId> {
        let arg = |ctx: &mut Self, i: usize| -> ValueId {
            args.get(i)
                .map(|a| ctx.lower_expr(a))
                .unwrap_or_else(|| ctx.builder.const_int(Type::U64, 0))
        };
        Some(match name {
            "atlas_begin" => self.builder.atlas_begin(),
            "atlas_commit" => {
                let tx = arg(self, 0);
                self.builder.atlas_commit(tx);
                self.builder.const_unit()
            }
            "atlas_rollback" => {
                let tx = arg(self, 0);
                self.builder.atlas_rollback(tx);
                self.builder.const_unit()
            }
            "atlas_load" => {
                let addr = arg(self, 0);
                self.builder.atlas_load(addr)
            }
            "atlas_store" => {
                let addr = arg(self, 0);
                let v = arg(self, 1);
                self.builder.atlas_store(addr, v);
                self.builder.const_unit()
            }
            // Address 0 is the root-pointer slot.
            "atlas_root" => {
                let zero = self.builder.const_int(Type::U64, 0);
                self.builder.atlas_load(zero)
            }
            "atlas_set_root" => {
                let zero = self.builder.const_int(Type::U64, 0);
                let v = arg(self, 0);
                self.builder.atlas_store(zero, v);
                self.builder.const_unit()
            }
            "aether_load" => {
                let addr = arg(self, 0);
                self.builder.aether_load(addr)
            }
            "aether_store" => {
                let addr = arg(self, 0);
                let v = arg(self, 1);
                self.builder.aether_store(addr, v);
                self.builder.const_unit()
            }
            "aether_sync" => {
                self.builder.aether_sync();
                self.builder.const_unit()
            }
            "chronon_now" => self.builder.chronon_now(),
            "chronon_delta" => {
                let since = arg(self, 0);
                self.builder.chronon_delta(since)
            }
            "chronon_budget" => self.builder.chronon_budget(),
            "chronon_yield" => {
                self.builder.chronon_yield();
                self.builder.const_unit()
            }
            "print_int" | "print_str" | "write_byte" => {
                let v = arg(self, 0);
                let n = self.builder.const_int(Type::I64, SYS_WRITE);
                self.builder.syscall(n, vec![v])
            }
            "read_byte" => {
                let n = self.builder.const_int(Type::I64, SYS_READ);
                self.builder.syscall(n, vec![])
            }
            _ => return None,
        })
    }

    fn lower_persist(&mut self, block: &Block) -> ValueId {
        let sub = self.builder.const_int(Type::U64, SUBSTRATE_ATLAS);
        self.builder.substrate_enter(sub);
        let tx = self.builder.atlas_begin();
        let body_v = self.lower_block(block);
        let out = body_v.unwrap_or_else(|| self.builder.const_unit());

        let out_may_be_void = self.builder.func_ref().value(out).may_be_void;
        if out_may_be_void {
            // Commit on the clean path, roll back when the body escaped
            // with VOID.
            let is_void = self.builder.void_test(out);
            let void_bb = self.builder.add_block();
            let ok_bb = self.builder.add_block();
            let join_bb = self.builder.add_block();
            self.builder.branch(is_void, void_bb, ok_bb);

            self.builder.switch_to(void_bb);
            self.builder.atlas_rollback(tx);
            self.builder.substrate_exit();
            self.builder.jump(join_bb);

            self.builder.switch_to(ok_bb);
            self.builder.atlas_commit(tx);
            self.builder.substrate_exit();
            self.builder.jump(join_bb);

            self.builder.switch_to(join_bb);
        } else {
            self.builder.atlas_commit(tx);
            self.builder.substrate_exit();
        }
        out
    }

    fn lower_recover(&mut self, body: &Block, handler: &Block, ty: &Type) -> ValueId {
        let has_value = *ty != Type::Void;
        let slot = has_value.then(|| self.merge_slot(ty));
        let body_v = self.lower_block(body);
        let body_out = body_v.unwrap_or_else(|| self.builder.const_unit());
        if let Some(slot) = slot {
            self.builder.store(slot, body_out);
        }

        let handler_bb = self.builder.add_block();
        let join_bb = self.builder.add_block();
        let is_void = self.builder.void_test(body_out);
        self.builder.branch(is_void, handler_bb, join_bb);

        self.builder.switch_to(handler_bb);
        let handler_v = self.lower_block(handler);
        let handler_out = handler_v.unwrap_or_else(|| self.builder.const_unit());
        if !self.builder.is_terminated() {
            if let Some(slot) = slot {
                self.builder.store(slot, handler_out);
            }
            self.builder.jump(join_bb);
        }

        self.builder.switch_to(join_bb);
        match slot {
            Some(slot) => self.builder.load(slot, ty.clone()),
            None => self.builder.const_unit(),
        }
    }

    fn lower_cast(&mut self, v: ValueId, from: &Type, to: &Type) -> ValueId {
        use Type::*;
        match (from, to) {
            (a, b) if a == b => v,
            (Int { .. }, Scalar) => self.builder.convert(Opcode::ToScalar, Scalar, v),
            (Scalar, Int { .. }) => self.builder.convert(Opcode::FromScalar, to.clone(), v),
            (Scalar, Galactic) | (Int { .. }, Galactic) => {
                self.builder.convert(Opcode::ToGalactic, Galactic, v)
            }
            (Galactic, Scalar) => self.builder.convert(Opcode::FromGalactic, Scalar, v),
            (Int { width: fw, .. }, Int { width: tw, signed }) => {
                let op = if tw.bits() < fw.bits() {
                    Opcode::Trunc
                } else if *signed {
                    Opcode::Sext
                } else {
                    Opcode::Zext
                };
                self.builder.convert(op, to.clone(), v)
            }
            _ => self.builder.convert(Opcode::Bitcast, to.clone(), v),
        }
    }
}

fn galactic_field_index(name: &str) -> u64 {
    match name {
        "w" => 0,
        "x" => 1,
        "y" => 2,
        _ => 3,
    }
}
