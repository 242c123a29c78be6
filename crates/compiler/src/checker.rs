//! Type and effect checker
//!
//! Two coupled passes over the parsed tree: bottom-up type synthesis
//! seeded by annotations, and effect inference over the six effect bits.
//! Both accumulate diagnostics and keep going, so one compilation surfaces
//! the complete error set.
//!
//! Effect discipline: the global scope allows ALL. Entering a function
//! pushes `(allowed = declared, inferred = NONE)` onto a stack of at most
//! 32 frames; each effect-carrying construct unions its bits into the top
//! frame and is diagnosed at its own source location when the bits are not
//! a subset of the allowed set.

use crate::ast::{
    BinOp, Block, Decl, Expr, ExprKind, FnDecl, Pattern, Program, Stmt, TypeExpr, UnOp,
};
use crate::diagnostics::{DiagKind, Diagnostic, SourceLoc};
use crate::lexer::NumSuffix;
use crate::types::{EffectSet, EnumInfo, IntWidth, StructInfo, Type};
use std::collections::HashMap;

/// Maximum depth of the effect frame stack.
const EFFECT_STACK_MAX: usize = 32;

/// A function signature as the checker and lowering see it.
#[derive(Debug, Clone, PartialEq)]
pub struct FnSig {
    pub params: Vec<(String, Type)>,
    pub ret: Type,
    pub effects: EffectSet,
}

/// Checker output: the signature and type tables the lowering pass reads.
#[derive(Debug, Default)]
pub struct CheckedProgram {
    pub fn_sigs: HashMap<String, FnSig>,
    pub structs: HashMap<String, StructInfo>,
    pub enums: HashMap<String, EnumInfo>,
    /// Inferred type per expression id.
    pub expr_types: HashMap<u32, Type>,
}

struct EffectFrame {
    allowed: EffectSet,
    inferred: EffectSet,
}

pub struct Checker {
    structs: HashMap<String, StructInfo>,
    enums: HashMap<String, EnumInfo>,
    fn_sigs: HashMap<String, FnSig>,
    consts: HashMap<String, Type>,
    scopes: Vec<HashMap<String, Type>>,
    effect_stack: Vec<EffectFrame>,
    expr_types: HashMap<u32, Type>,
    /// Declared return type of the function under check.
    current_ret: Type,
    pub diagnostics: Vec<Diagnostic>,
}

/// Effects of a built-in by name prefix.
pub fn builtin_effects(name: &str) -> Option<EffectSet> {
    if name.starts_with("atlas") {
        Some(EffectSet::PERSIST | EffectSet::VOID)
    } else if name.starts_with("aether") {
        Some(EffectSet::NETWORK | EffectSet::VOID)
    } else if name.starts_with("timer") || name.starts_with("chronon") {
        Some(EffectSet::TIMER)
    } else if name.starts_with("print") {
        Some(EffectSet::IO)
    } else if name.starts_with("read") || name.starts_with("write") {
        Some(EffectSet::IO | EffectSet::VOID)
    } else {
        None
    }
}

/// Exact signatures for the built-ins the runtime provides. Names that
/// match an effect prefix but no exact entry get a flexible signature.
pub fn builtin_signature(name: &str) -> Option<FnSig> {
    let sig = |params: Vec<Type>, ret: Type, effects: EffectSet| FnSig {
        params: params
            .into_iter()
            .enumerate()
            .map(|(i, t)| (format!("a{}", i), t))
            .collect(),
        ret,
        effects,
    };
    let pv = EffectSet::PERSIST | EffectSet::VOID;
    let nv = EffectSet::NETWORK | EffectSet::VOID;
    Some(match name {
        "atlas_begin" => sig(vec![], Type::I64, pv),
        "atlas_commit" => sig(vec![Type::I64], Type::Bool, pv),
        "atlas_rollback" => sig(vec![Type::I64], Type::Void, pv),
        "atlas_load" => sig(vec![Type::U64], Type::voidable(Type::U64), pv),
        "atlas_store" => sig(vec![Type::U64, Type::U64], Type::Void, pv),
        "atlas_root" => sig(vec![], Type::voidable(Type::U64), pv),
        "atlas_set_root" => sig(vec![Type::U64], Type::Void, pv),
        "aether_load" => sig(vec![Type::U64], Type::voidable(Type::U64), nv),
        "aether_store" => sig(vec![Type::U64, Type::U64], Type::Void, nv),
        "aether_sync" => sig(vec![], Type::Void, nv),
        "chronon_now" => sig(vec![], Type::I64, EffectSet::TIMER),
        "chronon_delta" => sig(vec![Type::I64], Type::I64, EffectSet::TIMER),
        "chronon_budget" => sig(vec![], Type::I64, EffectSet::TIMER),
        "chronon_yield" => sig(vec![], Type::Void, EffectSet::TIMER),
        "print_int" => sig(vec![Type::I64], Type::Void, EffectSet::IO),
        "print_str" => sig(vec![Type::Str], Type::Void, EffectSet::IO),
        "read_byte" => sig(
            vec![],
            Type::voidable(Type::I64),
            EffectSet::IO | EffectSet::VOID,
        ),
        "write_byte" => sig(
            vec![Type::I64],
            Type::Void,
            EffectSet::IO | EffectSet::VOID,
        ),
        _ => return None,
    })
}

impl Checker {
    pub fn new() -> Self {
        Checker {
            structs: HashMap::new(),
            enums: HashMap::new(),
            fn_sigs: HashMap::new(),
            consts: HashMap::new(),
            scopes: Vec::new(),
            // Global scope allows everything.
            effect_stack: vec![EffectFrame {
                allowed: EffectSet::ALL,
                inferred: EffectSet::NONE,
            }],
            expr_types: HashMap::new(),
            current_ret: Type::Void,
            diagnostics: Vec::new(),
        }
    }

    pub fn check_program(mut self, program: &Program) -> (CheckedProgram, Vec<Diagnostic>) {
        // Pass 0: register every declaration so order does not matter.
        // Names go in first so type references between declarations
        // resolve regardless of order; shapes fill in behind them.
        for decl in &program.decls {
            match decl {
                Decl::Struct(s) => {
                    self.structs.insert(
                        s.name.clone(),
                        StructInfo {
                            name: s.name.clone(),
                            fields: Vec::new(),
                        },
                    );
                }
                Decl::Enum(e) => {
                    self.enums.insert(
                        e.name.clone(),
                        EnumInfo {
                            name: e.name.clone(),
                            variants: Vec::new(),
                        },
                    );
                }
                _ => {}
            }
        }
        for decl in &program.decls {
            match decl {
                Decl::Struct(s) => {
                    let fields = s
                        .fields
                        .iter()
                        .map(|(n, t)| (n.clone(), self.resolve_type(t, s.loc)))
                        .collect();
                    self.structs.insert(
                        s.name.clone(),
                        StructInfo {
                            name: s.name.clone(),
                            fields,
                        },
                    );
                }
                Decl::Enum(e) => {
                    let variants = e
                        .variants
                        .iter()
                        .map(|(n, tys)| {
                            (
                                n.clone(),
                                tys.iter().map(|t| self.resolve_type(t, e.loc)).collect(),
                            )
                        })
                        .collect();
                    self.enums.insert(
                        e.name.clone(),
                        EnumInfo {
                            name: e.name.clone(),
                            variants,
                        },
                    );
                }
                _ => {}
            }
        }
        for decl in &program.decls {
            match decl {
                Decl::Fn(f) => self.register_fn(f, None),
                Decl::Impl(imp) => {
                    for m in &imp.methods {
                        self.register_fn(m, Some(&imp.ty_name));
                    }
                }
                Decl::Const(c) => {
                    let ty = match &c.ty {
                        Some(t) => self.resolve_type(t, c.loc),
                        None => self.literal_type(&c.value),
                    };
                    self.consts.insert(c.name.clone(), ty);
                }
                _ => {}
            }
        }

        // Pass 1: check bodies.
        for decl in &program.decls {
            match decl {
                Decl::Fn(f) => self.check_fn(f, None),
                Decl::Impl(imp) => {
                    for m in &imp.methods {
                        self.check_fn(m, Some(&imp.ty_name));
                    }
                }
                Decl::Const(c) => {
                    let _ = self.check_expr(&c.value);
                }
                _ => {}
            }
        }

        (
            CheckedProgram {
                fn_sigs: self.fn_sigs,
                structs: self.structs,
                enums: self.enums,
                expr_types: self.expr_types,
            },
            self.diagnostics,
        )
    }

    fn register_fn(&mut self, f: &FnDecl, owner: Option<&str>) {
        let params = f
            .params
            .iter()
            .map(|p| (p.name.clone(), self.resolve_type(&p.ty, f.loc)))
            .collect();
        let ret = f
            .ret
            .as_ref()
            .map(|t| self.resolve_type(t, f.loc))
            .unwrap_or(Type::Void);
        let name = match owner {
            Some(ty) => format!("{}::{}", ty, f.name),
            None => f.name.clone(),
        };
        if self
            .fn_sigs
            .insert(
                name.clone(),
                FnSig {
                    params,
                    ret,
                    effects: f.effects.allowed(),
                },
            )
            .is_some()
        {
            self.diagnostics.push(Diagnostic::new(
                DiagKind::Type,
                f.loc,
                format!("duplicate definition of '{}'", name),
            ));
        }
    }

    fn check_fn(&mut self, f: &FnDecl, owner: Option<&str>) {
        let name = match owner {
            Some(ty) => format!("{}::{}", ty, f.name),
            None => f.name.clone(),
        };
        let sig = self.fn_sigs[&name].clone();

        if self.effect_stack.len() >= EFFECT_STACK_MAX {
            self.diagnostics.push(Diagnostic::new(
                DiagKind::Effect,
                f.loc,
                "effect context stack overflow",
            ));
            return;
        }
        self.effect_stack.push(EffectFrame {
            allowed: sig.effects,
            inferred: EffectSet::NONE,
        });
        self.current_ret = sig.ret.clone();

        self.scopes.push(HashMap::new());
        for (pname, pty) in &sig.params {
            self.scopes
                .last_mut()
                .expect("param scope")
                .insert(pname.clone(), pty.clone());
        }

        let body_ty = self.check_block(&f.body);
        if !matches!(sig.ret, Type::Void) && !self.compatible(&body_ty, &sig.ret) {
            // A body ending in return statements types as void; only flag
            // blocks whose tail value disagrees with the declaration.
            if f.body.tail.is_some() {
                self.diagnostics.push(Diagnostic::new(
                    DiagKind::Type,
                    f.loc,
                    format!(
                        "function '{}' declares return type {} but body has {}",
                        name, sig.ret, body_ty
                    ),
                ));
            }
        }

        self.scopes.pop();
        // Exit: inferred must be a subset of allowed. Site-level checks
        // already reported each violation, so the pop is bookkeeping.
        let frame = self.effect_stack.pop().expect("effect frame");
        debug_assert!(
            frame.inferred.is_subset_of(frame.allowed) || !self.diagnostics.is_empty(),
            "effect violation escaped site-level reporting"
        );
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    fn add_effect(&mut self, bits: EffectSet, loc: SourceLoc, what: &str) {
        let frame = self.effect_stack.last_mut().expect("effect frame");
        frame.inferred |= bits;
        if !bits.is_subset_of(frame.allowed) {
            let allowed = frame.allowed;
            self.diagnostics.push(Diagnostic::effect(
                loc,
                format!("{} requires effects not allowed here", what),
                bits,
                allowed,
            ));
        }
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    fn resolve_type(&mut self, t: &TypeExpr, loc: SourceLoc) -> Type {
        match t {
            TypeExpr::Voidable(inner) => Type::voidable(self.resolve_type(inner, loc)),
            TypeExpr::Slice(inner) => Type::Slice(Box::new(self.resolve_type(inner, loc))),
            TypeExpr::Array(inner, n) => {
                Type::Array(Box::new(self.resolve_type(inner, loc)), *n)
            }
            TypeExpr::Name(name) => match name.as_str() {
                "void" => Type::Void,
                "bool" => Type::Bool,
                "i8" => Type::Int {
                    width: IntWidth::W8,
                    signed: true,
                },
                "i16" => Type::Int {
                    width: IntWidth::W16,
                    signed: true,
                },
                "i32" => Type::Int {
                    width: IntWidth::W32,
                    signed: true,
                },
                "i64" => Type::I64,
                "u8" => Type::U8,
                "u16" => Type::Int {
                    width: IntWidth::W16,
                    signed: false,
                },
                "u32" => Type::Int {
                    width: IntWidth::W32,
                    signed: false,
                },
                "u64" => Type::U64,
                "scalar" => Type::Scalar,
                "dual" => Type::Dual,
                "galactic" => Type::Galactic,
                "capability" => Type::Capability,
                "str" => Type::Str,
                "substrate" => Type::Substrate,
                other => {
                    if self.structs.contains_key(other) {
                        Type::Struct(other.to_string())
                    } else if self.enums.contains_key(other) {
                        Type::Enum(other.to_string())
                    } else {
                        self.diagnostics.push(Diagnostic::new(
                            DiagKind::UndefinedName,
                            loc,
                            format!("unknown type '{}'", other),
                        ));
                        Type::I64
                    }
                }
            },
        }
    }

    /// Shallow literal typing, for unannotated consts.
    fn literal_type(&self, e: &Expr) -> Type {
        match &e.kind {
            ExprKind::Int { suffix, .. } => int_suffix_type(*suffix),
            ExprKind::Float { .. } => Type::Scalar,
            ExprKind::Str(_) => Type::Str,
            ExprKind::Bool(_) => Type::Bool,
            _ => Type::I64,
        }
    }

    /// `have` can flow into `want`: exact match, or T into Voidable(T),
    /// or the VOID literal into any voidable.
    fn compatible(&self, have: &Type, want: &Type) -> bool {
        if have == want {
            return true;
        }
        match (have, want) {
            (Type::Voidable(inner), Type::Voidable(winner)) => {
                **inner == Type::Void || inner == winner
            }
            (h, Type::Voidable(inner)) => h == &**inner || *h == Type::Void,
            (Type::Voidable(inner), w) => **inner == Type::Void && *w == Type::Void,
            _ => false,
        }
    }

    fn lookup(&self, name: &str) -> Option<Type> {
        for scope in self.scopes.iter().rev() {
            if let Some(t) = scope.get(name) {
                return Some(t.clone());
            }
        }
        self.consts.get(name).cloned()
    }

    fn define(&mut self, name: &str, ty: Type) {
        self.scopes
            .last_mut()
            .expect("active scope")
            .insert(name.to_string(), ty);
    }

    fn type_error(&mut self, loc: SourceLoc, message: impl Into<String>) -> Type {
        self.diagnostics
            .push(Diagnostic::new(DiagKind::Type, loc, message));
        Type::I64
    }

    // ------------------------------------------------------------------
    // Blocks and statements
    // ------------------------------------------------------------------

    fn check_block(&mut self, block: &Block) -> Type {
        self.scopes.push(HashMap::new());
        for stmt in &block.stmts {
            self.check_stmt(stmt);
        }
        let ty = match &block.tail {
            Some(e) => self.check_expr(e),
            None => Type::Void,
        };
        self.scopes.pop();
        ty
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Let {
                name,
                ty,
                value,
                loc,
                ..
            }
            | Stmt::Const {
                name,
                ty,
                value,
                loc,
            } => {
                let value_ty = self.check_expr(value);
                let bound = match ty {
                    Some(annot) => {
                        let want = self.resolve_type(annot, *loc);
                        if !self.compatible(&value_ty, &want) {
                            self.type_error(
                                *loc,
                                format!(
                                    "binding '{}' declared {} but initializer has {}",
                                    name, want, value_ty
                                ),
                            );
                        }
                        want
                    }
                    None => value_ty,
                };
                self.define(name, bound);
            }
            Stmt::Return { value, loc } => {
                let ty = match value {
                    Some(e) => self.check_expr(e),
                    None => Type::Void,
                };
                let want = self.current_ret.clone();
                if !self.compatible(&ty, &want) {
                    self.type_error(
                        *loc,
                        format!("return type {} does not match declared {}", ty, want),
                    );
                }
            }
            Stmt::While { cond, body, .. } => {
                let cond_ty = self.check_expr(cond);
                if !matches!(cond_ty, Type::Bool) {
                    self.type_error(cond.loc, format!("while condition is {}, not bool", cond_ty));
                }
                self.check_block(body);
            }
            Stmt::ForIn {
                var, iter, body, ..
            } => {
                let iter_ty = self.check_expr(iter);
                let elem = match &iter_ty {
                    Type::Struct(name) if name == "Range" => Type::I64,
                    Type::Slice(elem) => (**elem).clone(),
                    Type::Array(elem, _) => (**elem).clone(),
                    other => self.type_error(
                        iter.loc,
                        format!("for-in needs a range, slice or array, got {}", other),
                    ),
                };
                self.scopes.push(HashMap::new());
                self.define(var, elem);
                for s in &body.stmts {
                    self.check_stmt(s);
                }
                if let Some(tail) = &body.tail {
                    self.check_expr(tail);
                }
                self.scopes.pop();
            }
            Stmt::Break { .. } | Stmt::Continue { .. } => {}
            Stmt::Expr(e) => {
                self.check_expr(e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn check_expr(&mut self, e: &Expr) -> Type {
        let ty = self.check_expr_inner(e);
        self.expr_types.insert(e.id, ty.clone());
        ty
    }

    fn check_expr_inner(&mut self, e: &Expr) -> Type {
        let loc = e.loc;
        match &e.kind {
            ExprKind::Int { suffix, .. } => int_suffix_type(*suffix),
            ExprKind::Float { suffix, .. } => match suffix {
                NumSuffix::Dual => Type::Dual,
                NumSuffix::Galactic => Type::Galactic,
                _ => Type::Scalar,
            },
            ExprKind::Str(_) => Type::Str,
            ExprKind::Char(_) => Type::Int {
                width: IntWidth::W32,
                signed: false,
            },
            ExprKind::Bool(_) => Type::Bool,
            ExprKind::Void => {
                // The VOID literal contributes the VOID effect.
                self.add_effect(EffectSet::VOID, loc, "the VOID literal");
                Type::voidable(Type::Void)
            }
            ExprKind::Ident(name) => {
                if let Some(t) = self.lookup(name) {
                    return t;
                }
                if let Some(sig) = self.fn_sigs.get(name).cloned() {
                    return Type::Function {
                        params: sig.params.iter().map(|(_, t)| t.clone()).collect(),
                        ret: Box::new(sig.ret),
                        effects: sig.effects,
                    };
                }
                if builtin_effects(name).is_some() {
                    // Bare reference to a builtin: treat as opaque function.
                    return Type::Function {
                        params: vec![],
                        ret: Box::new(Type::voidable(Type::I64)),
                        effects: builtin_effects(name).unwrap_or(EffectSet::ALL),
                    };
                }
                self.diagnostics.push(Diagnostic::new(
                    DiagKind::UndefinedName,
                    loc,
                    format!("undefined name '{}'", name),
                ));
                Type::I64
            }
            ExprKind::Binary { op, lhs, rhs } => self.check_binary(*op, lhs, rhs, loc),
            ExprKind::Unary { op, operand } => {
                let t = self.check_expr(operand);
                match op {
                    UnOp::Neg => {
                        if !t.strip_voidable().is_numeric() {
                            return self.type_error(loc, format!("cannot negate {}", t));
                        }
                        t
                    }
                    UnOp::Not => {
                        if !matches!(t.strip_voidable(), Type::Bool) {
                            return self.type_error(loc, format!("'!' needs bool, got {}", t));
                        }
                        t
                    }
                    UnOp::BitNot => {
                        if !t.strip_voidable().is_integer() {
                            return self.type_error(loc, format!("'~' needs an integer, got {}", t));
                        }
                        t
                    }
                }
            }
            ExprKind::Assign { target, op, value } => {
                let target_ty = self.check_expr(target);
                let value_ty = self.check_expr(value);
                if let Some(op) = op {
                    // Compound assignment re-checks as the binary form.
                    if matches!(op, BinOp::Div | BinOp::Mod) {
                        self.add_effect(EffectSet::VOID, loc, "compound division");
                    }
                }
                if !self.compatible(&value_ty, &target_ty) {
                    self.type_error(
                        loc,
                        format!("cannot assign {} to place of type {}", value_ty, target_ty),
                    );
                }
                if !matches!(
                    target.kind,
                    ExprKind::Ident(_) | ExprKind::Field { .. } | ExprKind::Index { .. }
                ) {
                    self.type_error(loc, "assignment target is not a place");
                }
                Type::Void
            }
            ExprKind::Call { callee, args } => self.check_call(callee, args, loc),
            ExprKind::MethodCall { recv, name, args } => {
                let recv_ty = self.check_expr(recv);
                let ty_name = match recv_ty.strip_voidable() {
                    Type::Struct(n) | Type::Enum(n) => n.clone(),
                    other => {
                        return self.type_error(
                            loc,
                            format!("method call on non-struct type {}", other),
                        );
                    }
                };
                let qualified = format!("{}::{}", ty_name, name);
                let Some(sig) = self.fn_sigs.get(&qualified).cloned() else {
                    return self.type_error(
                        loc,
                        format!("no method '{}' on type {}", name, ty_name),
                    );
                };
                // Receiver is the implicit first argument.
                self.check_args(&sig, args, 1, loc);
                self.add_effect(sig.effects, loc, &format!("call to '{}'", qualified));
                sig.ret
            }
            ExprKind::Field { recv, name } => {
                let recv_ty = self.check_expr(recv);
                match recv_ty.strip_voidable() {
                    Type::Struct(sname) => {
                        let Some(info) = self.structs.get(sname) else {
                            return self.type_error(loc, format!("unknown struct '{}'", sname));
                        };
                        match info.fields.iter().find(|(n, _)| n == name) {
                            Some((_, ty)) => ty.clone(),
                            None => {
                                let sname = sname.clone();
                                self.type_error(
                                    loc,
                                    format!("struct {} has no field '{}'", sname, name),
                                )
                            }
                        }
                    }
                    Type::Galactic => match name.as_str() {
                        "w" | "x" | "y" | "z" => Type::Scalar,
                        _ => self.type_error(loc, format!("galactic has no field '{}'", name)),
                    },
                    other => {
                        self.type_error(loc, format!("field access on non-struct {}", other))
                    }
                }
            }
            ExprKind::Index { recv, index } => {
                let recv_ty = self.check_expr(recv);
                let idx_ty = self.check_expr(index);
                if !idx_ty.strip_voidable().is_integer() {
                    self.type_error(index.loc, format!("index must be integer, got {}", idx_ty));
                }
                // Bounds are checked at runtime; a miss reads VOID.
                self.add_effect(EffectSet::VOID, loc, "indexing");
                match recv_ty.strip_voidable() {
                    Type::Slice(elem) | Type::Array(elem, _) => (**elem).clone(),
                    Type::Str => Type::U8,
                    Type::Capability => Type::U8,
                    other => self.type_error(loc, format!("cannot index {}", other)),
                }
            }
            ExprKind::Cast { expr, ty } => {
                let from = self.check_expr(expr);
                let to = self.resolve_type(ty, loc);
                let ok = from.strip_voidable().is_numeric() && to.is_numeric()
                    || from.strip_voidable() == &to;
                if !ok {
                    self.type_error(loc, format!("invalid cast from {} to {}", from, to));
                }
                to
            }
            ExprKind::Block(block) => self.check_block(block),
            ExprKind::If {
                cond,
                then_block,
                else_branch,
            } => {
                let cond_ty = self.check_expr(cond);
                if !matches!(cond_ty.strip_voidable(), Type::Bool) {
                    self.type_error(cond.loc, format!("if condition is {}, not bool", cond_ty));
                }
                let then_ty = self.check_block(then_block);
                match else_branch {
                    Some(else_e) => {
                        let else_ty = self.check_expr(else_e);
                        if self.compatible(&else_ty, &then_ty) {
                            then_ty
                        } else if self.compatible(&then_ty, &else_ty) {
                            else_ty
                        } else {
                            self.type_error(
                                loc,
                                format!("if branches disagree: {} vs {}", then_ty, else_ty),
                            )
                        }
                    }
                    None => Type::Void,
                }
            }
            ExprKind::Match { scrutinee, arms } => {
                let scrut_ty = self.check_expr(scrutinee);
                let mut result: Option<Type> = None;
                for arm in arms {
                    self.scopes.push(HashMap::new());
                    self.bind_pattern(&arm.pattern, &scrut_ty, arm.loc);
                    let arm_ty = self.check_expr(&arm.body);
                    self.scopes.pop();
                    match &result {
                        None => result = Some(arm_ty),
                        Some(prev) => {
                            if !self.compatible(&arm_ty, prev) && !self.compatible(prev, &arm_ty) {
                                self.type_error(
                                    arm.loc,
                                    format!("match arms disagree: {} vs {}", prev, arm_ty),
                                );
                            }
                        }
                    }
                }
                result.unwrap_or(Type::Void)
            }
            ExprKind::Range { lo, hi, .. } => {
                let lo_ty = self.check_expr(lo);
                let hi_ty = self.check_expr(hi);
                if !lo_ty.strip_voidable().is_integer() || !hi_ty.strip_voidable().is_integer() {
                    self.type_error(loc, "range bounds must be integers");
                }
                Type::Struct("Range".to_string())
            }
            ExprKind::VoidProp(operand) => {
                let t = self.check_expr(operand);
                self.add_effect(EffectSet::VOID, loc, "the '??' operator");
                if !self.current_ret.is_voidable() && self.effect_stack.len() > 1 {
                    self.type_error(
                        loc,
                        "'??' short-circuits to a VOID return, but the enclosing \
                         function does not return a voidable type",
                    );
                }
                match t {
                    Type::Voidable(inner) => *inner,
                    other => {
                        self.type_error(
                            loc,
                            format!("'??' needs a voidable operand, got {}", other),
                        );
                        other
                    }
                }
            }
            ExprKind::VoidAssert(operand) => {
                let t = self.check_expr(operand);
                self.add_effect(EffectSet::VOID, loc, "the '!!' operator");
                match t {
                    Type::Voidable(inner) => *inner,
                    other => other,
                }
            }
            ExprKind::Coalesce { value, default } => {
                let value_ty = self.check_expr(value);
                let default_ty = self.check_expr(default);
                self.add_effect(EffectSet::VOID, loc, "the '??' coalesce");
                let inner = match value_ty {
                    Type::Voidable(inner) => *inner,
                    other => other,
                };
                let inner = if inner == Type::Void {
                    // Coalescing the bare VOID literal takes the default's type.
                    default_ty.strip_voidable().clone()
                } else {
                    inner
                };
                if !self.compatible(&default_ty, &inner)
                    && !self.compatible(&default_ty, &Type::voidable(inner.clone()))
                {
                    self.type_error(
                        loc,
                        format!("coalesce default {} does not match {}", default_ty, inner),
                    );
                }
                inner
            }
            ExprKind::Pipe { value, func } => {
                // `v |> f` is `f(v)`.
                let value_ty = self.check_expr(value);
                let func_ty = self.check_expr(func);
                match func_ty {
                    Type::Function {
                        params,
                        ret,
                        effects,
                    } => {
                        if params.len() != 1 {
                            self.type_error(loc, "pipe target must take exactly one argument");
                        } else if !self.compatible(&value_ty, &params[0]) {
                            self.type_error(
                                loc,
                                format!("cannot pipe {} into fn({})", value_ty, params[0]),
                            );
                        }
                        self.add_effect(effects, loc, "piped call");
                        *ret
                    }
                    other => self.type_error(loc, format!("pipe target is {}, not a function", other)),
                }
            }
            ExprKind::Persist(block) => {
                self.add_effect(
                    EffectSet::PERSIST | EffectSet::VOID,
                    loc,
                    "a persist block",
                );
                self.check_block(block)
            }
            ExprKind::Aether(block) => {
                self.add_effect(
                    EffectSet::NETWORK | EffectSet::VOID,
                    loc,
                    "an aether block",
                );
                self.check_block(block)
            }
            ExprKind::Recover { body, handler } => {
                // The body types as ??T; the whole expression is T, with the
                // handler entered exactly when the body is VOID.
                self.add_effect(EffectSet::VOID, loc, "a recover block");
                let body_ty = self.check_block(body);
                let result = body_ty.strip_voidable().clone();
                let handler_ty = self.check_block(handler);
                if !self.compatible(&handler_ty, &result) {
                    self.type_error(
                        loc,
                        format!(
                            "recover handler has {} but the body recovers to {}",
                            handler_ty, result
                        ),
                    );
                }
                result
            }
        }
    }

    fn check_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, loc: SourceLoc) -> Type {
        let lt = self.check_expr(lhs);
        let rt = self.check_expr(rhs);
        let lbase = lt.strip_voidable().clone();
        let rbase = rt.strip_voidable().clone();
        let voidable = lt.is_voidable() || rt.is_voidable();

        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                if !lbase.is_numeric() || lbase != rbase {
                    return self.type_error(
                        loc,
                        format!("arithmetic on mismatched types {} and {}", lt, rt),
                    );
                }
                if matches!(op, BinOp::Div | BinOp::Mod) {
                    // Divide-by-zero produces VOID at runtime.
                    self.add_effect(EffectSet::VOID, loc, "division");
                    return Type::voidable(lbase);
                }
                if voidable {
                    Type::voidable(lbase)
                } else {
                    lbase
                }
            }
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
                if !lbase.is_integer() || !rbase.is_integer() {
                    return self.type_error(
                        loc,
                        format!("bitwise op on non-integers {} and {}", lt, rt),
                    );
                }
                if voidable {
                    Type::voidable(lbase)
                } else {
                    lbase
                }
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                if lbase != rbase {
                    self.type_error(loc, format!("comparing {} with {}", lt, rt));
                }
                Type::Bool
            }
            BinOp::And | BinOp::Or => {
                if !matches!(lbase, Type::Bool) || !matches!(rbase, Type::Bool) {
                    self.type_error(loc, format!("logical op on {} and {}", lt, rt));
                }
                Type::Bool
            }
        }
    }

    fn check_call(&mut self, callee: &Expr, args: &[Expr], loc: SourceLoc) -> Type {
        // Direct calls by name cover user functions and builtins.
        if let ExprKind::Ident(name) = &callee.kind {
            if let Some(sig) = self.fn_sigs.get(name).cloned() {
                self.expr_types.insert(
                    callee.id,
                    Type::Function {
                        params: sig.params.iter().map(|(_, t)| t.clone()).collect(),
                        ret: Box::new(sig.ret.clone()),
                        effects: sig.effects,
                    },
                );
                self.check_args(&sig, args, 0, loc);
                self.add_effect(sig.effects, loc, &format!("call to '{}'", name));
                return sig.ret;
            }
            if let Some(sig) = builtin_signature(name) {
                self.check_args(&sig, args, 0, loc);
                self.add_effect(sig.effects, loc, &format!("call to builtin '{}'", name));
                return sig.ret;
            }
            if let Some(effects) = builtin_effects(name) {
                // Prefix-matched builtin with no exact signature: check the
                // arguments for their own effects and trust the arity.
                for a in args {
                    self.check_expr(a);
                }
                self.add_effect(effects, loc, &format!("call to builtin '{}'", name));
                return if effects.contains(EffectSet::VOID) {
                    Type::voidable(Type::I64)
                } else {
                    Type::I64
                };
            }
            // Enum variant constructor?
            let hit = self.enums.values().find_map(|info| {
                info.variant_index(name)
                    .map(|idx| (info.name.clone(), info.variants[idx].1.clone()))
            });
            if let Some((ename, payload)) = hit {
                if payload.len() != args.len() {
                    self.type_error(
                        loc,
                        format!(
                            "variant '{}' takes {} values, got {}",
                            name,
                            payload.len(),
                            args.len()
                        ),
                    );
                }
                for (a, want) in args.iter().zip(payload.iter()) {
                    let have = self.check_expr(a);
                    if !self.compatible(&have, want) {
                        self.type_error(
                            a.loc,
                            format!("variant field needs {}, got {}", want, have),
                        );
                    }
                }
                return Type::Enum(ename);
            }
        }

        // Indirect call through a function-typed value.
        let callee_ty = self.check_expr(callee);
        match callee_ty {
            Type::Function {
                params,
                ret,
                effects,
            } => {
                if params.len() != args.len() {
                    self.type_error(
                        loc,
                        format!("call takes {} arguments, got {}", params.len(), args.len()),
                    );
                }
                for (a, want) in args.iter().zip(params.iter()) {
                    let have = self.check_expr(a);
                    if !self.compatible(&have, want) {
                        self.type_error(a.loc, format!("argument needs {}, got {}", want, have));
                    }
                }
                self.add_effect(effects, loc, "indirect call");
                *ret
            }
            other => self.type_error(loc, format!("cannot call a value of type {}", other)),
        }
    }

    fn check_args(&mut self, sig: &FnSig, args: &[Expr], skip: usize, loc: SourceLoc) {
        let expected = &sig.params[skip.min(sig.params.len())..];
        if expected.len() != args.len() {
            self.type_error(
                loc,
                format!("call takes {} arguments, got {}", expected.len(), args.len()),
            );
        }
        for (a, (pname, want)) in args.iter().zip(expected.iter()) {
            let have = self.check_expr(a);
            if !self.compatible(&have, want) {
                self.type_error(
                    a.loc,
                    format!("parameter '{}' needs {}, got {}", pname, want, have),
                );
            }
        }
    }

    fn bind_pattern(&mut self, pattern: &Pattern, scrut_ty: &Type, loc: SourceLoc) {
        match pattern {
            Pattern::Wildcard | Pattern::Int(_) | Pattern::Bool(_) | Pattern::Void => {}
            Pattern::Binding(name) => self.define(name, scrut_ty.clone()),
            Pattern::Variant { name, bindings } => {
                let Type::Enum(ename) = scrut_ty.strip_voidable() else {
                    self.type_error(
                        loc,
                        format!("variant pattern against non-enum {}", scrut_ty),
                    );
                    return;
                };
                let Some(info) = self.enums.get(ename).cloned() else {
                    return;
                };
                let Some(idx) = info.variant_index(name) else {
                    self.type_error(
                        loc,
                        format!("enum {} has no variant '{}'", ename, name),
                    );
                    return;
                };
                let payload = &info.variants[idx].1;
                if bindings.len() > payload.len() {
                    self.type_error(loc, "more bindings than variant fields");
                }
                for (b, ty) in bindings.iter().zip(payload.iter()) {
                    self.define(b, ty.clone());
                }
            }
        }
    }
}

impl Default for Checker {
    fn default() -> Self {
        Checker::new()
    }
}

fn int_suffix_type(suffix: NumSuffix) -> Type {
    match suffix {
        NumSuffix::None | NumSuffix::I | NumSuffix::I64 => Type::I64,
        NumSuffix::U | NumSuffix::U64 => Type::U64,
        NumSuffix::U8 => Type::U8,
        NumSuffix::U16 => Type::Int {
            width: IntWidth::W16,
            signed: false,
        },
        NumSuffix::U32 => Type::Int {
            width: IntWidth::W32,
            signed: false,
        },
        NumSuffix::I8 => Type::Int {
            width: IntWidth::W8,
            signed: true,
        },
        NumSuffix::I16 => Type::Int {
            width: IntWidth::W16,
            signed: true,
        },
        NumSuffix::I32 => Type::Int {
            width: IntWidth::W32,
            signed: true,
        },
        NumSuffix::Scalar => Type::Scalar,
        NumSuffix::Dual => Type::Dual,
        NumSuffix::Galactic => Type::Galactic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn check(src: &str) -> (CheckedProgram, Vec<Diagnostic>) {
        let mut p = Parser::new(src);
        let prog = p.parse();
        assert!(p.diagnostics.is_empty(), "parse: {:?}", p.diagnostics);
        Checker::new().check_program(&prog)
    }

    #[test]
    fn pure_division_is_diagnosed() {
        let (_, diags) = check("[pure] fn h(a: i64, b: i64) -> ??i64 { a / b }");
        let effect_diags: Vec<_> = diags
            .iter()
            .filter(|d| d.kind == DiagKind::Effect)
            .collect();
        assert_eq!(effect_diags.len(), 1);
        let d = effect_diags[0];
        assert_eq!(d.required, Some(EffectSet::VOID));
        assert_eq!(d.allowed, Some(EffectSet::NONE));
    }

    #[test]
    fn division_allowed_with_void_effect() {
        let (_, diags) = check("effects(VOID) fn f(x: i64) -> ??i64 { 10 / x }");
        assert!(diags.is_empty(), "{:?}", diags);
    }

    #[test]
    fn unannotated_fn_allows_everything() {
        let (_, diags) = check("fn f(x: i64) -> ??i64 { 10 / x }");
        assert!(diags.is_empty(), "{:?}", diags);
    }

    #[test]
    fn void_prop_requires_voidable_return() {
        let (_, diags) =
            check("effects(VOID) fn g(x: i64) -> i64 { let y = (10 / x)??; y + 1 }");
        assert!(diags.iter().any(|d| d.kind == DiagKind::Type));
    }

    #[test]
    fn void_prop_well_typed() {
        let (checked, diags) =
            check("effects(VOID) fn g(x: i64) -> ??i64 { let y = (10 / x)??; y + 1 }");
        assert!(diags.is_empty(), "{:?}", diags);
        assert_eq!(checked.fn_sigs["g"].ret, Type::voidable(Type::I64));
    }

    #[test]
    fn call_effects_flow_into_caller() {
        let (_, diags) = check(
            "effects(VOID) fn callee(x: i64) -> ??i64 { 1 / x }\n\
             [pure] fn caller(x: i64) -> i64 { callee(x); x }",
        );
        // The pure caller invokes a VOID-effect callee.
        assert!(diags.iter().any(|d| d.kind == DiagKind::Effect));
    }

    #[test]
    fn builtin_prefixes() {
        let (_, diags) = check(
            "effects(PERSIST, VOID) fn store() { atlas_store(8u64, 42u64); }\n\
             [pure] fn bad() { atlas_store(8u64, 42u64); }",
        );
        let effect_errors: Vec<_> = diags
            .iter()
            .filter(|d| d.kind == DiagKind::Effect)
            .collect();
        assert_eq!(effect_errors.len(), 1);
        assert_eq!(
            effect_errors[0].required,
            Some(EffectSet::PERSIST | EffectSet::VOID)
        );
    }

    #[test]
    fn persist_block_raises_persist() {
        let (_, diags) = check("[pure] fn f() -> i64 { persist { 1 } }");
        assert!(diags.iter().any(|d| d.kind == DiagKind::Effect));
        let (_, diags) =
            check("effects(PERSIST, VOID) fn f() -> i64 { persist { 1 } }");
        assert!(diags.is_empty(), "{:?}", diags);
    }

    #[test]
    fn recover_retypes_body() {
        let (checked, diags) = check(
            "effects(VOID) fn f(x: i64) -> i64 { recover { 10 / x } else { 0 } }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
        assert_eq!(checked.fn_sigs["f"].ret, Type::I64);
    }

    #[test]
    fn recover_handler_type_mismatch() {
        let (_, diags) =
            check("effects(VOID) fn f(x: i64) -> i64 { recover { 10 / x } else { true } }");
        assert!(diags.iter().any(|d| d.kind == DiagKind::Type));
    }

    #[test]
    fn undefined_name_reported() {
        let (_, diags) = check("fn f() -> i64 { nope }");
        assert!(diags.iter().any(|d| d.kind == DiagKind::UndefinedName));
    }

    #[test]
    fn indexing_adds_void_effect() {
        let (_, diags) = check("[pure] fn f(xs: [i64]) -> i64 { xs[0] }");
        assert!(diags.iter().any(|d| d.kind == DiagKind::Effect));
    }

    #[test]
    fn struct_field_access() {
        let (_, diags) = check(
            "struct Point { x: scalar, y: scalar }\n\
             fn f(p: Point) -> scalar { p.x }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
    }

    #[test]
    fn enum_match_with_bindings() {
        let (_, diags) = check(
            "enum Shape { Dot, Line(scalar) }\n\
             fn f(s: Shape) -> scalar { match s { Line(len) => len, _ => 0.0 } }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
    }

    #[test]
    fn coalesce_types() {
        let (checked, diags) = check(
            "effects(VOID) fn f(a: ??i64) -> i64 { a ?? 7 }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
        assert_eq!(checked.fn_sigs["f"].ret, Type::I64);
    }

    #[test]
    fn impl_methods_are_qualified() {
        let (checked, diags) = check(
            "struct Counter { n: i64 }\n\
             impl Counter { fn get(self: Counter) -> i64 { self.n } }\n\
             fn f(c: Counter) -> i64 { c.get() }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
        assert!(checked.fn_sigs.contains_key("Counter::get"));
    }

    #[test]
    fn diagnostics_accumulate() {
        let (_, diags) = check(
            "[pure] fn f(a: i64, b: i64) -> ??i64 { a / b }\n\
             fn g() -> i64 { missing }",
        );
        assert!(diags.len() >= 2);
    }
}
