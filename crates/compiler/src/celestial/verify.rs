//! Celestial IR verifier
//!
//! Checks the module invariants after lowering and after optimization:
//!
//! - every reachable block ends in exactly one terminator, and no
//!   terminator appears mid-block
//! - every vreg's defining instruction agrees on the result value
//! - the union of instruction effects in a function is a subset of the
//!   function's declared effects
//! - no call targets a function whose declared effects are not a subset of
//!   the caller's declared effects

use crate::celestial::ir::{Function, Module, ValueKind};
use crate::diagnostics::{DiagKind, Diagnostic, SourceLoc};

pub fn verify_module(module: &Module) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    for func in &module.functions {
        verify_function(module, func, &mut diags);
    }
    diags
}

fn verify_function(module: &Module, func: &Function, diags: &mut Vec<Diagnostic>) {
    let err = |diags: &mut Vec<Diagnostic>, msg: String| {
        diags.push(Diagnostic::new(DiagKind::Verify, SourceLoc::default(), msg));
    };

    // Terminator discipline.
    for block in &func.blocks {
        let mut terminators = 0;
        for (idx, &inst_id) in block.insts.iter().enumerate() {
            let inst = func.inst(inst_id);
            if inst.is_terminator() {
                terminators += 1;
                if idx + 1 != block.insts.len() {
                    err(
                        diags,
                        format!(
                            "{}: bb{} has a terminator before the end of the block",
                            func.name, block.id
                        ),
                    );
                }
            }
        }
        if terminators != 1 {
            err(
                diags,
                format!(
                    "{}: bb{} has {} terminators, expected exactly one",
                    func.name, block.id, terminators
                ),
            );
        }
    }

    // SSA result agreement: the defining instruction's result is the value,
    // and types are present.
    for (vid, v) in func.values.iter().enumerate() {
        if let ValueKind::VReg { def } = v.kind {
            let inst = func.inst(def);
            if inst.result != Some(vid as u32) {
                err(
                    diags,
                    format!(
                        "{}: value %{} claims def at instruction {} which defines {:?}",
                        func.name, vid, def, inst.result
                    ),
                );
            }
        }
    }

    // Effect subsetting within the function.
    let inferred = func.inferred_effects();
    if !inferred.is_subset_of(func.declared_effects) {
        err(
            diags,
            format!(
                "{}: instruction effects {} exceed declared {}",
                func.name, inferred, func.declared_effects
            ),
        );
    }

    // Call-site effect subsetting.
    for block in &func.blocks {
        for &inst_id in &block.insts {
            let inst = func.inst(inst_id);
            if let Some(callee) = inst.callee {
                let callee_fn = module.function(callee);
                if !callee_fn
                    .declared_effects
                    .is_subset_of(func.declared_effects)
                {
                    err(
                        diags,
                        format!(
                            "{}: calls {} whose effects {} exceed caller's {}",
                            func.name,
                            callee_fn.name,
                            callee_fn.declared_effects,
                            func.declared_effects
                        ),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::celestial::builder::Builder;
    use crate::celestial::ir::{Function, Module, Opcode};
    use crate::types::{EffectSet, Type};

    #[test]
    fn well_formed_function_passes() {
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "f",
            vec![Type::I64],
            Type::voidable(Type::I64),
            EffectSet::VOID,
        ));
        let mut b = Builder::new(&mut m, 0);
        let x = b.param(0);
        let ten = b.const_int(Type::I64, 10);
        let q = b.binary(Opcode::Div, Type::I64, ten, x);
        b.ret(Some(q));
        assert!(verify_module(&m).is_empty());
    }

    #[test]
    fn missing_terminator_is_flagged() {
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "f",
            vec![],
            Type::Void,
            EffectSet::NONE,
        ));
        // Entry block left empty: no terminator.
        let diags = verify_module(&m);
        assert!(diags.iter().any(|d| d.message.contains("terminators")));
    }

    #[test]
    fn effect_overflow_is_flagged() {
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "pure_fn",
            vec![Type::I64],
            Type::voidable(Type::I64),
            // Declared NONE, but the body divides.
            EffectSet::NONE,
        ));
        let mut b = Builder::new(&mut m, 0);
        let x = b.param(0);
        let one = b.const_int(Type::I64, 1);
        let q = b.binary(Opcode::Div, Type::I64, one, x);
        b.ret(Some(q));
        let diags = verify_module(&m);
        assert!(diags.iter().any(|d| d.message.contains("exceed declared")));
    }

    #[test]
    fn call_effect_subset_enforced() {
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "callee",
            vec![],
            Type::Void,
            EffectSet::PERSIST | EffectSet::VOID,
        ));
        m.functions.push(Function::new(
            "caller",
            vec![],
            Type::Void,
            EffectSet::VOID,
        ));
        {
            let mut b = Builder::new(&mut m, 0);
            b.ret(None);
        }
        {
            let mut b = Builder::new(&mut m, 1);
            // The call records the callee's declared effects at the site.
            b.call(0, vec![], Type::Void, EffectSet::PERSIST | EffectSet::VOID);
            b.ret(None);
        }
        let diags = verify_module(&m);
        assert!(diags.iter().any(|d| d.message.contains("exceed caller's")));
    }
}
