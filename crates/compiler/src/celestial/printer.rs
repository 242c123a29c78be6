//! Textual dump of Celestial IR
//!
//! A canonical, parseable-but-not-reparsed format. One instruction per
//! line: `%<id> = <opcode> <type>, <operand list>`, with string references
//! printed as `@"..."`.

use crate::celestial::ir::{ConstVal, Function, Inst, Module, ValueId, ValueKind};
use std::fmt::Write;

pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; module {}", module.name);
    for (i, s) in module.strings.iter().enumerate() {
        let _ = writeln!(out, "str.{} = @{:?}", i, s);
    }
    for func in &module.functions {
        out.push('\n');
        out.push_str(&print_function(module, func));
    }
    out
}

pub fn print_function(module: &Module, func: &Function) -> String {
    let mut out = String::new();
    let params: Vec<String> = func
        .params
        .iter()
        .map(|&p| format!("%{}: {}", p, func.value(p).ty))
        .collect();
    let _ = writeln!(
        out,
        "fn @{}({}) -> {} effects({}) {{",
        func.name,
        params.join(", "),
        func.ret_type,
        func.declared_effects
    );
    for block in &func.blocks {
        let _ = writeln!(out, "bb{}:", block.id);
        for &inst_id in &block.insts {
            let inst = func.inst(inst_id);
            let _ = writeln!(out, "  {}", print_inst(module, func, inst));
        }
    }
    out.push_str("}\n");
    out
}

fn operand_text(module: &Module, func: &Function, v: ValueId) -> String {
    match &func.value(v).kind {
        ValueKind::Const(c) => match c {
            ConstVal::Int(bits) => format!("{}", *bits as i64),
            ConstVal::Bool(b) => format!("{}", b),
            ConstVal::Scalar(s) => format!("{}", s),
            ConstVal::Galactic(g) => format!("{}", g),
            ConstVal::Void => "void".to_string(),
            ConstVal::Unit => "()".to_string(),
        },
        ValueKind::Str(id) => format!("@{:?}", module.strings[*id as usize]),
        ValueKind::FuncRef(id) => format!("@{}", module.function(*id).name),
        ValueKind::Param(_) | ValueKind::VReg { .. } => format!("%{}", v),
        ValueKind::Global(id) => format!("@g{}", id),
    }
}

pub fn print_inst(module: &Module, func: &Function, inst: &Inst) -> String {
    let mut parts: Vec<String> = Vec::new();
    for &op in &inst.operands {
        parts.push(operand_text(module, func, op));
    }
    if let Some(callee) = inst.callee {
        parts.insert(0, format!("@{}", module.function(callee).name));
    }
    for &t in &inst.targets {
        parts.push(format!("bb{}", t));
    }
    let operand_list = parts.join(", ");

    match inst.result {
        Some(r) => {
            let ty = &func.value(r).ty;
            if operand_list.is_empty() {
                format!("%{} = {} {}", r, inst.op.mnemonic(), ty)
            } else {
                format!("%{} = {} {}, {}", r, inst.op.mnemonic(), ty, operand_list)
            }
        }
        None => {
            if operand_list.is_empty() {
                inst.op.mnemonic().to_string()
            } else {
                format!("{} {}", inst.op.mnemonic(), operand_list)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::celestial::builder::Builder;
    use crate::celestial::ir::{Function, Opcode};
    use crate::types::{EffectSet, Type};

    #[test]
    fn dump_shape() {
        let mut m = Module::new("demo");
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

        let text = print_module(&m);
        assert!(text.contains("fn @f(%0: i64) -> ??i64 effects(VOID) {"));
        assert!(text.contains("bb0:"));
        // The div result has a fresh vreg and the operand list follows the type
        assert!(text.contains("= div i64, 10, %0"));
        assert!(text.contains("ret %"));
    }

    #[test]
    fn string_refs_are_quoted() {
        let mut m = Module::new("demo");
        m.functions.push(Function::new(
            "g",
            vec![],
            Type::Void,
            EffectSet::IO,
        ));
        let mut b = Builder::new(&mut m, 0);
        let s = b.str_const("hi\n");
        b.ret(Some(s));
        let text = print_module(&m);
        assert!(text.contains("@\"hi\\n\""));
    }
}
