//! End-to-end pipeline scenarios
//!
//! Each scenario compiles real Seraphim source through the full front end
//! and runs it on the IR evaluator; the emission scenarios check the
//! native artifacts for both targets.

use seraphc::{
    CompilerConfig, DiagKind, EffectSet, Machine, OptLevel, RtVal, TargetArch, compile_source,
    diagnostics_to_json,
};

fn compile(src: &str) -> seraphc::CompiledModule {
    compile_source("scenario", src, &CompilerConfig::default()).expect("clean compile")
}

#[test]
fn divide_by_zero_yields_void() {
    let out = compile("effects(VOID) fn f(x: i64) -> ??i64 { 10 / x }");
    let mut machine = Machine::new(&out.ir);

    let void_result = machine.run("f", &[RtVal::Int(0)]).unwrap();
    assert!(void_result.is_void());
    // The register image carries the VOID bit.
    assert_ne!(void_result.to_reg_bits() & (1 << 63), 0);

    assert_eq!(machine.run("f", &[RtVal::Int(2)]).unwrap(), RtVal::Int(5));
}

#[test]
fn void_prop_short_circuits_the_return() {
    let out = compile(
        "effects(VOID) fn g(x: i64) -> ??i64 { let y = (10 / x)??; y + 1 }",
    );
    let mut machine = Machine::new(&out.ir);
    assert!(machine.run("g", &[RtVal::Int(0)]).unwrap().is_void());
    assert_eq!(machine.run("g", &[RtVal::Int(5)]).unwrap(), RtVal::Int(3));
}

#[test]
fn pure_division_is_an_effect_violation() {
    let err = compile_source(
        "scenario",
        "[pure] fn h(a: i64, b: i64) -> ??i64 { a / b }",
        &CompilerConfig::default(),
    )
    .unwrap_err();
    let effect: Vec<_> = err.iter().filter(|d| d.kind == DiagKind::Effect).collect();
    assert_eq!(effect.len(), 1);
    assert_eq!(effect[0].required, Some(EffectSet::VOID));
    assert_eq!(effect[0].allowed, Some(EffectSet::NONE));
    // The location points at the division, on line 0 past the parameters.
    assert_eq!(effect[0].loc.line, 0);
    assert!(effect[0].loc.col > 30);

    // The diagnostic list exports to JSON for tooling.
    let json = diagnostics_to_json(&err);
    assert!(json.contains("\"effect\""));
    assert!(json.contains("VOID"));
}

#[test]
fn both_backends_emit_callable_symbols() {
    let src = "\
[pure] fn helper(x: i64) -> i64 { x * 2 }\n\
effects(VOID) fn main() -> ??i64 { helper(21) / 1 }\n";
    for target in [TargetArch::X64, TargetArch::Rv64] {
        let out = compile_source(
            "scenario",
            src,
            &CompilerConfig {
                target,
                opt: OptLevel::Standard,
            },
        )
        .expect("clean compile");
        assert!(out.symbol("main").is_some());
        assert!(out.symbol("helper").is_some());
        // The entry stub precedes every function body.
        for sym in &out.symbols {
            assert!(sym.offset >= out.entry_offset);
            assert!(sym.size > 0);
        }
        if target == TargetArch::Rv64 {
            assert_eq!(out.code.len() % 4, 0, "RV64 code must be whole words");
        }
    }
}

#[test]
fn effects_flow_through_the_whole_module() {
    // A pure function calling an effectful one is diagnosed; the module
    // also reports the undefined name so the caller sees the full set.
    let err = compile_source(
        "scenario",
        "effects(PERSIST, VOID) fn store() -> void { atlas_store(8u64, 1u64); }\n\
         [pure] fn p() -> void { store(); }\n\
         fn q() -> i64 { missing }",
        &CompilerConfig::default(),
    )
    .unwrap_err();
    assert!(err.iter().any(|d| d.kind == DiagKind::Effect));
    assert!(err.iter().any(|d| d.kind == DiagKind::UndefinedName));
}

#[test]
fn recover_and_coalesce_handle_void() {
    let out = compile(
        "effects(VOID) fn r(x: i64) -> i64 { recover { 10 / x } else { -7 } }\n\
         effects(VOID) fn c(x: i64) -> i64 { (10 / x) ?? -9 }",
    );
    let mut machine = Machine::new(&out.ir);
    assert_eq!(machine.run("r", &[RtVal::Int(0)]).unwrap(), RtVal::Int(-7));
    assert_eq!(machine.run("r", &[RtVal::Int(5)]).unwrap(), RtVal::Int(2));
    assert_eq!(machine.run("c", &[RtVal::Int(0)]).unwrap(), RtVal::Int(-9));
    assert_eq!(machine.run("c", &[RtVal::Int(2)]).unwrap(), RtVal::Int(5));
}

#[test]
fn ir_dump_has_the_documented_shape() {
    let out = compile_source(
        "scenario",
        "effects(VOID) fn f(x: i64) -> ??i64 { 10 / x }",
        &CompilerConfig {
            target: TargetArch::X64,
            opt: OptLevel::None,
        },
    )
    .unwrap();
    let text = out.ir_text();
    assert!(text.contains("; module scenario"));
    assert!(text.contains("fn @f("));
    assert!(text.contains("effects(VOID)"));
    // `%<id> = <opcode> <type>, <operands>`
    assert!(
        text.lines()
            .any(|l| l.trim_start().starts_with('%') && l.contains(" = div i64, ")),
        "missing canonical div line in:\n{}",
        text
    );
}

#[test]
fn fixed_point_scalars_run_through_the_pipeline() {
    let out = compile(
        "[pure] fn area(w: scalar, h: scalar) -> scalar { w * h }",
    );
    let mut machine = Machine::new(&out.ir);
    let w = seraph_core::Scalar::from_parts(2, 1 << 63); // 2.5
    let h = seraph_core::Scalar::from_int(4);
    let out_v = machine
        .run("area", &[RtVal::Scalar(w), RtVal::Scalar(h)])
        .unwrap();
    assert_eq!(out_v, RtVal::Scalar(seraph_core::Scalar::from_int(10)));
}

#[test]
fn dce_strips_unreachable_work() {
    let unopt = compile_source(
        "scenario",
        "[pure] fn f() -> i64 { let unused = 1 + 2; 40 + 2 }",
        &CompilerConfig {
            target: TargetArch::X64,
            opt: OptLevel::None,
        },
    )
    .unwrap();
    let opt = compile_source(
        "scenario",
        "[pure] fn f() -> i64 { let unused = 1 + 2; 40 + 2 }",
        &CompilerConfig {
            target: TargetArch::X64,
            opt: OptLevel::Standard,
        },
    )
    .unwrap();
    assert!(!opt.ir_text().contains("= add"), "folded:\n{}", opt.ir_text());
    assert!(opt.code.len() <= unopt.code.len());
}
