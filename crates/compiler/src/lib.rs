//! Seraphim compiler
//!
//! Front to back: lexer -> parser -> type/effect checker -> Celestial IR
//! -> constant folding + DCE -> linear-scan register allocation -> native
//! code for x86-64 or RV64IMAC.
//!
//! The public contract is in-memory: [`compile_source`] takes source bytes
//! and a [`CompilerConfig`] and returns either a [`CompiledModule`] or the
//! accumulated diagnostic list. Every pass keeps going after errors where
//! that is safe, so the caller sees the full error set; code generation is
//! skipped as soon as any diagnostic is an error.

pub mod ast;
pub mod celestial;
pub mod checker;
pub mod config;
pub mod diagnostics;
pub mod emit;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod regalloc;
pub mod types;

pub use celestial::eval::{Machine, NullHost, RtVal, SubstrateHost};
pub use celestial::ir::Module;
pub use checker::{CheckedProgram, Checker, FnSig};
pub use config::{CompilerConfig, OptLevel, TargetArch};
pub use diagnostics::{DiagKind, Diagnostic, SourceLoc, diagnostics_to_json};
pub use lexer::{Lexer, Token, TokenKind};
pub use parser::Parser;
pub use types::{EffectSet, Type};

/// A function symbol in the emitted code.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// The result of a successful compilation.
#[derive(Debug)]
pub struct CompiledModule {
    /// Optimized Celestial IR, for inspection and evaluation.
    pub ir: Module,
    /// Native code for the configured target.
    pub code: Vec<u8>,
    pub symbols: Vec<Symbol>,
    /// Offset of the module entry stub in `code`.
    pub entry_offset: usize,
    pub target: TargetArch,
}

impl CompiledModule {
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// The canonical textual dump of the module's IR.
    pub fn ir_text(&self) -> String {
        celestial::printer::print_module(&self.ir)
    }
}

/// Compile a Seraphim source file.
///
/// Diagnostics from every front-end pass accumulate; any diagnostic at all
/// means no code generation, and the caller gets the complete list.
pub fn compile_source(
    name: &str,
    source: &str,
    config: &CompilerConfig,
) -> Result<CompiledModule, Vec<Diagnostic>> {
    let _span = tracing::debug_span!("compile", module = name).entered();

    let mut parser = Parser::new(source);
    let program = parser.parse();
    let mut diagnostics = parser.diagnostics;

    let (checked, check_diags) = Checker::new().check_program(&program);
    diagnostics.extend(check_diags);

    if !diagnostics.is_empty() {
        tracing::debug!(count = diagnostics.len(), "compilation failed");
        return Err(diagnostics);
    }

    let mut ir = lower::lower_program(name, &program, &checked);

    let verify_diags = celestial::verify::verify_module(&ir);
    if !verify_diags.is_empty() {
        return Err(verify_diags);
    }

    if config.opt == OptLevel::Standard {
        celestial::opt::optimize_module(&mut ir);
    }

    let (code, entries, entry_offset) = match config.target {
        TargetArch::X64 => {
            let out = emit::x64::emit_module(&ir).map_err(backend_error)?;
            let symbols = out
                .entries
                .iter()
                .map(|e| Symbol {
                    name: e.name.clone(),
                    offset: e.offset,
                    size: e.size,
                })
                .collect();
            (out.code, symbols, out.entry_offset)
        }
        TargetArch::Rv64 => {
            let out = emit::rv64::emit_module(&ir).map_err(backend_error)?;
            let symbols = out
                .entries
                .iter()
                .map(|e| Symbol {
                    name: e.name.clone(),
                    offset: e.offset,
                    size: e.size,
                })
                .collect();
            (out.code, symbols, out.entry_offset)
        }
    };

    tracing::debug!(bytes = code.len(), "emitted");
    Ok(CompiledModule {
        ir,
        code,
        symbols: entries,
        entry_offset,
        target: config.target,
    })
}

fn backend_error(message: String) -> Vec<Diagnostic> {
    vec![Diagnostic::new(
        DiagKind::Verify,
        SourceLoc::default(),
        message,
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_to_both_targets() {
        let src = "effects(VOID) fn main() -> ??i64 { 10 / 2 }";
        for target in [TargetArch::X64, TargetArch::Rv64] {
            let config = CompilerConfig {
                target,
                opt: OptLevel::Standard,
            };
            let out = compile_source("demo", src, &config).expect("compiles");
            assert!(!out.code.is_empty());
            assert!(out.symbol("main").is_some());
            assert_eq!(out.target, target);
        }
    }

    #[test]
    fn errors_skip_codegen_and_accumulate() {
        let src = "[pure] fn h(a: i64, b: i64) -> ??i64 { a / b }\nfn g() -> i64 { missing }";
        let err = compile_source("demo", src, &CompilerConfig::default()).unwrap_err();
        assert!(err.len() >= 2);
        assert!(err.iter().any(|d| d.kind == DiagKind::Effect));
        assert!(err.iter().any(|d| d.kind == DiagKind::UndefinedName));
    }

    #[test]
    fn ir_text_is_exposed() {
        let out = compile_source(
            "demo",
            "effects(VOID) fn main() -> ??i64 { 7 / 1 }",
            &CompilerConfig {
                target: TargetArch::X64,
                opt: OptLevel::None,
            },
        )
        .expect("compiles");
        let text = out.ir_text();
        assert!(text.contains("fn @main"));
        assert!(text.contains("div"));
    }

    #[test]
    fn optimization_folds_constants() {
        let none = compile_source(
            "demo",
            "[pure] fn main() -> i64 { 2 + 3 * 4 }",
            &CompilerConfig {
                target: TargetArch::X64,
                opt: OptLevel::None,
            },
        )
        .unwrap();
        let std_opt = compile_source(
            "demo",
            "[pure] fn main() -> i64 { 2 + 3 * 4 }",
            &CompilerConfig {
                target: TargetArch::X64,
                opt: OptLevel::Standard,
            },
        )
        .unwrap();
        assert!(std_opt.code.len() <= none.code.len());
        let text = std_opt.ir_text();
        assert!(!text.contains("= mul"), "folded IR still multiplies:\n{}", text);
    }
}
