//! Celestial IR
//!
//! The compiler's SSA intermediate form: typed values, basic blocks,
//! VOID-aware opcodes. Submodules:
//!
//! - [`ir`]: the module/function/block/instruction/value data model
//! - [`builder`]: insertion helpers that keep SSA and `may_be_void` flags
//!   consistent
//! - [`printer`]: the canonical textual dump
//! - [`verify`]: invariant checks (terminators, types, effect subsets)
//! - [`opt`]: constant folding and dead-code elimination
//! - [`eval`]: the IR evaluator used by tests and embedders

pub mod builder;
pub mod eval;
pub mod ir;
pub mod opt;
pub mod printer;
pub mod verify;

pub use builder::Builder;
pub use ir::{
    Block, BlockId, ConstVal, FuncId, Function, Inst, InstId, Module, Opcode, ValueData, ValueId,
    ValueKind,
};
