//! Native code emission
//!
//! Two backends share one skeleton: a growable [`buffer::Buffer`] with
//! labels and fixups, a per-function lowering driven by the linear-scan
//! allocation, and a module pass that patches every direct-call site after
//! all functions are emitted.
//!
//! Runtime contract encoded here (and nowhere else):
//! - x86-64: `r13` holds the substrate context (a table of runtime entry
//!   points), `r14` the capability context, `r15` stays reserved.
//! - RV64: `s10` and `s11` respectively.
//! - VOID in a 64-bit register is bit 63; the canonical all-ones pattern
//!   is what VOID constants materialize.

pub mod buffer;
pub mod rv64;
pub mod x64;

pub use buffer::{Buffer, FixupKind, Label};

/// Offsets into the substrate-context runtime table, shared by both
/// backends. Each slot holds a host function pointer.
#[repr(usize)]
#[derive(Debug, Clone, Copy)]
pub enum RuntimeSlot {
    AtlasBegin = 0,
    AtlasCommit = 1,
    AtlasRollback = 2,
    AtlasLoad = 3,
    AtlasStore = 4,
    AetherLoad = 5,
    AetherStore = 6,
    AetherSync = 7,
    ChrononNow = 8,
    ChrononDelta = 9,
    ChrononBudget = 10,
    ChrononYield = 11,
    GalacticMul = 12,
    GalacticDiv = 13,
    GalacticPredict = 14,
}

impl RuntimeSlot {
    pub fn byte_offset(self) -> i32 {
        (self as usize * 8) as i32
    }
}
