//! Celestial IR data model
//!
//! Strict SSA: every vreg value has exactly one defining instruction.
//! Functions own their blocks, instructions and values in id-indexed
//! vectors; blocks hold instruction id lists in program order, which
//! preserves the in-order iteration contract while keeping mutation
//! (folding, DCE) local.

use crate::diagnostics::SourceLoc;
use crate::types::{EffectSet, Type};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use seraph_core::{Galactic, Scalar};

pub type BlockId = u32;
pub type InstId = u32;
pub type ValueId = u32;
pub type FuncId = u32;
pub type StrId = u32;

/// Opcodes, grouped by family in the numeric space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    // Arithmetic: 0x00
    Add = 0x00,
    Sub = 0x01,
    Mul = 0x02,
    Div = 0x03,
    Mod = 0x04,
    Neg = 0x05,

    // Bitwise: 0x10
    And = 0x10,
    Or = 0x11,
    Xor = 0x12,
    Not = 0x13,
    Shl = 0x14,
    Shr = 0x15,
    Sar = 0x16,

    // Comparison: 0x20
    CmpEq = 0x20,
    CmpNe = 0x21,
    CmpLt = 0x22,
    CmpLe = 0x23,
    CmpGt = 0x24,
    CmpGe = 0x25,
    CmpLtU = 0x26,
    CmpLeU = 0x27,
    CmpGtU = 0x28,
    CmpGeU = 0x29,

    // VOID operations: 0x30
    VoidTest = 0x30,
    VoidProp = 0x31,
    VoidAssert = 0x32,
    VoidCoalesce = 0x33,
    VoidConst = 0x34,

    // Capability operations: 0x40
    CapCreate = 0x40,
    CapNarrow = 0x41,
    CapSplit = 0x42,
    CapRevoke = 0x43,
    CapLoad = 0x44,
    CapStore = 0x45,
    CapCheck = 0x46,

    // Memory: 0x50
    Load = 0x50,
    Store = 0x51,
    Alloca = 0x52,
    MemCpy = 0x53,
    MemSet = 0x54,

    // Substrate: 0x60
    SubstrateEnter = 0x60,
    SubstrateExit = 0x61,
    AtlasBegin = 0x62,
    AtlasCommit = 0x63,
    AtlasRollback = 0x64,
    AtlasLoad = 0x65,
    AtlasStore = 0x66,
    AetherLoad = 0x67,
    AetherStore = 0x68,
    AetherSync = 0x69,

    // Control: 0x70
    Jump = 0x70,
    Branch = 0x71,
    Switch = 0x72,
    Call = 0x73,
    CallIndirect = 0x74,
    Syscall = 0x75,
    TailCall = 0x76,
    Return = 0x77,

    // Galactic: 0x80
    GalAdd = 0x80,
    GalMul = 0x81,
    GalDiv = 0x82,
    GalPredict = 0x83,
    GalExtract = 0x84,
    GalInsert = 0x85,

    // Chronon: 0x90
    ChrononNow = 0x90,
    ChrononDelta = 0x91,
    ChrononBudget = 0x92,
    ChrononYield = 0x93,

    // Type conversion: 0xA0
    Trunc = 0xA0,
    Zext = 0xA1,
    Sext = 0xA2,
    Bitcast = 0xA3,
    ToScalar = 0xA4,
    FromScalar = 0xA5,
    ToGalactic = 0xA6,
    FromGalactic = 0xA7,

    // Struct/array: 0xB0
    ExtractField = 0xB0,
    InsertField = 0xB1,
    ExtractElem = 0xB2,
    InsertElem = 0xB3,
    Gep = 0xB4,

    // Misc: 0xF0
    Nop = 0xF0,
    Phi = 0xF1,
    Select = 0xF2,
    Unreachable = 0xF3,
    Trap = 0xF4,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::Branch
                | Opcode::Switch
                | Opcode::Return
                | Opcode::TailCall
                | Opcode::Unreachable
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Mod => "mod",
            Opcode::Neg => "neg",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Not => "not",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::Sar => "sar",
            Opcode::CmpEq => "cmp.eq",
            Opcode::CmpNe => "cmp.ne",
            Opcode::CmpLt => "cmp.lt",
            Opcode::CmpLe => "cmp.le",
            Opcode::CmpGt => "cmp.gt",
            Opcode::CmpGe => "cmp.ge",
            Opcode::CmpLtU => "cmp.ltu",
            Opcode::CmpLeU => "cmp.leu",
            Opcode::CmpGtU => "cmp.gtu",
            Opcode::CmpGeU => "cmp.geu",
            Opcode::VoidTest => "void.test",
            Opcode::VoidProp => "void.prop",
            Opcode::VoidAssert => "void.assert",
            Opcode::VoidCoalesce => "void.coalesce",
            Opcode::VoidConst => "void.const",
            Opcode::CapCreate => "cap.create",
            Opcode::CapNarrow => "cap.narrow",
            Opcode::CapSplit => "cap.split",
            Opcode::CapRevoke => "cap.revoke",
            Opcode::CapLoad => "cap.load",
            Opcode::CapStore => "cap.store",
            Opcode::CapCheck => "cap.check",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Alloca => "alloca",
            Opcode::MemCpy => "memcpy",
            Opcode::MemSet => "memset",
            Opcode::SubstrateEnter => "substrate.enter",
            Opcode::SubstrateExit => "substrate.exit",
            Opcode::AtlasBegin => "atlas.begin",
            Opcode::AtlasCommit => "atlas.commit",
            Opcode::AtlasRollback => "atlas.rollback",
            Opcode::AtlasLoad => "atlas.load",
            Opcode::AtlasStore => "atlas.store",
            Opcode::AetherLoad => "aether.load",
            Opcode::AetherStore => "aether.store",
            Opcode::AetherSync => "aether.sync",
            Opcode::Jump => "jump",
            Opcode::Branch => "branch",
            Opcode::Switch => "switch",
            Opcode::Call => "call",
            Opcode::CallIndirect => "call.indirect",
            Opcode::Syscall => "syscall",
            Opcode::TailCall => "tail.call",
            Opcode::Return => "ret",
            Opcode::GalAdd => "gal.add",
            Opcode::GalMul => "gal.mul",
            Opcode::GalDiv => "gal.div",
            Opcode::GalPredict => "gal.predict",
            Opcode::GalExtract => "gal.extract",
            Opcode::GalInsert => "gal.insert",
            Opcode::ChrononNow => "chronon.now",
            Opcode::ChrononDelta => "chronon.delta",
            Opcode::ChrononBudget => "chronon.budget",
            Opcode::ChrononYield => "chronon.yield",
            Opcode::Trunc => "trunc",
            Opcode::Zext => "zext",
            Opcode::Sext => "sext",
            Opcode::Bitcast => "bitcast",
            Opcode::ToScalar => "to.scalar",
            Opcode::FromScalar => "from.scalar",
            Opcode::ToGalactic => "to.galactic",
            Opcode::FromGalactic => "from.galactic",
            Opcode::ExtractField => "extractfield",
            Opcode::InsertField => "insertfield",
            Opcode::ExtractElem => "extractelem",
            Opcode::InsertElem => "insertelem",
            Opcode::Gep => "gep",
            Opcode::Nop => "nop",
            Opcode::Phi => "phi",
            Opcode::Select => "select",
            Opcode::Unreachable => "unreachable",
            Opcode::Trap => "trap",
        }
    }
}

/// Constant values, including the per-type VOID constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstVal {
    /// Integer bits; interpretation follows the value's type.
    Int(u64),
    Bool(bool),
    Scalar(Scalar),
    Galactic(Galactic),
    /// The VOID constant of the value's type.
    Void,
    /// Unit.
    Unit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Const(ConstVal),
    /// SSA virtual register: points at its single defining instruction.
    VReg { def: InstId },
    /// Function parameter by index.
    Param(u32),
    /// Module-level global by index.
    Global(u32),
    /// String constant table reference.
    Str(StrId),
    /// Direct function reference.
    FuncRef(FuncId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueData {
    pub ty: Type,
    pub kind: ValueKind,
    /// Conservative flag: true when the value can carry the VOID sentinel.
    /// The builder maintains it as the union of operand flags so DCE can
    /// prove operations VOID-free and drop their runtime checks.
    pub may_be_void: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub op: Opcode,
    pub result: Option<ValueId>,
    pub operands: Vec<ValueId>,
    /// Jump/branch/switch targets, in operand order.
    pub targets: Vec<BlockId>,
    /// Direct call target.
    pub callee: Option<FuncId>,
    pub effects: EffectSet,
    pub loc: SourceLoc,
}

impl Inst {
    pub fn is_terminator(&self) -> bool {
        self.op.is_terminator()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub id: BlockId,
    pub insts: Vec<InstId>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    /// Immediate dominator, when computed.
    pub idom: Option<BlockId>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<ValueId>,
    pub param_types: Vec<Type>,
    pub ret_type: Type,
    pub declared_effects: EffectSet,
    pub entry: BlockId,
    pub blocks: Vec<Block>,
    pub insts: Vec<Inst>,
    pub values: Vec<ValueData>,
}

impl Function {
    pub fn new(name: &str, param_types: Vec<Type>, ret_type: Type, effects: EffectSet) -> Self {
        let mut f = Function {
            name: name.to_string(),
            params: Vec::new(),
            param_types: param_types.clone(),
            ret_type,
            declared_effects: effects,
            entry: 0,
            blocks: vec![Block {
                id: 0,
                ..Block::default()
            }],
            insts: Vec::new(),
            values: Vec::new(),
        };
        for (i, ty) in param_types.into_iter().enumerate() {
            let may_be_void = ty.is_voidable();
            let v = f.add_value(ValueData {
                ty,
                kind: ValueKind::Param(i as u32),
                may_be_void,
            });
            f.params.push(v);
        }
        f
    }

    pub fn add_value(&mut self, data: ValueData) -> ValueId {
        let id = self.values.len() as ValueId;
        self.values.push(data);
        id
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id as usize]
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id as usize]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id as usize]
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = self.blocks.len() as BlockId;
        self.blocks.push(Block {
            id,
            ..Block::default()
        });
        id
    }

    /// The terminator of a block, if it has one.
    pub fn terminator(&self, block: BlockId) -> Option<&Inst> {
        let b = self.block(block);
        let last = *b.insts.last()?;
        let inst = self.inst(last);
        inst.is_terminator().then_some(inst)
    }

    /// Union of the effect bits of every instruction in the function.
    pub fn inferred_effects(&self) -> EffectSet {
        self.blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .fold(EffectSet::NONE, |acc, &i| acc | self.inst(i).effects)
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    pub init: Option<ConstVal>,
}

/// A Celestial module: functions, globals, a string constant table.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    pub strings: Vec<String>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Module {
            name: name.to_string(),
            ..Module::default()
        }
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id as usize]
    }

    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as FuncId)
    }

    /// Intern a string constant, reusing an existing entry.
    pub fn intern_string(&mut self, s: &str) -> StrId {
        if let Some(idx) = self.strings.iter().position(|e| e == s) {
            return idx as StrId;
        }
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as StrId
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trips_through_u16() {
        for op in [
            Opcode::Add,
            Opcode::VoidCoalesce,
            Opcode::CapLoad,
            Opcode::AtlasCommit,
            Opcode::GalPredict,
            Opcode::Trap,
        ] {
            let raw: u16 = op.into();
            assert_eq!(Opcode::try_from(raw).unwrap(), op);
        }
        assert!(Opcode::try_from(0x0Fu16).is_err());
    }

    #[test]
    fn terminators() {
        assert!(Opcode::Return.is_terminator());
        assert!(Opcode::Branch.is_terminator());
        assert!(Opcode::TailCall.is_terminator());
        assert!(!Opcode::Call.is_terminator());
        assert!(!Opcode::VoidProp.is_terminator());
    }

    #[test]
    fn string_interning_dedups() {
        let mut m = Module::new("t");
        let a = m.intern_string("hello");
        let b = m.intern_string("hello");
        let c = m.intern_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(m.strings.len(), 2);
    }

    #[test]
    fn function_params_are_values() {
        let f = Function::new(
            "f",
            vec![Type::I64, Type::voidable(Type::I64)],
            Type::I64,
            EffectSet::NONE,
        );
        assert_eq!(f.params.len(), 2);
        assert!(!f.value(f.params[0]).may_be_void);
        assert!(f.value(f.params[1]).may_be_void);
    }
}
