//! Celestial IR evaluator
//!
//! An interpreter over the IR with the same VOID semantics the emitters
//! lower: arithmetic propagates VOID, division by zero produces VOID,
//! capability misses read VOID and drop stores, `void.prop` early-returns
//! the function's VOID constant, `void.assert` traps.
//!
//! Substrate operations go through the [`SubstrateHost`] trait so the
//! runtime (or a test double) can stand behind `atlas.*`/`aether.*`
//! opcodes without the compiler depending on the runtime crate.

use crate::celestial::ir::{ConstVal, FuncId, Function, Inst, Module, Opcode, ValueId, ValueKind};
use crate::types::Type;
use seraph_core::{Arena, Capability, Galactic, Perm, Scalar, VOID_U64, Vbit};

/// Host hooks for substrate and chronon opcodes. Every default renders the
/// operation a VOID miss, which is exactly what running without a runtime
/// means.
pub trait SubstrateHost {
    fn atlas_begin(&mut self) -> Option<i64> {
        None
    }
    fn atlas_commit(&mut self, _tx: i64) -> bool {
        false
    }
    fn atlas_rollback(&mut self, _tx: i64) {}
    fn atlas_load(&mut self, _addr: u64) -> Option<u64> {
        None
    }
    fn atlas_store(&mut self, _addr: u64, _v: u64) -> bool {
        false
    }
    fn aether_load(&mut self, _addr: u64) -> Option<u64> {
        None
    }
    fn aether_store(&mut self, _addr: u64, _v: u64) -> bool {
        false
    }
    fn aether_sync(&mut self) {}
    fn chronon_now(&mut self) -> i64 {
        0
    }
    fn chronon_delta(&mut self, _since: i64) -> i64 {
        0
    }
    fn chronon_budget(&mut self) -> i64 {
        0
    }
    fn chronon_yield(&mut self) {}
    fn syscall(&mut self, _number: i64, _args: &[i64]) -> i64 {
        -1
    }
}

/// The do-nothing host.
pub struct NullHost;

impl SubstrateHost for NullHost {}

/// Runtime value inside the evaluator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RtVal {
    Unit,
    Int(i64),
    Bool(Vbit),
    Scalar(Scalar),
    Galactic(Galactic),
    Cap(Capability),
    Str(u32),
    Func(FuncId),
    /// The VOID value, whatever the static type.
    Void,
}

impl RtVal {
    pub fn is_void(&self) -> bool {
        matches!(self, RtVal::Void) || matches!(self, RtVal::Bool(Vbit::Void))
    }

    /// The 64-bit register bit pattern codegen would produce: VOID carries
    /// the all-ones sentinel (bit 63 set).
    pub fn to_reg_bits(&self) -> u64 {
        match self {
            RtVal::Void => VOID_U64,
            RtVal::Int(v) => *v as u64,
            RtVal::Bool(v) => v.to_byte() as u64,
            RtVal::Unit => 0,
            RtVal::Scalar(s) => (s.to_bits() >> 64) as u64,
            RtVal::Galactic(g) => (g.w.to_bits() >> 64) as u64,
            RtVal::Cap(c) => c.base,
            RtVal::Str(id) => *id as u64,
            RtVal::Func(id) => *id as u64,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            RtVal::Int(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    /// `void.assert` on VOID, `trap`, or `unreachable` reached.
    Trap(&'static str),
    /// Call stack or step limit exceeded.
    Limit(&'static str),
    /// Malformed module (missing function, bad operand shape).
    BadModule(String),
}

const MAX_CALL_DEPTH: usize = 64;
const MAX_STEPS: u64 = 1_000_000;

/// The evaluator. Owns a scratch arena for `alloca` and capability
/// scenarios; tests reach it through [`Machine::arena_mut`] to derive and
/// revoke capabilities around calls.
pub struct Machine<'m> {
    module: &'m Module,
    host: Box<dyn SubstrateHost + 'm>,
    arena: Arena,
    steps: u64,
}

impl<'m> Machine<'m> {
    pub fn new(module: &'m Module) -> Self {
        Machine::with_host(module, Box::new(NullHost))
    }

    pub fn with_host(module: &'m Module, host: Box<dyn SubstrateHost + 'm>) -> Self {
        Machine {
            module,
            host,
            arena: Arena::new(64 * 1024),
            steps: 0,
        }
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Run a function by name.
    pub fn run(&mut self, name: &str, args: &[RtVal]) -> Result<RtVal, EvalError> {
        let func = self
            .module
            .find_function(name)
            .ok_or_else(|| EvalError::BadModule(format!("no function '{}'", name)))?;
        self.call(func, args, 0)
    }

    fn call(&mut self, func_id: FuncId, args: &[RtVal], depth: usize) -> Result<RtVal, EvalError> {
        if depth > MAX_CALL_DEPTH {
            return Err(EvalError::Limit("call depth exceeded"));
        }
        let func = self.module.function(func_id);
        let mut env: Vec<Option<RtVal>> = vec![None; func.values.len()];
        for (i, &p) in func.params.iter().enumerate() {
            env[p as usize] = Some(args.get(i).copied().unwrap_or(RtVal::Void));
        }

        let mut block = func.entry;
        let mut prev_block: Option<u32> = None;
        loop {
            let mut next: Option<u32> = None;
            for &inst_id in &func.block(block).insts {
                self.steps += 1;
                if self.steps > MAX_STEPS {
                    return Err(EvalError::Limit("step limit exceeded"));
                }
                let inst = func.inst(inst_id);
                match self.step(func, inst, &mut env, prev_block, depth)? {
                    Step::Next => {}
                    Step::Goto(bb) => {
                        next = Some(bb);
                        break;
                    }
                    Step::Return(v) => return Ok(v),
                }
            }
            match next {
                Some(bb) => {
                    prev_block = Some(block);
                    block = bb;
                }
                None => {
                    return Err(EvalError::BadModule(format!(
                        "bb{} in {} fell through without a terminator",
                        block, func.name
                    )));
                }
            }
        }
    }

    fn set(&self, env: &mut [Option<RtVal>], v: Option<ValueId>, rv: RtVal) {
        if let Some(id) = v {
            env[id as usize] = Some(rv);
        }
    }

    /// Write a runtime value at an arena offset. Wide values (scalars,
    /// galactics, capabilities) lay out their limbs little-endian; VOID
    /// stores the all-ones sentinel.
    fn store_typed(&mut self, off: u64, v: RtVal) {
        match v {
            RtVal::Int(x) => {
                self.arena.write_u64(off, x as u64);
            }
            RtVal::Bool(b) => {
                self.arena.write_u64(off, b.to_byte() as u64);
            }
            RtVal::Void => {
                self.arena.write_u64(off, VOID_U64);
            }
            RtVal::Unit => {
                self.arena.write_u64(off, 0);
            }
            RtVal::Scalar(s) => {
                let bits = s.to_bits();
                self.arena.write_u64(off, bits as u64);
                self.arena.write_u64(off + 8, (bits >> 64) as u64);
            }
            RtVal::Galactic(g) => {
                for (i, c) in [g.w, g.x, g.y, g.z].into_iter().enumerate() {
                    let bits = c.to_bits();
                    self.arena.write_u64(off + 16 * i as u64, bits as u64);
                    self.arena.write_u64(off + 16 * i as u64 + 8, (bits >> 64) as u64);
                }
            }
            RtVal::Cap(c) => {
                self.arena.write_u64(off, c.base);
                self.arena.write_u64(off + 8, c.length);
                self.arena.write_u64(off + 16, c.generation);
                self.arena.write_u64(off + 24, c.permissions.bits() as u64);
            }
            RtVal::Str(id) => {
                self.arena.write_u64(off, id as u64);
            }
            RtVal::Func(id) => {
                self.arena.write_u64(off, id as u64);
            }
        }
    }

    /// Read a runtime value back, decoded by the load's result type. The
    /// all-ones word reads as VOID for the sentinel-carrying shapes.
    fn load_typed(&self, off: u64, ty: Option<&Type>) -> RtVal {
        let word = match self.arena.read_u64(off) {
            Some(w) => w,
            None => return RtVal::Void,
        };
        match ty.map(|t| t.strip_voidable()) {
            Some(Type::Bool) => RtVal::Bool(Vbit::from_byte(word as u8)),
            Some(Type::Scalar | Type::Dual) => {
                let hi = self.arena.read_u64(off + 8).unwrap_or(VOID_U64);
                RtVal::Scalar(Scalar::from_bits(word as u128 | (hi as u128) << 64))
            }
            Some(Type::Galactic) => {
                let mut limbs = [0u128; 4];
                for (i, limb) in limbs.iter_mut().enumerate() {
                    let lo = self.arena.read_u64(off + 16 * i as u64).unwrap_or(VOID_U64);
                    let hi = self
                        .arena
                        .read_u64(off + 16 * i as u64 + 8)
                        .unwrap_or(VOID_U64);
                    *limb = lo as u128 | (hi as u128) << 64;
                }
                RtVal::Galactic(Galactic::new(
                    Scalar::from_bits(limbs[0]),
                    Scalar::from_bits(limbs[1]),
                    Scalar::from_bits(limbs[2]),
                    Scalar::from_bits(limbs[3]),
                ))
            }
            Some(Type::Capability) => RtVal::Cap(Capability {
                base: word,
                length: self.arena.read_u64(off + 8).unwrap_or(0),
                generation: self.arena.read_u64(off + 16).unwrap_or(VOID_U64),
                permissions: Perm::from_bits_truncate(
                    self.arena.read_u64(off + 24).unwrap_or(0) as u32,
                ),
            }),
            Some(Type::Str) => RtVal::Str(word as u32),
            Some(Type::Function { .. }) => RtVal::Func(word as u32),
            _ => {
                if word == VOID_U64 {
                    RtVal::Void
                } else {
                    RtVal::Int(word as i64)
                }
            }
        }
    }
}

/// Resolve a value id against the environment, falling back to constants.
fn read_value(func: &Function, env: &[Option<RtVal>], v: ValueId) -> RtVal {
    if let Some(Some(rv)) = env.get(v as usize) {
        return *rv;
    }
    match &func.value(v).kind {
        ValueKind::Const(c) => match c {
            ConstVal::Int(bits) => RtVal::Int(*bits as i64),
            ConstVal::Bool(b) => RtVal::Bool(Vbit::from_bool(*b)),
            ConstVal::Scalar(s) => RtVal::Scalar(*s),
            ConstVal::Galactic(g) => RtVal::Galactic(*g),
            ConstVal::Void => RtVal::Void,
            ConstVal::Unit => RtVal::Unit,
        },
        ValueKind::Str(id) => RtVal::Str(*id),
        ValueKind::FuncRef(id) => RtVal::Func(*id),
        _ => RtVal::Void,
    }
}

impl<'m> Machine<'m> {
    fn step(
        &mut self,
        func: &Function,
        inst: &Inst,
        env: &mut Vec<Option<RtVal>>,
        prev_block: Option<u32>,
        depth: usize,
    ) -> Result<Step, EvalError> {
        macro_rules! getop {
            ($i:expr) => {
                read_value(func, env, inst.operands[$i])
            };
        }

        match inst.op {
            Opcode::Nop => Ok(Step::Next),

            // Arithmetic and bitwise.
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Sar => {
                let a = getop!(0);
                let b = getop!(1);
                let ty = inst.result.map(|r| func.value(r).ty.clone());
                let out = binary_value(inst.op, a, b, ty.as_ref());
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::Neg => {
                let out = match getop!(0) {
                    RtVal::Int(v) => RtVal::Int(v.wrapping_neg()),
                    RtVal::Scalar(s) => RtVal::Scalar(s.neg()),
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::Not => {
                let out = match getop!(0) {
                    RtVal::Int(v) => RtVal::Int(!v),
                    RtVal::Bool(b) => RtVal::Bool(b.not()),
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }

            // Comparisons: VOID operands produce the VOID Vbit.
            Opcode::CmpEq
            | Opcode::CmpNe
            | Opcode::CmpLt
            | Opcode::CmpLe
            | Opcode::CmpGt
            | Opcode::CmpGe
            | Opcode::CmpLtU
            | Opcode::CmpLeU
            | Opcode::CmpGtU
            | Opcode::CmpGeU => {
                let out = compare_value(inst.op, getop!(0), getop!(1));
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }

            // VOID operations.
            Opcode::VoidTest => {
                let out = RtVal::Bool(Vbit::from_bool(getop!(0).is_void()));
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::VoidProp => {
                let v = getop!(0);
                if v.is_void() {
                    // Short-circuit: the function returns its VOID constant.
                    return Ok(Step::Return(RtVal::Void));
                }
                self.set(env, inst.result, v);
                Ok(Step::Next)
            }
            Opcode::VoidAssert => {
                let v = getop!(0);
                if v.is_void() {
                    return Err(EvalError::Trap("void.assert on VOID"));
                }
                self.set(env, inst.result, v);
                Ok(Step::Next)
            }
            Opcode::VoidCoalesce => {
                let v = getop!(0);
                let out = if v.is_void() { getop!(1) } else { v };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::VoidConst => {
                self.set(env, inst.result, RtVal::Void);
                Ok(Step::Next)
            }

            // Capability operations against the machine arena.
            Opcode::CapCreate => {
                let base = getop!(0).as_int().unwrap_or(0) as u64;
                let len = getop!(1).as_int().unwrap_or(0) as u64;
                let perms = getop!(2).as_int().unwrap_or(0) as u32;
                let out = match self
                    .arena
                    .derive(base, len, Perm::from_bits_truncate(perms))
                {
                    Some(cap) => RtVal::Cap(cap),
                    None => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::CapNarrow => {
                let out = match (getop!(0), getop!(1), getop!(2)) {
                    (RtVal::Cap(cap), RtVal::Int(off), RtVal::Int(len)) => cap
                        .narrow(off as u64, len as u64, Perm::all())
                        .map(RtVal::Cap)
                        .unwrap_or(RtVal::Void),
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::CapSplit => {
                // Splits to the low half; the original becomes VOID in the
                // environment slot it came from.
                let out = match (getop!(0), getop!(1)) {
                    (RtVal::Cap(mut cap), RtVal::Int(at)) => {
                        match cap.split(at as u64) {
                            Some((low, _high)) => {
                                env[inst.operands[0] as usize] = Some(RtVal::Void);
                                RtVal::Cap(low)
                            }
                            None => RtVal::Void,
                        }
                    }
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::CapRevoke => {
                // Revocation is arena-wide: the generation advances.
                self.arena.reset();
                Ok(Step::Next)
            }
            Opcode::CapLoad => {
                let out = match (getop!(0), getop!(1)) {
                    (RtVal::Cap(cap), RtVal::Int(off)) => {
                        let loaded = cap.load_u64(&self.arena, off as u64);
                        if loaded == VOID_U64 {
                            RtVal::Void
                        } else {
                            RtVal::Int(loaded as i64)
                        }
                    }
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::CapStore => {
                if let (RtVal::Cap(cap), RtVal::Int(off), RtVal::Int(v)) =
                    (getop!(0), getop!(1), getop!(2))
                {
                    // A failed check is a silent drop.
                    let _ = cap.store_u64(&mut self.arena, off as u64, v as u64);
                }
                Ok(Step::Next)
            }
            Opcode::CapCheck => {
                let out = match (getop!(0), getop!(1), getop!(2)) {
                    (RtVal::Cap(cap), RtVal::Int(off), RtVal::Int(len)) => RtVal::Bool(
                        Vbit::from_bool(
                            cap.check(&self.arena, off as u64, len as u64, Perm::READ)
                                .is_ok(),
                        ),
                    ),
                    _ => RtVal::Bool(Vbit::Void),
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }

            // Plain memory against the scratch arena, addressed by offset.
            Opcode::Alloca => {
                let size = getop!(0).as_int().unwrap_or(8) as u64;
                let out = match self.arena.alloc(size) {
                    Some(off) => RtVal::Int(off as i64),
                    None => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::Load => {
                let ty = inst.result.map(|r| func.value(r).ty.clone());
                let out = match getop!(0) {
                    RtVal::Int(off) => self.load_typed(off as u64, ty.as_ref()),
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::Store => {
                if let RtVal::Int(off) = getop!(0) {
                    let v = getop!(1);
                    self.store_typed(off as u64, v);
                }
                Ok(Step::Next)
            }
            Opcode::MemCpy => {
                if let (RtVal::Int(dst), RtVal::Int(src), RtVal::Int(len)) =
                    (getop!(0), getop!(1), getop!(2))
                {
                    if let Some(bytes) = self
                        .arena
                        .read_bytes(src as u64, len as u64)
                        .map(|b| b.to_vec())
                    {
                        self.arena.write_bytes(dst as u64, &bytes);
                    }
                }
                Ok(Step::Next)
            }
            Opcode::MemSet => {
                if let (RtVal::Int(dst), RtVal::Int(byte), RtVal::Int(len)) =
                    (getop!(0), getop!(1), getop!(2))
                {
                    let fill = vec![byte as u8; len as usize];
                    self.arena.write_bytes(dst as u64, &fill);
                }
                Ok(Step::Next)
            }

            // Substrate: dispatched to the host.
            Opcode::SubstrateEnter | Opcode::SubstrateExit => Ok(Step::Next),
            Opcode::AtlasBegin => {
                let out = match self.host.atlas_begin() {
                    Some(tx) => RtVal::Int(tx),
                    None => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::AtlasCommit => {
                if let RtVal::Int(tx) = getop!(0) {
                    self.host.atlas_commit(tx);
                }
                Ok(Step::Next)
            }
            Opcode::AtlasRollback => {
                if let RtVal::Int(tx) = getop!(0) {
                    self.host.atlas_rollback(tx);
                }
                Ok(Step::Next)
            }
            Opcode::AtlasLoad => {
                let out = match getop!(0) {
                    RtVal::Int(addr) => match self.host.atlas_load(addr as u64) {
                        Some(v) => RtVal::Int(v as i64),
                        None => RtVal::Void,
                    },
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::AtlasStore => {
                if let (RtVal::Int(addr), RtVal::Int(v)) = (getop!(0), getop!(1)) {
                    self.host.atlas_store(addr as u64, v as u64);
                }
                Ok(Step::Next)
            }
            Opcode::AetherLoad => {
                let out = match getop!(0) {
                    RtVal::Int(addr) => match self.host.aether_load(addr as u64) {
                        Some(v) => RtVal::Int(v as i64),
                        None => RtVal::Void,
                    },
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::AetherStore => {
                if let (RtVal::Int(addr), RtVal::Int(v)) = (getop!(0), getop!(1)) {
                    self.host.aether_store(addr as u64, v as u64);
                }
                Ok(Step::Next)
            }
            Opcode::AetherSync => {
                self.host.aether_sync();
                Ok(Step::Next)
            }

            // Control flow.
            Opcode::Jump => Ok(Step::Goto(inst.targets[0])),
            Opcode::Branch => {
                let cond = getop!(0);
                let taken = match cond {
                    RtVal::Bool(Vbit::True) => inst.targets[0],
                    // FALSE and VOID both take the else path.
                    _ => inst.targets[1],
                };
                Ok(Step::Goto(taken))
            }
            Opcode::Switch => {
                let v = getop!(0);
                let default = *inst.targets.last().expect("switch default");
                let mut taken = default;
                for (i, &case_v) in inst.operands[1..].iter().enumerate() {
                    if read_value(func, env, case_v) == v {
                        taken = inst.targets[i];
                        break;
                    }
                }
                Ok(Step::Goto(taken))
            }
            Opcode::Call => {
                let callee = inst
                    .callee
                    .ok_or_else(|| EvalError::BadModule("call without callee".into()))?;
                let args: Vec<RtVal> = inst
                    .operands
                    .iter()
                    .map(|&v| read_value(func, env, v))
                    .collect();
                let out = self.call(callee, &args, depth + 1)?;
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::CallIndirect => {
                let target = getop!(0);
                let RtVal::Func(callee) = target else {
                    self.set(env, inst.result, RtVal::Void);
                    return Ok(Step::Next);
                };
                let args: Vec<RtVal> = inst.operands[1..]
                    .iter()
                    .map(|&v| read_value(func, env, v))
                    .collect();
                let out = self.call(callee, &args, depth + 1)?;
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::TailCall => {
                let callee = inst
                    .callee
                    .ok_or_else(|| EvalError::BadModule("tail call without callee".into()))?;
                let args: Vec<RtVal> = inst
                    .operands
                    .iter()
                    .map(|&v| read_value(func, env, v))
                    .collect();
                let out = self.call(callee, &args, depth + 1)?;
                Ok(Step::Return(out))
            }
            Opcode::Syscall => {
                let number = getop!(0).as_int().unwrap_or(-1);
                let args: Vec<i64> = inst.operands[1..]
                    .iter()
                    .map(|&v| read_value(func, env, v).as_int().unwrap_or(0))
                    .collect();
                let out = RtVal::Int(self.host.syscall(number, &args));
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::Return => {
                let out = match inst.operands.first() {
                    Some(&v) => read_value(func, env, v),
                    None => RtVal::Unit,
                };
                Ok(Step::Return(out))
            }

            // Galactic.
            Opcode::GalAdd | Opcode::GalMul | Opcode::GalDiv => {
                let out = match (getop!(0), getop!(1)) {
                    (RtVal::Galactic(a), RtVal::Galactic(b)) => {
                        let r = match inst.op {
                            Opcode::GalAdd => a.add(b),
                            Opcode::GalMul => a.mul(b),
                            _ => a.div(b),
                        };
                        if r.is_void() {
                            RtVal::Void
                        } else {
                            RtVal::Galactic(r)
                        }
                    }
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::GalPredict => {
                let out = match (getop!(0), getop!(1)) {
                    (RtVal::Galactic(g), RtVal::Scalar(dt)) => RtVal::Scalar(g.predict(dt)),
                    (RtVal::Galactic(g), RtVal::Int(dt)) => {
                        RtVal::Scalar(g.predict(Scalar::from_int(dt)))
                    }
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::GalExtract => {
                let out = match (getop!(0), getop!(1)) {
                    (RtVal::Galactic(g), RtVal::Int(idx)) => {
                        let c = g.component(idx as usize);
                        if c.is_void() {
                            RtVal::Void
                        } else {
                            RtVal::Scalar(c)
                        }
                    }
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::GalInsert => {
                let out = match (getop!(0), getop!(1), getop!(2)) {
                    (RtVal::Galactic(g), RtVal::Int(idx), RtVal::Scalar(v)) => {
                        RtVal::Galactic(g.with_component(idx as usize, v))
                    }
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }

            // Chronon.
            Opcode::ChrononNow => {
                let out = RtVal::Int(self.host.chronon_now());
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::ChrononDelta => {
                let since = getop!(0).as_int().unwrap_or(0);
                let out = RtVal::Int(self.host.chronon_delta(since));
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::ChrononBudget => {
                let out = RtVal::Int(self.host.chronon_budget());
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::ChrononYield => {
                self.host.chronon_yield();
                Ok(Step::Next)
            }

            // Conversions.
            Opcode::Trunc | Opcode::Zext | Opcode::Sext | Opcode::Bitcast => {
                let v = getop!(0);
                let out = match (v, inst.result.map(|r| func.value(r).ty.clone())) {
                    (RtVal::Void, _) => RtVal::Void,
                    (RtVal::Int(x), Some(ty)) => RtVal::Int(convert_int(inst.op, x, &ty)),
                    (other, _) => other,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::ToScalar => {
                let out = match getop!(0) {
                    RtVal::Int(v) => RtVal::Scalar(Scalar::from_int(v)),
                    RtVal::Scalar(s) => RtVal::Scalar(s),
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::FromScalar => {
                let out = match getop!(0) {
                    RtVal::Scalar(s) if !s.is_void() => RtVal::Int(s.trunc()),
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::ToGalactic => {
                let out = match getop!(0) {
                    RtVal::Scalar(s) => RtVal::Galactic(Galactic::constant(s)),
                    RtVal::Int(v) => RtVal::Galactic(Galactic::constant(Scalar::from_int(v))),
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::FromGalactic => {
                let out = match getop!(0) {
                    RtVal::Galactic(g) if !g.w.is_void() => RtVal::Scalar(g.w),
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }

            // Aggregates: evaluated on Galactic as the representative
            // fixed-shape aggregate; struct layouts go through memory.
            Opcode::ExtractField | Opcode::ExtractElem => {
                let out = match (getop!(0), getop!(1)) {
                    (RtVal::Galactic(g), RtVal::Int(idx)) => {
                        let c = g.component(idx as usize);
                        if c.is_void() {
                            RtVal::Void
                        } else {
                            RtVal::Scalar(c)
                        }
                    }
                    (RtVal::Void, _) => RtVal::Void,
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::InsertField | Opcode::InsertElem => {
                let out = match (getop!(0), getop!(1), getop!(2)) {
                    (RtVal::Galactic(g), RtVal::Int(idx), RtVal::Scalar(v)) => {
                        RtVal::Galactic(g.with_component(idx as usize, v))
                    }
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::Gep => {
                let out = match (getop!(0), getop!(1)) {
                    (RtVal::Int(base), RtVal::Int(off)) => RtVal::Int(base.wrapping_add(off)),
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }

            // Misc.
            Opcode::Phi => {
                let prev = prev_block
                    .ok_or_else(|| EvalError::BadModule("phi in entry block".into()))?;
                let idx = inst
                    .targets
                    .iter()
                    .position(|&b| b == prev)
                    .ok_or_else(|| EvalError::BadModule("phi missing predecessor".into()))?;
                let out = read_value(func, env, inst.operands[idx]);
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::Select => {
                let out = match getop!(0) {
                    RtVal::Bool(Vbit::True) => getop!(1),
                    RtVal::Bool(Vbit::False) => getop!(2),
                    _ => RtVal::Void,
                };
                self.set(env, inst.result, out);
                Ok(Step::Next)
            }
            Opcode::Unreachable => Err(EvalError::Trap("unreachable reached")),
            Opcode::Trap => Err(EvalError::Trap("trap")),
        }
    }
}

enum Step {
    Next,
    Goto(u32),
    Return(RtVal),
}

fn binary_value(op: Opcode, a: RtVal, b: RtVal, ty: Option<&Type>) -> RtVal {
    if a.is_void() || b.is_void() {
        return RtVal::Void;
    }
    match (a, b) {
        (RtVal::Int(x), RtVal::Int(y)) => {
            let out = match op {
                Opcode::Add => x.wrapping_add(y),
                Opcode::Sub => x.wrapping_sub(y),
                Opcode::Mul => x.wrapping_mul(y),
                Opcode::Div => {
                    if y == 0 {
                        return RtVal::Void;
                    }
                    x.wrapping_div(y)
                }
                Opcode::Mod => {
                    if y == 0 {
                        return RtVal::Void;
                    }
                    x.wrapping_rem(y)
                }
                Opcode::And => x & y,
                Opcode::Or => x | y,
                Opcode::Xor => x ^ y,
                Opcode::Shl => x.wrapping_shl(y as u32),
                Opcode::Shr => ((x as u64).wrapping_shr(y as u32)) as i64,
                Opcode::Sar => x.wrapping_shr(y as u32),
                _ => return RtVal::Void,
            };
            let masked = match ty.map(|t| t.strip_voidable().clone()) {
                Some(Type::Int { width, signed: _ }) if width.bits() < 64 => {
                    out & ((1i64 << width.bits()) - 1)
                }
                _ => out,
            };
            RtVal::Int(masked)
        }
        (RtVal::Scalar(x), RtVal::Scalar(y)) => {
            let r = match op {
                Opcode::Add => x.add(y),
                Opcode::Sub => x.sub(y),
                Opcode::Mul => x.mul(y),
                Opcode::Div => x.div(y),
                Opcode::Mod => x.rem(y),
                _ => return RtVal::Void,
            };
            if r.is_void() {
                RtVal::Void
            } else {
                RtVal::Scalar(r)
            }
        }
        (RtVal::Bool(x), RtVal::Bool(y)) => match op {
            Opcode::And => RtVal::Bool(x.and(y)),
            Opcode::Or => RtVal::Bool(x.or(y)),
            Opcode::Xor => match (x.to_bool(), y.to_bool()) {
                (Some(a), Some(b)) => RtVal::Bool(Vbit::from_bool(a != b)),
                _ => RtVal::Bool(Vbit::Void),
            },
            _ => RtVal::Void,
        },
        (RtVal::Galactic(x), RtVal::Galactic(y)) => {
            let r = match op {
                Opcode::Add => x.add(y),
                Opcode::Sub => x.sub(y),
                Opcode::Mul => x.mul(y),
                Opcode::Div => x.div(y),
                _ => return RtVal::Void,
            };
            if r.is_void() {
                RtVal::Void
            } else {
                RtVal::Galactic(r)
            }
        }
        _ => RtVal::Void,
    }
}

fn compare_value(op: Opcode, a: RtVal, b: RtVal) -> RtVal {
    if a.is_void() || b.is_void() {
        return RtVal::Bool(Vbit::Void);
    }
    let verdict = match (a, b) {
        (RtVal::Int(x), RtVal::Int(y)) => match op {
            Opcode::CmpEq => x == y,
            Opcode::CmpNe => x != y,
            Opcode::CmpLt => x < y,
            Opcode::CmpLe => x <= y,
            Opcode::CmpGt => x > y,
            Opcode::CmpGe => x >= y,
            Opcode::CmpLtU => (x as u64) < y as u64,
            Opcode::CmpLeU => (x as u64) <= y as u64,
            Opcode::CmpGtU => (x as u64) > y as u64,
            Opcode::CmpGeU => (x as u64) >= y as u64,
            _ => false,
        },
        (RtVal::Scalar(x), RtVal::Scalar(y)) => {
            let lt = x.lt(y);
            let eq = x.eq_v(y);
            match (op, lt.to_bool(), eq.to_bool()) {
                (Opcode::CmpEq, _, Some(e)) => e,
                (Opcode::CmpNe, _, Some(e)) => !e,
                (Opcode::CmpLt, Some(l), _) => l,
                (Opcode::CmpLe, Some(l), Some(e)) => l || e,
                (Opcode::CmpGt, Some(l), Some(e)) => !l && !e,
                (Opcode::CmpGe, Some(l), _) => !l,
                _ => return RtVal::Bool(Vbit::Void),
            }
        }
        (RtVal::Bool(x), RtVal::Bool(y)) => match op {
            Opcode::CmpEq => x == y,
            Opcode::CmpNe => x != y,
            _ => false,
        },
        _ => return RtVal::Bool(Vbit::Void),
    };
    RtVal::Bool(Vbit::from_bool(verdict))
}

fn convert_int(op: Opcode, v: i64, ty: &Type) -> i64 {
    let bits = match ty.strip_voidable() {
        Type::Int { width, .. } => width.bits(),
        _ => 64,
    };
    if bits >= 64 {
        return v;
    }
    let mask = (1i64 << bits) - 1;
    match op {
        Opcode::Sext => {
            let shifted = 64 - bits;
            (v << shifted) >> shifted
        }
        _ => v & mask,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::celestial::builder::Builder;
    use crate::celestial::ir::Function;
    use crate::types::EffectSet;

    fn div_module() -> Module {
        // fn f(x: i64) -> ??i64 { 10 / x }
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
        m
    }

    #[test]
    fn divide_by_zero_returns_void() {
        let m = div_module();
        let mut machine = Machine::new(&m);
        let out = machine.run("f", &[RtVal::Int(0)]).unwrap();
        assert!(out.is_void());
        // Codegen parity: the register bits carry the VOID flag.
        assert_ne!(out.to_reg_bits() & (1 << 63), 0);
    }

    #[test]
    fn divide_normal_path() {
        let m = div_module();
        let mut machine = Machine::new(&m);
        assert_eq!(machine.run("f", &[RtVal::Int(2)]).unwrap(), RtVal::Int(5));
    }

    #[test]
    fn void_operand_propagates() {
        let m = div_module();
        let mut machine = Machine::new(&m);
        assert!(machine.run("f", &[RtVal::Void]).unwrap().is_void());
    }

    #[test]
    fn void_prop_short_circuits() {
        // fn g(x: i64) -> ??i64 { let y = (10 / x)??; y + 1 }
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "g",
            vec![Type::I64],
            Type::voidable(Type::I64),
            EffectSet::VOID,
        ));
        let mut b = Builder::new(&mut m, 0);
        let x = b.param(0);
        let ten = b.const_int(Type::I64, 10);
        let q = b.binary(Opcode::Div, Type::I64, ten, x);
        let y = b.void_prop(q);
        let one = b.const_int(Type::I64, 1);
        let sum = b.binary(Opcode::Add, Type::I64, y, one);
        b.ret(Some(sum));

        let mut machine = Machine::new(&m);
        assert!(machine.run("g", &[RtVal::Int(0)]).unwrap().is_void());
        assert_eq!(machine.run("g", &[RtVal::Int(5)]).unwrap(), RtVal::Int(3));
    }

    #[test]
    fn void_assert_traps() {
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "h",
            vec![Type::voidable(Type::I64)],
            Type::I64,
            EffectSet::VOID,
        ));
        let mut b = Builder::new(&mut m, 0);
        let x = b.param(0);
        let v = b.void_assert(x);
        b.ret(Some(v));

        let mut machine = Machine::new(&m);
        assert_eq!(machine.run("h", &[RtVal::Int(4)]).unwrap(), RtVal::Int(4));
        assert!(matches!(
            machine.run("h", &[RtVal::Void]),
            Err(EvalError::Trap(_))
        ));
    }

    #[test]
    fn capability_revocation_reads_void() {
        // fn r(cap: capability) -> ??i64 { cap[0] }
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "r",
            vec![Type::Capability],
            Type::voidable(Type::I64),
            EffectSet::VOID,
        ));
        let mut b = Builder::new(&mut m, 0);
        let cap = b.param(0);
        let zero = b.const_int(Type::U64, 0);
        let loaded = b.cap_load(cap, zero, Type::voidable(Type::U64));
        b.ret(Some(loaded));

        let mut machine = Machine::new(&m);
        let base = machine.arena_mut().alloc(64).unwrap();
        let cap = machine
            .arena()
            .derive(base, 64, Perm::READ | Perm::WRITE)
            .unwrap();
        cap.store_u64(machine.arena_mut(), 0, 99);

        let out = machine.run("r", &[RtVal::Cap(cap)]).unwrap();
        assert_eq!(out, RtVal::Int(99));

        machine.arena_mut().reset();
        let out = machine.run("r", &[RtVal::Cap(cap)]).unwrap();
        assert!(out.is_void());
    }

    #[test]
    fn galactic_predict_in_ir() {
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "p",
            vec![Type::Galactic, Type::Scalar],
            Type::Scalar,
            EffectSet::NONE,
        ));
        let mut b = Builder::new(&mut m, 0);
        let g = b.param(0);
        let dt = b.param(1);
        let out = b.gal_predict(g, dt);
        b.ret(Some(out));

        let mut machine = Machine::new(&m);
        let g = Galactic::new(
            Scalar::from_int(10),
            Scalar::from_int(2),
            Scalar::ZERO,
            Scalar::ZERO,
        );
        let out = machine
            .run("p", &[RtVal::Galactic(g), RtVal::Scalar(Scalar::from_int(3))])
            .unwrap();
        assert_eq!(out, RtVal::Scalar(Scalar::from_int(16)));
    }

    #[test]
    fn insert_extract_round_trip() {
        // insertfield(extractfield(x, i), i) == x on the same slot
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "rt",
            vec![Type::Galactic],
            Type::Galactic,
            EffectSet::NONE,
        ));
        let mut b = Builder::new(&mut m, 0);
        let g = b.param(0);
        let idx = b.const_int(Type::I64, 2);
        let field = b.extract_field(g, idx, Type::Scalar);
        let back = b.insert_field(g, idx, field);
        b.ret(Some(back));

        let mut machine = Machine::new(&m);
        let g = Galactic::new(
            Scalar::from_int(1),
            Scalar::from_int(2),
            Scalar::from_int(3),
            Scalar::from_int(4),
        );
        let out = machine.run("rt", &[RtVal::Galactic(g)]).unwrap();
        assert_eq!(out, RtVal::Galactic(g));
    }

    #[test]
    fn branch_and_phi() {
        // fn m(x: i64) -> i64 { if x < 0 { 0 - x } else { x } }
        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "abs",
            vec![Type::I64],
            Type::I64,
            EffectSet::NONE,
        ));
        let mut b = Builder::new(&mut m, 0);
        let x = b.param(0);
        let zero = b.const_int(Type::I64, 0);
        let neg_bb = b.add_block();
        let pos_bb = b.add_block();
        let join_bb = b.add_block();
        let cond = b.cmp(Opcode::CmpLt, x, zero);
        b.branch(cond, neg_bb, pos_bb);
        b.switch_to(neg_bb);
        let negated = b.neg(Type::I64, x);
        b.jump(join_bb);
        b.switch_to(pos_bb);
        b.jump(join_bb);
        b.switch_to(join_bb);
        let merged = b.phi(Type::I64, vec![(negated, neg_bb), (x, pos_bb)]);
        b.ret(Some(merged));

        let mut machine = Machine::new(&m);
        assert_eq!(machine.run("abs", &[RtVal::Int(-7)]).unwrap(), RtVal::Int(7));
        assert_eq!(machine.run("abs", &[RtVal::Int(7)]).unwrap(), RtVal::Int(7));
    }

    #[test]
    fn atlas_host_hooks() {
        struct FakeAtlas {
            stored: Option<(u64, u64)>,
        }
        impl SubstrateHost for FakeAtlas {
            fn atlas_begin(&mut self) -> Option<i64> {
                Some(1)
            }
            fn atlas_store(&mut self, addr: u64, v: u64) -> bool {
                self.stored = Some((addr, v));
                true
            }
            fn atlas_load(&mut self, addr: u64) -> Option<u64> {
                self.stored.filter(|(a, _)| *a == addr).map(|(_, v)| v)
            }
        }

        let mut m = Module::new("t");
        m.functions.push(Function::new(
            "w",
            vec![],
            Type::voidable(Type::U64),
            EffectSet::PERSIST | EffectSet::VOID,
        ));
        let mut b = Builder::new(&mut m, 0);
        let tx = b.atlas_begin();
        let _ = tx;
        let addr = b.const_int(Type::U64, 128);
        let v = b.const_int(Type::U64, 42);
        b.atlas_store(addr, v);
        let loaded = b.atlas_load(addr);
        b.ret(Some(loaded));

        let mut machine =
            Machine::with_host(&m, Box::new(FakeAtlas { stored: None }));
        assert_eq!(machine.run("w", &[]).unwrap(), RtVal::Int(42));

        // Without a host, the same module reads VOID.
        let mut machine = Machine::new(&m);
        assert!(machine.run("w", &[]).unwrap().is_void());
    }
}
