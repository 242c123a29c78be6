//! Seraphim type and effect model
//!
//! Types are structural. `Voidable(T)` is the wrapper expressing "T or
//! VOID"; it is a type-level construct, distinct from the runtime sentinel
//! patterns that happen to encode it. Effects are a six-bit set with union
//! and subset as the only algebra.

use std::fmt;

bitflags::bitflags! {
    /// Compile-time effect bits.
    ///
    /// `NONE` is the empty set; `ALL` (0xFF) is the unsafe everything-set
    /// bound to functions with no annotation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EffectSet: u8 {
        const VOID = 0x01;
        const PERSIST = 0x02;
        const NETWORK = 0x04;
        const TIMER = 0x08;
        const IO = 0x10;
        const ALL = 0xFF;
    }
}

impl EffectSet {
    pub const NONE: EffectSet = EffectSet::empty();

    /// `(sub & ~super) == 0`.
    #[inline]
    pub fn is_subset_of(self, sup: EffectSet) -> bool {
        (self.bits() & !sup.bits()) == 0
    }

    /// Effect set by name, for `effects(...)` annotations.
    pub fn from_annotation_name(name: &str) -> Option<EffectSet> {
        Some(match name {
            "NONE" => EffectSet::NONE,
            "VOID" => EffectSet::VOID,
            "PERSIST" => EffectSet::PERSIST,
            "NETWORK" => EffectSet::NETWORK,
            "TIMER" => EffectSet::TIMER,
            "IO" => EffectSet::IO,
            "ALL" => EffectSet::ALL,
            _ => return None,
        })
    }
}

impl fmt::Display for EffectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        if *self == EffectSet::ALL {
            return write!(f, "ALL");
        }
        let mut first = true;
        for (name, flag) in [
            ("VOID", EffectSet::VOID),
            ("PERSIST", EffectSet::PERSIST),
            ("NETWORK", EffectSet::NETWORK),
            ("TIMER", EffectSet::TIMER),
            ("IO", EffectSet::IO),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Integer widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    pub fn bits(self) -> u32 {
        match self {
            IntWidth::W8 => 8,
            IntWidth::W16 => 16,
            IntWidth::W32 => 32,
            IntWidth::W64 => 64,
        }
    }

    pub fn bytes(self) -> u64 {
        (self.bits() / 8) as u64
    }
}

/// Structural types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// The unit/absence type (not the VOID value).
    Void,
    Bool,
    Int { width: IntWidth, signed: bool },
    /// Q64.64 fixed point.
    Scalar,
    /// Two-channel dual number.
    Dual,
    /// Four-channel hyper-dual.
    Galactic,
    /// 32-byte capability record.
    Capability,
    /// Named struct; field layout lives in the checker's type table.
    Struct(String),
    Array(Box<Type>, u64),
    /// Capability plus element count.
    Slice(Box<Type>),
    /// Fat string pointer.
    Str,
    /// Named tagged union.
    Enum(String),
    Function {
        params: Vec<Type>,
        ret: Box<Type>,
        effects: EffectSet,
    },
    /// T or VOID.
    Voidable(Box<Type>),
    /// Substrate handle (Volatile, Atlas, Aether).
    Substrate,
    /// Raw pointer, bootstrap only.
    Pointer(Box<Type>),
}

impl Type {
    pub const I64: Type = Type::Int {
        width: IntWidth::W64,
        signed: true,
    };
    pub const U64: Type = Type::Int {
        width: IntWidth::W64,
        signed: false,
    };
    pub const U8: Type = Type::Int {
        width: IntWidth::W8,
        signed: false,
    };

    pub fn voidable(inner: Type) -> Type {
        Type::Voidable(Box::new(inner))
    }

    pub fn is_voidable(&self) -> bool {
        matches!(self, Type::Voidable(_))
    }

    /// Strip one `Voidable` layer, if present.
    pub fn strip_voidable(&self) -> &Type {
        match self {
            Type::Voidable(inner) => inner,
            other => other,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int { .. })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Type::Int { .. } | Type::Scalar | Type::Dual | Type::Galactic
        )
    }

    /// Byte size of the runtime representation, where it is fixed.
    pub fn byte_size(&self) -> Option<u64> {
        Some(match self {
            Type::Void => 0,
            Type::Bool => 1,
            Type::Int { width, .. } => width.bytes(),
            Type::Scalar | Type::Str | Type::Slice(_) => 16,
            Type::Dual => 32,
            Type::Galactic => 64,
            Type::Capability => 32,
            Type::Pointer(_) | Type::Substrate | Type::Function { .. } => 8,
            Type::Array(elem, n) => elem.byte_size()? * n,
            Type::Voidable(inner) => inner.byte_size()?,
            Type::Struct(_) | Type::Enum(_) => return None,
        })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::Int { width, signed } => {
                write!(f, "{}{}", if *signed { "i" } else { "u" }, width.bits())
            }
            Type::Scalar => write!(f, "scalar"),
            Type::Dual => write!(f, "dual"),
            Type::Galactic => write!(f, "galactic"),
            Type::Capability => write!(f, "capability"),
            Type::Struct(name) => write!(f, "{}", name),
            Type::Array(elem, n) => write!(f, "[{}; {}]", elem, n),
            Type::Slice(elem) => write!(f, "[{}]", elem),
            Type::Str => write!(f, "str"),
            Type::Enum(name) => write!(f, "{}", name),
            Type::Function { params, ret, .. } => {
                write!(f, "fn(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") -> {}", ret)
            }
            Type::Voidable(inner) => write!(f, "??{}", inner),
            Type::Substrate => write!(f, "substrate"),
            Type::Pointer(inner) => write!(f, "*{}", inner),
        }
    }
}

/// Struct layout as the checker records it.
#[derive(Debug, Clone, PartialEq)]
pub struct StructInfo {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

impl StructInfo {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    /// Byte offset of a field under sequential, 8-byte-aligned layout.
    pub fn field_offset(&self, index: usize) -> u64 {
        let mut off = 0u64;
        for (_, ty) in self.fields.iter().take(index) {
            let size = ty.byte_size().unwrap_or(8).max(1);
            off = off.next_multiple_of(8) + size;
        }
        off.next_multiple_of(8)
    }
}

/// Enum (tagged union) shape.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumInfo {
    pub name: String,
    pub variants: Vec<(String, Vec<Type>)>,
}

impl EnumInfo {
    pub fn variant_index(&self, name: &str) -> Option<usize> {
        self.variants.iter().position(|(n, _)| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subset_is_reflexive() {
        for set in [
            EffectSet::NONE,
            EffectSet::VOID,
            EffectSet::VOID | EffectSet::IO,
            EffectSet::ALL,
        ] {
            assert!(set.is_subset_of(set));
        }
    }

    #[test]
    fn subset_is_transitive() {
        let a = EffectSet::VOID;
        let b = EffectSet::VOID | EffectSet::IO;
        let c = EffectSet::VOID | EffectSet::IO | EffectSet::PERSIST;
        assert!(a.is_subset_of(b));
        assert!(b.is_subset_of(c));
        assert!(a.is_subset_of(c));
    }

    #[test]
    fn subset_monotone_under_union() {
        let a = EffectSet::VOID;
        let b = EffectSet::VOID | EffectSet::TIMER;
        let extra = EffectSet::IO;
        assert!(a.is_subset_of(b));
        assert!((a | extra).is_subset_of(b | extra));
    }

    #[test]
    fn none_is_bottom_all_is_top() {
        let some = EffectSet::PERSIST | EffectSet::NETWORK;
        assert!(EffectSet::NONE.is_subset_of(some));
        assert!(some.is_subset_of(EffectSet::ALL));
        assert!(!some.is_subset_of(EffectSet::NONE));
    }

    #[test]
    fn effect_display() {
        assert_eq!(EffectSet::NONE.to_string(), "NONE");
        assert_eq!((EffectSet::VOID | EffectSet::IO).to_string(), "VOID|IO");
        assert_eq!(EffectSet::ALL.to_string(), "ALL");
    }

    #[test]
    fn voidable_strip() {
        let t = Type::voidable(Type::I64);
        assert!(t.is_voidable());
        assert_eq!(t.strip_voidable(), &Type::I64);
        assert_eq!(Type::Bool.strip_voidable(), &Type::Bool);
    }

    #[test]
    fn type_display() {
        assert_eq!(Type::voidable(Type::I64).to_string(), "??i64");
        assert_eq!(Type::Slice(Box::new(Type::U8)).to_string(), "[u8]");
        assert_eq!(
            Type::Array(Box::new(Type::Scalar), 4).to_string(),
            "[scalar; 4]"
        );
    }

    #[test]
    fn struct_field_offsets() {
        let info = StructInfo {
            name: "Pair".into(),
            fields: vec![
                ("a".into(), Type::U8),
                ("b".into(), Type::I64),
                ("c".into(), Type::Scalar),
            ],
        };
        assert_eq!(info.field_offset(0), 0);
        assert_eq!(info.field_offset(1), 8);
        assert_eq!(info.field_offset(2), 16);
        assert_eq!(info.field_index("c"), Some(2));
    }
}
