//! Capabilities: bounds, generation and permission gated access
//!
//! A capability is a 32-byte record naming a window of an arena together
//! with the generation it was carved at. Checking always runs the same
//! three tests in order: generation match, offset within length,
//! permission mask. A failed load reads as VOID; a failed store is a
//! silent drop, so a corrupt program faults through VOID values downstream
//! rather than trapping.

use crate::arena::Arena;
use crate::vbit::{VOID_U8, VOID_U64};

bitflags::bitflags! {
    /// Capability permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perm: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
        /// Holder may derive narrowed capabilities.
        const DERIVE = 8;
    }
}

/// Why a capability check failed, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapFault {
    /// The arena generation moved on since this capability was derived.
    StaleGeneration,
    /// The requested window falls outside the capability's length.
    OutOfBounds,
    /// The permission mask does not contain the required permission.
    PermissionDenied,
}

/// `{base, length, generation, permissions}` gating access to an arena
/// window. `base` is an offset from the arena region start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub base: u64,
    pub length: u64,
    pub generation: u64,
    pub permissions: Perm,
}

impl Capability {
    /// The VOID capability: every field carries its sentinel, no bits of
    /// permission. Fails every check.
    pub const VOID: Capability = Capability {
        base: VOID_U64,
        length: 0,
        generation: VOID_U64,
        permissions: Perm::empty(),
    };

    pub fn is_void(&self) -> bool {
        self.base == VOID_U64 && self.generation == VOID_U64
    }

    /// The three checks, in mandated order.
    pub fn check(&self, arena: &Arena, offset: u64, len: u64, need: Perm) -> Result<(), CapFault> {
        if self.generation != arena.generation() {
            return Err(CapFault::StaleGeneration);
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.length => {}
            _ => return Err(CapFault::OutOfBounds),
        }
        if !self.permissions.contains(need) {
            return Err(CapFault::PermissionDenied);
        }
        Ok(())
    }

    /// Load a byte through the capability. Any check failure reads as the
    /// 8-bit VOID sentinel.
    pub fn load_u8(&self, arena: &Arena, offset: u64) -> u8 {
        if self.check(arena, offset, 1, Perm::READ).is_err() {
            return VOID_U8;
        }
        arena.read_u8(self.base + offset).unwrap_or(VOID_U8)
    }

    /// Load a little-endian u64 through the capability.
    pub fn load_u64(&self, arena: &Arena, offset: u64) -> u64 {
        if self.check(arena, offset, 8, Perm::READ).is_err() {
            return VOID_U64;
        }
        arena.read_u64(self.base + offset).unwrap_or(VOID_U64)
    }

    /// Store a byte. A failed check drops the store; the return value only
    /// reports whether the write landed.
    pub fn store_u8(&self, arena: &mut Arena, offset: u64, v: u8) -> bool {
        if self.check(arena, offset, 1, Perm::WRITE).is_err() {
            return false;
        }
        arena.write_u8(self.base + offset, v)
    }

    /// Store a little-endian u64, silently dropped on check failure.
    pub fn store_u64(&self, arena: &mut Arena, offset: u64, v: u64) -> bool {
        if self.check(arena, offset, 8, Perm::WRITE).is_err() {
            return false;
        }
        arena.write_u64(self.base + offset, v)
    }

    /// Derive a narrowed capability: a sub-window with a permission mask
    /// that can only shrink. Requires DERIVE on the parent. There is no
    /// widening operation anywhere in the system.
    pub fn narrow(&self, offset: u64, length: u64, perms: Perm) -> Option<Capability> {
        if !self.permissions.contains(Perm::DERIVE) {
            return None;
        }
        let end = offset.checked_add(length)?;
        if end > self.length {
            return None;
        }
        Some(Capability {
            base: self.base + offset,
            length,
            generation: self.generation,
            // Intersection: narrowing is monotone.
            permissions: self.permissions & perms,
        })
    }

    /// Split at `at`, consuming the original: the two derived halves are
    /// returned and `self` becomes the VOID capability. Requires DERIVE.
    pub fn split(&mut self, at: u64) -> Option<(Capability, Capability)> {
        if !self.permissions.contains(Perm::DERIVE) || at > self.length {
            return None;
        }
        let low = Capability {
            base: self.base,
            length: at,
            generation: self.generation,
            permissions: self.permissions,
        };
        let high = Capability {
            base: self.base + at,
            length: self.length - at,
            generation: self.generation,
            permissions: self.permissions,
        };
        *self = Capability::VOID;
        Some((low, high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with_cap() -> (Arena, Capability) {
        let mut a = Arena::new(4096);
        let base = a.alloc(64).unwrap();
        let cap = a
            .derive(base, 64, Perm::READ | Perm::WRITE | Perm::DERIVE)
            .unwrap();
        (a, cap)
    }

    #[test]
    fn load_store_round_trip() {
        let (mut a, cap) = arena_with_cap();
        assert!(cap.store_u64(&mut a, 0, 0xCAFE));
        assert_eq!(cap.load_u64(&a, 0), 0xCAFE);
        assert!(cap.store_u8(&mut a, 63, 7));
        assert_eq!(cap.load_u8(&a, 63), 7);
    }

    #[test]
    fn check_order_generation_first() {
        let (mut a, cap) = arena_with_cap();
        a.reset();
        // Stale generation reported even though bounds are also bad
        assert_eq!(
            cap.check(&a, 1000, 8, Perm::READ),
            Err(CapFault::StaleGeneration)
        );
    }

    #[test]
    fn check_order_bounds_before_perms() {
        let (a, cap) = arena_with_cap();
        // Out of bounds AND missing EXECUTE: bounds wins
        assert_eq!(
            cap.check(&a, 60, 8, Perm::EXECUTE),
            Err(CapFault::OutOfBounds)
        );
        assert_eq!(
            cap.check(&a, 0, 8, Perm::EXECUTE),
            Err(CapFault::PermissionDenied)
        );
    }

    #[test]
    fn reset_invalidates_loads() {
        let (mut a, cap) = arena_with_cap();
        cap.store_u64(&mut a, 0, 42);
        assert_eq!(cap.load_u64(&a, 0), 42);
        a.reset();
        assert_eq!(cap.load_u64(&a, 0), VOID_U64);
        // Stores after reset are silently dropped
        assert!(!cap.store_u64(&mut a, 0, 1));
    }

    #[test]
    fn out_of_bounds_reads_void() {
        let (a, cap) = arena_with_cap();
        assert_eq!(cap.load_u64(&a, 57), VOID_U64);
        assert_eq!(cap.load_u8(&a, 64), VOID_U8);
    }

    #[test]
    fn narrow_is_monotone() {
        let (_, cap) = arena_with_cap();
        let narrowed = cap.narrow(8, 16, Perm::READ).unwrap();
        assert_eq!(narrowed.base, cap.base + 8);
        assert_eq!(narrowed.length, 16);
        assert_eq!(narrowed.permissions, Perm::READ);
        // Asking for more than the parent holds yields the intersection
        let widened = cap.narrow(0, 8, Perm::all()).unwrap();
        assert_eq!(widened.permissions, cap.permissions);
        // A READ-only cap cannot derive at all
        assert!(narrowed.narrow(0, 4, Perm::READ).is_none());
    }

    #[test]
    fn split_voids_original() {
        let (a, mut cap) = arena_with_cap();
        let (low, high) = cap.split(16).unwrap();
        assert!(cap.is_void());
        assert_eq!(low.length, 16);
        assert_eq!(high.base, low.base + 16);
        assert_eq!(high.length, 48);
        // The halves still work; the original fails every check
        assert!(low.check(&a, 0, 8, Perm::READ).is_ok());
        assert!(cap.check(&a, 0, 1, Perm::READ).is_err());
    }

    #[test]
    fn void_capability_fails_checks() {
        let (a, _) = arena_with_cap();
        assert_eq!(Capability::VOID.load_u64(&a, 0), VOID_U64);
        assert!(Capability::VOID.is_void());
    }
}
