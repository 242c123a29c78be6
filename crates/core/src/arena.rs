//! Bump arenas with generation counters
//!
//! The arena is the single ownership story for SERAPH memory: allocation is
//! a bump of `used`, free is a no-op, and `reset` retroactively invalidates
//! every capability ever carved from the region by advancing the
//! generation counter. Generation values never repeat within a run.
//!
//! The Atlas store applies the same bump-and-generation discipline to a
//! file mapping; it manages that mapping itself because its allocation
//! cursor must persist inside the genesis header.

use crate::capability::{Capability, Perm};

bitflags::bitflags! {
    /// Arena behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArenaFlags: u32 {
        /// Zero each allocation before handing it out.
        const ZERO_ON_ALLOC = 1;
        /// Region is backed by a file mapping (set by Atlas internals).
        const FILE_BACKED = 2;
    }
}

/// Bump allocator over an owned byte region.
///
/// All addresses handed out are byte offsets from the region base, which
/// keeps capabilities stable across moves of the `Arena` value itself.
#[derive(Debug)]
pub struct Arena {
    memory: Vec<u8>,
    capacity: u64,
    used: u64,
    alignment: u64,
    generation: u64,
    flags: ArenaFlags,
}

impl Arena {
    /// Default allocation alignment.
    pub const DEFAULT_ALIGN: u64 = 16;

    pub fn new(capacity: usize) -> Arena {
        Arena::with_alignment(capacity, Arena::DEFAULT_ALIGN)
    }

    /// `alignment` must be a power of two.
    pub fn with_alignment(capacity: usize, alignment: u64) -> Arena {
        debug_assert!(alignment.is_power_of_two());
        Arena {
            memory: vec![0u8; capacity],
            capacity: capacity as u64,
            used: 0,
            alignment,
            generation: 1,
            flags: ArenaFlags::ZERO_ON_ALLOC,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn flags(&self) -> ArenaFlags {
        self.flags
    }

    /// Bump-allocate `size` bytes, returning the offset of the block.
    ///
    /// Returns `None` when the arena is exhausted; there is no fallback
    /// path, callers decide whether exhaustion is fatal.
    pub fn alloc(&mut self, size: u64) -> Option<u64> {
        let base = self.used.next_multiple_of(self.alignment);
        let end = base.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        if self.flags.contains(ArenaFlags::ZERO_ON_ALLOC) {
            self.memory[base as usize..end as usize].fill(0);
        }
        self.used = end;
        Some(base)
    }

    /// Drop every allocation and advance the generation.
    ///
    /// Capabilities created before the reset fail their generation check
    /// from this point on; the memory itself is not scrubbed until the
    /// offsets are reallocated.
    pub fn reset(&mut self) {
        self.used = 0;
        self.generation += 1;
    }

    /// Derive a capability over `[base, base+length)` with the current
    /// generation. Fails if the window exceeds the region.
    pub fn derive(&self, base: u64, length: u64, permissions: Perm) -> Option<Capability> {
        let end = base.checked_add(length)?;
        if end > self.capacity {
            return None;
        }
        Some(Capability {
            base,
            length,
            generation: self.generation,
            permissions,
        })
    }

    // Raw bounds-checked access. Capability checks happen a layer above;
    // these only guard the region itself.

    pub fn read_bytes(&self, offset: u64, len: u64) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.capacity {
            return None;
        }
        Some(&self.memory[offset as usize..end as usize])
    }

    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> bool {
        let end = match offset.checked_add(bytes.len() as u64) {
            Some(e) if e <= self.capacity => e,
            _ => return false,
        };
        self.memory[offset as usize..end as usize].copy_from_slice(bytes);
        true
    }

    pub fn read_u8(&self, offset: u64) -> Option<u8> {
        self.read_bytes(offset, 1).map(|b| b[0])
    }

    pub fn read_u64(&self, offset: u64) -> Option<u64> {
        self.read_bytes(offset, 8)
            .map(|b| u64::from_le_bytes(b.try_into().expect("8-byte slice")))
    }

    pub fn write_u8(&mut self, offset: u64, v: u8) -> bool {
        self.write_bytes(offset, &[v])
    }

    pub fn write_u64(&mut self, offset: u64, v: u64) -> bool {
        self.write_bytes(offset, &v.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_bumps_with_alignment() {
        let mut a = Arena::new(4096);
        let first = a.alloc(10).unwrap();
        let second = a.alloc(10).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 16); // aligned past the 10-byte block
        assert_eq!(a.used(), 26);
    }

    #[test]
    fn alloc_exhaustion() {
        let mut a = Arena::new(64);
        assert!(a.alloc(64).is_some());
        assert!(a.alloc(1).is_none());
    }

    #[test]
    fn reset_advances_generation() {
        let mut a = Arena::new(128);
        let g0 = a.generation();
        a.alloc(32);
        a.reset();
        assert_eq!(a.used(), 0);
        assert_eq!(a.generation(), g0 + 1);
        a.reset();
        assert_eq!(a.generation(), g0 + 2);
    }

    #[test]
    fn derive_bounds() {
        let a = Arena::new(128);
        assert!(a.derive(0, 128, Perm::READ).is_some());
        assert!(a.derive(64, 65, Perm::READ).is_none());
        let cap = a.derive(8, 16, Perm::READ | Perm::WRITE).unwrap();
        assert_eq!(cap.generation, a.generation());
    }

    #[test]
    fn rw_helpers() {
        let mut a = Arena::new(64);
        assert!(a.write_u64(8, 0xDEAD_BEEF));
        assert_eq!(a.read_u64(8), Some(0xDEAD_BEEF));
        assert!(!a.write_u64(60, 1)); // would cross the end
        assert_eq!(a.read_u64(60), None);
    }
}
