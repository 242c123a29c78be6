//! Atlas: the single-level transactional store
//!
//! One file mapped read/write into the address space:
//!
//! ```text
//! [offset 0]      Genesis   { magic, version, next_alloc_id, commit_count,
//!                             abort_count, root_offset, first_free_offset,
//!                             gen_table_offset, size }
//! [gen_table]     Gen table { entry_count, generations[] }
//! [first_free..]  Bump heap
//! ```
//!
//! Allocation is a bump of `first_free_offset`; free is a no-op. Every
//! allocation may take an `alloc_id` from the generation table; revoking
//! the id bumps its slot, and every capability minted under the old value
//! fails its check from then on.
//!
//! Transactions are ACID at root-pointer granularity: `begin` snapshots
//! the allocation cursor, writes land in live memory, `commit` syncs the
//! mapping and then publishes the root pointer and the bumped commit
//! count. `abort` restores the cursor and bumps the abort count. Reopening
//! a valid file finds the last committed world.

use seraph_core::{Capability, Perm, VOID_U64};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Little-endian genesis magic: "SERAPH-A".
pub const SERAPH_ATLAS_MAGIC: u64 = 0x412D_4850_4152_4553;
pub const ATLAS_VERSION: u32 = 1;

// Genesis field offsets.
const OFF_MAGIC: u64 = 0;
const OFF_VERSION: u64 = 8;
const OFF_NEXT_ALLOC_ID: u64 = 12;
const OFF_COMMIT_COUNT: u64 = 16;
const OFF_ABORT_COUNT: u64 = 24;
const OFF_ROOT: u64 = 32;
const OFF_FIRST_FREE: u64 = 40;
const OFF_GEN_TABLE: u64 = 48;
const OFF_SIZE: u64 = 56;
const GENESIS_SIZE: u64 = 64;

/// Generation-table capacity (one u64 per alloc id, plus the count word).
const GEN_TABLE_ENTRIES: u64 = 256;

const HEAP_ALIGN: u64 = 16;

#[derive(Debug)]
pub enum AtlasError {
    Io(std::io::Error),
    /// Magic mismatch: not an Atlas file.
    BadMagic(u64),
    BadVersion(u32),
    /// File too small to hold a genesis block and table.
    TooSmall(u64),
    MapFailed,
    /// Transaction id does not name the active transaction.
    NoSuchTransaction(u64),
}

impl std::fmt::Display for AtlasError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AtlasError::Io(e) => write!(f, "atlas io error: {}", e),
            AtlasError::BadMagic(found) => {
                write!(f, "atlas magic mismatch: found {:#018x}", found)
            }
            AtlasError::BadVersion(found) => {
                write!(f, "atlas version {} not supported", found)
            }
            AtlasError::TooSmall(size) => write!(f, "atlas file too small: {} bytes", size),
            AtlasError::MapFailed => write!(f, "mmap failed"),
            AtlasError::NoSuchTransaction(id) => write!(f, "no active transaction {}", id),
        }
    }
}

impl std::error::Error for AtlasError {}

impl From<std::io::Error> for AtlasError {
    fn from(e: std::io::Error) -> Self {
        AtlasError::Io(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy)]
struct TxRecord {
    id: u64,
    state: TxState,
    first_free_snapshot: u64,
    /// Root to publish at commit; starts as the current root.
    pending_root: u64,
}

pub struct Atlas {
    ptr: *mut u8,
    len: usize,
    _file: File,
    active_tx: Option<TxRecord>,
    /// Most recently finished transaction, for state queries.
    last_tx: Option<TxRecord>,
    next_tx_id: u64,
}

// The mapping is owned exclusively by this value.
unsafe impl Send for Atlas {}

impl Atlas {
    /// Create a fresh Atlas file of `size` bytes and write its genesis.
    pub fn create(path: &Path, size: u64) -> Result<Atlas, AtlasError> {
        let min = GENESIS_SIZE + 8 + 8 * GEN_TABLE_ENTRIES + HEAP_ALIGN;
        if size < min {
            return Err(AtlasError::TooSmall(size));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        let mut atlas = Atlas::map(file, size as usize)?;

        atlas.write_u64(OFF_MAGIC, SERAPH_ATLAS_MAGIC);
        atlas.write_u32(OFF_VERSION, ATLAS_VERSION);
        atlas.write_u32(OFF_NEXT_ALLOC_ID, 0);
        atlas.write_u64(OFF_COMMIT_COUNT, 0);
        atlas.write_u64(OFF_ABORT_COUNT, 0);
        atlas.write_u64(OFF_ROOT, 0);
        atlas.write_u64(OFF_GEN_TABLE, GENESIS_SIZE);
        atlas.write_u64(OFF_SIZE, size);
        // Generation table: entry count then zeroed slots.
        atlas.write_u64(GENESIS_SIZE, GEN_TABLE_ENTRIES);
        for i in 0..GEN_TABLE_ENTRIES {
            atlas.write_u64(GENESIS_SIZE + 8 + 8 * i, 1);
        }
        let heap_start =
            (GENESIS_SIZE + 8 + 8 * GEN_TABLE_ENTRIES).next_multiple_of(HEAP_ALIGN);
        atlas.write_u64(OFF_FIRST_FREE, heap_start);
        atlas.sync()?;
        tracing::debug!(?path, size, "atlas created");
        Ok(atlas)
    }

    /// Open an existing Atlas file, validating magic, version and size.
    pub fn open(path: &Path) -> Result<Atlas, AtlasError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < GENESIS_SIZE {
            return Err(AtlasError::TooSmall(len));
        }
        let atlas = Atlas::map(file, len as usize)?;
        let magic = atlas.read_u64(OFF_MAGIC);
        if magic != SERAPH_ATLAS_MAGIC {
            return Err(AtlasError::BadMagic(magic));
        }
        let version = atlas.read_u32(OFF_VERSION);
        if version != ATLAS_VERSION {
            return Err(AtlasError::BadVersion(version));
        }
        let recorded = atlas.read_u64(OFF_SIZE);
        if recorded > len {
            return Err(AtlasError::TooSmall(len));
        }
        tracing::debug!(?path, "atlas opened");
        Ok(atlas)
    }

    pub fn open_or_create(path: &Path, size: u64) -> Result<Atlas, AtlasError> {
        if path.exists() {
            Atlas::open(path)
        } else {
            Atlas::create(path, size)
        }
    }

    fn map(file: File, len: usize) -> Result<Atlas, AtlasError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(AtlasError::MapFailed);
        }
        Ok(Atlas {
            ptr: ptr as *mut u8,
            len,
            _file: file,
            active_tx: None,
            last_tx: None,
            next_tx_id: 1,
        })
    }

    // ------------------------------------------------------------------
    // Raw access
    // ------------------------------------------------------------------

    fn in_bounds(&self, offset: u64, size: u64) -> bool {
        offset
            .checked_add(size)
            .is_some_and(|end| end <= self.len as u64)
    }

    pub fn read_u64(&self, offset: u64) -> u64 {
        if !self.in_bounds(offset, 8) {
            return VOID_U64;
        }
        let mut bytes = [0u8; 8];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset as usize), bytes.as_mut_ptr(), 8);
        }
        u64::from_le_bytes(bytes)
    }

    pub fn write_u64(&mut self, offset: u64, v: u64) -> bool {
        if !self.in_bounds(offset, 8) {
            return false;
        }
        let bytes = v.to_le_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset as usize), 8);
        }
        true
    }

    fn read_u32(&self, offset: u64) -> u32 {
        if !self.in_bounds(offset, 4) {
            return u32::MAX;
        }
        let mut bytes = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset as usize), bytes.as_mut_ptr(), 4);
        }
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, offset: u64, v: u32) {
        if !self.in_bounds(offset, 4) {
            return;
        }
        let bytes = v.to_le_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset as usize), 4);
        }
    }

    pub fn read_bytes(&self, offset: u64, len: u64) -> Option<&[u8]> {
        if !self.in_bounds(offset, len) {
            return None;
        }
        Some(unsafe {
            std::slice::from_raw_parts(self.ptr.add(offset as usize), len as usize)
        })
    }

    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> bool {
        if !self.in_bounds(offset, bytes.len() as u64) {
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.add(offset as usize),
                bytes.len(),
            );
        }
        true
    }

    // ------------------------------------------------------------------
    // Genesis accessors
    // ------------------------------------------------------------------

    pub fn commit_count(&self) -> u64 {
        self.read_u64(OFF_COMMIT_COUNT)
    }

    pub fn abort_count(&self) -> u64 {
        self.read_u64(OFF_ABORT_COUNT)
    }

    pub fn root(&self) -> u64 {
        self.read_u64(OFF_ROOT)
    }

    pub fn first_free(&self) -> u64 {
        self.read_u64(OFF_FIRST_FREE)
    }

    pub fn size(&self) -> u64 {
        self.read_u64(OFF_SIZE)
    }

    /// Set the root pointer. Inside a transaction the new root is pending
    /// until commit; outside one it publishes immediately.
    pub fn set_root(&mut self, offset: u64) {
        match self.active_tx.as_mut() {
            Some(tx) => tx.pending_root = offset,
            None => {
                self.write_u64(OFF_ROOT, offset);
            }
        }
    }

    // ------------------------------------------------------------------
    // Allocation and the generation table
    // ------------------------------------------------------------------

    /// Bump-allocate from the heap region. Free is a no-op by design.
    pub fn alloc(&mut self, size: u64) -> Option<u64> {
        let cursor = self.first_free().next_multiple_of(HEAP_ALIGN);
        let end = cursor.checked_add(size)?;
        if end > self.size() {
            return None;
        }
        self.write_u64(OFF_FIRST_FREE, end);
        Some(cursor)
    }

    /// Page-aligned allocation.
    pub fn alloc_pages(&mut self, pages: u64) -> Option<u64> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let cursor = self.first_free().next_multiple_of(page);
        let end = cursor.checked_add(pages.checked_mul(page)?)?;
        if end > self.size() {
            return None;
        }
        self.write_u64(OFF_FIRST_FREE, end);
        Some(cursor)
    }

    fn gen_slot_offset(&self, alloc_id: u32) -> Option<u64> {
        let table = self.read_u64(OFF_GEN_TABLE);
        let entries = self.read_u64(table);
        if alloc_id as u64 >= entries {
            return None;
        }
        Some(table + 8 + 8 * alloc_id as u64)
    }

    /// Draw a fresh alloc id from the generation table.
    pub fn alloc_id_new(&mut self) -> Option<u32> {
        let id = self.read_u32(OFF_NEXT_ALLOC_ID);
        let table = self.read_u64(OFF_GEN_TABLE);
        let entries = self.read_u64(table);
        if id as u64 >= entries {
            return None;
        }
        self.write_u32(OFF_NEXT_ALLOC_ID, id + 1);
        Some(id)
    }

    pub fn generation_of(&self, alloc_id: u32) -> u64 {
        match self.gen_slot_offset(alloc_id) {
            Some(off) => self.read_u64(off),
            None => VOID_U64,
        }
    }

    /// Invalidate every capability minted under this id's current
    /// generation.
    pub fn revoke_id(&mut self, alloc_id: u32) {
        if let Some(off) = self.gen_slot_offset(alloc_id) {
            let generation = self.read_u64(off);
            self.write_u64(off, generation + 1);
            tracing::debug!(alloc_id, generation = generation + 1, "alloc id revoked");
        }
    }

    /// Derive a capability over an Atlas region, stamped with the alloc
    /// id's current generation.
    pub fn derive(
        &self,
        alloc_id: u32,
        offset: u64,
        length: u64,
        permissions: Perm,
    ) -> Option<Capability> {
        if !self.in_bounds(offset, length) {
            return None;
        }
        let generation = self.generation_of(alloc_id);
        if generation == VOID_U64 {
            return None;
        }
        Some(Capability {
            base: offset,
            length,
            generation,
            permissions,
        })
    }

    /// Checked load through an Atlas capability: generation, bounds,
    /// permission, in that order. Any miss reads VOID.
    pub fn cap_load_u64(&self, cap: &Capability, alloc_id: u32, offset: u64) -> u64 {
        if cap.generation != self.generation_of(alloc_id) {
            return VOID_U64;
        }
        match offset.checked_add(8) {
            Some(end) if end <= cap.length => {}
            _ => return VOID_U64,
        }
        if !cap.permissions.contains(Perm::READ) {
            return VOID_U64;
        }
        self.read_u64(cap.base + offset)
    }

    /// Checked store; a failed check is a silent drop.
    pub fn cap_store_u64(&mut self, cap: &Capability, alloc_id: u32, offset: u64, v: u64) -> bool {
        if cap.generation != self.generation_of(alloc_id) {
            return false;
        }
        match offset.checked_add(8) {
            Some(end) if end <= cap.length => {}
            _ => return false,
        }
        if !cap.permissions.contains(Perm::WRITE) {
            return false;
        }
        self.write_u64(cap.base + offset, v)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Begin a transaction, snapshotting the allocation cursor.
    pub fn begin(&mut self) -> u64 {
        let id = self.next_tx_id;
        self.next_tx_id += 1;
        self.active_tx = Some(TxRecord {
            id,
            state: TxState::Active,
            first_free_snapshot: self.first_free(),
            pending_root: self.root(),
        });
        tracing::debug!(tx = id, "transaction begun");
        id
    }

    /// Commit: durably sync the mapping, then publish the root pointer and
    /// the commit count.
    pub fn commit(&mut self, tx_id: u64) -> Result<(), AtlasError> {
        let tx = match self.active_tx {
            Some(tx) if tx.id == tx_id && tx.state == TxState::Active => tx,
            _ => return Err(AtlasError::NoSuchTransaction(tx_id)),
        };
        // Data pages first, so the published root never points at
        // unsynced bytes.
        self.sync()?;
        self.write_u64(OFF_ROOT, tx.pending_root);
        let commits = self.commit_count() + 1;
        self.write_u64(OFF_COMMIT_COUNT, commits);
        self.sync_range(0, GENESIS_SIZE)?;
        self.last_tx = Some(TxRecord {
            state: TxState::Committed,
            ..tx
        });
        self.active_tx = None;
        tracing::debug!(tx = tx_id, commits, "transaction committed");
        Ok(())
    }

    /// Abort: discard allocations made since `begin` by restoring the
    /// cursor snapshot, and count the abort.
    pub fn abort(&mut self, tx_id: u64) -> Result<(), AtlasError> {
        let tx = match self.active_tx {
            Some(tx) if tx.id == tx_id && tx.state == TxState::Active => tx,
            _ => return Err(AtlasError::NoSuchTransaction(tx_id)),
        };
        self.write_u64(OFF_FIRST_FREE, tx.first_free_snapshot);
        let aborts = self.abort_count() + 1;
        self.write_u64(OFF_ABORT_COUNT, aborts);
        self.last_tx = Some(TxRecord {
            state: TxState::Aborted,
            ..tx
        });
        self.active_tx = None;
        tracing::debug!(tx = tx_id, aborts, "transaction aborted");
        Ok(())
    }

    pub fn tx_state(&self, tx_id: u64) -> Option<TxState> {
        self.active_tx
            .filter(|tx| tx.id == tx_id)
            .or(self.last_tx.filter(|tx| tx.id == tx_id))
            .map(|tx| tx.state)
    }

    // ------------------------------------------------------------------
    // Durability
    // ------------------------------------------------------------------

    /// Flush the whole mapping to storage.
    pub fn sync(&self) -> Result<(), AtlasError> {
        let rc = unsafe { libc::msync(self.ptr as *mut libc::c_void, self.len, libc::MS_SYNC) };
        if rc != 0 {
            return Err(AtlasError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Flush a byte range, widened to page granularity by the host.
    pub fn sync_range(&self, offset: u64, len: u64) -> Result<(), AtlasError> {
        if !self.in_bounds(offset, len) {
            return Ok(());
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let start = offset / page * page;
        let span = (offset + len - start).next_multiple_of(page) as usize;
        let rc = unsafe {
            libc::msync(
                self.ptr.add(start as usize) as *mut libc::c_void,
                span.min(self.len - start as usize),
                libc::MS_SYNC,
            )
        };
        if rc != 0 {
            return Err(AtlasError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Atlas {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn fresh(dir: &TempDir) -> Atlas {
        Atlas::create(&dir.path().join("store.atlas"), MIB).expect("create")
    }

    #[test]
    fn genesis_shape() {
        let dir = TempDir::new().unwrap();
        let atlas = fresh(&dir);
        assert_eq!(atlas.read_u64(OFF_MAGIC), SERAPH_ATLAS_MAGIC);
        assert_eq!(atlas.commit_count(), 0);
        assert_eq!(atlas.abort_count(), 0);
        assert_eq!(atlas.root(), 0);
        assert!(atlas.first_free() > GENESIS_SIZE);
        assert_eq!(atlas.size(), MIB);
    }

    #[test]
    fn bump_allocation_is_aligned() {
        let dir = TempDir::new().unwrap();
        let mut atlas = fresh(&dir);
        let a = atlas.alloc(10).unwrap();
        let b = atlas.alloc(10).unwrap();
        assert_eq!(a % HEAP_ALIGN, 0);
        assert_eq!(b % HEAP_ALIGN, 0);
        assert!(b > a);
    }

    #[test]
    fn commit_round_trip_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.atlas");
        let value = 0xDEAD_BEEF_CAFE_BABEu64;
        {
            let mut atlas = Atlas::create(&path, MIB).unwrap();
            let tx = atlas.begin();
            let obj = atlas.alloc(8).unwrap();
            atlas.write_u64(obj, value);
            atlas.set_root(obj);
            atlas.commit(tx).unwrap();
            atlas.sync().unwrap();
            assert_eq!(atlas.commit_count(), 1);
        }
        let atlas = Atlas::open(&path).unwrap();
        assert_eq!(atlas.commit_count(), 1);
        let root = atlas.root();
        assert_ne!(root, 0);
        assert_eq!(atlas.read_u64(root), value);
    }

    #[test]
    fn abort_restores_the_cursor() {
        let dir = TempDir::new().unwrap();
        let mut atlas = fresh(&dir);
        let before = atlas.first_free();
        let tx = atlas.begin();
        atlas.alloc(4096).unwrap();
        assert!(atlas.first_free() > before);
        atlas.abort(tx).unwrap();
        assert_eq!(atlas.first_free(), before);
        assert_eq!(atlas.abort_count(), 1);
        // Root unchanged: the pending root never published.
        assert_eq!(atlas.root(), 0);
    }

    #[test]
    fn uncommitted_root_is_not_published() {
        let dir = TempDir::new().unwrap();
        let mut atlas = fresh(&dir);
        let tx = atlas.begin();
        let obj = atlas.alloc(8).unwrap();
        atlas.set_root(obj);
        assert_eq!(atlas.root(), 0, "root publishes only at commit");
        atlas.commit(tx).unwrap();
        assert_eq!(atlas.root(), obj);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.atlas");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();
        match Atlas::open(&path) {
            Err(AtlasError::BadMagic(_)) => {}
            other => panic!("expected BadMagic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.atlas");
        {
            let mut atlas = Atlas::create(&path, MIB).unwrap();
            atlas.write_u32(OFF_VERSION, 999);
            atlas.sync().unwrap();
        }
        match Atlas::open(&path) {
            Err(AtlasError::BadVersion(999)) => {}
            other => panic!("expected BadVersion, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn too_small_is_rejected_at_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.atlas");
        assert!(matches!(
            Atlas::create(&path, 128),
            Err(AtlasError::TooSmall(_))
        ));
    }

    #[test]
    fn alloc_id_revocation_fails_old_capabilities() {
        let dir = TempDir::new().unwrap();
        let mut atlas = fresh(&dir);
        let id = atlas.alloc_id_new().unwrap();
        let obj = atlas.alloc(64).unwrap();
        let cap = atlas
            .derive(id, obj, 64, Perm::READ | Perm::WRITE)
            .unwrap();

        assert!(atlas.cap_store_u64(&cap, id, 0, 99));
        assert_eq!(atlas.cap_load_u64(&cap, id, 0), 99);

        atlas.revoke_id(id);
        assert_eq!(atlas.cap_load_u64(&cap, id, 0), VOID_U64);
        assert!(!atlas.cap_store_u64(&cap, id, 0, 1));

        // A fresh capability under the new generation works again.
        let cap2 = atlas.derive(id, obj, 64, Perm::READ).unwrap();
        assert_eq!(atlas.cap_load_u64(&cap2, id, 0), 99);
    }

    #[test]
    fn cap_checks_run_in_order() {
        let dir = TempDir::new().unwrap();
        let mut atlas = fresh(&dir);
        let id = atlas.alloc_id_new().unwrap();
        let obj = atlas.alloc(32).unwrap();
        let cap = atlas.derive(id, obj, 32, Perm::WRITE).unwrap();
        // In bounds but not readable.
        atlas.write_u64(obj, 7);
        assert_eq!(atlas.cap_load_u64(&cap, id, 0), VOID_U64);
        // Out of bounds.
        let readable = atlas.derive(id, obj, 32, Perm::READ).unwrap();
        assert_eq!(atlas.cap_load_u64(&readable, id, 30), VOID_U64);
        assert_eq!(atlas.cap_load_u64(&readable, id, 0), 7);
    }

    #[test]
    fn alloc_pages_is_page_aligned() {
        let dir = TempDir::new().unwrap();
        let mut atlas = fresh(&dir);
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let off = atlas.alloc_pages(2).unwrap();
        assert_eq!(off % page, 0);
    }

    #[test]
    fn commit_of_unknown_tx_fails() {
        let dir = TempDir::new().unwrap();
        let mut atlas = fresh(&dir);
        assert!(matches!(
            atlas.commit(42),
            Err(AtlasError::NoSuchTransaction(42))
        ));
        let tx = atlas.begin();
        atlas.commit(tx).unwrap();
        // Double commit: the transaction is gone.
        assert!(matches!(
            atlas.commit(tx),
            Err(AtlasError::NoSuchTransaction(_))
        ));
    }
}
