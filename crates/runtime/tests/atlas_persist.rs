//! End-to-end persistence: compiled Seraphim code driving a live Atlas
//!
//! The compiler's evaluator reaches the substrate through the
//! `SubstrateHost` trait; here the real Atlas store stands behind it, with
//! address 0 wired to the root pointer the way the lowering contract
//! expects.

use seraph_runtime::{Atlas, TxState};
use seraphc::{CompilerConfig, Machine, RtVal, SubstrateHost};
use std::cell::RefCell;
use std::rc::Rc;

struct AtlasHost {
    atlas: Rc<RefCell<Atlas>>,
}

impl SubstrateHost for AtlasHost {
    fn atlas_begin(&mut self) -> Option<i64> {
        Some(self.atlas.borrow_mut().begin() as i64)
    }

    fn atlas_commit(&mut self, tx: i64) -> bool {
        self.atlas.borrow_mut().commit(tx as u64).is_ok()
    }

    fn atlas_rollback(&mut self, tx: i64) {
        let _ = self.atlas.borrow_mut().abort(tx as u64);
    }

    fn atlas_load(&mut self, addr: u64) -> Option<u64> {
        let atlas = self.atlas.borrow();
        if addr == 0 {
            // Address 0 names the root-pointer slot.
            let root = atlas.root();
            return (root != 0).then_some(root);
        }
        let v = atlas.read_u64(addr);
        (v != u64::MAX).then_some(v)
    }

    fn atlas_store(&mut self, addr: u64, v: u64) -> bool {
        let mut atlas = self.atlas.borrow_mut();
        if addr == 0 {
            atlas.set_root(v);
            return true;
        }
        atlas.write_u64(addr, v)
    }
}

const SRC: &str = "\
effects(PERSIST, VOID) fn save(addr: u64, v: u64) -> ??u64 {\n\
  persist {\n\
    atlas_store(addr, v);\n\
    atlas_set_root(addr);\n\
    atlas_load(addr)\n\
  }\n\
}\n";

#[test]
fn persist_block_commits_to_disk() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("world.atlas");

    let compiled = seraphc::compile_source("persist-demo", SRC, &CompilerConfig::default())
        .expect("compiles cleanly");

    let (addr, commits_before) = {
        let atlas = Rc::new(RefCell::new(
            Atlas::create(&path, 1024 * 1024).expect("create"),
        ));
        let addr = atlas.borrow_mut().alloc(8).expect("alloc");
        let commits_before = atlas.borrow().commit_count();

        let mut machine = Machine::with_host(
            &compiled.ir,
            Box::new(AtlasHost {
                atlas: atlas.clone(),
            }),
        );
        let out = machine
            .run(
                "save",
                &[RtVal::Int(addr as i64), RtVal::Int(0x5EAF_i64)],
            )
            .expect("evaluation");
        assert_eq!(out, RtVal::Int(0x5EAF));
        drop(machine);

        assert_eq!(atlas.borrow().commit_count(), commits_before + 1);
        atlas.borrow().sync().unwrap();
        (addr, commits_before)
    };

    // Reopen: the committed world is what the last commit published.
    let atlas = Atlas::open(&path).expect("reopen");
    assert_eq!(atlas.commit_count(), commits_before + 1);
    assert_eq!(atlas.root(), addr);
    assert_eq!(atlas.read_u64(atlas.root()), 0x5EAF);
}

#[test]
fn void_escape_rolls_back() {
    // Division by zero inside the persist block escapes as VOID; the
    // transaction must abort, not commit.
    let src = "\
effects(PERSIST, VOID) fn risky(addr: u64, d: u64) -> ??u64 {\n\
  persist {\n\
    atlas_store(addr, 1u64);\n\
    100u64 / d\n\
  }\n\
}\n";
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("world.atlas");
    let compiled =
        seraphc::compile_source("rollback-demo", src, &CompilerConfig::default()).unwrap();

    let atlas = Rc::new(RefCell::new(
        Atlas::create(&path, 1024 * 1024).expect("create"),
    ));
    let addr = atlas.borrow_mut().alloc(8).unwrap();

    let mut machine = Machine::with_host(
        &compiled.ir,
        Box::new(AtlasHost {
            atlas: atlas.clone(),
        }),
    );
    let out = machine
        .run("risky", &[RtVal::Int(addr as i64), RtVal::Int(0)])
        .expect("evaluation");
    assert!(out.is_void());
    drop(machine);

    assert_eq!(atlas.borrow().commit_count(), 0);
    assert_eq!(atlas.borrow().abort_count(), 1);
}

#[test]
fn tx_states_are_reported() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut atlas = Atlas::create(&dir.path().join("t.atlas"), 1024 * 1024).unwrap();
    let tx = atlas.begin();
    assert_eq!(atlas.tx_state(tx), Some(TxState::Active));
    atlas.commit(tx).unwrap();
    assert_eq!(atlas.tx_state(tx), Some(TxState::Committed));
    let tx2 = atlas.begin();
    atlas.abort(tx2).unwrap();
    assert_eq!(atlas.tx_state(tx2), Some(TxState::Aborted));
}
