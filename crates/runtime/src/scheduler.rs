//! Strand scheduler
//!
//! Cooperative and single-threaded per host thread of control: one strand
//! runs at a time until its quantum ends (yield, block or exit). The
//! current strand id sits in a thread-local so an embedding application
//! can run one scheduler per OS thread with no shared mutable state.
//!
//! Capability isolation happens through the per-strand tables: `grant`
//! moves ownership, `lend`/`revoke` create matched LENT/BORROWED pairs
//! with a timeout tick, and `process_lends` expires them. Mutexes are
//! capability tokens: acquisition places a read capability into the
//! holder's table, release hands the token directly to the head of the
//! wait queue so there is no thundering herd.
//!
//! Invalid state transitions are no-ops with a diagnostic, never panics.

use crate::predictor::GalacticExecStats;
use crate::strand::{
    CAP_SLOTS, CapSlot, Quantum, SlotStatus, Strand, StrandFn, StrandId, StrandState,
};
use seraph_core::{Arena, Capability, Perm, Scalar};
use std::cell::Cell;
use std::collections::HashMap;

thread_local! {
    /// Id of the strand currently executing a quantum (0 = none).
    pub static CURRENT_STRAND: Cell<StrandId> = const { Cell::new(0) };
}

/// The id of the strand currently running on this thread.
pub fn current_strand() -> StrandId {
    CURRENT_STRAND.with(|c| c.get())
}

pub type MutexId = u64;

/// What a join attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Target already terminated; exit code attached.
    Done(i64),
    /// Caller is now WAITING on the target.
    Waiting,
    /// The wait would close a cycle; refused.
    DeadlockRefused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Token granted; the capability landed in this slot.
    Acquired(usize),
    /// Contended: the caller is now BLOCKED in the queue.
    Blocked,
    DeadlockRefused,
}

struct MutexRecord {
    token: Capability,
    holder: Option<StrandId>,
    /// Slot in the holder's table where the token lives.
    holder_slot: usize,
    wait_queue: Vec<StrandId>,
}

/// Lifecycle counters, per scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerStats {
    pub total_spawned: u64,
    pub total_completed: u64,
    pub peak_live: usize,
}

pub struct Scheduler {
    strands: HashMap<StrandId, Strand>,
    ready: Vec<StrandId>,
    mutexes: HashMap<MutexId, MutexRecord>,
    /// Token arena backing mutex capabilities.
    token_arena: Arena,
    next_strand_id: StrandId,
    next_mutex_id: MutexId,
    pub stats: SchedulerStats,
    /// Horizon used for predictive scheduling, in ticks.
    predict_horizon: Scalar,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            strands: HashMap::new(),
            ready: Vec::new(),
            mutexes: HashMap::new(),
            token_arena: Arena::new(4096),
            next_strand_id: 1,
            next_mutex_id: 1,
            stats: SchedulerStats::default(),
            predict_horizon: Scalar::ONE,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn create(&mut self, entry: StrandFn) -> StrandId {
        let id = self.next_strand_id;
        self.next_strand_id += 1;
        self.strands.insert(id, Strand::new(id, entry));
        self.stats.total_spawned += 1;
        let live = self.strands.values().filter(|s| !s.is_done()).count();
        self.stats.peak_live = self.stats.peak_live.max(live);
        tracing::debug!(strand = id, "created");
        id
    }

    /// Create with Galactic predictive-scheduling statistics attached.
    pub fn create_with_stats(&mut self, entry: StrandFn, target_exec: Scalar) -> StrandId {
        let id = self.create(entry);
        if let Some(s) = self.strands.get_mut(&id) {
            s.stats = Some(GalacticExecStats::new(target_exec));
        }
        id
    }

    /// NASCENT -> READY. Anything else is a diagnosed no-op.
    pub fn start(&mut self, id: StrandId) {
        let Some(strand) = self.strands.get_mut(&id) else {
            tracing::warn!(strand = id, "start on unknown strand");
            return;
        };
        if strand.state != StrandState::Nascent {
            tracing::warn!(strand = id, state = ?strand.state, "start on non-nascent strand");
            return;
        }
        strand.state = StrandState::Ready;
        self.ready.push(id);
    }

    pub fn strand(&self, id: StrandId) -> Option<&Strand> {
        self.strands.get(&id)
    }

    pub fn strand_mut(&mut self, id: StrandId) -> Option<&mut Strand> {
        self.strands.get_mut(&id)
    }

    /// Destroy a strand record. Only NASCENT and TERMINATED strands go.
    pub fn destroy(&mut self, id: StrandId) {
        match self.strands.get(&id).map(|s| s.state) {
            Some(StrandState::Nascent) | Some(StrandState::Terminated) => {
                self.strands.remove(&id);
            }
            Some(state) => {
                tracing::warn!(strand = id, ?state, "destroy on live strand refused");
            }
            None => {}
        }
    }

    /// Pick the next READY strand: highest priority, FIFO within equals.
    fn pick_next(&mut self) -> Option<StrandId> {
        if self.ready.is_empty() {
            return None;
        }
        let best = self
            .ready
            .iter()
            .enumerate()
            .max_by_key(|(i, id)| {
                let priority = self
                    .strands
                    .get(*id)
                    .map(|s| s.priority)
                    .unwrap_or(i32::MIN);
                // Earlier entries win ties.
                (priority, -(*i as i64))
            })
            .map(|(i, _)| i)?;
        Some(self.ready.remove(best))
    }

    /// Drive strands until nothing is READY. Returns the number of quanta
    /// executed.
    pub fn run(&mut self) -> u64 {
        let mut quanta = 0;
        while let Some(id) = self.pick_next() {
            self.run_quantum(id);
            quanta += 1;
        }
        quanta
    }

    fn run_quantum(&mut self, id: StrandId) {
        {
            let Some(strand) = self.strands.get_mut(&id) else {
                return;
            };
            if strand.state != StrandState::Ready {
                tracing::warn!(strand = id, state = ?strand.state, "scheduled non-ready strand");
                return;
            }
            strand.state = StrandState::Running;
            strand.context_switches += 1;
        }
        CURRENT_STRAND.with(|c| c.set(id));

        // Take the entry out so the body can borrow the scheduler.
        let mut entry = match self.strands.get_mut(&id).and_then(|s| s.entry.take()) {
            Some(f) => f,
            None => {
                self.finish_strand(id, -1);
                return;
            }
        };
        let start_tick = self.strands.get(&id).map(|s| s.chronon).unwrap_or(0);
        let quantum = entry(self, id);
        CURRENT_STRAND.with(|c| c.set(0));

        let Some(strand) = self.strands.get_mut(&id) else {
            return;
        };
        strand.entry = Some(entry);
        let elapsed = strand.chronon.saturating_sub(start_tick).max(1);

        // Predictive-scheduling bookkeeping.
        let mut delta = None;
        if let Some(stats) = strand.stats.as_mut() {
            let exec = Scalar::from_int(elapsed as i64);
            stats.record_quantum(exec, exec, Scalar::ZERO, Scalar::ZERO);
            stats.adapt_learning_rate();
            let now = strand.chronon;
            delta = stats.gradient_step(self.predict_horizon, now);
        }
        if let Some(d) = delta {
            strand.priority = strand.priority.saturating_add(d);
            tracing::debug!(strand = id, delta = d, priority = strand.priority, "priority step");
        }

        match quantum {
            Quantum::Yield => {
                strand.state = StrandState::Ready;
                strand.chronon += 1;
                strand.yields += 1;
                self.ready.push(id);
                self.process_lends(id);
            }
            Quantum::Blocked => {
                // The blocking call already moved the state to BLOCKED or
                // WAITING; a confused body that reports Blocked while
                // RUNNING just yields.
                let state = strand.state;
                if state == StrandState::Running {
                    tracing::warn!(strand = id, "blocked quantum without a wait record");
                    strand.state = StrandState::Ready;
                    self.ready.push(id);
                }
            }
            Quantum::Exit(code) => self.finish_strand(id, code),
        }
    }

    fn finish_strand(&mut self, id: StrandId, code: i64) {
        if let Some(strand) = self.strands.get_mut(&id) {
            strand.state = StrandState::Terminated;
            strand.exit_code = code;
            strand.waiting_on = None;
        }
        self.stats.total_completed += 1;
        tracing::debug!(strand = id, code, "terminated");

        // Wake joiners.
        let waiters: Vec<StrandId> = self
            .strands
            .values()
            .filter(|s| s.state == StrandState::Waiting && s.waiting_on == Some(id))
            .map(|s| s.id)
            .collect();
        for w in waiters {
            if let Some(s) = self.strands.get_mut(&w) {
                s.state = StrandState::Ready;
                s.waiting_on = None;
                self.ready.push(w);
            }
        }
    }

    /// Advance a strand's chronon by `ticks` and expire its lends.
    pub fn tick(&mut self, id: StrandId, ticks: u64) {
        if let Some(s) = self.strands.get_mut(&id) {
            s.chronon += ticks;
        }
        self.process_lends(id);
    }

    // ------------------------------------------------------------------
    // Join and the deadlock walk
    // ------------------------------------------------------------------

    /// Walk the wait chain starting at `target`; true when it reaches
    /// `waiter`. Join edges and mutex-holder edges walk the same way.
    fn would_deadlock(&self, waiter: StrandId, target: StrandId) -> bool {
        let mut cur = Some(target);
        let mut hops = 0;
        while let Some(id) = cur {
            if id == waiter {
                return true;
            }
            hops += 1;
            if hops > self.strands.len() + 1 {
                return true; // a cycle not involving the waiter; refuse anyway
            }
            let Some(s) = self.strands.get(&id) else {
                return false;
            };
            cur = s.waiting_on.or_else(|| {
                s.blocked_on_mutex
                    .and_then(|m| self.mutexes.get(&m))
                    .and_then(|m| m.holder)
            });
        }
        false
    }

    /// Join on another strand. RUNNING -> WAITING on contention.
    pub fn join(&mut self, waiter: StrandId, target: StrandId) -> JoinOutcome {
        if let Some(t) = self.strands.get(&target) {
            if t.state == StrandState::Terminated {
                return JoinOutcome::Done(t.exit_code);
            }
        } else {
            return JoinOutcome::Done(-1);
        }
        if self.would_deadlock(waiter, target) {
            tracing::warn!(waiter, target, "join refused: wait cycle");
            return JoinOutcome::DeadlockRefused;
        }
        if let Some(w) = self.strands.get_mut(&waiter) {
            w.state = StrandState::Waiting;
            w.waiting_on = Some(target);
        }
        JoinOutcome::Waiting
    }

    // ------------------------------------------------------------------
    // Capability table
    // ------------------------------------------------------------------

    /// Place a capability in a slot as OWNED.
    pub fn cap_store(&mut self, id: StrandId, slot: usize, cap: Capability) -> bool {
        let Some(strand) = self.strands.get_mut(&id) else {
            return false;
        };
        if slot >= CAP_SLOTS || strand.caps[slot].status != SlotStatus::Void {
            tracing::warn!(strand = id, slot, "cap_store into occupied slot");
            return false;
        }
        strand.caps[slot] = CapSlot {
            cap,
            status: SlotStatus::Owned,
            lender: 0,
            timeout_tick: 0,
        };
        strand.cap_count += 1;
        true
    }

    /// Move an OWNED capability to another strand; the source slot VOIDs.
    /// The move happens-before any use by the receiver because nothing
    /// else runs in between under cooperative scheduling.
    pub fn grant(&mut self, from: StrandId, src: usize, to: StrandId, dst: usize) -> bool {
        let cap = {
            let Some(source) = self.strands.get(&from) else {
                return false;
            };
            if src >= CAP_SLOTS || source.caps[src].status != SlotStatus::Owned {
                tracing::warn!(strand = from, slot = src, "grant needs an OWNED source");
                return false;
            }
            source.caps[src].cap
        };
        {
            let Some(dest) = self.strands.get_mut(&to) else {
                return false;
            };
            if dst >= CAP_SLOTS || dest.caps[dst].status != SlotStatus::Void {
                return false;
            }
            dest.caps[dst] = CapSlot {
                cap,
                status: SlotStatus::Owned,
                lender: 0,
                timeout_tick: 0,
            };
            dest.cap_count += 1;
        }
        let source = self.strands.get_mut(&from).expect("source exists");
        source.caps[src] = CapSlot::EMPTY;
        source.cap_count -= 1;
        true
    }

    /// Lend an OWNED capability: source becomes LENT, destination becomes
    /// BORROWED carrying the lender id and the expiry tick.
    pub fn lend(
        &mut self,
        from: StrandId,
        src: usize,
        to: StrandId,
        dst: usize,
        timeout_tick: u64,
    ) -> bool {
        let cap = {
            let Some(source) = self.strands.get(&from) else {
                return false;
            };
            if src >= CAP_SLOTS || source.caps[src].status != SlotStatus::Owned {
                tracing::warn!(strand = from, slot = src, "lend needs an OWNED source");
                return false;
            }
            source.caps[src].cap
        };
        {
            let Some(dest) = self.strands.get_mut(&to) else {
                return false;
            };
            if dst >= CAP_SLOTS || dest.caps[dst].status != SlotStatus::Void {
                return false;
            }
            dest.caps[dst] = CapSlot {
                cap,
                status: SlotStatus::Borrowed,
                lender: from,
                timeout_tick,
            };
            dest.cap_count += 1;
        }
        let source = self.strands.get_mut(&from).expect("source exists");
        source.caps[src].status = SlotStatus::Lent;
        true
    }

    /// Take a lent capability back early. Borrowers' copies are dead from
    /// this tick; `process_lends` collects them.
    pub fn revoke(&mut self, from: StrandId, src: usize) -> bool {
        let cap = {
            let Some(source) = self.strands.get_mut(&from) else {
                return false;
            };
            if src >= CAP_SLOTS || source.caps[src].status != SlotStatus::Lent {
                tracing::warn!(strand = from, slot = src, "revoke needs a LENT source");
                return false;
            }
            source.caps[src].status = SlotStatus::Owned;
            source.caps[src].cap
        };
        // Expire every borrowed copy immediately.
        for strand in self.strands.values_mut() {
            for cslot in strand.caps.iter_mut() {
                if cslot.status == SlotStatus::Borrowed
                    && cslot.lender == from
                    && cslot.cap == cap
                {
                    cslot.timeout_tick = 0;
                }
            }
        }
        true
    }

    /// Give a borrowed capability back: the borrower slot VOIDs and the
    /// lender's LENT slot returns to OWNED.
    pub fn return_borrowed(&mut self, id: StrandId, slot: usize) -> bool {
        let (lender, cap) = {
            let Some(strand) = self.strands.get(&id) else {
                return false;
            };
            if slot >= CAP_SLOTS || strand.caps[slot].status != SlotStatus::Borrowed {
                return false;
            }
            (strand.caps[slot].lender, strand.caps[slot].cap)
        };
        {
            let strand = self.strands.get_mut(&id).expect("borrower exists");
            strand.caps[slot] = CapSlot::EMPTY;
            strand.cap_count -= 1;
        }
        if let Some(owner) = self.strands.get_mut(&lender) {
            for cslot in owner.caps.iter_mut() {
                if cslot.status == SlotStatus::Lent && cslot.cap == cap {
                    cslot.status = SlotStatus::Owned;
                    break;
                }
            }
        }
        true
    }

    /// Expire borrowed slots whose timeout passed, judged against both the
    /// borrower's clock and the lender's (the clock the lend was minted
    /// from). Expired slots VOID and the lender's slot returns to OWNED.
    pub fn process_lends(&mut self, id: StrandId) {
        let borrower_chronon = match self.strands.get(&id) {
            Some(s) => s.chronon,
            None => return,
        };
        let mut restored: Vec<(StrandId, Capability)> = Vec::new();
        {
            let lender_clocks: HashMap<StrandId, u64> = self
                .strands
                .values()
                .map(|s| (s.id, s.chronon))
                .collect();
            let Some(strand) = self.strands.get_mut(&id) else {
                return;
            };
            for cslot in strand.caps.iter_mut() {
                if cslot.status != SlotStatus::Borrowed {
                    continue;
                }
                let lender_chronon =
                    lender_clocks.get(&cslot.lender).copied().unwrap_or(u64::MAX);
                if borrower_chronon > cslot.timeout_tick || lender_chronon > cslot.timeout_tick
                {
                    tracing::debug!(
                        strand = id,
                        lender = cslot.lender,
                        "borrowed capability expired"
                    );
                    restored.push((cslot.lender, cslot.cap));
                    *cslot = CapSlot::EMPTY;
                    strand.cap_count -= 1;
                }
            }
        }
        for (lender, cap) in restored {
            if let Some(owner) = self.strands.get_mut(&lender) {
                for cslot in owner.caps.iter_mut() {
                    if cslot.status == SlotStatus::Lent && cslot.cap == cap {
                        cslot.status = SlotStatus::Owned;
                        break;
                    }
                }
            }
        }
    }

    /// The capability in a slot, VOID when the slot is not readable.
    pub fn cap_in_slot(&self, id: StrandId, slot: usize) -> Capability {
        let Some(strand) = self.strands.get(&id) else {
            return Capability::VOID;
        };
        if slot >= CAP_SLOTS {
            return Capability::VOID;
        }
        match strand.caps[slot].status {
            SlotStatus::Owned | SlotStatus::Borrowed | SlotStatus::Lent => strand.caps[slot].cap,
            SlotStatus::Void => Capability::VOID,
        }
    }

    // ------------------------------------------------------------------
    // Mutexes
    // ------------------------------------------------------------------

    pub fn mutex_create(&mut self) -> MutexId {
        let id = self.next_mutex_id;
        self.next_mutex_id += 1;
        // One token word per mutex; the capability is the token.
        let base = self
            .token_arena
            .alloc(8)
            .expect("token arena exhausted");
        let token = self
            .token_arena
            .derive(base, 8, Perm::READ)
            .expect("token derivation");
        self.mutexes.insert(
            id,
            MutexRecord {
                token,
                holder: None,
                holder_slot: 0,
                wait_queue: Vec::new(),
            },
        );
        id
    }

    /// RUNNING -> BLOCKED on contention. The token capability lands in the
    /// caller's table on success.
    pub fn mutex_acquire(&mut self, mutex: MutexId, id: StrandId) -> AcquireOutcome {
        let Some(record) = self.mutexes.get(&mutex) else {
            return AcquireOutcome::DeadlockRefused;
        };
        match record.holder {
            None => {
                let token = record.token;
                let slot = match self.strands.get(&id).and_then(|s| s.free_slot()) {
                    Some(s) => s,
                    None => return AcquireOutcome::DeadlockRefused,
                };
                self.cap_store(id, slot, token);
                let record = self.mutexes.get_mut(&mutex).expect("mutex exists");
                record.holder = Some(id);
                record.holder_slot = slot;
                AcquireOutcome::Acquired(slot)
            }
            Some(holder) if holder == id => AcquireOutcome::Acquired(record.holder_slot),
            Some(holder) => {
                // Holder chain walk, same refusal rule as join.
                if self.would_deadlock(id, holder) {
                    tracing::warn!(strand = id, mutex, "acquire refused: wait cycle");
                    return AcquireOutcome::DeadlockRefused;
                }
                let record = self.mutexes.get_mut(&mutex).expect("mutex exists");
                record.wait_queue.push(id);
                if let Some(s) = self.strands.get_mut(&id) {
                    s.state = StrandState::Blocked;
                    s.blocked_on_mutex = Some(mutex);
                }
                AcquireOutcome::Blocked
            }
        }
    }

    /// Clear the holder's token slot and hand the token straight to the
    /// head of the wait queue.
    pub fn mutex_release(&mut self, mutex: MutexId, id: StrandId) -> bool {
        let (token, holder_slot) = {
            let Some(record) = self.mutexes.get(&mutex) else {
                return false;
            };
            if record.holder != Some(id) {
                tracing::warn!(strand = id, mutex, "release by non-holder");
                return false;
            }
            (record.token, record.holder_slot)
        };
        if let Some(s) = self.strands.get_mut(&id) {
            if s.caps[holder_slot].status == SlotStatus::Owned {
                s.caps[holder_slot] = CapSlot::EMPTY;
                s.cap_count -= 1;
            }
        }

        let next = {
            let record = self.mutexes.get_mut(&mutex).expect("mutex exists");
            record.holder = None;
            if record.wait_queue.is_empty() {
                None
            } else {
                Some(record.wait_queue.remove(0))
            }
        };
        if let Some(next_id) = next {
            // Direct handoff: the next holder gets the token and wakes.
            let slot = self
                .strands
                .get(&next_id)
                .and_then(|s| s.free_slot())
                .unwrap_or(0);
            self.cap_store(next_id, slot, token);
            let record = self.mutexes.get_mut(&mutex).expect("mutex exists");
            record.holder = Some(next_id);
            record.holder_slot = slot;
            if let Some(s) = self.strands.get_mut(&next_id) {
                s.state = StrandState::Ready;
                s.blocked_on_mutex = None;
                self.ready.push(next_id);
            }
        }
        true
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn exits(code: i64) -> StrandFn {
        Box::new(move |_, _| Quantum::Exit(code))
    }

    #[test]
    #[serial]
    fn lifecycle_and_exit_code() {
        let mut sched = Scheduler::new();
        let a = sched.create(exits(42));
        assert_eq!(sched.strand(a).unwrap().state, StrandState::Nascent);
        sched.start(a);
        assert_eq!(sched.strand(a).unwrap().state, StrandState::Ready);
        sched.run();
        let s = sched.strand(a).unwrap();
        assert_eq!(s.state, StrandState::Terminated);
        assert_eq!(s.exit_code, 42);
    }

    #[test]
    #[serial]
    fn invalid_start_is_a_noop() {
        let mut sched = Scheduler::new();
        let a = sched.create(exits(0));
        sched.start(a);
        sched.run();
        // Starting a terminated strand changes nothing.
        sched.start(a);
        assert_eq!(sched.strand(a).unwrap().state, StrandState::Terminated);
    }

    #[test]
    #[serial]
    fn yield_ticks_chronon_and_requeues() {
        let mut sched = Scheduler::new();
        let a = sched.create(Box::new(|sched, id| {
            let me = sched.strand(id).unwrap();
            if me.yields < 3 {
                Quantum::Yield
            } else {
                Quantum::Exit(0)
            }
        }));
        sched.start(a);
        sched.run();
        let s = sched.strand(a).unwrap();
        assert_eq!(s.yields, 3);
        assert_eq!(s.chronon, 3);
        assert_eq!(s.state, StrandState::Terminated);
    }

    #[test]
    #[serial]
    fn current_strand_is_set_during_quanta() {
        let mut sched = Scheduler::new();
        let a = sched.create(Box::new(|_, id| {
            assert_eq!(current_strand(), id);
            Quantum::Exit(0)
        }));
        sched.start(a);
        sched.run();
        assert_eq!(current_strand(), 0);
    }

    #[test]
    #[serial]
    fn counters_track_lifecycles() {
        let mut sched = Scheduler::new();
        let ids: Vec<_> = (0..5).map(|i| sched.create(exits(i))).collect();
        for id in &ids {
            sched.start(*id);
        }
        sched.run();
        assert_eq!(sched.stats.total_spawned, 5);
        assert_eq!(sched.stats.total_completed, 5);
        assert!(sched.stats.peak_live >= 5);
    }

    #[test]
    #[serial]
    fn grant_moves_ownership() {
        let mut sched = Scheduler::new();
        let a = sched.create(exits(0));
        let b = sched.create(exits(0));
        let cap = {
            let band = &mut sched.strand_mut(a).unwrap().band;
            let base = band.alloc(64).unwrap();
            band.derive(base, 64, Perm::READ | Perm::WRITE).unwrap()
        };
        assert!(sched.cap_store(a, 0, cap));
        assert!(sched.grant(a, 0, b, 2));
        assert_eq!(sched.strand(a).unwrap().caps[0].status, SlotStatus::Void);
        assert_eq!(sched.strand(b).unwrap().caps[2].status, SlotStatus::Owned);
        assert_eq!(sched.cap_in_slot(b, 2), cap);
        // Granting again from the emptied slot fails.
        assert!(!sched.grant(a, 0, b, 3));
    }

    #[test]
    #[serial]
    fn lend_with_timeout_expires() {
        let mut sched = Scheduler::new();
        let a = sched.create(exits(0));
        let b = sched.create(exits(0));
        let cap = {
            let band = &mut sched.strand_mut(a).unwrap().band;
            let base = band.alloc(64).unwrap();
            let cap = band.derive(base, 64, Perm::READ | Perm::WRITE).unwrap();
            cap.store_u64(band, 0, 77);
            cap
        };
        sched.cap_store(a, 3, cap);

        let now = sched.strand(a).unwrap().chronon;
        assert!(sched.lend(a, 3, b, 3, now + 10));
        assert_eq!(sched.strand(a).unwrap().caps[3].status, SlotStatus::Lent);
        assert_eq!(sched.strand(b).unwrap().caps[3].status, SlotStatus::Borrowed);

        // At tick +5 the borrow still reads.
        sched.tick(b, 5);
        let borrowed = sched.cap_in_slot(b, 3);
        assert!(!borrowed.is_void());
        let band = &sched.strand(a).unwrap().band;
        assert_eq!(borrowed.load_u64(band, 0), 77);

        // The lender ticks past the timeout; the borrow expires.
        sched.tick(a, 20);
        sched.process_lends(b);
        assert!(sched.cap_in_slot(b, 3).is_void());
        assert_eq!(sched.strand(a).unwrap().caps[3].status, SlotStatus::Owned);
    }

    #[test]
    #[serial]
    fn revoke_restores_ownership_immediately() {
        let mut sched = Scheduler::new();
        let a = sched.create(exits(0));
        let b = sched.create(exits(0));
        let cap = {
            let band = &mut sched.strand_mut(a).unwrap().band;
            let base = band.alloc(16).unwrap();
            band.derive(base, 16, Perm::READ).unwrap()
        };
        sched.cap_store(a, 0, cap);
        assert!(sched.lend(a, 0, b, 0, u64::MAX));
        assert!(sched.revoke(a, 0));
        assert_eq!(sched.strand(a).unwrap().caps[0].status, SlotStatus::Owned);
        // The borrower's copy dies at its next lend processing.
        sched.process_lends(b);
        assert!(sched.cap_in_slot(b, 0).is_void());
    }

    #[test]
    #[serial]
    fn return_borrowed_restores_lender() {
        let mut sched = Scheduler::new();
        let a = sched.create(exits(0));
        let b = sched.create(exits(0));
        let cap = {
            let band = &mut sched.strand_mut(a).unwrap().band;
            let base = band.alloc(16).unwrap();
            band.derive(base, 16, Perm::READ).unwrap()
        };
        sched.cap_store(a, 1, cap);
        sched.lend(a, 1, b, 4, u64::MAX);
        assert!(sched.return_borrowed(b, 4));
        assert_eq!(sched.strand(b).unwrap().caps[4].status, SlotStatus::Void);
        assert_eq!(sched.strand(a).unwrap().caps[1].status, SlotStatus::Owned);
    }

    #[test]
    #[serial]
    fn join_wakes_on_termination() {
        let mut sched = Scheduler::new();
        let worker = sched.create(Box::new(|sched, id| {
            let me = sched.strand(id).unwrap();
            if me.yields < 2 {
                Quantum::Yield
            } else {
                Quantum::Exit(7)
            }
        }));
        let waiter = sched.create(Box::new(move |sched, id| {
            match sched.join(id, worker) {
                JoinOutcome::Done(code) => Quantum::Exit(code),
                JoinOutcome::Waiting => Quantum::Blocked,
                JoinOutcome::DeadlockRefused => Quantum::Exit(-2),
            }
        }));
        sched.start(worker);
        sched.start(waiter);
        sched.run();
        assert_eq!(sched.strand(waiter).unwrap().exit_code, 7);
    }

    #[test]
    #[serial]
    fn join_cycle_is_refused() {
        let mut sched = Scheduler::new();
        let a = sched.create(exits(0));
        let b = sched.create(exits(0));
        // Fake: a already waits on b.
        sched.strand_mut(a).unwrap().state = StrandState::Waiting;
        sched.strand_mut(a).unwrap().waiting_on = Some(b);
        assert_eq!(sched.join(b, a), JoinOutcome::DeadlockRefused);
    }

    #[test]
    #[serial]
    fn mutex_contention_and_direct_handoff() {
        let mut sched = Scheduler::new();
        let a = sched.create(exits(0));
        let b = sched.create(exits(0));
        let m = sched.mutex_create();

        let AcquireOutcome::Acquired(slot) = sched.mutex_acquire(m, a) else {
            panic!("first acquire must succeed");
        };
        // The token is a readable capability in a's table.
        assert_eq!(sched.strand(a).unwrap().caps[slot].status, SlotStatus::Owned);

        assert_eq!(sched.mutex_acquire(m, b), AcquireOutcome::Blocked);
        assert_eq!(sched.strand(b).unwrap().state, StrandState::Blocked);

        assert!(sched.mutex_release(m, a));
        // Handoff: b holds the token now and is READY, a's slot cleared.
        assert_eq!(sched.strand(a).unwrap().caps[slot].status, SlotStatus::Void);
        assert_eq!(sched.strand(b).unwrap().state, StrandState::Ready);
        let b_slot = sched
            .strand(b)
            .unwrap()
            .caps
            .iter()
            .position(|c| c.status == SlotStatus::Owned)
            .expect("token slot");
        assert!(!sched.cap_in_slot(b, b_slot).is_void());
    }

    #[test]
    #[serial]
    fn mutex_hold_cycle_is_refused() {
        let mut sched = Scheduler::new();
        let a = sched.create(exits(0));
        let b = sched.create(exits(0));
        let m1 = sched.mutex_create();
        let m2 = sched.mutex_create();
        assert!(matches!(
            sched.mutex_acquire(m1, a),
            AcquireOutcome::Acquired(_)
        ));
        assert!(matches!(
            sched.mutex_acquire(m2, b),
            AcquireOutcome::Acquired(_)
        ));
        // b blocks on m1 (held by a)
        assert_eq!(sched.mutex_acquire(m1, b), AcquireOutcome::Blocked);
        // a trying to take m2 (held by b, which waits on a) closes a cycle.
        assert_eq!(sched.mutex_acquire(m2, a), AcquireOutcome::DeadlockRefused);
    }

    #[test]
    #[serial]
    fn band_reset_voids_outstanding_caps() {
        let mut sched = Scheduler::new();
        let a = sched.create(exits(0));
        let cap = {
            let band = &mut sched.strand_mut(a).unwrap().band;
            let base = band.alloc(32).unwrap();
            let cap = band.derive(base, 32, Perm::READ | Perm::WRITE).unwrap();
            cap.store_u64(band, 0, 5);
            cap
        };
        let band = &sched.strand(a).unwrap().band;
        assert_eq!(cap.load_u64(band, 0), 5);
        sched.strand_mut(a).unwrap().band.reset();
        let band = &sched.strand(a).unwrap().band;
        assert_eq!(cap.load_u64(band, 0), seraph_core::VOID_U64);
    }

    #[test]
    #[serial]
    fn predictive_priority_adjusts() {
        let mut sched = Scheduler::new();
        // Target of zero ticks with every quantum measuring at least one
        // tick: the gradient pushes priority down over time.
        let id = sched.create_with_stats(
            Box::new(|sched, id| {
                let me = sched.strand_mut(id).unwrap();
                me.chronon += 120; // long quantum, past the cooldown
                if me.yields < 4 {
                    Quantum::Yield
                } else {
                    Quantum::Exit(0)
                }
            }),
            Scalar::ZERO,
        );
        // Steepen the learning so a few quanta are enough.
        sched
            .strand_mut(id)
            .unwrap()
            .stats
            .as_mut()
            .unwrap()
            .learning_rate = Scalar::from_parts(0, 1 << 63); // 0.5
        sched.start(id);
        sched.run();
        assert!(
            sched.strand(id).unwrap().priority < 0,
            "priority should have stepped down, got {}",
            sched.strand(id).unwrap().priority
        );
    }
}
