//! Strand records
//!
//! A strand is a capability-isolated cooperative thread: a private bump
//! arena (its band), a fixed-size capability table, scheduling state and
//! counters. Strands execute as quantum step functions driven by the
//! scheduler; a quantum ends by yielding, blocking or exiting.

use crate::predictor::GalacticExecStats;
use seraph_core::{Arena, Capability};

pub type StrandId = u64;

/// Capability table size per strand.
pub const CAP_SLOTS: usize = 16;

/// Default band capacity.
pub const DEFAULT_BAND_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrandState {
    Nascent,
    Ready,
    Running,
    Blocked,
    Waiting,
    Terminated,
}

/// Status of one capability-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Empty slot.
    Void,
    Owned,
    /// Lent out; comes back via revoke, timeout or return.
    Lent,
    /// Held on loan from `lender` until `timeout_tick`.
    Borrowed,
}

#[derive(Debug, Clone, Copy)]
pub struct CapSlot {
    pub cap: Capability,
    pub status: SlotStatus,
    pub lender: StrandId,
    pub timeout_tick: u64,
}

impl CapSlot {
    pub const EMPTY: CapSlot = CapSlot {
        cap: Capability::VOID,
        status: SlotStatus::Void,
        lender: 0,
        timeout_tick: 0,
    };
}

/// What a quantum step reports back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantum {
    /// Cooperative yield: back to READY, chronon ticks by one.
    Yield,
    /// The strand blocked inside the step (mutex contention or join); the
    /// blocking call already recorded the wait state.
    Blocked,
    /// Entry returned or called exit.
    Exit(i64),
}

/// A strand's step function. It receives the scheduler so it can use the
/// capability-table and mutex operations, and its own id.
pub type StrandFn = Box<dyn FnMut(&mut crate::scheduler::Scheduler, StrandId) -> Quantum>;

pub struct Strand {
    pub id: StrandId,
    pub state: StrandState,
    /// Private bump arena. Resetting it revokes every capability carved
    /// from it.
    pub band: Arena,
    pub caps: [CapSlot; CAP_SLOTS],
    pub cap_count: usize,
    pub entry: Option<StrandFn>,
    pub priority: i32,
    /// Logical time; monotone non-decreasing.
    pub chronon: u64,
    pub yields: u64,
    pub context_switches: u64,
    pub exit_code: i64,
    /// Join target, for the deadlock walk.
    pub waiting_on: Option<StrandId>,
    pub blocked_on_mutex: Option<u64>,
    /// Predictive-scheduling statistics, when enabled.
    pub stats: Option<GalacticExecStats>,
}

impl Strand {
    pub fn new(id: StrandId, entry: StrandFn) -> Self {
        Strand {
            id,
            state: StrandState::Nascent,
            band: Arena::new(DEFAULT_BAND_BYTES),
            caps: [CapSlot::EMPTY; CAP_SLOTS],
            cap_count: 0,
            entry: Some(entry),
            priority: 0,
            chronon: 0,
            yields: 0,
            context_switches: 0,
            exit_code: 0,
            waiting_on: None,
            blocked_on_mutex: None,
            stats: None,
        }
    }

    /// First free capability slot, if any.
    pub fn free_slot(&self) -> Option<usize> {
        self.caps.iter().position(|s| s.status == SlotStatus::Void)
    }

    pub fn is_done(&self) -> bool {
        self.state == StrandState::Terminated
    }
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("chronon", &self.chronon)
            .field("cap_count", &self.cap_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_strand_is_nascent() {
        let s = Strand::new(1, Box::new(|_, _| Quantum::Exit(0)));
        assert_eq!(s.state, StrandState::Nascent);
        assert_eq!(s.cap_count, 0);
        assert!(s.caps.iter().all(|c| c.status == SlotStatus::Void));
    }

    #[test]
    fn free_slot_scans_in_order() {
        let mut s = Strand::new(1, Box::new(|_, _| Quantum::Exit(0)));
        assert_eq!(s.free_slot(), Some(0));
        s.caps[0].status = SlotStatus::Owned;
        s.caps[1].status = SlotStatus::Borrowed;
        assert_eq!(s.free_slot(), Some(2));
    }
}
