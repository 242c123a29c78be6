//! SERAPH runtime cores
//!
//! The two runtime collaborators the compiler's output drives through
//! fixed register conventions:
//!
//! - [`scheduler`]: capability-isolated cooperative strands with
//!   lend/grant/revoke tables, capability-token mutexes and the deadlock
//!   walk; [`predictor`] adds Galactic predictive scheduling on top.
//! - [`atlas`]: the mmap-backed single-level store with its genesis
//!   header, generation table and root-pointer transactions.
//!
//! Nothing here spawns OS threads: a scheduler owns its strands
//! exclusively, and the only thread-local is the current-strand slot, so
//! an embedder may run one scheduler per OS thread.

pub mod atlas;
pub mod predictor;
pub mod scheduler;
pub mod strand;

pub use atlas::{Atlas, AtlasError, SERAPH_ATLAS_MAGIC, TxState};
pub use predictor::GalacticExecStats;
pub use scheduler::{AcquireOutcome, JoinOutcome, MutexId, Scheduler, current_strand};
pub use strand::{CAP_SLOTS, CapSlot, Quantum, SlotStatus, Strand, StrandId, StrandState};
