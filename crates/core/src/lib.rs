//! SERAPH core value model
//!
//! Shared foundation for the Seraphim compiler and the runtime cores:
//!
//! - [`vbit`]: tri-state logic and the per-width VOID sentinel patterns
//! - [`scalar`]: Q64.64 signed fixed-point arithmetic
//! - [`galactic`]: hyper-dual quaternions (primal plus three tangent channels)
//! - [`arena`]: bump allocation with a generation counter
//! - [`capability`]: bounds/generation/permission gated memory access
//!
//! Everything here is `no_std`-shaped in spirit (no I/O, no globals) but
//! built against std for the host-side compiler and tooling.

pub mod arena;
pub mod capability;
pub mod galactic;
pub mod scalar;
pub mod vbit;

pub use arena::{Arena, ArenaFlags};
pub use capability::{CapFault, Capability, Perm};
pub use galactic::Galactic;
pub use scalar::Scalar;
pub use vbit::{VOID_U8, VOID_U16, VOID_U32, VOID_U64, Vbit};
