//! numa-emu - NUMA local-memory emulation and locality monitoring
//!
//! This library runs a program under a NUMA placement policy, optionally
//! shrinking the memory it can get on the near node, and reports how its
//! resident pages are split between the near and far node over time. Logs
//! from several supervised processes can be merged into one-second windows
//! with [`aggregate`].

pub mod aggregate;
pub mod capture;
pub mod cli;
pub mod clock;
pub mod error;
pub mod glob;
pub mod phase;
pub mod placement;
pub mod scheduler;
pub mod session;
pub mod size;
pub mod stats;
pub mod supervisor;

pub use error::{EmuError, Result};
