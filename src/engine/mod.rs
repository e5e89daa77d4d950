//! Timing and control flow: the clock seam, window arithmetic, polling
//! cadence, the per-session state machine and the restarting runner.

pub mod cadence;
pub mod clock;
pub mod flow;
pub mod runner;
pub mod schedule;

pub use flow::Engine;
pub use runner::{Runner, SessionFactory};
