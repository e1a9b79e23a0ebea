//! Device drivers module
//!
//! Only the ASI test driver lives here; it is the control channel used to
//! inspect and exercise address space isolation.

pub mod asi;

pub use asi::{AsiDriver, AsiDriverConfig, IoctlCmd, RunResult};
