//! Built-in task executors

pub mod simulated;

pub use simulated::SimulatedExecutor;
