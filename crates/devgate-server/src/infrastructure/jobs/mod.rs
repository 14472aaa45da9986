//! Job infrastructure: runs jobs as external processes.

pub mod process_executor;

pub use process_executor::ProcessJobExecutor;
