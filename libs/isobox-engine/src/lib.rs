pub mod batch;
pub mod capacity;
pub mod cgroup;
pub mod compile_cache;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod isolation;
pub mod job;
pub mod limits;
pub mod linux;
pub mod output;
pub mod pool;
pub mod runtime;
pub mod sandbox;
pub mod setup;

#[cfg(test)]
mod sandbox_tests;
#[cfg(test)]
mod testing;

pub use capacity::{Admission, Capacity};
pub use error::{CapacityError, JobError, SandboxError, SetupError};
pub use executor::JobExecutor;
pub use linux::{LinuxSandbox, LinuxSandboxConfig};
pub use pool::PooledSandbox;
pub use runtime::{RuntimeRegistry, RuntimeSpec};
pub use sandbox::Sandbox;
