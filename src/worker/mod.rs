//! Job execution on the local node.
//!
//! - [`engine`]: attempt loop with retry backoff, spawned per build
//! - [`execution`]: handle of a running build held by the reconciler
//! - [`executor`]: executor traits, selection and job requirement matching
//! - [`interpolate`]: `@variable@` substitution in job definitions
//! - [`process`]: built-in executor running steps as local processes
//! - [`retry`]: retry condition and backoff
//!
//! # Security Note
//!
//! [`ProcessExecutor`] runs commands directly through the configured shell
//! without sandboxing.

pub mod engine;
pub mod execution;
pub mod executor;
pub mod interpolate;
pub mod process;
pub mod retry;

pub use execution::{ExecutionOutcome, JobExecution};
pub use executor::{
    ExecutorDiscoverer, ExecutorRegistry, JobExecutor, JobMatch, JobRunnable, JobRuntime,
    MatchTarget, ResolvedExecutor,
};
pub use process::{ProcessDiscoverer, ProcessExecutor};
