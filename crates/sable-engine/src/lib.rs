//! Sable VM engine
//!
//! This crate executes the bytecode produced by the Sable compiler:
//! - the fetch-decode-execute interpreter with frames, catch tables,
//!   member lookup and dynamic dispatch
//! - the runtime scheduler: main-thread task queue, timers, intervals and
//!   the blocking worker pool
//! - the native interface: value construction through [`ManagedContext`],
//!   `CFunction` registration and primitive-class installation

pub mod scheduler;
pub mod vm;

pub use scheduler::worker::{AsyncTask, AsyncTaskResult, WorkerJob, WorkerOutput, WorkerPool};
pub use scheduler::{TimerId, VmTask};
pub use vm::context::{RunFlags, VmContext};
pub use vm::error::{NativeError, VmError};
pub use vm::machine::{NativeFn, Vm};
pub use vm::managed::ManagedContext;
pub use vm::primitives::PrimitiveRegistry;
