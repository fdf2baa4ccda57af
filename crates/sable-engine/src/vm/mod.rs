//! The virtual machine: state, interpreter and native interface

pub mod call;
pub mod context;
pub mod error;
pub mod exception;
pub mod interpreter;
pub mod machine;
pub mod managed;
pub mod member;
pub mod operators;
pub mod primitives;

pub use context::{RunFlags, VmContext};
pub use error::{NativeError, VmError};
pub use interpreter::InstructionProfile;
pub use machine::{NativeFn, Vm};
pub use managed::ManagedContext;
pub use primitives::PrimitiveRegistry;
