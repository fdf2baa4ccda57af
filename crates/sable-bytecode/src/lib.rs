//! Bytecode instruction set and block artifacts for the Sable VM
//!
//! This crate defines the instruction encoding shared between the compiler
//! and the virtual machine:
//! - [`Opcode`] — single-byte opcodes with fixed-width little-endian payloads
//! - [`BlockBuilder`] — append-only emitter with label resolution
//! - [`BlockReader`] — payload decoding over a finished byte buffer
//! - [`BlockArtifact`] — the compiled artifact (code, immediate constants,
//!   child blocks) handed to the VM for registration

pub mod block;
pub mod opcode;

pub use block::{BlockArtifact, BlockBuilder, BlockReader, Constant, Label};
pub use opcode::Opcode;
