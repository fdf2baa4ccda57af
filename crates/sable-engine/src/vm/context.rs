//! Run configuration and injected streams

use sable_core::CompilerArtifacts;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// Floor applied to the worker-pool size unless overridden
pub const DEFAULT_WORKER_FLOOR: usize = 32;

/// Maximum frame depth before the VM aborts
pub const DEFAULT_FRAME_LIMIT: usize = 4096;

/// Behavior toggles supplied by the frontend
#[derive(Debug, Clone)]
pub struct RunFlags {
    /// Record per-opcode execution counts and average durations
    pub instruction_profile: bool,
    /// Trace every executed instruction to the error stream
    pub trace_opcodes: bool,
    /// Trace catch-table pushes and pops
    pub trace_catchtables: bool,
    /// Trace frame entry and exit
    pub trace_frames: bool,
    /// Trace garbage collections
    pub trace_gc: bool,
    /// Include raw block addresses and offsets in traces
    pub verbose_addresses: bool,
    /// Run the worker pool with a single thread
    pub single_worker: bool,
    /// Lower bound on the worker-pool size
    pub worker_floor: usize,
    /// Frame depth limit; exceeding it is fatal
    pub frame_limit: usize,
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            instruction_profile: false,
            trace_opcodes: false,
            trace_catchtables: false,
            trace_frames: false,
            trace_gc: false,
            verbose_addresses: false,
            single_worker: false,
            worker_floor: DEFAULT_WORKER_FLOOR,
            frame_limit: DEFAULT_FRAME_LIMIT,
        }
    }
}

/// Everything the VM consumes from its environment: the compiler-owned
/// interned tables, run flags, and the process streams
pub struct VmContext {
    pub artifacts: Arc<CompilerArtifacts>,
    pub flags: RunFlags,
    pub input: Box<dyn BufRead + Send>,
    pub out: Box<dyn Write + Send>,
    pub err: Box<dyn Write + Send>,
}

impl VmContext {
    /// Context wired to the process streams
    pub fn new(artifacts: Arc<CompilerArtifacts>, flags: RunFlags) -> Self {
        Self {
            artifacts,
            flags,
            input: Box::new(io::BufReader::new(io::stdin())),
            out: Box::new(io::stdout()),
            err: Box::new(io::stderr()),
        }
    }

    /// Context with caller-supplied streams
    pub fn with_streams(
        artifacts: Arc<CompilerArtifacts>,
        flags: RunFlags,
        input: Box<dyn BufRead + Send>,
        out: Box<dyn Write + Send>,
        err: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            artifacts,
            flags,
            input,
            out,
            err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        let flags = RunFlags::default();
        assert!(!flags.trace_opcodes);
        assert!(!flags.single_worker);
        assert_eq!(flags.worker_floor, DEFAULT_WORKER_FLOOR);
        assert_eq!(flags.frame_limit, DEFAULT_FRAME_LIMIT);
    }
}
