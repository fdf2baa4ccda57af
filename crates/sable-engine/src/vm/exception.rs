//! Exception throwing and catch-stack unwinding
//!
//! Throws are modeled as explicit unwinding over the catch-table stack:
//! truncate the operand stack to the table's recorded depth, pop frames
//! until the table's frame is current, jump to the handler, pop the table
//! and push the payload. Host-language unwinding is never used.

use crate::vm::error::{OpResult, Thrown};
use crate::vm::machine::{cell_mut, cell_ref, Vm};
use sable_core::Value;
use std::io::Write;

impl Vm {
    /// Throw a string message as a user-level exception
    pub(crate) fn throw_message(&mut self, message: &str) -> OpResult {
        let payload = self.create_string(message);
        self.throw_exception(payload)
    }

    /// Throw `payload`, unwinding to the nearest catch table
    ///
    /// With no table on the catch stack the exception is uncaught: the VM
    /// writes the payload and a stack trace to the error stream and aborts
    /// the current task.
    pub(crate) fn throw_exception(&mut self, payload: Value) -> OpResult {
        self.last_exception = payload;

        if !self.catchstack.is_pointer() {
            let rendered = self.to_display(payload);
            let _ = writeln!(self.context.err, "uncaught exception: {rendered}");
            self.write_stacktrace();
            self.failed_task = true;
            self.halted = true;
            self.ip = None;
            return Err(Thrown);
        }

        let table = self.catchstack;
        let (address, stacksize, table_frame, parent) = {
            let data = unsafe { cell_ref(table) }
                .as_catchtable()
                .expect("catchtable cell");
            (data.address, data.stacksize, data.frame, data.parent)
        };

        // Restore the operand stack to the depth captured at registration
        self.stack.truncate(stacksize);

        // Pop frames until the table's frame is current again
        while self.frames.is_pointer() && self.frames != table_frame {
            let frame = self.frames;
            let data = unsafe { cell_mut(frame) }.as_frame_mut().expect("frame cell");
            // An unwound generator activation can never be resumed
            if data.generator.is_pointer() {
                let generator = unsafe { cell_mut(data.generator) }
                    .as_generator_mut()
                    .expect("generator cell");
                generator.finished = true;
                generator.running = false;
                generator.frame = Value::null();
            }
            self.frames = data.parent;
            self.frame_depth -= 1;
        }

        self.ip = Some(address);
        self.catchstack = parent;
        if self.frames.is_pointer() {
            unsafe { cell_mut(self.frames) }
                .as_frame_mut()
                .expect("frame cell")
                .catchtable = parent;
        }

        // The handler receives the payload on the restored stack
        self.push_stack(payload);
        Err(Thrown)
    }
}
