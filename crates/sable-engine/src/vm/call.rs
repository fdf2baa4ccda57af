//! The call protocol
//!
//! The caller pushes the callee, an optional receiver, and the arguments;
//! `call_value` dispatches on the callee's type. User functions get a
//! fresh frame with arguments copied into the leading local slots (missing
//! arguments fill with null, extras are discarded). Natives run on the
//! calling thread with their result pushed directly. Calling a class
//! allocates an instance, initializes member properties parents-first and
//! invokes the constructor chain from the root down. Calling a generator
//! resumes its persisted frame.

use crate::vm::error::{Thrown, VmError};
use crate::vm::machine::{cell_mut, cell_ref, Vm};
use sable_core::gc::{CellData, CodePtr};
use sable_core::Value;

impl Vm {
    /// Dispatch a call over the operand stack
    ///
    /// Stack layout, deepest first: `callee, [target], arg0 .. argN`.
    /// Returns `Ok(true)` when a bytecode frame was entered and the
    /// dispatch loop should continue executing it, `Ok(false)` when the
    /// result has already been pushed.
    pub(crate) fn call_value(
        &mut self,
        argc: u32,
        with_target: bool,
        halt_after_return: bool,
    ) -> Result<bool, Thrown> {
        let argc = argc as usize;
        let extra = usize::from(with_target);
        let needed = argc + extra + 1;
        if self.stack.len() < needed {
            self.fatal(VmError::StackUnderflow);
        }
        let base = self.stack.len() - needed;
        let callee = self.stack[base];
        let target = if with_target {
            self.stack[base + 1]
        } else {
            Value::null()
        };

        if !callee.is_pointer() {
            let rendered = self.to_display(callee);
            self.stack.truncate(base);
            self.throw_message(&format!("cannot call value {rendered}"))?;
            unreachable!("throw_message always unwinds");
        }

        match unsafe { cell_ref(callee) }.data() {
            CellData::Function(_) => {
                self.call_function(callee, base, argc, extra, target, halt_after_return)?;
                Ok(true)
            }
            CellData::CFunction(_) => {
                self.call_cfunction(callee, base, argc, extra, target)?;
                Ok(false)
            }
            CellData::Class(_) => {
                self.call_class(callee, base, argc, extra)?;
                Ok(false)
            }
            CellData::Generator(_) => {
                self.call_generator(callee, base, argc, extra, halt_after_return)?;
                Ok(true)
            }
            _ => {
                let rendered = self.to_display(callee);
                self.stack.truncate(base);
                self.throw_message(&format!("cannot call value {rendered}"))?;
                unreachable!("throw_message always unwinds")
            }
        }
    }

    /// Enter a user function: build the environment, create the frame and
    /// point the instruction pointer at the body
    fn call_function(
        &mut self,
        callee: Value,
        base: usize,
        argc: usize,
        extra: usize,
        target: Value,
        halt_after_return: bool,
    ) -> Result<(), Thrown> {
        let (block, body_offset, context, decl_argc, lvarcount, needs_arguments, self_value) = {
            let f = unsafe { cell_ref(callee) }.as_function().expect("function cell");
            let self_value = if f.bound_self_set { f.bound_self } else { target };
            (
                f.block,
                f.body_offset,
                f.context,
                f.argc as usize,
                f.lvarcount as usize,
                f.needs_arguments,
                self_value,
            )
        };

        let args_base = base + 1 + extra;
        let env_len = lvarcount.max(decl_argc + usize::from(needs_arguments));
        let mut environment = vec![Value::null(); env_len];
        for i in 0..decl_argc.min(argc) {
            environment[i] = self.stack[args_base + i];
        }

        // The arguments array is created while the values are still on the
        // operand stack, then kept alive through a temporary root until
        // the frame owns it.
        let arguments_array = if needs_arguments {
            let all = self.stack[args_base..args_base + argc].to_vec();
            let array = self.create_array(all);
            environment[decl_argc] = array;
            self.heap.register_temporary(array);
            Some(array)
        } else {
            None
        };

        let frame = self.create_frame(
            self_value,
            callee,
            context,
            environment,
            self.ip,
            halt_after_return,
            Value::null(),
        );
        if let Some(array) = arguments_array {
            self.heap.unregister_temporary(array);
        }

        self.stack.truncate(base);
        unsafe { cell_mut(frame) }
            .as_frame_mut()
            .expect("frame cell")
            .stack_base = self.stack.len();
        self.ip = Some(CodePtr::new(block, body_offset));
        Ok(())
    }

    /// Invoke a native on the calling thread and push its result
    fn call_cfunction(
        &mut self,
        callee: Value,
        base: usize,
        argc: usize,
        extra: usize,
        target: Value,
    ) -> Result<(), Thrown> {
        let (native_id, decl_argc, self_value) = {
            let f = unsafe { cell_ref(callee) }
                .as_cfunction()
                .expect("cfunction cell");
            let self_value = if f.bound_self_set { f.bound_self } else { target };
            (f.native_id as usize, f.argc as usize, self_value)
        };

        let args_base = base + 1 + extra;
        let mut argv = vec![Value::null(); decl_argc];
        for i in 0..decl_argc.min(argc) {
            argv[i] = self.stack[args_base + i];
        }
        self.stack.truncate(base);

        // Arguments left the stack; keep them rooted across the native call
        for &value in &argv {
            self.heap.register_temporary(value);
        }
        self.heap.register_temporary(self_value);

        let func = self.natives.entries[native_id].func;
        let result = func(self, self_value, &argv);

        self.heap.unregister_temporary(self_value);
        for &value in &argv {
            self.heap.unregister_temporary(value);
        }

        match result {
            Ok(value) => {
                self.push_stack(value);
                Ok(())
            }
            Err(error) => {
                self.throw_message(&error.message)?;
                unreachable!("throw_message always unwinds")
            }
        }
    }

    /// Instantiate a class: allocate, initialize member properties along
    /// the chain parents-first, then run constructors from the root down
    fn call_class(
        &mut self,
        callee: Value,
        base: usize,
        argc: usize,
        extra: usize,
    ) -> Result<(), Thrown> {
        let args_base = base + 1 + extra;
        let args: Vec<Value> = self.stack[args_base..args_base + argc].to_vec();
        self.stack.truncate(base);
        for &value in &args {
            self.heap.register_temporary(value);
        }
        self.heap.register_temporary(callee);

        // Chain from the instantiated class up to the root, then reversed
        let mut chain = Vec::new();
        let mut cursor = callee;
        while cursor.is_pointer() {
            chain.push(cursor);
            cursor = unsafe { cell_ref(cursor) }
                .as_class()
                .expect("class cell")
                .parent_class;
        }
        chain.reverse();

        let object = self.create_object(callee, 4);
        self.heap.register_temporary(object);

        for &klass in &chain {
            let properties = unsafe { cell_ref(klass) }
                .as_class()
                .expect("class cell")
                .member_properties
                .clone();
            let container = &mut unsafe { cell_mut(object) }
                .as_object_mut()
                .expect("object cell")
                .container;
            for symbol in properties {
                container.insert(symbol, Value::null());
            }
        }

        let mut failed = false;
        for &klass in &chain {
            let constructor = unsafe { cell_ref(klass) }
                .as_class()
                .expect("class cell")
                .constructor;
            if constructor.is_pointer() {
                self.exec_internal(constructor, Some(object), &args);
                if self.failed_task {
                    failed = true;
                    break;
                }
            }
        }

        self.heap.unregister_temporary(object);
        self.heap.unregister_temporary(callee);
        for &value in &args {
            self.heap.unregister_temporary(value);
        }

        if failed {
            // The constructor's uncaught throw already aborted the task
            self.halted = true;
            self.ip = None;
            return Err(Thrown);
        }

        self.push_stack(object);
        Ok(())
    }

    /// Start or resume a generator
    fn call_generator(
        &mut self,
        callee: Value,
        base: usize,
        argc: usize,
        extra: usize,
        halt_after_return: bool,
    ) -> Result<(), Thrown> {
        let (started, finished, running) = {
            let g = unsafe { cell_ref(callee) }
                .as_generator()
                .expect("generator cell");
            (g.started, g.finished, g.running)
        };
        if running {
            self.stack.truncate(base);
            self.throw_message("generator is already running")?;
        }
        if finished {
            self.stack.truncate(base);
            self.throw_message("generator has already finished")?;
        }

        let args_base = base + 1 + extra;
        let args: Vec<Value> = self.stack[args_base..args_base + argc].to_vec();

        if !started {
            let (block, context, decl_argc, lvarcount) = {
                let g = unsafe { cell_ref(callee) }
                    .as_generator()
                    .expect("generator cell");
                (g.block, g.context, g.argc as usize, g.lvarcount as usize)
            };
            let env_len = lvarcount.max(decl_argc);
            let mut environment = vec![Value::null(); env_len];
            for i in 0..decl_argc.min(argc) {
                environment[i] = args[i];
            }

            let frame = self.create_frame(
                Value::null(),
                callee,
                context,
                environment,
                self.ip,
                halt_after_return,
                callee,
            );
            self.stack.truncate(base);
            unsafe { cell_mut(frame) }
                .as_frame_mut()
                .expect("frame cell")
                .stack_base = self.stack.len();

            let generator = unsafe { cell_mut(callee) }
                .as_generator_mut()
                .expect("generator cell");
            generator.started = true;
            generator.running = true;
            self.ip = Some(CodePtr::new(block, 0));
            return Ok(());
        }

        // Resume: re-link the persisted frame, restore the saved operand
        // slice and push the resume value as the result of the yield
        let resume_value = args.first().copied().unwrap_or_default();
        self.stack.truncate(base);

        let (frame, block, resume_offset, saved) = {
            let generator = unsafe { cell_mut(callee) }
                .as_generator_mut()
                .expect("generator cell");
            generator.running = true;
            let saved = std::mem::take(&mut generator.saved_stack);
            (generator.frame, generator.block, generator.resume_offset, saved)
        };
        debug_assert!(frame.is_pointer(), "resumed generator without a frame");

        {
            let data = unsafe { cell_mut(frame) }.as_frame_mut().expect("frame cell");
            data.parent = self.frames;
            data.return_address = self.ip;
            data.halt_after_return = halt_after_return;
            data.stack_base = self.stack.len();
        }
        self.frames = frame;
        self.frame_depth += 1;

        for value in saved {
            self.push_stack(value);
        }
        self.push_stack(resume_value);
        self.ip = Some(CodePtr::new(block, resume_offset));
        Ok(())
    }

    /// Run a callable to completion in a fresh top-level call
    ///
    /// Shared implementation behind `exec_function`/`exec_call` and the
    /// constructor chain. Returns null if the call failed with an uncaught
    /// throw.
    pub(crate) fn exec_internal(
        &mut self,
        callable: Value,
        target: Option<Value>,
        args: &[Value],
    ) -> Value {
        let entry_depth = self.stack.len();
        let entry_frames = self.frames;
        let entry_catchstack = self.catchstack;
        let was_halted = self.halted;

        self.push_stack(callable);
        if let Some(target) = target {
            self.push_stack(target);
        }
        for &argument in args {
            self.push_stack(argument);
        }

        match self.call_value(args.len() as u32, target.is_some(), true) {
            Ok(entered_frame) => {
                if entered_frame {
                    self.run();
                }
            }
            Err(Thrown) => {
                // A throw caught by an enclosing handler has already moved
                // the instruction pointer there; keep executing until the
                // machine halts
                if !self.failed_task && self.running {
                    self.run();
                }
            }
        }
        self.halted = was_halted;

        // A failed task or a mid-call `exit` leaves the machine in an
        // unfinished state; restore the entry shape and report null
        if self.failed_task || !self.running {
            self.stack.truncate(entry_depth);
            self.frames = entry_frames;
            self.catchstack = entry_catchstack;
            self.frame_depth = self.count_frames_internal();
            return Value::null();
        }

        let result = self.pop_stack();
        debug_assert_eq!(self.stack.len(), entry_depth);
        result
    }

    pub(crate) fn count_frames_internal(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.frames;
        while cursor.is_pointer() {
            depth += 1;
            cursor = unsafe { cell_ref(cursor) }
                .as_frame()
                .expect("frame cell")
                .parent;
        }
        depth
    }
}
