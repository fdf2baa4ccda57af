//! The virtual machine state
//!
//! [`Vm`] owns everything the runtime touches: the heap, the operand
//! stack, the frame and catch stacks, the scheduler queues and the worker
//! pool. Only the thread driving the VM may mutate any of it; worker
//! threads communicate exclusively through the pool's queues.

use crate::scheduler::worker::WorkerPool;
use crate::scheduler::{TimerId, TimerKey, VmTask};
use crate::vm::context::VmContext;
use crate::vm::error::{NativeError, VmError};
use crate::vm::interpreter::InstructionProfile;
use crate::vm::primitives::PrimitiveRegistry;
use rustc_hash::FxHashMap;
use sable_bytecode::{BlockArtifact, Constant};
use sable_core::gc::{
    BlockData, CPointerData, CPointerDestructor, CatchTableData, Cell, CellData, CellType,
    ClassData, CodePtr, Container, FrameData, FunctionData, GeneratorData, ObjectData,
    RootProvider, StringData,
};
use sable_core::symbol::{well_known, SymbolId};
use sable_core::{Heap, Value};
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::time::Duration;

/// Native function signature: `(vm, self, args) -> result`
///
/// Natives run on the main thread and may allocate through a
/// [`ManagedContext`]; returning an error raises a user-level throw.
///
/// [`ManagedContext`]: crate::vm::managed::ManagedContext
pub type NativeFn = fn(&mut Vm, Value, &[Value]) -> Result<Value, NativeError>;

pub(crate) struct NativeEntry {
    pub argc: u32,
    pub func: NativeFn,
}

/// Registry of native functions addressable by name symbol
#[derive(Default)]
pub(crate) struct NativeRegistry {
    pub entries: Vec<NativeEntry>,
    pub by_symbol: FxHashMap<SymbolId, u32>,
}

/// Symbols the interpreter resolves without a table lookup
pub(crate) struct WellKnownSyms {
    pub klass: SymbolId,
    pub name: SymbolId,
    pub prototype: SymbolId,
    pub parent_class: SymbolId,
    pub length: SymbolId,
    pub constructor: SymbolId,
}

/// Borrow a cell behind a heap value
///
/// # Safety
///
/// `value` must be a live heap pointer and the caller must uphold the
/// single-mutator discipline of the main thread.
pub(crate) unsafe fn cell_ref<'a>(value: Value) -> &'a Cell {
    &*value.cell_ptr()
}

/// Mutably borrow a cell behind a heap value
///
/// # Safety
///
/// Same as [`cell_ref`]; additionally the caller must not hold another
/// reference into the same cell.
#[allow(clippy::mut_from_ref)]
pub(crate) unsafe fn cell_mut<'a>(value: Value) -> &'a mut Cell {
    &mut *value.cell_ptr()
}

/// The Sable virtual machine
pub struct Vm {
    pub(crate) context: VmContext,
    pub(crate) heap: Heap,

    // Execution state
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Value,
    pub(crate) catchstack: Value,
    pub(crate) ip: Option<CodePtr>,
    pub(crate) halted: bool,
    pub(crate) running: bool,
    pub(crate) frame_depth: usize,
    pub(crate) last_exception: Value,
    pub(crate) failed_task: bool,
    pub(crate) status_code: u8,

    pub(crate) primitives: PrimitiveRegistry,
    pub(crate) natives: NativeRegistry,
    pub(crate) syms: WellKnownSyms,
    pub(crate) profile: InstructionProfile,

    // Scheduler state
    pub(crate) task_queue: VecDeque<VmTask>,
    pub(crate) timers: BTreeMap<TimerKey, VmTask>,
    pub(crate) intervals: BTreeMap<TimerKey, (VmTask, Duration)>,
    pub(crate) timer_keys: FxHashMap<TimerId, TimerKey>,
    pub(crate) interval_keys: FxHashMap<TimerId, TimerKey>,
    pub(crate) next_timer_id: TimerId,
    pub(crate) workers: WorkerPool,
    pub(crate) pending_jobs: FxHashMap<u64, Value>,
    pub(crate) next_job_id: u64,
}

/// Borrowed root view handed to the collector
struct VmRoots<'a> {
    stack: &'a [Value],
    frames: Value,
    catchstack: Value,
    ip: Option<CodePtr>,
    last_exception: Value,
    task_queue: &'a VecDeque<VmTask>,
    timers: &'a BTreeMap<TimerKey, VmTask>,
    intervals: &'a BTreeMap<TimerKey, (VmTask, Duration)>,
    pending_jobs: &'a FxHashMap<u64, Value>,
    primitives: &'a PrimitiveRegistry,
}

impl RootProvider for VmRoots<'_> {
    fn provide(&self, visit: &mut dyn FnMut(Value)) {
        for &value in self.stack {
            visit(value);
        }
        visit(self.frames);
        visit(self.catchstack);
        if let Some(ip) = self.ip {
            visit(ip.block);
        }
        visit(self.last_exception);
        for task in self.task_queue {
            visit(task.function);
            visit(task.argument);
        }
        for task in self.timers.values() {
            visit(task.function);
            visit(task.argument);
        }
        for (task, _) in self.intervals.values() {
            visit(task.function);
            visit(task.argument);
        }
        for &callback in self.pending_jobs.values() {
            visit(callback);
        }
        self.primitives.roots(visit);
    }
}

impl Vm {
    /// Create a VM and start its worker pool
    pub fn new(context: VmContext) -> Self {
        let worker_count = if context.flags.single_worker {
            1
        } else {
            num_cpus::get().max(context.flags.worker_floor)
        };
        let syms = WellKnownSyms {
            klass: context.artifacts.symtable.intern(well_known::KLASS),
            name: context.artifacts.symtable.intern(well_known::NAME),
            prototype: context.artifacts.symtable.intern(well_known::PROTOTYPE),
            parent_class: context.artifacts.symtable.intern(well_known::PARENT_CLASS),
            length: context.artifacts.symtable.intern(well_known::LENGTH),
            constructor: context.artifacts.symtable.intern(well_known::CONSTRUCTOR),
        };
        Self {
            context,
            heap: Heap::new(),
            stack: Vec::new(),
            frames: Value::null(),
            catchstack: Value::null(),
            ip: None,
            halted: false,
            running: true,
            frame_depth: 0,
            last_exception: Value::null(),
            failed_task: false,
            status_code: 0,
            primitives: PrimitiveRegistry::new(),
            natives: NativeRegistry::default(),
            syms,
            profile: InstructionProfile::new(),
            task_queue: VecDeque::new(),
            timers: BTreeMap::new(),
            intervals: BTreeMap::new(),
            timer_keys: FxHashMap::default(),
            interval_keys: FxHashMap::default(),
            next_timer_id: 0,
            workers: WorkerPool::new(worker_count),
            pending_jobs: FxHashMap::default(),
            next_job_id: 0,
        }
    }

    pub fn context(&self) -> &VmContext {
        &self.context
    }

    /// Mutable context access, mainly for natives writing to the injected
    /// streams or reading the input stream
    pub fn context_mut(&mut self) -> &mut VmContext {
        &mut self.context
    }

    pub fn status_code(&self) -> u8 {
        self.status_code
    }

    /// Number of threads in the worker pool
    pub fn worker_count(&self) -> usize {
        self.workers.worker_count()
    }

    /// End the runtime with `status` once the current task finishes
    pub fn exit(&mut self, status: u8) {
        self.status_code = status;
        self.running = false;
        self.halted = true;
    }

    // ===== Operand stack =====

    pub(crate) fn push_stack(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop_stack(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => self.fatal(VmError::StackUnderflow),
        }
    }

    pub(crate) fn peek_stack(&self) -> Value {
        match self.stack.last() {
            Some(&value) => value,
            None => self.fatal(VmError::StackUnderflow),
        }
    }

    /// Write a diagnostic and abort; structural failures are not
    /// recoverable from bytecode
    pub(crate) fn fatal(&self, error: VmError) -> ! {
        // The error stream is behind &mut; fatal paths fall back to stderr
        eprintln!("sable: fatal: {error}");
        panic!("{error}");
    }

    // ===== Allocation =====

    /// Allocate a raw cell, collecting with the full root set if needed
    pub(crate) fn alloc_cell(&mut self) -> *mut Cell {
        let before = self.heap.stats().collections;
        let cell = {
            let Vm {
                heap,
                stack,
                frames,
                catchstack,
                ip,
                last_exception,
                task_queue,
                timers,
                intervals,
                pending_jobs,
                primitives,
                ..
            } = self;
            let roots = VmRoots {
                stack: stack.as_slice(),
                frames: *frames,
                catchstack: *catchstack,
                ip: *ip,
                last_exception: *last_exception,
                task_queue: &*task_queue,
                timers: &*timers,
                intervals: &*intervals,
                pending_jobs: &*pending_jobs,
                primitives: &*primitives,
            };
            heap.allocate(&roots)
        };
        if self.context.flags.trace_gc {
            let stats = self.heap.stats();
            if stats.collections > before {
                let freed = stats.last_freed;
                let pause = stats.last_pause;
                let _ = writeln!(
                    self.context.err,
                    "#-- GC: freed {freed} cells in {pause:?} --#"
                );
            }
        }
        cell
    }

    /// Force a collection with the full root set
    pub fn collect(&mut self) {
        let Vm {
            heap,
            stack,
            frames,
            catchstack,
            ip,
            last_exception,
            task_queue,
            timers,
            intervals,
            pending_jobs,
            primitives,
            ..
        } = self;
        let roots = VmRoots {
            stack: stack.as_slice(),
            frames: *frames,
            catchstack: *catchstack,
            ip: *ip,
            last_exception: *last_exception,
            task_queue: &*task_queue,
            timers: &*timers,
            intervals: &*intervals,
            pending_jobs: &*pending_jobs,
            primitives: &*primitives,
        };
        heap.collect(&roots);
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    // ===== Value constructors =====

    /// Create a float, immediate when the bit pattern allows it
    pub fn create_float(&mut self, value: f64) -> Value {
        if let Some(immediate) = Value::immediate_float(value) {
            return immediate;
        }
        let cell = self.alloc_cell();
        unsafe {
            (*cell).set(CellType::Float, CellData::Float(value));
            Value::from_cell(cell)
        }
    }

    /// Create an integer, promoting to float when it exceeds 63 bits
    pub fn create_integer(&mut self, value: i64) -> Value {
        if Value::integer_fits(value) {
            Value::integer(value)
        } else {
            self.create_float(value as f64)
        }
    }

    pub fn create_string(&mut self, value: &str) -> Value {
        let (data, short) = StringData::from_str(value);
        let cell = self.alloc_cell();
        unsafe {
            (*cell).set_string(data, short);
            Value::from_cell(cell)
        }
    }

    pub fn create_object(&mut self, klass: Value, capacity: usize) -> Value {
        let container = Container::with_capacity_and_hasher(capacity, Default::default());
        let cell = self.alloc_cell();
        unsafe {
            (*cell).set(CellType::Object, CellData::Object(ObjectData { klass, container }));
            Value::from_cell(cell)
        }
    }

    pub fn create_array(&mut self, data: Vec<Value>) -> Value {
        let cell = self.alloc_cell();
        unsafe {
            (*cell).set(
                CellType::Array,
                CellData::Array(sable_core::gc::ArrayData { data }),
            );
            Value::from_cell(cell)
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_function(
        &mut self,
        name: SymbolId,
        block: Value,
        body_offset: usize,
        argc: u32,
        lvarcount: u32,
        anonymous: bool,
        needs_arguments: bool,
        context: Value,
    ) -> Value {
        let cell = self.alloc_cell();
        unsafe {
            (*cell).set(
                CellType::Function,
                CellData::Function(FunctionData {
                    name: Value::symbol(name),
                    argc,
                    lvarcount,
                    context,
                    block,
                    body_offset,
                    anonymous,
                    needs_arguments,
                    bound_self_set: false,
                    bound_self: Value::null(),
                    container: Container::default(),
                }),
            );
            Value::from_cell(cell)
        }
    }

    pub(crate) fn create_cfunction(&mut self, name: SymbolId, native_id: u32, argc: u32) -> Value {
        let cell = self.alloc_cell();
        unsafe {
            (*cell).set(
                CellType::CFunction,
                CellData::CFunction(sable_core::gc::CFunctionData {
                    name: Value::symbol(name),
                    native_id,
                    argc,
                    bound_self_set: false,
                    bound_self: Value::null(),
                    container: Container::default(),
                }),
            );
            Value::from_cell(cell)
        }
    }

    pub(crate) fn create_generator(
        &mut self,
        name: SymbolId,
        block: Value,
        argc: u32,
        lvarcount: u32,
        context: Value,
    ) -> Value {
        let cell = self.alloc_cell();
        unsafe {
            (*cell).set(
                CellType::Generator,
                CellData::Generator(GeneratorData {
                    name: Value::symbol(name),
                    context,
                    block,
                    argc,
                    lvarcount,
                    resume_offset: 0,
                    frame: Value::null(),
                    saved_stack: Vec::new(),
                    started: false,
                    finished: false,
                    running: false,
                    container: Container::default(),
                }),
            );
            Value::from_cell(cell)
        }
    }

    pub(crate) fn create_class(&mut self, name: SymbolId, prototype: Value) -> Value {
        let cell = self.alloc_cell();
        unsafe {
            (*cell).set(
                CellType::Class,
                CellData::Class(ClassData {
                    name: Value::symbol(name),
                    constructor: Value::null(),
                    member_properties: Vec::new(),
                    prototype,
                    parent_class: Value::null(),
                    container: Container::default(),
                }),
            );
            Value::from_cell(cell)
        }
    }

    /// Create a cpointer whose destructor runs exactly once at collection
    pub fn create_cpointer(
        &mut self,
        data: *mut (),
        destructor: Option<CPointerDestructor>,
    ) -> Value {
        let cell = self.alloc_cell();
        unsafe {
            (*cell).set(
                CellType::CPointer,
                CellData::CPointer(CPointerData { data, destructor }),
            );
            Value::from_cell(cell)
        }
    }

    // ===== Frames & catch tables =====

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_frame(
        &mut self,
        self_value: Value,
        function: Value,
        parent_environment: Value,
        environment: Vec<Value>,
        return_address: Option<CodePtr>,
        halt_after_return: bool,
        generator: Value,
    ) -> Value {
        if self.frame_depth >= self.context.flags.frame_limit {
            self.fatal(VmError::StackOverflow {
                limit: self.context.flags.frame_limit,
            });
        }
        let parent = self.frames;
        let catchtable = self.catchstack;
        let stack_base = self.stack.len();
        let cell = self.alloc_cell();
        let frame = unsafe {
            (*cell).set(
                CellType::Frame,
                CellData::Frame(FrameData {
                    parent,
                    parent_environment,
                    catchtable,
                    function,
                    environment,
                    self_value,
                    return_address,
                    halt_after_return,
                    stack_base,
                    generator,
                }),
            );
            Value::from_cell(cell)
        };
        self.frames = frame;
        self.frame_depth += 1;
        if self.context.flags.trace_frames {
            let name = self.callable_name(function);
            let _ = writeln!(self.context.err, "frame: enter {name}");
        }
        frame
    }

    /// Push a catch table with its handler at `address`
    pub(crate) fn create_catchtable(&mut self, address: CodePtr) -> Value {
        let frame = self.frames;
        let parent = self.catchstack;
        let stacksize = self.stack.len();
        let cell = self.alloc_cell();
        let table = unsafe {
            (*cell).set(
                CellType::CatchTable,
                CellData::CatchTable(CatchTableData {
                    address,
                    stacksize,
                    frame,
                    parent,
                }),
            );
            Value::from_cell(cell)
        };
        self.catchstack = table;
        if frame.is_pointer() {
            unsafe { cell_mut(frame) }
                .as_frame_mut()
                .expect("frame cell")
                .catchtable = table;
        }
        if self.context.flags.trace_catchtables {
            let offset = address.offset;
            let _ = if self.context.flags.verbose_addresses {
                writeln!(
                    self.context.err,
                    "catchtable: push handler {:#x}+{offset} depth {stacksize}",
                    address.block.raw()
                )
            } else {
                writeln!(
                    self.context.err,
                    "catchtable: push handler +{offset} depth {stacksize}"
                )
            };
        }
        table
    }

    pub(crate) fn pop_catchtable(&mut self) -> Value {
        let table = self.catchstack;
        if !table.is_pointer() {
            return Value::null();
        }
        let parent = unsafe { cell_ref(table) }
            .as_catchtable()
            .expect("catchtable cell")
            .parent;
        self.catchstack = parent;
        if self.frames.is_pointer() {
            unsafe { cell_mut(self.frames) }
                .as_frame_mut()
                .expect("frame cell")
                .catchtable = parent;
        }
        if self.context.flags.trace_catchtables {
            let _ = writeln!(self.context.err, "catchtable: pop");
        }
        table
    }

    // ===== Block registration =====

    /// Convert a compiled artifact into a heap instruction block
    pub fn register_block(&mut self, artifact: &BlockArtifact) -> Value {
        let cell = self.alloc_cell();
        let block = unsafe {
            (*cell).set(
                CellType::InstructionBlock,
                CellData::InstructionBlock(BlockData {
                    code: artifact.code.clone(),
                    constants: Vec::with_capacity(artifact.constants.len()),
                    children: Vec::with_capacity(artifact.children.len()),
                }),
            );
            Value::from_cell(cell)
        };

        // The block roots its constants and children as they are attached,
        // so only the block itself needs temporary protection.
        self.heap.register_temporary(block);
        for constant in &artifact.constants {
            let value = self.constant_value(*constant);
            unsafe { cell_mut(block) }
                .as_block_mut()
                .expect("block cell")
                .constants
                .push(value);
        }
        for child in &artifact.children {
            let value = self.register_block(child);
            unsafe { cell_mut(block) }
                .as_block_mut()
                .expect("block cell")
                .children
                .push(value);
        }
        self.heap.unregister_temporary(block);
        block
    }

    fn constant_value(&mut self, constant: Constant) -> Value {
        match constant {
            Constant::Null => Value::null(),
            Constant::Bool(b) => Value::boolean(b),
            Constant::Int(i) => self.create_integer(i),
            Constant::Float(f) => self.create_float(f),
            Constant::Symbol(id) => Value::symbol(id),
        }
    }

    // ===== Native interface =====

    /// Register a native function under `name`
    pub fn register_native(&mut self, name: &str, argc: u32, func: NativeFn) -> u32 {
        let sym = self.context.artifacts.symtable.intern(name);
        let id = self.natives.entries.len() as u32;
        self.natives.entries.push(NativeEntry { argc, func });
        self.natives.by_symbol.insert(sym, id);
        id
    }

    /// Create a `CFunction` value for a registered native
    pub fn native_value(&mut self, name: &str) -> Option<Value> {
        let sym = self.context.artifacts.symtable.intern(name);
        let id = *self.natives.by_symbol.get(&sym)?;
        let argc = self.natives.entries[id as usize].argc;
        Some(self.create_cfunction(sym, id, argc))
    }

    /// Bind a receiver to a function or cfunction value
    ///
    /// A bound receiver takes precedence over the target supplied by
    /// `callmember`.
    pub fn bind_self(&mut self, callable: Value, receiver: Value) {
        if !callable.is_pointer() {
            return;
        }
        let cell = unsafe { cell_mut(callable) };
        match cell.data_mut() {
            CellData::Function(f) => {
                f.bound_self_set = true;
                f.bound_self = receiver;
            }
            CellData::CFunction(f) => {
                f.bound_self_set = true;
                f.bound_self = receiver;
            }
            _ => {}
        }
    }

    // ===== Primitive classes =====

    pub fn set_primitive_value(&mut self, klass: Value) {
        self.primitives.value = klass;
    }
    pub fn set_primitive_object(&mut self, klass: Value) {
        self.primitives.object = klass;
    }
    pub fn set_primitive_class(&mut self, klass: Value) {
        self.primitives.class = klass;
    }
    pub fn set_primitive_array(&mut self, klass: Value) {
        self.primitives.array = klass;
    }
    pub fn set_primitive_string(&mut self, klass: Value) {
        self.primitives.string = klass;
    }
    pub fn set_primitive_number(&mut self, klass: Value) {
        self.primitives.number = klass;
    }
    pub fn set_primitive_function(&mut self, klass: Value) {
        self.primitives.function = klass;
    }
    pub fn set_primitive_generator(&mut self, klass: Value) {
        self.primitives.generator = klass;
    }
    pub fn set_primitive_boolean(&mut self, klass: Value) {
        self.primitives.boolean = klass;
    }
    pub fn set_primitive_null(&mut self, klass: Value) {
        self.primitives.null = klass;
    }

    // ===== Execution entry points =====

    /// Register and run a top-level module body
    ///
    /// An uncaught throw marks the run failed and sets a nonzero status.
    pub fn exec_module(&mut self, artifact: &BlockArtifact, lvarcount: u32) -> Value {
        let block = self.register_block(artifact);
        self.heap.register_temporary(block);
        let name = self.context.artifacts.symtable.intern("main");
        let function =
            self.create_function(name, block, 0, 0, lvarcount, false, false, Value::null());
        self.heap.unregister_temporary(block);

        let result = self.exec_function(function, Value::null());
        if self.failed_task {
            self.status_code = 1;
            self.failed_task = false;
        }
        result
    }

    /// Invoke a callable with one argument in a fresh top-level call
    ///
    /// Returns the produced value, or null if the call failed with an
    /// uncaught throw.
    pub fn exec_function(&mut self, function: Value, argument: Value) -> Value {
        self.exec_internal(function, None, &[argument])
    }

    /// Invoke a callable with arbitrary arguments in a fresh top-level call
    pub fn exec_call(&mut self, function: Value, arguments: &[Value]) -> Value {
        self.exec_internal(function, None, arguments)
    }

    // ===== Introspection helpers =====

    /// Resolve the display name of a callable for traces and stack walks
    pub(crate) fn callable_name(&self, callable: Value) -> String {
        if !callable.is_pointer() {
            return "<main>".to_string();
        }
        let cell = unsafe { cell_ref(callable) };
        let name = match cell.data() {
            CellData::Function(f) => f.name,
            CellData::CFunction(f) => f.name,
            CellData::Generator(g) => g.name,
            _ => return "<value>".to_string(),
        };
        self.symbol_name(name.symbol_id())
    }

    pub(crate) fn symbol_name(&self, id: SymbolId) -> String {
        self.context
            .artifacts
            .symtable
            .get(id)
            .unwrap_or_else(|| format!("<symbol {id:#x}>"))
    }

    /// Canonical display form used by string concatenation and `print`
    pub fn to_display(&self, value: Value) -> String {
        let mut seen = Vec::new();
        self.display_into(value, &mut seen)
    }

    fn display_into(&self, value: Value, seen: &mut Vec<u64>) -> String {
        if value.is_integer() {
            return value.as_integer().to_string();
        }
        if value.is_ifloat() {
            return format_float(value.as_ifloat());
        }
        if value.is_true() {
            return "true".to_string();
        }
        if value.is_false() {
            return "false".to_string();
        }
        if value.is_null() {
            return "null".to_string();
        }
        if value.is_symbol() {
            return self.symbol_name(value.symbol_id());
        }
        if !value.is_pointer() {
            return "<unknown>".to_string();
        }

        let cell = unsafe { cell_ref(value) };
        match cell.data() {
            CellData::Float(f) => format_float(*f),
            CellData::String(s) => s.as_str().to_string(),
            CellData::Array(array) => {
                if seen.contains(&value.raw()) {
                    return "[...]".to_string();
                }
                seen.push(value.raw());
                let items: Vec<String> = array
                    .data
                    .iter()
                    .map(|&item| self.display_into(item, seen))
                    .collect();
                seen.pop();
                format!("[{}]", items.join(", "))
            }
            CellData::Object(object) => {
                if seen.contains(&value.raw()) {
                    return "{...}".to_string();
                }
                seen.push(value.raw());
                let mut items: Vec<String> = object
                    .container
                    .iter()
                    .map(|(&sym, &member)| {
                        format!("{}: {}", self.symbol_name(sym), self.display_into(member, seen))
                    })
                    .collect();
                items.sort();
                seen.pop();
                format!("{{{}}}", items.join(", "))
            }
            CellData::Function(f) => format!("<function {}>", self.symbol_name(f.name.symbol_id())),
            CellData::CFunction(f) => {
                format!("<cfunction {}>", self.symbol_name(f.name.symbol_id()))
            }
            CellData::Generator(g) => {
                format!("<generator {}>", self.symbol_name(g.name.symbol_id()))
            }
            CellData::Class(c) => format!("<class {}>", self.symbol_name(c.name.symbol_id())),
            CellData::CPointer(_) => "<cpointer>".to_string(),
            CellData::Frame(_) => "<frame>".to_string(),
            CellData::CatchTable(_) => "<catchtable>".to_string(),
            CellData::InstructionBlock(_) => "<instruction_block>".to_string(),
            CellData::Free { .. } => "<dead>".to_string(),
        }
    }

    /// Write the current call stack to `io`-like sink
    pub(crate) fn write_stacktrace(&mut self) {
        let mut lines = Vec::new();
        let mut cursor = self.frames;
        while cursor.is_pointer() {
            let data = unsafe { cell_ref(cursor) }.as_frame().expect("frame cell");
            let name = self.callable_name(data.function);
            if self.context.flags.verbose_addresses {
                let addr = data
                    .return_address
                    .map(|ra| format!(" (return {:#x}+{})", ra.block.raw(), ra.offset))
                    .unwrap_or_default();
                lines.push(format!("  at {name}{addr}"));
            } else {
                lines.push(format!("  at {name}"));
            }
            cursor = data.parent;
        }
        for line in lines {
            let _ = writeln!(self.context.err, "{line}");
        }
    }
}

/// Canonical float formatting: no trailing zeros for whole numbers
pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
        return format!("{}", f as i64);
    }
    format!("{f}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::context::RunFlags;
    use sable_core::CompilerArtifacts;
    use std::sync::Arc;

    fn test_vm() -> Vm {
        let artifacts = Arc::new(CompilerArtifacts::new());
        let flags = RunFlags {
            single_worker: true,
            ..RunFlags::default()
        };
        Vm::new(VmContext::new(artifacts, flags))
    }

    #[test]
    fn test_create_integer_promotes_on_overflow() {
        let mut vm = test_vm();
        let v = vm.create_integer(5);
        assert!(v.is_integer());
        assert_eq!(v.as_integer(), 5);

        let big = vm.create_integer(i64::MAX);
        assert!(!big.is_integer());
        assert_eq!(big.numeric_value(), Some(i64::MAX as f64));
    }

    #[test]
    fn test_create_string_roundtrip() {
        let mut vm = test_vm();
        let s = vm.create_string("hello");
        let cell = unsafe { cell_ref(s) };
        assert_eq!(cell.as_string().unwrap().as_str(), "hello");
        assert!(cell.short_string());

        let long = "z".repeat(100);
        let s = vm.create_string(&long);
        let cell = unsafe { cell_ref(s) };
        assert_eq!(cell.as_string().unwrap().as_str(), long);
        assert!(!cell.short_string());
    }

    #[test]
    fn test_float_boxing_through_vm() {
        let mut vm = test_vm();
        let immediate = vm.create_float(1.5);
        assert!(immediate.is_ifloat());

        let awkward = f64::from_bits(0x3FF0_0000_0000_0001);
        let boxed = vm.create_float(awkward);
        assert!(boxed.is_pointer());
        assert_eq!(boxed.numeric_value(), Some(awkward));
    }

    #[test]
    fn test_format_float_canonical() {
        assert_eq!(format_float(3.0), "3");
        assert_eq!(format_float(3.5), "3.5");
        assert_eq!(format_float(-2.0), "-2");
        assert_eq!(format_float(f64::NAN), "NaN");
        assert_eq!(format_float(f64::INFINITY), "Infinity");
        assert_eq!(format_float(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_to_display_cyclic_array() {
        let mut vm = test_vm();
        let array = vm.create_array(vec![Value::integer(1)]);
        unsafe { cell_mut(array) }
            .as_array_mut()
            .unwrap()
            .data
            .push(array);
        assert_eq!(vm.to_display(array), "[1, [...]]");
    }

    #[test]
    fn test_register_block_converts_constants() {
        use sable_bytecode::BlockBuilder;
        let mut vm = test_vm();
        let mut builder = BlockBuilder::new();
        builder.constant(Constant::Int(7));
        builder.constant(Constant::Float(2.5));
        builder.constant(Constant::Bool(true));
        let artifact = builder.finish();

        let block = vm.register_block(&artifact);
        let data = unsafe { cell_ref(block) }.as_block().unwrap();
        assert_eq!(data.constants[0], Value::integer(7));
        assert_eq!(data.constants[1].numeric_value(), Some(2.5));
        assert!(data.constants[2].is_true());
    }

    #[test]
    fn test_register_native() {
        fn add_native(_vm: &mut Vm, _self: Value, args: &[Value]) -> Result<Value, NativeError> {
            let a = args[0].as_integer();
            let b = args[1].as_integer();
            Ok(Value::integer(a + b))
        }

        let mut vm = test_vm();
        vm.register_native("add", 2, add_native);
        let value = vm.native_value("add").expect("registered");
        let cell = unsafe { cell_ref(value) };
        assert_eq!(cell.as_cfunction().unwrap().argc, 2);
        assert!(vm.native_value("missing").is_none());
    }
}
