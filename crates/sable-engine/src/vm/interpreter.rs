//! The fetch-decode-execute loop
//!
//! Instructions execute against the current frame and operand stack. The
//! instruction pointer is advanced past the payload before the handler
//! runs; branch handlers overwrite it with an offset relative to the
//! opcode byte. A handler that throws has already unwound the machine, so
//! the loop simply continues with the next fetch.

use crate::vm::error::{OpResult, Thrown, VmError};
use crate::vm::machine::{cell_mut, cell_ref, Vm};
use sable_bytecode::opcode::OPCODE_COUNT;
use sable_bytecode::{BlockReader, Opcode};
use sable_core::gc::CodePtr;
use sable_core::Value;
use std::io::Write;
use std::time::{Duration, Instant};

/// Per-opcode execution counts and cumulative durations
pub struct InstructionProfile {
    entries: Vec<ProfileEntry>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileEntry {
    pub encountered: u64,
    pub total: Duration,
}

impl ProfileEntry {
    pub fn average(&self) -> Duration {
        if self.encountered == 0 {
            Duration::ZERO
        } else {
            self.total / self.encountered as u32
        }
    }
}

impl InstructionProfile {
    pub fn new() -> Self {
        Self {
            entries: vec![ProfileEntry::default(); OPCODE_COUNT],
        }
    }

    pub fn record(&mut self, opcode: Opcode, elapsed: Duration) {
        let entry = &mut self.entries[opcode as usize];
        entry.encountered += 1;
        entry.total += elapsed;
    }

    pub fn entry(&self, opcode: Opcode) -> ProfileEntry {
        self.entries[opcode as usize]
    }

    /// Write all encountered opcodes with counts and average durations
    pub fn write_report(&self, io: &mut dyn Write) {
        for byte in 0..OPCODE_COUNT {
            let Some(opcode) = Opcode::from_byte(byte as u8) else {
                continue;
            };
            let entry = self.entries[byte];
            if entry.encountered == 0 {
                continue;
            }
            let _ = writeln!(
                io,
                "{:<20} {:>10} {:>12?}",
                opcode.mnemonic(),
                entry.encountered,
                entry.average()
            );
        }
    }
}

impl Default for InstructionProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Execute instructions until the machine halts
    pub(crate) fn run(&mut self) {
        self.halted = false;
        while !self.halted && self.running {
            if self.ip.is_none() {
                break;
            }
            let _ = self.step();
        }
    }

    /// Fetch, decode and execute a single instruction
    pub(crate) fn step(&mut self) -> OpResult {
        let instr = self.ip.expect("step without an instruction pointer");
        let opcode = self.fetch_opcode(instr);

        if self.context.flags.trace_opcodes {
            let _ = if self.context.flags.verbose_addresses {
                writeln!(
                    self.context.err,
                    "op: {:#x}+{} {}",
                    instr.block.raw(),
                    instr.offset,
                    opcode.mnemonic()
                )
            } else {
                writeln!(self.context.err, "op: +{} {}", instr.offset, opcode.mnemonic())
            };
        }

        let started = self
            .context
            .flags
            .instruction_profile
            .then(Instant::now);

        self.ip = Some(CodePtr::new(
            instr.block,
            instr.offset + opcode.instruction_size(),
        ));
        let result = self.dispatch(opcode, instr);

        if let Some(started) = started {
            self.profile.record(opcode, started.elapsed());
        }
        result
    }

    pub fn profile(&self) -> &InstructionProfile {
        &self.profile
    }

    fn fetch_opcode(&self, instr: CodePtr) -> Opcode {
        let code = &unsafe { cell_ref(instr.block) }
            .as_block()
            .expect("block cell")
            .code;
        let Some(&byte) = code.get(instr.offset) else {
            self.fatal(VmError::IpOutOfBounds { offset: instr.offset });
        };
        let Some(opcode) = Opcode::from_byte(byte) else {
            self.fatal(VmError::InvalidOpcode {
                opcode: byte,
                offset: instr.offset,
            });
        };
        if instr.offset + opcode.instruction_size() > code.len() {
            self.fatal(VmError::IpOutOfBounds { offset: instr.offset });
        }
        opcode
    }

    fn reader(&self, instr: CodePtr) -> BlockReader<'_> {
        let code = &unsafe { cell_ref(instr.block) }
            .as_block()
            .expect("block cell")
            .code;
        BlockReader::new(code)
    }

    fn operand_u8(&self, instr: CodePtr, rel: usize) -> u8 {
        self.reader(instr).read_u8(instr.offset + 1 + rel)
    }

    fn operand_u32(&self, instr: CodePtr, rel: usize) -> u32 {
        self.reader(instr).read_u32(instr.offset + 1 + rel)
    }

    fn operand_u64(&self, instr: CodePtr, rel: usize) -> u64 {
        self.reader(instr).read_u64(instr.offset + 1 + rel)
    }

    fn operand_i32(&self, instr: CodePtr, rel: usize) -> i32 {
        self.reader(instr).read_i32(instr.offset + 1 + rel)
    }

    fn dispatch(&mut self, opcode: Opcode, instr: CodePtr) -> OpResult {
        match opcode {
            Opcode::ReadLocal => {
                let index = self.operand_u32(instr, 0);
                let level = self.operand_u32(instr, 4);
                self.op_readlocal(index, level)
            }
            Opcode::SetLocal => {
                let index = self.operand_u32(instr, 0);
                let level = self.operand_u32(instr, 4);
                let value = self.pop_stack();
                self.write_local(index, level, value)
            }
            Opcode::SetLocalPush => {
                let index = self.operand_u32(instr, 0);
                let level = self.operand_u32(instr, 4);
                let value = self.peek_stack();
                self.write_local(index, level, value)
            }
            Opcode::ReadMemberSymbol => {
                let symbol = self.operand_u64(instr, 0);
                let source = self.pop_stack();
                let value = self.read_member_symbol(source, symbol);
                self.push_stack(value);
                Ok(())
            }
            Opcode::SetMemberSymbol => {
                let symbol = self.operand_u64(instr, 0);
                let value = self.pop_stack();
                let target = self.pop_stack();
                self.set_member_symbol(target, symbol, value)
            }
            Opcode::SetMemberSymbolPush => {
                let symbol = self.operand_u64(instr, 0);
                let value = self.pop_stack();
                let target = self.pop_stack();
                self.set_member_symbol(target, symbol, value)?;
                self.push_stack(value);
                Ok(())
            }
            Opcode::ReadMemberValue => {
                let key = self.pop_stack();
                let source = self.pop_stack();
                self.read_member_value(source, key)
            }
            Opcode::SetMemberValue => {
                let value = self.pop_stack();
                let key = self.pop_stack();
                let target = self.pop_stack();
                self.set_member_value(target, key, value)
            }
            Opcode::SetMemberValuePush => {
                let value = self.pop_stack();
                let key = self.pop_stack();
                let target = self.pop_stack();
                self.set_member_value(target, key, value)?;
                self.push_stack(value);
                Ok(())
            }
            Opcode::ReadArrayIndex => {
                let index = self.operand_u32(instr, 0);
                let source = self.pop_stack();
                self.op_readarrayindex(source, index)
            }
            Opcode::SetArrayIndex => {
                let index = self.operand_u32(instr, 0);
                let value = self.pop_stack();
                let target = self.pop_stack();
                self.op_setarrayindex(target, index, value)
            }
            Opcode::SetArrayIndexPush => {
                let index = self.operand_u32(instr, 0);
                let value = self.pop_stack();
                let target = self.pop_stack();
                self.op_setarrayindex(target, index, value)?;
                self.push_stack(value);
                Ok(())
            }
            Opcode::PutSelf => {
                let level = self.operand_u32(instr, 0);
                let frame = self.frame_at_level(level)?;
                let value = unsafe { cell_ref(frame) }
                    .as_frame()
                    .expect("frame cell")
                    .self_value;
                self.push_stack(value);
                Ok(())
            }
            Opcode::PutValue => {
                let index = self.operand_u32(instr, 0) as usize;
                let constants = &unsafe { cell_ref(instr.block) }
                    .as_block()
                    .expect("block cell")
                    .constants;
                let Some(&value) = constants.get(index) else {
                    self.fatal(VmError::MalformedBlock(format!(
                        "missing constant {index}"
                    )));
                };
                self.push_stack(value);
                Ok(())
            }
            Opcode::PutString => {
                let pool_id = self.operand_u32(instr, 0);
                let Some(literal) = self.context.artifacts.stringpool.get(pool_id) else {
                    self.fatal(VmError::MalformedBlock(format!(
                        "missing string-pool entry {pool_id}"
                    )));
                };
                let value = self.create_string(&literal);
                self.push_stack(value);
                Ok(())
            }
            Opcode::PutFunction => {
                let symbol = self.operand_u64(instr, 0);
                let child = self.operand_u32(instr, 8) as usize;
                let argc = self.operand_u32(instr, 12);
                let lvarcount = self.operand_u32(instr, 16);
                let anonymous = self.operand_u8(instr, 20) != 0;
                let needs_arguments = self.operand_u8(instr, 21) != 0;
                let block = self.child_block(instr, child);
                let context = self.frames;
                let function = self.create_function(
                    symbol,
                    block,
                    0,
                    argc,
                    lvarcount,
                    anonymous,
                    needs_arguments,
                    context,
                );
                self.push_stack(function);
                Ok(())
            }
            Opcode::PutCFunction => {
                let symbol = self.operand_u64(instr, 0);
                let argc = self.operand_u32(instr, 8);
                let Some(&native_id) = self.natives.by_symbol.get(&symbol) else {
                    let name = self.symbol_name(symbol);
                    return self.throw_message(&format!("undefined native function {name}"));
                };
                let value = self.create_cfunction(symbol, native_id, argc);
                self.push_stack(value);
                Ok(())
            }
            Opcode::PutGenerator => {
                let symbol = self.operand_u64(instr, 0);
                let child = self.operand_u32(instr, 8) as usize;
                let argc = self.operand_u32(instr, 12);
                let lvarcount = self.operand_u32(instr, 16);
                let block = self.child_block(instr, child);
                let context = self.frames;
                let generator = self.create_generator(symbol, block, argc, lvarcount, context);
                self.push_stack(generator);
                Ok(())
            }
            Opcode::PutArray => {
                let count = self.operand_u32(instr, 0) as usize;
                if self.stack.len() < count {
                    self.fatal(VmError::StackUnderflow);
                }
                let base = self.stack.len() - count;
                let values = self.stack[base..].to_vec();
                let array = self.create_array(values);
                self.stack.truncate(base);
                self.push_stack(array);
                Ok(())
            }
            Opcode::PutHash => self.op_puthash(instr),
            Opcode::PutClass => self.op_putclass(instr),
            Opcode::Pop => {
                self.pop_stack();
                Ok(())
            }
            Opcode::Dup => {
                let value = self.peek_stack();
                self.push_stack(value);
                Ok(())
            }
            Opcode::Dupn => {
                let count = self.operand_u32(instr, 0) as usize;
                if self.stack.len() < count {
                    self.fatal(VmError::StackUnderflow);
                }
                let base = self.stack.len() - count;
                let values = self.stack[base..].to_vec();
                self.stack.extend(values);
                Ok(())
            }
            Opcode::Swap => {
                let a = self.pop_stack();
                let b = self.pop_stack();
                self.push_stack(a);
                self.push_stack(b);
                Ok(())
            }
            Opcode::Call => {
                let argc = self.operand_u32(instr, 0);
                self.call_value(argc, false, false).map(|_| ())
            }
            Opcode::CallMember => {
                let argc = self.operand_u32(instr, 0);
                self.call_value(argc, true, false).map(|_| ())
            }
            Opcode::Return => self.op_return(),
            Opcode::Yield => self.op_yield(),
            Opcode::Throw => {
                let payload = self.pop_stack();
                self.throw_exception(payload)
            }
            Opcode::RegisterCatchTable => {
                let offset = self.operand_i32(instr, 0);
                let target = instr.offset as i64 + offset as i64;
                if target < 0 {
                    self.fatal(VmError::MalformedBlock(
                        "catch handler before block start".to_string(),
                    ));
                }
                self.create_catchtable(CodePtr::new(instr.block, target as usize));
                Ok(())
            }
            Opcode::PopCatchTable => {
                self.pop_catchtable();
                Ok(())
            }
            Opcode::Branch => {
                let offset = self.operand_i32(instr, 0);
                self.branch_to(instr, offset)
            }
            Opcode::BranchIf => {
                let offset = self.operand_i32(instr, 0);
                let value = self.pop_stack();
                if value.truthyness() {
                    return self.branch_to(instr, offset);
                }
                Ok(())
            }
            Opcode::BranchUnless => {
                let offset = self.operand_i32(instr, 0);
                let value = self.pop_stack();
                if !value.truthyness() {
                    return self.branch_to(instr, offset);
                }
                Ok(())
            }
            Opcode::BranchLt
            | Opcode::BranchGt
            | Opcode::BranchLe
            | Opcode::BranchGe
            | Opcode::BranchEq
            | Opcode::BranchNeq => {
                let offset = self.operand_i32(instr, 0);
                let right = self.pop_stack();
                let left = self.pop_stack();
                let taken = match opcode {
                    Opcode::BranchLt => self.values_lt(left, right),
                    Opcode::BranchGt => self.values_gt(left, right),
                    Opcode::BranchLe => self.values_le(left, right),
                    Opcode::BranchGe => self.values_ge(left, right),
                    Opcode::BranchEq => self.values_equal(left, right),
                    _ => !self.values_equal(left, right),
                };
                if taken {
                    return self.branch_to(instr, offset);
                }
                Ok(())
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::BAnd
            | Opcode::BOr
            | Opcode::BXor => {
                let right = self.pop_stack();
                let left = self.pop_stack();
                let result = match opcode {
                    Opcode::Add => self.op_add_values(left, right),
                    Opcode::Sub => self.op_sub_values(left, right),
                    Opcode::Mul => self.op_mul_values(left, right),
                    Opcode::Div => self.op_div_values(left, right),
                    Opcode::Mod => self.op_mod_values(left, right),
                    Opcode::Pow => self.op_pow_values(left, right),
                    Opcode::Shl => self.op_shl_values(left, right),
                    Opcode::Shr => self.op_shr_values(left, right),
                    Opcode::BAnd => self.op_band_values(left, right),
                    Opcode::BOr => self.op_bor_values(left, right),
                    _ => self.op_bxor_values(left, right),
                };
                self.push_stack(result);
                Ok(())
            }
            Opcode::UAdd => {
                let value = self.pop_stack();
                let result = self.op_uadd_value(value);
                self.push_stack(result);
                Ok(())
            }
            Opcode::USub => {
                let value = self.pop_stack();
                let result = self.op_usub_value(value);
                self.push_stack(result);
                Ok(())
            }
            Opcode::UBNot => {
                let value = self.pop_stack();
                let result = self.op_ubnot_value(value);
                self.push_stack(result);
                Ok(())
            }
            Opcode::Eq | Opcode::Neq | Opcode::Lt | Opcode::Gt | Opcode::Le | Opcode::Ge => {
                let right = self.pop_stack();
                let left = self.pop_stack();
                let truth = match opcode {
                    Opcode::Eq => self.values_equal(left, right),
                    Opcode::Neq => !self.values_equal(left, right),
                    Opcode::Lt => self.values_lt(left, right),
                    Opcode::Gt => self.values_gt(left, right),
                    Opcode::Le => self.values_le(left, right),
                    _ => self.values_ge(left, right),
                };
                self.push_stack(Value::boolean(truth));
                Ok(())
            }
            Opcode::UNot => {
                let value = self.pop_stack();
                self.push_stack(Value::boolean(!value.truthyness()));
                Ok(())
            }
            Opcode::Typeof => {
                let value = self.pop_stack();
                let name = value.type_name();
                let result = self.create_string(name);
                self.push_stack(result);
                Ok(())
            }
        }
    }

    fn branch_to(&mut self, instr: CodePtr, offset: i32) -> OpResult {
        let target = instr.offset as i64 + offset as i64;
        if target < 0 {
            self.fatal(VmError::MalformedBlock(
                "branch target before block start".to_string(),
            ));
        }
        self.ip = Some(CodePtr::new(instr.block, target as usize));
        Ok(())
    }

    fn child_block(&self, instr: CodePtr, index: usize) -> Value {
        let children = &unsafe { cell_ref(instr.block) }
            .as_block()
            .expect("block cell")
            .children;
        match children.get(index) {
            Some(&child) => child,
            None => self.fatal(VmError::MalformedBlock(format!(
                "missing child block {index}"
            ))),
        }
    }

    // ===== Locals =====

    /// Walk the lexical-parent chain `level` environments up
    fn frame_at_level(&mut self, level: u32) -> Result<Value, Thrown> {
        let mut cursor = self.frames;
        for _ in 0..level {
            if !cursor.is_pointer() {
                self.throw_message("lexical environment level out of range")?;
            }
            cursor = unsafe { cell_ref(cursor) }
                .as_frame()
                .expect("frame cell")
                .parent_environment;
        }
        if !cursor.is_pointer() {
            self.throw_message("lexical environment level out of range")?;
        }
        Ok(cursor)
    }

    fn op_readlocal(&mut self, index: u32, level: u32) -> OpResult {
        let frame = self.frame_at_level(level)?;
        let slot = unsafe { cell_ref(frame) }
            .as_frame()
            .expect("frame cell")
            .environment
            .get(index as usize)
            .copied();
        match slot {
            Some(value) => {
                self.push_stack(value);
                Ok(())
            }
            None => self.throw_message(&format!("local slot {index} out of range")),
        }
    }

    fn write_local(&mut self, index: u32, level: u32, value: Value) -> OpResult {
        let frame = self.frame_at_level(level)?;
        let written = {
            let environment = &mut unsafe { cell_mut(frame) }
                .as_frame_mut()
                .expect("frame cell")
                .environment;
            match environment.get_mut(index as usize) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            }
        };
        if written {
            Ok(())
        } else {
            self.throw_message(&format!("local slot {index} out of range"))
        }
    }

    // ===== Arrays =====

    fn op_readarrayindex(&mut self, source: Value, index: u32) -> OpResult {
        if source.is_pointer() {
            if let Some(array) = unsafe { cell_ref(source) }.as_array() {
                let value = array.data.get(index as usize).copied().unwrap_or_default();
                self.push_stack(value);
                return Ok(());
            }
        }
        let type_name = source.type_name();
        self.throw_message(&format!("cannot index a {type_name} value"))
    }

    fn op_setarrayindex(&mut self, target: Value, index: u32, value: Value) -> OpResult {
        if target.is_pointer() {
            let write = {
                match unsafe { cell_mut(target) }.as_array_mut() {
                    Some(array) => match array.data.get_mut(index as usize) {
                        Some(slot) => {
                            *slot = value;
                            Some(Ok(()))
                        }
                        None => {
                            let len = array.data.len();
                            Some(Err(len))
                        }
                    },
                    None => None,
                }
            };
            match write {
                Some(Ok(())) => return Ok(()),
                Some(Err(len)) => {
                    return self.throw_message(&format!(
                        "array index {index} is out of bounds (length {len})"
                    ));
                }
                None => {}
            }
        }
        let type_name = target.type_name();
        self.throw_message(&format!("cannot index a {type_name} value"))
    }

    // ===== Literals =====

    fn op_puthash(&mut self, instr: CodePtr) -> OpResult {
        let count = self.operand_u32(instr, 0) as usize;
        if self.stack.len() < count * 2 {
            self.fatal(VmError::StackUnderflow);
        }
        let base = self.stack.len() - count * 2;

        let object = self.create_object(Value::null(), count);
        self.heap.register_temporary(object);

        for i in 0..count {
            let key = self.stack[base + i * 2];
            let value = self.stack[base + i * 2 + 1];
            let Some(symbol) = self.hash_key_symbol(key) else {
                self.heap.unregister_temporary(object);
                self.stack.truncate(base);
                let type_name = key.type_name();
                return self
                    .throw_message(&format!("cannot use a {type_name} value as a member key"));
            };
            unsafe { cell_mut(object) }
                .as_object_mut()
                .expect("object cell")
                .container
                .insert(symbol, value);
        }

        self.stack.truncate(base);
        self.heap.unregister_temporary(object);
        self.push_stack(object);
        Ok(())
    }

    fn hash_key_symbol(&mut self, key: Value) -> Option<u64> {
        if key.is_symbol() {
            return Some(key.symbol_id());
        }
        if key.is_pointer() {
            if let Some(s) = unsafe { cell_ref(key) }.as_string() {
                return Some(self.context.artifacts.symtable.intern(s.as_str()));
            }
        }
        None
    }

    fn op_putclass(&mut self, instr: CodePtr) -> OpResult {
        let symbol = self.operand_u64(instr, 0);
        let propertycount = self.operand_u32(instr, 8) as usize;
        let staticpropertycount = self.operand_u32(instr, 12) as usize;
        let methodcount = self.operand_u32(instr, 16) as usize;
        let staticmethodcount = self.operand_u32(instr, 20) as usize;
        let has_parent = self.operand_u8(instr, 24) != 0;
        let has_constructor = self.operand_u8(instr, 25) != 0;

        let total = propertycount
            + staticpropertycount
            + methodcount
            + staticmethodcount
            + usize::from(has_parent)
            + usize::from(has_constructor);
        if self.stack.len() < total {
            self.fatal(VmError::StackUnderflow);
        }
        let base = self.stack.len() - total;

        let prototype = self.create_object(Value::null(), methodcount);
        self.heap.register_temporary(prototype);
        let class = self.create_class(symbol, prototype);
        self.heap.register_temporary(class);

        let mut cursor = base;

        for _ in 0..propertycount {
            let key = self.stack[cursor];
            cursor += 1;
            if !key.is_symbol() {
                self.fatal(VmError::MalformedBlock(
                    "class member property is not a symbol".to_string(),
                ));
            }
            unsafe { cell_mut(class) }
                .as_class_mut()
                .expect("class cell")
                .member_properties
                .push(key.symbol_id());
        }

        for _ in 0..staticpropertycount {
            let key = self.stack[cursor];
            cursor += 1;
            if !key.is_symbol() {
                self.fatal(VmError::MalformedBlock(
                    "class static property is not a symbol".to_string(),
                ));
            }
            unsafe { cell_mut(class) }
                .as_class_mut()
                .expect("class cell")
                .container
                .insert(key.symbol_id(), Value::null());
        }

        for _ in 0..methodcount {
            let method = self.stack[cursor];
            cursor += 1;
            let name = self.method_name(method);
            unsafe { cell_mut(prototype) }
                .as_object_mut()
                .expect("object cell")
                .container
                .insert(name, method);
        }

        for _ in 0..staticmethodcount {
            let method = self.stack[cursor];
            cursor += 1;
            let name = self.method_name(method);
            unsafe { cell_mut(class) }
                .as_class_mut()
                .expect("class cell")
                .container
                .insert(name, method);
        }

        if has_parent {
            let parent = self.stack[cursor];
            cursor += 1;
            if !parent.is_pointer() || unsafe { cell_ref(parent) }.as_class().is_none() {
                self.heap.unregister_temporary(class);
                self.heap.unregister_temporary(prototype);
                self.stack.truncate(base);
                let type_name = parent.type_name();
                return self
                    .throw_message(&format!("cannot extend a {type_name} value"));
            }
            unsafe { cell_mut(class) }
                .as_class_mut()
                .expect("class cell")
                .parent_class = parent;
        }

        if has_constructor {
            let constructor = self.stack[cursor];
            unsafe { cell_mut(class) }
                .as_class_mut()
                .expect("class cell")
                .constructor = constructor;
        }

        self.stack.truncate(base);
        self.heap.unregister_temporary(class);
        self.heap.unregister_temporary(prototype);
        self.push_stack(class);
        Ok(())
    }

    fn method_name(&self, method: Value) -> u64 {
        if method.is_pointer() {
            let cell = unsafe { cell_ref(method) };
            if let Some(f) = cell.as_function() {
                return f.name.symbol_id();
            }
            if let Some(f) = cell.as_cfunction() {
                return f.name.symbol_id();
            }
            if let Some(g) = cell.as_generator() {
                return g.name.symbol_id();
            }
        }
        self.fatal(VmError::MalformedBlock(
            "class method is not callable".to_string(),
        ))
    }

    // ===== Control transfer =====

    fn op_return(&mut self) -> OpResult {
        let frame = self.frames;
        if !frame.is_pointer() {
            self.fatal(VmError::MalformedBlock("return without a frame".to_string()));
        }
        let value = self.pop_stack();
        let (parent, return_address, halt, stack_base, generator) = {
            let data = unsafe { cell_ref(frame) }.as_frame().expect("frame cell");
            (
                data.parent,
                data.return_address,
                data.halt_after_return,
                data.stack_base,
                data.generator,
            )
        };

        self.stack.truncate(stack_base);
        if generator.is_pointer() {
            let data = unsafe { cell_mut(generator) }
                .as_generator_mut()
                .expect("generator cell");
            data.finished = true;
            data.running = false;
            data.frame = Value::null();
            data.saved_stack.clear();
        }

        self.frames = parent;
        self.frame_depth -= 1;
        self.ip = return_address;
        if self.context.flags.trace_frames {
            let name = {
                let data = unsafe { cell_ref(frame) }.as_frame().expect("frame cell");
                self.callable_name(data.function)
            };
            let _ = writeln!(self.context.err, "frame: leave {name}");
        }
        self.push_stack(value);
        if halt {
            self.halted = true;
        }
        Ok(())
    }

    fn op_yield(&mut self) -> OpResult {
        let frame = self.frames;
        if !frame.is_pointer() {
            self.fatal(VmError::MalformedBlock("yield without a frame".to_string()));
        }
        let (generator, stack_base, parent, return_address, halt) = {
            let data = unsafe { cell_ref(frame) }.as_frame().expect("frame cell");
            (
                data.generator,
                data.stack_base,
                data.parent,
                data.return_address,
                data.halt_after_return,
            )
        };
        if !generator.is_pointer() {
            return self.throw_message("yield outside of a generator");
        }

        let value = self.pop_stack();
        let saved = self.stack.split_off(stack_base);
        let resume_offset = self.ip.expect("yield without an instruction pointer").offset;

        {
            let data = unsafe { cell_mut(generator) }
                .as_generator_mut()
                .expect("generator cell");
            data.resume_offset = resume_offset;
            data.saved_stack = saved;
            data.frame = frame;
            data.running = false;
        }

        self.frames = parent;
        self.frame_depth -= 1;
        self.ip = return_address;
        self.push_stack(value);
        if halt {
            self.halted = true;
        }
        Ok(())
    }
}
