//! Block building and decoding
//!
//! The compiler backend assembles each function body into a [`BlockArtifact`]:
//! a linear byte buffer of encoded instructions, a pool of immediate
//! constants, and the child blocks of nested functions. Branch targets are
//! written through [`Label`]s and resolved into signed 32-bit offsets
//! relative to the branching instruction before the artifact is handed to
//! the VM.

use crate::opcode::Opcode;

/// Immediate constant embedded in a block's constant pool
///
/// Heap values never appear here; string literals go through the string
/// pool and `putstring`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Symbol(u64),
}

/// A forward-referencable position in a block under construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Compiled block artifact consumed by the VM
///
/// `code` is the instruction byte buffer, `constants` the pool referenced
/// by `putvalue`, and `children` the nested function bodies referenced by
/// `putfunction` / `putgenerator`.
#[derive(Debug, Clone, Default)]
pub struct BlockArtifact {
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    pub children: Vec<BlockArtifact>,
}

/// Unresolved branch-site bookkeeping
struct Patch {
    /// Offset of the opcode byte of the branching instruction
    instruction_offset: usize,
    /// Offset of the i32 payload to patch
    payload_offset: usize,
    label: Label,
}

/// Append-only instruction emitter
///
/// Mirrors the assembler contract: emit methods append an opcode byte plus
/// its little-endian payload; `label`/`place_label` handle forward branch
/// targets; `finish` patches every branch site and returns the artifact.
pub struct BlockBuilder {
    code: Vec<u8>,
    constants: Vec<Constant>,
    children: Vec<BlockArtifact>,
    labels: Vec<Option<usize>>,
    patches: Vec<Patch>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            constants: Vec::new(),
            children: Vec::new(),
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Current write offset
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Create a label that can be placed later
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current write offset
    pub fn place_label(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    /// Add a constant to the pool, returning its index
    pub fn constant(&mut self, constant: Constant) -> u32 {
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    /// Add a child block, returning its index
    pub fn child(&mut self, child: BlockArtifact) -> u32 {
        self.children.push(child);
        (self.children.len() - 1) as u32
    }

    fn emit_u8(&mut self, value: u8) {
        self.code.push(value);
    }

    fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a bare opcode with no payload
    pub fn emit(&mut self, opcode: Opcode) {
        debug_assert_eq!(opcode.operand_size(), 0);
        self.emit_u8(opcode as u8);
    }

    pub fn emit_read_local(&mut self, index: u32, level: u32) {
        self.emit_u8(Opcode::ReadLocal as u8);
        self.emit_u32(index);
        self.emit_u32(level);
    }

    pub fn emit_set_local(&mut self, index: u32, level: u32) {
        self.emit_u8(Opcode::SetLocal as u8);
        self.emit_u32(index);
        self.emit_u32(level);
    }

    pub fn emit_set_local_push(&mut self, index: u32, level: u32) {
        self.emit_u8(Opcode::SetLocalPush as u8);
        self.emit_u32(index);
        self.emit_u32(level);
    }

    pub fn emit_read_member_symbol(&mut self, symbol: u64) {
        self.emit_u8(Opcode::ReadMemberSymbol as u8);
        self.emit_u64(symbol);
    }

    pub fn emit_set_member_symbol(&mut self, symbol: u64) {
        self.emit_u8(Opcode::SetMemberSymbol as u8);
        self.emit_u64(symbol);
    }

    pub fn emit_set_member_symbol_push(&mut self, symbol: u64) {
        self.emit_u8(Opcode::SetMemberSymbolPush as u8);
        self.emit_u64(symbol);
    }

    pub fn emit_read_array_index(&mut self, index: u32) {
        self.emit_u8(Opcode::ReadArrayIndex as u8);
        self.emit_u32(index);
    }

    pub fn emit_set_array_index(&mut self, index: u32) {
        self.emit_u8(Opcode::SetArrayIndex as u8);
        self.emit_u32(index);
    }

    pub fn emit_set_array_index_push(&mut self, index: u32) {
        self.emit_u8(Opcode::SetArrayIndexPush as u8);
        self.emit_u32(index);
    }

    pub fn emit_put_self(&mut self, level: u32) {
        self.emit_u8(Opcode::PutSelf as u8);
        self.emit_u32(level);
    }

    /// Emit `putvalue` for a pool constant
    pub fn emit_put_value(&mut self, constant: Constant) {
        let index = self.constant(constant);
        self.emit_u8(Opcode::PutValue as u8);
        self.emit_u32(index);
    }

    pub fn emit_put_string(&mut self, pool_id: u32) {
        self.emit_u8(Opcode::PutString as u8);
        self.emit_u32(pool_id);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit_put_function(
        &mut self,
        name: u64,
        child: u32,
        argc: u32,
        lvarcount: u32,
        anonymous: bool,
        needs_arguments: bool,
    ) {
        self.emit_u8(Opcode::PutFunction as u8);
        self.emit_u64(name);
        self.emit_u32(child);
        self.emit_u32(argc);
        self.emit_u32(lvarcount);
        self.emit_u8(anonymous as u8);
        self.emit_u8(needs_arguments as u8);
    }

    pub fn emit_put_cfunction(&mut self, name: u64, argc: u32) {
        self.emit_u8(Opcode::PutCFunction as u8);
        self.emit_u64(name);
        self.emit_u32(argc);
    }

    pub fn emit_put_generator(&mut self, name: u64, child: u32, argc: u32, lvarcount: u32) {
        self.emit_u8(Opcode::PutGenerator as u8);
        self.emit_u64(name);
        self.emit_u32(child);
        self.emit_u32(argc);
        self.emit_u32(lvarcount);
    }

    pub fn emit_put_array(&mut self, count: u32) {
        self.emit_u8(Opcode::PutArray as u8);
        self.emit_u32(count);
    }

    pub fn emit_put_hash(&mut self, count: u32) {
        self.emit_u8(Opcode::PutHash as u8);
        self.emit_u32(count);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit_put_class(
        &mut self,
        name: u64,
        propertycount: u32,
        staticpropertycount: u32,
        methodcount: u32,
        staticmethodcount: u32,
        has_parent: bool,
        has_constructor: bool,
    ) {
        self.emit_u8(Opcode::PutClass as u8);
        self.emit_u64(name);
        self.emit_u32(propertycount);
        self.emit_u32(staticpropertycount);
        self.emit_u32(methodcount);
        self.emit_u32(staticmethodcount);
        self.emit_u8(has_parent as u8);
        self.emit_u8(has_constructor as u8);
    }

    pub fn emit_dupn(&mut self, count: u32) {
        self.emit_u8(Opcode::Dupn as u8);
        self.emit_u32(count);
    }

    pub fn emit_call(&mut self, argc: u32) {
        self.emit_u8(Opcode::Call as u8);
        self.emit_u32(argc);
    }

    pub fn emit_call_member(&mut self, argc: u32) {
        self.emit_u8(Opcode::CallMember as u8);
        self.emit_u32(argc);
    }

    /// Emit a branching instruction targeting `label`
    pub fn emit_branch_to(&mut self, opcode: Opcode, label: Label) {
        debug_assert_eq!(opcode.operand_size(), 4);
        let instruction_offset = self.code.len();
        self.emit_u8(opcode as u8);
        let payload_offset = self.code.len();
        self.emit_i32(0);
        self.patches.push(Patch {
            instruction_offset,
            payload_offset,
            label,
        });
    }

    /// Emit `registercatchtable` with the handler at `label`
    pub fn emit_register_catch_table(&mut self, label: Label) {
        self.emit_branch_to(Opcode::RegisterCatchTable, label);
    }

    /// Emit a branching instruction with a raw offset, bypassing labels
    pub fn emit_branch_raw(&mut self, opcode: Opcode, offset: i32) {
        debug_assert_eq!(opcode.operand_size(), 4);
        self.emit_u8(opcode as u8);
        self.emit_i32(offset);
    }

    /// Patch all branch sites and produce the artifact
    ///
    /// # Panics
    ///
    /// Panics if a label was never placed or if a relative offset does not
    /// fit in a signed 32-bit payload.
    pub fn finish(mut self) -> BlockArtifact {
        for patch in &self.patches {
            let target = self.labels[patch.label.0].expect("unplaced label in block");
            let relative = target as i64 - patch.instruction_offset as i64;
            let relative =
                i32::try_from(relative).expect("branch offset does not fit in 32 bits");
            self.code[patch.payload_offset..patch.payload_offset + 4]
                .copy_from_slice(&relative.to_le_bytes());
        }
        BlockArtifact {
            code: self.code,
            constants: self.constants,
            children: self.children,
        }
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Little-endian payload decoding over a finished code buffer
#[derive(Clone, Copy)]
pub struct BlockReader<'a> {
    code: &'a [u8],
}

impl<'a> BlockReader<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self { code }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Decode the opcode byte at `offset`
    pub fn opcode_at(&self, offset: usize) -> Option<Opcode> {
        self.code.get(offset).copied().and_then(Opcode::from_byte)
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.code[offset..offset + 4].try_into().unwrap())
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.code[offset..offset + 8].try_into().unwrap())
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.code[offset..offset + 4].try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_read_back() {
        let mut builder = BlockBuilder::new();
        builder.emit_read_local(3, 1);
        builder.emit_put_value(Constant::Int(42));
        builder.emit(Opcode::Add);
        builder.emit(Opcode::Return);
        let block = builder.finish();

        let reader = BlockReader::new(&block.code);
        assert_eq!(reader.opcode_at(0), Some(Opcode::ReadLocal));
        assert_eq!(reader.read_u32(1), 3);
        assert_eq!(reader.read_u32(5), 1);
        assert_eq!(reader.opcode_at(9), Some(Opcode::PutValue));
        assert_eq!(reader.read_u32(10), 0);
        assert_eq!(block.constants[0], Constant::Int(42));
        assert_eq!(reader.opcode_at(14), Some(Opcode::Add));
        assert_eq!(reader.opcode_at(15), Some(Opcode::Return));
    }

    #[test]
    fn test_forward_label_resolution() {
        let mut builder = BlockBuilder::new();
        let done = builder.label();
        builder.emit_branch_to(Opcode::Branch, done); // offset 0, 5 bytes
        builder.emit(Opcode::Pop); // offset 5
        builder.place_label(done); // offset 6
        builder.emit(Opcode::Return);
        let block = builder.finish();

        let reader = BlockReader::new(&block.code);
        assert_eq!(reader.read_i32(1), 6);
    }

    #[test]
    fn test_backward_label_resolution() {
        let mut builder = BlockBuilder::new();
        let top = builder.label();
        builder.place_label(top); // offset 0
        builder.emit(Opcode::Dup); // offset 0
        builder.emit_branch_to(Opcode::BranchIf, top); // offset 1
        let block = builder.finish();

        let reader = BlockReader::new(&block.code);
        assert_eq!(reader.read_i32(2), -1);
    }

    #[test]
    fn test_branch_offset_extremes_roundtrip() {
        // Raw emission path: the payload must survive i32::MIN / i32::MAX
        let mut builder = BlockBuilder::new();
        builder.emit_branch_raw(Opcode::Branch, i32::MAX);
        builder.emit_branch_raw(Opcode::Branch, i32::MIN);
        let block = builder.finish();

        let reader = BlockReader::new(&block.code);
        assert_eq!(reader.read_i32(1), i32::MAX);
        assert_eq!(reader.read_i32(6), i32::MIN);
    }

    #[test]
    fn test_children_and_constants_indices() {
        let mut builder = BlockBuilder::new();
        let child = BlockBuilder::new().finish();
        assert_eq!(builder.child(child), 0);
        assert_eq!(builder.constant(Constant::Null), 0);
        assert_eq!(builder.constant(Constant::Float(1.5)), 1);
        let block = builder.finish();
        assert_eq!(block.children.len(), 1);
        assert_eq!(block.constants.len(), 2);
    }

    #[test]
    #[should_panic(expected = "unplaced label")]
    fn test_unplaced_label_panics() {
        let mut builder = BlockBuilder::new();
        let label = builder.label();
        builder.emit_branch_to(Opcode::Branch, label);
        let _ = builder.finish();
    }
}
