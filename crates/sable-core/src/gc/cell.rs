//! Heap cell layout
//!
//! Every heap object occupies one fixed-size [`Cell`]: a flags byte (5-bit
//! type tag, mark bit, short-string bit) followed by the payload variant.
//! Cells are 8-byte aligned so values can tag their addresses directly.
//! Dead cells carry the free-list link in their payload.

use crate::symbol::SymbolId;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::ptr;

const FLAG_TYPE: u8 = 0b0001_1111;
const FLAG_MARK: u8 = 0b0010_0000;
const FLAG_SHORT_STRING: u8 = 0b0100_0000;

/// Maximum byte length of a string stored inline in its cell
pub const SHORT_STRING_MAX: usize = 62;

/// Heap object type tag, stored in the low five flag bits
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    Dead = 0,
    Integer = 1,
    Float = 2,
    String = 3,
    Numeric = 4,
    Boolean = 5,
    Null = 6,
    Object = 7,
    Array = 8,
    Function = 9,
    CFunction = 10,
    Class = 11,
    Symbol = 12,
    Frame = 13,
    CatchTable = 14,
    InstructionBlock = 15,
    CPointer = 16,
    Generator = 17,
}

impl CellType {
    pub const fn name(self) -> &'static str {
        match self {
            CellType::Dead => "dead",
            CellType::Integer => "integer",
            CellType::Float => "float",
            CellType::String => "string",
            CellType::Numeric => "numeric",
            CellType::Boolean => "boolean",
            CellType::Null => "null",
            CellType::Object => "object",
            CellType::Array => "array",
            CellType::Function => "function",
            CellType::CFunction => "cfunction",
            CellType::Class => "class",
            CellType::Symbol => "symbol",
            CellType::Frame => "frame",
            CellType::CatchTable => "catchtable",
            CellType::InstructionBlock => "instruction_block",
            CellType::CPointer => "cpointer",
            CellType::Generator => "generator",
        }
    }

    fn from_bits(bits: u8) -> CellType {
        match bits {
            1 => CellType::Integer,
            2 => CellType::Float,
            3 => CellType::String,
            4 => CellType::Numeric,
            5 => CellType::Boolean,
            6 => CellType::Null,
            7 => CellType::Object,
            8 => CellType::Array,
            9 => CellType::Function,
            10 => CellType::CFunction,
            11 => CellType::Class,
            12 => CellType::Symbol,
            13 => CellType::Frame,
            14 => CellType::CatchTable,
            15 => CellType::InstructionBlock,
            16 => CellType::CPointer,
            17 => CellType::Generator,
            _ => CellType::Dead,
        }
    }
}

/// Property container shared by objects, classes and callables
pub type Container = FxHashMap<SymbolId, Value>;

/// Position inside an instruction block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodePtr {
    /// The heap instruction block the offset points into
    pub block: Value,
    /// Byte offset of an opcode within the block's code buffer
    pub offset: usize,
}

impl CodePtr {
    pub const fn new(block: Value, offset: usize) -> Self {
        Self { block, offset }
    }
}

/// String payload: inline bytes up to [`SHORT_STRING_MAX`], boxed beyond
#[derive(Debug)]
pub enum StringData {
    Short { len: u8, data: [u8; SHORT_STRING_MAX] },
    Long(Box<str>),
}

impl StringData {
    pub fn from_str(s: &str) -> (StringData, bool) {
        if s.len() <= SHORT_STRING_MAX {
            let mut data = [0u8; SHORT_STRING_MAX];
            data[..s.len()].copy_from_slice(s.as_bytes());
            (
                StringData::Short {
                    len: s.len() as u8,
                    data,
                },
                true,
            )
        } else {
            (StringData::Long(s.into()), false)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            // Short buffers are only ever filled with a complete &str
            StringData::Short { len, data } => unsafe {
                std::str::from_utf8_unchecked(&data[..*len as usize])
            },
            StringData::Long(s) => s,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StringData::Short { len, .. } => *len as usize,
            StringData::Long(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct ObjectData {
    /// Class the object was constructed from; null for hash literals
    pub klass: Value,
    pub container: Container,
}

#[derive(Debug)]
pub struct ArrayData {
    pub data: Vec<Value>,
}

#[derive(Debug)]
pub struct FunctionData {
    pub name: Value,
    pub argc: u32,
    pub lvarcount: u32,
    /// Lexical context frame the body closes over
    pub context: Value,
    pub block: Value,
    pub body_offset: usize,
    pub anonymous: bool,
    pub needs_arguments: bool,
    pub bound_self_set: bool,
    pub bound_self: Value,
    pub container: Container,
}

#[derive(Debug)]
pub struct CFunctionData {
    pub name: Value,
    /// Index into the VM's native-function registry
    pub native_id: u32,
    pub argc: u32,
    pub bound_self_set: bool,
    pub bound_self: Value,
    pub container: Container,
}

#[derive(Debug)]
pub struct GeneratorData {
    pub name: Value,
    /// Lexical context frame of the defining scope
    pub context: Value,
    pub block: Value,
    pub argc: u32,
    pub lvarcount: u32,
    /// Offset execution continues from on the next resume
    pub resume_offset: usize,
    /// Persisted activation frame, created on the first resume
    pub frame: Value,
    /// Operand-stack slice saved at the last yield
    pub saved_stack: Vec<Value>,
    pub started: bool,
    pub finished: bool,
    /// Guards against re-entrant resumes
    pub running: bool,
    pub container: Container,
}

#[derive(Debug)]
pub struct ClassData {
    pub name: Value,
    pub constructor: Value,
    /// Symbols of the instance properties this class declares
    pub member_properties: Vec<SymbolId>,
    pub prototype: Value,
    pub parent_class: Value,
    pub container: Container,
}

#[derive(Debug)]
pub struct FrameData {
    /// Caller frame
    pub parent: Value,
    /// Frame whose locals are visible as free variables
    pub parent_environment: Value,
    /// Catch table that was active when this frame was entered
    pub catchtable: Value,
    pub function: Value,
    /// Local slots
    pub environment: Vec<Value>,
    pub self_value: Value,
    pub return_address: Option<CodePtr>,
    pub halt_after_return: bool,
    /// Operand-stack depth when the frame was entered
    pub stack_base: usize,
    /// Owning generator when this frame belongs to a resumed generator
    pub generator: Value,
}

#[derive(Debug)]
pub struct CatchTableData {
    /// Handler position
    pub address: CodePtr,
    /// Operand-stack depth at registration; restored on throw
    pub stacksize: usize,
    pub frame: Value,
    pub parent: Value,
}

#[derive(Debug)]
pub struct BlockData {
    pub code: Vec<u8>,
    /// Immediate constants referenced by `putvalue`
    pub constants: Vec<Value>,
    /// Nested function bodies referenced by `putfunction`/`putgenerator`
    pub children: Vec<Value>,
}

/// Destructor invoked exactly once when the cell is collected
pub type CPointerDestructor = unsafe fn(*mut ());

pub struct CPointerData {
    pub data: *mut (),
    pub destructor: Option<CPointerDestructor>,
}

impl std::fmt::Debug for CPointerData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CPointerData")
            .field("data", &self.data)
            .field("has_destructor", &self.destructor.is_some())
            .finish()
    }
}

/// Cell payload, one variant per heap type
#[derive(Debug)]
pub enum CellData {
    /// Dead cell: free-list link
    Free { next: *mut Cell },
    Float(f64),
    String(StringData),
    Object(ObjectData),
    Array(ArrayData),
    Function(FunctionData),
    CFunction(CFunctionData),
    Generator(GeneratorData),
    Class(ClassData),
    Frame(FrameData),
    CatchTable(CatchTableData),
    InstructionBlock(BlockData),
    CPointer(CPointerData),
}

/// One fixed-size heap slot
///
/// The flags byte is authoritative for the type tag and the mark bit; the
/// payload variant always matches the tag.
#[repr(align(8))]
#[derive(Debug)]
pub struct Cell {
    flags: u8,
    data: CellData,
}

macro_rules! cell_accessors {
    ($( $as:ident, $as_mut:ident => $variant:ident ( $ty:ty ) ),* $(,)?) => {
        $(
            #[inline]
            pub fn $as(&self) -> Option<&$ty> {
                match &self.data {
                    CellData::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            #[inline]
            pub fn $as_mut(&mut self) -> Option<&mut $ty> {
                match &mut self.data {
                    CellData::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        )*
    };
}

impl Cell {
    /// A dead cell with no free-list successor
    pub const fn free() -> Self {
        Cell {
            flags: 0,
            data: CellData::Free { next: ptr::null_mut() },
        }
    }

    #[inline]
    pub fn cell_type(&self) -> CellType {
        CellType::from_bits(self.flags & FLAG_TYPE)
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.flags & FLAG_MARK != 0
    }

    #[inline]
    pub fn set_mark(&mut self, mark: bool) {
        if mark {
            self.flags |= FLAG_MARK;
        } else {
            self.flags &= !FLAG_MARK;
        }
    }

    #[inline]
    pub fn short_string(&self) -> bool {
        self.flags & FLAG_SHORT_STRING != 0
    }

    /// Initialize the cell with a fresh payload, clearing mark and
    /// short-string bits
    pub fn set(&mut self, cell_type: CellType, data: CellData) {
        self.flags = cell_type as u8;
        self.data = data;
    }

    /// Initialize the cell as a string, tracking the short-string bit
    pub fn set_string(&mut self, data: StringData, short: bool) {
        self.flags = CellType::String as u8;
        if short {
            self.flags |= FLAG_SHORT_STRING;
        }
        self.data = CellData::String(data);
    }

    pub fn data(&self) -> &CellData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut CellData {
        &mut self.data
    }

    /// Successor on the free list; only meaningful for dead cells
    pub fn free_next(&self) -> *mut Cell {
        match self.data {
            CellData::Free { next } => next,
            _ => ptr::null_mut(),
        }
    }

    /// Run the cpointer destructor, at most once
    pub fn run_cpointer_destructor(&mut self) {
        if let CellData::CPointer(cp) = &mut self.data {
            if let Some(destructor) = cp.destructor.take() {
                unsafe { destructor(cp.data) };
            }
        }
    }

    /// Drop the payload and return the cell to the free list rooted at
    /// `next`
    pub fn reset_free(&mut self, next: *mut Cell) {
        self.run_cpointer_destructor();
        self.flags = CellType::Dead as u8;
        self.data = CellData::Free { next };
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self.data {
            CellData::Float(f) => Some(f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string(&self) -> Option<&StringData> {
        match &self.data {
            CellData::String(s) => Some(s),
            _ => None,
        }
    }

    cell_accessors! {
        as_object, as_object_mut => Object(ObjectData),
        as_array, as_array_mut => Array(ArrayData),
        as_function, as_function_mut => Function(FunctionData),
        as_cfunction, as_cfunction_mut => CFunction(CFunctionData),
        as_generator, as_generator_mut => Generator(GeneratorData),
        as_class, as_class_mut => Class(ClassData),
        as_frame, as_frame_mut => Frame(FrameData),
        as_catchtable, as_catchtable_mut => CatchTable(CatchTableData),
        as_block, as_block_mut => InstructionBlock(BlockData),
        as_cpointer, as_cpointer_mut => CPointer(CPointerData),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_alignment() {
        assert_eq!(std::mem::align_of::<Cell>() % 8, 0);
    }

    #[test]
    fn test_fresh_cell_is_dead() {
        let cell = Cell::free();
        assert_eq!(cell.cell_type(), CellType::Dead);
        assert!(!cell.mark());
        assert!(cell.free_next().is_null());
    }

    #[test]
    fn test_mark_bit() {
        let mut cell = Cell::free();
        cell.set(CellType::Float, CellData::Float(1.0));
        assert!(!cell.mark());
        cell.set_mark(true);
        assert!(cell.mark());
        assert_eq!(cell.cell_type(), CellType::Float);
        cell.set_mark(false);
        assert!(!cell.mark());
    }

    #[test]
    fn test_short_string_bit() {
        let mut cell = Cell::free();
        let (data, short) = StringData::from_str("hi");
        cell.set_string(data, short);
        assert!(cell.short_string());
        assert_eq!(cell.as_string().unwrap().as_str(), "hi");

        let long = "x".repeat(SHORT_STRING_MAX + 1);
        let (data, short) = StringData::from_str(&long);
        cell.set_string(data, short);
        assert!(!cell.short_string());
        assert_eq!(cell.as_string().unwrap().as_str(), long);
    }

    #[test]
    fn test_string_transition_boundary() {
        let at_max = "a".repeat(SHORT_STRING_MAX);
        let (data, short) = StringData::from_str(&at_max);
        assert!(short);
        assert_eq!(data.len(), SHORT_STRING_MAX);

        let over = "a".repeat(SHORT_STRING_MAX + 1);
        let (data, short) = StringData::from_str(&over);
        assert!(!short);
        assert_eq!(data.as_str(), over);
    }

    #[test]
    fn test_reset_free_links() {
        let mut a = Cell::free();
        let mut b = Cell::free();
        b.set(
            CellType::Array,
            CellData::Array(ArrayData { data: vec![Value::integer(1)] }),
        );
        b.reset_free(&mut a as *mut Cell);
        assert_eq!(b.cell_type(), CellType::Dead);
        assert_eq!(b.free_next(), &mut a as *mut Cell);
    }

    #[test]
    fn test_cpointer_destructor_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        unsafe fn destructor(_data: *mut ()) {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let mut cell = Cell::free();
        cell.set(
            CellType::CPointer,
            CellData::CPointer(CPointerData {
                data: std::ptr::null_mut(),
                destructor: Some(destructor),
            }),
        );
        cell.run_cpointer_destructor();
        cell.run_cpointer_destructor();
        cell.reset_free(std::ptr::null_mut());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
