//! Managed heap: fixed-size cells, free list, mark-and-sweep collection

pub mod cell;
pub mod heap;
pub mod roots;

pub use cell::{
    ArrayData, BlockData, CFunctionData, CPointerData, CPointerDestructor, CatchTableData,
    Cell, CellData, CellType, ClassData, CodePtr, Container, FrameData, FunctionData,
    GeneratorData, ObjectData, StringData, SHORT_STRING_MAX,
};
pub use heap::{GcStats, Heap, INITIAL_REGION_COUNT, REGION_CELL_COUNT, REGION_GROWTH_FACTOR};
pub use roots::{NoRoots, RootProvider, SliceRoots};
