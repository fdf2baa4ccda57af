//! The managed cell heap and its mark-and-sweep collector
//!
//! The heap is a vector of regions; each region is a contiguous boxed slice
//! of fixed-size cells. All cells from all regions share one free list
//! threaded through the dead cells' payloads. Allocation pops the free-list
//! head; draining the list triggers a collection, and a fruitless
//! collection grows the heap by a factor of two.
//!
//! Region allocations never move, so cell addresses are stable for the
//! lifetime of the heap and values can tag them directly.

use super::cell::{Cell, CellData, CellType};
use super::roots::RootProvider;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::ptr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cells per region
pub const REGION_CELL_COUNT: usize = 1024;
/// Regions allocated up front
pub const INITIAL_REGION_COUNT: usize = 8;
/// Growth factor applied when a collection frees nothing
pub const REGION_GROWTH_FACTOR: usize = 2;

/// Collector statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total number of collections
    pub collections: usize,
    /// Cells marked live in the last collection
    pub last_marked: usize,
    /// Cells freed in the last collection
    pub last_freed: usize,
    /// Total cells freed across all collections
    pub total_freed: usize,
    /// Last collection duration
    pub last_pause: Duration,
    /// Total pause time across all collections
    pub total_pause: Duration,
}

/// The managed heap
pub struct Heap {
    regions: Vec<Box<[Cell]>>,
    free: *mut Cell,
    /// Temporary-root multiset: raw value bits -> registration count
    temporaries: FxHashMap<u64, usize>,
    stats: GcStats,
}

impl Heap {
    pub fn new() -> Self {
        let mut heap = Self {
            regions: Vec::with_capacity(INITIAL_REGION_COUNT),
            free: ptr::null_mut(),
            temporaries: FxHashMap::default(),
            stats: GcStats::default(),
        };
        for _ in 0..INITIAL_REGION_COUNT {
            heap.add_region();
        }
        heap
    }

    /// Allocate a cell, collecting and growing as needed
    ///
    /// The returned cell is dead and unmarked; the caller initializes it
    /// and must root the resulting value before the next allocation.
    ///
    /// # Panics
    ///
    /// Panics if the heap cannot be grown to satisfy the allocation.
    pub fn allocate(&mut self, roots: &dyn RootProvider) -> *mut Cell {
        let cell = self.free;
        assert!(!cell.is_null(), "allocation from an exhausted heap");
        self.free = unsafe { (*cell).free_next() };

        // The last cell was just handed out; collect now so the next
        // allocation never observes an empty list.
        if self.free.is_null() {
            self.collect(roots);
            if self.free.is_null() {
                self.grow();
                if self.free.is_null() {
                    eprintln!("sable: heap exhausted after growth, aborting");
                    panic!("heap exhausted");
                }
            }
        }

        cell
    }

    /// Run a full mark-and-sweep collection
    pub fn collect(&mut self, roots: &dyn RootProvider) {
        let start = Instant::now();

        // Mark phase: roots, then the temporary multiset
        let mut worklist: Vec<Value> = Vec::new();
        roots.provide(&mut |value| Self::mark_value(&mut worklist, value));
        for &raw in self.temporaries.keys() {
            Self::mark_value(&mut worklist, Value::from_raw(raw));
        }

        let mut marked = worklist.len();
        while let Some(value) = worklist.pop() {
            let cell = unsafe { &*value.cell_ptr() };
            let before = worklist.len();
            Self::visit_edges(cell, &mut |edge| Self::mark_value(&mut worklist, edge));
            marked += worklist.len() - before;
        }

        // Sweep phase: unmarked live cells are destructed and returned to
        // the free list; dead cells are already on it.
        let mut freed = 0usize;
        let mut free = self.free;
        for region in &mut self.regions {
            for cell in region.iter_mut() {
                if cell.mark() {
                    cell.set_mark(false);
                    continue;
                }
                if cell.cell_type() == CellType::Dead {
                    continue;
                }
                cell.reset_free(free);
                free = cell as *mut Cell;
                freed += 1;
            }
        }
        self.free = free;

        let pause = start.elapsed();
        self.stats.collections += 1;
        self.stats.last_marked = marked;
        self.stats.last_freed = freed;
        self.stats.total_freed += freed;
        self.stats.last_pause = pause;
        self.stats.total_pause += pause;

        debug!(
            target: "sable_gc",
            freed,
            marked,
            pause_us = pause.as_micros() as u64,
            "collection finished"
        );
    }

    fn mark_value(worklist: &mut Vec<Value>, value: Value) {
        if !value.is_pointer() {
            return;
        }
        let cell = unsafe { &mut *value.cell_ptr() };
        if cell.mark() {
            return;
        }
        cell.set_mark(true);
        worklist.push(value);
    }

    /// Visit the outgoing edges of a live cell
    fn visit_edges(cell: &Cell, visit: &mut dyn FnMut(Value)) {
        match cell.data() {
            CellData::Free { .. } | CellData::Float(_) | CellData::String(_) => {}
            CellData::CPointer(_) => {}
            CellData::Object(object) => {
                visit(object.klass);
                for &value in object.container.values() {
                    visit(value);
                }
            }
            CellData::Array(array) => {
                for &value in &array.data {
                    visit(value);
                }
            }
            CellData::Function(function) => {
                visit(function.context);
                visit(function.block);
                if function.bound_self_set {
                    visit(function.bound_self);
                }
                for &value in function.container.values() {
                    visit(value);
                }
            }
            CellData::CFunction(cfunction) => {
                if cfunction.bound_self_set {
                    visit(cfunction.bound_self);
                }
                for &value in cfunction.container.values() {
                    visit(value);
                }
            }
            CellData::Generator(generator) => {
                visit(generator.context);
                visit(generator.block);
                visit(generator.frame);
                for &value in &generator.saved_stack {
                    visit(value);
                }
                for &value in generator.container.values() {
                    visit(value);
                }
            }
            CellData::Class(class) => {
                visit(class.constructor);
                visit(class.prototype);
                visit(class.parent_class);
                for &value in class.container.values() {
                    visit(value);
                }
            }
            CellData::Frame(frame) => {
                visit(frame.parent);
                visit(frame.parent_environment);
                visit(frame.catchtable);
                visit(frame.function);
                visit(frame.self_value);
                visit(frame.generator);
                if let Some(ra) = &frame.return_address {
                    visit(ra.block);
                }
                for &value in &frame.environment {
                    visit(value);
                }
            }
            CellData::CatchTable(table) => {
                visit(table.address.block);
                visit(table.frame);
                visit(table.parent);
            }
            CellData::InstructionBlock(block) => {
                for &value in &block.constants {
                    visit(value);
                }
                for &value in &block.children {
                    visit(value);
                }
            }
        }
    }

    fn add_region(&mut self) {
        let mut region: Box<[Cell]> =
            (0..REGION_CELL_COUNT).map(|_| Cell::free()).collect();
        let mut next = self.free;
        for cell in region.iter_mut() {
            if let CellData::Free { next: link } = cell.data_mut() {
                *link = next;
            }
            next = cell as *mut Cell;
        }
        self.free = next;
        self.regions.push(region);
    }

    fn grow(&mut self) {
        let count = self.regions.len();
        let add = count * REGION_GROWTH_FACTOR - count;
        debug!(target: "sable_gc", regions = count, adding = add, "growing heap");
        for _ in 0..add {
            self.add_region();
        }
    }

    /// Register a temporary root; immediates are ignored
    pub fn register_temporary(&mut self, value: Value) {
        if value.is_pointer() {
            *self.temporaries.entry(value.raw()).or_insert(0) += 1;
        }
    }

    /// Remove exactly one registration of `value`
    pub fn unregister_temporary(&mut self, value: Value) {
        if !value.is_pointer() {
            return;
        }
        match self.temporaries.get_mut(&value.raw()) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.temporaries.remove(&value.raw());
            }
            None => debug_assert!(false, "unregistering a value that was never registered"),
        }
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Total number of cells across all regions
    pub fn cell_count(&self) -> usize {
        self.regions.len() * REGION_CELL_COUNT
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Length of the free list; linear walk, intended for tests and
    /// diagnostics
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.free;
        while !cursor.is_null() {
            count += 1;
            cursor = unsafe { (*cursor).free_next() };
        }
        count
    }

    /// Number of initialized (non-dead) cells
    pub fn live_count(&self) -> usize {
        self.cell_count() - self.free_count()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Cpointer destructors still pending on live cells run here; all
        // other payloads are dropped with their regions.
        for region in &mut self.regions {
            for cell in region.iter_mut() {
                cell.run_cpointer_destructor();
            }
        }
    }
}

// SAFETY: the heap is owned and mutated by the main VM thread only; worker
// threads never receive cell pointers. Send allows the owning VM to be
// moved between threads as a whole.
unsafe impl Send for Heap {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::cell::{ArrayData, CPointerData, ObjectData, StringData};
    use crate::gc::roots::{NoRoots, SliceRoots};
    use rustc_hash::FxHashMap;

    fn alloc_array(heap: &mut Heap, roots: &dyn RootProvider, values: Vec<Value>) -> Value {
        let cell = heap.allocate(roots);
        unsafe {
            (*cell).set(CellType::Array, CellData::Array(ArrayData { data: values }));
            Value::from_cell(cell)
        }
    }

    #[test]
    fn test_initial_capacity() {
        let heap = Heap::new();
        assert_eq!(heap.region_count(), INITIAL_REGION_COUNT);
        assert_eq!(heap.cell_count(), INITIAL_REGION_COUNT * REGION_CELL_COUNT);
        assert_eq!(heap.free_count(), heap.cell_count());
    }

    #[test]
    fn test_allocate_reduces_free_list() {
        let mut heap = Heap::new();
        let before = heap.free_count();
        let _ = alloc_array(&mut heap, &NoRoots, vec![]);
        assert_eq!(heap.free_count(), before - 1);
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = Heap::new();
        let _garbage = alloc_array(&mut heap, &NoRoots, vec![Value::integer(1)]);
        let survivor = alloc_array(&mut heap, &NoRoots, vec![Value::integer(2)]);

        let keep = [survivor];
        heap.collect(&SliceRoots(&keep));

        assert_eq!(heap.stats().last_freed, 1);
        assert_eq!(heap.live_count(), 1);
        let cell = unsafe { &*survivor.cell_ptr() };
        assert_eq!(cell.as_array().unwrap().data[0], Value::integer(2));
    }

    #[test]
    fn test_collect_traces_edges() {
        let mut heap = Heap::new();
        let inner = alloc_array(&mut heap, &NoRoots, vec![Value::integer(7)]);
        let outer = alloc_array(&mut heap, &NoRoots, vec![inner]);

        let keep = [outer];
        heap.collect(&SliceRoots(&keep));

        // Both survive: inner is reachable through outer
        assert_eq!(heap.stats().last_freed, 0);
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn test_collect_handles_cycles() {
        let mut heap = Heap::new();
        let a = alloc_array(&mut heap, &NoRoots, vec![]);
        let b = alloc_array(&mut heap, &NoRoots, vec![a]);
        unsafe {
            (*a.cell_ptr()).as_array_mut().unwrap().data.push(b);
        }

        // Cycle kept alive through one root
        let keep = [a];
        heap.collect(&SliceRoots(&keep));
        assert_eq!(heap.live_count(), 2);

        // Dropping the root frees the whole cycle
        heap.collect(&NoRoots);
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.stats().last_freed, 2);
    }

    #[test]
    fn test_temporaries_protect_values() {
        let mut heap = Heap::new();
        let value = alloc_array(&mut heap, &NoRoots, vec![]);
        heap.register_temporary(value);

        heap.collect(&NoRoots);
        assert_eq!(heap.live_count(), 1);

        heap.unregister_temporary(value);
        heap.collect(&NoRoots);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_temporaries_multiset_semantics() {
        let mut heap = Heap::new();
        let value = alloc_array(&mut heap, &NoRoots, vec![]);
        heap.register_temporary(value);
        heap.register_temporary(value);

        heap.unregister_temporary(value);
        heap.collect(&NoRoots);
        assert_eq!(heap.live_count(), 1, "second registration still protects");

        heap.unregister_temporary(value);
        heap.collect(&NoRoots);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_exhaustion_collects_then_grows() {
        let mut heap = Heap::new();
        let capacity = heap.cell_count();

        // Exhaust every cell with unreachable garbage; the collection
        // triggered by the last pop reclaims all of it.
        for _ in 0..capacity {
            let _ = alloc_array(&mut heap, &NoRoots, vec![]);
        }
        assert!(heap.stats().collections >= 1);
        assert_eq!(heap.region_count(), INITIAL_REGION_COUNT);

        // Everything was garbage, so the free list refilled
        assert!(heap.free_count() > 0);
    }

    #[test]
    fn test_growth_when_everything_is_rooted() {
        let mut heap = Heap::new();
        let capacity = heap.cell_count();

        let mut live = Vec::with_capacity(capacity);
        struct VecRoots<'a>(&'a Vec<Value>);
        impl RootProvider for VecRoots<'_> {
            fn provide(&self, visit: &mut dyn FnMut(Value)) {
                for v in self.0 {
                    visit(*v);
                }
            }
        }

        for _ in 0..capacity {
            // Rebuild the provider each round since `live` grows
            let value = {
                let roots = VecRoots(&live);
                let cell = heap.allocate(&roots);
                unsafe {
                    (*cell).set(CellType::Array, CellData::Array(ArrayData { data: vec![] }));
                    Value::from_cell(cell)
                }
            };
            live.push(value);
        }

        // All cells rooted: the heap had to grow
        assert!(heap.region_count() > INITIAL_REGION_COUNT);
        assert_eq!(heap.live_count(), capacity);
    }

    #[test]
    fn test_drop_half_matches_freed_count() {
        let mut heap = Heap::new();
        let total = 64;
        let mut values = Vec::new();
        for i in 0..total {
            values.push(alloc_array(&mut heap, &NoRoots, vec![Value::integer(i)]));
        }

        let survivors: Vec<Value> = values.iter().copied().step_by(2).collect();
        heap.collect(&SliceRoots(&survivors));

        assert_eq!(heap.stats().last_freed, total as usize / 2);
        for (index, value) in survivors.iter().enumerate() {
            let cell = unsafe { &*value.cell_ptr() };
            assert_eq!(
                cell.as_array().unwrap().data[0],
                Value::integer(index as i64 * 2)
            );
        }
    }

    #[test]
    fn test_string_payloads_freed() {
        let mut heap = Heap::new();
        let cell = heap.allocate(&NoRoots);
        let long = "y".repeat(200);
        let (data, short) = StringData::from_str(&long);
        unsafe { (*cell).set_string(data, short) };

        heap.collect(&NoRoots);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_cpointer_destructor_at_sweep() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static SWEPT: AtomicUsize = AtomicUsize::new(0);

        unsafe fn destructor(_data: *mut ()) {
            SWEPT.fetch_add(1, Ordering::SeqCst);
        }

        let mut heap = Heap::new();
        let cell = heap.allocate(&NoRoots);
        unsafe {
            (*cell).set(
                CellType::CPointer,
                CellData::CPointer(CPointerData {
                    data: std::ptr::null_mut(),
                    destructor: Some(destructor),
                }),
            );
        }

        heap.collect(&NoRoots);
        assert_eq!(SWEPT.load(Ordering::SeqCst), 1);

        // A second collection must not call it again
        heap.collect(&NoRoots);
        assert_eq!(SWEPT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_object_edges_marked() {
        let mut heap = Heap::new();
        let member = alloc_array(&mut heap, &NoRoots, vec![]);
        let cell = heap.allocate(&NoRoots);
        let object = unsafe {
            let mut container = FxHashMap::default();
            container.insert(1u64, member);
            (*cell).set(
                CellType::Object,
                CellData::Object(ObjectData { klass: Value::null(), container }),
            );
            Value::from_cell(cell)
        };

        let keep = [object];
        heap.collect(&SliceRoots(&keep));
        assert_eq!(heap.live_count(), 2);
    }
}
