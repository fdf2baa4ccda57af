//! Primitive-class registry
//!
//! Method lookup on a non-object receiver (an integer, a string, an array,
//! a function value, …) resolves through the class installed here for that
//! type. The prelude installs these classes through the `set_primitive_*`
//! API; the registry slots are GC roots.

use sable_core::Value;

/// Per-type class references used by member lookup
#[derive(Debug, Clone)]
pub struct PrimitiveRegistry {
    pub value: Value,
    pub object: Value,
    pub class: Value,
    pub array: Value,
    pub string: Value,
    pub number: Value,
    pub function: Value,
    pub generator: Value,
    pub boolean: Value,
    pub null: Value,
}

impl PrimitiveRegistry {
    pub fn new() -> Self {
        Self {
            value: Value::null(),
            object: Value::null(),
            class: Value::null(),
            array: Value::null(),
            string: Value::null(),
            number: Value::null(),
            function: Value::null(),
            generator: Value::null(),
            boolean: Value::null(),
            null: Value::null(),
        }
    }

    /// Visit every installed class for root marking
    pub fn roots(&self, visit: &mut dyn FnMut(Value)) {
        for value in [
            self.value,
            self.object,
            self.class,
            self.array,
            self.string,
            self.number,
            self.function,
            self.generator,
            self.boolean,
            self.null,
        ] {
            visit(value);
        }
    }
}

impl Default for PrimitiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}
