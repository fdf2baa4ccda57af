//! Member access and dynamic dispatch
//!
//! Reads check the receiver's own container, then a handful of built-in
//! members, then walk the class chain: for each class the prototype's
//! container is consulted before moving to the parent. Non-object
//! receivers resolve through the primitive-class registry. Missing reads
//! produce null; writes create the property on the receiver's container.

use crate::vm::error::OpResult;
use crate::vm::machine::{cell_mut, cell_ref, Vm};
use sable_core::gc::{CellData, CellType};
use sable_core::symbol::SymbolId;
use sable_core::Value;

impl Vm {
    /// The class used to resolve methods on `value`
    pub(crate) fn class_of(&self, value: Value) -> Value {
        if value.is_integer() || value.is_ifloat() {
            return self.primitives.number;
        }
        if value.is_boolean() {
            return self.primitives.boolean;
        }
        if value.is_null() {
            return self.primitives.null;
        }
        if value.is_symbol() {
            return self.primitives.value;
        }
        if !value.is_pointer() {
            return Value::null();
        }
        let cell = unsafe { cell_ref(value) };
        match cell.cell_type() {
            CellType::Object => {
                let klass = cell.as_object().expect("object cell").klass;
                if klass.is_pointer() {
                    klass
                } else {
                    self.primitives.object
                }
            }
            CellType::Class => self.primitives.class,
            CellType::Array => self.primitives.array,
            CellType::String => self.primitives.string,
            CellType::Float => self.primitives.number,
            CellType::Function | CellType::CFunction => self.primitives.function,
            CellType::Generator => self.primitives.generator,
            _ => self.primitives.value,
        }
    }

    /// Own-container lookup for container-carrying values
    fn container_get(&self, value: Value, symbol: SymbolId) -> Option<Value> {
        if !value.is_pointer() {
            return None;
        }
        let cell = unsafe { cell_ref(value) };
        let container = match cell.data() {
            CellData::Object(o) => &o.container,
            CellData::Class(c) => &c.container,
            CellData::Function(f) => &f.container,
            CellData::CFunction(f) => &f.container,
            CellData::Generator(g) => &g.container,
            _ => return None,
        };
        container.get(&symbol).copied()
    }

    /// Built-in members resolved before the class chain
    fn builtin_member(&mut self, source: Value, symbol: SymbolId) -> Option<Value> {
        if symbol == self.syms.length {
            if source.is_pointer() {
                let cell = unsafe { cell_ref(source) };
                match cell.data() {
                    CellData::String(s) => return Some(Value::integer(s.len() as i64)),
                    CellData::Array(a) => return Some(Value::integer(a.data.len() as i64)),
                    _ => {}
                }
            }
            return None;
        }
        if symbol == self.syms.klass {
            let klass = self.class_of(source);
            if !klass.is_null() {
                return Some(klass);
            }
            return None;
        }
        if source.is_pointer() {
            let cell = unsafe { cell_ref(source) };
            match cell.data() {
                CellData::Class(c) => {
                    if symbol == self.syms.name {
                        return Some(c.name);
                    }
                    if symbol == self.syms.prototype {
                        return Some(c.prototype);
                    }
                    if symbol == self.syms.parent_class {
                        return Some(c.parent_class);
                    }
                    if symbol == self.syms.constructor {
                        return Some(c.constructor);
                    }
                }
                CellData::Function(f) => {
                    if symbol == self.syms.name {
                        return Some(f.name);
                    }
                }
                CellData::CFunction(f) => {
                    if symbol == self.syms.name {
                        return Some(f.name);
                    }
                }
                CellData::Generator(g) => {
                    if symbol == self.syms.name {
                        return Some(g.name);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Walk a class chain looking for `symbol` in each prototype
    fn find_prototype_value(&self, mut klass: Value, symbol: SymbolId) -> Option<Value> {
        while klass.is_pointer() {
            let data = unsafe { cell_ref(klass) }.as_class()?;
            if let Some(value) = self.container_get(data.prototype, symbol) {
                return Some(value);
            }
            klass = data.parent_class;
        }
        None
    }

    /// `source.symbol` with the full lookup order; missing members read
    /// as null
    pub(crate) fn read_member_symbol(&mut self, source: Value, symbol: SymbolId) -> Value {
        if let Some(value) = self.container_get(source, symbol) {
            return value;
        }
        if let Some(value) = self.builtin_member(source, symbol) {
            return value;
        }
        let klass = self.class_of(source);
        if let Some(value) = self.find_prototype_value(klass, symbol) {
            return value;
        }
        Value::null()
    }

    /// `target.symbol = value`; creates the property on the container
    pub(crate) fn set_member_symbol(
        &mut self,
        target: Value,
        symbol: SymbolId,
        value: Value,
    ) -> OpResult {
        if target.is_pointer() {
            let cell = unsafe { cell_mut(target) };
            let container = match cell.data_mut() {
                CellData::Object(o) => Some(&mut o.container),
                CellData::Class(c) => Some(&mut c.container),
                CellData::Function(f) => Some(&mut f.container),
                CellData::CFunction(f) => Some(&mut f.container),
                CellData::Generator(g) => Some(&mut g.container),
                _ => None,
            };
            if let Some(container) = container {
                container.insert(symbol, value);
                return Ok(());
            }
        }
        let type_name = target.type_name();
        self.throw_message(&format!("cannot assign a member of a {type_name} value"))
    }

    /// Dynamic-key read: integer keys index arrays, strings and symbols
    /// name members
    pub(crate) fn read_member_value(&mut self, source: Value, key: Value) -> OpResult {
        if key.is_integer() && source.is_pointer() {
            let cell = unsafe { cell_ref(source) };
            if let CellData::Array(array) = cell.data() {
                let index = key.as_integer();
                let value = if index >= 0 {
                    array.data.get(index as usize).copied().unwrap_or_default()
                } else {
                    Value::null()
                };
                self.push_stack(value);
                return Ok(());
            }
        }
        match self.key_to_symbol(key) {
            Some(symbol) => {
                let value = self.read_member_symbol(source, symbol);
                self.push_stack(value);
                Ok(())
            }
            None => {
                let type_name = key.type_name();
                self.throw_message(&format!("cannot use a {type_name} value as a member key"))
            }
        }
    }

    /// Dynamic-key write; pushes nothing, the caller decides what stays on
    /// the stack
    pub(crate) fn set_member_value(
        &mut self,
        target: Value,
        key: Value,
        value: Value,
    ) -> OpResult {
        if key.is_integer() && target.is_pointer() {
            let is_array = unsafe { cell_ref(target) }.cell_type() == CellType::Array;
            if is_array {
                let index = key.as_integer();
                let len = unsafe { cell_ref(target) }
                    .as_array()
                    .expect("array cell")
                    .data
                    .len();
                if index < 0 || index as usize >= len {
                    return self.throw_message(&format!(
                        "array index {index} is out of bounds (length {len})"
                    ));
                }
                unsafe { cell_mut(target) }
                    .as_array_mut()
                    .expect("array cell")
                    .data[index as usize] = value;
                return Ok(());
            }
        }
        match self.key_to_symbol(key) {
            Some(symbol) => self.set_member_symbol(target, symbol, value),
            None => {
                let type_name = key.type_name();
                self.throw_message(&format!("cannot use a {type_name} value as a member key"))
            }
        }
    }

    /// Convert a dynamic key into a symbol id
    ///
    /// Strings intern through the symbol table so later reads by symbol
    /// find the same slot.
    fn key_to_symbol(&mut self, key: Value) -> Option<SymbolId> {
        if key.is_symbol() {
            return Some(key.symbol_id());
        }
        if key.is_pointer() {
            let cell = unsafe { cell_ref(key) };
            if let CellData::String(s) = cell.data() {
                return Some(self.context.artifacts.symtable.intern(s.as_str()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::context::{RunFlags, VmContext};
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
    fn test_missing_member_reads_null() {
        let mut vm = test_vm();
        let object = vm.create_object(Value::null(), 0);
        let sym = vm.context.artifacts.symtable.intern("missing");
        assert!(vm.read_member_symbol(object, sym).is_null());
    }

    #[test]
    fn test_write_creates_property() {
        let mut vm = test_vm();
        let object = vm.create_object(Value::null(), 0);
        let sym = vm.context.artifacts.symtable.intern("x");
        vm.set_member_symbol(object, sym, Value::integer(9)).unwrap();
        assert_eq!(vm.read_member_symbol(object, sym), Value::integer(9));
    }

    #[test]
    fn test_length_builtin() {
        let mut vm = test_vm();
        let sym = vm.syms.length;
        let s = vm.create_string("hello");
        assert_eq!(vm.read_member_symbol(s, sym), Value::integer(5));
        let a = vm.create_array(vec![Value::null(), Value::null()]);
        assert_eq!(vm.read_member_symbol(a, sym), Value::integer(2));
    }

    #[test]
    fn test_prototype_chain_lookup() {
        let mut vm = test_vm();
        let method_sym = vm.context.artifacts.symtable.intern("m");

        // class A with prototype method m
        let proto_a = vm.create_object(Value::null(), 1);
        let a_name = vm.context.artifacts.symtable.intern("A");
        let class_a = vm.create_class(a_name, proto_a);
        vm.set_member_symbol(proto_a, method_sym, Value::integer(1))
            .unwrap();

        // class B extends A with an empty prototype
        let proto_b = vm.create_object(Value::null(), 0);
        let b_name = vm.context.artifacts.symtable.intern("B");
        let class_b = vm.create_class(b_name, proto_b);
        unsafe { cell_mut(class_b) }
            .as_class_mut()
            .unwrap()
            .parent_class = class_a;

        // instance of B finds m through the chain
        let instance = vm.create_object(class_b, 0);
        assert_eq!(vm.read_member_symbol(instance, method_sym), Value::integer(1));

        // an own property shadows the chain
        vm.set_member_symbol(instance, method_sym, Value::integer(2))
            .unwrap();
        assert_eq!(vm.read_member_symbol(instance, method_sym), Value::integer(2));
    }

    #[test]
    fn test_primitive_class_backs_immediates() {
        let mut vm = test_vm();
        let method_sym = vm.context.artifacts.symtable.intern("times");

        let proto = vm.create_object(Value::null(), 1);
        let name = vm.context.artifacts.symtable.intern("Number");
        let number_class = vm.create_class(name, proto);
        vm.set_member_symbol(proto, method_sym, Value::integer(77))
            .unwrap();
        vm.set_primitive_number(number_class);

        assert_eq!(
            vm.read_member_symbol(Value::integer(5), method_sym),
            Value::integer(77)
        );
    }

    #[test]
    fn test_class_builtin_members() {
        let mut vm = test_vm();
        let proto = vm.create_object(Value::null(), 0);
        let name = vm.context.artifacts.symtable.intern("Widget");
        let class = vm.create_class(name, proto);

        let name_sym = vm.syms.name;
        let proto_sym = vm.syms.prototype;
        assert_eq!(vm.read_member_symbol(class, name_sym), Value::symbol(name));
        assert_eq!(vm.read_member_symbol(class, proto_sym), proto);
    }
}
