//! Arithmetic, comparison and bitwise operators
//!
//! Dispatch follows the combined type of the operands: numerics widen to
//! doubles and narrow back to immediates when possible, `add` doubles as
//! string concatenation, and every unsupported combination quietly
//! produces a NaN float rather than throwing.

use crate::vm::machine::{cell_ref, Vm};
use sable_core::gc::CellData;
use sable_core::Value;

/// Read the contents of a string value, if it is one
fn string_of(value: &Value) -> Option<&str> {
    if !value.is_pointer() {
        return None;
    }
    let cell = unsafe { cell_ref(*value) };
    match cell.data() {
        CellData::String(s) => Some(s.as_str()),
        _ => None,
    }
}

impl Vm {
    /// `left + right`: numeric addition or string concatenation
    pub(crate) fn op_add_values(&mut self, left: Value, right: Value) -> Value {
        if string_of(&left).is_some() || string_of(&right).is_some() {
            // Render both sides before allocating the result so no heap
            // reference is held across the allocation
            let rendered = format!("{}{}", self.to_display(left), self.to_display(right));
            return self.create_string(&rendered);
        }
        if left.is_integer() && right.is_integer() {
            match left.as_integer().checked_add(right.as_integer()) {
                Some(sum) if Value::integer_fits(sum) => return Value::integer(sum),
                _ => {
                    let sum = left.as_integer() as f64 + right.as_integer() as f64;
                    return self.create_float(sum);
                }
            }
        }
        match (left.numeric_value(), right.numeric_value()) {
            (Some(l), Some(r)) => self.create_float(l + r),
            _ => self.create_float(f64::NAN),
        }
    }

    pub(crate) fn op_sub_values(&mut self, left: Value, right: Value) -> Value {
        if left.is_integer() && right.is_integer() {
            match left.as_integer().checked_sub(right.as_integer()) {
                Some(diff) if Value::integer_fits(diff) => return Value::integer(diff),
                _ => {
                    let diff = left.as_integer() as f64 - right.as_integer() as f64;
                    return self.create_float(diff);
                }
            }
        }
        match (left.numeric_value(), right.numeric_value()) {
            (Some(l), Some(r)) => self.create_float(l - r),
            _ => self.create_float(f64::NAN),
        }
    }

    pub(crate) fn op_mul_values(&mut self, left: Value, right: Value) -> Value {
        if left.is_integer() && right.is_integer() {
            match left.as_integer().checked_mul(right.as_integer()) {
                Some(product) if Value::integer_fits(product) => return Value::integer(product),
                _ => {
                    let product = left.as_integer() as f64 * right.as_integer() as f64;
                    return self.create_float(product);
                }
            }
        }
        match (left.numeric_value(), right.numeric_value()) {
            (Some(l), Some(r)) => self.create_float(l * r),
            _ => self.create_float(f64::NAN),
        }
    }

    /// Division always runs in floating point; IEEE handles zero divisors
    pub(crate) fn op_div_values(&mut self, left: Value, right: Value) -> Value {
        match (left.numeric_value(), right.numeric_value()) {
            (Some(l), Some(r)) => self.create_float(l / r),
            _ => self.create_float(f64::NAN),
        }
    }

    pub(crate) fn op_mod_values(&mut self, left: Value, right: Value) -> Value {
        match (left.numeric_value(), right.numeric_value()) {
            (Some(l), Some(r)) => self.create_float(l % r),
            _ => self.create_float(f64::NAN),
        }
    }

    pub(crate) fn op_pow_values(&mut self, left: Value, right: Value) -> Value {
        match (left.numeric_value(), right.numeric_value()) {
            (Some(l), Some(r)) => self.create_float(l.powf(r)),
            _ => self.create_float(f64::NAN),
        }
    }

    pub(crate) fn op_uadd_value(&mut self, value: Value) -> Value {
        if value.is_numeric() {
            return value;
        }
        self.create_float(f64::NAN)
    }

    pub(crate) fn op_usub_value(&mut self, value: Value) -> Value {
        if value.is_integer() {
            let negated = -value.as_integer();
            if Value::integer_fits(negated) {
                return Value::integer(negated);
            }
            return self.create_float(negated as f64);
        }
        match value.numeric_value() {
            Some(n) => self.create_float(-n),
            None => self.create_float(f64::NAN),
        }
    }

    /// Equality: numerics by value, strings by bytes, symbols by id,
    /// everything else by identity
    pub(crate) fn values_equal(&self, left: Value, right: Value) -> bool {
        if let (Some(l), Some(r)) = (left.numeric_value(), right.numeric_value()) {
            return l == r;
        }
        if let (Some(l), Some(r)) = (string_of(&left), string_of(&right)) {
            return l == r;
        }
        if left.is_symbol() && right.is_symbol() {
            return left.symbol_id() == right.symbol_id();
        }
        left.raw() == right.raw()
    }

    /// Ordering: numerics by value, strings lexicographically, anything
    /// else is unordered and compares false
    pub(crate) fn values_lt(&self, left: Value, right: Value) -> bool {
        if let (Some(l), Some(r)) = (left.numeric_value(), right.numeric_value()) {
            return l < r;
        }
        if let (Some(l), Some(r)) = (string_of(&left), string_of(&right)) {
            return l < r;
        }
        false
    }

    pub(crate) fn values_gt(&self, left: Value, right: Value) -> bool {
        if let (Some(l), Some(r)) = (left.numeric_value(), right.numeric_value()) {
            return l > r;
        }
        if let (Some(l), Some(r)) = (string_of(&left), string_of(&right)) {
            return l > r;
        }
        false
    }

    pub(crate) fn values_le(&self, left: Value, right: Value) -> bool {
        if let (Some(l), Some(r)) = (left.numeric_value(), right.numeric_value()) {
            return l <= r;
        }
        if let (Some(l), Some(r)) = (string_of(&left), string_of(&right)) {
            return l <= r;
        }
        false
    }

    pub(crate) fn values_ge(&self, left: Value, right: Value) -> bool {
        if let (Some(l), Some(r)) = (left.numeric_value(), right.numeric_value()) {
            return l >= r;
        }
        if let (Some(l), Some(r)) = (string_of(&left), string_of(&right)) {
            return l >= r;
        }
        false
    }

    // Bitwise operators work on integers; any other operand combination
    // degrades to NaN like the arithmetic operators.

    pub(crate) fn op_shl_values(&mut self, left: Value, right: Value) -> Value {
        if left.is_integer() && right.is_integer() {
            let shifted = left
                .as_integer()
                .wrapping_shl(right.as_integer() as u32 & 63);
            return self.create_integer(shifted);
        }
        self.create_float(f64::NAN)
    }

    pub(crate) fn op_shr_values(&mut self, left: Value, right: Value) -> Value {
        if left.is_integer() && right.is_integer() {
            let shifted = left
                .as_integer()
                .wrapping_shr(right.as_integer() as u32 & 63);
            return self.create_integer(shifted);
        }
        self.create_float(f64::NAN)
    }

    pub(crate) fn op_band_values(&mut self, left: Value, right: Value) -> Value {
        if left.is_integer() && right.is_integer() {
            return self.create_integer(left.as_integer() & right.as_integer());
        }
        self.create_float(f64::NAN)
    }

    pub(crate) fn op_bor_values(&mut self, left: Value, right: Value) -> Value {
        if left.is_integer() && right.is_integer() {
            return self.create_integer(left.as_integer() | right.as_integer());
        }
        self.create_float(f64::NAN)
    }

    pub(crate) fn op_bxor_values(&mut self, left: Value, right: Value) -> Value {
        if left.is_integer() && right.is_integer() {
            return self.create_integer(left.as_integer() ^ right.as_integer());
        }
        self.create_float(f64::NAN)
    }

    pub(crate) fn op_ubnot_value(&mut self, value: Value) -> Value {
        if value.is_integer() {
            return self.create_integer(!value.as_integer());
        }
        self.create_float(f64::NAN)
    }
}
