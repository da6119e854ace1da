// File: src/value.rs
//
// Runtime value representation for the Dunlin VM.
// A tagged variant over every kind of value a program can produce, shared
// between the compiler's constant pool and the VM's evaluation stack.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::FunctionDef;

/// A runtime value.
///
/// Numbers, strings and booleans compare structurally; arrays and functions
/// compare by identity; `Nothing` equals only `Nothing`. Arrays are mutable
/// and shared by reference, so an array stored in two variables is one array.
#[derive(Debug, Clone)]
pub enum Value {
    /// 64-bit float. The only numeric type in the language.
    Number(f64),
    /// Immutable text.
    Str(Rc<str>),
    Bool(bool),
    /// Mutable, shared-reference, ordered sequence.
    Array(Rc<RefCell<Vec<Value>>>),
    /// Compiled function descriptor, created by the compiler and finalized
    /// before the VM runs.
    Function(Rc<FunctionDef>),
    /// The "no value" sentinel.
    Nothing,
    /// Saved instruction pointer pushed by `CALL`. Never observable from a
    /// well-formed program; it exists only between a `CALL` and its `RETURN`.
    ReturnAddress(usize),
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    /// Type name used in runtime error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Bool(_) => "boolean",
            Value::Array(_) => "array",
            Value::Function(_) => "function",
            Value::Nothing => "nothing",
            Value::ReturnAddress(_) => "return address",
        }
    }

    /// True when this is a scalar constant the compiler may deduplicate in
    /// the constant pool. Function descriptors are always appended fresh.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::Number(_) | Value::Str(_) | Value::Bool(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Nothing, Value::Nothing) => true,
            (Value::ReturnAddress(a), Value::ReturnAddress(b)) => a == b,
            // Equality across kinds is always false.
            _ => false,
        }
    }
}

/// Formats a number the way the language prints it: integral values without
/// a decimal point, everything else with Rust's shortest round-trip form.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Arrays can contain themselves; track visited pointers so a cyclic
        // array prints as [...] instead of recursing forever.
        fn render(value: &Value, seen: &mut HashSet<usize>, out: &mut String) {
            match value {
                Value::Number(n) => out.push_str(&format_number(*n)),
                Value::Str(s) => out.push_str(s),
                Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
                Value::Nothing => out.push_str("nothing"),
                Value::Array(elements) => {
                    let ptr = Rc::as_ptr(elements) as usize;
                    if !seen.insert(ptr) {
                        out.push_str("[...]");
                        return;
                    }
                    out.push('[');
                    for (i, elem) in elements.borrow().iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        render(elem, seen, out);
                    }
                    out.push(']');
                    seen.remove(&ptr);
                }
                Value::Function(def) => {
                    out.push_str(&format!("<func {}/{}>", def.name, def.arity));
                }
                Value::ReturnAddress(pc) => {
                    out.push_str(&format!("<return@{}>", pc));
                }
            }
        }

        let mut out = String::new();
        render(self, &mut HashSet::new(), &mut out);
        f.write_str(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_numbers_print_without_decimal_point() {
        assert_eq!(Value::Number(14.0).to_string(), "14");
        assert_eq!(Value::Number(-3.0).to_string(), "-3");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Number(0.0).to_string(), "0");
    }

    #[test]
    fn nothing_prints_as_keyword() {
        assert_eq!(Value::Nothing.to_string(), "nothing");
    }

    #[test]
    fn arrays_print_bracketed() {
        let arr = Value::array(vec![
            Value::Number(1.0),
            Value::string("two"),
            Value::Bool(true),
        ]);
        assert_eq!(arr.to_string(), "[1, two, true]");
    }

    #[test]
    fn cyclic_array_display_terminates() {
        let inner = Rc::new(RefCell::new(vec![Value::Number(1.0)]));
        inner.borrow_mut().push(Value::Array(inner.clone()));
        assert_eq!(Value::Array(inner).to_string(), "[1, [...]]");
    }

    #[test]
    fn equality_is_structural_for_scalars() {
        assert_eq!(Value::Number(1.0), Value::Number(1.0));
        assert_eq!(Value::string("hi"), Value::string("hi"));
        assert_eq!(Value::Bool(false), Value::Bool(false));
        assert_eq!(Value::Nothing, Value::Nothing);
        // Negative zero is not distinguished from zero.
        assert_eq!(Value::Number(0.0), Value::Number(-0.0));
    }

    #[test]
    fn equality_across_kinds_is_false() {
        assert_ne!(Value::Number(1.0), Value::Bool(true));
        assert_ne!(Value::string("1"), Value::Number(1.0));
        assert_ne!(Value::Nothing, Value::Bool(false));
    }

    #[test]
    fn arrays_compare_by_identity() {
        let a = Value::array(vec![Value::Number(1.0)]);
        let b = Value::array(vec![Value::Number(1.0)]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
