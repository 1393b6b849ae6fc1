//! Runtime values of the embedded VM.
//!
//! Values are reference-counted and never leave the driver thread that owns
//! their VM. Tables and functions compare by identity; primitives compare by
//! content, which is the equality the script language exposes.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::error::VmError;
use super::interp::Env;
use super::thread::Coroutine;
use super::{ast, CallCx, NativeFuture};

/// A single VM value.
#[derive(Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    Table(Table),
    Function(Function),
    Thread(Rc<Coroutine>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Thread(_) => "thread",
        }
    }

    /// Everything but `nil` and `false` is truthy.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Raw equality: content for primitives, identity for the rest.
    pub fn raw_eq(
        &self,
        other: &Value,
    ) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a.ptr_id() == b.ptr_id(),
            (Value::Function(a), Value::Function(b)) => a.ptr_id() == b.ptr_id(),
            (Value::Thread(a), Value::Thread(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn from_native(f: NativeFn) -> Value {
        Value::Function(Function::Native(Rc::new(f)))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Rc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(Rc::from(v.as_str()))
    }
}

impl PartialEq for Value {
    fn eq(
        &self,
        other: &Value,
    ) -> bool {
        self.raw_eq(other)
    }
}

impl fmt::Display for Value {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::String(s) => f.write_str(s),
            Value::Table(t) => write!(f, "table: {:#x}", t.ptr_id()),
            Value::Function(func) => write!(f, "function: {:#x}", func.ptr_id()),
            Value::Thread(t) => write!(f, "thread: {:#x}", Rc::as_ptr(t) as usize),
        }
    }
}

impl fmt::Debug for Value {
    /// Debug output mirrors display, with strings quoted for readability.
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

/// Number formatting: whole values print without a fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// A mutable, ordered table. Cloning shares the underlying storage.
#[derive(Clone)]
pub struct Table {
    data: Rc<RefCell<Vec<(Value, Value)>>>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            data: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Identity of the shared storage, for equality and cycle checks.
    pub fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.data) as *const u8 as usize
    }

    pub fn get(
        &self,
        key: &Value,
    ) -> Value {
        let data = self.data.borrow();
        data.iter()
            .find(|(k, _)| k.raw_eq(key))
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Nil)
    }

    /// Set `key` to `value`. A nil value removes the entry. Callers validate
    /// keys beforehand; nil and NaN keys are silently ignored here.
    pub fn set(
        &self,
        key: Value,
        value: Value,
    ) {
        if matches!(key, Value::Nil) {
            return;
        }
        if let Value::Number(n) = &key {
            if n.is_nan() {
                return;
            }
        }
        let mut data = self.data.borrow_mut();
        let existing = data.iter().position(|(k, _)| k.raw_eq(&key));
        match existing {
            Some(i) => {
                if matches!(value, Value::Nil) {
                    data.remove(i);
                } else {
                    data[i].1 = value;
                }
            }
            None => {
                if !matches!(value, Value::Nil) {
                    data.push((key, value));
                }
            }
        }
    }

    /// Number of consecutive integer keys starting at 1.
    pub fn border(&self) -> usize {
        let mut n = 0usize;
        loop {
            let key = Value::Number((n + 1) as f64);
            if matches!(self.get(&key), Value::Nil) {
                return n;
            }
            n += 1;
        }
    }

    /// Snapshot of entries in insertion order.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.data.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_empty()
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

/// A callable value: a script closure or a host function.
#[derive(Clone)]
pub enum Function {
    Script(Rc<ScriptFn>),
    Native(Rc<NativeFn>),
}

impl Function {
    pub fn ptr_id(&self) -> usize {
        match self {
            Function::Script(f) => Rc::as_ptr(f) as *const u8 as usize,
            Function::Native(f) => Rc::as_ptr(f) as *const u8 as usize,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Function::Script(f) => f.name.as_deref().unwrap_or("?"),
            Function::Native(f) => &f.name,
        }
    }
}

/// A closure created by evaluating a `function` expression.
pub struct ScriptFn {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub is_vararg: bool,
    pub body: Rc<ast::Block>,
    pub env: Env,
    pub chunk: Rc<str>,
    pub line: u32,
}

/// A host function callable from scripts. The returned future suspends the
/// calling thread when the host function yields.
pub struct NativeFn {
    pub name: String,
    func: Box<dyn Fn(CallCx, Vec<Value>) -> NativeFuture>,
}

impl NativeFn {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(CallCx, Vec<Value>) -> NativeFuture + 'static,
    ) -> NativeFn {
        NativeFn {
            name: name.into(),
            func: Box::new(func),
        }
    }

    /// A host function that never suspends.
    pub fn sync(
        name: impl Into<String>,
        func: impl Fn(&CallCx, Vec<Value>) -> Result<Vec<Value>, VmError> + 'static,
    ) -> NativeFn {
        NativeFn::new(name, move |cx, args| {
            let result = func(&cx, args);
            Box::pin(async move { result })
        })
    }

    pub fn call(
        &self,
        cx: CallCx,
        args: Vec<Value>,
    ) -> NativeFuture {
        (self.func)(cx, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_compare_by_content() {
        assert_eq!(Value::from(1.0), Value::from(1.0));
        assert_eq!(Value::from("x"), Value::from("x"));
        assert_ne!(Value::from(1.0), Value::from("1"));
        assert_ne!(Value::Nil, Value::from(false));
    }

    #[test]
    fn tables_compare_by_identity() {
        let a = Table::new();
        let b = Table::new();
        assert_eq!(Value::Table(a.clone()), Value::Table(a.clone()));
        assert_ne!(Value::Table(a), Value::Table(b));
    }

    #[test]
    fn table_set_get_remove() {
        let t = Table::new();
        t.set(Value::from("k"), Value::from(7.0));
        assert_eq!(t.get(&Value::from("k")), Value::from(7.0));
        t.set(Value::from("k"), Value::Nil);
        assert_eq!(t.get(&Value::from("k")), Value::Nil);
        assert!(t.is_empty());
    }

    #[test]
    fn border_counts_consecutive_integers() {
        let t = Table::new();
        t.set(Value::from(1.0), Value::from("a"));
        t.set(Value::from(2.0), Value::from("b"));
        t.set(Value::from(4.0), Value::from("d"));
        assert_eq!(t.border(), 2);
    }

    #[test]
    fn whole_numbers_format_without_fraction() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-2.0), "-2");
        assert_eq!(format_number(2.5), "2.5");
    }
}
