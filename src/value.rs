// The tagged-union value model.
//
// Numbers are bitwise-NaN-sensitive IEEE-754 doubles (plain `f64`
// `PartialEq` already gives us that: `NAN != NAN`). Strings are immutable;
// lists and dicts are reference-shared, using the same `Rc`-based sharing
// discipline as `ast::Node<T>`. Division-by-zero is not a host
// abort: it produces a `ResultError` value that user code can match on,
// so it is threaded through `Value::div` as an `Ok`, not an `Err`.

use crate::ast::{FunctionDecl, Param};
use crate::env::Env;
use enumflags2::BitFlags;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

#[derive(BitFlags, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ValueKind {
    Null = 0b0000000001,
    Bool = 0b0000000010,
    Number = 0b0000000100,
    Str = 0b0000001000,
    List = 0b0000010000,
    Dict = 0b0000100000,
    Function = 0b0001000000,
    Class = 0b0010000000,
    Instance = 0b0100000000,
    Result = 0b1000000000,
}

pub type ValueKindSet = BitFlags<ValueKind>;

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "boolean",
            ValueKind::Number => "number",
            ValueKind::Str => "string",
            ValueKind::List => "Array",
            ValueKind::Dict => "Dict",
            ValueKind::Function => "Function",
            ValueKind::Class => "class",
            ValueKind::Instance => "instance",
            ValueKind::Result => "Result",
        };
        write!(f, "{}", name)
    }
}

// A user-defined function value plus the lexical environment it closed
// over at the point of definition.
#[derive(Debug)]
pub struct Closure {
    pub decl: Rc<FunctionDecl>,
    pub captured: Env,
}

// The native-host seam: a boxed Rust closure registered under a name in
// `native::NativeRegistry`.
pub type NativeFn = dyn Fn(&[Value]) -> Result<Value, String>;

// A closure produced by the register VM's `MAKE_CLOSURE`: a function-table
// index plus the upvalue cells it captured at creation time. `params` is
// carried alongside purely so `dispatch::resolve_call` can score it next to
// ordinary tree-walking `Closure`s in the same overload group.
#[derive(Debug)]
pub struct CompiledClosure {
    pub function: usize,
    pub name: Option<Rc<str>>,
    pub params: Vec<Param>,
    pub upvalues: Vec<Rc<RefCell<Value>>>,
}

#[derive(Clone)]
pub enum Callable {
    Closure(Rc<Closure>),
    Compiled(Rc<CompiledClosure>),
    // `instance.method` bound at access time. `method` may itself be a
    // `Group`, resolved against call-site arguments before invocation.
    Bound { receiver: Box<Value>, method: Rc<Callable> },
    Native(Rc<str>, Rc<NativeFn>),
    // Ordered list of overloads sharing a name.
    Group(Rc<RefCell<Vec<Callable>>>),
}

// Installs `incoming` alongside `existing` under one name: two plain
// callables become a two-element group, a group gains a member.
pub fn merge_callables(existing: &Callable, incoming: Callable) -> Callable {
    match existing {
        Callable::Group(list) => {
            list.borrow_mut().push(incoming);
            Callable::Group(list.clone())
        }
        single => Callable::Group(Rc::new(RefCell::new(vec![single.clone(), incoming]))),
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Callable::Closure(c) => write!(f, "Closure({:?})", c.decl.name),
            Callable::Compiled(c) => write!(f, "Compiled(fn#{})", c.function),
            Callable::Bound { method, .. } => write!(f, "Bound({:?})", method),
            Callable::Native(name, _) => write!(f, "Native({})", name),
            Callable::Group(g) => write!(f, "Group(len={})", g.borrow().len()),
        }
    }
}

#[derive(Debug)]
pub struct ClassObject {
    pub name: String,
    pub methods: RefCell<std::collections::HashMap<String, Callable>>,
}

impl ClassObject {
    // Mirrors `Environment::define`'s function-group merge: redefining a
    // method name inside one class body extends an overload group rather
    // than shadowing it.
    pub fn define_method(&self, name: &str, callable: Callable) {
        let merged = self.methods.borrow().get(name).map(|existing| merge_callables(existing, callable.clone()));
        let final_callable = merged.unwrap_or(callable);
        self.methods.borrow_mut().insert(name.to_string(), final_callable);
    }
}

#[derive(Debug)]
pub struct InstanceObject {
    pub class: Rc<ClassObject>,
    pub fields: RefCell<Dict>,
}

// Insertion-ordered association, as required for stable `keys()`/`values()`
// iteration. Keys compare by structural equality.
#[derive(Clone, Debug, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new() -> Dict {
        Dict { entries: Vec::new() }
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.entries.iter().find(|(k, _)| k.equals(key)).map(|(_, v)| v.clone())
    }

    pub fn has(&self, key: &Value) -> bool {
        self.entries.iter().any(|(k, _)| k.equals(key))
    }

    pub fn set(&mut self, key: Value, value: Value) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k.equals(&key)) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        if let Some(pos) = self.entries.iter().position(|(k, _)| k.equals(key)) {
            Some(self.entries.remove(pos).1)
        } else {
            None
        }
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Dict) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries.iter().all(|(k, v)| other.get(k).map_or(false, |ov| ov.equals(v)))
    }
}

#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<Dict>>),
    Function(Callable),
    Class(Rc<ClassObject>),
    Instance(Rc<InstanceObject>),
    ResultOk(Box<Value>),
    ResultError(Box<Value>),
}

#[derive(Debug)]
pub enum ArithError {
    TypeMismatch(ValueKindSet, ValueKind),
}

#[derive(Debug)]
pub enum IndexError {
    NotIndexable(ValueKind),
    OutOfBounds { index: i64, len: usize },
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::Str(_) => ValueKind::Str,
            Value::List(_) => ValueKind::List,
            Value::Dict(_) => ValueKind::Dict,
            Value::Function(_) => ValueKind::Function,
            Value::Class(_) => ValueKind::Class,
            Value::Instance(_) => ValueKind::Instance,
            Value::ResultOk(_) | Value::ResultError(_) => ValueKind::Result,
        }
    }

    pub fn new_string(s: impl Into<String>) -> Value {
        Value::Str(Rc::from(s.into().into_boxed_str()))
    }

    pub fn new_list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn new_dict(dict: Dict) -> Value {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    // null and false are falsey, everything else truthy (including 0 and
    // "").
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Value::ResultOk(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::ResultError(_))
    }

    pub fn unwrap_or(&self, default: Value) -> Value {
        match self {
            Value::ResultOk(v) => (**v).clone(),
            Value::ResultError(_) => default,
            other => other.clone(),
        }
    }

    // Structural equality for numbers/bools/strings/lists/dicts/results
    // (NaN-sensitive for numbers, matching `f64`'s own `PartialEq`);
    // reference equality for classes, instances, and function values.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::ResultOk(a), Value::ResultOk(b)) => a.equals(b),
            (Value::ResultError(a), Value::ResultError(b)) => a.equals(b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => callable_ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.to_string(),
            Value::List(items) => {
                let items = items.borrow();
                let inner: Vec<String> = items.iter().map(Value::to_repr_string).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Dict(dict) => {
                let dict = dict.borrow();
                let inner: Vec<String> = dict.entries.iter()
                    .map(|(k, v)| format!("{}: {}", k.to_repr_string(), v.to_repr_string()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Function(_) => "<function>".to_string(),
            Value::Class(c) => format!("<class {}>", c.name),
            Value::Instance(i) => format!("<instance {}>", i.class.name),
            Value::ResultOk(v) => format!("Ok({})", v.to_repr_string()),
            Value::ResultError(v) => format!("Error({})", v.to_repr_string()),
        }
    }

    // Same as `to_display_string` except strings are quoted, used when a
    // value appears nested inside a list/dict rendering.
    fn to_repr_string(&self) -> String {
        match self {
            Value::Str(s) => format!("\"{}\"", s),
            other => other.to_display_string(),
        }
    }

    pub fn add(&self, other: &Value) -> Result<Value, ArithError> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::Str(_), _) | (_, Value::Str(_)) => {
                Ok(Value::new_string(format!("{}{}", self.to_display_string(), other.to_display_string())))
            }
            _ => Err(ArithError::TypeMismatch(ValueKind::Number | ValueKind::Str, other.kind())),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, ArithError> {
        numeric_binop(self, other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Value) -> Result<Value, ArithError> {
        numeric_binop(self, other, |a, b| a * b)
    }

    // Division by zero is a value-level error, not a host abort.
    pub fn div(&self, other: &Value) -> Result<Value, ArithError> {
        match (self, other) {
            (Value::Number(_), Value::Number(b)) if *b == 0.0 => {
                Ok(Value::ResultError(Box::new(Value::new_string("Division by zero"))))
            }
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a / b)),
            _ => Err(ArithError::TypeMismatch(ValueKind::Number.into(), other.kind())),
        }
    }

    pub fn modulo(&self, other: &Value) -> Result<Value, ArithError> {
        numeric_binop(self, other, |a, b| a % b)
    }

    pub fn pow(&self, other: &Value) -> Result<Value, ArithError> {
        numeric_binop(self, other, |a, b| a.powf(b))
    }

    pub fn neg(&self) -> Result<Value, ArithError> {
        match self {
            Value::Number(a) => Ok(Value::Number(-a)),
            _ => Err(ArithError::TypeMismatch(ValueKind::Number.into(), self.kind())),
        }
    }

    pub fn not(&self) -> Value {
        Value::Bool(!self.truthy())
    }

    pub fn compare(&self, other: &Value) -> Result<std::cmp::Ordering, ArithError> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => {
                a.partial_cmp(b).ok_or(ArithError::TypeMismatch(ValueKind::Number.into(), ValueKind::Number))
            }
            _ => Err(ArithError::TypeMismatch(ValueKind::Number.into(), other.kind())),
        }
    }

    // Integer key on list/string, bounds checked, negative indices
    // resolve from the end; any key on a dict, missing key reads as Null.
    pub fn index(&self, key: &Value) -> Result<Value, IndexError> {
        match self {
            Value::List(items) => {
                let items = items.borrow();
                let idx = resolve_index(key, items.len())?;
                Ok(items[idx].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = resolve_index(key, chars.len())?;
                Ok(Value::new_string(chars[idx].to_string()))
            }
            Value::Dict(dict) => Ok(dict.borrow().get(key).unwrap_or(Value::Null)),
            other => Err(IndexError::NotIndexable(other.kind())),
        }
    }

    pub fn index_set(&self, key: &Value, value: Value) -> Result<(), IndexError> {
        match self {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let idx = resolve_index(key, items.len())?;
                items[idx] = value;
                Ok(())
            }
            Value::Dict(dict) => {
                dict.borrow_mut().set(key.clone(), value);
                Ok(())
            }
            other => Err(IndexError::NotIndexable(other.kind())),
        }
    }

    // Negative bounds resolve from the end; out-of-range bounds clamp
    // rather than error.
    pub fn slice(&self, start: Option<i64>, end: Option<i64>) -> Result<Value, IndexError> {
        match self {
            Value::List(items) => {
                let items = items.borrow();
                let (s, e) = slice_bounds(start, end, items.len());
                Ok(Value::new_list(items[s..e].to_vec()))
            }
            Value::Str(text) => {
                let chars: Vec<char> = text.chars().collect();
                let (s, e) = slice_bounds(start, end, chars.len());
                Ok(Value::new_string(chars[s..e].iter().collect::<String>()))
            }
            other => Err(IndexError::NotIndexable(other.kind())),
        }
    }
}

fn numeric_binop(a: &Value, b: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, ArithError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(f(*x, *y))),
        _ => Err(ArithError::TypeMismatch(ValueKind::Number.into(), b.kind())),
    }
}

fn resolve_index(key: &Value, len: usize) -> Result<usize, IndexError> {
    let i = match key {
        Value::Number(n) => *n as i64,
        other => return Err(IndexError::NotIndexable(other.kind())),
    };
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved as usize >= len {
        Err(IndexError::OutOfBounds { index: i, len })
    } else {
        Ok(resolved as usize)
    }
}

fn slice_bounds(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
    let clamp = |v: i64| -> usize {
        let resolved = if v < 0 { v + len as i64 } else { v };
        resolved.max(0).min(len as i64) as usize
    };
    let s = start.map(clamp).unwrap_or(0);
    let e = end.map(clamp).unwrap_or(len);
    if s > e {
        (s, s)
    } else {
        (s, e)
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn callable_ptr_eq(a: &Callable, b: &Callable) -> bool {
    match (a, b) {
        (Callable::Closure(x), Callable::Closure(y)) => Rc::ptr_eq(x, y),
        (Callable::Compiled(x), Callable::Compiled(y)) => Rc::ptr_eq(x, y),
        (Callable::Native(_, x), Callable::Native(_, y)) => Rc::ptr_eq(x, y),
        (Callable::Group(x), Callable::Group(y)) => Rc::ptr_eq(x, y),
        (Callable::Bound { receiver: ra, method: ma }, Callable::Bound { receiver: rb, method: mb }) => {
            ra.equals(rb) && Rc::ptr_eq(ma, mb)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_sensitive_equality() {
        let nan = Value::Number(f64::NAN);
        assert!(!nan.equals(&nan));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Bool(false).truthy());
        assert!(Value::Number(0.0).truthy());
        assert!(Value::new_string("").truthy());
    }

    #[test]
    fn test_negative_slice() {
        let list = Value::new_list((1..=5).map(|n| Value::Number(n as f64)).collect());
        let sliced = list.slice(Some(-2), None).unwrap();
        assert_eq!(sliced.to_display_string(), "[4, 5]");
    }

    #[test]
    fn test_division_by_zero_is_value_not_abort() {
        let result = Value::Number(10.0).div(&Value::Number(0.0)).unwrap();
        assert!(result.is_error());
    }

    #[test]
    fn test_addition_concatenates_with_strings() {
        let v = Value::new_string("x=").add(&Value::Number(1.0)).unwrap();
        assert_eq!(v.to_display_string(), "x=1");
    }

    #[test]
    fn test_list_reference_sharing() {
        let list = Value::new_list(vec![Value::Number(1.0)]);
        let alias = list.clone();
        if let Value::List(items) = &list {
            items.borrow_mut().push(Value::Number(2.0));
        }
        assert_eq!(alias.to_display_string(), "[1, 2]");
    }
}
