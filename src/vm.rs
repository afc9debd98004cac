// Register-based bytecode interpreter.
//
// Each call pushes a fresh register file rather than slicing a shared
// stack: register `n` of a frame is an independent `Rc<RefCell<Value>>`
// cell, so capturing an upvalue is just cloning that `Rc` -- the cell
// outlives its frame for as long as any closure still references it,
// which sidesteps the open/closed-upvalue bookkeeping a shared stack would
// need. Dispatch mirrors the reference dashboard VM's `step`/`dispatch`
// split: one method decodes an instruction into a `ControlFlow`, a small
// driving loop turns that into `pc` movement or a return.

use crate::bytecode::{FunctionIndex, FunctionTable, Instr, Op, Operand};
use crate::diagnostics::{bounds_error, match_fallthrough_warning, resolve_error, stack_overflow, type_error, Diagnostic};
use crate::native::NativeRegistry;
use crate::token::Span;
use crate::value::{ArithError, Callable, CompiledClosure, Dict, IndexError, NativeFn, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

// Mirrors `evaluator::MAX_CALL_DEPTH`'s role, but named after the
// call-frame-stack capacity described for the VM specifically.
const MAX_FRAMES: u32 = 1024;

type Reg = Rc<RefCell<Value>>;

fn cell(value: Value) -> Reg {
    Rc::new(RefCell::new(value))
}

enum ControlFlow {
    Advance,
    Jump(usize),
    Return(Value),
}

pub struct VM<'a> {
    functions: &'a FunctionTable,
    constants: &'a crate::bytecode::ConstantPool,
    registry: Option<&'a dyn NativeRegistry>,
    globals: RefCell<HashMap<Rc<str>, Value>>,
    call_depth: Cell<u32>,
    warnings: RefCell<Vec<Diagnostic>>,
}

impl<'a> VM<'a> {
    pub fn new(functions: &'a FunctionTable, constants: &'a crate::bytecode::ConstantPool, registry: Option<&'a dyn NativeRegistry>) -> VM<'a> {
        VM { functions, constants, registry, globals: RefCell::new(HashMap::new()), call_depth: Cell::new(0), warnings: RefCell::new(Vec::new()) }
    }

    pub fn run(&self, entry: FunctionIndex) -> Result<Value, Diagnostic> {
        self.call_function(entry, Vec::new(), Vec::new(), Span::new(0, 0))
    }

    // Non-fatal diagnostics accumulated during the run (currently: a
    // `match` with no matching arm). Drains the buffer.
    pub fn take_warnings(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.warnings.borrow_mut())
    }

    fn call_function(&self, index: FunctionIndex, upvalues: Vec<Reg>, args: Vec<Value>, span: Span) -> Result<Value, Diagnostic> {
        if self.call_depth.get() >= MAX_FRAMES {
            return Err(stack_overflow(span));
        }
        self.call_depth.set(self.call_depth.get() + 1);
        let result = self.exec_frame(index, upvalues, args);
        self.call_depth.set(self.call_depth.get() - 1);
        result
    }

    fn exec_frame(&self, index: FunctionIndex, upvalues: Vec<Reg>, args: Vec<Value>) -> Result<Value, Diagnostic> {
        let info = self.functions.get(index);
        let mut registers: Vec<Reg> = Vec::with_capacity(info.num_registers as usize);
        for i in 0..info.num_registers as usize {
            registers.push(cell(args.get(i).cloned().unwrap_or(Value::Null)));
        }
        let mut pc = 0usize;
        loop {
            let instr = match info.code.get(pc) {
                Some(instr) => instr,
                None => return Ok(Value::Null),
            };
            let span = info.spans[pc];
            match self.step(instr, span, &mut registers, &upvalues)? {
                ControlFlow::Advance => pc += 1,
                ControlFlow::Jump(target) => pc = target,
                ControlFlow::Return(v) => return Ok(v),
            }
        }
    }

    fn get(&self, registers: &[Reg], r: u8) -> Value {
        registers[r as usize].borrow().clone()
    }

    fn set(&self, registers: &[Reg], r: u8, value: Value) {
        *registers[r as usize].borrow_mut() = value;
    }

    // Reads an `Operand` as a runtime value: a register is dereferenced, a
    // constant is cloned out of the shared pool. `Func` operands are only
    // ever consumed directly by `MAKE_CLOSURE`, never through this path.
    fn read(&self, registers: &[Reg], operand: Operand) -> Value {
        match operand {
            Operand::Reg(r) => self.get(registers, r),
            Operand::Const(idx) => self.constants.get(idx).clone(),
            Operand::Func(_) => unreachable!("function operands are only read by MAKE_CLOSURE"),
        }
    }

    fn target(&self, operand: Operand) -> usize {
        match operand {
            Operand::Const(idx) => idx as usize,
            other => unreachable!("jump target operand must be a patched constant, got {:?}", other),
        }
    }

    fn step(&self, instr: &Instr, span: Span, registers: &mut Vec<Reg>, upvalues: &[Reg]) -> Result<ControlFlow, Diagnostic> {
        match instr.op {
            Op::LoadConst => {
                self.set(registers, instr.a, self.read(registers, instr.b));
                Ok(ControlFlow::Advance)
            }
            Op::LoadLocal | Op::Move => {
                self.set(registers, instr.a, self.read(registers, instr.b));
                Ok(ControlFlow::Advance)
            }
            Op::StoreLocal => {
                self.set(registers, instr.a, self.read(registers, instr.b));
                Ok(ControlFlow::Advance)
            }
            Op::LoadGlobal => {
                let name = self.name_operand(instr.b);
                let value = self.globals.borrow().get(&*name).cloned();
                let value = match value {
                    Some(v) => v,
                    None => match self.registry.and_then(|r| r.lookup(&name)) {
                        Some(c) => Value::Function(c),
                        None => return Err(resolve_error(format!("undefined variable '{}'", name), span)),
                    },
                };
                self.set(registers, instr.a, value);
                Ok(ControlFlow::Advance)
            }
            Op::StoreGlobal => {
                let name = self.name_operand(instr.b);
                self.globals.borrow_mut().insert(name, self.get(registers, instr.a));
                Ok(ControlFlow::Advance)
            }
            Op::GetUpvalue => {
                let idx = self.reg_index(instr.b);
                let value = upvalues[idx as usize].borrow().clone();
                self.set(registers, instr.a, value);
                Ok(ControlFlow::Advance)
            }
            Op::SetUpvalue => {
                let idx = self.reg_index(instr.b);
                let value = self.get(registers, instr.a);
                *upvalues[idx as usize].borrow_mut() = value;
                Ok(ControlFlow::Advance)
            }

            Op::Add => self.binary_arith(instr, registers, span, Value::add),
            Op::Sub => self.binary_arith(instr, registers, span, Value::sub),
            Op::Mul => self.binary_arith(instr, registers, span, Value::mul),
            Op::Div => self.binary_arith(instr, registers, span, Value::div),
            Op::Mod => self.binary_arith(instr, registers, span, Value::modulo),
            Op::Pow => self.binary_arith(instr, registers, span, Value::pow),
            Op::AddFast | Op::AddLocals => self.fast_numeric(instr, registers, span, |a, b| a + b),
            Op::SubFast => self.fast_numeric(instr, registers, span, |a, b| a - b),
            Op::MulFast => self.fast_numeric(instr, registers, span, |a, b| a * b),
            Op::DivFast => self.fast_numeric(instr, registers, span, |a, b| a / b),
            Op::Neg => {
                let v = self.read(registers, instr.b);
                let result = v.neg().map_err(|e| arith_diag(e, span))?;
                self.set(registers, instr.a, result);
                Ok(ControlFlow::Advance)
            }

            Op::Eq => {
                let (l, r) = self.pair(registers, instr);
                self.set(registers, instr.a, Value::Bool(l.equals(&r)));
                Ok(ControlFlow::Advance)
            }
            Op::Ne => {
                let (l, r) = self.pair(registers, instr);
                self.set(registers, instr.a, Value::Bool(!l.equals(&r)));
                Ok(ControlFlow::Advance)
            }
            Op::Lt => self.compare(instr, registers, span, |o| o == std::cmp::Ordering::Less),
            Op::Le => self.compare(instr, registers, span, |o| o != std::cmp::Ordering::Greater),
            Op::Gt => self.compare(instr, registers, span, |o| o == std::cmp::Ordering::Greater),
            Op::Ge => self.compare(instr, registers, span, |o| o != std::cmp::Ordering::Less),
            Op::And => {
                let (l, r) = self.pair(registers, instr);
                self.set(registers, instr.a, Value::Bool(l.truthy() && r.truthy()));
                Ok(ControlFlow::Advance)
            }
            Op::Or => {
                let (l, r) = self.pair(registers, instr);
                self.set(registers, instr.a, Value::Bool(l.truthy() || r.truthy()));
                Ok(ControlFlow::Advance)
            }
            Op::Not => {
                let v = self.read(registers, instr.b);
                self.set(registers, instr.a, v.not());
                Ok(ControlFlow::Advance)
            }
            Op::NullCoalesce => {
                let (l, r) = self.pair(registers, instr);
                self.set(registers, instr.a, if matches!(l, Value::Null) { r } else { l });
                Ok(ControlFlow::Advance)
            }

            Op::Jump => Ok(ControlFlow::Jump(self.target(instr.c))),
            Op::JumpBack => Ok(ControlFlow::Jump(self.target(instr.c))),
            Op::JumpIfFalse => {
                let cond = self.read(registers, instr.b);
                if cond.truthy() { Ok(ControlFlow::Advance) } else { Ok(ControlFlow::Jump(self.target(instr.c))) }
            }
            Op::JumpIfTrue => {
                let cond = self.read(registers, instr.b);
                if cond.truthy() { Ok(ControlFlow::Jump(self.target(instr.c))) } else { Ok(ControlFlow::Advance) }
            }
            Op::CmpJumpIfFalse => {
                let cond = self.read(registers, instr.b);
                if cond.truthy() { Ok(ControlFlow::Advance) } else { Ok(ControlFlow::Jump(self.target(instr.c))) }
            }

            Op::Call | Op::TailCall => {
                let callee_reg = self.reg_index(instr.b);
                let arity = match instr.c {
                    Operand::Const(n) => n as usize,
                    other => unreachable!("call arity operand must be a constant count, got {:?}", other),
                };
                let callee = self.get(registers, callee_reg);
                let args: Vec<Value> = (0..arity).map(|i| self.get(registers, callee_reg + 1 + i as u8)).collect();
                let result = self.call_value(callee, args, span)?;
                self.set(registers, instr.a, result);
                Ok(ControlFlow::Advance)
            }
            Op::Return => Ok(ControlFlow::Return(self.get(registers, instr.a))),

            Op::NewObject => Err(resolve_error("object construction requires the tree-walking backend", span)),
            Op::NewList => {
                let start = self.reg_index(instr.b);
                let count = self.const_count(instr.c);
                let items = (0..count).map(|i| self.get(registers, start + i as u8)).collect();
                self.set(registers, instr.a, Value::new_list(items));
                Ok(ControlFlow::Advance)
            }
            Op::NewDict => {
                let start = self.reg_index(instr.b);
                let count = self.const_count(instr.c);
                let mut dict = Dict::new();
                for i in 0..count {
                    let key = self.get(registers, start + (2 * i) as u8);
                    let value = self.get(registers, start + (2 * i + 1) as u8);
                    dict.set(key, value);
                }
                self.set(registers, instr.a, Value::new_dict(dict));
                Ok(ControlFlow::Advance)
            }
            Op::MakeClosure => {
                let func_index = match instr.b {
                    Operand::Func(idx) => idx as usize,
                    other => unreachable!("MAKE_CLOSURE operand must be a function index, got {:?}", other),
                };
                let target = self.functions.get(func_index);
                let captured: Vec<Reg> = target
                    .upvalues
                    .iter()
                    .map(|desc| if desc.is_local { registers[desc.slot as usize].clone() } else { upvalues[desc.slot as usize].clone() })
                    .collect();
                let closure = CompiledClosure {
                    function: func_index,
                    name: target.name.clone(),
                    params: target.params.clone(),
                    upvalues: captured,
                };
                self.set(registers, instr.a, Value::Function(Callable::Compiled(Rc::new(closure))));
                Ok(ControlFlow::Advance)
            }
            Op::GetProperty => {
                let receiver = self.read(registers, instr.b);
                let name = self.name_operand(instr.c);
                let value = container_method(receiver.clone(), &name).ok_or_else(|| {
                    resolve_error(format!("no such property '{}' on {}", name, receiver.kind()), span)
                })?;
                self.set(registers, instr.a, value);
                Ok(ControlFlow::Advance)
            }
            Op::SetProperty => {
                let receiver = self.get(registers, instr.a);
                Err(type_error(format!("cannot set property on {}", receiver.kind()), span))
            }
            Op::GetIndex => {
                let (receiver, key) = self.pair(registers, instr);
                let value = receiver.index(&key).map_err(|e| index_diag(e, span))?;
                self.set(registers, instr.a, value);
                Ok(ControlFlow::Advance)
            }
            Op::SetIndex => {
                let receiver = self.get(registers, instr.a);
                let key = self.read(registers, instr.b);
                let value = self.read(registers, instr.c);
                receiver.index_set(&key, value).map_err(|e| index_diag(e, span))?;
                Ok(ControlFlow::Advance)
            }
            Op::GetSlice => {
                let receiver = self.read(registers, instr.b);
                let start_reg = self.reg_index(instr.c);
                let start = bound_operand(self.get(registers, start_reg), span)?;
                let end = bound_operand(self.get(registers, start_reg + 1), span)?;
                let value = receiver.slice(start, end).map_err(|e| index_diag(e, span))?;
                self.set(registers, instr.a, value);
                Ok(ControlFlow::Advance)
            }
            Op::ArrayLength => {
                let receiver = self.read(registers, instr.b);
                let len = array_length(&receiver, span)?;
                self.set(registers, instr.a, Value::Number(len as f64));
                Ok(ControlFlow::Advance)
            }
            Op::ArrayPush => {
                let value = self.read(registers, instr.b);
                match self.get(registers, instr.a) {
                    Value::List(items) => {
                        items.borrow_mut().push(value);
                        Ok(ControlFlow::Advance)
                    }
                    other => Err(type_error(format!("cannot push onto {}", other.kind()), span)),
                }
            }
            Op::IsOk => {
                let v = self.read(registers, instr.b);
                self.set(registers, instr.a, Value::Bool(v.is_ok()));
                Ok(ControlFlow::Advance)
            }
            Op::IsError => {
                let v = self.read(registers, instr.b);
                self.set(registers, instr.a, Value::Bool(v.is_error()));
                Ok(ControlFlow::Advance)
            }
            Op::Unwrap => {
                let v = self.read(registers, instr.b);
                let inner = match v {
                    Value::ResultOk(v) | Value::ResultError(v) => *v,
                    other => other,
                };
                self.set(registers, instr.a, inner);
                Ok(ControlFlow::Advance)
            }

            Op::IncLocal => {
                let v = self.get(registers, instr.a);
                let bumped = v.add(&Value::Number(1.0)).map_err(|e| arith_diag(e, span))?;
                self.set(registers, instr.a, bumped);
                Ok(ControlFlow::Advance)
            }
            Op::AddConstLocal => {
                let constant = self.read(registers, instr.b);
                let local = self.read(registers, instr.c);
                let sum = constant.add(&local).map_err(|e| arith_diag(e, span))?;
                self.set(registers, instr.a, sum);
                Ok(ControlFlow::Advance)
            }

            Op::MatchFallthrough => {
                self.warnings.borrow_mut().push(match_fallthrough_warning(span));
                self.set(registers, instr.a, Value::Null);
                Ok(ControlFlow::Advance)
            }

            Op::Halt => Ok(ControlFlow::Return(Value::Null)),
            Op::Nop => Ok(ControlFlow::Advance),
        }
    }

    fn reg_index(&self, operand: Operand) -> u8 {
        match operand {
            Operand::Reg(r) => r,
            other => unreachable!("expected a register operand, got {:?}", other),
        }
    }

    fn const_count(&self, operand: Operand) -> usize {
        match operand {
            Operand::Const(n) => n as usize,
            other => unreachable!("expected a count operand, got {:?}", other),
        }
    }

    fn name_operand(&self, operand: Operand) -> Rc<str> {
        match operand {
            Operand::Const(idx) => match self.constants.get(idx) {
                Value::Str(s) => s.clone(),
                other => unreachable!("expected a string constant operand, got {:?}", other),
            },
            other => unreachable!("expected a constant operand, got {:?}", other),
        }
    }

    fn pair(&self, registers: &[Reg], instr: &Instr) -> (Value, Value) {
        (self.read(registers, instr.b), self.read(registers, instr.c))
    }

    fn binary_arith(
        &self,
        instr: &Instr,
        registers: &mut Vec<Reg>,
        span: Span,
        f: impl Fn(&Value, &Value) -> Result<Value, ArithError>,
    ) -> Result<ControlFlow, Diagnostic> {
        let (l, r) = self.pair(registers, instr);
        let result = f(&l, &r).map_err(|e| arith_diag(e, span))?;
        self.set(registers, instr.a, result);
        Ok(ControlFlow::Advance)
    }

    fn fast_numeric(&self, instr: &Instr, registers: &mut Vec<Reg>, span: Span, f: impl Fn(f64, f64) -> f64) -> Result<ControlFlow, Diagnostic> {
        let (l, r) = self.pair(registers, instr);
        match (l, r) {
            (Value::Number(a), Value::Number(b)) => {
                self.set(registers, instr.a, Value::Number(f(a, b)));
                Ok(ControlFlow::Advance)
            }
            (a, b) => Err(type_error(format!("expected two numbers, got {} and {}", a.kind(), b.kind()), span)),
        }
    }

    fn compare(&self, instr: &Instr, registers: &mut Vec<Reg>, span: Span, accept: impl Fn(std::cmp::Ordering) -> bool) -> Result<ControlFlow, Diagnostic> {
        let (l, r) = self.pair(registers, instr);
        let ordering = l.compare(&r).map_err(|e| arith_diag(e, span))?;
        self.set(registers, instr.a, Value::Bool(accept(ordering)));
        Ok(ControlFlow::Advance)
    }

    fn call_value(&self, callee: Value, args: Vec<Value>, span: Span) -> Result<Value, Diagnostic> {
        match callee {
            Value::Function(f) => {
                let resolved = crate::dispatch::resolve_call(&f, &args, span)?;
                self.invoke(resolved, args, span)
            }
            other => Err(type_error(format!("'{}' is not callable", other.kind()), span)),
        }
    }

    fn invoke(&self, resolved: Callable, args: Vec<Value>, span: Span) -> Result<Value, Diagnostic> {
        match resolved {
            Callable::Compiled(c) => self.call_function(c.function, c.upvalues.clone(), args, span),
            Callable::Native(_, f) => f(&args).map_err(|e| type_error(e, span)),
            Callable::Closure(_) => Err(type_error("a tree-walking closure cannot be invoked by the register VM", span)),
            Callable::Bound { .. } => Err(type_error("bound methods require the tree-walking backend", span)),
            Callable::Group(_) => unreachable!("resolve_call always returns a concrete callable"),
        }
    }
}

fn bound_operand(value: Value, span: Span) -> Result<Option<i64>, Diagnostic> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(Some(n as i64)),
        other => Err(type_error(format!("slice bound must be a number, got {}", other.kind()), span)),
    }
}

fn array_length(value: &Value, span: Span) -> Result<usize, Diagnostic> {
    match value {
        Value::List(items) => Ok(items.borrow().len()),
        Value::Dict(dict) => Ok(dict.borrow().len()),
        Value::Str(s) => Ok(s.chars().count()),
        other => Err(type_error(format!("cannot take the length of {}", other.kind()), span)),
    }
}

fn arith_diag(e: ArithError, span: Span) -> Diagnostic {
    match e {
        ArithError::TypeMismatch(expected, got) => {
            type_error(format!("expected {}, got {}", describe_kind_set(expected), got), span)
        }
    }
}

fn index_diag(e: IndexError, span: Span) -> Diagnostic {
    match e {
        IndexError::NotIndexable(kind) => type_error(format!("{} is not indexable", kind), span),
        IndexError::OutOfBounds { index, len } => bounds_error(format!("index {} out of bounds for length {}", index, len), span),
    }
}

fn describe_kind_set(set: crate::value::ValueKindSet) -> String {
    set.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(" or ")
}

// The fuller built-in method surface the VM exposes directly on lists,
// dicts and strings (spec'd wider than the tree evaluator's own
// `container_method`: `shift`/`unshift`/`includes`/`indexOf`/`slice` on
// lists, `size`/`get`/`set` on dicts).
fn container_method(receiver: Value, name: &str) -> Option<Value> {
    let f: Rc<NativeFn> = match (&receiver, name) {
        (Value::List(list), "length") => {
            let list = list.clone();
            Rc::new(move |_args: &[Value]| Ok(Value::Number(list.borrow().len() as f64)))
        }
        (Value::List(list), "push") => {
            let list = list.clone();
            Rc::new(move |args: &[Value]| {
                list.borrow_mut().push(args.first().cloned().unwrap_or(Value::Null));
                Ok(Value::Null)
            })
        }
        (Value::List(list), "pop") => {
            let list = list.clone();
            Rc::new(move |_args: &[Value]| Ok(list.borrow_mut().pop().unwrap_or(Value::Null)))
        }
        (Value::List(list), "shift") => {
            let list = list.clone();
            Rc::new(move |_args: &[Value]| {
                let mut items = list.borrow_mut();
                if items.is_empty() { Ok(Value::Null) } else { Ok(items.remove(0)) }
            })
        }
        (Value::List(list), "unshift") => {
            let list = list.clone();
            Rc::new(move |args: &[Value]| {
                list.borrow_mut().insert(0, args.first().cloned().unwrap_or(Value::Null));
                Ok(Value::Null)
            })
        }
        (Value::List(list), "includes") => {
            let list = list.clone();
            Rc::new(move |args: &[Value]| {
                let target = args.first().cloned().unwrap_or(Value::Null);
                Ok(Value::Bool(list.borrow().iter().any(|v| v.equals(&target))))
            })
        }
        (Value::List(list), "indexOf") => {
            let list = list.clone();
            Rc::new(move |args: &[Value]| {
                let target = args.first().cloned().unwrap_or(Value::Null);
                let pos = list.borrow().iter().position(|v| v.equals(&target));
                Ok(Value::Number(pos.map(|p| p as f64).unwrap_or(-1.0)))
            })
        }
        (Value::List(_), "slice") => {
            let receiver = receiver.clone();
            Rc::new(move |args: &[Value]| {
                let start = args.first().and_then(as_i64);
                let end = args.get(1).and_then(as_i64);
                receiver.slice(start, end).map_err(|_| "slice bounds must be numbers".to_string())
            })
        }
        (Value::Dict(dict), "size") | (Value::Dict(dict), "len") => {
            let dict = dict.clone();
            Rc::new(move |_args: &[Value]| Ok(Value::Number(dict.borrow().len() as f64)))
        }
        (Value::Dict(dict), "keys") => {
            let dict = dict.clone();
            Rc::new(move |_args: &[Value]| Ok(Value::new_list(dict.borrow().keys())))
        }
        (Value::Dict(dict), "values") => {
            let dict = dict.clone();
            Rc::new(move |_args: &[Value]| Ok(Value::new_list(dict.borrow().values())))
        }
        (Value::Dict(dict), "has") => {
            let dict = dict.clone();
            Rc::new(move |args: &[Value]| Ok(Value::Bool(args.first().map_or(false, |k| dict.borrow().has(k)))))
        }
        (Value::Dict(dict), "get") => {
            let dict = dict.clone();
            Rc::new(move |args: &[Value]| {
                let key = args.first().cloned().unwrap_or(Value::Null);
                let default = args.get(1).cloned().unwrap_or(Value::Null);
                Ok(dict.borrow().get(&key).unwrap_or(default))
            })
        }
        (Value::Dict(dict), "set") => {
            let dict = dict.clone();
            Rc::new(move |args: &[Value]| {
                let key = args.first().cloned().unwrap_or(Value::Null);
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                dict.borrow_mut().set(key, value);
                Ok(Value::Null)
            })
        }
        (Value::Dict(dict), "remove") => {
            let dict = dict.clone();
            Rc::new(move |args: &[Value]| Ok(args.first().and_then(|k| dict.borrow_mut().remove(k)).unwrap_or(Value::Null)))
        }
        (Value::Str(s), "length") => {
            let len = s.chars().count();
            Rc::new(move |_args: &[Value]| Ok(Value::Number(len as f64)))
        }
        _ => return None,
    };
    Some(Value::Function(Callable::Native(Rc::from(name), f)))
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => Some(*n as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compiler, parser, scanner};

    fn run_src(src: &str) -> (FunctionTable, crate::bytecode::ConstantPool, FunctionIndex) {
        let (tokens, lex_errors) = scanner::scan(src);
        assert!(lex_errors.is_empty(), "lex errors: {:?}", lex_errors);
        let (program, parse_errors) = parser::parse(tokens);
        assert!(parse_errors.is_empty(), "parse errors: {:?}", parse_errors);
        let compiled = compiler::compile(&program).expect("should compile");
        (compiled.functions, compiled.constants, compiled.entry)
    }

    fn global_of(src: &str, name: &str) -> Value {
        let (functions, constants, entry) = run_src(src);
        let vm = VM::new(&functions, &constants, None);
        vm.run(entry).expect("should run");
        let value = vm.globals.borrow().get(name).cloned().expect("global should be set");
        value
    }

    // S1: recursive fibonacci.
    #[test]
    fn test_recursive_fibonacci() {
        let result = global_of("$ fib(n){ if (n<=1) return n; return fib(n-1)+fib(n-2); } result=fib(10);", "result");
        assert_eq!(result.to_display_string(), "55");
    }

    // S3: overload dispatch by arity and type score.
    #[test]
    fn test_overload_resolution() {
        let src = r#"
        $ describe(x:number){ return "number"; }
        $ describe(x:string){ return "string"; }
        a = describe(1);
        b = describe("hi");
        "#;
        let (functions, constants, entry) = run_src(src);
        let vm = VM::new(&functions, &constants, None);
        vm.run(entry).expect("should run");
        assert_eq!(vm.globals.borrow().get("a").unwrap().to_display_string(), "number");
        assert_eq!(vm.globals.borrow().get("b").unwrap().to_display_string(), "string");
    }

    // S4: a closure mutating state captured from its enclosing scope.
    #[test]
    fn test_closure_counter() {
        let src = r#"
        $ mk(){ c=0; return $() => { c=c+1; return c; }; }
        counter = mk();
        first = counter();
        second = counter();
        "#;
        let (functions, constants, entry) = run_src(src);
        let vm = VM::new(&functions, &constants, None);
        vm.run(entry).expect("should run");
        assert_eq!(vm.globals.borrow().get("first").unwrap().to_display_string(), "1");
        assert_eq!(vm.globals.borrow().get("second").unwrap().to_display_string(), "2");
    }

    // S7: negative-indexed slicing.
    #[test]
    fn test_negative_slice() {
        let result = global_of("a=[1,2,3,4,5]; tail=a[-2:];", "tail");
        assert_eq!(result.to_display_string(), "[4, 5]");
    }

    // S8: `??` only evaluates its right side when the left side is null.
    #[test]
    fn test_null_coalesce_short_circuits() {
        let src = r#"
        calls = 0;
        $ bump(){ calls=calls+1; return 99; }
        a = 5 ?? bump();
        b = null ?? bump();
        "#;
        let (functions, constants, entry) = run_src(src);
        let vm = VM::new(&functions, &constants, None);
        vm.run(entry).expect("should run");
        assert_eq!(vm.globals.borrow().get("a").unwrap().to_display_string(), "5");
        assert_eq!(vm.globals.borrow().get("b").unwrap().to_display_string(), "99");
        assert_eq!(vm.globals.borrow().get("calls").unwrap().to_display_string(), "1");
    }

    #[test]
    fn test_list_builtin_methods() {
        let src = "a=[1,2]; a.push(3); popped=a.pop(); n=a.length();";
        let (functions, constants, entry) = run_src(src);
        let vm = VM::new(&functions, &constants, None);
        vm.run(entry).expect("should run");
        assert_eq!(vm.globals.borrow().get("popped").unwrap().to_display_string(), "3");
        assert_eq!(vm.globals.borrow().get("n").unwrap().to_display_string(), "2");
    }

    #[test]
    fn test_match_ok_error_pattern() {
        let src = r#"
        $ safe_div(a,b){ return a/b; }
        outcome = match (safe_div(10,0)) {
            Ok(v) => v,
            Error(msg) => -1,
        };
        "#;
        let result = global_of(src, "outcome");
        assert_eq!(result.to_display_string(), "-1");
    }

    // Backend equivalence: a `for` loop must sum the same way whether it
    // runs through the tree evaluator or through this register VM. Regression
    // coverage for the loop counter/length/iterable registers getting
    // clobbered by the body's own scratch allocations.
    #[test]
    fn test_for_loop_matches_tree_evaluator() {
        let src = "a=[1,2,3,4,5]; total=0; for (x in a) { y = x * 2; total = total + y; }";
        let vm_result = global_of(src, "total");

        let (tokens, lex_errors) = scanner::scan(src);
        assert!(lex_errors.is_empty());
        let (program, parse_errors) = parser::parse(tokens);
        assert!(parse_errors.is_empty());
        let env = crate::env::Environment::root();
        let registry = crate::native::EmptyRegistry;
        let evaluator = crate::evaluator::Evaluator::new(&registry, None);
        evaluator.run(&program, &env).expect("evaluation should succeed");
        let tree_result = env.get("total", crate::token::Span::new(1, 1)).unwrap();

        assert_eq!(vm_result.to_display_string(), "30");
        assert_eq!(vm_result.to_display_string(), tree_result.to_display_string());
    }

    // Backend equivalence: a `for` loop whose iterable is itself a fresh
    // value (not a pre-existing local) must not alias the element register
    // with the iterable register.
    #[test]
    fn test_for_loop_over_fresh_iterable_does_not_corrupt_elements() {
        let src = "$ make(){ return [10,20,30]; } total=0; for (x in make()) { total = total + x; }";
        let result = global_of(src, "total");
        assert_eq!(result.to_display_string(), "60");
    }

    // Backend equivalence: a `match` with no matching arm evaluates to
    // `Null` on both backends instead of aborting.
    #[test]
    fn test_match_fallthrough_matches_tree_evaluator() {
        let src = r#"
        outcome = match (5) {
            1 => "one",
            2 => "two",
        };
        "#;
        let vm_result = global_of(src, "outcome");

        let (tokens, lex_errors) = scanner::scan(src);
        assert!(lex_errors.is_empty());
        let (program, parse_errors) = parser::parse(tokens);
        assert!(parse_errors.is_empty());
        let env = crate::env::Environment::root();
        let registry = crate::native::EmptyRegistry;
        let evaluator = crate::evaluator::Evaluator::new(&registry, None);
        evaluator.run(&program, &env).expect("evaluation should succeed");
        let tree_result = env.get("outcome", crate::token::Span::new(1, 1)).unwrap();

        assert_eq!(vm_result.to_display_string(), "null");
        assert_eq!(vm_result.to_display_string(), tree_result.to_display_string());
        assert_eq!(evaluator.take_warnings().len(), 1);
    }

    #[test]
    fn test_vm_records_warning_on_match_fallthrough() {
        let src = "outcome = match (5) { 1 => \"one\" };";
        let (functions, constants, entry) = run_src(src);
        let vm = VM::new(&functions, &constants, None);
        vm.run(entry).expect("should run");
        assert_eq!(vm.take_warnings().len(), 1);
    }
}
