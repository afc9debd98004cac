// Tree-walking evaluator.
//
// Executes a `Program` directly against an `Environment`, with no
// intermediate bytecode. Control only needs to thread one signal back up
// through nested blocks: a pending `return` value. Loops and branches are
// plain Rust control flow around that.

use crate::ast::*;
use crate::diagnostics::{dispatch_error, import_error, match_fallthrough_warning, resolve_error, stack_overflow, type_error, Diagnostic, ErrorKind};
use crate::env::{Env, Environment};
use crate::modules::ModuleLoader;
use crate::native::NativeRegistry;
use crate::parser;
use crate::scanner;
use crate::token::Literal;
use crate::value::{ArithError, Callable, ClassObject, Dict, IndexError, InstanceObject, NativeFn, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

const MAX_CALL_DEPTH: u32 = 800;

enum Signal {
    None,
    Return(Value),
}

pub struct Evaluator<'a> {
    registry: &'a dyn NativeRegistry,
    loader: Option<&'a ModuleLoader<'a>>,
    call_depth: Cell<u32>,
    // Receiver of the `init` method currently executing, if any: a bare
    // assignment inside `init` that resolves to no existing binding sets a
    // field on this instance instead of declaring a local.
    init_stack: RefCell<Vec<Value>>,
    module_cache: RefCell<HashMap<PathBuf, Env>>,
    warnings: RefCell<Vec<Diagnostic>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(registry: &'a dyn NativeRegistry, loader: Option<&'a ModuleLoader<'a>>) -> Evaluator<'a> {
        Evaluator {
            registry,
            loader,
            call_depth: Cell::new(0),
            init_stack: RefCell::new(Vec::new()),
            module_cache: RefCell::new(HashMap::new()),
            warnings: RefCell::new(Vec::new()),
        }
    }

    pub fn run(&self, program: &Program, env: &Env) -> Result<(), Diagnostic> {
        self.exec_block_stmts(program, env)?;
        Ok(())
    }

    // Non-fatal diagnostics accumulated during the run (currently: a
    // `match` with no matching arm). Drains the buffer.
    pub fn take_warnings(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.warnings.borrow_mut())
    }

    fn exec_block_stmts(&self, stmts: &[Stmt], env: &Env) -> Result<Signal, Diagnostic> {
        for stmt in stmts {
            match self.exec_stmt(stmt, env)? {
                Signal::None => {}
                ret @ Signal::Return(_) => return Ok(ret),
            }
        }
        Ok(Signal::None)
    }

    fn exec_stmt(&self, stmt: &Stmt, env: &Env) -> Result<Signal, Diagnostic> {
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.eval_expr(expr, env)?;
                Ok(Signal::None)
            }
            StmtKind::Var { name, type_annot, initializer, immutable } => {
                let value = match initializer {
                    Some(e) => self.eval_expr(e, env)?,
                    None => Value::Null,
                };
                if let Some(annot) = type_annot {
                    check_type_annot(annot, &value, stmt.span)?;
                }
                env.define(name, value, *immutable);
                Ok(Signal::None)
            }
            StmtKind::Block(stmts) => {
                let block_env = Environment::child(env);
                self.exec_block_stmts(stmts, &block_env)
            }
            StmtKind::If { condition, then_branch, else_branch } => {
                if self.eval_expr(condition, env)?.truthy() {
                    self.exec_stmt(then_branch, env)
                } else if let Some(else_branch) = else_branch {
                    self.exec_stmt(else_branch, env)
                } else {
                    Ok(Signal::None)
                }
            }
            StmtKind::While { condition, body } => {
                while self.eval_expr(condition, env)?.truthy() {
                    match self.exec_stmt(body, env)? {
                        Signal::None => {}
                        ret @ Signal::Return(_) => return Ok(ret),
                    }
                }
                Ok(Signal::None)
            }
            StmtKind::For { var, iterable, body } => {
                let iter_val = self.eval_expr(iterable, env)?;
                let items = iterate(&iter_val, stmt.span)?;
                for item in items {
                    let loop_env = Environment::child(env);
                    loop_env.define(var, item, false);
                    match self.exec_stmt(body, &loop_env)? {
                        Signal::None => {}
                        ret @ Signal::Return(_) => return Ok(ret),
                    }
                }
                Ok(Signal::None)
            }
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(e) => self.eval_expr(e, env)?,
                    None => Value::Null,
                };
                Ok(Signal::Return(value))
            }
            StmtKind::Function(decl) => {
                let closure = Value::Function(Callable::Closure(Rc::new(crate::value::Closure {
                    decl: decl.clone(),
                    captured: env.clone(),
                })));
                if let Some(name) = &decl.name {
                    env.define(name, closure, false);
                }
                Ok(Signal::None)
            }
            StmtKind::Class { name, methods, .. } => {
                let class = Rc::new(ClassObject { name: name.clone(), methods: RefCell::new(HashMap::new()) });
                for method_decl in methods {
                    let method_name = method_decl.name.clone().unwrap_or_default();
                    let closure = Callable::Closure(Rc::new(crate::value::Closure { decl: method_decl.clone(), captured: env.clone() }));
                    class.define_method(&method_name, closure);
                }
                env.define(name, Value::Class(class), false);
                Ok(Signal::None)
            }
            StmtKind::Export(inner) => {
                let signal = self.exec_stmt(inner, env)?;
                if let Some(name) = exported_name(inner) {
                    env.export(&name);
                }
                Ok(signal)
            }
            StmtKind::Import { path, names } => {
                self.exec_import(path, names, env, stmt.span)?;
                Ok(Signal::None)
            }
            StmtKind::TypeAlias { .. } => Ok(Signal::None),
        }
    }

    fn exec_import(&self, path: &str, names: &[String], env: &Env, span: Span) -> Result<(), Diagnostic> {
        let loader = self.loader.ok_or_else(|| import_error("module imports are disabled: no module loader configured", span))?;
        let importing_file = PathBuf::from("."); // single-file/embedded callers have no importing-file context
        let canonical = loader.resolve(path, &importing_file, span)?;
        let cached = self.module_cache.borrow().get(&canonical).cloned();
        let module_env = if let Some(cached) = cached {
            cached
        } else {
            let source = loader.load(&canonical, span)?;
            let (tokens, lex_errors) = scanner::scan(&source);
            if let Some(first) = lex_errors.into_iter().next() {
                return Err(Diagnostic::new(ErrorKind::Lex, first.message, first.span));
            }
            let (program, parse_errors) = parser::parse(tokens);
            if let Some(first) = parse_errors.into_iter().next() {
                return Err(first);
            }
            let module_env = Environment::root();
            self.run(&program, &module_env)?;
            loader.finish_loading(&canonical);
            self.module_cache.borrow_mut().insert(canonical.clone(), module_env.clone());
            module_env
        };
        for name in names {
            if !module_env.exported_names().iter().any(|n| n == name) {
                return Err(import_error(format!("'{}' is not exported by module '{}'", name, path), span));
            }
            let value = module_env.get(name, span)?;
            env.define(name, value, false);
        }
        Ok(())
    }

    fn eval_expr(&self, expr: &Expr, env: &Env) -> Result<Value, Diagnostic> {
        match &expr.kind {
            ExprKind::Literal(lit) => Ok(literal_value(lit)),
            ExprKind::Variable(name) => match env.get(name, expr.span) {
                Ok(v) => Ok(v),
                Err(e) if e.kind == ErrorKind::Resolve => self
                    .registry
                    .lookup(name)
                    .map(Value::Function)
                    .ok_or(e),
                Err(e) => Err(e),
            },
            ExprKind::This => env.get("this", expr.span),
            ExprKind::Assign(name, value_expr) => {
                let value = self.eval_expr(value_expr, env)?;
                self.assign_name(env, name, value.clone(), expr.span)?;
                Ok(value)
            }
            ExprKind::Grouping(inner) => self.eval_expr(inner, env),
            ExprKind::Unary(op, rhs) => {
                let v = self.eval_expr(rhs, env)?;
                match op {
                    UnOp::Not => Ok(v.not()),
                    UnOp::Neg => v.neg().map_err(|e| arith_diag(e, expr.span)),
                }
            }
            ExprKind::Logical(op, lhs, rhs) => {
                let l = self.eval_expr(lhs, env)?;
                match op {
                    LogicOp::And => {
                        if l.truthy() {
                            self.eval_expr(rhs, env)
                        } else {
                            Ok(l)
                        }
                    }
                    LogicOp::Or => {
                        if l.truthy() {
                            Ok(l)
                        } else {
                            self.eval_expr(rhs, env)
                        }
                    }
                }
            }
            ExprKind::Binary(BinOp::NullCoalesce, lhs, rhs) => {
                let l = self.eval_expr(lhs, env)?;
                if matches!(l, Value::Null) {
                    self.eval_expr(rhs, env)
                } else {
                    Ok(l)
                }
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let l = self.eval_expr(lhs, env)?;
                let r = self.eval_expr(rhs, env)?;
                eval_binary(*op, &l, &r, expr.span)
            }
            ExprKind::Call(callee, arg_exprs) => {
                let callee_value = self.eval_expr(callee, env)?;
                let mut args = Vec::with_capacity(arg_exprs.len());
                for a in arg_exprs {
                    args.push(self.eval_expr(a, env)?);
                }
                self.call_value(callee_value, args, expr.span)
            }
            ExprKind::Get(obj, name) => {
                let receiver = self.eval_expr(obj, env)?;
                resolve_get(receiver, name, expr.span)
            }
            ExprKind::Set(obj, name, value_expr) => {
                let receiver = self.eval_expr(obj, env)?;
                let value = self.eval_expr(value_expr, env)?;
                match &receiver {
                    Value::Instance(inst) => {
                        inst.fields.borrow_mut().set(Value::new_string(name.clone()), value.clone());
                        Ok(value)
                    }
                    other => Err(type_error(format!("cannot set property '{}' on {}", name, other.kind()), expr.span)),
                }
            }
            ExprKind::Index(obj, key) => {
                let receiver = self.eval_expr(obj, env)?;
                let key = self.eval_expr(key, env)?;
                receiver.index(&key).map_err(|e| index_diag(e, expr.span))
            }
            ExprKind::IndexSet(obj, key, value_expr) => {
                let receiver = self.eval_expr(obj, env)?;
                let key = self.eval_expr(key, env)?;
                let value = self.eval_expr(value_expr, env)?;
                receiver.index_set(&key, value.clone()).map_err(|e| index_diag(e, expr.span))?;
                Ok(value)
            }
            ExprKind::Slice(obj, start, end) => {
                let receiver = self.eval_expr(obj, env)?;
                let start = start.as_ref().map(|e| self.eval_index_bound(e, env)).transpose()?;
                let end = end.as_ref().map(|e| self.eval_index_bound(e, env)).transpose()?;
                receiver.slice(start, end).map_err(|e| index_diag(e, expr.span))
            }
            ExprKind::ListExpr(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(item, env)?);
                }
                Ok(Value::new_list(values))
            }
            ExprKind::Dict(keys, values) => {
                let mut dict = Dict::new();
                for (k, v) in keys.iter().zip(values.iter()) {
                    let key = self.eval_expr(k, env)?;
                    let value = self.eval_expr(v, env)?;
                    dict.set(key, value);
                }
                Ok(Value::new_dict(dict))
            }
            ExprKind::Lambda(decl) => Ok(Value::Function(Callable::Closure(Rc::new(crate::value::Closure {
                decl: decl.clone(),
                captured: env.clone(),
            })))),
            ExprKind::Match(scrutinee, arms) => {
                let value = self.eval_expr(scrutinee, env)?;
                self.eval_match(value, arms, env, expr.span)
            }
        }
    }

    fn eval_index_bound(&self, expr: &Expr, env: &Env) -> Result<i64, Diagnostic> {
        match self.eval_expr(expr, env)? {
            Value::Number(n) => Ok(n as i64),
            other => Err(type_error(format!("slice bound must be a number, got {}", other.kind()), expr.span)),
        }
    }

    fn eval_match(&self, scrutinee: Value, arms: &[MatchArm], env: &Env, span: Span) -> Result<Value, Diagnostic> {
        for arm in arms {
            let arm_env = Environment::child(env);
            if self.try_bind_pattern(&arm.pattern, &scrutinee, &arm_env)? {
                if let Some(guard) = &arm.guard {
                    if !self.eval_expr(guard, &arm_env)?.truthy() {
                        continue;
                    }
                }
                return self.eval_expr(&arm.body, &arm_env);
            }
        }
        self.warnings.borrow_mut().push(match_fallthrough_warning(span));
        Ok(Value::Null)
    }

    fn try_bind_pattern(&self, pattern: &Pattern, value: &Value, env: &Env) -> Result<bool, Diagnostic> {
        match pattern {
            Pattern::Wildcard => Ok(true),
            Pattern::Binding(name) => {
                env.define(name, value.clone(), false);
                Ok(true)
            }
            Pattern::Literal(expr) => {
                let lit = self.eval_expr(expr, env)?;
                Ok(lit.equals(value))
            }
            Pattern::Ok(inner) => match value {
                Value::ResultOk(v) => self.try_bind_pattern(inner, v, env),
                _ => Ok(false),
            },
            Pattern::Error(inner) => match value {
                Value::ResultError(v) => self.try_bind_pattern(inner, v, env),
                _ => Ok(false),
            },
        }
    }

    // Falls back to declaring a fresh local (or, inside `init`, a field on
    // the instance being constructed) when `name` has no existing binding
    // anywhere in the chain. A found binding is mutated in place instead.
    fn assign_name(&self, env: &Env, name: &str, value: Value, span: Span) -> Result<(), Diagnostic> {
        match env.assign(name, value.clone(), span) {
            Ok(()) => Ok(()),
            Err(e) if e.kind == ErrorKind::Resolve => {
                if let Some(Value::Instance(inst)) = self.init_stack.borrow().last() {
                    inst.fields.borrow_mut().set(Value::new_string(name.to_string()), value);
                    return Ok(());
                }
                env.define(name, value, false);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn call_value(&self, callee: Value, args: Vec<Value>, span: Span) -> Result<Value, Diagnostic> {
        match callee {
            Value::Function(Callable::Bound { receiver, method }) => {
                let resolved = crate::dispatch::resolve_call(&method, &args, span)?;
                self.invoke_resolved(resolved, Some(*receiver), args, span)
            }
            Value::Function(f) => {
                let resolved = crate::dispatch::resolve_call(&f, &args, span)?;
                self.invoke_resolved(resolved, None, args, span)
            }
            Value::Class(class) => self.instantiate(&class, args, span),
            other => Err(type_error(format!("'{}' is not callable", other.kind()), span)),
        }
    }

    fn invoke_resolved(&self, resolved: Callable, this: Option<Value>, args: Vec<Value>, span: Span) -> Result<Value, Diagnostic> {
        match resolved {
            Callable::Closure(c) => self.invoke_closure(&c, this, args, span),
            Callable::Native(_, f) => f(&args).map_err(|e| type_error(e, span)),
            Callable::Bound { receiver, method } => {
                let inner = crate::dispatch::resolve_call(&method, &args, span)?;
                self.invoke_resolved(inner, Some(*receiver), args, span)
            }
            Callable::Compiled(_) => {
                Err(type_error("a compiled function value cannot be invoked by the tree-walking backend", span))
            }
            Callable::Group(_) => unreachable!("resolve_call always returns a concrete callable"),
        }
    }

    fn invoke_closure(&self, closure: &Rc<crate::value::Closure>, this: Option<Value>, args: Vec<Value>, span: Span) -> Result<Value, Diagnostic> {
        if self.call_depth.get() >= MAX_CALL_DEPTH {
            return Err(stack_overflow(span));
        }
        self.call_depth.set(self.call_depth.get() + 1);
        let result = self.invoke_closure_body(closure, this, args, span);
        self.call_depth.set(self.call_depth.get() - 1);
        result
    }

    fn invoke_closure_body(&self, closure: &Rc<crate::value::Closure>, this: Option<Value>, args: Vec<Value>, span: Span) -> Result<Value, Diagnostic> {
        let call_env = Environment::child(&closure.captured);
        if let Some(receiver) = &this {
            call_env.define("this", receiver.clone(), true);
        }
        for (param, arg) in closure.decl.params.iter().zip(args.iter()) {
            if let Some(annot) = &param.type_annot {
                check_type_annot(annot, arg, span)?;
            }
            call_env.define(&param.name, arg.clone(), false);
        }
        let is_init = closure.decl.name.as_deref() == Some("init") && this.is_some();
        if is_init {
            self.init_stack.borrow_mut().push(this.clone().unwrap());
        }
        let signal = self.exec_block_stmts(&closure.decl.body, &call_env);
        if is_init {
            self.init_stack.borrow_mut().pop();
        }
        match signal? {
            Signal::Return(v) => Ok(v),
            Signal::None => Ok(this.unwrap_or(Value::Null)),
        }
    }

    fn instantiate(&self, class: &Rc<ClassObject>, args: Vec<Value>, span: Span) -> Result<Value, Diagnostic> {
        let inst = Rc::new(InstanceObject { class: class.clone(), fields: RefCell::new(Dict::new()) });
        let instance_value = Value::Instance(inst);
        let init = class.methods.borrow().get("init").cloned();
        match init {
            Some(init) => {
                self.call_value(Value::Function(Callable::Bound { receiver: Box::new(instance_value.clone()), method: Rc::new(init) }), args, span)?;
            }
            None if !args.is_empty() => {
                return Err(dispatch_error(format!("class '{}' has no init but {} argument(s) given", class.name, args.len()), span, &[]));
            }
            None => {}
        }
        Ok(instance_value)
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Number(n) => Value::Number(*n),
        Literal::Str(s) => Value::new_string(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
    }
}

fn exported_name(stmt: &Stmt) -> Option<String> {
    match &stmt.kind {
        StmtKind::Var { name, .. } => Some(name.clone()),
        StmtKind::Function(decl) => decl.name.clone(),
        StmtKind::Class { name, .. } => Some(name.clone()),
        _ => None,
    }
}

fn iterate(value: &Value, span: Span) -> Result<Vec<Value>, Diagnostic> {
    match value {
        Value::List(items) => Ok(items.borrow().clone()),
        Value::Dict(dict) => Ok(dict.borrow().keys()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::new_string(c.to_string())).collect()),
        other => Err(type_error(format!("cannot iterate over {}", other.kind()), span)),
    }
}

fn eval_binary(op: BinOp, l: &Value, r: &Value, span: Span) -> Result<Value, Diagnostic> {
    use std::cmp::Ordering;
    match op {
        BinOp::Add => l.add(r).map_err(|e| arith_diag(e, span)),
        BinOp::Sub => l.sub(r).map_err(|e| arith_diag(e, span)),
        BinOp::Mul => l.mul(r).map_err(|e| arith_diag(e, span)),
        BinOp::Div => l.div(r).map_err(|e| arith_diag(e, span)),
        BinOp::Mod => l.modulo(r).map_err(|e| arith_diag(e, span)),
        BinOp::Pow => l.pow(r).map_err(|e| arith_diag(e, span)),
        BinOp::Eq => Ok(Value::Bool(l.equals(r))),
        BinOp::Ne => Ok(Value::Bool(!l.equals(r))),
        BinOp::Lt => l.compare(r).map(|o| Value::Bool(o == Ordering::Less)).map_err(|e| arith_diag(e, span)),
        BinOp::Le => l.compare(r).map(|o| Value::Bool(o != Ordering::Greater)).map_err(|e| arith_diag(e, span)),
        BinOp::Gt => l.compare(r).map(|o| Value::Bool(o == Ordering::Greater)).map_err(|e| arith_diag(e, span)),
        BinOp::Ge => l.compare(r).map(|o| Value::Bool(o != Ordering::Less)).map_err(|e| arith_diag(e, span)),
        BinOp::NullCoalesce => unreachable!("short-circuited before eval_binary"),
    }
}

fn describe_kind_set(set: crate::value::ValueKindSet) -> String {
    set.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(" or ")
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
        IndexError::OutOfBounds { index, len } => {
            crate::diagnostics::bounds_error(format!("index {} out of bounds for length {}", index, len), span)
        }
    }
}

fn check_type_annot(annot: &TypeAnnot, value: &Value, span: Span) -> Result<(), Diagnostic> {
    let ok = match annot {
        TypeAnnot::Number => matches!(value, Value::Number(_)),
        TypeAnnot::Str => matches!(value, Value::Str(_)),
        TypeAnnot::Boolean => matches!(value, Value::Bool(_)),
        TypeAnnot::Null => matches!(value, Value::Null),
        TypeAnnot::Any => true,
        TypeAnnot::Array(_) => matches!(value, Value::List(_)),
        TypeAnnot::Dict(_, _) => matches!(value, Value::Dict(_)),
        TypeAnnot::Function(..) => matches!(value, Value::Function(_)),
        TypeAnnot::Named(name) => match value {
            Value::Instance(inst) => &inst.class.name == name,
            Value::Class(c) => &c.name == name,
            // Type aliases resolve to `Any` at runtime: the alias target
            // isn't tracked past parsing, so only class names are checked.
            _ => true,
        },
    };
    if ok {
        Ok(())
    } else {
        Err(type_error(format!("value of kind {} does not match declared type", value.kind()), span))
    }
}

fn resolve_get(receiver: Value, name: &str, span: Span) -> Result<Value, Diagnostic> {
    match &receiver {
        Value::Instance(inst) => {
            let key = Value::new_string(name.to_string());
            if let Some(v) = inst.fields.borrow().get(&key) {
                return Ok(v);
            }
            if let Some(m) = inst.class.methods.borrow().get(name).cloned() {
                return Ok(Value::Function(Callable::Bound { receiver: Box::new(receiver.clone()), method: Rc::new(m) }));
            }
            Err(resolve_error(format!("undefined property '{}' on instance of '{}'", name, inst.class.name), span))
        }
        Value::List(_) | Value::Dict(_) | Value::Str(_) => {
            container_method(receiver.clone(), name).ok_or_else(|| resolve_error(format!("no such method '{}' on {}", name, receiver.kind()), span))
        }
        other => Err(type_error(format!("cannot access property '{}' on {}", name, other.kind()), span)),
    }
}

// Built-in container methods. These live outside `value::Value` proper
// because they need to be late-bound as ordinary callables (so `list.push`
// can be passed around like any other function value).
fn container_method(receiver: Value, name: &str) -> Option<Value> {
    let f: Rc<NativeFn> = match (&receiver, name) {
        (Value::List(list), "len") => {
            let list = list.clone();
            Rc::new(move |_args: &[Value]| Ok(Value::Number(list.borrow().len() as f64)))
        }
        (Value::List(list), "push") => {
            let list = list.clone();
            Rc::new(move |args: &[Value]| {
                let v = args.first().cloned().unwrap_or(Value::Null);
                list.borrow_mut().push(v);
                Ok(Value::Null)
            })
        }
        (Value::List(list), "pop") => {
            let list = list.clone();
            Rc::new(move |_args: &[Value]| Ok(list.borrow_mut().pop().unwrap_or(Value::Null)))
        }
        (Value::Dict(dict), "len") => {
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
        (Value::Dict(dict), "remove") => {
            let dict = dict.clone();
            Rc::new(move |args: &[Value]| Ok(args.first().and_then(|k| dict.borrow_mut().remove(k)).unwrap_or(Value::Null)))
        }
        (Value::Str(s), "len") => {
            let len = s.chars().count();
            Rc::new(move |_args: &[Value]| Ok(Value::Number(len as f64)))
        }
        _ => return None,
    };
    Some(Value::Function(Callable::Native(Rc::from(name), f)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::EmptyRegistry;

    fn run_ok(src: &str) -> Env {
        let (tokens, lex_errors) = scanner::scan(src);
        assert!(lex_errors.is_empty(), "lex errors: {:?}", lex_errors);
        let (program, parse_errors) = parser::parse(tokens);
        assert!(parse_errors.is_empty(), "parse errors: {:?}", parse_errors);
        let env = Environment::root();
        let registry = EmptyRegistry;
        let evaluator = Evaluator::new(&registry, None);
        evaluator.run(&program, &env).expect("evaluation should succeed");
        env
    }

    fn run_err(src: &str) -> Diagnostic {
        let (tokens, _) = scanner::scan(src);
        let (program, _) = parser::parse(tokens);
        let env = Environment::root();
        let registry = EmptyRegistry;
        let evaluator = Evaluator::new(&registry, None);
        evaluator.run(&program, &env).unwrap_err()
    }

    // S1: recursive fibonacci.
    #[test]
    fn test_recursive_fibonacci() {
        let env = run_ok(
            "$ fib(n){ if (n<=1) return n; return fib(n-1)+fib(n-2); } result=fib(10);",
        );
        assert_eq!(env.get("result", Span::new(1, 1)).unwrap().to_display_string(), "55");
    }

    // S2: matching on a Result value.
    #[test]
    fn test_match_on_result() {
        let env = run_ok(
            r#"
            $ safe_div(a,b){ return a/b; }
            outcome = match (safe_div(10,0)) {
                Ok(v) => v,
                Error(msg) => -1,
            };
            "#,
        );
        assert_eq!(env.get("outcome", Span::new(1, 1)).unwrap().to_display_string(), "-1");
    }

    // S3: overload dispatch by arity and type score.
    #[test]
    fn test_overload_resolution() {
        let env = run_ok(
            r#"
            $ describe(x:number){ return "number"; }
            $ describe(x:string){ return "string"; }
            a = describe(1);
            b = describe("hi");
            "#,
        );
        assert_eq!(env.get("a", Span::new(1, 1)).unwrap().to_display_string(), "number");
        assert_eq!(env.get("b", Span::new(1, 1)).unwrap().to_display_string(), "string");
    }

    // S4: a closure mutating state captured from its enclosing scope.
    #[test]
    fn test_closure_counter() {
        let env = run_ok(
            r#"
            $ mk(){ c=0; return $() => { c=c+1; return c; }; }
            counter = mk();
            first = counter();
            second = counter();
            "#,
        );
        assert_eq!(env.get("first", Span::new(1, 1)).unwrap().to_display_string(), "1");
        assert_eq!(env.get("second", Span::new(1, 1)).unwrap().to_display_string(), "2");
    }

    // S5: dict iteration preserves insertion order.
    #[test]
    fn test_dict_insertion_order() {
        let env = run_ok(
            r#"
            d = {"z": 1, "a": 2, "m": 3};
            order = "";
            for (k in d) { order = order + k; }
            "#,
        );
        assert_eq!(env.get("order", Span::new(1, 1)).unwrap().to_display_string(), "zam");
    }

    // S6: rebinding an `@immut` name aborts the run.
    #[test]
    fn test_immutable_rebind_aborts() {
        let err = run_err("@immut PI=3; PI=4;");
        assert_eq!(err.kind, ErrorKind::Assign);
    }

    // S7: negative-indexed slicing.
    #[test]
    fn test_negative_slice() {
        let env = run_ok("a=[1,2,3,4,5]; tail=a[-2:];");
        assert_eq!(env.get("tail", Span::new(1, 1)).unwrap().to_display_string(), "[4, 5]");
    }

    // S8: `??` only evaluates its right side when the left side is null.
    #[test]
    fn test_null_coalesce_short_circuits() {
        let env = run_ok(
            r#"
            calls = 0;
            $ bump(){ calls=calls+1; return 99; }
            a = 5 ?? bump();
            b = null ?? bump();
            "#,
        );
        assert_eq!(env.get("a", Span::new(1, 1)).unwrap().to_display_string(), "5");
        assert_eq!(env.get("b", Span::new(1, 1)).unwrap().to_display_string(), "99");
        assert_eq!(env.get("calls", Span::new(1, 1)).unwrap().to_display_string(), "1");
    }

    #[test]
    fn test_class_init_binds_field_via_bare_assignment() {
        let env = run_ok(
            r#"
            class Counter {
                $ init(start) { value=start; }
                $ bump() { value=value+1; return value; }
            }
            c = Counter(10);
            after = c.bump();
            "#,
        );
        assert_eq!(env.get("after", Span::new(1, 1)).unwrap().to_display_string(), "11");
    }

    #[test]
    fn test_list_builtin_methods() {
        let env = run_ok("a=[1,2]; a.push(3); n=a.len();");
        assert_eq!(env.get("n", Span::new(1, 1)).unwrap().to_display_string(), "3");
    }
}
