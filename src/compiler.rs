// AST -> bytecode lowering.
//
// One `FunctionScope` per nested function/lambda/method being compiled, kept
// on a stack so upvalue resolution can walk outward through enclosing
// scopes the way the tree evaluator walks outward through `Environment`
// parents. Named locals are allocated a register once per function and kept
// live for the whole function body (closures only ever capture named
// locals, never scratch temporaries, so this sidesteps any question of a
// captured register being reused); scratch registers used while evaluating
// a sub-expression are a simple bump allocator reset at each statement
// boundary.

use crate::ast::*;
use crate::bytecode::{ConstantPool, FunctionIndex, FunctionInfo, FunctionTable, Instr, Op, Operand, UpvalueDesc};
use crate::diagnostics::{assign_error, import_error, resolve_error, Diagnostic};
use crate::token::Literal;
use crate::value::Value;
use std::rc::Rc;

struct Local {
    name: String,
    register: u8,
    immutable: bool,
}

struct FunctionScope {
    name: Option<String>,
    arity: usize,
    locals: Vec<Vec<Local>>,
    // Counted as `usize` so a function that runs past the 256-register cap
    // reports a clean compile error instead of wrapping a `u8` counter.
    named_top: usize,
    scratch_top: usize,
    max_register: u8,
    code: Vec<Instr>,
    spans: Vec<Span>,
    upvalues: Vec<UpvalueDesc>,
}

impl FunctionScope {
    fn new(name: Option<String>, arity: usize) -> FunctionScope {
        FunctionScope {
            name,
            arity,
            locals: vec![Vec::new()],
            named_top: 0,
            scratch_top: 0,
            max_register: 0,
            code: Vec::new(),
            spans: Vec::new(),
            upvalues: Vec::new(),
        }
    }

    fn find_local(&self, name: &str) -> Option<(u8, bool)> {
        for block in self.locals.iter().rev() {
            if let Some(local) = block.iter().rev().find(|l| l.name == name) {
                return Some((local.register, local.immutable));
            }
        }
        None
    }

    fn too_many_registers(&self, span: Span) -> Diagnostic {
        assign_error(format!("function '{}' uses more than 256 registers", self.name.as_deref().unwrap_or("$")), span)
    }

    fn declare_local(&mut self, name: &str, immutable: bool) -> Result<u8, Diagnostic> {
        if self.named_top >= crate::bytecode::MAX_REGISTERS {
            return Err(self.too_many_registers(Span::new(0, 0)));
        }
        let reg = self.named_top as u8;
        self.named_top += 1;
        self.bump_watermark(self.named_top);
        self.scratch_top = self.named_top;
        self.locals.last_mut().unwrap().push(Local { name: name.to_string(), register: reg, immutable });
        Ok(reg)
    }

    fn bump_watermark(&mut self, top: usize) {
        if top as u8 as usize == top && top as u8 > self.max_register {
            self.max_register = top as u8;
        }
    }

    fn alloc_scratch(&mut self, span: Span) -> Result<u8, Diagnostic> {
        if self.scratch_top >= crate::bytecode::MAX_REGISTERS {
            return Err(self.too_many_registers(span));
        }
        let reg = self.scratch_top as u8;
        self.scratch_top += 1;
        self.bump_watermark(self.scratch_top);
        Ok(reg)
    }

    fn reset_scratch(&mut self) {
        self.scratch_top = self.named_top;
    }

    fn push_block(&mut self) {
        self.locals.push(Vec::new());
    }

    fn pop_block(&mut self) {
        self.locals.pop();
    }

    fn emit(&mut self, instr: Instr, span: Span) {
        self.code.push(instr);
        self.spans.push(span);
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    // Jump targets are patched in after the fact, once the jump's
    // destination has actually been compiled. The target is an absolute
    // instruction index stored in the unused `c` operand (conditional
    // jumps keep their condition register in `b`, so target needs its own
    // slot rather than overloading `a`, which is too narrow to index a
    // function body of any real size).
    fn patch_jump_target(&mut self, at: usize, target: usize) {
        self.code[at].c = Operand::Const(target as u16);
    }
}

pub struct Compiler {
    constants: ConstantPool,
    functions: FunctionTable,
    scopes: Vec<FunctionScope>,
    global_names: std::collections::HashSet<String>,
}

// Compiled output: the script's own top-level code lives as function 0 in
// the function table; `constants`/`functions` are shared by every nested
// function reachable from it via `MAKE_CLOSURE`.
pub struct CompiledProgram {
    pub entry: FunctionIndex,
    pub constants: ConstantPool,
    pub functions: FunctionTable,
}

pub fn compile(program: &Program) -> Result<CompiledProgram, Diagnostic> {
    let mut compiler = Compiler {
        constants: ConstantPool::new(),
        functions: FunctionTable::new(),
        scopes: Vec::new(),
        global_names: std::collections::HashSet::new(),
    };
    compiler.scopes.push(FunctionScope::new(Some("<script>".to_string()), 0));
    for stmt in program {
        compiler.compile_stmt(stmt)?;
    }
    let top = compiler.scopes.pop().unwrap();
    let entry = compiler.functions.push(FunctionInfo {
        name: top.name.map(Rc::from),
        arity: top.arity,
        num_registers: top.max_register,
        code: top.code,
        spans: top.spans,
        upvalues: top.upvalues,
        params: vec![],
    });
    Ok(CompiledProgram { entry, constants: compiler.constants, functions: compiler.functions })
}

impl Compiler {
    fn scope(&mut self) -> &mut FunctionScope {
        self.scopes.last_mut().unwrap()
    }

    fn is_top_level(&self) -> bool {
        self.scopes.len() == 1
    }

    fn compile_block(&mut self, stmts: &[Stmt]) -> Result<(), Diagnostic> {
        self.scope().push_block();
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        self.scope().pop_block();
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), Diagnostic> {
        self.scope().reset_scratch();
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.compile_expr(expr)?;
                Ok(())
            }
            StmtKind::Var { name, initializer, immutable, .. } => {
                let value_reg = match initializer {
                    Some(e) => self.compile_expr(e)?,
                    None => self.load_const(Value::Null, stmt.span)?,
                };
                self.declare_and_bind(name, *immutable, value_reg, stmt.span)
            }
            StmtKind::Block(stmts) => self.compile_block(stmts),
            StmtKind::If { condition, then_branch, else_branch } => self.compile_if(condition, then_branch, else_branch.as_deref(), stmt.span),
            StmtKind::While { condition, body } => self.compile_while(condition, body, stmt.span),
            StmtKind::For { var, iterable, body } => self.compile_for(var, iterable, body, stmt.span),
            StmtKind::Return(expr) => {
                let reg = match expr {
                    Some(e) => self.compile_expr(e)?,
                    None => self.load_const(Value::Null, stmt.span)?,
                };
                self.scope().emit(Instr::a_only(Op::Return, reg), stmt.span);
                Ok(())
            }
            StmtKind::Function(decl) => {
                let reg = self.compile_function_literal(decl, stmt.span)?;
                match &decl.name {
                    Some(name) => self.declare_and_bind(name, false, reg, stmt.span),
                    None => Ok(()),
                }
            }
            StmtKind::Class { .. } => Err(resolve_error("class declarations compile to the tree-walking backend only; the register VM covers the procedural and functional core", stmt.span)),
            StmtKind::Export(inner) => self.compile_stmt(inner),
            StmtKind::Import { .. } => Err(import_error("module imports are not supported when compiling to bytecode", stmt.span)),
            StmtKind::TypeAlias { .. } => Ok(()),
        }
    }

    fn compile_if(&mut self, condition: &Expr, then_branch: &Stmt, else_branch: Option<&Stmt>, span: Span) -> Result<(), Diagnostic> {
        let cond_reg = self.compile_expr(condition)?;
        let jump_to_else = self.scope().here();
        self.scope().emit(Instr::ab(guard_op(condition), 0, Operand::Reg(cond_reg)), span);
        self.compile_stmt(then_branch)?;
        if let Some(else_branch) = else_branch {
            let jump_to_end = self.scope().here();
            self.scope().emit(Instr::a_only(Op::Jump, 0), span);
            let else_start = self.scope().here();
            self.scope().patch_jump_target(jump_to_else, else_start);
            self.compile_stmt(else_branch)?;
            let end = self.scope().here();
            self.scope().patch_jump_target(jump_to_end, end);
        } else {
            let end = self.scope().here();
            self.scope().patch_jump_target(jump_to_else, end);
        }
        Ok(())
    }

    fn compile_while(&mut self, condition: &Expr, body: &Stmt, span: Span) -> Result<(), Diagnostic> {
        let loop_start = self.scope().here();
        let cond_reg = self.compile_expr(condition)?;
        let jump_to_end = self.scope().here();
        self.scope().emit(Instr::ab(guard_op(condition), 0, Operand::Reg(cond_reg)), span);
        self.compile_stmt(body)?;
        let back = self.scope().here();
        self.scope().emit(Instr::a_only(Op::JumpBack, 0), span);
        self.scope().patch_jump_target(back, loop_start);
        let end = self.scope().here();
        self.scope().patch_jump_target(jump_to_end, end);
        Ok(())
    }

    // Desugars `for (x in xs) body` into index-driven iteration: length
    // lookup once, then a counted `while`, mirroring the iteration order
    // guarantee the tree evaluator gets for free from `Vec`/`Dict` order.
    //
    // `iter`/`idx`/`len` are declared as named locals (under sentinel names
    // no identifier can ever scan to) rather than scratch registers, so
    // `reset_scratch` at each body statement boundary can never reclaim
    // them; declaring them before the loop variable also guarantees the
    // loop variable's own register never aliases the iterable's.
    fn compile_for(&mut self, var: &str, iterable: &Expr, body: &Stmt, span: Span) -> Result<(), Diagnostic> {
        self.scope().push_block();
        let iter_expr_reg = self.compile_expr(iterable)?;
        let iter_reg = self.scope().declare_local("<for:iter>", true)?;
        if iter_expr_reg != iter_reg {
            self.scope().emit(Instr::ab(Op::Move, iter_reg, Operand::Reg(iter_expr_reg)), span);
        }

        let zero = self.load_const(Value::Number(0.0), span)?;
        let idx_reg = self.scope().declare_local("<for:idx>", false)?;
        if zero != idx_reg {
            self.scope().emit(Instr::ab(Op::Move, idx_reg, Operand::Reg(zero)), span);
        }

        let len_reg = self.scope().declare_local("<for:len>", true)?;
        self.scope().emit(Instr::ab(Op::ArrayLength, len_reg, Operand::Reg(iter_reg)), span);

        let loop_start = self.scope().here();
        let cmp_reg = self.scope().alloc_scratch(span)?;
        self.scope().emit(Instr::new(Op::Lt, cmp_reg, Operand::Reg(idx_reg), Operand::Reg(len_reg)), span);
        let jump_to_end = self.scope().here();
        self.scope().emit(Instr::ab(Op::CmpJumpIfFalse, 0, Operand::Reg(cmp_reg)), span);

        self.scope().push_block();
        let elem_reg = self.scope().declare_local(var, false)?;
        self.scope().emit(Instr::new(Op::GetIndex, elem_reg, Operand::Reg(iter_reg), Operand::Reg(idx_reg)), span);
        self.compile_stmt(body)?;
        self.scope().pop_block();

        let one = self.load_const(Value::Number(1.0), span)?;
        self.scope().emit(Instr::new(Op::Add, idx_reg, Operand::Reg(idx_reg), Operand::Reg(one)), span);
        let back = self.scope().here();
        self.scope().emit(Instr::a_only(Op::JumpBack, 0), span);
        self.scope().patch_jump_target(back, loop_start);
        let end = self.scope().here();
        self.scope().patch_jump_target(jump_to_end, end);
        self.scope().pop_block();
        Ok(())
    }

    fn declare_and_bind(&mut self, name: &str, immutable: bool, value_reg: u8, span: Span) -> Result<(), Diagnostic> {
        if self.is_top_level() {
            self.global_names.insert(name.to_string());
            let name_const = self.constants.intern(Value::new_string(name));
            self.scope().emit(Instr::ab(Op::StoreGlobal, value_reg, Operand::Const(name_const)), span);
            Ok(())
        } else {
            let reg = self.scope().declare_local(name, immutable)?;
            if reg != value_reg {
                self.scope().emit(Instr::ab(Op::Move, reg, Operand::Reg(value_reg)), span);
            }
            Ok(())
        }
    }

    // Resolves `name`, assigning in place if it already has a binding
    // anywhere in the scope chain, else declaring fresh -- the same
    // resolve-or-define fallback the evaluator implements dynamically
    // against `Environment`, applied here at compile time against the
    // statically-known chain of enclosing `FunctionScope`s.
    fn assign_or_declare(&mut self, name: &str, value_reg: u8, span: Span) -> Result<(), Diagnostic> {
        let depth = self.scopes.len() - 1;
        if let Some((reg, immutable)) = self.scope().find_local(name) {
            if immutable {
                return Err(assign_error(format!("cannot assign to immutable binding '{}'", name), span));
            }
            if reg != value_reg {
                self.scope().emit(Instr::ab(Op::Move, reg, Operand::Reg(value_reg)), span);
            }
            return Ok(());
        }
        if let Some(up_idx) = resolve_upvalue(&mut self.scopes, depth, name) {
            self.scope().emit(Instr::ab(Op::SetUpvalue, value_reg, Operand::Reg(up_idx)), span);
            return Ok(());
        }
        if self.global_names.contains(name) {
            let name_const = self.constants.intern(Value::new_string(name));
            self.scope().emit(Instr::ab(Op::StoreGlobal, value_reg, Operand::Const(name_const)), span);
            return Ok(());
        }
        self.declare_and_bind(name, false, value_reg, span)
    }

    fn load_const(&mut self, value: Value, span: Span) -> Result<u8, Diagnostic> {
        let idx = self.constants.intern(value);
        let reg = self.scope().alloc_scratch(span)?;
        self.scope().emit(Instr::ab(Op::LoadConst, reg, Operand::Const(idx)), span);
        Ok(reg)
    }

    // Recognizes `x = x + 1` (either operand order) against a plain local
    // -- not an upvalue or global, which have their own assignment
    // instructions -- and emits a single `IncLocal` in place of the
    // LoadConst+Add+Move a generic assignment would produce. `IncLocal`
    // uses the same polymorphic `Value::add` as `Add` itself, so this
    // never changes what the program computes, only how many
    // instructions it takes. Returns `Ok(None)` when the shape doesn't
    // apply, letting the caller fall back to the general path.
    fn try_compile_increment(&mut self, name: &str, value_expr: &Expr, span: Span) -> Result<Option<u8>, Diagnostic> {
        let is_one = |e: &Expr| matches!(&e.kind, ExprKind::Literal(Literal::Number(n)) if *n == 1.0);
        let is_self = |e: &Expr| matches!(&e.kind, ExprKind::Variable(n) if n == name);
        let shape = match &value_expr.kind {
            ExprKind::Binary(BinOp::Add, lhs, rhs) => (is_self(lhs) && is_one(rhs)) || (is_one(lhs) && is_self(rhs)),
            _ => false,
        };
        if !shape {
            return Ok(None);
        }
        let (reg, immutable) = match self.scope().find_local(name) {
            Some(found) => found,
            None => return Ok(None),
        };
        if immutable {
            return Err(assign_error(format!("cannot assign to immutable binding '{}'", name), span));
        }
        self.scope().emit(Instr::a_only(Op::IncLocal, reg), span);
        Ok(Some(reg))
    }

    // Recognizes `<literal> + <local>` / `<local> + <literal>` and emits a
    // single `AddConstLocal` instead of LoadConst+Add. Like `IncLocal`,
    // `AddConstLocal` uses full `Value::add`, so it is safe for strings as
    // well as numbers.
    fn try_compile_add_const_local(&mut self, lhs: &Expr, rhs: &Expr, span: Span) -> Result<Option<u8>, Diagnostic> {
        let (lit_expr, var_name) = match (&lhs.kind, &rhs.kind) {
            (ExprKind::Literal(lit), ExprKind::Variable(name)) => (lit, name),
            (ExprKind::Variable(name), ExprKind::Literal(lit)) => (lit, name),
            _ => return Ok(None),
        };
        let (reg, _) = match self.scope().find_local(var_name) {
            Some(found) => found,
            None => return Ok(None),
        };
        let idx = self.constants.intern(literal_value(lit_expr));
        let dest = self.scope().alloc_scratch(span)?;
        self.scope().emit(Instr::new(Op::AddConstLocal, dest, Operand::Const(idx), Operand::Reg(reg)), span);
        Ok(Some(dest))
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<u8, Diagnostic> {
        match &expr.kind {
            ExprKind::Literal(lit) => self.load_const(literal_value(lit), expr.span),
            ExprKind::Variable(name) => self.compile_variable_read(name, expr.span),
            ExprKind::This => self.compile_variable_read("this", expr.span),
            ExprKind::Assign(name, value_expr) => {
                if let Some(reg) = self.try_compile_increment(name, value_expr, expr.span)? {
                    return Ok(reg);
                }
                let value_reg = self.compile_expr(value_expr)?;
                self.assign_or_declare(name, value_reg, expr.span)?;
                Ok(value_reg)
            }
            ExprKind::Grouping(inner) => self.compile_expr(inner),
            ExprKind::Unary(op, rhs) => {
                let r = self.compile_expr(rhs)?;
                let dest = self.scope().alloc_scratch(expr.span)?;
                let opcode = match op {
                    UnOp::Neg => Op::Neg,
                    UnOp::Not => Op::Not,
                };
                self.scope().emit(Instr::ab(opcode, dest, Operand::Reg(r)), expr.span);
                Ok(dest)
            }
            ExprKind::Logical(op, lhs, rhs) => self.compile_logical(*op, lhs, rhs, expr.span),
            ExprKind::Binary(BinOp::NullCoalesce, lhs, rhs) => self.compile_null_coalesce(lhs, rhs, expr.span),
            ExprKind::Binary(BinOp::Add, lhs, rhs) => {
                if let Some(dest) = self.try_compile_add_const_local(lhs, rhs, expr.span)? {
                    return Ok(dest);
                }
                let l = self.compile_expr(lhs)?;
                let r = self.compile_expr(rhs)?;
                let dest = self.scope().alloc_scratch(expr.span)?;
                self.scope().emit(Instr::new(Op::Add, dest, Operand::Reg(l), Operand::Reg(r)), expr.span);
                Ok(dest)
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let l = self.compile_expr(lhs)?;
                let r = self.compile_expr(rhs)?;
                let dest = self.scope().alloc_scratch(expr.span)?;
                self.scope().emit(Instr::new(binop_opcode(*op), dest, Operand::Reg(l), Operand::Reg(r)), expr.span);
                Ok(dest)
            }
            ExprKind::Call(callee, arg_exprs) => self.compile_call(callee, arg_exprs, expr.span),
            ExprKind::Get(obj, name) => {
                let receiver = self.compile_expr(obj)?;
                let name_const = self.constants.intern(Value::new_string(name.clone()));
                let dest = self.scope().alloc_scratch(expr.span)?;
                self.scope().emit(Instr::new(Op::GetProperty, dest, Operand::Reg(receiver), Operand::Const(name_const)), expr.span);
                Ok(dest)
            }
            ExprKind::Set(obj, name, value_expr) => {
                let receiver = self.compile_expr(obj)?;
                let value = self.compile_expr(value_expr)?;
                let name_const = self.constants.intern(Value::new_string(name.clone()));
                self.scope().emit(Instr::new(Op::SetProperty, receiver, Operand::Const(name_const), Operand::Reg(value)), expr.span);
                Ok(value)
            }
            ExprKind::Index(obj, key) => {
                let receiver = self.compile_expr(obj)?;
                let key = self.compile_expr(key)?;
                let dest = self.scope().alloc_scratch(expr.span)?;
                self.scope().emit(Instr::new(Op::GetIndex, dest, Operand::Reg(receiver), Operand::Reg(key)), expr.span);
                Ok(dest)
            }
            ExprKind::IndexSet(obj, key, value_expr) => {
                let receiver = self.compile_expr(obj)?;
                let key = self.compile_expr(key)?;
                let value = self.compile_expr(value_expr)?;
                self.scope().emit(Instr::new(Op::SetIndex, receiver, Operand::Reg(key), Operand::Reg(value)), expr.span);
                Ok(value)
            }
            ExprKind::Slice(obj, start, end) => {
                // `start`/`end` land in two freshly-allocated, necessarily
                // contiguous scratch registers (the bump allocator never
                // interleaves an allocation between them), so the VM can
                // read both from a single `Operand::Reg(start)` by also
                // reading `start + 1`, matching the Call convention of
                // describing a run of registers by its first slot.
                let receiver = self.compile_expr(obj)?;
                let start_reg = match start {
                    Some(e) => self.compile_into_fresh_scratch(e, expr.span)?,
                    None => self.load_const(Value::Null, expr.span)?,
                };
                let end_reg = match end {
                    Some(e) => self.compile_into_fresh_scratch(e, expr.span)?,
                    None => self.load_const(Value::Null, expr.span)?,
                };
                debug_assert_eq!(end_reg, start_reg + 1);
                let dest = self.scope().alloc_scratch(expr.span)?;
                self.scope().emit(Instr::new(Op::GetSlice, dest, Operand::Reg(receiver), Operand::Reg(start_reg)), expr.span);
                Ok(dest)
            }
            ExprKind::ListExpr(items) => {
                let start = self.scope().scratch_top as u8;
                for item in items {
                    self.compile_into_fresh_scratch(item, expr.span)?;
                }
                let dest = self.scope().alloc_scratch(expr.span)?;
                self.scope().emit(Instr::new(Op::NewList, dest, Operand::Reg(start), Operand::Const(items.len() as u16)), expr.span);
                Ok(dest)
            }
            ExprKind::Dict(keys, values) => {
                let start = self.scope().scratch_top as u8;
                for (k, v) in keys.iter().zip(values.iter()) {
                    self.compile_into_fresh_scratch(k, expr.span)?;
                    self.compile_into_fresh_scratch(v, expr.span)?;
                }
                let dest = self.scope().alloc_scratch(expr.span)?;
                self.scope().emit(Instr::new(Op::NewDict, dest, Operand::Reg(start), Operand::Const(keys.len() as u16)), expr.span);
                Ok(dest)
            }
            ExprKind::Lambda(decl) => self.compile_function_literal(decl, expr.span),
            ExprKind::Match(scrutinee, arms) => self.compile_match(scrutinee, arms, expr.span),
        }
    }

    fn compile_variable_read(&mut self, name: &str, span: Span) -> Result<u8, Diagnostic> {
        if let Some((reg, _)) = self.scope().find_local(name) {
            return Ok(reg);
        }
        let depth = self.scopes.len() - 1;
        if let Some(up_idx) = resolve_upvalue(&mut self.scopes, depth, name) {
            let dest = self.scope().alloc_scratch(span)?;
            self.scope().emit(Instr::ab(Op::GetUpvalue, dest, Operand::Reg(up_idx)), span);
            return Ok(dest);
        }
        let name_const = self.constants.intern(Value::new_string(name));
        let dest = self.scope().alloc_scratch(span)?;
        self.scope().emit(Instr::ab(Op::LoadGlobal, dest, Operand::Const(name_const)), span);
        Ok(dest)
    }

    fn compile_logical(&mut self, op: LogicOp, lhs: &Expr, rhs: &Expr, span: Span) -> Result<u8, Diagnostic> {
        let l = self.compile_expr(lhs)?;
        let dest = self.scope().alloc_scratch(span)?;
        self.scope().emit(Instr::ab(Op::Move, dest, Operand::Reg(l)), span);
        let skip = self.scope().here();
        let guard = match op {
            LogicOp::And => Op::JumpIfFalse,
            LogicOp::Or => Op::JumpIfTrue,
        };
        self.scope().emit(Instr::ab(guard, 0, Operand::Reg(dest)), span);
        let r = self.compile_expr(rhs)?;
        self.scope().emit(Instr::ab(Op::Move, dest, Operand::Reg(r)), span);
        let end = self.scope().here();
        self.scope().patch_jump_target(skip, end);
        Ok(dest)
    }

    fn compile_null_coalesce(&mut self, lhs: &Expr, rhs: &Expr, span: Span) -> Result<u8, Diagnostic> {
        let l = self.compile_expr(lhs)?;
        let dest = self.scope().alloc_scratch(span)?;
        self.scope().emit(Instr::ab(Op::Move, dest, Operand::Reg(l)), span);
        let is_null = self.scope().alloc_scratch(span)?;
        let null_const = self.constants.intern(Value::Null);
        let null_reg = self.scope().alloc_scratch(span)?;
        self.scope().emit(Instr::ab(Op::LoadConst, null_reg, Operand::Const(null_const)), span);
        self.scope().emit(Instr::new(Op::Eq, is_null, Operand::Reg(dest), Operand::Reg(null_reg)), span);
        let skip = self.scope().here();
        self.scope().emit(Instr::ab(Op::JumpIfFalse, 0, Operand::Reg(is_null)), span);
        let r = self.compile_expr(rhs)?;
        self.scope().emit(Instr::ab(Op::Move, dest, Operand::Reg(r)), span);
        let end = self.scope().here();
        self.scope().patch_jump_target(skip, end);
        Ok(dest)
    }

    // The callee and every argument must land in mutually contiguous
    // scratch registers (callee at `r`, args at `r+1..r+1+arity`) since the
    // `CALL` instruction only carries the callee's register and an arg
    // count, not each argument's location. `compile_into_fresh_scratch`
    // forces that even when an argument is itself just a bare local read,
    // which would otherwise hand back a register far below the call's
    // working area.
    fn compile_call(&mut self, callee: &Expr, arg_exprs: &[Expr], span: Span) -> Result<u8, Diagnostic> {
        let callee_reg = self.compile_into_fresh_scratch(callee, span)?;
        for a in arg_exprs {
            self.compile_into_fresh_scratch(a, span)?;
        }
        let dest = self.scope().alloc_scratch(span)?;
        self.scope().emit(Instr::new(Op::Call, dest, Operand::Reg(callee_reg), Operand::Const(arg_exprs.len() as u16)), span);
        Ok(dest)
    }

    fn compile_into_fresh_scratch(&mut self, expr: &Expr, span: Span) -> Result<u8, Diagnostic> {
        let next = self.scope().scratch_top as u8;
        let raw = self.compile_expr(expr)?;
        if raw == next {
            Ok(raw)
        } else {
            let reg = self.scope().alloc_scratch(span)?;
            self.scope().emit(Instr::ab(Op::Move, reg, Operand::Reg(raw)), span);
            Ok(reg)
        }
    }

    fn compile_match(&mut self, scrutinee: &Expr, arms: &[MatchArm], span: Span) -> Result<u8, Diagnostic> {
        let subject = self.compile_expr(scrutinee)?;
        let dest = self.scope().alloc_scratch(span)?;
        let mut end_jumps = Vec::new();
        for arm in arms {
            self.scope().push_block();
            let (matched, next_test) = self.compile_pattern_test(&arm.pattern, subject, span)?;
            let guard_fail = if let Some(guard) = &arm.guard {
                let g = self.compile_expr(guard)?;
                let jump = self.scope().here();
                self.scope().emit(Instr::ab(Op::JumpIfFalse, 0, Operand::Reg(g)), span);
                Some(jump)
            } else {
                None
            };
            let body = self.compile_expr(&arm.body)?;
            self.scope().emit(Instr::ab(Op::Move, dest, Operand::Reg(body)), span);
            let end_jump = self.scope().here();
            self.scope().emit(Instr::a_only(Op::Jump, 0), span);
            end_jumps.push(end_jump);
            let arm_end = self.scope().here();
            if let Some(gf) = guard_fail {
                self.scope().patch_jump_target(gf, arm_end);
            }
            if let Some(nt) = next_test {
                self.scope().patch_jump_target(nt, arm_end);
            }
            let _ = matched;
            self.scope().pop_block();
        }
        // Reached only when every arm's test failed: matches
        // `eval_match`'s no-matching-arm behavior of a warning plus `Null`
        // rather than aborting.
        self.scope().emit(Instr::a_only(Op::MatchFallthrough, dest), span);
        let end = self.scope().here();
        for j in end_jumps {
            self.scope().patch_jump_target(j, end);
        }
        Ok(dest)
    }

    // Returns the register the arm body executes under (unused; patterns
    // bind directly into the current block's locals) and the jump to patch
    // to the next arm's test, if the pattern might not match.
    fn compile_pattern_test(&mut self, pattern: &Pattern, subject: u8, span: Span) -> Result<(u8, Option<usize>), Diagnostic> {
        match pattern {
            Pattern::Wildcard => Ok((subject, None)),
            Pattern::Binding(name) => {
                self.scope().declare_local(name, false)?;
                let (reg, _) = self.scope().find_local(name).unwrap();
                self.scope().emit(Instr::ab(Op::Move, reg, Operand::Reg(subject)), span);
                Ok((subject, None))
            }
            Pattern::Literal(expr) => {
                let lit = self.compile_expr(expr)?;
                let cmp = self.scope().alloc_scratch(span)?;
                self.scope().emit(Instr::new(Op::Eq, cmp, Operand::Reg(subject), Operand::Reg(lit)), span);
                let jump = self.scope().here();
                self.scope().emit(Instr::ab(Op::JumpIfFalse, 0, Operand::Reg(cmp)), span);
                Ok((subject, Some(jump)))
            }
            Pattern::Ok(inner) | Pattern::Error(inner) => {
                let want_ok = matches!(pattern, Pattern::Ok(_));
                let tag_op = if want_ok { Op::IsOk } else { Op::IsError };
                let tag = self.scope().alloc_scratch(span)?;
                self.scope().emit(Instr::ab(tag_op, tag, Operand::Reg(subject)), span);
                let jump = self.scope().here();
                self.scope().emit(Instr::ab(Op::JumpIfFalse, 0, Operand::Reg(tag)), span);
                let inner_value = self.scope().alloc_scratch(span)?;
                self.scope().emit(Instr::ab(Op::Unwrap, inner_value, Operand::Reg(subject)), span);
                let (_, nested_jump) = self.compile_pattern_test(inner, inner_value, span)?;
                Ok((subject, nested_jump.or(Some(jump))))
            }
        }
    }

    // Compiles a function body (top-level `function` declaration or lambda
    // literal) into its own `FunctionScope`, resolving captured outer
    // locals into upvalue descriptors, then emits `MAKE_CLOSURE` in the
    // enclosing scope.
    fn compile_function_literal(&mut self, decl: &Rc<FunctionDecl>, span: Span) -> Result<u8, Diagnostic> {
        let arity = decl.params.len();
        self.scopes.push(FunctionScope::new(decl.name.clone(), arity));
        for param in &decl.params {
            self.scope().declare_local(&param.name, false)?;
        }
        for stmt in decl.body.iter() {
            self.compile_stmt(stmt)?;
        }
        let null_const = self.constants.intern(Value::Null);
        let null_reg = self.scope().alloc_scratch(span)?;
        self.scope().emit(Instr::ab(Op::LoadConst, null_reg, Operand::Const(null_const)), span);
        self.scope().emit(Instr::a_only(Op::Return, null_reg), span);

        let finished = self.scopes.pop().unwrap();
        let upvalues = finished.upvalues.clone();
        let func_index = self.functions.push(FunctionInfo {
            name: finished.name.map(Rc::from),
            arity: finished.arity,
            num_registers: finished.max_register,
            code: finished.code,
            spans: finished.spans,
            upvalues,
            params: decl.params.clone(),
        });
        let dest = self.scope().alloc_scratch(span)?;
        self.scope().emit(Instr::ab(Op::MakeClosure, dest, Operand::Func(func_index as u16)), span);
        Ok(dest)
    }
}

fn resolve_upvalue(scopes: &mut [FunctionScope], scope_idx: usize, name: &str) -> Option<u8> {
    if scope_idx == 0 {
        return None;
    }
    let parent_idx = scope_idx - 1;
    if let Some((local_reg, _)) = scopes[parent_idx].find_local(name) {
        return Some(add_upvalue(&mut scopes[scope_idx], name, true, local_reg));
    }
    let forwarded = resolve_upvalue(scopes, parent_idx, name)?;
    Some(add_upvalue(&mut scopes[scope_idx], name, false, forwarded))
}

fn add_upvalue(scope: &mut FunctionScope, name: &str, is_local: bool, slot: u8) -> u8 {
    if let Some(pos) = scope.upvalues.iter().position(|u| u.name.as_ref() == name) {
        return pos as u8;
    }
    scope.upvalues.push(UpvalueDesc { is_local, slot, name: Rc::from(name) });
    (scope.upvalues.len() - 1) as u8
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Number(n) => Value::Number(*n),
        Literal::Str(s) => Value::new_string(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
    }
}

// `if`/`while` conditions that are directly a comparison get the fused
// `CmpJumpIfFalse` guard instead of plain `JumpIfFalse`; everything else
// (a bare variable, a call result, a logical combination already reduced
// to a single register by `compile_logical`) keeps the generic guard.
fn guard_op(condition: &Expr) -> Op {
    match &condition.kind {
        ExprKind::Binary(BinOp::Lt, ..)
        | ExprKind::Binary(BinOp::Le, ..)
        | ExprKind::Binary(BinOp::Gt, ..)
        | ExprKind::Binary(BinOp::Ge, ..)
        | ExprKind::Binary(BinOp::Eq, ..)
        | ExprKind::Binary(BinOp::Ne, ..) => Op::CmpJumpIfFalse,
        _ => Op::JumpIfFalse,
    }
}

fn binop_opcode(op: BinOp) -> Op {
    match op {
        BinOp::Add => Op::Add,
        BinOp::Sub => Op::Sub,
        BinOp::Mul => Op::Mul,
        BinOp::Div => Op::Div,
        BinOp::Mod => Op::Mod,
        BinOp::Pow => Op::Pow,
        BinOp::Eq => Op::Eq,
        BinOp::Ne => Op::Ne,
        BinOp::Lt => Op::Lt,
        BinOp::Le => Op::Le,
        BinOp::Gt => Op::Gt,
        BinOp::Ge => Op::Ge,
        BinOp::NullCoalesce => unreachable!("handled by compile_null_coalesce"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parser, scanner};

    fn compile_src(src: &str) -> CompiledProgram {
        let (tokens, lex_errors) = scanner::scan(src);
        assert!(lex_errors.is_empty());
        let (program, parse_errors) = parser::parse(tokens);
        assert!(parse_errors.is_empty(), "{:?}", parse_errors);
        compile(&program).expect("should compile")
    }

    #[test]
    fn test_compiles_arithmetic_to_single_function() {
        let compiled = compile_src("a = 1 + 2 * 3;");
        let entry = compiled.functions.get(compiled.entry);
        assert!(entry.code.iter().any(|i| i.op == Op::Mul));
        assert!(entry.code.iter().any(|i| i.op == Op::Add));
        assert!(entry.code.iter().any(|i| i.op == Op::StoreGlobal));
    }

    #[test]
    fn test_while_loop_emits_backward_jump() {
        let compiled = compile_src("i = 0; while (i < 3) { i = i + 1; }");
        let entry = compiled.functions.get(compiled.entry);
        assert!(entry.code.iter().any(|i| i.op == Op::JumpBack));
    }

    #[test]
    fn test_lambda_captures_upvalue() {
        let compiled = compile_src("$ mk(){ c=0; return $() => { c=c+1; return c; }; }");
        let lambda = compiled.functions.functions.iter().find(|f| f.upvalues.iter().any(|u| u.name.as_ref() == "c"));
        assert!(lambda.is_some(), "expected a nested function to capture 'c' as an upvalue");
    }

    #[test]
    fn test_rejects_import_in_bytecode_mode() {
        let (tokens, _) = scanner::scan("import { x } from \"m\";");
        let (program, _) = parser::parse(tokens);
        assert!(compile(&program).is_err());
    }

    #[test]
    fn test_local_increment_emits_inc_local() {
        let compiled = compile_src("$ f(x) { x = x + 1; return x; }");
        let f = compiled.functions.functions.iter().find(|f| f.name.as_deref() == Some("f")).unwrap();
        assert!(f.code.iter().any(|i| i.op == Op::IncLocal));
        assert!(!f.code.iter().any(|i| i.op == Op::Add));
    }

    #[test]
    fn test_const_plus_local_emits_add_const_local() {
        let compiled = compile_src("$ f(x) { return 1 + x; }");
        let f = compiled.functions.functions.iter().find(|f| f.name.as_deref() == Some("f")).unwrap();
        assert!(f.code.iter().any(|i| i.op == Op::AddConstLocal));
    }

    #[test]
    fn test_comparison_guard_emits_cmp_jump_if_false() {
        let compiled = compile_src("$ f(x) { if (x < 3) { return 1; } return 0; }");
        let f = compiled.functions.functions.iter().find(|f| f.name.as_deref() == Some("f")).unwrap();
        assert!(f.code.iter().any(|i| i.op == Op::CmpJumpIfFalse));
        assert!(!f.code.iter().any(|i| i.op == Op::JumpIfFalse));
    }
}
