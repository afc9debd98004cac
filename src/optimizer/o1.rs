// Cheap, always-safe cleanups: constant folding, branch simplification,
// unreachable-code removal, copy propagation, dead-store elimination.

use super::{is_foldable_binop, is_infallible_register_write, is_jump, reg_operand, splice, writes_register, Pass};
use crate::bytecode::{ConstantPool, FunctionInfo, Instr, Op, Operand};
use crate::config::OptLevel;
use crate::value::Value;
use std::collections::{HashMap, HashSet};

pub struct ConstantFolding;

impl Pass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant_folding"
    }

    fn level(&self) -> OptLevel {
        OptLevel::O1
    }

    // Forward scan tracking which registers currently hold a known
    // constant. The map is cleared at any jump or jump target (a register
    // can hold different values depending on which path reached this
    // point) and at any `Call` (a callee can, in principle, observe and
    // mutate shared state the next instruction depends on indirectly
    // through an alias -- conservative, but this VM has no register
    // aliasing analysis to rule that out).
    fn run(&self, func: &mut FunctionInfo, constants: &mut ConstantPool, _protected: &HashSet<u8>) -> bool {
        let targets = super::jump_targets(func);
        let mut known: HashMap<u8, Value> = HashMap::new();
        let mut changed = false;
        for i in 0..func.code.len() {
            if targets.contains(&i) {
                known.clear();
            }
            let instr = func.code[i];
            if is_jump(instr.op) || instr.op == Op::Call || instr.op == Op::TailCall {
                known.clear();
                continue;
            }
            if instr.op == Op::LoadConst {
                if let Operand::Const(idx) = instr.b {
                    known.insert(instr.a, constants.get(idx).clone());
                }
                continue;
            }
            if is_foldable_binop(instr.op) {
                let left = operand_value(&known, instr.b);
                let right = operand_value(&known, instr.c);
                if let (Some(l), Some(r)) = (left, right) {
                    if let Some(folded) = fold(instr.op, &l, &r) {
                        let idx = constants.intern(folded.clone());
                        func.code[i] = Instr::ab(Op::LoadConst, instr.a, Operand::Const(idx));
                        known.insert(instr.a, folded);
                        changed = true;
                        continue;
                    }
                }
            }
            if writes_register(instr.op) {
                known.remove(&instr.a);
            }
        }
        changed
    }
}

fn operand_value(known: &HashMap<u8, Value>, operand: Operand) -> Option<Value> {
    match operand {
        Operand::Reg(r) => known.get(&r).cloned(),
        _ => None,
    }
}

fn fold(op: Op, left: &Value, right: &Value) -> Option<Value> {
    match op {
        Op::Add => left.add(right).ok(),
        Op::Sub => left.sub(right).ok(),
        Op::Mul => left.mul(right).ok(),
        Op::Div => left.div(right).ok(),
        Op::Mod => left.modulo(right).ok(),
        Op::Pow => left.pow(right).ok(),
        Op::Eq => Some(Value::Bool(left.equals(right))),
        Op::Ne => Some(Value::Bool(!left.equals(right))),
        Op::Lt | Op::Le | Op::Gt | Op::Ge => left.compare(right).ok().map(|ord| {
            Value::Bool(match op {
                Op::Lt => ord.is_lt(),
                Op::Le => ord.is_le(),
                Op::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            })
        }),
        _ => None,
    }
}

pub struct BranchSimplification;

impl Pass for BranchSimplification {
    fn name(&self) -> &'static str {
        "branch_simplification"
    }

    fn level(&self) -> OptLevel {
        OptLevel::O1
    }

    fn run(&self, func: &mut FunctionInfo, _constants: &mut ConstantPool, _protected: &HashSet<u8>) -> bool {
        let mut changed = false;
        // Jump threading: if A's target is itself an unconditional Jump,
        // retarget A directly to that jump's own target. Bounded hop count
        // guards against a (should-never-happen) cycle of empty jumps.
        for i in 0..func.code.len() {
            if !is_jump(func.code[i].op) {
                continue;
            }
            let mut target = match func.code[i].c {
                Operand::Const(t) => t as usize,
                _ => continue,
            };
            let mut hops = 0;
            while hops < func.code.len() {
                match func.code.get(target) {
                    Some(next) if next.op == Op::Jump => {
                        let next_target = match next.c {
                            Operand::Const(t) => t as usize,
                            _ => break,
                        };
                        if next_target == target {
                            break;
                        }
                        target = next_target;
                        hops += 1;
                    }
                    _ => break,
                }
            }
            if Operand::Const(target as u16) != func.code[i].c {
                func.code[i].c = Operand::Const(target as u16);
                changed = true;
            }
        }
        // Fall-through elision: an unconditional Jump to the very next
        // instruction does nothing.
        for i in 0..func.code.len() {
            if func.code[i].op == Op::Jump {
                if let Operand::Const(t) = func.code[i].c {
                    if t as usize == i + 1 {
                        func.code[i] = Instr::a_only(Op::Nop, 0);
                        changed = true;
                    }
                }
            }
        }
        changed
    }
}

pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn level(&self) -> OptLevel {
        OptLevel::O1
    }

    // Removes a maximal run of instructions that follows an unconditional
    // terminator (`Jump`/`JumpBack`/`Return`/`Halt`) and contains no jump
    // target, since nothing can ever reach it.
    fn run(&self, func: &mut FunctionInfo, _constants: &mut ConstantPool, _protected: &HashSet<u8>) -> bool {
        let targets = super::jump_targets(func);
        let mut i = 0;
        let mut changed = false;
        while i < func.code.len() {
            let op = func.code[i].op;
            let terminates = matches!(op, Op::Jump | Op::JumpBack | Op::Return | Op::Halt);
            if !terminates {
                i += 1;
                continue;
            }
            let start = i + 1;
            let mut end = start;
            while end < func.code.len() && !targets.contains(&end) {
                end += 1;
            }
            if end > start {
                splice(func, start, end - start, vec![]);
                changed = true;
            }
            i = start;
        }
        changed
    }
}

pub struct CopyPropagation;

impl Pass for CopyPropagation {
    fn name(&self) -> &'static str {
        "copy_propagation"
    }

    fn level(&self) -> OptLevel {
        OptLevel::O1
    }

    // Forward scan: once `Move dst, src` executes, rewrite later reads of
    // `dst` to read `src` directly, until either register is redefined or
    // control flow makes the relationship unreliable.
    fn run(&self, func: &mut FunctionInfo, _constants: &mut ConstantPool, _protected: &HashSet<u8>) -> bool {
        let targets = super::jump_targets(func);
        let mut alias: HashMap<u8, u8> = HashMap::new();
        let mut changed = false;
        for i in 0..func.code.len() {
            if targets.contains(&i) {
                alias.clear();
            }
            let mut instr = func.code[i];
            if let Some(src) = reg_operand(instr.b) {
                if let Some(&root) = alias.get(&src) {
                    instr.b = Operand::Reg(root);
                    changed = true;
                }
            }
            if let Some(src) = reg_operand(instr.c) {
                if let Some(&root) = alias.get(&src) {
                    instr.c = Operand::Reg(root);
                    changed = true;
                }
            }
            func.code[i] = instr;
            if is_jump(instr.op) || instr.op == Op::Call || instr.op == Op::TailCall {
                alias.clear();
                continue;
            }
            if writes_register(instr.op) {
                alias.retain(|_, v| *v != instr.a);
                alias.remove(&instr.a);
                if instr.op == Op::Move {
                    if let Operand::Reg(src) = instr.b {
                        let root = *alias.get(&src).unwrap_or(&src);
                        if root != instr.a {
                            alias.insert(instr.a, root);
                        }
                    }
                }
            }
        }
        changed
    }
}

pub struct DeadStoreElimination;

impl Pass for DeadStoreElimination {
    fn name(&self) -> &'static str {
        "dead_store_elimination"
    }

    fn level(&self) -> OptLevel {
        OptLevel::O1
    }

    // A register-writing instruction is removable only if it can never
    // raise a diagnostic (`is_infallible_register_write`) and its
    // destination is read by nothing: not another instruction's operand,
    // and not a closure created elsewhere in this body that captures it
    // (`protected`).
    fn run(&self, func: &mut FunctionInfo, _constants: &mut ConstantPool, protected: &HashSet<u8>) -> bool {
        let mut used: HashSet<u8> = protected.clone();
        for instr in &func.code {
            if let Some(r) = reg_operand(instr.b) {
                used.insert(r);
            }
            if let Some(r) = reg_operand(instr.c) {
                used.insert(r);
            }
            // Ops that read their own `a` register rather than only write
            // it: everything that is not in `writes_register`'s list, plus
            // the read-modify-write superinstructions.
            if !writes_register(instr.op) || matches!(instr.op, Op::IncLocal) {
                used.insert(instr.a);
            }
        }
        let mut i = 0;
        let mut changed = false;
        while i < func.code.len() {
            let instr = func.code[i];
            if is_infallible_register_write(instr.op) && !used.contains(&instr.a) {
                splice(func, i, 1, vec![]);
                changed = true;
                continue;
            }
            i += 1;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Span;

    fn func_with(code: Vec<Instr>) -> FunctionInfo {
        let spans = vec![Span::new(1, 1); code.len()];
        FunctionInfo { name: None, arity: 0, num_registers: 8, code, spans, upvalues: vec![], params: vec![] }
    }

    #[test]
    fn test_constant_folding_collapses_arithmetic() {
        let mut pool = ConstantPool::new();
        let two = pool.intern(Value::Number(2.0));
        let three = pool.intern(Value::Number(3.0));
        let mut func = func_with(vec![
            Instr::ab(Op::LoadConst, 0, Operand::Const(two)),
            Instr::ab(Op::LoadConst, 1, Operand::Const(three)),
            Instr::new(Op::Add, 2, Operand::Reg(0), Operand::Reg(1)),
            Instr::a_only(Op::Return, 2),
        ]);
        let changed = ConstantFolding.run(&mut func, &mut pool, &HashSet::new());
        assert!(changed);
        assert_eq!(func.code[2].op, Op::LoadConst);
        if let Operand::Const(idx) = func.code[2].b {
            assert!(pool.get(idx).equals(&Value::Number(5.0)));
        } else {
            panic!("expected a folded constant operand");
        }
    }

    #[test]
    fn test_dead_code_elimination_drops_unreachable_tail() {
        let mut pool = ConstantPool::new();
        let mut func = func_with(vec![
            Instr::a_only(Op::Return, 0),
            Instr::a_only(Op::Nop, 0),
            Instr::a_only(Op::Nop, 0),
        ]);
        let changed = DeadCodeElimination.run(&mut func, &mut pool, &HashSet::new());
        assert!(changed);
        assert_eq!(func.code.len(), 1);
    }

    #[test]
    fn test_dead_store_elimination_keeps_protected_register() {
        let mut pool = ConstantPool::new();
        let idx = pool.intern(Value::Number(1.0));
        let mut func = func_with(vec![Instr::ab(Op::LoadConst, 3, Operand::Const(idx)), Instr::a_only(Op::Return, 0)]);
        let mut protected = HashSet::new();
        protected.insert(3u8);
        let changed = DeadStoreElimination.run(&mut func, &mut pool, &protected);
        assert!(!changed);
        assert_eq!(func.code.len(), 2);
    }

    #[test]
    fn test_dead_store_elimination_drops_unused_load() {
        let mut pool = ConstantPool::new();
        let idx = pool.intern(Value::Number(1.0));
        let mut func = func_with(vec![Instr::ab(Op::LoadConst, 3, Operand::Const(idx)), Instr::a_only(Op::Return, 0)]);
        let changed = DeadStoreElimination.run(&mut func, &mut pool, &HashSet::new());
        assert!(changed);
        assert_eq!(func.code.len(), 1);
    }
}
