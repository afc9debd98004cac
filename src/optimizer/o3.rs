// Aggressive, shape-specific rewrites gated behind O3.

use super::{splice, Pass};
use crate::bytecode::{ConstantPool, FunctionInfo, Instr, Op, Operand};
use crate::config::OptLevel;
use crate::value::Value;
use std::collections::HashSet;

pub struct TailCallToLoop;

impl Pass for TailCallToLoop {
    fn name(&self) -> &'static str {
        "tail_call_to_loop"
    }

    fn level(&self) -> OptLevel {
        OptLevel::O3
    }

    // Recognizes `LoadGlobal callee, Const(name)` where `name` is this
    // function's own name, followed somewhere later (argument expressions
    // can emit any number of instructions computing their values into
    // `callee+1..callee+1+arity`, per `compile_call`) by `Call dest,
    // Reg(callee), Const(arity)` immediately followed by `Return dest` in
    // strict tail position. Rewrites the whole span into Moves copying the
    // already-computed argument registers into this function's own
    // parameter registers (`0..arity`) plus a `JumpBack` to offset 0,
    // avoiding Rust call-stack growth for a self-recursive tail call.
    fn run(&self, func: &mut FunctionInfo, constants: &mut ConstantPool, _protected: &HashSet<u8>) -> bool {
        let own_name = match &func.name {
            Some(n) => n.clone(),
            None => return false,
        };
        let mut changed = false;
        let mut i = 0;
        while i < func.code.len() {
            let load = func.code[i];
            let is_self_call = load.op == Op::LoadGlobal
                && matches!(load.b, Operand::Const(idx) if matches!(constants.get(idx), Value::Str(s) if s.as_ref() == own_name.as_ref()));
            if !is_self_call {
                i += 1;
                continue;
            }
            let callee_reg = load.a;
            let call_idx = match func.code[i + 1..].iter().position(|instr| instr.op == Op::Call && matches!(instr.b, Operand::Reg(r) if r == callee_reg)) {
                Some(offset) => i + 1 + offset,
                None => {
                    i += 1;
                    continue;
                }
            };
            // The callee register must survive untouched from the load to
            // the call: bail if anything in between overwrites it.
            if func.code[i + 1..call_idx].iter().any(|instr| super::writes_register(instr.op) && instr.a == callee_reg) {
                i += 1;
                continue;
            }
            let call = func.code[call_idx];
            let arity = match call.c {
                Operand::Const(arity) => arity as usize,
                _ => {
                    i += 1;
                    continue;
                }
            };
            let ret = func.code.get(call_idx + 1).copied();
            let is_tail = matches!(ret, Some(r) if r.op == Op::Return && r.a == call.a);
            if !is_tail || arity != func.arity {
                i += 1;
                continue;
            }
            let args_start = callee_reg + 1;
            let call_span = func.spans[call_idx];
            let mut replacement = Vec::with_capacity(arity + 1);
            for k in 0..arity {
                replacement.push((Instr::ab(Op::Move, k as u8, Operand::Reg(args_start + k as u8)), call_span));
            }
            replacement.push((Instr::new(Op::JumpBack, 0, Operand::Reg(0), Operand::Const(0)), call_span));
            // Replace the Call+Return pair first so `i` (which precedes
            // `call_idx`) stays valid, then neutralize the now-unread
            // LoadGlobal. `LoadGlobal` is not in the dead-store whitelist
            // in general (an arbitrary global read can raise "undefined"),
            // but this one is provably safe: the function executing it is
            // itself, so the binding already exists.
            splice(func, call_idx, 2, replacement);
            let load_span = func.spans[i];
            splice(func, i, 1, vec![(Instr::a_only(Op::Nop, 0), load_span)]);
            changed = true;
            i += arity + 1;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Span;
    use std::rc::Rc;

    fn func_with(name: &str, arity: usize, code: Vec<Instr>) -> FunctionInfo {
        let spans = vec![Span::new(1, 1); code.len()];
        FunctionInfo { name: Some(Rc::from(name)), arity, num_registers: 8, code, spans, upvalues: vec![], params: vec![] }
    }

    #[test]
    fn test_tail_call_to_loop_rewrites_self_recursive_tail_call() {
        let mut pool = ConstantPool::new();
        let name_idx = pool.intern(Value::new_string("countdown"));
        // fn countdown(n): callee_reg=1 <- LoadGlobal "countdown"; arg reg
        // 2 <- Move from n (reg 0, via Sub producing reg2 elsewhere, here
        // just stand in with a direct Move); Call dest=3, Reg(1), arity=1;
        // Return 3.
        let mut func = func_with(
            "countdown",
            1,
            vec![
                Instr::ab(Op::LoadGlobal, 1, Operand::Const(name_idx)),
                Instr::ab(Op::Move, 2, Operand::Reg(0)),
                Instr::new(Op::Call, 3, Operand::Reg(1), Operand::Const(1)),
                Instr::a_only(Op::Return, 3),
            ],
        );
        let changed = TailCallToLoop.run(&mut func, &mut pool, &HashSet::new());
        assert!(changed);
        // The Move that staged the argument survives; the LoadGlobal/Call
        // pair is replaced by a Move into param register 0 and a JumpBack.
        assert!(func.code.iter().any(|i| i.op == Op::JumpBack));
        assert!(!func.code.iter().any(|i| i.op == Op::LoadGlobal));
        assert!(!func.code.iter().any(|i| i.op == Op::Call));
    }

    #[test]
    fn test_tail_call_to_loop_ignores_call_to_other_function() {
        let mut pool = ConstantPool::new();
        let name_idx = pool.intern(Value::new_string("helper"));
        let mut func = func_with(
            "countdown",
            1,
            vec![
                Instr::ab(Op::LoadGlobal, 1, Operand::Const(name_idx)),
                Instr::new(Op::Call, 3, Operand::Reg(1), Operand::Const(0)),
                Instr::a_only(Op::Return, 3),
            ],
        );
        let changed = TailCallToLoop.run(&mut func, &mut pool, &HashSet::new());
        assert!(!changed);
    }
}
