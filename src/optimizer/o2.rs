// Mid-tier passes: common-subexpression elimination, loop-invariant code
// motion, strength reduction, a bounded loop unroller, and whole-program
// function inlining (the one transform here that needs to see the full
// `FunctionTable`, so it is not a `Pass` impl -- see `inline_functions`,
// called directly from `optimizer::optimize`).

use super::{find_loops, is_jump, is_pure, jump_targets, reg_operand, splice, writes_register, Pass};
use crate::bytecode::{ConstantPool, FunctionInfo, FunctionTable, Instr, Op, Operand};
use crate::config::{EngineConfig, OptLevel};
use crate::value::Value;
use std::collections::{HashMap, HashSet};

pub struct CommonSubexpressionElimination;

impl Pass for CommonSubexpressionElimination {
    fn name(&self) -> &'static str {
        "common_subexpression_elimination"
    }

    fn level(&self) -> OptLevel {
        OptLevel::O2
    }

    // Block-local: the cache of already-computed `(op, operands) -> reg`
    // is cleared at every jump, jump target, and call, so this never has
    // to reason about merge points. `Op`/`Operand` carry no `Hash` impl,
    // so the cache key is a small encoded tuple rather than the enums
    // themselves.
    fn run(&self, func: &mut FunctionInfo, _constants: &mut ConstantPool, _protected: &HashSet<u8>) -> bool {
        let targets = jump_targets(func);
        let mut cache: HashMap<(u8, OperandKey, OperandKey), u8> = HashMap::new();
        let mut changed = false;
        for i in 0..func.code.len() {
            if targets.contains(&i) {
                cache.clear();
            }
            let instr = func.code[i];
            if is_jump(instr.op) || instr.op == Op::Call || instr.op == Op::TailCall {
                cache.clear();
                continue;
            }
            if is_pure(instr.op) || super::is_foldable_binop(instr.op) {
                let key = (instr.op as u8, operand_key(instr.b), operand_key(instr.c));
                if let Some(&existing) = cache.get(&key) {
                    if existing != instr.a {
                        func.code[i] = Instr::ab(Op::Move, instr.a, Operand::Reg(existing));
                        changed = true;
                    }
                } else {
                    cache.insert(key, instr.a);
                }
            }
            if writes_register(instr.op) {
                let clobbered = operand_key(Operand::Reg(instr.a));
                cache.retain(|(_, b, c), dest| *dest != instr.a && *b != clobbered && *c != clobbered);
            }
        }
        changed
    }
}

type OperandKey = (u8, u16);

fn operand_key(operand: Operand) -> OperandKey {
    match operand {
        Operand::Reg(r) => (0, r as u16),
        Operand::Const(c) => (1, c),
        Operand::Func(f) => (2, f),
    }
}

pub struct LoopInvariantCodeMotion;

impl Pass for LoopInvariantCodeMotion {
    fn name(&self) -> &'static str {
        "loop_invariant_code_motion"
    }

    fn level(&self) -> OptLevel {
        OptLevel::O2
    }

    // Hoists the contiguous prefix of a loop body that is pure and whose
    // source registers are never written anywhere else in the body, out
    // to just before the loop. Only a prefix, never a mid-body
    // instruction, so there is no reordering relative to anything it
    // might alias.
    fn run(&self, func: &mut FunctionInfo, _constants: &mut ConstantPool, _protected: &HashSet<u8>) -> bool {
        let loops = find_loops(func);
        // Hoist from the innermost/latest loop first so earlier loops'
        // indices are still valid when we get to them.
        for loop_shape in loops.into_iter().rev() {
            let written: HashSet<u8> = func.code[loop_shape.body.clone()].iter().map(|i| i.a).collect();
            let mut h = 0;
            for instr in &func.code[loop_shape.body.clone()] {
                if !is_pure(instr.op) && !super::is_foldable_binop(instr.op) && instr.op != Op::LoadConst {
                    break;
                }
                let operands_safe = [instr.b, instr.c].iter().all(|op| match reg_operand(*op) {
                    Some(r) => !written.contains(&r),
                    None => true,
                });
                if !operands_safe {
                    break;
                }
                h += 1;
            }
            if h == 0 {
                continue;
            }
            let body_start = loop_shape.body.start;
            let hoisted: Vec<(Instr, crate::token::Span)> =
                func.code[body_start..body_start + h].iter().zip(func.spans[body_start..body_start + h].iter()).map(|(i, s)| (*i, *s)).collect();
            splice(func, loop_shape.start, 0, hoisted.clone());
            splice(func, body_start + h, h, vec![]);
            return true;
        }
        false
    }
}

pub struct StrengthReduction;

impl Pass for StrengthReduction {
    fn name(&self) -> &'static str {
        "strength_reduction"
    }

    fn level(&self) -> OptLevel {
        OptLevel::O2
    }

    // `x / c` (c a nonzero numeric constant) becomes `x * (1/c)`,
    // trading a division for a multiply and folding the reciprocal at
    // compile time. `x ** 2` becomes `x * x`.
    fn run(&self, func: &mut FunctionInfo, constants: &mut ConstantPool, _protected: &HashSet<u8>) -> bool {
        let mut changed = false;
        for i in 0..func.code.len() {
            let instr = func.code[i];
            if instr.op == Op::Div {
                if let Operand::Const(idx) = instr.c {
                    if let Value::Number(divisor) = constants.get(idx) {
                        if *divisor != 0.0 {
                            let reciprocal = constants.intern(Value::Number(1.0 / divisor));
                            func.code[i] = Instr::new(Op::Mul, instr.a, instr.b, Operand::Const(reciprocal));
                            changed = true;
                        }
                    }
                }
            } else if instr.op == Op::Pow {
                if let Operand::Const(idx) = instr.c {
                    if let Value::Number(exponent) = constants.get(idx) {
                        if *exponent == 2.0 {
                            func.code[i] = Instr::new(Op::Mul, instr.a, instr.b, instr.b);
                            changed = true;
                        }
                    }
                }
            }
        }
        changed
    }
}

// `Pass::run` doesn't carry the engine config, so the unroll threshold is
// baked in at construction time by `optimizer::all_passes` instead, the
// same way `config::EngineConfig::unroll_threshold` is read once by
// `compiler.rs` rather than threaded through every call.
pub struct LoopUnrolling {
    pub threshold: usize,
}

impl Pass for LoopUnrolling {
    fn name(&self) -> &'static str {
        "loop_unrolling"
    }

    fn level(&self) -> OptLevel {
        OptLevel::O2
    }

    // Duplicates the loop's condition test + body once, right before its
    // own back edge, for bodies under `unroll_threshold`. A physical
    // iteration of the resulting loop now performs up to two logical
    // iterations; the duplicated condition test still exits early if the
    // second one shouldn't run, so this is correct for any trip count,
    // not just even ones, at the cost of not saving the comparison itself.
    fn run(&self, func: &mut FunctionInfo, _constants: &mut ConstantPool, _protected: &HashSet<u8>) -> bool {
        let loops = find_loops(func);
        for loop_shape in loops.into_iter().rev() {
            let span = loop_shape.start..loop_shape.jump_back;
            if span.is_empty() || span.len() > self.threshold {
                continue;
            }
            if func.code[span.clone()].iter().any(|i| matches!(i.op, Op::Call | Op::TailCall | Op::MakeClosure)) {
                continue;
            }
            let duplicate: Vec<(Instr, crate::token::Span)> =
                func.code[span.clone()].iter().zip(func.spans[span.clone()].iter()).map(|(i, s)| (*i, *s)).collect();
            splice(func, loop_shape.jump_back, 0, duplicate);
            return true;
        }
        false
    }
}

// Whole-program function inlining: finds an immediately-invoked closure
// (`MakeClosure` into a register that is, shortly after, used as the
// callee of a `Call` with nothing else redefining that register in
// between), and if the target function is small, self-contained (no
// upvalues, no nested `MakeClosure` of its own -- inlining it would leave
// any closure it creates with upvalue slot numbers pointing at the wrong
// frame), and not recursive, splices its body directly into the caller.
pub fn inline_functions(table: &mut FunctionTable, config: &EngineConfig) -> bool {
    if !config.opt_level.includes(OptLevel::O2) || !config.pass_enabled("function_inlining") {
        return false;
    }
    let mut changed = false;
    for caller in 0..table.functions.len() {
        loop {
            let site = find_inline_site(&table.functions[caller]);
            let Some((make_closure_idx, call_idx, target)) = site else { break };
            if target == caller {
                break;
            }
            let body = match inlineable_body(&table.functions[target], config.inline_threshold) {
                Some(b) => b,
                None => break,
            };
            let headroom = table.functions[caller].num_registers as usize + body.num_registers as usize;
            if headroom >= crate::bytecode::MAX_REGISTERS {
                break;
            }
            apply_inline(&mut table.functions[caller], make_closure_idx, call_idx, &body);
            changed = true;
        }
    }
    changed
}

struct InlineBody {
    code: Vec<Instr>,
    spans: Vec<crate::token::Span>,
    num_registers: u8,
}

fn inlineable_body(info: &FunctionInfo, threshold: usize) -> Option<InlineBody> {
    if !info.upvalues.is_empty() {
        return None;
    }
    if info.code.len() > threshold {
        return None;
    }
    if info.code.last().map(|i| i.op) != Some(Op::Return) {
        return None;
    }
    if info.code.iter().any(|i| matches!(i.op, Op::MakeClosure | Op::GetUpvalue | Op::SetUpvalue)) {
        return None;
    }
    Some(InlineBody { code: info.code.clone(), spans: info.spans.clone(), num_registers: info.num_registers })
}

fn find_inline_site(func: &FunctionInfo) -> Option<(usize, usize, usize)> {
    for (k, instr) in func.code.iter().enumerate() {
        if instr.op != Op::MakeClosure {
            continue;
        }
        let dest = instr.a;
        let target = match instr.b {
            Operand::Func(f) => f as usize,
            _ => continue,
        };
        for (offset, later) in func.code[k + 1..].iter().enumerate() {
            let call_idx = k + 1 + offset;
            if let Operand::Reg(callee) = later.b {
                if later.op == Op::Call && callee == dest {
                    return Some((k, call_idx, target));
                }
            }
            if writes_register(later.op) && later.a == dest {
                break;
            }
        }
    }
    None
}

fn shift_registers(instr: Instr, reg_base: u8) -> Instr {
    let shift = |op: Operand| match op {
        Operand::Reg(r) => Operand::Reg(r + reg_base),
        other => other,
    };
    Instr::new(instr.op, instr.a.wrapping_add(reg_base), shift(instr.b), shift(instr.c))
}

// Splices `callee`'s body into `func` in place of `[make_closure_idx,
// call_idx]`. Every early `return expr;` becomes `Move call_dest, expr;
// Jump end` (the trailing, always-appended `Return` just becomes a
// trailing `Move`, needing no jump since control already falls through to
// `end`); any internal jump the callee body already had gets its target
// remapped through `local_to_expanded`, since expanding an early return
// into two instructions shifts the position of everything after it.
fn apply_inline(func: &mut FunctionInfo, make_closure_idx: usize, call_idx: usize, callee: &InlineBody) {
    let call_instr = func.code[call_idx];
    let call_span = func.spans[call_idx];
    let call_dest = call_instr.a;
    let callee_reg = match call_instr.b {
        Operand::Reg(r) => r,
        _ => return,
    };
    let arity = match call_instr.c {
        Operand::Const(n) => n as usize,
        _ => return,
    };

    let reg_base = func.num_registers;
    let addr_base = make_closure_idx + arity;
    let reg_shifted: Vec<Instr> = callee.code.iter().map(|i| shift_registers(*i, reg_base)).collect();

    let mut local_to_expanded = vec![0usize; reg_shifted.len()];
    let mut return_jump_slots: HashSet<usize> = HashSet::new();
    let mut expanded: Vec<(Instr, crate::token::Span)> = Vec::with_capacity(reg_shifted.len());
    let last = reg_shifted.len() - 1;
    for (i, instr) in reg_shifted.into_iter().enumerate() {
        let span = callee.spans[i];
        local_to_expanded[i] = expanded.len();
        if instr.op == Op::Return {
            expanded.push((Instr::ab(Op::Move, call_dest, instr.b), span));
            if i != last {
                return_jump_slots.insert(expanded.len());
                expanded.push((Instr::a_only(Op::Jump, 0), span));
            }
        } else {
            expanded.push((instr, span));
        }
    }

    for (idx, (instr, _)) in expanded.iter_mut().enumerate() {
        if return_jump_slots.contains(&idx) || !is_jump(instr.op) {
            continue;
        }
        if let Operand::Const(old_target) = instr.c {
            instr.c = Operand::Const((addr_base + local_to_expanded[old_target as usize]) as u16);
        }
    }

    let end_target = (addr_base + expanded.len()) as u16;
    for &idx in &return_jump_slots {
        expanded[idx].0.c = Operand::Const(end_target);
    }

    let mut replacement: Vec<(Instr, crate::token::Span)> = Vec::with_capacity(arity + expanded.len());
    for i in 0..arity {
        let src = callee_reg + 1 + i as u8;
        let dst = reg_base + i as u8;
        replacement.push((Instr::ab(Op::Move, dst, Operand::Reg(src)), call_span));
    }
    replacement.extend(expanded);

    let new_registers = reg_base as usize + callee.num_registers as usize;
    func.num_registers = new_registers.min(crate::bytecode::MAX_REGISTERS - 1) as u8;
    splice(func, make_closure_idx, call_idx - make_closure_idx + 1, replacement);
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
    fn test_cse_replaces_duplicate_computation_with_move() {
        let mut pool = ConstantPool::new();
        let mut func = func_with(vec![
            Instr::new(Op::Add, 2, Operand::Reg(0), Operand::Reg(1)),
            Instr::new(Op::Add, 3, Operand::Reg(0), Operand::Reg(1)),
            Instr::a_only(Op::Return, 3),
        ]);
        let changed = CommonSubexpressionElimination.run(&mut func, &mut pool, &HashSet::new());
        assert!(changed);
        assert_eq!(func.code[1].op, Op::Move);
        assert_eq!(func.code[1].b, Operand::Reg(2));
    }

    #[test]
    fn test_cse_does_not_merge_after_clobbered_operand() {
        let mut pool = ConstantPool::new();
        let mut func = func_with(vec![
            Instr::new(Op::Add, 2, Operand::Reg(0), Operand::Reg(1)),
            Instr::ab(Op::Move, 0, Operand::Reg(5)),
            Instr::new(Op::Add, 3, Operand::Reg(0), Operand::Reg(1)),
        ]);
        let changed = CommonSubexpressionElimination.run(&mut func, &mut pool, &HashSet::new());
        assert!(!changed);
        assert_eq!(func.code[2].op, Op::Add);
    }

    #[test]
    fn test_strength_reduction_turns_division_into_multiply() {
        let mut pool = ConstantPool::new();
        let divisor = pool.intern(Value::Number(4.0));
        let mut func = func_with(vec![Instr::new(Op::Div, 1, Operand::Reg(0), Operand::Const(divisor))]);
        let changed = StrengthReduction.run(&mut func, &mut pool, &HashSet::new());
        assert!(changed);
        assert_eq!(func.code[0].op, Op::Mul);
        if let Operand::Const(idx) = func.code[0].c {
            assert!(pool.get(idx).equals(&Value::Number(0.25)));
        } else {
            panic!("expected a constant reciprocal operand");
        }
    }

    #[test]
    fn test_loop_invariant_code_motion_hoists_pure_prefix() {
        let mut pool = ConstantPool::new();
        // loop_start(0): Lt r4,r2,r5; JumpIfFalse r4 -> 4 (exit, past the
        // JumpBack); Add r3,r0,r1 (invariant body instruction); JumpBack ->
        // 0; (4) Return r2.
        let mut func = func_with(vec![
            Instr::new(Op::Lt, 4, Operand::Reg(2), Operand::Reg(5)),
            Instr::new(Op::JumpIfFalse, 0, Operand::Reg(4), Operand::Const(4)),
            Instr::new(Op::Add, 3, Operand::Reg(0), Operand::Reg(1)),
            Instr::new(Op::JumpBack, 0, Operand::Reg(0), Operand::Const(0)),
            Instr::a_only(Op::Return, 2),
        ]);
        let changed = LoopInvariantCodeMotion.run(&mut func, &mut pool, &HashSet::new());
        assert!(changed);
        assert_eq!(func.code[0].op, Op::Add);
        // The loop's own condition check now starts one slot later.
        assert_eq!(func.code[1].op, Op::Lt);
        assert_eq!(func.code[2].op, Op::JumpIfFalse);
    }

    #[test]
    fn test_find_inline_site_detects_immediately_invoked_closure() {
        let func = func_with(vec![
            Instr::ab(Op::MakeClosure, 5, Operand::Func(2)),
            Instr::new(Op::Call, 6, Operand::Reg(5), Operand::Const(0)),
        ]);
        let site = find_inline_site(&func);
        assert_eq!(site, Some((0, 1, 2)));
    }

    #[test]
    fn test_apply_inline_rewrites_multiple_returns_to_shared_exit() {
        // callee: JumpIfFalse r0 -> 3; LoadConst r1,<neg one>; Return r1;
        // Return r0 (trailing).
        let neg_one = {
            let mut p = ConstantPool::new();
            p.intern(Value::Number(-1.0));
            0u16
        };
        let callee_code = vec![
            Instr::new(Op::JumpIfFalse, 0, Operand::Reg(0), Operand::Const(3)),
            Instr::ab(Op::LoadConst, 1, Operand::Const(neg_one)),
            Instr::a_only(Op::Return, 1),
            Instr::a_only(Op::Return, 0),
        ];
        let callee = InlineBody { code: callee_code.clone(), spans: vec![Span::new(1, 1); callee_code.len()], num_registers: 2 };
        let mut func = func_with(vec![
            Instr::ab(Op::MakeClosure, 5, Operand::Func(1)),
            Instr::new(Op::Call, 5, Operand::Reg(5), Operand::Const(1)),
            Instr::a_only(Op::Return, 5),
        ]);
        apply_inline(&mut func, 0, 1, &callee);
        // arg move, JumpIfFalse, LoadConst, Move+Jump(early return),
        // Move(trailing return), then the original trailing Return.
        assert!(func.code.iter().any(|i| i.op == Op::Jump));
        assert_eq!(func.code.last().unwrap().op, Op::Return);
    }
}
