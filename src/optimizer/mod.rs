// Bytecode optimization pipeline.
//
// Passes operate on one `FunctionInfo` at a time and run to a fixpoint
// (repeat the whole pass list until a round makes no further change),
// gated by `config::OptLevel` the way `config::EngineConfig::pass_enabled`
// already gates passes by name. Every pass works directly on the
// already-compiled `Instr` stream rather than re-deriving a CFG, since
// jump targets are already resolved absolute indices (`compiler.rs`'s
// `patch_jump_target` convention) and the instruction set is small enough
// that scanning for specific shapes is cheaper to get right than a full
// dataflow framework.
//
// `splice` is the one piece of index arithmetic every structural pass
// (dead-code elimination, loop transforms, inlining) shares: replace a
// contiguous run of instructions with a different-length run and fix up
// every jump target that pointed at or past the edit, in one place.

mod o1;
mod o2;
mod o3;

use crate::bytecode::{ConstantPool, FunctionInfo, FunctionTable, Instr, Op, Operand};
use crate::config::{EngineConfig, OptLevel};
use crate::token::Span;
use std::collections::HashSet;

pub trait Pass {
    fn name(&self) -> &'static str;
    fn level(&self) -> OptLevel;

    // `protected` lists registers of this function that are captured as a
    // local upvalue by some closure created elsewhere in its body -- see
    // `collect_closure_captures`. Only `o1::DeadStoreElimination` consults
    // it; every other pass ignores the parameter.
    fn run(&self, func: &mut FunctionInfo, constants: &mut ConstantPool, protected: &HashSet<u8>) -> bool;
}

fn all_passes(config: &EngineConfig) -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(o1::ConstantFolding),
        Box::new(o1::BranchSimplification),
        Box::new(o1::DeadCodeElimination),
        Box::new(o1::CopyPropagation),
        Box::new(o1::DeadStoreElimination),
        Box::new(o2::CommonSubexpressionElimination),
        Box::new(o2::LoopInvariantCodeMotion),
        Box::new(o2::StrengthReduction),
        Box::new(o2::LoopUnrolling { threshold: config.unroll_threshold }),
        Box::new(o3::TailCallToLoop),
    ]
}

// Runs every enabled pass over every function to a fixpoint, then runs
// whole-program function inlining (which needs to see the full table, not
// one function at a time) to its own fixpoint on top.
pub fn optimize(table: &mut FunctionTable, constants: &mut ConstantPool, config: &EngineConfig) {
    if config.opt_level == OptLevel::O0 {
        return;
    }
    let passes = all_passes(config);
    for index in 0..table.functions.len() {
        let protected = collect_closure_captures(table, index);
        run_to_fixpoint(&mut table.functions[index], constants, &passes, config, &protected);
    }
    while o2::inline_functions(table, config) {
        for index in 0..table.functions.len() {
            let protected = collect_closure_captures(table, index);
            run_to_fixpoint(&mut table.functions[index], constants, &passes, config, &protected);
        }
    }
}

fn run_to_fixpoint(func: &mut FunctionInfo, constants: &mut ConstantPool, passes: &[Box<dyn Pass>], config: &EngineConfig, protected: &HashSet<u8>) {
    loop {
        let mut changed = false;
        for pass in passes {
            if !config.opt_level.includes(pass.level()) || !config.pass_enabled(pass.name()) {
                continue;
            }
            if pass.run(func, constants, protected) {
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

// For every `MakeClosure` in `caller`'s own body, looks up the target
// function's `is_local` upvalue descriptors and marks the `caller`
// register slots they capture -- those registers are live even when
// nothing in `caller` itself reads them again, since the closure
// outliving this pass's view is exactly the case `dead_store_elimination`
// would otherwise get wrong.
fn collect_closure_captures(table: &FunctionTable, caller: usize) -> HashSet<u8> {
    let mut protected = HashSet::new();
    for instr in &table.functions[caller].code {
        if instr.op == Op::MakeClosure {
            if let Operand::Func(target) = instr.b {
                for upvalue in &table.functions[target as usize].upvalues {
                    if upvalue.is_local {
                        protected.insert(upvalue.slot);
                    }
                }
            }
        }
    }
    protected
}

fn is_jump(op: Op) -> bool {
    matches!(op, Op::Jump | Op::JumpBack | Op::JumpIfFalse | Op::JumpIfTrue | Op::CmpJumpIfFalse)
}

fn is_conditional_jump(op: Op) -> bool {
    matches!(op, Op::JumpIfFalse | Op::JumpIfTrue | Op::CmpJumpIfFalse)
}

// Every op that leaves a result in register `a`. Mirrors `vm::step`'s own
// opcode taxonomy; kept here rather than shared with `vm.rs` since the two
// modules classify opcodes for different reasons (execution vs rewriting).
fn writes_register(op: Op) -> bool {
    matches!(
        op,
        Op::LoadConst
            | Op::LoadLocal
            | Op::Move
            | Op::LoadGlobal
            | Op::GetUpvalue
            | Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Pow
            | Op::Neg
            | Op::AddFast
            | Op::SubFast
            | Op::MulFast
            | Op::DivFast
            | Op::Eq
            | Op::Ne
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::And
            | Op::Or
            | Op::Not
            | Op::NullCoalesce
            | Op::Call
            | Op::TailCall
            | Op::NewList
            | Op::NewDict
            | Op::MakeClosure
            | Op::GetProperty
            | Op::GetIndex
            | Op::GetSlice
            | Op::ArrayLength
            | Op::IsOk
            | Op::IsError
            | Op::Unwrap
            | Op::IncLocal
            | Op::AddConstLocal
            | Op::AddLocals
            | Op::MatchFallthrough
    )
}

// Pure in the strong sense CSE and loop-invariant hoisting need: the
// result depends only on its operands, reordering or deduplicating it
// changes nothing observable, and it can never itself raise a diagnostic.
fn is_pure(op: Op) -> bool {
    matches!(op, Op::Move | Op::Not | Op::Eq | Op::Ne | Op::And | Op::Or | Op::GetUpvalue)
}

// Arithmetic/comparison ops are deterministic given their operands but can
// raise a type error at runtime, so they are safe to fold at compile time
// (the inputs are already known) but not safe to treat as dead just
// because their result is unused -- see `is_infallible_register_write`.
fn is_foldable_binop(op: Op) -> bool {
    matches!(op, Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Pow | Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge)
}

// Register-writing ops that can never raise a diagnostic, so deleting an
// unused instance changes nothing an observer could detect -- unlike
// `GetIndex`/`GetProperty`/arithmetic, which must still run for their
// possible error even when their result is discarded, and unlike
// `MatchFallthrough`, which must still run for its warning even when its
// `Null` result is discarded.
fn is_infallible_register_write(op: Op) -> bool {
    matches!(op, Op::LoadConst | Op::Move | Op::GetUpvalue | Op::NewList | Op::NewDict | Op::Not | Op::Eq | Op::Ne | Op::And | Op::Or | Op::NullCoalesce)
}

fn jump_targets(func: &FunctionInfo) -> HashSet<usize> {
    let mut targets = HashSet::new();
    for instr in &func.code {
        if is_jump(instr.op) {
            if let Operand::Const(t) = instr.c {
                targets.insert(t as usize);
            }
        }
    }
    targets
}

fn reg_operand(op: Operand) -> Option<u8> {
    match op {
        Operand::Reg(r) => Some(r),
        _ => None,
    }
}

// Replaces `code[at..at+remove]` with `replacement`, then fixes up every
// jump target (stored as `Operand::Const` in `.c`, `compiler.rs`'s own
// convention) that pointed at or past the edit. A jump whose target was
// exactly `at` now lands on the first replacement instruction, which is
// what every caller wants: the remaining body after a deletion, or the
// first instruction of a newly-hoisted/inlined block.
pub(crate) fn splice(func: &mut FunctionInfo, at: usize, remove: usize, replacement: Vec<(Instr, Span)>) {
    let delta = replacement.len() as isize - remove as isize;
    let (instrs, spans): (Vec<Instr>, Vec<Span>) = replacement.into_iter().unzip();
    func.code.splice(at..at + remove, instrs);
    func.spans.splice(at..at + remove, spans);
    for instr in func.code.iter_mut() {
        if is_jump(instr.op) {
            if let Operand::Const(target) = instr.c {
                if target as usize >= at {
                    instr.c = Operand::Const((target as isize + delta) as u16);
                }
            }
        }
    }
}

// The shape every loop compiled by `compiler::compile_while`/
// `compile_for` has: `loop_start` is the `JumpBack` target, and the first
// conditional jump encountered after `loop_start` whose own target lands
// strictly after the `JumpBack` is the loop's exit test (a conditional
// jump that lands *before* the `JumpBack` belongs to a short-circuit `&&`/
// `||` inside the condition expression itself, not the loop exit, so it is
// skipped). `body` is the half-open range between that exit test and the
// `JumpBack`.
struct LoopShape {
    start: usize,
    jump_back: usize,
    body: std::ops::Range<usize>,
}

fn find_loops(func: &FunctionInfo) -> Vec<LoopShape> {
    let mut loops = Vec::new();
    for (jump_back, instr) in func.code.iter().enumerate() {
        if instr.op != Op::JumpBack {
            continue;
        }
        let start = match instr.c {
            Operand::Const(t) => t as usize,
            _ => continue,
        };
        if start >= jump_back {
            continue;
        }
        let exit = func.code[start..jump_back].iter().enumerate().find_map(|(offset, candidate)| {
            if !is_conditional_jump(candidate.op) {
                return None;
            }
            let target = match candidate.c {
                Operand::Const(t) => t as usize,
                _ => return None,
            };
            if target > jump_back { Some(start + offset) } else { None }
        });
        if let Some(exit_index) = exit {
            loops.push(LoopShape { start, jump_back, body: (exit_index + 1)..jump_back });
        }
    }
    loops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::UpvalueDesc;
    use std::rc::Rc;

    fn instr(op: Op, a: u8, b: Operand, c: Operand) -> (Instr, Span) {
        (Instr::new(op, a, b, c), Span::new(1, 1))
    }

    fn func_with(code: Vec<(Instr, Span)>) -> FunctionInfo {
        let (code, spans): (Vec<_>, Vec<_>) = code.into_iter().unzip();
        FunctionInfo { name: None, arity: 0, num_registers: 8, code, spans, upvalues: vec![], params: vec![] }
    }

    #[test]
    fn test_splice_remaps_targets_past_the_edit() {
        let mut func = func_with(vec![
            instr(Op::Jump, 0, Operand::Reg(0), Operand::Const(2)),
            instr(Op::Nop, 0, Operand::Reg(0), Operand::Reg(0)),
            instr(Op::Return, 0, Operand::Reg(0), Operand::Reg(0)),
        ]);
        splice(&mut func, 1, 1, vec![instr(Op::Nop, 0, Operand::Reg(0), Operand::Reg(0)), instr(Op::Nop, 0, Operand::Reg(0), Operand::Reg(0))]);
        assert_eq!(func.code.len(), 4);
        assert_eq!(func.code[0].c, Operand::Const(3));
    }

    #[test]
    fn test_find_loops_skips_logical_and_inside_condition() {
        // loop_start: a && b  =>  Move+JumpIfFalse(to just past)+rhs; then
        // the real exit test; body; JumpBack.
        let func = func_with(vec![
            instr(Op::Move, 2, Operand::Reg(0), Operand::Reg(0)),  // 0: loop_start
            instr(Op::JumpIfFalse, 0, Operand::Reg(2), Operand::Const(3)), // 1: short-circuit, targets inside
            instr(Op::Move, 2, Operand::Reg(1), Operand::Reg(0)),  // 2
            instr(Op::JumpIfFalse, 0, Operand::Reg(2), Operand::Const(6)), // 3: real exit, targets past jump_back
            instr(Op::Nop, 0, Operand::Reg(0), Operand::Reg(0)),   // 4: body
            instr(Op::JumpBack, 0, Operand::Reg(0), Operand::Const(0)), // 5
        ]);
        let loops = find_loops(&func);
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].body, 4..5);
    }

    #[test]
    fn test_collect_closure_captures_marks_local_slot() {
        let mut table = FunctionTable::new();
        let child = table.push(FunctionInfo {
            name: None,
            arity: 0,
            num_registers: 1,
            code: vec![],
            spans: vec![],
            upvalues: vec![UpvalueDesc { is_local: true, slot: 3, name: Rc::from("c") }],
            params: vec![],
        });
        let parent_code = vec![Instr::ab(Op::MakeClosure, 5, Operand::Func(child as u16))];
        let parent = table.push(FunctionInfo { name: None, arity: 0, num_registers: 8, code: parent_code, spans: vec![Span::new(1, 1)], upvalues: vec![], params: vec![] });
        let protected = collect_closure_captures(&table, parent);
        assert!(protected.contains(&3));
    }
}
