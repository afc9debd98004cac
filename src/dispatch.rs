// Function overload resolution, shared by the tree evaluator and the VM
// so both backends always agree on which overload a call dispatches to.

use crate::ast::{Param, TypeAnnot};
use crate::diagnostics::{dispatch_error, Diagnostic};
use crate::token::Span;
use crate::value::{Callable, Value};

fn params_of(c: &Callable) -> Option<Vec<Param>> {
    match c {
        Callable::Closure(c) => Some(c.decl.params.clone()),
        Callable::Compiled(c) => Some(c.params.clone()),
        Callable::Bound { method, .. } => params_of(method),
        Callable::Native(..) => None,
        Callable::Group(_) => None,
    }
}

fn describe(c: &Callable) -> String {
    match c {
        Callable::Closure(c) => format!(
            "{}({})",
            c.decl.name.as_deref().unwrap_or("$"),
            c.decl.params.iter().map(|p| p.name.clone()).collect::<Vec<_>>().join(", ")
        ),
        Callable::Compiled(c) => format!(
            "{}({})",
            c.name.as_deref().unwrap_or("$"),
            c.params.iter().map(|p| p.name.clone()).collect::<Vec<_>>().join(", ")
        ),
        Callable::Bound { method, .. } => describe(method),
        Callable::Native(name, _) => format!("{}(native)", name),
        Callable::Group(list) => format!("<group of {}>", list.borrow().len()),
    }
}

fn is_primitive(annot: &TypeAnnot) -> bool {
    matches!(annot, TypeAnnot::Number | TypeAnnot::Str | TypeAnnot::Boolean | TypeAnnot::Null)
}

fn annot_exact(annot: &TypeAnnot, arg: &Value) -> bool {
    match (annot, arg) {
        (TypeAnnot::Number, Value::Number(_)) => true,
        (TypeAnnot::Str, Value::Str(_)) => true,
        (TypeAnnot::Boolean, Value::Bool(_)) => true,
        (TypeAnnot::Null, Value::Null) => true,
        (TypeAnnot::Array(_), Value::List(_)) => true,
        (TypeAnnot::Dict(_, _), Value::Dict(_)) => true,
        (TypeAnnot::Function(..), Value::Function(_)) => true,
        (TypeAnnot::Named(name), Value::Instance(inst)) => &inst.class.name == name,
        (TypeAnnot::Named(name), Value::Class(c)) => &c.name == name,
        _ => false,
    }
}

// +100 exact, +50 compatible (Any, or Null into a non-primitive slot),
// otherwise -1000.
fn score_typed(annot: &TypeAnnot, arg: &Value) -> i64 {
    if annot_exact(annot, arg) {
        100
    } else if matches!(annot, TypeAnnot::Any) {
        50
    } else if matches!(arg, Value::Null) && !is_primitive(annot) {
        50
    } else {
        -1000
    }
}

fn score_one(param: &Param, arg: &Value) -> i64 {
    match &param.type_annot {
        None => {
            let mut score = 10;
            if matches!(arg, Value::Null) {
                score += 30;
            }
            score
        }
        Some(annot) => score_typed(annot, arg),
    }
}

fn score_params(params: &[Param], args: &[Value]) -> i64 {
    params.iter().zip(args.iter()).map(|(p, a)| score_one(p, a)).sum()
}

// Resolves a call target to the single callable that should actually run.
// For a plain (non-overloaded) callable this just arity-checks; for an
// overload group it implements the full scoring/tie-break procedure.
pub fn resolve_call(target: &Callable, args: &[Value], span: Span) -> Result<Callable, Diagnostic> {
    match target {
        Callable::Group(list) => resolve_group(&list.borrow(), args, span),
        single => {
            if let Some(params) = params_of(single) {
                if params.len() != args.len() {
                    return Err(dispatch_error(
                        format!("expected {} argument(s), got {}", params.len(), args.len()),
                        span,
                        &[describe(single)],
                    ));
                }
            }
            Ok(single.clone())
        }
    }
}

fn resolve_group(candidates: &[Callable], args: &[Value], span: Span) -> Result<Callable, Diagnostic> {
    let mut best: Option<(i64, Callable)> = None;
    let signatures: Vec<String> = candidates.iter().map(describe).collect();
    for candidate in candidates {
        let params = match params_of(candidate) {
            Some(p) => p,
            None => {
                // Native entries in a group are arity-agnostic; treat as a
                // neutral-scoring candidate only when arities aren't in play.
                best = Some((0, candidate.clone()));
                continue;
            }
        };
        if params.len() != args.len() {
            continue;
        }
        let score = score_params(&params, args);
        if score < 0 {
            continue;
        }
        // last-defined wins on ties: `>=` keeps later candidates.
        let replace = match &best {
            None => true,
            Some((best_score, _)) => score >= *best_score,
        };
        if replace {
            best = Some((score, candidate.clone()));
        }
    }
    best.map(|(_, c)| c).ok_or_else(|| {
        dispatch_error(format!("no overload matches {} argument(s)", args.len()), span, &signatures)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::FunctionDecl;
    use crate::env::Environment;
    use crate::value::Closure;
    use std::rc::Rc;

    fn closure(params: Vec<Param>) -> Callable {
        let decl = Rc::new(FunctionDecl {
            name: Some("g".to_string()),
            params,
            return_type: None,
            body: Rc::new(vec![]),
            type_params: vec![],
            span: Span::new(1, 1),
        });
        Callable::Closure(Rc::new(Closure { decl, captured: Environment::root() }))
    }

    fn param(name: &str, annot: Option<TypeAnnot>) -> Param {
        Param { name: name.to_string(), type_annot: annot }
    }

    #[test]
    fn test_arity_then_type_score_selects_best() {
        let zero_arg = closure(vec![]);
        let one_arg_untyped = closure(vec![param("x", None)]);
        let one_arg_number = closure(vec![param("x", Some(TypeAnnot::Number))]);
        let group = Callable::Group(std::rc::Rc::new(std::cell::RefCell::new(vec![
            zero_arg, one_arg_untyped, one_arg_number,
        ])));
        let resolved = resolve_call(&group, &[Value::Number(7.0)], Span::new(1, 1)).unwrap();
        match resolved {
            Callable::Closure(c) => assert_eq!(c.decl.params.len(), 1),
            _ => panic!("expected a closure"),
        }
    }

    #[test]
    fn test_no_match_is_dispatch_error() {
        let one_arg = closure(vec![param("x", None)]);
        let group = Callable::Group(std::rc::Rc::new(std::cell::RefCell::new(vec![one_arg])));
        let err = resolve_call(&group, &[], Span::new(1, 1)).unwrap_err();
        assert_eq!(err.kind, crate::diagnostics::ErrorKind::Dispatch);
    }
}
