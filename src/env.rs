// Lexically scoped environment.
//
// An `Rc`-chained, `RefCell`-scoped scope table, generalized from a plain
// name->value map into the function-group-aware, `@immut`-aware binding
// table the language needs.

use crate::ast::Span;
use crate::diagnostics::{assign_error, resolve_error, Diagnostic};
use crate::value::{Callable, Value};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

struct Binding {
    value: Value,
    immutable: bool,
}

pub struct Environment {
    scope: RefCell<HashMap<String, Binding>>,
    parent: Option<Env>,
    exports: RefCell<HashSet<String>>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Environment").finish()
    }
}

pub type Env = Rc<Environment>;

impl Environment {
    pub fn root() -> Env {
        Rc::new(Environment {
            scope: RefCell::new(HashMap::new()),
            parent: None,
            exports: RefCell::new(HashSet::new()),
        })
    }

    pub fn child(parent: &Env) -> Env {
        Rc::new(Environment {
            scope: RefCell::new(HashMap::new()),
            parent: Some(parent.clone()),
            exports: RefCell::new(HashSet::new()),
        })
    }

    // Installs `value` in the current scope. If `name` already holds a
    // function and `value` is also a function, the two merge into (or
    // extend) a function group instead of shadowing.
    pub fn define(&self, name: &str, value: Value, immutable: bool) {
        let merged = {
            let scope = self.scope.borrow();
            match (scope.get(name), &value) {
                (Some(Binding { value: Value::Function(existing), .. }), Value::Function(incoming)) => {
                    Some(merge_into_group(existing, incoming.clone()))
                }
                _ => None,
            }
        };
        let final_value = merged.unwrap_or(value);
        self.scope.borrow_mut().insert(name.to_string(), Binding { value: final_value, immutable });
    }

    pub fn get(&self, name: &str, span: Span) -> Result<Value, Diagnostic> {
        if let Some(binding) = self.scope.borrow().get(name) {
            return Ok(binding.value.clone());
        }
        if let Some(parent) = &self.parent {
            return parent.get(name, span);
        }
        Err(resolve_error(format!("undefined name '{}'", name), span))
    }

    // Assigns to the innermost matching binding.
    pub fn assign(&self, name: &str, value: Value, span: Span) -> Result<(), Diagnostic> {
        let mut scope = self.scope.borrow_mut();
        if let Some(binding) = scope.get_mut(name) {
            if binding.immutable {
                return Err(assign_error(format!("cannot assign to immutable binding '{}'", name), span));
            }
            binding.value = value;
            return Ok(());
        }
        drop(scope);
        if let Some(parent) = &self.parent {
            return parent.assign(name, value, span);
        }
        Err(resolve_error(format!("undefined name '{}'", name), span))
    }

    pub fn ancestor(self: &Env, depth: usize) -> Option<Env> {
        let mut current = self.clone();
        for _ in 0..depth {
            current = current.parent.clone()?;
        }
        Some(current)
    }

    pub fn export(&self, name: &str) {
        self.exports.borrow_mut().insert(name.to_string());
    }

    pub fn exported_names(&self) -> Vec<String> {
        self.exports.borrow().iter().cloned().collect()
    }

    pub fn is_defined_locally(&self, name: &str) -> bool {
        self.scope.borrow().contains_key(name)
    }
}

fn merge_into_group(existing: &Callable, incoming: Callable) -> Value {
    Value::Function(crate::value::merge_callables(existing, incoming))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Span;

    fn span() -> Span {
        Span::new(1, 1)
    }

    #[test]
    fn test_parent_chain_lookup() {
        let root = Environment::root();
        root.define("x", Value::Number(1.0), false);
        let child = Environment::child(&root);
        assert_eq!(child.get("x", span()).unwrap().to_display_string(), "1");
    }

    #[test]
    fn test_immutable_rebind_fails() {
        let root = Environment::root();
        root.define("PI", Value::Number(3.0), true);
        let err = root.assign("PI", Value::Number(4.0), span()).unwrap_err();
        assert_eq!(err.kind, crate::diagnostics::ErrorKind::Assign);
    }

    #[test]
    fn test_unbound_name_fails() {
        let root = Environment::root();
        assert!(root.get("nope", span()).is_err());
    }

    #[test]
    fn test_assignment_targets_innermost_binding() {
        let root = Environment::root();
        root.define("x", Value::Number(1.0), false);
        let child = Environment::child(&root);
        child.define("x", Value::Number(2.0), false);
        child.assign("x", Value::Number(3.0), span()).unwrap();
        assert_eq!(root.get("x", span()).unwrap().to_display_string(), "1");
        assert_eq!(child.get("x", span()).unwrap().to_display_string(), "3");
    }
}
