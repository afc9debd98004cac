// The native-host seam.
//
// The interpreter and VM never implement crypto/IO/networking/etc.
// themselves; they consult a `NativeRegistry` by name. A host embeds this
// crate, builds its own registry, and hands it to the evaluator/VM at
// construction; there is no process-wide mutable registry.

use crate::value::{Callable, NativeFn, Value};
use std::collections::HashMap;
use std::rc::Rc;

pub trait NativeRegistry {
    fn lookup(&self, name: &str) -> Option<Callable>;
}

// A simple in-memory registry a host can populate directly; most embedders
// will use this rather than implementing `NativeRegistry` themselves.
#[derive(Default)]
pub struct MapRegistry {
    entries: HashMap<String, Rc<NativeFn>>,
}

impl MapRegistry {
    pub fn new() -> MapRegistry {
        MapRegistry { entries: HashMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, f: impl Fn(&[Value]) -> Result<Value, String> + 'static) {
        self.entries.insert(name.into(), Rc::new(f));
    }
}

impl NativeRegistry for MapRegistry {
    fn lookup(&self, name: &str) -> Option<Callable> {
        self.entries.get(name).map(|f| Callable::Native(Rc::from(name), f.clone()))
    }
}

// A registry with nothing registered; useful for running the core's own
// test scenarios, which have no native I/O.
pub struct EmptyRegistry;

impl NativeRegistry for EmptyRegistry {
    fn lookup(&self, _name: &str) -> Option<Callable> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_registry_round_trip() {
        let mut reg = MapRegistry::new();
        reg.register("double", |args| match args {
            [Value::Number(n)] => Ok(Value::Number(n * 2.0)),
            _ => Err("expected one number".to_string()),
        });
        let found = reg.lookup("double").expect("registered");
        if let Callable::Native(_, f) = found {
            assert_eq!(f(&[Value::Number(21.0)]).unwrap().to_display_string(), "42");
        } else {
            panic!("expected native callable");
        }
    }
}
