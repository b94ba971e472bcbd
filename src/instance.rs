//! Per-node data supplied by the document store.

use std::fmt;
use std::rc::Rc;

use crate::value::{RuntimeError, Value};

/// Keyed per-instance record. The compiler only ever reads it.
pub type InstanceData = serde_json::Map<String, serde_json::Value>;

/// Lookup from a node id to that node's [`InstanceData`].
#[derive(Clone)]
pub struct DataAccessor(Rc<dyn Fn(&str) -> Option<InstanceData>>);

impl DataAccessor {
    pub fn new<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<InstanceData> + 'static,
    {
        DataAccessor(Rc::new(lookup))
    }

    /// Accessor that knows no nodes.
    pub fn empty() -> Self {
        DataAccessor::new(|_| None)
    }

    pub fn lookup(&self, id: &str) -> Option<InstanceData> {
        (self.0)(id)
    }

    /// Sandbox function `getNodeData(id)`. Each call hands out a fresh copy,
    /// so user logic cannot write through to the store.
    pub fn to_value(&self) -> Value {
        let accessor = self.clone();
        Value::native("getNodeData", move |_, _, args| {
            let id = match args.first() {
                Some(Value::String(id)) => id.clone(),
                Some(other) if !other.is_nullish() => other.to_js_string(),
                _ => {
                    return Err(RuntimeError::type_error("getNodeData() expects a node id"));
                }
            };
            Ok(accessor
                .lookup(&id)
                .map(|data| Value::from_json_map(&data))
                .unwrap_or_default())
        })
    }
}

impl Default for DataAccessor {
    fn default() -> Self {
        DataAccessor::empty()
    }
}

impl fmt::Debug for DataAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataAccessor(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{Interpreter, Limits};
    use serde_json::json;

    #[test]
    fn test_lookup_returns_fresh_copies() {
        let accessor = DataAccessor::new(|id| match id {
            "n2" => json!({ "label": "Sibling" }).as_object().cloned(),
            _ => None,
        });
        let func = accessor.to_value();
        let mut interp = Interpreter::new(Limits::default());

        let found = interp
            .call(&func, Value::Undefined, vec![Value::string("n2")])
            .unwrap();
        assert_eq!(found.to_json(), json!({ "label": "Sibling" }));
        interp.set_property(&found, "label", Value::string("changed")).unwrap();

        let again = interp
            .call(&func, Value::Undefined, vec![Value::string("n2")])
            .unwrap();
        assert_eq!(again.to_json(), json!({ "label": "Sibling" }));

        let missing = interp
            .call(&func, Value::Undefined, vec![Value::string("nope")])
            .unwrap();
        assert!(matches!(missing, Value::Undefined));
    }
}
