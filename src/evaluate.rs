//! Runs a transformed logic body inside the capability sandbox and reads the
//! component options it returns.

use indexmap::IndexMap;
use std::rc::Rc;
use tracing::{debug, warn};

use crate::capabilities::{CapabilityWhitelist, LifecycleHook};
use crate::error::CompileError;
use crate::instance::{DataAccessor, InstanceData};
use crate::interpreter::{Interpreter, Limits, Scope};
use crate::transform::EvaluableBody;
use crate::value::{ObjectKind, Value};

/// Binding for the current node's data, in the sandbox and on component state.
pub const INSTANCE_DATA_KEY: &str = "data";
/// Binding for the sibling lookup, in the sandbox and on component state.
pub const DATA_ACCESSOR_KEY: &str = "getNodeData";

// ═══════════════════════════════════════════════════════════════════════════════
// COMPONENT OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct ComponentOptions {
    pub name: Option<String>,
    /// Data factory function (or a plain object used as the initial record).
    pub data: Option<Value>,
    pub setup: Option<Value>,
    pub methods: IndexMap<String, Value>,
    /// Getter functions or `{ get, set }` objects.
    pub computed: IndexMap<String, Value>,
    /// Handler functions, `{ handler, immediate }` objects, or method names.
    pub watch: IndexMap<String, Value>,
    pub hooks: IndexMap<LifecycleHook, Value>,
    /// Keys this compiler does not interpret, passed through untouched.
    pub extra: IndexMap<String, Value>,
}

impl ComponentOptions {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.data.is_none()
            && self.setup.is_none()
            && self.methods.is_empty()
            && self.computed.is_empty()
            && self.watch.is_empty()
            && self.hooks.is_empty()
            && self.extra.is_empty()
    }

    /// Reads options from the value user logic returned. Anything other than
    /// a plain object yields empty options.
    pub fn from_value(value: &Value) -> Self {
        let mut options = ComponentOptions::default();
        let Value::Object(object) = value else {
            if !value.is_nullish() {
                warn!(kind = value.type_of(), "logic returned a non-object; using empty options");
            }
            return options;
        };
        if !matches!(object.kind, ObjectKind::Plain) {
            warn!("logic returned a reactive cell; using empty options");
            return options;
        }

        for (key, entry) in object.entries() {
            if let Some(hook) = LifecycleHook::ALL.iter().find(|h| h.option_key() == key) {
                if entry.is_function() {
                    options.hooks.insert(*hook, entry);
                } else {
                    warn!(%hook, "lifecycle option is not a function and was ignored");
                }
                continue;
            }
            match key.as_str() {
                "name" => match &entry {
                    Value::String(name) => options.name = Some(name.clone()),
                    _ => warn!("component `name` is not a string and was ignored"),
                },
                "data" => match entry {
                    factory @ (Value::Function(_) | Value::Object(_)) => options.data = Some(factory),
                    _ => warn!("`data` must be a function returning an object"),
                },
                "setup" => {
                    if entry.is_function() {
                        options.setup = Some(entry);
                    } else {
                        warn!("`setup` is not a function and was ignored");
                    }
                }
                "methods" => {
                    options.methods = collect_entries(&entry, "methods", Value::is_function)
                }
                "computed" => {
                    options.computed = collect_entries(&entry, "computed", |v| {
                        v.is_function()
                            || v.as_object()
                                .is_some_and(|o| o.get_own("get").is_some_and(|g| g.is_function()))
                    })
                }
                "watch" => {
                    options.watch = collect_entries(&entry, "watch", |v| {
                        matches!(v, Value::Function(_) | Value::String(_))
                            || v.as_object()
                                .is_some_and(|o| o.get_own("handler").is_some_and(|h| h.is_function()))
                    })
                }
                _ => {
                    options.extra.insert(key, entry);
                }
            }
        }
        options
    }
}

fn collect_entries(value: &Value, option: &str, accept: impl Fn(&Value) -> bool) -> IndexMap<String, Value> {
    let mut out = IndexMap::new();
    let Value::Object(object) = value else {
        warn!(option, "option is not an object and was ignored");
        return out;
    };
    for (key, entry) in object.entries() {
        if accept(&entry) {
            out.insert(key, entry);
        } else {
            warn!(option, key = key.as_str(), "unusable option entry was ignored");
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// SANDBOX
// ═══════════════════════════════════════════════════════════════════════════════

/// Evaluator bound to one frozen whitelist.
#[derive(Debug, Clone)]
pub struct Sandbox {
    whitelist: Rc<CapabilityWhitelist>,
    limits: Limits,
}

impl Default for Sandbox {
    fn default() -> Self {
        Sandbox::new(CapabilityWhitelist::standard(), Limits::default())
    }
}

impl Sandbox {
    pub fn new(mut whitelist: CapabilityWhitelist, limits: Limits) -> Self {
        whitelist.freeze();
        Self {
            whitelist: Rc::new(whitelist),
            limits,
        }
    }

    pub fn whitelist(&self) -> &CapabilityWhitelist {
        &self.whitelist
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Root scope holding only the whitelist plus the per-call bindings.
    pub fn root_scope(&self, instance_data: &InstanceData, accessor: &DataAccessor) -> Rc<Scope> {
        let scope = Scope::root();
        for (name, value) in self.whitelist.bindings() {
            scope.declare_const(name, value.clone());
        }
        scope.declare_const(INSTANCE_DATA_KEY, Value::from_json_map(instance_data));
        scope.declare_const(DATA_ACCESSOR_KEY, accessor.to_value());
        scope
    }

    pub fn evaluate(
        &self,
        body: &EvaluableBody,
        instance_data: &InstanceData,
        accessor: &DataAccessor,
    ) -> Result<ComponentOptions, CompileError> {
        if body.program.is_empty() {
            return Ok(ComponentOptions::default());
        }
        let scope = self.root_scope(instance_data, accessor);
        let mut interp = Interpreter::new(self.limits);
        interp.set_props(Value::from_json_map(instance_data));

        let returned = interp.run_program(&body.program, &scope)?;
        interp.flush_ticks()?;

        let options = ComponentOptions::from_value(&returned);
        debug!(
            form = %body.form,
            methods = options.methods.len(),
            hooks = options.hooks.len(),
            has_setup = options.setup.is_some(),
            "evaluated node logic"
        );
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::transform;
    use crate::value::RuntimeError;
    use serde_json::json;

    fn evaluate(logic: &str) -> Result<ComponentOptions, CompileError> {
        let body = transform(logic).unwrap();
        let data = json!({ "id": "n1" }).as_object().cloned().unwrap();
        Sandbox::default().evaluate(&body, &data, &DataAccessor::empty())
    }

    #[test]
    fn test_export_default_options() {
        let options = evaluate(
            "export default { name: 'Counter', data() { return { count: 1 } }, methods: { inc() {} }, mounted() {} }",
        )
        .unwrap();
        assert_eq!(options.name.as_deref(), Some("Counter"));
        assert!(options.data.is_some());
        assert!(options.methods.contains_key("inc"));
        assert!(options.hooks.contains_key(&LifecycleHook::Mounted));
    }

    #[test]
    fn test_empty_logic_gives_empty_options() {
        assert!(evaluate("").unwrap().is_empty());
    }

    #[test]
    fn test_non_object_return_gives_empty_options() {
        assert!(evaluate("export default 42").unwrap().is_empty());
    }

    #[test]
    fn test_instance_data_is_visible() {
        let options = evaluate("export default { name: data.id }").unwrap();
        assert_eq!(options.name.as_deref(), Some("n1"));
    }

    #[test]
    fn test_host_globals_are_unreachable() {
        for logic in [
            "export default { name: globalThis.name }",
            "export default { name: process.env.HOME }",
            "export default { name: require('fs') }",
        ] {
            let err = evaluate(logic).unwrap_err();
            assert!(
                matches!(err, CompileError::LogicEvaluation { source: RuntimeError::Reference(_) }),
                "{} should not resolve",
                logic
            );
        }
    }

    #[test]
    fn test_thrown_errors_become_logic_evaluation() {
        let err = evaluate("throw new_error; export default {}").unwrap_err();
        assert!(matches!(
            err,
            CompileError::LogicEvaluation { source: RuntimeError::Reference(_) }
        ));
    }

    #[test]
    fn test_options_pass_through_unknown_keys() {
        let options = evaluate("export default { props: ['a'], emits: [] }").unwrap();
        assert!(options.extra.contains_key("props"));
        assert!(options.extra.contains_key("emits"));
    }
}
