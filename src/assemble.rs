//! Joins evaluated options, the render routine and per-instance data into a
//! component definition the runtime can instantiate.

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::capabilities::{position, LifecycleHook, POSITION_BINDING};
use crate::evaluate::{ComponentOptions, DATA_ACCESSOR_KEY, INSTANCE_DATA_KEY};
use crate::instance::{DataAccessor, InstanceData};
use crate::interpreter::{EvalResult, Interpreter, Limits};
use crate::template::RenderRoutine;
use crate::value::{Object, ObjectKind, Value};

/// Flow handle sub-component, always registered on custom nodes.
pub const HANDLE_COMPONENT: &str = "Handle";

/// State keys owned by the compiler. They win over same-named user fields.
pub const RESERVED_KEYS: [&str; 3] = [INSTANCE_DATA_KEY, DATA_ACCESSOR_KEY, POSITION_BINDING];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

#[derive(Debug, Clone)]
pub struct CompiledComponent {
    pub name: Option<String>,
    pub render: RenderRoutine,
    pub options: ComponentOptions,
    pub instance_data: InstanceData,
    pub accessor: DataAccessor,
    /// Registered sub-component names.
    pub components: Vec<String>,
    limits: Limits,
}

impl CompiledComponent {
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn hook(&self, hook: LifecycleHook) -> Option<&Value> {
        self.options.hooks.get(&hook)
    }

    /// The reserved keys as fresh values.
    pub fn reserved_bindings(&self) -> Vec<(String, Value)> {
        vec![
            (
                INSTANCE_DATA_KEY.to_string(),
                Value::from_json_map(&self.instance_data),
            ),
            (DATA_ACCESSOR_KEY.to_string(), self.accessor.to_value()),
            (POSITION_BINDING.to_string(), position()),
        ]
    }

    /// `this` for code that runs before state exists.
    pub fn reserved_object(&self) -> Value {
        let properties: IndexMap<String, Value> = self.reserved_bindings().into_iter().collect();
        Value::Object(Object::new(ObjectKind::Plain, properties))
    }

    /// Runs the data factory and overlays the reserved keys. The result is a
    /// fresh instance state object on every call. Only a function `data`
    /// option contributes fields.
    pub fn initial_state(&self, interp: &mut Interpreter) -> EvalResult {
        let user = match &self.options.data {
            Some(factory @ Value::Function(_)) => {
                let this = self.reserved_object();
                interp.call(factory, this.clone(), vec![this])?
            }
            Some(other) => {
                warn!(kind = other.type_of(), "data option is not a function; ignored");
                Value::Undefined
            }
            None => Value::Undefined,
        };

        let mut properties = IndexMap::new();
        match &user {
            Value::Object(record) if matches!(record.kind, ObjectKind::Plain) => {
                properties.extend(record.entries());
            }
            Value::Undefined => {}
            other => warn!(kind = other.type_of(), "data() did not return an object; ignored"),
        }
        for (key, value) in self.reserved_bindings() {
            if properties.contains_key(&key) {
                debug!(key = key.as_str(), "reserved key overrides a user data field");
            }
            properties.insert(key, value);
        }
        Ok(Value::Object(Object::new(ObjectKind::Instance, properties)))
    }
}

/// Builds the component definition. Never instantiates it.
pub fn assemble(
    options: ComponentOptions,
    render: RenderRoutine,
    instance_data: &InstanceData,
    accessor: &DataAccessor,
) -> CompiledComponent {
    debug!(
        name = options.name.as_deref().unwrap_or("anonymous"),
        has_data = options.data.is_some(),
        methods = options.methods.len(),
        "assembled component"
    );
    CompiledComponent {
        name: options.name.clone(),
        render,
        options,
        instance_data: instance_data.clone(),
        accessor: accessor.clone(),
        components: vec![HANDLE_COMPONENT.to_string()],
        limits: Limits::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::Sandbox;
    use crate::template::{HtmlTemplateCompiler, TemplateCompiler};
    use crate::transform::transform;
    use serde_json::json;

    fn component(logic: &str, data: serde_json::Value) -> CompiledComponent {
        let data = data.as_object().cloned().unwrap();
        let accessor = DataAccessor::empty();
        let options = Sandbox::default()
            .evaluate(&transform(logic).unwrap(), &data, &accessor)
            .unwrap();
        let render = HtmlTemplateCompiler.compile("<div></div>").unwrap();
        assemble(options, render, &data, &accessor)
    }

    #[test]
    fn test_data_factory_merges_with_instance_data() {
        let component = component(
            "export default { data() { return { count: 1 } } }",
            json!({ "id": "n1" }),
        );
        let mut interp = Interpreter::new(Limits::default());
        let state = component.initial_state(&mut interp).unwrap().to_json();
        assert_eq!(state["count"], json!(1));
        assert_eq!(state["data"], json!({ "id": "n1" }));
        assert_eq!(state["Position"]["Left"], json!("left"));
    }

    #[test]
    fn test_reserved_keys_override_user_fields() {
        let component = component(
            "export default { data() { return { data: 'mine', Position: 1, other: true } } }",
            json!({ "id": "n1" }),
        );
        let mut interp = Interpreter::new(Limits::default());
        let state = component.initial_state(&mut interp).unwrap().to_json();
        assert_eq!(state["data"], json!({ "id": "n1" }));
        assert_eq!(state["Position"]["Right"], json!("right"));
        assert_eq!(state["other"], json!(true));
    }

    #[test]
    fn test_factory_this_sees_reserved_keys() {
        let component = component(
            "export default { data() { return { label: this.data.id + '!' } } }",
            json!({ "id": "n7" }),
        );
        let mut interp = Interpreter::new(Limits::default());
        let state = component.initial_state(&mut interp).unwrap().to_json();
        assert_eq!(state["label"], json!("n7!"));
    }

    #[test]
    fn test_empty_logic_still_assembles() {
        let component = component("", json!({ "id": "n1" }));
        assert!(component.options.is_empty());
        assert_eq!(component.components, vec![HANDLE_COMPONENT.to_string()]);
        let mut interp = Interpreter::new(Limits::default());
        let state = component.initial_state(&mut interp).unwrap().to_json();
        assert_eq!(state["data"], json!({ "id": "n1" }));
    }

    #[test]
    fn test_non_function_data_option_is_ignored() {
        let component = component(
            "export default { data: { count: 1 } }",
            json!({ "id": "n1" }),
        );
        let mut interp = Interpreter::new(Limits::default());
        let state = component.initial_state(&mut interp).unwrap().to_json();
        assert!(state.get("count").is_none());
        assert_eq!(state["data"], json!({ "id": "n1" }));
    }

    #[test]
    fn test_each_state_is_fresh() {
        let component = component(
            "export default { data() { return { items: [] } } }",
            json!({}),
        );
        let mut interp = Interpreter::new(Limits::default());
        let first = component.initial_state(&mut interp).unwrap();
        let second = component.initial_state(&mut interp).unwrap();
        let items = interp.get_property(&first, "items").unwrap();
        let push = interp.get_property(&items, "push").unwrap();
        interp.call(&push, items, vec![Value::Number(1.0)]).unwrap();
        assert_eq!(second.to_json()["items"], json!([]));
    }
}
