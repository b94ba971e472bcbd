//! The capability whitelist handed to user logic, and the reactive and
//! lifecycle primitives behind it.

use indexmap::IndexMap;
use serde::Serialize;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use tracing::warn;

use crate::interpreter::{EvalResult, Interpreter};
use crate::value::{Object, ObjectKind, RuntimeError, Value};

pub const POSITION_BINDING: &str = "Position";
pub const VUE_NAMESPACE: &str = "Vue";

// ═══════════════════════════════════════════════════════════════════════════════
// LIFECYCLE AND WATCHERS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleHook {
    BeforeCreate,
    Created,
    BeforeMount,
    Mounted,
    BeforeUnmount,
    Unmounted,
}

impl LifecycleHook {
    pub const ALL: [LifecycleHook; 6] = [
        LifecycleHook::BeforeCreate,
        LifecycleHook::Created,
        LifecycleHook::BeforeMount,
        LifecycleHook::Mounted,
        LifecycleHook::BeforeUnmount,
        LifecycleHook::Unmounted,
    ];

    /// Key of the hook in an options object.
    pub fn option_key(self) -> &'static str {
        match self {
            LifecycleHook::BeforeCreate => "beforeCreate",
            LifecycleHook::Created => "created",
            LifecycleHook::BeforeMount => "beforeMount",
            LifecycleHook::Mounted => "mounted",
            LifecycleHook::BeforeUnmount => "beforeUnmount",
            LifecycleHook::Unmounted => "unmounted",
        }
    }

    /// Capability that registers the hook from inside `setup`.
    pub fn registrar(self) -> Option<&'static str> {
        match self {
            LifecycleHook::BeforeMount => Some("onBeforeMount"),
            LifecycleHook::Mounted => Some("onMounted"),
            LifecycleHook::BeforeUnmount => Some("onBeforeUnmount"),
            LifecycleHook::Unmounted => Some("onUnmounted"),
            LifecycleHook::BeforeCreate | LifecycleHook::Created => None,
        }
    }
}

impl fmt::Display for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.option_key())
    }
}

#[derive(Debug, Clone)]
pub enum WatchSource {
    /// `watch(() => expr, cb)`
    Getter(Value),
    /// `watch(someRef, cb)`
    Cell(Value),
    /// A property of the component instance, from the `watch` option.
    Path { target: Value, key: String },
    /// Any other object, compared by content.
    Value(Value),
    /// `watchEffect(fn)`: re-run on every flush.
    Effect(Value),
}

#[derive(Debug, Clone)]
pub struct Watcher {
    pub source: WatchSource,
    pub callback: Value,
    pub last: Value,
    pub last_snapshot: serde_json::Value,
    active: Rc<Cell<bool>>,
}

impl Watcher {
    pub fn new(source: WatchSource, callback: Value, last: Value) -> Self {
        let last_snapshot = last.to_json();
        Self {
            source,
            callback,
            last,
            last_snapshot,
            active: Rc::new(Cell::new(true)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Reads the current value of the watched source.
    pub fn read(&self, interp: &mut Interpreter) -> EvalResult {
        read_source(interp, &self.source)
    }

    /// Records `current` and reports whether it differs from the last read.
    pub fn observe(&mut self, current: Value) -> Option<Value> {
        let snapshot = current.to_json();
        if current.strict_equals(&self.last) && snapshot == self.last_snapshot {
            return None;
        }
        self.last_snapshot = snapshot;
        Some(std::mem::replace(&mut self.last, current))
    }

    fn stop_handle(&self) -> Value {
        let active = Rc::clone(&self.active);
        Value::native("stop", move |_, _, _| {
            active.set(false);
            Ok(Value::Undefined)
        })
    }
}

fn read_source(interp: &mut Interpreter, source: &WatchSource) -> EvalResult {
    match source {
        WatchSource::Getter(getter) => interp.call(getter, Value::Undefined, Vec::new()),
        WatchSource::Cell(cell) => interp.get_property(cell, "value"),
        WatchSource::Path { target, key } => interp.get_property(target, key),
        WatchSource::Value(value) => Ok(value.clone()),
        WatchSource::Effect(_) => Ok(Value::Undefined),
    }
}

/// Hooks and watchers registered by one component instance.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: Vec<(LifecycleHook, Value)>,
    watchers: Vec<Watcher>,
}

impl HookRegistry {
    pub fn new() -> Self {
        HookRegistry::default()
    }

    pub fn add_hook(&mut self, hook: LifecycleHook, callback: Value) {
        self.hooks.push((hook, callback));
    }

    pub fn hooks_for(&self, hook: LifecycleHook) -> Vec<Value> {
        self.hooks
            .iter()
            .filter(|(kind, _)| *kind == hook)
            .map(|(_, callback)| callback.clone())
            .collect()
    }

    pub fn add_watcher(&mut self, watcher: Watcher) {
        self.watchers.push(watcher);
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn watcher(&self, index: usize) -> Option<Watcher> {
        self.watchers.get(index).cloned()
    }

    pub fn replace_watcher(&mut self, index: usize, watcher: Watcher) {
        if let Some(slot) = self.watchers.get_mut(index) {
            *slot = watcher;
        }
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
        self.watchers.clear();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WHITELIST
// ═══════════════════════════════════════════════════════════════════════════════

/// Named bindings user logic may reach. Freezing prevents later additions.
#[derive(Debug, Clone, Default)]
pub struct CapabilityWhitelist {
    bindings: IndexMap<String, Value>,
    frozen: bool,
}

impl CapabilityWhitelist {
    pub fn new() -> Self {
        CapabilityWhitelist::default()
    }

    /// The reactive and lifecycle capabilities custom nodes are written against.
    pub fn standard() -> Self {
        let mut whitelist = CapabilityWhitelist::new();
        for (name, value) in standard_bindings() {
            whitelist.bindings.insert(name, value);
        }
        let namespace = Object::plain();
        for (name, value) in &whitelist.bindings {
            namespace.insert(name.clone(), value.clone());
        }
        namespace.insert("unref", Value::native("unref", unref));
        namespace.insert("isRef", Value::native("isRef", is_ref));
        namespace.freeze();
        whitelist
            .bindings
            .insert(VUE_NAMESPACE.to_string(), Value::Object(namespace));
        whitelist
            .bindings
            .insert(POSITION_BINDING.to_string(), position());
        whitelist.freeze();
        whitelist
    }

    pub fn add(&mut self, name: &str, value: Value) -> Result<(), String> {
        if self.frozen {
            return Err(format!(
                "Cannot add capability \"{}\" after the whitelist is frozen.",
                name
            ));
        }
        self.bindings.insert(name.to_string(), value);
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.bindings.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// Frozen enum of handle sides used by the `Handle` sub-component.
pub fn position() -> Value {
    let object = Object::plain();
    for (key, side) in [
        ("Left", "left"),
        ("Top", "top"),
        ("Right", "right"),
        ("Bottom", "bottom"),
    ] {
        object.insert(key, Value::string(side));
    }
    object.freeze();
    Value::Object(object)
}

fn standard_bindings() -> Vec<(String, Value)> {
    let mut bindings = vec![
        ("ref".to_string(), Value::native("ref", make_ref)),
        ("reactive".to_string(), Value::native("reactive", reactive)),
        ("computed".to_string(), Value::native("computed", computed)),
        ("watch".to_string(), Value::native("watch", watch)),
        ("watchEffect".to_string(), Value::native("watchEffect", watch_effect)),
        (
            "defineComponent".to_string(),
            Value::native("defineComponent", |_, _, args| {
                Ok(args.into_iter().next().unwrap_or_default())
            }),
        ),
        ("nextTick".to_string(), Value::native("nextTick", next_tick)),
        (
            "defineProps".to_string(),
            Value::native("defineProps", |interp, _, _| Ok(interp.props())),
        ),
    ];
    for hook in LifecycleHook::ALL {
        if let Some(name) = hook.registrar() {
            bindings.push((
                name.to_string(),
                Value::native(name, move |interp, _, args| register_hook(interp, hook, args)),
            ));
        }
    }
    bindings
}

pub fn new_ref(value: Value) -> Value {
    let cell = Object::new(ObjectKind::Ref, IndexMap::new());
    cell.insert("value", value);
    Value::Object(cell)
}

pub fn is_ref_value(value: &Value) -> bool {
    value.as_object().is_some_and(|obj| obj.is_ref())
}

fn make_ref(_: &mut Interpreter, _: Value, args: Vec<Value>) -> EvalResult {
    let value = args.into_iter().next().unwrap_or_default();
    if is_ref_value(&value) {
        return Ok(value);
    }
    Ok(new_ref(value))
}

fn reactive(_: &mut Interpreter, _: Value, args: Vec<Value>) -> EvalResult {
    let value = args.into_iter().next().unwrap_or_default();
    if !matches!(value, Value::Object(_) | Value::Array(_)) {
        warn!(kind = value.type_of(), "reactive() called with a non-object");
    }
    Ok(value)
}

fn computed(_: &mut Interpreter, _: Value, args: Vec<Value>) -> EvalResult {
    let (getter, setter) = match args.into_iter().next() {
        Some(getter @ Value::Function(_)) => (getter, None),
        Some(Value::Object(options)) => match options.get_own("get") {
            Some(getter @ Value::Function(_)) => (getter, options.get_own("set").filter(Value::is_function)),
            _ => return Err(RuntimeError::type_error("computed() options need a `get` function")),
        },
        _ => {
            return Err(RuntimeError::type_error(
                "computed() expects a getter function or { get, set }",
            ));
        }
    };
    Ok(Value::Object(Object::new(
        ObjectKind::Computed { getter, setter },
        IndexMap::new(),
    )))
}

fn watch(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> EvalResult {
    let mut args = args.into_iter();
    let source = args.next().unwrap_or_default();
    let callback = args.next().unwrap_or_default();
    let options = args.next().unwrap_or_default();
    if !callback.is_function() {
        return Err(RuntimeError::type_error("watch() callback must be a function"));
    }
    let source = match source {
        getter @ Value::Function(_) => WatchSource::Getter(getter),
        cell if is_ref_value(&cell) => WatchSource::Cell(cell),
        other @ (Value::Object(_) | Value::Array(_)) => WatchSource::Value(other),
        other => {
            warn!(kind = other.type_of(), "watch() source is not reactive and will never change");
            WatchSource::Value(other)
        }
    };
    let Some(hooks) = interp.hooks() else {
        warn!("watch() called outside of setup; the watcher is ignored");
        return Ok(Value::native("stop", |_, _, _| Ok(Value::Undefined)));
    };
    let current = read_source(interp, &source)?;
    let watcher = Watcher::new(source, callback.clone(), current.clone());
    let stop = watcher.stop_handle();
    hooks.borrow_mut().add_watcher(watcher);

    let immediate = match &options {
        Value::Object(obj) => obj.get_own("immediate").is_some_and(|v| v.is_truthy()),
        _ => false,
    };
    if immediate {
        interp.call(&callback, Value::Undefined, vec![current, Value::Undefined])?;
    }
    Ok(stop)
}

fn watch_effect(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> EvalResult {
    let effect = args.into_iter().next().unwrap_or_default();
    if !effect.is_function() {
        return Err(RuntimeError::type_error("watchEffect() expects a function"));
    }
    let Some(hooks) = interp.hooks() else {
        warn!("watchEffect() called outside of setup; the effect is ignored");
        return Ok(Value::native("stop", |_, _, _| Ok(Value::Undefined)));
    };
    interp.call(&effect, Value::Undefined, Vec::new())?;
    let watcher = Watcher::new(WatchSource::Effect(effect.clone()), effect, Value::Undefined);
    let stop = watcher.stop_handle();
    hooks.borrow_mut().add_watcher(watcher);
    Ok(stop)
}

fn register_hook(interp: &mut Interpreter, hook: LifecycleHook, args: Vec<Value>) -> EvalResult {
    let callback = args.into_iter().next().unwrap_or_default();
    if !callback.is_function() {
        return Err(RuntimeError::type_error(format!(
            "{} expects a function",
            hook.registrar().unwrap_or("lifecycle hook")
        )));
    }
    match interp.hooks() {
        Some(hooks) => hooks.borrow_mut().add_hook(hook, callback),
        None => warn!(%hook, "lifecycle hook registered outside of setup is ignored"),
    }
    Ok(Value::Undefined)
}

fn next_tick(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> EvalResult {
    if let Some(callback) = args.into_iter().next().filter(Value::is_function) {
        interp.queue_tick(callback);
    }
    Ok(Value::Undefined)
}

fn unref(interp: &mut Interpreter, _: Value, args: Vec<Value>) -> EvalResult {
    let value = args.into_iter().next().unwrap_or_default();
    if is_ref_value(&value) {
        return interp.get_property(&value, "value");
    }
    Ok(value)
}

fn is_ref(_: &mut Interpreter, _: Value, args: Vec<Value>) -> EvalResult {
    Ok(Value::Bool(args.first().is_some_and(is_ref_value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{Limits, Scope};
    use crate::lower::parse_program;
    use std::cell::RefCell;

    fn scope_with(whitelist: &CapabilityWhitelist) -> Rc<Scope> {
        let scope = Scope::root();
        for (name, value) in whitelist.bindings() {
            scope.declare_const(name, value.clone());
        }
        scope
    }

    #[test]
    fn test_standard_whitelist_is_frozen() {
        let mut whitelist = CapabilityWhitelist::standard();
        assert!(whitelist.is_frozen());
        for name in ["ref", "reactive", "computed", "watch", "watchEffect", "onMounted", "onUnmounted",
            "onBeforeMount", "onBeforeUnmount", "defineComponent", "nextTick", "Position", "Vue", "defineProps"]
        {
            assert!(whitelist.has(name), "missing capability {}", name);
        }
        assert!(!whitelist.has("fetch"));
        assert!(whitelist.add("fetch", Value::Undefined).is_err());
    }

    #[test]
    fn test_ref_and_computed() {
        let whitelist = CapabilityWhitelist::standard();
        let body = parse_program(
            r#"
            const count = ref(2);
            const double = computed(() => count.value * 2);
            count.value++;
            return [double.value, Vue.isRef(count), Vue.unref(count)].join(',');
            "#,
        )
        .unwrap();
        let mut interp = Interpreter::new(Limits::default());
        let out = interp.run_program(&body, &scope_with(&whitelist)).unwrap();
        assert_eq!(out.to_js_string(), "6,true,3");
    }

    #[test]
    fn test_hooks_register_on_active_registry() {
        let whitelist = CapabilityWhitelist::standard();
        let body = parse_program("onMounted(() => {}); watch(() => 1, () => {});").unwrap();
        let registry = Rc::new(RefCell::new(HookRegistry::new()));
        let mut interp = Interpreter::new(Limits::default());
        interp.set_hooks(Some(Rc::clone(&registry)));
        interp.run_program(&body, &scope_with(&whitelist)).unwrap();
        assert_eq!(registry.borrow().hooks_for(LifecycleHook::Mounted).len(), 1);
        assert_eq!(registry.borrow().watcher_count(), 1);
    }

    #[test]
    fn test_hooks_outside_setup_are_ignored() {
        let whitelist = CapabilityWhitelist::standard();
        let body = parse_program("onMounted(() => {}); return 1;").unwrap();
        let mut interp = Interpreter::new(Limits::default());
        let out = interp.run_program(&body, &scope_with(&whitelist)).unwrap();
        assert_eq!(out.to_number(), 1.0);
    }

    #[test]
    fn test_position_cannot_be_modified() {
        let whitelist = CapabilityWhitelist::standard();
        let body = parse_program("Position.Left = 'x';").unwrap();
        let mut interp = Interpreter::new(Limits::default());
        assert!(interp.run_program(&body, &scope_with(&whitelist)).is_err());
    }

    #[test]
    fn test_watcher_observe_detects_in_place_mutation() {
        let list = Value::array(vec![Value::Number(1.0)]);
        let mut watcher = Watcher::new(WatchSource::Value(list.clone()), Value::Undefined, list.clone());
        assert!(watcher.observe(list.clone()).is_none());
        if let Value::Array(items) = &list {
            items.borrow_mut().push(Value::Number(2.0));
        }
        assert!(watcher.observe(list).is_some());
    }
}
