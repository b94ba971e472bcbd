//! Minimal instance runtime for compiled components: lifecycle, watchers,
//! rendering and event dispatch.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

use crate::assemble::{is_reserved_key, CompiledComponent};
use crate::capabilities::{HookRegistry, LifecycleHook, WatchSource, Watcher};
use crate::interpreter::{EvalResult, Interpreter};
use crate::template::BoundHandler;
use crate::value::{Function, Object, ObjectKind, RuntimeError, Value};
use crate::vnode::{self, VNode};

pub struct ComponentInstance {
    component: CompiledComponent,
    interp: Interpreter,
    state: Value,
    registry: Rc<RefCell<HookRegistry>>,
    /// Handlers from the most recent render.
    handlers: Vec<BoundHandler>,
    unmounted: bool,
}

impl ComponentInstance {
    /// Creates the instance and runs it through `mounted`.
    pub fn mount(component: CompiledComponent) -> EvalResult<Self> {
        let mut interp = Interpreter::new(component.limits());
        interp.set_props(Value::from_json_map(&component.instance_data));

        if let Some(hook) = component.hook(LifecycleHook::BeforeCreate) {
            interp.call(hook, component.reserved_object(), Vec::new())?;
        }

        let state = component.initial_state(&mut interp)?;
        let mut instance = ComponentInstance {
            component,
            interp,
            state,
            registry: Rc::new(RefCell::new(HookRegistry::new())),
            handlers: Vec::new(),
            unmounted: false,
        };

        instance.run_setup()?;
        instance.bind_methods();
        instance.bind_computed();
        instance.call_hook(LifecycleHook::Created)?;
        instance.register_option_watchers()?;
        instance.call_hook(LifecycleHook::BeforeMount)?;
        instance.call_hook(LifecycleHook::Mounted)?;
        instance.settle()?;

        debug!(
            name = instance.component.name.as_deref().unwrap_or("anonymous"),
            watchers = instance.registry.borrow().watcher_count(),
            "mounted component"
        );
        Ok(instance)
    }

    pub fn component(&self) -> &CompiledComponent {
        &self.component
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Plain JSON snapshot of state, computed values included.
    pub fn state_json(&mut self) -> EvalResult<serde_json::Value> {
        let Value::Object(object) = &self.state else {
            return Ok(serde_json::Value::Null);
        };
        let mut map = serde_json::Map::new();
        for key in object.keys() {
            let value = self.interp.get_property(&self.state, &key)?;
            if matches!(value, Value::Undefined | Value::Function(_)) {
                continue;
            }
            map.insert(key, value.to_json());
        }
        Ok(serde_json::Value::Object(map))
    }

    pub fn get(&mut self, key: &str) -> EvalResult {
        self.interp.get_property(&self.state, key)
    }

    pub fn render(&mut self) -> EvalResult<Vec<VNode>> {
        let output = self.component.render.render(
            &mut self.interp,
            &self.state,
            &self.component.components,
        )?;
        self.handlers = output.handlers;
        Ok(output.nodes)
    }

    pub fn render_html(&mut self) -> EvalResult<String> {
        Ok(vnode::to_html(&self.render()?))
    }

    /// Runs a handler id from the last render, then settles watchers and
    /// queued ticks.
    pub fn trigger(&mut self, handler_id: usize, event: serde_json::Value) -> EvalResult<()> {
        let bound = self.handlers.get(handler_id).cloned().ok_or_else(|| {
            RuntimeError::type_error(format!("no event handler with id {}", handler_id))
        })?;
        let render = self.component.render.clone();
        render.invoke(&mut self.interp, &bound, Value::from_json(&event))?;
        self.settle()
    }

    /// Calls a method (or any function) stored on state.
    pub fn call_method(&mut self, name: &str, args: Vec<serde_json::Value>) -> EvalResult {
        let method = self.interp.get_property(&self.state, name)?;
        if !method.is_function() {
            return Err(RuntimeError::type_error(format!("{} is not a method", name)));
        }
        let args = args.iter().map(Value::from_json).collect();
        let result = self.interp.call(&method, self.state.clone(), args)?;
        self.settle()?;
        Ok(result)
    }

    pub fn unmount(&mut self) -> EvalResult<()> {
        if self.unmounted {
            return Ok(());
        }
        self.call_hook(LifecycleHook::BeforeUnmount)?;
        self.call_hook(LifecycleHook::Unmounted)?;
        self.unmounted = true;
        self.registry.borrow_mut().clear();
        self.handlers.clear();
        // Bound methods hold the state; drop them so the cycle can be freed.
        if let Value::Object(object) = &self.state {
            for key in object.keys() {
                if matches!(object.get_own(&key), Some(Value::Function(_))) {
                    object.remove(&key);
                }
            }
        }
        debug!("unmounted component");
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        !self.unmounted
    }

    fn state_object(&self) -> Option<Rc<Object>> {
        self.state.as_object().cloned()
    }

    fn run_setup(&mut self) -> EvalResult<()> {
        let Some(setup) = self.component.options.setup.clone() else {
            return Ok(());
        };
        let props = self.interp.props();
        let context = setup_context(&props);
        let previous = self.interp.set_hooks(Some(Rc::clone(&self.registry)));
        let result = self.interp.call(&setup, Value::Undefined, vec![props, context]);
        self.interp.set_hooks(previous);

        let Some(state) = self.state_object() else {
            return Ok(());
        };
        match result? {
            Value::Object(bindings) if matches!(bindings.kind, ObjectKind::Plain) => {
                for (key, value) in bindings.entries() {
                    if is_reserved_key(&key) {
                        warn!(key = key.as_str(), "setup() binding shadows a reserved key; ignored");
                        continue;
                    }
                    state.insert(key, value);
                }
            }
            Value::Undefined => {}
            Value::Function(_) => warn!("render functions returned from setup() are not supported"),
            other => warn!(kind = other.type_of(), "setup() returned a non-object; ignored"),
        }
        Ok(())
    }

    fn bind(&self, func: &Value) -> Option<Value> {
        match func {
            Value::Function(target) => Some(Value::Function(Rc::new(Function::Bound {
                target: Rc::clone(target),
                this: self.state.clone(),
            }))),
            _ => None,
        }
    }

    fn bind_methods(&mut self) {
        let Some(state) = self.state_object() else {
            return;
        };
        for (name, method) in &self.component.options.methods {
            if state.has_own(name) {
                warn!(method = name.as_str(), "method name is already defined on state; skipped");
                continue;
            }
            if let Some(bound) = self.bind(method) {
                state.insert(name.clone(), bound);
            }
        }
    }

    fn bind_computed(&mut self) {
        let Some(state) = self.state_object() else {
            return;
        };
        for (name, definition) in &self.component.options.computed {
            if state.has_own(name) {
                warn!(computed = name.as_str(), "computed name is already defined on state; skipped");
                continue;
            }
            let (getter, setter) = match definition {
                Value::Object(options) => (
                    options.get_own("get").and_then(|g| self.bind(&g)),
                    options.get_own("set").and_then(|s| self.bind(&s)),
                ),
                other => (self.bind(other), None),
            };
            let Some(getter) = getter else { continue };
            let cell = Object::new(ObjectKind::Computed { getter, setter }, IndexMap::new());
            state.insert(name.clone(), Value::Object(cell));
        }
    }

    /// The option hook runs first, then hooks registered from `setup`.
    fn call_hook(&mut self, hook: LifecycleHook) -> EvalResult<()> {
        if let Some(callback) = self.component.hook(hook).cloned() {
            self.interp.call(&callback, self.state.clone(), Vec::new())?;
        }
        let registered = self.registry.borrow().hooks_for(hook);
        for callback in registered {
            self.interp.call(&callback, Value::Undefined, Vec::new())?;
        }
        Ok(())
    }

    fn register_option_watchers(&mut self) -> EvalResult<()> {
        let watch = self.component.options.watch.clone();
        for (path, definition) in watch {
            let (handler, immediate) = match &definition {
                Value::Object(options) => (
                    options.get_own("handler").unwrap_or_default(),
                    options.get_own("immediate").is_some_and(|v| v.is_truthy()),
                ),
                other => (other.clone(), false),
            };
            let callback = match handler {
                Value::String(method) => self.interp.get_property(&self.state, &method)?,
                other => self.bind(&other).unwrap_or_default(),
            };
            if !callback.is_function() {
                warn!(watch = path.as_str(), "watch handler is not a function; skipped");
                continue;
            }

            let getter = path_getter(self.state.clone(), &path);
            let current = self.interp.call(&getter, Value::Undefined, Vec::new())?;
            let watcher = Watcher::new(WatchSource::Getter(getter), callback.clone(), current.clone());
            self.registry.borrow_mut().add_watcher(watcher);
            if immediate {
                self.interp
                    .call(&callback, self.state.clone(), vec![current, Value::Undefined])?;
            }
        }
        Ok(())
    }

    /// Re-runs changed watchers and effects once, then drains `nextTick`.
    fn settle(&mut self) -> EvalResult<()> {
        self.run_watchers()?;
        self.interp.flush_ticks()
    }

    fn run_watchers(&mut self) -> EvalResult<()> {
        let count = self.registry.borrow().watcher_count();
        for index in 0..count {
            let Some(mut watcher) = self.registry.borrow().watcher(index) else {
                continue;
            };
            if !watcher.is_active() {
                continue;
            }
            if let WatchSource::Effect(effect) = &watcher.source {
                self.interp.call(effect, Value::Undefined, Vec::new())?;
                continue;
            }
            let current = watcher.read(&mut self.interp)?;
            if let Some(previous) = watcher.observe(current.clone()) {
                let callback = watcher.callback.clone();
                self.registry.borrow_mut().replace_watcher(index, watcher);
                self.interp
                    .call(&callback, self.state.clone(), vec![current, previous])?;
            }
        }
        Ok(())
    }
}

/// Second argument to `setup(props, context)`.
fn setup_context(props: &Value) -> Value {
    let context = Object::plain();
    context.insert("attrs", props.clone());
    context.insert(
        "emit",
        Value::native("emit", |_, _, args| {
            let event = args.first().map(Value::to_js_string).unwrap_or_default();
            debug!(event = event.as_str(), "component emitted an event");
            Ok(Value::Undefined)
        }),
    );
    Value::Object(context)
}

/// Getter for a dotted state path such as `"form.name"`.
fn path_getter(state: Value, path: &str) -> Value {
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    Value::native("watchPath", move |interp, _, _| {
        let mut current = state.clone();
        for segment in &segments {
            if current.is_nullish() {
                return Ok(Value::Undefined);
            }
            current = interp.get_property(&current, segment)?;
        }
        Ok(current)
    })
}
