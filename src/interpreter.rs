//! Tree-walking interpreter for node logic.
//!
//! The interpreter has no ambient globals: every identifier resolves through
//! the scope chain the caller builds, so user logic can only reach what the
//! sandbox explicitly binds.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::warn;

use crate::ast::{
    ArrayItem, AssignOp, BinaryOp, DeclKind, Expr, FunctionDef, Literal, LogicalOp, MemberProp,
    Pattern, PropKey, PropertyDef, Stmt, Target, UnaryOp, UpdateOp,
};
use crate::builtins;
use crate::capabilities::HookRegistry;
use crate::value::{number_to_string, Function, Object, ObjectKind, RuntimeError, Value};

pub type EvalResult<T = Value> = Result<T, RuntimeError>;

/// Upper bound on array growth through `length` or index writes.
const MAX_ARRAY_LENGTH: usize = 1 << 24;
const MAX_TICK_ROUNDS: usize = 100;
/// Native stack a single run may use below its entry frame.
const STACK_BUDGET: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_call_depth: usize,
    /// Statements one run may execute; `None` disables step counting.
    pub max_steps: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            max_steps: Some(1_000_000),
        }
    }
}

struct Binding {
    value: Value,
    mutable: bool,
}

pub struct Scope {
    vars: RefCell<HashMap<String, Binding>>,
    parent: Option<Rc<Scope>>,
    /// Identifiers not bound in `vars` fall back to this object's properties.
    fallback: Option<Value>,
    this: Option<Value>,
    function: bool,
}

impl Scope {
    fn build(
        parent: Option<Rc<Scope>>,
        fallback: Option<Value>,
        this: Option<Value>,
        function: bool,
    ) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(HashMap::new()),
            parent,
            fallback,
            this,
            function,
        })
    }

    pub fn root() -> Rc<Self> {
        Self::build(None, None, Some(Value::Undefined), true)
    }

    pub fn child(parent: &Rc<Scope>) -> Rc<Self> {
        Self::build(Some(Rc::clone(parent)), None, None, false)
    }

    /// Arrow functions pass `None` and see the enclosing `this`.
    pub fn function(parent: &Rc<Scope>, this: Option<Value>) -> Rc<Self> {
        Self::build(Some(Rc::clone(parent)), None, this, true)
    }

    /// Scope whose free identifiers read and write `object`'s properties.
    /// Used for template expressions evaluated against component state.
    pub fn with_fallback(parent: &Rc<Scope>, object: Value, this: Option<Value>) -> Rc<Self> {
        Self::build(Some(Rc::clone(parent)), Some(object), this, false)
    }

    pub fn declare(&self, name: &str, value: Value, mutable: bool) {
        self.vars
            .borrow_mut()
            .insert(name.to_string(), Binding { value, mutable });
    }

    pub fn declare_const(&self, name: &str, value: Value) {
        self.declare(name, value, false);
    }

    fn declare_var(self: &Rc<Self>, name: &str, value: Value) {
        let mut target = Rc::clone(self);
        while !target.function {
            let parent = match &target.parent {
                Some(parent) => Rc::clone(parent),
                None => break,
            };
            target = parent;
        }
        target.declare(name, value, true);
    }

    pub fn this_value(&self) -> Value {
        if let Some(this) = &self.this {
            return this.clone();
        }
        match &self.parent {
            Some(parent) => parent.this_value(),
            None => Value::Undefined,
        }
    }
}

enum Completion {
    Normal,
    Return(Value),
    Break,
    Continue,
}

/// Resolved assignment target; the object and key are evaluated once.
enum Place {
    Identifier(String),
    Member(Value, String),
}

pub struct Interpreter {
    limits: Limits,
    depth: usize,
    /// Steps taken by the current run; reset when a run starts.
    steps: u64,
    /// Re-entrant `run_program`/`call`/`eval`/`exec` frames; 0 between runs.
    nesting: usize,
    stack_base: usize,
    hooks: Option<Rc<RefCell<HookRegistry>>>,
    ticks: Vec<Value>,
    props: Value,
}

impl Interpreter {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            depth: 0,
            steps: 0,
            nesting: 0,
            stack_base: 0,
            hooks: None,
            ticks: Vec::new(),
            props: Value::Undefined,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Installs the registry lifecycle capabilities write to, returning the
    /// previously active one.
    pub fn set_hooks(
        &mut self,
        hooks: Option<Rc<RefCell<HookRegistry>>>,
    ) -> Option<Rc<RefCell<HookRegistry>>> {
        std::mem::replace(&mut self.hooks, hooks)
    }

    pub fn hooks(&self) -> Option<Rc<RefCell<HookRegistry>>> {
        self.hooks.clone()
    }

    pub fn set_props(&mut self, props: Value) {
        self.props = props;
    }

    pub fn props(&self) -> Value {
        self.props.clone()
    }

    pub fn queue_tick(&mut self, callback: Value) {
        self.ticks.push(callback);
    }

    /// Runs queued `nextTick` callbacks, including ones queued while flushing.
    pub fn flush_ticks(&mut self) -> EvalResult<()> {
        let mut rounds = 0;
        while !self.ticks.is_empty() {
            if rounds == MAX_TICK_ROUNDS {
                self.ticks.clear();
                return Err(RuntimeError::type_error(
                    "nextTick callbacks kept re-queueing themselves",
                ));
            }
            for callback in std::mem::take(&mut self.ticks) {
                self.call(&callback, Value::Undefined, Vec::new())?;
            }
            rounds += 1;
        }
        Ok(())
    }

    /// Marks entry into a run or a nested frame. The outermost entry starts
    /// a fresh step budget and records where the native stack began.
    fn enter(&mut self) -> EvalResult<()> {
        let marker = 0u8;
        let here = std::ptr::addr_of!(marker) as usize;
        if self.nesting == 0 {
            self.stack_base = here;
            self.steps = 0;
        } else if self.stack_base.abs_diff(here) > STACK_BUDGET {
            return Err(RuntimeError::StackExhausted);
        }
        self.nesting += 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.nesting -= 1;
    }

    fn step(&mut self) -> EvalResult<()> {
        self.steps += 1;
        match self.limits.max_steps {
            Some(max) if self.steps > max => Err(RuntimeError::StepBudget(max)),
            _ => Ok(()),
        }
    }

    /// Runs a function body; yields the `return` value or `undefined`.
    pub fn run_program(&mut self, body: &[Stmt], scope: &Rc<Scope>) -> EvalResult {
        self.enter()?;
        let completion = self.exec_block(body, scope);
        self.leave();
        match completion? {
            Completion::Return(value) => Ok(value),
            _ => Ok(Value::Undefined),
        }
    }

    fn exec_block(&mut self, body: &[Stmt], scope: &Rc<Scope>) -> EvalResult<Completion> {
        for stmt in body {
            if let Stmt::Function(def) = stmt {
                let name = def.name.clone().unwrap_or_default();
                scope.declare(&name, make_closure(def, scope), true);
            }
        }
        for stmt in body {
            match self.exec(stmt, scope)? {
                Completion::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Completion::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> EvalResult<Completion> {
        self.enter()?;
        let completion = self.exec_stmt(stmt, scope);
        self.leave();
        completion
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> EvalResult<Completion> {
        self.step()?;
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, scope)?;
                Ok(Completion::Normal)
            }
            Stmt::Declare { kind, declarations } => {
                for (pattern, init) in declarations {
                    let value = match init {
                        Some(init) => self.eval(init, scope)?,
                        None => Value::Undefined,
                    };
                    self.bind_pattern(pattern, value, scope, *kind)?;
                }
                Ok(Completion::Normal)
            }
            Stmt::Function(_) | Stmt::Empty => Ok(Completion::Normal),
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::Undefined,
                };
                Ok(Completion::Return(value))
            }
            Stmt::If {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, scope)?.is_truthy() {
                    self.exec(consequent, scope)
                } else if let Some(alternate) = alternate {
                    self.exec(alternate, scope)
                } else {
                    Ok(Completion::Normal)
                }
            }
            Stmt::Block(body) => self.exec_block(body, &Scope::child(scope)),
            Stmt::For {
                init,
                test,
                update,
                body,
            } => {
                let loop_scope = Scope::child(scope);
                if let Some(init) = init {
                    self.exec(init, &loop_scope)?;
                }
                loop {
                    self.step()?;
                    if let Some(test) = test {
                        if !self.eval(test, &loop_scope)?.is_truthy() {
                            break;
                        }
                    }
                    match self.exec(body, &Scope::child(&loop_scope))? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                    if let Some(update) = update {
                        self.eval(update, &loop_scope)?;
                    }
                }
                Ok(Completion::Normal)
            }
            Stmt::ForOf {
                kind,
                binding,
                iterable,
                body,
            } => {
                let iterable = self.eval(iterable, scope)?;
                for item in self.iterate(&iterable)? {
                    self.step()?;
                    let iteration = Scope::child(scope);
                    self.bind_pattern(binding, item, &iteration, *kind)?;
                    match self.exec(body, &iteration)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                }
                Ok(Completion::Normal)
            }
            Stmt::ForIn {
                kind,
                binding,
                object,
                body,
            } => {
                let object = self.eval(object, scope)?;
                for key in enumerable_keys(&object) {
                    self.step()?;
                    let iteration = Scope::child(scope);
                    self.bind_pattern(binding, Value::String(key), &iteration, *kind)?;
                    match self.exec(body, &iteration)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                }
                Ok(Completion::Normal)
            }
            Stmt::While { test, body } => {
                while self.eval(test, scope)?.is_truthy() {
                    self.step()?;
                    match self.exec(body, scope)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                }
                Ok(Completion::Normal)
            }
            Stmt::DoWhile { body, test } => {
                loop {
                    self.step()?;
                    match self.exec(body, scope)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                    if !self.eval(test, scope)?.is_truthy() {
                        break;
                    }
                }
                Ok(Completion::Normal)
            }
            Stmt::Switch {
                discriminant,
                cases,
            } => {
                let value = self.eval(discriminant, scope)?;
                let switch_scope = Scope::child(scope);
                let mut start = None;
                for (index, case) in cases.iter().enumerate() {
                    if let Some(test) = &case.test {
                        if value.strict_equals(&self.eval(test, &switch_scope)?) {
                            start = Some(index);
                            break;
                        }
                    }
                }
                let start = start.or_else(|| cases.iter().position(|case| case.test.is_none()));
                if let Some(start) = start {
                    for case in &cases[start..] {
                        match self.exec_block(&case.body, &switch_scope)? {
                            Completion::Normal => {}
                            Completion::Break => break,
                            other => return Ok(other),
                        }
                    }
                }
                Ok(Completion::Normal)
            }
            Stmt::Break => Ok(Completion::Break),
            Stmt::Continue => Ok(Completion::Continue),
            Stmt::Throw(expr) => {
                let value = self.eval(expr, scope)?;
                Err(RuntimeError::thrown(value))
            }
            Stmt::Try {
                block,
                param,
                handler,
                finalizer,
            } => {
                let result = match self.exec_block(block, &Scope::child(scope)) {
                    Err(err) if err.is_catchable() => match handler {
                        Some(handler) => self.run_catch(&err, param.as_ref(), handler, scope),
                        None => Err(err),
                    },
                    other => other,
                };
                if let Some(finalizer) = finalizer {
                    match self.exec_block(finalizer, &Scope::child(scope))? {
                        Completion::Normal => {}
                        other => return Ok(other),
                    }
                }
                result
            }
        }
    }

    fn run_catch(
        &mut self,
        err: &RuntimeError,
        param: Option<&Pattern>,
        handler: &[Stmt],
        scope: &Rc<Scope>,
    ) -> EvalResult<Completion> {
        let catch_scope = Scope::child(scope);
        if let Some(param) = param {
            self.bind_pattern(param, err.to_value(), &catch_scope, DeclKind::Let)?;
        }
        self.exec_block(handler, &catch_scope)
    }

    pub fn bind_pattern(
        &mut self,
        pattern: &Pattern,
        value: Value,
        scope: &Rc<Scope>,
        kind: DeclKind,
    ) -> EvalResult<()> {
        match pattern {
            Pattern::Identifier(name) => {
                match kind {
                    DeclKind::Var => scope.declare_var(name, value),
                    DeclKind::Let => scope.declare(name, value, true),
                    DeclKind::Const => scope.declare(name, value, false),
                }
                Ok(())
            }
            Pattern::Default { target, default } => {
                let value = match value {
                    Value::Undefined => self.eval(default, scope)?,
                    other => other,
                };
                self.bind_pattern(target, value, scope, kind)
            }
            Pattern::Object { properties, rest } => {
                if value.is_nullish() {
                    return Err(RuntimeError::type_error(format!(
                        "Cannot destructure '{}' as it is {}.",
                        value.to_js_string(),
                        value.to_js_string()
                    )));
                }
                let mut used = Vec::with_capacity(properties.len());
                for (key, sub) in properties {
                    let key = match key {
                        PropKey::Static(key) => key.clone(),
                        PropKey::Computed(expr) => property_key(&self.eval(expr, scope)?),
                    };
                    let item = self.get_property(&value, &key)?;
                    self.bind_pattern(sub, item, scope, kind)?;
                    used.push(key);
                }
                if let Some(rest) = rest {
                    let remaining = Object::plain();
                    for key in enumerable_keys(&value) {
                        if !used.contains(&key) {
                            let item = self.get_property(&value, &key)?;
                            remaining.insert(key, item);
                        }
                    }
                    self.bind_pattern(rest, Value::Object(remaining), scope, kind)?;
                }
                Ok(())
            }
            Pattern::Array { elements, rest } => {
                let items = self.iterate(&value)?;
                for (index, element) in elements.iter().enumerate() {
                    if let Some(element) = element {
                        let item = items.get(index).cloned().unwrap_or_default();
                        self.bind_pattern(element, item, scope, kind)?;
                    }
                }
                if let Some(rest) = rest {
                    let remaining = items.iter().skip(elements.len()).cloned().collect();
                    self.bind_pattern(rest, Value::array(remaining), scope, kind)?;
                }
                Ok(())
            }
        }
    }

    pub fn eval(&mut self, expr: &Expr, scope: &Rc<Scope>) -> EvalResult {
        self.enter()?;
        let value = self.eval_expr(expr, scope);
        self.leave();
        value
    }

    fn eval_expr(&mut self, expr: &Expr, scope: &Rc<Scope>) -> EvalResult {
        match expr {
            Expr::Literal(literal) => Ok(match literal {
                Literal::Undefined => Value::Undefined,
                Literal::Null => Value::Null,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Number(n) => Value::Number(*n),
                Literal::String(s) => Value::String(s.clone()),
            }),
            Expr::Template {
                quasis,
                expressions,
            } => {
                let mut out = String::new();
                for (index, quasi) in quasis.iter().enumerate() {
                    out.push_str(quasi);
                    if let Some(expr) = expressions.get(index) {
                        out.push_str(&self.eval(expr, scope)?.to_js_string());
                    }
                }
                Ok(Value::String(out))
            }
            Expr::Identifier(name) => match self.lookup(name, scope)? {
                Some(value) => Ok(value),
                None => Err(RuntimeError::Reference(name.clone())),
            },
            Expr::This => Ok(scope.this_value()),
            Expr::Array(items) => Ok(Value::array(self.eval_items(items, scope)?)),
            Expr::Object(props) => {
                let object = Object::plain();
                for prop in props {
                    match prop {
                        PropertyDef::Init { key, value } => {
                            let key = match key {
                                PropKey::Static(key) => key.clone(),
                                PropKey::Computed(expr) => property_key(&self.eval(expr, scope)?),
                            };
                            let value = self.eval(value, scope)?;
                            object.insert(key, value);
                        }
                        PropertyDef::Spread(expr) => {
                            let source = self.eval(expr, scope)?;
                            for key in enumerable_keys(&source) {
                                let value = self.get_property(&source, &key)?;
                                object.insert(key, value);
                            }
                        }
                    }
                }
                Ok(Value::Object(object))
            }
            Expr::Function(def) => Ok(make_closure(def, scope)),
            Expr::Unary { op, argument } => {
                if let (UnaryOp::Typeof, Expr::Identifier(name)) = (op, argument.as_ref()) {
                    let value = self.lookup(name, scope)?.unwrap_or_default();
                    return Ok(Value::string(value.type_of()));
                }
                let value = self.eval(argument, scope)?;
                Ok(unary_op(*op, &value))
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                binary_op(*op, &left, &right)
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left, scope)?;
                let short_circuit = match op {
                    LogicalOp::Or => left.is_truthy(),
                    LogicalOp::And => !left.is_truthy(),
                    LogicalOp::Coalesce => !left.is_nullish(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, scope)?.is_truthy() {
                    self.eval(consequent, scope)
                } else {
                    self.eval(alternate, scope)
                }
            }
            Expr::Assign { op, target, value } => {
                let place = self.resolve_place(target, scope)?;
                let value = match op {
                    AssignOp::Assign => self.eval(value, scope)?,
                    AssignOp::Binary(op) => {
                        let current = self.read_place(&place, scope)?;
                        let rhs = self.eval(value, scope)?;
                        binary_op(*op, &current, &rhs)?
                    }
                    AssignOp::Logical(op) => {
                        let current = self.read_place(&place, scope)?;
                        let assign = match op {
                            LogicalOp::Or => !current.is_truthy(),
                            LogicalOp::And => current.is_truthy(),
                            LogicalOp::Coalesce => current.is_nullish(),
                        };
                        if !assign {
                            return Ok(current);
                        }
                        self.eval(value, scope)?
                    }
                };
                self.write_place(place, value.clone(), scope)?;
                Ok(value)
            }
            Expr::Update { op, prefix, target } => {
                let place = self.resolve_place(target, scope)?;
                let old = self.read_place(&place, scope)?.to_number();
                let new = match op {
                    UpdateOp::Increment => old + 1.0,
                    UpdateOp::Decrement => old - 1.0,
                };
                self.write_place(place, Value::Number(new), scope)?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            Expr::Delete(target) => {
                if let Place::Member(object, key) = self.resolve_place(target, scope)? {
                    match &object {
                        Value::Object(obj) if obj.is_frozen() => {
                            return Err(RuntimeError::type_error(format!(
                                "Cannot delete property '{}' of a frozen object",
                                key
                            )));
                        }
                        Value::Object(obj) => {
                            obj.remove(&key);
                        }
                        Value::Array(items) => {
                            if let Some(index) = array_index(&key) {
                                if let Some(slot) = items.borrow_mut().get_mut(index) {
                                    *slot = Value::Undefined;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Member { .. } | Expr::Call { .. } => {
                Ok(self.eval_optional(expr, scope)?.unwrap_or_default())
            }
            Expr::Chain(inner) => Ok(self.eval_optional(inner, scope)?.unwrap_or_default()),
            Expr::Sequence(exprs) => {
                let mut last = Value::Undefined;
                for expr in exprs {
                    last = self.eval(expr, scope)?;
                }
                Ok(last)
            }
        }
    }

    /// Evaluates a link of an optional chain. `None` means the chain
    /// short-circuited on a nullish value.
    fn eval_optional(&mut self, expr: &Expr, scope: &Rc<Scope>) -> EvalResult<Option<Value>> {
        match expr {
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let Some(object) = self.eval_optional(object, scope)? else {
                    return Ok(None);
                };
                if *optional && object.is_nullish() {
                    return Ok(None);
                }
                let key = self.member_key(property, scope)?;
                self.get_property(&object, &key).map(Some)
            }
            Expr::Call {
                callee,
                arguments,
                optional,
            } => {
                let (func, this) = match callee.as_ref() {
                    Expr::Member {
                        object,
                        property,
                        optional: member_optional,
                    } => {
                        let Some(object) = self.eval_optional(object, scope)? else {
                            return Ok(None);
                        };
                        if *member_optional && object.is_nullish() {
                            return Ok(None);
                        }
                        let key = self.member_key(property, scope)?;
                        (self.get_property(&object, &key)?, object)
                    }
                    other => match self.eval_optional(other, scope)? {
                        Some(func) => (func, Value::Undefined),
                        None => return Ok(None),
                    },
                };
                if *optional && func.is_nullish() {
                    return Ok(None);
                }
                if !func.is_function() {
                    return Err(RuntimeError::type_error(format!(
                        "{} is not a function",
                        describe_callee(callee)
                    )));
                }
                let args = self.eval_items(arguments, scope)?;
                self.call(&func, this, args).map(Some)
            }
            other => self.eval(other, scope).map(Some),
        }
    }

    fn member_key(&mut self, property: &MemberProp, scope: &Rc<Scope>) -> EvalResult<String> {
        match property {
            MemberProp::Static(name) => Ok(name.clone()),
            MemberProp::Computed(expr) => Ok(property_key(&self.eval(expr, scope)?)),
        }
    }

    fn eval_items(&mut self, items: &[ArrayItem], scope: &Rc<Scope>) -> EvalResult<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                ArrayItem::Item(expr) => out.push(self.eval(expr, scope)?),
                ArrayItem::Spread(expr) => {
                    let value = self.eval(expr, scope)?;
                    out.extend(self.iterate(&value)?);
                }
                ArrayItem::Hole => out.push(Value::Undefined),
            }
        }
        Ok(out)
    }

    /// Items produced by `for…of` and spread.
    pub fn iterate(&mut self, value: &Value) -> EvalResult<Vec<Value>> {
        match value {
            Value::Array(items) => Ok(items.borrow().clone()),
            Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
            other => Err(RuntimeError::type_error(format!(
                "{} is not iterable",
                other.type_of()
            ))),
        }
    }

    fn lookup(&mut self, name: &str, scope: &Rc<Scope>) -> EvalResult<Option<Value>> {
        let mut current = Some(Rc::clone(scope));
        while let Some(scope) = current {
            let bound = scope.vars.borrow().get(name).map(|b| b.value.clone());
            if bound.is_some() {
                return Ok(bound);
            }
            if let Some(fallback) = &scope.fallback {
                if has_own_property(fallback, name) {
                    return self.get_property(fallback, name).map(Some);
                }
            }
            current = scope.parent.clone();
        }
        Ok(None)
    }

    fn assign_identifier(&mut self, name: &str, value: Value, scope: &Rc<Scope>) -> EvalResult<()> {
        let mut current = Some(Rc::clone(scope));
        while let Some(scope) = current {
            {
                let mut vars = scope.vars.borrow_mut();
                if let Some(binding) = vars.get_mut(name) {
                    if !binding.mutable {
                        return Err(RuntimeError::type_error("Assignment to constant variable."));
                    }
                    binding.value = value;
                    return Ok(());
                }
            }
            if let Some(fallback) = &scope.fallback {
                if has_own_property(fallback, name) {
                    return self.set_property(fallback, name, value);
                }
            }
            current = scope.parent.clone();
        }
        Err(RuntimeError::Reference(name.to_string()))
    }

    fn resolve_place(&mut self, target: &Target, scope: &Rc<Scope>) -> EvalResult<Place> {
        match target {
            Target::Identifier(name) => Ok(Place::Identifier(name.clone())),
            Target::Member { object, property } => {
                let object = self.eval(object, scope)?;
                let key = self.member_key(property, scope)?;
                Ok(Place::Member(object, key))
            }
        }
    }

    fn read_place(&mut self, place: &Place, scope: &Rc<Scope>) -> EvalResult {
        match place {
            Place::Identifier(name) => match self.lookup(name, scope)? {
                Some(value) => Ok(value),
                None => Err(RuntimeError::Reference(name.clone())),
            },
            Place::Member(object, key) => self.get_property(object, key),
        }
    }

    fn write_place(&mut self, place: Place, value: Value, scope: &Rc<Scope>) -> EvalResult<()> {
        match place {
            Place::Identifier(name) => self.assign_identifier(&name, value, scope),
            Place::Member(object, key) => self.set_property(&object, &key, value),
        }
    }

    pub fn get_property(&mut self, target: &Value, key: &str) -> EvalResult {
        match target {
            Value::Undefined | Value::Null => Err(RuntimeError::type_error(format!(
                "Cannot read properties of {} (reading '{}')",
                target.to_js_string(),
                key
            ))),
            Value::Bool(_) => Ok(Value::Undefined),
            Value::Number(_) => Ok(builtins::number_method(key).unwrap_or_default()),
            Value::String(s) => {
                if key == "length" {
                    return Ok(Value::Number(s.chars().count() as f64));
                }
                if let Some(index) = array_index(key) {
                    return Ok(s
                        .chars()
                        .nth(index)
                        .map(|c| Value::String(c.to_string()))
                        .unwrap_or_default());
                }
                Ok(builtins::string_method(key).unwrap_or_default())
            }
            Value::Array(items) => {
                if key == "length" {
                    return Ok(Value::Number(items.borrow().len() as f64));
                }
                if let Some(index) = array_index(key) {
                    return Ok(items.borrow().get(index).cloned().unwrap_or_default());
                }
                Ok(builtins::array_method(key).unwrap_or_default())
            }
            Value::Function(func) => {
                if key == "name" {
                    return Ok(Value::string(func.name()));
                }
                Ok(builtins::function_method(key).unwrap_or_default())
            }
            Value::Object(obj) => self.get_object_property(obj, key),
        }
    }

    fn get_object_property(&mut self, obj: &Rc<Object>, key: &str) -> EvalResult {
        match &obj.kind {
            ObjectKind::Computed { getter, .. } if key == "value" => {
                let getter = getter.clone();
                self.call(&getter, Value::Undefined, Vec::new())
            }
            ObjectKind::Instance => match obj.get_own(key) {
                Some(Value::Object(inner)) if inner.is_ref() => {
                    self.get_object_property(&inner, "value")
                }
                Some(value) => Ok(value),
                None => Ok(builtins::object_method(key).unwrap_or_default()),
            },
            _ => Ok(obj
                .get_own(key)
                .or_else(|| builtins::object_method(key))
                .unwrap_or_default()),
        }
    }

    pub fn set_property(&mut self, target: &Value, key: &str, value: Value) -> EvalResult<()> {
        match target {
            Value::Array(items) => {
                if key == "length" {
                    let length = value.to_number();
                    if length < 0.0 || length.fract() != 0.0 || length > MAX_ARRAY_LENGTH as f64 {
                        return Err(RuntimeError::type_error("Invalid array length"));
                    }
                    items.borrow_mut().resize(length as usize, Value::Undefined);
                    return Ok(());
                }
                match array_index(key) {
                    Some(index) if index < MAX_ARRAY_LENGTH => {
                        let mut items = items.borrow_mut();
                        if index >= items.len() {
                            items.resize(index + 1, Value::Undefined);
                        }
                        items[index] = value;
                        Ok(())
                    }
                    _ => Err(RuntimeError::type_error(format!(
                        "Cannot set property '{}' on an array",
                        key
                    ))),
                }
            }
            Value::Object(obj) => self.set_object_property(obj, key, value),
            other => Err(RuntimeError::type_error(format!(
                "Cannot set properties of {} (setting '{}')",
                other.to_js_string(),
                key
            ))),
        }
    }

    fn set_object_property(&mut self, obj: &Rc<Object>, key: &str, value: Value) -> EvalResult<()> {
        if obj.is_frozen() {
            return Err(RuntimeError::type_error(format!(
                "Cannot assign to read only property '{}' of object",
                key
            )));
        }
        match &obj.kind {
            ObjectKind::Computed { setter, .. } if key == "value" => match setter.clone() {
                Some(setter) => {
                    self.call(&setter, Value::Undefined, vec![value])?;
                    Ok(())
                }
                None => {
                    warn!("write to a readonly computed value ignored");
                    Ok(())
                }
            },
            ObjectKind::Instance => {
                if let Some(Value::Object(inner)) = obj.get_own(key) {
                    if inner.is_ref() {
                        return self.set_object_property(&inner, "value", value);
                    }
                }
                obj.insert(key, value);
                Ok(())
            }
            _ => {
                obj.insert(key, value);
                Ok(())
            }
        }
    }

    pub fn call(&mut self, func: &Value, this: Value, args: Vec<Value>) -> EvalResult {
        let Value::Function(func) = func else {
            return Err(RuntimeError::type_error(format!(
                "{} is not a function",
                func.type_of()
            )));
        };
        self.enter()?;
        let result = self.call_function(func, this, args);
        self.leave();
        result
    }

    fn call_function(&mut self, func: &Rc<Function>, this: Value, args: Vec<Value>) -> EvalResult {
        if self.depth >= self.limits.max_call_depth {
            return Err(RuntimeError::CallDepth(self.limits.max_call_depth));
        }
        self.depth += 1;
        let result = match func.as_ref() {
            Function::Native { call, .. } => {
                let call = Rc::clone(call);
                call(self, this, args)
            }
            Function::Bound { target, this } => {
                let target = Rc::clone(target);
                self.call_function(&target, this.clone(), args)
            }
            Function::Closure { def, scope } => self.call_closure(def, scope, this, args),
        };
        self.depth -= 1;
        result
    }

    fn call_closure(
        &mut self,
        def: &FunctionDef,
        captured: &Rc<Scope>,
        this: Value,
        args: Vec<Value>,
    ) -> EvalResult {
        let scope = Scope::function(captured, if def.arrow { None } else { Some(this) });
        let mut args = args.into_iter();
        for param in &def.params {
            let value = args.next().unwrap_or_default();
            self.bind_pattern(param, value, &scope, DeclKind::Let)?;
        }
        if let Some(rest) = &def.rest {
            self.bind_pattern(rest, Value::array(args.collect()), &scope, DeclKind::Let)?;
        }
        self.run_program(&def.body, &scope)
    }
}

fn make_closure(def: &Rc<FunctionDef>, scope: &Rc<Scope>) -> Value {
    Value::Function(Rc::new(Function::Closure {
        def: Rc::clone(def),
        scope: Rc::clone(scope),
    }))
}

fn describe_callee(callee: &Expr) -> String {
    match callee {
        Expr::Identifier(name) => name.clone(),
        Expr::Member {
            property: MemberProp::Static(name),
            ..
        } => name.clone(),
        _ => "expression".to_string(),
    }
}

pub fn property_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => number_to_string(*n),
        other => other.to_js_string(),
    }
}

pub(crate) fn array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

fn has_own_property(target: &Value, key: &str) -> bool {
    match target {
        Value::Object(obj) => obj.has_own(key),
        _ => false,
    }
}

/// Keys visited by `for…in`, object spread and rest patterns.
pub(crate) fn enumerable_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(obj) => obj.keys(),
        Value::Array(items) => (0..items.borrow().len()).map(|i| i.to_string()).collect(),
        Value::String(s) => (0..s.chars().count()).map(|i| i.to_string()).collect(),
        _ => Vec::new(),
    }
}

fn to_primitive(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) | Value::Function(_) => {
            Value::String(value.to_js_string())
        }
        other => other.clone(),
    }
}

fn to_int32(n: f64) -> i32 {
    to_uint32(n) as i32
}

fn to_uint32(n: f64) -> u32 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(4_294_967_296.0) as u32
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (to_primitive(left), to_primitive(right)) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(&b)),
        (a, b) => a.to_number().partial_cmp(&b.to_number()),
    }
}

fn unary_op(op: UnaryOp, value: &Value) -> Value {
    match op {
        UnaryOp::Neg => Value::Number(-value.to_number()),
        UnaryOp::Plus => Value::Number(value.to_number()),
        UnaryOp::Not => Value::Bool(!value.is_truthy()),
        UnaryOp::BitNot => Value::Number(!to_int32(value.to_number()) as f64),
        UnaryOp::Typeof => Value::string(value.type_of()),
        UnaryOp::Void => Value::Undefined,
    }
}

pub(crate) fn binary_op(op: BinaryOp, left: &Value, right: &Value) -> EvalResult {
    let number = |f: fn(f64, f64) -> f64| Value::Number(f(left.to_number(), right.to_number()));
    Ok(match op {
        BinaryOp::Add => {
            let (l, r) = (to_primitive(left), to_primitive(right));
            if matches!(l, Value::String(_)) || matches!(r, Value::String(_)) {
                Value::String(format!("{}{}", l.to_js_string(), r.to_js_string()))
            } else {
                Value::Number(l.to_number() + r.to_number())
            }
        }
        BinaryOp::Sub => number(|a, b| a - b),
        BinaryOp::Mul => number(|a, b| a * b),
        BinaryOp::Div => number(|a, b| a / b),
        BinaryOp::Rem => number(|a, b| a % b),
        BinaryOp::Exp => number(f64::powf),
        BinaryOp::Eq => Value::Bool(left.loose_equals(right)),
        BinaryOp::NotEq => Value::Bool(!left.loose_equals(right)),
        BinaryOp::StrictEq => Value::Bool(left.strict_equals(right)),
        BinaryOp::StrictNotEq => Value::Bool(!left.strict_equals(right)),
        BinaryOp::Lt => Value::Bool(compare(left, right) == Some(Ordering::Less)),
        BinaryOp::LtE => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Gt => Value::Bool(compare(left, right) == Some(Ordering::Greater)),
        BinaryOp::GtE => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::Shl => Value::Number(
            to_int32(left.to_number()).wrapping_shl(to_uint32(right.to_number()) & 31) as f64,
        ),
        BinaryOp::Shr => Value::Number(
            (to_int32(left.to_number()) >> (to_uint32(right.to_number()) & 31)) as f64,
        ),
        BinaryOp::UShr => Value::Number(
            (to_uint32(left.to_number()) >> (to_uint32(right.to_number()) & 31)) as f64,
        ),
        BinaryOp::BitOr => Value::Number((to_int32(left.to_number()) | to_int32(right.to_number())) as f64),
        BinaryOp::BitXor => Value::Number((to_int32(left.to_number()) ^ to_int32(right.to_number())) as f64),
        BinaryOp::BitAnd => Value::Number((to_int32(left.to_number()) & to_int32(right.to_number())) as f64),
        BinaryOp::In => {
            let key = property_key(left);
            match right {
                Value::Object(obj) => Value::Bool(obj.has_own(&key)),
                Value::Array(items) => Value::Bool(
                    key == "length" || array_index(&key).is_some_and(|i| i < items.borrow().len()),
                ),
                other => {
                    return Err(RuntimeError::type_error(format!(
                        "Cannot use 'in' operator to search for '{}' in {}",
                        key,
                        other.to_js_string()
                    )));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::parse_program;

    fn run(source: &str) -> EvalResult {
        let body = parse_program(source).unwrap();
        let mut interp = Interpreter::new(Limits::default());
        interp.run_program(&body, &Scope::root())
    }

    #[test]
    fn test_arithmetic_and_strings() {
        assert_eq!(run("return 1 + 2 * 3;").unwrap().to_number(), 7.0);
        assert_eq!(run("return 'a' + 1;").unwrap().to_js_string(), "a1");
        assert_eq!(run("return `n=${2 ** 3}`;").unwrap().to_js_string(), "n=8");
        assert_eq!(run("return -7 % 3;").unwrap().to_number(), -1.0);
        assert_eq!(run("return 5 >>> 1;").unwrap().to_number(), 2.0);
    }

    #[test]
    fn test_closures_capture_scope() {
        let source = r#"
            function counter() {
                let n = 0;
                return () => ++n;
            }
            const next = counter();
            next();
            return next();
        "#;
        assert_eq!(run(source).unwrap().to_number(), 2.0);
    }

    #[test]
    fn test_loops_and_control_flow() {
        let source = r#"
            let total = 0;
            for (let i = 0; i < 10; i++) {
                if (i === 2) continue;
                if (i === 5) break;
                total += i;
            }
            for (const x of [10, 20]) total += x;
            let k = 0;
            while (k < 3) k++;
            return total + k;
        "#;
        assert_eq!(run(source).unwrap().to_number(), 0.0 + 1.0 + 3.0 + 4.0 + 30.0 + 3.0);
    }

    #[test]
    fn test_switch_falls_through() {
        let source = r#"
            let out = '';
            switch (2) {
                case 1: out += 'a';
                case 2: out += 'b';
                case 3: out += 'c'; break;
                default: out += 'd';
            }
            return out;
        "#;
        assert_eq!(run(source).unwrap().to_js_string(), "bc");
    }

    #[test]
    fn test_destructuring_with_defaults_and_rest() {
        let source = r#"
            const { a, b = 2, ...others } = { a: 1, c: 3, d: 4 };
            const [first, , third = 9, ...tail] = [1, 2, undefined, 4, 5];
            return [a, b, first, third, tail.length, others.d].join(',');
        "#;
        assert_eq!(run(source).unwrap().to_js_string(), "1,2,1,9,2,4");
    }

    #[test]
    fn test_try_catch_finally() {
        let source = r#"
            let log = [];
            try {
                throw { message: 'boom' };
            } catch (e) {
                log.push(e.message);
            } finally {
                log.push('done');
            }
            try { missing(); } catch (e) { log.push(e.name); }
            return log.join(' ');
        "#;
        assert_eq!(run(source).unwrap().to_js_string(), "boom done ReferenceError");
    }

    #[test]
    fn test_optional_chaining_short_circuits() {
        let source = r#"
            const node = { data: null };
            return [node.data?.label, node.missing?.(), node?.data ?? 'none'].join('|');
        "#;
        assert_eq!(run(source).unwrap().to_js_string(), "||none");
    }

    #[test]
    fn test_method_this_binding() {
        let source = r#"
            const obj = { count: 1, bump() { this.count += 1; return this.count; } };
            obj.bump();
            return obj.bump();
        "#;
        assert_eq!(run(source).unwrap().to_number(), 3.0);
    }

    #[test]
    fn test_const_reassignment_is_type_error() {
        assert!(matches!(run("const x = 1; x = 2;"), Err(RuntimeError::Type(_))));
    }

    #[test]
    fn test_undeclared_identifier_is_reference_error() {
        assert!(matches!(run("return window.location;"), Err(RuntimeError::Reference(name)) if name == "window"));
        assert_eq!(run("return typeof process;").unwrap().to_js_string(), "undefined");
    }

    #[test]
    fn test_call_depth_is_bounded() {
        let body = parse_program("function f(n) { return f(n + 1); } return f(0);").unwrap();
        let mut interp = Interpreter::new(Limits {
            max_call_depth: 16,
            max_steps: None,
        });
        let err = interp.run_program(&body, &Scope::root()).unwrap_err();
        assert!(matches!(err, RuntimeError::CallDepth(16)));
    }

    #[test]
    fn test_native_stack_is_bounded() {
        let body = parse_program("function f(n) { return f(n + 1); } return f(0);").unwrap();
        let mut interp = Interpreter::new(Limits {
            max_call_depth: usize::MAX,
            max_steps: None,
        });
        let err = interp.run_program(&body, &Scope::root()).unwrap_err();
        assert!(matches!(err, RuntimeError::StackExhausted));
        assert!(!err.is_catchable());

        let body = parse_program("function g() { g() } try { g() } catch (e) { return 'caught' } return 'escaped';").unwrap();
        assert!(matches!(
            interp.run_program(&body, &Scope::root()),
            Err(RuntimeError::StackExhausted)
        ));
    }

    #[test]
    fn test_step_budget_is_per_run() {
        let body = parse_program("let n = 0; while (n < 200) { n++; } return n;").unwrap();
        let mut interp = Interpreter::new(Limits {
            max_call_depth: 32,
            max_steps: Some(1_000),
        });
        for _ in 0..5 {
            assert_eq!(interp.run_program(&body, &Scope::root()).unwrap().to_js_string(), "200");
        }
    }

    #[test]
    fn test_default_limits_stop_runaway_loops() {
        let body = parse_program("while (true) {}").unwrap();
        let mut interp = Interpreter::new(Limits::default());
        let err = interp.run_program(&body, &Scope::root()).unwrap_err();
        assert!(matches!(err, RuntimeError::StepBudget(1_000_000)));
    }

    #[test]
    fn test_step_budget_escapes_catch() {
        let body = parse_program("try { while (true) {} } catch (e) {} return 1;").unwrap();
        let mut interp = Interpreter::new(Limits {
            max_call_depth: 32,
            max_steps: Some(1_000),
        });
        let err = interp.run_program(&body, &Scope::root()).unwrap_err();
        assert!(matches!(err, RuntimeError::StepBudget(1_000)));
    }

    #[test]
    fn test_frozen_objects_reject_writes() {
        let frozen = Object::plain();
        frozen.insert("Left", Value::string("left"));
        frozen.freeze();
        let scope = Scope::root();
        scope.declare_const("Position", Value::Object(frozen));
        let body = parse_program("Position.Left = 'right';").unwrap();
        let mut interp = Interpreter::new(Limits::default());
        assert!(matches!(interp.run_program(&body, &scope), Err(RuntimeError::Type(_))));
    }

    #[test]
    fn test_fallback_scope_reads_and_writes_object() {
        let state = Value::Object(Object::new(ObjectKind::Instance, Default::default()));
        if let Value::Object(obj) = &state {
            obj.insert("count", Value::Number(1.0));
        }
        let scope = Scope::with_fallback(&Scope::root(), state.clone(), Some(state.clone()));
        let body = parse_program("count++; return count;").unwrap();
        let mut interp = Interpreter::new(Limits::default());
        assert_eq!(interp.run_program(&body, &scope).unwrap().to_number(), 2.0);
        assert_eq!(state.to_json(), serde_json::json!({ "count": 2 }));
    }
}
