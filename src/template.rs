//! Markup compiler.
//!
//! Compiles a Vue-style template into a [`RenderRoutine`]: a tree of render
//! nodes whose expressions are parsed once, up front, and evaluated against
//! component state on every render. Markup is pre-processed with regexes
//! (interpolations, self-closing tags, component casing) and then parsed
//! with html5ever.

use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use lazy_static::lazy_static;
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

use crate::ast::{Block, DeclKind, Expr, MemberProp, Pattern, Stmt};
use crate::error::CompileError;
use crate::interpreter::{enumerable_keys, property_key, EvalResult, Interpreter, Scope};
use crate::lower::{parse_expression, parse_program, MAX_NESTING_DEPTH};
use crate::value::{RuntimeError, Value};
use crate::vnode::{is_void_element, VNode};

// ═══════════════════════════════════════════════════════════════════════════════
// PATTERNS
// ═══════════════════════════════════════════════════════════════════════════════

lazy_static! {
    static ref EXPR_PLACEHOLDER_RE: Regex = Regex::new(r"__NODE_EXPR_(\d+)__").unwrap();
    static ref HTML_COMMENT_RE: Regex = Regex::new(r"(?s)<!--.*?-->").unwrap();
    /// Opening, closing and self-closing tags. Quoted attribute values may
    /// contain `<` and `>`.
    static ref TAG_RE: Regex = Regex::new(
        r#"<(/?)([A-Za-z][\w.:-]*)((?:\s+[^\s"'<>/=]+(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'=<>`]+))?)*)\s*(/?)>"#
    )
    .unwrap();
    static ref TAG_START_RE: Regex = Regex::new(r"</?[A-Za-z]").unwrap();
    static ref FOR_RE: Regex = Regex::new(r"(?s)^\s*(.+?)\s+(?:in|of)\s+(.+?)\s*$").unwrap();
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
}

/// Attribute that carries a component tag's original casing through html5ever,
/// which lowercases every tag name.
const ORIGINAL_NAME_ATTR: &str = "data-node-orig-name";
const LOOP_RANGE_LIMIT: usize = 100_000;

// ═══════════════════════════════════════════════════════════════════════════════
// RENDER TREE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub enum TextPart {
    Static(String),
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub enum AttrNode {
    Static { name: String, value: String },
    Bound { name: String, expr: Expr },
    /// `v-bind="object"`
    Spread(Expr),
}

#[derive(Debug, Clone)]
pub struct ElementNode {
    pub tag: String,
    pub attrs: Vec<AttrNode>,
    /// Event name and index into [`RenderProgram::handlers`].
    pub events: Vec<(String, usize)>,
    pub show: Option<Expr>,
    pub children: Vec<RenderNode>,
}

#[derive(Debug, Clone)]
pub struct Branch {
    /// `None` for `v-else`.
    pub test: Option<Expr>,
    pub node: RenderNode,
}

#[derive(Debug, Clone)]
pub struct LoopNode {
    /// Value, then key or index, then index (objects only).
    pub aliases: Vec<Pattern>,
    pub source: Expr,
    pub body: Box<RenderNode>,
}

#[derive(Debug, Clone)]
pub enum RenderNode {
    Text(String),
    Interpolated(Vec<TextPart>),
    Element(ElementNode),
    /// Children of a `<template>` wrapper.
    Fragment(Vec<RenderNode>),
    Conditional(Vec<Branch>),
    Loop(LoopNode),
}

#[derive(Debug, Clone)]
pub enum Handler {
    /// `@click="inc"`: the value is called with the event.
    Callable(Expr),
    /// `@click="count++"`: statements run with `$event` in scope.
    Inline(Block),
}

#[derive(Debug, Default)]
pub struct RenderProgram {
    pub roots: Vec<RenderNode>,
    pub handlers: Vec<Handler>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RENDER ROUTINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Event handler captured during a render, together with the scope it was
/// rendered in (loop variables included).
#[derive(Clone)]
pub struct BoundHandler {
    pub handler: usize,
    scope: Rc<Scope>,
}

impl fmt::Debug for BoundHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundHandler")
            .field("handler", &self.handler)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct RenderOutput {
    pub nodes: Vec<VNode>,
    /// Indexed by the handler ids found in `nodes`.
    pub handlers: Vec<BoundHandler>,
}

/// Compiled markup. Stateless and cheap to clone.
#[derive(Debug, Clone)]
pub struct RenderRoutine(Rc<RenderProgram>);

impl RenderRoutine {
    pub fn new(program: RenderProgram) -> Self {
        RenderRoutine(Rc::new(program))
    }

    pub fn program(&self) -> &RenderProgram {
        &self.0
    }

    /// Renders against `state`. Free identifiers in template expressions
    /// resolve to state properties; `components` are the registered
    /// sub-component names.
    pub fn render(
        &self,
        interp: &mut Interpreter,
        state: &Value,
        components: &[String],
    ) -> EvalResult<RenderOutput> {
        let scope = Scope::with_fallback(&Scope::root(), state.clone(), Some(state.clone()));
        let mut renderer = Renderer {
            interp,
            components,
            handlers: Vec::new(),
        };
        let mut nodes = Vec::new();
        for node in &self.0.roots {
            renderer.node(node, &scope, &mut nodes)?;
        }
        Ok(RenderOutput {
            nodes,
            handlers: renderer.handlers,
        })
    }

    /// Runs a handler captured by [`render`](Self::render).
    pub fn invoke(
        &self,
        interp: &mut Interpreter,
        bound: &BoundHandler,
        event: Value,
    ) -> EvalResult<()> {
        let handler = self
            .0
            .handlers
            .get(bound.handler)
            .ok_or_else(|| RuntimeError::type_error("unknown event handler"))?;
        let scope = Scope::child(&bound.scope);
        scope.declare_const("$event", event.clone());
        match handler {
            Handler::Callable(Expr::Member {
                object, property, ..
            }) => {
                let target = interp.eval(object, &scope)?;
                let key = match property {
                    MemberProp::Static(name) => name.clone(),
                    MemberProp::Computed(expr) => property_key(&interp.eval(expr, &scope)?),
                };
                let func = interp.get_property(&target, &key)?;
                interp.call(&func, target, vec![event])?;
            }
            Handler::Callable(expr) => {
                let func = interp.eval(expr, &scope)?;
                interp.call(&func, Value::Undefined, vec![event])?;
            }
            Handler::Inline(block) => {
                interp.run_program(block, &scope)?;
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER
// ═══════════════════════════════════════════════════════════════════════════════

/// Turns markup into a render routine. The compiler is a seam so hosts can
/// bring their own template dialect.
pub trait TemplateCompiler {
    fn compile(&self, markup: &str) -> Result<RenderRoutine, CompileError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlTemplateCompiler;

impl TemplateCompiler for HtmlTemplateCompiler {
    fn compile(&self, markup: &str) -> Result<RenderRoutine, CompileError> {
        // Step 1: Drop comments
        let uncommented = HTML_COMMENT_RE.replace_all(markup, "");

        // Step 2: Replace interpolations with placeholders
        let (normalized, sources) = normalize_interpolations(&uncommented)?;

        // Step 3: Reject unbalanced or malformed tags (html5ever would repair them)
        check_tag_balance(&normalized)?;

        // Step 4: Close self-closing non-void tags
        let closed = convert_self_closing_tags(&normalized);

        // Step 5: Preserve component casing
        let marked = mark_component_tags(&closed);

        // Step 6: Parse with html5ever
        let dom = parse_document(RcDom::default(), Default::default())
            .from_utf8()
            .read_from(&mut marked.as_bytes())
            .map_err(|e| CompileError::template(format!("failed to parse markup: {}", e)))?;

        let mut builder = Builder {
            sources: &sources,
            handlers: Vec::new(),
        };
        let mut handles = Vec::new();
        collect_body_content(&dom.document, &mut handles);
        let roots = builder.children(&handles)?;

        debug!(
            roots = roots.len(),
            expressions = sources.len(),
            handlers = builder.handlers.len(),
            "compiled markup"
        );
        Ok(RenderRoutine::new(RenderProgram {
            roots,
            handlers: builder.handlers,
        }))
    }
}

fn excerpt(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > 40 {
        format!("{}…", line.chars().take(40).collect::<String>())
    } else {
        line.to_string()
    }
}

/// Replaces every `{{ … }}` with `__NODE_EXPR_n__`, returning the raw
/// expression sources by index.
fn normalize_interpolations(html: &str) -> Result<(String, Vec<String>), CompileError> {
    let mut normalized = String::with_capacity(html.len());
    let mut sources = Vec::new();
    let mut rest = html;

    while let Some(start) = rest.find("{{") {
        normalized.push_str(&rest[..start]);
        let inner = &rest[start + 2..];
        let Some(end) = inner.find("}}") else {
            return Err(CompileError::template(format!(
                "unterminated interpolation `{}`",
                excerpt(&rest[start..])
            )));
        };
        normalized.push_str(&format!("__NODE_EXPR_{}__", sources.len()));
        sources.push(inner[..end].to_string());
        rest = &inner[end + 2..];
    }
    normalized.push_str(rest);

    Ok((normalized, sources))
}

fn check_tag_balance(html: &str) -> Result<(), CompileError> {
    let mut stack: Vec<String> = Vec::new();
    let mut spans = Vec::new();

    for caps in TAG_RE.captures_iter(html) {
        if let Some(whole) = caps.get(0) {
            spans.push(whole.range());
        }
        let closing = !caps[1].is_empty();
        let name = caps[2].to_ascii_lowercase();
        if is_void_element(&name) {
            continue;
        }
        if closing {
            match stack.pop() {
                Some(open) if open == name => {}
                Some(open) => {
                    return Err(CompileError::template(format!(
                        "unexpected closing tag </{}>, expected </{}>",
                        &caps[2], open
                    )))
                }
                None => {
                    return Err(CompileError::template(format!(
                        "closing tag </{}> has no opening tag",
                        &caps[2]
                    )))
                }
            }
        } else if caps[4].is_empty() {
            if stack.len() >= MAX_NESTING_DEPTH {
                return Err(CompileError::template(format!(
                    "elements nest deeper than {} levels",
                    MAX_NESTING_DEPTH
                )));
            }
            stack.push(name);
        }
    }

    if let Some(m) = TAG_START_RE
        .find_iter(html)
        .find(|m| !spans.iter().any(|span| span.contains(&m.start())))
    {
        return Err(CompileError::template(format!(
            "malformed tag `{}`",
            excerpt(&html[m.start()..])
        )));
    }
    match stack.pop() {
        Some(open) => Err(CompileError::template(format!("element <{}> is never closed", open))),
        None => Ok(()),
    }
}

/// Self-closing tags are only honored by html5ever for void elements;
/// `<Handle />` would otherwise swallow its following siblings.
fn convert_self_closing_tags(html: &str) -> String {
    TAG_RE
        .replace_all(html, |caps: &Captures| {
            let name = &caps[2];
            if caps[1].is_empty() && !caps[4].is_empty() && !is_void_element(name) {
                format!("<{}{}></{}>", name, &caps[3], name)
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Pre-pass to mark tags containing uppercase letters with their original name.
fn mark_component_tags(html: &str) -> String {
    TAG_RE
        .replace_all(html, |caps: &Captures| {
            let name = &caps[2];
            if caps[1].is_empty() && name.chars().any(|c| c.is_ascii_uppercase()) {
                format!(
                    "<{} {}=\"{}\"{}{}>",
                    name, ORIGINAL_NAME_ATTR, name, &caps[3], &caps[4]
                )
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Check if a tag name represents a component (starts with uppercase)
pub fn is_component_tag(tag_name: &str) -> bool {
    tag_name
        .chars()
        .next()
        .map(|c| c.is_uppercase())
        .unwrap_or(false)
}

/// Flattens the `html`/`head`/`body` wrappers html5ever always adds.
fn collect_body_content(handle: &Handle, out: &mut Vec<Handle>) {
    match &handle.data {
        NodeData::Document => {
            for child in handle.children.borrow().iter() {
                collect_body_content(child, out);
            }
        }
        NodeData::Element { name, .. }
            if matches!(&*name.local, "html" | "head" | "body") =>
        {
            for child in handle.children.borrow().iter() {
                collect_body_content(child, out);
            }
        }
        NodeData::Element { .. } | NodeData::Text { .. } => out.push(handle.clone()),
        _ => {}
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOM TO RENDER TREE
// ═══════════════════════════════════════════════════════════════════════════════

enum Built {
    Node(RenderNode),
    ElseIf(Expr, RenderNode),
    Else(RenderNode),
}

struct Builder<'a> {
    sources: &'a [String],
    handlers: Vec<Handler>,
}

impl Builder<'_> {
    fn children(&mut self, handles: &[Handle]) -> Result<Vec<RenderNode>, CompileError> {
        let mut nodes: Vec<RenderNode> = Vec::new();
        for handle in handles {
            let Some(built) = self.node(handle)? else {
                continue;
            };
            let (test, node) = match built {
                Built::Node(node) => {
                    nodes.push(node);
                    continue;
                }
                Built::ElseIf(test, node) => (Some(test), node),
                Built::Else(node) => (None, node),
            };
            while matches!(nodes.last(), Some(RenderNode::Text(text)) if text.trim().is_empty()) {
                nodes.pop();
            }
            match nodes.last_mut() {
                Some(RenderNode::Conditional(branches))
                    if branches.last().is_some_and(|b| b.test.is_some()) =>
                {
                    branches.push(Branch { test, node });
                }
                _ => {
                    let directive = if test.is_some() { "v-else-if" } else { "v-else" };
                    return Err(CompileError::template(format!(
                        "{} has no adjacent v-if or v-else-if",
                        directive
                    )));
                }
            }
        }

        let blank = |node: &RenderNode| matches!(node, RenderNode::Text(t) if t.trim().is_empty());
        while nodes.first().is_some_and(blank) {
            nodes.remove(0);
        }
        while nodes.last().is_some_and(blank) {
            nodes.pop();
        }
        Ok(nodes)
    }

    fn node(&mut self, handle: &Handle) -> Result<Option<Built>, CompileError> {
        match &handle.data {
            NodeData::Text { contents } => {
                let text = contents.borrow().to_string();
                Ok(self.text(&text)?.map(Built::Node))
            }
            NodeData::Element {
                name,
                attrs,
                template_contents,
                ..
            } => {
                let attrs = attrs
                    .borrow()
                    .iter()
                    .map(|a| (a.name.local.to_string(), a.value.to_string()))
                    .collect::<Vec<_>>();
                let children = match &*template_contents.borrow() {
                    Some(contents) => contents.children.borrow().clone(),
                    None => handle.children.borrow().clone(),
                };
                self.element(&name.local, attrs, &children).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn text(&mut self, text: &str) -> Result<Option<RenderNode>, CompileError> {
        if text.trim().is_empty() && text.contains('\n') {
            return Ok(None);
        }
        if !EXPR_PLACEHOLDER_RE.is_match(text) {
            return Ok(Some(RenderNode::Text(condense(text))));
        }

        let mut parts = Vec::new();
        let mut last_end = 0;
        for caps in EXPR_PLACEHOLDER_RE.captures_iter(text) {
            let Some(m) = caps.get(0) else { continue };
            if m.start() > last_end {
                parts.push(TextPart::Static(condense(&text[last_end..m.start()])));
            }
            let source = self.source(&caps[1])?;
            let expr = compile_expression(&source, "{{ }}")?;
            parts.push(TextPart::Expr(expr));
            last_end = m.end();
        }
        if last_end < text.len() {
            parts.push(TextPart::Static(condense(&text[last_end..])));
        }
        Ok(Some(RenderNode::Interpolated(parts)))
    }

    fn source(&self, index: &str) -> Result<String, CompileError> {
        index
            .parse::<usize>()
            .ok()
            .and_then(|i| self.sources.get(i))
            .cloned()
            .ok_or_else(|| CompileError::template("interpolation placeholder out of range"))
    }

    /// Attribute values keep `{{ }}` literally.
    fn restore(&self, value: &str) -> String {
        EXPR_PLACEHOLDER_RE
            .replace_all(value, |caps: &Captures| match self.source(&caps[1]) {
                Ok(source) => format!("{{{{{}}}}}", source),
                Err(_) => caps[0].to_string(),
            })
            .into_owned()
    }

    fn element(
        &mut self,
        local_name: &str,
        attrs: Vec<(String, String)>,
        children: &[Handle],
    ) -> Result<Built, CompileError> {
        let mut tag = local_name.to_string();
        let mut element = ElementNode {
            tag: String::new(),
            attrs: Vec::new(),
            events: Vec::new(),
            show: None,
            children: Vec::new(),
        };
        let mut condition: Option<Built> = None;
        let mut for_loop: Option<(Vec<Pattern>, Expr)> = None;
        let mut text: Option<Expr> = None;

        for (name, raw_value) in attrs {
            let value = self.restore(&raw_value);
            if name == ORIGINAL_NAME_ATTR {
                tag = value;
                continue;
            }
            match name.as_str() {
                "v-if" => {
                    condition = Some(Built::Node(RenderNode::Conditional(vec![Branch {
                        test: Some(compile_expression(&value, "v-if")?),
                        node: RenderNode::Fragment(Vec::new()),
                    }])))
                }
                "v-else-if" => {
                    condition = Some(Built::ElseIf(
                        compile_expression(&value, "v-else-if")?,
                        RenderNode::Fragment(Vec::new()),
                    ))
                }
                "v-else" => condition = Some(Built::Else(RenderNode::Fragment(Vec::new()))),
                "v-for" => for_loop = Some(parse_for(&value)?),
                "v-show" => element.show = Some(compile_expression(&value, "v-show")?),
                "v-text" => text = Some(compile_expression(&value, "v-text")?),
                "v-model" => {
                    let expr = compile_expression(&value, "v-model")?;
                    let component = is_component_tag(&tag);
                    let (prop, event) = if component {
                        ("modelValue", "update:modelValue")
                    } else {
                        ("value", "input")
                    };
                    element.attrs.push(AttrNode::Bound {
                        name: prop.to_string(),
                        expr,
                    });
                    let assign = format!(
                        "{} = ($event && $event.target) ? $event.target.value : $event",
                        value.trim()
                    );
                    let id = self.handler(&assign, "v-model")?;
                    element.events.push((event.to_string(), id));
                }
                "v-bind" => element
                    .attrs
                    .push(AttrNode::Spread(compile_expression(&value, "v-bind")?)),
                "key" | ":key" | "v-bind:key" | "ref" => {}
                _ => {
                    if let Some(arg) = name.strip_prefix(':').or_else(|| name.strip_prefix("v-bind:")) {
                        let arg = arg.split('.').next().unwrap_or(arg).to_string();
                        let expr = compile_expression(&value, &name)?;
                        element.attrs.push(AttrNode::Bound { name: arg, expr });
                    } else if let Some(arg) =
                        name.strip_prefix('@').or_else(|| name.strip_prefix("v-on:"))
                    {
                        let event = arg.split('.').next().unwrap_or(arg).to_string();
                        let id = self.handler(&value, &name)?;
                        element.events.push((event, id));
                    } else if name.starts_with("v-") {
                        warn!(directive = name.as_str(), "unsupported directive ignored");
                    } else {
                        element.attrs.push(AttrNode::Static { name, value });
                    }
                }
            }
        }

        element.children = match text {
            Some(expr) => vec![RenderNode::Interpolated(vec![TextPart::Expr(expr)])],
            None => self.children(children)?,
        };
        element.tag = tag;

        let mut node = if element.tag == "template" {
            RenderNode::Fragment(element.children)
        } else {
            RenderNode::Element(element)
        };
        if let Some((aliases, source)) = for_loop {
            node = RenderNode::Loop(LoopNode {
                aliases,
                source,
                body: Box::new(node),
            });
        }

        Ok(match condition {
            Some(Built::Node(RenderNode::Conditional(mut branches))) => {
                if let Some(branch) = branches.first_mut() {
                    branch.node = node;
                }
                Built::Node(RenderNode::Conditional(branches))
            }
            Some(Built::ElseIf(test, _)) => Built::ElseIf(test, node),
            Some(Built::Else(_)) => Built::Else(node),
            _ => Built::Node(node),
        })
    }

    fn handler(&mut self, source: &str, directive: &str) -> Result<usize, CompileError> {
        let handler = if source.trim().is_empty() {
            Handler::Inline(Vec::new())
        } else {
            match parse_expression(source) {
                Ok(expr @ (Expr::Identifier(_) | Expr::Member { .. } | Expr::Function(_))) => {
                    Handler::Callable(expr)
                }
                Ok(expr) => Handler::Inline(vec![Stmt::Expr(expr)]),
                Err(_) => Handler::Inline(parse_program(source).map_err(|e| {
                    CompileError::template(format!(
                        "invalid handler in {}=\"{}\": {}",
                        directive, source, e
                    ))
                })?),
            }
        };
        self.handlers.push(handler);
        Ok(self.handlers.len() - 1)
    }
}

fn condense(text: &str) -> String {
    WHITESPACE_RE.replace_all(text, " ").into_owned()
}

fn compile_expression(source: &str, directive: &str) -> Result<Expr, CompileError> {
    parse_expression(source.trim()).map_err(|e| {
        CompileError::template(format!(
            "invalid expression in {} `{}`: {}",
            directive,
            source.trim(),
            e
        ))
    })
}

fn parse_alias(alias: &str) -> Option<Pattern> {
    let program = parse_program(&format!("let {} = 0;", alias)).ok()?;
    match program.into_iter().next()? {
        Stmt::Declare { declarations, .. } => declarations.into_iter().next().map(|(p, _)| p),
        _ => None,
    }
}

/// Splits on commas outside brackets.
fn split_aliases(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(list[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(list[start..].trim());
    parts
}

fn parse_for(value: &str) -> Result<(Vec<Pattern>, Expr), CompileError> {
    let malformed = || CompileError::template(format!("malformed v-for expression `{}`", value));
    let caps = FOR_RE.captures(value).ok_or_else(malformed)?;
    let alias_list = caps[1].trim();
    let alias_list = alias_list
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(alias_list);

    let aliases = split_aliases(alias_list);
    if aliases.is_empty() || aliases.len() > 3 || aliases.iter().any(|a| a.is_empty()) {
        return Err(malformed());
    }
    let patterns = aliases
        .into_iter()
        .map(parse_alias)
        .collect::<Option<Vec<_>>>()
        .ok_or_else(malformed)?;
    let source = compile_expression(&caps[2], "v-for")?;
    Ok((patterns, source))
}

// ═══════════════════════════════════════════════════════════════════════════════
// RENDERING
// ═══════════════════════════════════════════════════════════════════════════════

struct Renderer<'a> {
    interp: &'a mut Interpreter,
    components: &'a [String],
    handlers: Vec<BoundHandler>,
}

impl Renderer<'_> {
    /// Names missing from state render as `undefined`, with a warning.
    fn eval(&mut self, expr: &Expr, scope: &Rc<Scope>) -> EvalResult {
        match self.interp.eval(expr, scope) {
            Err(RuntimeError::Reference(name)) => {
                warn!(name = name.as_str(), "template referenced an undefined name");
                Ok(Value::Undefined)
            }
            other => other,
        }
    }

    fn node(&mut self, node: &RenderNode, scope: &Rc<Scope>, out: &mut Vec<VNode>) -> EvalResult<()> {
        match node {
            RenderNode::Text(text) => out.push(VNode::text(text.clone())),
            RenderNode::Interpolated(parts) => {
                let mut text = String::new();
                for part in parts {
                    match part {
                        TextPart::Static(s) => text.push_str(s),
                        TextPart::Expr(expr) => {
                            text.push_str(&self.eval(expr, scope)?.to_display_string())
                        }
                    }
                }
                out.push(VNode::text(text));
            }
            RenderNode::Fragment(children) => {
                for child in children {
                    self.node(child, scope, out)?;
                }
            }
            RenderNode::Conditional(branches) => {
                for branch in branches {
                    let taken = match &branch.test {
                        Some(test) => self.eval(test, scope)?.is_truthy(),
                        None => true,
                    };
                    if taken {
                        self.node(&branch.node, scope, out)?;
                        break;
                    }
                }
            }
            RenderNode::Loop(looped) => {
                let source = self.eval(&looped.source, scope)?;
                for values in self.loop_items(&source)? {
                    let item_scope = Scope::child(scope);
                    for (pattern, value) in looped.aliases.iter().zip(values) {
                        self.interp
                            .bind_pattern(pattern, value, &item_scope, DeclKind::Const)?;
                    }
                    self.node(&looped.body, &item_scope, out)?;
                }
            }
            RenderNode::Element(element) => {
                let vnode = self.element(element, scope)?;
                out.push(vnode);
            }
        }
        Ok(())
    }

    /// Alias values per iteration: `(item, index)` for arrays, strings and
    /// ranges; `(value, key, index)` for objects.
    fn loop_items(&mut self, source: &Value) -> EvalResult<Vec<Vec<Value>>> {
        let index = |i: usize| Value::Number(i as f64);
        Ok(match source {
            Value::Array(items) => items
                .borrow()
                .iter()
                .enumerate()
                .map(|(i, item)| vec![item.clone(), index(i)])
                .collect(),
            Value::String(s) => s
                .chars()
                .enumerate()
                .map(|(i, c)| vec![Value::String(c.to_string()), index(i)])
                .collect(),
            Value::Number(n) => {
                if *n < 0.0 || n.fract() != 0.0 || *n > LOOP_RANGE_LIMIT as f64 {
                    return Err(RuntimeError::type_error(format!(
                        "v-for range must be an integer between 0 and {}",
                        LOOP_RANGE_LIMIT
                    )));
                }
                (0..*n as usize)
                    .map(|i| vec![index(i + 1), index(i)])
                    .collect()
            }
            Value::Object(_) => {
                let mut rows = Vec::new();
                for (i, key) in enumerable_keys(source).into_iter().enumerate() {
                    let value = self.interp.get_property(source, &key)?;
                    rows.push(vec![value, Value::String(key), index(i)]);
                }
                rows
            }
            _ => Vec::new(),
        })
    }

    fn resolve_component(&self, tag: &str) -> Option<String> {
        let pascal = pascal_case(tag);
        if let Some(name) = self
            .components
            .iter()
            .find(|name| name.as_str() == tag || **name == pascal)
        {
            return Some(name.clone());
        }
        if is_component_tag(tag) {
            warn!(tag, "unknown sub-component rendered unresolved");
            return Some(tag.to_string());
        }
        None
    }

    fn element(&mut self, element: &ElementNode, scope: &Rc<Scope>) -> EvalResult<VNode> {
        let component = self.resolve_component(&element.tag);
        let mut classes: Vec<String> = Vec::new();
        let mut styles: Vec<String> = Vec::new();
        let mut values: Vec<(String, Value)> = Vec::new();

        for attr in &element.attrs {
            match attr {
                AttrNode::Static { name, value } => {
                    push_attr(&mut classes, &mut styles, &mut values, name, Value::string(value))
                }
                AttrNode::Bound { name, expr } => {
                    let value = self.eval(expr, scope)?;
                    push_attr(&mut classes, &mut styles, &mut values, name, value);
                }
                AttrNode::Spread(expr) => {
                    let object = self.eval(expr, scope)?;
                    for key in enumerable_keys(&object) {
                        let value = self.interp.get_property(&object, &key)?;
                        push_attr(&mut classes, &mut styles, &mut values, &key, value);
                    }
                }
            }
        }
        if let Some(show) = &element.show {
            if !self.eval(show, scope)?.is_truthy() {
                styles.push("display: none".to_string());
            }
        }

        let mut events = BTreeMap::new();
        for (name, handler) in &element.events {
            events.insert(name.clone(), self.handlers.len());
            self.handlers.push(BoundHandler {
                handler: *handler,
                scope: Rc::clone(scope),
            });
        }

        let mut children = Vec::new();
        for child in &element.children {
            self.node(child, scope, &mut children)?;
        }

        let class = classes.into_iter().filter(|c| !c.is_empty()).collect::<Vec<_>>().join(" ");
        let style = styles.into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>().join("; ");

        if let Some(name) = component {
            let mut props = serde_json::Map::new();
            if !class.is_empty() {
                props.insert("class".to_string(), class.into());
            }
            if !style.is_empty() {
                props.insert("style".to_string(), style.into());
            }
            for (key, value) in values {
                props.insert(camel_case(&key), value.to_json());
            }
            return Ok(VNode::Component {
                name,
                props,
                events,
                children,
            });
        }

        let mut attrs = BTreeMap::new();
        if !class.is_empty() {
            attrs.insert("class".to_string(), class);
        }
        if !style.is_empty() {
            attrs.insert("style".to_string(), style);
        }
        for (key, value) in values {
            match value {
                Value::Undefined | Value::Null | Value::Bool(false) => {
                    attrs.remove(&key);
                }
                Value::Bool(true) => {
                    attrs.insert(key, String::new());
                }
                other => {
                    attrs.insert(key, other.to_js_string());
                }
            }
        }
        Ok(VNode::Element {
            tag: element.tag.clone(),
            attrs,
            events,
            children,
        })
    }
}

fn push_attr(
    classes: &mut Vec<String>,
    styles: &mut Vec<String>,
    values: &mut Vec<(String, Value)>,
    name: &str,
    value: Value,
) {
    match name {
        "class" => classes.push(normalize_class(&value)),
        "style" => styles.push(normalize_style(&value)),
        _ => values.push((name.to_string(), value)),
    }
}

/// `"a b"`, `["a", { b: true }]` and `{ a: true, b: false }` forms.
pub fn normalize_class(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .borrow()
            .iter()
            .map(normalize_class)
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(obj) => obj
            .entries()
            .into_iter()
            .filter(|(_, enabled)| enabled.is_truthy())
            .map(|(name, _)| name)
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Style strings, `{ fontSize: '12px' }` objects and arrays of either.
pub fn normalize_style(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().trim_end_matches(';').trim().to_string(),
        Value::Array(items) => items
            .borrow()
            .iter()
            .map(normalize_style)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; "),
        Value::Object(obj) => obj
            .entries()
            .into_iter()
            .filter(|(_, v)| !v.is_nullish() && !matches!(v, Value::String(s) if s.is_empty()))
            .map(|(name, v)| format!("{}: {}", kebab_case(&name), v.to_js_string()))
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::new(),
    }
}

fn kebab_case(name: &str) -> String {
    if name.starts_with("--") {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '-' {
            upper = true;
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn pascal_case(name: &str) -> String {
    let camel = camel_case(name);
    let mut chars = camel.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => camel,
    }
}
