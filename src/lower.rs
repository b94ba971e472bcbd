//! Lowering from the oxc AST into the owned logic tree.
//!
//! Anything outside the supported subset is rejected here, before the
//! sandbox ever sees it.

use oxc_allocator::Allocator;
use oxc_ast::ast::{
    Argument, ArrayExpressionElement, AssignmentTarget, BindingPattern, CallExpression,
    ChainElement, ComputedMemberExpression, Expression, FormalParameters, ForStatementInit,
    ForStatementLeft, Function, ObjectPropertyKind, PropertyKey, PropertyKind,
    SimpleAssignmentTarget, Statement, StaticMemberExpression, VariableDeclaration,
    VariableDeclarationKind,
};
use oxc_parser::{ParseOptions, Parser};
use oxc_span::SourceType;
use oxc_syntax::operator::{
    AssignmentOperator, BinaryOperator, LogicalOperator, UnaryOperator, UpdateOperator,
};
use std::cell::Cell;
use std::fmt::Display;
use std::rc::Rc;
use thiserror::Error;

use crate::ast::{
    ArrayItem, AssignOp, BinaryOp, Block, DeclKind, Expr, FunctionDef, Literal, LogicalOp,
    MemberProp, Pattern, PropKey, PropertyDef, Stmt, SwitchCase, Target, UnaryOp, UpdateOp,
};
use crate::value::number_to_string;

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LowerError {
    pub message: String,
}

impl LowerError {
    fn unsupported(what: &str) -> Self {
        Self {
            message: format!("{} not supported in node logic", what),
        }
    }
}

type LowerResult<T> = Result<T, LowerError>;

/// Deepest bracket, operator or statement nesting accepted from user text.
pub const MAX_NESTING_DEPTH: usize = 64;

fn too_deep() -> LowerError {
    LowerError::unsupported(&format!("nesting deeper than {} levels is", MAX_NESTING_DEPTH))
}

/// Native stack lowering may use below its outermost frame.
const LOWER_STACK_BUDGET: usize = 1 << 20;

thread_local! {
    static LOWER_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LOWER_STACK_BASE: Cell<usize> = const { Cell::new(0) };
}

/// One level of lowering recursion; released on drop.
struct DepthGuard;

impl DepthGuard {
    fn enter() -> LowerResult<Self> {
        let marker = 0u8;
        let here = std::ptr::addr_of!(marker) as usize;
        let depth = LOWER_DEPTH.with(Cell::get);
        if depth == 0 {
            LOWER_STACK_BASE.with(|base| base.set(here));
        } else if depth >= MAX_NESTING_DEPTH
            || LOWER_STACK_BASE.with(Cell::get).abs_diff(here) > LOWER_STACK_BUDGET
        {
            return Err(too_deep());
        }
        LOWER_DEPTH.with(|cell| cell.set(depth + 1));
        Ok(DepthGuard)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        LOWER_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

const PREFIX_KEYWORDS: [&str; 6] = ["typeof", "void", "delete", "new", "await", "yield"];

/// Running nesting count for [`check_nesting`].
struct NestingScan {
    /// Chain count per open bracket; the first entry is the top level.
    frames: Vec<usize>,
    /// Frame count at each open `${`.
    substitutions: Vec<usize>,
    depth: usize,
}

impl NestingScan {
    fn new() -> Self {
        Self {
            frames: vec![0],
            substitutions: Vec::new(),
            depth: 0,
        }
    }

    fn open(&mut self) -> LowerResult<()> {
        self.frames.push(0);
        self.depth += 1;
        self.check()
    }

    fn open_substitution(&mut self) -> LowerResult<()> {
        self.open()?;
        self.substitutions.push(self.frames.len());
        Ok(())
    }

    /// True when the next `}` ends a template substitution.
    fn in_substitution(&self) -> bool {
        self.substitutions.last() == Some(&self.frames.len())
    }

    fn close(&mut self) {
        if self.in_substitution() {
            self.substitutions.pop();
        }
        if self.frames.len() > 1 {
            let chained = self.frames.pop().unwrap_or(0);
            self.depth -= chained + 1;
        }
    }

    fn chain(&mut self) -> LowerResult<()> {
        if let Some(count) = self.frames.last_mut() {
            *count += 1;
        }
        self.depth += 1;
        self.check()
    }

    fn reset(&mut self) {
        if let Some(count) = self.frames.last_mut() {
            self.depth -= *count;
            *count = 0;
        }
    }

    fn check(&self) -> LowerResult<()> {
        if self.depth > MAX_NESTING_DEPTH {
            return Err(too_deep());
        }
        Ok(())
    }
}

/// Rough nesting estimate taken before parsing, since the parser recurses on
/// brackets, prefix operators and right-associative chains. Chain counts
/// reset at `;`, `,` and line breaks that end an expression.
fn check_nesting(source: &str) -> LowerResult<()> {
    let chars: Vec<char> = source.chars().collect();
    let mut scan = NestingScan::new();
    let mut prev: Option<char> = None;
    let mut line_break = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c.is_whitespace() {
            line_break |= c == '\n';
            i += 1;
            continue;
        }
        if c == '/' && next == Some('/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && next == Some('*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                line_break |= chars[i] == '\n';
                i += 1;
            }
            i += 2;
            continue;
        }
        if line_break {
            line_break = false;
            if !expects_operand(prev) && !continues_expression(c) {
                scan.reset();
            }
        }

        match c {
            '\'' | '"' => {
                i = skip_string(&chars, i + 1, c);
                prev = Some('"');
                continue;
            }
            '`' | '}' if c == '`' || scan.in_substitution() => {
                if c == '}' {
                    scan.close();
                }
                let (end, substitution) = skip_template(&chars, i + 1);
                i = end;
                if substitution {
                    scan.open_substitution()?;
                    prev = Some('(');
                } else {
                    prev = Some('"');
                }
                continue;
            }
            '/' if expects_operand(prev) => {
                i = skip_regex(&chars, i + 1);
                prev = Some('"');
                continue;
            }
            '(' | '[' | '{' => scan.open()?,
            ')' | ']' | '}' => scan.close(),
            ';' | ',' => scan.reset(),
            '=' => {
                let before = i.checked_sub(1).map(|j| chars[j]);
                if next != Some('=') && !matches!(before, Some('=' | '!' | '<' | '>')) {
                    scan.chain()?;
                }
            }
            '?' => {
                if !matches!(next, Some('.' | '?')) && prev != Some('?') {
                    scan.chain()?;
                }
            }
            '!' | '~' => {
                if next != Some('=') {
                    scan.chain()?;
                }
            }
            '+' | '-' => scan.chain()?,
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if PREFIX_KEYWORDS.contains(&word.as_str()) {
                    scan.chain()?;
                }
                prev = Some('a');
                continue;
            }
            _ => {}
        }
        prev = Some(c);
        i += 1;
    }
    Ok(())
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// True when the previous significant character leaves an operand pending.
fn expects_operand(prev: Option<char>) -> bool {
    match prev {
        None => true,
        Some(c) => "=?:!~+-*/%&|^<>,;([{".contains(c),
    }
}

fn continues_expression(c: char) -> bool {
    "=?:.+-*/%&|^<>,".contains(c)
}

fn skip_string(chars: &[char], mut i: usize, quote: char) -> usize {
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == quote || c == '\n' => return i + 1,
            _ => i += 1,
        }
    }
    i
}

/// Scans template text; returns the index after the closing backtick or
/// after an opening `${`, and whether it stopped at `${`.
fn skip_template(chars: &[char], mut i: usize) -> (usize, bool) {
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '`' => return (i + 1, false),
            '$' if chars.get(i + 1) == Some(&'{') => return (i + 2, true),
            _ => i += 1,
        }
    }
    (i, false)
}

fn skip_regex(chars: &[char], mut i: usize) -> usize {
    let mut in_class = false;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '[' => {
                in_class = true;
                i += 1;
            }
            ']' => {
                in_class = false;
                i += 1;
            }
            '/' if !in_class => {
                i += 1;
                break;
            }
            '\n' => break,
            _ => i += 1,
        }
    }
    while i < chars.len() && chars[i].is_alphabetic() {
        i += 1;
    }
    i
}

fn first_message<E: Display>(errors: &[E]) -> String {
    errors
        .first()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "syntax error".to_string())
}

/// Parse a function body. Top-level `return` is allowed.
pub fn parse_program(source: &str) -> LowerResult<Block> {
    check_nesting(source)?;
    let allocator = Allocator::default();
    let options = ParseOptions {
        allow_return_outside_function: true,
        ..ParseOptions::default()
    };
    let ret = Parser::new(&allocator, source, SourceType::default())
        .with_options(options)
        .parse();
    if ret.panicked || !ret.errors.is_empty() {
        return Err(LowerError {
            message: first_message(&ret.errors),
        });
    }
    lower_block(&ret.program.body)
}

/// Parse a single expression, as used by template bindings.
pub fn parse_expression(source: &str) -> LowerResult<Expr> {
    check_nesting(source)?;
    let allocator = Allocator::default();
    match Parser::new(&allocator, source, SourceType::default()).parse_expression() {
        Ok(expr) => lower_expr(&expr),
        Err(errors) => Err(LowerError {
            message: first_message(&errors),
        }),
    }
}

fn lower_block(statements: &[Statement<'_>]) -> LowerResult<Block> {
    statements.iter().map(lower_statement).collect()
}

fn lower_statement(stmt: &Statement<'_>) -> LowerResult<Stmt> {
    let _depth = DepthGuard::enter()?;
    Ok(match stmt {
        Statement::ExpressionStatement(s) => Stmt::Expr(lower_expr(&s.expression)?),
        Statement::VariableDeclaration(decl) => lower_declaration(decl)?,
        Statement::FunctionDeclaration(func) => Stmt::Function(Rc::new(lower_function(func, None)?)),
        Statement::ReturnStatement(s) => Stmt::Return(s.argument.as_ref().map(lower_expr).transpose()?),
        Statement::IfStatement(s) => Stmt::If {
            test: lower_expr(&s.test)?,
            consequent: Box::new(lower_statement(&s.consequent)?),
            alternate: s
                .alternate
                .as_ref()
                .map(|alt| lower_statement(alt).map(Box::new))
                .transpose()?,
        },
        Statement::BlockStatement(b) => Stmt::Block(lower_block(&b.body)?),
        Statement::ForStatement(s) => {
            let init = match &s.init {
                None => None,
                Some(ForStatementInit::VariableDeclaration(decl)) => {
                    Some(Box::new(lower_declaration(decl)?))
                }
                Some(other) => match other.as_expression() {
                    Some(expr) => Some(Box::new(Stmt::Expr(lower_expr(expr)?))),
                    None => return Err(LowerError::unsupported("this for-loop initializer is")),
                },
            };
            Stmt::For {
                init,
                test: s.test.as_ref().map(lower_expr).transpose()?,
                update: s.update.as_ref().map(lower_expr).transpose()?,
                body: Box::new(lower_statement(&s.body)?),
            }
        }
        Statement::ForOfStatement(s) => {
            if s.r#await {
                return Err(LowerError::unsupported("`for await` is"));
            }
            let (kind, binding) = lower_for_left(&s.left)?;
            Stmt::ForOf {
                kind,
                binding,
                iterable: lower_expr(&s.right)?,
                body: Box::new(lower_statement(&s.body)?),
            }
        }
        Statement::ForInStatement(s) => {
            let (kind, binding) = lower_for_left(&s.left)?;
            Stmt::ForIn {
                kind,
                binding,
                object: lower_expr(&s.right)?,
                body: Box::new(lower_statement(&s.body)?),
            }
        }
        Statement::WhileStatement(s) => Stmt::While {
            test: lower_expr(&s.test)?,
            body: Box::new(lower_statement(&s.body)?),
        },
        Statement::DoWhileStatement(s) => Stmt::DoWhile {
            body: Box::new(lower_statement(&s.body)?),
            test: lower_expr(&s.test)?,
        },
        Statement::SwitchStatement(s) => Stmt::Switch {
            discriminant: lower_expr(&s.discriminant)?,
            cases: s
                .cases
                .iter()
                .map(|case| {
                    Ok(SwitchCase {
                        test: case.test.as_ref().map(lower_expr).transpose()?,
                        body: lower_block(&case.consequent)?,
                    })
                })
                .collect::<LowerResult<_>>()?,
        },
        Statement::BreakStatement(s) => {
            if s.label.is_some() {
                return Err(LowerError::unsupported("labelled `break` is"));
            }
            Stmt::Break
        }
        Statement::ContinueStatement(s) => {
            if s.label.is_some() {
                return Err(LowerError::unsupported("labelled `continue` is"));
            }
            Stmt::Continue
        }
        Statement::ThrowStatement(s) => Stmt::Throw(lower_expr(&s.argument)?),
        Statement::TryStatement(s) => {
            let (param, handler) = match &s.handler {
                Some(clause) => (
                    clause
                        .param
                        .as_ref()
                        .map(|p| lower_pattern(&p.pattern))
                        .transpose()?,
                    Some(lower_block(&clause.body.body)?),
                ),
                None => (None, None),
            };
            Stmt::Try {
                block: lower_block(&s.block.body)?,
                param,
                handler,
                finalizer: s
                    .finalizer
                    .as_ref()
                    .map(|f| lower_block(&f.body))
                    .transpose()?,
            }
        }
        Statement::EmptyStatement(_) => Stmt::Empty,
        Statement::ImportDeclaration(_) => {
            return Err(LowerError::unsupported("module imports are"));
        }
        Statement::ExportDefaultDeclaration(_)
        | Statement::ExportNamedDeclaration(_)
        | Statement::ExportAllDeclaration(_) => {
            return Err(LowerError::unsupported("named exports are"));
        }
        Statement::ClassDeclaration(_) => {
            return Err(LowerError::unsupported("class declarations are"));
        }
        _ => return Err(LowerError::unsupported("this statement is")),
    })
}

fn lower_declaration(decl: &VariableDeclaration<'_>) -> LowerResult<Stmt> {
    let kind = lower_decl_kind(decl.kind)?;
    let declarations = decl
        .declarations
        .iter()
        .map(|d| Ok((lower_pattern(&d.id)?, d.init.as_ref().map(lower_expr).transpose()?)))
        .collect::<LowerResult<_>>()?;
    Ok(Stmt::Declare { kind, declarations })
}

fn lower_decl_kind(kind: VariableDeclarationKind) -> LowerResult<DeclKind> {
    match kind {
        VariableDeclarationKind::Var => Ok(DeclKind::Var),
        VariableDeclarationKind::Let => Ok(DeclKind::Let),
        VariableDeclarationKind::Const => Ok(DeclKind::Const),
        _ => Err(LowerError::unsupported("`using` declarations are")),
    }
}

fn lower_for_left(left: &ForStatementLeft<'_>) -> LowerResult<(DeclKind, Pattern)> {
    match left {
        ForStatementLeft::VariableDeclaration(decl) => {
            let kind = lower_decl_kind(decl.kind)?;
            match decl.declarations.first() {
                Some(d) => Ok((kind, lower_pattern(&d.id)?)),
                None => Err(LowerError::unsupported("an empty loop binding is")),
            }
        }
        _ => Err(LowerError::unsupported(
            "loop targets other than `const`/`let` declarations are",
        )),
    }
}

fn lower_pattern(pattern: &BindingPattern<'_>) -> LowerResult<Pattern> {
    let _depth = DepthGuard::enter()?;
    Ok(match pattern {
        BindingPattern::BindingIdentifier(id) => Pattern::Identifier(id.name.to_string()),
        BindingPattern::ObjectPattern(obj) => Pattern::Object {
            properties: obj
                .properties
                .iter()
                .map(|p| Ok((lower_prop_key(&p.key, p.computed)?, lower_pattern(&p.value)?)))
                .collect::<LowerResult<_>>()?,
            rest: obj
                .rest
                .as_ref()
                .map(|r| lower_pattern(&r.argument).map(Box::new))
                .transpose()?,
        },
        BindingPattern::ArrayPattern(arr) => Pattern::Array {
            elements: arr
                .elements
                .iter()
                .map(|e| e.as_ref().map(lower_pattern).transpose())
                .collect::<LowerResult<_>>()?,
            rest: arr
                .rest
                .as_ref()
                .map(|r| lower_pattern(&r.argument).map(Box::new))
                .transpose()?,
        },
        BindingPattern::AssignmentPattern(assign) => Pattern::Default {
            target: Box::new(lower_pattern(&assign.left)?),
            default: lower_expr(&assign.right)?,
        },
    })
}

fn lower_prop_key(key: &PropertyKey<'_>, computed: bool) -> LowerResult<PropKey> {
    if computed {
        return match key.as_expression() {
            Some(expr) => Ok(PropKey::Computed(lower_expr(expr)?)),
            None => Err(LowerError::unsupported("private keys are")),
        };
    }
    match key {
        PropertyKey::StaticIdentifier(id) => Ok(PropKey::Static(id.name.to_string())),
        PropertyKey::StringLiteral(s) => Ok(PropKey::Static(s.value.to_string())),
        PropertyKey::NumericLiteral(n) => Ok(PropKey::Static(number_to_string(n.value))),
        _ => Err(LowerError::unsupported("this property key is")),
    }
}

fn lower_function(func: &Function<'_>, inferred_name: Option<&str>) -> LowerResult<FunctionDef> {
    if func.generator || func.r#async {
        return Err(LowerError::unsupported("async and generator functions are"));
    }
    let (params, rest) = lower_params(&func.params)?;
    let body = match &func.body {
        Some(body) => lower_block(&body.statements)?,
        None => Vec::new(),
    };
    Ok(FunctionDef {
        name: func
            .id
            .as_ref()
            .map(|id| id.name.to_string())
            .or_else(|| inferred_name.map(str::to_string)),
        params,
        rest,
        body,
        arrow: false,
    })
}

fn lower_params(params: &FormalParameters<'_>) -> LowerResult<(Vec<Pattern>, Option<Pattern>)> {
    let items = params
        .items
        .iter()
        .map(|p| lower_pattern(&p.pattern))
        .collect::<LowerResult<Vec<_>>>()?;
    let rest = params
        .rest
        .as_ref()
        .map(|r| lower_pattern(&r.rest.argument))
        .transpose()?;
    Ok((items, rest))
}

fn lower_expr(expr: &Expression<'_>) -> LowerResult<Expr> {
    let _depth = DepthGuard::enter()?;
    Ok(match expr {
        Expression::BooleanLiteral(b) => Expr::Literal(Literal::Bool(b.value)),
        Expression::NullLiteral(_) => Expr::Literal(Literal::Null),
        Expression::NumericLiteral(n) => Expr::Literal(Literal::Number(n.value)),
        Expression::StringLiteral(s) => Expr::Literal(Literal::String(s.value.to_string())),
        Expression::TemplateLiteral(t) => Expr::Template {
            quasis: t
                .quasis
                .iter()
                .map(|q| {
                    q.value
                        .cooked
                        .as_ref()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| q.value.raw.to_string())
                })
                .collect(),
            expressions: t.expressions.iter().map(lower_expr).collect::<LowerResult<_>>()?,
        },
        Expression::Identifier(id) => {
            if id.name == "undefined" {
                Expr::Literal(Literal::Undefined)
            } else {
                Expr::Identifier(id.name.to_string())
            }
        }
        Expression::ThisExpression(_) => Expr::This,
        Expression::ArrayExpression(arr) => Expr::Array(
            arr.elements
                .iter()
                .map(lower_array_element)
                .collect::<LowerResult<_>>()?,
        ),
        Expression::ObjectExpression(obj) => {
            let mut defs = Vec::with_capacity(obj.properties.len());
            for prop in &obj.properties {
                match prop {
                    ObjectPropertyKind::ObjectProperty(p) => {
                        if !matches!(p.kind, PropertyKind::Init) {
                            return Err(LowerError::unsupported("getters and setters are"));
                        }
                        let key = lower_prop_key(&p.key, p.computed)?;
                        let inferred = match &key {
                            PropKey::Static(name) => Some(name.as_str()),
                            PropKey::Computed(_) => None,
                        };
                        let value = match &p.value {
                            Expression::FunctionExpression(func) => {
                                Expr::Function(Rc::new(lower_function(func, inferred)?))
                            }
                            other => lower_expr(other)?,
                        };
                        defs.push(PropertyDef::Init { key, value });
                    }
                    ObjectPropertyKind::SpreadProperty(s) => {
                        defs.push(PropertyDef::Spread(lower_expr(&s.argument)?));
                    }
                }
            }
            Expr::Object(defs)
        }
        Expression::FunctionExpression(func) => Expr::Function(Rc::new(lower_function(func, None)?)),
        Expression::ArrowFunctionExpression(arrow) => {
            if arrow.r#async {
                return Err(LowerError::unsupported("async functions are"));
            }
            let (params, rest) = lower_params(&arrow.params)?;
            let mut body = lower_block(&arrow.body.statements)?;
            // `x => x + 1` arrives as a single expression statement
            if arrow.expression && matches!(body.as_slice(), [Stmt::Expr(_)]) {
                if let Some(Stmt::Expr(value)) = body.pop() {
                    body.push(Stmt::Return(Some(value)));
                }
            }
            Expr::Function(Rc::new(FunctionDef {
                name: None,
                params,
                rest,
                body,
                arrow: true,
            }))
        }
        Expression::UnaryExpression(u) => match u.operator {
            UnaryOperator::Delete => Expr::Delete(lower_expr_target(&u.argument)?),
            op => Expr::Unary {
                op: lower_unary_op(op),
                argument: Box::new(lower_expr(&u.argument)?),
            },
        },
        Expression::BinaryExpression(b) => Expr::Binary {
            op: lower_binary_op(b.operator)?,
            left: Box::new(lower_expr(&b.left)?),
            right: Box::new(lower_expr(&b.right)?),
        },
        Expression::LogicalExpression(l) => Expr::Logical {
            op: lower_logical_op(l.operator),
            left: Box::new(lower_expr(&l.left)?),
            right: Box::new(lower_expr(&l.right)?),
        },
        Expression::ConditionalExpression(c) => Expr::Conditional {
            test: Box::new(lower_expr(&c.test)?),
            consequent: Box::new(lower_expr(&c.consequent)?),
            alternate: Box::new(lower_expr(&c.alternate)?),
        },
        Expression::AssignmentExpression(a) => Expr::Assign {
            op: lower_assign_op(a.operator),
            target: lower_assignment_target(&a.left)?,
            value: Box::new(lower_expr(&a.right)?),
        },
        Expression::UpdateExpression(u) => Expr::Update {
            op: match u.operator {
                UpdateOperator::Increment => UpdateOp::Increment,
                UpdateOperator::Decrement => UpdateOp::Decrement,
            },
            prefix: u.prefix,
            target: lower_simple_target(&u.argument)?,
        },
        Expression::StaticMemberExpression(m) => lower_static_member(m)?,
        Expression::ComputedMemberExpression(m) => lower_computed_member(m)?,
        Expression::CallExpression(c) => lower_call(c)?,
        Expression::ChainExpression(chain) => Expr::Chain(Box::new(match &chain.expression {
            ChainElement::CallExpression(c) => lower_call(c)?,
            ChainElement::StaticMemberExpression(m) => lower_static_member(m)?,
            ChainElement::ComputedMemberExpression(m) => lower_computed_member(m)?,
            _ => return Err(LowerError::unsupported("this optional chain is")),
        })),
        Expression::ParenthesizedExpression(p) => lower_expr(&p.expression)?,
        Expression::SequenceExpression(s) => Expr::Sequence(
            s.expressions
                .iter()
                .map(lower_expr)
                .collect::<LowerResult<_>>()?,
        ),
        Expression::NewExpression(_) => return Err(LowerError::unsupported("`new` is")),
        Expression::ClassExpression(_) => {
            return Err(LowerError::unsupported("class expressions are"));
        }
        Expression::AwaitExpression(_) | Expression::YieldExpression(_) => {
            return Err(LowerError::unsupported("async functions and generators are"));
        }
        Expression::RegExpLiteral(_) => {
            return Err(LowerError::unsupported("regular expression literals are"));
        }
        Expression::BigIntLiteral(_) => return Err(LowerError::unsupported("BigInt literals are")),
        Expression::TaggedTemplateExpression(_) => {
            return Err(LowerError::unsupported("tagged templates are"));
        }
        Expression::ImportExpression(_) => {
            return Err(LowerError::unsupported("dynamic imports are"));
        }
        _ => return Err(LowerError::unsupported("this expression is")),
    })
}

fn lower_static_member(m: &StaticMemberExpression<'_>) -> LowerResult<Expr> {
    Ok(Expr::Member {
        object: Box::new(lower_expr(&m.object)?),
        property: MemberProp::Static(m.property.name.to_string()),
        optional: m.optional,
    })
}

fn lower_computed_member(m: &ComputedMemberExpression<'_>) -> LowerResult<Expr> {
    Ok(Expr::Member {
        object: Box::new(lower_expr(&m.object)?),
        property: MemberProp::Computed(Box::new(lower_expr(&m.expression)?)),
        optional: m.optional,
    })
}

fn lower_call(call: &CallExpression<'_>) -> LowerResult<Expr> {
    let arguments = call
        .arguments
        .iter()
        .map(|arg| match arg {
            Argument::SpreadElement(s) => Ok(ArrayItem::Spread(lower_expr(&s.argument)?)),
            other => match other.as_expression() {
                Some(expr) => Ok(ArrayItem::Item(lower_expr(expr)?)),
                None => Err(LowerError::unsupported("this call argument is")),
            },
        })
        .collect::<LowerResult<_>>()?;
    Ok(Expr::Call {
        callee: Box::new(lower_expr(&call.callee)?),
        arguments,
        optional: call.optional,
    })
}

fn lower_array_element(element: &ArrayExpressionElement<'_>) -> LowerResult<ArrayItem> {
    match element {
        ArrayExpressionElement::SpreadElement(s) => Ok(ArrayItem::Spread(lower_expr(&s.argument)?)),
        ArrayExpressionElement::Elision(_) => Ok(ArrayItem::Hole),
        other => match other.as_expression() {
            Some(expr) => Ok(ArrayItem::Item(lower_expr(expr)?)),
            None => Err(LowerError::unsupported("this array element is")),
        },
    }
}

fn lower_expr_target(expr: &Expression<'_>) -> LowerResult<Target> {
    match expr {
        Expression::StaticMemberExpression(m) => Ok(Target::Member {
            object: Box::new(lower_expr(&m.object)?),
            property: MemberProp::Static(m.property.name.to_string()),
        }),
        Expression::ComputedMemberExpression(m) => Ok(Target::Member {
            object: Box::new(lower_expr(&m.object)?),
            property: MemberProp::Computed(Box::new(lower_expr(&m.expression)?)),
        }),
        _ => Err(LowerError::unsupported("`delete` of a non-member is")),
    }
}

fn lower_assignment_target(target: &AssignmentTarget<'_>) -> LowerResult<Target> {
    match target {
        AssignmentTarget::AssignmentTargetIdentifier(id) => Ok(Target::Identifier(id.name.to_string())),
        AssignmentTarget::StaticMemberExpression(m) => Ok(Target::Member {
            object: Box::new(lower_expr(&m.object)?),
            property: MemberProp::Static(m.property.name.to_string()),
        }),
        AssignmentTarget::ComputedMemberExpression(m) => Ok(Target::Member {
            object: Box::new(lower_expr(&m.object)?),
            property: MemberProp::Computed(Box::new(lower_expr(&m.expression)?)),
        }),
        _ => Err(LowerError::unsupported("destructuring assignment is")),
    }
}

fn lower_simple_target(target: &SimpleAssignmentTarget<'_>) -> LowerResult<Target> {
    match target {
        SimpleAssignmentTarget::AssignmentTargetIdentifier(id) => {
            Ok(Target::Identifier(id.name.to_string()))
        }
        SimpleAssignmentTarget::StaticMemberExpression(m) => Ok(Target::Member {
            object: Box::new(lower_expr(&m.object)?),
            property: MemberProp::Static(m.property.name.to_string()),
        }),
        SimpleAssignmentTarget::ComputedMemberExpression(m) => Ok(Target::Member {
            object: Box::new(lower_expr(&m.object)?),
            property: MemberProp::Computed(Box::new(lower_expr(&m.expression)?)),
        }),
        _ => Err(LowerError::unsupported("this update target is")),
    }
}

fn lower_unary_op(op: UnaryOperator) -> UnaryOp {
    match op {
        UnaryOperator::UnaryNegation => UnaryOp::Neg,
        UnaryOperator::UnaryPlus => UnaryOp::Plus,
        UnaryOperator::LogicalNot => UnaryOp::Not,
        UnaryOperator::BitwiseNot => UnaryOp::BitNot,
        UnaryOperator::Typeof => UnaryOp::Typeof,
        // `delete` is lowered separately
        UnaryOperator::Void | UnaryOperator::Delete => UnaryOp::Void,
    }
}

fn lower_binary_op(op: BinaryOperator) -> LowerResult<BinaryOp> {
    Ok(match op {
        BinaryOperator::Equality => BinaryOp::Eq,
        BinaryOperator::Inequality => BinaryOp::NotEq,
        BinaryOperator::StrictEquality => BinaryOp::StrictEq,
        BinaryOperator::StrictInequality => BinaryOp::StrictNotEq,
        BinaryOperator::LessThan => BinaryOp::Lt,
        BinaryOperator::LessEqualThan => BinaryOp::LtE,
        BinaryOperator::GreaterThan => BinaryOp::Gt,
        BinaryOperator::GreaterEqualThan => BinaryOp::GtE,
        BinaryOperator::Addition => BinaryOp::Add,
        BinaryOperator::Subtraction => BinaryOp::Sub,
        BinaryOperator::Multiplication => BinaryOp::Mul,
        BinaryOperator::Division => BinaryOp::Div,
        BinaryOperator::Remainder => BinaryOp::Rem,
        BinaryOperator::Exponential => BinaryOp::Exp,
        BinaryOperator::ShiftLeft => BinaryOp::Shl,
        BinaryOperator::ShiftRight => BinaryOp::Shr,
        BinaryOperator::ShiftRightZeroFill => BinaryOp::UShr,
        BinaryOperator::BitwiseOR => BinaryOp::BitOr,
        BinaryOperator::BitwiseXOR => BinaryOp::BitXor,
        BinaryOperator::BitwiseAnd => BinaryOp::BitAnd,
        BinaryOperator::In => BinaryOp::In,
        _ => return Err(LowerError::unsupported("`instanceof` is")),
    })
}

fn lower_logical_op(op: LogicalOperator) -> LogicalOp {
    match op {
        LogicalOperator::Or => LogicalOp::Or,
        LogicalOperator::And => LogicalOp::And,
        LogicalOperator::Coalesce => LogicalOp::Coalesce,
    }
}

fn lower_assign_op(op: AssignmentOperator) -> AssignOp {
    match op {
        AssignmentOperator::Assign => AssignOp::Assign,
        AssignmentOperator::Addition => AssignOp::Binary(BinaryOp::Add),
        AssignmentOperator::Subtraction => AssignOp::Binary(BinaryOp::Sub),
        AssignmentOperator::Multiplication => AssignOp::Binary(BinaryOp::Mul),
        AssignmentOperator::Division => AssignOp::Binary(BinaryOp::Div),
        AssignmentOperator::Remainder => AssignOp::Binary(BinaryOp::Rem),
        AssignmentOperator::Exponential => AssignOp::Binary(BinaryOp::Exp),
        AssignmentOperator::ShiftLeft => AssignOp::Binary(BinaryOp::Shl),
        AssignmentOperator::ShiftRight => AssignOp::Binary(BinaryOp::Shr),
        AssignmentOperator::ShiftRightZeroFill => AssignOp::Binary(BinaryOp::UShr),
        AssignmentOperator::BitwiseOR => AssignOp::Binary(BinaryOp::BitOr),
        AssignmentOperator::BitwiseXOR => AssignOp::Binary(BinaryOp::BitXor),
        AssignmentOperator::BitwiseAnd => AssignOp::Binary(BinaryOp::BitAnd),
        AssignmentOperator::LogicalOr => AssignOp::Logical(LogicalOp::Or),
        AssignmentOperator::LogicalAnd => AssignOp::Logical(LogicalOp::And),
        AssignmentOperator::LogicalNullish => AssignOp::Logical(LogicalOp::Coalesce),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_return_is_allowed() {
        let body = parse_program("return { count: 1 };").unwrap();
        assert_eq!(body.len(), 1);
        assert!(matches!(&body[0], Stmt::Return(Some(Expr::Object(props))) if props.len() == 1));
    }

    #[test]
    fn test_method_names_are_inferred_from_keys() {
        let body = parse_program("return { data() { return {} } };").unwrap();
        let Stmt::Return(Some(Expr::Object(props))) = &body[0] else {
            panic!("expected object return");
        };
        let PropertyDef::Init { value: Expr::Function(def), .. } = &props[0] else {
            panic!("expected method");
        };
        assert_eq!(def.name.as_deref(), Some("data"));
    }

    #[test]
    fn test_arrow_expression_body_becomes_return() {
        let expr = parse_expression("x => x + 1").unwrap();
        let Expr::Function(def) = expr else {
            panic!("expected arrow");
        };
        assert!(def.arrow);
        assert!(matches!(def.body.as_slice(), [Stmt::Return(Some(_))]));
    }

    #[test]
    fn test_optional_chain_is_wrapped() {
        let expr = parse_expression("data?.label").unwrap();
        assert!(matches!(expr, Expr::Chain(_)));
    }

    #[test]
    fn test_rejects_unsupported_constructs() {
        assert!(parse_program("class Foo {}").is_err());
        assert!(parse_expression("new Date()").is_err());
        assert!(parse_program("async function f() {}").is_err());
    }

    #[test]
    fn test_deep_parentheses_are_rejected_before_parsing() {
        let source = format!("return {}1{};", "(".repeat(5000), ")".repeat(5000));
        let err = parse_program(&source).unwrap_err();
        assert!(err.message.contains("nesting deeper than"), "{}", err);
        let err = parse_expression(&format!("{}x{}", "[".repeat(5000), "]".repeat(5000))).unwrap_err();
        assert!(err.message.contains("nesting deeper than"));
    }

    #[test]
    fn test_deep_operator_chains_are_rejected() {
        assert!(parse_expression(&format!("{}x", "!".repeat(5000))).is_err());
        assert!(parse_program(&format!("{}1", "a = ".repeat(5000))).is_err());
        assert!(parse_expression(&format!("x{}", " ? x : x".repeat(5000))).is_err());
        // Left-associative chains parse flat and are caught while lowering.
        assert!(parse_expression(&format!("x{}", " * x".repeat(5000))).is_err());
        assert!(parse_expression(&format!("x{}", ".y".repeat(5000))).is_err());
    }

    #[test]
    fn test_ordinary_nesting_is_accepted() {
        let source = format!("return {}1{};", "(".repeat(40), ")".repeat(40));
        assert!(parse_program(&source).is_ok());
        let many_lines = "count = count + 1\n".repeat(500);
        assert!(parse_program(&many_lines).is_ok());
        let many_statements = "x = -1; y = !x;".repeat(500);
        assert!(parse_program(&many_statements).is_ok());
        assert!(parse_expression("`a${ `b${ [1, 2] }` }c` + '((('").is_ok());
        assert!(parse_program("const s = `${ a }(((` + '[[['; // (((\nreturn s;").is_ok());
    }

    #[test]
    fn test_syntax_errors_surface_parser_message() {
        let err = parse_program("return {").unwrap_err();
        assert!(!err.message.is_empty());
    }
}
