//! Normalizes a logic block into a function body that returns component
//! options, then parses it into the owned statement tree.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use tracing::debug;

use crate::ast::{Block, Expr, Stmt};
use crate::error::CompileError;
use crate::lower::parse_program;

lazy_static! {
    // `import 'x'` and `import ... from 'x'`, specifier lists may span lines
    static ref IMPORT_REGEX: Regex = Regex::new(
        r#"(?m)^[ \t]*import(?:\s*['"][^'"\n]*['"]|(?:\s+|\s*[{*])[^;]*?\bfrom\s*['"][^'"\n]*['"])[ \t]*;?"#
    )
    .unwrap();
    static ref EXPORT_DEFAULT_REGEX: Regex = Regex::new(r"\bexport\s+default\b").unwrap();
}

/// Which rewrite rule produced the evaluable body. Checked in declaration
/// order after `Empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogicForm {
    Empty,
    ExportDefault,
    OptionsLiteral,
    Imperative,
}

impl fmt::Display for LogicForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogicForm::Empty => "empty",
            LogicForm::ExportDefault => "export-default",
            LogicForm::OptionsLiteral => "options-literal",
            LogicForm::Imperative => "imperative",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct EvaluableBody {
    pub form: LogicForm,
    /// The rewritten source the program was parsed from.
    pub source: String,
    pub program: Rc<Block>,
}

impl EvaluableBody {
    pub fn empty() -> Self {
        Self {
            form: LogicForm::Empty,
            source: String::new(),
            program: Rc::new(Vec::new()),
        }
    }
}

pub fn strip_imports(logic: &str) -> String {
    IMPORT_REGEX.replace_all(logic, "").into_owned()
}

/// Picks the rewrite rule for `logic` and returns the rewritten source.
pub fn rewrite(logic: &str) -> (LogicForm, String) {
    let stripped = strip_imports(logic);
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return (LogicForm::Empty, String::new());
    }
    if EXPORT_DEFAULT_REGEX.is_match(trimmed) {
        return (
            LogicForm::ExportDefault,
            EXPORT_DEFAULT_REGEX.replace(trimmed, "return").into_owned(),
        );
    }
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return (LogicForm::OptionsLiteral, format!("return (\n{}\n);", trimmed));
    }
    (
        LogicForm::Imperative,
        format!("return {{ setup() {{\n{}\n}} }};", trimmed),
    )
}

pub fn transform(logic: &str) -> Result<EvaluableBody, CompileError> {
    let (form, source) = rewrite(logic);
    debug!(%form, "detected logic form");
    if form == LogicForm::Empty {
        return Ok(EvaluableBody::empty());
    }

    let program = parse_program(&source).map_err(|err| CompileError::UnsupportedLogicShape {
        form,
        message: err.message,
    })?;

    if form == LogicForm::OptionsLiteral
        && !matches!(program.as_slice(), [Stmt::Return(Some(Expr::Object(_)))])
    {
        return Err(CompileError::UnsupportedLogicShape {
            form,
            message: "a bare options block must be a single object literal".to_string(),
        });
    }

    Ok(EvaluableBody {
        form,
        source,
        program: Rc::new(program),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_imports() {
        let logic = "import { ref,\n  computed } from 'vue';\nimport './style.css'\nimport * as V from \"vue\";\nconst x = 1;";
        assert_eq!(strip_imports(logic).trim(), "const x = 1;");
    }

    #[test]
    fn test_identifiers_starting_with_import_survive() {
        let logic = "importance = 2; const f = 'from \"x\"';";
        assert_eq!(strip_imports(logic), logic);
    }

    #[test]
    fn test_export_default_wins_over_object_literal() {
        let (form, source) = rewrite("{ a: 1 }\nexport default { b: 2 }");
        assert_eq!(form, LogicForm::ExportDefault);
        assert!(source.contains("return { b: 2 }"));
    }

    #[test]
    fn test_options_literal_form() {
        let body = transform("{ data() { return { n: 1 } } }").unwrap();
        assert_eq!(body.form, LogicForm::OptionsLiteral);
        assert_eq!(body.program.len(), 1);
    }

    #[test]
    fn test_imperative_form_wraps_setup() {
        let (form, source) = rewrite("const count = ref(0);");
        assert_eq!(form, LogicForm::Imperative);
        assert!(source.starts_with("return { setup() {"));
        assert!(transform("const count = ref(0);").is_ok());
    }

    #[test]
    fn test_empty_after_import_stripping() {
        let body = transform("import { ref } from 'vue';\n").unwrap();
        assert_eq!(body.form, LogicForm::Empty);
        assert!(body.program.is_empty());
    }

    #[test]
    fn test_malformed_logic_is_unsupported_shape() {
        let err = transform("{ a: 1 } stray(); {}").unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnsupportedLogicShape { form: LogicForm::OptionsLiteral, .. }
        ));
        let err = transform("export default class Foo {}").unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnsupportedLogicShape { form: LogicForm::ExportDefault, .. }
        ));
    }
}
