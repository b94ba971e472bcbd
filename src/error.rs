use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transform::LogicForm;
use crate::value::RuntimeError;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_MISSING_MARKUP: &str = "NODE-ERR-MARKUP-001";
pub const ERR_UNSUPPORTED_LOGIC: &str = "NODE-ERR-LOGIC-001";
pub const ERR_LOGIC_EVALUATION: &str = "NODE-ERR-LOGIC-002";
pub const ERR_TEMPLATE_COMPILE: &str = "NODE-ERR-TEMPLATE-001";

fn get_guarantee(code: &str) -> &'static str {
    match code {
        ERR_MISSING_MARKUP => "Every custom node definition renders from a non-empty <template> block.",
        ERR_UNSUPPORTED_LOGIC => {
            "Logic is an `export default` object, a bare options object, or setup statements."
        }
        ERR_LOGIC_EVALUATION => "Node logic runs to completion before a component is produced.",
        ERR_TEMPLATE_COMPILE => "Templates are validated before any node logic runs.",
        _ => "Unknown error code.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILE ERROR
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure of one compile. No partial component is ever produced.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("missing markup: {reason}")]
    MissingMarkup { reason: String },

    #[error("unsupported logic shape ({form}): {message}")]
    UnsupportedLogicShape { form: LogicForm, message: String },

    #[error("logic evaluation failed: {source}")]
    LogicEvaluation {
        #[from]
        source: RuntimeError,
    },

    #[error("template compilation failed: {message}")]
    TemplateCompile { message: String },
}

impl CompileError {
    pub fn missing_markup(reason: impl Into<String>) -> Self {
        CompileError::MissingMarkup {
            reason: reason.into(),
        }
    }

    pub fn template(message: impl Into<String>) -> Self {
        CompileError::TemplateCompile {
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CompileError::MissingMarkup { .. } => ERR_MISSING_MARKUP,
            CompileError::UnsupportedLogicShape { .. } => ERR_UNSUPPORTED_LOGIC,
            CompileError::LogicEvaluation { .. } => ERR_LOGIC_EVALUATION,
            CompileError::TemplateCompile { .. } => ERR_TEMPLATE_COMPILE,
        }
    }

    /// The guarantee the failing check protects.
    pub fn hint(&self) -> &'static str {
        get_guarantee(self.code())
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            error_type: match self {
                CompileError::MissingMarkup { .. } => "MISSING_MARKUP",
                CompileError::UnsupportedLogicShape { .. } => "UNSUPPORTED_LOGIC_SHAPE",
                CompileError::LogicEvaluation { .. } => "LOGIC_EVALUATION",
                CompileError::TemplateCompile { .. } => "TEMPLATE_COMPILE",
            }
            .to_string(),
            message: self.to_string(),
            guarantee: self.hint().to_string(),
        }
    }
}

/// Serializable form of a [`CompileError`] for hosts that only see JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub code: String,
    pub error_type: String,
    pub message: String,
    pub guarantee: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(CompileError::missing_markup("empty").code(), "NODE-ERR-MARKUP-001");
        assert_eq!(CompileError::template("bad").code(), "NODE-ERR-TEMPLATE-001");
        let err: CompileError = RuntimeError::Reference("window".into()).into();
        assert_eq!(err.code(), "NODE-ERR-LOGIC-002");
    }

    #[test]
    fn test_evaluation_error_keeps_cause() {
        let err: CompileError = RuntimeError::type_error("x is not a function").into();
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("TypeError: x is not a function"));
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = CompileError::missing_markup("no <template> block").report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["errorType"], "MISSING_MARKUP");
        assert_eq!(json["code"], ERR_MISSING_MARKUP);
    }
}
