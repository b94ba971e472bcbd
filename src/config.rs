use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::interpreter::Limits;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilerOptions {
    /// Maximum nesting of user function calls.
    pub max_call_depth: usize,
    /// Statement budget for one run of user logic; `null` means unbounded.
    pub max_steps: Option<u64>,
    /// Reuse render routines for identical markup.
    pub cache_render_routines: bool,
    /// Most render routines kept; the least recently used is evicted.
    pub render_cache_capacity: usize,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            max_call_depth: limits.max_call_depth,
            max_steps: limits.max_steps,
            cache_render_routines: true,
            render_cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl CompilerOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_call_depth: self.max_call_depth,
            max_steps: self.max_steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let options = CompilerOptions::from_json(r#"{ "maxSteps": 5000 }"#).unwrap();
        assert_eq!(options.max_steps, Some(5000));
        assert_eq!(options.max_call_depth, 256);
        assert!(options.cache_render_routines);
        assert_eq!(options.render_cache_capacity, 64);
    }

    #[test]
    fn test_step_budget_is_on_by_default() {
        assert_eq!(CompilerOptions::default().max_steps, Some(1_000_000));
        let options = CompilerOptions::from_json(r#"{ "maxSteps": null }"#).unwrap();
        assert_eq!(options.max_steps, None);
    }

    #[test]
    fn test_rejects_unknown_shapes() {
        assert!(CompilerOptions::from_json(r#"{ "maxCallDepth": "deep" }"#).is_err());
    }
}
