//! The compile pipeline: extract, render, transform, evaluate, assemble.

use std::cell::RefCell;
use std::fmt;
use tracing::debug;

use crate::assemble::{assemble, CompiledComponent};
use crate::cache::RenderCache;
use crate::capabilities::CapabilityWhitelist;
use crate::config::CompilerOptions;
use crate::error::CompileError;
use crate::evaluate::Sandbox;
use crate::extract::extract;
use crate::instance::{DataAccessor, InstanceData};
use crate::template::{HtmlTemplateCompiler, RenderRoutine, TemplateCompiler};
use crate::transform::transform;

pub struct NodeCompiler {
    options: CompilerOptions,
    sandbox: Sandbox,
    templates: Box<dyn TemplateCompiler>,
    cache: RefCell<RenderCache>,
}

impl fmt::Debug for NodeCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCompiler")
            .field("options", &self.options)
            .field("cached_routines", &self.cache.borrow().len())
            .finish()
    }
}

impl Default for NodeCompiler {
    fn default() -> Self {
        NodeCompiler::new(CompilerOptions::default())
    }
}

impl NodeCompiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self::with_parts(
            options,
            CapabilityWhitelist::standard(),
            Box::new(HtmlTemplateCompiler),
        )
    }

    /// Compiler with a custom capability whitelist and template compiler.
    pub fn with_parts(
        options: CompilerOptions,
        whitelist: CapabilityWhitelist,
        templates: Box<dyn TemplateCompiler>,
    ) -> Self {
        Self {
            sandbox: Sandbox::new(whitelist, options.limits()),
            cache: RefCell::new(RenderCache::with_capacity(options.render_cache_capacity)),
            options,
            templates,
        }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Compiles one definition. Markup is compiled before any logic runs,
    /// so a template error never reaches the evaluator.
    pub fn compile(
        &self,
        raw: &str,
        instance_data: &InstanceData,
        accessor: &DataAccessor,
    ) -> Result<CompiledComponent, CompileError> {
        let blocks = extract(raw)?;
        let render = self.render(&blocks.markup)?;
        let body = transform(&blocks.logic)?;
        let options = self.sandbox.evaluate(&body, instance_data, accessor)?;

        debug!(form = %body.form, "compiled custom node definition");
        Ok(assemble(options, render, instance_data, accessor).with_limits(self.options.limits()))
    }

    pub fn render(&self, markup: &str) -> Result<RenderRoutine, CompileError> {
        if !self.options.cache_render_routines {
            return self.templates.compile(markup);
        }
        self.cache
            .borrow_mut()
            .get_or_compile(markup, self.templates.as_ref())
    }

    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }

    pub fn cached_routines(&self) -> usize {
        self.cache.borrow().len()
    }
}

/// One-shot compile with default options.
pub fn compile_definition(
    raw: &str,
    instance_data: &InstanceData,
    accessor: &DataAccessor,
) -> Result<CompiledComponent, CompileError> {
    NodeCompiler::default().compile(raw, instance_data, accessor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> InstanceData {
        json!({ "id": "n1" }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_cache_is_used_across_compiles() {
        let compiler = NodeCompiler::default();
        let raw = "<template><p>{{ data.id }}</p></template>";
        compiler.compile(raw, &data(), &DataAccessor::empty()).unwrap();
        compiler.compile(raw, &data(), &DataAccessor::empty()).unwrap();
        assert_eq!(compiler.cached_routines(), 1);
        compiler.clear_cache();
        assert_eq!(compiler.cached_routines(), 0);
    }

    #[test]
    fn test_cache_can_be_disabled() {
        let options = CompilerOptions {
            cache_render_routines: false,
            ..CompilerOptions::default()
        };
        let compiler = NodeCompiler::new(options);
        compiler.compile("<p>x</p>", &data(), &DataAccessor::empty()).unwrap();
        assert_eq!(compiler.cached_routines(), 0);
    }

    #[test]
    fn test_repeated_edits_stay_within_cache_capacity() {
        let options = CompilerOptions {
            render_cache_capacity: 4,
            ..CompilerOptions::default()
        };
        let compiler = NodeCompiler::new(options);
        for revision in 0..20 {
            let raw = format!("<template><p>{{{{ data.id }}}} v{}</p></template>", revision);
            compiler.compile(&raw, &data(), &DataAccessor::empty()).unwrap();
            assert!(compiler.cached_routines() <= 4);
        }
        assert_eq!(compiler.cached_routines(), 4);
    }

    #[test]
    fn test_limits_flow_to_component() {
        let options = CompilerOptions {
            max_steps: Some(10_000),
            ..CompilerOptions::default()
        };
        let compiler = NodeCompiler::new(options);
        let component = compiler.compile("<p></p>", &data(), &DataAccessor::empty()).unwrap();
        assert_eq!(component.limits().max_steps, Some(10_000));
    }
}
