//! # Custom Node Compiler
//!
//! Turns a user-authored node definition (a `<template>` block plus an
//! optional `<script>` block) into a component the canvas can instantiate.
//!
//! ## Pipeline
//!
//! 1. **Extract**: split the raw text into markup and logic ([`extract`]).
//! 2. **Render**: compile the markup into a [`RenderRoutine`]. This runs
//!    before any logic, so a malformed template never executes user code.
//! 3. **Transform**: normalize the logic into an evaluable body
//!    ([`transform`], see [`LogicForm`]).
//! 4. **Evaluate**: run the body in a [`Sandbox`] whose only bindings are the
//!    [`CapabilityWhitelist`] plus the instance data and `getNodeData`.
//! 5. **Assemble**: merge options, render routine and reserved keys into a
//!    [`CompiledComponent`] ([`assemble`]).
//!
//! ## Isolation
//!
//! User logic is interpreted, never handed to a host engine. Identifiers that
//! are not declared by the logic or the whitelist fail with a reference error;
//! there is no global object to escape to.
//!
//! ## Errors
//!
//! Every failure aborts the compile with a [`CompileError`]. No partial
//! component is produced; callers keep their last good one
//! (see [`ComponentRegistry::compile_node`]).

mod ast;
mod builtins;
mod capabilities;
mod error;
mod evaluate;
mod extract;
mod instance;
mod interpreter;
mod lower;
mod transform;
mod value;

mod assemble;
mod cache;
mod compiler;
mod config;
mod registry;
mod runtime;
mod template;
mod vnode;

#[cfg(feature = "napi")]
mod native;

#[cfg(test)]
mod pipeline_tests;
#[cfg(test)]
mod sandbox_tests;

pub use assemble::{assemble, is_reserved_key, CompiledComponent, HANDLE_COMPONENT, RESERVED_KEYS};
pub use cache::{RenderCache, DEFAULT_CACHE_CAPACITY};
pub use capabilities::{CapabilityWhitelist, LifecycleHook, POSITION_BINDING, VUE_NAMESPACE};
pub use compiler::{compile_definition, NodeCompiler};
pub use config::CompilerOptions;
pub use error::{
    CompileError, ErrorReport, ERR_LOGIC_EVALUATION, ERR_MISSING_MARKUP, ERR_TEMPLATE_COMPILE,
    ERR_UNSUPPORTED_LOGIC,
};
pub use evaluate::{ComponentOptions, Sandbox, DATA_ACCESSOR_KEY, INSTANCE_DATA_KEY};
pub use extract::{extract, ExtractedBlocks};
pub use instance::{DataAccessor, InstanceData};
pub use interpreter::Limits;
pub use registry::{
    custom_type_tag, is_custom_type, ComponentRegistry, CustomNodeDefinition, CustomNodeRecord,
    CUSTOM_NODE_EDITOR, CUSTOM_TYPE_PREFIX, DEFAULT_ACCENT_COLOR,
};
pub use runtime::ComponentInstance;
pub use template::{HtmlTemplateCompiler, RenderRoutine, TemplateCompiler};
pub use transform::{transform, EvaluableBody, LogicForm};
pub use value::{RuntimeError, Value};
pub use vnode::VNode;

#[cfg(feature = "napi")]
pub use native::{default_node_data_native, extract_blocks_native, render_definition_native};
