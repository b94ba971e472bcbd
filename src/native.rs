//! JSON-in/JSON-out bindings for a JavaScript host.

use napi_derive::napi;
use serde_json::json;

use crate::compiler::NodeCompiler;
use crate::config::CompilerOptions;
use crate::error::CompileError;
use crate::extract::extract;
use crate::instance::{DataAccessor, InstanceData};
use crate::registry::CustomNodeRecord;
use crate::runtime::ComponentInstance;

fn to_napi_error(err: CompileError) -> napi::Error {
    let report = serde_json::to_string(&err.report()).unwrap_or_else(|_| err.to_string());
    napi::Error::from_reason(report)
}

fn object_or_empty(value: Option<serde_json::Value>) -> InstanceData {
    match value {
        Some(serde_json::Value::Object(map)) => map,
        _ => InstanceData::new(),
    }
}

#[napi]
pub fn extract_blocks_native(raw: String) -> napi::Result<serde_json::Value> {
    let blocks = extract(&raw).map_err(to_napi_error)?;
    serde_json::to_value(blocks).map_err(|e| napi::Error::from_reason(e.to_string()))
}

/// Compiles, mounts and renders a definition once. `siblings` maps node ids
/// to their data for `getNodeData`.
#[napi]
pub fn render_definition_native(
    raw: String,
    instance_data: serde_json::Value,
    siblings: Option<serde_json::Value>,
    options: Option<serde_json::Value>,
) -> napi::Result<serde_json::Value> {
    let options: CompilerOptions = match options {
        Some(value) => {
            serde_json::from_value(value).map_err(|e| napi::Error::from_reason(e.to_string()))?
        }
        None => CompilerOptions::default(),
    };
    let siblings = object_or_empty(siblings);
    let accessor = DataAccessor::new(move |id| match siblings.get(id) {
        Some(serde_json::Value::Object(data)) => Some(data.clone()),
        _ => None,
    });
    let data = object_or_empty(Some(instance_data));

    let component = NodeCompiler::new(options)
        .compile(&raw, &data, &accessor)
        .map_err(to_napi_error)?;
    let mut instance = ComponentInstance::mount(component)
        .map_err(|e| to_napi_error(CompileError::from(e)))?;
    let nodes = instance
        .render()
        .map_err(|e| to_napi_error(CompileError::from(e)))?;
    let state = instance
        .state_json()
        .map_err(|e| to_napi_error(CompileError::from(e)))?;

    Ok(json!({
        "html": crate::vnode::to_html(&nodes),
        "nodes": nodes,
        "state": state,
    }))
}

#[napi]
pub fn default_node_data_native(
    record: serde_json::Value,
    node_id: String,
) -> napi::Result<serde_json::Value> {
    let record: CustomNodeRecord =
        serde_json::from_value(record).map_err(|e| napi::Error::from_reason(e.to_string()))?;
    let definition = record.definition();
    let mut data = definition.default_data(&node_id);
    data.insert("editor".to_string(), json!(definition.editor));
    Ok(serde_json::Value::Object(data))
}
