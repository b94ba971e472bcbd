//! Catalog of user-defined node types and the components compiled for them.

use indexmap::map::Entry;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::assemble::CompiledComponent;
use crate::compiler::NodeCompiler;
use crate::error::CompileError;
use crate::instance::{DataAccessor, InstanceData};

pub const CUSTOM_TYPE_PREFIX: &str = "custom-";
pub const CUSTOM_NODE_EDITOR: &str = "CustomNodeInfo";
pub const DEFAULT_ACCENT_COLOR: &str = "#7e8c9e";

pub fn custom_type_tag(id: &str) -> String {
    format!("{}{}", CUSTOM_TYPE_PREFIX, id)
}

pub fn is_custom_type(type_tag: &str) -> bool {
    type_tag.starts_with(CUSTOM_TYPE_PREFIX)
}

/// A user-authored node type as stored in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomNodeRecord {
    pub id: String,
    pub name: String,
    #[serde(alias = "code")]
    pub logic_text: String,
    #[serde(default, alias = "logoColor", skip_serializing_if = "Option::is_none")]
    pub accent_color: Option<String>,
}

impl CustomNodeRecord {
    pub fn type_tag(&self) -> String {
        custom_type_tag(&self.id)
    }

    pub fn definition(&self) -> CustomNodeDefinition {
        CustomNodeDefinition {
            type_tag: self.type_tag(),
            editor: CUSTOM_NODE_EDITOR.to_string(),
            label: self.name.clone(),
            code: self.logic_text.clone(),
            color: self.accent_color.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomNodeDefinition {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub editor: String,
    pub label: String,
    pub code: String,
    pub color: Option<String>,
}

impl CustomNodeDefinition {
    /// Initial document data for a freshly placed node of this type.
    pub fn default_data(&self, node_id: &str) -> InstanceData {
        let color = self
            .color
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_ACCENT_COLOR);
        let data = json!({
            "id": node_id,
            "type": self.type_tag,
            "label": self.label,
            "code": self.code,
            "color": color,
        });
        match data {
            serde_json::Value::Object(map) => map,
            _ => InstanceData::new(),
        }
    }
}

/// Compiled components by node type tag. A failed compile leaves the last
/// good component registered.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    compiler: NodeCompiler,
    components: IndexMap<String, CompiledComponent>,
}

impl ComponentRegistry {
    pub fn new(compiler: NodeCompiler) -> Self {
        Self {
            compiler,
            components: IndexMap::new(),
        }
    }

    pub fn compiler(&self) -> &NodeCompiler {
        &self.compiler
    }

    pub fn compile_node(
        &mut self,
        type_tag: &str,
        record: &CustomNodeRecord,
        instance_data: &InstanceData,
        accessor: &DataAccessor,
    ) -> Result<&CompiledComponent, CompileError> {
        match self
            .compiler
            .compile(&record.logic_text, instance_data, accessor)
        {
            Ok(component) => {
                debug!(type_tag, "registered compiled component");
                Ok(match self.components.entry(type_tag.to_string()) {
                    Entry::Occupied(mut slot) => {
                        slot.insert(component);
                        slot.into_mut()
                    }
                    Entry::Vacant(slot) => slot.insert(component),
                })
            }
            Err(err) => {
                warn!(
                    type_tag,
                    code = err.code(),
                    kept_previous = self.components.contains_key(type_tag),
                    "custom node failed to compile"
                );
                Err(err)
            }
        }
    }

    pub fn get(&self, type_tag: &str) -> Option<&CompiledComponent> {
        self.components.get(type_tag)
    }

    pub fn remove(&mut self, type_tag: &str) -> Option<CompiledComponent> {
        self.components.shift_remove(type_tag)
    }

    pub fn type_tags(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: &str) -> CustomNodeRecord {
        CustomNodeRecord {
            id: "42".to_string(),
            name: "Weather".to_string(),
            logic_text: code.to_string(),
            accent_color: None,
        }
    }

    #[test]
    fn test_record_accepts_stored_field_names() {
        let record: CustomNodeRecord = serde_json::from_value(json!({
            "id": "7",
            "name": "Card",
            "code": "<div></div>",
            "logoColor": "#ff0000"
        }))
        .unwrap();
        assert_eq!(record.logic_text, "<div></div>");
        assert_eq!(record.accent_color.as_deref(), Some("#ff0000"));
        assert_eq!(record.type_tag(), "custom-7");
        assert!(is_custom_type(&record.type_tag()));
    }

    #[test]
    fn test_default_data() {
        let data = record("<p></p>").definition().default_data("node-1");
        assert_eq!(
            serde_json::Value::Object(data),
            json!({
                "id": "node-1",
                "type": "custom-42",
                "label": "Weather",
                "code": "<p></p>",
                "color": "#7e8c9e"
            })
        );
        assert_eq!(record("").definition().editor, "CustomNodeInfo");
    }

    #[test]
    fn test_failed_compile_keeps_last_good_component() {
        let mut registry = ComponentRegistry::default();
        let data = InstanceData::new();
        let accessor = DataAccessor::empty();
        let tag = "custom-42";

        registry
            .compile_node(tag, &record("<p>ok</p>"), &data, &accessor)
            .unwrap();
        let err = registry
            .compile_node(tag, &record("<script>export default {}</script>"), &data, &accessor)
            .unwrap_err();
        assert!(matches!(err, CompileError::MissingMarkup { .. }));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(tag).is_some());

        assert!(registry.remove(tag).is_some());
        assert!(registry.is_empty());
    }
}
