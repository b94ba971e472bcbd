//! End-to-end compile tests: raw definition text in, mounted component out.

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use serde_json::json;

    use crate::compiler::{compile_definition, NodeCompiler};
    use crate::error::CompileError;
    use crate::instance::{DataAccessor, InstanceData};
    use crate::runtime::ComponentInstance;
    use crate::transform::LogicForm;
    use crate::vnode::VNode;

    /// Opt-in log output: `RUST_LOG=debug cargo test`.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    fn n1() -> InstanceData {
        json!({ "id": "n1" }).as_object().cloned().unwrap()
    }

    fn mount(raw: &str, data: &InstanceData, accessor: &DataAccessor) -> ComponentInstance {
        init_tracing();
        let component = compile_definition(raw, data, accessor).unwrap();
        ComponentInstance::mount(component).unwrap()
    }

    fn counting_accessor(calls: Rc<Cell<usize>>) -> DataAccessor {
        DataAccessor::new(move |id| {
            calls.set(calls.get() + 1);
            match id {
                "n2" => json!({ "id": "n2", "temperature": 21 }).as_object().cloned(),
                _ => None,
            }
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // EXTRACTION THROUGH THE PIPELINE
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_block_attributes_and_whitespace_do_not_leak() {
        let raw = "\n  <template id=\"main\">\n\n   <p>{{ data.id }}</p>  \n</template>\n<script lang=\"ts\">  export default {}  </script>";
        let mut instance = mount(raw, &n1(), &DataAccessor::empty());
        assert_eq!(instance.render_html().unwrap(), "<p>n1</p>");
    }

    #[test]
    fn test_definition_without_blocks_is_plain_markup() {
        let mut instance = mount("  <b>{{ data.id }}</b> ", &n1(), &DataAccessor::empty());
        assert_eq!(instance.render_html().unwrap(), "<b>n1</b>");
        assert!(instance.component().options.is_empty());
    }

    #[test]
    fn test_incomplete_blocks_reach_the_template_compiler() {
        for raw in ["<template><div>hi</div>", "<p>use a </template> tag</p>"] {
            let err = compile_definition(raw, &n1(), &DataAccessor::empty()).unwrap_err();
            assert!(matches!(err, CompileError::TemplateCompile { .. }), "{}: {:?}", raw, err);
        }
    }

    #[test]
    fn test_logic_without_markup_fails_before_evaluation() {
        let calls = Rc::new(Cell::new(0));
        let err = compile_definition(
            "<script>getNodeData('n2'); export default {}</script>",
            &n1(),
            &counting_accessor(calls.clone()),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::MissingMarkup { .. }));
        assert_eq!(calls.get(), 0);
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // STATE ASSEMBLY
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_count_factory_merges_with_instance_data() {
        let raw = "<template><span>{{ count }}</span></template>\n<script>export default { data() { return { count: 1 } } }</script>";
        let mut instance = mount(raw, &n1(), &DataAccessor::empty());
        let state = instance.state_json().unwrap();
        assert_eq!(state["count"], json!(1));
        assert_eq!(state["data"], json!({ "id": "n1" }));
        assert_eq!(instance.render_html().unwrap(), "<span>1</span>");
    }

    #[test]
    fn test_empty_logic_uses_render_routine_and_reserved_keys() {
        let raw = "<template><div :title=\"data.id\">{{ Position.Top }}</div></template><script></script>";
        let mut instance = mount(raw, &n1(), &DataAccessor::empty());
        assert_eq!(
            instance.render_html().unwrap(),
            "<div title=\"n1\">top</div>"
        );
    }

    #[test]
    fn test_reserved_instance_data_wins_over_user_field() {
        let raw = "<template><i>{{ data.id }}</i></template><script>export default { data() { return { data: { id: 'forged' } } } }</script>";
        let mut instance = mount(raw, &n1(), &DataAccessor::empty());
        assert_eq!(instance.state_json().unwrap()["data"], json!({ "id": "n1" }));
        assert_eq!(instance.render_html().unwrap(), "<i>n1</i>");
    }

    #[test]
    fn test_export_default_beats_object_literal_shape() {
        let raw = "<template><p>{{ which }}</p></template><script>{ const which = 'literal' }\nexport default { data() { return { which: 'export' } } }</script>";
        let mut instance = mount(raw, &n1(), &DataAccessor::empty());
        assert_eq!(instance.render_html().unwrap(), "<p>export</p>");
    }

    #[test]
    fn test_imperative_logic_becomes_setup() {
        let raw = "<template><p>{{ greeting }}</p></template><script>import { ref } from 'vue'\nconst greeting = ref('hi ' + data.id)\nreturn { greeting }</script>";
        let mut instance = mount(raw, &n1(), &DataAccessor::empty());
        assert_eq!(instance.render_html().unwrap(), "<p>hi n1</p>");
    }

    #[test]
    fn test_handle_is_always_available() {
        let raw = "<template><div><Handle type=\"source\" :position=\"Position.Right\" /></div></template>";
        let mut instance = mount(raw, &n1(), &DataAccessor::empty());
        let nodes = instance.render().unwrap();
        match &nodes[0].children()[0] {
            VNode::Component { name, props, .. } => {
                assert_eq!(name, "Handle");
                assert_eq!(props["type"], json!("source"));
                assert_eq!(props["position"], json!("right"));
            }
            other => panic!("expected Handle component, got {:?}", other),
        }
    }

    #[test]
    fn test_sibling_data_through_accessor() {
        let calls = Rc::new(Cell::new(0));
        let raw = "<template><p>{{ reading }}</p></template><script>export default { computed: { reading() { const other = this.getNodeData('n2'); return other ? other.temperature + '°' : '?' } } }</script>";
        let mut instance = mount(raw, &n1(), &counting_accessor(calls.clone()));
        assert_eq!(instance.render_html().unwrap(), "<p>21°</p>");
        assert!(calls.get() >= 1);
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // FAILURE ORDERING
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_template_error_never_runs_logic() {
        let calls = Rc::new(Cell::new(0));
        let raw = "<template><div><span></div></template><script>getNodeData('n2'); throw 'ran'</script>";
        let err = compile_definition(raw, &n1(), &counting_accessor(calls.clone())).unwrap_err();
        assert!(matches!(err, CompileError::TemplateCompile { .. }), "{:?}", err);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_logic_failure_keeps_cause() {
        let raw = "<template><p></p></template><script>export default { data: missing() }</script>";
        let err = compile_definition(raw, &n1(), &DataAccessor::empty()).unwrap_err();
        assert_eq!(err.code(), "NODE-ERR-LOGIC-002");
        assert!(err.to_string().contains("missing"), "{}", err);
    }

    #[test]
    fn test_unsupported_shape_reports_form() {
        let raw = "<template><p></p></template><script>export default class Node {}</script>";
        let err = compile_definition(raw, &n1(), &DataAccessor::empty()).unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnsupportedLogicShape { form: LogicForm::ExportDefault, .. }
        ));
    }

    #[test]
    fn test_logic_cannot_mutate_instance_data() {
        let data = n1();
        let raw = "<template><p>{{ data.id }}</p></template><script>data.id = 'changed'; export default {}</script>";
        let component = NodeCompiler::default()
            .compile(raw, &data, &DataAccessor::empty())
            .unwrap();
        assert_eq!(component.instance_data["id"], json!("n1"));
        assert_eq!(data["id"], json!("n1"));

        let mut instance = ComponentInstance::mount(component).unwrap();
        assert_eq!(instance.render_html().unwrap(), "<p>n1</p>");
    }

    #[test]
    fn test_each_compile_is_independent() {
        let compiler = NodeCompiler::default();
        let raw = "<template><p>{{ n }}</p></template><script>export default { data() { return { n: data.id } } }</script>";
        let first = compiler.compile(raw, &n1(), &DataAccessor::empty()).unwrap();
        let other = json!({ "id": "n9" }).as_object().cloned().unwrap();
        let second = compiler.compile(raw, &other, &DataAccessor::empty()).unwrap();

        let mut first = ComponentInstance::mount(first).unwrap();
        let mut second = ComponentInstance::mount(second).unwrap();
        assert_eq!(first.render_html().unwrap(), "<p>n1</p>");
        assert_eq!(second.render_html().unwrap(), "<p>n9</p>");
        assert_eq!(compiler.cached_routines(), 1);
    }
}
