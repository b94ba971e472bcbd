//! Isolation and resource-limit tests for user logic and template expressions.

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::capabilities::CapabilityWhitelist;
    use crate::compiler::NodeCompiler;
    use crate::config::CompilerOptions;
    use crate::error::CompileError;
    use crate::instance::{DataAccessor, InstanceData};
    use crate::runtime::ComponentInstance;
    use crate::template::HtmlTemplateCompiler;
    use crate::value::{RuntimeError, Value};

    fn data() -> InstanceData {
        json!({ "id": "n1", "label": "Sensor" }).as_object().cloned().unwrap()
    }

    fn compile_logic(logic: &str) -> Result<crate::assemble::CompiledComponent, CompileError> {
        let raw = format!("<template><p>{{{{ data.id }}}}</p></template><script>{}</script>", logic);
        NodeCompiler::default().compile(&raw, &data(), &DataAccessor::empty())
    }

    fn runtime_error(logic: &str) -> RuntimeError {
        match compile_logic(logic) {
            Err(CompileError::LogicEvaluation { source }) => source,
            other => panic!("{} should fail to evaluate, got {:?}", logic, other),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // ISOLATION
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_host_globals_are_not_bound() {
        for name in [
            "window",
            "document",
            "globalThis",
            "global",
            "process",
            "require",
            "eval",
            "Function",
            "fetch",
            "localStorage",
        ] {
            let err = runtime_error(&format!("const seen = {}; export default {{}}", name));
            assert!(
                matches!(&err, RuntimeError::Reference(missing) if missing == name),
                "{} resolved to something: {:?}",
                name,
                err
            );
        }
    }

    #[test]
    fn test_typeof_sees_nothing() {
        let raw = "<template><p>{{ kinds }}</p></template><script>export default { data() { return { kinds: [typeof window, typeof process, typeof ref].join(',') } } }</script>";
        let component = NodeCompiler::default()
            .compile(raw, &data(), &DataAccessor::empty())
            .unwrap();
        let mut instance = ComponentInstance::mount(component).unwrap();
        assert_eq!(
            instance.render_html().unwrap(),
            "<p>undefined,undefined,function</p>"
        );
    }

    #[test]
    fn test_constructor_chains_lead_nowhere() {
        for logic in [
            "(() => 0).constructor('return process')()",
            "[].constructor.constructor('return this')()",
            "'x'.constructor.fromCharCode(65)",
        ] {
            let err = runtime_error(&format!("{}; export default {{}}", logic));
            assert!(matches!(err, RuntimeError::Type(_)), "{}: {:?}", logic, err);
        }
    }

    #[test]
    fn test_whitelist_cannot_be_patched() {
        let err = runtime_error("Vue.ref = () => 'pwned'; export default {}");
        assert!(matches!(err, RuntimeError::Type(_)));
        let err = runtime_error("Position.Left = 'right'; export default {}");
        assert!(matches!(err, RuntimeError::Type(_)));
    }

    #[test]
    fn test_shadowing_a_capability_stays_local() {
        let compiler = NodeCompiler::default();
        let shadowing = "<template><p>{{ n }}</p></template><script>const ref = (v) => v * 10; export default { data() { return { n: ref(2) } } }</script>";
        let plain = "<template><p>{{ n }}</p></template><script>const n = ref(2); return { n }</script>";

        let first = compiler.compile(shadowing, &data(), &DataAccessor::empty()).unwrap();
        let second = compiler.compile(plain, &data(), &DataAccessor::empty()).unwrap();
        let mut first = ComponentInstance::mount(first).unwrap();
        let mut second = ComponentInstance::mount(second).unwrap();
        assert_eq!(first.render_html().unwrap(), "<p>20</p>");
        assert_eq!(second.render_html().unwrap(), "<p>2</p>");
    }

    #[test]
    fn test_accessor_hands_out_copies() {
        let store = data();
        let lookup = store.clone();
        let accessor = DataAccessor::new(move |id| (id == "n1").then(|| lookup.clone()));
        let raw = "<template><p>{{ a }}/{{ b }}</p></template><script>export default { data() { const first = getNodeData('n1'); first.label = 'hacked'; return { a: first.label, b: getNodeData('n1').label } } }</script>";
        let component = NodeCompiler::default().compile(raw, &store, &accessor).unwrap();
        let mut instance = ComponentInstance::mount(component).unwrap();
        assert_eq!(instance.render_html().unwrap(), "<p>hacked/Sensor</p>");
        assert_eq!(store["label"], json!("Sensor"));
    }

    #[test]
    fn test_template_expressions_share_the_isolation() {
        let raw = "<template><p>[{{ window }}]</p></template>";
        let component = NodeCompiler::default()
            .compile(raw, &data(), &DataAccessor::empty())
            .unwrap();
        let mut instance = ComponentInstance::mount(component).unwrap();
        assert_eq!(instance.render_html().unwrap(), "<p>[]</p>");
    }

    #[test]
    fn test_self_referencing_array_stringifies() {
        let raw = "<template><p>{{ text }}</p></template><script>const a = [1]; a.push(a); export default { data() { return { text: '' + a + '|' + a.join('-') } } }</script>";
        let component = NodeCompiler::default()
            .compile(raw, &data(), &DataAccessor::empty())
            .unwrap();
        let mut instance = ComponentInstance::mount(component).unwrap();
        assert_eq!(instance.render_html().unwrap(), "<p>1,|1-</p>");
    }

    #[test]
    fn test_self_referencing_array_renders_in_template() {
        let raw = "<template><p>{{ '' + list }}</p></template><script>export default { data() { const list = ['x']; list.push(list); return { list } } }</script>";
        let component = NodeCompiler::default()
            .compile(raw, &data(), &DataAccessor::empty())
            .unwrap();
        let mut instance = ComponentInstance::mount(component).unwrap();
        assert_eq!(instance.render_html().unwrap(), "<p>x,</p>");
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // LIMITS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_runaway_logic_hits_step_budget() {
        let options = CompilerOptions {
            max_steps: Some(5_000),
            ..CompilerOptions::default()
        };
        let raw = "<template><p></p></template><script>while (true) {} export default {}</script>";
        let err = NodeCompiler::new(options)
            .compile(raw, &data(), &DataAccessor::empty())
            .unwrap_err();
        assert!(matches!(
            err,
            CompileError::LogicEvaluation { source: RuntimeError::StepBudget(5_000) }
        ));
    }

    #[test]
    fn test_runaway_logic_stops_with_default_options() {
        let raw = "<template><p></p></template><script>let n = 0; while (true) { n++ } export default {}</script>";
        let err = NodeCompiler::default()
            .compile(raw, &data(), &DataAccessor::empty())
            .unwrap_err();
        assert!(matches!(
            err,
            CompileError::LogicEvaluation { source: RuntimeError::StepBudget(1_000_000) }
        ));
    }

    #[test]
    fn test_unbounded_recursion_hits_call_depth() {
        let options = CompilerOptions {
            max_call_depth: 24,
            ..CompilerOptions::default()
        };
        let raw = "<template><p></p></template><script>function down(n) { return down(n + 1) } down(0); export default {}</script>";
        let err = NodeCompiler::new(options)
            .compile(raw, &data(), &DataAccessor::empty())
            .unwrap_err();
        assert!(matches!(
            err,
            CompileError::LogicEvaluation { source: RuntimeError::CallDepth(24) }
        ));
    }

    #[test]
    fn test_unbounded_recursion_with_default_options() {
        let raw = "<template><p></p></template><script>function down(n) { return down(n + 1) } down(0); export default {}</script>";
        let err = NodeCompiler::default()
            .compile(raw, &data(), &DataAccessor::empty())
            .unwrap_err();
        assert!(
            matches!(
                err,
                CompileError::LogicEvaluation {
                    source: RuntimeError::CallDepth(256) | RuntimeError::StackExhausted
                }
            ),
            "{:?}",
            err
        );
    }

    #[test]
    fn test_recursion_in_render_is_reported() {
        let raw = "<template><p>{{ down(0) }}</p></template><script>export default { methods: { down(n) { return this.down(n + 1) } } }</script>";
        let component = NodeCompiler::default()
            .compile(raw, &data(), &DataAccessor::empty())
            .unwrap();
        let mut instance = ComponentInstance::mount(component).unwrap();
        assert!(instance.render().is_err());
        assert!(instance.render().is_err());
    }

    #[test]
    fn test_deeply_nested_logic_is_rejected() {
        let logic = format!("const x = {}1{}; export default {{}}", "(".repeat(5000), ")".repeat(5000));
        assert!(matches!(
            compile_logic(&logic),
            Err(CompileError::UnsupportedLogicShape { .. })
        ));
        let logic = format!("const x = {}; export default {{}}", "[".repeat(5000) + &"]".repeat(5000));
        assert!(matches!(
            compile_logic(&logic),
            Err(CompileError::UnsupportedLogicShape { .. })
        ));
    }

    #[test]
    fn test_deeply_nested_template_expression_is_rejected() {
        let raw = format!("<template><p>{{{{ {}1{} }}}}</p></template>", "(".repeat(5000), ")".repeat(5000));
        let err = NodeCompiler::default()
            .compile(&raw, &data(), &DataAccessor::empty())
            .unwrap_err();
        assert!(matches!(err, CompileError::TemplateCompile { .. }), "{:?}", err);
    }

    #[test]
    fn test_custom_whitelist_is_the_whole_surface() {
        let mut whitelist = CapabilityWhitelist::new();
        whitelist.add("answer", Value::Number(42.0)).unwrap();
        let compiler = NodeCompiler::with_parts(
            CompilerOptions::default(),
            whitelist,
            Box::new(HtmlTemplateCompiler),
        );
        let raw = "<template><p>{{ n }}</p></template><script>export default { data() { return { n: answer } } }</script>";
        let component = compiler.compile(raw, &data(), &DataAccessor::empty()).unwrap();
        let mut instance = ComponentInstance::mount(component).unwrap();
        assert_eq!(instance.render_html().unwrap(), "<p>42</p>");

        let err = compiler
            .compile(
                "<template><p></p></template><script>const n = ref(1); export default {}</script>",
                &data(),
                &DataAccessor::empty(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CompileError::LogicEvaluation { source: RuntimeError::Reference(_) }
        ));
        assert!(compiler.sandbox().whitelist().is_frozen());
    }
}
