// End-to-end compiler tests: source in, HEART program (or diagnostic) out.
//
// Covers the canonical scenarios: the hello-processor shape, generic
// specialisation and reuse, overload resolution with silent casts,
// constant folding into array sizes, compile-time divide-by-zero, and
// graph expansion with clock ratios.

use soulc::diag::{Category, SourceChunk};
use soulc::heart::{Statement, Terminator};
use soulc::{CompileResult, Compiler, LinkOptions, Program};

fn compile(source: &str) -> CompileResult<Program> {
    Compiler::build(
        SourceChunk::new("test.soul", source),
        &LinkOptions::default(),
    )
}

fn compile_ok(source: &str) -> Program {
    compile(source).unwrap_or_else(|e| panic!("compile failed: {e}"))
}

fn compile_err(source: &str) -> soulc::Diagnostic {
    compile(source).expect_err("expected a compile error")
}

// ── Scenario: hello processor ───────────────────────────────────────────

#[test]
fn hello_processor_has_expected_heart_shape() {
    let program = compile_ok(
        "processor P { output stream float out; void run() { loop { out << 0.0f; advance(); } } }",
    );

    let p = program.module_with_name("P").expect("module P");
    assert_eq!(p.outputs.len(), 1);
    assert_eq!(p.outputs[0].name, "out");

    let run = &p.functions[p.find_function("run").expect("run function")];
    assert!(run.is_run_function);

    // one block holds the stream write followed by the advance
    let body_block = run
        .blocks
        .iter()
        .find(|b| {
            b.statements
                .iter()
                .any(|s| matches!(s, Statement::WriteStream { .. }))
        })
        .expect("write block");
    let write_position = body_block
        .statements
        .iter()
        .position(|s| matches!(s, Statement::WriteStream { .. }))
        .unwrap();
    let advance_position = body_block
        .statements
        .iter()
        .position(|s| matches!(s, Statement::AdvanceClock))
        .expect("advance");
    assert!(write_position < advance_position);

    // the loop branches back unconditionally
    assert!(matches!(
        body_block.terminator,
        Some(Terminator::Branch(_))
    ));

    assert_eq!(program.main_processor().unwrap().name, "P");
}

// ── Scenario: generic swap ──────────────────────────────────────────────

const SWAP_PROCESSOR_PREFIX: &str = "processor P {
    output stream float out;
    void swap<T> (T& a, T& b) { let t = a; a = b; b = t; }
";

fn count_specialisations(program: &Program) -> usize {
    program
        .module_with_name("P")
        .expect("module P")
        .functions
        .iter()
        .filter(|f| f.name.starts_with("_swap_specialised"))
        .count()
}

#[test]
fn generic_swap_specialises_once_per_type() {
    let program = compile_ok(&format!(
        "{SWAP_PROCESSOR_PREFIX}
        void run() {{
            var a = 1.0f; var b = 2.0f;
            swap(a, b);
            var c = 1; var d = 2;
            swap(c, d);
            advance();
        }}
    }}"
    ));
    assert_eq!(count_specialisations(&program), 2);
}

#[test]
fn generic_swap_reuses_existing_specialisation() {
    let program = compile_ok(&format!(
        "{SWAP_PROCESSOR_PREFIX}
        void run() {{
            var a = 1.0f; var b = 2.0f;
            swap(a, b);
            var c = 3.0f; var d = 4.0f;
            swap(c, d);
            advance();
        }}
    }}"
    ));
    // both calls share the float32 specialisation
    assert_eq!(count_specialisations(&program), 1);
}

#[test]
fn generic_specialisation_parameters_are_references() {
    let program = compile_ok(&format!(
        "{SWAP_PROCESSOR_PREFIX}
        void run() {{
            var a = 1.0f; var b = 2.0f;
            swap(a, b);
            advance();
        }}
    }}"
    ));
    let p = program.module_with_name("P").unwrap();
    let specialised = p
        .functions
        .iter()
        .find(|f| f.name.starts_with("_swap_specialised"))
        .expect("specialised function");
    for param in &specialised.parameters {
        assert!(p.variables[*param].ty.is_reference());
    }
}

// ── Scenario: overloads and silent casts ────────────────────────────────

const OVERLOAD_PREFIX: &str = "processor P {
    output stream float out;
    int which;
    void f (float32 x) { which = 1; }
    void f (int32 x) { which = 2; }
";

#[test]
fn overload_binds_exact_integer_match() {
    compile_ok(&format!(
        "{OVERLOAD_PREFIX} void run() {{ f(1); advance(); }} }}"
    ));
}

#[test]
fn overload_binds_float_via_silent_value_cast() {
    // 1.0 is a float64 literal; its value fits float32 exactly
    compile_ok(&format!(
        "{OVERLOAD_PREFIX} void run() {{ f(1.0); advance(); }} }}"
    ));
}

#[test]
fn overload_with_no_match_reports_error() {
    let e = compile_err(&format!(
        "{OVERLOAD_PREFIX} void run() {{ f(\"x\"); advance(); }} }}"
    ));
    assert_eq!(e.category, Category::Overload);
    assert!(e.message.contains("no matching function"), "{}", e.message);
}

#[test]
fn unknown_function_suggests_nearest_name() {
    let e = compile_err(
        "processor P { output stream float out; void frobulate() {} void run() { frobulat(); advance(); } }",
    );
    assert!(e.message.contains("frobulate"), "{}", e.message);
}

// ── Scenario: constant folding ──────────────────────────────────────────

#[test]
fn constant_folds_into_array_size_and_out_of_state() {
    let program = compile_ok(
        "processor P {
            output stream float out;
            const int N = 2 + 3 * 4;
            float[N] buffer;
            void run() { loop { out << buffer[0]; advance(); } }
        }",
    );
    let p = program.module_with_name("P").unwrap();

    let buffer = p
        .state_variables()
        .find(|(_, v)| v.name.as_deref() == Some("buffer"))
        .expect("buffer is state");
    assert_eq!(buffer.1.ty.array_or_vector_size(), Some(14));

    // N itself folded away
    assert!(p
        .state_variables()
        .all(|(_, v)| v.name.as_deref() != Some("N")));
}

#[test]
fn constant_ternary_selects_branch() {
    compile_ok(
        "processor P {
            output stream float out;
            const bool fast = true;
            void run() { let gain = fast ? 2.0f : 4.0f; loop { out << gain; advance(); } }
        }",
    );
}

#[test]
fn static_assert_failure_is_reported() {
    let e = compile_err(
        "processor P { output stream float out; void run() { static_assert(1 > 2, \"sizes must grow\"); advance(); } }",
    );
    assert!(e.message.contains("sizes must grow"));
}

// ── Scenario: divide by zero ────────────────────────────────────────────

#[test]
fn constant_divide_by_zero_fails_at_the_literal() {
    let source = "processor P { output stream float out; void run() { int x = 1 / 0; advance(); } }";
    let e = compile_err(source);
    assert_eq!(e.category, Category::Lowering);
    assert!(e.message.contains("division by zero"));

    // the location points at the zero literal
    let location = e.location.expect("location");
    let offset = source.find("/ 0").unwrap() + 2;
    assert_eq!(location.span.start, offset);
}

#[test]
fn constant_modulo_zero_fails() {
    let e = compile_err(
        "processor P { output stream float out; void run() { int x = 7 % 0; advance(); } }",
    );
    assert!(e.message.contains("modulo zero"));
}

// ── Scenario: graph expansion with clock ratios ─────────────────────────

#[test]
fn graph_expands_instances_with_clock_ratios() {
    let program = compile_ok(
        "processor Slow { output stream float out; void run() { loop { out << 0.0f; advance(); } } }
         processor Fast { input stream float in; output stream float out; void run() { loop { out << 0.0f; advance(); } } }
         graph G {
             output stream float out;
             let a = Slow * 2;
             let b = Fast / 3;
             connection { a.out -> b.in; b.out -> out; }
         }",
    );

    let g = program.module_with_name("G").expect("graph G");
    assert_eq!(g.processor_instances.len(), 2);

    let a = g
        .processor_instances
        .iter()
        .find(|i| i.instance_name == "a")
        .unwrap();
    assert_eq!(a.clock_multiplier, Some(2));
    assert_eq!(a.clock_divider, None);

    let b = g
        .processor_instances
        .iter()
        .find(|i| i.instance_name == "b")
        .unwrap();
    assert_eq!(b.clock_divider, Some(3));

    // default connection semantics: no delay, no interpolation
    let inner = g
        .connections
        .iter()
        .find(|c| c.source_processor.as_deref() == Some("a"))
        .unwrap();
    assert_eq!(inner.delay_length, 0);
    assert_eq!(
        inner.interpolation,
        soulc::ast::InterpolationType::None
    );
}

#[test]
fn graph_connection_with_delay() {
    let program = compile_ok(
        "processor Osc { output stream float out; void run() { loop { out << 0.0f; advance(); } } }
         graph G { output stream float out; connection { Osc.out -> [100] -> out; } }",
    );
    let g = program.module_with_name("G").unwrap();
    assert_eq!(g.connections[0].delay_length, 100);
}

// ── Error taxonomy ──────────────────────────────────────────────────────

#[test]
fn unresolved_symbol_is_a_resolution_error() {
    let e = compile_err(
        "processor P { output stream float out; void run() { out << missing; advance(); } }",
    );
    assert_eq!(e.category, Category::Resolution);
    assert!(e.message.contains("missing"));
}

#[test]
fn write_to_input_is_rejected() {
    // `<<` onto an input is just an illegal shift, not a stream write
    let e = compile_err(
        "processor P { input stream float in; output stream float out; void run() { in << 1.0f; advance(); } }",
    );
    assert!(e.message.contains("<<"), "{}", e.message);
}

#[test]
fn read_from_output_is_rejected() {
    let e = compile_err(
        "processor P { output stream float out; void run() { let x = out; advance(); } }",
    );
    assert!(e.message.contains("output"), "{}", e.message);
}

#[test]
fn recursion_is_rejected() {
    let e = compile_err(
        "processor P {
            output stream float out;
            void a() { b(); }
            void b() { a(); }
            void run() { a(); advance(); }
        }",
    );
    assert_eq!(e.category, Category::PostCheck);
    assert!(e.message.contains("recursively"));
}

#[test]
fn calling_run_is_rejected() {
    let e = compile_err(
        "processor P { output stream float out; void f() { run(); } void run() { f(); advance(); } }",
    );
    assert!(e.message.contains("run()"), "{}", e.message);
}

#[test]
fn missing_return_on_some_path_is_rejected() {
    let e = compile_err(
        "processor P {
            output stream float out;
            int f (bool b) { if (b) return 1; }
            void run() { let x = f(true); advance(); }
        }",
    );
    assert!(e.message.contains("return"), "{}", e.message);
}

#[test]
fn all_paths_returning_compiles() {
    compile_ok(
        "processor P {
            output stream float out;
            int f (bool b) { if (b) return 1; else return 2; }
            void run() { let x = f(true); advance(); }
        }",
    );
}

#[test]
fn advance_outside_run_is_rejected() {
    let e = compile_err(
        "processor P { output stream float out; void f() { advance(); } void run() { f(); advance(); } }",
    );
    assert!(e.message.contains("advance"), "{}", e.message);
}

#[test]
fn initialiser_referring_to_itself_is_rejected() {
    let e = compile_err(
        "processor P { output stream float out; int x = x + 1; void run() { advance(); } }",
    );
    assert!(e.message.contains("initialis"), "{}", e.message);
}

#[test]
fn type_too_large_is_rejected() {
    let e = compile_err(
        "processor P { output stream float out; float64[2000000000] big; void run() { advance(); } }",
    );
    assert!(
        e.message.contains("too big") || e.message.contains("illegal array size"),
        "{}",
        e.message
    );
}

#[test]
fn event_endpoint_and_handler_compile() {
    let program = compile_ok(
        "processor P {
            input event float gain;
            output stream float out;
            float level;
            event gain (float g) { level = g; }
            void run() { loop { out << level; advance(); } }
        }",
    );
    let p = program.module_with_name("P").unwrap();
    assert!(p.functions.iter().any(|f| f.is_event_function));
}

#[test]
fn intrinsics_fold_at_compile_time() {
    let program = compile_ok(
        "processor P {
            output stream float out;
            const int N = max(3, 7);
            float[N] buffer;
            void run() { loop { out << buffer[0]; advance(); } }
        }",
    );
    let p = program.module_with_name("P").unwrap();
    let buffer = p
        .state_variables()
        .find(|(_, v)| v.name.as_deref() == Some("buffer"))
        .unwrap();
    assert_eq!(buffer.1.ty.array_or_vector_size(), Some(7));
}

#[test]
fn processor_specialisation_binds_constants() {
    let program = compile_ok(
        "processor Gain (int factor) {
            output stream float out;
            void run() { loop { out << float(factor); advance(); } }
        }
        graph G {
            output stream float out;
            let g = Gain(3);
            connection { g.out -> out; }
        }",
    );
    // the template is gone; only the specialised clone remains
    assert!(program.module_with_name("Gain").is_none());
    let g = program.module_with_name("G").unwrap();
    assert_eq!(g.processor_instances.len(), 1);
    let clone_name = &g.processor_instances[0].source_name;
    assert!(program.module_with_name(clone_name).is_some());
}
