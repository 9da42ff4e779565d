// Property-based tests for compiler invariants.
//
// Three categories:
// 1. Generated processors compile and produce terminated HEART blocks
// 2. Constant folding agrees with direct evaluation of the operator table
// 3. The lexer and compiler never panic on arbitrary input
//
// Uses proptest with explicit configuration to keep runs fast and stable.

use proptest::prelude::*;

use soulc::diag::SourceChunk;
use soulc::types::{BinaryOp, Value};
use soulc::{Compiler, LinkOptions};

fn compile(source: &str) -> soulc::CompileResult<soulc::Program> {
    Compiler::build(
        SourceChunk::new("prop.soul", source),
        &LinkOptions::default(),
    )
}

// ── Generators ──────────────────────────────────────────────────────────

/// A small arithmetic expression over non-zero integer literals.
fn arb_int_expr() -> impl Strategy<Value = String> {
    let leaf = (1i32..100).prop_map(|n| n.to_string());
    leaf.prop_recursive(3, 16, 2, |inner| {
        (inner.clone(), prop_oneof![Just("+"), Just("-"), Just("*")], inner)
            .prop_map(|(a, op, b)| format!("({a} {op} {b})"))
    })
}

/// A processor whose run loop writes a generated expression.
fn arb_processor(expr: &str) -> String {
    format!(
        "processor P {{ output stream float out; void run() {{ let n = {expr}; loop {{ out << float(n); advance(); }} }} }}"
    )
}

// ── Properties ──────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn generated_arithmetic_always_compiles(expr in arb_int_expr()) {
        let program = compile(&arb_processor(&expr))
            .unwrap_or_else(|e| panic!("compile failed for {expr}: {e}"));

        // every block of every function is terminated
        for m in &program.modules {
            for f in &m.functions {
                for b in &f.blocks {
                    prop_assert!(b.terminator.is_some());
                }
            }
        }
    }

    #[test]
    fn integer_folding_matches_wrapping_arithmetic(a in -1000i32..1000, b in -1000i32..1000) {
        for (op, expected) in [
            (BinaryOp::Add, a.wrapping_add(b)),
            (BinaryOp::Subtract, a.wrapping_sub(b)),
            (BinaryOp::Multiply, a.wrapping_mul(b)),
        ] {
            let folded = op.apply(&Value::Int32(a), &Value::Int32(b)).unwrap();
            prop_assert_eq!(folded, Value::Int32(expected));
        }
    }

    #[test]
    fn comparison_folding_matches_rust(a in -50i64..50, b in -50i64..50) {
        let lt = BinaryOp::LessThan.apply(&Value::Int64(a), &Value::Int64(b)).unwrap();
        prop_assert_eq!(lt, Value::Bool(a < b));
        let eq = BinaryOp::Equals.apply(&Value::Int64(a), &Value::Int64(b)).unwrap();
        prop_assert_eq!(eq, Value::Bool(a == b));
    }

    #[test]
    fn lexer_never_panics(source in "\\PC{0,120}") {
        let chunk = SourceChunk::new("fuzz.soul", source);
        let _ = soulc::lexer::lex(&chunk);
    }

    #[test]
    fn compiler_never_panics_on_token_soup(source in "[a-z(){};<>=+*/ .0-9\"]{0,80}") {
        let _ = compile(&source);
    }
}

// ── Round-trip property over generated programs ─────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        ..ProptestConfig::default()
    })]

    #[test]
    fn generated_programs_round_trip(expr in arb_int_expr()) {
        let program = compile(&arb_processor(&expr)).unwrap();
        let dumped = program.to_heart();
        let reparsed = soulc::heart_parser::parse_heart_text(&dumped)
            .unwrap_or_else(|e| panic!("re-parse failed: {e}\n{dumped}"));
        prop_assert_eq!(dumped, reparsed.to_heart());
    }
}
