// Round-trip tests for the textual HEART dump: lowering a program to text
// and re-parsing it must yield a structurally identical program, which we
// verify by comparing the re-dump byte-for-byte.

use soulc::diag::SourceChunk;
use soulc::heart_parser::parse_heart_text;
use soulc::{Compiler, LinkOptions, Program};

fn compile(source: &str) -> Program {
    Compiler::build(
        SourceChunk::new("test.soul", source),
        &LinkOptions::default(),
    )
    .unwrap_or_else(|e| panic!("compile failed: {e}"))
}

fn assert_round_trips(source: &str) {
    let program = compile(source);
    let dumped = program.to_heart();
    let reparsed = parse_heart_text(&dumped)
        .unwrap_or_else(|e| panic!("re-parse failed: {e}\n--- dump ---\n{dumped}"));
    let redumped = reparsed.to_heart();
    assert_eq!(
        dumped, redumped,
        "HEART dump did not survive a parse round-trip"
    );
}

#[test]
fn hello_processor_round_trips() {
    assert_round_trips(
        "processor P { output stream float out; void run() { loop { out << 0.0f; advance(); } } }",
    );
}

#[test]
fn state_and_control_flow_round_trips() {
    assert_round_trips(
        "processor P {
            output stream float out;
            float phase;
            void run() {
                loop {
                    phase = phase + 0.01f;
                    if (phase > 1.0f) phase = phase - 1.0f;
                    out << phase;
                    advance();
                }
            }
        }",
    );
}

#[test]
fn functions_and_calls_round_trip() {
    assert_round_trips(
        "processor P {
            output stream float out;
            float square (float x) { return x * x; }
            void run() { loop { out << square(0.5f); advance(); } }
        }",
    );
}

#[test]
fn structs_round_trip() {
    assert_round_trips(
        "processor P {
            output stream float out;
            struct Voice { float phase; float gain; }
            Voice voice;
            void run() { loop { voice.phase = voice.phase + 0.01f; out << voice.phase * voice.gain; advance(); } }
        }",
    );
}

#[test]
fn arrays_and_loops_round_trip() {
    assert_round_trips(
        "processor P {
            output stream float out;
            float[8] history;
            wrap<8> cursor;
            void run() {
                loop {
                    history[cursor] = 0.5f;
                    ++cursor;
                    out << history[0];
                    advance();
                }
            }
        }",
    );
}

#[test]
fn graphs_round_trip() {
    assert_round_trips(
        "processor Osc { output stream float out; void run() { loop { out << 0.0f; advance(); } } }
         processor Mix { input stream float in; output stream float out; void run() { loop { out << 0.0f; advance(); } } }
         graph G {
             output stream float out;
             let a = Osc * 2;
             let m = Mix;
             connection { a.out -> m.in; m.out -> out; }
         }",
    );
}

#[test]
fn event_handlers_round_trip() {
    assert_round_trips(
        "processor P {
            input event float gain;
            output stream float out;
            float level;
            event gain (float g) { level = g; }
            void run() { loop { out << level; advance(); } }
        }",
    );
}

#[test]
fn annotations_round_trip() {
    assert_round_trips(
        "processor P [[ main, name: \"osc\", voices: 8 ]] {
            output stream float out [[ label: \"main out\" ]];
            void run() { loop { out << 0.0f; advance(); } }
        }",
    );
}

#[test]
fn ternary_and_loop_counters_round_trip() {
    assert_round_trips(
        "processor P {
            output stream float out;
            void run() {
                var total = 0.0f;
                loop (16) { total = total + 0.5f; }
                loop { out << (total > 4.0f ? 1.0f : 0.0f); advance(); }
            }
        }",
    );
}

#[test]
fn program_hash_is_stable_across_round_trip() {
    let source =
        "processor P { output stream float out; void run() { loop { out << 0.5f; advance(); } } }";
    let program = compile(source);
    let reparsed = parse_heart_text(&program.to_heart()).unwrap();
    assert_eq!(program.hash(), reparsed.hash());
}
