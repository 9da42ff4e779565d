use criterion::{black_box, criterion_group, criterion_main, Criterion};

use soulc::diag::SourceChunk;
use soulc::{Compiler, LinkOptions};

// Benchmark scenarios spanning the pipeline: a minimal processor, a
// state-heavy synth voice, and a multi-processor graph.

const SIMPLE_PROCESSOR: &str = r#"
processor Sine {
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
}
"#;

const SYNTH_VOICE: &str = r#"
processor Voice {
    input event float noteOn;
    output stream float out;

    struct Envelope { float level; float target; float rate; }

    Envelope env;
    float[16] history;
    wrap<16> cursor;
    float phase;

    event noteOn (float velocity) { env.target = velocity; }

    float step (float current, float target, float rate) {
        return current + (target - current) * rate;
    }

    void run() {
        loop {
            env.level = step(env.level, env.target, 0.01f);
            phase = phase + 0.02f;
            if (phase > 1.0f) phase = phase - 1.0f;
            history[cursor] = phase * env.level;
            ++cursor;
            out << history[cursor];
            advance();
        }
    }
}
"#;

const GRAPH_PIPELINE: &str = r#"
processor Osc {
    output stream float out;
    float phase;
    void run() { loop { phase = phase + 0.01f; out << phase; advance(); } }
}

processor Gain (float amount) {
    input stream float in;
    output stream float out;
    void run() { loop { out << 0.0f; advance(); } }
}

graph Chain {
    output stream float out;
    let osc = Osc * 2;
    let gain = Gain(0.5f);
    connection { osc.out -> gain.in; gain.out -> out; }
}
"#;

fn compile(source: &str) -> soulc::Program {
    Compiler::build(
        SourceChunk::new("bench.soul", source),
        &LinkOptions::default(),
    )
    .expect("benchmark sources compile")
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    group.bench_function("simple_processor", |b| {
        b.iter(|| compile(black_box(SIMPLE_PROCESSOR)))
    });

    group.bench_function("synth_voice", |b| {
        b.iter(|| compile(black_box(SYNTH_VOICE)))
    });

    group.bench_function("graph_pipeline", |b| {
        b.iter(|| compile(black_box(GRAPH_PIPELINE)))
    });

    group.finish();
}

fn bench_dump(c: &mut Criterion) {
    let program = compile(SYNTH_VOICE);
    c.bench_function("heart_dump", |b| b.iter(|| black_box(&program).to_heart()));
}

criterion_group!(benches, bench_compile, bench_dump);
criterion_main!(benches);
