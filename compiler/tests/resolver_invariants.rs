// Universal resolver invariants: idempotence of the fixed point, full
// resolution of every node, terminator completeness, and acyclic graphs.

use soulc::ast::{create_root_namespace, Arena, ModuleId};
use soulc::diag::SourceChunk;
use soulc::heart::Terminator;
use soulc::parser::parse_top_level_declarations;
use soulc::{resolve, sanity};
use soulc::{Compiler, LinkOptions, Program};

fn parse_and_resolve(source: &str) -> (Arena, ModuleId) {
    let mut arena = Arena::new();
    let root = create_root_namespace(&mut arena);
    let chunk = SourceChunk::new("test.soul", source);
    parse_top_level_declarations(&mut arena, chunk, root)
        .unwrap_or_else(|e| panic!("parse error: {e}"));
    sanity::run_pre_resolution(&arena, root).unwrap_or_else(|e| panic!("sanity error: {e}"));
    resolve::run(&mut arena, root, false).unwrap_or_else(|e| panic!("resolve error: {e}"));
    (arena, root)
}

fn compile(source: &str) -> Program {
    Compiler::build(
        SourceChunk::new("test.soul", source),
        &LinkOptions::default(),
    )
    .unwrap_or_else(|e| panic!("compile failed: {e}"))
}

const SIMPLE: &str =
    "processor P { output stream float out; float gain; void run() { loop { out << gain * 0.5f; advance(); } } }";

#[test]
fn resolver_is_idempotent_on_resolved_modules() {
    let (mut arena, root) = parse_and_resolve(SIMPLE);

    // a second run over the already-resolved tree must do nothing
    let stats = resolve::run(&mut arena, root, false).expect("second run succeeds");
    assert_eq!(stats.num_replaced, 0);
    assert_eq!(stats.num_failures, 0);
}

#[test]
fn resolved_module_is_flagged_fully_resolved() {
    let (arena, root) = parse_and_resolve(SIMPLE);
    let p = arena.module(root).sub_modules.iter().copied().find(|m| {
        arena.name(arena.module(*m).name) == "P"
    });
    assert!(arena.module(p.expect("P exists")).is_fully_resolved);
}

#[test]
fn every_block_has_exactly_one_terminator() {
    let program = compile(
        "processor P {
            output stream float out;
            float f (bool b) { if (b) return 1.0f; return 0.0f; }
            void run() {
                var n = 0;
                for (var i = 0; i < 8; ++i) { n = n + 1; }
                loop { out << f(n > 4); advance(); }
            }
        }",
    );
    for m in &program.modules {
        for f in &m.functions {
            for b in &f.blocks {
                assert!(
                    b.terminator.is_some(),
                    "block '{}' of {}::{} is not terminated",
                    b.name,
                    m.name,
                    f.name
                );
            }
        }
    }
}

#[test]
fn non_void_functions_return_on_every_reachable_path() {
    let program = compile(
        "processor P {
            output stream float out;
            int pick (bool b) { if (b) return 1; else return 2; }
            void run() { loop { out << float(pick(true)); advance(); } }
        }",
    );

    // walk the CFG of every non-void function: every path from the entry
    // must reach a Return
    for m in &program.modules {
        for f in &m.functions {
            if f.return_type.is_void() || f.blocks.is_empty() {
                continue;
            }
            let mut visited = vec![false; f.blocks.len()];
            let mut pending = vec![0usize];
            while let Some(b) = pending.pop() {
                if visited[b] {
                    continue;
                }
                visited[b] = true;
                match f.blocks[b].terminator.as_ref().expect("terminated") {
                    Terminator::Return(_) => {}
                    Terminator::Branch(t) => pending.push(*t),
                    Terminator::BranchIf {
                        true_block,
                        false_block,
                        ..
                    } => {
                        pending.push(*true_block);
                        pending.push(*false_block);
                    }
                }
            }
        }
    }
}

#[test]
fn folded_constants_leave_no_state_variable() {
    let program = compile(
        "processor P {
            output stream float out;
            const float gain = 0.5f;
            int unwritten = 42;
            void run() { loop { out << gain * float(unwritten); advance(); } }
        }",
    );
    let p = program.module_with_name("P").unwrap();
    assert_eq!(p.state_variables().count(), 0);
}

#[test]
fn written_state_survives_folding() {
    let program = compile(
        "processor P {
            output stream float out;
            float phase;
            void run() { loop { phase = phase + 0.01f; out << phase; advance(); } }
        }",
    );
    let p = program.module_with_name("P").unwrap();
    assert_eq!(p.state_variables().count(), 1);
}

#[test]
fn processor_instance_graph_is_acyclic() {
    let program = compile(
        "processor A { output stream float out; void run() { loop { out << 0.0f; advance(); } } }
         processor B { input stream float in; output stream float out; void run() { loop { out << 0.0f; advance(); } } }
         graph G { output stream float out; let a = A; let b = B; connection { a.out -> b.in; b.out -> out; } }",
    );

    let g = program.module_with_name("G").unwrap();
    // Kahn-style check over the instance edges
    let names: Vec<&str> = g
        .processor_instances
        .iter()
        .map(|i| i.instance_name.as_str())
        .collect();
    let mut edges = Vec::new();
    for c in &g.connections {
        if let (Some(s), Some(d)) = (&c.source_processor, &c.dest_processor) {
            edges.push((s.as_str(), d.as_str()));
        }
    }
    let mut remaining = names.clone();
    let mut remaining_edges = edges.clone();
    while !remaining.is_empty() {
        let position = remaining
            .iter()
            .position(|n| remaining_edges.iter().all(|(_, d)| d != n));
        match position {
            Some(p) => {
                let removed = remaining.remove(p);
                remaining_edges.retain(|(s, _)| *s != removed);
            }
            None => panic!("instance graph contains a cycle"),
        }
    }
}

#[test]
fn init_function_zeroes_state() {
    let program = compile(
        "processor P {
            output stream float out;
            float phase;
            void run() { loop { phase = phase + 1.0f; out << phase; advance(); } }
        }",
    );
    let p = program.module_with_name("P").unwrap();
    let init = &p.functions[p.find_function("_init").expect("_init exists")];
    assert!(init.is_init_function);
    assert!(!init.blocks.is_empty());
    assert!(!init.blocks[0].statements.is_empty());
}

#[test]
fn state_initialisers_reach_the_init_function() {
    let program = compile(
        "processor P {
            output stream float out;
            float phase = 0.25f;
            void run() { loop { phase = phase + 1.0f; out << phase; advance(); } }
        }",
    );
    let p = program.module_with_name("P").unwrap();
    let init = &p.functions[p.find_function("_init").unwrap()];
    let text = format!("{:?}", init.blocks[0].statements);
    assert!(text.contains("0.25"), "init should assign the declared value");
}
