// analyze.rs — Post-generation checks on the HEART program
//
// Runs after every module has been lowered and calls patched: endpoint
// sample-type arity, call-graph recursion (direct or indirect), calls to
// run(), state-size budget, block-terminator completeness, and the
// conservative infinite-loop heuristic.
//
// Preconditions: program fully generated; unresolved calls patched.
// Postconditions: Ok(()) means the program is safe to hand downstream.
// Failure modes: recursion, run() calls, oversized state, non-terminated
//   blocks, trivially-infinite loops.
// Side effects: none.

use std::collections::{HashMap, HashSet};

use crate::ast::EndpointKind;
use crate::diag::{Category, CompileResult, Diagnostic};
use crate::heart::{Block, FunctionKey, Program, Statement, Terminator};

pub fn run(program: &Program, max_state_size: u64) -> CompileResult<()> {
    check_endpoints(program)?;
    check_duplicate_function_signatures(program)?;
    check_block_terminators(program)?;
    check_state_size(program, max_state_size)?;
    check_recursion_and_run_calls(program)?;
    check_infinite_loops(program)?;
    Ok(())
}

fn err(message: impl Into<String>) -> Diagnostic {
    Diagnostic::global(Category::PostCheck, message)
}

// ── Endpoints ────────────────────────────────────────────────────────────

fn check_endpoints(program: &Program) -> CompileResult<()> {
    for m in &program.modules {
        for e in m.inputs.iter().chain(m.outputs.iter()) {
            match e.kind {
                EndpointKind::Event => {
                    if e.sample_types.is_empty() {
                        return Err(err(format!(
                            "the endpoint '{}' in '{}' has no sample types",
                            e.name, m.name
                        )));
                    }
                }
                EndpointKind::Stream | EndpointKind::Value => {
                    if e.sample_types.len() != 1 {
                        return Err(err(format!(
                            "the endpoint '{}' in '{}' must have exactly one sample type",
                            e.name, m.name
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

// ── Duplicate signatures ─────────────────────────────────────────────────

fn check_duplicate_function_signatures(program: &Program) -> CompileResult<()> {
    for m in &program.modules {
        let mut seen = HashSet::new();
        for f in &m.functions {
            let mut signature = f.name.clone();
            for p in &f.parameters {
                signature.push('/');
                signature.push_str(&m.variables[*p].ty.description());
            }
            if !seen.insert(signature) {
                return Err(err(format!(
                    "the module '{}' contains duplicate definitions of '{}'",
                    m.name, f.name
                )));
            }
        }
    }
    Ok(())
}

// ── Terminators ──────────────────────────────────────────────────────────

fn check_block_terminators(program: &Program) -> CompileResult<()> {
    for m in &program.modules {
        for f in &m.functions {
            for b in &f.blocks {
                if !b.is_terminated() {
                    return Err(err(format!(
                        "internal error: block '{}' of '{}::{}' has no terminator",
                        b.name, m.name, f.name
                    )));
                }
            }
        }
    }
    Ok(())
}

// ── State size ───────────────────────────────────────────────────────────

fn check_state_size(program: &Program, max_state_size: u64) -> CompileResult<()> {
    for m in &program.modules {
        let total: u64 = m
            .state_variables()
            .map(|(_, v)| v.ty.packed_size())
            .fold(0, u64::saturating_add);
        if total > max_state_size {
            return Err(err(format!(
                "the state of '{}' is too large ({total} bytes; the limit is {max_state_size} bytes)",
                m.name
            )));
        }
    }
    Ok(())
}

// ── Recursion / run() calls ──────────────────────────────────────────────

fn check_recursion_and_run_calls(program: &Program) -> CompileResult<()> {
    // collect call edges over (module, function) keys
    let mut edges: HashMap<(usize, usize), Vec<FunctionKey>> = HashMap::new();

    for (mi, m) in program.modules.iter().enumerate() {
        for (fi, f) in m.functions.iter().enumerate() {
            let mut callees = Vec::new();
            for b in &f.blocks {
                for s in &b.statements {
                    if let Statement::Call { function, function_name, .. } = s {
                        if !function.is_resolved() {
                            return Err(err(format!(
                                "internal error: unpatched call to '{function_name}'"
                            )));
                        }
                        let callee = &program.modules[function.module].functions[function.function];
                        if callee.is_run_function {
                            return Err(err(format!(
                                "'{}::{}' calls the run() function",
                                m.name, f.name
                            )));
                        }
                        callees.push(*function);
                    }
                }
            }
            edges.insert((mi, fi), callees);
        }
    }

    // DFS for cycles
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        node: (usize, usize),
        edges: &HashMap<(usize, usize), Vec<FunctionKey>>,
        marks: &mut HashMap<(usize, usize), Mark>,
        path: &mut Vec<(usize, usize)>,
    ) -> Option<Vec<(usize, usize)>> {
        match marks.get(&node).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return None,
            Mark::InProgress => {
                let cycle_start = path.iter().position(|n| *n == node).unwrap_or(0);
                return Some(path[cycle_start..].to_vec());
            }
            Mark::Unvisited => {}
        }

        marks.insert(node, Mark::InProgress);
        path.push(node);
        if let Some(callees) = edges.get(&node) {
            for c in callees {
                if let Some(cycle) = visit((c.module, c.function), edges, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let keys: Vec<(usize, usize)> = edges.keys().copied().collect();
    for node in keys {
        let mut path = Vec::new();
        if let Some(cycle) = visit(node, &edges, &mut marks, &mut path) {
            let names: Vec<String> = cycle
                .iter()
                .map(|(mi, fi)| {
                    format!(
                        "{}::{}",
                        program.modules[*mi].name, program.modules[*mi].functions[*fi].name
                    )
                })
                .collect();
            return Err(err(format!(
                "these functions call each other recursively: {}",
                names.join(" -> ")
            )));
        }
    }

    Ok(())
}

// ── Infinite-loop heuristic ──────────────────────────────────────────────

/// Flags a function whose control flow reaches a block cycle built only
/// from unconditional branches (or constant-true conditions), with no
/// advance, return, or stream write inside the cycle. run() functions are
/// exempt — looping forever is their job. This is a single-rule pattern
/// match, not a termination analysis.
fn check_infinite_loops(program: &Program) -> CompileResult<()> {
    for m in &program.modules {
        for f in &m.functions {
            if f.has_no_body || f.blocks.is_empty() || f.is_run_function {
                continue;
            }
            if find_trivial_cycle(&f.blocks).is_some() {
                return Err(err(format!(
                    "'{}::{}' appears to contain an infinite loop that never advances",
                    m.name, f.name
                )));
            }
        }
    }
    Ok(())
}

fn find_trivial_cycle(blocks: &[Block]) -> Option<usize> {
    // successor following only "always taken" edges
    let forced_successor = |b: &Block| -> Option<usize> {
        match &b.terminator {
            Some(Terminator::Branch(t)) => Some(*t),
            Some(Terminator::BranchIf { condition, true_block, .. }) => {
                match condition.as_constant().and_then(|v| v.as_bool()) {
                    Some(true) => Some(*true_block),
                    _ => None,
                }
            }
            _ => None,
        }
    };

    let escapes = |b: &Block| -> bool {
        b.statements
            .iter()
            .any(|s| matches!(s, Statement::AdvanceClock | Statement::WriteStream { .. }))
    };

    for start in 0..blocks.len() {
        let mut seen = vec![false; blocks.len()];
        let mut current = start;
        loop {
            if escapes(&blocks[current]) {
                break;
            }
            let next = match forced_successor(&blocks[current]) {
                Some(n) => n,
                None => break,
            };
            if seen[next] {
                if next == start {
                    return Some(start);
                }
                break;
            }
            seen[current] = true;
            current = next;
        }
    }

    None
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ModuleKind;
    use crate::heart::{Expr, Function, Module, Variable, VariableRole};
    use crate::types::Type;

    fn module_with_function(f: Function) -> Program {
        let mut m = Module::new("M".into(), ModuleKind::Processor);
        m.functions.push(f);
        let mut p = Program::default();
        p.modules.push(m);
        p
    }

    #[test]
    fn unterminated_block_rejected() {
        let mut f = Function::new("f".into(), Type::void());
        f.blocks.push(Block::new("@block_0".into()));
        let p = module_with_function(f);
        let e = run(&p, u64::MAX).expect_err("expected error");
        assert!(e.message.contains("no terminator"));
    }

    #[test]
    fn direct_recursion_rejected() {
        let mut f = Function::new("f".into(), Type::void());
        let mut b = Block::new("@block_0".into());
        b.statements.push(Statement::Call {
            target: None,
            function: FunctionKey { module: 0, function: 0 },
            function_name: "M::f".into(),
            args: Vec::new(),
        });
        b.terminator = Some(Terminator::Return(None));
        f.blocks.push(b);
        let p = module_with_function(f);
        let e = run(&p, u64::MAX).expect_err("expected error");
        assert!(e.message.contains("recursively"));
    }

    #[test]
    fn call_to_run_rejected() {
        let mut run_fn = Function::new("run".into(), Type::void());
        run_fn.is_run_function = true;
        let mut b = Block::new("@block_0".into());
        b.terminator = Some(Terminator::Return(None));
        run_fn.blocks.push(b);

        let mut caller = Function::new("g".into(), Type::void());
        let mut b = Block::new("@block_0".into());
        b.statements.push(Statement::Call {
            target: None,
            function: FunctionKey { module: 0, function: 0 },
            function_name: "M::run".into(),
            args: Vec::new(),
        });
        b.terminator = Some(Terminator::Return(None));
        caller.blocks.push(b);

        let mut m = Module::new("M".into(), ModuleKind::Processor);
        m.functions.push(run_fn);
        m.functions.push(caller);
        let mut p = Program::default();
        p.modules.push(m);

        let e = run(&p, u64::MAX).expect_err("expected error");
        assert!(e.message.contains("calls the run() function"));
    }

    #[test]
    fn loop_with_advance_is_fine() {
        let mut f = Function::new("run".into(), Type::void());
        f.is_run_function = true;
        let mut b = Block::new("@block_0".into());
        b.statements.push(Statement::AdvanceClock);
        b.terminator = Some(Terminator::Branch(0));
        f.blocks.push(b);
        let p = module_with_function(f);
        run(&p, u64::MAX).expect("advancing loop is legal");
    }

    #[test]
    fn trivial_infinite_loop_flagged() {
        // a non-run function with a cycle and no escape at all
        let mut f = Function::new("f".into(), Type::void());
        let mut b = Block::new("@block_0".into());
        b.terminator = Some(Terminator::Branch(0));
        f.blocks.push(b);
        let p = module_with_function(f);
        let e = run(&p, u64::MAX).expect_err("expected error");
        assert!(e.message.contains("infinite loop"));
    }

    fn module_with_output(f: Function) -> Program {
        use crate::heart::EndpointDecl;
        let mut m = Module::new("M".into(), ModuleKind::Processor);
        m.outputs.push(EndpointDecl {
            name: "out".into(),
            index: 0,
            kind: EndpointKind::Stream,
            sample_types: vec![Type::float32()],
            array_size: None,
            annotation: Vec::new(),
        });
        m.functions.push(f);
        let mut p = Program::default();
        p.modules.push(m);
        p
    }

    #[test]
    fn run_loop_with_write_but_no_advance_not_flagged() {
        // run() is exempt even when its loop never advances
        let mut f = Function::new("run".into(), Type::void());
        f.is_run_function = true;
        let mut b = Block::new("@block_0".into());
        b.statements.push(Statement::WriteStream {
            output: 0,
            index: None,
            value: Expr::Constant(crate::types::Value::Float32(0.0)),
        });
        b.terminator = Some(Terminator::Branch(0));
        f.blocks.push(b);
        let p = module_with_output(f);
        run(&p, u64::MAX).expect("run() loops are never flagged");
    }

    #[test]
    fn run_loop_with_no_escape_not_flagged() {
        let mut f = Function::new("run".into(), Type::void());
        f.is_run_function = true;
        let mut b = Block::new("@block_0".into());
        b.terminator = Some(Terminator::Branch(0));
        f.blocks.push(b);
        let p = module_with_function(f);
        run(&p, u64::MAX).expect("run() is exempt from the heuristic");
    }

    #[test]
    fn non_run_loop_with_write_escapes() {
        // a stream write inside the cycle counts as an escape
        let mut f = Function::new("pump".into(), Type::void());
        let mut b = Block::new("@block_0".into());
        b.statements.push(Statement::WriteStream {
            output: 0,
            index: None,
            value: Expr::Constant(crate::types::Value::Float32(0.0)),
        });
        b.terminator = Some(Terminator::Branch(0));
        f.blocks.push(b);
        let p = module_with_output(f);
        run(&p, u64::MAX).expect("a writing loop is not flagged");
    }

    #[test]
    fn conditional_loop_not_flagged() {
        let mut f = Function::new("f".into(), Type::void());
        let mut b0 = Block::new("@block_0".into());
        b0.terminator = Some(Terminator::BranchIf {
            condition: Expr::Variable(0),
            true_block: 0,
            false_block: 1,
        });
        f.blocks.push(b0);
        let mut b1 = Block::new("@block_1".into());
        b1.terminator = Some(Terminator::Return(None));
        f.blocks.push(b1);

        let mut m = Module::new("M".into(), ModuleKind::Processor);
        m.variables.push(Variable {
            name: None,
            ty: Type::bool(),
            role: VariableRole::MutableLocal,
            annotation: Vec::new(),
        });
        m.functions.push(f);
        let mut p = Program::default();
        p.modules.push(m);
        run(&p, u64::MAX).expect("data-dependent loop is not flagged");
    }

    #[test]
    fn state_size_budget_enforced() {
        let mut m = Module::new("M".into(), ModuleKind::Processor);
        m.variables.push(Variable {
            name: Some("big".into()),
            ty: Type::float64().create_array(1024),
            role: VariableRole::State,
            annotation: Vec::new(),
        });
        let mut p = Program::default();
        p.modules.push(m);
        let e = run(&p, 1024).expect_err("expected error");
        assert!(e.message.contains("too large"));

        let mut p2 = Program::default();
        p2.modules.push(Module::new("M".into(), ModuleKind::Processor));
        run(&p2, 1024).expect("empty state fits");
    }

    #[test]
    fn duplicate_signatures_rejected() {
        let mut m = Module::new("M".into(), ModuleKind::Namespace);
        for _ in 0..2 {
            let mut f = Function::new("f".into(), Type::void());
            let mut b = Block::new("@block_0".into());
            b.terminator = Some(Terminator::Return(None));
            f.blocks.push(b);
            m.functions.push(f);
        }
        let mut p = Program::default();
        p.modules.push(m);
        let e = run(&p, u64::MAX).expect_err("expected error");
        assert!(e.message.contains("duplicate"));
    }

    #[test]
    fn stream_endpoint_type_arity() {
        use crate::heart::EndpointDecl;
        let mut m = Module::new("M".into(), ModuleKind::Processor);
        m.outputs.push(EndpointDecl {
            name: "out".into(),
            index: 0,
            kind: EndpointKind::Stream,
            sample_types: vec![Type::float32(), Type::int32()],
            array_size: None,
            annotation: Vec::new(),
        });
        let mut p = Program::default();
        p.modules.push(m);
        let e = run(&p, u64::MAX).expect_err("expected error");
        assert!(e.message.contains("exactly one sample type"));
    }
}
