// expand.rs — Processor specialisation and graph instance expansion
//
// Resolves every `let instance = Target(args) * mult / div [size];` line:
// the target processor/graph is found by name, parameterised targets are
// cloned through the parser with their specialisation parameters rewired
// (`using` → bound type, `processor` → bound alias, value → constant), and
// the clone is recursively resolved and expanded. Implicit instances are
// synthesised for processors referenced directly in connections. Once every
// graph is expanded, modules still carrying specialisation parameters are
// templates that were never instantiated and are removed.
//
// Preconditions: resolution has run at least once with errors ignored.
// Postconditions: every instance has a resolved, parameterless target;
//   no template modules remain; instance graphs are acyclic.
// Failure modes: unknown target, wrong argument counts, non-constant
//   specialisation values, recursive graphs, connection cycles.
// Side effects: clones modules into the arena; rewrites instance targets.

use std::collections::HashSet;

use crate::ast::*;
use crate::diag::{Category, CompileResult, Diagnostic, Location};
use crate::resolve;
use crate::types::TypeRules;

/// Expands all graphs under `root`.
pub fn expand_graphs(arena: &mut Arena, root: ModuleId) -> CompileResult<()> {
    create_implicit_instances(arena, root)?;

    let graphs = collect_graphs(arena, root);
    let mut stack = Vec::new();
    for g in graphs {
        // templates only expand through their specialised clones
        if arena.module(g).specialisation_params.is_empty() {
            resolve_instances_of(arena, g, &mut stack)?;
        }
    }

    remove_modules_with_specialisation_params(arena, root);

    let graphs = collect_graphs(arena, root);
    for g in graphs {
        check_connection_cycles(arena, g)?;
    }

    Ok(())
}

fn err(location: Location, message: impl Into<String>) -> Diagnostic {
    Diagnostic::new(Category::Resolution, location, message)
}

fn collect_graphs(arena: &Arena, module: ModuleId) -> Vec<ModuleId> {
    let mut out = Vec::new();
    let mut pending = vec![module];
    while let Some(m) = pending.pop() {
        if arena.module(m).is_graph() {
            out.push(m);
        }
        pending.extend(arena.module(m).sub_modules.iter().copied());
    }
    out
}

// ── Implicit instances ───────────────────────────────────────────────────

/// A connection may name a processor directly without a `let`; synthesise
/// the instance before expansion.
fn create_implicit_instances(arena: &mut Arena, module: ModuleId) -> CompileResult<()> {
    for g in collect_graphs(arena, module) {
        let connection_ids = arena.module(g).connections.clone();
        for c in connection_ids {
            let (source, dest) = {
                let connection = arena.connection(c);
                (
                    connection.source.processor_name,
                    connection.dest.processor_name,
                )
            };
            for name_expr in [source, dest].into_iter().flatten() {
                create_implicit_instance_if_needed(arena, g, name_expr)?;
            }
        }
    }
    Ok(())
}

fn create_implicit_instance_if_needed(
    arena: &mut Arena,
    graph: ModuleId,
    name_expr: ExprId,
) -> CompileResult<()> {
    let path = match &arena.expr(name_expr).kind {
        ExprKind::QualifiedIdentifier(p) => p.clone(),
        _ => return Ok(()),
    };

    // already declared with a `let`?
    for i in &arena.module(graph).instances {
        if let ExprKind::QualifiedIdentifier(existing) =
            &arena.expr(arena.instance(*i).instance_name).kind
        {
            if *existing == path {
                return Ok(());
            }
        }
    }

    // does the name resolve to a processor?
    let opts = NameSearchOptions {
        find_variables: false,
        find_types: false,
        find_functions: false,
        find_processors_and_namespaces: true,
        find_endpoints: false,
        stop_at_first_scope_with_results: true,
        required_num_function_args: None,
    };
    let scope = arena.module(graph).scope;
    let found = arena.perform_name_search(scope, &path, &opts, None);
    let is_processor = found.iter().any(|item| match item {
        FoundItem::Module(m) => arena.module(*m).is_processor_or_graph(),
        FoundItem::Alias(a) => arena.alias(*a).target.is_some(),
        _ => false,
    });
    if !is_processor {
        return Ok(());
    }

    let context = arena.expr(name_expr).context.clone();
    let instance_name = arena.alloc_expr(ExprKind::QualifiedIdentifier(path.clone()), context.clone());
    let target_processor = arena.alloc_expr(ExprKind::QualifiedIdentifier(path), context.clone());
    let instance = arena.alloc_instance(ProcessorInstance {
        context,
        instance_name,
        target_processor,
        array_size: None,
        specialisation_args: Vec::new(),
        clock_multiplier_ratio: None,
        clock_divider_ratio: None,
        was_created_implicitly: true,
        resolved_target: None,
    });
    arena.module_mut(graph).instances.push(instance);
    Ok(())
}

// ── Instance resolution ──────────────────────────────────────────────────

fn resolve_instances_of(
    arena: &mut Arena,
    graph: ModuleId,
    stack: &mut Vec<ModuleId>,
) -> CompileResult<()> {
    if stack.contains(&graph) || stack.len() > 64 {
        return Err(Diagnostic::new(
            Category::PostCheck,
            arena.module(graph).context.location.clone(),
            format!(
                "the graph '{}' contains itself recursively",
                arena.name(arena.module(graph).name)
            ),
        ));
    }
    stack.push(graph);

    resolve::run(arena, graph, true)?;

    for i in arena.module(graph).instances.clone() {
        if arena.instance(i).resolved_target.is_some() {
            continue;
        }
        let target = find_target_processor(arena, graph, i)?;

        let needs_clone = !arena.module(target).specialisation_params.is_empty();
        let resolved = if needs_clone {
            create_specialised_instance(arena, graph, i, target)?
        } else {
            let num_args = arena.instance(i).specialisation_args.len();
            if num_args != 0 {
                return Err(err(
                    arena.instance(i).context.location.clone(),
                    format!(
                        "'{}' does not take specialisation arguments",
                        arena.name(arena.module(target).name)
                    ),
                ));
            }
            target
        };

        arena.instance_mut(i).resolved_target = Some(resolved);

        if arena.module(resolved).is_graph() {
            resolve_instances_of(arena, resolved, stack)?;
        } else {
            resolve::run(arena, resolved, true)?;
        }
    }

    stack.pop();
    Ok(())
}

fn find_target_processor(
    arena: &Arena,
    graph: ModuleId,
    instance: InstanceId,
) -> CompileResult<ModuleId> {
    let target_expr = arena.instance(instance).target_processor;
    let location = arena.expr_location(target_expr);

    let path = match &arena.expr(target_expr).kind {
        ExprKind::QualifiedIdentifier(p) => p.clone(),
        // a specialisation pass may already have resolved it
        ExprKind::ProcessorRef(m) => return Ok(*m),
        _ => return Err(err(location, "cannot resolve the target processor")),
    };

    let opts = NameSearchOptions {
        find_variables: false,
        find_types: false,
        find_functions: false,
        find_processors_and_namespaces: true,
        find_endpoints: false,
        stop_at_first_scope_with_results: true,
        required_num_function_args: None,
    };
    let found = arena.perform_name_search(arena.module(graph).scope, &path, &opts, None);

    let mut matches = Vec::new();
    for item in &found {
        match item {
            FoundItem::Module(m) if arena.module(*m).is_processor_or_graph() => matches.push(*m),
            FoundItem::Alias(a) => {
                if let Some(t) = arena.alias(*a).target {
                    matches.push(t);
                }
            }
            _ => {}
        }
    }

    match matches.len() {
        1 => Ok(matches[0]),
        0 => Err(err(
            location,
            format!(
                "cannot find a processor called '{}'",
                path.to_string(&arena.interner)
            ),
        )),
        _ => Err(err(
            location,
            format!(
                "multiple matches for the processor name '{}'",
                path.to_string(&arena.interner)
            ),
        )),
    }
}

/// Clones a parameterised target and rewires its specialisation parameters
/// from the instance's arguments.
fn create_specialised_instance(
    arena: &mut Arena,
    graph: ModuleId,
    instance: InstanceId,
    target: ModuleId,
) -> CompileResult<ModuleId> {
    let location = arena.instance(instance).context.location.clone();
    let args = arena.instance(instance).specialisation_args.clone();
    let params = arena.module(target).specialisation_params.clone();

    if args.len() != params.len() {
        return Err(err(
            location,
            format!(
                "'{}' expects {} specialisation argument(s), not {}",
                arena.name(arena.module(target).name),
                params.len(),
                args.len()
            ),
        ));
    }

    let parent = arena
        .enclosing_module(arena.module(target).context.scope)
        .unwrap_or(graph);

    let clone_name = unique_clone_name(arena, parent, target, instance);
    let clone = crate::parser::clone_processor_with_new_name(arena, target, parent, &clone_name)
        .map_err(|e| Diagnostic {
            category: Category::Resolution,
            ..e
        })?;
    arena.module_mut(clone).is_specialised_clone = true;

    let clone_params = arena.module(clone).specialisation_params.clone();

    for (param, arg) in clone_params.iter().zip(args.iter()) {
        match param {
            SpecialisationParam::UsingType(u) => {
                let arg_type = arena.resolve_as_type(*arg).ok_or_else(|| {
                    err(
                        arena.expr_location(*arg),
                        "expected a type for this specialisation argument",
                    )
                })?;
                let context = arena.using(*u).context.clone();
                let type_expr = arena.alloc_expr(ExprKind::ConcreteType(arg_type), context);
                arena.using_mut(*u).target = Some(type_expr);
            }
            SpecialisationParam::ProcessorAlias(a) => {
                let target_module = match &arena.expr(*arg).kind {
                    ExprKind::ProcessorRef(m) => *m,
                    _ => {
                        return Err(err(
                            arena.expr_location(*arg),
                            "expected a processor name for this specialisation argument",
                        ))
                    }
                };
                arena.alias_mut(*a).target = Some(target_module);
            }
            SpecialisationParam::Value(v) => {
                let constant = arena.get_as_constant(*arg).ok_or_else(|| {
                    err(
                        arena.expr_location(*arg),
                        "specialisation values must be compile-time constants",
                    )
                })?;

                // check castability when the parameter type is already known
                let value = match arena
                    .var(*v)
                    .declared_type
                    .and_then(|t| arena.resolve_as_type(t))
                {
                    Some(param_type) => {
                        if !TypeRules::can_silently_cast_value_to(&param_type, &constant) {
                            return Err(Diagnostic::new(
                                Category::Type,
                                arena.expr_location(*arg),
                                format!(
                                    "cannot implicitly convert '{}' to '{param_type}'",
                                    constant.type_of()
                                ),
                            ));
                        }
                        constant.cast_to_expecting_success(&param_type.remove_const_if_present())
                    }
                    None => constant,
                };

                let context = arena.var(*v).context.clone();
                let value_expr = arena.alloc_expr(ExprKind::Constant(value), context);
                let var = arena.var_mut(*v);
                var.initial_value = Some(value_expr);
                var.declared_type = None;
                var.is_const = true;
            }
        }
    }

    // the clone is concrete now — it must survive template removal, and its
    // bound parameters must be findable as module members
    {
        let clone_module = arena.module_mut(clone);
        let params = std::mem::take(&mut clone_module.specialisation_params);
        for p in params {
            if let SpecialisationParam::Value(v) = p {
                clone_module.state_variables.push(v);
            }
        }
    }

    resolve::run(arena, clone, true)?;
    Ok(clone)
}

fn unique_clone_name(
    arena: &Arena,
    parent: ModuleId,
    target: ModuleId,
    instance: InstanceId,
) -> String {
    let instance_name = match &arena.expr(arena.instance(instance).instance_name).kind {
        ExprKind::QualifiedIdentifier(p) => arena.name(p.first()).to_string(),
        _ => "instance".to_string(),
    };
    let base = format!(
        "{}_for_{}",
        arena.name(arena.module(target).name),
        instance_name
    );

    let taken: HashSet<String> = arena
        .module(parent)
        .sub_modules
        .iter()
        .map(|m| arena.name(arena.module(*m).name).to_string())
        .collect();

    if !taken.contains(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}_{n}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

// ── Template removal ─────────────────────────────────────────────────────

/// Modules still carrying specialisation parameters after expansion are
/// uninstantiated templates; drop them from the tree.
fn remove_modules_with_specialisation_params(arena: &mut Arena, module: ModuleId) {
    let subs = arena.module(module).sub_modules.clone();
    let kept: Vec<ModuleId> = subs
        .into_iter()
        .filter(|m| arena.module(*m).specialisation_params.is_empty())
        .collect();
    for m in &kept {
        remove_modules_with_specialisation_params(arena, *m);
    }
    arena.module_mut(module).sub_modules = kept;
}

// ── Cycle detection ──────────────────────────────────────────────────────

/// The instance/connection topology of every graph must be acyclic.
fn check_connection_cycles(arena: &Arena, graph: ModuleId) -> CompileResult<()> {
    let m = arena.module(graph);

    // adjacency over instance names; the graph's own endpoints are excluded
    let mut edges: Vec<(Name, Name)> = Vec::new();
    let mut nodes: HashSet<Name> = HashSet::new();

    for c in &m.connections {
        let connection = arena.connection(*c);
        let source = connection
            .source
            .processor_name
            .and_then(|e| match &arena.expr(e).kind {
                ExprKind::QualifiedIdentifier(p) => Some(p.first()),
                _ => None,
            });
        let dest = connection
            .dest
            .processor_name
            .and_then(|e| match &arena.expr(e).kind {
                ExprKind::QualifiedIdentifier(p) => Some(p.first()),
                _ => None,
            });
        if let (Some(s), Some(d)) = (source, dest) {
            nodes.insert(s);
            nodes.insert(d);
            edges.push((s, d));
        }
    }

    // DFS over the instance graph
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let node_list: Vec<Name> = nodes.iter().copied().collect();
    let mut marks: Vec<Mark> = vec![Mark::Unvisited; node_list.len()];

    fn dfs(
        node: usize,
        node_list: &[Name],
        edges: &[(Name, Name)],
        marks: &mut [Mark],
    ) -> Option<Name> {
        marks[node] = Mark::InProgress;
        let from = node_list[node];
        for (s, d) in edges {
            if *s == from {
                let next = node_list.iter().position(|n| n == d).unwrap();
                match marks[next] {
                    Mark::InProgress => return Some(*d),
                    Mark::Unvisited => {
                        if let Some(cycle) = dfs(next, node_list, edges, marks) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
        }
        marks[node] = Mark::Done;
        None
    }

    for i in 0..node_list.len() {
        if marks[i] == Mark::Unvisited {
            if let Some(in_cycle) = dfs(i, &node_list, &edges, &mut marks) {
                return Err(Diagnostic::new(
                    Category::PostCheck,
                    m.context.location.clone(),
                    format!(
                        "the graph '{}' contains a feedback cycle through '{}'",
                        arena.name(m.name),
                        arena.name(in_cycle)
                    ),
                ));
            }
        }
    }

    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::create_root_namespace;
    use crate::diag::SourceChunk;
    use crate::parser::parse_top_level_declarations;
    use crate::sanity;

    fn parse_and_expand(source: &str) -> CompileResult<(Arena, ModuleId)> {
        let mut arena = Arena::new();
        let root = create_root_namespace(&mut arena);
        let chunk = SourceChunk::new("test.soul", source);
        parse_top_level_declarations(&mut arena, chunk, root)
            .unwrap_or_else(|e| panic!("parse error: {e}"));
        sanity::run_pre_resolution(&arena, root)?;
        resolve::run(&mut arena, root, true)?;
        expand_graphs(&mut arena, root)?;
        Ok((arena, root))
    }

    const OSC: &str = "processor Osc { output stream float out; void run() { loop { out << 0.0f; advance(); } } }\n";

    #[test]
    fn plain_instances_resolve_to_target() {
        let (arena, root) = parse_and_expand(&format!(
            "{OSC}graph G {{ output stream float out; let a = Osc; connection {{ a.out -> out; }} }}"
        ))
        .expect("expansion should succeed");
        let graph = *arena.module(root).sub_modules.last().unwrap();
        let instance = arena.instance(arena.module(graph).instances[0]);
        let target = instance.resolved_target.expect("target resolved");
        assert_eq!(arena.name(arena.module(target).name), "Osc");
    }

    #[test]
    fn implicit_instance_synthesised_from_connection() {
        let (arena, root) = parse_and_expand(&format!(
            "{OSC}graph G {{ output stream float out; connection {{ Osc.out -> out; }} }}"
        ))
        .expect("expansion should succeed");
        let graph = *arena.module(root).sub_modules.last().unwrap();
        let instances = &arena.module(graph).instances;
        assert_eq!(instances.len(), 1);
        assert!(arena.instance(instances[0]).was_created_implicitly);
    }

    #[test]
    fn parameterised_processor_is_cloned_and_rewired() {
        let source = "processor Gain (int factor) { output stream float out; void run() { loop { out << 0.0f; advance(); } } }\n\
                      graph G { output stream float out; let g = Gain(3); connection { g.out -> out; } }";
        let (arena, root) = parse_and_expand(source).expect("expansion should succeed");
        let graph = collect_graphs(&arena, root)[0];
        let instance = arena.instance(arena.module(graph).instances[0]);
        let clone = instance.resolved_target.unwrap();
        // the clone has a fresh name and a bound constant
        assert_ne!(arena.name(arena.module(clone).name), "Gain");
        assert!(arena.module(clone).specialisation_params.is_empty());
        let bound = arena.module(clone).state_variables[0];
        let init = arena.var(bound).initial_value.unwrap();
        assert_eq!(
            arena.get_as_constant(init).and_then(|v| v.as_i64()),
            Some(3)
        );
    }

    #[test]
    fn template_without_instantiation_is_removed() {
        let source = "processor Gain (int factor) { output stream float out; void run() { loop { out << 0.0f; advance(); } } }\n\
                      processor P { output stream float out; void run() { loop { out << 0.0f; advance(); } } }";
        let (arena, root) = parse_and_expand(source).expect("expansion should succeed");
        let names: Vec<&str> = arena
            .module(root)
            .sub_modules
            .iter()
            .map(|m| arena.name(arena.module(*m).name))
            .collect();
        assert!(!names.contains(&"Gain"));
        assert!(names.contains(&"P"));
    }

    #[test]
    fn wrong_specialisation_arg_count_rejected() {
        let source = "processor Gain (int factor) { output stream float out; void run() { loop { out << 0.0f; advance(); } } }\n\
                      graph G { output stream float out; let g = Gain(1, 2); connection { g.out -> out; } }";
        let e = parse_and_expand(source).expect_err("expected error");
        assert!(e.message.contains("specialisation argument"));
    }

    #[test]
    fn unknown_target_processor_rejected() {
        let source = "graph G { output stream float out; let a = Nowhere; connection { a.out -> out; } }";
        let e = parse_and_expand(source).expect_err("expected error");
        assert!(e.message.contains("cannot find a processor"));
    }

    #[test]
    fn connection_cycle_rejected() {
        let source = format!(
            "processor Thru {{ input stream float in; output stream float out; void run() {{ loop {{ out << 0.0f; advance(); }} }} }}\n\
             graph G {{ output stream float out; let a = Thru; let b = Thru; connection {{ a.out -> b.in; b.out -> a.in; }} }}"
        );
        let e = parse_and_expand(&source).expect_err("expected error");
        assert!(e.message.contains("cycle"));
    }

    #[test]
    fn clock_ratio_instances_expand() {
        let source = format!(
            "{OSC}processor Sink {{ input stream float in; output stream float out; void run() {{ loop {{ out << 0.0f; advance(); }} }} }}\n\
             graph G {{ output stream float out; let a = Osc * 2; let b = Sink / 3; connection {{ a.out -> b.in; b.out -> out; }} }}"
        );
        let (arena, root) = parse_and_expand(&source).expect("expansion should succeed");
        let graph = collect_graphs(&arena, root)[0];
        assert_eq!(arena.module(graph).instances.len(), 2);
    }
}
