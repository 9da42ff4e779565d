// sanity.rs — Structural sanity checks on the AST
//
// Two entry points: `run_pre_resolution` enforces the structural rules that
// need no name or type information (every processor has an output, exactly
// one run function, event functions match an input, no duplicate names in a
// scope). `run_post_resolution` runs just before HEART generation, when
// every type is known, and checks the subtler rules (packed-size cap,
// multidimensional arrays, endpoint sample types, constant initialisers).
//
// The cast-expectation helpers here are shared with the resolver and the
// HEART generator.
//
// Preconditions: pre checks need only a parsed AST; post checks need a
//   fully-resolved module.
// Postconditions: Ok(()) when every rule holds.
// Failure modes: first violation aborts with a located diagnostic.
// Side effects: none.

use std::collections::HashSet;
use std::rc::Rc;

use crate::ast::*;
use crate::diag::{Category, CompileResult, Diagnostic, Location};
use crate::types::{StructType, Type, TypeRules, UnaryOp, Value};

// ── Shared helpers ───────────────────────────────────────────────────────

pub fn err(location: Location, message: impl Into<String>) -> Diagnostic {
    Diagnostic::new(Category::Sanity, location, message)
}

fn type_err(location: Location, message: impl Into<String>) -> Diagnostic {
    Diagnostic::new(Category::Type, location, message)
}

pub fn throw_if_not_readable_value(arena: &Arena, e: ExprId) -> CompileResult<()> {
    if arena.is_resolved_as_value(e) {
        return Ok(());
    }
    let location = arena.expr_location(e);
    match &arena.expr(e).kind {
        ExprKind::OutputEndpointRef(_) => Err(type_err(location, "cannot read from an output")),
        ExprKind::ProcessorRef(_) => Err(type_err(location, "cannot use a processor as a value")),
        _ => Err(type_err(location, "expected a value")),
    }
}

pub fn throw_if_not_readable_type(arena: &Arena, e: ExprId) -> CompileResult<()> {
    if arena.is_resolved_as_type(e) {
        return Ok(());
    }
    let location = arena.expr_location(e);
    match &arena.expr(e).kind {
        ExprKind::ProcessorRef(_) => Err(type_err(location, "cannot use a processor as a type")),
        _ => Err(type_err(location, "expected a type")),
    }
}

pub fn throw_if_not_array_or_vector(arena: &Arena, e: ExprId) -> CompileResult<()> {
    throw_if_not_readable_value(arena, e)?;
    match arena.result_type(e) {
        Some(t) if t.is_array_or_vector() => Ok(()),
        _ => Err(type_err(
            arena.expr_location(e),
            "expected an array or vector",
        )),
    }
}

pub fn check_array_subscript(arena: &Arena, e: ExprId) -> CompileResult<()> {
    if let ExprKind::ArrayElementRef { object, .. } = &arena.expr(e).kind {
        if !arena.is_output_endpoint(*object) && !arena.is_resolved_as_endpoint(*object) {
            throw_if_not_array_or_vector(arena, *object)?;
        }
    }
    Ok(())
}

pub fn throw_if_wrong_number_of_elements(
    location: &Location,
    target: &Type,
    available: usize,
) -> CompileResult<()> {
    if target.is_fixed_size_aggregate() && target.num_aggregate_elements() != Some(available as u64)
    {
        return Err(type_err(
            location.clone(),
            format!("wrong number of values to create a '{target}'"),
        ));
    }
    Ok(())
}

/// Validates that `source` silently converts to `target`, recursing into
/// comma-separated initialiser lists.
pub fn expect_silent_cast_possible(
    arena: &Arena,
    location: &Location,
    target: &Type,
    source: ExprId,
) -> CompileResult<()> {
    if let ExprKind::CommaSeparatedList(items) = &arena.expr(source).kind {
        throw_if_wrong_number_of_elements(location, target, items.len())?;

        if target.is_array_or_vector() {
            let element = target
                .element_type()
                .expect("aggregate type has an element type");
            for item in items {
                expect_silent_cast_possible(arena, &arena.expr_location(*item), &element, *item)?;
            }
            return Ok(());
        }

        if let Some(s) = target.struct_ref() {
            let members = s.members.borrow();
            for (i, item) in items.iter().enumerate() {
                expect_silent_cast_possible(
                    arena,
                    &arena.expr_location(*item),
                    &members[i].ty,
                    *item,
                )?;
            }
            return Ok(());
        }

        return Err(type_err(
            location.clone(),
            format!("cannot create a '{target}' from an initialiser list"),
        ));
    }

    let source_type = arena
        .result_type(source)
        .ok_or_else(|| type_err(location.clone(), "expected a value"))?;

    if TypeRules::can_silently_cast_to(target, &source_type) {
        return Ok(());
    }

    if let Some(c) = arena.get_as_constant(source) {
        if TypeRules::can_silently_cast_value_to(target, &c) {
            return Ok(());
        }
        if c.type_of().is_primitive() {
            return Err(type_err(
                location.clone(),
                format!(
                    "cannot implicitly convert {} ('{}') to '{}'",
                    c.description(),
                    c.type_of(),
                    target
                ),
            ));
        }
    }

    Err(type_err(
        location.clone(),
        format!("cannot implicitly convert '{source_type}' to '{target}'"),
    ))
}

/// Multi-type variant for event endpoints: exactly one target must accept
/// the source, unless one matches exactly.
pub fn expect_silent_cast_possible_multi(
    arena: &Arena,
    location: &Location,
    targets: &[Type],
    source: ExprId,
) -> CompileResult<()> {
    let source_type = arena
        .result_type(source)
        .ok_or_else(|| type_err(location.clone(), "expected a value"))?;

    let mut matches = 0;
    for t in targets {
        if source_type.is_identical(t) {
            return Ok(());
        }
        if TypeRules::can_silently_cast_to(t, &source_type)
            || arena
                .get_as_constant(source)
                .map_or(false, |c| TypeRules::can_silently_cast_value_to(t, &c))
        {
            matches += 1;
        }
    }

    let descriptions = targets
        .iter()
        .map(Type::description)
        .collect::<Vec<_>>()
        .join(", ");

    match matches {
        0 => Err(type_err(
            location.clone(),
            format!("cannot implicitly convert '{source_type}' to ({descriptions})"),
        )),
        1 => Ok(()),
        _ => Err(type_err(
            location.clone(),
            format!("ambiguous cast from '{source_type}' to ({descriptions})"),
        )),
    }
}

pub fn check_delay_line_length(location: &Location, v: &Value) -> CompileResult<i64> {
    if !v.type_of().is_primitive_integer() {
        return Err(Diagnostic::new(
            Category::Lowering,
            location.clone(),
            "a delay line length must be an integer",
        ));
    }
    let value = v.as_i64().unwrap();
    if value < 1 {
        return Err(Diagnostic::new(
            Category::Lowering,
            location.clone(),
            "a delay line must have a length of at least 1",
        ));
    }
    if value > MAX_DELAY_LINE_LENGTH {
        return Err(Diagnostic::new(
            Category::Lowering,
            location.clone(),
            format!("a delay line cannot be longer than {MAX_DELAY_LINE_LENGTH}"),
        ));
    }
    Ok(value)
}

/// Structural signature used for duplicate-overload detection.
pub fn function_signature_id(arena: &Arena, f: FunctionId) -> String {
    let function = arena.function(f);
    let mut sig = arena.name(function.name).to_string();
    for p in &function.parameters {
        let t = arena
            .var_type(*p)
            .map(|t| t.remove_const_if_present().remove_reference_if_present().description())
            .unwrap_or_else(|| "?".into());
        sig.push('/');
        sig.push_str(&t);
    }
    sig
}

pub fn check_for_duplicate_functions(arena: &Arena, functions: &[FunctionId]) -> CompileResult<()> {
    let mut seen = HashSet::new();
    for f in functions {
        if arena.function(*f).is_generic() {
            continue;
        }
        let sig = function_signature_id(arena, *f);
        if !seen.insert(sig) {
            return Err(Diagnostic::new(
                Category::PostCheck,
                arena.function(*f).context.location.clone(),
                "a function with matching parameters has already been defined",
            ));
        }
    }
    Ok(())
}

// ── Pre-resolution checks ────────────────────────────────────────────────

/// Structural rules checkable straight after parsing.
pub fn run_pre_resolution(arena: &Arena, module: ModuleId) -> CompileResult<()> {
    check_overall_structure(arena, module)?;
    run_duplicate_name_checker(arena, module)
}

fn check_overall_structure(arena: &Arena, module: ModuleId) -> CompileResult<()> {
    let m = arena.module(module);

    if m.is_processor_or_graph() && m.outputs.is_empty() {
        return Err(err(
            m.context.location.clone(),
            "a processor must declare at least one output",
        ));
    }

    if m.is_processor() {
        let mut num_run_functions = 0;

        for f in &m.functions {
            let function = arena.function(*f);
            if is_run_function(arena, *f) {
                let is_void = arena
                    .resolve_as_type(function.return_type)
                    .map_or(false, |t| t.is_void());
                if !is_void {
                    return Err(err(
                        function.context.location.clone(),
                        "the run() function must return 'void'",
                    ));
                }
                if !function.parameters.is_empty() {
                    return Err(err(
                        function.context.location.clone(),
                        "the run() function cannot take any parameters",
                    ));
                }
                num_run_functions += 1;
            }

            if function.is_event_function {
                let has_matching_input = m
                    .inputs
                    .iter()
                    .any(|e| arena.endpoint(*e).name == function.name);
                if !has_matching_input {
                    return Err(err(
                        function.context.location.clone(),
                        format!(
                            "no input event declaration matches '{}'",
                            arena.name(function.name)
                        ),
                    ));
                }
            }
        }

        if num_run_functions == 0 {
            return Err(err(
                m.context.location.clone(),
                "a processor must contain a run() function",
            ));
        }
        if num_run_functions > 1 {
            return Err(err(
                m.context.location.clone(),
                "a processor cannot contain more than one run() function",
            ));
        }
    }

    for sub in &m.sub_modules {
        check_overall_structure(arena, *sub)?;
    }
    Ok(())
}

pub fn is_run_function(arena: &Arena, f: FunctionId) -> bool {
    let function = arena.function(f);
    !function.is_event_function && arena.name(function.name) == "run"
}

// ── Duplicate names ──────────────────────────────────────────────────────

struct DuplicateNameChecker<'a> {
    arena: &'a Arena,
    seen: Vec<(Name, Location)>,
}

impl<'a> DuplicateNameChecker<'a> {
    fn new(arena: &'a Arena) -> Self {
        DuplicateNameChecker {
            arena,
            seen: Vec::new(),
        }
    }

    fn check(&mut self, name: Name, location: &Location) -> CompileResult<()> {
        self.check_without_adding(name, location)?;
        self.seen.push((name, location.clone()));
        Ok(())
    }

    fn check_without_adding(&self, name: Name, location: &Location) -> CompileResult<()> {
        if self.seen.iter().any(|(n, _)| *n == name) {
            return Err(err(
                location.clone(),
                format!("the name '{}' is already in use", self.arena.name(name)),
            ));
        }
        Ok(())
    }
}

pub fn run_duplicate_name_checker(arena: &Arena, module: ModuleId) -> CompileResult<()> {
    let m = arena.module(module);

    {
        let mut checker = DuplicateNameChecker::new(arena);
        for io in m.inputs.iter().chain(m.outputs.iter()) {
            let e = arena.endpoint(*io);
            checker.check(e.name, &e.context.location)?;
        }
        for v in &m.state_variables {
            let var = arena.var(*v);
            checker.check(var.name, &var.context.location)?;
        }
        for s in &m.structs {
            let decl = arena.struct_decl(*s);
            checker.check(decl.name, &decl.context.location)?;
        }
        for u in &m.usings {
            let using = arena.using(*u);
            checker.check(using.name, &using.context.location)?;
        }
        for sub in &m.sub_modules {
            let sub_module = arena.module(*sub);
            checker.check(sub_module.name, &sub_module.context.location)?;
        }
        // functions last — overloads share a name legitimately
        for f in &m.functions {
            let function = arena.function(*f);
            if !function.is_event_function {
                checker.check_without_adding(function.name, &function.name_location)?;
            }
        }
    }

    for f in &m.functions {
        let function = arena.function(*f);
        let mut checker = DuplicateNameChecker::new(arena);
        for p in &function.parameters {
            let var = arena.var(*p);
            checker.check(var.name, &var.context.location)?;
        }
        if let Some(body) = function.body {
            check_block_duplicates(arena, body)?;
        }
    }

    for s in &m.structs {
        let decl = arena.struct_decl(*s);
        let mut checker = DuplicateNameChecker::new(arena);
        for name in &decl.member_names {
            checker.check(*name, &decl.context.location)?;
        }
    }

    check_annotation_duplicates(arena, &m.annotation)?;
    for io in m.inputs.iter().chain(m.outputs.iter()) {
        check_annotation_duplicates(arena, &arena.endpoint(*io).annotation)?;
    }

    for sub in &m.sub_modules {
        run_duplicate_name_checker(arena, *sub)?;
    }
    Ok(())
}

fn check_annotation_duplicates(_arena: &Arena, annotation: &Annotation) -> CompileResult<()> {
    let mut seen = HashSet::new();
    for p in &annotation.properties {
        if !seen.insert(p.key.clone()) {
            return Err(err(
                p.key_location.clone(),
                format!("duplicate annotation key '{}'", p.key),
            ));
        }
    }
    Ok(())
}

fn check_block_duplicates(arena: &Arena, stmt: StmtId) -> CompileResult<()> {
    match &arena.stmt(stmt).kind {
        StmtKind::Block(b) => {
            let block = arena.block(*b);
            let mut checker = DuplicateNameChecker::new(arena);
            for s in &block.statements {
                if let StmtKind::VarDecl(v) = arena.stmt(*s).kind {
                    let var = arena.var(v);
                    checker.check(var.name, &var.context.location)?;
                }
            }
            for s in &block.statements {
                check_block_duplicates(arena, *s)?;
            }
        }
        StmtKind::If {
            true_branch,
            false_branch,
            ..
        } => {
            check_block_duplicates(arena, *true_branch)?;
            if let Some(f) = false_branch {
                check_block_duplicates(arena, *f)?;
            }
        }
        StmtKind::Loop { body, .. } => check_block_duplicates(arena, *body)?,
        _ => {}
    }
    Ok(())
}

// ── Post-resolution checks ───────────────────────────────────────────────

/// Runs once the resolver reports a module fully resolved, immediately
/// before HEART generation.
pub fn run_post_resolution(arena: &Arena, module: ModuleId) -> CompileResult<()> {
    run_duplicate_name_checker(arena, module)?;
    check_module_post_resolution(arena, module)?;
    check_inc_dec_collisions(arena, module)
}

fn check_module_post_resolution(arena: &Arena, module: ModuleId) -> CompileResult<()> {
    let m = arena.module(module);

    check_for_duplicate_functions(arena, &m.functions)?;

    for io in m.inputs.iter().chain(m.outputs.iter()) {
        check_endpoint(arena, *io)?;
    }

    for v in &m.state_variables {
        check_variable(arena, *v)?;
        if m.is_processor() {
            let var = arena.var(*v);
            if let Some(init) = var.initial_value {
                if !arena.is_compile_time_constant(init) {
                    return Err(err(
                        arena.expr_location(init),
                        "state variable initialisers must be compile-time constants",
                    ));
                }
            }
        }
        if m.is_namespace() {
            let var = arena.var(*v);
            if !var.is_external
                && !var
                    .initial_value
                    .map_or(false, |init| arena.is_compile_time_constant(init))
            {
                return Err(err(
                    var.context.location.clone(),
                    "namespace-level variables must be compile-time constants",
                ));
            }
        }
    }

    for s in &m.structs {
        check_struct_recursion(arena, *s)?;
    }

    for f in &m.functions {
        let function = arena.function(*f);
        if function.is_generic() {
            continue;
        }
        for p in &function.parameters {
            check_variable(arena, *p)?;
            if let Some(t) = arena.var_type(*p) {
                if t.is_void() {
                    return Err(err(
                        arena.var(*p).context.location.clone(),
                        "function parameters cannot be void",
                    ));
                }
            }
        }
        if let Some(body) = function.body {
            check_statement_variables(arena, body)?;
        }
    }

    for i in &m.instances {
        let instance = arena.instance(*i);
        check_array_size_limit(arena, instance.array_size, MAX_PROCESSOR_ARRAY_SIZE)?;
    }

    for c in &m.connections {
        let connection = arena.connection(*c);
        if let Some(delay) = connection.delay_length {
            throw_if_not_readable_value(arena, delay)?;
            if let Some(v) = arena.get_as_constant(delay) {
                check_delay_line_length(&arena.expr_location(delay), &v)?;
            }
        }
    }

    check_unary_operators(arena, module)?;

    for sub in &m.sub_modules {
        check_module_post_resolution(arena, *sub)?;
    }
    Ok(())
}

fn check_endpoint(arena: &Arena, e: EndpointId) -> CompileResult<()> {
    let endpoint = arena.endpoint(e);
    let location = &endpoint.context.location;

    if endpoint.kind != EndpointKind::Event && endpoint.sample_types.len() != 1 {
        return Err(err(
            location.clone(),
            "only event endpoints may declare multiple types",
        ));
    }

    for t in &endpoint.sample_types {
        let sample = arena
            .resolve_as_type(*t)
            .ok_or_else(|| type_err(arena.expr_location(*t), "expected a type"))?;
        if sample.is_reference() || sample.is_const() {
            return Err(type_err(
                arena.expr_location(*t),
                "endpoint types cannot be references or const",
            ));
        }
        if endpoint.kind == EndpointKind::Stream && !sample.is_scalar() {
            return Err(type_err(
                arena.expr_location(*t),
                format!("'{sample}' is not a valid stream type"),
            ));
        }
        if sample.is_void() {
            return Err(type_err(
                arena.expr_location(*t),
                "endpoint types cannot be void",
            ));
        }
    }

    check_array_size_limit(arena, endpoint.array_size, MAX_ENDPOINT_ARRAY_SIZE)
}

fn check_array_size_limit(
    arena: &Arena,
    size: Option<ExprId>,
    max_size: i64,
) -> CompileResult<()> {
    if let Some(size_expr) = size {
        let location = arena.expr_location(size_expr);
        match arena.get_as_constant(size_expr) {
            Some(v) => {
                if v.type_of().is_primitive_integer() {
                    let n = v.as_i64().unwrap();
                    if n < 1 || n > max_size {
                        return Err(err(location, "illegal array size"));
                    }
                } else {
                    return Err(err(location, "an array size must be an integer"));
                }
            }
            None => return Err(err(location, "an array size must be a constant")),
        }
    }
    Ok(())
}

fn check_variable(arena: &Arena, v: VarId) -> CompileResult<()> {
    let var = arena.var(v);

    if let Some(declared) = var.declared_type {
        throw_if_not_readable_type(arena, declared)?;
    } else if let Some(init) = var.initial_value {
        throw_if_not_readable_value(arena, init)?;
    }

    let location = var
        .declared_type
        .map(|t| arena.expr_location(t))
        .unwrap_or_else(|| var.context.location.clone());

    let t = arena
        .var_type(v)
        .ok_or_else(|| type_err(location.clone(), "expected a type"))?;

    if t.is_void() {
        return Err(type_err(location, "variables cannot be void"));
    }

    if t.is_packed_size_too_big() {
        return Err(type_err(
            location,
            format!(
                "the type '{t}' is too big ({} bytes; the limit is {} bytes)",
                t.packed_size(),
                crate::types::MAX_PACKED_OBJECT_SIZE
            ),
        ));
    }

    throw_if_multidimensional_array(&location, &t)
}

pub fn throw_if_multidimensional_array(location: &Location, t: &Type) -> CompileResult<()> {
    if t.is_array() {
        let element = t.element_type().expect("arrays have element types");
        if element.is_array() {
            return Err(type_err(
                location.clone(),
                "not yet implemented: multi-dimensional arrays",
            ));
        }
        throw_if_multidimensional_array(location, &element)?;
    }
    if let Some(s) = t.struct_ref() {
        for member in s.members.borrow().iter() {
            throw_if_multidimensional_array(location, &member.ty)?;
        }
    }
    Ok(())
}

fn check_statement_variables(arena: &Arena, stmt: StmtId) -> CompileResult<()> {
    match &arena.stmt(stmt).kind {
        StmtKind::Block(b) => {
            for s in &arena.block(*b).statements {
                check_statement_variables(arena, *s)?;
            }
        }
        StmtKind::VarDecl(v) => check_variable(arena, *v)?,
        StmtKind::If {
            true_branch,
            false_branch,
            ..
        } => {
            check_statement_variables(arena, *true_branch)?;
            if let Some(f) = false_branch {
                check_statement_variables(arena, *f)?;
            }
        }
        StmtKind::Loop { body, .. } => check_statement_variables(arena, *body)?,
        _ => {}
    }
    Ok(())
}

/// Detects `struct S { S s; }` and mutually-recursive struct pairs.
fn check_struct_recursion(arena: &Arena, s: StructDeclId) -> CompileResult<()> {
    let decl = arena.struct_decl(s);
    let mut stack: Vec<Rc<StructType>> = Vec::new();
    visit_struct(&decl.structure, &mut stack, &decl.context.location)
}

fn visit_struct(
    s: &Rc<StructType>,
    stack: &mut Vec<Rc<StructType>>,
    location: &Location,
) -> CompileResult<()> {
    if stack.iter().any(|other| Rc::ptr_eq(other, s)) {
        if stack.last().map_or(false, |last| Rc::ptr_eq(last, s)) {
            return Err(type_err(
                location.clone(),
                format!("the type '{}' contains itself", s.name),
            ));
        }
        return Err(type_err(
            location.clone(),
            format!(
                "the types '{}' and '{}' refer to each other",
                s.name,
                stack.last().map(|l| l.name.as_str()).unwrap_or("?")
            ),
        ));
    }

    stack.push(s.clone());
    let members = s.members.borrow();
    for m in members.iter() {
        let mut t = m.ty.clone();
        loop {
            if let Some(inner) = t.struct_ref() {
                visit_struct(&inner, stack, location)?;
                break;
            }
            match t.element_type() {
                Some(e) => t = e,
                None => break,
            }
        }
    }
    drop(members);
    stack.pop();
    Ok(())
}

// ── Unary operator suitability ───────────────────────────────────────────

fn check_unary_operators(arena: &Arena, module: ModuleId) -> CompileResult<()> {
    let m = arena.module(module);
    for f in &m.functions {
        let function = arena.function(*f);
        if function.is_generic() {
            continue;
        }
        if let Some(body) = function.body {
            check_unary_in_stmt(arena, body)?;
        }
    }
    Ok(())
}

fn check_unary_in_stmt(arena: &Arena, stmt: StmtId) -> CompileResult<()> {
    for_each_expr_in_stmt(arena, stmt, &mut |e| {
        if let ExprKind::Unary { op, source } = &arena.expr(e).kind {
            if let Some(t) = arena.result_type(*source) {
                let check_type = if *op == UnaryOp::Negate && t.is_bounded_int() {
                    Type::int32()
                } else {
                    t.clone()
                };
                if !op.is_type_suitable(&check_type) {
                    return Err(type_err(
                        arena.expr_location(*source),
                        format!("the '{}' operator cannot take an operand of type '{t}'", op.symbol()),
                    ));
                }
            }
        }
        Ok(())
    })
}

// ── Pre/post inc-dec collision check ─────────────────────────────────────

/// Within a single statement, a variable modified by `++`/`--` may not also
/// be read or modified elsewhere (the evaluation order would be ambiguous).
fn check_inc_dec_collisions(arena: &Arena, module: ModuleId) -> CompileResult<()> {
    let m = arena.module(module);
    for f in &m.functions {
        let function = arena.function(*f);
        if function.is_generic() {
            continue;
        }
        if let Some(body) = function.body {
            check_inc_dec_in_stmt(arena, body)?;
        }
    }
    for sub in &m.sub_modules {
        check_inc_dec_collisions(arena, *sub)?;
    }
    Ok(())
}

fn check_inc_dec_in_stmt(arena: &Arena, stmt: StmtId) -> CompileResult<()> {
    match &arena.stmt(stmt).kind {
        StmtKind::Block(b) => {
            for s in &arena.block(*b).statements {
                check_inc_dec_in_stmt(arena, *s)?;
            }
            Ok(())
        }
        StmtKind::If {
            true_branch,
            false_branch,
            ..
        } => {
            check_inc_dec_in_stmt(arena, *true_branch)?;
            if let Some(f) = false_branch {
                check_inc_dec_in_stmt(arena, *f)?;
            }
            Ok(())
        }
        StmtKind::Loop { body, .. } => check_inc_dec_in_stmt(arena, *body),
        _ => {
            let mut modified: Vec<VarId> = Vec::new();
            let mut referenced: Vec<VarId> = Vec::new();
            for_each_expr_in_stmt(arena, stmt, &mut |e| {
                match &arena.expr(e).kind {
                    ExprKind::PreOrPostIncDec { target, .. } => {
                        if let ExprKind::VariableRef(v) = arena.expr(*target).kind {
                            if referenced.contains(&v) || modified.contains(&v) {
                                return Err(err(
                                    arena.expr_location(e),
                                    "this variable cannot be incremented and referenced in the same statement",
                                ));
                            }
                            modified.push(v);
                            referenced.push(v);
                        }
                    }
                    ExprKind::VariableRef(v) => {
                        if modified.contains(v) {
                            return Err(err(
                                arena.expr_location(e),
                                "this variable cannot be incremented and referenced in the same statement",
                            ));
                        }
                        referenced.push(*v);
                    }
                    _ => {}
                }
                Ok(())
            })
        }
    }
}

// ── Expression iteration ─────────────────────────────────────────────────

/// Pre-order visit of every expression in a statement subtree.
pub fn for_each_expr_in_stmt(
    arena: &Arena,
    stmt: StmtId,
    f: &mut impl FnMut(ExprId) -> CompileResult<()>,
) -> CompileResult<()> {
    match &arena.stmt(stmt).kind {
        StmtKind::Block(b) => {
            for s in &arena.block(*b).statements {
                for_each_expr_in_stmt(arena, *s, f)?;
            }
        }
        StmtKind::If {
            condition,
            true_branch,
            false_branch,
        } => {
            for_each_expr(arena, *condition, f)?;
            for_each_expr_in_stmt(arena, *true_branch, f)?;
            if let Some(fb) = false_branch {
                for_each_expr_in_stmt(arena, *fb, f)?;
            }
        }
        StmtKind::Loop {
            condition,
            num_iterations,
            iterator,
            body,
            ..
        } => {
            for e in [condition, num_iterations, iterator].into_iter().flatten() {
                for_each_expr(arena, *e, f)?;
            }
            for_each_expr_in_stmt(arena, *body, f)?;
        }
        StmtKind::Return { value } => {
            if let Some(v) = value {
                for_each_expr(arena, *v, f)?;
            }
        }
        StmtKind::Expression(e) => for_each_expr(arena, *e, f)?,
        StmtKind::VarDecl(v) => {
            let var = arena.var(*v);
            if let Some(t) = var.declared_type {
                for_each_expr(arena, t, f)?;
            }
            if let Some(init) = var.initial_value {
                for_each_expr(arena, init, f)?;
            }
        }
        StmtKind::Break | StmtKind::Continue | StmtKind::Noop => {}
    }
    Ok(())
}

/// Pre-order visit of an expression subtree.
pub fn for_each_expr(
    arena: &Arena,
    root: ExprId,
    f: &mut impl FnMut(ExprId) -> CompileResult<()>,
) -> CompileResult<()> {
    f(root)?;
    let mut children = Vec::new();
    arena.for_each_child(root, |c| children.push(c));
    for c in children {
        for_each_expr(arena, c, f)?;
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

    fn parse(source: &str) -> (Arena, ModuleId) {
        let mut arena = Arena::new();
        let root = create_root_namespace(&mut arena);
        let chunk = SourceChunk::new("test.soul", source);
        parse_top_level_declarations(&mut arena, chunk, root)
            .unwrap_or_else(|e| panic!("parse error: {e}"));
        (arena, root)
    }

    fn pre_check(source: &str) -> CompileResult<()> {
        let (arena, root) = parse(source);
        run_pre_resolution(&arena, root)
    }

    #[test]
    fn processor_without_output_rejected() {
        let e = pre_check("processor P { input stream float in; void run() { advance(); } }")
            .expect_err("expected error");
        assert!(e.message.contains("at least one output"));
    }

    #[test]
    fn processor_without_run_rejected() {
        let e = pre_check("processor P { output stream float out; }").expect_err("expected error");
        assert!(e.message.contains("run() function"));
    }

    #[test]
    fn two_run_functions_rejected() {
        let e = pre_check(
            "processor P { output stream float out; void run() { advance(); } void run() { advance(); } }",
        )
        .expect_err("expected error");
        assert!(e.message.contains("more than one run()"));
    }

    #[test]
    fn run_function_with_params_rejected() {
        let e = pre_check("processor P { output stream float out; void run(int x) { advance(); } }")
            .expect_err("expected error");
        assert!(e.message.contains("cannot take any parameters"));
    }

    #[test]
    fn non_void_run_function_rejected() {
        let e = pre_check("processor P { output stream float out; int run() { return 1; } }")
            .expect_err("expected error");
        assert!(e.message.contains("must return 'void'"));
    }

    #[test]
    fn event_function_without_input_rejected() {
        let e = pre_check(
            "processor P { output stream float out; event gain (float g) {} void run() { advance(); } }",
        )
        .expect_err("expected error");
        assert!(e.message.contains("no input event"));
    }

    #[test]
    fn duplicate_state_variable_rejected() {
        let e = pre_check(
            "processor P { output stream float out; int x; float x; void run() { advance(); } }",
        )
        .expect_err("expected error");
        assert!(e.message.contains("already in use"));
    }

    #[test]
    fn duplicate_endpoint_and_variable_names() {
        let e = pre_check(
            "processor P { output stream float out; int out; void run() { advance(); } }",
        )
        .expect_err("expected error");
        assert!(e.message.contains("already in use"));
    }

    #[test]
    fn duplicate_annotation_keys_rejected() {
        let e = pre_check(
            "processor P [[ a: 1, a: 2 ]] { output stream float out; void run() { advance(); } }",
        )
        .expect_err("expected error");
        assert!(e.message.contains("duplicate annotation key"));
    }

    #[test]
    fn overloads_share_a_name_without_error() {
        pre_check(
            "processor P { output stream float out; void f(int x) {} void f(float x) {} void run() { advance(); } }",
        )
        .expect("overloads should be allowed");
    }

    #[test]
    fn valid_processor_passes_pre_checks() {
        pre_check(
            "processor P { output stream float out; void run() { loop { out << 0.0f; advance(); } } }",
        )
        .expect("expected clean pre-check");
    }

    #[test]
    fn multidimensional_array_type_rejected() {
        let t = Type::float32().create_array(4).create_array(4);
        let location = Location::new(SourceChunk::new("t", ""), crate::diag::Span::new(0, 0));
        assert!(throw_if_multidimensional_array(&location, &t).is_err());
    }
}
