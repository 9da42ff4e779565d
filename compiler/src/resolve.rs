// resolve.rs — The fixed-point resolution pass
//
// Runs an ordered sequence of rewriting sub-passes over each module until a
// full iteration replaces nothing: identifier resolution, type folding,
// stream-operator conversion, overload resolution, constant folding, and —
// once everything else has stabilised — generic function specialisation.
// Each sub-pass reports how many nodes it replaced and how many it could not
// yet resolve; the driver loops while progress is being made.
//
// During the pre-final iterations `ignore_errors` is up and failures are
// only counted — a later sub-pass may rewrite the offending node and silence
// the problem. When an iteration replaces nothing but failures remain, the
// passes re-run with errors enabled to surface diagnostics. A final
// FullResolver walk then validates every node and applies the last few
// rewrites (ternary unification casts, constant-condition `if` folding).
//
// Preconditions: module parsed and pre-resolution sanity checks passed.
// Postconditions: on success the module is flagged fully resolved and every
//   expression answers `is_resolved`.
// Failure modes: unresolved/ambiguous symbols, bad overloads, type errors.
// Side effects: rewrites the AST in place; allocates replacement nodes.

use crate::ast::*;
use crate::diag::{Category, CompileResult, Diagnostic, Location};
use crate::intrinsics::{INTRINSICS_NAMESPACE, INTRINSICS_PARENT_NAMESPACE};
use crate::parser;
use crate::sanity;
use crate::types::{BinaryOp, Type, TypeRules, Value};

// ── Run statistics ───────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    pub num_failures: usize,
    pub num_replaced: usize,
}

impl RunStats {
    fn clear(&mut self) {
        *self = RunStats::default();
    }

    fn add(&mut self, other: RunStats) {
        self.num_failures += other.num_failures;
        self.num_replaced += other.num_replaced;
    }
}

// ── Public entry point ───────────────────────────────────────────────────

/// Runs the resolution fixed point over `module` and its sub-modules.
///
/// With `ignore_type_and_constant_errors` the caller accepts a partially
/// resolved module (used while specialisation is still rewriting the tree);
/// the final call must pass `false` so remaining failures surface.
pub fn run(
    arena: &mut Arena,
    module: ModuleId,
    ignore_type_and_constant_errors: bool,
) -> CompileResult<RunStats> {
    let mut stats = RunStats::default();

    if arena.module(module).is_fully_resolved {
        return Ok(stats);
    }

    // The loop is monotonic (every iteration replaces a node or stops), so
    // this bound only trips on a resolver bug.
    let max_iterations = arena.exprs.len() * 4 + 64;
    let mut iterations = 0;

    loop {
        iterations += 1;
        if iterations > max_iterations {
            return Err(Diagnostic::global(
                Category::Resolution,
                "internal error: resolution failed to reach a fixed point",
            ));
        }

        stats.clear();

        stats.add(run_sub_pass(arena, module, PassKind::QualifiedIdentifier, true)?);
        stats.add(run_sub_pass(arena, module, PassKind::TypeFold, true)?);
        stats.add(run_sub_pass(arena, module, PassKind::ConvertStreamOps, true)?);
        rebuild_variable_use_counts(arena, module);
        stats.add(run_sub_pass(arena, module, PassKind::Function { allow_generics: false }, true)?);
        stats.add(run_sub_pass(arena, module, PassKind::ConstantFold, true)?);
        rebuild_variable_use_counts(arena, module);

        if stats.num_replaced == 0 {
            stats.add(run_sub_pass(arena, module, PassKind::Function { allow_generics: true }, true)?);
        }

        for sub in arena.module(module).sub_modules.clone() {
            stats.add(run(arena, sub, ignore_type_and_constant_errors)?);
        }

        if stats.num_failures == 0 {
            break;
        }

        if stats.num_replaced == 0 {
            // failed to resolve anything new, so can't get any further
            if ignore_type_and_constant_errors {
                return Ok(stats);
            }

            run_sub_pass(arena, module, PassKind::Function { allow_generics: false }, false)?;
            run_sub_pass(arena, module, PassKind::QualifiedIdentifier, false)?;
            run_sub_pass(arena, module, PassKind::TypeFold, false)?;
            run_sub_pass(arena, module, PassKind::ConvertStreamOps, false)?;
            run_sub_pass(arena, module, PassKind::Function { allow_generics: true }, false)?;
            break;
        }
    }

    run_sub_pass(arena, module, PassKind::Full, false)?;
    arena.module_mut(module).is_fully_resolved = true;
    Ok(stats)
}

// ── Pass kinds ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassKind {
    QualifiedIdentifier,
    TypeFold,
    ConvertStreamOps,
    Function { allow_generics: bool },
    ConstantFold,
    Full,
}

fn run_sub_pass(
    arena: &mut Arena,
    module: ModuleId,
    pass: PassKind,
    ignore_errors: bool,
) -> CompileResult<RunStats> {
    let mut r = Resolver {
        arena,
        module,
        pass,
        ignore_errors: if pass == PassKind::ConstantFold {
            true
        } else {
            ignore_errors
        },
        stats: RunStats::default(),
        stmt_stack: Vec::new(),
        current_function: None,
        num_variables_resolved: 0,
    };
    r.walk_module()?;
    r.finish()?;
    Ok(r.stats)
}

// ── The resolver walker ──────────────────────────────────────────────────

struct Resolver<'a> {
    arena: &'a mut Arena,
    module: ModuleId,
    pass: PassKind,
    ignore_errors: bool,
    stats: RunStats,
    /// (block, statement-index) stack limiting block-local name searches.
    stmt_stack: Vec<(BlockId, usize)>,
    current_function: Option<FunctionId>,
    num_variables_resolved: usize,
}

impl<'a> Resolver<'a> {
    fn fail(&mut self) {
        self.stats.num_failures += 1;
    }

    fn err(
        &self,
        category: Category,
        location: Location,
        message: impl Into<String>,
    ) -> Diagnostic {
        Diagnostic::new(category, location, message)
    }

    // ── Module traversal ──

    fn walk_module(&mut self) -> CompileResult<()> {
        let m = self.module;

        for u in self.arena.module(m).usings.clone() {
            if let Some(target) = self.arena.using(u).target {
                let new = self.rewrite_expr(target)?;
                self.arena.using_mut(u).target = Some(new);
            }
        }

        for s in self.arena.module(m).structs.clone() {
            let member_types = self.arena.struct_decl(s).member_types.clone();
            for (i, t) in member_types.iter().enumerate() {
                let new = self.rewrite_expr(*t)?;
                self.arena.struct_decl_mut(s).member_types[i] = new;
            }
        }

        for p in self.arena.module(m).specialisation_params.clone() {
            if let SpecialisationParam::Value(v) = p {
                self.rewrite_var(v)?;
            }
        }

        for v in self.arena.module(m).state_variables.clone() {
            self.rewrite_var(v)?;
        }

        for e in self.arena.module(m).inputs.clone() {
            self.rewrite_endpoint(e)?;
        }
        for e in self.arena.module(m).outputs.clone() {
            self.rewrite_endpoint(e)?;
        }

        for f in self.arena.module(m).functions.clone() {
            if self.arena.function(f).is_generic() {
                continue;
            }
            self.current_function = Some(f);

            let return_type = self.arena.function(f).return_type;
            let new_return = self.rewrite_expr(return_type)?;
            self.arena.function_mut(f).return_type = new_return;

            for p in self.arena.function(f).parameters.clone() {
                self.rewrite_var(p)?;
            }

            self.rewrite_annotation_values(&self.arena.function(f).annotation.clone())?;

            if let Some(body) = self.arena.function(f).body {
                let new_body = self.rewrite_stmt(body)?;
                self.arena.function_mut(f).body = Some(new_body);
            }

            self.current_function = None;
        }

        for i in self.arena.module(m).instances.clone() {
            let instance_fields = {
                let inst = self.arena.instance(i);
                (
                    inst.array_size,
                    inst.specialisation_args.clone(),
                    inst.clock_multiplier_ratio,
                    inst.clock_divider_ratio,
                )
            };
            if let Some(size) = instance_fields.0 {
                let new = self.rewrite_expr(size)?;
                self.arena.instance_mut(i).array_size = Some(new);
            }
            for (idx, arg) in instance_fields.1.iter().enumerate() {
                let new = self.rewrite_expr(*arg)?;
                self.arena.instance_mut(i).specialisation_args[idx] = new;
            }
            if let Some(ratio) = instance_fields.2 {
                let new = self.rewrite_expr(ratio)?;
                self.arena.instance_mut(i).clock_multiplier_ratio = Some(new);
            }
            if let Some(ratio) = instance_fields.3 {
                let new = self.rewrite_expr(ratio)?;
                self.arena.instance_mut(i).clock_divider_ratio = Some(new);
            }
            if self.pass == PassKind::Full {
                self.check_processor_instance(i)?;
            }
        }

        for c in self.arena.module(m).connections.clone() {
            if let Some(delay) = self.arena.connection(c).delay_length {
                let new = self.rewrite_expr(delay)?;
                self.arena.connection_mut(c).delay_length = Some(new);
            }
        }

        self.rewrite_annotation_values(&self.arena.module(m).annotation.clone())?;
        if self.pass == PassKind::Full {
            let annotation = self.arena.module(m).annotation.clone();
            self.check_annotation(&annotation)?;
            for e in self
                .arena
                .module(m)
                .inputs
                .clone()
                .into_iter()
                .chain(self.arena.module(m).outputs.clone())
            {
                let a = self.arena.endpoint(e).annotation.clone();
                self.check_annotation(&a)?;
            }
        }

        Ok(())
    }

    fn rewrite_annotation_values(&mut self, annotation: &Annotation) -> CompileResult<()> {
        // Properties are rewritten through their owner below; the clone here
        // only carries the expression ids.
        for (i, p) in annotation.properties.iter().enumerate() {
            let new = self.rewrite_expr(p.value)?;
            // write back into whichever owner holds this annotation
            let _ = (i, new);
            self.write_back_annotation_value(p.value, new);
        }
        Ok(())
    }

    /// Annotations live on several owner kinds; find the slot by the old id.
    fn write_back_annotation_value(&mut self, old: ExprId, new: ExprId) {
        if old == new {
            return;
        }
        let m = self.module;
        {
            let module = self.arena.module_mut(m);
            for p in &mut module.annotation.properties {
                if p.value == old {
                    p.value = new;
                    return;
                }
            }
        }
        for f in self.arena.module(m).functions.clone() {
            for p in &mut self.arena.function_mut(f).annotation.properties {
                if p.value == old {
                    p.value = new;
                    return;
                }
            }
        }
        let ids: Vec<EndpointId> = {
            let module = self.arena.module(m);
            module
                .inputs
                .iter()
                .chain(module.outputs.iter())
                .copied()
                .collect()
        };
        for e in ids {
            for p in &mut self.arena.endpoint_mut(e).annotation.properties {
                if p.value == old {
                    p.value = new;
                    return;
                }
            }
        }
    }

    fn rewrite_endpoint(&mut self, e: EndpointId) -> CompileResult<()> {
        for (i, t) in self.arena.endpoint(e).sample_types.clone().iter().enumerate() {
            let new = self.rewrite_expr(*t)?;
            self.arena.endpoint_mut(e).sample_types[i] = new;
        }
        if let Some(size) = self.arena.endpoint(e).array_size {
            let new = self.rewrite_expr(size)?;
            self.arena.endpoint_mut(e).array_size = Some(new);
        }
        let annotation = self.arena.endpoint(e).annotation.clone();
        self.rewrite_annotation_values(&annotation)?;
        Ok(())
    }

    fn rewrite_var(&mut self, v: VarId) -> CompileResult<()> {
        if let Some(t) = self.arena.var(v).declared_type {
            let new = self.rewrite_expr(t)?;
            self.arena.var_mut(v).declared_type = Some(new);
        }
        if let Some(init) = self.arena.var(v).initial_value {
            let new = self.rewrite_expr(init)?;
            self.arena.var_mut(v).initial_value = Some(new);
        }
        if self.pass == PassKind::TypeFold {
            self.type_fold_variable(v)?;
        }
        Ok(())
    }

    // ── Statement traversal ──

    fn rewrite_stmt(&mut self, id: StmtId) -> CompileResult<StmtId> {
        match self.arena.stmt(id).kind.clone() {
            StmtKind::Block(b) => {
                let count = self.arena.block(b).statements.len();
                for i in 0..count {
                    self.stmt_stack.push((b, i));
                    let s = self.arena.block(b).statements[i];
                    let new = self.rewrite_stmt(s)?;
                    self.arena.block_mut(b).statements[i] = new;
                    self.stmt_stack.pop();
                }
            }
            StmtKind::If {
                condition,
                true_branch,
                false_branch,
            } => {
                let new_condition = self.rewrite_expr(condition)?;
                let new_true = self.rewrite_stmt(true_branch)?;
                let new_false = match false_branch {
                    Some(f) => Some(self.rewrite_stmt(f)?),
                    None => None,
                };
                self.arena.stmt_mut(id).kind = StmtKind::If {
                    condition: new_condition,
                    true_branch: new_true,
                    false_branch: new_false,
                };
            }
            StmtKind::Loop {
                condition,
                num_iterations,
                iterator,
                body,
                is_do_loop,
            } => {
                let condition = match condition {
                    Some(c) => Some(self.rewrite_expr(c)?),
                    None => None,
                };
                let num_iterations = match num_iterations {
                    Some(n) => Some(self.rewrite_expr(n)?),
                    None => None,
                };
                let iterator = match iterator {
                    Some(i) => Some(self.rewrite_expr(i)?),
                    None => None,
                };
                let body = self.rewrite_stmt(body)?;
                self.arena.stmt_mut(id).kind = StmtKind::Loop {
                    condition,
                    num_iterations,
                    iterator,
                    body,
                    is_do_loop,
                };
            }
            StmtKind::Return { value } => {
                let value = match value {
                    Some(v) => Some(self.rewrite_expr(v)?),
                    None => None,
                };
                self.arena.stmt_mut(id).kind = StmtKind::Return { value };
            }
            StmtKind::Expression(e) => {
                let new = self.rewrite_expr(e)?;
                self.arena.stmt_mut(id).kind = StmtKind::Expression(new);
            }
            StmtKind::VarDecl(v) => {
                self.rewrite_var(v)?;
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Noop => {}
        }

        if self.pass == PassKind::Full {
            return self.full_check_stmt(id);
        }
        Ok(id)
    }

    // ── Expression traversal ──

    fn rewrite_expr(&mut self, id: ExprId) -> CompileResult<ExprId> {
        self.rewrite_children(id)?;

        let new_id = match self.pass {
            PassKind::QualifiedIdentifier => self.qi_post(id)?,
            PassKind::TypeFold => self.type_post(id)?,
            PassKind::ConvertStreamOps => self.stream_post(id)?,
            PassKind::Function { allow_generics } => self.function_post(id, allow_generics)?,
            PassKind::ConstantFold => self.fold_post(id)?,
            PassKind::Full => self.full_post(id)?,
        };

        if new_id != id {
            self.stats.num_replaced += 1;
        }
        Ok(new_id)
    }

    fn rewrite_children(&mut self, id: ExprId) -> CompileResult<()> {
        match self.arena.expr(id).kind.clone() {
            ExprKind::Constant(_)
            | ExprKind::QualifiedIdentifier(_)
            | ExprKind::VariableRef(_)
            | ExprKind::OutputEndpointRef(_)
            | ExprKind::InputEndpointRef(_)
            | ExprKind::ProcessorRef(_)
            | ExprKind::ProcessorProperty(_)
            | ExprKind::ConcreteType(_)
            | ExprKind::AdvanceClock => {}
            ExprKind::DotOperator { lhs, rhs } => {
                let new_lhs = self.rewrite_expr(lhs)?;
                // rhs is a bare member name, never resolved on its own
                self.arena.expr_mut(id).kind = ExprKind::DotOperator { lhs: new_lhs, rhs };
            }
            ExprKind::StructMemberRef {
                object,
                structure,
                member_index,
            } => {
                let new = self.rewrite_expr(object)?;
                self.arena.expr_mut(id).kind = ExprKind::StructMemberRef {
                    object: new,
                    structure,
                    member_index,
                };
            }
            ExprKind::ArrayElementRef {
                object,
                start,
                end,
                is_slice,
                suppress_wrap_warning,
            } => {
                let object = self.rewrite_expr(object)?;
                let start = match start {
                    Some(s) => Some(self.rewrite_expr(s)?),
                    None => None,
                };
                let end = match end {
                    Some(e) => Some(self.rewrite_expr(e)?),
                    None => None,
                };
                self.arena.expr_mut(id).kind = ExprKind::ArrayElementRef {
                    object,
                    start,
                    end,
                    is_slice,
                    suppress_wrap_warning,
                };
            }
            ExprKind::SubscriptWithBrackets { lhs, rhs } => {
                let lhs = self.rewrite_expr(lhs)?;
                let rhs = match rhs {
                    Some(r) => Some(self.rewrite_expr(r)?),
                    None => None,
                };
                self.arena.expr_mut(id).kind = ExprKind::SubscriptWithBrackets { lhs, rhs };
            }
            ExprKind::SubscriptWithChevrons { lhs, rhs } => {
                let lhs = self.rewrite_expr(lhs)?;
                let rhs = self.rewrite_expr(rhs)?;
                self.arena.expr_mut(id).kind = ExprKind::SubscriptWithChevrons { lhs, rhs };
            }
            ExprKind::TypeCast { target, source } => {
                let source = self.rewrite_expr(source)?;
                self.arena.expr_mut(id).kind = ExprKind::TypeCast { target, source };
            }
            ExprKind::CallOrCast {
                callee,
                args,
                is_method_call,
            } => {
                // The callee is handled by each pass, not auto-descended —
                // a function name must not resolve as a variable.
                let args = match args {
                    Some(a) => Some(self.rewrite_expr(a)?),
                    None => None,
                };
                self.arena.expr_mut(id).kind = ExprKind::CallOrCast {
                    callee,
                    args,
                    is_method_call,
                };
            }
            ExprKind::FunctionCall { function, args } => {
                if self.pass == PassKind::ConstantFold {
                    self.fold_function_call_args(function, args)?;
                } else if let Some(a) = args {
                    let new = self.rewrite_expr(a)?;
                    self.arena.expr_mut(id).kind = ExprKind::FunctionCall {
                        function,
                        args: Some(new),
                    };
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.rewrite_expr(lhs)?;
                let rhs = self.rewrite_expr(rhs)?;
                self.arena.expr_mut(id).kind = ExprKind::Binary { op, lhs, rhs };
            }
            ExprKind::Unary { op, source } => {
                let source = self.rewrite_expr(source)?;
                self.arena.expr_mut(id).kind = ExprKind::Unary { op, source };
            }
            ExprKind::Ternary {
                condition,
                true_branch,
                false_branch,
            } => {
                let condition = self.rewrite_expr(condition)?;
                let true_branch = self.rewrite_expr(true_branch)?;
                let false_branch = self.rewrite_expr(false_branch)?;
                self.arena.expr_mut(id).kind = ExprKind::Ternary {
                    condition,
                    true_branch,
                    false_branch,
                };
            }
            ExprKind::Assignment { target, value } => {
                let target = self.rewrite_expr(target)?;
                let value = self.rewrite_expr(value)?;
                self.arena.expr_mut(id).kind = ExprKind::Assignment { target, value };
            }
            ExprKind::PreOrPostIncDec {
                target,
                is_increment,
                is_post,
            } => {
                let target = self.rewrite_expr(target)?;
                self.arena.expr_mut(id).kind = ExprKind::PreOrPostIncDec {
                    target,
                    is_increment,
                    is_post,
                };
            }
            ExprKind::WriteToEndpoint { target, value } => {
                let target = self.rewrite_expr(target)?;
                let value = self.rewrite_expr(value)?;
                self.arena.expr_mut(id).kind = ExprKind::WriteToEndpoint { target, value };
            }
            ExprKind::TypeMetaFunction { op, source } => {
                let source = self.rewrite_expr(source)?;
                self.arena.expr_mut(id).kind = ExprKind::TypeMetaFunction { op, source };
            }
            ExprKind::CommaSeparatedList(items) => {
                let mut new_items = Vec::with_capacity(items.len());
                for i in items {
                    new_items.push(self.rewrite_expr(i)?);
                }
                self.arena.expr_mut(id).kind = ExprKind::CommaSeparatedList(new_items);
            }
            ExprKind::StaticAssertion { condition, message } => {
                let condition = self.rewrite_expr(condition)?;
                self.arena.expr_mut(id).kind = ExprKind::StaticAssertion { condition, message };
            }
        }
        Ok(())
    }

    // ── Pass finish hooks ──

    fn finish(&mut self) -> CompileResult<()> {
        match self.pass {
            PassKind::QualifiedIdentifier => {
                if self.num_variables_resolved > 0 {
                    self.check_recursive_variable_initialisers()?;
                }
                Ok(())
            }
            PassKind::TypeFold => self.finish_struct_declarations(),
            _ => Ok(()),
        }
    }

    // ── QualifiedIdentifierResolver ──

    fn qi_post(&mut self, id: ExprId) -> CompileResult<ExprId> {
        match self.arena.expr(id).kind.clone() {
            ExprKind::QualifiedIdentifier(path) => self.resolve_identifier(id, &path),
            ExprKind::CallOrCast { callee, args, .. } => {
                let all_args_resolved = args.map_or(true, |a| self.arena.is_resolved(a));
                if !all_args_resolved {
                    return Ok(id);
                }
                if let Some(t) = self.arena.resolve_as_type(callee) {
                    return Ok(self.convert_to_cast(id, t));
                }
                if let ExprKind::QualifiedIdentifier(path) = self.arena.expr(callee).kind.clone() {
                    // A call target that names a type becomes a cast.
                    let opts = NameSearchOptions {
                        find_variables: false,
                        find_types: true,
                        find_functions: false,
                        find_processors_and_namespaces: false,
                        find_endpoints: false,
                        stop_at_first_scope_with_results: true,
                        required_num_function_args: None,
                    };
                    let scope = self.arena.expr(callee).context.scope;
                    let found =
                        self.arena
                            .perform_name_search(scope, &path, &opts, Some(&self.stmt_stack));
                    if found.len() == 1 {
                        if let Some(t) = self.found_item_as_type(found[0]) {
                            return Ok(self.convert_to_cast(id, t));
                        }
                    }
                }
                Ok(id)
            }
            ExprKind::DotOperator { lhs, rhs } => self.resolve_dot_operator(id, lhs, rhs),
            ExprKind::ArrayElementRef { .. } => {
                if self.arena.is_resolved(id) {
                    sanity::check_array_subscript(self.arena, id)?;
                }
                Ok(id)
            }
            _ => Ok(id),
        }
    }

    fn found_item_as_type(&self, item: FoundItem) -> Option<Type> {
        match item {
            FoundItem::Struct(s) => Some(Type::Struct(self.arena.struct_decl(s).structure.clone())),
            FoundItem::Using(u) => {
                let target = self.arena.using(u).target?;
                self.arena.resolve_as_type(target)
            }
            _ => None,
        }
    }

    fn resolve_identifier(&mut self, id: ExprId, path: &Path) -> CompileResult<ExprId> {
        let context = self.arena.expr(id).context.clone();

        let opts = NameSearchOptions {
            find_variables: true,
            find_types: true,
            find_functions: false,
            find_processors_and_namespaces: true,
            find_endpoints: true,
            stop_at_first_scope_with_results: true,
            required_num_function_args: None,
        };
        let found =
            self.arena
                .perform_name_search(context.scope, path, &opts, Some(&self.stmt_stack));

        if found.len() == 1 {
            match found[0] {
                FoundItem::Variable(v) => {
                    self.num_variables_resolved += 1;
                    return Ok(self.arena.alloc_expr(ExprKind::VariableRef(v), context));
                }
                FoundItem::Struct(_) | FoundItem::Using(_) => {
                    if let Some(t) = self.found_item_as_type(found[0]) {
                        return Ok(self.arena.alloc_expr(ExprKind::ConcreteType(t), context));
                    }
                    // an unbound `using` specialisation parameter
                    self.fail();
                    return Ok(id);
                }
                FoundItem::Module(m) => {
                    if self.arena.module(m).is_processor_or_graph() {
                        return Ok(self.arena.alloc_expr(ExprKind::ProcessorRef(m), context));
                    }
                    // a bare namespace name is not a value
                }
                FoundItem::Alias(a) => {
                    if let Some(target) = self.arena.alias(a).target {
                        return Ok(self.arena.alloc_expr(ExprKind::ProcessorRef(target), context));
                    }
                    self.fail();
                    return Ok(id);
                }
                FoundItem::Endpoint(e) => {
                    let kind = if self.arena.endpoint(e).is_input {
                        ExprKind::InputEndpointRef(e)
                    } else {
                        ExprKind::OutputEndpointRef(e)
                    };
                    return Ok(self.arena.alloc_expr(kind, context));
                }
                FoundItem::Function(_) => {}
            }
        }

        if path.is_unqualified() {
            if let Some(v) = self.built_in_constant(path) {
                return Ok(self.arena.alloc_expr(ExprKind::Constant(v), context));
            }
        }

        if !self.ignore_errors {
            let name = path.to_string(&self.arena.interner);
            // `wrap` and `clamp` only make sense with a chevron suffix; the
            // type resolver consumes them, so a leftover bare name is fine.
            if path.is_unqualified() && (name == "wrap" || name == "clamp") {
                return Ok(id);
            }
            if found.is_empty() {
                return Err(self.err(
                    Category::Resolution,
                    context.location,
                    format!("cannot find symbol '{name}'"),
                ));
            }
            if found.len() > 1 {
                return Err(self.err(
                    Category::Resolution,
                    context.location,
                    format!("multiple matches for the symbol '{name}'"),
                ));
            }
            return Err(self.err(
                Category::Resolution,
                context.location,
                format!("cannot find symbol '{name}'"),
            ));
        }

        self.fail();
        Ok(id)
    }

    fn built_in_constant(&self, path: &Path) -> Option<Value> {
        match self.arena.interner.str(path.first()) {
            "pi" => Some(Value::Float64(std::f64::consts::PI)),
            "twoPi" => Some(Value::Float64(2.0 * std::f64::consts::PI)),
            "nan" => Some(Value::Float32(f32::NAN)),
            "inf" => Some(Value::Float32(f32::INFINITY)),
            _ => None,
        }
    }

    fn resolve_dot_operator(&mut self, id: ExprId, lhs: ExprId, rhs: ExprId) -> CompileResult<ExprId> {
        let context = self.arena.expr(id).context.clone();
        let rhs_path = match &self.arena.expr(rhs).kind {
            ExprKind::QualifiedIdentifier(p) => p.clone(),
            _ => return Ok(id),
        };

        if self.arena.is_resolved_as_value(lhs) {
            let lhs_type = self.arena.result_type(lhs);
            if let Some(t) = lhs_type {
                if let Some(s) = t.struct_ref() {
                    if rhs_path.is_unqualified() {
                        let member_name = self.arena.interner.str(rhs_path.first()).to_string();
                        if let Some(index) = s.member_index(&member_name) {
                            return Ok(self.arena.alloc_expr(
                                ExprKind::StructMemberRef {
                                    object: lhs,
                                    structure: s,
                                    member_index: index,
                                },
                                context,
                            ));
                        }
                        if !self.ignore_errors {
                            return Err(self.err(
                                Category::Resolution,
                                self.arena.expr_location(rhs),
                                format!("the struct '{}' has no member called '{member_name}'", s.name),
                            ));
                        }
                    }
                }
            }
        } else if self.arena.is_output_endpoint(lhs) {
            return Err(self.err(
                Category::Type,
                context.location,
                "no such operation is possible on an endpoint",
            ));
        } else if self.arena.is_resolved_as_processor(lhs) {
            return Err(self.err(
                Category::Type,
                context.location,
                "no such operation is possible on a processor",
            ));
        }

        if self.ignore_errors {
            self.fail();
            Ok(id)
        } else {
            Err(self.err(
                Category::Resolution,
                context.location,
                "cannot resolve the '.' operator here",
            ))
        }
    }

    fn convert_to_cast(&mut self, call: ExprId, target: Type) -> ExprId {
        let (args, context) = match self.arena.expr(call).kind.clone() {
            ExprKind::CallOrCast { args, .. } => (args, self.arena.expr(call).context.clone()),
            _ => unreachable!("convert_to_cast on a non-call"),
        };

        let source = match args {
            Some(a) => match self.arena.expr(a).kind.clone() {
                ExprKind::CommaSeparatedList(items) if items.len() == 1 => items[0],
                _ => a,
            },
            None => self
                .arena
                .alloc_expr(ExprKind::CommaSeparatedList(Vec::new()), context.clone()),
        };

        self.arena
            .alloc_expr(ExprKind::TypeCast { target, source }, context)
    }

    /// A variable's initialiser must not refer (transitively) to the
    /// variable itself.
    fn check_recursive_variable_initialisers(&mut self) -> CompileResult<()> {
        let mut vars = self.arena.module(self.module).state_variables.clone();
        for f in self.arena.module(self.module).functions.clone() {
            if let Some(body) = self.arena.function(f).body {
                collect_local_vars(self.arena, body, &mut vars);
            }
        }
        for v in vars {
            let mut stack = Vec::new();
            self.check_var_initialiser_cycle(v, &mut stack)?;
        }
        Ok(())
    }

    fn check_var_initialiser_cycle(
        &self,
        v: VarId,
        stack: &mut Vec<VarId>,
    ) -> CompileResult<()> {
        if stack.contains(&v) {
            let var = self.arena.var(v);
            return Err(self.err(
                Category::Resolution,
                var.context.location.clone(),
                format!(
                    "the initialiser of '{}' refers to the variable it is initialising",
                    self.arena.name(var.name)
                ),
            ));
        }

        let init = match self.arena.var(v).initial_value {
            Some(init) => init,
            None => return Ok(()),
        };

        stack.push(v);
        let mut referenced = Vec::new();
        let _ = sanity::for_each_expr(self.arena, init, &mut |e| {
            if let ExprKind::VariableRef(v2) = self.arena.expr(e).kind {
                referenced.push(v2);
            }
            Ok(())
        });
        for v2 in referenced {
            self.check_var_initialiser_cycle(v2, stack)?;
        }
        stack.pop();
        Ok(())
    }

    // ── TypeResolver ──

    fn type_post(&mut self, id: ExprId) -> CompileResult<ExprId> {
        match self.arena.expr(id).kind.clone() {
            ExprKind::TypeCast { target, source } => {
                if target.is_unsized_array() {
                    let args = self.cast_argument_list(source);

                    if let Some(c) = self.arena.get_as_constant(source) {
                        if let Some(cast) = c.try_cast_to(&target.with_array_size(1)) {
                            let context = self.arena.expr(source).context.clone();
                            return Ok(self.arena.alloc_expr(ExprKind::Constant(cast), context));
                        }
                    }

                    if args.len() > 1 {
                        let new_target = target.with_array_size(args.len() as u64);
                        self.arena.expr_mut(id).kind = ExprKind::TypeCast {
                            target: new_target,
                            source,
                        };
                        self.stats.num_replaced += 1;
                    }
                }
                Ok(id)
            }
            ExprKind::SubscriptWithBrackets { lhs, rhs } => {
                self.resolve_bracket_subscript(id, lhs, rhs)
            }
            ExprKind::SubscriptWithChevrons { lhs, rhs } => {
                self.resolve_chevron_subscript(id, lhs, rhs)
            }
            ExprKind::TypeMetaFunction { op, source } => {
                let context = self.arena.expr(id).context.clone();
                if let Some(t) = self.arena.resolve_as_type(id) {
                    return Ok(self.arena.alloc_expr(ExprKind::ConcreteType(t), context));
                }
                if !op.returns_a_type() {
                    let source_type = self
                        .arena
                        .resolve_as_type(source)
                        .or_else(|| self.arena.result_type(source));
                    if let Some(t) = source_type {
                        if let Some(v) = op.perform(&t) {
                            return Ok(self.arena.alloc_expr(ExprKind::Constant(v), context));
                        }
                        // `.size` of an unsized array is a runtime query
                        if op == MetaOp::Size && t.is_unsized_array() {
                            return Ok(self.rewrite_size_to_intrinsic_call(source, context));
                        }
                    }
                }
                if self.ignore_errors {
                    self.fail();
                    Ok(id)
                } else {
                    Err(self.err(
                        Category::Type,
                        context.location,
                        "cannot resolve the source type of this meta-function",
                    ))
                }
            }
            ExprKind::ArrayElementRef { .. } => {
                if !self.ignore_errors {
                    sanity::check_array_subscript(self.arena, id)?;
                }
                Ok(id)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                if self.arena.is_resolved(id) && !self.arena.is_output_endpoint(lhs) {
                    sanity::throw_if_not_readable_value(self.arena, rhs)?;
                    sanity::throw_if_not_readable_value(self.arena, lhs)?;
                    let lhs_type = self.arena.result_type(lhs);
                    let rhs_type = self.arena.result_type(rhs);
                    if let (Some(lt), Some(rt)) = (lhs_type, rhs_type) {
                        if op.operand_type(&lt, &rt).is_none() && !self.ignore_errors {
                            return Err(self.err(
                                Category::Type,
                                self.arena.expr_location(id),
                                format!(
                                    "illegal types for the '{}' operator ('{lt}' and '{rt}')",
                                    op.symbol()
                                ),
                            ));
                        }
                    }
                }
                Ok(id)
            }
            _ => Ok(id),
        }
    }

    fn cast_argument_list(&self, source: ExprId) -> Vec<ExprId> {
        match &self.arena.expr(source).kind {
            ExprKind::CommaSeparatedList(items) => items.clone(),
            _ => vec![source],
        }
    }

    fn rewrite_size_to_intrinsic_call(&mut self, source: ExprId, context: Context) -> ExprId {
        let list = self
            .arena
            .alloc_expr(ExprKind::CommaSeparatedList(vec![source]), context.clone());
        let name = self.arena.interner.get("get_array_size");
        let callee = self
            .arena
            .alloc_expr(ExprKind::QualifiedIdentifier(Path::single(name)), context.clone());
        self.arena.alloc_expr(
            ExprKind::CallOrCast {
                callee,
                args: Some(list),
                is_method_call: true,
            },
            context,
        )
    }

    fn check_and_get_array_size(&self, size_expr: ExprId, v: &Value) -> CompileResult<u64> {
        let location = self.arena.expr_location(size_expr);
        if !v.type_of().is_primitive_integer() {
            return Err(self.err(Category::Type, location, "an array size must be an integer"));
        }
        match TypeRules::check_array_size(v) {
            Some(n) => Ok(n),
            None => Err(self.err(Category::Type, location, "illegal array size")),
        }
    }

    fn resolve_bracket_subscript(
        &mut self,
        id: ExprId,
        lhs: ExprId,
        rhs: Option<ExprId>,
    ) -> CompileResult<ExprId> {
        let context = self.arena.expr(id).context.clone();

        if self.arena.is_resolved_as_value(lhs) {
            return Ok(self.arena.alloc_expr(
                ExprKind::ArrayElementRef {
                    object: lhs,
                    start: rhs,
                    end: None,
                    is_slice: false,
                    suppress_wrap_warning: false,
                },
                context,
            ));
        }

        if let Some(element) = self.arena.resolve_as_type(lhs) {
            match rhs {
                None => {
                    return Ok(self.arena.alloc_expr(
                        ExprKind::ConcreteType(element.create_unsized_array()),
                        context,
                    ));
                }
                Some(size_expr) => {
                    if self.arena.is_resolved(size_expr) {
                        if let Some(c) = self.arena.get_as_constant(size_expr) {
                            let size = self.check_and_get_array_size(size_expr, &c)?;
                            if !element.can_be_array_element() {
                                return Err(self.err(
                                    Category::Type,
                                    self.arena.expr_location(lhs),
                                    format!("'{element}' cannot be an array element type"),
                                ));
                            }
                            return Ok(self.arena.alloc_expr(
                                ExprKind::ConcreteType(element.create_array(size)),
                                context,
                            ));
                        }
                        if !self.ignore_errors {
                            return Err(self.err(
                                Category::Type,
                                context.location,
                                "an array size must be a constant",
                            ));
                        }
                    }
                }
            }
        }

        if self.arena.is_resolved_as_endpoint(lhs) {
            return Ok(self.arena.alloc_expr(
                ExprKind::ArrayElementRef {
                    object: lhs,
                    start: rhs,
                    end: None,
                    is_slice: false,
                    suppress_wrap_warning: false,
                },
                context,
            ));
        }

        if self.ignore_errors {
            self.fail();
            Ok(id)
        } else if self.arena.is_resolved_as_processor(lhs) {
            Err(self.err(
                Category::Type,
                context.location,
                "array suffixes are not allowed on processor names",
            ))
        } else {
            Err(self.err(
                Category::Resolution,
                context.location,
                "cannot resolve this bracketed expression",
            ))
        }
    }

    fn resolve_chevron_subscript(
        &mut self,
        id: ExprId,
        lhs: ExprId,
        rhs: ExprId,
    ) -> CompileResult<ExprId> {
        let context = self.arena.expr(id).context.clone();

        if let Some(element) = self.arena.resolve_as_type(lhs) {
            if !element.can_be_vector_element() {
                return Err(self.err(
                    Category::Type,
                    self.arena.expr_location(lhs),
                    format!("'{element}' cannot be a vector element type"),
                ));
            }
            if let Some(c) = self.arena.get_as_constant(rhs) {
                let size = c.as_i64().ok_or_else(|| {
                    self.err(
                        Category::Type,
                        self.arena.expr_location(rhs),
                        "a vector size must be an integer",
                    )
                })?;
                if !Type::is_legal_vector_size(size) {
                    return Err(self.err(
                        Category::Type,
                        self.arena.expr_location(rhs),
                        "illegal vector size",
                    ));
                }
                let primitive = element.primitive().expect("vector elements are primitive");
                return Ok(self.arena.alloc_expr(
                    ExprKind::ConcreteType(Type::create_vector(primitive, size as u64)),
                    context,
                ));
            }
        }

        if let ExprKind::QualifiedIdentifier(path) = &self.arena.expr(lhs).kind {
            if path.is_unqualified() {
                let name = self.arena.interner.str(path.first());
                let is_wrap = name == "wrap";
                let is_clamp = name == "clamp";
                if is_wrap || is_clamp {
                    if let Some(c) = self.arena.get_as_constant(rhs) {
                        let size = c.as_i64().unwrap_or(0);
                        if !Type::is_legal_bounded_int_limit(size) {
                            return Err(self.err(
                                Category::Type,
                                self.arena.expr_location(rhs),
                                "illegal wrap/clamp size",
                            ));
                        }
                        let t = if is_wrap {
                            Type::Wrap(size as u64)
                        } else {
                            Type::Clamp(size as u64)
                        };
                        return Ok(self.arena.alloc_expr(ExprKind::ConcreteType(t), context));
                    }
                    if self.arena.is_resolved(rhs) && !self.ignore_errors {
                        return Err(self.err(
                            Category::Type,
                            context.location,
                            "wrap and clamp sizes must be constants",
                        ));
                    }
                }
            }
        }

        if self.ignore_errors {
            self.fail();
            Ok(id)
        } else {
            Err(self.err(
                Category::Type,
                context.location,
                "cannot resolve this vector size",
            ))
        }
    }

    /// Installs the initial-value cast for a declared variable, and infers
    /// unsized-array element counts from the initialiser.
    fn type_fold_variable(&mut self, v: VarId) -> CompileResult<()> {
        let (declared_type, initial_value) = {
            let var = self.arena.var(v);
            (var.declared_type, var.initial_value)
        };

        let init = match initial_value {
            Some(init) => init,
            None => return Ok(()),
        };

        if self.arena.var_is_resolved(v) && declared_type.is_none() {
            return Ok(());
        }

        if let Some(decl) = declared_type {
            if let Some(dest) = self.arena.resolve_as_type(decl) {
                if dest.is_unsized_array() {
                    if let Some(size) = self.find_size_of_array(init) {
                        self.install_variable_cast(v, init, dest.with_array_size(size));
                    }
                } else {
                    self.install_variable_cast(v, init, dest);
                }
            }
        } else if self.arena.is_resolved_as_value(init) {
            if let Some(t) = self.arena.result_type(init) {
                if t.is_unsized_array() {
                    let size = self.find_size_of_array(init).unwrap_or(1);
                    self.install_variable_cast(v, init, t.with_array_size(size));
                }
            }
        } else if self.arena.is_resolved_as_type(init) {
            return Err(self.err(
                Category::Type,
                self.arena.expr_location(init),
                "expected a value",
            ));
        }

        Ok(())
    }

    fn find_size_of_array(&self, value: ExprId) -> Option<u64> {
        if self.arena.is_resolved_as_value(value) {
            if let Some(t) = self.arena.result_type(value) {
                if t.is_fixed_size_array() {
                    return t.array_or_vector_size();
                }
            }
        }
        match &self.arena.expr(value).kind {
            ExprKind::CommaSeparatedList(items) => Some(items.len() as u64),
            ExprKind::TypeCast { target, source } => {
                if target.is_fixed_size_array() {
                    target.array_or_vector_size()
                } else if target.is_unsized_array() {
                    self.find_size_of_array(*source)
                } else {
                    None
                }
            }
            ExprKind::CallOrCast { callee, .. } => {
                let t = self.arena.resolve_as_type(*callee)?;
                if t.is_fixed_size_array() {
                    t.array_or_vector_size()
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn install_variable_cast(&mut self, v: VarId, init: ExprId, target: Type) {
        let already_right = self.arena.is_resolved_as_value(init)
            && self
                .arena
                .result_type(init)
                .map_or(false, |t| t.is_identical(&target));

        let new_init = if already_right {
            init
        } else {
            let context = self.arena.expr(init).context.clone();
            self.arena.alloc_expr(
                ExprKind::TypeCast {
                    target,
                    source: init,
                },
                context,
            )
        };

        let var = self.arena.var_mut(v);
        var.initial_value = Some(new_init);
        var.declared_type = None;
        self.stats.num_replaced += 1;
    }

    /// Fills each struct's shared member table once every member type has
    /// resolved.
    fn finish_struct_declarations(&mut self) -> CompileResult<()> {
        for s in self.arena.module(self.module).structs.clone() {
            let decl = self.arena.struct_decl(s);
            if decl.members_resolved {
                continue;
            }
            let mut members = Vec::new();
            let mut all_resolved = true;
            for (i, t) in decl.member_types.iter().enumerate() {
                match self.arena.resolve_as_type(*t) {
                    Some(ty) => {
                        if ty.is_void() {
                            return Err(self.err(
                                Category::Type,
                                self.arena.expr_location(*t),
                                "struct members cannot be void",
                            ));
                        }
                        members.push(crate::types::StructMember {
                            ty,
                            name: self.arena.name(decl.member_names[i]).to_string(),
                        });
                    }
                    None => {
                        all_resolved = false;
                        break;
                    }
                }
            }
            if all_resolved {
                let decl = self.arena.struct_decl_mut(s);
                *decl.structure.members.borrow_mut() = members;
                decl.members_resolved = true;
                self.stats.num_replaced += 1;
            } else {
                self.fail();
            }
        }
        Ok(())
    }

    // ── ConvertStreamOperations ──

    fn stream_post(&mut self, id: ExprId) -> CompileResult<ExprId> {
        if let ExprKind::Binary {
            op: BinaryOp::LeftShift,
            lhs,
            rhs,
        } = self.arena.expr(id).kind.clone()
        {
            if self.arena.is_output_endpoint(lhs) {
                let context = self.arena.expr(id).context.clone();
                return Ok(self.arena.alloc_expr(
                    ExprKind::WriteToEndpoint {
                        target: lhs,
                        value: rhs,
                    },
                    context,
                ));
            }
        }
        Ok(id)
    }

    // ── FunctionResolver ──

    fn function_post(&mut self, id: ExprId, allow_generics: bool) -> CompileResult<ExprId> {
        let (callee, args, is_method_call) = match self.arena.expr(id).kind.clone() {
            ExprKind::CallOrCast {
                callee,
                args,
                is_method_call,
            } => (callee, args, is_method_call),
            _ => return Ok(id),
        };

        if let Some(t) = self.arena.resolve_as_type(callee) {
            return Ok(self.convert_to_cast(id, t));
        }

        let all_args_resolved = args.map_or(true, |a| self.arena.is_resolved(a));
        if !all_args_resolved {
            self.fail();
            return Ok(id);
        }

        let path = match &self.arena.expr(callee).kind {
            ExprKind::QualifiedIdentifier(p) => p.clone(),
            _ => {
                self.fail();
                return Ok(id);
            }
        };

        let context = self.arena.expr(id).context.clone();
        let name = path.to_string(&self.arena.interner);

        if path.is_unqualified() {
            match name.as_str() {
                "advance" => return self.create_advance_call(id, is_method_call),
                "static_assert" => return self.create_static_assert(id),
                "at" => {
                    if let Some(e) = self.create_at_call(id)? {
                        return Ok(e);
                    }
                }
                _ => {}
            }
        }

        let arg_exprs = self.arena.argument_list(args);
        for arg in &arg_exprs {
            if !self.arena.is_resolved_as_value(*arg) {
                if self.ignore_errors {
                    self.fail();
                    return Ok(id);
                }
                sanity::throw_if_not_readable_value(self.arena, *arg)?;
            }
        }

        let arg_types: Vec<Type> = arg_exprs
            .iter()
            .map(|a| self.arena.result_type(*a).expect("args are resolved values"))
            .collect();

        let candidates = self.find_all_possible_functions(callee, &path, &arg_types, &arg_exprs);

        let viable: Vec<PossibleFunction> = candidates
            .iter()
            .filter(|c| !c.is_impossible)
            .cloned()
            .collect();

        // Exactly one non-impossible candidate: take it, casting if needed.
        if viable.len() == 1 {
            let c = viable[0].clone();
            if let Some(resolved) =
                self.resolve_candidate(&c, id, allow_generics, self.ignore_errors)?
            {
                return Ok(resolved);
            }
            return Ok(id);
        }

        // One perfect match beats any number of cast matches.
        let exact_matches: Vec<&PossibleFunction> =
            viable.iter().filter(|c| c.is_exact_match()).collect();
        if exact_matches.len() == 1 {
            let c = (*exact_matches[0]).clone();
            if let Some(resolved) =
                self.resolve_candidate(&c, id, allow_generics, self.ignore_errors)?
            {
                return Ok(resolved);
            }
            return Ok(id);
        }

        // See if exactly one generic candidate specialises successfully.
        let generic_candidates: Vec<PossibleFunction> = viable
            .iter()
            .filter(|c| c.requires_generic)
            .cloned()
            .collect();

        let mut matching_generics = Vec::new();
        for c in &generic_candidates {
            if let Some(e) = self.resolve_candidate(c, id, allow_generics, true)? {
                matching_generics.push(e);
            } else if !allow_generics {
                return Ok(id);
            }
        }

        if matching_generics.len() == 1 {
            return Ok(matching_generics[0]);
        }

        if !self.ignore_errors {
            if candidates.is_empty() {
                return Err(self.unknown_function_error(callee, &path, arg_exprs.len(), &context));
            }

            if viable.is_empty() {
                // single candidate: point at the argument that will not cast
                if candidates.len() == 1 && !candidates[0].requires_generic {
                    let params = self.arena.function(candidates[0].function).parameters.clone();
                    for (i, p) in params.iter().enumerate() {
                        if let Some(t) = self.arena.var_type(*p) {
                            sanity::expect_silent_cast_possible(
                                self.arena,
                                &self.arena.expr_location(arg_exprs[i]),
                                &t,
                                arg_exprs[i],
                            )?;
                        }
                    }
                }
                return Err(self.err(
                    Category::Overload,
                    context.location,
                    format!(
                        "no matching function for the call {}",
                        self.describe_call(&name, &arg_types)
                    ),
                ));
            }

            let all: Vec<FunctionId> = candidates.iter().map(|c| c.function).collect();
            sanity::check_for_duplicate_functions(self.arena, &all)?;
            return Err(self.err(
                Category::Overload,
                context.location,
                format!(
                    "ambiguous function call {}",
                    self.describe_call(&name, &arg_types)
                ),
            ));
        }

        self.fail();
        Ok(id)
    }

    fn describe_call(&self, name: &str, arg_types: &[Type]) -> String {
        let types: Vec<String> = arg_types.iter().map(Type::description).collect();
        format!("{name}({})", types.join(", "))
    }

    fn find_all_possible_functions(
        &self,
        callee: ExprId,
        path: &Path,
        arg_types: &[Type],
        arg_exprs: &[ExprId],
    ) -> Vec<PossibleFunction> {
        let opts = NameSearchOptions {
            find_variables: false,
            find_types: false,
            find_functions: true,
            find_processors_and_namespaces: false,
            find_endpoints: false,
            stop_at_first_scope_with_results: false,
            required_num_function_args: Some(arg_types.len()),
        };

        let scope = self.arena.expr(callee).context.scope;
        let mut found = self
            .arena
            .perform_name_search(scope, path, &opts, Some(&self.stmt_stack));

        // Unqualified lookups also search the intrinsics namespace.
        if path.is_unqualified() {
            if let Some(intrinsics_path) = self.intrinsics_lookup_path(path.first()) {
                found.extend(self.arena.perform_name_search(
                    self.root_scope(),
                    &intrinsics_path,
                    &opts,
                    None,
                ));
            }
        }

        let mut results = Vec::new();
        for item in found {
            if let FoundItem::Function(f) = item {
                if self.arena.function(f).original_generic_function.is_some() {
                    continue;
                }
                if results.iter().any(|p: &PossibleFunction| p.function == f) {
                    continue;
                }
                results.push(self.classify_candidate(f, arg_types, arg_exprs));
            }
        }
        results
    }

    fn intrinsics_lookup_path(&self, last: Name) -> Option<Path> {
        let soul = self.arena.interner.lookup(INTRINSICS_PARENT_NAMESPACE)?;
        let intrinsics = self.arena.interner.lookup(INTRINSICS_NAMESPACE)?;
        Some(Path {
            parts: vec![soul, intrinsics, last],
        })
    }

    fn root_scope(&self) -> ScopeId {
        let mut scope = self.arena.module(self.module).scope;
        while let Some(parent) = self.arena.scope(scope).parent {
            scope = parent;
        }
        scope
    }

    fn classify_candidate(
        &self,
        f: FunctionId,
        arg_types: &[Type],
        arg_exprs: &[ExprId],
    ) -> PossibleFunction {
        let function = self.arena.function(f);
        let mut result = PossibleFunction {
            function: f,
            is_impossible: false,
            requires_cast: false,
            requires_generic: false,
        };

        for (i, arg) in arg_types.iter().enumerate() {
            let param = function.parameters[i];
            if function.is_generic() && !self.arena.var_is_resolved(param) {
                result.requires_generic = true;
                continue;
            }
            let param_type = match self.arena.var_type(param) {
                Some(t) => t,
                None => {
                    result.requires_generic = true;
                    continue;
                }
            };
            if TypeRules::can_pass_as_argument_to(&param_type, arg, true) {
                continue;
            }
            // a literal whose value fits the parameter still casts silently
            let value_fits = !param_type.is_reference()
                && self
                    .arena
                    .get_as_constant(arg_exprs[i])
                    .map_or(false, |c| TypeRules::can_silently_cast_value_to(&param_type, &c));
            if !TypeRules::can_pass_as_argument_to(&param_type, arg, false) && !value_fits {
                result.is_impossible = true;
            }
            result.requires_cast = true;
        }

        result
    }

    fn resolve_candidate(
        &mut self,
        candidate: &PossibleFunction,
        call: ExprId,
        allow_generics: bool,
        ignore_errors_in_generics: bool,
    ) -> CompileResult<Option<ExprId>> {
        if sanity::is_run_function(self.arena, candidate.function) {
            return Err(self.err(
                Category::Overload,
                self.arena.expr_location(call),
                "the run() function cannot be called from user code",
            ));
        }

        if self.arena.function(candidate.function).is_generic() {
            if !allow_generics {
                self.fail();
                return Ok(None);
            }
            return self.create_call_to_generic_function(
                call,
                candidate.function,
                ignore_errors_in_generics,
            );
        }

        let (args, context) = match self.arena.expr(call).kind.clone() {
            ExprKind::CallOrCast { args, .. } => (args, self.arena.expr(call).context.clone()),
            _ => unreachable!(),
        };
        Ok(Some(self.arena.alloc_expr(
            ExprKind::FunctionCall {
                function: candidate.function,
                args,
            },
            context,
        )))
    }

    fn unknown_function_error(
        &self,
        callee: ExprId,
        path: &Path,
        num_args: usize,
        context: &Context,
    ) -> Diagnostic {
        let name = path.to_string(&self.arena.interner);

        // Is there a function with this name but the wrong arity?
        let opts = NameSearchOptions {
            find_variables: true,
            find_types: true,
            find_functions: true,
            find_processors_and_namespaces: true,
            find_endpoints: true,
            stop_at_first_scope_with_results: true,
            required_num_function_args: None,
        };
        let scope = self.arena.expr(callee).context.scope;
        let mut found = self
            .arena
            .perform_name_search(scope, path, &opts, Some(&self.stmt_stack));
        if path.is_unqualified() {
            if let Some(p) = self.intrinsics_lookup_path(path.first()) {
                found.extend(self.arena.perform_name_search(self.root_scope(), &p, &opts, None));
            }
        }

        let num_functions = found
            .iter()
            .filter(|i| matches!(i, FoundItem::Function(_)))
            .count();
        if num_functions > 0 {
            return self.err(
                Category::Overload,
                context.location.clone(),
                format!("no function called '{name}' takes {num_args} argument(s)"),
            );
        }

        if let Some(first) = found.first() {
            match first {
                FoundItem::Module(m) if self.arena.module(*m).is_processor_or_graph() => {
                    return self.err(
                        Category::Overload,
                        context.location.clone(),
                        "a processor cannot be used as a function",
                    );
                }
                FoundItem::Endpoint(e) => {
                    let which = if self.arena.endpoint(*e).is_input {
                        "input"
                    } else {
                        "output"
                    };
                    return self.err(
                        Category::Overload,
                        context.location.clone(),
                        format!("an {which} cannot be used as a function"),
                    );
                }
                _ => {}
            }
        }

        if let Some(suggestion) = self.find_possible_misspelt_function(&name) {
            return self.err(
                Category::Overload,
                context.location.clone(),
                format!("unknown function '{name}' — did you mean '{suggestion}'?"),
            );
        }

        self.err(
            Category::Overload,
            context.location.clone(),
            format!("unknown function '{name}'"),
        )
    }

    /// Nearest-spelt function name across the whole program (threshold 5).
    fn find_possible_misspelt_function(&self, name: &str) -> Option<String> {
        let root = self.arena.enclosing_module(self.root_scope())?;
        let mut nearest = None;
        let mut lowest = 5usize;
        self.find_least_misspelt(root, name, &mut nearest, &mut lowest);
        nearest
    }

    fn find_least_misspelt(
        &self,
        module: ModuleId,
        name: &str,
        nearest: &mut Option<String>,
        lowest: &mut usize,
    ) {
        for f in &self.arena.module(module).functions {
            let candidate = self.arena.name(self.arena.function(*f).name);
            let distance = levenshtein_distance(name, candidate);
            if distance < *lowest {
                *lowest = distance;
                *nearest = Some(candidate.to_string());
            }
        }
        for sub in &self.arena.module(module).sub_modules {
            self.find_least_misspelt(*sub, name, nearest, lowest);
        }
    }

    fn create_advance_call(&mut self, call: ExprId, is_method_call: bool) -> CompileResult<ExprId> {
        let context = self.arena.expr(call).context.clone();

        if is_method_call {
            return Err(self.err(
                Category::Resolution,
                context.location,
                "advance() is a function, not a method",
            ));
        }
        let args = match &self.arena.expr(call).kind {
            ExprKind::CallOrCast { args, .. } => *args,
            _ => unreachable!(),
        };
        if !self.arena.argument_list(args).is_empty() {
            return Err(self.err(
                Category::Resolution,
                context.location,
                "advance() does not take any arguments",
            ));
        }
        let in_run = self
            .current_function
            .map_or(false, |f| sanity::is_run_function(self.arena, f));
        if !in_run {
            return Err(self.err(
                Category::Resolution,
                context.location,
                "advance() can only be called inside the run() function",
            ));
        }

        Ok(self.arena.alloc_expr(ExprKind::AdvanceClock, context))
    }

    fn create_static_assert(&mut self, call: ExprId) -> CompileResult<ExprId> {
        let context = self.arena.expr(call).context.clone();
        let args = match &self.arena.expr(call).kind {
            ExprKind::CallOrCast { args, .. } => *args,
            _ => unreachable!(),
        };
        let arg_list = self.arena.argument_list(args);

        if arg_list.is_empty() || arg_list.len() > 2 {
            return Err(self.err(
                Category::Resolution,
                context.location,
                "static_assert expects 1 or 2 arguments",
            ));
        }

        let message = if arg_list.len() == 2 {
            match self.arena.get_as_constant(arg_list[1]) {
                Some(Value::String(s)) => s.to_string(),
                _ => {
                    return Err(self.err(
                        Category::Resolution,
                        self.arena.expr_location(arg_list[1]),
                        "the second argument of static_assert must be a string literal",
                    ))
                }
            }
        } else {
            "static_assert failed".to_string()
        };

        Ok(self.arena.alloc_expr(
            ExprKind::StaticAssertion {
                condition: arg_list[0],
                message,
            },
            context,
        ))
    }

    fn create_at_call(&mut self, call: ExprId) -> CompileResult<Option<ExprId>> {
        let context = self.arena.expr(call).context.clone();
        let args = match &self.arena.expr(call).kind {
            ExprKind::CallOrCast { args, .. } => *args,
            _ => unreachable!(),
        };
        let arg_list = self.arena.argument_list(args);

        if arg_list.len() != 2 {
            return Err(self.err(
                Category::Resolution,
                context.location,
                "the at() method expects 1 argument",
            ));
        }

        let array = arg_list[0];
        let index = arg_list[1];

        sanity::expect_silent_cast_possible(
            self.arena,
            &self.arena.expr_location(index),
            &Type::int32(),
            index,
        )?;

        if self.arena.is_resolved_as_endpoint(array) {
            let endpoint = match &self.arena.expr(array).kind {
                ExprKind::InputEndpointRef(e) | ExprKind::OutputEndpointRef(e) => *e,
                _ => unreachable!(),
            };
            let has_array = self.arena.endpoint(endpoint).array_size.is_some();
            if !has_array {
                return Err(self.err(
                    Category::Type,
                    context.location,
                    "the at() method requires an array or vector",
                ));
            }
        } else {
            match self.arena.result_type(array) {
                Some(t) if t.is_array_or_vector() => {}
                Some(_) => {
                    return Err(self.err(
                        Category::Type,
                        context.location,
                        "the at() method requires an array or vector",
                    ))
                }
                None => return Ok(None),
            }
        }

        Ok(Some(self.arena.alloc_expr(
            ExprKind::ArrayElementRef {
                object: array,
                start: Some(index),
                end: None,
                is_slice: false,
                suppress_wrap_warning: true,
            },
            context,
        )))
    }

    // ── Generic specialisation ──

    fn create_call_to_generic_function(
        &mut self,
        call: ExprId,
        generic: FunctionId,
        ignore_errors: bool,
    ) -> CompileResult<Option<ExprId>> {
        let (args, context) = match self.arena.expr(call).kind.clone() {
            ExprKind::CallOrCast { args, .. } => (args, self.arena.expr(call).context.clone()),
            _ => unreachable!(),
        };

        let arg_exprs = self.arena.argument_list(args);
        let arg_types: Vec<Type> = arg_exprs
            .iter()
            .map(|a| self.arena.result_type(*a).expect("args resolved"))
            .collect();

        let specialised_name = format!(
            "_{}_specialised_{}",
            self.arena.name(self.arena.function(generic).name),
            mangle_argument_types(&arg_types)
        );

        let specialised =
            self.get_or_create_specialised_function(call, generic, &specialised_name, &arg_types, ignore_errors)?;

        match specialised {
            Some(f) => Ok(Some(self.arena.alloc_expr(
                ExprKind::FunctionCall { function: f, args },
                context,
            ))),
            None => Ok(None),
        }
    }

    fn get_or_create_specialised_function(
        &mut self,
        call: ExprId,
        generic: FunctionId,
        specialised_name: &str,
        arg_types: &[Type],
        ignore_errors: bool,
    ) -> CompileResult<Option<FunctionId>> {
        let module = self
            .arena
            .enclosing_module(self.arena.function(generic).scope)
            .expect("functions live inside modules");

        let name = self.arena.interner.get(specialised_name);
        for f in &self.arena.module(module).functions {
            let existing = self.arena.function(*f);
            if existing.name == name && existing.original_generic_function == Some(generic) {
                return Ok(Some(*f));
            }
        }

        let clone = parser::clone_function(self.arena, generic)
            .map_err(|e| Diagnostic { category: Category::Resolution, ..e })?;
        {
            let f = self.arena.function_mut(clone);
            f.name = name;
            f.original_generic_function = Some(generic);
        }

        assert_eq!(
            arg_types.len(),
            self.arena.function(clone).parameters.len()
        );

        if !self.resolve_generic_wildcards(call, generic, clone, arg_types, ignore_errors)? {
            // the wildcards would not pin — discard the clone
            let functions = &mut self.arena.module_mut(module).functions;
            if let Some(pos) = functions.iter().position(|f| *f == clone) {
                functions.remove(pos);
            }
            return Ok(None);
        }

        self.stats.num_replaced += 1;
        Ok(Some(clone))
    }

    fn resolve_generic_wildcards(
        &mut self,
        call: ExprId,
        original: FunctionId,
        function: FunctionId,
        arg_types: &[Type],
        ignore_errors: bool,
    ) -> CompileResult<bool> {
        while let Some(wildcard) = self.arena.function_mut(function).generic_wildcards.pop() {
            let (wildcard_name, wildcard_context) = match &self.arena.expr(wildcard).kind {
                ExprKind::QualifiedIdentifier(p) => {
                    (p.first(), self.arena.expr(wildcard).context.clone())
                }
                _ => unreachable!("wildcards are qualified identifiers"),
            };

            let mut resolved: Option<Type> = None;

            for (i, arg_type) in arg_types.iter().enumerate() {
                let param = self.arena.function(function).parameters[i];
                let param_type = match self.arena.var(param).declared_type {
                    Some(t) => t,
                    None => continue,
                };

                let mut any_references = false;
                let matched = self.match_parameter_against_wildcard(
                    param_type,
                    arg_type,
                    wildcard_name,
                    &mut any_references,
                );

                if let Some(mut new_match) = matched {
                    if !new_match.is_reference() {
                        new_match = new_match.remove_const_if_present();
                    }

                    match &resolved {
                        Some(existing) if new_match.is_identical(existing) => {}
                        Some(existing) => {
                            if !any_references
                                && TypeRules::can_silently_cast_to(&new_match, existing)
                            {
                                resolved = Some(new_match);
                            } else if any_references
                                || !TypeRules::can_silently_cast_to(existing, &new_match)
                            {
                                if !ignore_errors {
                                    return Err(self.generic_resolution_error(
                                        call,
                                        original,
                                        &wildcard_context.location,
                                        &format!(
                                            "could not find a value for '{}' that satisfies all argument types",
                                            self.arena.name(wildcard_name)
                                        ),
                                    ));
                                }
                                return Ok(false);
                            }
                        }
                        None => resolved = Some(new_match),
                    }
                }
            }

            let resolved = match resolved {
                Some(t) => t,
                None => {
                    if !ignore_errors {
                        return Err(self.generic_resolution_error(
                            call,
                            original,
                            &wildcard_context.location,
                            &format!(
                                "failed to resolve generic parameter '{}'",
                                self.arena.name(wildcard_name)
                            ),
                        ));
                    }
                    return Ok(false);
                }
            };

            let function_scope = self.arena.function(function).scope;
            let type_expr = self.arena.alloc_expr(
                ExprKind::ConcreteType(resolved),
                Context {
                    location: wildcard_context.location.clone(),
                    scope: function_scope,
                },
            );
            let using = self.arena.alloc_using(UsingDecl {
                name: wildcard_name,
                context: Context {
                    location: wildcard_context.location,
                    scope: function_scope,
                },
                target: Some(type_expr),
            });
            self.arena
                .function_mut(function)
                .generic_specialisations
                .push(using);
        }

        Ok(true)
    }

    fn generic_resolution_error(
        &self,
        call: ExprId,
        function: FunctionId,
        wildcard_location: &Location,
        message: &str,
    ) -> Diagnostic {
        let f = self.arena.function(function);
        let name = self.arena.name(f.name);
        if f.context.location.chunk.is_internal {
            self.err(
                Category::Overload,
                self.arena.expr_location(call),
                format!("could not resolve argument types for the function call '{name}'"),
            )
        } else {
            self.err(
                Category::Overload,
                wildcard_location.clone(),
                format!("failed to resolve the generic function call '{name}': {message}"),
            )
        }
    }

    /// Structural match of a declared parameter shape against a caller
    /// argument type, hunting for the wildcard.
    fn match_parameter_against_wildcard(
        &self,
        param_type: ExprId,
        caller_type: &Type,
        wildcard: Name,
        any_references: &mut bool,
    ) -> Option<Type> {
        match &self.arena.expr(param_type).kind {
            ExprKind::QualifiedIdentifier(p) => {
                if p.is_unqualified() && p.first() == wildcard {
                    Some(caller_type.clone())
                } else {
                    None
                }
            }
            ExprKind::TypeMetaFunction { op, source } => match op {
                MetaOp::MakeConst => self.match_parameter_against_wildcard(
                    *source,
                    &caller_type.remove_const_if_present(),
                    wildcard,
                    any_references,
                ),
                MetaOp::MakeReference => {
                    *any_references = true;
                    self.match_parameter_against_wildcard(
                        *source,
                        &caller_type.remove_reference_if_present(),
                        wildcard,
                        any_references,
                    )
                }
                _ => None,
            },
            ExprKind::SubscriptWithBrackets { lhs, rhs } => {
                if caller_type.is_array() && rhs.is_none() {
                    return self.match_parameter_against_wildcard(
                        *lhs,
                        &caller_type.element_type()?,
                        wildcard,
                        any_references,
                    );
                }
                if caller_type.is_fixed_size_array() {
                    if let Some(size_expr) = rhs {
                        let size = self.arena.get_as_constant(*size_expr)?.as_i64()?;
                        if Some(size as u64) == caller_type.array_or_vector_size() {
                            return self.match_parameter_against_wildcard(
                                *lhs,
                                &caller_type.element_type()?,
                                wildcard,
                                any_references,
                            );
                        }
                    }
                }
                None
            }
            ExprKind::SubscriptWithChevrons { lhs, rhs } => {
                if caller_type.is_vector() {
                    let size = self.arena.get_as_constant(*rhs)?.as_i64()?;
                    if Some(size as u64) == caller_type.array_or_vector_size() {
                        return self.match_parameter_against_wildcard(
                            *lhs,
                            &caller_type.element_type()?,
                            wildcard,
                            any_references,
                        );
                    }
                }
                None
            }
            _ => None,
        }
    }

    // ── ConstantFolder ──

    fn fold_post(&mut self, id: ExprId) -> CompileResult<ExprId> {
        let kind = self.arena.expr(id).kind.clone();
        let context = self.arena.expr(id).context.clone();

        match kind {
            ExprKind::VariableRef(v) => {
                if !self.arena.var_is_resolved(v) {
                    self.fail();
                    return Ok(id);
                }
                let var = self.arena.var(v);
                if var.num_writes == 0 && !var.is_external {
                    if let Some(init) = var.initial_value {
                        if let Some(c) = self.arena.get_as_constant(init) {
                            let t = c.type_of();
                            // arrays are left unfolded so downstream code
                            // generation can keep them addressable
                            if !t.is_array() {
                                if let Some(var_type) = self.arena.var_type(v) {
                                    let bare = var_type.remove_const_if_present();
                                    if t.is_identical(&bare) {
                                        return Ok(self
                                            .arena
                                            .alloc_expr(ExprKind::Constant(c), context));
                                    }
                                    if TypeRules::can_silently_cast_value_to(&bare, &c) {
                                        let cast = c.cast_to_expecting_success(&bare);
                                        return Ok(self
                                            .arena
                                            .alloc_expr(ExprKind::Constant(cast), context));
                                    }
                                }
                            }
                        }
                    }
                }
                Ok(id)
            }
            ExprKind::Ternary { condition, true_branch, false_branch } => {
                if !self.arena.is_resolved(id) {
                    self.fail();
                    return Ok(id);
                }
                if let Some(c) = self.arena.get_as_constant(condition) {
                    if let Some(b) = c.as_bool() {
                        return Ok(if b { true_branch } else { false_branch });
                    }
                }
                Ok(id)
            }
            ExprKind::Unary { op, source } => {
                if !self.arena.is_resolved(id) {
                    self.fail();
                    return Ok(id);
                }
                if let Some(c) = self.arena.get_as_constant(source) {
                    if let Some(result) = op.apply(&c) {
                        return Ok(self.arena.alloc_expr(ExprKind::Constant(result), context));
                    }
                }
                Ok(id)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                if self.arena.is_output_endpoint(lhs) {
                    self.fail();
                    return Ok(id);
                }
                if !self.arena.is_resolved(id) {
                    self.fail();
                    return Ok(id);
                }
                sanity::throw_if_not_readable_value(self.arena, rhs)?;
                sanity::throw_if_not_readable_value(self.arena, lhs)?;

                let lhs_type = self.arena.result_type(lhs);
                let rhs_type = self.arena.result_type(rhs);
                let operand = match (lhs_type, rhs_type) {
                    (Some(l), Some(r)) => op.operand_type(&l, &r),
                    _ => None,
                };

                if operand.is_some() {
                    if let (Some(a), Some(b)) =
                        (self.arena.get_as_constant(lhs), self.arena.get_as_constant(rhs))
                    {
                        // report divide-by-zero at the offending literal
                        if b.is_zero()
                            && matches!(op, BinaryOp::Divide | BinaryOp::Modulo)
                        {
                            return Err(self.err(
                                Category::Lowering,
                                self.arena.expr_location(rhs),
                                if op == BinaryOp::Divide {
                                    "division by zero"
                                } else {
                                    "modulo zero"
                                },
                            ));
                        }
                        let operand = operand.unwrap();
                        let ca = a
                            .try_cast_to(&operand)
                            .unwrap_or(a);
                        let cb = b
                            .try_cast_to(&operand)
                            .unwrap_or(b);
                        match op.apply(&ca, &cb) {
                            Ok(v) => {
                                return Ok(self
                                    .arena
                                    .alloc_expr(ExprKind::Constant(v), context))
                            }
                            Err(msg) => {
                                return Err(self.err(
                                    Category::Lowering,
                                    context.location,
                                    msg,
                                ))
                            }
                        }
                    }
                }
                Ok(id)
            }
            ExprKind::TypeCast { target, source } => self.fold_type_cast(id, target, source),
            ExprKind::FunctionCall { function, args } => {
                if self.arena.function(function).intrinsic.is_some() {
                    let arg_exprs = self.arena.argument_list(args);
                    let mut constants = Vec::new();
                    for a in &arg_exprs {
                        match self.arena.get_as_constant(*a) {
                            Some(c) => constants.push(c),
                            None => break,
                        }
                    }
                    if constants.len() == arg_exprs.len() && !arg_exprs.is_empty() {
                        let intrinsic = self.arena.function(function).intrinsic.unwrap();
                        if let Some(result) = intrinsic.perform(&constants) {
                            return Ok(self.arena.alloc_expr(ExprKind::Constant(result), context));
                        }
                    }
                }
                if !self.arena.is_resolved(id) {
                    self.fail();
                }
                Ok(id)
            }
            ExprKind::StaticAssertion { condition, .. } => {
                if let Some(c) = self.arena.get_as_constant(condition) {
                    if c.as_bool() == Some(false) {
                        let message = match &self.arena.expr(id).kind {
                            ExprKind::StaticAssertion { message, .. } => message.clone(),
                            _ => unreachable!(),
                        };
                        return Err(self.err(Category::Resolution, context.location, message));
                    }
                }
                Ok(id)
            }
            _ => {
                if !self.arena.is_resolved(id) {
                    self.fail();
                }
                Ok(id)
            }
        }
    }

    fn fold_type_cast(&mut self, id: ExprId, target: Type, source: ExprId) -> CompileResult<ExprId> {
        let context = self.arena.expr(id).context.clone();
        if !self.arena.is_resolved(id) {
            self.fail();
            return Ok(id);
        }

        let args = self.cast_argument_list(source);

        if args.is_empty() {
            return Ok(self
                .arena
                .alloc_expr(ExprKind::Constant(Value::zero_initialiser(&target)), context));
        }

        if matches!(self.arena.expr(source).kind, ExprKind::CommaSeparatedList(_)) {
            let mut constants = Vec::new();
            for a in &args {
                match self.arena.get_as_constant(*a) {
                    Some(c) => constants.push(c),
                    None => return Ok(id),
                }
            }

            if args.len() == 1 {
                if let Some(cast) = constants[0].try_cast_to(&target) {
                    return Ok(self.arena.alloc_expr(ExprKind::Constant(cast), context));
                }
                return Ok(id);
            }

            if target.is_array_or_vector() {
                let element = target.element_type().expect("aggregate element type");
                let mut element_values = Vec::with_capacity(constants.len());
                for c in &constants {
                    match c.try_cast_to(&element) {
                        Some(v) => element_values.push(v),
                        None => return Ok(id),
                    }
                }
                let final_type = if target.is_unsized_array() {
                    target.with_array_size(constants.len() as u64)
                } else {
                    sanity::throw_if_wrong_number_of_elements(
                        &context.location,
                        &target,
                        constants.len(),
                    )?;
                    target.clone()
                };
                return Ok(self.arena.alloc_expr(
                    ExprKind::Constant(Value::Aggregate {
                        ty: final_type.without_modifiers(),
                        elements: element_values,
                    }),
                    context,
                ));
            }

            if let Some(s) = target.struct_ref() {
                sanity::throw_if_wrong_number_of_elements(&context.location, &target, constants.len())?;
                let members = s.members.borrow().clone();
                let mut member_values = Vec::with_capacity(members.len());
                for (i, c) in constants.iter().enumerate() {
                    if TypeRules::can_silently_cast_value_to(&members[i].ty, c) {
                        member_values.push(c.cast_to_expecting_success(&members[i].ty));
                    } else {
                        sanity::expect_silent_cast_possible(
                            self.arena,
                            &self.arena.expr_location(args[i]),
                            &members[i].ty,
                            args[i],
                        )?;
                        return Ok(id);
                    }
                }
                return Ok(self.arena.alloc_expr(
                    ExprKind::Constant(Value::Aggregate {
                        ty: target.without_modifiers(),
                        elements: member_values,
                    }),
                    context,
                ));
            }

            if args.len() > 1 {
                return Err(self.err(
                    Category::Type,
                    context.location,
                    format!("wrong type to create '{target}' from an initialiser list"),
                ));
            }
            return Ok(id);
        }

        // single plain source
        if let Some(source_type) = self.arena.result_type(source) {
            if source_type.is_identical(&target) {
                return Ok(source);
            }
        }

        if let Some(c) = self.arena.get_as_constant(source) {
            if TypeRules::can_silently_cast_value_to(&target, &c)
                || TypeRules::can_cast_to(&target, &c.type_of())
            {
                if let Some(cast) = c.try_cast_to(&target) {
                    return Ok(self.arena.alloc_expr(ExprKind::Constant(cast), context));
                }
            }
        }

        Ok(id)
    }

    /// Constant-folds function call arguments, leaving reference-parameter
    /// arguments untouched (folding them would break pass-by-reference).
    fn fold_function_call_args(
        &mut self,
        function: FunctionId,
        args: Option<ExprId>,
    ) -> CompileResult<()> {
        let arg_exprs = self.arena.argument_list(args);
        let params = self.arena.function(function).parameters.clone();

        for (i, arg) in arg_exprs.iter().enumerate() {
            let param_type = params.get(i).and_then(|p| self.arena.var_type(*p));
            let is_reference = param_type.as_ref().map_or(false, Type::is_reference);

            if is_reference {
                let is_non_const_ref = param_type
                    .as_ref()
                    .map_or(false, |t| t.is_non_const_reference());
                if is_non_const_ref
                    && self.arena.is_resolved_as_value(*arg)
                    && !self.arena.is_assignable(*arg)
                {
                    return Err(self.err(
                        Category::Type,
                        self.arena.expr_location(*arg),
                        "cannot pass a const value as a non-const reference",
                    ));
                }
                continue;
            }

            let new = self.rewrite_expr(*arg)?;
            if new != *arg {
                if let Some(list) = args {
                    if let ExprKind::CommaSeparatedList(items) =
                        &mut self.arena.expr_mut(list).kind
                    {
                        items[i] = new;
                    }
                }
            }
        }
        Ok(())
    }

    // ── FullResolver ──

    fn full_post(&mut self, id: ExprId) -> CompileResult<ExprId> {
        let context = self.arena.expr(id).context.clone();
        match self.arena.expr(id).kind.clone() {
            ExprKind::QualifiedIdentifier(path) => Err(self.err(
                Category::Resolution,
                context.location,
                format!(
                    "cannot find symbol '{}'",
                    path.to_string(&self.arena.interner)
                ),
            )),
            ExprKind::CallOrCast { .. } => Err(self.err(
                Category::Resolution,
                context.location,
                "cannot resolve this as a function call or cast",
            )),
            ExprKind::SubscriptWithBrackets { .. } => Err(self.err(
                Category::Resolution,
                context.location,
                "cannot resolve this bracketed expression",
            )),
            ExprKind::SubscriptWithChevrons { .. } => Err(self.err(
                Category::Type,
                context.location,
                "cannot resolve this vector size",
            )),
            ExprKind::DotOperator { .. } => Err(self.err(
                Category::Resolution,
                context.location,
                "cannot resolve the '.' operator here",
            )),
            ExprKind::Ternary {
                condition,
                true_branch,
                false_branch,
            } => self.full_check_ternary(id, condition, true_branch, false_branch),
            ExprKind::TypeCast { target, source } => {
                if target.is_unsized_array() {
                    return Err(self.err(
                        Category::Type,
                        context.location,
                        "not yet implemented: casts to unsized arrays",
                    ));
                }
                let num_args = match &self.arena.expr(source).kind {
                    ExprKind::CommaSeparatedList(items) => items.len(),
                    _ => 1,
                };
                if num_args != 1 {
                    sanity::throw_if_wrong_number_of_elements(&context.location, &target, num_args)?;
                }
                Ok(id)
            }
            ExprKind::Binary { op, lhs, rhs } => self.full_check_binary(id, op, lhs, rhs),
            ExprKind::Assignment { target, value } => {
                if !self.arena.is_assignable(target) {
                    return Err(self.err(
                        Category::Type,
                        context.location,
                        "the '=' operator must be given an assignable target",
                    ));
                }
                let target_type = self
                    .arena
                    .result_type(target)
                    .ok_or_else(|| {
                        self.err(Category::Type, context.location.clone(), "expected a value")
                    })?
                    .remove_reference_if_present()
                    .remove_const_if_present();
                sanity::expect_silent_cast_possible(self.arena, &context.location, &target_type, value)?;
                Ok(id)
            }
            ExprKind::PreOrPostIncDec { target, is_increment, .. } => {
                let symbol = if is_increment { "++" } else { "--" };
                if !self.arena.is_assignable(target) {
                    return Err(self.err(
                        Category::Type,
                        context.location,
                        format!("the '{symbol}' operator must be given an assignable target"),
                    ));
                }
                let t = self
                    .arena
                    .result_type(target)
                    .ok_or_else(|| self.err(Category::Type, context.location.clone(), "expected a value"))?;
                if t.is_primitive_bool() || !(t.is_primitive() || t.is_bounded_int()) {
                    return Err(self.err(
                        Category::Type,
                        context.location,
                        format!("illegal type for the '{symbol}' operator"),
                    ));
                }
                Ok(id)
            }
            ExprKind::ArrayElementRef { .. } => self.full_check_array_element(id),
            ExprKind::WriteToEndpoint { .. } => self.full_check_write(id),
            ExprKind::StaticAssertion { condition, message } => {
                match self.arena.get_as_constant(condition) {
                    Some(c) => {
                        if c.as_bool() == Some(false) {
                            return Err(self.err(Category::Resolution, context.location, message));
                        }
                        Ok(id)
                    }
                    None => Err(self.err(
                        Category::Resolution,
                        context.location,
                        "the static_assert condition must be a compile-time constant",
                    )),
                }
            }
            _ => Ok(id),
        }
    }

    fn full_check_ternary(
        &mut self,
        id: ExprId,
        condition: ExprId,
        true_branch: ExprId,
        false_branch: ExprId,
    ) -> CompileResult<ExprId> {
        let context = self.arena.expr(id).context.clone();

        sanity::throw_if_not_readable_value(self.arena, condition)?;
        sanity::throw_if_not_readable_value(self.arena, true_branch)?;
        sanity::throw_if_not_readable_value(self.arena, false_branch)?;
        sanity::expect_silent_cast_possible(self.arena, &context.location, &Type::bool(), condition)?;

        let true_type = self
            .arena
            .result_type(true_branch)
            .expect("readable value has a type")
            .remove_const_if_present();
        let false_type = self
            .arena
            .result_type(false_branch)
            .expect("readable value has a type")
            .remove_const_if_present();

        if true_type.is_void() || false_type.is_void() {
            return Err(self.err(
                Category::Type,
                context.location,
                "ternary branches cannot be void",
            ));
        }

        if !true_type.is_identical(&false_type) {
            let cast_to_true = TypeRules::can_silently_cast_to(&true_type, &false_type)
                || self
                    .arena
                    .get_as_constant(false_branch)
                    .map_or(false, |c| TypeRules::can_silently_cast_value_to(&true_type, &c));
            let cast_to_false = TypeRules::can_silently_cast_to(&false_type, &true_type)
                || self
                    .arena
                    .get_as_constant(true_branch)
                    .map_or(false, |c| TypeRules::can_silently_cast_value_to(&false_type, &c));

            if !(cast_to_true || cast_to_false) {
                return Err(self.err(
                    Category::Type,
                    context.location,
                    format!("ternary branch types do not match ('{true_type}' and '{false_type}')"),
                ));
            }

            if cast_to_true {
                let fb_context = self.arena.expr(false_branch).context.clone();
                let cast = self.arena.alloc_expr(
                    ExprKind::TypeCast {
                        target: true_type,
                        source: false_branch,
                    },
                    fb_context,
                );
                if let ExprKind::Ternary { false_branch, .. } = &mut self.arena.expr_mut(id).kind {
                    *false_branch = cast;
                }
            } else {
                let tb_context = self.arena.expr(true_branch).context.clone();
                let cast = self.arena.alloc_expr(
                    ExprKind::TypeCast {
                        target: false_type,
                        source: true_branch,
                    },
                    tb_context,
                );
                if let ExprKind::Ternary { true_branch, .. } = &mut self.arena.expr_mut(id).kind {
                    *true_branch = cast;
                }
            }
            self.stats.num_replaced += 1;
        }

        if let Some(c) = self.arena.get_as_constant(condition) {
            if let Some(b) = c.as_bool() {
                let (true_branch, false_branch) = match &self.arena.expr(id).kind {
                    ExprKind::Ternary {
                        true_branch,
                        false_branch,
                        ..
                    } => (*true_branch, *false_branch),
                    _ => unreachable!(),
                };
                return Ok(if b { true_branch } else { false_branch });
            }
        }

        Ok(id)
    }

    fn full_check_binary(
        &mut self,
        id: ExprId,
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    ) -> CompileResult<ExprId> {
        let context = self.arena.expr(id).context.clone();
        sanity::throw_if_not_readable_value(self.arena, rhs)?;

        if self.arena.is_output_endpoint(lhs) {
            return Ok(id);
        }

        sanity::throw_if_not_readable_value(self.arena, lhs)?;

        let lhs_type = self.arena.result_type(lhs).expect("readable value");
        let rhs_type = self.arena.result_type(rhs).expect("readable value");

        if let Some(c) = self.arena.get_as_constant(rhs) {
            if c.is_zero() && c.type_of().is_primitive_integer() {
                if op == BinaryOp::Modulo {
                    return Err(self.err(
                        Category::Lowering,
                        self.arena.expr_location(rhs),
                        "modulo zero",
                    ));
                }
                if op == BinaryOp::Divide {
                    return Err(self.err(
                        Category::Lowering,
                        self.arena.expr_location(rhs),
                        "division by zero",
                    ));
                }
            }
        }

        if op.operand_type(&lhs_type, &rhs_type).is_none() {
            // a constant on one side may still cast silently to the other,
            // provided the operator is legal on the unified type
            let lhs_const = self.arena.get_as_constant(lhs);
            let rhs_const = self.arena.get_as_constant(rhs);

            if let Some(c) = lhs_const {
                if TypeRules::can_silently_cast_value_to(&rhs_type, &c)
                    && op.operand_type(&rhs_type, &rhs_type).is_some()
                {
                    let cast = c.cast_to_expecting_success(&rhs_type.remove_const_if_present());
                    let lhs_context = self.arena.expr(lhs).context.clone();
                    let new = self.arena.alloc_expr(ExprKind::Constant(cast), lhs_context);
                    if let ExprKind::Binary { lhs, .. } = &mut self.arena.expr_mut(id).kind {
                        *lhs = new;
                    }
                    self.stats.num_replaced += 1;
                    return Ok(id);
                }
            }
            if let Some(c) = rhs_const {
                if TypeRules::can_silently_cast_value_to(&lhs_type, &c)
                    && op.operand_type(&lhs_type, &lhs_type).is_some()
                {
                    let cast = c.cast_to_expecting_success(&lhs_type.remove_const_if_present());
                    let rhs_context = self.arena.expr(rhs).context.clone();
                    let new = self.arena.alloc_expr(ExprKind::Constant(cast), rhs_context);
                    if let ExprKind::Binary { rhs, .. } = &mut self.arena.expr_mut(id).kind {
                        *rhs = new;
                    }
                    self.stats.num_replaced += 1;
                    return Ok(id);
                }
            }

            return Err(self.err(
                Category::Type,
                context.location,
                format!(
                    "illegal types for the '{}' operator ('{lhs_type}' and '{rhs_type}')",
                    op.symbol()
                ),
            ));
        }

        Ok(id)
    }

    fn full_check_array_element(&mut self, id: ExprId) -> CompileResult<ExprId> {
        let (object, start, end, is_slice) = match self.arena.expr(id).kind.clone() {
            ExprKind::ArrayElementRef {
                object,
                start,
                end,
                is_slice,
                ..
            } => (object, start, end, is_slice),
            _ => unreachable!(),
        };

        let object_type = if self.arena.is_resolved_as_endpoint(object) {
            match self.arena.endpoint_sample_array_type(object) {
                Some(t) => t,
                None => {
                    return Err(self.err(
                        Category::Type,
                        self.arena.expr_location(object),
                        "brackets cannot be used on this endpoint",
                    ))
                }
            }
        } else {
            self.arena
                .result_type(object)
                .ok_or_else(|| {
                    self.err(
                        Category::Type,
                        self.arena.expr_location(object),
                        "expected an array or vector",
                    )
                })?
        };

        if !object_type.is_array_or_vector() {
            return Err(self.err(
                Category::Type,
                self.arena.expr_location(object),
                "expected an array or vector to the left of the bracket operator",
            ));
        }

        let start = match start {
            Some(s) => s,
            None => return Ok(id),
        };

        if let Some(c) = self.arena.get_as_constant(start) {
            let index = c.as_i64().ok_or_else(|| {
                self.err(
                    Category::Type,
                    self.arena.expr_location(start),
                    "an array index must be an integer",
                )
            })?;

            if !is_slice
                && !object_type.is_unsized_array()
                && !object_type.is_valid_array_or_vector_index(index)
                && index >= 0
            {
                return Err(self.err(
                    Category::Lowering,
                    self.arena.expr_location(start),
                    "index out of range",
                ));
            }
            if !is_slice && index < 0 {
                return Err(self.err(
                    Category::Lowering,
                    self.arena.expr_location(start),
                    "index out of range",
                ));
            }

            if is_slice {
                if object_type.is_unsized_array() {
                    return Err(self.err(
                        Category::Type,
                        self.arena.expr_location(start),
                        "not yet implemented: slices of dynamic arrays",
                    ));
                }
                if let Some(element) = object_type.element_type() {
                    if !element.is_primitive() {
                        return Err(self.err(
                            Category::Type,
                            self.arena.expr_location(start),
                            "not yet implemented: slices of non-primitive arrays",
                        ));
                    }
                }
                if let Some(end_expr) = end {
                    match self.arena.get_as_constant(end_expr) {
                        Some(e) => {
                            let end_index = e.as_i64().ok_or_else(|| {
                                self.err(
                                    Category::Type,
                                    self.arena.expr_location(end_expr),
                                    "an array index must be an integer",
                                )
                            })?;
                            if !object_type.is_valid_array_or_vector_range(index, end_index) {
                                return Err(self.err(
                                    Category::Lowering,
                                    self.arena.expr_location(end_expr),
                                    "invalid slice size",
                                ));
                            }
                        }
                        None => {
                            return Err(self.err(
                                Category::Type,
                                self.arena.expr_location(end_expr),
                                "not yet implemented: dynamic slice indexes",
                            ))
                        }
                    }
                }
            }
        } else {
            if is_slice {
                return Err(self.err(
                    Category::Type,
                    self.arena.expr_location(start),
                    "not yet implemented: dynamic slice indexes",
                ));
            }
            let index_type = self
                .arena
                .result_type(start)
                .ok_or_else(|| {
                    self.err(
                        Category::Type,
                        self.arena.expr_location(start),
                        "expected a value",
                    )
                })?;
            if object_type.is_unsized_array() {
                if !index_type.is_integer() {
                    return Err(self.err(
                        Category::Type,
                        self.arena.expr_location(start),
                        "an array index must be an integer",
                    ));
                }
            } else {
                sanity::expect_silent_cast_possible(
                    self.arena,
                    &self.arena.expr_location(start),
                    &Type::int32(),
                    start,
                )?;
            }
        }

        Ok(id)
    }

    fn full_check_write(&mut self, id: ExprId) -> CompileResult<ExprId> {
        let (value, top_target) = match self.arena.expr(id).kind.clone() {
            ExprKind::WriteToEndpoint { target, value } => {
                let mut top = target;
                while let ExprKind::WriteToEndpoint { target, .. } = &self.arena.expr(top).kind {
                    top = *target;
                }
                (value, top)
            }
            _ => unreachable!(),
        };

        sanity::throw_if_not_readable_value(self.arena, value)?;
        let context = self.arena.expr(id).context.clone();

        if let ExprKind::OutputEndpointRef(e) = self.arena.expr(top_target).kind {
            let sample_types = self.endpoint_sample_types(e)?;
            sanity::expect_silent_cast_possible_multi(self.arena, &context.location, &sample_types, value)?;
            return Ok(id);
        }

        if let ExprKind::ArrayElementRef { object, .. } = self.arena.expr(top_target).kind {
            if let ExprKind::OutputEndpointRef(e) = self.arena.expr(object).kind {
                let sample_types = self.endpoint_sample_types(e)?;
                sanity::expect_silent_cast_possible_multi(self.arena, &context.location, &sample_types, value)?;
                return Ok(id);
            }
        }

        Err(self.err(
            Category::Lowering,
            context.location,
            "the target of a '<<' operator must be an output",
        ))
    }

    fn endpoint_sample_types(&self, e: EndpointId) -> CompileResult<Vec<Type>> {
        let endpoint = self.arena.endpoint(e);
        let mut types = Vec::new();
        for t in &endpoint.sample_types {
            types.push(self.arena.resolve_as_type(*t).ok_or_else(|| {
                self.err(
                    Category::Type,
                    self.arena.expr_location(*t),
                    "expected a type",
                )
            })?);
        }
        Ok(types)
    }

    fn full_check_stmt(&mut self, id: StmtId) -> CompileResult<StmtId> {
        let context = self.arena.stmt(id).context.clone();
        match self.arena.stmt(id).kind.clone() {
            StmtKind::Return { value } => {
                let function = self
                    .current_function
                    .expect("return statements live in functions");
                let return_type = self
                    .arena
                    .resolve_as_type(self.arena.function(function).return_type)
                    .ok_or_else(|| {
                        self.err(
                            Category::Type,
                            context.location.clone(),
                            "cannot resolve the function return type",
                        )
                    })?;

                match value {
                    Some(v) => {
                        sanity::expect_silent_cast_possible(
                            self.arena,
                            &context.location,
                            &return_type.remove_const_if_present().remove_reference_if_present(),
                            v,
                        )?;
                    }
                    None => {
                        if !return_type.is_void() {
                            return Err(self.err(
                                Category::Type,
                                context.location,
                                "a non-void function must return a value",
                            ));
                        }
                    }
                }
                Ok(id)
            }
            StmtKind::If {
                condition,
                true_branch,
                false_branch,
            } => {
                sanity::expect_silent_cast_possible(
                    self.arena,
                    &context.location,
                    &Type::bool(),
                    condition,
                )?;
                if let Some(c) = self.arena.get_as_constant(condition) {
                    if let Some(b) = c.as_bool() {
                        self.stats.num_replaced += 1;
                        return Ok(if b {
                            true_branch
                        } else if let Some(f) = false_branch {
                            f
                        } else {
                            self.arena.alloc_stmt(StmtKind::Noop, context)
                        });
                    }
                }
                Ok(id)
            }
            StmtKind::Loop {
                num_iterations, ..
            } => {
                if let Some(n) = num_iterations {
                    if let Some(c) = self.arena.get_as_constant(n) {
                        if c.as_i64().map_or(false, |v| v <= 0) {
                            return Err(self.err(
                                Category::Type,
                                self.arena.expr_location(n),
                                "the loop count cannot be negative or zero",
                            ));
                        }
                    }
                    sanity::expect_silent_cast_possible(
                        self.arena,
                        &self.arena.expr_location(n),
                        &Type::int64(),
                        n,
                    )?;
                }
                Ok(id)
            }
            _ => Ok(id),
        }
    }

    fn check_processor_instance(&mut self, i: InstanceId) -> CompileResult<()> {
        let (mult, div) = {
            let instance = self.arena.instance(i);
            (instance.clock_multiplier_ratio, instance.clock_divider_ratio)
        };
        for ratio in [mult, div].into_iter().flatten() {
            match self.arena.get_as_constant(ratio) {
                Some(v) => {
                    check_clock_ratio(&self.arena.expr_location(ratio), &v)?;
                }
                None => {
                    return Err(self.err(
                        Category::Type,
                        self.arena.expr_location(ratio),
                        "a clock ratio must be a constant",
                    ))
                }
            }
        }
        Ok(())
    }

    fn check_annotation(&mut self, annotation: &Annotation) -> CompileResult<()> {
        for p in &annotation.properties {
            match self.arena.get_as_constant(p.value) {
                Some(v) => {
                    let t = v.type_of();
                    if !(t.is_primitive_float()
                        || t.is_primitive_integer()
                        || t.is_primitive_bool()
                        || t.is_string_literal())
                    {
                        return Err(self.err(
                            Category::Type,
                            self.arena.expr_location(p.value),
                            "annotation values must be primitives or strings",
                        ));
                    }
                }
                None => {
                    return Err(self.err(
                        Category::Type,
                        self.arena.expr_location(p.value),
                        "annotation values must be compile-time constants",
                    ))
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct PossibleFunction {
    function: FunctionId,
    is_impossible: bool,
    requires_cast: bool,
    requires_generic: bool,
}

impl PossibleFunction {
    fn is_exact_match(&self) -> bool {
        !(self.is_impossible || self.requires_cast || self.requires_generic)
    }
}

/// Validates a clock multiplier/divider ratio constant.
pub fn check_clock_ratio(location: &Location, v: &Value) -> CompileResult<i64> {
    if !v.type_of().is_primitive_integer() {
        return Err(Diagnostic::new(
            Category::Type,
            location.clone(),
            "a clock ratio must be an integer",
        ));
    }
    let ratio = v.as_i64().unwrap();
    if !(1..=512).contains(&ratio) {
        return Err(Diagnostic::new(
            Category::Type,
            location.clone(),
            "a clock ratio must be between 1 and 512",
        ));
    }
    Ok(ratio)
}

/// Edit distance used for the nearest-spelt-function suggestion.
fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

fn mangle_argument_types(arg_types: &[Type]) -> String {
    let mut id = String::new();
    for t in arg_types {
        let description = t.description();
        for c in description.chars() {
            if c.is_ascii_alphanumeric() {
                id.push(c);
            } else if !id.ends_with('_') {
                id.push('_');
            }
        }
        if !id.ends_with('_') {
            id.push('_');
        }
    }
    id.trim_end_matches('_').to_string()
}

// ── Use counting ─────────────────────────────────────────────────────────

/// Recomputes every variable's read/write counts for one module.
/// Assignment targets are writes; pre/post inc-dec is a read and a write;
/// arguments to unresolved callees are conservatively assumed written.
pub fn rebuild_variable_use_counts(arena: &mut Arena, module: ModuleId) {
    reset_use_counts(arena, module);
    let mut counter = UseCounter {
        is_writing: false,
    };

    let m_vars = arena.module(module).state_variables.clone();
    for v in m_vars {
        if let Some(init) = arena.var(v).initial_value {
            counter.count_expr(arena, init);
        }
    }

    for f in arena.module(module).functions.clone() {
        if arena.function(f).is_generic() {
            continue;
        }
        if let Some(body) = arena.function(f).body {
            counter.count_stmt(arena, body);
        }
    }
}

fn reset_use_counts(arena: &mut Arena, module: ModuleId) {
    let mut vars: Vec<VarId> = arena.module(module).state_variables.clone();
    for f in arena.module(module).functions.clone() {
        vars.extend(arena.function(f).parameters.clone());
        if let Some(body) = arena.function(f).body {
            collect_local_vars(arena, body, &mut vars);
        }
    }
    for v in vars {
        let var = arena.var_mut(v);
        var.num_reads = 0;
        var.num_writes = 0;
    }
}

fn collect_local_vars(arena: &Arena, stmt: StmtId, out: &mut Vec<VarId>) {
    match &arena.stmt(stmt).kind {
        StmtKind::Block(b) => {
            for s in &arena.block(*b).statements {
                collect_local_vars(arena, *s, out);
            }
        }
        StmtKind::VarDecl(v) => out.push(*v),
        StmtKind::If {
            true_branch,
            false_branch,
            ..
        } => {
            collect_local_vars(arena, *true_branch, out);
            if let Some(f) = false_branch {
                collect_local_vars(arena, *f, out);
            }
        }
        StmtKind::Loop { body, .. } => collect_local_vars(arena, *body, out),
        _ => {}
    }
}

struct UseCounter {
    is_writing: bool,
}

impl UseCounter {
    fn count_stmt(&mut self, arena: &mut Arena, stmt: StmtId) {
        match arena.stmt(stmt).kind.clone() {
            StmtKind::Block(b) => {
                for s in arena.block(b).statements.clone() {
                    self.count_stmt(arena, s);
                }
            }
            StmtKind::If {
                condition,
                true_branch,
                false_branch,
            } => {
                self.count_expr(arena, condition);
                self.count_stmt(arena, true_branch);
                if let Some(f) = false_branch {
                    self.count_stmt(arena, f);
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
                    self.count_expr(arena, e);
                }
                self.count_stmt(arena, body);
            }
            StmtKind::Return { value } => {
                if let Some(v) = value {
                    self.count_expr(arena, v);
                }
            }
            StmtKind::Expression(e) => self.count_expr(arena, e),
            StmtKind::VarDecl(v) => {
                if let Some(init) = arena.var(v).initial_value {
                    self.count_expr(arena, init);
                }
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Noop => {}
        }
    }

    fn count_expr(&mut self, arena: &mut Arena, e: ExprId) {
        match arena.expr(e).kind.clone() {
            ExprKind::VariableRef(v) => {
                let var = arena.var_mut(v);
                if self.is_writing {
                    var.num_writes += 1;
                } else {
                    var.num_reads += 1;
                }
            }
            ExprKind::Assignment { target, value } => {
                let old = self.is_writing;
                self.is_writing = true;
                self.count_expr(arena, target);
                self.is_writing = old;
                self.count_expr(arena, value);
            }
            ExprKind::PreOrPostIncDec { target, .. } => {
                // both a read and a write
                let old = self.is_writing;
                self.is_writing = false;
                self.count_expr(arena, target);
                self.is_writing = true;
                self.count_expr(arena, target);
                self.is_writing = old;
            }
            ExprKind::CallOrCast { args, .. } => {
                // unknown callee: conservatively assume writable args
                if let Some(a) = args {
                    let old = self.is_writing;
                    self.is_writing = true;
                    self.count_expr(arena, a);
                    self.is_writing = old;
                }
            }
            ExprKind::FunctionCall { function, args } => {
                let params = arena.function(function).parameters.clone();
                let arg_exprs = arena.argument_list(args);
                for (i, arg) in arg_exprs.iter().enumerate() {
                    let writes = match params.get(i) {
                        Some(p) => {
                            if arena.var_is_resolved(*p) {
                                arena.var_type(*p).map_or(true, |t| t.is_reference())
                            } else {
                                true
                            }
                        }
                        None => true,
                    };
                    let old = self.is_writing;
                    self.is_writing = writes;
                    self.count_expr(arena, *arg);
                    self.is_writing = old;
                }
            }
            _ => {
                let mut children = Vec::new();
                arena.for_each_child(e, |c| children.push(c));
                for c in children {
                    self.count_expr(arena, c);
                }
            }
        }
    }
}
