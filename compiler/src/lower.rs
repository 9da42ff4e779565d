// lower.rs — AST → HEART generation
//
// Lowers each fully-resolved AST module into a flat HEART module. Function
// bodies become linear basic-block lists built through a FunctionBuilder:
// `if` splits into true/false blocks plus a merge, loops get head/body/
// continue/break blocks, `loop(N)` materialises a decrementing counter, and
// break/continue branch to the enclosing exit/iterator blocks. Expression
// evaluation preserves left-to-right order, with nesting capped at a
// configured depth — past the cap the sub-expression is materialised into a
// register and recursion restarts.
//
// Preconditions: module is fully resolved; post-resolution sanity passed.
// Postconditions: every generated block ends in a terminator; non-void
//   functions return on every path (after dead-block elimination).
// Failure modes: non-returning paths, writes to non-outputs, reads from
//   outputs, endpoint index range errors, delay-line range errors.
// Side effects: installs generated-variable/function back-links in the AST.

use std::collections::HashMap;

use crate::ast::{
    Arena, Connection as AstConnection, EndpointId, ExprId, ExprKind, FunctionId, InstanceId,
    ModuleId, ModuleKind, StmtId, StmtKind, VarId,
};
use crate::diag::{Category, CompileResult, Diagnostic, Location};
use crate::heart::{
    Block, Connection, EndpointDecl, Expr, Function, FunctionKey, Module, Program,
    ProcessorInstance, Statement, SubIndex, Terminator, Variable, VariableRole,
};
use crate::resolve::check_clock_ratio;
use crate::sanity;
use crate::types::{BinaryOp, Type, TypeRules, Value};

pub const DEFAULT_MAX_EXPRESSION_DEPTH: u32 = 255;

/// A call emitted before its target function was lowered; patched at the
/// end of the link.
#[derive(Debug)]
pub struct UnresolvedCall {
    pub module: usize,
    pub function: usize,
    pub block: usize,
    pub statement: usize,
    pub target: FunctionId,
}

/// Lowers one AST module into `program`. Call once per module, then
/// `patch_unresolved_calls` after the whole program is generated.
pub fn generate_module(
    arena: &mut Arena,
    source: ModuleId,
    program: &mut Program,
    unresolved: &mut Vec<UnresolvedCall>,
    max_expression_depth: u32,
) -> CompileResult<usize> {
    let name = arena.fully_qualified_module_name(source);
    let kind = arena.module(source).kind;
    let module_index = program.modules.len();
    program.modules.push(Module::new(name, kind));

    let mut generator = Generator {
        arena,
        source,
        program,
        module_index,
        unresolved,
        max_expression_depth,
        expression_depth: 0,
        loop_index: 0,
        if_index: 0,
        register_index: 0,
        current_function: None,
        current_block: None,
        current_target: None,
        break_target: None,
        continue_target: None,
        endpoint_indices: HashMap::new(),
    };

    generator.run()?;
    Ok(module_index)
}

/// Re-points every queued call at its now-generated target.
pub fn patch_unresolved_calls(
    arena: &Arena,
    program: &mut Program,
    unresolved: &[UnresolvedCall],
) -> CompileResult<()> {
    for call in unresolved {
        let (module, function) = arena
            .function(call.target)
            .generated
            .expect("internal: call target was never generated");
        let block = &mut program.modules[call.module].functions[call.function].blocks[call.block];
        if let Statement::Call {
            function: key,
            ..
        } = &mut block.statements[call.statement]
        {
            *key = FunctionKey { module, function };
        }
    }
    Ok(())
}

// ── Generator ────────────────────────────────────────────────────────────

struct Generator<'a> {
    arena: &'a mut Arena,
    source: ModuleId,
    program: &'a mut Program,
    module_index: usize,
    unresolved: &'a mut Vec<UnresolvedCall>,
    max_expression_depth: u32,
    expression_depth: u32,
    loop_index: u32,
    if_index: u32,
    register_index: u32,
    current_function: Option<usize>,
    current_block: Option<usize>,
    /// Destination variable for expression-statement lowering.
    current_target: Option<usize>,
    break_target: Option<usize>,
    continue_target: Option<usize>,
    endpoint_indices: HashMap<EndpointId, usize>,
}

impl<'a> Generator<'a> {
    fn err(&self, location: Location, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(Category::Lowering, location, message)
    }

    fn module(&self) -> &Module {
        &self.program.modules[self.module_index]
    }

    fn module_mut(&mut self) -> &mut Module {
        &mut self.program.modules[self.module_index]
    }

    fn run(&mut self) -> CompileResult<()> {
        let kind = self.arena.module(self.source).kind;

        self.generate_structs();
        self.generate_annotation();
        self.generate_endpoints()?;

        match kind {
            ModuleKind::Processor => {
                self.generate_state_variables()?;
                self.create_function_shells()?;
                self.create_init_function()?;
                self.generate_function_bodies()?;
            }
            ModuleKind::Graph => {
                self.generate_connections_and_instances()?;
            }
            ModuleKind::Namespace => {
                self.generate_external_constants()?;
                self.create_function_shells()?;
                self.generate_function_bodies()?;
            }
        }

        Ok(())
    }

    // ── Structs / annotations / endpoints ──

    fn generate_structs(&mut self) {
        for s in self.arena.module(self.source).structs.clone() {
            let structure = self.arena.struct_decl(s).structure.clone();
            self.module_mut().structs.push(structure);
        }
    }

    fn generate_annotation(&mut self) {
        let annotation = self.plain_annotation_of(&self.arena.module(self.source).annotation.clone());
        self.module_mut().annotation = annotation;
    }

    fn plain_annotation_of(&self, a: &crate::ast::Annotation) -> Vec<(String, Value)> {
        a.properties
            .iter()
            .filter_map(|p| {
                self.arena
                    .get_as_constant(p.value)
                    .map(|v| (p.key.clone(), v))
            })
            .collect()
    }

    fn generate_endpoints(&mut self) -> CompileResult<()> {
        for (is_input, list) in [
            (true, self.arena.module(self.source).inputs.clone()),
            (false, self.arena.module(self.source).outputs.clone()),
        ] {
            for e in list {
                let endpoint = self.arena.endpoint(e);
                let name = self.arena.name(endpoint.name).to_string();
                let kind = endpoint.kind;
                let annotation = self.plain_annotation_of(&endpoint.annotation.clone());

                let mut sample_types = Vec::new();
                for t in self.arena.endpoint(e).sample_types.clone() {
                    sample_types.push(self.arena.resolve_as_type(t).expect("resolved endpoint type"));
                }

                let array_size = match self.arena.endpoint(e).array_size {
                    Some(size_expr) => Some(self.get_endpoint_array_size(size_expr)?),
                    None => None,
                };

                let index = if is_input {
                    self.module().inputs.len() as u32
                } else {
                    self.module().outputs.len() as u32
                };
                let decl = EndpointDecl {
                    name,
                    index,
                    kind,
                    sample_types,
                    array_size,
                    annotation,
                };
                if is_input {
                    self.module_mut().inputs.push(decl);
                } else {
                    self.module_mut().outputs.push(decl);
                }
                self.endpoint_indices.insert(e, index as usize);
            }
        }
        Ok(())
    }

    fn get_endpoint_array_size(&self, size_expr: ExprId) -> CompileResult<u32> {
        let location = self.arena.expr_location(size_expr);
        let c = self
            .arena
            .get_as_constant(size_expr)
            .ok_or_else(|| self.err(location.clone(), "expected a constant"))?;
        if !c.type_of().is_primitive_integer() {
            return Err(self.err(location, "expected an integer"));
        }
        let value = c.as_i64().unwrap();
        if value < 1 || value > crate::ast::MAX_ENDPOINT_ARRAY_SIZE {
            return Err(self.err(location, "illegal array size"));
        }
        Ok(value as u32)
    }

    // ── Graph members ──

    fn generate_connections_and_instances(&mut self) -> CompileResult<()> {
        for c in self.arena.module(self.source).connections.clone() {
            self.generate_connection(c)?;
        }
        Ok(())
    }

    fn generate_connection(&mut self, c: crate::ast::ConnectionId) -> CompileResult<()> {
        let (source, dest, interpolation, delay) = {
            let connection: &AstConnection = self.arena.connection(c);
            (
                connection.source.clone(),
                connection.dest.clone(),
                connection.interpolation,
                connection.delay_length,
            )
        };

        let delay_length = match delay {
            Some(d) => {
                let location = self.arena.expr_location(d);
                match self.arena.get_as_constant(d) {
                    Some(v) => sanity::check_delay_line_length(&location, &v)?,
                    None => {
                        return Err(self.err(location, "a delay line length must be a constant"))
                    }
                }
            }
            None => 0,
        };

        let source_processor = self.instance_name_of(source.processor_name)?;
        let dest_processor = self.instance_name_of(dest.processor_name)?;

        for name in [&source_processor, &dest_processor].into_iter().flatten() {
            self.get_or_add_processor_instance(name.clone())?;
        }

        let connection = Connection {
            source_processor,
            source_channel: self.arena.name(source.channel).to_string(),
            dest_processor,
            dest_channel: self.arena.name(dest.channel).to_string(),
            interpolation,
            delay_length,
        };
        self.module_mut().connections.push(connection);
        Ok(())
    }

    fn instance_name_of(&self, name_expr: Option<ExprId>) -> CompileResult<Option<String>> {
        match name_expr {
            None => Ok(None),
            Some(e) => match &self.arena.expr(e).kind {
                ExprKind::QualifiedIdentifier(p) => {
                    Ok(Some(self.arena.name(p.first()).to_string()))
                }
                _ => Err(self.err(
                    self.arena.expr_location(e),
                    "expected a processor or endpoint name",
                )),
            },
        }
    }

    fn get_or_add_processor_instance(&mut self, name: String) -> CompileResult<()> {
        if self
            .module()
            .processor_instances
            .iter()
            .any(|i| i.instance_name == name)
        {
            return Ok(());
        }

        let instances: Vec<InstanceId> = self.arena.module(self.source).instances.clone();
        for i in instances {
            let matches = {
                let instance = self.arena.instance(i);
                match &self.arena.expr(instance.instance_name).kind {
                    ExprKind::QualifiedIdentifier(p) => self.arena.name(p.first()) == name,
                    _ => false,
                }
            };
            if !matches {
                continue;
            }

            let (target, array_size_expr, mult, div, location) = {
                let instance = self.arena.instance(i);
                (
                    instance.resolved_target,
                    instance.array_size,
                    instance.clock_multiplier_ratio,
                    instance.clock_divider_ratio,
                    instance.context.location.clone(),
                )
            };

            let target = target
                .ok_or_else(|| self.err(location.clone(), "internal: unresolved processor instance"))?;
            let source_name = self.arena.fully_qualified_module_name(target);

            let array_size = match array_size_expr {
                Some(size) => self.get_processor_array_size(size)?,
                None => 1,
            };

            let clock_multiplier = self.get_clock_ratio(mult)?;
            let clock_divider = self.get_clock_ratio(div)?;

            self.module_mut().processor_instances.push(ProcessorInstance {
                instance_name: name,
                source_name,
                array_size,
                clock_multiplier,
                clock_divider,
            });
            return Ok(());
        }

        // connections to the graph's own endpoints land here
        Ok(())
    }

    fn get_processor_array_size(&self, size_expr: ExprId) -> CompileResult<u32> {
        let location = self.arena.expr_location(size_expr);
        let c = self
            .arena
            .get_as_constant(size_expr)
            .ok_or_else(|| self.err(location.clone(), "expected a constant"))?;
        if !c.type_of().is_primitive_integer() {
            return Err(self.err(location, "expected an integer"));
        }
        let value = c.as_i64().unwrap();
        if value < 1 || value > crate::ast::MAX_PROCESSOR_ARRAY_SIZE {
            return Err(self.err(location, "illegal array size"));
        }
        Ok(value as u32)
    }

    fn get_clock_ratio(&self, ratio: Option<ExprId>) -> CompileResult<Option<i64>> {
        match ratio {
            None => Ok(None),
            Some(r) => {
                let location = self.arena.expr_location(r);
                match self.arena.get_as_constant(r) {
                    Some(v) => Ok(Some(check_clock_ratio(&location, &v)?)),
                    None => Err(self.err(location, "a clock ratio must be an integer constant")),
                }
            }
        }
    }

    // ── State variables ──

    fn generate_state_variables(&mut self) -> CompileResult<()> {
        for v in self.arena.module(self.source).state_variables.clone() {
            self.generate_state_variable(v)?;
        }
        Ok(())
    }

    fn generate_external_constants(&mut self) -> CompileResult<()> {
        for v in self.arena.module(self.source).state_variables.clone() {
            if self.arena.var(v).is_external {
                self.generate_state_variable(v)?;
            }
        }
        Ok(())
    }

    fn generate_state_variable(&mut self, v: VarId) -> CompileResult<()> {
        let is_external = self.arena.var(v).is_external;
        let t = self
            .arena
            .var_type(v)
            .ok_or_else(|| self.err(self.arena.var(v).context.location.clone(), "expected a type"))?;

        if is_external {
            self.create_variable_for(v, VariableRole::External)?;
            return Ok(());
        }

        // Constant or unwritten primitive variables fold at every use site
        // and never reach the state.
        let num_writes = self.arena.var(v).num_writes;
        if t.is_const() || (num_writes == 0 && (t.is_primitive() || t.is_bounded_int())) {
            return Ok(());
        }

        self.create_variable_for(v, VariableRole::State)?;
        Ok(())
    }

    fn create_variable_for(&mut self, v: VarId, role: VariableRole) -> CompileResult<usize> {
        let mut t = self
            .arena
            .var_type(v)
            .ok_or_else(|| self.err(self.arena.var(v).context.location.clone(), "expected a type"))?;
        // locals hold copies; only parameters keep reference types
        if role == VariableRole::MutableLocal {
            t = t.remove_reference_if_present();
        }
        let name = self.arena.name(self.arena.var(v).name).to_string();
        let annotation = self.plain_annotation_of(&self.arena.var(v).annotation.clone());
        let index = self.module_mut().add_variable(Variable {
            name: Some(name),
            ty: t,
            role,
            annotation,
        });
        self.arena.var_mut(v).generated = Some(index as u32);
        Ok(index)
    }

    // ── Functions ──

    fn create_function_shells(&mut self) -> CompileResult<()> {
        for f in self.arena.module(self.source).functions.clone() {
            if self.arena.function(f).is_generic() {
                continue;
            }
            let name = self.function_name_for(f);
            let return_type = self
                .arena
                .resolve_as_type(self.arena.function(f).return_type)
                .ok_or_else(|| {
                    self.err(
                        self.arena.function(f).context.location.clone(),
                        "cannot resolve the function return type",
                    )
                })?;

            let mut function = Function::new(name, return_type);
            function.is_run_function = sanity::is_run_function(self.arena, f);
            function.is_event_function = self.arena.function(f).is_event_function;
            function.intrinsic = self.arena.function(f).intrinsic;
            function.annotation = self.plain_annotation_of(&self.arena.function(f).annotation.clone());

            let index = self.module().functions.len();
            self.module_mut().functions.push(function);
            self.arena.function_mut(f).generated = Some((self.module_index, index));
        }
        Ok(())
    }

    fn function_name_for(&self, f: FunctionId) -> String {
        let function = self.arena.function(f);
        let root = self.arena.name(function.name).to_string();

        if function.is_event_function {
            let param_type = function
                .parameters
                .first()
                .and_then(|p| self.arena.var_type(*p))
                .map(|t| t.description())
                .unwrap_or_default();
            let mangled: String = param_type
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            return format!("_{root}_event_{mangled}");
        }

        // overloads get uniquifying suffixes
        let mut name = root.clone();
        let mut n = 2;
        while self.module().find_function(&name).is_some() {
            name = format!("{root}_{n}");
            n += 1;
        }
        name
    }

    fn create_init_function(&mut self) -> CompileResult<()> {
        let mut function = Function::new("_init".into(), Type::void());
        function.is_init_function = true;
        let index = self.module().functions.len();
        self.module_mut().functions.push(function);

        self.begin_function(index);
        let entry = self.create_block("@block_");
        self.begin_block(entry);

        for v in self.arena.module(self.source).state_variables.clone() {
            let generated = self.arena.var(v).generated;
            let is_external = self.arena.var(v).is_external;
            if let Some(g) = generated {
                if let Some(init) = self.arena.var(v).initial_value {
                    self.visit_with_destination(Some(g as usize), init)?;
                } else if !is_external {
                    self.add_zero_assignment(Expr::Variable(g as usize));
                }
            }
        }

        self.end_function();
        Ok(())
    }

    fn generate_function_bodies(&mut self) -> CompileResult<()> {
        for f in self.arena.module(self.source).functions.clone() {
            if self.arena.function(f).is_generic() {
                continue;
            }
            self.generate_function(f)?;
        }
        Ok(())
    }

    fn generate_function(&mut self, f: FunctionId) -> CompileResult<()> {
        let (_, index) = self.arena.function(f).generated.expect("shell exists");
        self.begin_function(index);
        self.loop_index = 0;
        self.if_index = 0;
        self.register_index = 0;

        let is_event = self.arena.function(f).is_event_function;
        for p in self.arena.function(f).parameters.clone() {
            let var_index = self.create_variable_for(p, VariableRole::Parameter)?;
            let t = self.module().variables[var_index].ty.clone();
            if is_event && t.is_non_const_reference() {
                return Err(self.err(
                    self.arena.var(p).context.location.clone(),
                    "event parameters cannot be non-const references",
                ));
            }
            self.program.modules[self.module_index].functions[index]
                .parameters
                .push(var_index);
        }

        let body = self.arena.function(f).body;
        match body {
            Some(body) => {
                self.visit_stmt(body)?;
                self.end_function();

                if !self.all_blocks_terminated(index) {
                    // unreachable blocks may be the only offenders
                    self.remove_unreachable_blocks(index);
                    if !self.all_blocks_terminated(index) {
                        let function = self.arena.function(f);
                        return Err(self.err(
                            function.context.location.clone(),
                            format!(
                                "not all control paths in '{}' return a value",
                                self.arena.name(function.name)
                            ),
                        ));
                    }
                }
            }
            None => {
                self.program.modules[self.module_index].functions[index].has_no_body = true;
                self.end_function();
            }
        }

        self.current_function = None;
        self.current_block = None;
        Ok(())
    }

    // ── Function builder ──

    fn begin_function(&mut self, index: usize) {
        self.current_function = Some(index);
        self.current_block = None;
    }

    fn end_function(&mut self) {
        // a void function may fall off the end
        if let (Some(f), Some(b)) = (self.current_function, self.current_block) {
            let function = &mut self.program.modules[self.module_index].functions[f];
            if function.return_type.is_void() && !function.blocks[b].is_terminated() {
                function.blocks[b].terminator = Some(Terminator::Return(None));
            }
        }
    }

    fn create_block(&mut self, prefix: &str) -> usize {
        let f = self.current_function.expect("inside a function");
        let function = &mut self.program.modules[self.module_index].functions[f];
        let index = function.blocks.len();
        let label = if prefix == "@block_" {
            format!("@block_{index}")
        } else {
            format!("{prefix}{index}")
        };
        function.blocks.push(Block::new(label));
        index
    }

    fn create_named_block(&mut self, prefix: &str, label: u32) -> usize {
        let f = self.current_function.expect("inside a function");
        let function = &mut self.program.modules[self.module_index].functions[f];
        let index = function.blocks.len();
        function.blocks.push(Block::new(format!("{prefix}{label}")));
        index
    }

    /// Makes `block` current, branching any unterminated predecessor into it.
    fn begin_block(&mut self, block: usize) {
        if let Some(current) = self.current_block {
            let f = self.current_function.expect("inside a function");
            let function = &mut self.program.modules[self.module_index].functions[f];
            if !function.blocks[current].is_terminated() {
                function.blocks[current].terminator = Some(Terminator::Branch(block));
            }
        }
        self.current_block = Some(block);
    }

    /// Starts a fresh block when the current one is already terminated
    /// (unreachable code after return/break still needs somewhere to go).
    fn ensure_block_is_ready(&mut self) {
        let needs_new = match self.current_block {
            None => true,
            Some(b) => {
                let f = self.current_function.expect("inside a function");
                self.program.modules[self.module_index].functions[f].blocks[b].is_terminated()
            }
        };
        if needs_new {
            let b = self.create_block("@block_");
            self.current_block = Some(b);
        }
    }

    fn add_statement(&mut self, s: Statement) {
        self.ensure_block_is_ready();
        let f = self.current_function.expect("inside a function");
        let b = self.current_block.expect("inside a block");
        self.program.modules[self.module_index].functions[f].blocks[b]
            .statements
            .push(s);
    }

    fn terminate(&mut self, t: Terminator) {
        self.ensure_block_is_ready();
        let f = self.current_function.expect("inside a function");
        let b = self.current_block.expect("inside a block");
        self.program.modules[self.module_index].functions[f].blocks[b].terminator = Some(t);
    }

    fn add_branch(&mut self, target: usize, subsequent: usize) {
        self.terminate(Terminator::Branch(target));
        self.current_block = Some(subsequent);
    }

    fn add_branch_if(&mut self, condition: Expr, t: usize, f: usize, subsequent: usize) {
        self.terminate(Terminator::BranchIf {
            condition,
            true_block: t,
            false_block: f,
        });
        self.current_block = Some(subsequent);
    }

    fn add_return(&mut self, value: Option<Expr>) {
        self.terminate(Terminator::Return(value));
    }

    fn create_register_variable(&mut self, t: Type) -> usize {
        self.register_index += 1;
        self.module_mut().add_variable(Variable {
            name: None,
            ty: t,
            role: VariableRole::Register,
            annotation: Vec::new(),
        })
    }

    fn create_mutable_local(&mut self, t: Type, name: Option<String>) -> usize {
        self.module_mut().add_variable(Variable {
            name,
            ty: t,
            role: VariableRole::MutableLocal,
            annotation: Vec::new(),
        })
    }

    fn add_assignment(&mut self, target: Expr, value: Expr) {
        self.add_statement(Statement::Assign { target, value });
    }

    fn add_zero_assignment(&mut self, target: Expr) {
        let t = target.ty(self.module()).remove_reference_if_present().remove_const_if_present();
        self.add_assignment(target, Expr::Constant(Value::zero_initialiser(&t)));
    }

    fn create_cast_if_needed(&mut self, e: Expr, target: &Type) -> Expr {
        let current = e.ty(self.module());
        if current.is_same_ignoring_modifiers(target) {
            return e;
        }
        if let Some(c) = e.as_constant() {
            if let Some(cast) = c.try_cast_to(target) {
                return Expr::Constant(cast);
            }
        }
        Expr::Cast {
            target: target.remove_reference_if_present().remove_const_if_present(),
            source: Box::new(e),
        }
    }

    // ── Termination / reachability ──

    fn all_blocks_terminated(&self, function: usize) -> bool {
        self.program.modules[self.module_index].functions[function]
            .blocks
            .iter()
            .all(Block::is_terminated)
    }

    /// Simple dead-block elimination: drops blocks unreachable from entry
    /// and remaps branch targets.
    fn remove_unreachable_blocks(&mut self, function: usize) {
        let f = &self.program.modules[self.module_index].functions[function];
        if f.blocks.is_empty() {
            return;
        }

        let mut reachable = vec![false; f.blocks.len()];
        let mut pending = vec![0usize];
        while let Some(b) = pending.pop() {
            if reachable[b] {
                continue;
            }
            reachable[b] = true;
            match &f.blocks[b].terminator {
                Some(Terminator::Branch(t)) => pending.push(*t),
                Some(Terminator::BranchIf {
                    true_block,
                    false_block,
                    ..
                }) => {
                    pending.push(*true_block);
                    pending.push(*false_block);
                }
                _ => {}
            }
        }

        let mut remap = vec![usize::MAX; reachable.len()];
        let mut next = 0;
        for (i, r) in reachable.iter().enumerate() {
            if *r {
                remap[i] = next;
                next += 1;
            }
        }

        let f = &mut self.program.modules[self.module_index].functions[function];
        let old_blocks = std::mem::take(&mut f.blocks);
        for (i, mut block) in old_blocks.into_iter().enumerate() {
            if !reachable[i] {
                continue;
            }
            block.terminator = block.terminator.map(|t| match t {
                Terminator::Branch(b) => Terminator::Branch(remap[b]),
                Terminator::BranchIf {
                    condition,
                    true_block,
                    false_block,
                } => Terminator::BranchIf {
                    condition,
                    true_block: remap[true_block],
                    false_block: remap[false_block],
                },
                other => other,
            });
            f.blocks.push(block);
        }
    }

    // ── Statement lowering ──

    fn visit_stmt(&mut self, s: StmtId) -> CompileResult<()> {
        match self.arena.stmt(s).kind.clone() {
            StmtKind::Block(b) => {
                let is_function_main = self.arena.block(b).function.is_some();
                if is_function_main {
                    let entry = self.create_block("@block_");
                    self.begin_block(entry);
                }
                for stmt in self.arena.block(b).statements.clone() {
                    self.ensure_block_is_ready();
                    self.expression_depth = 0;
                    self.visit_as_statement(stmt)?;
                }
                Ok(())
            }
            StmtKind::If {
                condition,
                true_branch,
                false_branch,
            } => self.visit_if(condition, true_branch, false_branch),
            StmtKind::Loop {
                condition,
                num_iterations,
                iterator,
                body,
                is_do_loop,
            } => self.visit_loop(condition, num_iterations, iterator, body, is_do_loop),
            StmtKind::Return { value } => {
                match value {
                    Some(v) => {
                        let return_type = {
                            let f = self.current_function.expect("inside a function");
                            self.program.modules[self.module_index].functions[f]
                                .return_type
                                .clone()
                        };
                        let e = self.evaluate_with_target_type(v, &return_type)?;
                        self.add_return(Some(e));
                    }
                    None => self.add_return(None),
                }
                Ok(())
            }
            StmtKind::Break => {
                let target = self.break_target.expect("break inside a loop");
                let next = self.create_block("@block_");
                self.add_branch(target, next);
                Ok(())
            }
            StmtKind::Continue => {
                let target = self.continue_target.expect("continue inside a loop");
                let next = self.create_block("@block_");
                self.add_branch(target, next);
                Ok(())
            }
            StmtKind::Noop => Ok(()),
            StmtKind::Expression(e) => self.visit_with_destination(None, e),
            StmtKind::VarDecl(v) => self.visit_local_variable(v),
        }
    }

    fn visit_as_statement(&mut self, s: StmtId) -> CompileResult<()> {
        let old_target = self.current_target;
        let old_depth = self.expression_depth;
        self.current_target = None;
        self.expression_depth = 0;
        self.visit_stmt(s)?;
        self.current_target = old_target;
        self.expression_depth = old_depth;
        Ok(())
    }

    fn visit_local_variable(&mut self, v: VarId) -> CompileResult<()> {
        let index = self.create_variable_for(v, VariableRole::MutableLocal)?;
        match self.arena.var(v).initial_value {
            Some(init) => self.visit_with_destination(Some(index), init),
            None => {
                self.add_zero_assignment(Expr::Variable(index));
                Ok(())
            }
        }
    }

    fn visit_if(
        &mut self,
        condition: ExprId,
        true_branch: StmtId,
        false_branch: Option<StmtId>,
    ) -> CompileResult<()> {
        let label = self.if_index;
        self.if_index += 1;

        let true_block = self.create_named_block("@if_", label);
        let false_block = self.create_named_block("@ifnot_", label);

        let cond = self.evaluate_with_target_type(condition, &Type::bool())?;
        self.add_branch_if(cond, true_block, false_block, true_block);

        self.visit_as_statement(true_branch)?;

        if let Some(false_branch) = false_branch {
            let end_block = self.create_named_block("@ifend_", label);
            self.add_branch(end_block, false_block);
            self.visit_as_statement(false_branch)?;
            self.begin_block(end_block);
        } else {
            self.begin_block(false_block);
        }
        Ok(())
    }

    fn visit_loop(
        &mut self,
        condition: Option<ExprId>,
        num_iterations: Option<ExprId>,
        iterator: Option<ExprId>,
        body: StmtId,
        is_do_loop: bool,
    ) -> CompileResult<()> {
        let label = self.loop_index;
        self.loop_index += 1;

        let old_break = self.break_target;
        let old_continue = self.continue_target;

        let break_block = self.create_named_block("@break_", label);
        let continue_block = self.create_named_block("@cont_", label);
        self.break_target = Some(break_block);
        self.continue_target = Some(continue_block);

        if is_do_loop {
            let condition = condition.expect("do loops have a condition");
            self.begin_block(continue_block);
            self.visit_as_statement(body)?;
            let cond = self.evaluate_with_target_type(condition, &Type::bool())?;
            self.add_branch_if(cond, continue_block, break_block, break_block);
        } else {
            let start_block = self.create_named_block("@loop_", label);
            let body_block = self.create_named_block("@body_", label);

            if let Some(n) = num_iterations {
                let mut index_type = self
                    .arena
                    .result_type(n)
                    .ok_or_else(|| self.err(self.arena.expr_location(n), "expected a value"))?;

                if !index_type.is_primitive_integer() {
                    return Err(self.err(self.arena.expr_location(n), "expected an integer"));
                }

                // a constant count that fits in 32 bits gets a narrow counter
                if index_type.is_identical(&Type::int64()) {
                    if let Some(c) = self.arena.get_as_constant(n) {
                        if c.as_i64().map_or(false, |v| v <= 0x7fff_ffff) {
                            index_type = Type::int32();
                        }
                    }
                }

                let counter =
                    self.create_mutable_local(index_type.clone(), Some(format!("$counter_{label}")));
                let count = self.evaluate_as_expression(n)?;
                let count = self.create_cast_if_needed(count, &index_type);
                self.add_assignment(Expr::Variable(counter), count);

                self.begin_block(start_block);
                let in_range = Expr::Binary {
                    op: BinaryOp::GreaterThan,
                    result_type: index_type.clone(),
                    lhs: Box::new(Expr::Variable(counter)),
                    rhs: Box::new(Expr::Constant(Value::zero_initialiser(&index_type))),
                };
                self.add_branch_if(in_range, body_block, break_block, body_block);
                self.visit_as_statement(body)?;
                self.begin_block(continue_block);
                let decremented = Expr::Binary {
                    op: BinaryOp::Subtract,
                    result_type: index_type.clone(),
                    lhs: Box::new(Expr::Variable(counter)),
                    rhs: Box::new(Expr::Constant(
                        Value::Int32(1).cast_to_expecting_success(&index_type),
                    )),
                };
                self.add_assignment(Expr::Variable(counter), decremented);
            } else {
                self.begin_block(start_block);
                match condition {
                    None => {
                        self.add_branch(body_block, body_block);
                    }
                    Some(c) => {
                        if let Some(v) = self.arena.get_as_constant(c) {
                            let target = if v.as_bool() == Some(true) {
                                body_block
                            } else {
                                break_block
                            };
                            self.add_branch(target, body_block);
                        } else {
                            let cond = self.evaluate_with_target_type(c, &Type::bool())?;
                            self.add_branch_if(cond, body_block, break_block, body_block);
                        }
                    }
                }
                self.visit_as_statement(body)?;
                self.begin_block(continue_block);
                if let Some(it) = iterator {
                    self.visit_with_destination(None, it)?;
                }
            }
            self.add_branch(start_block, break_block);
        }

        if is_do_loop {
            self.current_block = Some(break_block);
        }

        self.break_target = old_break;
        self.continue_target = old_continue;
        Ok(())
    }

    // ── Expression lowering ──

    /// Lowers `e` in statement context, assigning into `destination` when
    /// one is given.
    fn visit_with_destination(
        &mut self,
        destination: Option<usize>,
        e: ExprId,
    ) -> CompileResult<()> {
        let old_target = self.current_target;
        let old_depth = self.expression_depth;
        self.current_target = destination;
        self.expression_depth = 0;
        let result = self.visit_expr(e);
        self.current_target = old_target;
        self.expression_depth = old_depth;
        result
    }

    fn visit_expr(&mut self, e: ExprId) -> CompileResult<()> {
        let location = self.arena.expr_location(e);
        match self.arena.expr(e).kind.clone() {
            ExprKind::Constant(v) => {
                if let Some(target) = self.current_target {
                    let t = self.module().variables[target].ty.clone();
                    let value = v.try_cast_to(&t.remove_const_if_present()).ok_or_else(|| {
                        self.err(location, format!("cannot cast this value to '{t}'"))
                    })?;
                    self.add_assignment(Expr::Variable(target), Expr::Constant(value));
                }
                Ok(())
            }
            ExprKind::VariableRef(v) => {
                let value = self.variable_ref_expr(v, &location)?;
                self.add_cast_or_assignment(value);
                Ok(())
            }
            ExprKind::FunctionCall { .. } => self.visit_function_call(e),
            ExprKind::TypeCast { target, source } => {
                let args = match &self.arena.expr(source).kind {
                    ExprKind::CommaSeparatedList(items) => items.len(),
                    _ => 1,
                };
                if args > 1 {
                    if let Some(t) = self.current_target {
                        if self.module().variables[t].is_mutable() {
                            let items = match self.arena.expr(source).kind.clone() {
                                ExprKind::CommaSeparatedList(items) => items,
                                _ => unreachable!(),
                            };
                            return self.initialise_aggregate_elements(
                                Expr::Variable(t),
                                &items,
                                &location,
                            );
                        }
                    }
                }
                let _ = target;
                self.create_assignment_to_current_target(e)
            }
            ExprKind::Unary { .. } | ExprKind::Binary { .. } => {
                self.create_assignment_to_current_target(e)
            }
            ExprKind::Ternary {
                condition,
                true_branch,
                false_branch,
            } => self.visit_ternary(e, condition, true_branch, false_branch),
            ExprKind::Assignment { target, value } => {
                let dest = self.get_as_reference(target, false)?;
                self.create_assignment(dest, value)
            }
            ExprKind::ArrayElementRef { .. } => self.visit_array_element(e),
            ExprKind::StructMemberRef { object, member_index, .. } => {
                let source = self.evaluate_as_expression(object)?;
                let sub = Expr::SubElement {
                    parent: Box::new(source),
                    index: SubIndex::Fixed(member_index as u64),
                    suppress_wrap_warning: false,
                };
                self.add_cast_or_assignment(sub);
                Ok(())
            }
            ExprKind::PreOrPostIncDec {
                target,
                is_increment,
                is_post,
            } => self.visit_inc_dec(target, is_increment, is_post),
            ExprKind::AdvanceClock => {
                self.add_statement(Statement::AdvanceClock);
                Ok(())
            }
            ExprKind::WriteToEndpoint { .. } => self.visit_write_to_endpoint(e),
            ExprKind::OutputEndpointRef(_) => {
                Err(self.err(location, "cannot read from an output"))
            }
            ExprKind::InputEndpointRef(endpoint) => {
                match self.current_target {
                    Some(target) => {
                        let input = *self
                            .endpoint_indices
                            .get(&endpoint)
                            .expect("endpoint generated");
                        self.add_statement(Statement::ReadStream {
                            target: Expr::Variable(target),
                            input,
                        });
                        Ok(())
                    }
                    None => Err(self.err(location, "this expression has no effect")),
                }
            }
            ExprKind::ProcessorProperty(_) => self.create_assignment_to_current_target(e),
            ExprKind::StaticAssertion { .. } => Ok(()),
            _ => Err(self.err(location, "internal: unresolved node reached lowering")),
        }
    }

    fn add_cast_or_assignment(&mut self, value: Expr) {
        if let Some(target) = self.current_target {
            let t = self.module().variables[target].ty.clone();
            let cast = self.create_cast_if_needed(value, &t);
            self.add_assignment(Expr::Variable(target), cast);
        }
    }

    fn create_assignment_to_current_target(&mut self, source: ExprId) -> CompileResult<()> {
        match self.current_target {
            Some(target) => {
                let t = self.module().variables[target].ty.clone();
                let value = self.evaluate_with_target_type(source, &t)?;
                self.add_assignment(Expr::Variable(target), value);
                Ok(())
            }
            None => {
                if !self.arena.is_output_endpoint(source) {
                    return Err(self.err(
                        self.arena.expr_location(source),
                        "this expression has no effect",
                    ));
                }
                Ok(())
            }
        }
    }

    fn create_assignment(&mut self, dest: Expr, source: ExprId) -> CompileResult<()> {
        let t = dest.ty(self.module());
        let value = self.evaluate_with_target_type(source, &t)?;
        self.add_assignment(dest, value);
        Ok(())
    }

    fn variable_ref_expr(&mut self, v: VarId, location: &Location) -> CompileResult<Expr> {
        let owner = self.arena.enclosing_module(self.arena.var(v).context.scope);
        let is_local = owner == Some(self.source) || owner.is_none();

        if let Some(g) = self.arena.var(v).generated {
            if is_local {
                return Ok(Expr::Variable(g as usize));
            }
            // heart variables are module-local; the only cross-module
            // references that survive folding are mutable state
            return Err(self.err(
                location.clone(),
                "cannot reference a variable belonging to another processor",
            ));
        }

        if !is_local {
            let is_foldable = self.arena.var_type(v).map_or(false, |t| t.is_const())
                || self.arena.var(v).num_writes == 0;
            if !is_foldable && self.arena.module(owner.unwrap()).is_processor() {
                return Err(self.err(
                    location.clone(),
                    "cannot reference a mutable variable belonging to another processor",
                ));
            }
        }

        // folded constants: use the initial value, or zero
        if let Some(init) = self.arena.var(v).initial_value {
            return self.evaluate_as_expression(init);
        }

        let t = self
            .arena
            .var_type(v)
            .ok_or_else(|| self.err(location.clone(), "expected a type"))?;
        Ok(Expr::Constant(Value::zero_initialiser(&t)))
    }

    /// Value-context evaluation with the expression-depth cap: past the cap
    /// the sub-expression lands in a fresh register and recursion restarts.
    fn evaluate_as_expression(&mut self, e: ExprId) -> CompileResult<Expr> {
        self.expression_depth += 1;
        if self.expression_depth >= self.max_expression_depth {
            return self.expression_as_register_copy(e);
        }

        let location = self.arena.expr_location(e);
        match self.arena.expr(e).kind.clone() {
            ExprKind::Constant(v) => Ok(Expr::Constant(v)),
            ExprKind::VariableRef(v) => self.variable_ref_expr(v, &location),
            ExprKind::StructMemberRef {
                object,
                member_index,
                ..
            } => {
                let source = self.evaluate_as_expression(object)?;
                Ok(Expr::SubElement {
                    parent: Box::new(source),
                    index: SubIndex::Fixed(member_index as u64),
                    suppress_wrap_warning: false,
                })
            }
            ExprKind::ArrayElementRef { .. } => self.array_element_expr(e),
            ExprKind::TypeCast { target, source } => {
                let args = match &self.arena.expr(source).kind {
                    ExprKind::CommaSeparatedList(items) => items.len(),
                    _ => 1,
                };
                if args != 1 {
                    return self.aggregate_with_initialisers(&target, source, &location);
                }
                let single = match self.arena.expr(source).kind.clone() {
                    ExprKind::CommaSeparatedList(items) => items[0],
                    _ => source,
                };
                let source_expr = self.evaluate_as_expression(single)?;
                let source_type = source_expr.ty(self.module());
                if TypeRules::can_cast_to(&target, &source_type) {
                    return Ok(self.create_cast_if_needed(source_expr, &target));
                }
                if target.is_fixed_size_aggregate() && target.num_aggregate_elements() == Some(1) {
                    return self.aggregate_with_initialisers(&target, source, &location);
                }
                Err(self.err(
                    location,
                    format!("cannot cast '{source_type}' to '{target}'"),
                ))
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs_type = self.arena.result_type(lhs).expect("resolved");
                let rhs_type = self.arena.result_type(rhs).expect("resolved");
                let operand = op
                    .operand_type(&lhs_type, &rhs_type)
                    .ok_or_else(|| self.err(location.clone(), "illegal operand types"))?;
                // left-to-right evaluation preserved
                let l = self.evaluate_as_expression(lhs)?;
                let l = self.create_cast_if_needed(l, &operand);
                let r = self.evaluate_as_expression(rhs)?;
                let r = self.create_cast_if_needed(r, &operand);
                Ok(Expr::Binary {
                    op,
                    result_type: operand,
                    lhs: Box::new(l),
                    rhs: Box::new(r),
                })
            }
            ExprKind::Unary { op, source } => {
                let s = self.evaluate_as_expression(source)?;
                Ok(Expr::Unary {
                    op,
                    source: Box::new(s),
                })
            }
            ExprKind::ProcessorProperty(p) => {
                if self.arena.module(self.source).is_namespace() {
                    return Err(self.err(
                        location,
                        "processor properties are only valid inside a processor or graph",
                    ));
                }
                Ok(Expr::ProcessorProperty(p))
            }
            _ => self.expression_as_register_copy(e),
        }
    }

    fn expression_as_register_copy(&mut self, e: ExprId) -> CompileResult<Expr> {
        let t = self
            .arena
            .result_type(e)
            .ok_or_else(|| self.err(self.arena.expr_location(e), "expected a value"))?
            .remove_const_if_present()
            .remove_reference_if_present();
        let register = self.create_register_variable(t);
        self.visit_with_destination(Some(register), e)?;
        Ok(Expr::Variable(register))
    }

    fn expression_as_mutable_copy(&mut self, e: ExprId) -> CompileResult<Expr> {
        let t = self
            .arena
            .result_type(e)
            .ok_or_else(|| self.err(self.arena.expr_location(e), "expected a value"))?
            .remove_const_if_present()
            .remove_reference_if_present();
        let local = self.create_mutable_local(t, None);
        self.visit_with_destination(Some(local), e)?;
        Ok(Expr::Variable(local))
    }

    fn evaluate_with_target_type(&mut self, e: ExprId, target_type: &Type) -> CompileResult<Expr> {
        if target_type.is_reference() {
            let bare = target_type.remove_reference_if_present();
            return self.evaluate_with_target_type(e, &bare);
        }

        if let ExprKind::CommaSeparatedList(items) = self.arena.expr(e).kind.clone() {
            if target_type.is_array_or_vector() || target_type.is_struct() {
                let temp = self.create_mutable_local(target_type.remove_const_if_present(), None);
                let location = self.arena.expr_location(e);
                self.initialise_aggregate_elements(Expr::Variable(temp), &items, &location)?;
                return Ok(Expr::Variable(temp));
            }
        }

        let resolved = self.evaluate_as_expression(e)?;
        let resolved_type = resolved.ty(self.module());

        if resolved_type.is_identical(target_type) {
            return Ok(resolved);
        }

        if let Some(c) = resolved.as_constant() {
            if TypeRules::can_silently_cast_value_to(target_type, c) {
                return Ok(Expr::Constant(c.cast_to_expecting_success(
                    &target_type.remove_const_if_present(),
                )));
            }
        }

        if !TypeRules::can_silently_cast_to(target_type, &resolved_type)
            && !TypeRules::can_cast_to(target_type, &resolved_type)
        {
            return Err(self.err(
                self.arena.expr_location(e),
                format!("expected an expression of type '{target_type}'"),
            ));
        }

        Ok(self.create_cast_if_needed(resolved, target_type))
    }

    // ── Lvalues ──

    fn get_as_reference(&mut self, e: ExprId, is_const_ref: bool) -> CompileResult<Expr> {
        let location = self.arena.expr_location(e);
        match self.arena.expr(e).kind.clone() {
            ExprKind::VariableRef(v) => {
                if let Some(g) = self.arena.var(v).generated {
                    return Ok(Expr::Variable(g as usize));
                }
                if is_const_ref {
                    return self.expression_as_mutable_copy(e);
                }
                Err(self.err(location, "this expression cannot be assigned to"))
            }
            ExprKind::StructMemberRef {
                object,
                member_index,
                ..
            } => {
                let parent = self.get_as_reference(object, is_const_ref)?;
                Ok(Expr::SubElement {
                    parent: Box::new(parent),
                    index: SubIndex::Fixed(member_index as u64),
                    suppress_wrap_warning: false,
                })
            }
            ExprKind::ArrayElementRef { object, .. } => {
                let parent = self.get_as_reference(object, is_const_ref)?;
                self.array_sub_element(e, parent)
            }
            _ => {
                if is_const_ref {
                    return self.expression_as_mutable_copy(e);
                }
                Err(self.err(location, "this expression cannot be assigned to"))
            }
        }
    }

    fn array_sub_element(&mut self, e: ExprId, parent: Expr) -> CompileResult<Expr> {
        let location = self.arena.expr_location(e);
        let (start, end, is_slice, suppress) = match self.arena.expr(e).kind.clone() {
            ExprKind::ArrayElementRef {
                start,
                end,
                is_slice,
                suppress_wrap_warning,
                ..
            } => (start, end, is_slice, suppress_wrap_warning),
            _ => unreachable!(),
        };

        if is_slice {
            let (s, e2) = self
                .arena
                .slice_range(e)
                .ok_or_else(|| self.err(location.clone(), "invalid slice size"))?;
            return Ok(Expr::SubElement {
                parent: Box::new(parent),
                index: SubIndex::Range {
                    start: s,
                    end: e2,
                    trusted: true,
                },
                suppress_wrap_warning: suppress,
            });
        }

        let start = start.ok_or_else(|| self.err(location.clone(), "expected an index"))?;
        let _ = end;
        let index = self.evaluate_as_expression(start)?;

        // a constant index inside range collapses into a fixed access
        if let Some(c) = index.as_constant() {
            if let Some(i) = c.as_i64() {
                if i >= 0 {
                    return Ok(Expr::SubElement {
                        parent: Box::new(parent),
                        index: SubIndex::Fixed(i as u64),
                        suppress_wrap_warning: suppress,
                    });
                }
            }
        }

        Ok(Expr::SubElement {
            parent: Box::new(parent),
            index: SubIndex::Dynamic(Box::new(index)),
            suppress_wrap_warning: suppress,
        })
    }

    fn array_element_expr(&mut self, e: ExprId) -> CompileResult<Expr> {
        let object = match self.arena.expr(e).kind.clone() {
            ExprKind::ArrayElementRef { object, .. } => object,
            _ => unreachable!(),
        };
        let source = self.evaluate_as_expression(object)?;
        self.array_sub_element(e, source)
    }

    fn visit_array_element(&mut self, e: ExprId) -> CompileResult<()> {
        let value = self.array_element_expr(e)?;
        self.add_cast_or_assignment(value);
        Ok(())
    }

    // ── Aggregates ──

    fn initialise_aggregate_elements(
        &mut self,
        target: Expr,
        items: &[ExprId],
        location: &Location,
    ) -> CompileResult<()> {
        let target_type = target.ty(self.module());
        sanity::throw_if_wrong_number_of_elements(location, &target_type, items.len())?;

        self.add_zero_assignment(target.clone());

        for (i, item) in items.iter().enumerate() {
            // zero elements are covered by the zero-assignment above
            if let Some(c) = self.arena.get_as_constant(*item) {
                if c.is_zero() {
                    continue;
                }
            }
            let element = Expr::SubElement {
                parent: Box::new(target.clone()),
                index: SubIndex::Fixed(i as u64),
                suppress_wrap_warning: false,
            };
            self.create_assignment(element, *item)?;
        }
        Ok(())
    }

    fn aggregate_with_initialisers(
        &mut self,
        target_type: &Type,
        source: ExprId,
        location: &Location,
    ) -> CompileResult<Expr> {
        let temp = self.create_mutable_local(target_type.remove_const_if_present(), None);
        let items = match self.arena.expr(source).kind.clone() {
            ExprKind::CommaSeparatedList(items) => items,
            _ => vec![source],
        };
        self.initialise_aggregate_elements(Expr::Variable(temp), &items, location)?;
        Ok(Expr::Variable(temp))
    }

    // ── Calls ──

    fn visit_function_call(&mut self, e: ExprId) -> CompileResult<()> {
        let (function, args) = match self.arena.expr(e).kind.clone() {
            ExprKind::FunctionCall { function, args } => (function, args),
            _ => unreachable!(),
        };

        let return_type = self
            .arena
            .resolve_as_type(self.arena.function(function).return_type)
            .expect("resolved return type");

        if let Some(target) = self.current_target {
            let target_type = self.module().variables[target].ty.clone();
            if !return_type.is_identical(&target_type) {
                let temp = self.create_register_variable(return_type.clone());
                self.emit_function_call(function, args, Some(Expr::Variable(temp)))?;
                let cast = self.create_cast_if_needed(Expr::Variable(temp), &target_type);
                self.add_assignment(Expr::Variable(target), cast);
                return Ok(());
            }
            return self.emit_function_call(function, args, Some(Expr::Variable(target)));
        }

        self.emit_function_call(function, args, None)
    }

    fn emit_function_call(
        &mut self,
        function: FunctionId,
        args: Option<ExprId>,
        target: Option<Expr>,
    ) -> CompileResult<()> {
        let params = self.arena.function(function).parameters.clone();
        let arg_exprs = self.arena.argument_list(args);

        let mut lowered_args = Vec::with_capacity(arg_exprs.len());
        for (i, arg) in arg_exprs.iter().enumerate() {
            let param_type = self
                .arena
                .var_type(params[i])
                .expect("resolved parameter type");
            if param_type.is_reference() {
                lowered_args.push(self.get_as_reference(*arg, param_type.is_const())?);
            } else {
                lowered_args.push(self.evaluate_with_target_type(*arg, &param_type)?);
            }
        }

        let function_name = self.qualified_function_name(function);
        let key = match self.arena.function(function).generated {
            Some((m, f)) => FunctionKey {
                module: m,
                function: f,
            },
            None => FunctionKey::UNRESOLVED,
        };

        self.ensure_block_is_ready();
        let statement_index = {
            let f = self.current_function.expect("inside a function");
            let b = self.current_block.expect("inside a block");
            self.program.modules[self.module_index].functions[f].blocks[b]
                .statements
                .len()
        };

        self.add_statement(Statement::Call {
            target,
            function: key,
            function_name,
            args: lowered_args,
        });

        if !key.is_resolved() {
            self.unresolved.push(UnresolvedCall {
                module: self.module_index,
                function: self.current_function.unwrap(),
                block: self.current_block.unwrap(),
                statement: statement_index,
                target: function,
            });
        }
        Ok(())
    }

    fn qualified_function_name(&self, f: FunctionId) -> String {
        let module = self
            .arena
            .enclosing_module(self.arena.function(f).scope)
            .expect("functions live in modules");
        format!(
            "{}::{}",
            self.arena.fully_qualified_module_name(module),
            self.arena.name(self.arena.function(f).name)
        )
    }

    // ── Ternary / inc-dec ──

    fn visit_ternary(
        &mut self,
        e: ExprId,
        condition: ExprId,
        true_branch: ExprId,
        false_branch: ExprId,
    ) -> CompileResult<()> {
        let target = match self.current_target {
            Some(t) => t,
            None => {
                return Err(self.err(
                    self.arena.expr_location(e),
                    "a ternary operator cannot be used as a statement",
                ))
            }
        };

        let label = self.if_index;
        self.if_index += 1;

        let true_block = self.create_named_block("@if_true_", label);
        let false_block = self.create_named_block("@if_false_", label);
        let end_block = self.create_named_block("@if_end_", label);

        let target_type = self.module().variables[target]
            .ty
            .remove_const_if_present();
        let temp = self.create_mutable_local(target_type, None);
        self.add_zero_assignment(Expr::Variable(temp));

        let cond = self.evaluate_with_target_type(condition, &Type::bool())?;
        self.add_branch_if(cond, true_block, false_block, true_block);
        self.visit_with_destination(Some(temp), true_branch)?;
        self.add_branch(end_block, false_block);
        self.visit_with_destination(Some(temp), false_branch)?;
        self.begin_block(end_block);
        self.add_assignment(Expr::Variable(target), Expr::Variable(temp));
        Ok(())
    }

    fn visit_inc_dec(
        &mut self,
        target: ExprId,
        is_increment: bool,
        is_post: bool,
    ) -> CompileResult<()> {
        let result_dest = self.current_target;
        let op = if is_increment {
            BinaryOp::Add
        } else {
            BinaryOp::Subtract
        };

        let dest = self.get_as_reference(target, false)?;
        let t = dest.ty(self.module()).remove_reference_if_present().remove_const_if_present();

        let old_value = self.create_register_variable(t.clone());
        self.add_assignment(Expr::Variable(old_value), dest.clone());

        let one = Expr::Constant(Value::Int32(1).cast_to_expecting_success(&if t.is_bounded_int() {
            Type::int32()
        } else {
            t.clone()
        }));
        let incremented = Expr::Binary {
            op,
            result_type: if t.is_bounded_int() { Type::int32() } else { t.clone() },
            lhs: Box::new(Expr::Variable(old_value)),
            rhs: Box::new(one),
        };

        match result_dest {
            None => {
                let value = self.create_cast_if_needed(incremented, &t);
                self.add_assignment(dest, value);
            }
            Some(result) if is_post => {
                let value = self.create_cast_if_needed(incremented, &t);
                self.add_assignment(dest, value);
                self.add_assignment(Expr::Variable(result), Expr::Variable(old_value));
            }
            Some(result) => {
                let value = self.create_cast_if_needed(incremented, &t);
                self.add_assignment(Expr::Variable(result), value);
                self.add_assignment(dest, Expr::Variable(result));
            }
        }
        Ok(())
    }

    // ── Endpoint writes ──

    fn visit_write_to_endpoint(&mut self, e: ExprId) -> CompileResult<()> {
        // flatten the chained writes into a value list, innermost first
        let mut values = Vec::new();
        let mut target = e;
        while let ExprKind::WriteToEndpoint { target: t, value } = self.arena.expr(target).kind.clone() {
            values.insert(0, value);
            target = t;
        }
        self.create_series_of_writes(target, &values)
    }

    fn create_series_of_writes(&mut self, target: ExprId, values: &[ExprId]) -> CompileResult<()> {
        let location = self.arena.expr_location(target);

        if let ExprKind::OutputEndpointRef(endpoint) = self.arena.expr(target).kind {
            let output = *self
                .endpoint_indices
                .get(&endpoint)
                .expect("endpoint generated");
            for v in values {
                let sample_type = self.choose_sample_type(endpoint, *v)?;
                let value = self.evaluate_with_target_type(*v, &sample_type)?;
                self.add_statement(Statement::WriteStream {
                    output,
                    index: None,
                    value,
                });
            }
            return Ok(());
        }

        if let ExprKind::ArrayElementRef { object, start, .. } = self.arena.expr(target).kind.clone() {
            if let ExprKind::OutputEndpointRef(endpoint) = self.arena.expr(object).kind {
                let array_size = self.arena.endpoint(endpoint).array_size;
                if array_size.is_none() {
                    return Err(self.err(
                        location,
                        "brackets cannot be used on a non-array endpoint",
                    ));
                }
                let array_size = self.get_endpoint_array_size(array_size.unwrap())? as i64;
                let output = *self
                    .endpoint_indices
                    .get(&endpoint)
                    .expect("endpoint generated");

                let start = start
                    .ok_or_else(|| self.err(location.clone(), "expected an endpoint index"))?;

                for v in values {
                    let sample_type = self.choose_element_sample_type(endpoint, *v)?;
                    let value = self.evaluate_with_target_type(*v, &sample_type)?;
                    let index = self.evaluate_as_expression(start)?;

                    let index = match index.as_constant() {
                        Some(c) => {
                            let fixed = c.as_i64().ok_or_else(|| {
                                self.err(
                                    self.arena.expr_location(start),
                                    "an endpoint index must be an integer",
                                )
                            })?;
                            if fixed < 0 || fixed >= array_size {
                                return Err(self.err(
                                    self.arena.expr_location(start),
                                    "endpoint index out of range",
                                ));
                            }
                            Expr::Constant(Value::Int32(fixed as i32))
                        }
                        None => {
                            // dynamic indices wrap to the endpoint array size
                            let wrap_type = Type::Wrap(array_size as u64);
                            self.create_cast_if_needed(index, &wrap_type)
                        }
                    };

                    self.add_statement(Statement::WriteStream {
                        output,
                        index: Some(index),
                        value,
                    });
                }
                return Ok(());
            }
        }

        Err(self.err(location, "the target of a '<<' operator must be an output"))
    }

    fn choose_sample_type(&self, endpoint: EndpointId, value: ExprId) -> CompileResult<Type> {
        let value_type = self
            .arena
            .result_type(value)
            .ok_or_else(|| self.err(self.arena.expr_location(value), "expected a value"))?;

        let mut types = Vec::new();
        for t in &self.arena.endpoint(endpoint).sample_types {
            types.push(self.arena.resolve_as_type(*t).expect("resolved endpoint type"));
        }

        for t in &types {
            if value_type.is_identical(t) {
                return Ok(t.clone());
            }
        }
        for t in &types {
            let ok = TypeRules::can_silently_cast_to(t, &value_type)
                || self
                    .arena
                    .get_as_constant(value)
                    .map_or(false, |c| TypeRules::can_silently_cast_value_to(t, &c));
            if ok {
                return Ok(t.clone());
            }
        }

        let descriptions: Vec<String> = types.iter().map(Type::description).collect();
        Err(self.err(
            self.arena.expr_location(value),
            format!(
                "cannot write a value of type '{value_type}' to an endpoint of type ({})",
                descriptions.join(", ")
            ),
        ))
    }

    fn choose_element_sample_type(&self, endpoint: EndpointId, value: ExprId) -> CompileResult<Type> {
        self.choose_sample_type(endpoint, value)
    }
}
