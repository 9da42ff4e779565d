// compiler.rs — Compilation state and phase orchestration
//
// Ties the phases together: feed source chunks in with `add_code`, then
// `link` runs the fixed pipeline — pre-resolution sanity, the resolver
// fixed point (errors ignored), graph expansion and specialisation, the
// final resolver run (errors surfaced), post-resolution sanity, HEART
// generation with call patching, and the post-generation checks. The
// one-shot `Compiler::build` covers the single-chunk case.
//
// Preconditions: chunks are UTF-8 SOUL source.
// Postconditions: link() yields a checked HEART Program and resets nothing —
//   the compiler is consumed.
// Failure modes: any phase error aborts the link (first error wins).
// Side effects: none beyond arena allocation.

use std::rc::Rc;

use crate::analyze;
use crate::ast::{create_root_namespace, Arena, ModuleId};
use crate::diag::{Category, CompileResult, Diagnostic, SourceChunk};
use crate::expand;
use crate::heart::{Expr, Program, Statement, SubIndex, Terminator};
use crate::intrinsics::BUILT_IN_LIBRARY;
use crate::lower;
use crate::parser;
use crate::resolve;
use crate::sanity;
use crate::types::Value;

// ── Link options ─────────────────────────────────────────────────────────

/// Options controlling a link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Name of the processor to use as the program entry point. When empty,
    /// a `[[ main ]]` annotation wins, then the last processor defined.
    pub main_processor: Option<String>,
    /// Cap on the packed size of any single module's state.
    pub max_state_size: u64,
    /// Cap on expression nesting during HEART lowering.
    pub max_expression_depth: u32,
}

impl Default for LinkOptions {
    fn default() -> Self {
        LinkOptions {
            main_processor: None,
            max_state_size: 20 * 1024 * 1024,
            max_expression_depth: lower::DEFAULT_MAX_EXPRESSION_DEPTH,
        }
    }
}

// ── Compiler ─────────────────────────────────────────────────────────────

/// Compiles and links SOUL source into a HEART `Program`.
pub struct Compiler {
    arena: Arena,
    root: ModuleId,
}

impl Default for Compiler {
    fn default() -> Self {
        Compiler::new()
    }
}

impl Compiler {
    pub fn new() -> Compiler {
        let mut arena = Arena::new();
        let root = create_root_namespace(&mut arena);
        let mut compiler = Compiler { arena, root };
        compiler
            .add_built_in_library()
            .expect("internal: the built-in library must parse");
        compiler
    }

    fn add_built_in_library(&mut self) -> CompileResult<()> {
        let chunk = SourceChunk::internal("<built-in>", BUILT_IN_LIBRARY);
        parser::parse_top_level_declarations(&mut self.arena, chunk, self.root)?;
        Ok(())
    }

    /// Parses a chunk of code containing top-level processor/graph/namespace
    /// declarations and adds them to the program.
    pub fn add_code(&mut self, chunk: Rc<SourceChunk>) -> CompileResult<()> {
        parser::parse_top_level_declarations(&mut self.arena, chunk, self.root)?;
        Ok(())
    }

    /// Links everything added so far into a Program.
    pub fn link(mut self, options: &LinkOptions) -> CompileResult<Program> {
        sanity::run_pre_resolution(&self.arena, self.root)?;

        // first resolution sweep: failures are only counted, since
        // specialisation below will keep rewriting the tree
        resolve::run(&mut self.arena, self.root, true)?;

        expand::expand_graphs(&mut self.arena, self.root)?;

        let main = self.find_main_processor(options)?;

        // final sweep with diagnostics enabled — every module individually,
        // so clones minted after the root settled still get their error pass
        for module in self.all_modules() {
            resolve::run(&mut self.arena, module, false)?;
        }
        sanity::run_post_resolution(&self.arena, self.root)?;

        let mut program = Program::default();
        let mut unresolved = Vec::new();
        let mut main_index = None;

        for module in self.modules_to_generate() {
            let index = lower::generate_module(
                &mut self.arena,
                module,
                &mut program,
                &mut unresolved,
                options.max_expression_depth,
            )?;
            if Some(module) == main {
                main_index = Some(index);
            }
        }

        lower::patch_unresolved_calls(&self.arena, &mut program, &unresolved)?;
        program.main_module = main_index;

        analyze::run(&program, options.max_state_size)?;
        build_string_dictionary(&mut program);
        Ok(program)
    }

    /// One-step compile-and-link for a single piece of code.
    pub fn build(chunk: Rc<SourceChunk>, options: &LinkOptions) -> CompileResult<Program> {
        let mut compiler = Compiler::new();
        compiler.add_code(chunk)?;
        compiler.link(options)
    }

    // ── Module collection ──

    /// Every module in the tree, in definition order.
    fn all_modules(&self) -> Vec<ModuleId> {
        let mut out = Vec::new();
        let mut pending = vec![self.root];
        while let Some(m) = pending.pop() {
            out.push(m);
            for sub in self.arena.module(m).sub_modules.iter().rev() {
                pending.push(*sub);
            }
        }
        out
    }

    /// All modules that produce HEART output, in definition order.
    fn modules_to_generate(&self) -> Vec<ModuleId> {
        let mut out = Vec::new();
        self.collect_generating_modules(self.root, &mut out);
        out
    }

    fn collect_generating_modules(&self, module: ModuleId, out: &mut Vec<ModuleId>) {
        for sub in &self.arena.module(module).sub_modules {
            let m = self.arena.module(*sub);
            let generates = match m.kind {
                crate::ast::ModuleKind::Processor | crate::ast::ModuleKind::Graph => true,
                crate::ast::ModuleKind::Namespace => {
                    !m.structs.is_empty()
                        || m.state_variables
                            .iter()
                            .any(|v| self.arena.var(*v).is_external)
                        || m.functions
                            .iter()
                            .any(|f| !self.arena.function(*f).is_generic())
                }
            };
            if generates {
                out.push(*sub);
            }
            self.collect_generating_modules(*sub, out);
        }
    }

    // ── Main processor selection ──

    fn find_main_processor(&self, options: &LinkOptions) -> CompileResult<Option<ModuleId>> {
        let mut candidates = Vec::new();
        self.collect_main_candidates(self.root, &mut candidates);

        if let Some(wanted) = &options.main_processor {
            for m in &candidates {
                let full = self.arena.fully_qualified_module_name(*m);
                let simple = self.arena.name(self.arena.module(*m).name);
                if &full == wanted || simple == wanted {
                    return Ok(Some(*m));
                }
            }
            return Err(Diagnostic::global(
                Category::PostCheck,
                format!("cannot find a processor called '{wanted}'"),
            ));
        }

        for m in &candidates {
            if self.arena.module(*m).annotation.find("main").is_some() {
                return Ok(Some(*m));
            }
        }

        Ok(candidates.last().copied())
    }

    fn collect_main_candidates(&self, module: ModuleId, out: &mut Vec<ModuleId>) {
        for sub in &self.arena.module(module).sub_modules {
            let m = self.arena.module(*sub);
            if m.is_processor_or_graph()
                && !m.is_specialised_clone
                && !m.context.location.chunk.is_internal
            {
                out.push(*sub);
            }
            self.collect_main_candidates(*sub, out);
        }
    }
}

// ── String dictionary ────────────────────────────────────────────────────

/// Collects every string literal in the generated program into the
/// program's dictionary.
fn build_string_dictionary(program: &mut Program) {
    let mut strings = Vec::new();

    for m in &program.modules {
        for (_, v) in &m.annotation {
            collect_strings_in_value(v, &mut strings);
        }
        for var in &m.variables {
            for (_, v) in &var.annotation {
                collect_strings_in_value(v, &mut strings);
            }
        }
        for e in m.inputs.iter().chain(m.outputs.iter()) {
            for (_, v) in &e.annotation {
                collect_strings_in_value(v, &mut strings);
            }
        }
        for f in &m.functions {
            for b in &f.blocks {
                for s in &b.statements {
                    match s {
                        Statement::Assign { target, value } => {
                            collect_strings_in_expr(target, &mut strings);
                            collect_strings_in_expr(value, &mut strings);
                        }
                        Statement::Call { target, args, .. } => {
                            if let Some(t) = target {
                                collect_strings_in_expr(t, &mut strings);
                            }
                            for a in args {
                                collect_strings_in_expr(a, &mut strings);
                            }
                        }
                        Statement::WriteStream { index, value, .. } => {
                            if let Some(i) = index {
                                collect_strings_in_expr(i, &mut strings);
                            }
                            collect_strings_in_expr(value, &mut strings);
                        }
                        Statement::ReadStream { target, .. } => {
                            collect_strings_in_expr(target, &mut strings);
                        }
                        Statement::AdvanceClock => {}
                    }
                }
                match &b.terminator {
                    Some(Terminator::BranchIf { condition, .. }) => {
                        collect_strings_in_expr(condition, &mut strings);
                    }
                    Some(Terminator::Return(Some(v))) => {
                        collect_strings_in_expr(v, &mut strings);
                    }
                    _ => {}
                }
            }
        }
    }

    for s in strings {
        program.strings.handle_for(&s);
    }
}

fn collect_strings_in_expr(e: &Expr, out: &mut Vec<String>) {
    match e {
        Expr::Constant(v) => collect_strings_in_value(v, out),
        Expr::SubElement { parent, index, .. } => {
            collect_strings_in_expr(parent, out);
            if let SubIndex::Dynamic(d) = index {
                collect_strings_in_expr(d, out);
            }
        }
        Expr::Cast { source, .. } => collect_strings_in_expr(source, out),
        Expr::Unary { source, .. } => collect_strings_in_expr(source, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_strings_in_expr(lhs, out);
            collect_strings_in_expr(rhs, out);
        }
        Expr::Variable(_) | Expr::ProcessorProperty(_) => {}
    }
}

fn collect_strings_in_value(v: &Value, out: &mut Vec<String>) {
    match v {
        Value::String(s) => out.push(s.to_string()),
        Value::Aggregate { elements, .. } => {
            for e in elements {
                collect_strings_in_value(e, out);
            }
        }
        _ => {}
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heart::{Statement, Terminator};

    pub fn compile(source: &str) -> CompileResult<Program> {
        Compiler::build(
            SourceChunk::new("test.soul", source),
            &LinkOptions::default(),
        )
    }

    #[test]
    fn hello_processor_compiles() {
        let program = compile(
            "processor P { output stream float out; void run() { loop { out << 0.0f; advance(); } } }",
        )
        .unwrap_or_else(|e| panic!("compile failed: {e}"));

        let p = program.module_with_name("P").expect("module P exists");
        assert_eq!(p.outputs.len(), 1);
        assert_eq!(p.outputs[0].name, "out");

        let run = &p.functions[p.find_function("run").expect("run exists")];
        assert!(run.is_run_function);

        // the loop body writes the stream, advances, and branches back
        let has_write = run.blocks.iter().any(|b| {
            b.statements
                .iter()
                .any(|s| matches!(s, Statement::WriteStream { .. }))
        });
        let has_advance = run.blocks.iter().any(|b| {
            b.statements
                .iter()
                .any(|s| matches!(s, Statement::AdvanceClock))
        });
        assert!(has_write);
        assert!(has_advance);

        // the advance block loops back unconditionally
        let has_back_branch = run
            .blocks
            .iter()
            .any(|b| matches!(b.terminator, Some(Terminator::Branch(_))));
        assert!(has_back_branch);

        assert_eq!(program.main_processor().unwrap().name, "P");
    }

    #[test]
    fn main_processor_by_name() {
        let source = "processor A { output stream float out; void run() { advance(); } }\n\
                      processor B { output stream float out; void run() { advance(); } }";
        let program = Compiler::build(
            SourceChunk::new("test.soul", source),
            &LinkOptions {
                main_processor: Some("A".into()),
                ..LinkOptions::default()
            },
        )
        .unwrap();
        assert_eq!(program.main_processor().unwrap().name, "A");
    }

    #[test]
    fn main_processor_by_annotation() {
        let source = "processor A [[ main ]] { output stream float out; void run() { advance(); } }\n\
                      processor B { output stream float out; void run() { advance(); } }";
        let program = compile(source).unwrap();
        assert_eq!(program.main_processor().unwrap().name, "A");
    }

    #[test]
    fn main_processor_defaults_to_last() {
        let source = "processor A { output stream float out; void run() { advance(); } }\n\
                      processor B { output stream float out; void run() { advance(); } }";
        let program = compile(source).unwrap();
        assert_eq!(program.main_processor().unwrap().name, "B");
    }

    #[test]
    fn unknown_main_processor_errors() {
        let e = Compiler::build(
            SourceChunk::new("test.soul", "processor A { output stream float out; void run() { advance(); } }"),
            &LinkOptions {
                main_processor: Some("Zed".into()),
                ..LinkOptions::default()
            },
        )
        .expect_err("expected error");
        assert!(e.message.contains("Zed"));
    }

    #[test]
    fn string_dictionary_collects_annotations() {
        let program = compile(
            "processor P [[ name: \"synth\" ]] { output stream float out; void run() { advance(); } }",
        )
        .unwrap();
        assert!(!program.strings.is_empty());
    }
}
