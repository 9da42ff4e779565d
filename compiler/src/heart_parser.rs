// heart_parser.rs — Parser for the textual HEART dump
//
// Reads the line-oriented format emitted by the Display impls in heart.rs
// back into a Program. Exists for round-trip testing: lowering a module to
// HEART text and re-parsing it must yield a structurally identical module.
//
// Preconditions: input produced by `Program::to_heart` (or equivalent).
// Postconditions: returns a Program whose re-dump matches the input.
// Failure modes: any malformed line is fatal with a line/column location.
// Side effects: none.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{EndpointKind, InterpolationType, ModuleKind, ProcessorProperty};
use crate::diag::{Category, CompileResult, Diagnostic, Location, SourceChunk, Span};
use crate::heart::{
    Block, Connection, EndpointDecl, Expr, Function, FunctionKey, Module, Program,
    ProcessorInstance, Statement, SubIndex, Terminator, Variable, VariableRole,
};
use crate::intrinsics::Intrinsic;
use crate::types::{BinaryOp, Primitive, StructMember, StructType, Type, UnaryOp, Value};

/// Parses a HEART dump back into a Program.
pub fn parse_heart_text(text: &str) -> CompileResult<Program> {
    let chunk = SourceChunk::new("<heart>", text);
    let mut parser = HeartParser {
        chunk,
        program: Program::default(),
        structs: HashMap::new(),
        main_name: None,
        pending_calls: Vec::new(),
        current_function: None,
        current_block: None,
        line_start: 0,
    };
    parser.parse(text)?;
    parser.finish()
}

struct HeartParser {
    chunk: Rc<SourceChunk>,
    program: Program,
    /// Program-wide struct table; placeholders fill in when declared.
    structs: HashMap<String, Rc<StructType>>,
    main_name: Option<String>,
    /// (module, function, block, statement, qualified name)
    pending_calls: Vec<(usize, usize, usize, usize, String)>,
    current_function: Option<usize>,
    current_block: Option<usize>,
    line_start: usize,
}

impl HeartParser {
    fn err(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(
            Category::Parse,
            Location::new(self.chunk.clone(), Span::new(self.line_start, self.line_start + 1)),
            message,
        )
    }

    fn parse(&mut self, text: &str) -> CompileResult<()> {
        let mut offset = 0;
        for line in text.lines() {
            self.line_start = offset;
            offset += line.len() + 1;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed == "#HEART" {
                continue;
            }
            let tokens = tokenize(trimmed).map_err(|m| self.err(m))?;
            self.parse_line(&tokens)?;
        }
        Ok(())
    }

    fn finish(mut self) -> CompileResult<Program> {
        // patch call targets now that every function exists
        for (m, f, b, s, name) in std::mem::take(&mut self.pending_calls) {
            let key = {
                let (module_name, function_name) = name
                    .rsplit_once("::")
                    .ok_or_else(|| Diagnostic::global(Category::Parse, format!("bad call target '{name}'")))?;
                let module_index = self
                    .program
                    .modules
                    .iter()
                    .position(|module| module.name == module_name)
                    .ok_or_else(|| {
                        Diagnostic::global(Category::Parse, format!("unknown module '{module_name}'"))
                    })?;
                let function_index = self.program.modules[module_index]
                    .find_function(function_name)
                    .ok_or_else(|| {
                        Diagnostic::global(Category::Parse, format!("unknown function '{name}'"))
                    })?;
                FunctionKey {
                    module: module_index,
                    function: function_index,
                }
            };
            if let Statement::Call { function, .. } =
                &mut self.program.modules[m].functions[f].blocks[b].statements[s]
            {
                *function = key;
            }
        }

        if let Some(main) = &self.main_name {
            self.program.main_module = self
                .program
                .modules
                .iter()
                .position(|m| &m.name == main);
        }

        Ok(self.program)
    }

    fn module(&mut self) -> CompileResult<&mut Module> {
        self.program
            .modules
            .last_mut()
            .ok_or_else(|| Diagnostic::global(Category::Parse, "no module is open"))
    }

    fn parse_line(&mut self, tokens: &[Tok]) -> CompileResult<()> {
        let mut c = Cursor { tokens, pos: 0 };
        let head = c.word().map_err(|m| self.err(m))?;

        match head.as_str() {
            "main" => {
                self.main_name = Some(c.string().map_err(|m| self.err(m))?);
                Ok(())
            }
            "namespace" | "processor" | "graph" => {
                let kind = match head.as_str() {
                    "namespace" => ModuleKind::Namespace,
                    "processor" => ModuleKind::Processor,
                    _ => ModuleKind::Graph,
                };
                let name = c.string().map_err(|m| self.err(m))?;
                self.program.modules.push(Module::new(name, kind));
                self.current_function = None;
                self.current_block = None;
                Ok(())
            }
            "annotation" => {
                let key = c.string().map_err(|m| self.err(m))?;
                let value = parse_bare_value(&mut c).map_err(|m| self.err(m))?;
                self.module()?.annotation.push((key, value));
                Ok(())
            }
            "struct" => self.parse_struct(&mut c),
            "input" | "output" => self.parse_endpoint(&mut c, head == "input"),
            "instance" => self.parse_instance(&mut c),
            "connection" => self.parse_connection(&mut c),
            "var" => self.parse_variable(&mut c),
            "func" => self.parse_function(&mut c),
            "block" => self.parse_block(&mut c),
            "assign" | "call" | "write" | "read" | "advance" | "term" => {
                self.parse_code_line(head, &mut c)
            }
            other => Err(self.err(format!("unexpected '{other}'"))),
        }
    }

    fn get_or_create_struct(&mut self, name: &str) -> Rc<StructType> {
        if let Some(s) = self.structs.get(name) {
            return s.clone();
        }
        let s = StructType::new(name);
        self.structs.insert(name.to_string(), s.clone());
        s
    }

    fn parse_struct(&mut self, c: &mut Cursor) -> CompileResult<()> {
        let name = c.string().map_err(|m| self.err(m))?;
        let structure = self.get_or_create_struct(&name);
        c.expect(Tok::OpenBrace).map_err(|m| self.err(m))?;

        let mut members = Vec::new();
        while !c.peek_is(&Tok::CloseBrace) {
            let ty = self.parse_type(c)?;
            let member_name = c.string().map_err(|m| self.err(m))?;
            members.push(StructMember {
                ty,
                name: member_name,
            });
        }
        *structure.members.borrow_mut() = members;
        self.module()?.structs.push(structure);
        Ok(())
    }

    fn parse_endpoint(&mut self, c: &mut Cursor, is_input: bool) -> CompileResult<()> {
        let index = c.integer().map_err(|m| self.err(m))? as u32;
        let kind = match c.word().map_err(|m| self.err(m))?.as_str() {
            "stream" => EndpointKind::Stream,
            "value" => EndpointKind::Value,
            "event" => EndpointKind::Event,
            other => return Err(self.err(format!("unknown endpoint kind '{other}'"))),
        };

        c.expect(Tok::OpenParen).map_err(|m| self.err(m))?;
        let mut sample_types = Vec::new();
        loop {
            sample_types.push(self.parse_type(c)?);
            if c.match_tok(&Tok::Comma) {
                continue;
            }
            c.expect(Tok::CloseParen).map_err(|m| self.err(m))?;
            break;
        }

        let name = c.string().map_err(|m| self.err(m))?;
        let array_size = if c.match_tok(&Tok::OpenBracket) {
            let size = c.integer().map_err(|m| self.err(m))? as u32;
            c.expect(Tok::CloseBracket).map_err(|m| self.err(m))?;
            Some(size)
        } else {
            None
        };

        let decl = EndpointDecl {
            name,
            index,
            kind,
            sample_types,
            array_size,
            annotation: Vec::new(),
        };
        let module = self.module()?;
        if is_input {
            module.inputs.push(decl);
        } else {
            module.outputs.push(decl);
        }
        Ok(())
    }

    fn parse_instance(&mut self, c: &mut Cursor) -> CompileResult<()> {
        let instance_name = c.string().map_err(|m| self.err(m))?;
        c.expect(Tok::Equals).map_err(|m| self.err(m))?;
        let source_name = c.string().map_err(|m| self.err(m))?;

        let mut array_size = 1;
        let mut clock_multiplier = None;
        let mut clock_divider = None;

        if c.match_tok(&Tok::OpenBracket) {
            array_size = c.integer().map_err(|m| self.err(m))? as u32;
            c.expect(Tok::CloseBracket).map_err(|m| self.err(m))?;
        }
        if c.match_tok(&Tok::Times) {
            clock_multiplier = Some(c.integer().map_err(|m| self.err(m))?);
        }
        if c.match_tok(&Tok::Divide) {
            clock_divider = Some(c.integer().map_err(|m| self.err(m))?);
        }

        self.module()?.processor_instances.push(ProcessorInstance {
            instance_name,
            source_name,
            array_size,
            clock_multiplier,
            clock_divider,
        });
        Ok(())
    }

    fn parse_connection(&mut self, c: &mut Cursor) -> CompileResult<()> {
        let (source_processor, source_channel) = self.parse_connection_end(c)?;
        c.expect(Tok::Arrow).map_err(|m| self.err(m))?;
        let (dest_processor, dest_channel) = self.parse_connection_end(c)?;

        let mut interpolation = InterpolationType::None;
        if c.match_tok(&Tok::OpenBracket) {
            let name = c.word().map_err(|m| self.err(m))?;
            interpolation = InterpolationType::for_name(&name)
                .ok_or_else(|| self.err(format!("unknown interpolation '{name}'")))?;
            c.expect(Tok::CloseBracket).map_err(|m| self.err(m))?;
        }

        let mut delay_length = 0;
        if c.match_word("delay") {
            delay_length = c.integer().map_err(|m| self.err(m))?;
        }

        self.module()?.connections.push(Connection {
            source_processor,
            source_channel,
            dest_processor,
            dest_channel,
            interpolation,
            delay_length,
        });
        Ok(())
    }

    fn parse_connection_end(&mut self, c: &mut Cursor) -> CompileResult<(Option<String>, String)> {
        if c.match_word("self") {
            c.expect(Tok::Dot).map_err(|m| self.err(m))?;
            let channel = c.string().map_err(|m| self.err(m))?;
            return Ok((None, channel));
        }
        let processor = c.string().map_err(|m| self.err(m))?;
        c.expect(Tok::Dot).map_err(|m| self.err(m))?;
        let channel = c.string().map_err(|m| self.err(m))?;
        Ok((Some(processor), channel))
    }

    fn parse_variable(&mut self, c: &mut Cursor) -> CompileResult<()> {
        let index = c.integer().map_err(|m| self.err(m))? as usize;
        let role = match c.word().map_err(|m| self.err(m))?.as_str() {
            "param" => VariableRole::Parameter,
            "state" => VariableRole::State,
            "external" => VariableRole::External,
            "local" => VariableRole::MutableLocal,
            "register" => VariableRole::Register,
            other => return Err(self.err(format!("unknown variable role '{other}'"))),
        };
        let ty = self.parse_type(c)?;
        let name = if c.at_end() {
            None
        } else {
            Some(c.string().map_err(|m| self.err(m))?)
        };

        let module = self.module()?;
        if module.variables.len() != index {
            return Err(Diagnostic::global(
                Category::Parse,
                format!("variable index {index} out of order"),
            ));
        }
        module.variables.push(Variable {
            name,
            ty,
            role,
            annotation: Vec::new(),
        });
        Ok(())
    }

    fn parse_function(&mut self, c: &mut Cursor) -> CompileResult<()> {
        let name = c.string().map_err(|m| self.err(m))?;
        c.expect(Tok::OpenParen).map_err(|m| self.err(m))?;

        let mut parameters = Vec::new();
        while !c.peek_is(&Tok::CloseParen) {
            if !c.match_word("var") {
                return Err(self.err("expected 'var' in the parameter list"));
            }
            parameters.push(c.integer().map_err(|m| self.err(m))? as usize);
            c.match_tok(&Tok::Comma);
        }
        c.expect(Tok::CloseParen).map_err(|m| self.err(m))?;
        c.expect(Tok::Arrow).map_err(|m| self.err(m))?;
        let return_type = self.parse_type(c)?;

        let mut function = Function::new(name, return_type);
        function.parameters = parameters;

        if c.match_tok(&Tok::OpenBracket) {
            loop {
                let flag = c.word().map_err(|m| self.err(m))?;
                match flag.as_str() {
                    "init" => function.is_init_function = true,
                    "run" => function.is_run_function = true,
                    "event" => function.is_event_function = true,
                    "nobody" => function.has_no_body = true,
                    _ => {
                        if let Some(intrin) = flag.strip_prefix("intrin=") {
                            function.intrinsic = Intrinsic::from_name(intrin);
                        } else {
                            return Err(self.err(format!("unknown function flag '{flag}'")));
                        }
                    }
                }
                if !c.match_tok(&Tok::Comma) {
                    break;
                }
            }
            c.expect(Tok::CloseBracket).map_err(|m| self.err(m))?;
        }

        let index = {
            let module = self.module()?;
            module.functions.push(function);
            module.functions.len() - 1
        };
        self.current_function = Some(index);
        self.current_block = None;
        Ok(())
    }

    fn parse_block(&mut self, c: &mut Cursor) -> CompileResult<()> {
        let index = c.integer().map_err(|m| self.err(m))? as usize;
        let name = c.string().map_err(|m| self.err(m))?;
        let f = self
            .current_function
            .ok_or_else(|| self.err("'block' outside a function"))?;
        {
            let module = self.module()?;
            let function = &mut module.functions[f];
            if function.blocks.len() != index {
                return Err(Diagnostic::global(
                    Category::Parse,
                    format!("block index {index} out of order"),
                ));
            }
            function.blocks.push(Block::new(name));
        }
        self.current_block = Some(index);
        Ok(())
    }

    fn parse_code_line(&mut self, head: String, c: &mut Cursor) -> CompileResult<()> {
        let f = self
            .current_function
            .ok_or_else(|| self.err("statement outside a function"))?;
        let b = self
            .current_block
            .ok_or_else(|| self.err("statement outside a block"))?;
        let module_index = self.program.modules.len() - 1;

        match head.as_str() {
            "assign" => {
                let target = self.parse_expr(c)?;
                let value = self.parse_expr(c)?;
                self.push_statement(f, b, Statement::Assign { target, value });
                Ok(())
            }
            "call" => {
                let name = c.string().map_err(|m| self.err(m))?;
                let target = if c.match_word("none") {
                    None
                } else {
                    Some(self.parse_expr(c)?)
                };
                let mut args = Vec::new();
                while !c.at_end() {
                    args.push(self.parse_expr(c)?);
                }
                let statement_index =
                    self.program.modules[module_index].functions[f].blocks[b].statements.len();
                self.pending_calls
                    .push((module_index, f, b, statement_index, name.clone()));
                self.push_statement(
                    f,
                    b,
                    Statement::Call {
                        target,
                        function: FunctionKey::UNRESOLVED,
                        function_name: name,
                        args,
                    },
                );
                Ok(())
            }
            "write" => {
                let output_name = c.string().map_err(|m| self.err(m))?;
                let output = self
                    .module()?
                    .find_output(&output_name)
                    .ok_or_else(|| self.err(format!("unknown output '{output_name}'")))?;
                let index = if c.match_word("none") {
                    None
                } else {
                    Some(self.parse_expr(c)?)
                };
                let value = self.parse_expr(c)?;
                self.push_statement(
                    f,
                    b,
                    Statement::WriteStream {
                        output,
                        index,
                        value,
                    },
                );
                Ok(())
            }
            "read" => {
                let target = self.parse_expr(c)?;
                let input_name = c.string().map_err(|m| self.err(m))?;
                let input = self
                    .module()?
                    .find_input(&input_name)
                    .ok_or_else(|| self.err(format!("unknown input '{input_name}'")))?;
                self.push_statement(f, b, Statement::ReadStream { target, input });
                Ok(())
            }
            "advance" => {
                self.push_statement(f, b, Statement::AdvanceClock);
                Ok(())
            }
            "term" => {
                let terminator = match c.word().map_err(|m| self.err(m))?.as_str() {
                    "branch" => Terminator::Branch(c.integer().map_err(|m| self.err(m))? as usize),
                    "branchif" => {
                        let condition = self.parse_expr(c)?;
                        let true_block = c.integer().map_err(|m| self.err(m))? as usize;
                        let false_block = c.integer().map_err(|m| self.err(m))? as usize;
                        Terminator::BranchIf {
                            condition,
                            true_block,
                            false_block,
                        }
                    }
                    "return" => {
                        if c.at_end() {
                            Terminator::Return(None)
                        } else {
                            Terminator::Return(Some(self.parse_expr(c)?))
                        }
                    }
                    "none" => return Ok(()),
                    other => return Err(self.err(format!("unknown terminator '{other}'"))),
                };
                let module = self.module()?;
                module.functions[f].blocks[b].terminator = Some(terminator);
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    fn push_statement(&mut self, f: usize, b: usize, s: Statement) {
        let module = self.program.modules.last_mut().unwrap();
        module.functions[f].blocks[b].statements.push(s);
    }

    // ── Expressions ──

    fn parse_expr(&mut self, c: &mut Cursor) -> CompileResult<Expr> {
        c.expect(Tok::OpenParen).map_err(|m| self.err(m))?;
        let head = c.word().map_err(|m| self.err(m))?;
        let result = match head.as_str() {
            "const" => {
                let ty = self.parse_type(c)?;
                let value = self.parse_value(c, &ty)?;
                Expr::Constant(value)
            }
            "var" => Expr::Variable(c.integer().map_err(|m| self.err(m))? as usize),
            "sub" => {
                let parent = self.parse_expr(c)?;
                let index = match c.word().map_err(|m| self.err(m))?.as_str() {
                    "fixed" => SubIndex::Fixed(c.integer().map_err(|m| self.err(m))? as u64),
                    "range" => {
                        let start = c.integer().map_err(|m| self.err(m))? as u64;
                        let end = c.integer().map_err(|m| self.err(m))? as u64;
                        let trusted = match c.word().map_err(|m| self.err(m))?.as_str() {
                            "trusted" => true,
                            "unchecked" => false,
                            other => {
                                return Err(self.err(format!("unknown trust marker '{other}'")))
                            }
                        };
                        SubIndex::Range {
                            start,
                            end,
                            trusted,
                        }
                    }
                    "dyn" => SubIndex::Dynamic(Box::new(self.parse_expr(c)?)),
                    other => return Err(self.err(format!("unknown sub-index kind '{other}'"))),
                };
                let suppress = c.match_word("nowrap");
                Expr::SubElement {
                    parent: Box::new(parent),
                    index,
                    suppress_wrap_warning: suppress,
                }
            }
            "cast" => {
                let target = self.parse_type(c)?;
                let source = self.parse_expr(c)?;
                Expr::Cast {
                    target,
                    source: Box::new(source),
                }
            }
            "unary" => {
                let op = match c.symbol().map_err(|m| self.err(m))?.as_str() {
                    "-" => UnaryOp::Negate,
                    "!" => UnaryOp::LogicalNot,
                    "~" => UnaryOp::BitwiseNot,
                    other => return Err(self.err(format!("unknown unary operator '{other}'"))),
                };
                let source = self.parse_expr(c)?;
                Expr::Unary {
                    op,
                    source: Box::new(source),
                }
            }
            "binary" => {
                let symbol = c.symbol().map_err(|m| self.err(m))?;
                let op = binary_op_for_symbol(&symbol)
                    .ok_or_else(|| self.err(format!("unknown binary operator '{symbol}'")))?;
                let result_type = self.parse_type(c)?;
                let lhs = self.parse_expr(c)?;
                let rhs = self.parse_expr(c)?;
                Expr::Binary {
                    op,
                    result_type,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            }
            "prop" => {
                let name = c.word().map_err(|m| self.err(m))?;
                let property = ProcessorProperty::for_name(&name)
                    .ok_or_else(|| self.err(format!("unknown processor property '{name}'")))?;
                Expr::ProcessorProperty(property)
            }
            other => return Err(self.err(format!("unknown expression kind '{other}'"))),
        };
        c.expect(Tok::CloseParen).map_err(|m| self.err(m))?;
        Ok(result)
    }

    // ── Types ──

    fn parse_type(&mut self, c: &mut Cursor) -> CompileResult<Type> {
        // `const T[4]&` nests as Reference(Const(Array)): the const applies
        // to the sized base, the reference wraps the whole thing
        if c.match_word("const") {
            let inner = self.parse_unmodified_type(c)?;
            let mut t = inner.make_const();
            while c.match_tok(&Tok::Ampersand) {
                t = t.make_reference();
            }
            return Ok(t);
        }

        let mut base = self.parse_unmodified_type(c)?;
        while c.match_tok(&Tok::Ampersand) {
            base = base.make_reference();
        }
        Ok(base)
    }

    /// Base type plus vector/array suffixes, but no const/reference.
    fn parse_unmodified_type(&mut self, c: &mut Cursor) -> CompileResult<Type> {
        let word = c.word().map_err(|m| self.err(m))?;
        let mut base = if let Some(struct_name) = word.strip_prefix("struct:") {
            Type::Struct(self.get_or_create_struct(struct_name))
        } else {
            match word.as_str() {
                "void" => Type::void(),
                "bool" => Type::bool(),
                "int32" => Type::int32(),
                "int64" => Type::int64(),
                "float32" => Type::float32(),
                "float64" => Type::float64(),
                "fixed" => Type::Primitive(Primitive::Fixed),
                "string" => Type::StringLiteral,
                "wrap" | "clamp" => {
                    c.expect(Tok::LessThan).map_err(|m| self.err(m))?;
                    let n = c.integer().map_err(|m| self.err(m))? as u64;
                    c.expect(Tok::GreaterThan).map_err(|m| self.err(m))?;
                    if word == "wrap" {
                        Type::Wrap(n)
                    } else {
                        Type::Clamp(n)
                    }
                }
                other => return Err(self.err(format!("unknown type '{other}'"))),
            }
        };

        // suffixes: <N> vector, [N] / [] array
        loop {
            if c.match_tok(&Tok::LessThan) {
                let size = c.integer().map_err(|m| self.err(m))? as u64;
                c.expect(Tok::GreaterThan).map_err(|m| self.err(m))?;
                let element = base
                    .primitive()
                    .ok_or_else(|| self.err("vector element must be primitive"))?;
                base = Type::create_vector(element, size);
            } else if c.match_tok(&Tok::OpenBracket) {
                if c.match_tok(&Tok::CloseBracket) {
                    base = base.create_unsized_array();
                } else {
                    let size = c.integer().map_err(|m| self.err(m))? as u64;
                    c.expect(Tok::CloseBracket).map_err(|m| self.err(m))?;
                    base = base.create_array(size);
                }
            } else {
                break;
            }
        }

        Ok(base)
    }

    // ── Values ──

    fn parse_value(&mut self, c: &mut Cursor, ty: &Type) -> CompileResult<Value> {
        if c.match_tok(&Tok::OpenBrace) {
            let mut elements = Vec::new();
            while !c.match_tok(&Tok::CloseBrace) {
                let element_type = if let Some(s) = ty.struct_ref() {
                    let members = s.members.borrow();
                    members
                        .get(elements.len())
                        .map(|m| m.ty.clone())
                        .ok_or_else(|| self.err("too many struct members"))?
                } else {
                    ty.element_type()
                        .ok_or_else(|| self.err("unexpected aggregate value"))?
                };
                elements.push(self.parse_value(c, &element_type)?);
            }
            return Ok(Value::Aggregate {
                ty: ty.without_modifiers(),
                elements,
            });
        }

        parse_scalar_value(c, ty).map_err(|m| self.err(m))
    }
}

fn parse_bare_value(c: &mut Cursor) -> Result<Value, String> {
    // annotation values carry no explicit type; infer from the token
    match c.peek() {
        Some(Tok::Str(_)) => Ok(Value::String(Rc::from(c.string()?.as_str()))),
        Some(Tok::Word(w)) if w == "true" || w == "false" => {
            let v = w == "true";
            c.advance();
            Ok(Value::Bool(v))
        }
        Some(Tok::Number(_)) => {
            let n = c.number()?;
            if n.contains('.') || n.contains('e') || n.contains("inf") || n.contains("nan") {
                Ok(Value::Float64(parse_float_token(&n)?))
            } else {
                let v: i64 = n.parse().map_err(|_| format!("bad integer '{n}'"))?;
                match i32::try_from(v) {
                    Ok(small) => Ok(Value::Int32(small)),
                    Err(_) => Ok(Value::Int64(v)),
                }
            }
        }
        _ => Err("expected an annotation value".into()),
    }
}

fn parse_scalar_value(c: &mut Cursor, ty: &Type) -> Result<Value, String> {
    match ty.without_modifiers() {
        Type::Primitive(Primitive::Void) => {
            c.match_word("void");
            Ok(Value::Void)
        }
        Type::Primitive(Primitive::Bool) => {
            let w = c.word()?;
            Ok(Value::Bool(w == "true"))
        }
        Type::Primitive(Primitive::Int32) => {
            Ok(Value::Int32(c.number()?.parse().map_err(|_| "bad int32")?))
        }
        Type::Primitive(Primitive::Int64) => {
            Ok(Value::Int64(c.number()?.parse().map_err(|_| "bad int64")?))
        }
        Type::Primitive(Primitive::Float32) => {
            Ok(Value::Float32(parse_float_token(&c.number_or_word()?)? as f32))
        }
        Type::Primitive(Primitive::Float64) => {
            Ok(Value::Float64(parse_float_token(&c.number_or_word()?)?))
        }
        Type::StringLiteral => Ok(Value::String(Rc::from(c.string()?.as_str()))),
        t @ (Type::Wrap(_) | Type::Clamp(_)) => {
            let v: i64 = c.number()?.parse().map_err(|_| "bad bounded int")?;
            Ok(Value::Bounded(t, v))
        }
        other => Err(format!("cannot parse a scalar of type '{other}'")),
    }
}

fn parse_float_token(s: &str) -> Result<f64, String> {
    match s {
        "nan" => Ok(f64::NAN),
        "inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        _ => s.parse().map_err(|_| format!("bad float '{s}'")),
    }
}

fn binary_op_for_symbol(s: &str) -> Option<BinaryOp> {
    Some(match s {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Subtract,
        "*" => BinaryOp::Multiply,
        "/" => BinaryOp::Divide,
        "%" => BinaryOp::Modulo,
        "|" => BinaryOp::BitwiseOr,
        "&" => BinaryOp::BitwiseAnd,
        "^" => BinaryOp::BitwiseXor,
        "<<" => BinaryOp::LeftShift,
        ">>" => BinaryOp::RightShift,
        ">>>" => BinaryOp::RightShiftUnsigned,
        "==" => BinaryOp::Equals,
        "!=" => BinaryOp::NotEquals,
        "<" => BinaryOp::LessThan,
        "<=" => BinaryOp::LessThanOrEqual,
        ">" => BinaryOp::GreaterThan,
        ">=" => BinaryOp::GreaterThanOrEqual,
        _ => return None,
    })
}

// ── Line tokenizer ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Str(String),
    Number(String),
    Symbol(String),
    OpenParen,
    CloseParen,
    OpenBrace,
    CloseBrace,
    OpenBracket,
    CloseBracket,
    LessThan,
    GreaterThan,
    Comma,
    Dot,
    Equals,
    Arrow,
    Times,
    Divide,
    Ampersand,
}

fn tokenize(line: &str) -> Result<Vec<Tok>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            ' ' | '\t' => i += 1,
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    if i >= chars.len() {
                        return Err("unterminated string".into());
                    }
                    match chars[i] {
                        '"' => {
                            i += 1;
                            break;
                        }
                        '\\' => {
                            i += 1;
                            if i >= chars.len() {
                                return Err("bad escape".into());
                            }
                            s.push(match chars[i] {
                                'n' => '\n',
                                'r' => '\r',
                                't' => '\t',
                                '0' => '\0',
                                other => other,
                            });
                            i += 1;
                        }
                        other => {
                            s.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Tok::Str(s));
            }
            '(' => {
                tokens.push(Tok::OpenParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::CloseParen);
                i += 1;
            }
            '{' => {
                tokens.push(Tok::OpenBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Tok::CloseBrace);
                i += 1;
            }
            '[' => {
                tokens.push(Tok::OpenBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Tok::CloseBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Tok::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Tok::Dot);
                i += 1;
            }
            '&' => {
                tokens.push(Tok::Ampersand);
                i += 1;
            }
            '-' => {
                if i + 1 < chars.len() && chars[i + 1] == '>' {
                    tokens.push(Tok::Arrow);
                    i += 2;
                } else if i + 1 < chars.len()
                    && (chars[i + 1].is_ascii_digit() || chars[i + 1] == 'i' || chars[i + 1] == 'n')
                {
                    // negative number, -inf, or -nan
                    let start = i;
                    i += 1;
                    while i < chars.len()
                        && (chars[i].is_ascii_alphanumeric()
                            || chars[i] == '.'
                            || chars[i] == '-'
                            || chars[i] == '+')
                    {
                        i += 1;
                    }
                    tokens.push(Tok::Number(chars[start..i].iter().collect()));
                } else {
                    tokens.push(Tok::Symbol("-".into()));
                    i += 1;
                }
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || chars[i] == '.'
                        || ((chars[i] == '-' || chars[i] == '+')
                            && i > start
                            && (chars[i - 1] == 'e' || chars[i - 1] == 'E')))
                {
                    i += 1;
                }
                tokens.push(Tok::Number(chars[start..i].iter().collect()));
            }
            '=' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Tok::Symbol("==".into()));
                    i += 2;
                } else {
                    tokens.push(Tok::Equals);
                    i += 1;
                }
            }
            '<' => {
                if i + 1 < chars.len() && (chars[i + 1] == '<' || chars[i + 1] == '=') {
                    let symbol = if chars[i + 1] == '<' { "<<" } else { "<=" };
                    tokens.push(Tok::Symbol(symbol.into()));
                    i += 2;
                } else {
                    tokens.push(Tok::LessThan);
                    i += 1;
                }
            }
            '>' => {
                if i + 2 < chars.len() && chars[i + 1] == '>' && chars[i + 2] == '>' {
                    tokens.push(Tok::Symbol(">>>".into()));
                    i += 3;
                } else if i + 1 < chars.len() && (chars[i + 1] == '>' || chars[i + 1] == '=') {
                    let symbol = if chars[i + 1] == '>' { ">>" } else { ">=" };
                    tokens.push(Tok::Symbol(symbol.into()));
                    i += 2;
                } else {
                    tokens.push(Tok::GreaterThan);
                    i += 1;
                }
            }
            '*' => {
                tokens.push(Tok::Times);
                i += 1;
            }
            '/' => {
                tokens.push(Tok::Divide);
                i += 1;
            }
            '!' | '%' | '^' | '~' | '|' => {
                if ch == '!' && i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Tok::Symbol("!=".into()));
                    i += 2;
                } else {
                    tokens.push(Tok::Symbol(ch.to_string()));
                    i += 1;
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '@' || c == '$' || c == '#' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == '@'
                        || chars[i] == '$'
                        || chars[i] == ':'
                        || chars[i] == '='
                        || chars[i] == '#')
                {
                    i += 1;
                }
                tokens.push(Tok::Word(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

struct Cursor<'a> {
    tokens: &'a [Tok],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek_is(&self, t: &Tok) -> bool {
        self.peek() == Some(t)
    }

    fn match_tok(&mut self, t: &Tok) -> bool {
        if self.peek_is(t) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn match_word(&mut self, w: &str) -> bool {
        if let Some(Tok::Word(current)) = self.peek() {
            if current == w {
                self.advance();
                return true;
            }
        }
        false
    }

    fn expect(&mut self, t: Tok) -> Result<(), String> {
        if self.match_tok(&t) {
            Ok(())
        } else {
            Err(format!("expected {t:?}, found {:?}", self.peek()))
        }
    }

    fn word(&mut self) -> Result<String, String> {
        match self.peek() {
            Some(Tok::Word(w)) => {
                let w = w.clone();
                self.advance();
                Ok(w)
            }
            other => Err(format!("expected a word, found {other:?}")),
        }
    }

    fn string(&mut self) -> Result<String, String> {
        match self.peek() {
            Some(Tok::Str(s)) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            other => Err(format!("expected a string, found {other:?}")),
        }
    }

    fn number(&mut self) -> Result<String, String> {
        match self.peek() {
            Some(Tok::Number(n)) => {
                let n = n.clone();
                self.advance();
                Ok(n)
            }
            other => Err(format!("expected a number, found {other:?}")),
        }
    }

    fn number_or_word(&mut self) -> Result<String, String> {
        match self.peek() {
            Some(Tok::Number(n)) => {
                let n = n.clone();
                self.advance();
                Ok(n)
            }
            Some(Tok::Word(w)) => {
                let w = w.clone();
                self.advance();
                Ok(w)
            }
            other => Err(format!("expected a number, found {other:?}")),
        }
    }

    fn integer(&mut self) -> Result<i64, String> {
        let n = self.number()?;
        n.parse().map_err(|_| format!("bad integer '{n}'"))
    }

    fn symbol(&mut self) -> Result<String, String> {
        match self.peek() {
            Some(Tok::Symbol(s)) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            Some(Tok::Times) => {
                self.advance();
                Ok("*".into())
            }
            Some(Tok::Divide) => {
                self.advance();
                Ok("/".into())
            }
            Some(Tok::LessThan) => {
                self.advance();
                Ok("<".into())
            }
            Some(Tok::GreaterThan) => {
                self.advance();
                Ok(">".into())
            }
            Some(Tok::Ampersand) => {
                self.advance();
                Ok("&".into())
            }
            other => Err(format!("expected an operator, found {other:?}")),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_handles_structure() {
        let tokens = tokenize("func \"run\" (var 0) -> void [run]").unwrap();
        assert!(tokens.contains(&Tok::Word("func".into())));
        assert!(tokens.contains(&Tok::Str("run".into())));
        assert!(tokens.contains(&Tok::Arrow));
    }

    #[test]
    fn parse_minimal_program() {
        let text = "#HEART\nmain \"P\"\nprocessor \"P\"\n  output 0 stream (float32) \"out\"\n  func \"run\" () -> void [run]\n    block 0 \"@block_0\"\n      write \"out\" none (const float32 0.0)\n      advance\n      term branch 0\n";
        let program = parse_heart_text(text).unwrap_or_else(|e| panic!("parse failed: {e}"));
        assert_eq!(program.modules.len(), 1);
        let p = &program.modules[0];
        assert_eq!(p.name, "P");
        assert_eq!(p.outputs.len(), 1);
        let run = &p.functions[0];
        assert!(run.is_run_function);
        assert_eq!(run.blocks.len(), 1);
        assert_eq!(run.blocks[0].statements.len(), 2);
        assert!(matches!(
            run.blocks[0].terminator,
            Some(Terminator::Branch(0))
        ));
        assert_eq!(program.main_module, Some(0));
    }

    #[test]
    fn types_round_trip_through_text() {
        use crate::heart::FmtType;
        for t in [
            Type::float32(),
            Type::int64().create_array(8),
            Type::create_vector(crate::types::Primitive::Float64, 4),
            Type::Wrap(16),
            Type::float32().make_const().make_reference(),
            Type::int32().create_unsized_array(),
        ] {
            let text = format!("{}", FmtType(&t));
            let tokens = tokenize(&text).unwrap();
            let mut parser = HeartParser {
                chunk: SourceChunk::new("t", ""),
                program: Program::default(),
                structs: HashMap::new(),
                main_name: None,
                pending_calls: Vec::new(),
                current_function: None,
                current_block: None,
                line_start: 0,
            };
            let mut cursor = Cursor {
                tokens: &tokens,
                pos: 0,
            };
            let parsed = parser.parse_type(&mut cursor).unwrap();
            assert!(
                parsed.is_identical(&t),
                "type {t} did not round-trip (got {parsed})"
            );
        }
    }

    #[test]
    fn negative_and_special_floats() {
        assert_eq!(parse_float_token("-inf").unwrap(), f64::NEG_INFINITY);
        assert!(parse_float_token("nan").unwrap().is_nan());
        assert_eq!(parse_float_token("-2.5").unwrap(), -2.5);
    }
}
