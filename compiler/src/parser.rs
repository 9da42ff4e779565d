// parser.rs — Structural parser for SOUL source
//
// Builds a loosely-typed AST: identifiers stay unresolved, and forms that are
// ambiguous between types and values (`float<2+2>`, `x[n]`) become subscript
// nodes for the resolver to sort out. The parser is hand-written recursive
// descent over the token slice with a save/restore cursor — speculative
// "is this a type?" parsing and the chevron `>` suppression counter need
// direct control of the cursor.
//
// Compound assignments are rewritten to plain assignments, and short-circuit
// `&&`/`||` to ternaries, so later passes see only the core node set.
//
// Preconditions: token stream from `lexer::lex`.
// Postconditions: returns module ids appended to the parent namespace.
// Failure modes: any syntax error is fatal with a location.
// Side effects: allocates into the Arena; sets scope back-pointers.

use std::rc::Rc;

use crate::ast::*;
use crate::diag::{Category, CompileResult, Diagnostic, Location, SourceChunk, Span};
use crate::intrinsics::Intrinsic;
use crate::lexer::{lex, Token};
use crate::types::{BinaryOp, Type, UnaryOp, Value};

// ── Token stream ─────────────────────────────────────────────────────────

/// Token cursor with save/restore, for speculative parses.
pub struct TokenStream {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    chunk: Rc<SourceChunk>,
}

impl TokenStream {
    pub fn new(chunk: Rc<SourceChunk>) -> CompileResult<TokenStream> {
        let tokens = lex(&chunk)?;
        Ok(TokenStream {
            tokens,
            pos: 0,
            chunk,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn current_span(&self) -> Span {
        match self.tokens.get(self.pos) {
            Some((_, s)) => *s,
            None => {
                let end = self.chunk.text.len();
                Span::new(end, end)
            }
        }
    }

    fn location(&self) -> Location {
        Location::new(self.chunk.clone(), self.current_span())
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn matches(&self, t: &Token) -> bool {
        match self.peek() {
            Some(current) => std::mem::discriminant(current) == std::mem::discriminant(t),
            None => false,
        }
    }

    fn match_if(&mut self, t: &Token) -> bool {
        if self.matches(t) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn save(&self) -> usize {
        self.pos
    }

    fn restore(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Seek to the first token at or after a byte offset (clone-by-reparse).
    fn seek_to_offset(&mut self, offset: usize) {
        self.pos = self
            .tokens
            .iter()
            .position(|(_, s)| s.start >= offset)
            .unwrap_or(self.tokens.len());
    }

    /// Text of the current token.
    fn token_text(&self) -> &str {
        let span = self.current_span();
        &self.chunk.text[span.start..span.end.min(self.chunk.text.len())]
    }

    /// Splits a `]]` token into two `]`s, consuming the first. Needed for
    /// nested subscripts like `a[b[i]]`, which the lexer reads as `]]`.
    fn match_and_split_close_double_bracket(&mut self) -> bool {
        if self.matches(&Token::CloseDoubleBracket) {
            let span = self.current_span();
            self.tokens[self.pos] = (Token::CloseBracket, Span::new(span.start + 1, span.end));
            true
        } else {
            false
        }
    }
}

// ── Parse-type context ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseTypeContext {
    VariableType,
    NameOrType,
    FunctionParameter,
    EventType,
    StructMember,
    UsingDeclTarget,
    ProcessorParameter,
    MetaFunctionArgument,
}

// ── Parser ───────────────────────────────────────────────────────────────

pub struct Parser<'a> {
    arena: &'a mut Arena,
    stream: TokenStream,
    current_scope: ScopeId,
    current_module: Option<ModuleId>,
    current_block: Option<BlockId>,
    ignore_greater_than: u32,
    override_name: Option<Name>,
}

/// Parses the top-level declarations of one source chunk into a namespace.
pub fn parse_top_level_declarations(
    arena: &mut Arena,
    chunk: Rc<SourceChunk>,
    parent_namespace: ModuleId,
) -> CompileResult<Vec<ModuleId>> {
    let stream = TokenStream::new(chunk)?;
    let scope = arena.module(parent_namespace).scope;
    let mut parser = Parser {
        arena,
        stream,
        current_scope: scope,
        current_module: Some(parent_namespace),
        current_block: None,
        ignore_greater_than: 0,
        override_name: None,
    };
    let mut new_modules = Vec::new();
    while !parser.stream.at_end() {
        new_modules.push(parser.parse_top_level_decl(parent_namespace)?);
    }
    Ok(new_modules)
}

/// Re-parses a processor/graph declaration from its recorded source range,
/// appending a clone with a fresh name to `parent_namespace`. This is the
/// specialiser's cloning mechanism: the original text runs through the
/// parser again so every scope pointer lands in the right place.
pub fn clone_processor_with_new_name(
    arena: &mut Arena,
    source_module: ModuleId,
    parent_namespace: ModuleId,
    new_name: &str,
) -> CompileResult<ModuleId> {
    let range = arena
        .module(source_module)
        .source_range
        .clone()
        .expect("internal: module has no source range to clone from");

    let mut stream = TokenStream::new(range.chunk.clone())?;
    stream.seek_to_offset(range.span.start);

    let scope = arena.module(parent_namespace).scope;
    let name = arena.interner.get(new_name);
    let mut parser = Parser {
        arena,
        stream,
        current_scope: scope,
        current_module: Some(parent_namespace),
        current_block: None,
        ignore_greater_than: 0,
        override_name: Some(name),
    };
    parser.parse_top_level_decl(parent_namespace)
}

/// Re-parses a function declaration from its recorded source range into the
/// module that owns it (generic specialisation cloning).
pub fn clone_function(arena: &mut Arena, source_function: FunctionId) -> CompileResult<FunctionId> {
    let range = arena
        .function(source_function)
        .source_range
        .clone()
        .expect("internal: function has no source range to clone from");

    let module = arena
        .enclosing_module(arena.function(source_function).scope)
        .expect("internal: function without an enclosing module");
    arena.module_mut(module).is_fully_resolved = false;

    let mut stream = TokenStream::new(range.chunk.clone())?;
    stream.seek_to_offset(range.span.start);

    let scope = arena.module(module).scope;
    let mut parser = Parser {
        arena,
        stream,
        current_scope: scope,
        current_module: Some(module),
        current_block: None,
        ignore_greater_than: 0,
        override_name: None,
    };
    let before = parser.arena.module(module).functions.len();
    parser.parse_function_or_state_variable()?;
    let functions = &parser.arena.module(module).functions;
    assert_eq!(functions.len(), before + 1);
    Ok(*functions.last().unwrap())
}

impl<'a> Parser<'a> {
    // ── Small helpers ──

    fn error(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(Category::Parse, self.stream.location(), message)
    }

    fn error_at(&self, location: Location, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(Category::Parse, location, message)
    }

    fn context(&self) -> Context {
        Context {
            location: self.stream.location(),
            scope: self.current_scope,
        }
    }

    fn expect(&mut self, t: &Token) -> CompileResult<()> {
        if self.stream.match_if(t) {
            Ok(())
        } else {
            let found = match self.stream.peek() {
                Some(tok) => format!("found {tok}"),
                None => "found end of input".to_string(),
            };
            Err(self.error(format!("expected {t}, {found}")))
        }
    }

    fn expect_semicolon(&mut self) -> CompileResult<()> {
        self.expect(&Token::Semicolon)
    }

    fn give_error_on_semicolon(&mut self) -> CompileResult<()> {
        if self.stream.matches(&Token::Semicolon) {
            return Err(self.error("a semicolon is not needed after a closing brace"));
        }
        Ok(())
    }

    fn give_error_on_external_keyword(&mut self) -> CompileResult<()> {
        if self.stream.matches(&Token::External) {
            return Err(self.error("'external' is only allowed on state variables"));
        }
        Ok(())
    }

    fn give_error_on_reserved_word(&mut self) -> CompileResult<()> {
        if self.stream.matches(&Token::Reserved) {
            return Err(self.error(format!(
                "'{}' is a reserved word",
                self.stream.token_text()
            )));
        }
        Ok(())
    }

    fn parse_identifier(&mut self) -> CompileResult<Name> {
        self.give_error_on_reserved_word()?;
        if !self.stream.matches(&Token::Identifier) {
            return Err(self.error(format!(
                "expected an identifier, found {}",
                self.stream
                    .peek()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "end of input".into())
            )));
        }
        let text = self.stream.token_text().to_string();
        self.stream.advance();
        Ok(self.arena.interner.get(&text))
    }

    fn parse_identifier_with_max_length(&mut self) -> CompileResult<Name> {
        if self.stream.matches(&Token::Identifier)
            && self.stream.token_text().len() > MAX_IDENTIFIER_LENGTH
        {
            return Err(self.error(format!(
                "name exceeds the maximum length of {MAX_IDENTIFIER_LENGTH} characters"
            )));
        }
        self.parse_identifier()
    }

    fn parse_qualified_identifier(&mut self) -> CompileResult<ExprId> {
        let context = self.context();
        let mut parts = vec![self.parse_identifier()?];
        while self.stream.match_if(&Token::DoubleColon) {
            parts.push(self.parse_identifier()?);
        }
        Ok(self
            .arena
            .alloc_expr(ExprKind::QualifiedIdentifier(Path { parts }), context))
    }

    fn alloc_expr(&mut self, kind: ExprKind, context: Context) -> ExprId {
        self.arena.alloc_expr(kind, context)
    }

    fn noop(&mut self) -> StmtId {
        let context = self.context();
        self.arena.alloc_stmt(StmtKind::Noop, context)
    }

    // ── Top-level declarations ──

    fn parse_top_level_decl(&mut self, parent: ModuleId) -> CompileResult<ModuleId> {
        self.parse_imports(parent)?;

        if self.stream.match_if(&Token::Processor) {
            return self.parse_module_decl(parent, ModuleKind::Processor);
        }
        if self.stream.match_if(&Token::Graph) {
            return self.parse_module_decl(parent, ModuleKind::Graph);
        }
        if self.stream.match_if(&Token::Namespace) {
            return self.parse_module_decl(parent, ModuleKind::Namespace);
        }
        if self.stream.matches(&Token::Import) {
            return Err(self.error("import statements can only appear at the start of a namespace"));
        }

        Err(self.error("expected a processor, graph, or namespace declaration"))
    }

    fn parse_imports(&mut self, parent: ModuleId) -> CompileResult<()> {
        while self.stream.match_if(&Token::Import) {
            let location = self.stream.location();
            let import = if self.stream.matches(&Token::StringLiteral(std::string::String::new())) {
                let text = match self.stream.peek() {
                    Some(Token::StringLiteral(s)) => s.clone(),
                    _ => unreachable!(),
                };
                self.stream.advance();
                text
            } else if self.stream.matches(&Token::Identifier) {
                let mut name = self.stream.token_text().to_string();
                self.stream.advance();
                while self.stream.match_if(&Token::Dot) {
                    name.push('.');
                    name.push_str(self.stream.token_text());
                    self.expect(&Token::Identifier)?;
                }
                name
            } else {
                return Err(self.error("expected a module name to import"));
            };

            self.expect_semicolon()?;
            let module = self.arena.module_mut(parent);
            if !module.imports.contains(&import) {
                module.imports.push(import);
            }
            return Err(self.error_at(location, "not yet implemented: import statements"));
        }
        Ok(())
    }

    fn parse_module_decl(&mut self, parent: ModuleId, kind: ModuleKind) -> CompileResult<ModuleId> {
        // The span starts at the decl keyword (one token back), so the
        // specialiser can re-parse the whole declaration.
        let keyword_start = self
            .stream
            .tokens
            .get(self.stream.pos.saturating_sub(1))
            .map(|(_, s)| s.start)
            .unwrap_or(0);

        let context = self.context();
        let mut name = self.parse_identifier_with_max_length()?;

        if let Some(override_name) = self.override_name.take() {
            name = override_name;
        }

        let scope = self.arena.alloc_scope(ScopeKind::Module(ModuleId(0)), Some(self.current_scope));
        let module_id = self.arena.alloc_module(Module {
            kind,
            name,
            context: context.clone(),
            scope,
            sub_modules: Vec::new(),
            functions: Vec::new(),
            structs: Vec::new(),
            usings: Vec::new(),
            aliases: Vec::new(),
            state_variables: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            instances: Vec::new(),
            connections: Vec::new(),
            specialisation_params: Vec::new(),
            annotation: Annotation::default(),
            imports: Vec::new(),
            is_fully_resolved: false,
            is_specialised_clone: false,
            source_range: None,
        });
        self.arena.scopes[scope.index()].kind = ScopeKind::Module(module_id);
        self.arena.module_mut(parent).sub_modules.push(module_id);

        let old_scope = self.current_scope;
        let old_module = self.current_module;
        self.current_scope = scope;
        self.current_module = Some(module_id);

        // `namespace a::b { … }` shorthand nests a fresh namespace.
        if kind == ModuleKind::Namespace && self.stream.match_if(&Token::DoubleColon) {
            self.parse_module_decl(module_id, ModuleKind::Namespace)?;
        } else {
            self.parse_module_contents(module_id, kind)?;
        }

        self.current_scope = old_scope;
        self.current_module = old_module;

        let end = self
            .stream
            .tokens
            .get(self.stream.pos.saturating_sub(1))
            .map(|(_, s)| s.end)
            .unwrap_or(keyword_start);
        self.arena.module_mut(module_id).source_range = Some(Location::new(
            self.stream.chunk.clone(),
            Span::new(keyword_start, end),
        ));

        self.give_error_on_semicolon()?;
        Ok(module_id)
    }

    fn parse_module_contents(&mut self, module: ModuleId, kind: ModuleKind) -> CompileResult<()> {
        if kind != ModuleKind::Namespace {
            self.parse_specialisation_parameters(module)?;
            let annotation = self.parse_annotation()?;
            self.arena.module_mut(module).annotation = annotation;
        }

        self.expect(&Token::OpenBrace)?;

        if kind == ModuleKind::Graph {
            loop {
                if self.parse_endpoint_decl(module)? {
                    continue;
                }
                if self.parse_processor_instance_list(module)? {
                    continue;
                }
                if self.parse_connection_list(module)? {
                    continue;
                }
                break;
            }
            self.expect(&Token::CloseBrace)?;
            return Ok(());
        }

        if kind == ModuleKind::Processor {
            while self.parse_endpoint_decl(module)? {}
        }

        if kind == ModuleKind::Namespace {
            self.parse_namespace_imports(module)?;
        }

        while !self.stream.match_if(&Token::CloseBrace) {
            if self.stream.at_end() {
                return Err(self.error("expected '}'"));
            }
            if self.stream.match_if(&Token::Struct) {
                self.parse_struct_declaration(module)?;
            } else if self.stream.match_if(&Token::Using) {
                self.parse_using_declaration(module)?;
            } else if self.stream.match_if(&Token::Namespace) {
                if kind != ModuleKind::Namespace {
                    return Err(self.error("namespaces can only be declared inside a namespace"));
                }
                self.parse_module_decl(module, ModuleKind::Namespace)?;
            } else if self.stream.match_if(&Token::Processor) {
                if kind != ModuleKind::Namespace {
                    return Err(self.error("processors can only be declared inside a namespace"));
                }
                self.parse_module_decl(module, ModuleKind::Processor)?;
            } else if self.stream.match_if(&Token::Graph) {
                if kind != ModuleKind::Namespace {
                    return Err(self.error("graphs can only be declared inside a namespace"));
                }
                self.parse_module_decl(module, ModuleKind::Graph)?;
            } else if self.stream.match_if(&Token::Let) {
                self.parse_top_level_let_or_var(module, true)?;
            } else if self.stream.match_if(&Token::Var) {
                self.parse_top_level_let_or_var(module, false)?;
            } else if self.stream.match_if(&Token::Event) {
                self.parse_event_function(module, kind)?;
            } else if self.stream.matches(&Token::Input) || self.stream.matches(&Token::Output) {
                if kind == ModuleKind::Namespace {
                    return Err(self.error("a namespace cannot contain endpoint declarations"));
                }
                return Err(self.error("endpoint declarations must be at the start of the processor"));
            } else if self.stream.matches(&Token::Import) {
                return Err(
                    self.error("import statements can only appear at the start of a namespace")
                );
            } else {
                self.parse_function_or_state_variable()?;
            }
        }

        Ok(())
    }

    fn parse_namespace_imports(&mut self, module: ModuleId) -> CompileResult<()> {
        if self.stream.matches(&Token::Import) {
            self.parse_imports(module)?;
        }
        Ok(())
    }

    // ── Specialisation parameters ──

    fn parse_specialisation_parameters(&mut self, module: ModuleId) -> CompileResult<()> {
        if !self.stream.match_if(&Token::OpenParen) {
            return Ok(());
        }
        if self.stream.match_if(&Token::CloseParen) {
            return Ok(());
        }

        loop {
            if self.stream.match_if(&Token::Using) {
                if self.arena.module(module).is_graph() {
                    return Err(self.error("graphs cannot have 'using' specialisation parameters"));
                }
                let context = self.context();
                let name = self.parse_identifier()?;
                let using = self.arena.alloc_using(UsingDecl {
                    name,
                    context,
                    target: None,
                });
                self.arena.module_mut(module).usings.push(using);
                self.arena
                    .module_mut(module)
                    .specialisation_params
                    .push(SpecialisationParam::UsingType(using));
            } else if self.stream.match_if(&Token::Processor) {
                if !self.arena.module(module).is_graph() {
                    return Err(
                        self.error("only graphs may take processor specialisation parameters")
                    );
                }
                let context = self.context();
                let name = self.parse_identifier()?;
                let alias = self.arena.alloc_alias(ProcessorAlias {
                    name,
                    context,
                    target: None,
                });
                self.arena.module_mut(module).aliases.push(alias);
                self.arena
                    .module_mut(module)
                    .specialisation_params
                    .push(SpecialisationParam::ProcessorAlias(alias));
            } else {
                self.give_error_on_external_keyword()?;
                let param_type = self.parse_type(ParseTypeContext::ProcessorParameter)?;
                let context = self.context();
                let name = self.parse_identifier()?;
                let var = self.arena.alloc_var(VarDecl {
                    name,
                    context,
                    declared_type: Some(param_type),
                    initial_value: None,
                    is_external: false,
                    is_const: true,
                    is_function_parameter: false,
                    annotation: Annotation::default(),
                    num_reads: 0,
                    num_writes: 0,
                    generated: None,
                });
                self.arena
                    .module_mut(module)
                    .specialisation_params
                    .push(SpecialisationParam::Value(var));
            }

            if !self.stream.match_if(&Token::Comma) {
                break;
            }
        }

        self.expect(&Token::CloseParen)
    }

    // ── Endpoints ──

    fn parse_endpoint_decl(&mut self, module: ModuleId) -> CompileResult<bool> {
        let is_input = if self.stream.match_if(&Token::Input) {
            true
        } else if self.stream.match_if(&Token::Output) {
            false
        } else {
            return Ok(false);
        };

        if self.stream.match_if(&Token::OpenBrace) {
            while !self.stream.match_if(&Token::CloseBrace) {
                let kind = self.parse_endpoint_kind()?;
                self.parse_endpoints_of_kind(module, is_input, kind)?;
            }
        } else {
            let kind = self.parse_endpoint_kind()?;
            if self.stream.match_if(&Token::OpenBrace) {
                while !self.stream.match_if(&Token::CloseBrace) {
                    self.parse_endpoints_of_kind(module, is_input, kind)?;
                }
            } else {
                self.parse_endpoints_of_kind(module, is_input, kind)?;
            }
        }

        Ok(true)
    }

    fn parse_endpoint_kind(&mut self) -> CompileResult<EndpointKind> {
        if self.stream.match_if(&Token::Event) {
            return Ok(EndpointKind::Event);
        }
        if self.stream.matches(&Token::Identifier) {
            let kind = match self.stream.token_text() {
                "stream" => Some(EndpointKind::Stream),
                "value" => Some(EndpointKind::Value),
                _ => None,
            };
            if let Some(kind) = kind {
                self.stream.advance();
                return Ok(kind);
            }
        }
        Err(self.error("expected 'stream', 'value', or 'event'"))
    }

    fn parse_endpoints_of_kind(
        &mut self,
        module: ModuleId,
        is_input: bool,
        kind: EndpointKind,
    ) -> CompileResult<()> {
        let type_location = self.stream.location();
        let sample_types = self.parse_endpoint_type_list()?;

        if kind != EndpointKind::Event && sample_types.len() > 1 {
            return Err(self.error_at(
                type_location,
                "only event endpoints may declare multiple types",
            ));
        }

        let first = self.parse_one_endpoint_name(module, is_input, kind, sample_types.clone())?;
        let shared_types = self.arena.endpoint(first).sample_types.clone();

        while self.stream.match_if(&Token::Comma) {
            self.parse_one_endpoint_name(module, is_input, kind, shared_types.clone())?;
        }

        self.expect_semicolon()
    }

    fn parse_one_endpoint_name(
        &mut self,
        module: ModuleId,
        is_input: bool,
        kind: EndpointKind,
        sample_types: Vec<ExprId>,
    ) -> CompileResult<EndpointId> {
        let context = self.context();
        let name = self.parse_identifier_with_max_length()?;

        let array_size = if self.stream.match_if(&Token::OpenBracket) {
            let size = self.parse_expression(false)?;
            self.expect(&Token::CloseBracket)?;
            Some(size)
        } else {
            None
        };

        let annotation = self.parse_annotation()?;

        let endpoint = self.arena.alloc_endpoint(EndpointDecl {
            name,
            context,
            is_input,
            kind,
            sample_types,
            array_size,
            annotation,
        });

        let module = self.arena.module_mut(module);
        if is_input {
            module.inputs.push(endpoint);
        } else {
            module.outputs.push(endpoint);
        }
        Ok(endpoint)
    }

    fn parse_endpoint_type_list(&mut self) -> CompileResult<Vec<ExprId>> {
        let mut result = Vec::new();
        if self.stream.match_if(&Token::OpenParen) {
            loop {
                result.push(self.parse_type(ParseTypeContext::EventType)?);
                if self.stream.match_if(&Token::CloseParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        } else {
            result.push(self.parse_type(ParseTypeContext::EventType)?);
        }
        Ok(result)
    }

    // ── Graph members ──

    fn parse_processor_instance_list(&mut self, module: ModuleId) -> CompileResult<bool> {
        if !self.stream.match_if(&Token::Let) {
            return Ok(false);
        }
        if self.stream.match_if(&Token::OpenBrace) {
            while !self.stream.match_if(&Token::CloseBrace) {
                self.parse_processor_instance(module)?;
            }
        } else {
            self.parse_processor_instance(module)?;
        }
        Ok(true)
    }

    fn parse_connection_list(&mut self, module: ModuleId) -> CompileResult<bool> {
        if !self.stream.match_if(&Token::Connection) {
            return Ok(false);
        }
        if self.stream.match_if(&Token::OpenBrace) {
            while !self.stream.match_if(&Token::CloseBrace) {
                self.parse_connection(module)?;
            }
        } else {
            self.parse_connection(module)?;
        }
        Ok(true)
    }

    fn parse_processor_instance(&mut self, module: ModuleId) -> CompileResult<()> {
        let context = self.context();
        let name_location = self.stream.location();
        let instance_name = self.parse_qualified_identifier()?;

        if let ExprKind::QualifiedIdentifier(path) = &self.arena.expr(instance_name).kind {
            if !path.is_unqualified() {
                return Err(self.error_at(
                    name_location.clone(),
                    "a processor instance name cannot be qualified",
                ));
            }
            let path = path.clone();
            for existing in &self.arena.module(module).instances.clone() {
                let other = self.arena.instance(*existing).instance_name;
                if let ExprKind::QualifiedIdentifier(other_path) = &self.arena.expr(other).kind {
                    if *other_path == path {
                        return Err(self.error_at(
                            name_location,
                            format!(
                                "the name '{}' is already in use",
                                path.to_string(&self.arena.interner)
                            ),
                        ));
                    }
                }
            }
        }

        self.expect(&Token::Assign)?;
        let target_processor = self.parse_qualified_identifier()?;

        let array_size = if self.stream.match_if(&Token::OpenBracket) {
            let e = self.parse_expression(false)?;
            self.expect(&Token::CloseBracket)?;
            Some(e)
        } else {
            None
        };

        let mut specialisation_args = Vec::new();
        if self.stream.match_if(&Token::OpenParen) {
            if !self.stream.match_if(&Token::CloseParen) {
                loop {
                    specialisation_args.push(self.parse_specialisation_value_or_type()?);
                    if self.stream.match_if(&Token::CloseParen) {
                        break;
                    }
                    self.expect(&Token::Comma)?;
                }
            }
        }

        let mut clock_multiplier_ratio = None;
        let mut clock_divider_ratio = None;
        if self.stream.match_if(&Token::Times) {
            clock_multiplier_ratio = Some(self.parse_expression(false)?);
        } else if self.stream.match_if(&Token::Divide) {
            clock_divider_ratio = Some(self.parse_expression(false)?);
        }

        self.expect_semicolon()?;

        let instance = self.arena.alloc_instance(ProcessorInstance {
            context,
            instance_name,
            target_processor,
            array_size,
            specialisation_args,
            clock_multiplier_ratio,
            clock_divider_ratio,
            was_created_implicitly: false,
            resolved_target: None,
        });
        self.arena.module_mut(module).instances.push(instance);
        Ok(())
    }

    fn parse_specialisation_value_or_type(&mut self) -> CompileResult<ExprId> {
        let start = self.stream.save();
        if let Some(t) = self.try_parsing_type(ParseTypeContext::UsingDeclTarget)? {
            if !self.stream.matches(&Token::OpenParen) {
                return Ok(t);
            }
        }
        self.stream.restore(start);
        self.parse_expression(false)
    }

    fn parse_connection(&mut self, module: ModuleId) -> CompileResult<()> {
        let interpolation = self.parse_optional_interpolation_type()?;
        let mut context = self.context();

        let mut sources = Vec::new();
        let mut delay_length = None;

        loop {
            sources.push(self.parse_connection_identifier()?);
            if self.stream.match_if(&Token::Comma) {
                continue;
            }
            context = self.context();
            self.expect(&Token::RightArrow)?;
            delay_length = self.parse_delay_length()?;
            break;
        }

        let mut dests = Vec::new();
        loop {
            dests.push(self.parse_connection_identifier()?);
            if self.stream.match_if(&Token::Comma) {
                continue;
            }
            self.expect_semicolon()?;
            break;
        }

        if sources.len() > 1 && dests.len() > 1 {
            return Err(self.error_at(
                context.location,
                "not yet implemented: many-to-many connections",
            ));
        }

        for source in &sources {
            for dest in &dests {
                let connection = self.arena.alloc_connection(Connection {
                    context: Context {
                        location: self.stream.location(),
                        scope: self.current_scope,
                    },
                    interpolation,
                    source: source.clone(),
                    dest: dest.clone(),
                    delay_length,
                });
                self.arena.module_mut(module).connections.push(connection);
            }
        }
        Ok(())
    }

    fn parse_optional_interpolation_type(&mut self) -> CompileResult<InterpolationType> {
        if !self.stream.match_if(&Token::OpenBracket) {
            return Ok(InterpolationType::None);
        }
        if !self.stream.matches(&Token::Identifier) {
            return Err(self.error("expected an interpolation type"));
        }
        let interpolation = InterpolationType::for_name(self.stream.token_text())
            .ok_or_else(|| self.error("expected an interpolation type (linear, sinc, or fast)"))?;
        self.stream.advance();
        self.expect(&Token::CloseBracket)?;
        Ok(interpolation)
    }

    /// An optional `[delay] ->` between the arrow and the destinations.
    fn parse_delay_length(&mut self) -> CompileResult<Option<ExprId>> {
        if self.stream.match_if(&Token::OpenBracket) {
            let e = self.parse_expression(false)?;
            self.expect(&Token::CloseBracket)?;
            self.expect(&Token::RightArrow)?;
            return Ok(Some(e));
        }
        Ok(None)
    }

    fn parse_connection_identifier(&mut self) -> CompileResult<NameAndChannel> {
        if !self.stream.matches(&Token::Identifier) {
            return Err(self.error("expected a processor name or endpoint"));
        }

        let processor_name = self.parse_qualified_identifier()?;

        if self.stream.match_if(&Token::OpenBracket) {
            let location = self.stream.location();
            self.parse_expression(false)?;
            self.expect(&Token::CloseBracket)?;
            return Err(self.error_at(location, "not yet implemented: processor indexes"));
        }

        let result = if self.stream.match_if(&Token::Dot) {
            let channel_location = self.stream.location();
            let channel = self.parse_identifier()?;
            NameAndChannel {
                processor_name: Some(processor_name),
                channel,
                channel_location,
            }
        } else {
            // A bare name is this graph's own endpoint; a qualifier there
            // is an error.
            let (path, location) = match &self.arena.expr(processor_name).kind {
                ExprKind::QualifiedIdentifier(p) => {
                    (p.clone(), self.arena.expr_location(processor_name))
                }
                _ => unreachable!(),
            };
            if !path.is_unqualified() {
                return Err(self.error_at(location.clone(), "qualifiers are not allowed on a channel name"));
            }
            NameAndChannel {
                processor_name: None,
                channel: path.first(),
                channel_location: location,
            }
        };

        if self.stream.match_if(&Token::OpenBracket) {
            let location = self.stream.location();
            self.parse_expression(false)?;
            self.expect(&Token::CloseBracket)?;
            return Err(self.error_at(location, "not yet implemented: channel indexes"));
        }

        Ok(result)
    }

    // ── Annotations ──

    fn parse_annotation(&mut self) -> CompileResult<Annotation> {
        let mut annotation = Annotation::default();

        if self.stream.match_if(&Token::OpenDoubleBracket) {
            if self.stream.match_if(&Token::CloseDoubleBracket) {
                return Ok(annotation);
            }
            loop {
                let key_location = self.stream.location();
                let key = self.parse_annotation_key()?;
                if key.len() > MAX_IDENTIFIER_LENGTH {
                    return Err(self.error_at(key_location, "annotation key is too long"));
                }

                let value = if self.stream.match_if(&Token::Colon) {
                    self.parse_expression(false)?
                } else {
                    let context = self.context();
                    self.alloc_expr(ExprKind::Constant(Value::Bool(true)), context)
                };

                annotation.properties.push(AnnotationProperty {
                    key,
                    key_location,
                    value,
                });

                if !self.stream.match_if(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::CloseDoubleBracket)?;
        }

        Ok(annotation)
    }

    fn parse_annotation_key(&mut self) -> CompileResult<String> {
        match self.stream.peek() {
            Some(Token::StringLiteral(s)) => {
                let key = s.clone();
                self.stream.advance();
                Ok(key)
            }
            Some(Token::Identifier) => {
                let key = self.stream.token_text().to_string();
                self.stream.advance();
                Ok(key)
            }
            // keywords are legal annotation keys
            Some(t) if is_keyword(t) => {
                let key = self.stream.token_text().to_string();
                self.stream.advance();
                Ok(key)
            }
            _ => Err(self.error("expected an annotation key")),
        }
    }

    // ── Structs / usings / variables ──

    fn parse_struct_declaration(&mut self, module: ModuleId) -> CompileResult<()> {
        let context = self.context();
        let name = self.parse_identifier()?;
        self.expect(&Token::OpenBrace)?;

        let structure = crate::types::StructType::new(self.arena.name(name).to_string());
        let mut member_types = Vec::new();
        let mut member_names = Vec::new();

        while !self.stream.match_if(&Token::CloseBrace) {
            let member_type = self.parse_type(ParseTypeContext::StructMember)?;
            loop {
                member_types.push(member_type);
                member_names.push(self.parse_identifier()?);
                if self.stream.match_if(&Token::Comma) {
                    continue;
                }
                self.expect_semicolon()?;
                break;
            }
        }

        let decl = self.arena.alloc_struct(StructDecl {
            name,
            context,
            structure,
            member_types,
            member_names,
            members_resolved: false,
        });
        self.arena.module_mut(module).structs.push(decl);
        self.give_error_on_semicolon()
    }

    fn parse_using_declaration(&mut self, module: ModuleId) -> CompileResult<()> {
        let context = self.context();
        let name = self.parse_identifier()?;
        self.expect(&Token::Assign)?;
        let target = self.parse_type(ParseTypeContext::UsingDeclTarget)?;
        self.expect_semicolon()?;
        let using = self.arena.alloc_using(UsingDecl {
            name,
            context,
            target: Some(target),
        });
        self.arena.module_mut(module).usings.push(using);
        Ok(())
    }

    fn parse_top_level_let_or_var(&mut self, module: ModuleId, is_const: bool) -> CompileResult<()> {
        loop {
            let context = self.context();
            let name = self.parse_identifier()?;
            self.expect(&Token::Assign)?;
            let initial_value = self.parse_expression(false)?;

            if !self.arena.is_possibly_value(initial_value) {
                return Err(self.error_at(
                    self.arena.expr_location(initial_value),
                    "expected a value",
                ));
            }

            let var = self.arena.alloc_var(VarDecl {
                name,
                context,
                declared_type: None,
                initial_value: Some(initial_value),
                is_external: false,
                is_const,
                is_function_parameter: false,
                annotation: Annotation::default(),
                num_reads: 0,
                num_writes: 0,
                generated: None,
            });
            self.arena.module_mut(module).state_variables.push(var);

            if self.stream.match_if(&Token::Semicolon) {
                return Ok(());
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn parse_function_or_state_variable(&mut self) -> CompileResult<()> {
        let module = self
            .current_module
            .expect("internal: no module for function/state variable");
        let decl_location = self.stream.location();
        let is_external = self.stream.match_if(&Token::External);

        let decl_type = match self.try_parsing_type(ParseTypeContext::VariableType)? {
            Some(t) => t,
            None => {
                return Err(
                    self.error_at(decl_location, "expected a function or variable declaration")
                )
            }
        };

        let name_context = self.context();
        let name = self.parse_identifier()?;

        let mut generic_wildcards = Vec::new();
        if self.stream.match_if(&Token::LessThan) {
            generic_wildcards = self.parse_generic_wildcard_list()?;
        }

        if self.stream.match_if(&Token::OpenParen) {
            if is_external {
                return Err(self.error_at(decl_location, "functions cannot be declared 'external'"));
            }
            if self.arena.module(module).is_graph() {
                return Err(self.error_at(decl_location, "functions are not allowed in a graph"));
            }
            let f = self.parse_function_declaration(
                decl_location,
                decl_type,
                name,
                name_context,
                generic_wildcards,
            )?;
            self.arena.module_mut(module).functions.push(f);
            return Ok(());
        }

        if !generic_wildcards.is_empty() {
            return Err(self.error("expected '(' after the generic wildcard list"));
        }

        if is_external && self.arena.constness(decl_type) == Constness::DefinitelyConst {
            return Err(self.error_at(
                decl_location,
                "external declarations do not need the 'const' keyword",
            ));
        }

        if self.arena.module(module).is_graph() {
            return Err(self.error_at(decl_location, "variables are not allowed in a graph"));
        }

        self.parse_variable_declaration(module, decl_type, name, is_external, name_context)
    }

    fn parse_variable_declaration(
        &mut self,
        module: ModuleId,
        declared_type: ExprId,
        first_name: Name,
        is_external: bool,
        first_context: Context,
    ) -> CompileResult<()> {
        let mut name = first_name;
        let mut context = first_context;

        loop {
            if let Some(t) = self.arena.resolve_as_type(declared_type) {
                if t.is_void() {
                    return Err(self.error_at(
                        self.arena.expr_location(declared_type),
                        "variables cannot be void",
                    ));
                }
            }

            let mut is_const = self.arena.constness(declared_type) == Constness::DefinitelyConst;
            let mut initial_value = None;

            if self.stream.match_if(&Token::Assign) {
                if is_external {
                    return Err(self.error(
                        "external variables cannot have an initialiser; their values are provided at link time",
                    ));
                }
                let e = self.parse_expression(false)?;
                initial_value = Some(self.parse_suffixes(e)?);
            } else {
                is_const = is_const || is_external;
            }

            let var = self.arena.alloc_var(VarDecl {
                name,
                context,
                declared_type: Some(declared_type),
                initial_value,
                is_external,
                is_const,
                is_function_parameter: false,
                annotation: Annotation::default(),
                num_reads: 0,
                num_writes: 0,
                generated: None,
            });

            let annotation = self.parse_annotation()?;
            self.arena.var_mut(var).annotation = annotation;

            if let Some(block) = self.current_block {
                let stmt_context = self.arena.var(var).context.clone();
                let stmt = self.arena.alloc_stmt(StmtKind::VarDecl(var), stmt_context);
                self.arena.block_mut(block).statements.push(stmt);
            } else {
                self.arena.module_mut(module).state_variables.push(var);
            }

            if self.stream.match_if(&Token::Semicolon) {
                return Ok(());
            }
            self.expect(&Token::Comma)?;
            context = self.context();
            name = self.parse_identifier()?;
        }
    }

    // ── Functions ──

    fn parse_generic_wildcard_list(&mut self) -> CompileResult<Vec<ExprId>> {
        let mut wildcards = Vec::new();
        loop {
            if !self.stream.matches(&Token::Identifier) {
                return Err(self.error("expected a generic function wildcard name"));
            }
            let wildcard = self.parse_qualified_identifier()?;
            if let ExprKind::QualifiedIdentifier(path) = &self.arena.expr(wildcard).kind {
                if !path.is_unqualified() {
                    return Err(self.error_at(
                        self.arena.expr_location(wildcard),
                        "generic wildcard names cannot be qualified",
                    ));
                }
            }
            wildcards.push(wildcard);
            if self.stream.match_if(&Token::GreaterThan) {
                break;
            }
            self.expect(&Token::Comma)?;
        }
        Ok(wildcards)
    }

    fn parse_function_declaration(
        &mut self,
        decl_location: Location,
        return_type: ExprId,
        name: Name,
        name_context: Context,
        generic_wildcards: Vec<ExprId>,
    ) -> CompileResult<FunctionId> {
        if self.arena.is_resolved_as_type(return_type)
            && self.arena.constness(return_type) == Constness::DefinitelyConst
        {
            return Err(self.error_at(decl_location.clone(), "function return types cannot be const"));
        }

        let context = Context {
            location: decl_location.clone(),
            scope: self.current_scope,
        };
        let scope = self.arena.alloc_scope(ScopeKind::Function(FunctionId(0)), Some(self.current_scope));
        let function = self.arena.alloc_function(FunctionDecl {
            name,
            context,
            name_location: name_context.location,
            return_type,
            parameters: Vec::new(),
            body: None,
            scope,
            annotation: Annotation::default(),
            intrinsic: None,
            is_event_function: false,
            generic_wildcards: generic_wildcards.clone(),
            generic_specialisations: Vec::new(),
            original_generic_function: None,
            source_range: None,
            generated: None,
        });
        self.arena.scopes[scope.index()].kind = ScopeKind::Function(function);

        // The return type and wildcards were parsed in the module scope;
        // move them into the new function scope.
        let old_scope = self.current_scope;
        self.arena.replace_parent_scope(return_type, old_scope, scope);
        for w in &generic_wildcards {
            self.arena.replace_parent_scope(*w, old_scope, scope);
        }

        self.current_scope = scope;

        if !self.stream.match_if(&Token::CloseParen) {
            loop {
                self.give_error_on_external_keyword()?;
                let type_location = self.stream.location();
                let param_type = self.parse_type(ParseTypeContext::FunctionParameter)?;

                if let Some(t) = self.arena.resolve_as_type(param_type) {
                    if t.is_void() {
                        return Err(self.error_at(type_location, "function parameters cannot be void"));
                    }
                }

                if self.arena.function(function).parameters.len() >= MAX_FUNCTION_PARAMETERS {
                    return Err(self.error_at(type_location, "too many function parameters"));
                }

                let context = self.context();
                let param_name = self.parse_identifier()?;
                let var = self.arena.alloc_var(VarDecl {
                    name: param_name,
                    context,
                    declared_type: Some(param_type),
                    initial_value: None,
                    is_external: false,
                    is_const: false,
                    is_function_parameter: true,
                    annotation: Annotation::default(),
                    num_reads: 0,
                    num_writes: 0,
                    generated: None,
                });
                self.arena.function_mut(function).parameters.push(var);

                if self.stream.match_if(&Token::CloseParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }

        let annotation = self.parse_annotation()?;
        if let Some(intrin) = annotation.find("intrin") {
            if let ExprKind::Constant(Value::String(s)) = &self.arena.expr(intrin.value).kind {
                let intrinsic = Intrinsic::from_name(s);
                assert!(intrinsic.is_some(), "unknown intrinsic name {s:?}");
                self.arena.function_mut(function).intrinsic = intrinsic;
            }
        }
        self.arena.function_mut(function).annotation = annotation;

        if !self.stream.match_if(&Token::Semicolon) {
            let body = self.parse_block(Some(function))?;
            self.arena.function_mut(function).body = Some(body);
        }

        self.current_scope = old_scope;

        let end = self
            .stream
            .tokens
            .get(self.stream.pos.saturating_sub(1))
            .map(|(_, s)| s.end)
            .unwrap_or(decl_location.span.end);
        self.arena.function_mut(function).source_range = Some(Location::new(
            self.stream.chunk.clone(),
            Span::new(decl_location.span.start, end),
        ));

        Ok(function)
    }

    fn parse_event_function(&mut self, module: ModuleId, kind: ModuleKind) -> CompileResult<()> {
        if kind != ModuleKind::Processor {
            return Err(self.error("event functions are only allowed inside a processor"));
        }

        let decl_location = self.stream.location();
        let context = self.context();
        let name = self.parse_identifier_with_max_length()?;
        self.expect(&Token::OpenParen)?;

        let scope = self.arena.alloc_scope(ScopeKind::Function(FunctionId(0)), Some(self.current_scope));
        let void_type = self.alloc_expr(
            ExprKind::ConcreteType(Type::void()),
            Context {
                location: context.location.clone(),
                scope,
            },
        );
        let function = self.arena.alloc_function(FunctionDecl {
            name,
            context: context.clone(),
            name_location: context.location.clone(),
            return_type: void_type,
            parameters: Vec::new(),
            body: None,
            scope,
            annotation: Annotation::default(),
            intrinsic: None,
            is_event_function: true,
            generic_wildcards: Vec::new(),
            generic_specialisations: Vec::new(),
            original_generic_function: None,
            source_range: None,
            generated: None,
        });
        self.arena.scopes[scope.index()].kind = ScopeKind::Function(function);
        self.arena.module_mut(module).functions.push(function);

        let old_scope = self.current_scope;
        self.current_scope = scope;

        let param_type = self.parse_type(ParseTypeContext::FunctionParameter)?;
        let param_context = self.context();
        let param_name = self.parse_identifier()?;
        let var = self.arena.alloc_var(VarDecl {
            name: param_name,
            context: param_context,
            declared_type: Some(param_type),
            initial_value: None,
            is_external: false,
            is_const: false,
            is_function_parameter: true,
            annotation: Annotation::default(),
            num_reads: 0,
            num_writes: 0,
            generated: None,
        });
        self.arena.function_mut(function).parameters.push(var);
        self.expect(&Token::CloseParen)?;

        let body = self.parse_block(Some(function))?;
        self.arena.function_mut(function).body = Some(body);
        self.current_scope = old_scope;

        let end = self
            .stream
            .tokens
            .get(self.stream.pos.saturating_sub(1))
            .map(|(_, s)| s.end)
            .unwrap_or(decl_location.span.end);
        self.arena.function_mut(function).source_range = Some(Location::new(
            self.stream.chunk.clone(),
            Span::new(decl_location.span.start, end),
        ));
        Ok(())
    }

    // ── Statements ──

    fn parse_block(&mut self, owner: Option<FunctionId>) -> CompileResult<StmtId> {
        let context = self.context();
        self.expect(&Token::OpenBrace)?;

        let scope = self.arena.alloc_scope(ScopeKind::Block(BlockId(0)), Some(self.current_scope));
        let block = self.arena.alloc_block(Block {
            statements: Vec::new(),
            scope,
            function: owner,
        });
        self.arena.scopes[scope.index()].kind = ScopeKind::Block(block);

        let old_scope = self.current_scope;
        let old_block = self.current_block;
        self.current_scope = scope;
        self.current_block = Some(block);

        while !self.stream.match_if(&Token::CloseBrace) {
            if self.stream.at_end() {
                return Err(self.error("expected '}'"));
            }
            let s = self.parse_statement()?;
            self.arena.block_mut(block).statements.push(s);
        }

        self.current_scope = old_scope;
        self.current_block = old_block;

        Ok(self.arena.alloc_stmt(StmtKind::Block(block), context))
    }

    fn parse_statement(&mut self) -> CompileResult<StmtId> {
        if self.stream.matches(&Token::OpenBrace) {
            return self.parse_block(None);
        }
        if self.stream.match_if(&Token::If) {
            return self.parse_if();
        }
        if self.stream.match_if(&Token::While) {
            return self.parse_do_or_while_loop(false);
        }
        if self.stream.match_if(&Token::Do) {
            return self.parse_do_or_while_loop(true);
        }
        if self.stream.match_if(&Token::For) {
            return self.parse_for_loop();
        }
        if self.stream.match_if(&Token::Loop) {
            return self.parse_loop_statement();
        }
        if self.stream.match_if(&Token::Return) {
            return self.parse_return();
        }
        if self.stream.match_if(&Token::Break) {
            let context = self.context();
            self.expect_semicolon()?;
            return Ok(self.arena.alloc_stmt(StmtKind::Break, context));
        }
        if self.stream.match_if(&Token::Continue) {
            let context = self.context();
            self.expect_semicolon()?;
            return Ok(self.arena.alloc_stmt(StmtKind::Continue, context));
        }
        if self.stream.match_if(&Token::Let) {
            return self.parse_local_let_or_var(true);
        }
        if self.stream.match_if(&Token::Var) {
            return self.parse_local_let_or_var(false);
        }
        if self.stream.matches(&Token::External) {
            return Err(self.error("'external' is not allowed inside a function"));
        }
        if self.stream.match_if(&Token::Semicolon) {
            return Ok(self.noop());
        }
        if self.stream.match_if(&Token::PlusPlus) {
            let e = self.parse_pre_inc_dec(true)?;
            self.expect_semicolon()?;
            return Ok(self.expr_statement(e));
        }
        if self.stream.match_if(&Token::MinusMinus) {
            let e = self.parse_pre_inc_dec(false)?;
            self.expect_semicolon()?;
            return Ok(self.expr_statement(e));
        }
        if self.stream.matches(&Token::OpenParen) {
            let e = self.parse_factor()?;
            self.expect_semicolon()?;
            return Ok(self.expr_statement(e));
        }

        if matches!(
            self.stream.peek(),
            Some(
                Token::IntLiteral32(_)
                    | Token::IntLiteral64(_)
                    | Token::FloatLiteral32(_)
                    | Token::FloatLiteral64(_)
                    | Token::StringLiteral(_)
                    | Token::Minus
            )
        ) {
            return self.parse_expression_as_statement(false);
        }

        // A statement can begin with a type (a local variable declaration);
        // try that speculatively and roll back if it is not one.
        {
            let saved = self.stream.save();
            if let Some(decl_type) = self.try_parsing_type(ParseTypeContext::VariableType)? {
                if self.stream.matches(&Token::Identifier) {
                    let context = self.context();
                    let name = self.parse_identifier()?;
                    if self.stream.matches(&Token::OpenParen) {
                        return Err(self.error("expected a variable declaration"));
                    }
                    let module = self.current_module.unwrap();
                    self.parse_variable_declaration(module, decl_type, name, false, context)?;
                    return Ok(self.noop());
                }
            }
            self.stream.restore(saved);
        }

        if self.stream.matches(&Token::Identifier) {
            return self.parse_expression_as_statement(true);
        }

        self.give_error_on_external_keyword()?;
        Err(self.error("expected a statement"))
    }

    fn expr_statement(&mut self, e: ExprId) -> StmtId {
        let context = self.arena.expr(e).context.clone();
        self.arena.alloc_stmt(StmtKind::Expression(e), context)
    }

    fn parse_expression_as_statement(&mut self, allow_assignment: bool) -> CompileResult<StmtId> {
        let e = self.parse_expression(allow_assignment)?;
        self.expect_semicolon()?;
        if self.arena.is_compile_time_constant(e) {
            return Err(self.error_at(
                self.arena.expr_location(e),
                "this expression has no effect",
            ));
        }
        Ok(self.expr_statement(e))
    }

    fn parse_if(&mut self) -> CompileResult<StmtId> {
        let context = self.context();
        self.expect(&Token::OpenParen)?;
        let condition = self.parse_expression(false)?;
        self.expect(&Token::CloseParen)?;
        let true_branch = self.parse_statement()?;
        let false_branch = if self.stream.match_if(&Token::Else) {
            Some(self.parse_statement()?)
        } else {
            None
        };
        Ok(self.arena.alloc_stmt(
            StmtKind::If {
                condition,
                true_branch,
                false_branch,
            },
            context,
        ))
    }

    fn parse_return(&mut self) -> CompileResult<StmtId> {
        let context = self.context();
        if self.stream.match_if(&Token::Semicolon) {
            return Ok(self.arena.alloc_stmt(StmtKind::Return { value: None }, context));
        }

        let return_type = {
            let function = self
                .current_block
                .and_then(|b| self.arena.block(b).function)
                .or_else(|| self.arena.enclosing_function(self.current_scope))
                .expect("internal: return outside a function");
            self.arena.function(function).return_type
        };

        let e = self.parse_expression(false)?;
        let e = self.parse_suffixes(e)?;
        self.expect_semicolon()?;
        let value = self.cast_expression_to_target_type(return_type, e);
        Ok(self
            .arena
            .alloc_stmt(StmtKind::Return { value: Some(value) }, context))
    }

    /// Wraps a return value so it lands on the function's declared return
    /// type: a direct cast when both sides are resolved, otherwise a
    /// CallOrCast for the resolver to finish.
    fn cast_expression_to_target_type(&mut self, target_type: ExprId, source: ExprId) -> ExprId {
        let is_list = matches!(
            self.arena.expr(source).kind,
            ExprKind::CommaSeparatedList(_)
        );

        if !is_list {
            if let Some(t) = self.arena.resolve_as_type(target_type) {
                if self.arena.is_resolved_as_value(source) {
                    if let Some(source_type) = self.arena.result_type(source) {
                        if source_type.is_identical(&t) {
                            return source;
                        }
                    }
                    let context = self.arena.expr(source).context.clone();
                    return self.alloc_expr(
                        ExprKind::TypeCast {
                            target: t,
                            source,
                        },
                        context,
                    );
                }
            }
            let context = self.arena.expr(source).context.clone();
            let list = self.alloc_expr(ExprKind::CommaSeparatedList(vec![source]), context.clone());
            return self.alloc_expr(
                ExprKind::CallOrCast {
                    callee: target_type,
                    args: Some(list),
                    is_method_call: false,
                },
                context,
            );
        }

        let context = self.arena.expr(source).context.clone();
        self.alloc_expr(
            ExprKind::CallOrCast {
                callee: target_type,
                args: Some(source),
                is_method_call: false,
            },
            context,
        )
    }

    fn parse_for_loop(&mut self) -> CompileResult<StmtId> {
        let context = self.context();
        self.expect(&Token::OpenParen)?;

        // The whole for-loop lives in its own block so the iteration
        // variable stays scoped to the loop.
        let scope = self.arena.alloc_scope(ScopeKind::Block(BlockId(0)), Some(self.current_scope));
        let block = self.arena.alloc_block(Block {
            statements: Vec::new(),
            scope,
            function: None,
        });
        self.arena.scopes[scope.index()].kind = ScopeKind::Block(block);

        let old_scope = self.current_scope;
        let old_block = self.current_block;
        self.current_scope = scope;
        self.current_block = Some(block);

        let init = self.parse_statement()?;
        self.arena.block_mut(block).statements.push(init);

        let condition = if self.stream.match_if(&Token::Semicolon) {
            let c = self.context();
            Some(self.alloc_expr(ExprKind::Constant(Value::Bool(true)), c))
        } else {
            let e = self.parse_expression(false)?;
            self.expect_semicolon()?;
            Some(e)
        };

        let iterator = if self.stream.match_if(&Token::CloseParen) {
            None
        } else {
            let e = self.parse_expression(true)?;
            self.expect(&Token::CloseParen)?;
            Some(e)
        };

        let body = self.parse_statement()?;

        let loop_stmt = self.arena.alloc_stmt(
            StmtKind::Loop {
                condition,
                num_iterations: None,
                iterator,
                body,
                is_do_loop: false,
            },
            context.clone(),
        );
        self.arena.block_mut(block).statements.push(loop_stmt);

        self.current_scope = old_scope;
        self.current_block = old_block;

        Ok(self.arena.alloc_stmt(StmtKind::Block(block), context))
    }

    fn parse_loop_statement(&mut self) -> CompileResult<StmtId> {
        let context = self.context();
        let num_iterations = if self.stream.match_if(&Token::OpenParen) {
            let e = self.parse_expression(false)?;
            self.expect(&Token::CloseParen)?;
            Some(e)
        } else {
            None
        };
        let body = self.parse_statement()?;
        Ok(self.arena.alloc_stmt(
            StmtKind::Loop {
                condition: None,
                num_iterations,
                iterator: None,
                body,
                is_do_loop: false,
            },
            context,
        ))
    }

    fn parse_do_or_while_loop(&mut self, is_do_loop: bool) -> CompileResult<StmtId> {
        let context = self.context();

        if is_do_loop {
            let body = self.parse_block(None)?;
            self.expect(&Token::While)?;
            self.expect(&Token::OpenParen)?;
            let condition = self.parse_expression(false)?;
            self.expect(&Token::CloseParen)?;
            return Ok(self.arena.alloc_stmt(
                StmtKind::Loop {
                    condition: Some(condition),
                    num_iterations: None,
                    iterator: None,
                    body,
                    is_do_loop: true,
                },
                context,
            ));
        }

        self.expect(&Token::OpenParen)?;
        let condition = self.parse_expression(false)?;
        self.expect(&Token::CloseParen)?;
        let body = self.parse_statement()?;
        Ok(self.arena.alloc_stmt(
            StmtKind::Loop {
                condition: Some(condition),
                num_iterations: None,
                iterator: None,
                body,
                is_do_loop: false,
            },
            context,
        ))
    }

    fn parse_local_let_or_var(&mut self, is_const: bool) -> CompileResult<StmtId> {
        let block = self
            .current_block
            .expect("internal: let/var outside a block");
        loop {
            let context = self.context();
            let name = self.parse_identifier()?;
            self.expect(&Token::Assign)?;
            let initial_value = self.parse_expression(false)?;

            if !self.arena.is_possibly_value(initial_value) {
                return Err(self.error_at(
                    self.arena.expr_location(initial_value),
                    "expected a value",
                ));
            }

            let var = self.arena.alloc_var(VarDecl {
                name,
                context: context.clone(),
                declared_type: None,
                initial_value: Some(initial_value),
                is_external: false,
                is_const,
                is_function_parameter: false,
                annotation: Annotation::default(),
                num_reads: 0,
                num_writes: 0,
                generated: None,
            });
            let stmt = self.arena.alloc_stmt(StmtKind::VarDecl(var), context);
            self.arena.block_mut(block).statements.push(stmt);

            if self.stream.match_if(&Token::Semicolon) {
                return Ok(self.noop());
            }
            self.expect(&Token::Comma)?;
        }
    }

    // ── Expressions ──

    fn parse_expression(&mut self, allow_assignment: bool) -> CompileResult<ExprId> {
        let lhs = self.parse_ternary()?;

        // In-place compound assignments become plain assignment of a binary
        // op so later passes only ever see `target = value`.
        let in_place = match self.stream.peek() {
            Some(Token::PlusEquals) => Some(BinaryOp::Add),
            Some(Token::MinusEquals) => Some(BinaryOp::Subtract),
            Some(Token::TimesEquals) => Some(BinaryOp::Multiply),
            Some(Token::DivideEquals) => Some(BinaryOp::Divide),
            Some(Token::ModuloEquals) => Some(BinaryOp::Modulo),
            Some(Token::LeftShiftEquals) => Some(BinaryOp::LeftShift),
            Some(Token::RightShiftEquals) => Some(BinaryOp::RightShift),
            Some(Token::RightShiftUnsignedEquals) => Some(BinaryOp::RightShiftUnsigned),
            Some(Token::XorEquals) => Some(BinaryOp::BitwiseXor),
            Some(Token::AndEquals) => Some(BinaryOp::BitwiseAnd),
            Some(Token::OrEquals) => Some(BinaryOp::BitwiseOr),
            _ => None,
        };

        if let Some(op) = in_place {
            let context = self.context();
            self.stream.advance();
            let rhs = self.parse_expression(false)?;
            let binary = self.create_binary(context.clone(), lhs, rhs, op)?;
            return Ok(self.alloc_expr(
                ExprKind::Assignment {
                    target: lhs,
                    value: binary,
                },
                context,
            ));
        }

        if self.stream.matches(&Token::Assign) {
            if !allow_assignment {
                return Err(self.error("assignment is not allowed inside an expression"));
            }
            let context = self.context();
            self.stream.advance();
            let value = self.parse_expression(false)?;
            return Ok(self.alloc_expr(ExprKind::Assignment { target: lhs, value }, context));
        }

        Ok(lhs)
    }

    fn create_binary(
        &mut self,
        context: Context,
        lhs: ExprId,
        rhs: ExprId,
        op: BinaryOp,
    ) -> CompileResult<ExprId> {
        for side in [lhs, rhs] {
            if !self.arena.is_possibly_value(side) && !self.arena.is_possibly_endpoint(side) {
                return Err(self.error_at(
                    self.arena.expr_location(side),
                    "expected a value or endpoint",
                ));
            }
        }
        Ok(self.alloc_expr(ExprKind::Binary { op, lhs, rhs }, context))
    }

    fn parse_ternary(&mut self) -> CompileResult<ExprId> {
        let a = self.parse_logical_or()?;
        if !self.stream.matches(&Token::Question) {
            return Ok(a);
        }
        let context = self.context();
        self.stream.advance();
        let true_branch = self.parse_ternary()?;
        self.expect(&Token::Colon)?;
        let false_branch = self.parse_ternary()?;
        Ok(self.alloc_expr(
            ExprKind::Ternary {
                condition: a,
                true_branch,
                false_branch,
            },
            context,
        ))
    }

    /// `a || b` is parse-time sugar for `a ? true : b`.
    fn parse_logical_or(&mut self) -> CompileResult<ExprId> {
        let mut a = self.parse_logical_and()?;
        while self.stream.matches(&Token::LogicalOr) {
            let context = self.context();
            self.stream.advance();
            let rhs = self.parse_logical_and()?;
            let true_constant =
                self.alloc_expr(ExprKind::Constant(Value::Bool(true)), context.clone());
            a = self.alloc_expr(
                ExprKind::Ternary {
                    condition: a,
                    true_branch: true_constant,
                    false_branch: rhs,
                },
                context,
            );
        }
        Ok(a)
    }

    /// `a && b` is parse-time sugar for `a ? b : false`.
    fn parse_logical_and(&mut self) -> CompileResult<ExprId> {
        let mut a = self.parse_bitwise_or()?;
        while self.stream.matches(&Token::LogicalAnd) {
            let context = self.context();
            self.stream.advance();
            let rhs = self.parse_bitwise_or()?;
            let false_constant =
                self.alloc_expr(ExprKind::Constant(Value::Bool(false)), context.clone());
            a = self.alloc_expr(
                ExprKind::Ternary {
                    condition: a,
                    true_branch: rhs,
                    false_branch: false_constant,
                },
                context,
            );
        }
        Ok(a)
    }

    fn parse_bitwise_or(&mut self) -> CompileResult<ExprId> {
        let mut a = self.parse_bitwise_xor()?;
        while self.stream.matches(&Token::BitwiseOr) {
            let context = self.context();
            self.stream.advance();
            let rhs = self.parse_bitwise_xor()?;
            a = self.create_binary(context, a, rhs, BinaryOp::BitwiseOr)?;
        }
        Ok(a)
    }

    fn parse_bitwise_xor(&mut self) -> CompileResult<ExprId> {
        let mut a = self.parse_bitwise_and()?;
        while self.stream.matches(&Token::BitwiseXor) {
            let context = self.context();
            self.stream.advance();
            let rhs = self.parse_bitwise_and()?;
            a = self.create_binary(context, a, rhs, BinaryOp::BitwiseXor)?;
        }
        Ok(a)
    }

    fn parse_bitwise_and(&mut self) -> CompileResult<ExprId> {
        let mut a = self.parse_equality()?;
        while self.stream.matches(&Token::BitwiseAnd) {
            let context = self.context();
            self.stream.advance();
            let rhs = self.parse_equality()?;
            a = self.create_binary(context, a, rhs, BinaryOp::BitwiseAnd)?;
        }
        Ok(a)
    }

    fn parse_equality(&mut self) -> CompileResult<ExprId> {
        let mut a = self.parse_comparison()?;
        loop {
            let op = match self.stream.peek() {
                Some(Token::Equals) => BinaryOp::Equals,
                Some(Token::NotEquals) => BinaryOp::NotEquals,
                _ => return Ok(a),
            };
            let context = self.context();
            self.stream.advance();
            let rhs = self.parse_comparison()?;
            a = self.create_binary(context, a, rhs, op)?;
        }
    }

    fn parse_comparison(&mut self) -> CompileResult<ExprId> {
        let mut a = self.parse_shift()?;
        loop {
            let op = match self.stream.peek() {
                Some(Token::LessThan) => BinaryOp::LessThan,
                Some(Token::LessThanOrEqual) => BinaryOp::LessThanOrEqual,
                Some(Token::GreaterThanOrEqual) => BinaryOp::GreaterThanOrEqual,
                // `>` closes a chevron while the suppression counter is up
                Some(Token::GreaterThan) if self.ignore_greater_than == 0 => BinaryOp::GreaterThan,
                _ => return Ok(a),
            };
            let context = self.context();
            self.stream.advance();
            let rhs = self.parse_shift()?;
            a = self.create_binary(context, a, rhs, op)?;
        }
    }

    fn parse_shift(&mut self) -> CompileResult<ExprId> {
        let mut a = self.parse_additive()?;
        loop {
            let op = match self.stream.peek() {
                Some(Token::LeftShift) => BinaryOp::LeftShift,
                Some(Token::RightShift) => BinaryOp::RightShift,
                Some(Token::RightShiftUnsigned) => BinaryOp::RightShiftUnsigned,
                _ => return Ok(a),
            };
            let context = self.context();
            self.stream.advance();
            let rhs = self.parse_additive()?;
            a = self.create_binary(context, a, rhs, op)?;
        }
    }

    fn parse_additive(&mut self) -> CompileResult<ExprId> {
        let mut a = self.parse_multiplicative()?;
        loop {
            let op = match self.stream.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Subtract,
                _ => return Ok(a),
            };
            let context = self.context();
            self.stream.advance();
            let rhs = self.parse_multiplicative()?;
            a = self.create_binary(context, a, rhs, op)?;
        }
    }

    fn parse_multiplicative(&mut self) -> CompileResult<ExprId> {
        let mut a = self.parse_unary()?;
        loop {
            let op = match self.stream.peek() {
                Some(Token::Times) => BinaryOp::Multiply,
                Some(Token::Divide) => BinaryOp::Divide,
                Some(Token::Modulo) => BinaryOp::Modulo,
                _ => return Ok(a),
            };
            let context = self.context();
            self.stream.advance();
            let rhs = self.parse_unary()?;
            a = self.create_binary(context, a, rhs, op)?;
        }
    }

    fn parse_unary(&mut self) -> CompileResult<ExprId> {
        if self.stream.match_if(&Token::PlusPlus) {
            return self.parse_pre_inc_dec(true);
        }
        if self.stream.match_if(&Token::MinusMinus) {
            return self.parse_pre_inc_dec(false);
        }

        let op = match self.stream.peek() {
            Some(Token::Minus) => Some(UnaryOp::Negate),
            Some(Token::LogicalNot) => Some(UnaryOp::LogicalNot),
            Some(Token::BitwiseNot) => Some(UnaryOp::BitwiseNot),
            _ => None,
        };
        if let Some(op) = op {
            let context = self.context();
            self.stream.advance();
            let source = self.parse_unary()?;
            return Ok(self.alloc_expr(ExprKind::Unary { op, source }, context));
        }

        self.parse_factor()
    }

    fn parse_pre_inc_dec(&mut self, is_increment: bool) -> CompileResult<ExprId> {
        let context = self.context();
        let target = self.parse_factor()?;
        Ok(self.alloc_expr(
            ExprKind::PreOrPostIncDec {
                target,
                is_increment,
                is_post: false,
            },
            context,
        ))
    }

    fn parse_factor(&mut self) -> CompileResult<ExprId> {
        if self.stream.match_if(&Token::OpenParen) {
            return self.parse_parenthesised_expression();
        }

        let literal = match self.stream.peek() {
            Some(Token::IntLiteral32(v)) => Some(Value::Int32(*v as i32)),
            Some(Token::IntLiteral64(v)) => Some(Value::Int64(*v)),
            Some(Token::FloatLiteral32(v)) => Some(Value::Float32(*v as f32)),
            Some(Token::FloatLiteral64(v)) => Some(Value::Float64(*v)),
            Some(Token::StringLiteral(s)) => Some(Value::String(Rc::from(s.as_str()))),
            Some(Token::True) => Some(Value::Bool(true)),
            Some(Token::False) => Some(Value::Bool(false)),
            _ => None,
        };
        if let Some(v) = literal {
            let context = self.context();
            self.stream.advance();
            let e = self.alloc_expr(ExprKind::Constant(v), context);
            return self.parse_suffixes(e);
        }

        if self.stream.match_if(&Token::Processor) {
            return self.parse_processor_property();
        }

        {
            let saved = self.stream.save();
            if let Some(t) = self.try_parsing_type(ParseTypeContext::NameOrType)? {
                return self.parse_suffixes(t);
            }
            self.stream.restore(saved);
        }

        if self.stream.matches(&Token::Identifier) {
            let qi = self.parse_qualified_identifier()?;
            return self.parse_suffixes(qi);
        }

        Err(self.error("expected an expression"))
    }

    fn parse_parenthesised_expression(&mut self) -> CompileResult<ExprId> {
        let e = self.parse_expression(false)?;

        if self.stream.match_if(&Token::CloseParen) {
            return self.parse_suffixes(e);
        }

        if self.stream.match_if(&Token::Comma) {
            let context = self.arena.expr(e).context.clone();
            let mut items = vec![e];
            loop {
                items.push(self.parse_expression(false)?);
                if items.len() > MAX_INITIALISER_LIST_LENGTH {
                    return Err(self.error_at(context.location, "too many initialisers"));
                }
                if self.stream.match_if(&Token::Comma) {
                    continue;
                }
                self.expect(&Token::CloseParen)?;
                break;
            }
            return Ok(self.alloc_expr(ExprKind::CommaSeparatedList(items), context));
        }

        self.expect(&Token::CloseParen)?;
        Ok(e)
    }

    fn parse_processor_property(&mut self) -> CompileResult<ExprId> {
        self.expect(&Token::Dot)?;
        let context = self.context();
        let name_expr = self.parse_qualified_identifier()?;
        let (path, location) = match &self.arena.expr(name_expr).kind {
            ExprKind::QualifiedIdentifier(p) => (p.clone(), self.arena.expr_location(name_expr)),
            _ => unreachable!(),
        };

        let name = self.arena.name(path.last()).to_string();
        let property = ProcessorProperty::for_name(&name)
            .ok_or_else(|| self.error_at(location, format!("unknown processor property '{name}'")))?;

        let module = self.current_module.map(|m| self.arena.module(m));
        if !module.map_or(false, |m| m.is_processor_or_graph()) {
            return Err(self.error_at(
                context.location,
                "processor properties are only valid inside a processor or graph",
            ));
        }

        Ok(self.alloc_expr(ExprKind::ProcessorProperty(property), context))
    }

    fn parse_comma_separated_list_of_expressions(&mut self) -> CompileResult<ExprId> {
        let context = self.context();
        let mut items = Vec::new();

        loop {
            if self.stream.match_if(&Token::CloseParen) {
                break;
            }
            let e = self.parse_expression(false)?;
            if items.len() >= MAX_INITIALISER_LIST_LENGTH {
                return Err(self.error_at(self.arena.expr_location(e), "too many initialisers"));
            }
            items.push(e);
            if self.stream.match_if(&Token::Comma) {
                continue;
            }
        }

        Ok(self.alloc_expr(ExprKind::CommaSeparatedList(items), context))
    }

    fn parse_dot_operator(&mut self, lhs: ExprId) -> CompileResult<ExprId> {
        let context = self.context();
        self.expect(&Token::Dot)?;
        let rhs = self.parse_qualified_identifier()?;

        // `x.size`, `x.elementType` etc. are type meta-functions, not
        // member accesses.
        if let Some(op) = self.meta_op_for(rhs) {
            let tmf = self.alloc_expr(
                ExprKind::TypeMetaFunction { op, source: lhs },
                self.arena.expr(rhs).context.clone(),
            );
            return self.parse_vector_or_array_type_suffixes(tmf, ParseTypeContext::MetaFunctionArgument);
        }

        let dot = self.alloc_expr(ExprKind::DotOperator { lhs, rhs }, context);
        self.parse_suffixes(dot)
    }

    fn meta_op_for(&self, qi: ExprId) -> Option<MetaOp> {
        if let ExprKind::QualifiedIdentifier(path) = &self.arena.expr(qi).kind {
            if path.is_unqualified() {
                return MetaOp::for_name(self.arena.name(path.first()));
            }
        }
        None
    }

    fn parse_suffixes(&mut self, expression: ExprId) -> CompileResult<ExprId> {
        if self.stream.matches(&Token::Dot) {
            return self.parse_dot_operator(expression);
        }

        if self.stream.match_if(&Token::OpenParen) {
            let args = self.parse_comma_separated_list_of_expressions()?;

            // a.f(x) is sugar for f(a, x)
            let dot = match &self.arena.expr(expression).kind {
                ExprKind::DotOperator { lhs, rhs } => Some((*lhs, *rhs)),
                _ => None,
            };
            let (callee, args, is_method_call) = if let Some((lhs, rhs)) = dot {
                if let ExprKind::CommaSeparatedList(items) = &mut self.arena.expr_mut(args).kind {
                    items.insert(0, lhs);
                }
                (rhs, args, true)
            } else {
                (expression, args, false)
            };

            let context = self.arena.expr(callee).context.clone();
            let call = self.alloc_expr(
                ExprKind::CallOrCast {
                    callee,
                    args: Some(args),
                    is_method_call,
                },
                context,
            );
            return self.parse_suffixes(call);
        }

        if self.stream.match_if(&Token::OpenBracket) {
            return self.parse_subscript_with_brackets(expression);
        }

        if self.stream.match_if(&Token::PlusPlus) {
            return self.parse_post_inc_dec(expression, true);
        }
        if self.stream.match_if(&Token::MinusMinus) {
            return self.parse_post_inc_dec(expression, false);
        }

        Ok(expression)
    }

    fn parse_post_inc_dec(&mut self, target: ExprId, is_increment: bool) -> CompileResult<ExprId> {
        let context = self.context();
        Ok(self.alloc_expr(
            ExprKind::PreOrPostIncDec {
                target,
                is_increment,
                is_post: true,
            },
            context,
        ))
    }

    fn check_and_create_slice(
        &mut self,
        context: Context,
        lhs: ExprId,
        start: Option<ExprId>,
        end: Option<ExprId>,
    ) -> CompileResult<ExprId> {
        if !(self.arena.is_possibly_value(lhs) || self.arena.is_possibly_endpoint(lhs)) {
            return Err(self.error_at(
                self.arena.expr_location(lhs),
                "expected a value or endpoint",
            ));
        }

        for index in [start, end].into_iter().flatten() {
            if !self.arena.is_possibly_value(index) {
                return Err(self.error_at(self.arena.expr_location(index), "expected a value"));
            }
        }

        if let (Some(s), Some(e)) = (start, end) {
            if let (Some(sv), Some(ev)) = (self.arena.get_as_constant(s), self.arena.get_as_constant(e)) {
                let s_int = sv
                    .as_i64()
                    .ok_or_else(|| self.error_at(self.arena.expr_location(s), "expected an integer"))?;
                let e_int = ev
                    .as_i64()
                    .ok_or_else(|| self.error_at(self.arena.expr_location(e), "expected an integer"))?;
                let same_sign = (s_int >= 0) == (e_int >= 0);
                if same_sign && s_int >= e_int {
                    return Err(self.error_at(self.arena.expr_location(e), "invalid slice size"));
                }
            }
        }

        Ok(self.alloc_expr(
            ExprKind::ArrayElementRef {
                object: lhs,
                start,
                end,
                is_slice: true,
                suppress_wrap_warning: false,
            },
            context,
        ))
    }

    fn parse_subscript_with_brackets(&mut self, lhs: ExprId) -> CompileResult<ExprId> {
        let context = self.context();
        let e;

        if self.stream.match_if(&Token::Colon) {
            let start = self.alloc_expr(ExprKind::Constant(Value::Int32(0)), context.clone());
            let end = if self.stream.matches(&Token::CloseBracket)
                || self.stream.matches(&Token::CloseDoubleBracket)
            {
                None
            } else {
                Some(self.parse_expression(false)?)
            };
            e = self.check_and_create_slice(context, lhs, Some(start), end)?;
        } else if self.stream.matches(&Token::CloseBracket) {
            e = self.alloc_expr(
                ExprKind::SubscriptWithBrackets { lhs, rhs: None },
                context,
            );
        } else {
            let start = self.parse_expression(false)?;
            if self.stream.match_if(&Token::Colon) {
                let end = if self.stream.matches(&Token::CloseBracket)
                    || self.stream.matches(&Token::CloseDoubleBracket)
                {
                    None
                } else {
                    Some(self.parse_expression(false)?)
                };
                e = self.check_and_create_slice(context, lhs, Some(start), end)?;
            } else {
                e = self.alloc_expr(
                    ExprKind::SubscriptWithBrackets {
                        lhs,
                        rhs: Some(start),
                    },
                    context,
                );
            }
        }

        if self.stream.match_and_split_close_double_bracket() {
            return self.parse_suffixes(e);
        }

        self.expect(&Token::CloseBracket)?;
        self.parse_suffixes(e)
    }

    // ── Types ──

    fn try_to_parse_expression_ignoring_errors(&mut self) -> Option<ExprId> {
        let saved = self.stream.save();
        match self.parse_expression(false) {
            Ok(e) => Some(e),
            Err(_) => {
                self.stream.restore(saved);
                None
            }
        }
    }

    fn parse_vector_or_array_type_suffixes(
        &mut self,
        element_type: ExprId,
        parse_context: ParseTypeContext,
    ) -> CompileResult<ExprId> {
        let context = self.context();
        let saved = self.stream.save();

        if !self.stream.match_if(&Token::LessThan) {
            return self.parse_array_type_suffixes(element_type, parse_context);
        }

        self.ignore_greater_than += 1;
        let size = self.try_to_parse_expression_ignoring_errors();
        self.ignore_greater_than -= 1;

        let closed = size.is_some() && self.stream.match_if(&Token::GreaterThan);
        if !closed {
            self.stream.restore(saved);
            return Ok(element_type);
        }

        let e = self.alloc_expr(
            ExprKind::SubscriptWithChevrons {
                lhs: element_type,
                rhs: size.unwrap(),
            },
            context,
        );
        self.parse_array_type_suffixes(e, parse_context)
    }

    fn parse_array_type_suffixes(
        &mut self,
        t: ExprId,
        parse_context: ParseTypeContext,
    ) -> CompileResult<ExprId> {
        if self.stream.match_if(&Token::OpenBracket) {
            let sub = self.parse_subscript_with_brackets(t)?;
            return self.parse_array_type_suffixes(sub, parse_context);
        }

        if self.stream.matches(&Token::BitwiseAnd) {
            match parse_context {
                ParseTypeContext::VariableType => {
                    return Err(self.error("local variable types cannot be references"))
                }
                ParseTypeContext::EventType => {
                    return Err(self.error("event types cannot be references"))
                }
                ParseTypeContext::StructMember => {
                    return Err(self.error("struct members cannot be references"))
                }
                ParseTypeContext::UsingDeclTarget => {
                    return Err(self.error("using declarations cannot be references"))
                }
                ParseTypeContext::ProcessorParameter => {
                    return Err(self.error("processor parameters cannot be references"))
                }
                ParseTypeContext::MetaFunctionArgument | ParseTypeContext::NameOrType => {
                    // leave the `&` for expression parsing
                }
                ParseTypeContext::FunctionParameter => {
                    let context = self.context();
                    self.stream.advance();
                    return Ok(self.alloc_expr(
                        ExprKind::TypeMetaFunction {
                            op: MetaOp::MakeReference,
                            source: t,
                        },
                        context,
                    ));
                }
            }
        }

        if self.stream.matches(&Token::Dot) {
            return self.parse_dot_operator(t);
        }

        Ok(t)
    }

    /// Attempts to parse a type at the current position. Returns Ok(None)
    /// when the tokens cannot begin a type (the caller restores position).
    fn try_parsing_type(&mut self, parse_context: ParseTypeContext) -> CompileResult<Option<ExprId>> {
        let context = self.context();

        let primitive = match self.stream.peek() {
            Some(Token::Float) | Some(Token::Float32) => Some(Type::float32()),
            Some(Token::Float64) => Some(Type::float64()),
            Some(Token::Void) => Some(Type::void()),
            Some(Token::Int) | Some(Token::Int32) => Some(Type::int32()),
            Some(Token::Int64) => Some(Type::int64()),
            Some(Token::Bool) => Some(Type::bool()),
            _ => None,
        };
        if let Some(t) = primitive {
            self.stream.advance();
            let e = self.alloc_expr(ExprKind::ConcreteType(t), context);
            return Ok(Some(self.parse_vector_or_array_type_suffixes(e, parse_context)?));
        }

        if self.stream.match_if(&Token::String) {
            let e = self.alloc_expr(ExprKind::ConcreteType(Type::StringLiteral), context);
            return Ok(Some(self.parse_array_type_suffixes(e, parse_context)?));
        }

        if self.stream.match_if(&Token::Const) {
            if parse_context == ParseTypeContext::StructMember {
                return Err(self.error_at(context.location, "struct members cannot be const"));
            }
            let inner = self.parse_type(parse_context)?;
            return Ok(Some(self.alloc_expr(
                ExprKind::TypeMetaFunction {
                    op: MetaOp::MakeConst,
                    source: inner,
                },
                context,
            )));
        }

        if self.stream.matches(&Token::Fixed) {
            return Err(self.error("not yet implemented: fixed point type support"));
        }

        if self.stream.matches(&Token::Identifier) {
            let qi = self.parse_qualified_identifier()?;

            // `elementType(T)`-style meta-function call syntax
            if let Some(op) = self.meta_op_for(qi) {
                if self.stream.matches(&Token::OpenParen) {
                    let tmf = self.parse_type_meta_function(context, op)?;
                    return Ok(Some(
                        self.parse_vector_or_array_type_suffixes(tmf, parse_context)?,
                    ));
                }
            }

            return Ok(Some(self.parse_vector_or_array_type_suffixes(qi, parse_context)?));
        }

        Ok(None)
    }

    fn parse_type_meta_function(&mut self, context: Context, op: MetaOp) -> CompileResult<ExprId> {
        self.expect(&Token::OpenParen)?;
        let t = self.parse_type(ParseTypeContext::MetaFunctionArgument)?;
        self.expect(&Token::CloseParen)?;
        Ok(self.alloc_expr(ExprKind::TypeMetaFunction { op, source: t }, context))
    }

    fn parse_type(&mut self, parse_context: ParseTypeContext) -> CompileResult<ExprId> {
        match self.try_parsing_type(parse_context)? {
            Some(t) => Ok(t),
            None => Err(self.error("expected a type")),
        }
    }
}

fn is_keyword(t: &Token) -> bool {
    matches!(
        t,
        Token::If
            | Token::Else
            | Token::Do
            | Token::While
            | Token::For
            | Token::Loop
            | Token::Break
            | Token::Continue
            | Token::Return
            | Token::Const
            | Token::Let
            | Token::Var
            | Token::Void
            | Token::Int
            | Token::Int32
            | Token::Int64
            | Token::Float
            | Token::Float32
            | Token::Float64
            | Token::Fixed
            | Token::Bool
            | Token::True
            | Token::False
            | Token::String
            | Token::Struct
            | Token::Using
            | Token::External
            | Token::Graph
            | Token::Processor
            | Token::Namespace
            | Token::Input
            | Token::Output
            | Token::Connection
            | Token::Event
            | Token::Import
    )
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::create_root_namespace;

    fn parse_ok(source: &str) -> (Arena, ModuleId, Vec<ModuleId>) {
        let mut arena = Arena::new();
        let root = create_root_namespace(&mut arena);
        let chunk = SourceChunk::new("test.soul", source);
        let modules = parse_top_level_declarations(&mut arena, chunk, root)
            .unwrap_or_else(|e| panic!("unexpected parse error: {e}"));
        (arena, root, modules)
    }

    fn parse_err(source: &str) -> Diagnostic {
        let mut arena = Arena::new();
        let root = create_root_namespace(&mut arena);
        let chunk = SourceChunk::new("test.soul", source);
        parse_top_level_declarations(&mut arena, chunk, root).expect_err("expected a parse error")
    }

    // ── Modules ──

    #[test]
    fn empty_processor_fails_later_not_at_parse() {
        let (arena, _, modules) = parse_ok("processor P { output stream float out; void run() { advance(); } }");
        assert_eq!(modules.len(), 1);
        let m = arena.module(modules[0]);
        assert!(m.is_processor());
        assert_eq!(arena.name(m.name), "P");
        assert_eq!(m.outputs.len(), 1);
        assert_eq!(m.functions.len(), 1);
    }

    #[test]
    fn namespace_with_nested_modules() {
        let (arena, _, modules) =
            parse_ok("namespace ns { processor P { output stream float out; void run() { advance(); } } }");
        let ns = arena.module(modules[0]);
        assert!(ns.is_namespace());
        assert_eq!(ns.sub_modules.len(), 1);
    }

    #[test]
    fn namespace_shorthand_nesting() {
        let (arena, _, modules) = parse_ok("namespace a::b { }");
        let a = arena.module(modules[0]);
        assert_eq!(arena.name(a.name), "a");
        assert_eq!(a.sub_modules.len(), 1);
        let b = arena.module(a.sub_modules[0]);
        assert_eq!(arena.name(b.name), "b");
    }

    #[test]
    fn graph_with_instances_and_connections() {
        let (arena, _, modules) = parse_ok(
            "graph G { output stream float out; let a = Osc * 2; let b = Filter / 3; connection { a.out -> b.in; b.out -> out; } }",
        );
        let g = arena.module(modules[0]);
        assert!(g.is_graph());
        assert_eq!(g.instances.len(), 2);
        assert_eq!(g.connections.len(), 2);
        let a = arena.instance(g.instances[0]);
        assert!(a.clock_multiplier_ratio.is_some());
        let b = arena.instance(g.instances[1]);
        assert!(b.clock_divider_ratio.is_some());
    }

    #[test]
    fn duplicate_instance_name_rejected() {
        let e = parse_err("graph G { output stream float out; let a = X; let a = Y; }");
        assert!(e.message.contains("already in use"));
    }

    #[test]
    fn connection_with_delay_and_interpolation() {
        let (arena, _, modules) =
            parse_ok("graph G { output stream float out; connection { [linear] a.out -> [100] -> out; } }");
        let g = arena.module(modules[0]);
        let c = arena.connection(g.connections[0]);
        assert_eq!(c.interpolation, InterpolationType::Linear);
        assert!(c.delay_length.is_some());
    }

    #[test]
    fn fan_out_connection_expands() {
        let (arena, _, modules) =
            parse_ok("graph G { output stream float out1, out2; connection { a.out -> out1, out2; } }");
        assert_eq!(arena.module(modules[0]).connections.len(), 2);
    }

    #[test]
    fn many_to_many_connection_rejected() {
        let e = parse_err("graph G { output stream float o; connection { a.x, b.y -> c.z, d.w; } }");
        assert!(e.message.contains("many-to-many"));
    }

    #[test]
    fn import_is_parsed_then_rejected() {
        let e = parse_err("import some.module;\nnamespace n {}");
        assert!(e.message.contains("not yet implemented"));
    }

    // ── Endpoints ──

    #[test]
    fn event_endpoint_multiple_types() {
        let (arena, _, modules) = parse_ok(
            "processor P { input event (float, int) e; output stream float out; void run() { advance(); } }",
        );
        let p = arena.module(modules[0]);
        let e = arena.endpoint(p.inputs[0]);
        assert_eq!(e.kind, EndpointKind::Event);
        assert_eq!(e.sample_types.len(), 2);
    }

    #[test]
    fn stream_endpoint_multiple_types_rejected() {
        let e = parse_err("processor P { output stream (float, int) out; void run() { advance(); } }");
        assert!(e.message.contains("event endpoints"));
    }

    #[test]
    fn comma_list_of_endpoints_shares_type() {
        let (arena, _, modules) = parse_ok(
            "processor P { output stream float l, r; void run() { advance(); } }",
        );
        let p = arena.module(modules[0]);
        assert_eq!(p.outputs.len(), 2);
        assert_eq!(
            arena.endpoint(p.outputs[0]).sample_types,
            arena.endpoint(p.outputs[1]).sample_types
        );
    }

    #[test]
    fn endpoint_array_and_annotation() {
        let (arena, _, modules) = parse_ok(
            "processor P { output stream float out[2] [[ name: \"stereo\" ]]; void run() { advance(); } }",
        );
        let p = arena.module(modules[0]);
        let out = arena.endpoint(p.outputs[0]);
        assert!(out.array_size.is_some());
        assert_eq!(out.annotation.properties.len(), 1);
    }

    // ── Statements / expressions ──

    fn first_function_body<'x>(arena: &'x Arena, module: ModuleId) -> &'x Block {
        let f = arena.module(module).functions[0];
        let body = arena.function(f).body.unwrap();
        match &arena.stmt(body).kind {
            StmtKind::Block(b) => arena.block(*b),
            _ => panic!("expected block"),
        }
    }

    #[test]
    fn compound_assignment_rewritten() {
        let (arena, _, modules) = parse_ok(
            "processor P { output stream float out; void run() { var x = 1; x += 2; advance(); } }",
        );
        let block = first_function_body(&arena, modules[0]);
        // statements: var decl, noop, `x += 2`, advance
        let assign = block
            .statements
            .iter()
            .find_map(|s| match &arena.stmt(*s).kind {
                StmtKind::Expression(e) => match &arena.expr(*e).kind {
                    ExprKind::Assignment { value, .. } => Some(*value),
                    _ => None,
                },
                _ => None,
            })
            .expect("expected an assignment");
        assert!(matches!(
            arena.expr(assign).kind,
            ExprKind::Binary {
                op: BinaryOp::Add,
                ..
            }
        ));
    }

    #[test]
    fn short_circuit_ops_become_ternaries() {
        let (arena, _, modules) = parse_ok(
            "processor P { output stream float out; void run() { let a = true; let b = false; let c = a && b; let d = a || b; advance(); } }",
        );
        let block = first_function_body(&arena, modules[0]);
        let ternaries = block
            .statements
            .iter()
            .filter(|s| match &arena.stmt(**s).kind {
                StmtKind::VarDecl(v) => {
                    let init = arena.var(*v).initial_value.unwrap();
                    matches!(arena.expr(init).kind, ExprKind::Ternary { .. })
                }
                _ => false,
            })
            .count();
        assert_eq!(ternaries, 2);
    }

    #[test]
    fn stream_write_is_left_shift_binary() {
        let (arena, _, modules) = parse_ok(
            "processor P { output stream float out; void run() { loop { out << 0.0f; advance(); } } }",
        );
        // The `<<` parses as an ordinary binary; the resolver rewrites it.
        let p = arena.module(modules[0]);
        assert_eq!(p.functions.len(), 1);
    }

    #[test]
    fn assignment_inside_expression_rejected() {
        let e = parse_err(
            "processor P { output stream float out; void run() { let x = 1; let y = (x = 2); advance(); } }",
        );
        assert!(e.message.contains("assignment"));
    }

    #[test]
    fn vector_type_with_expression_size() {
        let (arena, _, modules) = parse_ok(
            "processor P { output stream float out; void run() { float<2+2> v; advance(); } }",
        );
        let block = first_function_body(&arena, modules[0]);
        let var = block
            .statements
            .iter()
            .find_map(|s| match &arena.stmt(*s).kind {
                StmtKind::VarDecl(v) => Some(*v),
                _ => None,
            })
            .expect("expected a var decl");
        let t = arena.var(var).declared_type.unwrap();
        assert!(matches!(
            arena.expr(t).kind,
            ExprKind::SubscriptWithChevrons { .. }
        ));
    }

    #[test]
    fn greater_than_still_works_in_expressions() {
        let (_, _, _) = parse_ok(
            "processor P { output stream float out; void run() { let a = 3 > 2; advance(); } }",
        );
    }

    #[test]
    fn nested_subscript_close_brackets() {
        // `a[b[0]]` ends in `]]` which must split into two close brackets
        let (_, _, _) = parse_ok(
            "processor P { output stream float out; int[4] a; int[4] b; void run() { let x = a[b[0]]; advance(); } }",
        );
    }

    #[test]
    fn generic_function_wildcards() {
        let (arena, _, modules) = parse_ok(
            "namespace n { void swap<T> (T& a, T& b) { let t = a; a = b; b = t; } }",
        );
        let ns = arena.module(modules[0]);
        let f = arena.function(ns.functions[0]);
        assert_eq!(f.generic_wildcards.len(), 1);
        assert!(f.is_generic());
        assert_eq!(f.parameters.len(), 2);
    }

    #[test]
    fn function_without_body_is_declaration() {
        let (arena, _, modules) = parse_ok("namespace n { float f (float x); }");
        let f = arena.function(arena.module(modules[0]).functions[0]);
        assert!(f.body.is_none());
    }

    #[test]
    fn specialisation_parameters() {
        let (arena, _, modules) = parse_ok(
            "processor P (using SampleType, int size) { output stream float out; void run() { advance(); } }",
        );
        let p = arena.module(modules[0]);
        assert_eq!(p.specialisation_params.len(), 2);
        assert!(matches!(
            p.specialisation_params[0],
            SpecialisationParam::UsingType(_)
        ));
        assert!(matches!(
            p.specialisation_params[1],
            SpecialisationParam::Value(_)
        ));
    }

    #[test]
    fn graph_processor_alias_param() {
        let (arena, _, modules) = parse_ok(
            "graph G (processor Impl) { output stream float out; let a = Impl; connection { a.out -> out; } }",
        );
        let g = arena.module(modules[0]);
        assert!(matches!(
            g.specialisation_params[0],
            SpecialisationParam::ProcessorAlias(_)
        ));
    }

    #[test]
    fn using_param_on_graph_rejected() {
        let e = parse_err("graph G (using T) { output stream float out; }");
        assert!(e.message.contains("graphs cannot"));
    }

    #[test]
    fn struct_and_using_declarations() {
        let (arena, _, modules) = parse_ok(
            "namespace n { struct Pair { float a, b; int c; } using F = float; }",
        );
        let ns = arena.module(modules[0]);
        assert_eq!(ns.structs.len(), 1);
        let s = arena.struct_decl(ns.structs[0]);
        assert_eq!(s.member_names.len(), 3);
        assert_eq!(ns.usings.len(), 1);
    }

    #[test]
    fn struct_member_cannot_be_const() {
        let e = parse_err("namespace n { struct S { const float x; } }");
        assert!(e.message.contains("cannot be const"));
    }

    #[test]
    fn reference_rejected_on_using_target() {
        let e = parse_err("namespace n { using R = float&; }");
        assert!(e.message.contains("cannot be references"));
    }

    #[test]
    fn external_with_initialiser_rejected() {
        let e = parse_err("processor P { output stream float out; external float x = 1.0f; void run() { advance(); } }");
        assert!(e.message.contains("external"));
    }

    #[test]
    fn event_function_parses() {
        let (arena, _, modules) = parse_ok(
            "processor P { input event float gain; output stream float out; event gain (float g) {} void run() { advance(); } }",
        );
        let p = arena.module(modules[0]);
        let event_fn = p
            .functions
            .iter()
            .find(|f| arena.function(**f).is_event_function)
            .expect("expected an event function");
        assert_eq!(arena.function(*event_fn).parameters.len(), 1);
    }

    #[test]
    fn semicolon_after_module_brace_rejected() {
        let e = parse_err("namespace n { };");
        assert!(e.message.contains("semicolon"));
    }

    #[test]
    fn reserved_word_rejected() {
        let e = parse_err("namespace n { void f() { let switch = 1; } }");
        assert!(e.message.contains("reserved"));
    }

    #[test]
    fn for_loop_parses_into_block() {
        let (arena, _, modules) = parse_ok(
            "processor P { output stream float out; void run() { for (var i = 0; i < 4; ++i) { } advance(); } }",
        );
        let block = first_function_body(&arena, modules[0]);
        let for_block = block
            .statements
            .iter()
            .find_map(|s| match &arena.stmt(*s).kind {
                StmtKind::Block(b) => Some(*b),
                _ => None,
            })
            .expect("for loop should produce a nested block");
        let inner = arena.block(for_block);
        assert!(inner
            .statements
            .iter()
            .any(|s| matches!(arena.stmt(*s).kind, StmtKind::Loop { .. })));
    }

    #[test]
    fn annotations_on_processor() {
        let (arena, _, modules) = parse_ok(
            "processor P [[ main, rate: 44100 ]] { output stream float out; void run() { advance(); } }",
        );
        let p = arena.module(modules[0]);
        assert_eq!(p.annotation.properties.len(), 2);
        assert_eq!(p.annotation.properties[0].key, "main");
    }

    #[test]
    fn clone_function_reparses() {
        let (mut arena, _, modules) = parse_ok("namespace n { float dbl (float x) { return x * 2.0f; } }");
        let module = modules[0];
        let original = arena.module(module).functions[0];
        let clone = clone_function(&mut arena, original).expect("clone should parse");
        assert_ne!(original, clone);
        assert_eq!(arena.module(module).functions.len(), 2);
        assert_eq!(
            arena.function(original).name,
            arena.function(clone).name
        );
    }

    #[test]
    fn clone_processor_reparses_with_new_name() {
        let (mut arena, root, modules) =
            parse_ok("processor P { output stream float out; void run() { advance(); } }");
        let clone =
            clone_processor_with_new_name(&mut arena, modules[0], root, "P_clone").unwrap();
        assert_eq!(arena.name(arena.module(clone).name), "P_clone");
        assert!(arena.module(clone).is_processor());
    }
}
