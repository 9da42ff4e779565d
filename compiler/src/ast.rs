// ast.rs — Arena-allocated AST for the SOUL front-end
//
// All nodes live in one Arena owned by the compiler instance; cross-references
// are typed u32 handles. Nodes are never freed individually — a rewrite
// allocates the replacement and re-points the parent slot, orphaning the old
// node until the arena is dropped. Identifiers are interned; comparisons are
// by handle.
//
// Preconditions: nodes are created by the parser and the resolver's rewriter.
// Postconditions: handles remain valid for the arena's lifetime.
// Failure modes: none (data module; lookups of stale ids panic).
// Side effects: none.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::diag::{Location, Span};
use crate::intrinsics::Intrinsic;
use crate::types::{StructType, Type, Value};

// ── Limits ───────────────────────────────────────────────────────────────

pub const MAX_IDENTIFIER_LENGTH: usize = 128;
pub const MAX_INITIALISER_LIST_LENGTH: usize = 1024 * 64;
pub const MAX_ENDPOINT_ARRAY_SIZE: i64 = 256;
pub const MAX_PROCESSOR_ARRAY_SIZE: i64 = 256;
pub const MAX_DELAY_LINE_LENGTH: i64 = 1024 * 256;
pub const MAX_FUNCTION_PARAMETERS: usize = 127;

// ── Interned names ───────────────────────────────────────────────────────

/// Handle to an interned identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(u32);

#[derive(Debug, Default)]
pub struct Interner {
    map: HashMap<String, Name>,
    strings: Vec<String>,
}

impl Interner {
    pub fn get(&mut self, s: &str) -> Name {
        if let Some(n) = self.map.get(s) {
            return *n;
        }
        let n = Name(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.map.insert(s.to_string(), n);
        n
    }

    pub fn str(&self, n: Name) -> &str {
        &self.strings[n.0 as usize]
    }

    /// Non-interning lookup; None if the string was never interned.
    pub fn lookup(&self, s: &str) -> Option<Name> {
        self.map.get(s).copied()
    }
}

/// A dotted identifier path (`a::b::c` uses `::`; connections use `.`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    pub parts: Vec<Name>,
}

impl Path {
    pub fn single(name: Name) -> Path {
        Path { parts: vec![name] }
    }

    pub fn is_unqualified(&self) -> bool {
        self.parts.len() == 1
    }

    pub fn first(&self) -> Name {
        self.parts[0]
    }

    pub fn last(&self) -> Name {
        *self.parts.last().unwrap()
    }

    pub fn to_string(&self, interner: &Interner) -> String {
        self.parts
            .iter()
            .map(|n| interner.str(*n))
            .collect::<Vec<_>>()
            .join("::")
    }
}

// ── Handles ──────────────────────────────────────────────────────────────

macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(ExprId);
define_id!(StmtId);
define_id!(BlockId);
define_id!(VarId);
define_id!(FunctionId);
define_id!(ModuleId);
define_id!(StructDeclId);
define_id!(UsingId);
define_id!(EndpointId);
define_id!(AliasId);
define_id!(InstanceId);
define_id!(ConnectionId);
define_id!(ScopeId);

// ── Scopes ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module(ModuleId),
    Function(FunctionId),
    Block(BlockId),
}

#[derive(Debug, Clone, Copy)]
pub struct ScopeInfo {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
}

// ── Context ──────────────────────────────────────────────────────────────

/// Every node carries its source location and lexical scope.
#[derive(Debug, Clone)]
pub struct Context {
    pub location: Location,
    pub scope: ScopeId,
}

// ── Annotations ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Annotation {
    pub properties: Vec<AnnotationProperty>,
}

#[derive(Debug, Clone)]
pub struct AnnotationProperty {
    pub key: String,
    pub key_location: Location,
    pub value: ExprId,
}

impl Annotation {
    pub fn find(&self, key: &str) -> Option<&AnnotationProperty> {
        self.properties.iter().find(|p| p.key == key)
    }
}

// ── Expressions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprClass {
    Value,
    Type,
    Endpoint,
    Processor,
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constness {
    DefinitelyConst,
    NotConst,
    Unknown,
}

/// Type meta-function operations (`.size`, `.elementType`, `const T`, `T&`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaOp {
    MakeConst,
    MakeReference,
    ElementType,
    PrimitiveType,
    Size,
    IsStruct,
    IsArray,
    IsDynamicArray,
    IsFixedSizeArray,
    IsVector,
    IsPrimitive,
    IsFloat,
    IsFloat32,
    IsFloat64,
    IsInt,
    IsInt32,
    IsInt64,
    IsScalar,
    IsString,
    IsBool,
    IsReference,
    IsConst,
}

impl MetaOp {
    pub fn returns_a_type(self) -> bool {
        matches!(
            self,
            MetaOp::MakeConst | MetaOp::MakeReference | MetaOp::ElementType | MetaOp::PrimitiveType
        )
    }

    pub fn for_name(name: &str) -> Option<MetaOp> {
        Some(match name {
            "elementType" => MetaOp::ElementType,
            "primitiveType" => MetaOp::PrimitiveType,
            "size" => MetaOp::Size,
            "isStruct" => MetaOp::IsStruct,
            "isArray" => MetaOp::IsArray,
            "isDynamicArray" => MetaOp::IsDynamicArray,
            "isFixedSizeArray" => MetaOp::IsFixedSizeArray,
            "isVector" => MetaOp::IsVector,
            "isPrimitive" => MetaOp::IsPrimitive,
            "isFloat" => MetaOp::IsFloat,
            "isFloat32" => MetaOp::IsFloat32,
            "isFloat64" => MetaOp::IsFloat64,
            "isInt" => MetaOp::IsInt,
            "isInt32" => MetaOp::IsInt32,
            "isInt64" => MetaOp::IsInt64,
            "isScalar" => MetaOp::IsScalar,
            "isString" => MetaOp::IsString,
            "isBool" => MetaOp::IsBool,
            "isReference" => MetaOp::IsReference,
            "isConst" => MetaOp::IsConst,
            _ => return None,
        })
    }

    /// Evaluates a value-returning meta-op against a resolved type.
    pub fn perform(self, source: &Type) -> Option<Value> {
        Some(match self {
            MetaOp::Size => {
                let size = if source.is_bounded_int() {
                    source.bounded_int_limit()?
                } else {
                    source.array_or_vector_size()?
                };
                if size > 0x7fff_ffff {
                    Value::Int64(size as i64)
                } else {
                    Value::Int32(size as i32)
                }
            }
            MetaOp::IsStruct => Value::Bool(source.is_struct()),
            MetaOp::IsArray => Value::Bool(source.is_array()),
            MetaOp::IsDynamicArray => Value::Bool(source.is_unsized_array()),
            MetaOp::IsFixedSizeArray => Value::Bool(source.is_fixed_size_array()),
            MetaOp::IsVector => Value::Bool(source.is_vector()),
            MetaOp::IsPrimitive => Value::Bool(source.is_primitive()),
            MetaOp::IsFloat => Value::Bool(source.is_primitive_float()),
            MetaOp::IsFloat32 => {
                Value::Bool(source.primitive() == Some(crate::types::Primitive::Float32) && source.is_primitive())
            }
            MetaOp::IsFloat64 => {
                Value::Bool(source.primitive() == Some(crate::types::Primitive::Float64) && source.is_primitive())
            }
            MetaOp::IsInt => Value::Bool(source.is_primitive_integer()),
            MetaOp::IsInt32 => {
                Value::Bool(source.primitive() == Some(crate::types::Primitive::Int32) && source.is_primitive())
            }
            MetaOp::IsInt64 => {
                Value::Bool(source.primitive() == Some(crate::types::Primitive::Int64) && source.is_primitive())
            }
            MetaOp::IsScalar => Value::Bool(source.is_scalar()),
            MetaOp::IsString => Value::Bool(source.is_string_literal()),
            MetaOp::IsBool => Value::Bool(source.is_primitive_bool()),
            MetaOp::IsReference => Value::Bool(source.is_reference()),
            MetaOp::IsConst => Value::Bool(source.is_const()),
            _ => return None,
        })
    }

    /// Applies a type-returning meta-op to a resolved type.
    pub fn apply_to_type(self, source: &Type) -> Option<Type> {
        match self {
            MetaOp::MakeConst => Some(source.make_const()),
            MetaOp::MakeReference => Some(source.make_reference()),
            MetaOp::ElementType => source.element_type(),
            MetaOp::PrimitiveType => source.primitive().map(Type::Primitive),
            _ => None,
        }
    }
}

/// Properties readable off the enclosing processor (`processor.frequency`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorProperty {
    Frequency,
    Period,
    Id,
    Session,
}

impl ProcessorProperty {
    pub fn for_name(name: &str) -> Option<ProcessorProperty> {
        Some(match name {
            "frequency" => ProcessorProperty::Frequency,
            "period" => ProcessorProperty::Period,
            "id" => ProcessorProperty::Id,
            "session" => ProcessorProperty::Session,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ProcessorProperty::Frequency => "frequency",
            ProcessorProperty::Period => "period",
            ProcessorProperty::Id => "id",
            ProcessorProperty::Session => "session",
        }
    }

    pub fn result_type(self) -> Type {
        match self {
            ProcessorProperty::Frequency | ProcessorProperty::Period => Type::float64(),
            ProcessorProperty::Id | ProcessorProperty::Session => Type::int32(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Constant(Value),
    QualifiedIdentifier(Path),
    VariableRef(VarId),
    /// Unresolved `lhs.rhs`; rhs is a QualifiedIdentifier expression.
    DotOperator { lhs: ExprId, rhs: ExprId },
    /// Resolved struct member access.
    StructMemberRef {
        object: ExprId,
        structure: Rc<StructType>,
        member_index: usize,
    },
    /// `object[start]`, or a slice `object[start:end]`.
    ArrayElementRef {
        object: ExprId,
        start: Option<ExprId>,
        end: Option<ExprId>,
        is_slice: bool,
        suppress_wrap_warning: bool,
    },
    /// `lhs[rhs]` before the type resolver decides type vs. element access.
    SubscriptWithBrackets { lhs: ExprId, rhs: Option<ExprId> },
    /// `lhs<rhs>` before the type resolver folds it into a vector type.
    SubscriptWithChevrons { lhs: ExprId, rhs: ExprId },
    TypeCast { target: Type, source: ExprId },
    /// `name(args)` before overload resolution decides call vs. cast.
    CallOrCast {
        callee: ExprId,
        args: Option<ExprId>,
        is_method_call: bool,
    },
    FunctionCall {
        function: FunctionId,
        args: Option<ExprId>,
    },
    Binary {
        op: crate::types::BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Unary {
        op: crate::types::UnaryOp,
        source: ExprId,
    },
    Ternary {
        condition: ExprId,
        true_branch: ExprId,
        false_branch: ExprId,
    },
    Assignment { target: ExprId, value: ExprId },
    PreOrPostIncDec {
        target: ExprId,
        is_increment: bool,
        is_post: bool,
    },
    WriteToEndpoint { target: ExprId, value: ExprId },
    OutputEndpointRef(EndpointId),
    InputEndpointRef(EndpointId),
    ProcessorRef(ModuleId),
    ProcessorProperty(ProcessorProperty),
    TypeMetaFunction { op: MetaOp, source: ExprId },
    CommaSeparatedList(Vec<ExprId>),
    ConcreteType(Type),
    AdvanceClock,
    StaticAssertion { condition: ExprId, message: String },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub context: Context,
}

// ── Statements ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum StmtKind {
    Block(BlockId),
    If {
        condition: ExprId,
        true_branch: StmtId,
        false_branch: Option<StmtId>,
    },
    /// All loop forms: while, do/while, for, loop, loop(N).
    Loop {
        condition: Option<ExprId>,
        num_iterations: Option<ExprId>,
        iterator: Option<ExprId>,
        body: StmtId,
        is_do_loop: bool,
    },
    Return { value: Option<ExprId> },
    Break,
    Continue,
    Noop,
    Expression(ExprId),
    VarDecl(VarId),
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub context: Context,
}

#[derive(Debug)]
pub struct Block {
    pub statements: Vec<StmtId>,
    pub scope: ScopeId,
    pub function: Option<FunctionId>,
}

// ── Declarations ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct VarDecl {
    pub name: Name,
    pub context: Context,
    pub declared_type: Option<ExprId>,
    pub initial_value: Option<ExprId>,
    pub is_external: bool,
    pub is_const: bool,
    pub is_function_parameter: bool,
    pub annotation: Annotation,
    pub num_reads: u32,
    pub num_writes: u32,
    /// Index of the generated HEART variable, installed during lowering.
    pub generated: Option<u32>,
}

#[derive(Debug)]
pub struct FunctionDecl {
    pub name: Name,
    pub context: Context,
    pub name_location: Location,
    pub return_type: ExprId,
    pub parameters: Vec<VarId>,
    pub body: Option<StmtId>,
    pub scope: ScopeId,
    pub annotation: Annotation,
    pub intrinsic: Option<Intrinsic>,
    pub is_event_function: bool,
    pub generic_wildcards: Vec<ExprId>,
    pub generic_specialisations: Vec<UsingId>,
    pub original_generic_function: Option<FunctionId>,
    /// Source range of the whole declaration, for clone-by-reparse.
    pub source_range: Option<Location>,
    /// Name of the generated HEART function, installed during lowering.
    pub generated: Option<(usize, usize)>,
}

impl FunctionDecl {
    pub fn is_generic(&self) -> bool {
        !self.generic_wildcards.is_empty()
    }
}

#[derive(Debug)]
pub struct StructDecl {
    pub name: Name,
    pub context: Context,
    /// The shared struct type this declaration defines; members are filled
    /// in once every member type expression resolves.
    pub structure: Rc<StructType>,
    pub member_types: Vec<ExprId>,
    pub member_names: Vec<Name>,
    pub members_resolved: bool,
}

#[derive(Debug)]
pub struct UsingDecl {
    pub name: Name,
    pub context: Context,
    /// None while declared as an unbound specialisation parameter.
    pub target: Option<ExprId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Stream,
    Value,
    Event,
}

impl EndpointKind {
    pub fn name(self) -> &'static str {
        match self {
            EndpointKind::Stream => "stream",
            EndpointKind::Value => "value",
            EndpointKind::Event => "event",
        }
    }
}

#[derive(Debug)]
pub struct EndpointDecl {
    pub name: Name,
    pub context: Context,
    pub is_input: bool,
    pub kind: EndpointKind,
    pub sample_types: Vec<ExprId>,
    pub array_size: Option<ExprId>,
    pub annotation: Annotation,
}

#[derive(Debug)]
pub struct ProcessorAlias {
    pub name: Name,
    pub context: Context,
    pub target: Option<ModuleId>,
}

#[derive(Debug)]
pub struct ProcessorInstance {
    pub context: Context,
    pub instance_name: ExprId,
    pub target_processor: ExprId,
    pub array_size: Option<ExprId>,
    pub specialisation_args: Vec<ExprId>,
    pub clock_multiplier_ratio: Option<ExprId>,
    pub clock_divider_ratio: Option<ExprId>,
    pub was_created_implicitly: bool,
    pub resolved_target: Option<ModuleId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationType {
    None,
    Linear,
    Sinc,
    Fast,
}

impl InterpolationType {
    pub fn for_name(name: &str) -> Option<InterpolationType> {
        Some(match name {
            "linear" => InterpolationType::Linear,
            "sinc" => InterpolationType::Sinc,
            "fast" => InterpolationType::Fast,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            InterpolationType::None => "none",
            InterpolationType::Linear => "linear",
            InterpolationType::Sinc => "sinc",
            InterpolationType::Fast => "fast",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NameAndChannel {
    /// Empty path means "this graph's own endpoint".
    pub processor_name: Option<ExprId>,
    pub channel: Name,
    pub channel_location: Location,
}

#[derive(Debug)]
pub struct Connection {
    pub context: Context,
    pub interpolation: InterpolationType,
    pub source: NameAndChannel,
    pub dest: NameAndChannel,
    pub delay_length: Option<ExprId>,
}

// ── Modules ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Namespace,
    Processor,
    Graph,
}

#[derive(Debug, Clone)]
pub enum SpecialisationParam {
    UsingType(UsingId),
    ProcessorAlias(AliasId),
    Value(VarId),
}

#[derive(Debug)]
pub struct Module {
    pub kind: ModuleKind,
    pub name: Name,
    pub context: Context,
    pub scope: ScopeId,
    pub sub_modules: Vec<ModuleId>,
    pub functions: Vec<FunctionId>,
    pub structs: Vec<StructDeclId>,
    pub usings: Vec<UsingId>,
    pub aliases: Vec<AliasId>,
    /// Processor state variables, or namespace constants.
    pub state_variables: Vec<VarId>,
    pub inputs: Vec<EndpointId>,
    pub outputs: Vec<EndpointId>,
    pub instances: Vec<InstanceId>,
    pub connections: Vec<ConnectionId>,
    pub specialisation_params: Vec<SpecialisationParam>,
    pub annotation: Annotation,
    pub imports: Vec<String>,
    pub is_fully_resolved: bool,
    /// True for clones minted by the specialiser; they never become the
    /// default main processor.
    pub is_specialised_clone: bool,
    /// Source range of the whole declaration, for clone-by-reparse.
    pub source_range: Option<Location>,
}

impl Module {
    pub fn is_processor(&self) -> bool {
        self.kind == ModuleKind::Processor
    }

    pub fn is_graph(&self) -> bool {
        self.kind == ModuleKind::Graph
    }

    pub fn is_namespace(&self) -> bool {
        self.kind == ModuleKind::Namespace
    }

    pub fn is_processor_or_graph(&self) -> bool {
        !self.is_namespace()
    }
}

// ── Name search ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoundItem {
    Variable(VarId),
    Function(FunctionId),
    Module(ModuleId),
    Struct(StructDeclId),
    Using(UsingId),
    Alias(AliasId),
    Endpoint(EndpointId),
}

#[derive(Debug, Clone, Copy)]
pub struct NameSearchOptions {
    pub find_variables: bool,
    pub find_types: bool,
    pub find_functions: bool,
    pub find_processors_and_namespaces: bool,
    pub find_endpoints: bool,
    pub stop_at_first_scope_with_results: bool,
    pub required_num_function_args: Option<usize>,
}

// ── Arena ────────────────────────────────────────────────────────────────

/// Single owner of every AST node for one compilation.
#[derive(Debug, Default)]
pub struct Arena {
    pub interner: Interner,
    pub exprs: Vec<Expr>,
    pub stmts: Vec<Stmt>,
    pub blocks: Vec<Block>,
    pub vars: Vec<VarDecl>,
    pub functions: Vec<FunctionDecl>,
    pub modules: Vec<Module>,
    pub structs: Vec<StructDecl>,
    pub usings: Vec<UsingDecl>,
    pub endpoints: Vec<EndpointDecl>,
    pub aliases: Vec<ProcessorAlias>,
    pub instances: Vec<ProcessorInstance>,
    pub connections: Vec<Connection>,
    pub scopes: Vec<ScopeInfo>,
}

impl Arena {
    pub fn new() -> Arena {
        Arena::default()
    }

    // ── Allocation ──

    pub fn alloc_expr(&mut self, kind: ExprKind, context: Context) -> ExprId {
        self.exprs.push(Expr { kind, context });
        ExprId(self.exprs.len() as u32 - 1)
    }

    pub fn alloc_stmt(&mut self, kind: StmtKind, context: Context) -> StmtId {
        self.stmts.push(Stmt { kind, context });
        StmtId(self.stmts.len() as u32 - 1)
    }

    pub fn alloc_block(&mut self, block: Block) -> BlockId {
        self.blocks.push(block);
        BlockId(self.blocks.len() as u32 - 1)
    }

    pub fn alloc_var(&mut self, var: VarDecl) -> VarId {
        self.vars.push(var);
        VarId(self.vars.len() as u32 - 1)
    }

    pub fn alloc_function(&mut self, f: FunctionDecl) -> FunctionId {
        self.functions.push(f);
        FunctionId(self.functions.len() as u32 - 1)
    }

    pub fn alloc_module(&mut self, m: Module) -> ModuleId {
        self.modules.push(m);
        ModuleId(self.modules.len() as u32 - 1)
    }

    pub fn alloc_struct(&mut self, s: StructDecl) -> StructDeclId {
        self.structs.push(s);
        StructDeclId(self.structs.len() as u32 - 1)
    }

    pub fn alloc_using(&mut self, u: UsingDecl) -> UsingId {
        self.usings.push(u);
        UsingId(self.usings.len() as u32 - 1)
    }

    pub fn alloc_endpoint(&mut self, e: EndpointDecl) -> EndpointId {
        self.endpoints.push(e);
        EndpointId(self.endpoints.len() as u32 - 1)
    }

    pub fn alloc_alias(&mut self, a: ProcessorAlias) -> AliasId {
        self.aliases.push(a);
        AliasId(self.aliases.len() as u32 - 1)
    }

    pub fn alloc_instance(&mut self, i: ProcessorInstance) -> InstanceId {
        self.instances.push(i);
        InstanceId(self.instances.len() as u32 - 1)
    }

    pub fn alloc_connection(&mut self, c: Connection) -> ConnectionId {
        self.connections.push(c);
        ConnectionId(self.connections.len() as u32 - 1)
    }

    pub fn alloc_scope(&mut self, kind: ScopeKind, parent: Option<ScopeId>) -> ScopeId {
        self.scopes.push(ScopeInfo { kind, parent });
        ScopeId(self.scopes.len() as u32 - 1)
    }

    // ── Accessors ──

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.index()]
    }

    pub fn expr_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.exprs[id.index()]
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.index()]
    }

    pub fn stmt_mut(&mut self, id: StmtId) -> &mut Stmt {
        &mut self.stmts[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn var(&self, id: VarId) -> &VarDecl {
        &self.vars[id.index()]
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut VarDecl {
        &mut self.vars[id.index()]
    }

    pub fn function(&self, id: FunctionId) -> &FunctionDecl {
        &self.functions[id.index()]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut FunctionDecl {
        &mut self.functions[id.index()]
    }

    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.index()]
    }

    pub fn module_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.index()]
    }

    pub fn struct_decl(&self, id: StructDeclId) -> &StructDecl {
        &self.structs[id.index()]
    }

    pub fn struct_decl_mut(&mut self, id: StructDeclId) -> &mut StructDecl {
        &mut self.structs[id.index()]
    }

    pub fn using(&self, id: UsingId) -> &UsingDecl {
        &self.usings[id.index()]
    }

    pub fn using_mut(&mut self, id: UsingId) -> &mut UsingDecl {
        &mut self.usings[id.index()]
    }

    pub fn endpoint(&self, id: EndpointId) -> &EndpointDecl {
        &self.endpoints[id.index()]
    }

    pub fn endpoint_mut(&mut self, id: EndpointId) -> &mut EndpointDecl {
        &mut self.endpoints[id.index()]
    }

    pub fn alias(&self, id: AliasId) -> &ProcessorAlias {
        &self.aliases[id.index()]
    }

    pub fn alias_mut(&mut self, id: AliasId) -> &mut ProcessorAlias {
        &mut self.aliases[id.index()]
    }

    pub fn instance(&self, id: InstanceId) -> &ProcessorInstance {
        &self.instances[id.index()]
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> &mut ProcessorInstance {
        &mut self.instances[id.index()]
    }

    pub fn connection(&self, id: ConnectionId) -> &Connection {
        &self.connections[id.index()]
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> &mut Connection {
        &mut self.connections[id.index()]
    }

    pub fn scope(&self, id: ScopeId) -> &ScopeInfo {
        &self.scopes[id.index()]
    }

    pub fn name(&self, n: Name) -> &str {
        self.interner.str(n)
    }

    // ── Scope navigation ──

    /// The nearest module containing a scope.
    pub fn enclosing_module(&self, mut scope: ScopeId) -> Option<ModuleId> {
        loop {
            let info = self.scope(scope);
            if let ScopeKind::Module(m) = info.kind {
                return Some(m);
            }
            scope = info.parent?;
        }
    }

    /// The nearest function containing a scope.
    pub fn enclosing_function(&self, mut scope: ScopeId) -> Option<FunctionId> {
        loop {
            let info = self.scope(scope);
            match info.kind {
                ScopeKind::Function(f) => return Some(f),
                ScopeKind::Module(_) => return None,
                ScopeKind::Block(_) => scope = info.parent?,
            }
        }
    }

    /// Dotted path of a module, omitting the root namespace.
    pub fn fully_qualified_module_name(&self, id: ModuleId) -> String {
        let mut parts = Vec::new();
        let mut current = id;
        loop {
            let module = self.module(current);
            match self.enclosing_module(module.context.scope) {
                Some(parent) if parent != current => {
                    parts.push(self.name(module.name).to_string());
                    current = parent;
                }
                _ => {
                    if parts.is_empty() {
                        parts.push(self.name(module.name).to_string());
                    }
                    break;
                }
            }
        }
        parts.reverse();
        parts.join("::")
    }

    // ── Expression queries ──

    pub fn expr_location(&self, id: ExprId) -> Location {
        self.expr(id).context.location.clone()
    }

    /// The three-plus-two-valued expression classification.
    pub fn classify(&self, id: ExprId) -> ExprClass {
        match &self.expr(id).kind {
            ExprKind::Constant(_) => ExprClass::Value,
            ExprKind::QualifiedIdentifier(_) => ExprClass::Unresolved,
            ExprKind::VariableRef(_) => ExprClass::Value,
            ExprKind::DotOperator { .. } => ExprClass::Unresolved,
            ExprKind::StructMemberRef { .. } => ExprClass::Value,
            ExprKind::ArrayElementRef { object, .. } => match self.classify(*object) {
                ExprClass::Endpoint => ExprClass::Endpoint,
                _ => ExprClass::Value,
            },
            ExprKind::SubscriptWithBrackets { .. } => ExprClass::Unresolved,
            ExprKind::SubscriptWithChevrons { .. } => ExprClass::Unresolved,
            ExprKind::TypeCast { .. } => ExprClass::Value,
            ExprKind::CallOrCast { .. } => ExprClass::Unresolved,
            ExprKind::FunctionCall { .. } => ExprClass::Value,
            ExprKind::Binary { .. } => ExprClass::Value,
            ExprKind::Unary { .. } => ExprClass::Value,
            ExprKind::Ternary { .. } => ExprClass::Value,
            ExprKind::Assignment { .. } => ExprClass::Value,
            ExprKind::PreOrPostIncDec { .. } => ExprClass::Value,
            ExprKind::WriteToEndpoint { .. } => ExprClass::Endpoint,
            ExprKind::OutputEndpointRef(_) => ExprClass::Endpoint,
            // reading an input is a value
            ExprKind::InputEndpointRef(_) => ExprClass::Value,
            ExprKind::ProcessorRef(_) => ExprClass::Processor,
            ExprKind::ProcessorProperty(_) => ExprClass::Value,
            ExprKind::TypeMetaFunction { op, .. } => {
                if op.returns_a_type() {
                    ExprClass::Type
                } else {
                    ExprClass::Value
                }
            }
            ExprKind::CommaSeparatedList(_) => ExprClass::Value,
            ExprKind::ConcreteType(_) => ExprClass::Type,
            ExprKind::AdvanceClock => ExprClass::Value,
            ExprKind::StaticAssertion { .. } => ExprClass::Value,
        }
    }

    pub fn is_possibly_value(&self, id: ExprId) -> bool {
        matches!(self.classify(id), ExprClass::Value | ExprClass::Unresolved)
    }

    pub fn is_possibly_endpoint(&self, id: ExprId) -> bool {
        matches!(self.classify(id), ExprClass::Endpoint | ExprClass::Unresolved)
    }

    /// True for an output endpoint reference, a chained endpoint write, or
    /// an element of an output endpoint — the shapes `<<` writes to.
    pub fn is_output_endpoint(&self, id: ExprId) -> bool {
        match &self.expr(id).kind {
            ExprKind::OutputEndpointRef(_) | ExprKind::WriteToEndpoint { .. } => true,
            ExprKind::ArrayElementRef { object, .. } => {
                matches!(self.expr(*object).kind, ExprKind::OutputEndpointRef(_))
            }
            _ => false,
        }
    }

    /// Resolves an expression as a type, if it is one.
    pub fn resolve_as_type(&self, id: ExprId) -> Option<Type> {
        match &self.expr(id).kind {
            ExprKind::ConcreteType(t) => Some(t.clone()),
            ExprKind::TypeMetaFunction { op, source } => {
                let source_type = self.resolve_as_type(*source)?;
                op.apply_to_type(&source_type)
            }
            _ => None,
        }
    }

    pub fn is_resolved_as_type(&self, id: ExprId) -> bool {
        self.resolve_as_type(id).is_some()
    }

    pub fn is_resolved_as_value(&self, id: ExprId) -> bool {
        self.classify(id) == ExprClass::Value && self.is_resolved(id)
    }

    pub fn is_resolved_as_endpoint(&self, id: ExprId) -> bool {
        matches!(
            self.expr(id).kind,
            ExprKind::OutputEndpointRef(_) | ExprKind::InputEndpointRef(_)
        )
    }

    pub fn is_resolved_as_processor(&self, id: ExprId) -> bool {
        matches!(self.expr(id).kind, ExprKind::ProcessorRef(_))
    }

    /// Whether every name/type/call inside this expression is resolved.
    pub fn is_resolved(&self, id: ExprId) -> bool {
        match &self.expr(id).kind {
            ExprKind::Constant(_) => true,
            ExprKind::QualifiedIdentifier(_)
            | ExprKind::DotOperator { .. }
            | ExprKind::SubscriptWithBrackets { .. }
            | ExprKind::SubscriptWithChevrons { .. }
            | ExprKind::CallOrCast { .. } => false,
            ExprKind::VariableRef(v) => self.var_is_resolved(*v),
            ExprKind::StructMemberRef { object, .. } => self.is_resolved(*object),
            ExprKind::ArrayElementRef { object, start, end, .. } => {
                self.is_resolved(*object)
                    && start.map_or(true, |s| self.is_resolved(s))
                    && end.map_or(true, |e| self.is_resolved(e))
            }
            ExprKind::TypeCast { source, .. } => self.is_resolved(*source),
            ExprKind::FunctionCall { function, args } => {
                self.is_resolved_as_type(self.function(*function).return_type)
                    && args.map_or(true, |a| self.is_resolved(a))
            }
            ExprKind::Binary { lhs, rhs, .. } => self.is_resolved(*lhs) && self.is_resolved(*rhs),
            ExprKind::Unary { source, .. } => self.is_resolved(*source),
            ExprKind::Ternary {
                condition,
                true_branch,
                false_branch,
            } => {
                self.is_resolved(*condition)
                    && self.is_resolved(*true_branch)
                    && self.is_resolved(*false_branch)
            }
            ExprKind::Assignment { target, value } => {
                self.is_resolved(*target) && self.is_resolved(*value)
            }
            ExprKind::PreOrPostIncDec { target, .. } => self.is_resolved(*target),
            ExprKind::WriteToEndpoint { target, value } => {
                self.is_resolved(*target) && self.is_resolved(*value)
            }
            ExprKind::OutputEndpointRef(e) | ExprKind::InputEndpointRef(e) => {
                self.endpoint_is_resolved(*e)
            }
            ExprKind::ProcessorRef(_) => true,
            ExprKind::ProcessorProperty(_) => true,
            ExprKind::TypeMetaFunction { op, source } => {
                if let Some(t) = self.resolve_as_type(*source) {
                    if op.returns_a_type() {
                        op.apply_to_type(&t).is_some()
                    } else {
                        op.perform(&t).is_some()
                    }
                } else if self.is_resolved_as_value(*source) {
                    // meta-functions also apply to a value's type
                    self.result_type(*source)
                        .map(|t| {
                            if op.returns_a_type() {
                                op.apply_to_type(&t).is_some()
                            } else {
                                op.perform(&t).is_some()
                            }
                        })
                        .unwrap_or(false)
                } else {
                    false
                }
            }
            ExprKind::CommaSeparatedList(items) => items.iter().all(|i| self.is_resolved(*i)),
            ExprKind::ConcreteType(_) => true,
            ExprKind::AdvanceClock => true,
            ExprKind::StaticAssertion { condition, .. } => self.is_resolved(*condition),
        }
    }

    pub fn var_is_resolved(&self, id: VarId) -> bool {
        let v = self.var(id);
        if let Some(t) = v.declared_type {
            self.is_resolved_as_type(t)
        } else if let Some(init) = v.initial_value {
            self.is_resolved(init)
        } else {
            false
        }
    }

    pub fn endpoint_is_resolved(&self, id: EndpointId) -> bool {
        let e = self.endpoint(id);
        e.sample_types.iter().all(|t| self.is_resolved_as_type(*t))
            && e.array_size
                .map_or(true, |s| self.get_as_constant(s).is_some())
    }

    /// Declared or inferred type of a variable, with constness applied.
    pub fn var_type(&self, id: VarId) -> Option<Type> {
        let v = self.var(id);
        let base = if let Some(t) = v.declared_type {
            self.resolve_as_type(t)?
        } else {
            self.result_type(v.initial_value?)?
        };
        if (v.is_const || v.is_external) && !base.is_const() && !base.is_reference() {
            Some(base.make_const())
        } else {
            Some(base)
        }
    }

    /// The result type of a resolved value expression.
    pub fn result_type(&self, id: ExprId) -> Option<Type> {
        match &self.expr(id).kind {
            ExprKind::Constant(v) => Some(v.type_of()),
            ExprKind::VariableRef(v) => self.var_type(*v),
            ExprKind::StructMemberRef {
                structure,
                member_index,
                ..
            } => structure.members.borrow().get(*member_index).map(|m| m.ty.clone()),
            ExprKind::ArrayElementRef {
                object,
                start,
                end,
                is_slice,
                ..
            } => {
                let object_type = if self.is_resolved_as_endpoint(*object) {
                    self.endpoint_sample_array_type(*object)?
                } else {
                    self.result_type(*object)?
                };
                if *is_slice {
                    let (s, e) = self.resolved_slice_range(object_type.array_or_vector_size()?, *start, *end)?;
                    Some(object_type.element_type()?.create_array(e - s))
                } else {
                    object_type.element_type()
                }
            }
            ExprKind::TypeCast { target, .. } => Some(target.clone()),
            ExprKind::FunctionCall { function, .. } => {
                self.resolve_as_type(self.function(*function).return_type)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let operand = op.operand_type(&self.result_type(*lhs)?, &self.result_type(*rhs)?)?;
                Some(op.result_type(&operand))
            }
            ExprKind::Unary { source, .. } => self.result_type(*source),
            ExprKind::Ternary { true_branch, .. } => {
                self.result_type(*true_branch).map(|t| t.remove_const_if_present())
            }
            ExprKind::Assignment { .. } => Some(Type::void()),
            ExprKind::PreOrPostIncDec { target, .. } => {
                self.result_type(*target).map(|t| t.remove_reference_if_present())
            }
            ExprKind::InputEndpointRef(e) => {
                let endpoint = self.endpoint(*e);
                self.resolve_as_type(*endpoint.sample_types.first()?)
            }
            ExprKind::ProcessorProperty(p) => Some(p.result_type()),
            ExprKind::TypeMetaFunction { op, source } => {
                if op.returns_a_type() {
                    return None;
                }
                let t = self
                    .resolve_as_type(*source)
                    .or_else(|| self.result_type(*source))?;
                op.perform(&t).map(|v| v.type_of())
            }
            _ => None,
        }
    }

    /// Sample type of an endpoint, with the endpoint's array dimension
    /// applied (used when subscripting an endpoint array).
    pub fn endpoint_sample_array_type(&self, endpoint_ref: ExprId) -> Option<Type> {
        let e = match &self.expr(endpoint_ref).kind {
            ExprKind::OutputEndpointRef(e) | ExprKind::InputEndpointRef(e) => *e,
            _ => return None,
        };
        let endpoint = self.endpoint(e);
        let sample = self.resolve_as_type(*endpoint.sample_types.first()?)?;
        match endpoint.array_size {
            Some(size_expr) => {
                let size = self.get_as_constant(size_expr)?.as_i64()?;
                Some(sample.create_array(size as u64))
            }
            None => Some(sample),
        }
    }

    fn resolved_slice_range(
        &self,
        size: u64,
        start: Option<ExprId>,
        end: Option<ExprId>,
    ) -> Option<(u64, u64)> {
        let s = match start {
            Some(e) => self.get_as_constant(e)?.as_i64()?,
            None => 0,
        };
        let e = match end {
            Some(e) => self.get_as_constant(e)?.as_i64()?,
            None => size as i64,
        };
        let s = if s < 0 { size as i64 + s } else { s };
        let e = if e < 0 { size as i64 + e } else { e };
        if s >= 0 && e > s && e <= size as i64 {
            Some((s as u64, e as u64))
        } else {
            None
        }
    }

    /// Slice bounds for a resolved ArrayElementRef slice.
    pub fn slice_range(&self, id: ExprId) -> Option<(u64, u64)> {
        if let ExprKind::ArrayElementRef {
            object,
            start,
            end,
            is_slice: true,
            ..
        } = &self.expr(id).kind
        {
            let object_type = self.result_type(*object)?;
            self.resolved_slice_range(object_type.array_or_vector_size()?, *start, *end)
        } else {
            None
        }
    }

    /// Compile-time constant value of an expression, if it has one.
    pub fn get_as_constant(&self, id: ExprId) -> Option<Value> {
        match &self.expr(id).kind {
            ExprKind::Constant(v) => Some(v.clone()),
            ExprKind::VariableRef(v) => {
                let var = self.var(*v);
                if var.num_writes == 0 && !var.is_external {
                    let init = var.initial_value?;
                    if let ExprKind::Constant(value) = &self.expr(init).kind {
                        return Some(value.clone());
                    }
                }
                None
            }
            _ => None,
        }
    }

    pub fn is_compile_time_constant(&self, id: ExprId) -> bool {
        self.get_as_constant(id).is_some()
    }

    /// True if the expression may appear as an assignment target.
    pub fn is_assignable(&self, id: ExprId) -> bool {
        match &self.expr(id).kind {
            ExprKind::VariableRef(v) => {
                let var = self.var(*v);
                if var.is_external || var.is_const {
                    return false;
                }
                match self.var_type(*v) {
                    Some(t) => !t.is_const(),
                    None => true,
                }
            }
            ExprKind::StructMemberRef { object, .. } => self.is_assignable(*object),
            ExprKind::ArrayElementRef { object, .. } => {
                self.is_resolved_as_endpoint(*object) || self.is_assignable(*object)
            }
            _ => false,
        }
    }

    pub fn constness(&self, id: ExprId) -> Constness {
        if let Some(t) = self.resolve_as_type(id) {
            return if t.is_const() {
                Constness::DefinitelyConst
            } else {
                Constness::NotConst
            };
        }
        if let ExprKind::TypeMetaFunction {
            op: MetaOp::MakeConst,
            ..
        } = self.expr(id).kind
        {
            return Constness::DefinitelyConst;
        }
        Constness::Unknown
    }

    // ── Name search ──

    /// Walks the scope chain looking for `path`. At each lexical level the
    /// first path part is matched; qualified paths descend sub-modules.
    /// `position` optionally restricts block-scope hits to statements at or
    /// before the given index per block (so a local is invisible before its
    /// declaration).
    pub fn perform_name_search(
        &self,
        start_scope: ScopeId,
        path: &Path,
        opts: &NameSearchOptions,
        position: Option<&[(BlockId, usize)]>,
    ) -> Vec<FoundItem> {
        let mut results = Vec::new();
        let mut scope = Some(start_scope);

        while let Some(s) = scope {
            let info = self.scope(s);
            let found_here = self.search_one_scope(info.kind, path, opts, position);
            if !found_here.is_empty() {
                results.extend(found_here);
                if opts.stop_at_first_scope_with_results {
                    return results;
                }
            }
            scope = info.parent;
        }

        results
    }

    fn search_one_scope(
        &self,
        kind: ScopeKind,
        path: &Path,
        opts: &NameSearchOptions,
        position: Option<&[(BlockId, usize)]>,
    ) -> Vec<FoundItem> {
        match kind {
            ScopeKind::Module(m) => {
                if path.is_unqualified() {
                    self.search_module(m, path.first(), opts)
                } else {
                    // Descend sub-modules for the leading parts.
                    let mut current = match self.find_sub_module(m, path.first()) {
                        Some(sub) => sub,
                        None => return Vec::new(),
                    };
                    for part in &path.parts[1..path.parts.len() - 1] {
                        current = match self.find_sub_module(current, *part) {
                            Some(sub) => sub,
                            None => return Vec::new(),
                        };
                    }
                    self.search_module(current, path.last(), opts)
                }
            }
            ScopeKind::Function(f) => {
                if !path.is_unqualified() {
                    return Vec::new();
                }
                let name = path.first();
                let mut results = Vec::new();
                let function = self.function(f);
                if opts.find_variables {
                    for p in &function.parameters {
                        if self.var(*p).name == name {
                            results.push(FoundItem::Variable(*p));
                        }
                    }
                }
                if opts.find_types {
                    for u in &function.generic_specialisations {
                        if self.using(*u).name == name {
                            results.push(FoundItem::Using(*u));
                        }
                    }
                }
                results
            }
            ScopeKind::Block(b) => {
                if !path.is_unqualified() || !opts.find_variables {
                    return Vec::new();
                }
                let name = path.first();
                let block = self.block(b);
                let limit = position
                    .and_then(|stack| {
                        stack
                            .iter()
                            .find(|(block_id, _)| *block_id == b)
                            .map(|(_, index)| *index + 1)
                    })
                    .unwrap_or(block.statements.len());
                let mut results = Vec::new();
                for stmt in block.statements.iter().take(limit) {
                    if let StmtKind::VarDecl(v) = self.stmt(*stmt).kind {
                        if self.var(v).name == name {
                            results.push(FoundItem::Variable(v));
                        }
                    }
                }
                results
            }
        }
    }

    pub fn find_sub_module(&self, parent: ModuleId, name: Name) -> Option<ModuleId> {
        let module = self.module(parent);
        module
            .sub_modules
            .iter()
            .copied()
            .find(|m| self.module(*m).name == name)
    }

    fn search_module(&self, m: ModuleId, name: Name, opts: &NameSearchOptions) -> Vec<FoundItem> {
        let module = self.module(m);
        let mut results = Vec::new();

        if opts.find_variables {
            for v in &module.state_variables {
                if self.var(*v).name == name {
                    results.push(FoundItem::Variable(*v));
                }
            }
            for p in &module.specialisation_params {
                if let SpecialisationParam::Value(v) = p {
                    if self.var(*v).name == name {
                        results.push(FoundItem::Variable(*v));
                    }
                }
            }
        }

        if opts.find_types {
            for s in &module.structs {
                if self.struct_decl(*s).name == name {
                    results.push(FoundItem::Struct(*s));
                }
            }
            for u in &module.usings {
                if self.using(*u).name == name {
                    results.push(FoundItem::Using(*u));
                }
            }
        }

        if opts.find_functions {
            for f in &module.functions {
                let function = self.function(*f);
                if function.name == name {
                    if let Some(n) = opts.required_num_function_args {
                        if function.parameters.len() != n {
                            continue;
                        }
                    }
                    results.push(FoundItem::Function(*f));
                }
            }
        }

        if opts.find_processors_and_namespaces {
            for sub in &module.sub_modules {
                if self.module(*sub).name == name {
                    results.push(FoundItem::Module(*sub));
                }
            }
            for a in &module.aliases {
                if self.alias(*a).name == name {
                    results.push(FoundItem::Alias(*a));
                }
            }
        }

        if opts.find_endpoints {
            for e in module.inputs.iter().chain(module.outputs.iter()) {
                if self.endpoint(*e).name == name {
                    results.push(FoundItem::Endpoint(*e));
                }
            }
        }

        results
    }

    // ── Subtree re-parenting ──

    /// Rewrites every `scope` pointer equal to `old` in the subtree to `new`
    /// (used when an expression moves into a freshly created function scope).
    pub fn replace_parent_scope(&mut self, root: ExprId, old: ScopeId, new: ScopeId) {
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            if self.expr(id).context.scope == old {
                self.expr_mut(id).context.scope = new;
            }
            self.for_each_child(id, |child| pending.push(child));
        }
    }

    /// Invokes `f` with each direct child expression id.
    pub fn for_each_child(&self, id: ExprId, mut f: impl FnMut(ExprId)) {
        match &self.expr(id).kind {
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
                f(*lhs);
                f(*rhs);
            }
            ExprKind::StructMemberRef { object, .. } => f(*object),
            ExprKind::ArrayElementRef { object, start, end, .. } => {
                f(*object);
                if let Some(s) = start {
                    f(*s);
                }
                if let Some(e) = end {
                    f(*e);
                }
            }
            ExprKind::SubscriptWithBrackets { lhs, rhs } => {
                f(*lhs);
                if let Some(r) = rhs {
                    f(*r);
                }
            }
            ExprKind::SubscriptWithChevrons { lhs, rhs } => {
                f(*lhs);
                f(*rhs);
            }
            ExprKind::TypeCast { source, .. } => f(*source),
            ExprKind::CallOrCast { callee, args, .. } => {
                f(*callee);
                if let Some(a) = args {
                    f(*a);
                }
            }
            ExprKind::FunctionCall { args, .. } => {
                if let Some(a) = args {
                    f(*a);
                }
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            ExprKind::Unary { source, .. } => f(*source),
            ExprKind::Ternary {
                condition,
                true_branch,
                false_branch,
            } => {
                f(*condition);
                f(*true_branch);
                f(*false_branch);
            }
            ExprKind::Assignment { target, value } => {
                f(*target);
                f(*value);
            }
            ExprKind::PreOrPostIncDec { target, .. } => f(*target),
            ExprKind::WriteToEndpoint { target, value } => {
                f(*target);
                f(*value);
            }
            ExprKind::TypeMetaFunction { source, .. } => f(*source),
            ExprKind::CommaSeparatedList(items) => {
                for i in items {
                    f(*i);
                }
            }
            ExprKind::StaticAssertion { condition, .. } => f(*condition),
        }
    }

    /// The items of a CommaSeparatedList, or the single expression itself.
    pub fn argument_list(&self, args: Option<ExprId>) -> Vec<ExprId> {
        match args {
            None => Vec::new(),
            Some(a) => match &self.expr(a).kind {
                ExprKind::CommaSeparatedList(items) => items.clone(),
                _ => vec![a],
            },
        }
    }
}

/// Creates the root namespace that every compilation hangs off.
pub fn create_root_namespace(arena: &mut Arena) -> ModuleId {
    let chunk = crate::diag::SourceChunk::internal("<root>", "");
    let name = arena.interner.get("_root");
    let scope = arena.alloc_scope(ScopeKind::Module(ModuleId(0)), None);
    let context = Context {
        location: Location::new(chunk, Span::new(0, 0)),
        scope,
    };
    let id = arena.alloc_module(Module {
        kind: ModuleKind::Namespace,
        name,
        context,
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
    arena.scopes[scope.index()].kind = ScopeKind::Module(id);
    id
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::SourceChunk;

    fn test_context(arena: &mut Arena) -> Context {
        let chunk = SourceChunk::new("test", "");
        let scope = arena.alloc_scope(
            ScopeKind::Module(ModuleId(0)),
            None,
        );
        Context {
            location: Location::new(chunk, Span::new(0, 0)),
            scope,
        }
    }

    fn empty_module(arena: &mut Arena, name: &str, kind: ModuleKind) -> ModuleId {
        let name = arena.interner.get(name);
        let ctx = test_context(arena);
        let scope = ctx.scope;
        arena.alloc_module(Module {
            kind,
            name,
            context: ctx,
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
        })
    }

    #[test]
    fn interner_handles_are_stable() {
        let mut i = Interner::default();
        let a = i.get("foo");
        let b = i.get("bar");
        let c = i.get("foo");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(i.str(a), "foo");
    }

    #[test]
    fn classification_of_basic_nodes() {
        let mut arena = Arena::new();
        let _m = empty_module(&mut arena, "m", ModuleKind::Namespace);
        let ctx = test_context(&mut arena);

        let c = arena.alloc_expr(ExprKind::Constant(Value::Int32(1)), ctx.clone());
        assert_eq!(arena.classify(c), ExprClass::Value);
        assert!(arena.is_resolved(c));
        assert_eq!(arena.get_as_constant(c), Some(Value::Int32(1)));

        let t = arena.alloc_expr(ExprKind::ConcreteType(Type::float32()), ctx.clone());
        assert_eq!(arena.classify(t), ExprClass::Type);
        assert!(arena.resolve_as_type(t).unwrap().is_identical(&Type::float32()));

        let name = arena.interner.get("x");
        let qi = arena.alloc_expr(ExprKind::QualifiedIdentifier(Path::single(name)), ctx);
        assert_eq!(arena.classify(qi), ExprClass::Unresolved);
        assert!(!arena.is_resolved(qi));
    }

    #[test]
    fn meta_function_folds_on_resolved_type() {
        let mut arena = Arena::new();
        let _m = empty_module(&mut arena, "m", ModuleKind::Namespace);
        let ctx = test_context(&mut arena);
        let base = arena.alloc_expr(
            ExprKind::ConcreteType(Type::float32().create_array(8)),
            ctx.clone(),
        );
        let size = arena.alloc_expr(
            ExprKind::TypeMetaFunction {
                op: MetaOp::Size,
                source: base,
            },
            ctx,
        );
        assert!(arena.is_resolved(size));
        assert_eq!(arena.classify(size), ExprClass::Value);
    }

    #[test]
    fn module_scope_search_finds_state_variable() {
        let mut arena = Arena::new();
        let m = empty_module(&mut arena, "m", ModuleKind::Processor);
        let scope = arena.module(m).scope;
        let name = arena.interner.get("gain");
        let ctx = Context {
            location: Location::new(SourceChunk::new("t", ""), Span::new(0, 0)),
            scope,
        };
        let v = arena.alloc_var(VarDecl {
            name,
            context: ctx,
            declared_type: None,
            initial_value: None,
            is_external: false,
            is_const: false,
            is_function_parameter: false,
            annotation: Annotation::default(),
            num_reads: 0,
            num_writes: 0,
            generated: None,
        });
        arena.module_mut(m).state_variables.push(v);

        let opts = NameSearchOptions {
            find_variables: true,
            find_types: false,
            find_functions: false,
            find_processors_and_namespaces: false,
            find_endpoints: false,
            stop_at_first_scope_with_results: true,
            required_num_function_args: None,
        };
        let found = arena.perform_name_search(scope, &Path::single(name), &opts, None);
        assert_eq!(found, vec![FoundItem::Variable(v)]);
    }

    #[test]
    fn qualified_search_descends_sub_modules() {
        let mut arena = Arena::new();
        let root = empty_module(&mut arena, "root", ModuleKind::Namespace);
        let inner = empty_module(&mut arena, "inner", ModuleKind::Namespace);
        arena.module_mut(root).sub_modules.push(inner);

        // a struct inside `inner`
        let s_name = arena.interner.get("S");
        let ctx = Context {
            location: Location::new(SourceChunk::new("t", ""), Span::new(0, 0)),
            scope: arena.module(inner).scope,
        };
        let s = arena.alloc_struct(StructDecl {
            name: s_name,
            context: ctx,
            structure: StructType::new("S"),
            member_types: Vec::new(),
            member_names: Vec::new(),
            members_resolved: false,
        });
        arena.module_mut(inner).structs.push(s);

        let inner_name = arena.interner.get("inner");
        let root_scope = arena.module(root).scope;
        let opts = NameSearchOptions {
            find_variables: false,
            find_types: true,
            find_functions: false,
            find_processors_and_namespaces: false,
            find_endpoints: false,
            stop_at_first_scope_with_results: true,
            required_num_function_args: None,
        };
        let path = Path {
            parts: vec![inner_name, s_name],
        };
        let found = arena.perform_name_search(root_scope, &path, &opts, None);
        assert_eq!(found, vec![FoundItem::Struct(s)]);
    }
}
