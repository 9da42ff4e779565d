// heart.rs — The HEART intermediate representation
//
// The flat, block-structured program that the front-end hands to downstream
// consumers: one heart::Module per resolved AST module, each owning its
// variables, functions, endpoints, connections, and processor instances.
// Function bodies are lists of basic blocks; every block must end in exactly
// one terminator. The `Display` impls produce the textual HEART dump, which
// `heart_parser` can read back for round-trip testing.
//
// Preconditions: built by the HEART generator from a fully-resolved AST.
// Postconditions: treated as immutable after the post-generation checks.
// Failure modes: none (data module).
// Side effects: none.

use std::fmt;
use std::rc::Rc;

use crate::ast::{EndpointKind, InterpolationType, ModuleKind, ProcessorProperty};
use crate::intrinsics::Intrinsic;
use crate::types::{BinaryOp, Type, UnaryOp, Value};

// ── String dictionary ────────────────────────────────────────────────────

/// Interns every string literal that survives into the program.
#[derive(Debug, Default)]
pub struct StringDictionary {
    strings: Vec<Rc<str>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringHandle(pub u32);

impl StringDictionary {
    pub fn handle_for(&mut self, s: &str) -> StringHandle {
        if let Some(i) = self.strings.iter().position(|existing| existing.as_ref() == s) {
            return StringHandle(i as u32);
        }
        self.strings.push(Rc::from(s));
        StringHandle(self.strings.len() as u32 - 1)
    }

    pub fn get(&self, h: StringHandle) -> Option<&str> {
        self.strings.get(h.0 as usize).map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

// ── Program ──────────────────────────────────────────────────────────────

/// A compiled program: a list of HEART modules plus the main processor.
#[derive(Debug, Default)]
pub struct Program {
    pub modules: Vec<Module>,
    pub main_module: Option<usize>,
    pub strings: StringDictionary,
}

impl Program {
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn module_with_name(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn main_processor(&self) -> Option<&Module> {
        self.main_module.and_then(|i| self.modules.get(i))
    }

    pub fn function_with_name(&self, qualified: &str) -> Option<(&Module, &Function)> {
        let (module_name, function_name) = qualified.rsplit_once("::")?;
        let module = self.module_with_name(module_name)?;
        module
            .functions
            .iter()
            .find(|f| f.name == function_name)
            .map(|f| (module, f))
    }

    /// The complete textual HEART dump.
    pub fn to_heart(&self) -> String {
        format!("{self}")
    }

    /// A repeatable hash of the complete program state.
    pub fn hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.to_heart().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for b in digest {
            use std::fmt::Write;
            let _ = write!(out, "{b:02x}");
        }
        out
    }
}

// ── Module ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub kind: ModuleKind,
    pub annotation: Vec<(String, Value)>,
    pub structs: Vec<Rc<crate::types::StructType>>,
    pub inputs: Vec<EndpointDecl>,
    pub outputs: Vec<EndpointDecl>,
    pub connections: Vec<Connection>,
    pub processor_instances: Vec<ProcessorInstance>,
    pub variables: Vec<Variable>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: String, kind: ModuleKind) -> Module {
        Module {
            name,
            kind,
            annotation: Vec::new(),
            structs: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            connections: Vec::new(),
            processor_instances: Vec::new(),
            variables: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn find_input(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|e| e.name == name)
    }

    pub fn find_output(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|e| e.name == name)
    }

    pub fn find_function(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn add_variable(&mut self, v: Variable) -> usize {
        self.variables.push(v);
        self.variables.len() - 1
    }

    /// Variables materialised in the processor state.
    pub fn state_variables(&self) -> impl Iterator<Item = (usize, &Variable)> {
        self.variables
            .iter()
            .enumerate()
            .filter(|(_, v)| matches!(v.role, VariableRole::State | VariableRole::External))
    }
}

// ── Endpoints / connections / instances ──────────────────────────────────

#[derive(Debug, Clone)]
pub struct EndpointDecl {
    pub name: String,
    pub index: u32,
    pub kind: EndpointKind,
    pub sample_types: Vec<Type>,
    pub array_size: Option<u32>,
    pub annotation: Vec<(String, Value)>,
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub source_processor: Option<String>,
    pub source_channel: String,
    pub dest_processor: Option<String>,
    pub dest_channel: String,
    pub interpolation: InterpolationType,
    pub delay_length: i64,
}

#[derive(Debug, Clone)]
pub struct ProcessorInstance {
    pub instance_name: String,
    pub source_name: String,
    pub array_size: u32,
    pub clock_multiplier: Option<i64>,
    pub clock_divider: Option<i64>,
}

// ── Variables ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableRole {
    Parameter,
    State,
    External,
    MutableLocal,
    /// Write-once value local (a "register").
    Register,
}

impl VariableRole {
    pub fn name(self) -> &'static str {
        match self {
            VariableRole::Parameter => "param",
            VariableRole::State => "state",
            VariableRole::External => "external",
            VariableRole::MutableLocal => "local",
            VariableRole::Register => "register",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: Option<String>,
    pub ty: Type,
    pub role: VariableRole,
    pub annotation: Vec<(String, Value)>,
}

impl Variable {
    pub fn is_mutable(&self) -> bool {
        matches!(
            self.role,
            VariableRole::MutableLocal | VariableRole::State | VariableRole::Parameter
        )
    }
}

// ── Functions and blocks ─────────────────────────────────────────────────

/// Cross-module function reference (module index, function index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionKey {
    pub module: usize,
    pub function: usize,
}

impl FunctionKey {
    pub const UNRESOLVED: FunctionKey = FunctionKey {
        module: usize::MAX,
        function: usize::MAX,
    };

    pub fn is_resolved(&self) -> bool {
        self.module != usize::MAX
    }
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub return_type: Type,
    pub parameters: Vec<usize>,
    pub blocks: Vec<Block>,
    pub is_init_function: bool,
    pub is_run_function: bool,
    pub is_event_function: bool,
    pub has_no_body: bool,
    pub intrinsic: Option<Intrinsic>,
    pub annotation: Vec<(String, Value)>,
}

impl Function {
    pub fn new(name: String, return_type: Type) -> Function {
        Function {
            name,
            return_type,
            parameters: Vec::new(),
            blocks: Vec::new(),
            is_init_function: false,
            is_run_function: false,
            is_event_function: false,
            has_no_body: false,
            intrinsic: None,
            annotation: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Block {
    pub name: String,
    pub statements: Vec<Statement>,
    pub terminator: Option<Terminator>,
}

impl Block {
    pub fn new(name: String) -> Block {
        Block {
            name,
            statements: Vec::new(),
            terminator: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminator.is_some()
    }
}

// ── Expressions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Expr {
    Constant(Value),
    /// Index into the module's variable table.
    Variable(usize),
    SubElement {
        parent: Box<Expr>,
        index: SubIndex,
        suppress_wrap_warning: bool,
    },
    Cast {
        target: Type,
        source: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        source: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        result_type: Type,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    ProcessorProperty(ProcessorProperty),
}

/// Addresses one part of an aggregate parent expression.
#[derive(Debug, Clone)]
pub enum SubIndex {
    /// Struct field or constant element index.
    Fixed(u64),
    /// Slice with bounds already validated.
    Range { start: u64, end: u64, trusted: bool },
    /// Runtime index; wraps to the parent's size.
    Dynamic(Box<Expr>),
}

impl Expr {
    pub fn ty(&self, module: &Module) -> Type {
        match self {
            Expr::Constant(v) => v.type_of(),
            Expr::Variable(i) => module.variables[*i].ty.clone(),
            Expr::SubElement { parent, index, .. } => {
                let parent_type = parent.ty(module);
                match index {
                    SubIndex::Fixed(i) => {
                        if let Some(s) = parent_type.struct_ref() {
                            s.members.borrow()[*i as usize].ty.clone()
                        } else {
                            parent_type.element_type().unwrap_or(parent_type)
                        }
                    }
                    SubIndex::Range { start, end, .. } => parent_type
                        .element_type()
                        .map(|e| e.create_array(end - start))
                        .unwrap_or(parent_type),
                    SubIndex::Dynamic(_) => {
                        parent_type.element_type().unwrap_or(parent_type)
                    }
                }
            }
            Expr::Cast { target, .. } => target.clone(),
            Expr::Unary { source, .. } => source.ty(module),
            Expr::Binary { op, result_type, .. } => op.result_type(result_type),
            Expr::ProcessorProperty(p) => p.result_type(),
        }
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match self {
            Expr::Constant(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this expression can be written through.
    pub fn is_mutable(&self, module: &Module) -> bool {
        match self {
            Expr::Variable(i) => module.variables[*i].is_mutable(),
            Expr::SubElement { parent, .. } => parent.is_mutable(module),
            _ => false,
        }
    }
}

// ── Statements ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Statement {
    Assign {
        target: Expr,
        value: Expr,
    },
    Call {
        /// Optional destination for the return value.
        target: Option<Expr>,
        function: FunctionKey,
        /// Qualified name, stable across patching (used by the dump).
        function_name: String,
        args: Vec<Expr>,
    },
    WriteStream {
        /// Index into the module's outputs.
        output: usize,
        index: Option<Expr>,
        value: Expr,
    },
    ReadStream {
        target: Expr,
        /// Index into the module's inputs.
        input: usize,
    },
    AdvanceClock,
}

#[derive(Debug, Clone)]
pub enum Terminator {
    /// Unconditional branch to a block index.
    Branch(usize),
    BranchIf {
        condition: Expr,
        true_block: usize,
        false_block: usize,
    },
    Return(Option<Expr>),
}

// ── Textual dump ─────────────────────────────────────────────────────────

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#HEART")?;
        if let Some(main) = self.main_module {
            writeln!(f, "main \"{}\"", self.modules[main].name)?;
        }
        for m in &self.modules {
            write!(f, "{m}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ModuleKind::Namespace => "namespace",
            ModuleKind::Processor => "processor",
            ModuleKind::Graph => "graph",
        };
        writeln!(f, "{kind} \"{}\"", self.name)?;

        for (key, value) in &self.annotation {
            writeln!(f, "  annotation \"{key}\" {}", FmtValue(value))?;
        }

        for s in &self.structs {
            write!(f, "  struct \"{}\" {{", s.name)?;
            for m in s.members.borrow().iter() {
                write!(f, " {} \"{}\"", FmtType(&m.ty), m.name)?;
            }
            writeln!(f, " }}")?;
        }

        for e in &self.inputs {
            write_endpoint(f, e, true)?;
        }
        for e in &self.outputs {
            write_endpoint(f, e, false)?;
        }

        for i in &self.processor_instances {
            write!(f, "  instance \"{}\" = \"{}\"", i.instance_name, i.source_name)?;
            if i.array_size != 1 {
                write!(f, " [{}]", i.array_size)?;
            }
            if let Some(m) = i.clock_multiplier {
                write!(f, " * {m}")?;
            }
            if let Some(d) = i.clock_divider {
                write!(f, " / {d}")?;
            }
            writeln!(f)?;
        }

        for c in &self.connections {
            write!(f, "  connection ")?;
            match &c.source_processor {
                Some(p) => write!(f, "\"{p}\".\"{}\"", c.source_channel)?,
                None => write!(f, "self.\"{}\"", c.source_channel)?,
            }
            write!(f, " -> ")?;
            match &c.dest_processor {
                Some(p) => write!(f, "\"{p}\".\"{}\"", c.dest_channel)?,
                None => write!(f, "self.\"{}\"", c.dest_channel)?,
            }
            if c.interpolation != InterpolationType::None {
                write!(f, " [{}]", c.interpolation.name())?;
            }
            if c.delay_length != 0 {
                write!(f, " delay {}", c.delay_length)?;
            }
            writeln!(f)?;
        }

        for (i, v) in self.variables.iter().enumerate() {
            write!(f, "  var {i} {} {}", v.role.name(), FmtType(&v.ty))?;
            if let Some(name) = &v.name {
                write!(f, " \"{name}\"")?;
            }
            writeln!(f)?;
        }

        for function in &self.functions {
            write!(f, "{}", FmtFunction { function, module: self })?;
        }

        Ok(())
    }
}

fn write_endpoint(f: &mut fmt::Formatter<'_>, e: &EndpointDecl, is_input: bool) -> fmt::Result {
    let direction = if is_input { "input" } else { "output" };
    write!(f, "  {direction} {} {}", e.index, e.kind.name())?;
    write!(f, " (")?;
    for (i, t) in e.sample_types.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", FmtType(t))?;
    }
    write!(f, ") \"{}\"", e.name)?;
    if let Some(size) = e.array_size {
        write!(f, " [{size}]")?;
    }
    writeln!(f)
}

struct FmtFunction<'a> {
    function: &'a Function,
    module: &'a Module,
}

impl fmt::Display for FmtFunction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = self.function;
        write!(f, "  func \"{}\" (", func.name)?;
        for (i, p) in func.parameters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "var {p}")?;
        }
        write!(f, ") -> {}", FmtType(&func.return_type))?;

        let mut flags = Vec::new();
        if func.is_init_function {
            flags.push("init".to_string());
        }
        if func.is_run_function {
            flags.push("run".to_string());
        }
        if func.is_event_function {
            flags.push("event".to_string());
        }
        if func.has_no_body {
            flags.push("nobody".to_string());
        }
        if let Some(i) = func.intrinsic {
            flags.push(format!("intrin={}", i.name()));
        }
        if flags.is_empty() {
            writeln!(f)?;
        } else {
            writeln!(f, " [{}]", flags.join(","))?;
        }

        for (i, block) in func.blocks.iter().enumerate() {
            writeln!(f, "    block {i} \"{}\"", block.name)?;
            for s in &block.statements {
                writeln!(f, "      {}", FmtStatement { statement: s, module: self.module })?;
            }
            match &block.terminator {
                Some(Terminator::Branch(b)) => writeln!(f, "      term branch {b}")?,
                Some(Terminator::BranchIf {
                    condition,
                    true_block,
                    false_block,
                }) => writeln!(
                    f,
                    "      term branchif {} {true_block} {false_block}",
                    FmtExpr(condition)
                )?,
                Some(Terminator::Return(None)) => writeln!(f, "      term return")?,
                Some(Terminator::Return(Some(v))) => {
                    writeln!(f, "      term return {}", FmtExpr(v))?
                }
                None => writeln!(f, "      term none")?,
            }
        }

        Ok(())
    }
}

struct FmtStatement<'a> {
    statement: &'a Statement,
    module: &'a Module,
}

impl fmt::Display for FmtStatement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.statement {
            Statement::Assign { target, value } => {
                write!(f, "assign {} {}", FmtExpr(target), FmtExpr(value))
            }
            Statement::Call {
                target,
                function_name,
                args,
                ..
            } => {
                write!(f, "call \"{function_name}\" ")?;
                match target {
                    Some(t) => write!(f, "{}", FmtExpr(t))?,
                    None => write!(f, "none")?,
                }
                for a in args {
                    write!(f, " {}", FmtExpr(a))?;
                }
                Ok(())
            }
            Statement::WriteStream {
                output,
                index,
                value,
            } => {
                let name = &self.module.outputs[*output].name;
                write!(f, "write \"{name}\" ")?;
                match index {
                    Some(i) => write!(f, "{}", FmtExpr(i))?,
                    None => write!(f, "none")?,
                }
                write!(f, " {}", FmtExpr(value))
            }
            Statement::ReadStream { target, input } => {
                let name = &self.module.inputs[*input].name;
                write!(f, "read {} \"{name}\"", FmtExpr(target))
            }
            Statement::AdvanceClock => write!(f, "advance"),
        }
    }
}

pub struct FmtExpr<'a>(pub &'a Expr);

impl fmt::Display for FmtExpr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Expr::Constant(v) => write!(f, "(const {} {})", FmtType(&v.type_of()), FmtValue(v)),
            Expr::Variable(i) => write!(f, "(var {i})"),
            Expr::SubElement {
                parent,
                index,
                suppress_wrap_warning,
            } => {
                let nowrap = if *suppress_wrap_warning { " nowrap" } else { "" };
                match index {
                    SubIndex::Fixed(i) => {
                        write!(f, "(sub {} fixed {i}{nowrap})", FmtExpr(parent))
                    }
                    SubIndex::Range { start, end, trusted } => {
                        let trust = if *trusted { "trusted" } else { "unchecked" };
                        write!(f, "(sub {} range {start} {end} {trust}{nowrap})", FmtExpr(parent))
                    }
                    SubIndex::Dynamic(e) => {
                        write!(f, "(sub {} dyn {}{nowrap})", FmtExpr(parent), FmtExpr(e))
                    }
                }
            }
            Expr::Cast { target, source } => {
                write!(f, "(cast {} {})", FmtType(target), FmtExpr(source))
            }
            Expr::Unary { op, source } => write!(f, "(unary {} {})", op.symbol(), FmtExpr(source)),
            Expr::Binary {
                op,
                result_type,
                lhs,
                rhs,
            } => write!(
                f,
                "(binary {} {} {} {})",
                op.symbol(),
                FmtType(result_type),
                FmtExpr(lhs),
                FmtExpr(rhs)
            ),
            Expr::ProcessorProperty(p) => write!(f, "(prop {})", p.name()),
        }
    }
}

pub struct FmtType<'a>(pub &'a Type);

impl fmt::Display for FmtType<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Type::Struct(s) => write!(f, "struct:{}", s.name),
            Type::Reference(inner) => write!(f, "{}&", FmtType(inner)),
            Type::Const(inner) => write!(f, "const {}", FmtType(inner)),
            Type::Array { element, size } => write!(f, "{}[{size}]", FmtType(element)),
            Type::UnsizedArray { element } => write!(f, "{}[]", FmtType(element)),
            other => write!(f, "{other}"),
        }
    }
}

pub struct FmtValue<'a>(pub &'a Value);

impl fmt::Display for FmtValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Void => write!(f, "void"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{}", FmtFloat(*v as f64)),
            Value::Float64(v) => write!(f, "{}", FmtFloat(*v)),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bounded(_, v) => write!(f, "{v}"),
            Value::Aggregate { elements, .. } => {
                write!(f, "{{")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", FmtValue(e))?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Floats print with enough precision to round-trip bit-exactly.
struct FmtFloat(f64);

impl fmt::Display for FmtFloat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_nan() {
            write!(f, "nan")
        } else if self.0.is_infinite() {
            write!(f, "{}", if self.0 > 0.0 { "inf" } else { "-inf" })
        } else if self.0 == self.0.trunc() && self.0.abs() < 1e15 {
            write!(f, "{:.1}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_dictionary_interns() {
        let mut d = StringDictionary::default();
        let a = d.handle_for("hello");
        let b = d.handle_for("world");
        let c = d.handle_for("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(d.get(a), Some("hello"));
        assert_eq!(d.len(), 2);
    }

    fn tiny_module() -> Module {
        let mut m = Module::new("P".into(), ModuleKind::Processor);
        m.outputs.push(EndpointDecl {
            name: "out".into(),
            index: 0,
            kind: EndpointKind::Stream,
            sample_types: vec![Type::float32()],
            array_size: None,
            annotation: Vec::new(),
        });
        let mut run = Function::new("run".into(), Type::void());
        run.is_run_function = true;
        let mut b0 = Block::new("@block_0".into());
        b0.statements.push(Statement::WriteStream {
            output: 0,
            index: None,
            value: Expr::Constant(Value::Float32(0.0)),
        });
        b0.statements.push(Statement::AdvanceClock);
        b0.terminator = Some(Terminator::Branch(0));
        run.blocks.push(b0);
        m.functions.push(run);
        m
    }

    #[test]
    fn dump_contains_module_shape() {
        let mut p = Program::default();
        p.modules.push(tiny_module());
        p.main_module = Some(0);
        let text = p.to_heart();
        assert!(text.contains("#HEART"));
        assert!(text.contains("main \"P\""));
        assert!(text.contains("processor \"P\""));
        assert!(text.contains("output 0 stream (float32) \"out\""));
        assert!(text.contains("write \"out\" none (const float32 0.0)"));
        assert!(text.contains("advance"));
        assert!(text.contains("term branch 0"));
    }

    #[test]
    fn hash_is_stable_and_sensitive() {
        let mut p1 = Program::default();
        p1.modules.push(tiny_module());
        let mut p2 = Program::default();
        p2.modules.push(tiny_module());
        assert_eq!(p1.hash(), p2.hash());

        p2.modules[0].name = "Q".into();
        assert_ne!(p1.hash(), p2.hash());
    }

    #[test]
    fn expr_types_resolve_through_module() {
        let m = tiny_module();
        let e = Expr::Binary {
            op: BinaryOp::Equals,
            result_type: Type::int32(),
            lhs: Box::new(Expr::Constant(Value::Int32(1))),
            rhs: Box::new(Expr::Constant(Value::Int32(2))),
        };
        assert!(e.ty(&m).is_identical(&Type::bool()));
    }

    #[test]
    fn float_formatting_round_trips_integers() {
        assert_eq!(format!("{}", FmtFloat(0.0)), "0.0");
        assert_eq!(format!("{}", FmtFloat(1.5)), "1.5");
        assert_eq!(format!("{}", FmtFloat(f64::INFINITY)), "inf");
    }
}
