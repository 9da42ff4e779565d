// types.rs — SOUL type system and compile-time values
//
// The Type model covers primitives, fixed-size vectors and arrays, unsized
// arrays, structs, bounded integers (wrap/clamp) and the const/reference
// modifiers. Value holds any compile-time constant the type system can
// express, and the cast rules decide what converts silently, what needs an
// explicit cast, and what never converts.
//
// Preconditions: none (data + pure functions).
// Postconditions: all constructors yield well-formed types/values.
// Failure modes: constant arithmetic reports divide/modulo-by-zero.
// Side effects: none.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

// ── Limits ───────────────────────────────────────────────────────────────

pub const MAX_VECTOR_SIZE: u64 = 256;
pub const MAX_ARRAY_SIZE: u64 = 0x7fff_ffff;
pub const MAX_BOUNDED_INT_LIMIT: u64 = 0x7fff_ffff;
/// Cap on the packed byte size of any single type.
pub const MAX_PACKED_OBJECT_SIZE: u64 = 16 * 1024 * 1024;

// ── Primitives ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Void,
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    /// Reserved by the language; never instantiable.
    Fixed,
}

impl Primitive {
    pub fn is_integer(self) -> bool {
        matches!(self, Primitive::Int32 | Primitive::Int64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Primitive::Float32 | Primitive::Float64)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn packed_size(self) -> u64 {
        match self {
            Primitive::Void => 0,
            Primitive::Bool => 1,
            Primitive::Int32 | Primitive::Float32 => 4,
            Primitive::Int64 | Primitive::Float64 => 8,
            Primitive::Fixed => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Void => "void",
            Primitive::Bool => "bool",
            Primitive::Int32 => "int32",
            Primitive::Int64 => "int64",
            Primitive::Float32 => "float32",
            Primitive::Float64 => "float64",
            Primitive::Fixed => "fixed",
        }
    }
}

// ── Structs ──────────────────────────────────────────────────────────────

/// A named record type. Member types are filled in by the type resolver;
/// identity is by allocation (two structs with equal members are distinct).
#[derive(Debug)]
pub struct StructType {
    pub name: String,
    pub members: RefCell<Vec<StructMember>>,
}

#[derive(Debug, Clone)]
pub struct StructMember {
    pub ty: Type,
    pub name: String,
}

impl StructType {
    pub fn new(name: impl Into<String>) -> Rc<Self> {
        Rc::new(StructType {
            name: name.into(),
            members: RefCell::new(Vec::new()),
        })
    }

    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.members.borrow().iter().position(|m| m.name == name)
    }

    pub fn num_members(&self) -> usize {
        self.members.borrow().len()
    }
}

// ── Type ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Type {
    Primitive(Primitive),
    /// Fixed-size vector of a numeric primitive. Size 2..=MAX_VECTOR_SIZE.
    Vector { element: Primitive, size: u64 },
    /// Fixed-size array. Element may not itself be an array.
    Array { element: Rc<Type>, size: u64 },
    /// Array whose size is deduced later (externals, generic params).
    UnsizedArray { element: Rc<Type> },
    Struct(Rc<StructType>),
    StringLiteral,
    /// `wrap<N>` — integer with modular wrap-around in [0, N).
    Wrap(u64),
    /// `clamp<N>` — integer saturating to [0, N).
    Clamp(u64),
    Reference(Rc<Type>),
    Const(Rc<Type>),
}

impl Type {
    pub fn void() -> Type {
        Type::Primitive(Primitive::Void)
    }

    pub fn bool() -> Type {
        Type::Primitive(Primitive::Bool)
    }

    pub fn int32() -> Type {
        Type::Primitive(Primitive::Int32)
    }

    pub fn int64() -> Type {
        Type::Primitive(Primitive::Int64)
    }

    pub fn float32() -> Type {
        Type::Primitive(Primitive::Float32)
    }

    pub fn float64() -> Type {
        Type::Primitive(Primitive::Float64)
    }

    // ── Classification ──

    pub fn is_void(&self) -> bool {
        matches!(self.skip_modifiers(), Type::Primitive(Primitive::Void))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self.skip_modifiers(), Type::Primitive(_))
    }

    pub fn is_primitive_integer(&self) -> bool {
        matches!(self.skip_modifiers(), Type::Primitive(p) if p.is_integer())
    }

    pub fn is_primitive_float(&self) -> bool {
        matches!(self.skip_modifiers(), Type::Primitive(p) if p.is_float())
    }

    pub fn is_primitive_bool(&self) -> bool {
        matches!(self.skip_modifiers(), Type::Primitive(Primitive::Bool))
    }

    /// Integer including bounded ints.
    pub fn is_integer(&self) -> bool {
        self.is_primitive_integer() || self.is_bounded_int()
    }

    pub fn is_vector(&self) -> bool {
        matches!(self.skip_modifiers(), Type::Vector { .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self.skip_modifiers(),
            Type::Array { .. } | Type::UnsizedArray { .. }
        )
    }

    pub fn is_fixed_size_array(&self) -> bool {
        matches!(self.skip_modifiers(), Type::Array { .. })
    }

    pub fn is_unsized_array(&self) -> bool {
        matches!(self.skip_modifiers(), Type::UnsizedArray { .. })
    }

    pub fn is_array_or_vector(&self) -> bool {
        self.is_array() || self.is_vector()
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.skip_modifiers(), Type::Struct(_))
    }

    pub fn is_string_literal(&self) -> bool {
        matches!(self.skip_modifiers(), Type::StringLiteral)
    }

    pub fn is_bounded_int(&self) -> bool {
        matches!(self.skip_modifiers(), Type::Wrap(_) | Type::Clamp(_))
    }

    pub fn is_wrap(&self) -> bool {
        matches!(self.skip_modifiers(), Type::Wrap(_))
    }

    pub fn is_reference(&self) -> bool {
        match self {
            Type::Reference(_) => true,
            Type::Const(inner) => inner.is_reference(),
            _ => false,
        }
    }

    pub fn is_const(&self) -> bool {
        match self {
            Type::Const(_) => true,
            Type::Reference(inner) => inner.is_const(),
            _ => false,
        }
    }

    pub fn is_non_const_reference(&self) -> bool {
        self.is_reference() && !self.is_const()
    }

    /// Scalar = primitive numeric or a numeric vector.
    pub fn is_scalar(&self) -> bool {
        match self.skip_modifiers() {
            Type::Primitive(p) => p.is_numeric(),
            Type::Vector { .. } => true,
            _ => false,
        }
    }

    pub fn is_fixed_size_aggregate(&self) -> bool {
        matches!(
            self.skip_modifiers(),
            Type::Vector { .. } | Type::Array { .. } | Type::Struct(_)
        )
    }

    // ── Modifiers ──

    fn skip_modifiers(&self) -> &Type {
        match self {
            Type::Reference(inner) | Type::Const(inner) => inner.skip_modifiers(),
            other => other,
        }
    }

    pub fn remove_const_if_present(&self) -> Type {
        match self {
            Type::Const(inner) => inner.remove_const_if_present(),
            Type::Reference(inner) => Type::Reference(Rc::new(inner.remove_const_if_present())),
            other => other.clone(),
        }
    }

    pub fn remove_reference_if_present(&self) -> Type {
        match self {
            Type::Reference(inner) => inner.remove_reference_if_present(),
            Type::Const(inner) => Type::Const(Rc::new(inner.remove_reference_if_present())),
            other => other.clone(),
        }
    }

    /// Bare type with const and reference stripped.
    pub fn without_modifiers(&self) -> Type {
        self.skip_modifiers().clone()
    }

    pub fn make_const(&self) -> Type {
        if self.is_const() {
            self.clone()
        } else {
            Type::Const(Rc::new(self.clone()))
        }
    }

    pub fn make_reference(&self) -> Type {
        if self.is_reference() {
            self.clone()
        } else {
            Type::Reference(Rc::new(self.clone()))
        }
    }

    // ── Composition ──

    pub fn can_be_array_element(&self) -> bool {
        !self.is_array() && !self.is_void() && !self.is_reference() && !self.is_string_literal()
    }

    pub fn can_be_vector_element(&self) -> bool {
        matches!(self.skip_modifiers(), Type::Primitive(p) if p.is_numeric() || *p == Primitive::Bool)
    }

    pub fn is_legal_vector_size(size: i64) -> bool {
        size > 1 && (size as u64) <= MAX_VECTOR_SIZE
    }

    pub fn is_legal_array_size(size: i64) -> bool {
        size >= 1 && (size as u64) <= MAX_ARRAY_SIZE
    }

    pub fn is_legal_bounded_int_limit(size: i64) -> bool {
        size >= 1 && (size as u64) <= MAX_BOUNDED_INT_LIMIT
    }

    pub fn create_array(&self, size: u64) -> Type {
        Type::Array {
            element: Rc::new(self.clone()),
            size,
        }
    }

    pub fn create_unsized_array(&self) -> Type {
        Type::UnsizedArray {
            element: Rc::new(self.clone()),
        }
    }

    pub fn create_vector(element: Primitive, size: u64) -> Type {
        Type::Vector { element, size }
    }

    /// Copies an array type with a new element count (resolving an unsized array).
    pub fn with_array_size(&self, size: u64) -> Type {
        match self.skip_modifiers() {
            Type::Array { element, .. } | Type::UnsizedArray { element } => Type::Array {
                element: element.clone(),
                size,
            },
            _ => self.clone(),
        }
    }

    // ── Element access ──

    pub fn element_type(&self) -> Option<Type> {
        match self.skip_modifiers() {
            Type::Vector { element, .. } => Some(Type::Primitive(*element)),
            Type::Array { element, .. } | Type::UnsizedArray { element } => {
                Some((**element).clone())
            }
            _ => None,
        }
    }

    pub fn array_or_vector_size(&self) -> Option<u64> {
        match self.skip_modifiers() {
            Type::Vector { size, .. } | Type::Array { size, .. } => Some(*size),
            _ => None,
        }
    }

    pub fn bounded_int_limit(&self) -> Option<u64> {
        match self.skip_modifiers() {
            Type::Wrap(n) | Type::Clamp(n) => Some(*n),
            _ => None,
        }
    }

    pub fn struct_ref(&self) -> Option<Rc<StructType>> {
        match self.skip_modifiers() {
            Type::Struct(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn primitive(&self) -> Option<Primitive> {
        match self.skip_modifiers() {
            Type::Primitive(p) => Some(*p),
            Type::Vector { element, .. } => Some(*element),
            _ => None,
        }
    }

    pub fn num_aggregate_elements(&self) -> Option<u64> {
        match self.skip_modifiers() {
            Type::Vector { size, .. } | Type::Array { size, .. } => Some(*size),
            Type::Struct(s) => Some(s.num_members() as u64),
            _ => None,
        }
    }

    pub fn is_valid_array_or_vector_index(&self, index: i64) -> bool {
        match self.array_or_vector_size() {
            Some(size) => index >= 0 && (index as u64) < size,
            None => false,
        }
    }

    pub fn is_valid_array_or_vector_range(&self, start: i64, end: i64) -> bool {
        match self.array_or_vector_size() {
            Some(size) => start >= 0 && end > start && (end as u64) <= size,
            None => false,
        }
    }

    // ── Size ──

    pub fn packed_size(&self) -> u64 {
        match self {
            Type::Primitive(p) => p.packed_size(),
            Type::Vector { element, size } => element.packed_size() * size,
            Type::Array { element, size } => element.packed_size().saturating_mul(*size),
            Type::UnsizedArray { element } => element.packed_size(),
            Type::Struct(s) => s
                .members
                .borrow()
                .iter()
                .map(|m| m.ty.packed_size())
                .fold(0u64, u64::saturating_add),
            Type::StringLiteral => 8,
            Type::Wrap(_) | Type::Clamp(_) => 4,
            Type::Reference(inner) | Type::Const(inner) => inner.packed_size(),
        }
    }

    pub fn is_packed_size_too_big(&self) -> bool {
        self.packed_size() > MAX_PACKED_OBJECT_SIZE
    }

    // ── Identity ──

    /// Structural identity; struct identity is by allocation.
    pub fn is_identical(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Primitive(a), Type::Primitive(b)) => a == b,
            (
                Type::Vector { element: e1, size: s1 },
                Type::Vector { element: e2, size: s2 },
            ) => e1 == e2 && s1 == s2,
            (
                Type::Array { element: e1, size: s1 },
                Type::Array { element: e2, size: s2 },
            ) => s1 == s2 && e1.is_identical(e2),
            (Type::UnsizedArray { element: e1 }, Type::UnsizedArray { element: e2 }) => {
                e1.is_identical(e2)
            }
            (Type::Struct(a), Type::Struct(b)) => Rc::ptr_eq(a, b),
            (Type::StringLiteral, Type::StringLiteral) => true,
            (Type::Wrap(a), Type::Wrap(b)) => a == b,
            (Type::Clamp(a), Type::Clamp(b)) => a == b,
            (Type::Reference(a), Type::Reference(b)) => a.is_identical(b),
            (Type::Const(a), Type::Const(b)) => a.is_identical(b),
            _ => false,
        }
    }

    /// Identity ignoring const/reference modifiers on both sides.
    pub fn is_same_ignoring_modifiers(&self, other: &Type) -> bool {
        self.skip_modifiers().is_identical(other.skip_modifiers())
    }

    pub fn description(&self) -> String {
        format!("{self}")
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Primitive(p) => write!(f, "{}", p.name()),
            Type::Vector { element, size } => write!(f, "{}<{}>", element.name(), size),
            Type::Array { element, size } => write!(f, "{}[{}]", element, size),
            Type::UnsizedArray { element } => write!(f, "{}[]", element),
            Type::Struct(s) => write!(f, "{}", s.name),
            Type::StringLiteral => write!(f, "string"),
            Type::Wrap(n) => write!(f, "wrap<{}>", n),
            Type::Clamp(n) => write!(f, "clamp<{}>", n),
            Type::Reference(inner) => write!(f, "{}&", inner),
            Type::Const(inner) => write!(f, "const {}", inner),
        }
    }
}

// ── Values ───────────────────────────────────────────────────────────────

/// A compile-time constant of any SOUL type.
#[derive(Debug, Clone)]
pub enum Value {
    Void,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(Rc<str>),
    /// A bounded-int value with its wrap/clamp type.
    Bounded(Type, i64),
    /// Arrays, vectors and structs; `ty` carries the aggregate type.
    Aggregate { ty: Type, elements: Vec<Value> },
}

impl Value {
    pub fn type_of(&self) -> Type {
        match self {
            Value::Void => Type::void(),
            Value::Bool(_) => Type::bool(),
            Value::Int32(_) => Type::int32(),
            Value::Int64(_) => Type::int64(),
            Value::Float32(_) => Type::float32(),
            Value::Float64(_) => Type::float64(),
            Value::String(_) => Type::StringLiteral,
            Value::Bounded(ty, _) => ty.clone(),
            Value::Aggregate { ty, .. } => ty.clone(),
        }
    }

    pub fn zero_initialiser(ty: &Type) -> Value {
        match ty.skip_modifiers() {
            Type::Primitive(Primitive::Void) => Value::Void,
            Type::Primitive(Primitive::Bool) => Value::Bool(false),
            Type::Primitive(Primitive::Int32) => Value::Int32(0),
            Type::Primitive(Primitive::Int64) => Value::Int64(0),
            Type::Primitive(Primitive::Float32) => Value::Float32(0.0),
            Type::Primitive(Primitive::Float64) => Value::Float64(0.0),
            Type::Primitive(Primitive::Fixed) => Value::Int32(0),
            Type::Vector { element, size } => Value::Aggregate {
                ty: ty.without_modifiers(),
                elements: (0..*size)
                    .map(|_| Value::zero_initialiser(&Type::Primitive(*element)))
                    .collect(),
            },
            Type::Array { element, size } => Value::Aggregate {
                ty: ty.without_modifiers(),
                elements: (0..*size).map(|_| Value::zero_initialiser(element)).collect(),
            },
            Type::UnsizedArray { .. } => Value::Aggregate {
                ty: ty.without_modifiers(),
                elements: Vec::new(),
            },
            Type::Struct(s) => Value::Aggregate {
                ty: ty.without_modifiers(),
                elements: s
                    .members
                    .borrow()
                    .iter()
                    .map(|m| Value::zero_initialiser(&m.ty))
                    .collect(),
            },
            Type::StringLiteral => Value::String(Rc::from("")),
            Type::Wrap(_) | Type::Clamp(_) => Value::Bounded(ty.without_modifiers(), 0),
            Type::Reference(_) | Type::Const(_) => unreachable!("modifiers handled above"),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::Bounded(_, v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Bounded(_, v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Value::Void => true,
            Value::Bool(b) => !*b,
            Value::Int32(v) => *v == 0,
            Value::Int64(v) => *v == 0,
            Value::Float32(v) => *v == 0.0,
            Value::Float64(v) => *v == 0.0,
            Value::String(_) => false,
            Value::Bounded(_, v) => *v == 0,
            Value::Aggregate { elements, .. } => elements.iter().all(Value::is_zero),
        }
    }

    /// Attempts to cast to a new type, returning None on failure.
    pub fn try_cast_to(&self, target: &Type) -> Option<Value> {
        let bare = target.skip_modifiers();

        if self.type_of().is_identical(bare) {
            return Some(self.clone());
        }

        match bare {
            Type::Primitive(Primitive::Bool) => self.as_bool().map(Value::Bool),
            Type::Primitive(Primitive::Int32) => match self {
                Value::Int64(v) => i32::try_from(*v).ok().map(Value::Int32),
                Value::Bounded(_, v) => i32::try_from(*v).ok().map(Value::Int32),
                Value::Float32(v) => Some(Value::Int32(*v as i32)),
                Value::Float64(v) => Some(Value::Int32(*v as i32)),
                _ => None,
            },
            Type::Primitive(Primitive::Int64) => match self {
                Value::Int32(v) => Some(Value::Int64(*v as i64)),
                Value::Bounded(_, v) => Some(Value::Int64(*v)),
                Value::Float32(v) => Some(Value::Int64(*v as i64)),
                Value::Float64(v) => Some(Value::Int64(*v as i64)),
                _ => None,
            },
            Type::Primitive(Primitive::Float32) => self.as_f64().map(|v| Value::Float32(v as f32)),
            Type::Primitive(Primitive::Float64) => self.as_f64().map(Value::Float64),
            Type::Wrap(limit) => {
                let v = self.as_i64()?;
                let n = *limit as i64;
                Some(Value::Bounded(bare.clone(), v.rem_euclid(n)))
            }
            Type::Clamp(limit) => {
                let v = self.as_i64()?;
                Some(Value::Bounded(bare.clone(), v.clamp(0, *limit as i64 - 1)))
            }
            Type::Vector { element, size } => match self {
                // Broadcast a scalar across the vector lanes.
                Value::Bool(_)
                | Value::Int32(_)
                | Value::Int64(_)
                | Value::Float32(_)
                | Value::Float64(_) => {
                    let lane = self.try_cast_to(&Type::Primitive(*element))?;
                    Some(Value::Aggregate {
                        ty: bare.clone(),
                        elements: (0..*size).map(|_| lane.clone()).collect(),
                    })
                }
                Value::Aggregate { elements, .. } if elements.len() as u64 == *size => {
                    let cast: Option<Vec<Value>> = elements
                        .iter()
                        .map(|e| e.try_cast_to(&Type::Primitive(*element)))
                        .collect();
                    Some(Value::Aggregate {
                        ty: bare.clone(),
                        elements: cast?,
                    })
                }
                _ => None,
            },
            Type::Array { element, size } => match self {
                Value::Aggregate { elements, .. } if elements.len() as u64 == *size => {
                    let cast: Option<Vec<Value>> =
                        elements.iter().map(|e| e.try_cast_to(element)).collect();
                    Some(Value::Aggregate {
                        ty: bare.clone(),
                        elements: cast?,
                    })
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Cast that the caller has already validated; panics on failure.
    pub fn cast_to_expecting_success(&self, target: &Type) -> Value {
        self.try_cast_to(target)
            .unwrap_or_else(|| panic!("internal: cast of {} to {} failed", self.type_of(), target))
    }

    pub fn description(&self) -> String {
        match self {
            Value::Void => "void".into(),
            Value::Bool(b) => b.to_string(),
            Value::Int32(v) => v.to_string(),
            Value::Int64(v) => format!("{v}L"),
            Value::Float32(v) => format!("{v}f"),
            Value::Float64(v) => format!("{v}"),
            Value::String(s) => format!("{s:?}"),
            Value::Bounded(_, v) => v.to_string(),
            Value::Aggregate { elements, .. } => {
                let inner: Vec<String> = elements.iter().map(Value::description).collect();
                format!("({})", inner.join(", "))
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float32(a), Value::Float32(b)) => a.to_bits() == b.to_bits(),
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bounded(t1, a), Value::Bounded(t2, b)) => t1.is_identical(t2) && a == b,
            (
                Value::Aggregate { ty: t1, elements: e1 },
                Value::Aggregate { ty: t2, elements: e2 },
            ) => t1.is_identical(t2) && e1 == e2,
            _ => false,
        }
    }
}

// ── Cast rules ───────────────────────────────────────────────────────────

/// The silent (implicit) and explicit conversion rules.
pub struct TypeRules;

impl TypeRules {
    /// True if `source` converts to `target` without an explicit cast.
    pub fn can_silently_cast_to(target: &Type, source: &Type) -> bool {
        let t = target.skip_modifiers();
        let s = source.skip_modifiers();

        if t.is_identical(s) {
            return true;
        }

        match (t, s) {
            (Type::Primitive(tp), Type::Primitive(sp)) => match (tp, sp) {
                (Primitive::Int64, Primitive::Int32) => true,
                (Primitive::Float32, Primitive::Int32) => true,
                (Primitive::Float64, Primitive::Int32 | Primitive::Int64) => true,
                (Primitive::Float64, Primitive::Float32) => true,
                _ => false,
            },
            // Bounded ints read as plain integers.
            (Type::Primitive(tp), Type::Wrap(_) | Type::Clamp(_)) => {
                tp.is_integer() || tp.is_float()
            }
            // A scalar broadcasts into a vector of a matching element type.
            (Type::Vector { element, .. }, Type::Primitive(sp)) => {
                Self::can_silently_cast_to(&Type::Primitive(*element), &Type::Primitive(*sp))
            }
            (
                Type::Vector { element: te, size: ts },
                Type::Vector { element: se, size: ss },
            ) => {
                ts == ss
                    && Self::can_silently_cast_to(&Type::Primitive(*te), &Type::Primitive(*se))
            }
            // A fixed-size array silently becomes an unsized array view.
            (Type::UnsizedArray { element: te }, Type::Array { element: se, .. }) => {
                te.is_identical(se)
            }
            _ => false,
        }
    }

    /// Value-aware silent cast: constants get extra latitude when the value
    /// is exactly representable in the target type.
    pub fn can_silently_cast_value_to(target: &Type, value: &Value) -> bool {
        if Self::can_silently_cast_to(target, &value.type_of()) {
            return true;
        }

        let t = target.skip_modifiers();

        match (t, value) {
            // int literal → float if exactly representable
            (Type::Primitive(Primitive::Float32), Value::Int32(v)) => (*v as f32) as i32 == *v,
            (Type::Primitive(Primitive::Float32), Value::Int64(v)) => (*v as f32) as i64 == *v,
            (Type::Primitive(Primitive::Float64), Value::Int64(v)) => (*v as f64) as i64 == *v,
            // float64 literal → float32 if the round-trip is lossless
            (Type::Primitive(Primitive::Float32), Value::Float64(v)) => {
                !v.is_finite() || (*v as f32) as f64 == *v
            }
            // int64 literal → int32 if in range
            (Type::Primitive(Primitive::Int32), Value::Int64(v)) => i32::try_from(*v).is_ok(),
            // int literal → bounded if in range
            (Type::Wrap(n) | Type::Clamp(n), Value::Int32(_) | Value::Int64(_)) => {
                let v = value.as_i64().unwrap();
                v >= 0 && (v as u64) < *n
            }
            // scalar constant broadcast into vector
            (Type::Vector { element, .. }, _) if !value.type_of().is_array_or_vector() => {
                Self::can_silently_cast_value_to(&Type::Primitive(*element), value)
            }
            _ => false,
        }
    }

    /// True if an explicit `Type(value)` cast may convert `source` to `target`.
    pub fn can_cast_to(target: &Type, source: &Type) -> bool {
        if Self::can_silently_cast_to(target, source) {
            return true;
        }

        let t = target.skip_modifiers();
        let s = source.skip_modifiers();

        match (t, s) {
            (Type::Primitive(tp), Type::Primitive(sp)) => {
                tp.is_numeric() && (sp.is_numeric() || *sp == Primitive::Bool)
                    || *tp == Primitive::Bool && sp.is_numeric()
            }
            (Type::Wrap(_) | Type::Clamp(_), Type::Primitive(sp)) => sp.is_numeric(),
            (Type::Primitive(tp), Type::Wrap(_) | Type::Clamp(_)) => tp.is_numeric(),
            (Type::Wrap(_) | Type::Clamp(_), Type::Wrap(_) | Type::Clamp(_)) => true,
            (
                Type::Vector { element: te, size: ts },
                Type::Vector { element: se, size: ss },
            ) => {
                ts == ss
                    && Self::can_cast_to(&Type::Primitive(*te), &Type::Primitive(*se))
            }
            (Type::Vector { element, .. }, Type::Primitive(sp)) => {
                Self::can_cast_to(&Type::Primitive(*element), &Type::Primitive(*sp))
            }
            _ => false,
        }
    }

    /// Argument-passing compatibility; `exact` demands identity modulo
    /// modifiers (plus reference rules).
    pub fn can_pass_as_argument_to(param: &Type, arg: &Type, exact: bool) -> bool {
        if param.is_reference() && !param.is_const() {
            // non-const ref demands the identical bare type
            return param.is_same_ignoring_modifiers(arg);
        }

        if exact {
            param.is_same_ignoring_modifiers(arg)
        } else {
            Self::can_silently_cast_to(param, arg)
        }
    }

    /// Validates a constant used as an array/vector size; returns it as u64.
    pub fn check_array_size(value: &Value) -> Option<u64> {
        let size = value.as_i64()?;
        if Type::is_legal_array_size(size) {
            Some(size as u64)
        } else {
            None
        }
    }

    /// Validates a constant used as an array index.
    pub fn check_array_index(value: &Value) -> Option<i64> {
        value.as_i64()
    }
}

// ── Operators ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    BitwiseOr,
    BitwiseAnd,
    BitwiseXor,
    LeftShift,
    RightShift,
    RightShiftUnsigned,
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::BitwiseOr => "|",
            BinaryOp::BitwiseAnd => "&",
            BinaryOp::BitwiseXor => "^",
            BinaryOp::LeftShift => "<<",
            BinaryOp::RightShift => ">>",
            BinaryOp::RightShiftUnsigned => ">>>",
            BinaryOp::Equals => "==",
            BinaryOp::NotEquals => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equals
                | BinaryOp::NotEquals
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }

    pub fn is_bitwise_or_shift(self) -> bool {
        matches!(
            self,
            BinaryOp::BitwiseOr
                | BinaryOp::BitwiseAnd
                | BinaryOp::BitwiseXor
                | BinaryOp::LeftShift
                | BinaryOp::RightShift
                | BinaryOp::RightShiftUnsigned
        )
    }

    /// The unified type both operands are cast to, or None if the operand
    /// types are illegal for this operator. Bounded ints are read through
    /// as int32.
    pub fn operand_type(self, lhs: &Type, rhs: &Type) -> Option<Type> {
        let l = Self::read_through(lhs)?;
        let r = Self::read_through(rhs)?;

        let unified = if l.is_identical(&r) {
            l
        } else if TypeRules::can_silently_cast_to(&l, &r) {
            l
        } else if TypeRules::can_silently_cast_to(&r, &l) {
            r
        } else {
            return None;
        };

        if self.is_bitwise_or_shift() {
            if !unified.is_primitive_integer() && !Self::is_integer_vector(&unified) {
                return None;
            }
        } else if self == BinaryOp::Modulo {
            if !unified.is_scalar() {
                return None;
            }
        } else if self.is_comparison() {
            match self {
                BinaryOp::Equals | BinaryOp::NotEquals => {
                    if !(unified.is_scalar()
                        || unified.is_primitive_bool()
                        || unified.is_string_literal())
                    {
                        return None;
                    }
                }
                _ => {
                    if !unified.is_scalar() {
                        return None;
                    }
                }
            }
        } else if !unified.is_scalar() {
            return None;
        }

        Some(unified)
    }

    pub fn result_type(self, operand: &Type) -> Type {
        if self.is_comparison() {
            Type::bool()
        } else {
            operand.clone()
        }
    }

    fn read_through(t: &Type) -> Option<Type> {
        let bare = t.without_modifiers();
        if bare.is_bounded_int() {
            return Some(Type::int32());
        }
        if bare.is_void() {
            return None;
        }
        Some(bare)
    }

    fn is_integer_vector(t: &Type) -> bool {
        match t.skip_modifiers() {
            Type::Vector { element, .. } => element.is_integer(),
            _ => false,
        }
    }

    /// Applies the operator to two constants of the same (unified) type.
    /// Integer arithmetic wraps rather than trapping; divide or modulo by
    /// zero reports an error string for the caller to attach a location to.
    pub fn apply(self, lhs: &Value, rhs: &Value) -> Result<Value, &'static str> {
        use BinaryOp::*;

        if let (Some(a), Some(b)) = (int_pair(lhs, rhs)) {
            let is64 = matches!(lhs, Value::Int64(_)) || matches!(rhs, Value::Int64(_));
            let wrap = |v: i64| -> Value {
                if is64 {
                    Value::Int64(v)
                } else {
                    Value::Int32(v as i32)
                }
            };
            return Ok(match self {
                Add => wrap(a.wrapping_add(b)),
                Subtract => wrap(a.wrapping_sub(b)),
                Multiply => wrap(a.wrapping_mul(b)),
                Divide => {
                    if b == 0 {
                        return Err("division by zero");
                    }
                    wrap(a.wrapping_div(b))
                }
                Modulo => {
                    if b == 0 {
                        return Err("modulo zero");
                    }
                    wrap(a.wrapping_rem(b))
                }
                BitwiseOr => wrap(a | b),
                BitwiseAnd => wrap(a & b),
                BitwiseXor => wrap(a ^ b),
                LeftShift => wrap(a.wrapping_shl((b & 63) as u32)),
                RightShift => wrap(a.wrapping_shr((b & 63) as u32)),
                RightShiftUnsigned => {
                    if is64 {
                        Value::Int64(((a as u64) >> ((b & 63) as u32)) as i64)
                    } else {
                        Value::Int32(((a as i32 as u32) >> ((b & 31) as u32)) as i32)
                    }
                }
                Equals => Value::Bool(a == b),
                NotEquals => Value::Bool(a != b),
                LessThan => Value::Bool(a < b),
                LessThanOrEqual => Value::Bool(a <= b),
                GreaterThan => Value::Bool(a > b),
                GreaterThanOrEqual => Value::Bool(a >= b),
            });
        }

        if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
            let is32 = matches!(lhs, Value::Float32(_)) && matches!(rhs, Value::Float32(_));
            let make = |v: f64| -> Value {
                if is32 {
                    Value::Float32(v as f32)
                } else {
                    Value::Float64(v)
                }
            };
            return Ok(match self {
                Add => make(a + b),
                Subtract => make(a - b),
                Multiply => make(a * b),
                Divide => {
                    if b == 0.0 {
                        return Err("division by zero");
                    }
                    make(a / b)
                }
                Modulo => {
                    if b == 0.0 {
                        return Err("modulo zero");
                    }
                    make(a % b)
                }
                Equals => Value::Bool(a == b),
                NotEquals => Value::Bool(a != b),
                LessThan => Value::Bool(a < b),
                LessThanOrEqual => Value::Bool(a <= b),
                GreaterThan => Value::Bool(a > b),
                GreaterThanOrEqual => Value::Bool(a >= b),
                _ => return Err("illegal operands for operator"),
            });
        }

        if let (Value::Bool(a), Value::Bool(b)) = (lhs, rhs) {
            return Ok(match self {
                Equals => Value::Bool(a == b),
                NotEquals => Value::Bool(a != b),
                BitwiseAnd => Value::Bool(*a && *b),
                BitwiseOr => Value::Bool(*a || *b),
                BitwiseXor => Value::Bool(a != b),
                _ => return Err("illegal operands for operator"),
            });
        }

        if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
            return Ok(match self {
                Equals => Value::Bool(a == b),
                NotEquals => Value::Bool(a != b),
                _ => return Err("illegal operands for operator"),
            });
        }

        Err("illegal operands for operator")
    }
}

fn int_pair(lhs: &Value, rhs: &Value) -> (Option<i64>, Option<i64>) {
    match (lhs, rhs) {
        (
            Value::Int32(_) | Value::Int64(_) | Value::Bounded(..),
            Value::Int32(_) | Value::Int64(_) | Value::Bounded(..),
        ) => (lhs.as_i64(), rhs.as_i64()),
        _ => (None, None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    LogicalNot,
    BitwiseNot,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Negate => "-",
            UnaryOp::LogicalNot => "!",
            UnaryOp::BitwiseNot => "~",
        }
    }

    pub fn is_type_suitable(self, t: &Type) -> bool {
        match self {
            UnaryOp::Negate => t.is_scalar() && !t.is_primitive_bool(),
            UnaryOp::LogicalNot => t.is_primitive_bool(),
            UnaryOp::BitwiseNot => t.is_primitive_integer(),
        }
    }

    pub fn apply(self, v: &Value) -> Option<Value> {
        match (self, v) {
            (UnaryOp::Negate, Value::Int32(n)) => Some(Value::Int32(n.wrapping_neg())),
            (UnaryOp::Negate, Value::Int64(n)) => Some(Value::Int64(n.wrapping_neg())),
            (UnaryOp::Negate, Value::Float32(n)) => Some(Value::Float32(-n)),
            (UnaryOp::Negate, Value::Float64(n)) => Some(Value::Float64(-n)),
            (UnaryOp::LogicalNot, Value::Bool(b)) => Some(Value::Bool(!b)),
            (UnaryOp::BitwiseNot, Value::Int32(n)) => Some(Value::Int32(!n)),
            (UnaryOp::BitwiseNot, Value::Int64(n)) => Some(Value::Int64(!n)),
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_descriptions() {
        assert_eq!(Type::float32().description(), "float32");
        assert_eq!(Type::create_vector(Primitive::Float32, 4).description(), "float32<4>");
        assert_eq!(Type::int32().create_array(16).description(), "int32[16]");
        assert_eq!(Type::int32().create_unsized_array().description(), "int32[]");
        assert_eq!(Type::Wrap(8).description(), "wrap<8>");
        assert_eq!(Type::float32().make_const().make_reference().description(), "const float32&");
    }

    #[test]
    fn modifiers_strip_in_order() {
        let t = Type::float32().make_const().make_reference();
        assert!(t.is_const());
        assert!(t.is_reference());
        assert!(t.remove_reference_if_present().is_const());
        assert!(!t.remove_const_if_present().is_const());
        assert!(t.without_modifiers().is_identical(&Type::float32()));
    }

    #[test]
    fn struct_identity_is_by_allocation() {
        let a = StructType::new("S");
        let b = StructType::new("S");
        assert!(Type::Struct(a.clone()).is_identical(&Type::Struct(a.clone())));
        assert!(!Type::Struct(a).is_identical(&Type::Struct(b)));
    }

    #[test]
    fn silent_casts() {
        assert!(TypeRules::can_silently_cast_to(&Type::int64(), &Type::int32()));
        assert!(TypeRules::can_silently_cast_to(&Type::float64(), &Type::float32()));
        assert!(TypeRules::can_silently_cast_to(&Type::float64(), &Type::int32()));
        assert!(!TypeRules::can_silently_cast_to(&Type::int32(), &Type::int64()));
        assert!(!TypeRules::can_silently_cast_to(&Type::float32(), &Type::float64()));
        assert!(TypeRules::can_silently_cast_to(&Type::int32(), &Type::Wrap(16)));
    }

    #[test]
    fn value_aware_silent_casts() {
        // float64 literal that fits in a float32
        assert!(TypeRules::can_silently_cast_value_to(&Type::float32(), &Value::Float64(1.0)));
        // an int in range for a wrap type
        assert!(TypeRules::can_silently_cast_value_to(&Type::Wrap(8), &Value::Int32(5)));
        assert!(!TypeRules::can_silently_cast_value_to(&Type::Wrap(8), &Value::Int32(9)));
        // int64 literal in int32 range
        assert!(TypeRules::can_silently_cast_value_to(&Type::int32(), &Value::Int64(12)));
        assert!(!TypeRules::can_silently_cast_value_to(
            &Type::int32(),
            &Value::Int64(i64::MAX)
        ));
    }

    #[test]
    fn explicit_casts() {
        assert!(TypeRules::can_cast_to(&Type::int32(), &Type::float64()));
        assert!(TypeRules::can_cast_to(&Type::Wrap(4), &Type::int64()));
        assert!(!TypeRules::can_cast_to(&Type::int32(), &Type::StringLiteral));
    }

    #[test]
    fn zero_initialiser_shapes() {
        let v = Value::zero_initialiser(&Type::create_vector(Primitive::Float32, 4));
        match v {
            Value::Aggregate { elements, .. } => assert_eq!(elements.len(), 4),
            _ => panic!("expected aggregate"),
        }
        assert!(Value::zero_initialiser(&Type::int64()).is_zero());
    }

    #[test]
    fn wrap_cast_wraps_and_clamp_saturates() {
        let w = Value::Int32(10).try_cast_to(&Type::Wrap(8)).unwrap();
        assert_eq!(w.as_i64(), Some(2));
        let c = Value::Int32(10).try_cast_to(&Type::Clamp(8)).unwrap();
        assert_eq!(c.as_i64(), Some(7));
    }

    #[test]
    fn binary_op_constant_folding() {
        let v = BinaryOp::Add
            .apply(&Value::Int32(2), &Value::Int32(3))
            .unwrap();
        assert_eq!(v, Value::Int32(5));

        let v = BinaryOp::Multiply
            .apply(&Value::Float64(1.5), &Value::Float64(2.0))
            .unwrap();
        assert_eq!(v, Value::Float64(3.0));

        let v = BinaryOp::LessThan
            .apply(&Value::Int32(1), &Value::Int32(2))
            .unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn integer_overflow_wraps() {
        let v = BinaryOp::Add
            .apply(&Value::Int32(i32::MAX), &Value::Int32(1))
            .unwrap();
        assert_eq!(v, Value::Int32(i32::MIN));
    }

    #[test]
    fn divide_by_zero_reports_error() {
        assert!(BinaryOp::Divide
            .apply(&Value::Int32(1), &Value::Int32(0))
            .is_err());
        assert!(BinaryOp::Modulo
            .apply(&Value::Int64(1), &Value::Int64(0))
            .is_err());
    }

    #[test]
    fn operand_type_unification() {
        let t = BinaryOp::Add
            .operand_type(&Type::int32(), &Type::float64())
            .unwrap();
        assert!(t.is_identical(&Type::float64()));

        // bitwise ops demand integers
        assert!(BinaryOp::BitwiseAnd
            .operand_type(&Type::float32(), &Type::float32())
            .is_none());

        // comparisons yield bool
        let t = BinaryOp::Equals
            .operand_type(&Type::int32(), &Type::int32())
            .unwrap();
        assert!(BinaryOp::Equals.result_type(&t).is_identical(&Type::bool()));
    }

    #[test]
    fn packed_sizes() {
        assert_eq!(Type::float32().packed_size(), 4);
        assert_eq!(Type::create_vector(Primitive::Float64, 4).packed_size(), 32);
        assert_eq!(Type::int32().create_array(100).packed_size(), 400);
        assert!(!Type::int32().create_array(100).is_packed_size_too_big());
        assert!(Type::float64()
            .create_array(MAX_ARRAY_SIZE)
            .is_packed_size_too_big());
    }

    #[test]
    fn unary_ops() {
        assert_eq!(UnaryOp::Negate.apply(&Value::Int32(4)), Some(Value::Int32(-4)));
        assert_eq!(UnaryOp::LogicalNot.apply(&Value::Bool(true)), Some(Value::Bool(false)));
        assert_eq!(UnaryOp::BitwiseNot.apply(&Value::Int32(0)), Some(Value::Int32(-1)));
        assert_eq!(UnaryOp::Negate.apply(&Value::Bool(true)), None);
    }
}
