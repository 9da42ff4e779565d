// intrinsics.rs — Intrinsic function table
//
// The built-in library (a chunk of SOUL source parsed at compiler reset)
// declares the intrinsics namespace; each declaration carries an
// `[[intrin: "name"]]` annotation that binds it to an entry here. Unqualified
// function lookups include this namespace. When every argument of a call to
// an intrinsic folds to a constant, the resolver evaluates it at compile time
// through `Intrinsic::perform`.
//
// Preconditions: `perform` receives already-folded constant arguments.
// Postconditions: returns None when the intrinsic cannot be evaluated
//   at compile time (wrong types, or runtime-only).
// Failure modes: none.
// Side effects: none.

use crate::types::Value;

/// Namespace searched for unqualified function calls.
pub const INTRINSICS_NAMESPACE: &str = "intrinsics";
pub const INTRINSICS_PARENT_NAMESPACE: &str = "soul";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    Abs,
    Min,
    Max,
    Clamp,
    Wrap,
    Floor,
    Ceil,
    Fmod,
    Remainder,
    Sqrt,
    Pow,
    Exp,
    Log,
    Log10,
    Sin,
    Cos,
    Tan,
    Sinh,
    Cosh,
    Tanh,
    Asin,
    Acos,
    Atan,
    Atan2,
    GetArraySize,
}

impl Intrinsic {
    pub fn from_name(name: &str) -> Option<Intrinsic> {
        Some(match name {
            "abs" => Intrinsic::Abs,
            "min" => Intrinsic::Min,
            "max" => Intrinsic::Max,
            "clamp" => Intrinsic::Clamp,
            "wrap" => Intrinsic::Wrap,
            "floor" => Intrinsic::Floor,
            "ceil" => Intrinsic::Ceil,
            "fmod" => Intrinsic::Fmod,
            "remainder" => Intrinsic::Remainder,
            "sqrt" => Intrinsic::Sqrt,
            "pow" => Intrinsic::Pow,
            "exp" => Intrinsic::Exp,
            "log" => Intrinsic::Log,
            "log10" => Intrinsic::Log10,
            "sin" => Intrinsic::Sin,
            "cos" => Intrinsic::Cos,
            "tan" => Intrinsic::Tan,
            "sinh" => Intrinsic::Sinh,
            "cosh" => Intrinsic::Cosh,
            "tanh" => Intrinsic::Tanh,
            "asin" => Intrinsic::Asin,
            "acos" => Intrinsic::Acos,
            "atan" => Intrinsic::Atan,
            "atan2" => Intrinsic::Atan2,
            "get_array_size" => Intrinsic::GetArraySize,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Intrinsic::Abs => "abs",
            Intrinsic::Min => "min",
            Intrinsic::Max => "max",
            Intrinsic::Clamp => "clamp",
            Intrinsic::Wrap => "wrap",
            Intrinsic::Floor => "floor",
            Intrinsic::Ceil => "ceil",
            Intrinsic::Fmod => "fmod",
            Intrinsic::Remainder => "remainder",
            Intrinsic::Sqrt => "sqrt",
            Intrinsic::Pow => "pow",
            Intrinsic::Exp => "exp",
            Intrinsic::Log => "log",
            Intrinsic::Log10 => "log10",
            Intrinsic::Sin => "sin",
            Intrinsic::Cos => "cos",
            Intrinsic::Tan => "tan",
            Intrinsic::Sinh => "sinh",
            Intrinsic::Cosh => "cosh",
            Intrinsic::Tanh => "tanh",
            Intrinsic::Asin => "asin",
            Intrinsic::Acos => "acos",
            Intrinsic::Atan => "atan",
            Intrinsic::Atan2 => "atan2",
            Intrinsic::GetArraySize => "get_array_size",
        }
    }

    /// Compile-time evaluation over constant arguments. Integer-preserving
    /// where the maths stays in the integers (abs/min/max/clamp/wrap).
    pub fn perform(self, args: &[Value]) -> Option<Value> {
        use Intrinsic::*;

        match self {
            Abs => match args {
                [Value::Int32(v)] => Some(Value::Int32(v.wrapping_abs())),
                [Value::Int64(v)] => Some(Value::Int64(v.wrapping_abs())),
                [Value::Float32(v)] => Some(Value::Float32(v.abs())),
                [Value::Float64(v)] => Some(Value::Float64(v.abs())),
                _ => None,
            },
            Min | Max => match args {
                [a, b] => apply_minmax(self, a, b),
                _ => None,
            },
            Clamp => match args {
                [v, lo, hi] => {
                    let lo_v = apply_minmax(Max, v, lo)?;
                    apply_minmax(Min, &lo_v, hi)
                }
                _ => None,
            },
            Wrap => match args {
                [Value::Int32(v), Value::Int32(n)] if *n > 0 => {
                    Some(Value::Int32(v.rem_euclid(*n)))
                }
                [Value::Int64(v), Value::Int64(n)] if *n > 0 => {
                    Some(Value::Int64(v.rem_euclid(*n)))
                }
                _ => None,
            },
            Floor => unary_float(args, f64::floor),
            Ceil => unary_float(args, f64::ceil),
            Fmod => binary_float(args, |a, b| if b == 0.0 { f64::NAN } else { a % b }),
            Remainder => binary_float(args, |a, b| {
                if b == 0.0 {
                    f64::NAN
                } else {
                    a - b * (a / b).round()
                }
            }),
            Sqrt => unary_float(args, f64::sqrt),
            Pow => binary_float(args, f64::powf),
            Exp => unary_float(args, f64::exp),
            Log => unary_float(args, f64::ln),
            Log10 => unary_float(args, f64::log10),
            Sin => unary_float(args, f64::sin),
            Cos => unary_float(args, f64::cos),
            Tan => unary_float(args, f64::tan),
            Sinh => unary_float(args, f64::sinh),
            Cosh => unary_float(args, f64::cosh),
            Tanh => unary_float(args, f64::tanh),
            Asin => unary_float(args, f64::asin),
            Acos => unary_float(args, f64::acos),
            Atan => unary_float(args, f64::atan),
            Atan2 => binary_float(args, f64::atan2),
            GetArraySize => match args {
                [Value::Aggregate { elements, .. }] => Some(Value::Int64(elements.len() as i64)),
                _ => None,
            },
        }
    }
}

fn apply_minmax(which: Intrinsic, a: &Value, b: &Value) -> Option<Value> {
    let take_first = |less: bool| if which == Intrinsic::Min { less } else { !less };
    match (a, b) {
        (Value::Int32(x), Value::Int32(y)) => {
            Some(Value::Int32(if take_first(x < y) { *x } else { *y }))
        }
        (Value::Int64(x), Value::Int64(y)) => {
            Some(Value::Int64(if take_first(x < y) { *x } else { *y }))
        }
        (Value::Float32(x), Value::Float32(y)) => {
            Some(Value::Float32(if take_first(x < y) { *x } else { *y }))
        }
        (Value::Float64(x), Value::Float64(y)) => {
            Some(Value::Float64(if take_first(x < y) { *x } else { *y }))
        }
        _ => None,
    }
}

fn unary_float(args: &[Value], f: impl Fn(f64) -> f64) -> Option<Value> {
    match args {
        [Value::Float32(v)] => Some(Value::Float32(f(*v as f64) as f32)),
        [Value::Float64(v)] => Some(Value::Float64(f(*v))),
        _ => None,
    }
}

fn binary_float(args: &[Value], f: impl Fn(f64, f64) -> f64) -> Option<Value> {
    match args {
        [Value::Float32(a), Value::Float32(b)] => {
            Some(Value::Float32(f(*a as f64, *b as f64) as f32))
        }
        [Value::Float64(a), Value::Float64(b)] => Some(Value::Float64(f(*a, *b))),
        _ => None,
    }
}

/// The built-in library, parsed into the root namespace at compiler reset.
/// Declarations have no bodies; the `[[intrin]]` annotation tags each one.
pub const BUILT_IN_LIBRARY: &str = r#"
namespace soul::intrinsics
{
    T abs<T> (T n)                   [[intrin: "abs"]];
    T min<T> (T a, T b)              [[intrin: "min"]];
    T max<T> (T a, T b)              [[intrin: "max"]];
    T clamp<T> (T n, T low, T high)  [[intrin: "clamp"]];
    T wrap<T> (T n, T limit)         [[intrin: "wrap"]];
    T floor<T> (T n)                 [[intrin: "floor"]];
    T ceil<T> (T n)                  [[intrin: "ceil"]];
    T fmod<T> (T a, T b)             [[intrin: "fmod"]];
    T remainder<T> (T a, T b)        [[intrin: "remainder"]];
    T sqrt<T> (T n)                  [[intrin: "sqrt"]];
    T pow<T> (T a, T b)              [[intrin: "pow"]];
    T exp<T> (T n)                   [[intrin: "exp"]];
    T log<T> (T n)                   [[intrin: "log"]];
    T log10<T> (T n)                 [[intrin: "log10"]];
    T sin<T> (T n)                   [[intrin: "sin"]];
    T cos<T> (T n)                   [[intrin: "cos"]];
    T tan<T> (T n)                   [[intrin: "tan"]];
    T sinh<T> (T n)                  [[intrin: "sinh"]];
    T cosh<T> (T n)                  [[intrin: "cosh"]];
    T tanh<T> (T n)                  [[intrin: "tanh"]];
    T asin<T> (T n)                  [[intrin: "asin"]];
    T acos<T> (T n)                  [[intrin: "acos"]];
    T atan<T> (T n)                  [[intrin: "atan"]];
    T atan2<T> (T y, T x)            [[intrin: "atan2"]];
    int64 get_array_size<T> (T[] array)  [[intrin: "get_array_size"]];
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for i in [
            Intrinsic::Abs,
            Intrinsic::Clamp,
            Intrinsic::Atan2,
            Intrinsic::GetArraySize,
        ] {
            assert_eq!(Intrinsic::from_name(i.name()), Some(i));
        }
        assert_eq!(Intrinsic::from_name("frobnicate"), None);
    }

    #[test]
    fn integer_intrinsics_stay_integer() {
        assert_eq!(
            Intrinsic::Abs.perform(&[Value::Int32(-3)]),
            Some(Value::Int32(3))
        );
        assert_eq!(
            Intrinsic::Min.perform(&[Value::Int32(2), Value::Int32(5)]),
            Some(Value::Int32(2))
        );
        assert_eq!(
            Intrinsic::Clamp.perform(&[Value::Int32(9), Value::Int32(0), Value::Int32(4)]),
            Some(Value::Int32(4))
        );
        assert_eq!(
            Intrinsic::Wrap.perform(&[Value::Int32(-1), Value::Int32(4)]),
            Some(Value::Int32(3))
        );
    }

    #[test]
    fn float_intrinsics() {
        assert_eq!(
            Intrinsic::Sqrt.perform(&[Value::Float64(9.0)]),
            Some(Value::Float64(3.0))
        );
        assert_eq!(
            Intrinsic::Pow.perform(&[Value::Float32(2.0), Value::Float32(3.0)]),
            Some(Value::Float32(8.0))
        );
    }

    #[test]
    fn mismatched_types_do_not_fold() {
        assert_eq!(
            Intrinsic::Min.perform(&[Value::Int32(1), Value::Float64(2.0)]),
            None
        );
        assert_eq!(Intrinsic::Sqrt.perform(&[Value::Int32(4)]), None);
    }
}
