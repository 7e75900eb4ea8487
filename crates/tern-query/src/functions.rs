//! Query function registry
//!
//! Maps function names to implementations plus the metadata the compiler
//! needs: result type, whether the result depends on the current row,
//! aggregate/lazy flags and an optional cost estimate. The numeric builtins
//! follow double-precision float semantics; `true()`/`false()` are
//! zero-argument predicates.

use crate::ast::SemType;
use std::collections::HashMap;
use std::sync::Arc;
use tern_core::{Error, Result, Value};

/// An eagerly-evaluated function: arguments are already values
pub type EagerFn = Box<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Evaluates the arguments of a lazy function on demand
pub trait ArgEval {
    fn arg_count(&self) -> usize;
    fn eval_arg(&mut self, index: usize) -> Result<Value>;
}

/// A lazily-evaluated function: decides itself which arguments to evaluate
pub type LazyFn = Box<dyn Fn(&mut dyn ArgEval) -> Result<Value> + Send + Sync>;

/// Function implementation
pub enum FuncImpl {
    Eager(EagerFn),
    Lazy(LazyFn),
}

/// A registered function with its compile-time metadata
pub struct FuncMeta {
    pub imp: FuncImpl,
    pub result_type: SemType,
    /// True when the result does not depend on the current row
    pub independent: bool,
    /// Aggregates receive their argument collected over the whole group
    pub aggregate: bool,
    pub cost: Option<f64>,
}

/// Name to function mapping; builtins are pre-registered
#[derive(Clone)]
pub struct FunctionRegistry {
    funcs: HashMap<String, Arc<FuncMeta>>,
}

impl FunctionRegistry {
    /// Registry with the builtin functions
    pub fn new() -> Self {
        let mut registry = Self {
            funcs: HashMap::new(),
        };
        registry.register_builtins();
        registry
    }

    /// Register an eager function
    pub fn register<F>(&mut self, name: &str, result_type: SemType, func: F)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.funcs.insert(
            name.to_string(),
            Arc::new(FuncMeta {
                imp: FuncImpl::Eager(Box::new(func)),
                result_type,
                independent: true,
                aggregate: false,
                cost: None,
            }),
        );
    }

    /// Register a function with full metadata
    pub fn register_meta(&mut self, name: &str, meta: FuncMeta) {
        self.funcs.insert(name.to_string(), Arc::new(meta));
    }

    pub fn get(&self, name: &str) -> Option<Arc<FuncMeta>> {
        self.funcs.get(name).cloned()
    }

    /// Look a function up at compile time
    pub fn lookup(&self, name: &str) -> Result<Arc<FuncMeta>> {
        self.get(name)
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))
    }

    fn register_builtins(&mut self) {
        self.register("add", SemType::Number, |args| {
            Ok(Value::Number(numeric(arg(args, 0)?)? + numeric(arg(args, 1)?)?))
        });
        self.register("sub", SemType::Number, |args| {
            Ok(Value::Number(numeric(arg(args, 0)?)? - numeric(arg(args, 1)?)?))
        });
        self.register("mul", SemType::Number, |args| {
            Ok(Value::Number(numeric(arg(args, 0)?)? * numeric(arg(args, 1)?)?))
        });
        self.register("div", SemType::Number, |args| {
            let denominator = numeric(arg(args, 1)?)?;
            if denominator == 0.0 {
                return Err(Error::Evaluation("division by zero".to_string()));
            }
            Ok(Value::Number(numeric(arg(args, 0)?)? / denominator))
        });
        self.register("mod", SemType::Number, |args| {
            let denominator = numeric(arg(args, 1)?)?;
            if denominator == 0.0 {
                return Err(Error::Evaluation("division by zero".to_string()));
            }
            Ok(Value::Number(numeric(arg(args, 0)?)? % denominator))
        });
        self.register("negate", SemType::Number, |args| {
            Ok(Value::Number(-numeric(arg(args, 0)?)?))
        });
        self.register("bool", SemType::Boolean, |args| {
            Ok(Value::Bool(arg(args, 0)?.is_truthy()))
        });
        self.register("true", SemType::Boolean, |_| Ok(Value::Bool(true)));
        self.register("false", SemType::Boolean, |_| Ok(Value::Bool(false)));
        self.register("upper", SemType::String, |args| {
            Ok(Value::String(text(arg(args, 0)?)?.to_uppercase()))
        });
        self.register("lower", SemType::String, |args| {
            Ok(Value::String(text(arg(args, 0)?)?.to_lowercase()))
        });
        self.register("trim", SemType::String, |args| {
            trim_with(args, |s, p| s.trim_matches(p).to_string(), str::trim)
        });
        self.register("ltrim", SemType::String, |args| {
            trim_with(args, |s, p| s.trim_start_matches(p).to_string(), str::trim_start)
        });
        self.register("rtrim", SemType::String, |args| {
            trim_with(args, |s, p| s.trim_end_matches(p).to_string(), str::trim_end)
        });

        self.register_meta(
            "if",
            FuncMeta {
                imp: FuncImpl::Lazy(Box::new(|args: &mut dyn ArgEval| {
                    if args.arg_count() != 3 {
                        return Err(Error::Evaluation(
                            "if() takes a condition and two branches".to_string(),
                        ));
                    }
                    if args.eval_arg(0)?.is_truthy() {
                        args.eval_arg(1)
                    } else {
                        args.eval_arg(2)
                    }
                })),
                result_type: SemType::Object,
                independent: true,
                aggregate: false,
                cost: None,
            },
        );

        self.register_aggregate("count", |values| Ok(Value::Number(values.len() as f64)));
        self.register_aggregate("sum", |values| {
            let mut total = 0.0;
            for v in values {
                total += numeric(v)?;
            }
            Ok(Value::Number(total))
        });
        self.register_aggregate("avg", |values| {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let mut total = 0.0;
            for v in values {
                total += numeric(v)?;
            }
            Ok(Value::Number(total / values.len() as f64))
        });
        self.register_aggregate("min", |values| {
            Ok(values
                .iter()
                .min_by(|a, b| a.compare(b))
                .cloned()
                .unwrap_or(Value::Null))
        });
        self.register_aggregate("max", |values| {
            Ok(values
                .iter()
                .max_by(|a, b| a.compare(b))
                .cloned()
                .unwrap_or(Value::Null))
        });
    }

    fn register_aggregate<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.register_meta(
            name,
            FuncMeta {
                imp: FuncImpl::Eager(Box::new(move |args: &[Value]| {
                    // the evaluator collects the group's values into a list
                    match arg(args, 0)? {
                        Value::List(items) => func(items),
                        Value::Null => func(&[]),
                        single => func(std::slice::from_ref(single)),
                    }
                })),
                result_type: SemType::Number,
                independent: false,
                aggregate: true,
                cost: None,
            },
        );
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn arg(args: &[Value], index: usize) -> Result<&Value> {
    args.get(index)
        .ok_or_else(|| Error::Evaluation(format!("missing function argument {index}")))
}

/// Numeric coercion: numbers pass through, numeric strings parse, booleans
/// become 0/1
fn numeric(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) | Value::Ref(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::Evaluation(format!("could not convert {s:?} to a number"))),
        other => Err(Error::Evaluation(format!(
            "could not convert {} to a number",
            other.type_name()
        ))),
    }
}

fn text(value: &Value) -> Result<&str> {
    value
        .as_str()
        .ok_or_else(|| Error::Evaluation(format!("expected a string, got {}", value.type_name())))
}

fn trim_with(
    args: &[Value],
    with_pattern: impl Fn(&str, &[char]) -> String,
    plain: impl Fn(&str) -> &str,
) -> Result<Value> {
    let s = text(arg(args, 0)?)?;
    if let Some(chars) = args.get(1) {
        let pattern: Vec<char> = text(chars)?.chars().collect();
        Ok(Value::String(with_pattern(s, &pattern)))
    } else {
        Ok(Value::String(plain(s).to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(registry: &FunctionRegistry, name: &str, args: &[Value]) -> Result<Value> {
        match &registry.lookup(name).expect("registered").imp {
            FuncImpl::Eager(f) => f(args),
            FuncImpl::Lazy(_) => panic!("eager call on lazy function"),
        }
    }

    #[test]
    fn test_arithmetic() {
        let registry = FunctionRegistry::new();
        assert_eq!(
            call(&registry, "add", &[Value::Number(1.0), Value::Number(2.0)]).expect("add"),
            Value::Number(3.0)
        );
        assert_eq!(
            call(&registry, "negate", &[Value::Number(4.0)]).expect("negate"),
            Value::Number(-4.0)
        );
    }

    #[test]
    fn test_numeric_string_coercion() {
        let registry = FunctionRegistry::new();
        // ids are strings but participate in arithmetic
        assert_eq!(
            call(
                &registry,
                "mul",
                &[Value::String("1".to_string()), Value::Number(2.0)]
            )
            .expect("mul"),
            Value::Number(2.0)
        );
    }

    #[test]
    fn test_division_by_zero() {
        let registry = FunctionRegistry::new();
        let err = call(&registry, "div", &[Value::Number(1.0), Value::Number(0.0)])
            .expect_err("must fail");
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_string_functions() {
        let registry = FunctionRegistry::new();
        assert_eq!(
            call(&registry, "upper", &[Value::String("ab".to_string())]).expect("upper"),
            Value::String("AB".to_string())
        );
        assert_eq!(
            call(&registry, "trim", &[Value::String("  x ".to_string())]).expect("trim"),
            Value::String("x".to_string())
        );
        assert_eq!(
            call(
                &registry,
                "trim",
                &[
                    Value::String("--x--".to_string()),
                    Value::String("-".to_string())
                ]
            )
            .expect("trim chars"),
            Value::String("x".to_string())
        );
    }

    #[test]
    fn test_aggregates_over_lists() {
        let registry = FunctionRegistry::new();
        let group = Value::List(vec![
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(3.0),
        ]);
        assert_eq!(
            call(&registry, "count", std::slice::from_ref(&group)).expect("count"),
            Value::Number(3.0)
        );
        assert_eq!(
            call(&registry, "sum", std::slice::from_ref(&group)).expect("sum"),
            Value::Number(6.0)
        );
        assert_eq!(
            call(&registry, "avg", std::slice::from_ref(&group)).expect("avg"),
            Value::Number(2.0)
        );
        // a scalar counts as a one-element group
        assert_eq!(
            call(&registry, "count", &[Value::Number(9.0)]).expect("count"),
            Value::Number(1.0)
        );
    }

    #[test]
    fn test_unknown_function() {
        let registry = FunctionRegistry::new();
        assert!(matches!(
            registry.lookup("frobnicate"),
            Err(Error::UnknownFunction(_))
        ));
    }
}
