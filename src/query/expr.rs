//! Expression language used by calculations, filters, index lookups and view
//! conditions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpindleError};
use crate::query::value::Value;
use crate::types::VarId;

/// Largest range `a..b` materialised into an array.
pub const MAX_RANGE_LEN: i64 = 10_000_000;

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnaryOp {
    /// Logical negation.
    Not,
    /// Arithmetic negation.
    Neg,
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// Short-circuit `AND`.
    And,
    /// Short-circuit `OR`.
    Or,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// Membership in an array.
    In,
}

impl BinaryOp {
    /// Operator symbol for explain output.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::In => "IN",
        }
    }
}

/// Built-in functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Function {
    /// Element count of an array/object, character count of a string.
    Length,
}

/// Expression tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Constant value.
    Literal(Value),
    /// Reference to a plan variable.
    Var(VarId),
    /// Bind parameter, substituted before planning.
    BindParam(String),
    /// `base.name`
    Attribute(Box<Expr>, String),
    /// Array constructor.
    Array(Vec<Expr>),
    /// Inclusive integer range `low..high`.
    Range(Box<Expr>, Box<Expr>),
    /// Unary operation.
    Unary(UnaryOp, Box<Expr>),
    /// Binary operation.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Function call.
    Call(Function, Vec<Expr>),
}

/// Supplies variable values during evaluation.
pub trait VarResolver {
    /// Returns the current value of `var`, or `None` when it is not bound.
    fn resolve(&self, var: VarId) -> Option<&Value>;
}

impl Expr {
    /// Literal constructor.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Variable reference constructor.
    pub fn var(var: VarId) -> Self {
        Expr::Var(var)
    }

    /// Bind parameter constructor.
    pub fn param(name: impl Into<String>) -> Self {
        Expr::BindParam(name.into())
    }

    /// Attribute access on `self`.
    pub fn attr(self, name: impl Into<String>) -> Self {
        Expr::Attribute(Box::new(self), name.into())
    }

    /// Array literal built from values.
    pub fn array<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Self {
        Expr::Array(items.into_iter().map(|v| Expr::Literal(v.into())).collect())
    }

    /// Array constructor over arbitrary expressions.
    pub fn array_of(items: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Array(items.into_iter().collect())
    }

    /// Inclusive range `low..high`.
    pub fn range(low: i64, high: i64) -> Self {
        Expr::Range(Box::new(Expr::lit(low)), Box::new(Expr::lit(high)))
    }

    /// Binary operation constructor.
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    /// `left == right`
    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Eq, left, right)
    }

    /// `left > right`
    pub fn gt(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Gt, left, right)
    }

    /// `left >= right`
    pub fn ge(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Ge, left, right)
    }

    /// `left < right`
    pub fn lt(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Lt, left, right)
    }

    /// `left && right`
    pub fn and(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::And, left, right)
    }

    /// `left || right`
    pub fn or(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Or, left, right)
    }

    /// N-ary OR, left-associated; `false` for no terms.
    pub fn any(terms: impl IntoIterator<Item = Expr>) -> Self {
        let mut iter = terms.into_iter();
        let Some(first) = iter.next() else {
            return Expr::lit(false);
        };
        iter.fold(first, Expr::or)
    }

    /// `left * right`
    pub fn mul(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Mul, left, right)
    }

    /// `left + right`
    pub fn add(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Add, left, right)
    }

    /// `NOT expr`
    pub fn not(expr: Expr) -> Self {
        Expr::Unary(UnaryOp::Not, Box::new(expr))
    }

    /// `LENGTH(expr)`
    pub fn length(expr: Expr) -> Self {
        Expr::Call(Function::Length, vec![expr])
    }

    /// Returns the variable if this expression is a bare reference.
    pub fn as_var(&self) -> Option<VarId> {
        match self {
            Expr::Var(var) => Some(*var),
            _ => None,
        }
    }

    /// Appends every referenced variable, in visiting order, to `out`.
    pub fn collect_vars(&self, out: &mut Vec<VarId>) {
        match self {
            Expr::Literal(_) | Expr::BindParam(_) => {}
            Expr::Var(var) => out.push(*var),
            Expr::Attribute(base, _) => base.collect_vars(out),
            Expr::Array(items) | Expr::Call(_, items) => {
                for item in items {
                    item.collect_vars(out);
                }
            }
            Expr::Range(low, high) | Expr::Binary(_, low, high) => {
                low.collect_vars(out);
                high.collect_vars(out);
            }
            Expr::Unary(_, inner) => inner.collect_vars(out),
        }
    }

    /// Returns whether `var` occurs anywhere in the expression.
    pub fn references(&self, var: VarId) -> bool {
        let mut vars = Vec::new();
        self.collect_vars(&mut vars);
        vars.contains(&var)
    }

    /// Rebinds every reference to `from` so that it points at `to`.
    pub fn replace_var(&mut self, from: VarId, to: VarId) {
        match self {
            Expr::Literal(_) | Expr::BindParam(_) => {}
            Expr::Var(var) => {
                if *var == from {
                    *var = to;
                }
            }
            Expr::Attribute(base, _) => base.replace_var(from, to),
            Expr::Array(items) | Expr::Call(_, items) => {
                for item in items {
                    item.replace_var(from, to);
                }
            }
            Expr::Range(low, high) | Expr::Binary(_, low, high) => {
                low.replace_var(from, to);
                high.replace_var(from, to);
            }
            Expr::Unary(_, inner) => inner.replace_var(from, to),
        }
    }

    /// Replaces bind parameters with their supplied values.
    pub fn bind_parameters(&mut self, params: &BTreeMap<String, Value>) -> Result<()> {
        match self {
            Expr::BindParam(name) => {
                let value = params
                    .get(name.as_str())
                    .cloned()
                    .ok_or_else(|| SpindleError::BindParameterMissing(name.clone()))?;
                *self = Expr::Literal(value);
                Ok(())
            }
            Expr::Literal(_) | Expr::Var(_) => Ok(()),
            Expr::Attribute(base, _) => base.bind_parameters(params),
            Expr::Array(items) | Expr::Call(_, items) => {
                for item in items {
                    item.bind_parameters(params)?;
                }
                Ok(())
            }
            Expr::Range(low, high) | Expr::Binary(_, low, high) => {
                low.bind_parameters(params)?;
                high.bind_parameters(params)
            }
            Expr::Unary(_, inner) => inner.bind_parameters(params),
        }
    }

    /// Evaluates the expression against the supplied variable bindings.
    pub fn evaluate(&self, vars: &dyn VarResolver) -> Result<Value> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(var) => vars.resolve(*var).cloned().ok_or_else(|| {
                SpindleError::InvalidOwned(format!("variable {var} is not bound"))
            }),
            Expr::BindParam(name) => Err(SpindleError::BindParameterMissing(name.clone())),
            Expr::Attribute(base, name) => Ok(base.evaluate(vars)?.attribute(name)),
            Expr::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| item.evaluate(vars))
                    .collect::<Result<_>>()?,
            )),
            Expr::Range(low, high) => {
                let low = low.evaluate(vars)?;
                let high = high.evaluate(vars)?;
                eval_range(&low, &high)
            }
            Expr::Unary(op, inner) => {
                let value = inner.evaluate(vars)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.is_truthy()),
                    UnaryOp::Neg => match value {
                        Value::Int(i) => i.checked_neg().map_or(Value::Float(-(i as f64)), Value::Int),
                        Value::Float(f) => Value::Float(-f),
                        _ => Value::Null,
                    },
                })
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                if !left.evaluate(vars)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(right.evaluate(vars)?.is_truthy()))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                if left.evaluate(vars)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(right.evaluate(vars)?.is_truthy()))
            }
            Expr::Binary(op, left, right) => {
                let left = left.evaluate(vars)?;
                let right = right.evaluate(vars)?;
                Ok(eval_binary(*op, &left, &right))
            }
            Expr::Call(Function::Length, args) => {
                let [arg] = args.as_slice() else {
                    return Err(SpindleError::Invalid("LENGTH expects exactly one argument"));
                };
                let len = match arg.evaluate(vars)? {
                    Value::Null => 0,
                    Value::Bool(b) => usize::from(b),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    Value::String(s) => s.chars().count(),
                    Value::Int(i) => i.to_string().len(),
                    Value::Float(f) => f.to_string().len(),
                };
                Ok(Value::Int(len as i64))
            }
        }
    }
}

fn eval_range(low: &Value, high: &Value) -> Result<Value> {
    let (low, high) = (range_bound(low)?, range_bound(high)?);
    let span = high.checked_sub(low).and_then(i64::checked_abs);
    if !span.is_some_and(|span| span <= MAX_RANGE_LEN) {
        return Err(SpindleError::InvalidOwned(format!(
            "range {low}..{high} exceeds {MAX_RANGE_LEN} elements"
        )));
    }
    let items = if low <= high {
        (low..=high).map(Value::Int).collect()
    } else {
        (high..=low).rev().map(Value::Int).collect()
    };
    Ok(Value::Array(items))
}

/// Integer bound of a range. Floats are truncated; NaN, infinities and floats
/// outside `i64` are rejected.
fn range_bound(bound: &Value) -> Result<i64> {
    let float = match bound {
        Value::Int(i) => return Ok(*i),
        Value::Float(f) => f.trunc(),
        _ => return Err(SpindleError::Invalid("range bounds must be numbers")),
    };
    if !float.is_finite() || float < i64::MIN as f64 || float >= i64::MAX as f64 {
        return Err(SpindleError::InvalidOwned(format!(
            "range bound {float} is not a representable integer"
        )));
    }
    Ok(float as i64)
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Eq => Value::Bool(left == right),
        BinaryOp::Ne => Value::Bool(left != right),
        BinaryOp::Lt => Value::Bool(left < right),
        BinaryOp::Le => Value::Bool(left <= right),
        BinaryOp::Gt => Value::Bool(left > right),
        BinaryOp::Ge => Value::Bool(left >= right),
        BinaryOp::In => Value::Bool(
            right
                .as_array()
                .map(|items| items.contains(left))
                .unwrap_or(false),
        ),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            eval_arithmetic(op, left, right)
        }
        BinaryOp::And | BinaryOp::Or => {
            let (l, r) = (left.is_truthy(), right.is_truthy());
            Value::Bool(if op == BinaryOp::And { l && r } else { l || r })
        }
    }
}

fn eval_arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Value {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            _ => None,
        };
        if let Some(v) = exact {
            return Value::Int(v);
        }
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Value::Null;
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Value::Null;
            }
            a / b
        }
        _ => return Value::Null,
    };
    if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
        Value::Int(result as i64)
    } else {
        Value::Float(result)
    }
}
