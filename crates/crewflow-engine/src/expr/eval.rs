use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use crewflow_core::error::ExprError;

use super::parser::{BinaryOp, Expr, UnaryOp};

/// Python-style truthiness: null, false, 0, "", [] and {} are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn evaluate(expr: &Expr, state: &Map<String, Value>) -> Result<Value, ExprError> {
    Evaluator { state }.eval(expr)
}

struct Evaluator<'a> {
    state: &'a Map<String, Value>,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value, ExprError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::List(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Field(name) => self.field(name),
            Expr::Attr(base, name) => {
                let base = self.eval(base)?;
                match base {
                    Value::Object(mut map) => map
                        .remove(name)
                        .ok_or_else(|| ExprError::UnknownField(path_of(expr))),
                    other => Err(ExprError::Type(format!(
                        "cannot read field '{}' of {}",
                        name,
                        type_name(&other)
                    ))),
                }
            }
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                self.index(expr, base, &index)
            }
            Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!is_truthy(&self.eval(inner)?))),
            Expr::Unary(UnaryOp::Neg, inner) => match self.eval(inner)? {
                Value::Number(n) => negate(&n),
                other => Err(ExprError::Type(format!("cannot negate {}", type_name(&other)))),
            },
            // `and`/`or` short-circuit and yield an operand, as in Python
            Expr::And(lhs, rhs) => {
                let l = self.eval(lhs)?;
                if is_truthy(&l) {
                    self.eval(rhs)
                } else {
                    Ok(l)
                }
            }
            Expr::Or(lhs, rhs) => {
                let l = self.eval(lhs)?;
                if is_truthy(&l) {
                    Ok(l)
                } else {
                    self.eval(rhs)
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                binary(*op, &l, &r)
            }
            Expr::Call(name, args) => self.call(name, args),
        }
    }

    fn field(&self, name: &str) -> Result<Value, ExprError> {
        if name == "state" {
            return Ok(Value::Object(self.state.clone()));
        }
        self.state
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownField(name.to_string()))
    }

    fn index(&self, expr: &Expr, base: Value, index: &Value) -> Result<Value, ExprError> {
        match (base, index) {
            (Value::Object(mut map), Value::String(key)) => map
                .remove(key)
                .ok_or_else(|| ExprError::UnknownField(path_of(expr))),
            (Value::Array(mut items), Value::Number(n)) => {
                let i = n
                    .as_i64()
                    .ok_or_else(|| ExprError::Type(format!("list index must be an integer, got {}", n)))?;
                let len = items.len() as i64;
                // Negative indices count from the end
                let i = if i < 0 { len + i } else { i };
                if i < 0 || i >= len {
                    return Err(ExprError::UnknownField(path_of(expr)));
                }
                Ok(items.swap_remove(i as usize))
            }
            (Value::String(s), Value::Number(n)) => {
                let i = n
                    .as_i64()
                    .ok_or_else(|| ExprError::Type(format!("string index must be an integer, got {}", n)))?;
                let len = s.chars().count() as i64;
                let i = if i < 0 { len + i } else { i };
                if i < 0 || i >= len {
                    return Err(ExprError::UnknownField(path_of(expr)));
                }
                Ok(s.chars()
                    .nth(i as usize)
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or(Value::Null))
            }
            (base, index) => Err(ExprError::Type(format!(
                "cannot index {} with {}",
                type_name(&base),
                type_name(index)
            ))),
        }
    }

    fn call(&self, name: &str, args: &[Expr]) -> Result<Value, ExprError> {
        match name {
            "len" => {
                let [arg] = args else {
                    return Err(ExprError::Type(format!("len() takes 1 argument, got {}", args.len())));
                };
                let n = match self.eval(arg)? {
                    Value::String(s) => s.chars().count(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    other => {
                        return Err(ExprError::Type(format!(
                            "len() of {} is undefined",
                            type_name(&other)
                        )))
                    }
                };
                Ok(Value::from(n as u64))
            }
            "exists" => {
                let [arg] = args else {
                    return Err(ExprError::Type(format!(
                        "exists() takes 1 argument, got {}",
                        args.len()
                    )));
                };
                match self.eval(arg) {
                    Ok(v) => Ok(Value::Bool(!v.is_null())),
                    Err(ExprError::UnknownField(_)) => Ok(Value::Bool(false)),
                    Err(e) => Err(e),
                }
            }
            other => Err(ExprError::UnknownFunction(other.to_string())),
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(l, r))),
        BinaryOp::Lt => compare(l, r).map(|o| Value::Bool(o == Ordering::Less)),
        BinaryOp::Le => compare(l, r).map(|o| Value::Bool(o != Ordering::Greater)),
        BinaryOp::Gt => compare(l, r).map(|o| Value::Bool(o == Ordering::Greater)),
        BinaryOp::Ge => compare(l, r).map(|o| Value::Bool(o != Ordering::Less)),
        BinaryOp::In => contains(r, l).map(Value::Bool),
        BinaryOp::NotIn => contains(r, l).map(|b| Value::Bool(!b)),
        BinaryOp::Add => match (l, r) {
            (Value::Number(a), Value::Number(b)) => arith(op, a, b),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => Err(operand_error(op, l, r)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => match (l, r) {
            (Value::Number(a), Value::Number(b)) => arith(op, a, b),
            _ => Err(operand_error(op, l, r)),
        },
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Result<Ordering, ExprError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                return Ok(x.cmp(&y));
            }
            let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y)
                .ok_or_else(|| ExprError::Type(format!("cannot compare {} and {}", a, b)))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        _ => Err(ExprError::Type(format!(
            "cannot order {} and {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, ExprError> {
    match (haystack, needle) {
        (Value::Array(items), _) => Ok(items.iter().any(|v| values_equal(v, needle))),
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        _ => Err(ExprError::Type(format!(
            "'in' is undefined for {} in {}",
            type_name(needle),
            type_name(haystack)
        ))),
    }
}

fn arith(op: BinaryOp, a: &Number, b: &Number) -> Result<Value, ExprError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Rem => {
                if y == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                x.checked_rem_euclid(y).map(|m| if m != 0 && y < 0 { m + y } else { m })
            }
            _ => None,
        };
        if let Some(n) = exact {
            return Ok(Value::from(n));
        }
    }

    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => {
            if y == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            x / y
        }
        BinaryOp::Rem => {
            if y == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            ((x % y) + y) % y
        }
        _ => return Err(ExprError::Type(format!("{:?} is not an arithmetic operator", op))),
    };
    float(result)
}

fn negate(n: &Number) -> Result<Value, ExprError> {
    if let Some(i) = n.as_i64() {
        if let Some(neg) = i.checked_neg() {
            return Ok(Value::from(neg));
        }
    }
    float(-n.as_f64().unwrap_or(f64::NAN))
}

fn float(f: f64) -> Result<Value, ExprError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Type("arithmetic result is not a finite number".to_string()))
}

fn operand_error(op: BinaryOp, l: &Value, r: &Value) -> ExprError {
    let sym = match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
        _ => "?",
    };
    ExprError::Type(format!(
        "unsupported operands for {}: {} and {}",
        sym,
        type_name(l),
        type_name(r)
    ))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Dotted rendering of a field path, for error messages.
fn path_of(expr: &Expr) -> String {
    match expr {
        Expr::Field(name) => name.clone(),
        Expr::Attr(base, name) => format!("{}.{}", path_of(base), name),
        Expr::Index(base, index) => match index.as_ref() {
            Expr::Literal(Value::String(s)) => format!("{}[{:?}]", path_of(base), s),
            Expr::Literal(v) => format!("{}[{}]", path_of(base), v),
            _ => format!("{}[..]", path_of(base)),
        },
        _ => "<expr>".to_string(),
    }
}
