//! Expression evaluation over a JSON message

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use super::parser::{BinaryOp, Expr, Function};
use crate::rule::MessageContext;

/// Numeric operand; integers stay integers until an operation needs a float
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn from_value(value: &Value) -> Option<Self> {
        let Value::Number(number) = value else {
            return None;
        };
        match number.as_i64() {
            Some(n) => Some(Num::Int(n)),
            None => number.as_f64().map(Num::Float),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Float(f) => f,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Num::Int(n) => Value::from(n),
            // Non-finite results become null
            Num::Float(f) => Value::from(f),
        }
    }
}

/// Evaluation environment for one message
pub(crate) struct Env<'a> {
    pub message: &'a Map<String, Value>,
    pub context: &'a MessageContext,
}

impl Env<'_> {
    pub(crate) fn eval(&self, expr: &Expr) -> Value {
        match expr {
            Expr::Literal(value) => value.clone(),
            Expr::Path(segments) => self.lookup(segments),
            Expr::Neg(inner) => match Num::from_value(&self.eval(inner)) {
                Some(Num::Int(n)) => match n.checked_neg() {
                    Some(n) => Value::from(n),
                    None => Num::Float(-(n as f64)).into_value(),
                },
                Some(Num::Float(f)) => Num::Float(-f).into_value(),
                None => Value::Null,
            },
            Expr::Not(inner) => Value::Bool(!truthy(&self.eval(inner))),
            Expr::Binary(left, BinaryOp::And, right) => {
                Value::Bool(truthy(&self.eval(left)) && truthy(&self.eval(right)))
            }
            Expr::Binary(left, BinaryOp::Or, right) => {
                Value::Bool(truthy(&self.eval(left)) || truthy(&self.eval(right)))
            }
            Expr::Binary(left, op, right) => {
                let left = self.eval(left);
                let right = self.eval(right);
                binary(*op, &left, &right)
            }
            Expr::In {
                expr,
                list,
                negated,
            } => {
                let value = self.eval(expr);
                if value.is_null() {
                    return Value::Bool(false);
                }
                let found = list
                    .iter()
                    .any(|item| values_equal(&value, &self.eval(item)));
                Value::Bool(found != *negated)
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => match (self.eval(expr), self.eval(pattern)) {
                (Value::String(text), Value::String(pattern)) => {
                    Value::Bool(like(&text, &pattern) != *negated)
                }
                _ => Value::Bool(false),
            },
            Expr::IsNull { expr, negated } => {
                Value::Bool(self.eval(expr).is_null() != *negated)
            }
            Expr::Call(function, args) => self.call(*function, args),
        }
    }

    fn lookup(&self, segments: &[String]) -> Value {
        let mut current = match segments.first().and_then(|s| self.message.get(s)) {
            Some(value) => value,
            None => return Value::Null,
        };
        for segment in &segments[1..] {
            current = match current.get(segment) {
                Some(value) => value,
                None => return Value::Null,
            };
        }
        current.clone()
    }

    fn call(&self, function: Function, args: &[Expr]) -> Value {
        let arg = |i: usize| args.get(i).map(|e| self.eval(e)).unwrap_or(Value::Null);

        match function {
            Function::Ceil => numeric(&arg(0), |n| match n {
                Num::Int(n) => Num::Int(n),
                Num::Float(f) => to_integer(f.ceil()),
            }),
            Function::Floor => numeric(&arg(0), |n| match n {
                Num::Int(n) => Num::Int(n),
                Num::Float(f) => to_integer(f.floor()),
            }),
            Function::Abs => numeric(&arg(0), |n| match n {
                Num::Int(n) => n
                    .checked_abs()
                    .map(Num::Int)
                    .unwrap_or(Num::Float((n as f64).abs())),
                Num::Float(f) => Num::Float(f.abs()),
            }),
            Function::Round => {
                let value = arg(0);
                match args.len() {
                    1 => numeric(&value, |n| match n {
                        Num::Int(n) => Num::Int(n),
                        Num::Float(f) => to_integer(f.round()),
                    }),
                    _ => match Num::from_value(&arg(1)) {
                        Some(Num::Int(digits)) => numeric(&value, |n| {
                            let factor = 10f64.powi(digits.clamp(-15, 15) as i32);
                            Num::Float((n.as_f64() * factor).round() / factor)
                        }),
                        _ => Value::Null,
                    },
                }
            }
            Function::Mod => binary(BinaryOp::Mod, &arg(0), &arg(1)),
            Function::ClientId => Value::String(self.context.client_id.to_string()),
            Function::ClientIp => self
                .context
                .client_ip
                .map(|ip| Value::String(ip.to_string()))
                .unwrap_or(Value::Null),
            Function::Topic => {
                if args.is_empty() {
                    return Value::String(self.context.topic.to_string());
                }
                // 1-based topic level
                match Num::from_value(&arg(0)) {
                    Some(Num::Int(level)) if level >= 1 => self
                        .context
                        .topic
                        .split('/')
                        .nth((level - 1) as usize)
                        .map(|s| Value::String(s.to_string()))
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                }
            }
            Function::Qos => Value::from(self.context.qos as u8),
            Function::Uuid | Function::NewId => {
                Value::String(uuid::Uuid::new_v4().to_string())
            }
            Function::CurrentTimestamp | Function::LocalTimestamp => {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                Value::from(millis)
            }
        }
    }
}

/// Truth value of a condition result
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn numeric(value: &Value, f: impl FnOnce(Num) -> Num) -> Value {
    match Num::from_value(value) {
        Some(n) => f(n).into_value(),
        None => Value::Null,
    }
}

fn to_integer(f: f64) -> Num {
    if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Num::Int(f as i64)
    } else {
        Num::Float(f)
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            match (Num::from_value(left), Num::from_value(right)) {
                (Some(a), Some(b)) => arithmetic(op, a, b),
                _ => Value::Null,
            }
        }
        BinaryOp::Eq => Value::Bool(!left.is_null() && values_equal(left, right)),
        BinaryOp::NotEq => Value::Bool(
            !left.is_null() && !right.is_null() && !values_equal(left, right),
        ),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let result = compare(left, right).is_some_and(|ordering| match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            });
            Value::Bool(result)
        }
        BinaryOp::And => Value::Bool(truthy(left) && truthy(right)),
        BinaryOp::Or => Value::Bool(truthy(left) || truthy(right)),
    }
}

fn arithmetic(op: BinaryOp, a: Num, b: Num) -> Value {
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div => {
                    if b == 0 {
                        return Value::Null;
                    }
                    match a.checked_rem(b) {
                        Some(0) => a.checked_div(b),
                        Some(_) => return Num::Float(a as f64 / b as f64).into_value(),
                        None => None,
                    }
                }
                _ => {
                    if b == 0 {
                        return Value::Null;
                    }
                    a.checked_rem(b)
                }
            };
            match result {
                Some(n) => Value::from(n),
                None => float_arithmetic(op, a as f64, b as f64),
            }
        }
        (a, b) => float_arithmetic(op, a.as_f64(), b.as_f64()),
    }
}

fn float_arithmetic(op: BinaryOp, a: f64, b: f64) -> Value {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Mod if b == 0.0 => return Value::Null,
        BinaryOp::Div => a / b,
        _ => a % b,
    };
    Num::Float(result).into_value()
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (Num::from_value(left), Num::from_value(right)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
        (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
        _ => !left.is_null() && left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => match (Num::from_value(left), Num::from_value(right)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => Some(a.cmp(&b)),
            (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
            _ => None,
        },
    }
}

/// SQL `LIKE`: `%` matches any run, `_` exactly one character
pub(crate) fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some('_') => {
                t += 1;
                p += 1;
            }
            Some(&c) if c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match backtrack {
                Some((bp, bt)) => {
                    p = bp + 1;
                    t = bt + 1;
                    backtrack = Some((bp, bt + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '%')
}
