use serde::{Deserialize, Serialize};

use crate::Value;

fn default_abs_tol() -> f64 {
    1e-9
}

fn default_rel_tol() -> f64 {
    1e-9
}

/// How numbers are compared when a result is checked against an expected value.
///
/// Tags, sequence lengths and mapping keys are always compared exactly.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Comparison {
    /// Exact structural equality with the integer/float promotion rule.
    #[default]
    Exact,
    /// Floats (and ints compared against floats) match when
    /// `|a - b| <= max(rel_tol * max(|a|, |b|), abs_tol)`. Int vs int stays exact.
    Approx {
        #[serde(default = "default_abs_tol")]
        abs_tol: f64,
        #[serde(default = "default_rel_tol")]
        rel_tol: f64,
    },
}

#[derive(Clone, Copy)]
enum Num {
    I(i64),
    F(f64),
}

impl Comparison {
    pub fn approx() -> Self {
        Comparison::Approx {
            abs_tol: default_abs_tol(),
            rel_tol: default_rel_tol(),
        }
    }

    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Seq(xs), Value::Seq(ys)) => {
                xs.len() == ys.len()
                    && xs.iter().zip(ys).all(|(x, y)| self.values_equal(x, y))
            }
            (Value::Map(xs), Value::Map(ys)) => {
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .all(|(k, x)| ys.get(k).is_some_and(|y| self.values_equal(x, y)))
            }
            _ => match (as_num(a), as_num(b)) {
                (Some(x), Some(y)) => self.numbers_equal(x, y),
                _ => false,
            },
        }
    }

    fn numbers_equal(&self, a: Num, b: Num) -> bool {
        match (*self, a, b) {
            (_, Num::I(x), Num::I(y)) => x == y,
            (Comparison::Exact, Num::F(x), Num::F(y)) => x == y,
            (Comparison::Exact, Num::I(i), Num::F(f))
            | (Comparison::Exact, Num::F(f), Num::I(i)) => int_float_eq(i, f),
            (Comparison::Approx { abs_tol, rel_tol }, x, y) => {
                close(to_f64(x), to_f64(y), abs_tol, rel_tol)
            }
        }
    }
}

fn as_num(v: &Value) -> Option<Num> {
    match v {
        Value::Int(i) => Some(Num::I(*i)),
        Value::Float(f) => Some(Num::F(*f)),
        _ => None,
    }
}

fn to_f64(n: Num) -> f64 {
    match n {
        Num::I(i) => i as f64,
        Num::F(f) => f,
    }
}

// 2^63 as f64; every integral float in [-2^63, 2^63) converts to i64 exactly.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

fn int_float_eq(i: i64, f: f64) -> bool {
    f.is_finite() && f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&f) && f as i64 == i
}

fn close(x: f64, y: f64, abs_tol: f64, rel_tol: f64) -> bool {
    if x == y {
        return true;
    }
    if !x.is_finite() || !y.is_finite() {
        return false;
    }
    let diff = (x - y).abs();
    diff <= (rel_tol * x.abs().max(y.abs())).max(abs_tol)
}
