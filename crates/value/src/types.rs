//! Tagged scalar values
//!
//! The four kinds the storage substrate understands. Values are immutable
//! once constructed; the cross-kind order (I32 < I64 < Double < Str) keeps
//! composite keys totally ordered even when schemas disagree.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Kind tag of a [`Value`]. The declaration order defines the cross-kind
/// ordering used by [`Value::cmp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    I32,
    I64,
    Double,
    Str,
}

impl ValueKind {
    /// Byte width of fixed-size kinds; `None` for variable-width kinds.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            ValueKind::I32 => Some(4),
            ValueKind::I64 => Some(8),
            ValueKind::Double => Some(8),
            ValueKind::Str => None,
        }
    }

    pub fn is_fixed_width(&self) -> bool {
        self.fixed_width().is_some()
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::I32 => "i32",
            ValueKind::I64 => "i64",
            ValueKind::Double => "double",
            ValueKind::Str => "str",
        };
        write!(f, "{}", name)
    }
}

/// A tagged scalar value.
///
/// `Double` is compared with `f64::total_cmp` and hashed by bit pattern so
/// values can serve as map keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    I32(i32),
    I64(i64),
    Double(f64),
    Str(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::Double(_) => ValueKind::Double,
            Value::Str(_) => ValueKind::Str,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::I32(v) => v.hash(state),
            Value::I64(v) => v.hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::I32(a), Value::I32(b)) => a.cmp(b),
            (Value::I64(a), Value::I64(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            _ => self.kind().cmp(&other.kind()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_kind_order() {
        assert!(Value::I32(1) < Value::I32(2));
        assert!(Value::I64(-5) < Value::I64(0));
        assert!(Value::Double(1.5) < Value::Double(2.5));
        assert!(Value::Str("a".into()) < Value::Str("b".into()));
    }

    #[test]
    fn test_cross_kind_order_by_tag() {
        assert!(Value::I32(i32::MAX) < Value::I64(i64::MIN));
        assert!(Value::I64(i64::MAX) < Value::Double(f64::NEG_INFINITY));
        assert!(Value::Double(f64::INFINITY) < Value::Str(String::new()));
    }

    #[test]
    fn test_double_total_order() {
        assert!(Value::Double(f64::NEG_INFINITY) < Value::Double(0.0));
        assert!(Value::Double(0.0) < Value::Double(f64::NAN));
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
    }

    #[test]
    fn test_hash_eq_consistency() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(Value::Str("bal".into()), 1);
        map.insert(Value::Double(2.5), 2);

        assert_eq!(map.get(&Value::Str("bal".into())), Some(&1));
        assert_eq!(map.get(&Value::Double(2.5)), Some(&2));
    }

    #[test]
    fn test_fixed_widths() {
        assert_eq!(ValueKind::I32.fixed_width(), Some(4));
        assert_eq!(ValueKind::I64.fixed_width(), Some(8));
        assert_eq!(ValueKind::Double.fixed_width(), Some(8));
        assert_eq!(ValueKind::Str.fixed_width(), None);
    }

    #[test]
    fn test_serde_roundtrip() {
        for value in [
            Value::I32(-1),
            Value::I64(1 << 40),
            Value::Double(2.5),
            Value::Str("piece".into()),
        ] {
            let json = serde_json::to_string(&value).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            assert_eq!(back, value);
        }
    }
}
