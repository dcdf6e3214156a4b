//! Composite keys
//!
//! A `MultiValue` is an owned fixed-length sequence of values used as a
//! primary key. Order is lexicographic; the hash is the XOR of the
//! element hashes so key hashing is independent of element order changes
//! in the schema.

use crate::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Index;

/// An owned sequence of values, used as a primary key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MultiValue(Vec<Value>);

impl MultiValue {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    /// Lexicographic comparison by element; element order is [`Value::cmp`].
    pub fn compare(&self, other: &MultiValue) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl From<Value> for MultiValue {
    fn from(v: Value) -> Self {
        Self(vec![v])
    }
}

impl From<Vec<Value>> for MultiValue {
    fn from(vs: Vec<Value>) -> Self {
        Self(vs)
    }
}

impl Index<usize> for MultiValue {
    type Output = Value;

    fn index(&self, idx: usize) -> &Value {
        &self.0[idx]
    }
}

impl PartialOrd for MultiValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for MultiValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Hash for MultiValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut acc = 0u64;
        for value in &self.0 {
            let mut hasher = DefaultHasher::new();
            value.hash(&mut hasher);
            acc ^= hasher.finish();
        }
        state.write_u64(acc);
    }
}

impl fmt::Display for MultiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elementwise_equality() {
        let a = MultiValue::new(vec![Value::I64(1), Value::Str("x".into())]);
        let b = MultiValue::new(vec![Value::I64(1), Value::Str("x".into())]);
        let c = MultiValue::new(vec![Value::I64(1)]);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_lexicographic_compare() {
        let a = MultiValue::new(vec![Value::I64(1), Value::I64(2)]);
        let b = MultiValue::new(vec![Value::I64(1), Value::I64(3)]);
        let c = MultiValue::new(vec![Value::I64(2)]);

        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&a), Ordering::Greater);
        assert_eq!(a.compare(&a), Ordering::Equal);
        // A shorter prefix sorts first.
        assert_eq!(a.compare(&c), Ordering::Less);
    }

    #[test]
    fn test_cross_kind_compare_by_tag() {
        let ints = MultiValue::new(vec![Value::I32(7)]);
        let strs = MultiValue::new(vec![Value::Str("7".into())]);
        assert_eq!(ints.compare(&strs), Ordering::Less);
    }

    #[test]
    fn test_usable_as_map_key() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(MultiValue::from(Value::I64(1)), "first");
        map.insert(
            MultiValue::new(vec![Value::I64(1), Value::I64(2)]),
            "second",
        );

        assert_eq!(map.get(&MultiValue::from(Value::I64(1))), Some(&"first"));
        assert_eq!(map.len(), 2);
    }
}
