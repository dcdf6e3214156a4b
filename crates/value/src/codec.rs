//! Byte codecs for the row substrate
//!
//! Fixed-width kinds encode to native-endian byte images inside a row's
//! fixed part; variable-width kinds encode to their raw bytes in the var
//! part. Cross-architecture portability is explicitly not a goal of the
//! row format.

use crate::{Value, ValueKind};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("fixed-width encoding of variable-width kind {0}")]
    NotFixedWidth(ValueKind),

    #[error("truncated input: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("invalid utf-8 in string column")]
    InvalidUtf8,
}

/// Append the fixed-width byte image of `value` to `out`.
pub fn encode_fixed(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::I32(v) => out.extend_from_slice(&v.to_ne_bytes()),
        Value::I64(v) => out.extend_from_slice(&v.to_ne_bytes()),
        Value::Double(v) => out.extend_from_slice(&v.to_ne_bytes()),
        Value::Str(_) => return Err(Error::NotFixedWidth(ValueKind::Str)),
    }
    Ok(())
}

/// Decode a fixed-width value of `kind` from the front of `bytes`.
pub fn decode_fixed(kind: ValueKind, bytes: &[u8]) -> Result<Value> {
    let width = kind.fixed_width().ok_or(Error::NotFixedWidth(kind))?;
    if bytes.len() < width {
        return Err(Error::Truncated {
            need: width,
            have: bytes.len(),
        });
    }
    let value = match kind {
        ValueKind::I32 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[..4]);
            Value::I32(i32::from_ne_bytes(buf))
        }
        ValueKind::I64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            Value::I64(i64::from_ne_bytes(buf))
        }
        ValueKind::Double => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            Value::Double(f64::from_ne_bytes(buf))
        }
        ValueKind::Str => unreachable!("Str has no fixed width"),
    };
    Ok(value)
}

/// The var-part byte image of a variable-width value.
pub fn var_bytes(value: &Value) -> Result<&[u8]> {
    match value {
        Value::Str(s) => Ok(s.as_bytes()),
        other => Err(Error::KindMismatch {
            expected: ValueKind::Str,
            found: other.kind(),
        }),
    }
}

/// Decode a variable-width value of `kind` from its var-part bytes.
pub fn decode_var(kind: ValueKind, bytes: &[u8]) -> Result<Value> {
    match kind {
        ValueKind::Str => {
            let s = std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)?;
            Ok(Value::Str(s.to_string()))
        }
        other => Err(Error::NotFixedWidth(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_roundtrip() {
        for value in [Value::I32(-7), Value::I64(1 << 40), Value::Double(2.5)] {
            let mut buf = Vec::new();
            encode_fixed(&value, &mut buf).unwrap();
            assert_eq!(buf.len(), value.kind().fixed_width().unwrap());
            assert_eq!(decode_fixed(value.kind(), &buf).unwrap(), value);
        }
    }

    #[test]
    fn test_var_roundtrip() {
        let value = Value::Str("hello".into());
        let bytes = var_bytes(&value).unwrap();
        assert_eq!(decode_var(ValueKind::Str, bytes).unwrap(), value);
    }

    #[test]
    fn test_fixed_rejects_str() {
        let mut buf = Vec::new();
        assert!(matches!(
            encode_fixed(&Value::Str("x".into()), &mut buf),
            Err(Error::NotFixedWidth(ValueKind::Str))
        ));
    }

    #[test]
    fn test_truncated_input() {
        assert!(matches!(
            decode_fixed(ValueKind::I64, &[0u8; 4]),
            Err(Error::Truncated { need: 8, have: 4 })
        ));
    }
}
