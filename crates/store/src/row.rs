//! Row substrate
//!
//! A row stores all fixed-width columns in one contiguous byte buffer and
//! keeps variable-width columns either densely packed (contiguous bytes
//! plus an end-offset index) or in a sparse per-column map. Dense is the
//! default and best for point access; `make_sparse` converts in place for
//! rows whose var columns are updated frequently.

use crate::error::{Error, Result};
use crate::schema::{ColumnId, Schema};
use rill_value::{codec, MultiValue, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Serialized kind tags.
const KIND_DENSE: u8 = 0;
const KIND_SPARSE: u8 = 1;

/// Variable-width column storage.
#[derive(Debug, Clone)]
pub enum VarPart {
    /// Contiguous var bytes; `ends[slot]` marks the end of each segment.
    Dense { data: Vec<u8>, ends: Vec<u32> },
    /// Per-column byte map, keyed by column id.
    Sparse(HashMap<ColumnId, Vec<u8>>),
}

/// A basic row: fixed part plus var part, no concurrency metadata.
#[derive(Debug, Clone)]
pub struct Row {
    schema: Arc<Schema>,
    fixed: Vec<u8>,
    var: VarPart,
    rdonly: bool,
    table: Option<String>,
}

impl Row {
    /// Create a row from one value per column, validating count and kinds.
    pub fn create(schema: Arc<Schema>, values: &[Value]) -> Result<Row> {
        if values.len() != schema.columns_count() {
            return Err(Error::Schema(format!(
                "row has {} values, schema has {} columns",
                values.len(),
                schema.columns_count()
            )));
        }

        let mut fixed = Vec::with_capacity(schema.fixed_part_size());
        let mut data = Vec::new();
        let mut ends = Vec::with_capacity(schema.var_size_cols());

        for (id, value) in values.iter().enumerate() {
            let column = schema.column(id)?;
            if value.kind() != column.kind {
                return Err(Error::KindMismatch {
                    expected: column.kind,
                    found: value.kind(),
                });
            }
            if column.kind.is_fixed_width() {
                codec::encode_fixed(value, &mut fixed)?;
            } else {
                data.extend_from_slice(codec::var_bytes(value)?);
                ends.push(data.len() as u32);
            }
        }

        Ok(Row {
            schema,
            fixed,
            var: VarPart::Dense { data, ends },
            rdonly: false,
            table: None,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn readonly(&self) -> bool {
        self.rdonly
    }

    /// After this call every update fails.
    pub fn make_readonly(&mut self) {
        self.rdonly = true;
    }

    /// Bind the row to its owning table. Single-set: rebinding a bound row
    /// is a bug in the caller.
    pub fn set_table(&mut self, name: &str) {
        assert!(
            self.table.is_none(),
            "row already bound to table {:?}",
            self.table
        );
        self.table = Some(name.to_string());
    }

    pub fn unbind_table(&mut self) {
        self.table = None;
    }

    /// Name of the owning table, if the row has been inserted.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.var, VarPart::Sparse(_))
    }

    /// Convert dense var storage to the sparse map in place.
    pub fn make_sparse(&mut self) {
        let (data, ends) = match &self.var {
            VarPart::Dense { data, ends } => (data, ends),
            VarPart::Sparse(_) => return,
        };
        let mut map = HashMap::with_capacity(ends.len());
        for id in 0..self.schema.columns_count() {
            if let Some(slot) = self.schema.var_slot(id) {
                let (start, end) = var_range(ends, slot);
                map.insert(id, data[start..end].to_vec());
            }
        }
        self.var = VarPart::Sparse(map);
    }

    /// Read one column as a value.
    pub fn get_column(&self, id: ColumnId) -> Result<Value> {
        let column = self.schema.column(id)?;
        if let Some(offset) = self.schema.fixed_offset(id) {
            Ok(codec::decode_fixed(column.kind, &self.fixed[offset..])?)
        } else {
            Ok(codec::decode_var(column.kind, self.column_bytes(id)?)?)
        }
    }

    pub fn get_column_by_name(&self, name: &str) -> Result<Value> {
        self.get_column(self.schema.column_id(name)?)
    }

    /// Raw bytes of one column.
    pub fn get_blob(&self, id: ColumnId) -> Result<&[u8]> {
        let column = self.schema.column(id)?;
        if let Some(offset) = self.schema.fixed_offset(id) {
            let width = column.kind.fixed_width().unwrap_or(0);
            Ok(&self.fixed[offset..offset + width])
        } else {
            self.column_bytes(id)
        }
    }

    fn column_bytes(&self, id: ColumnId) -> Result<&[u8]> {
        let slot = self
            .schema
            .var_slot(id)
            .ok_or(Error::ColumnIdOutOfRange(id))?;
        match &self.var {
            VarPart::Dense { data, ends } => {
                let (start, end) = var_range(ends, slot);
                Ok(&data[start..end])
            }
            // Missing sparse entries read as empty, matching a freshly
            // converted row with no var data.
            VarPart::Sparse(map) => Ok(map.get(&id).map(|v| v.as_slice()).unwrap_or(&[])),
        }
    }

    /// Overwrite one column. Kind must match; readonly rows reject every
    /// update.
    pub fn update(&mut self, id: ColumnId, value: &Value) -> Result<()> {
        if self.rdonly {
            return Err(Error::ReadonlyRow);
        }
        let column = self.schema.column(id)?;
        if value.kind() != column.kind {
            return Err(Error::KindMismatch {
                expected: column.kind,
                found: value.kind(),
            });
        }

        if let Some(offset) = self.schema.fixed_offset(id) {
            let mut image = Vec::with_capacity(8);
            codec::encode_fixed(value, &mut image)?;
            self.fixed[offset..offset + image.len()].copy_from_slice(&image);
            return Ok(());
        }

        let slot = self
            .schema
            .var_slot(id)
            .ok_or(Error::ColumnIdOutOfRange(id))?;
        let bytes = codec::var_bytes(value)?;
        match &mut self.var {
            VarPart::Dense { data, ends } => {
                let (start, end) = var_range(ends, slot);
                let delta = bytes.len() as i64 - (end - start) as i64;
                data.splice(start..end, bytes.iter().copied());
                for e in ends[slot..].iter_mut() {
                    *e = (*e as i64 + delta) as u32;
                }
            }
            VarPart::Sparse(map) => {
                map.insert(id, bytes.to_vec());
            }
        }
        Ok(())
    }

    pub fn update_by_name(&mut self, name: &str, value: &Value) -> Result<()> {
        self.update(self.schema.column_id(name)?, value)
    }

    /// Primary key of this row, built from key columns in schema order.
    pub fn get_key(&self) -> MultiValue {
        let values = self
            .schema
            .key_columns()
            .iter()
            .map(|&id| {
                self.get_column(id)
                    .expect("key column readable on a well-formed row")
            })
            .collect::<Vec<_>>();
        MultiValue::from(values)
    }

    /// Total order on primary-key columns only. Rows must share a schema.
    pub fn compare(&self, other: &Row) -> Ordering {
        self.get_key().compare(&other.get_key())
    }

    /// Append the binary image of this row:
    /// `fixed_part_size(u32) | fixed | kind(u8) | [var_idx | var]`.
    ///
    /// The var index is one byte per var column, so dense rows whose var
    /// part exceeds 255 bytes do not fit the format. Sparse rows serialize
    /// the fixed part only.
    pub fn to_bytes(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&(self.schema.fixed_part_size() as u32).to_ne_bytes());
        out.extend_from_slice(&self.fixed);
        match &self.var {
            VarPart::Dense { data, ends } if self.schema.var_size_cols() > 0 => {
                out.push(KIND_DENSE);
                for &end in ends {
                    if end > u8::MAX as u32 {
                        return Err(Error::Serialization(format!(
                            "var part offset {} exceeds format limit",
                            end
                        )));
                    }
                    out.push(end as u8);
                }
                out.extend_from_slice(data);
            }
            VarPart::Dense { .. } => out.push(KIND_DENSE),
            VarPart::Sparse(_) => out.push(KIND_SPARSE),
        }
        Ok(())
    }

    /// Rebuild a row from its binary image against a known schema.
    pub fn from_bytes(schema: Arc<Schema>, bytes: &[u8]) -> Result<Row> {
        let mut at = 0usize;
        let fixed_part_size = read_u32(bytes, &mut at)? as usize;
        if fixed_part_size != schema.fixed_part_size() {
            return Err(Error::Serialization(format!(
                "fixed part size {} does not match schema ({})",
                fixed_part_size,
                schema.fixed_part_size()
            )));
        }
        let fixed = read_slice(bytes, &mut at, fixed_part_size)?.to_vec();
        let kind = read_slice(bytes, &mut at, 1)?[0];

        let var = match kind {
            KIND_DENSE if schema.var_size_cols() > 0 => {
                let idx = read_slice(bytes, &mut at, schema.var_size_cols())?.to_vec();
                let ends: Vec<u32> = idx.iter().map(|&b| b as u32).collect();
                let var_len = ends.last().copied().unwrap_or(0) as usize;
                let data = read_slice(bytes, &mut at, var_len)?.to_vec();
                VarPart::Dense { data, ends }
            }
            KIND_DENSE => VarPart::Dense {
                data: Vec::new(),
                ends: Vec::new(),
            },
            KIND_SPARSE => VarPart::Sparse(HashMap::new()),
            other => {
                return Err(Error::Serialization(format!("unknown row kind {}", other)));
            }
        };

        Ok(Row {
            schema,
            fixed,
            var,
            rdonly: false,
            table: None,
        })
    }
}

fn var_range(ends: &[u32], slot: usize) -> (usize, usize) {
    let start = if slot == 0 { 0 } else { ends[slot - 1] as usize };
    (start, ends[slot] as usize)
}

fn read_u32(bytes: &[u8], at: &mut usize) -> Result<u32> {
    let raw = read_slice(bytes, at, 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(raw);
    Ok(u32::from_ne_bytes(buf))
}

fn read_slice<'a>(bytes: &'a [u8], at: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *at + len;
    if end > bytes.len() {
        return Err(Error::Serialization(format!(
            "truncated row image: need {} bytes, have {}",
            end,
            bytes.len()
        )));
    }
    let slice = &bytes[*at..end];
    *at = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use rill_value::ValueKind;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                Column::new("id", ValueKind::I64).primary_key(),
                Column::new("bal", ValueKind::Double),
                Column::new("name", ValueKind::Str),
                Column::new("note", ValueKind::Str),
            ])
            .unwrap(),
        )
    }

    fn sample_row() -> Row {
        Row::create(
            schema(),
            &[
                Value::I64(7),
                Value::Double(12.5),
                Value::Str("alice".into()),
                Value::Str("vip".into()),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_read() {
        let row = sample_row();
        assert_eq!(row.get_column(0).unwrap(), Value::I64(7));
        assert_eq!(row.get_column(1).unwrap(), Value::Double(12.5));
        assert_eq!(row.get_column(2).unwrap(), Value::Str("alice".into()));
        assert_eq!(row.get_column(3).unwrap(), Value::Str("vip".into()));
        assert_eq!(row.get_blob(2).unwrap(), b"alice");
    }

    #[test]
    fn test_create_kind_mismatch() {
        let result = Row::create(
            schema(),
            &[
                Value::I32(7),
                Value::Double(0.0),
                Value::Str("a".into()),
                Value::Str("b".into()),
            ],
        );
        assert!(matches!(result, Err(Error::KindMismatch { .. })));
    }

    #[test]
    fn test_update_fixed_and_var() {
        let mut row = sample_row();
        row.update(1, &Value::Double(99.0)).unwrap();
        // Grow, then shrink the first var column; the second must survive.
        row.update(2, &Value::Str("alexandra".into())).unwrap();
        assert_eq!(row.get_column(2).unwrap(), Value::Str("alexandra".into()));
        assert_eq!(row.get_column(3).unwrap(), Value::Str("vip".into()));
        row.update(2, &Value::Str("al".into())).unwrap();
        assert_eq!(row.get_column(2).unwrap(), Value::Str("al".into()));
        assert_eq!(row.get_column(3).unwrap(), Value::Str("vip".into()));
        assert_eq!(row.get_column(1).unwrap(), Value::Double(99.0));
    }

    #[test]
    fn test_update_kind_mismatch() {
        let mut row = sample_row();
        assert!(matches!(
            row.update(0, &Value::I32(1)),
            Err(Error::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_readonly_rejects_updates() {
        let mut row = sample_row();
        row.make_readonly();
        assert!(matches!(
            row.update(1, &Value::Double(0.0)),
            Err(Error::ReadonlyRow)
        ));
        assert!(matches!(
            row.update(2, &Value::Str("x".into())),
            Err(Error::ReadonlyRow)
        ));
    }

    #[test]
    fn test_sparse_conversion_preserves_columns() {
        let mut row = sample_row();
        row.make_sparse();
        assert!(row.is_sparse());
        assert_eq!(row.get_column(2).unwrap(), Value::Str("alice".into()));
        row.update(2, &Value::Str("bob".into())).unwrap();
        assert_eq!(row.get_column(2).unwrap(), Value::Str("bob".into()));
        assert_eq!(row.get_column(3).unwrap(), Value::Str("vip".into()));
    }

    #[test]
    fn test_key_and_compare() {
        let row = sample_row();
        assert_eq!(row.get_key(), MultiValue::from(Value::I64(7)));

        let other = Row::create(
            schema(),
            &[
                Value::I64(8),
                Value::Double(0.0),
                Value::Str(String::new()),
                Value::Str(String::new()),
            ],
        )
        .unwrap();
        assert_eq!(row.compare(&other), Ordering::Less);
        assert_eq!(other.compare(&row), Ordering::Greater);
        assert_eq!(row.compare(&row), Ordering::Equal);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let row = sample_row();
        let mut image = Vec::new();
        row.to_bytes(&mut image).unwrap();

        let back = Row::from_bytes(schema(), &image).unwrap();
        for id in 0..row.schema().columns_count() {
            assert_eq!(back.get_column(id).unwrap(), row.get_column(id).unwrap());
        }
    }

    #[test]
    fn test_serialization_rejects_oversized_var_part() {
        let mut row = sample_row();
        row.update(2, &Value::Str("x".repeat(300))).unwrap();
        let mut image = Vec::new();
        assert!(matches!(
            row.to_bytes(&mut image),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_deserialization_rejects_wrong_schema() {
        let row = sample_row();
        let mut image = Vec::new();
        row.to_bytes(&mut image).unwrap();

        let narrow = Arc::new(
            Schema::new(vec![Column::new("id", ValueKind::I32).primary_key()]).unwrap(),
        );
        assert!(matches!(
            Row::from_bytes(narrow, &image),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_table_binding_single_set() {
        let mut row = sample_row();
        assert_eq!(row.table(), None);
        row.set_table("accounts");
        assert_eq!(row.table(), Some("accounts"));
        row.unbind_table();
        row.set_table("archive");
        assert_eq!(row.table(), Some("archive"));
    }
}
