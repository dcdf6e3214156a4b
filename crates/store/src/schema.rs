//! Table schemas
//!
//! A schema is an ordered list of typed columns, frozen at table
//! registration. Fixed-width columns are packed into a contiguous fixed
//! part; variable-width columns get slots in the var part. There is no
//! ALTER TABLE: schemas never change once a table exists.

use crate::error::{Error, Result};
use rill_value::ValueKind;
use std::collections::HashMap;
use std::fmt;

/// Index of a column within its schema.
pub type ColumnId = usize;

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name, unique within the schema.
    pub name: String,
    /// Value kind stored in this column.
    pub kind: ValueKind,
    /// Whether the column participates in the primary key.
    pub primary_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            primary_key: false,
        }
    }

    /// Mark this column as part of the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

/// An immutable table schema with derived layout information.
#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<Column>,
    by_name: HashMap<String, ColumnId>,
    /// Byte offset into the fixed part, per fixed-width column.
    fixed_offsets: Vec<Option<usize>>,
    /// Slot among the var columns, per variable-width column.
    var_slots: Vec<Option<usize>>,
    fixed_part_size: usize,
    var_size_cols: usize,
    key_columns: Vec<ColumnId>,
}

impl Schema {
    /// Build a schema from column definitions.
    ///
    /// Requires at least one column, unique names, and at least one
    /// primary-key column (rows are keyed by their primary key).
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if columns.is_empty() {
            return Err(Error::Schema("schema must have at least one column".into()));
        }

        let mut by_name = HashMap::with_capacity(columns.len());
        let mut fixed_offsets = Vec::with_capacity(columns.len());
        let mut var_slots = Vec::with_capacity(columns.len());
        let mut key_columns = Vec::new();
        let mut fixed_part_size = 0usize;
        let mut var_size_cols = 0usize;

        for (id, column) in columns.iter().enumerate() {
            if by_name.insert(column.name.clone(), id).is_some() {
                return Err(Error::Schema(format!("duplicate column: {}", column.name)));
            }
            match column.kind.fixed_width() {
                Some(width) => {
                    fixed_offsets.push(Some(fixed_part_size));
                    var_slots.push(None);
                    fixed_part_size += width;
                }
                None => {
                    fixed_offsets.push(None);
                    var_slots.push(Some(var_size_cols));
                    var_size_cols += 1;
                }
            }
            if column.primary_key {
                key_columns.push(id);
            }
        }

        if key_columns.is_empty() {
            return Err(Error::Schema(
                "schema must have at least one primary-key column".into(),
            ));
        }

        Ok(Self {
            columns,
            by_name,
            fixed_offsets,
            var_slots,
            fixed_part_size,
            var_size_cols,
            key_columns,
        })
    }

    pub fn columns_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, id: ColumnId) -> Result<&Column> {
        self.columns.get(id).ok_or(Error::ColumnIdOutOfRange(id))
    }

    pub fn column_id(&self, name: &str) -> Result<ColumnId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
    }

    /// Total byte size of the fixed part.
    pub fn fixed_part_size(&self) -> usize {
        self.fixed_part_size
    }

    /// Number of variable-width columns.
    pub fn var_size_cols(&self) -> usize {
        self.var_size_cols
    }

    /// Byte offset of a fixed-width column within the fixed part.
    pub fn fixed_offset(&self, id: ColumnId) -> Option<usize> {
        self.fixed_offsets.get(id).copied().flatten()
    }

    /// Slot of a variable-width column among the var columns.
    pub fn var_slot(&self, id: ColumnId) -> Option<usize> {
        self.var_slots.get(id).copied().flatten()
    }

    /// Primary-key column ids in declaration order.
    pub fn key_columns(&self) -> &[ColumnId] {
        &self.key_columns
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", column.name, column.kind)?;
            if column.primary_key {
                write!(f, " key")?;
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", ValueKind::I64).primary_key(),
            Column::new("bal", ValueKind::Double),
            Column::new("name", ValueKind::Str),
            Column::new("flags", ValueKind::I32),
        ])
        .unwrap()
    }

    #[test]
    fn test_layout_offsets() {
        let schema = account_schema();
        assert_eq!(schema.fixed_part_size(), 8 + 8 + 4);
        assert_eq!(schema.var_size_cols(), 1);
        assert_eq!(schema.fixed_offset(0), Some(0));
        assert_eq!(schema.fixed_offset(1), Some(8));
        assert_eq!(schema.fixed_offset(2), None);
        assert_eq!(schema.fixed_offset(3), Some(16));
        assert_eq!(schema.var_slot(2), Some(0));
        assert_eq!(schema.var_slot(0), None);
    }

    #[test]
    fn test_key_columns_in_order() {
        let schema = Schema::new(vec![
            Column::new("a", ValueKind::I32).primary_key(),
            Column::new("b", ValueKind::Str),
            Column::new("c", ValueKind::I64).primary_key(),
        ])
        .unwrap();
        assert_eq!(schema.key_columns(), &[0, 2]);
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let result = Schema::new(vec![
            Column::new("x", ValueKind::I32).primary_key(),
            Column::new("x", ValueKind::I64),
        ]);
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_missing_key_rejected() {
        let result = Schema::new(vec![Column::new("x", ValueKind::I32)]);
        assert!(matches!(result, Err(Error::Schema(_))));
    }

    #[test]
    fn test_column_lookup() {
        let schema = account_schema();
        assert_eq!(schema.column_id("bal").unwrap(), 1);
        assert!(matches!(
            schema.column_id("nope"),
            Err(Error::ColumnNotFound(_))
        ));
        assert!(matches!(
            schema.column(9),
            Err(Error::ColumnIdOutOfRange(9))
        ));
    }
}
