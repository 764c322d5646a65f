//! Ordered, uniquely-named row schemas flowing between operators.

use arrow_schema::{DataType, Field, Schema};
use serde::{Deserialize, Serialize};
use svq_common::{Result, SvqError};

/// One typed column slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name, unique within its schema.
    pub name: String,
    /// Value type.
    pub data_type: DataType,
    /// Declared length (string width, integer digits), if known.
    #[serde(default)]
    pub length: Option<u32>,
    /// Declared precision (fraction digits), if known.
    #[serde(default)]
    pub precision: Option<u32>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            length: None,
            precision: None,
        }
    }

    pub fn with_length(mut self, length: u32, precision: Option<u32>) -> Self {
        self.length = Some(length);
        self.precision = precision;
        self
    }

    /// Same slot under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

/// Ordered list of uniquely-named columns. Insertion order is significant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSchema {
    columns: Vec<ColumnDef>,
}

impl RowSchema {
    /// Build a schema, rejecting duplicate column names.
    pub fn new(columns: Vec<ColumnDef>) -> Result<Self> {
        let mut schema = Self::empty();
        for c in columns {
            schema.push(c)?;
        }
        Ok(schema)
    }

    pub fn empty() -> Self {
        Self { columns: vec![] }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, index: usize) -> Option<&ColumnDef> {
        self.columns.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Resolve a column name or fail with a binding error.
    pub fn resolve(&self, name: &str) -> Result<usize> {
        self.index_of(name).ok_or_else(|| {
            SvqError::Binding(format!(
                "unknown field '{name}' (available: {})",
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn push(&mut self, column: ColumnDef) -> Result<()> {
        if self.contains(&column.name) {
            return Err(SvqError::PlanConstruction(format!(
                "duplicate field '{}' in row schema",
                column.name
            )));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Copy of this schema with `column` appended.
    pub fn with_column(&self, column: ColumnDef) -> Result<Self> {
        let mut out = self.clone();
        out.push(column)?;
        Ok(out)
    }

    pub fn to_arrow(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|c| Field::new(&c.name, c.data_type.clone(), true))
                .collect::<Vec<_>>(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_names() {
        let err = RowSchema::new(vec![
            ColumnDef::new("a", DataType::Int64),
            ColumnDef::new("a", DataType::Utf8),
        ])
        .expect_err("duplicate");
        assert!(matches!(err, SvqError::PlanConstruction(_)));
    }

    #[test]
    fn preserves_insertion_order_in_arrow_schema() {
        let schema = RowSchema::new(vec![
            ColumnDef::new("z", DataType::Utf8).with_length(20, None),
            ColumnDef::new("a", DataType::Float64).with_length(9, Some(2)),
        ])
        .expect("schema");
        let arrow = schema.to_arrow();
        assert_eq!(arrow.field(0).name(), "z");
        assert_eq!(arrow.field(1).name(), "a");
        assert_eq!(schema.resolve("a").expect("a"), 1);
        assert!(matches!(schema.resolve("b"), Err(SvqError::Binding(_))));
    }
}
