//! Core types shared by the tabledb crates: column types, values, table and
//! index schemas, and the row/key codecs in [`encoding`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod encoding;

pub use encoding::{decode_key, decode_row, encode_key, encode_row};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Table '{table}' expects {expected} values, got {actual}")]
    ArityMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("Type mismatch for column '{column}': expected {expected}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: String,
    },

    #[error("Column '{0}' cannot be null")]
    NullViolation(String),

    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    #[error("Table '{0}' has no primary key")]
    NoPrimaryKey(String),

    #[error("Malformed encoded row: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// A row is positional: one value per column of its table schema.
pub type Row = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Integer,
    BigInt,
    DoublePrecision,
    Text,
    Binary,
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Integer | DataType::BigInt | DataType::DoublePrecision
        )
    }

    pub fn is_string(&self) -> bool {
        matches!(self, DataType::Text)
    }

    pub fn size_hint(&self) -> Option<usize> {
        match self {
            DataType::Boolean => Some(1),
            DataType::Integer => Some(4),
            DataType::BigInt => Some(8),
            DataType::DoublePrecision => Some(8),
            DataType::Text | DataType::Binary => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Integer => write!(f, "INTEGER"),
            DataType::BigInt => write!(f, "BIGINT"),
            DataType::DoublePrecision => write!(f, "DOUBLE PRECISION"),
            DataType::Text => write!(f, "TEXT"),
            DataType::Binary => write!(f, "BINARY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i32),
    BigInt(i64),
    DoublePrecision(f64),
    Text(String),
    Binary(Vec<u8>),
}

impl Value {
    /// `None` for NULL, which is compatible with every column type.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Integer(_) => Some(DataType::Integer),
            Value::BigInt(_) => Some(DataType::BigInt),
            Value::DoublePrecision(_) => Some(DataType::DoublePrecision),
            Value::Text(_) => Some(DataType::Text),
            Value::Binary(_) => Some(DataType::Binary),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_compatible(&self, data_type: &DataType) -> bool {
        match self.data_type() {
            None => true,
            Some(actual) => actual == *data_type,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i as i64),
            Value::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Approximate in-memory footprint, used for memory accounting.
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::Text(s) => s.len() + 8,
            Value::Binary(b) => b.len() + 8,
            other => other
                .data_type()
                .and_then(|t| t.size_hint())
                .unwrap_or(1),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::BigInt(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::BigInt(i) => write!(f, "{}", i),
            Value::DoublePrecision(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Binary(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub indexes: Vec<IndexDefinition>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn add_column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn add_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|col| col.name == name)
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|col| col.name == name)
            .ok_or_else(|| CoreError::UnknownColumn(name.to_string()))
    }

    pub fn primary_key_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, col)| col.primary_key)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn value<'a>(&self, row: &'a Row, column: &str) -> Result<&'a Value> {
        let idx = self.column_index(column)?;
        row.get(idx)
            .ok_or_else(|| CoreError::UnknownColumn(column.to_string()))
    }

    /// Checks arity, nullability and column types; also makes sure the table
    /// declares a primary key at all.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if self.primary_key_indices().is_empty() {
            return Err(CoreError::NoPrimaryKey(self.name.clone()));
        }
        if row.len() != self.columns.len() {
            return Err(CoreError::ArityMismatch {
                table: self.name.clone(),
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        for (column, value) in self.columns.iter().zip(row) {
            if value.is_null() {
                if !column.nullable {
                    return Err(CoreError::NullViolation(column.name.clone()));
                }
                continue;
            }
            if !value.type_compatible(&column.data_type) {
                return Err(CoreError::TypeMismatch {
                    column: column.name.clone(),
                    expected: column.data_type,
                    actual: value
                        .data_type()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "NULL".to_string()),
                });
            }
        }
        Ok(())
    }

    /// The primary-key values of `row`, in column order.
    pub fn primary_key_values(&self, row: &Row) -> Vec<Value> {
        self.primary_key_indices()
            .into_iter()
            .filter_map(|i| row.get(i).cloned())
            .collect()
    }

    /// Encoded primary key of `row`.
    pub fn primary_key(&self, row: &Row) -> Vec<u8> {
        encode_key(&self.primary_key_values(row))
    }

    /// Positions of an index's columns within the row.
    pub fn index_column_indices(&self, index: &IndexDefinition) -> Result<Vec<usize>> {
        index
            .columns
            .iter()
            .map(|c| self.column_index(c))
            .collect()
    }
}
