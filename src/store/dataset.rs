//! In-memory columnar dataset: the data collaborator consumed by the core.
//!
//! Numeric columns store `NaN` for missing values. Key columns store integer
//! identifiers (`None` = NA) and are the only columns usable for joins.

use crate::error::{EngineError, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<f64>),
    Key(Vec<Option<i64>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Key(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    name: String,
    column_names: Vec<String>,
    columns: Vec<Column>,
    rows: usize,
    primary_key: Option<usize>,
    key_rows: HashMap<i64, usize>,
    weight: Option<usize>,
    frequency: Option<usize>,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn num_rows(&self) -> usize { self.rows }
    pub fn num_columns(&self) -> usize { self.columns.len() }
    pub fn column_name(&self, col: usize) -> &str { &self.column_names[col] }

    /// Appends a column. The first column fixes the row count.
    pub fn push_column(&mut self, name: impl Into<String>, column: Column) -> Result<usize> {
        let name = name.into();
        if self.columns.is_empty() {
            self.rows = column.len();
        } else if column.len() != self.rows {
            return Err(EngineError::RaggedColumn {
                dataset: self.name.clone(),
                column: name,
                expected: self.rows,
                actual: column.len(),
            });
        }
        self.column_names.push(name);
        self.columns.push(column);
        Ok(self.columns.len() - 1)
    }

    pub fn with_numeric(mut self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        self.push_column(name, Column::Numeric(values))?;
        Ok(self)
    }

    pub fn with_key(mut self, name: impl Into<String>, values: Vec<Option<i64>>) -> Result<Self> {
        self.push_column(name, Column::Key(values))?;
        Ok(self)
    }

    /// Declares `column` as the primary key and builds the key index.
    pub fn with_primary_key(mut self, column: &str) -> Result<Self> {
        let col = self.column_index(column)?;
        let keys = match &self.columns[col] {
            Column::Key(k) => k,
            Column::Numeric(_) => {
                return Err(EngineError::InvalidPrimaryKey {
                    dataset: self.name.clone(),
                    column: column.to_string(),
                })
            }
        };
        let mut index = HashMap::with_capacity(keys.len());
        for (row, key) in keys.iter().enumerate() {
            let key = key.ok_or_else(|| EngineError::InvalidPrimaryKey {
                dataset: self.name.clone(),
                column: column.to_string(),
            })?;
            if index.insert(key, row).is_some() {
                return Err(EngineError::DuplicatePrimaryKey { dataset: self.name.clone(), key });
            }
        }
        self.primary_key = Some(col);
        self.key_rows = index;
        Ok(self)
    }

    pub fn with_weight(mut self, column: &str) -> Result<Self> {
        self.weight = Some(self.column_index(column)?);
        Ok(self)
    }

    pub fn with_frequency(mut self, column: &str) -> Result<Self> {
        self.frequency = Some(self.column_index(column)?);
        Ok(self)
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.column_names
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| EngineError::UnknownColumn { dataset: self.name.clone(), column: name.to_string() })
    }

    pub fn has_primary_key(&self) -> bool { self.primary_key.is_some() }
    pub fn has_weights(&self) -> bool { self.weight.is_some() }
    pub fn has_frequencies(&self) -> bool { self.frequency.is_some() }

    pub fn is_key_column(&self, col: usize) -> bool {
        matches!(self.columns.get(col), Some(Column::Key(_)))
    }

    pub fn lookup_row_of_key(&self, key: i64) -> Result<usize> {
        self.key_rows
            .get(&key)
            .copied()
            .ok_or_else(|| EngineError::KeyNotFound { dataset: self.name.clone(), key })
    }

    /// Foreign-key value of a key column; `None` for NA.
    #[inline]
    pub fn key_element(&self, row: usize, col: usize) -> Option<i64> {
        match &self.columns[col] {
            Column::Key(k) => k[row],
            Column::Numeric(v) => {
                let val = v[row];
                if val.is_finite() { Some(val as i64) } else { None }
            }
        }
    }

    /// Value of any column as a float; missing values are `NaN`.
    #[inline]
    pub fn column_value(&self, row: usize, col: usize) -> f64 {
        match &self.columns[col] {
            Column::Numeric(v) => v[row],
            Column::Key(k) => k[row].map_or(f64::NAN, |x| x as f64),
        }
    }
}
