use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::value::{FieldValue, RecordId, Row};

/// One declared column of a stored table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub primary_key: bool,
}

/// Read-only schema metadata used while declaring model types.
pub trait SchemaSource {
    /// # Errors
    /// Returns an error when the schema catalog cannot be read.
    fn table_exists(&self, table: &str) -> Result<bool>;

    /// Declared columns in table order. Empty for a missing table.
    ///
    /// # Errors
    /// Returns an error when the schema catalog cannot be read.
    fn columns(&self, table: &str) -> Result<Vec<Column>>;
}

/// Row-level persistence consumed by [`crate::Session`].
///
/// Filters are equality conjunctions; a `FieldValue::Null` filter matches
/// NULL. Results are ordered by primary key.
pub trait Storage: SchemaSource {
    /// # Errors
    /// Returns an error when the query fails or a value cannot be decoded.
    fn select(&mut self, table: &str, filters: &[(String, FieldValue)]) -> Result<Vec<Row>>;

    /// # Errors
    /// Returns an error when the query fails or a value cannot be decoded.
    fn select_ids(&mut self, table: &str, ids: &[RecordId]) -> Result<Vec<Row>>;

    /// # Errors
    /// Returns an error when the insert is rejected.
    fn insert(&mut self, table: &str, values: &BTreeMap<String, FieldValue>) -> Result<RecordId>;

    /// # Errors
    /// Returns an error when the update is rejected or matches no row.
    fn update(
        &mut self,
        table: &str,
        id: RecordId,
        values: &BTreeMap<String, FieldValue>,
    ) -> Result<()>;

    /// # Errors
    /// Returns an error when the delete is rejected.
    fn delete(&mut self, table: &str, id: RecordId) -> Result<()>;

    /// # Errors
    /// Returns an error when the savepoint cannot be opened.
    fn savepoint(&mut self, name: &str) -> Result<()>;

    /// # Errors
    /// Returns an error when the savepoint cannot be released.
    fn release(&mut self, name: &str) -> Result<()>;

    /// Roll back to and release `name`.
    ///
    /// # Errors
    /// Returns an error when the rollback fails.
    fn rollback_to(&mut self, name: &str) -> Result<()>;
}
