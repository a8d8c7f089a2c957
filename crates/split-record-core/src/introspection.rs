use std::collections::BTreeSet;

use crate::error::MtiError;
use crate::model::ModelType;
use crate::storage::SchemaSource;

/// Content fields of `table`: every column except the primary key, foreign
/// keys (`*_id`), and type discriminators (`type`, or `x_type` next to an
/// `x_id`). Returns `None` when the table does not exist.
///
/// # Errors
/// Returns an error when the schema catalog cannot be read.
pub fn content_fields(
    schema: &dyn SchemaSource,
    table: &str,
) -> Result<Option<Vec<String>>, MtiError> {
    if !schema.table_exists(table)? {
        return Ok(None);
    }

    let columns = schema.columns(table)?;
    let names = columns
        .iter()
        .map(|column| column.name.as_str())
        .collect::<BTreeSet<_>>();
    let fields = columns
        .iter()
        .filter(|column| !column.primary_key)
        .filter(|column| !column.name.ends_with("_id"))
        .filter(|column| !is_type_discriminator(&column.name, &names))
        .map(|column| column.name.clone())
        .collect();

    Ok(Some(fields))
}

fn is_type_discriminator(name: &str, names: &BTreeSet<&str>) -> bool {
    if name == "type" {
        return true;
    }
    name.strip_suffix("_type")
        .is_some_and(|stem| names.contains(format!("{stem}_id").as_str()))
}

/// Relation names declared on `model`, minus `except`.
#[must_use]
pub fn relation_names(model: &ModelType, except: &str) -> Vec<String> {
    model
        .relations()
        .keys()
        .filter(|name| name.as_str() != except)
        .cloned()
        .collect()
}
