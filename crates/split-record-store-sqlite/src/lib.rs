use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use split_record_core::{Column, FieldValue, RecordId, Row, SchemaSource, Storage};

mod options;

pub use options::{JournalMode, StoreOptions};

/// [`Storage`] over a single SQLite connection.
///
/// Every table used through it needs a single-column integer primary key;
/// tables without one are addressed by `rowid`.
pub struct SqliteStore {
    conn: Connection,
    primary_keys: BTreeMap<String, String>,
}

impl SqliteStore {
    /// Open a SQLite-backed store with the default runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(&StoreOptions::at(path))
    }

    /// Open a SQLite-backed store and apply `options`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with(options: &StoreOptions) -> Result<Self> {
        let conn = Connection::open(&options.path).with_context(|| {
            format!("failed to open sqlite database at {}", options.path.display())
        })?;

        conn.execute_batch(&options.pragmas())
            .context("failed to configure sqlite pragmas")?;

        tracing::debug!(
            path = %options.path.display(),
            journal_mode = options.journal_mode.as_sql(),
            "opened sqlite store"
        );
        Ok(Self {
            conn,
            primary_keys: BTreeMap::new(),
        })
    }

    /// Run schema statements. Cached table metadata is dropped afterwards.
    ///
    /// # Errors
    /// Returns an error when any statement fails.
    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .context("failed to execute sql batch")?;
        self.primary_keys.clear();
        Ok(())
    }

    fn primary_key(&mut self, table: &str) -> Result<String> {
        if let Some(column) = self.primary_keys.get(table) {
            return Ok(column.clone());
        }
        if !table_exists(&self.conn, table)? {
            bail!("no such table: {table}");
        }

        let keys = self
            .columns(table)?
            .into_iter()
            .filter(|column| column.primary_key)
            .map(|column| column.name)
            .collect::<Vec<_>>();
        let column = match keys.as_slice() {
            [single] => single.clone(),
            _ => "rowid".to_string(),
        };
        self.primary_keys.insert(table.to_string(), column.clone());
        Ok(column)
    }

    fn query_rows(
        &self,
        table: &str,
        primary_key: &str,
        sql: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Row>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("failed to prepare select on {table}"))?;
        let names = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let mut rows = stmt
            .query(params_from_iter(args))
            .with_context(|| format!("failed to query {table}"))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Row::default();
            for (index, name) in names.iter().enumerate() {
                let value = from_sql(row.get::<_, Value>(index)?)
                    .with_context(|| format!("failed to decode {table}.{name}"))?;
                if name == primary_key || (primary_key == "rowid" && name == "__rowid") {
                    record.id = value.as_record_id();
                } else {
                    record.values.insert(name.clone(), value);
                }
            }
            out.push(record);
        }
        Ok(out)
    }

    fn projection(primary_key: &str) -> String {
        if primary_key == "rowid" {
            "rowid AS __rowid, *".to_string()
        } else {
            "*".to_string()
        }
    }
}

impl SchemaSource for SqliteStore {
    fn table_exists(&self, table: &str) -> Result<bool> {
        table_exists(&self.conn, table)
    }

    fn columns(&self, table: &str) -> Result<Vec<Column>> {
        if !table_exists(&self.conn, table)? {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote(table)))
            .with_context(|| format!("failed to inspect table_info for {table}"))?;
        let mut rows = stmt.query([])?;

        let mut columns = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            let pk: i64 = row.get(5)?;
            columns.push(Column {
                name,
                primary_key: pk > 0,
            });
        }
        Ok(columns)
    }
}

impl Storage for SqliteStore {
    fn select(&mut self, table: &str, filters: &[(String, FieldValue)]) -> Result<Vec<Row>> {
        let primary_key = self.primary_key(table)?;
        let clauses = filters
            .iter()
            .enumerate()
            .map(|(index, (column, _))| format!("{} IS ?{}", quote(column), index + 1))
            .collect::<Vec<_>>();
        let condition = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM {}{condition} ORDER BY {}",
            Self::projection(&primary_key),
            quote(table),
            quote(&primary_key)
        );

        let args = filters.iter().map(|(_, value)| to_sql(value)).collect();
        self.query_rows(table, &primary_key, &sql, args)
    }

    fn select_ids(&mut self, table: &str, ids: &[RecordId]) -> Result<Vec<Row>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let primary_key = self.primary_key(table)?;
        let placeholders = (1..=ids.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {} IN ({placeholders}) ORDER BY {}",
            Self::projection(&primary_key),
            quote(table),
            quote(&primary_key),
            quote(&primary_key)
        );

        let args = ids.iter().map(|id| Value::Integer(id.0)).collect();
        self.query_rows(table, &primary_key, &sql, args)
    }

    fn insert(&mut self, table: &str, values: &BTreeMap<String, FieldValue>) -> Result<RecordId> {
        let sql = if values.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote(table))
        } else {
            let columns = values
                .keys()
                .map(|column| quote(column))
                .collect::<Vec<_>>();
            let placeholders = (1..=values.len())
                .map(|index| format!("?{index}"))
                .collect::<Vec<_>>();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(table),
                columns.join(", "),
                placeholders.join(", ")
            )
        };

        self.conn
            .execute(&sql, params_from_iter(values.values().map(to_sql)))
            .with_context(|| format!("failed to insert into {table}"))?;
        Ok(RecordId(self.conn.last_insert_rowid()))
    }

    fn update(
        &mut self,
        table: &str,
        id: RecordId,
        values: &BTreeMap<String, FieldValue>,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let primary_key = self.primary_key(table)?;
        let assignments = values
            .keys()
            .enumerate()
            .map(|(index, column)| format!("{} = ?{}", quote(column), index + 1))
            .collect::<Vec<_>>();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote(table),
            assignments.join(", "),
            quote(&primary_key),
            values.len() + 1
        );

        let args = values
            .values()
            .map(to_sql)
            .chain(std::iter::once(Value::Integer(id.0)));
        let changed = self
            .conn
            .execute(&sql, params_from_iter(args))
            .with_context(|| format!("failed to update {table} row {id}"))?;
        if changed == 0 {
            return Err(anyhow!("no row {id} in {table}"));
        }
        Ok(())
    }

    fn delete(&mut self, table: &str, id: RecordId) -> Result<()> {
        let primary_key = self.primary_key(table)?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote(table),
            quote(&primary_key)
        );
        self.conn
            .execute(&sql, params![id.0])
            .with_context(|| format!("failed to delete {table} row {id}"))?;
        Ok(())
    }

    fn savepoint(&mut self, name: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("SAVEPOINT {}", quote(name)))
            .with_context(|| format!("failed to open savepoint {name}"))
    }

    fn release(&mut self, name: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT {}", quote(name)))
            .with_context(|| format!("failed to release savepoint {name}"))
    }

    fn rollback_to(&mut self, name: &str) -> Result<()> {
        let name = quote(name);
        self.conn
            .execute_batch(&format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};"))
            .with_context(|| format!("failed to roll back to savepoint {name}"))
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn to_sql(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(flag) => Value::Integer(i64::from(*flag)),
        FieldValue::Integer(number) => Value::Integer(*number),
        FieldValue::Real(number) => Value::Real(*number),
        FieldValue::Text(text) => Value::Text(text.clone()),
    }
}

fn from_sql(value: Value) -> Result<FieldValue> {
    Ok(match value {
        Value::Null => FieldValue::Null,
        Value::Integer(number) => FieldValue::Integer(number),
        Value::Real(number) => FieldValue::Real(number),
        Value::Text(text) => FieldValue::Text(text),
        Value::Blob(_) => bail!("blob columns are not supported"),
    })
}
