use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::value::ParamValue;

/// Name of the single table every ledger database holds.
pub const TABLE_NAME: &str = "log";
pub const ID_COLUMN: &str = "id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParamValue>,
}

impl ColumnDef {
    pub fn new(name: &str, column_type: &str) -> Self {
        Self {
            name: name.to_string(),
            column_type: column_type.to_uppercase(),
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<ParamValue>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// The declared default, treating an explicit null as absent.
    pub fn default_value(&self) -> Option<&ParamValue> {
        self.default.as_ref().filter(|v| !v.is_null())
    }
}

/// Ordered schema declaration for the `log` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(columns: Vec<ColumnDef>) -> Result<Self> {
        let mut def = Self { columns };
        def.normalize()?;
        Ok(def)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut def: TableDef = serde_yaml::from_str(raw)?;
        def.normalize()?;
        Ok(def)
    }

    /// Uppercases column types and rejects declarations that cannot be
    /// spliced into DDL.
    pub fn normalize(&mut self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(LedgerError::InvalidSchema(
                "at least one column must be declared".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for column in self.columns.iter_mut() {
            column.column_type = column.column_type.trim().to_uppercase();
            if !is_identifier(&column.name) {
                return Err(LedgerError::InvalidSchema(format!(
                    "column name `{}` is not a valid identifier",
                    column.name
                )));
            }
            if column.name.eq_ignore_ascii_case(ID_COLUMN) {
                return Err(LedgerError::InvalidSchema(
                    "column name `id` is reserved for the primary key".to_string(),
                ));
            }
            if !is_type_name(&column.column_type) {
                return Err(LedgerError::InvalidSchema(format!(
                    "column type `{}` of `{}` is not supported",
                    column.column_type, column.name
                )));
            }
            if !seen.insert(column.name.to_lowercase()) {
                return Err(LedgerError::InvalidSchema(format!(
                    "column `{}` is declared more than once",
                    column.name
                )));
            }
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn name_set(&self) -> BTreeSet<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn create_table_sql(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {}({} INTEGER PRIMARY KEY AUTOINCREMENT, ",
            TABLE_NAME, ID_COLUMN
        );
        for column in &self.columns {
            sql.push_str(&format!("{} {}, ", column.name, column.column_type));
        }
        sql.push_str(&format!("UNIQUE ({}))", self.column_names().join(", ")));
        sql
    }
}

/// Words that start a column constraint rather than continue a type name.
const CONSTRAINT_KEYWORDS: [&str; 12] = [
    "NOT",
    "NULL",
    "PRIMARY",
    "KEY",
    "UNIQUE",
    "CHECK",
    "DEFAULT",
    "COLLATE",
    "REFERENCES",
    "GENERATED",
    "AS",
    "CONSTRAINT",
];

/// A bare type name such as `REAL` or `DOUBLE PRECISION`. Expects the
/// uppercased form.
fn is_type_name(column_type: &str) -> bool {
    column_type.split_whitespace().all(|word| {
        is_identifier(word) && !CONSTRAINT_KEYWORDS.contains(&word)
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_yaml_uppercases_types_and_reads_defaults() {
        let def = TableDef::from_yaml(
            "columns:\n  - {name: lr, type: real}\n  - {name: batch_size, type: Integer}\n  - {name: version, type: integer, default: 0}\n",
        )
        .expect("table def");
        assert_eq!(def.column_names(), vec!["lr", "batch_size", "version"]);
        assert_eq!(def.columns[0].column_type, "REAL");
        assert_eq!(def.columns[1].column_type, "INTEGER");
        assert_eq!(
            def.column("version").and_then(|c| c.default_value()),
            Some(&ParamValue::Integer(0))
        );
        assert!(def.column("lr").and_then(|c| c.default_value()).is_none());
    }

    #[test]
    fn explicit_null_default_counts_as_absent() {
        let def = TableDef::from_yaml("columns:\n  - {name: tag, type: text, default: ~}\n")
            .expect("table def");
        assert!(def.columns[0].default_value().is_none());
    }

    #[test]
    fn boolean_default_is_stored_as_integer() {
        let def = TableDef::from_yaml("columns:\n  - {name: warmup, type: integer, default: true}\n")
            .expect("table def");
        assert_eq!(def.columns[0].default_value(), Some(&ParamValue::Integer(1)));
    }

    #[test]
    fn normalize_rejects_duplicate_reserved_and_unsafe_names() {
        let dup = TableDef::new(vec![ColumnDef::new("lr", "real"), ColumnDef::new("lr", "real")]);
        assert!(matches!(dup, Err(LedgerError::InvalidSchema(_))));

        let reserved = TableDef::new(vec![ColumnDef::new("ID", "integer")]);
        assert!(matches!(reserved, Err(LedgerError::InvalidSchema(_))));

        let unsafe_name = TableDef::new(vec![ColumnDef::new("lr; DROP TABLE log", "real")]);
        assert!(matches!(unsafe_name, Err(LedgerError::InvalidSchema(_))));

        let empty = TableDef::new(vec![]);
        assert!(matches!(empty, Err(LedgerError::InvalidSchema(_))));
    }

    #[test]
    fn normalize_rejects_constraints_in_column_types() {
        for column_type in ["integer not null", "integer unique", "real default 0", "text collate nocase"] {
            let def = TableDef::new(vec![ColumnDef::new("lr", column_type)]);
            assert!(
                matches!(def, Err(LedgerError::InvalidSchema(_))),
                "`{}` must be rejected",
                column_type
            );
        }
        let def = TableDef::new(vec![ColumnDef::new("lr", "double precision")]).expect("table def");
        assert_eq!(def.columns[0].column_type, "DOUBLE PRECISION");
    }

    #[test]
    fn create_table_sql_adds_composite_unique_constraint() {
        let def = TableDef::new(vec![
            ColumnDef::new("lr", "real"),
            ColumnDef::new("batch_size", "integer"),
        ])
        .expect("table def");
        assert_eq!(
            def.create_table_sql(),
            "CREATE TABLE IF NOT EXISTS log(id INTEGER PRIMARY KEY AUTOINCREMENT, lr REAL, batch_size INTEGER, UNIQUE (lr, batch_size))"
        );
    }
}
