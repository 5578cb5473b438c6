use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, Result};
use crate::migration::{self, MigrationReport, RowMapper};
use crate::schema::{TableDef, ID_COLUMN, TABLE_NAME};

/// One row of `PRAGMA table_info(log)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredColumn {
    pub cid: i64,
    pub name: String,
    pub column_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// Owns the connection to the ledger file until the stored table has been
/// reconciled with the declaration.
pub struct TableReconciler {
    conn: Connection,
    db_path: PathBuf,
    table_def: TableDef,
}

/// A table whose column names and types match the declaration. Only
/// [`TableReconciler::check_schema`] hands these out.
pub struct ReconciledTable {
    pub(crate) conn: Connection,
    pub(crate) db_path: PathBuf,
    pub(crate) table_def: TableDef,
}

pub enum SchemaCheck {
    Current(ReconciledTable),
    OutOfDate {
        stored: Vec<String>,
        declared: Vec<String>,
    },
    /// The file at `db_path` now holds the migrated table. The old handle
    /// was closed; reopen before touching the table again.
    Migrated(MigrationReport),
}

impl SchemaCheck {
    pub fn is_up_to_date(&self) -> bool {
        !matches!(self, SchemaCheck::OutOfDate { .. })
    }
}

impl TableReconciler {
    pub fn open(db_path: &Path, table_def: TableDef) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        Ok(Self {
            conn,
            db_path: db_path.to_path_buf(),
            table_def,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn table_def(&self) -> &TableDef {
        &self.table_def
    }

    pub fn ensure_table_exists(&self) -> Result<()> {
        let sql = self.table_def.create_table_sql();
        debug!(sql = %sql, "ensuring table exists");
        self.conn.execute(&sql, [])?;
        Ok(())
    }

    pub fn table_info(&self) -> Result<Vec<StoredColumn>> {
        table_info(&self.conn)
    }

    pub fn check_schema(self, auto_migrate: bool) -> Result<SchemaCheck> {
        self.check_schema_with(auto_migrate, None)
    }

    /// Compares the stored columns with the declaration. On drift with
    /// `auto_migrate` set, `mapper` (or the default-value mapper) rewrites
    /// every row into a freshly created table.
    pub fn check_schema_with(
        self,
        auto_migrate: bool,
        mapper: Option<&RowMapper<'_>>,
    ) -> Result<SchemaCheck> {
        let stored = stored_column_types(&self.conn)?;
        let stored_names: BTreeSet<String> = stored.keys().cloned().collect();
        let declared_names = self.table_def.name_set();

        if stored_names == declared_names {
            check_column_types(&self.table_def, &stored)?;
            return Ok(SchemaCheck::Current(ReconciledTable {
                conn: self.conn,
                db_path: self.db_path,
                table_def: self.table_def,
            }));
        }

        warn!(
            db = ?stored_names,
            table_def = ?declared_names,
            "found different columns between db and table_def"
        );
        if !auto_migrate {
            return Ok(SchemaCheck::OutOfDate {
                stored: stored_names.into_iter().collect(),
                declared: declared_names.into_iter().collect(),
            });
        }

        info!(db = %self.db_path.display(), "migrating table to the declared schema");
        let report = migration::migrate(self.conn, &self.db_path, &self.table_def, &stored, mapper)?;
        Ok(SchemaCheck::Migrated(report))
    }
}

impl ReconciledTable {
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn table_def(&self) -> &TableDef {
        &self.table_def
    }

    pub fn table_info(&self) -> Result<Vec<StoredColumn>> {
        table_info(&self.conn)
    }
}

pub(crate) fn table_info(conn: &Connection) -> Result<Vec<StoredColumn>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", TABLE_NAME))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(StoredColumn {
                cid: row.get(0)?,
                name: row.get(1)?,
                column_type: row.get(2)?,
                not_null: row.get(3)?,
                default_value: row.get(4)?,
                primary_key: row.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Stored column name → uppercased type, without `id`.
pub(crate) fn stored_column_types(conn: &Connection) -> Result<BTreeMap<String, String>> {
    Ok(table_info(conn)?
        .into_iter()
        .filter(|c| c.name != ID_COLUMN)
        .map(|c| (c.name, c.column_type.to_uppercase()))
        .collect())
}

/// Every declared column that is also stored must keep its type.
pub(crate) fn check_column_types(
    table_def: &TableDef,
    stored: &BTreeMap<String, String>,
) -> Result<()> {
    for column in &table_def.columns {
        if let Some(stored_type) = stored.get(&column.name) {
            if *stored_type != column.column_type {
                return Err(LedgerError::SchemaTypeConflict {
                    column: column.name.clone(),
                    stored: stored_type.clone(),
                    declared: column.column_type.clone(),
                });
            }
        }
    }
    Ok(())
}
