use std::path::Path;

use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use crate::error::{LedgerError, Result};
use crate::reconciler::ReconciledTable;
use crate::schema::{TableDef, ID_COLUMN, TABLE_NAME};
use crate::value::{ParamValue, Params};

/// Outcome of [`IdentityManager::insert_or_get_existing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Inserted(i64),
    /// The tuple was already stored; nothing was written.
    Existing(i64),
}

impl Allocation {
    pub fn id(self) -> i64 {
        match self {
            Allocation::Inserted(id) | Allocation::Existing(id) => id,
        }
    }
}

/// Maps parameter tuples to stable row ids in a reconciled `log` table.
pub struct IdentityManager {
    table: ReconciledTable,
    insert_sql: String,
    select_sql: String,
}

impl IdentityManager {
    pub fn new(table: ReconciledTable) -> Self {
        let names = table.table_def.column_names();
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            TABLE_NAME,
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        );
        let conditions: Vec<String> = names.iter().map(|name| format!("{} = ?", name)).collect();
        let select_sql = format!(
            "SELECT {} FROM {} WHERE {}",
            ID_COLUMN,
            TABLE_NAME,
            conditions.join(" AND ")
        );
        Self {
            table,
            insert_sql,
            select_sql,
        }
    }

    pub fn table_def(&self) -> &TableDef {
        &self.table.table_def
    }

    pub fn db_path(&self) -> &Path {
        &self.table.db_path
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.table.conn
    }

    pub fn get_id(&self, params: &Params) -> Result<i64> {
        self.insert_or_get_existing(params).map(Allocation::id)
    }

    /// Looks up the tuple and inserts it only when no identical row is
    /// stored. A stored tuple is the `Existing` branch, not an error, and
    /// never advances the AUTOINCREMENT sequence. Keys in `params` that are
    /// not declared columns are ignored.
    pub fn insert_or_get_existing(&self, params: &Params) -> Result<Allocation> {
        let values = self.declared_values(params)?;
        let tx = self.table.conn.unchecked_transaction()?;
        let allocation = match self.matching_ids(&tx, &values)?.as_slice() {
            [] => {
                tx.execute(&self.insert_sql, params_from_iter(values.iter().copied()))?;
                match self.matching_ids(&tx, &values)?.as_slice() {
                    [id] => Allocation::Inserted(*id),
                    ids => {
                        return Err(LedgerError::IdentityCardinalityViolation {
                            matches: ids.len(),
                        })
                    }
                }
            }
            [id] => Allocation::Existing(*id),
            ids => {
                return Err(LedgerError::IdentityCardinalityViolation {
                    matches: ids.len(),
                })
            }
        };
        tx.commit()?;
        debug!(?allocation, "resolved parameter tuple");
        Ok(allocation)
    }

    fn matching_ids(&self, conn: &Connection, values: &[&ParamValue]) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare_cached(&self.select_sql)?;
        let ids = stmt
            .query_map(params_from_iter(values.iter().copied()), |row| {
                row.get::<_, i64>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn row_count(&self) -> Result<i64> {
        Ok(self.table.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", TABLE_NAME),
            [],
            |row| row.get(0),
        )?)
    }

    fn declared_values<'p>(&self, params: &'p Params) -> Result<Vec<&'p ParamValue>> {
        let mut missing: Vec<String> = self
            .table
            .table_def
            .columns
            .iter()
            .filter(|c| !params.contains_key(&c.name))
            .map(|c| c.name.clone())
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(LedgerError::MissingColumns { missing });
        }
        self.table
            .table_def
            .columns
            .iter()
            .map(|c| match params.get(&c.name) {
                Some(value) if !value.is_null() => Ok(value),
                _ => Err(LedgerError::NullParameter {
                    column: c.name.clone(),
                }),
            })
            .collect()
    }
}
