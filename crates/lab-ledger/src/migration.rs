//! Single-column-addition migration.
//!
//! The live file is never altered in place. Every row is copied through a
//! [`RowMapper`] into a fresh `log` table at `<db>.new`, the copy is
//! committed while the old connection is rolled back, and the two files are
//! swapped by rename (`<db>` becomes `<db>.old`).

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{LedgerError, Result};
use crate::reconciler::{check_column_types, table_info};
use crate::schema::{ColumnDef, TableDef, ID_COLUMN, TABLE_NAME};
use crate::value::ParamValue;

const SAMPLE_SIZE: usize = 10;

/// Column name → value for one stored row, `id` included.
pub type Row = BTreeMap<String, ParamValue>;

/// Rewrites a row of the old table into a row of the new table. Returning
/// `None` drops the row.
pub type RowMapper<'a> = dyn Fn(Row) -> Result<Option<Row>> + 'a;

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub added_column: String,
    pub copied: usize,
    pub dropped: usize,
    /// Rows whose re-select did not return exactly their own id.
    pub mismatches: usize,
    pub sample_columns: Vec<String>,
    pub sample: Vec<Vec<ParamValue>>,
    pub db_path: PathBuf,
    pub backup_path: PathBuf,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CopyStats {
    copied: usize,
    dropped: usize,
    mismatches: usize,
    sample: Vec<Vec<ParamValue>>,
}

pub fn new_db_path(db_path: &Path) -> PathBuf {
    with_suffix(db_path, ".new")
}

pub fn backup_db_path(db_path: &Path) -> PathBuf {
    with_suffix(db_path, ".old")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

pub(crate) fn migrate(
    old_conn: Connection,
    db_path: &Path,
    table_def: &TableDef,
    stored: &BTreeMap<String, String>,
    mapper: Option<&RowMapper<'_>>,
) -> Result<MigrationReport> {
    let declared = table_def.name_set();
    let stored_names: BTreeSet<String> = stored.keys().cloned().collect();
    let added: Vec<String> = declared.difference(&stored_names).cloned().collect();
    let removed: Vec<String> = stored_names.difference(&declared).cloned().collect();
    if added.len() != 1 || !removed.is_empty() {
        return Err(LedgerError::UnsupportedMigration { added, removed });
    }
    check_column_types(table_def, stored)?;

    let new_column = table_def
        .column(&added[0])
        .ok_or_else(|| LedgerError::InvalidSchema(format!("column `{}` not found", added[0])))?;
    let default_mapper: Box<RowMapper<'static>>;
    let mapper: &RowMapper<'_> = match mapper {
        Some(mapper) => mapper,
        None => {
            default_mapper = default_row_mapper(new_column)?;
            &*default_mapper
        }
    };

    let new_path = new_db_path(db_path);
    if new_path.exists() {
        fs::remove_file(&new_path)?;
    }
    let sample_columns = vec![ID_COLUMN.to_string(), new_column.name.clone()];
    let stats = match copy_into(&old_conn, &new_path, table_def, &sample_columns, mapper) {
        Ok(stats) => stats,
        Err(e) => {
            discard(&new_path);
            return Err(LedgerError::MigrationFailed {
                path: db_path.to_path_buf(),
                source: Box::new(e),
            });
        }
    };
    drop(old_conn);

    let backup_path = backup_db_path(db_path);
    swap_files(db_path, &new_path, &backup_path).map_err(|e| LedgerError::MigrationFailed {
        path: db_path.to_path_buf(),
        source: Box::new(e),
    })?;
    info!(
        db = %db_path.display(),
        backup = %backup_path.display(),
        copied = stats.copied,
        dropped = stats.dropped,
        mismatches = stats.mismatches,
        "schema update done"
    );

    Ok(MigrationReport {
        added_column: new_column.name.clone(),
        copied: stats.copied,
        dropped: stats.dropped,
        mismatches: stats.mismatches,
        sample_columns,
        sample: stats.sample,
        db_path: db_path.to_path_buf(),
        backup_path,
        completed_at: Utc::now(),
    })
}

fn default_row_mapper(column: &ColumnDef) -> Result<Box<RowMapper<'static>>> {
    let default = column
        .default_value()
        .cloned()
        .ok_or_else(|| LedgerError::MissingDefault {
            column: column.name.clone(),
        })?;
    let name = column.name.clone();
    Ok(Box::new(move |mut row: Row| {
        row.insert(name.clone(), default.clone());
        Ok(Some(row))
    }))
}

/// Creates the new table, copies the rows and settles both transactions:
/// the old one is always rolled back, the new one committed only if every
/// step succeeded.
fn copy_into(
    old_conn: &Connection,
    new_path: &Path,
    table_def: &TableDef,
    sample_columns: &[String],
    mapper: &RowMapper<'_>,
) -> Result<CopyStats> {
    let mut new_conn = Connection::open(new_path)?;
    new_conn.execute(&table_def.create_table_sql(), [])?;

    let old_tx = old_conn.unchecked_transaction()?;
    let new_tx = new_conn.transaction()?;
    let outcome = copy_rows(&old_tx, &new_tx, mapper).and_then(|mut stats| {
        carry_sequence(&old_tx, &new_tx)?;
        stats.sample = sample_rows(&new_tx, sample_columns)?;
        Ok(stats)
    });
    match outcome {
        Ok(stats) => {
            old_tx.rollback()?;
            new_tx.commit()?;
            Ok(stats)
        }
        Err(e) => {
            if let Err(rollback) = old_tx.rollback() {
                warn!(error = %rollback, "rollback of old connection failed");
            }
            if let Err(rollback) = new_tx.rollback() {
                warn!(error = %rollback, "rollback of new connection failed");
            }
            Err(e)
        }
    }
}

fn copy_rows(old: &Connection, new: &Connection, mapper: &RowMapper<'_>) -> Result<CopyStats> {
    let old_columns = column_names(old)?;
    let new_columns = column_names(new)?;
    if old_columns.first().map(String::as_str) != Some(ID_COLUMN)
        || new_columns.first().map(String::as_str) != Some(ID_COLUMN)
    {
        return Err(LedgerError::InvalidSchema(
            "`id` must be the first column of log".to_string(),
        ));
    }

    let mut select = old.prepare(&format!(
        "SELECT {} FROM {} ORDER BY {}",
        old_columns.join(", "),
        TABLE_NAME,
        ID_COLUMN
    ))?;
    let rows = select
        .query_map([], |r| {
            let mut row = Row::new();
            for (i, name) in old_columns.iter().enumerate() {
                row.insert(name.clone(), r.get::<_, ParamValue>(i)?);
            }
            Ok(row)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let placeholders = vec!["?"; new_columns.len()].join(", ");
    let mut insert = new.prepare(&format!(
        "INSERT INTO {} ({}) VALUES ({})",
        TABLE_NAME,
        new_columns.join(", "),
        placeholders
    ))?;
    let conditions: Vec<String> = new_columns[1..]
        .iter()
        .map(|name| format!("{} IS ?", name))
        .collect();
    let mut verify = new.prepare(&format!(
        "SELECT {} FROM {} WHERE {}",
        ID_COLUMN,
        TABLE_NAME,
        conditions.join(" AND ")
    ))?;

    let mut stats = CopyStats::default();
    for row in rows {
        let original_id = row.get(ID_COLUMN).cloned();
        let mapped = match mapper(row)? {
            Some(mapped) => mapped,
            None => {
                stats.dropped += 1;
                continue;
            }
        };
        let values = new_columns
            .iter()
            .map(|name| {
                mapped
                    .get(name)
                    .ok_or_else(|| LedgerError::MapperMissingColumn(name.clone()))
            })
            .collect::<Result<Vec<&ParamValue>>>()?;
        insert.execute(params_from_iter(values.iter().copied()))?;
        stats.copied += 1;

        let ids = verify
            .query_map(params_from_iter(values[1..].iter().copied()), |r| {
                r.get::<_, i64>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let consistent = match ids.as_slice() {
            [id] => {
                let found = ParamValue::Integer(*id);
                original_id.as_ref() == Some(&found) && values[0] == &found
            }
            _ => false,
        };
        if !consistent {
            stats.mismatches += 1;
            warn!(
                found = ?ids,
                original_id = ?original_id,
                mapped_id = ?values[0],
                "copied row does not map back to its original id"
            );
        }
    }
    Ok(stats)
}

/// Ids handed out before the migration stay retired, even when their rows
/// were deleted or dropped by the mapper.
fn carry_sequence(old: &Connection, new: &Connection) -> Result<()> {
    let old_seq: Option<i64> = old
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = ?1",
            [TABLE_NAME],
            |r| r.get(0),
        )
        .optional()?;
    let Some(old_seq) = old_seq else {
        return Ok(());
    };
    let updated = new.execute(
        "UPDATE sqlite_sequence SET seq = MAX(seq, ?1) WHERE name = ?2",
        params![old_seq, TABLE_NAME],
    )?;
    if updated == 0 {
        new.execute(
            "INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)",
            params![TABLE_NAME, old_seq],
        )?;
    }
    Ok(())
}

fn column_names(conn: &Connection) -> Result<Vec<String>> {
    Ok(table_info(conn)?.into_iter().map(|c| c.name).collect())
}

fn sample_rows(conn: &Connection, columns: &[String]) -> Result<Vec<Vec<ParamValue>>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        TABLE_NAME
    ))?;
    let rows = stmt
        .query_map([], |r| {
            (0..columns.len())
                .map(|i| r.get::<_, ParamValue>(i))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let sample: Vec<Vec<ParamValue>> = rows
        .choose_multiple(&mut rand::thread_rng(), SAMPLE_SIZE)
        .cloned()
        .collect();
    for row in &sample {
        info!(columns = ?columns, values = ?row, "migrated row sample");
    }
    Ok(sample)
}

fn swap_files(db_path: &Path, new_path: &Path, backup_path: &Path) -> Result<()> {
    if backup_path.exists() {
        warn!(backup = %backup_path.display(), "overwriting previous backup");
    }
    fs::rename(db_path, backup_path)?;
    fs::rename(new_path, db_path)?;
    Ok(())
}

fn discard(new_path: &Path) {
    if let Err(e) = fs::remove_file(new_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %new_path.display(), error = %e, "could not remove abandoned migration file");
        }
    }
}
