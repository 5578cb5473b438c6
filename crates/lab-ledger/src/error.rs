use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("found different column type for `{column}` between db({stored}) and table_def({declared})")]
    SchemaTypeConflict {
        column: String,
        stored: String,
        declared: String,
    },

    #[error("unsupported migration: added columns {added:?}, removed columns {removed:?} (exactly one added column is supported)")]
    UnsupportedMigration {
        added: Vec<String>,
        removed: Vec<String>,
    },

    #[error("default value for column `{column}` must be provided in table_def when using the default mapper")]
    MissingDefault { column: String },

    #[error("parameters are missing declared columns: {missing:?}")]
    MissingColumns { missing: Vec<String> },

    #[error("parameter `{column}` is null")]
    NullParameter { column: String },

    #[error("launch parameter `{name}` is required to generate an exec config")]
    MissingLaunchParameter { name: &'static str },

    #[error("identity lookup matched {matches} rows, expected exactly 1")]
    IdentityCardinalityViolation { matches: usize },

    #[error("db is out-of-date: db({stored:?}) table_def({declared:?})")]
    SchemaOutOfDate {
        stored: Vec<String>,
        declared: Vec<String>,
    },

    #[error("schema migration of {} failed: {source}", path.display())]
    MigrationFailed {
        path: PathBuf,
        #[source]
        source: Box<LedgerError>,
    },

    #[error("invalid table_def: {0}")]
    InvalidSchema(String),

    #[error("migration mapper did not provide column `{0}`")]
    MapperMissingColumn(String),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl LedgerError {
    /// Caller-input errors can be corrected and retried; everything else
    /// means the stored table and the declaration cannot be reconciled.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            LedgerError::MissingColumns { .. }
                | LedgerError::NullParameter { .. }
                | LedgerError::MissingLaunchParameter { .. }
        )
    }
}
