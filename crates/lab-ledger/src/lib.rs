//! Experiment ledger: stable ids for parameter combinations, stored in a
//! SQLite `log` table that is reconciled (and, for a single added column,
//! migrated) against a declared schema.

pub mod config;
pub mod error;
pub mod exec_config;
pub mod identity;
pub mod manager;
pub mod migration;
pub mod reconciler;
pub mod schema;
pub mod value;

pub use config::{DirKind, LabConfig, Place};
pub use error::{LedgerError, Result};
pub use exec_config::RankInfo;
pub use identity::{Allocation, IdentityManager};
pub use manager::{open_ledger, ExecConfig, ExprManager, Opened};
pub use migration::{MigrationReport, Row, RowMapper};
pub use reconciler::{ReconciledTable, SchemaCheck, StoredColumn, TableReconciler};
pub use schema::{ColumnDef, TableDef};
pub use value::{ParamValue, Params};

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::PathBuf;

    use chrono::Utc;

    pub fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "lab_ledger_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }
}
