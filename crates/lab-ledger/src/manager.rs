use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::{DirKind, LabConfig, Place};
use crate::error::{LedgerError, Result};
use crate::exec_config::{
    atomic_write_bytes, check_launch_params, exec_config_path, log_path, render_exec_config,
    RankInfo,
};
use crate::identity::{Allocation, IdentityManager};
use crate::migration::MigrationReport;
use crate::reconciler::{SchemaCheck, TableReconciler};
use crate::schema::TableDef;
use crate::value::Params;

/// Result of opening a ledger. After a migration nothing may be served from
/// the same process state; open again to get a `Ready` handle.
pub enum Opened<T> {
    Ready(T),
    Migrated(MigrationReport),
}

#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub conf_id: i64,
    pub path: PathBuf,
}

/// Creates the table if needed and reconciles it with `table_def`.
pub fn open_ledger(
    mut table_def: TableDef,
    db_path: &Path,
    auto_migrate: bool,
) -> Result<Opened<IdentityManager>> {
    table_def.normalize()?;
    let reconciler = TableReconciler::open(db_path, table_def)?;
    reconciler.ensure_table_exists()?;
    match reconciler.check_schema(auto_migrate)? {
        SchemaCheck::Current(table) => Ok(Opened::Ready(IdentityManager::new(table))),
        SchemaCheck::OutOfDate { stored, declared } => {
            Err(LedgerError::SchemaOutOfDate { stored, declared })
        }
        SchemaCheck::Migrated(report) => Ok(Opened::Migrated(report)),
    }
}

pub struct ExprManager {
    ids: IdentityManager,
    config: LabConfig,
}

impl ExprManager {
    pub fn open(
        table_def: TableDef,
        db_path: &Path,
        config: LabConfig,
        auto_migrate: bool,
    ) -> Result<Opened<Self>> {
        Ok(match open_ledger(table_def, db_path, auto_migrate)? {
            Opened::Ready(ids) => Opened::Ready(Self { ids, config }),
            Opened::Migrated(report) => Opened::Migrated(report),
        })
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn table_def(&self) -> &TableDef {
        self.ids.table_def()
    }

    pub fn dirname(&self, place: Place, kind: DirKind) -> &Path {
        self.config.dirname(place, kind)
    }

    pub fn get_id(&self, params: &Params) -> Result<i64> {
        self.ids.get_id(params)
    }

    pub fn insert_or_get_existing(&self, params: &Params) -> Result<Allocation> {
        self.ids.insert_or_get_existing(params)
    }

    pub fn local_log_path(&self, conf_id: i64, rank: Option<RankInfo>) -> PathBuf {
        log_path(self.dirname(Place::Local, DirKind::Logs), conf_id, rank)
    }

    /// Allocates the id for `params` and writes `<id>.sh` into the local
    /// exec-configs directory.
    pub fn generate_exec_config(&self, params: &Params) -> Result<ExecConfig> {
        check_launch_params(params)?;
        let exec_dir = self.dirname(Place::Local, DirKind::ExecConfigs);
        fs::create_dir_all(exec_dir)?;

        let conf_id = self.ids.get_id(params)?;
        let path = exec_config_path(exec_dir, conf_id);
        let rendered = render_exec_config(conf_id, params, &self.config);
        atomic_write_bytes(&path, rendered.as_bytes())?;
        info!(conf_id, path = %path.display(), "wrote exec config");
        Ok(ExecConfig { conf_id, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;
    use crate::test_support::temp_dir;
    use crate::value::ParamValue;

    fn table_def() -> TableDef {
        TableDef {
            columns: vec![
                ColumnDef {
                    name: "lr".to_string(),
                    column_type: "real".to_string(),
                    default: None,
                },
                ColumnDef::new("batch_size", "integer"),
            ],
        }
    }

    fn config(working: &Path) -> LabConfig {
        let raw = format!(
            "paths:\n  local: {{working_dirname: {}}}\n  remote: {{working_dirname: /remote/lab}}\nmaster_addr: node0\n",
            working.display()
        );
        LabConfig::from_yaml(&raw, Path::new("/")).expect("config")
    }

    fn launch(lr: f64) -> Params {
        let mut p = Params::new();
        p.insert("lr".to_string(), ParamValue::Real(lr));
        p.insert("batch_size".to_string(), ParamValue::Integer(32));
        p.insert("num_nodes".to_string(), ParamValue::Integer(1));
        p.insert("num_process".to_string(), ParamValue::Integer(4));
        p
    }

    fn ready(dir: &Path, def: TableDef, auto_migrate: bool) -> ExprManager {
        match ExprManager::open(def, &dir.join("ledger.db"), config(dir), auto_migrate)
            .expect("open")
        {
            Opened::Ready(manager) => manager,
            Opened::Migrated(_) => panic!("unexpected migration"),
        }
    }

    #[test]
    fn open_normalizes_declared_types() {
        let dir = temp_dir("manager_normalize");
        let manager = ready(&dir, table_def(), false);
        assert_eq!(manager.table_def().columns[0].column_type, "REAL");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn generate_exec_config_writes_script_named_by_id() {
        let dir = temp_dir("manager_generate");
        let manager = ready(&dir, table_def(), false);

        let first = manager.generate_exec_config(&launch(0.1)).expect("generate");
        let again = manager.generate_exec_config(&launch(0.1)).expect("generate");
        let second = manager.generate_exec_config(&launch(0.2)).expect("generate");
        assert_eq!(first.conf_id, 1);
        assert_eq!(again.conf_id, 1);
        assert_eq!(second.conf_id, 2);
        assert_eq!(first.path, dir.join("exec_configs").join("1.sh"));

        let script = fs::read_to_string(&second.path).expect("script");
        assert!(script.contains("export conf_id=\"2\"\n"), "{}", script);
        assert!(script.contains("export lr=\"0.2\"\n"), "{}", script);
        assert!(script.contains("export working_dirname=\"/remote/lab\"\n"), "{}", script);
        assert!(script.ends_with("export master_addr=\"node0\"\n"), "{}", script);
        assert_eq!(
            manager.local_log_path(2, None),
            dir.join("logs").join("2.log")
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn generate_exec_config_requires_launch_params_before_allocating() {
        let dir = temp_dir("manager_launch_params");
        let manager = ready(&dir, table_def(), false);
        let mut params = launch(0.1);
        params.remove("num_process");
        let err = manager
            .generate_exec_config(&params)
            .expect_err("num_process is required");
        assert!(!err.is_fatal());
        assert_eq!(manager.ids.row_count().expect("count"), 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn drift_without_auto_migrate_is_out_of_date() {
        let dir = temp_dir("manager_out_of_date");
        drop(ready(&dir, table_def(), false));

        let mut wider = table_def();
        wider
            .columns
            .push(ColumnDef::new("version", "integer").with_default(1));
        let err = ExprManager::open(wider.clone(), &dir.join("ledger.db"), config(&dir), false)
            .err()
            .expect("drift must be reported");
        assert!(matches!(err, LedgerError::SchemaOutOfDate { .. }));

        match ExprManager::open(wider.clone(), &dir.join("ledger.db"), config(&dir), true)
            .expect("migrate")
        {
            Opened::Migrated(report) => assert_eq!(report.added_column, "version"),
            Opened::Ready(_) => panic!("expected migration"),
        }
        let manager = ready(&dir, wider, false);
        assert_eq!(manager.table_def().columns.len(), 3);
        let _ = fs::remove_dir_all(dir);
    }
}
