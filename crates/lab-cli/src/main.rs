use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use lab_ledger::{
    DirKind, ExprManager, LabConfig, LedgerError, MigrationReport, Opened, ParamValue, Params,
    Place, RankInfo, TableDef, TableReconciler,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lab-ledger", version = "0.3.0", about = "Experiment id ledger")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the table if needed and compare it with the table definition
    Check {
        #[arg(long)]
        table: PathBuf,
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        auto_migrate: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the id of a parameter combination, allocating it if new
    Id {
        #[arg(long)]
        table: PathBuf,
        #[arg(long)]
        db: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        auto_migrate: bool,
        #[arg(long)]
        json: bool,
    },
    /// Allocate an id and write `<id>.sh` into the local exec configs dir
    Generate {
        #[arg(long)]
        table: PathBuf,
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        config: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        auto_migrate: bool,
        #[arg(long)]
        json: bool,
    },
    LogPath {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        id: i64,
        #[arg(long, requires = "world_size")]
        rank: Option<u32>,
        #[arg(long, requires = "rank")]
        world_size: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Show the stored columns of the log table
    TableInfo {
        #[arg(long)]
        table: PathBuf,
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Check {
            table,
            db,
            auto_migrate,
            json,
        } => {
            let table_def = TableDef::load(&table)?;
            match lab_ledger::open_ledger(table_def, &db, auto_migrate)? {
                Opened::Ready(ids) => {
                    if json {
                        return Ok(Some(json!({
                            "ok": true,
                            "command": "check",
                            "status": "current",
                            "db": ids.db_path().display().to_string(),
                        })));
                    }
                    println!("status: current");
                    println!("db: {}", ids.db_path().display());
                }
                Opened::Migrated(report) => return Ok(migrated(&report, "check", json)),
            }
        }
        Commands::Id {
            table,
            db,
            set_values,
            auto_migrate,
            json,
        } => {
            let params = parse_set_bindings(&set_values)?;
            let table_def = TableDef::load(&table)?;
            let ids = match lab_ledger::open_ledger(table_def, &db, auto_migrate)? {
                Opened::Ready(ids) => ids,
                Opened::Migrated(report) => return Ok(migrated(&report, "id", json)),
            };
            let allocation = ids.insert_or_get_existing(&params)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "id",
                    "conf_id": allocation.id(),
                    "inserted": matches!(allocation, lab_ledger::Allocation::Inserted(_)),
                })));
            }
            println!("{}", allocation.id());
        }
        Commands::Generate {
            table,
            db,
            config,
            set_values,
            auto_migrate,
            json,
        } => {
            let params = parse_set_bindings(&set_values)?;
            let table_def = TableDef::load(&table)?;
            let config = LabConfig::load(&config)?;
            let manager = match ExprManager::open(table_def, &db, config, auto_migrate)? {
                Opened::Ready(manager) => manager,
                Opened::Migrated(report) => return Ok(migrated(&report, "generate", json)),
            };
            let exec = manager.generate_exec_config(&params)?;
            let log_path = manager.local_log_path(exec.conf_id, None);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "generate",
                    "conf_id": exec.conf_id,
                    "exec_config": exec.path.display().to_string(),
                    "log_path": log_path.display().to_string(),
                })));
            }
            println!("conf_id: {}", exec.conf_id);
            println!("exec_config: {}", exec.path.display());
            println!("log_path: {}", log_path.display());
        }
        Commands::LogPath {
            config,
            id,
            rank,
            world_size,
            json,
        } => {
            let config = LabConfig::load(&config)?;
            let rank = match (rank, world_size) {
                (Some(rank), Some(world_size)) => Some(RankInfo { rank, world_size }),
                _ => None,
            };
            let path = lab_ledger::exec_config::log_path(
                config.dirname(Place::Local, DirKind::Logs),
                id,
                rank,
            );
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "log-path",
                    "log_path": path.display().to_string(),
                })));
            }
            println!("{}", path.display());
        }
        Commands::TableInfo { table, db, json } => {
            let table_def = TableDef::load(&table)?;
            if !db.exists() {
                return Err(anyhow!("db not found: {}", db.display()));
            }
            let reconciler = TableReconciler::open(&db, table_def)?;
            let stored = reconciler.table_info()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "table-info",
                    "columns": serde_json::to_value(&stored)?,
                    "declared": serde_json::to_value(reconciler.table_def())?,
                })));
            }
            for column in &stored {
                println!(
                    "{}\t{}\t{}",
                    column.cid,
                    column.name,
                    if column.primary_key {
                        format!("{} PRIMARY KEY", column.column_type)
                    } else {
                        column.column_type.clone()
                    }
                );
            }
        }
    }
    Ok(None)
}

/// A finished migration ends the run; the caller re-runs against the
/// swapped file.
fn migrated(report: &MigrationReport, command: &str, json: bool) -> Option<Value> {
    if json {
        return Some(json!({
            "ok": true,
            "command": command,
            "status": "migrated",
            "migration": serde_json::to_value(report).unwrap_or(Value::Null),
        }));
    }
    println!(
        "schema update done. new db in {} (previous kept at {}). please re-run your program",
        report.db_path.display(),
        report.backup_path.display()
    );
    println!("added_column: {}", report.added_column);
    println!("copied: {}", report.copied);
    println!("dropped: {}", report.dropped);
    println!("mismatches: {}", report.mismatches);
    None
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<LedgerError>() {
        Some(LedgerError::SchemaOutOfDate { .. }) => "db_out_of_date",
        Some(LedgerError::SchemaTypeConflict { .. }) => "schema_type_conflict",
        Some(LedgerError::UnsupportedMigration { .. }) => "unsupported_migration",
        Some(LedgerError::MissingDefault { .. }) => "missing_default",
        Some(LedgerError::MigrationFailed { .. }) => "migration_failed",
        Some(LedgerError::MissingColumns { .. }) => "missing_columns",
        Some(LedgerError::IdentityCardinalityViolation { .. }) => "identity_cardinality",
        Some(_) => "ledger_error",
        None => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Check { json, .. }
        | Commands::Id { json, .. }
        | Commands::Generate { json, .. }
        | Commands::LogPath { json, .. }
        | Commands::TableInfo { json, .. } => *json,
    }
}

fn parse_set_bindings(values: &[String]) -> Result<Params> {
    let mut out = Params::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected k=v", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid --set '{}': key cannot be empty", raw));
        }
        out.insert(key.trim().to_string(), ParamValue::parse_literal(val_raw));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bindings_parse_typed_literals() {
        let values = vec![
            "lr=0.1".to_string(),
            "batch_size=32".to_string(),
            "optimizer=adam".to_string(),
            "note=a=b".to_string(),
        ];
        let params = parse_set_bindings(&values).expect("bindings");
        assert_eq!(params["lr"], ParamValue::Real(0.1));
        assert_eq!(params["batch_size"], ParamValue::Integer(32));
        assert_eq!(params["optimizer"], ParamValue::Text("adam".to_string()));
        assert_eq!(params["note"], ParamValue::Text("a=b".to_string()));
    }

    #[test]
    fn set_bindings_reject_malformed_pairs() {
        assert!(parse_set_bindings(&["lr".to_string()]).is_err());
        assert!(parse_set_bindings(&["=1".to_string()]).is_err());
    }

    #[test]
    fn ledger_errors_map_to_stable_codes() {
        let err = anyhow::Error::new(LedgerError::MissingColumns {
            missing: vec!["batch_size".to_string()],
        });
        assert_eq!(error_code(&err), "missing_columns");
        assert_eq!(error_code(&anyhow!("boom")), "command_failed");
    }

    #[test]
    fn cli_parses_generate_with_bindings() {
        let cli = Cli::try_parse_from([
            "lab-ledger",
            "generate",
            "--table",
            "table.yaml",
            "--db",
            "ledger.db",
            "--config",
            "lab.yaml",
            "--set",
            "lr=0.1",
            "--set",
            "num_nodes=1",
        ])
        .expect("parse");
        match cli.command {
            Commands::Generate { set_values, .. } => assert_eq!(set_values.len(), 2),
            _ => panic!("expected generate"),
        }
    }
}
