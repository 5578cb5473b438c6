use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::{DirKind, LabConfig, Place};
use crate::error::{LedgerError, Result};
use crate::value::Params;

/// Keys the job launcher reads from every exec config.
pub const REQUIRED_LAUNCH_PARAMS: [&str; 2] = ["num_nodes", "num_process"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankInfo {
    pub rank: u32,
    pub world_size: u32,
}

pub fn check_launch_params(params: &Params) -> Result<()> {
    for name in REQUIRED_LAUNCH_PARAMS {
        if !params.contains_key(name) {
            return Err(LedgerError::MissingLaunchParameter { name });
        }
    }
    Ok(())
}

pub fn log_path(logs_dir: &Path, conf_id: i64, rank: Option<RankInfo>) -> PathBuf {
    match rank {
        Some(RankInfo { rank, world_size }) => {
            logs_dir.join(format!("log{}--RANK{}_{}.csv", conf_id, world_size, rank))
        }
        None => logs_dir.join(format!("{}.log", conf_id)),
    }
}

pub fn exec_config_path(exec_configs_dir: &Path, conf_id: i64) -> PathBuf {
    exec_configs_dir.join(format!("{}.sh", conf_id))
}

/// `(variable, value)` pairs in export order: parameters, `conf_id`, the
/// remote directories, `master_addr`.
pub fn exports(conf_id: i64, params: &Params, config: &LabConfig) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect();
    out.push(("conf_id".to_string(), conf_id.to_string()));
    for kind in DirKind::ALL {
        out.push((
            kind.key().to_string(),
            config.dirname(Place::Remote, kind).display().to_string(),
        ));
    }
    out.push(("master_addr".to_string(), config.master_addr.clone()));
    out.into_iter()
        .map(|(k, v)| (config.cmd_name(&k).to_string(), v))
        .collect()
}

pub fn render_exec_config(conf_id: i64, params: &Params, config: &LabConfig) -> String {
    let mut out = String::new();
    for (name, value) in exports(conf_id, params, config) {
        out.push_str(&format!("export {}=\"{}\"\n", name, escape_double_quoted(&value)));
    }
    out
}

fn escape_double_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
