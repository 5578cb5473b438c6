use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Local,
    Remote,
}

impl Place {
    pub const ALL: [Place; 2] = [Place::Local, Place::Remote];

    pub fn key(self) -> &'static str {
        match self {
            Place::Local => "local",
            Place::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    Working,
    ExecConfigs,
    Logs,
}

impl DirKind {
    pub const ALL: [DirKind; 3] = [DirKind::Working, DirKind::ExecConfigs, DirKind::Logs];

    /// Key under `paths.<place>`, also the exported variable name.
    pub fn key(self) -> &'static str {
        match self {
            DirKind::Working => "working_dirname",
            DirKind::ExecConfigs => "exec_configs_dirname",
            DirKind::Logs => "logs_dirname",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPlacePaths {
    pub working_dirname: PathBuf,
    #[serde(default)]
    pub exec_configs_dirname: Option<PathBuf>,
    #[serde(default)]
    pub logs_dirname: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPaths {
    pub local: RawPlacePaths,
    pub remote: RawPlacePaths,
}

/// Lab config as written on disk, before path normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub paths: RawPaths,
    #[serde(default)]
    pub col_cmd_name_mapper: BTreeMap<String, String>,
    pub master_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacePaths {
    pub working_dirname: PathBuf,
    pub exec_configs_dirname: PathBuf,
    pub logs_dirname: PathBuf,
}

impl PlacePaths {
    fn resolve(raw: &RawPlacePaths, cwd: &Path) -> Self {
        let working = normalize_path(&cwd.join(&raw.working_dirname));
        let under_working = |given: Option<&PathBuf>, default: &str| -> PathBuf {
            match given {
                Some(p) => normalize_path(&working.join(p)),
                None => working.join(default),
            }
        };
        Self {
            exec_configs_dirname: under_working(raw.exec_configs_dirname.as_ref(), "exec_configs"),
            logs_dirname: under_working(raw.logs_dirname.as_ref(), "logs"),
            working_dirname: working,
        }
    }

    pub fn get(&self, kind: DirKind) -> &Path {
        match kind {
            DirKind::Working => &self.working_dirname,
            DirKind::ExecConfigs => &self.exec_configs_dirname,
            DirKind::Logs => &self.logs_dirname,
        }
    }
}

/// Normalized lab config: every directory is absolute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabConfig {
    pub local: PlacePaths,
    pub remote: PlacePaths,
    pub col_cmd_name_mapper: BTreeMap<String, String>,
    pub master_addr: String,
}

impl LabConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cwd = std::env::current_dir()?;
        Self::from_yaml(&raw, &cwd)
    }

    pub fn from_yaml(raw: &str, cwd: &Path) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(raw)?;
        Ok(Self::from_raw(raw, cwd))
    }

    /// Relative working directories resolve against `cwd`; relative
    /// `logs_dirname` / `exec_configs_dirname` resolve against their
    /// working directory, which also hosts their defaults.
    pub fn from_raw(raw: RawConfig, cwd: &Path) -> Self {
        Self {
            local: PlacePaths::resolve(&raw.paths.local, cwd),
            remote: PlacePaths::resolve(&raw.paths.remote, cwd),
            col_cmd_name_mapper: raw.col_cmd_name_mapper,
            master_addr: raw.master_addr,
        }
    }

    pub fn paths(&self, place: Place) -> &PlacePaths {
        match place {
            Place::Local => &self.local,
            Place::Remote => &self.remote,
        }
    }

    pub fn dirname(&self, place: Place, kind: DirKind) -> &Path {
        self.paths(place).get(kind)
    }

    /// Exported shell variable name for a parameter.
    pub fn cmd_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.col_cmd_name_mapper
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
paths:
  local:
    working_dirname: /a/b
  remote:
    working_dirname: /mnt/lab/./runs
    logs_dirname: ../shared_logs
    exec_configs_dirname: /opt/exec
col_cmd_name_mapper:
  lr: LEARNING_RATE
master_addr: 10.0.0.1
"#;

    #[test]
    fn unspecified_dirs_default_under_working_dir() {
        let config = LabConfig::from_yaml(CONFIG, Path::new("/home/user")).expect("config");
        assert_eq!(
            config.dirname(Place::Local, DirKind::Logs),
            Path::new("/a/b/logs")
        );
        assert_eq!(
            config.dirname(Place::Local, DirKind::ExecConfigs),
            Path::new("/a/b/exec_configs")
        );
        assert_eq!(
            config.dirname(Place::Local, DirKind::Working),
            Path::new("/a/b")
        );
    }

    #[test]
    fn specified_dirs_resolve_against_working_dir() {
        let config = LabConfig::from_yaml(CONFIG, Path::new("/home/user")).expect("config");
        assert_eq!(
            config.dirname(Place::Remote, DirKind::Working),
            Path::new("/mnt/lab/runs")
        );
        assert_eq!(
            config.dirname(Place::Remote, DirKind::Logs),
            Path::new("/mnt/lab/shared_logs")
        );
        assert_eq!(
            config.dirname(Place::Remote, DirKind::ExecConfigs),
            Path::new("/opt/exec")
        );
    }

    #[test]
    fn relative_working_dir_resolves_against_cwd() {
        let raw = "paths:\n  local: {working_dirname: work}\n  remote: {working_dirname: /r}\nmaster_addr: localhost\n";
        let config = LabConfig::from_yaml(raw, Path::new("/home/user")).expect("config");
        assert_eq!(
            config.dirname(Place::Local, DirKind::Logs),
            Path::new("/home/user/work/logs")
        );
        assert!(config.col_cmd_name_mapper.is_empty());
    }

    #[test]
    fn cmd_name_applies_mapper() {
        let config = LabConfig::from_yaml(CONFIG, Path::new("/")).expect("config");
        assert_eq!(config.cmd_name("lr"), "LEARNING_RATE");
        assert_eq!(config.cmd_name("batch_size"), "batch_size");
        assert_eq!(config.master_addr, "10.0.0.1");
    }

    #[test]
    fn missing_master_addr_is_rejected() {
        let raw = "paths:\n  local: {working_dirname: /l}\n  remote: {working_dirname: /r}\n";
        assert!(LabConfig::from_yaml(raw, Path::new("/")).is_err());
    }
}
