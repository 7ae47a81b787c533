use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TopologyError};

/// Where the native backends read from, and the affinity policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    pub node_root: PathBuf,
    pub cpu_root: PathBuf,
    pub proc_status: PathBuf,
    /// Put the thread's original affinity mask back after probing
    pub restore_affinity: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            node_root: PathBuf::from("/sys/devices/system/node"),
            cpu_root: PathBuf::from("/sys/devices/system/cpu"),
            proc_status: PathBuf::from("/proc/self/status"),
            restore_affinity: true,
        }
    }
}

impl QueryConfig {
    pub fn validate(&self) -> Result<()> {
        for (key, path) in [
            ("node_root", &self.node_root),
            ("cpu_root", &self.cpu_root),
            ("proc_status", &self.proc_status),
        ] {
            if path.as_os_str().is_empty() {
                return Err(TopologyError::config(format!("{key} is empty")));
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Parse config text; `path` is only used for error context
pub fn parse_query_config(text: &str, path: &Path) -> Result<QueryConfig> {
    let mut config = QueryConfig::default();

    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();

        // skip blank lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let invalid = |reason: String| TopologyError::config_invalid(path, line_no + 1, reason);

        for token in line.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected key=value, got '{token}'")))?;
            if value.is_empty() {
                return Err(invalid(format!("missing value for '{key}'")));
            }

            match key {
                "node_root" => config.node_root = PathBuf::from(value),
                "cpu_root" => config.cpu_root = PathBuf::from(value),
                "proc_status" => config.proc_status = PathBuf::from(value),
                "restore_affinity" => {
                    config.restore_affinity = parse_bool(value)
                        .ok_or_else(|| invalid(format!("invalid restore_affinity value '{value}'")))?;
                }
                _ => return Err(invalid(format!("unknown key '{key}'"))),
            }
        }
    }

    Ok(config)
}

pub fn load_query_config(path: impl AsRef<Path>) -> Result<QueryConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let config = parse_query_config(&text, path)?;
    log::debug!("loaded {}: {:?}", path.display(), config);
    Ok(config)
}
