//! CLI configuration (`curry-jit.toml`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// File looked up in the working directory when no `--config` is given.
pub const CONFIG_FILE_NAME: &str = "curry-jit.toml";

/// Output format for plans and dumps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

/// How `dump` renders a thunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    pub format: OutputFormat,
    pub bytes_per_line: usize,
    /// Print the instruction plan above the hex dump
    pub show_plan: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Human,
            bytes_per_line: 16,
            show_plan: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dump: DumpConfig,
    /// Emit thunk construction traces on stderr
    #[serde(default)]
    pub trace: bool,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
        if config.dump.bytes_per_line == 0 {
            return Err(format!("{}: dump.bytes_per_line must be positive", path.display()));
        }
        Ok(config)
    }

    /// Load `curry-jit.toml` from `dir` if present, defaults otherwise
    pub fn discover(dir: &Path) -> Result<Self, String> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}
