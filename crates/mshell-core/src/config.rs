//! Configuration resolution for mshell.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/mshell/settings.json)
//! 3. Project config (.mshell/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by each binary)
//!
//! The defaults alone reproduce the zero-configuration behavior: fixed
//! rendezvous name in the working directory, `sh` as the interpreter.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::sentinel::{DEFAULT_BUFFER_SIZE, PANIC};
use crate::transport::fifo::DEFAULT_RENDEZVOUS;

/// Complete mshell configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Daemon-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub rendezvous_path: PathBuf,
    pub interpreter: InterpreterConfig,
    pub buffer_size: usize,
    /// Upper bound on live sessions; `None` admits without limit.
    pub max_sessions: Option<usize>,
    /// Treat an exact PANIC literal read from a client as a teardown request.
    pub detect_wire_panic: bool,
    /// Grace period between SIGTERM and SIGKILL for the interpreter.
    pub terminate_timeout_secs: u64,
    /// How long shutdown waits for live sessions before aborting them.
    pub drain_timeout_secs: u64,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            rendezvous_path: PathBuf::from(DEFAULT_RENDEZVOUS),
            interpreter: InterpreterConfig::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_sessions: None,
            detect_wire_panic: true,
            terminate_timeout_secs: 5,
            drain_timeout_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

/// The command interpreter spawned once by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            args: Vec::new(),
        }
    }
}

/// Client-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub rendezvous_path: PathBuf,
    /// Directory holding the per-process private FIFO.
    pub private_dir: PathBuf,
    pub buffer_size: usize,
    /// Write the PANIC literal before closing on an interrupt.
    pub panic_on_interrupt: bool,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rendezvous_path: PathBuf::from(DEFAULT_RENDEZVOUS),
            private_dir: PathBuf::from("."),
            buffer_size: DEFAULT_BUFFER_SIZE,
            panic_on_interrupt: true,
            log_level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Reject settings the relay cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.daemon.buffer_size == 0 || self.client.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be positive".into()));
        }
        if self.daemon.detect_wire_panic && self.daemon.buffer_size < PANIC.len() {
            return Err(Error::Config(format!(
                "daemon.buffer_size must be at least {} bytes to detect PANIC",
                PANIC.len()
            )));
        }
        if self.daemon.max_sessions == Some(0) {
            return Err(Error::Config("daemon.max_sessions must be positive".into()));
        }
        if self.daemon.interpreter.program.is_empty() {
            return Err(Error::Config("daemon.interpreter.program is empty".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let project = project_dir.map(|dir| dir.join(".mshell").join("settings.json"));
    load_layered(
        global_config_path().as_deref(),
        project.as_deref(),
        |key| std::env::var(key).ok(),
    )
}

/// Merge the global and project files key by key, then apply the
/// environment. A file only overrides the keys it actually sets.
fn load_layered(
    global: Option<&Path>,
    project: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut merged = Value::Object(Map::new());
    for path in [global, project].into_iter().flatten() {
        if path.exists() {
            merge_values(&mut merged, read_config_value(path)?);
        }
    }
    let mut config: Config = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, lookup);
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/mshell/settings.json"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("mshell").join("settings.json"))
    }
}

/// Read a single JSON config file.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let value = read_config_value(path)?;
    serde_json::from_value(value).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Read a config file as raw JSON, rejecting values of the wrong shape.
fn read_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    Config::deserialize(&value).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    Ok(value)
}

/// Objects merge recursively; any other overlay value replaces the base.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("MSHELL_RENDEZVOUS") {
        config.daemon.rendezvous_path = PathBuf::from(&val);
        config.client.rendezvous_path = PathBuf::from(val);
    }
    if let Some(val) = lookup("MSHELL_SHELL") {
        config.daemon.interpreter.program = val;
        config.daemon.interpreter.args.clear();
    }
    if let Some(val) = lookup("MSHELL_LOG_LEVEL") {
        config.daemon.log_level.clone_from(&val);
        config.client.log_level = val;
    }
    if let Some(n) = lookup("MSHELL_BUFFER_SIZE").and_then(|v| v.parse().ok()) {
        config.daemon.buffer_size = n;
        config.client.buffer_size = n;
    }
    if let Some(n) = lookup("MSHELL_MAX_SESSIONS").and_then(|v| v.parse().ok()) {
        config.daemon.max_sessions = Some(n);
    }
}
