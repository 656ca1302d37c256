#![warn(missing_docs)]

//! # jsplay-config
//!
//! Configuration loading for the jsplay playground host.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every field is optional; absent values fall back to the defaults of the
//! component that consumes them.
//!
//! ## Example
//!
//! ```toml
//! data_dir = "${HOME}/.jsplay"
//!
//! [sandbox]
//! timeout_ms = 5000
//! max_heap_mb = 128
//! max_concurrent = 8
//! execution_mode = "child_process"
//!
//! [sandbox.capabilities]
//! require = true
//! fetch = false
//!
//! [packages]
//! npm_command = "npm"
//!
//! [http]
//! timeout_secs = 10
//! allowed_hosts = ["api.github.com"]
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level jsplay configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaygroundConfig {
    /// Directory holding preferences and the package root.
    /// Defaults to `$HOME/.jsplay`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Package manager settings.
    #[serde(default)]
    pub packages: PackagesConfig,

    /// Preferences store settings.
    #[serde(default)]
    pub preferences: PreferencesConfig,

    /// Host-side HTTP bridge settings.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Execution deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum source size in kilobytes.
    #[serde(default)]
    pub max_code_kb: Option<usize>,

    /// Maximum concurrent sandbox executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum console calls forwarded per execution.
    #[serde(default)]
    pub max_console_events: Option<usize>,

    /// Execution mode: "in_process" (default) or "child_process".
    #[serde(default)]
    pub execution_mode: Option<String>,

    /// Capability switches for the sandbox global environment.
    #[serde(default)]
    pub capabilities: CapabilityOverrides,
}

/// Per-capability switches. Unset means the sandbox default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityOverrides {
    /// Install the `console` shim.
    #[serde(default)]
    pub console: Option<bool>,
    /// Install `require` over the package directory.
    #[serde(default)]
    pub require: Option<bool>,
    /// Install the `fetch` bridge.
    #[serde(default)]
    pub fetch: Option<bool>,
    /// Install `setTimeout` and friends.
    #[serde(default)]
    pub timers: Option<bool>,
}

/// Package manager configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackagesConfig {
    /// Package root. Defaults to `<data_dir>/packages`.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// The npm executable to run. Defaults to `npm`.
    #[serde(default)]
    pub npm_command: Option<String>,
}

/// Preferences store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreferencesConfig {
    /// Preferences file. Defaults to `<data_dir>/preferences.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// HTTP bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Per-request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum response body size in kilobytes.
    #[serde(default)]
    pub max_body_kb: Option<usize>,

    /// User-Agent header sent with bridged requests.
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Hosts the bridge may contact. Empty allows any host.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

impl PlaygroundConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: PlaygroundConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    /// The effective data directory.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".jsplay"),
            None => PathBuf::from(".jsplay"),
        }
    }

    /// The effective package root.
    pub fn packages_dir(&self) -> PathBuf {
        self.packages
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("packages"))
    }

    /// The effective preferences file.
    pub fn preferences_path(&self) -> PathBuf {
        self.preferences
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("preferences.json"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        if sandbox.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_ms must be greater than 0".into(),
            ));
        }
        if sandbox.max_concurrent == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_concurrent must be greater than 0".into(),
            ));
        }
        if sandbox.max_heap_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_heap_mb must be greater than 0".into(),
            ));
        }
        if let Some(mode) = &sandbox.execution_mode {
            if mode != "in_process" && mode != "child_process" {
                return Err(ConfigError::Invalid(format!(
                    "unsupported execution_mode '{}', supported: in_process, child_process",
                    mode
                )));
            }
        }
        if let Some(npm) = &self.packages.npm_command {
            if npm.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "packages.npm_command must not be empty".into(),
                ));
            }
        }
        if self.http.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "http.timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unknown variables stay as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
