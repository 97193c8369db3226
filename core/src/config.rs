//! Layered configuration
//!
//! Sources, lowest priority first: built-in defaults, an optional config file
//! (`tether.toml`, or the path given explicitly or by `TETHER_CONFIG_PATH`),
//! then `TETHER__SECTION__KEY` environment variables.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::interpreter::eval::DEFAULT_MAX_DEPTH;

const ENV_PREFIX: &str = "TETHER";
const CONFIG_PATH_VAR: &str = "TETHER_CONFIG_PATH";
const DEFAULT_CONFIG_NAME: &str = "tether";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub interpreter: InterpreterConfig,
    pub eval: EvalConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Name of the dedicated interpreter thread
    pub thread_name: String,
    /// Stack size of the interpreter thread, in bytes
    pub stack_size: usize,
    /// Deepest guest call stack before evaluation fails
    pub max_depth: usize,
    /// Guest code evaluated in the global scope before the first prompt
    pub startup_code: Option<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            thread_name: "tether-interpreter".to_string(),
            stack_size: 256 * 1024 * 1024,
            max_depth: DEFAULT_MAX_DEPTH,
            startup_code: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Maximum characters returned by `evaluate_as_text`
    pub text_limit: usize,
    /// Maximum characters of the preview in `value_info`
    pub preview_limit: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            text_limit: 500_000,
            preview_limit: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for loading [`Config`]
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    text_limit: Option<usize>,
    log_filter: Option<String>,
}

impl ConfigBuilder {
    /// Explicit config file; it must exist when given
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Override `eval.text_limit`
    pub fn text_limit(mut self, limit: Option<usize>) -> Self {
        self.text_limit = limit;
        self
    }

    /// Override `log.filter`
    pub fn log_filter(mut self, filter: Option<String>) -> Self {
        self.log_filter = filter;
        self
    }

    pub fn build(self) -> Result<Config> {
        let mut builder = config::Config::builder();

        let path = self
            .config_path
            .or_else(|| std::env::var(CONFIG_PATH_VAR).ok().map(PathBuf::from));
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path.as_path()).required(true)),
            None => {
                builder.add_source(config::File::with_name(DEFAULT_CONFIG_NAME).required(false))
            }
        };

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(limit) = self.text_limit {
            builder = builder
                .set_override("eval.text_limit", limit as u64)
                .context("Failed to apply text limit override")?;
        }
        if let Some(filter) = self.log_filter {
            builder = builder
                .set_override("log.filter", filter)
                .context("Failed to apply log filter override")?;
        }

        let settings = builder.build().context("Failed to load configuration")?;
        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}.toml", name, std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_file_values_override_defaults() {
        let path = write_config(
            "tether-config-file",
            "[eval]\ntext_limit = 42\n\n[interpreter]\nstartup_code = \"x <- 1\"\nmax_depth = 64\n",
        );

        let config = Config::builder().config_path(Some(path.clone())).build().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.eval.text_limit, 42);
        assert_eq!(config.eval.preview_limit, 200);
        assert_eq!(config.interpreter.startup_code.as_deref(), Some("x <- 1"));
        assert_eq!(config.interpreter.thread_name, "tether-interpreter");
        assert_eq!(config.interpreter.max_depth, 64);
        assert_eq!(config.interpreter.stack_size, 256 * 1024 * 1024);
    }

    #[test]
    fn test_builder_overrides_win() {
        let path = write_config("tether-config-override", "[eval]\ntext_limit = 42\n");

        let config = Config::builder()
            .config_path(Some(path.clone()))
            .text_limit(Some(7))
            .log_filter(Some("debug".to_string()))
            .build()
            .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.eval.text_limit, 7);
        assert_eq!(config.log.filter, "debug");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = Config::builder()
            .config_path(Some(PathBuf::from("/nonexistent/tether.toml")))
            .build();
        assert!(result.is_err());
    }
}
