//! Configuration
//!
//! Layered: built-in defaults, then an optional TOML/YAML/JSON file, then
//! `FNFIG_` environment variables (`FNFIG_SIMULATOR__WORKER_POOL_SIZE=4`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the config file when none is passed explicitly
pub const CONFIG_PATH_ENV: &str = "FNFIG_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Default tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            simulator: SimulatorConfig::default(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// How the simulator honors a step's requested `wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseMode {
    /// Sleep for exactly the requested number of seconds
    Honor,
    /// Sleep `fixed_pause_ms` whatever was requested
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Upper bound on fan-out workers running at once
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_pause")]
    pub pause: PauseMode,

    #[serde(default = "default_fixed_pause_ms")]
    pub fixed_pause_ms: u64,

    /// Abort the remaining fan-out workers as soon as one fails
    #[serde(default = "default_true")]
    pub fail_fast: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            pause: default_pause(),
            fixed_pause_ms: default_fixed_pause_ms(),
            fail_fast: true,
        }
    }
}

impl SimulatorConfig {
    /// Actual sleep for a requested wait of `seconds`
    pub fn pause_for(&self, seconds: u64) -> Duration {
        match self.pause {
            PauseMode::Honor => Duration::from_secs(seconds),
            PauseMode::Fixed => Duration::from_millis(self.fixed_pause_ms),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_pause() -> PauseMode {
    PauseMode::Honor
}

fn default_fixed_pause_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/* ===================== Loading ===================== */

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load using `FNFIG_CONFIG_PATH` (if set) and the environment
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::builder().build()
    }
}

#[derive(Debug)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    use_env: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            config_path: None,
            use_env: true,
        }
    }
}

impl ConfigBuilder {
    /// Config file to read; overrides `FNFIG_CONFIG_PATH`
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Skip `FNFIG_` environment variables
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    pub fn build(self) -> Result<Config, config::ConfigError> {
        let path = self
            .config_path
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));

        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        if self.use_env {
            builder = builder.add_source(
                config::Environment::with_prefix("FNFIG")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.simulator.worker_pool_size == 0 {
            return Err(config::ConfigError::Message(
                "simulator.worker_pool_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str, extension: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "fnfig-config-{}.{}",
            uuid::Uuid::new_v4(),
            extension
        ));
        let mut file = std::fs::File::create(&path).expect("create temp config");
        file.write_all(contents.as_bytes()).expect("write temp config");
        path
    }

    #[test]
    fn test_defaults() {
        let config = Config::builder().without_env().build().unwrap();

        assert_eq!(config.simulator.pause, PauseMode::Honor);
        assert_eq!(config.simulator.fixed_pause_ms, 1000);
        assert!(config.simulator.fail_fast);
        assert!(config.simulator.worker_pool_size >= 1);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = write_temp(
            r#"
log_level = "debug"

[simulator]
worker_pool_size = 3
pause = "fixed"
fixed_pause_ms = 50
"#,
            "toml",
        );

        let config = Config::builder()
            .config_path(Some(path.clone()))
            .without_env()
            .build()
            .unwrap();
        std::fs::remove_file(path).ok();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.simulator.worker_pool_size, 3);
        assert_eq!(config.simulator.pause, PauseMode::Fixed);
        assert_eq!(config.simulator.fixed_pause_ms, 50);
        assert!(config.simulator.fail_fast);
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let path = write_temp("[simulator]\nworker_pool_size = 0\n", "toml");
        let result = Config::builder()
            .config_path(Some(path.clone()))
            .without_env()
            .build();
        std::fs::remove_file(path).ok();

        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = Config::builder()
            .config_path(Some(PathBuf::from("/nonexistent/fnfig.toml")))
            .without_env()
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_pause_modes() {
        let mut simulator = SimulatorConfig::default();
        assert_eq!(simulator.pause_for(2), Duration::from_secs(2));

        simulator.pause = PauseMode::Fixed;
        simulator.fixed_pause_ms = 10;
        assert_eq!(simulator.pause_for(2), Duration::from_millis(10));
    }
}
