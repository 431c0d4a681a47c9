//! Scheduler configuration (YAML / env loading)

use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

pub const MAX_PARALLELISM: usize = 1024;

pub const ENV_PARALLEL: &str = "STAGEGRAPH_PARALLEL";
pub const ENV_PARALLELISM: &str = "STAGEGRAPH_PARALLELISM";
pub const ENV_FAIL_FAST: &str = "STAGEGRAPH_FAIL_FAST";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run independent stages concurrently
    pub parallel: bool,
    /// Upper bound on concurrently running stages (0 = one per stage)
    pub parallelism: usize,
    /// Cancel pending stages after the first failure
    pub fail_fast: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            parallelism: 0,
            fail_fast: false,
        }
    }
}

/// YAML Schema v1
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFileV1 {
    version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    parallel: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    parallelism: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    fail_fast: Option<bool>,
}

impl SchedulerConfig {
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Bound handed to the executor
    pub fn effective_parallelism(&self) -> usize {
        if self.parallel {
            self.parallelism
        } else {
            1
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism > MAX_PARALLELISM {
            return Err(SchedulerError::config(format!(
                "parallelism {} exceeds maximum {}",
                self.parallelism, MAX_PARALLELISM
            )));
        }
        Ok(())
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: ConfigFileV1 = serde_yaml::from_str(content)?;
        if file.version != 1 {
            return Err(SchedulerError::config(format!(
                "unsupported config version {} (supported: 1)",
                file.version
            )));
        }

        let defaults = Self::default();
        let config = Self {
            parallel: file.parallel.unwrap_or(defaults.parallel),
            parallelism: file.parallelism.unwrap_or(defaults.parallelism),
            fail_fast: file.fail_fast.unwrap_or(defaults.fail_fast),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String> {
        let file = ConfigFileV1 {
            version: 1,
            parallel: Some(self.parallel),
            parallelism: Some(self.parallelism),
            fail_fast: Some(self.fail_fast),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    /// Apply `STAGEGRAPH_*` environment variables on top of `self`
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_PARALLEL) {
            self.parallel = parse_bool(ENV_PARALLEL, &v)?;
        }
        if let Some(v) = lookup(ENV_PARALLELISM) {
            self.parallelism = parse_value(ENV_PARALLELISM, &v)?;
        }
        if let Some(v) = lookup(ENV_FAIL_FAST) {
            self.fail_fast = parse_bool(ENV_FAIL_FAST, &v)?;
        }
        self.validate()?;
        Ok(self)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SchedulerError::config(format!(
            "{}: expected a boolean, got {:?}",
            key, other
        ))),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SchedulerError::config(format!("{}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.parallel);
        assert_eq!(config.parallelism, 0);
        assert!(!config.fail_fast);
        assert_eq!(config.effective_parallelism(), 0);
        assert_eq!(SchedulerConfig::sequential().effective_parallelism(), 1);
    }

    #[test]
    fn test_sequential_ignores_parallelism() {
        let config = SchedulerConfig::sequential().with_parallelism(8);
        assert_eq!(config.effective_parallelism(), 1);
    }

    #[test]
    fn test_yaml_loading() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"version: 1\nparallelism: 4\nfail_fast: true\n")
            .unwrap();

        let config = SchedulerConfig::from_yaml(temp_file.path()).unwrap();
        assert!(config.parallel);
        assert_eq!(config.parallelism, 4);
        assert!(config.fail_fast);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = SchedulerConfig::default().with_parallelism(3);
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        assert_eq!(SchedulerConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_yaml_missing_version() {
        assert!(SchedulerConfig::from_yaml_str("parallelism: 2\n").is_err());
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let result = SchedulerConfig::from_yaml_str("version: 2\n");
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_yaml_unknown_field() {
        let result = SchedulerConfig::from_yaml_str("version: 1\nworkers: 3\n");
        assert!(matches!(result, Err(SchedulerError::Yaml(_))));
    }

    #[test]
    fn test_validate_upper_bound() {
        let config = SchedulerConfig::default().with_parallelism(MAX_PARALLELISM + 1);
        assert!(matches!(config.validate(), Err(SchedulerError::Config(_))));
        assert!(SchedulerConfig::from_yaml_str("version: 1\nparallelism: 5000\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = SchedulerConfig::default()
            .with_overrides_from(env(&[
                (ENV_PARALLEL, "false"),
                (ENV_PARALLELISM, " 6 "),
                (ENV_FAIL_FAST, "1"),
            ]))
            .unwrap();

        assert!(!config.parallel);
        assert_eq!(config.parallelism, 6);
        assert!(config.fail_fast);
    }

    #[test]
    fn test_env_overrides_absent_keep_values() {
        let base = SchedulerConfig::default().with_parallelism(2);
        let config = base.with_overrides_from(env(&[])).unwrap();
        assert_eq!(config, base);
    }

    #[test]
    fn test_env_overrides_malformed() {
        let result =
            SchedulerConfig::default().with_overrides_from(env(&[(ENV_PARALLELISM, "many")]));
        assert!(matches!(result, Err(SchedulerError::Config(_))));

        let result =
            SchedulerConfig::default().with_overrides_from(env(&[(ENV_FAIL_FAST, "maybe")]));
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }
}
