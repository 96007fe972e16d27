//! YAML loading with tag substitution
//!
//! Resolved tags:
//! - `!secret key` - value from `secrets.yaml`
//! - `!env_var NAME` - value of an environment variable
//! - `!include file.yaml` - another YAML file, relative to the including one

use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use tracing::{debug, trace};

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;

/// Loader that resolves custom tags while reading YAML
pub struct YamlLoader {
    config_dir: PathBuf,
    secrets: Secrets,
    include_stack: Vec<PathBuf>,
}

impl YamlLoader {
    /// Create a loader for `config_dir`, reading its secrets file
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            include_stack: Vec::new(),
        }
    }

    /// Load a file relative to the config directory
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.config_dir.join(path.as_ref());
        self.load_path(path)
    }

    /// Load a file whose path is already resolved against the config directory
    fn load_path(&mut self, path: PathBuf) -> ConfigResult<Value> {
        if self.include_stack.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }

        debug!(path = %path.display(), "Loading YAML file");
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.include_stack.push(path.clone());
        let result = self.load_str(&content, &path);
        self.include_stack.pop();
        result
    }

    /// Parse `content` and resolve its tags; `origin` is used for errors and includes
    pub fn load_str(&mut self, content: &str, origin: &Path) -> ConfigResult<Value> {
        let value: Value = serde_yaml::from_str(content).map_err(|source| {
            ConfigError::ParseYaml {
                path: origin.to_path_buf(),
                source,
            }
        })?;
        self.resolve(value, origin)
    }

    fn resolve(&mut self, value: Value, origin: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.resolve_tag(*tagged, origin),
            Value::Mapping(map) => {
                let mut resolved = Mapping::with_capacity(map.len());
                for (key, value) in map {
                    resolved.insert(key, self.resolve(value, origin)?);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(items) => items
                .into_iter()
                .map(|item| self.resolve(item, origin))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn resolve_tag(&mut self, tagged: TaggedValue, origin: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(tag = %tag, "Resolving tag");

        let argument = match tagged.value {
            Value::String(s) => s,
            _ => return Err(ConfigError::invalid(&tag, "tag argument must be a string")),
        };

        match tag.as_str() {
            "!secret" => {
                let secret = self.secrets.get(&argument)?;
                debug!(key = %argument, "Substituted secret");
                Ok(Value::String(secret.to_string()))
            }
            "!env_var" => std::env::var(&argument)
                .map(Value::String)
                .map_err(|_| ConfigError::EnvVarNotFound { var: argument }),
            "!include" => {
                let base = origin.parent().unwrap_or(&self.config_dir).to_path_buf();
                self.load_path(base.join(argument))
            }
            _ => Err(ConfigError::invalid(tag, "unsupported tag")),
        }
    }

    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lookup<'a>(value: &'a Value, key: &str) -> &'a Value {
        value.get(key).unwrap()
    }

    #[test]
    fn test_secret_substitution() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("secrets.yaml"), "hub_token: abc\n").unwrap();
        fs::write(dir.path().join("c.yaml"), "hub:\n  token: !secret hub_token\n").unwrap();

        let mut loader = YamlLoader::new(dir.path()).unwrap();
        let value = loader.load_file("c.yaml").unwrap();
        assert_eq!(lookup(lookup(&value, "hub"), "token").as_str(), Some("abc"));
    }

    #[test]
    fn test_missing_secret() {
        let mut loader = YamlLoader::with_secrets("/nonexistent", Secrets::default());
        let result = loader.load_str("token: !secret nope\n", Path::new("inline"));
        assert!(matches!(result, Err(ConfigError::SecretNotFound { key }) if key == "nope"));
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("HD_CONFIG_TEST_HOST", "hub.lan");
        let mut loader = YamlLoader::with_secrets("/nonexistent", Secrets::default());
        let value = loader
            .load_str("host: !env_var HD_CONFIG_TEST_HOST\n", Path::new("inline"))
            .unwrap();
        assert_eq!(lookup(&value, "host").as_str(), Some("hub.lan"));
        std::env::remove_var("HD_CONFIG_TEST_HOST");

        let result = loader.load_str("host: !env_var HD_CONFIG_UNSET_VAR\n", Path::new("inline"));
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound { .. })));
    }

    #[test]
    fn test_include_and_cycle() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("logging.yaml"), "level: debug\n").unwrap();
        fs::write(dir.path().join("main.yaml"), "logging: !include logging.yaml\n").unwrap();
        fs::write(dir.path().join("a.yaml"), "b: !include b.yaml\n").unwrap();
        fs::write(dir.path().join("b.yaml"), "a: !include a.yaml\n").unwrap();

        let mut loader = YamlLoader::new(dir.path()).unwrap();
        let value = loader.load_file("main.yaml").unwrap();
        assert_eq!(lookup(lookup(&value, "logging"), "level").as_str(), Some("debug"));

        let result = loader.load_file("a.yaml");
        assert!(matches!(result, Err(ConfigError::CircularInclude { .. })));
    }

    #[test]
    fn test_include_with_relative_config_dir() {
        let dir = tempfile::Builder::new()
            .prefix("hd-config-")
            .tempdir_in(".")
            .unwrap();
        let relative = dir.path().to_path_buf();
        assert!(relative.is_relative());
        fs::write(relative.join("logging.yaml"), "level: warn\n").unwrap();
        fs::write(relative.join("main.yaml"), "logging: !include logging.yaml\n").unwrap();
        fs::write(relative.join("a.yaml"), "b: !include b.yaml\n").unwrap();
        fs::write(relative.join("b.yaml"), "a: !include a.yaml\n").unwrap();

        let mut loader = YamlLoader::with_secrets(&relative, Secrets::default());
        let value = loader.load_file("main.yaml").unwrap();
        assert_eq!(lookup(lookup(&value, "logging"), "level").as_str(), Some("warn"));

        let result = loader.load_file("a.yaml");
        assert!(matches!(
            result,
            Err(ConfigError::CircularInclude { path }) if path == relative.join("a.yaml")
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut loader = YamlLoader::with_secrets("/nonexistent", Secrets::default());
        let result = loader.load_str("x: !mystery value\n", Path::new("inline"));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
