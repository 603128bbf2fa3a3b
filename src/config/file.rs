// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File-based configuration provider.

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use super::ConfigError;
use super::ConfigProvider;

/// Supported file formats for configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
    /// `.yaml` or `.yml`
    Yaml,
}

impl FileFormat {
    /// Detect the file format from the file extension.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            "yaml" | "yml" => Some(FileFormat::Yaml),
            _ => None,
        }
    }
}

/// Configuration read once from a JSON, TOML or YAML document.
///
/// Keys are addressed with dots (`proxy.forward.http.host`) and resolved
/// against the nested document.
#[derive(Debug)]
pub struct FileConfigProvider {
    path: PathBuf,
    root: Map<String, Value>,
}

impl FileConfigProvider {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let path = PathBuf::from(path);
        let format = FileFormat::from_extension(&path)
            .ok_or_else(|| ConfigError::provider_error("file", "unsupported file format"))?;

        let content = fs::read_to_string(&path).map_err(|e| {
            ConfigError::provider_error("file", format!("failed to read {}: {e}", path.display()))
        })?;
        let root = Self::parse(&content, format)?;

        Ok(Self { path, root })
    }

    /// Location this provider was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(content: &str, format: FileFormat) -> Result<Map<String, Value>, ConfigError> {
        let value = match format {
            FileFormat::Json => serde_json::from_str::<Value>(content)
                .map_err(|e| ConfigError::provider_error("file", format!("invalid JSON: {e}")))?,
            FileFormat::Toml => {
                let toml_value: toml::Value = toml::from_str(content).map_err(|e| {
                    ConfigError::provider_error("file", format!("invalid TOML: {e}"))
                })?;
                serde_json::to_value(toml_value).map_err(|e| {
                    ConfigError::provider_error("file", format!("failed to convert TOML: {e}"))
                })?
            }
            FileFormat::Yaml => {
                let yaml_value: serde_yaml::Value = serde_yaml::from_str(content).map_err(|e| {
                    ConfigError::provider_error("file", format!("invalid YAML: {e}"))
                })?;
                serde_json::to_value(yaml_value).map_err(|e| {
                    ConfigError::provider_error("file", format!("failed to convert YAML: {e}"))
                })?
            }
        };

        match value {
            Value::Object(map) => Ok(map),
            _ => Err(ConfigError::provider_error(
                "file",
                "root configuration must be an object",
            )),
        }
    }

    fn lookup(&self, key_path: &str) -> Option<&Value> {
        let mut parts = key_path.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                other => other.get(part)?,
            };
        }
        Some(current)
    }
}

impl ConfigProvider for FileConfigProvider {
    fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    fn provider_name(&self) -> &str {
        "file"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.lookup(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigProviderExt;
    use std::io::Write;
    use tempfile::Builder;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_toml_nested_lookup() {
        let file = write_temp(
            ".toml",
            r#"
            [proxy]
            methods_whitelist = ["GET", "POST"]

            [proxy.forward.http]
            host = "squid.local"
            port = 3128
            "#,
        );
        let provider = FileConfigProvider::new(file.path().to_str().unwrap()).unwrap();

        let methods: Vec<String> = provider.get("proxy.methods_whitelist").unwrap().unwrap();
        assert_eq!(methods, vec!["GET", "POST"]);
        let port: u16 = provider.get("proxy.forward.http.port").unwrap().unwrap();
        assert_eq!(port, 3128);
        assert!(!provider.has("proxy.forward.https.host"));
    }

    #[test]
    fn test_yaml_and_json_are_equivalent() {
        let yaml = write_temp(".yml", "proxy:\n  stream_chunk_size: 2048\n");
        let json = write_temp(".json", r#"{"proxy": {"stream_chunk_size": 2048}}"#);

        let from_yaml = FileConfigProvider::new(yaml.path().to_str().unwrap()).unwrap();
        let from_json = FileConfigProvider::new(json.path().to_str().unwrap()).unwrap();

        assert_eq!(
            from_yaml.get_raw("proxy.stream_chunk_size").unwrap(),
            from_json.get_raw("proxy.stream_chunk_size").unwrap()
        );
    }

    #[test]
    fn test_array_index_lookup() {
        let file = write_temp(".json", r#"{"proxy": {"checkers": [{"type": "audit"}]}}"#);
        let provider = FileConfigProvider::new(file.path().to_str().unwrap()).unwrap();

        let kind: String = provider.get("proxy.checkers.0.type").unwrap().unwrap();
        assert_eq!(kind, "audit");
    }

    #[test]
    fn test_unsupported_extension_is_rejected() {
        let file = write_temp(".ini", "a=b");
        let err = FileConfigProvider::new(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("unsupported file format"));
    }

    #[test]
    fn test_non_object_root_is_rejected() {
        let file = write_temp(".json", "[1, 2, 3]");
        let err = FileConfigProvider::new(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("root configuration must be an object"));
    }
}
