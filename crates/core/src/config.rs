//! Scoped hierarchical configuration store.
//!
//! Values are addressed by `(section, key)` and live in one of several
//! [`Scope`]s. A read returns the value from the highest scope that defines
//! the key, so benchmark-level settings override application defaults
//! without mutating them.
//!
//! Keys keep their dotted form (`distribution.version`), matching how
//! options are named on the command line and in configuration files.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::result::{Result, ResultExt};

/// Precedence layer of a configuration value. Later variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Defaults loaded from the configuration file.
    Application,
    /// Overrides supplied for the whole process (e.g. command line).
    ApplicationOverride,
    /// Values derived while setting up a single benchmark.
    Benchmark,
    /// Per-benchmark overrides that must win over everything else.
    BenchmarkOverride,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Layer {
    scope: Scope,
    sections: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Scoped key-value configuration.
///
/// Cloning is cheap enough for the sizes involved; each actor receives its
/// own copy and never mutates a shared instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    layers: Vec<Layer>,
}

impl Config {
    /// Create an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document into the application scope.
    ///
    /// Every top-level table is a section. Nested tables inside a section are
    /// flattened into dotted keys, so `distribution.version = "2.11.0"` under
    /// `[builder]` is read back as `("builder", "distribution.version")`.
    ///
    /// # Errors
    ///
    /// Returns `TomlParseFailed` if the document is not valid TOML or a
    /// top-level entry is not a table.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let table: toml::Table =
            toml::from_str(document).map_err(|e| Error::toml_parse_failed(e.to_string()))?;

        let mut config = Self::new();
        for (section, value) in table {
            let toml::Value::Table(entries) = value else {
                return Err(Error::toml_parse_failed(format!(
                    "top-level entry [{section}] must be a table"
                )));
            };
            let mut flat = BTreeMap::new();
            flatten_into(&mut flat, "", entries)?;
            for (key, value) in flat {
                config.add(Scope::Application, &section, key, value);
            }
        }
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the file cannot be read, or any error of
    /// [`Config::from_toml_str`].
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml_str(&document)
    }

    /// Set a value in the given scope, replacing any previous value there.
    pub fn add(
        &mut self,
        scope: Scope,
        section: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) {
        let position = match self
            .layers
            .binary_search_by(|layer| layer.scope.cmp(&scope))
        {
            Ok(found) => found,
            Err(insert_at) => {
                self.layers.insert(
                    insert_at,
                    Layer {
                        scope,
                        sections: BTreeMap::new(),
                    },
                );
                insert_at
            }
        };
        if let Some(layer) = self.layers.get_mut(position) {
            layer
                .sections
                .entry(section.into())
                .or_default()
                .insert(key.into(), value.into());
        }
    }

    /// The effective raw value for `(section, key)`, if any scope defines it.
    #[must_use]
    pub fn opt(&self, section: &str, key: &str) -> Option<&Value> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.sections.get(section).and_then(|s| s.get(key)))
    }

    /// Whether any scope defines `(section, key)`.
    #[must_use]
    pub fn exists(&self, section: &str, key: &str) -> bool {
        self.opt(section, key).is_some()
    }

    /// Read a mandatory value.
    ///
    /// # Errors
    ///
    /// Returns `MissingConfigKey` when the key is absent and
    /// `InvalidConfigValue` when it cannot be converted to `T`.
    pub fn opts<T: DeserializeOwned>(&self, section: &str, key: &str) -> Result<T> {
        let value = self
            .opt(section, key)
            .ok_or_else(|| Error::missing_config_key(section, key))?;
        convert(section, key, value)
    }

    /// Read an optional value, falling back to `default` when absent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfigValue` when the key is present but cannot be
    /// converted to `T`.
    pub fn opts_or<T: DeserializeOwned>(&self, section: &str, key: &str, default: T) -> Result<T> {
        self.opt(section, key)
            .map_or(Ok(default), |value| convert(section, key, value))
    }

    /// Read an optional value, treating a value of the wrong type as absent.
    #[must_use]
    pub fn opt_as<T: DeserializeOwned>(&self, section: &str, key: &str) -> Option<T> {
        self.opt(section, key)
            .and_then(|value| convert(section, key, value).into_option_logged())
    }

    /// A copy that only retains the listed sections, across all scopes.
    #[must_use]
    pub fn filtered(&self, sections: &[&str]) -> Self {
        let layers = self
            .layers
            .iter()
            .map(|layer| Layer {
                scope: layer.scope,
                sections: layer
                    .sections
                    .iter()
                    .filter(|(name, _)| sections.contains(&name.as_str()))
                    .map(|(name, entries)| (name.clone(), entries.clone()))
                    .collect(),
            })
            .filter(|layer| !layer.sections.is_empty())
            .collect();
        Self { layers }
    }

    /// Names of all sections defined in any scope.
    #[must_use]
    pub fn section_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .layers
            .iter()
            .flat_map(|layer| layer.sections.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

fn convert<T: DeserializeOwned>(section: &str, key: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::invalid_config_value(section, key, e.to_string()))
}

fn flatten_into(out: &mut BTreeMap<String, Value>, prefix: &str, table: toml::Table) -> Result<()> {
    for (key, value) in table {
        let full_key = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(nested) => flatten_into(out, &full_key, nested)?,
            other => {
                let json = serde_json::to_value(other)
                    .map_err(|e| Error::toml_parse_failed(format!("[{full_key}]: {e}")))?;
                out.insert(full_key, json);
            }
        }
    }
    Ok(())
}
