//! Tap & target descriptors, and the registry of available plugins.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// The plugin list bundled with the binary.
const BUILTIN_PLUGINS: &str = include_str!("../../plugins.json");

/// The kind of a pluggable component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Tap,
    Target,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tap => "tap",
            Self::Target => "target",
        }
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a pluggable tap or target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// The plugin's name, e.g. `tap-postgres`.
    pub name: String,
    /// The container image reference of the plugin.
    pub image: String,
    /// The user-configurable fields of the plugin.
    #[serde(default)]
    pub fields: Vec<DescriptorField>,
}

/// A user-configurable field of a plugin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorField {
    /// The key under which the value is written to the plugin's config file.
    pub key: String,
    /// The human readable label of the field.
    pub label: String,
    /// The input type used to render the field, e.g. `text`, `password` or `date`.
    #[serde(rename = "type", default = "DescriptorField::default_input_type")]
    pub input_type: String,
    /// Whether a value must be given for this field.
    #[serde(default)]
    pub required: bool,
}

/// User supplied values for a plugin's configurable fields.
pub type FieldValues = BTreeMap<String, Value>;

impl DescriptorField {
    fn default_input_type() -> String {
        "text".into()
    }
}

impl Descriptor {
    /// Check that this descriptor identifies a runnable plugin.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.image.trim().is_empty() {
            anyhow::bail!(AppError::InvalidInput("plugin descriptors require a name and an image".into()));
        }
        Ok(())
    }

    /// Check the given field values against this descriptor's required fields.
    pub fn validate_values(&self, values: &FieldValues) -> Result<()> {
        self.validate()?;
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| field.required)
            .filter(|field| match values.get(&field.key) {
                None | Some(Value::Null) => true,
                Some(Value::String(val)) => val.trim().is_empty(),
                Some(_) => false,
            })
            .map(|field| field.label.as_str())
            .collect();
        if !missing.is_empty() {
            anyhow::bail!(AppError::InvalidInput(format!("{} requires values for: {}", self.name, missing.join(", "))));
        }
        Ok(())
    }
}

/// The set of taps & targets available for selection.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PluginRegistry {
    #[serde(default)]
    pub taps: Vec<Descriptor>,
    #[serde(default)]
    pub targets: Vec<Descriptor>,
}

impl PluginRegistry {
    /// Load the registry from the given path, or from the built-in list when no path is given.
    pub async fn load(path: Option<&str>) -> Result<Self> {
        let raw = match path {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("error reading plugin list from {}", path))?,
            None => BUILTIN_PLUGINS.to_string(),
        };
        serde_json::from_str(&raw).context("error decoding plugin list")
    }

    /// Get the descriptors of the given kind.
    pub fn of_kind(&self, kind: PluginKind) -> &[Descriptor] {
        match kind {
            PluginKind::Tap => &self.taps,
            PluginKind::Target => &self.targets,
        }
    }
}
