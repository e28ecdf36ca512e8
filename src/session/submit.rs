//! Preparation & persistence of a session's final submission.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::models::catalog::Catalog;
use crate::models::descriptor::{Descriptor, FieldValues};
use crate::runner::{CATALOG_FILE, TAP_CONFIG_FILE, TARGET_CONFIG_FILE};

/// The tap config key under which the replication start date is written.
pub const START_DATE_KEY: &str = "start_date";

/// A request to submit a session's edited catalog along with the target's config.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubmitRequest {
    /// Values for the target's configurable fields.
    #[serde(default)]
    pub field_values: FieldValues,
    /// The date from which replication should start, as `YYYY-MM-DD`.
    #[serde(default)]
    pub start_date: Option<String>,
    /// A complete catalog replacing the session's edited catalog.
    #[serde(default)]
    pub catalog: Option<Value>,
}

/// A validated submission, ready to be persisted.
#[derive(Clone, Debug)]
pub struct Submission {
    pub tap_config: Map<String, Value>,
    pub target_config: FieldValues,
    pub catalog: Catalog,
}

impl Submission {
    /// Validate the given request against the session's selections, building a submission.
    ///
    /// Nothing is persisted and no process is started when this fails.
    pub fn prepare(request: SubmitRequest, target: &Descriptor, tap_config: &FieldValues, current: &Catalog) -> Result<Self> {
        let catalog = match request.catalog {
            Some(raw) => Catalog::from_value(raw).map_err(AppError::from)?,
            None => current.clone(),
        };
        target.validate_values(&request.field_values)?;
        catalog.validate_selection().map_err(AppError::InvalidInput)?;

        let mut tap_config: Map<String, Value> = tap_config.clone().into_iter().collect();
        if let Some(date) = request.start_date.as_deref().map(str::trim).filter(|date| !date.is_empty()) {
            parse_start_date(date)?;
            if catalog.has_replication_keys() {
                tap_config.insert(START_DATE_KEY.into(), Value::String(format!("{}T00:00:00Z", date)));
            } else {
                tracing::warn!(start_date = date, "start date will be ignored as no replication keys are selected");
            }
        }

        Ok(Self {
            tap_config,
            target_config: request.field_values,
            catalog,
        })
    }

    /// Write the tap config, target config & catalog files into the given work directory.
    pub async fn persist(&self, workdir: &Path) -> Result<()> {
        write_json(&workdir.join(TAP_CONFIG_FILE), &Value::Object(self.tap_config.clone())).await?;
        write_json(&workdir.join(TARGET_CONFIG_FILE), &serde_json::to_value(&self.target_config).context("error encoding target config")?).await?;
        let catalog = self.catalog.serialize().map_err(AppError::from)?;
        write_file(&workdir.join(CATALOG_FILE), catalog).await
    }
}

/// Parse a replication start date given as `YYYY-MM-DD`.
pub fn parse_start_date(raw: &str) -> Result<time::Date> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    time::Date::parse(raw, format).map_err(|_| anyhow::Error::from(AppError::InvalidInput(format!("start date {:?} must be a date of the form YYYY-MM-DD", raw))))
}

/// Write the given JSON value to the given path.
pub async fn write_json(path: &Path, value: &Value) -> Result<()> {
    let raw = serde_json::to_string_pretty(value).context("error encoding JSON file")?;
    write_file(path, raw).await
}

async fn write_file(path: &Path, contents: String) -> Result<()> {
    tokio::fs::write(path, contents).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::PermissionDenied => anyhow::Error::from(AppError::FilesystemAccessDenied(format!("{}: {}", path.display(), err))),
        _ => anyhow::Error::from(err).context(format!("error writing {}", path.display())),
    })
}
