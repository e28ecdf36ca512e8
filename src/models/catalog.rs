//! The schema catalog emitted by a tap in discovery mode.
//!
//! A catalog is an ordered set of streams, each of which carries a list of metadata entries
//! addressed by breadcrumb. The entry with an empty breadcrumb holds the stream's own metadata,
//! such as whether it is selected for replication and which replication keys it offers.
//!
//! Only the fields this system acts upon are strongly typed. Every other field, at every level
//! of the document, is carried through untouched so that tap-specific metadata survives a
//! parse/edit/serialize cycle.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The metadata field marking a stream as selected for replication.
pub const FIELD_SELECTED: &str = "selected";
/// The metadata field listing the replication keys offered by a stream.
pub const FIELD_VALID_REPLICATION_KEYS: &str = "valid-replication-keys";
/// The metadata field holding the user's chosen replication key.
pub const FIELD_REPLICATION_KEY: &str = "replication-key";
/// The metadata field holding the user's chosen replication method.
pub const FIELD_REPLICATION_METHOD: &str = "replication-method";
/// The metadata field holding a replication method imposed by the tap.
pub const FIELD_FORCED_REPLICATION_METHOD: &str = "forced-replication-method";
/// The replication method which requires a replication key.
pub const REPLICATION_METHOD_INCREMENTAL: &str = "INCREMENTAL";

/// Catalog integrity errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The raw document does not describe a valid catalog.
    #[error("malformed catalog: {0}")]
    MalformedCatalog(String),
    /// A stream does not have exactly one stream-level metadata entry.
    #[error("stream {stream_id} has {found} stream-level metadata entries, expected exactly 1")]
    MissingRootMetadata { stream_id: String, found: usize },
    /// The referenced stream does not exist in the catalog.
    #[error("unknown stream {0}")]
    UnknownStream(String),
    /// The referenced metadata entry does not exist in the stream.
    #[error("stream {stream_id} has no metadata entry at {locator}")]
    UnknownMetadataEntry { stream_id: String, locator: MetadataLocator },
    /// A recognized metadata field was given a value of the wrong type.
    #[error("invalid value for metadata field {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },
}

/// A result type for catalog operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// A tap's discovered schema.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// The streams offered by the tap, in discovery order.
    pub streams: Vec<Stream>,
    /// Any other top-level fields of the document.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single logical table or resource within a catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    /// The stream's display name.
    pub stream: String,
    /// The stream's unique identifier, stable across re-discovery.
    pub tap_stream_id: String,
    /// The stream's metadata entries.
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    /// Any other fields of the stream, such as its JSON schema.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A metadata entry located by breadcrumb.
///
/// Keys absent from the tap's output stay absent on serialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// The path of this entry within the stream; absent or empty for the stream itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    breadcrumb: Option<Vec<String>>,
    /// The entry's metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
    /// Any other fields of the entry.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetadataEntry {
    /// The path of this entry within the stream.
    pub fn breadcrumb(&self) -> &[String] {
        self.breadcrumb.as_deref().unwrap_or(&[])
    }

    /// Whether this is the stream-level entry.
    pub fn is_root(&self) -> bool {
        self.breadcrumb().is_empty()
    }

    /// The entry's metadata, if the tap emitted any.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        self.metadata.get_or_insert_with(Metadata::default)
    }
}

/// An open metadata mapping.
///
/// The raw mapping is kept as emitted, including explicit `null` values. The recognized
/// fields are type checked on parse & on edit, and read through typed accessors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

/// Locates a metadata entry within a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataLocator {
    /// The entry with exactly this breadcrumb.
    Breadcrumb(Vec<String>),
    /// The entry at this position of the stream's metadata list.
    Index(usize),
}

impl MetadataLocator {
    /// A locator for the stream-level entry.
    pub fn root() -> Self {
        Self::Breadcrumb(vec![])
    }
}

impl std::fmt::Display for MetadataLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Breadcrumb(path) => write!(f, "breadcrumb [{}]", path.join(", ")),
            Self::Index(idx) => write!(f, "index {}", idx),
        }
    }
}

impl Catalog {
    /// Parse a catalog from raw JSON text, checking its integrity.
    pub fn parse(raw: &str) -> CatalogResult<Self> {
        let value: Value = serde_json::from_str(raw.trim()).map_err(|err| CatalogError::MalformedCatalog(format!("output is not valid JSON: {}", err)))?;
        Self::from_value(value)
    }

    /// Build a catalog from an already decoded JSON document, checking its integrity.
    pub fn from_value(value: Value) -> CatalogResult<Self> {
        let catalog: Catalog = serde_json::from_value(value).map_err(|err| CatalogError::MalformedCatalog(err.to_string()))?;
        catalog.check_integrity()?;
        Ok(catalog)
    }

    /// Serialize this catalog back into its raw JSON form.
    pub fn serialize(&self) -> CatalogResult<String> {
        serde_json::to_string(self).map_err(|err| CatalogError::MalformedCatalog(err.to_string()))
    }

    /// Serialize this catalog into a JSON document.
    pub fn to_value(&self) -> CatalogResult<Value> {
        serde_json::to_value(self).map_err(|err| CatalogError::MalformedCatalog(err.to_string()))
    }

    /// Ensure stream IDs are unique and every stream has exactly one root metadata entry.
    fn check_integrity(&self) -> CatalogResult<()> {
        let mut seen = HashSet::with_capacity(self.streams.len());
        for stream in self.streams.iter() {
            if !seen.insert(stream.tap_stream_id.as_str()) {
                return Err(CatalogError::MalformedCatalog(format!("duplicate tap_stream_id {}", stream.tap_stream_id)));
            }
            stream.root_metadata().map_err(|err| CatalogError::MalformedCatalog(err.to_string()))?;
            for entry in stream.metadata.iter().filter_map(MetadataEntry::metadata) {
                entry.check_fields().map_err(|err| CatalogError::MalformedCatalog(err.to_string()))?;
            }
        }
        Ok(())
    }

    /// Get the stream with the given ID.
    pub fn stream(&self, stream_id: &str) -> CatalogResult<&Stream> {
        self.streams
            .iter()
            .find(|stream| stream.tap_stream_id == stream_id)
            .ok_or_else(|| CatalogError::UnknownStream(stream_id.into()))
    }

    /// Get a mutable handle to the stream with the given ID.
    pub fn stream_mut(&mut self, stream_id: &str) -> CatalogResult<&mut Stream> {
        self.streams
            .iter_mut()
            .find(|stream| stream.tap_stream_id == stream_id)
            .ok_or_else(|| CatalogError::UnknownStream(stream_id.into()))
    }

    /// Get the stream-level metadata entry of the given stream.
    pub fn root_metadata(&self, stream_id: &str) -> CatalogResult<&MetadataEntry> {
        self.stream(stream_id)?.root_metadata()
    }

    /// Get the value of a metadata field, if present.
    pub fn get_field(&self, stream_id: &str, locator: &MetadataLocator, field: &str) -> CatalogResult<Option<Value>> {
        let entry = self.stream(stream_id)?.entry(locator)?;
        Ok(entry.metadata().and_then(|metadata| metadata.get(field)).cloned())
    }

    /// Set the value of a single metadata field, leaving everything else untouched.
    pub fn set_field(&mut self, stream_id: &str, locator: &MetadataLocator, field: &str, value: Value) -> CatalogResult<()> {
        let entry = self.stream_mut(stream_id)?.entry_mut(locator)?;
        entry.metadata_mut().set(field, value)
    }

    /// The replication keys offered by the given stream.
    ///
    /// An absent or `null` field means the tap offers no keys, and yields an empty list.
    pub fn valid_replication_keys(&self, stream_id: &str) -> Vec<String> {
        self.root_metadata(stream_id)
            .ok()
            .and_then(MetadataEntry::metadata)
            .map(Metadata::valid_replication_keys)
            .unwrap_or_default()
    }

    /// The replication key chosen for the given stream, if any.
    pub fn replication_key(&self, stream_id: &str) -> CatalogResult<Option<String>> {
        Ok(self.stream(stream_id)?.replication_key().map(String::from))
    }

    /// The streams currently selected for replication.
    pub fn selected_streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter().filter(|stream| stream.is_selected())
    }

    /// Check that this catalog is ready to be handed to a target.
    ///
    /// At least one stream must be selected, and every selected stream replicating
    /// incrementally must have a replication key which the tap offers.
    pub fn validate_selection(&self) -> std::result::Result<(), String> {
        if self.selected_streams().next().is_none() {
            return Err("a minimum of one table/stream must be selected".into());
        }
        for stream in self.selected_streams() {
            stream.root_metadata().map_err(|err| err.to_string())?;
            let key = stream.replication_key();
            if stream.requires_replication_key() && key.is_none() {
                return Err(format!("stream {} replicates incrementally and requires a replication key", stream.stream));
            }
            if let Some(key) = key {
                let valid = self.valid_replication_keys(&stream.tap_stream_id);
                if !valid.is_empty() && !valid.iter().any(|valid_key| valid_key == key) {
                    return Err(format!("{} is not a valid replication key for stream {}", key, stream.stream));
                }
            }
        }
        Ok(())
    }

    /// Whether any selected stream has a replication key chosen.
    pub fn has_replication_keys(&self) -> bool {
        self.selected_streams().any(|stream| stream.replication_key().is_some())
    }
}

impl Stream {
    /// Get the unique stream-level metadata entry.
    pub fn root_metadata(&self) -> CatalogResult<&MetadataEntry> {
        let mut roots = self.metadata.iter().filter(|entry| entry.is_root());
        match (roots.next(), roots.count()) {
            (Some(root), 0) => Ok(root),
            (first, rest) => Err(CatalogError::MissingRootMetadata {
                stream_id: self.tap_stream_id.clone(),
                found: first.map_or(0, |_| 1) + rest,
            }),
        }
    }

    fn root_fields(&self) -> Option<&Metadata> {
        self.root_metadata().ok().and_then(MetadataEntry::metadata)
    }

    /// Whether this stream is selected for replication.
    pub fn is_selected(&self) -> bool {
        self.root_fields().and_then(Metadata::selected).unwrap_or(false)
    }

    /// The replication key chosen for this stream, if any.
    pub fn replication_key(&self) -> Option<&str> {
        self.root_fields().and_then(Metadata::replication_key).filter(|key| !key.is_empty())
    }

    /// Whether this stream's replication method requires a replication key.
    pub fn requires_replication_key(&self) -> bool {
        let root = match self.root_fields() {
            Some(root) => root,
            None => return false,
        };
        [FIELD_FORCED_REPLICATION_METHOD, FIELD_REPLICATION_METHOD]
            .iter()
            .filter_map(|field| root.str_field(field))
            .any(|method| method.eq_ignore_ascii_case(REPLICATION_METHOD_INCREMENTAL))
    }

    fn entry(&self, locator: &MetadataLocator) -> CatalogResult<&MetadataEntry> {
        let entry = match locator {
            MetadataLocator::Breadcrumb(path) if path.is_empty() => return self.root_metadata(),
            MetadataLocator::Breadcrumb(path) => self.metadata.iter().find(|entry| entry.breadcrumb() == path.as_slice()),
            MetadataLocator::Index(idx) => self.metadata.get(*idx),
        };
        entry.ok_or_else(|| self.unknown_entry(locator))
    }

    fn entry_mut(&mut self, locator: &MetadataLocator) -> CatalogResult<&mut MetadataEntry> {
        let idx = match locator {
            MetadataLocator::Breadcrumb(path) if path.is_empty() => {
                self.root_metadata()?;
                self.metadata.iter().position(|entry| entry.is_root())
            }
            MetadataLocator::Breadcrumb(path) => self.metadata.iter().position(|entry| entry.breadcrumb() == path.as_slice()),
            MetadataLocator::Index(idx) => Some(*idx).filter(|idx| *idx < self.metadata.len()),
        };
        match idx {
            Some(idx) => Ok(&mut self.metadata[idx]),
            None => Err(self.unknown_entry(locator)),
        }
    }

    fn unknown_entry(&self, locator: &MetadataLocator) -> CatalogError {
        CatalogError::UnknownMetadataEntry {
            stream_id: self.tap_stream_id.clone(),
            locator: locator.clone(),
        }
    }
}

impl Metadata {
    /// Get the raw value of the given field, if present.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Set the value of the given field.
    ///
    /// Recognized fields must be given a value of their declared type or `null`. A `null` value
    /// is stored as given.
    pub fn set(&mut self, field: &str, value: Value) -> CatalogResult<()> {
        check_field(field, &value)?;
        self.0.insert(field.into(), value);
        Ok(())
    }

    pub fn selected(&self) -> Option<bool> {
        self.get(FIELD_SELECTED).and_then(Value::as_bool)
    }

    pub fn replication_key(&self) -> Option<&str> {
        self.str_field(FIELD_REPLICATION_KEY)
    }

    /// The offered replication keys; empty when absent or `null`.
    pub fn valid_replication_keys(&self) -> Vec<String> {
        self.get(FIELD_VALID_REPLICATION_KEYS)
            .and_then(Value::as_array)
            .map(|keys| keys.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default()
    }

    fn str_field(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Check that every recognized field present holds a value of its declared type.
    fn check_fields(&self) -> CatalogResult<()> {
        self.0.iter().try_for_each(|(field, value)| check_field(field, value))
    }
}

/// Check that a recognized field's value decodes into its declared type; `null` is accepted.
fn check_field(field: &str, value: &Value) -> CatalogResult<()> {
    match field {
        FIELD_SELECTED => typed::<bool>(field, value),
        FIELD_VALID_REPLICATION_KEYS => typed::<Vec<String>>(field, value),
        FIELD_REPLICATION_KEY | FIELD_REPLICATION_METHOD | FIELD_FORCED_REPLICATION_METHOD => typed::<String>(field, value),
        _ => Ok(()),
    }
}

fn typed<T: serde::de::DeserializeOwned>(field: &str, value: &Value) -> CatalogResult<()> {
    serde_json::from_value::<Option<T>>(value.clone())
        .map(|_| ())
        .map_err(|err| CatalogError::InvalidFieldValue {
            field: field.into(),
            reason: err.to_string(),
        })
}
