//! Model persistence adapter.
//!
//! Each registered model type owns one JSON document named after its type
//! tag under the configured base directory:
//!
//! ```text
//! <base>/Telemetry.json
//! <base>/System.json
//! ```
//!
//! Missing and corrupt documents are never fatal to a load; the model keeps
//! its constructor defaults. The adapter provides no multi-writer protection,
//! callers hold the type's session lock while caching.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::CacheError;
use crate::model::{json_kind, Document, StateModel, TypeTag};

/// Result of hydrating a model from its cached document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The document was read and applied to the model.
    Hydrated,
    /// No document exists (or caching is not configured).
    Missing,
    /// The document could not be decoded and was deleted.
    Corrupt,
}

/// File-backed document store for state models.
#[derive(Debug, Clone, Default)]
pub struct ModelCache {
    base_path: Option<PathBuf>,
}

impl ModelCache {
    pub fn new(base_path: Option<PathBuf>) -> Self {
        Self { base_path }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.cache_base_path.clone())
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    /// Path of the document for a type, if a base directory is configured.
    pub fn document_path(&self, tag: TypeTag) -> Option<PathBuf> {
        self.base_path
            .as_ref()
            .map(|base| base.join(format!("{}.json", tag.as_str())))
    }

    /// Serialize a model and overwrite its cached document.
    ///
    /// The document is written to a temporary sibling first and renamed into
    /// place, so readers never observe a partially written file.
    pub fn cache<T: StateModel>(&self, model: &T) -> Result<PathBuf, CacheError> {
        let base = self.base_path.as_ref().ok_or(CacheError::NullCachePath)?;
        if !base.is_dir() {
            return Err(CacheError::CachePath { path: base.clone() });
        }

        let document = model.dump().map_err(CacheError::Serialize)?;
        let payload = serde_json::to_vec(&document)?;

        let path = base.join(format!("{}.json", T::TYPE_TAG));
        let temp_path = base.join(format!("{}.json.tmp.{}", T::TYPE_TAG, Uuid::new_v4()));

        fs::write(&temp_path, &payload).map_err(|source| CacheError::Io {
            path: temp_path.clone(),
            source,
        })?;
        if let Err(source) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(CacheError::Io { path, source });
        }

        debug!("Cached state model {} to {}", T::TYPE_TAG, path.display());
        Ok(path)
    }

    /// Hydrate `model` from its cached document.
    ///
    /// The document is applied to a copy and only swapped in on success, so a
    /// rejected document leaves `model` untouched.
    pub fn load<T: StateModel>(&self, model: &mut T) -> LoadOutcome {
        let tag = TypeTag::of::<T>();
        let Some(path) = self.document_path(tag) else {
            warn!("Cache base path unset, {} keeps its defaults", tag);
            return LoadOutcome::Missing;
        };

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Model {} not found in caching directory", tag);
                return LoadOutcome::Missing;
            }
            Err(e) => {
                warn!("Failed to read cached document {}: {}", path.display(), e);
                return LoadOutcome::Missing;
            }
        };

        let document = match decode_document(&bytes) {
            Ok(document) => document,
            Err(reason) => {
                error!("Model cache document corrupt: {}: {}", path.display(), reason);
                self.discard(&path);
                return LoadOutcome::Corrupt;
            }
        };

        let mut hydrated = model.clone();
        if let Err(e) = hydrated.hydrate(&document) {
            error!(
                "Model cache document rejected by {}: {}: {}",
                tag,
                path.display(),
                e
            );
            self.discard(&path);
            return LoadOutcome::Corrupt;
        }

        *model = hydrated;
        debug!("Loaded state model {} from {}", tag, path.display());
        LoadOutcome::Hydrated
    }

    /// Delete the cached document for a type.
    ///
    /// Returns whether a document was removed; a missing document is not an
    /// error.
    pub fn clear(&self, tag: TypeTag) -> Result<bool, CacheError> {
        let Some(path) = self.document_path(tag) else {
            return Ok(false);
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed cached document: {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    fn discard(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed corrupt document: {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove corrupt document {}: {}", path.display(), e),
        }
    }
}

fn decode_document(bytes: &[u8]) -> Result<Document, String> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected an object, got {}", json_kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}
