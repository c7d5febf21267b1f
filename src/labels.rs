//! The ordered label set a classification model was trained on.
//!
//! Scores arrive as bare probability vectors; the label set is what turns an index into a
//! command. It is fixed once loaded, and one designated label is treated as a catch-all that is
//! never forwarded to the device.

use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

/// Label treated as non-actionable when no other is configured.
pub const DEFAULT_BACKGROUND_LABEL: &str = "Background Noise";

/// Metadata file published next to a Teachable Machine audio model.
const METADATA_FILE_NAME: &str = "metadata.json";

/// An ordered, non-empty set of class labels plus the designated background label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    names: Vec<String>,
    background: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelMetadata {
    word_labels: Vec<String>,
}

impl Labels {
    /// Build a label set from explicit names.
    ///
    /// The background label does not have to appear in `names`; when it doesn't, no event is
    /// ever background-suppressed.
    pub fn new<I, S>(names: I, background: impl Into<String>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(Error::Labels("at least one label is required".to_owned()));
        }

        Ok(Self {
            names,
            background: background.into(),
        })
    }

    /// Parse the `wordLabels` field of a model's `metadata.json`.
    pub fn from_metadata_json(bytes: &[u8], background: impl Into<String>) -> Result<Self> {
        let metadata: ModelMetadata = serde_json::from_slice(bytes)?;
        Self::new(metadata.word_labels, background)
    }

    /// Load labels from a `metadata.json` file on disk.
    pub fn from_metadata_file(path: impl AsRef<Path>, background: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| {
            Error::msg(format!(
                "failed to read model metadata from '{}': {err}",
                path.display()
            ))
        })?;
        Self::from_metadata_json(&bytes, background)
    }

    /// Fetch `metadata.json` from a model base URL (e.g. `http://localhost:8000/model/`).
    #[cfg(feature = "remote")]
    pub async fn from_model_url(base_url: &str, background: impl Into<String>) -> Result<Self> {
        let url = metadata_url(base_url);
        tracing::info!(%url, "fetching model metadata");

        let bytes = reqwest::get(&url)
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Self::from_metadata_json(&bytes, background)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always `false`; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn background(&self) -> &str {
        &self.background
    }

    pub fn is_background(&self, label: &str) -> bool {
        label == self.background
    }
}

#[cfg_attr(not(feature = "remote"), allow(dead_code))]
pub(crate) fn metadata_url(base_url: &str) -> String {
    let trimmed = base_url.trim();
    if trimmed.ends_with(METADATA_FILE_NAME) {
        trimmed.to_owned()
    } else if trimmed.ends_with('/') {
        format!("{trimmed}{METADATA_FILE_NAME}")
    } else {
        format!("{trimmed}/{METADATA_FILE_NAME}")
    }
}
