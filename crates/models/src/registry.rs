//! Read-only model registry.
//!
//! The registry is an external data table; the runtime only consumes it to
//! direct downloads and validate loaded models' sizes.

use serde::{Deserialize, Serialize};

/// What a model file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Text generation model.
    Text,
    /// Vision-language backbone.
    VisionBackbone,
    /// Multimodal projector paired with a backbone.
    VisionProjector,
}

/// One downloadable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Stable identifier.
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Exact file size in bytes.
    pub size_bytes: u64,
    /// Download URL.
    pub url: String,
    /// Lowercase hex SHA-256 of the file.
    pub sha256: String,
    /// Container format (e.g. `gguf`).
    pub format: String,
    /// Quantization label (e.g. `q4_k_m`).
    pub quantization: String,
    /// Model role.
    pub kind: ModelKind,
}

/// Immutable lookup table of model entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    /// Build a registry from entries.
    #[must_use]
    pub fn from_entries(entries: Vec<ModelEntry>) -> Self {
        Self { entries }
    }

    /// Parse a registry from its JSON data table.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Look up an entry by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// All entries.
    #[must_use]
    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
