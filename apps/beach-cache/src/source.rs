use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use cache_sdk::group::Loader;
use cache_sdk::LoadError;
use tracing::info;

/// Rows served by the `scores` group when no source file is configured.
pub fn demo_scores() -> HashMap<String, String> {
    [("Tom", "630"), ("Jack", "589"), ("Sam", "567")]
        .into_iter()
        .map(|(name, score)| (name.to_string(), score.to_string()))
        .collect()
}

/// Read a flat JSON object of string keys and string values.
pub fn read_table(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read source file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("source file {} is not a JSON object of strings", path.display()))
}

/// In-memory table standing in for a slow backing database.
pub struct TableLoader {
    table: String,
    rows: HashMap<String, String>,
}

impl TableLoader {
    pub fn new(table: impl Into<String>, rows: HashMap<String, String>) -> Self {
        Self {
            table: table.into(),
            rows,
        }
    }
}

#[async_trait]
impl Loader for TableLoader {
    async fn load(&self, key: &str) -> Result<Bytes, LoadError> {
        info!(table = %self.table, key, "searching backing table");
        self.rows
            .get(key)
            .map(|value| Bytes::from(value.clone()))
            .ok_or_else(|| LoadError::NotFound(key.to_string()))
    }
}
