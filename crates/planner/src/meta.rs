//! Graph schema snapshot and the metadata refresh contract.
//!
//! The dispatcher calls [`MetaFetcher::refresh`] synchronously on every
//! dispatch, before compilation. A plan compiled against a stale schema can be
//! invalid, so refresh failures abort the dispatch instead of falling back to
//! the previous snapshot.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use gqd_common::{GqdError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Labels known to the graph store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSchema {
    #[serde(default)]
    pub vertex_labels: BTreeSet<String>,
    #[serde(default)]
    pub edge_labels: BTreeSet<String>,
}

impl GraphSchema {
    pub fn has_vertex_label(&self, label: &str) -> bool {
        self.vertex_labels.contains(label)
    }

    pub fn has_edge_label(&self, label: &str) -> bool {
        self.edge_labels.contains(label)
    }
}

/// Read-mostly schema snapshot shared by the fetcher and the plan compiler.
///
/// Readers take an `Arc` of the current schema; a refresh swaps the pointer and
/// never mutates a published snapshot.
#[derive(Debug, Clone, Default)]
pub struct SharedSchema {
    current: Arc<RwLock<Option<Arc<GraphSchema>>>>,
}

impl SharedSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(schema: GraphSchema) -> Self {
        Self {
            current: Arc::new(RwLock::new(Some(Arc::new(schema)))),
        }
    }

    /// Current snapshot, `None` until the first successful refresh.
    pub fn current(&self) -> Option<Arc<GraphSchema>> {
        self.current.read().ok().and_then(|s| s.clone())
    }

    /// Swap in a new snapshot. Fails with [`GqdError::Metadata`] if the slot
    /// is poisoned.
    pub fn publish(&self, schema: GraphSchema) -> Result<()> {
        let mut slot = self
            .current
            .write()
            .map_err(|_| GqdError::Metadata("schema snapshot lock poisoned".to_string()))?;
        *slot = Some(Arc::new(schema));
        Ok(())
    }
}

/// Metadata source consumed by the dispatcher.
pub trait MetaFetcher: Send + Sync {
    /// Bring the shared schema up to date. Fails with [`GqdError::Metadata`]
    /// when the schema source is unreachable.
    fn refresh(&self) -> Result<()>;
}

/// Fetcher that re-reads a JSON schema file on every refresh.
#[derive(Debug, Clone)]
pub struct FileMetaFetcher {
    path: PathBuf,
    schema: SharedSchema,
}

impl FileMetaFetcher {
    pub fn new(path: impl Into<PathBuf>, schema: SharedSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }

    pub fn schema(&self) -> &SharedSchema {
        &self.schema
    }
}

impl MetaFetcher for FileMetaFetcher {
    fn refresh(&self) -> Result<()> {
        let raw = fs::read_to_string(&self.path).map_err(|e| {
            GqdError::Metadata(format!(
                "schema source {} unreachable: {e}",
                self.path.display()
            ))
        })?;
        let schema: GraphSchema = serde_json::from_str(&raw).map_err(|e| {
            GqdError::Metadata(format!("schema {} is invalid: {e}", self.path.display()))
        })?;
        debug!(
            path = %self.path.display(),
            vertex_labels = schema.vertex_labels.len(),
            edge_labels = schema.edge_labels.len(),
            "schema refreshed"
        );
        self.schema.publish(schema)
    }
}
