//! Model catalog built from the models directory
//!
//! Layout:
//! ```text
//! <models_dir>/
//! ├── embeddings/
//! │   └── nomic-embed-text-v1.5.Q8_0.gguf   -> embedding_nomic-embed-text-v1.5.Q8_0
//! └── rerankers/
//!     └── bge-reranker-v2-m3-Q8_0.gguf       -> reranker_bge-reranker-v2-m3-Q8_0
//! ```
//!
//! Ports are handed out from `base_port` in discovery order: embeddings first,
//! then rerankers, each directory sorted by file name.

use crate::config::{ManagerConfig, ResourceSettings};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MODEL_EXTENSION: &str = "gguf";

/// Role a model plays, inferred from its directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Embedding,
    Reranking,
}

impl ModelRole {
    /// Subdirectory of the models directory holding this role's artifacts
    pub fn subdir(self) -> &'static str {
        match self {
            Self::Embedding => "embeddings",
            Self::Reranking => "rerankers",
        }
    }

    fn name_prefix(self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Reranking => "reranker",
        }
    }
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedding => write!(f, "embedding"),
            Self::Reranking => write!(f, "reranking"),
        }
    }
}

/// A discovered model artifact. Immutable once scanned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub role: ModelRole,
    pub port: u16,
    pub resources: ResourceSettings,
}

/// Inputs to a catalog scan
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub base_port: u16,
    pub embedding: ResourceSettings,
    pub reranking: ResourceSettings,
}

impl ScanSettings {
    fn resources_for(&self, role: ModelRole) -> ResourceSettings {
        match role {
            ModelRole::Embedding => self.embedding,
            ModelRole::Reranking => self.reranking,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from(&ManagerConfig::default())
    }
}

impl From<&ManagerConfig> for ScanSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            base_port: config.base_port,
            embedding: config.embedding,
            reranking: config.reranking,
        }
    }
}

/// Read-only catalog of the models available to the manager
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    /// Discovery order
    models: Vec<Arc<ModelDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl ModelRegistry {
    /// Scan `models_dir` for embedding and reranking artifacts.
    ///
    /// Missing subdirectories are skipped. Fails only if the port pool is
    /// exhausted.
    pub fn scan(models_dir: &Path, settings: &ScanSettings) -> Result<Self> {
        tracing::info!(models_dir = %models_dir.display(), "Scanning models directory");

        let mut registry = Self::default();
        let mut next_port = Some(settings.base_port);

        for role in [ModelRole::Embedding, ModelRole::Reranking] {
            for path in list_artifacts(&models_dir.join(role.subdir())) {
                let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string())
                else {
                    continue;
                };

                let Some(port) = next_port else {
                    anyhow::bail!(
                        "Port pool starting at {} exhausted while registering {}",
                        settings.base_port,
                        path.display()
                    );
                };
                next_port = port.checked_add(1);

                let descriptor = ModelDescriptor {
                    name: format!("{}_{}", role.name_prefix(), stem),
                    path,
                    role,
                    port,
                    resources: settings.resources_for(role),
                };

                tracing::info!(
                    model = %descriptor.name,
                    role = %role,
                    port = port,
                    "Found model"
                );

                registry.insert(descriptor);
            }
        }

        tracing::info!(count = registry.len(), "Model scan complete");

        Ok(registry)
    }

    /// Build a catalog from already-known descriptors
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let mut registry = Self::default();
        for descriptor in descriptors {
            registry.insert(descriptor);
        }
        registry
    }

    fn insert(&mut self, descriptor: ModelDescriptor) {
        self.by_name
            .insert(descriptor.name.clone(), self.models.len());
        self.models.push(Arc::new(descriptor));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.by_name.get(name).map(|&idx| self.models[idx].clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All models in discovery order
    pub fn list(&self) -> &[Arc<ModelDescriptor>] {
        &self.models
    }

    pub fn names_by_role(&self, role: ModelRole) -> Vec<String> {
        self.models
            .iter()
            .filter(|m| m.role == role)
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn embeddings(&self) -> Vec<String> {
        self.names_by_role(ModelRole::Embedding)
    }

    pub fn rerankers(&self) -> Vec<String> {
        self.names_by_role(ModelRole::Reranking)
    }

    /// First model discovered for a role
    pub fn first_of(&self, role: ModelRole) -> Option<Arc<ModelDescriptor>> {
        self.models.iter().find(|m| m.role == role).cloned()
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.models.iter().map(|m| m.port)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Model files in `dir`, sorted by file name. Empty if `dir` is unreadable.
fn list_artifacts(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "Skipping model directory");
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == MODEL_EXTENSION))
        .collect();

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn touch(dir: &Path, sub: &str, file: &str) {
        let path = dir.join(sub);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(file), b"GGUF").unwrap();
    }

    fn settings() -> ScanSettings {
        ScanSettings {
            base_port: 8001,
            ..Default::default()
        }
    }

    #[test]
    fn test_scan_assigns_ports_in_order() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "embeddings", "nomic.gguf");
        touch(dir.path(), "embeddings", "bge-small.gguf");
        touch(dir.path(), "rerankers", "bge-reranker.gguf");

        let registry = ModelRegistry::scan(dir.path(), &settings()).unwrap();
        let names: Vec<_> = registry.list().iter().map(|m| m.name.as_str()).collect();

        assert_eq!(
            names,
            vec![
                "embedding_bge-small",
                "embedding_nomic",
                "reranker_bge-reranker"
            ]
        );
        let ports: Vec<_> = registry.ports().collect();
        assert_eq!(ports, vec![8001, 8002, 8003]);
    }

    #[test]
    fn test_scan_is_deterministic() {
        let dir = TempDir::new().unwrap();
        for name in ["c.gguf", "a.gguf", "b.gguf"] {
            touch(dir.path(), "embeddings", name);
        }
        touch(dir.path(), "rerankers", "r.gguf");

        let first = ModelRegistry::scan(dir.path(), &settings()).unwrap();
        let second = ModelRegistry::scan(dir.path(), &settings()).unwrap();

        let pairs = |r: &ModelRegistry| -> Vec<(String, u16)> {
            r.list().iter().map(|m| (m.name.clone(), m.port)).collect()
        };
        assert_eq!(pairs(&first), pairs(&second));
    }

    #[test]
    fn test_scan_missing_subdirs() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::scan(dir.path(), &settings()).unwrap();
        assert!(registry.is_empty());

        touch(dir.path(), "rerankers", "only.gguf");
        let registry = ModelRegistry::scan(dir.path(), &settings()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].port, 8001);
        assert!(registry.embeddings().is_empty());
    }

    #[test]
    fn test_scan_missing_models_dir() {
        let registry =
            ModelRegistry::scan(Path::new("/nonexistent/models/dir"), &settings()).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_scan_ignores_other_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "embeddings", "model.gguf");
        touch(dir.path(), "embeddings", "README.md");
        touch(dir.path(), "embeddings", "model.bin");
        std::fs::create_dir_all(dir.path().join("embeddings/nested.gguf")).unwrap();

        let registry = ModelRegistry::scan(dir.path(), &settings()).unwrap();
        assert_eq!(registry.embeddings(), vec!["embedding_model".to_string()]);
    }

    #[test]
    fn test_role_resources() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "embeddings", "e.gguf");
        touch(dir.path(), "rerankers", "r.gguf");

        let registry = ModelRegistry::scan(dir.path(), &settings()).unwrap();
        let embedding = registry.get("embedding_e").unwrap();
        let reranker = registry.get("reranker_r").unwrap();

        assert_eq!(embedding.role, ModelRole::Embedding);
        assert_eq!(embedding.resources.context_size, 8192);
        assert_eq!(reranker.role, ModelRole::Reranking);
        assert_eq!(reranker.resources.context_size, 1024);
        assert_eq!(
            registry.first_of(ModelRole::Reranking).unwrap().name,
            "reranker_r"
        );
    }

    #[test]
    fn test_ports_pairwise_distinct() {
        let dir = TempDir::new().unwrap();
        for i in 0..20 {
            touch(dir.path(), "embeddings", &format!("e{i}.gguf"));
            touch(dir.path(), "rerankers", &format!("r{i}.gguf"));
        }

        let registry = ModelRegistry::scan(dir.path(), &settings()).unwrap();
        let ports: HashSet<u16> = registry.ports().collect();
        assert_eq!(ports.len(), 40);
    }

    #[test]
    fn test_port_pool_exhaustion() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "embeddings", "a.gguf");
        touch(dir.path(), "embeddings", "b.gguf");

        let settings = ScanSettings {
            base_port: u16::MAX,
            ..Default::default()
        };
        assert!(ModelRegistry::scan(dir.path(), &settings).is_err());
    }
}
