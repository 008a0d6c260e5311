// crates/weftruntime/src/loader.rs

use crate::ComponentRegistry;
use std::path::{Path, PathBuf};
use weftcore::{ComponentSpec, FlowError};

const MANIFEST_SUFFIX: &str = ".component.json";

/// Loads `*.component.json` manifests from a directory tree
pub struct ComponentLoader {
    root: PathBuf,
}

impl ComponentLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Register every manifest under the root. Returns how many were loaded.
    pub fn load_into(&self, registry: &mut ComponentRegistry) -> Result<usize, FlowError> {
        let mut manifests = Vec::new();
        collect_manifests(&self.root, &mut manifests)?;
        manifests.sort();

        for path in &manifests {
            registry.register(Self::load_manifest(path)?);
        }
        tracing::info!(
            "Loaded {} component(s) from {}",
            manifests.len(),
            self.root.display()
        );
        Ok(manifests.len())
    }

    /// Parse one manifest. A relative `source_path` is resolved against the
    /// manifest's directory.
    pub fn load_manifest(path: &Path) -> Result<ComponentSpec, FlowError> {
        let mut spec: ComponentSpec = serde_json::from_reader(std::fs::File::open(path)?)?;
        if spec.source_path.is_relative() {
            if let Some(dir) = path.parent() {
                spec.source_path = dir.join(&spec.source_path);
            }
        }
        Ok(spec)
    }
}

fn collect_manifests(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), FlowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_manifests(&path, out)?;
        } else if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(MANIFEST_SUFFIX))
        {
            out.push(path);
        }
    }
    Ok(())
}
