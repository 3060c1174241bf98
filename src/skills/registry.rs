//! Skill Registry
//!
//! Discovers SKILL.md manifests under a root directory and serves them
//! as immutable snapshots. A refresh builds a whole new snapshot and
//! swaps a pointer; in-flight requests keep reading the snapshot they
//! captured.

use super::manifest::{ManifestError, SkillManifest};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fixed manifest filename matched during discovery
pub const MANIFEST_FILENAME: &str = "SKILL.md";

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("skill `{0}` not found")]
    SkillNotFound(String),

    #[error("duplicate skill name `{name}` in {first} and {second}")]
    DuplicateName {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Immutable view of the skill pool at one point in time
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    skills: BTreeMap<String, SkillManifest>,
    root: PathBuf,
    built_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    /// Empty snapshot, used before the first successful build
    pub fn empty(root: PathBuf) -> Self {
        Self {
            skills: BTreeMap::new(),
            root,
            built_at: Utc::now(),
        }
    }

    /// O(1) lookup by name
    pub fn get(&self, name: &str) -> Result<&SkillManifest, RegistryError> {
        self.skills
            .get(name)
            .ok_or_else(|| RegistryError::SkillNotFound(name.to_string()))
    }

    /// All manifests in name-sorted order, stable across calls
    pub fn list(&self) -> impl Iterator<Item = &SkillManifest> {
        self.skills.values()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Compact catalog injected into the system prompt.
    ///
    /// Lists every executable skill with its description and usage,
    /// nests documentation-only manifests under the skill naming them
    /// via `related_tools`, and appends unattached documentation
    /// manifests at the end so nothing is silently dropped.
    pub fn summarize_for_prompt(&self) -> String {
        if self.skills.is_empty() {
            return "<available_skills>No skills available</available_skills>".to_string();
        }

        let attached: std::collections::BTreeSet<&str> = self
            .skills
            .values()
            .filter(|m| m.executable)
            .flat_map(|m| m.related_tools.iter().map(String::as_str))
            .collect();

        let mut out = String::from("<available_skills>\n");
        for manifest in self.skills.values().filter(|m| m.executable) {
            out.push_str("  <skill>\n");
            out.push_str(&format!("    <name>{}</name>\n", manifest.name));
            out.push_str(&format!(
                "    <description>{}</description>\n",
                manifest.description
            ));
            if let Some(snippet) = manifest.usage_snippet() {
                out.push_str("    <usage>\n```python\n");
                out.push_str(snippet);
                out.push_str("\n```\n    </usage>\n");
            } else if !manifest.body.trim().is_empty() {
                out.push_str("    <usage>\n");
                out.push_str(manifest.body.trim());
                out.push_str("\n    </usage>\n");
            }
            for related in &manifest.related_tools {
                if let Ok(doc) = self.get(related) {
                    if !doc.executable {
                        out.push_str(&format!(
                            "    <related_doc name=\"{}\">{}</related_doc>\n",
                            doc.name, doc.description
                        ));
                    }
                }
            }
            out.push_str("  </skill>\n");
        }

        let orphan_docs: Vec<&SkillManifest> = self
            .skills
            .values()
            .filter(|m| !m.executable && !attached.contains(m.name.as_str()))
            .collect();
        if !orphan_docs.is_empty() {
            out.push_str("  <reference_docs>\n");
            for doc in orphan_docs {
                out.push_str(&format!(
                    "    <doc name=\"{}\">{}</doc>\n",
                    doc.name, doc.description
                ));
            }
            out.push_str("  </reference_docs>\n");
        }

        out.push_str("</available_skills>");
        out
    }
}

/// Process-wide registry cell: single writer, many snapshot readers
pub struct SkillRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl SkillRegistry {
    /// Wrap an already-built snapshot
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Registry with an empty snapshot for the given root
    pub fn empty(root: PathBuf) -> Self {
        Self::new(RegistrySnapshot::empty(root))
    }

    /// Walk `root` recursively, parse every SKILL.md and build a
    /// snapshot. Individual parse failures are logged and skipped;
    /// duplicate names fail the whole build.
    pub fn build(root: &Path) -> Result<RegistrySnapshot, RegistryError> {
        let mut paths = Vec::new();
        if root.exists() {
            collect_manifests(root, &mut paths)?;
        } else {
            warn!("Skills directory does not exist: {}", root.display());
        }
        paths.sort();

        let mut skills: BTreeMap<String, SkillManifest> = BTreeMap::new();
        let mut sources: BTreeMap<String, PathBuf> = BTreeMap::new();

        for path in paths {
            let content = std::fs::read_to_string(&path).map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })?;

            match SkillManifest::parse(&content) {
                Ok(manifest) => {
                    if let Some(first) = sources.get(&manifest.name) {
                        return Err(RegistryError::DuplicateName {
                            name: manifest.name,
                            first: first.clone(),
                            second: path,
                        });
                    }
                    debug!("Registered skill `{}` from {}", manifest.name, path.display());
                    sources.insert(manifest.name.clone(), path);
                    skills.insert(manifest.name.clone(), manifest);
                }
                Err(err) => {
                    warn!("Skipping manifest {}: {}", path.display(), err);
                }
            }
        }

        info!(
            "Skill discovery complete: {} skills under {}",
            skills.len(),
            root.display()
        );

        Ok(RegistrySnapshot {
            skills,
            root: root.to_path_buf(),
            built_at: Utc::now(),
        })
    }

    /// Current snapshot; the caller keeps the Arc for the lifetime of
    /// one request and never observes a mixed state.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().expect("registry lock poisoned").clone()
    }

    /// Rebuild from the current root and atomically replace the
    /// snapshot. On build failure the prior snapshot stays in place.
    pub fn refresh(&self) -> Result<usize, RegistryError> {
        let root = self.snapshot().root().to_path_buf();
        let fresh = Self::build(&root)?;
        let count = fresh.len();
        *self.snapshot.write().expect("registry lock poisoned") = Arc::new(fresh);
        info!("Skill registry refreshed: {} skills", count);
        Ok(count)
    }
}

fn collect_manifests(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RegistryError> {
    let entries = std::fs::read_dir(dir).map_err(|source| RegistryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| RegistryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_manifests(&path, out)?;
        } else if path.file_name().and_then(|n| n.to_str()) == Some(MANIFEST_FILENAME) {
            out.push(path);
        }
    }
    Ok(())
}
