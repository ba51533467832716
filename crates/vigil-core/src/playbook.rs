//! Playbook lookup

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

const PLAYBOOK_EXTENSION: &str = "md";

#[async_trait]
pub trait PlaybookStore: Send + Sync {
    /// Playbook text, or None if no playbook has that name
    async fn get_content(&self, name: &str) -> Result<Option<String>>;
    async fn list_names(&self) -> Result<Vec<String>>;
}

/// Reads `<dir>/<name>.md`
pub struct FilePlaybookStore {
    dir: PathBuf,
}

impl FilePlaybookStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    }
}

#[async_trait]
impl PlaybookStore for FilePlaybookStore {
    async fn get_content(&self, name: &str) -> Result<Option<String>> {
        if !Self::is_valid_name(name) {
            return Ok(None);
        }

        let path = self.dir.join(format!("{}.{}", name, PLAYBOOK_EXTENSION));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", self.dir.display()))
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PLAYBOOK_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;

    /// Playbooks held in memory
    #[derive(Default)]
    pub struct StaticPlaybooks {
        playbooks: BTreeMap<String, String>,
    }

    impl StaticPlaybooks {
        pub fn with(mut self, name: &str, content: &str) -> Self {
            self.playbooks.insert(name.to_string(), content.to_string());
            self
        }
    }

    #[async_trait]
    impl PlaybookStore for StaticPlaybooks {
        async fn get_content(&self, name: &str) -> Result<Option<String>> {
            Ok(self.playbooks.get(name).cloned())
        }

        async fn list_names(&self) -> Result<Vec<String>> {
            Ok(self.playbooks.keys().cloned().collect())
        }
    }
}
