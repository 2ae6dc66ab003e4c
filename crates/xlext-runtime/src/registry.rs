//! Stored extension registry document and its storage seam.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xlext_permissions::{resolve_permission_set, PermissionSet, TrustLevel};
use xlext_sandbox::ExtensionSource;

pub const EXTENSION_REGISTRY_SCHEMA_VERSION: u32 = 1;
const EXTENSION_ID_MAX_CHARS: usize = 128;

fn default_true() -> bool {
    true
}

fn default_registry_version() -> u32 {
    EXTENSION_REGISTRY_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// One stored extension.
pub struct ExtensionRegistryEntry {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source: ExtensionSource,
    pub trust: TrustLevel,
    /// Per-capability overrides on top of the trust level's defaults.
    #[serde(default)]
    pub permissions: BTreeMap<String, bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtensionRegistryEntry {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source: ExtensionSource,
        trust: TrustLevel,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            source,
            trust,
            permissions: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn effective_permissions(&self) -> PermissionSet {
        resolve_permission_set(self.trust, &self.permissions)
    }

    pub fn validate(&self) -> Result<()> {
        let id = self.id.trim();
        if id.is_empty() {
            bail!("extension registry entry id must not be empty");
        }
        if id != self.id || id.chars().any(char::is_whitespace) {
            bail!("extension registry entry id '{}' must not contain whitespace", self.id);
        }
        if id.chars().count() > EXTENSION_ID_MAX_CHARS {
            bail!(
                "extension registry entry id '{}' exceeds {} characters",
                self.id,
                EXTENSION_ID_MAX_CHARS
            );
        }
        if self.name.trim().is_empty() {
            bail!("extension registry entry '{}' must have a name", self.id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Versioned list of stored extensions.
pub struct ExtensionRegistryDocument {
    #[serde(default = "default_registry_version")]
    pub version: u32,
    #[serde(default)]
    pub items: Vec<ExtensionRegistryEntry>,
}

impl Default for ExtensionRegistryDocument {
    fn default() -> Self {
        Self {
            version: EXTENSION_REGISTRY_SCHEMA_VERSION,
            items: Vec::new(),
        }
    }
}

impl ExtensionRegistryDocument {
    pub fn find(&self, id: &str) -> Option<&ExtensionRegistryEntry> {
        self.items.iter().find(|entry| entry.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut ExtensionRegistryEntry> {
        self.items.iter_mut().find(|entry| entry.id == id)
    }

    /// Replaces the entry with the same id, or appends a new one.
    pub fn upsert(&mut self, entry: ExtensionRegistryEntry) {
        match self.find_mut(&entry.id) {
            Some(existing) => *existing = entry,
            None => self.items.push(entry),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<ExtensionRegistryEntry> {
        let index = self.items.iter().position(|entry| entry.id == id)?;
        Some(self.items.remove(index))
    }

    pub fn validate(&self) -> Result<()> {
        if self.version > EXTENSION_REGISTRY_SCHEMA_VERSION {
            bail!(
                "unsupported extension registry version {} (this build reads up to {})",
                self.version,
                EXTENSION_REGISTRY_SCHEMA_VERSION
            );
        }
        let mut seen = BTreeSet::new();
        for entry in &self.items {
            entry.validate()?;
            if !seen.insert(entry.id.as_str()) {
                bail!("duplicate extension registry entry id '{}'", entry.id);
            }
        }
        Ok(())
    }
}

pub fn parse_registry_document(raw: &str) -> Result<ExtensionRegistryDocument> {
    let document = serde_json::from_str::<ExtensionRegistryDocument>(raw)
        .context("failed to parse extension registry document")?;
    document.validate()?;
    Ok(document)
}

pub fn load_registry_document(path: &Path) -> Result<ExtensionRegistryDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_registry_document(&raw).with_context(|| format!("invalid registry {}", path.display()))
}

/// Persistence seam for the registry. Storage format migrations live behind
/// this trait, not in the runtime manager.
#[async_trait]
pub trait ExtensionRegistryStore: Send + Sync {
    async fn load(&self) -> Result<ExtensionRegistryDocument>;
    async fn save(&self, document: &ExtensionRegistryDocument) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryRegistryStore {
    document: Mutex<ExtensionRegistryDocument>,
}

impl InMemoryRegistryStore {
    pub fn new(document: ExtensionRegistryDocument) -> Self {
        Self {
            document: Mutex::new(document),
        }
    }

    pub fn snapshot(&self) -> ExtensionRegistryDocument {
        self.document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ExtensionRegistryStore for InMemoryRegistryStore {
    async fn load(&self) -> Result<ExtensionRegistryDocument> {
        Ok(self.snapshot())
    }

    async fn save(&self, document: &ExtensionRegistryDocument) -> Result<()> {
        document.validate()?;
        *self
            .document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = document.clone();
        Ok(())
    }
}

/// Registry stored as one pretty-printed JSON file. A missing file reads as
/// an empty registry.
#[derive(Debug, Clone)]
pub struct JsonFileRegistryStore {
    path: PathBuf,
}

impl JsonFileRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ExtensionRegistryStore for JsonFileRegistryStore {
    async fn load(&self) -> Result<ExtensionRegistryDocument> {
        if !self.path.exists() {
            return Ok(ExtensionRegistryDocument::default());
        }
        load_registry_document(&self.path)
    }

    async fn save(&self, document: &ExtensionRegistryDocument) -> Result<()> {
        document.validate()?;
        let mut rendered = serde_json::to_string_pretty(document)
            .context("failed to serialize extension registry")?;
        rendered.push('\n');
        write_text_atomic(&self.path, &rendered)
    }
}

/// Writes via a sibling temp file and rename so readers never see a partial registry.
fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;
    let temp_path = parent_dir.join(format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("extensions"),
        std::process::id(),
        Utc::now().timestamp_millis()
    ));
    std::fs::write(&temp_path, content)
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to rename temporary registry file {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use xlext_permissions::{Capability, TrustLevel};
    use xlext_sandbox::ExtensionSource;

    use super::{
        parse_registry_document, ExtensionRegistryDocument, ExtensionRegistryEntry,
        ExtensionRegistryStore, JsonFileRegistryStore,
    };

    #[test]
    fn functional_registry_document_reads_camel_case_and_ignores_unknown_keys() {
        let document = parse_registry_document(
            r#"{
              "version": 1,
              "items": [{
                "id": "ext.rates",
                "name": "Rates",
                "source": { "kind": "module", "specifier": "https://cdn.example.com/rates.js" },
                "trust": "remote-url",
                "permissions": { "http.fetch": true, "future.capability": true },
                "createdAt": "2026-01-02T03:04:05Z",
                "updatedAt": "2026-01-02T03:04:05Z",
                "installedBy": "someone"
              }]
            }"#,
        )
        .expect("parse");
        let entry = document.find("ext.rates").expect("entry");
        assert!(entry.enabled);
        assert_eq!(entry.trust, TrustLevel::RemoteUrl);
        let permissions = entry.effective_permissions();
        assert!(permissions.allows(Capability::HttpFetch));
        assert!(permissions.allows(Capability::UiToast));
        assert!(!permissions.allows(Capability::ToolsRegister));
    }

    #[test]
    fn regression_rejects_duplicates_and_newer_versions() {
        let entry = ExtensionRegistryEntry::new(
            "ext.a",
            "A",
            ExtensionSource::Inline {
                code: "1".to_string(),
            },
            TrustLevel::InlineCode,
        );
        let duplicated = ExtensionRegistryDocument {
            version: 1,
            items: vec![entry.clone(), entry.clone()],
        };
        assert!(duplicated.validate().is_err());
        let newer = ExtensionRegistryDocument {
            version: 99,
            items: vec![entry],
        };
        assert!(newer
            .validate()
            .expect_err("newer")
            .to_string()
            .contains("unsupported extension registry version 99"));
    }

    #[tokio::test]
    async fn integration_json_file_store_round_trips_and_treats_missing_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileRegistryStore::new(dir.path().join("nested/extensions.json"));
        assert_eq!(
            store.load().await.expect("empty"),
            ExtensionRegistryDocument::default()
        );

        let mut document = ExtensionRegistryDocument::default();
        document.upsert(ExtensionRegistryEntry::new(
            "ext.a",
            "A",
            ExtensionSource::Inline {
                code: "1".to_string(),
            },
            TrustLevel::InlineCode,
        ));
        store.save(&document).await.expect("save");
        assert_eq!(store.load().await.expect("load"), document);
        assert!(std::fs::read_to_string(store.path())
            .expect("raw")
            .contains("\"createdAt\""));
    }
}
