//! Per-user tokens for external sources.
//!
//! The pipeline only sees the [`CredentialStore`] trait; tests use the
//! in-memory map and the CLI uses the JSON file store.

use crate::error::CredentialError;
use crate::models::{Credential, SourceType};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

type CredentialKey = (String, SourceType);

pub trait CredentialStore: Send + Sync {
    /// Stores or replaces the token for `(owner_id, source_type)`.
    fn store_token(
        &self,
        owner_id: &str,
        source_type: SourceType,
        token: &str,
    ) -> Result<(), CredentialError>;

    fn get_token(&self, owner_id: &str, source_type: SourceType) -> Option<String>;

    fn require_token(&self, owner_id: &str, source_type: SourceType) -> Result<String, CredentialError> {
        self.get_token(owner_id, source_type)
            .ok_or_else(|| CredentialError::Missing {
                owner_id: owner_id.to_string(),
                source_type,
            })
    }
}

fn credential(owner_id: &str, source_type: SourceType, token: &str) -> Credential {
    Credential {
        owner_id: owner_id.to_string(),
        source_type,
        token: token.to_string(),
        connected_at: Utc::now(),
    }
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    credentials: RwLock<HashMap<CredentialKey, Credential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn store_token(
        &self,
        owner_id: &str,
        source_type: SourceType,
        token: &str,
    ) -> Result<(), CredentialError> {
        let mut credentials = self
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        credentials.insert(
            (owner_id.to_string(), source_type),
            credential(owner_id, source_type, token),
        );
        Ok(())
    }

    fn get_token(&self, owner_id: &str, source_type: SourceType) -> Option<String> {
        let credentials = self
            .credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        credentials
            .get(&(owner_id.to_string(), source_type))
            .map(|credential| credential.token.clone())
    }
}

/// Credentials kept in a single JSON file, rewritten on every store.
pub struct FileCredentialStore {
    path: PathBuf,
    credentials: RwLock<HashMap<CredentialKey, Credential>>,
}

impl FileCredentialStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref().to_path_buf();
        let credentials = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let listed: Vec<Credential> = if raw.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&raw)?
            };
            listed
                .into_iter()
                .map(|credential| {
                    ((credential.owner_id.clone(), credential.source_type), credential)
                })
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            credentials: RwLock::new(credentials),
        })
    }

    fn persist(&self, credentials: &HashMap<CredentialKey, Credential>) -> Result<(), CredentialError> {
        let mut listed: Vec<&Credential> = credentials.values().collect();
        listed.sort_by(|left, right| {
            (&left.owner_id, left.source_type).cmp(&(&right.owner_id, right.source_type))
        });

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, serde_json::to_vec_pretty(&listed)?)?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn store_token(
        &self,
        owner_id: &str,
        source_type: SourceType,
        token: &str,
    ) -> Result<(), CredentialError> {
        let mut credentials = self
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        credentials.insert(
            (owner_id.to_string(), source_type),
            credential(owner_id, source_type, token),
        );
        self.persist(&credentials)?;
        debug!(owner_id, %source_type, path = %self.path.display(), "credential stored");
        Ok(())
    }

    fn get_token(&self, owner_id: &str, source_type: SourceType) -> Option<String> {
        let credentials = self
            .credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        credentials
            .get(&(owner_id.to_string(), source_type))
            .map(|credential| credential.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reconnect_overwrites_token() -> Result<(), CredentialError> {
        let store = InMemoryCredentialStore::new();
        store.store_token("ana@example.com", SourceType::Notion, "secret-1")?;
        store.store_token("ana@example.com", SourceType::Notion, "secret-2")?;

        assert_eq!(
            store.get_token("ana@example.com", SourceType::Notion).as_deref(),
            Some("secret-2")
        );
        assert_eq!(store.get_token("ana@example.com", SourceType::GoogleDocs), None);
        Ok(())
    }

    #[test]
    fn missing_token_asks_user_to_connect() {
        let store = InMemoryCredentialStore::new();
        let error = store
            .require_token("bo@example.com", SourceType::Confluence)
            .err()
            .map(|error| error.to_string())
            .unwrap_or_default();
        assert!(error.contains("please connect confluence first"));
    }

    #[test]
    fn file_store_persists_across_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("state/credentials.json");

        let store = FileCredentialStore::open(&path)?;
        store.store_token("ana@example.com", SourceType::GoogleDocs, r#"{"token":"ya29"}"#)?;
        store.store_token("ana@example.com", SourceType::Notion, "secret_abc")?;
        drop(store);

        let reopened = FileCredentialStore::open(&path)?;
        assert_eq!(
            reopened.get_token("ana@example.com", SourceType::GoogleDocs).as_deref(),
            Some(r#"{"token":"ya29"}"#)
        );
        assert_eq!(
            reopened.require_token("ana@example.com", SourceType::Notion)?,
            "secret_abc"
        );
        Ok(())
    }

    #[test]
    fn corrupt_credential_file_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "not json")?;

        assert!(matches!(
            FileCredentialStore::open(&path),
            Err(CredentialError::Serialization(_))
        ));
        Ok(())
    }
}
