use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use dirs::config_dir;

/// Tokens handed out by `/auth/login`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub member_id: String,
}

/// Something that can end the current login session.
pub trait SessionInvalidator: Send + Sync {
    fn invalidate(&self, reason: &str);
}

/// Credentials on disk, mirrored in memory so every request sees the latest
/// access token after a refresh.
pub struct SessionStore {
    path: PathBuf,
    current: RwLock<Option<Credentials>>,
}

impl SessionStore {
    pub fn default_path() -> Result<PathBuf> {
        let mut path = config_dir()
            .ok_or_else(|| anyhow!("Could not find config directory"))?;
        path.push("noteai");
        fs::create_dir_all(&path)?;
        path.push("credentials.json");
        Ok(path)
    }

    /// Open the store at `path`, loading saved credentials if there are any.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let current = if path.exists() {
            let contents = fs::read_to_string(&path)
                .context("Failed to read credentials")?;
            match serde_json::from_str(&contents) {
                Ok(creds) => Some(creds),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable credentials file: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.credentials()
            .map(|c| !c.access_token.is_empty())
            .unwrap_or(false)
    }

    pub fn access_token(&self) -> Option<String> {
        self.credentials().map(|c| c.access_token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.credentials().map(|c| c.refresh_token)
    }

    pub fn save(&self, creds: Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&creds)?;
        fs::write(&self.path, contents)
            .context("Failed to write credentials")?;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(creds);
        Ok(())
    }

    /// Swap in a refreshed access token, keeping the rest.
    pub fn update_access_token(&self, access_token: &str) -> Result<()> {
        let mut creds = self
            .credentials()
            .ok_or_else(|| anyhow!("No session to refresh"))?;
        creds.access_token = access_token.to_string();
        self.save(creds)
    }

    pub fn clear(&self) -> Result<()> {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = None;
        if self.path.exists() {
            fs::remove_file(&self.path)
                .context("Failed to remove credentials")?;
        }
        Ok(())
    }
}

impl SessionInvalidator for SessionStore {
    fn invalidate(&self, reason: &str) {
        tracing::info!("Ending session: {}", reason);
        if let Err(e) = self.clear() {
            tracing::warn!("Could not clear credentials: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            member_id: "7".to_string(),
        }
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = SessionStore::open(&path).unwrap();
        assert!(!store.is_logged_in());
        store.save(creds()).unwrap();

        let reopened = SessionStore::open(&path).unwrap();
        assert_eq!(reopened.credentials(), Some(creds()));
        assert_eq!(reopened.access_token().as_deref(), Some("access-1"));
    }

    #[test]
    fn test_update_access_token_keeps_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("credentials.json")).unwrap();

        assert!(store.update_access_token("nope").is_err());

        store.save(creds()).unwrap();
        store.update_access_token("access-2").unwrap();
        assert_eq!(store.access_token().as_deref(), Some("access-2"));
        assert_eq!(store.refresh_token().as_deref(), Some("refresh-1"));
    }

    #[test]
    fn test_invalidate_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = SessionStore::open(&path).unwrap();
        store.save(creds()).unwrap();

        store.invalidate("expired");

        assert!(!store.is_logged_in());
        assert!(!path.exists());
        // Second call is harmless
        store.invalidate("expired");
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{ not json").unwrap();

        let store = SessionStore::open(&path).unwrap();
        assert!(store.credentials().is_none());
    }
}
