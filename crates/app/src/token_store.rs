//! Persisted auth token
//!
//! One key-value entry, `auth_token`, that survives restarts.

use std::path::Path;
use std::sync::Mutex;

use platewise_core::{Database, Error, Result};

/// Key of the persisted token entry
pub const AUTH_TOKEN_KEY: &str = "auth_token";

pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, token: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

fn poisoned() -> Error {
    Error::Io(std::io::Error::other("token store lock poisoned"))
}

/// Token kept in the client's local SQLite file
pub struct SqliteTokenStore {
    db: Mutex<Database>,
}

impl SqliteTokenStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            db: Mutex::new(Database::open(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Mutex::new(Database::open_in_memory()?),
        })
    }
}

impl TokenStore for SqliteTokenStore {
    fn load(&self) -> Result<Option<String>> {
        let db = self.db.lock().map_err(|_| poisoned())?;
        db.kv().get(AUTH_TOKEN_KEY)
    }

    fn save(&self, token: &str) -> Result<()> {
        let db = self.db.lock().map_err(|_| poisoned())?;
        db.kv().set(AUTH_TOKEN_KEY, token)
    }

    fn clear(&self) -> Result<()> {
        let db = self.db.lock().map_err(|_| poisoned())?;
        db.kv().remove(AUTH_TOKEN_KEY)
    }
}

/// Process-local store, for tests and ephemeral clients
#[derive(Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn with_token(token: &str) -> Self {
        Self {
            token: Mutex::new(Some(token.to_string())),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.token.lock().map_err(|_| poisoned())?.clone())
    }

    fn save(&self, token: &str) -> Result<()> {
        *self.token.lock().map_err(|_| poisoned())? = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.token.lock().map_err(|_| poisoned())? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sqlite_store_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("client.db");

        {
            let store = SqliteTokenStore::open(&path).unwrap();
            assert_eq!(store.load().unwrap(), None);
            store.save("tok-1").unwrap();
        }

        let store = SqliteTokenStore::open(&path).unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("tok-1"));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryTokenStore::with_token("abc");
        assert_eq!(store.load().unwrap().as_deref(), Some("abc"));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
