use crate::capability::CapabilityToken;
use keeper_core::{KeeperError, KeeperResult, TokenId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Durable backing for the capability store.
///
/// Calls are made while the store holds its own lock, so implementations
/// only need to be safe against concurrent calls for different tokens.
pub trait TokenPersistence: Send + Sync {
    fn load_all(&self) -> KeeperResult<Vec<CapabilityToken>>;
    fn save(&self, token: &CapabilityToken) -> KeeperResult<()>;
    fn remove(&self, id: TokenId) -> KeeperResult<()>;
}

/// Process-lifetime persistence.
#[derive(Default)]
pub struct MemoryTokenPersistence {
    tokens: Mutex<HashMap<TokenId, CapabilityToken>>,
}

impl MemoryTokenPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenPersistence for MemoryTokenPersistence {
    fn load_all(&self) -> KeeperResult<Vec<CapabilityToken>> {
        Ok(self.tokens.lock().values().cloned().collect())
    }

    fn save(&self, token: &CapabilityToken) -> KeeperResult<()> {
        self.tokens.lock().insert(token.id, token.clone());
        Ok(())
    }

    fn remove(&self, id: TokenId) -> KeeperResult<()> {
        self.tokens.lock().remove(&id);
        Ok(())
    }
}

/// One JSON document per token in a directory.
pub struct FileTokenPersistence {
    dir: PathBuf,
}

impl FileTokenPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> KeeperResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn token_path(&self, id: TokenId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl TokenPersistence for FileTokenPersistence {
    fn load_all(&self) -> KeeperResult<Vec<CapabilityToken>> {
        let mut tokens = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };
            if Uuid::parse_str(stem).is_err() {
                continue;
            }
            let data = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<CapabilityToken>(&data) {
                Ok(token) => tokens.push(token),
                // A corrupt record costs one token, not the whole store.
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable token"),
            }
        }
        Ok(tokens)
    }

    fn save(&self, token: &CapabilityToken) -> KeeperResult<()> {
        let path = self.token_path(token.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(token)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path).map_err(KeeperError::from)
    }

    fn remove(&self, id: TokenId) -> KeeperResult<()> {
        let path = self.token_path(id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}
