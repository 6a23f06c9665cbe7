//! 键值存储
//! 引擎只通过 `Store` 访问持久化数据，后端可以是内存或 JSON 文件

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

/// 逻辑键
pub mod keys {
    pub const RELAY_BASE: &str = "relay_base";
    pub const STREAM_RELAY: &str = "stream_relay";
    pub const ENABLED_SOURCES: &str = "enabled_sources";
    pub const CUSTOM_SOURCES: &str = "custom_sources";
    pub const ENABLED_CHANNELS: &str = "enabled_channels";
    pub const CUSTOM_CHANNELS: &str = "custom_channels";
    pub const LLM_API_URL: &str = "llm_api_url";
    pub const LLM_API_KEY: &str = "llm_api_key";
    pub const LLM_MODEL: &str = "llm_model";
    pub const LLM_PROMPT: &str = "llm_prompt";
    pub const PLAY_HISTORY: &str = "play_history";
    pub const ONLINE_PARSERS: &str = "online_parsers";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("存储读写失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("存储数据格式错误: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("存储锁已损坏")]
    Poisoned,
}

/// 键值存储能力
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// 读取 JSON 值，缺失或无法解析时返回 None
pub fn get_json<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>, StoreError> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("存储键 {} 数据无法解析, 已忽略: {}", key, e);
            Ok(None)
        }
    }
}

/// 写入 JSON 值
pub fn set_json<T: Serialize + ?Sized>(store: &dyn Store, key: &str, value: &T) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

/// 读取非空字符串
pub fn get_non_empty(store: &dyn Store, key: &str) -> Result<Option<String>, StoreError> {
    Ok(store
        .get(key)?
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

// ============================================================================
// 内存存储
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.keys().cloned().collect())
    }
}

// ============================================================================
// 文件存储
// ============================================================================

/// 单个 JSON 对象文件，写入时先写临时文件再重命名
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            BTreeMap::new()
        };
        debug!("打开存储文件 {} ({} 个键)", path.display(), entries.len());
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Store for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&entries) {
            // 持久化失败时回滚内存状态
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_get_json_ignores_garbage() {
        let store = MemoryStore::new();
        store.set("k", "{not json").unwrap();
        let value: Option<Vec<String>> = get_json(&store, "k").unwrap();
        assert!(value.is_none());

        set_json(&store, "k", &vec!["x".to_string()]).unwrap();
        let value: Option<Vec<String>> = get_json(&store, "k").unwrap();
        assert_eq!(value, Some(vec!["x".to_string()]));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set(keys::RELAY_BASE, "https://relay.example/?url=").unwrap();
            store.set("temp", "x").unwrap();
            store.remove("temp").unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(
            store.get(keys::RELAY_BASE).unwrap().as_deref(),
            Some("https://relay.example/?url=")
        );
        assert_eq!(store.get("temp").unwrap(), None);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
