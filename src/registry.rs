//! 资源站 / 频道注册表
//! 内置条目随程序打包 (`data/builtin.json`)，自定义条目和启用列表保存在存储中

use crate::episodes::is_absolute_http;
use crate::store::{self, keys, Store, StoreError};
use crate::types::{Channel, ExtractionMode, Source};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("未找到: {0}")]
    NotFound(String),
    #[error("key 已存在: {0}")]
    Duplicate(String),
    #[error("内置条目不能删除: {0}")]
    BuiltIn(String),
    #[error("参数无效: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct BuiltinCatalog {
    sources: Vec<Source>,
    channels: Vec<Channel>,
}

/// 内置条目
static BUILTIN: Lazy<BuiltinCatalog> = Lazy::new(|| {
    serde_json::from_str(include_str!("../data/builtin.json")).expect("invalid data/builtin.json")
});

/// 新增资源站
#[derive(Debug, Clone, Deserialize)]
pub struct NewSource {
    #[serde(default)]
    pub key: Option<String>,
    pub name: String,
    pub api: String,
}

/// 新增频道
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChannel {
    #[serde(default)]
    pub key: Option<String>,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub extraction_mode: ExtractionMode,
}

/// 资源站和频道共用的注册表条目
trait Entry: Clone + Serialize + DeserializeOwned {
    fn key(&self) -> &str;
    fn mark(&mut self, enabled: bool, is_custom: bool);
}

impl Entry for Source {
    fn key(&self) -> &str {
        &self.key
    }
    fn mark(&mut self, enabled: bool, is_custom: bool) {
        self.enabled = enabled;
        self.is_custom = is_custom;
    }
}

impl Entry for Channel {
    fn key(&self) -> &str {
        &self.key
    }
    fn mark(&mut self, enabled: bool, is_custom: bool) {
        self.enabled = enabled;
        self.is_custom = is_custom;
    }
}

/// 一类条目在存储中的位置
struct Section<T: 'static> {
    builtin: &'static [T],
    enabled_key: &'static str,
    custom_key: &'static str,
    default_enabled: fn() -> Vec<String>,
}

fn sources_section() -> Section<Source> {
    Section {
        builtin: &BUILTIN.sources,
        enabled_key: keys::ENABLED_SOURCES,
        custom_key: keys::CUSTOM_SOURCES,
        // 默认只启用第一个内置资源站
        default_enabled: || BUILTIN.sources.iter().take(1).map(|s| s.key.clone()).collect(),
    }
}

fn channels_section() -> Section<Channel> {
    Section {
        builtin: &BUILTIN.channels,
        enabled_key: keys::ENABLED_CHANNELS,
        custom_key: keys::CUSTOM_CHANNELS,
        default_enabled: || {
            BUILTIN
                .channels
                .iter()
                .filter(|c| c.enabled)
                .map(|c| c.key.clone())
                .collect()
        },
    }
}

/// 注册表，只持有存储句柄，每次读取都反映存储中的最新状态
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn Store>,
    // 自定义列表和启用列表要一起改
    lock: Arc<Mutex<()>>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn write_guard(&self) -> Result<MutexGuard<'_, ()>, RegistryError> {
        Ok(self.lock.lock().map_err(|_| StoreError::Poisoned)?)
    }

    // ------------------------------------------------------------------
    // 通用实现
    // ------------------------------------------------------------------

    fn enabled_keys<T: Entry>(&self, section: &Section<T>) -> Result<Vec<String>, RegistryError> {
        Ok(store::get_json::<Vec<String>>(self.store.as_ref(), section.enabled_key)?
            .unwrap_or_else(section.default_enabled))
    }

    fn customs<T: Entry>(&self, section: &Section<T>) -> Result<Vec<T>, RegistryError> {
        Ok(store::get_json::<Vec<T>>(self.store.as_ref(), section.custom_key)?.unwrap_or_default())
    }

    fn list<T: Entry>(&self, section: &Section<T>) -> Result<Vec<T>, RegistryError> {
        let enabled: HashSet<String> = self.enabled_keys(section)?.into_iter().collect();
        let builtin = section.builtin.iter().cloned().map(|e| (e, false));
        let custom = self.customs(section)?.into_iter().map(|e| (e, true));

        Ok(builtin
            .chain(custom)
            .map(|(mut entry, is_custom)| {
                let on = enabled.contains(entry.key());
                entry.mark(on, is_custom);
                entry
            })
            .collect())
    }

    fn add<T: Entry>(&self, section: &Section<T>, mut entry: T) -> Result<T, RegistryError> {
        let _guard = self.write_guard()?;
        let existing = self.list(section)?;
        if existing.iter().any(|e| e.key() == entry.key()) {
            return Err(RegistryError::Duplicate(entry.key().to_string()));
        }

        let mut customs = self.customs(section)?;
        entry.mark(true, true);
        customs.push(entry.clone());
        store::set_json(self.store.as_ref(), section.custom_key, &customs)?;

        let mut enabled = self.enabled_keys(section)?;
        enabled.push(entry.key().to_string());
        store::set_json(self.store.as_ref(), section.enabled_key, &enabled)?;

        info!("新增自定义条目: {}", entry.key());
        Ok(entry)
    }

    fn remove<T: Entry>(&self, section: &Section<T>, key: &str) -> Result<(), RegistryError> {
        if section.builtin.iter().any(|e| e.key() == key) {
            return Err(RegistryError::BuiltIn(key.to_string()));
        }

        let _guard = self.write_guard()?;
        let mut customs = self.customs(section)?;
        let before = customs.len();
        customs.retain(|e| e.key() != key);
        if customs.len() == before {
            return Err(RegistryError::NotFound(key.to_string()));
        }
        store::set_json(self.store.as_ref(), section.custom_key, &customs)?;

        let mut enabled = self.enabled_keys(section)?;
        enabled.retain(|k| k != key);
        store::set_json(self.store.as_ref(), section.enabled_key, &enabled)?;

        info!("删除自定义条目: {}", key);
        Ok(())
    }

    fn set_enabled<T: Entry>(
        &self,
        section: &Section<T>,
        key: &str,
        on: bool,
    ) -> Result<(), RegistryError> {
        let _guard = self.write_guard()?;
        if !self.list(section)?.iter().any(|e| e.key() == key) {
            return Err(RegistryError::NotFound(key.to_string()));
        }

        let mut enabled = self.enabled_keys(section)?;
        enabled.retain(|k| k != key);
        if on {
            enabled.push(key.to_string());
        }
        store::set_json(self.store.as_ref(), section.enabled_key, &enabled)?;
        Ok(())
    }

    /// 生成不与现有条目冲突的 key
    fn generate_key<T: Entry>(&self, section: &Section<T>, prefix: &str) -> Result<String, RegistryError> {
        let existing: HashSet<String> = self
            .list(section)?
            .iter()
            .map(|e| e.key().to_string())
            .collect();
        let base = format!("{}_{}", prefix, chrono::Utc::now().timestamp_millis());
        let mut candidate = base.clone();
        let mut n = 1;
        while existing.contains(&candidate) {
            candidate = format!("{}_{}", base, n);
            n += 1;
        }
        Ok(candidate)
    }

    fn resolve_key<T: Entry>(
        &self,
        section: &Section<T>,
        key: Option<String>,
        prefix: &str,
    ) -> Result<String, RegistryError> {
        match key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()) {
            Some(k) => Ok(k),
            None => self.generate_key(section, prefix),
        }
    }

    // ------------------------------------------------------------------
    // 资源站
    // ------------------------------------------------------------------

    pub fn sources(&self) -> Result<Vec<Source>, RegistryError> {
        self.list(&sources_section())
    }

    pub fn enabled_sources(&self) -> Result<Vec<Source>, RegistryError> {
        Ok(self.sources()?.into_iter().filter(|s| s.enabled).collect())
    }

    pub fn find_source(&self, key: &str) -> Result<Source, RegistryError> {
        self.sources()?
            .into_iter()
            .find(|s| s.key == key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    pub fn add_source(&self, new: NewSource) -> Result<Source, RegistryError> {
        let name = new.name.trim().to_string();
        let api = new.api.trim().trim_end_matches('/').to_string();
        if name.is_empty() {
            return Err(RegistryError::Invalid("名称不能为空".to_string()));
        }
        if !is_absolute_http(&api) {
            return Err(RegistryError::Invalid(format!("接口地址无效: {}", api)));
        }

        let section = sources_section();
        let key = self.resolve_key(&section, new.key, "custom")?;
        self.add(
            &section,
            Source {
                key,
                name,
                api,
                enabled: true,
                is_custom: true,
            },
        )
    }

    pub fn remove_source(&self, key: &str) -> Result<(), RegistryError> {
        self.remove(&sources_section(), key)
    }

    pub fn set_source_enabled(&self, key: &str, enabled: bool) -> Result<(), RegistryError> {
        self.set_enabled(&sources_section(), key, enabled)
    }

    // ------------------------------------------------------------------
    // 频道
    // ------------------------------------------------------------------

    pub fn channels(&self) -> Result<Vec<Channel>, RegistryError> {
        self.list(&channels_section())
    }

    pub fn enabled_channels(&self) -> Result<Vec<Channel>, RegistryError> {
        Ok(self.channels()?.into_iter().filter(|c| c.enabled).collect())
    }

    pub fn add_channel(&self, new: NewChannel) -> Result<Channel, RegistryError> {
        let name = new.name.trim().to_string();
        let url = new.url.trim().to_string();
        if name.is_empty() {
            return Err(RegistryError::Invalid("名称不能为空".to_string()));
        }
        if !is_absolute_http(&url.replace("{keyword}", "q")) {
            return Err(RegistryError::Invalid(format!("频道地址无效: {}", url)));
        }

        let section = channels_section();
        let key = self.resolve_key(&section, new.key, "channel")?;
        self.add(
            &section,
            Channel {
                key,
                name,
                url,
                enabled: true,
                extraction_mode: new.extraction_mode,
                is_custom: true,
            },
        )
    }

    pub fn remove_channel(&self, key: &str) -> Result<(), RegistryError> {
        self.remove(&channels_section(), key)
    }

    pub fn set_channel_enabled(&self, key: &str, enabled: bool) -> Result<(), RegistryError> {
        self.set_enabled(&channels_section(), key, enabled)
    }
}
