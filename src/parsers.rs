//! 在线解析接口
//! 用户维护的 `{name, url}` 列表，url 中的 `{url}` 会被替换成编码后的播放地址

use crate::episodes::is_absolute_http;
use crate::registry::RegistryError;
use crate::store::{self, keys, Store, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;

/// 解析地址中的占位符
pub const PLACEHOLDER: &str = "{url}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineParser {
    pub name: String,
    pub url: String,
}

impl OnlineParser {
    /// 生成解析后的播放页地址
    pub fn resolve(&self, video_url: &str) -> String {
        self.url.replacen(PLACEHOLDER, &urlencoding::encode(video_url), 1)
    }
}

#[derive(Clone)]
pub struct ParserList {
    store: Arc<dyn Store>,
    lock: Arc<Mutex<()>>,
}

impl ParserList {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn list(&self) -> Result<Vec<OnlineParser>, RegistryError> {
        Ok(store::get_json(self.store.as_ref(), keys::ONLINE_PARSERS)?.unwrap_or_default())
    }

    /// 追加到末尾，名称不能重复
    pub fn add(&self, name: &str, url: &str) -> Result<OnlineParser, RegistryError> {
        let name = name.trim();
        let url = url.trim();
        if name.is_empty() || url.is_empty() {
            return Err(RegistryError::Invalid("名称和地址不能为空".to_string()));
        }
        if !is_absolute_http(url) {
            return Err(RegistryError::Invalid(format!("无效的地址: {}", url)));
        }
        if !url.contains(PLACEHOLDER) {
            return Err(RegistryError::Invalid(format!("地址必须包含 {}", PLACEHOLDER)));
        }

        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut parsers = self.list()?;
        if parsers.iter().any(|p| p.name == name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        let parser = OnlineParser {
            name: name.to_string(),
            url: url.to_string(),
        };
        parsers.push(parser.clone());
        store::set_json(self.store.as_ref(), keys::ONLINE_PARSERS, &parsers)?;
        info!("添加解析接口: {}", parser.name);
        Ok(parser)
    }

    pub fn remove(&self, index: usize) -> Result<OnlineParser, RegistryError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut parsers = self.list()?;
        if index >= parsers.len() {
            return Err(RegistryError::NotFound(format!("解析接口 #{}", index)));
        }
        let removed = parsers.remove(index);
        store::set_json(self.store.as_ref(), keys::ONLINE_PARSERS, &parsers)?;
        Ok(removed)
    }

    /// 按名称取解析接口并生成地址；不指定名称时用第一个
    pub fn resolve(&self, name: Option<&str>, video_url: &str) -> Result<String, RegistryError> {
        if !is_absolute_http(video_url) {
            return Err(RegistryError::Invalid(format!("无效的播放地址: {}", video_url)));
        }
        let parsers = self.list()?;
        let parser = match name {
            Some(name) => parsers.iter().find(|p| p.name == name),
            None => parsers.first(),
        }
        .ok_or_else(|| RegistryError::NotFound(name.unwrap_or("解析接口").to_string()))?;
        Ok(parser.resolve(video_url))
    }
}
