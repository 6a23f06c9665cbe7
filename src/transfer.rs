//! 配置导入导出
//! 把存储中的所有键导出为一个 JSON 对象，或从文件 / 远程地址导入

use crate::http_client::{self, HttpClientError};
use crate::store::{keys, Store, StoreError};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("配置中缺少代理地址 (relay_base)")]
    MissingRelay,
    #[error("配置格式错误: {0}")]
    InvalidFormat(String),
    #[error("获取远程配置失败: {0}")]
    Fetch(#[from] HttpClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 导入结果
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub keys: Vec<String>,
}

/// 导出所有键，能解析为 JSON 的值按 JSON 输出，其余按字符串输出
pub fn export(store: &dyn Store) -> Result<Map<String, Value>, StoreError> {
    let mut data = Map::new();
    for key in store.list()? {
        let Some(raw) = store.get(&key)? else {
            continue;
        };
        let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
        data.insert(key, value);
    }
    Ok(data)
}

/// 导入配置，必须包含非空的 relay_base
pub fn import(store: &dyn Store, data: Map<String, Value>) -> Result<ImportSummary, TransferError> {
    let has_relay = matches!(
        data.get(keys::RELAY_BASE),
        Some(Value::String(s)) if !s.trim().is_empty()
    );
    if !has_relay {
        return Err(TransferError::MissingRelay);
    }

    let mut imported = Vec::with_capacity(data.len());
    for (key, value) in data {
        let raw = match value {
            Value::String(s) => s,
            other => serde_json::to_string(&other).map_err(StoreError::from)?,
        };
        store.set(&key, &raw)?;
        imported.push(key);
    }

    info!("📦 导入配置: {} 个键", imported.len());
    Ok(ImportSummary {
        imported: imported.len(),
        keys: imported,
    })
}

/// 解析配置文本
pub fn parse(text: &str) -> Result<Map<String, Value>, TransferError> {
    match serde_json::from_str(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(TransferError::InvalidFormat("需要 JSON 对象".to_string())),
        Err(e) => Err(TransferError::InvalidFormat(e.to_string())),
    }
}

/// 直接请求远程配置 (此时中转可能还未配置)
pub async fn fetch_remote(url: &str) -> Result<Map<String, Value>, TransferError> {
    info!("📡 获取远程配置: {}", url);
    let text = http_client::get_text(url).await?;
    parse(&text)
}
