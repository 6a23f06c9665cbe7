use crate::store::{self, keys, Store};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::{Client, Response};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const TIMEOUT_SECONDS: u64 = 15;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36 (MorphoTV)";

/// 全局 HTTP 客户端
pub static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(TIMEOUT_SECONDS))
        .user_agent(USER_AGENT)
        .gzip(true)
        .brotli(true)
        .build()
        .expect("Failed to create HTTP client")
});

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("请求超时")]
    Timeout,
    #[error("请求失败: {0}")]
    RequestFailed(String),
    #[error("响应异常状态码: {0}")]
    BadStatus(u16),
    #[error("代理地址未初始化")]
    RelayNotConfigured,
}

impl From<reqwest::Error> for HttpClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HttpClientError::Timeout
        } else {
            HttpClientError::RequestFailed(e.to_string())
        }
    }
}

fn check_status(response: Response) -> Result<Response, HttpClientError> {
    if !response.status().is_success() {
        return Err(HttpClientError::BadStatus(response.status().as_u16()));
    }
    Ok(response)
}

/// GET 请求并返回文本
pub async fn get_text(url: &str) -> Result<String, HttpClientError> {
    let response = HTTP_CLIENT
        .get(url)
        .header("Accept-Language", "zh-CN,zh;q=0.9,en;q=0.8")
        .send()
        .await?;
    let response = check_status(response)?;
    Ok(response.text().await?)
}

/// POST 请求 (JSON body，Bearer 鉴权) 并返回文本
pub async fn post_json_text<T: serde::Serialize>(
    url: &str,
    body: &T,
    bearer: Option<&str>,
) -> Result<String, HttpClientError> {
    let mut req = HTTP_CLIENT.post(url).json(body);

    if let Some(token) = bearer {
        req = req.bearer_auth(token);
    }

    let response = check_status(req.send().await?)?;
    Ok(response.text().await?)
}

// ============================================================================
// 中转
// ============================================================================

/// 跨域中转网关，所有访问第三方站点的请求都经过它
#[async_trait]
pub trait Relay: Send + Sync {
    /// 中转地址是否已配置
    fn is_configured(&self) -> bool;

    /// 通过中转 GET 目标地址
    async fn get_text(&self, target_url: &str) -> Result<String, HttpClientError>;
}

/// 拼接中转地址: `{base}{encodeURIComponent(target)}`
pub fn relay_url(base: &str, target_url: &str) -> String {
    format!("{}{}", base, urlencoding::encode(target_url))
}

/// m3u8 地址在选择了播放代理时加上代理前缀，其余原样返回
pub fn stream_url(stream_relay: Option<&str>, url: &str) -> String {
    match stream_relay.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prefix) if url.contains(".m3u8") => format!("{}{}", prefix, url),
        _ => url.to_string(),
    }
}

/// 基于 HTTP 的中转实现，每次请求时读取存储中的中转地址
pub struct HttpRelay {
    store: Arc<dyn Store>,
    fallback_base: Option<String>,
}

impl HttpRelay {
    pub fn new(store: Arc<dyn Store>, fallback_base: Option<String>) -> Self {
        Self {
            store,
            fallback_base: fallback_base.filter(|b| !b.trim().is_empty()),
        }
    }

    fn base(&self) -> Option<String> {
        store::get_non_empty(self.store.as_ref(), keys::RELAY_BASE)
            .ok()
            .flatten()
            .or_else(|| self.fallback_base.clone())
    }
}

#[async_trait]
impl Relay for HttpRelay {
    fn is_configured(&self) -> bool {
        self.base().is_some()
    }

    async fn get_text(&self, target_url: &str) -> Result<String, HttpClientError> {
        let base = self.base().ok_or(HttpClientError::RelayNotConfigured)?;
        let url = relay_url(&base, target_url);
        debug!("中转请求: {}", target_url);
        get_text(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_relay_url_encodes_target() {
        assert_eq!(
            relay_url("https://relay.example/proxy/", "https://a.com/api.php?wd=仙逆&ac=videolist"),
            "https://relay.example/proxy/https%3A%2F%2Fa.com%2Fapi.php%3Fwd%3D%E4%BB%99%E9%80%86%26ac%3Dvideolist"
        );
    }

    #[test]
    fn test_stream_url() {
        assert_eq!(
            stream_url(Some("https://p.example/"), "https://v.com/a/index.m3u8"),
            "https://p.example/https://v.com/a/index.m3u8"
        );
        assert_eq!(
            stream_url(Some("https://p.example/"), "https://v.com/a.mp4"),
            "https://v.com/a.mp4"
        );
        assert_eq!(stream_url(Some("  "), "https://v.com/a.m3u8"), "https://v.com/a.m3u8");
        assert_eq!(stream_url(None, "https://v.com/a.m3u8"), "https://v.com/a.m3u8");
    }

    #[test]
    fn test_relay_base_prefers_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let relay = HttpRelay::new(store.clone(), None);
        assert!(!relay.is_configured());

        let relay = HttpRelay::new(store.clone(), Some("https://env.example/".into()));
        assert_eq!(relay.base().as_deref(), Some("https://env.example/"));

        store.set(keys::RELAY_BASE, "https://stored.example/").unwrap();
        assert_eq!(relay.base().as_deref(), Some("https://stored.example/"));
    }

    #[tokio::test]
    async fn test_unconfigured_relay_refuses() {
        let relay = HttpRelay::new(Arc::new(MemoryStore::new()), None);
        let err = relay.get_text("https://a.com").await.unwrap_err();
        assert!(matches!(err, HttpClientError::RelayNotConfigured));
    }
}
