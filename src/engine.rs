//! 单个资源站 / 频道的请求
//! 所有请求都经过中转，每个请求单独计时，失败只影响当前站点

use crate::config::AppConfig;
use crate::douban::{self, HotQuery, RecentHot};
use crate::error::EngineError;
use crate::extract::llm::{ChatCompletion, LlmSettings};
use crate::extract::{catalog, ExtractContext, LlmExtractor, Strategy};
use crate::http_client::Relay;
use crate::store::Store;
use crate::merge::merge;
use crate::types::{Channel, CloudResource, NormalizedWork, Source, WorkDetail};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 测速结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub key: String,
    pub name: String,
    /// 不可用时为 null
    pub latency_ms: Option<u64>,
}

pub struct Engine {
    relay: Arc<dyn Relay>,
    chat: Arc<dyn ChatCompletion>,
    store: Arc<dyn Store>,
    config: Arc<AppConfig>,
    timeout: Duration,
}

impl Engine {
    pub fn new(
        relay: Arc<dyn Relay>,
        chat: Arc<dyn ChatCompletion>,
        store: Arc<dyn Store>,
        config: Arc<AppConfig>,
    ) -> Self {
        let timeout = config.request_timeout();
        Self {
            relay,
            chat,
            store,
            config,
            timeout,
        }
    }

    pub fn chat(&self) -> &dyn ChatCompletion {
        self.chat.as_ref()
    }

    /// 已保存的 AI 设置，缺失时用环境变量
    pub fn llm_settings(&self) -> Option<LlmSettings> {
        LlmSettings::load(self.store.as_ref(), &self.config)
    }

    pub fn relay_configured(&self) -> bool {
        self.relay.is_configured()
    }

    /// 中转未配置时拒绝发起任何请求
    pub fn ensure_relay(&self) -> Result<(), EngineError> {
        if self.relay.is_configured() {
            Ok(())
        } else {
            Err(EngineError::RelayNotConfigured)
        }
    }

    /// 带超时的中转请求
    async fn fetch(&self, url: &str) -> Result<String, EngineError> {
        match tokio::time::timeout(self.timeout, self.relay.get_text(url)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::SourceUnreachable(format!(
                "请求超时 ({}s)",
                self.timeout.as_secs()
            ))),
        }
    }

    /// 当前的 LLM 提取器，每次读取最新设置
    fn llm_extractor(&self) -> Arc<LlmExtractor> {
        Arc::new(LlmExtractor::new(Arc::clone(&self.chat), self.llm_settings()))
    }

    /// 在资源站搜索作品
    pub async fn search_source(
        &self,
        source: &Source,
        keyword: &str,
    ) -> Result<Vec<NormalizedWork>, EngineError> {
        let raw = self.fetch(&catalog::search_url(&source.api, keyword)).await?;
        let ctx = ExtractContext::for_source(source, keyword);
        let works = merge(Strategy::Json.extract(&raw, &ctx).await?).works;
        debug!("资源站 {} 找到 {} 个结果", source.name, works.len());
        Ok(works)
    }

    /// 获取作品详情 (含剧集)
    pub async fn fetch_detail(&self, source: &Source, id: &str) -> Result<WorkDetail, EngineError> {
        let raw = self.fetch(&catalog::detail_url(&source.api, id)).await?;
        let ctx = ExtractContext::for_source(source, "");
        catalog::parse_detail(&raw, &ctx)?.ok_or(EngineError::WorkNotFound)
    }

    /// 在频道搜索网盘资源，按频道配置选择提取策略
    pub async fn search_channel(
        &self,
        channel: &Channel,
        keyword: &str,
    ) -> Result<Vec<CloudResource>, EngineError> {
        let raw = self.fetch(&channel.search_url(keyword)).await?;
        let strategy = Strategy::for_channel(channel, &self.llm_extractor());
        let ctx = ExtractContext::for_channel(channel, keyword);

        // 同一频道内重复转发的链接也只保留最新一条
        let resources = merge(strategy.extract(&raw, &ctx).await?).resources;
        debug!(
            "频道 {} ({}) 找到 {} 个资源",
            channel.name,
            strategy.name(),
            resources.len()
        );
        Ok(resources)
    }

    /// 豆瓣近期热门，同样经过中转
    pub async fn recent_hot(&self, query: &HotQuery) -> Result<RecentHot, EngineError> {
        self.ensure_relay()?;
        let raw = self.fetch(&query.url()).await?;
        douban::parse(&raw, query.start)
    }

    /// 并发测速所有资源站
    pub async fn probe_sources(
        &self,
        sources: &[Source],
        keyword: &str,
    ) -> Result<Vec<ProbeResult>, EngineError> {
        self.ensure_relay()?;
        Ok(futures::future::join_all(sources.iter().map(|s| {
            timed(&s.key, &s.name, self.search_source(s, keyword))
        }))
        .await)
    }

    /// 并发测速所有频道
    pub async fn probe_channels(
        &self,
        channels: &[Channel],
        keyword: &str,
    ) -> Result<Vec<ProbeResult>, EngineError> {
        self.ensure_relay()?;
        Ok(futures::future::join_all(channels.iter().map(|c| {
            timed(&c.key, &c.name, self.search_channel(c, keyword))
        }))
        .await)
    }
}

/// 测速: 执行一次请求，返回耗时
async fn timed<T>(
    key: &str,
    name: &str,
    request: impl Future<Output = Result<T, EngineError>>,
) -> ProbeResult {
    let started = Instant::now();
    let latency_ms = match request.await {
        Ok(_) => Some(started.elapsed().as_millis() as u64),
        Err(e) => {
            warn!("{} 测速失败: {}", name, e);
            None
        }
    };
    ProbeResult {
        key: key.to_string(),
        name: name.to_string(),
        latency_ms,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! 测试用的假中转和假 LLM

    use super::*;
    use crate::extract::llm::ChatMessage;
    use crate::http_client::HttpClientError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Clone)]
    pub enum Reply {
        Body(String),
        Status(u16),
        /// 等待若干秒后返回
        Slow(u64, String),
        Hang,
    }

    /// 按地址中包含的片段返回预设响应
    #[derive(Default)]
    pub struct FakeRelay {
        pub replies: Mutex<Vec<(String, Reply)>>,
        pub requests: Mutex<Vec<String>>,
        pub unconfigured: bool,
    }

    impl FakeRelay {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn unconfigured() -> Self {
            Self {
                unconfigured: true,
                ..Self::default()
            }
        }

        pub fn on(self, fragment: &str, reply: Reply) -> Self {
            self.replies.lock().unwrap().push((fragment.to_string(), reply));
            self
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Relay for FakeRelay {
        fn is_configured(&self) -> bool {
            !self.unconfigured
        }

        async fn get_text(&self, target_url: &str) -> Result<String, HttpClientError> {
            if self.unconfigured {
                return Err(HttpClientError::RelayNotConfigured);
            }
            self.requests.lock().unwrap().push(target_url.to_string());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .iter()
                .find(|(fragment, _)| target_url.contains(fragment.as_str()))
                .map(|(_, reply)| reply.clone());
            match reply {
                Some(Reply::Body(body)) => Ok(body),
                Some(Reply::Status(code)) => Err(HttpClientError::BadStatus(code)),
                Some(Reply::Slow(secs, body)) => {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    Ok(body)
                }
                Some(Reply::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(HttpClientError::Timeout)
                }
                None => Err(HttpClientError::RequestFailed("connection refused".into())),
            }
        }
    }

    pub struct NoChat;

    #[async_trait]
    impl ChatCompletion for NoChat {
        async fn complete(
            &self,
            _settings: &LlmSettings,
            _messages: &[ChatMessage],
        ) -> Result<String, EngineError> {
            Err(EngineError::ExtractionFailure("no chat".into()))
        }
    }

    pub fn source(key: &str, api: &str) -> Source {
        Source {
            key: key.to_string(),
            name: format!("站点{}", key),
            api: api.to_string(),
            enabled: true,
            is_custom: false,
        }
    }

    pub fn catalog_body(items: &[(&str, &str)]) -> String {
        let list: Vec<_> = items
            .iter()
            .map(|(id, name)| serde_json::json!({ "vod_id": id, "vod_name": name }))
            .collect();
        serde_json::json!({ "code": 1, "list": list }).to_string()
    }

    pub fn engine_with(relay: FakeRelay, timeout_secs: u64) -> (Engine, Arc<FakeRelay>) {
        let relay = Arc::new(relay);
        let config = AppConfig {
            request_timeout_secs: timeout_secs,
            ..AppConfig::default()
        };
        let engine = Engine::new(
            relay.clone(),
            Arc::new(NoChat),
            Arc::new(MemoryStore::new()),
            Arc::new(config),
        );
        (engine, relay)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::types::ExtractionMode;

    #[tokio::test]
    async fn test_search_source_parses_catalog() {
        let relay = FakeRelay::new().on("a.example", Reply::Body(catalog_body(&[("1", "仙逆")])));
        let (engine, relay) = engine_with(relay, 5);
        let works = engine
            .search_source(&source("a", "https://a.example"), "仙逆")
            .await
            .unwrap();
        assert_eq!(works.len(), 1);
        assert_eq!(works[0].source_key, "a");
        assert!(relay.requests.lock().unwrap()[0].contains("ac=videolist"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_unreachable() {
        let relay = FakeRelay::new().on("slow.example", Reply::Hang);
        let (engine, _) = engine_with(relay, 2);
        let err = engine
            .search_source(&source("slow", "https://slow.example"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceUnreachable(_)));
    }

    #[tokio::test]
    async fn test_recent_hot_goes_through_relay() {
        let body = r#"{"category":"tv","total":1,"items":[{"id":"7","title":"仙逆"}],"tags":[]}"#;
        let relay = FakeRelay::new().on("m.douban.com", Reply::Body(body.into()));
        let (engine, relay) = engine_with(relay, 5);
        let hot = engine.recent_hot(&HotQuery::default()).await.unwrap();
        assert_eq!(hot.items[0].title, "仙逆");
        assert!(relay.requests.lock().unwrap()[0].contains("limit=18"));

        let (engine, _) = engine_with(FakeRelay::unconfigured(), 5);
        assert!(matches!(
            engine.recent_hot(&HotQuery::default()).await,
            Err(EngineError::RelayNotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_fetch_detail_not_found() {
        let relay = FakeRelay::new().on("a.example", Reply::Body(r#"{"code":1,"list":[]}"#.into()));
        let (engine, _) = engine_with(relay, 5);
        let err = engine
            .fetch_detail(&source("a", "https://a.example"), "9")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkNotFound));
    }

    #[tokio::test]
    async fn test_search_channel_rule_strategy() {
        let page = r#"<div class="tgme_widget_message_wrap"><div class="tgme_widget_message_text js-message_text">标题<br><a href="https://pan.quark.cn/s/1">x</a></div></div>"#;
        let relay = FakeRelay::new().on("t.me", Reply::Body(page.into()));
        let (engine, relay) = engine_with(relay, 5);
        let channel = Channel {
            key: "tg".into(),
            name: "频道".into(),
            url: "https://t.me/s/c?q={keyword}".into(),
            enabled: true,
            extraction_mode: ExtractionMode::Rule,
            is_custom: false,
        };
        let resources = engine.search_channel(&channel, "仙 逆").await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].title, "标题");
        assert!(relay.requests.lock().unwrap()[0].ends_with("q=%E4%BB%99%20%E9%80%86"));
    }

    #[tokio::test]
    async fn test_probe_sources() {
        let relay = FakeRelay::new().on("ok.example", Reply::Body(catalog_body(&[])));
        let (engine, _) = engine_with(relay, 5);
        let results = engine
            .probe_sources(
                &[source("ok", "https://ok.example"), source("bad", "https://bad.example")],
                "测试",
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].latency_ms.is_some());
        assert!(results[1].latency_ms.is_none());

        let (engine, _) = engine_with(FakeRelay::unconfigured(), 5);
        assert!(matches!(
            engine.probe_sources(&[], "x").await,
            Err(EngineError::RelayNotConfigured)
        ));
    }
}
