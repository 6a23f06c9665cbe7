//! 核心搜索逻辑
//! 并发请求所有启用的资源站 / 频道，汇总结果或以 NDJSON 流式返回

use crate::engine::Engine;
use crate::error::EngineError;
use crate::merge::{merge_resources, merge_works, SeenLinks};
use crate::types::{
    Channel, CloudResource, NormalizedWork, Source, SourceSearchResult, StreamEvent, StreamProgress,
    StreamResult,
};
use futures::stream::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

// ============================================================================
// 查询代次
// ============================================================================

/// 同一类搜索的代次计数，新查询开始后旧查询的结果全部作废
#[derive(Debug, Default, Clone)]
pub struct QueryScope {
    generation: Arc<AtomicU64>,
}

impl QueryScope {
    pub fn begin(&self) -> QueryTicket {
        let id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        QueryTicket {
            generation: Arc::clone(&self.generation),
            id,
        }
    }

    /// 还有未结束的查询持有票据
    fn in_flight(&self) -> bool {
        Arc::strong_count(&self.generation) > 1
    }
}

/// 按客户端令牌分开的代次，只有同一令牌的新查询才会取代旧查询
#[derive(Debug, Default)]
pub struct ClientScopes {
    scopes: Mutex<HashMap<String, QueryScope>>,
}

impl ClientScopes {
    /// 没有令牌的查询独占一个代次，不会被取代
    pub fn begin(&self, token: Option<&str>) -> QueryTicket {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return QueryScope::default().begin();
        };
        let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        scopes.retain(|_, scope| scope.in_flight());
        scopes.entry(token.to_string()).or_default().begin()
    }
}

#[derive(Debug, Clone)]
pub struct QueryTicket {
    generation: Arc<AtomicU64>,
    id: u64,
}

impl QueryTicket {
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.id
    }
}

// ============================================================================
// 并发请求
// ============================================================================

/// 可被并发查询的条目
pub trait FanOutTarget {
    fn key(&self) -> &str;
    fn name(&self) -> &str;
}

impl FanOutTarget for Source {
    fn key(&self) -> &str {
        &self.key
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl FanOutTarget for Channel {
    fn key(&self) -> &str {
        &self.key
    }
    fn name(&self) -> &str {
        &self.name
    }
}

/// 汇总结果
#[derive(Debug, Clone, Serialize)]
pub struct FanOutReport<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub failed: usize,
    /// 已被新的查询取代，结果被丢弃
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub superseded: bool,
}

impl<T> FanOutReport<T> {
    fn superseded(total: usize) -> Self {
        Self {
            items: Vec::new(),
            total,
            failed: 0,
            superseded: true,
        }
    }

    /// 有请求且全部失败
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.failed == self.total
    }
}

/// 并发请求所有条目，失败的条目记录日志后排除，成功的批次交给 `merge` 合并
pub async fn fan_out<E, T, F, Fut, M>(
    targets: Vec<E>,
    ticket: &QueryTicket,
    fetch: F,
    merge: M,
) -> FanOutReport<T>
where
    E: FanOutTarget,
    F: Fn(E) -> Fut,
    Fut: Future<Output = Result<Vec<T>, EngineError>>,
    M: FnOnce(Vec<Vec<T>>) -> Vec<T>,
{
    let total = targets.len();
    let tasks = targets.into_iter().map(|target| {
        let name = target.name().to_string();
        let fut = fetch(target);
        async move { (name, fut.await) }
    });
    let results = futures::future::join_all(tasks).await;

    if !ticket.is_current() {
        debug!("查询已过期, 丢弃 {} 个结果", results.len());
        return FanOutReport::superseded(total);
    }

    let mut batches = Vec::new();
    let mut failed = 0;
    for (name, result) in results {
        match result {
            Ok(batch) => batches.push(batch),
            Err(e) => {
                warn!("{} 请求失败, 已跳过: {}", name, e);
                failed += 1;
            }
        }
    }

    FanOutReport {
        items: merge(batches),
        total,
        failed,
        superseded: false,
    }
}

/// 协调器: 持有引擎和每类搜索的客户端代次
pub struct Coordinator {
    engine: Arc<Engine>,
    works: ClientScopes,
    resources: ClientScopes,
}

impl Coordinator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            works: ClientScopes::default(),
            resources: ClientScopes::default(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// 搜索作品并汇总
    pub async fn search_works(
        &self,
        sources: Vec<Source>,
        keyword: &str,
        token: Option<&str>,
    ) -> Result<FanOutReport<NormalizedWork>, EngineError> {
        self.engine.ensure_relay()?;
        let ticket = self.works.begin(token);
        info!("开始搜索作品: {}, 共 {} 个资源站", keyword, sources.len());

        let engine = &self.engine;
        let report = fan_out(
            sources,
            &ticket,
            |source| async move { engine.search_source(&source, keyword).await },
            merge_works,
        )
        .await;

        info!(
            "作品搜索完成: {}, {} 个结果, {} 个失败",
            keyword,
            report.items.len(),
            report.failed
        );
        Ok(report)
    }

    /// 搜索网盘资源并去重
    pub async fn search_resources(
        &self,
        channels: Vec<Channel>,
        keyword: &str,
        token: Option<&str>,
    ) -> Result<FanOutReport<CloudResource>, EngineError> {
        self.engine.ensure_relay()?;
        let ticket = self.resources.begin(token);
        info!("开始搜索网盘资源: {}, 共 {} 个频道", keyword, channels.len());

        let engine = &self.engine;
        let report = fan_out(
            channels,
            &ticket,
            |channel| async move { engine.search_channel(&channel, keyword).await },
            merge_resources,
        )
        .await;

        info!("网盘搜索完成: {}, {} 个资源", keyword, report.items.len());
        Ok(report)
    }

    /// 流式搜索作品
    pub fn stream_works(
        &self,
        sources: Vec<Source>,
        keyword: String,
        token: Option<&str>,
    ) -> Result<impl Stream<Item = String>, EngineError> {
        self.engine.ensure_relay()?;
        let ticket = self.works.begin(token);
        let engine = Arc::clone(&self.engine);
        let label = keyword.clone();

        Ok(stream_fan_out(
            label,
            sources,
            ticket,
            move |source: Source| {
                let engine = Arc::clone(&engine);
                let keyword = keyword.clone();
                async move { engine.search_source(&source, &keyword).await }
            },
            |works: Vec<NormalizedWork>| works,
        ))
    }

    /// 流式搜索网盘资源
    /// 跨频道重复的链接只在发布时间更新时再次发送，客户端按 shareUrl 以后到的为准
    pub fn stream_resources(
        &self,
        channels: Vec<Channel>,
        keyword: String,
        token: Option<&str>,
    ) -> Result<impl Stream<Item = String>, EngineError> {
        self.engine.ensure_relay()?;
        let ticket = self.resources.begin(token);
        let engine = Arc::clone(&self.engine);
        let label = keyword.clone();
        let seen = SeenLinks::default();

        Ok(stream_fan_out(
            label,
            channels,
            ticket,
            move |channel: Channel| {
                let engine = Arc::clone(&engine);
                let keyword = keyword.clone();
                async move { engine.search_channel(&channel, &keyword).await }
            },
            move |batch: Vec<CloudResource>| seen.admit(batch),
        ))
    }
}

// ============================================================================
// 流式响应
// ============================================================================

fn stream_fan_out<E, T, F, Fut, A>(
    label: String,
    targets: Vec<E>,
    ticket: QueryTicket,
    fetch: F,
    admit: A,
) -> impl Stream<Item = String>
where
    E: FanOutTarget + Send + 'static,
    T: Serialize + Send + 'static,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, EngineError>> + Send + 'static,
    A: Fn(Vec<T>) -> Vec<T> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel::<String>(100);

    tokio::spawn(async move {
        execute_parallel_search(label, targets, ticket, fetch, Arc::new(admit), tx).await;
    });

    ReceiverStream::new(rx)
}

/// 并行执行搜索，每个条目完成时推送一行事件；`admit` 过滤每批要发送的结果
async fn execute_parallel_search<E, T, F, Fut, A>(
    label: String,
    targets: Vec<E>,
    ticket: QueryTicket,
    fetch: F,
    admit: Arc<A>,
    tx: mpsc::Sender<String>,
) where
    E: FanOutTarget + Send + 'static,
    T: Serialize + Send + 'static,
    F: Fn(E) -> Fut,
    Fut: Future<Output = Result<Vec<T>, EngineError>> + Send + 'static,
    A: Fn(Vec<T>) -> Vec<T> + Send + Sync + 'static,
{
    let total = targets.len();
    let completed = Arc::new(AtomicUsize::new(0));

    info!("开始流式搜索: {}, 共 {} 个站点", label, total);

    if tx.send(format_event(&StreamEvent::<T>::Init { total })).await.is_err() {
        return;
    }

    let mut handles = Vec::new();

    for target in targets {
        let key = target.key().to_string();
        let name = target.name().to_string();
        let fut = fetch(target);
        let tx = tx.clone();
        let completed = completed.clone();
        let ticket = ticket.clone();
        let admit = Arc::clone(&admit);

        handles.push(tokio::spawn(async move {
            let result = fut.await;
            if !ticket.is_current() {
                return;
            }
            let current = completed.fetch_add(1, Ordering::SeqCst) + 1;
            let progress = StreamProgress {
                completed: current,
                total,
            };

            let result = match result {
                Ok(items) => SourceSearchResult::with_items((*admit)(items)),
                Err(e) => {
                    warn!("{} 请求失败: {}", name, e);
                    SourceSearchResult::with_error(e.to_string())
                }
            };
            debug!("{} 完成: {} 个结果", name, result.count);

            // 只有有结果或有错误时才发送结果
            let event = if result.count > 0 || result.error.is_some() {
                StreamEvent::Result {
                    progress,
                    result: StreamResult {
                        key,
                        name,
                        items: result.items,
                        error: result.error,
                    },
                }
            } else {
                StreamEvent::Progress { progress }
            };

            let _ = tx.send(format_event(&event)).await;
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    if !ticket.is_current() {
        info!("流式搜索已被取代: {}", label);
        return;
    }

    let _ = tx.send(format_event(&StreamEvent::<T>::Done { done: true })).await;
    info!("流式搜索完成: {}", label);
}

/// 单行 JSON
fn format_event<T: Serialize>(event: &StreamEvent<T>) -> String {
    format!("{}\n", serde_json::to_string(event).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use futures::StreamExt;

    fn coordinator(relay: FakeRelay, timeout_secs: u64) -> (Coordinator, Arc<FakeRelay>) {
        let (engine, relay) = engine_with(relay, timeout_secs);
        (Coordinator::new(Arc::new(engine)), relay)
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_is_union_of_successes() {
        let relay = FakeRelay::new()
            .on("a.example", Reply::Body(catalog_body(&[("1", "仙逆"), ("2", "仙逆 剧场版")])))
            .on("b.example", Reply::Status(500))
            .on("c.example", Reply::Body("not json".into()))
            .on("d.example", Reply::Hang)
            .on("e.example", Reply::Body(catalog_body(&[("9", "仙逆")])));
        let (coordinator, _) = coordinator(relay, 3);

        let sources = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|k| source(k, &format!("https://{}.example", k)))
            .collect();
        let report = coordinator.search_works(sources, "仙逆", None).await.unwrap();

        assert_eq!(report.total, 5);
        assert_eq!(report.failed, 3);
        assert!(!report.all_failed());
        let ids: Vec<_> = report
            .items
            .iter()
            .map(|w| (w.source_key.as_str(), w.id.as_str()))
            .collect();
        assert_eq!(ids, vec![("a", "1"), ("a", "2"), ("e", "9")]);
    }

    #[tokio::test]
    async fn test_all_failed_is_empty_report() {
        let relay = FakeRelay::new().on("a.example", Reply::Status(502));
        let (coordinator, _) = coordinator(relay, 5);
        let report = coordinator
            .search_works(
                vec![source("a", "https://a.example"), source("b", "https://b.example")],
                "x",
                None,
            )
            .await
            .unwrap();
        assert!(report.items.is_empty());
        assert!(report.all_failed());
    }

    #[tokio::test]
    async fn test_relay_missing_sends_nothing() {
        let (coordinator, relay) = coordinator(FakeRelay::unconfigured(), 5);
        let err = coordinator
            .search_works(vec![source("a", "https://a.example")], "x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RelayNotConfigured));
        assert_eq!(relay.request_count(), 0);
        assert!(coordinator.stream_works(vec![], "x".into(), None).is_err());
    }

    #[tokio::test]
    async fn test_stale_ticket_discards_results() {
        let scope = QueryScope::default();
        let ticket = scope.begin();
        let report = fan_out(
            vec![source("a", "https://a.example")],
            &ticket,
            |_| {
                // 请求进行中开始了新查询
                let _newer = scope.begin();
                async { Ok(vec![1]) }
            },
            |batches: Vec<Vec<i32>>| batches.concat(),
        )
        .await;
        assert!(report.superseded);
        assert!(report.items.is_empty());

        let fresh = scope.begin();
        let report = fan_out(
            vec![source("a", "https://a.example")],
            &fresh,
            |_| async { Ok(vec![1]) },
            |batches: Vec<Vec<i32>>| batches.concat(),
        )
        .await;
        assert!(!report.superseded);
        assert_eq!(report.items, vec![1]);
    }

    #[tokio::test]
    async fn test_stream_events() {
        let relay = FakeRelay::new()
            .on("a.example", Reply::Body(catalog_body(&[("1", "仙逆")])))
            .on("b.example", Reply::Body(catalog_body(&[])))
            .on("c.example", Reply::Status(404));
        let (coordinator, _) = coordinator(relay, 5);
        let sources = vec![
            source("a", "https://a.example"),
            source("b", "https://b.example"),
            source("c", "https://c.example"),
        ];
        let lines: Vec<String> = coordinator
            .stream_works(sources, "仙逆".into(), None)
            .unwrap()
            .collect()
            .await;

        let events: Vec<serde_json::Value> = lines
            .iter()
            .map(|l| serde_json::from_str(l.trim_end()).unwrap())
            .collect();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0]["type"], "init");
        assert_eq!(events[0]["total"], 3);
        assert_eq!(events[4]["type"], "done");

        let results: Vec<_> = events.iter().filter(|e| e["type"] == "result").collect();
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|e| e["result"]["key"] == "a"));
        assert!(results
            .iter()
            .any(|e| e["result"]["key"] == "c" && e["result"]["error"].is_string()));
        assert_eq!(events.iter().filter(|e| e["type"] == "progress").count(), 1);
    }

    fn channel_page(time: &str) -> String {
        format!(
            r#"<div class="tgme_widget_message_wrap"><div class="tgme_widget_message_text js-message_text">仙逆<br><a href="https://pan.quark.cn/s/same">x</a></div><time datetime="{}"></time></div>"#,
            time
        )
    }

    fn channel(key: &str) -> Channel {
        Channel {
            key: key.into(),
            name: key.into(),
            url: format!("https://t.me/s/{}?q={{keyword}}", key),
            enabled: true,
            extraction_mode: Default::default(),
            is_custom: false,
        }
    }

    #[tokio::test]
    async fn test_resources_deduplicated_across_channels() {
        let relay = FakeRelay::new()
            .on("one", Reply::Body(channel_page("2024-05-01T00:00:00+00:00")))
            .on("two", Reply::Body(channel_page("2024-06-01T00:00:00+00:00")));
        let (coordinator, _) = coordinator(relay, 5);
        let report = coordinator
            .search_resources(vec![channel("one"), channel("two")], "仙逆", None)
            .await
            .unwrap();
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].source_channel, "two");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_resources_skip_older_duplicates() {
        // 较新的频道先返回，较旧的重复链接不应再发出
        let relay = FakeRelay::new()
            .on("one", Reply::Slow(2, channel_page("2024-05-01T00:00:00+00:00")))
            .on("two", Reply::Body(channel_page("2024-06-01T00:00:00+00:00")));
        let (coordinator, _) = coordinator(relay, 5);
        let lines: Vec<String> = coordinator
            .stream_resources(vec![channel("one"), channel("two")], "仙逆".into(), None)
            .unwrap()
            .collect()
            .await;

        let events: Vec<serde_json::Value> = lines
            .iter()
            .map(|l| serde_json::from_str(l.trim_end()).unwrap())
            .collect();
        let emitted: Vec<&serde_json::Value> = events
            .iter()
            .filter(|e| e["type"] == "result")
            .flat_map(|e| e["result"]["items"].as_array().into_iter().flatten())
            .filter(|item| item["shareUrl"] == "https://pan.quark.cn/s/same")
            .collect();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0]["sourceChannel"], "two");
        assert_eq!(events.last().unwrap()["type"], "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_do_not_supersede_each_other() {
        let relay = FakeRelay::new()
            .on("a.example", Reply::Slow(2, catalog_body(&[("1", "仙逆")])))
            .on("b.example", Reply::Slow(1, catalog_body(&[("7", "仙逆")])));
        let (coordinator, _) = coordinator(relay, 5);

        let (first, second) = tokio::join!(
            coordinator.search_works(vec![source("a", "https://a.example")], "仙逆", Some("client-a")),
            coordinator.search_works(vec![source("b", "https://b.example")], "仙逆", Some("client-b")),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(!first.superseded);
        assert!(!second.superseded);
        assert_eq!(first.items.len(), 1);
        assert_eq!(second.items.len(), 1);

        // 不带令牌的查询同样互不影响
        let (first, second) = tokio::join!(
            coordinator.search_works(vec![source("a", "https://a.example")], "仙逆", None),
            coordinator.search_works(vec![source("b", "https://b.example")], "仙逆", None),
        );
        assert!(!first.unwrap().superseded);
        assert!(!second.unwrap().superseded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_token_supersedes_older_query() {
        let relay = FakeRelay::new()
            .on("a.example", Reply::Slow(2, catalog_body(&[("1", "仙逆")])))
            .on("b.example", Reply::Slow(1, catalog_body(&[("7", "仙逆")])));
        let (coordinator, _) = coordinator(relay, 5);

        let (first, second) = tokio::join!(
            coordinator.search_works(vec![source("a", "https://a.example")], "仙逆", Some("client-a")),
            coordinator.search_works(vec![source("b", "https://b.example")], "仙逆", Some("client-a")),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.superseded);
        assert!(first.items.is_empty());
        assert!(!second.superseded);
        assert_eq!(second.items[0].id, "7");
    }
}
