mod benchmark;
mod config;
mod core;
mod douban;
mod engine;
mod episodes;
mod equivalence;
mod error;
mod extract;
mod history;
mod http_client;
mod merge;
mod parsers;
mod registry;
mod session;
mod store;
mod transfer;
mod types;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::benchmark::BenchmarkPlan;
use crate::config::AppConfig;
use crate::core::Coordinator;
use crate::douban::HotQuery;
use crate::engine::Engine;
use crate::error::{ApiError, ApiResult};
use crate::extract::llm::{ChatCompletion, HttpChat, LlmSettings};
use crate::history::HistoryStore;
use crate::http_client::{HttpRelay, Relay};
use crate::merge::platform_counts;
use crate::parsers::ParserList;
use crate::registry::{NewChannel, NewSource, Registry};
use crate::session::{CommandEngineFactory, CommandOutbox, PlaybackSession, PlayerEvent, PlayerView};
use crate::store::{keys, FileStore, Store};
use crate::types::SortOrder;

/// 测速默认关键词
const PROBE_KEYWORD: &str = "测试";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "morpho_search_api=info,tower_http=info".into()),
        )
        .with(fmt::layer().with_target(false))
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    let store: Arc<dyn Store> = Arc::new(FileStore::open(&config.data_file)?);
    let relay: Arc<dyn Relay> = Arc::new(HttpRelay::new(store.clone(), config.relay_base.clone()));
    let state = AppState::new(config.clone(), store, relay, Arc::new(HttpChat));

    if !state.engine().relay_configured() {
        info!("⚠️ 代理地址未初始化, 请通过 PUT /config/relay 或 POST /config/import 设置");
    }
    info!(
        "📚 已加载 {} 个资源站, {} 个频道",
        state.registry.sources()?.len(),
        state.registry.channels()?.len()
    );

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!("🚀 聚合搜索 API 启动在 http://{}", config.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// 状态与路由
// ============================================================================

#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    store: Arc<dyn Store>,
    registry: Registry,
    parsers: ParserList,
    coordinator: Arc<Coordinator>,
    history: Arc<HistoryStore>,
    session: Arc<Mutex<PlaybackSession>>,
    outbox: CommandOutbox,
}

impl AppState {
    fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn Store>,
        relay: Arc<dyn Relay>,
        chat: Arc<dyn ChatCompletion>,
    ) -> Self {
        let engine = Arc::new(Engine::new(relay, chat, store.clone(), config.clone()));
        let history = Arc::new(HistoryStore::new(store.clone(), config.history_capacity));
        let outbox = CommandOutbox::default();
        let session = PlaybackSession::new(
            history.clone(),
            Arc::new(CommandEngineFactory::new(outbox.clone())),
        );

        Self {
            registry: Registry::new(store.clone()),
            parsers: ParserList::new(store.clone()),
            coordinator: Arc::new(Coordinator::new(engine)),
            history,
            session: Arc::new(Mutex::new(session)),
            outbox,
            config,
            store,
        }
    }

    fn engine(&self) -> &Engine {
        self.coordinator.engine()
    }

    /// 播放代理: 存储中的设置优先
    fn stream_relay(&self) -> Option<String> {
        store::get_non_empty(self.store.as_ref(), keys::STREAM_RELAY)
            .ok()
            .flatten()
            .or_else(|| self.config.stream_relay.clone())
    }

    /// 会话快照，附带待执行的播放器指令
    fn player_view(&self, session: &PlaybackSession) -> PlayerView {
        session.view().with_commands(self.outbox.drain())
    }
}

fn build_router(state: AppState) -> Router {
    // CORS 配置
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(QUERY_TOKEN_HEADER)]);

    Router::new()
        .route("/api", get(api_info_handler))
        .route("/health", get(health_handler))
        // 搜索
        .route("/search", get(search_handler).post(search_stream_handler))
        .route("/cloud", get(cloud_handler).post(cloud_stream_handler))
        // 资源站 / 频道
        .route("/sources", get(sources_handler).post(add_source_handler))
        .route("/sources/probe", get(probe_sources_handler))
        .route("/sources/{key}", delete(remove_source_handler))
        .route("/sources/{key}/enabled", put(source_enabled_handler))
        .route("/channels", get(channels_handler).post(add_channel_handler))
        .route("/channels/probe", get(probe_channels_handler))
        .route("/channels/{key}", delete(remove_channel_handler))
        .route("/channels/{key}/enabled", put(channel_enabled_handler))
        // 详情与换源
        .route("/detail/{source}/{id}", get(detail_handler))
        .route("/equivalents", get(equivalents_handler))
        .route("/switch", post(switch_handler))
        .route("/douban", get(douban_handler))
        // 播放
        .route("/player", get(player_handler).delete(player_close_handler))
        .route("/player/open", post(player_open_handler))
        .route("/player/event", post(player_event_handler))
        .route("/player/episode", post(player_episode_handler))
        .route("/player/settings", put(player_settings_handler))
        // 在线解析
        .route("/parsers", get(parsers_handler).post(add_parser_handler))
        .route("/parsers/resolve", get(resolve_parser_handler))
        .route("/parsers/{index}", delete(remove_parser_handler))
        // 播放记录
        .route("/history", get(history_handler).delete(history_clear_handler))
        .route("/history/latest", get(history_latest_handler))
        .route("/history/{source}/{id}", delete(history_remove_handler))
        // 配置
        .route("/config/export", get(config_export_handler))
        .route("/config/import", post(config_import_handler))
        .route("/config/relay", put(config_relay_handler))
        .route("/config/stream-relay", put(config_stream_relay_handler))
        .route("/config/llm", put(config_llm_handler))
        .route("/llm/benchmark", post(llm_benchmark_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// NDJSON 流式响应
fn ndjson_response(stream: impl Stream<Item = String> + Send + 'static) -> Response {
    let body = Body::from_stream(stream.map(Ok::<_, std::convert::Infallible>));
    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// 客户端令牌所在的请求头，同一令牌的新搜索会取代旧搜索
const QUERY_TOKEN_HEADER: &str = "x-query-token";

/// 请求头优先，其次是参数里的 session
fn client_token(headers: &HeaderMap, session: Option<String>) -> Option<String> {
    headers
        .get(QUERY_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(session)
        .filter(|t| !t.trim().is_empty())
}

fn require_keyword(q: Option<String>) -> ApiResult<String> {
    q.map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::BadRequest("搜索关键词不能为空".to_string()))
}

// ============================================================================
// 基础
// ============================================================================

/// GET /api - API 信息
async fn api_info_handler() -> impl IntoResponse {
    Json(json!({
        "name": "MorphoTV Search API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "多源影视聚合搜索与续播后端",
        "endpoints": {
            "search": {
                "GET /search?q=&session=": "聚合搜索作品",
                "POST /search": "流式搜索作品 (JSON: {q, session}, NDJSON 响应)",
                "GET /cloud?q=&platform=&session=": "聚合搜索网盘资源",
                "POST /cloud": "流式搜索网盘资源 (重复链接只在更新时再次出现)",
                "X-Query-Token": "客户端令牌，同一令牌的新搜索取代旧搜索"
            },
            "registry": {
                "GET|POST /sources": "资源站列表 / 新增",
                "DELETE /sources/{key}": "删除自定义资源站",
                "PUT /sources/{key}/enabled": "启用 / 停用",
                "GET /sources/probe": "资源站测速",
                "GET|POST /channels": "频道列表 / 新增",
                "DELETE /channels/{key}": "删除自定义频道",
                "PUT /channels/{key}/enabled": "启用 / 停用",
                "GET /channels/probe": "频道测速"
            },
            "playback": {
                "GET /detail/{source}/{id}": "作品详情与剧集",
                "GET /equivalents?source=&title=": "可换源站点",
                "POST /switch": "换源并保持当前剧集",
                "GET /douban?kind=&category=&type=&start=": "豆瓣近期热门",
                "POST /player/open": "打开作品",
                "POST /player/event": "播放器事件",
                "POST /player/episode": "选集",
                "PUT /player/settings": "排序与跳过片头片尾",
                "GET|DELETE /player": "当前会话 / 关闭"
            },
            "parsers": {
                "GET|POST /parsers": "在线解析接口列表 / 新增 (JSON: {name, url})",
                "DELETE /parsers/{index}": "删除解析接口",
                "GET /parsers/resolve?name=&url=": "生成解析地址"
            },
            "history": {
                "GET|DELETE /history": "播放记录 / 清空",
                "DELETE /history/{source}/{id}": "删除记录",
                "GET /history/latest": "查询记录作品的最新集数"
            },
            "config": {
                "GET /config/export": "导出配置",
                "POST /config/import": "导入配置 (JSON: {data} 或 {url})",
                "PUT /config/relay": "设置代理地址",
                "PUT /config/stream-relay": "设置播放代理",
                "PUT /config/llm": "设置 AI 模型",
                "POST /llm/benchmark": "AI 接口测速 (JSON: {prompt, testCount, concurrentCount})"
            },
            "GET /health": "健康检查"
        }
    }))
}

/// 健康检查
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "relayConfigured": state.engine().relay_configured(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

// ============================================================================
// 搜索
// ============================================================================

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    platform: Option<String>,
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    q: Option<String>,
    session: Option<String>,
}

/// GET /search?q= - 聚合搜索作品
async fn search_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchQuery>,
) -> ApiResult<Json<Value>> {
    let keyword = require_keyword(params.q)?;
    let token = client_token(&headers, params.session);
    let sources = state.registry.enabled_sources()?;
    let report = state
        .coordinator
        .search_works(sources, &keyword, token.as_deref())
        .await?;
    if report.all_failed() {
        return Err(ApiError::AllSourcesFailed);
    }

    info!("🔍 搜索: {} ({} 个结果)", keyword, report.items.len());
    Ok(Json(json!({
        "works": report.items,
        "total": report.total,
        "failed": report.failed,
        "superseded": report.superseded
    })))
}

/// POST /search - 流式搜索作品
async fn search_stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> ApiResult<Response> {
    let keyword = require_keyword(body.q)?;
    let token = client_token(&headers, body.session);
    let sources = state.registry.enabled_sources()?;
    info!("🔍 流式搜索: {} ({} 个资源站)", keyword, sources.len());
    let stream = state
        .coordinator
        .stream_works(sources, keyword, token.as_deref())?;
    Ok(ndjson_response(stream))
}

/// GET /cloud?q=&platform= - 聚合搜索网盘资源
async fn cloud_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchQuery>,
) -> ApiResult<Json<Value>> {
    let keyword = require_keyword(params.q)?;
    let token = client_token(&headers, params.session);
    let channels = state.registry.enabled_channels()?;
    let report = state
        .coordinator
        .search_resources(channels, &keyword, token.as_deref())
        .await?;
    if report.all_failed() {
        return Err(ApiError::AllSourcesFailed);
    }

    let platforms = platform_counts(&report.items);
    let resources: Vec<_> = match params.platform.as_deref().filter(|p| !p.is_empty()) {
        Some(platform) => report
            .items
            .into_iter()
            .filter(|r| r.platform == platform)
            .collect(),
        None => report.items,
    };

    Ok(Json(json!({
        "resources": resources,
        "platforms": platforms,
        "total": report.total,
        "failed": report.failed,
        "superseded": report.superseded
    })))
}

/// POST /cloud - 流式搜索网盘资源，重复链接只在更新时再次出现
async fn cloud_stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> ApiResult<Response> {
    let keyword = require_keyword(body.q)?;
    let token = client_token(&headers, body.session);
    let channels = state.registry.enabled_channels()?;
    let stream = state
        .coordinator
        .stream_resources(channels, keyword, token.as_deref())?;
    Ok(ndjson_response(stream))
}

// ============================================================================
// 资源站 / 频道
// ============================================================================

#[derive(Debug, Deserialize)]
struct EnabledBody {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ProbeQuery {
    q: Option<String>,
}

async fn sources_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.sources()?))
}

async fn add_source_handler(
    State(state): State<AppState>,
    Json(body): Json<NewSource>,
) -> ApiResult<impl IntoResponse> {
    let source = state.registry.add_source(body)?;
    Ok((StatusCode::CREATED, Json(source)))
}

async fn remove_source_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.registry.remove_source(&key)?;
    Ok(Json(json!({ "success": true })))
}

async fn source_enabled_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<EnabledBody>,
) -> ApiResult<impl IntoResponse> {
    state.registry.set_source_enabled(&key, body.enabled)?;
    Ok(Json(json!({ "success": true, "enabled": body.enabled })))
}

/// GET /sources/probe - 测速所有资源站
async fn probe_sources_handler(
    State(state): State<AppState>,
    Query(params): Query<ProbeQuery>,
) -> ApiResult<impl IntoResponse> {
    let keyword = params.q.unwrap_or_else(|| PROBE_KEYWORD.to_string());
    let sources = state.registry.sources()?;
    Ok(Json(state.engine().probe_sources(&sources, &keyword).await?))
}

async fn channels_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.registry.channels()?))
}

async fn add_channel_handler(
    State(state): State<AppState>,
    Json(body): Json<NewChannel>,
) -> ApiResult<impl IntoResponse> {
    let channel = state.registry.add_channel(body)?;
    Ok((StatusCode::CREATED, Json(channel)))
}

async fn remove_channel_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.registry.remove_channel(&key)?;
    Ok(Json(json!({ "success": true })))
}

async fn channel_enabled_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<EnabledBody>,
) -> ApiResult<impl IntoResponse> {
    state.registry.set_channel_enabled(&key, body.enabled)?;
    Ok(Json(json!({ "success": true, "enabled": body.enabled })))
}

/// GET /channels/probe - 测速所有频道
async fn probe_channels_handler(
    State(state): State<AppState>,
    Query(params): Query<ProbeQuery>,
) -> ApiResult<impl IntoResponse> {
    let keyword = params.q.unwrap_or_else(|| PROBE_KEYWORD.to_string());
    let channels = state.registry.channels()?;
    Ok(Json(state.engine().probe_channels(&channels, &keyword).await?))
}

// ============================================================================
// 详情与换源
// ============================================================================

/// GET /detail/{source}/{id}
async fn detail_handler(
    State(state): State<AppState>,
    Path((source, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let source = state.registry.find_source(&source)?;
    let detail = state.engine().fetch_detail(&source, &id).await?;
    Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
struct EquivalentsQuery {
    source: String,
    title: String,
}

/// GET /equivalents?source=&title= - 有同名作品的站点
async fn equivalents_handler(
    State(state): State<AppState>,
    Query(params): Query<EquivalentsQuery>,
) -> ApiResult<impl IntoResponse> {
    let sources = state.registry.enabled_sources()?;
    let found =
        equivalence::find_equivalents(state.engine(), &sources, &params.source, &params.title)
            .await?;
    Ok(Json(json!({ "sources": found })))
}

#[derive(Debug, Deserialize)]
struct SwitchBody {
    source: String,
    title: Option<String>,
    label: Option<String>,
}

/// POST /switch - 换源，按剧集名称保持当前进度
async fn switch_handler(
    State(state): State<AppState>,
    Json(body): Json<SwitchBody>,
) -> ApiResult<Json<PlayerView>> {
    let target = state.registry.find_source(&body.source)?;

    // 网络请求期间不持有会话锁，回来后会话有变化就放弃
    let (generation, title, label) = {
        let session = state.session.lock().await;
        let title = body
            .title
            .or_else(|| session.current_work().map(|w| w.title.clone()))
            .ok_or_else(|| ApiError::BadRequest("缺少作品标题".to_string()))?;
        let label = body
            .label
            .or_else(|| session.current_label().map(str::to_string));
        (session.generation(), title, label)
    };

    let outcome =
        equivalence::switch_source(state.engine(), &target, &title, label.as_deref()).await?;

    let mut session = state.session.lock().await;
    session.switch_from(generation, outcome.detail, outcome.index, state.stream_relay())?;
    Ok(Json(state.player_view(&session)))
}

/// GET /douban?kind=&category=&type=&start= - 豆瓣近期热门
async fn douban_handler(
    State(state): State<AppState>,
    Query(query): Query<HotQuery>,
) -> ApiResult<impl IntoResponse> {
    let hot = state.engine().recent_hot(&query).await?;
    debug!("豆瓣热门 {}/{}: {} 条", query.kind, query.category, hot.items.len());
    Ok(Json(hot))
}

// ============================================================================
// 播放
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenBody {
    source: String,
    id: String,
    /// 指定剧集名称
    episode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EpisodeBody {
    index: Option<usize>,
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsBody {
    sort_order: Option<SortOrder>,
    skip_start_sec: Option<u32>,
    skip_end_sec: Option<u32>,
}

async fn player_handler(State(state): State<AppState>) -> Json<PlayerView> {
    let session = state.session.lock().await;
    Json(state.player_view(&session))
}

/// POST /player/open - 获取详情并开始播放
async fn player_open_handler(
    State(state): State<AppState>,
    Json(body): Json<OpenBody>,
) -> ApiResult<Json<PlayerView>> {
    let source = state.registry.find_source(&body.source)?;
    let detail = state.engine().fetch_detail(&source, &body.id).await?;

    let mut session = state.session.lock().await;
    session.open(detail, body.episode.as_deref(), state.stream_relay())?;
    Ok(Json(state.player_view(&session)))
}

/// POST /player/event - 播放器事件
async fn player_event_handler(
    State(state): State<AppState>,
    Json(event): Json<PlayerEvent>,
) -> Json<PlayerView> {
    let mut session = state.session.lock().await;
    debug!("播放器事件: {:?}", event);
    session.handle(event);
    debug!("会话状态: {:?}", session.state());
    Json(state.player_view(&session))
}

/// POST /player/episode - 选集
async fn player_episode_handler(
    State(state): State<AppState>,
    Json(body): Json<EpisodeBody>,
) -> ApiResult<Json<PlayerView>> {
    let mut session = state.session.lock().await;
    match (body.index, body.label) {
        (Some(index), _) => session.select_episode(index)?,
        (None, Some(label)) => session.select_label(&label)?,
        (None, None) => return Err(ApiError::BadRequest("需要 index 或 label".to_string())),
    }
    Ok(Json(state.player_view(&session)))
}

/// PUT /player/settings - 排序与跳过设置
async fn player_settings_handler(
    State(state): State<AppState>,
    Json(body): Json<SettingsBody>,
) -> ApiResult<Json<PlayerView>> {
    let mut session = state.session.lock().await;
    if let Some(order) = body.sort_order {
        session.set_sort_order(order)?;
    }
    if body.skip_start_sec.is_some() || body.skip_end_sec.is_some() {
        let current = session.view().settings;
        session.set_skip(
            body.skip_start_sec.unwrap_or(current.skip_start_sec),
            body.skip_end_sec.unwrap_or(current.skip_end_sec),
        )?;
    }
    Ok(Json(state.player_view(&session)))
}

/// DELETE /player - 关闭播放器
async fn player_close_handler(State(state): State<AppState>) -> Json<PlayerView> {
    let mut session = state.session.lock().await;
    session.teardown();
    Json(state.player_view(&session))
}

// ============================================================================
// 在线解析
// ============================================================================

#[derive(Debug, Deserialize)]
struct ParserBody {
    name: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    name: Option<String>,
    url: String,
}

async fn parsers_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.parsers.list()?))
}

async fn add_parser_handler(
    State(state): State<AppState>,
    Json(body): Json<ParserBody>,
) -> ApiResult<impl IntoResponse> {
    let parser = state.parsers.add(&body.name, &body.url)?;
    Ok((StatusCode::CREATED, Json(parser)))
}

async fn remove_parser_handler(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.parsers.remove(index)?))
}

/// GET /parsers/resolve?name=&url= - 用解析接口打开播放地址
async fn resolve_parser_handler(
    State(state): State<AppState>,
    Query(params): Query<ResolveQuery>,
) -> ApiResult<impl IntoResponse> {
    let name = params.name.as_deref().filter(|n| !n.is_empty());
    let url = state.parsers.resolve(name, params.url.trim())?;
    Ok(Json(json!({ "url": url })))
}

// ============================================================================
// 播放记录
// ============================================================================

async fn history_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.history.list()?))
}

async fn history_clear_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    state.history.clear()?;
    Ok(Json(json!({ "success": true })))
}

async fn history_remove_handler(
    State(state): State<AppState>,
    Path((source, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    if !state.history.remove(&id, &source)? {
        return Err(ApiError::NotFound("播放记录不存在".to_string()));
    }
    Ok(Json(json!({ "success": true })))
}

/// GET /history/latest - 重新获取每条记录的详情，返回资源站当前的更新状态
async fn history_latest_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    state.engine().ensure_relay()?;
    let records = state.history.list()?;
    let sources = state.registry.sources()?;

    let checks = records.iter().map(|record| {
        let source = sources.iter().find(|s| s.key == record.source_key);
        let engine = state.engine();
        async move {
            let latest = match source {
                Some(source) => match engine.fetch_detail(source, &record.work_id).await {
                    Ok(detail) => detail.work.remark,
                    Err(e) => {
                        tracing::warn!("获取 {} 最新集数失败: {}", record.title, e);
                        None
                    }
                },
                None => None,
            };
            json!({
                "workId": record.work_id,
                "sourceKey": record.source_key,
                "title": record.title,
                "episodeLabel": record.episode_label,
                "latest": latest
            })
        }
    });

    Ok(Json(futures::future::join_all(checks).await))
}

// ============================================================================
// 配置
// ============================================================================

#[derive(Debug, Deserialize)]
struct ImportBody {
    data: Option<Map<String, Value>>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UrlBody {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmBody {
    api_url: String,
    api_key: String,
    model: String,
    prompt: Option<String>,
}

async fn config_export_handler(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(transfer::export(state.store.as_ref())?))
}

/// POST /config/import - 从请求体或远程地址导入
async fn config_import_handler(
    State(state): State<AppState>,
    Json(body): Json<ImportBody>,
) -> ApiResult<impl IntoResponse> {
    let data = match (body.data, body.url) {
        (Some(data), _) => data,
        (None, Some(url)) if episodes::is_absolute_http(url.trim()) => {
            transfer::fetch_remote(url.trim()).await?
        }
        _ => return Err(ApiError::BadRequest("需要 data 或有效的 url".to_string())),
    };
    Ok(Json(transfer::import(state.store.as_ref(), data)?))
}

/// PUT /config/relay - 设置代理地址
async fn config_relay_handler(
    State(state): State<AppState>,
    Json(body): Json<UrlBody>,
) -> ApiResult<impl IntoResponse> {
    let url = body.url.unwrap_or_default().trim().to_string();
    if !episodes::is_absolute_http(&url) {
        return Err(ApiError::BadRequest(format!("代理地址无效: {}", url)));
    }
    state.store.set(keys::RELAY_BASE, &url)?;
    info!("代理地址已更新: {}", url);
    Ok(Json(json!({ "success": true })))
}

/// PUT /config/stream-relay - 设置或清除播放代理
async fn config_stream_relay_handler(
    State(state): State<AppState>,
    Json(body): Json<UrlBody>,
) -> ApiResult<impl IntoResponse> {
    match body.url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()) {
        Some(url) if episodes::is_absolute_http(&url) => state.store.set(keys::STREAM_RELAY, &url)?,
        Some(url) => return Err(ApiError::BadRequest(format!("播放代理地址无效: {}", url))),
        None => state.store.remove(keys::STREAM_RELAY)?,
    }
    Ok(Json(json!({ "success": true })))
}

/// PUT /config/llm - 设置 AI 模型
async fn config_llm_handler(
    State(state): State<AppState>,
    Json(body): Json<LlmBody>,
) -> ApiResult<impl IntoResponse> {
    if !episodes::is_absolute_http(body.api_url.trim()) || body.model.trim().is_empty() {
        return Err(ApiError::BadRequest("AI 模型配置不完整".to_string()));
    }
    let store = state.store.as_ref();
    store.set(keys::LLM_API_URL, body.api_url.trim())?;
    store.set(keys::LLM_API_KEY, body.api_key.trim())?;
    store.set(keys::LLM_MODEL, body.model.trim())?;
    match body.prompt.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()) {
        Some(prompt) => store.set(keys::LLM_PROMPT, &prompt)?,
        None => store.remove(keys::LLM_PROMPT)?,
    }
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BenchmarkBody {
    api_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    #[serde(flatten)]
    plan: BenchmarkPlan,
}

/// POST /llm/benchmark - AI 接口测速，未传接口参数时用已保存的设置
async fn llm_benchmark_handler(
    State(state): State<AppState>,
    Json(body): Json<BenchmarkBody>,
) -> ApiResult<impl IntoResponse> {
    let given = |v: Option<String>| v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let settings = match (given(body.api_url), given(body.model)) {
        (Some(api_url), Some(model)) => LlmSettings {
            api_url,
            api_key: given(body.api_key).unwrap_or_default(),
            model,
            extra_prompt: None,
        },
        _ => state
            .engine()
            .llm_settings()
            .ok_or_else(|| ApiError::BadRequest("AI 模型未配置".to_string()))?,
    };
    if !episodes::is_absolute_http(&settings.api_url) {
        return Err(ApiError::BadRequest("AI 接口地址无效".to_string()));
    }

    let report = benchmark::run(state.engine().chat(), &settings, &body.plan).await;
    Ok(Json(report))
}
