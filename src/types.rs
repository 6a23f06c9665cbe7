//! 数据类型定义
//! 资源站、网盘频道、作品、剧集、网盘资源与播放记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// 资源站 / 频道
// ============================================================================

/// 采集站 (兼容苹果 CMS 接口)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub key: String,
    pub name: String,
    /// 接口根地址，例如 `https://example.com`
    pub api: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub is_custom: bool,
}

/// 网盘频道的提取方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    #[default]
    Rule,
    Llm,
}

/// 网盘资源频道 (TG 频道镜像等)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub key: String,
    pub name: String,
    /// 搜索地址模板，`{keyword}` 会被替换为编码后的关键词
    pub url: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub extraction_mode: ExtractionMode,
    #[serde(default)]
    pub is_custom: bool,
}

impl Channel {
    /// 构建搜索地址
    pub fn search_url(&self, keyword: &str) -> String {
        self.url.replace("{keyword}", &urlencoding::encode(keyword))
    }
}

/// 资源站引用 (只按 key 引用，不持有资源站本身)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub key: String,
    pub name: String,
}

// ============================================================================
// 作品 / 剧集
// ============================================================================

/// 归一化后的作品，身份为 (source_key, id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedWork {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poster_url: Option<String>,
    pub source_key: String,
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<String>,
}

/// 单集
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub label: String,
    pub stream_url: String,
}

/// 作品详情 (详情接口返回，带剧集列表)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkDetail {
    #[serde(flatten)]
    pub work: NormalizedWork,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actors: Option<String>,
    pub episodes: Vec<Episode>,
}

// ============================================================================
// 网盘资源
// ============================================================================

/// 网盘分享资源，去重键为 share_url
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudResource {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poster_url: Option<String>,
    pub source_channel: String,
    pub platform: String,
    pub publish_time: DateTime<Utc>,
    pub share_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_code: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// 提取策略的统一输出
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Work(NormalizedWork),
    Resource(CloudResource),
}

// ============================================================================
// 播放记录
// ============================================================================

/// 剧集排序方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// 续播记录，身份为 (work_id, source_key)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackRecord {
    pub work_id: String,
    pub source_key: String,
    pub title: String,
    #[serde(default)]
    pub poster_url: String,
    pub episode_label: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub skip_start_sec: u32,
    #[serde(default)]
    pub skip_end_sec: u32,
}

impl PlaybackRecord {
    pub fn same_identity(&self, work_id: &str, source_key: &str) -> bool {
        self.work_id == work_id && self.source_key == source_key
    }
}

// ============================================================================
// 搜索结果与流式事件
// ============================================================================

/// 单个资源站 / 频道的搜索结果
#[derive(Debug, Clone)]
pub struct SourceSearchResult<T> {
    pub items: Vec<T>,
    pub count: usize,
    pub error: Option<String>,
}

impl<T> SourceSearchResult<T> {
    pub fn with_items(items: Vec<T>) -> Self {
        let count = items.len();
        Self {
            items,
            count,
            error: None,
        }
    }

    pub fn with_error(error: String) -> Self {
        Self {
            items: Vec::new(),
            count: 0,
            error: Some(error),
        }
    }
}

/// 流式搜索进度
#[derive(Debug, Clone, Serialize)]
pub struct StreamProgress {
    pub completed: usize,
    pub total: usize,
}

/// 流式搜索中单个资源站的结果
#[derive(Debug, Clone, Serialize)]
pub struct StreamResult<T> {
    pub key: String,
    pub name: String,
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 流式搜索事件 (每行一个 JSON)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent<T> {
    Init {
        total: usize,
    },
    Progress {
        progress: StreamProgress,
    },
    Result {
        progress: StreamProgress,
        result: StreamResult<T>,
    },
    Done {
        done: bool,
    },
}
