//! 豆瓣近期热门
//! 经中转请求 rexxar 接口，每页 18 条

use crate::error::EngineError;
use serde::{Deserialize, Serialize};

pub const PAGE_SIZE: u32 = 18;
const RECENT_HOT_API: &str = "https://m.douban.com/rexxar/api/v2/subject/recent_hot";

/// 榜单选择: 一级分类 (movie / tv)、二级分类和类型
#[derive(Debug, Clone, Deserialize)]
pub struct HotQuery {
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default = "default_kind")]
    pub category: String,
    #[serde(default = "default_kind", rename = "type")]
    pub list_type: String,
    #[serde(default)]
    pub start: u32,
}

fn default_kind() -> String {
    "tv".to_string()
}

impl Default for HotQuery {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            category: default_kind(),
            list_type: default_kind(),
            start: 0,
        }
    }
}

impl HotQuery {
    pub fn url(&self) -> String {
        format!(
            "{}/{}?start={}&limit={}&category={}&type={}",
            RECENT_HOT_API,
            urlencoding::encode(self.kind.trim()),
            self.start,
            PAGE_SIZE,
            urlencoding::encode(self.category.trim()),
            urlencoding::encode(self.list_type.trim())
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotItem {
    pub id: String,
    pub title: String,
    pub poster_url: Option<String>,
    /// 评分人数不足时为 null
    pub rating: Option<f64>,
    pub is_new: bool,
    pub episodes_info: Option<String>,
    pub card_subtitle: Option<String>,
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotTag {
    pub title: String,
    pub category: String,
    pub selected: bool,
    pub types: Vec<HotTagType>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotTagType {
    pub title: String,
    pub kind: String,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentHot {
    pub category: String,
    pub total: u32,
    pub start: u32,
    pub items: Vec<HotItem>,
    pub tags: Vec<HotTag>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRecentHot {
    #[serde(default)]
    category: String,
    #[serde(default)]
    total: u32,
    #[serde(default)]
    items: Vec<RawItem>,
    #[serde(default)]
    tags: Vec<RawTag>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    pic: Option<RawPic>,
    #[serde(default)]
    rating: Option<RawRating>,
    #[serde(default)]
    is_new: Option<bool>,
    #[serde(default)]
    episodes_info: Option<String>,
    #[serde(default)]
    card_subtitle: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPic {
    #[serde(default)]
    large: Option<String>,
    #[serde(default)]
    normal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRating {
    #[serde(default)]
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTag {
    #[serde(default)]
    title: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    selected: bool,
    #[serde(default)]
    types: Vec<RawTagType>,
}

#[derive(Debug, Deserialize)]
struct RawTagType {
    #[serde(default)]
    title: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    selected: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// 解析接口响应
pub fn parse(raw: &str, start: u32) -> Result<RecentHot, EngineError> {
    let response: RawRecentHot = serde_json::from_str(raw)
        .map_err(|e| EngineError::SourceMalformedResponse(format!("豆瓣响应解析失败: {}", e)))?;

    let items = response
        .items
        .into_iter()
        .filter(|item| !item.id.is_empty() && !item.title.trim().is_empty())
        .map(|item| HotItem {
            poster_url: item
                .pic
                .and_then(|pic| non_empty(pic.normal).or_else(|| non_empty(pic.large))),
            rating: item.rating.and_then(|r| r.value).filter(|v| *v > 0.0),
            is_new: item.is_new.unwrap_or(false),
            episodes_info: non_empty(item.episodes_info),
            card_subtitle: non_empty(item.card_subtitle),
            kind: non_empty(item.kind),
            title: item.title.trim().to_string(),
            id: item.id,
        })
        .collect();

    let tags = response
        .tags
        .into_iter()
        .map(|tag| HotTag {
            title: tag.title,
            category: tag.category,
            selected: tag.selected,
            types: tag
                .types
                .into_iter()
                .map(|t| HotTagType {
                    title: t.title,
                    kind: t.kind,
                    selected: t.selected,
                })
                .collect(),
        })
        .collect();

    Ok(RecentHot {
        category: response.category,
        total: response.total,
        start,
        items,
        tags,
    })
}
