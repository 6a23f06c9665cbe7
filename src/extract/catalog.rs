//! 苹果 CMS 采集接口解析
//! `/api.php/provide/vod/?ac=videolist&wd=` 搜索，`ac=detail&ids=` 详情

use super::ExtractContext;
use crate::episodes::parse_play_url;
use crate::error::EngineError;
use crate::types::{NormalizedWork, WorkDetail};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// 成功状态码
const SUCCESS_CODE: i64 = 1;

const PROVIDE_PATH: &str = "/api.php/provide/vod/";

#[derive(Debug, Deserialize)]
pub struct CatalogResponse {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub code: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub msg: Option<String>,
    #[serde(default)]
    pub list: Option<Vec<CatalogItem>>,
}

/// 列表中的单个作品，各字段在不同站点可能是字符串也可能是数字
#[derive(Debug, Default, Deserialize)]
pub struct CatalogItem {
    #[serde(default, deserialize_with = "lenient_string")]
    pub vod_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vod_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vod_pic: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vod_remarks: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vod_year: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vod_area: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub type_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vod_score: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vod_play_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vod_content: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vod_actor: Option<String>,
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// 搜索地址
pub fn search_url(api: &str, keyword: &str) -> String {
    format!(
        "{}{}?ac=videolist&wd={}",
        api.trim_end_matches('/'),
        PROVIDE_PATH,
        urlencoding::encode(keyword)
    )
}

/// 详情地址
pub fn detail_url(api: &str, id: &str) -> String {
    format!(
        "{}{}?ac=detail&ids={}",
        api.trim_end_matches('/'),
        PROVIDE_PATH,
        urlencoding::encode(id)
    )
}

/// 解析响应体，状态码不为 1 时返回空列表
fn parse_list(raw: &str) -> Result<Vec<CatalogItem>, EngineError> {
    let response: CatalogResponse = serde_json::from_str(raw)
        .map_err(|e| EngineError::SourceMalformedResponse(format!("JSON 解析失败: {}", e)))?;

    if response.code != Some(SUCCESS_CODE) {
        tracing::debug!(
            "采集接口返回非成功状态: {:?} {}",
            response.code,
            response.msg.unwrap_or_default()
        );
        return Ok(Vec::new());
    }

    Ok(response.list.unwrap_or_default())
}

impl CatalogItem {
    fn into_work(self, ctx: &ExtractContext<'_>) -> Option<NormalizedWork> {
        Some(NormalizedWork {
            id: self.vod_id?,
            title: self.vod_name?,
            poster_url: self.vod_pic,
            source_key: ctx.key.to_string(),
            source_name: ctx.name.to_string(),
            remark: self.vod_remarks,
            year: self.vod_year,
            region: self.vod_area,
            kind: self.type_name,
            rating: self.vod_score,
        })
    }
}

/// 解析搜索结果，缺少 id 或名称的条目被跳过
pub fn parse_works(raw: &str, ctx: &ExtractContext<'_>) -> Result<Vec<NormalizedWork>, EngineError> {
    Ok(parse_list(raw)?
        .into_iter()
        .filter_map(|item| item.into_work(ctx))
        .collect())
}

/// 解析详情，取列表第一项
pub fn parse_detail(raw: &str, ctx: &ExtractContext<'_>) -> Result<Option<WorkDetail>, EngineError> {
    let Some(mut item) = parse_list(raw)?.into_iter().next() else {
        return Ok(None);
    };

    let play_url = item.vod_play_url.take().unwrap_or_default();
    let description = item.vod_content.take();
    let actors = item.vod_actor.take();

    Ok(item.into_work(ctx).map(|work| WorkDetail {
        work,
        description,
        actors,
        episodes: parse_play_url(&play_url),
    }))
}
