//! 提取策略
//! 三种策略把原始响应转换为统一结构: 采集站 JSON、频道网页规则、LLM

pub mod catalog;
pub mod llm;
pub mod platform;
pub mod rule;

use crate::error::EngineError;
use crate::types::{Channel, ExtractionMode, Extracted, Source};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::sync::Arc;

pub use llm::LlmExtractor;

/// 提取时的来源信息
#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    pub key: &'a str,
    pub name: &'a str,
    pub keyword: &'a str,
}

impl<'a> ExtractContext<'a> {
    pub fn for_source(source: &'a Source, keyword: &'a str) -> Self {
        Self {
            key: &source.key,
            name: &source.name,
            keyword,
        }
    }

    pub fn for_channel(channel: &'a Channel, keyword: &'a str) -> Self {
        Self {
            key: &channel.key,
            name: &channel.name,
            keyword,
        }
    }
}

/// 提取策略
#[derive(Clone)]
pub enum Strategy {
    Json,
    Rule,
    Llm(Arc<LlmExtractor>),
}

impl Strategy {
    /// 频道按配置的提取方式选择策略
    pub fn for_channel(channel: &Channel, llm: &Arc<LlmExtractor>) -> Self {
        match channel.extraction_mode {
            ExtractionMode::Rule => Strategy::Rule,
            ExtractionMode::Llm => Strategy::Llm(Arc::clone(llm)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Json => "json",
            Strategy::Rule => "rule",
            Strategy::Llm(_) => "llm",
        }
    }

    pub async fn extract(
        &self,
        raw: &str,
        ctx: &ExtractContext<'_>,
    ) -> Result<Vec<Extracted>, EngineError> {
        Ok(match self {
            Strategy::Json => catalog::parse_works(raw, ctx)?
                .into_iter()
                .map(Extracted::Work)
                .collect(),
            Strategy::Rule => rule::extract_resources(raw, ctx)
                .into_iter()
                .map(Extracted::Resource)
                .collect(),
            Strategy::Llm(extractor) => extractor
                .extract(raw, ctx)
                .await?
                .into_iter()
                .map(Extracted::Resource)
                .collect(),
        })
    }
}

/// 宽松解析发布时间
pub fn parse_publish_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(t.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_publish_time_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        assert_eq!(parse_publish_time("2024-05-01T16:30:00+08:00"), Some(expected));
        assert_eq!(parse_publish_time("2024-05-01 08:30:00"), Some(expected));
        assert_eq!(
            parse_publish_time("2024-05-01"),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_publish_time("昨天"), None);
        assert_eq!(parse_publish_time(""), None);
    }

    #[tokio::test]
    async fn test_strategy_dispatch() {
        let ctx = ExtractContext {
            key: "s1",
            name: "站点",
            keyword: "x",
        };
        let raw = r#"{"code":1,"list":[{"vod_id":1,"vod_name":"x"}]}"#;
        let out = Strategy::Json.extract(raw, &ctx).await.unwrap();
        assert!(matches!(out.as_slice(), [Extracted::Work(w)] if w.id == "1"));

        let html = r#"<div class="tgme_widget_message_wrap"><div class="tgme_widget_message_text js-message_text">x<br><a href="https://pan.quark.cn/s/1">l</a></div></div>"#;
        let out = Strategy::Rule.extract(html, &ctx).await.unwrap();
        assert!(matches!(out.as_slice(), [Extracted::Resource(r)] if r.platform == "夸克网盘"));
    }
}
