//! LLM 提取
//! 把频道原始内容交给 chat-completion 接口，从回答中解析资源 JSON

use super::{parse_publish_time, platform, ExtractContext};
use crate::config::AppConfig;
use crate::error::EngineError;
use crate::http_client::post_json_text;
use crate::store::{self, keys, Store};
use crate::types::CloudResource;
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str =
    "你是一个专门用于提取网盘资源信息的AI助手。请严格按照要求的JSON格式返回数据。";

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```(?:json)?\s*(.*?)\s*```").expect("invalid fence regex"));

/// LLM 接口设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmSettings {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    /// 用户追加的筛选要求
    #[serde(default)]
    pub extra_prompt: Option<String>,
}

impl LlmSettings {
    /// 存储中的设置优先，缺失时用环境变量默认值；三项必填任一缺失返回 None
    pub fn load(store: &dyn Store, config: &AppConfig) -> Option<Self> {
        let pick = |key: &str, fallback: &Option<String>| {
            store::get_non_empty(store, key)
                .ok()
                .flatten()
                .or_else(|| fallback.clone().filter(|v| !v.trim().is_empty()))
        };

        Some(Self {
            api_url: pick(keys::LLM_API_URL, &config.llm_api_url)?,
            api_key: pick(keys::LLM_API_KEY, &config.llm_api_key)?,
            model: pick(keys::LLM_MODEL, &config.llm_model)?,
            extra_prompt: pick(keys::LLM_PROMPT, &None),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// chat-completion 接口
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(
        &self,
        settings: &LlmSettings,
        messages: &[ChatMessage],
    ) -> Result<String, EngineError>;
}

/// OpenAI 兼容接口
pub struct HttpChat;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl ChatCompletion for HttpChat {
    async fn complete(
        &self,
        settings: &LlmSettings,
        messages: &[ChatMessage],
    ) -> Result<String, EngineError> {
        let body = json!({
            "model": settings.model,
            "messages": messages,
        });
        let text = post_json_text(&settings.api_url, &body, Some(&settings.api_key)).await?;
        let response: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| EngineError::ExtractionFailure(format!("AI 响应解析失败: {}", e)))?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| EngineError::ExtractionFailure("AI 响应缺少 choices".to_string()))
    }
}

/// 模型应返回的结构
#[derive(Debug, Default, Deserialize)]
struct AiAnswer {
    #[serde(default)]
    channel_name: Option<String>,
    #[serde(default)]
    resources: Option<Vec<AiResource>>,
}

#[derive(Debug, Default, Deserialize)]
struct AiResource {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    share_code: Option<String>,
    #[serde(default)]
    publish_time: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    poster: Option<String>,
}

/// 构建用户提示词
pub fn build_prompt(keyword: &str, extra: Option<&str>) -> String {
    let base = format!(
        r#"请从以下网盘资源站内容中提取包含关键词"{keyword}"的网盘资源信息，并以JSON格式返回。要求：
1. 返回格式必须为JSON，包含channel_name和resources数组
2. resources数组中的每个资源必须包含以下字段：
   - title: 资源标题
   - poster：海报封面图片
   - link: 分享链接
   - platform: 网盘平台名称（根据分享链接域名判断：
{table}
     * 其他域名保持原样）
   - share_code: 提取码（如果有）
   - publish_time: 发布时间（如果有）
   - tags: 标签数组（如果有）
3. 如果某些字段信息不存在，可以省略该字段
4. 如果存在相同的网盘链接，则只提取发布时间最新的那个资源
5. 请确保JSON格式正确，便于程序解析"#,
        table = platform::describe_table()
    );

    match extra.map(str::trim).filter(|e| !e.is_empty()) {
        Some(extra) => format!("{}\n\n额外要求：\n{}", base, extra),
        None => base,
    }
}

/// 宽松解析模型回答: 先整体解析，再去掉代码块标记解析
fn parse_answer(text: &str) -> Option<AiAnswer> {
    if let Ok(answer) = serde_json::from_str::<AiAnswer>(text.trim()) {
        return Some(answer);
    }
    let inner = CODE_FENCE.captures(text)?.get(1)?.as_str();
    serde_json::from_str(inner).ok()
}

/// 把模型回答转换为网盘资源
pub fn resources_from_answer(text: &str, ctx: &ExtractContext<'_>) -> Vec<CloudResource> {
    let Some(answer) = parse_answer(text) else {
        warn!("频道 {} 的 AI 回答无法解析为 JSON", ctx.name);
        return Vec::new();
    };
    let Some(resources) = answer.resources else {
        warn!("频道 {} 的 AI 回答缺少 resources 字段", ctx.name);
        return Vec::new();
    };

    let channel = answer
        .channel_name
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| ctx.name.to_string());

    let mut items = Vec::new();
    for r in resources {
        let Some(link) = r.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()) else {
            continue;
        };
        // 模型给的平台不在表里时按域名重新识别，识别不了就丢弃
        let Some(platform) = r
            .platform
            .map(|p| p.trim().to_string())
            .filter(|p| platform::known_platforms().any(|known| known == p))
            .or_else(|| platform::classify(&link).map(str::to_string))
        else {
            continue;
        };

        items.push(CloudResource {
            id: format!("{}-ai-{}", ctx.key, items.len()),
            title: r.title.unwrap_or_default(),
            poster_url: r.poster.filter(|p| !p.trim().is_empty()),
            source_channel: channel.clone(),
            platform,
            publish_time: r
                .publish_time
                .as_deref()
                .and_then(parse_publish_time)
                .unwrap_or_else(Utc::now),
            share_url: link,
            share_code: r.share_code.filter(|c| !c.trim().is_empty()),
            tags: r.tags.unwrap_or_default(),
        });
    }
    items
}

/// LLM 提取策略
pub struct LlmExtractor {
    chat: std::sync::Arc<dyn ChatCompletion>,
    settings: Option<LlmSettings>,
}

impl LlmExtractor {
    pub fn new(chat: std::sync::Arc<dyn ChatCompletion>, settings: Option<LlmSettings>) -> Self {
        Self { chat, settings }
    }

    pub async fn extract(
        &self,
        raw: &str,
        ctx: &ExtractContext<'_>,
    ) -> Result<Vec<CloudResource>, EngineError> {
        let Some(settings) = &self.settings else {
            warn!("AI模型配置不完整, 跳过频道 {}", ctx.name);
            return Ok(Vec::new());
        };

        let prompt = build_prompt(ctx.keyword, settings.extra_prompt.as_deref());
        let messages = [
            ChatMessage {
                role: "system",
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user",
                content: format!("{}\n\n频道名称：{}\n内容：{}", prompt, ctx.name, raw),
            },
        ];

        let answer = self.chat.complete(settings, &messages).await?;
        let resources = resources_from_answer(&answer, ctx);
        debug!("频道 {} AI 提取到 {} 个资源", ctx.name, resources.len());
        Ok(resources)
    }
}
