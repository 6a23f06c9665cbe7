use anyhow::Context;
use serde::Deserialize;

/// 服务配置，从环境变量 / .env 读取
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP 监听地址
    #[serde(default = "default_bind")]
    pub bind: String,

    /// 持久化存储文件
    #[serde(default = "default_data_file")]
    pub data_file: String,

    /// 默认中转地址 (存储中的设置优先)
    #[serde(default)]
    pub relay_base: Option<String>,

    /// 默认 m3u8 播放代理
    #[serde(default)]
    pub stream_relay: Option<String>,

    /// 单个资源站请求超时 (秒)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// 播放记录上限
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default)]
    pub llm_api_url: Option<String>,

    #[serde(default)]
    pub llm_api_key: Option<String>,

    #[serde(default)]
    pub llm_model: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_data_file() -> String {
    "data/store.json".to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_history_capacity() -> usize {
    20
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            data_file: default_data_file(),
            relay_base: None,
            stream_relay: None,
            request_timeout_secs: default_request_timeout_secs(),
            history_capacity: default_history_capacity(),
            llm_api_url: None,
            llm_api_key: None,
            llm_model: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        // .env 不存在时忽略
        let _ = dotenvy::dotenv();

        envy::from_env::<AppConfig>().context("Failed to load config from environment")
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
