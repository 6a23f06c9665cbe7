//! AI 接口测速
//! 按批并发发送同一条提示，统计成功请求的最短 / 平均 / 最长耗时

use crate::extract::llm::{ChatCompletion, ChatMessage, LlmSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_PROMPT: &str = "请简单回复'测试成功'";
const MAX_TESTS: u32 = 100;
const MAX_CONCURRENT: u32 = 10;
const BATCH_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkPlan {
    pub prompt: Option<String>,
    pub test_count: Option<u32>,
    pub concurrent_count: Option<u32>,
}

impl BenchmarkPlan {
    fn test_count(&self) -> u32 {
        self.test_count.unwrap_or(5).clamp(1, MAX_TESTS)
    }

    fn concurrent_count(&self) -> u32 {
        self.concurrent_count.unwrap_or(1).clamp(1, MAX_CONCURRENT)
    }

    fn prompt(&self) -> String {
        self.prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PROMPT)
            .to_string()
    }
}

/// 单次请求
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkSample {
    pub index: u32,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkReport {
    pub total_tests: u32,
    pub successful_tests: u32,
    pub failed_tests: u32,
    /// 以下三项只统计成功的请求，没有成功时为 0
    pub average_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub samples: Vec<BenchmarkSample>,
}

impl BenchmarkReport {
    fn from_samples(samples: Vec<BenchmarkSample>) -> Self {
        let durations: Vec<u64> = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.duration_ms)
            .collect();
        let successful = durations.len() as u32;
        let average_ms = match successful {
            0 => 0,
            n => durations.iter().sum::<u64>() / u64::from(n),
        };

        Self {
            total_tests: samples.len() as u32,
            successful_tests: successful,
            failed_tests: samples.len() as u32 - successful,
            average_ms,
            min_ms: durations.iter().copied().min().unwrap_or(0),
            max_ms: durations.iter().copied().max().unwrap_or(0),
            samples,
        }
    }
}

async fn sample(
    chat: &dyn ChatCompletion,
    settings: &LlmSettings,
    prompt: &str,
    index: u32,
) -> BenchmarkSample {
    let messages = [ChatMessage {
        role: "user",
        content: prompt.to_string(),
    }];
    let started = Instant::now();
    let result = chat.complete(settings, &messages).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(reply) => BenchmarkSample {
            index,
            success: true,
            duration_ms,
            reply: Some(reply),
            error: None,
        },
        Err(e) => {
            debug!("测速请求 #{} 失败: {}", index, e);
            BenchmarkSample {
                index,
                success: false,
                duration_ms,
                reply: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// 每批最多 concurrent_count 个请求，批与批之间稍作停顿
pub async fn run(
    chat: &dyn ChatCompletion,
    settings: &LlmSettings,
    plan: &BenchmarkPlan,
) -> BenchmarkReport {
    let total = plan.test_count();
    let concurrent = plan.concurrent_count();
    let prompt = plan.prompt();
    info!("⏱️ AI 测速: {} 次, 并发 {}, 模型 {}", total, concurrent, settings.model);

    let mut samples = Vec::with_capacity(total as usize);
    let mut next = 0;
    while next < total {
        let batch = concurrent.min(total - next);
        let requests = (next..next + batch).map(|index| sample(chat, settings, &prompt, index));
        samples.extend(futures::future::join_all(requests).await);
        next += batch;
        if next < total {
            tokio::time::sleep(BATCH_PAUSE).await;
        }
    }

    BenchmarkReport::from_samples(samples)
}
