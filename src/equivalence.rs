//! 换源
//! 只按标题完全相等匹配，切换时按剧集名称定位到同一集

use crate::engine::Engine;
use crate::episodes::position_of;
use crate::error::EngineError;
use crate::types::{Source, SourceRef, WorkDetail};
use tracing::{debug, info, warn};

/// 换源结果
#[derive(Debug, Clone)]
pub struct SwitchOutcome {
    pub detail: WorkDetail,
    /// 在新源剧集列表中的下标
    pub index: usize,
    /// 是否按名称找到了同一集
    pub label_matched: bool,
}

/// 查询所有启用的资源站中有同名作品的站点，按注册表顺序返回；当前站点不请求
pub async fn find_equivalents(
    engine: &Engine,
    sources: &[Source],
    current_key: &str,
    title: &str,
) -> Result<Vec<SourceRef>, EngineError> {
    engine.ensure_relay()?;

    let checks = sources.iter().map(|source| async move {
        if source.key == current_key {
            return true;
        }
        match engine.search_source(source, title).await {
            Ok(works) => works.iter().any(|w| w.title == title),
            Err(e) => {
                warn!("资源站 {} 换源查询失败: {}", source.name, e);
                false
            }
        }
    });
    let hits = futures::future::join_all(checks).await;

    let found: Vec<SourceRef> = sources
        .iter()
        .zip(hits)
        .filter(|(_, hit)| *hit)
        .map(|(source, _)| SourceRef {
            key: source.key.clone(),
            name: source.name.clone(),
        })
        .collect();
    debug!("{} 可换源站点: {}", title, found.len());
    Ok(found)
}

/// 切换到目标站点: 取第一个同名作品，按当前剧集名称定位，找不到时从第一集开始
pub async fn switch_source(
    engine: &Engine,
    target: &Source,
    title: &str,
    current_label: Option<&str>,
) -> Result<SwitchOutcome, EngineError> {
    engine.ensure_relay()?;

    let works = engine.search_source(target, title).await?;
    let work = works
        .into_iter()
        .find(|w| w.title == title)
        .ok_or(EngineError::NoEquivalentFound)?;

    let detail = engine.fetch_detail(target, &work.id).await?;
    if detail.episodes.is_empty() {
        return Err(EngineError::NoEpisodes);
    }

    let matched = current_label.and_then(|label| position_of(&detail.episodes, label));
    info!(
        "换源到 {}: {} {}",
        target.name,
        title,
        current_label.unwrap_or("-")
    );

    Ok(SwitchOutcome {
        detail,
        index: matched.unwrap_or(0),
        label_matched: matched.is_some(),
    })
}
