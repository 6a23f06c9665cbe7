//! 结果合并与去重
//! 作品不跨站去重；网盘资源按分享链接去重，保留发布时间最新的一条

use crate::types::{CloudResource, Extracted, NormalizedWork};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// 合并后的结果
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Merged {
    pub works: Vec<NormalizedWork>,
    pub resources: Vec<CloudResource>,
}

/// 按到达顺序拼接各站的作品
pub fn merge_works<I>(batches: I) -> Vec<NormalizedWork>
where
    I: IntoIterator<Item = Vec<NormalizedWork>>,
{
    batches.into_iter().flatten().collect()
}

/// 按 share_url 去重 (保留最新)，再按发布时间倒序
pub fn merge_resources<I>(batches: I) -> Vec<CloudResource>
where
    I: IntoIterator<Item = Vec<CloudResource>>,
{
    let mut latest: HashMap<String, CloudResource> = HashMap::new();

    for resource in batches.into_iter().flatten() {
        match latest.get(&resource.share_url) {
            Some(kept) if kept.publish_time >= resource.publish_time => {}
            _ => {
                latest.insert(resource.share_url.clone(), resource);
            }
        }
    }

    let mut merged: Vec<CloudResource> = latest.into_values().collect();
    // 时间相同时按链接排序，保证输出稳定
    merged.sort_by(|a, b| {
        b.publish_time
            .cmp(&a.publish_time)
            .then_with(|| a.share_url.cmp(&b.share_url))
    });
    merged
}

/// 流式搜索中已经发出的分享链接及其发布时间
#[derive(Debug, Clone, Default)]
pub struct SeenLinks(Arc<Mutex<HashMap<String, DateTime<Utc>>>>);

impl SeenLinks {
    /// 只放行没见过的链接，或比已发出的那条更新的链接
    pub fn admit(&self, batch: Vec<CloudResource>) -> Vec<CloudResource> {
        let mut seen = self.0.lock().unwrap_or_else(|e| e.into_inner());
        batch
            .into_iter()
            .filter(|resource| match seen.get(&resource.share_url) {
                Some(kept) if *kept >= resource.publish_time => false,
                _ => {
                    seen.insert(resource.share_url.clone(), resource.publish_time);
                    true
                }
            })
            .collect()
    }
}

/// 统一入口: 拆分提取结果后分别合并
pub fn merge(results: Vec<Extracted>) -> Merged {
    let mut works = Vec::new();
    let mut resources = Vec::new();

    for item in results {
        match item {
            Extracted::Work(w) => works.push(w),
            Extracted::Resource(r) => resources.push(r),
        }
    }

    Merged {
        works,
        resources: merge_resources([resources]),
    }
}

/// 各平台资源数量
pub fn platform_counts(resources: &[CloudResource]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for r in resources {
        *counts.entry(r.platform.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn resource(id: &str, share_url: &str, hour: u32) -> CloudResource {
        CloudResource {
            id: id.to_string(),
            title: format!("资源 {}", id),
            poster_url: None,
            source_channel: "频道".to_string(),
            platform: "夸克网盘".to_string(),
            publish_time: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            share_url: share_url.to_string(),
            share_code: None,
            tags: Vec::new(),
        }
    }

    fn work(source: &str, id: &str) -> NormalizedWork {
        NormalizedWork {
            id: id.to_string(),
            title: "同名".to_string(),
            poster_url: None,
            source_key: source.to_string(),
            source_name: source.to_string(),
            remark: None,
            year: None,
            region: None,
            kind: None,
            rating: None,
        }
    }

    #[test]
    fn test_dedup_keeps_latest() {
        let merged = merge_resources([
            vec![resource("old", "https://pan.quark.cn/s/1", 1)],
            vec![resource("new", "https://pan.quark.cn/s/1", 5)],
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "new");

        // 顺序反过来结果相同
        let merged = merge_resources([
            vec![resource("new", "https://pan.quark.cn/s/1", 5)],
            vec![resource("old", "https://pan.quark.cn/s/1", 1)],
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "new");
    }

    #[test]
    fn test_sorted_descending() {
        let merged = merge_resources([vec![
            resource("a", "https://pan.quark.cn/s/a", 1),
            resource("c", "https://pan.quark.cn/s/c", 9),
            resource("b", "https://pan.quark.cn/s/b", 4),
        ]]);
        let ids: Vec<_> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_works_not_deduplicated() {
        let works = merge_works([vec![work("s1", "1")], vec![work("s2", "1"), work("s2", "2")]]);
        assert_eq!(works.len(), 3);
        assert_eq!(works[0].source_key, "s1");
    }

    #[test]
    fn test_seen_links_admit_only_newer() {
        let seen = SeenLinks::default();
        let first = seen.admit(vec![resource("mid", "https://pan.quark.cn/s/1", 3)]);
        assert_eq!(first.len(), 1);

        // 更旧或同一时间的重复链接不再发出
        let older = seen.admit(vec![
            resource("old", "https://pan.quark.cn/s/1", 1),
            resource("same", "https://pan.quark.cn/s/1", 3),
        ]);
        assert!(older.is_empty());

        let newer = seen.clone().admit(vec![
            resource("new", "https://pan.quark.cn/s/1", 7),
            resource("other", "https://pan.quark.cn/s/2", 1),
        ]);
        let ids: Vec<_> = newer.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "other"]);
    }

    #[test]
    fn test_merge_mixed_and_counts() {
        let mut baidu = resource("b", "https://pan.baidu.com/s/1", 2);
        baidu.platform = "百度网盘".to_string();
        let merged = merge(vec![
            Extracted::Work(work("s1", "1")),
            Extracted::Resource(resource("q", "https://pan.quark.cn/s/1", 1)),
            Extracted::Resource(baidu),
            Extracted::Resource(resource("q2", "https://pan.quark.cn/s/1", 3)),
        ]);
        assert_eq!(merged.works.len(), 1);
        assert_eq!(merged.resources.len(), 2);
        assert_eq!(merged.resources[0].id, "q2");

        let counts = platform_counts(&merged.resources);
        assert_eq!(counts.get("夸克网盘"), Some(&1));
        assert_eq!(counts.get("百度网盘"), Some(&1));
    }
}
