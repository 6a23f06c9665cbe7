//! 剧集列表解析
//! 苹果 CMS 的 `vod_play_url` 格式: `第1集$url#第2集$url`，多线路以 `$$$` 连接

use crate::types::{Episode, SortOrder};

/// 线路分隔符，只保留最后一段
const ROAD_SEPARATOR: &str = "$$$";
/// 剧集分隔符
const EPISODE_SEPARATOR: char = '#';
/// 名称 / 地址分隔符
const LABEL_SEPARATOR: char = '$';

/// 解析剧集字符串，丢弃地址不是 http(s) 绝对地址的片段
pub fn parse_play_url(raw: &str) -> Vec<Episode> {
    let playlist = match raw.rfind(ROAD_SEPARATOR) {
        Some(pos) => &raw[pos + ROAD_SEPARATOR.len()..],
        None => raw,
    };

    playlist
        .split(EPISODE_SEPARATOR)
        .filter_map(parse_segment)
        .collect()
}

fn parse_segment(segment: &str) -> Option<Episode> {
    let mut parts = segment.split(LABEL_SEPARATOR);
    let label = parts.next()?.trim();
    let url = parts.next()?.trim();

    if label.is_empty() || !is_absolute_http(url) {
        return None;
    }

    Some(Episode {
        label: label.to_string(),
        stream_url: url.to_string(),
    })
}

/// 是否为 http(s) 绝对地址
pub fn is_absolute_http(candidate: &str) -> bool {
    match url::Url::parse(candidate) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

/// 按排序方向生成视图，不修改原列表
pub fn ordered_view(episodes: &[Episode], order: SortOrder) -> Vec<&Episode> {
    match order {
        SortOrder::Asc => episodes.iter().collect(),
        SortOrder::Desc => episodes.iter().rev().collect(),
    }
}

/// 按名称查找剧集下标
pub fn position_of(episodes: &[Episode], label: &str) -> Option<usize> {
    episodes.iter().position(|ep| ep.label == label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_episodes_in_order() {
        let episodes = parse_play_url("1$http://a/1.m3u8#2$http://a/2.m3u8");
        assert_eq!(episodes.len(), 2);
        assert_eq!(episodes[0].label, "1");
        assert_eq!(episodes[0].stream_url, "http://a/1.m3u8");
        assert_eq!(episodes[1].label, "2");
        assert_eq!(episodes[1].stream_url, "http://a/2.m3u8");
    }

    #[test]
    fn test_legacy_prefix_discarded() {
        let episodes = parse_play_url("garbage$$$1$http://a/1.m3u8");
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].label, "1");
    }

    #[test]
    fn test_only_last_road_kept() {
        let raw = "第1集$http://x/1.mp4#第2集$http://x/2.mp4$$$第1集$https://y/1.m3u8";
        let episodes = parse_play_url(raw);
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].stream_url, "https://y/1.m3u8");
    }

    #[test]
    fn test_non_http_segment_dropped() {
        let all = parse_play_url("1$http://a/1.m3u8#2$http://a/2.m3u8");
        let with_ftp = parse_play_url("1$http://a/1.m3u8#3$ftp://x#2$http://a/2.m3u8");
        assert_eq!(with_ftp.len(), all.len());
        assert_eq!(with_ftp, all);
    }

    #[test]
    fn test_malformed_segments_dropped() {
        let episodes = parse_play_url("#$http://a/0.m3u8#1#2$#3$relative/path#4$ https://a/4.m3u8 ");
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].label, "4");
        assert_eq!(episodes[0].stream_url, "https://a/4.m3u8");
        assert!(parse_play_url("").is_empty());
    }

    #[test]
    fn test_ordered_view_does_not_mutate() {
        let episodes = parse_play_url("1$http://a/1#2$http://a/2#3$http://a/3");
        let desc: Vec<_> = ordered_view(&episodes, SortOrder::Desc)
            .into_iter()
            .map(|ep| ep.label.as_str())
            .collect();
        assert_eq!(desc, vec!["3", "2", "1"]);
        assert_eq!(episodes[0].label, "1");
        assert_eq!(position_of(&episodes, "2"), Some(1));
        assert_eq!(position_of(&episodes, "9"), None);
    }
}
