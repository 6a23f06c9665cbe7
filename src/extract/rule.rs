//! 频道网页规则提取
//! 适配 TG 频道网页预览 (`t.me/s/<channel>?q=`) 的消息结构

use super::{parse_publish_time, platform, ExtractContext};
use crate::types::CloudResource;
use chrono::Utc;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("invalid built-in selector")
}

static MESSAGE: Lazy<Selector> = Lazy::new(|| selector(".tgme_widget_message_wrap"));
static TIME: Lazy<Selector> = Lazy::new(|| selector("time"));
static MESSAGE_TEXT: Lazy<Selector> = Lazy::new(|| selector(".js-message_text"));
static LINKS: Lazy<Selector> = Lazy::new(|| selector(".tgme_widget_message_text a"));

/// 从频道页面提取网盘资源，只保留能识别平台的链接
pub fn extract_resources(html: &str, ctx: &ExtractContext<'_>) -> Vec<CloudResource> {
    let document = Html::parse_document(html);
    let mut items = Vec::new();

    for message in document.select(&MESSAGE) {
        let publish_time = message
            .select(&TIME)
            .next()
            .and_then(|t| t.value().attr("datetime"))
            .and_then(parse_publish_time)
            .unwrap_or_else(Utc::now);

        let title = message
            .select(&MESSAGE_TEXT)
            .next()
            .map(first_line)
            .unwrap_or_default();

        for link in message.select(&LINKS).filter_map(|a| a.value().attr("href")) {
            let Some(platform) = platform::classify(link) else {
                continue;
            };

            items.push(CloudResource {
                id: format!("{}-{}", ctx.key, items.len()),
                title: title.clone(),
                poster_url: None,
                source_channel: ctx.name.to_string(),
                platform: platform.to_string(),
                publish_time,
                share_url: link.trim().to_string(),
                share_code: None,
                tags: Vec::new(),
            });
        }
    }

    debug!("频道 {} 规则提取到 {} 个资源", ctx.name, items.len());
    items
}

/// 消息正文第一个 `<br>` 之前的纯文本
fn first_line(element: ElementRef<'_>) -> String {
    let html = element.inner_html();
    let head = html.split("<br>").next().unwrap_or_default();
    Html::parse_fragment(head)
        .root_element()
        .text()
        .collect::<String>()
        .replace('\n', "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const PAGE: &str = r#"
    <html><body>
      <div class="tgme_widget_message_wrap">
        <div class="tgme_widget_message_text js-message_text">
          <b>仙逆 第5集</b> 4K &amp; 杜比<br>简介一行<br>
          <a href="https://pan.quark.cn/s/abc">夸克</a>
          <a href="https://t.me/somechannel">频道</a>
          <a href="https://www.alipan.com/s/def">阿里</a>
        </div>
        <time datetime="2024-05-01T10:00:00+00:00">May 1</time>
      </div>
      <div class="tgme_widget_message_wrap">
        <div class="tgme_widget_message_text js-message_text">
          只有未知链接<br><a href="https://example.org/x">x</a>
        </div>
        <time datetime="2024-05-02T10:00:00+00:00">May 2</time>
      </div>
    </body></html>
    "#;

    fn ctx() -> ExtractContext<'static> {
        ExtractContext {
            key: "tg1",
            name: "资源频道",
            keyword: "仙逆",
        }
    }

    #[test]
    fn test_extract_known_links_only() {
        let items = extract_resources(PAGE, &ctx());
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].platform, "夸克网盘");
        assert_eq!(items[0].share_url, "https://pan.quark.cn/s/abc");
        assert_eq!(items[1].platform, "阿里云网盘");
        assert!(items.iter().all(|r| r.source_channel == "资源频道"));
        assert!(items.iter().all(|r| !r.share_url.contains("t.me")));
    }

    #[test]
    fn test_title_and_time() {
        let items = extract_resources(PAGE, &ctx());
        assert_eq!(items[0].title, "仙逆 第5集 4K & 杜比");
        assert_eq!(
            items[0].publish_time,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_ne!(items[0].id, items[1].id);
    }

    #[test]
    fn test_empty_page() {
        assert!(extract_resources("<html></html>", &ctx()).is_empty());
    }
}
