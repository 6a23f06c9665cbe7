//! 网盘平台识别
//! 按分享链接的域名归类，规则提取和 LLM 提取共用同一张表

/// (域名片段, 平台名称)
const PLATFORM_TABLE: &[(&[&str], &str)] = &[
    (&["alipan.com", "aliyundrive.com"], "阿里云网盘"),
    (&["quark.cn"], "夸克网盘"),
    (&["baidu.com"], "百度网盘"),
    (&["189.cn"], "天翼云网盘"),
    (&["xunlei.com"], "迅雷云盘"),
    (&["123865.com", "123684.com", "123912.com"], "123云盘"),
    (&["139.com"], "移动云盘"),
    (&["uc.cn"], "UC网盘"),
];

/// 根据链接识别平台，未知域名或非法链接返回 None
pub fn classify(link: &str) -> Option<&'static str> {
    let url = url::Url::parse(link.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();

    PLATFORM_TABLE
        .iter()
        .find(|(domains, _)| domains.iter().any(|d| host.contains(d)))
        .map(|(_, name)| *name)
}

/// 所有已知平台名称
pub fn known_platforms() -> impl Iterator<Item = &'static str> {
    PLATFORM_TABLE.iter().map(|(_, name)| *name)
}

/// 给 LLM 提示词用的平台说明
pub fn describe_table() -> String {
    PLATFORM_TABLE
        .iter()
        .map(|(domains, name)| format!("     * {} 为{}", domains.join(" 或 "), name))
        .collect::<Vec<_>>()
        .join("\n")
}
