//! # 置顶消息数据模型
//!
//! 定义了置顶消息（PinnedMessage）结构体，对应持久化键 `pinnedMessages`
//! 中数组的每个元素。字段名与扩展各界面（内容脚本、弹出面板、设置页）
//! 之间传输的 JSON 完全一致（camelCase）。
//!
//! ## 不变量
//! - `id` 在整个置顶集合内唯一
//! - `preview` 是 `content` 截断到 100 个字符的结果，被截断时追加 `...`
//! - `timestamp` 在置顶时设置，之后永不修改

use serde::{Deserialize, Serialize};

/// 预览文本的最大字符数（不含省略号）
pub const PREVIEW_LIMIT: usize = 100;

/// 预览被截断时追加的省略标记
const ELLIPSIS: &str = "...";

/// 作者占位值：所有作者提取策略都未命中时使用
pub const AUTHOR_UNKNOWN: &str = "Unknown";

/// 规范化后的用户作者名
pub const AUTHOR_USER: &str = "User";

/// 规范化后的助手作者名
pub const AUTHOR_ASSISTANT: &str = "Assistant";

/// 置顶消息
///
/// 置顶集合是一个无序的"袋"：持久化时是有序数组，
/// 但展示顺序由消费方按时间戳重新推导（最新在前），不依赖存储顺序。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinnedMessage {
    /// 由身份推导器生成的稳定标识符
    pub id: String,

    /// 置顶时提取到的完整消息文本
    pub content: String,

    /// 作者："User" / "Assistant" / "Unknown" 或页面上提取到的原始作者文本
    pub author: String,

    /// 置顶时间：ISO 8601 格式（如 `2024-05-01T12:00:00.000Z`）
    pub timestamp: String,

    /// 置顶时所在会话页面的 URL
    pub url: String,

    /// 预览文本：最多 103 个字符
    pub preview: String,
}

impl PinnedMessage {
    /// 从提取到的消息快照创建新的置顶记录
    ///
    /// `preview` 在此处统一计算，保证预览不变量只有一个来源。
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        author: impl Into<String>,
        url: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let preview = make_preview(&content, PREVIEW_LIMIT);
        Self {
            id: id.into(),
            content,
            author: author.into(),
            timestamp: timestamp.into(),
            url: url.into(),
            preview,
        }
    }

    /// 面板卡片上使用的作者样式类
    ///
    /// 作者文本包含 "user"（不区分大小写）时为 `user`，其余一律为 `assistant`。
    pub fn author_class(&self) -> &'static str {
        if self.author.to_lowercase().contains("user") {
            "user"
        } else {
            "assistant"
        }
    }

    /// 内容是否足够短，可以在卡片中直接完整展示
    pub fn fits_preview(&self) -> bool {
        self.content.chars().count() <= PREVIEW_LIMIT
    }
}

/// 生成预览文本
///
/// 按字符（而非字节）截断，避免在多字节字符中间切断。
///
/// # 参数
/// - `content` - 完整消息文本
/// - `limit` - 最多保留的字符数
///
/// # 返回值
/// `content` 不超过 `limit` 个字符时原样返回，否则返回前 `limit` 个字符加 `...`
pub fn make_preview(content: &str, limit: usize) -> String {
    match content.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{}", &content[..cut], ELLIPSIS),
        None => content.to_string(),
    }
}

/// 从存储中读出的原始 JSON 解析置顶集合
///
/// 缺失、为 `null` 或格式不正确时返回空集合，与扩展的容错策略一致；
/// 单个元素格式不正确时仅跳过该元素。
pub fn parse_collection(value: Option<&serde_json::Value>) -> Vec<PinnedMessage> {
    match value {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        Some(serde_json::Value::Null) | None => Vec::new(),
        Some(other) => {
            log::warn!("置顶集合格式不正确，按空集合处理: {}", other);
            Vec::new()
        }
    }
}
