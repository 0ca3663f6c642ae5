//! # 跨上下文消息协议
//!
//! 内容脚本、弹出面板和后台路由之间通过广播通道交换的请求/响应结构。
//! JSON 形态与扩展运行时的消息完全一致：
//!
//! | 请求 | 响应 |
//! |------|------|
//! | `{action:"getPinnedMessages"}` | `{pinnedMessages}` |
//! | `{action:"updatePinnedMessages", pinnedMessages}` | `{success:true}` |
//! | `{action:"removePinnedMessage", messageId}` | `{success:true}` |
//! | `{action:"pinnedMessagesUpdated", pinnedMessages}` | 无（推送） |
//!
//! 任何错误统一以 `{error:"Extension context invalid"}` 返回。

use serde::{Deserialize, Serialize};

use crate::models::pinned::PinnedMessage;

/// 协议层唯一的错误文本
pub const CONTEXT_INVALID: &str = "Extension context invalid";

/// 请求消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    /// 查询当前置顶集合
    GetPinnedMessages,
    /// 用给定集合整体覆盖置顶集合
    UpdatePinnedMessages { pinned_messages: Vec<PinnedMessage> },
    /// 按 ID 移除一条置顶消息
    RemovePinnedMessage { message_id: String },
    /// 推送：置顶集合已变化，接收方应把它当作新的权威快照
    PinnedMessagesUpdated { pinned_messages: Vec<PinnedMessage> },
}

impl Request {
    /// 是否为不需要响应的推送消息
    pub fn is_push(&self) -> bool {
        matches!(self, Request::PinnedMessagesUpdated { .. })
    }
}

/// 响应消息
///
/// 三种形态字段互不重叠，使用 untagged 表示即可无歧义地往返。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum Response {
    /// `getPinnedMessages` 的结果
    Pinned { pinned_messages: Vec<PinnedMessage> },
    /// 写操作成功
    Success { success: bool },
    /// 运行时不可用或处理失败
    Error { error: String },
}

impl Response {
    /// 写操作成功的响应
    pub fn ok() -> Self {
        Response::Success { success: true }
    }

    /// 上下文失效的错误响应
    pub fn context_invalid() -> Self {
        Response::Error {
            error: CONTEXT_INVALID.to_string(),
        }
    }
}
