//! # 数据模型模块
//!
//! 定义了在扩展各上下文之间传输、并持久化到键值存储中的数据结构。
//! 所有结构体均派生 `Serialize` 和 `Deserialize`，JSON 字段名与扩展运行时一致。
//! - `pinned` - 置顶消息及其预览规则
//! - `settings` - 偏好设置及默认值合并
//! - `protocol` - 跨上下文请求/响应协议

pub mod pinned;
pub mod protocol;
pub mod settings;
