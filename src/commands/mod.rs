//! # 命令处理模块
//!
//! 每个子模块对应一个功能域：
//! - `background` - 后台请求路由：应答跨上下文协议请求、转发集合变更
//! - `settings` - 偏好设置的读取、保存、重置和全部清空

pub mod background;
pub mod settings;
