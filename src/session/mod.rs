//! # 会话模块
//!
//! 各个运行上下文的会话：
//! - `content` - 宿主页面中的注入会话（扫描、按钮、toast、失效检测）
//! - `panel` - 弹出面板 / 设置页会话（浏览、删除、导出、偏好）

pub mod content;
pub mod panel;
