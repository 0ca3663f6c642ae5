//! # 业务逻辑服务模块
//!
//! 包含置顶功能的核心逻辑，与各上下文会话（`session`）解耦：
//! - `identity` - 消息身份推导：由内容和作者得到稳定 ID
//! - `scanner` - 消息扫描与标注：查找消息元素并幂等地挂上置顶按钮
//! - `pin_set` - 置顶集合管理：缓存、切换、删除与先读后写同步
//! - `storage` - 存储适配层：共享后端 + 本地回退后端
//! - `broadcast` - 跨上下文广播：上下文注册、推送与请求/响应
//! - `export` - 置顶集合导出为 JSON 文件

pub mod broadcast;
pub mod export;
pub mod identity;
pub mod pin_set;
pub mod scanner;
pub mod storage;
