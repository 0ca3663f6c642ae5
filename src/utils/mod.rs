//! # 通用工具函数
//!
//! - `path` - 数据目录、存储文件、导出目录路径
//! - `time` - 时间戳生成与展示格式化

pub mod path;
pub mod time;
