//! # 置顶集合导出服务
//!
//! 把完整的置顶集合导出为带缩进的 JSON 文件，文件名带导出日期：
//! `chatgpt-pinned-messages-YYYY-MM-DD.json`。

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::models::pinned::PinnedMessage;
use crate::utils::time::date_stamp;

/// 导出文件名前缀
const FILE_PREFIX: &str = "chatgpt-pinned-messages";

/// 将置顶集合序列化为美化的 JSON 数组（2 空格缩进），保留所有字段
pub fn to_json(pins: &[PinnedMessage]) -> Result<String, String> {
    serde_json::to_string_pretty(pins).map_err(|e| format!("序列化导出内容失败: {}", e))
}

/// 指定日期的导出文件名
pub fn export_file_name(date: NaiveDate) -> String {
    format!("{}-{}.json", FILE_PREFIX, date_stamp(date))
}

/// 把置顶集合写入导出目录
///
/// # 参数
/// - `pins` - 要导出的置顶集合
/// - `dir` - 导出目录（不存在时创建）
/// - `date` - 文件名中使用的日期
///
/// # 返回值
/// 写入的文件路径
///
/// # 错误
/// 目录创建或文件写入失败时返回错误
pub async fn write_export(
    pins: &[PinnedMessage],
    dir: &Path,
    date: NaiveDate,
) -> Result<PathBuf, String> {
    let content = to_json(pins)?;

    if !dir.exists() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| format!("创建导出目录失败: {}", e))?;
    }

    let path = dir.join(export_file_name(date));
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| format!("写入导出文件失败: {}", e))?;

    log::info!("已导出 {} 条置顶消息到 {}", pins.len(), path.display());
    Ok(path)
}
