//! # 路径工具函数
//!
//! 提供与文件路径相关的工具函数，包括：
//! - 获取本应用数据目录路径（`~/.chatgpt-pinner/`）
//! - 获取共享存储文件路径（`~/.chatgpt-pinner/storage.json`）
//! - 获取导出目录（系统下载目录，取不到时回退到主目录）

use std::path::PathBuf;

/// 数据目录名
const DATA_DIR_NAME: &str = ".chatgpt-pinner";

/// 共享存储文件名
const STORAGE_FILE_NAME: &str = "storage.json";

/// 获取本应用数据目录的绝对路径
///
/// 使用 `dirs` crate 获取跨平台的主目录路径。
///
/// # 错误
/// 如果无法确定用户主目录（如无 HOME 环境变量），返回错误信息。
///
/// # 示例
/// - Windows: `C:\Users\username\.chatgpt-pinner`
/// - Linux/macOS: `/home/username/.chatgpt-pinner`
pub fn get_pinner_data_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "无法获取用户主目录".to_string())?;
    Ok(home.join(DATA_DIR_NAME))
}

/// 获取共享存储文件的绝对路径
pub fn get_storage_file_path() -> Result<PathBuf, String> {
    Ok(get_pinner_data_path()?.join(STORAGE_FILE_NAME))
}

/// 获取默认导出目录
///
/// 优先使用系统下载目录，没有时回退到用户主目录。
///
/// # 错误
/// 两者都无法确定时返回错误信息。
pub fn get_export_dir() -> Result<PathBuf, String> {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| "无法确定导出目录".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_file_lives_in_data_dir() {
        let Ok(data) = get_pinner_data_path() else {
            return;
        };
        assert!(data.ends_with(".chatgpt-pinner"));
        assert_eq!(get_storage_file_path().unwrap(), data.join("storage.json"));
    }
}
