//! # 偏好设置命令
//!
//! 设置页使用的偏好设置读写命令：
//! - `load_preferences` - 读取已保存的部分值并合并到默认值之上
//! - `save_preference` - 写入单个偏好（开关或下拉框变化时立即保存）
//! - `save_preferences` - 写入全部偏好
//! - `reset_preferences` - 把全部偏好恢复为默认值并保存
//! - `clear_all_data` - 清空存储（包括置顶集合），界面回到默认偏好

use serde_json::{Map, Value};

use crate::models::settings::Preferences;
use crate::services::storage::StorageBackend;

/// 读取偏好设置
///
/// 未保存过的键、类型不正确的键都使用默认值。
///
/// # 错误
/// 存储读取失败时返回错误
pub async fn load_preferences(storage: &dyn StorageBackend) -> Result<Preferences, String> {
    let stored = storage.get(&Preferences::KEYS).await?;
    Ok(Preferences::merge_stored(&stored))
}

/// 保存单个偏好
///
/// # 参数
/// - `key` - 偏好键名（如 `darkMode`、`previewLength`）
/// - `value` - 新值，类型必须与该偏好一致
///
/// # 错误
/// 键名未知、值类型不正确或存储写入失败时返回错误
pub async fn save_preference(
    storage: &dyn StorageBackend,
    key: &str,
    value: Value,
) -> Result<(), String> {
    if !Preferences::KEYS.contains(&key) {
        return Err(format!("未知的偏好设置: {}", key));
    }

    let mut candidate = Preferences::default().to_items();
    candidate.insert(key.to_string(), value.clone());
    serde_json::from_value::<Preferences>(Value::Object(candidate))
        .map_err(|e| format!("偏好设置 {} 的值无效: {}", key, e))?;

    let mut items = Map::new();
    items.insert(key.to_string(), value);
    storage.set(items).await
}

/// 保存全部偏好
pub async fn save_preferences(
    storage: &dyn StorageBackend,
    preferences: &Preferences,
) -> Result<(), String> {
    storage.set(preferences.to_items()).await
}

/// 恢复默认偏好并保存
///
/// # 返回值
/// 默认偏好
pub async fn reset_preferences(storage: &dyn StorageBackend) -> Result<Preferences, String> {
    let defaults = Preferences::default();
    save_preferences(storage, &defaults).await?;
    log::info!("偏好设置已恢复默认值");
    Ok(defaults)
}

/// 清空全部数据
///
/// 清空存储中的所有键（置顶集合和偏好），不重新写入默认值；
/// 之后读取偏好时自然得到默认值。
///
/// # 返回值
/// 清空后生效的（默认）偏好
pub async fn clear_all_data(storage: &dyn StorageBackend) -> Result<Preferences, String> {
    storage.clear().await?;
    log::info!("已清空全部置顶消息和偏好设置");
    Ok(Preferences::default())
}
