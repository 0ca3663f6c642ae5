//! # 偏好设置数据模型
//!
//! 定义了面板和设置页共用的偏好设置（Preferences）。
//! 每个字段在存储中是一个独立的顶层键（`darkMode`、`minimalUI` 等），
//! 与置顶集合共用同一个键值存储。
//!
//! 默认值只在 `Preferences::default()` 中定义一次；
//! 加载时把存储中的（可能只有部分字段的）值覆盖到默认值之上。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 相对时间格式（默认值）
pub const DATE_FORMAT_RELATIVE: &str = "relative";

/// 偏好设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    /// 深色模式
    pub dark_mode: bool,

    /// 精简界面；存储键为 `minimalUI`
    #[serde(rename = "minimalUI")]
    pub minimal_ui: bool,

    /// 是否在页面上显示 toast 提示
    pub toast_notifications: bool,

    /// 面板是否随存储变化自动刷新
    pub auto_refresh: bool,

    /// 面板卡片预览长度（字符数）
    pub preview_length: u32,

    /// 时间展示格式：`relative` 或其他（按日历日期展示）
    pub date_format: String,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            dark_mode: false,
            minimal_ui: false,
            toast_notifications: true,
            auto_refresh: true,
            preview_length: 100,
            date_format: DATE_FORMAT_RELATIVE.to_string(),
        }
    }
}

impl Preferences {
    /// 偏好设置在存储中占用的全部键
    pub const KEYS: [&'static str; 6] = [
        "darkMode",
        "minimalUI",
        "toastNotifications",
        "autoRefresh",
        "previewLength",
        "dateFormat",
    ];

    /// 把存储中读出的部分值合并到默认值之上
    ///
    /// 逐键合并：类型不正确的单个键被忽略（保留默认值），
    /// 不会因为一个坏值丢掉其余已保存的设置。
    pub fn merge_stored(stored: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        let mut merged = match serde_json::to_value(&defaults) {
            Ok(Value::Object(map)) => map,
            _ => return defaults,
        };

        for key in Self::KEYS {
            let Some(value) = stored.get(key) else {
                continue;
            };
            let mut candidate = merged.clone();
            candidate.insert(key.to_string(), value.clone());
            if serde_json::from_value::<Self>(Value::Object(candidate)).is_ok() {
                merged.insert(key.to_string(), value.clone());
            } else {
                log::warn!("偏好设置 {} 的存储值无效，使用默认值: {}", key, value);
            }
        }

        serde_json::from_value(Value::Object(merged)).unwrap_or(defaults)
    }

    /// 转换为可直接写入存储的键值映射
    pub fn to_items(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// 是否使用相对时间格式
    pub fn uses_relative_dates(&self) -> bool {
        self.date_format == DATE_FORMAT_RELATIVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let prefs = Preferences::default();
        assert!(!prefs.dark_mode);
        assert!(!prefs.minimal_ui);
        assert!(prefs.toast_notifications);
        assert!(prefs.auto_refresh);
        assert_eq!(prefs.preview_length, 100);
        assert!(prefs.uses_relative_dates());
    }

    #[test]
    fn merge_overlays_partial_values() {
        let stored = json!({ "darkMode": true, "previewLength": 200 });
        let prefs = Preferences::merge_stored(stored.as_object().unwrap());
        assert!(prefs.dark_mode);
        assert_eq!(prefs.preview_length, 200);
        assert!(prefs.toast_notifications);
    }

    #[test]
    fn merge_ignores_mistyped_values_individually() {
        let stored = json!({ "minimalUI": "yes", "dateFormat": "absolute" });
        let prefs = Preferences::merge_stored(stored.as_object().unwrap());
        assert!(!prefs.minimal_ui);
        assert_eq!(prefs.date_format, "absolute");
    }

    #[test]
    fn items_use_storage_key_names() {
        let items = Preferences::default().to_items();
        for key in Preferences::KEYS {
            assert!(items.contains_key(key), "missing {key}");
        }
        assert_eq!(items["minimalUI"], json!(false));
    }
}
