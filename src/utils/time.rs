//! # 时间工具函数
//!
//! 提供置顶时间戳生成和面板展示用的时间标签格式化：
//! - `now_iso8601` - 与 JavaScript `Date.toISOString()` 相同格式的 UTC 时间
//! - `format_timestamp` - 相对时间（`5m ago` / `3h ago` / `2d ago`）或日历日期
//! - `date_stamp` - 导出文件名使用的 `YYYY-MM-DD`

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

/// 当前 UTC 时间，格式 `YYYY-MM-DDTHH:MM:SS.sssZ`
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 解析 ISO 8601 时间戳；无法解析时返回 None
pub fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// 格式化面板上的时间标签
///
/// 相对格式下：不足 1 小时显示分钟，不足 24 小时显示小时，
/// 不足 7 天显示天数，更早的显示日历日期。
/// 非相对格式始终显示日历日期；无法解析的时间戳原样返回。
///
/// # 参数
/// - `timestamp` - ISO 8601 时间戳
/// - `now` - 当前时间（由调用方传入，便于测试）
/// - `relative` - 是否使用相对格式
pub fn format_timestamp(timestamp: &str, now: DateTime<Utc>, relative: bool) -> String {
    let Some(time) = parse_timestamp(timestamp) else {
        return timestamp.to_string();
    };

    if relative {
        let minutes = (now - time).num_minutes().max(0);
        let hours = minutes / 60;
        if hours < 1 {
            return format!("{}m ago", minutes);
        } else if hours < 24 {
            return format!("{}h ago", hours);
        } else if hours < 168 {
            return format!("{}d ago", hours / 24);
        }
    }

    time.format("%Y-%m-%d").to_string()
}

/// 导出文件名中使用的日期
pub fn date_stamp(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(now: DateTime<Utc>, ago: Duration) -> String {
        (now - ago).to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    #[test]
    fn relative_labels_by_bucket() {
        let now = Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).unwrap();
        assert_eq!(format_timestamp(&at(now, Duration::minutes(5)), now, true), "5m ago");
        assert_eq!(format_timestamp(&at(now, Duration::hours(3)), now, true), "3h ago");
        assert_eq!(format_timestamp(&at(now, Duration::days(2)), now, true), "2d ago");
        assert_eq!(format_timestamp(&at(now, Duration::days(30)), now, true), "2024-04-20");
    }

    #[test]
    fn absolute_format_and_garbage() {
        let now = Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).unwrap();
        assert_eq!(format_timestamp(&at(now, Duration::minutes(5)), now, false), "2024-05-20");
        assert_eq!(format_timestamp("yesterday", now, true), "yesterday");
    }

    #[test]
    fn now_matches_javascript_iso_format() {
        let stamp = now_iso8601();
        assert!(stamp.ends_with('Z'));
        assert_eq!(stamp.len(), "2024-01-01T00:00:00.000Z".len());
        assert!(parse_timestamp(&stamp).is_some());
    }
}
