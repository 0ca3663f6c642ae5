//! # 面板会话
//!
//! 弹出面板和设置页共用的上下文：列出置顶消息、删除、导出、修改偏好。
//! 面板不直接接收广播推送，而是订阅共享存储的变更通知；
//! 每条涉及置顶集合的通知都作为新的权威快照整体替换本地视图。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::commands::settings::{
    clear_all_data, load_preferences, reset_preferences, save_preference,
};
use crate::models::pinned::{PinnedMessage, parse_collection};
use crate::models::protocol::{Request, Response};
use crate::models::settings::Preferences;
use crate::services::broadcast::{BroadcastHub, ContextId, ContextKind, Envelope};
use crate::services::export::write_export;
use crate::services::pin_set::{PINNED_KEY, PinSetManager};
use crate::services::storage::{LocalStore, StorageAdapter, StorageBackend, StorageChange};
use crate::utils::time::{format_timestamp, parse_timestamp};

/// 面板上的一张消息卡片
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCard {
    pub id: String,
    pub author: String,
    /// `user` 或 `assistant`
    pub author_class: &'static str,
    pub time_label: String,
    pub preview: String,
    pub content: String,
    pub url: String,
    /// 内容不超过预览长度，无需"展开"
    pub expanded: bool,
}

impl MessageCard {
    fn from_message(message: &PinnedMessage, now: DateTime<Utc>, relative: bool) -> Self {
        Self {
            id: message.id.clone(),
            author: message.author.clone(),
            author_class: message.author_class(),
            time_label: format_timestamp(&message.timestamp, now, relative),
            preview: message.preview.clone(),
            content: message.content.clone(),
            url: message.url.clone(),
            expanded: message.fits_preview(),
        }
    }
}

/// 导出结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    /// 已写入文件
    Written { path: PathBuf, count: usize },
    /// 置顶集合为空，没有写文件
    NothingToExport,
}

/// 面板会话
pub struct PanelSession {
    adapter: Arc<StorageAdapter>,
    pins: PinSetManager,
    hub: Arc<BroadcastHub>,
    context_id: ContextId,
    /// 面板不处理推送，但保持注册期间收件箱有效
    _inbox: mpsc::UnboundedReceiver<Envelope>,
    changes: Option<broadcast::Receiver<StorageChange>>,
    preferences: Preferences,
}

impl PanelSession {
    /// 打开面板：注册上下文、订阅存储变更、加载偏好和置顶集合
    ///
    /// 偏好读取失败时使用默认值，不影响面板打开。
    pub async fn open(shared: Arc<dyn StorageBackend>, hub: Arc<BroadcastHub>) -> Self {
        let adapter = Arc::new(StorageAdapter::new(shared, Arc::new(LocalStore::new())));
        let (context_id, inbox) = hub.register(ContextKind::Panel);
        let changes = adapter.subscribe();

        let preferences = load_preferences(&*adapter).await.unwrap_or_else(|e| {
            log::warn!("读取偏好设置失败，使用默认值: {}", e);
            Preferences::default()
        });
        let pins = PinSetManager::new(adapter.clone());
        let count = pins.load().await;
        log::debug!("面板已打开，共 {} 条置顶消息", count);

        Self {
            adapter,
            pins,
            hub,
            context_id,
            _inbox: inbox,
            changes,
            preferences,
        }
    }

    /// 关闭面板并注销上下文
    pub fn close(self) {
        self.hub.unregister(self.context_id);
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    /// 当前视图中的置顶集合（存储顺序）
    pub async fn messages(&self) -> Vec<PinnedMessage> {
        self.pins.list().await
    }

    /// 按 ID 查找置顶消息（复制内容、打开原页面时使用）
    pub async fn message(&self, id: &str) -> Option<PinnedMessage> {
        self.pins.list().await.into_iter().find(|m| m.id == id)
    }

    /// 按时间倒序生成消息卡片
    ///
    /// 无法解析的时间戳排在最后。
    pub async fn cards(&self, now: DateTime<Utc>) -> Vec<MessageCard> {
        let mut messages = self.pins.list().await;
        messages.sort_by(|a, b| {
            parse_timestamp(&b.timestamp).cmp(&parse_timestamp(&a.timestamp))
        });

        let relative = self.preferences.uses_relative_dates();
        messages
            .iter()
            .map(|m| MessageCard::from_message(m, now, relative))
            .collect()
    }

    /// 删除一条置顶消息
    ///
    /// # 返回值
    /// 删除后的置顶集合；ID 不存在时原样返回
    pub async fn remove(&self, id: &str) -> Result<Vec<PinnedMessage>, String> {
        let remaining = self.pins.remove(id).await?;
        log::info!("已从置顶中移除 {}，剩余 {} 条", id, remaining.len());
        Ok(remaining)
    }

    /// 等待下一次置顶集合变更，并以其为新快照
    ///
    /// 只涉及偏好的变更会顺带刷新偏好，然后继续等待。
    ///
    /// # 错误
    /// 存储不支持变更订阅或通知通道已关闭时返回错误
    pub async fn wait_for_update(&mut self) -> Result<Vec<PinnedMessage>, String> {
        let changes = self
            .changes
            .as_mut()
            .ok_or_else(|| "当前存储不支持变更通知".to_string())?;

        loop {
            match changes.recv().await {
                Ok(change) => {
                    if Preferences::KEYS.iter().any(|key| change.get(key).is_some()) {
                        if let Ok(preferences) = load_preferences(&*self.adapter).await {
                            self.preferences = preferences;
                        }
                    }
                    if let Some(pinned) = change.get(PINNED_KEY) {
                        let pins = parse_collection(pinned.new_value.as_ref());
                        self.pins.apply_snapshot(pins.clone()).await;
                        return Ok(pins);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("面板落后 {} 条变更通知，重新加载", skipped);
                    self.pins.load().await;
                    return Ok(self.pins.list().await);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err("存储变更通道已关闭".to_string());
                }
            }
        }
    }

    /// 向某个标签查询它当前已知的置顶集合
    pub async fn query_tab(&self, tab: ContextId) -> Result<Vec<PinnedMessage>, String> {
        match self.hub.request(tab, Request::GetPinnedMessages).await? {
            Response::Pinned { pinned_messages } => Ok(pinned_messages),
            Response::Error { error } => Err(error),
            Response::Success { .. } => Err("标签返回了意外的应答".to_string()),
        }
    }

    /// 修改单个偏好并立即保存
    pub async fn set_preference(&mut self, key: &str, value: Value) -> Result<(), String> {
        save_preference(&*self.adapter, key, value).await?;
        self.preferences = load_preferences(&*self.adapter).await?;
        Ok(())
    }

    /// 恢复默认偏好
    pub async fn reset_settings(&mut self) -> Result<(), String> {
        self.preferences = reset_preferences(&*self.adapter).await?;
        Ok(())
    }

    /// 清空全部置顶消息和偏好
    pub async fn clear_all_data(&mut self) -> Result<(), String> {
        self.preferences = clear_all_data(&*self.adapter).await?;
        self.pins.apply_snapshot(Vec::new()).await;
        Ok(())
    }

    /// 导出置顶集合
    ///
    /// 导出前重新读取存储，保证文件内容是最新的完整集合。
    ///
    /// # 参数
    /// - `dir` - 导出目录
    /// - `today` - 文件名中使用的日期
    pub async fn export(&self, dir: &Path, today: NaiveDate) -> Result<ExportOutcome, String> {
        self.pins.load().await;
        let pins = self.pins.list().await;
        if pins.is_empty() {
            return Ok(ExportOutcome::NothingToExport);
        }
        let path = write_export(&pins, dir, today).await?;
        Ok(ExportOutcome::Written {
            path,
            count: pins.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SecondsFormat, TimeZone};
    use serde_json::json;

    use crate::services::pin_set::{read_collection, write_collection};
    use crate::services::storage::{RuntimeHandle, SharedStore};

    fn at(now: DateTime<Utc>, ago: Duration) -> String {
        (now - ago).to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn pin(id: &str, author: &str, content: &str, timestamp: String) -> PinnedMessage {
        PinnedMessage::new(id, content, author, "https://chatgpt.com/c/1", timestamp)
    }

    async fn panel_with(pins: &[PinnedMessage]) -> (Arc<SharedStore>, Arc<BroadcastHub>, PanelSession) {
        let shared = Arc::new(SharedStore::in_memory(RuntimeHandle::new()));
        write_collection(&*shared, pins).await.unwrap();
        let hub = Arc::new(BroadcastHub::new());
        let panel = PanelSession::open(shared.clone(), hub.clone()).await;
        (shared, hub, panel)
    }

    #[tokio::test]
    async fn cards_are_newest_first_with_labels() {
        let now = Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).unwrap();
        let long = "x".repeat(150);
        let (_, _, panel) = panel_with(&[
            pin("old", "Assistant", &long, at(now, Duration::days(2))),
            pin("new", "User", "Hello world", at(now, Duration::minutes(5))),
            pin("mid", "Unknown", "Hi", at(now, Duration::hours(3))),
        ])
        .await;

        let cards = panel.cards(now).await;
        let ids: Vec<&str> = cards.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["new", "mid", "old"]);

        assert_eq!(cards[0].time_label, "5m ago");
        assert_eq!(cards[0].author_class, "user");
        assert_eq!(cards[0].preview, "Hello world");
        assert!(cards[0].expanded);

        assert_eq!(cards[1].time_label, "3h ago");
        assert_eq!(cards[1].author_class, "assistant");

        assert_eq!(cards[2].time_label, "2d ago");
        assert!(!cards[2].expanded);
        assert!(cards[2].preview.ends_with("..."));
    }

    #[tokio::test]
    async fn absolute_date_format() {
        let now = Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).unwrap();
        let (_, _, mut panel) =
            panel_with(&[pin("a", "User", "Hi", at(now, Duration::minutes(5)))]).await;

        panel.set_preference("dateFormat", json!("absolute")).await.unwrap();
        assert_eq!(panel.cards(now).await[0].time_label, "2024-05-20");
        assert!(panel.set_preference("dateFormat", json!(3)).await.is_err());
    }

    #[tokio::test]
    async fn update_notification_replaces_view() {
        let (shared, _, mut panel) = panel_with(&[]).await;

        let writer = {
            let shared = shared.clone();
            tokio::spawn(async move {
                let pins = vec![pin("a", "User", "Hi", "2024-01-01T00:00:00.000Z".into())];
                write_collection(&*shared, &pins).await.unwrap();
            })
        };

        let update = panel.wait_for_update().await.unwrap();
        writer.await.unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(panel.messages().await.len(), 1);
        assert!(panel.message("a").await.is_some());
    }

    #[tokio::test]
    async fn remove_export_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();
        let (shared, _, mut panel) = panel_with(&[
            pin("a", "User", "one", "2024-01-01T00:00:00.000Z".into()),
            pin("b", "User", "two", "2024-01-02T00:00:00.000Z".into()),
        ])
        .await;

        assert_eq!(panel.remove("missing").await.unwrap().len(), 2);
        assert_eq!(panel.remove("a").await.unwrap().len(), 1);
        assert_eq!(read_collection(&*shared).await.unwrap().len(), 1);

        match panel.export(dir.path(), today).await.unwrap() {
            ExportOutcome::Written { path, count } => {
                assert_eq!(count, 1);
                assert!(path.ends_with("chatgpt-pinned-messages-2024-05-20.json"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        panel.set_preference("darkMode", json!(true)).await.unwrap();
        panel.clear_all_data().await.unwrap();
        assert_eq!(panel.preferences(), &Preferences::default());
        assert!(panel.messages().await.is_empty());
        assert_eq!(
            panel.export(dir.path(), today).await.unwrap(),
            ExportOutcome::NothingToExport
        );
    }

    #[tokio::test]
    async fn reset_restores_defaults() {
        let (shared, hub, mut panel) = panel_with(&[]).await;
        panel.set_preference("previewLength", json!(200)).await.unwrap();
        assert_eq!(panel.preferences().preview_length, 200);

        panel.reset_settings().await.unwrap();
        assert_eq!(panel.preferences(), &Preferences::default());
        assert_eq!(
            shared.get(&["previewLength"]).await.unwrap()["previewLength"],
            json!(100)
        );

        assert_eq!(hub.context_count(), 1);
        panel.close();
        assert_eq!(hub.context_count(), 0);
    }
}
