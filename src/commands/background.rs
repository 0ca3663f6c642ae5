//! # 后台请求路由
//!
//! 常驻的后台上下文，负责：
//! - 首次安装时初始化置顶集合（`pinnedMessages: []`）
//! - 应答 `getPinnedMessages` / `updatePinnedMessages` / `removePinnedMessage` 请求
//! - 监听共享存储上 `pinnedMessages` 的每次变化，
//!   以 `pinnedMessagesUpdated` 推送给所有打开宿主站点的标签
//!
//! 路由直接操作共享存储，不经过回退层：共享存储不可用时，
//! 请求统一以 `{error:"Extension context invalid"}` 应答。

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::models::pinned::parse_collection;
use crate::models::protocol::{Request, Response};
use crate::services::broadcast::{BroadcastHub, Envelope};
use crate::services::pin_set::{PINNED_KEY, read_collection, write_collection};
use crate::services::storage::{StorageBackend, StorageChange};

/// 后台请求路由
pub struct BackgroundRouter {
    store: Arc<dyn StorageBackend>,
    hub: Arc<BroadcastHub>,
}

impl BackgroundRouter {
    /// # 参数
    /// - `store` - 跨上下文共享存储
    /// - `hub` - 广播中心，用于转发集合变更
    pub fn new(store: Arc<dyn StorageBackend>, hub: Arc<BroadcastHub>) -> Self {
        Self { store, hub }
    }

    /// 首次安装初始化
    ///
    /// # 返回值
    /// 本次写入了初始集合时返回 true，集合已存在时返回 false
    pub async fn install(&self) -> Result<bool, String> {
        let existing = self.store.get(&[PINNED_KEY]).await?;
        if existing.contains_key(PINNED_KEY) {
            return Ok(false);
        }
        write_collection(&*self.store, &[]).await?;
        log::info!("首次安装，已初始化空置顶集合");
        Ok(true)
    }

    /// 处理一条请求
    ///
    /// # 返回值
    /// 推送消息返回 None；其余请求返回应答
    pub async fn handle(&self, request: Request) -> Option<Response> {
        let result = match request {
            Request::PinnedMessagesUpdated { .. } => return None,
            Request::GetPinnedMessages => read_collection(&*self.store)
                .await
                .map(|pinned_messages| Response::Pinned { pinned_messages }),
            Request::UpdatePinnedMessages { pinned_messages } => {
                write_collection(&*self.store, &pinned_messages)
                    .await
                    .map(|()| Response::ok())
            }
            Request::RemovePinnedMessage { message_id } => {
                self.remove(&message_id).await.map(|()| Response::ok())
            }
        };

        Some(result.unwrap_or_else(|e| {
            log::error!("后台处理请求失败: {}", e);
            Response::context_invalid()
        }))
    }

    async fn remove(&self, message_id: &str) -> Result<(), String> {
        let mut pins = read_collection(&*self.store).await?;
        pins.retain(|p| p.id != message_id);
        write_collection(&*self.store, &pins).await
    }

    /// 把一次存储变更中的置顶集合转发给宿主标签
    ///
    /// # 返回值
    /// 成功投递的标签数；该次变更不涉及置顶集合时为 0
    pub fn forward_change(&self, change: &StorageChange) -> usize {
        let Some(pinned) = change.get(PINNED_KEY) else {
            return 0;
        };
        let pins = parse_collection(pinned.new_value.as_ref());
        self.hub.publish(&pins, None)
    }

    /// 后台主循环
    ///
    /// 同时处理收件箱中的请求和共享存储的变更通知，直到收到关闭信号、
    /// 收件箱关闭或变更通道关闭。
    pub async fn serve(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let Some(mut changes) = self.store.subscribe() else {
            log::error!("共享存储不支持变更订阅，后台路由无法转发变更");
            return;
        };

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.dispatch(envelope).await;
                }
                change = changes.recv() => match change {
                    Ok(change) => {
                        self.forward_change(&change);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("后台路由落后，丢失 {} 条存储变更通知", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        log::debug!("后台路由已退出");
    }

    async fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Push(request) => {
                self.handle(request).await;
            }
            Envelope::Request { request, reply } => {
                if let Some(response) = self.handle(request).await {
                    // 请求方可能已放弃等待
                    let _ = reply.send(response);
                }
            }
        }
    }
}
