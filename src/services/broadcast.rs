//! # 跨上下文广播
//!
//! 所有上下文（后台路由、宿主页面标签、面板）在启动时向 `BroadcastHub` 注册，
//! 获得一个属于自己的收件箱。上下文之间不共享内存，只通过收件箱交换 `Envelope`。
//!
//! ## 投递语义
//! - 推送（`Envelope::Push`）尽力而为：不可达的上下文（已关闭、收件箱已丢弃）
//!   被静默跳过并从注册表中移除，不重试
//! - 请求（`Envelope::Request`）携带 oneshot 回复通道，接收方处理后回复
//! - 接收方必须把收到的置顶集合当作新的权威快照整体替换，而不是做差量合并
//!
//! 面板通过共享存储的变更订阅得到通知，不经过这里的推送。

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::models::pinned::PinnedMessage;
use crate::models::protocol::{Request, Response};

/// 宿主站点 URL 前缀；只有打开该站点的标签会收到集合变更推送
pub const HOST_SITE_PREFIX: &str = "https://chatgpt.com/";

/// 上下文标识符
pub type ContextId = u64;

/// 上下文种类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextKind {
    /// 后台请求路由
    Background,
    /// 宿主页面中的内容会话
    Tab { url: String },
    /// 弹出面板 / 设置页
    Panel,
}

impl ContextKind {
    /// 是否为打开宿主站点的标签
    pub fn is_host_tab(&self) -> bool {
        matches!(self, ContextKind::Tab { url } if url.starts_with(HOST_SITE_PREFIX))
    }
}

/// 收件箱中的消息
#[derive(Debug)]
pub enum Envelope {
    /// 推送，不需要回复
    Push(Request),
    /// 请求，处理后通过 `reply` 回复
    Request {
        request: Request,
        reply: oneshot::Sender<Response>,
    },
}

struct Registration {
    id: ContextId,
    kind: ContextKind,
    inbox: mpsc::UnboundedSender<Envelope>,
}

/// 上下文注册表与消息分发中心
pub struct BroadcastHub {
    contexts: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            contexts: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 注册上下文，返回其 ID 和收件箱
    pub fn register(&self, kind: ContextKind) -> (ContextId, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("上下文 {} 已注册: {:?}", id, kind);
        if let Ok(mut contexts) = self.contexts.write() {
            contexts.push(Registration {
                id,
                kind,
                inbox: tx,
            });
        }
        (id, rx)
    }

    /// 注销上下文
    pub fn unregister(&self, id: ContextId) {
        if let Ok(mut contexts) = self.contexts.write() {
            contexts.retain(|ctx| ctx.id != id);
        }
    }

    /// 标签导航到新 URL
    pub fn set_url(&self, id: ContextId, url: &str) {
        if let Ok(mut contexts) = self.contexts.write() {
            for ctx in contexts.iter_mut().filter(|ctx| ctx.id == id) {
                if let ContextKind::Tab { url: current } = &mut ctx.kind {
                    *current = url.to_string();
                }
            }
        }
    }

    /// 已注册的上下文数
    pub fn context_count(&self) -> usize {
        self.contexts.read().map(|c| c.len()).unwrap_or(0)
    }

    /// 第一个指定种类的上下文
    pub fn find(&self, kind: &ContextKind) -> Option<ContextId> {
        let contexts = self.contexts.read().ok()?;
        contexts.iter().find(|ctx| &ctx.kind == kind).map(|ctx| ctx.id)
    }

    /// 把新的置顶集合推送给所有打开宿主站点的标签
    ///
    /// # 参数
    /// - `pins` - 新的置顶集合
    /// - `except` - 不需要推送的上下文（通常是写入方自己）
    ///
    /// # 返回值
    /// 成功投递的上下文数
    pub fn publish(&self, pins: &[PinnedMessage], except: Option<ContextId>) -> usize {
        let Ok(mut contexts) = self.contexts.write() else {
            return 0;
        };

        let mut delivered = 0;
        contexts.retain(|ctx| {
            if !ctx.kind.is_host_tab() || Some(ctx.id) == except {
                return true;
            }
            let push = Envelope::Push(Request::PinnedMessagesUpdated {
                pinned_messages: pins.to_vec(),
            });
            match ctx.inbox.send(push) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    log::debug!("上下文 {} 不可达，已移除", ctx.id);
                    false
                }
            }
        });

        log::debug!("置顶集合变更已推送到 {} 个标签", delivered);
        delivered
    }

    /// 向指定上下文发送请求并等待回复
    ///
    /// # 错误
    /// 目标未注册、收件箱已关闭、或接收方未回复就丢弃了请求时返回错误
    pub async fn request(&self, target: ContextId, request: Request) -> Result<Response, String> {
        let (reply, rx) = oneshot::channel();
        let inbox = {
            let contexts = self
                .contexts
                .read()
                .map_err(|e| format!("上下文注册表锁已损坏: {}", e))?;
            contexts
                .iter()
                .find(|ctx| ctx.id == target)
                .map(|ctx| ctx.inbox.clone())
                .ok_or_else(|| format!("上下文 {} 未注册", target))?
        };

        if inbox.send(Envelope::Request { request, reply }).is_err() {
            self.unregister(target);
            return Err(format!("上下文 {} 不可达", target));
        }

        rx.await
            .map_err(|_| format!("上下文 {} 未回复请求", target))
    }
}
