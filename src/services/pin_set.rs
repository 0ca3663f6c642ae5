//! # 置顶集合管理
//!
//! 每个上下文持有一个 `PinSetManager`，它维护该上下文已知的置顶集合（内存缓存），
//! 并通过存储适配层与其他上下文保持一致。
//!
//! ## 同步规则
//! - 任何修改都是对**整个集合**的"先读后写"：先从存储重新读取，再修改，再整体写回
//! - 同一上下文内的修改通过异步互斥锁串行化，不会交错
//! - 跨上下文没有锁，以存储后端最后一次写入为准（最多丢失一次并发编辑，不会损坏数据）
//! - 收到广播的新集合时，整体替换缓存（不做差量合并）
//!
//! ## 写入失败
//! 切换操作是乐观的：写入失败时内存状态仍然反映本次切换，不回滚，
//! 由调用方提示用户保存失败。

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Map;
use tokio::sync::Mutex;

use crate::models::pinned::{PinnedMessage, parse_collection};
use crate::services::identity::MessageSnapshot;
use crate::services::storage::{BackendKind, StorageBackend};
use crate::utils::time::now_iso8601;

/// 置顶集合的持久化键
pub const PINNED_KEY: &str = "pinnedMessages";

/// 从存储读取整个置顶集合
pub async fn read_collection(storage: &dyn StorageBackend) -> Result<Vec<PinnedMessage>, String> {
    let items = storage.get(&[PINNED_KEY]).await?;
    Ok(parse_collection(items.get(PINNED_KEY)))
}

/// 把整个置顶集合写回存储
pub async fn write_collection(
    storage: &dyn StorageBackend,
    pins: &[PinnedMessage],
) -> Result<(), String> {
    let value = serde_json::to_value(pins).map_err(|e| format!("序列化置顶集合失败: {}", e))?;
    let mut items = Map::new();
    items.insert(PINNED_KEY.to_string(), value);
    storage.set(items).await
}

/// 切换后的置顶状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    Pinned,
    Unpinned,
}

/// 一次切换操作的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub state: PinState,
    /// 结果是否已成功持久化
    pub saved: bool,
}

impl ToggleOutcome {
    /// 给用户的提示文本
    pub fn notice(&self) -> &'static str {
        match (self.saved, self.state) {
            (false, _) => "Message updated (save failed)",
            (true, PinState::Pinned) => "Message pinned!",
            (true, PinState::Unpinned) => "Message unpinned",
        }
    }
}

/// 内存缓存及其数据来源
#[derive(Debug, Default)]
struct PinCache {
    items: Vec<PinnedMessage>,
    /// 上一次与哪个后端同步过；`None` 表示尚未加载
    source: Option<BackendKind>,
}

impl PinCache {
    /// 用一次成功读取的结果更新缓存
    ///
    /// 数据来源与上次相同时，存储内容就是权威快照，直接替换；
    /// 来源变化（降级到回退后端）时保留缓存，只补入回退后端中独有的条目。
    ///
    /// # 返回值
    /// 来源发生变化时返回 true，调用方需要把合并结果写入新后端
    fn reconcile(&mut self, stored: Vec<PinnedMessage>, kind: BackendKind) -> bool {
        let switched = self.source.is_some_and(|source| source != kind);
        if switched {
            log::info!("存储后端已切换为 {}，保留内存中的 {} 条置顶", kind, self.items.len());
            for pin in stored {
                if !self.items.iter().any(|p| p.id == pin.id) {
                    self.items.push(pin);
                }
            }
        } else {
            self.items = stored;
        }
        self.source = Some(kind);
        switched
    }
}

/// 置顶集合管理器
pub struct PinSetManager {
    storage: Arc<dyn StorageBackend>,
    cache: Mutex<PinCache>,
}

impl PinSetManager {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            cache: Mutex::new(PinCache::default()),
        }
    }

    /// 从存储加载（或重新加载）置顶集合
    ///
    /// 读取失败时保留现有缓存并记录日志。
    ///
    /// # 返回值
    /// 加载后缓存中的条目数
    pub async fn load(&self) -> usize {
        let mut cache = self.cache.lock().await;
        if let Err(e) = self.sync(&mut cache).await {
            log::warn!("加载置顶集合失败，继续使用内存缓存: {}", e);
        }
        log::debug!("已加载 {} 条置顶消息（{} 存储）", cache.items.len(), self.storage.kind());
        cache.items.len()
    }

    /// 从存储重新读取并与缓存对账；后端切换时把合并结果写入新后端
    async fn sync(&self, cache: &mut PinCache) -> Result<(), String> {
        let stored = read_collection(&*self.storage).await?;
        if cache.reconcile(stored, self.storage.kind()) {
            write_collection(&*self.storage, &cache.items).await?;
        }
        Ok(())
    }

    /// 当前已知的置顶集合（存储顺序）
    pub async fn list(&self) -> Vec<PinnedMessage> {
        self.cache.lock().await.items.clone()
    }

    /// 指定 ID 是否已置顶
    pub async fn is_pinned(&self, id: &str) -> bool {
        self.cache.lock().await.items.iter().any(|p| p.id == id)
    }

    /// 所有已置顶的 ID
    pub async fn pinned_ids(&self) -> HashSet<String> {
        self.cache
            .lock()
            .await
            .items
            .iter()
            .map(|p| p.id.clone())
            .collect()
    }

    /// 切换一条消息的置顶状态
    ///
    /// 已置顶则移除；否则用快照、URL 和当前时间创建新记录追加到集合末尾。
    /// 无论哪种情况都会把整个集合写回存储。
    ///
    /// # 参数
    /// - `id` - 消息 ID
    /// - `snapshot` - 置顶时提取的内容和作者
    /// - `url` - 消息所在页面的 URL
    pub async fn toggle(&self, id: &str, snapshot: &MessageSnapshot, url: &str) -> ToggleOutcome {
        let mut cache = self.cache.lock().await;
        if let Err(e) = self.sync(&mut cache).await {
            log::warn!("读取置顶集合失败，继续使用内存缓存: {}", e);
        }

        let state = match cache.items.iter().position(|p| p.id == id) {
            Some(index) => {
                cache.items.remove(index);
                PinState::Unpinned
            }
            None => {
                cache.items.push(PinnedMessage::new(
                    id,
                    snapshot.content.clone(),
                    snapshot.author.clone(),
                    url,
                    now_iso8601(),
                ));
                PinState::Pinned
            }
        };

        let saved = match write_collection(&*self.storage, &cache.items).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("切换置顶后保存失败: {}", e);
                false
            }
        };

        log::debug!("消息 {} 切换为 {:?}，共 {} 条置顶", id, state, cache.items.len());
        ToggleOutcome { state, saved }
    }

    /// 按 ID 移除置顶消息
    ///
    /// 先重新读取存储中的集合再过滤，避免覆盖其他上下文刚刚追加的条目。
    /// ID 不存在时不写入，直接返回当前集合。
    ///
    /// # 错误
    /// 读取失败，或写回失败（此时缓存已反映移除结果）时返回错误
    pub async fn remove(&self, id: &str) -> Result<Vec<PinnedMessage>, String> {
        let mut cache = self.cache.lock().await;
        self.sync(&mut cache).await?;

        let before = cache.items.len();
        cache.items.retain(|p| p.id != id);
        if cache.items.len() == before {
            return Ok(cache.items.clone());
        }

        write_collection(&*self.storage, &cache.items).await?;
        Ok(cache.items.clone())
    }

    /// 用广播收到的新集合整体替换缓存
    pub async fn apply_snapshot(&self, pins: Vec<PinnedMessage>) {
        let mut cache = self.cache.lock().await;
        cache.items = pins;
        if cache.source.is_none() {
            cache.source = Some(self.storage.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::{
        LocalStore, RuntimeHandle, SharedStore, StorageAdapter, StorageChange, StorageFuture,
    };
    use serde_json::Value;
    use tokio::sync::broadcast;

    fn snapshot(content: &str) -> MessageSnapshot {
        MessageSnapshot {
            content: content.to_string(),
            author: "User".to_string(),
        }
    }

    fn context(shared: &Arc<SharedStore>) -> (Arc<StorageAdapter>, PinSetManager) {
        let adapter = Arc::new(StorageAdapter::new(shared.clone(), Arc::new(LocalStore::new())));
        let manager = PinSetManager::new(adapter.clone());
        (adapter, manager)
    }

    const URL: &str = "https://chatgpt.com/c/abc";

    #[tokio::test]
    async fn toggle_twice_returns_to_empty() {
        let shared = Arc::new(SharedStore::in_memory(RuntimeHandle::new()));
        let (_, pins) = context(&shared);
        pins.load().await;

        let first = pins.toggle("X", &snapshot("Hello world"), URL).await;
        assert_eq!(first.state, PinState::Pinned);
        assert!(first.saved);
        assert_eq!(first.notice(), "Message pinned!");

        let list = pins.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "X");
        assert_eq!(list[0].preview, "Hello world");
        assert_eq!(list[0].url, URL);

        let second = pins.toggle("X", &snapshot("Hello world"), URL).await;
        assert_eq!(second.state, PinState::Unpinned);
        assert!(pins.list().await.is_empty());
        assert!(read_collection(&*shared).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pin_then_unpin_restores_prior_members() {
        let shared = Arc::new(SharedStore::in_memory(RuntimeHandle::new()));
        let (_, pins) = context(&shared);
        pins.toggle("A", &snapshot("a"), URL).await;
        pins.toggle("B", &snapshot("b"), URL).await;
        let before = pins.pinned_ids().await;

        pins.toggle("C", &snapshot("c"), URL).await;
        assert!(pins.is_pinned("C").await);
        pins.toggle("C", &snapshot("c"), URL).await;

        assert_eq!(pins.pinned_ids().await, before);
    }

    #[tokio::test]
    async fn removing_unknown_id_is_a_no_op() {
        let shared = Arc::new(SharedStore::in_memory(RuntimeHandle::new()));
        let (_, pins) = context(&shared);
        pins.toggle("A", &snapshot("a"), URL).await;

        let mut rx = shared.subscribe().unwrap();
        let after = pins.remove("missing").await.unwrap();
        assert_eq!(after.len(), 1);
        assert!(rx.try_recv().is_err(), "no write expected");

        let after = pins.remove("A").await.unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn writers_in_different_contexts_do_not_lose_additions() {
        let shared = Arc::new(SharedStore::in_memory(RuntimeHandle::new()));
        let (_, tab_a) = context(&shared);
        let (_, tab_b) = context(&shared);
        tab_a.load().await;
        tab_b.load().await;

        tab_a.toggle("A", &snapshot("a"), URL).await;
        tab_b.toggle("B", &snapshot("b"), URL).await;

        let ids: HashSet<String> = read_collection(&*shared)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, HashSet::from(["A".to_string(), "B".to_string()]));

        // 另一个上下文删除时也先重新读取
        let remaining = tab_a.remove("B").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "A");
    }

    #[tokio::test]
    async fn runtime_loss_keeps_cache_and_uses_fallback() {
        let runtime = RuntimeHandle::new();
        let shared = Arc::new(SharedStore::in_memory(runtime.clone()));
        let (_, seed) = context(&shared);
        seed.toggle("A", &snapshot("a"), URL).await;

        let (adapter, pins) = context(&shared);
        assert_eq!(pins.load().await, 1);

        runtime.invalidate();
        let outcome = pins.toggle("B", &snapshot("b"), URL).await;
        assert!(outcome.saved);
        assert_eq!(adapter.active_kind(), BackendKind::Local);

        let ids = pins.pinned_ids().await;
        assert!(ids.contains("A") && ids.contains("B"));
        assert_eq!(pins.list().await.len(), 2);
    }

    struct BrokenStore;

    impl StorageBackend for BrokenStore {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        fn is_alive(&self) -> bool {
            true
        }

        fn get<'a>(&'a self, _keys: &'a [&'a str]) -> StorageFuture<'a, Map<String, Value>> {
            Box::pin(async { Err("quota exceeded".to_string()) })
        }

        fn set<'a>(&'a self, _items: Map<String, Value>) -> StorageFuture<'a, ()> {
            Box::pin(async { Err("quota exceeded".to_string()) })
        }

        fn clear(&self) -> StorageFuture<'_, ()> {
            Box::pin(async { Err("quota exceeded".to_string()) })
        }

        fn subscribe(&self) -> Option<broadcast::Receiver<StorageChange>> {
            None
        }
    }

    #[tokio::test]
    async fn failed_save_is_optimistic() {
        let pins = PinSetManager::new(Arc::new(BrokenStore));
        let outcome = pins.toggle("X", &snapshot("x"), URL).await;

        assert_eq!(outcome.state, PinState::Pinned);
        assert!(!outcome.saved);
        assert_eq!(outcome.notice(), "Message updated (save failed)");
        assert!(pins.is_pinned("X").await);
    }
}
