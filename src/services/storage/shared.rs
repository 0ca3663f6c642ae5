//! # 跨上下文共享存储
//!
//! 所有上下文（各个宿主页面、面板、后台路由）共用的键值存储，
//! 对应扩展运行时提供的共享存储区。
//!
//! - 可选地持久化到 JSON 文件（`~/.chatgpt-pinner/storage.json`），
//!   整个键空间序列化为一个带缩进的 JSON 对象
//! - 每次写入产生一条 `StorageChange` 广播，订阅者据此刷新
//! - 每次操作前检查 `RuntimeHandle`；句柄失效后所有操作返回错误

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tokio::sync::{Mutex, broadcast};

use super::{BackendKind, StorageBackend, StorageChange, StorageFuture, ValueChange};
use crate::models::protocol::CONTEXT_INVALID;

/// 变更广播通道容量；落后的订阅者会丢失最旧的通知
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// 扩展运行时句柄
///
/// 扩展被重新加载或卸载时，已注入页面中的旧上下文持有的句柄随之失效。
/// `is_valid` 是一次原子读取，可以在每次读写前调用。
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    valid: Arc<AtomicBool>,
}

impl Default for RuntimeHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeHandle {
    pub fn new() -> Self {
        Self {
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// 使句柄失效（扩展被重新加载）
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// 重新激活句柄
    pub fn restore(&self) {
        self.valid.store(true, Ordering::Release);
    }
}

/// 跨上下文共享存储
pub struct SharedStore {
    /// 全部键值
    data: RwLock<Map<String, Value>>,
    /// 持久化文件路径；为 `None` 时只保存在内存中
    file: Option<PathBuf>,
    runtime: RuntimeHandle,
    changes: broadcast::Sender<StorageChange>,
    /// 串行化"修改内存 + 写文件"，保证文件内容与某一次写入后的状态一致
    write_lock: Mutex<()>,
}

impl SharedStore {
    /// 创建仅存在于内存中的共享存储
    pub fn in_memory(runtime: RuntimeHandle) -> Self {
        Self::with_data(Map::new(), None, runtime)
    }

    /// 打开文件持久化的共享存储
    ///
    /// 文件不存在时以空存储启动，首次写入时创建文件（及父目录）。
    ///
    /// # 错误
    /// 文件存在但无法读取，或内容不是 JSON 对象时返回错误
    pub async fn open(path: &Path, runtime: RuntimeHandle) -> Result<Self, String> {
        let data = if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| format!("读取存储文件失败: {}", e))?;
            match serde_json::from_str::<Value>(&content)
                .map_err(|e| format!("解析存储文件失败: {}", e))?
            {
                Value::Object(map) => map,
                _ => return Err(format!("存储文件 {} 不是 JSON 对象", path.display())),
            }
        } else {
            Map::new()
        };

        log::debug!("打开共享存储 {}，共 {} 个键", path.display(), data.len());
        Ok(Self::with_data(data, Some(path.to_path_buf()), runtime))
    }

    fn with_data(data: Map<String, Value>, file: Option<PathBuf>, runtime: RuntimeHandle) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: RwLock::new(data),
            file,
            runtime,
            changes,
            write_lock: Mutex::new(()),
        }
    }

    /// 本存储绑定的运行时句柄
    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    fn check_runtime(&self) -> Result<(), String> {
        if self.runtime.is_valid() {
            Ok(())
        } else {
            Err(CONTEXT_INVALID.to_string())
        }
    }

    /// 在当前数据的副本上应用修改，返回新数据和变更；内存数据保持不变
    ///
    /// 调用方须持有 `write_lock`，保证暂存到提交之间没有其他写入。
    fn stage<F>(&self, apply: F) -> Result<(Map<String, Value>, StorageChange), String>
    where
        F: FnOnce(&mut Map<String, Value>) -> StorageChange,
    {
        let mut next = self
            .data
            .read()
            .map_err(|e| format!("共享存储锁已损坏: {}", e))?
            .clone();
        let change = apply(&mut next);
        Ok((next, change))
    }

    /// 持久化暂存的新数据，成功后再替换内存数据并通知订阅者
    ///
    /// 写文件失败时内存数据和订阅者都不受影响。
    async fn commit(&self, next: Map<String, Value>, change: StorageChange) -> Result<(), String> {
        if self.file.is_some() && !change.is_empty() {
            self.persist(&next).await?;
        }
        {
            let mut data = self
                .data
                .write()
                .map_err(|e| format!("共享存储锁已损坏: {}", e))?;
            *data = next;
        }
        self.publish(change);
        Ok(())
    }

    async fn persist(&self, snapshot: &Map<String, Value>) -> Result<(), String> {
        let Some(path) = &self.file else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("创建存储目录失败: {}", e))?;
            }
        }

        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| format!("序列化存储内容失败: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| format!("写入存储文件失败: {}", e))
    }

    fn publish(&self, change: StorageChange) {
        if change.is_empty() {
            return;
        }
        // 没有订阅者时发送失败是正常情况
        let _ = self.changes.send(change);
    }
}

impl StorageBackend for SharedStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Shared
    }

    fn is_alive(&self) -> bool {
        self.runtime.is_valid()
    }

    fn get<'a>(&'a self, keys: &'a [&'a str]) -> StorageFuture<'a, Map<String, Value>> {
        Box::pin(async move {
            self.check_runtime()?;
            let data = self
                .data
                .read()
                .map_err(|e| format!("共享存储锁已损坏: {}", e))?;
            Ok(keys
                .iter()
                .filter_map(|key| data.get(*key).map(|v| (key.to_string(), v.clone())))
                .collect())
        })
    }

    fn set<'a>(&'a self, items: Map<String, Value>) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.check_runtime()?;
            let _writer = self.write_lock.lock().await;

            let (next, change) = self.stage(|data| {
                let mut change = StorageChange::default();
                for (key, value) in items {
                    let old_value = data.insert(key.clone(), value.clone());
                    if old_value.as_ref() != Some(&value) {
                        change.changes.insert(
                            key,
                            ValueChange {
                                old_value,
                                new_value: Some(value),
                            },
                        );
                    }
                }
                change
            })?;

            self.commit(next, change).await
        })
    }

    fn clear(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.check_runtime()?;
            let _writer = self.write_lock.lock().await;

            let (next, change) = self.stage(|data| {
                let mut change = StorageChange::default();
                for (key, old) in std::mem::take(data) {
                    change.changes.insert(
                        key,
                        ValueChange {
                            old_value: Some(old),
                            new_value: None,
                        },
                    );
                }
                change
            })?;

            self.commit(next, change).await
        })
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StorageChange>> {
        Some(self.changes.subscribe())
    }
}
