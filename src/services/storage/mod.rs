//! # 存储适配层
//!
//! 为所有上下文提供统一的键值持久化接口：`get` / `set` / `clear` / `subscribe`。
//!
//! ## 后端
//! | 后端 | 可见范围 | 变更通知 |
//! |------|----------|----------|
//! | `SharedStore` | 所有上下文（跨页面、面板、后台） | 支持 |
//! | `LocalStore` | 仅当前文档 | 不支持 |
//!
//! ## 选择策略
//! `StorageAdapter` 优先使用共享后端。出现以下任一情况即切换到本地后端，
//! 并在本会话剩余时间内保持（不会自动切回）：
//! - 每次读写前的存活探测失败（运行时句柄失效）
//! - 共享后端的任一操作返回错误
//! - 周期性存活检查（`check_liveness`）发现句柄失效
//!
//! ## 并发
//! 后端不保证同一上下文内先后发出的写入按顺序完成；
//! 修改集合类数据时必须"先读后写"整个值，跨上下文以最后一次写入为准。

pub mod local;
pub mod shared;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

pub use local::LocalStore;
pub use shared::{RuntimeHandle, SharedStore};

/// 存储操作返回的 future 类型
///
/// 与 trait object 配合使用，因此显式装箱。
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send + 'a>>;

/// 后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    /// 跨上下文共享存储
    Shared,
    /// 仅当前文档可见的本地回退存储
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Shared => write!(f, "shared"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

/// 单个键的变化
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub old_value: Option<Value>,
    /// 为 `None` 表示键被删除（如 `clear`）
    pub new_value: Option<Value>,
}

/// 一次写操作产生的全部变化
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageChange {
    pub changes: BTreeMap<String, ValueChange>,
}

impl StorageChange {
    pub fn get(&self, key: &str) -> Option<&ValueChange> {
        self.changes.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// 键值存储后端
pub trait StorageBackend: Send + Sync {
    /// 后端种类
    fn kind(&self) -> BackendKind;

    /// 廉价的同步存活探测
    fn is_alive(&self) -> bool;

    /// 读取指定键；不存在的键不出现在结果中
    fn get<'a>(&'a self, keys: &'a [&'a str]) -> StorageFuture<'a, Map<String, Value>>;

    /// 写入一组键值
    fn set<'a>(&'a self, items: Map<String, Value>) -> StorageFuture<'a, ()>;

    /// 清空本后端的全部键
    fn clear(&self) -> StorageFuture<'_, ()>;

    /// 订阅变更通知；不支持通知的后端返回 `None`
    fn subscribe(&self) -> Option<broadcast::Receiver<StorageChange>>;
}

/// 带回退策略的存储适配器
///
/// 每个上下文持有自己的实例，降级状态不在上下文之间共享。
pub struct StorageAdapter {
    primary: Arc<dyn StorageBackend>,
    fallback: Arc<dyn StorageBackend>,
    degraded: AtomicBool,
}

impl StorageAdapter {
    /// 创建适配器
    ///
    /// # 参数
    /// - `primary` - 首选后端（通常是跨上下文共享存储）
    /// - `fallback` - 回退后端（通常是文档本地存储）
    pub fn new(primary: Arc<dyn StorageBackend>, fallback: Arc<dyn StorageBackend>) -> Self {
        Self {
            primary,
            fallback,
            degraded: AtomicBool::new(false),
        }
    }

    /// 当前实际使用的后端
    pub fn active_kind(&self) -> BackendKind {
        if self.is_degraded() {
            self.fallback.kind()
        } else {
            self.primary.kind()
        }
    }

    /// 是否已降级到回退后端
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// 周期性存活检查
    ///
    /// # 返回值
    /// 本次检查导致降级时返回 true
    pub fn check_liveness(&self) -> bool {
        if self.is_degraded() || self.primary.is_alive() {
            return false;
        }
        self.demote("运行时句柄已失效");
        true
    }

    fn demote(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            log::warn!(
                "{} 存储不可用（{}），本会话切换到 {} 存储",
                self.primary.kind(),
                reason,
                self.fallback.kind()
            );
        }
    }

    /// 读写前的存活探测：返回本次是否应使用首选后端
    fn use_primary(&self) -> bool {
        if self.is_degraded() {
            return false;
        }
        if !self.primary.is_alive() {
            self.demote("存活探测失败");
            return false;
        }
        true
    }
}

impl StorageBackend for StorageAdapter {
    fn kind(&self) -> BackendKind {
        self.active_kind()
    }

    fn is_alive(&self) -> bool {
        (!self.is_degraded() && self.primary.is_alive()) || self.fallback.is_alive()
    }

    fn get<'a>(&'a self, keys: &'a [&'a str]) -> StorageFuture<'a, Map<String, Value>> {
        Box::pin(async move {
            if self.use_primary() {
                match self.primary.get(keys).await {
                    Ok(items) => return Ok(items),
                    Err(e) => self.demote(&e),
                }
            }
            self.fallback.get(keys).await
        })
    }

    fn set<'a>(&'a self, items: Map<String, Value>) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            if self.use_primary() {
                match self.primary.set(items.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => self.demote(&e),
                }
            }
            self.fallback.set(items).await
        })
    }

    fn clear(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            if self.use_primary() {
                match self.primary.clear().await {
                    Ok(()) => return Ok(()),
                    Err(e) => self.demote(&e),
                }
            }
            self.fallback.clear().await
        })
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StorageChange>> {
        if self.is_degraded() {
            self.fallback.subscribe()
        } else {
            self.primary.subscribe()
        }
    }
}
